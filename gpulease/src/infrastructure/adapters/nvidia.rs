// /////////////////////////////////////////////////////////////////////////////
// GPU Lease Coordinator
// Copyright (c) 2025 Michael Gardner, A Bit of Help, Inc.
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! # NVIDIA Inspector
//!
//! Drives `nvidia-smi` in its machine-readable CSV mode:
//!
//! - `--query-gpu=index,uuid,memory.used` for the per-device memory picture
//! - `--query-compute-apps=gpu_uuid,pid,process_name,used_memory` for the
//!   process list, joined back to devices by GPU UUID
//!
//! Process owners are resolved through the host process table; `nvidia-smi`
//! itself does not report them.

use async_trait::async_trait;
use std::collections::HashMap;

use gpulease_domain::{DeviceInspector, DeviceUsage, GpuProcess, GpuProvider, LeaseError};

use crate::infrastructure::adapters::process_owner;

pub struct NvidiaInspector {
    binary: String,
}

impl NvidiaInspector {
    pub fn new() -> Self {
        NvidiaInspector {
            binary: "nvidia-smi".to_string(),
        }
    }

    async fn run_query(&self, args: &[&str]) -> Result<String, LeaseError> {
        let output = tokio::process::Command::new(&self.binary)
            .args(args)
            .output()
            .await
            .map_err(|e| LeaseError::InspectionFailed(format!("cannot execute {}: {e}", self.binary)))?;
        if !output.status.success() {
            return Err(LeaseError::InspectionFailed(format!(
                "{} exited with {}: {}",
                self.binary,
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

impl Default for NvidiaInspector {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DeviceInspector for NvidiaInspector {
    fn provider(&self) -> GpuProvider {
        GpuProvider::Nvidia
    }

    async fn detect_device_count(&self) -> Result<u32, LeaseError> {
        let csv = self
            .run_query(&["--query-gpu=index", "--format=csv,noheader"])
            .await?;
        Ok(csv.lines().filter(|line| !line.trim().is_empty()).count() as u32)
    }

    async fn snapshot(&self) -> Result<Vec<DeviceUsage>, LeaseError> {
        let device_csv = self
            .run_query(&["--query-gpu=index,uuid,memory.used", "--format=csv,noheader,nounits"])
            .await?;
        let mut devices = parse_device_csv(&device_csv)?;

        let apps_csv = self
            .run_query(&[
                "--query-compute-apps=gpu_uuid,pid,process_name,used_memory",
                "--format=csv,noheader,nounits",
            ])
            .await?;

        for (uuid, pid, command) in parse_compute_apps_csv(&apps_csv) {
            if let Some(device) = devices.iter_mut().find(|(device_uuid, _)| *device_uuid == uuid) {
                let owner = process_owner::resolve(pid).await;
                device.1.processes.push(GpuProcess { pid, owner, command });
            }
        }

        Ok(devices.into_iter().map(|(_, usage)| usage).collect())
    }
}

/// Parses `index, uuid, memory.used` CSV rows into per-device usage keyed
/// by UUID for the process join.
fn parse_device_csv(csv: &str) -> Result<Vec<(String, DeviceUsage)>, LeaseError> {
    let mut devices = Vec::new();
    for line in csv.lines().filter(|line| !line.trim().is_empty()) {
        let fields: Vec<&str> = line.split(',').map(str::trim).collect();
        let [index, uuid, memory_used] = fields.as_slice() else {
            return Err(LeaseError::InspectionFailed(format!(
                "unexpected nvidia-smi device row: '{line}'"
            )));
        };
        let index: u32 = index
            .parse()
            .map_err(|_| LeaseError::InspectionFailed(format!("bad device index '{index}'")))?;
        let memory_used_mb: u64 = memory_used
            .parse()
            .map_err(|_| LeaseError::InspectionFailed(format!("bad memory figure '{memory_used}'")))?;
        devices.push((
            uuid.to_string(),
            DeviceUsage {
                index,
                memory_used_mb,
                processes: Vec::new(),
            },
        ));
    }
    devices.sort_by_key(|(_, usage)| usage.index);
    Ok(devices)
}

/// Parses `gpu_uuid, pid, process_name, used_memory` rows. Rows that do not
/// parse are skipped: the process list is an enrichment, not ground truth.
fn parse_compute_apps_csv(csv: &str) -> Vec<(String, u32, Option<String>)> {
    csv.lines()
        .filter(|line| !line.trim().is_empty())
        .filter_map(|line| {
            let fields: Vec<&str> = line.split(',').map(str::trim).collect();
            if fields.len() < 3 {
                return None;
            }
            let pid: u32 = fields[1].parse().ok()?;
            let command = (!fields[2].is_empty()).then(|| fields[2].to_string());
            Some((fields[0].to_string(), pid, command))
        })
        .collect()
}
