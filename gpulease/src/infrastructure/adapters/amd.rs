// /////////////////////////////////////////////////////////////////////////////
// GPU Lease Coordinator
// Copyright (c) 2025 Michael Gardner, A Bit of Help, Inc.
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! # AMD Inspector
//!
//! Drives `rocm-smi` in JSON mode:
//!
//! - `--showmeminfo vram --json` for per-device VRAM in use (reported in
//!   bytes under `"card<N>"` objects)
//! - `--showpidgpus --json` for the PID-to-device mapping
//!
//! rocm-smi's JSON shape has drifted across ROCm releases, so parsing is
//! deliberately tolerant: unknown keys are ignored and a malformed process
//! section degrades to an empty process list rather than failing the
//! snapshot.

use async_trait::async_trait;
use serde_json::Value;

use gpulease_domain::{DeviceInspector, DeviceUsage, GpuProcess, GpuProvider, LeaseError};

use crate::infrastructure::adapters::process_owner;

pub struct AmdInspector {
    binary: String,
}

impl AmdInspector {
    pub fn new() -> Self {
        AmdInspector {
            binary: "rocm-smi".to_string(),
        }
    }

    async fn run_json(&self, args: &[&str]) -> Result<Value, LeaseError> {
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
        serde_json::from_slice(&output.stdout)
            .map_err(|e| LeaseError::InspectionFailed(format!("{} produced invalid JSON: {e}", self.binary)))
    }
}

impl Default for AmdInspector {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DeviceInspector for AmdInspector {
    fn provider(&self) -> GpuProvider {
        GpuProvider::Amd
    }

    async fn detect_device_count(&self) -> Result<u32, LeaseError> {
        let meminfo = self.run_json(&["--showmeminfo", "vram", "--json"]).await?;
        Ok(parse_vram_usage(&meminfo).len() as u32)
    }

    async fn snapshot(&self) -> Result<Vec<DeviceUsage>, LeaseError> {
        let meminfo = self.run_json(&["--showmeminfo", "vram", "--json"]).await?;
        let mut devices: Vec<DeviceUsage> = parse_vram_usage(&meminfo)
            .into_iter()
            .map(|(index, memory_used_mb)| DeviceUsage {
                index,
                memory_used_mb,
                processes: Vec::new(),
            })
            .collect();

        // The process map is an enrichment; its absence is not an error.
        if let Ok(pids) = self.run_json(&["--showpidgpus", "--json"]).await {
            for (pid, device_indices) in parse_pid_devices(&pids) {
                let owner = process_owner::resolve(pid).await;
                for index in device_indices {
                    if let Some(device) = devices.iter_mut().find(|d| d.index == index) {
                        device.processes.push(GpuProcess {
                            pid,
                            owner: owner.clone(),
                            command: None,
                        });
                    }
                }
            }
        }

        Ok(devices)
    }
}

/// Extracts `(index, used MiB)` pairs from `--showmeminfo vram --json`
/// output: `{"card0": {"VRAM Total Used Memory (B)": "123456", ...}, ...}`.
fn parse_vram_usage(meminfo: &Value) -> Vec<(u32, u64)> {
    let Some(cards) = meminfo.as_object() else {
        return Vec::new();
    };
    let mut usage: Vec<(u32, u64)> = cards
        .iter()
        .filter_map(|(key, fields)| {
            let index: u32 = key.strip_prefix("card")?.parse().ok()?;
            let used_bytes = fields.as_object()?.iter().find_map(|(name, value)| {
                name.contains("Used Memory").then(|| as_u64(value))?
            })?;
            Some((index, used_bytes / (1024 * 1024)))
        })
        .collect();
    usage.sort_by_key(|(index, _)| *index);
    usage
}

/// Extracts `pid -> device indices` from `--showpidgpus --json` output:
/// `{"system": {"PID 4242": "0 1", ...}}` (shape varies by release).
fn parse_pid_devices(pids: &Value) -> Vec<(u32, Vec<u32>)> {
    let mut mappings = Vec::new();
    let Some(sections) = pids.as_object() else {
        return mappings;
    };
    for section in sections.values() {
        let Some(entries) = section.as_object() else { continue };
        for (key, value) in entries {
            let Some(pid) = key.strip_prefix("PID ").and_then(|raw| raw.trim().parse::<u32>().ok()) else {
                continue;
            };
            let devices: Vec<u32> = match value {
                Value::String(text) => text.split_whitespace().filter_map(|part| part.parse().ok()).collect(),
                Value::Array(parts) => parts.iter().filter_map(as_u32).collect(),
                _ => Vec::new(),
            };
            mappings.push((pid, devices));
        }
    }
    mappings
}

fn as_u64(value: &Value) -> Option<u64> {
    match value {
        Value::Number(number) => number.as_u64(),
        Value::String(text) => text.trim().parse().ok(),
        _ => None,
    }
}

fn as_u32(value: &Value) -> Option<u32> {
    as_u64(value).map(|v| v as u32)
}
