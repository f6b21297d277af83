// /////////////////////////////////////////////////////////////////////////////
// GPU Lease Coordinator
// Copyright (c) 2025 Michael Gardner, A Bit of Help, Inc.
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! # Device Inspector Port
//!
//! Vendor-neutral capability set over the host's accelerators: enumerate
//! devices, report per-device memory-in-use, report per-device processes
//! with resolved owners. Concrete implementations live in the
//! infrastructure layer (NVIDIA, AMD, and a fake for tests and GPU-less
//! development); the rest of the system only sees this trait.
//!
//! The vendor family is chosen once at pool initialization, cached in the
//! store, and read back by every subsequent operation; one family per host.
//!
//! ## Out-of-band detection
//!
//! A device is "in out-of-band use" when its memory-in-use **strictly
//! exceeds** a configurable threshold (default 1024 MiB). Idle GPUs often
//! retain a small residual allocation; the strict-greater comparison makes
//! the default threshold behave as "≥ 1 GiB means active". Usage exactly at
//! the threshold is therefore NOT out-of-band.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use crate::error::LeaseError;

/// The vendor family whose tooling inspects this host's devices.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GpuProvider {
    Nvidia,
    Amd,
    /// Reports a configurable fleet; used in tests and on GPU-less hosts.
    Fake,
}

impl fmt::Display for GpuProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GpuProvider::Nvidia => f.write_str("nvidia"),
            GpuProvider::Amd => f.write_str("amd"),
            GpuProvider::Fake => f.write_str("fake"),
        }
    }
}

impl FromStr for GpuProvider {
    type Err = LeaseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "nvidia" => Ok(GpuProvider::Nvidia),
            "amd" => Ok(GpuProvider::Amd),
            "fake" => Ok(GpuProvider::Fake),
            other => Err(LeaseError::ValidationError(format!(
                "unknown GPU provider '{other}' (expected 'nvidia', 'amd' or 'fake')"
            ))),
        }
    }
}

/// One process observed on a device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GpuProcess {
    pub pid: u32,
    /// Resolved process owner; `"unknown"` when resolution failed.
    pub owner: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
}

impl GpuProcess {
    pub const UNKNOWN_OWNER: &'static str = "unknown";
}

/// Observed usage of one device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceUsage {
    pub index: u32,
    pub memory_used_mb: u64,
    #[serde(default)]
    pub processes: Vec<GpuProcess>,
}

impl DeviceUsage {
    /// Strict-greater threshold comparison; see the module docs.
    pub fn exceeds_threshold(&self, threshold_mb: u64) -> bool {
        self.memory_used_mb > threshold_mb
    }

    /// Distinct owners of the processes on this device.
    pub fn owners(&self) -> BTreeSet<String> {
        self.processes.iter().map(|p| p.owner.clone()).collect()
    }
}

/// The vendor capability set; see the module docs.
#[async_trait]
pub trait DeviceInspector: Send + Sync {
    /// Which vendor family this inspector drives.
    fn provider(&self) -> GpuProvider;

    /// Number of devices the vendor tooling can see on this host.
    async fn detect_device_count(&self) -> Result<u32, LeaseError>;

    /// Current per-device usage, ordered by device index.
    async fn snapshot(&self) -> Result<Vec<DeviceUsage>, LeaseError>;
}

/// Device indices whose memory use puts them out of band, given a snapshot.
pub fn out_of_band_devices(snapshot: &[DeviceUsage], threshold_mb: u64) -> Vec<u32> {
    snapshot
        .iter()
        .filter(|usage| usage.exceeds_threshold(threshold_mb))
        .map(|usage| usage.index)
        .collect()
}
