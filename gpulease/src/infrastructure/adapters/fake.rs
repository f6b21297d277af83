// /////////////////////////////////////////////////////////////////////////////
// GPU Lease Coordinator
// Copyright (c) 2025 Michael Gardner, A Bit of Help, Inc.
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! # Fake Inspector
//!
//! Reports a configurable fleet without touching any vendor tooling. Used
//! by the test suite and on GPU-less development hosts, where the pool
//! still needs to initialize and allocate even though no silicon exists.
//! The default configuration is an empty fleet: every device reports zero
//! memory in use and no processes.

use async_trait::async_trait;
use std::sync::Mutex;

use gpulease_domain::{DeviceInspector, DeviceUsage, GpuProcess, GpuProvider, LeaseError};

pub struct FakeInspector {
    device_count: u32,
    usages: Mutex<Vec<DeviceUsage>>,
}

impl FakeInspector {
    /// A fleet of `device_count` idle devices.
    pub fn empty(device_count: u32) -> Self {
        let usages = (0..device_count)
            .map(|index| DeviceUsage {
                index,
                memory_used_mb: 0,
                processes: Vec::new(),
            })
            .collect();
        FakeInspector {
            device_count,
            usages: Mutex::new(usages),
        }
    }

    /// Test hook: set one device's memory-in-use.
    pub fn set_memory_used(&self, index: u32, memory_used_mb: u64) {
        let mut usages = self.usages.lock().unwrap();
        if let Some(usage) = usages.iter_mut().find(|u| u.index == index) {
            usage.memory_used_mb = memory_used_mb;
        }
    }

    /// Test hook: attach a process to one device.
    pub fn add_process(&self, index: u32, pid: u32, owner: &str) {
        let mut usages = self.usages.lock().unwrap();
        if let Some(usage) = usages.iter_mut().find(|u| u.index == index) {
            usage.processes.push(GpuProcess {
                pid,
                owner: owner.to_string(),
                command: None,
            });
        }
    }
}

#[async_trait]
impl DeviceInspector for FakeInspector {
    fn provider(&self) -> GpuProvider {
        GpuProvider::Fake
    }

    async fn detect_device_count(&self) -> Result<u32, LeaseError> {
        Ok(self.device_count)
    }

    async fn snapshot(&self) -> Result<Vec<DeviceUsage>, LeaseError> {
        Ok(self.usages.lock().unwrap().clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_empty_fleet() {
        let inspector = FakeInspector::empty(3);
        assert_eq!(inspector.detect_device_count().await.unwrap(), 3);
        let snapshot = inspector.snapshot().await.unwrap();
        assert_eq!(snapshot.len(), 3);
        assert!(snapshot.iter().all(|usage| usage.memory_used_mb == 0));
    }

    #[tokio::test]
    async fn test_configured_usage() {
        let inspector = FakeInspector::empty(2);
        inspector.set_memory_used(1, 2048);
        inspector.add_process(1, 4242, "bob");

        let snapshot = inspector.snapshot().await.unwrap();
        assert_eq!(snapshot[1].memory_used_mb, 2048);
        assert_eq!(snapshot[1].processes[0].owner, "bob");
        assert!(snapshot[1].exceeds_threshold(1024));
        assert!(!snapshot[0].exceeds_threshold(1024));
    }
}
