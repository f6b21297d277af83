// /////////////////////////////////////////////////////////////////////////////
// GPU Lease Coordinator
// Copyright (c) 2025 Michael Gardner, A Bit of Help, Inc.
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! Vendor device inspectors and supporting host adapters. Each vendor's
//! tooling is isolated to its own module; the rest of the system only sees
//! the domain `DeviceInspector` trait.

pub mod amd;
pub mod fake;
pub mod nvidia;
pub mod process_owner;

use std::sync::Arc;

use gpulease_domain::{DeviceInspector, GpuProvider};

pub use amd::AmdInspector;
pub use fake::FakeInspector;
pub use nvidia::NvidiaInspector;

/// Inspector for the provider recorded in the store.
pub fn inspector_for(provider: GpuProvider) -> Arc<dyn DeviceInspector> {
    match provider {
        GpuProvider::Nvidia => Arc::new(NvidiaInspector::new()),
        GpuProvider::Amd => Arc::new(AmdInspector::new()),
        GpuProvider::Fake => Arc::new(FakeInspector::empty(0)),
    }
}

/// Probes vendor tooling to pick a provider at pool initialization.
/// NVIDIA is probed first (the legacy default), then AMD; a host with
/// neither gets the fake provider so development machines still work.
pub async fn detect_provider() -> GpuProvider {
    if NvidiaInspector::new().detect_device_count().await.is_ok() {
        return GpuProvider::Nvidia;
    }
    if AmdInspector::new().detect_device_count().await.is_ok() {
        return GpuProvider::Amd;
    }
    tracing::warn!("no vendor GPU tooling found; falling back to the fake provider");
    GpuProvider::Fake
}
