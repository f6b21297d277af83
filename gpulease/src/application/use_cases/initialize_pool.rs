// /////////////////////////////////////////////////////////////////////////////
// GPU Lease Coordinator
// Copyright (c) 2025 Michael Gardner, A Bit of Help, Inc.
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! # Initialize Pool
//!
//! Establishes the pool: slot count, vendor provider, and a clean slate of
//! slots. Re-initializing an existing pool requires `--force` because it
//! discards every live reservation and queue entry. The provider is chosen
//! here exactly once — by override or by probing vendor tooling — and every
//! later operation reads it back from the store.

use std::sync::Arc;
use tracing::warn;

use gpulease_domain::{DeviceInspector, GpuProvider, LeaseError, LeaseStore};

use crate::infrastructure::adapters;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InitOutcome {
    pub device_count: u32,
    pub provider: GpuProvider,
    pub reinitialized: bool,
}

pub async fn initialize_pool(
    store: Arc<dyn LeaseStore>,
    device_count: u32,
    force: bool,
    provider_override: Option<GpuProvider>,
) -> Result<InitOutcome, LeaseError> {
    if device_count == 0 {
        return Err(LeaseError::ValidationError(
            "the pool needs at least one device".to_string(),
        ));
    }

    let existing = store.pool_size().await?;
    if let Some(current) = existing {
        if !force {
            return Err(LeaseError::ValidationError(format!(
                "pool is already initialized with {current} device(s); pass --force to re-initialize \
                 (this discards all current reservations)"
            )));
        }
    }

    let provider = match provider_override {
        Some(provider) => provider,
        None => adapters::detect_provider().await,
    };

    // Cross-check the requested size against what the tooling can see.
    if provider != GpuProvider::Fake {
        if let Ok(detected) = adapters::inspector_for(provider).detect_device_count().await {
            if detected != device_count {
                warn!(
                    "initializing pool with {device_count} device(s) but {provider} tooling reports {detected}"
                );
            }
        }
    }

    store.initialize_pool(device_count, provider).await?;
    Ok(InitOutcome {
        device_count,
        provider,
        reinitialized: existing.is_some(),
    })
}
