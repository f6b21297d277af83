// /////////////////////////////////////////////////////////////////////////////
// GPU Lease Coordinator
// Copyright (c) 2025 Michael Gardner, A Bit of Help, Inc.
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! # Release
//!
//! `gpulease release`: without arguments, releases every manual lease the
//! caller holds; with `--device-ids`, releases exactly those slots of the
//! caller's (either lease kind). Every release writes a usage record.

use std::sync::Arc;

use gpulease_domain::{LeaseError, Owner};

use crate::application::services::AllocationEngine;

pub async fn release_devices(
    engine: Arc<AllocationEngine>,
    owner: &Owner,
    device_ids: Option<Vec<u32>>,
) -> Result<Vec<u32>, LeaseError> {
    match device_ids {
        Some(ids) => engine.release_devices(owner, &ids).await,
        None => engine.release_all_manual(owner).await,
    }
}
