// /////////////////////////////////////////////////////////////////////////////
// GPU Lease Coordinator
// Copyright (c) 2025 Michael Gardner, A Bit of Help, Inc.
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! # Allocation Request
//!
//! The caller-supplied description of what they want from the pool: an
//! identity, a lease kind, and either a device count or an explicit set of
//! device IDs. Manual requests additionally carry a duration.
//!
//! ## Validation
//!
//! Requests are validated once at construction time via
//! [`AllocationRequest::validate`] and treated as trusted after that:
//!
//! - count ≥ 1
//! - explicit IDs unique and non-empty
//! - manual requests carry a positive duration; run requests carry none
//!
//! The "both count and set" form is resolved at the CLI edge: it is accepted
//! only when the count equals the set size and collapses to the set form
//! before a request is built.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;

use crate::error::LeaseError;
use crate::value_objects::lease_kind::LeaseKind;
use crate::value_objects::owner::Owner;

/// What the caller is asking for: a number of devices chosen by the
/// selection policy, or an explicit set of device IDs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AllocationTarget {
    /// Reserve this many devices, selected by policy.
    Count(u32),
    /// Reserve exactly these devices.
    Devices(Vec<u32>),
}

impl AllocationTarget {
    /// Number of devices this target requires.
    pub fn requested_count(&self) -> u32 {
        match self {
            AllocationTarget::Count(n) => *n,
            AllocationTarget::Devices(ids) => ids.len() as u32,
        }
    }
}

/// A validated request for devices from the pool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllocationRequest {
    pub owner: Owner,
    pub kind: LeaseKind,
    pub target: AllocationTarget,
    /// Lease duration in seconds; present iff `kind` is manual.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_secs: Option<u64>,
    /// Free-form note attached to the reservation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

impl AllocationRequest {
    /// Builds a run-kind request (no duration; lifetime is heartbeat-bound).
    pub fn run(owner: Owner, target: AllocationTarget, note: Option<String>) -> Result<Self, LeaseError> {
        let request = AllocationRequest {
            owner,
            kind: LeaseKind::Run,
            target,
            duration_secs: None,
            note,
        };
        request.validate()?;
        Ok(request)
    }

    /// Builds a manual-kind request with an explicit duration.
    pub fn manual(
        owner: Owner,
        target: AllocationTarget,
        duration_secs: u64,
        note: Option<String>,
    ) -> Result<Self, LeaseError> {
        let request = AllocationRequest {
            owner,
            kind: LeaseKind::Manual,
            target,
            duration_secs: Some(duration_secs),
            note,
        };
        request.validate()?;
        Ok(request)
    }

    pub fn requested_count(&self) -> u32 {
        self.target.requested_count()
    }

    /// Checks every request invariant; returns the first violation found.
    pub fn validate(&self) -> Result<(), LeaseError> {
        match &self.target {
            AllocationTarget::Count(0) => {
                return Err(LeaseError::ValidationError(
                    "requested device count must be at least 1".to_string(),
                ));
            }
            AllocationTarget::Count(_) => {}
            AllocationTarget::Devices(ids) => {
                if ids.is_empty() {
                    return Err(LeaseError::ValidationError(
                        "requested device list must not be empty".to_string(),
                    ));
                }
                let mut seen = HashSet::new();
                for id in ids {
                    if !seen.insert(*id) {
                        return Err(LeaseError::ValidationError(format!(
                            "device {id} requested more than once"
                        )));
                    }
                }
            }
        }

        match (self.kind, self.duration_secs) {
            (LeaseKind::Manual, None) => Err(LeaseError::ValidationError(
                "manual reservations require a duration".to_string(),
            )),
            (LeaseKind::Manual, Some(0)) => Err(LeaseError::ValidationError(
                "reservation duration must be positive".to_string(),
            )),
            (LeaseKind::Run, Some(_)) => Err(LeaseError::ValidationError(
                "run allocations take their lifetime from the wrapped command, not a duration".to_string(),
            )),
            _ => Ok(()),
        }
    }
}
