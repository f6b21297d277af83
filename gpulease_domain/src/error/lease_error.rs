// /////////////////////////////////////////////////////////////////////////////
// GPU Lease Coordinator
// Copyright (c) 2025 Michael Gardner, A Bit of Help, Inc.
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! # Domain Error System
//!
//! A single, flat error enum for the lease coordination domain. Every failure
//! that crosses a layer boundary is one of these variants, so callers can
//! match on the kind without downcasting and the CLI can map kinds to exit
//! codes in one place.
//!
//! ## Categories
//!
//! - **Pool state**: [`LeaseError::PoolNotInitialized`],
//!   [`LeaseError::StoreCorrupt`]
//! - **Allocation**: [`LeaseError::CapacityExhausted`],
//!   [`LeaseError::OutOfRange`], [`LeaseError::DeviceConflict`],
//!   [`LeaseError::UnauthorizedUsage`], [`LeaseError::LockUnavailable`]
//! - **Waiting**: [`LeaseError::WaitCancelled`], [`LeaseError::WaitTimeout`]
//! - **Lease lifetime**: [`LeaseError::ReservationLost`]
//! - **Environment**: [`LeaseError::StoreError`],
//!   [`LeaseError::InspectionFailed`]
//! - **Programming/input**: [`LeaseError::ValidationError`],
//!   [`LeaseError::SerializationError`], [`LeaseError::Internal`]
//!
//! ## Propagation policy
//!
//! Variants carry messages precise enough to act on: capacity errors
//! quantify availability, device conflicts name the slot and the reason.
//! Errors are `Clone` so they can be logged and surfaced without losing the
//! original.

use thiserror::Error;

/// Domain-specific errors for the GPU lease coordination system.
///
/// Each variant represents a specific failure mode with enough context for
/// the caller to act: retry, re-run initialization, pick different devices,
/// or give up.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LeaseError {
    /// The pool-size key is missing from the store. Surfaced with the
    /// remedy because this is the first error every new host sees.
    #[error("GPU pool is not initialized - run 'gpulease init --count <N>' first")]
    PoolNotInitialized,

    /// A by-count request could not be satisfied. `available` excludes
    /// devices held by unreserved processes, which are counted separately
    /// so users understand where the capacity went.
    #[error(
        "not enough GPUs available: requested {requested}, {available} available ({unreserved_in_use} in unreserved use)"
    )]
    CapacityExhausted {
        requested: u32,
        available: u32,
        unreserved_in_use: u32,
    },

    /// A requested device ID does not exist in this pool. Distinct from
    /// [`LeaseError::DeviceConflict`]: no amount of waiting can make the
    /// device appear, so blocking callers must fail immediately.
    #[error("device out of range: {0}")]
    OutOfRange(String),

    /// A specific requested device cannot be reserved right now. The
    /// message names the device and the precise reason (already leased,
    /// or state changed mid-allocation).
    #[error("device conflict: {0}")]
    DeviceConflict(String),

    /// A requested device is in use by a process without any reservation.
    #[error("unreserved GPU usage: {0}")]
    UnauthorizedUsage(String),

    /// The allocation lock could not be acquired within the bounded retry
    /// schedule.
    #[error("allocation lock unavailable: {0}")]
    LockUnavailable(String),

    /// A stored value failed to deserialize or violated a state invariant.
    /// Never silently healed; the operator must look at the store.
    #[error("corrupt state in store: {0}")]
    StoreCorrupt(String),

    /// The store itself failed (unreachable, protocol error, script error).
    #[error("store error: {0}")]
    StoreError(String),

    /// A blocking wait was cancelled by the caller or a signal.
    #[error("wait cancelled: {0}")]
    WaitCancelled(String),

    /// A blocking wait exceeded its deadline.
    #[error("wait timed out: {0}")]
    WaitTimeout(String),

    /// A heartbeat discovered that a slot we believed we owned is no
    /// longer reserved at all. Loud by design: the wrapped workload is
    /// running on a device someone else may now receive.
    #[error("reservation lost: {0}")]
    ReservationLost(String),

    /// The vendor inspection tool is absent or errored.
    #[error("device inspection failed: {0}")]
    InspectionFailed(String),

    /// Caller-supplied input failed validation.
    #[error("validation error: {0}")]
    ValidationError(String),

    #[error("serialization error: {0}")]
    SerializationError(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl LeaseError {
    /// Whether this error indicates the whole operation must abort rather
    /// than continue with degraded behavior.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            LeaseError::PoolNotInitialized | LeaseError::StoreCorrupt(_) | LeaseError::StoreError(_)
        )
    }

    /// Whether the condition is transient and a retry may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, LeaseError::LockUnavailable(_) | LeaseError::WaitTimeout(_))
    }
}
