// /////////////////////////////////////////////////////////////////////////////
// GPU Lease Coordinator
// Copyright (c) 2025 Michael Gardner, A Bit of Help, Inc.
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! # GPU Lease Coordinator
//!
//! `gpulease` coordinates exclusive access to a fixed pool of
//! locally-attached GPUs on a single multi-user host. Users request devices
//! either implicitly (`gpulease run`, which wraps a child process whose
//! lifetime determines the lease) or explicitly (`gpulease reserve`, a
//! time-bounded manual reservation). The coordinator prevents
//! double-booking, reclaims leases whose owners vanished, refuses to hand
//! out devices that unauthorized processes are already using, queues
//! requests first-come-first-served when devices are scarce, and records
//! usage for attribution.
//!
//! ## Architecture
//!
//! The crate follows the same Clean Architecture layering as the rest of
//! the workspace:
//!
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │ Presentation  (CLI in main.rs, tables, dashboard)   │
//! ├─────────────────────────────────────────────────────┤
//! │ Application   (allocation engine, lease maintainer, │
//! │                queue coordinator, use cases)        │
//! ├─────────────────────────────────────────────────────┤
//! │ Domain        (gpulease-domain: entities, ports)    │
//! ├─────────────────────────────────────────────────────┤
//! │ Infrastructure (Redis store, vendor inspectors,     │
//! │                 config, logging)                    │
//! └─────────────────────────────────────────────────────┘
//! ```
//!
//! Every process sharing the host coordinates through the Redis store; the
//! atomic reservation scripts and the allocation lock keep slot state
//! consistent under concurrent allocation from many independent processes.

pub mod application;
pub mod infrastructure;
pub mod presentation;

// Re-export domain types for convenient access from tests and the binary.
pub use gpulease_domain::{
    AllocationRequest, AllocationTarget, DeviceInspector, DeviceUsage, GpuProcess, GpuProvider, LeaseError,
    LeaseKind, LeaseStore, Owner, QueueEntry, Reservation, SlotState, UsageRecord,
};
