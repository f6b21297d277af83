// /////////////////////////////////////////////////////////////////////////////
// GPU Lease Coordinator
// Copyright (c) 2025 Michael Gardner, A Bit of Help, Inc.
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! # GPU Lease Domain
//!
//! Pure domain layer for the `gpulease` GPU coordination system. This crate
//! holds the business objects and rules for coordinating exclusive access to
//! a fixed pool of locally-attached accelerators on a multi-user host:
//!
//! - **Entities**: device slots with their reservation state, queue entries
//!   for blocked allocations, and append-only usage records
//! - **Value Objects**: validated allocation requests, owner identities, and
//!   lease kinds
//! - **Ports**: the state-store and device-inspector traits implemented by
//!   the infrastructure layer
//! - **Errors**: the `LeaseError` taxonomy shared by every layer
//!
//! ## Architecture
//!
//! The crate follows Domain-Driven Design layering: no tokio, no store
//! client, no logging framework. Infrastructure ports (`LeaseStore`,
//! `DeviceInspector`) are async traits because they front I/O, but their
//! contracts are expressed purely in domain types.
//!
//! ## Ground truth
//!
//! The external key-value store is the single source of truth for every
//! entity. In-memory values held by any component are caches; all mutation
//! flows through the `LeaseStore` port, which exposes the atomic primitives
//! (compare-and-swap slot writes, ranked/exact reservation, the allocation
//! lock) that keep the pool consistent under concurrent access from many
//! independent processes.

pub mod entities;
pub mod error;
pub mod ports;
pub mod services;
pub mod value_objects;

// Re-export the types that appear in nearly every signature.
pub use entities::device_slot::{Reservation, SlotState};
pub use entities::queue_entry::QueueEntry;
pub use entities::usage_record::UsageRecord;
pub use error::LeaseError;
pub use ports::device_inspector::{DeviceInspector, DeviceUsage, GpuProcess, GpuProvider};
pub use ports::lease_store::{LeaseStore, RankedCandidate};
pub use value_objects::allocation_request::{AllocationRequest, AllocationTarget};
pub use value_objects::lease_kind::LeaseKind;
pub use value_objects::owner::Owner;
