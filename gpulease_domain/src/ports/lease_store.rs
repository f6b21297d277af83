// /////////////////////////////////////////////////////////////////////////////
// GPU Lease Coordinator
// Copyright (c) 2025 Michael Gardner, A Bit of Help, Inc.
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! # Lease Store Port
//!
//! Typed access to the external key-value store that is the system's single
//! source of truth, plus the atomic primitives the coordination protocol is
//! built on. Implemented by the Redis adapter in production and by an
//! in-memory adapter for tests and store-less development.
//!
//! ## Atomicity contract
//!
//! Multi-slot writes happen in two regimes:
//!
//! - **Under the allocation lock** (a named mutex with a bounded lease):
//!   acquired by every allocator before ranking candidates, released
//!   unconditionally on all exit paths. The lease bounds the damage of a
//!   crashed holder.
//! - **Inside the atomic reserve operations**: [`LeaseStore::reserve_ranked`]
//!   and [`LeaseStore::reserve_exact`] validate every candidate is still in
//!   the exact state the caller observed and write the reservation records
//!   indivisibly; the store must guarantee no other writer touches slot
//!   state during their execution.
//!
//! Single-slot writes (heartbeats, sweep releases, owner releases) go
//! through [`LeaseStore::swap_slot`], a compare-and-swap on the serialized
//! slot state. The CAS carries the "am I still the owner?" pre-check: a
//! writer that loses the race observes `false` and re-reads.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::entities::device_slot::{Reservation, SlotState};
use crate::entities::queue_entry::QueueEntry;
use crate::entities::usage_record::UsageRecord;
use crate::error::LeaseError;
use crate::ports::device_inspector::GpuProvider;

/// A slot the allocator wants, paired with the state the ranking observed.
/// The reserve operations treat the observed state as a CAS expectation.
#[derive(Debug, Clone, PartialEq)]
pub struct RankedCandidate {
    pub device_id: u32,
    pub observed: SlotState,
}

/// The store port; see the module docs for the atomicity contract.
#[async_trait]
pub trait LeaseStore: Send + Sync {
    // ---- pool ----

    /// Pool size, or `None` when the pool was never initialized.
    async fn pool_size(&self) -> Result<Option<u32>, LeaseError>;

    /// Writes pool size and provider, and clears every slot, queue entry
    /// and the allocation lock. Callers decide whether clobbering an
    /// existing pool is allowed; the store just writes.
    async fn initialize_pool(&self, count: u32, provider: GpuProvider) -> Result<(), LeaseError>;

    /// The provider recorded at initialization. When the key is absent but
    /// the pool exists, the store infers the legacy default (`nvidia`),
    /// writes it back, and returns it.
    async fn provider(&self) -> Result<GpuProvider, LeaseError>;

    // ---- slots ----

    /// State of one slot; an absent record reads as a fresh available slot.
    /// Corrupt records surface as [`LeaseError::StoreCorrupt`].
    async fn slot_state(&self, device_id: u32) -> Result<SlotState, LeaseError>;

    /// States of slots `0..pool_size`, in index order.
    async fn all_slots(&self, pool_size: u32) -> Result<Vec<(u32, SlotState)>, LeaseError>;

    /// Atomically replaces a slot's state iff it still equals `expected`.
    /// Returns `false` (without writing) when the state changed underneath.
    async fn swap_slot(&self, device_id: u32, expected: &SlotState, next: &SlotState) -> Result<bool, LeaseError>;

    // ---- atomic reservation ----

    /// Reserves up to `needed` devices from `candidates`, in the given
    /// priority order, writing `template` (the same reservation record)
    /// for each chosen slot. A candidate whose live state no longer equals
    /// its observed state is skipped. With `allow_partial`, however many
    /// candidates survive (possibly zero) are reserved; without it, the
    /// operation is all-or-nothing and fails with
    /// [`LeaseError::DeviceConflict`] when fewer than `needed` survive.
    async fn reserve_ranked(
        &self,
        candidates: &[RankedCandidate],
        needed: u32,
        allow_partial: bool,
        template: &Reservation,
    ) -> Result<Vec<u32>, LeaseError>;

    /// Reserves exactly these devices, all-or-nothing, with the same CAS
    /// validation. Fails with a per-device reason on the first conflict.
    async fn reserve_exact(&self, candidates: &[RankedCandidate], template: &Reservation)
        -> Result<Vec<u32>, LeaseError>;

    // ---- allocation lock ----

    /// Acquires the named allocation mutex, retrying with exponential
    /// backoff plus jitter up to a bounded number of attempts. Returns the
    /// holder token needed for release. The lock carries a lease (~10 s) so
    /// a crashed holder cannot deadlock the pool.
    async fn acquire_allocation_lock(&self) -> Result<String, LeaseError>;

    /// Releases the lock iff `token` still identifies our acquisition.
    /// Releasing an expired or stolen lock is a no-op, not an error.
    async fn release_allocation_lock(&self, token: &str) -> Result<(), LeaseError>;

    // ---- queue ----

    async fn enqueue(&self, entry: &QueueEntry) -> Result<(), LeaseError>;

    /// Entries in FCFS order. Entries whose serialized form is corrupt are
    /// skipped (logged by the adapter), not fatal: one bad entry must not
    /// wedge the queue.
    async fn queue_entries(&self) -> Result<Vec<QueueEntry>, LeaseError>;

    async fn queue_entry(&self, id: &str) -> Result<Option<QueueEntry>, LeaseError>;

    async fn update_queue_entry(&self, entry: &QueueEntry) -> Result<(), LeaseError>;

    async fn remove_queue_entry(&self, id: &str) -> Result<(), LeaseError>;

    // ---- usage ----

    /// Appends a usage record and trims records older than the retention
    /// window.
    async fn record_usage(&self, record: &UsageRecord) -> Result<(), LeaseError>;

    /// Records whose end instant falls at or after `cutoff`, oldest first.
    /// The first read migrates any records still stored in the legacy
    /// one-key-per-record schema.
    async fn usage_since(&self, cutoff: DateTime<Utc>) -> Result<Vec<UsageRecord>, LeaseError>;
}
