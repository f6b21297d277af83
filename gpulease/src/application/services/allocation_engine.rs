// /////////////////////////////////////////////////////////////////////////////
// GPU Lease Coordinator
// Copyright (c) 2025 Michael Gardner, A Bit of Help, Inc.
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! # Allocation Engine
//!
//! Selects devices, writes reservations atomically, enforces the selection
//! policy, and answers status queries. Every allocator on the host runs
//! this same code against the shared store.
//!
//! ## Immediate allocation
//!
//! 1. validate the request
//! 2. inspect the fleet and compute the out-of-band set (emptied by the
//!    caller's `force` override)
//! 3. acquire the allocation lock
//! 4. run the expiry sweep, so reclaimable leases release through the
//!    accounted path before selection sees them
//! 5. rank eligible slots and invoke the atomic reserve operation
//! 6. release the lock on every exit path
//!
//! On capacity failure the error quantifies available-minus-out-of-band so
//! users can see where the devices went.
//!
//! ## Selection policy (by-count requests)
//!
//! Eligible available slots are ranked:
//!
//! 1. slots this identity used most recently, newest first (derived from
//!    the usage records) — warm caches and affinity for iterative users
//! 2. slots nobody has ever touched (no `last_released`)
//! 3. remaining slots by `last_released`, oldest first — spreads thermal
//!    wear across the pool
//!
//! ## Specific-ID requests
//!
//! No ranking; every requested ID must be in range, not out-of-band, and
//! not held by a live lease. A lease is live unless it is manual-and-
//! expired or run-and-heartbeat-stale; either condition makes the slot
//! reservable. Failures name the device and the reason.

use chrono::{DateTime, Duration, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, warn};

use gpulease_domain::ports::device_inspector::out_of_band_devices;
use gpulease_domain::{
    AllocationRequest, AllocationTarget, DeviceInspector, DeviceUsage, LeaseError, LeaseKind, LeaseStore, Owner,
    QueueEntry, RankedCandidate, Reservation, SlotState, UsageRecord,
};

use crate::infrastructure::config::Settings;

/// Per-slot status view returned by the state query.
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum SlotView {
    Available {
        device_id: u32,
        #[serde(skip_serializing_if = "Option::is_none")]
        last_released: Option<DateTime<Utc>>,
    },
    Reserved {
        device_id: u32,
        owner: String,
        kind: LeaseKind,
        started_at: DateTime<Utc>,
        #[serde(skip_serializing_if = "Option::is_none")]
        last_heartbeat: Option<DateTime<Utc>>,
        #[serde(skip_serializing_if = "Option::is_none")]
        expires_at: Option<DateTime<Utc>>,
        #[serde(skip_serializing_if = "Option::is_none")]
        note: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        partial_queue_id: Option<String>,
        /// Whether the lease is past its liveness rule and awaiting sweep.
        reclaimable: bool,
    },
    UnreservedInUse {
        device_id: u32,
        memory_used_mb: u64,
        owners: Vec<String>,
        process_count: usize,
    },
    Error {
        device_id: u32,
        message: String,
    },
}

/// The full pool picture for status rendering.
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct PoolStatus {
    pub pool_size: u32,
    pub slots: Vec<SlotView>,
}

/// The coordination engine; see the module docs.
pub struct AllocationEngine {
    store: Arc<dyn LeaseStore>,
    inspector: Arc<dyn DeviceInspector>,
    settings: Settings,
}

impl AllocationEngine {
    pub fn new(store: Arc<dyn LeaseStore>, inspector: Arc<dyn DeviceInspector>, settings: Settings) -> Self {
        AllocationEngine {
            store,
            inspector,
            settings,
        }
    }

    pub fn store(&self) -> Arc<dyn LeaseStore> {
        self.store.clone()
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Pool size, failing with the user-facing uninitialized error.
    pub async fn pool_size(&self) -> Result<u32, LeaseError> {
        self.store.pool_size().await?.ok_or(LeaseError::PoolNotInitialized)
    }

    /// Inspects the fleet; returns the out-of-band device set and the raw
    /// snapshot for enrichment.
    pub async fn inspect(&self) -> Result<(Vec<u32>, Vec<DeviceUsage>), LeaseError> {
        let snapshot = self.inspector.snapshot().await?;
        let out_of_band = out_of_band_devices(&snapshot, self.settings.memory_threshold_mb);
        Ok((out_of_band, snapshot))
    }

    /// Immediate allocation; see the module docs for the step sequence.
    /// Returns the reserved device IDs.
    pub async fn allocate(&self, request: &AllocationRequest, force: bool) -> Result<Vec<u32>, LeaseError> {
        request.validate()?;
        let pool_size = self.pool_size().await?;

        if let AllocationTarget::Devices(ids) = &request.target {
            for id in ids {
                if *id >= pool_size {
                    return Err(LeaseError::OutOfRange(format!(
                        "device {id} does not exist in a pool of {pool_size} devices"
                    )));
                }
            }
        }

        let (out_of_band, snapshot) = if force {
            (Vec::new(), Vec::new())
        } else {
            self.inspect().await?
        };

        let token = self.store.acquire_allocation_lock().await?;
        let result = self
            .allocate_locked(request, pool_size, &out_of_band, &snapshot)
            .await;
        if let Err(e) = self.store.release_allocation_lock(&token).await {
            warn!("failed to release allocation lock: {e}");
        }
        result
    }

    async fn allocate_locked(
        &self,
        request: &AllocationRequest,
        pool_size: u32,
        out_of_band: &[u32],
        snapshot: &[DeviceUsage],
    ) -> Result<Vec<u32>, LeaseError> {
        // Reclaimable leases release through the accounted path first.
        self.expiry_sweep().await?;

        let now = Utc::now();
        let slots = self.store.all_slots(pool_size).await?;
        let template = self.reservation_template(request, now)?;

        match &request.target {
            AllocationTarget::Count(count) => {
                let mru = self.user_recent_usage(&request.owner).await?;
                let candidates = rank_candidates(&slots, out_of_band, &mru);

                if (candidates.len() as u32) < *count {
                    return Err(LeaseError::CapacityExhausted {
                        requested: *count,
                        available: candidates.len() as u32,
                        unreserved_in_use: count_unreserved_in_use(&slots, out_of_band),
                    });
                }
                self.store.reserve_ranked(&candidates, *count, false, &template).await
            }
            AllocationTarget::Devices(ids) => {
                let mut candidates = Vec::with_capacity(ids.len());
                for id in ids {
                    if out_of_band.contains(id) {
                        let owners = snapshot
                            .iter()
                            .find(|usage| usage.index == *id)
                            .map(|usage| usage.owners().into_iter().collect::<Vec<_>>().join(", "))
                            .unwrap_or_default();
                        return Err(LeaseError::UnauthorizedUsage(format!(
                            "device {id} is in use without a reservation (by {owners})"
                        )));
                    }
                    let (_, state) = &slots[*id as usize];
                    if let Some(reservation) = state.reservation() {
                        // The sweep already released reclaimable leases; a
                        // reservation still present here is live.
                        if !reservation.is_reclaimable(now, self.settings.heartbeat_timeout()) {
                            return Err(LeaseError::DeviceConflict(format!(
                                "device {id} is reserved by {} ({} lease since {})",
                                reservation.owner,
                                reservation.kind,
                                reservation.started_at.to_rfc3339()
                            )));
                        }
                    }
                    candidates.push(RankedCandidate {
                        device_id: *id,
                        observed: state.clone(),
                    });
                }
                self.store.reserve_exact(&candidates, &template).await
            }
        }
    }

    /// Greedy partial allocation for the head-of-line queue entry. Under
    /// the lock: compute the free, non-out-of-band, not-yet-held slots
    /// (restricted to the requested set for specific-ID entries), rank
    /// them, and reserve up to the entry's missing count, each tagged with
    /// the entry's ID. Returns the newly reserved devices.
    pub async fn allocate_partial(&self, entry: &QueueEntry) -> Result<Vec<u32>, LeaseError> {
        let pool_size = self.pool_size().await?;
        let (out_of_band, _) = self.inspect().await?;

        let token = self.store.acquire_allocation_lock().await?;
        let result = self
            .allocate_partial_locked(entry, pool_size, &out_of_band)
            .await;
        if let Err(e) = self.store.release_allocation_lock(&token).await {
            warn!("failed to release allocation lock: {e}");
        }
        result
    }

    async fn allocate_partial_locked(
        &self,
        entry: &QueueEntry,
        pool_size: u32,
        out_of_band: &[u32],
    ) -> Result<Vec<u32>, LeaseError> {
        self.expiry_sweep().await?;

        let needed = entry.needed();
        if needed == 0 {
            return Ok(Vec::new());
        }

        let now = Utc::now();
        let slots = self.store.all_slots(pool_size).await?;
        let held: HashSet<u32> = entry.allocated.iter().copied().collect();

        let mru = self.user_recent_usage(&entry.request.owner).await?;
        let mut candidates = rank_candidates(&slots, out_of_band, &mru);
        candidates.retain(|candidate| !held.contains(&candidate.device_id));
        if let AllocationTarget::Devices(ids) = &entry.request.target {
            candidates.retain(|candidate| ids.contains(&candidate.device_id));
        }

        let mut template = self.reservation_template(&entry.request, now)?;
        template.partial_queue_id = Some(entry.id.clone());

        self.store.reserve_ranked(&candidates, needed, true, &template).await
    }

    /// Clears the partial tags once a queue entry's request is complete.
    /// Manual expiries are re-stamped from now so the lease clock starts at
    /// full allocation, not at first-slot acquisition.
    pub async fn finalize_partial(&self, entry: &QueueEntry) -> Result<(), LeaseError> {
        let now = Utc::now();
        for device_id in &entry.allocated {
            let observed = self.store.slot_state(*device_id).await?;
            let Some(reservation) = observed.reservation() else {
                return Err(LeaseError::ReservationLost(format!(
                    "device {device_id} was released while queued entry {} awaited completion",
                    entry.id
                )));
            };
            if reservation.partial_queue_id.as_deref() != Some(entry.id.as_str()) {
                return Err(LeaseError::ReservationLost(format!(
                    "device {device_id} is no longer held for queue entry {}",
                    entry.id
                )));
            }

            let mut finalized = reservation.clone();
            finalized.partial_queue_id = None;
            if finalized.kind == LeaseKind::Manual {
                let duration = entry.request.duration_secs.unwrap_or(0) as i64;
                finalized.expires_at = Some(now + Duration::seconds(duration));
            }
            if !self
                .store
                .swap_slot(*device_id, &observed, &SlotState::Reserved(finalized))
                .await?
            {
                return Err(LeaseError::ReservationLost(format!(
                    "device {device_id} changed while finalizing queue entry {}",
                    entry.id
                )));
            }
        }
        Ok(())
    }

    /// Returns every slot still tagged with this queue entry to available.
    /// Partial releases never write usage records: the allocation never
    /// completed.
    pub async fn release_partial(&self, entry_id: &str) -> Result<Vec<u32>, LeaseError> {
        let pool_size = self.pool_size().await?;
        let now = Utc::now();
        let mut released = Vec::new();
        for (device_id, state) in self.store.all_slots(pool_size).await? {
            let Some(reservation) = state.reservation() else { continue };
            if reservation.partial_queue_id.as_deref() != Some(entry_id) {
                continue;
            }
            if self
                .store
                .swap_slot(device_id, &state, &SlotState::released_at(now))
                .await?
            {
                released.push(device_id);
            }
        }
        Ok(released)
    }

    /// Companion to [`AllocationEngine::release_partial`] for a
    /// finalization that failed partway: releases the listed devices iff
    /// they are this owner's untagged reservations, without usage records
    /// (the allocation was never handed to the caller).
    pub async fn release_untagged_queue_slots(&self, owner: &Owner, ids: &[u32]) -> Result<Vec<u32>, LeaseError> {
        let now = Utc::now();
        let mut released = Vec::new();
        for id in ids {
            let state = self.store.slot_state(*id).await?;
            let ours_untagged = state
                .reservation()
                .map(|r| r.owner == *owner && r.partial_queue_id.is_none())
                .unwrap_or(false);
            if !ours_untagged {
                continue;
            }
            if self
                .store
                .swap_slot(*id, &state, &SlotState::released_at(now))
                .await?
            {
                released.push(*id);
            }
        }
        Ok(released)
    }

    /// Idempotent expiry sweep: releases every slot whose lease is
    /// manual-and-expired or run-and-heartbeat-stale, writing a usage
    /// record per reclaimed lease. Partial-tagged slots belong to their
    /// queue entry and are only reclaimed here once that entry is gone or
    /// stale. Safe to invoke from any number of processes concurrently.
    pub async fn expiry_sweep(&self) -> Result<Vec<u32>, LeaseError> {
        let pool_size = self.pool_size().await?;
        let now = Utc::now();
        let queue_entries: HashMap<String, QueueEntry> = self
            .store
            .queue_entries()
            .await?
            .into_iter()
            .map(|entry| (entry.id.clone(), entry))
            .collect();

        let mut reclaimed = Vec::new();
        for device_id in 0..pool_size {
            let state = match self.store.slot_state(device_id).await {
                Ok(state) => state,
                Err(e) => {
                    // One unreadable slot must not stop the sweep.
                    warn!("sweep skipping device {device_id}: {e}");
                    continue;
                }
            };
            let Some(reservation) = state.reservation() else { continue };

            if let Some(queue_id) = &reservation.partial_queue_id {
                let waiter_alive = queue_entries
                    .get(queue_id)
                    .map(|entry| !entry.is_stale(now, self.settings.queue_heartbeat_timeout()))
                    .unwrap_or(false);
                if !waiter_alive {
                    // Leaked partial allocation: back to the pool, no usage
                    // record, the allocation never completed.
                    if self
                        .store
                        .swap_slot(device_id, &state, &SlotState::released_at(now))
                        .await?
                    {
                        debug!("sweep reclaimed leaked partial device {device_id} (entry {queue_id})");
                        reclaimed.push(device_id);
                    }
                }
                continue;
            }

            if reservation.is_reclaimable(now, self.settings.heartbeat_timeout()) {
                if self.release_reserved_slot(device_id, &state, now).await? {
                    debug!(
                        "sweep reclaimed device {device_id} from {} ({})",
                        reservation.owner, reservation.kind
                    );
                    reclaimed.push(device_id);
                }
            }
        }
        Ok(reclaimed)
    }

    /// Releases all of this owner's manual leases. Returns the device IDs
    /// released.
    pub async fn release_all_manual(&self, owner: &Owner) -> Result<Vec<u32>, LeaseError> {
        let pool_size = self.pool_size().await?;
        let now = Utc::now();
        let mut released = Vec::new();
        for (device_id, state) in self.store.all_slots(pool_size).await? {
            let Some(reservation) = state.reservation() else { continue };
            if reservation.kind != LeaseKind::Manual
                || reservation.owner != *owner
                || reservation.partial_queue_id.is_some()
            {
                continue;
            }
            if self.release_reserved_slot(device_id, &state, now).await? {
                released.push(device_id);
            }
        }
        Ok(released)
    }

    /// Releases specific slots held by this owner (either kind). Every
    /// requested slot must actually be the owner's; the first one that is
    /// not fails the whole call with a precise reason.
    pub async fn release_devices(&self, owner: &Owner, ids: &[u32]) -> Result<Vec<u32>, LeaseError> {
        let pool_size = self.pool_size().await?;
        let now = Utc::now();

        let mut to_release = Vec::with_capacity(ids.len());
        for id in ids {
            if *id >= pool_size {
                return Err(LeaseError::OutOfRange(format!(
                    "device {id} does not exist in a pool of {pool_size} devices"
                )));
            }
            let state = self.store.slot_state(*id).await?;
            match state.reservation() {
                None => {
                    return Err(LeaseError::DeviceConflict(format!("device {id} is not reserved")));
                }
                Some(reservation) if reservation.owner != *owner => {
                    return Err(LeaseError::DeviceConflict(format!(
                        "device {id} is reserved by {}, not you",
                        reservation.owner
                    )));
                }
                Some(_) => to_release.push((*id, state)),
            }
        }

        let mut released = Vec::new();
        for (device_id, state) in to_release {
            if self.release_reserved_slot(device_id, &state, now).await? {
                released.push(device_id);
            }
        }
        Ok(released)
    }

    /// Best-effort release used by maintainer teardown: releases each of
    /// these devices iff it is still this owner's run lease, silently
    /// skipping devices someone else holds by now. Per-slot failures are
    /// logged and do not stop the remaining releases — cleanup must
    /// proceed. Returns the devices actually released.
    pub async fn release_run_slots(&self, owner: &Owner, ids: &[u32]) -> Vec<u32> {
        let now = Utc::now();
        let mut released = Vec::new();
        for id in ids {
            let state = match self.store.slot_state(*id).await {
                Ok(state) => state,
                Err(e) => {
                    warn!("skipping release of device {id}: {e}");
                    continue;
                }
            };
            let ours = state
                .reservation()
                .map(|r| r.owner == *owner && r.kind == LeaseKind::Run)
                .unwrap_or(false);
            if !ours {
                continue;
            }
            match self.release_reserved_slot(*id, &state, now).await {
                Ok(true) => released.push(*id),
                Ok(false) => {}
                Err(e) => warn!("failed to release device {id}: {e}"),
            }
        }
        released
    }

    /// State query: one tagged view per slot. A pure reader.
    pub async fn status(&self) -> Result<PoolStatus, LeaseError> {
        let pool_size = self.pool_size().await?;
        let now = Utc::now();
        let (out_of_band, snapshot) = self.inspect().await?;

        let mut views = Vec::with_capacity(pool_size as usize);
        for device_id in 0..pool_size {
            let view = match self.store.slot_state(device_id).await {
                Err(e) => SlotView::Error {
                    device_id,
                    message: e.to_string(),
                },
                Ok(SlotState::Reserved(reservation)) => SlotView::Reserved {
                    device_id,
                    owner: reservation.owner.to_string(),
                    kind: reservation.kind,
                    started_at: reservation.started_at,
                    last_heartbeat: reservation.last_heartbeat,
                    expires_at: reservation.expires_at,
                    note: reservation.note.clone(),
                    partial_queue_id: reservation.partial_queue_id.clone(),
                    reclaimable: reservation.is_reclaimable(now, self.settings.heartbeat_timeout()),
                },
                Ok(SlotState::Available { last_released }) => {
                    if out_of_band.contains(&device_id) {
                        let usage = snapshot.iter().find(|usage| usage.index == device_id);
                        SlotView::UnreservedInUse {
                            device_id,
                            memory_used_mb: usage.map(|u| u.memory_used_mb).unwrap_or_default(),
                            owners: usage
                                .map(|u| u.owners().into_iter().collect())
                                .unwrap_or_default(),
                            process_count: usage.map(|u| u.processes.len()).unwrap_or_default(),
                        }
                    } else {
                        SlotView::Available {
                            device_id,
                            last_released,
                        }
                    }
                }
            };
            views.push(view);
        }
        Ok(PoolStatus {
            pool_size,
            slots: views,
        })
    }

    /// Refreshes the heartbeat on a run lease we own. Outcomes mirror the
    /// maintainer contract: refreshed, silently skipped (someone else owns
    /// it now), or lost (nobody does).
    pub async fn heartbeat(&self, owner: &Owner, device_id: u32) -> Result<HeartbeatOutcome, LeaseError> {
        let state = self.store.slot_state(device_id).await?;
        match state.reservation() {
            None => Ok(HeartbeatOutcome::Lost),
            Some(reservation) if reservation.owner != *owner || reservation.kind != LeaseKind::Run => {
                Ok(HeartbeatOutcome::NotOurs)
            }
            Some(reservation) => {
                let mut refreshed = reservation.clone();
                refreshed.last_heartbeat = Some(Utc::now());
                if self
                    .store
                    .swap_slot(device_id, &state, &SlotState::Reserved(refreshed))
                    .await?
                {
                    Ok(HeartbeatOutcome::Refreshed)
                } else {
                    // Lost the race with a sweeper or a new owner; the next
                    // tick re-reads and classifies.
                    Ok(HeartbeatOutcome::NotOurs)
                }
            }
        }
    }

    /// Releases one reserved slot through the accounted path: available
    /// with a fresh `last_released`, plus a usage record. Usage-record
    /// failure is logged and does not block the release.
    async fn release_reserved_slot(
        &self,
        device_id: u32,
        observed: &SlotState,
        now: DateTime<Utc>,
    ) -> Result<bool, LeaseError> {
        let Some(reservation) = observed.reservation() else {
            return Ok(false);
        };
        if !self
            .store
            .swap_slot(device_id, observed, &SlotState::released_at(now))
            .await?
        {
            return Ok(false);
        }

        let record = UsageRecord::new(
            reservation.owner.clone(),
            device_id,
            reservation.started_at,
            now,
            reservation.kind,
        );
        if let Err(e) = self.store.record_usage(&record).await {
            warn!("failed to record usage for device {device_id}: {e}");
        }
        Ok(true)
    }

    fn reservation_template(&self, request: &AllocationRequest, now: DateTime<Utc>) -> Result<Reservation, LeaseError> {
        Ok(match request.kind {
            LeaseKind::Run => Reservation::run(request.owner.clone(), now, request.note.clone()),
            LeaseKind::Manual => {
                let duration = request.duration_secs.ok_or_else(|| {
                    LeaseError::ValidationError("manual reservations require a duration".to_string())
                })?;
                Reservation::manual(
                    request.owner.clone(),
                    now,
                    Duration::seconds(duration as i64),
                    request.note.clone(),
                )
            }
        })
    }

    /// This identity's most recent usage per device, from the records.
    async fn user_recent_usage(&self, owner: &Owner) -> Result<HashMap<u32, DateTime<Utc>>, LeaseError> {
        let cutoff = Utc::now() - self.settings.usage_retention();
        let mut recent: HashMap<u32, DateTime<Utc>> = HashMap::new();
        for record in self.store.usage_since(cutoff).await? {
            if record.owner == *owner {
                recent
                    .entry(record.device_id)
                    .and_modify(|at| *at = (*at).max(record.ended_at))
                    .or_insert(record.ended_at);
            }
        }
        Ok(recent)
    }
}

/// Heartbeat outcomes; see [`AllocationEngine::heartbeat`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatOutcome {
    Refreshed,
    /// Reserved, but not our run lease any more; skip silently.
    NotOurs,
    /// Not reserved at all; the lease is gone.
    Lost,
}

/// Ranks eligible available slots by the selection policy; see the module
/// docs. Returns candidates in allocation priority order, carrying the
/// observed state for the store's CAS validation.
fn rank_candidates(
    slots: &[(u32, SlotState)],
    out_of_band: &[u32],
    user_recent: &HashMap<u32, DateTime<Utc>>,
) -> Vec<RankedCandidate> {
    let mut eligible: Vec<(u32, &SlotState)> = slots
        .iter()
        .filter(|(id, state)| state.is_available() && !out_of_band.contains(id))
        .map(|(id, state)| (*id, state))
        .collect();

    eligible.sort_by_key(|(id, state)| {
        match (user_recent.get(id), state.last_released()) {
            // MRU-per-user first, newest use first.
            (Some(used_at), _) => (0u8, -used_at.timestamp_micros()),
            // Never-touched slots next.
            (None, None) => (1, 0),
            // Global LRU for the rest, oldest release first.
            (None, Some(released_at)) => (2, released_at.timestamp_micros()),
        }
    });

    eligible
        .into_iter()
        .map(|(id, state)| RankedCandidate {
            device_id: id,
            observed: state.clone(),
        })
        .collect()
}

/// Out-of-band devices that would otherwise be free; used to explain
/// capacity errors.
fn count_unreserved_in_use(slots: &[(u32, SlotState)], out_of_band: &[u32]) -> u32 {
    slots
        .iter()
        .filter(|(id, state)| state.is_available() && out_of_band.contains(id))
        .count() as u32
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::adapters::FakeInspector;
    use crate::infrastructure::repositories::MemoryLeaseStore;
    use chrono::TimeZone;
    use gpulease_domain::GpuProvider;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    fn owner(name: &str) -> Owner {
        Owner::new(name).unwrap()
    }

    async fn engine_with(
        pool: u32,
        inspector: FakeInspector,
    ) -> (Arc<MemoryLeaseStore>, AllocationEngine) {
        let store = Arc::new(MemoryLeaseStore::new());
        store.initialize_pool(pool, GpuProvider::Fake).await.unwrap();
        let engine = AllocationEngine::new(store.clone(), Arc::new(inspector), Settings::default());
        (store, engine)
    }

    fn run_request(name: &str, count: u32) -> AllocationRequest {
        AllocationRequest::run(owner(name), AllocationTarget::Count(count), None).unwrap()
    }

    #[test]
    fn test_rank_prefers_user_mru_then_untouched_then_lru() {
        let slots = vec![
            (0, SlotState::released_at(at(100))), // oldest release
            (1, SlotState::fresh()),              // never touched
            (2, SlotState::released_at(at(500))), // user's, 1h ago
            (3, SlotState::released_at(at(900))), // user's, 30m ago
        ];
        let mut mru = HashMap::new();
        mru.insert(2, at(500));
        mru.insert(3, at(900));

        let ranked: Vec<u32> = rank_candidates(&slots, &[], &mru).iter().map(|c| c.device_id).collect();
        // Most recent personal use first, then the untouched slot, then LRU.
        assert_eq!(ranked, vec![3, 2, 1, 0]);
    }

    #[test]
    fn test_rank_excludes_reserved_and_out_of_band() {
        let slots = vec![
            (0, SlotState::fresh()),
            (1, SlotState::fresh()),
            (
                2,
                SlotState::Reserved(Reservation::run(owner("bob"), at(0), None)),
            ),
        ];
        let ranked: Vec<u32> = rank_candidates(&slots, &[1], &HashMap::new())
            .iter()
            .map(|c| c.device_id)
            .collect();
        assert_eq!(ranked, vec![0]);
    }

    #[test]
    fn test_rank_global_lru_is_oldest_first() {
        let slots = vec![
            (0, SlotState::released_at(at(300))),
            (1, SlotState::released_at(at(100))),
            (2, SlotState::released_at(at(200))),
        ];
        let ranked: Vec<u32> = rank_candidates(&slots, &[], &HashMap::new())
            .iter()
            .map(|c| c.device_id)
            .collect();
        assert_eq!(ranked, vec![1, 2, 0]);
    }

    #[tokio::test]
    async fn test_initialize_and_allocate() {
        let (store, engine) = engine_with(4, FakeInspector::empty(4)).await;

        let devices = engine.allocate(&run_request("alice", 2), false).await.unwrap();
        assert_eq!(devices.len(), 2);

        let status = engine.status().await.unwrap();
        let reserved: Vec<u32> = status
            .slots
            .iter()
            .filter_map(|view| match view {
                SlotView::Reserved { device_id, owner, .. } if owner == "alice" => Some(*device_id),
                _ => None,
            })
            .collect();
        assert_eq!(reserved, devices);
        let available = status
            .slots
            .iter()
            .filter(|view| matches!(view, SlotView::Available { .. }))
            .count();
        assert_eq!(available, 2);

        // Both written as run leases with heartbeats.
        for id in devices {
            let reservation = store.raw_slot(id).await.reservation().cloned().unwrap();
            assert_eq!(reservation.kind, LeaseKind::Run);
            assert!(reservation.last_heartbeat.is_some());
        }
    }

    #[tokio::test]
    async fn test_mru_per_user_selection() {
        let (store, engine) = engine_with(4, FakeInspector::empty(4)).await;
        let now = Utc::now();

        // alice used device 2 an hour ago and device 3 half an hour ago.
        store
            .record_usage(&UsageRecord::new(
                owner("alice"),
                2,
                now - Duration::hours(2),
                now - Duration::hours(1),
                LeaseKind::Run,
            ))
            .await
            .unwrap();
        store
            .record_usage(&UsageRecord::new(
                owner("alice"),
                3,
                now - Duration::hours(1),
                now - Duration::minutes(30),
                LeaseKind::Run,
            ))
            .await
            .unwrap();

        let first = engine.allocate(&run_request("alice", 1), false).await.unwrap();
        assert_eq!(first, vec![3]);
        let second = engine.allocate(&run_request("alice", 1), false).await.unwrap();
        assert_eq!(second, vec![2]);
    }

    #[tokio::test]
    async fn test_out_of_band_exclusion_and_capacity_error() {
        let inspector = FakeInspector::empty(4);
        inspector.set_memory_used(1, 2048);
        inspector.add_process(1, 4242, "bob");
        let (_store, engine) = engine_with(4, inspector).await;

        let err = engine.allocate(&run_request("alice", 4), false).await.unwrap_err();
        assert_eq!(
            err,
            LeaseError::CapacityExhausted {
                requested: 4,
                available: 3,
                unreserved_in_use: 1
            }
        );

        let mut devices = engine.allocate(&run_request("alice", 3), false).await.unwrap();
        devices.sort_unstable();
        assert_eq!(devices, vec![0, 2, 3]);
    }

    #[tokio::test]
    async fn test_memory_exactly_at_threshold_is_not_out_of_band() {
        let inspector = FakeInspector::empty(2);
        inspector.set_memory_used(0, 1024);
        let (_store, engine) = engine_with(2, inspector).await;

        let devices = engine.allocate(&run_request("alice", 2), false).await.unwrap();
        assert_eq!(devices.len(), 2);
    }

    #[tokio::test]
    async fn test_force_ignores_out_of_band() {
        let inspector = FakeInspector::empty(2);
        inspector.set_memory_used(0, 8192);
        let (_store, engine) = engine_with(2, inspector).await;

        assert!(engine.allocate(&run_request("alice", 2), false).await.is_err());
        let devices = engine.allocate(&run_request("alice", 2), true).await.unwrap();
        assert_eq!(devices.len(), 2);
    }

    #[tokio::test]
    async fn test_specific_ids_conflict_reasons() {
        let inspector = FakeInspector::empty(4);
        inspector.set_memory_used(2, 4096);
        let (store, engine) = engine_with(4, inspector).await;

        store
            .put_slot(
                1,
                SlotState::Reserved(Reservation::run(owner("bob"), Utc::now(), None)),
            )
            .await;

        // Out of range: a distinct kind, not a conflict.
        let request =
            AllocationRequest::run(owner("alice"), AllocationTarget::Devices(vec![7]), None).unwrap();
        let err = engine.allocate(&request, false).await.unwrap_err();
        assert!(matches!(err, LeaseError::OutOfRange(_)));
        assert!(err.to_string().contains("out of range"));

        // Held by a live lease.
        let request =
            AllocationRequest::run(owner("alice"), AllocationTarget::Devices(vec![1]), None).unwrap();
        let err = engine.allocate(&request, false).await.unwrap_err();
        assert!(err.to_string().contains("reserved by bob"));

        // Out-of-band use.
        let request =
            AllocationRequest::run(owner("alice"), AllocationTarget::Devices(vec![2]), None).unwrap();
        let err = engine.allocate(&request, false).await.unwrap_err();
        assert!(matches!(err, LeaseError::UnauthorizedUsage(_)));

        // A free device still allocates.
        let request =
            AllocationRequest::run(owner("alice"), AllocationTarget::Devices(vec![0, 3]), None).unwrap();
        assert_eq!(engine.allocate(&request, false).await.unwrap(), vec![0, 3]);
    }

    #[tokio::test]
    async fn test_specific_ids_reclaim_stale_lease() {
        let (store, engine) = engine_with(2, FakeInspector::empty(2)).await;

        // A run lease whose heartbeat stopped 20 minutes ago.
        let mut stale = Reservation::run(owner("bob"), Utc::now() - Duration::minutes(40), None);
        stale.last_heartbeat = Some(Utc::now() - Duration::minutes(20));
        store.put_slot(0, SlotState::Reserved(stale)).await;

        let request =
            AllocationRequest::run(owner("alice"), AllocationTarget::Devices(vec![0]), None).unwrap();
        let devices = engine.allocate(&request, false).await.unwrap();
        assert_eq!(devices, vec![0]);

        // The stale lease released through the accounted path: bob has a
        // usage record for it.
        let records = store.usage_records().await;
        assert!(records
            .iter()
            .any(|record| record.owner.as_str() == "bob" && record.device_id == 0));
    }

    #[tokio::test]
    async fn test_heartbeat_timeout_reclaim_via_sweep() {
        let (store, engine) = engine_with(4, FakeInspector::empty(4)).await;

        let mut stale = Reservation::run(owner("alice"), Utc::now() - Duration::minutes(30), None);
        stale.last_heartbeat = Some(Utc::now() - Duration::minutes(20));
        store.put_slot(0, SlotState::Reserved(stale)).await;

        let reclaimed = engine.expiry_sweep().await.unwrap();
        assert_eq!(reclaimed, vec![0]);
        assert!(store.raw_slot(0).await.is_available());

        let records = store.usage_records().await;
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].owner.as_str(), "alice");
        assert_eq!(records[0].device_id, 0);
    }

    #[tokio::test]
    async fn test_sweep_reclaims_expired_manual() {
        let (store, engine) = engine_with(2, FakeInspector::empty(2)).await;

        let expired = Reservation::manual(
            owner("carol"),
            Utc::now() - Duration::hours(3),
            Duration::hours(1),
            None,
        );
        store.put_slot(1, SlotState::Reserved(expired)).await;

        let reclaimed = engine.expiry_sweep().await.unwrap();
        assert_eq!(reclaimed, vec![1]);
    }

    #[tokio::test]
    async fn test_sweep_is_idempotent() {
        let (store, engine) = engine_with(2, FakeInspector::empty(2)).await;

        let mut stale = Reservation::run(owner("alice"), Utc::now() - Duration::hours(1), None);
        stale.last_heartbeat = Some(Utc::now() - Duration::minutes(20));
        store.put_slot(0, SlotState::Reserved(stale)).await;

        assert_eq!(engine.expiry_sweep().await.unwrap(), vec![0]);
        // Second sweep: no additional writes, no new usage records.
        assert!(engine.expiry_sweep().await.unwrap().is_empty());
        assert_eq!(store.usage_records().await.len(), 1);
    }

    #[tokio::test]
    async fn test_sweep_leaves_live_leases_alone() {
        let (store, engine) = engine_with(2, FakeInspector::empty(2)).await;
        store
            .put_slot(
                0,
                SlotState::Reserved(Reservation::run(owner("alice"), Utc::now(), None)),
            )
            .await;
        assert!(engine.expiry_sweep().await.unwrap().is_empty());
        assert!(!store.raw_slot(0).await.is_available());
    }

    #[tokio::test]
    async fn test_allocate_then_release_restores_pool() {
        let (store, engine) = engine_with(3, FakeInspector::empty(3)).await;

        let devices = engine.allocate(&run_request("alice", 3), false).await.unwrap();
        let released = engine.release_devices(&owner("alice"), &devices).await.unwrap();
        assert_eq!(released.len(), 3);

        // Pool state equals pre-allocation, ignoring last_released stamps.
        for id in 0..3 {
            assert!(store.raw_slot(id).await.is_available());
        }
        // Each release wrote a matching usage record.
        assert_eq!(store.usage_records().await.len(), 3);
    }

    #[tokio::test]
    async fn test_release_all_manual_only_touches_manual() {
        let (store, engine) = engine_with(3, FakeInspector::empty(3)).await;
        let now = Utc::now();
        store
            .put_slot(
                0,
                SlotState::Reserved(Reservation::manual(owner("alice"), now, Duration::hours(1), None)),
            )
            .await;
        store
            .put_slot(1, SlotState::Reserved(Reservation::run(owner("alice"), now, None)))
            .await;
        store
            .put_slot(
                2,
                SlotState::Reserved(Reservation::manual(owner("bob"), now, Duration::hours(1), None)),
            )
            .await;

        let released = engine.release_all_manual(&owner("alice")).await.unwrap();
        assert_eq!(released, vec![0]);
        assert!(!store.raw_slot(1).await.is_available());
        assert!(!store.raw_slot(2).await.is_available());
    }

    #[tokio::test]
    async fn test_release_devices_rejects_foreign_lease() {
        let (store, engine) = engine_with(2, FakeInspector::empty(2)).await;
        store
            .put_slot(
                0,
                SlotState::Reserved(Reservation::run(owner("bob"), Utc::now(), None)),
            )
            .await;

        let err = engine.release_devices(&owner("alice"), &[0]).await.unwrap_err();
        assert!(err.to_string().contains("reserved by bob"));
        let err = engine.release_devices(&owner("alice"), &[1]).await.unwrap_err();
        assert!(err.to_string().contains("not reserved"));
    }

    #[tokio::test]
    async fn test_status_is_a_pure_reader() {
        let inspector = FakeInspector::empty(3);
        inspector.set_memory_used(2, 3000);
        inspector.add_process(2, 99, "mallory");
        let (store, engine) = engine_with(3, inspector).await;
        store
            .put_slot(
                0,
                SlotState::Reserved(Reservation::run(owner("alice"), Utc::now(), None)),
            )
            .await;

        let first = engine.status().await.unwrap();
        let second = engine.status().await.unwrap();
        assert_eq!(first, second);

        assert!(matches!(&first.slots[0], SlotView::Reserved { owner, .. } if owner == "alice"));
        assert!(matches!(&first.slots[1], SlotView::Available { .. }));
        assert!(
            matches!(&first.slots[2], SlotView::UnreservedInUse { owners, process_count, .. }
                if owners == &vec!["mallory".to_string()] && *process_count == 1)
        );
    }

    #[tokio::test]
    async fn test_heartbeat_outcomes() {
        let (store, engine) = engine_with(2, FakeInspector::empty(2)).await;
        store
            .put_slot(
                0,
                SlotState::Reserved(Reservation::run(owner("alice"), Utc::now(), None)),
            )
            .await;

        assert_eq!(
            engine.heartbeat(&owner("alice"), 0).await.unwrap(),
            HeartbeatOutcome::Refreshed
        );
        // Someone else's lease: silent skip.
        assert_eq!(
            engine.heartbeat(&owner("bob"), 0).await.unwrap(),
            HeartbeatOutcome::NotOurs
        );
        // Unreserved: lost.
        assert_eq!(engine.heartbeat(&owner("alice"), 1).await.unwrap(), HeartbeatOutcome::Lost);
    }

    #[tokio::test]
    async fn test_uninitialized_pool_surfaces() {
        let store = Arc::new(MemoryLeaseStore::new());
        let engine = AllocationEngine::new(store, Arc::new(FakeInspector::empty(0)), Settings::default());
        let err = engine.allocate(&run_request("alice", 1), false).await.unwrap_err();
        assert_eq!(err, LeaseError::PoolNotInitialized);
    }
}
