// /////////////////////////////////////////////////////////////////////////////
// GPU Lease Coordinator
// Copyright (c) 2025 Michael Gardner, A Bit of Help, Inc.
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! # In-Memory Lease Store
//!
//! A single-process `LeaseStore` holding everything behind one mutex. It
//! plays the same role for the store port that the fake inspector plays for
//! the device port: tests and store-less development run the full engine,
//! maintainer, and queue coordinator against it without a Redis server.
//!
//! The mutex makes every operation trivially atomic, which matches the
//! contract the Redis adapter provides through server-side scripts. The
//! allocation lock is still modeled faithfully (token, lease expiry,
//! bounded retries) so lock-discipline bugs show up in tests too.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use std::time::Instant;
use tokio::sync::Mutex;
use uuid::Uuid;

use gpulease_domain::{
    GpuProvider, LeaseError, LeaseStore, QueueEntry, RankedCandidate, Reservation, SlotState, UsageRecord,
};

const LOCK_LEASE: std::time::Duration = std::time::Duration::from_secs(10);
const LOCK_MAX_ATTEMPTS: u32 = 50;
const LOCK_RETRY_SLEEP: std::time::Duration = std::time::Duration::from_millis(10);

#[derive(Default)]
struct Inner {
    pool_count: Option<u32>,
    provider: Option<GpuProvider>,
    slots: HashMap<u32, SlotState>,
    lock: Option<(String, Instant)>,
    queue: HashMap<String, QueueEntry>,
    usage: Vec<UsageRecord>,
}

impl Inner {
    fn slot(&self, device_id: u32) -> SlotState {
        self.slots.get(&device_id).cloned().unwrap_or_else(SlotState::fresh)
    }

    fn lock_held(&self) -> bool {
        match &self.lock {
            Some((_, acquired)) => acquired.elapsed() < LOCK_LEASE,
            None => false,
        }
    }
}

/// Single-process store for tests and development; see the module docs.
pub struct MemoryLeaseStore {
    inner: Mutex<Inner>,
    retention: Duration,
}

impl MemoryLeaseStore {
    pub fn new() -> Self {
        Self::with_retention(Duration::days(90))
    }

    pub fn with_retention(retention: Duration) -> Self {
        MemoryLeaseStore {
            inner: Mutex::new(Inner::default()),
            retention,
        }
    }

    /// Test hook: read a slot without going through the port.
    pub async fn raw_slot(&self, device_id: u32) -> SlotState {
        self.inner.lock().await.slot(device_id)
    }

    /// Test hook: place a slot directly, bypassing the atomic operations.
    pub async fn put_slot(&self, device_id: u32, state: SlotState) {
        self.inner.lock().await.slots.insert(device_id, state);
    }

    /// Test hook: all recorded usage, oldest first.
    pub async fn usage_records(&self) -> Vec<UsageRecord> {
        let inner = self.inner.lock().await;
        let mut records = inner.usage.clone();
        records.sort_by_key(|r| r.ended_at);
        records
    }
}

impl Default for MemoryLeaseStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LeaseStore for MemoryLeaseStore {
    async fn pool_size(&self) -> Result<Option<u32>, LeaseError> {
        Ok(self.inner.lock().await.pool_count)
    }

    async fn initialize_pool(&self, count: u32, provider: GpuProvider) -> Result<(), LeaseError> {
        let mut inner = self.inner.lock().await;
        inner.pool_count = Some(count);
        inner.provider = Some(provider);
        inner.slots.clear();
        inner.queue.clear();
        inner.lock = None;
        Ok(())
    }

    async fn provider(&self) -> Result<GpuProvider, LeaseError> {
        let mut inner = self.inner.lock().await;
        if let Some(provider) = inner.provider {
            return Ok(provider);
        }
        if inner.pool_count.is_some() {
            // Pool predates the provider key: infer the legacy default.
            inner.provider = Some(GpuProvider::Nvidia);
            return Ok(GpuProvider::Nvidia);
        }
        Err(LeaseError::PoolNotInitialized)
    }

    async fn slot_state(&self, device_id: u32) -> Result<SlotState, LeaseError> {
        let state = self.inner.lock().await.slot(device_id);
        state.validate()?;
        Ok(state)
    }

    async fn all_slots(&self, pool_size: u32) -> Result<Vec<(u32, SlotState)>, LeaseError> {
        let inner = self.inner.lock().await;
        (0..pool_size)
            .map(|id| {
                let state = inner.slot(id);
                state.validate()?;
                Ok((id, state))
            })
            .collect()
    }

    async fn swap_slot(&self, device_id: u32, expected: &SlotState, next: &SlotState) -> Result<bool, LeaseError> {
        let mut inner = self.inner.lock().await;
        if inner.slot(device_id) != *expected {
            return Ok(false);
        }
        inner.slots.insert(device_id, next.clone());
        Ok(true)
    }

    async fn reserve_ranked(
        &self,
        candidates: &[RankedCandidate],
        needed: u32,
        allow_partial: bool,
        template: &Reservation,
    ) -> Result<Vec<u32>, LeaseError> {
        let mut inner = self.inner.lock().await;

        let chosen: Vec<u32> = candidates
            .iter()
            .filter(|candidate| inner.slot(candidate.device_id) == candidate.observed)
            .take(needed as usize)
            .map(|candidate| candidate.device_id)
            .collect();

        if !allow_partial && (chosen.len() as u32) < needed {
            return Err(LeaseError::DeviceConflict(format!(
                "only {} of {} candidate devices were still reservable",
                chosen.len(),
                needed
            )));
        }

        for id in &chosen {
            inner.slots.insert(*id, SlotState::Reserved(template.clone()));
        }
        Ok(chosen)
    }

    async fn reserve_exact(
        &self,
        candidates: &[RankedCandidate],
        template: &Reservation,
    ) -> Result<Vec<u32>, LeaseError> {
        let mut inner = self.inner.lock().await;

        for candidate in candidates {
            if inner.slot(candidate.device_id) != candidate.observed {
                return Err(LeaseError::DeviceConflict(format!(
                    "device {} changed state during allocation",
                    candidate.device_id
                )));
            }
        }
        let ids: Vec<u32> = candidates.iter().map(|c| c.device_id).collect();
        for id in &ids {
            inner.slots.insert(*id, SlotState::Reserved(template.clone()));
        }
        Ok(ids)
    }

    async fn acquire_allocation_lock(&self) -> Result<String, LeaseError> {
        for _ in 0..LOCK_MAX_ATTEMPTS {
            {
                let mut inner = self.inner.lock().await;
                if !inner.lock_held() {
                    let token = Uuid::new_v4().to_string();
                    inner.lock = Some((token.clone(), Instant::now()));
                    return Ok(token);
                }
            }
            tokio::time::sleep(LOCK_RETRY_SLEEP).await;
        }
        Err(LeaseError::LockUnavailable(format!(
            "gave up after {LOCK_MAX_ATTEMPTS} attempts"
        )))
    }

    async fn release_allocation_lock(&self, token: &str) -> Result<(), LeaseError> {
        let mut inner = self.inner.lock().await;
        if matches!(&inner.lock, Some((held, _)) if held == token) {
            inner.lock = None;
        }
        Ok(())
    }

    async fn enqueue(&self, entry: &QueueEntry) -> Result<(), LeaseError> {
        self.inner.lock().await.queue.insert(entry.id.clone(), entry.clone());
        Ok(())
    }

    async fn queue_entries(&self) -> Result<Vec<QueueEntry>, LeaseError> {
        let inner = self.inner.lock().await;
        let mut entries: Vec<QueueEntry> = inner.queue.values().cloned().collect();
        entries.sort_by(|a, b| {
            a.fcfs_score()
                .partial_cmp(&b.fcfs_score())
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.id.cmp(&b.id))
        });
        Ok(entries)
    }

    async fn queue_entry(&self, id: &str) -> Result<Option<QueueEntry>, LeaseError> {
        Ok(self.inner.lock().await.queue.get(id).cloned())
    }

    async fn update_queue_entry(&self, entry: &QueueEntry) -> Result<(), LeaseError> {
        self.inner.lock().await.queue.insert(entry.id.clone(), entry.clone());
        Ok(())
    }

    async fn remove_queue_entry(&self, id: &str) -> Result<(), LeaseError> {
        self.inner.lock().await.queue.remove(id);
        Ok(())
    }

    async fn record_usage(&self, record: &UsageRecord) -> Result<(), LeaseError> {
        let mut inner = self.inner.lock().await;
        inner.usage.push(record.clone());
        let horizon = Utc::now() - self.retention;
        inner.usage.retain(|r| r.ended_at >= horizon);
        Ok(())
    }

    async fn usage_since(&self, cutoff: DateTime<Utc>) -> Result<Vec<UsageRecord>, LeaseError> {
        let inner = self.inner.lock().await;
        let mut records: Vec<UsageRecord> = inner.usage.iter().filter(|r| r.ended_at >= cutoff).cloned().collect();
        records.sort_by_key(|r| r.ended_at);
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use gpulease_domain::{LeaseKind, Owner};

    fn owner(name: &str) -> Owner {
        Owner::new(name).unwrap()
    }

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    fn candidate(store_state: SlotState, device_id: u32) -> RankedCandidate {
        RankedCandidate {
            device_id,
            observed: store_state,
        }
    }

    #[tokio::test]
    async fn test_uninitialized_pool_reads_none() {
        let store = MemoryLeaseStore::new();
        assert_eq!(store.pool_size().await.unwrap(), None);
        assert!(matches!(store.provider().await, Err(LeaseError::PoolNotInitialized)));
    }

    #[tokio::test]
    async fn test_provider_migration_rule() {
        let store = MemoryLeaseStore::new();
        // Simulate a pool written before the provider key existed.
        store.inner.lock().await.pool_count = Some(4);
        assert_eq!(store.provider().await.unwrap(), GpuProvider::Nvidia);
    }

    #[tokio::test]
    async fn test_absent_slot_reads_fresh() {
        let store = MemoryLeaseStore::new();
        assert_eq!(store.slot_state(3).await.unwrap(), SlotState::fresh());
    }

    #[tokio::test]
    async fn test_swap_slot_is_compare_and_swap() {
        let store = MemoryLeaseStore::new();
        let reserved = SlotState::Reserved(Reservation::run(owner("alice"), at(100), None));

        // Expected state matches (fresh) -> swap succeeds.
        assert!(store.swap_slot(0, &SlotState::fresh(), &reserved).await.unwrap());
        // Stale expectation -> no write.
        assert!(!store
            .swap_slot(0, &SlotState::fresh(), &SlotState::released_at(at(200)))
            .await
            .unwrap());
        assert_eq!(store.raw_slot(0).await, reserved);
    }

    #[tokio::test]
    async fn test_reserve_ranked_respects_order_and_count() {
        let store = MemoryLeaseStore::new();
        store.initialize_pool(4, GpuProvider::Fake).await.unwrap();
        let template = Reservation::run(owner("alice"), at(100), None);

        let candidates = vec![
            candidate(SlotState::fresh(), 2),
            candidate(SlotState::fresh(), 0),
            candidate(SlotState::fresh(), 1),
        ];
        let chosen = store.reserve_ranked(&candidates, 2, false, &template).await.unwrap();
        assert_eq!(chosen, vec![2, 0]);
        assert!(store.raw_slot(1).await.is_available());
    }

    #[tokio::test]
    async fn test_reserve_ranked_skips_changed_candidates() {
        let store = MemoryLeaseStore::new();
        store.initialize_pool(4, GpuProvider::Fake).await.unwrap();
        let template = Reservation::run(owner("alice"), at(100), None);

        // Candidate 0 claims to be fresh but was reserved underneath.
        store
            .put_slot(0, SlotState::Reserved(Reservation::run(owner("bob"), at(50), None)))
            .await;

        let candidates = vec![candidate(SlotState::fresh(), 0), candidate(SlotState::fresh(), 1)];
        let chosen = store.reserve_ranked(&candidates, 1, false, &template).await.unwrap();
        assert_eq!(chosen, vec![1]);
    }

    #[tokio::test]
    async fn test_reserve_ranked_all_or_nothing_without_partial() {
        let store = MemoryLeaseStore::new();
        store.initialize_pool(2, GpuProvider::Fake).await.unwrap();
        store
            .put_slot(0, SlotState::Reserved(Reservation::run(owner("bob"), at(50), None)))
            .await;

        let template = Reservation::run(owner("alice"), at(100), None);
        let candidates = vec![candidate(SlotState::fresh(), 0), candidate(SlotState::fresh(), 1)];

        let err = store.reserve_ranked(&candidates, 2, false, &template).await.unwrap_err();
        assert!(matches!(err, LeaseError::DeviceConflict(_)));
        // Nothing was written.
        assert!(store.raw_slot(1).await.is_available());

        // Partial mode reserves what survived.
        let chosen = store.reserve_ranked(&candidates, 2, true, &template).await.unwrap();
        assert_eq!(chosen, vec![1]);
    }

    #[tokio::test]
    async fn test_reserve_exact_names_conflicting_device() {
        let store = MemoryLeaseStore::new();
        store.initialize_pool(2, GpuProvider::Fake).await.unwrap();
        store
            .put_slot(1, SlotState::Reserved(Reservation::run(owner("bob"), at(50), None)))
            .await;

        let template = Reservation::run(owner("alice"), at(100), None);
        let candidates = vec![candidate(SlotState::fresh(), 0), candidate(SlotState::fresh(), 1)];
        let err = store.reserve_exact(&candidates, &template).await.unwrap_err();
        assert!(err.to_string().contains("device 1"));
        // All-or-nothing: device 0 untouched.
        assert!(store.raw_slot(0).await.is_available());
    }

    #[tokio::test]
    async fn test_allocation_lock_excludes_second_holder() {
        let store = MemoryLeaseStore::new();
        let token = store.acquire_allocation_lock().await.unwrap();

        // A second acquisition must not succeed while the lock is held.
        let second = tokio::time::timeout(std::time::Duration::from_millis(100), store.acquire_allocation_lock()).await;
        assert!(second.is_err() || second.unwrap().is_err());

        store.release_allocation_lock(&token).await.unwrap();
        let token2 = store.acquire_allocation_lock().await.unwrap();
        assert_ne!(token, token2);
    }

    #[tokio::test]
    async fn test_release_with_wrong_token_is_noop() {
        let store = MemoryLeaseStore::new();
        let token = store.acquire_allocation_lock().await.unwrap();
        store.release_allocation_lock("not-the-token").await.unwrap();
        // Still held by the original token.
        assert!(store.inner.lock().await.lock_held());
        store.release_allocation_lock(&token).await.unwrap();
        assert!(!store.inner.lock().await.lock_held());
    }

    #[tokio::test]
    async fn test_queue_is_fcfs_ordered() {
        let store = MemoryLeaseStore::new();
        let request = gpulease_domain::AllocationRequest::run(
            owner("alice"),
            gpulease_domain::AllocationTarget::Count(1),
            None,
        )
        .unwrap();

        let second = QueueEntry::new(request.clone(), at(200), None);
        let first = QueueEntry::new(request, at(100), None);
        store.enqueue(&second).await.unwrap();
        store.enqueue(&first).await.unwrap();

        let entries = store.queue_entries().await.unwrap();
        assert_eq!(entries[0].id, first.id);
        assert_eq!(entries[1].id, second.id);
    }

    #[tokio::test]
    async fn test_usage_since_filters_and_sorts() {
        let store = MemoryLeaseStore::new();
        let make = |end: i64| UsageRecord::new(owner("alice"), 0, at(end - 100), at(end), LeaseKind::Run);
        // Recent records, out of order.
        let now = Utc::now().timestamp();
        store.record_usage(&make(now - 50)).await.unwrap();
        store.record_usage(&make(now - 500)).await.unwrap();
        store.record_usage(&make(now - 5)).await.unwrap();

        let records = store.usage_since(at(now - 100)).await.unwrap();
        assert_eq!(records.len(), 2);
        assert!(records[0].ended_at < records[1].ended_at);
    }

    #[tokio::test]
    async fn test_usage_retention_trims_old_records() {
        let store = MemoryLeaseStore::with_retention(Duration::days(1));
        let old = UsageRecord::new(
            owner("alice"),
            0,
            Utc::now() - Duration::days(3),
            Utc::now() - Duration::days(2),
            LeaseKind::Run,
        );
        let fresh = UsageRecord::new(owner("alice"), 1, Utc::now() - Duration::hours(2), Utc::now(), LeaseKind::Run);
        store.record_usage(&old).await.unwrap();
        store.record_usage(&fresh).await.unwrap();

        let records = store.usage_records().await;
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].device_id, 1);
    }
}
