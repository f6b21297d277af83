// /////////////////////////////////////////////////////////////////////////////
// GPU Lease Coordinator
// Copyright (c) 2025 Michael Gardner, A Bit of Help, Inc.
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! # Redis Lease Store
//!
//! The production `LeaseStore`: every entity lives in Redis as JSON under
//! the key layout below, and the atomic primitives run as server-side Lua
//! scripts so no other writer can interleave with them.
//!
//! ## Key layout
//!
//! ```text
//! gpulease:pool:count        integer, number of slots
//! gpulease:pool:provider     vendor family chosen at initialization
//! gpulease:slot:<id>         JSON SlotState (absent == fresh available)
//! gpulease:alloc:lock        allocation mutex (holder token, PX lease)
//! gpulease:queue:order       zset keyed by enqueue instant
//! gpulease:queue:entry:<id>  JSON QueueEntry
//! gpulease:usage:sorted      zset keyed by end instant, JSON members
//! usage.history:<ts>:<user>:<id>   legacy per-record keys, migrated on
//!                                  first read
//! ```
//!
//! ## Compare-and-swap discipline
//!
//! Slot writes outside the reserve scripts (heartbeats, sweep releases,
//! owner releases) are a CAS on the serialized slot state: the adapter
//! re-reads the raw stored bytes, checks they still *decode* to the state
//! the caller observed, and then swaps against those exact bytes in a
//! script. Comparing decoded states first means records written by the
//! earlier implementation (integer epoch times, different field order)
//! still CAS correctly; comparing raw bytes in the script keeps the swap
//! atomic.
//!
//! ## Allocation lock
//!
//! `SET NX PX` with a per-acquisition token and a ~10 s lease, released by
//! a compare-token script. Acquisition retries on exponential backoff with
//! jitter, bounded; exhaustion surfaces `LockUnavailable`. The lease is a
//! safety net against a crashed holder, not a license to hold the lock
//! across long operations.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use rand::Rng;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Script};
use std::sync::atomic::{AtomicBool, Ordering};
use uuid::Uuid;

use gpulease_domain::{
    GpuProvider, LeaseError, LeaseStore, QueueEntry, RankedCandidate, Reservation, SlotState, UsageRecord,
};

use crate::infrastructure::config::Settings;

/// Logical key paths in the store.
mod keys {
    pub const POOL_COUNT: &str = "gpulease:pool:count";
    pub const POOL_PROVIDER: &str = "gpulease:pool:provider";
    pub const ALLOC_LOCK: &str = "gpulease:alloc:lock";
    pub const QUEUE_ORDER: &str = "gpulease:queue:order";
    pub const USAGE_SORTED: &str = "gpulease:usage:sorted";

    pub const SLOT_PATTERN: &str = "gpulease:slot:*";
    pub const QUEUE_ENTRY_PATTERN: &str = "gpulease:queue:entry:*";
    /// Schema used by the earlier implementation: one key per record.
    pub const LEGACY_USAGE_PATTERN: &str = "usage.history:*";

    pub fn slot(device_id: u32) -> String {
        format!("gpulease:slot:{device_id}")
    }

    pub fn queue_entry(id: &str) -> String {
        format!("gpulease:queue:entry:{id}")
    }
}

const LOCK_LEASE_MS: u64 = 10_000;
const LOCK_MAX_ATTEMPTS: u32 = 10;
const LOCK_BACKOFF_BASE_MS: u64 = 50;
const LOCK_BACKOFF_CAP_MS: u64 = 2_000;

/// CAS one slot: expected raw bytes ('' means absent), replacement JSON.
const SWAP_SLOT_LUA: &str = r#"
local current = redis.call('GET', KEYS[1])
local expected = ARGV[1]
local matches
if expected == '' then
    matches = (current == false)
else
    matches = (current ~= false and current == expected)
end
if matches then
    redis.call('SET', KEYS[1], ARGV[2])
    return 1
end
return 0
"#;

/// Reserve up to ARGV[1] of KEYS in order, each guarded by its expected raw
/// bytes (ARGV[3+i]); writes the template (ARGV[3]) for the chosen slots.
/// Returns {1, i...} on success, {0, survivors} when not partial and short.
const RESERVE_RANKED_LUA: &str = r#"
local needed = tonumber(ARGV[1])
local allow_partial = ARGV[2] == '1'
local template = ARGV[3]
local chosen = {}
for i = 1, #KEYS do
    if #chosen >= needed then break end
    local current = redis.call('GET', KEYS[i])
    local expected = ARGV[3 + i]
    local matches
    if expected == '' then
        matches = (current == false)
    else
        matches = (current ~= false and current == expected)
    end
    if matches then
        chosen[#chosen + 1] = i
    end
end
if (not allow_partial) and #chosen < needed then
    return {0, #chosen}
end
local result = {1}
for _, i in ipairs(chosen) do
    redis.call('SET', KEYS[i], template)
    result[#result + 1] = i
end
return result
"#;

/// Reserve exactly KEYS, all-or-nothing. Returns {1} or {0, first_conflict}.
const RESERVE_EXACT_LUA: &str = r#"
local template = ARGV[1]
for i = 1, #KEYS do
    local current = redis.call('GET', KEYS[i])
    local expected = ARGV[1 + i]
    local matches
    if expected == '' then
        matches = (current == false)
    else
        matches = (current ~= false and current == expected)
    end
    if not matches then
        return {0, i}
    end
end
for i = 1, #KEYS do
    redis.call('SET', KEYS[i], template)
end
return {1}
"#;

/// Delete the lock only if we still hold it.
const RELEASE_LOCK_LUA: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
    return redis.call('DEL', KEYS[1])
end
return 0
"#;

/// Production store over a shared Redis instance; see the module docs.
pub struct RedisLeaseStore {
    manager: ConnectionManager,
    retention: Duration,
    swap_slot_script: Script,
    reserve_ranked_script: Script,
    reserve_exact_script: Script,
    release_lock_script: Script,
    legacy_usage_migrated: AtomicBool,
}

impl RedisLeaseStore {
    /// Connects to the store named by the settings.
    pub async fn connect(settings: &Settings) -> Result<Self, LeaseError> {
        let client = redis::Client::open(settings.redis_url())
            .map_err(|e| LeaseError::StoreError(format!("invalid redis url: {e}")))?;
        let manager = ConnectionManager::new(client)
            .await
            .map_err(|e| LeaseError::StoreError(format!("cannot reach redis at {}: {e}", settings.redis_url())))?;
        Ok(RedisLeaseStore {
            manager,
            retention: settings.usage_retention(),
            swap_slot_script: Script::new(SWAP_SLOT_LUA),
            reserve_ranked_script: Script::new(RESERVE_RANKED_LUA),
            reserve_exact_script: Script::new(RESERVE_EXACT_LUA),
            release_lock_script: Script::new(RELEASE_LOCK_LUA),
            legacy_usage_migrated: AtomicBool::new(false),
        })
    }

    fn conn(&self) -> ConnectionManager {
        self.manager.clone()
    }

    fn store_err(context: &str, err: redis::RedisError) -> LeaseError {
        LeaseError::StoreError(format!("{context}: {err}"))
    }

    fn decode_slot(device_id: u32, raw: Option<&str>) -> Result<SlotState, LeaseError> {
        let Some(text) = raw else {
            return Ok(SlotState::fresh());
        };
        let state: SlotState = serde_json::from_str(text)
            .map_err(|e| LeaseError::StoreCorrupt(format!("slot {device_id} does not deserialize: {e}")))?;
        state
            .validate()
            .map_err(|e| LeaseError::StoreCorrupt(format!("slot {device_id}: {e}")))?;
        Ok(state)
    }

    fn encode<T: serde::Serialize>(value: &T) -> Result<String, LeaseError> {
        serde_json::to_string(value).map_err(|e| LeaseError::SerializationError(e.to_string()))
    }

    /// Re-reads the raw bytes for each candidate and keeps those that still
    /// decode to the observed state, pairing them with the exact bytes the
    /// reserve script must CAS against ('' encodes an absent key).
    async fn surviving_candidates(
        &self,
        candidates: &[RankedCandidate],
    ) -> Result<Vec<(u32, String)>, LeaseError> {
        let mut conn = self.conn();
        let mut survivors = Vec::with_capacity(candidates.len());
        for candidate in candidates {
            let raw: Option<String> = conn
                .get(keys::slot(candidate.device_id))
                .await
                .map_err(|e| Self::store_err("reading slot for reservation", e))?;
            let current = Self::decode_slot(candidate.device_id, raw.as_deref())?;
            if current == candidate.observed {
                survivors.push((candidate.device_id, raw.unwrap_or_default()));
            }
        }
        Ok(survivors)
    }

    async fn delete_matching(&self, pattern: &str) -> Result<(), LeaseError> {
        let mut conn = self.conn();
        let matched: Vec<String> = {
            let mut iter = conn
                .scan_match::<_, String>(pattern)
                .await
                .map_err(|e| Self::store_err("scanning keys", e))?;
            let mut matched = Vec::new();
            while let Some(key) = iter.next_item().await {
                matched.push(key);
            }
            matched
        };
        if !matched.is_empty() {
            let mut conn = self.conn();
            conn.del::<_, ()>(matched)
                .await
                .map_err(|e| Self::store_err("deleting keys", e))?;
        }
        Ok(())
    }

    /// Migrates any records still in the legacy one-key-per-record schema
    /// into the sorted set. Runs once per process, on the first read.
    async fn migrate_legacy_usage(&self) -> Result<(), LeaseError> {
        if self.legacy_usage_migrated.load(Ordering::SeqCst) {
            return Ok(());
        }

        let mut conn = self.conn();
        let legacy_keys: Vec<String> = {
            let mut iter = conn
                .scan_match::<_, String>(keys::LEGACY_USAGE_PATTERN)
                .await
                .map_err(|e| Self::store_err("scanning legacy usage keys", e))?;
            let mut found = Vec::new();
            while let Some(key) = iter.next_item().await {
                found.push(key);
            }
            found
        };

        let mut conn = self.conn();
        for key in legacy_keys {
            let raw: Option<String> = conn
                .get(&key)
                .await
                .map_err(|e| Self::store_err("reading legacy usage record", e))?;
            let Some(text) = raw else { continue };
            match serde_json::from_str::<UsageRecord>(&text) {
                Ok(record) => {
                    let score = record.ended_at.timestamp_micros() as f64 / 1_000_000.0;
                    let member = Self::encode(&record)?;
                    conn.zadd::<_, _, _, ()>(keys::USAGE_SORTED, member, score)
                        .await
                        .map_err(|e| Self::store_err("migrating legacy usage record", e))?;
                    conn.del::<_, ()>(&key)
                        .await
                        .map_err(|e| Self::store_err("deleting migrated legacy record", e))?;
                }
                Err(e) => {
                    // One unreadable historical record must not block reporting.
                    tracing::warn!("skipping unreadable legacy usage record {key}: {e}");
                }
            }
        }

        self.legacy_usage_migrated.store(true, Ordering::SeqCst);
        Ok(())
    }
}

#[async_trait]
impl LeaseStore for RedisLeaseStore {
    async fn pool_size(&self) -> Result<Option<u32>, LeaseError> {
        let mut conn = self.conn();
        let raw: Option<String> = conn
            .get(keys::POOL_COUNT)
            .await
            .map_err(|e| Self::store_err("reading pool size", e))?;
        raw.map(|text| {
            text.parse::<u32>()
                .map_err(|_| LeaseError::StoreCorrupt(format!("pool count is not an integer: '{text}'")))
        })
        .transpose()
    }

    async fn initialize_pool(&self, count: u32, provider: GpuProvider) -> Result<(), LeaseError> {
        self.delete_matching(keys::SLOT_PATTERN).await?;
        self.delete_matching(keys::QUEUE_ENTRY_PATTERN).await?;

        let mut conn = self.conn();
        conn.del::<_, ()>((keys::QUEUE_ORDER, keys::ALLOC_LOCK))
            .await
            .map_err(|e| Self::store_err("clearing queue and lock", e))?;
        conn.set::<_, _, ()>(keys::POOL_COUNT, count)
            .await
            .map_err(|e| Self::store_err("writing pool size", e))?;
        conn.set::<_, _, ()>(keys::POOL_PROVIDER, provider.to_string())
            .await
            .map_err(|e| Self::store_err("writing pool provider", e))?;
        Ok(())
    }

    async fn provider(&self) -> Result<GpuProvider, LeaseError> {
        let mut conn = self.conn();
        let raw: Option<String> = conn
            .get(keys::POOL_PROVIDER)
            .await
            .map_err(|e| Self::store_err("reading pool provider", e))?;
        if let Some(text) = raw {
            return text
                .parse::<GpuProvider>()
                .map_err(|_| LeaseError::StoreCorrupt(format!("unknown provider in store: '{text}'")));
        }

        // Pools written before the provider key existed default to nvidia;
        // record the inference so every process agrees from here on.
        if self.pool_size().await?.is_some() {
            conn.set::<_, _, ()>(keys::POOL_PROVIDER, GpuProvider::Nvidia.to_string())
                .await
                .map_err(|e| Self::store_err("writing inferred provider", e))?;
            return Ok(GpuProvider::Nvidia);
        }
        Err(LeaseError::PoolNotInitialized)
    }

    async fn slot_state(&self, device_id: u32) -> Result<SlotState, LeaseError> {
        let mut conn = self.conn();
        let raw: Option<String> = conn
            .get(keys::slot(device_id))
            .await
            .map_err(|e| Self::store_err("reading slot", e))?;
        Self::decode_slot(device_id, raw.as_deref())
    }

    async fn all_slots(&self, pool_size: u32) -> Result<Vec<(u32, SlotState)>, LeaseError> {
        if pool_size == 0 {
            return Ok(Vec::new());
        }
        let slot_keys: Vec<String> = (0..pool_size).map(keys::slot).collect();
        let mut conn = self.conn();
        let raw: Vec<Option<String>> = conn
            .mget(&slot_keys)
            .await
            .map_err(|e| Self::store_err("reading slots", e))?;
        raw.into_iter()
            .enumerate()
            .map(|(id, value)| {
                let id = id as u32;
                Ok((id, Self::decode_slot(id, value.as_deref())?))
            })
            .collect()
    }

    async fn swap_slot(&self, device_id: u32, expected: &SlotState, next: &SlotState) -> Result<bool, LeaseError> {
        // Semantic pre-check against the decoded state, byte-level CAS in
        // the script; see the module docs.
        let mut conn = self.conn();
        let raw: Option<String> = conn
            .get(keys::slot(device_id))
            .await
            .map_err(|e| Self::store_err("reading slot for swap", e))?;
        let current = Self::decode_slot(device_id, raw.as_deref())?;
        if current != *expected {
            return Ok(false);
        }

        let swapped: i64 = self
            .swap_slot_script
            .key(keys::slot(device_id))
            .arg(raw.unwrap_or_default())
            .arg(Self::encode(next)?)
            .invoke_async(&mut self.conn())
            .await
            .map_err(|e| Self::store_err("swapping slot", e))?;
        Ok(swapped == 1)
    }

    async fn reserve_ranked(
        &self,
        candidates: &[RankedCandidate],
        needed: u32,
        allow_partial: bool,
        template: &Reservation,
    ) -> Result<Vec<u32>, LeaseError> {
        let survivors = self.surviving_candidates(candidates).await?;
        if !allow_partial && (survivors.len() as u32) < needed {
            return Err(LeaseError::DeviceConflict(format!(
                "only {} of {} candidate devices were still reservable",
                survivors.len(),
                needed
            )));
        }

        let mut invocation = self.reserve_ranked_script.prepare_invoke();
        invocation
            .arg(needed)
            .arg(if allow_partial { "1" } else { "0" })
            .arg(Self::encode(&SlotState::Reserved(template.clone()))?);
        for (device_id, _) in &survivors {
            invocation.key(keys::slot(*device_id));
        }
        for (_, raw) in &survivors {
            invocation.arg(raw);
        }

        let reply: Vec<i64> = invocation
            .invoke_async(&mut self.conn())
            .await
            .map_err(|e| Self::store_err("atomic ranked reserve", e))?;

        match reply.split_first() {
            Some((1, chosen)) => Ok(chosen
                .iter()
                .map(|index| survivors[(*index - 1) as usize].0)
                .collect()),
            Some((0, rest)) => Err(LeaseError::DeviceConflict(format!(
                "only {} of {needed} candidate devices were still reservable",
                rest.first().copied().unwrap_or(0)
            ))),
            _ => Err(LeaseError::StoreError("unexpected reserve script reply".to_string())),
        }
    }

    async fn reserve_exact(
        &self,
        candidates: &[RankedCandidate],
        template: &Reservation,
    ) -> Result<Vec<u32>, LeaseError> {
        let survivors = self.surviving_candidates(candidates).await?;
        if survivors.len() != candidates.len() {
            let survivor_ids: Vec<u32> = survivors.iter().map(|(id, _)| *id).collect();
            let lost = candidates
                .iter()
                .map(|c| c.device_id)
                .find(|id| !survivor_ids.contains(id))
                .unwrap_or_default();
            return Err(LeaseError::DeviceConflict(format!(
                "device {lost} changed state during allocation"
            )));
        }

        let mut invocation = self.reserve_exact_script.prepare_invoke();
        invocation.arg(Self::encode(&SlotState::Reserved(template.clone()))?);
        for (device_id, _) in &survivors {
            invocation.key(keys::slot(*device_id));
        }
        for (_, raw) in &survivors {
            invocation.arg(raw);
        }

        let reply: Vec<i64> = invocation
            .invoke_async(&mut self.conn())
            .await
            .map_err(|e| Self::store_err("atomic exact reserve", e))?;

        match reply.split_first() {
            Some((1, _)) => Ok(survivors.into_iter().map(|(id, _)| id).collect()),
            Some((0, rest)) => {
                let index = rest.first().copied().unwrap_or(1) as usize;
                let device_id = survivors.get(index.saturating_sub(1)).map(|(id, _)| *id).unwrap_or_default();
                Err(LeaseError::DeviceConflict(format!(
                    "device {device_id} changed state during allocation"
                )))
            }
            _ => Err(LeaseError::StoreError("unexpected reserve script reply".to_string())),
        }
    }

    async fn acquire_allocation_lock(&self) -> Result<String, LeaseError> {
        let token = Uuid::new_v4().to_string();
        let mut conn = self.conn();

        for attempt in 0..LOCK_MAX_ATTEMPTS {
            let acquired: Option<String> = redis::cmd("SET")
                .arg(keys::ALLOC_LOCK)
                .arg(&token)
                .arg("NX")
                .arg("PX")
                .arg(LOCK_LEASE_MS)
                .query_async(&mut conn)
                .await
                .map_err(|e| Self::store_err("acquiring allocation lock", e))?;
            if acquired.is_some() {
                return Ok(token);
            }

            // Exponential backoff with jitter so colliding allocators spread out.
            let backoff = (LOCK_BACKOFF_BASE_MS << attempt).min(LOCK_BACKOFF_CAP_MS);
            let jitter = rand::rng().random_range(0..=backoff / 2);
            tokio::time::sleep(std::time::Duration::from_millis(backoff + jitter)).await;
        }

        Err(LeaseError::LockUnavailable(format!(
            "gave up after {LOCK_MAX_ATTEMPTS} attempts"
        )))
    }

    async fn release_allocation_lock(&self, token: &str) -> Result<(), LeaseError> {
        let _: i64 = self
            .release_lock_script
            .key(keys::ALLOC_LOCK)
            .arg(token)
            .invoke_async(&mut self.conn())
            .await
            .map_err(|e| Self::store_err("releasing allocation lock", e))?;
        Ok(())
    }

    async fn enqueue(&self, entry: &QueueEntry) -> Result<(), LeaseError> {
        let mut conn = self.conn();
        conn.set::<_, _, ()>(keys::queue_entry(&entry.id), Self::encode(entry)?)
            .await
            .map_err(|e| Self::store_err("writing queue entry", e))?;
        conn.zadd::<_, _, _, ()>(keys::QUEUE_ORDER, &entry.id, entry.fcfs_score())
            .await
            .map_err(|e| Self::store_err("adding queue entry to order", e))?;
        Ok(())
    }

    async fn queue_entries(&self) -> Result<Vec<QueueEntry>, LeaseError> {
        let mut conn = self.conn();
        let ids: Vec<String> = conn
            .zrange(keys::QUEUE_ORDER, 0, -1)
            .await
            .map_err(|e| Self::store_err("reading queue order", e))?;

        let mut entries = Vec::with_capacity(ids.len());
        for id in ids {
            let raw: Option<String> = conn
                .get(keys::queue_entry(&id))
                .await
                .map_err(|e| Self::store_err("reading queue entry", e))?;
            match raw {
                None => {
                    // Order references an entry that no longer exists; heal.
                    tracing::debug!("removing dangling queue order member {id}");
                    conn.zrem::<_, _, ()>(keys::QUEUE_ORDER, &id)
                        .await
                        .map_err(|e| Self::store_err("removing dangling queue member", e))?;
                }
                Some(text) => match serde_json::from_str::<QueueEntry>(&text) {
                    Ok(entry) => entries.push(entry),
                    Err(e) => {
                        // One bad entry must not wedge the queue.
                        tracing::warn!("skipping unreadable queue entry {id}: {e}");
                    }
                },
            }
        }
        Ok(entries)
    }

    async fn queue_entry(&self, id: &str) -> Result<Option<QueueEntry>, LeaseError> {
        let mut conn = self.conn();
        let raw: Option<String> = conn
            .get(keys::queue_entry(id))
            .await
            .map_err(|e| Self::store_err("reading queue entry", e))?;
        raw.map(|text| {
            serde_json::from_str(&text)
                .map_err(|e| LeaseError::StoreCorrupt(format!("queue entry {id} does not deserialize: {e}")))
        })
        .transpose()
    }

    async fn update_queue_entry(&self, entry: &QueueEntry) -> Result<(), LeaseError> {
        let mut conn = self.conn();
        conn.set::<_, _, ()>(keys::queue_entry(&entry.id), Self::encode(entry)?)
            .await
            .map_err(|e| Self::store_err("updating queue entry", e))
    }

    async fn remove_queue_entry(&self, id: &str) -> Result<(), LeaseError> {
        let mut conn = self.conn();
        conn.del::<_, ()>(keys::queue_entry(id))
            .await
            .map_err(|e| Self::store_err("deleting queue entry", e))?;
        conn.zrem::<_, _, ()>(keys::QUEUE_ORDER, id)
            .await
            .map_err(|e| Self::store_err("removing queue entry from order", e))?;
        Ok(())
    }

    async fn record_usage(&self, record: &UsageRecord) -> Result<(), LeaseError> {
        let mut conn = self.conn();
        let score = record.ended_at.timestamp_micros() as f64 / 1_000_000.0;
        conn.zadd::<_, _, _, ()>(keys::USAGE_SORTED, Self::encode(record)?, score)
            .await
            .map_err(|e| Self::store_err("appending usage record", e))?;

        let horizon = (Utc::now() - self.retention).timestamp_micros() as f64 / 1_000_000.0;
        conn.zrembyscore::<_, _, _, ()>(keys::USAGE_SORTED, f64::NEG_INFINITY, horizon)
            .await
            .map_err(|e| Self::store_err("trimming usage records", e))?;
        Ok(())
    }

    async fn usage_since(&self, cutoff: DateTime<Utc>) -> Result<Vec<UsageRecord>, LeaseError> {
        self.migrate_legacy_usage().await?;

        let mut conn = self.conn();
        let min = cutoff.timestamp_micros() as f64 / 1_000_000.0;
        let members: Vec<String> = conn
            .zrangebyscore(keys::USAGE_SORTED, min, f64::INFINITY)
            .await
            .map_err(|e| Self::store_err("reading usage records", e))?;

        let mut records = Vec::with_capacity(members.len());
        for member in members {
            match serde_json::from_str::<UsageRecord>(&member) {
                Ok(record) => records.push(record),
                Err(e) => tracing::warn!("skipping unreadable usage record: {e}"),
            }
        }
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use gpulease_domain::Owner;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    #[test]
    fn test_key_layout() {
        assert_eq!(keys::slot(3), "gpulease:slot:3");
        assert_eq!(keys::queue_entry("abc"), "gpulease:queue:entry:abc");
        assert!(keys::LEGACY_USAGE_PATTERN.starts_with("usage.history:"));
    }

    #[test]
    fn test_decode_absent_slot_is_fresh() {
        assert_eq!(RedisLeaseStore::decode_slot(0, None).unwrap(), SlotState::fresh());
    }

    #[test]
    fn test_decode_corrupt_slot_surfaces() {
        let err = RedisLeaseStore::decode_slot(2, Some("{not json")).unwrap_err();
        assert!(matches!(err, LeaseError::StoreCorrupt(_)));
        assert!(err.to_string().contains("slot 2"));
    }

    #[test]
    fn test_decode_invalid_invariants_surface_as_corrupt() {
        // A run lease without a heartbeat violates the slot invariants.
        let bad = r#"{"status":"reserved","owner":"alice","kind":"run","started_at":1700000000}"#;
        let err = RedisLeaseStore::decode_slot(1, Some(bad)).unwrap_err();
        assert!(matches!(err, LeaseError::StoreCorrupt(_)));
    }

    #[test]
    fn test_decode_accepts_legacy_epoch_times() {
        let legacy = r#"{"status":"reserved","owner":"alice","kind":"manual","started_at":1700000000,"expires_at":1700007200}"#;
        let state = RedisLeaseStore::decode_slot(0, Some(legacy)).unwrap();
        let reservation = state.reservation().unwrap();
        assert_eq!(reservation.expires_at, Some(at(1_700_007_200)));
    }

    #[test]
    fn test_encoded_slot_roundtrips_through_decode() {
        let state = SlotState::Reserved(Reservation::manual(
            Owner::new("alice").unwrap(),
            at(1_700_000_000),
            Duration::hours(4),
            Some("tuning".into()),
        ));
        let encoded = RedisLeaseStore::encode(&state).unwrap();
        assert_eq!(RedisLeaseStore::decode_slot(0, Some(&encoded)).unwrap(), state);
    }

    #[test]
    fn test_backoff_schedule_is_bounded() {
        let mut total = 0u64;
        for attempt in 0..LOCK_MAX_ATTEMPTS {
            let backoff = (LOCK_BACKOFF_BASE_MS << attempt).min(LOCK_BACKOFF_CAP_MS);
            assert!(backoff <= LOCK_BACKOFF_CAP_MS);
            total += backoff + backoff / 2;
        }
        // Worst case stays well under a minute so callers are not wedged.
        assert!(total < 60_000);
    }

    #[test]
    fn test_scripts_parse_as_lua_chunks() {
        // Cheap sanity: the scripts at least balance their control keywords.
        for script in [SWAP_SLOT_LUA, RESERVE_RANKED_LUA, RESERVE_EXACT_LUA, RELEASE_LOCK_LUA] {
            let opens = script.matches(" if ").count() + script.matches("\nif ").count();
            let ends = script.matches("end").count();
            assert!(ends >= opens, "unbalanced lua block in script");
            assert!(script.contains("redis.call"));
        }
    }
}
