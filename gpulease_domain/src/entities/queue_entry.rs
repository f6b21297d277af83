// /////////////////////////////////////////////////////////////////////////////
// GPU Lease Coordinator
// Copyright (c) 2025 Michael Gardner, A Bit of Help, Inc.
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! # Queue Entry
//!
//! A blocking allocation request that could not be satisfied immediately
//! becomes a queue entry. The queue is strictly first-come-first-served,
//! keyed by enqueue instant; only the head entry may consume newly-freed
//! slots, and it accumulates them greedily in `allocated` until the request
//! is complete.
//!
//! Entries carry their own heartbeat so a crashed waiter cannot block the
//! queue forever: an entry whose heartbeat goes stale is reaped and its
//! partially-held slots are returned to the pool.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::services::time_codec;
use crate::value_objects::allocation_request::AllocationRequest;

/// One waiter in the FCFS allocation queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueEntry {
    /// Unique entry identifier; also the value stamped into
    /// `partial_queue_id` on slots held by this waiter.
    pub id: String,
    pub request: AllocationRequest,
    /// FCFS ordering key.
    #[serde(with = "time_codec")]
    pub enqueued_at: DateTime<Utc>,
    #[serde(with = "time_codec")]
    pub last_heartbeat: DateTime<Utc>,
    /// Give-up deadline, if the caller bounded the wait.
    #[serde(default, with = "time_codec::optional", skip_serializing_if = "Option::is_none")]
    pub wait_deadline: Option<DateTime<Utc>>,
    /// Devices already partially allocated to this entry.
    #[serde(default)]
    pub allocated: Vec<u32>,
}

impl QueueEntry {
    pub fn new(request: AllocationRequest, now: DateTime<Utc>, wait_timeout: Option<Duration>) -> Self {
        QueueEntry {
            id: Uuid::new_v4().to_string(),
            request,
            enqueued_at: now,
            last_heartbeat: now,
            wait_deadline: wait_timeout.map(|timeout| now + timeout),
            allocated: Vec::new(),
        }
    }

    /// Devices still missing before this entry's request is complete.
    pub fn needed(&self) -> u32 {
        self.request
            .requested_count()
            .saturating_sub(self.allocated.len() as u32)
    }

    pub fn is_complete(&self) -> bool {
        self.needed() == 0
    }

    /// Whether the waiter has stopped heartbeating and should be reaped.
    pub fn is_stale(&self, now: DateTime<Utc>, timeout: Duration) -> bool {
        now - self.last_heartbeat > timeout
    }

    pub fn is_past_deadline(&self, now: DateTime<Utc>) -> bool {
        self.wait_deadline.map(|deadline| now > deadline).unwrap_or(false)
    }

    /// Score used in the store's ordered set (seconds since epoch, with
    /// sub-second precision so near-simultaneous enqueues stay ordered).
    pub fn fcfs_score(&self) -> f64 {
        self.enqueued_at.timestamp_micros() as f64 / 1_000_000.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value_objects::allocation_request::AllocationTarget;
    use crate::value_objects::owner::Owner;
    use chrono::TimeZone;

    fn request(count: u32) -> AllocationRequest {
        AllocationRequest::run(Owner::new("alice").unwrap(), AllocationTarget::Count(count), None).unwrap()
    }

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    #[test]
    fn test_needed_tracks_partial_allocation() {
        let mut entry = QueueEntry::new(request(3), at(0), None);
        assert_eq!(entry.needed(), 3);
        entry.allocated.push(1);
        assert_eq!(entry.needed(), 2);
        entry.allocated.extend([2, 3]);
        assert!(entry.is_complete());
    }

    #[test]
    fn test_staleness_uses_heartbeat_not_enqueue_time() {
        let mut entry = QueueEntry::new(request(1), at(0), None);
        entry.last_heartbeat = at(1_000);
        assert!(!entry.is_stale(at(1_060), Duration::minutes(2)));
        assert!(entry.is_stale(at(1_121), Duration::minutes(2)));
    }

    #[test]
    fn test_wait_deadline() {
        let entry = QueueEntry::new(request(1), at(0), Some(Duration::seconds(30)));
        assert!(!entry.is_past_deadline(at(30)));
        assert!(entry.is_past_deadline(at(31)));

        let unbounded = QueueEntry::new(request(1), at(0), None);
        assert!(!unbounded.is_past_deadline(at(1_000_000)));
    }

    #[test]
    fn test_fcfs_score_preserves_subsecond_order() {
        let earlier = QueueEntry {
            enqueued_at: Utc.timestamp_micros(1_700_000_000_250_000).single().unwrap(),
            ..QueueEntry::new(request(1), at(0), None)
        };
        let later = QueueEntry {
            enqueued_at: Utc.timestamp_micros(1_700_000_000_750_000).single().unwrap(),
            ..QueueEntry::new(request(1), at(0), None)
        };
        assert!(earlier.fcfs_score() < later.fcfs_score());
    }

    #[test]
    fn test_entry_ids_are_unique() {
        let a = QueueEntry::new(request(1), at(0), None);
        let b = QueueEntry::new(request(1), at(0), None);
        assert_ne!(a.id, b.id);
    }

    #[test]
    fn test_serde_roundtrip() {
        let mut entry = QueueEntry::new(request(2), at(1_700_000_000), Some(Duration::minutes(5)));
        entry.allocated.push(1);
        let json = serde_json::to_string(&entry).unwrap();
        let back: QueueEntry = serde_json::from_str(&json).unwrap();
        assert_eq!(back, entry);
    }
}
