// /////////////////////////////////////////////////////////////////////////////
// GPU Lease Coordinator
// Copyright (c) 2025 Michael Gardner, A Bit of Help, Inc.
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! # Usage Record
//!
//! An append-only record written on every lease release, attributing device
//! time to an owner. Records feed two consumers: the usage report
//! aggregation, and the MRU-per-user half of the selection policy. They are
//! never mutated; the store trims records older than the retention window.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::services::time_codec;
use crate::value_objects::lease_kind::LeaseKind;
use crate::value_objects::owner::Owner;

/// One completed lease: who held which device, and for how long.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsageRecord {
    pub owner: Owner,
    pub device_id: u32,
    #[serde(with = "time_codec")]
    pub started_at: DateTime<Utc>,
    #[serde(with = "time_codec")]
    pub ended_at: DateTime<Utc>,
    /// Computed at release time; clamped to zero for clock skew.
    pub duration_secs: i64,
    pub kind: LeaseKind,
}

impl UsageRecord {
    pub fn new(
        owner: Owner,
        device_id: u32,
        started_at: DateTime<Utc>,
        ended_at: DateTime<Utc>,
        kind: LeaseKind,
    ) -> Self {
        UsageRecord {
            owner,
            device_id,
            started_at,
            ended_at,
            duration_secs: (ended_at - started_at).num_seconds().max(0),
            kind,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    #[test]
    fn test_duration_is_computed() {
        let record = UsageRecord::new(
            Owner::new("alice").unwrap(),
            2,
            at(1_700_000_000),
            at(1_700_003_600),
            LeaseKind::Run,
        );
        assert_eq!(record.duration_secs, 3600);
    }

    #[test]
    fn test_duration_clamped_on_clock_skew() {
        let record = UsageRecord::new(
            Owner::new("alice").unwrap(),
            0,
            at(1_700_000_100),
            at(1_700_000_000),
            LeaseKind::Manual,
        );
        assert_eq!(record.duration_secs, 0);
    }

    #[test]
    fn test_serde_roundtrip_with_legacy_times() {
        let legacy = r#"{
            "owner": "bob",
            "device_id": 1,
            "started_at": 1700000000,
            "ended_at": 1700000500,
            "duration_secs": 500,
            "kind": "manual"
        }"#;
        let record: UsageRecord = serde_json::from_str(legacy).unwrap();
        assert_eq!(record.duration_secs, 500);

        let json = serde_json::to_string(&record).unwrap();
        let back: UsageRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(back, record);
    }
}
