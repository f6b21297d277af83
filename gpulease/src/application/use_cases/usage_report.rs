// /////////////////////////////////////////////////////////////////////////////
// GPU Lease Coordinator
// Copyright (c) 2025 Michael Gardner, A Bit of Help, Inc.
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! # Usage Report
//!
//! `gpulease report`: per-user device-time aggregation over the last N
//! days, so administrators can attribute consumption. Reads the usage
//! records (migrating any legacy-schema records on first read) and rolls
//! them up; heaviest users first.

use chrono::{Duration, Utc};
use std::collections::HashMap;
use std::sync::Arc;

use gpulease_domain::{LeaseError, LeaseStore};

#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct UsageRow {
    pub owner: String,
    pub device_seconds: i64,
    pub lease_count: usize,
    /// Share of the reported total, 0..100.
    pub percent: f64,
}

#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct UsageReport {
    pub days: u32,
    pub total_device_seconds: i64,
    pub total_leases: usize,
    pub rows: Vec<UsageRow>,
}

pub async fn usage_report(store: Arc<dyn LeaseStore>, days: u32) -> Result<UsageReport, LeaseError> {
    let cutoff = Utc::now() - Duration::days(days as i64);
    let records = store.usage_since(cutoff).await?;

    let mut per_owner: HashMap<String, (i64, usize)> = HashMap::new();
    let mut total_device_seconds = 0i64;
    for record in &records {
        let entry = per_owner.entry(record.owner.to_string()).or_insert((0, 0));
        entry.0 += record.duration_secs;
        entry.1 += 1;
        total_device_seconds += record.duration_secs;
    }

    let mut rows: Vec<UsageRow> = per_owner
        .into_iter()
        .map(|(owner, (device_seconds, lease_count))| UsageRow {
            owner,
            device_seconds,
            lease_count,
            percent: if total_device_seconds > 0 {
                device_seconds as f64 * 100.0 / total_device_seconds as f64
            } else {
                0.0
            },
        })
        .collect();
    rows.sort_by(|a, b| {
        b.device_seconds
            .cmp(&a.device_seconds)
            .then_with(|| a.owner.cmp(&b.owner))
    });

    Ok(UsageReport {
        days,
        total_device_seconds,
        total_leases: records.len(),
        rows,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::repositories::MemoryLeaseStore;
    use gpulease_domain::{LeaseKind, Owner, UsageRecord};

    #[tokio::test]
    async fn test_report_aggregates_per_owner() {
        let store = Arc::new(MemoryLeaseStore::new());
        let now = Utc::now();
        let record = |name: &str, device: u32, hours: i64| {
            UsageRecord::new(
                Owner::new(name).unwrap(),
                device,
                now - Duration::hours(hours + 1),
                now - Duration::hours(hours + 1) + Duration::hours(1),
                LeaseKind::Run,
            )
        };
        store.record_usage(&record("alice", 0, 1)).await.unwrap();
        store.record_usage(&record("alice", 1, 2)).await.unwrap();
        store.record_usage(&record("bob", 0, 3)).await.unwrap();

        let report = usage_report(store, 30).await.unwrap();
        assert_eq!(report.total_leases, 3);
        assert_eq!(report.total_device_seconds, 3 * 3600);
        assert_eq!(report.rows.len(), 2);

        // Heaviest user first.
        assert_eq!(report.rows[0].owner, "alice");
        assert_eq!(report.rows[0].device_seconds, 2 * 3600);
        assert_eq!(report.rows[0].lease_count, 2);
        assert!((report.rows[0].percent - 66.666).abs() < 0.1);
        assert_eq!(report.rows[1].owner, "bob");
    }

    #[tokio::test]
    async fn test_report_window_excludes_older_records() {
        let store = Arc::new(MemoryLeaseStore::new());
        let now = Utc::now();
        let old = UsageRecord::new(
            Owner::new("alice").unwrap(),
            0,
            now - Duration::days(10),
            now - Duration::days(10) + Duration::hours(1),
            LeaseKind::Manual,
        );
        store.record_usage(&old).await.unwrap();

        let report = usage_report(store, 7).await.unwrap();
        assert_eq!(report.total_leases, 0);
        assert!(report.rows.is_empty());
    }

    #[tokio::test]
    async fn test_empty_report() {
        let store = Arc::new(MemoryLeaseStore::new());
        let report = usage_report(store, 30).await.unwrap();
        assert_eq!(report.total_device_seconds, 0);
        assert!(report.rows.is_empty());
    }
}
