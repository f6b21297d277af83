// /////////////////////////////////////////////////////////////////////////////
// GPU Lease Coordinator
// Copyright (c) 2025 Michael Gardner, A Bit of Help, Inc.
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! # Queue Query
//!
//! `gpulease queue`: who is waiting, in order, with how much of their
//! request already partially allocated.

use chrono::{DateTime, Utc};
use std::sync::Arc;

use gpulease_domain::{LeaseError, LeaseStore};

#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct QueueView {
    pub position: usize,
    pub entry_id: String,
    pub owner: String,
    pub kind: String,
    pub requested: u32,
    pub held: u32,
    pub enqueued_at: DateTime<Utc>,
    pub wait_secs: i64,
}

pub async fn show_queue(store: Arc<dyn LeaseStore>) -> Result<Vec<QueueView>, LeaseError> {
    let now = Utc::now();
    Ok(store
        .queue_entries()
        .await?
        .into_iter()
        .enumerate()
        .map(|(index, entry)| QueueView {
            position: index + 1,
            owner: entry.request.owner.to_string(),
            kind: entry.request.kind.to_string(),
            requested: entry.request.requested_count(),
            held: entry.allocated.len() as u32,
            enqueued_at: entry.enqueued_at,
            wait_secs: (now - entry.enqueued_at).num_seconds().max(0),
            entry_id: entry.id,
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::repositories::MemoryLeaseStore;
    use chrono::Duration;
    use gpulease_domain::{AllocationRequest, AllocationTarget, Owner, QueueEntry};

    #[tokio::test]
    async fn test_queue_views_are_ordered_and_enumerated() {
        let store = Arc::new(MemoryLeaseStore::new());
        let request = |name: &str, count: u32| {
            AllocationRequest::run(Owner::new(name).unwrap(), AllocationTarget::Count(count), None).unwrap()
        };

        let mut first = QueueEntry::new(request("alice", 2), Utc::now() - Duration::minutes(5), None);
        first.allocated.push(1);
        let second = QueueEntry::new(request("bob", 1), Utc::now() - Duration::minutes(1), None);
        store.enqueue(&second).await.unwrap();
        store.enqueue(&first).await.unwrap();

        let views = show_queue(store).await.unwrap();
        assert_eq!(views.len(), 2);
        assert_eq!(views[0].position, 1);
        assert_eq!(views[0].owner, "alice");
        assert_eq!(views[0].held, 1);
        assert_eq!(views[0].requested, 2);
        assert!(views[0].wait_secs >= 299);
        assert_eq!(views[1].owner, "bob");
    }

    #[tokio::test]
    async fn test_empty_queue() {
        let store = Arc::new(MemoryLeaseStore::new());
        assert!(show_queue(store).await.unwrap().is_empty());
    }
}
