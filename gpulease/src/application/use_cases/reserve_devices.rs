// /////////////////////////////////////////////////////////////////////////////
// GPU Lease Coordinator
// Copyright (c) 2025 Michael Gardner, A Bit of Help, Inc.
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! # Manual Reservation
//!
//! `gpulease reserve`: a time-bounded manual lease with no wrapped child.
//! The lease lives until its deadline passes or the owner releases it; no
//! heartbeat task is involved. Optionally blocks in the queue when the
//! devices are busy.

use std::sync::Arc;
use std::time::Duration;

use gpulease_bootstrap::CancellationToken;
use gpulease_domain::{AllocationRequest, LeaseError};

use crate::application::services::{AllocationEngine, QueueCoordinator};

pub async fn reserve_devices(
    engine: Arc<AllocationEngine>,
    request: &AllocationRequest,
    wait: bool,
    wait_timeout: Option<Duration>,
    cancel: CancellationToken,
) -> Result<Vec<u32>, LeaseError> {
    if wait {
        let coordinator = QueueCoordinator::new(engine);
        coordinator.allocate_blocking(request, wait_timeout, cancel).await
    } else {
        engine.allocate(request, false).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::adapters::FakeInspector;
    use crate::infrastructure::config::Settings;
    use crate::infrastructure::repositories::MemoryLeaseStore;
    use gpulease_domain::{AllocationTarget, GpuProvider, LeaseKind, LeaseStore, Owner};

    #[tokio::test]
    async fn test_manual_reservation_writes_expiry() {
        let store = Arc::new(MemoryLeaseStore::new());
        store.initialize_pool(2, GpuProvider::Fake).await.unwrap();
        let engine = Arc::new(AllocationEngine::new(
            store.clone(),
            Arc::new(FakeInspector::empty(2)),
            Settings::default(),
        ));

        let request = AllocationRequest::manual(
            Owner::new("alice").unwrap(),
            AllocationTarget::Count(1),
            8 * 3600,
            Some("nightly eval".into()),
        )
        .unwrap();

        let devices = reserve_devices(engine, &request, false, None, CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(devices.len(), 1);

        let reservation = store.raw_slot(devices[0]).await.reservation().cloned().unwrap();
        assert_eq!(reservation.kind, LeaseKind::Manual);
        assert!(reservation.expires_at.is_some());
        assert_eq!(reservation.note.as_deref(), Some("nightly eval"));
        assert!(reservation.last_heartbeat.is_none());
    }
}
