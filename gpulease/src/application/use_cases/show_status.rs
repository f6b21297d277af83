// /////////////////////////////////////////////////////////////////////////////
// GPU Lease Coordinator
// Copyright (c) 2025 Michael Gardner, A Bit of Help, Inc.
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! # Status Query
//!
//! `gpulease status`: the per-slot pool picture. A pure reader — two
//! back-to-back calls with no writers in between return the same result.

use std::sync::Arc;

use gpulease_domain::LeaseError;

use crate::application::services::{AllocationEngine, PoolStatus};

pub async fn show_status(engine: Arc<AllocationEngine>) -> Result<PoolStatus, LeaseError> {
    engine.status().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::services::SlotView;
    use crate::infrastructure::adapters::FakeInspector;
    use crate::infrastructure::config::Settings;
    use crate::infrastructure::repositories::MemoryLeaseStore;
    use gpulease_domain::{GpuProvider, LeaseStore};

    #[tokio::test]
    async fn test_status_of_fresh_pool() {
        let store = Arc::new(MemoryLeaseStore::new());
        store.initialize_pool(2, GpuProvider::Fake).await.unwrap();
        let engine = Arc::new(AllocationEngine::new(
            store,
            Arc::new(FakeInspector::empty(2)),
            Settings::default(),
        ));

        let status = show_status(engine).await.unwrap();
        assert_eq!(status.pool_size, 2);
        assert!(status
            .slots
            .iter()
            .all(|view| matches!(view, SlotView::Available { .. })));
    }

    #[tokio::test]
    async fn test_status_without_pool_fails() {
        let store = Arc::new(MemoryLeaseStore::new());
        let engine = Arc::new(AllocationEngine::new(
            store,
            Arc::new(FakeInspector::empty(0)),
            Settings::default(),
        ));
        assert!(matches!(
            show_status(engine).await,
            Err(LeaseError::PoolNotInitialized)
        ));
    }
}
