// /////////////////////////////////////////////////////////////////////////////
// GPU Lease Coordinator
// Copyright (c) 2025 Michael Gardner, A Bit of Help, Inc.
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! # Wait Queue Coordinator
//!
//! A blocking allocation that cannot be satisfied immediately is enqueued
//! in a strictly first-come-first-served queue keyed by enqueue instant.
//!
//! ## Head-of-line greedy allocation
//!
//! Only the first entry may consume newly-freed slots. Each poll tick
//! (~1 s) the waiting process:
//!
//! 1. reaps entries whose own heartbeat went stale (~2 min) and returns
//!    their partial slots to the pool
//! 2. runs the expiry sweep
//! 3. if not first, reports its position; if first, takes the allocation
//!    lock and greedily reserves up to `requested − already_held` eligible
//!    slots, each tagged with the entry's ID in `partial_queue_id`
//!
//! Tagged slots carry an owner, so no other requester can take them — but
//! the allocation has not succeeded yet either; the caller has not been
//! told anything. When the held count reaches the request, the tags are
//! cleared (manual expiries re-stamped from now so the lease clock starts
//! at full allocation), the entry is removed, and the wait returns.
//!
//! ## Cancellation
//!
//! On caller cancel, wait-timeout, or reaping, every slot still tagged
//! with the entry's ID goes back to available with a fresh `last_released`
//! and **no usage record** — the allocation never completed.
//!
//! Head-of-line blocking is intentional: strict FCFS means a large request
//! at the head delays smaller ones behind it. Starvation cannot occur
//! because every running lease either ends (run) or expires (manual).

use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use gpulease_bootstrap::CancellationToken;
use gpulease_domain::{AllocationRequest, LeaseError, LeaseStore, QueueEntry};

use crate::application::services::allocation_engine::AllocationEngine;

pub struct QueueCoordinator {
    engine: Arc<AllocationEngine>,
    store: Arc<dyn LeaseStore>,
    poll_interval: Duration,
    heartbeat_interval: Duration,
}

impl QueueCoordinator {
    pub fn new(engine: Arc<AllocationEngine>) -> Self {
        let store = engine.store();
        let poll_interval = engine.settings().queue_poll_interval();
        let heartbeat_interval = engine.settings().queue_heartbeat_interval();
        QueueCoordinator {
            store,
            poll_interval,
            heartbeat_interval,
            engine,
        }
    }

    /// Shortens the tick cadence; used by tests.
    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// Tries an immediate allocation and falls back to queueing when the
    /// failure is contention (capacity, a held device, out-of-band use)
    /// rather than a hard error. Out-of-range device IDs, validation
    /// failures, and store errors surface immediately: waiting can never
    /// satisfy them. Blocks until allocated, cancelled, or timed out.
    pub async fn allocate_blocking(
        &self,
        request: &AllocationRequest,
        wait_timeout: Option<Duration>,
        cancel: CancellationToken,
    ) -> Result<Vec<u32>, LeaseError> {
        match self.engine.allocate(request, false).await {
            Ok(devices) => return Ok(devices),
            Err(
                LeaseError::CapacityExhausted { .. }
                | LeaseError::DeviceConflict(_)
                | LeaseError::UnauthorizedUsage(_),
            ) => {}
            Err(e) => return Err(e),
        }
        self.wait_in_queue(request, wait_timeout, cancel).await
    }

    async fn wait_in_queue(
        &self,
        request: &AllocationRequest,
        wait_timeout: Option<Duration>,
        cancel: CancellationToken,
    ) -> Result<Vec<u32>, LeaseError> {
        let wait_chrono = wait_timeout.and_then(|d| chrono::Duration::from_std(d).ok());
        let entry = QueueEntry::new(request.clone(), Utc::now(), wait_chrono);
        self.store.enqueue(&entry).await?;
        info!(
            "queued request for {} device(s) as entry {}",
            request.requested_count(),
            entry.id
        );

        let shared = Arc::new(Mutex::new(entry));
        let heartbeat_token = CancellationToken::new();
        let heartbeat_task = self.spawn_entry_heartbeat(shared.clone(), heartbeat_token.clone());

        let outcome = self.poll_until_complete(&shared, &cancel).await;

        heartbeat_token.cancel();
        let _ = heartbeat_task.await;

        match outcome {
            Ok(devices) => Ok(devices),
            Err(e) => {
                // Partial slots go back to the pool; no usage records.
                let entry = shared.lock().await.clone();
                self.cancel_entry(&entry).await;
                Err(e)
            }
        }
    }

    async fn poll_until_complete(
        &self,
        shared: &Arc<Mutex<QueueEntry>>,
        cancel: &CancellationToken,
    ) -> Result<Vec<u32>, LeaseError> {
        let mut last_reported: Option<(usize, u32)> = None;

        loop {
            if cancel.is_cancelled() {
                return Err(LeaseError::WaitCancelled("interrupted while waiting for devices".into()));
            }
            {
                let entry = shared.lock().await;
                if entry.is_past_deadline(Utc::now()) {
                    return Err(LeaseError::WaitTimeout(format!(
                        "gave up waiting after reaching the deadline with {}/{} device(s) held",
                        entry.allocated.len(),
                        entry.request.requested_count()
                    )));
                }
            }

            self.reap_stale_entries(&shared.lock().await.id).await;
            self.engine.expiry_sweep().await?;

            let entries = self.store.queue_entries().await?;
            let our_id = shared.lock().await.id.clone();
            let Some(position) = entries.iter().position(|e| e.id == our_id) else {
                return Err(LeaseError::WaitCancelled(
                    "queue entry disappeared (reaped or cancelled elsewhere)".into(),
                ));
            };

            if position == 0 {
                let mut entry = shared.lock().await;
                let newly = self.engine.allocate_partial(&entry).await?;
                if !newly.is_empty() {
                    entry.allocated.extend(&newly);
                    self.store.update_queue_entry(&entry).await?;
                    debug!(
                        "entry {} acquired device(s) {newly:?} ({}/{})",
                        entry.id,
                        entry.allocated.len(),
                        entry.request.requested_count()
                    );
                }
                if entry.is_complete() {
                    self.engine.finalize_partial(&entry).await?;
                    self.store.remove_queue_entry(&entry.id).await?;
                    let mut devices = entry.allocated.clone();
                    devices.sort_unstable();
                    info!("queue entry {} complete: devices {devices:?}", entry.id);
                    return Ok(devices);
                }
            }

            let held = shared.lock().await.allocated.len() as u32;
            if last_reported != Some((position, held)) {
                info!(
                    "waiting for devices: position {} in queue, {held} held",
                    position + 1
                );
                last_reported = Some((position, held));
            }

            tokio::select! {
                _ = tokio::time::sleep(self.poll_interval) => {}
                _ = cancel.cancelled() => {}
            }
        }
    }

    /// Removes every stale entry except ours and frees its partial slots.
    /// Failures clean up what they can and continue: one wedged entry must
    /// not block the queue.
    async fn reap_stale_entries(&self, own_id: &str) {
        let now = Utc::now();
        let timeout = self.engine.settings().queue_heartbeat_timeout();
        let entries = match self.store.queue_entries().await {
            Ok(entries) => entries,
            Err(e) => {
                warn!("cannot read queue for reaping: {e}");
                return;
            }
        };
        for entry in entries {
            if entry.id == own_id || !entry.is_stale(now, timeout) {
                continue;
            }
            info!("reaping stale queue entry {} (no heartbeat since {})", entry.id, entry.last_heartbeat);
            if let Err(e) = self.engine.release_partial(&entry.id).await {
                warn!("failed to free partial slots of stale entry {}: {e}", entry.id);
            }
            if let Err(e) = self.store.remove_queue_entry(&entry.id).await {
                warn!("failed to remove stale entry {}: {e}", entry.id);
            }
        }
    }

    /// Cancellation path: frees our partial slots and removes the entry.
    /// Also covers a finalization that failed partway, where some of the
    /// entry's slots already had their tag cleared: everything this entry
    /// acquired goes back, and none of it gets a usage record.
    async fn cancel_entry(&self, entry: &QueueEntry) {
        match self.engine.release_partial(&entry.id).await {
            Ok(released) if !released.is_empty() => {
                info!("returned partially held device(s) {released:?} to the pool");
            }
            Ok(_) => {}
            Err(e) => warn!("failed to release partial slots for entry {}: {e}", entry.id),
        }
        // Untagged slots can only be ours here if a finalization was
        // attempted, which happens once the entry is complete.
        if entry.is_complete() {
            if let Err(e) = self
                .engine
                .release_untagged_queue_slots(&entry.request.owner, &entry.allocated)
                .await
            {
                warn!("failed to release finalized slots of entry {}: {e}", entry.id);
            }
        }
        if let Err(e) = self.store.remove_queue_entry(&entry.id).await {
            warn!("failed to remove queue entry {}: {e}", entry.id);
        }
    }

    /// Background task refreshing the entry's own heartbeat so other
    /// processes know this waiter is alive.
    fn spawn_entry_heartbeat(
        &self,
        shared: Arc<Mutex<QueueEntry>>,
        token: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        let store = self.store.clone();
        let interval = self.heartbeat_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let mut entry = shared.lock().await;
                        entry.last_heartbeat = Utc::now();
                        if let Err(e) = store.update_queue_entry(&entry).await {
                            warn!("queue heartbeat failed for entry {}: {e}", entry.id);
                        }
                    }
                    _ = token.cancelled() => break,
                }
            }
        })
    }
}
