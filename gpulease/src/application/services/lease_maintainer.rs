// /////////////////////////////////////////////////////////////////////////////
// GPU Lease Coordinator
// Copyright (c) 2025 Michael Gardner, A Bit of Help, Inc.
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! # Lease Maintainer
//!
//! One maintainer per run-type allocation: a background task that keeps the
//! lease alive while the wrapped child runs and releases it when the child
//! exits. The contract:
//!
//! - The initial heartbeat is written **synchronously** inside
//!   [`LeaseMaintainer::start`]; an early failure surfaces before the
//!   caller could believe the lease is alive.
//! - Every interval thereafter, each owned slot is re-read: still our run
//!   lease → refresh `last_heartbeat`; held by someone else → skip silently
//!   (we were reclaimed after a crash and the slot has moved on); not
//!   reserved at all → a loud `ReservationLost`.
//! - On stop — explicit or signal-initiated — every slot still ours as a
//!   run lease is released with a usage record and a fresh
//!   `last_released`. Cancellation breaks the loop; cleanup is
//!   unconditional.
//!
//! The heartbeat timeout (15 min default) is deliberately much larger than
//! the interval (60 s default): at least ten missed beats are tolerated
//! before a sweeper may reclaim the lease.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use gpulease_bootstrap::ShutdownCoordinator;
use gpulease_domain::{LeaseError, Owner};

use crate::application::services::allocation_engine::{AllocationEngine, HeartbeatOutcome};

pub struct LeaseMaintainer {
    engine: Arc<AllocationEngine>,
    owner: Owner,
    devices: Vec<u32>,
    interval: Duration,
    coordinator: ShutdownCoordinator,
    reservation_lost: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl LeaseMaintainer {
    pub fn new(engine: Arc<AllocationEngine>, owner: Owner, devices: Vec<u32>, interval: Duration) -> Self {
        LeaseMaintainer {
            engine,
            owner,
            devices,
            interval,
            coordinator: ShutdownCoordinator::new(Duration::from_secs(10)),
            reservation_lost: Arc::new(AtomicBool::new(false)),
            handle: None,
        }
    }

    /// Whether any heartbeat discovered its slot no longer reserved.
    pub fn reservation_lost(&self) -> bool {
        self.reservation_lost.load(Ordering::SeqCst)
    }

    /// Sends the initial heartbeat synchronously, then starts the
    /// background heartbeat task. Fails loudly when any owned slot cannot
    /// be heartbeated.
    pub async fn start(&mut self) -> Result<(), LeaseError> {
        for device_id in &self.devices {
            match self.engine.heartbeat(&self.owner, *device_id).await? {
                HeartbeatOutcome::Refreshed => {}
                HeartbeatOutcome::NotOurs | HeartbeatOutcome::Lost => {
                    return Err(LeaseError::ReservationLost(format!(
                        "device {device_id} is not held by {} at heartbeat start",
                        self.owner
                    )));
                }
            }
        }

        let engine = self.engine.clone();
        let owner = self.owner.clone();
        let devices = self.devices.clone();
        let interval = self.interval;
        let token = self.coordinator.token();
        let coordinator = self.coordinator.clone();
        let lost_flag = self.reservation_lost.clone();

        self.handle = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick of a tokio interval fires immediately; the
            // initial beat already happened in start().
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        for device_id in &devices {
                            match engine.heartbeat(&owner, *device_id).await {
                                Ok(HeartbeatOutcome::Refreshed) => {
                                    debug!("heartbeat refreshed for device {device_id}");
                                }
                                Ok(HeartbeatOutcome::NotOurs) => {
                                    // Reclaimed after our crash and re-issued;
                                    // the new owner's lease is not ours to touch.
                                    debug!("device {device_id} now held by someone else; skipping heartbeat");
                                }
                                Ok(HeartbeatOutcome::Lost) => {
                                    lost_flag.store(true, Ordering::SeqCst);
                                    error!(
                                        "reservation lost: device {device_id} is no longer reserved for {owner}"
                                    );
                                }
                                Err(e) => {
                                    // Transient store trouble: the timeout
                                    // budget absorbs several missed beats.
                                    error!("heartbeat for device {device_id} failed: {e}");
                                }
                            }
                        }
                    }
                    _ = token.cancelled() => break,
                }
            }

            // Unconditional cleanup: release whatever is still ours.
            let released = engine.release_run_slots(&owner, &devices).await;
            if !released.is_empty() {
                info!("released devices {released:?} for {owner}");
            }
            coordinator.task_done();
        }));
        Ok(())
    }

    /// Stops the heartbeat task and releases every slot still held as our
    /// run lease. Idempotent; safe to call without a prior `start`.
    pub async fn stop(mut self) {
        self.coordinator.initiate();
        if let Some(handle) = self.handle.take() {
            if !self.coordinator.wait().await {
                handle.abort();
            }
        } else {
            // start() was never called; nothing is held on our behalf yet,
            // but release defensively in case the allocation succeeded.
            self.engine.release_run_slots(&self.owner, &self.devices).await;
        }
    }
}
