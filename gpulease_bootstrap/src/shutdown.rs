// /////////////////////////////////////////////////////////////////////////////
// GPU Lease Coordinator
// Copyright (c) 2025 Michael Gardner, A Bit of Help, Inc.
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! # Shutdown Coordination
//!
//! Cancellation tokens and a small coordinator for the background tasks this
//! tool runs: lease heartbeats, queue-entry heartbeats, queue polling, and
//! the signal watcher. Every task follows the same pattern:
//!
//! ```text
//! initial synchronous action
//! loop {
//!     select! { _ = ticker.tick() => work, _ = token.cancelled() => break }
//! }
//! guaranteed cleanup
//! coordinator.task_done()
//! ```
//!
//! Cleanup must never be dropped — a cancelled heartbeat task still has to
//! release its slots — so cancellation only breaks the loop; the cleanup
//! path runs unconditionally afterwards.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;

/// Clone-able cancellation token for async tasks.
#[derive(Clone)]
pub struct CancellationToken {
    cancelled: Arc<AtomicBool>,
    notify: Arc<Notify>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self {
            cancelled: Arc::new(AtomicBool::new(false)),
            notify: Arc::new(Notify::new()),
        }
    }

    /// Cancels this token and wakes every waiter.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Resolves when the token is cancelled; immediately if it already is.
    pub async fn cancelled(&self) {
        while !self.is_cancelled() {
            let notified = self.notify.notified();
            // Re-check after arming the notification to close the race with
            // a concurrent cancel().
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }
}

impl Default for CancellationToken {
    fn default() -> Self {
        Self::new()
    }
}

/// Coordinates orderly shutdown: one side initiates, the working side
/// signals completion, and the initiator waits with a bounded grace period.
#[derive(Clone)]
pub struct ShutdownCoordinator {
    token: CancellationToken,
    grace_period: Duration,
    done: Arc<Notify>,
    finished: Arc<AtomicBool>,
}

impl ShutdownCoordinator {
    pub fn new(grace_period: Duration) -> Self {
        Self {
            token: CancellationToken::new(),
            grace_period,
            done: Arc::new(Notify::new()),
            finished: Arc::new(AtomicBool::new(false)),
        }
    }

    /// A token for worker tasks to select on.
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    pub fn initiate(&self) {
        if !self.token.is_cancelled() {
            tracing::debug!("initiating shutdown (grace period {:?})", self.grace_period);
            self.token.cancel();
        }
    }

    /// Called by the working side once cleanup has finished.
    pub fn task_done(&self) {
        self.finished.store(true, Ordering::SeqCst);
        self.done.notify_waiters();
    }

    /// Waits for `task_done`, bounded by the grace period. Returns `false`
    /// when the grace period expired first.
    pub async fn wait(&self) -> bool {
        if self.finished.load(Ordering::SeqCst) {
            return true;
        }
        tokio::select! {
            _ = self.done.notified() => true,
            _ = tokio::time::sleep(self.grace_period) => {
                tracing::warn!("shutdown grace period expired; abandoning cleanup wait");
                false
            }
        }
    }
}
