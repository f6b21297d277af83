// /////////////////////////////////////////////////////////////////////////////
// GPU Lease Coordinator
// Copyright (c) 2025 Michael Gardner, A Bit of Help, Inc.
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! # System Signal Handling
//!
//! Signal handling for orderly teardown. `gpulease run` and the blocking
//! wait path install a handler **exactly once** per process; receiving
//! SIGINT, SIGTERM, or SIGHUP must trigger cleanup (release leases, cancel
//! queue entries) rather than killing the process mid-write.
//!
//! The trait abstraction exists for the same reason as everywhere else in
//! this codebase: tests drive shutdown explicitly through the no-op
//! implementation instead of delivering real signals.

use async_trait::async_trait;
use std::fmt;

/// Which termination signal was received.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TermSignal {
    Interrupt,
    Terminate,
    Hangup,
}

impl TermSignal {
    /// The conventional signal number, for 128+N exit codes.
    pub fn number(self) -> i32 {
        match self {
            TermSignal::Interrupt => 2,
            TermSignal::Terminate => 15,
            TermSignal::Hangup => 1,
        }
    }
}

impl fmt::Display for TermSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TermSignal::Interrupt => f.write_str("SIGINT"),
            TermSignal::Terminate => f.write_str("SIGTERM"),
            TermSignal::Hangup => f.write_str("SIGHUP"),
        }
    }
}

/// Waits for a termination signal.
#[async_trait]
pub trait SystemSignals: Send + Sync {
    /// Resolves when a termination signal arrives, identifying it.
    async fn wait_for_signal(&self) -> TermSignal;
}

/// Unix implementation over `tokio::signal`.
#[cfg(unix)]
pub struct UnixSignalHandler;

#[cfg(unix)]
#[async_trait]
impl SystemSignals for UnixSignalHandler {
    async fn wait_for_signal(&self) -> TermSignal {
        use tokio::signal::unix::{signal, SignalKind};

        let mut sigterm = signal(SignalKind::terminate()).expect("failed to register SIGTERM handler");
        let mut sigint = signal(SignalKind::interrupt()).expect("failed to register SIGINT handler");
        let mut sighup = signal(SignalKind::hangup()).expect("failed to register SIGHUP handler");

        let received = tokio::select! {
            _ = sigterm.recv() => TermSignal::Terminate,
            _ = sigint.recv() => TermSignal::Interrupt,
            _ = sighup.recv() => TermSignal::Hangup,
        };
        tracing::info!("received {received}, starting orderly shutdown");
        received
    }
}

/// Never delivers a signal; tests control shutdown explicitly.
pub struct NoOpSignalHandler;

#[async_trait]
impl SystemSignals for NoOpSignalHandler {
    async fn wait_for_signal(&self) -> TermSignal {
        std::future::pending::<()>().await;
        unreachable!("pending future never resolves")
    }
}

/// Platform-appropriate signal handler.
pub fn create_signal_handler() -> Box<dyn SystemSignals> {
    #[cfg(unix)]
    {
        Box::new(UnixSignalHandler)
    }

    #[cfg(not(unix))]
    {
        Box::new(NoOpSignalHandler)
    }
}
