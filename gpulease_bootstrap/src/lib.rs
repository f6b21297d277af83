// /////////////////////////////////////////////////////////////////////////////
// GPU Lease Coordinator
// Copyright (c) 2025 Michael Gardner, A Bit of Help, Inc.
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! # GPU Lease Bootstrap
//!
//! Process-level plumbing shared by the `gpulease` binary and its background
//! tasks: Unix exit-code conventions, signal handling behind a testable
//! trait, and cancellation-token based shutdown coordination.
//!
//! This crate deliberately knows nothing about GPUs, Redis, or leases; it is
//! the thin layer between the operating system and the application.

pub mod exit_code;
pub mod shutdown;
pub mod signals;

pub use exit_code::ExitCode;
pub use shutdown::{CancellationToken, ShutdownCoordinator};
pub use signals::{create_signal_handler, NoOpSignalHandler, SystemSignals, TermSignal};
