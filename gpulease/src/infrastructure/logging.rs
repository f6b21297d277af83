// /////////////////////////////////////////////////////////////////////////////
// GPU Lease Coordinator
// Copyright (c) 2025 Michael Gardner, A Bit of Help, Inc.
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! # Logging Setup
//!
//! One-shot `tracing` subscriber initialization for the binary. Logs go to
//! stderr so command output on stdout (tables, JSON, the wrapped child's
//! streams) stays machine-consumable. `RUST_LOG` wins over the `--verbose`
//! flag when set.

use tracing_subscriber::EnvFilter;

/// Initializes the global subscriber. Safe to call once per process;
/// subsequent calls are ignored (relevant for tests).
pub fn init(verbose: bool) {
    let default_filter = if verbose {
        "gpulease=debug,gpulease_domain=debug,gpulease_bootstrap=debug,warn"
    } else {
        "gpulease=info,gpulease_domain=info,gpulease_bootstrap=info,warn"
    };

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
}
