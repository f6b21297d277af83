// /////////////////////////////////////////////////////////////////////////////
// GPU Lease Coordinator
// Copyright (c) 2025 Michael Gardner, A Bit of Help, Inc.
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! # Lease Kind
//!
//! The two flavors of reservation the pool hands out:
//!
//! - **Run**: lifetime tied to a wrapped child process and kept alive by
//!   heartbeats. Reclaimed when the heartbeat goes stale.
//! - **Manual**: lifetime tied to a wall-clock deadline. Reclaimed when the
//!   deadline passes.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::LeaseError;

/// The kind of a lease, determining which expiry rule applies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LeaseKind {
    /// Heartbeat-maintained lease wrapping a child process.
    Run,
    /// Time-bounded reservation with an explicit expiry instant.
    Manual,
}

impl fmt::Display for LeaseKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LeaseKind::Run => f.write_str("run"),
            LeaseKind::Manual => f.write_str("manual"),
        }
    }
}

impl FromStr for LeaseKind {
    type Err = LeaseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "run" => Ok(LeaseKind::Run),
            "manual" => Ok(LeaseKind::Manual),
            other => Err(LeaseError::ValidationError(format!(
                "unknown lease kind '{other}' (expected 'run' or 'manual')"
            ))),
        }
    }
}
