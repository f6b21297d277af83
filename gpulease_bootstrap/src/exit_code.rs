// /////////////////////////////////////////////////////////////////////////////
// GPU Lease Coordinator
// Copyright (c) 2025 Michael Gardner, A Bit of Help, Inc.
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! # Exit Code Management
//!
//! Standardized Unix exit codes following BSD `sysexits.h` conventions.
//!
//! ## Conventions
//!
//! - **0**: success
//! - **1**: general error
//! - **64-78**: specific conditions (`sysexits.h`)
//! - **128+N**: terminated by signal N
//!
//! One wrinkle specific to this tool: `gpulease run` wraps a child process,
//! and its exit code is propagated **verbatim** — the wrapper must be
//! transparent to scripts that inspect the child's status. Use
//! [`ExitCode::Child`] for that path; every coordinator-originated failure
//! maps to one of the named codes.

use std::fmt;

/// Process exit codes used by the `gpulease` binary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ExitCode {
    /// Successful termination (0).
    #[default]
    Success,

    /// General error (1): allocation conflicts, lost reservations, and
    /// other coordinator failures with no more specific code.
    Error,

    /// Command line usage error (64): invalid flags or arguments.
    UsageError,

    /// Data format error (65): corrupt state encountered in the store.
    DataError,

    /// Service unavailable (69): store unreachable, vendor tooling absent,
    /// or the pool not initialized.
    Unavailable,

    /// Internal software error (70).
    Software,

    /// Temporary failure (75): lock contention or wait timeout; retrying
    /// later may succeed.
    TempFail,

    /// Configuration error (78).
    ConfigError,

    /// The wrapped child's own exit code, propagated verbatim.
    Child(i32),
}

impl ExitCode {
    pub fn as_i32(self) -> i32 {
        match self {
            ExitCode::Success => 0,
            ExitCode::Error => 1,
            ExitCode::UsageError => 64,
            ExitCode::DataError => 65,
            ExitCode::Unavailable => 69,
            ExitCode::Software => 70,
            ExitCode::TempFail => 75,
            ExitCode::ConfigError => 78,
            ExitCode::Child(code) => code,
        }
    }

    /// Conventional code for a child terminated by signal N (128+N).
    pub fn from_signal(signal: i32) -> Self {
        ExitCode::Child(128 + signal)
    }

    /// Terminates the process with this code.
    pub fn exit(self) -> ! {
        std::process::exit(self.as_i32())
    }
}

impl fmt::Display for ExitCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_i32())
    }
}
