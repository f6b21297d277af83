// /////////////////////////////////////////////////////////////////////////////
// GPU Lease Coordinator
// Copyright (c) 2025 Michael Gardner, A Bit of Help, Inc.
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! # Configuration
//!
//! Layered settings resolution, later sources overriding earlier ones:
//!
//! 1. built-in defaults
//! 2. configuration file: an explicit `--config PATH`, else `./gpulease`
//!    then `$HOME/.config/gpulease/config` (TOML, YAML, or JSON)
//! 3. environment variables with the `GPULEASE_` prefix
//!    (`GPULEASE_REDIS_HOST=...`)
//! 4. command-line flags, applied by the CLI after loading
//!
//! ## Timing knobs
//!
//! The heartbeat timeout must be substantially larger than the heartbeat
//! interval — the defaults (60 s / 15 min) tolerate at least ten missed
//! beats, so one slow store round-trip never costs anyone their lease.
//! Validation enforces the ordering and warns below the 10x ratio.

use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration as StdDuration;

use gpulease_domain::LeaseError;

/// Resolved configuration for every subcommand.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Location of the state store.
    pub redis_host: String,
    pub redis_port: u16,
    pub redis_db: i64,

    /// Strict-greater threshold for "in unreserved use", in MiB.
    pub memory_threshold_mb: u64,

    /// Run-lease heartbeat cadence and staleness bound.
    pub heartbeat_interval_secs: u64,
    pub heartbeat_timeout_secs: u64,

    /// Queue polling and entry-heartbeat timing.
    pub queue_poll_interval_secs: u64,
    pub queue_heartbeat_interval_secs: u64,
    pub queue_heartbeat_timeout_secs: u64,

    /// Usage records older than this are trimmed.
    pub usage_retention_days: u32,

    pub dashboard_port: u16,
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            redis_host: "localhost".to_string(),
            redis_port: 6379,
            redis_db: 0,
            memory_threshold_mb: 1024,
            heartbeat_interval_secs: 60,
            heartbeat_timeout_secs: 900,
            queue_poll_interval_secs: 1,
            queue_heartbeat_interval_secs: 30,
            queue_heartbeat_timeout_secs: 120,
            usage_retention_days: 90,
            dashboard_port: 8080,
        }
    }
}

impl Settings {
    /// Loads settings from the layered sources. `config_file` is the
    /// explicit `--config` path; when given it must exist.
    pub fn load(config_file: Option<&Path>) -> Result<Self, LeaseError> {
        let mut builder = Config::builder();

        match config_file {
            Some(path) => {
                builder = builder.add_source(File::from(path).required(true));
            }
            None => {
                builder = builder.add_source(File::with_name("gpulease").required(false));
                if let Some(home) = std::env::var_os("HOME") {
                    let user_config = Path::new(&home).join(".config").join("gpulease").join("config");
                    builder = builder.add_source(File::from(user_config).required(false));
                }
            }
        }

        builder = builder.add_source(Environment::with_prefix("GPULEASE"));

        let settings: Settings = builder
            .build()
            .map_err(|e| LeaseError::ValidationError(format!("failed to load configuration: {e}")))?
            .try_deserialize()
            .map_err(|e| LeaseError::ValidationError(format!("invalid configuration: {e}")))?;

        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<(), LeaseError> {
        if self.heartbeat_interval_secs == 0 || self.queue_poll_interval_secs == 0 {
            return Err(LeaseError::ValidationError(
                "heartbeat and poll intervals must be positive".to_string(),
            ));
        }
        if self.heartbeat_timeout_secs <= self.heartbeat_interval_secs {
            return Err(LeaseError::ValidationError(format!(
                "heartbeat_timeout_secs ({}) must exceed heartbeat_interval_secs ({})",
                self.heartbeat_timeout_secs, self.heartbeat_interval_secs
            )));
        }
        if self.heartbeat_timeout_secs < self.heartbeat_interval_secs * 10 {
            tracing::warn!(
                "heartbeat timeout {}s tolerates fewer than 10 missed beats at a {}s interval",
                self.heartbeat_timeout_secs,
                self.heartbeat_interval_secs
            );
        }
        if self.queue_heartbeat_timeout_secs <= self.queue_heartbeat_interval_secs {
            return Err(LeaseError::ValidationError(format!(
                "queue_heartbeat_timeout_secs ({}) must exceed queue_heartbeat_interval_secs ({})",
                self.queue_heartbeat_timeout_secs, self.queue_heartbeat_interval_secs
            )));
        }
        Ok(())
    }

    pub fn redis_url(&self) -> String {
        format!("redis://{}:{}/{}", self.redis_host, self.redis_port, self.redis_db)
    }

    pub fn heartbeat_interval(&self) -> StdDuration {
        StdDuration::from_secs(self.heartbeat_interval_secs)
    }

    pub fn heartbeat_timeout(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.heartbeat_timeout_secs as i64)
    }

    pub fn queue_poll_interval(&self) -> StdDuration {
        StdDuration::from_secs(self.queue_poll_interval_secs)
    }

    pub fn queue_heartbeat_interval(&self) -> StdDuration {
        StdDuration::from_secs(self.queue_heartbeat_interval_secs)
    }

    pub fn queue_heartbeat_timeout(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.queue_heartbeat_timeout_secs as i64)
    }

    pub fn usage_retention(&self) -> chrono::Duration {
        chrono::Duration::days(self.usage_retention_days as i64)
    }
}
