// /////////////////////////////////////////////////////////////////////////////
// GPU Lease Coordinator
// Copyright (c) 2025 Michael Gardner, A Bit of Help, Inc.
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! # gpulease CLI
//!
//! The command-line surface over the coordination engine:
//!
//! ```bash
//! # One-time setup on each host
//! gpulease init --count 8
//!
//! # Wrap a training job: lease lives as long as the child
//! gpulease run --devices 2 -- python train.py
//!
//! # Manual time-bounded reservation
//! gpulease reserve --devices 1 --duration 8h --note "ad-hoc eval"
//!
//! # Who has what, who is waiting, who used what
//! gpulease status
//! gpulease queue
//! gpulease report --days 7
//!
//! # Give manual reservations back
//! gpulease release
//! ```
//!
//! Exit codes follow sysexits conventions for coordinator errors; the
//! wrapped child's exit code passes through `gpulease run` verbatim.

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use gpulease::application::services::AllocationEngine;
use gpulease::application::use_cases::{
    initialize_pool, release_devices, reserve_devices, run_with_devices, show_queue, show_status, usage_report,
    RunParams,
};
use gpulease::infrastructure::adapters::inspector_for;
use gpulease::infrastructure::config::Settings;
use gpulease::infrastructure::logging;
use gpulease::infrastructure::repositories::RedisLeaseStore;
use gpulease::presentation::dashboard::Dashboard;
use gpulease::presentation::render;
use gpulease::{AllocationRequest, AllocationTarget, GpuProvider, LeaseError, LeaseStore, Owner};
use gpulease_bootstrap::{create_signal_handler, CancellationToken, ExitCode};

#[derive(Parser)]
#[command(name = "gpulease")]
#[command(about = "Coordinates exclusive GPU leases on a shared multi-user host")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Configuration file (TOML, YAML, or JSON)
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,

    /// State store host (overrides config)
    #[arg(long, global = true)]
    redis_host: Option<String>,

    /// State store port (overrides config)
    #[arg(long, global = true)]
    redis_port: Option<u16>,

    /// State store database number (overrides config)
    #[arg(long, global = true)]
    redis_db: Option<i64>,

    /// Memory threshold in MiB above which a device counts as in use
    #[arg(long, global = true)]
    memory_threshold_mb: Option<u64>,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the device pool on this host
    Init {
        /// Number of devices in the pool
        #[arg(long)]
        count: u32,

        /// Re-initialize an existing pool, discarding all reservations
        #[arg(long)]
        force: bool,

        /// Vendor family override (nvidia, amd, fake); detected when omitted
        #[arg(long)]
        provider: Option<GpuProviderArg>,
    },

    /// Show the per-device pool state
    Status {
        /// Machine-readable JSON instead of the table
        #[arg(long)]
        json: bool,
    },

    /// Allocate devices and run a command; the lease lives as long as the child
    Run {
        /// Number of devices to allocate
        #[arg(long)]
        devices: Option<u32>,

        /// Specific device IDs to allocate (comma-separated)
        #[arg(long, value_delimiter = ',')]
        device_ids: Option<Vec<u32>>,

        /// Note shown in status output
        #[arg(long)]
        note: Option<String>,

        /// Wait in the queue when devices are busy
        #[arg(long)]
        wait: bool,

        /// Give up waiting after this long (e.g. 30s, 10m, 2h)
        #[arg(long, value_name = "DURATION")]
        wait_timeout: Option<String>,

        /// Kill the command after this long (e.g. 4h)
        #[arg(long, value_name = "DURATION")]
        timeout: Option<String>,

        /// The command to run
        #[arg(last = true, required = true)]
        command: Vec<String>,
    },

    /// Reserve devices manually for a fixed duration
    Reserve {
        /// Number of devices to reserve
        #[arg(long)]
        devices: Option<u32>,

        /// Specific device IDs to reserve (comma-separated)
        #[arg(long, value_delimiter = ',')]
        device_ids: Option<Vec<u32>>,

        /// How long the reservation lasts (e.g. 8h, 30m, 2d)
        #[arg(long, value_name = "DURATION")]
        duration: String,

        /// Note shown in status output
        #[arg(long)]
        note: Option<String>,

        /// Wait in the queue when devices are busy
        #[arg(long)]
        wait: bool,

        /// Give up waiting after this long
        #[arg(long, value_name = "DURATION")]
        wait_timeout: Option<String>,
    },

    /// Release your manual reservations, or specific devices of yours
    Release {
        /// Specific device IDs to release (default: all your manual leases)
        #[arg(long, value_delimiter = ',')]
        device_ids: Option<Vec<u32>>,
    },

    /// Aggregate recorded usage per user
    Report {
        /// Reporting window in days
        #[arg(long, default_value_t = 30)]
        days: u32,

        /// Machine-readable JSON instead of the table
        #[arg(long)]
        json: bool,
    },

    /// Show who is waiting for devices
    Queue {
        /// Machine-readable JSON instead of the table
        #[arg(long)]
        json: bool,
    },

    /// Serve pool state over HTTP for dashboards
    Dashboard {
        /// Listening port (overrides config)
        #[arg(long)]
        port: Option<u16>,
    },
}

#[derive(Clone, Copy, clap::ValueEnum)]
enum GpuProviderArg {
    Nvidia,
    Amd,
    Fake,
}

impl From<GpuProviderArg> for GpuProvider {
    fn from(arg: GpuProviderArg) -> Self {
        match arg {
            GpuProviderArg::Nvidia => GpuProvider::Nvidia,
            GpuProviderArg::Amd => GpuProvider::Amd,
            GpuProviderArg::Fake => GpuProvider::Fake,
        }
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    logging::init(cli.verbose);

    match execute(cli).await {
        Ok(code) => code.exit(),
        Err(e) => {
            eprintln!("gpulease: {e}");
            exit_code_for(&e).exit()
        }
    }
}

async fn execute(cli: Cli) -> Result<ExitCode, LeaseError> {
    let mut settings = Settings::load(cli.config.as_deref())?;
    if let Some(host) = cli.redis_host {
        settings.redis_host = host;
    }
    if let Some(port) = cli.redis_port {
        settings.redis_port = port;
    }
    if let Some(db) = cli.redis_db {
        settings.redis_db = db;
    }
    if let Some(threshold) = cli.memory_threshold_mb {
        settings.memory_threshold_mb = threshold;
    }
    settings.validate()?;

    let store: Arc<dyn LeaseStore> = Arc::new(RedisLeaseStore::connect(&settings).await?);

    match cli.command {
        Commands::Init { count, force, provider } => {
            let outcome = initialize_pool(store, count, force, provider.map(Into::into)).await?;
            println!(
                "{} pool of {} device(s) (provider: {})",
                if outcome.reinitialized { "re-initialized" } else { "initialized" },
                outcome.device_count,
                outcome.provider,
            );
            Ok(ExitCode::Success)
        }

        Commands::Status { json } => {
            let engine = engine_for(&store, &settings).await?;
            let status = show_status(engine).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&status).map_err(json_err)?);
            } else {
                print!("{}", render::render_status(&status));
            }
            Ok(ExitCode::Success)
        }

        Commands::Run {
            devices,
            device_ids,
            note,
            wait,
            wait_timeout,
            timeout,
            command,
        } => {
            let target = resolve_target(devices, device_ids)?;
            let request = AllocationRequest::run(current_owner()?, target, note)?;
            let engine = engine_for(&store, &settings).await?;
            let params = RunParams {
                request,
                command,
                wait,
                wait_timeout: wait_timeout.map(|raw| parse_duration(&raw)).transpose()?,
                child_timeout: timeout.map(|raw| parse_duration(&raw)).transpose()?,
            };
            let code = run_with_devices(engine, Arc::from(create_signal_handler()), params).await?;
            Ok(ExitCode::Child(code))
        }

        Commands::Reserve {
            devices,
            device_ids,
            duration,
            note,
            wait,
            wait_timeout,
        } => {
            let target = resolve_target(devices, device_ids)?;
            let duration = parse_duration(&duration)?;
            let request = AllocationRequest::manual(current_owner()?, target, duration.as_secs(), note)?;
            let engine = engine_for(&store, &settings).await?;
            let wait_timeout = wait_timeout.map(|raw| parse_duration(&raw)).transpose()?;
            let allocated = reserve_devices(engine, &request, wait, wait_timeout, watch_signals()).await?;
            println!(
                "reserved device(s) {} for {}",
                allocated.iter().map(|id| id.to_string()).collect::<Vec<_>>().join(","),
                render::humanize_secs(duration.as_secs() as i64),
            );
            Ok(ExitCode::Success)
        }

        Commands::Release { device_ids } => {
            let engine = engine_for(&store, &settings).await?;
            let released = release_devices(engine, &current_owner()?, device_ids).await?;
            if released.is_empty() {
                println!("nothing to release");
            } else {
                println!(
                    "released device(s) {}",
                    released.iter().map(|id| id.to_string()).collect::<Vec<_>>().join(","),
                );
            }
            Ok(ExitCode::Success)
        }

        Commands::Report { days, json } => {
            let report = usage_report(store, days).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&report).map_err(json_err)?);
            } else {
                print!("{}", render::render_report(&report));
            }
            Ok(ExitCode::Success)
        }

        Commands::Queue { json } => {
            let views = show_queue(store).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&views).map_err(json_err)?);
            } else {
                print!("{}", render::render_queue(&views));
            }
            Ok(ExitCode::Success)
        }

        Commands::Dashboard { port } => {
            let engine = engine_for(&store, &settings).await?;
            Dashboard::new(engine)
                .start(port.unwrap_or(settings.dashboard_port))
                .await?;
            Ok(ExitCode::Success)
        }
    }
}

/// Builds the engine for commands that need device inspection, using the
/// provider recorded at pool initialization.
async fn engine_for(store: &Arc<dyn LeaseStore>, settings: &Settings) -> Result<Arc<AllocationEngine>, LeaseError> {
    let provider = store.provider().await?;
    Ok(Arc::new(AllocationEngine::new(
        store.clone(),
        inspector_for(provider),
        settings.clone(),
    )))
}

/// The identity leases are held under: the invoking user.
fn current_owner() -> Result<Owner, LeaseError> {
    let name = std::env::var("USER")
        .or_else(|_| std::env::var("LOGNAME"))
        .map_err(|_| LeaseError::ValidationError("cannot determine the current user (USER/LOGNAME unset)".into()))?;
    Owner::new(name)
}

/// Resolves the count-or-IDs pair. Both together are allowed only when the
/// count matches the ID list, and collapse to the explicit list.
fn resolve_target(devices: Option<u32>, device_ids: Option<Vec<u32>>) -> Result<AllocationTarget, LeaseError> {
    match (devices, device_ids) {
        (None, None) => Ok(AllocationTarget::Count(1)),
        (Some(count), None) => Ok(AllocationTarget::Count(count)),
        (None, Some(ids)) => Ok(AllocationTarget::Devices(ids)),
        (Some(count), Some(ids)) => {
            if count as usize == ids.len() {
                Ok(AllocationTarget::Devices(ids))
            } else {
                Err(LeaseError::ValidationError(format!(
                    "--devices {count} conflicts with {} explicit device ID(s)",
                    ids.len()
                )))
            }
        }
    }
}

/// Parses "30s", "10m", "8h", "2d", or bare seconds.
fn parse_duration(raw: &str) -> Result<Duration, LeaseError> {
    let raw = raw.trim();
    let (value, multiplier) = match raw.chars().last() {
        Some('s') => (&raw[..raw.len() - 1], 1),
        Some('m') => (&raw[..raw.len() - 1], 60),
        Some('h') => (&raw[..raw.len() - 1], 3_600),
        Some('d') => (&raw[..raw.len() - 1], 86_400),
        _ => (raw, 1),
    };
    let value: u64 = value
        .parse()
        .map_err(|_| LeaseError::ValidationError(format!("cannot parse duration '{raw}' (try 30s, 10m, 8h, 2d)")))?;
    if value == 0 {
        return Err(LeaseError::ValidationError("duration must be positive".into()));
    }
    Ok(Duration::from_secs(value * multiplier))
}

/// A cancellation token wired to the process signal handler.
fn watch_signals() -> CancellationToken {
    let cancel = CancellationToken::new();
    let handler = create_signal_handler();
    let token = cancel.clone();
    tokio::spawn(async move {
        handler.wait_for_signal().await;
        token.cancel();
    });
    cancel
}

fn json_err(e: serde_json::Error) -> LeaseError {
    LeaseError::SerializationError(e.to_string())
}

fn exit_code_for(error: &LeaseError) -> ExitCode {
    match error {
        LeaseError::ValidationError(_) | LeaseError::OutOfRange(_) => ExitCode::UsageError,
        LeaseError::StoreCorrupt(_) | LeaseError::SerializationError(_) => ExitCode::DataError,
        LeaseError::PoolNotInitialized | LeaseError::StoreError(_) | LeaseError::InspectionFailed(_) => {
            ExitCode::Unavailable
        }
        LeaseError::LockUnavailable(_) | LeaseError::WaitTimeout(_) => ExitCode::TempFail,
        LeaseError::Internal(_) => ExitCode::Software,
        LeaseError::CapacityExhausted { .. }
        | LeaseError::DeviceConflict(_)
        | LeaseError::UnauthorizedUsage(_)
        | LeaseError::WaitCancelled(_)
        | LeaseError::ReservationLost(_) => ExitCode::Error,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_duration_forms() {
        assert_eq!(parse_duration("30s").unwrap(), Duration::from_secs(30));
        assert_eq!(parse_duration("10m").unwrap(), Duration::from_secs(600));
        assert_eq!(parse_duration("8h").unwrap(), Duration::from_secs(8 * 3600));
        assert_eq!(parse_duration("2d").unwrap(), Duration::from_secs(2 * 86_400));
        assert_eq!(parse_duration("3600").unwrap(), Duration::from_secs(3600));
    }

    #[test]
    fn test_parse_duration_rejects_garbage() {
        assert!(parse_duration("soon").is_err());
        assert!(parse_duration("0h").is_err());
        assert!(parse_duration("").is_err());
    }

    #[test]
    fn test_resolve_target() {
        assert_eq!(resolve_target(None, None).unwrap(), AllocationTarget::Count(1));
        assert_eq!(resolve_target(Some(3), None).unwrap(), AllocationTarget::Count(3));
        assert_eq!(
            resolve_target(None, Some(vec![0, 2])).unwrap(),
            AllocationTarget::Devices(vec![0, 2])
        );
        // Count matching the list size collapses to the list.
        assert_eq!(
            resolve_target(Some(2), Some(vec![0, 2])).unwrap(),
            AllocationTarget::Devices(vec![0, 2])
        );
        assert!(resolve_target(Some(3), Some(vec![0, 2])).is_err());
    }

    #[test]
    fn test_exit_code_mapping() {
        assert_eq!(exit_code_for(&LeaseError::PoolNotInitialized), ExitCode::Unavailable);
        assert_eq!(
            exit_code_for(&LeaseError::ValidationError("bad".into())),
            ExitCode::UsageError
        );
        assert_eq!(
            exit_code_for(&LeaseError::OutOfRange("device 7".into())),
            ExitCode::UsageError
        );
        assert_eq!(
            exit_code_for(&LeaseError::WaitTimeout("30s".into())),
            ExitCode::TempFail
        );
        assert_eq!(
            exit_code_for(&LeaseError::CapacityExhausted {
                requested: 2,
                available: 1,
                unreserved_in_use: 0
            }),
            ExitCode::Error
        );
    }

    #[test]
    fn test_cli_parses() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
    }
}
