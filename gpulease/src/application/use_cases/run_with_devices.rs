// /////////////////////////////////////////////////////////////////////////////
// GPU Lease Coordinator
// Copyright (c) 2025 Michael Gardner, A Bit of Help, Inc.
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! # Allocate And Run
//!
//! `gpulease run -- CMD…`: allocates run-kind devices (blocking in the
//! queue when asked to), exports the conventional visible-device variables,
//! executes the child with its streams passed through, heartbeats for the
//! child's lifetime, releases on exit, and propagates the child's exit code
//! **verbatim** — the wrapper must be invisible to scripts that inspect the
//! status.
//!
//! ## Child-process contract
//!
//! - `CUDA_VISIBLE_DEVICES` carries the comma-separated original device
//!   IDs; on AMD pools `HIP_VISIBLE_DEVICES` and `ROCR_VISIBLE_DEVICES`
//!   are set too.
//! - The signal handler is installed exactly once, here: SIGINT/SIGTERM/
//!   SIGHUP stop the child, then cleanup runs (heartbeat stop, release,
//!   usage record), then the process exits 128+N.
//! - An optional `--timeout` bounds the child's runtime; expiry kills the
//!   child and exits with the conventional 124.

use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

use gpulease_bootstrap::{CancellationToken, SystemSignals};
use gpulease_domain::{AllocationRequest, GpuProvider, LeaseError};

use crate::application::services::{AllocationEngine, LeaseMaintainer, QueueCoordinator};

/// Exit code when the child exceeded `--timeout`, per timeout(1).
const TIMEOUT_EXIT_CODE: i32 = 124;

pub struct RunParams {
    pub request: AllocationRequest,
    /// Program and arguments, non-empty.
    pub command: Vec<String>,
    pub wait: bool,
    pub wait_timeout: Option<Duration>,
    pub child_timeout: Option<Duration>,
}

/// Runs the wrapped command on allocated devices; returns the exit code to
/// propagate.
pub async fn run_with_devices(
    engine: Arc<AllocationEngine>,
    signals: Arc<dyn SystemSignals>,
    params: RunParams,
) -> Result<i32, LeaseError> {
    let Some((program, args)) = params.command.split_first() else {
        return Err(LeaseError::ValidationError("no command given to run".to_string()));
    };

    // Installed exactly once per process; cancellation reaches the queue
    // wait, the child supervisor, and through them every cleanup path.
    let cancel = CancellationToken::new();
    let received_signal: Arc<std::sync::Mutex<Option<gpulease_bootstrap::TermSignal>>> =
        Arc::new(std::sync::Mutex::new(None));
    let signal_task = {
        let cancel = cancel.clone();
        let received_signal = received_signal.clone();
        tokio::spawn(async move {
            let received = signals.wait_for_signal().await;
            *received_signal.lock().unwrap() = Some(received);
            cancel.cancel();
        })
    };

    let devices = if params.wait {
        QueueCoordinator::new(engine.clone())
            .allocate_blocking(&params.request, params.wait_timeout, cancel.clone())
            .await?
    } else {
        engine.allocate(&params.request, false).await?
    };
    info!("allocated device(s) {devices:?} for {}", params.request.owner);

    let mut maintainer = LeaseMaintainer::new(
        engine.clone(),
        params.request.owner.clone(),
        devices.clone(),
        engine.settings().heartbeat_interval(),
    );
    if let Err(e) = maintainer.start().await {
        // The caller must not believe the lease is alive; put the devices
        // back before surfacing.
        maintainer.stop().await;
        signal_task.abort();
        return Err(e);
    }

    let provider = engine.store().provider().await.unwrap_or(GpuProvider::Nvidia);
    let visible: Vec<String> = devices.iter().map(|id| id.to_string()).collect();
    let visible = visible.join(",");

    let mut command = tokio::process::Command::new(program);
    command
        .args(args)
        .env("CUDA_VISIBLE_DEVICES", &visible)
        .stdin(Stdio::inherit())
        .stdout(Stdio::inherit())
        .stderr(Stdio::inherit());
    if provider == GpuProvider::Amd {
        command
            .env("HIP_VISIBLE_DEVICES", &visible)
            .env("ROCR_VISIBLE_DEVICES", &visible);
    }

    let exit_code = match command.spawn() {
        Err(e) => {
            maintainer.stop().await;
            signal_task.abort();
            return Err(LeaseError::ValidationError(format!("cannot execute '{program}': {e}")));
        }
        Ok(mut child) => supervise_child(&mut child, &cancel, params.child_timeout).await,
    };

    if maintainer.reservation_lost() {
        error!("a device reservation was lost while the command ran; its output may be unreliable");
    }
    maintainer.stop().await;
    signal_task.abort();

    // If a signal drove the shutdown, report 128+N like the shell would.
    let received = *received_signal.lock().unwrap();
    Ok(match received {
        Some(signal) => 128 + signal.number(),
        None => exit_code,
    })
}

/// Waits for the child, a cancellation, or the timeout, and always reaps
/// the child before returning its exit code.
async fn supervise_child(
    child: &mut tokio::process::Child,
    cancel: &CancellationToken,
    child_timeout: Option<Duration>,
) -> i32 {
    let timeout = async {
        match child_timeout {
            Some(duration) => tokio::time::sleep(duration).await,
            None => std::future::pending().await,
        }
    };

    tokio::select! {
        status = child.wait() => match status {
            Ok(status) => exit_code_of(status),
            Err(e) => {
                warn!("failed to wait for child: {e}");
                1
            }
        },
        _ = cancel.cancelled() => {
            info!("stopping wrapped command");
            kill_and_reap(child).await;
            // The caller translates a signal-driven stop to 128+N.
            1
        }
        _ = timeout => {
            warn!("wrapped command exceeded its timeout; killing it");
            kill_and_reap(child).await;
            TIMEOUT_EXIT_CODE
        }
    }
}

async fn kill_and_reap(child: &mut tokio::process::Child) {
    if let Err(e) = child.start_kill() {
        warn!("failed to kill child: {e}");
    }
    let _ = child.wait().await;
}

fn exit_code_of(status: std::process::ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        return code;
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return 128 + signal;
        }
    }
    1
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::adapters::FakeInspector;
    use crate::infrastructure::config::Settings;
    use crate::infrastructure::repositories::MemoryLeaseStore;
    use gpulease_bootstrap::NoOpSignalHandler;
    use gpulease_domain::{AllocationTarget, GpuProvider, LeaseStore, Owner};

    async fn engine_with_pool(pool: u32) -> (Arc<MemoryLeaseStore>, Arc<AllocationEngine>) {
        let store = Arc::new(MemoryLeaseStore::new());
        store.initialize_pool(pool, GpuProvider::Fake).await.unwrap();
        let engine = Arc::new(AllocationEngine::new(
            store.clone(),
            Arc::new(FakeInspector::empty(pool)),
            Settings::default(),
        ));
        (store, engine)
    }

    fn params(command: &[&str], count: u32) -> RunParams {
        RunParams {
            request: AllocationRequest::run(Owner::new("alice").unwrap(), AllocationTarget::Count(count), None)
                .unwrap(),
            command: command.iter().map(|s| s.to_string()).collect(),
            wait: false,
            wait_timeout: None,
            child_timeout: None,
        }
    }

    #[tokio::test]
    async fn test_child_exit_code_propagates_verbatim() {
        let (_store, engine) = engine_with_pool(2).await;
        let code = run_with_devices(engine, Arc::new(NoOpSignalHandler), params(&["sh", "-c", "exit 7"], 1))
            .await
            .unwrap();
        assert_eq!(code, 7);
    }

    #[tokio::test]
    async fn test_success_exit_code_and_release() {
        let (store, engine) = engine_with_pool(2).await;
        let code = run_with_devices(engine, Arc::new(NoOpSignalHandler), params(&["true"], 1))
            .await
            .unwrap();
        assert_eq!(code, 0);

        // The lease released and left a usage record behind.
        assert!(store.raw_slot(0).await.is_available());
        let records = store.usage_records().await;
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].owner.as_str(), "alice");
    }

    #[tokio::test]
    async fn test_visible_devices_env_is_set() {
        let (_store, engine) = engine_with_pool(1).await;
        let code = run_with_devices(
            engine,
            Arc::new(NoOpSignalHandler),
            params(&["sh", "-c", "test \"$CUDA_VISIBLE_DEVICES\" = \"0\""], 1),
        )
        .await
        .unwrap();
        assert_eq!(code, 0);
    }

    #[tokio::test]
    async fn test_child_timeout_kills_and_returns_124() {
        let (store, engine) = engine_with_pool(1).await;
        let mut run = params(&["sleep", "30"], 1);
        run.child_timeout = Some(Duration::from_millis(200));

        let code = run_with_devices(engine, Arc::new(NoOpSignalHandler), run).await.unwrap();
        assert_eq!(code, TIMEOUT_EXIT_CODE);
        assert!(store.raw_slot(0).await.is_available());
    }

    #[tokio::test]
    async fn test_missing_command_is_rejected() {
        let (_store, engine) = engine_with_pool(1).await;
        let err = run_with_devices(engine, Arc::new(NoOpSignalHandler), params(&[], 1))
            .await
            .unwrap_err();
        assert!(matches!(err, LeaseError::ValidationError(_)));
    }

    #[tokio::test]
    async fn test_unexecutable_command_releases_devices() {
        let (store, engine) = engine_with_pool(1).await;
        let err = run_with_devices(
            engine,
            Arc::new(NoOpSignalHandler),
            params(&["/definitely/not/a/binary"], 1),
        )
        .await
        .unwrap_err();
        assert!(err.to_string().contains("cannot execute"));
        assert!(store.raw_slot(0).await.is_available());
    }
}
