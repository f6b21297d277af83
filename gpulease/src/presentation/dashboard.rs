// /////////////////////////////////////////////////////////////////////////////
// GPU Lease Coordinator
// Copyright (c) 2025 Michael Gardner, A Bit of Help, Inc.
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! # Dashboard Endpoint
//!
//! A lightweight HTTP listener exposing the pool state as JSON, for teams
//! that want a glanceable view without shelling into the host:
//!
//! - `GET /health` — liveness probe, plain `OK`
//! - `GET /api/status` — the per-slot status view
//! - `GET /api/queue` — waiting entries in FCFS order
//!
//! Deliberately minimal: one request per connection, parsed by prefix, no
//! framework. Binds localhost only; anything fancier belongs behind a real
//! reverse proxy.

use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, error, info};

use gpulease_domain::{LeaseError, LeaseStore};

use crate::application::services::AllocationEngine;
use crate::application::use_cases::show_queue;

pub struct Dashboard {
    engine: Arc<AllocationEngine>,
    store: Arc<dyn LeaseStore>,
}

impl Dashboard {
    pub fn new(engine: Arc<AllocationEngine>) -> Self {
        let store = engine.store();
        Dashboard { engine, store }
    }

    /// Binds localhost on `port` and serves requests until the task is
    /// dropped.
    pub async fn start(self, port: u16) -> Result<(), LeaseError> {
        let listener = TcpListener::bind(("127.0.0.1", port))
            .await
            .map_err(|e| LeaseError::Internal(format!("cannot bind dashboard port {port}: {e}")))?;
        info!("dashboard listening on http://127.0.0.1:{port}/api/status");
        self.serve(listener).await
    }

    /// Accept loop over an already-bound listener (tests bind port 0).
    pub async fn serve(self, listener: TcpListener) -> Result<(), LeaseError> {
        let shared = Arc::new(self);
        loop {
            match listener.accept().await {
                Ok((mut stream, _)) => {
                    let dashboard = shared.clone();
                    tokio::spawn(async move {
                        if let Err(e) = dashboard.handle_request(&mut stream).await {
                            error!("dashboard request failed: {e}");
                        }
                    });
                }
                Err(e) => error!("dashboard accept failed: {e}"),
            }
        }
    }

    async fn handle_request(&self, stream: &mut TcpStream) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let mut buffer = [0u8; 1024];
        let n = stream.read(&mut buffer).await?;
        let request = String::from_utf8_lossy(&buffer[..n]);
        debug!("dashboard request: {}", request.lines().next().unwrap_or(""));

        let response = if request.starts_with("GET /health") {
            http_response("200 OK", "text/plain", "OK")
        } else if request.starts_with("GET /api/status") {
            match self.engine.status().await {
                Ok(status) => http_response("200 OK", "application/json", &serde_json::to_string_pretty(&status)?),
                Err(e) => http_response("500 Internal Server Error", "text/plain", &e.to_string()),
            }
        } else if request.starts_with("GET /api/queue") {
            match show_queue(self.store.clone()).await {
                Ok(views) => http_response("200 OK", "application/json", &serde_json::to_string_pretty(&views)?),
                Err(e) => http_response("500 Internal Server Error", "text/plain", &e.to_string()),
            }
        } else {
            http_response("404 Not Found", "text/plain", "Not Found")
        };

        stream.write_all(response.as_bytes()).await?;
        stream.flush().await?;
        Ok(())
    }
}

fn http_response(status: &str, content_type: &str, body: &str) -> String {
    format!(
        "HTTP/1.1 {status}\r\nContent-Type: {content_type}\r\nContent-Length: {}\r\n\r\n{body}",
        body.len()
    )
}
