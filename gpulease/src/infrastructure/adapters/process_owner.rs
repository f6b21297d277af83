// /////////////////////////////////////////////////////////////////////////////
// GPU Lease Coordinator
// Copyright (c) 2025 Michael Gardner, A Bit of Help, Inc.
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! # Process Owner Resolution
//!
//! Maps a PID observed on a device to the username running it, so status
//! output can say *who* is using a GPU out of band. Resolution is
//! best-effort and never fails the caller:
//!
//! 1. `/proc/<pid>/status` for the real UID, then `/etc/passwd` for the name
//! 2. fallback: `ps -o user= -p <pid>`
//! 3. otherwise the owner is reported as `unknown`

use gpulease_domain::GpuProcess;

/// Resolves the owner of `pid`, returning `"unknown"` when every strategy
/// fails (process exited, restricted procfs, unparseable passwd).
pub async fn resolve(pid: u32) -> String {
    if let Some(uid) = uid_of(pid).await {
        if let Some(name) = username_of(uid).await {
            return name;
        }
    }
    if let Some(name) = ps_owner(pid).await {
        return name;
    }
    GpuProcess::UNKNOWN_OWNER.to_string()
}

async fn uid_of(pid: u32) -> Option<u32> {
    let status = tokio::fs::read_to_string(format!("/proc/{pid}/status")).await.ok()?;
    uid_from_status(&status)
}

async fn username_of(uid: u32) -> Option<String> {
    let passwd = tokio::fs::read_to_string("/etc/passwd").await.ok()?;
    username_from_passwd(&passwd, uid)
}

async fn ps_owner(pid: u32) -> Option<String> {
    let output = tokio::process::Command::new("ps")
        .args(["-o", "user=", "-p", &pid.to_string()])
        .output()
        .await
        .ok()?;
    if !output.status.success() {
        return None;
    }
    let name = String::from_utf8_lossy(&output.stdout).trim().to_string();
    (!name.is_empty()).then_some(name)
}

/// Extracts the real UID from `/proc/<pid>/status` content.
fn uid_from_status(status: &str) -> Option<u32> {
    status
        .lines()
        .find(|line| line.starts_with("Uid:"))?
        .split_whitespace()
        .nth(1)?
        .parse()
        .ok()
}

/// Looks up a username by UID in passwd(5) content.
fn username_from_passwd(passwd: &str, uid: u32) -> Option<String> {
    passwd.lines().find_map(|line| {
        let mut fields = line.split(':');
        let name = fields.next()?;
        let _password = fields.next()?;
        let entry_uid: u32 = fields.next()?.parse().ok()?;
        (entry_uid == uid).then(|| name.to_string())
    })
}
