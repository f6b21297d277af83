// /////////////////////////////////////////////////////////////////////////////
// GPU Lease Coordinator
// Copyright (c) 2025 Michael Gardner, A Bit of Help, Inc.
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! # Terminal Rendering
//!
//! Human-readable rendering of status, queue, and report data for stdout.
//! The `--json` forms are plain `serde_json` over the same structs, so the
//! machine wire format stays in lockstep with what humans see.

use chrono::{DateTime, Utc};

use crate::application::services::{PoolStatus, SlotView};
use crate::application::use_cases::{QueueView, UsageReport};

/// Compact "2h 5m" style duration for table columns.
pub fn humanize_secs(total_secs: i64) -> String {
    let total_secs = total_secs.max(0);
    let (days, rem) = (total_secs / 86_400, total_secs % 86_400);
    let (hours, rem) = (rem / 3_600, rem % 3_600);
    let (minutes, seconds) = (rem / 60, rem % 60);
    match (days, hours, minutes) {
        (0, 0, 0) => format!("{seconds}s"),
        (0, 0, _) => format!("{minutes}m {seconds}s"),
        (0, _, _) => format!("{hours}h {minutes}m"),
        _ => format!("{days}d {hours}h"),
    }
}

fn ago(now: DateTime<Utc>, then: DateTime<Utc>) -> String {
    format!("{} ago", humanize_secs((now - then).num_seconds()))
}

fn until(now: DateTime<Utc>, then: DateTime<Utc>) -> String {
    if then <= now {
        "expired".to_string()
    } else {
        format!("{} left", humanize_secs((then - now).num_seconds()))
    }
}

pub fn render_status(status: &PoolStatus) -> String {
    let now = Utc::now();
    let mut out = String::new();
    for view in &status.slots {
        let line = match view {
            SlotView::Available {
                device_id,
                last_released,
            } => match last_released {
                Some(at) => format!("GPU {device_id}: available (released {})", ago(now, *at)),
                None => format!("GPU {device_id}: available"),
            },
            SlotView::Reserved {
                device_id,
                owner,
                kind,
                started_at,
                last_heartbeat,
                expires_at,
                note,
                partial_queue_id,
                reclaimable,
            } => {
                let mut line = format!(
                    "GPU {device_id}: reserved by {owner} ({kind}, {})",
                    ago(now, *started_at)
                );
                if let Some(beat) = last_heartbeat {
                    line.push_str(&format!(", heartbeat {}", ago(now, *beat)));
                }
                if let Some(expiry) = expires_at {
                    line.push_str(&format!(", {}", until(now, *expiry)));
                }
                if partial_queue_id.is_some() {
                    line.push_str(", pending queued allocation");
                }
                if *reclaimable {
                    line.push_str(" [reclaimable]");
                }
                if let Some(note) = note {
                    line.push_str(&format!(" - {note}"));
                }
                line
            }
            SlotView::UnreservedInUse {
                device_id,
                memory_used_mb,
                owners,
                process_count,
            } => {
                let who = if owners.is_empty() {
                    "unknown".to_string()
                } else {
                    owners.join(", ")
                };
                format!(
                    "GPU {device_id}: IN USE WITHOUT RESERVATION by {who} ({memory_used_mb} MiB, {process_count} process(es))"
                )
            }
            SlotView::Error { device_id, message } => format!("GPU {device_id}: ERROR - {message}"),
        };
        out.push_str(&line);
        out.push('\n');
    }
    out
}

pub fn render_queue(views: &[QueueView]) -> String {
    if views.is_empty() {
        return "queue is empty\n".to_string();
    }
    let mut out = String::new();
    for view in views {
        out.push_str(&format!(
            "{:>3}. {} ({}) - {}/{} device(s), waiting {}\n",
            view.position,
            view.owner,
            view.kind,
            view.held,
            view.requested,
            humanize_secs(view.wait_secs),
        ));
    }
    out
}

pub fn render_report(report: &UsageReport) -> String {
    let mut out = format!("GPU usage over the last {} day(s):\n", report.days);
    if report.rows.is_empty() {
        out.push_str("  no recorded usage\n");
        return out;
    }
    for row in &report.rows {
        out.push_str(&format!(
            "  {:<16} {:>12} {:>6.1}%  ({} lease(s))\n",
            row.owner,
            humanize_secs(row.device_seconds),
            row.percent,
            row.lease_count,
        ));
    }
    out.push_str(&format!(
        "  total: {} device-time across {} lease(s)\n",
        humanize_secs(report.total_device_seconds),
        report.total_leases,
    ));
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::use_cases::UsageRow;

    #[test]
    fn test_humanize() {
        assert_eq!(humanize_secs(12), "12s");
        assert_eq!(humanize_secs(125), "2m 5s");
        assert_eq!(humanize_secs(7_380), "2h 3m");
        assert_eq!(humanize_secs(200_000), "2d 7h");
        assert_eq!(humanize_secs(-5), "0s");
    }

    #[test]
    fn test_render_status_variants() {
        let status = PoolStatus {
            pool_size: 3,
            slots: vec![
                SlotView::Available {
                    device_id: 0,
                    last_released: None,
                },
                SlotView::Reserved {
                    device_id: 1,
                    owner: "alice".into(),
                    kind: gpulease_domain::LeaseKind::Run,
                    started_at: Utc::now() - chrono::Duration::minutes(10),
                    last_heartbeat: Some(Utc::now() - chrono::Duration::seconds(30)),
                    expires_at: None,
                    note: Some("exp-42".into()),
                    partial_queue_id: None,
                    reclaimable: false,
                },
                SlotView::UnreservedInUse {
                    device_id: 2,
                    memory_used_mb: 2048,
                    owners: vec!["bob".into()],
                    process_count: 2,
                },
            ],
        };
        let rendered = render_status(&status);
        assert!(rendered.contains("GPU 0: available"));
        assert!(rendered.contains("reserved by alice (run"));
        assert!(rendered.contains("exp-42"));
        assert!(rendered.contains("WITHOUT RESERVATION by bob (2048 MiB"));
    }

    #[test]
    fn test_render_queue_and_report() {
        let queue = vec![QueueView {
            position: 1,
            entry_id: "q1".into(),
            owner: "alice".into(),
            kind: "run".into(),
            requested: 2,
            held: 1,
            enqueued_at: Utc::now(),
            wait_secs: 65,
        }];
        let rendered = render_queue(&queue);
        assert!(rendered.contains("alice"));
        assert!(rendered.contains("1/2"));

        assert_eq!(render_queue(&[]), "queue is empty\n");

        let report = UsageReport {
            days: 7,
            total_device_seconds: 3600,
            total_leases: 1,
            rows: vec![UsageRow {
                owner: "alice".into(),
                device_seconds: 3600,
                lease_count: 1,
                percent: 100.0,
            }],
        };
        let rendered = render_report(&report);
        assert!(rendered.contains("alice"));
        assert!(rendered.contains("100.0%"));
    }
}
