// /////////////////////////////////////////////////////////////////////////////
// GPU Lease Coordinator
// Copyright (c) 2025 Michael Gardner, A Bit of Help, Inc.
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! # Device Slot State
//!
//! A device slot is one accelerator in the pool, addressed by a small
//! non-negative integer in `[0, N)`. Each slot is in exactly one of two
//! states:
//!
//! - **Available**: free for allocation. May remember when it was last
//!   released, which feeds the global-LRU tiebreaker of the selection
//!   policy.
//! - **Reserved**: exclusively held. Carries the owner, the lease kind, a
//!   start instant, and the liveness anchor for that kind: a
//!   `last_heartbeat` for run leases, an `expires_at` for manual ones.
//!   A slot handed to a queued waiter before its request is complete is
//!   additionally tagged with the waiter's `partial_queue_id`.
//!
//! ## Invariants
//!
//! Enforced by [`SlotState::validate`], which the store adapter calls on
//! every read so a violated invariant surfaces as corruption instead of
//! propagating:
//!
//! - a run lease always has `last_heartbeat`
//! - a manual lease always has `expires_at`
//! - `partial_queue_id` only ever appears on a reserved slot (by
//!   construction: the field lives inside [`Reservation`])
//!
//! ## Liveness
//!
//! A reserved slot is *live* unless its manual deadline has passed or its
//! run heartbeat has gone stale. A non-live lease is reclaimable: the expiry
//! sweep releases it, and specific-ID allocation may treat it as free.
//! The heartbeat boundary is inclusive: a lease whose heartbeat is exactly
//! `timeout` old is still live.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::error::LeaseError;
use crate::services::time_codec;
use crate::value_objects::lease_kind::LeaseKind;
use crate::value_objects::owner::Owner;

/// An exclusive claim on a device slot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reservation {
    pub owner: Owner,
    pub kind: LeaseKind,
    #[serde(with = "time_codec")]
    pub started_at: DateTime<Utc>,
    /// Liveness anchor for run leases.
    #[serde(default, with = "time_codec::optional", skip_serializing_if = "Option::is_none")]
    pub last_heartbeat: Option<DateTime<Utc>>,
    /// Liveness anchor for manual leases.
    #[serde(default, with = "time_codec::optional", skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
    /// Set while this slot is part of an unfinished multi-device
    /// allocation for a queued waiter; cleared at finalization.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub partial_queue_id: Option<String>,
}

impl Reservation {
    /// A fresh run reservation with its initial heartbeat stamped.
    pub fn run(owner: Owner, now: DateTime<Utc>, note: Option<String>) -> Self {
        Reservation {
            owner,
            kind: LeaseKind::Run,
            started_at: now,
            last_heartbeat: Some(now),
            expires_at: None,
            note,
            partial_queue_id: None,
        }
    }

    /// A fresh manual reservation expiring after `duration`.
    pub fn manual(owner: Owner, now: DateTime<Utc>, duration: Duration, note: Option<String>) -> Self {
        Reservation {
            owner,
            kind: LeaseKind::Manual,
            started_at: now,
            last_heartbeat: None,
            expires_at: Some(now + duration),
            note,
            partial_queue_id: None,
        }
    }

    /// Whether a manual lease's deadline has passed.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        matches!(self.kind, LeaseKind::Manual) && self.expires_at.map(|at| at < now).unwrap_or(false)
    }

    /// Whether a run lease's heartbeat has gone stale. The boundary is
    /// inclusive: `now - last_heartbeat == timeout` is still live.
    pub fn is_heartbeat_stale(&self, now: DateTime<Utc>, timeout: Duration) -> bool {
        matches!(self.kind, LeaseKind::Run)
            && self
                .last_heartbeat
                .map(|beat| now - beat > timeout)
                .unwrap_or(false)
    }

    /// A lease is reclaimable once either liveness rule fails.
    pub fn is_reclaimable(&self, now: DateTime<Utc>, heartbeat_timeout: Duration) -> bool {
        self.is_expired(now) || self.is_heartbeat_stale(now, heartbeat_timeout)
    }

    fn validate(&self) -> Result<(), LeaseError> {
        match self.kind {
            LeaseKind::Run if self.last_heartbeat.is_none() => Err(LeaseError::StoreCorrupt(format!(
                "run lease for '{}' has no last_heartbeat",
                self.owner
            ))),
            LeaseKind::Manual if self.expires_at.is_none() => Err(LeaseError::StoreCorrupt(format!(
                "manual lease for '{}' has no expiry",
                self.owner
            ))),
            _ => Ok(()),
        }
    }
}

/// The state of one device slot. Absence of a stored record is equivalent
/// to `Available { last_released: None }` (a fresh, never-used slot).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum SlotState {
    Available {
        /// When the slot was last released; the global-LRU tiebreaker.
        #[serde(default, with = "time_codec::optional", skip_serializing_if = "Option::is_none")]
        last_released: Option<DateTime<Utc>>,
    },
    Reserved(Reservation),
}

impl SlotState {
    /// A never-used available slot.
    pub fn fresh() -> Self {
        SlotState::Available { last_released: None }
    }

    /// An available slot released at `at`.
    pub fn released_at(at: DateTime<Utc>) -> Self {
        SlotState::Available {
            last_released: Some(at),
        }
    }

    pub fn is_available(&self) -> bool {
        matches!(self, SlotState::Available { .. })
    }

    pub fn reservation(&self) -> Option<&Reservation> {
        match self {
            SlotState::Reserved(reservation) => Some(reservation),
            SlotState::Available { .. } => None,
        }
    }

    pub fn last_released(&self) -> Option<DateTime<Utc>> {
        match self {
            SlotState::Available { last_released } => *last_released,
            SlotState::Reserved(_) => None,
        }
    }

    /// Checks the state invariants; the store adapter calls this on every
    /// read and surfaces violations as corruption.
    pub fn validate(&self) -> Result<(), LeaseError> {
        match self {
            SlotState::Available { .. } => Ok(()),
            SlotState::Reserved(reservation) => reservation.validate(),
        }
    }
}

impl Default for SlotState {
    fn default() -> Self {
        SlotState::fresh()
    }
}
