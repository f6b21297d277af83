// /////////////////////////////////////////////////////////////////////////////
// GPU Lease Coordinator
// Copyright (c) 2025 Michael Gardner, A Bit of Help, Inc.
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! Core domain entities: slot state, queue entries, usage records.

pub mod device_slot;
pub mod queue_entry;
pub mod usage_record;

pub use device_slot::{Reservation, SlotState};
pub use queue_entry::QueueEntry;
pub use usage_record::UsageRecord;
