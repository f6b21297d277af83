// /////////////////////////////////////////////////////////////////////////////
// GPU Lease Coordinator
// Copyright (c) 2025 Michael Gardner, A Bit of Help, Inc.
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! The three cooperating coordination services.

pub mod allocation_engine;
pub mod lease_maintainer;
pub mod queue_coordinator;

pub use allocation_engine::{AllocationEngine, HeartbeatOutcome, PoolStatus, SlotView};
pub use lease_maintainer::LeaseMaintainer;
pub use queue_coordinator::QueueCoordinator;
