// /////////////////////////////////////////////////////////////////////////////
// GPU Lease Coordinator
// Copyright (c) 2025 Michael Gardner, A Bit of Help, Inc.
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! Infrastructure ports: async traits the infrastructure layer implements.

pub mod device_inspector;
pub mod lease_store;

pub use device_inspector::{DeviceInspector, DeviceUsage, GpuProcess, GpuProvider};
pub use lease_store::{LeaseStore, RankedCandidate};
