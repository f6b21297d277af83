// /////////////////////////////////////////////////////////////////////////////
// GPU Lease Coordinator
// Copyright (c) 2025 Michael Gardner, A Bit of Help, Inc.
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! Infrastructure layer: the Redis store adapter, vendor device
//! inspectors, configuration, and logging setup.

pub mod adapters;
pub mod config;
pub mod logging;
pub mod repositories;
