// /////////////////////////////////////////////////////////////////////////////
// GPU Lease Coordinator
// Copyright (c) 2025 Michael Gardner, A Bit of Help, Inc.
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! # Owner Identity
//!
//! The identity a lease is held under: a Unix username on the shared host.
//! Ownership comparisons throughout the system ("is this reservation still
//! mine?") compare these values, so the type guarantees the one invariant
//! everything else leans on: an owner is never empty.

use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;

use crate::error::LeaseError;

/// A validated, non-empty owner identity.
///
/// Constructed via [`Owner::new`], which trims surrounding whitespace and
/// rejects empty input. Serializes as a bare string.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct Owner(String);

impl Owner {
    /// Creates an owner identity, rejecting empty or whitespace-only input.
    pub fn new(name: impl Into<String>) -> Result<Self, LeaseError> {
        let name = name.into();
        let trimmed = name.trim();
        if trimmed.is_empty() {
            return Err(LeaseError::ValidationError(
                "owner identity must not be empty".to_string(),
            ));
        }
        Ok(Owner(trimmed.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Owner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for Owner {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

// Stored records must round-trip through the constructor so an empty owner
// in the store surfaces as corruption rather than an empty identity.
impl<'de> Deserialize<'de> for Owner {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        Owner::new(raw).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_owner_accepts_plain_username() {
        let owner = Owner::new("alice").unwrap();
        assert_eq!(owner.as_str(), "alice");
        assert_eq!(owner.to_string(), "alice");
    }

    #[test]
    fn test_owner_trims_whitespace() {
        let owner = Owner::new("  bob \n").unwrap();
        assert_eq!(owner.as_str(), "bob");
    }

    #[test]
    fn test_owner_rejects_empty() {
        assert!(Owner::new("").is_err());
        assert!(Owner::new("   ").is_err());
    }

    #[test]
    fn test_owner_serde_is_transparent() {
        let owner = Owner::new("carol").unwrap();
        let json = serde_json::to_string(&owner).unwrap();
        assert_eq!(json, "\"carol\"");
        let back: Owner = serde_json::from_str(&json).unwrap();
        assert_eq!(back, owner);
    }

    #[test]
    fn test_owner_deserialize_rejects_empty() {
        assert!(serde_json::from_str::<Owner>("\"\"").is_err());
    }
}
