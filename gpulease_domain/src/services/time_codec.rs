// /////////////////////////////////////////////////////////////////////////////
// GPU Lease Coordinator
// Copyright (c) 2025 Michael Gardner, A Bit of Help, Inc.
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! # Tolerant Time Codec
//!
//! Serde codec for every instant persisted in the store.
//!
//! Historical records were produced by an earlier implementation that wrote
//! integer seconds-since-epoch. Current records are written as RFC3339
//! instants. This module accepts **both** on read and always emits the
//! RFC3339 form on write, so old state keeps deserializing without a
//! migration step.
//!
//! ## Usage
//!
//! ```rust
//! use chrono::{DateTime, Utc};
//! use serde::{Deserialize, Serialize};
//! use gpulease_domain::services::time_codec;
//!
//! #[derive(Serialize, Deserialize)]
//! struct Stamped {
//!     #[serde(with = "time_codec")]
//!     at: DateTime<Utc>,
//!     #[serde(default, with = "time_codec::optional")]
//!     released_at: Option<DateTime<Utc>>,
//! }
//! ```

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Deserializer, Serializer};

/// The two encodings accepted on read.
#[derive(Deserialize)]
#[serde(untagged)]
enum Encoded {
    /// Legacy integer seconds-since-epoch.
    EpochSeconds(i64),
    /// Legacy fractional seconds-since-epoch.
    EpochFractional(f64),
    /// RFC3339 instant, the form every current writer emits.
    Instant(String),
}

fn decode(encoded: Encoded) -> Result<DateTime<Utc>, String> {
    match encoded {
        Encoded::EpochSeconds(secs) => Utc
            .timestamp_opt(secs, 0)
            .single()
            .ok_or_else(|| format!("epoch seconds out of range: {secs}")),
        Encoded::EpochFractional(secs) => {
            let whole = secs.trunc() as i64;
            let nanos = ((secs - secs.trunc()) * 1_000_000_000.0) as u32;
            Utc.timestamp_opt(whole, nanos)
                .single()
                .ok_or_else(|| format!("epoch seconds out of range: {secs}"))
        }
        Encoded::Instant(text) => DateTime::parse_from_rfc3339(&text)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(|e| format!("invalid RFC3339 instant '{text}': {e}")),
    }
}

/// Serializes an instant in RFC3339 form, the only form ever written.
pub fn serialize<S>(dt: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    serializer.serialize_str(&dt.to_rfc3339())
}

/// Deserializes either legacy epoch seconds or an RFC3339 instant.
pub fn deserialize<'de, D>(deserializer: D) -> Result<DateTime<Utc>, D::Error>
where
    D: Deserializer<'de>,
{
    let encoded = Encoded::deserialize(deserializer)?;
    decode(encoded).map_err(serde::de::Error::custom)
}

/// Codec for `Option<DateTime<Utc>>` fields (absent heartbeats, expiries,
/// release instants).
pub mod optional {
    use super::*;

    pub fn serialize<S>(opt: &Option<DateTime<Utc>>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match opt {
            Some(dt) => serializer.serialize_some(&dt.to_rfc3339()),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<DateTime<Utc>>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let encoded: Option<Encoded> = Option::deserialize(deserializer)?;
        encoded.map(|e| decode(e).map_err(serde::de::Error::custom)).transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde::Serialize;

    #[derive(Serialize, Deserialize, Debug, PartialEq)]
    struct Stamped {
        #[serde(with = "super")]
        at: DateTime<Utc>,
        #[serde(default, with = "super::optional")]
        maybe: Option<DateTime<Utc>>,
    }

    #[test]
    fn test_reads_legacy_epoch_seconds() {
        let stamped: Stamped = serde_json::from_str(r#"{"at": 1700000000}"#).unwrap();
        assert_eq!(stamped.at, Utc.timestamp_opt(1_700_000_000, 0).unwrap());
    }

    #[test]
    fn test_reads_legacy_fractional_epoch() {
        let stamped: Stamped = serde_json::from_str(r#"{"at": 1700000000.5}"#).unwrap();
        assert_eq!(stamped.at.timestamp(), 1_700_000_000);
        assert_eq!(stamped.at.timestamp_subsec_millis(), 500);
    }

    #[test]
    fn test_reads_rfc3339_instant() {
        let stamped: Stamped = serde_json::from_str(r#"{"at": "2024-01-15T10:30:45+00:00"}"#).unwrap();
        assert_eq!(stamped.at.timestamp(), 1_705_314_645);
    }

    #[test]
    fn test_always_writes_rfc3339() {
        let stamped = Stamped {
            at: Utc.timestamp_opt(1_700_000_000, 0).unwrap(),
            maybe: Some(Utc.timestamp_opt(1_700_000_060, 0).unwrap()),
        };
        let json = serde_json::to_string(&stamped).unwrap();
        assert!(json.contains("2023-11-14T22:13:20+00:00"));
        assert!(!json.contains("1700000000"));
    }

    #[test]
    fn test_optional_absent_and_null() {
        let stamped: Stamped = serde_json::from_str(r#"{"at": 0}"#).unwrap();
        assert_eq!(stamped.maybe, None);
        let stamped: Stamped = serde_json::from_str(r#"{"at": 0, "maybe": null}"#).unwrap();
        assert_eq!(stamped.maybe, None);
        let stamped: Stamped = serde_json::from_str(r#"{"at": 0, "maybe": 1700000000}"#).unwrap();
        assert!(stamped.maybe.is_some());
    }

    #[test]
    fn test_rejects_garbage() {
        assert!(serde_json::from_str::<Stamped>(r#"{"at": "next tuesday"}"#).is_err());
    }

    proptest! {
        // Round-trip law: serialize then deserialize is identity at second
        // precision, for either accepted input encoding.
        #[test]
        fn prop_roundtrip_both_encodings(secs in 0i64..4_000_000_000) {
            let dt = Utc.timestamp_opt(secs, 0).unwrap();
            let stamped = Stamped { at: dt, maybe: None };
            let json = serde_json::to_string(&stamped).unwrap();
            let back: Stamped = serde_json::from_str(&json).unwrap();
            prop_assert_eq!(back.at, dt);

            let legacy = format!(r#"{{"at": {secs}}}"#);
            let from_legacy: Stamped = serde_json::from_str(&legacy).unwrap();
            prop_assert_eq!(from_legacy.at, dt);
        }
    }
}
