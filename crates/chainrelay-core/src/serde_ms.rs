//! Serde adapter for durations written as integer milliseconds.
//!
//! ```ignore
//! #[serde(with = "chainrelay_core::serde_ms")]
//! pub request_timeout: Duration,
//! ```

use std::time::Duration;

use serde::{Deserialize, Deserializer, Serializer};

pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_u64(value.as_millis() as u64)
}

pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
    u64::deserialize(deserializer).map(Duration::from_millis)
}
