//! Connection-quality score derived from ping latency.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Latency bands for [`connection_quality`].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct QualityThresholds {
    /// At or below this the score is 100.
    #[serde(with = "chainrelay_core::serde_ms", rename = "good-ms")]
    pub good: Duration,
    /// At or above this the score is 0.
    #[serde(with = "chainrelay_core::serde_ms", rename = "failure-ms")]
    pub failure: Duration,
}

impl Default for QualityThresholds {
    fn default() -> Self {
        Self {
            good: Duration::from_millis(1000),
            failure: Duration::from_millis(5000),
        }
    }
}

/// 100 up to `good`, falling linearly to 0 at `failure`.
pub fn connection_quality(latency: Duration, thresholds: &QualityThresholds) -> u8 {
    if latency <= thresholds.good {
        return 100;
    }
    if latency >= thresholds.failure || thresholds.failure <= thresholds.good {
        return 0;
    }
    let span = (thresholds.failure - thresholds.good).as_secs_f64();
    let over = (latency - thresholds.good).as_secs_f64();
    (100.0 * (1.0 - over / span)).round().clamp(0.0, 100.0) as u8
}
