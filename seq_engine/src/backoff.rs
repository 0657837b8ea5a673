//! Connect-wait backoff.
//!
//! The delay for wait iteration `n` is `first × factor^n`, clamped to `max`.

use seq_common::config::EngineConfig;
use std::time::Duration;

/// Exponential wait schedule used while waiting for channels to connect.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ConnectBackoff {
    /// First wait interval.
    pub first: Duration,
    /// Interval cap.
    pub max: Duration,
    /// Growth factor per iteration.
    pub factor: f64,
}

impl ConnectBackoff {
    /// Schedule from the `[engine]` configuration section.
    pub fn from_config(config: &EngineConfig) -> Self {
        Self {
            first: Duration::from_secs_f64(config.connect_backoff_first_secs),
            max: Duration::from_secs_f64(config.connect_backoff_max_secs),
            factor: config.connect_backoff_factor,
        }
    }

    /// Wait interval for iteration `attempt` (0-indexed).
    pub fn next(&self, attempt: u32) -> Duration {
        let exp = attempt.min(i32::MAX as u32) as i32;
        let secs = self.first.as_secs_f64() * self.factor.powi(exp);
        if !secs.is_finite() || secs < 0.0 || secs > self.max.as_secs_f64() {
            self.max
        } else {
            Duration::from_secs_f64(secs)
        }
    }
}

impl Default for ConnectBackoff {
    fn default() -> Self {
        Self::from_config(&EngineConfig::default())
    }
}
