//! Timing surface shared by master and slave
//!
//! Durations are written as (fractional) seconds in config files:
//! `heartbeat_interval = 5` or `heartbeat_interval = 0.5`. Every duration
//! must be positive and at most one day.

use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimingConfig {
    #[serde(with = "secs")]
    pub heartbeat_interval: Duration,
    /// Liveness window = heartbeat interval x multiplier
    pub liveness_multiplier: u32,
    #[serde(with = "secs")]
    pub registration_retry: Duration,
    #[serde(with = "secs")]
    pub reconnect_backoff: Duration,
    pub backoff_multiplier: f64,
    #[serde(with = "secs")]
    pub backoff_max: Duration,
    #[serde(with = "secs")]
    pub discovery_interval: Duration,
    #[serde(with = "secs")]
    pub load_report_interval: Duration,
    /// Bound on every sharing-agent invocation
    #[serde(with = "secs")]
    pub command_timeout: Duration,
    #[serde(with = "secs")]
    pub sweep_interval: Duration,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(5),
            liveness_multiplier: 3,
            registration_retry: Duration::from_secs(5),
            reconnect_backoff: Duration::from_secs(5),
            backoff_multiplier: 1.0,
            backoff_max: Duration::from_secs(60),
            discovery_interval: Duration::from_secs(10),
            load_report_interval: Duration::from_secs(5),
            command_timeout: Duration::from_secs(10),
            sweep_interval: Duration::from_secs(5),
        }
    }
}

impl TimingConfig {
    pub fn liveness_window(&self) -> Duration {
        self.heartbeat_interval * self.liveness_multiplier.max(1)
    }

    pub fn reconnect(&self) -> Backoff {
        Backoff {
            base: self.reconnect_backoff,
            multiplier: self.backoff_multiplier,
            max: self.backoff_max,
        }
    }
}

/// Reconnect delay schedule; with the default multiplier of 1.0 every retry
/// waits exactly `base`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Backoff {
    pub base: Duration,
    pub multiplier: f64,
    pub max: Duration,
}

impl Backoff {
    pub fn fixed(base: Duration) -> Self {
        Self {
            base,
            multiplier: 1.0,
            max: base,
        }
    }

    /// Delay before reconnect attempt number `retry` (0-based)
    pub fn delay(&self, retry: u32) -> Duration {
        let multiplier = if self.multiplier.is_finite() { self.multiplier.max(1.0) } else { 1.0 };
        let exponent = i32::try_from(retry).unwrap_or(i32::MAX);
        let secs = self.base.as_secs_f64() * multiplier.powi(exponent);
        let cap = self.max.max(self.base);

        if !secs.is_finite() || secs >= cap.as_secs_f64() {
            cap
        } else {
            Duration::from_secs_f64(secs)
        }
    }
}

mod secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(value.as_secs_f64())
    }

    const MAX_SECS: f64 = 86_400.0;

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(deserializer)?;
        if !(secs > 0.0 && secs <= MAX_SECS) {
            return Err(serde::de::Error::custom(format!(
                "invalid duration {secs}s, expected more than 0 and at most {MAX_SECS}s"
            )));
        }
        let duration = Duration::try_from_secs_f64(secs).map_err(serde::de::Error::custom)?;
        if duration.is_zero() {
            return Err(serde::de::Error::custom(format!("duration {secs}s rounds to zero")));
        }
        Ok(duration)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_window_is_three_heartbeats() {
        let timing = TimingConfig::default();
        assert_eq!(timing.heartbeat_interval, Duration::from_secs(5));
        assert_eq!(timing.liveness_window(), Duration::from_secs(15));
    }

    #[test]
    fn test_default_backoff_is_fixed() {
        let backoff = TimingConfig::default().reconnect();
        for retry in [0, 1, 5, 100, u32::MAX] {
            assert_eq!(backoff.delay(retry), Duration::from_secs(5));
        }
    }

    #[test]
    fn test_exponential_backoff_is_capped() {
        let backoff = Backoff {
            base: Duration::from_secs(1),
            multiplier: 2.0,
            max: Duration::from_secs(10),
        };
        assert_eq!(backoff.delay(0), Duration::from_secs(1));
        assert_eq!(backoff.delay(2), Duration::from_secs(4));
        assert_eq!(backoff.delay(4), Duration::from_secs(10));
        assert_eq!(backoff.delay(10_000), Duration::from_secs(10));
    }

    #[test]
    fn test_fractional_seconds_in_config() {
        let timing: TimingConfig = serde_json::from_str(r#"{"heartbeat_interval": 0.5, "liveness_multiplier": 4}"#).unwrap();
        assert_eq!(timing.heartbeat_interval, Duration::from_millis(500));
        assert_eq!(timing.liveness_window(), Duration::from_secs(2));
        assert_eq!(timing.discovery_interval, Duration::from_secs(10));
    }

    #[test]
    fn test_zero_and_oversized_durations_rejected() {
        for raw in [
            r#"{"heartbeat_interval": 0}"#,
            r#"{"sweep_interval": 0.0}"#,
            r#"{"registration_retry": -1}"#,
            r#"{"discovery_interval": 1e20}"#,
            r#"{"command_timeout": 1e-12}"#,
        ] {
            assert!(serde_json::from_str::<TimingConfig>(raw).is_err(), "{raw} accepted");
        }
        let timing: TimingConfig = serde_json::from_str(r#"{"sweep_interval": 86400}"#).unwrap();
        assert_eq!(timing.sweep_interval, Duration::from_secs(86_400));
    }
}
