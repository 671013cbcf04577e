//! Driver configuration
//!
//! Defaults are the hardware constants. `from_env()` lets a deployment
//! override them without recompiling:
//!
//! | Variable | Field |
//! |----------|-------|
//! | `EDGETPU_PERFORMANCE_MODE` | `performance_mode` (`low`, `medium`, `high`, `max`) |
//! | `EDGETPU_CONTROL_TIMEOUT_MS` | `control_timeout` |
//! | `EDGETPU_BULK_TIMEOUT_MS` | `bulk_timeout` and `event_timeout` |
//! | `EDGETPU_POLL_LIMIT` | `poll_limit` |
//! | `EDGETPU_OPEN_TIMEOUT_MS` | `open_timeout` |

use std::str::FromStr;
use std::time::Duration;

use edgetpu_chip::wire::MAX_BULK_CHUNK;
use edgetpu_chip::PerformanceMode;
use tracing::debug;

use crate::error::{EdgeTpuError, Result};

/// Performance-mode override.
pub const ENV_PERFORMANCE_MODE: &str = "EDGETPU_PERFORMANCE_MODE";
/// Control-transfer timeout override, milliseconds.
pub const ENV_CONTROL_TIMEOUT_MS: &str = "EDGETPU_CONTROL_TIMEOUT_MS";
/// Bulk and event timeout override, milliseconds.
pub const ENV_BULK_TIMEOUT_MS: &str = "EDGETPU_BULK_TIMEOUT_MS";
/// Poll-limit override.
pub const ENV_POLL_LIMIT: &str = "EDGETPU_POLL_LIMIT";
/// Device-open wait override, milliseconds.
pub const ENV_OPEN_TIMEOUT_MS: &str = "EDGETPU_OPEN_TIMEOUT_MS";

/// Timeouts, limits and defaults used by every layer of the driver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DriverConfig {
    /// Wait for a control-transfer completion. Expiry is a hard failure.
    pub control_timeout: Duration,
    /// Wait for each bulk chunk.
    pub bulk_timeout: Duration,
    /// Wait for the end-of-inference event record.
    pub event_timeout: Duration,
    /// Largest single bulk transfer.
    pub max_bulk_chunk: usize,
    /// Register reads allowed per bring-up poll loop.
    pub poll_limit: u32,
    /// How long `open_device` waits for the accelerator to connect.
    pub open_timeout: Duration,
    /// Mode used by `open_device_default`.
    pub performance_mode: PerformanceMode,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            control_timeout: Duration::from_millis(200),
            bulk_timeout: Duration::from_millis(1000),
            event_timeout: Duration::from_millis(1000),
            max_bulk_chunk: MAX_BULK_CHUNK,
            poll_limit: 100_000,
            open_timeout: Duration::from_secs(5),
            performance_mode: PerformanceMode::High,
        }
    }
}

impl DriverConfig {
    /// Defaults overridden by `EDGETPU_*` environment variables.
    ///
    /// # Errors
    ///
    /// Returns [`EdgeTpuError::Config`] if a variable is set but does not
    /// parse.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Defaults overridden by whatever `lookup` returns for each variable.
    ///
    /// # Errors
    ///
    /// Returns [`EdgeTpuError::Config`] if a value does not parse.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();
        if let Some(mode) = parse(&lookup, ENV_PERFORMANCE_MODE)? {
            config.performance_mode = mode;
        }
        if let Some(ms) = parse::<u64, _>(&lookup, ENV_CONTROL_TIMEOUT_MS)? {
            config.control_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = parse::<u64, _>(&lookup, ENV_BULK_TIMEOUT_MS)? {
            config.bulk_timeout = Duration::from_millis(ms);
            config.event_timeout = Duration::from_millis(ms);
        }
        if let Some(limit) = parse(&lookup, ENV_POLL_LIMIT)? {
            config.poll_limit = limit;
        }
        if let Some(ms) = parse::<u64, _>(&lookup, ENV_OPEN_TIMEOUT_MS)? {
            config.open_timeout = Duration::from_millis(ms);
        }
        config.validate()?;
        debug!("Driver config: {:?}", config);
        Ok(config)
    }

    /// Reject settings the protocol cannot work with.
    ///
    /// # Errors
    ///
    /// Returns [`EdgeTpuError::Config`] for a zero chunk size or poll limit.
    pub fn validate(&self) -> Result<()> {
        if self.max_bulk_chunk == 0 {
            return Err(EdgeTpuError::config("max_bulk_chunk", "must be non-zero"));
        }
        if self.poll_limit == 0 {
            return Err(EdgeTpuError::config(ENV_POLL_LIMIT, "must be non-zero"));
        }
        Ok(())
    }

    /// Set the control-transfer timeout.
    #[must_use]
    pub const fn with_control_timeout(mut self, timeout: Duration) -> Self {
        self.control_timeout = timeout;
        self
    }

    /// Set the bulk-chunk timeout.
    #[must_use]
    pub const fn with_bulk_timeout(mut self, timeout: Duration) -> Self {
        self.bulk_timeout = timeout;
        self
    }

    /// Set the event timeout.
    #[must_use]
    pub const fn with_event_timeout(mut self, timeout: Duration) -> Self {
        self.event_timeout = timeout;
        self
    }

    /// Set the largest bulk transfer.
    #[must_use]
    pub const fn with_max_bulk_chunk(mut self, bytes: usize) -> Self {
        self.max_bulk_chunk = bytes;
        self
    }

    /// Set the poll limit.
    #[must_use]
    pub const fn with_poll_limit(mut self, limit: u32) -> Self {
        self.poll_limit = limit;
        self
    }

    /// Set the device-open wait.
    #[must_use]
    pub const fn with_open_timeout(mut self, timeout: Duration) -> Self {
        self.open_timeout = timeout;
        self
    }

    /// Set the default performance mode.
    #[must_use]
    pub const fn with_performance_mode(mut self, mode: PerformanceMode) -> Self {
        self.performance_mode = mode;
        self
    }
}

fn parse<T, F>(lookup: &F, key: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    F: Fn(&str) -> Option<String>,
{
    lookup(key)
        .map(|raw| {
            raw.trim()
                .parse()
                .map_err(|e: T::Err| EdgeTpuError::config(key, format!("'{raw}': {e}")))
        })
        .transpose()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn test_defaults_are_hardware_constants() {
        let config = DriverConfig::default();
        assert_eq!(config.control_timeout, Duration::from_millis(200));
        assert_eq!(config.max_bulk_chunk, 32 * 1024);
        assert_eq!(config.performance_mode, PerformanceMode::High);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_environment_overrides() {
        let config = DriverConfig::from_lookup(lookup(&[
            (ENV_PERFORMANCE_MODE, "MAX"),
            (ENV_CONTROL_TIMEOUT_MS, "50"),
            (ENV_BULK_TIMEOUT_MS, " 750 "),
            (ENV_POLL_LIMIT, "12"),
        ]))
        .unwrap();
        assert_eq!(config.performance_mode, PerformanceMode::Max);
        assert_eq!(config.control_timeout, Duration::from_millis(50));
        assert_eq!(config.event_timeout, Duration::from_millis(750));
        assert_eq!(config.poll_limit, 12);
        assert_eq!(config.open_timeout, DriverConfig::default().open_timeout);
    }

    #[test]
    fn test_bad_values_rejected() {
        let err = DriverConfig::from_lookup(lookup(&[(ENV_PERFORMANCE_MODE, "turbo")])).unwrap_err();
        assert!(matches!(err, EdgeTpuError::Config { ref key, .. } if key == ENV_PERFORMANCE_MODE));

        assert!(DriverConfig::from_lookup(lookup(&[(ENV_POLL_LIMIT, "0")])).is_err());
        assert!(DriverConfig::from_lookup(lookup(&[(ENV_POLL_LIMIT, "-1")])).is_err());
    }

    #[test]
    fn test_builder() {
        let config = DriverConfig::default()
            .with_poll_limit(3)
            .with_performance_mode(PerformanceMode::Low)
            .with_max_bulk_chunk(16);
        assert_eq!(config.poll_limit, 3);
        assert_eq!(config.performance_mode, PerformanceMode::Low);
        assert_eq!(config.max_bulk_chunk, 16);
    }
}
