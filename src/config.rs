//! Flight software tunables.
//!
//! Defaults are the flight values. A JSON file may override any subset of
//! fields; missing fields keep their defaults.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::health::WatchdogTimeout;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read config {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("malformed config: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FlightConfig {
    pub sensor_period_ms: u64,
    pub radiation_period_ms: u64,
    pub comm_period_ms: u64,
    pub watchdog_period_ms: u64,
    pub queue_timeout_ms: u64,
    pub beacon_interval_ms: u64,
    pub health_poll_interval_ms: u64,

    pub telemetry_queue_capacity: usize,
    pub command_queue_capacity: usize,

    pub battery_critical_mv: u16,
    /// Voltage above the critical threshold at which payload shutdown re-arms.
    pub battery_recovery_band_mv: u16,
    pub temperature_min_c: f32,
    pub temperature_max_c: f32,
    /// Distance inside the limits at which the temperature fault re-arms.
    pub temperature_hysteresis_c: f32,

    pub wake_pulse_ms: u64,
    pub reset_delay_ms: u64,
    pub uptime_increment_s: u32,

    pub iwdg_prescaler: u32,
    pub iwdg_reload: u32,
    pub lsi_hz: u32,
}

impl Default for FlightConfig {
    fn default() -> Self {
        Self {
            sensor_period_ms: 1000,
            radiation_period_ms: 1000,
            comm_period_ms: 100,
            watchdog_period_ms: 5000,
            queue_timeout_ms: 10,
            beacon_interval_ms: 30_000,
            health_poll_interval_ms: 60_000,

            telemetry_queue_capacity: 10,
            command_queue_capacity: 5,

            battery_critical_mv: 3400,
            battery_recovery_band_mv: 100,
            temperature_min_c: -20.0,
            temperature_max_c: 70.0,
            temperature_hysteresis_c: 2.0,

            wake_pulse_ms: 100,
            reset_delay_ms: 100,
            uptime_increment_s: 5,

            iwdg_prescaler: 64,
            iwdg_reload: 4095,
            lsi_hz: 32_000,
        }
    }
}

impl FlightConfig {
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json_str(&json)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let periods = [
            ("sensor_period_ms", self.sensor_period_ms),
            ("radiation_period_ms", self.radiation_period_ms),
            ("comm_period_ms", self.comm_period_ms),
            ("watchdog_period_ms", self.watchdog_period_ms),
            ("health_poll_interval_ms", self.health_poll_interval_ms),
        ];
        if let Some((name, _)) = periods.iter().find(|(_, ms)| *ms == 0) {
            return Err(ConfigError::Invalid(format!("{name} must be non-zero")));
        }

        if self.telemetry_queue_capacity == 0 || self.command_queue_capacity == 0 {
            return Err(ConfigError::Invalid("queue capacities must be non-zero".into()));
        }

        if self.temperature_min_c >= self.temperature_max_c {
            return Err(ConfigError::Invalid(format!(
                "temperature limits inverted: min {} >= max {}",
                self.temperature_min_c, self.temperature_max_c
            )));
        }
        if self.temperature_hysteresis_c < 0.0
            || self.temperature_hysteresis_c * 2.0 >= self.temperature_max_c - self.temperature_min_c
        {
            return Err(ConfigError::Invalid("temperature hysteresis does not fit the limits".into()));
        }

        let window = self.watchdog_timeout().window();
        if self.watchdog_period() >= window {
            return Err(ConfigError::Invalid(format!(
                "watchdog period {} ms does not fit the {} ms IWDG window",
                self.watchdog_period_ms,
                window.as_millis()
            )));
        }

        Ok(())
    }

    #[must_use]
    pub fn sensor_period(&self) -> Duration {
        Duration::from_millis(self.sensor_period_ms)
    }

    #[must_use]
    pub fn radiation_period(&self) -> Duration {
        Duration::from_millis(self.radiation_period_ms)
    }

    #[must_use]
    pub fn comm_period(&self) -> Duration {
        Duration::from_millis(self.comm_period_ms)
    }

    #[must_use]
    pub fn watchdog_period(&self) -> Duration {
        Duration::from_millis(self.watchdog_period_ms)
    }

    #[must_use]
    pub fn queue_timeout(&self) -> Duration {
        Duration::from_millis(self.queue_timeout_ms)
    }

    #[must_use]
    pub fn wake_pulse(&self) -> Duration {
        Duration::from_millis(self.wake_pulse_ms)
    }

    #[must_use]
    pub fn reset_delay(&self) -> Duration {
        Duration::from_millis(self.reset_delay_ms)
    }

    #[must_use]
    pub fn watchdog_timeout(&self) -> WatchdogTimeout {
        WatchdogTimeout::from_iwdg(self.iwdg_prescaler, self.iwdg_reload, self.lsi_hz)
    }
}
