use serde::{Deserialize, Serialize};
use std::{path::Path, time::Duration};
use tracing::warn;

use crate::error::{BikeError, Result};

/// Session configuration consumed by the protocol engine
///
/// Every field has a default, so a TOML file only needs to name the values it
/// overrides:
///
/// ```
/// use pedalers::BikeConfig;
///
/// let config = BikeConfig::from_toml_str("erg_filter_upper = 10.0\ngears = 2").unwrap();
/// assert_eq!(config.max_resistance, 15);
/// assert_eq!(config.gears, 2);
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BikeConfig {
    /// Highest resistance level the bike accepts
    pub max_resistance: u8,
    /// Re-issue a resistance command when a power target changes (ERG mode)
    pub force_resistance: bool,
    /// Minimum upward power delta (watts) that triggers a new resistance
    pub erg_filter_upper: f64,
    /// Minimum downward power delta (watts) that triggers a new resistance
    pub erg_filter_lower: f64,
    /// Cadence readings below this value are discarded, `0` disables the filter
    pub cadence_filter: f64,
    /// Publish a speed estimated from power instead of the reported speed
    pub speed_power_based: bool,
    /// Hand the session to the virtual device the first time it runs
    pub virtual_device_enabled: bool,
    /// Send the odometer frame ahead of every display refresh
    pub distance_display: bool,
    /// Cadence comes from an external sensor, ignore the bike's value
    pub external_cadence_sensor: bool,
    /// Heart rate comes from an external belt, ignore the bike's value
    pub external_heart_rate_belt: bool,
    /// Resistance requests drive the bike (with difficulty and gears applied)
    pub auto_resistance: bool,
    /// Multiplier applied to every requested resistance
    pub difficulty: f64,
    /// Offset added to automatic resistance requests
    pub gears: i8,
    /// Send the stop-tape frame when a stop is requested
    pub stop_tape_on_request: bool,
    /// Append the start-tape suffix to the first handshake
    pub start_on_connect: bool,
    /// Scheduler tick period in milliseconds
    pub tick_interval_ms: u64,
    /// Bounded wait for a write acknowledgment in milliseconds
    pub ack_timeout_ms: u64,
    /// Pause before each reconnect attempt in milliseconds
    pub reconnect_delay_ms: u64,
    /// Rider weight used by the speed-from-power estimate
    pub rider_weight_kg: f64,
}

impl Default for BikeConfig {
    fn default() -> Self {
        Self {
            max_resistance: 15,
            force_resistance: true,
            erg_filter_upper: 0.0,
            erg_filter_lower: 0.0,
            cadence_filter: 0.0,
            speed_power_based: false,
            virtual_device_enabled: true,
            distance_display: true,
            external_cadence_sensor: false,
            external_heart_rate_belt: false,
            auto_resistance: true,
            difficulty: 1.0,
            gears: 0,
            stop_tape_on_request: false,
            start_on_connect: false,
            tick_interval_ms: 300,
            ack_timeout_ms: 300,
            reconnect_delay_ms: 0,
            rider_weight_kg: 75.0,
        }
    }
}

impl BikeConfig {
    /// Parse a configuration from TOML text
    ///
    /// # Errors
    ///
    /// Returns [`BikeError::Config`] if the text is not valid TOML, a field has
    /// the wrong type, or the values fail [`BikeConfig::validate`].
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content).map_err(|e| BikeError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load a configuration file
    ///
    /// # Errors
    ///
    /// Returns [`BikeError::Io`] if the file cannot be read and
    /// [`BikeError::Config`] if its contents are invalid.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    /// Load a configuration file, falling back to defaults on any error
    pub fn from_file_or_default<P: AsRef<Path>>(path: P) -> Self {
        Self::from_file(path.as_ref()).unwrap_or_else(|e| {
            warn!(
                "Using default bike configuration ({}): {}",
                path.as_ref().display(),
                e
            );
            Self::default()
        })
    }

    /// Serialize the configuration as TOML
    ///
    /// # Errors
    ///
    /// Returns [`BikeError::Config`] if serialization fails.
    pub fn to_toml_string(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| BikeError::Config(e.to_string()))
    }

    /// Check the values the engine relies on
    ///
    /// # Errors
    ///
    /// Returns [`BikeError::Config`] describing the first invalid value.
    pub fn validate(&self) -> Result<()> {
        if self.max_resistance < 2 {
            return Err(BikeError::Config(format!(
                "max_resistance must be at least 2, got {}",
                self.max_resistance
            )));
        }
        if self.tick_interval_ms == 0 {
            return Err(BikeError::Config(
                "tick_interval_ms must be greater than zero".to_string(),
            ));
        }
        if self.difficulty.is_nan() || self.difficulty <= 0.0 {
            return Err(BikeError::Config(format!(
                "difficulty must be positive, got {}",
                self.difficulty
            )));
        }
        Ok(())
    }

    /// Scheduler tick period
    #[must_use]
    pub const fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    /// Bounded acknowledgment wait
    #[must_use]
    pub const fn ack_timeout(&self) -> Duration {
        Duration::from_millis(self.ack_timeout_ms)
    }

    /// Number of ticks between two display refreshes (one second of ticks)
    #[must_use]
    pub fn ticks_per_refresh(&self) -> u32 {
        u32::try_from(1000 / self.tick_interval_ms.max(1)).unwrap_or(u32::MAX)
    }
}
