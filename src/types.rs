use serde::{Deserialize, Serialize};
use std::{fmt, time::Duration};

/// Advertised name prefix of every supported bike
pub const BIKE_NAME_PREFIX: &str = "Domyos-Bike";

/// Advertised name prefix of the Domyos bridge, which must never be picked up
pub const BRIDGE_NAME_PREFIX: &str = "DomyosBridge";

/// Address prefix that identifies the Telink radio module
pub const TELINK_ADDRESS_PREFIX: &str = "57";

/// Connection lifecycle of a bike session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConnectionState {
    /// Session created, nothing started yet
    Idle,
    /// Looking for a matching advertisement
    Scanning,
    /// Transport-level connection in progress
    Connecting,
    /// Looking for the communication service
    ServicesDiscovering,
    /// Resolving the write/notify characteristics and subscribing
    CharacteristicsBinding,
    /// Sending the dialect handshake
    HandshakeInit,
    /// Steady state: telemetry flows and the tick scheduler runs
    Running,
    /// Link lost, a reconnect follows immediately
    Disconnected,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => write!(f, "Idle"),
            Self::Scanning => write!(f, "Scanning"),
            Self::Connecting => write!(f, "Connecting"),
            Self::ServicesDiscovering => write!(f, "Discovering services"),
            Self::CharacteristicsBinding => write!(f, "Binding characteristics"),
            Self::HandshakeInit => write!(f, "Handshake"),
            Self::Running => write!(f, "Running"),
            Self::Disconnected => write!(f, "Disconnected"),
        }
    }
}

/// Radio module family, which decides the wire dialect
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Dialect {
    /// ChangYow module: splits long notifications, one-byte cadence display
    ChangYow,
    /// Telink module: whole notifications, 16-bit cadence display, x10 display scale
    Telink,
}

impl fmt::Display for Dialect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ChangYow => write!(f, "ChangYow"),
            Self::Telink => write!(f, "Telink"),
        }
    }
}

/// Wire layout differences between the two dialects
///
/// Chosen once from the advertisement and never mutated afterwards. The codec
/// and decoder consult these fields instead of branching on the module type.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DeviceProfile {
    /// Module family
    pub dialect: Dialect,
    /// Telemetry frames arrive split into a 20-byte head and a short tail
    pub fragmenting: bool,
    /// Display frames carry cadence as a 16-bit field (bytes 15-16)
    pub wide_cadence: bool,
    /// Multiplier applied to speed, cadence and calories on the display
    pub display_scale: u16,
    /// Multiplier applied to the cadence byte of inbound telemetry
    pub cadence_scale: f64,
}

impl DeviceProfile {
    /// Profile for the ChangYow module
    pub const CHANG_YOW: Self = Self {
        dialect: Dialect::ChangYow,
        fragmenting: true,
        wide_cadence: false,
        display_scale: 1,
        cadence_scale: 1.0,
    };

    /// Profile for the Telink module
    pub const TELINK: Self = Self {
        dialect: Dialect::Telink,
        fragmenting: false,
        wide_cadence: true,
        display_scale: 10,
        cadence_scale: 1.0,
    };

    /// Select a profile from an advertisement
    ///
    /// Returns `None` when the name does not belong to a supported bike.
    #[must_use]
    pub fn detect(name: &str, address: &str) -> Option<Self> {
        if !name.starts_with(BIKE_NAME_PREFIX) || name.starts_with(BRIDGE_NAME_PREFIX) {
            return None;
        }
        if address.starts_with(TELINK_ADDRESS_PREFIX) {
            Some(Self::TELINK)
        } else {
            Some(Self::CHANG_YOW)
        }
    }
}

/// Button press reported in the status byte of a telemetry frame
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ButtonEvent {
    /// Start button (status 0x06)
    Start,
    /// Stop button (status 0x07)
    Stop,
}

/// Normalized telemetry published once per accepted frame
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct TelemetrySample {
    /// Speed in km/h
    pub speed_kmh: f64,
    /// Cadence in rpm
    pub cadence_rpm: f64,
    /// Resistance level, always within `1..=max_resistance`
    pub resistance: u8,
    /// Resistance on a 0-100 scale
    pub resistance_percent: u8,
    /// Heart rate in bpm, `0` when no reading has ever been available
    pub heart_rate_bpm: u8,
    /// Energy in kcal as reported by the console
    pub calories_kcal: f64,
    /// Distance in km as reported by the console
    pub distance_km: f64,
    /// Modeled power output in watts
    pub power_watts: u16,
    /// Cumulative crank revolutions
    pub crank_revolutions: u32,
    /// Last crank event time in 1/1024 s, wrapping
    pub last_crank_event_time: u16,
    /// Last requested power target in watts
    pub requested_power_watts: Option<u16>,
    /// Last requested resistance
    pub requested_resistance: Option<i16>,
    /// Last requested cadence in rpm
    pub requested_cadence_rpm: Option<u16>,
    /// Session time the console has been running
    pub elapsed: Duration,
}

/// Lifecycle notifications broadcast by a running session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum BikeEvent {
    /// Transport link established
    Connected {
        /// Advertised name of the bike
        name: String,
        /// Selected dialect
        dialect: Dialect,
    },
    /// Handshake finished, telemetry flows
    Running,
    /// Link lost, reconnecting
    Disconnected,
    /// The start sequence was sent
    Started,
    /// A stop request was handled
    Stopped,
    /// Resistance reported by the bike
    ResistanceRead(u8),
    /// Resistance queued by an automatic request
    ResistanceRequested(i16),
}

/// Advertisement details of a discovered bike
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceInfo {
    /// Advertised name
    pub name: String,
    /// Device address as rendered by the platform
    pub address: String,
    /// Signal strength (RSSI)
    pub rssi: i16,
}

impl DeviceInfo {
    /// Create new device info
    #[must_use]
    pub const fn new(name: String, address: String, rssi: i16) -> Self {
        Self {
            name,
            address,
            rssi,
        }
    }

    /// Profile selected by this advertisement, if it is a supported bike
    #[must_use]
    pub fn profile(&self) -> Option<DeviceProfile> {
        DeviceProfile::detect(&self.name, &self.address)
    }
}

/// Transport-level connection parameters
#[derive(Debug, Clone)]
pub struct ConnectionParams {
    /// Connection timeout in milliseconds
    pub timeout_ms: u64,
    /// Length of one scan window in milliseconds
    pub scan_timeout_ms: u64,
}

impl Default for ConnectionParams {
    fn default() -> Self {
        Self {
            timeout_ms: 30_000,
            scan_timeout_ms: 10_000,
        }
    }
}
