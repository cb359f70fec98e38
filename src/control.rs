use tracing::debug;

use crate::{config::BikeConfig, power};

/// Clamp a requested resistance to the range the bike accepts
#[must_use]
pub fn clamp_resistance(value: i16, max_resistance: u8) -> u8 {
    let clamped = value.clamp(1, i16::from(max_resistance.max(1)));
    u8::try_from(clamped).unwrap_or(1)
}

/// Result of a resistance intent
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResistanceRequest {
    /// Value to put in the pending resistance slot
    pub queued: i16,
    /// Difficulty-scaled value remembered as the last requested resistance
    pub requested: i16,
    /// The request drives the bike and should be announced to listeners
    pub announce: bool,
}

/// Converts application intents into pending resistance values
///
/// Direct requests are scaled by the difficulty multiplier; with automatic
/// resistance on, the gear offset is added as well. Power targets go through
/// the ERG hysteresis gate and the power model first.
#[derive(Debug, Clone)]
pub struct ResistanceController {
    max_resistance: u8,
    auto_resistance: bool,
    force_resistance: bool,
    difficulty: f64,
    gears: i8,
    erg: power::ErgFilter,
}

impl ResistanceController {
    /// Create a controller from the session configuration
    #[must_use]
    pub const fn new(config: &BikeConfig) -> Self {
        Self {
            max_resistance: config.max_resistance,
            auto_resistance: config.auto_resistance,
            force_resistance: config.force_resistance,
            difficulty: config.difficulty,
            gears: config.gears,
            erg: power::ErgFilter::new(config.erg_filter_upper, config.erg_filter_lower),
        }
    }

    /// Handle a direct resistance request
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub fn request_resistance(&self, resistance: i16) -> ResistanceRequest {
        let requested = (f64::from(resistance) * self.difficulty) as i16;
        if self.auto_resistance {
            ResistanceRequest {
                queued: requested.saturating_add(i16::from(self.gears)),
                requested,
                announce: true,
            }
        } else {
            ResistanceRequest {
                queued: requested,
                requested,
                announce: false,
            }
        }
    }

    /// Handle a resistance request on the 0-100 scale used by training apps
    #[must_use]
    pub fn request_percent(&self, percent: u8) -> ResistanceRequest {
        let level = i16::from(percent.min(100)) * i16::from(self.max_resistance) / 100;
        self.request_resistance(level)
    }

    /// Handle a power target (ERG mode)
    ///
    /// Returns `None` when resistance forcing is off or the target did not
    /// move past the hysteresis thresholds.
    #[must_use]
    pub fn request_power(
        &self,
        target_watts: u16,
        current_watts: u16,
        cadence_rpm: f64,
        current_resistance: u8,
    ) -> Option<ResistanceRequest> {
        let react = self
            .erg
            .should_react(f64::from(target_watts), f64::from(current_watts));
        debug!(
            "Power target {} W against {} W (react: {})",
            target_watts, current_watts, react
        );
        if !self.force_resistance || !react {
            return None;
        }
        let level = power::resistance_from_power(
            target_watts,
            cadence_rpm,
            self.max_resistance,
            current_resistance,
        );
        Some(self.request_resistance(i16::from(level)))
    }

    /// Gear offset added to automatic requests
    #[must_use]
    pub const fn gears(&self) -> i8 {
        self.gears
    }

    /// Change the gear offset
    pub fn set_gears(&mut self, gears: i8) {
        self.gears = gears;
    }

    /// Highest resistance level
    #[must_use]
    pub const fn max_resistance(&self) -> u8 {
        self.max_resistance
    }
}
