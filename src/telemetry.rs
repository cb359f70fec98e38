use std::time::Duration;

use tracing::debug;

use crate::{
    config::BikeConfig,
    power,
    protocol::TelemetryFrame,
    types::{ButtonEvent, DeviceProfile, TelemetrySample},
};

const STATUS_START: u8 = 0x06;
const STATUS_STOP: u8 = 0x07;

/// Fields of one telemetry frame, scaled to physical units
///
/// This is the raw reading of a single frame. Session state such as filters,
/// crank counters and heart-rate fallbacks lives in [`TelemetryTracker`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DecodedFrame {
    /// Speed in km/h
    pub speed_kmh: f64,
    /// Energy in kcal
    pub calories_kcal: f64,
    /// Distance in km
    pub distance_km: f64,
    /// Cadence in rpm
    pub cadence_rpm: f64,
    /// Resistance level, at least 1
    pub resistance: u8,
    /// Heart rate, `None` when the console has no belt reading
    pub heart_rate_bpm: Option<u8>,
    /// Button pressed on the console
    pub button: Option<ButtonEvent>,
}

/// Decode a complete telemetry frame
#[must_use]
pub fn decode(frame: &TelemetryFrame, profile: &DeviceProfile) -> DecodedFrame {
    let bytes = frame.as_bytes();
    let word = |at: usize| u16::from_be_bytes([bytes[at], bytes[at + 1]]);

    let button = match bytes[22] {
        STATUS_START => Some(ButtonEvent::Start),
        STATUS_STOP => Some(ButtonEvent::Stop),
        _ => None,
    };

    DecodedFrame {
        speed_kmh: f64::from(word(6)) / 10.0,
        calories_kcal: f64::from(word(10)),
        distance_km: f64::from(word(12)) / 10.0,
        cadence_rpm: f64::from(bytes[9]) * profile.cadence_scale,
        resistance: bytes[14].max(1),
        heart_rate_bpm: (bytes[18] != 0).then_some(bytes[18]),
        button,
    }
}

/// Turns decoded frames into the published [`TelemetrySample`]
///
/// Applies the cadence filter, the heart-rate fallbacks, the crank-event
/// clock and the configured speed source. Values that a frame does not
/// provide keep their previous reading.
#[derive(Debug, Clone)]
pub struct TelemetryTracker {
    max_resistance: u8,
    cadence_filter: f64,
    external_cadence_sensor: bool,
    external_heart_rate_belt: bool,
    speed_power_based: bool,
    rider_weight_kg: f64,
    sample: TelemetrySample,
}

impl TelemetryTracker {
    /// Create a tracker with an empty sample
    #[must_use]
    pub fn new(config: &BikeConfig) -> Self {
        Self {
            max_resistance: config.max_resistance,
            cadence_filter: config.cadence_filter,
            external_cadence_sensor: config.external_cadence_sensor,
            external_heart_rate_belt: config.external_heart_rate_belt,
            speed_power_based: config.speed_power_based,
            rider_weight_kg: config.rider_weight_kg,
            sample: TelemetrySample {
                resistance: 1,
                ..TelemetrySample::default()
            },
        }
    }

    /// Fold one frame into the running sample
    ///
    /// `external_heart_rate` is the latest reading of the heart-rate
    /// collaborator, if any.
    pub fn update(
        &mut self,
        frame: &DecodedFrame,
        external_heart_rate: Option<u8>,
    ) -> TelemetrySample {
        let sample = &mut self.sample;

        if !self.external_cadence_sensor {
            if self.cadence_filter == 0.0 || frame.cadence_rpm >= self.cadence_filter {
                sample.cadence_rpm = frame.cadence_rpm;
            } else {
                debug!(
                    "Cadence {} filtered out (minimum {})",
                    frame.cadence_rpm, self.cadence_filter
                );
            }
        }

        sample.resistance = frame.resistance.clamp(1, self.max_resistance);
        sample.resistance_percent = percent_of(sample.resistance, self.max_resistance);

        let heart_rate = if self.external_heart_rate_belt {
            external_heart_rate
        } else {
            frame.heart_rate_bpm.or(external_heart_rate)
        };
        if let Some(bpm) = heart_rate {
            sample.heart_rate_bpm = bpm;
        }

        if sample.cadence_rpm > 0.0 {
            sample.crank_revolutions = sample.crank_revolutions.wrapping_add(1);
            sample.last_crank_event_time = sample
                .last_crank_event_time
                .wrapping_add(crank_interval(sample.cadence_rpm));
        }

        sample.power_watts =
            power::watts(frame.speed_kmh, sample.resistance, sample.cadence_rpm);
        sample.speed_kmh = if self.speed_power_based {
            power::speed_from_power(f64::from(sample.power_watts), self.rider_weight_kg)
        } else {
            frame.speed_kmh
        };
        sample.calories_kcal = frame.calories_kcal;
        sample.distance_km = frame.distance_km;

        debug!(
            "Telemetry: speed {:.1} km/h, cadence {} rpm, resistance {}, heart {} bpm, {} kcal, {:.1} km, {} W, crank {}/{}",
            sample.speed_kmh,
            sample.cadence_rpm,
            sample.resistance,
            sample.heart_rate_bpm,
            sample.calories_kcal,
            sample.distance_km,
            sample.power_watts,
            sample.crank_revolutions,
            sample.last_crank_event_time
        );

        *sample
    }

    /// Current sample
    #[must_use]
    pub const fn sample(&self) -> &TelemetrySample {
        &self.sample
    }

    /// Record the last requested power target
    pub fn set_requested_power(&mut self, watts: u16) {
        self.sample.requested_power_watts = Some(watts);
    }

    /// Record the last requested resistance
    pub fn set_requested_resistance(&mut self, resistance: i16) {
        self.sample.requested_resistance = Some(resistance);
    }

    /// Record the last requested cadence
    pub fn set_requested_cadence(&mut self, cadence_rpm: u16) {
        self.sample.requested_cadence_rpm = Some(cadence_rpm);
    }

    /// Update the session time
    pub fn set_elapsed(&mut self, elapsed: Duration) {
        self.sample.elapsed = elapsed;
    }

    /// Cadence reading from an external sensor
    ///
    /// Only applied with `external_cadence_sensor`; the crank counters advance
    /// from it on the next frame. Returns whether the reading was used.
    pub fn set_external_cadence(&mut self, cadence_rpm: u8) -> bool {
        if self.external_cadence_sensor {
            self.sample.cadence_rpm = f64::from(cadence_rpm);
        }
        self.external_cadence_sensor
    }

    /// Replace the heart rate with an external reading
    pub fn set_heart_rate(&mut self, bpm: u8) {
        self.sample.heart_rate_bpm = bpm;
    }
}

/// Ticks of the 1/1024 s crank clock between two revolutions at `cadence_rpm`
#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn crank_interval(cadence_rpm: f64) -> u16 {
    (1024.0 / (cadence_rpm / 60.0)) as u16
}

/// Resistance level on a 0-100 scale
#[must_use]
pub fn percent_of(resistance: u8, max_resistance: u8) -> u8 {
    let percent = u16::from(resistance) * 100 / u16::from(max_resistance.max(1));
    u8::try_from(percent).unwrap_or(100)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(edit: impl FnOnce(&mut [u8; 26])) -> TelemetryFrame {
        let mut bytes = [0u8; 26];
        bytes[0] = 0xF0;
        bytes[1] = 0xBC;
        bytes[14] = 5;
        edit(&mut bytes);
        TelemetryFrame::from_slice(&bytes).unwrap()
    }

    #[test]
    fn test_decode_fields() {
        let frame = frame(|b| {
            b[6..8].copy_from_slice(&253u16.to_be_bytes());
            b[9] = 80;
            b[10..12].copy_from_slice(&412u16.to_be_bytes());
            b[12..14].copy_from_slice(&157u16.to_be_bytes());
            b[14] = 7;
            b[18] = 132;
        });
        let decoded = decode(&frame, &DeviceProfile::CHANG_YOW);
        assert!((decoded.speed_kmh - 25.3).abs() < 1e-9);
        assert_eq!(decoded.cadence_rpm, 80.0);
        assert_eq!(decoded.calories_kcal, 412.0);
        assert!((decoded.distance_km - 15.7).abs() < 1e-9);
        assert_eq!(decoded.resistance, 7);
        assert_eq!(decoded.heart_rate_bpm, Some(132));
        assert_eq!(decoded.button, None);
    }

    #[test]
    fn test_decode_distance_high_byte() {
        let frame = frame(|b| b[12..14].copy_from_slice(&[0x01, 0x90]));
        assert!((decode(&frame, &DeviceProfile::CHANG_YOW).distance_km - 40.0).abs() < 1e-9);
    }

    #[test]
    fn test_decode_resistance_zero_clamps_to_one() {
        let frame = frame(|b| b[14] = 0);
        assert_eq!(decode(&frame, &DeviceProfile::CHANG_YOW).resistance, 1);
    }

    #[test]
    fn test_decode_buttons() {
        let start = frame(|b| b[22] = 0x06);
        let stop = frame(|b| b[22] = 0x07);
        let other = frame(|b| b[22] = 0x05);
        let profile = DeviceProfile::CHANG_YOW;
        assert_eq!(decode(&start, &profile).button, Some(ButtonEvent::Start));
        assert_eq!(decode(&stop, &profile).button, Some(ButtonEvent::Stop));
        assert_eq!(decode(&other, &profile).button, None);
    }

    #[test]
    fn test_decode_is_idempotent() {
        let frame = frame(|b| {
            b[9] = 90;
            b[18] = 100;
        });
        let profile = DeviceProfile::TELINK;
        assert_eq!(decode(&frame, &profile), decode(&frame, &profile));
    }

    #[test]
    fn test_tracker_crank_clock() {
        let mut tracker = TelemetryTracker::new(&BikeConfig::default());
        let decoded = decode(&frame(|b| b[9] = 60), &DeviceProfile::CHANG_YOW);

        let sample = tracker.update(&decoded, None);
        assert_eq!(sample.crank_revolutions, 1);
        assert_eq!(sample.last_crank_event_time, 1024);

        let sample = tracker.update(&decoded, None);
        assert_eq!(sample.crank_revolutions, 2);
        assert_eq!(sample.last_crank_event_time, 2048);

        let idle = decode(&frame(|_| {}), &DeviceProfile::CHANG_YOW);
        let sample = tracker.update(&idle, None);
        assert_eq!(sample.crank_revolutions, 2);
    }

    #[test]
    fn test_tracker_crank_clock_wraps() {
        let mut tracker = TelemetryTracker::new(&BikeConfig::default());
        let decoded = decode(&frame(|b| b[9] = 90), &DeviceProfile::CHANG_YOW);
        let mut expected: u16 = 0;
        for _ in 0..200 {
            expected = expected.wrapping_add(682);
            assert_eq!(tracker.update(&decoded, None).last_crank_event_time, expected);
        }
    }

    #[test]
    fn test_tracker_cadence_filter_keeps_previous() {
        let config = BikeConfig {
            cadence_filter: 30.0,
            ..BikeConfig::default()
        };
        let mut tracker = TelemetryTracker::new(&config);
        let profile = DeviceProfile::CHANG_YOW;

        let sample = tracker.update(&decode(&frame(|b| b[9] = 75), &profile), None);
        assert_eq!(sample.cadence_rpm, 75.0);

        let sample = tracker.update(&decode(&frame(|b| b[9] = 12), &profile), None);
        assert_eq!(sample.cadence_rpm, 75.0);
    }

    #[test]
    fn test_tracker_external_cadence_sensor() {
        let config = BikeConfig {
            external_cadence_sensor: true,
            ..BikeConfig::default()
        };
        let mut tracker = TelemetryTracker::new(&config);
        let sample = tracker.update(
            &decode(&frame(|b| b[9] = 75), &DeviceProfile::CHANG_YOW),
            None,
        );
        assert_eq!(sample.cadence_rpm, 0.0);
        assert_eq!(sample.crank_revolutions, 0);

        assert!(tracker.set_external_cadence(90));
        let sample = tracker.update(
            &decode(
                &frame(|b| {
                    b[6..8].copy_from_slice(&200u16.to_be_bytes());
                    b[9] = 75;
                }),
                &DeviceProfile::CHANG_YOW,
            ),
            None,
        );
        assert_eq!(sample.cadence_rpm, 90.0);
        assert_eq!(sample.crank_revolutions, 1);
        assert_eq!(sample.last_crank_event_time, 682);
        assert_eq!(sample.power_watts, crate::power::watts(20.0, 5, 90.0));
    }

    #[test]
    fn test_external_cadence_ignored_without_sensor() {
        let mut tracker = TelemetryTracker::new(&BikeConfig::default());
        assert!(!tracker.set_external_cadence(90));
        assert_eq!(tracker.sample().cadence_rpm, 0.0);

        let sample = tracker.update(
            &decode(&frame(|b| b[9] = 60), &DeviceProfile::CHANG_YOW),
            None,
        );
        assert_eq!(sample.cadence_rpm, 60.0);
        assert_eq!(sample.last_crank_event_time, 1024);
    }

    #[test]
    fn test_tracker_heart_rate_fallbacks() {
        let mut tracker = TelemetryTracker::new(&BikeConfig::default());
        let profile = DeviceProfile::CHANG_YOW;

        let sample = tracker.update(&decode(&frame(|b| b[18] = 120), &profile), Some(90));
        assert_eq!(sample.heart_rate_bpm, 120);

        // zero defers to the collaborator
        let sample = tracker.update(&decode(&frame(|_| {}), &profile), Some(95));
        assert_eq!(sample.heart_rate_bpm, 95);

        // nothing anywhere keeps the last value
        let sample = tracker.update(&decode(&frame(|_| {}), &profile), None);
        assert_eq!(sample.heart_rate_bpm, 95);
    }

    #[test]
    fn test_tracker_external_heart_rate_belt() {
        let config = BikeConfig {
            external_heart_rate_belt: true,
            ..BikeConfig::default()
        };
        let mut tracker = TelemetryTracker::new(&config);
        let sample = tracker.update(
            &decode(&frame(|b| b[18] = 140), &DeviceProfile::CHANG_YOW),
            Some(101),
        );
        assert_eq!(sample.heart_rate_bpm, 101);
    }

    #[test]
    fn test_tracker_power_and_speed_source() {
        let profile = DeviceProfile::CHANG_YOW;
        let moving = frame(|b| {
            b[6..8].copy_from_slice(&200u16.to_be_bytes());
            b[9] = 90;
            b[14] = 4;
        });

        let mut tracker = TelemetryTracker::new(&BikeConfig::default());
        let sample = tracker.update(&decode(&moving, &profile), None);
        assert_eq!(sample.power_watts, 183);
        assert_eq!(sample.speed_kmh, 20.0);
        assert_eq!(sample.resistance_percent, 26);

        let config = BikeConfig {
            speed_power_based: true,
            ..BikeConfig::default()
        };
        let mut tracker = TelemetryTracker::new(&config);
        let sample = tracker.update(&decode(&moving, &profile), None);
        assert!((sample.speed_kmh - power::speed_from_power(183.0, 75.0)).abs() < 1e-9);
    }

    #[test]
    fn test_tracker_clamps_to_max_resistance() {
        let config = BikeConfig {
            max_resistance: 10,
            ..BikeConfig::default()
        };
        let mut tracker = TelemetryTracker::new(&config);
        let sample = tracker.update(
            &decode(&frame(|b| b[14] = 32), &DeviceProfile::CHANG_YOW),
            None,
        );
        assert_eq!(sample.resistance, 10);
        assert_eq!(sample.resistance_percent, 100);
    }

    #[test]
    fn test_percent_of() {
        assert_eq!(percent_of(15, 15), 100);
        assert_eq!(percent_of(1, 15), 6);
        assert_eq!(percent_of(0, 0), 0);
    }
}
