//! Seams to the collaborators around the protocol engine, plus a reference
//! metrics container.

use crate::{device::BikeHandle, types::TelemetrySample};

/// Receives every published telemetry sample
pub trait MetricsSink: Send {
    /// Record one sample
    fn record(&mut self, sample: &TelemetrySample);

    /// Pause or resume aggregation
    fn set_paused(&mut self, paused: bool);

    /// Start a new lap
    fn set_lap(&mut self);

    /// Reset the session aggregates
    fn clear(&mut self);
}

/// External heart-rate reading, consulted when the console has none
pub trait HeartRateSource: Send + Sync {
    /// Latest reading in bpm, if any
    fn heart_rate(&self) -> Option<u8>;
}

/// Republishes the bike to third-party training apps
///
/// Started once, the first time the session reaches `Running`. The handle
/// gives read access to telemetry and accepts resistance, power and cadence
/// intents like any other caller.
pub trait VirtualDevice: Send {
    /// Take over the handle
    fn start(self: Box<Self>, handle: BikeHandle);
}

/// One measured quantity with session and lap aggregates
///
/// While paused the instantaneous value still updates but nothing is
/// aggregated.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Metric {
    value: f64,
    sum: f64,
    count: u64,
    min: Option<f64>,
    max: Option<f64>,
    lap_sum: f64,
    lap_count: u64,
    lap_start: f64,
    paused: bool,
}

impl Metric {
    /// Create an empty metric
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the instantaneous value
    pub fn set_value(&mut self, value: f64) {
        self.value = value;
        if self.paused {
            return;
        }
        self.sum += value;
        self.count += 1;
        self.lap_sum += value;
        self.lap_count += 1;
        self.min = Some(self.min.map_or(value, |min| min.min(value)));
        self.max = Some(self.max.map_or(value, |max| max.max(value)));
    }

    /// Instantaneous value
    #[must_use]
    pub const fn value(&self) -> f64 {
        self.value
    }

    /// Session average, `0` before the first aggregated value
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn average(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.sum / self.count as f64
        }
    }

    /// Average of the current lap
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn lap_average(&self) -> f64 {
        if self.lap_count == 0 {
            0.0
        } else {
            self.lap_sum / self.lap_count as f64
        }
    }

    /// Progress of an accumulating value since the lap started
    #[must_use]
    pub fn lap_value(&self) -> f64 {
        self.value - self.lap_start
    }

    /// Smallest aggregated value
    #[must_use]
    pub fn min(&self) -> f64 {
        self.min.unwrap_or(0.0)
    }

    /// Largest aggregated value
    #[must_use]
    pub fn max(&self) -> f64 {
        self.max.unwrap_or(0.0)
    }

    /// Reset aggregates; `reset_value` also zeroes the instantaneous value
    pub fn clear(&mut self, reset_value: bool) {
        let value = if reset_value { 0.0 } else { self.value };
        *self = Self {
            value,
            paused: self.paused,
            ..Self::default()
        };
    }

    /// Pause or resume aggregation
    pub fn set_paused(&mut self, paused: bool) {
        self.paused = paused;
    }

    /// Whether aggregation is paused
    #[must_use]
    pub const fn is_paused(&self) -> bool {
        self.paused
    }

    /// Start a new lap, leaving session aggregates untouched
    pub fn set_lap(&mut self) {
        self.lap_sum = 0.0;
        self.lap_count = 0;
        self.lap_start = self.value;
    }
}

/// Reference [`MetricsSink`] keeping one [`Metric`] per telemetry field
#[derive(Debug, Clone, Default)]
pub struct RideMetrics {
    /// Speed in km/h
    pub speed: Metric,
    /// Cadence in rpm
    pub cadence: Metric,
    /// Resistance level
    pub resistance: Metric,
    /// Heart rate in bpm
    pub heart_rate: Metric,
    /// Power in watts
    pub power: Metric,
    /// Energy in kcal
    pub calories: Metric,
    /// Distance in km
    pub distance: Metric,
    /// Session time in seconds
    pub elapsed: Metric,
    /// Cumulative crank revolutions
    pub crank_revolutions: Metric,
}

impl RideMetrics {
    /// Create empty ride metrics
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn each(&mut self, mut apply: impl FnMut(&mut Metric, bool)) {
        // the flag marks accumulating quantities
        apply(&mut self.speed, false);
        apply(&mut self.cadence, false);
        apply(&mut self.resistance, false);
        apply(&mut self.heart_rate, false);
        apply(&mut self.power, false);
        apply(&mut self.calories, true);
        apply(&mut self.distance, true);
        apply(&mut self.elapsed, true);
        apply(&mut self.crank_revolutions, true);
    }
}

impl MetricsSink for RideMetrics {
    fn record(&mut self, sample: &TelemetrySample) {
        self.speed.set_value(sample.speed_kmh);
        self.cadence.set_value(sample.cadence_rpm);
        self.resistance.set_value(f64::from(sample.resistance));
        self.heart_rate.set_value(f64::from(sample.heart_rate_bpm));
        self.power.set_value(f64::from(sample.power_watts));
        self.calories.set_value(sample.calories_kcal);
        self.distance.set_value(sample.distance_km);
        self.elapsed.set_value(sample.elapsed.as_secs_f64());
        self.crank_revolutions
            .set_value(f64::from(sample.crank_revolutions));
    }

    fn set_paused(&mut self, paused: bool) {
        self.each(|metric, _| metric.set_paused(paused));
    }

    fn set_lap(&mut self) {
        self.each(|metric, _| metric.set_lap());
    }

    fn clear(&mut self) {
        self.each(Metric::clear);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_metric_aggregates() {
        let mut metric = Metric::new();
        for value in [10.0, 20.0, 30.0] {
            metric.set_value(value);
        }
        assert_eq!(metric.value(), 30.0);
        assert_eq!(metric.average(), 20.0);
        assert_eq!(metric.min(), 10.0);
        assert_eq!(metric.max(), 30.0);
    }

    #[test]
    fn test_metric_pause_keeps_value() {
        let mut metric = Metric::new();
        metric.set_value(10.0);
        metric.set_paused(true);
        metric.set_value(50.0);
        assert_eq!(metric.value(), 50.0);
        assert_eq!(metric.average(), 10.0);
        assert_eq!(metric.max(), 10.0);

        metric.set_paused(false);
        metric.set_value(30.0);
        assert_eq!(metric.average(), 20.0);
    }

    #[test]
    fn test_metric_lap() {
        let mut metric = Metric::new();
        metric.set_value(2.0);
        metric.set_value(4.0);
        metric.set_lap();
        metric.set_value(10.0);
        assert_eq!(metric.lap_average(), 10.0);
        assert_eq!(metric.lap_value(), 6.0);
        assert!((metric.average() - 16.0 / 3.0).abs() < 1e-9);
    }

    #[test]
    fn test_metric_clear() {
        let mut metric = Metric::new();
        metric.set_value(7.0);
        metric.clear(false);
        assert_eq!(metric.value(), 7.0);
        assert_eq!(metric.average(), 0.0);

        metric.clear(true);
        assert_eq!(metric.value(), 0.0);
    }

    #[test]
    fn test_ride_metrics_sink() {
        let mut ride = RideMetrics::new();
        let sample = TelemetrySample {
            speed_kmh: 24.0,
            cadence_rpm: 80.0,
            resistance: 6,
            distance_km: 1.5,
            elapsed: Duration::from_secs(90),
            ..TelemetrySample::default()
        };
        ride.record(&sample);
        assert_eq!(ride.speed.value(), 24.0);
        assert_eq!(ride.resistance.value(), 6.0);
        assert_eq!(ride.elapsed.value(), 90.0);

        ride.set_paused(true);
        assert!(ride.distance.is_paused());
        ride.set_paused(false);

        ride.clear();
        assert_eq!(ride.distance.value(), 0.0);
        assert_eq!(ride.speed.value(), 24.0);
        assert_eq!(ride.speed.average(), 0.0);
    }
}
