//! Empirical power curve of the bike and the ERG helpers built on it.
//!
//! The curve is `(10.39 + 1.45 * (level - 1)) * e^(0.028 * cadence)`.

/// Base output at resistance 1, before cadence modulation
const BASE_WATTS: f64 = 10.39;
/// Output added per resistance level
const WATTS_PER_LEVEL: f64 = 1.45;
/// Exponential cadence coefficient
const CADENCE_COEFFICIENT: f64 = 0.028;

const GRAVITY: f64 = 9.8067;
const ROLLING_RESISTANCE: f64 = 0.005;
const AIR_DENSITY: f64 = 1.226;
const DRAG_AREA: f64 = 0.324;
const BIKE_MASS_KG: f64 = 9.0;
const NEWTON_ITERATIONS: usize = 30;

/// Modeled output at a resistance level and cadence, truncated to whole watts
#[must_use]
#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
pub fn watts_from_resistance(level: f64, cadence_rpm: f64) -> u16 {
    let watts =
        (BASE_WATTS + WATTS_PER_LEVEL * (level - 1.0)) * (CADENCE_COEFFICIENT * cadence_rpm).exp();
    watts as u16
}

/// Current output: zero while the flywheel is not turning
#[must_use]
pub fn watts(speed_kmh: f64, resistance: u8, cadence_rpm: f64) -> u16 {
    if speed_kmh <= 0.0 {
        return 0;
    }
    watts_from_resistance(f64::from(resistance), cadence_rpm)
}

/// Lowest level whose modeled output brackets `target_watts` with the next level
///
/// Levels `1..max_resistance - 1` are scanned; when no bracket exists the
/// `current` level is kept.
#[must_use]
pub fn resistance_from_power(
    target_watts: u16,
    cadence_rpm: f64,
    max_resistance: u8,
    current: u8,
) -> u8 {
    (1..max_resistance.saturating_sub(1))
        .find(|level| {
            let low = watts_from_resistance(f64::from(*level), cadence_rpm);
            let high = watts_from_resistance(f64::from(*level) + 1.0, cadence_rpm);
            low <= target_watts && target_watts <= high
        })
        .unwrap_or(current)
}

/// Hysteresis gate for power targets
///
/// A new resistance is only worth sending when the target moved past one of
/// the thresholds. Both thresholds at `0` react to every change.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct ErgFilter {
    /// Minimum upward delta in watts
    pub upper: f64,
    /// Minimum downward delta in watts
    pub lower: f64,
}

impl ErgFilter {
    /// Create a filter from its thresholds
    #[must_use]
    pub const fn new(upper: f64, lower: f64) -> Self {
        Self { upper, lower }
    }

    /// Whether `target_watts` is far enough from `current_watts` to react
    #[must_use]
    pub fn should_react(&self, target_watts: f64, current_watts: f64) -> bool {
        let delta_up = target_watts - current_watts;
        let delta_down = current_watts - target_watts;
        delta_up > self.upper || delta_down > self.lower
    }
}

/// Flat-road speed, in km/h, that a rider of `rider_weight_kg` holds at `watts`
///
/// Solves `P = v * (m * g * Crr + 0.5 * rho * CdA * v^2)` for `v` by Newton
/// iteration.
#[must_use]
pub fn speed_from_power(watts: f64, rider_weight_kg: f64) -> f64 {
    if watts <= 0.0 {
        return 0.0;
    }
    let rolling = (rider_weight_kg + BIKE_MASS_KG) * GRAVITY * ROLLING_RESISTANCE;
    let drag = 0.5 * AIR_DENSITY * DRAG_AREA;

    let mut velocity = (watts / drag).cbrt();
    for _ in 0..NEWTON_ITERATIONS {
        let residual = drag * velocity.powi(3) + rolling * velocity - watts;
        let slope = 3.0 * drag * velocity.powi(2) + rolling;
        let step = residual / slope;
        velocity -= step;
        if step.abs() < 1e-9 {
            break;
        }
    }
    velocity.max(0.0) * 3.6
}
