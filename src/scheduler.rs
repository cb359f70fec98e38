use crate::control::clamp_resistance;

/// Start or stop request waiting for the next tick
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunIntent {
    /// Send the handshake with the start suffix
    Start,
    /// Stop the session
    Stop,
}

/// Single-slot intents shared by the notification handler and the scheduler
///
/// A newer intent overwrites an unconsumed older one.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PendingIntents {
    resistance: Option<i16>,
    run: Option<RunIntent>,
}

impl PendingIntents {
    /// Queue a resistance, replacing any pending one
    pub fn set_resistance(&mut self, resistance: i16) {
        self.resistance = Some(resistance);
    }

    /// Queue a start or stop, replacing any pending one
    pub fn set_run(&mut self, intent: RunIntent) {
        self.run = Some(intent);
    }

    /// Pending resistance, if any
    #[must_use]
    pub const fn resistance(&self) -> Option<i16> {
        self.resistance
    }

    /// Pending start or stop, if any
    #[must_use]
    pub const fn run(&self) -> Option<RunIntent> {
        self.run
    }

    /// Drop everything pending
    pub fn clear(&mut self) {
        *self = Self::default();
    }
}

/// The one thing a tick does
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickAction {
    /// A split telemetry frame is half received, stay quiet
    Hold,
    /// Send the starting handshake
    Start,
    /// Handle a stop request
    Stop,
    /// Write this resistance level
    Resistance(u8),
    /// Refresh the console display
    Display,
    /// Keep the console awake
    Keepalive,
}

/// Picks one action per tick while the session is running
///
/// Priority: start/stop, then a resistance that differs from the current
/// level, then the display refresh once per refresh period, then keepalive.
/// A refresh that comes due while something else wins is sent on the next
/// free tick.
#[derive(Debug, Clone)]
pub struct TickScheduler {
    ticks_per_refresh: u32,
    max_resistance: u8,
    counter: u32,
    display_due: bool,
}

impl TickScheduler {
    /// Create a scheduler
    #[must_use]
    pub const fn new(ticks_per_refresh: u32, max_resistance: u8) -> Self {
        Self {
            ticks_per_refresh,
            max_resistance,
            counter: 0,
            display_due: false,
        }
    }

    /// Restart the refresh period
    pub fn reset(&mut self) {
        self.counter = 0;
        self.display_due = false;
    }

    /// Run one tick
    ///
    /// `current_resistance` is the last level the bike reported and
    /// `partial_pending` tells whether reassembly is waiting for a tail.
    pub fn tick(
        &mut self,
        intents: &mut PendingIntents,
        current_resistance: u8,
        partial_pending: bool,
    ) -> TickAction {
        if self.counter == self.ticks_per_refresh {
            self.counter = 0;
            self.display_due = true;
        } else {
            self.counter += 1;
        }

        if partial_pending {
            return TickAction::Hold;
        }

        if let Some(intent) = intents.run.take() {
            return match intent {
                RunIntent::Start => TickAction::Start,
                RunIntent::Stop => TickAction::Stop,
            };
        }

        if let Some(requested) = intents.resistance.take() {
            let level = clamp_resistance(requested, self.max_resistance);
            if level != current_resistance {
                return TickAction::Resistance(level);
            }
        }

        if self.display_due {
            self.display_due = false;
            return TickAction::Display;
        }

        TickAction::Keepalive
    }
}
