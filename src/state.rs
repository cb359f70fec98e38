use tracing::{debug, info};

use crate::types::{ConnectionState, DeviceProfile};

/// Transport callbacks and internal milestones that drive the session
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum LinkEvent {
    /// The application started the session
    Start,
    /// An advertisement matched a supported bike
    DeviceFound(DeviceProfile),
    /// Transport-level connection established
    Connected,
    /// The communication service was found
    ServiceFound,
    /// Write and notify characteristics resolved, notifications subscribed
    CharacteristicsBound,
    /// Every handshake frame was sent
    HandshakeComplete,
    /// The link dropped or a transport step failed
    LinkLost,
    /// The reconnect pause elapsed
    Retry,
}

/// Work the driver performs after a transition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    /// Scan for a matching advertisement
    StartScan,
    /// Connect to the selected bike
    Connect,
    /// Look up the communication service
    DiscoverServices,
    /// Resolve characteristics and subscribe to notifications
    BindCharacteristics,
    /// Send the dialect handshake
    SendHandshake,
    /// Enter steady state
    EnterRunning {
        /// First time this session reached `Running`
        first_time: bool,
    },
    /// Forget per-link state (reassembly buffer, pending acknowledgments)
    ResetSession,
    /// Wait for the reconnect pause, then deliver [`LinkEvent::Retry`]
    ScheduleRetry,
}

/// Connection lifecycle as a pure transition function
///
/// Each [`LinkEvent`] moves the machine at most one step and returns the
/// actions the driver has to carry out. Events that do not apply to the
/// current state are ignored.
#[derive(Debug, Clone)]
pub struct ConnectionMachine {
    state: ConnectionState,
    profile: Option<DeviceProfile>,
    has_run: bool,
}

impl Default for ConnectionMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionMachine {
    /// Create an idle machine
    #[must_use]
    pub const fn new() -> Self {
        Self {
            state: ConnectionState::Idle,
            profile: None,
            has_run: false,
        }
    }

    /// Current state
    #[must_use]
    pub const fn state(&self) -> ConnectionState {
        self.state
    }

    /// Profile selected at discovery, kept across reconnects
    #[must_use]
    pub const fn profile(&self) -> Option<&DeviceProfile> {
        self.profile.as_ref()
    }

    /// Apply one event
    pub fn handle(&mut self, event: LinkEvent) -> Vec<Action> {
        use ConnectionState as S;

        let (next, actions) = match (self.state, event) {
            (S::Idle, LinkEvent::Start) => (S::Scanning, vec![Action::StartScan]),
            (S::Scanning, LinkEvent::DeviceFound(profile)) => {
                self.profile = Some(profile);
                (S::Connecting, vec![Action::Connect])
            }
            (S::Connecting, LinkEvent::Connected) => {
                (S::ServicesDiscovering, vec![Action::DiscoverServices])
            }
            (S::ServicesDiscovering, LinkEvent::ServiceFound) => {
                (S::CharacteristicsBinding, vec![Action::BindCharacteristics])
            }
            (S::CharacteristicsBinding, LinkEvent::CharacteristicsBound) => {
                (S::HandshakeInit, vec![Action::SendHandshake])
            }
            (S::HandshakeInit, LinkEvent::HandshakeComplete) => {
                let first_time = !self.has_run;
                self.has_run = true;
                (S::Running, vec![Action::EnterRunning { first_time }])
            }
            (S::Idle | S::Disconnected, LinkEvent::LinkLost) => (self.state, Vec::new()),
            (_, LinkEvent::LinkLost) => (
                S::Disconnected,
                vec![Action::ResetSession, Action::ScheduleRetry],
            ),
            (S::Disconnected, LinkEvent::Retry) => {
                if self.profile.is_some() {
                    (S::Connecting, vec![Action::Connect])
                } else {
                    (S::Scanning, vec![Action::StartScan])
                }
            }
            (state, event) => {
                debug!("Ignoring {:?} in state {}", event, state);
                (state, Vec::new())
            }
        };

        if next != self.state {
            info!("Connection state: {} -> {}", self.state, next);
            self.state = next;
        }
        actions
    }
}
