use crate::{
    ble::{BleTransport, Transport, TransportEvent},
    config::BikeConfig,
    control::{ResistanceController, ResistanceRequest},
    error::{BikeError, Result},
    metrics::{HeartRateSource, MetricsSink, VirtualDevice},
    protocol::{
        handshake_sequence, is_response_ack, Ack, Assembly, DisplaySnapshot, FrameAssembler,
        OutboundCommand, TelemetryFrame,
    },
    scheduler::{PendingIntents, RunIntent, TickAction, TickScheduler},
    state::{Action, ConnectionMachine, LinkEvent},
    telemetry::{decode, TelemetryTracker},
    types::{
        BikeEvent, ButtonEvent, ConnectionParams, ConnectionState, DeviceInfo, DeviceProfile,
        TelemetrySample,
    },
};
use std::{collections::VecDeque, sync::Arc, time::Duration};
use tokio::{
    sync::{broadcast, mpsc, watch},
    time::{self, timeout, timeout_at, Instant, MissedTickBehavior},
};
use tracing::{debug, info, warn};

/// Capacity of the lifecycle event channel
const EVENT_CAPACITY: usize = 64;

/// Intent sent from a [`BikeHandle`] to the running session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BikeCommand {
    /// ERG target in watts
    SetTargetPower(u16),
    /// Resistance level, before difficulty and gears
    SetResistance(i16),
    /// Resistance on a 0-100 scale
    SetResistancePercent(u8),
    /// Cadence target in rpm (recorded only)
    SetTargetCadence(u16),
    /// Cadence from an external sensor, used with `external_cadence_sensor`
    ExternalCadence(u8),
    /// Gear offset for automatic requests
    SetGears(i8),
    /// Start the console session
    Start,
    /// Stop the console session
    Stop,
    /// Pause or resume elapsed time and aggregation
    Pause(bool),
    /// Mark a lap
    Lap,
    /// Reset the session aggregates
    ClearStats,
    /// Disconnect and end [`DomyosBike::run`]
    Shutdown,
}

/// Cloneable handle to a running bike session
///
/// Every method only queues an intent; it is applied by the session task on
/// its next turn.
#[derive(Debug, Clone)]
pub struct BikeHandle {
    commands: mpsc::UnboundedSender<BikeCommand>,
    telemetry: watch::Receiver<TelemetrySample>,
    state: watch::Receiver<ConnectionState>,
    events: broadcast::Sender<BikeEvent>,
}

impl BikeHandle {
    fn send(&self, command: BikeCommand) -> Result<()> {
        self.commands
            .send(command)
            .map_err(|_| BikeError::Disconnected)
    }

    /// Request a power target (ERG mode)
    ///
    /// # Errors
    ///
    /// Returns [`BikeError::Disconnected`] if the session has ended.
    pub fn set_target_power(&self, watts: u16) -> Result<()> {
        self.send(BikeCommand::SetTargetPower(watts))
    }

    /// Request a resistance level
    ///
    /// The difficulty multiplier (and with automatic resistance the gear
    /// offset) is applied, and the result is clamped to the bike's range
    /// before it is written.
    ///
    /// # Errors
    ///
    /// Returns [`BikeError::Disconnected`] if the session has ended.
    pub fn set_resistance(&self, resistance: i16) -> Result<()> {
        self.send(BikeCommand::SetResistance(resistance))
    }

    /// Request a resistance on the 0-100 scale
    ///
    /// # Errors
    ///
    /// Returns [`BikeError::InvalidParameters`] for a value above 100 and
    /// [`BikeError::Disconnected`] if the session has ended.
    pub fn set_resistance_percent(&self, percent: u8) -> Result<()> {
        if percent > 100 {
            return Err(BikeError::InvalidParameters(format!(
                "resistance percent must be at most 100, got {percent}"
            )));
        }
        self.send(BikeCommand::SetResistancePercent(percent))
    }

    /// Record a cadence target
    ///
    /// # Errors
    ///
    /// Returns [`BikeError::Disconnected`] if the session has ended.
    pub fn set_target_cadence(&self, cadence_rpm: u16) -> Result<()> {
        self.send(BikeCommand::SetTargetCadence(cadence_rpm))
    }

    /// Feed a reading from an external cadence sensor
    ///
    /// Ignored unless the configuration sets `external_cadence_sensor`.
    ///
    /// # Errors
    ///
    /// Returns [`BikeError::Disconnected`] if the session has ended.
    pub fn set_external_cadence(&self, cadence_rpm: u8) -> Result<()> {
        self.send(BikeCommand::ExternalCadence(cadence_rpm))
    }

    /// Change the gear offset
    ///
    /// # Errors
    ///
    /// Returns [`BikeError::Disconnected`] if the session has ended.
    pub fn set_gears(&self, gears: i8) -> Result<()> {
        self.send(BikeCommand::SetGears(gears))
    }

    /// Start the console session
    ///
    /// # Errors
    ///
    /// Returns [`BikeError::Disconnected`] if the session has ended.
    pub fn start(&self) -> Result<()> {
        self.send(BikeCommand::Start)
    }

    /// Stop the console session
    ///
    /// # Errors
    ///
    /// Returns [`BikeError::Disconnected`] if the session has ended.
    pub fn stop(&self) -> Result<()> {
        self.send(BikeCommand::Stop)
    }

    /// Pause or resume
    ///
    /// # Errors
    ///
    /// Returns [`BikeError::Disconnected`] if the session has ended.
    pub fn pause(&self, paused: bool) -> Result<()> {
        self.send(BikeCommand::Pause(paused))
    }

    /// Mark a lap
    ///
    /// # Errors
    ///
    /// Returns [`BikeError::Disconnected`] if the session has ended.
    pub fn lap(&self) -> Result<()> {
        self.send(BikeCommand::Lap)
    }

    /// Reset the session aggregates
    ///
    /// # Errors
    ///
    /// Returns [`BikeError::Disconnected`] if the session has ended.
    pub fn clear_stats(&self) -> Result<()> {
        self.send(BikeCommand::ClearStats)
    }

    /// End the session
    ///
    /// # Errors
    ///
    /// Returns [`BikeError::Disconnected`] if the session has already ended.
    pub fn shutdown(&self) -> Result<()> {
        self.send(BikeCommand::Shutdown)
    }

    /// Telemetry updates
    #[must_use]
    pub fn telemetry(&self) -> watch::Receiver<TelemetrySample> {
        self.telemetry.clone()
    }

    /// Latest telemetry sample
    #[must_use]
    pub fn latest(&self) -> TelemetrySample {
        *self.telemetry.borrow()
    }

    /// Connection state updates
    #[must_use]
    pub fn connection_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }

    /// Lifecycle events from now on
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<BikeEvent> {
        self.events.subscribe()
    }
}

/// Protocol engine for one Domyos bike
///
/// Owns the whole session: connection state machine, reassembly buffer,
/// pending intents and tick scheduler. [`DomyosBike::run`] drives everything
/// from a single task, so none of that state is shared.
///
/// ```no_run
/// use pedalers::{BikeConfig, DomyosBike};
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let (bike, handle) = DomyosBike::discover(BikeConfig::default()).await?;
///     let session = tokio::spawn(bike.run());
///
///     handle.set_target_power(150)?;
///     let mut telemetry = handle.telemetry();
///     telemetry.changed().await?;
///     println!("{:.0} W", f64::from(telemetry.borrow().power_watts));
///
///     handle.shutdown()?;
///     session.await??;
///     Ok(())
/// }
/// ```
pub struct DomyosBike<T: Transport> {
    transport: T,
    config: BikeConfig,
    params: ConnectionParams,
    machine: ConnectionMachine,
    profile: DeviceProfile,
    device: Option<DeviceInfo>,
    assembler: FrameAssembler,
    tracker: TelemetryTracker,
    controller: ResistanceController,
    intents: PendingIntents,
    scheduler: TickScheduler,
    commands: mpsc::UnboundedReceiver<BikeCommand>,
    command_sender: mpsc::WeakUnboundedSender<BikeCommand>,
    telemetry_tx: watch::Sender<TelemetrySample>,
    state_tx: watch::Sender<ConnectionState>,
    events_tx: broadcast::Sender<BikeEvent>,
    metrics: Option<Box<dyn MetricsSink>>,
    heart_rate: Option<Arc<dyn HeartRateSource>>,
    virtual_device: Option<Box<dyn VirtualDevice>>,
    elapsed: Duration,
    paused: bool,
    start_on_connect: bool,
    retry_at: Option<Instant>,
}

impl DomyosBike<BleTransport> {
    /// Create a session on the platform's Bluetooth stack
    ///
    /// Scanning only starts once [`DomyosBike::run`] is polled.
    ///
    /// # Errors
    ///
    /// Returns [`BikeError::Ble`] if Bluetooth cannot be initialized and
    /// [`BikeError::Config`] for an invalid configuration.
    pub async fn discover(config: BikeConfig) -> Result<(Self, BikeHandle)> {
        let transport = BleTransport::new().await?;
        Self::new(transport, config)
    }
}

impl<T: Transport> DomyosBike<T> {
    /// Create a session over any transport
    ///
    /// # Errors
    ///
    /// Returns [`BikeError::Config`] if the configuration does not validate.
    pub fn new(transport: T, config: BikeConfig) -> Result<(Self, BikeHandle)> {
        config.validate()?;

        let (command_tx, commands) = mpsc::unbounded_channel();
        let tracker = TelemetryTracker::new(&config);
        let (telemetry_tx, telemetry_rx) = watch::channel(*tracker.sample());
        let (state_tx, state_rx) = watch::channel(ConnectionState::Idle);
        let (events_tx, _) = broadcast::channel(EVENT_CAPACITY);

        let handle = BikeHandle {
            commands: command_tx.clone(),
            telemetry: telemetry_rx,
            state: state_rx,
            events: events_tx.clone(),
        };

        let profile = DeviceProfile::CHANG_YOW;
        let bike = Self {
            transport,
            params: ConnectionParams::default(),
            machine: ConnectionMachine::new(),
            profile,
            device: None,
            assembler: FrameAssembler::new(&profile),
            tracker,
            controller: ResistanceController::new(&config),
            intents: PendingIntents::default(),
            scheduler: TickScheduler::new(config.ticks_per_refresh(), config.max_resistance),
            commands,
            command_sender: command_tx.downgrade(),
            telemetry_tx,
            state_tx,
            events_tx,
            metrics: None,
            heart_rate: None,
            virtual_device: None,
            elapsed: Duration::ZERO,
            paused: false,
            start_on_connect: config.start_on_connect,
            retry_at: None,
            config,
        };
        Ok((bike, handle))
    }

    /// Use custom scan and connect timeouts
    #[must_use]
    pub fn with_connection_params(mut self, params: ConnectionParams) -> Self {
        self.params = params;
        self
    }

    /// Forward every sample to a metrics collaborator
    #[must_use]
    pub fn with_metrics_sink(mut self, sink: Box<dyn MetricsSink>) -> Self {
        self.metrics = Some(sink);
        self
    }

    /// Consult an external heart-rate source
    #[must_use]
    pub fn with_heart_rate_source(mut self, source: Arc<dyn HeartRateSource>) -> Self {
        self.heart_rate = Some(source);
        self
    }

    /// Start a virtual device the first time the session runs
    #[must_use]
    pub fn with_virtual_device(mut self, device: Box<dyn VirtualDevice>) -> Self {
        self.virtual_device = Some(device);
        self
    }

    /// Drive the session until shutdown
    ///
    /// Connection failures never end the loop: the link is retried until
    /// [`BikeHandle::shutdown`] is called or every handle is dropped.
    ///
    /// # Errors
    ///
    /// Currently always returns `Ok`; transport errors are handled by
    /// reconnecting.
    pub async fn run(mut self) -> Result<()> {
        info!("Starting Domyos bike session");
        self.dispatch(LinkEvent::Start).await;

        let mut ticker = time::interval(self.config.tick_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let retry_at = self.retry_at;
            tokio::select! {
                _ = ticker.tick() => self.on_tick().await,
                event = self.transport.next_event() => match event {
                    Some(event) => self.on_transport_event(event).await,
                    None => {
                        info!("Transport closed");
                        break;
                    }
                },
                command = self.commands.recv() => match command {
                    Some(BikeCommand::Shutdown) | None => break,
                    Some(command) => self.on_command(command),
                },
                () = time::sleep_until(retry_at.unwrap_or_else(Instant::now)), if retry_at.is_some() => {
                    self.retry_at = None;
                    self.dispatch(LinkEvent::Retry).await;
                }
            }
        }

        info!("Shutting down bike session");
        if let Err(e) = self.transport.disconnect().await {
            warn!("Disconnect failed: {}", e);
        }
        Ok(())
    }

    /// Feed an event to the state machine and carry out the resulting actions
    async fn dispatch(&mut self, event: LinkEvent) {
        let mut queue = VecDeque::from([event]);
        while let Some(event) = queue.pop_front() {
            let actions = self.machine.handle(event);
            self.state_tx.send_replace(self.machine.state());
            for action in actions {
                if let Some(next) = self.perform(action).await {
                    queue.push_back(next);
                }
            }
        }
    }

    async fn perform(&mut self, action: Action) -> Option<LinkEvent> {
        match action {
            Action::StartScan => Some(self.scan().await),
            Action::Connect => {
                if let Some(profile) = self.machine.profile() {
                    self.profile = *profile;
                }
                let result = self.transport.connect(&self.params).await;
                let next = link_step(result, LinkEvent::Connected, "Connect");
                if next == LinkEvent::Connected {
                    let name = self
                        .device
                        .as_ref()
                        .map(|device| device.name.clone())
                        .unwrap_or_default();
                    self.emit(BikeEvent::Connected {
                        name,
                        dialect: self.profile.dialect,
                    });
                }
                Some(next)
            }
            Action::DiscoverServices => {
                let result = self.transport.discover_service().await;
                Some(link_step(result, LinkEvent::ServiceFound, "Service discovery"))
            }
            Action::BindCharacteristics => {
                self.assembler = FrameAssembler::new(&self.profile);
                let result = self.transport.bind_characteristics().await;
                Some(link_step(
                    result,
                    LinkEvent::CharacteristicsBound,
                    "Characteristic binding",
                ))
            }
            Action::SendHandshake => {
                let start_tape = std::mem::take(&mut self.start_on_connect);
                info!("Sending {} handshake", self.profile.dialect);
                let sequence = handshake_sequence(&self.profile, start_tape);
                let result = self.send_all(&sequence).await;
                if result.is_ok() && start_tape {
                    self.emit(BikeEvent::Started);
                }
                Some(link_step(result, LinkEvent::HandshakeComplete, "Handshake"))
            }
            Action::EnterRunning { first_time } => {
                self.scheduler.reset();
                self.emit(BikeEvent::Running);
                if first_time {
                    self.start_virtual_device();
                }
                None
            }
            Action::ResetSession => {
                self.assembler.reset();
                self.emit(BikeEvent::Disconnected);
                None
            }
            Action::ScheduleRetry => {
                let delay = Duration::from_millis(self.config.reconnect_delay_ms);
                debug!("Reconnecting in {:?}", delay);
                self.retry_at = Some(Instant::now() + delay);
                None
            }
        }
    }

    async fn scan(&mut self) -> LinkEvent {
        match self.transport.scan(&self.params).await {
            Ok(Some(device)) => {
                if let Some(profile) = device.profile() {
                    info!("Domyos {} bike found: {}", profile.dialect, device.name);
                    self.device = Some(device);
                    LinkEvent::DeviceFound(profile)
                } else {
                    warn!("Ignoring unsupported device {}", device.name);
                    LinkEvent::LinkLost
                }
            }
            Ok(None) => {
                info!("No Domyos bike found");
                LinkEvent::LinkLost
            }
            Err(e) => {
                warn!("Scan failed: {}", e);
                LinkEvent::LinkLost
            }
        }
    }

    fn start_virtual_device(&mut self) {
        if !self.config.virtual_device_enabled {
            return;
        }
        let Some(device) = self.virtual_device.take() else {
            return;
        };
        let Some(commands) = self.command_sender.upgrade() else {
            return;
        };
        info!("Creating virtual bike interface");
        device.start(BikeHandle {
            commands,
            telemetry: self.telemetry_tx.subscribe(),
            state: self.state_tx.subscribe(),
            events: self.events_tx.clone(),
        });
    }

    async fn on_transport_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::Notification(data) => self.on_notification(&data),
            TransportEvent::Disconnected => {
                warn!("Link lost");
                self.dispatch(LinkEvent::LinkLost).await;
            }
        }
    }

    fn on_notification(&mut self, data: &[u8]) {
        debug!(" << {} {:02X?}", data.len(), data);
        match self.assembler.accept(data) {
            Assembly::Complete(frame) => self.on_frame(&frame),
            Assembly::Incomplete => debug!("Waiting for the rest of the frame"),
            Assembly::Ignored => debug!("Notification ignored"),
        }
    }

    fn on_frame(&mut self, frame: &TelemetryFrame) {
        let decoded = decode(frame, &self.profile);
        match decoded.button {
            Some(ButtonEvent::Start) => {
                info!("Start button pressed");
                self.intents.set_run(RunIntent::Start);
            }
            Some(ButtonEvent::Stop) => {
                info!("Stop button pressed");
                self.intents.set_run(RunIntent::Stop);
            }
            None => {}
        }

        let external = self
            .heart_rate
            .as_ref()
            .and_then(|source| source.heart_rate());
        self.tracker.set_elapsed(self.elapsed);
        let sample = self.tracker.update(&decoded, external);

        self.emit(BikeEvent::ResistanceRead(sample.resistance));
        self.telemetry_tx.send_replace(sample);
        if let Some(metrics) = self.metrics.as_mut() {
            metrics.record(&sample);
        }
    }

    fn on_command(&mut self, command: BikeCommand) {
        debug!("Command: {:?}", command);
        match command {
            BikeCommand::SetTargetPower(watts) => {
                self.tracker.set_requested_power(watts);
                let sample = *self.tracker.sample();
                if let Some(request) = self.controller.request_power(
                    watts,
                    sample.power_watts,
                    sample.cadence_rpm,
                    sample.resistance,
                ) {
                    self.apply(request);
                }
            }
            BikeCommand::SetResistance(resistance) => {
                self.apply(self.controller.request_resistance(resistance));
            }
            BikeCommand::SetResistancePercent(percent) => {
                self.apply(self.controller.request_percent(percent));
            }
            BikeCommand::SetTargetCadence(cadence) => self.tracker.set_requested_cadence(cadence),
            BikeCommand::ExternalCadence(cadence) => {
                if !self.tracker.set_external_cadence(cadence) {
                    debug!("External cadence {} ignored, no sensor configured", cadence);
                }
            }
            BikeCommand::SetGears(gears) => {
                info!("Gears set to {}", gears);
                self.controller.set_gears(gears);
            }
            BikeCommand::Start => self.intents.set_run(RunIntent::Start),
            BikeCommand::Stop => self.intents.set_run(RunIntent::Stop),
            BikeCommand::Pause(paused) => {
                self.paused = paused;
                if let Some(metrics) = self.metrics.as_mut() {
                    metrics.set_paused(paused);
                }
            }
            BikeCommand::Lap => {
                if let Some(metrics) = self.metrics.as_mut() {
                    metrics.set_lap();
                }
            }
            BikeCommand::ClearStats => {
                self.elapsed = Duration::ZERO;
                self.tracker.set_elapsed(self.elapsed);
                if let Some(metrics) = self.metrics.as_mut() {
                    metrics.clear();
                }
            }
            BikeCommand::Shutdown => {}
        }
        self.telemetry_tx.send_replace(*self.tracker.sample());
    }

    fn apply(&mut self, request: ResistanceRequest) {
        self.intents.set_resistance(request.queued);
        self.tracker.set_requested_resistance(request.requested);
        if request.announce {
            self.emit(BikeEvent::ResistanceRequested(request.queued));
        }
    }

    async fn on_tick(&mut self) {
        if self.machine.state() != ConnectionState::Running {
            return;
        }
        if !self.paused {
            self.elapsed += self.config.tick_interval();
        }
        self.tracker.set_elapsed(self.elapsed);
        if self.config.external_heart_rate_belt {
            if let Some(bpm) = self.heart_rate.as_ref().and_then(|s| s.heart_rate()) {
                self.tracker.set_heart_rate(bpm);
            }
        }

        let action = self.scheduler.tick(
            &mut self.intents,
            self.tracker.sample().resistance,
            self.assembler.has_pending_partial(),
        );
        match self.perform_tick(action).await {
            Ok(()) => {}
            Err(e) if e.is_recoverable() => warn!("Tick action {:?} failed: {}", action, e),
            Err(e) => {
                warn!("Tick action {:?} failed, dropping link: {}", action, e);
                self.dispatch(LinkEvent::LinkLost).await;
            }
        }
    }

    async fn perform_tick(&mut self, action: TickAction) -> Result<()> {
        match action {
            TickAction::Hold => debug!("Holding writes until the frame is complete"),
            TickAction::Start => {
                info!("Starting...");
                let sequence = handshake_sequence(&self.profile, true);
                self.send_all(&sequence).await?;
                self.emit(BikeEvent::Started);
            }
            TickAction::Stop => {
                info!("Stopping...");
                if self.config.stop_tape_on_request {
                    self.send(OutboundCommand::StopTape).await?;
                }
                self.emit(BikeEvent::Stopped);
            }
            TickAction::Resistance(level) => {
                info!("Writing resistance {}", level);
                self.send(OutboundCommand::ResistanceWrite(level)).await?;
            }
            TickAction::Display => self.refresh_display().await?,
            TickAction::Keepalive => self.send(OutboundCommand::Keepalive).await?,
        }
        Ok(())
    }

    async fn refresh_display(&mut self) -> Result<()> {
        let sample = *self.tracker.sample();
        if self.config.distance_display {
            self.send(OutboundCommand::DistanceDisplay {
                odometer_km: sample.distance_km,
            })
            .await?;
        }
        let snapshot = DisplaySnapshot {
            elapsed_secs: u32::try_from(self.elapsed.as_secs()).unwrap_or(u32::MAX),
            speed_kmh: sample.speed_kmh,
            heart_rate_bpm: sample.heart_rate_bpm,
            cadence_rpm: sample.cadence_rpm,
            calories_kcal: sample.calories_kcal,
        };
        self.send(OutboundCommand::DisplayUpdate(snapshot)).await
    }

    async fn send_all(&mut self, commands: &[OutboundCommand]) -> Result<()> {
        for command in commands {
            self.send(*command).await?;
        }
        Ok(())
    }

    /// Write one command chunk by chunk, waiting for each acknowledgment
    ///
    /// An acknowledgment that does not arrive within the timeout counts as
    /// received.
    async fn send(&mut self, command: OutboundCommand) -> Result<()> {
        let ack_timeout = self.config.ack_timeout();
        for chunk in command.to_chunks(&self.profile)? {
            debug!(" >> {:02X?} // {}", &chunk.data[..], command.label());
            match timeout(ack_timeout, self.transport.write(&chunk.data)).await {
                Ok(result) => result?,
                Err(_) => debug!("Write of {} not confirmed in time", command.label()),
            }
            if chunk.ack == Ack::Response {
                self.await_response(ack_timeout).await?;
            }
        }
        Ok(())
    }

    async fn await_response(&mut self, limit: Duration) -> Result<()> {
        let deadline = Instant::now() + limit;
        loop {
            match timeout_at(deadline, self.transport.next_event()).await {
                Err(_) => {
                    debug!("Exit for timeout");
                    return Ok(());
                }
                Ok(Some(TransportEvent::Notification(data))) => {
                    self.on_notification(&data);
                    if is_response_ack(data.len()) {
                        return Ok(());
                    }
                }
                Ok(Some(TransportEvent::Disconnected) | None) => {
                    return Err(BikeError::Disconnected);
                }
            }
        }
    }

    fn emit(&self, event: BikeEvent) {
        // no subscribers is fine
        let _ = self.events_tx.send(event);
    }
}

fn link_step(result: Result<()>, next: LinkEvent, step: &str) -> LinkEvent {
    match result {
        Ok(()) => next,
        Err(e) => {
            warn!("{} failed: {}", step, e);
            LinkEvent::LinkLost
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use bytes::Bytes;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const KEEPALIVE: [u8; 3] = [0xF0, 0xAC, 0x9C];
    const WAIT: Duration = Duration::from_secs(3);

    struct ScriptedTransport {
        device: DeviceInfo,
        writes: mpsc::UnboundedSender<Vec<u8>>,
        events: mpsc::UnboundedReceiver<TransportEvent>,
        connects: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Transport for ScriptedTransport {
        async fn scan(&mut self, _params: &ConnectionParams) -> Result<Option<DeviceInfo>> {
            Ok(Some(self.device.clone()))
        }

        async fn connect(&mut self, _params: &ConnectionParams) -> Result<()> {
            self.connects.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn discover_service(&mut self) -> Result<()> {
            Ok(())
        }

        async fn bind_characteristics(&mut self) -> Result<()> {
            Ok(())
        }

        async fn write(&mut self, data: &[u8]) -> Result<()> {
            let _ = self.writes.send(data.to_vec());
            Ok(())
        }

        async fn next_event(&mut self) -> Option<TransportEvent> {
            self.events.recv().await
        }

        async fn disconnect(&mut self) -> Result<()> {
            Ok(())
        }
    }

    struct Harness {
        handle: BikeHandle,
        bike_events: broadcast::Receiver<BikeEvent>,
        writes: mpsc::UnboundedReceiver<Vec<u8>>,
        link: mpsc::UnboundedSender<TransportEvent>,
        connects: Arc<AtomicUsize>,
        session: tokio::task::JoinHandle<Result<()>>,
    }

    fn test_config() -> BikeConfig {
        BikeConfig {
            tick_interval_ms: 20,
            ack_timeout_ms: 5,
            ..BikeConfig::default()
        }
    }

    fn spawn_bike_with(
        config: BikeConfig,
        address: &str,
        setup: impl FnOnce(DomyosBike<ScriptedTransport>) -> DomyosBike<ScriptedTransport>,
    ) -> Harness {
        let (writes_tx, writes) = mpsc::unbounded_channel();
        let (link, events) = mpsc::unbounded_channel();
        let connects = Arc::new(AtomicUsize::new(0));
        let transport = ScriptedTransport {
            device: DeviceInfo::new("Domyos-Bike-4242".to_string(), address.to_string(), -55),
            writes: writes_tx,
            events,
            connects: Arc::clone(&connects),
        };
        let (bike, handle) = DomyosBike::new(transport, config).unwrap();
        let bike_events = handle.subscribe();
        let session = tokio::spawn(setup(bike).run());
        Harness {
            handle,
            bike_events,
            writes,
            link,
            connects,
            session,
        }
    }

    fn spawn_bike(config: BikeConfig) -> Harness {
        spawn_bike_with(config, "C4:8F:00:11:22:33", |bike| bike)
    }

    fn telemetry_frame(edit: impl FnOnce(&mut [u8; 26])) -> Vec<u8> {
        let mut frame = [0u8; 26];
        frame[0] = 0xF0;
        frame[1] = 0xBC;
        frame[14] = 3;
        edit(&mut frame);
        frame.to_vec()
    }

    async fn next_write_matching(
        writes: &mut mpsc::UnboundedReceiver<Vec<u8>>,
        matches: impl Fn(&[u8]) -> bool,
    ) -> Vec<u8> {
        timeout(WAIT, async {
            loop {
                let write = writes.recv().await.expect("transport dropped");
                if matches(&write) {
                    return write;
                }
            }
        })
        .await
        .expect("no matching write")
    }

    async fn next_event_matching(
        events: &mut broadcast::Receiver<BikeEvent>,
        matches: impl Fn(&BikeEvent) -> bool,
    ) -> BikeEvent {
        timeout(WAIT, async {
            loop {
                match events.recv().await {
                    Ok(event) if matches(&event) => return event,
                    Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
                    Err(broadcast::error::RecvError::Closed) => panic!("session ended"),
                }
            }
        })
        .await
        .expect("no matching event")
    }

    #[tokio::test]
    async fn test_handshake_then_keepalive() {
        let mut harness = spawn_bike(test_config());

        let first = harness.writes.recv().await.unwrap();
        assert_eq!(first, vec![0xF0, 0xC8, 0x01, 0xB9]);

        let event = next_event_matching(&mut harness.bike_events, |e| {
            matches!(e, BikeEvent::Connected { .. })
        })
        .await;
        assert_eq!(
            event,
            BikeEvent::Connected {
                name: "Domyos-Bike-4242".to_string(),
                dialect: crate::types::Dialect::ChangYow,
            }
        );
        next_event_matching(&mut harness.bike_events, |e| *e == BikeEvent::Running).await;
        assert_eq!(*harness.handle.connection_state().borrow(), ConnectionState::Running);

        next_write_matching(&mut harness.writes, |w| w == KEEPALIVE).await;
        harness.handle.shutdown().unwrap();
    }

    #[tokio::test]
    async fn test_telink_handshake_order() {
        let mut harness = spawn_bike_with(test_config(), "57:4C:54:00:00:01", |bike| bike);
        let mut first = Vec::new();
        for _ in 0..4 {
            first.push(harness.writes.recv().await.unwrap());
        }
        assert_eq!(first[0], vec![0xF0, 0xC8, 0x01, 0xB9]);
        assert_eq!(first[1], vec![0xF0, 0xC9, 0xB9]);
        assert_eq!(first[2], KEEPALIVE.to_vec());
        assert_eq!(
            first[3],
            vec![0xF0, 0xCC, 0xFF, 0xFF, 0xFF, 0xFF, 0x01, 0xFF, 0xB8]
        );
        let display_head = harness.writes.recv().await.unwrap();
        assert_eq!(&display_head[..2], &[0xF0, 0xCB]);
        harness.handle.shutdown().unwrap();
    }

    #[tokio::test]
    async fn test_split_frame_is_published() {
        let mut harness = spawn_bike(test_config());
        next_event_matching(&mut harness.bike_events, |e| *e == BikeEvent::Running).await;

        let frame = telemetry_frame(|f| {
            f[6..8].copy_from_slice(&215u16.to_be_bytes());
            f[9] = 72;
            f[14] = 7;
        });
        harness
            .link
            .send(TransportEvent::Notification(Bytes::copy_from_slice(&frame[..20])))
            .unwrap();
        harness
            .link
            .send(TransportEvent::Notification(Bytes::copy_from_slice(&frame[20..])))
            .unwrap();

        let mut telemetry = harness.handle.telemetry();
        let sample = *timeout(WAIT, telemetry.wait_for(|s| s.resistance == 7))
            .await
            .unwrap()
            .unwrap();
        assert!((sample.speed_kmh - 21.5).abs() < 1e-9);
        assert_eq!(sample.cadence_rpm, 72.0);
        assert_eq!(sample.crank_revolutions, 1);
        next_event_matching(&mut harness.bike_events, |e| {
            *e == BikeEvent::ResistanceRead(7)
        })
        .await;
        harness.handle.shutdown().unwrap();
    }

    #[tokio::test]
    async fn test_start_button_starts_once() {
        let mut harness = spawn_bike(test_config());
        next_event_matching(&mut harness.bike_events, |e| *e == BikeEvent::Running).await;

        let frame = telemetry_frame(|f| f[22] = 0x06);
        harness
            .link
            .send(TransportEvent::Notification(Bytes::from(frame)))
            .unwrap();

        let start_tape = |w: &[u8]| w.starts_with(&[0xF0, 0xCB, 0xFF, 0xFF]);
        next_write_matching(&mut harness.writes, start_tape).await;
        next_event_matching(&mut harness.bike_events, |e| *e == BikeEvent::Started).await;

        let again = timeout(Duration::from_millis(300), async {
            loop {
                match harness.writes.recv().await {
                    Some(write) if start_tape(&write) => return,
                    Some(_) => {}
                    None => std::future::pending::<()>().await,
                }
            }
        })
        .await;
        assert!(again.is_err(), "start sequence sent twice");
        harness.handle.shutdown().unwrap();
    }

    #[tokio::test]
    async fn test_disconnect_reconnects() {
        let mut harness = spawn_bike(test_config());
        next_event_matching(&mut harness.bike_events, |e| *e == BikeEvent::Running).await;
        assert_eq!(harness.connects.load(Ordering::SeqCst), 1);

        harness.link.send(TransportEvent::Disconnected).unwrap();
        next_event_matching(&mut harness.bike_events, |e| *e == BikeEvent::Disconnected).await;
        next_event_matching(&mut harness.bike_events, |e| {
            matches!(e, BikeEvent::Connected { .. })
        })
        .await;
        next_event_matching(&mut harness.bike_events, |e| *e == BikeEvent::Running).await;
        assert_eq!(harness.connects.load(Ordering::SeqCst), 2);
        harness.handle.shutdown().unwrap();
    }

    #[tokio::test]
    async fn test_resistance_request_is_written() {
        let mut harness = spawn_bike(test_config());
        next_event_matching(&mut harness.bike_events, |e| *e == BikeEvent::Running).await;

        harness.handle.set_resistance(8).unwrap();
        next_event_matching(&mut harness.bike_events, |e| {
            *e == BikeEvent::ResistanceRequested(8)
        })
        .await;
        let head = next_write_matching(&mut harness.writes, |w| {
            w.len() == 20 && w.starts_with(&[0xF0, 0xAD]) && w[10] == 8
        })
        .await;
        assert_eq!(head[2], 0xFF);
        assert_eq!(harness.handle.latest().requested_resistance, Some(8));
        harness.handle.shutdown().unwrap();
    }

    #[tokio::test]
    async fn test_stop_tape_when_configured() {
        let config = BikeConfig {
            stop_tape_on_request: true,
            ..test_config()
        };
        let mut harness = spawn_bike(config);
        next_event_matching(&mut harness.bike_events, |e| *e == BikeEvent::Running).await;

        harness.handle.stop().unwrap();
        next_write_matching(&mut harness.writes, |w| w == [0xF0, 0xC8, 0x00, 0xB8]).await;
        next_event_matching(&mut harness.bike_events, |e| *e == BikeEvent::Stopped).await;
        harness.handle.shutdown().unwrap();
    }

    #[tokio::test]
    async fn test_disconnect_during_handshake_ack_wait() {
        let config = BikeConfig {
            ack_timeout_ms: 2_000,
            ..test_config()
        };
        let mut harness = spawn_bike(config);

        let first = harness.writes.recv().await.unwrap();
        assert_eq!(first, vec![0xF0, 0xC8, 0x01, 0xB9]);
        let sent_at = Instant::now();
        harness.link.send(TransportEvent::Disconnected).unwrap();

        let within = Duration::from_millis(1_000);
        let mut events = Vec::new();
        timeout(within, async {
            loop {
                match harness.bike_events.recv().await {
                    Ok(event @ BikeEvent::Connected { .. }) if !events.is_empty() => {
                        events.push(event);
                        return;
                    }
                    Ok(event) => events.push(event),
                    Err(e) => panic!("event stream failed: {e}"),
                }
            }
        })
        .await
        .expect("no reconnect before the acknowledgment timeout");

        assert!(sent_at.elapsed() < within);
        assert!(matches!(events[0], BikeEvent::Connected { .. }));
        assert_eq!(events[1], BikeEvent::Disconnected);
        assert!(!events.contains(&BikeEvent::Running));
        assert_eq!(harness.connects.load(Ordering::SeqCst), 2);
        let _ = harness.handle.shutdown();
    }

    #[tokio::test]
    async fn test_external_cadence_drives_crank_clock() {
        let config = BikeConfig {
            external_cadence_sensor: true,
            ..test_config()
        };
        let mut harness = spawn_bike(config);
        next_event_matching(&mut harness.bike_events, |e| *e == BikeEvent::Running).await;

        harness.handle.set_external_cadence(90).unwrap();
        let mut telemetry = harness.handle.telemetry();
        timeout(WAIT, telemetry.wait_for(|s| s.cadence_rpm == 90.0))
            .await
            .unwrap()
            .unwrap();

        let frame = telemetry_frame(|f| {
            f[6..8].copy_from_slice(&200u16.to_be_bytes());
            f[9] = 40;
        });
        harness
            .link
            .send(TransportEvent::Notification(Bytes::from(frame)))
            .unwrap();

        let sample = *timeout(WAIT, telemetry.wait_for(|s| s.crank_revolutions == 1))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(sample.cadence_rpm, 90.0);
        assert_eq!(sample.last_crank_event_time, 682);
        harness.handle.shutdown().unwrap();
    }

    #[tokio::test]
    async fn test_virtual_device_started_on_first_run() {
        struct Recorder(mpsc::UnboundedSender<BikeHandle>);

        impl VirtualDevice for Recorder {
            fn start(self: Box<Self>, handle: BikeHandle) {
                let _ = self.0.send(handle);
            }
        }

        let (tx, mut started) = mpsc::unbounded_channel();
        let harness = spawn_bike_with(test_config(), "C4:8F:00:11:22:33", move |bike| {
            bike.with_virtual_device(Box::new(Recorder(tx)))
        });

        let virtual_handle = timeout(WAIT, started.recv()).await.unwrap().unwrap();
        assert_eq!(
            *virtual_handle.connection_state().borrow(),
            ConnectionState::Running
        );
        virtual_handle.set_target_cadence(85).unwrap();
        let mut telemetry = harness.handle.telemetry();
        timeout(
            WAIT,
            telemetry.wait_for(|s| s.requested_cadence_rpm == Some(85)),
        )
        .await
        .unwrap()
        .unwrap();
        harness.handle.shutdown().unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_ends_run() {
        let mut harness = spawn_bike(test_config());
        next_event_matching(&mut harness.bike_events, |e| *e == BikeEvent::Running).await;
        harness.handle.shutdown().unwrap();
        let result = timeout(WAIT, harness.session).await.unwrap().unwrap();
        tokio_test::assert_ok!(result);
    }

    #[tokio::test]
    async fn test_percent_out_of_range_rejected() {
        let harness = spawn_bike(test_config());
        let result = harness.handle.set_resistance_percent(120);
        assert!(matches!(result, Err(BikeError::InvalidParameters(_))));
        harness.handle.shutdown().unwrap();
    }

    #[test]
    fn test_invalid_config_rejected() {
        let (writes, _) = mpsc::unbounded_channel();
        let (_, events) = mpsc::unbounded_channel();
        let transport = ScriptedTransport {
            device: DeviceInfo::new(String::new(), String::new(), 0),
            writes,
            events,
            connects: Arc::new(AtomicUsize::new(0)),
        };
        let config = BikeConfig {
            max_resistance: 0,
            ..BikeConfig::default()
        };
        assert!(matches!(
            DomyosBike::new(transport, config),
            Err(BikeError::Config(_))
        ));
    }
}
