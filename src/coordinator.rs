//! Concurrency skeleton of the flight software.
//!
//! Four periodic units run as tokio tasks:
//!
//! | unit      | period  | work |
//! |-----------|---------|------|
//! | sensor    | 1 s     | read sensors, publish and queue a snapshot, blink the LED |
//! | radiation | 1 s     | turn the pulse counter into counts per second |
//! | comm      | ~100 ms | drain both queues, dispatch commands, send beacons |
//! | watchdog  | 5 s     | safety limits, hardware watchdog refresh, uptime, liveness poll |
//!
//! Bytes from the companion link enter through [`SerialIngress`], which
//! never waits: complete command frames are offered to the command queue
//! and dropped if it is full.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use thiserror::Error;
use tokio::task::JoinHandle;
use tokio::time::{interval, Interval, MissedTickBehavior};

use crate::config::{ConfigError, FlightConfig};
use crate::dispatch::{CommandDispatcher, DispatchOutcome};
use crate::events::{EventKind, EventLog, EventRecord};
use crate::framing::{DecoderState, Frame, FrameDecoder, FrameError, FrameStats};
use crate::hal::{LinkError, Peripherals, SensorError, SensorSuite};
use crate::health::{HealthMonitor, HealthReport, TaskLiveness, UnitId};
use crate::protocol::{Beacon, CommandPacket, ErrorFlag, ProtocolError, SystemState, TelemetryPacket};
use crate::queue::{bounded, QueueError, QueueRx, QueueTx};
use crate::safety::{SafetyActions, SafetyMonitor, SafetyThresholds};
use crate::state::{BootClock, ErrorRegister, StateRegister, Transition, TransitionCause, UptimeCounter};
use crate::telemetry::{RadiationCounter, RadiationRate, SharedTelemetry, SnapshotStamp, TelemetryAggregator};

#[derive(Debug, Error)]
pub enum ObcError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error(transparent)]
    Frame(#[from] FrameError),
    #[error(transparent)]
    Queue(#[from] QueueError),
    #[error("serial link: {0}")]
    Link(#[from] LinkError),
    #[error(transparent)]
    Sensor(#[from] SensorError),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

/// State every unit can see. Everything in here is either atomic or behind
/// a short-lived lock around plain data.
#[derive(Debug)]
pub struct SharedState {
    pub state: StateRegister,
    pub errors: ErrorRegister,
    pub uptime: UptimeCounter,
    pub telemetry: SharedTelemetry,
    pub radiation: RadiationCounter,
    pub liveness: TaskLiveness,
    pub clock: BootClock,
    boot_count: u8,
    payload_shutdown: AtomicBool,
    events: Mutex<EventLog>,
    last_health: Mutex<Option<HealthReport>>,
}

impl SharedState {
    #[must_use]
    pub fn new(clock: BootClock, boot_count: u8) -> Self {
        Self {
            state: StateRegister::new(),
            errors: ErrorRegister::new(),
            uptime: UptimeCounter::new(),
            telemetry: SharedTelemetry::new(),
            radiation: RadiationCounter::new(),
            liveness: TaskLiveness::new(),
            clock,
            boot_count,
            payload_shutdown: AtomicBool::new(false),
            events: Mutex::new(EventLog::new()),
            last_health: Mutex::new(None),
        }
    }

    #[must_use]
    pub fn boot_count(&self) -> u8 {
        self.boot_count
    }

    #[must_use]
    pub fn system_state(&self) -> SystemState {
        self.state.get()
    }

    /// Changes the operating mode and records the change in the event log.
    pub fn transition(&self, to: SystemState, cause: TransitionCause) -> Option<Transition> {
        let transition = self.state.transition(to, cause)?;
        self.lock_events().record_transition(self.uptime.seconds(), &transition);
        Some(transition)
    }

    /// Raises a fault flag. The first occurrence of each flag is logged.
    pub fn raise(&self, flag: ErrorFlag) -> bool {
        let fresh = self.errors.raise(flag);
        if fresh {
            self.log_event(EventKind::Fault, format_args!("{flag:?} fault"));
        }
        fresh
    }

    pub fn log_event(&self, kind: EventKind, message: core::fmt::Arguments<'_>) {
        self.lock_events().record(self.uptime.seconds(), kind, message);
    }

    /// Copy of the event log, oldest first.
    #[must_use]
    pub fn events(&self) -> Vec<EventRecord> {
        self.lock_events().iter().cloned().collect()
    }

    #[must_use]
    pub fn payload_shutdown(&self) -> bool {
        self.payload_shutdown.load(Ordering::Acquire)
    }

    pub fn mark_payload_shutdown(&self) {
        self.payload_shutdown.store(true, Ordering::Release);
    }

    /// Clears the shutdown marker, returning whether it was set.
    pub fn take_payload_shutdown(&self) -> bool {
        self.payload_shutdown.swap(false, Ordering::AcqRel)
    }

    #[must_use]
    pub fn last_health(&self) -> Option<HealthReport> {
        *self.last_health.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn record_health(&self, report: HealthReport) {
        *self.last_health.lock().unwrap_or_else(PoisonError::into_inner) = Some(report);
    }

    fn lock_events(&self) -> std::sync::MutexGuard<'_, EventLog> {
        self.events.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn periodic(period: Duration) -> Interval {
    let mut ticker = interval(period);
    // Absolute wake times: a late cycle is followed by catch-up cycles
    // rather than shifting every later wake.
    ticker.set_missed_tick_behavior(MissedTickBehavior::Burst);
    ticker
}

pub struct SensorUnit {
    shared: Arc<SharedState>,
    sensors: Box<dyn SensorSuite>,
    aggregator: TelemetryAggregator,
    telemetry_tx: QueueTx<TelemetryPacket>,
    peripherals: Peripherals,
    period: Duration,
}

impl SensorUnit {
    #[must_use]
    pub fn new(
        shared: Arc<SharedState>,
        sensors: Box<dyn SensorSuite>,
        telemetry_tx: QueueTx<TelemetryPacket>,
        peripherals: Peripherals,
        config: &FlightConfig,
    ) -> Self {
        Self {
            shared,
            sensors,
            aggregator: TelemetryAggregator::new(),
            telemetry_tx,
            peripherals,
            period: config.sensor_period(),
        }
    }

    /// One sensor cycle. Returns the snapshot that was published.
    pub fn cycle(&mut self) -> TelemetryPacket {
        for fault in self.aggregator.sample(self.sensors.as_mut()) {
            self.shared.raise(fault.device().fault_flag());
        }

        let shared = &self.shared;
        let now = shared.clock.now_ms();
        let snapshot = self.aggregator.finish(SnapshotStamp {
            timestamp_ms: now,
            radiation_cps: shared.telemetry.radiation_cps(),
            boot_count: shared.boot_count(),
            error_flags: shared.errors.snapshot(),
            system_state: shared.state.get(),
            uptime_s: shared.uptime.seconds(),
        });

        shared.telemetry.publish(snapshot);
        // A full queue drops this snapshot; the drop is counted and logged.
        let _ = self.telemetry_tx.offer(snapshot);
        self.peripherals.indicator.toggle();
        shared.liveness.beat(UnitId::Sensor, now);

        tracing::trace!(seq = snapshot.sequence_number, state = %snapshot.system_state, "snapshot");
        snapshot
    }

    pub async fn run(mut self) {
        let mut ticker = periodic(self.period);
        loop {
            ticker.tick().await;
            self.cycle();
        }
    }
}

pub struct RadiationUnit {
    shared: Arc<SharedState>,
    rate: RadiationRate,
    period: Duration,
}

impl RadiationUnit {
    #[must_use]
    pub fn new(shared: Arc<SharedState>, config: &FlightConfig) -> Self {
        Self {
            shared,
            rate: RadiationRate::new(),
            period: config.radiation_period(),
        }
    }

    pub fn cycle(&mut self) -> u32 {
        let cps = self.rate.sample(&self.shared.radiation);
        self.shared.telemetry.set_radiation_cps(cps);
        self.shared.liveness.beat(UnitId::Radiation, self.shared.clock.now_ms());
        cps
    }

    pub async fn run(mut self) {
        let mut ticker = periodic(self.period);
        // The first tick completes immediately; consume it so the first
        // sample covers a full period.
        ticker.tick().await;
        loop {
            ticker.tick().await;
            self.cycle();
        }
    }
}

/// Decides when the radio beacon is due.
#[derive(Debug)]
pub struct BeaconScheduler {
    interval_ms: u32,
    last_beacon_ms: u32,
}

impl BeaconScheduler {
    #[must_use]
    pub fn new(interval_ms: u32) -> Self {
        Self {
            interval_ms,
            last_beacon_ms: 0,
        }
    }

    /// True at most once per interval, and only in states that allow beacons.
    pub fn poll(&mut self, now_ms: u32, state: SystemState) -> bool {
        let due = now_ms.wrapping_sub(self.last_beacon_ms) >= self.interval_ms;
        if due && state.allows_beacon() {
            self.last_beacon_ms = now_ms;
            true
        } else {
            false
        }
    }
}

/// What one comm cycle did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CommCycle {
    pub telemetry_sent: Option<u16>,
    pub dispatched: Option<DispatchOutcome>,
    pub beacon: Option<Beacon>,
}

pub struct CommUnit {
    shared: Arc<SharedState>,
    telemetry_rx: QueueRx<TelemetryPacket>,
    command_rx: QueueRx<CommandPacket>,
    dispatcher: CommandDispatcher,
    beacons: BeaconScheduler,
    peripherals: Peripherals,
    queue_timeout: Duration,
    period: Duration,
}

impl CommUnit {
    #[must_use]
    pub fn new(
        shared: Arc<SharedState>,
        telemetry_rx: QueueRx<TelemetryPacket>,
        command_rx: QueueRx<CommandPacket>,
        peripherals: Peripherals,
        config: &FlightConfig,
    ) -> Self {
        Self {
            dispatcher: CommandDispatcher::new(Arc::clone(&shared), peripherals.clone(), config),
            beacons: BeaconScheduler::new(u32::try_from(config.beacon_interval_ms).unwrap_or(u32::MAX)),
            shared,
            telemetry_rx,
            command_rx,
            peripherals,
            queue_timeout: config.queue_timeout(),
            period: config.comm_period(),
        }
    }

    pub async fn poll_once(&mut self) -> CommCycle {
        let mut report = CommCycle::default();

        if let Ok(Some(snapshot)) = self.telemetry_rx.receive_timeout(self.queue_timeout).await {
            match self.peripherals.companion.transmit(&snapshot.to_frame()) {
                Ok(()) => report.telemetry_sent = Some(snapshot.sequence_number),
                Err(error) => {
                    tracing::warn!(seq = snapshot.sequence_number, %error, "telemetry transmit failed");
                    self.shared.raise(ErrorFlag::Uart);
                }
            }
        }

        if let Ok(Some(cmd)) = self.command_rx.receive_timeout(self.queue_timeout).await {
            report.dispatched = Some(self.dispatcher.dispatch(&cmd).await);
        }

        let now = self.shared.clock.now_ms();
        let state = self.shared.state.get();
        if self.beacons.poll(now, state) {
            let beacon = Beacon {
                system_state: state,
                boot_count: self.shared.boot_count(),
                battery_voltage: self.shared.telemetry.latest().map_or(0, |t| t.battery_voltage),
            };
            match self.peripherals.radio.transmit(&beacon.to_bytes()) {
                Ok(()) => {
                    tracing::debug!(state = %state, battery_mv = beacon.battery_voltage, "beacon sent");
                    report.beacon = Some(beacon);
                }
                Err(error) => tracing::warn!(%error, "beacon transmit failed"),
            }
        }

        self.shared.liveness.beat(UnitId::Comm, now);
        report
    }

    pub async fn run(mut self) {
        let mut ticker = periodic(self.period);
        loop {
            ticker.tick().await;
            self.poll_once().await;
        }
    }
}

pub struct WatchdogUnit {
    shared: Arc<SharedState>,
    safety: SafetyMonitor,
    health: HealthMonitor,
    peripherals: Peripherals,
    uptime_increment_s: u32,
    period: Duration,
}

impl WatchdogUnit {
    #[must_use]
    pub fn new(shared: Arc<SharedState>, peripherals: Peripherals, config: &FlightConfig) -> Self {
        Self {
            shared,
            safety: SafetyMonitor::new(SafetyThresholds::from_config(config)),
            health: HealthMonitor::from_config(config),
            peripherals,
            uptime_increment_s: config.uptime_increment_s,
            period: config.watchdog_period(),
        }
    }

    pub fn cycle(&mut self) -> SafetyActions {
        let actions = match self.shared.telemetry.latest() {
            Some(snapshot) => self.safety.evaluate(&snapshot),
            None => SafetyActions::new(),
        };
        self.apply(&actions);

        self.peripherals.watchdog.refresh();
        self.shared.uptime.advance(self.uptime_increment_s);

        let now = self.shared.clock.now_ms();
        self.shared.liveness.beat(UnitId::Watchdog, now);
        if let Some(report) = self.health.poll(&self.shared.liveness, now) {
            self.shared.record_health(report);
            if !report.all_healthy() {
                self.shared.raise(ErrorFlag::TaskHang);
                self.shared.log_event(
                    EventKind::Health,
                    format_args!("liveness vector {:04b}", report.vector),
                );
            }
        }

        actions
    }

    fn apply(&self, actions: &SafetyActions) {
        if !actions.has_actions() {
            return;
        }
        let shared = &self.shared;

        // The payload is forced down on the first crossing, and again if an
        // operator restored it while the battery is still critical.
        if actions.shutdown_payload || (actions.enter_low_power && !shared.payload_shutdown()) {
            self.peripherals.payload.shutdown_payload();
            shared.mark_payload_shutdown();
            shared.raise(ErrorFlag::Battery);
            shared.log_event(EventKind::Safety, format_args!("payload shutdown, battery critical"));
        }

        if actions.record_temperature_fault {
            shared.raise(ErrorFlag::Temperature);
            shared.log_event(EventKind::Safety, format_args!("temperature excursion"));
        }

        let cause = if actions.enter_safe {
            TransitionCause::TemperatureExcursion
        } else {
            TransitionCause::BatteryCritical
        };
        if let Some(target) = actions.target_state() {
            shared.transition(target, cause);
        }
    }

    pub async fn run(mut self) {
        let mut ticker = periodic(self.period);
        loop {
            ticker.tick().await;
            self.cycle();
        }
    }
}

/// Counts from one call to [`SerialIngress::on_bytes`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IngressReport {
    pub commands_queued: u32,
    pub commands_dropped: u32,
    pub telemetry_ignored: u32,
    /// Checksum failures; each one raises the UART flag.
    pub rejected_frames: u32,
    /// Checksum-valid frames with a field outside its enumeration.
    pub malformed_frames: u32,
}

/// Receive path of the companion link.
pub struct SerialIngress {
    decoder: FrameDecoder,
    command_tx: QueueTx<CommandPacket>,
    shared: Arc<SharedState>,
}

impl SerialIngress {
    #[must_use]
    pub fn new(command_tx: QueueTx<CommandPacket>, shared: Arc<SharedState>) -> Self {
        Self {
            decoder: FrameDecoder::new(),
            command_tx,
            shared,
        }
    }

    /// Feeds received bytes. Never waits.
    pub fn on_bytes(&mut self, bytes: &[u8]) -> IngressReport {
        let mut report = IngressReport::default();

        for result in self.decoder.decode(bytes) {
            match result {
                Ok(Frame::Command(cmd)) => match self.command_tx.offer(cmd) {
                    Ok(()) => report.commands_queued += 1,
                    Err(_) => report.commands_dropped += 1,
                },
                Ok(Frame::Telemetry(packet)) => {
                    tracing::debug!(seq = packet.sequence_number, "telemetry frame on ingress ignored");
                    report.telemetry_ignored += 1;
                }
                Err(error @ FrameError::Checksum { .. }) => {
                    tracing::warn!(%error, "frame rejected");
                    self.shared.raise(ErrorFlag::Uart);
                    report.rejected_frames += 1;
                }
                // Checksum-valid but structurally odd: counted, not a link fault.
                Err(error @ FrameError::Malformed { .. }) => {
                    tracing::debug!(%error, "malformed frame dropped");
                    report.malformed_frames += 1;
                }
            }
        }

        report
    }

    #[must_use]
    pub fn decoder_state(&self) -> DecoderState {
        self.decoder.state()
    }

    #[must_use]
    pub fn stats(&self) -> FrameStats {
        self.decoder.stats()
    }
}

/// Board hooks handed to [`FlightSoftware::spawn`].
pub struct Board {
    pub sensors: Box<dyn SensorSuite>,
    pub peripherals: Peripherals,
}

/// The running flight software: four unit tasks plus the receive path.
/// Dropping it stops every unit, which is how a processor reset is modelled
/// on the host.
pub struct FlightSoftware {
    shared: Arc<SharedState>,
    ingress: SerialIngress,
    tasks: Vec<JoinHandle<()>>,
}

impl FlightSoftware {
    /// Starts all units on the current tokio runtime and moves the system
    /// from Boot to Idle.
    pub fn spawn(config: &FlightConfig, board: Board) -> Result<Self, ObcError> {
        config.validate()?;

        let Board { sensors, peripherals } = board;
        let shared = Arc::new(SharedState::new(BootClock::start(), peripherals.system.boot_count()));
        let (telemetry_tx, telemetry_rx) = bounded("telemetry", config.telemetry_queue_capacity);
        let (command_tx, command_rx) = bounded("command", config.command_queue_capacity);

        let sensor = SensorUnit::new(Arc::clone(&shared), sensors, telemetry_tx, peripherals.clone(), config);
        let radiation = RadiationUnit::new(Arc::clone(&shared), config);
        let comm = CommUnit::new(Arc::clone(&shared), telemetry_rx, command_rx, peripherals.clone(), config);
        let watchdog = WatchdogUnit::new(Arc::clone(&shared), peripherals, config);

        // Idle before any unit runs, so the first snapshot never reports Boot.
        shared.log_event(EventKind::Reset, format_args!("boot {}", shared.boot_count()));
        shared.transition(SystemState::Idle, TransitionCause::Startup);

        let tasks = vec![
            tokio::spawn(sensor.run()),
            tokio::spawn(radiation.run()),
            tokio::spawn(comm.run()),
            tokio::spawn(watchdog.run()),
        ];
        tracing::info!(boot_count = shared.boot_count(), "flight software started");

        Ok(Self {
            ingress: SerialIngress::new(command_tx, Arc::clone(&shared)),
            shared,
            tasks,
        })
    }

    #[must_use]
    pub fn shared(&self) -> &Arc<SharedState> {
        &self.shared
    }

    pub fn ingress(&mut self) -> &mut SerialIngress {
        &mut self.ingress
    }

    /// Interrupt entry for one radiation detector pulse.
    pub fn radiation_pulse(&self) {
        self.shared.radiation.record_pulse();
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.tasks.iter().all(|t| !t.is_finished())
    }
}

impl Drop for FlightSoftware {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}
