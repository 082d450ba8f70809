//! Host stand-ins for every board collaborator.
//!
//! [`SimulatedBoard`] drives the sensors from a small battery/solar model
//! and an orbital thermal model, records everything written to the serial
//! links, and models the independent watchdog and the reset line so a
//! supervisor can restart the flight software the way the processor would.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::{broadcast, Notify};
use tokio::time::Instant;

use crate::coordinator::Board;
use crate::hal::{
    battery_adc_code, battery_millivolts, Device, Environment, HardwareWatchdog, LinkError, MagneticField,
    PayloadControl, Peripherals, SensorError, SensorSuite, SerialLink, StatusIndicator, SystemControl,
};

const NOMINAL_VOLTAGE_MV: f32 = 3700.0;
const MIN_VOLTAGE_MV: f32 = 3000.0;
const MAX_VOLTAGE_MV: f32 = 4200.0;
const BUS_LOAD_MA: f32 = 350.0;
const PAYLOAD_LOAD_MA: f32 = 450.0;
const SOLAR_CURRENT_MA: f32 = 800.0;
const INTERNAL_RESISTANCE_MOHM: f32 = 100.0;

const ORBIT_PERIOD_S: f32 = 5400.0;
const NOMINAL_TEMP_C: f32 = 20.0;
/// Fraction of the gap to the orbital equilibrium closed per second.
const THERMAL_COUPLING: f32 = 0.002;

const RECORDED_FRAMES: usize = 256;

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Linear congruential generator; deterministic for a given seed.
#[derive(Debug, Clone)]
pub struct Lcg {
    state: u64,
}

impl Lcg {
    #[must_use]
    pub fn new(seed: u64) -> Self {
        Self { state: seed }
    }

    pub fn next_u32(&mut self) -> u32 {
        self.state = self.state.wrapping_mul(1_664_525).wrapping_add(1_013_904_223);
        (self.state >> 16) as u32
    }

    /// Uniform in `[0, 1)`.
    pub fn next_f32(&mut self) -> f32 {
        (self.next_u32() >> 8) as f32 / (1u32 << 24) as f32
    }
}

#[derive(Debug, Clone)]
struct PowerModel {
    battery_mv: f32,
    load_ma: f32,
    solar_enabled: bool,
}

impl PowerModel {
    fn new() -> Self {
        Self {
            battery_mv: NOMINAL_VOLTAGE_MV,
            load_ma: BUS_LOAD_MA + PAYLOAD_LOAD_MA,
            solar_enabled: true,
        }
    }

    fn step(&mut self, dt_s: f32, orbit_s: f32, payload_powered: bool) {
        let sunlit = (orbit_s / ORBIT_PERIOD_S * core::f32::consts::TAU).cos() > -0.3;
        let solar_ma = if self.solar_enabled && sunlit { SOLAR_CURRENT_MA } else { 0.0 };

        self.load_ma = BUS_LOAD_MA + if payload_powered { PAYLOAD_LOAD_MA } else { 0.0 };
        let net_ma = solar_ma - self.load_ma;

        // Terminal voltage relaxes towards a target set by the net current.
        let target = NOMINAL_VOLTAGE_MV + net_ma * INTERNAL_RESISTANCE_MOHM / 1000.0;
        self.battery_mv += (target - self.battery_mv) * (dt_s * 0.1).min(1.0);
        self.battery_mv = self.battery_mv.clamp(MIN_VOLTAGE_MV, MAX_VOLTAGE_MV);

        // NASA Rule 5: model stays inside the physical cell range
        debug_assert!(self.battery_mv >= MIN_VOLTAGE_MV && self.battery_mv <= MAX_VOLTAGE_MV);
    }
}

#[derive(Debug, Clone)]
struct ThermalModel {
    core_c: f32,
}

impl ThermalModel {
    fn new() -> Self {
        Self { core_c: NOMINAL_TEMP_C }
    }

    fn step(&mut self, dt_s: f32, orbit_s: f32, payload_powered: bool) {
        let phase = orbit_s / ORBIT_PERIOD_S * core::f32::consts::TAU;
        let internal_heat = if payload_powered { 6.0 } else { 0.0 };
        let equilibrium = 12.0 + 25.0 * phase.cos() + internal_heat;
        self.core_c += (equilibrium - self.core_c) * (dt_s * THERMAL_COUPLING).min(1.0);
    }
}

#[derive(Debug)]
struct Environmentals {
    power: PowerModel,
    thermal: ThermalModel,
    orbit_s: f32,
    rng: Lcg,
    battery_override_mv: Option<u16>,
    temperature_override_c: Option<f32>,
    radiation_cps: f32,
}

/// Serial link that records every frame and fans it out to subscribers.
#[derive(Debug)]
pub struct RecordingLink {
    name: &'static str,
    frames: Mutex<VecDeque<Vec<u8>>>,
    connected: AtomicBool,
    fanout: broadcast::Sender<Vec<u8>>,
}

impl RecordingLink {
    #[must_use]
    pub fn new(name: &'static str) -> Self {
        let (fanout, _) = broadcast::channel(64);
        Self {
            name,
            frames: Mutex::new(VecDeque::with_capacity(RECORDED_FRAMES)),
            connected: AtomicBool::new(true),
            fanout,
        }
    }

    /// Frames transmitted so far, oldest first.
    #[must_use]
    pub fn frames(&self) -> Vec<Vec<u8>> {
        lock(&self.frames).iter().cloned().collect()
    }

    /// Removes and returns everything recorded.
    pub fn take(&self) -> Vec<Vec<u8>> {
        lock(&self.frames).drain(..).collect()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Vec<u8>> {
        self.fanout.subscribe()
    }

    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::Release);
    }
}

impl SerialLink for RecordingLink {
    fn transmit(&self, bytes: &[u8]) -> Result<(), LinkError> {
        if !self.connected.load(Ordering::Acquire) {
            return Err(LinkError::Disconnected);
        }
        let mut frames = lock(&self.frames);
        if frames.len() == RECORDED_FRAMES {
            frames.pop_front();
        }
        frames.push_back(bytes.to_vec());
        drop(frames);

        // No subscribers is fine.
        let _ = self.fanout.send(bytes.to_vec());
        tracing::trace!(link = self.name, len = bytes.len(), "tx");
        Ok(())
    }
}

#[derive(Debug)]
struct BoardState {
    env: Mutex<Environmentals>,
    failing: Mutex<Vec<Device>>,

    wake_line: AtomicBool,
    wake_pulses: AtomicU32,
    payload_powered: AtomicBool,
    payload_shutdowns: AtomicU32,
    led: AtomicBool,
    led_toggles: AtomicU32,

    last_refresh: Mutex<Instant>,
    refreshes: AtomicU32,

    boot_count: AtomicU8,
    reset_requested: AtomicBool,
    reset_line: Notify,
}

/// A whole simulated board. Cheap to clone; clones share state.
#[derive(Debug, Clone)]
pub struct SimulatedBoard {
    state: Arc<BoardState>,
    companion: Arc<RecordingLink>,
    radio: Arc<RecordingLink>,
}

impl Default for SimulatedBoard {
    fn default() -> Self {
        Self::new(0x1234_5678_9ABC_DEF0)
    }
}

impl SimulatedBoard {
    #[must_use]
    pub fn new(seed: u64) -> Self {
        Self {
            state: Arc::new(BoardState {
                env: Mutex::new(Environmentals {
                    power: PowerModel::new(),
                    thermal: ThermalModel::new(),
                    orbit_s: 0.0,
                    rng: Lcg::new(seed),
                    battery_override_mv: None,
                    temperature_override_c: None,
                    radiation_cps: 20.0,
                }),
                failing: Mutex::new(Vec::new()),
                wake_line: AtomicBool::new(false),
                wake_pulses: AtomicU32::new(0),
                payload_powered: AtomicBool::new(true),
                payload_shutdowns: AtomicU32::new(0),
                led: AtomicBool::new(false),
                led_toggles: AtomicU32::new(0),
                last_refresh: Mutex::new(Instant::now()),
                refreshes: AtomicU32::new(0),
                boot_count: AtomicU8::new(1),
                reset_requested: AtomicBool::new(false),
                reset_line: Notify::new(),
            }),
            companion: Arc::new(RecordingLink::new("companion")),
            radio: Arc::new(RecordingLink::new("radio")),
        }
    }

    /// Collaborators for one boot of the flight software.
    #[must_use]
    pub fn board(&self) -> Board {
        Board {
            sensors: Box::new(self.sensors()),
            peripherals: self.peripherals(),
        }
    }

    #[must_use]
    pub fn sensors(&self) -> SimSensors {
        SimSensors {
            state: Arc::clone(&self.state),
        }
    }

    #[must_use]
    pub fn peripherals(&self) -> Peripherals {
        let outputs = Arc::new(self.clone());
        Peripherals {
            payload: outputs.clone(),
            companion: self.companion.clone(),
            radio: self.radio.clone(),
            system: outputs.clone(),
            watchdog: outputs.clone(),
            indicator: outputs,
        }
    }

    #[must_use]
    pub fn companion(&self) -> &Arc<RecordingLink> {
        &self.companion
    }

    #[must_use]
    pub fn radio(&self) -> &Arc<RecordingLink> {
        &self.radio
    }

    /// Advances the physical models. Returns the radiation pulses detected
    /// during `dt`.
    pub fn step(&self, dt: Duration) -> u32 {
        let dt_s = dt.as_secs_f32();
        let payload = self.payload_powered();
        let mut env = lock(&self.state.env);
        env.orbit_s = (env.orbit_s + dt_s) % ORBIT_PERIOD_S;
        let orbit_s = env.orbit_s;
        env.power.step(dt_s, orbit_s, payload);
        env.thermal.step(dt_s, orbit_s, payload);

        // Poisson-ish: mean rate with +/-50% uniform jitter.
        let mean = env.radiation_cps * dt_s;
        let jitter = env.rng.next_f32() - 0.5;
        (mean * (1.0 + jitter)).round().max(0.0) as u32
    }

    pub fn force_battery_mv(&self, millivolts: Option<u16>) {
        lock(&self.state.env).battery_override_mv = millivolts;
    }

    pub fn force_temperature_c(&self, celsius: Option<f32>) {
        lock(&self.state.env).temperature_override_c = celsius;
    }

    pub fn set_radiation_cps(&self, cps: f32) {
        lock(&self.state.env).radiation_cps = cps.max(0.0);
    }

    pub fn set_solar_enabled(&self, enabled: bool) {
        lock(&self.state.env).power.solar_enabled = enabled;
    }

    /// Makes reads of `device` fail until cleared.
    pub fn fail_device(&self, device: Device, failing: bool) {
        let mut devices = lock(&self.state.failing);
        devices.retain(|d| *d != device);
        if failing {
            devices.push(device);
        }
    }

    #[must_use]
    pub fn wake_line(&self) -> bool {
        self.state.wake_line.load(Ordering::Acquire)
    }

    /// Rising edges seen on the payload wake line.
    #[must_use]
    pub fn wake_pulses(&self) -> u32 {
        self.state.wake_pulses.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn payload_powered(&self) -> bool {
        self.state.payload_powered.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn payload_shutdowns(&self) -> u32 {
        self.state.payload_shutdowns.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn led_toggles(&self) -> u32 {
        self.state.led_toggles.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn watchdog_refreshes(&self) -> u32 {
        self.state.refreshes.load(Ordering::Acquire)
    }

    /// True when the watchdog has gone unrefreshed for longer than `window`.
    #[must_use]
    pub fn watchdog_expired(&self, window: Duration) -> bool {
        lock(&self.state.last_refresh).elapsed() > window
    }

    #[must_use]
    pub fn reset_requested(&self) -> bool {
        self.state.reset_requested.load(Ordering::Acquire)
    }

    /// Resolves once a reset has been requested through [`SystemControl`].
    pub async fn wait_for_reset(&self) {
        loop {
            let notified = self.state.reset_line.notified();
            if self.reset_requested() {
                return;
            }
            notified.await;
        }
    }

    /// Brings the board back up after a reset: counts the boot, powers the
    /// payload and restarts the watchdog.
    pub fn complete_reset(&self) {
        let s = &self.state;
        s.reset_requested.store(false, Ordering::Release);
        s.boot_count.fetch_add(1, Ordering::AcqRel);
        s.wake_line.store(false, Ordering::Release);
        s.payload_powered.store(true, Ordering::Release);
        *lock(&s.last_refresh) = Instant::now();
    }

    /// Whether reads of `device` currently fail.
    #[must_use]
    pub fn is_failing(&self, device: Device) -> bool {
        lock(&self.state.failing).contains(&device)
    }
}

impl PayloadControl for SimulatedBoard {
    fn set_wake(&self, high: bool) {
        let was = self.state.wake_line.swap(high, Ordering::AcqRel);
        if high && !was {
            self.state.wake_pulses.fetch_add(1, Ordering::AcqRel);
        }
    }

    fn shutdown_payload(&self) {
        self.state.wake_line.store(false, Ordering::Release);
        self.state.payload_powered.store(false, Ordering::Release);
        self.state.payload_shutdowns.fetch_add(1, Ordering::AcqRel);
        tracing::info!("payload powered down");
    }

    fn restore_payload_power(&self) {
        self.state.payload_powered.store(true, Ordering::Release);
        tracing::info!("payload power restored");
    }
}

impl SystemControl for SimulatedBoard {
    fn reset(&self) {
        tracing::error!("processor reset requested");
        self.state.reset_requested.store(true, Ordering::Release);
        self.state.reset_line.notify_waiters();
    }

    fn boot_count(&self) -> u8 {
        self.state.boot_count.load(Ordering::Acquire)
    }
}

impl HardwareWatchdog for SimulatedBoard {
    fn refresh(&self) {
        *lock(&self.state.last_refresh) = Instant::now();
        self.state.refreshes.fetch_add(1, Ordering::AcqRel);
    }
}

impl StatusIndicator for SimulatedBoard {
    fn toggle(&self) {
        self.state.led.fetch_xor(true, Ordering::AcqRel);
        self.state.led_toggles.fetch_add(1, Ordering::AcqRel);
    }
}

/// Sensor view of a [`SimulatedBoard`].
#[derive(Debug)]
pub struct SimSensors {
    state: Arc<BoardState>,
}

impl SimSensors {
    fn check(&self, device: Device) -> Result<(), SensorError> {
        if lock(&self.state.failing).contains(&device) {
            Err(SensorError::Nack(device))
        } else {
            Ok(())
        }
    }
}

impl SensorSuite for SimSensors {
    fn read_magnetometer(&mut self) -> Result<MagneticField, SensorError> {
        self.check(Device::Magnetometer)?;
        let env = lock(&self.state.env);
        let phase = env.orbit_s / ORBIT_PERIOD_S * core::f32::consts::TAU;
        Ok(MagneticField {
            x: 0.3 * phase.cos(),
            y: 0.3 * phase.sin(),
            z: 0.2 * (2.0 * phase).sin(),
        })
    }

    fn read_environment(&mut self) -> Result<Environment, SensorError> {
        self.check(Device::Environmental)?;
        let env = lock(&self.state.env);
        Ok(Environment {
            temperature_c: env.temperature_override_c.unwrap_or(env.thermal.core_c),
            pressure_pa: 101_325.0,
            humidity_pct: 35.0,
        })
    }

    fn read_precision_temperature(&mut self) -> Result<f32, SensorError> {
        self.check(Device::PrecisionThermometer)?;
        let env = lock(&self.state.env);
        Ok(env.temperature_override_c.unwrap_or(env.thermal.core_c) + 0.2)
    }

    fn read_corrosion_adc(&mut self) -> Result<u16, SensorError> {
        self.check(Device::CorrosionAdc)?;
        let mut env = lock(&self.state.env);
        // 10-bit converter
        Ok(300 + (env.rng.next_u32() % 16) as u16)
    }

    fn read_battery_voltage_mv(&mut self) -> Result<u16, SensorError> {
        self.check(Device::BatteryAdc)?;
        let env = lock(&self.state.env);
        if let Some(mv) = env.battery_override_mv {
            return Ok(mv);
        }
        Ok(battery_millivolts(battery_adc_code(env.power.battery_mv as u16)))
    }

    fn read_battery_current_ma(&mut self) -> Result<u16, SensorError> {
        self.check(Device::BatteryAdc)?;
        Ok(lock(&self.state.env).power.load_ma as u16)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lcg_is_deterministic() {
        let mut a = Lcg::new(7);
        let mut b = Lcg::new(7);
        for _ in 0..10 {
            assert_eq!(a.next_u32(), b.next_u32());
        }
        let f = a.next_f32();
        assert!((0.0..1.0).contains(&f));
    }

    #[test]
    fn test_battery_sags_without_sun() {
        let board = SimulatedBoard::default();
        board.set_solar_enabled(false);
        for _ in 0..600 {
            board.step(Duration::from_secs(1));
        }
        let mv = board.sensors().read_battery_voltage_mv().unwrap();
        assert!(mv < 3700, "battery {mv} mV");
    }

    #[test]
    fn test_overrides_and_failures() {
        let board = SimulatedBoard::default();
        let mut sensors = board.sensors();

        board.force_battery_mv(Some(3399));
        assert_eq!(sensors.read_battery_voltage_mv(), Ok(3399));

        board.fail_device(Device::CorrosionAdc, true);
        assert!(board.is_failing(Device::CorrosionAdc));
        assert_eq!(
            sensors.read_corrosion_adc(),
            Err(SensorError::Nack(Device::CorrosionAdc))
        );
        board.fail_device(Device::CorrosionAdc, false);
        assert!(sensors.read_corrosion_adc().is_ok());
    }

    #[test]
    fn test_wake_pulse_and_shutdown() {
        let board = SimulatedBoard::default();
        board.set_wake(true);
        board.set_wake(false);
        assert_eq!(board.wake_pulses(), 1);

        board.shutdown_payload();
        assert!(!board.payload_powered());
        assert!(!board.wake_line());
        board.restore_payload_power();
        assert!(board.payload_powered());
    }

    #[test]
    fn test_link_records_and_disconnects() {
        let link = RecordingLink::new("test");
        link.transmit(&[1, 2, 3]).unwrap();
        assert_eq!(link.frames(), vec![vec![1, 2, 3]]);

        link.set_connected(false);
        assert_eq!(link.transmit(&[4]), Err(LinkError::Disconnected));
        assert_eq!(link.take().len(), 1);
        assert!(link.frames().is_empty());
    }

    #[tokio::test]
    async fn test_reset_increments_boot_count() {
        let board = SimulatedBoard::default();
        assert_eq!(board.boot_count(), 1);
        board.reset();
        board.wait_for_reset().await;
        board.complete_reset();
        assert_eq!(board.boot_count(), 2);
        assert!(!board.reset_requested());
    }
}
