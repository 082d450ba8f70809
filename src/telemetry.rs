use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Mutex, PoisonError};

use heapless::Vec;

use crate::hal::{SensorError, SensorSuite};
use crate::protocol::{ErrorFlags, SystemState, TelemetryPacket, TELEMETRY_PACKET_TYPE};

/// One fault per sensor read at most.
pub const MAX_SENSOR_FAULTS: usize = 6;

pub type SensorFaults = Vec<SensorError, MAX_SENSOR_FAULTS>;

/// Pulse counter fed from the radiation detector's edge interrupt.
///
/// Increments are a single `fetch_add` and never block, so the pulse path
/// stays bounded no matter what the periodic units are doing.
#[derive(Debug, Default)]
pub struct RadiationCounter {
    pulses: AtomicU32,
}

impl RadiationCounter {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Interrupt entry: one detected pulse.
    pub fn record_pulse(&self) {
        self.pulses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_pulses(&self, count: u32) {
        self.pulses.fetch_add(count, Ordering::Relaxed);
    }

    #[must_use]
    pub fn total(&self) -> u32 {
        self.pulses.load(Ordering::Relaxed)
    }
}

/// Derives counts per sample period from successive counter readings.
#[derive(Debug, Default)]
pub struct RadiationRate {
    last_total: u32,
}

impl RadiationRate {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Pulses since the previous sample. Modular, so a counter wrap still
    /// yields the true (non-negative) delta.
    pub fn sample(&mut self, counter: &RadiationCounter) -> u32 {
        self.sample_total(counter.total())
    }

    pub fn sample_total(&mut self, total: u32) -> u32 {
        let delta = total.wrapping_sub(self.last_total);
        self.last_total = total;
        delta
    }
}

/// Latest complete snapshot plus the radiation rate published between
/// snapshots.
///
/// Readers always get a whole snapshot by value. The radiation rate is a
/// separate atomic cell; the sensor unit folds it into the next snapshot, so
/// a snapshot's `radiation_cps` lags the radiation unit by at most one
/// radiation period.
#[derive(Debug, Default)]
pub struct SharedTelemetry {
    latest: Mutex<Option<TelemetryPacket>>,
    radiation_cps: AtomicU32,
}

impl SharedTelemetry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn publish(&self, snapshot: TelemetryPacket) {
        // The guarded value is plain data; a panic elsewhere cannot leave it torn.
        let mut latest = self.latest.lock().unwrap_or_else(PoisonError::into_inner);
        *latest = Some(snapshot);
    }

    #[must_use]
    pub fn latest(&self) -> Option<TelemetryPacket> {
        *self.latest.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn set_radiation_cps(&self, cps: u32) {
        self.radiation_cps.store(cps, Ordering::Release);
    }

    #[must_use]
    pub fn radiation_cps(&self) -> u32 {
        self.radiation_cps.load(Ordering::Acquire)
    }
}

/// System fields stamped onto a snapshot after the sensors have been read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SnapshotStamp {
    pub timestamp_ms: u32,
    pub radiation_cps: u32,
    pub boot_count: u8,
    pub error_flags: ErrorFlags,
    pub system_state: SystemState,
    pub uptime_s: u32,
}

/// Builds one telemetry snapshot per sensor cycle.
///
/// Sensor values persist between cycles: a failed read leaves the previous
/// value in place and is reported back so the caller can raise the matching
/// fault flag.
#[derive(Debug, Default)]
pub struct TelemetryAggregator {
    working: TelemetryPacket,
    next_sequence: u16,
}

impl TelemetryAggregator {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Reads every sensor into the working record.
    pub fn sample<S: SensorSuite + ?Sized>(&mut self, sensors: &mut S) -> SensorFaults {
        let mut faults = SensorFaults::new();
        let w = &mut self.working;

        match sensors.read_magnetometer() {
            Ok(field) => {
                w.mag_x = field.x;
                w.mag_y = field.y;
                w.mag_z = field.z;
            }
            Err(e) => note(&mut faults, e),
        }

        match sensors.read_environment() {
            Ok(env) => {
                w.temperature_bme = env.temperature_c;
                w.pressure = env.pressure_pa;
                w.humidity = env.humidity_pct;
            }
            Err(e) => note(&mut faults, e),
        }

        match sensors.read_precision_temperature() {
            Ok(t) => w.temperature_tmp = t,
            Err(e) => note(&mut faults, e),
        }

        match sensors.read_corrosion_adc() {
            Ok(code) => w.corrosion_raw = code,
            Err(e) => note(&mut faults, e),
        }

        match sensors.read_battery_voltage_mv() {
            Ok(mv) => w.battery_voltage = mv,
            Err(e) => note(&mut faults, e),
        }

        match sensors.read_battery_current_ma() {
            Ok(ma) => w.battery_current = ma,
            Err(e) => note(&mut faults, e),
        }

        if let Some(fix) = sensors.read_gps() {
            w.latitude = fix.latitude_e7;
            w.longitude = fix.longitude_e7;
            w.altitude = fix.altitude_mm;
            w.gps_quality = fix.quality;
            w.gps_satellites = fix.satellites;
        }

        faults
    }

    /// Stamps system fields and returns the finished snapshot by value.
    pub fn finish(&mut self, stamp: SnapshotStamp) -> TelemetryPacket {
        let w = &mut self.working;
        w.packet_type = TELEMETRY_PACKET_TYPE;
        w.sequence_number = self.next_sequence;
        w.timestamp = stamp.timestamp_ms;
        w.radiation_cps = stamp.radiation_cps;
        w.boot_count = stamp.boot_count;
        w.error_flags = stamp.error_flags;
        w.system_state = stamp.system_state;
        w.uptime = stamp.uptime_s;

        self.next_sequence = self.next_sequence.wrapping_add(1);
        *w
    }

    #[must_use]
    pub fn next_sequence(&self) -> u16 {
        self.next_sequence
    }
}

fn note(faults: &mut SensorFaults, error: SensorError) {
    tracing::debug!(%error, "sensor read failed, keeping previous value");
    let _ = faults.push(error);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hal::{Device, Environment, MagneticField};

    struct FixedSensors {
        battery_mv: u16,
        fail_environment: bool,
    }

    impl SensorSuite for FixedSensors {
        fn read_magnetometer(&mut self) -> Result<MagneticField, SensorError> {
            Ok(MagneticField { x: 0.2, y: -0.1, z: 0.45 })
        }

        fn read_environment(&mut self) -> Result<Environment, SensorError> {
            if self.fail_environment {
                Err(SensorError::Nack(Device::Environmental))
            } else {
                Ok(Environment {
                    temperature_c: 21.5,
                    pressure_pa: 101_325.0,
                    humidity_pct: 40.0,
                })
            }
        }

        fn read_precision_temperature(&mut self) -> Result<f32, SensorError> {
            Ok(21.7)
        }

        fn read_corrosion_adc(&mut self) -> Result<u16, SensorError> {
            Ok(512)
        }

        fn read_battery_voltage_mv(&mut self) -> Result<u16, SensorError> {
            Ok(self.battery_mv)
        }
    }

    fn stamp(state: SystemState) -> SnapshotStamp {
        SnapshotStamp {
            timestamp_ms: 1000,
            radiation_cps: 12,
            boot_count: 3,
            error_flags: ErrorFlags::empty(),
            system_state: state,
            uptime_s: 5,
        }
    }

    #[test]
    fn test_rate_from_successive_totals() {
        let mut rate = RadiationRate::new();
        rate.sample_total(100);
        assert_eq!(rate.sample_total(137), 37);
        assert_eq!(rate.sample_total(137), 0);
    }

    #[test]
    fn test_rate_across_counter_wrap() {
        let mut rate = RadiationRate::new();
        rate.sample_total(u32::MAX - 4);
        assert_eq!(rate.sample_total(5), 10);
    }

    #[test]
    fn test_counter_feeds_rate() {
        let counter = RadiationCounter::new();
        let mut rate = RadiationRate::new();
        for _ in 0..25 {
            counter.record_pulse();
        }
        assert_eq!(rate.sample(&counter), 25);
        counter.record_pulses(7);
        assert_eq!(rate.sample(&counter), 7);
    }

    #[test]
    fn test_snapshot_stamping_and_sequence() {
        let mut sensors = FixedSensors {
            battery_mv: 3900,
            fail_environment: false,
        };
        let mut agg = TelemetryAggregator::new();

        assert!(agg.sample(&mut sensors).is_empty());
        let first = agg.finish(stamp(SystemState::Idle));
        assert_eq!(first.packet_type, TELEMETRY_PACKET_TYPE);
        assert_eq!(first.sequence_number, 0);
        assert_eq!(first.battery_voltage, 3900);
        assert_eq!(first.radiation_cps, 12);
        assert_eq!(first.system_state, SystemState::Idle);

        agg.sample(&mut sensors);
        assert_eq!(agg.finish(stamp(SystemState::Idle)).sequence_number, 1);
    }

    #[test]
    fn test_failed_read_keeps_previous_value() {
        let mut sensors = FixedSensors {
            battery_mv: 3900,
            fail_environment: false,
        };
        let mut agg = TelemetryAggregator::new();
        agg.sample(&mut sensors);
        agg.finish(stamp(SystemState::Nominal));

        sensors.fail_environment = true;
        let faults = agg.sample(&mut sensors);
        assert_eq!(faults.len(), 1);
        assert_eq!(faults[0].device(), Device::Environmental);

        let snapshot = agg.finish(stamp(SystemState::Nominal));
        assert!((snapshot.temperature_bme - 21.5).abs() < f32::EPSILON);
    }

    #[test]
    fn test_shared_latest_snapshot() {
        let shared = SharedTelemetry::new();
        assert!(shared.latest().is_none());
        let snapshot = TelemetryPacket {
            battery_voltage: 3700,
            ..TelemetryPacket::default()
        };
        shared.publish(snapshot);
        assert_eq!(shared.latest(), Some(snapshot));

        shared.set_radiation_cps(42);
        assert_eq!(shared.radiation_cps(), 42);
    }
}
