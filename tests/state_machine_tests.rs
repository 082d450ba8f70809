use std::sync::Arc;

use cubesat_obc::coordinator::WatchdogUnit;
use cubesat_obc::events::EventKind;
use cubesat_obc::protocol::*;
use cubesat_obc::safety::{SafetyMonitor, SafetyThresholds};
use cubesat_obc::state::{BootClock, StateRegister, TransitionCause};
use cubesat_obc::{FlightConfig, SharedState, SimulatedBoard};

fn reading(battery_mv: u16, temperature_c: f32) -> TelemetryPacket {
    TelemetryPacket {
        packet_type: TELEMETRY_PACKET_TYPE,
        battery_voltage: battery_mv,
        temperature_bme: temperature_c,
        system_state: SystemState::Nominal,
        ..TelemetryPacket::default()
    }
}

struct Rig {
    board: SimulatedBoard,
    shared: Arc<SharedState>,
    watchdog: WatchdogUnit,
}

fn rig() -> Rig {
    let board = SimulatedBoard::default();
    let shared = Arc::new(SharedState::new(BootClock::start(), 1));
    shared.transition(SystemState::Idle, TransitionCause::Startup);
    shared.transition(SystemState::Nominal, TransitionCause::Operator);
    let watchdog = WatchdogUnit::new(Arc::clone(&shared), board.peripherals(), &FlightConfig::default());
    Rig {
        board,
        shared,
        watchdog,
    }
}

impl Rig {
    fn cycle_with(&mut self, battery_mv: u16, temperature_c: f32) {
        self.shared.telemetry.publish(reading(battery_mv, temperature_c));
        self.watchdog.cycle();
    }
}

#[test]
fn test_register_starts_in_boot_and_reports_changes_only() {
    let register = StateRegister::new();
    assert_eq!(register.get(), SystemState::Boot);

    let t = register.transition(SystemState::Idle, TransitionCause::Startup).unwrap();
    assert_eq!((t.from, t.to), (SystemState::Boot, SystemState::Idle));
    assert!(register.transition(SystemState::Idle, TransitionCause::Operator).is_none());
}

#[test]
fn test_battery_threshold_is_strictly_below_critical() {
    let mut monitor = SafetyMonitor::new(SafetyThresholds::default());

    let above = monitor.evaluate(&reading(3401, 25.0));
    assert!(!above.has_actions());

    let at = monitor.evaluate(&reading(3400, 25.0));
    assert!(!at.enter_low_power, "3400 mV is not below the threshold");

    let below = monitor.evaluate(&reading(3399, 25.0));
    assert!(below.enter_low_power);
    assert!(below.shutdown_payload);
    assert_eq!(below.target_state(), Some(SystemState::LowPower));
}

#[test]
fn test_temperature_limits_are_inclusive() {
    let mut monitor = SafetyMonitor::default();
    assert!(!monitor.evaluate(&reading(3900, 70.0)).enter_safe);
    assert!(!monitor.evaluate(&reading(3900, -20.0)).enter_safe);
    assert!(monitor.evaluate(&reading(3900, 70.5)).enter_safe);

    let mut cold = SafetyMonitor::default();
    let actions = cold.evaluate(&reading(3900, -20.5));
    assert!(actions.enter_safe);
    assert!(actions.record_temperature_fault);
}

#[test]
fn test_critical_battery_forces_low_power_and_sheds_payload_once() {
    let mut rig = rig();

    rig.cycle_with(3399, 25.0);
    assert_eq!(rig.shared.system_state(), SystemState::LowPower);
    assert!(!rig.board.payload_powered());
    assert_eq!(rig.board.payload_shutdowns(), 1);
    assert!(rig.shared.errors.contains(ErrorFlag::Battery));

    for _ in 0..5 {
        rig.cycle_with(3399, 25.0);
    }
    assert_eq!(rig.shared.system_state(), SystemState::LowPower);
    assert_eq!(rig.board.payload_shutdowns(), 1, "no repeat shutdown within one excursion");
}

#[test]
fn test_battery_hysteresis_rearms_shutdown() {
    let mut rig = rig();

    rig.cycle_with(3399, 25.0);
    // Back above critical but inside the recovery band: still latched.
    rig.cycle_with(3450, 25.0);
    rig.cycle_with(3399, 25.0);
    assert_eq!(rig.board.payload_shutdowns(), 1);

    // Full recovery, operator brings the spacecraft back.
    rig.cycle_with(3600, 25.0);
    rig.shared.take_payload_shutdown();
    rig.shared.transition(SystemState::Nominal, TransitionCause::Operator);

    rig.cycle_with(3399, 25.0);
    assert_eq!(rig.board.payload_shutdowns(), 2);
    assert_eq!(rig.shared.system_state(), SystemState::LowPower);
}

#[test]
fn test_low_power_is_held_against_operator() {
    let mut rig = rig();

    rig.cycle_with(3300, 25.0);
    rig.shared.transition(SystemState::Nominal, TransitionCause::Operator);
    rig.cycle_with(3300, 25.0);

    assert_eq!(rig.shared.system_state(), SystemState::LowPower);
}

#[test]
fn test_temperature_excursion_enters_safe_and_logs_once() {
    let mut rig = rig();

    for _ in 0..3 {
        rig.cycle_with(3900, 75.0);
    }

    assert_eq!(rig.shared.system_state(), SystemState::Safe);
    assert!(rig.shared.errors.contains(ErrorFlag::Temperature));
    let excursions = rig
        .shared
        .events()
        .iter()
        .filter(|e| e.kind == EventKind::Safety && e.message.contains("temperature"))
        .count();
    assert_eq!(excursions, 1);
    assert!(rig.board.payload_powered(), "temperature alone leaves the payload up");
}

#[test]
fn test_both_limits_settle_in_safe() {
    let mut rig = rig();

    rig.cycle_with(3300, 80.0);
    assert_eq!(rig.shared.system_state(), SystemState::Safe);
    assert_eq!(rig.board.payload_shutdowns(), 1);

    rig.cycle_with(3300, 80.0);
    assert_eq!(rig.shared.system_state(), SystemState::Safe);
    let safing: Vec<_> = rig
        .shared
        .events()
        .into_iter()
        .filter(|e| e.kind == EventKind::StateChange && e.message.contains("-> safe"))
        .collect();
    assert_eq!(safing.len(), 1, "no flapping between low-power and safe");
}

#[test]
fn test_every_cycle_refreshes_watchdog_and_uptime() {
    let mut rig = rig();

    rig.watchdog.cycle();
    rig.watchdog.cycle();

    assert_eq!(rig.board.watchdog_refreshes(), 2);
    assert_eq!(rig.shared.uptime.seconds(), 10);
    assert_eq!(rig.shared.system_state(), SystemState::Nominal, "no snapshot, no safety action");
}

#[test]
fn test_error_flags_are_sticky() {
    let shared = SharedState::new(BootClock::start(), 1);
    assert!(shared.raise(ErrorFlag::Spi));
    assert!(!shared.raise(ErrorFlag::Spi));
    shared.raise(ErrorFlag::TaskHang);

    let flags = shared.errors.snapshot();
    assert_eq!(flags.bits(), 0b0100_0010);
    assert_eq!(flags.iter().collect::<Vec<_>>(), vec![ErrorFlag::Spi, ErrorFlag::TaskHang]);
}
