//! Liveness tracking for the periodic units and the independent watchdog
//! window.
//!
//! Two mechanisms cover a hung unit. The hardware watchdog resets the
//! processor when it is not refreshed inside its window; that is the actual
//! recovery path. The liveness poll only reports: it samples one heartbeat
//! per unit into a 4-bit vector for telemetry and the event log.

use core::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::config::FlightConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum UnitId {
    Sensor,
    Radiation,
    Comm,
    Watchdog,
}

impl UnitId {
    pub const ALL: [UnitId; 4] = [UnitId::Sensor, UnitId::Radiation, UnitId::Comm, UnitId::Watchdog];

    #[must_use]
    pub fn index(self) -> usize {
        match self {
            UnitId::Sensor => 0,
            UnitId::Radiation => 1,
            UnitId::Comm => 2,
            UnitId::Watchdog => 3,
        }
    }

    #[must_use]
    pub fn bit(self) -> u8 {
        1 << self.index()
    }
}

/// Independent watchdog timing derived from its prescaler and reload value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WatchdogTimeout {
    pub prescaler: u32,
    pub reload: u32,
    pub lsi_hz: u32,
}

impl WatchdogTimeout {
    #[must_use]
    pub fn from_iwdg(prescaler: u32, reload: u32, lsi_hz: u32) -> Self {
        Self {
            prescaler,
            reload,
            lsi_hz,
        }
    }

    /// Longest allowed gap between refreshes.
    #[must_use]
    pub fn window(&self) -> Duration {
        let ticks = u64::from(self.prescaler) * u64::from(self.reload) * 1000;
        ticks
            .checked_div(u64::from(self.lsi_hz))
            .map_or(Duration::ZERO, Duration::from_millis)
    }
}

/// Last heartbeat of each periodic unit, milliseconds since boot.
#[derive(Debug, Default)]
pub struct TaskLiveness {
    // 0 means "never"; stored values are offset by one.
    beats: [AtomicU32; 4],
}

impl TaskLiveness {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn beat(&self, unit: UnitId, now_ms: u32) {
        self.beats[unit.index()].store(now_ms.saturating_add(1), Ordering::Release);
    }

    #[must_use]
    pub fn last_beat(&self, unit: UnitId) -> Option<u32> {
        match self.beats[unit.index()].load(Ordering::Acquire) {
            0 => None,
            stamp => Some(stamp - 1),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthReport {
    /// Bit `UnitId::index()` set when that unit beat within its deadline.
    pub vector: u8,
    pub at_ms: u32,
}

impl HealthReport {
    const ALL_UNITS: u8 = 0b1111;

    #[must_use]
    pub fn all_healthy(&self) -> bool {
        self.vector & Self::ALL_UNITS == Self::ALL_UNITS
    }

    #[must_use]
    pub fn is_healthy(&self, unit: UnitId) -> bool {
        self.vector & unit.bit() != 0
    }

    pub fn stalled(&self) -> impl Iterator<Item = UnitId> + '_ {
        UnitId::ALL.into_iter().filter(|u| !self.is_healthy(*u))
    }
}

#[derive(Debug)]
pub struct HealthMonitor {
    /// Maximum heartbeat age per unit, indexed by `UnitId::index()`.
    deadlines_ms: [u32; 4],
    poll_interval_ms: u32,
    last_poll_ms: u32,
    last_report: Option<HealthReport>,
}

impl HealthMonitor {
    /// A unit counts as running when its last heartbeat is younger than
    /// three of its periods.
    #[must_use]
    pub fn from_config(config: &FlightConfig) -> Self {
        let deadline = |period_ms: u64| u32::try_from(period_ms.saturating_mul(3)).unwrap_or(u32::MAX);
        Self {
            deadlines_ms: [
                deadline(config.sensor_period_ms),
                deadline(config.radiation_period_ms),
                deadline(config.comm_period_ms),
                deadline(config.watchdog_period_ms),
            ],
            poll_interval_ms: u32::try_from(config.health_poll_interval_ms).unwrap_or(u32::MAX),
            last_poll_ms: 0,
            last_report: None,
        }
    }

    /// Samples liveness if the poll interval has elapsed since the last poll
    /// (or since boot).
    pub fn poll(&mut self, liveness: &TaskLiveness, now_ms: u32) -> Option<HealthReport> {
        if now_ms.wrapping_sub(self.last_poll_ms) < self.poll_interval_ms {
            return None;
        }
        self.last_poll_ms = now_ms;

        let vector = UnitId::ALL.iter().fold(0u8, |acc, &unit| {
            let fresh = liveness
                .last_beat(unit)
                .is_some_and(|beat| beat_is_fresh(beat, now_ms, self.deadlines_ms[unit.index()]));
            if fresh {
                acc | unit.bit()
            } else {
                acc
            }
        });

        let report = HealthReport { vector, at_ms: now_ms };
        if report.all_healthy() {
            tracing::debug!(vector = format_args!("{vector:04b}"), "liveness poll");
        } else {
            tracing::warn!(
                vector = format_args!("{vector:04b}"),
                stalled = ?report.stalled().collect::<heapless::Vec<UnitId, 4>>(),
                "liveness poll found stalled units"
            );
        }
        self.last_report = Some(report);
        Some(report)
    }

    #[must_use]
    pub fn last_report(&self) -> Option<HealthReport> {
        self.last_report
    }
}

/// A beat stamped at or after `now_ms` (a unit that ran between the clock
/// read and the poll) counts as fresh. Ages are compared in wrapping signed
/// milliseconds so the 49-day rollover of the boot clock is harmless.
fn beat_is_fresh(beat_ms: u32, now_ms: u32, deadline_ms: u32) -> bool {
    let age = now_ms.wrapping_sub(beat_ms) as i32;
    age <= i32::try_from(deadline_ms).unwrap_or(i32::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_iwdg_window() {
        let timeout = WatchdogTimeout::from_iwdg(64, 4095, 32_000);
        assert_eq!(timeout.window(), Duration::from_millis(8190));
        assert_eq!(WatchdogTimeout::from_iwdg(64, 4095, 0).window(), Duration::ZERO);
    }

    #[test]
    fn test_poll_rate_limited() {
        let liveness = TaskLiveness::new();
        let mut monitor = HealthMonitor::from_config(&FlightConfig::default());
        assert!(monitor.poll(&liveness, 59_999).is_none());
        assert!(monitor.poll(&liveness, 60_000).is_some());
        assert!(monitor.poll(&liveness, 100_000).is_none());
        assert!(monitor.poll(&liveness, 120_000).is_some());
    }

    #[test]
    fn test_all_units_fresh() {
        let liveness = TaskLiveness::new();
        for unit in UnitId::ALL {
            liveness.beat(unit, 59_900);
        }
        let mut monitor = HealthMonitor::from_config(&FlightConfig::default());
        let report = monitor.poll(&liveness, 60_000).unwrap();
        assert_eq!(report.vector, 0b1111);
        assert!(report.all_healthy());
    }

    #[test]
    fn test_beat_after_poll_clock_is_fresh() {
        let liveness = TaskLiveness::new();
        for unit in UnitId::ALL {
            liveness.beat(unit, 60_000);
        }
        liveness.beat(UnitId::Comm, 60_001);

        let mut monitor = HealthMonitor::from_config(&FlightConfig::default());
        let report = monitor.poll(&liveness, 60_000).unwrap();
        assert_eq!(report.vector, 0b1111);
    }

    #[test]
    fn test_freshness_across_clock_rollover() {
        assert!(beat_is_fresh(u32::MAX - 50, 100, 300));
        assert!(!beat_is_fresh(u32::MAX - 500, 100, 300));
    }

    #[test]
    fn test_stale_unit_clears_its_bit() {
        let liveness = TaskLiveness::new();
        liveness.beat(UnitId::Sensor, 59_000);
        liveness.beat(UnitId::Radiation, 59_000);
        liveness.beat(UnitId::Comm, 10_000);
        liveness.beat(UnitId::Watchdog, 58_000);

        let mut monitor = HealthMonitor::from_config(&FlightConfig::default());
        let report = monitor.poll(&liveness, 60_000).unwrap();
        assert!(!report.all_healthy());
        assert!(!report.is_healthy(UnitId::Comm));
        assert_eq!(report.stalled().collect::<Vec<_>>(), vec![UnitId::Comm]);
    }

    #[test]
    fn test_never_started_unit_is_unhealthy() {
        let liveness = TaskLiveness::new();
        assert_eq!(liveness.last_beat(UnitId::Radiation), None);
        liveness.beat(UnitId::Radiation, 0);
        assert_eq!(liveness.last_beat(UnitId::Radiation), Some(0));
    }
}
