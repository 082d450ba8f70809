//! Process-wide status registers.
//!
//! The operating mode, the sticky fault bitset and the uptime counter are
//! read from every unit and written from several, so each lives in a single
//! atomic word. Updates are O(1) and never block, which keeps them usable
//! from the serial-receive path as well as from the periodic units.

use core::sync::atomic::{AtomicU32, AtomicU8, Ordering};

use serde::{Deserialize, Serialize};

use crate::protocol::{ErrorFlag, ErrorFlags, SystemState};

/// Millisecond tick since the flight software started. Wraps like a
/// hardware tick counter.
#[derive(Debug, Clone, Copy)]
pub struct BootClock {
    epoch: tokio::time::Instant,
}

impl BootClock {
    #[must_use]
    pub fn start() -> Self {
        Self {
            epoch: tokio::time::Instant::now(),
        }
    }

    #[must_use]
    pub fn now_ms(&self) -> u32 {
        self.epoch.elapsed().as_millis() as u32
    }
}

/// Why the operating mode changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransitionCause {
    /// Coordinator finished spawning the periodic units.
    Startup,
    BatteryCritical,
    TemperatureExcursion,
    /// Ground operator `SetMode`.
    Operator,
    CaptureImage,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transition {
    pub from: SystemState,
    pub to: SystemState,
    pub cause: TransitionCause,
}

/// The authoritative operating mode. Starts in [`SystemState::Boot`].
#[derive(Debug, Default)]
pub struct StateRegister {
    state: AtomicU8,
}

impl StateRegister {
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: AtomicU8::new(SystemState::Boot.as_u8()),
        }
    }

    #[must_use]
    pub fn get(&self) -> SystemState {
        // Only `SystemState` values are ever stored.
        SystemState::try_from(self.state.load(Ordering::Acquire)).unwrap_or_default()
    }

    /// Moves to `to`. Returns the transition when the mode actually changed.
    pub fn transition(&self, to: SystemState, cause: TransitionCause) -> Option<Transition> {
        let from = SystemState::try_from(self.state.swap(to.as_u8(), Ordering::AcqRel)).unwrap_or_default();
        if from == to {
            return None;
        }

        if to.is_safing() {
            tracing::warn!(from = %from, to = %to, ?cause, "safing transition");
        } else {
            tracing::info!(from = %from, to = %to, ?cause, "state transition");
        }
        Some(Transition { from, to, cause })
    }
}

/// Accumulated fault flags. Bits are only ever set; a reset is the only way
/// to clear them.
#[derive(Debug, Default)]
pub struct ErrorRegister {
    bits: AtomicU8,
}

impl ErrorRegister {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets `flag`. Returns `true` the first time it is raised.
    pub fn raise(&self, flag: ErrorFlag) -> bool {
        let before = self.bits.fetch_or(flag.mask(), Ordering::AcqRel);
        let fresh = before & flag.mask() == 0;
        if fresh {
            tracing::warn!(?flag, "fault flag raised");
        }
        fresh
    }

    #[must_use]
    pub fn snapshot(&self) -> ErrorFlags {
        ErrorFlags::from_bits(self.bits.load(Ordering::Acquire))
    }

    #[must_use]
    pub fn contains(&self, flag: ErrorFlag) -> bool {
        self.snapshot().contains(flag)
    }
}

/// Seconds since boot, advanced by the watchdog unit.
#[derive(Debug, Default)]
pub struct UptimeCounter {
    seconds: AtomicU32,
}

impl UptimeCounter {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn advance(&self, seconds: u32) -> u32 {
        self.seconds.fetch_add(seconds, Ordering::AcqRel).wrapping_add(seconds)
    }

    #[must_use]
    pub fn seconds(&self) -> u32 {
        self.seconds.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_starts_in_boot() {
        assert_eq!(StateRegister::new().get(), SystemState::Boot);
    }

    #[test]
    fn test_transition_reports_change_only_once() {
        let register = StateRegister::new();
        let t = register.transition(SystemState::Idle, TransitionCause::Startup).unwrap();
        assert_eq!(t.from, SystemState::Boot);
        assert_eq!(t.to, SystemState::Idle);
        assert!(register.transition(SystemState::Idle, TransitionCause::Operator).is_none());
    }

    #[test]
    fn test_error_register_is_sticky() {
        let errors = ErrorRegister::new();
        assert!(errors.raise(ErrorFlag::Uart));
        assert!(!errors.raise(ErrorFlag::Uart));
        errors.raise(ErrorFlag::I2c);
        assert_eq!(errors.snapshot().bits(), 0b0000_0101);
        assert!(errors.contains(ErrorFlag::Uart));
        assert!(!errors.contains(ErrorFlag::Memory));
    }

    #[test]
    fn test_uptime_advances() {
        let uptime = UptimeCounter::new();
        assert_eq!(uptime.advance(5), 5);
        assert_eq!(uptime.advance(5), 10);
        assert_eq!(uptime.seconds(), 10);
    }
}
