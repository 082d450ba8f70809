use core::fmt::{self, Write};

use arrayvec::ArrayString;
use heapless::Deque;
use serde::{Deserialize, Serialize};

use crate::state::Transition;

pub const EVENT_LOG_CAPACITY: usize = 32;
pub const EVENT_MESSAGE_LEN: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventKind {
    StateChange,
    Fault,
    Safety,
    Command,
    Health,
    Reset,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventRecord {
    pub uptime_s: u32,
    pub kind: EventKind,
    pub message: ArrayString<EVENT_MESSAGE_LEN>,
}

/// Ring of the most recent system events. The oldest entry is overwritten
/// once the ring is full.
#[derive(Debug, Default)]
pub struct EventLog {
    entries: Deque<EventRecord, EVENT_LOG_CAPACITY>,
    total: u32,
}

impl EventLog {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, uptime_s: u32, kind: EventKind, message: fmt::Arguments<'_>) {
        let mut text = ArrayString::new();
        // Truncation is fine for a diagnostic log.
        let _ = Truncating(&mut text).write_fmt(message);

        if self.entries.is_full() {
            self.entries.pop_front();
        }
        let _ = self.entries.push_back(EventRecord {
            uptime_s,
            kind,
            message: text,
        });
        self.total = self.total.wrapping_add(1);

        debug_assert!(self.entries.len() <= EVENT_LOG_CAPACITY);
    }

    pub fn record_transition(&mut self, uptime_s: u32, transition: &Transition) {
        self.record(
            uptime_s,
            EventKind::StateChange,
            format_args!("{} -> {} ({:?})", transition.from, transition.to, transition.cause),
        );
    }

    pub fn iter(&self) -> impl Iterator<Item = &EventRecord> {
        self.entries.iter()
    }

    #[must_use]
    pub fn latest(&self) -> Option<&EventRecord> {
        self.entries.back()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Events recorded since boot, including overwritten ones.
    #[must_use]
    pub fn total_recorded(&self) -> u32 {
        self.total
    }
}

struct Truncating<'a, const N: usize>(&'a mut ArrayString<N>);

impl<const N: usize> Write for Truncating<'_, N> {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        for c in s.chars() {
            if self.0.try_push(c).is_err() {
                break;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::SystemState;
    use crate::state::TransitionCause;

    #[test]
    fn test_ring_keeps_most_recent() {
        let mut log = EventLog::new();
        for i in 0..40u32 {
            log.record(i, EventKind::Command, format_args!("event {i}"));
        }
        assert_eq!(log.len(), EVENT_LOG_CAPACITY);
        assert_eq!(log.total_recorded(), 40);
        assert_eq!(log.iter().next().unwrap().uptime_s, 8);
        assert_eq!(log.latest().unwrap().message.as_str(), "event 39");
    }

    #[test]
    fn test_long_messages_are_truncated() {
        let mut log = EventLog::new();
        let long = "x".repeat(200);
        log.record(0, EventKind::Fault, format_args!("{long}"));
        assert_eq!(log.latest().unwrap().message.len(), EVENT_MESSAGE_LEN);
    }

    #[test]
    fn test_transition_message() {
        let mut log = EventLog::new();
        log.record_transition(
            15,
            &Transition {
                from: SystemState::Nominal,
                to: SystemState::LowPower,
                cause: TransitionCause::BatteryCritical,
            },
        );
        let entry = log.latest().unwrap();
        assert_eq!(entry.kind, EventKind::StateChange);
        assert_eq!(entry.message.as_str(), "nominal -> low-power (BatteryCritical)");
    }
}
