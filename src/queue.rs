//! Bounded handoff queues between units.
//!
//! Producers never wait: a full queue rejects the newest item and counts the
//! drop. Consumers wait at most a caller-chosen timeout so that one empty
//! queue cannot starve the other work of the unit draining it.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::mpsc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum QueueError {
    #[error("{queue} queue full, newest item dropped")]
    Full { queue: &'static str },
    #[error("{queue} queue closed")]
    Closed { queue: &'static str },
}

#[derive(Debug, Default)]
struct QueueCounters {
    delivered: AtomicU32,
    dropped: AtomicU32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct QueueStats {
    pub delivered: u32,
    pub dropped: u32,
}

/// Creates a queue holding at most `capacity` items.
///
/// # Panics
///
/// Panics if `capacity` is zero; [`crate::config::FlightConfig::validate`]
/// rejects that configuration.
#[must_use]
pub fn bounded<T>(name: &'static str, capacity: usize) -> (QueueTx<T>, QueueRx<T>) {
    let (tx, rx) = mpsc::channel(capacity);
    let counters = Arc::new(QueueCounters::default());
    (
        QueueTx {
            name,
            tx,
            counters: Arc::clone(&counters),
        },
        QueueRx { name, rx, counters },
    )
}

#[derive(Debug)]
pub struct QueueTx<T> {
    name: &'static str,
    tx: mpsc::Sender<T>,
    counters: Arc<QueueCounters>,
}

impl<T> Clone for QueueTx<T> {
    fn clone(&self) -> Self {
        Self {
            name: self.name,
            tx: self.tx.clone(),
            counters: Arc::clone(&self.counters),
        }
    }
}

impl<T> QueueTx<T> {
    /// Non-blocking put. Safe to call from the receive path.
    pub fn offer(&self, item: T) -> Result<(), QueueError> {
        match self.tx.try_send(item) {
            Ok(()) => {
                self.counters.delivered.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                let dropped = self.counters.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                tracing::warn!(queue = self.name, dropped, "queue full, dropping newest item");
                Err(QueueError::Full { queue: self.name })
            }
            Err(mpsc::error::TrySendError::Closed(_)) => Err(QueueError::Closed { queue: self.name }),
        }
    }

    #[must_use]
    pub fn stats(&self) -> QueueStats {
        stats(&self.counters)
    }
}

#[derive(Debug)]
pub struct QueueRx<T> {
    name: &'static str,
    rx: mpsc::Receiver<T>,
    counters: Arc<QueueCounters>,
}

impl<T> QueueRx<T> {
    /// Waits up to `timeout` for the next item. `Ok(None)` means the wait
    /// timed out with the queue still empty.
    pub async fn receive_timeout(&mut self, timeout: Duration) -> Result<Option<T>, QueueError> {
        match tokio::time::timeout(timeout, self.rx.recv()).await {
            Ok(Some(item)) => Ok(Some(item)),
            Ok(None) => Err(QueueError::Closed { queue: self.name }),
            Err(_elapsed) => Ok(None),
        }
    }

    /// Takes an item if one is already queued.
    pub fn try_receive(&mut self) -> Option<T> {
        self.rx.try_recv().ok()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.rx.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }

    #[must_use]
    pub fn stats(&self) -> QueueStats {
        stats(&self.counters)
    }
}

fn stats(counters: &QueueCounters) -> QueueStats {
    QueueStats {
        delivered: counters.delivered.load(Ordering::Relaxed),
        dropped: counters.dropped.load(Ordering::Relaxed),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_fifo_order() {
        let (tx, mut rx) = bounded("test", 4);
        for i in 0..3u8 {
            tx.offer(i).unwrap();
        }
        for i in 0..3u8 {
            assert_eq!(rx.receive_timeout(Duration::from_millis(10)).await, Ok(Some(i)));
        }
    }

    #[test]
    fn test_full_queue_drops_newest() {
        let (tx, mut rx) = bounded("command", 2);
        tx.offer(1).unwrap();
        tx.offer(2).unwrap();
        assert_eq!(tx.offer(3), Err(QueueError::Full { queue: "command" }));

        assert_eq!(rx.try_receive(), Some(1));
        assert_eq!(rx.try_receive(), Some(2));
        assert_eq!(rx.try_receive(), None);
        assert_eq!(tx.stats(), QueueStats { delivered: 2, dropped: 1 });
    }

    #[tokio::test(start_paused = true)]
    async fn test_receive_times_out_when_empty() {
        let (_tx, mut rx) = bounded::<u8>("telemetry", 1);
        let started = tokio::time::Instant::now();
        assert_eq!(rx.receive_timeout(Duration::from_millis(10)).await, Ok(None));
        assert!(started.elapsed() >= Duration::from_millis(10));
    }

    #[tokio::test]
    async fn test_closed_queue() {
        let (tx, mut rx) = bounded::<u8>("telemetry", 1);
        drop(tx);
        assert!(matches!(
            rx.receive_timeout(Duration::from_millis(10)).await,
            Err(QueueError::Closed { .. })
        ));
    }
}
