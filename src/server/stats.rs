//! Process-wide message counters.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Counters updated by every listener.
#[derive(Debug, Default)]
pub struct ServerStats {
    received: AtomicU64,
    completed: AtomicU64,
    abandoned: AtomicU64,
    handled_exceptions: AtomicU64,
    unhandled_exceptions: AtomicU64,
    synchronous_timeouts: AtomicU64,
    replies_sent: AtomicU64,
    loop_failures: AtomicU64,
}

/// Point-in-time copy of [`ServerStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    /// Messages dequeued.
    pub received: u64,
    /// Messages removed from their queue.
    pub completed: u64,
    /// Messages handed back to the broker for redelivery.
    pub abandoned: u64,
    /// Processing failures classified as handled.
    pub handled_exceptions: u64,
    /// Processing failures classified as unhandled.
    pub unhandled_exceptions: u64,
    /// Synchronous handlers that missed the reply deadline.
    pub synchronous_timeouts: u64,
    /// Synchronous replies delivered.
    pub replies_sent: u64,
    /// Listener iterations that failed outside message processing.
    pub loop_failures: u64,
}

impl ServerStats {
    /// Creates zeroed counters.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Counts a dequeued message.
    pub fn record_received(&self) {
        self.received.fetch_add(1, Ordering::Relaxed);
    }

    /// Counts a removed message.
    pub fn record_completed(&self) {
        self.completed.fetch_add(1, Ordering::Relaxed);
    }

    /// Counts an abandoned message.
    pub fn record_abandoned(&self) {
        self.abandoned.fetch_add(1, Ordering::Relaxed);
    }

    /// Counts a handled processing failure.
    pub fn record_handled_exception(&self) {
        self.handled_exceptions.fetch_add(1, Ordering::Relaxed);
    }

    /// Counts an unhandled processing failure.
    pub fn record_unhandled_exception(&self) {
        self.unhandled_exceptions.fetch_add(1, Ordering::Relaxed);
    }

    /// Counts a synchronous reply timeout.
    pub fn record_synchronous_timeout(&self) {
        self.synchronous_timeouts.fetch_add(1, Ordering::Relaxed);
    }

    /// Counts a delivered reply.
    pub fn record_reply_sent(&self) {
        self.replies_sent.fetch_add(1, Ordering::Relaxed);
    }

    /// Counts a failed listener iteration.
    pub fn record_loop_failure(&self) {
        self.loop_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Returns the current counter values.
    #[must_use]
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            received: self.received.load(Ordering::Relaxed),
            completed: self.completed.load(Ordering::Relaxed),
            abandoned: self.abandoned.load(Ordering::Relaxed),
            handled_exceptions: self.handled_exceptions.load(Ordering::Relaxed),
            unhandled_exceptions: self.unhandled_exceptions.load(Ordering::Relaxed),
            synchronous_timeouts: self.synchronous_timeouts.load(Ordering::Relaxed),
            replies_sent: self.replies_sent.load(Ordering::Relaxed),
            loop_failures: self.loop_failures.load(Ordering::Relaxed),
        }
    }
}
