//! Outcome of [`super::MessagingServer::stop`].

use serde::Serialize;

/// What happened during a bounded shutdown.
///
/// Pool close failures are collected here rather than returned as an
/// error; shutdown is best-effort.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ShutdownReport {
    /// Workers that were running when `stop` was called.
    pub workers: usize,
    /// `true` if every worker exited before the deadline.
    pub stopped_in_time: bool,
    /// Workers that ended by panicking.
    pub panicked: usize,
    /// Workers still running after the pools closed, aborted.
    pub aborted: usize,
    /// Wall-clock time spent in `stop`, in milliseconds.
    pub elapsed_ms: u64,
    /// Errors raised while closing senders, receivers and connections.
    pub failures: Vec<String>,
    /// Live entities left across all pools after shutdown.
    pub live_entities: usize,
}

impl ShutdownReport {
    /// Returns `true` if every worker stopped in time and every entity
    /// closed cleanly.
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.stopped_in_time && self.panicked == 0 && self.failures.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_report_is_not_clean() {
        assert!(!ShutdownReport::default().is_clean());
    }

    #[test]
    fn pool_failures_make_report_unclean() {
        let report = ShutdownReport {
            stopped_in_time: true,
            failures: vec!["broker error: link detached".to_string()],
            ..ShutdownReport::default()
        };
        assert!(!report.is_clean());
    }
}
