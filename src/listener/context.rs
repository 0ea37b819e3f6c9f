//! Shared state every listener works against.

use std::sync::Arc;
use std::time::Duration;

use crate::cache::{ReceiverPool, SenderPool};
use crate::collaborators::DirectoryLookup;
use crate::notification::NotificationDispatcher;
use crate::server::stats::ServerStats;

/// Pools, hooks and settings shared by all listeners of one server.
///
/// Cheap to clone; every field is reference-counted or `Copy`.
#[derive(Debug, Clone)]
pub struct ListenerContext {
    /// Receiver links, keyed by queue.
    pub receivers: Arc<ReceiverPool>,
    /// Sender links for synchronous replies, keyed by reply queue.
    pub senders: Arc<SenderPool>,
    /// Business hooks.
    pub dispatcher: Arc<NotificationDispatcher>,
    /// Message counters.
    pub stats: Arc<ServerStats>,
    /// Fallback for reply queues missing on synchronous requests.
    pub directory: Arc<dyn DirectoryLookup>,
    /// Deadline for the synchronous `received` hook.
    pub sync_reply_timeout: Duration,
    /// Pause after a failed listener iteration.
    pub retry_delay: Duration,
}
