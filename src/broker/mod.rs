//! Broker seams consumed by the pooling and listener layers.
//!
//! The wire protocol is out of scope; these traits are the whole contract
//! the rest of the crate relies on. [`memory`] provides an in-process
//! implementation used by the demo binary and the tests.

pub mod memory;

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::domain::BrokerMessage;
use crate::error::MessagingError;

/// A broker connection able to build receivers and senders.
///
/// One instance corresponds to one underlying connection; the
/// [`crate::cache::FactoryPool`] round-robins across several of them.
#[async_trait]
pub trait FactoryProvider: Send + Sync + fmt::Debug {
    /// Creates a receiver bound to `queue` with the given flow-control credit.
    async fn create_receiver(
        &self,
        queue: &str,
        credit: u32,
    ) -> Result<Arc<dyn MessageReceiver>, MessagingError>;

    /// Creates a sender bound to `queue`.
    async fn create_sender(&self, queue: &str) -> Result<Arc<dyn MessageSender>, MessagingError>;

    /// Closes the connection.
    async fn close(&self) -> Result<(), MessagingError>;

    /// Returns `true` once the connection is closed.
    fn is_closed(&self) -> bool;
}

/// Receiving end of a queue.
///
/// `receive` must be cancel-safe: dropping the future never loses a
/// message.
#[async_trait]
pub trait MessageReceiver: Send + Sync + fmt::Debug {
    /// Queue this receiver reads.
    fn queue(&self) -> &str;

    /// Waits up to `timeout` for the next message and locks it.
    async fn receive(&self, timeout: Duration) -> Result<Option<BrokerMessage>, MessagingError>;

    /// Removes a locked message from the queue.
    async fn complete(&self, message: &BrokerMessage) -> Result<(), MessagingError>;

    /// Releases the lock on a message so the broker can redeliver it.
    async fn abandon(&self, message: &BrokerMessage) -> Result<(), MessagingError>;

    /// Closes the receiver link.
    async fn close(&self) -> Result<(), MessagingError>;

    /// Returns `true` once the link is closed.
    fn is_closed(&self) -> bool;
}

/// Sending end of a queue.
#[async_trait]
pub trait MessageSender: Send + Sync + fmt::Debug {
    /// Queue this sender writes to.
    fn queue(&self) -> &str;

    /// Sends one message.
    async fn send(&self, message: BrokerMessage) -> Result<(), MessagingError>;

    /// Closes the sender link.
    async fn close(&self) -> Result<(), MessagingError>;

    /// Returns `true` once the link is closed.
    fn is_closed(&self) -> bool;
}
