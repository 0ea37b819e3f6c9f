//! In-process broker for the demo binary and tests.
//!
//! Queues are created on first use. A receiver locks a message on
//! delivery; `complete` removes it, `abandon` puts it back at the head of
//! the queue with its delivery count preserved. Entity creation can be
//! delayed or made to fail to exercise the pooling layer.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::time::Instant;
use uuid::Uuid;

use super::{FactoryProvider, MessageReceiver, MessageSender};
use crate::domain::BrokerMessage;
use crate::error::MessagingError;

#[derive(Debug, Default)]
struct QueueState {
    ready: VecDeque<BrokerMessage>,
    locked: HashMap<Uuid, BrokerMessage>,
    completed: Vec<BrokerMessage>,
    notify: Arc<Notify>,
}

#[derive(Debug, Default)]
struct BrokerState {
    queues: Mutex<HashMap<String, QueueState>>,
    credits: Mutex<HashMap<String, u32>>,
    receivers_created: AtomicUsize,
    senders_created: AtomicUsize,
    failing_creations: AtomicUsize,
    creation_delay: Mutex<Duration>,
}

/// Shared in-memory broker. Cloning yields another handle to the same queues.
#[derive(Debug, Clone, Default)]
pub struct InMemoryBroker {
    state: Arc<BrokerState>,
}

impl InMemoryBroker {
    /// Creates an empty broker.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Opens a new connection to this broker.
    #[must_use]
    pub fn factory(&self) -> Arc<InMemoryFactory> {
        Arc::new(InMemoryFactory {
            broker: self.clone(),
            closed: AtomicBool::new(false),
        })
    }

    /// Appends a message to `queue`, waking any waiting receiver.
    pub fn enqueue(&self, queue: &str, mut message: BrokerMessage) {
        message.enqueued_at = Utc::now();
        message.lock_token = None;
        let mut queues = self.state.queues.lock();
        let state = queues.entry(queue.to_string()).or_default();
        state.ready.push_back(message);
        state.notify.notify_waiters();
    }

    /// Number of messages waiting to be received on `queue`.
    #[must_use]
    pub fn ready_count(&self, queue: &str) -> usize {
        self.state
            .queues
            .lock()
            .get(queue)
            .map_or(0, |q| q.ready.len())
    }

    /// Number of messages currently locked by a receiver on `queue`.
    #[must_use]
    pub fn locked_count(&self, queue: &str) -> usize {
        self.state
            .queues
            .lock()
            .get(queue)
            .map_or(0, |q| q.locked.len())
    }

    /// Messages completed (removed) on `queue`, in completion order.
    #[must_use]
    pub fn completed(&self, queue: &str) -> Vec<BrokerMessage> {
        self.state
            .queues
            .lock()
            .get(queue)
            .map(|q| q.completed.clone())
            .unwrap_or_default()
    }

    /// Removes and returns every ready message on `queue`.
    pub fn drain(&self, queue: &str) -> Vec<BrokerMessage> {
        self.state
            .queues
            .lock()
            .get_mut(queue)
            .map(|q| q.ready.drain(..).collect())
            .unwrap_or_default()
    }

    /// Number of receivers created across all connections.
    #[must_use]
    pub fn receivers_created(&self) -> usize {
        self.state.receivers_created.load(Ordering::SeqCst)
    }

    /// Number of senders created across all connections.
    #[must_use]
    pub fn senders_created(&self) -> usize {
        self.state.senders_created.load(Ordering::SeqCst)
    }

    /// Credit the most recent receiver on `queue` was created with.
    #[must_use]
    pub fn receiver_credit(&self, queue: &str) -> Option<u32> {
        self.state.credits.lock().get(queue).copied()
    }

    /// Makes the next `count` receiver/sender creations fail.
    pub fn fail_next_creations(&self, count: usize) {
        self.state.failing_creations.store(count, Ordering::SeqCst);
    }

    /// Delays every receiver/sender creation by `delay`.
    pub fn set_creation_delay(&self, delay: Duration) {
        *self.state.creation_delay.lock() = delay;
    }

    async fn before_create(&self, queue: &str) -> Result<(), MessagingError> {
        let delay = *self.state.creation_delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        let failed = self
            .state
            .failing_creations
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failed {
            return Err(MessagingError::Broker(format!(
                "link to '{queue}' refused"
            )));
        }
        Ok(())
    }

    fn notifier(&self, queue: &str) -> Arc<Notify> {
        let mut queues = self.state.queues.lock();
        Arc::clone(&queues.entry(queue.to_string()).or_default().notify)
    }

    fn lock_next(&self, queue: &str) -> Option<BrokerMessage> {
        let mut queues = self.state.queues.lock();
        let state = queues.get_mut(queue)?;
        let mut message = state.ready.pop_front()?;
        let token = Uuid::new_v4();
        message.delivery_count = message.delivery_count.saturating_add(1);
        message.lock_token = Some(token);
        state.locked.insert(token, message.clone());
        Some(message)
    }

    fn settle(&self, queue: &str, message: &BrokerMessage, remove: bool) -> Result<(), MessagingError> {
        let lost = || MessagingError::Broker(format!("lock lost for message {}", message.message_id));
        let token = message.lock_token.ok_or_else(lost)?;
        let mut queues = self.state.queues.lock();
        let state = queues.get_mut(queue).ok_or_else(lost)?;
        let mut locked = state.locked.remove(&token).ok_or_else(lost)?;
        if remove {
            state.completed.push(locked);
        } else {
            locked.lock_token = None;
            state.ready.push_front(locked);
            state.notify.notify_waiters();
        }
        Ok(())
    }
}

/// One connection to an [`InMemoryBroker`].
#[derive(Debug)]
pub struct InMemoryFactory {
    broker: InMemoryBroker,
    closed: AtomicBool,
}

impl InMemoryFactory {
    fn ensure_open(&self) -> Result<(), MessagingError> {
        if self.is_closed() {
            return Err(MessagingError::Broker("connection is closed".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl FactoryProvider for InMemoryFactory {
    async fn create_receiver(
        &self,
        queue: &str,
        credit: u32,
    ) -> Result<Arc<dyn MessageReceiver>, MessagingError> {
        self.ensure_open()?;
        self.broker.before_create(queue).await?;
        self.broker
            .state
            .receivers_created
            .fetch_add(1, Ordering::SeqCst);
        self.broker
            .state
            .credits
            .lock()
            .insert(queue.to_string(), credit);
        Ok(Arc::new(InMemoryReceiver {
            broker: self.broker.clone(),
            queue: queue.to_string(),
            closed: AtomicBool::new(false),
        }))
    }

    async fn create_sender(&self, queue: &str) -> Result<Arc<dyn MessageSender>, MessagingError> {
        self.ensure_open()?;
        self.broker.before_create(queue).await?;
        self.broker
            .state
            .senders_created
            .fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(InMemorySender {
            broker: self.broker.clone(),
            queue: queue.to_string(),
            closed: AtomicBool::new(false),
        }))
    }

    async fn close(&self) -> Result<(), MessagingError> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

/// Receiver link on an [`InMemoryBroker`] queue.
#[derive(Debug)]
pub struct InMemoryReceiver {
    broker: InMemoryBroker,
    queue: String,
    closed: AtomicBool,
}

impl InMemoryReceiver {
    fn ensure_open(&self) -> Result<(), MessagingError> {
        if self.is_closed() {
            return Err(MessagingError::Broker(format!(
                "receiver for '{}' is closed",
                self.queue
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl MessageReceiver for InMemoryReceiver {
    fn queue(&self) -> &str {
        &self.queue
    }

    async fn receive(&self, timeout: Duration) -> Result<Option<BrokerMessage>, MessagingError> {
        self.ensure_open()?;
        let notify = self.broker.notifier(&self.queue);
        let deadline = Instant::now() + timeout;
        loop {
            // Register for wake-ups before looking so an enqueue between
            // the check and the wait is not missed.
            let notified = notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(message) = self.broker.lock_next(&self.queue) {
                return Ok(Some(message));
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(None);
            }
            self.ensure_open()?;
        }
    }

    async fn complete(&self, message: &BrokerMessage) -> Result<(), MessagingError> {
        self.broker.settle(&self.queue, message, true)
    }

    async fn abandon(&self, message: &BrokerMessage) -> Result<(), MessagingError> {
        self.broker.settle(&self.queue, message, false)
    }

    async fn close(&self) -> Result<(), MessagingError> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

/// Sender link on an [`InMemoryBroker`] queue.
#[derive(Debug)]
pub struct InMemorySender {
    broker: InMemoryBroker,
    queue: String,
    closed: AtomicBool,
}

#[async_trait]
impl MessageSender for InMemorySender {
    fn queue(&self) -> &str {
        &self.queue
    }

    async fn send(&self, message: BrokerMessage) -> Result<(), MessagingError> {
        if self.is_closed() {
            return Err(MessagingError::Broker(format!(
                "sender for '{}' is closed",
                self.queue
            )));
        }
        self.broker.enqueue(&self.queue, message);
        Ok(())
    }

    async fn close(&self) -> Result<(), MessagingError> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
#[allow(clippy::panic)]
mod tests {
    use super::*;

    fn message(id: &str) -> BrokerMessage {
        BrokerMessage::new(id, Vec::new())
    }

    async fn receiver(broker: &InMemoryBroker, queue: &str) -> Arc<dyn MessageReceiver> {
        let Ok(receiver) = broker.factory().create_receiver(queue, 25).await else {
            panic!("receiver creation failed");
        };
        receiver
    }

    #[tokio::test]
    async fn receive_locks_and_complete_removes() {
        let broker = InMemoryBroker::new();
        broker.enqueue("q", message("m-1"));
        let rx = receiver(&broker, "q").await;

        let Ok(Some(got)) = rx.receive(Duration::from_millis(50)).await else {
            panic!("expected a message");
        };
        assert_eq!(got.delivery_count, 1);
        assert_eq!(broker.locked_count("q"), 1);

        tokio_test::assert_ok!(rx.complete(&got).await);
        assert_eq!(broker.locked_count("q"), 0);
        assert_eq!(broker.completed("q").len(), 1);
    }

    #[tokio::test]
    async fn abandon_requeues_at_head() {
        let broker = InMemoryBroker::new();
        broker.enqueue("q", message("m-1"));
        broker.enqueue("q", message("m-2"));
        let rx = receiver(&broker, "q").await;

        let Ok(Some(first)) = rx.receive(Duration::from_millis(50)).await else {
            panic!("expected a message");
        };
        tokio_test::assert_ok!(rx.abandon(&first).await);

        let Ok(Some(again)) = rx.receive(Duration::from_millis(50)).await else {
            panic!("expected redelivery");
        };
        assert_eq!(again.message_id, "m-1");
        assert_eq!(again.delivery_count, 2);
    }

    #[tokio::test]
    async fn receive_times_out_on_empty_queue() {
        let broker = InMemoryBroker::new();
        let rx = receiver(&broker, "empty").await;
        let got = rx.receive(Duration::from_millis(20)).await;
        assert!(matches!(got, Ok(None)));
    }

    #[tokio::test]
    async fn waiting_receiver_wakes_on_enqueue() {
        let broker = InMemoryBroker::new();
        let rx = receiver(&broker, "q").await;
        let producer = broker.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            producer.enqueue("q", message("late"));
        });
        let got = rx.receive(Duration::from_secs(2)).await;
        assert!(matches!(got, Ok(Some(m)) if m.message_id == "late"));
    }

    #[tokio::test]
    async fn completing_twice_reports_lost_lock() {
        let broker = InMemoryBroker::new();
        broker.enqueue("q", message("m-1"));
        let rx = receiver(&broker, "q").await;
        let Ok(Some(got)) = rx.receive(Duration::from_millis(50)).await else {
            panic!("expected a message");
        };
        tokio_test::assert_ok!(rx.complete(&got).await);
        tokio_test::assert_err!(rx.complete(&got).await);
    }

    #[tokio::test]
    async fn injected_creation_failures_are_consumed() {
        let broker = InMemoryBroker::new();
        broker.fail_next_creations(1);
        let factory = broker.factory();
        assert!(factory.create_sender("q").await.is_err());
        assert!(factory.create_sender("q").await.is_ok());
        assert_eq!(broker.senders_created(), 1);
    }

    #[tokio::test]
    async fn closed_factory_refuses_links() {
        let broker = InMemoryBroker::new();
        let factory = broker.factory();
        tokio_test::assert_ok!(factory.close().await);
        assert!(factory.is_closed());
        assert!(factory.create_receiver("q", 1).await.is_err());
    }

    #[tokio::test]
    async fn sender_delivers_to_queue() {
        let broker = InMemoryBroker::new();
        let Ok(tx) = broker.factory().create_sender("replies").await else {
            panic!("sender creation failed");
        };
        tokio_test::assert_ok!(tx.send(message("r-1")).await);
        let drained = broker.drain("replies");
        assert_eq!(drained.len(), 1);
        assert_eq!(broker.ready_count("replies"), 0);
    }
}
