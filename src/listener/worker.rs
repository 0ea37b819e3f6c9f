//! The listener loop shared by all three queue classes.
//!
//! One loop, parameterized by [`QueueType`]. Each iteration borrows the
//! queue's receiver from the [`crate::cache::ReceiverPool`], waits for one
//! message, drives it through the hooks for its class and hands the
//! receiver back. A message that has been received is always settled
//! (completed or abandoned) before the loop looks at cancellation again.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use super::context::ListenerContext;
use super::state::{ListenerInfo, ListenerState, SharedState};
use crate::broker::MessageReceiver;
use crate::config::QueueClassConfig;
use crate::domain::{BrokerMessage, IncomingMessage, ListenerId, QueueType};
use crate::error::{BusinessError, MessagingError};
use crate::notification::Notification;
use crate::telemetry;

/// Outcome for the broker once processing is over.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Settlement {
    /// Remove the message from the queue.
    Complete,
    /// Release the lock so the broker redelivers or dead-letters it.
    Abandon,
}

/// One worker reading one queue class.
#[derive(Debug)]
pub struct MessageListener {
    id: ListenerId,
    name: String,
    queue_type: QueueType,
    queue_name: String,
    read_timeout: Duration,
    state: Arc<SharedState>,
    ctx: ListenerContext,
}

impl MessageListener {
    /// Creates the `index`-th listener of a queue class.
    #[must_use]
    pub fn new(
        queue_type: QueueType,
        index: usize,
        class: &QueueClassConfig,
        ctx: ListenerContext,
    ) -> Self {
        Self {
            id: ListenerId::new(),
            name: format!("{}_{index}", queue_type.listener_prefix()),
            queue_type,
            queue_name: class.queue_name.clone(),
            read_timeout: class.read_timeout,
            state: Arc::new(SharedState::default()),
            ctx,
        }
    }

    /// Unique id of this listener.
    #[must_use]
    pub const fn id(&self) -> ListenerId {
        self.id
    }

    /// Display name, e.g. `SyncListener_1`.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Queue class served.
    #[must_use]
    pub const fn queue_type(&self) -> QueueType {
        self.queue_type
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> ListenerState {
        self.state.get()
    }

    /// Handle to the state cell, valid after the listener has been moved
    /// into its task.
    #[must_use]
    pub fn state_handle(&self) -> Arc<SharedState> {
        Arc::clone(&self.state)
    }

    /// Snapshot of identity and state.
    #[must_use]
    pub fn info(&self) -> ListenerInfo {
        ListenerInfo {
            id: self.id,
            name: self.name.clone(),
            queue_type: self.queue_type,
            queue_name: self.queue_name.clone(),
            state: self.state.get(),
        }
    }

    /// Runs the loop until `cancel` fires or the pools are shut down.
    pub async fn run(self, cancel: CancellationToken) {
        let span = tracing::info_span!(
            "listener",
            name = %self.name,
            queue_type = %self.queue_type,
            listener_id = %self.id,
        );
        self.run_loop(&cancel).instrument(span).await;
    }

    async fn run_loop(&self, cancel: &CancellationToken) {
        self.state.advance(ListenerState::Running);
        tracing::info!(queue = %self.queue_name, "listener started");

        while !cancel.is_cancelled() {
            let Err(err) = self.poll_once(cancel).await else {
                continue;
            };
            if matches!(err, MessagingError::ClosedCache { .. }) {
                tracing::error!(error = %err, "pool closed, listener exiting");
                break;
            }
            self.ctx.stats.record_loop_failure();
            tracing::warn!(error = %err, code = err.error_code(), "listener iteration failed");
            tokio::select! {
                () = cancel.cancelled() => {}
                () = tokio::time::sleep(self.ctx.retry_delay) => {}
            }
        }

        self.state.advance(ListenerState::Cancelling);
        self.state.advance(ListenerState::Stopped);
        tracing::info!("listener stopped");
    }

    async fn poll_once(&self, cancel: &CancellationToken) -> Result<(), MessagingError> {
        let receiver = self
            .ctx
            .receivers
            .create_cached_receiver(&self.queue_name)
            .await?;
        let result = self.receive_and_process(receiver.as_ref(), cancel).await;
        self.ctx.receivers.release_cached_receiver(&self.queue_name);
        result
    }

    async fn receive_and_process(
        &self,
        receiver: &dyn MessageReceiver,
        cancel: &CancellationToken,
    ) -> Result<(), MessagingError> {
        let received = tokio::select! {
            biased;
            () = cancel.cancelled() => return Ok(()),
            received = receiver.receive(self.read_timeout) => received?,
        };
        let Some(message) = received else {
            return Ok(());
        };
        self.ctx.stats.record_received();
        tracing::debug!(
            message_id = %message.message_id,
            delivery_count = message.delivery_count,
            "message received"
        );

        let settlement = self.process(&message).await;
        self.settle(receiver, &message, settlement).await
    }

    async fn process(&self, message: &BrokerMessage) -> Settlement {
        let outcome = match self.queue_type {
            QueueType::Asynchronous => self.process_asynchronous(message),
            QueueType::Synchronous => self.process_synchronous(message).await,
            QueueType::Error => self.process_error(message),
        };
        match outcome {
            Ok(()) => {
                telemetry::log_remove_message_normal(&message.message_id);
                Settlement::Complete
            }
            Err(err) => self.report_failure(message, &err),
        }
    }

    fn process_asynchronous(&self, message: &BrokerMessage) -> Result<(), MessagingError> {
        let incoming = IncomingMessage::try_from(message)?;
        telemetry::log_start_receive(self.queue_type, &incoming);

        let dispatcher = &self.ctx.dispatcher;
        dispatcher.notify(self.queue_type, Notification::Starting, &incoming)?;
        dispatcher.notify(self.queue_type, Notification::Received, &incoming)?;
        dispatcher.notify(self.queue_type, Notification::Completed, &incoming)?;

        telemetry::log_end_receive(self.queue_type, &incoming);
        Ok(())
    }

    async fn process_synchronous(&self, message: &BrokerMessage) -> Result<(), MessagingError> {
        let incoming = IncomingMessage::try_from(message)?;
        telemetry::log_start_receive(self.queue_type, &incoming);

        let dispatcher = &self.ctx.dispatcher;
        dispatcher.notify(self.queue_type, Notification::Starting, &incoming)?;

        let reply_queue = message
            .reply_to
            .clone()
            .or_else(|| self.ctx.directory.reply_queue(incoming.from_her_id))
            .ok_or_else(|| MessagingError::InvalidHeader {
                header: "replyTo",
                message_id: incoming.message_id.clone(),
            })?;

        let started = Instant::now();
        if let Some(payload) = self.invoke_reply_hook(&incoming).await? {
            telemetry::log_response_time(&incoming, started.elapsed());
            self.send_reply(&reply_queue, incoming.reply(payload)).await?;
        }

        dispatcher.notify(self.queue_type, Notification::Completed, &incoming)?;
        telemetry::log_end_receive(self.queue_type, &incoming);
        Ok(())
    }

    /// Runs the synchronous `received` hook on the blocking pool.
    ///
    /// `Ok(None)` means no reply goes out: either no hook is registered or
    /// the hook missed the reply deadline.
    async fn invoke_reply_hook(
        &self,
        incoming: &IncomingMessage,
    ) -> Result<Option<Vec<u8>>, MessagingError> {
        if !self.ctx.dispatcher.has_sync_received() {
            tracing::debug!(message_id = %incoming.message_id, "no synchronous handler registered");
            return Ok(None);
        }
        let dispatcher = Arc::clone(&self.ctx.dispatcher);
        let request = incoming.clone();
        let hook = tokio::task::spawn_blocking(move || dispatcher.notify_sync_received(&request));

        match tokio::time::timeout(self.ctx.sync_reply_timeout, hook).await {
            Ok(Ok(reply)) => Ok(reply?),
            Ok(Err(join)) => Err(BusinessError::from(anyhow::Error::new(join)).into()),
            Err(_) => {
                let err = MessagingError::SynchronousTimeout {
                    message_id: incoming.message_id.clone(),
                    to_her_id: incoming.to_her_id,
                    timeout_ms: telemetry::millis(self.ctx.sync_reply_timeout),
                };
                self.ctx.stats.record_synchronous_timeout();
                telemetry::log_synchronous_timeout(
                    self.queue_type,
                    &incoming.message_id,
                    incoming.to_her_id,
                );
                tracing::debug!(code = err.error_code(), error = %err, "reply discarded");
                Ok(None)
            }
        }
    }

    async fn send_reply(&self, queue: &str, reply: BrokerMessage) -> Result<(), MessagingError> {
        let sender = self.ctx.senders.create_cached_sender(queue).await?;
        telemetry::log_start_send(self.queue_type, queue, &reply);
        let message_id = reply.message_id.clone();
        let sent = sender.send(reply).await;
        self.ctx.senders.release_cached_sender(queue);
        sent?;
        self.ctx.stats.record_reply_sent();
        telemetry::log_end_send(self.queue_type, queue, &message_id);
        Ok(())
    }

    fn process_error(&self, message: &BrokerMessage) -> Result<(), MessagingError> {
        tracing::info!(
            message_id = %message.message_id,
            delivery_count = message.delivery_count,
            "error queue message received"
        );
        let dispatcher = &self.ctx.dispatcher;
        dispatcher.notify_error_starting(message)?;
        dispatcher.notify_error_received(message)?;
        Ok(())
    }

    fn report_failure(&self, message: &BrokerMessage, err: &MessagingError) -> Settlement {
        if err.is_handled() {
            self.ctx.stats.record_handled_exception();
            tracing::warn!(
                message_id = %message.message_id,
                code = err.error_code(),
                error = %err,
                "handled processing failure"
            );
            self.ctx.dispatcher.notify_handled_exception(message, err);
        } else {
            self.ctx.stats.record_unhandled_exception();
            tracing::error!(
                message_id = %message.message_id,
                code = err.error_code(),
                error = %err,
                "unhandled processing failure"
            );
            self.ctx.dispatcher.notify_unhandled_exception(message, err);
        }

        // Error-queue messages never go back to the broker.
        if err.is_handled() || self.queue_type == QueueType::Error {
            telemetry::log_remove_message_error(&message.message_id);
            Settlement::Complete
        } else {
            Settlement::Abandon
        }
    }

    async fn settle(
        &self,
        receiver: &dyn MessageReceiver,
        message: &BrokerMessage,
        settlement: Settlement,
    ) -> Result<(), MessagingError> {
        match settlement {
            Settlement::Complete => {
                receiver.complete(message).await?;
                self.ctx.stats.record_completed();
            }
            Settlement::Abandon => {
                receiver.abandon(message).await?;
                self.ctx.stats.record_abandoned();
            }
        }
        Ok(())
    }
}
