//! Single-slot registry of business hooks invoked by listeners.
//!
//! Every lifecycle event has exactly one slot. Registering a hook replaces
//! whatever was there before (last writer wins); notifying an empty slot
//! is a no-op. Hooks run on the listener's task, so they should not block
//! for long. The synchronous `received` hook is the exception: it runs on
//! the blocking pool under the reply timeout.
//!
//! A hook that panics is reported as [`BusinessError::Unhandled`]; the
//! panic never reaches the listener loop.

use std::any::Any;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use parking_lot::RwLock;

use crate::domain::{BrokerMessage, IncomingMessage, QueueType};
use crate::error::{BusinessError, MessagingError};
use crate::telemetry;

/// Hook receiving a validated business message.
pub type MessageHook = Arc<dyn Fn(&IncomingMessage) -> Result<(), BusinessError> + Send + Sync>;

/// Synchronous `received` hook; returns the reply payload.
pub type ReplyHook = Arc<dyn Fn(&IncomingMessage) -> Result<Vec<u8>, BusinessError> + Send + Sync>;

/// Error-queue `received` hook; sees the raw broker message.
pub type ErrorMessageHook = Arc<dyn Fn(&BrokerMessage) -> Result<(), BusinessError> + Send + Sync>;

/// Handled/unhandled exception hook.
pub type ExceptionHook = Arc<dyn Fn(&BrokerMessage, &MessagingError) + Send + Sync>;

/// Lifecycle events a hook can be attached to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Notification {
    /// Processing of a message is about to start.
    Starting,
    /// The message is ready for business processing.
    Received,
    /// Processing finished successfully.
    Completed,
}

impl Notification {
    fn handler_name(self, queue_type: QueueType) -> &'static str {
        match (queue_type, self) {
            (QueueType::Asynchronous, Self::Starting) => "NotifyAsynchronousMessageReceivedStarting",
            (QueueType::Asynchronous, Self::Received) => "NotifyAsynchronousMessageReceived",
            (QueueType::Asynchronous, Self::Completed) => "NotifyAsynchronousMessageReceivedCompleted",
            (QueueType::Synchronous, Self::Starting) => "NotifySynchronousMessageReceivedStarting",
            (QueueType::Synchronous, Self::Received) => "NotifySynchronousMessageReceived",
            (QueueType::Synchronous, Self::Completed) => "NotifySynchronousMessageReceivedCompleted",
            (QueueType::Error, Self::Starting) => "NotifyErrorMessageReceivedStarting",
            (QueueType::Error, Self::Received | Self::Completed) => "NotifyErrorMessageReceived",
        }
    }
}

type Slot<H> = RwLock<Option<H>>;

/// Registry of notification hooks shared by all listeners.
#[derive(Default)]
pub struct NotificationDispatcher {
    async_starting: Slot<MessageHook>,
    async_received: Slot<MessageHook>,
    async_completed: Slot<MessageHook>,
    sync_starting: Slot<MessageHook>,
    sync_received: Slot<ReplyHook>,
    sync_completed: Slot<MessageHook>,
    error_starting: Slot<ErrorMessageHook>,
    error_received: Slot<ErrorMessageHook>,
    handled_exception: Slot<ExceptionHook>,
    unhandled_exception: Slot<ExceptionHook>,
}

impl fmt::Debug for NotificationDispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fn set<H>(slot: &Slot<H>) -> bool {
            slot.read().is_some()
        }
        f.debug_struct("NotificationDispatcher")
            .field("async_starting", &set(&self.async_starting))
            .field("async_received", &set(&self.async_received))
            .field("async_completed", &set(&self.async_completed))
            .field("sync_starting", &set(&self.sync_starting))
            .field("sync_received", &set(&self.sync_received))
            .field("sync_completed", &set(&self.sync_completed))
            .field("error_starting", &set(&self.error_starting))
            .field("error_received", &set(&self.error_received))
            .field("handled_exception", &set(&self.handled_exception))
            .field("unhandled_exception", &set(&self.unhandled_exception))
            .finish()
    }
}

impl NotificationDispatcher {
    /// Creates a dispatcher with every slot empty.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the asynchronous `received` hook.
    pub fn register_async_received<F>(&self, hook: F)
    where
        F: Fn(&IncomingMessage) -> Result<(), BusinessError> + Send + Sync + 'static,
    {
        *self.async_received.write() = Some(Arc::new(hook));
    }

    /// Sets the asynchronous `starting` hook.
    pub fn register_async_received_starting<F>(&self, hook: F)
    where
        F: Fn(&IncomingMessage) -> Result<(), BusinessError> + Send + Sync + 'static,
    {
        *self.async_starting.write() = Some(Arc::new(hook));
    }

    /// Sets the asynchronous `completed` hook.
    pub fn register_async_received_completed<F>(&self, hook: F)
    where
        F: Fn(&IncomingMessage) -> Result<(), BusinessError> + Send + Sync + 'static,
    {
        *self.async_completed.write() = Some(Arc::new(hook));
    }

    /// Sets the synchronous `received` hook, which produces the reply payload.
    pub fn register_sync_received<F>(&self, hook: F)
    where
        F: Fn(&IncomingMessage) -> Result<Vec<u8>, BusinessError> + Send + Sync + 'static,
    {
        *self.sync_received.write() = Some(Arc::new(hook));
    }

    /// Sets the synchronous `starting` hook.
    pub fn register_sync_received_starting<F>(&self, hook: F)
    where
        F: Fn(&IncomingMessage) -> Result<(), BusinessError> + Send + Sync + 'static,
    {
        *self.sync_starting.write() = Some(Arc::new(hook));
    }

    /// Sets the synchronous `completed` hook.
    pub fn register_sync_received_completed<F>(&self, hook: F)
    where
        F: Fn(&IncomingMessage) -> Result<(), BusinessError> + Send + Sync + 'static,
    {
        *self.sync_completed.write() = Some(Arc::new(hook));
    }

    /// Sets the error-queue `received` hook.
    pub fn register_error_received<F>(&self, hook: F)
    where
        F: Fn(&BrokerMessage) -> Result<(), BusinessError> + Send + Sync + 'static,
    {
        *self.error_received.write() = Some(Arc::new(hook));
    }

    /// Sets the error-queue `starting` hook.
    pub fn register_error_received_starting<F>(&self, hook: F)
    where
        F: Fn(&BrokerMessage) -> Result<(), BusinessError> + Send + Sync + 'static,
    {
        *self.error_starting.write() = Some(Arc::new(hook));
    }

    /// Sets the hook fired when processing fails with a handled error.
    pub fn register_handled_exception<F>(&self, hook: F)
    where
        F: Fn(&BrokerMessage, &MessagingError) + Send + Sync + 'static,
    {
        *self.handled_exception.write() = Some(Arc::new(hook));
    }

    /// Sets the hook fired when processing fails with an unhandled error.
    pub fn register_unhandled_exception<F>(&self, hook: F)
    where
        F: Fn(&BrokerMessage, &MessagingError) + Send + Sync + 'static,
    {
        *self.unhandled_exception.write() = Some(Arc::new(hook));
    }

    /// Invokes the message hook for `event` on `queue_type`.
    ///
    /// The synchronous `received` event and every error-queue event have
    /// their own entry points and are no-ops here.
    ///
    /// # Errors
    ///
    /// Propagates the hook's [`BusinessError`].
    pub fn notify(
        &self,
        queue_type: QueueType,
        event: Notification,
        message: &IncomingMessage,
    ) -> Result<(), BusinessError> {
        let slot = match (queue_type, event) {
            (QueueType::Asynchronous, Notification::Starting) => &self.async_starting,
            (QueueType::Asynchronous, Notification::Received) => &self.async_received,
            (QueueType::Asynchronous, Notification::Completed) => &self.async_completed,
            (QueueType::Synchronous, Notification::Starting) => &self.sync_starting,
            (QueueType::Synchronous, Notification::Completed) => &self.sync_completed,
            (QueueType::Synchronous, Notification::Received) | (QueueType::Error, _) => {
                return Ok(());
            }
        };
        let handler = event.handler_name(queue_type);
        tracing::debug!(handler, "notify");
        let Some(hook) = slot.read().clone() else {
            return Ok(());
        };
        telemetry::log_before_notification_handler(handler, message);
        let result = guarded(handler, || hook(message));
        telemetry::log_after_notification_handler(handler, message);
        result
    }

    /// Invokes the synchronous `received` hook.
    ///
    /// Returns `Ok(None)` when no hook is registered.
    ///
    /// # Errors
    ///
    /// Propagates the hook's [`BusinessError`].
    pub fn notify_sync_received(
        &self,
        message: &IncomingMessage,
    ) -> Result<Option<Vec<u8>>, BusinessError> {
        let handler = Notification::Received.handler_name(QueueType::Synchronous);
        tracing::debug!(handler, "notify");
        let Some(hook) = self.sync_received.read().clone() else {
            return Ok(None);
        };
        telemetry::log_before_notification_handler(handler, message);
        let result = guarded(handler, || hook(message));
        telemetry::log_after_notification_handler(handler, message);
        result.map(Some)
    }

    /// Returns `true` if a synchronous `received` hook is registered.
    #[must_use]
    pub fn has_sync_received(&self) -> bool {
        self.sync_received.read().is_some()
    }

    /// Invokes the error-queue `starting` hook.
    ///
    /// # Errors
    ///
    /// Propagates the hook's [`BusinessError`].
    pub fn notify_error_starting(&self, message: &BrokerMessage) -> Result<(), BusinessError> {
        let handler = Notification::Starting.handler_name(QueueType::Error);
        tracing::debug!(handler, "notify");
        let Some(hook) = self.error_starting.read().clone() else {
            return Ok(());
        };
        guarded(handler, || hook(message))
    }

    /// Invokes the error-queue `received` hook.
    ///
    /// # Errors
    ///
    /// Propagates the hook's [`BusinessError`].
    pub fn notify_error_received(&self, message: &BrokerMessage) -> Result<(), BusinessError> {
        let handler = Notification::Received.handler_name(QueueType::Error);
        tracing::debug!(handler, "notify");
        let Some(hook) = self.error_received.read().clone() else {
            return Ok(());
        };
        guarded(handler, || hook(message))
    }

    /// Invokes the handled-exception hook.
    pub fn notify_handled_exception(&self, message: &BrokerMessage, error: &MessagingError) {
        let handler = "NotifyHandledException";
        tracing::debug!(handler, "notify");
        let Some(hook) = self.handled_exception.read().clone() else {
            return;
        };
        let _ = guarded(handler, || {
            hook(message, error);
            Ok(())
        });
    }

    /// Invokes the unhandled-exception hook.
    pub fn notify_unhandled_exception(&self, message: &BrokerMessage, error: &MessagingError) {
        let handler = "NotifyUnhandledException";
        tracing::debug!(handler, "notify");
        let Some(hook) = self.unhandled_exception.read().clone() else {
            return;
        };
        let _ = guarded(handler, || {
            hook(message, error);
            Ok(())
        });
    }
}

/// Runs `hook`, converting a panic into [`BusinessError::Unhandled`].
fn guarded<T>(
    handler: &str,
    hook: impl FnOnce() -> Result<T, BusinessError>,
) -> Result<T, BusinessError> {
    panic::catch_unwind(AssertUnwindSafe(hook)).unwrap_or_else(|payload| {
        let reason = panic_reason(payload.as_ref());
        tracing::error!(handler, reason, "notification handler panicked");
        Err(anyhow::anyhow!("{handler} panicked: {reason}").into())
    })
}

fn panic_reason<'a>(payload: &'a (dyn Any + Send + 'static)) -> &'a str {
    payload
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("non-string panic payload")
}

#[cfg(test)]
#[allow(clippy::panic)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

    fn incoming() -> IncomingMessage {
        let raw = BrokerMessage::new("m-1", Vec::new()).with_routing("F", 1, 2);
        let Ok(msg) = IncomingMessage::try_from(&raw) else {
            panic!("valid message rejected");
        };
        msg
    }

    #[test]
    fn notify_without_hook_is_noop() {
        let dispatcher = NotificationDispatcher::new();
        let msg = incoming();
        assert!(
            dispatcher
                .notify(QueueType::Asynchronous, Notification::Received, &msg)
                .is_ok()
        );
        assert!(matches!(dispatcher.notify_sync_received(&msg), Ok(None)));
        assert!(
            dispatcher
                .notify_error_received(&BrokerMessage::new("e", Vec::new()))
                .is_ok()
        );
    }

    // Registration replaces; it does not fan out.
    #[test]
    fn last_registration_wins() {
        let dispatcher = NotificationDispatcher::new();
        let first = Arc::new(AtomicUsize::new(0));
        let second = Arc::new(AtomicUsize::new(0));

        let counter = Arc::clone(&first);
        dispatcher.register_async_received(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        let counter = Arc::clone(&second);
        dispatcher.register_async_received(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        let msg = incoming();
        let _ = dispatcher.notify(QueueType::Asynchronous, Notification::Received, &msg);
        let _ = dispatcher.notify(QueueType::Asynchronous, Notification::Received, &msg);

        assert_eq!(first.load(Ordering::SeqCst), 0);
        assert_eq!(second.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn hooks_are_routed_by_queue_type() {
        let dispatcher = NotificationDispatcher::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&hits);
        dispatcher.register_sync_received_starting(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        let msg = incoming();
        let _ = dispatcher.notify(QueueType::Asynchronous, Notification::Starting, &msg);
        assert_eq!(hits.load(Ordering::SeqCst), 0);
        let _ = dispatcher.notify(QueueType::Synchronous, Notification::Starting, &msg);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn sync_received_returns_reply() {
        let dispatcher = NotificationDispatcher::new();
        dispatcher.register_sync_received(|msg| Ok(format!("re:{}", msg.message_id).into_bytes()));
        assert!(dispatcher.has_sync_received());
        let reply = dispatcher.notify_sync_received(&incoming());
        assert!(matches!(reply, Ok(Some(body)) if body == b"re:m-1".to_vec()));
    }

    #[test]
    fn hook_errors_propagate() {
        let dispatcher = NotificationDispatcher::new();
        dispatcher.register_async_received_completed(|_| Err(BusinessError::handled("X1", "nope")));
        let result = dispatcher.notify(QueueType::Asynchronous, Notification::Completed, &incoming());
        assert!(matches!(result, Err(err) if err.is_handled()));
    }

    #[test]
    fn panicking_hook_becomes_unhandled_error() {
        let dispatcher = NotificationDispatcher::new();
        dispatcher.register_async_received(|msg| panic!("cannot parse {}", msg.message_id));
        dispatcher.register_error_received(|_| panic!("report failed"));
        dispatcher.register_unhandled_exception(|_, _| panic!("hook of hooks"));

        let result = dispatcher.notify(QueueType::Asynchronous, Notification::Received, &incoming());
        let Err(err) = result else {
            panic!("panic was not reported");
        };
        assert!(!err.is_handled());
        assert!(err.to_string().contains("cannot parse m-1"));

        let raw = BrokerMessage::new("e", Vec::new());
        assert!(matches!(dispatcher.notify_error_received(&raw), Err(e) if !e.is_handled()));
        dispatcher.notify_unhandled_exception(&raw, &MessagingError::Broker("gone".to_string()));
    }

    #[test]
    fn exception_hooks_receive_error() {
        let dispatcher = NotificationDispatcher::new();
        let seen = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&seen);
        dispatcher.register_unhandled_exception(move |_, err| {
            counter.store(err.error_code(), Ordering::SeqCst);
        });
        dispatcher.notify_unhandled_exception(
            &BrokerMessage::new("m", Vec::new()),
            &MessagingError::Broker("gone".to_string()),
        );
        assert_eq!(seen.load(Ordering::SeqCst), 3001);
    }
}
