//! Orchestrator owning the pools, the hooks and the listener workers.
//!
//! ```text
//! MessagingServer
//!     │
//!     ├── NotificationDispatcher (hooks, registered before start)
//!     ├── AsyncListener_0..N ─┐
//!     ├── SyncListener_0..N ──┼── ReceiverPool ─┐
//!     ├── ErrorListener_0..N ─┘   SenderPool ───┼── FactoryPool
//!     └── CancellationToken (shared)            ┘
//! ```
//!
//! `start` spawns every worker on the current Tokio runtime. `stop` raises
//! the shared cancellation token, waits for the workers up to a deadline,
//! and then shuts the pools down whether or not every worker made it.

pub mod shutdown;
pub mod stats;

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::future::join_all;
use parking_lot::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::broker::FactoryProvider;
use crate::cache::{FactoryPool, ReceiverPool, SenderPool};
use crate::collaborators::{
    DirectoryLookup, NoopDirectoryLookup, NoopPayloadProtector, PayloadProtector,
};
use crate::config::MessagingConfig;
use crate::domain::{BrokerMessage, IncomingMessage, QueueType};
use crate::error::{BusinessError, MessagingError};
use crate::listener::{ListenerContext, ListenerInfo, ListenerState, MessageListener, SharedState};
use crate::notification::NotificationDispatcher;
use crate::telemetry;

pub use shutdown::ShutdownReport;
pub use stats::{ServerStats, StatsSnapshot};

/// Builder for [`MessagingServer`].
///
/// Connections are required; the payload protector and directory lookup
/// default to no-op implementations.
#[derive(Debug)]
pub struct MessagingServerBuilder {
    config: MessagingConfig,
    factories: Vec<Arc<dyn FactoryProvider>>,
    payload_protector: Option<Arc<dyn PayloadProtector>>,
    directory: Option<Arc<dyn DirectoryLookup>>,
}

impl MessagingServerBuilder {
    /// Starts a builder from a configuration.
    #[must_use]
    pub fn new(config: MessagingConfig) -> Self {
        Self {
            config,
            factories: Vec::new(),
            payload_protector: None,
            directory: None,
        }
    }

    /// Adds one broker connection to the factory pool.
    #[must_use]
    pub fn factory(mut self, factory: Arc<dyn FactoryProvider>) -> Self {
        self.factories.push(factory);
        self
    }

    /// Adds several broker connections to the factory pool.
    #[must_use]
    pub fn factories(mut self, factories: impl IntoIterator<Item = Arc<dyn FactoryProvider>>) -> Self {
        self.factories.extend(factories);
        self
    }

    /// Sets the payload protector handed to business callbacks.
    #[must_use]
    pub fn payload_protector(mut self, protector: Arc<dyn PayloadProtector>) -> Self {
        self.payload_protector = Some(protector);
        self
    }

    /// Sets the directory lookup used for reply-queue fallback.
    #[must_use]
    pub fn directory_lookup(mut self, directory: Arc<dyn DirectoryLookup>) -> Self {
        self.directory = Some(directory);
        self
    }

    /// Validates the configuration and builds the server and its pools.
    ///
    /// Connections beyond `max_factories` are ignored.
    ///
    /// # Errors
    ///
    /// Returns [`MessagingError::Configuration`] if the configuration is
    /// invalid or no connection was supplied.
    pub fn build(self) -> Result<MessagingServer, MessagingError> {
        self.config.validate()?;

        let mut factories = self.factories;
        if factories.len() > self.config.max_factories {
            tracing::warn!(
                supplied = factories.len(),
                max_factories = self.config.max_factories,
                "ignoring connections beyond the configured maximum"
            );
            factories.truncate(self.config.max_factories);
        }
        let factories = Arc::new(FactoryPool::new(factories)?);
        let receivers = Arc::new(ReceiverPool::new(
            Arc::clone(&factories),
            self.config.max_receivers,
            self.config.link_credits,
        ));
        let senders = Arc::new(SenderPool::new(
            Arc::clone(&factories),
            self.config.max_senders,
        ));

        Ok(MessagingServer {
            config: self.config,
            factories,
            receivers,
            senders,
            dispatcher: Arc::new(NotificationDispatcher::new()),
            stats: Arc::new(ServerStats::new()),
            payload_protector: self
                .payload_protector
                .unwrap_or_else(|| Arc::new(NoopPayloadProtector)),
            directory: self
                .directory
                .unwrap_or_else(|| Arc::new(NoopDirectoryLookup)),
            lifecycle: Mutex::new(Lifecycle::Created),
            listeners: RwLock::new(Vec::new()),
        })
    }
}

enum Lifecycle {
    Created,
    Running {
        cancel: CancellationToken,
        tasks: Vec<JoinHandle<()>>,
    },
    Stopped,
}

impl fmt::Debug for Lifecycle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Created => f.write_str("Created"),
            Self::Running { tasks, .. } => write!(f, "Running({} workers)", tasks.len()),
            Self::Stopped => f.write_str("Stopped"),
        }
    }
}

#[derive(Debug)]
struct ListenerSlot {
    info: ListenerInfo,
    state: Arc<SharedState>,
}

/// Messaging runtime: pools, hooks and listener workers.
#[derive(Debug)]
pub struct MessagingServer {
    config: MessagingConfig,
    factories: Arc<FactoryPool>,
    receivers: Arc<ReceiverPool>,
    senders: Arc<SenderPool>,
    dispatcher: Arc<NotificationDispatcher>,
    stats: Arc<ServerStats>,
    payload_protector: Arc<dyn PayloadProtector>,
    directory: Arc<dyn DirectoryLookup>,
    lifecycle: Mutex<Lifecycle>,
    listeners: RwLock<Vec<ListenerSlot>>,
}

impl MessagingServer {
    /// Starts a [`MessagingServerBuilder`].
    #[must_use]
    pub fn builder(config: MessagingConfig) -> MessagingServerBuilder {
        MessagingServerBuilder::new(config)
    }

    /// Spawns the configured number of listeners per queue class.
    ///
    /// Hooks should be registered before calling this.
    ///
    /// # Errors
    ///
    /// Returns [`MessagingError::Configuration`] if the server was already
    /// started or stopped, or if called outside a Tokio runtime.
    pub fn start(&self) -> Result<(), MessagingError> {
        let mut lifecycle = self.lifecycle.lock();
        match *lifecycle {
            Lifecycle::Created => {}
            Lifecycle::Running { .. } => {
                return Err(MessagingError::Configuration(
                    "messaging server is already started".to_string(),
                ));
            }
            Lifecycle::Stopped => {
                return Err(MessagingError::Configuration(
                    "messaging server has been stopped and cannot be restarted".to_string(),
                ));
            }
        }
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|err| MessagingError::Configuration(format!("no Tokio runtime: {err}")))?;

        let ctx = self.listener_context();
        let cancel = CancellationToken::new();
        let mut tasks = Vec::with_capacity(self.config.total_workers());
        let mut listeners = self.listeners.write();
        listeners.clear();

        for queue_type in QueueType::ALL {
            let class = self.config.queue_class(queue_type);
            for index in 0..class.processing_tasks {
                let listener = MessageListener::new(queue_type, index, class, ctx.clone());
                listeners.push(ListenerSlot {
                    info: listener.info(),
                    state: listener.state_handle(),
                });
                tasks.push(runtime.spawn(listener.run(cancel.clone())));
            }
        }

        tracing::info!(
            her_id = self.config.her_id,
            asynchronous = self.config.asynchronous.processing_tasks,
            synchronous = self.config.synchronous.processing_tasks,
            error = self.config.error.processing_tasks,
            "messaging server started"
        );
        *lifecycle = Lifecycle::Running { cancel, tasks };
        Ok(())
    }

    /// Stops every listener and closes all pools.
    ///
    /// Waits at most `timeout` for the workers to finish their in-flight
    /// message. The pools are shut down afterwards regardless, and workers
    /// still running at that point are aborted.
    ///
    /// # Errors
    ///
    /// Returns [`MessagingError::Configuration`] if the server is not
    /// running.
    pub async fn stop(&self, timeout: Duration) -> Result<ShutdownReport, MessagingError> {
        let (cancel, mut tasks) = {
            let mut lifecycle = self.lifecycle.lock();
            match std::mem::replace(&mut *lifecycle, Lifecycle::Stopped) {
                Lifecycle::Running { cancel, tasks } => (cancel, tasks),
                previous @ Lifecycle::Created => {
                    *lifecycle = previous;
                    return Err(MessagingError::Configuration(
                        "messaging server was never started".to_string(),
                    ));
                }
                Lifecycle::Stopped => {
                    return Err(MessagingError::Configuration(
                        "messaging server is already stopped".to_string(),
                    ));
                }
            }
        };

        let started = Instant::now();
        tracing::info!(workers = tasks.len(), timeout_ms = telemetry::millis(timeout), "stopping messaging server");
        cancel.cancel();
        for slot in self.listeners.read().iter() {
            slot.state.advance(ListenerState::Cancelling);
        }

        let mut report = ShutdownReport {
            workers: tasks.len(),
            ..ShutdownReport::default()
        };
        match tokio::time::timeout(timeout, join_all(tasks.iter_mut())).await {
            Ok(results) => {
                report.stopped_in_time = true;
                report.panicked = results.iter().filter(|r| r.is_err()).count();
            }
            Err(_) => {
                tracing::warn!(timeout_ms = telemetry::millis(timeout), "listeners did not stop in time");
            }
        }

        let mut failures = self.senders.shutdown().await;
        failures.extend(self.receivers.shutdown().await);
        failures.extend(self.factories.shutdown().await);
        report.failures = failures.iter().map(ToString::to_string).collect();

        for task in &tasks {
            if !task.is_finished() {
                task.abort();
                report.aborted += 1;
            }
        }

        report.live_entities =
            self.receivers.len() + self.senders.len() + self.factories.live_count();
        report.elapsed_ms = telemetry::millis(started.elapsed());
        tracing::info!(
            stopped_in_time = report.stopped_in_time,
            aborted = report.aborted,
            failures = report.failures.len(),
            elapsed_ms = report.elapsed_ms,
            "messaging server stopped"
        );
        Ok(report)
    }

    /// Returns `true` between a successful `start` and `stop`.
    #[must_use]
    pub fn is_running(&self) -> bool {
        matches!(*self.lifecycle.lock(), Lifecycle::Running { .. })
    }

    /// Identity and current state of every listener.
    #[must_use]
    pub fn listeners(&self) -> Vec<ListenerInfo> {
        self.listeners
            .read()
            .iter()
            .map(|slot| ListenerInfo {
                state: slot.state.get(),
                ..slot.info.clone()
            })
            .collect()
    }

    /// Current message counters.
    #[must_use]
    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// Configuration the server was built with.
    #[must_use]
    pub const fn config(&self) -> &MessagingConfig {
        &self.config
    }

    /// Hook registry.
    #[must_use]
    pub const fn dispatcher(&self) -> &Arc<NotificationDispatcher> {
        &self.dispatcher
    }

    /// Broker connection pool.
    #[must_use]
    pub const fn factory_pool(&self) -> &Arc<FactoryPool> {
        &self.factories
    }

    /// Receiver link pool.
    #[must_use]
    pub const fn receiver_pool(&self) -> &Arc<ReceiverPool> {
        &self.receivers
    }

    /// Sender link pool.
    #[must_use]
    pub const fn sender_pool(&self) -> &Arc<SenderPool> {
        &self.senders
    }

    /// Payload protector for business callbacks.
    #[must_use]
    pub const fn payload_protector(&self) -> &Arc<dyn PayloadProtector> {
        &self.payload_protector
    }

    /// Directory lookup for business callbacks.
    #[must_use]
    pub const fn directory_lookup(&self) -> &Arc<dyn DirectoryLookup> {
        &self.directory
    }

    /// See [`NotificationDispatcher::register_async_received`].
    pub fn register_async_received<F>(&self, hook: F)
    where
        F: Fn(&IncomingMessage) -> Result<(), BusinessError> + Send + Sync + 'static,
    {
        self.dispatcher.register_async_received(hook);
    }

    /// See [`NotificationDispatcher::register_async_received_starting`].
    pub fn register_async_received_starting<F>(&self, hook: F)
    where
        F: Fn(&IncomingMessage) -> Result<(), BusinessError> + Send + Sync + 'static,
    {
        self.dispatcher.register_async_received_starting(hook);
    }

    /// See [`NotificationDispatcher::register_async_received_completed`].
    pub fn register_async_received_completed<F>(&self, hook: F)
    where
        F: Fn(&IncomingMessage) -> Result<(), BusinessError> + Send + Sync + 'static,
    {
        self.dispatcher.register_async_received_completed(hook);
    }

    /// See [`NotificationDispatcher::register_sync_received`].
    pub fn register_sync_received<F>(&self, hook: F)
    where
        F: Fn(&IncomingMessage) -> Result<Vec<u8>, BusinessError> + Send + Sync + 'static,
    {
        self.dispatcher.register_sync_received(hook);
    }

    /// See [`NotificationDispatcher::register_sync_received_starting`].
    pub fn register_sync_received_starting<F>(&self, hook: F)
    where
        F: Fn(&IncomingMessage) -> Result<(), BusinessError> + Send + Sync + 'static,
    {
        self.dispatcher.register_sync_received_starting(hook);
    }

    /// See [`NotificationDispatcher::register_sync_received_completed`].
    pub fn register_sync_received_completed<F>(&self, hook: F)
    where
        F: Fn(&IncomingMessage) -> Result<(), BusinessError> + Send + Sync + 'static,
    {
        self.dispatcher.register_sync_received_completed(hook);
    }

    /// See [`NotificationDispatcher::register_error_received`].
    pub fn register_error_received<F>(&self, hook: F)
    where
        F: Fn(&BrokerMessage) -> Result<(), BusinessError> + Send + Sync + 'static,
    {
        self.dispatcher.register_error_received(hook);
    }

    /// See [`NotificationDispatcher::register_error_received_starting`].
    pub fn register_error_received_starting<F>(&self, hook: F)
    where
        F: Fn(&BrokerMessage) -> Result<(), BusinessError> + Send + Sync + 'static,
    {
        self.dispatcher.register_error_received_starting(hook);
    }

    /// See [`NotificationDispatcher::register_handled_exception`].
    pub fn register_handled_exception<F>(&self, hook: F)
    where
        F: Fn(&BrokerMessage, &MessagingError) + Send + Sync + 'static,
    {
        self.dispatcher.register_handled_exception(hook);
    }

    /// See [`NotificationDispatcher::register_unhandled_exception`].
    pub fn register_unhandled_exception<F>(&self, hook: F)
    where
        F: Fn(&BrokerMessage, &MessagingError) + Send + Sync + 'static,
    {
        self.dispatcher.register_unhandled_exception(hook);
    }

    fn listener_context(&self) -> ListenerContext {
        ListenerContext {
            receivers: Arc::clone(&self.receivers),
            senders: Arc::clone(&self.senders),
            dispatcher: Arc::clone(&self.dispatcher),
            stats: Arc::clone(&self.stats),
            directory: Arc::clone(&self.directory),
            sync_reply_timeout: self.config.sync_reply_timeout,
            retry_delay: self.config.entity_retry_delay,
        }
    }
}

#[cfg(test)]
#[allow(clippy::panic)]
mod tests {
    use super::*;
    use crate::broker::memory::InMemoryBroker;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn config() -> MessagingConfig {
        let mut config = MessagingConfig::for_her_id(7);
        for class in [
            &mut config.asynchronous,
            &mut config.synchronous,
            &mut config.error,
        ] {
            class.processing_tasks = 1;
            class.read_timeout = Duration::from_millis(20);
        }
        config.max_receivers = 2;
        config.entity_retry_delay = Duration::from_millis(10);
        config
    }

    fn server(broker: &InMemoryBroker, config: MessagingConfig) -> MessagingServer {
        let Ok(server) = MessagingServer::builder(config)
            .factory(broker.factory())
            .factory(broker.factory())
            .build()
        else {
            panic!("server build failed");
        };
        server
    }

    fn routed(id: &str) -> BrokerMessage {
        BrokerMessage::new(id, Vec::new()).with_routing("PING", 11, 7)
    }

    async fn wait_for(condition: impl Fn() -> bool) {
        let reached = tokio::time::timeout(Duration::from_secs(5), async {
            while !condition() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await;
        assert!(reached.is_ok(), "condition not reached before deadline");
    }

    #[test]
    fn build_without_connections_fails() {
        let result = MessagingServer::builder(config()).build();
        assert!(matches!(result, Err(MessagingError::Configuration(_))));
    }

    #[test]
    fn build_rejects_invalid_config() {
        let broker = InMemoryBroker::new();
        let mut config = config();
        config.link_credits = 0;
        let result = MessagingServer::builder(config)
            .factory(broker.factory())
            .build();
        assert!(matches!(result, Err(MessagingError::Configuration(_))));
    }

    #[test]
    fn start_outside_runtime_is_rejected() {
        let broker = InMemoryBroker::new();
        let server = server(&broker, config());
        assert!(matches!(
            server.start(),
            Err(MessagingError::Configuration(_))
        ));
        assert!(!server.is_running());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn start_launches_exactly_the_configured_workers() {
        let broker = InMemoryBroker::new();
        let mut config = config();
        config.asynchronous.processing_tasks = 3;
        config.synchronous.processing_tasks = 2;
        let server = server(&broker, config);

        tokio_test::assert_ok!(server.start());
        let listeners = server.listeners();
        assert_eq!(listeners.len(), 6);
        let names: Vec<&str> = listeners.iter().map(|l| l.name.as_str()).collect();
        assert_eq!(
            names,
            vec![
                "AsyncListener_0",
                "AsyncListener_1",
                "AsyncListener_2",
                "SyncListener_0",
                "SyncListener_1",
                "ErrorListener_0",
            ]
        );
        wait_for(|| {
            server
                .listeners()
                .iter()
                .all(|l| l.state == ListenerState::Running)
        })
        .await;

        let Ok(report) = server.stop(Duration::from_secs(2)).await else {
            panic!("stop failed");
        };
        assert_eq!(report.workers, 6);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn asynchronous_messages_flow_in_order_through_one_receiver() {
        let broker = InMemoryBroker::new();
        let server = server(&broker, config());
        let events = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let max_async_receivers = Arc::new(AtomicUsize::new(0));

        let log = Arc::clone(&events);
        server.register_async_received_starting(move |m| {
            log.lock().push(format!("starting:{}", m.message_id));
            Ok(())
        });
        let log = Arc::clone(&events);
        let receivers = Arc::clone(server.receiver_pool());
        let peak = Arc::clone(&max_async_receivers);
        server.register_async_received(move |m| {
            let async_links = receivers
                .entries()
                .iter()
                .filter(|e| e.key == "7_async")
                .count();
            peak.fetch_max(async_links, Ordering::SeqCst);
            log.lock().push(format!("received:{}", m.message_id));
            Ok(())
        });
        let log = Arc::clone(&events);
        server.register_async_received_completed(move |m| {
            log.lock().push(format!("completed:{}", m.message_id));
            Ok(())
        });

        for id in ["m-1", "m-2", "m-3"] {
            broker.enqueue("7_async", routed(id));
        }
        tokio_test::assert_ok!(server.start());
        wait_for(|| broker.completed("7_async").len() == 3).await;
        tokio_test::assert_ok!(server.stop(Duration::from_secs(2)).await);

        let expected: Vec<String> = ["m-1", "m-2", "m-3"]
            .iter()
            .flat_map(|id| {
                [
                    format!("starting:{id}"),
                    format!("received:{id}"),
                    format!("completed:{id}"),
                ]
            })
            .collect();
        assert_eq!(*events.lock(), expected);
        assert_eq!(max_async_receivers.load(Ordering::SeqCst), 1);
        assert_eq!(server.stats().completed, 3);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn error_message_without_handler_is_removed() {
        let broker = InMemoryBroker::new();
        let server = server(&broker, config());

        broker.enqueue("7_error", BrokerMessage::new("dead-1", Vec::new()));
        tokio_test::assert_ok!(server.start());
        wait_for(|| broker.completed("7_error").len() == 1).await;
        tokio_test::assert_ok!(server.stop(Duration::from_secs(2)).await);

        assert_eq!(broker.ready_count("7_error"), 0);
        assert_eq!(broker.locked_count("7_error"), 0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn stop_closes_every_pool() {
        let broker = InMemoryBroker::new();
        let server = server(&broker, config());
        server.register_sync_received(|_| Ok(b"pong".to_vec()));

        broker.enqueue("7_sync", routed("s-1").with_reply_to("reply-q"));
        tokio_test::assert_ok!(server.start());
        wait_for(|| broker.ready_count("reply-q") == 1).await;
        assert_eq!(server.sender_pool().len(), 1);

        let started = Instant::now();
        let Ok(report) = server.stop(Duration::from_secs(2)).await else {
            panic!("stop failed");
        };
        assert!(started.elapsed() < Duration::from_secs(3));
        assert!(report.is_clean());
        assert_eq!(report.aborted, 0);
        assert_eq!(report.live_entities, 0);
        assert!(server.receiver_pool().is_empty());
        assert!(server.sender_pool().is_empty());
        assert_eq!(server.factory_pool().live_count(), 0);
        assert!(
            server
                .listeners()
                .iter()
                .all(|l| l.state == ListenerState::Stopped)
        );
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn stop_is_bounded_when_a_worker_is_stuck() {
        let broker = InMemoryBroker::new();
        let mut config = config();
        config.sync_reply_timeout = Duration::from_secs(30);
        let server = server(&broker, config);
        let entered = Arc::new(AtomicUsize::new(0));

        let flag = Arc::clone(&entered);
        server.register_sync_received(move |_| {
            flag.store(1, Ordering::SeqCst);
            std::thread::sleep(Duration::from_millis(800));
            Ok(Vec::new())
        });

        broker.enqueue("7_sync", routed("s-2").with_reply_to("reply-q"));
        tokio_test::assert_ok!(server.start());
        wait_for(|| entered.load(Ordering::SeqCst) == 1).await;

        let started = Instant::now();
        let Ok(report) = server.stop(Duration::from_millis(100)).await else {
            panic!("stop failed");
        };
        assert!(started.elapsed() < Duration::from_millis(700));
        assert!(!report.stopped_in_time);
        assert_eq!(report.aborted, 1);
        assert_eq!(report.live_entities, 0);
    }

    #[tokio::test]
    async fn lifecycle_misuse_is_a_configuration_error() {
        let broker = InMemoryBroker::new();
        let server = server(&broker, config());

        tokio_test::assert_err!(server.stop(Duration::from_millis(100)).await);
        tokio_test::assert_ok!(server.start());
        assert!(matches!(
            server.start(),
            Err(MessagingError::Configuration(_))
        ));
        tokio_test::assert_ok!(server.stop(Duration::from_secs(2)).await);
        assert!(matches!(
            server.stop(Duration::from_millis(100)).await,
            Err(MessagingError::Configuration(_))
        ));
        assert!(matches!(
            server.start(),
            Err(MessagingError::Configuration(_))
        ));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn collaborators_default_to_noops() {
        let broker = InMemoryBroker::new();
        let server = server(&broker, config());
        assert!(server.directory_lookup().reply_queue(11).is_none());
        let protected = server.payload_protector().protect(b"x", 11);
        assert!(matches!(protected, Ok(p) if p == b"x".to_vec()));
    }
}
