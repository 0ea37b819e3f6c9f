//! Round-robin pool of broker connections.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use crate::broker::FactoryProvider;
use crate::error::MessagingError;

/// Fixed set of connections handed out in rotation to spread link load.
#[derive(Debug)]
pub struct FactoryPool {
    factories: Vec<Arc<dyn FactoryProvider>>,
    next: AtomicUsize,
    closed: AtomicBool,
}

impl FactoryPool {
    /// Creates a pool over the given connections.
    ///
    /// # Errors
    ///
    /// Returns [`MessagingError::Configuration`] if `factories` is empty.
    pub fn new(factories: Vec<Arc<dyn FactoryProvider>>) -> Result<Self, MessagingError> {
        if factories.is_empty() {
            return Err(MessagingError::Configuration(
                "factory pool needs at least one connection".to_string(),
            ));
        }
        Ok(Self {
            factories,
            next: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
        })
    }

    /// Returns the next connection in rotation.
    ///
    /// # Errors
    ///
    /// Returns [`MessagingError::ClosedCache`] after [`Self::shutdown`].
    pub fn find_next_factory(&self) -> Result<Arc<dyn FactoryProvider>, MessagingError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(MessagingError::ClosedCache {
                cache: "FactoryPool".to_string(),
            });
        }
        let index = self.next.fetch_add(1, Ordering::Relaxed) % self.factories.len();
        self.factories
            .get(index)
            .map(Arc::clone)
            .ok_or_else(|| MessagingError::Configuration("factory index out of range".to_string()))
    }

    /// Closes every connection. Failures are logged and returned.
    pub async fn shutdown(&self) -> Vec<MessagingError> {
        self.closed.store(true, Ordering::SeqCst);
        tracing::info!(factories = self.factories.len(), "shutting down factory pool");
        let mut failures = Vec::new();
        for (index, factory) in self.factories.iter().enumerate() {
            if factory.is_closed() {
                continue;
            }
            if let Err(err) = factory.close().await {
                tracing::warn!(index, error = %err, "failed to close connection");
                failures.push(err);
            }
        }
        failures
    }

    /// Number of configured connections.
    #[must_use]
    pub fn len(&self) -> usize {
        self.factories.len()
    }

    /// Always `false`; an empty pool cannot be built.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.factories.is_empty()
    }

    /// Number of connections that are still open.
    #[must_use]
    pub fn live_count(&self) -> usize {
        self.factories.iter().filter(|f| !f.is_closed()).count()
    }
}

#[cfg(test)]
#[allow(clippy::panic)]
mod tests {
    use super::*;
    use crate::broker::memory::InMemoryBroker;

    fn pool(size: usize) -> (Vec<Arc<dyn FactoryProvider>>, FactoryPool) {
        let broker = InMemoryBroker::new();
        let factories: Vec<Arc<dyn FactoryProvider>> = (0..size)
            .map(|_| broker.factory() as Arc<dyn FactoryProvider>)
            .collect();
        let Ok(pool) = FactoryPool::new(factories.clone()) else {
            panic!("pool creation failed");
        };
        (factories, pool)
    }

    #[test]
    fn empty_pool_is_rejected() {
        assert!(matches!(
            FactoryPool::new(Vec::new()),
            Err(MessagingError::Configuration(_))
        ));
    }

    #[test]
    fn rotates_round_robin() {
        let (factories, pool) = pool(3);
        for round in 0..2 {
            for expected in &factories {
                let Ok(next) = pool.find_next_factory() else {
                    panic!("round {round}: lookup failed");
                };
                assert!(Arc::ptr_eq(&next, expected));
            }
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_callers_spread_evenly() {
        let (factories, pool) = pool(4);
        let pool = Arc::new(pool);
        let tasks: Vec<_> = (0..4)
            .map(|_| {
                let pool = Arc::clone(&pool);
                tokio::spawn(async move {
                    (0..100)
                        .filter_map(|_| pool.find_next_factory().ok())
                        .collect::<Vec<_>>()
                })
            })
            .collect();
        let mut picks = Vec::new();
        for task in futures_util::future::join_all(tasks).await {
            let Ok(batch) = task else {
                panic!("task panicked");
            };
            picks.extend(batch);
        }
        for factory in &factories {
            let hits = picks.iter().filter(|p| Arc::ptr_eq(p, factory)).count();
            assert_eq!(hits, 100);
        }
    }

    #[tokio::test]
    async fn shutdown_closes_all_connections() {
        let (_, pool) = pool(2);
        assert_eq!(pool.live_count(), 2);
        let failures = pool.shutdown().await;
        assert!(failures.is_empty());
        assert_eq!(pool.live_count(), 0);
        assert!(pool.find_next_factory().is_err());
    }
}
