//! Cache of receiver links, one per queue.

use std::sync::Arc;

use async_trait::async_trait;

use super::entity_cache::{CachedEntity, EntityCache, EntityFactory};
use super::entry::EntitySummary;
use super::factory_pool::FactoryPool;
use crate::broker::MessageReceiver;
use crate::error::MessagingError;

#[async_trait]
impl CachedEntity for Arc<dyn MessageReceiver> {
    async fn close(&self) -> Result<(), MessagingError> {
        self.as_ref().close().await
    }

    fn is_closed(&self) -> bool {
        self.as_ref().is_closed()
    }
}

/// Builds receivers on the next pooled connection with a fixed credit.
#[derive(Debug)]
struct ReceiverFactory {
    factories: Arc<FactoryPool>,
    credit: u32,
}

#[async_trait]
impl EntityFactory<Arc<dyn MessageReceiver>> for ReceiverFactory {
    async fn create_entity(&self, queue: &str) -> Result<Arc<dyn MessageReceiver>, MessagingError> {
        let factory = self.factories.find_next_factory()?;
        factory.create_receiver(queue, self.credit).await
    }
}

/// Receiver links shared by every listener reading the same queue.
#[derive(Debug)]
pub struct ReceiverPool {
    cache: EntityCache<Arc<dyn MessageReceiver>>,
}

impl ReceiverPool {
    /// Creates a pool holding at most `max_receivers` idle links, each
    /// opened with `credit` flow-control credit.
    #[must_use]
    pub fn new(factories: Arc<FactoryPool>, max_receivers: usize, credit: u32) -> Self {
        let factory: Arc<dyn EntityFactory<Arc<dyn MessageReceiver>>> =
            Arc::new(ReceiverFactory { factories, credit });
        Self {
            cache: EntityCache::new("ReceiverPool", max_receivers, factory),
        }
    }

    /// Returns the cached receiver for `queue`, creating it if needed.
    ///
    /// # Errors
    ///
    /// See [`EntityCache::create`].
    pub async fn create_cached_receiver(
        &self,
        queue: &str,
    ) -> Result<Arc<dyn MessageReceiver>, MessagingError> {
        self.cache.create(queue).await
    }

    /// Hands the receiver for `queue` back to the pool.
    pub fn release_cached_receiver(&self, queue: &str) {
        self.cache.release(queue);
    }

    /// Closes every receiver.
    pub async fn shutdown(&self) -> Vec<MessagingError> {
        self.cache.shutdown().await
    }

    /// Number of live receivers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.cache.len()
    }

    /// Returns `true` if no receiver is live.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.cache.is_empty()
    }

    /// Per-queue receiver summaries.
    #[must_use]
    pub fn entries(&self) -> Vec<EntitySummary> {
        self.cache.entries()
    }
}

#[cfg(test)]
#[allow(clippy::panic)]
mod tests {
    use super::*;
    use crate::broker::FactoryProvider;
    use crate::broker::memory::InMemoryBroker;

    fn receiver_pool(broker: &InMemoryBroker, max: usize, credit: u32) -> ReceiverPool {
        let factories: Vec<Arc<dyn FactoryProvider>> = vec![broker.factory()];
        let Ok(factories) = FactoryPool::new(factories) else {
            panic!("factory pool");
        };
        ReceiverPool::new(Arc::new(factories), max, credit)
    }

    #[tokio::test]
    async fn receivers_are_created_with_configured_credit() {
        let broker = InMemoryBroker::new();
        let pool = receiver_pool(&broker, 5, 42);

        let Ok(receiver) = pool.create_cached_receiver("100_async").await else {
            panic!("receiver creation failed");
        };
        assert_eq!(receiver.queue(), "100_async");
        assert_eq!(broker.receiver_credit("100_async"), Some(42));
    }

    #[tokio::test]
    async fn same_queue_shares_one_link() {
        let broker = InMemoryBroker::new();
        let pool = receiver_pool(&broker, 5, 25);

        for _ in 0..3 {
            tokio_test::assert_ok!(pool.create_cached_receiver("q").await);
        }
        for _ in 0..3 {
            pool.release_cached_receiver("q");
        }
        assert_eq!(broker.receivers_created(), 1);
        assert_eq!(pool.len(), 1);
    }

    #[tokio::test]
    async fn shutdown_leaves_no_live_receivers() {
        let broker = InMemoryBroker::new();
        let pool = receiver_pool(&broker, 5, 25);
        let Ok(receiver) = pool.create_cached_receiver("q").await else {
            panic!("receiver creation failed");
        };
        assert!(pool.shutdown().await.is_empty());
        assert!(pool.is_empty());
        assert!(receiver.is_closed());
    }
}
