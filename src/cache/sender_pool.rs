//! Cache of sender links, one per destination queue.

use std::sync::Arc;

use async_trait::async_trait;

use super::entity_cache::{CachedEntity, EntityCache, EntityFactory};
use super::entry::EntitySummary;
use super::factory_pool::FactoryPool;
use crate::broker::MessageSender;
use crate::error::MessagingError;

#[async_trait]
impl CachedEntity for Arc<dyn MessageSender> {
    async fn close(&self) -> Result<(), MessagingError> {
        self.as_ref().close().await
    }

    fn is_closed(&self) -> bool {
        self.as_ref().is_closed()
    }
}

#[derive(Debug)]
struct SenderFactory {
    factories: Arc<FactoryPool>,
}

#[async_trait]
impl EntityFactory<Arc<dyn MessageSender>> for SenderFactory {
    async fn create_entity(&self, queue: &str) -> Result<Arc<dyn MessageSender>, MessagingError> {
        self.factories.find_next_factory()?.create_sender(queue).await
    }
}

/// Sender links reused across replies to the same queue.
#[derive(Debug)]
pub struct SenderPool {
    cache: EntityCache<Arc<dyn MessageSender>>,
}

impl SenderPool {
    /// Creates a pool holding at most `max_senders` idle links.
    #[must_use]
    pub fn new(factories: Arc<FactoryPool>, max_senders: usize) -> Self {
        let factory: Arc<dyn EntityFactory<Arc<dyn MessageSender>>> =
            Arc::new(SenderFactory { factories });
        Self {
            cache: EntityCache::new("SenderPool", max_senders, factory),
        }
    }

    /// Returns the cached sender for `queue`, creating it if needed.
    ///
    /// # Errors
    ///
    /// See [`EntityCache::create`].
    pub async fn create_cached_sender(
        &self,
        queue: &str,
    ) -> Result<Arc<dyn MessageSender>, MessagingError> {
        self.cache.create(queue).await
    }

    /// Hands the sender for `queue` back to the pool.
    pub fn release_cached_sender(&self, queue: &str) {
        self.cache.release(queue);
    }

    /// Closes every sender.
    pub async fn shutdown(&self) -> Vec<MessagingError> {
        self.cache.shutdown().await
    }

    /// Number of live senders.
    #[must_use]
    pub fn len(&self) -> usize {
        self.cache.len()
    }

    /// Returns `true` if no sender is live.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.cache.is_empty()
    }

    /// Per-queue sender summaries.
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

    #[tokio::test]
    async fn evicts_idle_sender_when_full() {
        let broker = InMemoryBroker::new();
        let factories: Vec<Arc<dyn FactoryProvider>> = vec![broker.factory()];
        let Ok(factories) = FactoryPool::new(factories) else {
            panic!("factory pool");
        };
        let pool = SenderPool::new(Arc::new(factories), 1);

        let Ok(first) = pool.create_cached_sender("reply-a").await else {
            panic!("sender creation failed");
        };
        pool.release_cached_sender("reply-a");
        tokio_test::assert_ok!(pool.create_cached_sender("reply-b").await);

        assert!(first.is_closed());
        assert_eq!(pool.len(), 1);
        assert_eq!(
            pool.entries().first().map(|e| e.key.as_str()),
            Some("reply-b")
        );
    }
}
