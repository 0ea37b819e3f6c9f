//! Bounded cache of named, lazily created, reusable broker entities.
//!
//! [`EntityCache`] maps a key (queue name) to one live entity. Creation is
//! serialized per key, so concurrent callers asking for the same key share
//! a single construction. When an insertion would exceed the capacity the
//! least-recently-used free entity is evicted and closed first.
//!
//! # Capacity
//!
//! The bound is soft: if every cached entity is in use, a new key is still
//! admitted and the cache temporarily holds more than `capacity` entries.
//! Busy entities are never closed to make room.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;

use super::entry::{EntitySummary, Slot};
use crate::error::MessagingError;

/// A broker-side handle that can live in an [`EntityCache`].
#[async_trait]
pub trait CachedEntity: Clone + Send + Sync + 'static {
    /// Closes the underlying link.
    async fn close(&self) -> Result<(), MessagingError>;

    /// Returns `true` if the link has been closed (by us or the broker).
    fn is_closed(&self) -> bool;
}

/// Builds the entity for a key on a cache miss.
#[async_trait]
pub trait EntityFactory<T>: Send + Sync + fmt::Debug {
    /// Creates a new entity for `key`.
    async fn create_entity(&self, key: &str) -> Result<T, MessagingError>;
}

/// Bounded, concurrent cache of broker entities.
pub struct EntityCache<T> {
    name: String,
    capacity: usize,
    factory: Arc<dyn EntityFactory<T>>,
    slots: Mutex<HashMap<String, Arc<Slot<T>>>>,
    closed: AtomicBool,
}

impl<T> fmt::Debug for EntityCache<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EntityCache")
            .field("name", &self.name)
            .field("capacity", &self.capacity)
            .field("factory", &self.factory)
            .field("slots", &self.slots.lock().len())
            .field("closed", &self.closed.load(Ordering::SeqCst))
            .finish()
    }
}

impl<T: CachedEntity> EntityCache<T> {
    /// Creates an empty cache holding at most `capacity` free entities.
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        capacity: usize,
        factory: Arc<dyn EntityFactory<T>>,
    ) -> Self {
        Self {
            name: name.into(),
            capacity: capacity.max(1),
            factory,
            slots: Mutex::new(HashMap::new()),
            closed: AtomicBool::new(false),
        }
    }

    /// Returns the entity for `key`, creating it on a miss, and marks it in use.
    ///
    /// Every successful call must be paired with a [`Self::release`].
    ///
    /// # Errors
    ///
    /// - [`MessagingError::ClosedCache`] after [`Self::shutdown`].
    /// - [`MessagingError::EntityCreation`] if the factory fails. The cache
    ///   does not retry.
    pub async fn create(&self, key: &str) -> Result<T, MessagingError> {
        loop {
            let (slot, evicted) = self.reserve(key)?;
            self.close_evicted(evicted).await;

            let _creation = slot.creation.lock().await;
            {
                let mut state = slot.state.lock();
                if state.detached {
                    continue;
                }
                if let Some(entity) = state.entity.as_ref() {
                    if !entity.is_closed() {
                        let entity = entity.clone();
                        state.active = state.active.saturating_add(1);
                        state.last_used = Utc::now();
                        return Ok(entity);
                    }
                    tracing::debug!(cache = %self.name, key, "cached entity was closed, recreating");
                    state.entity = None;
                }
            }

            return match self.factory.create_entity(key).await {
                Ok(entity) => self.install(&slot, key, entity).await,
                Err(err) => {
                    self.discard_empty(key, &slot);
                    tracing::warn!(cache = %self.name, key, error = %err, "entity creation failed");
                    Err(MessagingError::EntityCreation {
                        cache: self.name.clone(),
                        key: key.to_string(),
                        reason: err.to_string(),
                    })
                }
            };
        }
    }

    /// Marks one use of the entity for `key` as finished.
    ///
    /// The entity stays cached and becomes eligible for reuse or eviction
    /// once every user has released it. Unknown keys and calls after
    /// shutdown are ignored.
    pub fn release(&self, key: &str) {
        let slots = self.slots.lock();
        let Some(slot) = slots.get(key) else {
            if !self.is_closed() {
                tracing::warn!(cache = %self.name, key, "release of unknown entity");
            }
            return;
        };
        let mut state = slot.state.lock();
        if state.active == 0 {
            tracing::warn!(cache = %self.name, key, "release of entity that is not in use");
        }
        state.active = state.active.saturating_sub(1);
        state.last_used = Utc::now();
    }

    /// Closes every entity and clears the cache.
    ///
    /// Close failures are logged and returned; they never stop the
    /// remaining entities from being closed.
    pub async fn shutdown(&self) -> Vec<MessagingError> {
        self.closed.store(true, Ordering::SeqCst);
        let drained: Vec<(String, T)> = {
            let mut slots = self.slots.lock();
            slots
                .drain()
                .filter_map(|(key, slot)| {
                    let mut state = slot.state.lock();
                    state.detached = true;
                    state.entity.take().map(|entity| (key, entity))
                })
                .collect()
        };
        tracing::info!(cache = %self.name, entities = drained.len(), "shutting down entity cache");

        let mut failures = Vec::new();
        for (key, entity) in drained {
            if let Err(err) = entity.close().await {
                tracing::warn!(cache = %self.name, key, error = %err, "failed to close entity");
                failures.push(err);
            }
        }
        failures
    }

    /// Number of live entities.
    #[must_use]
    pub fn len(&self) -> usize {
        self.slots
            .lock()
            .values()
            .filter(|slot| slot.state.lock().entity.is_some())
            .count()
    }

    /// Returns `true` if the cache holds no live entity.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Summaries of all live entities, sorted by key.
    #[must_use]
    pub fn entries(&self) -> Vec<EntitySummary> {
        let slots = self.slots.lock();
        let mut summaries: Vec<EntitySummary> = slots
            .iter()
            .filter_map(|(key, slot)| {
                let state = slot.state.lock();
                state
                    .entity
                    .is_some()
                    .then(|| EntitySummary::from_state(key, &state))
            })
            .collect();
        summaries.sort_by(|a, b| a.key.cmp(&b.key));
        summaries
    }

    /// Cache name used in logs and errors.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Configured soft capacity.
    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.capacity
    }

    /// Returns `true` after [`Self::shutdown`].
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Finds or inserts the slot for `key`, evicting to make room for a new one.
    fn reserve(&self, key: &str) -> Result<(Arc<Slot<T>>, Vec<(String, T)>), MessagingError> {
        let mut slots = self.slots.lock();
        if self.is_closed() {
            return Err(MessagingError::ClosedCache {
                cache: self.name.clone(),
            });
        }
        if let Some(slot) = slots.get(key) {
            return Ok((Arc::clone(slot), Vec::new()));
        }
        let evicted = self.evict_for_insert(&mut slots);
        let slot = Arc::new(Slot::new());
        slots.insert(key.to_string(), Arc::clone(&slot));
        Ok((slot, evicted))
    }

    /// Detaches least-recently-used free slots until one more fits.
    fn evict_for_insert(&self, slots: &mut HashMap<String, Arc<Slot<T>>>) -> Vec<(String, T)> {
        let mut evicted = Vec::new();
        while slots.len() >= self.capacity {
            let victim = slots
                .iter()
                .filter_map(|(key, slot)| {
                    let state = slot.state.lock();
                    state.is_free().then(|| (key.clone(), state.last_used))
                })
                .min_by_key(|(_, last_used)| *last_used)
                .map(|(key, _)| key);

            let Some(key) = victim else {
                tracing::warn!(
                    cache = %self.name,
                    capacity = self.capacity,
                    size = slots.len(),
                    "no free entity to evict, exceeding capacity"
                );
                break;
            };
            let Some(slot) = slots.get(&key).map(Arc::clone) else {
                break;
            };
            let entity = {
                let mut state = slot.state.lock();
                // A holder of the slot may have claimed it since selection.
                if !state.is_free() {
                    continue;
                }
                state.detached = true;
                state.entity.take()
            };
            slots.remove(&key);
            if let Some(entity) = entity {
                evicted.push((key, entity));
            }
        }
        evicted
    }

    async fn close_evicted(&self, evicted: Vec<(String, T)>) {
        for (key, entity) in evicted {
            tracing::debug!(cache = %self.name, key, "evicting least recently used entity");
            if let Err(err) = entity.close().await {
                tracing::warn!(cache = %self.name, key, error = %err, "failed to close evicted entity");
            }
        }
    }

    async fn install(&self, slot: &Slot<T>, key: &str, entity: T) -> Result<T, MessagingError> {
        let accepted = {
            let mut state = slot.state.lock();
            if state.detached {
                false
            } else {
                let now = Utc::now();
                state.entity = Some(entity.clone());
                state.created_at = now;
                state.last_used = now;
                state.active = state.active.saturating_add(1);
                true
            }
        };
        if accepted {
            tracing::debug!(cache = %self.name, key, "entity created");
            return Ok(entity);
        }
        // Only shutdown detaches a slot that is still being created.
        if let Err(err) = entity.close().await {
            tracing::warn!(cache = %self.name, key, error = %err, "failed to close entity created during shutdown");
        }
        Err(MessagingError::ClosedCache {
            cache: self.name.clone(),
        })
    }

    /// Drops a slot whose first creation failed so it does not count
    /// against the capacity.
    fn discard_empty(&self, key: &str, slot: &Arc<Slot<T>>) {
        let mut slots = self.slots.lock();
        let is_current = slots
            .get(key)
            .is_some_and(|current| Arc::ptr_eq(current, slot));
        if !is_current {
            return;
        }
        let mut state = slot.state.lock();
        if state.entity.is_none() && state.active == 0 {
            state.detached = true;
            drop(state);
            slots.remove(key);
        }
    }
}
