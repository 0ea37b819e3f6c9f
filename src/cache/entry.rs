//! Cache slot combining a broker entity with usage metadata.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;

/// Mutable part of a slot.
#[derive(Debug)]
pub(crate) struct SlotState<T> {
    /// The live entity, `None` until the first successful creation.
    pub(crate) entity: Option<T>,
    /// Creation timestamp of the current entity.
    pub(crate) created_at: DateTime<Utc>,
    /// Last `create` or `release` touching this slot.
    pub(crate) last_used: DateTime<Utc>,
    /// Number of callers currently holding the entity.
    pub(crate) active: usize,
    /// Set when the slot has been removed from the map (eviction or
    /// shutdown). Waiters must start over.
    pub(crate) detached: bool,
}

/// One key's entry in an [`super::EntityCache`].
///
/// `creation` is held across the factory `.await` and serializes creation
/// per key; `state` is only ever locked for short, non-async sections.
#[derive(Debug)]
pub(crate) struct Slot<T> {
    pub(crate) creation: tokio::sync::Mutex<()>,
    pub(crate) state: Mutex<SlotState<T>>,
}

impl<T> Slot<T> {
    pub(crate) fn new() -> Self {
        let now = Utc::now();
        Self {
            creation: tokio::sync::Mutex::new(()),
            state: Mutex::new(SlotState {
                entity: None,
                created_at: now,
                last_used: now,
                active: 0,
                detached: false,
            }),
        }
    }
}

impl<T> SlotState<T> {
    /// A slot can be evicted when it holds an entity nobody is using.
    pub(crate) fn is_free(&self) -> bool {
        self.entity.is_some() && self.active == 0
    }
}

/// Lightweight summary of a cached entity for diagnostics.
#[derive(Debug, Clone, Serialize)]
pub struct EntitySummary {
    /// Entity key (queue name).
    pub key: String,
    /// When the current entity was created.
    pub created_at: DateTime<Utc>,
    /// Last time the entity was handed out or released.
    pub last_used: DateTime<Utc>,
    /// Number of callers currently holding the entity.
    pub active_count: usize,
}

impl EntitySummary {
    pub(crate) fn from_state<T>(key: &str, state: &SlotState<T>) -> Self {
        Self {
            key: key.to_string(),
            created_at: state.created_at,
            last_used: state.last_used,
            active_count: state.active,
        }
    }
}
