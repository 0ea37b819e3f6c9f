//! Entity pooling layer: the generic cache and its broker specializations.
//!
//! ```text
//! ReceiverPool ─┐
//!               ├── EntityCache<T> ── EntityFactory ── FactoryPool ── FactoryProvider × N
//! SenderPool ───┘
//! ```

pub mod entity_cache;
pub mod entry;
pub mod factory_pool;
pub mod receiver_pool;
pub mod sender_pool;

pub use entity_cache::{CachedEntity, EntityCache, EntityFactory};
pub use entry::EntitySummary;
pub use factory_pool::FactoryPool;
pub use receiver_pool::ReceiverPool;
pub use sender_pool::SenderPool;
