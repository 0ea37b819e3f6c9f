//! Domain layer: queue classes, message envelopes and listener identity.

pub mod listener_id;
pub mod message;
pub mod queue_type;

pub use listener_id::ListenerId;
pub use message::{BrokerMessage, IncomingMessage};
pub use queue_type::QueueType;
