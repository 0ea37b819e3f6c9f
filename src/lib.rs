//! # messaging-server
//!
//! Runtime core of a message-broker client exchanging business documents
//! between organisations over queues, with request/reply emulated on top.
//!
//! The crate pools broker connections and links, runs concurrent listener
//! workers per queue class (asynchronous, synchronous, error), drives each
//! received message through single-slot notification hooks, and shuts the
//! whole thing down within a bounded time.
//!
//! ## Architecture
//!
//! ```text
//! Business hooks
//!     │
//!     ├── NotificationDispatcher (notification/)
//!     │
//!     ├── MessagingServer (server/)
//!     │     └── MessageListener × N (listener/)
//!     │
//!     ├── ReceiverPool / SenderPool (cache/)
//!     │     └── EntityCache ── FactoryPool
//!     │
//!     └── FactoryProvider / MessageReceiver / MessageSender (broker/)
//! ```

pub mod broker;
pub mod cache;
pub mod collaborators;
pub mod config;
pub mod domain;
pub mod error;
pub mod listener;
pub mod notification;
pub mod server;
pub mod telemetry;
