//! Listener workers: one loop per worker, parameterized by queue class.

pub mod context;
pub mod state;
pub mod worker;

pub use context::ListenerContext;
pub use state::{ListenerInfo, ListenerState, SharedState};
pub use worker::MessageListener;
