//! Listener lifecycle state.

use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};

use serde::Serialize;

use crate::domain::{ListenerId, QueueType};

/// Lifecycle of a listener worker.
///
/// `Idle → Running → Cancelling → Stopped`. A listener never goes back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum ListenerState {
    /// Constructed, loop not started.
    Idle = 0,
    /// Polling its queue.
    Running = 1,
    /// Cancellation observed; finishing the in-flight message.
    Cancelling = 2,
    /// Loop exited.
    Stopped = 3,
}

impl ListenerState {
    const fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Idle,
            1 => Self::Running,
            2 => Self::Cancelling,
            _ => Self::Stopped,
        }
    }
}

impl fmt::Display for ListenerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::Running => "running",
            Self::Cancelling => "cancelling",
            Self::Stopped => "stopped",
        };
        f.write_str(name)
    }
}

/// State cell shared between a running listener and its observers.
#[derive(Debug)]
pub struct SharedState(AtomicU8);

impl Default for SharedState {
    fn default() -> Self {
        Self(AtomicU8::new(ListenerState::Idle as u8))
    }
}

impl SharedState {
    /// Current state.
    #[must_use]
    pub fn get(&self) -> ListenerState {
        ListenerState::from_u8(self.0.load(Ordering::Acquire))
    }

    /// Moves forward to `next`. Backward transitions are ignored.
    pub fn advance(&self, next: ListenerState) {
        self.0.fetch_max(next as u8, Ordering::AcqRel);
    }
}

/// Observable description of one listener.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ListenerInfo {
    /// Unique listener id.
    pub id: ListenerId,
    /// Display name (`AsyncListener_0`).
    pub name: String,
    /// Queue class served.
    pub queue_type: QueueType,
    /// Queue read.
    pub queue_name: String,
    /// State at the time of the call.
    pub state: ListenerState,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_idle_and_only_moves_forward() {
        let state = SharedState::default();
        assert_eq!(state.get(), ListenerState::Idle);
        state.advance(ListenerState::Running);
        state.advance(ListenerState::Stopped);
        state.advance(ListenerState::Cancelling);
        assert_eq!(state.get(), ListenerState::Stopped);
    }

    #[test]
    fn display_is_lowercase() {
        assert_eq!(ListenerState::Cancelling.to_string(), "cancelling");
    }
}
