//! Queue classes a listener can read from.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Queue class served by a listener.
///
/// Selects which queue the listener reads, which notification hooks fire,
/// and whether a reply is expected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueType {
    /// Fire-and-forget business documents.
    Asynchronous,
    /// Request/response emulated over queues; the callback returns a reply.
    Synchronous,
    /// Broker-reported delivery failures.
    Error,
}

impl QueueType {
    /// All queue classes, in the order listeners are started.
    pub const ALL: [Self; 3] = [Self::Asynchronous, Self::Synchronous, Self::Error];

    /// Prefix used when naming listeners of this class (`AsyncListener_0`).
    #[must_use]
    pub const fn listener_prefix(self) -> &'static str {
        match self {
            Self::Asynchronous => "AsyncListener",
            Self::Synchronous => "SyncListener",
            Self::Error => "ErrorListener",
        }
    }

    /// Suffix appended to the HerId to build the default queue name.
    #[must_use]
    pub const fn queue_suffix(self) -> &'static str {
        match self {
            Self::Asynchronous => "async",
            Self::Synchronous => "sync",
            Self::Error => "error",
        }
    }
}

impl fmt::Display for QueueType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Asynchronous => "Asynchronous",
            Self::Synchronous => "Synchronous",
            Self::Error => "Error",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_names() {
        assert_eq!(QueueType::Asynchronous.to_string(), "Asynchronous");
        assert_eq!(QueueType::Error.to_string(), "Error");
    }

    #[test]
    fn serializes_snake_case() {
        let json = serde_json::to_string(&QueueType::Synchronous).ok();
        assert_eq!(json.as_deref(), Some("\"synchronous\""));
    }
}
