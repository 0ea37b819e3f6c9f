//! Type-safe listener identifier.
//!
//! [`ListenerId`] is a newtype wrapper around [`uuid::Uuid`] (v4) so that
//! worker identities cannot be confused with message ids or lock tokens.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Unique identity of one listener worker.
///
/// Generated when the server builds its listeners at `start()` and attached
/// to the worker's tracing span.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ListenerId(uuid::Uuid);

impl ListenerId {
    /// Creates a new random `ListenerId` (UUID v4).
    #[must_use]
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }

    /// Returns the inner [`uuid::Uuid`].
    #[must_use]
    pub const fn as_uuid(&self) -> &uuid::Uuid {
        &self.0
    }
}

impl Default for ListenerId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ListenerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_generates_unique_ids() {
        assert_ne!(ListenerId::new(), ListenerId::new());
    }

    #[test]
    fn display_is_uuid_format() {
        let id = ListenerId::new();
        let s = id.to_string();
        assert_eq!(s.len(), 36);
        assert_eq!(s, id.as_uuid().to_string());
    }
}
