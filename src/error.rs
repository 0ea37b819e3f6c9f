//! Messaging error types with numeric code mapping.
//!
//! [`MessagingError`] is the central error type of the crate. Business
//! callbacks report failures through [`BusinessError`], which the listener
//! classifies into handled (message removed) and unhandled (message left
//! for broker redelivery).

/// Failure reported by a business callback.
///
/// The variant decides what happens to the message that was being
/// processed:
///
/// - [`BusinessError::Handled`]: the failure is understood. The handled
///   exception hook fires and the message is removed from its queue.
/// - [`BusinessError::Unhandled`]: anything else. The unhandled exception
///   hook fires and the message is abandoned so the broker can redeliver
///   or dead-letter it.
///
/// `?` on an [`anyhow::Error`] converts into the unhandled variant.
#[derive(Debug, thiserror::Error)]
pub enum BusinessError {
    /// Recoverable, caller-classified failure.
    #[error("{code}: {description}")]
    Handled {
        /// Short machine-readable error code chosen by the callback.
        code: String,
        /// Human-readable description.
        description: String,
    },

    /// Unrecoverable failure.
    #[error(transparent)]
    Unhandled(#[from] anyhow::Error),
}

impl BusinessError {
    /// Builds a [`BusinessError::Handled`] from a code and description.
    #[must_use]
    pub fn handled(code: impl Into<String>, description: impl Into<String>) -> Self {
        Self::Handled {
            code: code.into(),
            description: description.into(),
        }
    }

    /// Returns `true` for [`BusinessError::Handled`].
    #[must_use]
    pub const fn is_handled(&self) -> bool {
        matches!(self, Self::Handled { .. })
    }
}

/// Crate-wide error enum.
///
/// # Error Code Ranges
///
/// | Range     | Category                         |
/// |-----------|----------------------------------|
/// | 1000–1999 | Configuration / lifecycle misuse |
/// | 2000–2999 | Entity cache                     |
/// | 3000–3999 | Broker                           |
/// | 4000–4999 | Message / business               |
/// | 5000–5999 | Timeouts                         |
#[derive(Debug, thiserror::Error)]
pub enum MessagingError {
    /// Invalid configuration, or `start`/`stop` called out of order.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// A factory failed to build a broker entity.
    #[error("{cache}: failed to create entity '{key}': {reason}")]
    EntityCreation {
        /// Name of the cache that requested the entity.
        cache: String,
        /// Entity key (queue name).
        key: String,
        /// Underlying failure.
        reason: String,
    },

    /// Operation attempted on a cache or pool that has been shut down.
    #[error("{cache} has been shut down")]
    ClosedCache {
        /// Name of the closed cache.
        cache: String,
    },

    /// Broker-side failure (receive, send, complete, close).
    #[error("broker error: {0}")]
    Broker(String),

    /// A required message header is missing or malformed.
    #[error("message {message_id}: invalid header '{header}'")]
    InvalidHeader {
        /// Header name.
        header: &'static str,
        /// Broker message id.
        message_id: String,
    },

    /// Error raised by a business callback.
    #[error("business error: {0}")]
    Business(#[from] BusinessError),

    /// The synchronous handler did not produce a reply in time.
    #[error("synchronous call {message_id} timed out after {timeout_ms} ms against HerId {to_her_id}")]
    SynchronousTimeout {
        /// Request message id.
        message_id: String,
        /// Organisation the request was addressed to.
        to_her_id: i32,
        /// Configured timeout in milliseconds.
        timeout_ms: u64,
    },
}

impl MessagingError {
    /// Returns the numeric error code for this variant.
    #[must_use]
    pub const fn error_code(&self) -> u32 {
        match self {
            Self::Configuration(_) => 1001,
            Self::EntityCreation { .. } => 2001,
            Self::ClosedCache { .. } => 2002,
            Self::Broker(_) => 3001,
            Self::InvalidHeader { .. } => 4001,
            Self::Business(BusinessError::Handled { .. }) => 4002,
            Self::Business(BusinessError::Unhandled(_)) => 4003,
            Self::SynchronousTimeout { .. } => 5001,
        }
    }

    /// Returns `true` when processing may remove the message from its queue
    /// after reporting this error.
    #[must_use]
    pub const fn is_handled(&self) -> bool {
        match self {
            Self::InvalidHeader { .. } => true,
            Self::Business(err) => err.is_handled(),
            _ => false,
        }
    }
}
