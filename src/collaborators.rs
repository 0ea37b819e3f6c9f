//! Collaborator contracts handed through to business callbacks.
//!
//! The server holds them so that hooks can reach the payload protector
//! and the directory through [`crate::server::MessagingServer`]. Listeners
//! ask the directory for a reply queue when a synchronous request carries
//! none. Both default to no-op implementations.

use std::fmt;

use crate::error::BusinessError;

/// Encrypts, signs and validates message payloads.
pub trait PayloadProtector: Send + Sync + fmt::Debug {
    /// Protects an outgoing payload addressed to `to_her_id`.
    ///
    /// # Errors
    ///
    /// Returns a [`BusinessError`] if the payload cannot be protected.
    fn protect(&self, payload: &[u8], to_her_id: i32) -> Result<Vec<u8>, BusinessError>;

    /// Verifies and unwraps an incoming payload sent by `from_her_id`.
    ///
    /// # Errors
    ///
    /// Returns a [`BusinessError`] if the payload or its certificate is
    /// invalid.
    fn unprotect(&self, payload: &[u8], from_her_id: i32) -> Result<Vec<u8>, BusinessError>;
}

/// Resolves routing metadata for an organisation.
pub trait DirectoryLookup: Send + Sync + fmt::Debug {
    /// Returns the queue that synchronous replies for `her_id` go to, if the
    /// directory knows it.
    fn reply_queue(&self, her_id: i32) -> Option<String>;
}

/// Passes payloads through unchanged.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopPayloadProtector;

impl PayloadProtector for NoopPayloadProtector {
    fn protect(&self, payload: &[u8], _to_her_id: i32) -> Result<Vec<u8>, BusinessError> {
        Ok(payload.to_vec())
    }

    fn unprotect(&self, payload: &[u8], _from_her_id: i32) -> Result<Vec<u8>, BusinessError> {
        Ok(payload.to_vec())
    }
}

/// Knows no organisation.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopDirectoryLookup;

impl DirectoryLookup for NoopDirectoryLookup {
    fn reply_queue(&self, _her_id: i32) -> Option<String> {
        None
    }
}

#[cfg(test)]
#[allow(clippy::panic)]
mod tests {
    use super::*;

    #[test]
    fn noop_protector_round_trips_payload() {
        let protector = NoopPayloadProtector;
        let Ok(sealed) = protector.protect(b"<doc/>", 2) else {
            panic!("noop protect failed");
        };
        assert_eq!(sealed, b"<doc/>".to_vec());
        assert!(matches!(protector.unprotect(&sealed, 1), Ok(p) if p == b"<doc/>".to_vec()));
    }

    #[test]
    fn noop_directory_knows_nobody() {
        assert!(NoopDirectoryLookup.reply_queue(1).is_none());
    }
}
