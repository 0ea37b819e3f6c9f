//! Broker message envelope and the validated view handed to hooks.
//!
//! [`BrokerMessage`] is what a receiver hands out: system properties
//! (id, correlation, reply-to, lock token) plus string application headers
//! and an opaque body. [`IncomingMessage`] is the validated business view
//! built from it before any business hook runs.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::error::MessagingError;

/// Application header names carried on every business message.
pub mod headers {
    /// Business operation name.
    pub const MESSAGE_FUNCTION: &str = "messageFunction";
    /// Sending organisation.
    pub const FROM_HER_ID: &str = "fromHerId";
    /// Receiving organisation.
    pub const TO_HER_ID: &str = "toHerId";
}

/// Raw message as delivered by a broker receiver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerMessage {
    /// Broker message id.
    pub message_id: String,
    /// Id of the message this one answers, if any.
    pub correlation_id: Option<String>,
    /// Queue a synchronous reply should be sent to.
    pub reply_to: Option<String>,
    /// Application headers.
    pub properties: BTreeMap<String, String>,
    /// Opaque payload.
    pub body: Vec<u8>,
    /// Time the broker accepted the message.
    pub enqueued_at: DateTime<Utc>,
    /// Number of times the message has been handed to a receiver.
    pub delivery_count: u32,
    /// Lock held by the receiver that dequeued the message.
    pub lock_token: Option<Uuid>,
}

impl BrokerMessage {
    /// Creates a message with the given id and body and no headers.
    #[must_use]
    pub fn new(message_id: impl Into<String>, body: impl Into<Vec<u8>>) -> Self {
        Self {
            message_id: message_id.into(),
            correlation_id: None,
            reply_to: None,
            properties: BTreeMap::new(),
            body: body.into(),
            enqueued_at: Utc::now(),
            delivery_count: 0,
            lock_token: None,
        }
    }

    /// Sets an application header.
    #[must_use]
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.properties.insert(name.into(), value.into());
        self
    }

    /// Sets the business routing headers.
    #[must_use]
    pub fn with_routing(self, message_function: &str, from_her_id: i32, to_her_id: i32) -> Self {
        self.with_header(headers::MESSAGE_FUNCTION, message_function)
            .with_header(headers::FROM_HER_ID, from_her_id.to_string())
            .with_header(headers::TO_HER_ID, to_her_id.to_string())
    }

    /// Sets the correlation id.
    #[must_use]
    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    /// Sets the reply queue.
    #[must_use]
    pub fn with_reply_to(mut self, queue: impl Into<String>) -> Self {
        self.reply_to = Some(queue.into());
        self
    }

    /// Returns the value of an application header.
    #[must_use]
    pub fn header(&self, name: &str) -> Option<&str> {
        self.properties.get(name).map(String::as_str)
    }

    fn required_header(&self, name: &'static str) -> Result<&str, MessagingError> {
        self.header(name)
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .ok_or_else(|| self.invalid_header(name))
    }

    fn her_id_header(&self, name: &'static str) -> Result<i32, MessagingError> {
        self.required_header(name)?
            .parse::<i32>()
            .ok()
            .filter(|id| *id > 0)
            .ok_or_else(|| self.invalid_header(name))
    }

    fn invalid_header(&self, header: &'static str) -> MessagingError {
        MessagingError::InvalidHeader {
            header,
            message_id: self.message_id.clone(),
        }
    }
}

/// Validated business message handed to notification hooks.
///
/// Owned by the listener that dequeued it until its notification cycle
/// completes; hooks only ever see a shared reference or a private clone.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IncomingMessage {
    /// Broker message id.
    pub message_id: String,
    /// Correlation id (synchronous reply matching).
    pub correlation_id: Option<String>,
    /// Business operation name.
    pub message_function: String,
    /// Sending organisation.
    pub from_her_id: i32,
    /// Receiving organisation.
    pub to_her_id: i32,
    /// Time the broker accepted the message.
    pub enqueued_at: DateTime<Utc>,
    /// Delivery attempt counter.
    pub delivery_count: u32,
    /// Opaque payload.
    #[serde(skip)]
    pub payload: Vec<u8>,
}

impl TryFrom<&BrokerMessage> for IncomingMessage {
    type Error = MessagingError;

    fn try_from(message: &BrokerMessage) -> Result<Self, Self::Error> {
        Ok(Self {
            message_id: message.message_id.clone(),
            correlation_id: message.correlation_id.clone(),
            message_function: message.required_header(headers::MESSAGE_FUNCTION)?.to_string(),
            from_her_id: message.her_id_header(headers::FROM_HER_ID)?,
            to_her_id: message.her_id_header(headers::TO_HER_ID)?,
            enqueued_at: message.enqueued_at,
            delivery_count: message.delivery_count,
            payload: message.body.clone(),
        })
    }
}

impl IncomingMessage {
    /// Builds the reply to this synchronous request.
    ///
    /// The reply swaps sender and receiver, keeps the message function and
    /// correlates on the request's message id.
    #[must_use]
    pub fn reply(&self, payload: Vec<u8>) -> BrokerMessage {
        BrokerMessage::new(Uuid::new_v4().to_string(), payload)
            .with_routing(&self.message_function, self.to_her_id, self.from_her_id)
            .with_correlation_id(self.message_id.clone())
    }
}

#[cfg(test)]
#[allow(clippy::panic)]
mod tests {
    use super::*;

    fn routed() -> BrokerMessage {
        BrokerMessage::new("m-1", b"<doc/>".to_vec()).with_routing("DIALOG_INNBYGGER", 11, 22)
    }

    #[test]
    fn incoming_from_valid_headers() {
        let Ok(incoming) = IncomingMessage::try_from(&routed()) else {
            panic!("valid message rejected");
        };
        assert_eq!(incoming.message_function, "DIALOG_INNBYGGER");
        assert_eq!(incoming.from_her_id, 11);
        assert_eq!(incoming.to_her_id, 22);
        assert_eq!(incoming.payload, b"<doc/>".to_vec());
    }

    #[test]
    fn missing_function_is_rejected() {
        let raw = BrokerMessage::new("m-2", Vec::new())
            .with_header(headers::FROM_HER_ID, "1")
            .with_header(headers::TO_HER_ID, "2");
        let Err(MessagingError::InvalidHeader { header, message_id }) =
            IncomingMessage::try_from(&raw)
        else {
            panic!("expected invalid header");
        };
        assert_eq!(header, headers::MESSAGE_FUNCTION);
        assert_eq!(message_id, "m-2");
    }

    #[test]
    fn non_numeric_her_id_is_rejected() {
        let raw = routed().with_header(headers::TO_HER_ID, "abc");
        let Err(MessagingError::InvalidHeader { header, .. }) = IncomingMessage::try_from(&raw)
        else {
            panic!("expected invalid header");
        };
        assert_eq!(header, headers::TO_HER_ID);
    }

    #[test]
    fn zero_her_id_is_rejected() {
        let raw = routed().with_header(headers::FROM_HER_ID, "0");
        assert!(IncomingMessage::try_from(&raw).is_err());
    }

    #[test]
    fn reply_swaps_routing_and_correlates() {
        let Ok(incoming) = IncomingMessage::try_from(&routed()) else {
            panic!("valid message rejected");
        };
        let reply = incoming.reply(b"<answer/>".to_vec());
        assert_eq!(reply.correlation_id.as_deref(), Some("m-1"));
        assert_eq!(reply.header(headers::FROM_HER_ID), Some("22"));
        assert_eq!(reply.header(headers::TO_HER_ID), Some("11"));
        assert_eq!(reply.header(headers::MESSAGE_FUNCTION), Some("DIALOG_INNBYGGER"));
        assert_ne!(reply.message_id, "m-1");
    }
}
