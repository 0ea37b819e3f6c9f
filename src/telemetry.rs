//! Named log events emitted along the message pipeline.
//!
//! Every event carries an `event` field so log pipelines can filter on it
//! regardless of the message text.

use std::time::Duration;

use crate::domain::{BrokerMessage, IncomingMessage, QueueType};

/// Error code logged with synchronous timeouts.
pub const SYNCHRONOUS_TIMEOUT_CODE: &str = "MUG-000030";

/// Whole milliseconds in `duration`, saturating at `u64::MAX`.
#[must_use]
pub fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

/// Start of processing for a received message.
pub fn log_start_receive(queue_type: QueueType, message: &IncomingMessage) {
    tracing::info!(
        event = "receive",
        %queue_type,
        message_function = %message.message_function,
        from_her_id = message.from_her_id,
        to_her_id = message.to_her_id,
        message_id = %message.message_id,
        "start receive"
    );
}

/// End of processing for a received message.
pub fn log_end_receive(queue_type: QueueType, message: &IncomingMessage) {
    tracing::info!(
        event = "receive",
        %queue_type,
        message_function = %message.message_function,
        from_her_id = message.from_her_id,
        to_her_id = message.to_her_id,
        message_id = %message.message_id,
        "end receive"
    );
}

/// A reply is about to be sent.
pub fn log_start_send(queue_type: QueueType, queue: &str, reply: &BrokerMessage) {
    tracing::info!(
        event = "send",
        %queue_type,
        queue,
        message_id = %reply.message_id,
        correlation_id = reply.correlation_id.as_deref().unwrap_or_default(),
        "start send"
    );
}

/// A reply has been sent.
pub fn log_end_send(queue_type: QueueType, queue: &str, message_id: &str) {
    tracing::info!(
        event = "send",
        %queue_type,
        queue,
        message_id,
        "end send"
    );
}

/// A notification hook is about to run.
pub fn log_before_notification_handler(handler: &str, message: &IncomingMessage) {
    tracing::info!(
        event = "notification_handler",
        handler,
        message_function = %message.message_function,
        from_her_id = message.from_her_id,
        to_her_id = message.to_her_id,
        message_id = %message.message_id,
        "begin {handler}"
    );
}

/// A notification hook has returned.
pub fn log_after_notification_handler(handler: &str, message: &IncomingMessage) {
    tracing::info!(
        event = "notification_handler",
        handler,
        message_function = %message.message_function,
        from_her_id = message.from_her_id,
        to_her_id = message.to_her_id,
        message_id = %message.message_id,
        "after {handler}"
    );
}

/// Time the synchronous handler took to produce a reply.
pub fn log_response_time(message: &IncomingMessage, elapsed: Duration) {
    tracing::info!(
        event = "response_time",
        message_function = %message.message_function,
        from_her_id = message.from_her_id,
        to_her_id = message.to_her_id,
        message_id = %message.message_id,
        response_time_ms = millis(elapsed),
        "response time"
    );
}

/// A message was processed and is being removed.
pub fn log_remove_message_normal(message_id: &str) {
    tracing::info!(
        event = "remove_message",
        message_id,
        "removing processed message from queue"
    );
}

/// A message is being removed after its failure was reported.
pub fn log_remove_message_error(message_id: &str) {
    tracing::info!(
        event = "remove_message",
        message_id,
        "removing message from queue after reporting error"
    );
}

/// The synchronous handler missed its deadline.
pub fn log_synchronous_timeout(queue_type: QueueType, message_id: &str, to_her_id: i32) {
    tracing::error!(
        event = "synchronous_call_timeout",
        code = SYNCHRONOUS_TIMEOUT_CODE,
        %queue_type,
        message_id,
        to_her_id,
        "{SYNCHRONOUS_TIMEOUT_CODE} synchronous call {message_id} timed out against HerId {to_her_id}"
    );
}
