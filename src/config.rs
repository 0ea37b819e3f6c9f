//! Messaging server configuration loaded from environment variables.
//!
//! Follows 12-factor style: all settings come from environment variables
//! (or a `.env` file via `dotenvy`). Queue names default to the
//! organisation's HerId with a per-class suffix.

use std::time::Duration;

use crate::domain::QueueType;
use crate::error::MessagingError;

/// Settings for one queue class.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueClassConfig {
    /// Queue the listeners of this class read from.
    pub queue_name: String,

    /// Number of concurrent listener workers (0 disables the class).
    pub processing_tasks: usize,

    /// Maximum time a single receive call blocks.
    pub read_timeout: Duration,
}

/// Top-level messaging configuration.
///
/// Loaded once at startup via [`MessagingConfig::from_env`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessagingConfig {
    /// Organisation this process receives messages for.
    pub her_id: i32,

    /// Asynchronous queue class.
    pub asynchronous: QueueClassConfig,

    /// Synchronous (request/reply) queue class.
    pub synchronous: QueueClassConfig,

    /// Error (dead-letter) queue class.
    pub error: QueueClassConfig,

    /// Number of broker connections in the factory pool.
    pub max_factories: usize,

    /// Soft upper bound on cached receivers.
    pub max_receivers: usize,

    /// Soft upper bound on cached senders.
    pub max_senders: usize,

    /// Flow-control credit granted to every receiver.
    pub link_credits: u32,

    /// Time the synchronous handler has to produce a reply.
    pub sync_reply_timeout: Duration,

    /// Pause after a listener loop failure before retrying.
    pub entity_retry_delay: Duration,

    /// Default bound for [`crate::server::MessagingServer::stop`].
    pub shutdown_timeout: Duration,
}

impl Default for MessagingConfig {
    fn default() -> Self {
        Self::for_her_id(0)
    }
}

impl MessagingConfig {
    /// Default configuration for the given organisation.
    #[must_use]
    pub fn for_her_id(her_id: i32) -> Self {
        let class = |queue_type: QueueType, processing_tasks| QueueClassConfig {
            queue_name: default_queue_name(her_id, queue_type),
            processing_tasks,
            read_timeout: Duration::from_millis(1000),
        };
        Self {
            her_id,
            asynchronous: class(QueueType::Asynchronous, 5),
            synchronous: class(QueueType::Synchronous, 2),
            error: class(QueueType::Error, 1),
            max_factories: 5,
            max_receivers: 5,
            max_senders: 200,
            link_credits: 25,
            sync_reply_timeout: Duration::from_millis(15_000),
            entity_retry_delay: Duration::from_millis(1000),
            shutdown_timeout: Duration::from_secs(10),
        }
    }

    /// Loads configuration from environment variables.
    ///
    /// Falls back to defaults when a variable is not set or cannot be
    /// parsed. Calls `dotenvy::dotenv().ok()` to optionally load a `.env`
    /// file.
    ///
    /// # Errors
    ///
    /// Returns [`MessagingError::Configuration`] if the resulting
    /// configuration fails [`Self::validate`].
    pub fn from_env() -> Result<Self, MessagingError> {
        dotenvy::dotenv().ok();

        let her_id = parse_env("MESSAGING_HER_ID", 0);
        let defaults = Self::for_her_id(her_id);

        let class = |prefix: &str, queue_type: QueueType, default: &QueueClassConfig| {
            QueueClassConfig {
                queue_name: std::env::var(format!("{prefix}_QUEUE"))
                    .unwrap_or_else(|_| default_queue_name(her_id, queue_type)),
                processing_tasks: parse_env(
                    &format!("{prefix}_PROCESSING_TASKS"),
                    default.processing_tasks,
                ),
                read_timeout: Duration::from_millis(parse_env(
                    &format!("{prefix}_READ_TIMEOUT_MS"),
                    1000,
                )),
            }
        };

        let config = Self {
            her_id,
            asynchronous: class("ASYNC", QueueType::Asynchronous, &defaults.asynchronous),
            synchronous: class("SYNC", QueueType::Synchronous, &defaults.synchronous),
            error: class("ERROR", QueueType::Error, &defaults.error),
            max_factories: parse_env("MAX_FACTORIES", defaults.max_factories),
            max_receivers: parse_env("MAX_RECEIVERS", defaults.max_receivers),
            max_senders: parse_env("MAX_SENDERS", defaults.max_senders),
            link_credits: parse_env("LINK_CREDITS", defaults.link_credits),
            sync_reply_timeout: Duration::from_millis(parse_env("SYNC_REPLY_TIMEOUT_MS", 15_000)),
            entity_retry_delay: Duration::from_millis(parse_env("ENTITY_RETRY_DELAY_MS", 1000)),
            shutdown_timeout: Duration::from_secs(parse_env("SHUTDOWN_TIMEOUT_SECS", 10)),
        };
        config.validate()?;
        Ok(config)
    }

    /// Settings for one queue class.
    #[must_use]
    pub const fn queue_class(&self, queue_type: QueueType) -> &QueueClassConfig {
        match queue_type {
            QueueType::Asynchronous => &self.asynchronous,
            QueueType::Synchronous => &self.synchronous,
            QueueType::Error => &self.error,
        }
    }

    /// Total number of listener workers across all classes.
    #[must_use]
    pub fn total_workers(&self) -> usize {
        QueueType::ALL
            .iter()
            .map(|q| self.queue_class(*q).processing_tasks)
            .sum()
    }

    /// Checks pool sizes, timeouts and queue names.
    ///
    /// # Errors
    ///
    /// Returns [`MessagingError::Configuration`] naming the first offending
    /// setting.
    pub fn validate(&self) -> Result<(), MessagingError> {
        let invalid = |what: &str| -> Result<(), MessagingError> {
            Err(MessagingError::Configuration(what.to_string()))
        };

        if self.max_factories == 0 {
            return invalid("MAX_FACTORIES must be at least 1");
        }
        if self.max_receivers == 0 {
            return invalid("MAX_RECEIVERS must be at least 1");
        }
        if self.max_senders == 0 {
            return invalid("MAX_SENDERS must be at least 1");
        }
        if self.link_credits == 0 {
            return invalid("LINK_CREDITS must be at least 1");
        }
        if self.sync_reply_timeout.is_zero() {
            return invalid("SYNC_REPLY_TIMEOUT_MS must be positive");
        }
        if self.entity_retry_delay.is_zero() {
            return invalid("ENTITY_RETRY_DELAY_MS must be positive");
        }
        for queue_type in QueueType::ALL {
            let class = self.queue_class(queue_type);
            if class.processing_tasks == 0 {
                continue;
            }
            if class.queue_name.trim().is_empty() {
                return Err(MessagingError::Configuration(format!(
                    "{queue_type} queue name is empty"
                )));
            }
            if class.read_timeout.is_zero() {
                return Err(MessagingError::Configuration(format!(
                    "{queue_type} read timeout must be positive"
                )));
            }
        }
        Ok(())
    }
}

fn default_queue_name(her_id: i32, queue_type: QueueType) -> String {
    format!("{her_id}_{}", queue_type.queue_suffix())
}

/// Parses an environment variable as `T`, returning `default` on missing
/// or invalid values.
fn parse_env<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_derive_queue_names_from_her_id() {
        let config = MessagingConfig::for_her_id(93_252);
        assert_eq!(config.asynchronous.queue_name, "93252_async");
        assert_eq!(config.synchronous.queue_name, "93252_sync");
        assert_eq!(config.error.queue_name, "93252_error");
        assert_eq!(config.total_workers(), 8);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn zero_pool_size_is_rejected() {
        let config = MessagingConfig {
            max_receivers: 0,
            ..MessagingConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(MessagingError::Configuration(_))
        ));
    }

    #[test]
    fn zero_retry_delay_is_rejected() {
        let config = MessagingConfig {
            entity_retry_delay: Duration::ZERO,
            ..MessagingConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(MessagingError::Configuration(what)) if what.contains("ENTITY_RETRY_DELAY_MS")
        ));
    }

    #[test]
    fn empty_queue_name_only_matters_with_workers() {
        let mut config = MessagingConfig::default();
        config.error.queue_name = String::new();
        assert!(config.validate().is_err());

        config.error.processing_tasks = 0;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn queue_class_selects_by_type() {
        let config = MessagingConfig::default();
        assert_eq!(config.queue_class(QueueType::Synchronous).processing_tasks, 2);
        assert_eq!(config.queue_class(QueueType::Error).processing_tasks, 1);
    }

    #[test]
    fn parse_env_falls_back_when_unset() {
        assert_eq!(parse_env("MESSAGING_TEST_UNSET_KEY_FOR_PARSE", 7_u32), 7);
    }
}
