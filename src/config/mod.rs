//! Runtime configuration for the notification consumer.
//!
//! The full combination of consumer mode, commit strategy, exception
//! strategies, retry policy and dead-letter routing is resolved once at
//! startup into an immutable [`RuntimeConfig`] snapshot. Invalid or
//! incomplete combinations fail fast before any consumer is created.

use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value '{value}' for {key}")]
    InvalidValue { key: &'static str, value: String },

    #[error("missing required setting {0}")]
    Missing(&'static str),

    #[error("failed to parse {key}: {value}")]
    Parse { key: &'static str, value: String },
}

/// Record-at-a-time vs. whole-poll-batch delivery units.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumerMode {
    Record,
    Batch,
}

impl ConsumerMode {
    fn parse(value: &str) -> Result<Self, ConfigError> {
        match value.to_ascii_lowercase().as_str() {
            "record" => Ok(ConsumerMode::Record),
            "batch" => Ok(ConsumerMode::Batch),
            _ => Err(ConfigError::InvalidValue {
                key: "NOTIFICATION_CONSUMER_MODE",
                value: value.to_string(),
            }),
        }
    }
}

/// Offset acknowledgment discipline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitStrategy {
    /// Broker-driven auto commit; the coordinator takes no explicit action.
    Auto,
    /// One explicit commit per delivery unit, after every element is terminal.
    Manual,
    /// Offset advance and dead-letter produces commit atomically per unit.
    Transactional,
}

impl CommitStrategy {
    fn parse(value: &str) -> Result<Self, ConfigError> {
        match value.to_ascii_lowercase().as_str() {
            "auto" => Ok(CommitStrategy::Auto),
            "manual" => Ok(CommitStrategy::Manual),
            "transaction" => Ok(CommitStrategy::Transactional),
            _ => Err(ConfigError::InvalidValue {
                key: "NOTIFICATION_COMMIT_STRATEGY",
                value: value.to_string(),
            }),
        }
    }
}

/// What the coordinator does with a failure after dead-letter routing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExceptionStrategy {
    /// Suppress the failure; the delivery unit proceeds to acknowledgment.
    Silent,
    /// Let the failure drive the retry/redelivery layer before routing.
    Throw,
}

impl ExceptionStrategy {
    fn parse(key: &'static str, value: &str) -> Result<Self, ConfigError> {
        match value.to_ascii_lowercase().as_str() {
            "silent" => Ok(ExceptionStrategy::Silent),
            "throw" => Ok(ExceptionStrategy::Throw),
            _ => Err(ConfigError::InvalidValue {
                key,
                value: value.to_string(),
            }),
        }
    }
}

/// Destination for terminally failed messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeadLetterSinkKind {
    Topic,
    Database,
}

impl DeadLetterSinkKind {
    fn parse(value: &str) -> Result<Self, ConfigError> {
        match value.to_ascii_lowercase().as_str() {
            "topic" => Ok(DeadLetterSinkKind::Topic),
            "database" => Ok(DeadLetterSinkKind::Database),
            _ => Err(ConfigError::InvalidValue {
                key: "NOTIFICATION_DLT_SINK",
                value: value.to_string(),
            }),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub brokers: String,
    pub group_id: String,
    pub topic: String,
    pub mode: ConsumerMode,
    pub commit_strategy: CommitStrategy,
    pub exception_strategy: ExceptionStrategy,
    pub exception_strategy_smir: ExceptionStrategy,
    /// Redelivery attempts before dead-letter for retryable failures.
    pub retries: u32,
    /// Fixed delay between redelivery attempts.
    pub retries_interval: Duration,
    /// Whether the SMIR rate-limited class participates in retry at all.
    pub retries_smir: bool,
    pub dead_letter_topic: String,
    pub dead_letter_topic_smir: String,
    pub dead_letter_sink: DeadLetterSinkKind,
    /// Upper bound on a batch-mode delivery unit.
    pub max_batch_size: usize,
    /// Upper bound on batch accumulation wait; also the broker liveness timeout.
    pub max_poll_interval: Duration,
    /// Batch mode: commit offsets synchronously instead of async.
    pub sync_commits: bool,
    /// Number of coordinator workers sharing the consumer group.
    pub workers: usize,
    pub database_url: Option<String>,
    pub smir_base_url: String,
    pub http_port: u16,
}

impl RuntimeConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let config = RuntimeConfig {
            brokers: env_or("KAFKA_BOOTSTRAP_SERVERS", "localhost:9092"),
            group_id: env_or("NOTIFICATION_GROUP_ID", "notification-consumer"),
            topic: env_or("NOTIFICATION_TOPIC", "notifications"),
            mode: ConsumerMode::parse(&env_or("NOTIFICATION_CONSUMER_MODE", "batch"))?,
            commit_strategy: CommitStrategy::parse(&env_or(
                "NOTIFICATION_COMMIT_STRATEGY",
                "auto",
            ))?,
            exception_strategy: ExceptionStrategy::parse(
                "NOTIFICATION_EXCEPTION_STRATEGY",
                &env_or("NOTIFICATION_EXCEPTION_STRATEGY", "throw"),
            )?,
            exception_strategy_smir: ExceptionStrategy::parse(
                "NOTIFICATION_EXCEPTION_STRATEGY_SMIR",
                &env_or("NOTIFICATION_EXCEPTION_STRATEGY_SMIR", "silent"),
            )?,
            retries: parse_env("NOTIFICATION_RETRIES", 1)?,
            retries_interval: Duration::from_millis(parse_env(
                "NOTIFICATION_RETRIES_INTERVAL_MS",
                300_000,
            )?),
            retries_smir: parse_env_bool("NOTIFICATION_RETRIES_SMIR", false)?,
            dead_letter_topic: env_or("NOTIFICATION_DLT", ""),
            dead_letter_topic_smir: env_or("NOTIFICATION_DLT_SMIR", ""),
            dead_letter_sink: DeadLetterSinkKind::parse(&env_or("NOTIFICATION_DLT_SINK", "topic"))?,
            max_batch_size: parse_env("NOTIFICATION_MAX_POLL_RECORDS", 50)?,
            max_poll_interval: Duration::from_millis(parse_env(
                "NOTIFICATION_MAX_POLL_INTERVAL_MS",
                300_000,
            )?),
            sync_commits: parse_env_bool("NOTIFICATION_SYNC_COMMITS", false)?,
            workers: parse_env("CONSUMER_WORKERS", 1)?,
            database_url: std::env::var("DATABASE_URL").ok(),
            smir_base_url: env_or("SMIR_BASE_URL", "http://localhost:8081"),
            http_port: parse_env("APP_PORT", 8000)?,
        };
        config.validate()?;
        Ok(config)
    }

    /// True unless the manual strategy is active; the transactional strategy
    /// groups with auto for activation purposes and is handled distinctly
    /// inside the coordinator.
    pub fn auto_acknowledge_active(&self) -> bool {
        !matches!(self.commit_strategy, CommitStrategy::Manual)
    }

    pub fn manual_acknowledge_active(&self) -> bool {
        matches!(self.commit_strategy, CommitStrategy::Manual)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        match self.dead_letter_sink {
            DeadLetterSinkKind::Topic => {
                if self.dead_letter_topic.is_empty() {
                    return Err(ConfigError::Missing("NOTIFICATION_DLT"));
                }
                if self.dead_letter_topic_smir.is_empty() {
                    return Err(ConfigError::Missing("NOTIFICATION_DLT_SMIR"));
                }
            }
            DeadLetterSinkKind::Database => {
                if self.database_url.is_none() {
                    return Err(ConfigError::Missing("DATABASE_URL"));
                }
            }
        }
        if self.workers == 0 {
            return Err(ConfigError::InvalidValue {
                key: "CONSUMER_WORKERS",
                value: "0".to_string(),
            });
        }
        Ok(())
    }
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn parse_env<T: std::str::FromStr>(key: &'static str, default: T) -> Result<T, ConfigError> {
    match std::env::var(key) {
        Ok(raw) => raw.parse().map_err(|_| ConfigError::Parse { key, value: raw }),
        Err(_) => Ok(default),
    }
}

fn parse_env_bool(key: &'static str, default: bool) -> Result<bool, ConfigError> {
    match std::env::var(key) {
        Ok(raw) => match raw.to_ascii_lowercase().as_str() {
            "true" | "1" => Ok(true),
            "false" | "0" => Ok(false),
            _ => Err(ConfigError::Parse { key, value: raw }),
        },
        Err(_) => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_config() -> RuntimeConfig {
        RuntimeConfig {
            brokers: "localhost:9092".to_string(),
            group_id: "notification-consumer".to_string(),
            topic: "notifications".to_string(),
            mode: ConsumerMode::Batch,
            commit_strategy: CommitStrategy::Auto,
            exception_strategy: ExceptionStrategy::Throw,
            exception_strategy_smir: ExceptionStrategy::Silent,
            retries: 1,
            retries_interval: Duration::from_millis(300_000),
            retries_smir: false,
            dead_letter_topic: "notifications-dlt".to_string(),
            dead_letter_topic_smir: "notifications-dlt-smir".to_string(),
            dead_letter_sink: DeadLetterSinkKind::Topic,
            max_batch_size: 50,
            max_poll_interval: Duration::from_millis(300_000),
            sync_commits: false,
            workers: 1,
            database_url: None,
            smir_base_url: "http://localhost:8081".to_string(),
            http_port: 8000,
        }
    }

    #[test]
    fn test_mode_parsing() {
        assert_eq!(ConsumerMode::parse("record").unwrap(), ConsumerMode::Record);
        assert_eq!(ConsumerMode::parse("BATCH").unwrap(), ConsumerMode::Batch);
        assert!(ConsumerMode::parse("stream").is_err());
    }

    #[test]
    fn test_commit_strategy_parsing() {
        assert_eq!(
            CommitStrategy::parse("transaction").unwrap(),
            CommitStrategy::Transactional
        );
        assert!(CommitStrategy::parse("exactly-once").is_err());
    }

    #[test]
    fn test_exactly_one_acknowledge_predicate_active() {
        for strategy in [
            CommitStrategy::Auto,
            CommitStrategy::Manual,
            CommitStrategy::Transactional,
        ] {
            let mut config = base_config();
            config.commit_strategy = strategy;
            assert_ne!(
                config.auto_acknowledge_active(),
                config.manual_acknowledge_active()
            );
        }
    }

    #[test]
    fn test_transactional_groups_with_auto() {
        let mut config = base_config();
        config.commit_strategy = CommitStrategy::Transactional;
        assert!(config.auto_acknowledge_active());
    }

    #[test]
    fn test_topic_sink_requires_both_topics() {
        let mut config = base_config();
        config.dead_letter_topic_smir = String::new();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Missing("NOTIFICATION_DLT_SMIR"))
        ));
    }

    #[test]
    fn test_database_sink_requires_url() {
        let mut config = base_config();
        config.dead_letter_sink = DeadLetterSinkKind::Database;
        config.database_url = None;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Missing("DATABASE_URL"))
        ));

        config.database_url = Some("postgres://localhost/notifications".to_string());
        assert!(config.validate().is_ok());
    }
}
