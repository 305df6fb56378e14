use thiserror::Error;

use crate::config::ConfigError;
use crate::models::FailureClass;
use crate::services::smir_client::SmirError;

pub type Result<T> = std::result::Result<T, ConsumerError>;

/// Errors surfaced by the consumption layer itself: broker failures,
/// dead-letter sink failures and configuration problems. A sink failure is
/// fatal to the current delivery unit; the commit strategy decides whether
/// that means redelivery or rollback.
#[derive(Debug, Error)]
pub enum ConsumerError {
    #[error("Kafka error: {0}")]
    Kafka(#[from] rdkafka::error::KafkaError),

    #[error("dead-letter produce failed: {0}")]
    DeadLetterProduce(rdkafka::error::KafkaError),

    #[error("error store write failed: {0}")]
    ErrorStore(#[from] sqlx::Error),

    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("consumer group metadata unavailable")]
    MissingGroupMetadata,
}

/// A failure raised while processing one inbound payload.
///
/// Decode failures and handler failures are generic; SMIR failures carry
/// their own type so the rate-limited case can be classified from anywhere
/// in the source chain.
#[derive(Debug, Error)]
pub enum ProcessingError {
    #[error("failed to decode notification event: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("SMIR client error: {0}")]
    Smir(#[from] SmirError),

    #[error("notification handling failed: {0}")]
    Handler(String),
}

impl ProcessingError {
    /// Classify this failure by walking the source chain down to its root,
    /// looking for the SMIR rate-limited error. Everything else is generic.
    pub fn failure_class(&self) -> FailureClass {
        let mut cause: Option<&(dyn std::error::Error + 'static)> = Some(self);
        while let Some(err) = cause {
            if let Some(SmirError::TooManyRequests) = err.downcast_ref::<SmirError>() {
                return FailureClass::DependencyRateLimited;
            }
            cause = err.source();
        }
        FailureClass::Generic
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_smir_rate_limited_classified_as_dependency() {
        let err = ProcessingError::Smir(SmirError::TooManyRequests);
        assert_eq!(err.failure_class(), FailureClass::DependencyRateLimited);
    }

    #[test]
    fn test_other_smir_errors_are_generic() {
        let err = ProcessingError::Smir(SmirError::UnexpectedStatus(500));
        assert_eq!(err.failure_class(), FailureClass::Generic);
    }

    #[test]
    fn test_decode_error_is_generic() {
        let json_err = serde_json::from_str::<serde_json::Value>("not json").unwrap_err();
        let err = ProcessingError::Decode(json_err);
        assert_eq!(err.failure_class(), FailureClass::Generic);
    }

    #[test]
    fn test_handler_error_is_generic() {
        let err = ProcessingError::Handler("boom".to_string());
        assert_eq!(err.failure_class(), FailureClass::Generic);
    }
}
