//! Business processing for inbound notification payloads.
//!
//! The processor decodes the payload into a [`NotificationEvent`] and runs
//! the side-effecting action for its kind. It is the source of both failure
//! classes the coordinator cares about: decode/handler failures (generic)
//! and SMIR rate-limit failures (dependency class).

use async_trait::async_trait;

use crate::error::ProcessingError;
use crate::models::{EventKind, NotificationEvent};
use crate::services::smir_client::SmirClient;

/// Seam between the coordinator and the business side effects.
#[async_trait]
pub trait EventProcessor: Send + Sync {
    async fn process(&self, payload: &str) -> Result<(), ProcessingError>;
}

pub struct NotificationProcessor {
    smir: SmirClient,
}

impl NotificationProcessor {
    pub fn new(smir: SmirClient) -> Self {
        NotificationProcessor { smir }
    }

    async fn handle(&self, event: &NotificationEvent) -> Result<(), ProcessingError> {
        let kind = match event.event.as_deref().and_then(EventKind::parse) {
            Some(kind) => kind,
            None => {
                // Unknown or absent kinds fall through as a no-op; rejecting
                // them is downstream's call, not the decoder's.
                tracing::debug!(event = ?event.event, "No handler for event kind, skipping");
                return Ok(());
            }
        };

        match kind {
            EventKind::DocumentAdded => {
                tracing::info!("Document added ... OK");
            }
            EventKind::EnrollmentOpened => {
                tracing::info!("Enrollment opened ... calling SMIR API");
                self.smir.get_coordinates(self.user_id(event)?).await?;
                tracing::info!("Enrollment opened ... OK");
            }
            EventKind::EnrollmentIncited => {
                tracing::info!("Enrollment incitement ... calling SMIR API");
                self.smir.get_coordinates(self.user_id(event)?).await?;
                tracing::info!("Enrollment incitement ... OK");
            }
        }
        Ok(())
    }

    fn user_id<'a>(&self, event: &'a NotificationEvent) -> Result<&'a str, ProcessingError> {
        event
            .user_id
            .as_deref()
            .ok_or_else(|| ProcessingError::Handler("missing userId for SMIR call".to_string()))
    }
}

#[async_trait]
impl EventProcessor for NotificationProcessor {
    async fn process(&self, payload: &str) -> Result<(), ProcessingError> {
        let event: NotificationEvent = serde_json::from_str(payload)?;
        tracing::info!(message_number = ?event.message_number, "Processing notification event");
        self.handle(&event).await?;
        tracing::info!(message_number = ?event.message_number, "Finished notification event");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::FailureClass;

    fn processor() -> NotificationProcessor {
        NotificationProcessor::new(SmirClient::new("http://localhost:0".to_string()))
    }

    #[tokio::test]
    async fn test_document_added_succeeds_without_smir() {
        let payload = r#"{"event": "AJOUT_DOCUMENT", "userId": "user-1"}"#;
        assert!(processor().process(payload).await.is_ok());
    }

    #[tokio::test]
    async fn test_unknown_event_kind_is_a_noop() {
        let payload = r#"{"event": "SOMETHING_ELSE"}"#;
        assert!(processor().process(payload).await.is_ok());
    }

    #[tokio::test]
    async fn test_missing_event_field_is_a_noop() {
        let payload = r#"{"userId": "user-1"}"#;
        assert!(processor().process(payload).await.is_ok());
    }

    #[tokio::test]
    async fn test_malformed_payload_is_generic_decode_failure() {
        let err = processor().process("{{{").await.unwrap_err();
        assert!(matches!(err, ProcessingError::Decode(_)));
        assert_eq!(err.failure_class(), FailureClass::Generic);
    }

    #[tokio::test]
    async fn test_smir_event_without_user_id_is_generic() {
        let payload = r#"{"event": "OUVERTURE_ENS"}"#;
        let err = processor().process(payload).await.unwrap_err();
        assert!(matches!(err, ProcessingError::Handler(_)));
        assert_eq!(err.failure_class(), FailureClass::Generic);
    }
}
