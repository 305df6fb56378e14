//! Dead-letter routing for terminally failed messages.
//!
//! The router classifies nothing itself; it takes the failure class decided
//! upstream and sinks the record either to a dead-letter topic (preserving
//! key, partition and forwardable headers) or to the persistent error
//! store. Routing is a single attempt per invocation: a sink failure
//! propagates so the enclosing commit strategy can decide between
//! redelivery and rollback.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rdkafka::message::{Header, OwnedHeaders};
use rdkafka::producer::{FutureProducer, FutureRecord};

use crate::error::ConsumerError;
use crate::models::{FailureClass, HeaderValue, InboundMessage};
use crate::services::error_store::ErrorStore;

#[async_trait]
pub trait DeadLetterSink: Send + Sync {
    async fn send(
        &self,
        msg: &InboundMessage,
        exception: &str,
        class: FailureClass,
    ) -> Result<(), ConsumerError>;
}

pub struct DeadLetterRouter {
    sink: Arc<dyn DeadLetterSink>,
}

impl DeadLetterRouter {
    pub fn new(sink: Arc<dyn DeadLetterSink>) -> Self {
        DeadLetterRouter { sink }
    }

    /// Route one failed message to its class destination. Never retries
    /// internally.
    pub async fn route(
        &self,
        msg: &InboundMessage,
        exception: &str,
        class: FailureClass,
    ) -> Result<(), ConsumerError> {
        match class {
            FailureClass::Generic => {
                tracing::error!(
                    partition = msg.partition,
                    offset = msg.offset,
                    "Generic error in processing message, routing to dead letter: {}",
                    exception
                );
            }
            FailureClass::DependencyRateLimited => {
                tracing::error!(
                    partition = msg.partition,
                    offset = msg.offset,
                    "SMIR error in processing message, routing to dead letter: {}",
                    exception
                );
            }
        }
        self.sink.send(msg, exception, class).await
    }
}

/// Produces failed records onto the generic or SMIR dead-letter topic,
/// preserving the original key and partition and copying textual/binary
/// headers verbatim.
pub struct TopicSink {
    producer: Arc<FutureProducer>,
    generic_topic: String,
    smir_topic: String,
    send_timeout: Duration,
}

impl TopicSink {
    pub fn new(producer: Arc<FutureProducer>, generic_topic: String, smir_topic: String) -> Self {
        TopicSink {
            producer,
            generic_topic,
            smir_topic,
            send_timeout: Duration::from_secs(5),
        }
    }

    fn forwardable_headers(msg: &InboundMessage) -> OwnedHeaders {
        let mut headers = OwnedHeaders::new();
        for (key, value) in &msg.headers {
            match value {
                HeaderValue::Text(text) => {
                    headers = headers.insert(Header {
                        key,
                        value: Some(text.as_bytes()),
                    });
                }
                HeaderValue::Bytes(bytes) => {
                    headers = headers.insert(Header {
                        key,
                        value: Some(bytes.as_slice()),
                    });
                }
                HeaderValue::Opaque(_) => {
                    tracing::debug!(header = %key, "Dropping non-forwardable header");
                }
            }
        }
        headers
    }
}

#[async_trait]
impl DeadLetterSink for TopicSink {
    async fn send(
        &self,
        msg: &InboundMessage,
        _exception: &str,
        class: FailureClass,
    ) -> Result<(), ConsumerError> {
        let topic = match class {
            FailureClass::Generic => &self.generic_topic,
            FailureClass::DependencyRateLimited => &self.smir_topic,
        };

        let mut record: FutureRecord<'_, String, String> = FutureRecord::to(topic)
            .partition(msg.partition)
            .payload(&msg.payload)
            .headers(Self::forwardable_headers(msg));
        if let Some(key) = msg.key.as_ref() {
            record = record.key(key);
        }

        match self.producer.send(record, self.send_timeout).await {
            Ok((partition, offset)) => {
                tracing::warn!(
                    topic = %topic,
                    partition = partition,
                    offset = offset,
                    "Sent failed message to dead-letter topic"
                );
                Ok(())
            }
            Err((e, _)) => Err(ConsumerError::DeadLetterProduce(e)),
        }
    }
}

/// Persists failed records to the error store instead of a topic.
pub struct DatabaseSink {
    store: ErrorStore,
}

impl DatabaseSink {
    pub fn new(store: ErrorStore) -> Self {
        DatabaseSink { store }
    }
}

#[async_trait]
impl DeadLetterSink for DatabaseSink {
    async fn send(
        &self,
        msg: &InboundMessage,
        exception: &str,
        class: FailureClass,
    ) -> Result<(), ConsumerError> {
        let id = self.store.insert(&msg.payload, exception, class).await?;
        tracing::warn!(
            error_id = id,
            error_type = class.error_type(),
            "Persisted failed message to error store"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rdkafka::message::Headers;

    fn message_with_headers(headers: Vec<(String, HeaderValue)>) -> InboundMessage {
        InboundMessage {
            topic: "notifications".to_string(),
            partition: 2,
            offset: 41,
            key: Some("user-1".to_string()),
            payload: r#"{"event":"AJOUT_DOCUMENT"}"#.to_string(),
            headers,
        }
    }

    #[test]
    fn test_text_and_byte_headers_forwarded() {
        let msg = message_with_headers(vec![
            ("trace-id".to_string(), HeaderValue::Text("abc".to_string())),
            ("raw".to_string(), HeaderValue::Bytes(vec![1, 2, 3])),
        ]);
        let headers = TopicSink::forwardable_headers(&msg);
        assert_eq!(headers.count(), 2);
        assert_eq!(headers.get(0).key, "trace-id");
        assert_eq!(headers.get(0).value, Some(b"abc".as_slice()));
        assert_eq!(headers.get(1).value, Some([1u8, 2, 3].as_slice()));
    }

    #[test]
    fn test_opaque_headers_dropped() {
        let msg = message_with_headers(vec![
            ("trace-id".to_string(), HeaderValue::Text("abc".to_string())),
            (
                "kafka_acknowledgment".to_string(),
                HeaderValue::Opaque("<handle>".to_string()),
            ),
        ]);
        let headers = TopicSink::forwardable_headers(&msg);
        assert_eq!(headers.count(), 1);
        assert_eq!(headers.get(0).key, "trace-id");
    }
}
