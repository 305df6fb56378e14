use chrono::{DateTime, Utc};
use rdkafka::message::{BorrowedMessage, Headers, Message};
use serde::{Deserialize, Serialize};

/// A header value as received from the broker. Only textual and raw-byte
/// values are forwarded to dead-letter destinations; anything else is
/// carried for logging and dropped on forward.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HeaderValue {
    Text(String),
    Bytes(Vec<u8>),
    Opaque(String),
}

impl HeaderValue {
    fn from_raw(raw: Option<&[u8]>) -> Self {
        match raw {
            Some(bytes) => match std::str::from_utf8(bytes) {
                Ok(text) => HeaderValue::Text(text.to_string()),
                Err(_) => HeaderValue::Bytes(bytes.to_vec()),
            },
            None => HeaderValue::Opaque("<null>".to_string()),
        }
    }
}

/// One message as delivered by the broker, owned by the coordinator for the
/// duration of a processing attempt.
#[derive(Debug, Clone)]
pub struct InboundMessage {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub key: Option<String>,
    pub payload: String,
    pub headers: Vec<(String, HeaderValue)>,
}

impl InboundMessage {
    pub fn from_borrowed(msg: &BorrowedMessage<'_>) -> Self {
        let headers = msg
            .headers()
            .map(|hs| {
                hs.iter()
                    .map(|h| (h.key.to_string(), HeaderValue::from_raw(h.value)))
                    .collect()
            })
            .unwrap_or_default();

        InboundMessage {
            topic: msg.topic().to_string(),
            partition: msg.partition(),
            offset: msg.offset(),
            key: msg
                .key()
                .map(|k| String::from_utf8_lossy(k).into_owned()),
            payload: msg
                .payload()
                .map(|p| String::from_utf8_lossy(p).into_owned())
                .unwrap_or_default(),
            headers,
        }
    }
}

/// The decoded domain event carried by an inbound payload.
///
/// Every field is optional: a payload missing `event` still decodes, and is
/// rejected (or not) by downstream handling rather than by the decoder.
/// Unknown fields are ignored.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct NotificationEvent {
    pub event: Option<String>,
    pub user_id: Option<String>,
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
    pub message_number: Option<i64>,
}

/// The event kinds the business processor acts on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    DocumentAdded,
    EnrollmentOpened,
    EnrollmentIncited,
}

impl EventKind {
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "AJOUT_DOCUMENT" => Some(EventKind::DocumentAdded),
            "OUVERTURE_ENS" => Some(EventKind::EnrollmentOpened),
            "INCITATION_ENROLEMENT" => Some(EventKind::EnrollmentIncited),
            _ => None,
        }
    }
}

/// Failure classification driving dead-letter routing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    Generic,
    DependencyRateLimited,
}

impl FailureClass {
    /// The `error_type` label persisted with error-store records.
    pub fn error_type(&self) -> &'static str {
        match self {
            FailureClass::Generic => "Generic",
            FailureClass::DependencyRateLimited => "SMIR",
        }
    }
}

/// A terminally failed message as persisted to the error store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorRecord {
    pub id: i64,
    pub record: String,
    pub exception: String,
    pub error_type: String,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_decodes_with_all_fields() {
        let payload = r#"{
            "event": "OUVERTURE_ENS",
            "userId": "user-42",
            "ipAddress": "10.0.0.1",
            "userAgent": "curl/8.0",
            "messageNumber": 7
        }"#;
        let event: NotificationEvent = serde_json::from_str(payload).unwrap();
        assert_eq!(event.event.as_deref(), Some("OUVERTURE_ENS"));
        assert_eq!(event.user_id.as_deref(), Some("user-42"));
        assert_eq!(event.message_number, Some(7));
    }

    #[test]
    fn test_event_decodes_without_event_field() {
        let event: NotificationEvent = serde_json::from_str(r#"{"userId": "user-1"}"#).unwrap();
        assert_eq!(event.event, None);
        assert_eq!(event.user_id.as_deref(), Some("user-1"));
    }

    #[test]
    fn test_event_ignores_unknown_fields() {
        let payload = r#"{"event": "AJOUT_DOCUMENT", "extra": {"nested": true}}"#;
        let event: NotificationEvent = serde_json::from_str(payload).unwrap();
        assert_eq!(event.event.as_deref(), Some("AJOUT_DOCUMENT"));
    }

    #[test]
    fn test_malformed_payload_fails_decoding() {
        assert!(serde_json::from_str::<NotificationEvent>("not json at all").is_err());
    }

    #[test]
    fn test_event_kind_parsing() {
        assert_eq!(
            EventKind::parse("AJOUT_DOCUMENT"),
            Some(EventKind::DocumentAdded)
        );
        assert_eq!(
            EventKind::parse("OUVERTURE_ENS"),
            Some(EventKind::EnrollmentOpened)
        );
        assert_eq!(
            EventKind::parse("INCITATION_ENROLEMENT"),
            Some(EventKind::EnrollmentIncited)
        );
        assert_eq!(EventKind::parse("UNKNOWN"), None);
    }

    #[test]
    fn test_header_value_from_raw() {
        assert_eq!(
            HeaderValue::from_raw(Some(b"trace-1")),
            HeaderValue::Text("trace-1".to_string())
        );
        assert_eq!(
            HeaderValue::from_raw(Some(&[0xff, 0xfe])),
            HeaderValue::Bytes(vec![0xff, 0xfe])
        );
        assert!(matches!(HeaderValue::from_raw(None), HeaderValue::Opaque(_)));
    }

    #[test]
    fn test_failure_class_error_type() {
        assert_eq!(FailureClass::Generic.error_type(), "Generic");
        assert_eq!(FailureClass::DependencyRateLimited.error_type(), "SMIR");
    }
}
