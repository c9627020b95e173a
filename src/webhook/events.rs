//! Webhook Event Records
//!
//! The audit record kept for every inbound delivery, and its status machine.
//!
//! ```text
//!              ┌──▶ invalid_signature
//! received ────┼──▶ failed
//!              └──▶ processed
//! ```
//!
//! A record is created in `received` and moves exactly once to one of the
//! terminal statuses. Terminal records are frozen.

use std::net::IpAddr;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::store::StoreError;

/// Processing status of a webhook event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventStatus {
    /// Persisted, not yet decided
    Received,
    /// Fulfillment ran, or the order was recognized as already fulfilled
    Processed,
    /// Payload, validation or fulfillment error
    Failed,
    /// HMAC check failed
    #[serde(alias = "invalid_sig")]
    InvalidSignature,
}

/// Unrecognized status string
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Unknown event status: {0}")]
pub struct UnknownStatus(pub String);

impl FromStr for EventStatus {
    type Err = UnknownStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "received" => Ok(Self::Received),
            "processed" => Ok(Self::Processed),
            "failed" => Ok(Self::Failed),
            "invalid_signature" | "invalid_sig" => Ok(Self::InvalidSignature),
            other => Err(UnknownStatus(other.to_string())),
        }
    }
}

impl EventStatus {
    /// All statuses, in lifecycle order
    pub const ALL: [EventStatus; 4] = [
        Self::Received,
        Self::Processed,
        Self::Failed,
        Self::InvalidSignature,
    ];

    /// Get the string representation
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Received => "received",
            Self::Processed => "processed",
            Self::Failed => "failed",
            Self::InvalidSignature => "invalid_signature",
        }
    }

    /// Human-readable label for operator views
    pub fn label(&self) -> &'static str {
        match self {
            Self::Received => "Received",
            Self::Processed => "Processed",
            Self::Failed => "Failed",
            Self::InvalidSignature => "Invalid Signature",
        }
    }

    /// Terminal statuses never change again
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Received)
    }
}

impl std::fmt::Display for EventStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Audit record for one inbound delivery
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WebhookEvent {
    /// Unique id, assigned at receipt
    pub id: Uuid,

    /// Order identifier, once extracted
    pub order_id: Option<String>,

    /// Normalized customer email, once extracted
    pub customer_email: Option<String>,

    /// The body as received: a JSON document, or a string when the body did
    /// not decode as JSON
    pub payload: serde_json::Value,

    /// Whether the HMAC signature matched
    pub signature_valid: bool,

    /// Processing status
    pub status: EventStatus,

    /// What went wrong, for `failed` and `invalid_signature`
    pub error_detail: Option<String>,

    /// Address of the sender
    pub source_ip: Option<IpAddr>,

    /// Whether this delivery created a new account
    pub user_created: bool,

    /// Access grants newly created by this delivery
    pub books_granted: u32,

    /// For a replay of an already fulfilled order: the event that fulfilled it
    pub duplicate_of: Option<Uuid>,

    /// When the request arrived
    pub received_at: DateTime<Utc>,

    /// When the terminal status was recorded
    pub processed_at: Option<DateTime<Utc>>,
}

impl WebhookEvent {
    /// New record in `received`
    pub fn received(
        payload: serde_json::Value,
        signature_valid: bool,
        source_ip: Option<IpAddr>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            order_id: None,
            customer_email: None,
            payload,
            signature_valid,
            status: EventStatus::Received,
            error_detail: None,
            source_ip,
            user_created: false,
            books_granted: 0,
            duplicate_of: None,
            received_at: Utc::now(),
            processed_at: None,
        }
    }

    /// Whether the record is frozen
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Apply a terminal transition.
    ///
    /// Rejects the write if the record is already terminal, leaving it intact.
    pub fn apply(&mut self, completion: EventCompletion) -> Result<(), StoreError> {
        if self.is_terminal() {
            return Err(StoreError::AlreadyTerminal {
                id: self.id,
                status: self.status,
            });
        }
        if !completion.status.is_terminal() {
            return Err(StoreError::Backend(format!(
                "completion for event {} carries non-terminal status {}",
                self.id, completion.status
            )));
        }

        self.status = completion.status;
        if completion.order_id.is_some() {
            self.order_id = completion.order_id;
        }
        if completion.customer_email.is_some() {
            self.customer_email = completion.customer_email;
        }
        self.error_detail = completion.error_detail;
        self.user_created = completion.user_created;
        self.books_granted = completion.books_granted;
        self.duplicate_of = completion.duplicate_of;
        self.processed_at = Some(completion.processed_at);
        Ok(())
    }
}

/// Decode a raw body into the document stored on the record.
///
/// Bodies that are not JSON are kept as a (lossy) string so nothing received
/// is thrown away.
pub fn payload_document(raw: &[u8]) -> serde_json::Value {
    serde_json::from_slice(raw)
        .unwrap_or_else(|_| serde_json::Value::String(String::from_utf8_lossy(raw).into_owned()))
}

/// Terminal write for a webhook event
#[derive(Debug, Clone, PartialEq)]
pub struct EventCompletion {
    /// Terminal status to move to
    pub status: EventStatus,
    /// Order identifier; a known one is kept when this is `None`
    pub order_id: Option<String>,
    /// Normalized email; a known one is kept when this is `None`
    pub customer_email: Option<String>,
    /// Failure detail
    pub error_detail: Option<String>,
    /// Whether fulfillment created the account
    pub user_created: bool,
    /// Grants fulfillment created
    pub books_granted: u32,
    /// Original event, for a replay
    pub duplicate_of: Option<Uuid>,
    /// Time of the terminal write
    pub processed_at: DateTime<Utc>,
}

impl EventCompletion {
    fn terminal(status: EventStatus) -> Self {
        Self {
            status,
            order_id: None,
            customer_email: None,
            error_detail: None,
            user_created: false,
            books_granted: 0,
            duplicate_of: None,
            processed_at: Utc::now(),
        }
    }

    /// Signature check failed
    pub fn invalid_signature(detail: impl Into<String>) -> Self {
        Self {
            error_detail: Some(detail.into()),
            ..Self::terminal(EventStatus::InvalidSignature)
        }
    }

    /// Validation or fulfillment error
    pub fn failed(detail: impl Into<String>) -> Self {
        Self {
            error_detail: Some(detail.into()),
            ..Self::terminal(EventStatus::Failed)
        }
    }

    /// Fulfillment completed with the given incremental effect
    pub fn processed(user_created: bool, books_granted: u32) -> Self {
        Self {
            user_created,
            books_granted,
            ..Self::terminal(EventStatus::Processed)
        }
    }

    /// Replay of an order fulfilled by `original`
    pub fn duplicate(original: Uuid) -> Self {
        Self {
            duplicate_of: Some(original),
            ..Self::terminal(EventStatus::Processed)
        }
    }

    /// Attach the order identity known at this point
    pub fn with_order(mut self, order_id: Option<String>, customer_email: Option<String>) -> Self {
        self.order_id = order_id;
        self.customer_email = customer_email;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_parsing() {
        assert_eq!(
            EventStatus::from_str("processed").unwrap(),
            EventStatus::Processed
        );
        assert_eq!(
            EventStatus::from_str("invalid_sig").unwrap(),
            EventStatus::InvalidSignature
        );
        assert!(EventStatus::from_str("processing").is_err());
    }

    #[test]
    fn test_status_terminality() {
        assert!(!EventStatus::Received.is_terminal());
        assert!(EventStatus::Processed.is_terminal());
        assert!(EventStatus::Failed.is_terminal());
        assert!(EventStatus::InvalidSignature.is_terminal());
    }

    #[test]
    fn test_status_serde_names() {
        let json = serde_json::to_string(&EventStatus::InvalidSignature).unwrap();
        assert_eq!(json, "\"invalid_signature\"");
        let parsed: EventStatus = serde_json::from_str("\"invalid_sig\"").unwrap();
        assert_eq!(parsed, EventStatus::InvalidSignature);
    }

    #[test]
    fn test_terminal_event_is_frozen() {
        let mut event = WebhookEvent::received(serde_json::json!({}), true, None);
        event
            .apply(
                EventCompletion::processed(true, 1)
                    .with_order(Some("ORD-1".into()), Some("a@x.com".into())),
            )
            .unwrap();

        let before = event.clone();
        let err = event
            .apply(EventCompletion::failed("late failure"))
            .unwrap_err();

        assert!(matches!(err, StoreError::AlreadyTerminal { .. }));
        assert_eq!(event, before);
    }

    #[test]
    fn test_apply_keeps_known_order_id() {
        let mut event = WebhookEvent::received(serde_json::json!({}), false, None);
        event.order_id = Some("ORD-9".into());
        event
            .apply(EventCompletion::invalid_signature("bad"))
            .unwrap();
        assert_eq!(event.order_id.as_deref(), Some("ORD-9"));
        assert!(event.processed_at.is_some());
        assert_eq!(event.books_granted, 0);
        assert!(!event.user_created);
    }

    #[test]
    fn test_payload_document_fallback() {
        assert_eq!(
            payload_document(br#"{"a":1}"#),
            serde_json::json!({"a": 1})
        );
        assert_eq!(
            payload_document(b"not json"),
            serde_json::Value::String("not json".into())
        );
    }
}
