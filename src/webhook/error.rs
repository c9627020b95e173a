//! Webhook pipeline errors
//!
//! Verification, parsing and validation errors are recovered inside the
//! pipeline into a terminal audit status. Only [`WebhookError::is_retryable`]
//! errors reach the sender, as a "please retry" response.

use thiserror::Error;

use crate::store::StoreError;

/// Fixed error detail recorded for signature failures
pub const INVALID_SIGNATURE_DETAIL: &str = "HMAC signature verification failed";

/// Errors raised while ingesting a webhook
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WebhookError {
    /// Signature missing, malformed or not matching
    #[error("HMAC signature verification failed")]
    InvalidSignature,

    /// Body is not a decodable document
    #[error("Malformed payload: {0}")]
    MalformedPayload(String),

    /// Document decoded but required fields are missing or invalid
    #[error("Invalid order: {0}")]
    InvalidOrder(String),

    /// Body larger than the configured limit
    #[error("Payload exceeds {limit} bytes")]
    PayloadTooLarge {
        /// Configured limit
        limit: usize,
    },

    /// Product reference not in the catalog (warning only)
    #[error("Unknown product: {0}")]
    UnknownProduct(String),

    /// Infrastructure failure; the sender should redeliver
    #[error("Transient store failure: {0}")]
    TransientStore(#[from] StoreError),

    /// Another delivery of the same order is still running
    #[error("Order {order_id} is still being processed by another delivery")]
    ClaimContended {
        /// Contended order
        order_id: String,
    },
}

impl WebhookError {
    /// Whether the sender should redeliver
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::TransientStore(err) => err.is_transient(),
            Self::ClaimContended { .. } => true,
            _ => false,
        }
    }

    /// Stable tag for logs and counters
    pub fn kind(&self) -> &'static str {
        match self {
            Self::InvalidSignature => "invalid_signature",
            Self::MalformedPayload(_) => "malformed_payload",
            Self::InvalidOrder(_) => "invalid_order",
            Self::PayloadTooLarge { .. } => "payload_too_large",
            Self::UnknownProduct(_) => "unknown_product",
            Self::TransientStore(_) => "store_failure",
            Self::ClaimContended { .. } => "claim_contended",
        }
    }
}

/// Result type for webhook operations
pub type WebhookResult<T> = std::result::Result<T, WebhookError>;
