//! Purchase Webhook Ingestion
//!
//! Turns signed purchase notifications from an e-commerce platform into
//! accounts and content access, with a durable audit record per delivery:
//!
//! - **Signature Verification**: HMAC-SHA256 over the raw body, constant time
//! - **Validation**: typed [`Order`] extraction with Shopify-style aliases
//! - **Idempotency**: per-order claims; replays short-circuit to `processed`
//! - **Fulfillment**: find-or-create account, insert-if-absent access grants
//! - **Audit Log**: `received` → `processed` | `failed` | `invalid_signature`
//!
//! # Architecture
//!
//! ```text
//! Request -> Ingestion Endpoint -> Signature Verify -> Audit (received)
//!                                        |                  |
//!                                        v                  v
//!                               invalid_signature    Parse -> Gate -> Fulfill
//!                                                      |       |        |
//!                                                      v       v        v
//!                                                   failed  duplicate processed
//! ```
//!
//! The sender only ever sees "acknowledged" (200) or "please retry" (503).
//!
//! # Security
//!
//! - The signing secret is loaded from the environment and never logged
//! - The body is verified exactly as received, before any parsing
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use purchase_webhook::handlers::PipelineMetrics;
//! use purchase_webhook::store::InMemoryStore;
//! use purchase_webhook::webhook::{webhook_router, WebhookConfig, WebhookState};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = WebhookConfig::from_env()?;
//! let store = Arc::new(InMemoryStore::new());
//! let state = WebhookState::new(store, &config, Arc::new(PipelineMetrics::new()));
//! let app = webhook_router(state);
//! // ... serve with axum
//! # Ok(())
//! # }
//! ```

pub mod audit;
pub mod config;
pub mod error;
pub mod events;
pub mod fulfillment;
pub mod handler;
pub mod idempotency;
pub mod order;
pub mod pipeline;
pub mod signature;

pub use audit::AuditLogWriter;
pub use config::{ConfigError, WebhookConfig};
pub use error::{WebhookError, WebhookResult};
pub use events::{EventCompletion, EventStatus, WebhookEvent};
pub use fulfillment::{FulfillmentEngine, FulfillmentOutcome};
pub use handler::{webhook_handler, webhook_router, WebhookState};
pub use idempotency::{GateDecision, IdempotencyGate};
pub use order::{Customer, Order, OrderRejection, PayloadHints, ProductRef};
pub use pipeline::{Delivery, PipelineOutcome, WebhookPipeline};
pub use signature::SignatureVerifier;
