//! Purchase Webhook - Signed Order Ingestion & Fulfillment
//!
//! This crate receives purchase notifications from an e-commerce platform,
//! verifies them, and turns each paid order into a customer account plus
//! access grants for the purchased products. Every delivery leaves an
//! immutable audit record.
//!
//! # Features
//!
//! - **HMAC Verification**: constant-time check of the platform signature
//! - **Idempotent Fulfillment**: replays of an order never grant twice
//! - **Audit Log**: one record per delivery with a single terminal status
//! - **Reporting**: token-protected event listing and detail views
//! - **Storage**: in-memory store, or PostgreSQL with the `postgres` feature
//!
//! # Architecture
//!
//! ```text
//! Platform ──▶ POST /webhooks/orders ──▶ WebhookPipeline
//!                                            │
//!                    ┌───────────────────────┼──────────────────┐
//!                    ▼                       ▼                  ▼
//!            SignatureVerifier       IdempotencyGate    FulfillmentEngine
//!                    │                       │                  │
//!                    └──────────▶ AuditLogWriter ◀──────────────┘
//!                                            │
//!                                            ▼
//!                                  Store (memory | postgres)
//! ```
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use purchase_webhook::handlers::PipelineMetrics;
//! use purchase_webhook::store::{CatalogEntry, InMemoryStore};
//! use purchase_webhook::webhook::{webhook_router, WebhookConfig, WebhookState};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = WebhookConfig::from_env()?;
//!     let store = Arc::new(InMemoryStore::with_catalog(vec![CatalogEntry {
//!         product_id: "BOOK-1".into(),
//!         title: "Field Guide".into(),
//!     }]));
//!
//!     let state = WebhookState::new(store, &config, Arc::new(PipelineMetrics::new()));
//!     let listener = tokio::net::TcpListener::bind("127.0.0.1:8080").await?;
//!     axum::serve(listener, webhook_router(state)).await?;
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]

pub mod error;
pub mod handlers;
pub mod report;
pub mod store;
pub mod webhook;

// Re-exports for convenience
pub use error::{Error, Result};
pub use handlers::{status_router, PipelineMetrics, StatusState};
pub use report::report_router;
pub use store::{InMemoryStore, Store};
pub use webhook::{
    webhook_router, Delivery, PipelineOutcome, WebhookConfig, WebhookPipeline, WebhookState,
};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");
