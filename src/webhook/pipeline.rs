//! Ingestion pipeline
//!
//! Sequences the components for one delivery:
//!
//! ```text
//! raw body + signature
//!        │
//!        ▼
//!   verify ──▶ begin (received) ──▶ invalid signature? ──▶ invalid_signature
//!                    │
//!                    ▼
//!                  parse ──────────▶ rejected? ─────────▶ failed
//!                    │
//!                    ▼
//!              claim order ─────────▶ already done? ─────▶ processed (duplicate_of)
//!                    │
//!                    ▼
//!                 fulfill ─────────▶ store failure? ─────▶ failed + retry
//!                    │
//!                    ▼
//!                processed
//! ```
//!
//! Every delivery that gets past `begin` ends in exactly one terminal status.
//! Errors are returned to the caller only when the sender should redeliver,
//! or when no terminal status could be recorded.

use std::net::IpAddr;
use std::sync::Arc;

use axum::body::Bytes;
use serde::Serialize;
use tracing::{error, instrument};
use uuid::Uuid;

use crate::store::Store;
use crate::webhook::audit::AuditLogWriter;
use crate::webhook::config::WebhookConfig;
use crate::webhook::error::WebhookResult;
use crate::webhook::events::{payload_document, EventStatus, WebhookEvent};
use crate::webhook::fulfillment::FulfillmentEngine;
use crate::webhook::idempotency::{GateDecision, IdempotencyGate};
use crate::webhook::order::{Order, PayloadHints};
use crate::webhook::signature::SignatureVerifier;

/// Bytes of an oversized body kept on its audit record
pub const OVERSIZED_PREVIEW_BYTES: usize = 4096;

/// One inbound request, as captured by the transport
#[derive(Debug, Clone)]
pub struct Delivery {
    /// Exact bytes received
    pub body: Bytes,
    /// Signature header value, if present
    pub signature: Option<String>,
    /// Sender address
    pub source_ip: Option<IpAddr>,
}

/// Terminal result of a delivery
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PipelineOutcome {
    /// Audit record of the delivery
    pub event_id: Uuid,
    /// Terminal status reached
    pub status: EventStatus,
    /// Order identifier, when one was read
    #[serde(skip_serializing_if = "Option::is_none")]
    pub order_id: Option<String>,
    /// Event that fulfilled the order, for a replay
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duplicate_of: Option<Uuid>,
    /// Whether this delivery created the account
    pub user_created: bool,
    /// Access grants created by this delivery
    pub books_granted: u32,
    /// Product ids skipped as unknown
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub unknown_products: Vec<String>,
}

impl PipelineOutcome {
    fn from_event(event: &WebhookEvent, unknown_products: Vec<String>) -> Self {
        Self {
            event_id: event.id,
            status: event.status,
            order_id: event.order_id.clone(),
            duplicate_of: event.duplicate_of,
            user_created: event.user_created,
            books_granted: event.books_granted,
            unknown_products,
        }
    }

    /// Whether this delivery was recognized as a replay
    pub fn is_duplicate(&self) -> bool {
        self.duplicate_of.is_some()
    }
}

/// The webhook ingestion pipeline
pub struct WebhookPipeline<S: Store + ?Sized> {
    verifier: SignatureVerifier,
    audit: AuditLogWriter<S>,
    gate: IdempotencyGate<S>,
    engine: FulfillmentEngine<S>,
}

impl<S: Store + ?Sized> WebhookPipeline<S> {
    /// Wire the pipeline over a store
    pub fn new(store: Arc<S>, config: &WebhookConfig) -> Self {
        Self {
            verifier: SignatureVerifier::new(config.signing_secret()),
            audit: AuditLogWriter::new(store.clone(), config.store_timeout),
            gate: IdempotencyGate::new(store.clone(), config),
            engine: FulfillmentEngine::new(store, config.store_timeout),
        }
    }

    /// Run one delivery to a terminal status.
    ///
    /// `Err` means the delivery was not acknowledged: the initial record could
    /// not be written, a terminal write failed, or processing hit a retryable
    /// error (in which case the event is recorded as `failed` first). A
    /// permanent processing error whose `failed` record was written is
    /// acknowledged like any other terminal status.
    #[instrument(skip_all, fields(source_ip = ?delivery.source_ip, bytes = delivery.body.len()))]
    pub async fn process(&self, delivery: Delivery) -> WebhookResult<PipelineOutcome> {
        let signature_valid = self
            .verifier
            .verify(&delivery.body, delivery.signature.as_deref());
        let document = payload_document(&delivery.body);
        let hints = if signature_valid {
            PayloadHints::default()
        } else {
            PayloadHints::peek(&document)
        };

        let event = self
            .audit
            .begin(document, signature_valid, delivery.source_ip)
            .await?;

        if !signature_valid {
            let finished = self.audit.reject_signature(event.id, hints).await?;
            return Ok(PipelineOutcome::from_event(&finished, Vec::new()));
        }

        let order = match Order::parse(&delivery.body) {
            Ok(order) => order,
            Err(rejection) => {
                let finished = self.audit.reject_payload(event.id, rejection).await?;
                return Ok(PipelineOutcome::from_event(&finished, Vec::new()));
            }
        };

        match self.run_order(event.id, &order).await {
            Ok(outcome) => Ok(outcome),
            Err(err) => {
                // Record the failure before signalling a retry; a replay of
                // the same request completes whatever was left undone.
                match self.audit.fail(event.id, &order, err.to_string()).await {
                    Ok(finished) if !err.is_retryable() => {
                        Ok(PipelineOutcome::from_event(&finished, Vec::new()))
                    }
                    Ok(_) => Err(err),
                    Err(write_err) => {
                        error!(
                            event_id = %event.id,
                            order_id = %order.order_id,
                            error = %write_err,
                            "Could not record webhook failure"
                        );
                        Err(err)
                    }
                }
            }
        }
    }

    /// Record a delivery whose body exceeded the size limit.
    ///
    /// Only `prefix` was read, so the signature cannot be checked. The event
    /// is stored as `failed` with at most [`OVERSIZED_PREVIEW_BYTES`] of what
    /// arrived.
    #[instrument(skip_all, fields(source_ip = ?source_ip, limit))]
    pub async fn process_oversized(
        &self,
        prefix: &[u8],
        limit: usize,
        source_ip: Option<IpAddr>,
    ) -> WebhookResult<PipelineOutcome> {
        let preview = &prefix[..prefix.len().min(OVERSIZED_PREVIEW_BYTES)];
        let document = serde_json::Value::String(String::from_utf8_lossy(preview).into_owned());
        let event = self.audit.begin(document, false, source_ip).await?;
        let finished = self.audit.reject_oversized(event.id, limit).await?;
        Ok(PipelineOutcome::from_event(&finished, Vec::new()))
    }

    async fn run_order(&self, event_id: Uuid, order: &Order) -> WebhookResult<PipelineOutcome> {
        match self.gate.claim(&order.order_id, event_id).await? {
            GateDecision::AlreadyProcessed(original) => {
                let finished = self
                    .audit
                    .complete_duplicate(event_id, order, original)
                    .await?;
                Ok(PipelineOutcome::from_event(&finished, Vec::new()))
            }
            GateDecision::Proceed => {
                let outcome = self.engine.fulfill(order).await?;
                let unknown = outcome
                    .unknown_products()
                    .into_iter()
                    .map(str::to_string)
                    .collect();
                let finished = self.audit.complete(event_id, order, &outcome).await?;
                Ok(PipelineOutcome::from_event(&finished, unknown))
            }
        }
    }
}

impl<S: Store + ?Sized> std::fmt::Debug for WebhookPipeline<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebhookPipeline")
            .field("verifier", &self.verifier)
            .finish_non_exhaustive()
    }
}
