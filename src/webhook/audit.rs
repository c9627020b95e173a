//! Audit Log Writer
//!
//! Owns the lifecycle of [`WebhookEvent`] records: one record per delivery,
//! created in `received` and moved exactly once to a terminal status.

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::store::{with_timeout, EventLog, ProcessedOrder, StoreResult};
use crate::webhook::error::{WebhookError, INVALID_SIGNATURE_DETAIL};
use crate::webhook::events::{EventCompletion, WebhookEvent};
use crate::webhook::fulfillment::FulfillmentOutcome;
use crate::webhook::order::{Order, OrderRejection, PayloadHints};

/// Writes webhook audit records
pub struct AuditLogWriter<S: EventLog + ?Sized> {
    store: Arc<S>,
    store_timeout: Duration,
}

impl<S: EventLog + ?Sized> AuditLogWriter<S> {
    /// Create a writer over `store`
    pub fn new(store: Arc<S>, store_timeout: Duration) -> Self {
        Self {
            store,
            store_timeout,
        }
    }

    /// Persist the initial `received` record.
    ///
    /// If this fails nothing durable exists for the delivery.
    #[instrument(skip_all, fields(signature_valid = signature_valid))]
    pub async fn begin(
        &self,
        payload: serde_json::Value,
        signature_valid: bool,
        source_ip: Option<IpAddr>,
    ) -> StoreResult<WebhookEvent> {
        let event = WebhookEvent::received(payload, signature_valid, source_ip);
        with_timeout(self.store_timeout, self.store.insert_event(event.clone())).await?;
        Ok(event)
    }

    /// `received` → `invalid_signature`
    pub async fn reject_signature(
        &self,
        event_id: Uuid,
        hints: PayloadHints,
    ) -> StoreResult<WebhookEvent> {
        warn!(
            event_id = %event_id,
            order_id = ?hints.order_id,
            "Rejected webhook with invalid signature"
        );
        let completion = EventCompletion::invalid_signature(INVALID_SIGNATURE_DETAIL)
            .with_order(hints.order_id, hints.customer_email);
        self.finish(event_id, completion).await
    }

    /// `received` → `failed` for a payload that did not parse or validate
    pub async fn reject_payload(
        &self,
        event_id: Uuid,
        rejection: OrderRejection,
    ) -> StoreResult<WebhookEvent> {
        warn!(
            event_id = %event_id,
            order_id = ?rejection.order_id,
            kind = rejection.error.kind(),
            error = %rejection.error,
            "Rejected webhook payload"
        );
        let completion = EventCompletion::failed(rejection.error.to_string())
            .with_order(rejection.order_id, rejection.customer_email);
        self.finish(event_id, completion).await
    }

    /// `received` → `failed` for a body cut off at the size limit
    pub async fn reject_oversized(&self, event_id: Uuid, limit: usize) -> StoreResult<WebhookEvent> {
        let error = WebhookError::PayloadTooLarge { limit };
        warn!(
            event_id = %event_id,
            kind = error.kind(),
            limit,
            "Rejected oversized webhook payload"
        );
        self.finish(event_id, EventCompletion::failed(error.to_string()))
            .await
    }

    /// `received` → `failed` for an order whose processing broke down
    pub async fn fail(
        &self,
        event_id: Uuid,
        order: &Order,
        detail: impl Into<String>,
    ) -> StoreResult<WebhookEvent> {
        let detail = detail.into();
        warn!(
            event_id = %event_id,
            order_id = %order.order_id,
            error = %detail,
            "Webhook processing failed"
        );
        let completion = EventCompletion::failed(detail).with_order(
            Some(order.order_id.clone()),
            Some(order.customer.email.clone()),
        );
        self.finish(event_id, completion).await
    }

    /// `received` → `processed` after fulfillment ran
    pub async fn complete(
        &self,
        event_id: Uuid,
        order: &Order,
        outcome: &FulfillmentOutcome,
    ) -> StoreResult<WebhookEvent> {
        info!(
            event_id = %event_id,
            order_id = %order.order_id,
            user_created = outcome.user_created,
            books_granted = outcome.books_granted,
            "Webhook processed"
        );
        let completion = EventCompletion::processed(outcome.user_created, outcome.books_granted)
            .with_order(
                Some(order.order_id.clone()),
                Some(order.customer.email.clone()),
            );
        self.finish(event_id, completion).await
    }

    /// `received` → `processed` for a replay of an already fulfilled order
    pub async fn complete_duplicate(
        &self,
        event_id: Uuid,
        order: &Order,
        original: ProcessedOrder,
    ) -> StoreResult<WebhookEvent> {
        info!(
            event_id = %event_id,
            order_id = %order.order_id,
            original_event_id = %original.event_id,
            "Webhook already processed, skipping fulfillment"
        );
        let completion = EventCompletion::duplicate(original.event_id).with_order(
            Some(order.order_id.clone()),
            Some(order.customer.email.clone()),
        );
        self.finish(event_id, completion).await
    }

    async fn finish(&self, event_id: Uuid, completion: EventCompletion) -> StoreResult<WebhookEvent> {
        with_timeout(
            self.store_timeout,
            self.store.finish_event(event_id, completion),
        )
        .await
    }
}
