//! Idempotency Gate
//!
//! Ensures each order identifier is fulfilled at most once, no matter how
//! many times (or how concurrently) the sender delivers it.
//!
//! # Race Condition Handling
//!
//! ```text
//! delivery A ──▶ claim_order ──▶ Claimed ──▶ fulfill ──▶ processed (claim completed)
//! delivery B ──▶ claim_order ──▶ InProgress ─┐
//!                     ▲                      │ poll until claim_wait
//!                     └──────────────────────┘
//!                ──▶ Completed ──▶ short-circuit, duplicate of A
//! ```
//!
//! The store's claim row is unique per order, so exactly one delivery gets
//! `Claimed`. A claim is released when its holder ends in `failed`, letting a
//! later delivery retry; an abandoned claim is taken over after the TTL.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, instrument};
use uuid::Uuid;

use crate::store::{with_timeout, ClaimOutcome, EventLog, ProcessedOrder};
use crate::webhook::config::WebhookConfig;
use crate::webhook::error::{WebhookError, WebhookResult};

/// What the pipeline should do with an order
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateDecision {
    /// This delivery owns the order and must fulfill it
    Proceed,
    /// The order was fulfilled before; do not run fulfillment again
    AlreadyProcessed(ProcessedOrder),
}

/// Per-order mutual exclusion backed by the store's claim rows
pub struct IdempotencyGate<S: EventLog + ?Sized> {
    store: Arc<S>,
    store_timeout: Duration,
    claim_wait: Duration,
    poll_interval: Duration,
    claim_ttl: Duration,
}

impl<S: EventLog + ?Sized> IdempotencyGate<S> {
    /// Create a gate over the given store
    pub fn new(store: Arc<S>, config: &WebhookConfig) -> Self {
        Self {
            store,
            store_timeout: config.store_timeout,
            claim_wait: config.claim_wait,
            poll_interval: config.claim_poll_interval,
            claim_ttl: config.claim_ttl,
        }
    }

    /// Claim `order_id` for `event_id`.
    ///
    /// Waits up to the configured claim wait while another delivery holds
    /// the order, then gives up with [`WebhookError::ClaimContended`].
    #[instrument(skip(self), fields(order_id = %order_id, event_id = %event_id))]
    pub async fn claim(&self, order_id: &str, event_id: Uuid) -> WebhookResult<GateDecision> {
        let deadline = Instant::now() + self.claim_wait;

        loop {
            let outcome = with_timeout(
                self.store_timeout,
                self.store.claim_order(order_id, event_id, self.claim_ttl),
            )
            .await?;

            match outcome {
                ClaimOutcome::Claimed => {
                    debug!("Order claimed");
                    return Ok(GateDecision::Proceed);
                }
                ClaimOutcome::Completed(done) => {
                    debug!(original_event_id = %done.event_id, "Order already processed");
                    return Ok(GateDecision::AlreadyProcessed(done));
                }
                ClaimOutcome::InProgress {
                    event_id: holder, ..
                } => {
                    if Instant::now() >= deadline {
                        return Err(WebhookError::ClaimContended {
                            order_id: order_id.to_string(),
                        });
                    }
                    debug!(holder = %holder, "Order held by another delivery, waiting");
                    tokio::time::sleep(self.poll_interval).await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryStore;
    use crate::webhook::events::{EventCompletion, WebhookEvent};

    async fn stored_event(store: &InMemoryStore) -> Uuid {
        let event = WebhookEvent::received(serde_json::json!({}), true, None);
        let id = event.id;
        store.insert_event(event).await.unwrap();
        id
    }

    fn config() -> WebhookConfig {
        WebhookConfig::new("s3cr3t").with_claim_wait(Duration::from_millis(200))
    }

    #[tokio::test]
    async fn test_first_claim_proceeds() {
        let store = Arc::new(InMemoryStore::new());
        let gate = IdempotencyGate::new(store.clone(), &config());
        let id = stored_event(&store).await;

        assert_eq!(gate.claim("ORD-1", id).await.unwrap(), GateDecision::Proceed);
    }

    #[tokio::test]
    async fn test_contended_claim_gives_up() {
        let store = Arc::new(InMemoryStore::new());
        let gate = IdempotencyGate::new(store.clone(), &config());
        let first = stored_event(&store).await;
        let second = stored_event(&store).await;

        gate.claim("ORD-1", first).await.unwrap();
        let err = gate.claim("ORD-1", second).await.unwrap_err();

        assert_eq!(
            err,
            WebhookError::ClaimContended {
                order_id: "ORD-1".into()
            }
        );
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_waiter_sees_completion() {
        let store = Arc::new(InMemoryStore::new());
        let gate = Arc::new(IdempotencyGate::new(
            store.clone(),
            &WebhookConfig::new("s3cr3t").with_claim_wait(Duration::from_secs(5)),
        ));
        let first = stored_event(&store).await;
        let second = stored_event(&store).await;

        gate.claim("ORD-1", first).await.unwrap();

        let waiter = {
            let gate = gate.clone();
            tokio::spawn(async move { gate.claim("ORD-1", second).await })
        };

        tokio::time::sleep(Duration::from_millis(100)).await;
        store
            .finish_event(
                first,
                EventCompletion::processed(true, 1).with_order(Some("ORD-1".into()), None),
            )
            .await
            .unwrap();

        let decision = waiter.await.unwrap().unwrap();
        assert_eq!(
            decision,
            GateDecision::AlreadyProcessed(ProcessedOrder {
                event_id: first,
                user_created: true,
                books_granted: 1,
            })
        );
    }

    #[tokio::test]
    async fn test_waiter_takes_over_released_claim() {
        let store = Arc::new(InMemoryStore::new());
        let gate = Arc::new(IdempotencyGate::new(
            store.clone(),
            &WebhookConfig::new("s3cr3t").with_claim_wait(Duration::from_secs(5)),
        ));
        let first = stored_event(&store).await;
        let second = stored_event(&store).await;

        gate.claim("ORD-1", first).await.unwrap();
        let waiter = {
            let gate = gate.clone();
            tokio::spawn(async move { gate.claim("ORD-1", second).await })
        };

        tokio::time::sleep(Duration::from_millis(100)).await;
        store
            .finish_event(
                first,
                EventCompletion::failed("store unavailable").with_order(Some("ORD-1".into()), None),
            )
            .await
            .unwrap();

        assert_eq!(waiter.await.unwrap().unwrap(), GateDecision::Proceed);
    }
}
