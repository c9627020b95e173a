//! Ingestion Endpoint
//!
//! `POST /webhooks/orders` receives the raw body, hands it to the pipeline and
//! maps the result onto the two answers the sender understands:
//!
//! - `200` with the terminal outcome, for every delivery that reached a
//!   terminal status (`invalid_signature` and `failed` included)
//! - `503` with `Retry-After`, for transient infrastructure failures
//!
//! Bodies over the size limit are cut off, recorded as `failed` and
//! acknowledged, since redelivering them can never succeed.
//!
//! The pipeline runs in its own task, so a sender that disconnects mid-request
//! does not cancel it: the record still reaches a terminal status and the
//! redelivery is later recognized as a duplicate.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Instant;

use axum::body::{Body, Bytes};
use axum::extract::{ConnectInfo, State};
use axum::http::{header, HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Json, Router};
use futures::StreamExt;
use serde_json::json;
use tracing::{error, info, warn};

use crate::handlers::PipelineMetrics;
use crate::store::Store;
use crate::webhook::config::WebhookConfig;
use crate::webhook::error::WebhookError;
use crate::webhook::pipeline::{Delivery, WebhookPipeline};

/// Route the endpoint is mounted on
pub const WEBHOOK_PATH: &str = "/webhooks/orders";

/// Seconds the sender is asked to wait before redelivering
pub const RETRY_AFTER_SECS: u64 = 30;

const FORWARDED_FOR: &str = "x-forwarded-for";

/// Shared state of the webhook route
#[derive(Clone)]
pub struct WebhookState {
    pipeline: Arc<WebhookPipeline<dyn Store>>,
    metrics: Arc<PipelineMetrics>,
    signature_header: String,
    trust_forwarded_for: bool,
    max_body_bytes: usize,
}

impl WebhookState {
    /// Build the pipeline over `store`
    pub fn new(store: Arc<dyn Store>, config: &WebhookConfig, metrics: Arc<PipelineMetrics>) -> Self {
        Self {
            pipeline: Arc::new(WebhookPipeline::new(store, config)),
            metrics,
            signature_header: config.signature_header.clone(),
            trust_forwarded_for: config.trust_forwarded_for,
            max_body_bytes: config.max_body_bytes,
        }
    }
}

/// Create the router serving the ingestion endpoint
pub fn webhook_router(state: WebhookState) -> Router {
    Router::new()
        .route(WEBHOOK_PATH, post(webhook_handler))
        .with_state(state)
}

/// Request body read up to the size limit
#[derive(Debug, PartialEq, Eq)]
enum CappedBody {
    /// The whole body
    Complete(Bytes),
    /// The first `limit` bytes of a longer body
    Oversized(Bytes),
}

async fn read_capped(body: Body, limit: usize) -> Result<CappedBody, axum::Error> {
    let mut stream = body.into_data_stream();
    let mut buffer = Vec::new();
    while let Some(chunk) = stream.next().await {
        let chunk = chunk?;
        let room = limit - buffer.len();
        if chunk.len() > room {
            buffer.extend_from_slice(&chunk[..room]);
            return Ok(CappedBody::Oversized(Bytes::from(buffer)));
        }
        buffer.extend_from_slice(&chunk);
    }
    Ok(CappedBody::Complete(Bytes::from(buffer)))
}

/// Ingestion handler
///
/// The body is taken as raw bytes so the signature is checked over exactly
/// what the sender signed.
pub async fn webhook_handler(
    State(state): State<WebhookState>,
    peer: Option<ConnectInfo<SocketAddr>>,
    headers: HeaderMap,
    body: Body,
) -> Response {
    let started = Instant::now();
    let limit = state.max_body_bytes;

    let body = match read_capped(body, limit).await {
        Ok(body) => body,
        Err(err) => {
            warn!(error = %err, "Could not read webhook body");
            state.metrics.record_retryable(started.elapsed());
            return retry_response(
                StatusCode::SERVICE_UNAVAILABLE,
                "body_read_error",
                "request body could not be read",
            );
        }
    };

    let signature = headers
        .get(state.signature_header.as_str())
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    let sender_ip = source_ip(
        &headers,
        peer.map(|ConnectInfo(addr)| addr),
        state.trust_forwarded_for,
    );

    let pipeline = state.pipeline.clone();
    let task = tokio::spawn(async move {
        match body {
            CappedBody::Complete(body) => {
                pipeline
                    .process(Delivery {
                        body,
                        signature,
                        source_ip: sender_ip,
                    })
                    .await
            }
            CappedBody::Oversized(prefix) => {
                pipeline.process_oversized(&prefix, limit, sender_ip).await
            }
        }
    });

    let result = match task.await {
        Ok(result) => result,
        Err(join_err) => {
            error!(error = %join_err, "Webhook pipeline task aborted");
            state.metrics.record_retryable(started.elapsed());
            return retry_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                "internal_error",
                "processing aborted",
            );
        }
    };

    match result {
        Ok(outcome) => {
            state.metrics.record_outcome(&outcome, started.elapsed());
            info!(
                event_id = %outcome.event_id,
                order_id = ?outcome.order_id,
                status = %outcome.status,
                "Webhook acknowledged"
            );
            (StatusCode::OK, Json(outcome)).into_response()
        }
        Err(err) => {
            state.metrics.record_retryable(started.elapsed());
            failure_response(&err)
        }
    }
}

fn failure_response(err: &WebhookError) -> Response {
    if err.is_retryable() {
        warn!(kind = err.kind(), error = %err, "Webhook not processed, asking sender to retry");
        retry_response(StatusCode::SERVICE_UNAVAILABLE, err.kind(), &err.to_string())
    } else {
        error!(kind = err.kind(), error = %err, "Webhook processing error");
        retry_response(StatusCode::INTERNAL_SERVER_ERROR, err.kind(), &err.to_string())
    }
}

fn retry_response(status: StatusCode, kind: &str, message: &str) -> Response {
    let mut response = (
        status,
        Json(json!({
            "error": kind,
            "message": message,
        })),
    )
        .into_response();
    response.headers_mut().insert(
        header::RETRY_AFTER,
        HeaderValue::from(RETRY_AFTER_SECS),
    );
    response
}

/// Sender address: first `X-Forwarded-For` hop when trusted, else the peer
fn source_ip(headers: &HeaderMap, peer: Option<SocketAddr>, trust_forwarded_for: bool) -> Option<IpAddr> {
    if trust_forwarded_for {
        let forwarded = headers
            .get(FORWARDED_FOR)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.split(',').next())
            .and_then(|hop| hop.trim().parse::<IpAddr>().ok());
        if forwarded.is_some() {
            return forwarded;
        }
    }
    peer.map(|addr| addr.ip())
}
