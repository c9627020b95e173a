//! Status and health check handlers for the webhook service.
//!
//! - `/health` - liveness, always 200 while the process serves requests
//! - `/ready` - readiness, 200 only when the store answers a ping
//! - `/status` - uptime, per-status delivery counters and latency percentiles
//!
//! # Architecture
//!
//! ```text
//! webhook handler ──record_outcome()──▶ PipelineMetrics ◀── status_handler
//!                                          │      │
//!                                          ▼      ▼
//!                                     Counters  DeliveryLatency
//! ```
//!
//! # Example Response
//!
//! ```json
//! {
//!   "version": "0.1.0",
//!   "uptime_seconds": 3600,
//!   "deliveries": {
//!     "total": 1024,
//!     "processed": 990,
//!     "duplicates": 12,
//!     "failed": 20,
//!     "invalid_signature": 4,
//!     "retryable_failures": 10,
//!     "unknown_products": 3
//!   },
//!   "latency": {
//!     "p50_ms": 12.5,
//!     "p95_ms": 45.2,
//!     "p99_ms": 98.7
//!   }
//! }
//! ```

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use hdrhistogram::Histogram;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument, warn};

use crate::store::{with_timeout, Store};
use crate::webhook::events::EventStatus;
use crate::webhook::pipeline::PipelineOutcome;

/// Crate version
pub const SERVER_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Crate name, reported by `/status`
pub const SERVER_NAME: &str = env!("CARGO_PKG_NAME");

/// Bound on the readiness ping
const READINESS_TIMEOUT: Duration = Duration::from_secs(2);

// ============================================================================
// Response Types
// ============================================================================

/// Health check response for liveness and readiness probes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    /// "healthy", or "unavailable" when a readiness check fails
    pub status: String,

    /// Why the service is not ready
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl HealthResponse {
    fn unavailable(detail: impl Into<String>) -> Self {
        Self {
            status: "unavailable".to_string(),
            detail: Some(detail.into()),
        }
    }
}

impl Default for HealthResponse {
    fn default() -> Self {
        Self {
            status: "healthy".to_string(),
            detail: None,
        }
    }
}

/// Body of `GET /status`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusResponse {
    /// Crate version
    pub version: String,
    /// Crate name
    pub name: String,
    /// Seconds since the metrics were created
    pub uptime_seconds: u64,
    /// Delivery counters since start
    pub deliveries: DeliveryCounts,
    /// Time from request arrival to response, per delivery
    pub latency: LatencySnapshot,
    /// "accepting" while the endpoint is mounted
    pub status: String,
    /// RFC 3339 generation time
    pub timestamp: String,
}

/// Snapshot of the delivery counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryCounts {
    /// Deliveries handled, whatever the outcome
    pub total: u64,
    /// Deliveries that reached `processed`, duplicates included
    pub processed: u64,
    /// `processed` deliveries recognized as replays
    pub duplicates: u64,
    /// Deliveries that reached `failed`
    pub failed: u64,
    /// Deliveries that reached `invalid_signature`
    pub invalid_signature: u64,
    /// Deliveries answered with "please retry"
    pub retryable_failures: u64,
    /// Product references skipped as not in the catalog
    pub unknown_products: u64,
}

/// Delivery latency percentiles, in milliseconds.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LatencySnapshot {
    /// Median
    pub p50_ms: f64,
    /// 95th percentile
    pub p95_ms: f64,
    /// 99th percentile
    pub p99_ms: f64,
    /// Deliveries timed
    pub samples: u64,
    /// Arithmetic mean
    pub mean_ms: f64,
    /// Slowest delivery
    pub max_ms: f64,
}

// ============================================================================
// Delivery Latency
// ============================================================================

/// Longest delivery the histogram resolves; slower ones saturate here
const MAX_TRACKED_MICROS: u64 = 120_000_000;

/// HDR histogram of delivery wall time, in microseconds.
#[derive(Debug)]
pub struct DeliveryLatency {
    micros: RwLock<Histogram<u64>>,
}

impl DeliveryLatency {
    /// Empty histogram, 3 significant figures up to two minutes.
    pub fn new() -> Self {
        let histogram = match Histogram::new_with_bounds(1, MAX_TRACKED_MICROS, 3) {
            Ok(histogram) => histogram,
            Err(err) => unreachable!("constant histogram bounds rejected: {err}"),
        };
        Self {
            micros: RwLock::new(histogram),
        }
    }

    /// Time one delivery.
    pub fn record_duration(&self, elapsed: Duration) {
        let micros = u64::try_from(elapsed.as_micros()).unwrap_or(MAX_TRACKED_MICROS);
        self.micros.write().saturating_record(micros.max(1));
    }

    /// Deliveries timed so far.
    pub fn count(&self) -> u64 {
        self.micros.read().len()
    }

    /// Percentiles, converted to milliseconds.
    pub fn snapshot(&self) -> LatencySnapshot {
        let micros = self.micros.read();
        let ms = |us: f64| us / 1000.0;
        LatencySnapshot {
            p50_ms: ms(micros.value_at_quantile(0.50) as f64),
            p95_ms: ms(micros.value_at_quantile(0.95) as f64),
            p99_ms: ms(micros.value_at_quantile(0.99) as f64),
            samples: micros.len(),
            mean_ms: ms(micros.mean()),
            max_ms: ms(micros.max() as f64),
        }
    }
}

impl Default for DeliveryLatency {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Pipeline Metrics
// ============================================================================

/// Counters and latency for webhook deliveries.
///
/// All fields are lock-free atomics except the histogram, so the webhook
/// handler can record from any number of concurrent requests.
///
/// ```rust,no_run
/// use std::sync::Arc;
/// use std::time::Duration;
/// use purchase_webhook::handlers::PipelineMetrics;
///
/// let metrics = Arc::new(PipelineMetrics::new());
/// metrics.record_retryable(Duration::from_millis(12));
/// assert_eq!(metrics.counts().retryable_failures, 1);
/// ```
#[derive(Debug)]
pub struct PipelineMetrics {
    started: Instant,
    total: AtomicU64,
    processed: AtomicU64,
    duplicates: AtomicU64,
    failed: AtomicU64,
    invalid_signature: AtomicU64,
    retryable_failures: AtomicU64,
    unknown_products: AtomicU64,
    latency: DeliveryLatency,
}

impl PipelineMetrics {
    /// Create zeroed metrics; uptime counts from now.
    pub fn new() -> Self {
        Self {
            started: Instant::now(),
            total: AtomicU64::new(0),
            processed: AtomicU64::new(0),
            duplicates: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            invalid_signature: AtomicU64::new(0),
            retryable_failures: AtomicU64::new(0),
            unknown_products: AtomicU64::new(0),
            latency: DeliveryLatency::new(),
        }
    }

    /// Seconds since creation.
    pub fn uptime_seconds(&self) -> u64 {
        self.started.elapsed().as_secs()
    }

    /// Record a delivery that reached a terminal status.
    pub fn record_outcome(&self, outcome: &PipelineOutcome, elapsed: Duration) {
        self.total.fetch_add(1, Ordering::Relaxed);
        let counter = match outcome.status {
            EventStatus::Processed => &self.processed,
            EventStatus::Failed => &self.failed,
            EventStatus::InvalidSignature => &self.invalid_signature,
            EventStatus::Received => {
                warn!(event_id = %outcome.event_id, "Non-terminal outcome recorded");
                return;
            }
        };
        counter.fetch_add(1, Ordering::Relaxed);
        if outcome.is_duplicate() {
            self.duplicates.fetch_add(1, Ordering::Relaxed);
        }
        self.unknown_products
            .fetch_add(outcome.unknown_products.len() as u64, Ordering::Relaxed);
        self.latency.record_duration(elapsed);
    }

    /// Record a delivery answered with "please retry".
    pub fn record_retryable(&self, elapsed: Duration) {
        self.total.fetch_add(1, Ordering::Relaxed);
        self.retryable_failures.fetch_add(1, Ordering::Relaxed);
        self.latency.record_duration(elapsed);
    }

    /// Snapshot of the counters.
    pub fn counts(&self) -> DeliveryCounts {
        DeliveryCounts {
            total: self.total.load(Ordering::Relaxed),
            processed: self.processed.load(Ordering::Relaxed),
            duplicates: self.duplicates.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            invalid_signature: self.invalid_signature.load(Ordering::Relaxed),
            retryable_failures: self.retryable_failures.load(Ordering::Relaxed),
            unknown_products: self.unknown_products.load(Ordering::Relaxed),
        }
    }

    /// Latency percentiles.
    pub fn latency(&self) -> LatencySnapshot {
        self.latency.snapshot()
    }
}

impl Default for PipelineMetrics {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// HTTP Handlers
// ============================================================================

/// Shared state of the status routes.
#[derive(Clone)]
pub struct StatusState {
    /// Delivery metrics
    pub metrics: Arc<PipelineMetrics>,
    /// Store probed by `/ready`
    pub store: Arc<dyn Store>,
}

/// Liveness probe.
///
/// # Route
/// `GET /health`
pub async fn health_handler() -> impl IntoResponse {
    Json(HealthResponse::default())
}

/// Delivery counters and latency since start.
///
/// # Route
/// `GET /status`
///
/// ```bash
/// curl http://localhost:8080/status
/// ```
#[instrument(skip_all)]
pub async fn status_handler(State(state): State<StatusState>) -> impl IntoResponse {
    debug!("Delivery status requested");

    Json(StatusResponse {
        version: SERVER_VERSION.to_string(),
        name: SERVER_NAME.to_string(),
        uptime_seconds: state.metrics.uptime_seconds(),
        deliveries: state.metrics.counts(),
        latency: state.metrics.latency(),
        status: "accepting".to_string(),
        timestamp: chrono::Utc::now().to_rfc3339(),
    })
}

/// Readiness probe: pings the store.
///
/// # Route
/// `GET /ready`
///
/// # Response
/// - `200 OK` - the store answered a ping
/// - `503 Service Unavailable` - the store is unreachable or too slow
#[instrument(skip_all)]
pub async fn readiness_handler(State(state): State<StatusState>) -> impl IntoResponse {
    match with_timeout(READINESS_TIMEOUT, state.store.ping()).await {
        Ok(()) => (StatusCode::OK, Json(HealthResponse::default())),
        Err(err) => {
            warn!(error = %err, "Readiness check failed");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(HealthResponse::unavailable(err.to_string())),
            )
        }
    }
}

// ============================================================================
// Router Setup
// ============================================================================

/// Router for `/health`, `/ready` and `/status`.
pub fn status_router(state: StatusState) -> axum::Router {
    use axum::routing::get;

    axum::Router::new()
        .route("/health", get(health_handler))
        .route("/ready", get(readiness_handler))
        .route("/status", get(status_handler))
        .with_state(state)
}

// ============================================================================
// Tests
// ============================================================================
