//! Operator reporting over the webhook audit log
//!
//! Read-only views, kept out of the ingestion path:
//!
//! - `GET /admin/webhook-events` - newest-first page of event summaries,
//!   filtered by order id, customer email, status, signature validity,
//!   user-created flag and free-text search
//! - `GET /admin/webhook-events/{id}` - one full record, payload pretty-printed
//!
//! Every route requires `Authorization: Bearer <admin token>`. Without a
//! configured admin token the routes are not mounted at all.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Path, Query, Request, State};
use axum::http::{header, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::json;
use sha2::{Digest, Sha256};
use tracing::{debug, error, warn};
use uuid::Uuid;

use crate::store::{with_timeout, EventFilter, Store, StoreError};
use crate::webhook::config::WebhookConfig;
use crate::webhook::events::{EventStatus, WebhookEvent};

/// Placeholder shown for a missing order id
const NO_VALUE: &str = "—";

// =============================================================================
// Authentication
// =============================================================================

/// Bearer-token check for the admin routes
#[derive(Clone)]
pub struct AdminAuth {
    token_hash: [u8; 32],
}

/// Result of checking an `Authorization` header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthResult {
    /// Token matched
    Authenticated,
    /// No `Authorization` header
    MissingHeader,
    /// Header is not `Bearer <token>`
    InvalidFormat,
    /// Token did not match
    InvalidToken,
}

impl AuthResult {
    /// HTTP status for a rejected request
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::Authenticated => StatusCode::OK,
            Self::MissingHeader | Self::InvalidFormat | Self::InvalidToken => {
                StatusCode::UNAUTHORIZED
            }
        }
    }

    /// Message for a rejected request
    pub fn error_message(&self) -> Option<&'static str> {
        match self {
            Self::Authenticated => None,
            Self::MissingHeader => Some("Missing Authorization header"),
            Self::InvalidFormat => {
                Some("Invalid Authorization format. Expected: Bearer <token>")
            }
            Self::InvalidToken => Some("Invalid token"),
        }
    }
}

impl AdminAuth {
    /// Accept `token`
    pub fn new(token: &str) -> Self {
        Self {
            token_hash: hash_token(token),
        }
    }

    /// Check an `Authorization` header value
    pub fn authenticate(&self, auth_header: Option<&str>) -> AuthResult {
        let Some(header) = auth_header else {
            return AuthResult::MissingHeader;
        };
        let token = match header.strip_prefix("Bearer ") {
            Some(token) => token.trim(),
            None => return AuthResult::InvalidFormat,
        };
        if token.is_empty() {
            return AuthResult::InvalidFormat;
        }

        if constant_time_compare(&self.token_hash, &hash_token(token)) {
            AuthResult::Authenticated
        } else {
            warn!("Invalid admin token attempt");
            AuthResult::InvalidToken
        }
    }
}

impl std::fmt::Debug for AdminAuth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdminAuth").finish_non_exhaustive()
    }
}

/// Tokens are compared by digest so both sides have the same length
fn hash_token(token: &str) -> [u8; 32] {
    let mut hash = [0u8; 32];
    hash.copy_from_slice(&Sha256::digest(token.as_bytes()));
    hash
}

fn constant_time_compare(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut result = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        result |= x ^ y;
    }
    result == 0
}

async fn require_admin(
    State(auth): State<Arc<AdminAuth>>,
    request: Request,
    next: Next,
) -> Response {
    let auth_header = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok());

    match auth.authenticate(auth_header) {
        AuthResult::Authenticated => next.run(request).await,
        rejected => (
            rejected.status_code(),
            [(header::WWW_AUTHENTICATE, "Bearer")],
            Json(json!({ "error": rejected.error_message() })),
        )
            .into_response(),
    }
}

// =============================================================================
// Views
// =============================================================================

/// One row of the event list
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EventSummary {
    /// Event id
    pub id: Uuid,
    /// Order id, or "—" when none was extracted
    pub order_id: String,
    /// Customer email, when extracted
    pub customer_email: Option<String>,
    /// Processing status
    pub status: EventStatus,
    /// Human-readable status
    pub status_label: &'static str,
    /// "Valid" or "Invalid"
    pub signature: &'static str,
    /// Whether the delivery created an account
    pub user_created: bool,
    /// Access grants created
    pub books_granted: u32,
    /// Event that fulfilled the order, for replays
    pub duplicate_of: Option<Uuid>,
    /// Arrival time
    pub received_at: DateTime<Utc>,
}

impl From<&WebhookEvent> for EventSummary {
    fn from(event: &WebhookEvent) -> Self {
        Self {
            id: event.id,
            order_id: event
                .order_id
                .clone()
                .unwrap_or_else(|| NO_VALUE.to_string()),
            customer_email: event.customer_email.clone(),
            status: event.status,
            status_label: event.status.label(),
            signature: signature_label(event.signature_valid),
            user_created: event.user_created,
            books_granted: event.books_granted,
            duplicate_of: event.duplicate_of,
            received_at: event.received_at,
        }
    }
}

/// A page of summaries
#[derive(Debug, Clone, Serialize)]
pub struct EventPage {
    /// Newest first
    pub events: Vec<EventSummary>,
    /// Page size applied
    pub limit: usize,
    /// Rows skipped
    pub offset: usize,
}

/// Full record view
#[derive(Debug, Clone, Serialize)]
pub struct EventDetail {
    #[serde(flatten)]
    /// Summary columns
    pub summary: EventSummary,
    /// Raw signature result
    pub signature_valid: bool,
    /// Failure reason
    pub error_detail: Option<String>,
    /// Sender address
    pub source_ip: Option<String>,
    /// When the terminal status was written
    pub processed_at: Option<DateTime<Utc>>,
    /// Indented rendering of the stored payload
    pub payload_pretty: String,
}

impl From<&WebhookEvent> for EventDetail {
    fn from(event: &WebhookEvent) -> Self {
        Self {
            summary: EventSummary::from(event),
            signature_valid: event.signature_valid,
            error_detail: event.error_detail.clone(),
            source_ip: event.source_ip.map(|ip| ip.to_string()),
            processed_at: event.processed_at,
            payload_pretty: pretty_payload(&event.payload),
        }
    }
}

fn signature_label(valid: bool) -> &'static str {
    if valid {
        "Valid"
    } else {
        "Invalid"
    }
}

/// Indented JSON; string payloads (non-JSON bodies) are shown as is
pub fn pretty_payload(payload: &serde_json::Value) -> String {
    match payload {
        serde_json::Value::String(raw) => raw.clone(),
        other => serde_json::to_string_pretty(other).unwrap_or_else(|_| other.to_string()),
    }
}

// =============================================================================
// Handlers
// =============================================================================

/// Shared state of the reporting routes
#[derive(Clone)]
pub struct ReportState {
    store: Arc<dyn Store>,
    store_timeout: Duration,
}

/// List events
///
/// # Route
/// `GET /admin/webhook-events?status=failed&search=ORD-78&limit=25&offset=0`
pub async fn list_events_handler(
    State(state): State<ReportState>,
    Query(filter): Query<EventFilter>,
) -> Response {
    debug!(?filter, "Listing webhook events");
    match with_timeout(state.store_timeout, state.store.list_events(&filter)).await {
        Ok(events) => Json(EventPage {
            events: events.iter().map(EventSummary::from).collect(),
            limit: filter.page_size(),
            offset: filter.offset.unwrap_or(0),
        })
        .into_response(),
        Err(err) => store_failure(err),
    }
}

/// Show one event
///
/// # Route
/// `GET /admin/webhook-events/{id}`
pub async fn event_detail_handler(
    State(state): State<ReportState>,
    Path(id): Path<Uuid>,
) -> Response {
    match with_timeout(state.store_timeout, state.store.get_event(id)).await {
        Ok(Some(event)) => Json(EventDetail::from(&event)).into_response(),
        Ok(None) => (
            StatusCode::NOT_FOUND,
            Json(json!({ "error": format!("Webhook event {id} not found") })),
        )
            .into_response(),
        Err(err) => store_failure(err),
    }
}

fn store_failure(err: StoreError) -> Response {
    error!(error = %err, "Audit log query failed");
    (
        StatusCode::SERVICE_UNAVAILABLE,
        Json(json!({ "error": err.to_string() })),
    )
        .into_response()
}

/// Create the reporting router, or `None` when no admin token is configured
pub fn report_router(store: Arc<dyn Store>, config: &WebhookConfig) -> Option<Router> {
    let token = config.admin_token()?;
    let auth = Arc::new(AdminAuth::new(token));
    let state = ReportState {
        store,
        store_timeout: config.store_timeout,
    };

    Some(
        Router::new()
            .route("/admin/webhook-events", get(list_events_handler))
            .route("/admin/webhook-events/:id", get(event_detail_handler))
            .route_layer(middleware::from_fn_with_state(auth, require_admin))
            .with_state(state),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_authenticate() {
        let auth = AdminAuth::new("ops-token");

        assert_eq!(
            auth.authenticate(Some("Bearer ops-token")),
            AuthResult::Authenticated
        );
        assert_eq!(auth.authenticate(None), AuthResult::MissingHeader);
        assert_eq!(
            auth.authenticate(Some("Basic b3BzOnRva2Vu")),
            AuthResult::InvalidFormat
        );
        assert_eq!(auth.authenticate(Some("Bearer ")), AuthResult::InvalidFormat);
        assert_eq!(
            auth.authenticate(Some("Bearer ops-tokem")),
            AuthResult::InvalidToken
        );
        assert_eq!(
            AuthResult::InvalidToken.status_code(),
            StatusCode::UNAUTHORIZED
        );
    }

    #[test]
    fn test_constant_time_compare() {
        assert!(constant_time_compare(b"abc", b"abc"));
        assert!(!constant_time_compare(b"abc", b"abd"));
        assert!(!constant_time_compare(b"abc", b"abcd"));
    }

    #[test]
    fn test_summary_labels() {
        let event = WebhookEvent::received(json!({}), false, None);
        let summary = EventSummary::from(&event);

        assert_eq!(summary.order_id, "—");
        assert_eq!(summary.signature, "Invalid");
        assert_eq!(summary.status_label, "Received");
    }

    #[test]
    fn test_pretty_payload() {
        let pretty = pretty_payload(&json!({"order_id": "ORD-1"}));
        assert_eq!(pretty, "{\n  \"order_id\": \"ORD-1\"\n}");
        assert_eq!(pretty_payload(&json!("a=1&b=2")), "a=1&b=2");
    }

    #[test]
    fn test_router_disabled_without_token() {
        let store: Arc<dyn Store> = Arc::new(crate::store::InMemoryStore::new());
        assert!(report_router(store.clone(), &WebhookConfig::new("s3cr3t")).is_none());
        assert!(report_router(
            store,
            &WebhookConfig::new("s3cr3t").with_admin_token("ops-token")
        )
        .is_some());
    }
}
