//! Persistence seams for the ingestion pipeline
//!
//! The pipeline writes to four collaborators, each expressed as a trait so the
//! backing store can be swapped without touching pipeline code:
//!
//! - [`Catalog`] - lookup of internal products by store product identifier
//! - [`AccountStore`] - accounts keyed by normalized email
//! - [`AccessGrantStore`] - access grants keyed by (account, product)
//! - [`EventLog`] - webhook audit records and per-order claims
//!
//! Every write follows the same idiom: insert, and if the store's uniqueness
//! constraint rejects the row, report the row that a peer already wrote
//! ([`Insertion::Existing`]) instead of failing.
//!
//! # Backends
//!
//! ```text
//!                 ┌──────────────┐
//! Pipeline ──────▶│ dyn Store    │
//!                 └──────┬───────┘
//!            ┌───────────┴────────────┐
//!            ▼                        ▼
//!     InMemoryStore           PostgresStore (feature = "postgres")
//! ```

pub mod memory;
#[cfg(feature = "postgres")]
pub mod postgres;

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::webhook::events::{EventCompletion, EventStatus, WebhookEvent};

pub use memory::InMemoryStore;
#[cfg(feature = "postgres")]
pub use postgres::PostgresStore;

// =============================================================================
// Errors
// =============================================================================

/// Errors raised by store backends
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// A store call exceeded the configured timeout
    #[error("Store operation timed out after {0:?}")]
    Timeout(Duration),

    /// The backend could not be reached
    #[error("Store unavailable: {0}")]
    Unavailable(String),

    /// No webhook event with this id exists
    #[error("Webhook event {0} not found")]
    EventNotFound(Uuid),

    /// Attempted to mutate an event that already reached a terminal status
    #[error("Webhook event {id} already reached terminal status {status}")]
    AlreadyTerminal {
        /// Event id
        id: Uuid,
        /// The status the event is frozen in
        status: EventStatus,
    },

    /// Any other backend failure
    #[error("Store error: {0}")]
    Backend(String),
}

impl StoreError {
    /// Whether retrying the same operation later may succeed
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Timeout(_) | Self::Unavailable(_) | Self::Backend(_)
        )
    }
}

/// Result type for store operations
pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Run a store future under a deadline.
///
/// Every store call the pipeline makes goes through this so that no request
/// can hang on a stalled backend.
pub async fn with_timeout<T, F>(limit: Duration, fut: F) -> StoreResult<T>
where
    F: std::future::Future<Output = StoreResult<T>>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result,
        Err(_) => Err(StoreError::Timeout(limit)),
    }
}

// =============================================================================
// Domain records
// =============================================================================

/// Outcome of an insert-if-absent write
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Insertion<T> {
    /// This call created the row
    Created(T),
    /// The row already existed (written earlier or by a concurrent peer)
    Existing(T),
}

impl<T> Insertion<T> {
    /// True when this call created the row
    pub fn was_created(&self) -> bool {
        matches!(self, Self::Created(_))
    }

    /// The row, regardless of who wrote it
    pub fn into_inner(self) -> T {
        match self {
            Self::Created(value) | Self::Existing(value) => value,
        }
    }
}

/// A content product from the catalog
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Product {
    /// Internal product id
    pub id: Uuid,
    /// Identifier the e-commerce store uses for this product
    pub store_product_id: String,
    /// Display title
    pub title: String,
}

/// Catalog seed entry, as loaded from a JSON catalog file
#[derive(Debug, Clone, Deserialize)]
pub struct CatalogEntry {
    /// Store product identifier
    pub product_id: String,
    /// Display title
    #[serde(default)]
    pub title: String,
}

/// Read catalog entries from a JSON file of the form
/// `[{"product_id": "MEDIGEST-CV-001", "title": "Cardiovascular Medicine"}]`
pub fn read_catalog_file(path: impl AsRef<Path>) -> crate::Result<Vec<CatalogEntry>> {
    let raw = std::fs::read(path.as_ref())?;
    let entries: Vec<CatalogEntry> = serde_json::from_slice(&raw)?;
    if let Some(blank) = entries.iter().position(|e| e.product_id.trim().is_empty()) {
        return Err(crate::Error::generic(format!(
            "catalog entry {blank} has an empty product_id"
        )));
    }
    Ok(entries)
}

/// A user account
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    /// Account id
    pub id: Uuid,
    /// Normalized (trimmed, lower-cased) email
    pub email: String,
    /// Given name, possibly empty
    pub first_name: String,
    /// Family name, possibly empty
    pub last_name: String,
    /// Created by the ingestion pipeline rather than by sign-up
    pub created_by_automation: bool,
    /// Creation time
    pub created_at: DateTime<Utc>,
}

/// Fields for a new account
#[derive(Debug, Clone)]
pub struct NewAccount {
    /// Must already be normalized
    pub email: String,
    /// Given name, possibly empty
    pub first_name: String,
    /// Family name, possibly empty
    pub last_name: String,
    /// Whether the pipeline is creating the account
    pub created_by_automation: bool,
}

impl NewAccount {
    /// Materialize the account row with a fresh id
    pub fn into_account(self) -> Account {
        Account {
            id: Uuid::new_v4(),
            email: self.email,
            first_name: self.first_name,
            last_name: self.last_name,
            created_by_automation: self.created_by_automation,
            created_at: Utc::now(),
        }
    }
}

/// Where an access grant came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GrantSource {
    /// Granted by the ingestion pipeline
    Automated,
    /// Granted by an operator
    Manual,
}

impl GrantSource {
    /// Get the string representation
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Automated => "automated",
            Self::Manual => "manual",
        }
    }
}

impl std::str::FromStr for GrantSource {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "automated" => Ok(Self::Automated),
            "manual" => Ok(Self::Manual),
            other => Err(StoreError::Backend(format!("unknown grant source: {other}"))),
        }
    }
}

/// A durable right for one account to use one product
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessGrant {
    /// Grant id
    pub id: Uuid,
    /// Holder of the grant
    pub account_id: Uuid,
    /// Internal product id
    pub product_id: Uuid,
    /// Order that produced the grant
    pub order_id: String,
    /// Who granted it
    pub source: GrantSource,
    /// Grant time
    pub granted_at: DateTime<Utc>,
}

/// Fields for a new access grant
#[derive(Debug, Clone)]
pub struct NewAccessGrant {
    /// Account receiving access
    pub account_id: Uuid,
    /// Internal product id
    pub product_id: Uuid,
    /// Order that produced the grant
    pub order_id: String,
    /// Who is granting it
    pub source: GrantSource,
}

impl NewAccessGrant {
    /// Materialize the grant row with a fresh id
    pub fn into_grant(self) -> AccessGrant {
        AccessGrant {
            id: Uuid::new_v4(),
            account_id: self.account_id,
            product_id: self.product_id,
            order_id: self.order_id,
            source: self.source,
            granted_at: Utc::now(),
        }
    }
}

// =============================================================================
// Order claims
// =============================================================================

/// Result recorded when an order's first delivery reached `processed`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessedOrder {
    /// The event that ran fulfillment
    pub event_id: Uuid,
    /// Whether that event created the account
    pub user_created: bool,
    /// Grants that event created
    pub books_granted: u32,
}

/// Answer to "may this delivery fulfill the order?"
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClaimOutcome {
    /// The caller now owns the order and must run fulfillment
    Claimed,
    /// Another delivery owns the order and has not finished yet
    InProgress {
        /// Event holding the claim
        event_id: Uuid,
        /// When the claim was taken
        claimed_at: DateTime<Utc>,
    },
    /// The order was already fulfilled
    Completed(ProcessedOrder),
}

/// Per-order claim row backing the idempotency gate
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OrderClaim {
    /// Held by an in-flight delivery
    InProgress {
        /// Event holding the claim
        event_id: Uuid,
        /// When the claim was taken
        claimed_at: DateTime<Utc>,
    },
    /// Fulfilled; never released
    Completed(ProcessedOrder),
}

impl OrderClaim {
    /// Decide a claim attempt against an existing row.
    ///
    /// Returns `None` when the caller takes over a stale in-progress claim.
    pub fn contest(&self, now: DateTime<Utc>, ttl: Duration) -> Option<ClaimOutcome> {
        match self {
            Self::Completed(done) => Some(ClaimOutcome::Completed(*done)),
            Self::InProgress {
                event_id,
                claimed_at,
            } => {
                let age = now.signed_duration_since(*claimed_at);
                let stale = age.to_std().map(|age| age >= ttl).unwrap_or(false);
                if stale {
                    None
                } else {
                    Some(ClaimOutcome::InProgress {
                        event_id: *event_id,
                        claimed_at: *claimed_at,
                    })
                }
            }
        }
    }
}

/// How a terminal event write affects the order's claim
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClaimResolution {
    /// Mark the order fulfilled by this event
    Complete(ProcessedOrder),
    /// Drop this event's in-progress claim so a replay can retry
    Release,
    /// Leave claims untouched
    Untouched,
}

impl ClaimResolution {
    /// Derive the claim effect of a completion applied to `event_id`
    pub fn for_completion(event_id: Uuid, completion: &EventCompletion) -> Self {
        if completion.order_id.is_none() {
            return Self::Untouched;
        }
        match completion.status {
            EventStatus::Processed if completion.duplicate_of.is_none() => {
                Self::Complete(ProcessedOrder {
                    event_id,
                    user_created: completion.user_created,
                    books_granted: completion.books_granted,
                })
            }
            EventStatus::Failed => Self::Release,
            _ => Self::Untouched,
        }
    }

    /// Reconcile a terminal write with the order's current claim row.
    ///
    /// The first `processed` write for an order becomes its original. A later
    /// one (a delivery that took over a stale claim, or the stale holder
    /// finishing after it) is recorded as a duplicate of that original and
    /// leaves the claim alone. Backends call this under the same lock or
    /// transaction that applies the write.
    pub fn settle(
        event_id: Uuid,
        mut completion: EventCompletion,
        current: Option<&OrderClaim>,
    ) -> (EventCompletion, Self) {
        let resolution = Self::for_completion(event_id, &completion);
        if let (Self::Complete(_), Some(OrderClaim::Completed(done))) = (resolution, current) {
            if done.event_id != event_id {
                completion.duplicate_of = Some(done.event_id);
                return (completion, Self::Untouched);
            }
        }
        (completion, resolution)
    }
}

// =============================================================================
// Audit queries
// =============================================================================

/// Filter for operator queries over the audit log
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct EventFilter {
    /// Exact order id
    pub order_id: Option<String>,
    /// Compared after normalization
    pub customer_email: Option<String>,
    /// Processing status
    pub status: Option<EventStatus>,
    /// Signature check result
    pub signature_valid: Option<bool>,
    /// Whether the delivery created an account
    pub user_created: Option<bool>,
    /// Case-insensitive substring over order id, email and error detail
    pub search: Option<String>,
    /// Page size, see [`EventFilter::page_size`]
    pub limit: Option<usize>,
    /// Rows to skip
    pub offset: Option<usize>,
}

impl EventFilter {
    /// Page size when none is given
    pub const DEFAULT_LIMIT: usize = 25;
    /// Upper bound on page size
    pub const MAX_LIMIT: usize = 500;

    /// Filter on a single order id
    pub fn for_order(order_id: impl Into<String>) -> Self {
        Self {
            order_id: Some(order_id.into()),
            ..Self::default()
        }
    }

    /// Effective page size
    pub fn page_size(&self) -> usize {
        self.limit
            .unwrap_or(Self::DEFAULT_LIMIT)
            .clamp(1, Self::MAX_LIMIT)
    }

    /// Whether an event passes every predicate (paging excluded)
    pub fn matches(&self, event: &WebhookEvent) -> bool {
        if let Some(order_id) = &self.order_id {
            if event.order_id.as_deref() != Some(order_id.as_str()) {
                return false;
            }
        }
        if let Some(email) = &self.customer_email {
            let wanted = normalize_email(email);
            if event.customer_email.as_deref() != Some(wanted.as_str()) {
                return false;
            }
        }
        if let Some(status) = self.status {
            if event.status != status {
                return false;
            }
        }
        if let Some(valid) = self.signature_valid {
            if event.signature_valid != valid {
                return false;
            }
        }
        if let Some(created) = self.user_created {
            if event.user_created != created {
                return false;
            }
        }
        if let Some(needle) = &self.search {
            let needle = needle.to_lowercase();
            let haystacks = [
                event.order_id.as_deref(),
                event.customer_email.as_deref(),
                event.error_detail.as_deref(),
            ];
            if !haystacks
                .iter()
                .flatten()
                .any(|h| h.to_lowercase().contains(&needle))
            {
                return false;
            }
        }
        true
    }
}

/// Trim and lower-case an email address
pub fn normalize_email(email: &str) -> String {
    email.trim().to_lowercase()
}

// =============================================================================
// Collaborator traits
// =============================================================================

/// Product lookup by store product identifier
#[async_trait]
pub trait Catalog: Send + Sync {
    /// `Ok(None)` when the identifier is not in the catalog
    async fn find_product(&self, store_product_id: &str) -> StoreResult<Option<Product>>;
}

/// Account persistence with email uniqueness
#[async_trait]
pub trait AccountStore: Send + Sync {
    /// Look up by normalized email
    async fn find_account_by_email(&self, email: &str) -> StoreResult<Option<Account>>;

    /// Insert the account unless one already exists for the email
    async fn create_account(&self, account: NewAccount) -> StoreResult<Insertion<Account>>;
}

/// Access-grant persistence, unique per (account, product)
#[async_trait]
pub trait AccessGrantStore: Send + Sync {
    /// Insert the grant unless the pair already has one
    async fn grant_access(&self, grant: NewAccessGrant) -> StoreResult<Insertion<AccessGrant>>;

    /// All grants held by an account
    async fn grants_for_account(&self, account_id: Uuid) -> StoreResult<Vec<AccessGrant>>;
}

/// Webhook audit records and order claims
#[async_trait]
pub trait EventLog: Send + Sync {
    /// Persist a freshly received event
    async fn insert_event(&self, event: WebhookEvent) -> StoreResult<()>;

    /// Move an event to its terminal status.
    ///
    /// Fails with [`StoreError::AlreadyTerminal`] if the event is no longer
    /// `received`. The claim effect given by
    /// [`ClaimResolution::for_completion`] is applied atomically with the
    /// status write.
    async fn finish_event(&self, id: Uuid, completion: EventCompletion)
        -> StoreResult<WebhookEvent>;

    /// Atomically claim an order for fulfillment.
    ///
    /// An in-progress claim older than `ttl` is taken over.
    async fn claim_order(
        &self,
        order_id: &str,
        event_id: Uuid,
        ttl: Duration,
    ) -> StoreResult<ClaimOutcome>;

    /// Fetch one event
    async fn get_event(&self, id: Uuid) -> StoreResult<Option<WebhookEvent>>;

    /// Newest-first query
    async fn list_events(&self, filter: &EventFilter) -> StoreResult<Vec<WebhookEvent>>;

    /// Cheap liveness probe
    async fn ping(&self) -> StoreResult<()>;
}

/// Everything the pipeline needs from one store handle
pub trait Store: Catalog + AccountStore + AccessGrantStore + EventLog + 'static {}

impl<T> Store for T where T: Catalog + AccountStore + AccessGrantStore + EventLog + 'static {}
