//! PostgreSQL store (`postgres` feature)
//!
//! Uniqueness lives in the schema: `accounts.email`, `access_grants
//! (account_id, product_id)` and `order_claims.order_id`. Inserts use
//! `ON CONFLICT DO NOTHING` and read back the winning row, so a concurrent
//! peer's write is reported as [`Insertion::Existing`] rather than an error.
//!
//! Terminal event writes lock the event row, re-check that it is still
//! `received`, and update the order claim in the same transaction. A claim
//! is only ever completed from `in_progress`; a second `processed` write for
//! the order is stored as a duplicate of the first.

use std::net::IpAddr;
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::types::Json;
use sqlx::{Pool, Postgres, QueryBuilder, Row};
use tracing::{error, info, instrument};
use uuid::Uuid;

use crate::store::{
    AccessGrant, AccessGrantStore, Account, AccountStore, Catalog, CatalogEntry, ClaimOutcome,
    ClaimResolution, EventFilter, EventLog, GrantSource, Insertion, NewAccessGrant, NewAccount,
    OrderClaim, ProcessedOrder, Product, StoreError, StoreResult,
};
use crate::webhook::events::{EventCompletion, EventStatus, WebhookEvent};

const SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS catalog_products (
        id UUID PRIMARY KEY,
        store_product_id TEXT NOT NULL UNIQUE,
        title TEXT NOT NULL DEFAULT ''
    )",
    "CREATE TABLE IF NOT EXISTS accounts (
        id UUID PRIMARY KEY,
        email TEXT NOT NULL UNIQUE,
        first_name TEXT NOT NULL DEFAULT '',
        last_name TEXT NOT NULL DEFAULT '',
        created_by_automation BOOLEAN NOT NULL DEFAULT FALSE,
        created_at TIMESTAMPTZ NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS access_grants (
        id UUID PRIMARY KEY,
        account_id UUID NOT NULL REFERENCES accounts (id),
        product_id UUID NOT NULL REFERENCES catalog_products (id),
        order_id TEXT NOT NULL,
        source TEXT NOT NULL,
        granted_at TIMESTAMPTZ NOT NULL,
        UNIQUE (account_id, product_id)
    )",
    "CREATE TABLE IF NOT EXISTS webhook_events (
        id UUID PRIMARY KEY,
        order_id TEXT,
        customer_email TEXT,
        payload JSONB NOT NULL,
        signature_valid BOOLEAN NOT NULL,
        processing_status TEXT NOT NULL,
        error_detail TEXT,
        source_ip TEXT,
        user_created BOOLEAN NOT NULL DEFAULT FALSE,
        books_granted INTEGER NOT NULL DEFAULT 0,
        duplicate_of UUID,
        received_at TIMESTAMPTZ NOT NULL,
        processed_at TIMESTAMPTZ
    )",
    "CREATE INDEX IF NOT EXISTS webhook_events_order_id_idx ON webhook_events (order_id)",
    "CREATE INDEX IF NOT EXISTS webhook_events_email_idx ON webhook_events (customer_email)",
    "CREATE INDEX IF NOT EXISTS webhook_events_status_idx ON webhook_events (processing_status)",
    "CREATE INDEX IF NOT EXISTS webhook_events_received_idx ON webhook_events (received_at DESC)",
    "CREATE TABLE IF NOT EXISTS order_claims (
        order_id TEXT PRIMARY KEY,
        event_id UUID NOT NULL,
        state TEXT NOT NULL,
        user_created BOOLEAN NOT NULL DEFAULT FALSE,
        books_granted INTEGER NOT NULL DEFAULT 0,
        claimed_at TIMESTAMPTZ NOT NULL
    )",
];

const EVENT_COLUMNS: &str = "id, order_id, customer_email, payload, signature_valid, \
     processing_status, error_detail, source_ip, user_created, books_granted, duplicate_of, \
     received_at, processed_at";

const CLAIM_IN_PROGRESS: &str = "in_progress";
const CLAIM_COMPLETED: &str = "completed";

/// Store backed by a PostgreSQL connection pool
#[derive(Debug, Clone)]
pub struct PostgresStore {
    pool: Pool<Postgres>,
}

impl PostgresStore {
    /// Connect and create the schema if needed
    pub async fn connect(database_url: &str) -> StoreResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .acquire_timeout(Duration::from_secs(5))
            .connect(database_url)
            .await
            .map_err(|e| map_sqlx_error(e, "connect"))?;
        let store = Self::from_pool(pool);
        store.initialize().await?;
        Ok(store)
    }

    /// Use an existing pool
    pub fn from_pool(pool: Pool<Postgres>) -> Self {
        Self { pool }
    }

    /// Create tables and indexes
    pub async fn initialize(&self) -> StoreResult<()> {
        for statement in SCHEMA {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .map_err(|e| map_sqlx_error(e, "initialize"))?;
        }
        info!("Webhook schema ready");
        Ok(())
    }

    /// Insert or update catalog products. Returns how many were written.
    pub async fn seed_catalog(&self, entries: Vec<CatalogEntry>) -> StoreResult<usize> {
        let mut seeded = 0;
        for entry in entries {
            sqlx::query(
                "INSERT INTO catalog_products (id, store_product_id, title) VALUES ($1, $2, $3)
                 ON CONFLICT (store_product_id) DO UPDATE SET title = EXCLUDED.title",
            )
            .bind(Uuid::new_v4())
            .bind(&entry.product_id)
            .bind(&entry.title)
            .execute(&self.pool)
            .await
            .map_err(|e| map_sqlx_error(e, "seed_catalog"))?;
            seeded += 1;
        }
        Ok(seeded)
    }

    async fn read_claim(
        tx: &mut sqlx::Transaction<'_, Postgres>,
        order_id: &str,
    ) -> StoreResult<Option<OrderClaim>> {
        let row = sqlx::query(
            "SELECT event_id, state, user_created, books_granted, claimed_at
             FROM order_claims WHERE order_id = $1 FOR UPDATE",
        )
        .bind(order_id)
        .fetch_optional(&mut **tx)
        .await
        .map_err(|e| map_sqlx_error(e, "read_claim"))?;

        row.map(|row| claim_from_row(&row))
            .transpose()
            .map_err(|e| map_sqlx_error(e, "read_claim"))
    }

    /// Apply a terminal write's claim effect inside `tx`, returning the
    /// completion to record (rewritten as a duplicate when another event
    /// already completed the order).
    async fn resolve_claim(
        tx: &mut sqlx::Transaction<'_, Postgres>,
        event_id: Uuid,
        order_id: &str,
        completion: EventCompletion,
    ) -> StoreResult<EventCompletion> {
        let current = Self::read_claim(tx, order_id).await?;
        let (completion, resolution) =
            ClaimResolution::settle(event_id, completion, current.as_ref());

        match resolution {
            ClaimResolution::Complete(done) => {
                let written = sqlx::query(
                    "INSERT INTO order_claims
                         (order_id, event_id, state, user_created, books_granted, claimed_at)
                     VALUES ($1, $2, $3, $4, $5, $6)
                     ON CONFLICT (order_id) DO UPDATE SET
                         event_id = EXCLUDED.event_id, state = EXCLUDED.state,
                         user_created = EXCLUDED.user_created,
                         books_granted = EXCLUDED.books_granted
                     WHERE order_claims.state = $7",
                )
                .bind(order_id)
                .bind(done.event_id)
                .bind(CLAIM_COMPLETED)
                .bind(done.user_created)
                .bind(books_to_db(done.books_granted))
                .bind(Utc::now())
                .bind(CLAIM_IN_PROGRESS)
                .execute(&mut **tx)
                .await
                .map_err(|e| map_sqlx_error(e, "complete_claim"))?;

                if written.rows_affected() == 1 {
                    return Ok(completion);
                }
                // A peer inserted and completed the claim after our read
                let current = Self::read_claim(tx, order_id).await?;
                Ok(ClaimResolution::settle(event_id, completion, current.as_ref()).0)
            }
            ClaimResolution::Release => {
                sqlx::query(
                    "DELETE FROM order_claims
                     WHERE order_id = $1 AND event_id = $2 AND state = $3",
                )
                .bind(order_id)
                .bind(event_id)
                .bind(CLAIM_IN_PROGRESS)
                .execute(&mut **tx)
                .await
                .map_err(|e| map_sqlx_error(e, "release_claim"))?;
                Ok(completion)
            }
            ClaimResolution::Untouched => Ok(completion),
        }
    }
}

#[async_trait]
impl Catalog for PostgresStore {
    async fn find_product(&self, store_product_id: &str) -> StoreResult<Option<Product>> {
        let row = sqlx::query(
            "SELECT id, store_product_id, title FROM catalog_products WHERE store_product_id = $1",
        )
        .bind(store_product_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| map_sqlx_error(e, "find_product"))?;

        row.map(|row| {
            Ok(Product {
                id: row.try_get("id")?,
                store_product_id: row.try_get("store_product_id")?,
                title: row.try_get("title")?,
            })
        })
        .transpose()
        .map_err(|e| map_sqlx_error(e, "find_product"))
    }
}

#[async_trait]
impl AccountStore for PostgresStore {
    async fn find_account_by_email(&self, email: &str) -> StoreResult<Option<Account>> {
        let row = sqlx::query(
            "SELECT id, email, first_name, last_name, created_by_automation, created_at
             FROM accounts WHERE email = $1",
        )
        .bind(super::normalize_email(email))
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| map_sqlx_error(e, "find_account"))?;

        row.map(|row| account_from_row(&row))
            .transpose()
            .map_err(|e| map_sqlx_error(e, "find_account"))
    }

    #[instrument(skip_all, fields(email = %account.email))]
    async fn create_account(&self, account: NewAccount) -> StoreResult<Insertion<Account>> {
        let account = account.into_account();
        let inserted = sqlx::query(
            "INSERT INTO accounts (id, email, first_name, last_name, created_by_automation, created_at)
             VALUES ($1, $2, $3, $4, $5, $6)
             ON CONFLICT (email) DO NOTHING",
        )
        .bind(account.id)
        .bind(&account.email)
        .bind(&account.first_name)
        .bind(&account.last_name)
        .bind(account.created_by_automation)
        .bind(account.created_at)
        .execute(&self.pool)
        .await
        .map_err(|e| map_sqlx_error(e, "create_account"))?;

        if inserted.rows_affected() == 1 {
            return Ok(Insertion::Created(account));
        }
        match self.find_account_by_email(&account.email).await? {
            Some(existing) => Ok(Insertion::Existing(existing)),
            None => Err(StoreError::Backend(format!(
                "account for {} conflicted but cannot be read back",
                account.email
            ))),
        }
    }
}

#[async_trait]
impl AccessGrantStore for PostgresStore {
    async fn grant_access(&self, grant: NewAccessGrant) -> StoreResult<Insertion<AccessGrant>> {
        let grant = grant.into_grant();
        let inserted = sqlx::query(
            "INSERT INTO access_grants (id, account_id, product_id, order_id, source, granted_at)
             VALUES ($1, $2, $3, $4, $5, $6)
             ON CONFLICT (account_id, product_id) DO NOTHING",
        )
        .bind(grant.id)
        .bind(grant.account_id)
        .bind(grant.product_id)
        .bind(&grant.order_id)
        .bind(grant.source.as_str())
        .bind(grant.granted_at)
        .execute(&self.pool)
        .await
        .map_err(|e| map_sqlx_error(e, "grant_access"))?;

        if inserted.rows_affected() == 1 {
            return Ok(Insertion::Created(grant));
        }

        let row = sqlx::query(
            "SELECT id, account_id, product_id, order_id, source, granted_at
             FROM access_grants WHERE account_id = $1 AND product_id = $2",
        )
        .bind(grant.account_id)
        .bind(grant.product_id)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| map_sqlx_error(e, "grant_access"))?;
        let existing = grant_from_row(&row).map_err(|e| map_sqlx_error(e, "grant_access"))?;
        Ok(Insertion::Existing(existing))
    }

    async fn grants_for_account(&self, account_id: Uuid) -> StoreResult<Vec<AccessGrant>> {
        let rows = sqlx::query(
            "SELECT id, account_id, product_id, order_id, source, granted_at
             FROM access_grants WHERE account_id = $1 ORDER BY granted_at",
        )
        .bind(account_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| map_sqlx_error(e, "grants_for_account"))?;

        rows.iter()
            .map(grant_from_row)
            .collect::<Result<_, _>>()
            .map_err(|e| map_sqlx_error(e, "grants_for_account"))
    }
}

#[async_trait]
impl EventLog for PostgresStore {
    async fn insert_event(&self, event: WebhookEvent) -> StoreResult<()> {
        sqlx::query(&format!(
            "INSERT INTO webhook_events ({EVENT_COLUMNS})
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)"
        ))
        .bind(event.id)
        .bind(&event.order_id)
        .bind(&event.customer_email)
        .bind(Json(&event.payload))
        .bind(event.signature_valid)
        .bind(event.status.as_str())
        .bind(&event.error_detail)
        .bind(event.source_ip.map(|ip| ip.to_string()))
        .bind(event.user_created)
        .bind(books_to_db(event.books_granted))
        .bind(event.duplicate_of)
        .bind(event.received_at)
        .bind(event.processed_at)
        .execute(&self.pool)
        .await
        .map_err(|e| map_sqlx_error(e, "insert_event"))?;
        Ok(())
    }

    #[instrument(skip(self, completion), fields(status = %completion.status))]
    async fn finish_event(
        &self,
        id: Uuid,
        completion: EventCompletion,
    ) -> StoreResult<WebhookEvent> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error(e, "begin"))?;

        let row = sqlx::query(&format!(
            "SELECT {EVENT_COLUMNS} FROM webhook_events WHERE id = $1 FOR UPDATE"
        ))
        .bind(id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error(e, "finish_event"))?
        .ok_or(StoreError::EventNotFound(id))?;
        let mut event = event_from_row(&row).map_err(|e| map_sqlx_error(e, "finish_event"))?;

        let completion = match completion.order_id.clone() {
            Some(order_id) => Self::resolve_claim(&mut tx, id, &order_id, completion).await?,
            None => completion,
        };
        event.apply(completion)?;

        sqlx::query(
            "UPDATE webhook_events SET order_id = $2, customer_email = $3, processing_status = $4,
                 error_detail = $5, user_created = $6, books_granted = $7, duplicate_of = $8,
                 processed_at = $9
             WHERE id = $1 AND processing_status = 'received'",
        )
        .bind(event.id)
        .bind(&event.order_id)
        .bind(&event.customer_email)
        .bind(event.status.as_str())
        .bind(&event.error_detail)
        .bind(event.user_created)
        .bind(books_to_db(event.books_granted))
        .bind(event.duplicate_of)
        .bind(event.processed_at)
        .execute(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error(e, "finish_event"))?;

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error(e, "commit"))?;
        Ok(event)
    }

    async fn claim_order(
        &self,
        order_id: &str,
        event_id: Uuid,
        ttl: Duration,
    ) -> StoreResult<ClaimOutcome> {
        let now = Utc::now();
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error(e, "begin"))?;

        let inserted = sqlx::query(
            "INSERT INTO order_claims (order_id, event_id, state, claimed_at)
             VALUES ($1, $2, $3, $4)
             ON CONFLICT (order_id) DO NOTHING",
        )
        .bind(order_id)
        .bind(event_id)
        .bind(CLAIM_IN_PROGRESS)
        .bind(now)
        .execute(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error(e, "claim_order"))?;

        let outcome = if inserted.rows_affected() == 1 {
            ClaimOutcome::Claimed
        } else {
            let contested = Self::read_claim(&mut tx, order_id)
                .await?
                .and_then(|existing| existing.contest(now, ttl));
            match contested {
                Some(outcome) => outcome,
                None => {
                    // Stale holder, or the row vanished between statements
                    sqlx::query(
                        "INSERT INTO order_claims (order_id, event_id, state, claimed_at)
                         VALUES ($1, $2, $3, $4)
                         ON CONFLICT (order_id) DO UPDATE SET
                             event_id = EXCLUDED.event_id, claimed_at = EXCLUDED.claimed_at",
                    )
                    .bind(order_id)
                    .bind(event_id)
                    .bind(CLAIM_IN_PROGRESS)
                    .bind(now)
                    .execute(&mut *tx)
                    .await
                    .map_err(|e| map_sqlx_error(e, "claim_order"))?;
                    ClaimOutcome::Claimed
                }
            }
        };

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error(e, "commit"))?;
        Ok(outcome)
    }

    async fn get_event(&self, id: Uuid) -> StoreResult<Option<WebhookEvent>> {
        let row = sqlx::query(&format!(
            "SELECT {EVENT_COLUMNS} FROM webhook_events WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| map_sqlx_error(e, "get_event"))?;

        row.map(|row| event_from_row(&row))
            .transpose()
            .map_err(|e| map_sqlx_error(e, "get_event"))
    }

    async fn list_events(&self, filter: &EventFilter) -> StoreResult<Vec<WebhookEvent>> {
        let mut query = QueryBuilder::<Postgres>::new(format!(
            "SELECT {EVENT_COLUMNS} FROM webhook_events WHERE TRUE"
        ));
        if let Some(order_id) = &filter.order_id {
            query.push(" AND order_id = ").push_bind(order_id.clone());
        }
        if let Some(email) = &filter.customer_email {
            query
                .push(" AND customer_email = ")
                .push_bind(super::normalize_email(email));
        }
        if let Some(status) = filter.status {
            query
                .push(" AND processing_status = ")
                .push_bind(status.as_str());
        }
        if let Some(valid) = filter.signature_valid {
            query.push(" AND signature_valid = ").push_bind(valid);
        }
        if let Some(created) = filter.user_created {
            query.push(" AND user_created = ").push_bind(created);
        }
        if let Some(needle) = &filter.search {
            let pattern = format!("%{}%", escape_like(needle));
            query
                .push(" AND (order_id ILIKE ")
                .push_bind(pattern.clone())
                .push(" OR customer_email ILIKE ")
                .push_bind(pattern.clone())
                .push(" OR error_detail ILIKE ")
                .push_bind(pattern)
                .push(")");
        }
        query
            .push(" ORDER BY received_at DESC LIMIT ")
            .push_bind(i64::try_from(filter.page_size()).unwrap_or(i64::MAX))
            .push(" OFFSET ")
            .push_bind(i64::try_from(filter.offset.unwrap_or(0)).unwrap_or(i64::MAX));

        let rows = query
            .build()
            .fetch_all(&self.pool)
            .await
            .map_err(|e| map_sqlx_error(e, "list_events"))?;

        rows.iter()
            .map(event_from_row)
            .collect::<Result<_, _>>()
            .map_err(|e| map_sqlx_error(e, "list_events"))
    }

    async fn ping(&self) -> StoreResult<()> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(|e| map_sqlx_error(e, "ping"))?;
        Ok(())
    }
}

// =============================================================================
// Row mapping
// =============================================================================

fn decode_error(err: impl std::error::Error + Send + Sync + 'static) -> sqlx::Error {
    sqlx::Error::Decode(Box::new(err))
}

fn books_to_db(books: u32) -> i32 {
    i32::try_from(books).unwrap_or(i32::MAX)
}

fn books_from_db(books: i32) -> u32 {
    u32::try_from(books).unwrap_or(0)
}

fn account_from_row(row: &PgRow) -> Result<Account, sqlx::Error> {
    Ok(Account {
        id: row.try_get("id")?,
        email: row.try_get("email")?,
        first_name: row.try_get("first_name")?,
        last_name: row.try_get("last_name")?,
        created_by_automation: row.try_get("created_by_automation")?,
        created_at: row.try_get("created_at")?,
    })
}

fn grant_from_row(row: &PgRow) -> Result<AccessGrant, sqlx::Error> {
    let source: String = row.try_get("source")?;
    Ok(AccessGrant {
        id: row.try_get("id")?,
        account_id: row.try_get("account_id")?,
        product_id: row.try_get("product_id")?,
        order_id: row.try_get("order_id")?,
        source: GrantSource::from_str(&source).map_err(decode_error)?,
        granted_at: row.try_get("granted_at")?,
    })
}

fn event_from_row(row: &PgRow) -> Result<WebhookEvent, sqlx::Error> {
    let status: String = row.try_get("processing_status")?;
    let source_ip: Option<String> = row.try_get("source_ip")?;
    let Json(payload): Json<serde_json::Value> = row.try_get("payload")?;

    Ok(WebhookEvent {
        id: row.try_get("id")?,
        order_id: row.try_get("order_id")?,
        customer_email: row.try_get("customer_email")?,
        payload,
        signature_valid: row.try_get("signature_valid")?,
        status: EventStatus::from_str(&status).map_err(decode_error)?,
        error_detail: row.try_get("error_detail")?,
        source_ip: source_ip.and_then(|ip| ip.parse::<IpAddr>().ok()),
        user_created: row.try_get("user_created")?,
        books_granted: books_from_db(row.try_get("books_granted")?),
        duplicate_of: row.try_get("duplicate_of")?,
        received_at: row.try_get("received_at")?,
        processed_at: row.try_get("processed_at")?,
    })
}

fn claim_from_row(row: &PgRow) -> Result<OrderClaim, sqlx::Error> {
    let state: String = row.try_get("state")?;
    let event_id: Uuid = row.try_get("event_id")?;
    if state == CLAIM_COMPLETED {
        Ok(OrderClaim::Completed(ProcessedOrder {
            event_id,
            user_created: row.try_get("user_created")?,
            books_granted: books_from_db(row.try_get("books_granted")?),
        }))
    } else {
        let claimed_at: DateTime<Utc> = row.try_get("claimed_at")?;
        Ok(OrderClaim::InProgress {
            event_id,
            claimed_at,
        })
    }
}

fn escape_like(needle: &str) -> String {
    let mut escaped = String::with_capacity(needle.len());
    for c in needle.chars() {
        if matches!(c, '%' | '_' | '\\') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

fn map_sqlx_error(error: sqlx::Error, operation: &'static str) -> StoreError {
    error!(
        error = %error,
        operation,
        "[postgres.database_error] database operation failed"
    );
    match error {
        sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) => {
            StoreError::Unavailable(format!("{operation}: {error}"))
        }
        other => StoreError::Backend(format!("{operation}: {other}")),
    }
}
