//! In-memory store
//!
//! A single-process backend. Uniqueness constraints are enforced under one
//! lock, which gives every write the same insert-if-absent semantics a
//! relational backend gets from its unique indexes.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::RwLock;
use uuid::Uuid;

use crate::store::{
    normalize_email, AccessGrant, AccessGrantStore, Account, AccountStore, Catalog,
    CatalogEntry, ClaimOutcome, ClaimResolution, EventFilter, EventLog, Insertion, NewAccessGrant,
    NewAccount, OrderClaim, Product, StoreError, StoreResult,
};
use crate::webhook::events::{EventCompletion, WebhookEvent};

#[derive(Debug, Default)]
struct Tables {
    /// Keyed by store product id
    products: HashMap<String, Product>,
    accounts: HashMap<Uuid, Account>,
    /// Unique index on normalized email
    accounts_by_email: HashMap<String, Uuid>,
    /// Unique on (account, product)
    grants: HashMap<(Uuid, Uuid), AccessGrant>,
    events: HashMap<Uuid, WebhookEvent>,
    /// Unique on order id
    claims: HashMap<String, OrderClaim>,
}

/// Thread-safe in-memory implementation of every store trait
#[derive(Debug, Default)]
pub struct InMemoryStore {
    tables: RwLock<Tables>,
}

impl InMemoryStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a store whose catalog holds the given entries
    pub fn with_catalog<I>(entries: I) -> Self
    where
        I: IntoIterator<Item = CatalogEntry>,
    {
        let store = Self::new();
        store.seed_catalog(entries);
        store
    }

    /// Insert or replace catalog products. Returns how many were seeded.
    pub fn seed_catalog<I>(&self, entries: I) -> usize
    where
        I: IntoIterator<Item = CatalogEntry>,
    {
        let mut tables = self.tables.write();
        let mut seeded = 0;
        for entry in entries {
            let product = Product {
                id: Uuid::new_v4(),
                store_product_id: entry.product_id.clone(),
                title: entry.title,
            };
            tables.products.insert(entry.product_id, product);
            seeded += 1;
        }
        seeded
    }

    /// Number of accounts
    pub fn account_count(&self) -> usize {
        self.tables.read().accounts.len()
    }

    /// Number of access grants
    pub fn grant_count(&self) -> usize {
        self.tables.read().grants.len()
    }

    /// Every stored event, newest first
    pub fn events(&self) -> Vec<WebhookEvent> {
        let mut events: Vec<_> = self.tables.read().events.values().cloned().collect();
        events.sort_by(|a, b| b.received_at.cmp(&a.received_at));
        events
    }

    /// Current claim row for an order
    pub fn claim(&self, order_id: &str) -> Option<OrderClaim> {
        self.tables.read().claims.get(order_id).cloned()
    }
}

#[async_trait]
impl Catalog for InMemoryStore {
    async fn find_product(&self, store_product_id: &str) -> StoreResult<Option<Product>> {
        Ok(self.tables.read().products.get(store_product_id).cloned())
    }
}

#[async_trait]
impl AccountStore for InMemoryStore {
    async fn find_account_by_email(&self, email: &str) -> StoreResult<Option<Account>> {
        let tables = self.tables.read();
        let key = normalize_email(email);
        Ok(tables
            .accounts_by_email
            .get(&key)
            .and_then(|id| tables.accounts.get(id))
            .cloned())
    }

    async fn create_account(&self, account: NewAccount) -> StoreResult<Insertion<Account>> {
        let mut tables = self.tables.write();
        let key = normalize_email(&account.email);

        if let Some(existing) = tables
            .accounts_by_email
            .get(&key)
            .and_then(|id| tables.accounts.get(id))
        {
            return Ok(Insertion::Existing(existing.clone()));
        }

        let account = NewAccount {
            email: key.clone(),
            ..account
        }
        .into_account();
        tables.accounts_by_email.insert(key, account.id);
        tables.accounts.insert(account.id, account.clone());
        Ok(Insertion::Created(account))
    }
}

#[async_trait]
impl AccessGrantStore for InMemoryStore {
    async fn grant_access(&self, grant: NewAccessGrant) -> StoreResult<Insertion<AccessGrant>> {
        let mut tables = self.tables.write();
        let key = (grant.account_id, grant.product_id);

        if let Some(existing) = tables.grants.get(&key) {
            return Ok(Insertion::Existing(existing.clone()));
        }

        let grant = grant.into_grant();
        tables.grants.insert(key, grant.clone());
        Ok(Insertion::Created(grant))
    }

    async fn grants_for_account(&self, account_id: Uuid) -> StoreResult<Vec<AccessGrant>> {
        let tables = self.tables.read();
        let mut grants: Vec<_> = tables
            .grants
            .values()
            .filter(|g| g.account_id == account_id)
            .cloned()
            .collect();
        grants.sort_by(|a, b| b.granted_at.cmp(&a.granted_at));
        Ok(grants)
    }
}

#[async_trait]
impl EventLog for InMemoryStore {
    async fn insert_event(&self, event: WebhookEvent) -> StoreResult<()> {
        let mut tables = self.tables.write();
        if tables.events.contains_key(&event.id) {
            return Err(StoreError::Backend(format!(
                "webhook event {} already exists",
                event.id
            )));
        }
        tables.events.insert(event.id, event);
        Ok(())
    }

    async fn finish_event(
        &self,
        id: Uuid,
        completion: EventCompletion,
    ) -> StoreResult<WebhookEvent> {
        let mut tables = self.tables.write();
        let order_id = completion.order_id.clone();
        let current = order_id.as_ref().and_then(|o| tables.claims.get(o));
        let (completion, resolution) = ClaimResolution::settle(id, completion, current);

        let event = tables
            .events
            .get_mut(&id)
            .ok_or(StoreError::EventNotFound(id))?;
        event.apply(completion)?;
        let finished = event.clone();

        if let Some(order_id) = order_id {
            match resolution {
                ClaimResolution::Complete(done) => {
                    tables.claims.insert(order_id, OrderClaim::Completed(done));
                }
                ClaimResolution::Release => {
                    let held_by_us = matches!(
                        tables.claims.get(&order_id),
                        Some(OrderClaim::InProgress { event_id, .. }) if *event_id == id
                    );
                    if held_by_us {
                        tables.claims.remove(&order_id);
                    }
                }
                ClaimResolution::Untouched => {}
            }
        }

        Ok(finished)
    }

    async fn claim_order(
        &self,
        order_id: &str,
        event_id: Uuid,
        ttl: Duration,
    ) -> StoreResult<ClaimOutcome> {
        let mut tables = self.tables.write();
        let now = Utc::now();

        if let Some(existing) = tables.claims.get(order_id) {
            if let Some(outcome) = existing.contest(now, ttl) {
                return Ok(outcome);
            }
        }

        tables.claims.insert(
            order_id.to_string(),
            OrderClaim::InProgress {
                event_id,
                claimed_at: now,
            },
        );
        Ok(ClaimOutcome::Claimed)
    }

    async fn get_event(&self, id: Uuid) -> StoreResult<Option<WebhookEvent>> {
        Ok(self.tables.read().events.get(&id).cloned())
    }

    async fn list_events(&self, filter: &EventFilter) -> StoreResult<Vec<WebhookEvent>> {
        let tables = self.tables.read();
        let mut matching: Vec<_> = tables
            .events
            .values()
            .filter(|e| filter.matches(e))
            .cloned()
            .collect();
        matching.sort_by(|a, b| b.received_at.cmp(&a.received_at));
        Ok(matching
            .into_iter()
            .skip(filter.offset.unwrap_or(0))
            .take(filter.page_size())
            .collect())
    }

    async fn ping(&self) -> StoreResult<()> {
        Ok(())
    }
}
