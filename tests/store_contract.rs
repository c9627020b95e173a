//! Store contract suite
//!
//! The same scenarios run against every backend. The PostgreSQL suite needs
//! the `postgres` feature and a `DATABASE_URL`; without the variable its tests
//! return early. Every scenario works on its own tagged orders, emails and
//! products so suites can share one database.

use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use pretty_assertions::assert_eq;
use serde_json::json;
use uuid::Uuid;

use purchase_webhook::store::{
    AccessGrantStore, AccountStore, Catalog, CatalogEntry, ClaimOutcome, EventFilter, EventLog,
    GrantSource, InMemoryStore, NewAccessGrant, NewAccount, ProcessedOrder, Store, StoreError,
};
use purchase_webhook::webhook::{EventCompletion, EventStatus, WebhookEvent};

const CLAIM_TTL: Duration = Duration::from_secs(300);

/// Per-test namespace
struct Scope {
    tag: String,
}

impl Scope {
    fn new() -> Self {
        Self {
            tag: Uuid::new_v4().simple().to_string(),
        }
    }

    fn order(&self, name: &str) -> String {
        format!("ORD-{}-{name}", self.tag.to_uppercase())
    }

    fn email(&self, name: &str) -> String {
        format!("{name}.{}@example.com", self.tag)
    }

    fn product(&self, name: &str) -> String {
        format!("{name}-{}", self.tag)
    }

    fn catalog(&self) -> Vec<CatalogEntry> {
        ["CV-001", "GI-002"]
            .into_iter()
            .map(|name| CatalogEntry {
                product_id: self.product(name),
                title: format!("Title of {name}"),
            })
            .collect()
    }
}

fn new_account(email: &str) -> NewAccount {
    NewAccount {
        email: email.to_string(),
        first_name: "Sarah".to_string(),
        last_name: "Johnson".to_string(),
        created_by_automation: true,
    }
}

async fn received(store: &Arc<dyn Store>, order_id: Option<&str>) -> Uuid {
    let mut event = WebhookEvent::received(json!({ "order_id": order_id }), true, None);
    event.order_id = order_id.map(str::to_string);
    let id = event.id;
    store.insert_event(event).await.unwrap();
    id
}

async fn memory_store(catalog: Vec<CatalogEntry>) -> Option<Arc<dyn Store>> {
    Some(Arc::new(InMemoryStore::with_catalog(catalog)))
}

#[cfg(feature = "postgres")]
async fn postgres_store(catalog: Vec<CatalogEntry>) -> Option<Arc<dyn Store>> {
    use purchase_webhook::store::PostgresStore;

    let Ok(database_url) = std::env::var("DATABASE_URL") else {
        eprintln!("DATABASE_URL not set, skipping PostgreSQL contract test");
        return None;
    };
    let store = PostgresStore::connect(&database_url)
        .await
        .expect("should connect to DATABASE_URL");
    store
        .seed_catalog(catalog)
        .await
        .expect("should seed catalog");
    Some(Arc::new(store))
}

// ============================================================================
// SCENARIOS
// ============================================================================

async fn account_is_unique_per_email(store: Arc<dyn Store>, scope: Scope) {
    let email = scope.email("sarah");

    let first = store.create_account(new_account(&email)).await.unwrap();
    let second = store
        .create_account(new_account(&format!("  {}", email.to_uppercase())))
        .await
        .unwrap();

    assert!(first.was_created());
    assert!(!second.was_created());
    let first = first.into_inner();
    assert_eq!(first.id, second.into_inner().id);

    let found = store
        .find_account_by_email(&email.to_uppercase())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(found.id, first.id);
    assert_eq!(found.email, email);
    assert!(found.created_by_automation);
}

async fn concurrent_account_creation_has_one_winner(store: Arc<dyn Store>, scope: Scope) {
    let email = scope.email("race");

    let results = join_all((0..8).map(|_| store.create_account(new_account(&email)))).await;

    let mut ids = Vec::new();
    let mut created = 0;
    for result in results {
        let insertion = result.unwrap();
        if insertion.was_created() {
            created += 1;
        }
        ids.push(insertion.into_inner().id);
    }
    assert_eq!(created, 1);
    ids.dedup();
    assert_eq!(ids.len(), 1);
}

async fn grant_is_unique_per_account_and_product(store: Arc<dyn Store>, scope: Scope) {
    let account = store
        .create_account(new_account(&scope.email("grants")))
        .await
        .unwrap()
        .into_inner();
    let product = store
        .find_product(&scope.product("CV-001"))
        .await
        .unwrap()
        .expect("seeded product");
    assert!(store
        .find_product(&scope.product("MISSING"))
        .await
        .unwrap()
        .is_none());

    let grant = || NewAccessGrant {
        account_id: account.id,
        product_id: product.id,
        order_id: scope.order("G"),
        source: GrantSource::Automated,
    };
    let results = join_all((0..8).map(|_| store.grant_access(grant()))).await;
    let created = results
        .into_iter()
        .map(Result::unwrap)
        .filter(|insertion| insertion.was_created())
        .count();
    assert_eq!(created, 1);

    let grants = store.grants_for_account(account.id).await.unwrap();
    assert_eq!(grants.len(), 1);
    assert_eq!(grants[0].product_id, product.id);
    assert_eq!(grants[0].source, GrantSource::Automated);
}

async fn claim_lifecycle(store: Arc<dyn Store>, scope: Scope) {
    let order = scope.order("CLAIM");
    let first = received(&store, None).await;
    let second = received(&store, None).await;

    assert_eq!(
        store.claim_order(&order, first, CLAIM_TTL).await.unwrap(),
        ClaimOutcome::Claimed
    );
    assert!(matches!(
        store.claim_order(&order, second, CLAIM_TTL).await.unwrap(),
        ClaimOutcome::InProgress { event_id, .. } if event_id == first
    ));

    store
        .finish_event(
            first,
            EventCompletion::processed(true, 2).with_order(Some(order.clone()), None),
        )
        .await
        .unwrap();

    assert_eq!(
        store.claim_order(&order, second, CLAIM_TTL).await.unwrap(),
        ClaimOutcome::Completed(ProcessedOrder {
            event_id: first,
            user_created: true,
            books_granted: 2,
        })
    );
}

async fn concurrent_claims_have_one_winner(store: Arc<dyn Store>, scope: Scope) {
    let order = scope.order("RACE");
    let mut events = Vec::new();
    for _ in 0..8 {
        events.push(received(&store, None).await);
    }

    let outcomes = join_all(
        events
            .iter()
            .map(|id| store.claim_order(&order, *id, CLAIM_TTL)),
    )
    .await;

    let claimed = outcomes
        .into_iter()
        .map(Result::unwrap)
        .filter(|outcome| *outcome == ClaimOutcome::Claimed)
        .count();
    assert_eq!(claimed, 1);
}

async fn failed_event_releases_claim(store: Arc<dyn Store>, scope: Scope) {
    let order = scope.order("RELEASE");
    let first = received(&store, None).await;
    let retry = received(&store, None).await;

    store.claim_order(&order, first, CLAIM_TTL).await.unwrap();
    store
        .finish_event(
            first,
            EventCompletion::failed("store unavailable").with_order(Some(order.clone()), None),
        )
        .await
        .unwrap();

    assert_eq!(
        store.claim_order(&order, retry, CLAIM_TTL).await.unwrap(),
        ClaimOutcome::Claimed
    );
}

async fn stale_takeover_keeps_one_original(store: Arc<dyn Store>, scope: Scope) {
    let order = scope.order("STALE");
    let stale = received(&store, Some(&order)).await;
    let taker = received(&store, Some(&order)).await;

    store
        .claim_order(&order, stale, Duration::ZERO)
        .await
        .unwrap();
    assert_eq!(
        store
            .claim_order(&order, taker, Duration::ZERO)
            .await
            .unwrap(),
        ClaimOutcome::Claimed
    );

    let taker_done = store
        .finish_event(
            taker,
            EventCompletion::processed(false, 0).with_order(Some(order.clone()), None),
        )
        .await
        .unwrap();
    let stale_done = store
        .finish_event(
            stale,
            EventCompletion::processed(true, 2).with_order(Some(order.clone()), None),
        )
        .await
        .unwrap();

    assert_eq!(taker_done.duplicate_of, None);
    assert_eq!(stale_done.status, EventStatus::Processed);
    assert_eq!(stale_done.duplicate_of, Some(taker));

    let late = received(&store, None).await;
    assert_eq!(
        store
            .claim_order(&order, late, Duration::ZERO)
            .await
            .unwrap(),
        ClaimOutcome::Completed(ProcessedOrder {
            event_id: taker,
            user_created: false,
            books_granted: 0,
        })
    );

    let originals = store
        .list_events(&EventFilter {
            status: Some(EventStatus::Processed),
            ..EventFilter::for_order(order.as_str())
        })
        .await
        .unwrap()
        .into_iter()
        .filter(|event| event.duplicate_of.is_none())
        .count();
    assert_eq!(originals, 1);
}

async fn terminal_write_happens_once(store: Arc<dyn Store>, _scope: Scope) {
    let id = received(&store, None).await;

    store
        .finish_event(id, EventCompletion::invalid_signature("bad"))
        .await
        .unwrap();
    let err = store
        .finish_event(id, EventCompletion::processed(false, 0))
        .await
        .unwrap_err();
    assert_eq!(
        err,
        StoreError::AlreadyTerminal {
            id,
            status: EventStatus::InvalidSignature,
        }
    );

    let stored = store.get_event(id).await.unwrap().unwrap();
    assert_eq!(stored.status, EventStatus::InvalidSignature);
    assert_eq!(stored.error_detail.as_deref(), Some("bad"));
    assert!(stored.processed_at.is_some());

    let missing = Uuid::new_v4();
    assert_eq!(
        store
            .finish_event(missing, EventCompletion::failed("gone"))
            .await
            .unwrap_err(),
        StoreError::EventNotFound(missing)
    );
    assert!(store.get_event(missing).await.unwrap().is_none());
}

async fn list_events_filters_and_pages(store: Arc<dyn Store>, scope: Scope) {
    let orders: Vec<String> = (0..3).map(|n| scope.order(&format!("L{n}"))).collect();
    let mut ids = Vec::new();
    for order in &orders {
        ids.push(received(&store, Some(order)).await);
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    store
        .finish_event(
            ids[1],
            EventCompletion::failed("products list is empty")
                .with_order(Some(orders[1].clone()), Some(scope.email("lister"))),
        )
        .await
        .unwrap();

    let search = EventFilter {
        search: Some(scope.tag.clone()),
        limit: Some(10),
        ..EventFilter::default()
    };
    let all = store.list_events(&search).await.unwrap();
    let listed: Vec<Uuid> = all.iter().map(|e| e.id).collect();
    assert_eq!(listed, vec![ids[2], ids[1], ids[0]]);

    let failed = store
        .list_events(&EventFilter {
            status: Some(EventStatus::Failed),
            ..search.clone()
        })
        .await
        .unwrap();
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].id, ids[1]);

    let by_email = store
        .list_events(&EventFilter {
            customer_email: Some(scope.email("lister").to_uppercase()),
            ..EventFilter::default()
        })
        .await
        .unwrap();
    assert_eq!(by_email.len(), 1);

    let by_detail = store
        .list_events(&EventFilter {
            search: Some("PRODUCTS LIST".into()),
            order_id: Some(orders[1].clone()),
            ..EventFilter::default()
        })
        .await
        .unwrap();
    assert_eq!(by_detail.len(), 1);

    let wildcard = store
        .list_events(&EventFilter {
            search: Some(format!("{}%", scope.tag)),
            ..EventFilter::default()
        })
        .await
        .unwrap();
    assert!(wildcard.is_empty());

    let second_page = store
        .list_events(&EventFilter {
            limit: Some(2),
            offset: Some(2),
            ..search
        })
        .await
        .unwrap();
    assert_eq!(second_page.len(), 1);
    assert_eq!(second_page[0].id, ids[0]);
}

// ============================================================================
// SUITES
// ============================================================================

macro_rules! store_contract_tests {
    (suite = $suite:ident, make_store = $make_store:path $(,)?) => {
        mod $suite {
            use super::*;

            async fn run<F, Fut>(scenario: F)
            where
                F: FnOnce(Arc<dyn Store>, Scope) -> Fut,
                Fut: std::future::Future<Output = ()>,
            {
                let scope = Scope::new();
                if let Some(store) = $make_store(scope.catalog()).await {
                    scenario(store, scope).await;
                }
            }

            #[tokio::test(flavor = "multi_thread")]
            async fn account_is_unique_per_email_contract() {
                run(account_is_unique_per_email).await;
            }

            #[tokio::test(flavor = "multi_thread")]
            async fn concurrent_account_creation_contract() {
                run(concurrent_account_creation_has_one_winner).await;
            }

            #[tokio::test(flavor = "multi_thread")]
            async fn grant_is_unique_contract() {
                run(grant_is_unique_per_account_and_product).await;
            }

            #[tokio::test(flavor = "multi_thread")]
            async fn claim_lifecycle_contract() {
                run(claim_lifecycle).await;
            }

            #[tokio::test(flavor = "multi_thread")]
            async fn concurrent_claims_contract() {
                run(concurrent_claims_have_one_winner).await;
            }

            #[tokio::test(flavor = "multi_thread")]
            async fn failed_event_releases_claim_contract() {
                run(failed_event_releases_claim).await;
            }

            #[tokio::test(flavor = "multi_thread")]
            async fn stale_takeover_contract() {
                run(stale_takeover_keeps_one_original).await;
            }

            #[tokio::test(flavor = "multi_thread")]
            async fn terminal_write_contract() {
                run(terminal_write_happens_once).await;
            }

            #[tokio::test(flavor = "multi_thread")]
            async fn list_events_contract() {
                run(list_events_filters_and_pages).await;
            }
        }
    };
}

store_contract_tests!(suite = in_memory, make_store = memory_store);

#[cfg(feature = "postgres")]
store_contract_tests!(suite = postgres, make_store = postgres_store);
