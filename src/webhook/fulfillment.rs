//! Fulfillment Engine
//!
//! Turns a validated [`Order`] into an account and access grants.
//!
//! ```text
//! Order ──▶ resolve products ──▶ find/create account ──▶ grant each product
//!               │                                            │
//!               ▼                                            ▼
//!        unknown ids → warnings                 already granted → not counted
//! ```
//!
//! Every step is individually idempotent, so the engine never rolls back.
//! If a step fails the error is returned as is; replaying the same order
//! completes the remaining steps without repeating the earlier ones.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::store::{
    with_timeout, AccessGrantStore, Account, AccountStore, Catalog, GrantSource, Insertion,
    NewAccessGrant, NewAccount, Product,
};
use crate::webhook::error::{WebhookError, WebhookResult};
use crate::webhook::order::Order;

/// Incremental effect of one fulfillment run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FulfillmentOutcome {
    /// Account the grants belong to
    pub account_id: Uuid,
    /// Whether this run created the account
    pub user_created: bool,
    /// Grants created by this run (pre-existing grants are not counted)
    pub books_granted: u32,
    /// Grants that already existed
    pub already_granted: u32,
    /// Product references not found in the catalog
    pub warnings: Vec<WebhookError>,
}

impl FulfillmentOutcome {
    /// Store product ids that were skipped as unknown
    pub fn unknown_products(&self) -> Vec<&str> {
        self.warnings
            .iter()
            .filter_map(|w| match w {
                WebhookError::UnknownProduct(id) => Some(id.as_str()),
                _ => None,
            })
            .collect()
    }
}

/// Provisions accounts and access grants for orders
pub struct FulfillmentEngine<S: ?Sized> {
    store: Arc<S>,
    store_timeout: Duration,
}

impl<S> FulfillmentEngine<S>
where
    S: Catalog + AccountStore + AccessGrantStore + ?Sized,
{
    /// Create an engine writing to `store`, bounding every call by `store_timeout`
    pub fn new(store: Arc<S>, store_timeout: Duration) -> Self {
        Self {
            store,
            store_timeout,
        }
    }

    /// Fulfill an order.
    ///
    /// Unknown product references are skipped and reported as warnings.
    /// Store failures are returned as [`WebhookError::TransientStore`].
    #[instrument(skip_all, fields(order_id = %order.order_id, products = order.products.len()))]
    pub async fn fulfill(&self, order: &Order) -> WebhookResult<FulfillmentOutcome> {
        let (products, warnings) = self.resolve_products(order).await?;

        let account = self.ensure_account(order).await?;
        let user_created = account.was_created();
        let account = account.into_inner();

        let mut books_granted = 0;
        let mut already_granted = 0;
        for product in &products {
            let grant = NewAccessGrant {
                account_id: account.id,
                product_id: product.id,
                order_id: order.order_id.clone(),
                source: GrantSource::Automated,
            };
            match with_timeout(self.store_timeout, self.store.grant_access(grant)).await? {
                Insertion::Created(_) => {
                    debug!(product = %product.store_product_id, "Access granted");
                    books_granted += 1;
                }
                Insertion::Existing(_) => {
                    debug!(product = %product.store_product_id, "Access already granted");
                    already_granted += 1;
                }
            }
        }

        info!(
            account_id = %account.id,
            user_created,
            books_granted,
            already_granted,
            unknown_products = warnings.len(),
            "Order fulfilled"
        );

        Ok(FulfillmentOutcome {
            account_id: account.id,
            user_created,
            books_granted,
            already_granted,
            warnings,
        })
    }

    async fn resolve_products(
        &self,
        order: &Order,
    ) -> WebhookResult<(Vec<Product>, Vec<WebhookError>)> {
        let mut resolved = Vec::with_capacity(order.products.len());
        let mut warnings = Vec::new();

        for reference in &order.products {
            let found = with_timeout(
                self.store_timeout,
                self.store.find_product(&reference.product_id),
            )
            .await?;
            match found {
                Some(product) => resolved.push(product),
                None => {
                    warn!(product_id = %reference.product_id, "Skipping product not in catalog");
                    warnings.push(WebhookError::UnknownProduct(reference.product_id.clone()));
                }
            }
        }

        Ok((resolved, warnings))
    }

    async fn ensure_account(&self, order: &Order) -> WebhookResult<Insertion<Account>> {
        let email = &order.customer.email;

        let existing = with_timeout(
            self.store_timeout,
            self.store.find_account_by_email(email),
        )
        .await?;
        if let Some(account) = existing {
            return Ok(Insertion::Existing(account));
        }

        let new_account = NewAccount {
            email: email.clone(),
            first_name: order.customer.first_name.clone(),
            last_name: order.customer.last_name.clone(),
            created_by_automation: true,
        };
        // A concurrent order for the same email may win the insert; its
        // account is ours too, but we did not create it.
        let inserted =
            with_timeout(self.store_timeout, self.store.create_account(new_account)).await?;
        if inserted.was_created() {
            info!(email = %email, "Account created");
        }
        Ok(inserted)
    }
}
