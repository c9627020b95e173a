//! Property-based testing for signature verification, order parsing and
//! replay idempotency.

use std::sync::Arc;

use axum::body::Bytes;
use proptest::prelude::*;
use serde_json::json;

use purchase_webhook::store::{CatalogEntry, InMemoryStore};
use purchase_webhook::webhook::{
    Delivery, EventStatus, Order, SignatureVerifier, WebhookConfig, WebhookPipeline,
};

// ============================================================================
// STRATEGIES
// ============================================================================

/// Strategy for generating signing secrets
fn arb_secret() -> impl Strategy<Value = String> {
    "[a-zA-Z0-9_-]{8,48}"
}

/// Strategy for generating raw bodies
fn arb_body() -> impl Strategy<Value = Vec<u8>> {
    prop::collection::vec(any::<u8>(), 1..512)
}

/// Strategy for generating product lists drawn from a small id space, with
/// repeats and ids missing from the catalog
fn arb_products() -> impl Strategy<Value = Vec<String>> {
    prop::collection::vec(
        prop_oneof![
            Just("BOOK-1".to_string()),
            Just("BOOK-2".to_string()),
            Just("BOOK-3".to_string()),
            "X-[0-9]{1,3}".prop_map(|s| s),
        ],
        1..8,
    )
}

// ============================================================================
// SIGNATURE PROPERTIES
// ============================================================================

proptest! {
    #[test]
    fn prop_signed_body_verifies(secret in arb_secret(), body in arb_body()) {
        let verifier = SignatureVerifier::new(&secret);
        let signature = verifier.sign(&body);
        prop_assert!(verifier.verify(&body, Some(signature.as_str())));
        prop_assert!(verifier.verify(&body, Some(verifier.sign_hex(&body).as_str())));
    }

    #[test]
    fn prop_tampered_body_is_rejected(
        secret in arb_secret(),
        body in arb_body(),
        index in any::<prop::sample::Index>(),
        flip in 1u8..=255,
    ) {
        let verifier = SignatureVerifier::new(&secret);
        let signature = verifier.sign(&body);

        let mut tampered = body.clone();
        let at = index.index(tampered.len());
        tampered[at] ^= flip;

        prop_assert!(!verifier.verify(&tampered, Some(signature.as_str())));
    }

    #[test]
    fn prop_wrong_secret_is_rejected(
        secret in arb_secret(),
        other in arb_secret(),
        body in arb_body(),
    ) {
        prop_assume!(secret != other);
        let signature = SignatureVerifier::new(&other).sign(&body);
        prop_assert!(!SignatureVerifier::new(&secret).verify(&body, Some(signature.as_str())));
    }

    #[test]
    fn prop_garbage_signature_is_rejected(
        body in arb_body(),
        signature in ".{0,100}",
    ) {
        let verifier = SignatureVerifier::new("whsec-prop");
        prop_assume!(signature != verifier.sign(&body));
        prop_assume!(signature != verifier.sign_hex(&body));
        prop_assert!(!verifier.verify(&body, Some(signature.as_str())));
    }

    #[test]
    fn prop_parse_never_panics(body in arb_body()) {
        let _ = Order::parse(&body);
    }
}

// ============================================================================
// REPLAY IDEMPOTENCY
// ============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn prop_replays_grant_each_product_once(
        products in arb_products(),
        replays in 1usize..5,
    ) {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();

        let known: std::collections::HashSet<&str> = products
            .iter()
            .map(String::as_str)
            .filter(|id| id.starts_with("BOOK-"))
            .collect();

        let store = Arc::new(InMemoryStore::with_catalog(
            ["BOOK-1", "BOOK-2", "BOOK-3"].map(|id| CatalogEntry {
                product_id: id.into(),
                title: format!("Title of {id}"),
            }),
        ));
        let pipeline = WebhookPipeline::new(store.clone(), &WebhookConfig::new("whsec-prop"));

        let items: Vec<_> = products.iter().map(|id| json!({ "product_id": id })).collect();
        let body = json!({
            "order_id": "ORD-PROP",
            "customer": { "email": "prop@example.com" },
            "products": items,
        })
        .to_string();
        let signature = SignatureVerifier::new("whsec-prop").sign(body.as_bytes());

        let outcomes = runtime.block_on(async {
            let mut outcomes = Vec::new();
            for _ in 0..replays {
                let delivery = Delivery {
                    body: Bytes::from(body.clone()),
                    signature: Some(signature.clone()),
                    source_ip: None,
                };
                outcomes.push(pipeline.process(delivery).await.unwrap());
            }
            outcomes
        });

        prop_assert_eq!(store.grant_count(), known.len());
        prop_assert_eq!(store.account_count(), 1);
        prop_assert!(outcomes.iter().all(|o| o.status == EventStatus::Processed));
        prop_assert_eq!(outcomes.iter().filter(|o| !o.is_duplicate()).count(), 1);
        prop_assert_eq!(outcomes[0].books_granted as usize, known.len());
    }
}
