//! Order Payload Parsing
//!
//! Decodes a verified request body into a typed [`Order`]. Only structure and
//! syntax are checked here; whether the referenced products exist is the
//! fulfillment engine's business.
//!
//! Accepted shape (Shopify-style aliases in brackets):
//!
//! ```json
//! {
//!   "order_id": "ORD-1",                 // [id], string or number
//!   "customer": {
//!     "email": "a@x.com",               // [top-level email]
//!     "first_name": "Sarah",
//!     "last_name": "Johnson"
//!   },
//!   "products": [                        // [line_items]
//!     { "product_id": "MEDIGEST-CV-001" } // string or number
//!   ]
//! }
//! ```

use std::collections::HashSet;
use std::sync::OnceLock;

use regex::Regex;
use serde::Serialize;
use serde_json::{Map, Value};

use crate::store::normalize_email;
use crate::webhook::error::WebhookError;

/// Longest email address accepted
const MAX_EMAIL_LEN: usize = 254;

fn email_pattern() -> &'static Regex {
    static EMAIL: OnceLock<Regex> = OnceLock::new();
    EMAIL.get_or_init(|| match Regex::new(r"^[^\s@]+@[^\s@.]+(\.[^\s@.]+)+$") {
        Ok(pattern) => pattern,
        Err(_) => unreachable!("email pattern is a valid regex"),
    })
}

/// Whether `email` is syntactically acceptable
pub fn is_valid_email(email: &str) -> bool {
    email.len() <= MAX_EMAIL_LEN && email_pattern().is_match(email)
}

/// Buyer identity
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Customer {
    /// Normalized email
    pub email: String,
    /// Trimmed, empty when absent
    pub first_name: String,
    /// Trimmed, empty when absent
    pub last_name: String,
}

/// Reference to a store product
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct ProductRef {
    /// Store product identifier
    pub product_id: String,
}

/// A validated purchase, alive for one pipeline run
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Order {
    /// Order identifier, numbers rendered as strings
    pub order_id: String,
    /// Buyer
    pub customer: Customer,
    /// Distinct product references, in payload order
    pub products: Vec<ProductRef>,
}

/// A parse failure, with whatever identity was extracted before it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderRejection {
    /// `MalformedPayload` or `InvalidOrder`
    pub error: WebhookError,
    /// Order id, when it was read before the failure
    pub order_id: Option<String>,
    /// Normalized email, when it was validated before the failure
    pub customer_email: Option<String>,
}

impl OrderRejection {
    fn malformed(reason: impl Into<String>) -> Self {
        Self {
            error: WebhookError::MalformedPayload(reason.into()),
            order_id: None,
            customer_email: None,
        }
    }

    fn invalid(
        reason: impl Into<String>,
        order_id: Option<&str>,
        customer_email: Option<&str>,
    ) -> Self {
        Self {
            error: WebhookError::InvalidOrder(reason.into()),
            order_id: order_id.map(str::to_string),
            customer_email: customer_email.map(str::to_string),
        }
    }
}

impl std::fmt::Display for OrderRejection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Display::fmt(&self.error, f)
    }
}

impl Order {
    /// Parse and validate a raw body
    pub fn parse(raw: &[u8]) -> Result<Self, OrderRejection> {
        let document: Value =
            serde_json::from_slice(raw).map_err(|e| OrderRejection::malformed(e.to_string()))?;
        Self::from_document(&document)
    }

    /// Validate an already decoded document
    pub fn from_document(document: &Value) -> Result<Self, OrderRejection> {
        let object = document
            .as_object()
            .ok_or_else(|| OrderRejection::malformed("payload must be a JSON object"))?;

        let order_id = match identifier(aliased(object, "order_id", "id")) {
            Identifier::Present(id) => id,
            Identifier::Missing => {
                return Err(OrderRejection::invalid("missing order_id", None, None));
            }
            Identifier::Empty => {
                return Err(OrderRejection::invalid("order_id is empty", None, None));
            }
            Identifier::WrongType => {
                return Err(OrderRejection::invalid(
                    "order_id must be a string or number",
                    None,
                    None,
                ));
            }
        };

        let customer_obj = match object.get("customer") {
            None | Some(Value::Null) => None,
            Some(Value::Object(customer)) => Some(customer),
            Some(_) => {
                return Err(OrderRejection::invalid(
                    "customer must be an object",
                    Some(&order_id),
                    None,
                ));
            }
        };

        let raw_email = customer_obj
            .and_then(|c| c.get("email"))
            .filter(|v| !v.is_null())
            .or_else(|| object.get("email").filter(|v| !v.is_null()));
        let email = match raw_email {
            None => {
                return Err(OrderRejection::invalid(
                    "missing customer email",
                    Some(&order_id),
                    None,
                ));
            }
            Some(Value::String(email)) => normalize_email(email),
            Some(_) => {
                return Err(OrderRejection::invalid(
                    "customer email must be a string",
                    Some(&order_id),
                    None,
                ));
            }
        };
        if !is_valid_email(&email) {
            return Err(OrderRejection::invalid(
                format!("invalid customer email: {email:?}"),
                Some(&order_id),
                None,
            ));
        }

        let first_name = optional_name(customer_obj, "first_name")
            .map_err(|reason| OrderRejection::invalid(reason, Some(&order_id), Some(&email)))?;
        let last_name = optional_name(customer_obj, "last_name")
            .map_err(|reason| OrderRejection::invalid(reason, Some(&order_id), Some(&email)))?;

        let products = product_refs(object)
            .map_err(|reason| OrderRejection::invalid(reason, Some(&order_id), Some(&email)))?;

        Ok(Self {
            order_id,
            customer: Customer {
                email,
                first_name,
                last_name,
            },
            products,
        })
    }
}

/// Identity fields pulled from a body without validating it.
///
/// Used to label audit records for deliveries that never get parsed, such as
/// ones with a bad signature.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PayloadHints {
    /// Order identifier, if one could be read
    pub order_id: Option<String>,
    /// Normalized email, if a valid one could be read
    pub customer_email: Option<String>,
}

impl PayloadHints {
    /// Best-effort extraction; never fails
    pub fn peek(document: &Value) -> Self {
        let Some(object) = document.as_object() else {
            return Self::default();
        };

        let order_id = match identifier(aliased(object, "order_id", "id")) {
            Identifier::Present(id) => Some(id),
            _ => None,
        };
        let customer_email = object
            .get("customer")
            .and_then(|c| c.get("email"))
            .filter(|v| !v.is_null())
            .or_else(|| object.get("email"))
            .and_then(Value::as_str)
            .map(normalize_email)
            .filter(|email| is_valid_email(email));

        Self {
            order_id,
            customer_email,
        }
    }
}

/// `primary`, or `alias` when `primary` is absent or null
fn aliased<'a>(object: &'a Map<String, Value>, primary: &str, alias: &str) -> Option<&'a Value> {
    object
        .get(primary)
        .filter(|v| !v.is_null())
        .or_else(|| object.get(alias))
}

enum Identifier {
    Present(String),
    Missing,
    Empty,
    WrongType,
}

fn identifier(value: Option<&Value>) -> Identifier {
    match value {
        None | Some(Value::Null) => Identifier::Missing,
        Some(Value::String(s)) => {
            let trimmed = s.trim();
            if trimmed.is_empty() {
                Identifier::Empty
            } else {
                Identifier::Present(trimmed.to_string())
            }
        }
        Some(Value::Number(n)) => Identifier::Present(n.to_string()),
        Some(_) => Identifier::WrongType,
    }
}

fn optional_name(customer: Option<&Map<String, Value>>, field: &str) -> Result<String, String> {
    match customer.and_then(|c| c.get(field)) {
        None | Some(Value::Null) => Ok(String::new()),
        Some(Value::String(name)) => Ok(name.trim().to_string()),
        Some(_) => Err(format!("customer {field} must be a string")),
    }
}

fn product_refs(object: &Map<String, Value>) -> Result<Vec<ProductRef>, String> {
    let items = match aliased(object, "products", "line_items") {
        None | Some(Value::Null) => return Err("missing products list".to_string()),
        Some(Value::Array(items)) => items,
        Some(_) => return Err("products must be an array".to_string()),
    };

    if items.is_empty() {
        return Err("products list is empty".to_string());
    }

    let mut seen = HashSet::new();
    let mut products = Vec::with_capacity(items.len());
    for (index, item) in items.iter().enumerate() {
        let product_id = match identifier(item.get("product_id")) {
            Identifier::Present(id) => id,
            Identifier::Missing => return Err(format!("products[{index}] is missing product_id")),
            Identifier::Empty => return Err(format!("products[{index}].product_id is empty")),
            Identifier::WrongType => {
                return Err(format!(
                    "products[{index}].product_id must be a string or number"
                ))
            }
        };
        if seen.insert(product_id.clone()) {
            products.push(ProductRef { product_id });
        }
    }

    Ok(products)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn parse(value: Value) -> Result<Order, OrderRejection> {
        Order::parse(value.to_string().as_bytes())
    }

    #[test]
    fn test_parse_minimal_order() {
        let order = parse(json!({
            "order_id": "ORD-1",
            "customer": {"email": "a@x.com"},
            "products": [{"product_id": "P1"}]
        }))
        .unwrap();

        assert_eq!(order.order_id, "ORD-1");
        assert_eq!(order.customer.email, "a@x.com");
        assert_eq!(order.customer.first_name, "");
        assert_eq!(order.products, vec![ProductRef { product_id: "P1".into() }]);
    }

    #[test]
    fn test_parse_full_order_normalizes_email() {
        let order = parse(json!({
            "order_id": "ORD-78234",
            "customer": {
                "email": "  Dr.Sarah@Example.com ",
                "first_name": "Sarah",
                "last_name": "Johnson"
            },
            "products": [
                {"product_id": "MEDIGEST-CV-001", "title": "Cardiovascular Medicine"},
                {"product_id": "MEDIGEST-GI-002"}
            ]
        }))
        .unwrap();

        assert_eq!(order.customer.email, "dr.sarah@example.com");
        assert_eq!(order.customer.first_name, "Sarah");
        assert_eq!(order.products.len(), 2);
    }

    #[test]
    fn test_shopify_aliases() {
        let order = parse(json!({
            "id": 820982911946154508u64,
            "email": "jon@example.com",
            "customer": {"first_name": "Jon", "last_name": "Snow"},
            "line_items": [{"product_id": 632910392, "sku": "IPOD2008PINK"}]
        }))
        .unwrap();

        assert_eq!(order.order_id, "820982911946154508");
        assert_eq!(order.customer.email, "jon@example.com");
        assert_eq!(order.products[0].product_id, "632910392");
    }

    #[test]
    fn test_null_fields_fall_back_to_aliases() {
        let order = parse(json!({
            "order_id": null,
            "id": 123,
            "customer": {"email": null},
            "email": "jon@example.com",
            "products": null,
            "line_items": [{"product_id": "P1"}]
        }))
        .unwrap();

        assert_eq!(order.order_id, "123");
        assert_eq!(order.customer.email, "jon@example.com");
        assert_eq!(order.products[0].product_id, "P1");

        let hints = PayloadHints::peek(&json!({
            "order_id": null,
            "id": "ORD-7",
            "customer": {"email": null},
            "email": "jon@example.com"
        }));
        assert_eq!(hints.order_id.as_deref(), Some("ORD-7"));
        assert_eq!(hints.customer_email.as_deref(), Some("jon@example.com"));
    }

    #[test]
    fn test_duplicate_products_collapsed() {
        let order = parse(json!({
            "order_id": "ORD-2",
            "customer": {"email": "a@x.com"},
            "products": [{"product_id": "P1"}, {"product_id": "P2"}, {"product_id": "P1"}]
        }))
        .unwrap();

        let ids: Vec<_> = order.products.iter().map(|p| p.product_id.as_str()).collect();
        assert_eq!(ids, vec!["P1", "P2"]);
    }

    #[test]
    fn test_malformed_json() {
        let err = Order::parse(b"{not json").unwrap_err();
        assert!(matches!(err.error, WebhookError::MalformedPayload(_)));
        assert!(err.order_id.is_none());
    }

    #[test]
    fn test_non_object_document() {
        let err = Order::parse(b"[1,2,3]").unwrap_err();
        assert!(matches!(err.error, WebhookError::MalformedPayload(_)));
    }

    #[test]
    fn test_empty_order_id() {
        let err = parse(json!({
            "order_id": "  ",
            "customer": {"email": "a@x.com"},
            "products": [{"product_id": "P1"}]
        }))
        .unwrap_err();
        assert_eq!(
            err.error,
            WebhookError::InvalidOrder("order_id is empty".into())
        );
    }

    #[test]
    fn test_invalid_email_keeps_order_id() {
        let err = parse(json!({
            "order_id": "ORD-3",
            "customer": {"email": "not-an-email"},
            "products": [{"product_id": "P1"}]
        }))
        .unwrap_err();

        assert!(matches!(err.error, WebhookError::InvalidOrder(_)));
        assert_eq!(err.order_id.as_deref(), Some("ORD-3"));
        assert!(err.customer_email.is_none());
    }

    #[test]
    fn test_empty_products() {
        let err = parse(json!({
            "order_id": "ORD-4",
            "customer": {"email": "a@x.com"},
            "products": []
        }))
        .unwrap_err();

        assert_eq!(
            err.error,
            WebhookError::InvalidOrder("products list is empty".into())
        );
        assert_eq!(err.order_id.as_deref(), Some("ORD-4"));
        assert_eq!(err.customer_email.as_deref(), Some("a@x.com"));
    }

    #[test]
    fn test_empty_product_id() {
        let err = parse(json!({
            "order_id": "ORD-5",
            "customer": {"email": "a@x.com"},
            "products": [{"product_id": "P1"}, {"product_id": ""}]
        }))
        .unwrap_err();
        assert_eq!(
            err.error,
            WebhookError::InvalidOrder("products[1].product_id is empty".into())
        );
    }

    #[test]
    fn test_email_validation() {
        assert!(is_valid_email("a@x.com"));
        assert!(is_valid_email("dr.sarah+cme@example.co.uk"));
        assert!(!is_valid_email("a@x"));
        assert!(!is_valid_email("a x@x.com"));
        assert!(!is_valid_email("@x.com"));
        assert!(!is_valid_email(""));
    }

    #[test]
    fn test_peek_hints() {
        let hints = PayloadHints::peek(&json!({
            "order_id": "ORD-78236",
            "customer": {"email": "Invalid@Test.com"}
        }));
        assert_eq!(hints.order_id.as_deref(), Some("ORD-78236"));
        assert_eq!(hints.customer_email.as_deref(), Some("invalid@test.com"));

        assert_eq!(PayloadHints::peek(&json!("garbage")), PayloadHints::default());
    }
}
