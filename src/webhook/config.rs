//! Webhook Configuration
//!
//! All settings come from environment variables; nothing secret is hardcoded.
//!
//! - `WEBHOOK_SIGNING_SECRET` (required): shared HMAC secret
//! - `WEBHOOK_SIGNATURE_HEADER`: header carrying the signature
//!   (default: `x-shopify-hmac-sha256`)
//! - `WEBHOOK_STORE_TIMEOUT_MS`: per store call timeout (default: 5000)
//! - `WEBHOOK_CLAIM_WAIT_MS`: how long a duplicate delivery waits for the
//!   in-flight one (default: 10000)
//! - `WEBHOOK_CLAIM_TTL_SECS`: age at which an in-progress claim is considered
//!   abandoned (default: 300)
//! - `WEBHOOK_MAX_BODY_BYTES`: request body limit (default: 1 MiB)
//! - `WEBHOOK_TRUST_FORWARDED_FOR`: use `X-Forwarded-For` for the source IP
//! - `WEBHOOK_ADMIN_TOKEN`: enables the reporting routes

use std::env;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;
use tracing::warn;

/// Header Shopify uses for the base64 HMAC of the body
pub const DEFAULT_SIGNATURE_HEADER: &str = "x-shopify-hmac-sha256";

/// Configuration errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// Missing required variable
    #[error("{0} environment variable not set")]
    Missing(&'static str),

    /// Variable present but unusable
    #[error("Invalid value for {name}: {reason}")]
    Invalid {
        /// Variable name
        name: &'static str,
        /// Why it was rejected
        reason: String,
    },
}

/// Pipeline configuration, passed explicitly to every component
#[derive(Clone)]
pub struct WebhookConfig {
    signing_secret: Vec<u8>,

    /// Lower-cased header name carrying the signature
    pub signature_header: String,

    /// Deadline for each individual store call
    pub store_timeout: Duration,

    /// How long a concurrent duplicate waits for the first delivery
    pub claim_wait: Duration,

    /// Poll interval while waiting on an in-flight claim
    pub claim_poll_interval: Duration,

    /// Age after which an in-progress claim may be taken over
    pub claim_ttl: Duration,

    /// Request body limit in bytes
    pub max_body_bytes: usize,

    /// Take the source IP from `X-Forwarded-For`
    pub trust_forwarded_for: bool,

    /// Bearer token for the reporting routes, if enabled
    admin_token: Option<String>,
}

impl WebhookConfig {
    /// Configuration with defaults and the given secret
    pub fn new(signing_secret: impl AsRef<[u8]>) -> Self {
        Self {
            signing_secret: signing_secret.as_ref().to_vec(),
            signature_header: DEFAULT_SIGNATURE_HEADER.to_string(),
            store_timeout: Duration::from_millis(5_000),
            claim_wait: Duration::from_millis(10_000),
            claim_poll_interval: Duration::from_millis(50),
            claim_ttl: Duration::from_secs(300),
            max_body_bytes: 1024 * 1024,
            trust_forwarded_for: false,
            admin_token: None,
        }
    }

    /// Load from environment variables
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::Missing` if `WEBHOOK_SIGNING_SECRET` is not set,
    /// and `ConfigError::Invalid` for empty or unparsable values.
    pub fn from_env() -> Result<Self, ConfigError> {
        let secret =
            env::var("WEBHOOK_SIGNING_SECRET").map_err(|_| ConfigError::Missing("WEBHOOK_SIGNING_SECRET"))?;
        if secret.is_empty() {
            return Err(ConfigError::Invalid {
                name: "WEBHOOK_SIGNING_SECRET",
                reason: "secret cannot be empty".to_string(),
            });
        }
        if secret.len() < 16 {
            warn!("SECURITY WARNING: WEBHOOK_SIGNING_SECRET is shorter than 16 characters");
        }

        let mut config = Self::new(secret);

        if let Ok(header) = env::var("WEBHOOK_SIGNATURE_HEADER") {
            config = config.with_signature_header(header);
        }
        if let Some(ms) = parse_var::<u64>("WEBHOOK_STORE_TIMEOUT_MS")? {
            config.store_timeout = positive_millis("WEBHOOK_STORE_TIMEOUT_MS", ms)?;
        }
        if let Some(ms) = parse_var::<u64>("WEBHOOK_CLAIM_WAIT_MS")? {
            config.claim_wait = Duration::from_millis(ms);
        }
        if let Some(secs) = parse_var::<u64>("WEBHOOK_CLAIM_TTL_SECS")? {
            config.claim_ttl = Duration::from_secs(secs);
        }
        if let Some(bytes) = parse_var::<usize>("WEBHOOK_MAX_BODY_BYTES")? {
            config.max_body_bytes = bytes;
        }
        if let Ok(flag) = env::var("WEBHOOK_TRUST_FORWARDED_FOR") {
            config.trust_forwarded_for = matches!(flag.to_lowercase().as_str(), "true" | "1" | "yes");
        }
        if let Ok(token) = env::var("WEBHOOK_ADMIN_TOKEN") {
            if !token.is_empty() {
                config.admin_token = Some(token);
            }
        }

        Ok(config)
    }

    /// Override the signature header name
    pub fn with_signature_header(mut self, header: impl Into<String>) -> Self {
        self.signature_header = header.into().to_lowercase();
        self
    }

    /// Override the per call store timeout
    pub fn with_store_timeout(mut self, timeout: Duration) -> Self {
        self.store_timeout = timeout;
        self
    }

    /// Override how long duplicates wait on an in-flight delivery
    pub fn with_claim_wait(mut self, wait: Duration) -> Self {
        self.claim_wait = wait;
        self
    }

    /// Override the claim takeover age
    pub fn with_claim_ttl(mut self, ttl: Duration) -> Self {
        self.claim_ttl = ttl;
        self
    }

    /// Enable the reporting routes behind a bearer token
    pub fn with_admin_token(mut self, token: impl Into<String>) -> Self {
        self.admin_token = Some(token.into());
        self
    }

    /// The shared HMAC secret
    pub fn signing_secret(&self) -> &[u8] {
        &self.signing_secret
    }

    /// The reporting token, if configured
    pub fn admin_token(&self) -> Option<&str> {
        self.admin_token.as_deref()
    }
}

impl fmt::Debug for WebhookConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WebhookConfig")
            .field("signing_secret", &"[redacted]")
            .field("signature_header", &self.signature_header)
            .field("store_timeout", &self.store_timeout)
            .field("claim_wait", &self.claim_wait)
            .field("claim_poll_interval", &self.claim_poll_interval)
            .field("claim_ttl", &self.claim_ttl)
            .field("max_body_bytes", &self.max_body_bytes)
            .field("trust_forwarded_for", &self.trust_forwarded_for)
            .field("admin_token", &self.admin_token.as_ref().map(|_| "[redacted]"))
            .finish()
    }
}

fn parse_var<T: FromStr>(name: &'static str) -> Result<Option<T>, ConfigError>
where
    T::Err: fmt::Display,
{
    match env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|e| ConfigError::Invalid {
                name,
                reason: e.to_string(),
            }),
        Err(_) => Ok(None),
    }
}

fn positive_millis(name: &'static str, ms: u64) -> Result<Duration, ConfigError> {
    if ms == 0 {
        return Err(ConfigError::Invalid {
            name,
            reason: "timeout cannot be 0".to_string(),
        });
    }
    Ok(Duration::from_millis(ms))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = WebhookConfig::new("s3cr3t");
        assert_eq!(config.signing_secret(), b"s3cr3t");
        assert_eq!(config.signature_header, DEFAULT_SIGNATURE_HEADER);
        assert_eq!(config.store_timeout, Duration::from_secs(5));
        assert!(config.admin_token().is_none());
    }

    #[test]
    fn test_header_is_lowercased() {
        let config = WebhookConfig::new("s3cr3t").with_signature_header("X-Webhook-Signature");
        assert_eq!(config.signature_header, "x-webhook-signature");
    }

    #[test]
    fn test_debug_redacts_secrets() {
        let config = WebhookConfig::new("super-secret-value").with_admin_token("admin-token");
        let rendered = format!("{config:?}");
        assert!(!rendered.contains("super-secret-value"));
        assert!(!rendered.contains("admin-token"));
        assert!(rendered.contains("[redacted]"));
    }

    #[test]
    fn test_zero_timeout_rejected() {
        assert!(positive_millis("WEBHOOK_STORE_TIMEOUT_MS", 0).is_err());
        assert_eq!(
            positive_millis("WEBHOOK_STORE_TIMEOUT_MS", 250).unwrap(),
            Duration::from_millis(250)
        );
    }
}
