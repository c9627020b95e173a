//! HMAC-SHA256 Signature Verification
//!
//! The sender signs the exact request body with the shared secret and puts
//! the digest in a header, base64 encoded (Shopify style) or hex encoded.
//! Verification runs over the raw bytes captured before any parsing, and the
//! digest comparison is constant time.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// Length in bytes of an HMAC-SHA256 digest
const DIGEST_LEN: usize = 32;

/// Verifies webhook signatures against a shared secret
#[derive(Clone)]
pub struct SignatureVerifier {
    secret: Vec<u8>,
}

impl SignatureVerifier {
    /// Create a verifier for the given secret
    pub fn new(secret: impl AsRef<[u8]>) -> Self {
        Self {
            secret: secret.as_ref().to_vec(),
        }
    }

    fn mac(&self) -> HmacSha256 {
        match HmacSha256::new_from_slice(&self.secret) {
            Ok(mac) => mac,
            Err(_) => unreachable!("HMAC accepts keys of any size"),
        }
    }

    /// Check `signature` against the body.
    ///
    /// Absent, undecodable or wrong-length signatures are simply invalid.
    pub fn verify(&self, body: &[u8], signature: Option<&str>) -> bool {
        let Some(provided) = signature.and_then(decode_signature) else {
            return false;
        };

        let mut mac = self.mac();
        mac.update(body);
        mac.verify_slice(&provided).is_ok()
    }

    /// Raw digest of the body
    pub fn digest(&self, body: &[u8]) -> [u8; DIGEST_LEN] {
        let mut mac = self.mac();
        mac.update(body);
        let mut digest = [0u8; DIGEST_LEN];
        digest.copy_from_slice(&mac.finalize().into_bytes());
        digest
    }

    /// Base64 signature, as the sender would put in the header
    pub fn sign(&self, body: &[u8]) -> String {
        BASE64.encode(self.digest(body))
    }

    /// Hex signature
    pub fn sign_hex(&self, body: &[u8]) -> String {
        hex::encode(self.digest(body))
    }
}

impl std::fmt::Debug for SignatureVerifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SignatureVerifier")
            .field("secret", &"[redacted]")
            .finish()
    }
}

/// Decode a header value as hex or base64, keeping only digest-sized results
fn decode_signature(value: &str) -> Option<Vec<u8>> {
    let value = value.trim();
    if value.is_empty() {
        return None;
    }

    // A 64 char hex string is also valid base64 (48 bytes), so try hex first.
    if value.len() == DIGEST_LEN * 2 {
        if let Ok(bytes) = hex::decode(value) {
            return Some(bytes);
        }
    }

    BASE64
        .decode(value)
        .ok()
        .filter(|bytes| bytes.len() == DIGEST_LEN)
}
