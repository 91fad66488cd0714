//! Webhook signature verification
//!
//! Senders sign the raw request body with HMAC-SHA256 keyed by the shared
//! secret and send it as `X-Hub-Signature-256: sha256=<hex>`.

use hmac::{Hmac, Mac};
use secrecy::{ExposeSecret, SecretString};
use sha2::Sha256;

use crate::errors::IntakeError;

type HmacSha256 = Hmac<Sha256>;

/// Header carrying the body signature
pub const SIGNATURE_HEADER: &str = "x-hub-signature-256";

const SIGNATURE_PREFIX: &str = "sha256=";

/// Verify `header` against the HMAC of `body`.
///
/// The digest comparison runs in constant time.
pub fn verify_signature(
    secret: &SecretString,
    body: &[u8],
    header: Option<&str>,
) -> Result<(), IntakeError> {
    let header = header
        .map(str::trim)
        .filter(|h| !h.is_empty())
        .ok_or_else(|| IntakeError::InvalidSignature("missing signature header".to_string()))?;

    let digest_hex = header.strip_prefix(SIGNATURE_PREFIX).ok_or_else(|| {
        IntakeError::InvalidSignature(format!("expected {SIGNATURE_PREFIX}<hex> signature"))
    })?;

    let expected = hex::decode(digest_hex)
        .map_err(|e| IntakeError::InvalidSignature(format!("signature is not hex: {}", e)))?;

    let mut mac = new_mac(secret.expose_secret().as_bytes())?;
    mac.update(body);
    mac.verify_slice(&expected)
        .map_err(|_| IntakeError::InvalidSignature("signature mismatch".to_string()))
}

/// Compute the `sha256=<hex>` header value for `body`
pub fn sign(secret: &[u8], body: &[u8]) -> Result<String, IntakeError> {
    let mut mac = new_mac(secret)?;
    mac.update(body);
    Ok(format!(
        "{SIGNATURE_PREFIX}{}",
        hex::encode(mac.finalize().into_bytes())
    ))
}

fn new_mac(key: &[u8]) -> Result<HmacSha256, IntakeError> {
    HmacSha256::new_from_slice(key).map_err(|e| IntakeError::InvalidSignature(e.to_string()))
}
