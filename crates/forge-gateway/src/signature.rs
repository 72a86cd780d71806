//! Webhook signature verification (`X-Hub-Signature-256`).
//!
//! GitHub signs the raw request body with HMAC-SHA256 and sends
//! `sha256=<lowercase hex>`. Verification is fail-closed: anything other
//! than an exact match is a rejection, never an error that skips the check.

use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

pub const SIGNATURE_HEADER: &str = "x-hub-signature-256";
const PREFIX: &str = "sha256=";

/// Render the signature header value GitHub would send for `body`.
pub fn sign(secret: &str, body: &[u8]) -> String {
    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC accepts keys of any length");
    mac.update(body);
    format!("{}{}", PREFIX, hex::encode(mac.finalize().into_bytes()))
}

/// Check `header` against the HMAC of `body` under `secret`.
pub fn verify(secret: &str, body: &[u8], header: Option<&str>) -> bool {
    let Some(provided) = header else {
        return false;
    };
    if secret.is_empty() || !provided.starts_with(PREFIX) {
        return false;
    }
    let expected = sign(secret, body);
    constant_time_eq(expected.as_bytes(), provided.as_bytes())
}

/// Length check first, then XOR-accumulate over every byte.
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff: u8 = 0;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}
