//! GitHub `X-Hub-Signature-256` verification

use crate::{constant_time_eq, hmac_sha256_hex};

pub const SIGNATURE_HEADER: &str = "x-hub-signature-256";
pub const EVENT_HEADER: &str = "x-github-event";
pub const DELIVERY_HEADER: &str = "x-github-delivery";

/// Header value GitHub would send for `payload` signed with `secret`
pub fn sign(payload: &[u8], secret: &str) -> String {
    let digest = hmac_sha256_hex(secret.as_bytes(), &[payload]).unwrap_or_default();
    format!("sha256={}", digest)
}

/// True iff `signature` equals `sha256=<hex hmac>` byte for byte
pub fn verify(payload: &[u8], signature: Option<&str>, secret: &str) -> bool {
    let Some(signature) = signature else {
        return false;
    };
    if payload.is_empty() || secret.is_empty() {
        return false;
    }

    let expected = sign(payload, secret);
    constant_time_eq(signature.trim().as_bytes(), expected.as_bytes())
}
