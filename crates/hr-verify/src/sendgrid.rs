//! SendGrid signed Event Webhook verification
//!
//! SendGrid signs `"{timestamp}{body}"` with ECDSA P-256/SHA-256. The
//! signature header carries a base64 DER `ECDSA-Sig-Value`; the verification
//! key is the base64 DER `SubjectPublicKeyInfo` shown in the SendGrid console.

use base64::engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD};
use base64::Engine;
use jsonwebtoken::{crypto, Algorithm, DecodingKey};

pub const SIGNATURE_HEADER: &str = "x-twilio-email-event-webhook-signature";
pub const TIMESTAMP_HEADER: &str = "x-twilio-email-event-webhook-timestamp";

const SCALAR_LEN: usize = 32;

/// True iff `signature` is a valid ECDSA signature of `timestamp || payload`
/// under `public_key`
pub fn verify(
    payload: &[u8],
    timestamp: Option<&str>,
    signature: Option<&str>,
    public_key: &str,
) -> bool {
    let (Some(timestamp), Some(signature)) = (timestamp, signature) else {
        return false;
    };
    if payload.is_empty() || public_key.trim().is_empty() {
        return false;
    }

    let Some(key) = decoding_key(public_key) else {
        return false;
    };
    let Some(raw_signature) = STANDARD
        .decode(signature.trim())
        .ok()
        .and_then(|der| der_signature_to_fixed(&der))
    else {
        return false;
    };

    let mut message = Vec::with_capacity(timestamp.len() + payload.len());
    message.extend_from_slice(timestamp.trim().as_bytes());
    message.extend_from_slice(payload);

    crypto::verify(
        &URL_SAFE_NO_PAD.encode(raw_signature),
        &message,
        &key,
        Algorithm::ES256,
    )
    .unwrap_or(false)
}

/// Wrap the console's base64 DER key as PEM so the EC point can be extracted
fn decoding_key(public_key: &str) -> Option<DecodingKey> {
    let der = STANDARD.decode(public_key.trim()).ok()?;
    let body = STANDARD.encode(der);

    let mut pem = String::from("-----BEGIN PUBLIC KEY-----\n");
    for line in body.as_bytes().chunks(64) {
        pem.push_str(std::str::from_utf8(line).ok()?);
        pem.push('\n');
    }
    pem.push_str("-----END PUBLIC KEY-----\n");

    DecodingKey::from_ec_pem(pem.as_bytes()).ok()
}

/// Convert `SEQUENCE { INTEGER r, INTEGER s }` to the fixed `r || s` form
fn der_signature_to_fixed(der: &[u8]) -> Option<[u8; 2 * SCALAR_LEN]> {
    let (&tag, rest) = der.split_first()?;
    if tag != 0x30 {
        return None;
    }
    let (&seq_len, rest) = rest.split_first()?;
    if seq_len as usize != rest.len() {
        return None;
    }

    let (r, rest) = der_integer(rest)?;
    let (s, rest) = der_integer(rest)?;
    if !rest.is_empty() {
        return None;
    }

    let mut fixed = [0u8; 2 * SCALAR_LEN];
    fixed[SCALAR_LEN - r.len()..SCALAR_LEN].copy_from_slice(r);
    fixed[2 * SCALAR_LEN - s.len()..].copy_from_slice(s);
    Some(fixed)
}

/// Read one DER INTEGER, returning its big-endian magnitude without sign padding
fn der_integer(input: &[u8]) -> Option<(&[u8], &[u8])> {
    let (&tag, rest) = input.split_first()?;
    if tag != 0x02 {
        return None;
    }
    let (&len, rest) = rest.split_first()?;
    let len = len as usize;
    if len == 0 || len > rest.len() {
        return None;
    }

    let (mut value, rest) = rest.split_at(len);
    while value.len() > 1 && value[0] == 0 {
        value = &value[1..];
    }
    if value.len() > SCALAR_LEN {
        return None;
    }
    Some((value, rest))
}
