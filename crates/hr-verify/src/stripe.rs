//! Stripe `Stripe-Signature` verification
//!
//! Header format: `t=<unix seconds>,v1=<hex>[,v1=<hex>...]`. The signed
//! payload is `"{t}.{body}"`. Secrets rotate, so several `v1` entries may be
//! present; any one matching is enough.

use subtle::{Choice, ConstantTimeEq};

use crate::hmac_sha256_hex;

pub const SIGNATURE_HEADER: &str = "stripe-signature";
pub const DEFAULT_TOLERANCE_SECS: i64 = 300;

/// Header value Stripe would send for `payload` at `timestamp`
pub fn sign(payload: &[u8], secret: &str, timestamp: i64) -> String {
    let t = timestamp.to_string();
    let digest = hmac_sha256_hex(secret.as_bytes(), &[t.as_bytes(), b".", payload]).unwrap_or_default();
    format!("t={},v1={}", t, digest)
}

#[derive(Debug, Default, PartialEq, Eq)]
struct ParsedHeader<'a> {
    timestamp: Option<i64>,
    signatures: Vec<&'a str>,
}

fn parse_header(header: &str) -> ParsedHeader<'_> {
    let mut parsed = ParsedHeader::default();
    for item in header.split(',') {
        match item.trim().split_once('=') {
            Some(("t", value)) => parsed.timestamp = value.parse().ok(),
            Some(("v1", value)) if !value.is_empty() => parsed.signatures.push(value),
            _ => {}
        }
    }
    parsed
}

/// True iff the header carries a fresh timestamp and a matching `v1` signature
pub fn verify(
    payload: &[u8],
    header: Option<&str>,
    secret: &str,
    now: i64,
    tolerance_secs: i64,
) -> bool {
    let Some(header) = header else {
        return false;
    };
    if payload.is_empty() || secret.is_empty() {
        return false;
    }

    let parsed = parse_header(header);
    let Some(timestamp) = parsed.timestamp else {
        return false;
    };
    let tolerance = u64::try_from(tolerance_secs).unwrap_or(0);
    if parsed.signatures.is_empty() || now.abs_diff(timestamp) > tolerance {
        return false;
    }

    let t = timestamp.to_string();
    let Some(expected) = hmac_sha256_hex(secret.as_bytes(), &[t.as_bytes(), b".", payload]) else {
        return false;
    };

    // Check every candidate so timing does not reveal which one matched
    let matched = parsed
        .signatures
        .iter()
        .fold(Choice::from(0), |acc, candidate| {
            acc | candidate.as_bytes().ct_eq(expected.as_bytes())
        });
    matched.into()
}
