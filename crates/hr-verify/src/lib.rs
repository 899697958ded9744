//! HookRelay Signature Verification
//!
//! Pure functions that decide whether an inbound webhook was sent by the
//! source it claims to come from:
//! - GitHub: HMAC-SHA256 of the body, `X-Hub-Signature-256: sha256=<hex>`
//! - Stripe: HMAC-SHA256 of `"{t}.{body}"`, `Stripe-Signature: t=..,v1=..`
//! - SendGrid: ECDSA P-256 over `"{timestamp}{body}"` with the account's
//!   published verification key
//!
//! Every verifier returns `false` for missing or empty inputs and never panics.

pub mod github;
pub mod sendgrid;
pub mod stripe;

use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use subtle::ConstantTimeEq;

use hr_common::{Headers, SourceKind};

pub use github::sign as sign_github;
pub use stripe::sign as sign_stripe;

type HmacSha256 = Hmac<Sha256>;

/// Verify a request for `source` using the clock for time-bounded schemes.
/// `tolerance_secs` bounds timestamp skew where the scheme signs one.
pub fn verify(
    source: SourceKind,
    payload: &[u8],
    headers: &Headers,
    secret: &str,
    tolerance_secs: i64,
) -> bool {
    verify_at(source, payload, headers, secret, Utc::now(), tolerance_secs)
}

/// Verify a request for `source` as of `now`
pub fn verify_at(
    source: SourceKind,
    payload: &[u8],
    headers: &Headers,
    secret: &str,
    now: DateTime<Utc>,
    tolerance_secs: i64,
) -> bool {
    match source {
        SourceKind::GitHub => github::verify(
            payload,
            headers.get_non_empty(github::SIGNATURE_HEADER),
            secret,
        ),
        SourceKind::Stripe => stripe::verify(
            payload,
            headers.get_non_empty(stripe::SIGNATURE_HEADER),
            secret,
            now.timestamp(),
            tolerance_secs,
        ),
        SourceKind::SendGrid => sendgrid::verify(
            payload,
            headers.get_non_empty(sendgrid::TIMESTAMP_HEADER),
            headers.get_non_empty(sendgrid::SIGNATURE_HEADER),
            secret,
        ),
    }
}

/// Lowercase hex HMAC-SHA256 of the concatenated `message` parts keyed by `secret`
pub(crate) fn hmac_sha256_hex(secret: &[u8], message: &[&[u8]]) -> Option<String> {
    let mut mac = HmacSha256::new_from_slice(secret).ok()?;
    for part in message {
        mac.update(part);
    }
    Some(hex::encode(mac.finalize().into_bytes()))
}

/// Constant-time equality; time depends only on length, never on the position
/// of the first differing byte.
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    a.ct_eq(b).into()
}
