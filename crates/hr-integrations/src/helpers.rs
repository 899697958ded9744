//! Building blocks shared by every integration

use chrono::{DateTime, SecondsFormat, Utc};
use hr_common::{Headers, InboundEvent, RelayError, Result, SaveResult, SinkRecord, SourceKind};
use hr_config::{secret_env_var, ConfigError, SourceConfig, VerificationPolicy};
use hr_sink::SinkConnector;
use serde_json::Value;
use tracing::{debug, warn};

/// Sink entity every inbound webhook is recorded as
pub const INTEGRATION_OBJECT: &str = "Integration";

pub fn iso8601(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// ISO-8601 rendering of a unix timestamp in seconds
pub fn epoch_to_iso(seconds: i64) -> Option<String> {
    DateTime::from_timestamp(seconds, 0).map(iso8601)
}

/// Fields common to every integration record
pub fn base_record(event: &InboundEvent) -> SinkRecord {
    let source = event.source().display_name();
    let received_at = iso8601(event.received_at());

    SinkRecord::new(INTEGRATION_OBJECT)
        .with("Name", format!("{} {}", source, received_at))
        .with("Source", source)
        .with("Raw_Payload", event.body_text())
        .with("Status", "received")
        .with("Received_At", received_at)
}

/// Create `record` through the shared connector
pub async fn deliver_record(connector: &SinkConnector, record: SinkRecord) -> Result<SaveResult> {
    let object_type = record.object_type.clone();
    let saved = connector.create(record).await?;
    debug!(object_type = %object_type, id = %saved.id, "Record delivered");
    Ok(saved)
}

/// Parse the body and require a top-level JSON object
pub fn json_object(event: &InboundEvent) -> Result<Value> {
    let payload = event.json()?;
    if payload.is_object() {
        Ok(payload)
    } else {
        Err(RelayError::malformed(event.source(), "expected a JSON object"))
    }
}

/// String at a JSON pointer, skipping empty strings
pub fn str_at(value: &Value, pointer: &str) -> Option<String> {
    value
        .pointer(pointer)
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

/// Apply the source's verification policy around a scheme-specific check
pub fn verify_with_policy(
    source: SourceKind,
    config: &SourceConfig,
    check: impl FnOnce(&str) -> bool,
) -> bool {
    match config.verification {
        VerificationPolicy::Disabled => {
            warn!(source = %source, "Signature verification disabled, accepting unverified request");
            true
        }
        VerificationPolicy::Enforce => config.secret().is_some_and(check),
    }
}

/// Check a request with the source's own scheme, secret and skew tolerance
pub fn verify_source(source: SourceKind, config: &SourceConfig, raw_payload: &[u8], headers: &Headers) -> bool {
    verify_with_policy(source, config, |secret| {
        hr_verify::verify(source, raw_payload, headers, secret, config.tolerance_secs)
    })
}

/// Enforcing sources cannot run without a secret
pub fn require_secret(source: SourceKind, config: &SourceConfig) -> std::result::Result<(), ConfigError> {
    if config.verification == VerificationPolicy::Enforce && config.secret().is_none() {
        return Err(ConfigError::Missing(format!(
            "{} secret ({}) is required while verification is enforced",
            source,
            secret_env_var(source)
        )));
    }
    Ok(())
}
