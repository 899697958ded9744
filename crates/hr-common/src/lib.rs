use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::str::FromStr;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

// ============================================================================
// Inbound Event Types
// ============================================================================

/// External systems that deliver webhooks to the relay
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    GitHub,
    SendGrid,
    Stripe,
}

impl SourceKind {
    pub const ALL: [SourceKind; 3] = [SourceKind::GitHub, SourceKind::SendGrid, SourceKind::Stripe];

    /// Path segment / config key for this source
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceKind::GitHub => "github",
            SourceKind::SendGrid => "sendgrid",
            SourceKind::Stripe => "stripe",
        }
    }

    /// Provider brand name, written into the `Source` field of sink records
    pub fn display_name(&self) -> &'static str {
        match self {
            SourceKind::GitHub => "GitHub",
            SourceKind::SendGrid => "SendGrid",
            SourceKind::Stripe => "Stripe",
        }
    }
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.display_name())
    }
}

impl FromStr for SourceKind {
    type Err = RelayError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        SourceKind::ALL
            .into_iter()
            .find(|kind| kind.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| RelayError::UnknownSource(s.to_string()))
    }
}

/// Case-insensitive request header mapping. Keys are stored lowercased.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Headers(HashMap<String, String>);

impl Headers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl AsRef<str>, value: impl Into<String>) {
        self.0.insert(name.as_ref().to_ascii_lowercase(), value.into());
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.0.get(&name.to_ascii_lowercase()).map(String::as_str)
    }

    /// Header value, treating an empty string the same as absent
    pub fn get_non_empty(&self, name: &str) -> Option<&str> {
        self.get(name).filter(|v| !v.trim().is_empty())
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

impl<K: AsRef<str>, V: Into<String>> FromIterator<(K, V)> for Headers {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut headers = Headers::new();
        for (k, v) in iter {
            headers.insert(k, v);
        }
        headers
    }
}

/// A webhook request as captured by the HTTP boundary.
///
/// Immutable once constructed; consumed by exactly one integration.
#[derive(Debug, Clone)]
pub struct InboundEvent {
    source: SourceKind,
    raw_body: Bytes,
    headers: Headers,
    received_at: DateTime<Utc>,
}

impl InboundEvent {
    pub fn new(source: SourceKind, raw_body: impl Into<Bytes>, headers: Headers) -> Self {
        Self::with_received_at(source, raw_body, headers, Utc::now())
    }

    pub fn with_received_at(
        source: SourceKind,
        raw_body: impl Into<Bytes>,
        headers: Headers,
        received_at: DateTime<Utc>,
    ) -> Self {
        Self {
            source,
            raw_body: raw_body.into(),
            headers,
            received_at,
        }
    }

    pub fn source(&self) -> SourceKind {
        self.source
    }

    pub fn raw_body(&self) -> &[u8] {
        &self.raw_body
    }

    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    pub fn received_at(&self) -> DateTime<Utc> {
        self.received_at
    }

    /// Body as text, replacing invalid UTF-8 sequences
    pub fn body_text(&self) -> String {
        String::from_utf8_lossy(&self.raw_body).into_owned()
    }

    /// Parse the body as JSON
    pub fn json(&self) -> Result<serde_json::Value> {
        serde_json::from_slice(&self.raw_body)
            .map_err(|e| RelayError::malformed(self.source, e.to_string()))
    }
}

// ============================================================================
// Sink Record Types
// ============================================================================

pub type Fields = IndexMap<String, serde_json::Value>;

/// A generic record addressed to the sink by entity name
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SinkRecord {
    pub object_type: String,
    pub fields: Fields,
}

impl SinkRecord {
    pub fn new(object_type: impl Into<String>) -> Self {
        Self {
            object_type: object_type.into(),
            fields: Fields::new(),
        }
    }

    pub fn set(&mut self, name: impl Into<String>, value: impl Into<serde_json::Value>) {
        self.fields.insert(name.into(), value.into());
    }

    /// Set a field only when a value is present; absent values leave the field out
    pub fn set_opt<V: Into<serde_json::Value>>(&mut self, name: impl Into<String>, value: Option<V>) {
        if let Some(value) = value {
            self.set(name, value);
        }
    }

    pub fn with(mut self, name: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.set(name, value);
        self
    }

    pub fn get(&self, name: &str) -> Option<&serde_json::Value> {
        self.fields.get(name)
    }

    pub fn get_str(&self, name: &str) -> Option<&str> {
        self.get(name).and_then(|v| v.as_str())
    }
}

/// Caller-visible placeholder for a not-yet-committed unit-of-work operation
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ReferenceId(String);

impl ReferenceId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ReferenceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ReferenceId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Field-level error reported by the sink
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldError {
    pub message: String,
    #[serde(default)]
    pub error_code: String,
    #[serde(default)]
    pub fields: Vec<String>,
}

impl FieldError {
    pub fn new(error_code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            error_code: error_code.into(),
            fields: Vec::new(),
        }
    }
}

impl fmt::Display for FieldError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.fields.is_empty() {
            write!(f, "{}: {}", self.error_code, self.message)
        } else {
            write!(f, "{}: {} [{}]", self.error_code, self.message, self.fields.join(", "))
        }
    }
}

/// Outcome of a single operation inside a committed unit of work
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordResult {
    pub id: Option<String>,
    pub success: bool,
    #[serde(default)]
    pub errors: Vec<FieldError>,
}

impl RecordResult {
    pub fn ok(id: impl Into<String>) -> Self {
        Self {
            id: Some(id.into()),
            success: true,
            errors: Vec::new(),
        }
    }

    pub fn failed(errors: Vec<FieldError>) -> Self {
        Self {
            id: None,
            success: false,
            errors,
        }
    }
}

/// Identifier returned by create/update/delete
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SaveResult {
    pub id: String,
}

impl SaveResult {
    pub fn new(id: impl Into<String>) -> Self {
        Self { id: id.into() }
    }
}

/// One page of query results. `done == false` means `next_records_url` must be
/// fetched explicitly to continue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryResult {
    pub total_size: u64,
    pub done: bool,
    #[serde(default)]
    pub records: Vec<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_records_url: Option<String>,
}

// ============================================================================
// Error Types
// ============================================================================

#[derive(Debug, Clone, thiserror::Error)]
pub enum SinkError {
    #[error("Sink authentication failed: {0}")]
    Authentication(String),

    #[error("Sink session expired: {0}")]
    SessionExpired(String),

    #[error("Sink rejected {object_type}: {}", format_errors(.errors))]
    RemoteRejected {
        object_type: String,
        errors: Vec<FieldError>,
    },

    #[error("Unit of work failed: {}", format_uow_errors(.errors))]
    UnitOfWorkFailed {
        errors: BTreeMap<ReferenceId, Vec<FieldError>>,
    },

    #[error("Invalid reference: {0}")]
    InvalidReference(String),

    #[error("Sink transport error: {0}")]
    Transport(String),

    #[error("Unexpected sink response: {0}")]
    Protocol(String),
}

impl SinkError {
    pub fn rejected(object_type: impl Into<String>, errors: Vec<FieldError>) -> Self {
        Self::RemoteRejected {
            object_type: object_type.into(),
            errors,
        }
    }

    /// Failures that a fresh session may fix
    pub fn is_session_expired(&self) -> bool {
        matches!(self, SinkError::SessionExpired(_))
    }

    /// Failures that may succeed if the same request is sent again later
    pub fn is_retryable(&self) -> bool {
        matches!(self, SinkError::SessionExpired(_) | SinkError::Transport(_))
    }

    /// Validation-class errors: resubmitting identical input cannot succeed
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            SinkError::RemoteRejected { .. }
                | SinkError::UnitOfWorkFailed { .. }
                | SinkError::InvalidReference(_)
        )
    }
}

fn format_errors(errors: &[FieldError]) -> String {
    errors.iter().map(ToString::to_string).collect::<Vec<_>>().join("; ")
}

fn format_uow_errors(errors: &BTreeMap<ReferenceId, Vec<FieldError>>) -> String {
    errors
        .iter()
        .map(|(reference, errs)| format!("{} -> {}", reference, format_errors(errs)))
        .collect::<Vec<_>>()
        .join("; ")
}

#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error("Signature verification failed for {source_kind}")]
    VerificationFailed { source_kind: SourceKind },

    #[error("Malformed {source_kind} payload: {reason}")]
    MalformedPayload { source_kind: SourceKind, reason: String },

    #[error("Unknown source: {0}")]
    UnknownSource(String),

    #[error(transparent)]
    Sink(#[from] SinkError),
}

impl RelayError {
    pub fn malformed(source_kind: SourceKind, reason: impl Into<String>) -> Self {
        Self::MalformedPayload {
            source_kind,
            reason: reason.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, RelayError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_source_kind_parse() {
        assert_eq!("github".parse::<SourceKind>().unwrap(), SourceKind::GitHub);
        assert_eq!("SendGrid".parse::<SourceKind>().unwrap(), SourceKind::SendGrid);
        assert_eq!("STRIPE".parse::<SourceKind>().unwrap(), SourceKind::Stripe);
        assert!(matches!(
            "gitlab".parse::<SourceKind>(),
            Err(RelayError::UnknownSource(s)) if s == "gitlab"
        ));
    }

    #[test]
    fn test_headers_case_insensitive() {
        let headers: Headers = [("X-GitHub-Event", "push"), ("Content-Type", "")]
            .into_iter()
            .collect();

        assert_eq!(headers.get("x-github-event"), Some("push"));
        assert_eq!(headers.get("X-GITHUB-EVENT"), Some("push"));
        assert_eq!(headers.get_non_empty("content-type"), None);
        assert_eq!(headers.len(), 2);
    }

    #[test]
    fn test_sink_record_optional_fields_are_omitted() {
        let mut record = SinkRecord::new("Integration");
        record.set("Source", "GitHub");
        record.set_opt::<String>("Sender", None);
        record.set_opt("Action", Some("opened"));

        assert_eq!(record.get_str("Source"), Some("GitHub"));
        assert!(record.get("Sender").is_none());
        assert_eq!(record.fields.keys().collect::<Vec<_>>(), vec!["Source", "Action"]);
    }

    #[test]
    fn test_malformed_json_body() {
        let event = InboundEvent::new(SourceKind::Stripe, "not json", Headers::new());
        assert!(matches!(
            event.json(),
            Err(RelayError::MalformedPayload { source_kind: SourceKind::Stripe, .. })
        ));
    }

    #[test]
    fn test_sink_error_classification() {
        assert!(SinkError::SessionExpired("INVALID_SESSION_ID".into()).is_session_expired());
        assert!(!SinkError::Authentication("bad".into()).is_session_expired());
        assert!(SinkError::rejected("Integration", vec![]).is_validation());
        assert!(!SinkError::Transport("reset".into()).is_validation());
    }

    #[test]
    fn test_field_error_deserializes_sink_shape() {
        let err: FieldError = serde_json::from_value(serde_json::json!({
            "message": "Required fields are missing: [Name]",
            "errorCode": "REQUIRED_FIELD_MISSING",
            "fields": ["Name"]
        }))
        .unwrap();

        assert_eq!(err.error_code, "REQUIRED_FIELD_MISSING");
        assert_eq!(err.to_string(), "REQUIRED_FIELD_MISSING: Required fields are missing: [Name] [Name]");
    }
}
