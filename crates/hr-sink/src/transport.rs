use std::collections::HashMap;
use std::fmt;

use async_trait::async_trait;
use hr_common::{Fields, QueryResult, RecordResult, ReferenceId, SaveResult, SinkError, SinkRecord};

use crate::unit_of_work::UnitOfWork;

/// Access token and instance endpoint issued by a successful login
#[derive(Clone, PartialEq, Eq)]
pub struct Session {
    pub access_token: String,
    pub instance_url: String,
}

impl Session {
    pub fn new(access_token: impl Into<String>, instance_url: impl Into<String>) -> Self {
        Self {
            access_token: access_token.into(),
            instance_url: instance_url.into(),
        }
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("access_token", &"<redacted>")
            .field("instance_url", &self.instance_url)
            .finish()
    }
}

/// Wire-level operations against the sink. Implementations perform exactly
/// one request per call; session reuse and retries belong to the connector.
///
/// An invalid or expired session must be reported as
/// `SinkError::SessionExpired` so the connector can reconnect.
#[async_trait]
pub trait SinkTransport: Send + Sync {
    async fn login(&self) -> Result<Session, SinkError>;

    async fn create(&self, session: &Session, record: &SinkRecord) -> Result<SaveResult, SinkError>;

    async fn update(
        &self,
        session: &Session,
        object_type: &str,
        id: &str,
        fields: &Fields,
    ) -> Result<SaveResult, SinkError>;

    async fn delete(&self, session: &Session, object_type: &str, id: &str) -> Result<SaveResult, SinkError>;

    async fn query(&self, session: &Session, query: &str) -> Result<QueryResult, SinkError>;

    async fn query_more(&self, session: &Session, next_records_url: &str) -> Result<QueryResult, SinkError>;

    /// Submit every operation of `unit` as one all-or-none transaction.
    /// Per-operation failures are returned in the map, not as an error.
    async fn commit(
        &self,
        session: &Session,
        unit: &UnitOfWork,
    ) -> Result<HashMap<ReferenceId, RecordResult>, SinkError>;
}
