//! Sink Connector
//!
//! One connector is shared by every integration. The session slot is read
//! without blocking; establishing a session goes through a single async lock
//! so concurrent first use performs one login. Operations clone the session
//! handle and never hold a lock across a network call.

use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::Arc;

use hr_common::{
    FieldError, Fields, QueryResult, RecordResult, ReferenceId, SaveResult, SinkError, SinkRecord,
};
use parking_lot::RwLock;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::transport::{Session, SinkTransport};
use crate::unit_of_work::UnitOfWork;

pub struct SinkConnector {
    transport: Arc<dyn SinkTransport>,
    session: RwLock<Option<Arc<Session>>>,
    connect_lock: Mutex<()>,
}

impl SinkConnector {
    pub fn new(transport: Arc<dyn SinkTransport>) -> Self {
        Self {
            transport,
            session: RwLock::new(None),
            connect_lock: Mutex::new(()),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.session.read().is_some()
    }

    /// Establish a session if none is live. No-op while connected.
    pub async fn ensure_connected(&self) -> Result<(), SinkError> {
        self.session().await.map(|_| ())
    }

    /// Drop the current session; the next operation logs in again
    pub fn disconnect(&self) {
        if self.session.write().take().is_some() {
            info!("Sink session dropped");
        }
    }

    pub async fn create(&self, record: SinkRecord) -> Result<SaveResult, SinkError> {
        let transport = &self.transport;
        let record = &record;
        let result = self
            .with_session("create", |session| async move { transport.create(&session, record).await })
            .await;

        match &result {
            Ok(saved) => debug!(object_type = %record.object_type, id = %saved.id, "Record created"),
            Err(e) => warn!(object_type = %record.object_type, error = %e, "Record create failed"),
        }
        result
    }

    pub async fn update(
        &self,
        object_type: &str,
        id: &str,
        fields: Fields,
    ) -> Result<SaveResult, SinkError> {
        let transport = &self.transport;
        let fields = &fields;
        let result = self
            .with_session("update", |session| async move {
                transport.update(&session, object_type, id, fields).await
            })
            .await;

        if let Err(e) = &result {
            warn!(object_type, id, error = %e, "Record update failed");
        }
        result
    }

    pub async fn delete(&self, object_type: &str, id: &str) -> Result<SaveResult, SinkError> {
        let transport = &self.transport;
        let result = self
            .with_session("delete", |session| async move {
                transport.delete(&session, object_type, id).await
            })
            .await;

        if let Err(e) = &result {
            warn!(object_type, id, error = %e, "Record delete failed");
        }
        result
    }

    /// Run a read-only query. Only the first page is returned; use
    /// `query_more` with `next_records_url` while `done` is false.
    pub async fn query(&self, query: &str) -> Result<QueryResult, SinkError> {
        let transport = &self.transport;
        self.with_session("query", |session| async move { transport.query(&session, query).await })
            .await
    }

    pub async fn query_more(&self, next_records_url: &str) -> Result<QueryResult, SinkError> {
        let transport = &self.transport;
        self.with_session("query_more", |session| async move {
            transport.query_more(&session, next_records_url).await
        })
        .await
    }

    pub fn new_unit_of_work(&self) -> UnitOfWork {
        UnitOfWork::new()
    }

    /// Commit every operation in `unit` atomically. If the sink rejects any
    /// of them nothing is applied and every per-reference error is returned.
    pub async fn commit_unit_of_work(
        &self,
        unit: UnitOfWork,
    ) -> Result<HashMap<ReferenceId, RecordResult>, SinkError> {
        if unit.is_empty() {
            return Ok(HashMap::new());
        }

        let transport = &self.transport;
        let unit = &unit;
        let results = self
            .with_session("commit", |session| async move { transport.commit(&session, unit).await })
            .await?;

        let failures: BTreeMap<ReferenceId, Vec<FieldError>> = results
            .iter()
            .filter(|(_, result)| !result.success)
            .map(|(reference, result)| (reference.clone(), result.errors.clone()))
            .collect();

        if !failures.is_empty() {
            error!(
                operations = unit.len(),
                failed = failures.len(),
                "Unit of work rolled back"
            );
            return Err(SinkError::UnitOfWorkFailed { errors: failures });
        }

        if let Some(missing) = unit.operations().iter().find(|op| !results.contains_key(op.reference_id())) {
            return Err(SinkError::Protocol(format!(
                "no result for reference '{}'",
                missing.reference_id()
            )));
        }

        if let Some((reference, _)) = results.iter().find(|(_, result)| result.id.is_none()) {
            return Err(SinkError::Protocol(format!("no id returned for reference '{}'", reference)));
        }

        debug!(operations = unit.len(), "Unit of work committed");
        Ok(results)
    }

    fn current(&self) -> Option<Arc<Session>> {
        self.session.read().clone()
    }

    async fn session(&self) -> Result<Arc<Session>, SinkError> {
        if let Some(session) = self.current() {
            return Ok(session);
        }

        let _guard = self.connect_lock.lock().await;
        // Another task may have connected while we waited
        if let Some(session) = self.current() {
            return Ok(session);
        }

        let session = match self.transport.login().await {
            Ok(session) => Arc::new(session),
            Err(e) => {
                error!(error = %e, "Sink login failed");
                return Err(e);
            }
        };
        info!(instance_url = %session.instance_url, "Sink session established");

        *self.session.write() = Some(session.clone());
        Ok(session)
    }

    /// Clear the slot only if it still holds the session that failed
    fn invalidate(&self, failed: &Arc<Session>) {
        let mut slot = self.session.write();
        if slot.as_ref().is_some_and(|current| Arc::ptr_eq(current, failed)) {
            *slot = None;
        }
    }

    /// Run `operation` with a live session, reconnecting and retrying exactly
    /// once if the sink reports the session as expired.
    async fn with_session<T, F, Fut>(&self, name: &'static str, operation: F) -> Result<T, SinkError>
    where
        F: Fn(Arc<Session>) -> Fut,
        Fut: Future<Output = Result<T, SinkError>>,
    {
        let session = self.session().await?;
        match operation(session.clone()).await {
            Err(e) if e.is_session_expired() => {
                warn!(operation = name, error = %e, "Sink session expired, reconnecting");
                metrics::counter!("hookrelay_sink_reconnects_total").increment(1);

                self.invalidate(&session);
                let session = self.session().await?;
                operation(session).await
            }
            result => result,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Transport whose create fails with an expired session a set number of times
    struct ExpiringTransport {
        logins: AtomicUsize,
        expirations_left: AtomicUsize,
    }

    impl ExpiringTransport {
        fn new(expirations: usize) -> Self {
            Self {
                logins: AtomicUsize::new(0),
                expirations_left: AtomicUsize::new(expirations),
            }
        }
    }

    #[async_trait]
    impl SinkTransport for ExpiringTransport {
        async fn login(&self) -> Result<Session, SinkError> {
            let n = self.logins.fetch_add(1, Ordering::SeqCst) + 1;
            Ok(Session::new(format!("token-{}", n), "https://sink.test"))
        }

        async fn create(&self, session: &Session, _record: &SinkRecord) -> Result<SaveResult, SinkError> {
            let left = self.expirations_left.load(Ordering::SeqCst);
            if left > 0 {
                self.expirations_left.store(left - 1, Ordering::SeqCst);
                return Err(SinkError::SessionExpired("INVALID_SESSION_ID".to_string()));
            }
            Ok(SaveResult::new(format!("a00-{}", session.access_token)))
        }

        async fn update(&self, _: &Session, _: &str, id: &str, _: &Fields) -> Result<SaveResult, SinkError> {
            Ok(SaveResult::new(id))
        }

        async fn delete(&self, _: &Session, _: &str, id: &str) -> Result<SaveResult, SinkError> {
            Ok(SaveResult::new(id))
        }

        async fn query(&self, _: &Session, _: &str) -> Result<QueryResult, SinkError> {
            Err(SinkError::Protocol("unused".to_string()))
        }

        async fn query_more(&self, _: &Session, _: &str) -> Result<QueryResult, SinkError> {
            Err(SinkError::Protocol("unused".to_string()))
        }

        async fn commit(
            &self,
            _: &Session,
            _: &UnitOfWork,
        ) -> Result<HashMap<ReferenceId, RecordResult>, SinkError> {
            Err(SinkError::Protocol("unused".to_string()))
        }
    }

    #[tokio::test]
    async fn test_retry_uses_fresh_session() {
        let transport = Arc::new(ExpiringTransport::new(1));
        let connector = SinkConnector::new(transport.clone());

        let saved = connector.create(SinkRecord::new("Integration")).await.unwrap();

        assert_eq!(saved.id, "a00-token-2");
        assert_eq!(transport.logins.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_invalidate_ignores_replaced_session() {
        let transport = Arc::new(ExpiringTransport::new(0));
        let connector = SinkConnector::new(transport.clone());

        connector.ensure_connected().await.unwrap();
        let stale = Arc::new(Session::new("old", "https://sink.test"));
        connector.invalidate(&stale);

        assert!(connector.is_connected());
        assert_eq!(transport.logins.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_disconnect_forces_new_login() {
        let transport = Arc::new(ExpiringTransport::new(0));
        let connector = SinkConnector::new(transport.clone());

        connector.ensure_connected().await.unwrap();
        connector.disconnect();
        assert!(!connector.is_connected());

        connector.ensure_connected().await.unwrap();
        assert_eq!(transport.logins.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_empty_unit_does_not_connect() {
        let transport = Arc::new(ExpiringTransport::new(0));
        let connector = SinkConnector::new(transport.clone());

        let results = connector.commit_unit_of_work(connector.new_unit_of_work()).await.unwrap();

        assert!(results.is_empty());
        assert!(!connector.is_connected());
        assert_eq!(transport.logins.load(Ordering::SeqCst), 0);
    }
}
