//! Connector Tests
//!
//! Tests for:
//! - Lazy, idempotent connection and single login under concurrent first use
//! - Reconnect-once on an expired session
//! - Error classification (validation errors are never retried)
//! - All-or-nothing unit of work commits
//! - Explicit query paging

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};

use hr_sink::{
    FieldError, Fields, Operation, QueryResult, RecordResult, ReferenceId, SaveResult, Session,
    SinkConnector, SinkError, SinkRecord, SinkTransport, UnitOfWork,
};

const PAGE_SIZE: usize = 2;

/// In-memory sink. Records without a `Name` are rejected; commits are applied
/// only when every operation is valid.
struct MockSink {
    logins: AtomicUsize,
    login_delay: Duration,
    reject_login: bool,
    expire_next: AtomicUsize,
    create_attempts: AtomicUsize,
    records: parking_lot::Mutex<Vec<(String, SinkRecord)>>,
}

impl MockSink {
    fn new() -> Self {
        Self {
            logins: AtomicUsize::new(0),
            login_delay: Duration::ZERO,
            reject_login: false,
            expire_next: AtomicUsize::new(0),
            create_attempts: AtomicUsize::new(0),
            records: parking_lot::Mutex::new(Vec::new()),
        }
    }

    fn with_login_delay(mut self, delay: Duration) -> Self {
        self.login_delay = delay;
        self
    }

    fn rejecting_login(mut self) -> Self {
        self.reject_login = true;
        self
    }

    fn expire_sessions(self, count: usize) -> Self {
        self.expire_next.store(count, Ordering::SeqCst);
        self
    }

    fn logins(&self) -> usize {
        self.logins.load(Ordering::SeqCst)
    }

    fn create_attempts(&self) -> usize {
        self.create_attempts.load(Ordering::SeqCst)
    }

    fn stored(&self) -> Vec<(String, SinkRecord)> {
        self.records.lock().clone()
    }

    fn take_expiry(&self) -> bool {
        self.expire_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    fn validate(record: &SinkRecord) -> Result<(), FieldError> {
        match record.get_str("Name") {
            Some(name) if !name.is_empty() => Ok(()),
            _ => Err(FieldError {
                message: "Required fields are missing: [Name]".to_string(),
                error_code: "REQUIRED_FIELD_MISSING".to_string(),
                fields: vec!["Name".to_string()],
            }),
        }
    }

    fn store(&self, mut record: SinkRecord, resolved: &HashMap<String, String>) -> String {
        for value in record.fields.values_mut() {
            if let Some(id) = value.as_str().and_then(|s| resolved.get(s)) {
                *value = Value::String(id.clone());
            }
        }
        let mut records = self.records.lock();
        let id = format!("a0{:03}", records.len() + 1);
        records.push((id.clone(), record));
        id
    }
}

#[async_trait]
impl SinkTransport for MockSink {
    async fn login(&self) -> Result<Session, SinkError> {
        if !self.login_delay.is_zero() {
            tokio::time::sleep(self.login_delay).await;
        }
        let n = self.logins.fetch_add(1, Ordering::SeqCst) + 1;
        if self.reject_login {
            return Err(SinkError::Authentication("invalid_grant: authentication failure".to_string()));
        }
        Ok(Session::new(format!("token-{}", n), "https://sink.test"))
    }

    async fn create(&self, _session: &Session, record: &SinkRecord) -> Result<SaveResult, SinkError> {
        self.create_attempts.fetch_add(1, Ordering::SeqCst);
        if self.take_expiry() {
            return Err(SinkError::SessionExpired("Session expired or invalid".to_string()));
        }
        Self::validate(record).map_err(|e| SinkError::rejected(&record.object_type, vec![e]))?;
        Ok(SaveResult::new(self.store(record.clone(), &HashMap::new())))
    }

    async fn update(&self, _: &Session, _: &str, id: &str, _: &Fields) -> Result<SaveResult, SinkError> {
        Ok(SaveResult::new(id))
    }

    async fn delete(&self, _: &Session, _: &str, id: &str) -> Result<SaveResult, SinkError> {
        Ok(SaveResult::new(id))
    }

    async fn query(&self, _: &Session, _query: &str) -> Result<QueryResult, SinkError> {
        Ok(self.page(0))
    }

    async fn query_more(&self, _: &Session, next_records_url: &str) -> Result<QueryResult, SinkError> {
        let offset = next_records_url
            .rsplit('-')
            .next()
            .and_then(|n| n.parse().ok())
            .ok_or_else(|| SinkError::Protocol(format!("bad cursor {}", next_records_url)))?;
        Ok(self.page(offset))
    }

    async fn commit(
        &self,
        _: &Session,
        unit: &UnitOfWork,
    ) -> Result<HashMap<ReferenceId, RecordResult>, SinkError> {
        if self.take_expiry() {
            return Err(SinkError::SessionExpired("Session expired or invalid".to_string()));
        }

        let invalid: HashMap<&ReferenceId, FieldError> = unit
            .operations()
            .iter()
            .filter_map(|op| match op {
                Operation::Create { reference_id, record } => {
                    Self::validate(record).err().map(|e| (reference_id, e))
                }
                _ => None,
            })
            .collect();

        if !invalid.is_empty() {
            return Ok(unit
                .operations()
                .iter()
                .map(|op| {
                    let error = invalid.get(op.reference_id()).cloned().unwrap_or_else(|| {
                        FieldError::new("PROCESSING_HALTED", "The transaction was rolled back")
                    });
                    (op.reference_id().clone(), RecordResult::failed(vec![error]))
                })
                .collect());
        }

        let mut resolved = HashMap::new();
        let mut results = HashMap::new();
        for op in unit.operations() {
            let id = match op {
                Operation::Create { record, .. } => self.store(record.clone(), &resolved),
                other => other.target_id().unwrap_or_default().to_string(),
            };
            let placeholder = UnitOfWork::reference(op.reference_id());
            if let Some(placeholder) = placeholder.as_str() {
                resolved.insert(placeholder.to_string(), id.clone());
            }
            results.insert(op.reference_id().clone(), RecordResult::ok(id));
        }
        Ok(results)
    }
}

impl MockSink {
    fn page(&self, offset: usize) -> QueryResult {
        let records = self.records.lock();
        let page: Vec<Value> = records
            .iter()
            .skip(offset)
            .take(PAGE_SIZE)
            .map(|(id, record)| json!({ "Id": id, "Name": record.get("Name") }))
            .collect();
        let end = offset + page.len();
        let done = end >= records.len();

        QueryResult {
            total_size: records.len() as u64,
            done,
            records: page,
            next_records_url: (!done).then(|| format!("/services/data/v59.0/query/01g-{}", end)),
        }
    }
}

fn integration(name: &str) -> SinkRecord {
    SinkRecord::new("Integration").with("Name", name).with("Source", "GitHub")
}

fn setup(sink: MockSink) -> (Arc<SinkConnector>, Arc<MockSink>) {
    let sink = Arc::new(sink);
    (Arc::new(SinkConnector::new(sink.clone())), sink)
}

// ============================================================================
// Connection Tests
// ============================================================================

#[tokio::test]
async fn test_connection_is_lazy_and_idempotent() {
    let (connector, sink) = setup(MockSink::new());

    let _unit = connector.new_unit_of_work();
    assert!(!connector.is_connected());
    assert_eq!(sink.logins(), 0);

    connector.ensure_connected().await.unwrap();
    connector.ensure_connected().await.unwrap();
    connector.create(integration("a")).await.unwrap();

    assert!(connector.is_connected());
    assert_eq!(sink.logins(), 1);
}

#[tokio::test]
async fn test_concurrent_first_use_logs_in_once() {
    let (connector, sink) = setup(MockSink::new().with_login_delay(Duration::from_millis(50)));

    let tasks: Vec<_> = (0..10)
        .map(|i| {
            let connector = connector.clone();
            tokio::spawn(async move { connector.create(integration(&format!("r{}", i))).await })
        })
        .collect();

    for result in futures::future::join_all(tasks).await {
        result.unwrap().unwrap();
    }

    assert_eq!(sink.logins(), 1);
    assert_eq!(sink.stored().len(), 10);
}

#[tokio::test]
async fn test_authentication_failure_surfaces() {
    let (connector, sink) = setup(MockSink::new().rejecting_login());

    let err = connector.ensure_connected().await.unwrap_err();
    assert!(matches!(err, SinkError::Authentication(_)));
    assert!(!connector.is_connected());

    let err = connector.create(integration("a")).await.unwrap_err();
    assert!(matches!(err, SinkError::Authentication(_)));
    assert_eq!(sink.create_attempts(), 0);
}

// ============================================================================
// Reconnect Tests
// ============================================================================

#[tokio::test]
async fn test_expired_session_reconnects_once_and_succeeds() {
    let (connector, sink) = setup(MockSink::new().expire_sessions(1));

    let saved = connector.create(integration("after-expiry")).await.unwrap();

    assert_eq!(saved.id, "a0001");
    assert_eq!(sink.logins(), 2);
    assert_eq!(sink.create_attempts(), 2);
    assert_eq!(sink.stored().len(), 1);
}

#[tokio::test]
async fn test_second_expiry_surfaces_unchanged() {
    let (connector, sink) = setup(MockSink::new().expire_sessions(2));

    let err = connector.create(integration("doomed")).await.unwrap_err();

    assert!(err.is_session_expired());
    assert_eq!(sink.logins(), 2);
    assert_eq!(sink.create_attempts(), 2);
    assert!(sink.stored().is_empty());
}

#[tokio::test]
async fn test_validation_error_is_not_retried() {
    let (connector, sink) = setup(MockSink::new());

    let err = connector
        .create(SinkRecord::new("Integration").with("Source", "Stripe"))
        .await
        .unwrap_err();

    match err {
        SinkError::RemoteRejected { object_type, errors } => {
            assert_eq!(object_type, "Integration");
            assert_eq!(errors[0].error_code, "REQUIRED_FIELD_MISSING");
            assert_eq!(errors[0].fields, vec!["Name"]);
        }
        other => panic!("expected RemoteRejected, got {:?}", other),
    }
    assert_eq!(sink.create_attempts(), 1);
    assert_eq!(sink.logins(), 1);
}

// ============================================================================
// Unit of Work Tests
// ============================================================================

#[tokio::test]
async fn test_unit_of_work_resolves_references() {
    let (connector, sink) = setup(MockSink::new());

    let mut unit = connector.new_unit_of_work();
    let parent = unit.register_create(integration("batch")).unwrap();
    let child = unit
        .register_create(
            SinkRecord::new("Integration_Event")
                .with("Name", "delivered")
                .with("Integration", UnitOfWork::reference(&parent)),
        )
        .unwrap();

    let results = connector.commit_unit_of_work(unit).await.unwrap();

    assert_eq!(results.len(), 2);
    let parent_id = results[&parent].id.clone().unwrap();
    assert!(results[&child].success);

    let stored = sink.stored();
    assert_eq!(stored[1].1.get_str("Integration"), Some(parent_id.as_str()));
}

#[tokio::test]
async fn test_unit_of_work_is_all_or_nothing() {
    let (connector, sink) = setup(MockSink::new());

    let mut unit = connector.new_unit_of_work();
    let good = unit.register_create(integration("fine")).unwrap();
    let bad = unit
        .register_create(SinkRecord::new("Integration_Event").with("Integration", UnitOfWork::reference(&good)))
        .unwrap();

    let err = connector.commit_unit_of_work(unit).await.unwrap_err();

    match err {
        SinkError::UnitOfWorkFailed { errors } => {
            assert_eq!(errors.len(), 2);
            assert_eq!(errors[&bad][0].error_code, "REQUIRED_FIELD_MISSING");
            assert_eq!(errors[&good][0].error_code, "PROCESSING_HALTED");
        }
        other => panic!("expected UnitOfWorkFailed, got {:?}", other),
    }

    // Neither operation's effect is observable
    assert!(sink.stored().is_empty());
    let page = connector.query("SELECT Id, Name FROM Integration").await.unwrap();
    assert_eq!(page.total_size, 0);
}

#[tokio::test]
async fn test_unit_of_work_commit_reconnects_on_expiry() {
    let (connector, sink) = setup(MockSink::new());
    connector.ensure_connected().await.unwrap();
    sink.expire_next.store(1, Ordering::SeqCst);

    let mut unit = connector.new_unit_of_work();
    unit.register_create(integration("x")).unwrap();
    let results = connector.commit_unit_of_work(unit).await.unwrap();

    assert_eq!(results.len(), 1);
    assert_eq!(sink.logins(), 2);
}

// ============================================================================
// Query Tests
// ============================================================================

#[tokio::test]
async fn test_query_pages_are_fetched_explicitly() {
    let (connector, _sink) = setup(MockSink::new());
    for i in 0..5 {
        connector.create(integration(&format!("r{}", i))).await.unwrap();
    }

    let first = connector.query("SELECT Id, Name FROM Integration").await.unwrap();
    assert_eq!(first.total_size, 5);
    assert_eq!(first.records.len(), PAGE_SIZE);
    assert!(!first.done);

    let mut names = Vec::new();
    let mut page = first;
    loop {
        names.extend(page.records.iter().filter_map(|r| r["Name"].as_str().map(str::to_string)));
        match page.next_records_url.clone() {
            Some(next) if !page.done => page = connector.query_more(&next).await.unwrap(),
            _ => break,
        }
    }

    assert_eq!(names, vec!["r0", "r1", "r2", "r3", "r4"]);
}
