use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use hr_common::{Headers, InboundEvent, SourceKind};
use hr_integrations::{Integration, IntegrationRegistry};
use tokio::sync::{broadcast, Notify};
use tracing::{debug, error, info, instrument, warn, Instrument};
use uuid::Uuid;

use crate::metrics::{record_in_flight, record_processing, record_request, UNKNOWN_SOURCE_LABEL};

const REPORT_CAPACITY: usize = 256;

/// Lifecycle states of a dispatched request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchState {
    Received,
    Verifying,
    Rejected,
    Acknowledged,
    Processing,
    Completed,
    Failed,
}

impl DispatchState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, DispatchState::Rejected | DispatchState::Completed | DispatchState::Failed)
    }
}

impl fmt::Display for DispatchState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DispatchState::Received => "received",
            DispatchState::Verifying => "verifying",
            DispatchState::Rejected => "rejected",
            DispatchState::Acknowledged => "acknowledged",
            DispatchState::Processing => "processing",
            DispatchState::Completed => "completed",
            DispatchState::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Answer for the HTTP layer, decided before any sink work starts
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    Accepted { request_id: String },
    Unauthorized,
    Malformed { reason: String },
    UnknownSource(String),
}

impl DispatchOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            DispatchOutcome::Accepted { .. } => "accepted",
            DispatchOutcome::Unauthorized => "unauthorized",
            DispatchOutcome::Malformed { .. } => "malformed",
            DispatchOutcome::UnknownSource(_) => "unknown_source",
        }
    }
}

/// Terminal result of background processing
#[derive(Debug, Clone)]
pub struct DispatchReport {
    pub request_id: String,
    pub source: SourceKind,
    /// `Completed` or `Failed`
    pub state: DispatchState,
    pub record_id: Option<String>,
    pub error: Option<String>,
    pub duration: Duration,
}

impl DispatchReport {
    pub fn is_success(&self) -> bool {
        self.state == DispatchState::Completed
    }
}

/// Decrements the in-flight count when background work ends, panics included
struct InFlightGuard {
    count: Arc<AtomicUsize>,
    idle: Arc<Notify>,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        let remaining = self.count.fetch_sub(1, Ordering::SeqCst) - 1;
        record_in_flight(remaining);
        if remaining == 0 {
            self.idle.notify_waiters();
        }
    }
}

pub struct Dispatcher {
    registry: IntegrationRegistry,
    reports: broadcast::Sender<DispatchReport>,
    in_flight: Arc<AtomicUsize>,
    idle: Arc<Notify>,
}

impl Dispatcher {
    pub fn new(registry: IntegrationRegistry) -> Self {
        let (reports, _) = broadcast::channel(REPORT_CAPACITY);
        Self {
            registry,
            reports,
            in_flight: Arc::new(AtomicUsize::new(0)),
            idle: Arc::new(Notify::new()),
        }
    }

    /// Receive a report for every request that finishes processing
    pub fn subscribe(&self) -> broadcast::Receiver<DispatchReport> {
        self.reports.subscribe()
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    pub fn sources(&self) -> Vec<SourceKind> {
        self.registry.sources().collect()
    }

    /// Verify, acknowledge and hand the request to a background task.
    ///
    /// Returns as soon as the outcome is known; transformation and delivery
    /// have not started when this returns `Accepted`. Must be called from
    /// within a tokio runtime.
    #[instrument(skip(self, raw_body, headers), fields(bytes = raw_body.len()))]
    pub fn dispatch(&self, source: &str, raw_body: Bytes, headers: Headers) -> DispatchOutcome {
        let parsed = source.parse::<SourceKind>().ok();
        let Some((kind, integration)) =
            parsed.and_then(|kind| self.registry.get(kind).map(|integration| (kind, integration)))
        else {
            warn!("Webhook for unknown source");
            // The path segment is caller-controlled, so it never becomes a label
            let label = parsed.map_or(UNKNOWN_SOURCE_LABEL, |kind| kind.as_str());
            record_request(label, "unknown_source");
            return DispatchOutcome::UnknownSource(source.to_string());
        };
        debug!(state = %DispatchState::Received, "Webhook received");

        debug!(state = %DispatchState::Verifying, "Verifying signature");
        if !integration.verify_request(&raw_body, &headers) {
            warn!(state = %DispatchState::Rejected, "Signature verification failed");
            record_request(kind.as_str(), "unauthorized");
            return DispatchOutcome::Unauthorized;
        }

        let event = InboundEvent::new(kind, raw_body, headers);
        if let Err(e) = integration.check_payload(&event) {
            warn!(state = %DispatchState::Rejected, error = %e, "Malformed payload");
            record_request(kind.as_str(), "malformed");
            return DispatchOutcome::Malformed { reason: e.to_string() };
        }

        let request_id = Uuid::new_v4().to_string();
        info!(request_id = %request_id, state = %DispatchState::Acknowledged, "Webhook acknowledged");
        record_request(kind.as_str(), "accepted");

        self.spawn_processing(integration, event, request_id.clone());
        DispatchOutcome::Accepted { request_id }
    }

    /// Wait until no request is processing. Never cancels work; returns
    /// false if `timeout` elapses first.
    pub async fn drain(&self, timeout: Duration) -> bool {
        let wait = async {
            loop {
                let idle = self.idle.notified();
                if self.in_flight() == 0 {
                    return;
                }
                idle.await;
            }
        };

        match tokio::time::timeout(timeout, wait).await {
            Ok(()) => true,
            Err(_) => {
                warn!(in_flight = self.in_flight(), "Drain timed out with requests still processing");
                false
            }
        }
    }

    fn spawn_processing(&self, integration: Arc<dyn Integration>, event: InboundEvent, request_id: String) {
        let count = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        record_in_flight(count);
        let guard = InFlightGuard {
            count: self.in_flight.clone(),
            idle: self.idle.clone(),
        };

        let source = event.source();
        let span = tracing::info_span!("process", request_id = %request_id, source = %source);
        let started = Instant::now();

        let work = tokio::spawn(
            async move {
                debug!(state = %DispatchState::Processing, "Processing webhook");
                integration.process(&event).await
            }
            .instrument(span.clone()),
        );

        // Supervisor: the source has been answered, so the outcome is only logged and reported
        let reports = self.reports.clone();
        tokio::spawn(
            async move {
                let _guard = guard;
                let (state, record_id, error) = match work.await {
                    Ok(Ok(saved)) => {
                        info!(state = %DispatchState::Completed, record_id = %saved.id, "Webhook processed");
                        (DispatchState::Completed, Some(saved.id), None)
                    }
                    Ok(Err(e)) => {
                        error!(state = %DispatchState::Failed, error = %e, "Webhook processing failed");
                        (DispatchState::Failed, None, Some(e.to_string()))
                    }
                    Err(e) => {
                        error!(state = %DispatchState::Failed, error = %e, "Webhook processing task panicked");
                        (DispatchState::Failed, None, Some(format!("processing task aborted: {}", e)))
                    }
                };

                record_processing(source.as_str(), state == DispatchState::Completed);
                let _ = reports.send(DispatchReport {
                    request_id,
                    source,
                    state,
                    record_id,
                    error,
                    duration: started.elapsed(),
                });
            }
            .instrument(span),
        );
    }
}
