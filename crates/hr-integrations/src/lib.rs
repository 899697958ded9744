//! HookRelay Integrations
//!
//! One `Integration` per webhook source. Each integration checks the
//! request signature with its own secret, turns the payload into sink
//! records and delivers them through the shared `SinkConnector`.

pub mod github;
pub mod helpers;
pub mod sendgrid;
pub mod stripe;

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use hr_common::{Headers, InboundEvent, Result, SaveResult, SinkRecord, SourceKind};
use hr_config::{ConfigError, SourcesConfig};
use hr_sink::SinkConnector;
use tracing::info;

pub use github::GitHubIntegration;
pub use helpers::{base_record, deliver_record, INTEGRATION_OBJECT};
pub use sendgrid::SendGridIntegration;
pub use stripe::StripeIntegration;

#[async_trait]
pub trait Integration: Send + Sync {
    fn source(&self) -> SourceKind;

    /// Signature check for this source. Pure apart from reading the clock
    /// for timestamped schemes; never fails, only answers.
    fn verify_request(&self, raw_payload: &[u8], headers: &Headers) -> bool;

    /// Map an event to its sink record. Deterministic for a given event.
    fn transform(&self, event: &InboundEvent) -> Result<SinkRecord>;

    fn connector(&self) -> &SinkConnector;

    /// Top-level shape check run before the request is acknowledged. Builds
    /// no record; `transform` runs only once processing starts.
    fn check_payload(&self, event: &InboundEvent) -> Result<()> {
        helpers::json_object(event).map(|_| ())
    }

    /// Transform the event and deliver it to the sink
    async fn process(&self, event: &InboundEvent) -> Result<SaveResult> {
        let record = self.transform(event)?;
        deliver_record(self.connector(), record).await
    }
}

/// Integrations keyed by the source they handle
#[derive(Default, Clone)]
pub struct IntegrationRegistry {
    integrations: BTreeMap<SourceKind, Arc<dyn Integration>>,
}

impl IntegrationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build an integration for every enabled source
    pub fn from_config(
        sources: &SourcesConfig,
        connector: Arc<SinkConnector>,
    ) -> std::result::Result<Self, ConfigError> {
        let mut registry = Self::new();
        for (kind, config) in sources.enabled() {
            let integration: Arc<dyn Integration> = match kind {
                SourceKind::GitHub => Arc::new(GitHubIntegration::new(config.clone(), connector.clone())?),
                SourceKind::SendGrid => Arc::new(SendGridIntegration::new(config.clone(), connector.clone())?),
                SourceKind::Stripe => Arc::new(StripeIntegration::new(config.clone(), connector.clone())?),
            };
            info!(source = %kind, verification = ?config.verification, "Integration registered");
            registry.register(integration);
        }
        Ok(registry)
    }

    pub fn register(&mut self, integration: Arc<dyn Integration>) {
        self.integrations.insert(integration.source(), integration);
    }

    pub fn get(&self, source: SourceKind) -> Option<Arc<dyn Integration>> {
        self.integrations.get(&source).cloned()
    }

    pub fn sources(&self) -> impl Iterator<Item = SourceKind> + '_ {
        self.integrations.keys().copied()
    }

    pub fn len(&self) -> usize {
        self.integrations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.integrations.is_empty()
    }
}
