//! SendGrid Event Webhook
//!
//! SendGrid posts a JSON array of email events. Each delivery is recorded as
//! one summary `Integration` record; batches with more than one event also
//! get an `Integration_Event` child per event, committed together with the
//! summary in a single unit of work.

use std::sync::Arc;

use async_trait::async_trait;
use hr_common::{Headers, InboundEvent, RelayError, Result, SaveResult, SinkError, SinkRecord, SourceKind};
use hr_config::{ConfigError, SourceConfig};
use hr_sink::{SinkConnector, UnitOfWork};
use serde_json::Value;
use tracing::debug;

use crate::helpers::{base_record, deliver_record, epoch_to_iso, require_secret, str_at, verify_source};
use crate::Integration;

pub const EVENT_OBJECT: &str = "Integration_Event";

pub struct SendGridIntegration {
    config: SourceConfig,
    connector: Arc<SinkConnector>,
}

impl SendGridIntegration {
    pub fn new(config: SourceConfig, connector: Arc<SinkConnector>) -> std::result::Result<Self, ConfigError> {
        require_secret(SourceKind::SendGrid, &config)?;
        Ok(Self { config, connector })
    }

    fn events(event: &InboundEvent) -> Result<Vec<Value>> {
        let events = match event.json()? {
            Value::Array(events) => events,
            _ => return Err(RelayError::malformed(SourceKind::SendGrid, "expected a JSON array of events")),
        };
        if events.is_empty() {
            return Err(RelayError::malformed(SourceKind::SendGrid, "empty event batch"));
        }
        if !events.iter().all(Value::is_object) {
            return Err(RelayError::malformed(SourceKind::SendGrid, "every event must be a JSON object"));
        }
        Ok(events)
    }

    fn summary(event: &InboundEvent, events: &[Value]) -> SinkRecord {
        let first = &events[0];
        let first_type = str_at(first, "/event");
        let event_type = if events.iter().all(|e| str_at(e, "/event") == first_type) {
            first_type
        } else {
            Some("mixed".to_string())
        };

        let mut record = base_record(event);
        record.set_opt("Event_Type", event_type);
        record.set("Event_Count", events.len());
        record.set_opt("Email", str_at(first, "/email"));
        record.set_opt("Occurred_At", occurred_at(first));
        record
    }

    fn child(summary: &Value, index: usize, email_event: &Value) -> SinkRecord {
        let event_type = str_at(email_event, "/event");
        let name = format!(
            "SendGrid {} {}",
            event_type.as_deref().unwrap_or("event"),
            index + 1
        );

        let mut record = SinkRecord::new(EVENT_OBJECT)
            .with("Name", name)
            .with("Integration", summary.clone());
        record.set_opt("Event_Type", event_type);
        record.set_opt("Email", str_at(email_event, "/email"));
        record.set_opt("Occurred_At", occurred_at(email_event));
        record.set_opt("Event_Id", str_at(email_event, "/sg_event_id"));
        record.set_opt("Message_Id", str_at(email_event, "/sg_message_id"));
        record.set_opt("Reason", str_at(email_event, "/reason"));
        record.set_opt("Url", str_at(email_event, "/url"));
        record.set("Raw_Event", email_event.to_string());
        record
    }
}

fn occurred_at(email_event: &Value) -> Option<String> {
    email_event.get("timestamp").and_then(Value::as_i64).and_then(epoch_to_iso)
}

#[async_trait]
impl Integration for SendGridIntegration {
    fn source(&self) -> SourceKind {
        SourceKind::SendGrid
    }

    fn verify_request(&self, raw_payload: &[u8], headers: &Headers) -> bool {
        verify_source(SourceKind::SendGrid, &self.config, raw_payload, headers)
    }

    fn check_payload(&self, event: &InboundEvent) -> Result<()> {
        Self::events(event).map(|_| ())
    }

    fn transform(&self, event: &InboundEvent) -> Result<SinkRecord> {
        let events = Self::events(event)?;
        Ok(Self::summary(event, &events))
    }

    fn connector(&self) -> &SinkConnector {
        &self.connector
    }

    async fn process(&self, event: &InboundEvent) -> Result<SaveResult> {
        let events = Self::events(event)?;
        let summary = Self::summary(event, &events);
        if events.len() == 1 {
            return deliver_record(&self.connector, summary).await;
        }

        let mut unit = self.connector.new_unit_of_work();
        let parent = unit.register_create(summary)?;
        let parent_ref = UnitOfWork::reference(&parent);
        for (index, email_event) in events.iter().enumerate() {
            unit.register_create(Self::child(&parent_ref, index, email_event))?;
        }

        debug!(events = events.len(), "Committing SendGrid batch");
        let results = self.connector.commit_unit_of_work(unit).await?;
        let id = results
            .get(&parent)
            .and_then(|result| result.id.clone())
            .ok_or_else(|| SinkError::Protocol(format!("no id returned for '{}'", parent)))?;
        Ok(SaveResult::new(id))
    }
}
