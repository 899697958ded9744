//! GitHub webhooks (push, pull_request, issues, ...)

use std::sync::Arc;

use async_trait::async_trait;
use hr_common::{Headers, InboundEvent, Result, SinkRecord, SourceKind};
use hr_config::{ConfigError, SourceConfig};
use hr_sink::SinkConnector;
use hr_verify::github::{DELIVERY_HEADER, EVENT_HEADER};
use serde_json::Value;

use crate::helpers::{base_record, json_object, require_secret, str_at, verify_source};
use crate::Integration;

pub struct GitHubIntegration {
    config: SourceConfig,
    connector: Arc<SinkConnector>,
}

impl GitHubIntegration {
    pub fn new(config: SourceConfig, connector: Arc<SinkConnector>) -> std::result::Result<Self, ConfigError> {
        require_secret(SourceKind::GitHub, &config)?;
        Ok(Self { config, connector })
    }
}

#[async_trait]
impl Integration for GitHubIntegration {
    fn source(&self) -> SourceKind {
        SourceKind::GitHub
    }

    fn verify_request(&self, raw_payload: &[u8], headers: &Headers) -> bool {
        verify_source(SourceKind::GitHub, &self.config, raw_payload, headers)
    }

    fn transform(&self, event: &InboundEvent) -> Result<SinkRecord> {
        let payload = json_object(event)?;
        let headers = event.headers();

        let mut record = base_record(event);
        record.set_opt("Event_Type", headers.get_non_empty(EVENT_HEADER));
        record.set_opt("Delivery_Id", headers.get_non_empty(DELIVERY_HEADER));
        record.set_opt("Repository", str_at(&payload, "/repository/full_name"));
        record.set_opt("Sender", str_at(&payload, "/sender/login"));
        record.set_opt("Action", str_at(&payload, "/action"));
        record.set_opt("Ref", str_at(&payload, "/ref"));
        record.set_opt("Commit_Count", payload.get("commits").and_then(Value::as_array).map(Vec::len));
        record.set_opt("Head_Commit_Message", str_at(&payload, "/head_commit/message"));
        record.set_opt("Head_Commit_Url", str_at(&payload, "/head_commit/url"));
        Ok(record)
    }

    fn connector(&self) -> &SinkConnector {
        &self.connector
    }
}
