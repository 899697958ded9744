//! REST transport for a Salesforce-style record API
//!
//! - login: OAuth2 password grant at `{login_url}/services/oauth2/token`
//! - records: `{instance}/services/data/v{api}/sobjects/{type}/[{id}]`
//! - queries: `{instance}/services/data/v{api}/query?q=...`
//! - units of work: `{instance}/services/data/v{api}/composite` with `allOrNone`

use std::collections::HashMap;

use async_trait::async_trait;
use hr_common::{
    FieldError, Fields, QueryResult, RecordResult, ReferenceId, SaveResult, SinkError, SinkRecord,
};
use hr_config::SinkConfig;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use crate::transport::{Session, SinkTransport};
use crate::unit_of_work::{Operation, UnitOfWork};

const INVALID_SESSION: &str = "INVALID_SESSION_ID";

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    instance_url: String,
}

#[derive(Debug, Deserialize)]
struct OAuthError {
    error: String,
    #[serde(default)]
    error_description: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CreateResponse {
    id: Option<String>,
    success: bool,
    #[serde(default)]
    errors: Vec<FieldError>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct CompositeRequest {
    all_or_none: bool,
    composite_request: Vec<CompositeSubrequest>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct CompositeSubrequest {
    method: &'static str,
    url: String,
    reference_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    body: Option<Value>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CompositeResponse {
    composite_response: Vec<CompositeSubresponse>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CompositeSubresponse {
    #[serde(default)]
    body: Value,
    http_status_code: u16,
    reference_id: String,
}

pub struct RestSinkTransport {
    config: SinkConfig,
    client: reqwest::Client,
}

impl RestSinkTransport {
    pub fn new(config: SinkConfig) -> Result<Self, SinkError> {
        let client = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout())
            .timeout(config.request_timeout())
            .build()
            .map_err(|e| SinkError::Transport(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self { config, client })
    }

    /// Path below the instance URL for a data API resource
    fn data_path(&self, resource: &str) -> String {
        format!("/services/data/v{}/{}", self.config.api_version, resource)
    }

    fn data_url(&self, session: &Session, resource: &str) -> String {
        format!(
            "{}{}",
            session.instance_url.trim_end_matches('/'),
            self.data_path(resource)
        )
    }

    fn sobject_path(&self, object_type: &str, id: Option<&str>) -> String {
        match id {
            Some(id) => self.data_path(&format!("sobjects/{}/{}", object_type, id)),
            None => self.data_path(&format!("sobjects/{}/", object_type)),
        }
    }

    fn credentials(&self) -> Result<[(&'static str, String); 5], SinkError> {
        let require = |name: &str, value: &Option<String>| {
            value
                .as_deref()
                .filter(|v| !v.is_empty())
                .map(str::to_string)
                .ok_or_else(|| SinkError::Authentication(format!("missing sink credential: {}", name)))
        };

        let password = format!(
            "{}{}",
            require("password", &self.config.password)?,
            self.config.security_token.as_deref().unwrap_or_default()
        );

        Ok([
            ("grant_type", "password".to_string()),
            ("client_id", require("client_id", &self.config.client_id)?),
            ("client_secret", require("client_secret", &self.config.client_secret)?),
            ("username", require("username", &self.config.username)?),
            ("password", password),
        ])
    }

    async fn send(
        &self,
        request: reqwest::RequestBuilder,
        session: &Session,
    ) -> Result<reqwest::Response, SinkError> {
        request
            .bearer_auth(&session.access_token)
            .send()
            .await
            .map_err(|e| SinkError::Transport(e.to_string()))
    }

    async fn save_result(
        &self,
        response: reqwest::Response,
        object_type: &str,
        id: &str,
    ) -> Result<SaveResult, SinkError> {
        if response.status().is_success() {
            Ok(SaveResult::new(id))
        } else {
            Err(error_from_response(response, object_type).await)
        }
    }

    async fn query_result(&self, response: reqwest::Response) -> Result<QueryResult, SinkError> {
        if !response.status().is_success() {
            return Err(error_from_response(response, "query").await);
        }
        response
            .json::<QueryResult>()
            .await
            .map_err(|e| SinkError::Protocol(format!("invalid query response: {}", e)))
    }

    fn subrequest(&self, operation: &Operation) -> Result<CompositeSubrequest, SinkError> {
        let reference_id = operation.reference_id().to_string();
        let subrequest = match operation {
            Operation::Create { record, .. } => CompositeSubrequest {
                method: "POST",
                url: self.sobject_path(&record.object_type, None),
                reference_id,
                body: Some(fields_json(&record.fields)?),
            },
            Operation::Update {
                object_type,
                id,
                fields,
                ..
            } => CompositeSubrequest {
                method: "PATCH",
                url: self.sobject_path(object_type, Some(id)),
                reference_id,
                body: Some(fields_json(fields)?),
            },
            Operation::Delete { object_type, id, .. } => CompositeSubrequest {
                method: "DELETE",
                url: self.sobject_path(object_type, Some(id)),
                reference_id,
                body: None,
            },
        };
        Ok(subrequest)
    }
}

#[async_trait]
impl SinkTransport for RestSinkTransport {
    async fn login(&self) -> Result<Session, SinkError> {
        let url = format!(
            "{}/services/oauth2/token",
            self.config.login_url.trim_end_matches('/')
        );
        let form = self.credentials()?;
        debug!("Requesting sink token from {}", url);

        let response = self
            .client
            .post(&url)
            .form(&form)
            .send()
            .await
            .map_err(|e| SinkError::Transport(e.to_string()))?;

        let status = response.status();
        if status.is_success() {
            let token = response
                .json::<TokenResponse>()
                .await
                .map_err(|e| SinkError::Protocol(format!("invalid token response: {}", e)))?;
            return Ok(Session::new(token.access_token, token.instance_url));
        }

        let body = response.text().await.unwrap_or_default();
        match status {
            StatusCode::BAD_REQUEST | StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                let reason = serde_json::from_str::<OAuthError>(&body)
                    .map(|e| match e.error_description {
                        Some(description) => format!("{}: {}", e.error, description),
                        None => e.error,
                    })
                    .unwrap_or(body);
                Err(SinkError::Authentication(reason))
            }
            _ => Err(SinkError::Transport(format!("HTTP {}: {}", status, body))),
        }
    }

    async fn create(&self, session: &Session, record: &SinkRecord) -> Result<SaveResult, SinkError> {
        let url = self.data_url(session, &format!("sobjects/{}/", record.object_type));
        let response = self
            .send(self.client.post(&url).json(&record.fields), session)
            .await?;

        if !response.status().is_success() {
            return Err(error_from_response(response, &record.object_type).await);
        }

        let created = response
            .json::<CreateResponse>()
            .await
            .map_err(|e| SinkError::Protocol(format!("invalid create response: {}", e)))?;
        match (created.success, created.id) {
            (true, Some(id)) => Ok(SaveResult::new(id)),
            (_, _) => Err(SinkError::rejected(&record.object_type, created.errors)),
        }
    }

    async fn update(
        &self,
        session: &Session,
        object_type: &str,
        id: &str,
        fields: &Fields,
    ) -> Result<SaveResult, SinkError> {
        let url = self.data_url(session, &format!("sobjects/{}/{}", object_type, id));
        let response = self.send(self.client.patch(&url).json(fields), session).await?;
        self.save_result(response, object_type, id).await
    }

    async fn delete(&self, session: &Session, object_type: &str, id: &str) -> Result<SaveResult, SinkError> {
        let url = self.data_url(session, &format!("sobjects/{}/{}", object_type, id));
        let response = self.send(self.client.delete(&url), session).await?;
        self.save_result(response, object_type, id).await
    }

    async fn query(&self, session: &Session, query: &str) -> Result<QueryResult, SinkError> {
        let url = self.data_url(session, "query");
        let response = self
            .send(self.client.get(&url).query(&[("q", query)]), session)
            .await?;
        self.query_result(response).await
    }

    async fn query_more(&self, session: &Session, next_records_url: &str) -> Result<QueryResult, SinkError> {
        let url = if next_records_url.starts_with("http") {
            next_records_url.to_string()
        } else {
            format!("{}{}", session.instance_url.trim_end_matches('/'), next_records_url)
        };
        let response = self.send(self.client.get(&url), session).await?;
        self.query_result(response).await
    }

    async fn commit(
        &self,
        session: &Session,
        unit: &UnitOfWork,
    ) -> Result<HashMap<ReferenceId, RecordResult>, SinkError> {
        let request = CompositeRequest {
            all_or_none: true,
            composite_request: unit
                .operations()
                .iter()
                .map(|op| self.subrequest(op))
                .collect::<Result<_, _>>()?,
        };

        let url = self.data_url(session, "composite");
        debug!("Committing {} operations to {}", unit.len(), url);
        let response = self.send(self.client.post(&url).json(&request), session).await?;

        if !response.status().is_success() {
            return Err(error_from_response(response, "composite").await);
        }

        let composite = response
            .json::<CompositeResponse>()
            .await
            .map_err(|e| SinkError::Protocol(format!("invalid composite response: {}", e)))?;

        let target_ids: HashMap<&str, &str> = unit
            .operations()
            .iter()
            .filter_map(|op| op.target_id().map(|id| (op.reference_id().as_str(), id)))
            .collect();

        let results = composite
            .composite_response
            .into_iter()
            .map(|sub| {
                let result = if (200..300).contains(&sub.http_status_code) {
                    let id = sub
                        .body
                        .get("id")
                        .and_then(Value::as_str)
                        .filter(|id| !id.is_empty())
                        .or_else(|| target_ids.get(sub.reference_id.as_str()).copied());
                    // `id` stays empty when the sink reports none; the connector rejects that
                    RecordResult {
                        id: id.map(str::to_string),
                        success: true,
                        errors: Vec::new(),
                    }
                } else {
                    RecordResult::failed(parse_errors(&sub.body.to_string()))
                };
                (ReferenceId::new(sub.reference_id), result)
            })
            .collect();
        Ok(results)
    }
}

fn fields_json(fields: &Fields) -> Result<Value, SinkError> {
    serde_json::to_value(fields).map_err(|e| SinkError::Protocol(format!("unserializable fields: {}", e)))
}

/// Sink error bodies are a JSON array of `{message, errorCode, fields}`
fn parse_errors(body: &str) -> Vec<FieldError> {
    match serde_json::from_str::<Vec<FieldError>>(body) {
        Ok(errors) if !errors.is_empty() => errors,
        _ => vec![FieldError::new("UNKNOWN_ERROR", body)],
    }
}

async fn error_from_response(response: reqwest::Response, object_type: &str) -> SinkError {
    let status = response.status();
    let body = response.text().await.unwrap_or_default();
    let errors = parse_errors(&body);

    match status.as_u16() {
        401 => {
            let message = errors
                .iter()
                .find(|e| e.error_code == INVALID_SESSION)
                .or(errors.first())
                .map(|e| e.message.clone())
                .unwrap_or_else(|| INVALID_SESSION.to_string());
            SinkError::SessionExpired(message)
        }
        400..=499 => {
            warn!("Sink rejected {} with status {}: {}", object_type, status, body);
            SinkError::rejected(object_type, errors)
        }
        _ => SinkError::Transport(format!("HTTP {}: {}", status, body)),
    }
}
