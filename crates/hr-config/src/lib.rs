//! HookRelay Configuration
//!
//! Loaded from an optional TOML file, then overridden by environment
//! variables:
//!
//! ```toml
//! [server]
//! bind = "0.0.0.0:3000"
//!
//! [sink]
//! login_url = "https://login.salesforce.com"
//! client_id = "..."
//!
//! [sources.github]
//! secret = "..."
//!
//! [sources.sendgrid]
//! verification = "disabled"
//! ```

use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use hr_common::SourceKind;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Missing configuration: {0}")]
    Missing(String),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

pub type Result<T> = std::result::Result<T, ConfigError>;

/// Top-level relay configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    pub server: ServerConfig,
    pub sink: SinkConfig,
    pub sources: SourcesConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Listen address for the webhook endpoint
    pub bind: String,
    /// How long shutdown waits for in-flight deliveries
    pub shutdown_timeout_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0:3000".to_string(),
            shutdown_timeout_secs: 30,
        }
    }
}

impl ServerConfig {
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }
}

/// Credentials and endpoint for the record sink
#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SinkConfig {
    pub login_url: String,
    pub api_version: String,
    pub client_id: Option<String>,
    pub client_secret: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
    /// Appended to the password for the OAuth password grant
    pub security_token: Option<String>,
    pub connect_timeout_secs: u64,
    pub request_timeout_secs: u64,
}

impl Default for SinkConfig {
    fn default() -> Self {
        Self {
            login_url: "https://login.salesforce.com".to_string(),
            api_version: "59.0".to_string(),
            client_id: None,
            client_secret: None,
            username: None,
            password: None,
            security_token: None,
            connect_timeout_secs: 10,
            request_timeout_secs: 30,
        }
    }
}

impl fmt::Debug for SinkConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SinkConfig")
            .field("login_url", &self.login_url)
            .field("api_version", &self.api_version)
            .field("client_id", &self.client_id)
            .field("client_secret", &redacted(&self.client_secret))
            .field("username", &self.username)
            .field("password", &redacted(&self.password))
            .field("security_token", &redacted(&self.security_token))
            .field("connect_timeout_secs", &self.connect_timeout_secs)
            .field("request_timeout_secs", &self.request_timeout_secs)
            .finish()
    }
}

impl SinkConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

/// Whether a source's signature check is enforced.
///
/// `Disabled` accepts every request for that source. It must be chosen
/// explicitly and is reported loudly; it is never a default.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VerificationPolicy {
    #[default]
    Enforce,
    Disabled,
}

#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SourceConfig {
    pub enabled: bool,
    pub verification: VerificationPolicy,
    /// HMAC secret (GitHub, Stripe) or base64 DER verification key (SendGrid)
    pub secret: Option<String>,
    /// Accepted clock skew for timestamped schemes
    pub tolerance_secs: i64,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            verification: VerificationPolicy::Enforce,
            secret: None,
            tolerance_secs: 300,
        }
    }
}

impl fmt::Debug for SourceConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SourceConfig")
            .field("enabled", &self.enabled)
            .field("verification", &self.verification)
            .field("secret", &redacted(&self.secret))
            .field("tolerance_secs", &self.tolerance_secs)
            .finish()
    }
}

impl SourceConfig {
    pub fn with_secret(secret: impl Into<String>) -> Self {
        Self {
            secret: Some(secret.into()),
            ..Default::default()
        }
    }

    pub fn unverified() -> Self {
        Self {
            verification: VerificationPolicy::Disabled,
            ..Default::default()
        }
    }

    /// Configured secret, ignoring blank values
    pub fn secret(&self) -> Option<&str> {
        self.secret.as_deref().filter(|s| !s.trim().is_empty())
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SourcesConfig {
    pub github: SourceConfig,
    pub sendgrid: SourceConfig,
    pub stripe: SourceConfig,
}

impl SourcesConfig {
    pub fn get(&self, kind: SourceKind) -> &SourceConfig {
        match kind {
            SourceKind::GitHub => &self.github,
            SourceKind::SendGrid => &self.sendgrid,
            SourceKind::Stripe => &self.stripe,
        }
    }

    pub fn get_mut(&mut self, kind: SourceKind) -> &mut SourceConfig {
        match kind {
            SourceKind::GitHub => &mut self.github,
            SourceKind::SendGrid => &mut self.sendgrid,
            SourceKind::Stripe => &mut self.stripe,
        }
    }

    pub fn enabled(&self) -> impl Iterator<Item = (SourceKind, &SourceConfig)> {
        SourceKind::ALL
            .into_iter()
            .map(|kind| (kind, self.get(kind)))
            .filter(|(_, config)| config.enabled)
    }
}

/// Environment variable carrying each source's secret
pub fn secret_env_var(kind: SourceKind) -> &'static str {
    match kind {
        SourceKind::GitHub => "GITHUB_WEBHOOK_SECRET",
        SourceKind::SendGrid => "SENDGRID_VERIFICATION_KEY",
        SourceKind::Stripe => "STRIPE_WEBHOOK_SECRET",
    }
}

impl RelayConfig {
    pub fn from_toml_str(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&content)
    }

    /// Load file (if any), apply process environment, validate
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => {
                info!(path = %path.display(), "Loading relay configuration");
                Self::from_file(path)?
            }
            None => Self::default(),
        };
        config.apply_env_with(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    /// Apply overrides from a variable lookup (the process environment in production)
    pub fn apply_env_with<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(bind) = lookup("HOOKRELAY_BIND") {
            self.server.bind = bind;
        }

        for kind in SourceKind::ALL {
            if let Some(secret) = lookup(secret_env_var(kind)) {
                self.sources.get_mut(kind).secret = Some(secret);
            }
        }

        let sink = &mut self.sink;
        if let Some(v) = lookup("SINK_LOGIN_URL") {
            sink.login_url = v;
        }
        if let Some(v) = lookup("SINK_API_VERSION") {
            sink.api_version = v;
        }
        sink.client_id = lookup("SINK_CLIENT_ID").or(sink.client_id.take());
        sink.client_secret = lookup("SINK_CLIENT_SECRET").or(sink.client_secret.take());
        sink.username = lookup("SINK_USERNAME").or(sink.username.take());
        sink.password = lookup("SINK_PASSWORD").or(sink.password.take());
        sink.security_token = lookup("SINK_SECURITY_TOKEN").or(sink.security_token.take());
    }

    /// Reject configurations that would silently accept or drop webhooks
    pub fn validate(&self) -> Result<()> {
        if self.sink.login_url.trim().is_empty() {
            return Err(ConfigError::Missing("sink.login_url".to_string()));
        }
        if self.sink.api_version.trim().is_empty() {
            return Err(ConfigError::Missing("sink.api_version".to_string()));
        }

        let mut enabled = 0;
        for (kind, source) in self.sources.enabled() {
            enabled += 1;
            match source.verification {
                VerificationPolicy::Enforce if source.secret().is_none() => {
                    return Err(ConfigError::Missing(format!(
                        "sources.{}.secret (or {})",
                        kind.as_str(),
                        secret_env_var(kind)
                    )));
                }
                VerificationPolicy::Disabled => {
                    warn!(
                        source = %kind,
                        "Signature verification DISABLED - every request for this source is accepted"
                    );
                }
                VerificationPolicy::Enforce => {}
            }
            if source.tolerance_secs <= 0 {
                return Err(ConfigError::Invalid(format!(
                    "sources.{}.tolerance_secs must be positive",
                    kind.as_str()
                )));
            }
        }

        if enabled == 0 {
            return Err(ConfigError::Invalid("no sources enabled".to_string()));
        }
        Ok(())
    }
}

fn redacted(value: &Option<String>) -> Option<&'static str> {
    value.as_ref().map(|_| "<redacted>")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_parse_toml() {
        let config = RelayConfig::from_toml_str(
            r#"
            [server]
            bind = "127.0.0.1:9000"

            [sink]
            login_url = "https://test.salesforce.com"
            client_id = "cid"

            [sources.github]
            secret = "gh"

            [sources.sendgrid]
            verification = "disabled"

            [sources.stripe]
            enabled = false
            "#,
        )
        .unwrap();

        assert_eq!(config.server.bind, "127.0.0.1:9000");
        assert_eq!(config.server.shutdown_timeout_secs, 30);
        assert_eq!(config.sink.login_url, "https://test.salesforce.com");
        assert_eq!(config.sink.api_version, "59.0");
        assert_eq!(config.sources.github.secret(), Some("gh"));
        assert_eq!(config.sources.sendgrid.verification, VerificationPolicy::Disabled);
        assert!(!config.sources.stripe.enabled);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_env_overrides() {
        let mut config = RelayConfig::default();
        config.apply_env_with(env(&[
            ("HOOKRELAY_BIND", "0.0.0.0:8080"),
            ("GITHUB_WEBHOOK_SECRET", "from-env"),
            ("SINK_USERNAME", "relay@example.com"),
            ("SINK_API_VERSION", "60.0"),
        ]));

        assert_eq!(config.server.bind, "0.0.0.0:8080");
        assert_eq!(config.sources.github.secret(), Some("from-env"));
        assert_eq!(config.sink.username.as_deref(), Some("relay@example.com"));
        assert_eq!(config.sink.api_version, "60.0");
        assert!(config.sink.password.is_none());
    }

    #[test]
    fn test_enforced_source_requires_secret() {
        let mut config = RelayConfig::default();
        config.sources.github = SourceConfig::with_secret("gh");
        config.sources.stripe = SourceConfig::with_secret("   ");
        config.sources.sendgrid = SourceConfig::unverified();

        let err = config.validate().unwrap_err();
        assert!(matches!(err, ConfigError::Missing(ref m) if m.contains("STRIPE_WEBHOOK_SECRET")));
    }

    #[test]
    fn test_disabled_verification_is_explicit() {
        let config = RelayConfig::from_toml_str("[sources.github]\n").unwrap();
        assert_eq!(config.sources.github.verification, VerificationPolicy::Enforce);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_no_enabled_sources_rejected() {
        let mut config = RelayConfig::default();
        for kind in SourceKind::ALL {
            config.sources.get_mut(kind).enabled = false;
        }
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_debug_redacts_secrets() {
        let mut config = RelayConfig::default();
        config.sink.password = Some("hunter2".to_string());
        config.sources.github = SourceConfig::with_secret("gh-secret");

        let rendered = format!("{:?}", config);
        assert!(!rendered.contains("hunter2"));
        assert!(!rendered.contains("gh-secret"));
        assert!(rendered.contains("<redacted>"));
    }

    #[test]
    fn test_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[sources.github]\nsecret = \"file-secret\"").unwrap();

        let config = RelayConfig::from_file(file.path()).unwrap();
        assert_eq!(config.sources.github.secret(), Some("file-secret"));

        let missing = RelayConfig::from_file(Path::new("/nonexistent/hookrelay.toml"));
        assert!(matches!(missing, Err(ConfigError::Io { .. })));
    }

    #[test]
    fn test_example_config_parses() {
        let mut config = RelayConfig::from_toml_str(include_str!("../../../hookrelay.example.toml")).unwrap();
        assert_eq!(config.sources.enabled().count(), 3);
        assert_eq!(config.sources.stripe.tolerance_secs, 300);

        // Enforcing sources still need their secrets from the environment
        assert!(config.validate().is_err());
        config.apply_env_with(|key| match key {
            "GITHUB_WEBHOOK_SECRET" | "STRIPE_WEBHOOK_SECRET" | "SENDGRID_VERIFICATION_KEY" => {
                Some("from-env".to_string())
            }
            _ => None,
        });
        assert!(config.validate().is_ok());
    }
}
