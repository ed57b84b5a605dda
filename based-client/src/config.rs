//! Client configuration.
//!
//! Configuration is loaded in the following order (later overrides earlier):
//! 1. Default values
//! 2. YAML config file (if specified via BASED_CONFIG)
//! 3. Environment variables

use crate::connection::{ConnectionConfig, ReconnectConfig, Target};
use crate::discovery::ServiceCoordinates;
use crate::tls::TlsClientConfig;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {0:?}: {1}")]
    Io(PathBuf, #[source] std::io::Error),

    #[error("failed to parse config file {0:?}: {1}")]
    Parse(PathBuf, String),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Client configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub connection: ConnectionSection,
    /// Coordinates used when no literal URL is configured.
    pub discovery: ServiceCoordinates,
    pub reconnect: ReconnectConfig,
    pub tls: TlsClientConfig,
}

/// Literal endpoint settings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionSection {
    /// `ws://` or `wss://` URL. Takes precedence over discovery.
    pub url: Option<String>,
}

impl ClientConfig {
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = match std::env::var("BASED_CONFIG") {
            Ok(path) => Self::from_file(path)?,
            Err(_) => Self::default(),
        };
        config.apply_env_overrides(|key| std::env::var(key).ok());
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content =
            std::fs::read_to_string(path).map_err(|e| ConfigError::Io(path.to_path_buf(), e))?;
        serde_yaml::from_str(&content)
            .map_err(|e| ConfigError::Parse(path.to_path_buf(), e.to_string()))
    }

    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.connection.url = Some(url.into());
        self
    }

    pub fn with_discovery(mut self, coords: ServiceCoordinates) -> Self {
        self.discovery = coords;
        self
    }

    pub fn with_reconnect(mut self, reconnect: ReconnectConfig) -> Self {
        self.reconnect = reconnect;
        self
    }

    pub fn with_tls(mut self, tls: TlsClientConfig) -> Self {
        self.tls = tls;
        self
    }

    /// Applies `BASED_*` overrides read through `lookup`.
    pub fn apply_env_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(url) = lookup("BASED_URL") {
            self.connection.url = Some(url);
        }

        let discovery = &mut self.discovery;
        for (key, field) in [
            ("BASED_CLUSTER", &mut discovery.cluster),
            ("BASED_ORG", &mut discovery.org),
            ("BASED_PROJECT", &mut discovery.project),
            ("BASED_ENV", &mut discovery.env),
            ("BASED_SERVICE", &mut discovery.name),
        ] {
            if let Some(value) = lookup(key) {
                *field = value;
            }
        }
        if let Some(key) = lookup("BASED_KEY") {
            discovery.key = Some(key);
        }
        if let Some(host) = lookup("BASED_HOST") {
            discovery.host = Some(host);
        }
        if let Some(url) = lookup("BASED_DISCOVERY_URL") {
            discovery.discovery_url = Some(url);
        }
        if let Some(tls) = lookup("BASED_TLS") {
            discovery.tls = tls == "1" || tls.eq_ignore_ascii_case("true");
        }

        if let Some(ms) = lookup("BASED_RECONNECT_STEP_MS").and_then(|v| v.parse().ok()) {
            self.reconnect.step_ms = ms;
        }
        if let Some(ms) = lookup("BASED_RECONNECT_MAX_MS").and_then(|v| v.parse().ok()) {
            self.reconnect.max_ms = ms;
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if let Some(ref url) = self.connection.url {
            if !url.starts_with("ws://") && !url.starts_with("wss://") {
                return Err(ConfigError::Invalid(format!(
                    "url must use ws:// or wss://, got {}",
                    url
                )));
            }
            return Ok(());
        }
        let d = &self.discovery;
        if d.org.is_empty() || d.project.is_empty() || d.env.is_empty() {
            return Err(ConfigError::Invalid(
                "either url or org, project and env must be set".to_string(),
            ));
        }
        Ok(())
    }

    pub fn target(&self) -> Target {
        match self.connection.url {
            Some(ref url) => Target::Url(url.clone()),
            None => Target::Service(self.discovery.clone()),
        }
    }

    pub fn connection_config(&self, target: Target) -> ConnectionConfig {
        ConnectionConfig::new(target)
            .with_reconnect(self.reconnect.clone())
            .with_tls(self.tls.clone())
    }
}
