//! Client configuration
//!
//! Loaded from TOML, then layered with explicit overrides (CLI flags,
//! environment). Every field is copied by name in `merge_from`; there is no
//! generic property copying.

use crate::error::{ConnectError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use url::Url;

fn default_base_url() -> String {
    "http://localhost:8080".to_string()
}

fn default_prefix() -> String {
    "/connect".to_string()
}

fn default_token_endpoint() -> String {
    "/oauth/token".to_string()
}

fn default_storage_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("connect-client")
}

fn default_heartbeat_interval_secs() -> u64 {
    180
}

fn default_csrf_header_value() -> String {
    "Vaadin CCDM".to_string()
}

/// Connect client configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Server origin, e.g. `https://app.example.com`
    #[serde(default = "default_base_url")]
    pub base_url: String,

    /// Path prefix for endpoint calls
    #[serde(default = "default_prefix")]
    pub prefix: String,

    /// OAuth token endpoint, absolute or relative to `base_url`
    #[serde(default = "default_token_endpoint")]
    pub token_endpoint: String,

    /// Client id for HTTP Basic authentication on token requests
    #[serde(default)]
    pub client_id: Option<String>,

    #[serde(default)]
    pub client_secret: Option<String>,

    /// Directory of the sled database holding tokens and deferred calls
    #[serde(default = "default_storage_dir")]
    pub storage_dir: PathBuf,

    /// URL probed with HEAD when connectivity returns (defaults to `base_url`)
    #[serde(default)]
    pub probe_url: Option<String>,

    /// Live reload heartbeat interval
    #[serde(default = "default_heartbeat_interval_secs")]
    pub heartbeat_interval_secs: u64,

    /// Value of the `X-Requested-With` marker header
    #[serde(default = "default_csrf_header_value")]
    pub csrf_header_value: String,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            prefix: default_prefix(),
            token_endpoint: default_token_endpoint(),
            client_id: None,
            client_secret: None,
            storage_dir: default_storage_dir(),
            probe_url: None,
            heartbeat_interval_secs: default_heartbeat_interval_secs(),
            csrf_header_value: default_csrf_header_value(),
        }
    }
}

/// Optional values layered over a [`ClientConfig`]
#[derive(Debug, Clone, Default)]
pub struct ClientConfigOverrides {
    pub base_url: Option<String>,
    pub prefix: Option<String>,
    pub token_endpoint: Option<String>,
    pub client_id: Option<String>,
    pub client_secret: Option<String>,
    pub storage_dir: Option<PathBuf>,
    pub probe_url: Option<String>,
    pub heartbeat_interval_secs: Option<u64>,
    pub csrf_header_value: Option<String>,
}

impl ClientConfig {
    /// Parse a TOML document
    pub fn from_toml_str(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| ConnectError::Config(e.to_string()))
    }

    /// Load a TOML file
    pub fn from_toml_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConnectError::Config(format!("{}: {}", path.display(), e)))?;
        Self::from_toml_str(&content)
    }

    /// Apply every override that is set
    pub fn merge_from(&mut self, overrides: &ClientConfigOverrides) {
        if let Some(base_url) = &overrides.base_url {
            self.base_url = base_url.clone();
        }
        if let Some(prefix) = &overrides.prefix {
            self.prefix = prefix.clone();
        }
        if let Some(token_endpoint) = &overrides.token_endpoint {
            self.token_endpoint = token_endpoint.clone();
        }
        if let Some(client_id) = &overrides.client_id {
            self.client_id = Some(client_id.clone());
        }
        if let Some(client_secret) = &overrides.client_secret {
            self.client_secret = Some(client_secret.clone());
        }
        if let Some(storage_dir) = &overrides.storage_dir {
            self.storage_dir = storage_dir.clone();
        }
        if let Some(probe_url) = &overrides.probe_url {
            self.probe_url = Some(probe_url.clone());
        }
        if let Some(secs) = overrides.heartbeat_interval_secs {
            self.heartbeat_interval_secs = secs;
        }
        if let Some(value) = &overrides.csrf_header_value {
            self.csrf_header_value = value.clone();
        }
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        Url::parse(&self.base_url)
            .map_err(|e| ConnectError::Config(format!("invalid base_url {}: {}", self.base_url, e)))?;
        if !self.prefix.is_empty() && !self.prefix.starts_with('/') {
            return Err(ConnectError::Config(format!(
                "prefix must start with '/': {}",
                self.prefix
            )));
        }
        if self.client_secret.is_some() && self.client_id.is_none() {
            return Err(ConnectError::Config(
                "client_secret requires client_id".to_string(),
            ));
        }
        if self.heartbeat_interval_secs == 0 {
            return Err(ConnectError::Config(
                "heartbeat_interval_secs must be positive".to_string(),
            ));
        }
        self.token_endpoint_url()?;
        self.probe_url()?;
        Ok(())
    }

    /// `{base_url}{prefix}/{service}/{method}`
    pub fn endpoint_url(&self, service: &str, method: &str) -> Result<Url> {
        let url = format!(
            "{}{}/{}/{}",
            self.base_url.trim_end_matches('/'),
            self.prefix.trim_end_matches('/'),
            service,
            method
        );
        Url::parse(&url).map_err(|e| ConnectError::Config(format!("invalid endpoint url {}: {}", url, e)))
    }

    pub fn token_endpoint_url(&self) -> Result<Url> {
        self.resolve(&self.token_endpoint)
    }

    pub fn probe_url(&self) -> Result<Url> {
        self.resolve(self.probe_url.as_deref().unwrap_or(&self.base_url))
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    fn resolve(&self, target: &str) -> Result<Url> {
        if let Ok(url) = Url::parse(target) {
            return Ok(url);
        }
        Url::parse(&self.base_url)
            .and_then(|base| base.join(target))
            .map_err(|e| ConnectError::Config(format!("cannot resolve {}: {}", target, e)))
    }
}
