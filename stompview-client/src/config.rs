//! Client configuration.
//!
//! Configuration is loaded in the following order (later overrides earlier):
//! 1. Default values
//! 2. YAML config file (if specified via STOMPVIEW_CONFIG or --config)
//! 3. Environment variables
//!
//! Command-line flags are applied on top by the binary.

use crate::connection::{parse_endpoint, StompConfig};
use crate::session::SessionConfig;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use stompview_core::{StoreConfig, DEFAULT_IDENTITY_FIELD};
use stompview_protocol::DataRequest;

/// Client configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Broker endpoint and destinations.
    pub session: SessionSection,
    /// Initial request parameters.
    pub request: RequestSection,
    /// Reconciliation store settings.
    pub store: StoreSection,
}

impl Config {
    /// Loads configuration from file, then applies environment variable overrides.
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from(None)
    }

    /// Like [`Config::load`], with an explicit file taking precedence over
    /// STOMPVIEW_CONFIG.
    pub fn load_from(path: Option<PathBuf>) -> Result<Self, ConfigError> {
        let path = path.or_else(|| std::env::var("STOMPVIEW_CONFIG").ok().map(PathBuf::from));
        let mut config = match path {
            Some(path) => Self::from_file(&path)?,
            None => Self::default(),
        };
        config.apply_env_overrides();
        Ok(config)
    }

    /// Loads configuration from a YAML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::IoError(path.to_path_buf(), e))?;
        let config: Config = serde_yaml::from_str(&content)
            .map_err(|e| ConfigError::ParseError(path.to_path_buf(), e.to_string()))?;
        Ok(config)
    }

    /// Loads configuration from environment variables only.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env_overrides();
        config
    }

    fn apply_env_overrides(&mut self) {
        self.apply_overrides(|name| std::env::var(name).ok());
    }

    /// Applies overrides from a variable lookup.
    fn apply_overrides(&mut self, var: impl Fn(&str) -> Option<String>) {
        self.session.apply_overrides(&var);
        self.request.apply_overrides(&var);
        self.store.apply_overrides(&var);
    }

    /// Saves configuration to a YAML file.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        let path = path.as_ref();
        let content = serde_yaml::to_string(self)
            .map_err(|e| ConfigError::ParseError(path.to_path_buf(), e.to_string()))?;
        std::fs::write(path, content).map_err(|e| ConfigError::IoError(path.to_path_buf(), e))?;
        Ok(())
    }

    /// Rejects settings that would make a session pointless.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.session.validate()?;
        if self.store.identity_field.trim().is_empty() {
            return Err(ConfigError::ValidationError(
                "identity field is empty".to_string(),
            ));
        }
        Ok(())
    }

    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            send_destination: self.session.send_destination.clone(),
            subscribe_destination: self.session.subscribe_destination.clone(),
        }
    }

    pub fn stomp_config(&self) -> StompConfig {
        let mut config = StompConfig::new()
            .with_connect_timeout(self.session.connect_timeout())
            .with_receipt_timeout(self.session.receipt_timeout())
            .with_heartbeat(self.session.heartbeat_send_ms, self.session.heartbeat_recv_ms);
        if let Some(host) = &self.session.virtual_host {
            config = config.with_virtual_host(host.clone());
        }
        config
    }

    pub fn store_config(&self) -> StoreConfig {
        StoreConfig::new(self.store.identity_field.clone())
            .with_change_capacity(self.store.change_capacity)
    }

    /// The initial request, parsed like form input.
    pub fn data_request(&self) -> DataRequest {
        DataRequest::from_input(&self.request.trader, &self.request.book_owners)
    }
}

/// Session configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionSection {
    /// Broker endpoint (`tcp://host:port`).
    pub endpoint: String,
    /// Destination request payloads are sent to.
    pub send_destination: String,
    /// Destination snapshots and upserts arrive on.
    pub subscribe_destination: String,
    /// Connect timeout in seconds.
    pub connect_timeout_secs: u64,
    /// Receipt timeout in seconds.
    pub receipt_timeout_secs: u64,
    pub heartbeat_send_ms: u64,
    pub heartbeat_recv_ms: u64,
    /// Value for the STOMP `host` header.
    pub virtual_host: Option<String>,
}

impl Default for SessionSection {
    fn default() -> Self {
        let destinations = SessionConfig::default();
        Self {
            endpoint: "tcp://localhost:61613".to_string(),
            send_destination: destinations.send_destination,
            subscribe_destination: destinations.subscribe_destination,
            connect_timeout_secs: 10,
            receipt_timeout_secs: 10,
            heartbeat_send_ms: 10_000,
            heartbeat_recv_ms: 10_000,
            virtual_host: None,
        }
    }
}

impl SessionSection {
    fn apply_overrides(&mut self, var: &impl Fn(&str) -> Option<String>) {
        if let Some(endpoint) = var("STOMPVIEW_ENDPOINT") {
            self.endpoint = endpoint;
        }
        if let Some(dest) = var("STOMPVIEW_SEND_DEST") {
            self.send_destination = dest;
        }
        if let Some(dest) = var("STOMPVIEW_SUBSCRIBE_DEST") {
            self.subscribe_destination = dest;
        }
        if let Some(timeout) = var("STOMPVIEW_CONNECT_TIMEOUT") {
            if let Ok(secs) = timeout.parse() {
                self.connect_timeout_secs = secs;
            }
        }
        if let Some(host) = var("STOMPVIEW_VIRTUAL_HOST") {
            self.virtual_host = Some(host);
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.endpoint.trim().is_empty() {
            return Err(ConfigError::ValidationError("endpoint is empty".to_string()));
        }
        if let Err(e) = parse_endpoint(self.endpoint.trim()) {
            return Err(ConfigError::ValidationError(e.to_string()));
        }
        if self.send_destination.trim().is_empty() {
            return Err(ConfigError::ValidationError(
                "send destination is empty".to_string(),
            ));
        }
        if self.subscribe_destination.trim().is_empty() {
            return Err(ConfigError::ValidationError(
                "subscribe destination is empty".to_string(),
            ));
        }
        Ok(())
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn receipt_timeout(&self) -> Duration {
        Duration::from_secs(self.receipt_timeout_secs)
    }
}

/// Initial request configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RequestSection {
    pub trader: String,
    /// Comma-separated book owners.
    pub book_owners: String,
}

impl Default for RequestSection {
    fn default() -> Self {
        Self {
            trader: "TRADER001".to_string(),
            book_owners: "OWNER001".to_string(),
        }
    }
}

impl RequestSection {
    fn apply_overrides(&mut self, var: &impl Fn(&str) -> Option<String>) {
        if let Some(trader) = var("STOMPVIEW_TRADER") {
            self.trader = trader;
        }
        if let Some(owners) = var("STOMPVIEW_BOOK_OWNERS") {
            self.book_owners = owners;
        }
    }
}

/// Store configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreSection {
    /// Field that identifies a row.
    pub identity_field: String,
    /// Buffered change notifications per listener.
    pub change_capacity: usize,
}

impl Default for StoreSection {
    fn default() -> Self {
        let store = StoreConfig::default();
        Self {
            identity_field: DEFAULT_IDENTITY_FIELD.to_string(),
            change_capacity: store.change_capacity,
        }
    }
}

impl StoreSection {
    fn apply_overrides(&mut self, var: &impl Fn(&str) -> Option<String>) {
        if let Some(field) = var("STOMPVIEW_ID_FIELD") {
            self.identity_field = field;
        }
    }
}

/// Configuration error.
#[derive(Debug)]
pub enum ConfigError {
    IoError(PathBuf, std::io::Error),
    ParseError(PathBuf, String),
    ValidationError(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::IoError(path, e) => {
                write!(f, "failed to read config file '{}': {}", path.display(), e)
            }
            ConfigError::ParseError(path, e) => {
                write!(f, "failed to parse config file '{}': {}", path.display(), e)
            }
            ConfigError::ValidationError(msg) => {
                write!(f, "configuration validation failed: {}", msg)
            }
        }
    }
}

impl std::error::Error for ConfigError {}
