//! TOML Configuration File Support
//!
//! Loads gateway settings from `~/.config/chat-gateway/gateway.toml`.
//!
//! # Configuration Priority
//!
//! Configuration values are loaded with the following priority (highest first):
//! 1. CLI arguments (see [`ConfigOverrides`])
//! 2. Environment variables (`GATEWAY_*`, plus `OLLAMA_HOST`/`OLLAMA_PORT`)
//! 3. TOML configuration file
//! 4. Default values
//!
//! # Example Configuration
//!
//! ```toml
//! [provider]
//! kind = "openai_compatible"
//! endpoint = "https://api.openai.com/v1"
//! model = "gpt-4o-mini"
//! credential_env = "OPENAI_API_KEY"
//!
//! [session]
//! history_window = 20
//! system_instructions = "You are a concise assistant."
//! max_response_bytes = 1048576
//! idle_timeout_secs = 60
//!
//! [retrieval]
//! web_search = true
//! documents = false
//! top_k = 5
//!
//! [server]
//! host = "127.0.0.1"
//! port = 8080
//! ```

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::messages::{ProviderConfig, ProviderKind};
use crate::retrieval::RetrievalConfig;
use crate::session::SessionConfig;
use crate::streaming::DispatcherConfig;

// =============================================================================
// Error Types
// =============================================================================

/// Errors that can occur when loading configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read config file
    #[error("Failed to read config file at {path}: {source}")]
    ReadError {
        /// The path that was attempted
        path: PathBuf,
        /// The underlying IO error
        source: std::io::Error,
    },

    /// Failed to parse TOML
    #[error("Failed to parse TOML config: {0}")]
    ParseError(#[from] toml::de::Error),

    /// Invalid configuration value
    #[error("Invalid configuration: {0}")]
    ValidationError(String),
}

/// Tracks where the effective configuration came from
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConfigSource {
    /// Value from command-line argument
    Cli,
    /// Value from environment variable
    Env,
    /// Value from TOML configuration file
    File,
    /// Default value
    Default,
}

impl std::fmt::Display for ConfigSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Cli => write!(f, "CLI"),
            Self::Env => write!(f, "environment"),
            Self::File => write!(f, "config file"),
            Self::Default => write!(f, "default"),
        }
    }
}

// =============================================================================
// TOML Configuration Structures
// =============================================================================

/// Provider section of the TOML configuration
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderToml {
    /// Vendor family (`ollama`, `openai_compatible`, `anthropic`)
    pub kind: Option<ProviderKind>,

    /// Base URL of the vendor API
    pub endpoint: Option<String>,

    /// Model identifier
    pub model: Option<String>,

    /// Environment variable holding the API key
    pub credential_env: Option<String>,
}

/// Session section of the TOML configuration
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionToml {
    /// Persisted messages included in a prompt
    pub history_window: Option<usize>,

    /// System turn prepended to every prompt
    pub system_instructions: Option<String>,

    /// Cap on one response in bytes
    pub max_response_bytes: Option<usize>,

    /// Tokens between intermediate writes (0 disables them)
    pub flush_every: Option<usize>,

    /// Tokens buffered between the vendor read loop and the session
    pub channel_capacity: Option<usize>,

    /// Longest wait for the next vendor chunk
    pub idle_timeout_secs: Option<u64>,

    /// Longest wait for the TCP/TLS connection
    pub connect_timeout_secs: Option<u64>,

    /// Cap on one unterminated vendor frame in bytes
    pub max_frame_bytes: Option<usize>,

    /// Consecutive unparseable frames tolerated
    pub max_consecutive_bad_frames: Option<u32>,
}

/// Retrieval section of the TOML configuration
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrievalToml {
    /// Whether the web-search path is available
    pub web_search: Option<bool>,

    /// Instant Answer endpoint override
    pub search_endpoint: Option<String>,

    /// Whether the document path is available
    pub documents: Option<bool>,

    /// Ollama server used for embeddings
    pub embedding_endpoint: Option<String>,

    /// Embedding model
    pub embedding_model: Option<String>,

    /// Chunks returned by the document path
    pub top_k: Option<usize>,
}

/// Server section of the TOML configuration
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerToml {
    /// Listen address
    pub host: Option<String>,

    /// Listen port
    pub port: Option<u16>,
}

/// Top-level TOML configuration structure
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayToml {
    /// Provider configuration section
    pub provider: ProviderToml,

    /// Session configuration section
    pub session: SessionToml,

    /// Retrieval configuration section
    pub retrieval: RetrievalToml,

    /// Server configuration section
    pub server: ServerToml,
}

// =============================================================================
// Main Configuration Struct
// =============================================================================

/// HTTP listener settings
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ServerConfig {
    /// Listen address
    pub host: String,
    /// Listen port
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8080,
        }
    }
}

impl ServerConfig {
    /// `host:port` string for binding
    #[must_use]
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Effective gateway configuration
#[derive(Clone, Debug)]
pub struct GatewayConfig {
    /// Provider for new sessions
    pub provider: ProviderConfig,

    /// Session behavior
    pub session: SessionConfig,

    /// Vendor stream limits
    pub dispatcher: DispatcherConfig,

    /// Connect timeout for vendor and collaborator HTTP calls
    pub connect_timeout: Duration,

    /// Retrieval collaborators
    pub retrieval: RetrievalConfig,

    /// HTTP listener
    pub server: ServerConfig,

    /// Path to the config file that was loaded (if any)
    pub config_file_path: Option<PathBuf>,

    source: ConfigSource,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            provider: ProviderConfig::default(),
            session: SessionConfig::default(),
            dispatcher: DispatcherConfig::default(),
            connect_timeout: Duration::from_secs(10),
            retrieval: RetrievalConfig::default(),
            server: ServerConfig::default(),
            config_file_path: None,
            source: ConfigSource::Default,
        }
    }
}

impl GatewayConfig {
    /// Create a new configuration with default values
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the primary source of this configuration
    #[must_use]
    pub fn source(&self) -> ConfigSource {
        self.source
    }

    /// Set the configuration source
    pub fn set_source(&mut self, source: ConfigSource) {
        self.source = source;
    }

    /// Reject values the runtime cannot work with
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::ValidationError`] naming the first bad value.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let checks = [
            (self.session.history_window == 0, "session.history_window must be positive"),
            (self.session.max_response_bytes == 0, "session.max_response_bytes must be positive"),
            (self.dispatcher.channel_capacity == 0, "session.channel_capacity must be positive"),
            (self.dispatcher.idle_timeout.is_zero(), "session.idle_timeout_secs must be positive"),
            (self.dispatcher.max_frame_bytes == 0, "session.max_frame_bytes must be positive"),
            (
                self.dispatcher.max_consecutive_bad_frames == 0,
                "session.max_consecutive_bad_frames must be positive",
            ),
            (self.retrieval.top_k == 0, "retrieval.top_k must be positive"),
            (self.provider.endpoint.trim().is_empty(), "provider.endpoint must not be empty"),
            (self.provider.model.trim().is_empty(), "provider.model must not be empty"),
        ];

        match checks.iter().find(|(failed, _)| *failed) {
            Some((_, reason)) => Err(ConfigError::ValidationError((*reason).to_string())),
            None => Ok(()),
        }
    }
}

// =============================================================================
// Configuration Loading
// =============================================================================

/// Get the default configuration file path
///
/// Returns `$XDG_CONFIG_HOME/chat-gateway/gateway.toml` or
/// `~/.config/chat-gateway/gateway.toml` if `XDG_CONFIG_HOME` is not set.
#[must_use]
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|p| p.join("chat-gateway").join("gateway.toml"))
}

/// Load configuration from all sources with proper priority
///
/// # Errors
///
/// Returns an error if the config file exists but cannot be parsed, or if the
/// resulting values fail validation. A missing config file is not an error.
pub fn load_config() -> Result<GatewayConfig, ConfigError> {
    load_config_from_path(default_config_path())
}

/// Load configuration from a specific path, then the process environment
///
/// # Errors
///
/// Returns an error if the specified config file cannot be read or parsed.
pub fn load_config_from_path(path: Option<PathBuf>) -> Result<GatewayConfig, ConfigError> {
    load_config_with_env(path, |key| std::env::var(key).ok())
}

/// Load configuration using `env` to look up environment variables
///
/// # Errors
///
/// Returns an error if the specified config file cannot be read or parsed, or
/// if the merged values fail validation.
pub fn load_config_with_env(
    path: Option<PathBuf>,
    env: impl Fn(&str) -> Option<String>,
) -> Result<GatewayConfig, ConfigError> {
    let mut config = GatewayConfig::default();

    if let Some(ref config_path) = path {
        if config_path.exists() {
            let toml_content =
                std::fs::read_to_string(config_path).map_err(|e| ConfigError::ReadError {
                    path: config_path.clone(),
                    source: e,
                })?;

            let toml_config: GatewayToml = toml::from_str(&toml_content)?;
            apply_toml_config(&mut config, &toml_config);
            config.config_file_path = Some(config_path.clone());
            config.source = ConfigSource::File;

            tracing::info!(
                path = %config_path.display(),
                "Loaded configuration from file"
            );
        } else {
            tracing::debug!(
                path = %config_path.display(),
                "Config file not found, using defaults"
            );
        }
    }

    apply_env_config(&mut config, env);
    config.validate()?;

    Ok(config)
}

/// Apply TOML configuration values to the config struct
fn apply_toml_config(config: &mut GatewayConfig, toml: &GatewayToml) {
    // Provider settings
    if let Some(kind) = toml.provider.kind {
        config.provider.kind = kind;
    }
    if let Some(ref endpoint) = toml.provider.endpoint {
        config.provider.endpoint = endpoint.clone();
    }
    if let Some(ref model) = toml.provider.model {
        config.provider.model = model.clone();
    }
    if toml.provider.credential_env.is_some() {
        config.provider.credential_env = toml.provider.credential_env.clone();
    }

    // Session settings
    if let Some(window) = toml.session.history_window {
        config.session.history_window = window;
    }
    if toml.session.system_instructions.is_some() {
        config.session.system_instructions = toml.session.system_instructions.clone();
    }
    if let Some(bytes) = toml.session.max_response_bytes {
        config.session.max_response_bytes = bytes;
    }
    if let Some(every) = toml.session.flush_every {
        config.session.flush_every = every;
    }
    if let Some(capacity) = toml.session.channel_capacity {
        config.dispatcher.channel_capacity = capacity;
    }
    if let Some(secs) = toml.session.idle_timeout_secs {
        config.dispatcher.idle_timeout = Duration::from_secs(secs);
    }
    if let Some(secs) = toml.session.connect_timeout_secs {
        config.connect_timeout = Duration::from_secs(secs);
    }
    if let Some(bytes) = toml.session.max_frame_bytes {
        config.dispatcher.max_frame_bytes = bytes;
    }
    if let Some(max_bad) = toml.session.max_consecutive_bad_frames {
        config.dispatcher.max_consecutive_bad_frames = max_bad;
    }

    // Retrieval settings
    if let Some(enabled) = toml.retrieval.web_search {
        config.retrieval.web_search = enabled;
    }
    if toml.retrieval.search_endpoint.is_some() {
        config.retrieval.search_endpoint = toml.retrieval.search_endpoint.clone();
    }
    if let Some(enabled) = toml.retrieval.documents {
        config.retrieval.documents = enabled;
    }
    if let Some(ref endpoint) = toml.retrieval.embedding_endpoint {
        config.retrieval.embedding_endpoint = endpoint.clone();
    }
    if let Some(ref model) = toml.retrieval.embedding_model {
        config.retrieval.embedding_model = model.clone();
    }
    if let Some(top_k) = toml.retrieval.top_k {
        config.retrieval.top_k = top_k;
    }

    // Server settings
    if let Some(ref host) = toml.server.host {
        config.server.host = host.clone();
    }
    if let Some(port) = toml.server.port {
        config.server.port = port;
    }
}

/// Apply environment variable overrides to the config
fn apply_env_config(config: &mut GatewayConfig, env: impl Fn(&str) -> Option<String>) {
    let mut from_env = false;

    if let Some(kind) = env("GATEWAY_PROVIDER").and_then(|v| v.parse::<ProviderKind>().ok()) {
        config.provider.kind = kind;
        from_env = true;
    }

    // OLLAMA_HOST / OLLAMA_PORT only describe an Ollama server
    if config.provider.kind == ProviderKind::Ollama {
        if let Some(endpoint) = ollama_endpoint(env("OLLAMA_HOST"), env("OLLAMA_PORT")) {
            config.retrieval.embedding_endpoint = endpoint.clone();
            config.provider.endpoint = endpoint;
            from_env = true;
        }
    }

    if let Some(endpoint) = env("GATEWAY_ENDPOINT") {
        config.provider.endpoint = endpoint;
        from_env = true;
    }
    if let Some(model) = env("GATEWAY_MODEL") {
        config.provider.model = model;
        from_env = true;
    }
    if let Some(var) = env("GATEWAY_CREDENTIAL_ENV") {
        config.provider.credential_env = Some(var);
        from_env = true;
    }
    if let Some(window) = env("GATEWAY_HISTORY_WINDOW").and_then(|v| v.parse().ok()) {
        config.session.history_window = window;
        from_env = true;
    }
    if let Some(instructions) = env("GATEWAY_SYSTEM_INSTRUCTIONS") {
        config.session.system_instructions = Some(instructions);
        from_env = true;
    }
    if let Some(bytes) = env("GATEWAY_MAX_RESPONSE_BYTES").and_then(|v| v.parse().ok()) {
        config.session.max_response_bytes = bytes;
        from_env = true;
    }
    if let Some(secs) = env("GATEWAY_IDLE_TIMEOUT").and_then(|v| v.parse().ok()) {
        config.dispatcher.idle_timeout = Duration::from_secs(secs);
        from_env = true;
    }
    if let Some(enabled) = env("GATEWAY_WEB_SEARCH") {
        config.retrieval.web_search = enabled != "0" && enabled.to_lowercase() != "false";
        from_env = true;
    }
    if let Some(host) = env("GATEWAY_HOST") {
        config.server.host = host;
        from_env = true;
    }
    if let Some(port) = env("GATEWAY_PORT").and_then(|v| v.parse().ok()) {
        config.server.port = port;
        from_env = true;
    }

    if from_env {
        config.source = ConfigSource::Env;
    }
}

/// Build an Ollama base URL from host and port variables
///
/// `OLLAMA_HOST` may be a bare host, `host:port`, or a full URL.
fn ollama_endpoint(host: Option<String>, port: Option<String>) -> Option<String> {
    if host.is_none() && port.is_none() {
        return None;
    }

    let host = host
        .filter(|h| !h.is_empty())
        .unwrap_or_else(|| "localhost".to_string());
    if host.starts_with("http://") || host.starts_with("https://") {
        return Some(host.trim_end_matches('/').to_string());
    }
    if host.contains(':') {
        return Some(format!("http://{host}"));
    }

    let port: u16 = port.and_then(|p| p.parse().ok()).unwrap_or(11434);
    Some(format!("http://{host}:{port}"))
}

// =============================================================================
// CLI Override Support
// =============================================================================

/// Builder for applying CLI overrides to configuration
///
/// Use this after [`load_config`] to apply command-line argument overrides.
#[derive(Clone, Debug, Default)]
pub struct ConfigOverrides {
    /// Provider kind override
    pub provider: Option<ProviderKind>,

    /// Provider endpoint override
    pub endpoint: Option<String>,

    /// Model override
    pub model: Option<String>,

    /// Listen host override
    pub host: Option<String>,

    /// Listen port override
    pub port: Option<u16>,
}

impl ConfigOverrides {
    /// Create a new empty set of overrides
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set provider kind override
    #[must_use]
    pub fn with_provider(mut self, kind: ProviderKind) -> Self {
        self.provider = Some(kind);
        self
    }

    /// Set endpoint override
    #[must_use]
    pub fn with_endpoint(mut self, endpoint: String) -> Self {
        self.endpoint = Some(endpoint);
        self
    }

    /// Set model override
    #[must_use]
    pub fn with_model(mut self, model: String) -> Self {
        self.model = Some(model);
        self
    }

    /// Set listen host override
    #[must_use]
    pub fn with_host(mut self, host: String) -> Self {
        self.host = Some(host);
        self
    }

    /// Set listen port override
    #[must_use]
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    /// Apply overrides to a configuration
    pub fn apply(&self, config: &mut GatewayConfig) {
        if self.provider.is_some()
            || self.endpoint.is_some()
            || self.model.is_some()
            || self.host.is_some()
            || self.port.is_some()
        {
            config.source = ConfigSource::Cli;
        }

        if let Some(kind) = self.provider {
            config.provider.kind = kind;
        }
        if let Some(ref endpoint) = self.endpoint {
            config.provider.endpoint = endpoint.clone();
        }
        if let Some(ref model) = self.model {
            config.provider.model = model.clone();
        }
        if let Some(ref host) = self.host {
            config.server.host = host.clone();
        }
        if let Some(port) = self.port {
            config.server.port = port;
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
