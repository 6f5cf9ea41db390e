//! Configuration parsing and validation for modelgate.
//!
//! The `[[models]]` list is order-significant: entries sharing an alias form
//! a load-balancing group in file order. Credentials are only parsed here,
//! never resolved.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::credentials::{ApiKey, CredentialRef};
use crate::dispatch::{builtin_callback, AlertKind, DispatchSettings};
use crate::registry::{AliasPattern, ModelEntry, ModelRegistry};
use crate::router::{Router, Strategy};

/// Root configuration structure.
#[derive(Debug, Clone)]
pub struct Config {
    pub server: ServerConfig,
    pub models: Vec<ModelConfig>,
    pub routing: RoutingConfig,
    pub dispatch: DispatchConfig,
    pub alerting: AlertingConfig,
    pub callbacks: CallbacksConfig,
    pub logging: LoggingConfig,
}

/// HTTP server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to listen on (e.g., "127.0.0.1:8080")
    pub listen: String,
    /// Shared secret required as `Authorization: Bearer` when set
    pub master_key: Option<ApiKey>,
    /// Upper bound on requests handled at once; unlimited when unset
    pub max_concurrent_requests: Option<usize>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            master_key: None,
            max_concurrent_requests: None,
        }
    }
}

fn default_listen() -> String {
    "127.0.0.1:8080".to_string()
}

/// One `[[models]]` entry.
#[derive(Debug, Clone, Deserialize)]
pub struct ModelConfig {
    pub alias: String,
    pub provider: String,
    pub model: String,
    /// Omitted for providers that need no credentials (e.g. `echo`)
    #[serde(default)]
    pub credential: Option<CredentialRef>,
    #[serde(default)]
    pub options: BTreeMap<String, serde_json::Value>,
    /// Set when an option references an unset `${VAR}`
    #[serde(skip)]
    pub config_error: Option<String>,
}

impl ModelConfig {
    pub fn to_entry(&self) -> ModelEntry {
        let credential = self
            .credential
            .clone()
            .unwrap_or_else(|| CredentialRef::Inline(ApiKey::from("")));
        let mut entry = ModelEntry::new(&self.alias, &self.provider, &self.model, credential);
        entry.options = self.options.clone();
        entry.config_error = self.config_error.clone();
        entry
    }

    fn expand_options<F>(&mut self, lookup: &F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let owner = format!("model '{}' ({})", self.alias, self.provider);
        for value in self.options.values_mut() {
            if let serde_json::Value::String(s) = value {
                *s = expand_env_vars_with(s, &owner, lookup)?;
            }
        }
        Ok(())
    }
}

/// Routing configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RoutingConfig {
    #[serde(default)]
    pub default_strategy: Strategy,
    /// Per-alias strategy overrides
    #[serde(default)]
    pub aliases: HashMap<String, Strategy>,
}

/// Dispatch timing configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct DispatchConfig {
    #[serde(default = "default_candidate_timeout_secs")]
    pub candidate_timeout_secs: u64,
    #[serde(default = "default_slow_request_threshold_secs")]
    pub slow_request_threshold_secs: u64,
    /// Longest gap between chunks before an open stream is abandoned
    #[serde(default = "default_stream_idle_timeout_secs")]
    pub stream_idle_timeout_secs: u64,
}

fn default_candidate_timeout_secs() -> u64 {
    60
}

fn default_slow_request_threshold_secs() -> u64 {
    30
}

fn default_stream_idle_timeout_secs() -> u64 {
    60
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            candidate_timeout_secs: default_candidate_timeout_secs(),
            slow_request_threshold_secs: default_slow_request_threshold_secs(),
            stream_idle_timeout_secs: default_stream_idle_timeout_secs(),
        }
    }
}

impl DispatchConfig {
    pub fn settings(&self) -> DispatchSettings {
        DispatchSettings {
            candidate_timeout: Duration::from_secs(self.candidate_timeout_secs),
            slow_request_threshold: Duration::from_secs(self.slow_request_threshold_secs),
            stream_idle_timeout: Duration::from_secs(self.stream_idle_timeout_secs),
        }
    }
}

/// Alerting configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct AlertingConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_alert_events")]
    pub events: Vec<AlertKind>,
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
}

fn default_alert_events() -> Vec<AlertKind> {
    AlertKind::ALL.to_vec()
}

fn default_queue_capacity() -> usize {
    256
}

impl Default for AlertingConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            events: default_alert_events(),
            queue_capacity: default_queue_capacity(),
        }
    }
}

/// Success/failure callback configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct CallbacksConfig {
    #[serde(default)]
    pub success: Vec<String>,
    #[serde(default)]
    pub failure: Vec<String>,
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
}

impl Default for CallbacksConfig {
    fn default() -> Self {
        Self {
            success: Vec::new(),
            failure: Vec::new(),
            queue_capacity: default_queue_capacity(),
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file '{path}': {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Configuration validation error: {0}")]
    Validation(String),

    #[error("Environment variable '{var}' not set for '{owner}': {message}")]
    EnvVar {
        var: String,
        owner: String,
        message: String,
    },
}

#[derive(Deserialize, Default)]
struct RawServerConfig {
    #[serde(default = "default_listen")]
    listen: String,
    master_key: Option<String>,
    max_concurrent_requests: Option<usize>,
}

/// Raw configuration deserialized directly from TOML.
/// `master_key` and string options may contain `${VAR}` references not yet expanded.
#[derive(Deserialize)]
struct RawConfig {
    #[serde(default)]
    server: RawServerConfig,
    #[serde(default)]
    models: Vec<ModelConfig>,
    #[serde(default)]
    routing: RoutingConfig,
    #[serde(default)]
    dispatch: DispatchConfig,
    #[serde(default)]
    alerting: AlertingConfig,
    #[serde(default)]
    callbacks: CallbacksConfig,
    #[serde(default)]
    logging: LoggingConfig,
}

/// Expand all `${VAR}` references in a string using a custom lookup function.
///
/// The closure-based design makes this testable without touching global env state.
/// Supports multiple `${VAR}` in one string (e.g., `${SCHEME}://${HOST}/v1`).
/// Fails on first missing variable, unclosed `${`, or empty variable name.
fn expand_env_vars_with<F>(input: &str, owner: &str, lookup: F) -> Result<String, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    if !input.contains("${") {
        return Ok(input.to_string());
    }

    let mut result = String::with_capacity(input.len());
    let mut rest = input;

    while let Some(start) = rest.find("${") {
        result.push_str(&rest[..start]);
        let after = &rest[start + 2..];

        let end = after.find('}').ok_or_else(|| ConfigError::EnvVar {
            var: "<unclosed>".to_string(),
            owner: owner.to_string(),
            message: format!("Unclosed '${{' in config value: {}", input),
        })?;

        let var_name = &after[..end];
        if var_name.is_empty() {
            return Err(ConfigError::EnvVar {
                var: "".to_string(),
                owner: owner.to_string(),
                message: "Empty variable name in '${}' reference".to_string(),
            });
        }

        let value = lookup(var_name).ok_or_else(|| ConfigError::EnvVar {
            var: var_name.to_string(),
            owner: owner.to_string(),
            message: format!(
                "Environment variable '{}' is not set (referenced in '{}')",
                var_name, owner
            ),
        })?;

        result.push_str(&value);
        rest = &after[end + 1..];
    }

    result.push_str(rest);
    Ok(result)
}

impl Config {
    /// Load configuration from a TOML file, expanding `${VAR}` from the environment.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(|e| ConfigError::Io {
            path: path.as_ref().display().to_string(),
            source: e,
        })?;

        Self::parse_str(&content)
    }

    /// Parse configuration from a TOML string.
    pub fn parse_str(content: &str) -> Result<Self, ConfigError> {
        Self::parse_str_with(content, |name| std::env::var(name).ok())
    }

    /// Parse with a custom environment lookup.
    pub fn parse_str_with<F>(content: &str, lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let raw: RawConfig = toml::from_str(content).map_err(ConfigError::Parse)?;
        let config = Self::from_raw(raw, &lookup)?;
        config.validate()?;
        Ok(config)
    }

    fn from_raw<F>(raw: RawConfig, lookup: &F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let master_key = raw
            .server
            .master_key
            .map(|key| expand_env_vars_with(&key, "server.master_key", lookup))
            .transpose()?
            .map(ApiKey::from);

        // An unresolvable option only disables its own entry
        let mut models = raw.models;
        for model in &mut models {
            if let Err(e) = model.expand_options(lookup) {
                tracing::warn!(
                    alias = %model.alias,
                    provider = %model.provider,
                    error = %e,
                    "Model entry will be skipped until its options resolve"
                );
                model.config_error = Some(e.to_string());
            }
        }

        Ok(Config {
            server: ServerConfig {
                listen: raw.server.listen,
                master_key,
                max_concurrent_requests: raw.server.max_concurrent_requests,
            },
            models,
            routing: raw.routing,
            dispatch: raw.dispatch,
            alerting: raw.alerting,
            callbacks: raw.callbacks,
            logging: raw.logging,
        })
    }

    /// Validate the configuration.
    fn validate(&self) -> Result<(), ConfigError> {
        if self.models.is_empty() {
            tracing::warn!("No models configured - gateway will reject all requests");
        }

        for (index, model) in self.models.iter().enumerate() {
            let position = index + 1;
            if model.provider.trim().is_empty() {
                return Err(ConfigError::Validation(format!(
                    "Model #{} ('{}') has an empty provider",
                    position, model.alias
                )));
            }
            if model.model.trim().is_empty() {
                return Err(ConfigError::Validation(format!(
                    "Model #{} ('{}') has an empty target model",
                    position, model.alias
                )));
            }
            AliasPattern::parse(&model.alias).map_err(|e| {
                ConfigError::Validation(format!("Model #{}: {}", position, e))
            })?;
        }

        if self.server.max_concurrent_requests == Some(0) {
            return Err(ConfigError::Validation(
                "server.max_concurrent_requests must be greater than zero".to_string(),
            ));
        }

        if self.dispatch.candidate_timeout_secs == 0 {
            return Err(ConfigError::Validation(
                "dispatch.candidate_timeout_secs must be greater than zero".to_string(),
            ));
        }
        if self.dispatch.slow_request_threshold_secs == 0 {
            return Err(ConfigError::Validation(
                "dispatch.slow_request_threshold_secs must be greater than zero".to_string(),
            ));
        }
        if self.dispatch.stream_idle_timeout_secs == 0 {
            return Err(ConfigError::Validation(
                "dispatch.stream_idle_timeout_secs must be greater than zero".to_string(),
            ));
        }
        if self.dispatch.slow_request_threshold_secs > self.dispatch.candidate_timeout_secs {
            tracing::warn!(
                threshold = self.dispatch.slow_request_threshold_secs,
                timeout = self.dispatch.candidate_timeout_secs,
                "Slow-request threshold exceeds candidate timeout; llm_too_slow will never fire"
            );
        }

        for name in self.callbacks.success.iter().chain(&self.callbacks.failure) {
            if builtin_callback(name).is_none() {
                return Err(ConfigError::Validation(format!(
                    "Unknown callback '{}' (available: usage_log)",
                    name
                )));
            }
        }

        Ok(())
    }

    /// Registry entries in file order.
    pub fn entries(&self) -> Vec<ModelEntry> {
        self.models.iter().map(ModelConfig::to_entry).collect()
    }

    pub fn registry(&self) -> Result<ModelRegistry, ConfigError> {
        ModelRegistry::from_entries(self.entries())
            .map_err(|e| ConfigError::Validation(e.to_string()))
    }

    /// Router over this configuration's registry with its strategies applied.
    pub fn router(&self) -> Result<Router, ConfigError> {
        let router = self
            .routing
            .aliases
            .iter()
            .fold(
                Router::new(self.registry()?).with_default_strategy(self.routing.default_strategy),
                |router, (alias, strategy)| router.with_alias_strategy(alias, *strategy),
            );
        Ok(router)
    }
}
