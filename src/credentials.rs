//! Credential references and their resolution to provider auth contexts.
//!
//! Resolution is fail-late: nothing is resolved while the configuration is
//! loaded, so one broken credential only affects requests that actually
//! route to the entry using it. Successful resolutions are cached per
//! reference; failures are not, so fixing the environment or the file takes
//! effect on the next request.

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// API key wrapper that redacts in Debug/Display/Serialize and zeroizes on drop.
///
/// The inner `SecretString` ensures the key value is:
/// - Zeroized in memory when dropped
/// - Never exposed via Debug or Display
/// - Only accessible via `.expose_secret()` (grep-auditable)
#[derive(Clone)]
pub struct ApiKey(SecretString);

impl ApiKey {
    /// Access the raw key value. Every call site is auditable via `grep expose_secret`.
    pub fn expose_secret(&self) -> &str {
        self.0.expose_secret()
    }
}

impl fmt::Debug for ApiKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[REDACTED]")
    }
}

impl fmt::Display for ApiKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[REDACTED]")
    }
}

impl Serialize for ApiKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str("[REDACTED]")
    }
}

impl<'de> Deserialize<'de> for ApiKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        String::deserialize(deserializer).map(|s| ApiKey(SecretString::from(s)))
    }
}

impl From<String> for ApiKey {
    fn from(s: String) -> Self {
        ApiKey(SecretString::from(s))
    }
}

impl From<&str> for ApiKey {
    fn from(s: &str) -> Self {
        ApiKey(SecretString::from(s))
    }
}

/// Expected content of a credential file.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SecretFormat {
    /// The whole file (trimmed) is the key.
    #[default]
    Text,
    /// A cloud service-account JSON document.
    ServiceAccount,
}

impl fmt::Display for SecretFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SecretFormat::Text => write!(f, "text"),
            SecretFormat::ServiceAccount => write!(f, "service-account JSON"),
        }
    }
}

/// Where a model entry's credentials come from.
///
/// In TOML either a tagged table or a shorthand string:
/// - `"${VAR}"` → [`CredentialRef::EnvVar`]
/// - `"file:/path/to/key"` → [`CredentialRef::FilePath`] (text format)
/// - anything else → [`CredentialRef::Inline`]
#[derive(Debug, Clone)]
pub enum CredentialRef {
    Inline(ApiKey),
    EnvVar(String),
    FilePath { path: PathBuf, format: SecretFormat },
}

impl CredentialRef {
    /// Parse the shorthand string form.
    pub fn parse_shorthand(value: &str) -> Result<Self, String> {
        if let Some(path) = value.strip_prefix("file:") {
            if path.is_empty() {
                return Err("Empty path in 'file:' credential".to_string());
            }
            return Ok(CredentialRef::FilePath {
                path: PathBuf::from(path),
                format: SecretFormat::Text,
            });
        }

        if value.contains("${") {
            let name = value
                .strip_prefix("${")
                .and_then(|rest| rest.strip_suffix('}'))
                .ok_or_else(|| {
                    format!(
                        "Credential shorthand must be exactly '${{VAR}}', got '{}'",
                        value
                    )
                })?;
            if name.is_empty() || name.contains(['{', '}', '$']) {
                return Err(format!("Invalid variable name in credential '{}'", value));
            }
            return Ok(CredentialRef::EnvVar(name.to_string()));
        }

        Ok(CredentialRef::Inline(ApiKey::from(value)))
    }

    /// Redacted, human-readable form for logs and error reports.
    pub fn describe(&self) -> String {
        match self {
            CredentialRef::Inline(_) => "inline".to_string(),
            CredentialRef::EnvVar(name) => format!("env:{}", name),
            CredentialRef::FilePath { path, .. } => format!("file:{}", path.display()),
        }
    }
}

impl fmt::Display for CredentialRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.describe())
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawCredential {
    Shorthand(String),
    Tagged(TaggedCredential),
}

#[derive(Deserialize)]
#[serde(rename_all = "snake_case")]
enum TaggedCredential {
    Inline(String),
    EnvVar(String),
    FilePath(FileCredential),
}

#[derive(Deserialize)]
struct FileCredential {
    path: PathBuf,
    #[serde(default)]
    format: SecretFormat,
}

impl<'de> Deserialize<'de> for CredentialRef {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        match RawCredential::deserialize(deserializer)? {
            RawCredential::Shorthand(s) => {
                CredentialRef::parse_shorthand(&s).map_err(serde::de::Error::custom)
            }
            RawCredential::Tagged(TaggedCredential::Inline(v)) => {
                Ok(CredentialRef::Inline(ApiKey::from(v)))
            }
            RawCredential::Tagged(TaggedCredential::EnvVar(name)) => {
                Ok(CredentialRef::EnvVar(name))
            }
            RawCredential::Tagged(TaggedCredential::FilePath(file)) => Ok(CredentialRef::FilePath {
                path: file.path,
                format: file.format,
            }),
        }
    }
}

/// Parsed service-account document.
#[derive(Clone, Debug, Deserialize)]
pub struct ServiceAccount {
    #[serde(rename = "type")]
    pub kind: String,
    pub project_id: String,
    pub client_email: String,
    pub private_key: ApiKey,
    #[serde(default)]
    pub token_uri: Option<String>,
}

/// Concrete auth material handed to an adapter.
#[derive(Clone, Debug)]
pub enum AuthContext {
    ApiKey(ApiKey),
    ServiceAccount(Arc<ServiceAccount>),
}

impl AuthContext {
    /// The bearer token, for adapters that authenticate with one.
    pub fn api_key(&self) -> Option<&str> {
        match self {
            AuthContext::ApiKey(key) => Some(key.expose_secret()),
            AuthContext::ServiceAccount(_) => None,
        }
    }
}

/// Credential resolution failure. Surfaces as a skipped candidate.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CredentialError {
    #[error("environment variable '{name}' is not set")]
    EnvVarMissing { name: String },

    #[error("environment variable '{name}' is empty")]
    EnvVarEmpty { name: String },

    #[error("cannot read credential file '{path}': {message}")]
    Unreadable { path: String, message: String },

    #[error("credential file '{path}' is not a valid {format} secret: {message}")]
    InvalidFormat {
        path: String,
        format: SecretFormat,
        message: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum CacheKey {
    Env(String),
    File(PathBuf, SecretFormat),
}

type EnvLookup = dyn Fn(&str) -> Option<String> + Send + Sync;

/// Resolves [`CredentialRef`]s and caches the results.
///
/// Safe for concurrent use. Two tasks missing the cache for the same
/// reference may both resolve it; the first insert wins and both observe
/// equivalent values.
pub struct CredentialResolver {
    cache: DashMap<CacheKey, AuthContext>,
    env: Box<EnvLookup>,
}

impl Default for CredentialResolver {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for CredentialResolver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CredentialResolver")
            .field("cached", &self.cache.len())
            .finish()
    }
}

impl CredentialResolver {
    /// Resolver reading the real process environment.
    pub fn new() -> Self {
        Self::with_env_lookup(|name| std::env::var(name).ok())
    }

    /// Resolver using a custom environment lookup.
    ///
    /// Lets tests resolve `EnvVar` references without touching global env state.
    pub fn with_env_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String> + Send + Sync + 'static,
    {
        Self {
            cache: DashMap::new(),
            env: Box::new(lookup),
        }
    }

    /// Resolve a reference to an auth context.
    pub fn resolve(&self, credential: &CredentialRef) -> Result<AuthContext, CredentialError> {
        let key = match credential {
            CredentialRef::Inline(key) => return Ok(AuthContext::ApiKey(key.clone())),
            CredentialRef::EnvVar(name) => CacheKey::Env(name.clone()),
            CredentialRef::FilePath { path, format } => CacheKey::File(path.clone(), *format),
        };

        if let Some(hit) = self.cache.get(&key) {
            return Ok(hit.value().clone());
        }

        // Resolve without holding a shard lock
        let resolved = match &key {
            CacheKey::Env(name) => self.resolve_env(name)?,
            CacheKey::File(path, format) => resolve_file(path, *format)?,
        };

        tracing::debug!(credential = %credential, "Resolved credential");
        Ok(self.cache.entry(key).or_insert(resolved).value().clone())
    }

    fn resolve_env(&self, name: &str) -> Result<AuthContext, CredentialError> {
        let value = (self.env)(name).ok_or_else(|| CredentialError::EnvVarMissing {
            name: name.to_string(),
        })?;
        if value.trim().is_empty() {
            return Err(CredentialError::EnvVarEmpty {
                name: name.to_string(),
            });
        }
        Ok(AuthContext::ApiKey(ApiKey::from(value)))
    }

    /// Number of cached resolutions.
    pub fn cached_len(&self) -> usize {
        self.cache.len()
    }

    /// Drop every cached resolution (used when the registry is reloaded).
    pub fn clear(&self) {
        self.cache.clear();
    }
}

fn resolve_file(path: &std::path::Path, format: SecretFormat) -> Result<AuthContext, CredentialError> {
    let display = path.display().to_string();
    let content = std::fs::read_to_string(path).map_err(|e| CredentialError::Unreadable {
        path: display.clone(),
        message: e.to_string(),
    })?;

    match format {
        SecretFormat::Text => {
            let key = content.trim();
            if key.is_empty() {
                return Err(CredentialError::InvalidFormat {
                    path: display,
                    format,
                    message: "file is empty".to_string(),
                });
            }
            Ok(AuthContext::ApiKey(ApiKey::from(key)))
        }
        SecretFormat::ServiceAccount => {
            let account: ServiceAccount =
                serde_json::from_str(&content).map_err(|e| CredentialError::InvalidFormat {
                    path: display.clone(),
                    format,
                    message: e.to_string(),
                })?;
            if account.kind != "service_account" {
                return Err(CredentialError::InvalidFormat {
                    path: display,
                    format,
                    message: format!("expected type 'service_account', got '{}'", account.kind),
                });
            }
            Ok(AuthContext::ServiceAccount(Arc::new(account)))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lookup(name: &str) -> Option<String> {
        match name {
            "OPENAI_KEY" => Some("sk-from-env".to_string()),
            "BLANK_KEY" => Some("   ".to_string()),
            _ => None,
        }
    }

    #[test]
    fn test_api_key_debug_redaction() {
        let key = ApiKey::from("super-secret-token");
        let debug_output = format!("{:?}", key);
        assert_eq!(debug_output, "[REDACTED]");
        assert!(!debug_output.contains("super-secret"));
    }

    #[test]
    fn test_api_key_serialize_redaction() {
        let key = ApiKey::from("real-secret-value");
        let json = serde_json::to_string(&key).unwrap();
        assert_eq!(json, "\"[REDACTED]\"");
    }

    #[test]
    fn test_inline_credential_debug_redaction() {
        let cred = CredentialRef::Inline(ApiKey::from("sk-inline-secret"));
        let debug = format!("{:?}", cred);
        assert!(!debug.contains("sk-inline-secret"));
        assert_eq!(cred.describe(), "inline");
    }

    #[test]
    fn test_shorthand_env_var() {
        let cred = CredentialRef::parse_shorthand("${OPENAI_KEY}").unwrap();
        assert!(matches!(cred, CredentialRef::EnvVar(ref n) if n == "OPENAI_KEY"));
    }

    #[test]
    fn test_shorthand_file() {
        let cred = CredentialRef::parse_shorthand("file:/etc/key.txt").unwrap();
        assert_eq!(cred.describe(), "file:/etc/key.txt");
    }

    #[test]
    fn test_shorthand_inline() {
        let cred = CredentialRef::parse_shorthand("sk-literal").unwrap();
        assert!(matches!(cred, CredentialRef::Inline(ref k) if k.expose_secret() == "sk-literal"));
    }

    #[test]
    fn test_shorthand_rejects_embedded_reference() {
        let err = CredentialRef::parse_shorthand("Bearer ${OPENAI_KEY}").unwrap_err();
        assert!(err.contains("exactly"), "{}", err);
        assert!(CredentialRef::parse_shorthand("${}").is_err());
        assert!(CredentialRef::parse_shorthand("${UNCLOSED").is_err());
    }

    #[test]
    fn test_tagged_deserialization() {
        #[derive(Deserialize)]
        struct Holder {
            credential: CredentialRef,
        }
        let holder: Holder = toml::from_str(
            r#"credential = { file_path = { path = "/sa.json", format = "service_account" } }"#,
        )
        .unwrap();
        assert!(matches!(
            holder.credential,
            CredentialRef::FilePath {
                format: SecretFormat::ServiceAccount,
                ..
            }
        ));

        let holder: Holder = toml::from_str(r#"credential = { env_var = "X_KEY" }"#).unwrap();
        assert_eq!(holder.credential.describe(), "env:X_KEY");
    }

    #[test]
    fn test_resolve_inline_verbatim() {
        let resolver = CredentialResolver::with_env_lookup(|_| None);
        let ctx = resolver
            .resolve(&CredentialRef::Inline(ApiKey::from("  spaced  ")))
            .unwrap();
        assert_eq!(ctx.api_key(), Some("  spaced  "));
        assert_eq!(resolver.cached_len(), 0);
    }

    #[test]
    fn test_resolve_env_present_and_cached() {
        let resolver = CredentialResolver::with_env_lookup(lookup);
        let cred = CredentialRef::EnvVar("OPENAI_KEY".to_string());
        let first = resolver.resolve(&cred).unwrap();
        let second = resolver.resolve(&cred).unwrap();
        assert_eq!(first.api_key(), Some("sk-from-env"));
        assert_eq!(second.api_key(), Some("sk-from-env"));
        assert_eq!(resolver.cached_len(), 1);
    }

    #[test]
    fn test_resolve_env_missing() {
        let resolver = CredentialResolver::with_env_lookup(lookup);
        let err = resolver
            .resolve(&CredentialRef::EnvVar("NOPE".to_string()))
            .unwrap_err();
        assert_eq!(
            err,
            CredentialError::EnvVarMissing {
                name: "NOPE".to_string()
            }
        );
        assert_eq!(resolver.cached_len(), 0, "failures are not cached");
    }

    #[test]
    fn test_resolve_env_empty() {
        let resolver = CredentialResolver::with_env_lookup(lookup);
        let err = resolver
            .resolve(&CredentialRef::EnvVar("BLANK_KEY".to_string()))
            .unwrap_err();
        assert!(matches!(err, CredentialError::EnvVarEmpty { .. }));
    }

    #[test]
    fn test_resolve_missing_file() {
        let resolver = CredentialResolver::with_env_lookup(|_| None);
        let err = resolver
            .resolve(&CredentialRef::FilePath {
                path: PathBuf::from("/definitely/not/here/key.txt"),
                format: SecretFormat::Text,
            })
            .unwrap_err();
        assert!(matches!(err, CredentialError::Unreadable { .. }));
    }
}
