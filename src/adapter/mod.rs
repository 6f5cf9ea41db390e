//! Provider adapter abstraction.
//!
//! An adapter translates canonical requests into calls against one provider
//! and maps responses and failures back. The dispatcher never branches on
//! provider identity: it only asks an adapter for its [`Capabilities`] and
//! calls [`ProviderAdapter::invoke`] / [`ProviderAdapter::invoke_stream`].

pub mod echo;
pub mod openai_compat;

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use futures::Stream;
use serde::{Deserialize, Serialize};

use crate::canonical::{CanonicalRequest, CanonicalResponse, CanonicalResponseChunk};
use crate::credentials::AuthContext;
use crate::error::ProviderError;
use crate::registry::ModelEntry;

pub use echo::EchoAdapter;
pub use openai_compat::OpenAiCompatAdapter;

/// Optional request features an adapter may support.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Feature {
    Tools,
    Vision,
    Streaming,
    JsonSchema,
    SafetySettings,
    Grounding,
}

impl Feature {
    pub const ALL: [Feature; 6] = [
        Feature::Tools,
        Feature::Vision,
        Feature::Streaming,
        Feature::JsonSchema,
        Feature::SafetySettings,
        Feature::Grounding,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Feature::Tools => "tools",
            Feature::Vision => "vision",
            Feature::Streaming => "streaming",
            Feature::JsonSchema => "json_schema",
            Feature::SafetySettings => "safety_settings",
            Feature::Grounding => "grounding",
        }
    }
}

impl fmt::Display for Feature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The set of features an adapter declares.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Capabilities {
    features: BTreeSet<Feature>,
}

impl Capabilities {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn all() -> Self {
        Feature::ALL.into_iter().collect()
    }

    pub fn with(mut self, feature: Feature) -> Self {
        self.features.insert(feature);
        self
    }

    pub fn without(mut self, feature: Feature) -> Self {
        self.features.remove(&feature);
        self
    }

    pub fn supports(&self, feature: Feature) -> bool {
        self.features.contains(&feature)
    }

    /// Features in `required` this set lacks, in stable order.
    pub fn missing(&self, required: &BTreeSet<Feature>) -> Vec<Feature> {
        required.difference(&self.features).copied().collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = Feature> + '_ {
        self.features.iter().copied()
    }
}

impl FromIterator<Feature> for Capabilities {
    fn from_iter<I: IntoIterator<Item = Feature>>(iter: I) -> Self {
        Self {
            features: iter.into_iter().collect(),
        }
    }
}

/// Lazy, finite sequence of response chunks.
///
/// Dropping the stream early must release any underlying connection.
pub type ChunkStream =
    Pin<Box<dyn Stream<Item = Result<CanonicalResponseChunk, ProviderError>> + Send>>;

/// Everything an adapter needs to know about the candidate it is serving.
#[derive(Debug, Clone, Copy)]
pub struct InvokeContext<'a> {
    pub entry: &'a ModelEntry,
    /// Concrete model id, after wildcard expansion.
    pub target_model: &'a str,
    pub auth: &'a AuthContext,
}

impl<'a> InvokeContext<'a> {
    /// A string option from the entry's options bag.
    pub fn option_str(&self, key: &str) -> Option<&'a str> {
        self.entry.options.get(key).and_then(|v| v.as_str())
    }
}

/// Capability interface every provider integration implements.
#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    /// Provider identifier matched against `ModelEntry::provider_id`.
    fn provider_id(&self) -> &str;

    /// Features this adapter can serve.
    fn capabilities(&self) -> Capabilities;

    /// Send a non-streaming request.
    async fn invoke(
        &self,
        request: &CanonicalRequest,
        ctx: InvokeContext<'_>,
    ) -> Result<CanonicalResponse, ProviderError>;

    /// Open a streaming request.
    ///
    /// Errors returned here (before any chunk) let the dispatcher fall back
    /// to the next candidate. Errors inside the stream belong to the caller.
    async fn invoke_stream(
        &self,
        _request: &CanonicalRequest,
        _ctx: InvokeContext<'_>,
    ) -> Result<ChunkStream, ProviderError> {
        Err(ProviderError::malformed_request(format!(
            "provider '{}' does not implement streaming",
            self.provider_id()
        )))
    }
}

/// Registry of available adapters, keyed by provider id.
#[derive(Clone, Default)]
pub struct AdapterRegistry {
    adapters: HashMap<String, Arc<dyn ProviderAdapter>>,
}

impl AdapterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an adapter, replacing any previous one with the same id.
    pub fn register(&mut self, adapter: Arc<dyn ProviderAdapter>) {
        self.adapters
            .insert(adapter.provider_id().to_string(), adapter);
    }

    pub fn with(mut self, adapter: Arc<dyn ProviderAdapter>) -> Self {
        self.register(adapter);
        self
    }

    pub fn get(&self, provider_id: &str) -> Option<Arc<dyn ProviderAdapter>> {
        self.adapters.get(provider_id).cloned()
    }

    pub fn provider_ids(&self) -> impl Iterator<Item = &str> {
        self.adapters.keys().map(String::as_str)
    }
}

impl fmt::Debug for AdapterRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut ids: Vec<&str> = self.provider_ids().collect();
        ids.sort_unstable();
        f.debug_struct("AdapterRegistry")
            .field("providers", &ids)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_features_are_sorted_and_exact() {
        let caps = Capabilities::none()
            .with(Feature::Streaming)
            .with(Feature::Tools);
        let required: BTreeSet<Feature> =
            [Feature::Vision, Feature::Tools, Feature::JsonSchema].into();
        assert_eq!(
            caps.missing(&required),
            vec![Feature::Vision, Feature::JsonSchema]
        );
    }

    #[test]
    fn test_all_and_without() {
        let caps = Capabilities::all().without(Feature::Grounding);
        assert!(caps.supports(Feature::Tools));
        assert!(!caps.supports(Feature::Grounding));
        assert_eq!(caps.iter().count(), Feature::ALL.len() - 1);
    }

    #[test]
    fn test_registry_replaces_same_provider() {
        let registry = AdapterRegistry::new()
            .with(Arc::new(EchoAdapter::new("echo")))
            .with(Arc::new(
                EchoAdapter::new("echo").with_capabilities(Capabilities::none()),
            ));
        assert_eq!(registry.provider_ids().count(), 1);
        let adapter = registry.get("echo").unwrap();
        assert_eq!(adapter.capabilities(), Capabilities::none());
        assert!(registry.get("missing").is_none());
    }
}
