//! Model registry: alias → configured provider targets.
//!
//! Matching is tiered, most specific first:
//! 1. exact alias
//! 2. prefix wildcard (`"openai/*"`), longer prefixes first, then registration order
//! 3. catch-all `"*"`
//!
//! Entries sharing an exact alias form a load-balancing group and are
//! returned in registration order. Reordering is the router's job.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use crate::credentials::CredentialRef;
use crate::error::DispatchError;

/// One configured model target. Immutable once registered.
#[derive(Debug, Clone)]
pub struct ModelEntry {
    pub alias: String,
    pub provider_id: String,
    /// Provider model id; `*` (or a trailing `*`) is filled from the request alias.
    pub target_model: String,
    pub credential: CredentialRef,
    /// Free-form per-entry options (base_url, region, rates, ...).
    pub options: BTreeMap<String, serde_json::Value>,
    /// Load-time problem confined to this entry; it is skipped when routed to.
    pub config_error: Option<String>,
}

impl ModelEntry {
    pub fn new(
        alias: impl Into<String>,
        provider_id: impl Into<String>,
        target_model: impl Into<String>,
        credential: CredentialRef,
    ) -> Self {
        Self {
            alias: alias.into(),
            provider_id: provider_id.into(),
            target_model: target_model.into(),
            credential,
            options: BTreeMap::new(),
            config_error: None,
        }
    }

    pub fn with_option(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.options.insert(key.into(), value.into());
        self
    }

    pub fn with_config_error(mut self, message: impl Into<String>) -> Self {
        self.config_error = Some(message.into());
        self
    }

    /// Numeric option, if present and non-negative.
    pub fn option_u64(&self, key: &str) -> Option<u64> {
        self.options.get(key).and_then(|v| v.as_u64())
    }
}

/// Which tier an entry matched in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum MatchKind {
    Exact,
    Prefix,
    CatchAll,
}

impl MatchKind {
    pub fn is_wildcard(self) -> bool {
        self != MatchKind::Exact
    }
}

/// Parsed form of an entry's alias.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AliasPattern {
    Exact(String),
    Prefix(String),
    CatchAll,
}

impl AliasPattern {
    pub fn parse(alias: &str) -> Result<Self, RegistryError> {
        if alias.is_empty() {
            return Err(RegistryError::InvalidAlias {
                alias: alias.to_string(),
                reason: "alias is empty".to_string(),
            });
        }
        if alias == "*" {
            return Ok(AliasPattern::CatchAll);
        }
        let (head, wildcard) = match alias.strip_suffix('*') {
            Some(prefix) => (prefix, true),
            None => (alias, false),
        };
        if head.contains('*') {
            return Err(RegistryError::InvalidAlias {
                alias: alias.to_string(),
                reason: "'*' is only allowed as the final character".to_string(),
            });
        }
        Ok(if wildcard {
            AliasPattern::Prefix(head.to_string())
        } else {
            AliasPattern::Exact(head.to_string())
        })
    }

    /// Returns the part of `alias` the wildcard stood for, if it matches.
    fn matches<'a>(&self, alias: &'a str) -> Option<(MatchKind, &'a str)> {
        match self {
            AliasPattern::Exact(exact) => (exact == alias).then_some((MatchKind::Exact, "")),
            AliasPattern::Prefix(prefix) => alias
                .strip_prefix(prefix.as_str())
                .filter(|rest| !rest.is_empty())
                .map(|rest| (MatchKind::Prefix, rest)),
            AliasPattern::CatchAll => Some((MatchKind::CatchAll, alias)),
        }
    }

    fn prefix_len(&self) -> usize {
        match self {
            AliasPattern::Prefix(p) => p.len(),
            _ => 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    #[error("invalid alias '{alias}': {reason}")]
    InvalidAlias { alias: String, reason: String },
}

/// An entry that matched a requested alias.
#[derive(Debug, Clone)]
pub struct ResolvedEntry {
    pub entry: Arc<ModelEntry>,
    pub kind: MatchKind,
    /// Target model with any wildcard filled in.
    pub target_model: String,
}

fn expand_target(target: &str, wildcard_part: &str) -> String {
    match target.strip_suffix('*') {
        Some(head) => format!("{}{}", head, wildcard_part),
        None => target.to_string(),
    }
}

/// Read-only set of model entries.
#[derive(Debug, Clone, Default)]
pub struct ModelRegistry {
    entries: Vec<(AliasPattern, Arc<ModelEntry>)>,
}

impl ModelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a registry from entries in declaration order.
    pub fn from_entries(entries: impl IntoIterator<Item = ModelEntry>) -> Result<Self, RegistryError> {
        let mut registry = Self::new();
        registry.register(entries)?;
        Ok(registry)
    }

    /// Append entries, preserving their order. Fails without partial effect.
    pub fn register(
        &mut self,
        entries: impl IntoIterator<Item = ModelEntry>,
    ) -> Result<(), RegistryError> {
        let parsed = entries
            .into_iter()
            .map(|e| Ok((AliasPattern::parse(&e.alias)?, Arc::new(e))))
            .collect::<Result<Vec<_>, RegistryError>>()?;
        self.entries.extend(parsed);
        Ok(())
    }

    /// All entries matching `alias`, exact before prefix before catch-all.
    pub fn resolve(&self, alias: &str) -> Result<Vec<ResolvedEntry>, DispatchError> {
        let mut matched: Vec<(MatchKind, usize, usize, ResolvedEntry)> = self
            .entries
            .iter()
            .enumerate()
            .filter_map(|(index, (pattern, entry))| {
                pattern.matches(alias).map(|(kind, wildcard_part)| {
                    let target_model = if kind.is_wildcard() {
                        expand_target(&entry.target_model, wildcard_part)
                    } else {
                        entry.target_model.clone()
                    };
                    (
                        kind,
                        pattern.prefix_len(),
                        index,
                        ResolvedEntry {
                            entry: entry.clone(),
                            kind,
                            target_model,
                        },
                    )
                })
            })
            .collect();

        if matched.is_empty() {
            return Err(DispatchError::UnknownModel {
                alias: alias.to_string(),
            });
        }

        // Tier, then longer prefix, then registration order
        matched.sort_by(|a, b| {
            a.0.cmp(&b.0)
                .then_with(|| b.1.cmp(&a.1))
                .then_with(|| a.2.cmp(&b.2))
        });

        Ok(matched.into_iter().map(|(_, _, _, r)| r).collect())
    }

    /// Exact aliases in first-registration order.
    pub fn aliases(&self) -> Vec<&str> {
        let mut seen = HashSet::new();
        self.entries
            .iter()
            .filter_map(|(pattern, entry)| match pattern {
                AliasPattern::Exact(_) => Some(entry.alias.as_str()),
                _ => None,
            })
            .filter(|alias| seen.insert(*alias))
            .collect()
    }

    pub fn entries(&self) -> impl Iterator<Item = &Arc<ModelEntry>> {
        self.entries.iter().map(|(_, e)| e)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
