//! Candidate selection logic.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};

use dashmap::DashMap;
use serde::Deserialize;

use crate::error::DispatchError;
use crate::registry::{ModelRegistry, ResolvedEntry};

/// How a load-balancing group is ordered for one request.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    /// Rotate the starting member on every request.
    #[default]
    RoundRobin,
    /// Registration order every time (pure priority failover).
    Ordered,
    /// Ascending `output_rate` option; entries without a rate go last.
    #[serde(alias = "cheapest")]
    LowestCost,
}

impl Strategy {
    pub fn as_str(self) -> &'static str {
        match self {
            Strategy::RoundRobin => "round_robin",
            Strategy::Ordered => "ordered",
            Strategy::LowestCost => "lowest_cost",
        }
    }
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Strategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "round_robin" => Ok(Strategy::RoundRobin),
            "ordered" => Ok(Strategy::Ordered),
            "lowest_cost" | "cheapest" => Ok(Strategy::LowestCost),
            other => Err(format!(
                "unknown routing strategy '{}' (expected round_robin, ordered or lowest_cost)",
                other
            )),
        }
    }
}

/// Ordered candidates for one request. The first is the primary target.
#[derive(Debug, Clone)]
pub struct RouteDecision {
    pub alias: String,
    candidates: Vec<ResolvedEntry>,
}

impl RouteDecision {
    pub fn primary(&self) -> Option<&ResolvedEntry> {
        self.candidates.first()
    }

    pub fn fallbacks(&self) -> &[ResolvedEntry] {
        self.candidates.get(1..).unwrap_or_default()
    }

    pub fn candidates(&self) -> &[ResolvedEntry] {
        &self.candidates
    }

    pub fn len(&self) -> usize {
        self.candidates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.candidates.is_empty()
    }
}

impl IntoIterator for RouteDecision {
    type Item = ResolvedEntry;
    type IntoIter = std::vec::IntoIter<ResolvedEntry>;

    fn into_iter(self) -> Self::IntoIter {
        self.candidates.into_iter()
    }
}

/// Router for turning aliases into route decisions.
///
/// Routing never performs I/O. The registry can be swapped atomically with
/// [`Router::reload`]; decisions already handed out keep the entries they
/// were built from.
pub struct Router {
    registry: RwLock<Arc<ModelRegistry>>,
    default_strategy: Strategy,
    alias_strategies: HashMap<String, Strategy>,
    counters: DashMap<String, AtomicUsize>,
}

impl fmt::Debug for Router {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Router")
            .field("entries", &self.registry().len())
            .field("default_strategy", &self.default_strategy)
            .field("alias_strategies", &self.alias_strategies)
            .finish()
    }
}

impl Router {
    /// Create a round-robin router over the given registry.
    pub fn new(registry: ModelRegistry) -> Self {
        Self {
            registry: RwLock::new(Arc::new(registry)),
            default_strategy: Strategy::default(),
            alias_strategies: HashMap::new(),
            counters: DashMap::new(),
        }
    }

    pub fn with_default_strategy(mut self, strategy: Strategy) -> Self {
        self.default_strategy = strategy;
        self
    }

    pub fn with_alias_strategy(mut self, alias: impl Into<String>, strategy: Strategy) -> Self {
        self.alias_strategies.insert(alias.into(), strategy);
        self
    }

    /// Snapshot of the current registry.
    pub fn registry(&self) -> Arc<ModelRegistry> {
        self.registry
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Replace the whole registry. Never mutates entries in place.
    pub fn reload(&self, registry: ModelRegistry) {
        let entries = registry.len();
        *self
            .registry
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Arc::new(registry);
        tracing::info!(entries, "Model registry reloaded");
    }

    pub fn strategy_for(&self, alias: &str) -> Strategy {
        self.alias_strategies
            .get(alias)
            .copied()
            .unwrap_or(self.default_strategy)
    }

    /// Compute the ordered candidate list for `alias`.
    ///
    /// A wildcard match yields exactly one candidate. An exact match yields
    /// the whole group, ordered by the alias's strategy.
    pub fn route(&self, alias: &str) -> Result<RouteDecision, DispatchError> {
        let registry = self.registry();
        let mut resolved = registry.resolve(alias)?;

        let top = resolved[0].kind;
        if top.is_wildcard() {
            resolved.truncate(1);
            tracing::debug!(
                alias = %alias,
                provider = %resolved[0].entry.provider_id,
                pattern = %resolved[0].entry.alias,
                "Routed via wildcard"
            );
            return Ok(RouteDecision {
                alias: alias.to_string(),
                candidates: resolved,
            });
        }

        resolved.retain(|r| r.kind == top);
        if resolved.len() > 1 {
            let strategy = self.strategy_for(alias);
            self.apply_strategy(alias, strategy, &mut resolved);
            tracing::debug!(
                alias = %alias,
                strategy = %strategy,
                primary = %resolved[0].entry.provider_id,
                group_size = resolved.len(),
                "Ordered load-balancing group"
            );
        }

        Ok(RouteDecision {
            alias: alias.to_string(),
            candidates: resolved,
        })
    }

    fn apply_strategy(&self, alias: &str, strategy: Strategy, group: &mut [ResolvedEntry]) {
        match strategy {
            Strategy::RoundRobin => {
                let turn = self.next_turn(alias);
                group.rotate_left(turn % group.len());
            }
            Strategy::Ordered => {}
            Strategy::LowestCost => {
                // Stable: equal rates keep registration order
                group.sort_by_key(|r| r.entry.option_u64("output_rate").unwrap_or(u64::MAX));
            }
        }
    }

    fn next_turn(&self, alias: &str) -> usize {
        if let Some(counter) = self.counters.get(alias) {
            return counter.fetch_add(1, Ordering::Relaxed);
        }
        self.counters
            .entry(alias.to_string())
            .or_default()
            .fetch_add(1, Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credentials::{ApiKey, CredentialRef};
    use crate::registry::ModelEntry;

    fn entry(alias: &str, provider: &str, model: &str) -> ModelEntry {
        ModelEntry::new(alias, provider, model, CredentialRef::Inline(ApiKey::from("k")))
    }

    fn primary(router: &Router, alias: &str) -> String {
        router
            .route(alias)
            .unwrap()
            .primary()
            .unwrap()
            .entry
            .provider_id
            .clone()
    }

    #[test]
    fn test_round_robin_a_b_a() {
        let registry =
            ModelRegistry::from_entries([entry("team-x", "A", "m"), entry("team-x", "B", "m")])
                .unwrap();
        let router = Router::new(registry);

        assert_eq!(primary(&router, "team-x"), "A");
        assert_eq!(primary(&router, "team-x"), "B");
        assert_eq!(primary(&router, "team-x"), "A");
    }

    #[test]
    fn test_round_robin_keeps_rest_as_fallbacks() {
        let registry = ModelRegistry::from_entries([
            entry("g", "A", "m"),
            entry("g", "B", "m"),
            entry("g", "C", "m"),
        ])
        .unwrap();
        let router = Router::new(registry);
        router.route("g").unwrap();

        let decision = router.route("g").unwrap();
        let order: Vec<&str> = decision
            .candidates()
            .iter()
            .map(|r| r.entry.provider_id.as_str())
            .collect();
        assert_eq!(order, vec!["B", "C", "A"]);
        assert_eq!(decision.fallbacks().len(), 2);
    }

    #[test]
    fn test_counters_are_per_alias() {
        let registry = ModelRegistry::from_entries([
            entry("x", "A", "m"),
            entry("x", "B", "m"),
            entry("y", "C", "m"),
            entry("y", "D", "m"),
        ])
        .unwrap();
        let router = Router::new(registry);
        assert_eq!(primary(&router, "x"), "A");
        assert_eq!(primary(&router, "y"), "C");
        assert_eq!(primary(&router, "x"), "B");
    }

    #[test]
    fn test_exact_hides_wildcard() {
        let registry =
            ModelRegistry::from_entries([entry("gpt-4", "A", "fake"), entry("*", "B", "*")])
                .unwrap();
        let router = Router::new(registry);

        let decision = router.route("gpt-4").unwrap();
        assert_eq!(decision.len(), 1);
        assert_eq!(decision.primary().unwrap().entry.provider_id, "A");

        let decision = router.route("unknown-model").unwrap();
        assert_eq!(decision.len(), 1);
        let primary = decision.primary().unwrap();
        assert_eq!(primary.entry.provider_id, "B");
        assert_eq!(primary.target_model, "unknown-model");
    }

    #[test]
    fn test_wildcards_not_load_balanced() {
        let registry = ModelRegistry::from_entries([
            entry("openai/*", "A", "*"),
            entry("openai/*", "B", "*"),
        ])
        .unwrap();
        let router = Router::new(registry);
        for _ in 0..3 {
            let decision = router.route("openai/gpt-4o").unwrap();
            assert_eq!(decision.len(), 1);
            assert_eq!(decision.primary().unwrap().entry.provider_id, "A");
        }
    }

    #[test]
    fn test_ordered_strategy_override() {
        let registry =
            ModelRegistry::from_entries([entry("g", "A", "m"), entry("g", "B", "m")]).unwrap();
        let router = Router::new(registry).with_alias_strategy("g", Strategy::Ordered);
        for _ in 0..3 {
            assert_eq!(primary(&router, "g"), "A");
        }
    }

    #[test]
    fn test_lowest_cost_strategy() {
        let registry = ModelRegistry::from_entries([
            entry("g", "pricey", "m").with_option("output_rate", 30),
            entry("g", "unknown", "m"),
            entry("g", "cheap", "m").with_option("output_rate", 15),
        ])
        .unwrap();
        let router = Router::new(registry).with_default_strategy(Strategy::LowestCost);
        let decision = router.route("g").unwrap();
        let order: Vec<&str> = decision
            .candidates()
            .iter()
            .map(|r| r.entry.provider_id.as_str())
            .collect();
        assert_eq!(order, vec!["cheap", "pricey", "unknown"]);
    }

    #[test]
    fn test_reload_swaps_registry() {
        let router =
            Router::new(ModelRegistry::from_entries([entry("gpt-4", "A", "m")]).unwrap());
        let before = router.route("gpt-4").unwrap();

        router.reload(ModelRegistry::from_entries([entry("gpt-4", "Z", "m")]).unwrap());

        assert_eq!(before.primary().unwrap().entry.provider_id, "A");
        assert_eq!(primary(&router, "gpt-4"), "Z");
    }

    #[test]
    fn test_strategy_from_str() {
        assert_eq!("round_robin".parse::<Strategy>(), Ok(Strategy::RoundRobin));
        assert_eq!("cheapest".parse::<Strategy>(), Ok(Strategy::LowestCost));
        assert!("random".parse::<Strategy>().is_err());
    }
}
