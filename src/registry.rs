//! Model registry: the in-memory set of active model descriptors
//!
//! Descriptors are created at load time, mutated only through atomic
//! register/unregister or counter updates, and destroyed on unload. Entries
//! live in a concurrent map, so reads never block registration of other
//! models.

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use tracing::{info, warn};

use crate::adapters::ProviderFamily;
use crate::error::{RouterError, RouterResult};
use crate::events::{EventBus, RouterEvent};
use crate::store::PersistentMap;
use crate::types::{Capability, TokenUsage};

/// Latency EMA smoothing factor
const EMA_ALPHA: f64 = 0.2;
/// Consecutive transient failures before a model is marked degraded
const DEGRADE_THRESHOLD: u32 = 3;

/// Descriptor lifecycle states
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ModelStatus {
    Loading,
    Ready,
    Degraded,
    Unloaded,
    Errored,
}

/// Pricing table entry, USD per million tokens
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq)]
pub struct Pricing {
    pub input_per_mtok: f64,
    pub output_per_mtok: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub per_image: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub per_second: Option<f64>,
}

impl Pricing {
    pub fn new(input_per_mtok: f64, output_per_mtok: f64) -> Self {
        Self {
            input_per_mtok,
            output_per_mtok,
            per_image: None,
            per_second: None,
        }
    }

    /// Actual cost from reported usage
    pub fn cost_for(&self, usage: &TokenUsage) -> f64 {
        self.estimate(usage.prompt_tokens, usage.completion_tokens)
    }

    /// Estimated cost for a token budget
    pub fn estimate(&self, input_tokens: u32, output_tokens: u32) -> f64 {
        (input_tokens as f64 * self.input_per_mtok + output_tokens as f64 * self.output_per_mtok)
            / 1_000_000.0
    }
}

/// Context and output limits
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct ModelLimits {
    pub context_tokens: u32,
    pub max_output_tokens: u32,
}

impl Default for ModelLimits {
    fn default() -> Self {
        Self {
            context_tokens: 8192,
            max_output_tokens: 4096,
        }
    }
}

/// Registry entry for a loaded model
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelDescriptor {
    /// Globally unique id, e.g. `openai:gpt-4o`
    pub id: String,
    pub provider: ProviderFamily,
    /// Provider-local model identifier
    pub model_id: String,
    /// Derived family tag, e.g. `gpt`, `claude`, `llama`
    pub family: String,
    pub capabilities: HashSet<Capability>,
    pub limits: ModelLimits,
    pub pricing: Pricing,
    /// Static quality score in [0, 1]
    pub quality: f64,
    pub current_load: u32,
    pub recent_latency_ms_ema: f64,
    pub status: ModelStatus,
    #[serde(default)]
    pub consecutive_failures: u32,
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
}

impl ModelDescriptor {
    pub fn new(provider: ProviderFamily, model_id: impl Into<String>) -> Self {
        let model_id = model_id.into();
        Self {
            id: format!("{}:{}", provider, model_id),
            provider,
            family: derive_family(&model_id),
            model_id,
            capabilities: [Capability::Text, Capability::Chat, Capability::Streaming]
                .into_iter()
                .collect(),
            limits: ModelLimits::default(),
            pricing: Pricing::default(),
            quality: 0.5,
            current_load: 0,
            recent_latency_ms_ema: 0.0,
            status: ModelStatus::Ready,
            consecutive_failures: 0,
            metadata: HashMap::new(),
        }
    }

    pub fn with_capabilities(mut self, caps: impl IntoIterator<Item = Capability>) -> Self {
        self.capabilities.extend(caps);
        self
    }

    pub fn with_limits(mut self, limits: ModelLimits) -> Self {
        self.limits = limits;
        self
    }

    pub fn with_pricing(mut self, pricing: Pricing) -> Self {
        self.pricing = pricing;
        self
    }

    pub fn with_quality(mut self, quality: f64) -> Self {
        self.quality = quality.clamp(0.0, 1.0);
        self
    }

    /// Whether the model can serve requests right now
    pub fn is_available(&self) -> bool {
        matches!(self.status, ModelStatus::Ready | ModelStatus::Degraded)
    }
}

/// Derive a family tag from the provider-local model id
pub fn derive_family(model_id: &str) -> String {
    let lowered = model_id.to_ascii_lowercase();
    for prefix in [
        "gpt", "o4", "o3", "claude", "gemini", "llama", "mistral", "mixtral", "command",
        "deepseek", "sonar", "titan", "qwen", "phi",
    ] {
        if lowered.contains(prefix) {
            return prefix.to_string();
        }
    }
    lowered
        .split(|c: char| c == '-' || c == ':' || c == '/' || c == '.')
        .next()
        .unwrap_or("unknown")
        .to_string()
}

/// Filter over registry entries
#[derive(Debug, Clone, Default)]
pub struct ModelFilter {
    pub capabilities: HashSet<Capability>,
    pub provider: Option<ProviderFamily>,
    /// Ceiling on input price per million tokens
    pub max_input_price: Option<f64>,
    pub min_context: Option<u32>,
}

impl ModelFilter {
    pub fn matches(&self, descriptor: &ModelDescriptor) -> bool {
        if !self.capabilities.is_subset(&descriptor.capabilities) {
            return false;
        }
        if let Some(provider) = self.provider {
            if descriptor.provider != provider {
                return false;
            }
        }
        if let Some(ceiling) = self.max_input_price {
            if descriptor.pricing.input_per_mtok > ceiling {
                return false;
            }
        }
        if let Some(min_context) = self.min_context {
            if descriptor.limits.context_tokens < min_context {
                return false;
            }
        }
        true
    }
}

/// Key under which descriptors checkpoint into the persistent map
const CHECKPOINT_KEY: &str = "models";

/// The `id → descriptor` mapping
pub struct ModelRegistry {
    entries: DashMap<String, ModelDescriptor>,
    max_models: usize,
    events: EventBus,
}

impl ModelRegistry {
    pub fn new(max_models: usize, events: EventBus) -> Self {
        Self {
            entries: DashMap::new(),
            max_models,
            events,
        }
    }

    /// Atomic insert-or-replace. Re-registration under the same id replaces
    /// the whole descriptor; registration of a new id past the cap fails.
    pub fn register(&self, descriptor: ModelDescriptor) -> RouterResult<()> {
        if !self.entries.contains_key(&descriptor.id) && self.entries.len() >= self.max_models {
            return Err(RouterError::QuotaExceeded(format!(
                "model registry at capacity ({})",
                self.max_models
            )));
        }
        info!("Registering model {}", descriptor.id);
        self.events.publish(RouterEvent::ModelRegistered {
            model_id: descriptor.id.clone(),
            provider: descriptor.provider.to_string(),
        });
        self.entries.insert(descriptor.id.clone(), descriptor);
        Ok(())
    }

    /// Idempotent removal
    pub fn unregister(&self, id: &str) {
        if self.entries.remove(id).is_some() {
            info!("Unregistered model {}", id);
            self.events.publish(RouterEvent::ModelUnregistered {
                model_id: id.to_string(),
            });
        }
    }

    pub fn get(&self, id: &str) -> Option<ModelDescriptor> {
        self.entries.get(id).map(|e| e.value().clone())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Available descriptors passing the filter, sorted by id for
    /// deterministic downstream selection
    pub fn get_available(&self, filter: &ModelFilter) -> Vec<ModelDescriptor> {
        let mut matches: Vec<ModelDescriptor> = self
            .entries
            .iter()
            .filter(|e| e.value().is_available() && filter.matches(e.value()))
            .map(|e| e.value().clone())
            .collect();
        matches.sort_by(|a, b| a.id.cmp(&b.id));
        matches
    }

    /// All descriptors regardless of status
    pub fn all(&self) -> Vec<ModelDescriptor> {
        let mut all: Vec<ModelDescriptor> =
            self.entries.iter().map(|e| e.value().clone()).collect();
        all.sort_by(|a, b| a.id.cmp(&b.id));
        all
    }

    /// Counter update under the entry lock; load never goes below zero
    pub fn update_load(&self, id: &str, delta: i64) {
        if let Some(mut entry) = self.entries.get_mut(id) {
            let load = entry.current_load as i64 + delta;
            entry.current_load = load.max(0) as u32;
        }
    }

    /// Fold a latency sample into the entry's EMA
    pub fn record_latency(&self, id: &str, sample_ms: f64) {
        if let Some(mut entry) = self.entries.get_mut(id) {
            entry.recent_latency_ms_ema = if entry.recent_latency_ms_ema == 0.0 {
                sample_ms
            } else {
                EMA_ALPHA * sample_ms + (1.0 - EMA_ALPHA) * entry.recent_latency_ms_ema
            };
        }
    }

    /// Success clears the failure streak and restores a degraded model
    pub fn record_success(&self, id: &str) {
        if let Some(mut entry) = self.entries.get_mut(id) {
            entry.consecutive_failures = 0;
            if entry.status == ModelStatus::Degraded {
                entry.status = ModelStatus::Ready;
                let status = entry.status;
                drop(entry);
                self.events.publish(RouterEvent::HealthChanged {
                    model_id: id.to_string(),
                    status,
                });
            }
        }
    }

    /// Transient failures accumulate; enough of them degrade the model
    pub fn record_failure(&self, id: &str) {
        if let Some(mut entry) = self.entries.get_mut(id) {
            entry.consecutive_failures += 1;
            if entry.consecutive_failures >= DEGRADE_THRESHOLD && entry.status == ModelStatus::Ready
            {
                entry.status = ModelStatus::Degraded;
                warn!(
                    "Model {} degraded after {} consecutive failures",
                    id, entry.consecutive_failures
                );
                let status = entry.status;
                drop(entry);
                self.events.publish(RouterEvent::HealthChanged {
                    model_id: id.to_string(),
                    status,
                });
            }
        }
    }

    /// Multiply all load counters by `factor`; the balancer's decay pass
    pub fn decay_loads(&self, factor: f64) {
        for mut entry in self.entries.iter_mut() {
            entry.current_load = (entry.current_load as f64 * factor) as u32;
        }
    }

    /// Checkpoint all descriptors into the persistent map
    pub async fn checkpoint(&self, map: &PersistentMap) -> RouterResult<()> {
        let snapshot = self.all();
        let value = serde_json::to_value(&snapshot)
            .map_err(|e| RouterError::Internal(format!("descriptor serialization: {}", e)))?;
        map.set(CHECKPOINT_KEY, value).await;
        Ok(())
    }

    /// Read back a previous checkpoint. Restoration re-issues `load` against
    /// the same provider/model, so entries come back in `Loading` status.
    pub async fn read_checkpoint(map: &PersistentMap) -> Vec<ModelDescriptor> {
        let Some(value) = map.get(CHECKPOINT_KEY).await else {
            return Vec::new();
        };
        match serde_json::from_value::<Vec<ModelDescriptor>>(value) {
            Ok(mut descriptors) => {
                for d in &mut descriptors {
                    d.status = ModelStatus::Loading;
                    d.current_load = 0;
                }
                descriptors
            }
            Err(e) => {
                warn!("Discarding unreadable registry checkpoint: {}", e);
                Vec::new()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_registry() -> ModelRegistry {
        ModelRegistry::new(10, EventBus::new())
    }

    fn descriptor(id: &str) -> ModelDescriptor {
        ModelDescriptor::new(ProviderFamily::OpenAi, id)
    }

    #[test]
    fn test_register_get_unregister_round_trip() {
        let registry = test_registry();
        registry.register(descriptor("gpt-4o")).unwrap();

        let found = registry.get("openai:gpt-4o");
        assert!(found.is_some());
        assert_eq!(found.unwrap().model_id, "gpt-4o");

        registry.unregister("openai:gpt-4o");
        assert!(registry.get("openai:gpt-4o").is_none());
        // Idempotent
        registry.unregister("openai:gpt-4o");
    }

    #[test]
    fn test_reregistration_replaces_atomically() {
        let registry = test_registry();
        registry
            .register(descriptor("gpt-4o").with_quality(0.5))
            .unwrap();
        registry
            .register(descriptor("gpt-4o").with_quality(0.9))
            .unwrap();
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.get("openai:gpt-4o").unwrap().quality, 0.9);
    }

    #[test]
    fn test_capacity_cap() {
        let registry = ModelRegistry::new(1, EventBus::new());
        registry.register(descriptor("a")).unwrap();
        assert!(registry.register(descriptor("b")).is_err());
        // Replacing an existing id is still allowed at capacity
        assert!(registry.register(descriptor("a")).is_ok());
    }

    #[test]
    fn test_load_counter_floor() {
        let registry = test_registry();
        registry.register(descriptor("gpt-4o")).unwrap();
        registry.update_load("openai:gpt-4o", 2);
        assert_eq!(registry.get("openai:gpt-4o").unwrap().current_load, 2);
        registry.update_load("openai:gpt-4o", -5);
        assert_eq!(registry.get("openai:gpt-4o").unwrap().current_load, 0);
    }

    #[test]
    fn test_filter_by_capability_and_context() {
        let registry = test_registry();
        registry
            .register(
                descriptor("gpt-4o")
                    .with_capabilities([Capability::Vision])
                    .with_limits(ModelLimits {
                        context_tokens: 128_000,
                        max_output_tokens: 4096,
                    }),
            )
            .unwrap();
        registry.register(descriptor("gpt-3.5-turbo")).unwrap();

        let mut filter = ModelFilter::default();
        filter.capabilities.insert(Capability::Vision);
        let hits = registry.get_available(&filter);
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].model_id, "gpt-4o");

        let filter = ModelFilter {
            min_context: Some(100_000),
            ..Default::default()
        };
        let hits = registry.get_available(&filter);
        assert_eq!(hits.len(), 1);
    }

    #[test]
    fn test_health_degrade_and_recover() {
        let registry = test_registry();
        registry.register(descriptor("gpt-4o")).unwrap();
        let id = "openai:gpt-4o";

        registry.record_failure(id);
        registry.record_failure(id);
        assert_eq!(registry.get(id).unwrap().status, ModelStatus::Ready);
        registry.record_failure(id);
        assert_eq!(registry.get(id).unwrap().status, ModelStatus::Degraded);

        registry.record_success(id);
        let entry = registry.get(id).unwrap();
        assert_eq!(entry.status, ModelStatus::Ready);
        assert_eq!(entry.consecutive_failures, 0);
    }

    #[test]
    fn test_latency_ema() {
        let registry = test_registry();
        registry.register(descriptor("gpt-4o")).unwrap();
        let id = "openai:gpt-4o";

        registry.record_latency(id, 100.0);
        assert_eq!(registry.get(id).unwrap().recent_latency_ms_ema, 100.0);
        registry.record_latency(id, 200.0);
        // 0.2 * 200 + 0.8 * 100
        assert!((registry.get(id).unwrap().recent_latency_ms_ema - 120.0).abs() < 1e-9);
    }

    #[test]
    fn test_pricing_math() {
        let pricing = Pricing::new(2.0, 6.0);
        let usage = TokenUsage::new(1_000_000, 500_000);
        assert!((pricing.cost_for(&usage) - 5.0).abs() < 1e-9);
    }

    #[test]
    fn test_family_derivation() {
        assert_eq!(derive_family("gpt-4o"), "gpt");
        assert_eq!(derive_family("claude-3-5-sonnet"), "claude");
        assert_eq!(derive_family("meta-llama/Llama-3-70b"), "llama");
        assert_eq!(derive_family("sonar-pro"), "sonar");
    }

    #[tokio::test]
    async fn test_checkpoint_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let map = PersistentMap::open(dir.path().join("indexes.json"))
            .await
            .unwrap();

        let registry = test_registry();
        let mut entry = descriptor("gpt-4o").with_quality(0.9);
        entry.current_load = 4;
        registry.register(entry).unwrap();
        registry.checkpoint(&map).await.unwrap();

        let restored = ModelRegistry::read_checkpoint(&map).await;
        assert_eq!(restored.len(), 1);
        assert_eq!(restored[0].id, "openai:gpt-4o");
        assert_eq!(restored[0].quality, 0.9);
        // Restoration re-issues load, so entries come back loading and idle
        assert_eq!(restored[0].status, ModelStatus::Loading);
        assert_eq!(restored[0].current_load, 0);
        map.close().await.unwrap();
    }
}
