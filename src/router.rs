//! Request routing: candidate selection and strategy evaluation
//!
//! The router turns a request into an ordered candidate list of model
//! descriptors. The head of the list is the strategy's pick; the tail is the
//! fallback chain walked by the pipeline on transient failures. Every
//! strategy is deterministic for a given input set and context, with ties
//! broken by lexicographic id.

use dashmap::DashMap;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::debug;

use crate::error::{RouterError, RouterResult};
use crate::registry::{ModelDescriptor, ModelFilter, ModelRegistry};
use crate::types::{estimate_tokens, Request};

/// References against which balanced-strategy terms are normalized
const REF_COST_USD: f64 = 0.01;
const REF_LATENCY_MS: f64 = 10_000.0;
const REF_LOAD: f64 = 10.0;
/// Balanced strategy weights
const BALANCED_WEIGHT: f64 = 0.25;
/// Output budget assumed when a request does not cap max_tokens
const DEFAULT_OUTPUT_BUDGET: u32 = 1024;

/// Pluggable selection strategies
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoutingStrategy {
    RoundRobin,
    LeastLoaded,
    Weighted,
    Sticky,
    CapabilityMatch,
    CostPriority,
    SpeedPriority,
    QualityFirst,
    Balanced,
    Adaptive,
}

impl std::fmt::Display for RoutingStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            RoutingStrategy::RoundRobin => "round-robin",
            RoutingStrategy::LeastLoaded => "least-loaded",
            RoutingStrategy::Weighted => "weighted",
            RoutingStrategy::Sticky => "sticky",
            RoutingStrategy::CapabilityMatch => "capability-match",
            RoutingStrategy::CostPriority => "cost-priority",
            RoutingStrategy::SpeedPriority => "speed-priority",
            RoutingStrategy::QualityFirst => "quality-first",
            RoutingStrategy::Balanced => "balanced",
            RoutingStrategy::Adaptive => "adaptive",
        };
        write!(f, "{}", name)
    }
}

impl std::str::FromStr for RoutingStrategy {
    type Err = RouterError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "round-robin" => Ok(RoutingStrategy::RoundRobin),
            "least-loaded" => Ok(RoutingStrategy::LeastLoaded),
            "weighted" => Ok(RoutingStrategy::Weighted),
            "sticky" => Ok(RoutingStrategy::Sticky),
            "capability-match" => Ok(RoutingStrategy::CapabilityMatch),
            "cost-priority" => Ok(RoutingStrategy::CostPriority),
            "speed-priority" => Ok(RoutingStrategy::SpeedPriority),
            "quality-first" => Ok(RoutingStrategy::QualityFirst),
            "balanced" => Ok(RoutingStrategy::Balanced),
            "adaptive" => Ok(RoutingStrategy::Adaptive),
            other => Err(RouterError::Validation(format!(
                "unknown routing strategy: {}",
                other
            ))),
        }
    }
}

/// Context a strategy evaluates against
#[derive(Debug, Clone, Default)]
pub struct SelectionContext {
    pub session_id: Option<String>,
    pub est_input_tokens: u32,
    pub max_tokens: u32,
    pub speed_priority: bool,
    pub quality_priority: bool,
    /// Caller-supplied weight overrides for the weighted strategy
    pub weights: HashMap<String, f64>,
    /// Round-robin rotation index, supplied by the router
    pub round_robin_index: usize,
    /// Sticky pick recorded for the session, if any
    pub sticky_pick: Option<String>,
}

/// Estimated request cost against one candidate
fn estimated_cost(descriptor: &ModelDescriptor, ctx: &SelectionContext) -> f64 {
    let output_budget = if ctx.max_tokens > 0 {
        ctx.max_tokens
    } else {
        DEFAULT_OUTPUT_BUDGET.min(descriptor.limits.max_output_tokens)
    };
    descriptor.pricing.estimate(ctx.est_input_tokens, output_budget)
}

/// Balanced score: `w·quality − w·normCost − w·normLatency − w·normLoad`
fn balanced_score(descriptor: &ModelDescriptor, ctx: &SelectionContext) -> f64 {
    let norm_cost = (estimated_cost(descriptor, ctx) / REF_COST_USD).min(1.0);
    let norm_latency = (descriptor.recent_latency_ms_ema / REF_LATENCY_MS).min(1.0);
    let norm_load = (descriptor.current_load as f64 / REF_LOAD).min(1.0);
    BALANCED_WEIGHT * descriptor.quality
        - BALANCED_WEIGHT * norm_cost
        - BALANCED_WEIGHT * norm_latency
        - BALANCED_WEIGHT * norm_load
}

/// Order candidates best-first under the given strategy. Pure over its
/// inputs; ties always break by lexicographic id.
pub fn rank_candidates(
    strategy: RoutingStrategy,
    candidates: &[ModelDescriptor],
    ctx: &SelectionContext,
) -> Vec<ModelDescriptor> {
    let mut ordered: Vec<ModelDescriptor> = candidates.to_vec();
    ordered.sort_by(|a, b| a.id.cmp(&b.id));
    if ordered.len() <= 1 {
        return ordered;
    }

    match strategy {
        RoutingStrategy::RoundRobin => {
            let offset = ctx.round_robin_index % ordered.len();
            ordered.rotate_left(offset);
            ordered
        }
        RoutingStrategy::LeastLoaded | RoutingStrategy::CapabilityMatch => {
            // Capability filtering happens upstream; within the filtered set
            // both strategies reduce to least-loaded.
            sort_by_score(ordered, |d| {
                (d.current_load as f64, d.recent_latency_ms_ema)
            })
        }
        RoutingStrategy::Weighted => weighted_order(ordered, ctx),
        RoutingStrategy::Sticky => {
            let mut tail = sort_by_score(ordered, |d| {
                (d.current_load as f64, d.recent_latency_ms_ema)
            });
            if let Some(pick) = &ctx.sticky_pick {
                if let Some(pos) = tail.iter().position(|d| &d.id == pick) {
                    let chosen = tail.remove(pos);
                    tail.insert(0, chosen);
                }
            }
            tail
        }
        RoutingStrategy::CostPriority => {
            sort_by_score(ordered, |d| (estimated_cost(d, ctx), 0.0))
        }
        RoutingStrategy::SpeedPriority => {
            sort_by_score(ordered, |d| (d.recent_latency_ms_ema, 0.0))
        }
        RoutingStrategy::QualityFirst => sort_by_score(ordered, |d| (-d.quality, 0.0)),
        RoutingStrategy::Balanced => sort_by_score(ordered, |d| (-balanced_score(d, ctx), 0.0)),
        RoutingStrategy::Adaptive => {
            let inner = if ctx.speed_priority {
                RoutingStrategy::SpeedPriority
            } else if ctx.quality_priority {
                RoutingStrategy::QualityFirst
            } else {
                RoutingStrategy::Balanced
            };
            rank_candidates(inner, candidates, ctx)
        }
    }
}

/// Stable ascending sort by a scoring key; input must already be id-sorted
/// so equal scores keep lexicographic order.
fn sort_by_score<F>(mut ordered: Vec<ModelDescriptor>, score: F) -> Vec<ModelDescriptor>
where
    F: Fn(&ModelDescriptor) -> (f64, f64),
{
    ordered.sort_by(|a, b| {
        let sa = score(a);
        let sb = score(b);
        sa.partial_cmp(&sb)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.id.cmp(&b.id))
    });
    ordered
}

/// Weighted sample without replacement. Weights default to `1/(load+1)`,
/// overridden per id by caller-supplied weights. The RNG is seeded from the
/// candidate set and context so an identical input yields an identical
/// order while load changes shift the distribution over time.
fn weighted_order(ordered: Vec<ModelDescriptor>, ctx: &SelectionContext) -> Vec<ModelDescriptor> {
    let mut hasher = DefaultHasher::new();
    for d in &ordered {
        d.id.hash(&mut hasher);
        d.current_load.hash(&mut hasher);
    }
    for (id, w) in ctx.weights.iter() {
        id.hash(&mut hasher);
        w.to_bits().hash(&mut hasher);
    }
    let mut rng = StdRng::seed_from_u64(hasher.finish());

    let mut remaining = ordered;
    let mut picked = Vec::with_capacity(remaining.len());
    while !remaining.is_empty() {
        let weights: Vec<f64> = remaining
            .iter()
            .map(|d| {
                ctx.weights
                    .get(&d.id)
                    .copied()
                    .unwrap_or(1.0 / (d.current_load as f64 + 1.0))
                    .max(f64::MIN_POSITIVE)
            })
            .collect();
        let total: f64 = weights.iter().sum();
        let mut target = rng.gen_range(0.0..total);
        let mut index = 0;
        for (i, w) in weights.iter().enumerate() {
            if target < *w {
                index = i;
                break;
            }
            target -= w;
            index = i;
        }
        picked.push(remaining.remove(index));
    }
    picked
}

/// Registry-aware router producing candidate lists per request
pub struct Router {
    registry: Arc<ModelRegistry>,
    default_strategy: RoutingStrategy,
    round_robin: AtomicUsize,
    sticky_sessions: DashMap<String, String>,
    weights: DashMap<String, f64>,
}

impl Router {
    pub fn new(registry: Arc<ModelRegistry>, default_strategy: RoutingStrategy) -> Self {
        Self {
            registry,
            default_strategy,
            round_robin: AtomicUsize::new(0),
            sticky_sessions: DashMap::new(),
            weights: DashMap::new(),
        }
    }

    pub fn default_strategy(&self) -> RoutingStrategy {
        self.default_strategy
    }

    /// Override the weighted strategy's weight for a model
    pub fn set_weight(&self, model_id: impl Into<String>, weight: f64) {
        self.weights.insert(model_id.into(), weight);
    }

    /// Ordered candidate list for a request. The head is the strategy pick,
    /// the tail the fallback chain.
    pub fn plan(&self, request: &Request) -> RouterResult<Vec<ModelDescriptor>> {
        let candidates = if let Some(hint) = &request.model_hint {
            self.hinted_candidates(hint, request)?
        } else {
            self.strategy_candidates(request)?
        };
        debug!(
            "Route plan for {}: [{}]",
            request.id,
            candidates
                .iter()
                .map(|d| d.id.as_str())
                .collect::<Vec<_>>()
                .join(", ")
        );
        Ok(candidates)
    }

    /// Record the model that served a session, for the sticky strategy
    pub fn record_session_pick(&self, session_id: &str, model_id: &str) {
        self.sticky_sessions
            .insert(session_id.to_string(), model_id.to_string());
    }

    fn selection_context(&self, request: &Request) -> SelectionContext {
        let requirements = request.requirements.clone().unwrap_or_default();
        SelectionContext {
            session_id: request.session_id.clone(),
            est_input_tokens: estimate_tokens(&request.prompt_text()),
            max_tokens: request.options.max_tokens.unwrap_or(0),
            speed_priority: requirements.speed_priority,
            quality_priority: requirements.quality_priority,
            weights: self
                .weights
                .iter()
                .map(|e| (e.key().clone(), *e.value()))
                .collect(),
            round_robin_index: self.round_robin.fetch_add(1, Ordering::Relaxed),
            sticky_pick: request
                .session_id
                .as_ref()
                .and_then(|s| self.sticky_sessions.get(s).map(|e| e.value().clone())),
        }
    }

    /// Explicit model id: `[hinted, …fallbacks]`, fallbacks capability-matched
    /// within the same provider first, then cross-provider, ranked by
    /// `quality × (1/cost)`.
    fn hinted_candidates(
        &self,
        hint: &str,
        request: &Request,
    ) -> RouterResult<Vec<ModelDescriptor>> {
        let hinted = self
            .registry
            .get(hint)
            .or_else(|| {
                // Allow a bare provider-local id as a hint
                self.registry
                    .all()
                    .into_iter()
                    .find(|d| d.model_id == hint && d.is_available())
            })
            .ok_or_else(|| RouterError::NotFound(format!("model not registered: {}", hint)))?;

        let required = request.required_capabilities();
        let ctx = self.selection_context(request);
        let mut fallbacks: Vec<ModelDescriptor> = self
            .registry
            .get_available(&ModelFilter {
                capabilities: required,
                ..Default::default()
            })
            .into_iter()
            .filter(|d| d.id != hinted.id)
            .collect();

        fallbacks.sort_by(|a, b| {
            let same_a = a.provider == hinted.provider;
            let same_b = b.provider == hinted.provider;
            same_b
                .cmp(&same_a)
                .then_with(|| {
                    let value = |d: &ModelDescriptor| {
                        d.quality / estimated_cost(d, &ctx).max(f64::MIN_POSITIVE)
                    };
                    value(b)
                        .partial_cmp(&value(a))
                        .unwrap_or(std::cmp::Ordering::Equal)
                })
                .then_with(|| a.id.cmp(&b.id))
        });

        let mut candidates = vec![hinted];
        candidates.extend(fallbacks);
        Ok(candidates)
    }

    /// No hint: filter by requirements, order by the active strategy
    fn strategy_candidates(&self, request: &Request) -> RouterResult<Vec<ModelDescriptor>> {
        let requirements = request.requirements.clone().unwrap_or_default();
        let filter = ModelFilter {
            capabilities: request.required_capabilities(),
            provider: None,
            max_input_price: requirements.max_cost,
            min_context: requirements.min_context,
        };
        let candidates = self.registry.get_available(&filter);
        if candidates.is_empty() {
            return Err(RouterError::NotFound(
                "no registered model satisfies the request requirements".into(),
            ));
        }

        let ctx = self.selection_context(request);
        let ranked = rank_candidates(self.default_strategy, &candidates, &ctx);

        if let (Some(session), Some(pick)) = (&request.session_id, ranked.first()) {
            if self.default_strategy == RoutingStrategy::Sticky {
                self.record_session_pick(session, &pick.id);
            }
        }
        Ok(ranked)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::ProviderFamily;
    use crate::events::EventBus;
    use crate::registry::{ModelLimits, Pricing};
    use crate::types::Capability;

    fn descriptor(
        provider: ProviderFamily,
        model: &str,
        quality: f64,
        input: f64,
        output: f64,
    ) -> ModelDescriptor {
        ModelDescriptor::new(provider, model)
            .with_quality(quality)
            .with_pricing(Pricing::new(input, output))
    }

    fn ctx_for(prompt: &str, max_tokens: u32) -> SelectionContext {
        SelectionContext {
            est_input_tokens: estimate_tokens(prompt),
            max_tokens,
            ..Default::default()
        }
    }

    #[test]
    fn test_balanced_picks_mid_cost_quality() {
        // Seeded scenario: A is premium but expensive, C is cheap but weak,
        // B has the best balance.
        let a = descriptor(ProviderFamily::OpenAi, "model-a", 0.9, 30.0, 60.0);
        let b = descriptor(ProviderFamily::OpenAi, "model-b", 0.8, 2.0, 6.0);
        let c = descriptor(ProviderFamily::OpenAi, "model-c", 0.75, 0.25, 1.0);

        let ctx = ctx_for("Write a haiku", 50);
        let ranked = rank_candidates(
            RoutingStrategy::Balanced,
            &[a.clone(), b.clone(), c.clone()],
            &ctx,
        );
        assert_eq!(ranked[0].id, b.id);
    }

    #[test]
    fn test_cost_priority() {
        let a = descriptor(ProviderFamily::OpenAi, "model-a", 0.9, 30.0, 60.0);
        let c = descriptor(ProviderFamily::OpenAi, "model-c", 0.75, 0.25, 1.0);
        let ranked =
            rank_candidates(RoutingStrategy::CostPriority, &[a, c], &ctx_for("hello", 100));
        assert_eq!(ranked[0].model_id, "model-c");
    }

    #[test]
    fn test_quality_first_and_tie_break() {
        let a = descriptor(ProviderFamily::OpenAi, "model-a", 0.8, 1.0, 1.0);
        let b = descriptor(ProviderFamily::Groq, "model-b", 0.8, 1.0, 1.0);
        let ranked = rank_candidates(
            RoutingStrategy::QualityFirst,
            &[b.clone(), a.clone()],
            &ctx_for("q", 10),
        );
        // Equal quality: lexicographic id wins ("groq:model-b" < "openai:model-a")
        assert_eq!(ranked[0].id, b.id);
    }

    #[test]
    fn test_least_loaded_with_latency_tiebreak() {
        let mut a = descriptor(ProviderFamily::OpenAi, "model-a", 0.8, 1.0, 1.0);
        let mut b = descriptor(ProviderFamily::OpenAi, "model-b", 0.8, 1.0, 1.0);
        a.current_load = 3;
        b.current_load = 1;
        let ranked = rank_candidates(
            RoutingStrategy::LeastLoaded,
            &[a.clone(), b.clone()],
            &SelectionContext::default(),
        );
        assert_eq!(ranked[0].id, b.id);

        a.current_load = 1;
        a.recent_latency_ms_ema = 50.0;
        b.recent_latency_ms_ema = 200.0;
        let ranked = rank_candidates(
            RoutingStrategy::LeastLoaded,
            &[a.clone(), b],
            &SelectionContext::default(),
        );
        assert_eq!(ranked[0].id, a.id);
    }

    #[test]
    fn test_round_robin_rotation() {
        let a = descriptor(ProviderFamily::OpenAi, "model-a", 0.8, 1.0, 1.0);
        let b = descriptor(ProviderFamily::OpenAi, "model-b", 0.8, 1.0, 1.0);
        let candidates = [a.clone(), b.clone()];

        let mut ctx = SelectionContext::default();
        ctx.round_robin_index = 0;
        assert_eq!(
            rank_candidates(RoutingStrategy::RoundRobin, &candidates, &ctx)[0].id,
            a.id
        );
        ctx.round_robin_index = 1;
        assert_eq!(
            rank_candidates(RoutingStrategy::RoundRobin, &candidates, &ctx)[0].id,
            b.id
        );
        ctx.round_robin_index = 2;
        assert_eq!(
            rank_candidates(RoutingStrategy::RoundRobin, &candidates, &ctx)[0].id,
            a.id
        );
    }

    #[test]
    fn test_sticky_prefers_recorded_pick() {
        let a = descriptor(ProviderFamily::OpenAi, "model-a", 0.8, 1.0, 1.0);
        let mut b = descriptor(ProviderFamily::OpenAi, "model-b", 0.8, 1.0, 1.0);
        b.current_load = 5;

        let mut ctx = SelectionContext::default();
        ctx.sticky_pick = Some(b.id.clone());
        let ranked = rank_candidates(RoutingStrategy::Sticky, &[a.clone(), b.clone()], &ctx);
        assert_eq!(ranked[0].id, b.id);

        // Recorded pick no longer a candidate: falls back to least-loaded
        ctx.sticky_pick = Some("openai:model-gone".into());
        let ranked = rank_candidates(RoutingStrategy::Sticky, &[a.clone(), b], &ctx);
        assert_eq!(ranked[0].id, a.id);
    }

    #[test]
    fn test_adaptive_dispatch() {
        let mut fast = descriptor(ProviderFamily::Groq, "fast", 0.6, 1.0, 1.0);
        fast.recent_latency_ms_ema = 20.0;
        let mut good = descriptor(ProviderFamily::OpenAi, "good", 0.95, 1.0, 1.0);
        good.recent_latency_ms_ema = 900.0;
        let candidates = [fast.clone(), good.clone()];

        let mut ctx = SelectionContext::default();
        ctx.speed_priority = true;
        assert_eq!(
            rank_candidates(RoutingStrategy::Adaptive, &candidates, &ctx)[0].id,
            fast.id
        );

        ctx.speed_priority = false;
        ctx.quality_priority = true;
        assert_eq!(
            rank_candidates(RoutingStrategy::Adaptive, &candidates, &ctx)[0].id,
            good.id
        );
    }

    #[test]
    fn test_weighted_is_deterministic_per_input() {
        let a = descriptor(ProviderFamily::OpenAi, "model-a", 0.8, 1.0, 1.0);
        let b = descriptor(ProviderFamily::OpenAi, "model-b", 0.8, 1.0, 1.0);
        let ctx = SelectionContext::default();
        let first = rank_candidates(RoutingStrategy::Weighted, &[a.clone(), b.clone()], &ctx);
        let second = rank_candidates(RoutingStrategy::Weighted, &[a, b], &ctx);
        let ids = |v: &[ModelDescriptor]| v.iter().map(|d| d.id.clone()).collect::<Vec<_>>();
        assert_eq!(ids(&first), ids(&second));
    }

    #[test]
    fn test_weighted_caller_override_dominates() {
        let a = descriptor(ProviderFamily::OpenAi, "model-a", 0.8, 1.0, 1.0);
        let b = descriptor(ProviderFamily::OpenAi, "model-b", 0.8, 1.0, 1.0);
        let mut ctx = SelectionContext::default();
        ctx.weights.insert(b.id.clone(), 1e9);
        ctx.weights.insert(a.id.clone(), 1e-9);
        let ranked = rank_candidates(RoutingStrategy::Weighted, &[a, b.clone()], &ctx);
        assert_eq!(ranked[0].id, b.id);
    }

    fn router_with(models: Vec<ModelDescriptor>) -> Router {
        let registry = Arc::new(ModelRegistry::new(16, EventBus::new()));
        for m in models {
            registry.register(m).unwrap();
        }
        Router::new(registry, RoutingStrategy::Balanced)
    }

    #[test]
    fn test_hinted_plan_orders_fallbacks() {
        let hinted = descriptor(ProviderFamily::OpenAi, "gpt-4o", 0.9, 2.5, 10.0);
        let same_provider = descriptor(ProviderFamily::OpenAi, "gpt-4o-mini", 0.7, 0.15, 0.6);
        let other = descriptor(ProviderFamily::Anthropic, "claude-3-5-sonnet", 0.92, 3.0, 15.0);
        let router = router_with(vec![hinted, same_provider, other]);

        let mut request = Request::from_prompt("hello");
        request.model_hint = Some("openai:gpt-4o".into());
        let plan = router.plan(&request).unwrap();
        assert_eq!(plan[0].id, "openai:gpt-4o");
        // Same-provider fallback precedes cross-provider
        assert_eq!(plan[1].id, "openai:gpt-4o-mini");
        assert_eq!(plan[2].id, "anthropic:claude-3-5-sonnet");
    }

    #[test]
    fn test_unresolved_hint_is_not_found() {
        let router = router_with(vec![descriptor(
            ProviderFamily::OpenAi,
            "gpt-4o",
            0.9,
            2.5,
            10.0,
        )]);
        let mut request = Request::from_prompt("hello");
        request.model_hint = Some("openai:gpt-99".into());
        assert!(matches!(
            router.plan(&request),
            Err(RouterError::NotFound(_))
        ));
    }

    #[test]
    fn test_empty_registry_is_not_found() {
        let router = router_with(vec![]);
        let request = Request::from_prompt("hello");
        assert!(matches!(
            router.plan(&request),
            Err(RouterError::NotFound(_))
        ));
    }

    #[test]
    fn test_capability_filter_in_plan() {
        let plain = descriptor(ProviderFamily::OpenAi, "text-only", 0.9, 1.0, 1.0);
        let tools = descriptor(ProviderFamily::OpenAi, "tool-model", 0.8, 1.0, 1.0)
            .with_capabilities([Capability::ToolUse]);
        let router = router_with(vec![plain, tools]);

        let mut request = Request::from_prompt("call a tool");
        request.options.tools = Some(vec![crate::types::ToolSchema {
            name: "f".into(),
            description: "d".into(),
            parameters: serde_json::json!({}),
        }]);
        let plan = router.plan(&request).unwrap();
        assert_eq!(plan.len(), 1);
        assert_eq!(plan[0].model_id, "tool-model");
    }

    #[test]
    fn test_min_context_requirement() {
        let small = descriptor(ProviderFamily::OpenAi, "small", 0.9, 1.0, 1.0);
        let big = descriptor(ProviderFamily::OpenAi, "big", 0.8, 1.0, 1.0).with_limits(
            ModelLimits {
                context_tokens: 200_000,
                max_output_tokens: 8192,
            },
        );
        let router = router_with(vec![small, big]);

        let mut request = Request::from_prompt("long doc");
        request.requirements = Some(crate::types::Requirements {
            min_context: Some(100_000),
            ..Default::default()
        });
        let plan = router.plan(&request).unwrap();
        assert_eq!(plan.len(), 1);
        assert_eq!(plan[0].model_id, "big");
    }
}
