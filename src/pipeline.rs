//! Request pipeline: the façade the host server drives
//!
//! A linear, cancellable sequence per request: normalize, authenticate,
//! admit against rate limits, consult the cache, plan a candidate list,
//! dispatch with retry and fallback, then finalize usage, cost, cache, and
//! events. Streaming responses flow through a bounded channel so a slow
//! consumer throttles adapter reads; the per-request deadline converts to
//! cancellation. Load slots and admission guards release on every exit
//! path because they are RAII.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Semaphore};
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::adapters::{
    AdapterRegistry, AdapterRequest, LoadOptions, ProviderAdapter, ProviderFamily,
};
use crate::auth::ApiKeyManager;
use crate::balancer::{LoadBalancer, DEFAULT_DECAY_INTERVAL};
use crate::byok::{ByokStore, SecretSealer};
use crate::cache::{fingerprint, CacheStats, SemanticCache, DEFAULT_SIMILARITY_THRESHOLD};
use crate::config::RouterSettings;
use crate::error::{RouterError, RouterResult};
use crate::events::{DispatchPhase, EventBus, RouterEvent};
use crate::limiter::{RateLimiter, TierLimits};
use crate::metrics::{Metrics, MetricsSnapshot};
use crate::migrate::Migrator;
use crate::registry::{ModelDescriptor, ModelFilter, ModelRegistry};
use crate::retry::RetryPolicy;
use crate::router::Router;
use crate::store::PersistentMap;
use crate::types::{
    estimate_tokens, AuthContext, Request, Response, StreamChunk, Tier, TokenUsage,
};

/// Output budget assumed for admission accounting when max_tokens is unset
const DEFAULT_OUTPUT_BUDGET: u32 = 1024;
/// Streaming backpressure buffer, in chunks
const STREAM_BUFFER: usize = 64;

/// Model load request accepted by the façade
#[derive(Debug, Clone)]
pub struct LoadSpec {
    pub provider: ProviderFamily,
    pub model_id: String,
    /// Issue a cheap probe against the provider during load
    pub probe: bool,
    /// Credential for the probe; resolved via BYOK when absent
    pub api_key: Option<String>,
}

/// Health check report across registered models
#[derive(Debug, Clone, serde::Serialize)]
pub struct HealthReport {
    pub healthy: bool,
    pub models: Vec<ModelHealth>,
    pub cache: CacheStats,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct ModelHealth {
    pub model_id: String,
    pub status: crate::registry::ModelStatus,
    pub current_load: u32,
    pub recent_latency_ms_ema: f64,
    pub consecutive_failures: u32,
}

/// Streamed response handle; cancelling the token tears the stream down
pub struct ResponseStream {
    cancel: CancellationToken,
    inner: ReceiverStream<RouterResult<StreamChunk>>,
}

impl ResponseStream {
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }
}

impl futures::Stream for ResponseStream {
    type Item = RouterResult<StreamChunk>;

    fn poll_next(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Option<Self::Item>> {
        std::pin::Pin::new(&mut self.inner).poll_next(cx)
    }
}

impl Drop for ResponseStream {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// The assembled router core
pub struct RouterCore {
    settings: RouterSettings,
    registry: Arc<ModelRegistry>,
    balancer: Arc<LoadBalancer>,
    router: Router,
    limiter: Arc<RateLimiter>,
    keys: Arc<ApiKeyManager>,
    byok: Arc<ByokStore>,
    cache: Arc<SemanticCache>,
    adapters: Arc<AdapterRegistry>,
    events: EventBus,
    metrics: Arc<Metrics>,
    retry: RetryPolicy,
    concurrency: Arc<Semaphore>,
    indexes: Arc<PersistentMap>,
    decay_task: tokio::task::JoinHandle<()>,
}

impl RouterCore {
    /// Assemble the core: run schema migrations, open the persisted stores,
    /// seed API keys, and start the load-decay task.
    pub async fn new(settings: RouterSettings) -> RouterResult<Self> {
        Migrator::with_builtin_steps(&settings.data_dir)
            .migrate_to_latest()
            .await?;

        let users = PersistentMap::open(settings.data_dir.join("users.json")).await?;
        let byok_map = PersistentMap::open(settings.data_dir.join("byok.json")).await?;
        let indexes = PersistentMap::open(settings.data_dir.join("indexes.json")).await?;

        let keys = Arc::new(ApiKeyManager::new(users));
        keys.seed(&settings.api_keys_seed).await?;
        let byok = Arc::new(ByokStore::new(byok_map, SecretSealer::from_env()));

        let events = EventBus::new();
        let registry = Arc::new(ModelRegistry::new(settings.max_models, events.clone()));
        let balancer = Arc::new(LoadBalancer::new(Arc::clone(&registry)));
        let decay_task = balancer.spawn_decay_task(DEFAULT_DECAY_INTERVAL);
        let router = Router::new(Arc::clone(&registry), settings.default_strategy);
        let cache = Arc::new(SemanticCache::new(
            1024,
            Duration::from_millis(settings.cache_ttl_ms),
            DEFAULT_SIMILARITY_THRESHOLD,
        ));

        info!(
            "Router core ready (strategy {}, {} max models)",
            settings.default_strategy, settings.max_models
        );

        Ok(Self {
            concurrency: Arc::new(Semaphore::new(settings.max_concurrent)),
            registry,
            balancer,
            router,
            limiter: Arc::new(RateLimiter::new()),
            keys,
            byok,
            cache,
            adapters: Arc::new(AdapterRegistry::new()),
            events,
            metrics: Arc::new(Metrics::new()),
            retry: RetryPolicy::default(),
            indexes: Arc::new(indexes),
            decay_task,
            settings,
        })
    }

    pub fn adapters(&self) -> &AdapterRegistry {
        &self.adapters
    }

    pub fn registry(&self) -> &ModelRegistry {
        &self.registry
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn byok(&self) -> &ByokStore {
        &self.byok
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }

    pub fn metrics_snapshot(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    /// Per-model health summary for the observability surface
    pub fn health_report(&self) -> HealthReport {
        let models: Vec<ModelHealth> = self
            .registry
            .all()
            .into_iter()
            .map(|d| ModelHealth {
                model_id: d.id,
                status: d.status,
                current_load: d.current_load,
                recent_latency_ms_ema: d.recent_latency_ms_ema,
                consecutive_failures: d.consecutive_failures,
            })
            .collect();
        HealthReport {
            healthy: models
                .iter()
                .all(|m| m.status == crate::registry::ModelStatus::Ready),
            models,
            cache: self.cache.stats(),
        }
    }

    /// Flush persisted state and stop background tasks
    pub async fn shutdown(&self) -> RouterResult<()> {
        self.registry.checkpoint(&self.indexes).await?;
        self.indexes.close().await?;
        self.keys.close().await?;
        self.byok.close().await?;
        self.decay_task.abort();
        Ok(())
    }

    // ---- façade: Generate ------------------------------------------------

    pub async fn generate(&self, request: Request) -> RouterResult<Response> {
        self.generate_with_cancel(request, CancellationToken::new())
            .await
    }

    /// Unary completion under an external cancellation token; the deadline
    /// (options.timeout or the configured default) also fires the token.
    pub async fn generate_with_cancel(
        &self,
        request: Request,
        cancel: CancellationToken,
    ) -> RouterResult<Response> {
        let deadline = Duration::from_millis(
            request
                .options
                .timeout_ms
                .unwrap_or(self.settings.default_timeout_ms),
        );
        let result = tokio::select! {
            result = self.run_unary(request, cancel.clone()) => result,
            _ = cancel.cancelled() => Err(RouterError::Cancelled),
            _ = tokio::time::sleep(deadline) => {
                cancel.cancel();
                Err(RouterError::Cancelled)
            }
        };
        if let Err(e) = &result {
            self.metrics.record_error(e.kind());
        }
        result
    }

    async fn run_unary(
        &self,
        mut request: Request,
        cancel: CancellationToken,
    ) -> RouterResult<Response> {
        request.validate()?;
        self.metrics.record_request();

        let auth = self.authenticate(&mut request).await?;
        let limits = self.limits_for(&auth).await?;
        let est_tokens = self.estimated_charge(&request);
        let _permit = self
            .concurrency
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| RouterError::Internal("concurrency semaphore closed".into()))?;
        let admission = match self.limiter.admit(&auth.key_id, &limits, est_tokens).await {
            Ok(guard) => guard,
            Err(e) => {
                if let RouterError::RateLimited { retry_after_ms, .. } = &e {
                    self.events.publish(RouterEvent::RateLimited {
                        key_id: auth.key_id.clone(),
                        retry_after_ms: *retry_after_ms,
                    });
                }
                return Err(e);
            }
        };

        // Cache lookup: exact tier first, then semantic
        let prompt = request.prompt_text();
        let fp = self.request_fingerprint(&request);
        if self.settings.cache_enabled && !request.options.stream {
            if let Some(hit) = self.cache.lookup(&fp, &prompt) {
                self.metrics.record_cache(true);
                self.events.publish(RouterEvent::CacheHit {
                    request_id: request.id,
                    semantic: hit.similarity.is_some(),
                    similarity: hit.similarity,
                });
                // A cache hit consumes request quota but no provider tokens
                admission.reconcile(&TokenUsage::default());
                let mut response = hit.response;
                response.cached = true;
                if let Some(similarity) = hit.similarity {
                    response.metadata.insert(
                        "similarity".into(),
                        serde_json::json!(similarity),
                    );
                }
                return Ok(response);
            }
            self.metrics.record_cache(false);
        }

        let mut candidates = self.router.plan(&request)?;
        candidates.truncate(1 + self.settings.max_fallback_depth);

        let response = self
            .dispatch_unary(&request, &auth, &candidates, &cancel)
            .await?;

        // Finalize: reconcile tokens, account cost, cache, session pin
        admission.reconcile(&response.usage);
        self.limiter.record_cost(&auth.key_id, response.cost);
        self.metrics.record_usage(
            response.usage.prompt_tokens,
            response.usage.completion_tokens,
            response.cost,
        );
        self.metrics.record_latency(response.latency_ms);
        if let Some(session) = &request.session_id {
            let model_key = format!("{}:{}", response.provider, response.model);
            self.router.record_session_pick(session, &model_key);
        }
        if self.settings.cache_enabled
            && !request.options.stream
            && response.finish_reason != crate::types::FinishReason::Error
        {
            self.cache.insert(fp, &prompt, response.clone());
        }
        let usage_snapshot = self.limiter.usage_snapshot(&auth.key_id);
        self.keys.touch(&auth.key_id, usage_snapshot).await?;

        Ok(response)
    }

    /// Walk the candidate chain: per-candidate retry with backoff on
    /// transient errors, fallback to the next candidate per the taxonomy.
    async fn dispatch_unary(
        &self,
        request: &Request,
        auth: &AuthContext,
        candidates: &[ModelDescriptor],
        cancel: &CancellationToken,
    ) -> RouterResult<Response> {
        let est_input = estimate_tokens(&request.prompt_text());
        let mut remaining: Vec<ModelDescriptor> = candidates.to_vec();
        let mut last_err: Option<RouterError> = None;

        while let Some(descriptor) = if remaining.is_empty() {
            None
        } else {
            Some(remaining.remove(0))
        } {
            self.publish_phase(request.id, &descriptor.id, DispatchPhase::Preparing);

            // Context-window pre-check
            let budget = request
                .options
                .max_tokens
                .unwrap_or(DEFAULT_OUTPUT_BUDGET)
                .min(descriptor.limits.max_output_tokens);
            if est_input + budget > descriptor.limits.context_tokens {
                let err = RouterError::ContextLength {
                    prompt_tokens: est_input,
                    max_tokens: budget,
                    context_tokens: descriptor.limits.context_tokens,
                };
                debug!("{} fails context pre-check: {}", descriptor.id, err);
                last_err = Some(err);
                // Prefer larger-context candidates from here on
                remaining.sort_by(|a, b| b.limits.context_tokens.cmp(&a.limits.context_tokens));
                continue;
            }

            let api_key = self
                .byok
                .resolve(
                    auth.user_id.as_deref(),
                    auth.group_id.as_deref(),
                    descriptor.provider,
                )
                .await?;
            let adapter = match self.adapters.get(descriptor.provider) {
                Ok(adapter) => adapter,
                Err(e) => {
                    last_err = Some(e);
                    continue;
                }
            };
            let adapter_request = AdapterRequest::from_request(request, api_key);

            match self
                .attempt_candidate(&adapter, &adapter_request, &descriptor, request, cancel)
                .await
            {
                Ok(response) => return Ok(response),
                Err(e) if e.allows_fallback() => {
                    if matches!(e, RouterError::ContextLength { .. }) {
                        remaining
                            .sort_by(|a, b| b.limits.context_tokens.cmp(&a.limits.context_tokens));
                    }
                    warn!("Candidate {} failed ({}), falling back", descriptor.id, e);
                    last_err = Some(e);
                }
                Err(e) => return Err(e),
            }
        }

        Err(last_err
            .unwrap_or_else(|| RouterError::NotFound("no candidates available".into())))
    }

    /// Retry loop against a single candidate, holding its load slot
    async fn attempt_candidate(
        &self,
        adapter: &Arc<dyn ProviderAdapter>,
        adapter_request: &AdapterRequest,
        descriptor: &ModelDescriptor,
        request: &Request,
        cancel: &CancellationToken,
    ) -> RouterResult<Response> {
        let _slot = self.balancer.acquire(&descriptor.id);
        let mut attempt = 0u32;

        loop {
            attempt += 1;
            self.publish_phase(request.id, &descriptor.id, DispatchPhase::Dialing);

            let result = tokio::select! {
                result = adapter.complete(adapter_request, descriptor) => result,
                _ = cancel.cancelled() => Err(RouterError::Cancelled),
            };

            match result {
                Ok(response) => {
                    self.balancer
                        .record_latency(&descriptor.id, response.latency_ms as f64);
                    self.registry.record_success(&descriptor.id);
                    self.publish_phase(request.id, &descriptor.id, DispatchPhase::Done);
                    self.events.publish(RouterEvent::DispatchFinished {
                        request_id: request.id,
                        model_id: descriptor.id.clone(),
                        latency_ms: response.latency_ms,
                        prompt_tokens: response.usage.prompt_tokens,
                        completion_tokens: response.usage.completion_tokens,
                    });
                    self.events.publish(RouterEvent::CostRecorded {
                        request_id: request.id,
                        model_id: descriptor.id.clone(),
                        input_cost: descriptor
                            .pricing
                            .estimate(response.usage.prompt_tokens, 0),
                        output_cost: descriptor
                            .pricing
                            .estimate(0, response.usage.completion_tokens),
                    });
                    return Ok(response);
                }
                Err(e) => {
                    let phase = if matches!(e, RouterError::Cancelled) {
                        DispatchPhase::Cancelled
                    } else {
                        DispatchPhase::Errored
                    };
                    self.publish_phase(request.id, &descriptor.id, phase);
                    self.events.publish(RouterEvent::DispatchFailed {
                        request_id: request.id,
                        model_id: descriptor.id.clone(),
                        kind: e.kind().to_string(),
                        attempt,
                    });
                    if e.is_retryable() {
                        self.registry.record_failure(&descriptor.id);
                    }
                    if self.retry.should_retry(&e, attempt) {
                        let delay = self.retry.delay_for(attempt);
                        debug!(
                            "Retrying {} after {:?} (attempt {})",
                            descriptor.id, delay, attempt
                        );
                        tokio::select! {
                            _ = tokio::time::sleep(delay) => {}
                            _ = cancel.cancelled() => return Err(RouterError::Cancelled),
                        }
                        continue;
                    }
                    return Err(e);
                }
            }
        }
    }

    // ---- façade: GenerateStream -----------------------------------------

    /// Streamed completion. Chunks flow through a bounded channel; the
    /// returned handle's token cancels the upstream within a chunk
    /// boundary, releasing the load slot and admission on the way out.
    pub async fn generate_stream(&self, mut request: Request) -> RouterResult<ResponseStream> {
        request.options.stream = true;
        request.validate()?;
        self.metrics.record_request();

        let cancel = CancellationToken::new();
        let auth = self.authenticate(&mut request).await?;
        let limits = self.limits_for(&auth).await?;
        let est_tokens = self.estimated_charge(&request);
        let permit = self
            .concurrency
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| RouterError::Internal("concurrency semaphore closed".into()))?;
        let admission = self.limiter.admit(&auth.key_id, &limits, est_tokens).await?;

        let mut candidates = self.router.plan(&request)?;
        candidates.truncate(1 + self.settings.max_fallback_depth);

        // Open the upstream before returning so dial errors surface early
        let mut selected = None;
        let mut last_err = None;
        for descriptor in candidates {
            let api_key = self
                .byok
                .resolve(
                    auth.user_id.as_deref(),
                    auth.group_id.as_deref(),
                    descriptor.provider,
                )
                .await?;
            let adapter = match self.adapters.get(descriptor.provider) {
                Ok(adapter) => adapter,
                Err(e) => {
                    last_err = Some(e);
                    continue;
                }
            };
            let adapter_request = AdapterRequest::from_request(&request, api_key);
            let slot = self.balancer.acquire(&descriptor.id);
            self.publish_phase(request.id, &descriptor.id, DispatchPhase::Dialing);
            match adapter.stream(&adapter_request, &descriptor).await {
                Ok(stream) => {
                    selected = Some((descriptor, stream, slot));
                    break;
                }
                Err(e) if e.allows_fallback() => {
                    drop(slot);
                    warn!("Stream candidate {} failed: {}", descriptor.id, e);
                    last_err = Some(e);
                }
                Err(e) => {
                    drop(slot);
                    return Err(e);
                }
            }
        }
        let (descriptor, mut upstream, slot) = selected.ok_or_else(|| {
            last_err.unwrap_or_else(|| RouterError::NotFound("no candidates available".into()))
        })?;

        self.publish_phase(request.id, &descriptor.id, DispatchPhase::Streaming);

        let (tx, rx) = mpsc::channel::<RouterResult<StreamChunk>>(STREAM_BUFFER);
        let stream_deadline = Duration::from_millis(
            request
                .options
                .timeout_ms
                .unwrap_or(self.settings.stream_timeout_ms),
        );

        let forward = {
            let cancel = cancel.clone();
            let events = self.events.clone();
            let registry = Arc::clone(&self.registry);
            let balancer = Arc::clone(&self.balancer);
            let limiter = Arc::clone(&self.limiter);
            let metrics = Arc::clone(&self.metrics);
            let cache = Arc::clone(&self.cache);
            let cache_enabled = self.settings.cache_enabled && request.options.cache_streamed;
            let fp = self.request_fingerprint(&request);
            let prompt = request.prompt_text();
            let request_id = request.id;
            let key_id = auth.key_id.clone();
            let descriptor = descriptor.clone();
            let pricing = descriptor.pricing;
            let started = std::time::Instant::now();

            async move {
                use futures::StreamExt;
                // Slot, permit, and admission ride with the task; every
                // exit path below releases them on drop.
                let _slot = slot;
                let _permit = permit;
                let admission = admission;

                let mut buffered = String::new();
                let mut final_usage: Option<TokenUsage> = None;
                let mut finish = None;
                let mut finished_cleanly = false;
                let deadline = tokio::time::sleep(stream_deadline);
                tokio::pin!(deadline);

                loop {
                    let item = tokio::select! {
                        item = upstream.next() => item,
                        _ = cancel.cancelled() => {
                            events.publish(RouterEvent::DispatchPhaseChanged {
                                request_id,
                                model_id: descriptor.id.clone(),
                                phase: DispatchPhase::Cancelled,
                            });
                            break;
                        }
                        _ = &mut deadline => {
                            let _ = tx.send(Err(RouterError::Cancelled)).await;
                            break;
                        }
                    };
                    let Some(item) = item else {
                        break;
                    };
                    match item {
                        Ok(chunk) => {
                            if let Some(delta) = &chunk.delta {
                                buffered.push_str(delta);
                            }
                            if let Some(usage) = chunk.usage {
                                final_usage = Some(usage);
                            }
                            if chunk.done {
                                finish = chunk.finish_reason;
                                finished_cleanly = true;
                                let _ = tx.send(Ok(chunk)).await;
                                break;
                            }
                            // Backpressure: a slow consumer parks us here
                            if tx.send(Ok(chunk)).await.is_err() {
                                break;
                            }
                        }
                        Err(e) => {
                            let _ = tx.send(Err(e)).await;
                            break;
                        }
                    }
                }
                drop(upstream);

                if finished_cleanly {
                    let usage = final_usage.unwrap_or_else(|| {
                        TokenUsage::new(
                            estimate_tokens(&prompt),
                            estimate_tokens(&buffered),
                        )
                    });
                    let cost = pricing.cost_for(&usage);
                    let latency_ms = started.elapsed().as_millis() as u64;
                    admission.reconcile(&usage);
                    limiter.record_cost(&key_id, cost);
                    metrics.record_usage(usage.prompt_tokens, usage.completion_tokens, cost);
                    metrics.record_latency(latency_ms);
                    registry.record_success(&descriptor.id);
                    balancer.record_latency(&descriptor.id, latency_ms as f64);
                    events.publish(RouterEvent::DispatchFinished {
                        request_id,
                        model_id: descriptor.id.clone(),
                        latency_ms,
                        prompt_tokens: usage.prompt_tokens,
                        completion_tokens: usage.completion_tokens,
                    });
                    if cache_enabled {
                        cache.insert(
                            fp,
                            &prompt,
                            Response {
                                text: buffered,
                                usage,
                                cost,
                                latency_ms,
                                model: descriptor.model_id.clone(),
                                provider: descriptor.provider.to_string(),
                                finish_reason: finish
                                    .unwrap_or(crate::types::FinishReason::Stop),
                                tool_calls: None,
                                cached: false,
                                metadata: HashMap::new(),
                            },
                        );
                    }
                } else {
                    // Cancelled or errored: provider tokens unknown, refund
                    admission.reconcile(&TokenUsage::default());
                }
            }
        };
        tokio::spawn(forward);

        Ok(ResponseStream {
            cancel,
            inner: ReceiverStream::new(rx),
        })
    }

    // ---- façade: LoadModel / ListModels ---------------------------------

    pub async fn load_model(&self, spec: LoadSpec) -> RouterResult<ModelDescriptor> {
        let adapter = self.adapters.get(spec.provider)?;
        let api_key = match spec.api_key.clone() {
            Some(key) => Some(key),
            None if spec.probe => Some(self.byok.resolve(None, None, spec.provider).await?),
            None => None,
        };
        let descriptor = adapter
            .load(
                &spec.model_id,
                &LoadOptions {
                    probe: spec.probe,
                    api_key,
                },
            )
            .await?;
        self.registry.register(descriptor.clone())?;
        Ok(descriptor)
    }

    pub async fn unload_model(&self, id: &str) -> RouterResult<()> {
        if let Some(descriptor) = self.registry.get(id) {
            let adapter = self.adapters.get(descriptor.provider)?;
            adapter.unload(id).await?;
        }
        self.registry.unregister(id);
        Ok(())
    }

    pub fn list_models(&self, filter: &ModelFilter) -> Vec<ModelDescriptor> {
        self.registry.get_available(filter)
    }

    // ---- façade: AdminKeyOps --------------------------------------------

    pub async fn admin_create_key(
        &self,
        caller: &AuthContext,
        customer: &str,
        tier: Tier,
        user_id: Option<String>,
        group_id: Option<String>,
    ) -> RouterResult<(crate::auth::ApiKeyRecord, String)> {
        self.require_admin(caller)?;
        self.keys.create_key(customer, tier, user_id, group_id).await
    }

    pub async fn admin_disable_key(
        &self,
        caller: &AuthContext,
        key_id: &str,
    ) -> RouterResult<()> {
        self.require_admin(caller)?;
        self.keys.disable_key(key_id).await
    }

    pub async fn admin_delete_key(&self, caller: &AuthContext, key_id: &str) -> RouterResult<bool> {
        self.require_admin(caller)?;
        self.keys.delete_key(key_id).await
    }

    fn require_admin(&self, caller: &AuthContext) -> RouterResult<()> {
        if caller.tier != Tier::Admin {
            return Err(RouterError::Permission(
                "admin tier required for key operations".into(),
            ));
        }
        Ok(())
    }

    // ---- internals -------------------------------------------------------

    async fn authenticate(&self, request: &mut Request) -> RouterResult<AuthContext> {
        if let Some(auth) = &request.auth {
            return Ok(auth.clone());
        }
        let presented = request
            .api_key
            .as_deref()
            .ok_or_else(|| RouterError::Auth("missing API key".into()))?;
        let auth = self.keys.authenticate(presented).await?;
        request.auth = Some(auth.clone());
        Ok(auth)
    }

    async fn limits_for(&self, auth: &AuthContext) -> RouterResult<TierLimits> {
        Ok(self
            .keys
            .get(&auth.key_id)
            .await?
            .map(|record| record.limits())
            .unwrap_or_else(|| TierLimits::for_tier(auth.tier)))
    }

    /// Admission charge: prompt estimate plus the output cap
    fn estimated_charge(&self, request: &Request) -> u64 {
        let est_input = estimate_tokens(&request.prompt_text()) as u64;
        let budget = request
            .options
            .max_tokens
            .unwrap_or(DEFAULT_OUTPUT_BUDGET) as u64;
        est_input + budget
    }

    fn request_fingerprint(&self, request: &Request) -> String {
        let target = request.model_hint.as_deref().unwrap_or("auto");
        fingerprint(target, target, &request.canonical_messages(), &request.options)
    }

    fn publish_phase(&self, request_id: uuid::Uuid, model_id: &str, phase: DispatchPhase) {
        self.events.publish(RouterEvent::DispatchPhaseChanged {
            request_id,
            model_id: model_id.to_string(),
            phase,
        });
    }
}
