//! Cohere provider adapter
//!
//! Cohere keeps distinct endpoints per operation: `/v1/chat` for
//! completions, `/v1/embed`, and `/v1/rerank`. Chat streaming is
//! newline-delimited JSON events (`text-generation` / `stream-end`) rather
//! than SSE.

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::header::{HeaderMap, HeaderValue, CONTENT_TYPE};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tracing::{debug, error};

use crate::error::{RouterError, RouterResult};
use crate::registry::{ModelDescriptor, ModelLimits, ModelStatus, Pricing};
use crate::types::{
    Capability, ChatMessage, FinishReason, MessageRole, RequestOptions, Response, StreamChunk,
    TokenUsage,
};

use super::{
    pricing_table_hash, AdapterInfo, AdapterRequest, ChunkStream, EmbeddingRequest,
    EmbeddingResponse, LoadOptions, ModelSummary, ProviderAdapter, ProviderFamily, RerankRequest,
    RerankResult,
};

const DEFAULT_BASE_URL: &str = "https://api.cohere.com";
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Serialize)]
struct CatalogEntry {
    model_id: &'static str,
    context_tokens: u32,
    input_per_mtok: f64,
    output_per_mtok: f64,
    quality: f64,
    rerank: bool,
    embed: bool,
}

const CATALOG: [CatalogEntry; 4] = [
    CatalogEntry {
        model_id: "command-r-plus",
        context_tokens: 128_000,
        input_per_mtok: 2.5,
        output_per_mtok: 10.0,
        quality: 0.83,
        rerank: false,
        embed: false,
    },
    CatalogEntry {
        model_id: "command-r",
        context_tokens: 128_000,
        input_per_mtok: 0.15,
        output_per_mtok: 0.6,
        quality: 0.72,
        rerank: false,
        embed: false,
    },
    CatalogEntry {
        model_id: "embed-english-v3.0",
        context_tokens: 512,
        input_per_mtok: 0.1,
        output_per_mtok: 0.0,
        quality: 0.8,
        rerank: false,
        embed: true,
    },
    CatalogEntry {
        model_id: "rerank-english-v3.0",
        context_tokens: 4096,
        input_per_mtok: 0.0,
        output_per_mtok: 0.0,
        quality: 0.8,
        rerank: true,
        embed: false,
    },
];

#[derive(Debug, Deserialize)]
struct WireChatResponse {
    text: String,
    finish_reason: Option<String>,
    meta: Option<WireMeta>,
}

#[derive(Debug, Deserialize)]
struct WireMeta {
    tokens: Option<WireTokens>,
}

#[derive(Debug, Deserialize)]
struct WireTokens {
    input_tokens: Option<f64>,
    output_tokens: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct WireStreamEvent {
    event_type: String,
    text: Option<String>,
    finish_reason: Option<String>,
    response: Option<WireChatResponse>,
}

fn map_finish_reason(reason: Option<&str>) -> FinishReason {
    match reason {
        Some("MAX_TOKENS") => FinishReason::Length,
        Some("ERROR_TOXIC") => FinishReason::Safety,
        _ => FinishReason::Stop,
    }
}

/// Adapter for Cohere's native API
pub struct CohereAdapter {
    base_url: String,
    http: Client,
}

impl CohereAdapter {
    pub fn new() -> Self {
        Self::with_base_url(DEFAULT_BASE_URL)
    }

    pub fn with_base_url(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            http: Client::new(),
        }
    }

    fn headers(&self, api_key: &str) -> RouterResult<HeaderMap> {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        headers.insert(
            "Authorization",
            HeaderValue::from_str(&format!("Bearer {}", api_key))
                .map_err(|e| RouterError::Auth(format!("invalid API key: {}", e)))?,
        );
        Ok(headers)
    }

    /// Cohere chat takes the latest user turn as `message` and the rest as
    /// `chat_history` with USER/CHATBOT roles.
    fn build_chat_body(
        messages: &[ChatMessage],
        options: &RequestOptions,
        model_id: &str,
        stream: bool,
    ) -> Value {
        let mut preamble = None;
        let mut history = Vec::new();
        let mut last_user = String::new();
        for message in messages {
            match message.role {
                MessageRole::System => preamble = Some(message.content.as_text()),
                MessageRole::Assistant => {
                    if !last_user.is_empty() {
                        history.push(serde_json::json!({
                            "role": "USER", "message": last_user
                        }));
                        last_user = String::new();
                    }
                    history.push(serde_json::json!({
                        "role": "CHATBOT", "message": message.content.as_text()
                    }));
                }
                _ => {
                    if !last_user.is_empty() {
                        history.push(serde_json::json!({
                            "role": "USER", "message": last_user
                        }));
                    }
                    last_user = message.content.as_text();
                }
            }
        }

        let mut body = serde_json::json!({
            "model": model_id,
            "message": last_user,
        });
        if !history.is_empty() {
            body["chat_history"] = Value::Array(history);
        }
        if let Some(preamble) = preamble {
            body["preamble"] = Value::String(preamble);
        }
        if let Some(v) = options.max_tokens {
            body["max_tokens"] = v.into();
        }
        if let Some(v) = options.temperature {
            body["temperature"] = serde_json::json!(v);
        }
        if let Some(v) = options.top_p {
            body["p"] = serde_json::json!(v);
        }
        if let Some(v) = options.top_k {
            body["k"] = v.into();
        }
        if let Some(v) = &options.stop_sequences {
            body["stop_sequences"] = serde_json::json!(v);
        }
        if stream {
            body["stream"] = true.into();
        }
        body
    }

    async fn post(
        &self,
        path: &str,
        api_key: &str,
        body: &Value,
        timeout: Duration,
    ) -> RouterResult<reqwest::Response> {
        let url = format!("{}{}", self.base_url, path);
        debug!("cohere request: {}", url);
        let response = self
            .http
            .post(&url)
            .headers(self.headers(api_key)?)
            .json(body)
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| RouterError::UpstreamTransient(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let text = response.text().await.unwrap_or_default();
            error!("cohere API error {}: {}", status, text);
            return Err(RouterError::from_provider_status(status, &text));
        }
        Ok(response)
    }

    fn timeout(options: &RequestOptions) -> Duration {
        options
            .timeout_ms
            .map(Duration::from_millis)
            .unwrap_or(DEFAULT_TIMEOUT)
    }

    fn usage_from_meta(meta: Option<&WireMeta>, prompt: &str, text: &str) -> TokenUsage {
        meta.and_then(|m| m.tokens.as_ref())
            .map(|t| {
                TokenUsage::new(
                    t.input_tokens.unwrap_or(0.0) as u32,
                    t.output_tokens.unwrap_or(0.0) as u32,
                )
            })
            .unwrap_or_else(|| {
                TokenUsage::new(
                    crate::types::estimate_tokens(prompt),
                    crate::types::estimate_tokens(text),
                )
            })
    }
}

impl Default for CohereAdapter {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ProviderAdapter for CohereAdapter {
    fn family(&self) -> ProviderFamily {
        ProviderFamily::Cohere
    }

    fn info(&self) -> AdapterInfo {
        AdapterInfo {
            name: "cohere".into(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            features: vec![
                "chat".into(),
                "streaming".into(),
                "embeddings".into(),
                "rerank".into(),
            ],
            pricing_table_hash: pricing_table_hash(&CATALOG),
            status: "ready".into(),
        }
    }

    async fn load(&self, model_id: &str, _options: &LoadOptions) -> RouterResult<ModelDescriptor> {
        let entry = CATALOG
            .iter()
            .find(|e| e.model_id == model_id)
            .ok_or_else(|| RouterError::NotFound(format!("cohere has no model {}", model_id)))?;

        let mut descriptor = ModelDescriptor::new(ProviderFamily::Cohere, entry.model_id)
            .with_limits(ModelLimits {
                context_tokens: entry.context_tokens,
                max_output_tokens: 4096,
            })
            .with_pricing(Pricing::new(entry.input_per_mtok, entry.output_per_mtok))
            .with_quality(entry.quality);
        if entry.embed {
            descriptor = descriptor.with_capabilities([Capability::Embedding]);
        }
        if entry.rerank {
            descriptor = descriptor.with_capabilities([Capability::Rerank]);
        }
        descriptor.status = ModelStatus::Ready;
        Ok(descriptor)
    }

    async fn complete(
        &self,
        request: &AdapterRequest,
        descriptor: &ModelDescriptor,
    ) -> RouterResult<Response> {
        let started = Instant::now();
        let body = Self::build_chat_body(
            &request.messages,
            &request.options,
            &descriptor.model_id,
            false,
        );
        let response = self
            .post(
                "/v1/chat",
                &request.api_key,
                &body,
                Self::timeout(&request.options),
            )
            .await?;
        let wire: WireChatResponse = response
            .json()
            .await
            .map_err(|e| RouterError::UpstreamPermanent(format!("malformed response: {}", e)))?;

        let prompt = request
            .messages
            .iter()
            .map(|m| m.content.as_text())
            .collect::<Vec<_>>()
            .join("\n");
        let usage = Self::usage_from_meta(wire.meta.as_ref(), &prompt, &wire.text);

        Ok(Response {
            text: wire.text,
            usage,
            cost: descriptor.pricing.cost_for(&usage),
            latency_ms: started.elapsed().as_millis() as u64,
            model: descriptor.model_id.clone(),
            provider: "cohere".into(),
            finish_reason: map_finish_reason(wire.finish_reason.as_deref()),
            tool_calls: None,
            cached: false,
            metadata: HashMap::new(),
        })
    }

    async fn stream(
        &self,
        request: &AdapterRequest,
        descriptor: &ModelDescriptor,
    ) -> RouterResult<ChunkStream> {
        let body = Self::build_chat_body(
            &request.messages,
            &request.options,
            &descriptor.model_id,
            true,
        );
        let response = self
            .post(
                "/v1/chat",
                &request.api_key,
                &body,
                Self::timeout(&request.options),
            )
            .await?;

        // Newline-delimited JSON events
        let prompt = request
            .messages
            .iter()
            .map(|m| m.content.as_text())
            .collect::<Vec<_>>()
            .join("\n");
        let mut buffer = String::new();
        let mut done_emitted = false;

        let stream = response
            .bytes_stream()
            .map(move |chunk| match chunk {
                Ok(bytes) => {
                    let mut out: Vec<RouterResult<StreamChunk>> = Vec::new();
                    match std::str::from_utf8(&bytes) {
                        Ok(text) => buffer.push_str(text),
                        Err(e) => {
                            return vec![Err(RouterError::UpstreamPermanent(format!(
                                "invalid UTF-8 in stream: {}",
                                e
                            )))]
                        }
                    }
                    while let Some(pos) = buffer.find('\n') {
                        let line = buffer[..pos].trim().to_string();
                        buffer.drain(..pos + 1);
                        if line.is_empty() || done_emitted {
                            continue;
                        }
                        let event: WireStreamEvent = match serde_json::from_str(&line) {
                            Ok(event) => event,
                            Err(e) => {
                                out.push(Err(RouterError::UpstreamPermanent(format!(
                                    "malformed stream event: {}",
                                    e
                                ))));
                                continue;
                            }
                        };
                        match event.event_type.as_str() {
                            "text-generation" => {
                                if let Some(text) = event.text {
                                    out.push(Ok(StreamChunk::delta(text, 0)));
                                }
                            }
                            "stream-end" => {
                                done_emitted = true;
                                let usage = event.response.as_ref().map(|r| {
                                    Self::usage_from_meta(r.meta.as_ref(), &prompt, &r.text)
                                });
                                out.push(Ok(StreamChunk::done(
                                    usage,
                                    Some(map_finish_reason(event.finish_reason.as_deref())),
                                )));
                            }
                            _ => {}
                        }
                    }
                    out
                }
                Err(e) => vec![Err(RouterError::UpstreamTransient(e.to_string()))],
            })
            .flat_map(futures::stream::iter);

        // Terminal chunk guard when the upstream closes without stream-end
        let epilogue = futures::stream::once(async { Ok(StreamChunk::done(None, None)) });
        let guarded = stream.chain(epilogue).scan(false, |finished, item| {
            if *finished {
                return futures::future::ready(None);
            }
            if let Ok(chunk) = &item {
                if chunk.done {
                    *finished = true;
                }
            }
            futures::future::ready(Some(item))
        });

        Ok(Box::pin(guarded))
    }

    async fn list_models(&self) -> RouterResult<Vec<ModelSummary>> {
        Ok(CATALOG
            .iter()
            .map(|entry| ModelSummary {
                id: entry.model_id.to_string(),
                provider: "cohere".into(),
                context_tokens: Some(entry.context_tokens),
                description: None,
            })
            .collect())
    }

    async fn embed(&self, request: &EmbeddingRequest) -> RouterResult<EmbeddingResponse> {
        #[derive(Deserialize)]
        struct EmbedWire {
            embeddings: Vec<Vec<f32>>,
        }

        let body = serde_json::json!({
            "model": "embed-english-v3.0",
            "texts": request.inputs,
            "input_type": "search_document",
        });
        let response = self
            .post("/v1/embed", &request.api_key, &body, DEFAULT_TIMEOUT)
            .await?;
        let wire: EmbedWire = response
            .json()
            .await
            .map_err(|e| RouterError::UpstreamPermanent(format!("malformed embeddings: {}", e)))?;

        let prompt_tokens: u32 = request
            .inputs
            .iter()
            .map(|t| crate::types::estimate_tokens(t))
            .sum();
        let usage = TokenUsage::new(prompt_tokens, 0);
        Ok(EmbeddingResponse {
            vectors: wire.embeddings,
            usage,
            cost: prompt_tokens as f64 * 0.1 / 1_000_000.0,
        })
    }

    async fn rerank(&self, request: &RerankRequest) -> RouterResult<Vec<RerankResult>> {
        #[derive(Deserialize)]
        struct RerankWire {
            results: Vec<RerankWireResult>,
        }
        #[derive(Deserialize)]
        struct RerankWireResult {
            index: usize,
            relevance_score: f64,
        }

        let mut body = serde_json::json!({
            "model": "rerank-english-v3.0",
            "query": request.query,
            "documents": request.documents,
        });
        if let Some(top_n) = request.top_n {
            body["top_n"] = top_n.into();
        }
        let response = self
            .post("/v1/rerank", &request.api_key, &body, DEFAULT_TIMEOUT)
            .await?;
        let wire: RerankWire = response
            .json()
            .await
            .map_err(|e| RouterError::UpstreamPermanent(format!("malformed rerank: {}", e)))?;

        Ok(wire
            .results
            .into_iter()
            .map(|r| RerankResult {
                index: r.index,
                relevance_score: r.relevance_score,
            })
            .collect())
    }
}
