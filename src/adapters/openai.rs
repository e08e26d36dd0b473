//! OpenAI-compatible provider adapter
//!
//! One adapter serves every family speaking the OpenAI chat-completions
//! protocol: OpenAI itself plus Groq, DeepSeek, OpenRouter, Novita,
//! Perplexity, and Mistral. Family quirks are applied at request-build
//! time: Mistral's `safe_prompt`, Perplexity's search options and citation
//! metadata. Streaming arrives as SSE `data:` frames terminated by the
//! `[DONE]` sentinel.

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::header::{HeaderMap, HeaderValue, CONTENT_TYPE};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::{debug, error};

use crate::error::{RouterError, RouterResult};
use crate::registry::{ModelDescriptor, ModelLimits, ModelStatus, Pricing};
use crate::sse::sse_event_stream;
use crate::types::{
    ChatMessage, ContentPart, FinishReason, MessageContent, MessageRole, RequestOptions, Response,
    ResponseFormat, StreamChunk, TokenUsage, ToolCall, ToolCallDelta, ToolChoice,
};

use super::{
    pricing_table_hash, AdapterInfo, AdapterRequest, ChunkStream, EmbeddingRequest,
    EmbeddingResponse, LoadOptions, ModelSummary, ProviderAdapter, ProviderFamily,
};

/// Default request timeout when the request does not carry one
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Static catalog entry for a family
#[derive(Debug, Clone, Serialize)]
pub struct CatalogEntry {
    pub model_id: &'static str,
    pub context_tokens: u32,
    pub max_output_tokens: u32,
    pub input_per_mtok: f64,
    pub output_per_mtok: f64,
    pub quality: f64,
    pub vision: bool,
    pub tools: bool,
}

impl CatalogEntry {
    fn descriptor(&self, family: ProviderFamily) -> ModelDescriptor {
        use crate::types::Capability;
        let mut descriptor = ModelDescriptor::new(family, self.model_id)
            .with_limits(ModelLimits {
                context_tokens: self.context_tokens,
                max_output_tokens: self.max_output_tokens,
            })
            .with_pricing(Pricing::new(self.input_per_mtok, self.output_per_mtok))
            .with_quality(self.quality)
            .with_capabilities([Capability::JsonMode]);
        if self.vision {
            descriptor = descriptor.with_capabilities([Capability::Vision]);
        }
        if self.tools {
            descriptor = descriptor
                .with_capabilities([Capability::ToolUse, Capability::FunctionCalling]);
        }
        descriptor
    }
}

fn catalog(family: ProviderFamily) -> &'static [CatalogEntry] {
    match family {
        ProviderFamily::OpenAi => &[
            CatalogEntry {
                model_id: "gpt-4o",
                context_tokens: 128_000,
                max_output_tokens: 16_384,
                input_per_mtok: 2.5,
                output_per_mtok: 10.0,
                quality: 0.9,
                vision: true,
                tools: true,
            },
            CatalogEntry {
                model_id: "gpt-4o-mini",
                context_tokens: 128_000,
                max_output_tokens: 16_384,
                input_per_mtok: 0.15,
                output_per_mtok: 0.6,
                quality: 0.75,
                vision: true,
                tools: true,
            },
            CatalogEntry {
                model_id: "o4-mini",
                context_tokens: 200_000,
                max_output_tokens: 100_000,
                input_per_mtok: 1.1,
                output_per_mtok: 4.4,
                quality: 0.88,
                vision: true,
                tools: true,
            },
        ],
        ProviderFamily::Groq => &[
            CatalogEntry {
                model_id: "llama-3.3-70b-versatile",
                context_tokens: 128_000,
                max_output_tokens: 32_768,
                input_per_mtok: 0.59,
                output_per_mtok: 0.79,
                quality: 0.78,
                vision: false,
                tools: true,
            },
            CatalogEntry {
                model_id: "llama-3.1-8b-instant",
                context_tokens: 128_000,
                max_output_tokens: 8_192,
                input_per_mtok: 0.05,
                output_per_mtok: 0.08,
                quality: 0.6,
                vision: false,
                tools: true,
            },
        ],
        ProviderFamily::DeepSeek => &[
            CatalogEntry {
                model_id: "deepseek-chat",
                context_tokens: 64_000,
                max_output_tokens: 8_192,
                input_per_mtok: 0.27,
                output_per_mtok: 1.1,
                quality: 0.8,
                vision: false,
                tools: true,
            },
            CatalogEntry {
                model_id: "deepseek-reasoner",
                context_tokens: 64_000,
                max_output_tokens: 65_536,
                input_per_mtok: 0.55,
                output_per_mtok: 2.19,
                quality: 0.86,
                vision: false,
                tools: false,
            },
        ],
        ProviderFamily::Mistral => &[
            CatalogEntry {
                model_id: "mistral-large-latest",
                context_tokens: 128_000,
                max_output_tokens: 8_192,
                input_per_mtok: 2.0,
                output_per_mtok: 6.0,
                quality: 0.84,
                vision: false,
                tools: true,
            },
            CatalogEntry {
                model_id: "mistral-small-latest",
                context_tokens: 32_000,
                max_output_tokens: 8_192,
                input_per_mtok: 0.2,
                output_per_mtok: 0.6,
                quality: 0.68,
                vision: false,
                tools: true,
            },
        ],
        ProviderFamily::Perplexity => &[
            CatalogEntry {
                model_id: "sonar",
                context_tokens: 127_000,
                max_output_tokens: 8_192,
                input_per_mtok: 1.0,
                output_per_mtok: 1.0,
                quality: 0.74,
                vision: false,
                tools: false,
            },
            CatalogEntry {
                model_id: "sonar-pro",
                context_tokens: 200_000,
                max_output_tokens: 8_192,
                input_per_mtok: 3.0,
                output_per_mtok: 15.0,
                quality: 0.85,
                vision: false,
                tools: false,
            },
        ],
        ProviderFamily::OpenRouter => &[CatalogEntry {
            model_id: "openrouter/auto",
            context_tokens: 128_000,
            max_output_tokens: 8_192,
            input_per_mtok: 1.0,
            output_per_mtok: 3.0,
            quality: 0.75,
            vision: false,
            tools: true,
        }],
        ProviderFamily::Novita => &[CatalogEntry {
            model_id: "meta-llama/llama-3.1-70b-instruct",
            context_tokens: 128_000,
            max_output_tokens: 8_192,
            input_per_mtok: 0.34,
            output_per_mtok: 0.39,
            quality: 0.72,
            vision: false,
            tools: false,
        }],
        _ => &[],
    }
}

fn default_base_url(family: ProviderFamily) -> &'static str {
    match family {
        ProviderFamily::OpenAi => "https://api.openai.com/v1",
        ProviderFamily::Groq => "https://api.groq.com/openai/v1",
        ProviderFamily::DeepSeek => "https://api.deepseek.com/v1",
        ProviderFamily::OpenRouter => "https://openrouter.ai/api/v1",
        ProviderFamily::Novita => "https://api.novita.ai/v3/openai",
        ProviderFamily::Perplexity => "https://api.perplexity.ai",
        ProviderFamily::Mistral => "https://api.mistral.ai/v1",
        _ => "https://api.openai.com/v1",
    }
}

// Wire types; these never cross the adapter boundary.

#[derive(Debug, Serialize)]
struct WireRequest {
    model: String,
    messages: Vec<WireMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_p: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    frequency_penalty: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    presence_penalty: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stop: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    seed: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stream: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_format: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<Vec<Value>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_choice: Option<Value>,
    /// Mistral only
    #[serde(skip_serializing_if = "Option::is_none")]
    safe_prompt: Option<bool>,
    /// Perplexity only
    #[serde(skip_serializing_if = "Option::is_none")]
    search_recency_filter: Option<String>,
}

#[derive(Debug, Serialize)]
struct WireMessage {
    role: &'static str,
    content: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    name: Option<String>,
}

fn wire_role(role: MessageRole) -> &'static str {
    match role {
        MessageRole::System => "system",
        MessageRole::User => "user",
        MessageRole::Assistant => "assistant",
        MessageRole::Tool => "tool",
        MessageRole::Function => "function",
    }
}

fn wire_content(content: &MessageContent) -> Value {
    match content {
        MessageContent::Text(text) => Value::String(text.clone()),
        MessageContent::Parts(parts) => Value::Array(
            parts
                .iter()
                .map(|part| match part {
                    ContentPart::Text { text } => {
                        serde_json::json!({"type": "text", "text": text})
                    }
                    ContentPart::ImageUrl { url } => {
                        serde_json::json!({"type": "image_url", "image_url": {"url": url}})
                    }
                })
                .collect(),
        ),
    }
}

#[derive(Debug, Deserialize)]
struct WireResponse {
    #[serde(default)]
    id: String,
    model: Option<String>,
    choices: Vec<WireChoice>,
    usage: Option<WireUsage>,
    /// Perplexity attaches web-search citations
    citations: Option<Vec<String>>,
}

#[derive(Debug, Deserialize)]
struct WireChoice {
    message: WireChoiceMessage,
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WireChoiceMessage {
    content: Option<String>,
    tool_calls: Option<Vec<WireToolCall>>,
}

#[derive(Debug, Deserialize)]
struct WireToolCall {
    id: String,
    function: WireFunction,
}

#[derive(Debug, Deserialize)]
struct WireFunction {
    name: String,
    arguments: String,
}

#[derive(Debug, Clone, Copy, Deserialize)]
struct WireUsage {
    prompt_tokens: u32,
    completion_tokens: u32,
}

#[derive(Debug, Deserialize)]
struct WireStreamChunk {
    choices: Vec<WireStreamChoice>,
    usage: Option<WireUsage>,
}

#[derive(Debug, Deserialize)]
struct WireStreamChoice {
    #[serde(default)]
    index: u32,
    delta: WireDelta,
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WireDelta {
    content: Option<String>,
    tool_calls: Option<Vec<WireToolCallDelta>>,
}

#[derive(Debug, Deserialize)]
struct WireToolCallDelta {
    #[serde(default)]
    index: u32,
    id: Option<String>,
    function: Option<WireFunctionDelta>,
}

#[derive(Debug, Deserialize)]
struct WireFunctionDelta {
    name: Option<String>,
    arguments: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WireError {
    error: WireErrorDetail,
}

#[derive(Debug, Deserialize)]
struct WireErrorDetail {
    message: String,
    #[serde(rename = "type")]
    kind: Option<String>,
    code: Option<String>,
}

pub(crate) fn map_finish_reason(reason: Option<&str>) -> FinishReason {
    match reason {
        Some("length") | Some("max_tokens") => FinishReason::Length,
        Some("tool_calls") | Some("function_call") | Some("tool_use") => FinishReason::ToolUse,
        Some("content_filter") => FinishReason::Safety,
        _ => FinishReason::Stop,
    }
}

/// Classify an error body in the OpenAI wire shape into the taxonomy
fn classify_error(status: u16, body: &str) -> RouterError {
    if let Ok(wire) = serde_json::from_str::<WireError>(body) {
        let message = wire.error.message;
        let tag = wire
            .error
            .code
            .or(wire.error.kind)
            .unwrap_or_default()
            .to_ascii_lowercase();
        if tag.contains("content_policy") || tag.contains("content_filter") {
            return RouterError::SafetyBlocked(message);
        }
        return RouterError::from_provider_status(status, &message);
    }
    RouterError::from_provider_status(status, body)
}

/// Adapter for every OpenAI-compatible family
pub struct OpenAiCompatibleAdapter {
    family: ProviderFamily,
    base_url: String,
    http: Client,
}

impl OpenAiCompatibleAdapter {
    pub fn new(family: ProviderFamily, base_url: impl Into<String>) -> Self {
        Self {
            family,
            base_url: base_url.into(),
            http: Client::new(),
        }
    }

    pub fn openai() -> Self {
        Self::for_family(ProviderFamily::OpenAi)
    }

    pub fn for_family(family: ProviderFamily) -> Self {
        Self::new(family, default_base_url(family))
    }

    fn headers(&self, api_key: &str) -> RouterResult<HeaderMap> {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        headers.insert(
            "Authorization",
            HeaderValue::from_str(&format!("Bearer {}", api_key))
                .map_err(|e| RouterError::Auth(format!("invalid API key format: {}", e)))?,
        );
        Ok(headers)
    }

    fn build_body(
        &self,
        messages: &[ChatMessage],
        options: &RequestOptions,
        model_id: &str,
        stream: bool,
    ) -> WireRequest {
        let wire_messages = messages
            .iter()
            .map(|m| WireMessage {
                role: wire_role(m.role),
                content: wire_content(&m.content),
                name: m.name.clone(),
            })
            .collect();

        let tools = options.tools.as_ref().map(|tools| {
            tools
                .iter()
                .map(|t| {
                    serde_json::json!({
                        "type": "function",
                        "function": {
                            "name": t.name,
                            "description": t.description,
                            "parameters": t.parameters,
                        }
                    })
                })
                .collect()
        });
        let tool_choice = options.tool_choice.as_ref().map(|choice| match choice {
            ToolChoice::Auto => Value::String("auto".into()),
            ToolChoice::None => Value::String("none".into()),
            ToolChoice::Named { name } => {
                serde_json::json!({"type": "function", "function": {"name": name}})
            }
        });
        let response_format = options.response_format.map(|format| match format {
            ResponseFormat::Json => serde_json::json!({"type": "json_object"}),
            ResponseFormat::Text => serde_json::json!({"type": "text"}),
        });

        WireRequest {
            model: model_id.to_string(),
            messages: wire_messages,
            max_tokens: options.max_tokens,
            temperature: options.temperature,
            top_p: options.top_p,
            frequency_penalty: options.frequency_penalty,
            presence_penalty: options.presence_penalty,
            stop: options.stop_sequences.clone(),
            seed: options.seed,
            stream: stream.then_some(true),
            response_format,
            tools,
            tool_choice,
            safe_prompt: (self.family == ProviderFamily::Mistral).then_some(true),
            search_recency_filter: None,
        }
    }

    fn timeout(&self, options: &RequestOptions) -> Duration {
        options
            .timeout_ms
            .map(Duration::from_millis)
            .unwrap_or(DEFAULT_TIMEOUT)
    }

    async fn post_completions(
        &self,
        request: &AdapterRequest,
        model_id: &str,
        stream: bool,
    ) -> RouterResult<reqwest::Response> {
        let body = self.build_body(&request.messages, &request.options, model_id, stream);
        let url = format!("{}/chat/completions", self.base_url);
        debug!("{} request: {} model={}", self.family, url, model_id);

        let response = self
            .http
            .post(&url)
            .headers(self.headers(&request.api_key)?)
            .json(&body)
            .timeout(self.timeout(&request.options))
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    RouterError::UpstreamTransient(format!("{} timed out: {}", self.family, e))
                } else {
                    RouterError::UpstreamTransient(e.to_string())
                }
            })?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let text = response
                .text()
                .await
                .unwrap_or_else(|_| "unknown error".to_string());
            error!("{} API error {}: {}", self.family, status, text);
            return Err(classify_error(status, &text));
        }
        Ok(response)
    }
}

#[async_trait]
impl ProviderAdapter for OpenAiCompatibleAdapter {
    fn family(&self) -> ProviderFamily {
        self.family
    }

    fn info(&self) -> AdapterInfo {
        let mut features = vec!["chat".into(), "streaming".into(), "tools".into()];
        if self.family == ProviderFamily::OpenAi {
            features.push("embeddings".into());
        }
        if self.family == ProviderFamily::Perplexity {
            features.push("web-search".into());
        }
        AdapterInfo {
            name: self.family.to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            features,
            pricing_table_hash: pricing_table_hash(&catalog(self.family)),
            status: "ready".into(),
        }
    }

    async fn load(&self, model_id: &str, options: &LoadOptions) -> RouterResult<ModelDescriptor> {
        let entry = catalog(self.family)
            .iter()
            .find(|e| e.model_id == model_id);

        let mut descriptor = match entry {
            Some(entry) => entry.descriptor(self.family),
            // Marketplace families accept ids outside the static catalog
            None if matches!(
                self.family,
                ProviderFamily::OpenRouter | ProviderFamily::Novita
            ) =>
            {
                ModelDescriptor::new(self.family, model_id)
            }
            None => {
                return Err(RouterError::NotFound(format!(
                    "{} has no model {}",
                    self.family, model_id
                )))
            }
        };

        if options.probe {
            let key = options.api_key.clone().unwrap_or_default();
            if !self.health_probe(&key).await? {
                descriptor.status = ModelStatus::Errored;
                return Err(RouterError::Auth(format!(
                    "{} rejected the probe request",
                    self.family
                )));
            }
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
        let response = self
            .post_completions(request, &descriptor.model_id, false)
            .await?;
        let wire: WireResponse = response
            .json()
            .await
            .map_err(|e| RouterError::UpstreamPermanent(format!("malformed response: {}", e)))?;
        let latency_ms = started.elapsed().as_millis() as u64;

        let choice = wire
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| RouterError::UpstreamPermanent("response carried no choices".into()))?;

        let text = choice.message.content.unwrap_or_default();
        let usage = match wire.usage {
            Some(u) => TokenUsage::new(u.prompt_tokens, u.completion_tokens),
            None => TokenUsage::new(
                crate::types::estimate_tokens(
                    &request
                        .messages
                        .iter()
                        .map(|m| m.content.as_text())
                        .collect::<Vec<_>>()
                        .join("\n"),
                ),
                crate::types::estimate_tokens(&text),
            ),
        };

        let tool_calls = choice.message.tool_calls.map(|calls| {
            calls
                .into_iter()
                .map(|c| ToolCall {
                    id: c.id,
                    name: c.function.name,
                    arguments: c.function.arguments,
                })
                .collect()
        });

        let mut metadata = HashMap::new();
        metadata.insert("response_id".to_string(), Value::String(wire.id));
        if let Some(citations) = wire.citations {
            metadata.insert(
                "citations".to_string(),
                serde_json::to_value(citations).unwrap_or(Value::Null),
            );
        }

        Ok(Response {
            text,
            usage,
            cost: descriptor.pricing.cost_for(&usage),
            latency_ms,
            model: wire.model.unwrap_or_else(|| descriptor.model_id.clone()),
            provider: self.family.to_string(),
            finish_reason: map_finish_reason(choice.finish_reason.as_deref()),
            tool_calls,
            cached: false,
            metadata,
        })
    }

    async fn stream(
        &self,
        request: &AdapterRequest,
        descriptor: &ModelDescriptor,
    ) -> RouterResult<ChunkStream> {
        let response = self
            .post_completions(request, &descriptor.model_id, true)
            .await?;

        // Shared tail state so the terminal chunk carries usage totals and
        // is emitted exactly once, sentinel or not.
        struct Tail {
            usage: Option<TokenUsage>,
            finish: Option<FinishReason>,
            done_emitted: bool,
        }
        let tail = Arc::new(Mutex::new(Tail {
            usage: None,
            finish: None,
            done_emitted: false,
        }));

        let body = {
            let tail = Arc::clone(&tail);
            sse_event_stream(response).filter_map(move |event| {
                let tail = Arc::clone(&tail);
                async move {
                    let event = match event {
                        Ok(event) => event,
                        Err(e) => return Some(Err(e)),
                    };
                    let mut state = tail.lock().expect("stream state");
                    if state.done_emitted {
                        return None;
                    }
                    if event.is_done_sentinel() {
                        state.done_emitted = true;
                        return Some(Ok(StreamChunk::done(state.usage, state.finish)));
                    }
                    if event.data.trim().is_empty() {
                        return None;
                    }
                    let chunk: WireStreamChunk = match serde_json::from_str(&event.data) {
                        Ok(chunk) => chunk,
                        Err(e) => {
                            return Some(Err(RouterError::UpstreamPermanent(format!(
                                "malformed stream chunk: {}",
                                e
                            ))))
                        }
                    };
                    if let Some(u) = chunk.usage {
                        state.usage = Some(TokenUsage::new(u.prompt_tokens, u.completion_tokens));
                    }
                    let choice = chunk.choices.into_iter().next()?;
                    if let Some(reason) = choice.finish_reason.as_deref() {
                        state.finish = Some(map_finish_reason(Some(reason)));
                    }
                    let tool_delta = choice.delta.tool_calls.and_then(|mut calls| {
                        calls.drain(..).next().map(|c| ToolCallDelta {
                            index: c.index,
                            id: c.id,
                            name: c.function.as_ref().and_then(|f| f.name.clone()),
                            arguments: c.function.and_then(|f| f.arguments),
                        })
                    });
                    let delta = choice.delta.content.unwrap_or_default();
                    if delta.is_empty() && tool_delta.is_none() {
                        return None;
                    }
                    Some(Ok(StreamChunk {
                        delta: (!delta.is_empty()).then_some(delta),
                        tool_delta,
                        index: choice.index,
                        done: false,
                        usage: None,
                        finish_reason: None,
                        error: None,
                    }))
                }
            })
        };

        // If the upstream closes without a sentinel, still finish cleanly
        let epilogue = futures::stream::once({
            let tail = Arc::clone(&tail);
            async move {
                let mut state = tail.lock().expect("stream state");
                if state.done_emitted {
                    None
                } else {
                    state.done_emitted = true;
                    Some(Ok(StreamChunk::done(state.usage, state.finish)))
                }
            }
        })
        .filter_map(|x| async move { x });

        Ok(Box::pin(body.chain(epilogue)))
    }

    async fn list_models(&self) -> RouterResult<Vec<ModelSummary>> {
        Ok(catalog(self.family)
            .iter()
            .map(|entry| ModelSummary {
                id: entry.model_id.to_string(),
                provider: self.family.to_string(),
                context_tokens: Some(entry.context_tokens),
                description: None,
            })
            .collect())
    }

    async fn health_probe(&self, api_key: &str) -> RouterResult<bool> {
        let url = format!("{}/models", self.base_url);
        let response = self
            .http
            .get(&url)
            .headers(self.headers(api_key)?)
            .timeout(Duration::from_secs(10))
            .send()
            .await
            .map_err(|e| RouterError::UpstreamTransient(e.to_string()))?;
        Ok(response.status().is_success())
    }

    async fn embed(&self, request: &EmbeddingRequest) -> RouterResult<EmbeddingResponse> {
        if self.family != ProviderFamily::OpenAi {
            return Err(RouterError::UpstreamPermanent(format!(
                "{} adapter does not support embeddings",
                self.family
            )));
        }

        #[derive(Deserialize)]
        struct EmbedWire {
            data: Vec<EmbedDatum>,
            usage: WireUsage,
        }
        #[derive(Deserialize)]
        struct EmbedDatum {
            embedding: Vec<f32>,
        }

        let url = format!("{}/embeddings", self.base_url);
        let body = serde_json::json!({
            "model": "text-embedding-3-small",
            "input": request.inputs,
        });
        let response = self
            .http
            .post(&url)
            .headers(self.headers(&request.api_key)?)
            .json(&body)
            .timeout(DEFAULT_TIMEOUT)
            .send()
            .await
            .map_err(|e| RouterError::UpstreamTransient(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let text = response.text().await.unwrap_or_default();
            return Err(classify_error(status, &text));
        }

        let wire: EmbedWire = response
            .json()
            .await
            .map_err(|e| RouterError::UpstreamPermanent(format!("malformed embeddings: {}", e)))?;
        let usage = TokenUsage::new(wire.usage.prompt_tokens, 0);
        Ok(EmbeddingResponse {
            vectors: wire.data.into_iter().map(|d| d.embedding).collect(),
            usage,
            // text-embedding-3-small list price
            cost: usage.prompt_tokens as f64 * 0.02 / 1_000_000.0,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ToolSchema;

    fn adapter() -> OpenAiCompatibleAdapter {
        OpenAiCompatibleAdapter::openai()
    }

    #[test]
    fn test_body_includes_sampling_options() {
        let adapter = adapter();
        let mut options = RequestOptions::default();
        options.max_tokens = Some(128);
        options.temperature = Some(0.7);
        options.stop_sequences = Some(vec!["END".into()]);
        let body = adapter.build_body(
            &[ChatMessage::user("Hello")],
            &options,
            "gpt-4o",
            false,
        );

        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json["model"], "gpt-4o");
        assert_eq!(json["max_tokens"], 128);
        assert_eq!(json["stop"][0], "END");
        assert!(json.get("stream").is_none());
        assert!(json.get("safe_prompt").is_none());
    }

    #[test]
    fn test_stream_flag_set_for_streaming() {
        let adapter = adapter();
        let body = adapter.build_body(
            &[ChatMessage::user("Hello")],
            &RequestOptions::default(),
            "gpt-4o",
            true,
        );
        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json["stream"], true);
    }

    #[test]
    fn test_mistral_safe_prompt_honored() {
        let adapter = OpenAiCompatibleAdapter::for_family(ProviderFamily::Mistral);
        let body = adapter.build_body(
            &[ChatMessage::user("Hello")],
            &RequestOptions::default(),
            "mistral-small-latest",
            false,
        );
        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json["safe_prompt"], true);
    }

    #[test]
    fn test_tools_serialized_in_openai_shape() {
        let adapter = adapter();
        let mut options = RequestOptions::default();
        options.tools = Some(vec![ToolSchema {
            name: "get_weather".into(),
            description: "Look up the weather".into(),
            parameters: serde_json::json!({"type": "object", "properties": {}}),
        }]);
        options.tool_choice = Some(ToolChoice::Named {
            name: "get_weather".into(),
        });
        options.response_format = Some(ResponseFormat::Json);

        let body = adapter.build_body(
            &[ChatMessage::user("weather?")],
            &options,
            "gpt-4o",
            false,
        );
        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json["tools"][0]["type"], "function");
        assert_eq!(json["tools"][0]["function"]["name"], "get_weather");
        assert_eq!(json["tool_choice"]["function"]["name"], "get_weather");
        assert_eq!(json["response_format"]["type"], "json_object");
    }

    #[test]
    fn test_multipart_content_wire_shape() {
        let content = MessageContent::Parts(vec![
            ContentPart::Text {
                text: "describe".into(),
            },
            ContentPart::ImageUrl {
                url: "https://example.com/x.png".into(),
            },
        ]);
        let wire = wire_content(&content);
        assert_eq!(wire[0]["type"], "text");
        assert_eq!(wire[1]["image_url"]["url"], "https://example.com/x.png");
    }

    #[test]
    fn test_finish_reason_mapping() {
        assert_eq!(map_finish_reason(Some("stop")), FinishReason::Stop);
        assert_eq!(map_finish_reason(Some("length")), FinishReason::Length);
        assert_eq!(map_finish_reason(Some("tool_calls")), FinishReason::ToolUse);
        assert_eq!(
            map_finish_reason(Some("content_filter")),
            FinishReason::Safety
        );
        assert_eq!(map_finish_reason(None), FinishReason::Stop);
    }

    #[test]
    fn test_error_classification() {
        let body = r#"{"error": {"message": "bad key", "type": "invalid_request_error", "code": "invalid_api_key"}}"#;
        assert!(matches!(classify_error(401, body), RouterError::Auth(_)));

        let policy = r#"{"error": {"message": "refused", "type": "invalid_request_error", "code": "content_policy_violation"}}"#;
        assert!(matches!(
            classify_error(400, policy),
            RouterError::SafetyBlocked(_)
        ));

        assert!(matches!(
            classify_error(503, "upstream exploded"),
            RouterError::UpstreamTransient(_)
        ));
    }

    #[tokio::test]
    async fn test_load_from_catalog() {
        let adapter = adapter();
        let descriptor = adapter
            .load("gpt-4o-mini", &LoadOptions::default())
            .await
            .unwrap();
        assert_eq!(descriptor.id, "openai:gpt-4o-mini");
        assert_eq!(descriptor.limits.context_tokens, 128_000);
        assert!(descriptor.pricing.input_per_mtok > 0.0);
        assert_eq!(descriptor.status, ModelStatus::Ready);
    }

    #[tokio::test]
    async fn test_load_unknown_model_rejected() {
        let adapter = adapter();
        assert!(matches!(
            adapter.load("made-up-model", &LoadOptions::default()).await,
            Err(RouterError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_marketplace_families_accept_unknown_ids() {
        let adapter = OpenAiCompatibleAdapter::for_family(ProviderFamily::OpenRouter);
        let descriptor = adapter
            .load("some-lab/new-model", &LoadOptions::default())
            .await
            .unwrap();
        assert_eq!(descriptor.model_id, "some-lab/new-model");
    }

    #[tokio::test]
    async fn test_list_models_static_catalog() {
        let adapter = adapter();
        let models = adapter.list_models().await.unwrap();
        assert!(models.iter().any(|m| m.id == "gpt-4o"));
    }

    #[test]
    fn test_info_pricing_hash_stable() {
        let a = adapter().info();
        let b = adapter().info();
        assert_eq!(a.pricing_table_hash, b.pricing_table_hash);
        let groq = OpenAiCompatibleAdapter::for_family(ProviderFamily::Groq).info();
        assert_ne!(a.pricing_table_hash, groq.pricing_table_hash);
    }
}
