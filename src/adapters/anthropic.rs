//! Anthropic provider adapter
//!
//! Speaks the `/v1/messages` protocol: `x-api-key` plus `anthropic-version`
//! headers, system prompt lifted out of the message list, and event-typed
//! SSE streaming (`content_block_delta`, `message_delta`, `message_stop`).

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
    Capability, ChatMessage, FinishReason, MessageContent, MessageRole, RequestOptions, Response,
    StreamChunk, TokenUsage, ToolCall, ToolCallDelta, ToolChoice,
};

use super::{
    pricing_table_hash, AdapterInfo, AdapterRequest, ChunkStream, LoadOptions, ModelSummary,
    ProviderAdapter, ProviderFamily,
};

const DEFAULT_BASE_URL: &str = "https://api.anthropic.com";
const API_VERSION: &str = "2023-06-01";
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);
/// Anthropic requires max_tokens; applied when the request leaves it unset
const FALLBACK_MAX_TOKENS: u32 = 1024;

#[derive(Debug, Clone, Serialize)]
struct CatalogEntry {
    model_id: &'static str,
    context_tokens: u32,
    max_output_tokens: u32,
    input_per_mtok: f64,
    output_per_mtok: f64,
    quality: f64,
}

const CATALOG: [CatalogEntry; 3] = [
    CatalogEntry {
        model_id: "claude-3-5-sonnet-latest",
        context_tokens: 200_000,
        max_output_tokens: 8_192,
        input_per_mtok: 3.0,
        output_per_mtok: 15.0,
        quality: 0.92,
    },
    CatalogEntry {
        model_id: "claude-3-5-haiku-latest",
        context_tokens: 200_000,
        max_output_tokens: 8_192,
        input_per_mtok: 0.8,
        output_per_mtok: 4.0,
        quality: 0.78,
    },
    CatalogEntry {
        model_id: "claude-3-opus-latest",
        context_tokens: 200_000,
        max_output_tokens: 4_096,
        input_per_mtok: 15.0,
        output_per_mtok: 75.0,
        quality: 0.95,
    },
];

#[derive(Debug, Serialize)]
struct WireRequest {
    model: String,
    messages: Vec<WireMessage>,
    max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_p: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_k: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stop_sequences: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stream: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<Vec<Value>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_choice: Option<Value>,
}

#[derive(Debug, Serialize)]
struct WireMessage {
    role: &'static str,
    content: String,
}

#[derive(Debug, Deserialize)]
struct WireResponse {
    id: String,
    model: String,
    content: Vec<WireContentBlock>,
    stop_reason: Option<String>,
    usage: WireUsage,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
enum WireContentBlock {
    #[serde(rename = "text")]
    Text { text: String },
    #[serde(rename = "tool_use")]
    ToolUse {
        id: String,
        name: String,
        input: Value,
    },
}

#[derive(Debug, Deserialize)]
struct WireUsage {
    input_tokens: Option<u32>,
    output_tokens: Option<u32>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
enum StreamEvent {
    #[serde(rename = "ping")]
    Ping,
    #[serde(rename = "message_start")]
    MessageStart { message: MessageStart },
    #[serde(rename = "content_block_start")]
    ContentBlockStart {
        index: u32,
        content_block: StartBlock,
    },
    #[serde(rename = "content_block_delta")]
    ContentBlockDelta { index: u32, delta: Delta },
    #[serde(rename = "content_block_stop")]
    ContentBlockStop {},
    #[serde(rename = "message_delta")]
    MessageDelta {
        delta: MessageDelta,
        usage: Option<WireUsage>,
    },
    #[serde(rename = "message_stop")]
    MessageStop,
    #[serde(rename = "error")]
    Error { error: StreamError },
}

#[derive(Debug, Deserialize)]
struct MessageStart {
    usage: WireUsage,
}

#[derive(Debug, Deserialize)]
struct StartBlock {
    #[serde(rename = "type")]
    kind: String,
    id: Option<String>,
    name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Delta {
    #[serde(rename = "type")]
    kind: String,
    text: Option<String>,
    partial_json: Option<String>,
}

#[derive(Debug, Deserialize)]
struct MessageDelta {
    stop_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct StreamError {
    message: String,
}

#[derive(Debug, Deserialize)]
struct WireError {
    error: WireErrorDetail,
}

#[derive(Debug, Deserialize)]
struct WireErrorDetail {
    #[serde(rename = "type")]
    kind: String,
    message: String,
}

fn map_stop_reason(reason: Option<&str>) -> FinishReason {
    match reason {
        Some("max_tokens") => FinishReason::Length,
        Some("tool_use") => FinishReason::ToolUse,
        Some("refusal") => FinishReason::Safety,
        _ => FinishReason::Stop,
    }
}

fn classify_error(status: u16, body: &str) -> RouterError {
    if let Ok(wire) = serde_json::from_str::<WireError>(body) {
        match wire.error.kind.as_str() {
            "authentication_error" | "permission_error" => RouterError::Auth(wire.error.message),
            "rate_limit_error" => RouterError::RateLimited {
                message: wire.error.message,
                retry_after_ms: 0,
            },
            "overloaded_error" => RouterError::UpstreamTransient(wire.error.message),
            _ => RouterError::from_provider_status(status, &wire.error.message),
        }
    } else {
        RouterError::from_provider_status(status, body)
    }
}

/// Adapter for Anthropic's messages API
pub struct AnthropicAdapter {
    base_url: String,
    http: Client,
}

impl AnthropicAdapter {
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
            "x-api-key",
            HeaderValue::from_str(api_key)
                .map_err(|e| RouterError::Auth(format!("invalid API key format: {}", e)))?,
        );
        headers.insert("anthropic-version", HeaderValue::from_static(API_VERSION));
        Ok(headers)
    }

    /// System turns lift into the top-level `system` field; everything else
    /// flattens to alternating user/assistant text.
    fn build_body(
        &self,
        messages: &[ChatMessage],
        options: &RequestOptions,
        model_id: &str,
        stream: bool,
    ) -> WireRequest {
        let mut system = None;
        let mut wire_messages = Vec::new();
        for message in messages {
            match message.role {
                MessageRole::System => {
                    system = Some(message.content.as_text());
                }
                MessageRole::Assistant => wire_messages.push(WireMessage {
                    role: "assistant",
                    content: message.content.as_text(),
                }),
                _ => wire_messages.push(WireMessage {
                    role: "user",
                    content: message.content.as_text(),
                }),
            }
        }

        let tools = options.tools.as_ref().map(|tools| {
            tools
                .iter()
                .map(|t| {
                    serde_json::json!({
                        "name": t.name,
                        "description": t.description,
                        "input_schema": t.parameters,
                    })
                })
                .collect()
        });
        let tool_choice = options.tool_choice.as_ref().map(|choice| match choice {
            ToolChoice::Auto => serde_json::json!({"type": "auto"}),
            ToolChoice::None => serde_json::json!({"type": "none"}),
            ToolChoice::Named { name } => serde_json::json!({"type": "tool", "name": name}),
        });

        WireRequest {
            model: model_id.to_string(),
            messages: wire_messages,
            max_tokens: options.max_tokens.unwrap_or(FALLBACK_MAX_TOKENS),
            system,
            temperature: options.temperature,
            top_p: options.top_p,
            top_k: options.top_k,
            stop_sequences: options.stop_sequences.clone(),
            stream: stream.then_some(true),
            tools,
            tool_choice,
        }
    }

    async fn post_messages(
        &self,
        request: &AdapterRequest,
        model_id: &str,
        stream: bool,
    ) -> RouterResult<reqwest::Response> {
        let body = self.build_body(&request.messages, &request.options, model_id, stream);
        let url = format!("{}/v1/messages", self.base_url);
        debug!("anthropic request: {} model={}", url, model_id);

        let timeout = request
            .options
            .timeout_ms
            .map(Duration::from_millis)
            .unwrap_or(DEFAULT_TIMEOUT);
        let response = self
            .http
            .post(&url)
            .headers(self.headers(&request.api_key)?)
            .json(&body)
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| RouterError::UpstreamTransient(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let text = response.text().await.unwrap_or_default();
            error!("anthropic API error {}: {}", status, text);
            return Err(classify_error(status, &text));
        }
        Ok(response)
    }
}

impl Default for AnthropicAdapter {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ProviderAdapter for AnthropicAdapter {
    fn family(&self) -> ProviderFamily {
        ProviderFamily::Anthropic
    }

    fn info(&self) -> AdapterInfo {
        AdapterInfo {
            name: "anthropic".into(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            features: vec!["chat".into(), "streaming".into(), "tools".into()],
            pricing_table_hash: pricing_table_hash(&CATALOG),
            status: "ready".into(),
        }
    }

    async fn load(&self, model_id: &str, options: &LoadOptions) -> RouterResult<ModelDescriptor> {
        let entry = CATALOG
            .iter()
            .find(|e| e.model_id == model_id)
            .ok_or_else(|| {
                RouterError::NotFound(format!("anthropic has no model {}", model_id))
            })?;

        let mut descriptor = ModelDescriptor::new(ProviderFamily::Anthropic, entry.model_id)
            .with_limits(ModelLimits {
                context_tokens: entry.context_tokens,
                max_output_tokens: entry.max_output_tokens,
            })
            .with_pricing(Pricing::new(entry.input_per_mtok, entry.output_per_mtok))
            .with_quality(entry.quality)
            .with_capabilities([
                Capability::ToolUse,
                Capability::FunctionCalling,
                Capability::Vision,
            ]);

        if options.probe {
            let key = options.api_key.clone().unwrap_or_default();
            if !self.health_probe(&key).await? {
                descriptor.status = ModelStatus::Errored;
                return Err(RouterError::Auth("anthropic rejected the probe".into()));
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
            .post_messages(request, &descriptor.model_id, false)
            .await?;
        let wire: WireResponse = response
            .json()
            .await
            .map_err(|e| RouterError::UpstreamPermanent(format!("malformed response: {}", e)))?;
        let latency_ms = started.elapsed().as_millis() as u64;

        let mut text = String::new();
        let mut tool_calls = Vec::new();
        for block in wire.content {
            match block {
                WireContentBlock::Text { text: t } => text.push_str(&t),
                WireContentBlock::ToolUse { id, name, input } => tool_calls.push(ToolCall {
                    id,
                    name,
                    arguments: input.to_string(),
                }),
            }
        }

        let usage = TokenUsage::new(
            wire.usage.input_tokens.unwrap_or(0),
            wire.usage.output_tokens.unwrap_or(0),
        );
        let mut metadata = HashMap::new();
        metadata.insert("response_id".to_string(), Value::String(wire.id));

        Ok(Response {
            text,
            usage,
            cost: descriptor.pricing.cost_for(&usage),
            latency_ms,
            model: wire.model,
            provider: "anthropic".into(),
            finish_reason: map_stop_reason(wire.stop_reason.as_deref()),
            tool_calls: (!tool_calls.is_empty()).then_some(tool_calls),
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
            .post_messages(request, &descriptor.model_id, true)
            .await?;

        struct Tail {
            input_tokens: u32,
            output_tokens: u32,
            finish: Option<FinishReason>,
            done_emitted: bool,
        }
        let tail = Arc::new(Mutex::new(Tail {
            input_tokens: 0,
            output_tokens: 0,
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
                    if event.data.trim().is_empty() {
                        return None;
                    }
                    let parsed: StreamEvent = match serde_json::from_str(&event.data) {
                        Ok(parsed) => parsed,
                        Err(e) => {
                            return Some(Err(RouterError::UpstreamPermanent(format!(
                                "malformed stream event: {}",
                                e
                            ))))
                        }
                    };
                    let mut state = tail.lock().expect("stream state");
                    if state.done_emitted {
                        return None;
                    }
                    match parsed {
                        StreamEvent::Ping
                        | StreamEvent::ContentBlockStop {}
                        | StreamEvent::ContentBlockStart {
                            content_block: StartBlock { id: None, .. },
                            ..
                        } => None,
                        StreamEvent::ContentBlockStart {
                            index,
                            content_block,
                        } if content_block.kind == "tool_use" => Some(Ok(StreamChunk {
                            tool_delta: Some(ToolCallDelta {
                                index,
                                id: content_block.id,
                                name: content_block.name,
                                arguments: None,
                            }),
                            index,
                            ..Default::default()
                        })),
                        StreamEvent::ContentBlockStart { .. } => None,
                        StreamEvent::MessageStart { message } => {
                            state.input_tokens = message.usage.input_tokens.unwrap_or(0);
                            None
                        }
                        StreamEvent::ContentBlockDelta { index, delta } => {
                            if delta.kind == "input_json_delta" {
                                return delta.partial_json.map(|json| {
                                    Ok(StreamChunk {
                                        tool_delta: Some(ToolCallDelta {
                                            index,
                                            id: None,
                                            name: None,
                                            arguments: Some(json),
                                        }),
                                        index,
                                        ..Default::default()
                                    })
                                });
                            }
                            delta
                                .text
                                .filter(|t| !t.is_empty())
                                .map(|t| Ok(StreamChunk::delta(t, index)))
                        }
                        StreamEvent::MessageDelta { delta, usage } => {
                            if let Some(usage) = usage {
                                if let Some(out) = usage.output_tokens {
                                    state.output_tokens = out;
                                }
                            }
                            if let Some(reason) = delta.stop_reason.as_deref() {
                                state.finish = Some(map_stop_reason(Some(reason)));
                            }
                            None
                        }
                        StreamEvent::MessageStop => {
                            state.done_emitted = true;
                            let usage =
                                TokenUsage::new(state.input_tokens, state.output_tokens);
                            Some(Ok(StreamChunk::done(Some(usage), state.finish)))
                        }
                        StreamEvent::Error { error } => Some(Err(
                            RouterError::UpstreamTransient(format!(
                                "anthropic stream error: {}",
                                error.message
                            )),
                        )),
                    }
                }
            })
        };

        let epilogue = futures::stream::once({
            let tail = Arc::clone(&tail);
            async move {
                let mut state = tail.lock().expect("stream state");
                if state.done_emitted {
                    None
                } else {
                    state.done_emitted = true;
                    let usage = TokenUsage::new(state.input_tokens, state.output_tokens);
                    Some(Ok(StreamChunk::done(Some(usage), state.finish)))
                }
            }
        })
        .filter_map(|x| async move { x });

        Ok(Box::pin(body.chain(epilogue)))
    }

    async fn list_models(&self) -> RouterResult<Vec<ModelSummary>> {
        Ok(CATALOG
            .iter()
            .map(|entry| ModelSummary {
                id: entry.model_id.to_string(),
                provider: "anthropic".into(),
                context_tokens: Some(entry.context_tokens),
                description: None,
            })
            .collect())
    }

    async fn health_probe(&self, api_key: &str) -> RouterResult<bool> {
        // Minimal paid-for probe: a one-token completion
        let url = format!("{}/v1/messages", self.base_url);
        let body = serde_json::json!({
            "model": CATALOG[1].model_id,
            "max_tokens": 1,
            "messages": [{"role": "user", "content": "ping"}],
        });
        let response = self
            .http
            .post(&url)
            .headers(self.headers(api_key)?)
            .json(&body)
            .timeout(Duration::from_secs(10))
            .send()
            .await
            .map_err(|e| RouterError::UpstreamTransient(e.to_string()))?;
        Ok(response.status().is_success())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_system_prompt_lifted() {
        let adapter = AnthropicAdapter::new();
        let messages = vec![
            ChatMessage::system("You are terse."),
            ChatMessage::user("Hi"),
            ChatMessage::assistant("Hello."),
            ChatMessage::user("Bye"),
        ];
        let body = adapter.build_body(
            &messages,
            &RequestOptions::default(),
            "claude-3-5-sonnet-latest",
            false,
        );
        assert_eq!(body.system.as_deref(), Some("You are terse."));
        assert_eq!(body.messages.len(), 3);
        assert_eq!(body.messages[0].role, "user");
        assert_eq!(body.messages[1].role, "assistant");
    }

    #[test]
    fn test_max_tokens_always_present() {
        let adapter = AnthropicAdapter::new();
        let body = adapter.build_body(
            &[ChatMessage::user("Hi")],
            &RequestOptions::default(),
            "claude-3-5-haiku-latest",
            false,
        );
        assert_eq!(body.max_tokens, FALLBACK_MAX_TOKENS);

        let mut options = RequestOptions::default();
        options.max_tokens = Some(512);
        let body = adapter.build_body(
            &[ChatMessage::user("Hi")],
            &options,
            "claude-3-5-haiku-latest",
            false,
        );
        assert_eq!(body.max_tokens, 512);
    }

    #[test]
    fn test_tools_serialized_with_input_schema() {
        let adapter = AnthropicAdapter::new();
        let mut options = RequestOptions::default();
        options.tools = Some(vec![crate::types::ToolSchema {
            name: "lookup".into(),
            description: "find things".into(),
            parameters: serde_json::json!({"type": "object"}),
        }]);
        let body = adapter.build_body(
            &[ChatMessage::user("Hi")],
            &options,
            "claude-3-5-sonnet-latest",
            false,
        );
        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json["tools"][0]["name"], "lookup");
        assert!(json["tools"][0]["input_schema"].is_object());
    }

    #[test]
    fn test_stream_event_parsing() {
        let delta: StreamEvent = serde_json::from_str(
            r#"{"type":"content_block_delta","index":0,"delta":{"type":"text_delta","text":"Hello"}}"#,
        )
        .unwrap();
        match delta {
            StreamEvent::ContentBlockDelta { delta, .. } => {
                assert_eq!(delta.text.as_deref(), Some("Hello"))
            }
            other => panic!("unexpected event {:?}", other),
        }

        let stop: StreamEvent = serde_json::from_str(
            r#"{"type":"message_delta","delta":{"stop_reason":"end_turn"},"usage":{"output_tokens":42}}"#,
        )
        .unwrap();
        match stop {
            StreamEvent::MessageDelta { delta, usage } => {
                assert_eq!(delta.stop_reason.as_deref(), Some("end_turn"));
                assert_eq!(usage.unwrap().output_tokens, Some(42));
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[test]
    fn test_stop_reason_mapping() {
        assert_eq!(map_stop_reason(Some("end_turn")), FinishReason::Stop);
        assert_eq!(map_stop_reason(Some("max_tokens")), FinishReason::Length);
        assert_eq!(map_stop_reason(Some("tool_use")), FinishReason::ToolUse);
        assert_eq!(map_stop_reason(Some("refusal")), FinishReason::Safety);
    }

    #[test]
    fn test_error_classification() {
        let auth = r#"{"error":{"type":"authentication_error","message":"bad key"}}"#;
        assert!(matches!(classify_error(401, auth), RouterError::Auth(_)));

        let overloaded = r#"{"error":{"type":"overloaded_error","message":"busy"}}"#;
        assert!(matches!(
            classify_error(529, overloaded),
            RouterError::UpstreamTransient(_)
        ));
    }

    #[tokio::test]
    async fn test_load_from_catalog() {
        let adapter = AnthropicAdapter::new();
        let descriptor = adapter
            .load("claude-3-5-sonnet-latest", &LoadOptions::default())
            .await
            .unwrap();
        assert_eq!(descriptor.id, "anthropic:claude-3-5-sonnet-latest");
        assert_eq!(descriptor.limits.context_tokens, 200_000);
        assert!(descriptor.capabilities.contains(&Capability::ToolUse));
    }

    #[tokio::test]
    async fn test_unknown_model_rejected() {
        let adapter = AnthropicAdapter::new();
        assert!(matches!(
            adapter.load("claude-9", &LoadOptions::default()).await,
            Err(RouterError::NotFound(_))
        ));
    }
}
