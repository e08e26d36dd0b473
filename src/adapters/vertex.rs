//! Google Vertex AI provider adapter
//!
//! Requests hit
//! `https://{region}-aiplatform.googleapis.com/v1/projects/{p}/locations/{l}/publishers/google/models/{m}:generateContent`
//! with an OAuth2 bearer token (the resolved credential is the access
//! token; minting it from a service account is the operator's concern).
//! Streaming uses `:streamGenerateContent?alt=sse`.

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
    Capability, ChatMessage, FinishReason, MessageRole, RequestOptions, Response, StreamChunk,
    TokenUsage,
};

use super::{
    pricing_table_hash, AdapterInfo, AdapterRequest, ChunkStream, LoadOptions, ModelSummary,
    ProviderAdapter, ProviderFamily,
};

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Serialize)]
struct CatalogEntry {
    model_id: &'static str,
    context_tokens: u32,
    input_per_mtok: f64,
    output_per_mtok: f64,
    quality: f64,
}

const CATALOG: [CatalogEntry; 2] = [
    CatalogEntry {
        model_id: "gemini-1.5-pro",
        context_tokens: 2_000_000,
        input_per_mtok: 1.25,
        output_per_mtok: 5.0,
        quality: 0.89,
    },
    CatalogEntry {
        model_id: "gemini-1.5-flash",
        context_tokens: 1_000_000,
        input_per_mtok: 0.075,
        output_per_mtok: 0.3,
        quality: 0.72,
    },
];

#[derive(Debug, Deserialize)]
struct WireResponse {
    candidates: Option<Vec<WireCandidate>>,
    #[serde(rename = "usageMetadata")]
    usage_metadata: Option<WireUsage>,
}

#[derive(Debug, Deserialize)]
struct WireCandidate {
    content: Option<WireContent>,
    #[serde(rename = "finishReason")]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WireContent {
    parts: Option<Vec<WirePart>>,
}

#[derive(Debug, Deserialize)]
struct WirePart {
    text: Option<String>,
}

#[derive(Debug, Clone, Copy, Deserialize)]
struct WireUsage {
    #[serde(rename = "promptTokenCount")]
    prompt_token_count: Option<u32>,
    #[serde(rename = "candidatesTokenCount")]
    candidates_token_count: Option<u32>,
}

fn map_finish_reason(reason: Option<&str>) -> FinishReason {
    match reason {
        Some("MAX_TOKENS") => FinishReason::Length,
        Some("SAFETY") | Some("PROHIBITED_CONTENT") => FinishReason::Safety,
        _ => FinishReason::Stop,
    }
}

fn candidate_text(candidate: &WireCandidate) -> String {
    candidate
        .content
        .as_ref()
        .and_then(|c| c.parts.as_ref())
        .map(|parts| {
            parts
                .iter()
                .filter_map(|p| p.text.as_deref())
                .collect::<String>()
        })
        .unwrap_or_default()
}

/// Adapter for Vertex-published Gemini models
pub struct VertexAdapter {
    project: String,
    location: String,
    http: Client,
}

impl VertexAdapter {
    pub fn new(project: impl Into<String>, location: impl Into<String>) -> Self {
        Self {
            project: project.into(),
            location: location.into(),
            http: Client::new(),
        }
    }

    /// Project and location from `VERTEX_PROJECT` / `VERTEX_LOCATION`
    pub fn from_env() -> RouterResult<Self> {
        let project = std::env::var("VERTEX_PROJECT")
            .map_err(|_| RouterError::Auth("VERTEX_PROJECT is not set".into()))?;
        let location =
            std::env::var("VERTEX_LOCATION").unwrap_or_else(|_| "us-central1".to_string());
        Ok(Self::new(project, location))
    }

    fn model_url(&self, model_id: &str, stream: bool) -> String {
        let verb = if stream {
            "streamGenerateContent?alt=sse"
        } else {
            "generateContent"
        };
        format!(
            "https://{loc}-aiplatform.googleapis.com/v1/projects/{p}/locations/{loc}/publishers/google/models/{m}:{verb}",
            loc = self.location,
            p = self.project,
            m = model_id,
            verb = verb,
        )
    }

    fn headers(&self, access_token: &str) -> RouterResult<HeaderMap> {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        headers.insert(
            "Authorization",
            HeaderValue::from_str(&format!("Bearer {}", access_token))
                .map_err(|e| RouterError::Auth(format!("invalid access token: {}", e)))?,
        );
        Ok(headers)
    }

    fn build_body(messages: &[ChatMessage], options: &RequestOptions) -> Value {
        let mut system_instruction = None;
        let mut contents = Vec::new();
        for message in messages {
            match message.role {
                MessageRole::System => {
                    system_instruction = Some(serde_json::json!({
                        "parts": [{"text": message.content.as_text()}]
                    }));
                }
                MessageRole::Assistant => contents.push(serde_json::json!({
                    "role": "model",
                    "parts": [{"text": message.content.as_text()}]
                })),
                _ => contents.push(serde_json::json!({
                    "role": "user",
                    "parts": [{"text": message.content.as_text()}]
                })),
            }
        }

        let mut generation_config = serde_json::Map::new();
        if let Some(v) = options.max_tokens {
            generation_config.insert("maxOutputTokens".into(), v.into());
        }
        if let Some(v) = options.temperature {
            generation_config.insert("temperature".into(), v.into());
        }
        if let Some(v) = options.top_p {
            generation_config.insert("topP".into(), v.into());
        }
        if let Some(v) = options.top_k {
            generation_config.insert("topK".into(), v.into());
        }
        if let Some(v) = &options.stop_sequences {
            generation_config.insert("stopSequences".into(), serde_json::json!(v));
        }

        let mut body = serde_json::json!({"contents": contents});
        if let Some(system) = system_instruction {
            body["systemInstruction"] = system;
        }
        if !generation_config.is_empty() {
            body["generationConfig"] = Value::Object(generation_config);
        }
        body
    }

    async fn post(
        &self,
        request: &AdapterRequest,
        model_id: &str,
        stream: bool,
    ) -> RouterResult<reqwest::Response> {
        let url = self.model_url(model_id, stream);
        debug!("vertex request: {}", url);
        let timeout = request
            .options
            .timeout_ms
            .map(Duration::from_millis)
            .unwrap_or(DEFAULT_TIMEOUT);
        let response = self
            .http
            .post(&url)
            .headers(self.headers(&request.api_key)?)
            .json(&Self::build_body(&request.messages, &request.options))
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| RouterError::UpstreamTransient(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let text = response.text().await.unwrap_or_default();
            error!("vertex API error {}: {}", status, text);
            return Err(RouterError::from_provider_status(status, &text));
        }
        Ok(response)
    }
}

#[async_trait]
impl ProviderAdapter for VertexAdapter {
    fn family(&self) -> ProviderFamily {
        ProviderFamily::Vertex
    }

    fn info(&self) -> AdapterInfo {
        AdapterInfo {
            name: "vertex".into(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            features: vec!["chat".into(), "streaming".into()],
            pricing_table_hash: pricing_table_hash(&CATALOG),
            status: "ready".into(),
        }
    }

    async fn load(&self, model_id: &str, _options: &LoadOptions) -> RouterResult<ModelDescriptor> {
        let entry = CATALOG
            .iter()
            .find(|e| e.model_id == model_id)
            .ok_or_else(|| RouterError::NotFound(format!("vertex has no model {}", model_id)))?;

        let mut descriptor = ModelDescriptor::new(ProviderFamily::Vertex, entry.model_id)
            .with_limits(ModelLimits {
                context_tokens: entry.context_tokens,
                max_output_tokens: 8192,
            })
            .with_pricing(Pricing::new(entry.input_per_mtok, entry.output_per_mtok))
            .with_quality(entry.quality)
            .with_capabilities([Capability::Vision, Capability::JsonMode]);
        descriptor.status = ModelStatus::Ready;
        Ok(descriptor)
    }

    async fn complete(
        &self,
        request: &AdapterRequest,
        descriptor: &ModelDescriptor,
    ) -> RouterResult<Response> {
        let started = Instant::now();
        let response = self.post(request, &descriptor.model_id, false).await?;
        let wire: WireResponse = response
            .json()
            .await
            .map_err(|e| RouterError::UpstreamPermanent(format!("malformed response: {}", e)))?;

        let candidate = wire
            .candidates
            .unwrap_or_default()
            .into_iter()
            .next()
            .ok_or_else(|| {
                RouterError::UpstreamPermanent("response carried no candidates".into())
            })?;
        let text = candidate_text(&candidate);
        let finish_reason = map_finish_reason(candidate.finish_reason.as_deref());

        let usage = wire
            .usage_metadata
            .map(|u| {
                TokenUsage::new(
                    u.prompt_token_count.unwrap_or(0),
                    u.candidates_token_count.unwrap_or(0),
                )
            })
            .unwrap_or_else(|| {
                TokenUsage::new(
                    crate::types::estimate_tokens(
                        &request
                            .messages
                            .iter()
                            .map(|m| m.content.as_text())
                            .collect::<Vec<_>>()
                            .join("\n"),
                    ),
                    crate::types::estimate_tokens(&text),
                )
            });

        Ok(Response {
            text,
            usage,
            cost: descriptor.pricing.cost_for(&usage),
            latency_ms: started.elapsed().as_millis() as u64,
            model: descriptor.model_id.clone(),
            provider: "vertex".into(),
            finish_reason,
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
        let response = self.post(request, &descriptor.model_id, true).await?;

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
                    if event.data.trim().is_empty() {
                        return None;
                    }
                    let chunk: WireResponse = match serde_json::from_str(&event.data) {
                        Ok(chunk) => chunk,
                        Err(e) => {
                            return Some(Err(RouterError::UpstreamPermanent(format!(
                                "malformed stream chunk: {}",
                                e
                            ))))
                        }
                    };
                    let mut state = tail.lock().expect("stream state");
                    if state.done_emitted {
                        return None;
                    }
                    if let Some(u) = chunk.usage_metadata {
                        state.usage = Some(TokenUsage::new(
                            u.prompt_token_count.unwrap_or(0),
                            u.candidates_token_count.unwrap_or(0),
                        ));
                    }
                    let candidate = chunk.candidates.unwrap_or_default().into_iter().next()?;
                    if let Some(reason) = candidate.finish_reason.as_deref() {
                        state.finish = Some(map_finish_reason(Some(reason)));
                    }
                    let text = candidate_text(&candidate);
                    (!text.is_empty()).then(|| Ok(StreamChunk::delta(text, 0)))
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
                    Some(Ok(StreamChunk::done(state.usage, state.finish)))
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
                provider: "vertex".into(),
                context_tokens: Some(entry.context_tokens),
                description: None,
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_url_includes_project_and_region() {
        let adapter = VertexAdapter::new("my-project", "europe-west4");
        let url = adapter.model_url("gemini-1.5-pro", false);
        assert_eq!(
            url,
            "https://europe-west4-aiplatform.googleapis.com/v1/projects/my-project/locations/europe-west4/publishers/google/models/gemini-1.5-pro:generateContent"
        );
        let stream_url = adapter.model_url("gemini-1.5-pro", true);
        assert!(stream_url.ends_with(":streamGenerateContent?alt=sse"));
    }

    #[test]
    fn test_body_roles_and_system_instruction() {
        let messages = vec![
            ChatMessage::system("be factual"),
            ChatMessage::user("hello"),
            ChatMessage::assistant("hi"),
        ];
        let body = VertexAdapter::build_body(&messages, &RequestOptions::default());
        assert_eq!(body["systemInstruction"]["parts"][0]["text"], "be factual");
        assert_eq!(body["contents"][0]["role"], "user");
        assert_eq!(body["contents"][1]["role"], "model");
    }

    #[test]
    fn test_generation_config() {
        let mut options = RequestOptions::default();
        options.max_tokens = Some(200);
        options.temperature = Some(0.3);
        options.top_k = Some(40);
        let body = VertexAdapter::build_body(&[ChatMessage::user("x")], &options);
        assert_eq!(body["generationConfig"]["maxOutputTokens"], 200);
        assert_eq!(body["generationConfig"]["topK"], 40);
    }

    #[test]
    fn test_finish_reason_mapping() {
        assert_eq!(map_finish_reason(Some("STOP")), FinishReason::Stop);
        assert_eq!(map_finish_reason(Some("MAX_TOKENS")), FinishReason::Length);
        assert_eq!(map_finish_reason(Some("SAFETY")), FinishReason::Safety);
    }

    #[test]
    fn test_candidate_text_joins_parts() {
        let wire: WireResponse = serde_json::from_str(
            r#"{"candidates":[{"content":{"parts":[{"text":"Hel"},{"text":"lo"}]},"finishReason":"STOP"}]}"#,
        )
        .unwrap();
        let candidate = &wire.candidates.unwrap()[0];
        assert_eq!(candidate_text(candidate), "Hello");
    }

    #[tokio::test]
    async fn test_load_from_catalog() {
        let adapter = VertexAdapter::new("p", "us-central1");
        let descriptor = adapter
            .load("gemini-1.5-flash", &LoadOptions::default())
            .await
            .unwrap();
        assert_eq!(descriptor.id, "vertex:gemini-1.5-flash");
        assert_eq!(descriptor.limits.context_tokens, 1_000_000);
    }
}
