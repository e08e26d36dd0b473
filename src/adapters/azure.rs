//! Azure OpenAI provider adapter
//!
//! Deployment-scoped endpoints: requests go to
//! `{resource}/openai/deployments/{deployment}/chat/completions?api-version=…`
//! with either an `api-key` header or an Azure AD bearer token. The wire
//! payload is OpenAI-shaped; the deployment name stands in for the model id.

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::header::{HeaderMap, HeaderValue, CONTENT_TYPE};
use reqwest::Client;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::{debug, error};

use crate::error::{RouterError, RouterResult};
use crate::registry::{ModelDescriptor, ModelStatus};
use crate::sse::sse_event_stream;
use crate::types::{
    ChatMessage, FinishReason, MessageRole, RequestOptions, Response, StreamChunk, TokenUsage,
};

use super::openai::map_finish_reason;
use super::{
    AdapterInfo, AdapterRequest, ChunkStream, LoadOptions, ModelSummary, ProviderAdapter,
    ProviderFamily,
};

const DEFAULT_API_VERSION: &str = "2024-06-01";
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// How the credential is presented
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AzureAuth {
    /// `api-key: <key>`
    ApiKey,
    /// `Authorization: Bearer <token>` from Azure AD
    BearerToken,
}

/// Adapter for Azure-hosted OpenAI deployments
pub struct AzureOpenAiAdapter {
    /// e.g. `https://my-resource.openai.azure.com`
    resource_endpoint: String,
    api_version: String,
    auth: AzureAuth,
    http: Client,
}

impl AzureOpenAiAdapter {
    pub fn new(resource_endpoint: impl Into<String>) -> Self {
        Self {
            resource_endpoint: resource_endpoint.into(),
            api_version: DEFAULT_API_VERSION.to_string(),
            auth: AzureAuth::ApiKey,
            http: Client::new(),
        }
    }

    pub fn with_auth(mut self, auth: AzureAuth) -> Self {
        self.auth = auth;
        self
    }

    pub fn with_api_version(mut self, version: impl Into<String>) -> Self {
        self.api_version = version.into();
        self
    }

    fn deployment_url(&self, deployment: &str) -> String {
        format!(
            "{}/openai/deployments/{}/chat/completions?api-version={}",
            self.resource_endpoint, deployment, self.api_version
        )
    }

    fn headers(&self, api_key: &str) -> RouterResult<HeaderMap> {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        match self.auth {
            AzureAuth::ApiKey => {
                headers.insert(
                    "api-key",
                    HeaderValue::from_str(api_key)
                        .map_err(|e| RouterError::Auth(format!("invalid API key: {}", e)))?,
                );
            }
            AzureAuth::BearerToken => {
                headers.insert(
                    "Authorization",
                    HeaderValue::from_str(&format!("Bearer {}", api_key))
                        .map_err(|e| RouterError::Auth(format!("invalid token: {}", e)))?,
                );
            }
        }
        Ok(headers)
    }

    fn build_body(
        messages: &[ChatMessage],
        options: &RequestOptions,
        stream: bool,
    ) -> serde_json::Value {
        let wire_messages: Vec<serde_json::Value> = messages
            .iter()
            .map(|m| {
                serde_json::json!({
                    "role": match m.role {
                        MessageRole::System => "system",
                        MessageRole::User => "user",
                        MessageRole::Assistant => "assistant",
                        MessageRole::Tool => "tool",
                        MessageRole::Function => "function",
                    },
                    "content": m.content.as_text(),
                })
            })
            .collect();
        let mut body = serde_json::json!({"messages": wire_messages});
        let obj = body.as_object_mut().expect("object");
        if let Some(v) = options.max_tokens {
            obj.insert("max_tokens".into(), v.into());
        }
        if let Some(v) = options.temperature {
            obj.insert("temperature".into(), v.into());
        }
        if let Some(v) = options.top_p {
            obj.insert("top_p".into(), v.into());
        }
        if let Some(v) = &options.stop_sequences {
            obj.insert("stop".into(), serde_json::json!(v));
        }
        if stream {
            obj.insert("stream".into(), true.into());
        }
        body
    }

    async fn post(
        &self,
        request: &AdapterRequest,
        deployment: &str,
        stream: bool,
    ) -> RouterResult<reqwest::Response> {
        let url = self.deployment_url(deployment);
        debug!("azure-openai request: {}", url);
        let timeout = request
            .options
            .timeout_ms
            .map(Duration::from_millis)
            .unwrap_or(DEFAULT_TIMEOUT);
        let response = self
            .http
            .post(&url)
            .headers(self.headers(&request.api_key)?)
            .json(&Self::build_body(&request.messages, &request.options, stream))
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| RouterError::UpstreamTransient(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let text = response.text().await.unwrap_or_default();
            error!("azure-openai API error {}: {}", status, text);
            return Err(RouterError::from_provider_status(status, &text));
        }
        Ok(response)
    }
}

#[derive(Debug, Deserialize)]
struct WireResponse {
    choices: Vec<WireChoice>,
    usage: Option<WireUsage>,
    model: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WireChoice {
    message: WireMessage,
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WireMessage {
    content: Option<String>,
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
    delta: WireStreamDelta,
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WireStreamDelta {
    content: Option<String>,
}

#[async_trait]
impl ProviderAdapter for AzureOpenAiAdapter {
    fn family(&self) -> ProviderFamily {
        ProviderFamily::AzureOpenAi
    }

    fn info(&self) -> AdapterInfo {
        AdapterInfo {
            name: "azure-openai".into(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            features: vec!["chat".into(), "streaming".into()],
            pricing_table_hash: super::pricing_table_hash(&self.api_version),
            status: "ready".into(),
        }
    }

    /// Deployments are customer-named, so any id loads; pricing must be
    /// supplied by the operator via descriptor updates.
    async fn load(&self, model_id: &str, options: &LoadOptions) -> RouterResult<ModelDescriptor> {
        let mut descriptor = ModelDescriptor::new(ProviderFamily::AzureOpenAi, model_id);
        if options.probe {
            // A deployment-scoped call is the only way to validate
            let probe = AdapterRequest {
                request_id: uuid::Uuid::new_v4(),
                messages: vec![ChatMessage::user("ping")],
                options: RequestOptions {
                    max_tokens: Some(1),
                    ..Default::default()
                },
                api_key: options.api_key.clone().unwrap_or_default(),
            };
            self.post(&probe, model_id, false).await?;
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
        let response = self.post(request, &descriptor.model_id, false).await?;
        let wire: WireResponse = response
            .json()
            .await
            .map_err(|e| RouterError::UpstreamPermanent(format!("malformed response: {}", e)))?;

        let choice = wire
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| RouterError::UpstreamPermanent("response carried no choices".into()))?;
        let text = choice.message.content.unwrap_or_default();
        let usage = wire
            .usage
            .map(|u| TokenUsage::new(u.prompt_tokens, u.completion_tokens))
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
            model: wire.model.unwrap_or_else(|| descriptor.model_id.clone()),
            provider: "azure-openai".into(),
            finish_reason: map_finish_reason(choice.finish_reason.as_deref()),
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
                    choice
                        .delta
                        .content
                        .filter(|c| !c.is_empty())
                        .map(|c| Ok(StreamChunk::delta(c, choice.index)))
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

    /// Azure has no cross-deployment listing on the data plane
    async fn list_models(&self) -> RouterResult<Vec<ModelSummary>> {
        Ok(Vec::new())
    }
}
