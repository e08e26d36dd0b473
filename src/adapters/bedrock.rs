//! AWS Bedrock provider adapter
//!
//! Invocations are SigV4-signed POSTs to
//! `bedrock-runtime.<region>.amazonaws.com/model/<id>/invoke`. The request
//! body shape depends on the model id prefix (`anthropic.*`, `meta.*`,
//! `mistral.*`, `amazon.*`, `cohere.*`). The credential string is
//! `accessKeyId:secretAccessKey[:sessionToken]`.
//!
//! Response streaming uses AWS's binary event-stream framing, which this
//! adapter does not decode; `stream` falls back to a unary invoke replayed
//! as a single delta chunk.

use async_trait::async_trait;
use chrono::Utc;
use hmac::{Hmac, Mac};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, CONTENT_TYPE};
use reqwest::Client;
use serde_json::Value;
use sha2::{Digest, Sha256};
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
    hex_string, pricing_table_hash, AdapterInfo, AdapterRequest, ChunkStream, LoadOptions,
    ModelSummary, ProviderAdapter, ProviderFamily,
};

const SERVICE: &str = "bedrock";
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);
const FALLBACK_MAX_TOKENS: u32 = 1024;

type HmacSha256 = Hmac<Sha256>;

/// Parsed AWS credential triple
struct AwsCredentials {
    access_key_id: String,
    secret_access_key: String,
    session_token: Option<String>,
}

impl AwsCredentials {
    fn parse(raw: &str) -> RouterResult<Self> {
        let mut parts = raw.splitn(3, ':');
        let access_key_id = parts.next().unwrap_or_default().to_string();
        let secret_access_key = parts.next().unwrap_or_default().to_string();
        if access_key_id.is_empty() || secret_access_key.is_empty() {
            return Err(RouterError::Auth(
                "bedrock credential must be accessKeyId:secretAccessKey".into(),
            ));
        }
        Ok(Self {
            access_key_id,
            secret_access_key,
            session_token: parts.next().map(|s| s.to_string()),
        })
    }
}

fn hmac_sha256(key: &[u8], data: &[u8]) -> Vec<u8> {
    let mut mac = HmacSha256::new_from_slice(key).expect("hmac accepts any key length");
    mac.update(data);
    mac.finalize().into_bytes().to_vec()
}

/// SigV4 signature over a POST with the given payload
fn sign_request(
    creds: &AwsCredentials,
    region: &str,
    host: &str,
    path: &str,
    payload: &[u8],
) -> HeaderMap {
    let now = Utc::now();
    let amz_date = now.format("%Y%m%dT%H%M%SZ").to_string();
    let date_stamp = now.format("%Y%m%d").to_string();
    let payload_hash = hex_string(&Sha256::digest(payload));

    // Canonical request: URI path segments stay percent-encoded
    let canonical_uri: String = path
        .split('/')
        .map(|seg| urlencoding::encode(seg).into_owned())
        .collect::<Vec<_>>()
        .join("/");

    let mut canonical_headers = format!(
        "content-type:application/json\nhost:{}\nx-amz-date:{}\n",
        host, amz_date
    );
    let mut signed_headers = "content-type;host;x-amz-date".to_string();
    if let Some(token) = &creds.session_token {
        canonical_headers.push_str(&format!("x-amz-security-token:{}\n", token));
        signed_headers.push_str(";x-amz-security-token");
    }

    let canonical_request = format!(
        "POST\n{}\n\n{}\n{}\n{}",
        canonical_uri, canonical_headers, signed_headers, payload_hash
    );

    let scope = format!("{}/{}/{}/aws4_request", date_stamp, region, SERVICE);
    let string_to_sign = format!(
        "AWS4-HMAC-SHA256\n{}\n{}\n{}",
        amz_date,
        scope,
        hex_string(&Sha256::digest(canonical_request.as_bytes()))
    );

    let k_date = hmac_sha256(
        format!("AWS4{}", creds.secret_access_key).as_bytes(),
        date_stamp.as_bytes(),
    );
    let k_region = hmac_sha256(&k_date, region.as_bytes());
    let k_service = hmac_sha256(&k_region, SERVICE.as_bytes());
    let k_signing = hmac_sha256(&k_service, b"aws4_request");
    let signature = hex_string(&hmac_sha256(&k_signing, string_to_sign.as_bytes()));

    let authorization = format!(
        "AWS4-HMAC-SHA256 Credential={}/{}, SignedHeaders={}, Signature={}",
        creds.access_key_id, scope, signed_headers, signature
    );

    let mut headers = HeaderMap::new();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    headers.insert(
        HeaderName::from_static("x-amz-date"),
        HeaderValue::from_str(&amz_date).expect("amz date"),
    );
    if let Some(token) = &creds.session_token {
        if let Ok(value) = HeaderValue::from_str(token) {
            headers.insert(HeaderName::from_static("x-amz-security-token"), value);
        }
    }
    if let Ok(value) = HeaderValue::from_str(&authorization) {
        headers.insert("Authorization", value);
    }
    headers
}

/// Model-prefix families bedrock multiplexes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BodyShape {
    Anthropic,
    Meta,
    Mistral,
    Titan,
    Cohere,
}

impl BodyShape {
    fn for_model(model_id: &str) -> RouterResult<Self> {
        let prefix = model_id.split('.').next().unwrap_or_default();
        match prefix {
            "anthropic" => Ok(BodyShape::Anthropic),
            "meta" => Ok(BodyShape::Meta),
            "mistral" => Ok(BodyShape::Mistral),
            "amazon" => Ok(BodyShape::Titan),
            "cohere" => Ok(BodyShape::Cohere),
            other => Err(RouterError::NotFound(format!(
                "unsupported bedrock model prefix: {}",
                other
            ))),
        }
    }
}

fn flatten_prompt(messages: &[ChatMessage]) -> String {
    messages
        .iter()
        .map(|m| m.content.as_text())
        .collect::<Vec<_>>()
        .join("\n")
}

/// Adapter for Bedrock-hosted models
pub struct BedrockAdapter {
    region: String,
    http: Client,
}

impl BedrockAdapter {
    pub fn new(region: impl Into<String>) -> Self {
        Self {
            region: region.into(),
            http: Client::new(),
        }
    }

    fn host(&self) -> String {
        format!("bedrock-runtime.{}.amazonaws.com", self.region)
    }

    fn build_body(shape: BodyShape, messages: &[ChatMessage], options: &RequestOptions) -> Value {
        let max_tokens = options.max_tokens.unwrap_or(FALLBACK_MAX_TOKENS);
        match shape {
            BodyShape::Anthropic => {
                let mut system = None;
                let mut wire = Vec::new();
                for m in messages {
                    match m.role {
                        MessageRole::System => system = Some(m.content.as_text()),
                        MessageRole::Assistant => wire.push(serde_json::json!({
                            "role": "assistant", "content": m.content.as_text()
                        })),
                        _ => wire.push(serde_json::json!({
                            "role": "user", "content": m.content.as_text()
                        })),
                    }
                }
                let mut body = serde_json::json!({
                    "anthropic_version": "bedrock-2023-05-31",
                    "max_tokens": max_tokens,
                    "messages": wire,
                });
                if let Some(system) = system {
                    body["system"] = Value::String(system);
                }
                if let Some(t) = options.temperature {
                    body["temperature"] = serde_json::json!(t);
                }
                body
            }
            BodyShape::Meta => serde_json::json!({
                "prompt": flatten_prompt(messages),
                "max_gen_len": max_tokens,
                "temperature": options.temperature.unwrap_or(0.7),
            }),
            BodyShape::Mistral => serde_json::json!({
                "prompt": format!("<s>[INST] {} [/INST]", flatten_prompt(messages)),
                "max_tokens": max_tokens,
                "temperature": options.temperature.unwrap_or(0.7),
            }),
            BodyShape::Titan => serde_json::json!({
                "inputText": flatten_prompt(messages),
                "textGenerationConfig": {
                    "maxTokenCount": max_tokens,
                    "temperature": options.temperature.unwrap_or(0.7),
                    "stopSequences": options.stop_sequences.clone().unwrap_or_default(),
                }
            }),
            BodyShape::Cohere => serde_json::json!({
                "prompt": flatten_prompt(messages),
                "max_tokens": max_tokens,
                "temperature": options.temperature.unwrap_or(0.7),
            }),
        }
    }

    /// Extract (text, usage, finish) from the prefix-specific response shape
    fn parse_body(shape: BodyShape, body: &Value) -> (String, Option<TokenUsage>, FinishReason) {
        match shape {
            BodyShape::Anthropic => {
                let text = body["content"]
                    .as_array()
                    .map(|blocks| {
                        blocks
                            .iter()
                            .filter_map(|b| b["text"].as_str())
                            .collect::<String>()
                    })
                    .unwrap_or_default();
                let usage = body.get("usage").map(|u| {
                    TokenUsage::new(
                        u["input_tokens"].as_u64().unwrap_or(0) as u32,
                        u["output_tokens"].as_u64().unwrap_or(0) as u32,
                    )
                });
                let finish = match body["stop_reason"].as_str() {
                    Some("max_tokens") => FinishReason::Length,
                    Some("tool_use") => FinishReason::ToolUse,
                    _ => FinishReason::Stop,
                };
                (text, usage, finish)
            }
            BodyShape::Meta => {
                let text = body["generation"].as_str().unwrap_or_default().to_string();
                let usage = match (
                    body["prompt_token_count"].as_u64(),
                    body["generation_token_count"].as_u64(),
                ) {
                    (Some(p), Some(c)) => Some(TokenUsage::new(p as u32, c as u32)),
                    _ => None,
                };
                let finish = match body["stop_reason"].as_str() {
                    Some("length") => FinishReason::Length,
                    _ => FinishReason::Stop,
                };
                (text, usage, finish)
            }
            BodyShape::Mistral => {
                let text = body["outputs"][0]["text"]
                    .as_str()
                    .unwrap_or_default()
                    .to_string();
                (text, None, FinishReason::Stop)
            }
            BodyShape::Titan => {
                let result = &body["results"][0];
                let text = result["outputText"].as_str().unwrap_or_default().to_string();
                let usage = match (
                    body["inputTextTokenCount"].as_u64(),
                    result["tokenCount"].as_u64(),
                ) {
                    (Some(p), Some(c)) => Some(TokenUsage::new(p as u32, c as u32)),
                    _ => None,
                };
                let finish = match result["completionReason"].as_str() {
                    Some("LENGTH") => FinishReason::Length,
                    _ => FinishReason::Stop,
                };
                (text, usage, finish)
            }
            BodyShape::Cohere => {
                let text = body["generations"][0]["text"]
                    .as_str()
                    .unwrap_or_default()
                    .to_string();
                (text, None, FinishReason::Stop)
            }
        }
    }

    async fn invoke(&self, request: &AdapterRequest, model_id: &str) -> RouterResult<Value> {
        let shape = BodyShape::for_model(model_id)?;
        let body = Self::build_body(shape, &request.messages, &request.options);
        let payload = serde_json::to_vec(&body)
            .map_err(|e| RouterError::Internal(format!("serialize bedrock body: {}", e)))?;

        let creds = AwsCredentials::parse(&request.api_key)?;
        let host = self.host();
        let path = format!("/model/{}/invoke", model_id);
        let headers = sign_request(&creds, &self.region, &host, &path, &payload);

        let url = format!("https://{}{}", host, path);
        debug!("bedrock request: {}", url);
        let timeout = request
            .options
            .timeout_ms
            .map(Duration::from_millis)
            .unwrap_or(DEFAULT_TIMEOUT);

        let response = self
            .http
            .post(&url)
            .headers(headers)
            .body(payload)
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| RouterError::UpstreamTransient(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let text = response.text().await.unwrap_or_default();
            error!("bedrock API error {}: {}", status, text);
            return Err(RouterError::from_provider_status(status, &text));
        }
        response
            .json()
            .await
            .map_err(|e| RouterError::UpstreamPermanent(format!("malformed response: {}", e)))
    }
}

#[derive(Debug, Clone, serde::Serialize)]
struct CatalogEntry {
    model_id: &'static str,
    context_tokens: u32,
    input_per_mtok: f64,
    output_per_mtok: f64,
    quality: f64,
}

const CATALOG: [CatalogEntry; 4] = [
    CatalogEntry {
        model_id: "anthropic.claude-3-5-sonnet-20241022-v2:0",
        context_tokens: 200_000,
        input_per_mtok: 3.0,
        output_per_mtok: 15.0,
        quality: 0.92,
    },
    CatalogEntry {
        model_id: "meta.llama3-1-70b-instruct-v1:0",
        context_tokens: 128_000,
        input_per_mtok: 0.72,
        output_per_mtok: 0.72,
        quality: 0.76,
    },
    CatalogEntry {
        model_id: "mistral.mistral-large-2407-v1:0",
        context_tokens: 128_000,
        input_per_mtok: 2.0,
        output_per_mtok: 6.0,
        quality: 0.84,
    },
    CatalogEntry {
        model_id: "amazon.titan-text-express-v1",
        context_tokens: 8_000,
        input_per_mtok: 0.2,
        output_per_mtok: 0.6,
        quality: 0.55,
    },
];

#[async_trait]
impl ProviderAdapter for BedrockAdapter {
    fn family(&self) -> ProviderFamily {
        ProviderFamily::Bedrock
    }

    fn info(&self) -> AdapterInfo {
        AdapterInfo {
            name: "bedrock".into(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            features: vec!["chat".into(), "sigv4".into()],
            pricing_table_hash: pricing_table_hash(&CATALOG),
            status: "ready".into(),
        }
    }

    async fn load(&self, model_id: &str, _options: &LoadOptions) -> RouterResult<ModelDescriptor> {
        // Prefix must be one we can shape a body for
        BodyShape::for_model(model_id)?;

        let entry = CATALOG.iter().find(|e| e.model_id == model_id);
        let mut descriptor = ModelDescriptor::new(ProviderFamily::Bedrock, model_id);
        if let Some(entry) = entry {
            descriptor = descriptor
                .with_limits(ModelLimits {
                    context_tokens: entry.context_tokens,
                    max_output_tokens: 4096,
                })
                .with_pricing(Pricing::new(entry.input_per_mtok, entry.output_per_mtok))
                .with_quality(entry.quality);
        }
        if model_id.starts_with("anthropic.") {
            descriptor = descriptor.with_capabilities([Capability::ToolUse]);
        }
        descriptor.status = ModelStatus::Ready;
        Ok(descriptor)
    }

    async fn complete(
        &self,
        request: &AdapterRequest,
        descriptor: &ModelDescriptor,
    ) -> RouterResult<Response> {
        let shape = BodyShape::for_model(&descriptor.model_id)?;
        let started = Instant::now();
        let body = self.invoke(request, &descriptor.model_id).await?;
        let (text, usage, finish_reason) = Self::parse_body(shape, &body);

        let usage = usage.unwrap_or_else(|| {
            TokenUsage::new(
                crate::types::estimate_tokens(&flatten_prompt(&request.messages)),
                crate::types::estimate_tokens(&text),
            )
        });

        Ok(Response {
            text,
            usage,
            cost: descriptor.pricing.cost_for(&usage),
            latency_ms: started.elapsed().as_millis() as u64,
            model: descriptor.model_id.clone(),
            provider: "bedrock".into(),
            finish_reason,
            tool_calls: None,
            cached: false,
            metadata: HashMap::new(),
        })
    }

    /// Unary invoke replayed as a two-chunk stream; see module docs
    async fn stream(
        &self,
        request: &AdapterRequest,
        descriptor: &ModelDescriptor,
    ) -> RouterResult<ChunkStream> {
        let response = self.complete(request, descriptor).await?;
        let chunks = vec![
            Ok(StreamChunk::delta(response.text.clone(), 0)),
            Ok(StreamChunk::done(
                Some(response.usage),
                Some(response.finish_reason),
            )),
        ];
        Ok(Box::pin(futures::stream::iter(chunks)))
    }

    async fn list_models(&self) -> RouterResult<Vec<ModelSummary>> {
        Ok(CATALOG
            .iter()
            .map(|entry| ModelSummary {
                id: entry.model_id.to_string(),
                provider: "bedrock".into(),
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
    fn test_credential_parsing() {
        let creds = AwsCredentials::parse("AKIA123:secret456").unwrap();
        assert_eq!(creds.access_key_id, "AKIA123");
        assert_eq!(creds.secret_access_key, "secret456");
        assert!(creds.session_token.is_none());

        let with_token = AwsCredentials::parse("AKIA123:secret456:token789").unwrap();
        assert_eq!(with_token.session_token.as_deref(), Some("token789"));

        assert!(AwsCredentials::parse("only-one-part").is_err());
    }

    #[test]
    fn test_body_shape_by_prefix() {
        assert_eq!(
            BodyShape::for_model("anthropic.claude-3-5-sonnet-20241022-v2:0").unwrap(),
            BodyShape::Anthropic
        );
        assert_eq!(
            BodyShape::for_model("meta.llama3-1-70b-instruct-v1:0").unwrap(),
            BodyShape::Meta
        );
        assert_eq!(
            BodyShape::for_model("amazon.titan-text-express-v1").unwrap(),
            BodyShape::Titan
        );
        assert!(BodyShape::for_model("unknown.model").is_err());
    }

    #[test]
    fn test_anthropic_body_shape() {
        let messages = vec![ChatMessage::system("be brief"), ChatMessage::user("hi")];
        let mut options = RequestOptions::default();
        options.max_tokens = Some(100);
        let body = BedrockAdapter::build_body(BodyShape::Anthropic, &messages, &options);
        assert_eq!(body["anthropic_version"], "bedrock-2023-05-31");
        assert_eq!(body["max_tokens"], 100);
        assert_eq!(body["system"], "be brief");
        assert_eq!(body["messages"][0]["role"], "user");
    }

    #[test]
    fn test_titan_body_shape() {
        let body = BedrockAdapter::build_body(
            BodyShape::Titan,
            &[ChatMessage::user("hello")],
            &RequestOptions::default(),
        );
        assert_eq!(body["inputText"], "hello");
        assert!(body["textGenerationConfig"]["maxTokenCount"].as_u64().is_some());
    }

    #[test]
    fn test_anthropic_response_parsing() {
        let body = serde_json::json!({
            "content": [{"type": "text", "text": "Hi there"}],
            "stop_reason": "end_turn",
            "usage": {"input_tokens": 12, "output_tokens": 4}
        });
        let (text, usage, finish) = BedrockAdapter::parse_body(BodyShape::Anthropic, &body);
        assert_eq!(text, "Hi there");
        assert_eq!(usage.unwrap().total_tokens, 16);
        assert_eq!(finish, FinishReason::Stop);
    }

    #[test]
    fn test_meta_response_parsing() {
        let body = serde_json::json!({
            "generation": "output text",
            "prompt_token_count": 10,
            "generation_token_count": 5,
            "stop_reason": "length"
        });
        let (text, usage, finish) = BedrockAdapter::parse_body(BodyShape::Meta, &body);
        assert_eq!(text, "output text");
        assert_eq!(usage.unwrap().completion_tokens, 5);
        assert_eq!(finish, FinishReason::Length);
    }

    #[test]
    fn test_sigv4_signature_shape() {
        let creds = AwsCredentials::parse("AKIAEXAMPLE:wJalrXUtnFEMI").unwrap();
        let headers = sign_request(
            &creds,
            "us-east-1",
            "bedrock-runtime.us-east-1.amazonaws.com",
            "/model/anthropic.claude-3-5-sonnet-20241022-v2:0/invoke",
            b"{}",
        );
        let auth = headers.get("Authorization").unwrap().to_str().unwrap();
        assert!(auth.starts_with("AWS4-HMAC-SHA256 Credential=AKIAEXAMPLE/"));
        assert!(auth.contains("/us-east-1/bedrock/aws4_request"));
        assert!(auth.contains("SignedHeaders=content-type;host;x-amz-date"));
        assert!(auth.contains("Signature="));
        assert!(headers.get("x-amz-date").is_some());
    }

    #[test]
    fn test_session_token_signed_when_present() {
        let creds = AwsCredentials::parse("AKIA:secret:SESSION").unwrap();
        let headers = sign_request(
            &creds,
            "us-west-2",
            "bedrock-runtime.us-west-2.amazonaws.com",
            "/model/meta.llama3-1-70b-instruct-v1:0/invoke",
            b"{}",
        );
        assert_eq!(headers.get("x-amz-security-token").unwrap(), "SESSION");
        let auth = headers.get("Authorization").unwrap().to_str().unwrap();
        assert!(auth.contains("x-amz-security-token"));
    }
}
