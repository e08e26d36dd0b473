//! Provider adapter interface and registry
//!
//! Each provider family implements [`ProviderAdapter`], translating the
//! normalized request into its wire protocol: auth header assembly, endpoint
//! layout, request shape, stream decoding, and usage/cost reporting. Adapters
//! never leak provider-specific types through this interface, and every error
//! they return is classified into the router taxonomy.

pub mod anthropic;
pub mod azure;
pub mod bedrock;
pub mod cohere;
pub mod local;
pub mod openai;
pub mod vertex;

use async_trait::async_trait;
use dashmap::DashMap;
use futures::Stream;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::pin::Pin;
use std::sync::Arc;
use uuid::Uuid;

use crate::error::{RouterError, RouterResult};
use crate::registry::ModelDescriptor;
use crate::types::{ChatMessage, Request, RequestOptions, Response, StreamChunk};

/// Provider families the router can dispatch to
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum ProviderFamily {
    OpenAi,
    AzureOpenAi,
    Anthropic,
    Bedrock,
    Vertex,
    Mistral,
    Cohere,
    Perplexity,
    DeepSeek,
    Groq,
    OpenRouter,
    Novita,
    LocalGguf,
    LocalOnnx,
    LocalSafetensors,
}

impl std::fmt::Display for ProviderFamily {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ProviderFamily::OpenAi => "openai",
            ProviderFamily::AzureOpenAi => "azure-openai",
            ProviderFamily::Anthropic => "anthropic",
            ProviderFamily::Bedrock => "bedrock",
            ProviderFamily::Vertex => "vertex",
            ProviderFamily::Mistral => "mistral",
            ProviderFamily::Cohere => "cohere",
            ProviderFamily::Perplexity => "perplexity",
            ProviderFamily::DeepSeek => "deepseek",
            ProviderFamily::Groq => "groq",
            ProviderFamily::OpenRouter => "openrouter",
            ProviderFamily::Novita => "novita",
            ProviderFamily::LocalGguf => "local-gguf",
            ProviderFamily::LocalOnnx => "local-onnx",
            ProviderFamily::LocalSafetensors => "local-safetensors",
        };
        write!(f, "{}", name)
    }
}

impl std::str::FromStr for ProviderFamily {
    type Err = RouterError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "openai" => Ok(ProviderFamily::OpenAi),
            "azure-openai" | "azure" => Ok(ProviderFamily::AzureOpenAi),
            "anthropic" => Ok(ProviderFamily::Anthropic),
            "bedrock" => Ok(ProviderFamily::Bedrock),
            "vertex" => Ok(ProviderFamily::Vertex),
            "mistral" => Ok(ProviderFamily::Mistral),
            "cohere" => Ok(ProviderFamily::Cohere),
            "deepseek" => Ok(ProviderFamily::DeepSeek),
            "perplexity" => Ok(ProviderFamily::Perplexity),
            "groq" => Ok(ProviderFamily::Groq),
            "openrouter" => Ok(ProviderFamily::OpenRouter),
            "novita" => Ok(ProviderFamily::Novita),
            "local-gguf" => Ok(ProviderFamily::LocalGguf),
            "local-onnx" => Ok(ProviderFamily::LocalOnnx),
            "local-safetensors" => Ok(ProviderFamily::LocalSafetensors),
            other => Err(RouterError::NotFound(format!(
                "unknown provider family: {}",
                other
            ))),
        }
    }
}

impl ProviderFamily {
    /// Whether the family speaks the OpenAI chat-completions wire protocol
    pub fn is_openai_compatible(&self) -> bool {
        matches!(
            self,
            ProviderFamily::OpenAi
                | ProviderFamily::Groq
                | ProviderFamily::DeepSeek
                | ProviderFamily::OpenRouter
                | ProviderFamily::Novita
                | ProviderFamily::Perplexity
                | ProviderFamily::Mistral
        )
    }

    /// Environment variable consulted as the process-default credential
    pub fn env_key(&self) -> Option<&'static str> {
        match self {
            ProviderFamily::OpenAi => Some("OPENAI_API_KEY"),
            ProviderFamily::AzureOpenAi => Some("AZURE_OPENAI_API_KEY"),
            ProviderFamily::Anthropic => Some("ANTHROPIC_API_KEY"),
            ProviderFamily::Bedrock => Some("AWS_BEDROCK_CREDENTIALS"),
            ProviderFamily::Vertex => Some("VERTEX_ACCESS_TOKEN"),
            ProviderFamily::Mistral => Some("MISTRAL_API_KEY"),
            ProviderFamily::Cohere => Some("COHERE_API_KEY"),
            ProviderFamily::Perplexity => Some("PERPLEXITY_API_KEY"),
            ProviderFamily::DeepSeek => Some("DEEPSEEK_API_KEY"),
            ProviderFamily::Groq => Some("GROQ_API_KEY"),
            ProviderFamily::OpenRouter => Some("OPENROUTER_API_KEY"),
            ProviderFamily::Novita => Some("NOVITA_API_KEY"),
            ProviderFamily::LocalGguf
            | ProviderFamily::LocalOnnx
            | ProviderFamily::LocalSafetensors => None,
        }
    }

    /// Local families never need a credential
    pub fn is_local(&self) -> bool {
        self.env_key().is_none()
    }
}

/// Lazily evaluated finite chunk sequence produced by `stream`
pub type ChunkStream = Pin<Box<dyn Stream<Item = RouterResult<StreamChunk>> + Send>>;

/// Options for loading a model through an adapter
#[derive(Debug, Clone, Default)]
pub struct LoadOptions {
    /// Issue a cheap probe request to validate credentials and availability
    pub probe: bool,
    /// Credential used for the probe; resolved by the caller
    pub api_key: Option<String>,
}

/// Best-effort model listing entry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelSummary {
    pub id: String,
    pub provider: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// Adapter metadata returned by `info`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdapterInfo {
    pub name: String,
    pub version: String,
    pub features: Vec<String>,
    /// SHA-256 over the adapter's static pricing table
    pub pricing_table_hash: String,
    pub status: String,
}

/// The normalized request handed to adapters, already authenticated,
/// admitted, and resolved to a concrete provider credential.
#[derive(Debug, Clone)]
pub struct AdapterRequest {
    pub request_id: Uuid,
    pub messages: Vec<ChatMessage>,
    pub options: RequestOptions,
    /// Provider credential; empty string for local adapters
    pub api_key: String,
}

impl AdapterRequest {
    pub fn from_request(request: &Request, api_key: String) -> Self {
        Self {
            request_id: request.id,
            messages: request.canonical_messages(),
            options: request.options.clone(),
            api_key,
        }
    }
}

/// Embedding request for adapters that support it
#[derive(Debug, Clone)]
pub struct EmbeddingRequest {
    pub inputs: Vec<String>,
    pub api_key: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingResponse {
    pub vectors: Vec<Vec<f32>>,
    pub usage: crate::types::TokenUsage,
    pub cost: f64,
}

/// Rerank request for adapters that support it
#[derive(Debug, Clone)]
pub struct RerankRequest {
    pub query: String,
    pub documents: Vec<String>,
    pub top_n: Option<usize>,
    pub api_key: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RerankResult {
    pub index: usize,
    pub relevance_score: f64,
}

/// Uniform contract implemented by every provider plugin
#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    /// The family this adapter serves
    fn family(&self) -> ProviderFamily;

    /// Adapter metadata: name, version, features, pricing table hash
    fn info(&self) -> AdapterInfo;

    /// Validate credentials and model availability, producing a descriptor
    async fn load(&self, model_id: &str, options: &LoadOptions) -> RouterResult<ModelDescriptor>;

    /// Synchronous end-to-end completion
    async fn complete(
        &self,
        request: &AdapterRequest,
        descriptor: &ModelDescriptor,
    ) -> RouterResult<Response>;

    /// Streamed completion; the final chunk carries `done = true`
    async fn stream(
        &self,
        request: &AdapterRequest,
        descriptor: &ModelDescriptor,
    ) -> RouterResult<ChunkStream>;

    /// Best-effort model enumeration; may hit a live endpoint or return a
    /// static catalog
    async fn list_models(&self) -> RouterResult<Vec<ModelSummary>>;

    /// Release adapter-side resources for a descriptor
    async fn unload(&self, _descriptor_id: &str) -> RouterResult<()> {
        Ok(())
    }

    /// Cheap liveness probe against the provider
    async fn health_probe(&self, _api_key: &str) -> RouterResult<bool> {
        Ok(true)
    }

    /// Embeddings; only adapters advertising the capability implement this
    async fn embed(&self, _request: &EmbeddingRequest) -> RouterResult<EmbeddingResponse> {
        Err(RouterError::UpstreamPermanent(format!(
            "{} adapter does not support embeddings",
            self.family()
        )))
    }

    /// Rerank; only adapters advertising the capability implement this
    async fn rerank(&self, _request: &RerankRequest) -> RouterResult<Vec<RerankResult>> {
        Err(RouterError::UpstreamPermanent(format!(
            "{} adapter does not support rerank",
            self.family()
        )))
    }
}

/// Registry of adapters keyed by provider family
pub struct AdapterRegistry {
    adapters: DashMap<ProviderFamily, Arc<dyn ProviderAdapter>>,
}

impl AdapterRegistry {
    pub fn new() -> Self {
        Self {
            adapters: DashMap::new(),
        }
    }

    /// Register an adapter; replaces any previous adapter for the family
    pub fn register(&self, adapter: Arc<dyn ProviderAdapter>) {
        self.adapters.insert(adapter.family(), adapter);
    }

    pub fn get(&self, family: ProviderFamily) -> RouterResult<Arc<dyn ProviderAdapter>> {
        self.adapters
            .get(&family)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| RouterError::NotFound(format!("no adapter registered for {}", family)))
    }

    pub fn families(&self) -> Vec<ProviderFamily> {
        self.adapters.iter().map(|e| *e.key()).collect()
    }

    /// Info for every registered adapter, for diagnostics
    pub fn describe(&self) -> HashMap<String, AdapterInfo> {
        self.adapters
            .iter()
            .map(|e| (e.key().to_string(), e.value().info()))
            .collect()
    }
}

impl Default for AdapterRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// SHA-256 hex digest of a serializable pricing table, for `AdapterInfo`
pub(crate) fn pricing_table_hash<T: Serialize>(table: &T) -> String {
    use sha2::{Digest, Sha256};
    let bytes = serde_json::to_vec(table).unwrap_or_default();
    let digest = Sha256::digest(&bytes);
    hex_string(&digest)
}

pub(crate) fn hex_string(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}
