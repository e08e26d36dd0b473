//! # Switchboard
//!
//! A multi-provider LLM request router. Inference requests come in as a
//! normalized [`Request`] and are dispatched to one of many heterogeneous
//! backends, remote API providers or locally loaded weights, returning a
//! unified [`Response`] or a streamed chunk sequence.
//!
//! ## Core Components
//!
//! - [`types`]: the normalized request, response, stream-chunk, usage, and
//!   cost shapes every adapter translates to and from
//! - [`adapters`]: the uniform [`adapters::ProviderAdapter`] contract and
//!   the per-provider plugins (OpenAI-compatible, Anthropic, Bedrock,
//!   Vertex, Azure OpenAI, Cohere, local weight files)
//! - [`registry`]: the in-memory set of active model descriptors with
//!   capability flags and a persistence hook
//! - [`router`]: candidate selection with pluggable strategies and fallback
//!   chains
//! - [`balancer`]: per-model load slots and the counter decay pass
//! - [`limiter`]: per-key sliding-window rate limits, concurrency caps, and
//!   queueing
//! - [`auth`] / [`byok`]: API-key validation and per-user/per-group
//!   provider credentials, encrypted at rest
//! - [`store`] / [`migrate`]: the persistent JSON map with debounced atomic
//!   writes and the schema migration runner
//! - [`cache`]: exact and embedding-similarity response caching
//! - [`pipeline`]: the [`RouterCore`] façade sequencing
//!   auth → rate limit → cache → route → dispatch → accounting
//! - [`error`] / [`retry`]: the error taxonomy and the backoff policy
//! - [`events`] / [`metrics`]: audit events and metric counters
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use switchboard::{RouterCore, RouterSettings, Request};
//! use switchboard::adapters::openai::OpenAiCompatibleAdapter;
//! use switchboard::pipeline::LoadSpec;
//! use switchboard::adapters::ProviderFamily;
//! use std::sync::Arc;
//!
//! # async fn run() -> Result<(), switchboard::RouterError> {
//! let core = RouterCore::new(RouterSettings::from_env()).await?;
//! core.adapters().register(Arc::new(OpenAiCompatibleAdapter::openai()));
//! core.load_model(LoadSpec {
//!     provider: ProviderFamily::OpenAi,
//!     model_id: "gpt-4o-mini".into(),
//!     probe: false,
//!     api_key: None,
//! }).await?;
//!
//! let mut request = Request::from_prompt("What is a Petri net?");
//! request.api_key = Some("sb-demo.secret".into());
//! let response = core.generate(request).await?;
//! println!("{} (${:.5})", response.text, response.cost);
//! # Ok(())
//! # }
//! ```

pub mod adapters;
pub mod auth;
pub mod balancer;
pub mod byok;
pub mod cache;
pub mod config;
pub mod error;
pub mod events;
pub mod limiter;
pub mod metrics;
pub mod migrate;
pub mod pipeline;
pub mod registry;
pub mod retry;
pub mod router;
pub mod sse;
pub mod store;
pub mod types;

pub use config::RouterSettings;
pub use error::{RouterError, RouterResult};
pub use pipeline::{LoadSpec, ResponseStream, RouterCore};
pub use registry::{ModelDescriptor, ModelFilter, ModelRegistry};
pub use router::RoutingStrategy;
pub use types::{ChatMessage, Request, Response, StreamChunk, TokenUsage};
