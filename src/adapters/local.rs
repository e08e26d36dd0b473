//! Local weight-file adapter
//!
//! Loading sniffs the file's magic bytes to identify the format (GGUF,
//! GGML, safetensors, PyTorch zip, ONNX) and records capabilities on the
//! descriptor. Inference itself is delegated to a pluggable [`LocalEngine`];
//! without one configured, completion requests fail cleanly while load,
//! listing, and unload still work.

use async_trait::async_trait;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info};

use crate::error::{RouterError, RouterResult};
use crate::registry::{ModelDescriptor, ModelLimits, ModelStatus, Pricing};
use crate::types::{FinishReason, Response, StreamChunk, TokenUsage};

use super::{
    AdapterInfo, AdapterRequest, ChunkStream, LoadOptions, ModelSummary, ProviderAdapter,
    ProviderFamily,
};

/// Recognized weight-file formats
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WeightFormat {
    Gguf,
    Ggml,
    Safetensors,
    PyTorchZip,
    Onnx,
}

impl WeightFormat {
    pub fn family(&self) -> ProviderFamily {
        match self {
            WeightFormat::Gguf | WeightFormat::Ggml => ProviderFamily::LocalGguf,
            WeightFormat::Safetensors | WeightFormat::PyTorchZip => {
                ProviderFamily::LocalSafetensors
            }
            WeightFormat::Onnx => ProviderFamily::LocalOnnx,
        }
    }
}

/// Identify a weight file from its leading bytes (extension breaks ties)
pub fn sniff_format(header: &[u8], path: &Path) -> RouterResult<WeightFormat> {
    if header.starts_with(b"GGUF") {
        return Ok(WeightFormat::Gguf);
    }
    // ggml stores its magic little-endian
    if header.starts_with(b"ggml") || header.starts_with(b"lmgg") {
        return Ok(WeightFormat::Ggml);
    }
    if header.starts_with(b"PK\x03\x04") {
        return Ok(WeightFormat::PyTorchZip);
    }
    // safetensors: u64-le header length followed by a JSON object
    if header.len() > 8 && header[8] == b'{' {
        return Ok(WeightFormat::Safetensors);
    }
    let extension = path
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or_default()
        .to_ascii_lowercase();
    if extension == "onnx" && header.first() == Some(&0x08) {
        return Ok(WeightFormat::Onnx);
    }
    Err(RouterError::UnsupportedFormat(format!(
        "unrecognized weight format for {}",
        path.display()
    )))
}

/// Pluggable local inference backend
#[async_trait]
pub trait LocalEngine: Send + Sync {
    async fn generate(
        &self,
        request: &AdapterRequest,
        descriptor: &ModelDescriptor,
    ) -> RouterResult<Response>;
}

/// Deterministic echo backend used in tests and smoke setups
pub struct EchoEngine;

#[async_trait]
impl LocalEngine for EchoEngine {
    async fn generate(
        &self,
        request: &AdapterRequest,
        descriptor: &ModelDescriptor,
    ) -> RouterResult<Response> {
        let prompt = request
            .messages
            .iter()
            .map(|m| m.content.as_text())
            .collect::<Vec<_>>()
            .join("\n");
        let text = format!("echo: {}", prompt);
        let usage = TokenUsage::new(
            crate::types::estimate_tokens(&prompt),
            crate::types::estimate_tokens(&text),
        );
        Ok(Response {
            text,
            usage,
            cost: 0.0,
            latency_ms: 0,
            model: descriptor.model_id.clone(),
            provider: descriptor.provider.to_string(),
            finish_reason: FinishReason::Stop,
            tool_calls: None,
            cached: false,
            metadata: HashMap::new(),
        })
    }
}

/// Adapter serving weight files from a local directory
pub struct LocalWeightsAdapter {
    family: ProviderFamily,
    weights_dir: PathBuf,
    engine: Option<Arc<dyn LocalEngine>>,
}

impl LocalWeightsAdapter {
    pub fn new(family: ProviderFamily, weights_dir: impl Into<PathBuf>) -> Self {
        Self {
            family,
            weights_dir: weights_dir.into(),
            engine: None,
        }
    }

    pub fn with_engine(mut self, engine: Arc<dyn LocalEngine>) -> Self {
        self.engine = Some(engine);
        self
    }

    fn engine(&self) -> RouterResult<&Arc<dyn LocalEngine>> {
        self.engine.as_ref().ok_or_else(|| {
            RouterError::UpstreamPermanent("no local inference engine configured".into())
        })
    }

    fn resolve_path(&self, model_id: &str) -> PathBuf {
        let candidate = Path::new(model_id);
        if candidate.is_absolute() {
            candidate.to_path_buf()
        } else {
            self.weights_dir.join(model_id)
        }
    }
}

#[async_trait]
impl ProviderAdapter for LocalWeightsAdapter {
    fn family(&self) -> ProviderFamily {
        self.family
    }

    fn info(&self) -> AdapterInfo {
        AdapterInfo {
            name: self.family.to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            features: vec!["chat".into(), "format-sniffing".into()],
            pricing_table_hash: super::pricing_table_hash(&"local-zero-cost"),
            status: if self.engine.is_some() {
                "ready".into()
            } else {
                "no-engine".into()
            },
        }
    }

    async fn load(&self, model_id: &str, _options: &LoadOptions) -> RouterResult<ModelDescriptor> {
        let path = self.resolve_path(model_id);
        let mut file_header = [0u8; 16];
        let n = {
            use tokio::io::AsyncReadExt;
            let mut file = tokio::fs::File::open(&path).await.map_err(|e| {
                RouterError::NotFound(format!("weight file {}: {}", path.display(), e))
            })?;
            file.read(&mut file_header).await.map_err(|e| {
                RouterError::Internal(format!("read {}: {}", path.display(), e))
            })?
        };

        let format = sniff_format(&file_header[..n], &path)?;
        debug!("Sniffed {} as {:?}", path.display(), format);
        if format.family() != self.family {
            return Err(RouterError::UnsupportedFormat(format!(
                "{} holds a {:?} file, not servable by the {} adapter",
                path.display(),
                format,
                self.family
            )));
        }

        let mut descriptor = ModelDescriptor::new(self.family, model_id)
            .with_pricing(Pricing::new(0.0, 0.0))
            .with_limits(ModelLimits {
                context_tokens: 4096,
                max_output_tokens: 2048,
            })
            .with_quality(0.4);
        descriptor.metadata.insert(
            "weight_path".into(),
            serde_json::Value::String(path.display().to_string()),
        );
        descriptor.status = if self.engine.is_some() {
            ModelStatus::Ready
        } else {
            ModelStatus::Loading
        };
        info!("Loaded local model {} ({:?})", descriptor.id, format);
        Ok(descriptor)
    }

    async fn complete(
        &self,
        request: &AdapterRequest,
        descriptor: &ModelDescriptor,
    ) -> RouterResult<Response> {
        let started = Instant::now();
        let mut response = self.engine()?.generate(request, descriptor).await?;
        response.latency_ms = started.elapsed().as_millis() as u64;
        Ok(response)
    }

    async fn stream(
        &self,
        request: &AdapterRequest,
        descriptor: &ModelDescriptor,
    ) -> RouterResult<ChunkStream> {
        let response = self.complete(request, descriptor).await?;
        // Chunk the text on whitespace to approximate token-wise delivery
        let mut chunks: Vec<RouterResult<StreamChunk>> = response
            .text
            .split_inclusive(' ')
            .map(|piece| Ok(StreamChunk::delta(piece.to_string(), 0)))
            .collect();
        chunks.push(Ok(StreamChunk::done(
            Some(response.usage),
            Some(response.finish_reason),
        )));
        Ok(Box::pin(futures::stream::iter(chunks)))
    }

    async fn list_models(&self) -> RouterResult<Vec<ModelSummary>> {
        let mut models = Vec::new();
        let mut dir = match tokio::fs::read_dir(&self.weights_dir).await {
            Ok(dir) => dir,
            Err(_) => return Ok(models),
        };
        while let Ok(Some(entry)) = dir.next_entry().await {
            if let Some(name) = entry.file_name().to_str() {
                models.push(ModelSummary {
                    id: name.to_string(),
                    provider: self.family.to_string(),
                    context_tokens: None,
                    description: None,
                });
            }
        }
        Ok(models)
    }

    async fn unload(&self, descriptor_id: &str) -> RouterResult<()> {
        info!("Unloaded local model {}", descriptor_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ChatMessage;

    #[test]
    fn test_sniff_gguf() {
        let header = b"GGUF\x03\x00\x00\x00rest";
        assert_eq!(
            sniff_format(header, Path::new("model.gguf")).unwrap(),
            WeightFormat::Gguf
        );
    }

    #[test]
    fn test_sniff_pytorch_zip() {
        let header = b"PK\x03\x04rest-of-zip";
        assert_eq!(
            sniff_format(header, Path::new("model.pt")).unwrap(),
            WeightFormat::PyTorchZip
        );
    }

    #[test]
    fn test_sniff_safetensors() {
        // 8-byte little-endian header length then JSON
        let mut header = vec![0u8; 8];
        header[0] = 42;
        header.push(b'{');
        header.extend_from_slice(b"\"meta\":{}}");
        assert_eq!(
            sniff_format(&header, Path::new("model.safetensors")).unwrap(),
            WeightFormat::Safetensors
        );
    }

    #[test]
    fn test_sniff_onnx_by_extension_and_protobuf() {
        let header = [0x08u8, 0x07, 0x12];
        assert_eq!(
            sniff_format(&header, Path::new("model.onnx")).unwrap(),
            WeightFormat::Onnx
        );
        // Same bytes without the extension stay unrecognized
        assert!(sniff_format(&header, Path::new("model.bin")).is_err());
    }

    #[test]
    fn test_sniff_unknown_rejected() {
        assert!(matches!(
            sniff_format(b"\x7fELF", Path::new("model.bin")),
            Err(RouterError::UnsupportedFormat(_))
        ));
    }

    async fn write_gguf(dir: &Path, name: &str) {
        let mut bytes = b"GGUF".to_vec();
        bytes.extend_from_slice(&[3, 0, 0, 0]);
        tokio::fs::write(dir.join(name), bytes).await.unwrap();
    }

    #[tokio::test]
    async fn test_load_sniffs_and_builds_descriptor() {
        let dir = tempfile::tempdir().unwrap();
        write_gguf(dir.path(), "tiny.gguf").await;

        let adapter = LocalWeightsAdapter::new(ProviderFamily::LocalGguf, dir.path())
            .with_engine(Arc::new(EchoEngine));
        let descriptor = adapter.load("tiny.gguf", &LoadOptions::default()).await.unwrap();
        assert_eq!(descriptor.provider, ProviderFamily::LocalGguf);
        assert_eq!(descriptor.pricing.input_per_mtok, 0.0);
        assert_eq!(descriptor.status, ModelStatus::Ready);
        assert!(descriptor.metadata.contains_key("weight_path"));
    }

    #[tokio::test]
    async fn test_load_missing_file_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let adapter = LocalWeightsAdapter::new(ProviderFamily::LocalGguf, dir.path());
        assert!(matches!(
            adapter.load("absent.gguf", &LoadOptions::default()).await,
            Err(RouterError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_wrong_family_rejected() {
        let dir = tempfile::tempdir().unwrap();
        write_gguf(dir.path(), "tiny.gguf").await;
        let adapter = LocalWeightsAdapter::new(ProviderFamily::LocalOnnx, dir.path());
        assert!(matches!(
            adapter.load("tiny.gguf", &LoadOptions::default()).await,
            Err(RouterError::UnsupportedFormat(_))
        ));
    }

    #[tokio::test]
    async fn test_complete_without_engine_fails_cleanly() {
        let dir = tempfile::tempdir().unwrap();
        write_gguf(dir.path(), "tiny.gguf").await;
        let adapter = LocalWeightsAdapter::new(ProviderFamily::LocalGguf, dir.path());
        let descriptor = adapter.load("tiny.gguf", &LoadOptions::default()).await.unwrap();

        let request = AdapterRequest {
            request_id: uuid::Uuid::new_v4(),
            messages: vec![ChatMessage::user("hi")],
            options: Default::default(),
            api_key: String::new(),
        };
        assert!(matches!(
            adapter.complete(&request, &descriptor).await,
            Err(RouterError::UpstreamPermanent(_))
        ));
    }

    #[tokio::test]
    async fn test_echo_engine_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        write_gguf(dir.path(), "tiny.gguf").await;
        let adapter = LocalWeightsAdapter::new(ProviderFamily::LocalGguf, dir.path())
            .with_engine(Arc::new(EchoEngine));
        let descriptor = adapter.load("tiny.gguf", &LoadOptions::default()).await.unwrap();

        let request = AdapterRequest {
            request_id: uuid::Uuid::new_v4(),
            messages: vec![ChatMessage::user("hello local")],
            options: Default::default(),
            api_key: String::new(),
        };
        let response = adapter.complete(&request, &descriptor).await.unwrap();
        assert_eq!(response.text, "echo: hello local");
        assert_eq!(response.cost, 0.0);

        use futures::StreamExt;
        let mut stream = adapter.stream(&request, &descriptor).await.unwrap();
        let mut text = String::new();
        let mut saw_done = false;
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.unwrap();
            if let Some(delta) = chunk.delta {
                text.push_str(&delta);
            }
            if chunk.done {
                saw_done = true;
            }
        }
        assert_eq!(text, "echo: hello local");
        assert!(saw_done);
    }
}
