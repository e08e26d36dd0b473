//! Two-tier response cache: exact fingerprint and semantic similarity
//!
//! The exact tier keys on a SHA-256 fingerprint over the canonicalized
//! request tuple. On an exact miss the semantic tier scans the most recent
//! live entries for an embedding whose cosine similarity clears the
//! threshold. Entries carry a TTL classified by request kind; expired
//! entries are evicted lazily on lookup and are invisible to the semantic
//! scan. Creative requests are never cached and never answered
//! semantically.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

use crate::adapters::hex_string;
use crate::types::{ChatMessage, RequestOptions, Response};

/// Embedding dimensionality for the hash-bag vectors
const EMBED_DIM: usize = 256;
/// Default similarity threshold for semantic hits
pub const DEFAULT_SIMILARITY_THRESHOLD: f32 = 0.9;
/// How many recent entries the semantic scan considers
const SEMANTIC_SCAN_DEPTH: usize = 64;

const STOPWORDS: [&str; 24] = [
    "a", "an", "and", "are", "as", "at", "be", "by", "do", "does", "for", "in", "is", "it", "of",
    "on", "or", "that", "the", "this", "to", "was", "what", "with",
];

/// Request classification driving cache TTL
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum RequestKind {
    Factual,
    Analytical,
    Creative,
    Default,
}

impl RequestKind {
    /// Heuristic classification from the prompt text
    pub fn classify(prompt: &str) -> Self {
        let lowered = prompt.to_ascii_lowercase();
        for marker in [
            "write", "compose", "imagine", "poem", "story", "haiku", "draft", "brainstorm",
        ] {
            if lowered.contains(marker) {
                return RequestKind::Creative;
            }
        }
        for marker in ["analyze", "analyse", "compare", "evaluate", "why does", "why is"] {
            if lowered.contains(marker) {
                return RequestKind::Analytical;
            }
        }
        let trimmed = lowered.trim();
        if trimmed.ends_with('?')
            || ["what", "who", "when", "where", "which", "how"]
                .iter()
                .any(|w| trimmed.starts_with(w))
        {
            return RequestKind::Factual;
        }
        RequestKind::Default
    }

    /// TTL for this class; `None` means never cache
    pub fn ttl(&self, default_ttl: Duration) -> Option<Duration> {
        match self {
            RequestKind::Factual => Some(Duration::from_secs(24 * 3600)),
            RequestKind::Analytical => Some(Duration::from_secs(3600)),
            RequestKind::Creative => None,
            RequestKind::Default => Some(default_ttl),
        }
    }
}

/// Exact fingerprint over the fields that deterministically affect output
pub fn fingerprint(
    provider: &str,
    model_id: &str,
    messages: &[ChatMessage],
    options: &RequestOptions,
) -> String {
    let mut hasher = Sha256::new();
    hasher.update(provider.as_bytes());
    hasher.update([0]);
    hasher.update(model_id.as_bytes());
    hasher.update([0]);
    for message in messages {
        hasher.update(serde_json::to_vec(message).unwrap_or_default());
        hasher.update([0]);
    }
    // Only the generation-affecting option subset participates
    let subset = serde_json::json!({
        "max_tokens": options.max_tokens,
        "temperature": options.temperature,
        "top_p": options.top_p,
        "top_k": options.top_k,
        "stop_sequences": options.stop_sequences,
        "frequency_penalty": options.frequency_penalty,
        "presence_penalty": options.presence_penalty,
        "response_format": options.response_format,
        "seed": options.seed,
        "tools": options.tools,
        "tool_choice": options.tool_choice,
    });
    hasher.update(serde_json::to_vec(&subset).unwrap_or_default());
    hex_string(&hasher.finalize())
}

/// Cheap hash-bag embedding: stopword-filtered words hashed into a fixed
/// dimension, L2-normalized.
pub fn embed(text: &str) -> Vec<f32> {
    use std::collections::hash_map::DefaultHasher;
    use std::hash::{Hash, Hasher};

    let mut vector = vec![0f32; EMBED_DIM];
    for word in text
        .to_ascii_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty() && !STOPWORDS.contains(w))
    {
        let mut hasher = DefaultHasher::new();
        word.hash(&mut hasher);
        vector[(hasher.finish() % EMBED_DIM as u64) as usize] += 1.0;
    }
    let norm = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
    if norm > 0.0 {
        for v in &mut vector {
            *v /= norm;
        }
    }
    vector
}

pub fn cosine(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

struct CacheEntry {
    response: Response,
    embedding: Vec<f32>,
    kind: RequestKind,
    created: Instant,
    ttl: Duration,
    sequence: u64,
}

impl CacheEntry {
    fn is_live(&self, now: Instant) -> bool {
        now.duration_since(self.created) < self.ttl
    }
}

/// Cache hit, exact or semantic
#[derive(Debug, Clone)]
pub struct CacheHit {
    pub response: Response,
    /// Cosine similarity for semantic hits; `None` for exact hits
    pub similarity: Option<f32>,
    pub kind: RequestKind,
}

/// Counters exposed to observability
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub size: usize,
    pub hit_rate: f64,
    pub cost_saved_usd: f64,
}

struct CacheInner {
    entries: HashMap<String, CacheEntry>,
    sequence: u64,
    hits: u64,
    misses: u64,
    cost_saved_microdollars: u64,
}

/// Bounded LRU with exact and semantic lookup tiers
pub struct SemanticCache {
    inner: Mutex<CacheInner>,
    capacity: usize,
    default_ttl: Duration,
    threshold: f32,
}

impl SemanticCache {
    pub fn new(capacity: usize, default_ttl: Duration, threshold: f32) -> Self {
        Self {
            inner: Mutex::new(CacheInner {
                entries: HashMap::new(),
                sequence: 0,
                hits: 0,
                misses: 0,
                cost_saved_microdollars: 0,
            }),
            capacity,
            default_ttl,
            threshold,
        }
    }

    /// Exact lookup, then semantic scan over the most recent live entries.
    /// Expired entries encountered on the way are evicted.
    pub fn lookup(&self, fp: &str, prompt: &str) -> Option<CacheHit> {
        let kind = RequestKind::classify(prompt);
        let now = Instant::now();
        let mut inner = self.inner.lock().expect("cache mutex");

        // Exact tier; clone out of the map so eviction below can mutate it
        let exact = inner
            .entries
            .get(fp)
            .map(|e| (e.is_live(now), e.response.clone(), e.kind));
        match exact {
            Some((true, response, entry_kind)) => {
                inner.sequence += 1;
                let seq = inner.sequence;
                if let Some(entry) = inner.entries.get_mut(fp) {
                    entry.sequence = seq;
                }
                inner.hits += 1;
                inner.cost_saved_microdollars += (response.cost * 1_000_000.0) as u64;
                debug!("Exact cache hit for {}", &fp[..12.min(fp.len())]);
                return Some(CacheHit {
                    response,
                    similarity: None,
                    kind: entry_kind,
                });
            }
            Some((false, _, _)) => {
                inner.entries.remove(fp);
            }
            None => {}
        }

        // Semantic tier; disabled for creative prompts
        if kind != RequestKind::Creative {
            let query = embed(prompt);
            let mut recent: Vec<(&String, &CacheEntry)> = inner
                .entries
                .iter()
                .filter(|(_, e)| e.is_live(now) && e.kind != RequestKind::Creative)
                .collect();
            recent.sort_by(|a, b| b.1.sequence.cmp(&a.1.sequence));

            let best = recent
                .into_iter()
                .take(SEMANTIC_SCAN_DEPTH)
                .map(|(key, entry)| (key.clone(), cosine(&query, &entry.embedding)))
                .filter(|(_, similarity)| *similarity >= self.threshold)
                .max_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal));

            if let Some((key, similarity)) = best {
                let (response, entry_kind) = {
                    let entry = inner.entries.get(&key).expect("entry present");
                    (entry.response.clone(), entry.kind)
                };
                inner.hits += 1;
                inner.cost_saved_microdollars += (response.cost * 1_000_000.0) as u64;
                debug!("Semantic cache hit (similarity {:.3})", similarity);
                return Some(CacheHit {
                    response,
                    similarity: Some(similarity),
                    kind: entry_kind,
                });
            }
        }

        inner.misses += 1;
        None
    }

    /// Insert a successful response. Creative responses are dropped; writes
    /// for a fingerprint are serialized under the cache lock,
    /// last-writer-wins.
    pub fn insert(&self, fp: String, prompt: &str, response: Response) {
        let kind = RequestKind::classify(prompt);
        let Some(ttl) = kind.ttl(self.default_ttl) else {
            return;
        };
        let embedding = embed(prompt);
        let now = Instant::now();
        let mut inner = self.inner.lock().expect("cache mutex");
        inner.sequence += 1;
        let sequence = inner.sequence;
        inner.entries.insert(
            fp,
            CacheEntry {
                response,
                embedding,
                kind,
                created: now,
                ttl,
                sequence,
            },
        );

        // Bounded size: evict least-recently-used
        while inner.entries.len() > self.capacity {
            if let Some(oldest) = inner
                .entries
                .iter()
                .min_by_key(|(_, e)| e.sequence)
                .map(|(k, _)| k.clone())
            {
                inner.entries.remove(&oldest);
            } else {
                break;
            }
        }
    }

    pub fn stats(&self) -> CacheStats {
        let inner = self.inner.lock().expect("cache mutex");
        let total = inner.hits + inner.misses;
        CacheStats {
            hits: inner.hits,
            misses: inner.misses,
            size: inner.entries.len(),
            hit_rate: if total == 0 {
                0.0
            } else {
                inner.hits as f64 / total as f64
            },
            cost_saved_usd: inner.cost_saved_microdollars as f64 / 1_000_000.0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{FinishReason, TokenUsage};

    fn response(text: &str) -> Response {
        Response {
            text: text.to_string(),
            usage: TokenUsage::new(10, 5),
            cost: 0.002,
            latency_ms: 40,
            model: "gpt-4o".into(),
            provider: "openai".into(),
            finish_reason: FinishReason::Stop,
            tool_calls: None,
            cached: false,
            metadata: HashMap::new(),
        }
    }

    fn cache() -> SemanticCache {
        SemanticCache::new(
            128,
            Duration::from_secs(1800),
            DEFAULT_SIMILARITY_THRESHOLD,
        )
    }

    #[test]
    fn test_kind_classification() {
        assert_eq!(
            RequestKind::classify("What is the capital of France?"),
            RequestKind::Factual
        );
        assert_eq!(
            RequestKind::classify("Write a haiku about rust"),
            RequestKind::Creative
        );
        assert_eq!(
            RequestKind::classify("Compare TCP and UDP for streaming"),
            RequestKind::Analytical
        );
        assert_eq!(
            RequestKind::classify("Summarize the attached report"),
            RequestKind::Default
        );
    }

    #[test]
    fn test_ttl_classes() {
        let default_ttl = Duration::from_secs(1800);
        assert_eq!(
            RequestKind::Factual.ttl(default_ttl),
            Some(Duration::from_secs(86_400))
        );
        assert_eq!(
            RequestKind::Analytical.ttl(default_ttl),
            Some(Duration::from_secs(3600))
        );
        assert_eq!(RequestKind::Creative.ttl(default_ttl), None);
        assert_eq!(RequestKind::Default.ttl(default_ttl), Some(default_ttl));
    }

    #[test]
    fn test_fingerprint_sensitivity() {
        let messages = vec![ChatMessage::user("hello")];
        let mut options = RequestOptions::default();
        let base = fingerprint("openai", "gpt-4o", &messages, &options);

        assert_eq!(
            base,
            fingerprint("openai", "gpt-4o", &messages, &options)
        );
        assert_ne!(base, fingerprint("groq", "gpt-4o", &messages, &options));

        options.temperature = Some(0.9);
        assert_ne!(base, fingerprint("openai", "gpt-4o", &messages, &options));

        // Stream flag does not affect output, so it is outside the subset
        let mut stream_options = RequestOptions::default();
        stream_options.stream = true;
        assert_eq!(
            base,
            fingerprint("openai", "gpt-4o", &messages, &stream_options)
        );
    }

    #[tokio::test]
    async fn test_exact_hit_round_trip() {
        let cache = cache();
        let fp = "fp-1".to_string();
        let original = response("Paris");
        cache.insert(fp.clone(), "What is the capital of France?", original.clone());

        let hit = cache
            .lookup(&fp, "What is the capital of France?")
            .expect("hit");
        assert!(hit.similarity.is_none());
        assert_eq!(hit.response.text, original.text);
        assert_eq!(hit.response.usage, original.usage);
        assert_eq!(hit.kind, RequestKind::Factual);
    }

    #[tokio::test]
    async fn test_semantic_hit_across_paraphrase() {
        let cache = cache();
        cache.insert(
            "fp-1".into(),
            "What is the capital of France?",
            response("Paris"),
        );

        let hit = cache
            .lookup("fp-other", "capital of france?")
            .expect("semantic hit");
        let similarity = hit.similarity.expect("semantic");
        assert!(similarity >= 0.9, "similarity {}", similarity);
        assert_eq!(hit.response.text, "Paris");
        assert_eq!(hit.kind, RequestKind::Factual);
    }

    #[tokio::test]
    async fn test_unrelated_prompt_misses() {
        let cache = cache();
        cache.insert(
            "fp-1".into(),
            "What is the capital of France?",
            response("Paris"),
        );
        assert!(cache
            .lookup("fp-other", "How do rust lifetimes work?")
            .is_none());
    }

    #[tokio::test]
    async fn test_creative_never_cached() {
        let cache = cache();
        cache.insert("fp-haiku".into(), "Write a haiku about rust", response("..."));
        assert!(cache.lookup("fp-haiku", "Write a haiku about rust").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_ttl_expiry_evicts_exact_and_semantic() {
        let cache = SemanticCache::new(
            128,
            Duration::from_secs(60),
            DEFAULT_SIMILARITY_THRESHOLD,
        );
        cache.insert("fp-1".into(), "Summarize the report", response("summary"));
        assert!(cache.lookup("fp-1", "Summarize the report").is_some());

        tokio::time::advance(Duration::from_secs(61)).await;
        // Expired: invisible to both tiers
        assert!(cache.lookup("fp-1", "Summarize the report").is_none());
        assert!(cache.lookup("fp-2", "Summarize the report").is_none());
    }

    #[tokio::test]
    async fn test_lru_eviction_at_capacity() {
        let cache = SemanticCache::new(2, Duration::from_secs(1800), 0.99);
        cache.insert("fp-a".into(), "alpha facts one", response("a"));
        cache.insert("fp-b".into(), "beta facts two", response("b"));
        // Touch a so b becomes the eviction candidate
        assert!(cache.lookup("fp-a", "alpha facts one").is_some());
        cache.insert("fp-c".into(), "gamma facts three", response("c"));

        assert!(cache.lookup("fp-a", "alpha facts one").is_some());
        assert!(cache.lookup("fp-b", "beta facts two").is_none());
        assert!(cache.lookup("fp-c", "gamma facts three").is_some());
    }

    #[tokio::test]
    async fn test_stats_accumulate() {
        let cache = cache();
        cache.insert("fp-1".into(), "What is two plus two?", response("4"));
        cache.lookup("fp-1", "What is two plus two?");
        cache.lookup("fp-miss", "Completely unrelated query zzz");

        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.size, 1);
        assert!((stats.hit_rate - 0.5).abs() < 1e-9);
        assert!(stats.cost_saved_usd > 0.0);
    }
}
