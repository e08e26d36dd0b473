//! In-process metric counters and histograms
//!
//! Counters are lock-free atomics; the snapshot is a plain serializable
//! struct the host can scrape or log. Latency lands in fixed histogram
//! buckets.

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

/// Upper bounds (ms) of the latency histogram buckets; the last bucket is +inf
const LATENCY_BUCKETS_MS: [u64; 10] = [25, 50, 100, 250, 500, 1000, 2500, 5000, 10_000, 30_000];

/// Metric registry shared across the pipeline
pub struct Metrics {
    requests_total: AtomicU64,
    errors_total: DashMap<&'static str, u64>,
    prompt_tokens_total: AtomicU64,
    completion_tokens_total: AtomicU64,
    cost_total_microdollars: AtomicU64,
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,
    latency_buckets: [AtomicU64; 11],
    latency_sum_ms: AtomicU64,
    latency_count: AtomicU64,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            requests_total: AtomicU64::new(0),
            errors_total: DashMap::new(),
            prompt_tokens_total: AtomicU64::new(0),
            completion_tokens_total: AtomicU64::new(0),
            cost_total_microdollars: AtomicU64::new(0),
            cache_hits: AtomicU64::new(0),
            cache_misses: AtomicU64::new(0),
            latency_buckets: Default::default(),
            latency_sum_ms: AtomicU64::new(0),
            latency_count: AtomicU64::new(0),
        }
    }

    pub fn record_request(&self) {
        self.requests_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_error(&self, kind: &'static str) {
        *self.errors_total.entry(kind).or_insert(0) += 1;
    }

    pub fn record_usage(&self, prompt_tokens: u32, completion_tokens: u32, cost: f64) {
        self.prompt_tokens_total
            .fetch_add(prompt_tokens as u64, Ordering::Relaxed);
        self.completion_tokens_total
            .fetch_add(completion_tokens as u64, Ordering::Relaxed);
        self.cost_total_microdollars
            .fetch_add((cost * 1_000_000.0) as u64, Ordering::Relaxed);
    }

    pub fn record_latency(&self, latency_ms: u64) {
        let idx = LATENCY_BUCKETS_MS
            .iter()
            .position(|&bound| latency_ms <= bound)
            .unwrap_or(LATENCY_BUCKETS_MS.len());
        self.latency_buckets[idx].fetch_add(1, Ordering::Relaxed);
        self.latency_sum_ms.fetch_add(latency_ms, Ordering::Relaxed);
        self.latency_count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_cache(&self, hit: bool) {
        if hit {
            self.cache_hits.fetch_add(1, Ordering::Relaxed);
        } else {
            self.cache_misses.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Point-in-time copy of every counter
    pub fn snapshot(&self) -> MetricsSnapshot {
        let mut errors = HashMap::new();
        for entry in self.errors_total.iter() {
            errors.insert(entry.key().to_string(), *entry.value());
        }
        let mut buckets = Vec::with_capacity(11);
        for (i, counter) in self.latency_buckets.iter().enumerate() {
            buckets.push(LatencyBucket {
                le_ms: LATENCY_BUCKETS_MS.get(i).copied(),
                count: counter.load(Ordering::Relaxed),
            });
        }
        MetricsSnapshot {
            requests_total: self.requests_total.load(Ordering::Relaxed),
            errors_total: errors,
            prompt_tokens_total: self.prompt_tokens_total.load(Ordering::Relaxed),
            completion_tokens_total: self.completion_tokens_total.load(Ordering::Relaxed),
            cost_total_usd: self.cost_total_microdollars.load(Ordering::Relaxed) as f64
                / 1_000_000.0,
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            cache_misses: self.cache_misses.load(Ordering::Relaxed),
            latency: buckets,
            latency_mean_ms: {
                let count = self.latency_count.load(Ordering::Relaxed);
                if count == 0 {
                    0.0
                } else {
                    self.latency_sum_ms.load(Ordering::Relaxed) as f64 / count as f64
                }
            },
        }
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LatencyBucket {
    /// Bucket upper bound in milliseconds; `None` is the +inf bucket
    pub le_ms: Option<u64>,
    pub count: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub requests_total: u64,
    pub errors_total: HashMap<String, u64>,
    pub prompt_tokens_total: u64,
    pub completion_tokens_total: u64,
    pub cost_total_usd: f64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub latency: Vec<LatencyBucket>,
    pub latency_mean_ms: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_accumulate() {
        let metrics = Metrics::new();
        metrics.record_request();
        metrics.record_request();
        metrics.record_usage(100, 50, 0.0125);
        metrics.record_error("upstream_transient");
        metrics.record_error("upstream_transient");
        metrics.record_cache(true);
        metrics.record_cache(false);

        let snap = metrics.snapshot();
        assert_eq!(snap.requests_total, 2);
        assert_eq!(snap.prompt_tokens_total, 100);
        assert_eq!(snap.completion_tokens_total, 50);
        assert_eq!(snap.errors_total["upstream_transient"], 2);
        assert_eq!(snap.cache_hits, 1);
        assert_eq!(snap.cache_misses, 1);
        assert!((snap.cost_total_usd - 0.0125).abs() < 1e-9);
    }

    #[test]
    fn test_latency_bucketing() {
        let metrics = Metrics::new();
        metrics.record_latency(10); // le 25
        metrics.record_latency(400); // le 500
        metrics.record_latency(120_000); // +inf

        let snap = metrics.snapshot();
        assert_eq!(snap.latency[0].count, 1);
        let b500 = snap
            .latency
            .iter()
            .find(|b| b.le_ms == Some(500))
            .unwrap();
        assert_eq!(b500.count, 1);
        assert_eq!(snap.latency.last().unwrap().count, 1);
        assert!(snap.latency_mean_ms > 0.0);
    }
}
