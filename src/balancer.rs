//! Load accounting across registered models
//!
//! A slot is acquired at dispatch and released on every exit path via the
//! RAII guard. A periodic decay pass multiplies all counters by 0.9 so a
//! transient spike does not pin a model as hot indefinitely.

use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::registry::ModelRegistry;

/// Counter decay factor applied every interval
const DECAY_FACTOR: f64 = 0.9;
/// Default decay interval
pub const DEFAULT_DECAY_INTERVAL: Duration = Duration::from_secs(60);

/// Stateful per-model load counter store, backed by the registry entries
pub struct LoadBalancer {
    registry: Arc<ModelRegistry>,
}

impl LoadBalancer {
    pub fn new(registry: Arc<ModelRegistry>) -> Self {
        Self { registry }
    }

    /// Acquire a load slot for a model; released when the guard drops
    pub fn acquire(&self, model_id: &str) -> LoadSlot {
        self.registry.update_load(model_id, 1);
        LoadSlot {
            registry: Arc::clone(&self.registry),
            model_id: model_id.to_string(),
        }
    }

    /// Fold a completed dispatch latency into the model's EMA
    pub fn record_latency(&self, model_id: &str, sample_ms: f64) {
        self.registry.record_latency(model_id, sample_ms);
    }

    /// Spawn the periodic decay task; aborted when the handle drops
    pub fn spawn_decay_task(&self, interval: Duration) -> JoinHandle<()> {
        let registry = Arc::clone(&self.registry);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            // First tick fires immediately; skip it
            ticker.tick().await;
            loop {
                ticker.tick().await;
                debug!("Decaying load counters by {}", DECAY_FACTOR);
                registry.decay_loads(DECAY_FACTOR);
            }
        })
    }
}

/// RAII load slot; dropping it releases the slot on all exit paths
pub struct LoadSlot {
    registry: Arc<ModelRegistry>,
    model_id: String,
}

impl LoadSlot {
    pub fn model_id(&self) -> &str {
        &self.model_id
    }
}

impl Drop for LoadSlot {
    fn drop(&mut self) {
        self.registry.update_load(&self.model_id, -1);
    }
}
