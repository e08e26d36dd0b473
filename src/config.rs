//! Router configuration loaded from the environment
//!
//! All keys are plain environment variables; a `.env` file is honored when
//! present. Unknown or malformed values fall back to defaults with a warning
//! rather than failing startup.

use std::path::PathBuf;
use tracing::warn;

use crate::router::RoutingStrategy;

/// Typed settings for the router core
#[derive(Debug, Clone)]
pub struct RouterSettings {
    /// Upper bound on registered model descriptors
    pub max_models: usize,
    /// Strategy used when the request does not name one
    pub default_strategy: RoutingStrategy,
    pub cache_enabled: bool,
    /// Default-class cache TTL in milliseconds
    pub cache_ttl_ms: u64,
    /// Process-wide concurrent request ceiling
    pub max_concurrent: usize,
    pub log_level: String,
    /// Comma-separated API keys seeded into the key store at startup
    pub api_keys_seed: Vec<String>,
    /// CORS origins, parsed for the host server's benefit; unused by the core
    pub allowed_origins: Vec<String>,
    pub data_dir: PathBuf,
    pub max_fallback_depth: usize,
    /// Unary request deadline in milliseconds
    pub default_timeout_ms: u64,
    /// Streaming request deadline in milliseconds
    pub stream_timeout_ms: u64,
}

impl Default for RouterSettings {
    fn default() -> Self {
        Self {
            max_models: 10,
            default_strategy: RoutingStrategy::Balanced,
            cache_enabled: true,
            cache_ttl_ms: 30 * 60 * 1000,
            max_concurrent: 64,
            log_level: "info".to_string(),
            api_keys_seed: Vec::new(),
            allowed_origins: Vec::new(),
            data_dir: PathBuf::from("./data"),
            max_fallback_depth: 3,
            default_timeout_ms: 30_000,
            stream_timeout_ms: 60_000,
        }
    }
}

impl RouterSettings {
    /// Load settings from the process environment, honoring `.env`
    pub fn from_env() -> Self {
        let _ = dotenv::dotenv();
        let defaults = Self::default();

        let strategy = env_str("ROUTING_STRATEGY")
            .or_else(|| env_str("DEFAULT_STRATEGY"))
            .and_then(|s| match s.parse::<RoutingStrategy>() {
                Ok(v) => Some(v),
                Err(_) => {
                    warn!("Unknown routing strategy '{}', using balanced", s);
                    None
                }
            })
            .unwrap_or(defaults.default_strategy);

        Self {
            max_models: env_parse("MAX_MODELS", defaults.max_models),
            default_strategy: strategy,
            cache_enabled: env_parse("CACHE_ENABLED", defaults.cache_enabled),
            cache_ttl_ms: env_parse("CACHE_TTL", defaults.cache_ttl_ms),
            max_concurrent: env_parse("MAX_CONCURRENT", defaults.max_concurrent),
            log_level: env_str("LOG_LEVEL").unwrap_or(defaults.log_level),
            api_keys_seed: env_list("API_KEYS"),
            allowed_origins: env_list("ALLOWED_ORIGINS"),
            data_dir: env_str("DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.data_dir),
            max_fallback_depth: env_parse("MAX_FALLBACK_DEPTH", defaults.max_fallback_depth),
            default_timeout_ms: env_parse("REQUEST_TIMEOUT_MS", defaults.default_timeout_ms),
            stream_timeout_ms: env_parse("STREAM_TIMEOUT_MS", defaults.stream_timeout_ms),
        }
    }

    /// Install a tracing subscriber honoring `LOG_LEVEL` / `RUST_LOG`
    pub fn init_tracing(&self) {
        let filter = tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(self.log_level.clone()));
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .try_init();
    }
}

fn env_str(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.is_empty())
}

fn env_parse<T: std::str::FromStr + Copy>(key: &str, default: T) -> T {
    match env_str(key) {
        Some(raw) => raw.parse().unwrap_or_else(|_| {
            warn!("Invalid value for {}: '{}', using default", key, raw);
            default
        }),
        None => default,
    }
}

fn env_list(key: &str) -> Vec<String> {
    env_str(key)
        .map(|v| {
            v.split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect()
        })
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let settings = RouterSettings::default();
        assert_eq!(settings.max_models, 10);
        assert_eq!(settings.default_strategy, RoutingStrategy::Balanced);
        assert_eq!(settings.max_fallback_depth, 3);
        assert_eq!(settings.default_timeout_ms, 30_000);
        assert_eq!(settings.stream_timeout_ms, 60_000);
    }

    #[test]
    fn test_env_list_parsing() {
        std::env::set_var("SWITCHBOARD_TEST_LIST", "sk-a, sk-b,,sk-c");
        let list = env_list("SWITCHBOARD_TEST_LIST");
        assert_eq!(list, vec!["sk-a", "sk-b", "sk-c"]);
        std::env::remove_var("SWITCHBOARD_TEST_LIST");
    }
}
