//! Runtime configuration
//!
//! Every knob is supplied externally. `AppConfig::from_env` reads the
//! process environment (after `dotenv`), falling back to defaults.

use crate::error::OrchestrationError;
use crate::models::CacheType;
use crate::Result;
use std::collections::HashMap;
use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Limits for a single cache store.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StoreConfig {
    pub default_ttl: Duration,
    pub max_entries: usize,
}

#[derive(Debug, Clone)]
pub struct CacheConfig {
    pub stores: HashMap<CacheType, StoreConfig>,
    /// Below this hit rate a store reports degraded.
    pub min_hit_rate: f64,
    /// Above this evictions-per-insert ratio a store reports degraded.
    pub max_eviction_rate: f64,
    /// Lookups required before the hit-rate alarm is considered.
    pub min_samples: u64,
}

impl CacheConfig {
    pub fn store(&self, cache_type: CacheType) -> StoreConfig {
        self.stores
            .get(&cache_type)
            .copied()
            .unwrap_or_else(|| default_store_config(cache_type))
    }
}

fn default_store_config(cache_type: CacheType) -> StoreConfig {
    let (ttl_secs, max_entries) = match cache_type {
        CacheType::Quote => (300, 1_000),
        CacheType::Search => (900, 500),
        CacheType::News => (600, 500),
        CacheType::Embedding => (3_600, 2_000),
    };
    StoreConfig {
        default_ttl: Duration::from_secs(ttl_secs),
        max_entries,
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            stores: CacheType::ALL
                .iter()
                .map(|t| (*t, default_store_config(*t)))
                .collect(),
            min_hit_rate: 0.2,
            max_eviction_rate: 0.5,
            min_samples: 50,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    pub worker_pool_size: usize,
    pub default_timeout: Duration,
    /// Per tool kind budgets.
    pub timeouts: HashMap<CacheType, Duration>,
    /// Per tool name overrides; win over `timeouts`.
    pub tool_timeouts: HashMap<String, Duration>,
}

impl ExecutorConfig {
    pub fn timeout_for(&self, tool_name: &str, cache_type: CacheType) -> Duration {
        self.tool_timeouts
            .get(tool_name)
            .or_else(|| self.timeouts.get(&cache_type))
            .copied()
            .unwrap_or(self.default_timeout)
    }
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        let timeouts = HashMap::from([
            (CacheType::Quote, Duration::from_secs(5)),
            (CacheType::Search, Duration::from_secs(15)),
            (CacheType::News, Duration::from_secs(15)),
            (CacheType::Embedding, Duration::from_secs(10)),
        ]);
        Self {
            worker_pool_size: 8,
            default_timeout: Duration::from_secs(10),
            timeouts,
            tool_timeouts: HashMap::new(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SelectorConfig {
    /// Minimum classifier confidence to keep a tool (θ).
    pub threshold: f32,
    /// Maximum number of candidates returned (K).
    pub max_candidates: usize,
    /// Top score below this triggers the lexical fallback.
    pub fallback_threshold: f32,
    pub latency_budget: Duration,
    /// Tool names offered when the selector degrades. Empty = whole catalog.
    pub default_tools: Vec<String>,
    /// Trained classifier file; `None` derives one from the registry.
    pub classifier_model_path: Option<PathBuf>,
}

impl Default for SelectorConfig {
    fn default() -> Self {
        Self {
            threshold: 0.30,
            max_candidates: 5,
            fallback_threshold: 0.15,
            latency_budget: Duration::from_millis(800),
            default_tools: Vec::new(),
            classifier_model_path: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct StreamConfig {
    pub buffer_capacity: usize,
    /// How long a terminal event waits for buffer space before each
    /// slow-consumer warning. Terminal events keep waiting until the
    /// client reads or disconnects.
    pub slow_consumer_warning: Duration,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            buffer_capacity: 64,
            slow_consumer_warning: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct AppConfig {
    pub port: u16,
    pub cache: CacheConfig,
    pub executor: ExecutorConfig,
    pub selector: SelectorConfig,
    pub stream: StreamConfig,
    pub gemini_api_key: Option<String>,
    pub financial_api_base_url: Option<String>,
}

impl AppConfig {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        let mut config = AppConfig {
            port: 8080,
            ..Default::default()
        };

        if let Some(port) = env_parse::<u16>("PORT")?.or(env_parse::<u16>("API_PORT")?) {
            config.port = port;
        }

        if let Some(size) = env_parse::<usize>("WORKER_POOL_SIZE")? {
            if size == 0 {
                return Err(OrchestrationError::ConfigError(
                    "WORKER_POOL_SIZE must be at least 1".to_string(),
                ));
            }
            config.executor.worker_pool_size = size;
        }
        if let Some(ms) = env_parse::<u64>("TOOL_TIMEOUT_DEFAULT_MS")? {
            config.executor.default_timeout = Duration::from_millis(ms);
        }

        for cache_type in CacheType::ALL {
            let upper = cache_type.as_str().to_uppercase();
            let mut store = config.cache.store(cache_type);

            if let Some(secs) = env_parse::<u64>(&format!("CACHE_TTL_{}_SECS", upper))? {
                store.default_ttl = Duration::from_secs(secs);
            }
            if let Some(max) = env_parse::<usize>(&format!("CACHE_MAX_{}", upper))? {
                store.max_entries = max.max(1);
            }
            config.cache.stores.insert(cache_type, store);

            if let Some(ms) = env_parse::<u64>(&format!("TOOL_TIMEOUT_{}_MS", upper))? {
                config
                    .executor
                    .timeouts
                    .insert(cache_type, Duration::from_millis(ms));
            }
        }

        if let Some(v) = env_parse::<f64>("CACHE_MIN_HIT_RATE")? {
            config.cache.min_hit_rate = v;
        }
        if let Some(v) = env_parse::<f64>("CACHE_MAX_EVICTION_RATE")? {
            config.cache.max_eviction_rate = v;
        }

        if let Some(v) = env_parse::<f32>("SELECTOR_THRESHOLD")? {
            config.selector.threshold = v;
        }
        if let Some(v) = env_parse::<usize>("SELECTOR_MAX_CANDIDATES")? {
            config.selector.max_candidates = v.max(1);
        }
        if let Some(v) = env_parse::<f32>("SELECTOR_FALLBACK_THRESHOLD")? {
            config.selector.fallback_threshold = v;
        }
        if let Some(ms) = env_parse::<u64>("SELECTOR_LATENCY_BUDGET_MS")? {
            config.selector.latency_budget = Duration::from_millis(ms);
        }
        if let Ok(list) = env::var("SELECTOR_DEFAULT_TOOLS") {
            config.selector.default_tools = list
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect();
        }

        config.selector.classifier_model_path = env::var("SELECTOR_CLASSIFIER_MODEL")
            .ok()
            .filter(|p| !p.is_empty())
            .map(PathBuf::from);

        if let Some(v) = env_parse::<usize>("STREAM_BUFFER_CAPACITY")? {
            config.stream.buffer_capacity = v.max(1);
        }
        if let Some(ms) = env_parse::<u64>("STREAM_SLOW_CONSUMER_WARNING_MS")? {
            config.stream.slow_consumer_warning = Duration::from_millis(ms);
        }

        config.gemini_api_key = env::var("GEMINI_API_KEY").ok().filter(|k| !k.is_empty());
        config.financial_api_base_url = env::var("FINANCIAL_API_BASE_URL")
            .or_else(|_| env::var("TOOLS_API_BASE_URL"))
            .ok()
            .filter(|u| !u.is_empty());

        Ok(config)
    }
}

fn env_parse<T: FromStr>(name: &str) -> Result<Option<T>> {
    match env::var(name) {
        Ok(raw) if !raw.trim().is_empty() => raw.trim().parse::<T>().map(Some).map_err(|_| {
            OrchestrationError::ConfigError(format!("Invalid value for {}: '{}'", name, raw))
        }),
        _ => Ok(None),
    }
}
