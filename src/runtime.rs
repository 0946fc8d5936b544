//! Process-wide wiring
//!
//! Constructs the cache, deduplicator, registry, selector, executor and
//! stream coordinator once at startup and hands out shared references.
//! Nothing here is global; tests build as many runtimes as they like.

use crate::cache::CacheManager;
use crate::config::AppConfig;
use crate::dedup::RequestDeduplicator;
use crate::executor::ToolExecutor;
use crate::gemini::GeminiClient;
use crate::llm::{GeminiModel, LanguageModel};
use crate::models::Session;
use crate::selector::ToolSelector;
use crate::stream::{EventSource, StreamCoordinator};
use crate::tools::{create_default_registry, ToolRegistry};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::info;

const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

pub struct Runtime {
    pub config: AppConfig,
    pub cache: Arc<CacheManager>,
    pub dedup: Arc<RequestDeduplicator>,
    pub registry: Arc<ToolRegistry>,
    pub selector: Arc<ToolSelector>,
    pub executor: ToolExecutor,
    pub coordinator: Arc<StreamCoordinator>,
    pub llm: Arc<dyn LanguageModel>,
    sweeper: Option<JoinHandle<()>>,
}

impl Runtime {
    /// Wire the default financial tools and the Gemini model.
    pub fn from_config(config: AppConfig) -> Self {
        let gemini = Arc::new(GeminiClient::new(
            config.gemini_api_key.clone().unwrap_or_default(),
        ));
        let registry = create_default_registry(
            config.financial_api_base_url.as_deref(),
            Arc::clone(&gemini),
        );
        let llm: Arc<dyn LanguageModel> = Arc::new(GeminiModel::new(gemini));

        let mut runtime = Self::new(config, registry, llm);
        runtime.sweeper = Some(runtime.cache.spawn_sweeper(SWEEP_INTERVAL));
        runtime
    }

    pub fn new(config: AppConfig, registry: ToolRegistry, llm: Arc<dyn LanguageModel>) -> Self {
        let cache = Arc::new(CacheManager::new(config.cache.clone()));
        let dedup = Arc::new(RequestDeduplicator::new());
        let registry = Arc::new(registry);

        let selector = Arc::new(
            ToolSelector::from_registry(&registry, config.selector.clone())
                .with_cache(Arc::clone(&cache)),
        );

        let executor = ToolExecutor::new(
            Arc::clone(&registry),
            Arc::clone(&cache),
            Arc::clone(&dedup),
            config.executor.clone(),
        );

        let coordinator = Arc::new(StreamCoordinator::new(
            Arc::clone(&selector),
            executor.clone(),
            config.stream.clone(),
        ));

        info!(
            tools = registry.len(),
            worker_pool_size = config.executor.worker_pool_size,
            "Runtime initialized"
        );

        Self {
            config,
            cache,
            dedup,
            registry,
            selector,
            executor,
            coordinator,
            llm,
            sweeper: None,
        }
    }

    /// Start a streamed session for `query`.
    pub async fn chat(&self, query: &str) -> EventSource {
        self.coordinator
            .run(Session::new(query), Arc::clone(&self.llm))
            .await
    }

    /// Stop background maintenance and flush the caches.
    pub async fn shutdown(&self) {
        if let Some(sweeper) = &self.sweeper {
            sweeper.abort();
        }
        self.cache.shutdown().await;
    }
}
