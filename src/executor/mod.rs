//! Concurrent tool execution
//!
//! Every call is resolved through the cache, then the deduplicator, then a
//! bounded worker pool. Results are yielded as they complete, and each
//! call is isolated: a failure, panic or timeout in one never touches its
//! siblings.

use crate::cache::CacheManager;
use crate::config::ExecutorConfig;
use crate::dedup::RequestDeduplicator;
use crate::error::ToolError;
use crate::keys;
use crate::models::{CallState, ToolCall, ToolCallResult, ToolOutcome, ToolSpec};
use crate::tools::{validate_arguments, Tool, ToolRegistry};
use futures::stream::{BoxStream, FuturesUnordered, StreamExt};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::time::Instant;
use tracing::{debug, warn};

#[derive(Clone)]
pub struct ToolExecutor {
    registry: Arc<ToolRegistry>,
    cache: Arc<CacheManager>,
    dedup: Arc<RequestDeduplicator>,
    pool: Arc<Semaphore>,
    config: Arc<ExecutorConfig>,
}

impl ToolExecutor {
    pub fn new(
        registry: Arc<ToolRegistry>,
        cache: Arc<CacheManager>,
        dedup: Arc<RequestDeduplicator>,
        config: ExecutorConfig,
    ) -> Self {
        let pool = Arc::new(Semaphore::new(config.worker_pool_size.max(1)));
        Self {
            registry,
            cache,
            dedup,
            pool,
            config: Arc::new(config),
        }
    }

    pub fn catalog(&self) -> Vec<ToolSpec> {
        self.registry.catalog()
    }

    pub fn registry(&self) -> &Arc<ToolRegistry> {
        &self.registry
    }

    /// Free worker slots right now.
    pub fn available_permits(&self) -> usize {
        self.pool.available_permits()
    }

    /// Dispatch every call immediately and yield results in completion
    /// order. Dropping the stream stops delivery only; dispatched work keeps
    /// running and still writes through to the cache.
    pub fn execute(&self, calls: Vec<ToolCall>) -> BoxStream<'static, ToolCallResult> {
        let pending = FuturesUnordered::new();

        for call in calls {
            let this = self.clone();
            let original = call.clone();
            let handle = tokio::spawn(async move { this.run_call(call).await });

            pending.push(async move {
                match handle.await {
                    Ok(result) => result,
                    Err(e) => {
                        warn!(
                            call_id = %original.id,
                            tool = %original.name,
                            error = %e,
                            "Tool call task failed"
                        );
                        let outcome = ToolOutcome::from_result(Err(ToolError::Internal(
                            format!("tool call did not complete: {}", e),
                        )));
                        let mut call = original;
                        call.state = outcome.state();
                        ToolCallResult {
                            call,
                            outcome,
                            elapsed_ms: 0,
                            deduplicated: false,
                        }
                    }
                }
            });
        }

        pending.boxed()
    }

    /// Run a batch to completion, in completion order.
    pub async fn execute_all(&self, calls: Vec<ToolCall>) -> Vec<ToolCallResult> {
        self.execute(calls).collect().await
    }

    async fn run_call(&self, mut call: ToolCall) -> ToolCallResult {
        let started = Instant::now();
        let (outcome, deduplicated) = self.resolve(&mut call).await;

        call.state = outcome.state();
        let elapsed_ms = started.elapsed().as_millis() as u64;

        debug!(
            call_id = %call.id,
            tool = %call.name,
            state = ?call.state,
            elapsed_ms,
            deduplicated,
            "Tool call resolved"
        );

        ToolCallResult {
            call,
            outcome,
            elapsed_ms,
            deduplicated,
        }
    }

    async fn resolve(&self, call: &mut ToolCall) -> (ToolOutcome, bool) {
        let Some(tool) = self.registry.get(&call.name) else {
            return (
                ToolOutcome::from_result(Err(ToolError::NotFound(call.name.clone()))),
                false,
            );
        };

        let spec = tool.spec();
        if let Err(e) = validate_arguments(&spec, &call.arguments) {
            return (ToolOutcome::from_result(Err(e)), false);
        }

        let key = keys::cache_key(&call.name, &call.arguments);

        if let Some(value) = self.cache.get(spec.cache_type, &key).await {
            debug!(call_id = %call.id, tool = %call.name, "Cache hit");
            return (ToolOutcome::CacheHit { value }, false);
        }

        call.state = CallState::Running;

        let budget = self.config.timeout_for(&spec.name, spec.cache_type);
        let pool = Arc::clone(&self.pool);
        let cache = Arc::clone(&self.cache);
        let args = call.arguments.clone();
        let write_key = key.clone();

        let work = async move {
            let permit = pool
                .acquire_owned()
                .await
                .map_err(|_| ToolError::Internal("worker pool is closed".to_string()))?;

            // The budget covers the invocation only, not the wait for a slot
            let invoked = tokio::time::timeout(budget, tool.invoke(&args)).await;
            drop(permit);

            let value = match invoked {
                Ok(result) => result?,
                Err(_) => return Err(ToolError::Timeout(budget.as_millis() as u64)),
            };

            let ttl = cache.default_ttl(spec.cache_type);
            cache.set(spec.cache_type, &write_key, value.clone(), ttl).await;
            Ok::<_, ToolError>(value)
        };

        let (result, joined) = self.dedup.dedupe_observed(&key, work).await;
        if joined {
            call.state = CallState::DedupJoined;
        }

        (ToolOutcome::from_result(result), joined)
    }
}
