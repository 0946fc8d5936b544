//! Tool selection
//!
//! Narrows the catalog to a bounded, scored candidate set per query:
//! embedding → multi-label classifier → threshold + cap, with a lexical
//! fallback when the classifier is unsure and a default subset when it
//! fails. Selection is advisory and never fails.

pub mod classifier;
pub mod embedding;

pub use classifier::{ClassifierModel, NearestExampleClassifier};
pub use embedding::{tokenize, VocabularyEmbedder};

use crate::cache::CacheManager;
use crate::config::SelectorConfig;
use crate::keys;
use crate::models::{CacheType, ToolSpec};
use crate::tools::ToolRegistry;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};

/// Internal selector failure. Never surfaced to callers.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SelectorError {
    #[error("embedding provider failed: {0}")]
    EmbeddingFailed(String),

    #[error("classifier unavailable: {0}")]
    ClassifierUnavailable(String),

    #[error("embedding is empty")]
    InvalidEmbedding,
}

/// Embedding provider (external collaborator)
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, SelectorError>;
    fn dimension(&self) -> usize;
}

/// Runtime contract of a trained multi-label classifier: one independent
/// probability per catalog entry, aligned with `catalog`.
pub trait ToolClassifier: Send + Sync {
    fn predict(&self, embedding: &[f32], catalog: &[ToolSpec]) -> Result<Vec<f32>, SelectorError>;
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Candidate {
    pub name: String,
    pub confidence: f32,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FallbackReason {
    /// Classifier was unsure; lexical matches were added.
    LowConfidence,
    /// Nothing cleared the threshold; default subset offered.
    NoCandidates,
    EmbeddingFailed,
    ClassifierUnavailable,
    Timeout,
}

impl From<&SelectorError> for FallbackReason {
    fn from(e: &SelectorError) -> Self {
        match e {
            SelectorError::EmbeddingFailed(_) | SelectorError::InvalidEmbedding => {
                FallbackReason::EmbeddingFailed
            }
            SelectorError::ClassifierUnavailable(_) => FallbackReason::ClassifierUnavailable,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SelectionResult {
    pub candidates: Vec<Candidate>,
    pub fallback: Option<FallbackReason>,
}

impl SelectionResult {
    pub fn names(&self) -> Vec<&str> {
        self.candidates.iter().map(|c| c.name.as_str()).collect()
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct SelectorStats {
    pub selections: u64,
    pub fallbacks: u64,
}

pub struct ToolSelector {
    embedder: Arc<dyn EmbeddingProvider>,
    classifier: Option<Arc<dyn ToolClassifier>>,
    /// Hand-authored description corpus per tool, tokenized.
    corpus: HashMap<String, HashSet<String>>,
    config: SelectorConfig,
    cache: Option<Arc<CacheManager>>,
    selections: AtomicU64,
    fallbacks: AtomicU64,
}

impl ToolSelector {
    pub fn new(
        embedder: Arc<dyn EmbeddingProvider>,
        classifier: Option<Arc<dyn ToolClassifier>>,
        config: SelectorConfig,
    ) -> Self {
        Self {
            embedder,
            classifier,
            corpus: HashMap::new(),
            config,
            cache: None,
            selections: AtomicU64::new(0),
            fallbacks: AtomicU64::new(0),
        }
    }

    /// Build the lexical embedder, classifier and fallback corpus from the
    /// registry. A configured model file replaces the registry's examples;
    /// if it cannot be loaded the selector runs degraded.
    pub fn from_registry(registry: &ToolRegistry, config: SelectorConfig) -> Self {
        let model = match &config.classifier_model_path {
            Some(path) => ClassifierModel::from_path(path),
            None => Ok(ClassifierModel::from_registry(registry)),
        };

        let mut documents: Vec<String> = registry
            .tools()
            .map(|t| t.description().to_string())
            .collect();
        if let Ok(model) = &model {
            documents.extend(model.corpus().map(str::to_string));
        }

        let embedder = Arc::new(VocabularyEmbedder::fit(&documents));

        let classifier: Option<Arc<dyn ToolClassifier>> = match model {
            Ok(model) => Some(Arc::new(NearestExampleClassifier::fit(&model, &embedder))),
            Err(e) => {
                warn!(error = %e, "Tool classifier failed to load; selector will run degraded");
                None
            }
        };

        let mut selector = Self::new(embedder, classifier, config);
        for tool in registry.tools() {
            let text = format!("{} {}", tool.description(), tool.examples().join(" "));
            selector = selector.with_corpus(tool.name(), &text);
        }
        selector
    }

    /// Cache query embeddings in the `embedding` store.
    pub fn with_cache(mut self, cache: Arc<CacheManager>) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn with_corpus(mut self, tool_name: &str, text: &str) -> Self {
        self.corpus
            .entry(tool_name.to_string())
            .or_default()
            .extend(tokenize(text));
        self
    }

    pub fn stats(&self) -> SelectorStats {
        SelectorStats {
            selections: self.selections.load(AtomicOrdering::Relaxed),
            fallbacks: self.fallbacks.load(AtomicOrdering::Relaxed),
        }
    }

    /// Select candidate tools for `query`. Never fails and, for a non-empty
    /// catalog, never returns an empty candidate list.
    pub async fn select(&self, query: &str, catalog: &[ToolSpec]) -> SelectionResult {
        self.selections.fetch_add(1, AtomicOrdering::Relaxed);

        let scores =
            match tokio::time::timeout(self.config.latency_budget, self.score(query, catalog)).await
            {
                Ok(Ok(scores)) => scores,
                Ok(Err(e)) => {
                    return self.default_subset(catalog, FallbackReason::from(&e), &e.to_string())
                }
                Err(_) => {
                    return self.default_subset(
                        catalog,
                        FallbackReason::Timeout,
                        "latency budget exceeded",
                    )
                }
            };

        let max_candidates = self.config.max_candidates.max(1);

        // Catalog order going in + stable sort = catalog order on ties
        let mut ranked: Vec<(usize, f32)> = scores
            .iter()
            .copied()
            .enumerate()
            .filter(|(_, s)| *s >= self.config.threshold)
            .collect();
        ranked.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(Ordering::Equal));
        ranked.truncate(max_candidates);

        let mut candidates: Vec<Candidate> = ranked
            .into_iter()
            .filter_map(|(i, confidence)| {
                catalog.get(i).map(|spec| Candidate {
                    name: spec.name.clone(),
                    confidence,
                })
            })
            .collect();

        let top = scores.iter().copied().fold(0.0f32, f32::max);
        let mut fallback = None;

        if top < self.config.fallback_threshold {
            debug!(top, query, "Low classifier confidence, adding lexical matches");
            fallback = Some(FallbackReason::LowConfidence);

            for candidate in self.lexical_matches(query, catalog) {
                if candidates.len() >= max_candidates {
                    break;
                }
                if !candidates.iter().any(|c| c.name == candidate.name) {
                    candidates.push(candidate);
                }
            }
        }

        if candidates.is_empty() {
            return self.default_subset(
                catalog,
                FallbackReason::NoCandidates,
                "no candidate cleared the threshold",
            );
        }

        if fallback.is_some() {
            self.fallbacks.fetch_add(1, AtomicOrdering::Relaxed);
        }

        debug!(
            query,
            candidates = ?candidates.iter().map(|c| &c.name).collect::<Vec<_>>(),
            "Tools selected"
        );

        SelectionResult {
            candidates,
            fallback,
        }
    }

    async fn score(&self, query: &str, catalog: &[ToolSpec]) -> Result<Vec<f32>, SelectorError> {
        let classifier = self.classifier.as_ref().ok_or_else(|| {
            SelectorError::ClassifierUnavailable("no classifier model loaded".to_string())
        })?;

        let embedding = self.embed_cached(query).await?;
        let scores = classifier.predict(&embedding, catalog)?;

        if scores.len() != catalog.len() {
            return Err(SelectorError::ClassifierUnavailable(format!(
                "classifier returned {} scores for {} tools",
                scores.len(),
                catalog.len()
            )));
        }
        Ok(scores)
    }

    async fn embed_cached(&self, query: &str) -> Result<Vec<f32>, SelectorError> {
        let key = keys::text_key("query-embedding", &query.trim().to_lowercase());

        if let Some(cache) = &self.cache {
            if let Some(vector) = cache.get_as::<Vec<f32>>(CacheType::Embedding, &key).await {
                return Ok(vector);
            }
        }

        let vector = self.embedder.embed(query).await?;

        if let Some(cache) = &self.cache {
            if let Ok(value) = serde_json::to_value(&vector) {
                cache.set_default(CacheType::Embedding, &key, value).await;
            }
        }
        Ok(vector)
    }

    /// Token-overlap similarity against the description corpus.
    fn lexical_matches(&self, query: &str, catalog: &[ToolSpec]) -> Vec<Candidate> {
        let query_tokens: HashSet<String> = tokenize(query).into_iter().collect();
        if query_tokens.is_empty() {
            return Vec::new();
        }

        let mut matches: Vec<Candidate> = catalog
            .iter()
            .filter_map(|spec| {
                let overlap = match self.corpus.get(&spec.name) {
                    Some(tokens) => query_tokens.intersection(tokens).count(),
                    None => {
                        let tokens: HashSet<String> =
                            tokenize(&spec.description).into_iter().collect();
                        query_tokens.intersection(&tokens).count()
                    }
                };

                (overlap > 0).then(|| Candidate {
                    name: spec.name.clone(),
                    confidence: overlap as f32 / query_tokens.len() as f32
                        * spec.baseline_confidence,
                })
            })
            .collect();

        matches.sort_by(|a, b| {
            b.confidence
                .partial_cmp(&a.confidence)
                .unwrap_or(Ordering::Equal)
        });
        matches
    }

    /// Conservative "offer everything" answer used whenever scoring fails.
    fn default_subset(
        &self,
        catalog: &[ToolSpec],
        reason: FallbackReason,
        detail: &str,
    ) -> SelectionResult {
        self.fallbacks.fetch_add(1, AtomicOrdering::Relaxed);
        warn!(?reason, detail, "Tool selector degraded, offering default subset");

        let configured: Vec<&ToolSpec> = self
            .config
            .default_tools
            .iter()
            .filter_map(|name| catalog.iter().find(|s| &s.name == name))
            .collect();

        let pool: Vec<&ToolSpec> = if configured.is_empty() {
            catalog.iter().collect()
        } else {
            configured
        };

        let candidates = pool
            .into_iter()
            .take(self.config.max_candidates.max(1))
            .map(|spec| Candidate {
                name: spec.name.clone(),
                confidence: spec.baseline_confidence,
            })
            .collect();

        SelectionResult {
            candidates,
            fallback: Some(reason),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gemini::GeminiClient;
    use crate::models::CacheType;
    use crate::tools::create_default_registry;
    use serde_json::json;
    use std::time::Duration;

    fn registry() -> ToolRegistry {
        create_default_registry(None, Arc::new(GeminiClient::new(String::new())))
    }

    fn spec(name: &str) -> ToolSpec {
        ToolSpec {
            name: name.to_string(),
            description: format!("{} tool", name),
            input_schema: json!({"type": "object"}),
            baseline_confidence: 0.5,
            cache_type: CacheType::Search,
        }
    }

    struct FixedClassifier(Vec<f32>);

    impl ToolClassifier for FixedClassifier {
        fn predict(&self, _: &[f32], _: &[ToolSpec]) -> Result<Vec<f32>, SelectorError> {
            Ok(self.0.clone())
        }
    }

    struct FailingEmbedder;

    #[async_trait]
    impl EmbeddingProvider for FailingEmbedder {
        async fn embed(&self, _: &str) -> Result<Vec<f32>, SelectorError> {
            Err(SelectorError::EmbeddingFailed("provider offline".into()))
        }

        fn dimension(&self) -> usize {
            0
        }
    }

    struct SlowEmbedder;

    #[async_trait]
    impl EmbeddingProvider for SlowEmbedder {
        async fn embed(&self, _: &str) -> Result<Vec<f32>, SelectorError> {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(vec![1.0])
        }

        fn dimension(&self) -> usize {
            1
        }
    }

    fn fixed_selector(scores: Vec<f32>) -> ToolSelector {
        ToolSelector::new(
            Arc::new(VocabularyEmbedder::fit(&["placeholder"])),
            Some(Arc::new(FixedClassifier(scores))),
            SelectorConfig::default(),
        )
    }

    #[tokio::test]
    async fn test_apple_price_selects_quote_tool() {
        let registry = registry();
        let selector = ToolSelector::from_registry(&registry, SelectorConfig::default());

        let result = selector
            .select("What is Apple's stock price?", &registry.catalog())
            .await;

        assert!(result.candidates.len() <= 3);
        assert_eq!(result.fallback, None);
        let quote = result
            .candidates
            .iter()
            .find(|c| c.name == "get_stock_quote")
            .unwrap();
        assert!(quote.confidence > 0.8);
        assert_eq!(result.candidates[0].name, "get_stock_quote");
    }

    #[tokio::test]
    async fn test_ties_keep_catalog_order_and_cap_applies() {
        let catalog: Vec<ToolSpec> = (0..7).map(|i| spec(&format!("t{}", i))).collect();
        let selector = fixed_selector(vec![0.5, 0.7, 0.5, 0.7, 0.9, 0.2, 0.6]);

        let result = selector.select("anything", &catalog).await;

        assert_eq!(result.names(), vec!["t4", "t1", "t3", "t6", "t0"]);
    }

    #[tokio::test]
    async fn test_embedding_failure_falls_back_to_default_subset() {
        let registry = registry();
        let selector = ToolSelector::new(
            Arc::new(FailingEmbedder),
            Some(Arc::new(FixedClassifier(vec![0.9; 5]))),
            SelectorConfig::default(),
        );

        let result = selector.select("apple stock price", &registry.catalog()).await;

        assert_eq!(result.fallback, Some(FallbackReason::EmbeddingFailed));
        assert_eq!(result.candidates.len(), 5);
        assert_eq!(result.candidates[0].name, "get_stock_quote");
        assert_eq!(result.candidates[0].confidence, 0.6);
        assert_eq!(selector.stats().fallbacks, 1);
    }

    #[tokio::test]
    async fn test_missing_classifier_uses_configured_defaults() {
        let registry = registry();
        let config = SelectorConfig {
            default_tools: vec!["news".to_string(), "not_a_tool".to_string(), "web_search".to_string()],
            ..SelectorConfig::default()
        };
        let selector = ToolSelector::new(Arc::new(VocabularyEmbedder::fit(&["x y"])), None, config);

        let result = selector.select("anything", &registry.catalog()).await;

        assert_eq!(result.fallback, Some(FallbackReason::ClassifierUnavailable));
        assert_eq!(result.names(), vec!["news", "web_search"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_embedding_hits_latency_budget() {
        let selector = ToolSelector::new(
            Arc::new(SlowEmbedder),
            Some(Arc::new(FixedClassifier(vec![0.9]))),
            SelectorConfig::default(),
        );

        let result = selector.select("apple", &[spec("only")]).await;

        assert_eq!(result.fallback, Some(FallbackReason::Timeout));
        assert_eq!(result.names(), vec!["only"]);
    }

    #[tokio::test]
    async fn test_low_confidence_adds_lexical_matches() {
        let registry = registry();
        let selector = ToolSelector::from_registry(&registry, SelectorConfig::default());

        // "volume" only appears in the quote tool's description
        let result = selector.select("volume", &registry.catalog()).await;

        assert_eq!(result.fallback, Some(FallbackReason::LowConfidence));
        assert_eq!(result.candidates[0].name, "get_stock_quote");
        assert_eq!(selector.stats().fallbacks, 1);
    }

    #[tokio::test]
    async fn test_gibberish_is_never_empty_handed() {
        let registry = registry();
        let selector = ToolSelector::from_registry(&registry, SelectorConfig::default());

        let result = selector.select("zzqx blorp", &registry.catalog()).await;

        assert!(!result.candidates.is_empty());
        assert_eq!(result.fallback, Some(FallbackReason::NoCandidates));
    }

    #[tokio::test]
    async fn test_query_embedding_is_cached() {
        let registry = registry();
        let cache = Arc::new(CacheManager::default());
        let selector = ToolSelector::from_registry(&registry, SelectorConfig::default())
            .with_cache(Arc::clone(&cache));

        selector.select("apple stock price", &registry.catalog()).await;
        selector.select("Apple stock price ", &registry.catalog()).await;

        let stats = cache.stats().await;
        let embedding = &stats[&CacheType::Embedding];
        assert_eq!(embedding.size, 1);
        assert_eq!(embedding.hits, 1);
    }
}
