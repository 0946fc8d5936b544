//! Multi-label tool classifier (runtime inference only)
//!
//! Each tool is represented by the embeddings of its labelled example
//! utterances. A tool's probability is a logistic over its best cosine
//! match, so every tool is scored independently of the others.

use super::embedding::{cosine, VocabularyEmbedder};
use super::{SelectorError, ToolClassifier};
use crate::models::ToolSpec;
use crate::tools::ToolRegistry;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::Path;

const DEFAULT_STEEPNESS: f32 = 10.0;
const DEFAULT_MIDPOINT: f32 = 0.35;

/// Serialized classifier: calibration plus labelled examples per tool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClassifierModel {
    #[serde(default = "default_steepness")]
    pub steepness: f32,
    #[serde(default = "default_midpoint")]
    pub midpoint: f32,
    pub labels: BTreeMap<String, Vec<String>>,
}

fn default_steepness() -> f32 {
    DEFAULT_STEEPNESS
}

fn default_midpoint() -> f32 {
    DEFAULT_MIDPOINT
}

impl ClassifierModel {
    /// Collect each registered tool's example utterances.
    pub fn from_registry(registry: &ToolRegistry) -> Self {
        let labels = registry
            .tools()
            .map(|t| (t.name().to_string(), t.examples()))
            .filter(|(_, examples)| !examples.is_empty())
            .collect();

        Self {
            steepness: DEFAULT_STEEPNESS,
            midpoint: DEFAULT_MIDPOINT,
            labels,
        }
    }

    pub fn from_path(path: &Path) -> Result<Self, SelectorError> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            SelectorError::ClassifierUnavailable(format!("{}: {}", path.display(), e))
        })?;
        let model: ClassifierModel = serde_json::from_str(&raw).map_err(|e| {
            SelectorError::ClassifierUnavailable(format!("{}: {}", path.display(), e))
        })?;

        if model.labels.is_empty() {
            return Err(SelectorError::ClassifierUnavailable(format!(
                "{}: model has no labels",
                path.display()
            )));
        }
        Ok(model)
    }

    /// Every example utterance, for fitting the embedding vocabulary.
    pub fn corpus(&self) -> impl Iterator<Item = &str> {
        self.labels.values().flatten().map(String::as_str)
    }
}

pub struct NearestExampleClassifier {
    steepness: f32,
    midpoint: f32,
    prototypes: HashMap<String, Vec<Vec<f32>>>,
}

impl NearestExampleClassifier {
    pub fn fit(model: &ClassifierModel, embedder: &VocabularyEmbedder) -> Self {
        let prototypes = model
            .labels
            .iter()
            .map(|(tool, examples)| {
                let vectors = examples.iter().map(|e| embedder.embed_text(e)).collect();
                (tool.clone(), vectors)
            })
            .collect();

        Self {
            steepness: model.steepness,
            midpoint: model.midpoint,
            prototypes,
        }
    }

    fn calibrate(&self, similarity: f32) -> f32 {
        1.0 / (1.0 + (-self.steepness * (similarity - self.midpoint)).exp())
    }
}

impl ToolClassifier for NearestExampleClassifier {
    fn predict(&self, embedding: &[f32], catalog: &[ToolSpec]) -> Result<Vec<f32>, SelectorError> {
        if embedding.is_empty() {
            return Err(SelectorError::InvalidEmbedding);
        }

        Ok(catalog
            .iter()
            .map(|spec| match self.prototypes.get(&spec.name) {
                Some(examples) => {
                    let best = examples
                        .iter()
                        .map(|e| cosine(embedding, e))
                        .fold(0.0f32, f32::max);
                    self.calibrate(best)
                }
                None => 0.0,
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::CacheType;
    use serde_json::json;

    fn spec(name: &str) -> ToolSpec {
        ToolSpec {
            name: name.to_string(),
            description: String::new(),
            input_schema: json!({"type": "object"}),
            baseline_confidence: 0.5,
            cache_type: CacheType::Search,
        }
    }

    fn model() -> ClassifierModel {
        let mut labels = BTreeMap::new();
        labels.insert("quote".to_string(), vec!["apple stock price".to_string()]);
        labels.insert("news".to_string(), vec!["latest market headlines".to_string()]);
        ClassifierModel {
            steepness: DEFAULT_STEEPNESS,
            midpoint: DEFAULT_MIDPOINT,
            labels,
        }
    }

    #[test]
    fn test_scores_are_independent_per_tool() {
        let model = model();
        let embedder = VocabularyEmbedder::fit(&model.corpus().collect::<Vec<_>>());
        let classifier = NearestExampleClassifier::fit(&model, &embedder);

        let query = embedder.embed_text("apple stock price");
        let scores = classifier
            .predict(&query, &[spec("quote"), spec("news"), spec("unlabelled")])
            .unwrap();

        assert!(scores[0] > 0.99);
        assert!(scores[1] < 0.05);
        assert_eq!(scores[2], 0.0);
    }

    #[test]
    fn test_empty_embedding_is_rejected() {
        let model = model();
        let embedder = VocabularyEmbedder::fit(&model.corpus().collect::<Vec<_>>());
        let classifier = NearestExampleClassifier::fit(&model, &embedder);
        assert!(classifier.predict(&[], &[spec("quote")]).is_err());
    }

    #[test]
    fn test_missing_model_file_is_classifier_unavailable() {
        let err = ClassifierModel::from_path(Path::new("/nonexistent/classifier.json")).unwrap_err();
        assert!(matches!(err, SelectorError::ClassifierUnavailable(_)));
    }

    #[test]
    fn test_model_deserializes_with_default_calibration() {
        let model: ClassifierModel =
            serde_json::from_str(r#"{"labels": {"news": ["market headlines"]}}"#).unwrap();
        assert_eq!(model.steepness, DEFAULT_STEEPNESS);
        assert_eq!(model.labels["news"].len(), 1);
    }
}
