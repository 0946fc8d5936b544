//! Lexical embedding provider
//!
//! One dimension per vocabulary token, binary term weights, L2 normalized.
//! The vocabulary is fitted on the hand-authored tool corpus, so tokens the
//! corpus never mentions carry no signal.

use super::{EmbeddingProvider, SelectorError};
use async_trait::async_trait;
use std::collections::{BTreeSet, HashMap};

/// Words that carry no routing signal
const STOP_WORDS: &[&str] = &[
    "a", "about", "an", "and", "are", "around", "at", "be", "by", "can", "do", "does", "for",
    "from", "give", "has", "have", "how", "i", "in", "is", "it", "its", "me", "much", "my", "of",
    "on", "or", "please", "tell", "that", "the", "this", "to", "was", "what", "whats", "which",
    "with", "you",
];

/// Lowercase, split on non-alphanumerics, drop single characters (this also
/// strips possessive `'s`) and stop words.
pub fn tokenize(text: &str) -> Vec<String> {
    text.to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| t.chars().count() >= 2 && !STOP_WORDS.contains(t))
        .map(str::to_string)
        .collect()
}

pub fn cosine(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() {
        return 0.0;
    }

    let (mut dot, mut norm_a, mut norm_b) = (0.0f32, 0.0f32, 0.0f32);
    for (x, y) in a.iter().zip(b) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    if norm_a == 0.0 || norm_b == 0.0 {
        0.0
    } else {
        dot / (norm_a.sqrt() * norm_b.sqrt())
    }
}

pub struct VocabularyEmbedder {
    vocabulary: HashMap<String, usize>,
}

impl VocabularyEmbedder {
    /// Build the vocabulary from a corpus. Indices follow sorted token order
    /// so the same corpus always yields the same embedding space.
    pub fn fit<S: AsRef<str>>(corpus: &[S]) -> Self {
        let tokens: BTreeSet<String> = corpus
            .iter()
            .flat_map(|doc| tokenize(doc.as_ref()))
            .collect();

        let vocabulary = tokens
            .into_iter()
            .enumerate()
            .map(|(i, t)| (t, i))
            .collect();

        Self { vocabulary }
    }

    pub fn dimension(&self) -> usize {
        self.vocabulary.len()
    }

    /// Embed synchronously. Out-of-vocabulary tokens are ignored; a text
    /// with no known tokens embeds to the zero vector.
    pub fn embed_text(&self, text: &str) -> Vec<f32> {
        let mut vector = vec![0.0f32; self.vocabulary.len()];

        for token in tokenize(text) {
            if let Some(&i) = self.vocabulary.get(&token) {
                vector[i] = 1.0;
            }
        }

        let norm = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > 0.0 {
            for x in vector.iter_mut() {
                *x /= norm;
            }
        }

        vector
    }
}

#[async_trait]
impl EmbeddingProvider for VocabularyEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, SelectorError> {
        if self.vocabulary.is_empty() {
            return Err(SelectorError::EmbeddingFailed(
                "vocabulary has not been built".to_string(),
            ));
        }
        Ok(self.embed_text(text))
    }

    fn dimension(&self) -> usize {
        VocabularyEmbedder::dimension(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tokenize_strips_possessive_and_stop_words() {
        assert_eq!(
            tokenize("What is Apple's stock price?"),
            vec!["apple", "stock", "price"]
        );
    }

    #[test]
    fn test_identical_token_sets_have_unit_cosine() {
        let embedder = VocabularyEmbedder::fit(&["apple stock price", "latest news on tesla"]);
        let a = embedder.embed_text("What is Apple's stock price?");
        let b = embedder.embed_text("apple stock price");
        assert!((cosine(&a, &b) - 1.0).abs() < 1e-6);

        let c = embedder.embed_text("latest news on tesla");
        assert_eq!(cosine(&a, &c), 0.0);
    }

    #[test]
    fn test_unknown_text_embeds_to_zero() {
        let embedder = VocabularyEmbedder::fit(&["apple stock price"]);
        let v = embedder.embed_text("zzz qqq");
        assert!(v.iter().all(|x| *x == 0.0));
        assert_eq!(cosine(&v, &v), 0.0);
    }

    #[tokio::test]
    async fn test_empty_vocabulary_fails() {
        let embedder = VocabularyEmbedder::fit::<&str>(&[]);
        assert!(embedder.embed("anything").await.is_err());
    }
}
