//! Embedding Engine (C5): turns text into a fixed-length unit vector.
//!
//! Grounded in the teacher's `embeddings.rs` — same model2vec-rs model, same
//! L2-normalize-then-dot-product scheme — but scoped down to just `embed`:
//! this crate's in-memory vector table lives in the Embedding Cache (L2, C7)
//! and the exhaustive top-K scan lives in the Semantic Finder (C9), matching
//! the component split in the spec rather than the teacher's single
//! `EmbeddingIndex` that owns both the model and the table.

use tracing::info;

#[cfg(feature = "semantic")]
use model2vec_rs::model::StaticModel;

/// Wraps a local sentence-embedding model. When the `semantic` feature is
/// disabled, `embed` still returns a vector (zeros) so the rest of the
/// pipeline keeps working end-to-end without the model dependency — search
/// quality degrades to "everything scores zero" rather than the crate
/// failing to build.
pub struct EmbeddingEngine {
    #[cfg(feature = "semantic")]
    model: StaticModel,
    model_id: String,
    dimension: usize,
}

impl EmbeddingEngine {
    /// Load an embedding model from a local path or HuggingFace Hub model id
    /// (e.g. `minishlab/potion-base-8M`, auto-downloaded and cached on first use).
    #[cfg(feature = "semantic")]
    pub fn new(model_id: &str) -> anyhow::Result<Self> {
        info!(model = model_id, "loading embedding model");
        let model = StaticModel::from_pretrained(model_id, None, Some(true), None)
            .map_err(|e| anyhow::anyhow!("failed to load embedding model: {e}"))?;
        let dimension = model.encode_single("dimension probe").len();
        info!(model = model_id, dimension, "embedding model loaded");
        Ok(Self {
            model,
            model_id: model_id.to_string(),
            dimension,
        })
    }

    #[cfg(not(feature = "semantic"))]
    pub fn new(model_id: &str) -> anyhow::Result<Self> {
        Ok(Self {
            model_id: model_id.to_string(),
            dimension: 0,
        })
    }

    pub fn model_id(&self) -> &str {
        &self.model_id
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    /// Embed a single string, L2-normalized so dot product equals cosine similarity.
    #[cfg(feature = "semantic")]
    pub fn embed(&self, text: &str) -> Vec<f32> {
        let mut v = self.model.encode_single(text);
        l2_normalize(&mut v);
        v
    }

    #[cfg(not(feature = "semantic"))]
    pub fn embed(&self, _text: &str) -> Vec<f32> {
        vec![0.0; self.dimension]
    }

    /// Batch-embed, used by the Cache Patcher when indexing many tools at once.
    #[cfg(feature = "semantic")]
    pub fn embed_batch(&self, texts: &[String]) -> Vec<Vec<f32>> {
        if texts.is_empty() {
            return Vec::new();
        }
        let mut vectors = self.model.encode(texts);
        for v in &mut vectors {
            l2_normalize(v);
        }
        vectors
    }

    #[cfg(not(feature = "semantic"))]
    pub fn embed_batch(&self, texts: &[String]) -> Vec<Vec<f32>> {
        texts.iter().map(|t| self.embed(t)).collect()
    }
}

fn l2_normalize(vec: &mut [f32]) {
    let norm: f32 = vec.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        for x in vec.iter_mut() {
            *x /= norm;
        }
    }
}

/// Dot product of two vectors; equals cosine similarity when both are L2-normalized.
pub fn dot_product(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b.iter()).map(|(x, y)| x * y).sum()
}

/// Build the embed-source text for one tool (§4.5): name, description,
/// parameter summary, backend description, plus any domain-capability
/// augmentation phrases for the backend's category.
pub fn embed_source_text(
    tool_name: &str,
    tool_description: &str,
    param_summary: &str,
    backend_description: &str,
    category: &str,
) -> String {
    let mut text = format!(
        "{tool_name}. {tool_description}. Parameters: {param_summary}. Backend: {backend_description}"
    );
    if let Some(phrases) = crate::domain_phrases::phrases_for(category) {
        text.push_str(". ");
        text.push_str(phrases);
    }
    text
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn l2_normalize_unit_length() {
        let mut v = vec![3.0, 4.0];
        l2_normalize(&mut v);
        assert!((v[0] - 0.6).abs() < 1e-6);
        assert!((v[1] - 0.8).abs() < 1e-6);
        let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-6);
    }

    #[test]
    fn l2_normalize_zero_vector_stays_zero() {
        let mut v = vec![0.0, 0.0, 0.0];
        l2_normalize(&mut v);
        assert!(v.iter().all(|&x| x == 0.0));
    }

    #[test]
    fn dot_product_of_normalized_vectors_is_cosine() {
        let mut a = vec![3.0, 4.0];
        let mut b = vec![4.0, 3.0];
        l2_normalize(&mut a);
        l2_normalize(&mut b);
        assert!((dot_product(&a, &b) - 0.96).abs() < 1e-6);
    }

    #[test]
    fn embed_source_text_includes_domain_phrases() {
        let text = embed_source_text("run_git", "run a git command", "cmd: string", "shell tool", "shell");
        assert!(text.contains("run_git"));
        assert!(text.contains("docker containers"));
    }

    #[test]
    fn embed_source_text_omits_phrases_for_unknown_category() {
        let text = embed_source_text("widget", "does a thing", "none", "misc tool", "bespoke");
        assert!(!text.contains(';'));
    }

    #[cfg(not(feature = "semantic"))]
    #[test]
    fn embed_without_semantic_feature_returns_zero_vector() {
        let engine = EmbeddingEngine::new("unused").unwrap();
        assert_eq!(engine.embed("hello"), vec![0.0; engine.dimension()]);
    }
}
