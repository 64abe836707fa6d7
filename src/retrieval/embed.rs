//! Embedding generation (§3 EmbeddedChunk), grounded in the teacher's
//! `memory::vector::VectorMemory` fastembed usage.

use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use fastembed::{EmbeddingModel, InitOptions, TextEmbedding};
use tokio::sync::Mutex;

use super::chunk::CodeChunk;

#[derive(Debug, Clone)]
pub struct EmbeddedChunk {
    pub chunk: CodeChunk,
    pub embedding: Vec<f32>,
    pub hash: String,
}

/// Abstraction over the embedding backend so search/ranking can be exercised in
/// tests without downloading a real model.
#[async_trait]
pub trait Embedder: Send + Sync {
    async fn embed(&self, texts: &[String]) -> anyhow::Result<Vec<Vec<f32>>>;
}

/// fastembed-backed embedder. The model is CPU-bound and `!Send` across an await
/// point in some builds, so calls are funneled through a single mutex-guarded
/// instance rather than cloned per task.
pub struct FastEmbedEmbedder {
    model: Mutex<TextEmbedding>,
}

impl FastEmbedEmbedder {
    pub fn new() -> anyhow::Result<Self> {
        let model = TextEmbedding::try_new(
            InitOptions::new(EmbeddingModel::AllMiniLML6V2).with_show_download_progress(true),
        )
        .context("failed to initialize embedding model")?;
        Ok(Self { model: Mutex::new(model) })
    }
}

#[async_trait]
impl Embedder for FastEmbedEmbedder {
    async fn embed(&self, texts: &[String]) -> anyhow::Result<Vec<Vec<f32>>> {
        let mut model = self.model.lock().await;
        let mut embeddings = model.embed(texts.to_vec(), None).context("failed to generate embeddings")?;
        for emb in &mut embeddings {
            normalize(emb);
        }
        Ok(embeddings)
    }
}

pub fn normalize(vec: &mut [f32]) {
    let norm: f32 = vec.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        for x in vec.iter_mut() {
            *x /= norm;
        }
    }
}

/// Cosine similarity; for already-normalized vectors this is a plain dot product.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a * norm_b)
}

#[cfg(test)]
pub(crate) struct StubEmbedder;

#[cfg(test)]
#[async_trait]
impl Embedder for StubEmbedder {
    /// Deterministic bag-of-words style embedding so tests can exercise similarity
    /// ranking without a real model: each dimension is a hashed token bucket count.
    async fn embed(&self, texts: &[String]) -> anyhow::Result<Vec<Vec<f32>>> {
        const DIMS: usize = 32;
        Ok(texts
            .iter()
            .map(|t| {
                let mut v = vec![0.0f32; DIMS];
                for token in t.to_lowercase().split_whitespace() {
                    let mut hash: u32 = 2166136261;
                    for b in token.bytes() {
                        hash ^= b as u32;
                        hash = hash.wrapping_mul(16777619);
                    }
                    v[(hash as usize) % DIMS] += 1.0;
                }
                normalize(&mut v);
                v
            })
            .collect())
    }
}

pub type SharedEmbedder = Arc<dyn Embedder>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cosine_similarity_of_identical_vectors_is_one() {
        let a = vec![1.0, 0.0, 0.0];
        assert!((cosine_similarity(&a, &a) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn cosine_similarity_of_orthogonal_vectors_is_zero() {
        let a = vec![1.0, 0.0];
        let b = vec![0.0, 1.0];
        assert!(cosine_similarity(&a, &b).abs() < 1e-6);
    }

    #[tokio::test]
    async fn stub_embedder_ranks_shared_tokens_higher() {
        let embedder = StubEmbedder;
        let vectors = embedder
            .embed(&["user authentication flow".to_string(), "completely unrelated topic".to_string()])
            .await
            .unwrap();
        let query = embedder.embed(&["authentication".to_string()]).await.unwrap();
        let sim_related = cosine_similarity(&query[0], &vectors[0]);
        let sim_unrelated = cosine_similarity(&query[0], &vectors[1]);
        assert!(sim_related > sim_unrelated);
    }
}
