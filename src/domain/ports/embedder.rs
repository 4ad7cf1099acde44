//! Embedding port for vector search.
//!
//! The embedding model lives outside the core; hybrid and knn tools ask
//! this port for a query vector. The null implementation supports
//! deployments without a vector backend.

use async_trait::async_trait;

use crate::domain::errors::StoreResult;

/// Produces dense vectors for similarity search.
#[async_trait]
pub trait Embedder: Send + Sync {
    async fn embed(&self, text: &str) -> StoreResult<Vec<f32>>;

    /// Dimensionality of produced vectors.
    fn dimensions(&self) -> usize;
}

/// Embedder that produces a deterministic pseudo-vector from the text bytes.
/// Good enough for tests and for running without a model backend: identical
/// texts map to identical vectors, so similarity dedup still functions.
pub struct NullEmbedder {
    dimensions: usize,
}

impl NullEmbedder {
    pub fn new(dimensions: usize) -> Self {
        Self { dimensions }
    }
}

impl Default for NullEmbedder {
    fn default() -> Self {
        Self::new(16)
    }
}

#[async_trait]
impl Embedder for NullEmbedder {
    async fn embed(&self, text: &str) -> StoreResult<Vec<f32>> {
        let mut vector = vec![0.0f32; self.dimensions];
        for (i, byte) in text.bytes().enumerate() {
            vector[i % self.dimensions] += f32::from(byte) / 255.0;
        }
        let norm: f32 = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
        if norm > 0.0 {
            for v in &mut vector {
                *v /= norm;
            }
        }
        Ok(vector)
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_null_embedder_deterministic() {
        let embedder = NullEmbedder::default();
        let a = embedder.embed("disk full on web-1").await.unwrap();
        let b = embedder.embed("disk full on web-1").await.unwrap();
        let c = embedder.embed("credential stuffing").await.unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.len(), embedder.dimensions());
    }

    #[tokio::test]
    async fn test_null_embedder_normalized() {
        let embedder = NullEmbedder::new(8);
        let v = embedder.embed("some text").await.unwrap();
        let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-5);
    }
}
