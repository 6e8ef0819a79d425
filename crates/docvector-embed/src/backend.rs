//! Inference backends driven by [`crate::local::LocalEmbedder`].
//!
//! Backends are synchronous; the embedder runs them on the blocking pool.
use std::hash::{Hash, Hasher};

use anyhow::Result;
use twox_hash::XxHash64;

pub trait InferenceBackend: Send + Sync {
    /// Output width once known. `None` until a model has produced a vector.
    fn dimension(&self) -> Option<usize>;
    fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;
}

/// Deterministic token-hashing backend. No model weights; identical text
/// always yields the identical L2-normalised vector.
pub struct HashingBackend {
    dim: usize,
}

impl HashingBackend {
    pub fn new(dim: usize) -> Self {
        Self { dim: dim.max(1) }
    }

    #[allow(clippy::cast_possible_truncation, clippy::cast_precision_loss)]
    fn embed_one(&self, text: &str) -> Vec<f32> {
        let mut v = vec![0f32; self.dim];
        for (i, token) in text.split_whitespace().enumerate() {
            let mut hasher = XxHash64::with_seed(0);
            token.to_lowercase().hash(&mut hasher);
            let h = hasher.finish();
            let idx = (h % self.dim as u64) as usize;
            let val = ((h >> 32) as u32) as f32 / u32::MAX as f32;
            v[idx] += val + (i % 3) as f32 * 0.01;
        }
        let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt().max(1e-6);
        for x in &mut v {
            *x /= norm;
        }
        v
    }
}

impl InferenceBackend for HashingBackend {
    fn dimension(&self) -> Option<usize> {
        Some(self.dim)
    }

    fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        Ok(texts.iter().map(|t| self.embed_one(t)).collect())
    }
}
