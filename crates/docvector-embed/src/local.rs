//! Embedder backed by a locally executed model.
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::OnceCell;
use tracing::{info, warn};

use docvector_core::config::EmbeddingSettings;
use docvector_core::error::{Error, Result};
use docvector_core::traits::Embedder;
use docvector_core::types::Provider;

use crate::backend::{HashingBackend, InferenceBackend};
use crate::bert::BertBackend;
use crate::registry::{self, DEFAULT_MAX_TOKENS};

enum Loader {
    Bert { models_dir: PathBuf, device: String, max_tokens: usize },
    Hashing,
}

/// Local model embedder. The model is loaded on first use; the dimension is
/// available immediately from the registry (or the fallback for custom
/// models) and checked against the model's real output on every batch.
pub struct LocalEmbedder {
    model: String,
    dimension: usize,
    batch_size: usize,
    loader: Loader,
    backend: OnceCell<Arc<dyn InferenceBackend>>,
    confirmed: AtomicBool,
}

impl LocalEmbedder {
    pub fn new(settings: &EmbeddingSettings) -> Result<Self> {
        let dimension = check_local_model(&settings.model)?;
        let loader = if settings.fake {
            Loader::Hashing
        } else {
            let max_tokens = registry::get_model_info(&settings.model).map_or(DEFAULT_MAX_TOKENS, |m| m.max_tokens);
            Loader::Bert { models_dir: settings.models_path(), device: settings.device.clone(), max_tokens }
        };
        Ok(Self {
            model: settings.model.clone(),
            dimension,
            batch_size: settings.batch_size.max(1),
            loader,
            backend: OnceCell::new(),
            confirmed: AtomicBool::new(false),
        })
    }

    /// Uses an already constructed backend instead of loading one.
    pub fn with_backend(model: &str, batch_size: usize, backend: Arc<dyn InferenceBackend>) -> Result<Self> {
        let dimension = check_local_model(model)?;
        Ok(Self {
            model: model.to_string(),
            dimension,
            batch_size: batch_size.max(1),
            loader: Loader::Hashing,
            backend: OnceCell::from(backend),
            confirmed: AtomicBool::new(false),
        })
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    async fn backend(&self) -> Result<Arc<dyn InferenceBackend>> {
        let backend = self.backend.get_or_try_init(move || self.load_backend()).await?;
        Ok(Arc::clone(backend))
    }

    async fn load_backend(&self) -> Result<Arc<dyn InferenceBackend>> {
        match &self.loader {
            Loader::Hashing => Ok(Arc::new(HashingBackend::new(self.dimension))),
            Loader::Bert { models_dir, device, max_tokens } => {
                let (dir, model, device, max_tokens) = (models_dir.clone(), self.model.clone(), device.clone(), *max_tokens);
                let loaded = tokio::task::spawn_blocking(move || BertBackend::load(&dir, &model, &device, max_tokens))
                    .await
                    .map_err(Error::operation)?
                    .map_err(|e| Error::Operation(format!("loading model '{}': {e:#}", self.model)))?;
                Ok(Arc::new(loaded))
            }
        }
    }

    fn confirm_dimension(&self, actual: usize) -> Result<()> {
        if actual != self.dimension {
            return Err(Error::DimensionMismatch { expected: self.dimension, actual });
        }
        if !self.confirmed.swap(true, Ordering::Relaxed) {
            info!(model = %self.model, dimension = actual, "embedding dimension confirmed");
        }
        Ok(())
    }
}

/// Rejects remote model names and unknown names; returns the declared
/// dimension.
fn check_local_model(model: &str) -> Result<usize> {
    if registry::detect_provider(model) == Some(Provider::OpenAi) {
        return Err(Error::WrongProvider {
            model: model.to_string(),
            expected: Provider::OpenAi.to_string(),
            actual: Provider::Local.to_string(),
        });
    }
    let (valid, message) = registry::validate_model(model);
    if !valid {
        return Err(Error::UnknownModel(model.to_string()));
    }
    if let Some(message) = message {
        warn!(model, "{message}");
    }
    registry::get_model_dimension(model)
}

#[async_trait]
impl Embedder for LocalEmbedder {
    fn model_name(&self) -> &str {
        &self.model
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(vec![]);
        }
        let backend = self.backend().await?;
        if let Some(dim) = backend.dimension() {
            self.confirm_dimension(dim)?;
        }
        let mut out = Vec::with_capacity(texts.len());
        for batch in texts.chunks(self.batch_size) {
            let b = Arc::clone(&backend);
            let owned = batch.to_vec();
            let vectors = tokio::task::spawn_blocking(move || b.embed(&owned))
                .await
                .map_err(Error::operation)?
                .map_err(|e| Error::Operation(format!("inference failed: {e:#}")))?;
            if vectors.len() != batch.len() {
                return Err(Error::Operation(format!("model returned {} vectors for {} texts", vectors.len(), batch.len())));
            }
            for v in &vectors {
                self.confirm_dimension(v.len())?;
            }
            out.extend(vectors);
        }
        Ok(out)
    }
}
