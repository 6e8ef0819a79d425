use std::path::Path;
use std::sync::Arc;

use serde::Serialize;
use tracing::info;

use docvector_core::config::EmbeddingSettings;
use docvector_core::error::{Error, Result};
use docvector_core::traits::Embedder;
use docvector_core::types::Provider;

use crate::cache::{CachingEmbedder, EmbeddingCache, CACHE_DIR_NAME};
use crate::local::LocalEmbedder;
use crate::openai::OpenAiEmbedder;
use crate::registry::{self, EmbeddingModelInfo};

/// Provider implied by the model name, checked against an explicit setting.
pub fn resolve_provider(settings: &EmbeddingSettings) -> Result<Provider> {
    let detected = registry::detect_provider(&settings.model).ok_or_else(|| Error::UnknownModel(settings.model.clone()))?;
    match settings.provider {
        Some(explicit) if explicit != detected => Err(Error::WrongProvider {
            model: settings.model.clone(),
            expected: detected.to_string(),
            actual: explicit.to_string(),
        }),
        _ => Ok(detected),
    }
}

/// Builds the configured embedder, wrapped in a fresh cache when enabled.
pub fn create_embedder(settings: &EmbeddingSettings) -> Result<Arc<dyn Embedder>> {
    create_embedder_with_cache(settings, Arc::new(EmbeddingCache::new()))
}

/// Builds the configured embedder with its cache persisted under
/// `persist_dir`, so later runs reuse earlier embeddings.
pub async fn create_persistent_embedder(settings: &EmbeddingSettings, persist_dir: &Path) -> Result<Arc<dyn Embedder>> {
    if !settings.cache_enabled {
        return create_embedder(settings);
    }
    let cache = EmbeddingCache::open(persist_dir.join(CACHE_DIR_NAME)).await?;
    create_embedder_with_cache(settings, Arc::new(cache))
}

/// Like [`create_embedder`] but shares `cache` with other embedders.
pub fn create_embedder_with_cache(settings: &EmbeddingSettings, cache: Arc<EmbeddingCache>) -> Result<Arc<dyn Embedder>> {
    let provider = resolve_provider(settings)?;
    let inner: Arc<dyn Embedder> = match provider {
        Provider::Local => Arc::new(LocalEmbedder::new(settings)?),
        Provider::OpenAi => Arc::new(OpenAiEmbedder::new(settings)?),
    };
    info!(
        provider = %provider,
        model = %settings.model,
        dimension = inner.dimension(),
        cache = settings.cache_enabled,
        "embedder created"
    );
    if settings.cache_enabled {
        Ok(Arc::new(CachingEmbedder::new(inner, cache)))
    } else {
        Ok(inner)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct EmbedderInfo {
    pub provider: Provider,
    pub model: String,
    pub dimension: usize,
    pub device: String,
    pub batch_size: usize,
    pub cache_enabled: bool,
    /// Present for registered models.
    pub registry: Option<&'static EmbeddingModelInfo>,
}

/// What `create_embedder` would build, without loading anything.
pub fn embedder_info(settings: &EmbeddingSettings) -> Result<EmbedderInfo> {
    let provider = resolve_provider(settings)?;
    Ok(EmbedderInfo {
        provider,
        model: settings.model.clone(),
        dimension: registry::get_model_dimension(&settings.model)?,
        device: if provider == Provider::Local { settings.device.clone() } else { "remote".to_string() },
        batch_size: settings.batch_size,
        cache_enabled: settings.cache_enabled,
        registry: registry::get_model_info(&settings.model),
    })
}
