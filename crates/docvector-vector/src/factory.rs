//! Picks and wires the vector store backend for a deployment mode.
use std::path::PathBuf;
use std::sync::Arc;

use tracing::info;

use docvector_core::config::{StoreMode, Transport, VectorStoreSettings};
use docvector_core::error::{Error, Result};
use docvector_core::traits::VectorStore;

use crate::lance_store::LanceVectorStore;
use crate::qdrant::{short_url, QdrantOptions, QdrantVectorStore};

/// Call-site overrides. Each set field wins over the loaded settings.
#[derive(Debug, Clone, Default)]
pub struct StoreOverrides {
    pub mode: Option<String>,
    pub persist_directory: Option<PathBuf>,
    pub url: Option<String>,
    pub api_key: Option<String>,
    pub transport: Option<Transport>,
}

impl StoreOverrides {
    pub fn mode(mode: impl Into<String>) -> Self {
        Self { mode: Some(mode.into()), ..Self::default() }
    }
}

/// Resolves the effective mode; an unknown override fails here.
pub fn resolve_mode(settings: &VectorStoreSettings, overrides: &StoreOverrides) -> Result<StoreMode> {
    match overrides.mode.as_deref() {
        Some(m) => m.parse(),
        None => Ok(settings.mode),
    }
}

/// Qdrant endpoint for the remote modes.
fn remote_url(settings: &VectorStoreSettings, mode: StoreMode, transport: Transport, overrides: &StoreOverrides) -> Result<String> {
    if let Some(url) = overrides.url.clone().or_else(|| settings.qdrant_url.clone()) {
        return Ok(url);
    }
    if mode == StoreMode::Cloud {
        return Err(Error::InvalidConfig("cloud mode needs vector_store.qdrant_url".into()));
    }
    let port = match transport {
        Transport::Rest => settings.qdrant_port,
        Transport::Grpc => settings.qdrant_grpc_port,
    };
    Ok(format!("http://{}:{}", settings.qdrant_host, port))
}

/// Builds an uninitialized store; call `initialize()` before use.
pub fn get_vector_store(settings: &VectorStoreSettings, overrides: &StoreOverrides) -> Result<Arc<dyn VectorStore>> {
    let mode = resolve_mode(settings, overrides)?;
    match mode {
        StoreMode::Local => {
            let root = overrides.persist_directory.clone().unwrap_or_else(|| settings.persist_path());
            info!(mode = %mode, root = %root.display(), "using embedded vector store");
            Ok(Arc::new(LanceVectorStore::new(root)))
        }
        StoreMode::Cloud | StoreMode::Hybrid => {
            let transport = overrides.transport.unwrap_or(settings.transport);
            let url = remote_url(settings, mode, transport, overrides)?;
            let api_key = overrides.api_key.clone().or_else(|| settings.qdrant_api_key.clone());
            if mode == StoreMode::Cloud && api_key.is_none() {
                return Err(Error::InvalidConfig("cloud mode needs vector_store.qdrant_api_key".into()));
            }
            info!(mode = %mode, url = %short_url(&url), ?transport, "using remote vector store");
            let store = QdrantVectorStore::new(QdrantOptions {
                url,
                api_key,
                transport,
                max_concurrent_requests: settings.max_concurrent_requests,
                request_timeout: settings.request_timeout(),
                retry: settings.retry_policy(),
            })?;
            Ok(Arc::new(store))
        }
    }
}
