//! Configuration loader and path helpers.
//!
//! Uses Figment to merge built-in defaults + `config.toml` + `config.<env>.toml`
//! + `DOCVECTOR_*` env vars into a typed [`Settings`] value.
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::env;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::chunker::{ChunkStrategy, Chunker};
use crate::error::{Error, Result};
use crate::retry::RetryPolicy;
use crate::types::Provider;

pub const ENV_PREFIX: &str = "DOCVECTOR_";
pub const DEFAULT_MODEL: &str = "sentence-transformers/all-MiniLM-L6-v2";

/// Immutable process settings. Built once at startup and handed to
/// constructors; nothing reads configuration from globals.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub embedding: EmbeddingSettings,
    pub search: SearchSettings,
    pub chunking: ChunkingSettings,
    pub vector_store: VectorStoreSettings,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EmbeddingSettings {
    /// `None` picks the provider from the model name.
    pub provider: Option<Provider>,
    pub model: String,
    pub device: String,
    pub batch_size: usize,
    pub cache_enabled: bool,
    pub openai_api_key: Option<String>,
    pub openai_base_url: String,
    pub models_dir: String,
    /// Deterministic hashing backend instead of model weights.
    pub fake: bool,
    pub max_concurrent_requests: usize,
    pub request_timeout_secs: u64,
    pub max_retries: u32,
}

impl Default for EmbeddingSettings {
    fn default() -> Self {
        Self {
            provider: None,
            model: DEFAULT_MODEL.to_string(),
            device: "cpu".to_string(),
            batch_size: 32,
            cache_enabled: true,
            openai_api_key: None,
            openai_base_url: "https://api.openai.com/v1".to_string(),
            models_dir: "./models".to_string(),
            fake: false,
            max_concurrent_requests: 4,
            request_timeout_secs: 30,
            max_retries: 3,
        }
    }
}

impl EmbeddingSettings {
    pub fn models_path(&self) -> PathBuf { expand_path(&self.models_dir) }
    pub fn request_timeout(&self) -> Duration { Duration::from_secs(self.request_timeout_secs) }
    pub fn retry_policy(&self) -> RetryPolicy { RetryPolicy::with_max_retries(self.max_retries) }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchSettings {
    pub min_score: f32,
    pub vector_weight: f32,
    pub keyword_weight: f32,
    /// Candidates fetched per requested result before re-ranking.
    pub oversample: usize,
    /// Payload keys scanned by the keyword scorer.
    pub text_fields: Vec<String>,
}

impl Default for SearchSettings {
    fn default() -> Self {
        Self {
            min_score: 0.1,
            vector_weight: 0.7,
            keyword_weight: 0.3,
            oversample: 3,
            text_fields: vec!["content".to_string(), "title".to_string()],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChunkingSettings {
    pub size: usize,
    pub overlap: usize,
    pub strategy: ChunkStrategy,
}

impl Default for ChunkingSettings {
    fn default() -> Self {
        Self { size: 1000, overlap: 200, strategy: ChunkStrategy::Fixed }
    }
}

impl ChunkingSettings {
    pub fn chunker(&self) -> Result<Chunker> {
        Chunker::new(self.strategy, self.size, self.overlap)
    }
}

/// Deployment mode for the vector store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreMode {
    /// Embedded on-disk store, no network.
    #[default]
    Local,
    /// Managed remote service reached by URL and API key.
    Cloud,
    /// Self-hosted remote service reached by host and port.
    Hybrid,
}

impl fmt::Display for StoreMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            StoreMode::Local => "local",
            StoreMode::Cloud => "cloud",
            StoreMode::Hybrid => "hybrid",
        })
    }
}

impl FromStr for StoreMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "local" => Ok(StoreMode::Local),
            "cloud" => Ok(StoreMode::Cloud),
            "hybrid" => Ok(StoreMode::Hybrid),
            other => Err(Error::InvalidConfig(format!(
                "unknown vector store mode '{other}' (expected local, cloud or hybrid)"
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Transport {
    #[default]
    Rest,
    Grpc,
}

impl FromStr for Transport {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "rest" | "http" => Ok(Transport::Rest),
            "grpc" => Ok(Transport::Grpc),
            other => Err(Error::InvalidConfig(format!("unknown transport '{other}'"))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VectorStoreSettings {
    pub mode: StoreMode,
    pub collection: String,
    pub persist_directory: String,
    pub qdrant_host: String,
    pub qdrant_port: u16,
    pub qdrant_grpc_port: u16,
    pub transport: Transport,
    pub qdrant_url: Option<String>,
    pub qdrant_api_key: Option<String>,
    pub max_concurrent_requests: usize,
    pub request_timeout_secs: u64,
    pub max_retries: u32,
}

impl Default for VectorStoreSettings {
    fn default() -> Self {
        Self {
            mode: StoreMode::Local,
            collection: "documents".to_string(),
            persist_directory: "./data/lance".to_string(),
            qdrant_host: "localhost".to_string(),
            qdrant_port: 6333,
            qdrant_grpc_port: 6334,
            transport: Transport::Rest,
            qdrant_url: None,
            qdrant_api_key: None,
            max_concurrent_requests: 8,
            request_timeout_secs: 30,
            max_retries: 3,
        }
    }
}

impl VectorStoreSettings {
    pub fn persist_path(&self) -> PathBuf { expand_path(&self.persist_directory) }
    pub fn request_timeout(&self) -> Duration { Duration::from_secs(self.request_timeout_secs) }
    pub fn retry_policy(&self) -> RetryPolicy { RetryPolicy::with_max_retries(self.max_retries) }
}

impl Settings {
    /// Environment comes from `RUST_ENV` (default `dev`).
    pub fn load() -> Result<Self> {
        Self::load_for_env(None)
    }

    pub fn load_for_env(env_name: Option<&str>) -> Result<Self> {
        let env_name = env_name
            .map(str::to_string)
            .unwrap_or_else(|| env::var("RUST_ENV").unwrap_or_else(|_| "dev".to_string()));
        Self::from_figment(&Self::figment(&env_name))
    }

    /// Defaults, then `config.toml`, then `config.<env>.toml`, then
    /// `DOCVECTOR_*` variables (`__` separates sections).
    pub fn figment(env_name: &str) -> Figment {
        let mut figment = Figment::from(Serialized::defaults(Settings::default())).merge(Toml::file("config.toml"));
        match env_name {
            "dev" | "development" => figment = figment.merge(Toml::file("config.dev.toml")),
            "prod" | "production" => figment = figment.merge(Toml::file("config.prod.toml")),
            "test" | "testing" => figment = figment.merge(Toml::file("config.test.toml")),
            _ => {}
        }
        figment.merge(Env::prefixed(ENV_PREFIX).split("__"))
    }

    pub fn from_figment(figment: &Figment) -> Result<Self> {
        let settings: Settings = figment.extract()?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<()> {
        self.chunking.chunker()?;
        if self.embedding.batch_size == 0 {
            return Err(Error::InvalidConfig("embedding.batch_size must be greater than zero".into()));
        }
        if self.embedding.max_concurrent_requests == 0 || self.vector_store.max_concurrent_requests == 0 {
            return Err(Error::InvalidConfig("max_concurrent_requests must be greater than zero".into()));
        }
        for (name, w) in [("vector_weight", self.search.vector_weight), ("keyword_weight", self.search.keyword_weight)] {
            if !w.is_finite() || w < 0.0 {
                return Err(Error::InvalidConfig(format!("search.{name} must be a non-negative number, got {w}")));
            }
        }
        if !self.search.min_score.is_finite() {
            return Err(Error::InvalidConfig("search.min_score must be finite".into()));
        }
        if self.search.oversample == 0 {
            return Err(Error::InvalidConfig("search.oversample must be at least 1".into()));
        }
        if self.vector_store.collection.trim().is_empty() {
            return Err(Error::InvalidConfig("vector_store.collection must not be empty".into()));
        }
        Ok(())
    }
}

/// `~` and `$VAR`/`${VAR}` expansion for configured directories. Relative
/// paths stay relative to the working directory.
pub fn expand_path<S: AsRef<str>>(input: S) -> PathBuf {
    let s = input.as_ref();
    let expanded_env = shellexpand::env(s).unwrap_or(std::borrow::Cow::Borrowed(s));
    let expanded = shellexpand::tilde(&expanded_env);
    PathBuf::from(expanded.as_ref())
}
