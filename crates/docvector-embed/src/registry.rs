//! Static catalog of known embedding models.
//!
//! Read-only after start-up. Unregistered names are still usable when they
//! match a provider's naming pattern: `org/name` for HuggingFace models
//! (dimension confirmed at load time) and `text-embedding-*` for OpenAI.
use serde::Serialize;
use std::fmt;
use std::str::FromStr;

use docvector_core::config::DEFAULT_MODEL;
use docvector_core::error::{Error, Result};
use docvector_core::types::Provider;

/// Used for custom HuggingFace models until the real dimension is observed.
pub const FALLBACK_DIMENSION: usize = 384;
/// Provisional dimension for unregistered `text-embedding-*` names.
pub const OPENAI_DEFAULT_DIMENSION: usize = 1536;
pub const DEFAULT_MAX_TOKENS: usize = 512;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Speed {
    Fast,
    Medium,
    Slow,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Quality {
    Basic,
    Good,
    Excellent,
}

impl fmt::Display for Speed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Speed::Fast => "fast",
            Speed::Medium => "medium",
            Speed::Slow => "slow",
        })
    }
}

impl fmt::Display for Quality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Quality::Basic => "basic",
            Quality::Good => "good",
            Quality::Excellent => "excellent",
        })
    }
}

impl FromStr for Speed {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "fast" => Ok(Speed::Fast),
            "medium" => Ok(Speed::Medium),
            "slow" => Ok(Speed::Slow),
            other => Err(Error::InvalidConfig(format!("unknown speed '{other}'"))),
        }
    }
}

impl FromStr for Quality {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "basic" => Ok(Quality::Basic),
            "good" => Ok(Quality::Good),
            "excellent" => Ok(Quality::Excellent),
            other => Err(Error::InvalidConfig(format!("unknown quality '{other}'"))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EmbeddingModelInfo {
    /// Registry key, e.g. `BAAI/bge-base-en-v1.5`.
    pub id: &'static str,
    /// Short display name.
    pub name: &'static str,
    pub provider: Provider,
    pub dimension: usize,
    pub speed: Speed,
    pub quality: Quality,
    pub memory_mb: usize,
    pub max_tokens: usize,
    pub description: &'static str,
    pub use_cases: &'static [&'static str],
}

impl EmbeddingModelInfo {
    pub fn supports(&self, use_case: &str) -> bool {
        self.use_cases.contains(&use_case)
    }
}

#[allow(clippy::too_many_arguments)]
const fn local(
    id: &'static str,
    name: &'static str,
    dimension: usize,
    speed: Speed,
    quality: Quality,
    memory_mb: usize,
    description: &'static str,
    use_cases: &'static [&'static str],
) -> EmbeddingModelInfo {
    EmbeddingModelInfo {
        id,
        name,
        provider: Provider::Local,
        dimension,
        speed,
        quality,
        memory_mb,
        max_tokens: DEFAULT_MAX_TOKENS,
        description,
        use_cases,
    }
}

const fn openai(
    id: &'static str,
    dimension: usize,
    speed: Speed,
    quality: Quality,
    description: &'static str,
    use_cases: &'static [&'static str],
) -> EmbeddingModelInfo {
    EmbeddingModelInfo {
        id,
        name: id,
        provider: Provider::OpenAi,
        dimension,
        speed,
        quality,
        memory_mb: 0,
        max_tokens: 8191,
        description,
        use_cases,
    }
}

static MODELS: &[EmbeddingModelInfo] = &[
    local(
        "sentence-transformers/all-MiniLM-L6-v2",
        "all-MiniLM-L6-v2",
        384,
        Speed::Fast,
        Quality::Good,
        90,
        "Fast, lightweight model with a good balance of speed and quality.",
        &["general", "documentation", "quick-search"],
    ),
    local(
        "BAAI/bge-small-en-v1.5",
        "bge-small-en-v1.5",
        384,
        Speed::Fast,
        Quality::Excellent,
        130,
        "Excellent quality for its size; well suited to technical docs.",
        &["technical", "code", "documentation"],
    ),
    local(
        "sentence-transformers/all-mpnet-base-v2",
        "all-mpnet-base-v2",
        768,
        Speed::Medium,
        Quality::Excellent,
        420,
        "High quality general-purpose model.",
        &["general", "semantic-search", "qa"],
    ),
    local(
        "BAAI/bge-base-en-v1.5",
        "bge-base-en-v1.5",
        768,
        Speed::Medium,
        Quality::Excellent,
        440,
        "Strong retrieval model for technical content.",
        &["retrieval", "technical", "code"],
    ),
    local(
        "thenlper/gte-base",
        "gte-base",
        768,
        Speed::Medium,
        Quality::Excellent,
        440,
        "Handles long documents and technical content well.",
        &["long-documents", "technical", "academic"],
    ),
    local(
        "BAAI/bge-large-en-v1.5",
        "bge-large-en-v1.5",
        1024,
        Speed::Slow,
        Quality::Excellent,
        1340,
        "Highest quality BGE model; needs more memory.",
        &["high-precision", "academic", "legal"],
    ),
    openai(
        "text-embedding-3-small",
        1536,
        Speed::Fast,
        Quality::Excellent,
        "Efficient OpenAI embedding model. Requires an API key.",
        &["cloud", "production", "multilingual"],
    ),
    openai(
        "text-embedding-3-large",
        3072,
        Speed::Medium,
        Quality::Excellent,
        "Highest quality OpenAI embedding model. Requires an API key.",
        &["high-precision", "production", "multilingual"],
    ),
    openai(
        "text-embedding-ada-002",
        1536,
        Speed::Fast,
        Quality::Good,
        "Legacy OpenAI embedding model; prefer text-embedding-3-small.",
        &["legacy", "compatibility"],
    ),
];

pub fn all_models() -> &'static [EmbeddingModelInfo] {
    MODELS
}

pub fn get_model_info(name: &str) -> Option<&'static EmbeddingModelInfo> {
    MODELS.iter().find(|m| m.id == name)
}

pub fn is_openai_pattern(name: &str) -> bool {
    name.starts_with("text-embedding-")
}

/// `org/name` with both halves non-empty.
pub fn is_huggingface_pattern(name: &str) -> bool {
    matches!(name.split_once('/'), Some((org, model)) if !org.is_empty() && !model.is_empty() && !model.contains('/'))
}

/// Provider for a registered or pattern-matched name.
pub fn detect_provider(name: &str) -> Option<Provider> {
    if let Some(info) = get_model_info(name) {
        return Some(info.provider);
    }
    if is_openai_pattern(name) {
        Some(Provider::OpenAi)
    } else if is_huggingface_pattern(name) {
        Some(Provider::Local)
    } else {
        None
    }
}

pub fn get_model_dimension(name: &str) -> Result<usize> {
    if let Some(info) = get_model_info(name) {
        return Ok(info.dimension);
    }
    if is_openai_pattern(name) {
        return Ok(OPENAI_DEFAULT_DIMENSION);
    }
    if is_huggingface_pattern(name) {
        return Ok(FALLBACK_DIMENSION);
    }
    Err(Error::UnknownModel(name.to_string()))
}

/// Non-throwing check. A valid name may still carry a warning.
pub fn validate_model(name: &str) -> (bool, Option<String>) {
    if get_model_info(name).is_some() || is_openai_pattern(name) {
        return (true, None);
    }
    if is_huggingface_pattern(name) {
        return (true, Some(format!("Using custom model '{name}'. Dimension will be confirmed at load time.")));
    }
    (false, Some(format!("Unknown model: '{name}'. Use a registered model or HuggingFace format (org/model-name).")))
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ModelFilter {
    pub provider: Option<Provider>,
    pub speed: Option<Speed>,
    pub min_quality: Option<Quality>,
}

/// Grouped by speed class (fast, medium, slow), ordered by id within a group.
pub fn list_models(filter: ModelFilter) -> Vec<&'static EmbeddingModelInfo> {
    let mut out: Vec<_> = MODELS
        .iter()
        .filter(|m| filter.provider.map_or(true, |p| m.provider == p))
        .filter(|m| filter.speed.map_or(true, |s| m.speed == s))
        .filter(|m| filter.min_quality.map_or(true, |q| m.quality >= q))
        .collect();
    out.sort_by(|a, b| a.speed.cmp(&b.speed).then_with(|| a.id.cmp(b.id)));
    out
}

/// Best model for `use_case`.
///
/// Highest quality among models listing the use case, then the faster speed
/// class, then id. `production` prefers the best remote model; `general` or an
/// empty use case prefers the fastest local model of at least good quality.
/// Unknown use cases fall back to the default model.
pub fn get_recommended_model(use_case: &str) -> &'static EmbeddingModelInfo {
    let by_rank = |a: &&EmbeddingModelInfo, b: &&EmbeddingModelInfo| {
        b.quality.cmp(&a.quality).then_with(|| a.speed.cmp(&b.speed)).then_with(|| a.id.cmp(b.id))
    };
    let picked = match use_case {
        "" | "general" => MODELS
            .iter()
            .filter(|m| m.provider == Provider::Local && m.quality >= Quality::Good)
            .min_by(|a, b| a.speed.cmp(&b.speed).then_with(|| a.memory_mb.cmp(&b.memory_mb)).then_with(|| a.id.cmp(b.id))),
        "production" => MODELS.iter().filter(|m| m.provider == Provider::OpenAi).min_by(by_rank),
        other => MODELS.iter().filter(|m| m.supports(other)).min_by(by_rank),
    };
    picked.or_else(|| get_model_info(DEFAULT_MODEL)).unwrap_or(&MODELS[0])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_model_is_registered() {
        assert_eq!(get_model_info(DEFAULT_MODEL).map(|m| m.dimension), Some(384));
    }

    #[test]
    fn hf_pattern_needs_exactly_one_slash() {
        assert!(is_huggingface_pattern("org/model"));
        assert!(!is_huggingface_pattern("org/"));
        assert!(!is_huggingface_pattern("/model"));
        assert!(!is_huggingface_pattern("a/b/c"));
        assert!(!is_huggingface_pattern("plain"));
    }
}
