//! Sentence-transformer style BERT inference on candle.
use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use candle_core::{DType, Device, Tensor};
use candle_nn::VarBuilder;
use candle_transformers::models::bert::{BertModel, Config as BertConfig};
use tokenizers::Tokenizer;
use tracing::{debug, info};

use crate::backend::InferenceBackend;
use crate::device::select_device;
use crate::pool::masked_mean_l2;
use crate::tokenize::tokenize_batch;

#[derive(serde::Deserialize)]
struct ModelShape {
    hidden_size: usize,
    max_position_embeddings: usize,
}

pub struct BertBackend {
    model: BertModel,
    tokenizer: Tokenizer,
    device: Device,
    max_len: usize,
    dim: usize,
}

impl BertBackend {
    /// Loads `config.json`, `tokenizer.json` and either `model.safetensors`
    /// or `pytorch_model.bin` from the model's directory under `models_dir`.
    pub fn load(models_dir: &Path, model_name: &str, device_hint: &str, max_tokens: usize) -> Result<Self> {
        let model_dir = resolve_model_dir(models_dir, model_name)?;
        let device = select_device(device_hint);
        info!(model = model_name, dir = %model_dir.display(), "loading embedding model");

        let tokenizer_path = model_dir.join("tokenizer.json");
        let tokenizer = Tokenizer::from_file(&tokenizer_path)
            .map_err(|e| anyhow!("Failed to load tokenizer from {}: {}", tokenizer_path.display(), e))?;

        let config_path = model_dir.join("config.json");
        let raw = std::fs::read_to_string(&config_path).with_context(|| format!("reading {}", config_path.display()))?;
        let config: BertConfig = serde_json::from_str(&raw).with_context(|| format!("parsing {}", config_path.display()))?;
        let shape: ModelShape = serde_json::from_str(&raw)?;

        let weights = load_weights(&model_dir)?;
        let vb = VarBuilder::from_tensors(weights, DType::F32, &device);
        let model = BertModel::load(vb, &config).context("building BERT model")?;

        let max_len = max_tokens.min(shape.max_position_embeddings);
        let dim = shape.hidden_size;
        info!(model = model_name, dim, max_len, "embedding model ready");
        Ok(Self { model, tokenizer, device, max_len, dim })
    }
}

impl InferenceBackend for BertBackend {
    fn dimension(&self) -> Option<usize> {
        Some(self.dim)
    }

    fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(vec![]);
        }
        let start = std::time::Instant::now();
        let (input_ids, attention_mask) = tokenize_batch(&self.tokenizer, texts, self.max_len, &self.device)?;
        let token_type_ids = input_ids.zeros_like()?;
        let hidden = self.model.forward(&input_ids, &token_type_ids, Some(&attention_mask))?;
        let pooled = masked_mean_l2(&hidden, &attention_mask)?;
        let out = pooled.to_device(&Device::Cpu)?.to_vec2::<f32>()?;
        debug!(batch = texts.len(), elapsed_ms = start.elapsed().as_millis(), "embedded batch");
        Ok(out)
    }
}

fn load_weights(model_dir: &Path) -> Result<HashMap<String, Tensor>> {
    let safetensors = model_dir.join("model.safetensors");
    if safetensors.exists() {
        return candle_core::safetensors::load(&safetensors, &Device::Cpu)
            .with_context(|| format!("loading {}", safetensors.display()));
    }
    let pickle = model_dir.join("pytorch_model.bin");
    let weights = candle_core::pickle::read_all(&pickle).with_context(|| format!("loading {}", pickle.display()))?;
    Ok(weights.into_iter().collect())
}

/// `<models_dir>/<org>__<name>`, `<models_dir>/<org>/<name>`, then
/// `<models_dir>/<name>`.
fn resolve_model_dir(models_dir: &Path, model_name: &str) -> Result<PathBuf> {
    let mut candidates = vec![models_dir.join(model_name.replace('/', "__")), models_dir.join(model_name)];
    if let Some((_, short)) = model_name.rsplit_once('/') {
        candidates.push(models_dir.join(short));
    }
    candidates
        .into_iter()
        .find(|p| p.join("config.json").exists())
        .ok_or_else(|| anyhow!("model '{}' not found under {}", model_name, models_dir.display()))
}
