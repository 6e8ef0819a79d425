//! Embedder backed by an OpenAI-compatible `/embeddings` endpoint.
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::{StreamExt, TryStreamExt};
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use tracing::debug;

use docvector_core::config::EmbeddingSettings;
use docvector_core::error::{Error, Result};
use docvector_core::retry::{with_timeout, RetryPolicy};
use docvector_core::traits::Embedder;
use docvector_core::types::Provider;

use crate::registry;

pub struct OpenAiEmbedder {
    client: Client,
    endpoint: String,
    model: String,
    dimension: usize,
    batch_size: usize,
    timeout: Duration,
    retry: RetryPolicy,
    permits: Arc<Semaphore>,
    concurrency: usize,
}

impl OpenAiEmbedder {
    pub fn new(settings: &EmbeddingSettings) -> Result<Self> {
        let model = settings.model.as_str();
        match registry::detect_provider(model) {
            Some(Provider::OpenAi) => {}
            Some(Provider::Local) => {
                return Err(Error::WrongProvider {
                    model: model.to_string(),
                    expected: Provider::Local.to_string(),
                    actual: Provider::OpenAi.to_string(),
                });
            }
            None => return Err(Error::UnknownModel(model.to_string())),
        }
        let api_key = settings
            .openai_api_key
            .as_deref()
            .map(str::trim)
            .filter(|k| !k.is_empty())
            .ok_or_else(|| Error::InvalidConfig("embedding.openai_api_key is required for OpenAI models".into()))?;

        let mut headers = HeaderMap::new();
        let auth = HeaderValue::from_str(&format!("Bearer {api_key}"))
            .map_err(|_| Error::InvalidConfig("invalid OpenAI API key".into()))?;
        headers.insert(AUTHORIZATION, auth);
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        let client = Client::builder()
            .default_headers(headers)
            .build()
            .map_err(|e| Error::InvalidConfig(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            endpoint: format!("{}/embeddings", settings.openai_base_url.trim_end_matches('/')),
            model: model.to_string(),
            dimension: registry::get_model_dimension(model)?,
            batch_size: settings.batch_size.max(1),
            timeout: settings.request_timeout(),
            retry: settings.retry_policy(),
            permits: Arc::new(Semaphore::new(settings.max_concurrent_requests.max(1))),
            concurrency: settings.max_concurrent_requests.max(1),
        })
    }

    async fn embed_batch(&self, inputs: &[String]) -> Result<Vec<Vec<f32>>> {
        let _permit = self.permits.acquire().await.map_err(Error::operation)?;
        let vectors = self
            .retry
            .run("openai.embeddings", move || with_timeout(self.timeout, "openai.embeddings", self.request(inputs)))
            .await?;
        for v in &vectors {
            if v.len() != self.dimension {
                return Err(Error::DimensionMismatch { expected: self.dimension, actual: v.len() });
            }
        }
        Ok(vectors)
    }

    async fn request(&self, inputs: &[String]) -> Result<Vec<Vec<f32>>> {
        let body = EmbeddingRequest { model: &self.model, input: inputs };
        let resp = self.client.post(&self.endpoint).json(&body).send().await.map_err(map_transport)?;
        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_else(|_| "<body unavailable>".to_string());
            return Err(map_status(status, &text));
        }
        let mut parsed: EmbeddingResponse = resp.json().await.map_err(map_transport)?;
        parsed.data.sort_by_key(|entry| entry.index);
        if parsed.data.len() != inputs.len() {
            return Err(Error::Operation(format!(
                "OpenAI returned {} embeddings for {} inputs",
                parsed.data.len(),
                inputs.len()
            )));
        }
        debug!(model = %self.model, batch = inputs.len(), "openai embeddings received");
        Ok(parsed.data.into_iter().map(|entry| entry.embedding).collect())
    }
}

/// 401/403 are never retried; 429 and 5xx are.
fn map_status(status: StatusCode, body: &str) -> Error {
    let msg = format!("OpenAI embeddings request failed ({status}): {body}");
    if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
        Error::Auth(msg)
    } else if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
        Error::Connection(msg)
    } else {
        Error::Operation(msg)
    }
}

fn map_transport(err: reqwest::Error) -> Error {
    if err.is_timeout() {
        Error::Timeout(err.to_string())
    } else if err.is_connect() || err.is_request() || err.is_body() {
        Error::Connection(err.to_string())
    } else {
        Error::Operation(err.to_string())
    }
}

#[async_trait]
impl Embedder for OpenAiEmbedder {
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
        let requests: Vec<_> = texts.chunks(self.batch_size).map(|batch| self.embed_batch(batch)).collect();
        let batches: Vec<Vec<Vec<f32>>> = futures::stream::iter(requests)
            .buffered(self.concurrency)
            .try_collect()
            .await?;
        Ok(batches.into_iter().flatten().collect())
    }
}

#[derive(Serialize)]
struct EmbeddingRequest<'a> {
    model: &'a str,
    input: &'a [String],
}

#[derive(Debug, Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingData>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingData {
    embedding: Vec<f32>,
    index: usize,
}
