//! Query path: embed the query, over-fetch vector candidates, re-rank them
//! with keyword overlap and return the fused top results.
use std::cmp::Ordering;
use std::sync::Arc;

use serde::Serialize;
use tracing::debug;

use docvector_core::config::SearchSettings;
use docvector_core::error::{Error, Result};
use docvector_core::filter::Filter;
use docvector_core::traits::{Embedder, VectorStore};
use docvector_core::types::{DistanceMetric, Payload, SearchResult};
use docvector_text::{KeywordScorer, QueryTerms};

/// A fused result with the parts that produced its score.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HybridHit {
    pub id: String,
    pub score: f32,
    pub vector_score: f32,
    pub keyword_score: f32,
    /// 0-based position in the vector candidate list.
    pub vector_rank: usize,
    pub payload: Payload,
}

impl From<HybridHit> for SearchResult {
    fn from(h: HybridHit) -> Self {
        SearchResult { id: h.id, score: h.score, payload: h.payload }
    }
}

pub struct HybridSearchEngine {
    embedder: Arc<dyn Embedder>,
    store: Arc<dyn VectorStore>,
    scorer: KeywordScorer,
    settings: SearchSettings,
}

/// Maps a store score to [0, 1]. Cosine and dot come in [-1, 1]; euclidean
/// scores are already `1 / (1 + d)`.
///
/// Dot assumes unit-length embeddings. Raw inner products above 1 saturate
/// at 1.0, so such candidates tie on the vector part and are separated only
/// by keyword score and then by their original vector rank.
pub fn normalize_vector_score(metric: DistanceMetric, score: f32) -> f32 {
    match metric {
        DistanceMetric::Cosine | DistanceMetric::Dot => ((score + 1.0) / 2.0).clamp(0.0, 1.0),
        DistanceMetric::Euclidean => score,
    }
}

/// Fuses best-first vector candidates with keyword scores, applies the score
/// floor and returns at most `top_k` hits.
pub fn fuse(
    candidates: Vec<SearchResult>,
    metric: DistanceMetric,
    terms: &mut QueryTerms,
    settings: &SearchSettings,
    min_score: f32,
    top_k: usize,
) -> Vec<HybridHit> {
    let mut hits: Vec<HybridHit> = candidates
        .into_iter()
        .enumerate()
        .map(|(rank, c)| {
            let vector_score = normalize_vector_score(metric, c.score);
            let keyword_score = terms.score_payload(&c.payload);
            let score = settings.vector_weight * vector_score + settings.keyword_weight * keyword_score;
            HybridHit { id: c.id, score, vector_score, keyword_score, vector_rank: rank, payload: c.payload }
        })
        .filter(|h| h.score >= min_score)
        .collect();
    hits.sort_by(|a, b| {
        b.score
            .total_cmp(&a.score)
            .then(a.vector_rank.cmp(&b.vector_rank))
            .then_with(|| a.id.cmp(&b.id))
    });
    hits.truncate(top_k);
    hits
}

impl HybridSearchEngine {
    pub fn new(embedder: Arc<dyn Embedder>, store: Arc<dyn VectorStore>, settings: SearchSettings) -> Self {
        let scorer = KeywordScorer::new(settings.text_fields.clone());
        Self { embedder, store, scorer, settings }
    }

    pub fn settings(&self) -> &SearchSettings {
        &self.settings
    }

    /// Ranked results as plain data. `min_score` overrides the configured
    /// floor.
    pub async fn search(
        &self,
        query: &str,
        collection: &str,
        top_k: usize,
        min_score: Option<f32>,
    ) -> Result<Vec<SearchResult>> {
        let hits = self.search_detailed(query, collection, top_k, min_score, None).await?;
        Ok(hits.into_iter().map(SearchResult::from).collect())
    }

    pub async fn search_detailed(
        &self,
        query: &str,
        collection: &str,
        top_k: usize,
        min_score: Option<f32>,
        filter: Option<&Filter>,
    ) -> Result<Vec<HybridHit>> {
        if top_k == 0 {
            return Ok(vec![]);
        }
        let metric = self.store.get_collection_info(collection).await?.distance_metric;
        let vector = self
            .embedder
            .embed(&[query.to_string()])
            .await?
            .pop()
            .ok_or_else(|| Error::Operation("embedder returned no vector for the query".into()))?;

        let fetch = top_k.saturating_mul(self.settings.oversample.max(1));
        let candidates = self.store.search(collection, &vector, fetch, filter).await?;
        let fetched = candidates.len();

        let mut terms = self.scorer.query_terms(query);
        let floor = min_score.unwrap_or(self.settings.min_score);
        let hits = fuse(candidates, metric, &mut terms, &self.settings, floor, top_k);
        debug!(collection, top_k, fetched, returned = hits.len(), min_score = floor, "hybrid search");
        Ok(hits)
    }
}
