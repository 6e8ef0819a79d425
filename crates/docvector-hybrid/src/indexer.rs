//! Indexing path: chunk a document, embed its chunks and upsert them.
use std::sync::Arc;

use futures::stream::{self, StreamExt};
use serde_json::json;
use tracing::{info, warn};

use docvector_core::chunker::Chunker;
use docvector_core::documents::SourceDocument;
use docvector_core::error::{Error, Result};
use docvector_core::filter::{Filter, Range};
use docvector_core::traits::{Embedder, VectorStore};
use docvector_core::types::{Chunk, DistanceMetric, Payload, VectorRecord};

const DEFAULT_CONCURRENCY: usize = 4;

pub struct DocumentIndexer {
    embedder: Arc<dyn Embedder>,
    store: Arc<dyn VectorStore>,
    chunker: Chunker,
    collection: String,
    concurrency: usize,
}

#[derive(Debug, Default)]
pub struct IndexSummary {
    pub documents: usize,
    pub chunks: usize,
    pub failures: Vec<(String, Error)>,
}

/// `{source_id}:{index}`
pub fn chunk_id(source_id: &str, index: usize) -> String {
    format!("{source_id}:{index}")
}

fn chunk_payload(chunk: &Chunk, index: usize, metadata: &Payload) -> Payload {
    let mut payload = metadata.clone();
    payload.insert("source_id".into(), json!(chunk.source_id));
    payload.insert("chunk_index".into(), json!(index));
    payload.insert("start_offset".into(), json!(chunk.start_offset));
    payload.insert("end_offset".into(), json!(chunk.end_offset));
    payload.insert("content".into(), json!(chunk.text));
    payload
}

impl DocumentIndexer {
    pub fn new(
        embedder: Arc<dyn Embedder>,
        store: Arc<dyn VectorStore>,
        chunker: Chunker,
        collection: impl Into<String>,
    ) -> Self {
        Self { embedder, store, chunker, collection: collection.into(), concurrency: DEFAULT_CONCURRENCY }
    }

    #[must_use]
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    pub fn collection(&self) -> &str {
        &self.collection
    }

    /// Creates the collection sized for the embedder, cosine metric.
    pub async fn ensure_collection(&self) -> Result<()> {
        self.store
            .create_collection(&self.collection, self.embedder.dimension(), DistanceMetric::Cosine)
            .await
    }

    /// Returns the number of chunks written. Chunks left over from a longer
    /// previous version of the document are removed afterwards.
    pub async fn index_document(&self, doc: &SourceDocument) -> Result<usize> {
        let chunks: Vec<Chunk> = self.chunker.chunk(&doc.text, &doc.source_id).collect();
        if !chunks.is_empty() {
            let texts: Vec<String> = chunks.iter().map(|c| c.text.clone()).collect();
            let vectors = self.embedder.embed(&texts).await?;
            if vectors.len() != chunks.len() {
                return Err(Error::Operation(format!(
                    "embedder returned {} vectors for {} chunks",
                    vectors.len(),
                    chunks.len()
                )));
            }
            let records: Vec<VectorRecord> = chunks
                .iter()
                .zip(vectors)
                .enumerate()
                .map(|(i, (chunk, vector))| {
                    VectorRecord::new(chunk_id(&doc.source_id, i), vector)
                        .with_payload(chunk_payload(chunk, i, &doc.metadata))
                })
                .collect();
            self.store.upsert(&self.collection, records).await?;
        }
        let stale = Filter::All(vec![
            Filter::eq("source_id", doc.source_id.as_str()),
            Filter::range("chunk_index", Range { gte: Some(chunks.len() as f64), ..Range::default() }),
        ]);
        let removed = self.store.delete_by_filter(&self.collection, &stale).await?;
        if removed > 0 {
            info!(source_id = %doc.source_id, removed, "dropped stale chunks");
        }
        Ok(chunks.len())
    }

    /// Indexes documents with at most `concurrency` in flight. `progress` is
    /// called once per finished document.
    pub async fn index_many<F>(&self, docs: &[SourceDocument], progress: F) -> IndexSummary
    where
        F: Fn(&SourceDocument, &Result<usize>),
    {
        let mut results = stream::iter(docs)
            .map(|doc| async move { (doc, self.index_document(doc).await) })
            .buffer_unordered(self.concurrency);
        let mut summary = IndexSummary::default();
        while let Some((doc, result)) = results.next().await {
            progress(doc, &result);
            match result {
                Ok(n) => {
                    summary.documents += 1;
                    summary.chunks += n;
                }
                Err(e) => {
                    warn!(source_id = %doc.source_id, error = %e, "indexing failed");
                    summary.failures.push((doc.source_id.clone(), e));
                }
            }
        }
        info!(
            collection = %self.collection,
            documents = summary.documents,
            chunks = summary.chunks,
            failed = summary.failures.len(),
            "indexing finished"
        );
        summary
    }

    /// Deletes every chunk of one source document.
    pub async fn remove_source(&self, source_id: &str) -> Result<usize> {
        self.store.delete_by_filter(&self.collection, &Filter::eq("source_id", source_id)).await
    }
}
