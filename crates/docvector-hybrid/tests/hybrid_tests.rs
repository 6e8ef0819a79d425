use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use docvector_core::chunker::{ChunkStrategy, Chunker};
use docvector_core::config::{EmbeddingSettings, SearchSettings};
use docvector_core::documents::SourceDocument;
use docvector_core::error::{Error, Result};
use docvector_core::filter::Filter;
use docvector_core::traits::{Embedder, VectorStore};
use docvector_core::types::{CollectionInfo, DistanceMetric, Payload, SearchResult, VectorRecord};
use docvector_embed::create_embedder;
use docvector_hybrid::{DocumentIndexer, HybridSearchEngine};
use docvector_vector::LanceVectorStore;
use serde_json::json;
use tempfile::TempDir;

const TOKIO_DOC: &str = "The tokio runtime schedules async tasks across worker threads. \
Spawning a task returns a join handle that can be awaited.";
const SERDE_DOC: &str = "Serde derives serializers and deserializers for Rust structs. \
Attributes such as rename and default tune the generated code.";
const CARGO_DOC: &str = "Cargo workspaces share one lock file and one target directory. \
Members are listed in the root manifest.";

struct Fixture {
    _tmp: TempDir,
    embedder: Arc<dyn Embedder>,
    store: Arc<dyn VectorStore>,
    indexer: DocumentIndexer,
}

async fn fixture() -> Fixture {
    let tmp = TempDir::new().expect("tmp");
    let settings = EmbeddingSettings { fake: true, ..EmbeddingSettings::default() };
    let embedder = create_embedder(&settings).expect("embedder");
    let store: Arc<dyn VectorStore> = Arc::new(LanceVectorStore::new(tmp.path().join("lance")));
    store.initialize().await.expect("init");
    let chunker = Chunker::new(ChunkStrategy::Fixed, 1000, 100).expect("chunker");
    let indexer = DocumentIndexer::new(Arc::clone(&embedder), Arc::clone(&store), chunker, "docs");
    indexer.ensure_collection().await.expect("collection");
    Fixture { _tmp: tmp, embedder, store, indexer }
}

fn docs() -> Vec<SourceDocument> {
    let mut tokio = SourceDocument::new("tokio.md", TOKIO_DOC);
    tokio.metadata.insert("title".into(), json!("Tokio"));
    vec![tokio, SourceDocument::new("serde.md", SERDE_DOC), SourceDocument::new("cargo.md", CARGO_DOC)]
}

#[tokio::test]
async fn indexing_then_hybrid_query() {
    let fx = fixture().await;
    let seen = AtomicUsize::new(0);
    let summary = fx
        .indexer
        .index_many(&docs(), |_, _| {
            seen.fetch_add(1, Ordering::SeqCst);
        })
        .await;
    assert_eq!(summary.documents, 3);
    assert_eq!(summary.chunks, 3);
    assert!(summary.failures.is_empty());
    assert_eq!(seen.load(Ordering::SeqCst), 3);
    assert_eq!(fx.store.count("docs").await.expect("count"), 3);

    let engine = HybridSearchEngine::new(Arc::clone(&fx.embedder), Arc::clone(&fx.store), SearchSettings::default());
    let results = engine.search(TOKIO_DOC, "docs", 2, None).await.expect("search");
    assert!(!results.is_empty());
    assert_eq!(results[0].id, "tokio.md:0");
    assert!(results[0].score > 0.9);
    assert!(results.windows(2).all(|w| w[0].score >= w[1].score));

    let p = &results[0].payload;
    assert_eq!(p["source_id"], json!("tokio.md"));
    assert_eq!(p["chunk_index"], json!(0));
    assert_eq!(p["start_offset"], json!(0));
    assert_eq!(p["end_offset"], json!(TOKIO_DOC.chars().count()));
    assert_eq!(p["title"], json!("Tokio"));
}

#[tokio::test]
async fn min_score_override_wins() {
    let fx = fixture().await;
    fx.indexer.index_many(&docs(), |_, _| {}).await;
    let engine = HybridSearchEngine::new(Arc::clone(&fx.embedder), Arc::clone(&fx.store), SearchSettings::default());
    assert!(engine.search(SERDE_DOC, "docs", 3, Some(1.5)).await.expect("search").is_empty());
    let all = engine.search(SERDE_DOC, "docs", 3, Some(f32::MIN)).await.expect("search");
    assert_eq!(all.len(), 3);
    assert_eq!(all[0].id, "serde.md:0");
}

#[tokio::test]
async fn reindexing_a_shorter_document_drops_stale_chunks() {
    let fx = fixture().await;
    let long: String = std::iter::repeat("rust ownership borrowing lifetimes ").take(100).collect();
    let chunks = fx.indexer.index_document(&SourceDocument::new("guide.md", long)).await.expect("index");
    assert!(chunks > 1);
    assert_eq!(fx.store.count("docs").await.expect("count"), chunks);

    let n = fx.indexer.index_document(&SourceDocument::new("guide.md", "short now")).await.expect("reindex");
    assert_eq!(n, 1);
    assert_eq!(fx.store.count("docs").await.expect("count"), 1);

    assert_eq!(fx.indexer.remove_source("guide.md").await.expect("remove"), 1);
    assert_eq!(fx.store.count("docs").await.expect("count"), 0);
}

#[tokio::test]
async fn missing_collection_is_reported() {
    let fx = fixture().await;
    let engine = HybridSearchEngine::new(Arc::clone(&fx.embedder), Arc::clone(&fx.store), SearchSettings::default());
    let err = engine.search("anything", "nope", 3, None).await.expect_err("missing");
    assert!(matches!(err, Error::NotFound(_)));
}

/// Store double that records the requested limit and replays fixed candidates.
struct ScriptedStore {
    candidates: Vec<SearchResult>,
    last_limit: AtomicUsize,
}

#[async_trait]
impl VectorStore for ScriptedStore {
    fn backend(&self) -> &'static str {
        "scripted"
    }
    async fn initialize(&self) -> Result<()> {
        Ok(())
    }
    async fn close(&self) -> Result<()> {
        Ok(())
    }
    async fn create_collection(&self, _: &str, _: usize, _: DistanceMetric) -> Result<()> {
        Ok(())
    }
    async fn collection_exists(&self, _: &str) -> Result<bool> {
        Ok(true)
    }
    async fn get_collection_info(&self, name: &str) -> Result<CollectionInfo> {
        Ok(CollectionInfo { name: name.into(), dimension: 2, distance_metric: DistanceMetric::Cosine, count: 0 })
    }
    async fn list_collections(&self) -> Result<Vec<String>> {
        Ok(vec![])
    }
    async fn delete_collection(&self, _: &str) -> Result<()> {
        Ok(())
    }
    async fn upsert(&self, _: &str, records: Vec<VectorRecord>) -> Result<usize> {
        Ok(records.len())
    }
    async fn search(&self, _: &str, _: &[f32], limit: usize, _: Option<&Filter>) -> Result<Vec<SearchResult>> {
        self.last_limit.store(limit, Ordering::SeqCst);
        Ok(self.candidates.iter().take(limit).cloned().collect())
    }
    async fn delete(&self, _: &str, _: &[String]) -> Result<usize> {
        Ok(0)
    }
    async fn delete_by_filter(&self, _: &str, _: &Filter) -> Result<usize> {
        Ok(0)
    }
    async fn count(&self, _: &str) -> Result<usize> {
        Ok(self.candidates.len())
    }
}

struct UnitEmbedder;

#[async_trait]
impl Embedder for UnitEmbedder {
    fn model_name(&self) -> &str {
        "unit"
    }
    fn dimension(&self) -> usize {
        2
    }
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        Ok(texts.iter().map(|_| vec![1.0, 0.0]).collect())
    }
}

fn candidate(id: &str, score: f32, content: &str) -> SearchResult {
    let mut payload = Payload::new();
    payload.insert("content".into(), json!(content));
    SearchResult { id: id.into(), score, payload }
}

#[tokio::test]
async fn oversamples_and_reranks_by_keywords() {
    let store = Arc::new(ScriptedStore {
        candidates: vec![
            candidate("v1", 0.90, "vector favourite without the words"),
            candidate("v2", 0.88, "also unrelated"),
            candidate("kw", 0.70, "lifetimes and borrowing in rust"),
            candidate("v3", 0.60, "nothing here"),
        ],
        last_limit: AtomicUsize::new(0),
    });
    let settings = SearchSettings { min_score: 0.0, vector_weight: 0.5, keyword_weight: 0.5, ..SearchSettings::default() };
    let engine = HybridSearchEngine::new(Arc::new(UnitEmbedder), store.clone(), settings);

    let hits = engine.search_detailed("rust borrowing lifetimes", "docs", 2, None, None).await.expect("search");
    assert_eq!(store.last_limit.load(Ordering::SeqCst), 6);
    assert_eq!(hits.len(), 2);
    assert_eq!(hits[0].id, "kw");
    assert_eq!(hits[0].vector_rank, 2);
    assert_eq!(hits[0].keyword_score, 1.0);
    assert_eq!(hits[1].id, "v1");

    assert!(engine.search("rust", "docs", 0, None).await.expect("zero").is_empty());
}
