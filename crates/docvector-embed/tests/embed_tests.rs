use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tempfile::TempDir;

use docvector_core::config::EmbeddingSettings;
use docvector_core::traits::Embedder;
use docvector_core::types::Provider;
use docvector_core::Error;
use docvector_embed::backend::{HashingBackend, InferenceBackend};
use docvector_embed::cache::content_hash;
use docvector_embed::factory::{embedder_info, resolve_provider};
use docvector_embed::{create_embedder, CachingEmbedder, EmbeddingCache, LocalEmbedder, OpenAiEmbedder};

fn fake_settings(model: &str) -> EmbeddingSettings {
    EmbeddingSettings { model: model.to_string(), fake: true, batch_size: 4, ..Default::default() }
}

fn texts(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| (*s).to_string()).collect()
}

/// Records every batch it is asked to embed.
struct RecordingBackend {
    inner: HashingBackend,
    dim: usize,
    batches: Mutex<Vec<Vec<String>>>,
}

impl RecordingBackend {
    fn new(dim: usize) -> Self {
        Self { inner: HashingBackend::new(dim), dim, batches: Mutex::new(vec![]) }
    }
}

impl InferenceBackend for RecordingBackend {
    fn dimension(&self) -> Option<usize> {
        Some(self.dim)
    }

    fn embed(&self, texts: &[String]) -> anyhow::Result<Vec<Vec<f32>>> {
        self.batches.lock().unwrap().push(texts.to_vec());
        self.inner.embed(texts)
    }
}

/// Counts calls and inputs routed to an inner embedder.
struct CountingEmbedder {
    inner: Arc<dyn Embedder>,
    calls: AtomicUsize,
    inputs: Mutex<Vec<Vec<String>>>,
}

#[async_trait]
impl Embedder for CountingEmbedder {
    fn model_name(&self) -> &str {
        self.inner.model_name()
    }

    fn dimension(&self) -> usize {
        self.inner.dimension()
    }

    async fn embed(&self, texts: &[String]) -> docvector_core::Result<Vec<Vec<f32>>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.inputs.lock().unwrap().push(texts.to_vec());
        self.inner.embed(texts).await
    }
}

fn counting(model: &str) -> Arc<CountingEmbedder> {
    let inner: Arc<dyn Embedder> = Arc::new(LocalEmbedder::new(&fake_settings(model)).unwrap());
    Arc::new(CountingEmbedder { inner, calls: AtomicUsize::new(0), inputs: Mutex::new(vec![]) })
}

#[test]
fn local_embedder_rejects_openai_models() {
    let err = LocalEmbedder::new(&fake_settings("text-embedding-3-small")).err().expect("must fail");
    assert!(matches!(err, Error::WrongProvider { .. }), "got {err:?}");
    let err = LocalEmbedder::new(&fake_settings("text-embedding-future")).err().expect("must fail");
    assert!(matches!(err, Error::WrongProvider { .. }));
}

#[test]
fn local_embedder_rejects_unknown_names() {
    let err = LocalEmbedder::new(&fake_settings("nonsense")).err().expect("must fail");
    assert!(matches!(err, Error::UnknownModel(_)));
}

#[test]
fn dimension_is_known_before_first_embed() {
    let e = LocalEmbedder::new(&fake_settings("BAAI/bge-base-en-v1.5")).unwrap();
    assert_eq!(e.dimension(), 768);
    let custom = LocalEmbedder::new(&fake_settings("acme/doc-encoder")).unwrap();
    assert_eq!(custom.dimension(), 384);
}

#[tokio::test]
async fn local_embedder_batches_inputs() {
    let backend = Arc::new(RecordingBackend::new(384));
    let e = LocalEmbedder::with_backend("sentence-transformers/all-MiniLM-L6-v2", 2, backend.clone()).unwrap();
    let out = e.embed(&texts(&["a", "b", "c", "d", "e"])).await.unwrap();
    assert_eq!(out.len(), 5);
    let sizes: Vec<usize> = backend.batches.lock().unwrap().iter().map(Vec::len).collect();
    assert_eq!(sizes, vec![2, 2, 1]);
}

#[tokio::test]
async fn custom_model_with_unexpected_width_is_fatal() {
    let backend = Arc::new(RecordingBackend::new(512));
    let e = LocalEmbedder::with_backend("acme/doc-encoder", 8, backend).unwrap();
    assert_eq!(e.dimension(), 384);
    let err = e.embed(&texts(&["hello"])).await.unwrap_err();
    assert!(matches!(err, Error::DimensionMismatch { expected: 384, actual: 512 }));
}

#[tokio::test]
async fn fake_embeddings_are_deterministic() {
    let e = LocalEmbedder::new(&fake_settings("sentence-transformers/all-MiniLM-L6-v2")).unwrap();
    let a = e.embed(&texts(&["hello world"])).await.unwrap();
    let b = e.embed(&texts(&["hello world"])).await.unwrap();
    assert_eq!(a, b);
    assert_eq!(a[0].len(), 384);
}

#[tokio::test]
async fn cache_routes_only_misses_in_order() {
    let inner = counting("sentence-transformers/all-MiniLM-L6-v2");
    let cache = Arc::new(EmbeddingCache::new());
    let cached = CachingEmbedder::new(inner.clone(), cache.clone());

    let first = cached.embed(&texts(&["alpha", "beta"])).await.unwrap();
    let second = cached.embed(&texts(&["gamma", "alpha", "delta", "beta"])).await.unwrap();

    assert_eq!(inner.calls.load(Ordering::SeqCst), 2);
    assert_eq!(inner.inputs.lock().unwrap()[1], texts(&["gamma", "delta"]));
    assert_eq!(second[1], first[0], "hit is bit-identical");
    assert_eq!(second[3], first[1]);
    assert_eq!(cache.len().await.unwrap(), 4);

    let again = cached.embed(&texts(&["delta"])).await.unwrap();
    assert_eq!(inner.calls.load(Ordering::SeqCst), 2, "all hits, no call");
    assert_eq!(again[0], second[2]);
}

#[tokio::test]
async fn cache_is_transparent() {
    let inner = counting("sentence-transformers/all-MiniLM-L6-v2");
    let uncached = inner.embed(&texts(&["same text"])).await.unwrap();
    let cached = CachingEmbedder::new(inner.clone(), Arc::new(EmbeddingCache::new()));
    let miss = cached.embed(&texts(&["same text"])).await.unwrap();
    let hit = cached.embed(&texts(&["same text"])).await.unwrap();
    assert_eq!(uncached, miss);
    assert_eq!(miss, hit);
}

#[tokio::test]
async fn duplicate_misses_are_embedded_once() {
    let inner = counting("sentence-transformers/all-MiniLM-L6-v2");
    let cached = CachingEmbedder::new(inner.clone(), Arc::new(EmbeddingCache::new()));
    let out = cached.embed(&texts(&["x", "y", "x"])).await.unwrap();
    assert_eq!(out[0], out[2]);
    assert_eq!(inner.inputs.lock().unwrap()[0], texts(&["x", "y"]));
}

#[tokio::test]
async fn corrupt_entries_are_evicted_and_recomputed() {
    let inner = counting("sentence-transformers/all-MiniLM-L6-v2");
    let cache = Arc::new(EmbeddingCache::new());
    cache.put(inner.model_name(), &content_hash("broken"), vec![1.0, 2.0]).await.unwrap();
    let cached = CachingEmbedder::new(inner.clone(), cache.clone());

    let out = cached.embed(&texts(&["broken"])).await.unwrap();
    assert_eq!(out[0].len(), 384);
    assert_eq!(inner.calls.load(Ordering::SeqCst), 1);
    let entry = cache.get(inner.model_name(), &content_hash("broken")).await.unwrap().unwrap();
    assert_eq!(entry.vector.len(), 384);
}

#[tokio::test]
async fn cache_keys_include_the_model() {
    let cache = Arc::new(EmbeddingCache::new());
    let small = CachingEmbedder::new(counting("sentence-transformers/all-MiniLM-L6-v2"), cache.clone());
    let base = CachingEmbedder::new(counting("BAAI/bge-base-en-v1.5"), cache.clone());
    let a = small.embed(&texts(&["shared"])).await.unwrap();
    let b = base.embed(&texts(&["shared"])).await.unwrap();
    assert_eq!((a[0].len(), b[0].len()), (384, 768));
    assert_eq!(cache.len().await.unwrap(), 2);
    assert_eq!(cache.clear_model("BAAI/bge-base-en-v1.5").await.unwrap(), 1);
    cache.clear().await.unwrap();
    assert!(cache.is_empty().await.unwrap());
}

#[tokio::test]
async fn persisted_cache_serves_a_later_run() {
    let dir = TempDir::new().unwrap();
    let first_run = counting("sentence-transformers/all-MiniLM-L6-v2");
    let cache = Arc::new(EmbeddingCache::open(dir.path()).await.unwrap());
    assert!(cache.is_persistent());
    let cached = CachingEmbedder::new(first_run.clone(), cache);
    let before = cached.embed(&texts(&["alpha", "beta"])).await.unwrap();
    assert_eq!(first_run.calls.load(Ordering::SeqCst), 1);
    drop(cached);

    let second_run = counting("sentence-transformers/all-MiniLM-L6-v2");
    let reopened = Arc::new(EmbeddingCache::open(dir.path()).await.unwrap());
    assert_eq!(reopened.len().await.unwrap(), 2);
    let cached = CachingEmbedder::new(second_run.clone(), reopened.clone());
    let after = cached.embed(&texts(&["beta", "alpha"])).await.unwrap();

    assert_eq!(second_run.calls.load(Ordering::SeqCst), 0, "served from disk");
    assert_eq!(after, vec![before[1].clone(), before[0].clone()]);
    let stats = reopened.stats().await.unwrap();
    assert_eq!((stats.entries, stats.hits, stats.misses), (2, 2, 0));
}

#[tokio::test]
async fn persisted_corrupt_entries_are_replaced() {
    let dir = TempDir::new().unwrap();
    let inner = counting("sentence-transformers/all-MiniLM-L6-v2");
    let cache = Arc::new(EmbeddingCache::open(dir.path()).await.unwrap());
    let hash = content_hash("broken");
    cache.put(inner.model_name(), &hash, vec![1.0, 2.0]).await.unwrap();
    cache.put("BAAI/bge-base-en-v1.5", &hash, vec![0.5; 768]).await.unwrap();

    let cached = CachingEmbedder::new(inner.clone(), cache.clone());
    let out = cached.embed(&texts(&["broken"])).await.unwrap();
    assert_eq!(out[0].len(), 384);
    assert_eq!(inner.calls.load(Ordering::SeqCst), 1);

    let reopened = EmbeddingCache::open(dir.path()).await.unwrap();
    let entry = reopened.get(inner.model_name(), &hash).await.unwrap().unwrap();
    assert_eq!(entry.vector, out[0]);
    assert_eq!(reopened.len().await.unwrap(), 2, "one row per model and text");
    assert_eq!(reopened.clear_model("BAAI/bge-base-en-v1.5").await.unwrap(), 1);
    assert!(!reopened.evict("BAAI/bge-base-en-v1.5", &hash).await.unwrap());
}

#[tokio::test]
async fn concurrent_cached_embeds_agree() {
    let cached = Arc::new(CachingEmbedder::new(
        counting("sentence-transformers/all-MiniLM-L6-v2"),
        Arc::new(EmbeddingCache::new()),
    ));
    let mut handles = Vec::new();
    for _ in 0..8 {
        let c = cached.clone();
        handles.push(tokio::spawn(async move { c.embed(&texts(&["concurrent", "reads"])).await.unwrap() }));
    }
    let mut results = Vec::new();
    for h in handles {
        results.push(h.await.unwrap());
    }
    assert!(results.windows(2).all(|w| w[0] == w[1]));
}

#[test]
fn factory_detects_provider_and_rejects_conflicts() {
    let mut s = fake_settings("text-embedding-3-small");
    assert_eq!(resolve_provider(&s).unwrap(), Provider::OpenAi);
    s.provider = Some(Provider::Local);
    assert!(matches!(resolve_provider(&s), Err(Error::WrongProvider { .. })));

    let s = fake_settings("BAAI/bge-small-en-v1.5");
    let e = create_embedder(&s).unwrap();
    assert_eq!(e.dimension(), 384);
    assert_eq!(e.model_name(), "BAAI/bge-small-en-v1.5");
}

#[test]
fn openai_embedder_requires_a_key() {
    let s = fake_settings("text-embedding-3-small");
    assert!(matches!(OpenAiEmbedder::new(&s), Err(Error::InvalidConfig(_))));
    let s = EmbeddingSettings { openai_api_key: Some("sk-test".into()), ..fake_settings("BAAI/bge-small-en-v1.5") };
    assert!(matches!(OpenAiEmbedder::new(&s), Err(Error::WrongProvider { .. })));
    let s = EmbeddingSettings { openai_api_key: Some("sk-test".into()), ..fake_settings("text-embedding-3-large") };
    assert_eq!(OpenAiEmbedder::new(&s).unwrap().dimension(), 3072);
}

#[test]
fn embedder_info_reports_registry_data() {
    let info = embedder_info(&fake_settings("BAAI/bge-large-en-v1.5")).unwrap();
    assert_eq!(info.provider, Provider::Local);
    assert_eq!(info.dimension, 1024);
    assert_eq!(info.registry.map(|m| m.memory_mb), Some(1340));
    let custom = embedder_info(&fake_settings("acme/doc-encoder")).unwrap();
    assert!(custom.registry.is_none());
}

/// Requires `OPENAI_API_KEY`; run with `cargo test -- --ignored`.
#[tokio::test]
#[ignore]
async fn openai_live_embedding() {
    let key = std::env::var("OPENAI_API_KEY").expect("OPENAI_API_KEY");
    let s = EmbeddingSettings { openai_api_key: Some(key), ..fake_settings("text-embedding-3-small") };
    let e = OpenAiEmbedder::new(&s).unwrap();
    let out = e.embed(&texts(&["hello", "world"])).await.unwrap();
    assert_eq!(out.len(), 2);
    assert_eq!(out[0].len(), 1536);
}
