//! Content-addressed embedding cache keyed by `(model_name, content_hash)`.
//!
//! Entries live until an explicit clear, either in memory or, when the cache
//! is opened over a directory, in a Lance table that later runs reuse. The
//! cache assumes models are pure functions of their input: a cached vector
//! stands in for a fresh one.
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use arrow_array::cast::AsArray;
use arrow_array::types::Float32Type;
use arrow_array::{ListArray, RecordBatch, RecordBatchIterator, StringArray, TimestampMillisecondArray};
use arrow_schema::{DataType, Field, Schema, TimeUnit};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::TryStreamExt;
use lancedb::query::{ExecutableQuery, QueryBase, Select};
use lancedb::{connect, Table};
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use docvector_core::error::{Error, Result};
use docvector_core::traits::Embedder;

/// Directory name used under a store's persist directory. Not a valid
/// collection name, so the two never collide.
pub const CACHE_DIR_NAME: &str = ".embedding_cache";
const CACHE_TABLE: &str = "embeddings";
// keys per `IN (...)` predicate
const KEY_CHUNK: usize = 500;

#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry {
    pub model_name: String,
    pub content_hash: String,
    pub vector: Vec<f32>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub entries: usize,
    pub hits: u64,
    pub misses: u64,
}

type Key = (String, String);

enum Backing {
    Memory(RwLock<HashMap<Key, CacheEntry>>),
    Lance { table: Table, writes: Mutex<()> },
}

pub struct EmbeddingCache {
    backing: Backing,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl Default for EmbeddingCache {
    fn default() -> Self {
        Self::new()
    }
}

/// blake3 of the text with surrounding whitespace and line endings normalised.
pub fn content_hash(text: &str) -> String {
    let normalized = text.trim().replace("\r\n", "\n");
    blake3::hash(normalized.as_bytes()).to_hex().to_string()
}

/// Row key of a persisted entry.
fn entry_key(model: &str, hash: &str) -> String {
    let mut hasher = blake3::Hasher::new();
    hasher.update(model.as_bytes());
    hasher.update(&[0]);
    hasher.update(hash.as_bytes());
    hasher.finalize().to_hex().to_string()
}

fn cache_err(e: impl std::fmt::Display) -> Error {
    Error::Operation(format!("embedding cache: {e}"))
}

fn build_cache_schema() -> Arc<Schema> {
    Arc::new(Schema::new(vec![
        Field::new("key", DataType::Utf8, false),
        Field::new("model_name", DataType::Utf8, false),
        Field::new("content_hash", DataType::Utf8, false),
        Field::new("created_at", DataType::Timestamp(TimeUnit::Millisecond, None), false),
        // variable width: a wrong-length entry must stay detectable
        Field::new("vector", DataType::List(Arc::new(Field::new("item", DataType::Float32, true))), true),
    ]))
}

fn keys_predicate(keys: &[String]) -> String {
    let quoted: Vec<String> = keys.iter().map(|k| format!("'{k}'")).collect();
    format!("key IN ({})", quoted.join(", "))
}

fn model_predicate(model: &str) -> String {
    format!("model_name = '{}'", model.replace('\'', "''"))
}

fn decode_entries(batch: &RecordBatch) -> Result<Vec<CacheEntry>> {
    let string_col = |name: &str| {
        batch
            .column_by_name(name)
            .and_then(|c| c.as_any().downcast_ref::<StringArray>())
            .ok_or_else(|| cache_err(format!("{name} column missing")))
    };
    let models = string_col("model_name")?;
    let hashes = string_col("content_hash")?;
    let created = batch
        .column_by_name("created_at")
        .and_then(|c| c.as_any().downcast_ref::<TimestampMillisecondArray>())
        .ok_or_else(|| cache_err("created_at column missing"))?;
    let vectors = batch
        .column_by_name("vector")
        .and_then(|c| c.as_any().downcast_ref::<ListArray>())
        .ok_or_else(|| cache_err("vector column missing"))?;
    let mut out = Vec::with_capacity(batch.num_rows());
    for i in 0..batch.num_rows() {
        let list = vectors.value(i);
        out.push(CacheEntry {
            model_name: models.value(i).to_string(),
            content_hash: hashes.value(i).to_string(),
            vector: list.as_primitive::<Float32Type>().values().to_vec(),
            created_at: DateTime::from_timestamp_millis(created.value(i)).unwrap_or_default(),
        });
    }
    Ok(out)
}

impl EmbeddingCache {
    /// In-memory cache for the life of the process.
    pub fn new() -> Self {
        Self::with_backing(Backing::Memory(RwLock::new(HashMap::new())))
    }

    /// Cache persisted in a Lance table under `dir`, created on first use.
    pub async fn open(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref();
        tokio::fs::create_dir_all(dir).await?;
        let conn = connect(&dir.to_string_lossy()).execute().await.map_err(cache_err)?;
        let names = conn.table_names().execute().await.map_err(cache_err)?;
        if !names.iter().any(|n| n == CACHE_TABLE) {
            let schema = build_cache_schema();
            let empty = RecordBatchIterator::new(vec![].into_iter(), schema.clone());
            conn.create_table(CACHE_TABLE, Box::new(empty)).execute().await.map_err(cache_err)?;
        }
        let table = conn.open_table(CACHE_TABLE).execute().await.map_err(cache_err)?;
        let entries = table.count_rows(None).await.map_err(cache_err)?;
        info!(dir = %dir.display(), entries, "embedding cache opened");
        Ok(Self::with_backing(Backing::Lance { table, writes: Mutex::new(()) }))
    }

    fn with_backing(backing: Backing) -> Self {
        Self { backing, hits: AtomicU64::new(0), misses: AtomicU64::new(0) }
    }

    pub fn is_persistent(&self) -> bool {
        matches!(self.backing, Backing::Lance { .. })
    }

    /// Entries for whichever of `hashes` are cached, keyed by content hash.
    pub async fn get_many(&self, model: &str, hashes: &[String]) -> Result<HashMap<String, CacheEntry>> {
        let found: HashMap<String, CacheEntry> = match &self.backing {
            Backing::Memory(entries) => {
                let entries = entries.read().unwrap_or_else(PoisonError::into_inner);
                hashes
                    .iter()
                    .filter_map(|h| entries.get(&(model.to_string(), h.clone())).map(|e| (h.clone(), e.clone())))
                    .collect()
            }
            Backing::Lance { table, .. } => {
                let keys: Vec<String> = hashes.iter().map(|h| entry_key(model, h)).collect();
                let mut found = HashMap::new();
                for chunk in keys.chunks(KEY_CHUNK) {
                    let mut stream = table
                        .query()
                        .only_if(keys_predicate(chunk))
                        .select(Select::columns(&["model_name", "content_hash", "created_at", "vector"]))
                        .execute()
                        .await
                        .map_err(cache_err)?;
                    while let Some(batch) = stream.try_next().await.map_err(cache_err)? {
                        for entry in decode_entries(&batch)? {
                            found.insert(entry.content_hash.clone(), entry);
                        }
                    }
                }
                found
            }
        };
        let hits = found.len() as u64;
        self.hits.fetch_add(hits, Ordering::Relaxed);
        self.misses.fetch_add(hashes.len() as u64 - hits.min(hashes.len() as u64), Ordering::Relaxed);
        Ok(found)
    }

    pub async fn get(&self, model: &str, hash: &str) -> Result<Option<CacheEntry>> {
        Ok(self.get_many(model, &[hash.to_string()]).await?.remove(hash))
    }

    /// Inserts or replaces `(hash, vector)` pairs for `model` in one write.
    pub async fn put_many(&self, model: &str, entries: Vec<(String, Vec<f32>)>) -> Result<()> {
        if entries.is_empty() {
            return Ok(());
        }
        let now = Utc::now();
        match &self.backing {
            Backing::Memory(map) => {
                let mut map = map.write().unwrap_or_else(PoisonError::into_inner);
                for (hash, vector) in entries {
                    let entry =
                        CacheEntry { model_name: model.to_string(), content_hash: hash.clone(), vector, created_at: now };
                    map.insert((model.to_string(), hash), entry);
                }
            }
            Backing::Lance { table, writes } => {
                let keys: Vec<String> = entries.iter().map(|(h, _)| entry_key(model, h)).collect();
                let models = vec![model.to_string(); entries.len()];
                let created = vec![now.timestamp_millis(); entries.len()];
                let hashes: Vec<String> = entries.iter().map(|(h, _)| h.clone()).collect();
                let vectors: Vec<Option<Vec<Option<f32>>>> =
                    entries.into_iter().map(|(_, v)| Some(v.into_iter().map(Some).collect())).collect();
                let schema = build_cache_schema();
                let batch = RecordBatch::try_new(
                    schema.clone(),
                    vec![
                        Arc::new(StringArray::from(keys)),
                        Arc::new(StringArray::from(models)),
                        Arc::new(StringArray::from(hashes)),
                        Arc::new(TimestampMillisecondArray::from(created)),
                        Arc::new(ListArray::from_iter_primitive::<Float32Type, _, _>(vectors)),
                    ],
                )
                .map_err(cache_err)?;
                let reader = Box::new(RecordBatchIterator::new(vec![Ok(batch)].into_iter(), schema));
                let _guard = writes.lock().await;
                let mut mi = table.merge_insert(&["key"]);
                mi.when_matched_update_all(None).when_not_matched_insert_all();
                mi.execute(reader).await.map_err(cache_err)?;
            }
        }
        Ok(())
    }

    pub async fn put(&self, model: &str, hash: &str, vector: Vec<f32>) -> Result<()> {
        self.put_many(model, vec![(hash.to_string(), vector)]).await
    }

    pub async fn evict(&self, model: &str, hash: &str) -> Result<bool> {
        match &self.backing {
            Backing::Memory(map) => Ok(map
                .write()
                .unwrap_or_else(PoisonError::into_inner)
                .remove(&(model.to_string(), hash.to_string()))
                .is_some()),
            Backing::Lance { table, writes } => {
                let predicate = format!("key = '{}'", entry_key(model, hash));
                let _guard = writes.lock().await;
                let present = table.count_rows(Some(predicate.clone())).await.map_err(cache_err)?;
                if present > 0 {
                    table.delete(&predicate).await.map_err(cache_err)?;
                }
                Ok(present > 0)
            }
        }
    }

    pub async fn clear(&self) -> Result<()> {
        match &self.backing {
            Backing::Memory(map) => map.write().unwrap_or_else(PoisonError::into_inner).clear(),
            Backing::Lance { table, writes } => {
                let _guard = writes.lock().await;
                table.delete("key IS NOT NULL").await.map_err(cache_err)?;
            }
        }
        Ok(())
    }

    /// Drops every entry for `model`; returns how many were removed.
    pub async fn clear_model(&self, model: &str) -> Result<usize> {
        match &self.backing {
            Backing::Memory(map) => {
                let mut map = map.write().unwrap_or_else(PoisonError::into_inner);
                let before = map.len();
                map.retain(|(m, _), _| m != model);
                Ok(before - map.len())
            }
            Backing::Lance { table, writes } => {
                let predicate = model_predicate(model);
                let _guard = writes.lock().await;
                let matched = table.count_rows(Some(predicate.clone())).await.map_err(cache_err)?;
                if matched > 0 {
                    table.delete(&predicate).await.map_err(cache_err)?;
                }
                Ok(matched)
            }
        }
    }

    pub async fn len(&self) -> Result<usize> {
        match &self.backing {
            Backing::Memory(map) => Ok(map.read().unwrap_or_else(PoisonError::into_inner).len()),
            Backing::Lance { table, .. } => table.count_rows(None).await.map_err(cache_err),
        }
    }

    pub async fn is_empty(&self) -> Result<bool> {
        Ok(self.len().await? == 0)
    }

    pub async fn stats(&self) -> Result<CacheStats> {
        Ok(CacheStats {
            entries: self.len().await?,
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
        })
    }
}

/// Wraps another embedder; only cache misses reach it, as one batch in
/// first-seen order. Cache failures degrade to recomputation.
pub struct CachingEmbedder {
    inner: Arc<dyn Embedder>,
    cache: Arc<EmbeddingCache>,
}

impl CachingEmbedder {
    pub fn new(inner: Arc<dyn Embedder>, cache: Arc<EmbeddingCache>) -> Self {
        Self { inner, cache }
    }

    pub fn cache(&self) -> &Arc<EmbeddingCache> {
        &self.cache
    }

    pub fn inner(&self) -> &Arc<dyn Embedder> {
        &self.inner
    }
}

#[async_trait]
impl Embedder for CachingEmbedder {
    fn model_name(&self) -> &str {
        self.inner.model_name()
    }

    fn dimension(&self) -> usize {
        self.inner.dimension()
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let model = self.inner.model_name();
        let dim = self.inner.dimension();
        let hashes: Vec<String> = texts.iter().map(|t| content_hash(t)).collect();

        // first occurrence of each distinct hash
        let mut first: HashMap<&str, usize> = HashMap::new();
        let mut unique: Vec<String> = Vec::new();
        for (i, hash) in hashes.iter().enumerate() {
            if !first.contains_key(hash.as_str()) {
                first.insert(hash, i);
                unique.push(hash.clone());
            }
        }

        let mut found = self.cache.get_many(model, &unique).await.unwrap_or_else(|e| {
            warn!(model, error = %e, "embedding cache lookup failed, recomputing");
            HashMap::new()
        });

        let mut resolved: HashMap<&str, Vec<f32>> = HashMap::new();
        // hash -> position in the miss batch
        let mut pending: HashMap<&str, usize> = HashMap::new();
        let mut miss_texts: Vec<String> = Vec::new();
        for hash in &unique {
            match found.remove(hash) {
                Some(entry) if entry.vector.len() == dim => {
                    resolved.insert(hash, entry.vector);
                }
                Some(entry) => {
                    let err = Error::CacheCorruption(format!(
                        "entry {hash} for {model} has {} values, expected {dim}",
                        entry.vector.len()
                    ));
                    warn!(error = %err, "evicting and recomputing");
                    if let Err(e) = self.cache.evict(model, hash).await {
                        warn!(model, error = %e, "embedding cache eviction failed");
                    }
                    pending.insert(hash, miss_texts.len());
                    miss_texts.push(texts[first[hash.as_str()]].clone());
                }
                None => {
                    pending.insert(hash, miss_texts.len());
                    miss_texts.push(texts[first[hash.as_str()]].clone());
                }
            }
        }

        if !miss_texts.is_empty() {
            debug!(model, hits = resolved.len(), misses = miss_texts.len(), "embedding cache lookup");
            let fresh = self.inner.embed(&miss_texts).await?;
            if fresh.len() != miss_texts.len() {
                return Err(Error::Operation(format!(
                    "embedder returned {} vectors for {} texts",
                    fresh.len(),
                    miss_texts.len()
                )));
            }
            // populate only after the whole batch succeeded
            let entries: Vec<(String, Vec<f32>)> =
                pending.iter().map(|(hash, &pos)| ((*hash).to_string(), fresh[pos].clone())).collect();
            if let Err(e) = self.cache.put_many(model, entries).await {
                warn!(model, error = %e, "embedding cache write failed");
            }
            for (hash, pos) in pending {
                resolved.insert(hash, fresh[pos].clone());
            }
        }

        hashes
            .iter()
            .enumerate()
            .map(|(i, hash)| {
                resolved
                    .get(hash.as_str())
                    .cloned()
                    .ok_or_else(|| Error::Operation(format!("no embedding produced for input {i}")))
            })
            .collect()
    }
}
