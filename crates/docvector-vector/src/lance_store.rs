//! Embedded vector store on LanceDB.
//!
//! Each collection is its own Lance database under the persist directory,
//! holding a `records` table and a `meta` table (dimension, metric, next
//! insertion sequence). Searches run Lance's flat nearest-neighbour query and
//! rescore the candidates exactly, so ranking is deterministic: best score
//! first, then earliest insertion.
use std::cmp::Reverse;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use arrow_array::cast::AsArray;
use arrow_array::types::Float32Type;
use arrow_array::{FixedSizeListArray, Float64Array, RecordBatch, RecordBatchIterator, StringArray, UInt64Array};
use async_trait::async_trait;
use futures::TryStreamExt;
use lancedb::query::{ExecutableQuery, QueryBase, Select};
use lancedb::{Connection, DistanceType, Table};
use tokio::sync::Mutex;
use tracing::{debug, info};

use docvector_core::error::{Error, Result};
use docvector_core::filter::Filter;
use docvector_core::traits::VectorStore;
use docvector_core::types::{CollectionInfo, DistanceMetric, Payload, SearchResult, VectorRecord};

use crate::predicate::{chunk_index_of, pushdown, source_id_of};
use crate::schema::{build_records_schema, META_TABLE, RECORDS_TABLE};
use crate::scoring::{similarity, tie_key};
use crate::table::{ensure_meta_table, ensure_table, get_meta, open_db, set_meta, sql_quote, table_exists};

const KEY_DIMENSION: &str = "dimension";
const KEY_METRIC: &str = "metric";
const KEY_NEXT_SEQ: &str = "next_seq";
// ids per `IN (...)` predicate
const ID_CHUNK: usize = 500;
// extra nearest neighbours fetched so ties at the cut can be settled
const TIE_SLACK: usize = 16;

pub struct LanceVectorStore {
    root: PathBuf,
    initialized: AtomicBool,
    conns: Mutex<HashMap<String, Connection>>,
    writers: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

struct Row {
    id: String,
    seq: u64,
    payload: Payload,
    vector: Vec<f32>,
}

fn lance_err(e: impl std::fmt::Display) -> Error {
    Error::Operation(format!("lance: {e:#}"))
}

/// Collection names become directory names.
fn validate_name(name: &str) -> Result<()> {
    let ok = !name.is_empty()
        && name.len() <= 128
        && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
        && !name.starts_with('-');
    if ok {
        Ok(())
    } else {
        Err(Error::InvalidConfig(format!(
            "invalid collection name '{name}' (use letters, digits, '_' or '-')"
        )))
    }
}

impl LanceVectorStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            initialized: AtomicBool::new(false),
            conns: Mutex::new(HashMap::new()),
            writers: Mutex::new(HashMap::new()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn ready(&self) -> Result<()> {
        if self.initialized.load(Ordering::Acquire) {
            Ok(())
        } else {
            Err(Error::NotInitialized("lance vector store".into()))
        }
    }

    fn collection_path(&self, name: &str) -> Result<PathBuf> {
        validate_name(name)?;
        Ok(self.root.join(name))
    }

    async fn conn(&self, name: &str) -> Result<Connection> {
        let path = self.collection_path(name)?;
        if let Some(c) = self.conns.lock().await.get(name) {
            return Ok(c.clone());
        }
        let conn = open_db(&path.to_string_lossy()).await.map_err(lance_err)?;
        // a concurrent opener may have won; keep its handle
        let mut conns = self.conns.lock().await;
        Ok(conns.entry(name.to_string()).or_insert(conn).clone())
    }

    /// Serialises writers of one collection.
    async fn writer(&self, name: &str) -> Arc<Mutex<()>> {
        let mut writers = self.writers.lock().await;
        Arc::clone(writers.entry(name.to_string()).or_default())
    }

    /// `None` when the collection does not exist.
    async fn params(&self, name: &str) -> Result<Option<(Connection, usize, DistanceMetric)>> {
        if !self.collection_path(name)?.exists() {
            return Ok(None);
        }
        let conn = self.conn(name).await?;
        let Some(dim) = get_meta(&conn, META_TABLE, KEY_DIMENSION).await.map_err(lance_err)? else {
            return Ok(None);
        };
        let metric = get_meta(&conn, META_TABLE, KEY_METRIC)
            .await
            .map_err(lance_err)?
            .ok_or_else(|| Error::Operation(format!("collection '{name}' has no metric")))?;
        let dim = dim
            .parse::<usize>()
            .map_err(|e| Error::Operation(format!("collection '{name}' has a bad dimension: {e}")))?;
        Ok(Some((conn, dim, metric.parse()?)))
    }

    async fn require(&self, name: &str) -> Result<(Connection, usize, DistanceMetric)> {
        self.params(name)
            .await?
            .ok_or_else(|| Error::NotFound(format!("collection '{name}'")))
    }

    async fn records(conn: &Connection) -> Result<Table> {
        conn.open_table(RECORDS_TABLE).execute().await.map_err(lance_err)
    }

    /// Insertion sequence of each id already stored.
    async fn existing_seqs(table: &Table, ids: &[String]) -> Result<HashMap<String, u64>> {
        let mut out = HashMap::new();
        for chunk in ids.chunks(ID_CHUNK) {
            let mut stream = table
                .query()
                .only_if(id_predicate(chunk))
                .select(Select::columns(&["id", "seq"]))
                .execute()
                .await
                .map_err(lance_err)?;
            while let Some(batch) = stream.try_next().await.map_err(lance_err)? {
                let ids = string_col(&batch, "id")?;
                let seqs = u64_col(&batch, "seq")?;
                for i in 0..batch.num_rows() {
                    out.insert(ids.value(i).to_string(), seqs.value(i));
                }
            }
        }
        Ok(out)
    }

    /// Ids whose payload matches `filter`. Only rows passing the pushed-down
    /// predicate are read, and only their id and payload.
    async fn matching_ids(table: &Table, filter: &Filter) -> Result<Vec<String>> {
        let mut query = table.query().select(Select::columns(&["id", "payload"]));
        if let Some(sql) = pushdown(filter) {
            query = query.only_if(sql);
        }
        let mut stream = query.execute().await.map_err(lance_err)?;
        let mut out = Vec::new();
        while let Some(batch) = stream.try_next().await.map_err(lance_err)? {
            let ids = string_col(&batch, "id")?;
            let payloads = string_col(&batch, "payload")?;
            for i in 0..batch.num_rows() {
                let payload: Payload = serde_json::from_str(payloads.value(i))?;
                if filter.matches(&payload) {
                    out.push(ids.value(i).to_string());
                }
            }
        }
        Ok(out)
    }

    /// The `limit` rows closest to `query` under `metric`, prefiltered by
    /// the pushed-down part of `filter`.
    async fn nearest(
        table: &Table,
        query: &[f32],
        metric: DistanceMetric,
        limit: usize,
        filter: Option<&Filter>,
    ) -> Result<Vec<Row>> {
        let mut search = table
            .vector_search(query.to_vec())
            .map_err(lance_err)?
            .distance_type(distance_type(metric))
            .limit(limit);
        if let Some(sql) = filter.and_then(pushdown) {
            search = search.only_if(sql);
        }
        let mut stream = search.execute().await.map_err(lance_err)?;
        let mut rows = Vec::new();
        while let Some(batch) = stream.try_next().await.map_err(lance_err)? {
            rows.extend(decode_rows(&batch)?);
        }
        Ok(rows)
    }

    async fn delete_ids(table: &Table, ids: &[String]) -> Result<()> {
        for chunk in ids.chunks(ID_CHUNK) {
            table.delete(&id_predicate(chunk)).await.map_err(lance_err)?;
        }
        Ok(())
    }
}

fn distance_type(metric: DistanceMetric) -> DistanceType {
    match metric {
        DistanceMetric::Cosine => DistanceType::Cosine,
        DistanceMetric::Euclidean => DistanceType::L2,
        DistanceMetric::Dot => DistanceType::Dot,
    }
}

fn id_predicate(ids: &[String]) -> String {
    let quoted: Vec<String> = ids.iter().map(|id| sql_quote(id)).collect();
    format!("id IN ({})", quoted.join(", "))
}

fn string_col<'a>(batch: &'a RecordBatch, name: &str) -> Result<&'a StringArray> {
    batch
        .column_by_name(name)
        .and_then(|c| c.as_any().downcast_ref::<StringArray>())
        .ok_or_else(|| Error::Operation(format!("lance: {name} column missing")))
}

fn u64_col<'a>(batch: &'a RecordBatch, name: &str) -> Result<&'a UInt64Array> {
    batch
        .column_by_name(name)
        .and_then(|c| c.as_any().downcast_ref::<UInt64Array>())
        .ok_or_else(|| Error::Operation(format!("lance: {name} column missing")))
}

fn decode_rows(batch: &RecordBatch) -> Result<Vec<Row>> {
    let ids = string_col(batch, "id")?;
    let seqs = u64_col(batch, "seq")?;
    let payloads = string_col(batch, "payload")?;
    let vectors = batch
        .column_by_name("vector")
        .and_then(|c| c.as_any().downcast_ref::<FixedSizeListArray>())
        .ok_or_else(|| Error::Operation("lance: vector column missing".into()))?;
    let mut rows = Vec::with_capacity(batch.num_rows());
    for i in 0..batch.num_rows() {
        let list = vectors.value(i);
        let vector = list.as_primitive::<Float32Type>().values().to_vec();
        let payload: Payload = serde_json::from_str(payloads.value(i))?;
        rows.push(Row { id: ids.value(i).to_string(), seq: seqs.value(i), payload, vector });
    }
    Ok(rows)
}

fn build_batch(dim: usize, rows: &[Row]) -> Result<RecordBatch> {
    let schema = build_records_schema(dim);
    let mut payloads = Vec::with_capacity(rows.len());
    for r in rows {
        payloads.push(serde_json::to_string(&r.payload)?);
    }
    let source_ids: Vec<Option<String>> = rows.iter().map(|r| source_id_of(&r.payload)).collect();
    let chunk_indexes: Vec<Option<f64>> = rows.iter().map(|r| chunk_index_of(&r.payload)).collect();
    let vectors: Vec<Option<Vec<Option<f32>>>> =
        rows.iter().map(|r| Some(r.vector.iter().map(|&x| Some(x)).collect())).collect();
    #[allow(clippy::cast_possible_wrap, clippy::cast_possible_truncation)]
    let width = dim as i32;
    RecordBatch::try_new(
        schema,
        vec![
            Arc::new(StringArray::from(rows.iter().map(|r| r.id.clone()).collect::<Vec<_>>())),
            Arc::new(UInt64Array::from(rows.iter().map(|r| r.seq).collect::<Vec<_>>())),
            Arc::new(StringArray::from(payloads)),
            Arc::new(StringArray::from(source_ids)),
            Arc::new(Float64Array::from(chunk_indexes)),
            Arc::new(FixedSizeListArray::from_iter_primitive::<Float32Type, _, _>(vectors.into_iter(), width)),
        ],
    )
    .map_err(lance_err)
}

#[async_trait]
impl VectorStore for LanceVectorStore {
    fn backend(&self) -> &'static str {
        "lance"
    }

    async fn initialize(&self) -> Result<()> {
        tokio::fs::create_dir_all(&self.root).await?;
        self.initialized.store(true, Ordering::Release);
        info!(root = %self.root.display(), "lance vector store ready");
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.initialized.store(false, Ordering::Release);
        self.conns.lock().await.clear();
        Ok(())
    }

    async fn create_collection(&self, name: &str, dimension: usize, metric: DistanceMetric) -> Result<()> {
        self.ready()?;
        validate_name(name)?;
        if dimension == 0 {
            return Err(Error::InvalidConfig("collection dimension must be greater than zero".into()));
        }
        let lock = self.writer(name).await;
        let _guard = lock.lock().await;
        if let Some((_, dim, existing)) = self.params(name).await? {
            if dim == dimension && existing == metric {
                return Ok(());
            }
            return Err(Error::InvalidConfig(format!(
                "collection '{name}' exists with dimension {dim} and metric {existing}, requested {dimension}/{metric}"
            )));
        }
        let conn = self.conn(name).await?;
        ensure_table(&conn, RECORDS_TABLE, build_records_schema(dimension)).await.map_err(lance_err)?;
        ensure_meta_table(&conn, META_TABLE).await.map_err(lance_err)?;
        set_meta(&conn, META_TABLE, KEY_METRIC, metric.as_str()).await.map_err(lance_err)?;
        set_meta(&conn, META_TABLE, KEY_NEXT_SEQ, "0").await.map_err(lance_err)?;
        // written last: its presence marks the collection as complete
        set_meta(&conn, META_TABLE, KEY_DIMENSION, &dimension.to_string()).await.map_err(lance_err)?;
        info!(collection = name, dimension, %metric, "collection created");
        Ok(())
    }

    async fn collection_exists(&self, name: &str) -> Result<bool> {
        self.ready()?;
        Ok(self.params(name).await?.is_some())
    }

    async fn get_collection_info(&self, name: &str) -> Result<CollectionInfo> {
        self.ready()?;
        let (conn, dimension, distance_metric) = self.require(name).await?;
        let count = Self::records(&conn).await?.count_rows(None).await.map_err(lance_err)?;
        Ok(CollectionInfo { name: name.to_string(), dimension, distance_metric, count })
    }

    async fn list_collections(&self) -> Result<Vec<String>> {
        self.ready()?;
        let mut names = Vec::new();
        let mut dir = tokio::fs::read_dir(&self.root).await?;
        while let Some(entry) = dir.next_entry().await? {
            let name = entry.file_name().to_string_lossy().to_string();
            if validate_name(&name).is_ok() && entry.file_type().await?.is_dir() && self.params(&name).await?.is_some() {
                names.push(name);
            }
        }
        names.sort();
        Ok(names)
    }

    async fn delete_collection(&self, name: &str) -> Result<()> {
        self.ready()?;
        let path = self.collection_path(name)?;
        let lock = self.writer(name).await;
        let _guard = lock.lock().await;
        self.conns.lock().await.remove(name);
        if path.exists() {
            tokio::fs::remove_dir_all(&path).await?;
            info!(collection = name, "collection deleted");
        }
        let mut writers = self.writers.lock().await;
        // the map and this call hold the only references: nobody is queued
        if Arc::strong_count(&lock) == 2 {
            writers.remove(name);
        }
        Ok(())
    }

    async fn upsert(&self, collection: &str, records: Vec<VectorRecord>) -> Result<usize> {
        self.ready()?;
        let lock = self.writer(collection).await;
        let _guard = lock.lock().await;
        let (conn, dim, _) = self.require(collection).await?;
        if let Some(bad) = records.iter().find(|r| r.vector.len() != dim) {
            return Err(Error::DimensionMismatch { expected: dim, actual: bad.vector.len() });
        }
        if records.is_empty() {
            return Ok(0);
        }

        // last write wins within the batch, position of first occurrence
        let mut order: Vec<String> = Vec::new();
        let mut latest: HashMap<String, VectorRecord> = HashMap::new();
        for r in records {
            if !latest.contains_key(&r.id) {
                order.push(r.id.clone());
            }
            latest.insert(r.id.clone(), r);
        }

        let table = Self::records(&conn).await?;
        let existing = Self::existing_seqs(&table, &order).await?;
        let next_seq: u64 = get_meta(&conn, META_TABLE, KEY_NEXT_SEQ)
            .await
            .map_err(lance_err)?
            .and_then(|v| v.parse().ok())
            .unwrap_or(0);
        let fresh = order.iter().filter(|id| !existing.contains_key(*id)).count() as u64;
        if fresh > 0 {
            // reserve the range before writing; gaps after a failed write are harmless
            set_meta(&conn, META_TABLE, KEY_NEXT_SEQ, &(next_seq + fresh).to_string()).await.map_err(lance_err)?;
        }

        let mut seq = next_seq;
        let mut rows = Vec::with_capacity(order.len());
        for id in &order {
            let Some(r) = latest.remove(id) else { continue };
            let row_seq = if let Some(&s) = existing.get(id) {
                s
            } else {
                seq += 1;
                seq - 1
            };
            rows.push(Row { id: r.id, seq: row_seq, payload: r.payload, vector: r.vector });
        }

        let batch = build_batch(dim, &rows)?;
        let schema = batch.schema();
        let reader = Box::new(RecordBatchIterator::new(vec![Ok(batch)].into_iter(), schema));
        let mut mi = table.merge_insert(&["id"]);
        mi.when_matched_update_all(None).when_not_matched_insert_all();
        mi.execute(reader).await.map_err(lance_err)?;
        debug!(collection, upserted = rows.len(), new = fresh, "upsert committed");
        Ok(rows.len())
    }

    async fn search(
        &self,
        collection: &str,
        query: &[f32],
        limit: usize,
        filter: Option<&Filter>,
    ) -> Result<Vec<SearchResult>> {
        self.ready()?;
        let (conn, dim, metric) = self.require(collection).await?;
        if query.len() != dim {
            return Err(Error::DimensionMismatch { expected: dim, actual: query.len() });
        }
        if limit == 0 {
            return Ok(vec![]);
        }
        let table = Self::records(&conn).await?;
        let mut fetch = limit.saturating_add(TIE_SLACK);
        loop {
            let rows = Self::nearest(&table, query, metric, fetch, filter).await?;
            let exhausted = rows.len() < fetch;
            let mut worst = i64::MAX;
            let mut scored: Vec<(i64, u64, f64, String, Payload)> = Vec::with_capacity(rows.len());
            for row in rows {
                let score = similarity(metric, query, &row.vector);
                let key = tie_key(score);
                worst = worst.min(key);
                if filter.map_or(true, |f| f.matches(&row.payload)) {
                    scored.push((key, row.seq, score, row.id, row.payload));
                }
            }
            scored.sort_by_key(|(key, seq, ..)| (Reverse(*key), *seq));
            // rows not fetched score no better than `worst`; the cut is final
            // once it lies strictly above that
            let settled = exhausted || (scored.len() >= limit && scored[limit - 1].0 > worst);
            if settled {
                scored.truncate(limit);
                #[allow(clippy::cast_possible_truncation)]
                let results = scored
                    .into_iter()
                    .map(|(_, _, score, id, payload)| SearchResult { id, score: score as f32, payload })
                    .collect();
                return Ok(results);
            }
            debug!(collection, fetch, "widening nearest-neighbour fetch");
            fetch = fetch.saturating_mul(2);
        }
    }

    async fn delete(&self, collection: &str, ids: &[String]) -> Result<usize> {
        self.ready()?;
        let lock = self.writer(collection).await;
        let _guard = lock.lock().await;
        let (conn, _, _) = self.require(collection).await?;
        if ids.is_empty() {
            return Ok(0);
        }
        let table = Self::records(&conn).await?;
        let found: Vec<String> = Self::existing_seqs(&table, ids).await?.into_keys().collect();
        if !found.is_empty() {
            Self::delete_ids(&table, &found).await?;
        }
        debug!(collection, requested = ids.len(), removed = found.len(), "delete committed");
        Ok(found.len())
    }

    async fn delete_by_filter(&self, collection: &str, filter: &Filter) -> Result<usize> {
        self.ready()?;
        let lock = self.writer(collection).await;
        let _guard = lock.lock().await;
        let (conn, _, _) = self.require(collection).await?;
        let table = Self::records(&conn).await?;
        let matched = Self::matching_ids(&table, filter).await?;
        if !matched.is_empty() {
            Self::delete_ids(&table, &matched).await?;
        }
        Ok(matched.len())
    }

    async fn count(&self, collection: &str) -> Result<usize> {
        self.ready()?;
        let (conn, _, _) = self.require(collection).await?;
        if !table_exists(&conn, RECORDS_TABLE).await.map_err(lance_err)? {
            return Ok(0);
        }
        Self::records(&conn).await?.count_rows(None).await.map_err(lance_err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn deleting_a_collection_drops_its_writer_lock() {
        let tmp = tempfile::TempDir::new().unwrap();
        let store = LanceVectorStore::new(tmp.path());
        store.initialize().await.unwrap();
        store.create_collection("docs", 2, DistanceMetric::Cosine).await.unwrap();
        assert!(store.writers.lock().await.contains_key("docs"));
        store.delete_collection("docs").await.unwrap();
        assert!(!store.writers.lock().await.contains_key("docs"));
        assert!(!store.conns.lock().await.contains_key("docs"));
    }
}
