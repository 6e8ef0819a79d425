//! Remote vector store backed by a Qdrant service, reachable over REST or
//! gRPC.
//!
//! Every network call is bounded by a per-request timeout, retried with
//! backoff on transient failures, and gated by a semaphore so one store never
//! has more than `max_concurrent_requests` calls in flight.
mod grpc;
mod ids;
mod rest;

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Semaphore;
use tracing::{debug, info};

use docvector_core::config::Transport;
use docvector_core::error::{Error, Result};
use docvector_core::filter::Filter;
use docvector_core::retry::{with_timeout, RetryPolicy};
use docvector_core::traits::VectorStore;
use docvector_core::types::{CollectionInfo, DistanceMetric, Payload, SearchResult, VectorRecord};

use crate::scoring::euclidean_score;

pub use ids::{point_id, RECORD_ID_KEY};

/// A point ready to send: UUID id, vector, payload including the record id.
pub(crate) struct Point {
    pub id: String,
    pub vector: Vec<f32>,
    pub payload: Payload,
}

pub(crate) struct Hit {
    pub score: f32,
    pub payload: Payload,
}

pub(crate) struct RemoteCollection {
    pub dimension: usize,
    pub metric: DistanceMetric,
    pub count: usize,
}

/// Which points a count or delete applies to.
pub(crate) enum Selector<'a> {
    Ids(&'a [String]),
    Filter(&'a Filter),
}

/// Wire protocol used by [`QdrantVectorStore`].
#[async_trait]
pub(crate) trait QdrantApi: Send + Sync {
    async fn list_collections(&self) -> Result<Vec<String>>;
    async fn collection(&self, name: &str) -> Result<Option<RemoteCollection>>;
    async fn create_collection(&self, name: &str, dimension: usize, metric: DistanceMetric) -> Result<()>;
    async fn delete_collection(&self, name: &str) -> Result<()>;
    async fn upsert(&self, name: &str, points: &[Point]) -> Result<()>;
    async fn search(&self, name: &str, vector: &[f32], limit: usize, filter: Option<&Filter>) -> Result<Vec<Hit>>;
    async fn count(&self, name: &str, selector: Option<&Selector<'_>>) -> Result<usize>;
    async fn delete(&self, name: &str, selector: &Selector<'_>) -> Result<()>;
}

/// Not `Debug`: carries the API key.
#[derive(Clone)]
pub struct QdrantOptions {
    pub url: String,
    pub api_key: Option<String>,
    pub transport: Transport,
    pub max_concurrent_requests: usize,
    pub request_timeout: Duration,
    pub retry: RetryPolicy,
}

pub struct QdrantVectorStore {
    api: Box<dyn QdrantApi>,
    url: String,
    permits: Semaphore,
    timeout: Duration,
    retry: RetryPolicy,
    initialized: AtomicBool,
}

impl QdrantVectorStore {
    pub fn new(opts: QdrantOptions) -> Result<Self> {
        if opts.max_concurrent_requests == 0 {
            return Err(Error::InvalidConfig("max_concurrent_requests must be greater than zero".into()));
        }
        let api: Box<dyn QdrantApi> = match opts.transport {
            Transport::Rest => Box::new(rest::RestApi::new(&opts.url, opts.api_key.as_deref(), opts.request_timeout)?),
            Transport::Grpc => Box::new(grpc::GrpcApi::new(&opts.url, opts.api_key.as_deref(), opts.request_timeout)?),
        };
        Ok(Self::with_api(api, opts))
    }

    fn with_api(api: Box<dyn QdrantApi>, opts: QdrantOptions) -> Self {
        Self {
            api,
            url: opts.url,
            permits: Semaphore::new(opts.max_concurrent_requests.max(1)),
            timeout: opts.request_timeout,
            retry: opts.retry,
            initialized: AtomicBool::new(false),
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    fn ready(&self) -> Result<()> {
        if self.initialized.load(Ordering::Acquire) {
            Ok(())
        } else {
            Err(Error::NotInitialized("qdrant vector store".into()))
        }
    }

    /// One bounded, retried remote call.
    async fn call<T, F, Fut>(&self, what: &str, op: F) -> Result<T>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|_| Error::NotInitialized("qdrant vector store".into()))?;
        let limit = self.timeout;
        self.retry.run(what, || with_timeout(limit, what, op())).await
    }

    async fn require(&self, name: &str) -> Result<RemoteCollection> {
        let api = &*self.api;
        self.call("collection_info", move || api.collection(name))
            .await?
            .ok_or_else(|| Error::NotFound(format!("collection '{name}'")))
    }
}

/// Endpoint for logs, cut to 50 chars.
pub(crate) fn short_url(url: &str) -> String {
    url.chars().take(50).collect()
}

/// `_record_id` is reserved for the original id.
fn to_point(record: VectorRecord) -> Result<Point> {
    let mut payload = record.payload;
    if payload.contains_key(RECORD_ID_KEY) {
        return Err(Error::InvalidConfig(format!(
            "record '{}' uses the reserved payload key '{RECORD_ID_KEY}'",
            record.id
        )));
    }
    payload.insert(RECORD_ID_KEY.to_string(), record.id.clone().into());
    Ok(Point { id: point_id(&record.id), vector: record.vector, payload })
}

/// One record per id: the last one written, at the position of the first.
fn last_per_id(records: Vec<VectorRecord>) -> Vec<VectorRecord> {
    let mut slots: HashMap<String, usize> = HashMap::new();
    let mut out: Vec<VectorRecord> = Vec::with_capacity(records.len());
    for r in records {
        match slots.get(&r.id) {
            Some(&i) => out[i] = r,
            None => {
                slots.insert(r.id.clone(), out.len());
                out.push(r);
            }
        }
    }
    out
}

fn to_result(hit: Hit, metric: DistanceMetric) -> Option<SearchResult> {
    let mut payload = hit.payload;
    let id = match payload.remove(RECORD_ID_KEY)? {
        serde_json::Value::String(s) => s,
        other => other.to_string(),
    };
    #[allow(clippy::cast_possible_truncation)]
    let score = match metric {
        // the service reports a distance for this metric
        DistanceMetric::Euclidean => euclidean_score(f64::from(hit.score)) as f32,
        DistanceMetric::Cosine | DistanceMetric::Dot => hit.score,
    };
    Some(SearchResult { id, score, payload })
}

#[async_trait]
impl VectorStore for QdrantVectorStore {
    fn backend(&self) -> &'static str {
        "qdrant"
    }

    async fn initialize(&self) -> Result<()> {
        let api = &*self.api;
        let names = self.call("list_collections", move || api.list_collections()).await?;
        self.initialized.store(true, Ordering::Release);
        info!(url = %short_url(&self.url), collections = names.len(), "qdrant vector store ready");
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.initialized.store(false, Ordering::Release);
        Ok(())
    }

    async fn create_collection(&self, name: &str, dimension: usize, metric: DistanceMetric) -> Result<()> {
        self.ready()?;
        if dimension == 0 {
            return Err(Error::InvalidConfig("collection dimension must be greater than zero".into()));
        }
        let api = &*self.api;
        if let Some(existing) = self.call("collection_info", move || api.collection(name)).await? {
            if existing.dimension == dimension && existing.metric == metric {
                return Ok(());
            }
            return Err(Error::InvalidConfig(format!(
                "collection '{name}' exists with dimension {} and metric {}, requested {dimension}/{metric}",
                existing.dimension, existing.metric
            )));
        }
        self.call("create_collection", move || api.create_collection(name, dimension, metric)).await?;
        info!(collection = name, dimension, %metric, "collection created");
        Ok(())
    }

    async fn collection_exists(&self, name: &str) -> Result<bool> {
        self.ready()?;
        let api = &*self.api;
        Ok(self.call("collection_info", move || api.collection(name)).await?.is_some())
    }

    async fn get_collection_info(&self, name: &str) -> Result<CollectionInfo> {
        self.ready()?;
        let c = self.require(name).await?;
        Ok(CollectionInfo { name: name.to_string(), dimension: c.dimension, distance_metric: c.metric, count: c.count })
    }

    async fn list_collections(&self) -> Result<Vec<String>> {
        self.ready()?;
        let api = &*self.api;
        let mut names = self.call("list_collections", move || api.list_collections()).await?;
        names.sort();
        Ok(names)
    }

    async fn delete_collection(&self, name: &str) -> Result<()> {
        self.ready()?;
        let api = &*self.api;
        self.call("delete_collection", move || api.delete_collection(name)).await
    }

    async fn upsert(&self, collection: &str, records: Vec<VectorRecord>) -> Result<usize> {
        self.ready()?;
        let c = self.require(collection).await?;
        if let Some(bad) = records.iter().find(|r| r.vector.len() != c.dimension) {
            return Err(Error::DimensionMismatch { expected: c.dimension, actual: bad.vector.len() });
        }
        if records.is_empty() {
            return Ok(0);
        }
        let points: Vec<Point> = last_per_id(records).into_iter().map(to_point).collect::<Result<_>>()?;
        let api = &*self.api;
        let batch = &points;
        self.call("upsert", move || api.upsert(collection, batch)).await?;
        debug!(collection, upserted = points.len(), "upsert acknowledged");
        Ok(points.len())
    }

    async fn search(
        &self,
        collection: &str,
        query: &[f32],
        limit: usize,
        filter: Option<&Filter>,
    ) -> Result<Vec<SearchResult>> {
        self.ready()?;
        let c = self.require(collection).await?;
        if query.len() != c.dimension {
            return Err(Error::DimensionMismatch { expected: c.dimension, actual: query.len() });
        }
        if limit == 0 {
            return Ok(vec![]);
        }
        let api = &*self.api;
        let hits = self.call("search", move || api.search(collection, query, limit, filter)).await?;
        Ok(hits.into_iter().filter_map(|h| to_result(h, c.metric)).collect())
    }

    async fn delete(&self, collection: &str, ids: &[String]) -> Result<usize> {
        self.ready()?;
        if ids.is_empty() {
            self.require(collection).await?;
            return Ok(0);
        }
        let point_ids: Vec<String> = ids.iter().map(|id| point_id(id)).collect();
        let api = &*self.api;
        let selector = Selector::Ids(&point_ids);
        let sel = &selector;
        let present = self.call("count", move || api.count(collection, Some(sel))).await?;
        if present > 0 {
            self.call("delete", move || api.delete(collection, sel)).await?;
        }
        Ok(present)
    }

    async fn delete_by_filter(&self, collection: &str, filter: &Filter) -> Result<usize> {
        self.ready()?;
        let api = &*self.api;
        let selector = Selector::Filter(filter);
        let sel = &selector;
        let matched = self.call("count", move || api.count(collection, Some(sel))).await?;
        if matched > 0 {
            self.call("delete", move || api.delete(collection, sel)).await?;
        }
        Ok(matched)
    }

    async fn count(&self, collection: &str) -> Result<usize> {
        self.ready()?;
        let api = &*self.api;
        self.call("count", move || api.count(collection, None)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::{Arc, Mutex};

    /// Accepts everything for a 2-d cosine collection and records upserts.
    #[derive(Default)]
    struct RecordingApi {
        upserts: Arc<Mutex<Vec<Vec<(String, Payload)>>>>,
    }

    #[async_trait]
    impl QdrantApi for RecordingApi {
        async fn list_collections(&self) -> Result<Vec<String>> {
            Ok(vec!["docs".into()])
        }
        async fn collection(&self, _name: &str) -> Result<Option<RemoteCollection>> {
            Ok(Some(RemoteCollection { dimension: 2, metric: DistanceMetric::Cosine, count: 0 }))
        }
        async fn create_collection(&self, _: &str, _: usize, _: DistanceMetric) -> Result<()> {
            Ok(())
        }
        async fn delete_collection(&self, _: &str) -> Result<()> {
            Ok(())
        }
        async fn upsert(&self, _: &str, points: &[Point]) -> Result<()> {
            let sent = points.iter().map(|p| (p.id.clone(), p.payload.clone())).collect();
            self.upserts.lock().unwrap().push(sent);
            Ok(())
        }
        async fn search(&self, _: &str, _: &[f32], _: usize, _: Option<&Filter>) -> Result<Vec<Hit>> {
            Ok(vec![])
        }
        async fn count(&self, _: &str, _: Option<&Selector<'_>>) -> Result<usize> {
            Ok(0)
        }
        async fn delete(&self, _: &str, _: &Selector<'_>) -> Result<()> {
            Ok(())
        }
    }

    async fn recording_store() -> (QdrantVectorStore, Arc<Mutex<Vec<Vec<(String, Payload)>>>>) {
        let api = RecordingApi::default();
        let upserts = Arc::clone(&api.upserts);
        let opts = QdrantOptions {
            url: "http://localhost:6333".into(),
            api_key: None,
            transport: Transport::Rest,
            max_concurrent_requests: 1,
            request_timeout: Duration::from_secs(1),
            retry: RetryPolicy::with_max_retries(0),
        };
        let store = QdrantVectorStore::with_api(Box::new(api), opts);
        store.initialize().await.unwrap();
        (store, upserts)
    }

    #[tokio::test]
    async fn duplicate_ids_in_a_batch_send_the_last_record_once() {
        let (store, upserts) = recording_store().await;
        let records = vec![
            VectorRecord::new("x", vec![1.0, 0.0]).with_payload(json!({"n": 1}).as_object().cloned().unwrap()),
            VectorRecord::new("y", vec![1.0, 0.0]),
            VectorRecord::new("x", vec![0.0, 1.0]).with_payload(json!({"n": 2}).as_object().cloned().unwrap()),
        ];
        assert_eq!(store.upsert("docs", records).await.unwrap(), 2);

        let sent = upserts.lock().unwrap();
        assert_eq!(sent.len(), 1);
        let ids: Vec<&str> = sent[0].iter().map(|(id, _)| id.as_str()).collect();
        assert_eq!(ids, [point_id("x").as_str(), point_id("y").as_str()]);
        assert_eq!(sent[0][0].1["n"], json!(2));
    }

    #[tokio::test]
    async fn reserved_payload_key_is_rejected() {
        let (store, upserts) = recording_store().await;
        let payload = json!({ RECORD_ID_KEY: "spoofed" }).as_object().cloned().unwrap();
        let err = store.upsert("docs", vec![VectorRecord::new("a", vec![1.0, 0.0]).with_payload(payload)]).await.unwrap_err();
        assert!(matches!(err, Error::InvalidConfig(_)));
        assert!(upserts.lock().unwrap().is_empty());
    }

    #[test]
    fn record_id_round_trips_through_payload() {
        let mut payload = Payload::new();
        payload.insert("lang".into(), json!("rust"));
        let point = to_point(VectorRecord::new("doc:7", vec![1.0, 0.0]).with_payload(payload)).unwrap();
        assert_eq!(point.id, point_id("doc:7"));
        assert_eq!(point.payload[RECORD_ID_KEY], json!("doc:7"));

        let hit = Hit { score: 0.5, payload: point.payload };
        let result = to_result(hit, DistanceMetric::Cosine).unwrap();
        assert_eq!(result.id, "doc:7");
        assert!(!result.payload.contains_key(RECORD_ID_KEY));
        assert_eq!(result.payload["lang"], json!("rust"));
    }

    #[test]
    fn euclidean_distances_become_similarities() {
        let mut payload = Payload::new();
        payload.insert(RECORD_ID_KEY.into(), json!("a"));
        let result = to_result(Hit { score: 1.0, payload }, DistanceMetric::Euclidean).unwrap();
        assert!((result.score - 0.5).abs() < 1e-6);
    }

    #[test]
    fn hits_without_record_id_are_skipped() {
        assert!(to_result(Hit { score: 1.0, payload: Payload::new() }, DistanceMetric::Dot).is_none());
    }
}
