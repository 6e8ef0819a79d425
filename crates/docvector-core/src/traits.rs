use async_trait::async_trait;

use crate::error::Result;
use crate::filter::Filter;
use crate::types::{CollectionInfo, DistanceMetric, SearchResult, VectorRecord};

/// Turns text into fixed-length vectors.
#[async_trait]
pub trait Embedder: Send + Sync {
    /// Identifier of the underlying model, used as part of cache keys.
    fn model_name(&self) -> &str;
    /// Known before the first `embed` call.
    fn dimension(&self) -> usize;
    /// One vector per input text, in input order.
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;
}

/// Collection lifecycle and CRUD/search over one vector backend.
///
/// Every operation other than `initialize` and `close` fails with
/// `Error::NotInitialized` until `initialize` has succeeded.
#[async_trait]
pub trait VectorStore: Send + Sync {
    /// Short backend name for logs.
    fn backend(&self) -> &'static str;

    async fn initialize(&self) -> Result<()>;
    /// Safe to call more than once.
    async fn close(&self) -> Result<()>;

    /// No-op when the collection exists with the same parameters;
    /// `Error::InvalidConfig` when they differ.
    async fn create_collection(&self, name: &str, dimension: usize, metric: DistanceMetric) -> Result<()>;
    async fn collection_exists(&self, name: &str) -> Result<bool>;
    async fn get_collection_info(&self, name: &str) -> Result<CollectionInfo>;
    async fn list_collections(&self) -> Result<Vec<String>>;
    /// Deleting an absent collection is not an error.
    async fn delete_collection(&self, name: &str) -> Result<()>;

    /// All-or-nothing: a single bad vector rejects the whole batch.
    async fn upsert(&self, collection: &str, records: Vec<VectorRecord>) -> Result<usize>;
    /// Best-first, scores in the metric's natural range.
    async fn search(
        &self,
        collection: &str,
        query: &[f32],
        limit: usize,
        filter: Option<&Filter>,
    ) -> Result<Vec<SearchResult>>;
    /// Returns how many of `ids` were actually present.
    async fn delete(&self, collection: &str, ids: &[String]) -> Result<usize>;
    async fn delete_by_filter(&self, collection: &str, filter: &Filter) -> Result<usize>;
    async fn count(&self, collection: &str) -> Result<usize>;
}
