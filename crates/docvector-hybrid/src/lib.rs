pub mod engine;
pub mod indexer;

pub use engine::{fuse, normalize_vector_score, HybridHit, HybridSearchEngine};
pub use indexer::{DocumentIndexer, IndexSummary};
