pub mod factory;
pub mod lance_store;
pub mod predicate;
pub mod qdrant;
pub mod schema;
pub mod scoring;
pub mod table;

pub use factory::{get_vector_store, StoreOverrides};
pub use lance_store::LanceVectorStore;
pub use qdrant::{QdrantOptions, QdrantVectorStore};
