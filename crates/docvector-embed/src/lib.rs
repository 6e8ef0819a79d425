pub mod backend;
pub mod bert;
pub mod cache;
pub mod device;
pub mod factory;
pub mod local;
pub mod openai;
pub mod pool;
pub mod registry;
pub mod tokenize;

pub use cache::{CachingEmbedder, EmbeddingCache};
pub use factory::{create_embedder, create_embedder_with_cache, create_persistent_embedder, embedder_info};
pub use local::LocalEmbedder;
pub use openai::OpenAiEmbedder;
