pub mod chunker;
pub mod config;
pub mod documents;
pub mod error;
pub mod filter;
pub mod retry;
pub mod traits;
pub mod types;

pub use error::{Error, Result};
