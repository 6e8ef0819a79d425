pub mod analyzer;
pub mod keyword;

pub use keyword::{KeywordScorer, QueryTerms};
