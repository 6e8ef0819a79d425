//! Token-overlap keyword scoring used to re-rank vector candidates.
use std::collections::HashSet;

use serde_json::Value;
use tantivy::tokenizer::TextAnalyzer;

use docvector_core::types::Payload;

use crate::analyzer::{build_analyzer, tokenize};

#[derive(Clone)]
pub struct KeywordScorer {
    analyzer: TextAnalyzer,
    fields: Vec<String>,
}

impl KeywordScorer {
    /// `fields` are the payload keys whose text is scored.
    pub fn new(fields: Vec<String>) -> Self {
        Self { analyzer: build_analyzer(), fields }
    }

    pub fn query_terms(&self, query: &str) -> QueryTerms {
        let mut analyzer = self.analyzer.clone();
        QueryTerms { terms: tokenize(&mut analyzer, query).into_iter().collect(), analyzer, fields: self.fields.clone() }
    }
}

/// The analyzed form of one query, reused across its candidates.
pub struct QueryTerms {
    terms: HashSet<String>,
    analyzer: TextAnalyzer,
    fields: Vec<String>,
}

impl QueryTerms {
    pub fn is_empty(&self) -> bool {
        self.terms.is_empty()
    }

    /// Fraction of distinct query terms present in `text`, in [0, 1].
    pub fn score_text(&mut self, text: &str) -> f32 {
        overlap(&mut self.analyzer, &self.terms, std::iter::once(text))
    }

    /// Fraction of distinct query terms present in the configured payload
    /// fields. Non-string fields are ignored.
    pub fn score_payload(&mut self, payload: &Payload) -> f32 {
        let texts = self.fields.iter().filter_map(|f| payload.get(f).and_then(Value::as_str));
        overlap(&mut self.analyzer, &self.terms, texts)
    }
}

#[allow(clippy::cast_precision_loss)]
fn overlap<'t>(analyzer: &mut TextAnalyzer, terms: &HashSet<String>, texts: impl Iterator<Item = &'t str>) -> f32 {
    if terms.is_empty() {
        return 0.0;
    }
    let mut seen: HashSet<String> = HashSet::new();
    for text in texts {
        seen.extend(tokenize(analyzer, text).into_iter().filter(|t| terms.contains(t)));
        if seen.len() == terms.len() {
            break;
        }
    }
    seen.len() as f32 / terms.len() as f32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stop_words_and_case_are_ignored() {
        let scorer = KeywordScorer::new(vec!["content".into()]);
        let mut q = scorer.query_terms("How to configure the Tokio runtime");
        assert_eq!(q.score_text("tokio RUNTIME configure guide"), 1.0);
        assert_eq!(q.score_text("runtime only"), 1.0 / 3.0);
        assert_eq!(q.score_text("nothing relevant"), 0.0);
    }

    #[test]
    fn empty_query_scores_zero() {
        let scorer = KeywordScorer::new(vec!["content".into()]);
        let mut q = scorer.query_terms("the of and");
        assert!(q.is_empty());
        assert_eq!(q.score_text("anything"), 0.0);
    }
}
