use serde_json::json;

use docvector_core::types::Payload;
use docvector_text::KeywordScorer;

fn payload(v: serde_json::Value) -> Payload {
    v.as_object().cloned().unwrap_or_default()
}

#[test]
fn payload_fields_are_combined() {
    let scorer = KeywordScorer::new(vec!["content".into(), "title".into()]);
    let mut q = scorer.query_terms("vector search engine");

    let p = payload(json!({"title": "Search guide", "content": "Using the vector index"}));
    assert!((q.score_payload(&p) - 2.0 / 3.0).abs() < 1e-6);

    let p = payload(json!({"content": "vector search engine internals", "title": 42}));
    assert_eq!(q.score_payload(&p), 1.0);
}

#[test]
fn unlisted_fields_are_not_scored() {
    let scorer = KeywordScorer::new(vec!["content".into()]);
    let mut q = scorer.query_terms("lance");
    let p = payload(json!({"url": "https://lance.dev", "content": "embedded store"}));
    assert_eq!(q.score_payload(&p), 0.0);
}
