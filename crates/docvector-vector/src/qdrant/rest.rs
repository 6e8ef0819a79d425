//! Qdrant's JSON HTTP API.
use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue};
use reqwest::{Client, RequestBuilder, StatusCode};
use serde_json::{json, Value};

use docvector_core::error::{Error, Result};
use docvector_core::filter::{Condition, Filter};
use docvector_core::types::{DistanceMetric, Payload};

use super::{Hit, Point, QdrantApi, RemoteCollection, Selector};

pub(crate) struct RestApi {
    client: Client,
    base: String,
}

impl RestApi {
    pub fn new(url: &str, api_key: Option<&str>, timeout: Duration) -> Result<Self> {
        let mut headers = HeaderMap::new();
        if let Some(key) = api_key {
            let mut value =
                HeaderValue::from_str(key).map_err(|_| Error::InvalidConfig("qdrant api key is not a valid header".into()))?;
            value.set_sensitive(true);
            headers.insert("api-key", value);
        }
        let client = Client::builder()
            .default_headers(headers)
            .timeout(timeout)
            .build()
            .map_err(|e| Error::InvalidConfig(format!("qdrant http client: {e}")))?;
        Ok(Self { client, base: url.trim_end_matches('/').to_string() })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base, path)
    }

    /// Sends a request and unwraps the `result` field of the reply. `None`
    /// on 404.
    async fn send(&self, req: RequestBuilder) -> Result<Option<Value>> {
        let resp = req.send().await.map_err(map_transport)?;
        let status = resp.status();
        if status == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(map_status(status, &body));
        }
        let mut body: Value = resp.json().await.map_err(map_transport)?;
        Ok(Some(body.get_mut("result").map(Value::take).unwrap_or(Value::Null)))
    }

    async fn send_found(&self, req: RequestBuilder, name: &str) -> Result<Value> {
        self.send(req).await?.ok_or_else(|| Error::NotFound(format!("collection '{name}'")))
    }
}

fn map_transport(e: reqwest::Error) -> Error {
    if e.is_timeout() {
        Error::Timeout(format!("qdrant: {e}"))
    } else if e.is_connect() || e.is_request() || e.is_body() {
        Error::Connection(format!("qdrant: {e}"))
    } else {
        Error::Operation(format!("qdrant: {e}"))
    }
}

fn map_status(status: StatusCode, body: &str) -> Error {
    let detail = serde_json::from_str::<Value>(body)
        .ok()
        .and_then(|v| v.pointer("/status/error").and_then(Value::as_str).map(str::to_string))
        .unwrap_or_else(|| body.chars().take(200).collect());
    let msg = format!("qdrant returned {status}: {detail}");
    match status.as_u16() {
        401 | 403 => Error::Auth(msg),
        408 => Error::Timeout(msg),
        429 | 500..=599 => Error::Connection(msg),
        _ => Error::Operation(msg),
    }
}

fn distance_name(metric: DistanceMetric) -> &'static str {
    match metric {
        DistanceMetric::Cosine => "Cosine",
        DistanceMetric::Dot => "Dot",
        DistanceMetric::Euclidean => "Euclid",
    }
}

fn parse_distance(name: &str) -> Result<DistanceMetric> {
    match name {
        "Cosine" => Ok(DistanceMetric::Cosine),
        "Dot" => Ok(DistanceMetric::Dot),
        "Euclid" => Ok(DistanceMetric::Euclidean),
        other => Err(Error::Operation(format!("qdrant distance '{other}' is not supported"))),
    }
}

/// Native filter JSON. Floats are matched as a degenerate range, since
/// `match` only covers keywords, integers and booleans.
pub(crate) fn filter_json(filter: &Filter) -> Result<Value> {
    Ok(match filter {
        Filter::All(children) => json!({"must": children.iter().map(filter_json).collect::<Result<Vec<_>>>()?}),
        Filter::Any(children) => json!({"should": children.iter().map(filter_json).collect::<Result<Vec<_>>>()?}),
        Filter::Field { key, condition } => match condition {
            Condition::Eq(v) => json!({"must": [match_value(key, v)?]}),
            Condition::Ne(v) => json!({"must_not": [match_value(key, v)?]}),
            Condition::In(vs) => match_any(key, vs)?,
            Condition::Range(r) => json!({"must": [{
                "key": key,
                "range": {"gt": r.gt, "gte": r.gte, "lt": r.lt, "lte": r.lte}
            }]}),
        },
    })
}

fn match_value(key: &str, v: &Value) -> Result<Value> {
    match v {
        Value::String(_) | Value::Bool(_) => Ok(json!({"key": key, "match": {"value": v}})),
        Value::Number(n) if n.is_i64() || n.is_u64() => Ok(json!({"key": key, "match": {"value": v}})),
        Value::Number(n) => {
            let x = n.as_f64().unwrap_or_default();
            Ok(json!({"key": key, "range": {"gte": x, "lte": x}}))
        }
        Value::Null => Ok(json!({"is_null": {"key": key}})),
        _ => Err(Error::InvalidConfig(format!("filter on '{key}' cannot match arrays or objects"))),
    }
}

fn match_any(key: &str, vs: &[Value]) -> Result<Value> {
    let strings: Vec<&Value> = vs.iter().filter(|v| v.is_string()).collect();
    let ints: Vec<&Value> = vs.iter().filter(|v| v.is_i64() || v.is_u64()).collect();
    let mut should = Vec::new();
    if !strings.is_empty() {
        should.push(json!({"key": key, "match": {"any": strings}}));
    }
    if !ints.is_empty() {
        should.push(json!({"key": key, "match": {"any": ints}}));
    }
    for v in vs.iter().filter(|v| !v.is_string() && !v.is_i64() && !v.is_u64()) {
        should.push(match_value(key, v)?);
    }
    if should.is_empty() {
        // `$in: []` matches nothing
        return Ok(json!({"must": [{"has_id": []}]}));
    }
    Ok(json!({"should": should}))
}

fn selector_json(selector: &Selector<'_>) -> Result<Value> {
    match selector {
        Selector::Ids(ids) => Ok(json!({"must": [{"has_id": ids}]})),
        Selector::Filter(f) => filter_json(f),
    }
}

fn payload_of(value: &mut Value) -> Payload {
    match value.get_mut("payload").map(Value::take) {
        Some(Value::Object(map)) => map,
        _ => Payload::new(),
    }
}

#[async_trait]
impl QdrantApi for RestApi {
    async fn list_collections(&self) -> Result<Vec<String>> {
        let result = self.send(self.client.get(self.url("/collections"))).await?.unwrap_or(Value::Null);
        let names = result
            .get("collections")
            .and_then(Value::as_array)
            .map(|cs| cs.iter().filter_map(|c| c.get("name")?.as_str().map(str::to_string)).collect())
            .unwrap_or_default();
        Ok(names)
    }

    async fn collection(&self, name: &str) -> Result<Option<RemoteCollection>> {
        let Some(result) = self.send(self.client.get(self.url(&format!("/collections/{name}")))).await? else {
            return Ok(None);
        };
        let params = result
            .pointer("/config/params/vectors")
            .ok_or_else(|| Error::Operation(format!("qdrant collection '{name}' uses named vectors")))?;
        let dimension = params
            .get("size")
            .and_then(Value::as_u64)
            .ok_or_else(|| Error::Operation(format!("qdrant collection '{name}' has no vector size")))?;
        let metric = parse_distance(params.get("distance").and_then(Value::as_str).unwrap_or_default())?;
        let count = result.get("points_count").and_then(Value::as_u64).unwrap_or(0);
        #[allow(clippy::cast_possible_truncation)]
        Ok(Some(RemoteCollection { dimension: dimension as usize, metric, count: count as usize }))
    }

    async fn create_collection(&self, name: &str, dimension: usize, metric: DistanceMetric) -> Result<()> {
        let body = json!({"vectors": {"size": dimension, "distance": distance_name(metric)}});
        self.send_found(self.client.put(self.url(&format!("/collections/{name}"))).json(&body), name).await?;
        Ok(())
    }

    async fn delete_collection(&self, name: &str) -> Result<()> {
        // 404 is fine
        self.send(self.client.delete(self.url(&format!("/collections/{name}")))).await?;
        Ok(())
    }

    async fn upsert(&self, name: &str, points: &[Point]) -> Result<()> {
        let points: Vec<Value> =
            points.iter().map(|p| json!({"id": p.id, "vector": p.vector, "payload": p.payload})).collect();
        let req = self
            .client
            .put(self.url(&format!("/collections/{name}/points")))
            .query(&[("wait", "true")])
            .json(&json!({"points": points}));
        self.send_found(req, name).await?;
        Ok(())
    }

    async fn search(&self, name: &str, vector: &[f32], limit: usize, filter: Option<&Filter>) -> Result<Vec<Hit>> {
        let mut body = json!({"vector": vector, "limit": limit, "with_payload": true});
        if let Some(f) = filter {
            body["filter"] = filter_json(f)?;
        }
        let req = self.client.post(self.url(&format!("/collections/{name}/points/search"))).json(&body);
        let result = self.send_found(req, name).await?;
        let mut hits = Vec::new();
        if let Value::Array(items) = result {
            for mut item in items {
                #[allow(clippy::cast_possible_truncation)]
                let score = item.get("score").and_then(Value::as_f64).unwrap_or_default() as f32;
                hits.push(Hit { score, payload: payload_of(&mut item) });
            }
        }
        Ok(hits)
    }

    async fn count(&self, name: &str, selector: Option<&Selector<'_>>) -> Result<usize> {
        let mut body = json!({"exact": true});
        if let Some(s) = selector {
            body["filter"] = selector_json(s)?;
        }
        let req = self.client.post(self.url(&format!("/collections/{name}/points/count"))).json(&body);
        let result = self.send_found(req, name).await?;
        #[allow(clippy::cast_possible_truncation)]
        Ok(result.get("count").and_then(Value::as_u64).unwrap_or(0) as usize)
    }

    async fn delete(&self, name: &str, selector: &Selector<'_>) -> Result<()> {
        let body = match selector {
            Selector::Ids(ids) => json!({"points": ids}),
            Selector::Filter(f) => json!({"filter": filter_json(f)?}),
        };
        let req = self
            .client
            .post(self.url(&format!("/collections/{name}/points/delete")))
            .query(&[("wait", "true")])
            .json(&body);
        self.send_found(req, name).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filters_translate_to_native_json() {
        let f = Filter::from_json(&json!({
            "lang": "rust",
            "year": {"$gte": 2020},
            "status": {"$ne": "draft"}
        }))
        .unwrap();
        let v = filter_json(&f).unwrap();
        let must = v["must"].as_array().unwrap();
        assert_eq!(must.len(), 3);
        assert_eq!(must[0]["must"][0], json!({"key": "lang", "match": {"value": "rust"}}));
        assert_eq!(must[1]["must"][0]["range"]["gte"], json!(2020.0));
        assert_eq!(must[2]["must_not"][0], json!({"key": "status", "match": {"value": "draft"}}));
    }

    #[test]
    fn in_lists_split_by_type() {
        let v = match_any("tag", &[json!("a"), json!(3), json!("b")]).unwrap();
        let should = v["should"].as_array().unwrap();
        assert_eq!(should[0]["match"]["any"], json!(["a", "b"]));
        assert_eq!(should[1]["match"]["any"], json!([3]));
    }

    #[test]
    fn status_codes_classify() {
        assert!(matches!(map_status(StatusCode::UNAUTHORIZED, ""), Error::Auth(_)));
        assert!(map_status(StatusCode::SERVICE_UNAVAILABLE, "").is_transient());
        let e = map_status(StatusCode::BAD_REQUEST, r#"{"status":{"error":"bad vector"}}"#);
        assert!(e.to_string().contains("bad vector"));
    }
}
