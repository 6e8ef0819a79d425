//! Qdrant over gRPC via `qdrant-client`.
use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use qdrant_client::qdrant::value::Kind;
use qdrant_client::qdrant::vectors_config::Config as VectorsConfig;
use qdrant_client::qdrant::{
    Condition as QCondition, CountPointsBuilder, CreateCollectionBuilder, DeletePointsBuilder, Distance,
    Filter as QFilter, PointId, PointStruct, PointsIdsList, Range as QRange, SearchPointsBuilder,
    UpsertPointsBuilder, Value as QValue, VectorParamsBuilder,
};
use qdrant_client::{Payload as QPayload, Qdrant, QdrantError};
use serde_json::Value;
use tonic::{Code, Status};

use docvector_core::error::{Error, Result};
use docvector_core::filter::{Condition, Filter};
use docvector_core::types::{DistanceMetric, Payload};

use super::{Hit, Point, QdrantApi, RemoteCollection, Selector};

pub(crate) struct GrpcApi {
    client: Qdrant,
}

impl GrpcApi {
    pub fn new(url: &str, api_key: Option<&str>, timeout: Duration) -> Result<Self> {
        let mut builder = Qdrant::from_url(url).timeout(timeout);
        if let Some(key) = api_key {
            builder = builder.api_key(key.to_string());
        }
        let client = builder.build().map_err(|e| Error::InvalidConfig(format!("qdrant grpc client: {e}")))?;
        Ok(Self { client })
    }
}

fn map_err(e: QdrantError) -> Error {
    match e {
        QdrantError::ResponseError { status } => map_status(&status),
        QdrantError::ResourceExhaustedError { status, retry_after_seconds } => Error::Connection(format!(
            "qdrant: {} (retry after {retry_after_seconds}s)",
            status.message()
        )),
        QdrantError::Io(e) => Error::Connection(format!("qdrant: {e}")),
        QdrantError::InvalidUri(e) => Error::InvalidConfig(format!("qdrant: {e}")),
        other => Error::Operation(format!("qdrant: {other}")),
    }
}

fn map_status(status: &Status) -> Error {
    let msg = format!("qdrant: {:?}: {}", status.code(), status.message());
    match status.code() {
        Code::Unauthenticated | Code::PermissionDenied => Error::Auth(msg),
        Code::NotFound => Error::NotFound(msg),
        Code::DeadlineExceeded => Error::Timeout(msg),
        Code::Unavailable | Code::ResourceExhausted | Code::Aborted => Error::Connection(msg),
        // transport failures surface as `Unknown` with the cause in the message
        Code::Unknown if status.message().to_ascii_lowercase().contains("transport") => Error::Connection(msg),
        _ => Error::Operation(msg),
    }
}

fn distance(metric: DistanceMetric) -> Distance {
    match metric {
        DistanceMetric::Cosine => Distance::Cosine,
        DistanceMetric::Dot => Distance::Dot,
        DistanceMetric::Euclidean => Distance::Euclid,
    }
}

fn metric_of(raw: i32) -> Result<DistanceMetric> {
    match Distance::try_from(raw) {
        Ok(Distance::Cosine) => Ok(DistanceMetric::Cosine),
        Ok(Distance::Dot) => Ok(DistanceMetric::Dot),
        Ok(Distance::Euclid) => Ok(DistanceMetric::Euclidean),
        _ => Err(Error::Operation(format!("qdrant distance {raw} is not supported"))),
    }
}

fn to_json(value: QValue) -> Value {
    match value.kind {
        None | Some(Kind::NullValue(_)) => Value::Null,
        Some(Kind::BoolValue(b)) => Value::Bool(b),
        Some(Kind::IntegerValue(i)) => Value::from(i),
        Some(Kind::DoubleValue(d)) => serde_json::Number::from_f64(d).map_or(Value::Null, Value::Number),
        Some(Kind::StringValue(s)) => Value::String(s),
        Some(Kind::ListValue(list)) => Value::Array(list.values.into_iter().map(to_json).collect()),
        Some(Kind::StructValue(s)) => Value::Object(s.fields.into_iter().map(|(k, v)| (k, to_json(v))).collect()),
    }
}

fn to_payload(fields: HashMap<String, QValue>) -> Payload {
    fields.into_iter().map(|(k, v)| (k, to_json(v))).collect()
}

fn native_filter(filter: &Filter) -> Result<QFilter> {
    Ok(match filter {
        Filter::All(children) => QFilter::must(nested(children)?),
        Filter::Any(children) => QFilter::should(nested(children)?),
        Filter::Field { key, condition } => match condition {
            Condition::Eq(v) => QFilter::must([match_value(key, v)?]),
            Condition::Ne(v) => QFilter::must_not([match_value(key, v)?]),
            Condition::In(vs) => match_any(key, vs)?,
            Condition::Range(r) => QFilter::must([QCondition::range(
                key.as_str(),
                QRange { gt: r.gt, gte: r.gte, lt: r.lt, lte: r.lte },
            )]),
        },
    })
}

fn nested(children: &[Filter]) -> Result<Vec<QCondition>> {
    children.iter().map(|c| native_filter(c).map(QCondition::from)).collect()
}

fn match_value(key: &str, v: &Value) -> Result<QCondition> {
    Ok(match v {
        Value::String(s) => QCondition::matches(key, s.clone()),
        Value::Bool(b) => QCondition::matches(key, *b),
        Value::Number(n) => match n.as_i64() {
            Some(i) => QCondition::matches(key, i),
            None => {
                let x = n.as_f64().unwrap_or_default();
                QCondition::range(key, QRange { gte: Some(x), lte: Some(x), ..Default::default() })
            }
        },
        Value::Null => QCondition::is_null(key),
        _ => return Err(Error::InvalidConfig(format!("filter on '{key}' cannot match arrays or objects"))),
    })
}

fn match_any(key: &str, vs: &[Value]) -> Result<QFilter> {
    let strings: Vec<String> = vs.iter().filter_map(|v| v.as_str().map(str::to_string)).collect();
    let ints: Vec<i64> = vs.iter().filter_map(Value::as_i64).collect();
    let mut should = Vec::new();
    if !strings.is_empty() {
        should.push(QCondition::matches(key, strings));
    }
    if !ints.is_empty() {
        should.push(QCondition::matches(key, ints));
    }
    for v in vs.iter().filter(|v| !v.is_string() && !v.is_i64()) {
        should.push(match_value(key, v)?);
    }
    if should.is_empty() {
        return Ok(QFilter::must([QCondition::has_id(Vec::<PointId>::new())]));
    }
    Ok(QFilter::should(should))
}

fn selector_filter(selector: &Selector<'_>) -> Result<QFilter> {
    match selector {
        Selector::Ids(ids) => Ok(QFilter::must([QCondition::has_id(point_ids(ids))])),
        Selector::Filter(f) => native_filter(f),
    }
}

fn point_ids(ids: &[String]) -> Vec<PointId> {
    ids.iter().map(|id| PointId::from(id.clone())).collect()
}

#[async_trait]
impl QdrantApi for GrpcApi {
    async fn list_collections(&self) -> Result<Vec<String>> {
        let resp = self.client.list_collections().await.map_err(map_err)?;
        Ok(resp.collections.into_iter().map(|c| c.name).collect())
    }

    async fn collection(&self, name: &str) -> Result<Option<RemoteCollection>> {
        if !self.client.collection_exists(name).await.map_err(map_err)? {
            return Ok(None);
        }
        let info = self
            .client
            .collection_info(name)
            .await
            .map_err(map_err)?
            .result
            .ok_or_else(|| Error::NotFound(format!("collection '{name}'")))?;
        let params = info
            .config
            .as_ref()
            .and_then(|c| c.params.as_ref())
            .and_then(|p| p.vectors_config.as_ref())
            .and_then(|v| v.config.as_ref());
        let Some(VectorsConfig::Params(params)) = params else {
            return Err(Error::Operation(format!("qdrant collection '{name}' uses named vectors")));
        };
        #[allow(clippy::cast_possible_truncation)]
        Ok(Some(RemoteCollection {
            dimension: params.size as usize,
            metric: metric_of(params.distance)?,
            count: info.points_count.unwrap_or(0) as usize,
        }))
    }

    async fn create_collection(&self, name: &str, dimension: usize, metric: DistanceMetric) -> Result<()> {
        self.client
            .create_collection(
                CreateCollectionBuilder::new(name)
                    .vectors_config(VectorParamsBuilder::new(dimension as u64, distance(metric))),
            )
            .await
            .map_err(map_err)?;
        Ok(())
    }

    async fn delete_collection(&self, name: &str) -> Result<()> {
        match self.client.delete_collection(name).await.map_err(map_err) {
            Ok(_) | Err(Error::NotFound(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn upsert(&self, name: &str, points: &[Point]) -> Result<()> {
        let mut structs = Vec::with_capacity(points.len());
        for p in points {
            let payload = QPayload::try_from(Value::Object(p.payload.clone()))
                .map_err(|e| Error::Operation(format!("qdrant payload: {e}")))?;
            structs.push(PointStruct::new(p.id.clone(), p.vector.clone(), payload));
        }
        self.client
            .upsert_points(UpsertPointsBuilder::new(name, structs).wait(true))
            .await
            .map_err(map_err)?;
        Ok(())
    }

    async fn search(&self, name: &str, vector: &[f32], limit: usize, filter: Option<&Filter>) -> Result<Vec<Hit>> {
        let mut req = SearchPointsBuilder::new(name, vector.to_vec(), limit as u64).with_payload(true);
        if let Some(f) = filter {
            req = req.filter(native_filter(f)?);
        }
        let resp = self.client.search_points(req).await.map_err(map_err)?;
        Ok(resp.result.into_iter().map(|p| Hit { score: p.score, payload: to_payload(p.payload) }).collect())
    }

    async fn count(&self, name: &str, selector: Option<&Selector<'_>>) -> Result<usize> {
        let mut req = CountPointsBuilder::new(name).exact(true);
        if let Some(s) = selector {
            req = req.filter(selector_filter(s)?);
        }
        let resp = self.client.count(req).await.map_err(map_err)?;
        #[allow(clippy::cast_possible_truncation)]
        Ok(resp.result.map_or(0, |r| r.count as usize))
    }

    async fn delete(&self, name: &str, selector: &Selector<'_>) -> Result<()> {
        let req = match selector {
            Selector::Ids(ids) => DeletePointsBuilder::new(name).points(PointsIdsList { ids: point_ids(ids) }),
            Selector::Filter(f) => DeletePointsBuilder::new(name).points(native_filter(f)?),
        };
        self.client.delete_points(req.wait(true)).await.map_err(map_err)?;
        Ok(())
    }
}
