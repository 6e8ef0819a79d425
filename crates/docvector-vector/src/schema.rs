use arrow_schema::{DataType, Field, Schema, TimeUnit};
use std::sync::Arc;

pub const RECORDS_TABLE: &str = "records";
pub const META_TABLE: &str = "meta";

/// Records of one collection: `id`, insertion `seq`, JSON `payload`, the
/// promoted `source_id` and `chunk_index` payload keys, and a fixed-width
/// `vector`.
#[allow(clippy::cast_possible_wrap, clippy::cast_possible_truncation)]
pub fn build_records_schema(dim: usize) -> Arc<Schema> {
    Arc::new(Schema::new(vec![
        Field::new("id", DataType::Utf8, false),
        Field::new("seq", DataType::UInt64, false),
        Field::new("payload", DataType::Utf8, false),
        Field::new("source_id", DataType::Utf8, true),
        Field::new("chunk_index", DataType::Float64, true),
        Field::new(
            "vector",
            DataType::FixedSizeList(Arc::new(Field::new("item", DataType::Float32, true)), dim as i32),
            true,
        ),
    ]))
}

/// Key/value metadata: dimension, metric and the next insertion sequence.
pub fn build_meta_schema() -> Arc<Schema> {
    Arc::new(Schema::new(vec![
        Field::new("key", DataType::Utf8, false),
        Field::new("value", DataType::Utf8, false),
        Field::new("updated_at", DataType::Timestamp(TimeUnit::Millisecond, None), false),
    ]))
}
