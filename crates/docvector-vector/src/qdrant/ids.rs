use uuid::Uuid;

/// Payload key holding the caller's record id; point ids must be UUIDs or
/// integers, so the original id travels alongside.
pub const RECORD_ID_KEY: &str = "_record_id";

const NAMESPACE: Uuid = Uuid::from_u128(0x6f0c_9d3e_41a2_5b7c_8e10_d4f5_a6b7_c8d9);

/// Stable UUID for a record id.
pub fn point_id(id: &str) -> String {
    Uuid::new_v5(&NAMESPACE, id.as_bytes()).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn point_ids_are_stable_and_distinct() {
        assert_eq!(point_id("doc:1"), point_id("doc:1"));
        assert_ne!(point_id("doc:1"), point_id("doc:2"));
        assert!(Uuid::parse_str(&point_id("anything")).is_ok());
    }
}
