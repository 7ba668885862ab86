//! JSON Schema helpers for MCP-compliant schemas.
//!
//! schemars emits `"format": "uint64"` for unsigned fields, which MCP clients
//! do not understand; these helpers describe the same values in plain JSON
//! Schema terms.

use schemars::Schema;
use schemars::json_schema;

/// Unsigned integer schema: `{"type": "integer", "minimum": 0}`
///
/// Use with `#[schemars(schema_with = "crate::fleet::schema::uint")]` on unsigned fields.
pub fn uint(_generator: &mut schemars::SchemaGenerator) -> Schema {
    json_schema!({
        "type": "integer",
        "minimum": 0
    })
}

/// Percentage schema: a number between 0 and 100.
pub fn percent(_generator: &mut schemars::SchemaGenerator) -> Schema {
    json_schema!({
        "type": "number",
        "minimum": 0,
        "maximum": 100
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use schemars::SchemaGenerator;

    #[test]
    fn test_uint_schema_has_no_format() {
        let mut generator = SchemaGenerator::default();
        let json = serde_json::to_value(uint(&mut generator)).expect("serialize schema");

        assert_eq!(json.get("type"), Some(&serde_json::json!("integer")));
        assert_eq!(json.get("minimum"), Some(&serde_json::json!(0)));
        assert!(json.get("format").is_none());
    }

    #[test]
    fn test_percent_schema_bounds() {
        let mut generator = SchemaGenerator::default();
        let json = serde_json::to_value(percent(&mut generator)).expect("serialize schema");

        assert_eq!(json.get("type"), Some(&serde_json::json!("number")));
        assert_eq!(json.get("maximum"), Some(&serde_json::json!(100)));
    }

    #[test]
    fn test_repeatable_schedule_uses_uint() {
        let schema = schemars::schema_for!(crate::fleet::types::RepeatableSchedule);
        let json = serde_json::to_value(&schema).expect("serialize schema");
        let interval = &json["properties"]["interval_secs"];

        assert_eq!(interval["type"], "integer");
        assert!(interval.get("format").is_none());
    }
}
