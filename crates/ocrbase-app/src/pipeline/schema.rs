//! Canonical JSON-Schema representation and boundary adapters.
//!
//! Callers hand schemas over in several shapes: a full JSON Schema
//! document, or a `{field: "type"}` shorthand. Both normalize to
//! [`SchemaDoc`] at the boundary; the pipeline only ever consumes the
//! canonical form.

use serde::{Deserialize, Serialize};
use serde_json::{Map as JsonMap, Value as JsonValue, json};
use thiserror::Error;

use super::job::new_schema_id;

const SHORTHAND_TYPES: [&str; 6] = ["string", "number", "integer", "boolean", "array", "object"];

#[derive(Debug, Error)]
pub enum SchemaError {
    #[error("schema must be a JSON object")]
    NotAnObject,
    #[error("unsupported shorthand type `{0}` (expected one of string, number, integer, boolean, array, object)")]
    UnsupportedShorthand(String),
    #[error("schema document is not valid JSON: {0}")]
    Malformed(#[from] serde_json::Error),
}

/// Canonical stored schema. The `schema` field holds the JSON Schema text
/// verbatim; accessors parse on demand.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchemaDoc {
    pub id: String,
    pub name: Option<String>,
    pub description: Option<String>,
    pub schema: String,
    pub created_at_ms: i64,
}

impl SchemaDoc {
    pub fn new(name: Option<String>, description: Option<String>, schema: &JsonValue) -> Self {
        debug_assert!(schema.is_object());
        Self {
            id: new_schema_id(),
            name,
            description,
            schema: schema.to_string(),
            created_at_ms: super::job::current_timestamp_ms(),
        }
    }

    pub fn schema_value(&self) -> Result<JsonValue, SchemaError> {
        Ok(serde_json::from_str(&self.schema)?)
    }

    /// Top-level keys the schema declares as required. Absent or malformed
    /// `required` arrays yield an empty set.
    pub fn required_keys(&self) -> Vec<String> {
        let Ok(value) = self.schema_value() else {
            return Vec::new();
        };
        value
            .get("required")
            .and_then(JsonValue::as_array)
            .map(|keys| {
                keys.iter()
                    .filter_map(JsonValue::as_str)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Normalize caller-supplied schema input. A document that already
    /// looks like JSON Schema is forwarded verbatim; a flat
    /// `{field: "type"}` object becomes an object schema with every field
    /// required.
    pub fn from_value(input: &JsonValue) -> Result<Self, SchemaError> {
        let object = input.as_object().ok_or(SchemaError::NotAnObject)?;
        if looks_like_json_schema(object) {
            Self::from_json_schema(input)
        } else {
            Self::from_simple_object(object)
        }
    }

    pub fn from_json_schema(input: &JsonValue) -> Result<Self, SchemaError> {
        let object = input.as_object().ok_or(SchemaError::NotAnObject)?;
        let name = object
            .get("title")
            .and_then(JsonValue::as_str)
            .map(str::to_string);
        let description = object
            .get("description")
            .and_then(JsonValue::as_str)
            .map(str::to_string);
        Ok(Self::new(name, description, input))
    }

    pub fn from_simple_object(fields: &JsonMap<String, JsonValue>) -> Result<Self, SchemaError> {
        let mut properties = JsonMap::new();
        let mut required = Vec::with_capacity(fields.len());

        for (field, type_name) in fields {
            let type_name = type_name.as_str().ok_or(SchemaError::NotAnObject)?;
            if !SHORTHAND_TYPES.contains(&type_name) {
                return Err(SchemaError::UnsupportedShorthand(type_name.to_string()));
            }
            properties.insert(field.clone(), json!({ "type": type_name }));
            required.push(JsonValue::String(field.clone()));
        }

        let schema = json!({
            "type": "object",
            "properties": properties,
            "required": required,
        });
        Ok(Self::new(None, None, &schema))
    }
}

fn looks_like_json_schema(object: &JsonMap<String, JsonValue>) -> bool {
    object.contains_key("$schema")
        || object.contains_key("properties")
        || object
            .get("type")
            .and_then(JsonValue::as_str)
            .is_some_and(|t| SHORTHAND_TYPES.contains(&t))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn json_schema_passes_through_verbatim() {
        let input = json!({
            "$schema": "https://json-schema.org/draft/2020-12/schema",
            "title": "Invoice",
            "type": "object",
            "properties": { "total": { "type": "number" } },
            "required": ["total"],
        });
        let doc = SchemaDoc::from_value(&input).expect("normalize");

        assert_eq!(doc.name.as_deref(), Some("Invoice"));
        assert_eq!(doc.schema_value().expect("parse"), input);
        assert_eq!(doc.required_keys(), vec!["total".to_string()]);
    }

    #[test]
    fn simple_object_becomes_object_schema_with_all_required() {
        let input = json!({ "total": "number", "vendor": "string" });
        let doc = SchemaDoc::from_value(&input).expect("normalize");
        let schema = doc.schema_value().expect("parse");

        assert_eq!(schema["type"], "object");
        assert_eq!(schema["properties"]["total"]["type"], "number");
        assert_eq!(schema["properties"]["vendor"]["type"], "string");
        let mut required = doc.required_keys();
        required.sort();
        assert_eq!(required, vec!["total".to_string(), "vendor".to_string()]);
    }

    #[test]
    fn shorthand_rejects_unknown_types() {
        let input = json!({ "total": "decimal" });
        let err = SchemaDoc::from_value(&input).expect_err("reject");
        assert!(matches!(err, SchemaError::UnsupportedShorthand(_)));
    }

    #[test]
    fn non_object_input_is_rejected() {
        assert!(matches!(
            SchemaDoc::from_value(&json!("number")),
            Err(SchemaError::NotAnObject)
        ));
        assert!(matches!(
            SchemaDoc::from_value(&json!([1, 2])),
            Err(SchemaError::NotAnObject)
        ));
    }

    #[test]
    fn missing_required_array_yields_empty_keys() {
        let input = json!({ "type": "object", "properties": {} });
        let doc = SchemaDoc::from_value(&input).expect("normalize");
        assert!(doc.required_keys().is_empty());
    }
}
