//! Tagged-variant representation of a tool's input schema, and structural
//! validation of call arguments against it.
//!
//! Downstream tool schemas are data, not types — we never generate
//! compile-time bindings per tool. `InputSchema` is a small recursive tree
//! mirroring JSON Schema's shape, parsed once from whatever `serde_json::Value`
//! the backend handed us at discovery time.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum SchemaNode {
    Object {
        #[serde(default)]
        required: Vec<String>,
        #[serde(default)]
        properties: BTreeMap<String, SchemaNode>,
    },
    String {
        #[serde(default)]
        pattern: Option<String>,
        #[serde(rename = "enum", default)]
        enum_values: Option<Vec<String>>,
    },
    Number {
        #[serde(default)]
        minimum: Option<f64>,
        #[serde(default)]
        maximum: Option<f64>,
    },
    Integer {
        #[serde(default)]
        minimum: Option<f64>,
        #[serde(default)]
        maximum: Option<f64>,
    },
    Array {
        items: Option<Box<SchemaNode>>,
    },
    Boolean,
    /// Anything we couldn't parse into a stricter shape falls back to "any value
    /// accepted" rather than rejecting the tool outright.
    Any,
}

/// Parse a raw JSON Schema-ish value (as reported by a backend) into our tree.
/// Never fails: unrecognized shapes degrade to `SchemaNode::Any`.
pub fn parse(raw: &Value) -> SchemaNode {
    parse_node(raw)
}

fn parse_node(raw: &Value) -> SchemaNode {
    let Some(obj) = raw.as_object() else {
        return SchemaNode::Any;
    };
    let ty = obj.get("type").and_then(|t| t.as_str()).unwrap_or("");
    match ty {
        "object" => {
            let required = obj
                .get("required")
                .and_then(|r| r.as_array())
                .map(|arr| {
                    arr.iter()
                        .filter_map(|v| v.as_str().map(str::to_string))
                        .collect()
                })
                .unwrap_or_default();
            let properties = obj
                .get("properties")
                .and_then(|p| p.as_object())
                .map(|map| {
                    map.iter()
                        .map(|(k, v)| (k.clone(), parse_node(v)))
                        .collect()
                })
                .unwrap_or_default();
            SchemaNode::Object {
                required,
                properties,
            }
        }
        "string" => SchemaNode::String {
            pattern: obj
                .get("pattern")
                .and_then(|v| v.as_str())
                .map(str::to_string),
            enum_values: obj.get("enum").and_then(|v| v.as_array()).map(|arr| {
                arr.iter()
                    .filter_map(|v| v.as_str().map(str::to_string))
                    .collect()
            }),
        },
        "number" => SchemaNode::Number {
            minimum: obj.get("minimum").and_then(|v| v.as_f64()),
            maximum: obj.get("maximum").and_then(|v| v.as_f64()),
        },
        "integer" => SchemaNode::Integer {
            minimum: obj.get("minimum").and_then(|v| v.as_f64()),
            maximum: obj.get("maximum").and_then(|v| v.as_f64()),
        },
        "array" => SchemaNode::Array {
            items: obj.get("items").map(|v| Box::new(parse_node(v))),
        },
        "boolean" => SchemaNode::Boolean,
        _ => {
            if obj.contains_key("properties") {
                parse_node(&Value::Object({
                    let mut m = obj.clone();
                    m.insert("type".into(), Value::String("object".into()));
                    m
                }))
            } else {
                SchemaNode::Any
            }
        }
    }
}

/// One field-level validation complaint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldError {
    pub field: String,
    pub message: String,
}

impl std::fmt::Display for FieldError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

/// Validate `args` against `schema`, checking required fields and top-level
/// types only (per §4.10 step 4 — this is not a full JSON Schema validator).
pub fn validate(schema: &SchemaNode, args: &Value) -> Vec<FieldError> {
    let mut errors = Vec::new();
    validate_node("$", schema, args, &mut errors, true);
    errors
}

fn validate_node(
    path: &str,
    schema: &SchemaNode,
    value: &Value,
    errors: &mut Vec<FieldError>,
    top_level: bool,
) {
    match schema {
        SchemaNode::Object {
            required,
            properties,
        } => {
            let Some(obj) = value.as_object() else {
                errors.push(FieldError {
                    field: path.to_string(),
                    message: "expected an object".into(),
                });
                return;
            };
            for field in required {
                if !obj.contains_key(field) {
                    errors.push(FieldError {
                        field: field.clone(),
                        message: "required field missing".into(),
                    });
                }
            }
            // Only type-check top-level properties; we don't recurse deeply
            // into nested objects per the "top-level types" scope in §4.10.
            if top_level {
                for (name, prop_schema) in properties {
                    if let Some(v) = obj.get(name) {
                        validate_node(name, prop_schema, v, errors, false);
                    }
                }
            }
        }
        SchemaNode::String { enum_values, .. } => {
            let Some(s) = value.as_str() else {
                errors.push(FieldError {
                    field: path.to_string(),
                    message: "expected a string".into(),
                });
                return;
            };
            if let Some(values) = enum_values
                && !values.iter().any(|v| v == s)
            {
                errors.push(FieldError {
                    field: path.to_string(),
                    message: format!("value must be one of {values:?}"),
                });
            }
        }
        SchemaNode::Number { .. } => {
            if !value.is_number() {
                errors.push(FieldError {
                    field: path.to_string(),
                    message: "expected a number".into(),
                });
            }
        }
        SchemaNode::Integer { .. } => {
            if !value.is_i64() && !value.is_u64() {
                errors.push(FieldError {
                    field: path.to_string(),
                    message: "expected an integer".into(),
                });
            }
        }
        SchemaNode::Array { .. } => {
            if !value.is_array() {
                errors.push(FieldError {
                    field: path.to_string(),
                    message: "expected an array".into(),
                });
            }
        }
        SchemaNode::Boolean => {
            if !value.is_boolean() {
                errors.push(FieldError {
                    field: path.to_string(),
                    message: "expected a boolean".into(),
                });
            }
        }
        SchemaNode::Any => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_object_with_required_fields() {
        let raw = json!({
            "type": "object",
            "required": ["path"],
            "properties": {
                "path": {"type": "string"},
                "recursive": {"type": "boolean"}
            }
        });
        let node = parse(&raw);
        match node {
            SchemaNode::Object {
                required,
                properties,
            } => {
                assert_eq!(required, vec!["path".to_string()]);
                assert_eq!(properties.len(), 2);
            }
            _ => panic!("expected object"),
        }
    }

    #[test]
    fn missing_required_field_is_reported() {
        let schema = parse(&json!({
            "type": "object",
            "required": ["path"],
            "properties": {"path": {"type": "string"}}
        }));
        let errors = validate(&schema, &json!({}));
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].field, "path");
    }

    #[test]
    fn wrong_top_level_type_is_reported() {
        let schema = parse(&json!({
            "type": "object",
            "properties": {"count": {"type": "integer"}}
        }));
        let errors = validate(&schema, &json!({"count": "five"}));
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].field, "count");
    }

    #[test]
    fn enum_mismatch_is_reported() {
        let schema = parse(&json!({
            "type": "object",
            "properties": {"mode": {"type": "string", "enum": ["a", "b"]}}
        }));
        let errors = validate(&schema, &json!({"mode": "c"}));
        assert_eq!(errors.len(), 1);
    }

    #[test]
    fn unknown_shape_degrades_to_any() {
        let schema = parse(&json!({"type": "widget"}));
        assert!(matches!(schema, SchemaNode::Any));
        assert!(validate(&schema, &json!(42)).is_empty());
    }
}
