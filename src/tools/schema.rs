//! Tool parameter schemas.
//!
//! A `SchemaConverter` turns the JSON Schema a tool advertises into a
//! `ToolSchema` that can validate call arguments. A `SchemaAdapter` rewrites
//! the schema sent to a given provider family.

use std::fmt;
use std::sync::Arc;

use serde_json::{Map, Value, json};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SchemaError {
    #[error("Tool schema must be a JSON object, got {0}")]
    NotAnObject(String),
    #[error("Invalid tool schema: {0}")]
    Invalid(String),
}

/// A tool's parameter schema plus its compiled validator.
#[derive(Clone)]
pub struct ToolSchema {
    json: Value,
    validator: Option<Arc<jsonschema::Validator>>,
}

impl ToolSchema {
    /// `{"type": "object", "properties": {}}` accepting any object.
    pub fn empty_object() -> Self {
        Self {
            json: json!({"type": "object", "properties": {}}),
            validator: None,
        }
    }

    pub fn as_json(&self) -> &Value {
        &self.json
    }

    /// Validate call arguments, joining every violation into one message.
    pub fn validate(&self, args: &Value) -> Result<(), String> {
        let Some(validator) = &self.validator else {
            return if args.is_object() {
                Ok(())
            } else {
                Err("arguments must be a JSON object".to_string())
            };
        };

        let errors: Vec<String> = validator
            .iter_errors(args)
            .map(|err| {
                let path = err.instance_path.to_string();
                if path.is_empty() {
                    err.to_string()
                } else {
                    format!("{path}: {err}")
                }
            })
            .collect();
        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors.join("; "))
        }
    }
}

impl fmt::Debug for ToolSchema {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ToolSchema")
            .field("json", &self.json)
            .field("compiled", &self.validator.is_some())
            .finish()
    }
}

/// JSON Schema to validating schema conversion.
pub trait SchemaConverter: Send + Sync {
    fn convert(&self, schema: &Value) -> Result<ToolSchema, SchemaError>;

    /// Convert, or fall back to an empty object schema when conversion fails.
    fn convert_or_empty(&self, tool_id: &str, schema: &Value) -> ToolSchema {
        match self.convert(schema) {
            Ok(schema) => schema,
            Err(err) => {
                tracing::warn!(tool = %tool_id, "Using empty parameter schema: {err}");
                ToolSchema::empty_object()
            }
        }
    }
}

/// Converter backed by the `jsonschema` crate.
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonSchemaConverter;

impl SchemaConverter for JsonSchemaConverter {
    fn convert(&self, schema: &Value) -> Result<ToolSchema, SchemaError> {
        let mut normalized = match schema {
            Value::Null => return Ok(ToolSchema::empty_object()),
            Value::Object(map) => map.clone(),
            other => return Err(SchemaError::NotAnObject(type_name(other).to_string())),
        };
        normalized
            .entry("type")
            .or_insert_with(|| Value::String("object".to_string()));
        if normalized.get("type").and_then(Value::as_str) == Some("object") {
            normalized
                .entry("properties")
                .or_insert_with(|| Value::Object(Map::new()));
        }

        let json = Value::Object(normalized);
        let validator =
            jsonschema::validator_for(&json).map_err(|err| SchemaError::Invalid(err.to_string()))?;
        Ok(ToolSchema {
            json,
            validator: Some(Arc::new(validator)),
        })
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

// === Provider adapters ===

/// Provider-specific rewrite of the schema sent to the model.
pub trait SchemaAdapter: Send + Sync {
    fn adapt(&self, schema: Value) -> Value;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct IdentitySchemaAdapter;

impl SchemaAdapter for IdentitySchemaAdapter {
    fn adapt(&self, schema: Value) -> Value {
        schema
    }
}

/// Gemini rejects several standard JSON Schema constructs and empty objects.
#[derive(Debug, Default, Clone, Copy)]
pub struct GeminiSchemaAdapter;

const GEMINI_STRING_FORMATS: &[&str] = &["enum", "date-time"];
const GEMINI_PLACEHOLDER_PROPERTY: &str = "_placeholder";

impl SchemaAdapter for GeminiSchemaAdapter {
    fn adapt(&self, schema: Value) -> Value {
        let mut schema = gemini_rewrite(schema);
        if let Value::Object(map) = &mut schema {
            let properties = map
                .entry("properties")
                .or_insert_with(|| Value::Object(Map::new()));
            if let Value::Object(props) = properties
                && props.is_empty()
            {
                props.insert(
                    GEMINI_PLACEHOLDER_PROPERTY.to_string(),
                    json!({"type": "string", "description": "Unused. Leave empty."}),
                );
            }
        }
        schema
    }
}

fn gemini_rewrite(value: Value) -> Value {
    match value {
        Value::Object(map) => {
            let is_string = map.get("type").and_then(Value::as_str) == Some("string");
            let mut out = Map::with_capacity(map.len());
            for (key, value) in map {
                match key.as_str() {
                    "default" => {}
                    "format"
                        if is_string
                            && !value
                                .as_str()
                                .is_some_and(|f| GEMINI_STRING_FORMATS.contains(&f)) => {}
                    "anyOf" => {
                        out.insert("any_of".to_string(), gemini_rewrite(value));
                    }
                    "oneOf" => {
                        out.insert("one_of".to_string(), gemini_rewrite(value));
                    }
                    "allOf" => {
                        out.insert("all_of".to_string(), gemini_rewrite(value));
                    }
                    "properties" => {
                        out.insert(key, gemini_properties(value));
                    }
                    _ => {
                        out.insert(key, gemini_rewrite(value));
                    }
                }
            }
            Value::Object(out)
        }
        Value::Array(items) => Value::Array(items.into_iter().map(gemini_rewrite).collect()),
        other => other,
    }
}

fn gemini_properties(value: Value) -> Value {
    let Value::Object(props) = value else {
        return value;
    };
    let props = props
        .into_iter()
        .map(|(name, prop)| {
            let mut prop = gemini_rewrite(prop);
            if let Value::Object(map) = &mut prop {
                let composite = ["any_of", "one_of", "all_of"]
                    .iter()
                    .any(|k| map.contains_key(*k));
                let untyped = match map.get("type") {
                    None => !composite,
                    Some(Value::Null) => true,
                    Some(Value::String(t)) => t == "null",
                    Some(_) => false,
                };
                if untyped {
                    map.insert("type".to_string(), Value::String("string".to_string()));
                }
            }
            (name, prop)
        })
        .collect();
    Value::Object(props)
}

/// Adapter for a provider id; identity unless the provider needs rewrites.
pub fn schema_adapter_for(provider: &str) -> Box<dyn SchemaAdapter> {
    match provider.to_ascii_lowercase().as_str() {
        "gemini" | "google" | "vertex" | "vertex-ai" => Box::new(GeminiSchemaAdapter),
        _ => Box::new(IdentitySchemaAdapter),
    }
}
