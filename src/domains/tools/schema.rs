//! Parameter schemas.
//!
//! Downstream servers declare tool inputs as JSON Schema. The gateway turns
//! each declaration into a [`ParamSchema`] once, at discovery time, and
//! validates every call against it before forwarding.
//!
//! Supported subset:
//!
//! | JSON Schema | Honored keywords |
//! |---|---|
//! | `string` | `pattern`, `minLength`, `maxLength`, `enum` |
//! | `number`, `integer` | `minimum`, `maximum` |
//! | `boolean` | |
//! | `array` | `items`, `minItems`, `maxItems` |
//! | `object` | `properties`, `required` (nested objects are shallow) |
//!
//! Any other type is unconstrained. Properties not listed in `required` are
//! optional, and an optional property set to `null` counts as absent.
//! Undeclared properties are accepted and forwarded unchanged.

use std::collections::BTreeMap;

use regex::Regex;
use serde_json::{Map, Value, json};

use super::error::SchemaError;

// ============================================================================
// Schema Types
// ============================================================================

/// Translated schema of one value.
#[derive(Debug, Clone)]
pub enum ParamSchema {
    String(StringSchema),
    Number(NumberSchema),
    Integer(NumberSchema),
    Boolean,
    Array(ArraySchema),
    Object(ObjectSchema),
    Any,
}

/// Constraints on a string.
#[derive(Debug, Clone, Default)]
pub struct StringSchema {
    pub pattern: Option<Regex>,
    pub min_length: Option<usize>,
    pub max_length: Option<usize>,
    pub allowed: Option<Vec<String>>,
}

/// Inclusive bounds on a number or integer.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct NumberSchema {
    pub minimum: Option<f64>,
    pub maximum: Option<f64>,
}

/// Constraints on an array.
#[derive(Debug, Clone)]
pub struct ArraySchema {
    pub items: Box<ParamSchema>,
    pub min_items: Option<usize>,
    pub max_items: Option<usize>,
}

/// A set of named properties.
#[derive(Debug, Clone, Default)]
pub struct ObjectSchema {
    pub properties: BTreeMap<String, Property>,
}

/// One declared property of an object.
#[derive(Debug, Clone)]
pub struct Property {
    pub schema: ParamSchema,
    pub description: Option<String>,
    pub required: bool,
}

// ============================================================================
// Translation
// ============================================================================

impl ParamSchema {
    /// Translate a tool's declared input schema.
    ///
    /// A missing (or `null`) declaration means the tool takes an empty
    /// parameter object.
    pub fn from_input_schema(schema: Option<&Value>) -> Result<Self, SchemaError> {
        let schema = match schema {
            None | Some(Value::Null) => return Ok(Self::Object(ObjectSchema::default())),
            Some(schema) => schema,
        };

        let map = as_schema_object(schema, "$")?;
        match declared_type(map, "$")? {
            None | Some("object") => Ok(Self::Object(translate_object(map, "$", false)?)),
            Some(other) => Err(SchemaError::malformed(
                "$",
                format!("tool input must be an object, found {other}"),
            )),
        }
    }

    /// Check `value` against this schema.
    pub fn validate(&self, value: &Value) -> Result<(), SchemaError> {
        validate_at(self, value, "$")
    }

    /// Render back to JSON Schema.
    pub fn to_json_schema(&self) -> Value {
        match self {
            Self::String(s) => {
                let mut out = json!({ "type": "string" });
                if let Some(pattern) = &s.pattern {
                    out["pattern"] = json!(pattern.as_str());
                }
                if let Some(min) = s.min_length {
                    out["minLength"] = json!(min);
                }
                if let Some(max) = s.max_length {
                    out["maxLength"] = json!(max);
                }
                if let Some(allowed) = &s.allowed {
                    out["enum"] = json!(allowed);
                }
                out
            }
            Self::Number(n) => render_number("number", n),
            Self::Integer(n) => render_number("integer", n),
            Self::Boolean => json!({ "type": "boolean" }),
            Self::Array(a) => {
                let mut out = json!({ "type": "array", "items": a.items.to_json_schema() });
                if let Some(min) = a.min_items {
                    out["minItems"] = json!(min);
                }
                if let Some(max) = a.max_items {
                    out["maxItems"] = json!(max);
                }
                out
            }
            Self::Object(o) => o.to_json_schema(),
            Self::Any => json!({}),
        }
    }

    /// Render as a tool input schema, which must always be an object.
    pub fn to_input_schema(&self) -> Map<String, Value> {
        let rendered = match self {
            Self::Object(o) => o.to_json_schema(),
            _ => json!({ "type": "object" }),
        };
        match rendered {
            Value::Object(map) => map,
            _ => Map::new(),
        }
    }
}

impl ObjectSchema {
    /// Names of required properties.
    pub fn required(&self) -> Vec<&str> {
        self.properties
            .iter()
            .filter(|(_, p)| p.required)
            .map(|(name, _)| name.as_str())
            .collect()
    }

    fn to_json_schema(&self) -> Value {
        let properties: Map<String, Value> = self
            .properties
            .iter()
            .map(|(name, property)| {
                let mut rendered = property.schema.to_json_schema();
                if let (Some(description), Value::Object(map)) = (&property.description, &mut rendered) {
                    map.insert("description".to_string(), json!(description));
                }
                (name.clone(), rendered)
            })
            .collect();

        let mut out = json!({ "type": "object", "properties": properties });
        let required = self.required();
        if !required.is_empty() {
            out["required"] = json!(required);
        }
        out
    }
}

fn render_number(kind: &str, bounds: &NumberSchema) -> Value {
    let mut out = json!({ "type": kind });
    if let Some(min) = bounds.minimum {
        out["minimum"] = json!(min);
    }
    if let Some(max) = bounds.maximum {
        out["maximum"] = json!(max);
    }
    out
}

fn as_schema_object<'a>(schema: &'a Value, path: &str) -> Result<&'a Map<String, Value>, SchemaError> {
    schema
        .as_object()
        .ok_or_else(|| SchemaError::malformed(path, "schema is not an object"))
}

/// The declared `type`. `["string", "null"]` style unions use the first
/// non-null member.
fn declared_type<'a>(map: &'a Map<String, Value>, path: &str) -> Result<Option<&'a str>, SchemaError> {
    match map.get("type") {
        None => Ok(None),
        Some(Value::String(kind)) => Ok(Some(kind.as_str())),
        Some(Value::Array(kinds)) => Ok(kinds
            .iter()
            .filter_map(Value::as_str)
            .find(|kind| *kind != "null")),
        Some(_) => Err(SchemaError::malformed(path, "type must be a string")),
    }
}

fn translate(schema: &Value, path: &str, nested: bool) -> Result<ParamSchema, SchemaError> {
    let map = as_schema_object(schema, path)?;

    let translated = match declared_type(map, path)? {
        Some("string") => ParamSchema::String(StringSchema {
            pattern: match map.get("pattern") {
                None => None,
                Some(Value::String(pattern)) => Some(Regex::new(pattern).map_err(|e| {
                    SchemaError::malformed(path, format!("invalid pattern: {e}"))
                })?),
                Some(_) => return Err(SchemaError::malformed(path, "pattern must be a string")),
            },
            min_length: count(map, "minLength", path)?,
            max_length: count(map, "maxLength", path)?,
            allowed: match map.get("enum") {
                None => None,
                Some(Value::Array(values)) => Some(
                    values
                        .iter()
                        .filter_map(Value::as_str)
                        .map(str::to_string)
                        .collect(),
                ),
                Some(_) => return Err(SchemaError::malformed(path, "enum must be an array")),
            },
        }),
        Some("number") => ParamSchema::Number(bounds(map, path)?),
        Some("integer") => ParamSchema::Integer(bounds(map, path)?),
        Some("boolean") => ParamSchema::Boolean,
        Some("array") => ParamSchema::Array(ArraySchema {
            items: Box::new(match map.get("items") {
                None => ParamSchema::Any,
                Some(items) => translate(items, &format!("{path}.items"), nested)?,
            }),
            min_items: count(map, "minItems", path)?,
            max_items: count(map, "maxItems", path)?,
        }),
        Some("object") => ParamSchema::Object(translate_object(map, path, nested)?),
        _ => ParamSchema::Any,
    };

    Ok(translated)
}

/// Translate an object's properties. Below the top level, properties are
/// kept by name and description only and none of them is required.
fn translate_object(map: &Map<String, Value>, path: &str, nested: bool) -> Result<ObjectSchema, SchemaError> {
    let required: Vec<&str> = match map.get("required") {
        None => Vec::new(),
        Some(Value::Array(names)) => names
            .iter()
            .map(|name| {
                name.as_str()
                    .ok_or_else(|| SchemaError::malformed(path, "required must list property names"))
            })
            .collect::<Result<_, _>>()?,
        Some(_) => return Err(SchemaError::malformed(path, "required must be an array")),
    };

    let declared = match map.get("properties") {
        None => return Ok(ObjectSchema::default()),
        Some(Value::Object(properties)) => properties,
        Some(_) => return Err(SchemaError::malformed(path, "properties must be an object")),
    };

    let mut properties = BTreeMap::new();
    for (name, schema) in declared {
        let property_path = format!("{path}.{name}");
        let description = schema
            .get("description")
            .and_then(Value::as_str)
            .map(str::to_string);
        let schema = if nested {
            ParamSchema::Any
        } else {
            translate(schema, &property_path, true)?
        };
        properties.insert(
            name.clone(),
            Property {
                schema,
                description,
                required: !nested && required.contains(&name.as_str()),
            },
        );
    }

    Ok(ObjectSchema { properties })
}

fn count(map: &Map<String, Value>, key: &str, path: &str) -> Result<Option<usize>, SchemaError> {
    match map.get(key) {
        None => Ok(None),
        Some(value) => value
            .as_u64()
            .and_then(|n| usize::try_from(n).ok())
            .map(Some)
            .ok_or_else(|| SchemaError::malformed(path, format!("{key} must be a non-negative integer"))),
    }
}

fn bounds(map: &Map<String, Value>, path: &str) -> Result<NumberSchema, SchemaError> {
    let bound = |key: &str| match map.get(key) {
        None => Ok(None),
        Some(value) => value
            .as_f64()
            .map(Some)
            .ok_or_else(|| SchemaError::malformed(path, format!("{key} must be a number"))),
    };
    Ok(NumberSchema {
        minimum: bound("minimum")?,
        maximum: bound("maximum")?,
    })
}

// ============================================================================
// Validation
// ============================================================================

fn validate_at(schema: &ParamSchema, value: &Value, path: &str) -> Result<(), SchemaError> {
    match schema {
        ParamSchema::Any => Ok(()),
        ParamSchema::Boolean => {
            if value.is_boolean() {
                Ok(())
            } else {
                Err(SchemaError::violation(path, "expected a boolean"))
            }
        }
        ParamSchema::String(s) => {
            let text = value
                .as_str()
                .ok_or_else(|| SchemaError::violation(path, "expected a string"))?;
            let length = text.chars().count();
            if let Some(min) = s.min_length {
                if length < min {
                    return Err(SchemaError::violation(path, format!("shorter than {min} characters")));
                }
            }
            if let Some(max) = s.max_length {
                if length > max {
                    return Err(SchemaError::violation(path, format!("longer than {max} characters")));
                }
            }
            if let Some(pattern) = &s.pattern {
                if !pattern.is_match(text) {
                    return Err(SchemaError::violation(
                        path,
                        format!("does not match pattern {}", pattern.as_str()),
                    ));
                }
            }
            if let Some(allowed) = &s.allowed {
                if !allowed.iter().any(|a| a == text) {
                    return Err(SchemaError::violation(
                        path,
                        format!("must be one of {}", allowed.join(", ")),
                    ));
                }
            }
            Ok(())
        }
        ParamSchema::Number(bounds) => {
            let number = value
                .as_f64()
                .ok_or_else(|| SchemaError::violation(path, "expected a number"))?;
            check_bounds(bounds, number, path)
        }
        ParamSchema::Integer(bounds) => {
            let number = value
                .as_f64()
                .filter(|n| n.fract() == 0.0)
                .ok_or_else(|| SchemaError::violation(path, "expected an integer"))?;
            check_bounds(bounds, number, path)
        }
        ParamSchema::Array(a) => {
            let items = value
                .as_array()
                .ok_or_else(|| SchemaError::violation(path, "expected an array"))?;
            if let Some(min) = a.min_items {
                if items.len() < min {
                    return Err(SchemaError::violation(path, format!("fewer than {min} items")));
                }
            }
            if let Some(max) = a.max_items {
                if items.len() > max {
                    return Err(SchemaError::violation(path, format!("more than {max} items")));
                }
            }
            for (index, item) in items.iter().enumerate() {
                validate_at(&a.items, item, &format!("{path}[{index}]"))?;
            }
            Ok(())
        }
        ParamSchema::Object(o) => {
            let map = value
                .as_object()
                .ok_or_else(|| SchemaError::violation(path, "expected an object"))?;
            for (name, property) in &o.properties {
                let property_path = format!("{path}.{name}");
                match map.get(name) {
                    None | Some(Value::Null) => {
                        if property.required {
                            return Err(SchemaError::violation(property_path, "required property is missing"));
                        }
                    }
                    Some(field) => validate_at(&property.schema, field, &property_path)?,
                }
            }
            Ok(())
        }
    }
}

fn check_bounds(bounds: &NumberSchema, number: f64, path: &str) -> Result<(), SchemaError> {
    if let Some(min) = bounds.minimum {
        if number < min {
            return Err(SchemaError::violation(path, format!("less than {min}")));
        }
    }
    if let Some(max) = bounds.maximum {
        if number > max {
            return Err(SchemaError::violation(path, format!("greater than {max}")));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn input(schema: Value) -> ParamSchema {
        ParamSchema::from_input_schema(Some(&schema)).unwrap()
    }

    #[test]
    fn test_string_length_bounds() {
        let schema = translate(&json!({"type": "string", "minLength": 3, "maxLength": 10}), "$", false).unwrap();
        assert!(schema.validate(&json!("ab")).is_err());
        assert!(schema.validate(&json!("abcd")).is_ok());
        assert!(schema.validate(&json!("01234567890")).is_err());
    }

    #[test]
    fn test_string_pattern_and_enum() {
        let schema = input(json!({
            "type": "object",
            "properties": {
                "code": {"type": "string", "pattern": "^[A-Z]{3}$"},
                "mode": {"type": "string", "enum": ["fast", "slow"]}
            }
        }));
        assert!(schema.validate(&json!({"code": "ABC", "mode": "fast"})).is_ok());
        assert!(schema.validate(&json!({"code": "abc"})).is_err());
        assert!(schema.validate(&json!({"mode": "medium"})).is_err());
    }

    #[test]
    fn test_numeric_bounds() {
        let schema = input(json!({
            "properties": {
                "ratio": {"type": "number", "minimum": 0, "maximum": 1},
                "count": {"type": "integer", "minimum": 1}
            }
        }));
        assert!(schema.validate(&json!({"ratio": 0.5, "count": 3})).is_ok());
        assert!(schema.validate(&json!({"ratio": 1.5})).is_err());
        assert!(schema.validate(&json!({"count": 0})).is_err());
        assert!(schema.validate(&json!({"count": 2.5})).is_err());
        assert!(schema.validate(&json!({"count": "3"})).is_err());
    }

    #[test]
    fn test_array_items_and_counts() {
        let schema = input(json!({
            "properties": {
                "tags": {"type": "array", "items": {"type": "string"}, "minItems": 1, "maxItems": 2}
            }
        }));
        assert!(schema.validate(&json!({"tags": ["a"]})).is_ok());
        assert!(schema.validate(&json!({"tags": []})).is_err());
        assert!(schema.validate(&json!({"tags": ["a", "b", "c"]})).is_err());

        let err = schema.validate(&json!({"tags": ["a", 7]})).unwrap_err();
        assert_eq!(err, SchemaError::violation("$.tags[1]", "expected a string"));
    }

    #[test]
    fn test_required_and_optional() {
        let schema = input(json!({
            "type": "object",
            "properties": {
                "text": {"type": "string"},
                "loud": {"type": "boolean"}
            },
            "required": ["text"]
        }));
        assert!(schema.validate(&json!({"text": "hi"})).is_ok());
        assert!(schema.validate(&json!({"text": "hi", "loud": null})).is_ok());
        assert!(schema.validate(&json!({"text": "hi", "extra": 1})).is_ok());
        assert!(schema.validate(&json!({"loud": true})).is_err());
        assert!(schema.validate(&json!({"text": null})).is_err());
    }

    #[test]
    fn test_nested_objects_are_shallow() {
        let schema = input(json!({
            "properties": {
                "filter": {
                    "type": "object",
                    "properties": {
                        "year": {"type": "integer", "description": "Release year"}
                    },
                    "required": ["year"]
                }
            }
        }));

        let ParamSchema::Object(top) = &schema else {
            panic!("expected object");
        };
        let ParamSchema::Object(filter) = &top.properties["filter"].schema else {
            panic!("expected nested object");
        };
        let year = &filter.properties["year"];
        assert!(matches!(year.schema, ParamSchema::Any));
        assert_eq!(year.description.as_deref(), Some("Release year"));

        assert!(!year.required);

        assert!(schema.validate(&json!({"filter": {"year": "not a number"}})).is_ok());
        assert!(schema.validate(&json!({"filter": {}})).is_ok());
        assert!(schema.validate(&json!({"filter": 3})).is_err());
    }

    #[test]
    fn test_unknown_type_is_unconstrained() {
        let schema = input(json!({"properties": {"blob": {"type": "binary"}, "free": {}}}));
        assert!(schema.validate(&json!({"blob": [1, 2], "free": {"x": 1}})).is_ok());
    }

    #[test]
    fn test_missing_schema_means_empty_object() {
        let schema = ParamSchema::from_input_schema(None).unwrap();
        assert!(schema.validate(&json!({})).is_ok());
        assert_eq!(schema.to_input_schema()["type"], "object");
    }

    #[test]
    fn test_malformed_schemas() {
        let bad = [
            json!("string"),
            json!({"type": "string"}),
            json!({"properties": []}),
            json!({"properties": {"x": {"type": "string", "pattern": "("}}}),
            json!({"properties": {"x": {"type": "string", "minLength": -1}}}),
            json!({"required": "x"}),
        ];
        for schema in bad {
            let err = ParamSchema::from_input_schema(Some(&schema)).unwrap_err();
            assert!(matches!(err, SchemaError::Malformed { .. }), "{schema}");
        }
    }

    #[test]
    fn test_nullable_type_union() {
        let schema = input(json!({"properties": {"n": {"type": ["null", "integer"]}}}));
        assert!(schema.validate(&json!({"n": 4})).is_ok());
        assert!(schema.validate(&json!({"n": "4"})).is_err());
    }

    #[test]
    fn test_render_keeps_constraints() {
        let schema = input(json!({
            "type": "object",
            "properties": {
                "text": {"type": "string", "minLength": 3, "description": "What to say"}
            },
            "required": ["text"]
        }));
        let rendered = Value::Object(schema.to_input_schema());
        assert_eq!(rendered["properties"]["text"]["minLength"], 3);
        assert_eq!(rendered["properties"]["text"]["description"], "What to say");
        assert_eq!(rendered["required"], json!(["text"]));
    }
}
