//! Structural contracts and the boundary validator
//!
//! Every payload crossing a component boundary (planner output, connector
//! records, narrator input) is checked here. Nothing is coerced: a payload
//! either matches its contract unchanged or the call is rejected.

use crate::error::SchemaViolation;
use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::str::FromStr;

pub mod contracts;
pub use contracts::{
    figure_schema, invoice_record_schema, result_set_schema, task_graph_schema,
    transaction_record_schema,
};

/// Declared shape of a JSON payload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Schema {
    Any,
    Null,
    Bool,
    Integer,
    Number,
    String,
    /// Exact decimal, as a string or a JSON number
    Decimal,
    /// Calendar date, `YYYY-MM-DD`
    Date,
    Enum { values: Vec<String> },
    Array { items: Box<Schema> },
    Object { fields: Vec<Field>, allow_extra: bool },
    /// Object with arbitrary keys whose values share one schema
    Map { values: Box<Schema> },
    /// Object discriminated by a string tag field
    Tagged { tag: String, variants: BTreeMap<String, Schema> },
    Nullable { inner: Box<Schema> },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Field {
    pub name: String,
    pub schema: Schema,
    pub required: bool,
}

impl Field {
    pub fn required(name: &str, schema: Schema) -> Self {
        Self {
            name: name.to_string(),
            schema,
            required: true,
        }
    }

    pub fn optional(name: &str, schema: Schema) -> Self {
        Self {
            name: name.to_string(),
            schema,
            required: false,
        }
    }
}

impl Schema {
    /// Closed object: unknown keys are violations
    pub fn object(fields: Vec<Field>) -> Self {
        Schema::Object {
            fields,
            allow_extra: false,
        }
    }

    /// Open object: declared keys are checked, others pass through untouched
    pub fn open_object(fields: Vec<Field>) -> Self {
        Schema::Object {
            fields,
            allow_extra: true,
        }
    }

    pub fn any_object() -> Self {
        Self::open_object(Vec::new())
    }

    pub fn array(items: Schema) -> Self {
        Schema::Array {
            items: Box::new(items),
        }
    }

    pub fn map(values: Schema) -> Self {
        Schema::Map {
            values: Box::new(values),
        }
    }

    pub fn nullable(inner: Schema) -> Self {
        Schema::Nullable {
            inner: Box::new(inner),
        }
    }

    pub fn enumeration(values: &[&str]) -> Self {
        Schema::Enum {
            values: values.iter().map(|v| v.to_string()).collect(),
        }
    }

    pub fn tagged(tag: &str, variants: Vec<(&str, Schema)>) -> Self {
        Schema::Tagged {
            tag: tag.to_string(),
            variants: variants
                .into_iter()
                .map(|(name, schema)| (name.to_string(), schema))
                .collect(),
        }
    }

    /// Names of required fields, when this is an object schema
    pub fn required_fields(&self) -> Vec<&str> {
        match self {
            Schema::Object { fields, .. } => fields
                .iter()
                .filter(|f| f.required)
                .map(|f| f.name.as_str())
                .collect(),
            _ => Vec::new(),
        }
    }

    /// Compact text rendering used in language-model prompts
    pub fn describe(&self) -> String {
        match self {
            Schema::Any => "any".to_string(),
            Schema::Null => "null".to_string(),
            Schema::Bool => "bool".to_string(),
            Schema::Integer => "integer".to_string(),
            Schema::Number => "number".to_string(),
            Schema::String => "string".to_string(),
            Schema::Decimal => "decimal".to_string(),
            Schema::Date => "date(YYYY-MM-DD)".to_string(),
            Schema::Enum { values } => values.join("|"),
            Schema::Array { items } => format!("[{}]", items.describe()),
            Schema::Object {
                fields,
                allow_extra,
            } => {
                let mut parts: Vec<String> = fields
                    .iter()
                    .map(|f| {
                        format!(
                            "{}{}: {}",
                            f.name,
                            if f.required { "" } else { "?" },
                            f.schema.describe()
                        )
                    })
                    .collect();
                if *allow_extra {
                    parts.push("...".to_string());
                }
                format!("{{{}}}", parts.join(", "))
            }
            Schema::Map { values } => format!("{{<key>: {}}}", values.describe()),
            Schema::Tagged { tag, variants } => variants
                .iter()
                .map(|(name, schema)| format!("{}={} {}", tag, name, schema.describe()))
                .collect::<Vec<_>>()
                .join(" | "),
            Schema::Nullable { inner } => format!("{}|null", inner.describe()),
        }
    }
}

/// Validate a payload against its contract and hand it back unchanged.
pub fn validate(payload: Value, schema: &Schema, boundary: &str) -> Result<Value, SchemaViolation> {
    check(&payload, schema, "$", boundary)?;
    Ok(payload)
}

/// Borrowing form of [`validate`]
pub fn validate_ref(payload: &Value, schema: &Schema, boundary: &str) -> Result<(), SchemaViolation> {
    check(payload, schema, "$", boundary)
}

/// Exact decimal from a JSON string or number; `None` when not representable.
pub fn decimal_from_json(value: &Value) -> Option<Decimal> {
    match value {
        Value::String(s) => {
            let s = s.trim();
            Decimal::from_str(s)
                .or_else(|_| Decimal::from_scientific(s))
                .ok()
        }
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Some(Decimal::from(i))
            } else if let Some(u) = n.as_u64() {
                Some(Decimal::from(u))
            } else {
                let text = n.to_string();
                Decimal::from_str(&text)
                    .or_else(|_| Decimal::from_scientific(&text))
                    .ok()
            }
        }
        _ => None,
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

fn check(value: &Value, schema: &Schema, path: &str, boundary: &str) -> Result<(), SchemaViolation> {
    let mismatch = |expected: &str| {
        SchemaViolation::new(
            boundary,
            path,
            format!("expected {}, found {}", expected, type_name(value)),
        )
    };

    match schema {
        Schema::Any => Ok(()),
        Schema::Null => value.is_null().then_some(()).ok_or_else(|| mismatch("null")),
        Schema::Bool => value.is_boolean().then_some(()).ok_or_else(|| mismatch("bool")),
        Schema::Integer => (value.is_i64() || value.is_u64())
            .then_some(())
            .ok_or_else(|| mismatch("integer")),
        Schema::Number => value.is_number().then_some(()).ok_or_else(|| mismatch("number")),
        Schema::String => value.is_string().then_some(()).ok_or_else(|| mismatch("string")),
        Schema::Decimal => decimal_from_json(value)
            .map(|_| ())
            .ok_or_else(|| mismatch("decimal")),
        Schema::Date => {
            let s = value.as_str().ok_or_else(|| mismatch("date string"))?;
            NaiveDate::parse_from_str(s, "%Y-%m-%d")
                .map(|_| ())
                .map_err(|_| SchemaViolation::new(boundary, path, format!("invalid date '{}'", s)))
        }
        Schema::Enum { values } => {
            let s = value.as_str().ok_or_else(|| mismatch("string"))?;
            if values.iter().any(|v| v == s) {
                Ok(())
            } else {
                Err(SchemaViolation::new(
                    boundary,
                    path,
                    format!("'{}' is not one of [{}]", s, values.join(", ")),
                ))
            }
        }
        Schema::Array { items } => {
            let arr = value.as_array().ok_or_else(|| mismatch("array"))?;
            for (i, item) in arr.iter().enumerate() {
                check(item, items, &format!("{}[{}]", path, i), boundary)?;
            }
            Ok(())
        }
        Schema::Object {
            fields,
            allow_extra,
        } => {
            let obj = value.as_object().ok_or_else(|| mismatch("object"))?;
            for field in fields {
                match obj.get(&field.name) {
                    Some(v) => check(v, &field.schema, &format!("{}.{}", path, field.name), boundary)?,
                    None if field.required => {
                        return Err(SchemaViolation::new(
                            boundary,
                            path,
                            format!("missing required field '{}'", field.name),
                        ))
                    }
                    None => {}
                }
            }
            if !allow_extra {
                if let Some(extra) = obj.keys().find(|k| !fields.iter().any(|f| &f.name == *k)) {
                    return Err(SchemaViolation::new(
                        boundary,
                        path,
                        format!("unexpected field '{}'", extra),
                    ));
                }
            }
            Ok(())
        }
        Schema::Map { values } => {
            let obj = value.as_object().ok_or_else(|| mismatch("object"))?;
            for (key, v) in obj {
                check(v, values, &format!("{}.{}", path, key), boundary)?;
            }
            Ok(())
        }
        Schema::Tagged { tag, variants } => {
            let obj = value.as_object().ok_or_else(|| mismatch("object"))?;
            let name = obj
                .get(tag)
                .and_then(Value::as_str)
                .ok_or_else(|| SchemaViolation::new(boundary, path, format!("missing tag '{}'", tag)))?;
            let variant = variants.get(name).ok_or_else(|| {
                SchemaViolation::new(boundary, path, format!("unknown {} '{}'", tag, name))
            })?;
            check(value, variant, path, boundary)
        }
        Schema::Nullable { inner } => {
            if value.is_null() {
                Ok(())
            } else {
                check(value, inner, path, boundary)
            }
        }
    }
}
