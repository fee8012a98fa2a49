//! Schema-driven argument validation.
//!
//! Supports the JSON-schema subset MCP servers actually publish: `type`
//! (single or union), `enum`, string length and `pattern`, numeric bounds,
//! array length and `items`, object `required` and `properties`, and
//! `default`. Arguments are coerced where the intent is unambiguous
//! (`"3"` → `3` for integers, `"yes"` → `true` for booleans) so validating
//! an already-valid value returns it unchanged.

use serde_json::{Map, Number, Value};

use crate::mcp_client::errors::McpError;

/// One declared top-level parameter.
#[derive(Debug, Clone, PartialEq)]
pub struct ParamSpec {
    pub name: String,
    /// Human-readable type label (`string`, `integer | null`, `any`).
    pub type_label: String,
    pub required: bool,
    pub default: Option<Value>,
    pub description: Option<String>,
    pub schema: Value,
}

/// Validates and coerces arguments for one tool.
#[derive(Debug, Clone)]
pub struct ParameterValidator {
    tool_name: String,
    schema: Value,
}

impl ParameterValidator {
    pub fn new(tool_name: &str, schema: &Value) -> Self {
        Self {
            tool_name: tool_name.to_string(),
            schema: schema.clone(),
        }
    }

    /// Declared parameters, required first, each group in name order.
    pub fn parameters(&self) -> Vec<ParamSpec> {
        let required = required_names(&self.schema);
        let mut params: Vec<ParamSpec> = properties(&self.schema)
            .map(|props| {
                props
                    .iter()
                    .map(|(name, prop)| ParamSpec {
                        name: name.clone(),
                        type_label: type_label(prop),
                        required: required.contains(&name.as_str()),
                        default: prop.get("default").cloned(),
                        description: prop
                            .get("description")
                            .and_then(Value::as_str)
                            .map(String::from),
                        schema: prop.clone(),
                    })
                    .collect()
            })
            .unwrap_or_default();

        // Required names without a property schema still count.
        for name in &required {
            if !params.iter().any(|p| p.name == *name) {
                params.push(ParamSpec {
                    name: name.to_string(),
                    type_label: "any".into(),
                    required: true,
                    default: None,
                    description: None,
                    schema: Value::Object(Map::new()),
                });
            }
        }
        params.sort_by(|a, b| b.required.cmp(&a.required).then_with(|| a.name.cmp(&b.name)));
        params
    }

    /// Validate `arguments`, returning the coerced argument object.
    ///
    /// `null` is treated as no arguments. Unknown keys are passed through.
    /// Missing optional parameters are filled from their `default`.
    pub fn validate(&self, arguments: &Value) -> Result<Map<String, Value>, McpError> {
        let args = match arguments {
            Value::Null => Map::new(),
            Value::Object(map) => map.clone(),
            other => {
                return Err(self.error(format!(
                    "arguments must be an object, got {}",
                    json_type(other)
                )))
            }
        };

        let required = required_names(&self.schema);
        let missing: Vec<&str> = required
            .iter()
            .copied()
            .filter(|name| !args.contains_key(*name))
            .collect();
        if !missing.is_empty() {
            return Err(self.error(format!(
                "missing required parameters: {}",
                missing.join(", ")
            )));
        }

        let props = properties(&self.schema);
        let mut out = Map::new();
        let mut errors = Vec::new();

        for (name, value) in args {
            let Some(prop) = props.and_then(|p| p.get(&name)) else {
                out.insert(name, value);
                continue;
            };
            let optional = !required.contains(&name.as_str());
            if value.is_null() && optional {
                out.insert(name, Value::Null);
                continue;
            }
            match check_value(&name, &value, prop) {
                Ok(coerced) => {
                    out.insert(name, coerced);
                }
                Err(e) => errors.push(e),
            }
        }

        if let Some(props) = props {
            for (name, prop) in props {
                if out.contains_key(name) {
                    continue;
                }
                if let Some(default) = prop.get("default") {
                    out.insert(name.clone(), default.clone());
                }
            }
        }

        if errors.is_empty() {
            Ok(out)
        } else {
            Err(self.error(errors.join("; ")))
        }
    }

    fn error(&self, reason: String) -> McpError {
        McpError::Validation {
            tool: self.tool_name.clone(),
            reason,
        }
    }
}

// ─── Schema Helpers ──────────────────────────────────────────────────────────

fn properties(schema: &Value) -> Option<&Map<String, Value>> {
    schema.get("properties").and_then(Value::as_object)
}

fn required_names(schema: &Value) -> Vec<&str> {
    schema
        .get("required")
        .and_then(Value::as_array)
        .map(|arr| arr.iter().filter_map(Value::as_str).collect())
        .unwrap_or_default()
}

/// Declared types; empty means unconstrained.
fn declared_types(schema: &Value) -> Vec<&str> {
    match schema.get("type") {
        Some(Value::String(t)) => vec![t.as_str()],
        Some(Value::Array(ts)) => ts.iter().filter_map(Value::as_str).collect(),
        _ => Vec::new(),
    }
}

pub(crate) fn type_label(schema: &Value) -> String {
    let types = declared_types(schema);
    if types.is_empty() {
        "any".into()
    } else {
        types.join(" | ")
    }
}

fn json_type(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(n) if n.is_i64() || n.is_u64() => "integer",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Whether `value` already has type `ty` without coercion.
fn matches_natively(value: &Value, ty: &str) -> bool {
    match (ty, value) {
        ("string", Value::String(_))
        | ("boolean", Value::Bool(_))
        | ("array", Value::Array(_))
        | ("object", Value::Object(_))
        | ("null", Value::Null)
        | ("number", Value::Number(_)) => true,
        ("integer", Value::Number(n)) => is_integral(n),
        _ => false,
    }
}

fn is_integral(n: &Number) -> bool {
    n.is_i64() || n.is_u64() || n.as_f64().is_some_and(|f| f.fract() == 0.0 && f.is_finite())
}

// ─── Value Checks ────────────────────────────────────────────────────────────

fn check_value(path: &str, value: &Value, schema: &Value) -> Result<Value, String> {
    let types = declared_types(schema);

    let coerced = if types.is_empty() {
        value.clone()
    } else if let Some(ty) = types.iter().find(|ty| matches_natively(value, ty)) {
        check_type(path, value, ty, schema)?
    } else {
        let mut last_err = None;
        let mut found = None;
        for ty in &types {
            match check_type(path, value, ty, schema) {
                Ok(v) => {
                    found = Some(v);
                    break;
                }
                Err(e) => last_err = Some(e),
            }
        }
        match (found, last_err) {
            (Some(v), _) => v,
            (None, Some(e)) if types.len() == 1 => return Err(e),
            (None, _) => {
                return Err(format!(
                    "{path}: expected one of {}, got {}",
                    types.join(", "),
                    json_type(value)
                ))
            }
        }
    };

    if let Some(allowed) = schema.get("enum").and_then(Value::as_array) {
        if !allowed.contains(&coerced) {
            let options: Vec<String> = allowed.iter().map(Value::to_string).collect();
            return Err(format!("{path}: must be one of [{}]", options.join(", ")));
        }
    }
    Ok(coerced)
}

fn check_type(path: &str, value: &Value, ty: &str, schema: &Value) -> Result<Value, String> {
    match ty {
        "string" => check_string(path, value, schema),
        "integer" => check_integer(path, value, schema),
        "number" => check_number(path, value, schema),
        "boolean" => check_boolean(path, value),
        "array" => check_array(path, value, schema),
        "object" => check_object(path, value, schema),
        "null" if value.is_null() => Ok(Value::Null),
        "null" => Err(format!("{path}: expected null, got {}", json_type(value))),
        // Unknown type keywords are not enforced.
        _ => Ok(value.clone()),
    }
}

fn check_string(path: &str, value: &Value, schema: &Value) -> Result<Value, String> {
    let s = match value {
        Value::String(s) => s.clone(),
        Value::Number(n) => n.to_string(),
        Value::Bool(b) => b.to_string(),
        other => return Err(format!("{path}: expected string, got {}", json_type(other))),
    };

    let len = s.chars().count() as u64;
    if let Some(min) = schema.get("minLength").and_then(Value::as_u64) {
        if len < min {
            return Err(format!("{path}: length {len} is below minLength {min}"));
        }
    }
    if let Some(max) = schema.get("maxLength").and_then(Value::as_u64) {
        if len > max {
            return Err(format!("{path}: length {len} exceeds maxLength {max}"));
        }
    }
    if let Some(pattern) = schema.get("pattern").and_then(Value::as_str) {
        match regex::Regex::new(pattern) {
            Ok(re) if !re.is_match(&s) => {
                return Err(format!("{path}: does not match pattern '{pattern}'"));
            }
            Ok(_) => {}
            Err(e) => {
                tracing::warn!(param = %path, pattern = %pattern, error = %e, "ignoring invalid schema pattern");
            }
        }
    }
    Ok(Value::String(s))
}

fn check_integer(path: &str, value: &Value, schema: &Value) -> Result<Value, String> {
    let n: Number = match value {
        Value::Bool(_) => return Err(format!("{path}: expected integer, got boolean")),
        Value::Number(n) if n.is_i64() || n.is_u64() => n.clone(),
        Value::Number(n) => match n.as_f64() {
            Some(f) if f.fract() == 0.0 && f.abs() < i64::MAX as f64 => Number::from(f as i64),
            _ => return Err(format!("{path}: expected integer, got {n}")),
        },
        Value::String(s) => {
            let trimmed = s.trim();
            trimmed
                .parse::<i64>()
                .map(Number::from)
                .or_else(|_| trimmed.parse::<u64>().map(Number::from))
                .map_err(|_| format!("{path}: expected integer, got string '{s}'"))?
        }
        other => return Err(format!("{path}: expected integer, got {}", json_type(other))),
    };
    check_bounds(path, n.as_f64().unwrap_or(f64::NAN), schema)?;
    Ok(Value::Number(n))
}

fn check_number(path: &str, value: &Value, schema: &Value) -> Result<Value, String> {
    let (f, out) = match value {
        Value::Bool(_) => return Err(format!("{path}: expected number, got boolean")),
        Value::Number(n) => (n.as_f64().unwrap_or_default(), value.clone()),
        Value::String(s) => {
            let f = s
                .trim()
                .parse::<f64>()
                .map_err(|_| format!("{path}: expected number, got string '{s}'"))?;
            let number = Number::from_f64(f)
                .ok_or_else(|| format!("{path}: '{s}' is not a finite number"))?;
            (f, Value::Number(number))
        }
        other => return Err(format!("{path}: expected number, got {}", json_type(other))),
    };
    check_bounds(path, f, schema)?;
    Ok(out)
}

fn check_bounds(path: &str, n: f64, schema: &Value) -> Result<(), String> {
    let bound = |key: &str| schema.get(key).and_then(Value::as_f64);
    if let Some(min) = bound("minimum") {
        if n < min {
            return Err(format!("{path}: {n} is below minimum {min}"));
        }
    }
    if let Some(max) = bound("maximum") {
        if n > max {
            return Err(format!("{path}: {n} exceeds maximum {max}"));
        }
    }
    if let Some(min) = bound("exclusiveMinimum") {
        if n <= min {
            return Err(format!("{path}: {n} must be greater than {min}"));
        }
    }
    if let Some(max) = bound("exclusiveMaximum") {
        if n >= max {
            return Err(format!("{path}: {n} must be less than {max}"));
        }
    }
    Ok(())
}

fn check_boolean(path: &str, value: &Value) -> Result<Value, String> {
    match value {
        Value::Bool(b) => Ok(Value::Bool(*b)),
        Value::String(s) => match s.trim().to_ascii_lowercase().as_str() {
            "true" | "1" | "yes" => Ok(Value::Bool(true)),
            "false" | "0" | "no" => Ok(Value::Bool(false)),
            _ => Err(format!("{path}: expected boolean, got string '{s}'")),
        },
        other => Err(format!("{path}: expected boolean, got {}", json_type(other))),
    }
}

fn check_array(path: &str, value: &Value, schema: &Value) -> Result<Value, String> {
    let Value::Array(items) = value else {
        return Err(format!("{path}: expected array, got {}", json_type(value)));
    };

    let len = items.len() as u64;
    if let Some(min) = schema.get("minItems").and_then(Value::as_u64) {
        if len < min {
            return Err(format!("{path}: has {len} items, minItems is {min}"));
        }
    }
    if let Some(max) = schema.get("maxItems").and_then(Value::as_u64) {
        if len > max {
            return Err(format!("{path}: has {len} items, maxItems is {max}"));
        }
    }

    let Some(item_schema) = schema.get("items").filter(|s| s.is_object()) else {
        return Ok(value.clone());
    };
    items
        .iter()
        .enumerate()
        .map(|(i, item)| check_value(&format!("{path}[{i}]"), item, item_schema))
        .collect::<Result<Vec<_>, _>>()
        .map(Value::Array)
}

fn check_object(path: &str, value: &Value, schema: &Value) -> Result<Value, String> {
    let Value::Object(map) = value else {
        return Err(format!("{path}: expected object, got {}", json_type(value)));
    };

    let missing: Vec<String> = required_names(schema)
        .into_iter()
        .filter(|name| !map.contains_key(*name))
        .map(|name| format!("{path}.{name}"))
        .collect();
    if !missing.is_empty() {
        return Err(format!("missing required properties: {}", missing.join(", ")));
    }

    let props = properties(schema);
    let mut out = Map::new();
    for (key, item) in map {
        let checked = match props.and_then(|p| p.get(key)) {
            Some(prop) => check_value(&format!("{path}.{key}"), item, prop)?,
            None => item.clone(),
        };
        out.insert(key.clone(), checked);
    }
    Ok(Value::Object(out))
}

// ─── Tests ───────────────────────────────────────────────────────────────────
