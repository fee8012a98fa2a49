//! Normalizes heterogeneous tool replies into one value.

use serde_json::Value;

use crate::mcp_client::errors::McpError;

/// Result shapes recognized, checked in this order:
///
/// 1. MCP content array: first item's `text` (or `data`)
/// 2. `{"result": ...}`
/// 3. `{"success": bool, "data": ...}` envelope; `success: false` is an error
/// 4. any other object with at least one non-null field, unchanged
/// 5. scalars, arrays and `null`, unchanged
///
/// An object with no usable fields (`{}`, or only `null` values) is malformed.
#[derive(Debug, Clone, Default)]
pub struct ResultProcessor;

impl ResultProcessor {
    pub fn process(&self, tool_name: &str, raw: Value) -> Result<Value, McpError> {
        let Value::Object(mut map) = raw else {
            return Ok(raw);
        };

        if let Some(Value::Array(content)) = map.get("content") {
            let Some(first) = content.first() else {
                return Err(processing(tool_name, "content array is empty"));
            };
            if let Some(text) = first.get("text") {
                return Ok(text.clone());
            }
            if let Some(data) = first.get("data") {
                return Ok(data.clone());
            }
            return Err(processing(tool_name, "first content item has no text or data"));
        }

        if let Some(result) = map.remove("result") {
            return Ok(result);
        }

        if let Some(success) = map.get("success").and_then(Value::as_bool) {
            if !success {
                let reason = map
                    .get("error")
                    .or_else(|| map.get("message"))
                    .map(|v| match v {
                        Value::String(s) => s.clone(),
                        other => other.to_string(),
                    })
                    .unwrap_or_else(|| "tool reported success=false".into());
                return Err(McpError::ToolExecution {
                    tool: tool_name.to_string(),
                    message: reason,
                });
            }
            return Ok(map.remove("data").unwrap_or(Value::Object(map)));
        }

        if map.values().all(Value::is_null) {
            return Err(processing(tool_name, "result object has no usable fields"));
        }
        Ok(Value::Object(map))
    }
}

fn processing(tool: &str, reason: &str) -> McpError {
    McpError::Processing {
        tool: tool.to_string(),
        reason: reason.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn process(raw: Value) -> Result<Value, McpError> {
        ResultProcessor.process("t", raw)
    }

    #[test]
    fn test_content_array_first_text() {
        let raw = json!({"content": [{"type": "text", "text": "hi"}, {"type": "text", "text": "x"}]});
        assert_eq!(process(raw).unwrap(), json!("hi"));
        let raw = json!({"content": [{"type": "resource", "data": {"k": 1}}]});
        assert_eq!(process(raw).unwrap(), json!({"k": 1}));
        assert!(process(json!({"content": []})).is_err());
    }

    #[test]
    fn test_result_field() {
        assert_eq!(process(json!({"result": [1, 2]})).unwrap(), json!([1, 2]));
    }

    #[test]
    fn test_success_envelope() {
        assert_eq!(
            process(json!({"success": true, "data": {"id": 7}})).unwrap(),
            json!({"id": 7})
        );
        let err = process(json!({"success": false, "error": "nope"})).unwrap_err();
        assert!(matches!(err, McpError::ToolExecution { ref message, .. } if message == "nope"));
    }

    #[test]
    fn test_passthrough_and_malformed() {
        assert_eq!(process(json!(42)).unwrap(), json!(42));
        assert_eq!(process(json!("text")).unwrap(), json!("text"));
        assert_eq!(process(json!({"message": "hello"})).unwrap(), json!({"message": "hello"}));
        assert!(matches!(process(json!({})), Err(McpError::Processing { .. })));
        assert!(matches!(process(json!({"x": null})), Err(McpError::Processing { .. })));
    }
}
