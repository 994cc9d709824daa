//! Best-effort JSON Schema inference from an example value, and validation
//! of extracted data against the inferred schema.
//!
//! §8's round-trip law requires `infer(example)` to validate `example`
//! itself; the recursive structure below keeps that true by construction
//! (every branch that infers a type also accepts any value of that shape).

use serde_json::Value;

pub fn infer_schema(example: &Value) -> Value {
    match example {
        Value::Object(map) => {
            let properties: serde_json::Map<String, Value> =
                map.iter().map(|(k, v)| (k.clone(), infer_schema(v))).collect();
            serde_json::json!({
                "type": "object",
                "properties": properties,
                "description": "API response",
            })
        }
        Value::Array(items) => {
            if items.is_empty() {
                return serde_json::json!({"type": "array", "items": {"type": "string"}});
            }
            let mut unique: Vec<Value> = Vec::new();
            for item in items {
                let schema = infer_schema(item);
                if !unique.contains(&schema) {
                    unique.push(schema);
                }
            }
            let item_schema = if unique.len() == 1 {
                unique.into_iter().next().unwrap()
            } else {
                serde_json::json!({"anyOf": unique})
            };
            serde_json::json!({"type": "array", "items": item_schema})
        }
        Value::Bool(_) => serde_json::json!({"type": "boolean"}),
        Value::Number(n) if n.is_i64() || n.is_u64() => serde_json::json!({"type": "integer"}),
        Value::Number(_) => serde_json::json!({"type": "number"}),
        Value::String(_) => serde_json::json!({"type": "string"}),
        Value::Null => serde_json::json!({"type": ["string", "null"]}),
    }
}

/// Returns `Err(reason)` on the first mismatch found; intentionally not
/// exhaustive against the full JSON Schema vocabulary, matching the
/// "best-effort" inference this is the counterpart of.
pub fn validate(schema: &Value, value: &Value) -> Result<(), String> {
    let Some(declared_type) = schema.get("type") else {
        return Ok(());
    };

    let matches_type = |t: &str| -> bool {
        match t {
            "object" => value.is_object(),
            "array" => value.is_array(),
            "string" => value.is_string(),
            "integer" => value.is_i64() || value.is_u64(),
            "number" => value.is_number(),
            "boolean" => value.is_boolean(),
            "null" => value.is_null(),
            _ => true,
        }
    };

    let type_ok = match declared_type {
        Value::String(t) => matches_type(t),
        Value::Array(options) => options.iter().filter_map(Value::as_str).any(matches_type),
        _ => true,
    };

    if !type_ok {
        return Err(format!("expected type {declared_type}, got {value}"));
    }

    if let (Value::Object(properties), Value::Object(data)) = (schema.get("properties").unwrap_or(&Value::Null), value) {
        for (key, sub_schema) in properties {
            if let Some(sub_value) = data.get(key) {
                validate(sub_schema, sub_value)?;
            }
        }
    }

    if let (Some(items_schema), Value::Array(items)) = (schema.get("items"), value) {
        for item in items {
            validate(items_schema, item)?;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inferred_schema_validates_its_own_example() {
        let example = serde_json::json!({"sum": 5, "tags": ["a", "b"], "meta": {"ok": true}});
        let schema = infer_schema(&example);
        assert!(validate(&schema, &example).is_ok());
    }

    #[test]
    fn type_mismatch_is_rejected() {
        let schema = infer_schema(&serde_json::json!({"sum": 5}));
        assert!(validate(&schema, &serde_json::json!({"sum": "five"})).is_err());
    }
}
