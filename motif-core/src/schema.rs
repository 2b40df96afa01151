//! Value validators for step input, output and config.
//!
//! A schema checks a `serde_json::Value` and returns the (possibly normalised)
//! value it accepts. `object` schemas drop keys they do not declare, so the
//! value handed to the next step only carries what that step asked for.

use serde_json::{Map, Value};
use std::fmt;
use std::rc::Rc;

type Check = Rc<dyn Fn(&Value) -> Result<Value, String>>;

/// A named validator.
#[derive(Clone)]
pub struct Schema {
    name: String,
    check: Check,
}

impl fmt::Debug for Schema {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Schema").field("name", &self.name).finish()
    }
}

impl Schema {
    /// Creates a schema from a validation function.
    pub fn new<F>(name: impl Into<String>, check: F) -> Self
    where
        F: Fn(&Value) -> Result<Value, String> + 'static,
    {
        Self {
            name: name.into(),
            check: Rc::new(check),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Validates a value, returning the accepted value.
    pub fn parse(&self, value: &Value) -> Result<Value, String> {
        (self.check)(value)
    }

    /// Accepts anything.
    pub fn any() -> Self {
        Self::new("any", |v| Ok(v.clone()))
    }

    pub fn null() -> Self {
        Self::new("null", |v| match v {
            Value::Null => Ok(Value::Null),
            other => Err(mismatch("null", other)),
        })
    }

    pub fn boolean() -> Self {
        Self::new("boolean", |v| match v {
            Value::Bool(_) => Ok(v.clone()),
            other => Err(mismatch("boolean", other)),
        })
    }

    pub fn number() -> Self {
        Self::new("number", |v| match v {
            Value::Number(_) => Ok(v.clone()),
            other => Err(mismatch("number", other)),
        })
    }

    /// Accepts numbers without a fractional part.
    pub fn integer() -> Self {
        Self::new("integer", |v| match v {
            Value::Number(n) if n.is_i64() || n.is_u64() => Ok(v.clone()),
            Value::Number(n) => match n.as_f64() {
                Some(f) if f.fract() == 0.0 => Ok(v.clone()),
                _ => Err(format!("expected integer, received {}", n)),
            },
            other => Err(mismatch("integer", other)),
        })
    }

    pub fn string() -> Self {
        Self::new("string", |v| match v {
            Value::String(_) => Ok(v.clone()),
            other => Err(mismatch("string", other)),
        })
    }

    /// Accepts arrays whose every element passes `items`.
    pub fn array(items: Schema) -> Self {
        let name = format!("array<{}>", items.name);
        Self::new(name, move |v| match v {
            Value::Array(elems) => {
                let mut out = Vec::with_capacity(elems.len());
                for (i, elem) in elems.iter().enumerate() {
                    let parsed = items.parse(elem).map_err(|e| format!("[{}]: {}", i, e))?;
                    out.push(parsed);
                }
                Ok(Value::Array(out))
            }
            other => Err(mismatch("array", other)),
        })
    }

    /// Accepts objects carrying every declared field; undeclared keys are dropped.
    pub fn object<K>(fields: impl IntoIterator<Item = (K, Schema)>) -> Self
    where
        K: Into<String>,
    {
        let fields: Vec<(String, Schema)> =
            fields.into_iter().map(|(k, s)| (k.into(), s)).collect();
        Self::new("object", move |v| match v {
            Value::Object(map) => {
                let mut out = Map::new();
                for (key, schema) in &fields {
                    let field = map.get(key).unwrap_or(&Value::Null);
                    let parsed = schema
                        .parse(field)
                        .map_err(|e| format!("field '{}': {}", key, e))?;
                    // optional fields that are absent stay absent
                    if map.contains_key(key) || !parsed.is_null() {
                        out.insert(key.clone(), parsed);
                    }
                }
                Ok(Value::Object(out))
            }
            other => Err(mismatch("object", other)),
        })
    }

    /// Accepts `null` (or a missing object field) in addition to whatever `inner` accepts.
    pub fn optional(inner: Schema) -> Self {
        let name = format!("optional<{}>", inner.name);
        Self::new(name, move |v| match v {
            Value::Null => Ok(Value::Null),
            other => inner.parse(other),
        })
    }
}

fn mismatch(expected: &str, received: &Value) -> String {
    format!("expected {}, received {}", expected, type_name(received))
}

/// JSON type name of a value, for error messages.
pub fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_primitive_schemas() {
        assert!(Schema::number().parse(&json!(3)).is_ok());
        assert!(Schema::number().parse(&json!("3")).is_err());
        assert!(Schema::string().parse(&json!("x")).is_ok());
        assert!(Schema::boolean().parse(&json!(true)).is_ok());
        assert!(Schema::null().parse(&json!(null)).is_ok());
        assert!(Schema::any().parse(&json!({"a": 1})).is_ok());
    }

    #[test]
    fn test_integer() {
        assert!(Schema::integer().parse(&json!(4)).is_ok());
        assert!(Schema::integer().parse(&json!(4.0)).is_ok());
        assert!(Schema::integer().parse(&json!(4.5)).is_err());
    }

    #[test]
    fn test_mismatch_message() {
        let err = Schema::number().parse(&json!("x")).unwrap_err();
        assert_eq!(err, "expected number, received string");
    }

    #[test]
    fn test_object_strips_unknown_keys() {
        let schema = Schema::object([("name", Schema::string()), ("age", Schema::number())]);
        let parsed = schema
            .parse(&json!({"name": "alice", "age": 20, "extra": true}))
            .unwrap();
        assert_eq!(parsed, json!({"name": "alice", "age": 20}));
    }

    #[test]
    fn test_object_reports_field() {
        let schema = Schema::object([("name", Schema::string())]);
        let err = schema.parse(&json!({"name": 1})).unwrap_err();
        assert_eq!(err, "field 'name': expected string, received number");

        let err = schema.parse(&json!({})).unwrap_err();
        assert_eq!(err, "field 'name': expected string, received null");
    }

    #[test]
    fn test_optional_field() {
        let schema = Schema::object([("nick", Schema::optional(Schema::string()))]);
        assert_eq!(schema.parse(&json!({})).unwrap(), json!({}));
        assert_eq!(
            schema.parse(&json!({"nick": "al"})).unwrap(),
            json!({"nick": "al"})
        );
    }

    #[test]
    fn test_array() {
        let schema = Schema::array(Schema::number());
        assert!(schema.parse(&json!([1, 2, 3])).is_ok());
        let err = schema.parse(&json!([1, "2"])).unwrap_err();
        assert_eq!(err, "[1]: expected number, received string");
    }

    #[test]
    fn test_custom() {
        let even = Schema::new("even", |v| match v.as_i64() {
            Some(n) if n % 2 == 0 => Ok(v.clone()),
            _ => Err("expected an even number".to_string()),
        });
        assert_eq!(even.name(), "even");
        assert!(even.parse(&json!(2)).is_ok());
        assert!(even.parse(&json!(3)).is_err());
    }
}
