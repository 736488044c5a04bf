//! Binding raw request bodies into body types.
//!
//! JSON is handed straight to serde. Form values (multipart scalar parts or
//! url-encoded pairs) are strings, so they are first coerced field by field
//! into a JSON object using the declared [`FieldKind`]s.

use axum::body::Bytes;
use serde_json::{Map, Number, Value};
use std::collections::BTreeMap;

use crate::error::{ApiError, FieldErrors};
use crate::schema::{schema_for, BodyModel, FieldKind, TypeSchema};

/// Field name -> raw values in arrival order
pub type FormValues = BTreeMap<String, Vec<String>>;

#[derive(Debug, Clone)]
pub enum BodySource {
    Json(Bytes),
    Form(FormValues),
}

pub fn bind<T: BodyModel>(source: BodySource) -> Result<T, ApiError> {
    match source {
        BodySource::Json(bytes) => bind_json(&bytes),
        BodySource::Form(values) => {
            let schema = schema_for::<T>()?;
            let value = form_to_value(&values, &schema).map_err(|fields| ApiError::invalid_request("Invalid form data", fields))?;
            from_value(value)
        }
    }
}

fn bind_json<T: BodyModel>(bytes: &[u8]) -> Result<T, ApiError> {
    if bytes.iter().all(u8::is_ascii_whitespace) {
        return Err(ApiError::bad_request("Request body is empty"));
    }
    serde_json::from_slice(bytes).map_err(|e| body_error("Invalid JSON body", e))
}

/// Deserialize a processed JSON value back into its body type
pub(crate) fn from_value<T: BodyModel>(value: Value) -> Result<T, ApiError> {
    serde_json::from_value(value).map_err(|e| body_error("Request body does not match the expected shape", e))
}

fn body_error(message: &str, err: serde_json::Error) -> ApiError {
    let mut fields = FieldErrors::new();
    fields.insert("body".to_string(), err.to_string());
    ApiError::invalid_request(message, fields)
}

pub fn parse_urlencoded(bytes: &[u8]) -> FormValues {
    let mut values = FormValues::new();
    for (key, value) in url::form_urlencoded::parse(bytes) {
        values.entry(key.into_owned()).or_default().push(value.into_owned());
    }
    values
}

/// Coerce form strings into a JSON object. Declared fields follow their kind;
/// undeclared ones are passed through as strings (or string arrays when repeated).
pub fn form_to_value(values: &FormValues, schema: &TypeSchema) -> Result<Value, FieldErrors> {
    let mut obj = Map::new();
    let mut errors = FieldErrors::new();

    for (name, raw) in values {
        if raw.is_empty() {
            continue;
        }
        let coerced = match schema.field(name) {
            Some(field) => coerce(&field.kind, raw),
            None if raw.len() == 1 => Ok(Some(Value::String(raw[0].clone()))),
            None => Ok(Some(Value::Array(raw.iter().cloned().map(Value::String).collect()))),
        };
        match coerced {
            Ok(Some(value)) => {
                obj.insert(name.clone(), value);
            }
            Ok(None) => {}
            Err(message) => {
                errors.insert(name.clone(), message);
            }
        }
    }

    if errors.is_empty() {
        Ok(Value::Object(obj))
    } else {
        Err(errors)
    }
}

fn coerce(kind: &FieldKind, raw: &[String]) -> Result<Option<Value>, String> {
    match kind.base() {
        FieldKind::List(element) => {
            // A single JSON array is accepted as well as repeated values
            if raw.len() == 1 && raw[0].trim_start().starts_with('[') {
                return serde_json::from_str(&raw[0])
                    .map(Some)
                    .map_err(|e| format!("must be a JSON array: {}", e));
            }
            let mut items = Vec::with_capacity(raw.len());
            for value in raw {
                if let Some(item) = coerce_one(element, value)? {
                    items.push(item);
                }
            }
            Ok(Some(Value::Array(items)))
        }
        _ => match raw.last() {
            Some(value) => coerce_one(kind, value),
            None => Ok(None),
        },
    }
}

fn coerce_one(kind: &FieldKind, raw: &str) -> Result<Option<Value>, String> {
    match kind.base() {
        FieldKind::String => Ok(Some(Value::String(raw.to_string()))),
        // Empty non-string scalars mean "not given"
        _ if raw.trim().is_empty() => Ok(None),
        FieldKind::Int => raw
            .trim()
            .parse::<i64>()
            .map(|n| Some(Value::from(n)))
            .map_err(|_| "must be a valid integer".to_string()),
        FieldKind::Float => raw
            .trim()
            .parse::<f64>()
            .ok()
            .and_then(Number::from_f64)
            .map(|n| Some(Value::Number(n)))
            .ok_or_else(|| "must be a valid number".to_string()),
        FieldKind::Bool => match raw.trim().to_ascii_lowercase().as_str() {
            "true" | "1" => Ok(Some(Value::Bool(true))),
            "false" | "0" => Ok(Some(Value::Bool(false))),
            _ => Err("must be a boolean (true, false, 1 or 0)".to_string()),
        },
        FieldKind::Json | FieldKind::List(_) | FieldKind::Map(_) | FieldKind::Struct(_) => serde_json::from_str(raw)
            .map(Some)
            .map_err(|e| format!("must be valid JSON: {}", e)),
        FieldKind::Optional(_) => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::FieldRule;
    use serde::{Deserialize, Serialize};
    use serde_json::json;

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct Profile {
        name: String,
        age: Option<i64>,
        active: bool,
        tags: Vec<String>,
        address: Option<Value>,
    }

    impl BodyModel for Profile {
        fn fields() -> Vec<FieldRule> {
            vec![
                FieldRule::string("name"),
                FieldRule::int("age").optional(),
                FieldRule::bool("active"),
                FieldRule::list("tags", FieldKind::String),
                FieldRule::json("address").optional(),
            ]
        }
    }

    fn form(pairs: &[(&str, &str)]) -> FormValues {
        let mut values = FormValues::new();
        for (k, v) in pairs {
            values.entry(k.to_string()).or_default().push(v.to_string());
        }
        values
    }

    #[test]
    fn binds_form_values_by_kind() {
        let values = form(&[
            ("name", "Ada"),
            ("age", "36"),
            ("active", "1"),
            ("tags", "math"),
            ("tags", "engines"),
            ("address", r#"{"city":"London"}"#),
        ]);
        let profile: Profile = bind(BodySource::Form(values)).unwrap();
        assert_eq!(profile.name, "Ada");
        assert_eq!(profile.age, Some(36));
        assert!(profile.active);
        assert_eq!(profile.tags, vec!["math", "engines"]);
        assert_eq!(profile.address, Some(json!({"city": "London"})));
    }

    #[test]
    fn reports_coercion_failures_per_field() {
        let values = form(&[("name", "Ada"), ("age", "old"), ("active", "maybe"), ("tags", "x")]);
        let err = bind::<Profile>(BodySource::Form(values)).unwrap_err();
        assert_eq!(err.error_code(), "INVALID_REQUEST");
        let details = err.details().unwrap();
        assert_eq!(details["age"], "must be a valid integer");
        assert!(details["active"].as_str().unwrap().starts_with("must be a boolean"));
    }

    #[test]
    fn malformed_json_field_is_a_field_error() {
        let values = form(&[("name", "Ada"), ("active", "true"), ("address", "{bad json")]);
        let err = bind::<Profile>(BodySource::Form(values)).unwrap_err();
        assert_eq!(err.status_code(), 400);
        let details = err.details().unwrap();
        assert!(details["address"].as_str().unwrap().starts_with("must be valid JSON"));

        assert!(coerce_one(&FieldKind::Json, "{bad json").is_err());
        assert_eq!(coerce_one(&FieldKind::Json, "42").unwrap(), Some(json!(42)));
    }

    #[test]
    fn binds_json_and_rejects_garbage() {
        let body = Bytes::from_static(br#"{"name":"Ada","active":false,"tags":[]}"#);
        let profile: Profile = bind(BodySource::Json(body)).unwrap();
        assert_eq!(profile.age, None);

        let err = bind::<Profile>(BodySource::Json(Bytes::from_static(b"{bad"))).unwrap_err();
        assert_eq!(err.status_code(), 400);
        assert!(err.details().unwrap().get("body").is_some());
    }

    #[test]
    fn parses_urlencoded_pairs() {
        let values = parse_urlencoded(b"name=Ada+Lovelace&tags=a&tags=b&empty=");
        assert_eq!(values["name"], vec!["Ada Lovelace"]);
        assert_eq!(values["tags"], vec!["a", "b"]);
        assert_eq!(values["empty"], vec![""]);
    }
}
