//! Tag-driven field validation and its message phrasebook.
//!
//! A `validate` tag is a comma list of rules, each `name` or `name=param`.
//! Rules after `dive` apply to the elements of a list or the values of a map.

use serde_json::Value;
use validator::{ValidateEmail, ValidateUrl, ValidationErrors, ValidationErrorsKind};

use crate::error::{ApiError, FieldErrors};
use crate::schema::{FieldKind, SchemaError, TypeSchema};

const KNOWN_RULES: &[(&str, bool)] = &[
    // (name, takes a parameter)
    ("required", false),
    ("omitempty", false),
    ("min", true),
    ("max", true),
    ("len", true),
    ("eq", true),
    ("ne", true),
    ("gt", true),
    ("gte", true),
    ("lt", true),
    ("lte", true),
    ("oneof", true),
    ("email", false),
    ("url", false),
    ("uuid", false),
    ("alpha", false),
    ("alphanum", false),
    ("numeric", false),
    ("lowercase", false),
    ("uppercase", false),
    ("contains", true),
    ("excludes", true),
    ("startswith", true),
    ("endswith", true),
];

#[derive(Debug, Clone, PartialEq)]
pub struct Rule {
    pub name: String,
    pub param: Option<String>,
}

impl Rule {
    fn number(&self) -> f64 {
        self.param.as_deref().and_then(|p| p.parse().ok()).unwrap_or(0.0)
    }

    fn text(&self) -> &str {
        self.param.as_deref().unwrap_or("")
    }
}

/// Parsed `validate` tag
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RuleSet {
    pub rules: Vec<Rule>,
    /// Rules for collection elements, after a `dive` token
    pub dive: Option<Box<RuleSet>>,
}

impl RuleSet {
    pub fn parse(tag: &str) -> Result<Self, String> {
        let tokens: Vec<&str> = tag.split(',').map(str::trim).filter(|t| !t.is_empty()).collect();
        Self::parse_tokens(&tokens)
    }

    fn parse_tokens(tokens: &[&str]) -> Result<Self, String> {
        let mut set = RuleSet::default();
        for (i, token) in tokens.iter().enumerate() {
            if *token == "dive" {
                set.dive = Some(Box::new(Self::parse_tokens(&tokens[i + 1..])?));
                break;
            }

            let (name, param) = match token.split_once('=') {
                Some((name, param)) => (name.trim(), Some(param.trim().to_string())),
                None => (*token, None),
            };
            let takes_param = KNOWN_RULES
                .iter()
                .find(|(known, _)| *known == name)
                .map(|(_, takes)| *takes)
                .ok_or_else(|| format!("unknown rule '{}'", name))?;

            match (&param, takes_param) {
                (None, true) => return Err(format!("rule '{}' requires a parameter", name)),
                (Some(_), false) => return Err(format!("rule '{}' takes no parameter", name)),
                (Some(p), true) if is_numeric_rule(name) && p.parse::<f64>().is_err() => {
                    return Err(format!("rule '{}' needs a numeric parameter, got '{}'", name, p))
                }
                _ => {}
            }

            set.rules.push(Rule {
                name: name.to_string(),
                param,
            });
        }
        Ok(set)
    }

    fn has(&self, name: &str) -> bool {
        self.rules.iter().any(|r| r.name == name)
    }
}

fn is_numeric_rule(name: &str) -> bool {
    matches!(name, "min" | "max" | "len" | "gt" | "gte" | "lt" | "lte")
}

/// Validate a serialized body against its compiled schema, collecting one
/// message per failing field
pub fn validate_object(value: &Value, schema: &TypeSchema, path: &str, errors: &mut FieldErrors) -> Result<(), SchemaError> {
    let empty = serde_json::Map::new();
    let obj = value.as_object().unwrap_or(&empty);

    for field in &schema.fields {
        let field_path = join(path, field.name);
        let field_value = obj.get(field.name).unwrap_or(&Value::Null);

        if let Some(rules) = &field.validate {
            if let Some(message) = check_rules(field_value, &field.kind, rules) {
                errors.insert(field_path, message);
                continue;
            }
            if let Some(dive) = &rules.dive {
                validate_elements(field_value, &field.kind, dive, &field_path, errors)?;
            }
        }

        // Nested structs are validated with their own schema
        if let (FieldKind::Struct(nested), Value::Object(_)) = (field.kind.base(), field_value) {
            let nested = nested.resolve()?;
            if nested.has_validate_tags {
                validate_object(field_value, &nested, &field_path, errors)?;
            }
        }
    }
    Ok(())
}

fn validate_elements(
    value: &Value,
    kind: &FieldKind,
    rules: &RuleSet,
    path: &str,
    errors: &mut FieldErrors,
) -> Result<(), SchemaError> {
    let Some(element_kind) = kind.element() else {
        return Ok(());
    };

    let entries: Vec<(String, &Value)> = match value {
        Value::Array(items) => items.iter().enumerate().map(|(i, v)| (format!("{}[{}]", path, i), v)).collect(),
        Value::Object(map) => map.iter().map(|(k, v)| (join(path, k), v)).collect(),
        _ => return Ok(()),
    };

    for (element_path, element) in entries {
        if let Some(message) = check_rules(element, element_kind, rules) {
            errors.insert(element_path, message);
            continue;
        }
        if let Some(dive) = &rules.dive {
            validate_elements(element, element_kind, dive, &element_path, errors)?;
        }
        if let (FieldKind::Struct(nested), Value::Object(_)) = (element_kind.base(), element) {
            let nested = nested.resolve()?;
            if nested.has_validate_tags {
                validate_object(element, &nested, &element_path, errors)?;
            }
        }
    }
    Ok(())
}

fn join(path: &str, name: &str) -> String {
    if path.is_empty() {
        name.to_string()
    } else {
        format!("{}.{}", path, name)
    }
}

fn is_empty(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(s) => s.is_empty(),
        Value::Array(items) => items.is_empty(),
        Value::Object(map) => map.is_empty(),
        _ => false,
    }
}

/// First failing rule's message, if any
fn check_rules(value: &Value, kind: &FieldKind, rules: &RuleSet) -> Option<String> {
    if rules.has("required") && is_empty(value) {
        return Some(phrase("required", kind, None));
    }
    // Absent optional values and explicitly omitted empties skip the rest
    if value.is_null() || (rules.has("omitempty") && is_empty(value)) {
        return None;
    }

    rules
        .rules
        .iter()
        .filter(|r| r.name != "required" && r.name != "omitempty")
        .find(|r| !passes(r, value))
        .map(|r| phrase(&r.name, kind, r.param.as_deref()))
}

/// Magnitude compared by size rules: length for strings and collections, the value for numbers
fn measure(value: &Value) -> Option<f64> {
    match value {
        Value::String(s) => Some(s.chars().count() as f64),
        Value::Array(items) => Some(items.len() as f64),
        Value::Object(map) => Some(map.len() as f64),
        Value::Number(n) => n.as_f64(),
        _ => None,
    }
}

fn passes(rule: &Rule, value: &Value) -> bool {
    let text = value.as_str();
    match rule.name.as_str() {
        "min" | "gte" => measure(value).map_or(false, |m| m >= rule.number()),
        "max" | "lte" => measure(value).map_or(false, |m| m <= rule.number()),
        "gt" => measure(value).map_or(false, |m| m > rule.number()),
        "lt" => measure(value).map_or(false, |m| m < rule.number()),
        "len" => measure(value).map_or(false, |m| m == rule.number()),
        "eq" => scalar_text(value).map_or(false, |v| v == rule.text()),
        "ne" => scalar_text(value).map_or(true, |v| v != rule.text()),
        "oneof" => scalar_text(value).map_or(false, |v| rule.text().split_whitespace().any(|opt| opt == v)),
        "email" => text.map_or(false, |s| s.validate_email()),
        "url" => text.map_or(false, |s| s.validate_url()),
        "uuid" => text.map_or(false, |s| uuid::Uuid::parse_str(s).is_ok()),
        "alpha" => text.map_or(false, |s| !s.is_empty() && s.chars().all(char::is_alphabetic)),
        "alphanum" => text.map_or(false, |s| !s.is_empty() && s.chars().all(char::is_alphanumeric)),
        "numeric" => match value {
            Value::Number(_) => true,
            Value::String(s) => s.parse::<f64>().is_ok(),
            _ => false,
        },
        "lowercase" => text.map_or(false, |s| s == s.to_lowercase()),
        "uppercase" => text.map_or(false, |s| s == s.to_uppercase()),
        "contains" => text.map_or(false, |s| s.contains(rule.text())),
        "excludes" => text.map_or(true, |s| !s.contains(rule.text())),
        "startswith" => text.map_or(false, |s| s.starts_with(rule.text())),
        "endswith" => text.map_or(false, |s| s.ends_with(rule.text())),
        _ => true,
    }
}

fn scalar_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

/// Friendly message for a failed rule
pub fn phrase(rule: &str, kind: &FieldKind, param: Option<&str>) -> String {
    let p = param.unwrap_or("");
    let numeric = kind.is_numeric();
    let unit = if kind.is_collection() { "items" } else { "characters" };

    match rule {
        "required" => "This field is required".to_string(),
        "min" if numeric => format!("must be greater than {}", p),
        "min" => format!("must have a minimum length of {}", p),
        "max" if numeric => format!("must be less than {}", p),
        "max" => format!("must have a maximum length of {}", p),
        "len" if numeric => format!("must be equal to {}", p),
        "len" => format!("must be exactly {} {} long", p, unit),
        "gte" if numeric => format!("must be greater than or equal to {}", p),
        "gte" => format!("must have at least {} {}", p, unit),
        "lte" if numeric => format!("must be less than or equal to {}", p),
        "lte" => format!("must have at most {} {}", p, unit),
        "gt" if numeric => format!("must be greater than {}", p),
        "gt" => format!("must have more than {} {}", p, unit),
        "lt" if numeric => format!("must be less than {}", p),
        "lt" => format!("must have fewer than {} {}", p, unit),
        "eq" => format!("must be equal to {}", p),
        "ne" => format!("must not be equal to {}", p),
        "oneof" => format!("must be one of: {}", p.split_whitespace().collect::<Vec<_>>().join(", ")),
        "email" => "must be a valid email".to_string(),
        "url" => "must be a valid URL".to_string(),
        "uuid" => "must be a valid UUID".to_string(),
        "alpha" => "must contain only letters".to_string(),
        "alphanum" => "must contain only letters and numbers".to_string(),
        "numeric" => "must be a valid number".to_string(),
        "lowercase" => "must be lowercase".to_string(),
        "uppercase" => "must be uppercase".to_string(),
        "contains" => format!("must contain '{}'", p),
        "excludes" => format!("must not contain '{}'", p),
        "startswith" => format!("must start with '{}'", p),
        "endswith" => format!("must end with '{}'", p),
        other => format!("failed on the '{}' validation", other),
    }
}

/// Translate `validator` crate errors into the field-keyed `INVALID_REQUEST` shape,
/// for bodies that validate themselves with `#[derive(Validate)]`
pub fn from_validation_errors(errors: &ValidationErrors) -> ApiError {
    let mut fields = FieldErrors::new();
    collect_validation_errors(errors, "", &mut fields);
    ApiError::invalid_request("Validation failed", fields)
}

fn collect_validation_errors(errors: &ValidationErrors, path: &str, out: &mut FieldErrors) {
    for (field, kind) in errors.errors() {
        let field_path = join(path, &field.to_string());
        match kind {
            ValidationErrorsKind::Field(list) => {
                if let Some(first) = list.first() {
                    let message = match &first.message {
                        Some(message) => message.to_string(),
                        None => validator_phrase(&first.code, &first.params),
                    };
                    out.insert(field_path, message);
                }
            }
            ValidationErrorsKind::Struct(nested) => collect_validation_errors(nested, &field_path, out),
            ValidationErrorsKind::List(items) => {
                for (index, nested) in items {
                    collect_validation_errors(nested, &format!("{}[{}]", field_path, index), out);
                }
            }
        }
    }
}

fn validator_phrase(code: &str, params: &std::collections::HashMap<std::borrow::Cow<'static, str>, Value>) -> String {
    let param = |name: &str| params.get(name).map(|v| v.to_string());
    match code {
        "length" => match (param("min"), param("max"), param("equal")) {
            (_, _, Some(eq)) => format!("must be exactly {} characters long", eq),
            (Some(min), None, _) => format!("must have a minimum length of {}", min),
            (None, Some(max), _) => format!("must have a maximum length of {}", max),
            (Some(min), Some(max), _) => format!("must be between {} and {} characters long", min, max),
            (None, None, None) => "has an invalid length".to_string(),
        },
        "range" => match (param("min"), param("max")) {
            (Some(min), Some(max)) => format!("must be between {} and {}", min, max),
            (Some(min), None) => format!("must be greater than or equal to {}", min),
            (None, Some(max)) => format!("must be less than or equal to {}", max),
            (None, None) => "is out of range".to_string(),
        },
        "email" => "must be a valid email".to_string(),
        "url" => "must be a valid URL".to_string(),
        "required" => "This field is required".to_string(),
        other => format!("failed on the '{}' validation", other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::FieldRule;
    use serde_json::json;

    fn schema(rules: Vec<FieldRule>) -> TypeSchema {
        TypeSchema::compile("Test", rules).unwrap()
    }

    fn run(schema: &TypeSchema, value: Value) -> FieldErrors {
        let mut errors = FieldErrors::new();
        validate_object(&value, schema, "", &mut errors).unwrap();
        errors
    }

    #[test]
    fn parses_rules_and_dive() {
        let set = RuleSet::parse("required,min=1,dive,email").unwrap();
        assert_eq!(set.rules.len(), 2);
        assert_eq!(set.dive.as_ref().unwrap().rules[0].name, "email");
        assert!(RuleSet::parse("shiny").is_err());
        assert!(RuleSet::parse("min").is_err());
        assert!(RuleSet::parse("min=abc").is_err());
        assert!(RuleSet::parse("email=1").is_err());
    }

    #[test]
    fn strings_and_numbers_use_different_phrases() {
        let s = schema(vec![
            FieldRule::string("name").validate("required,min=2"),
            FieldRule::int("age").validate("gte=0,lte=150"),
            FieldRule::int("score").validate("min=10"),
        ]);
        let errors = run(&s, json!({"name": "j", "age": 200, "score": 3}));
        assert_eq!(errors["name"], "must have a minimum length of 2");
        assert_eq!(errors["age"], "must be less than or equal to 150");
        assert_eq!(errors["score"], "must be greater than 10");
    }

    #[test]
    fn required_and_optional_fields() {
        let s = schema(vec![
            FieldRule::string("email").validate("required,email"),
            FieldRule::string("website").optional().validate("url"),
        ]);
        let errors = run(&s, json!({}));
        assert_eq!(errors["email"], "This field is required");
        assert!(!errors.contains_key("website"));

        let errors = run(&s, json!({"email": "nope", "website": "not a url"}));
        assert_eq!(errors["email"], "must be a valid email");
        assert_eq!(errors["website"], "must be a valid URL");

        assert!(run(&s, json!({"email": "a@b.co"})).is_empty());
    }

    #[test]
    fn dive_checks_each_element() {
        let s = schema(vec![FieldRule::list("emails", FieldKind::String).validate("min=1,dive,email")]);
        let errors = run(&s, json!({"emails": ["a@b.co", "bad"]}));
        assert_eq!(errors.len(), 1);
        assert_eq!(errors["emails[1]"], "must be a valid email");

        let errors = run(&s, json!({"emails": []}));
        assert_eq!(errors["emails"], "must have a minimum length of 1");
    }

    #[test]
    fn oneof_lists_choices() {
        let s = schema(vec![FieldRule::string("status").validate("oneof=active archived")]);
        let errors = run(&s, json!({"status": "deleted"}));
        assert_eq!(errors["status"], "must be one of: active, archived");
        assert!(run(&s, json!({"status": "active"})).is_empty());
    }

    #[test]
    fn bridges_validator_crate_errors() {
        use validator::Validate;

        #[derive(Validate)]
        struct Login {
            #[validate(email)]
            email: String,
            #[validate(length(min = 8))]
            password: String,
        }

        let errors = Login {
            email: "nope".into(),
            password: "short".into(),
        }
        .validate()
        .unwrap_err();
        let err = from_validation_errors(&errors);
        assert_eq!(err.error_code(), "INVALID_REQUEST");
        let details = err.details().unwrap();
        assert_eq!(details["email"], "must be a valid email");
        assert_eq!(details["password"], "must have a minimum length of 8");
    }
}
