use serde::{Serialize, Serializer};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

use super::error::FilterError;
use super::types::{Operator, LIKE_OPTIONS_KEY};

/// A WHERE predicate: field names or operator keywords mapped to values.
///
/// Field entries hold either a scalar (implicit equality) or a nested `Where`
/// of operator -> value pairs. `and`/`or` entries hold a list of predicates.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Where(BTreeMap<String, WhereValue>);

#[derive(Debug, Clone, PartialEq)]
pub enum WhereValue {
    Scalar(Value),
    Nested(Where),
    List(Vec<Where>),
}

impl Where {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn get(&self, key: &str) -> Option<&WhereValue> {
        self.0.get(key)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    pub fn insert(&mut self, key: impl Into<String>, value: WhereValue) -> Option<WhereValue> {
        self.0.insert(key.into(), value)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &WhereValue)> {
        self.0.iter()
    }

    pub fn keys(&self) -> impl Iterator<Item = &String> {
        self.0.keys()
    }

    /// Single-entry predicate `{key: value}`
    pub fn single(key: impl Into<String>, value: WhereValue) -> Self {
        let mut w = Self::new();
        w.insert(key, value);
        w
    }

    /// `{and: [...]}` / `{or: [...]}`
    pub fn logical(op: Operator, children: Vec<Where>) -> Self {
        Self::single(op.as_str(), WhereValue::List(children))
    }

    /// The children of a bare `{and: [...]}` predicate, if that is all this is
    pub fn as_conjunction(&self) -> Option<&[Where]> {
        if self.0.len() != 1 {
            return None;
        }
        match self.0.get(Operator::And.as_str()) {
            Some(WhereValue::List(children)) => Some(children),
            _ => None,
        }
    }

    /// Parse a JSON WHERE document with the configured nesting limit
    pub fn parse(value: &Value) -> Result<Self, FilterError> {
        let max_depth = crate::config::config().filter.max_nested_depth;
        Self::parse_with_depth(value, max_depth)
    }

    pub fn parse_with_depth(value: &Value, max_depth: usize) -> Result<Self, FilterError> {
        WhereParser { max_depth }.parse(value, 0)
    }

    pub fn to_value(&self) -> Value {
        let mut map = Map::new();
        for (key, value) in &self.0 {
            map.insert(key.clone(), value.to_value());
        }
        Value::Object(map)
    }

    /// Rewrite implicit equality `{f: v}` into `{f: {eq: v}}`, recursively
    pub fn normalized(&self) -> Self {
        let mut out = Where::new();
        for (key, value) in &self.0 {
            let value = match value {
                WhereValue::List(children) => {
                    WhereValue::List(children.iter().map(Where::normalized).collect())
                }
                WhereValue::Scalar(v) if Operator::parse(key).is_none() => {
                    WhereValue::Nested(Where::single(Operator::Eq.as_str(), WhereValue::Scalar(v.clone())))
                }
                other => other.clone(),
            };
            out.insert(key.clone(), value);
        }
        out
    }

    /// Equality modulo the `{f: v}` <-> `{f: {eq: v}}` equivalence
    pub fn equivalent(&self, other: &Where) -> bool {
        self.normalized() == other.normalized()
    }
}

impl WhereValue {
    pub fn to_value(&self) -> Value {
        match self {
            WhereValue::Scalar(v) => v.clone(),
            WhereValue::Nested(w) => w.to_value(),
            WhereValue::List(items) => Value::Array(items.iter().map(Where::to_value).collect()),
        }
    }
}

impl Serialize for Where {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_value().serialize(serializer)
    }
}

struct WhereParser {
    max_depth: usize,
}

impl WhereParser {
    fn parse(&self, value: &Value, depth: usize) -> Result<Where, FilterError> {
        if depth > self.max_depth {
            return Err(FilterError::TooDeep(self.max_depth));
        }
        let obj = match value {
            Value::Object(obj) => obj,
            Value::Null => return Ok(Where::new()),
            _ => return Err(FilterError::InvalidWhereClause("WHERE must be an object".to_string())),
        };

        let mut out = Where::new();
        for (key, value) in obj {
            reject_dollar(key)?;
            if key.is_empty() {
                return Err(FilterError::InvalidField("field name cannot be empty".to_string()));
            }
            match Operator::parse(key) {
                Some(op) if op.is_logical() => {
                    let items = value.as_array().ok_or_else(|| {
                        FilterError::InvalidOperatorData(format!("{} requires an array", key))
                    })?;
                    let children = items
                        .iter()
                        .map(|item| match item {
                            Value::Object(_) => self.parse(item, depth + 1),
                            _ => Err(FilterError::InvalidOperatorData(format!(
                                "every {} element must be an object",
                                key
                            ))),
                        })
                        .collect::<Result<Vec<_>, _>>()?;
                    out.insert(key.clone(), WhereValue::List(children));
                }
                Some(op) => {
                    return Err(FilterError::InvalidWhereClause(format!(
                        "operator '{}' must be applied to a field",
                        op.as_str()
                    )))
                }
                None => {
                    out.insert(key.clone(), self.parse_field(key, value)?);
                }
            }
        }
        Ok(out)
    }

    fn parse_field(&self, field: &str, value: &Value) -> Result<WhereValue, FilterError> {
        let obj = match value {
            Value::Object(obj) if has_operator_key(obj) => obj,
            other => {
                reject_dollar_deep(other)?;
                return Ok(WhereValue::Scalar(other.clone()));
            }
        };

        let mut ops = Where::new();
        let mut has_pattern = false;
        for (key, data) in obj {
            reject_dollar(key)?;
            if key == LIKE_OPTIONS_KEY {
                if !data.is_string() {
                    return Err(FilterError::InvalidOperatorData(format!(
                        "{}.options must be a string",
                        field
                    )));
                }
                ops.insert(key.clone(), WhereValue::Scalar(data.clone()));
                continue;
            }
            let op = Operator::parse(key).ok_or_else(|| {
                FilterError::UnsupportedOperator(format!("{} (on field '{}')", key, field))
            })?;
            match op {
                Operator::And | Operator::Or => {
                    return Err(FilterError::InvalidWhereClause(format!(
                        "logical operator '{}' cannot be applied to field '{}'",
                        key, field
                    )))
                }
                Operator::Inq | Operator::Nin => {
                    let items = data.as_array().ok_or_else(|| {
                        FilterError::InvalidOperatorData(format!("{} requires an array", key))
                    })?;
                    for item in items {
                        reject_dollar_deep(item)?;
                    }
                }
                Operator::Like | Operator::Nlike => {
                    has_pattern = true;
                    if !data.is_string() {
                        return Err(FilterError::InvalidOperatorData(format!(
                            "{} requires a string pattern",
                            key
                        )));
                    }
                }
                Operator::Exists => {
                    if !data.is_boolean() {
                        return Err(FilterError::InvalidOperatorData("exists requires a boolean".to_string()));
                    }
                }
                _ => reject_dollar_deep(data)?,
            }
            ops.insert(key.clone(), WhereValue::Scalar(data.clone()));
        }

        if ops.contains_key(LIKE_OPTIONS_KEY) && !has_pattern {
            return Err(FilterError::InvalidOperatorData(format!(
                "{}.options is only valid alongside like/nlike",
                field
            )));
        }
        Ok(WhereValue::Nested(ops))
    }
}

fn has_operator_key(obj: &Map<String, Value>) -> bool {
    obj.keys().any(|k| Operator::parse(k).is_some() || k == LIKE_OPTIONS_KEY)
}

pub(crate) fn reject_dollar(key: &str) -> Result<(), FilterError> {
    if key.starts_with('$') {
        return Err(FilterError::DollarKey(key.to_string()));
    }
    Ok(())
}

/// Scan embedded documents for `$`-prefixed keys
pub(crate) fn reject_dollar_deep(value: &Value) -> Result<(), FilterError> {
    match value {
        Value::Object(obj) => {
            for (key, v) in obj {
                reject_dollar(key)?;
                reject_dollar_deep(v)?;
            }
            Ok(())
        }
        Value::Array(items) => items.iter().try_for_each(reject_dollar_deep),
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn parse(v: Value) -> Result<Where, FilterError> {
        Where::parse_with_depth(&v, 10)
    }

    #[test]
    fn parses_nested_logical_clauses() {
        let w = parse(json!({"and": [{"priority": {"gte": 1}}, {"status": "active"}]})).unwrap();
        match w.get("and") {
            Some(WhereValue::List(children)) => {
                assert_eq!(children.len(), 2);
                assert_eq!(children[1].get("status"), Some(&WhereValue::Scalar(json!("active"))));
            }
            other => panic!("expected list, got {:?}", other),
        }
    }

    #[test]
    fn rejects_dollar_keys_anywhere() {
        assert!(matches!(parse(json!({"$where": "1"})), Err(FilterError::DollarKey(_))));
        assert!(matches!(parse(json!({"age": {"$gt": 1}})), Err(FilterError::DollarKey(_))));
        assert!(matches!(
            parse(json!({"profile": {"nested": {"$ne": 1}}})),
            Err(FilterError::DollarKey(_))
        ));
        assert!(matches!(
            parse(json!({"id": {"inq": [{"$gt": 1}]}})),
            Err(FilterError::DollarKey(_))
        ));
    }

    #[test]
    fn logical_and_membership_operators_require_arrays() {
        assert!(parse(json!({"or": {"a": 1}})).is_err());
        assert!(parse(json!({"or": [1, 2]})).is_err());
        assert!(parse(json!({"id": {"inq": 3}})).is_err());
        assert!(parse(json!({"id": {"nin": [1, 2]}})).is_ok());
    }

    #[test]
    fn like_accepts_options_flag() {
        let w = parse(json!({"name": {"like": "^jo", "options": "i"}})).unwrap();
        let ops = match w.get("name") {
            Some(WhereValue::Nested(ops)) => ops.clone(),
            other => panic!("expected operators, got {:?}", other),
        };
        assert_eq!(ops.get("options"), Some(&WhereValue::Scalar(json!("i"))));
        assert!(parse(json!({"name": {"eq": "x", "options": "i"}})).is_err());
    }

    #[test]
    fn rejects_unknown_operator_mixed_with_known() {
        assert!(matches!(
            parse(json!({"age": {"gt": 1, "gtx": 2}})),
            Err(FilterError::UnsupportedOperator(_))
        ));
        assert!(parse(json!({"gt": 5})).is_err());
    }

    #[test]
    fn embedded_documents_are_scalars() {
        let w = parse(json!({"address": {"city": "Oslo"}})).unwrap();
        assert_eq!(w.get("address"), Some(&WhereValue::Scalar(json!({"city": "Oslo"}))));
    }

    #[test]
    fn depth_limit_is_enforced() {
        let deep = json!({"and": [{"or": [{"and": [{"a": 1}]}]}]});
        assert!(Where::parse_with_depth(&deep, 3).is_ok());
        assert_eq!(Where::parse_with_depth(&deep, 2), Err(FilterError::TooDeep(2)));
    }

    #[test]
    fn render_then_parse_is_equivalent() {
        let source = json!({"or": [{"age": {"gt": 18}}, {"name": "bob"}], "active": true});
        let w = parse(source).unwrap();
        let again = parse(w.to_value()).unwrap();
        assert_eq!(w, again);

        let strict = parse(json!({"name": {"eq": "bob"}})).unwrap();
        let loose = parse(json!({"name": "bob"})).unwrap();
        assert!(strict.equivalent(&loose));
        assert_ne!(strict, loose);
    }
}
