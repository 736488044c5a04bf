use serde::{Serialize, Serializer};
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;

use super::error::FilterError;
use super::filter_order::FilterOrder;
use super::filter_where::{reject_dollar, Where};
use super::types::{is_primary_key, FilterOrderInfo};

/// A relation to load alongside results, with an optional scoping filter
#[derive(Debug, Clone, PartialEq)]
pub struct Include {
    pub relation: String,
    pub scope: Option<Filter>,
}

impl Include {
    pub fn new(relation: impl Into<String>) -> Self {
        Self { relation: relation.into(), scope: None }
    }

    pub fn to_value(&self) -> Value {
        match &self.scope {
            Some(scope) => json!({ "relation": self.relation, "scope": scope.to_value() }),
            None => json!({ "relation": self.relation }),
        }
    }
}

/// A complete LoopBack-style query: where, projection, order, paging and includes
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Filter {
    pub where_clause: Option<Where>,
    pub fields: BTreeMap<String, bool>,
    pub order: Vec<FilterOrderInfo>,
    pub limit: Option<u64>,
    pub skip: Option<u64>,
    pub include: Vec<Include>,
}

impl Filter {
    /// Parse a JSON filter document. Unknown top-level keys are ignored.
    ///
    /// The projection rule is not checked here; `FilterBuilder::build` does that.
    pub fn parse(value: &Value) -> Result<Self, FilterError> {
        let obj = match value {
            Value::Object(obj) => obj,
            Value::Null => return Ok(Self::default()),
            _ => return Err(FilterError::InvalidFilter("filter must be a JSON object".to_string())),
        };

        let mut filter = Filter::default();
        for (key, value) in obj {
            reject_dollar(key)?;
            match key.as_str() {
                "where" => {
                    let w = Where::parse(value)?;
                    if !w.is_empty() {
                        filter.where_clause = Some(w);
                    }
                }
                "fields" => filter.fields = Self::parse_fields(value)?,
                "order" => filter.order = FilterOrder::validate_and_parse(value)?,
                "limit" => filter.limit = parse_count(value).map_err(FilterError::InvalidLimit)?,
                "skip" | "offset" => filter.skip = parse_count(value).map_err(FilterError::InvalidSkip)?,
                "include" => filter.include = Self::parse_include(value)?,
                other => {
                    tracing::debug!("Ignoring unknown filter key '{}'", other);
                }
            }
        }
        Ok(filter)
    }

    pub fn from_json(input: &str) -> Result<Self, FilterError> {
        let value: Value = serde_json::from_str(input)?;
        Self::parse(&value)
    }

    fn parse_fields(value: &Value) -> Result<BTreeMap<String, bool>, FilterError> {
        let mut fields = BTreeMap::new();
        match value {
            Value::Null => {}
            Value::Object(obj) => {
                for (name, flag) in obj {
                    reject_dollar(name)?;
                    let flag = match flag {
                        Value::Bool(b) => *b,
                        Value::Number(n) if n.as_u64() == Some(1) => true,
                        Value::Number(n) if n.as_u64() == Some(0) => false,
                        other => {
                            return Err(FilterError::InvalidFields(format!(
                                "'{}' must map to a boolean, got {}",
                                name, other
                            )))
                        }
                    };
                    fields.insert(name.clone(), flag);
                }
            }
            Value::Array(names) => {
                for name in names {
                    let name = name.as_str().ok_or_else(|| {
                        FilterError::InvalidFields("field list must contain strings".to_string())
                    })?;
                    reject_dollar(name)?;
                    fields.insert(name.to_string(), true);
                }
            }
            Value::String(name) => {
                reject_dollar(name)?;
                fields.insert(name.clone(), true);
            }
            other => return Err(FilterError::InvalidFields(format!("unsupported fields value {}", other))),
        }
        Ok(fields)
    }

    fn parse_include(value: &Value) -> Result<Vec<Include>, FilterError> {
        match value {
            Value::Null => Ok(vec![]),
            Value::String(s) => Ok(s
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(Include::new)
                .collect()),
            Value::Object(_) => Ok(vec![Self::parse_include_object(value)?]),
            Value::Array(items) => {
                let mut out = Vec::new();
                for item in items {
                    match item {
                        Value::Array(_) => {
                            return Err(FilterError::InvalidInclude("nested include arrays are not allowed".to_string()))
                        }
                        other => out.extend(Self::parse_include(other)?),
                    }
                }
                Ok(out)
            }
            other => Err(FilterError::InvalidInclude(format!("unsupported include value {}", other))),
        }
    }

    fn parse_include_object(value: &Value) -> Result<Include, FilterError> {
        let relation = value
            .get("relation")
            .and_then(Value::as_str)
            .filter(|s| !s.trim().is_empty())
            .ok_or_else(|| FilterError::InvalidInclude("include object requires a 'relation' string".to_string()))?;
        reject_dollar(relation)?;
        let scope = match value.get("scope") {
            None | Some(Value::Null) => None,
            Some(scope) => Some(Filter::parse(scope)?),
        };
        Ok(Include { relation: relation.trim().to_string(), scope })
    }

    /// Check the projection rule: inclusions or exclusions, never both
    pub fn check_projection(&self) -> Result<(), FilterError> {
        let mut included = Vec::new();
        let mut excluded = Vec::new();
        for (name, flag) in &self.fields {
            if is_primary_key(name) {
                continue;
            }
            if *flag {
                included.push(name.clone());
            } else {
                excluded.push(name.clone());
            }
        }
        if !included.is_empty() && !excluded.is_empty() {
            let mut mixed = included;
            mixed.extend(excluded);
            return Err(FilterError::MixedProjection(mixed));
        }
        for include in &self.include {
            if let Some(scope) = &include.scope {
                scope.check_projection()?;
            }
        }
        Ok(())
    }

    /// Render back to the query JSON shape
    pub fn to_value(&self) -> Value {
        let mut map = Map::new();
        if let Some(w) = &self.where_clause {
            map.insert("where".to_string(), w.to_value());
        }
        if !self.fields.is_empty() {
            map.insert("fields".to_string(), json!(self.fields));
        }
        if !self.order.is_empty() {
            map.insert("order".to_string(), FilterOrder::render(&self.order));
        }
        if let Some(limit) = self.limit {
            map.insert("limit".to_string(), json!(limit));
        }
        if let Some(skip) = self.skip {
            map.insert("skip".to_string(), json!(skip));
        }
        if !self.include.is_empty() {
            map.insert(
                "include".to_string(),
                Value::Array(self.include.iter().map(Include::to_value).collect()),
            );
        }
        Value::Object(map)
    }
}

impl Serialize for Filter {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_value().serialize(serializer)
    }
}

/// Non-negative integer, given as a JSON number or a numeric string
fn parse_count(value: &Value) -> Result<Option<u64>, String> {
    match value {
        Value::Null => Ok(None),
        Value::Number(n) => n
            .as_u64()
            .map(Some)
            .ok_or_else(|| format!("must be a non-negative integer, got {}", n)),
        Value::String(s) => s
            .trim()
            .parse::<u64>()
            .map(Some)
            .map_err(|_| format!("must be a non-negative integer, got '{}'", s)),
        other => Err(format!("must be a non-negative integer, got {}", other)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::types::SortDirection;

    #[test]
    fn parses_full_document() {
        let filter = Filter::parse(&json!({
            "where": {"and": [{"priority": {"gte": 1}}, {"status": "active"}]},
            "order": "name ASC",
            "limit": 20,
            "skip": 40,
            "fields": {"name": true, "description": true}
        }))
        .unwrap();

        assert!(filter.where_clause.is_some());
        assert_eq!(filter.order, vec![FilterOrderInfo::new("name", SortDirection::Asc)]);
        assert_eq!(filter.limit, Some(20));
        assert_eq!(filter.skip, Some(40));
        assert_eq!(filter.fields.len(), 2);
    }

    #[test]
    fn ignores_unknown_top_level_keys() {
        let filter = Filter::parse(&json!({"limit": 5, "counts": "posts"})).unwrap();
        assert_eq!(filter.limit, Some(5));
    }

    #[test]
    fn rejects_negative_limit_and_dollar_keys() {
        assert!(matches!(Filter::parse(&json!({"limit": -1})), Err(FilterError::InvalidLimit(_))));
        assert!(matches!(Filter::parse(&json!({"$where": 1})), Err(FilterError::DollarKey(_))));
    }

    #[test]
    fn fields_array_means_inclusion() {
        let filter = Filter::parse(&json!({"fields": ["name", "email"]})).unwrap();
        assert_eq!(filter.fields.get("name"), Some(&true));
        assert_eq!(filter.fields.get("email"), Some(&true));
    }

    #[test]
    fn include_accepts_strings_objects_and_arrays() {
        let filter = Filter::parse(&json!({
            "include": ["owner, tags", {"relation": "comments", "scope": {"limit": 3}}]
        }))
        .unwrap();
        let relations: Vec<_> = filter.include.iter().map(|i| i.relation.as_str()).collect();
        assert_eq!(relations, vec!["owner", "tags", "comments"]);
        assert_eq!(filter.include[2].scope.as_ref().and_then(|s| s.limit), Some(3));

        assert!(Filter::parse(&json!({"include": {"scope": {}}})).is_err());
    }

    #[test]
    fn projection_check_exempts_primary_key() {
        let ok = Filter::parse(&json!({"fields": {"_id": false, "name": true}})).unwrap();
        assert!(ok.check_projection().is_ok());

        let mixed = Filter::parse(&json!({"fields": {"name": true, "password": false}})).unwrap();
        assert!(matches!(mixed.check_projection(), Err(FilterError::MixedProjection(_))));
    }

    #[test]
    fn renders_back_to_parseable_json() {
        let source = json!({
            "where": {"age": {"gt": 18}},
            "order": ["name ASC"],
            "limit": 5,
            "include": [{"relation": "owner"}]
        });
        let filter = Filter::parse(&source).unwrap();
        let again = Filter::parse(&filter.to_value()).unwrap();
        assert_eq!(filter, again);
    }
}
