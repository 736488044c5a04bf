//! Translation of a [`Filter`] into the document-store query shape.
//!
//! Output documents use MongoDB Extended JSON conventions held in
//! `serde_json` values: `$`-operators, `{"$oid": hex}` and `{"$date": iso}`.

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, TimeZone, Utc};
use serde_json::{json, Map, Value};
use std::collections::HashMap;

use super::error::FilterError;
use super::filter::Filter;
use super::filter_where::{reject_dollar, reject_dollar_deep, Where, WhereValue};
use super::types::{Operator, LIKE_OPTIONS_KEY};
use crate::error::ApiError;

/// Data-type hint for a stored field
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldType {
    String,
    Number,
    Boolean,
    ObjectId,
    Date,
    Array,
    Object,
    Any,
}

/// Flattened description of a collection, as known to the repository layer
#[derive(Debug, Clone)]
pub struct QuerySchema {
    pub fields: HashMap<String, FieldType>,
    /// Always projected when the caller selects an inclusion list
    pub always_included: Vec<String>,
    /// Never projected
    pub banned: Vec<String>,
    pub primary_key: String,
}

impl Default for QuerySchema {
    fn default() -> Self {
        Self {
            fields: HashMap::new(),
            always_included: Vec::new(),
            banned: Vec::new(),
            primary_key: "_id".to_string(),
        }
    }
}

impl QuerySchema {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn field(mut self, name: impl Into<String>, field_type: FieldType) -> Self {
        self.fields.insert(name.into(), field_type);
        self
    }

    pub fn always_include(mut self, name: impl Into<String>) -> Self {
        self.always_included.push(name.into());
        self
    }

    pub fn ban(mut self, name: impl Into<String>) -> Self {
        self.banned.push(name.into());
        self
    }

    fn type_of(&self, field: &str) -> FieldType {
        if field == self.primary_key && !self.fields.contains_key(field) {
            return FieldType::ObjectId;
        }
        self.fields.get(field).copied().unwrap_or(FieldType::Any)
    }
}

/// Query triple handed to the repository: filter document, sort, projection and paging
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DocumentQuery {
    pub filter: Map<String, Value>,
    pub sort: Vec<(String, i32)>,
    pub projection: Option<Map<String, Value>>,
    pub limit: Option<u64>,
    pub skip: Option<u64>,
}

/// Repository boundary: consumes adapted queries
#[async_trait]
pub trait QuerySink: Send + Sync {
    async fn find(&self, query: DocumentQuery) -> Result<Vec<Value>, ApiError>;
}

pub fn to_document_query(filter: &Filter, schema: &QuerySchema) -> Result<DocumentQuery, FilterError> {
    let filter_doc = match &filter.where_clause {
        Some(w) => translate_where(w, schema)?,
        None => Map::new(),
    };

    let mut sort = Vec::with_capacity(filter.order.len());
    for info in &filter.order {
        reject_dollar(&info.field)?;
        sort.push((info.field.clone(), info.sort.to_document()));
    }

    Ok(DocumentQuery {
        filter: filter_doc,
        sort,
        projection: build_projection(filter, schema)?,
        limit: filter.limit,
        skip: filter.skip,
    })
}

fn translate_where(w: &Where, schema: &QuerySchema) -> Result<Map<String, Value>, FilterError> {
    let mut doc = Map::new();
    for (key, value) in w.iter() {
        reject_dollar(key)?;
        match (Operator::parse(key), value) {
            (Some(op), WhereValue::List(children)) if op.is_logical() => {
                let translated = children
                    .iter()
                    .map(|c| translate_where(c, schema).map(Value::Object))
                    .collect::<Result<Vec<_>, _>>()?;
                doc.insert(op.to_document().to_string(), Value::Array(translated));
            }
            (Some(op), _) => {
                return Err(FilterError::InvalidWhereClause(format!(
                    "operator '{}' must be applied to a field",
                    op.as_str()
                )))
            }
            (None, WhereValue::Scalar(v)) => {
                let mut ops = Map::new();
                ops.insert(Operator::Eq.to_document().to_string(), coerce(key, v, schema)?);
                doc.insert(key.clone(), Value::Object(ops));
            }
            (None, WhereValue::Nested(ops)) => {
                doc.insert(key.clone(), Value::Object(translate_field_ops(key, ops, schema)?));
            }
            (None, WhereValue::List(_)) => {
                return Err(FilterError::InvalidWhereClause(format!(
                    "field '{}' cannot hold a list of predicates",
                    key
                )))
            }
        }
    }
    Ok(doc)
}

fn translate_field_ops(field: &str, ops: &Where, schema: &QuerySchema) -> Result<Map<String, Value>, FilterError> {
    let options = match ops.get(LIKE_OPTIONS_KEY) {
        Some(WhereValue::Scalar(Value::String(o))) => Some(o.clone()),
        _ => None,
    };

    let mut out = Map::new();
    for (key, value) in ops.iter() {
        reject_dollar(key)?;
        if key == LIKE_OPTIONS_KEY {
            continue;
        }
        let op = Operator::parse(key).ok_or_else(|| FilterError::UnsupportedOperator(key.clone()))?;
        let data = match value {
            WhereValue::Scalar(v) => v,
            _ => {
                return Err(FilterError::InvalidOperatorData(format!(
                    "{} on '{}' requires a value",
                    key, field
                )))
            }
        };
        reject_dollar_deep(data)?;
        match op {
            Operator::Inq | Operator::Nin => {
                let items = data.as_array().ok_or_else(|| {
                    FilterError::InvalidOperatorData(format!("{} requires an array", key))
                })?;
                let coerced = items
                    .iter()
                    .map(|item| coerce(field, item, schema))
                    .collect::<Result<Vec<_>, _>>()?;
                out.insert(op.to_document().to_string(), Value::Array(coerced));
            }
            Operator::Like => {
                out.insert("$regex".to_string(), data.clone());
                if let Some(o) = &options {
                    out.insert("$options".to_string(), Value::String(o.clone()));
                }
            }
            Operator::Nlike => {
                let mut regex = Map::new();
                regex.insert("$regex".to_string(), data.clone());
                if let Some(o) = &options {
                    regex.insert("$options".to_string(), Value::String(o.clone()));
                }
                out.insert(op.to_document().to_string(), Value::Object(regex));
            }
            Operator::Exists => {
                out.insert(op.to_document().to_string(), data.clone());
            }
            Operator::And | Operator::Or => {
                return Err(FilterError::InvalidWhereClause(format!(
                    "logical operator '{}' cannot be applied to field '{}'",
                    key, field
                )))
            }
            _ => {
                out.insert(op.to_document().to_string(), coerce(field, data, schema)?);
            }
        }
    }
    Ok(out)
}

/// Coerce a predicate value to the field's declared storage type
fn coerce(field: &str, value: &Value, schema: &QuerySchema) -> Result<Value, FilterError> {
    if value.is_null() {
        return Ok(Value::Null);
    }
    match schema.type_of(field) {
        FieldType::ObjectId => coerce_object_id(field, value),
        FieldType::Date => coerce_date(field, value),
        _ => Ok(value.clone()),
    }
}

fn coerce_object_id(field: &str, value: &Value) -> Result<Value, FilterError> {
    match value {
        Value::String(s) if is_object_id(s) => Ok(json!({ "$oid": s.to_ascii_lowercase() })),
        other => Err(FilterError::InvalidValue {
            field: field.to_string(),
            message: format!("expected a 24-character hex ObjectId, got {}", other),
        }),
    }
}

pub fn is_object_id(s: &str) -> bool {
    s.len() == 24 && s.bytes().all(|b| b.is_ascii_hexdigit())
}

// Epoch values at or above this magnitude are read as milliseconds
const EPOCH_MILLIS_THRESHOLD: i64 = 100_000_000_000;

fn coerce_date(field: &str, value: &Value) -> Result<Value, FilterError> {
    let invalid = || FilterError::InvalidValue {
        field: field.to_string(),
        message: format!("expected an RFC3339 date or epoch timestamp, got {}", value),
    };

    let parsed: DateTime<Utc> = match value {
        Value::String(s) => match DateTime::parse_from_rfc3339(s) {
            Ok(dt) => dt.with_timezone(&Utc),
            Err(_) => {
                let epoch = s.trim().parse::<i64>().map_err(|_| invalid())?;
                from_epoch(epoch).ok_or_else(invalid)?
            }
        },
        Value::Number(n) => {
            let epoch = n.as_i64().ok_or_else(invalid)?;
            from_epoch(epoch).ok_or_else(invalid)?
        }
        _ => return Err(invalid()),
    };
    Ok(json!({ "$date": parsed.to_rfc3339_opts(SecondsFormat::Millis, true) }))
}

fn from_epoch(epoch: i64) -> Option<DateTime<Utc>> {
    if epoch.abs() >= EPOCH_MILLIS_THRESHOLD {
        Utc.timestamp_millis_opt(epoch).single()
    } else {
        Utc.timestamp_opt(epoch, 0).single()
    }
}

fn build_projection(filter: &Filter, schema: &QuerySchema) -> Result<Option<Map<String, Value>>, FilterError> {
    filter.check_projection()?;
    for name in filter.fields.keys() {
        reject_dollar(name)?;
    }

    let inclusion = filter
        .fields
        .iter()
        .any(|(name, flag)| *flag && name != &schema.primary_key);

    let mut projection = Map::new();
    if inclusion {
        for (name, flag) in &filter.fields {
            if !schema.banned.contains(name) {
                projection.insert(name.clone(), Value::Bool(*flag));
            }
        }
        for name in &schema.always_included {
            if !schema.banned.contains(name) {
                projection.insert(name.clone(), Value::Bool(true));
            }
        }
        let has_inclusion = projection
            .iter()
            .any(|(name, flag)| flag == &Value::Bool(true) && name != &schema.primary_key);
        if !has_inclusion {
            let mut collapsed = Map::new();
            collapsed.insert(schema.primary_key.clone(), Value::Bool(true));
            return Ok(Some(collapsed));
        }
        return Ok(Some(projection));
    }

    for (name, flag) in &filter.fields {
        if !*flag && !schema.always_included.contains(name) {
            projection.insert(name.clone(), Value::Bool(false));
        }
    }
    for name in &schema.banned {
        projection.insert(name.clone(), Value::Bool(false));
    }
    if projection.is_empty() {
        return Ok(None);
    }
    Ok(Some(projection))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::FilterBuilder;

    fn schema() -> QuerySchema {
        QuerySchema::new()
            .field("ownerId", FieldType::ObjectId)
            .field("createdAt", FieldType::Date)
            .field("name", FieldType::String)
            .always_include("name")
            .ban("password")
    }

    fn filter(v: Value) -> Filter {
        FilterBuilder::from_value(&v).unwrap().build().unwrap()
    }

    #[test]
    fn scalar_fields_become_eq() {
        let q = to_document_query(&filter(json!({"where": {"status": "active"}})), &schema()).unwrap();
        assert_eq!(Value::Object(q.filter), json!({"status": {"$eq": "active"}}));
    }

    #[test]
    fn operators_map_one_to_one() {
        let q = to_document_query(
            &filter(json!({"where": {"or": [
                {"age": {"gte": 18, "lt": 65}},
                {"tags": {"nin": ["spam"]}},
                {"title": {"like": "^re", "options": "i"}},
                {"title": {"nlike": "draft"}},
                {"deletedAt": {"exists": false}}
            ]}})),
            &schema(),
        )
        .unwrap();
        assert_eq!(
            Value::Object(q.filter),
            json!({"$or": [
                {"age": {"$gte": 18, "$lt": 65}},
                {"tags": {"$nin": ["spam"]}},
                {"title": {"$regex": "^re", "$options": "i"}},
                {"title": {"$not": {"$regex": "draft"}}},
                {"deletedAt": {"$exists": false}}
            ]})
        );
    }

    #[test]
    fn object_ids_and_dates_are_coerced() {
        let q = to_document_query(
            &filter(json!({"where": {
                "ownerId": {"inq": ["507f1f77bcf86cd799439011", "507F1F77BCF86CD799439012"]},
                "createdAt": {"gte": 1700000000, "lt": "2024-01-01T00:00:00Z"}
            }})),
            &schema(),
        )
        .unwrap();
        assert_eq!(
            q.filter["ownerId"],
            json!({"$in": [{"$oid": "507f1f77bcf86cd799439011"}, {"$oid": "507f1f77bcf86cd799439012"}]})
        );
        assert_eq!(q.filter["createdAt"]["$gte"], json!({"$date": "2023-11-14T22:13:20.000Z"}));
        assert_eq!(q.filter["createdAt"]["$lt"], json!({"$date": "2024-01-01T00:00:00.000Z"}));

        let millis = to_document_query(&filter(json!({"where": {"createdAt": 1700000000000i64}})), &schema()).unwrap();
        assert_eq!(millis.filter["createdAt"]["$eq"], json!({"$date": "2023-11-14T22:13:20.000Z"}));

        let bad = to_document_query(&filter(json!({"where": {"ownerId": "nope"}})), &schema());
        assert!(matches!(bad, Err(FilterError::InvalidValue { .. })));
    }

    #[test]
    fn projection_adds_always_included_and_drops_banned() {
        let q = to_document_query(&filter(json!({"fields": ["email", "password"]})), &schema()).unwrap();
        assert_eq!(
            q.projection.map(Value::Object),
            Some(json!({"email": true, "name": true}))
        );

        let q = to_document_query(&filter(json!({"fields": {"bio": false}})), &schema()).unwrap();
        assert_eq!(
            q.projection.map(Value::Object),
            Some(json!({"bio": false, "password": false}))
        );
    }

    #[test]
    fn empty_inclusion_collapses_to_primary_key() {
        let schema = QuerySchema::new().ban("password");
        let q = to_document_query(&filter(json!({"fields": ["password"]})), &schema).unwrap();
        assert_eq!(q.projection.map(Value::Object), Some(json!({"_id": true})));
    }

    #[test]
    fn sort_and_paging_pass_through() {
        let q = to_document_query(
            &filter(json!({"order": ["name ASC", "createdAt DESC"], "limit": 5, "skip": 10})),
            &schema(),
        )
        .unwrap();
        assert_eq!(q.sort, vec![("name".to_string(), 1), ("createdAt".to_string(), -1)]);
        assert_eq!((q.limit, q.skip), (Some(5), Some(10)));
    }

    #[test]
    fn dollar_keys_are_rechecked() {
        let mut w = Where::new();
        w.insert("$where", WhereValue::Scalar(json!("sleep(1000)")));
        let f = Filter { where_clause: Some(w), ..Filter::default() };
        assert!(matches!(to_document_query(&f, &schema()), Err(FilterError::DollarKey(_))));
    }
}
