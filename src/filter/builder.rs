//! Fluent builders for [`Where`] and [`Filter`].
//!
//! Builders are fail-lazy: the first error raised by any call is kept and
//! returned from `build()`, so chains never need intermediate `?`.

use serde_json::Value;
use std::collections::BTreeMap;

use super::error::FilterError;
use super::filter::{Filter, Include};
use super::filter_where::{reject_dollar, reject_dollar_deep, Where, WhereValue};
use super::types::{FilterOrderInfo, Operator, SortDirection, LIKE_OPTIONS_KEY};

#[derive(Debug, Clone, Default)]
pub struct WhereBuilder {
    conditions: Vec<Where>,
    strict: bool,
    error: Option<FilterError>,
}

impl WhereBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder whose `eq` always renders `{f: {eq: v}}`
    pub fn strict() -> Self {
        Self { strict: true, ..Self::default() }
    }

    /// Builder honouring the configured equality mode
    pub fn from_config() -> Self {
        Self { strict: crate::config::config().filter.strict_equality, ..Self::default() }
    }

    /// Wrap an already-parsed predicate
    pub fn raw(w: Where) -> Self {
        let mut b = Self::new();
        if !w.is_empty() {
            b.conditions.push(w);
        }
        b
    }

    pub fn from_value(value: &Value) -> Self {
        match Where::parse(value) {
            Ok(w) => Self::raw(w),
            Err(e) => Self::new().fail(e),
        }
    }

    pub fn from_json(input: &str) -> Self {
        match serde_json::from_str::<Value>(input) {
            Ok(value) => Self::from_value(&value),
            Err(e) => Self::new().fail(e.into()),
        }
    }

    pub fn is_strict(&self) -> bool {
        self.strict
    }

    pub fn is_empty(&self) -> bool {
        self.conditions.is_empty()
    }

    pub fn error(&self) -> Option<&FilterError> {
        self.error.as_ref()
    }

    fn fail(mut self, err: FilterError) -> Self {
        if self.error.is_none() {
            self.error = Some(err);
        }
        self
    }

    fn push(mut self, w: Where) -> Self {
        self.conditions.push(w);
        self
    }

    fn check_field(field: &str) -> Result<(), FilterError> {
        if field.trim().is_empty() {
            return Err(FilterError::InvalidField("field name cannot be empty".to_string()));
        }
        reject_dollar(field)?;
        if Operator::parse(field).is_some() {
            return Err(FilterError::InvalidField(format!("'{}' is a reserved operator", field)));
        }
        Ok(())
    }

    fn op(self, field: &str, op: Operator, value: Value) -> Self {
        self.op_with(field, vec![(op.as_str(), value)])
    }

    fn op_with(self, field: &str, ops: Vec<(&str, Value)>) -> Self {
        if let Err(e) = Self::check_field(field) {
            return self.fail(e);
        }
        let mut nested = Where::new();
        for (key, value) in ops {
            if let Err(e) = reject_dollar_deep(&value) {
                return self.fail(e);
            }
            nested.insert(key, WhereValue::Scalar(value));
        }
        self.push(Where::single(field, WhereValue::Nested(nested)))
    }

    pub fn eq(self, field: &str, value: impl Into<Value>) -> Self {
        let value = value.into();
        if self.strict {
            return self.op(field, Operator::Eq, value);
        }
        if let Err(e) = Self::check_field(field).and_then(|_| reject_dollar_deep(&value)) {
            return self.fail(e);
        }
        self.push(Where::single(field, WhereValue::Scalar(value)))
    }

    pub fn neq(self, field: &str, value: impl Into<Value>) -> Self {
        self.op(field, Operator::Neq, value.into())
    }

    pub fn gt(self, field: &str, value: impl Into<Value>) -> Self {
        self.op(field, Operator::Gt, value.into())
    }

    pub fn gte(self, field: &str, value: impl Into<Value>) -> Self {
        self.op(field, Operator::Gte, value.into())
    }

    pub fn lt(self, field: &str, value: impl Into<Value>) -> Self {
        self.op(field, Operator::Lt, value.into())
    }

    pub fn lte(self, field: &str, value: impl Into<Value>) -> Self {
        self.op(field, Operator::Lte, value.into())
    }

    pub fn like(self, field: &str, pattern: impl Into<String>) -> Self {
        self.op(field, Operator::Like, Value::String(pattern.into()))
    }

    pub fn like_with_options(self, field: &str, pattern: impl Into<String>, options: impl Into<String>) -> Self {
        self.op_with(
            field,
            vec![
                (Operator::Like.as_str(), Value::String(pattern.into())),
                (LIKE_OPTIONS_KEY, Value::String(options.into())),
            ],
        )
    }

    pub fn nlike(self, field: &str, pattern: impl Into<String>) -> Self {
        self.op(field, Operator::Nlike, Value::String(pattern.into()))
    }

    pub fn is_null(self, field: &str) -> Self {
        self.eq(field, Value::Null)
    }

    pub fn is_not_null(self, field: &str) -> Self {
        self.op(field, Operator::Neq, Value::Null)
    }

    pub fn exists(self, field: &str, exists: bool) -> Self {
        self.op(field, Operator::Exists, Value::Bool(exists))
    }

    pub fn inq<I, V>(self, field: &str, values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        let values = values.into_iter().map(Into::into).collect();
        self.op(field, Operator::Inq, Value::Array(values))
    }

    pub fn nin<I, V>(self, field: &str, values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        let values = values.into_iter().map(Into::into).collect();
        self.op(field, Operator::Nin, Value::Array(values))
    }

    /// `min <= field <= max`, or strict bounds on both ends when `exclusive`
    pub fn between(self, field: &str, min: impl Into<Value>, max: impl Into<Value>, exclusive: bool) -> Self {
        let (min, max) = (min.into(), max.into());
        if let (Some(lo), Some(hi)) = (min.as_f64(), max.as_f64()) {
            if lo > hi {
                return self.fail(FilterError::InvalidOperatorData(format!(
                    "between on '{}' has min {} greater than max {}",
                    field, min, max
                )));
            }
        }
        let (lower, upper) = if exclusive {
            (Operator::Gt, Operator::Lt)
        } else {
            (Operator::Gte, Operator::Lte)
        };
        let bounds = WhereBuilder::new().op(field, lower, min).op(field, upper, max);
        if let Some(e) = bounds.error {
            return self.fail(e);
        }
        self.push(Where::logical(Operator::And, bounds.conditions))
    }

    /// `{or: [...]}` over the children; empty children are skipped
    pub fn or<I>(self, children: I) -> Self
    where
        I: IntoIterator<Item = WhereBuilder>,
    {
        self.logical(Operator::Or, children, false)
    }

    /// `{and: [...]}` over the children, flattening nested conjunctions one level
    pub fn and<I>(self, children: I) -> Self
    where
        I: IntoIterator<Item = WhereBuilder>,
    {
        self.logical(Operator::And, children, true)
    }

    fn logical<I>(mut self, op: Operator, children: I, flatten: bool) -> Self
    where
        I: IntoIterator<Item = WhereBuilder>,
    {
        let mut items = Vec::new();
        for child in children {
            match child.build() {
                Ok(w) if w.is_empty() => {}
                Ok(w) => match w.as_conjunction() {
                    Some(inner) if flatten => items.extend(inner.iter().cloned()),
                    _ => items.push(w),
                },
                Err(e) => {
                    self = self.fail(e);
                }
            }
        }
        if items.is_empty() {
            return self;
        }
        self.push(Where::logical(op, items))
    }

    /// Push an already-parsed predicate, AND-combined with the rest
    pub fn where_raw(self, w: Where) -> Self {
        if w.is_empty() {
            return self;
        }
        self.push(w)
    }

    /// Combine all calls: a single condition as-is, disjoint keys merged into
    /// one object, anything else wrapped in a flattened `and`.
    pub fn build(&self) -> Result<Where, FilterError> {
        if let Some(e) = &self.error {
            return Err(e.clone());
        }
        match self.conditions.len() {
            0 => Ok(Where::new()),
            1 => Ok(self.conditions[0].clone()),
            _ => {
                let mut merged = Where::new();
                let mut disjoint = true;
                for cond in &self.conditions {
                    for (key, value) in cond.iter() {
                        if merged.contains_key(key) {
                            disjoint = false;
                            break;
                        }
                        merged.insert(key.clone(), value.clone());
                    }
                    if !disjoint {
                        break;
                    }
                }
                if disjoint {
                    return Ok(merged);
                }
                let mut items = Vec::new();
                for cond in &self.conditions {
                    match cond.as_conjunction() {
                        Some(inner) => items.extend(inner.iter().cloned()),
                        None => items.push(cond.clone()),
                    }
                }
                Ok(Where::logical(Operator::And, items))
            }
        }
    }

    pub fn reset(&mut self) {
        self.conditions.clear();
        self.error = None;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WhereOperator {
    #[default]
    And,
    Or,
}

/// How `FilterBuilder::merge_with` combines two filters
#[derive(Debug, Clone, Default)]
pub struct MergeConfig {
    pub where_operator: WhereOperator,
    pub allow_field_conflicts: bool,
    pub max_limit: Option<u64>,
}

#[derive(Debug, Clone)]
struct IncludeSpec {
    relation: String,
    scope: Option<FilterBuilder>,
}

#[derive(Debug, Clone, Default)]
pub struct FilterBuilder {
    where_clause: Option<WhereBuilder>,
    fields: BTreeMap<String, bool>,
    order: Vec<FilterOrderInfo>,
    limit: Option<u64>,
    skip: Option<u64>,
    include: Vec<IncludeSpec>,
    error: Option<FilterError>,
}

impl FilterBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_filter(filter: Filter) -> Self {
        Self {
            where_clause: filter.where_clause.map(WhereBuilder::raw),
            fields: filter.fields,
            order: filter.order,
            limit: filter.limit,
            skip: filter.skip,
            include: filter
                .include
                .into_iter()
                .map(|inc| IncludeSpec {
                    relation: inc.relation,
                    scope: inc.scope.map(FilterBuilder::from_filter),
                })
                .collect(),
            error: None,
        }
    }

    pub fn from_value(value: &Value) -> Result<Self, FilterError> {
        Filter::parse(value).map(Self::from_filter)
    }

    pub fn from_json(input: &str) -> Result<Self, FilterError> {
        Filter::from_json(input).map(Self::from_filter)
    }

    fn fail(mut self, err: FilterError) -> Self {
        if self.error.is_none() {
            self.error = Some(err);
        }
        self
    }

    pub fn error(&self) -> Option<&FilterError> {
        self.error.as_ref()
    }

    pub fn with_where(mut self, w: WhereBuilder) -> Self {
        self.where_clause = Some(w);
        self
    }

    pub fn where_builder(&self) -> Option<&WhereBuilder> {
        self.where_clause.as_ref()
    }

    pub fn field(mut self, name: &str, include: bool) -> Self {
        if let Err(e) = reject_dollar(name) {
            return self.fail(e);
        }
        self.fields.insert(name.to_string(), include);
        self
    }

    /// Include the named fields in the projection
    pub fn fields<'a, I>(self, names: I) -> Self
    where
        I: IntoIterator<Item = &'a str>,
    {
        names.into_iter().fold(self, |b, name| b.field(name, true))
    }

    /// Exclude the named fields from the projection
    pub fn exclude_fields<'a, I>(self, names: I) -> Self
    where
        I: IntoIterator<Item = &'a str>,
    {
        names.into_iter().fold(self, |b, name| b.field(name, false))
    }

    pub fn order_by_asc(self, field: &str) -> Self {
        self.order_by(field, SortDirection::Asc)
    }

    pub fn order_by_desc(self, field: &str) -> Self {
        self.order_by(field, SortDirection::Desc)
    }

    fn order_by(mut self, field: &str, sort: SortDirection) -> Self {
        if field.trim().is_empty() {
            return self.fail(FilterError::InvalidOrder("order field cannot be empty".to_string()));
        }
        if let Err(e) = reject_dollar(field) {
            return self.fail(e);
        }
        self.order.push(FilterOrderInfo::new(field, sort));
        self
    }

    pub fn limit(mut self, limit: u64) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn skip(mut self, skip: u64) -> Self {
        self.skip = Some(skip);
        self
    }

    /// 1-based page of `size` items: `skip((page-1)*size).limit(size)`
    pub fn page(self, page: u64, size: u64) -> Self {
        if page == 0 {
            return self.fail(FilterError::InvalidSkip("page numbers start at 1".to_string()));
        }
        self.skip((page - 1).saturating_mul(size)).limit(size)
    }

    pub fn include(self, relation: &str) -> Self {
        self.push_include(relation, None)
    }

    pub fn include_with_scope(self, relation: &str, scope: FilterBuilder) -> Self {
        self.push_include(relation, Some(scope))
    }

    fn push_include(mut self, relation: &str, scope: Option<FilterBuilder>) -> Self {
        if relation.trim().is_empty() {
            return self.fail(FilterError::InvalidInclude("relation cannot be empty".to_string()));
        }
        self.include.push(IncludeSpec { relation: relation.trim().to_string(), scope });
        self
    }

    pub fn limit_value(&self) -> Option<u64> {
        self.limit
    }

    pub fn skip_value(&self) -> Option<u64> {
        self.skip
    }

    pub fn build(&self) -> Result<Filter, FilterError> {
        if let Some(e) = &self.error {
            return Err(e.clone());
        }
        let where_clause = match &self.where_clause {
            Some(b) => Some(b.build()?).filter(|w| !w.is_empty()),
            None => None,
        };
        let include = self
            .include
            .iter()
            .map(|spec| {
                Ok(Include {
                    relation: spec.relation.clone(),
                    scope: spec.scope.as_ref().map(FilterBuilder::build).transpose()?,
                })
            })
            .collect::<Result<Vec<_>, FilterError>>()?;

        let filter = Filter {
            where_clause,
            fields: self.fields.clone(),
            order: self.order.clone(),
            limit: self.limit,
            skip: self.skip,
            include,
        };
        filter.check_projection()?;
        Ok(filter)
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }

    /// Combine with `other` into a new builder; `other` wins on limit, skip and order
    pub fn merge_with(&self, other: &FilterBuilder, config: Option<&MergeConfig>) -> FilterBuilder {
        let default_config = MergeConfig::default();
        let config = config.unwrap_or(&default_config);
        let mut merged = self.clone();
        if let Some(e) = &other.error {
            merged = merged.fail(e.clone());
        }

        merged.where_clause = match (&self.where_clause, &other.where_clause) {
            (Some(a), Some(b)) => {
                let children = [a.clone(), b.clone()];
                Some(match config.where_operator {
                    WhereOperator::And => WhereBuilder::new().and(children),
                    WhereOperator::Or => WhereBuilder::new().or(children),
                })
            }
            (Some(a), None) => Some(a.clone()),
            (None, Some(b)) => Some(b.clone()),
            (None, None) => None,
        };

        for (name, flag) in &other.fields {
            match merged.fields.get(name) {
                Some(existing) if existing != flag && !config.allow_field_conflicts => {
                    merged = merged.fail(FilterError::FieldConflict(name.clone()));
                }
                _ => {
                    merged.fields.insert(name.clone(), *flag);
                }
            }
        }

        merged.limit = other.limit.or(self.limit);
        if let (Some(limit), Some(max)) = (merged.limit, config.max_limit) {
            merged.limit = Some(limit.min(max));
        }
        merged.skip = other.skip.or(self.skip);
        if !other.order.is_empty() {
            merged.order = other.order.clone();
        }
        merged.include.extend(other.include.iter().cloned());
        merged
    }
}
