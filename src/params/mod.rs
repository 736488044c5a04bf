//! Declared path, query and header parameters.
//!
//! Every declared [`Param`] is extracted and coerced in declaration order.
//! Failures do not stop the walk: they are collected and reported together as
//! one `PARAM_ERRORS` response.

use axum::http::HeaderMap;
use chrono::{DateTime, FixedOffset, NaiveDate};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::error::ApiError;
use crate::filter::{is_object_id, FilterBuilder, WhereBuilder};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ParamLocation {
    Path,
    Query,
    Header,
}

impl ParamLocation {
    pub fn as_str(&self) -> &'static str {
        match self {
            ParamLocation::Path => "path",
            ParamLocation::Query => "query",
            ParamLocation::Header => "header",
        }
    }
}

impl fmt::Display for ParamLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamType {
    String,
    Int,
    Float,
    Bool,
    /// `YYYY-MM-DD`
    Date,
    /// RFC 3339
    DateTime,
    /// 24 hex characters
    ObjectId,
    /// JSON filter document
    Filter,
    /// JSON where document
    Where,
}

#[derive(Debug, Clone)]
pub enum ParamValue {
    String(String),
    Int(i64),
    Float(f64),
    Bool(bool),
    Date(NaiveDate),
    DateTime(DateTime<FixedOffset>),
    ObjectId(String),
    Filter(FilterBuilder),
    Where(WhereBuilder),
    /// Produced by custom parsers
    Json(Value),
}

impl ParamValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            ParamValue::String(s) | ParamValue::ObjectId(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            ParamValue::Int(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            ParamValue::Float(n) => Some(*n),
            ParamValue::Int(n) => Some(*n as f64),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            ParamValue::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_date(&self) -> Option<NaiveDate> {
        match self {
            ParamValue::Date(d) => Some(*d),
            _ => None,
        }
    }

    pub fn as_datetime(&self) -> Option<&DateTime<FixedOffset>> {
        match self {
            ParamValue::DateTime(d) => Some(d),
            _ => None,
        }
    }

    pub fn as_filter(&self) -> Option<&FilterBuilder> {
        match self {
            ParamValue::Filter(f) => Some(f),
            _ => None,
        }
    }

    pub fn as_where(&self) -> Option<&WhereBuilder> {
        match self {
            ParamValue::Where(w) => Some(w),
            _ => None,
        }
    }

    pub fn as_json(&self) -> Option<&Value> {
        match self {
            ParamValue::Json(v) => Some(v),
            _ => None,
        }
    }
}

pub type ParamParser = Arc<dyn Fn(&str) -> Result<ParamValue, String> + Send + Sync>;

/// One declared parameter
#[derive(Clone)]
pub struct Param {
    pub location: ParamLocation,
    pub name: String,
    pub kind: ParamType,
    pub required: bool,
    pub description: Option<String>,
    parser: Option<ParamParser>,
}

impl Param {
    fn new(location: ParamLocation, name: &str, kind: ParamType) -> Self {
        Self {
            location,
            name: name.to_string(),
            kind,
            required: location == ParamLocation::Path,
            description: None,
            parser: None,
        }
    }

    /// Path params are always required
    pub fn path(name: &str, kind: ParamType) -> Self {
        Self::new(ParamLocation::Path, name, kind)
    }

    pub fn query(name: &str, kind: ParamType) -> Self {
        Self::new(ParamLocation::Query, name, kind)
    }

    pub fn header(name: &str, kind: ParamType) -> Self {
        Self::new(ParamLocation::Header, name, kind)
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    pub fn describe(mut self, description: &str) -> Self {
        self.description = Some(description.to_string());
        self
    }

    /// Replace the default coercion for this param
    pub fn with_parser<F>(mut self, parser: F) -> Self
    where
        F: Fn(&str) -> Result<ParamValue, String> + Send + Sync + 'static,
    {
        self.parser = Some(Arc::new(parser));
        self
    }

    fn coerce(&self, raw: &str) -> Result<ParamValue, String> {
        match &self.parser {
            Some(parser) => parser(raw),
            None => coerce(self.kind, raw),
        }
    }
}

impl fmt::Debug for Param {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Param")
            .field("location", &self.location)
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("required", &self.required)
            .field("custom_parser", &self.parser.is_some())
            .finish()
    }
}

/// Default coercion by declared type
pub fn coerce(kind: ParamType, raw: &str) -> Result<ParamValue, String> {
    match kind {
        ParamType::String => Ok(ParamValue::String(raw.to_string())),
        ParamType::Int => raw
            .trim()
            .parse::<i64>()
            .map(ParamValue::Int)
            .map_err(|_| format!("must be an integer, got '{}'", raw)),
        ParamType::Float => raw
            .trim()
            .parse::<f64>()
            .ok()
            .filter(|n| n.is_finite())
            .map(ParamValue::Float)
            .ok_or_else(|| format!("must be a number, got '{}'", raw)),
        ParamType::Bool => parse_bool(raw)
            .map(ParamValue::Bool)
            .ok_or_else(|| format!("must be a boolean, got '{}'", raw)),
        ParamType::Date => NaiveDate::parse_from_str(raw.trim(), "%Y-%m-%d")
            .map(ParamValue::Date)
            .map_err(|_| format!("must be a date (YYYY-MM-DD), got '{}'", raw)),
        ParamType::DateTime => DateTime::parse_from_rfc3339(raw.trim())
            .map(ParamValue::DateTime)
            .map_err(|_| format!("must be an RFC 3339 datetime, got '{}'", raw)),
        ParamType::ObjectId => {
            let id = raw.trim();
            if is_object_id(id) {
                Ok(ParamValue::ObjectId(id.to_ascii_lowercase()))
            } else {
                Err(format!("must be a 24-character hex id, got '{}'", raw))
            }
        }
        ParamType::Filter => {
            let builder = FilterBuilder::from_json(raw).map_err(|e| format!("invalid filter: {}", e))?;
            // Surface projection conflicts now rather than inside the handler
            builder.build().map_err(|e| format!("invalid filter: {}", e))?;
            Ok(ParamValue::Filter(builder))
        }
        ParamType::Where => {
            let builder = WhereBuilder::from_json(raw);
            if let Some(err) = builder.error() {
                return Err(format!("invalid where: {}", err));
            }
            Ok(ParamValue::Where(builder))
        }
    }
}

/// 1, t, true and 0, f, false in the usual casings
fn parse_bool(raw: &str) -> Option<bool> {
    match raw.trim() {
        "1" | "t" | "T" | "true" | "TRUE" | "True" => Some(true),
        "0" | "f" | "F" | "false" | "FALSE" | "False" => Some(false),
        _ => None,
    }
}

/// Name -> typed value; absent optional params have no entry
pub type ParamMap = HashMap<String, ParamValue>;

#[derive(Debug, Clone, Default)]
pub struct ParsedParams {
    pub path: ParamMap,
    pub query: ParamMap,
    pub header: ParamMap,
}

impl ParsedParams {
    pub fn get(&self, location: ParamLocation, name: &str) -> Option<&ParamValue> {
        match location {
            ParamLocation::Path => self.path.get(name),
            ParamLocation::Query => self.query.get(name),
            ParamLocation::Header => self.header.get(name),
        }
    }

    fn insert(&mut self, location: ParamLocation, name: &str, value: ParamValue) {
        let map = match location {
            ParamLocation::Path => &mut self.path,
            ParamLocation::Query => &mut self.query,
            ParamLocation::Header => &mut self.header,
        };
        map.insert(name.to_string(), value);
    }
}

/// Raw request inputs the params are read from
#[derive(Debug, Clone, Copy)]
pub struct RawParams<'a> {
    pub path: &'a HashMap<String, String>,
    /// Decoded query pairs in order; a bare `?flag` has an empty value
    pub query: &'a [(String, String)],
    pub headers: &'a HeaderMap,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ParamIssue {
    pub location: ParamLocation,
    pub name: String,
    pub message: String,
}

impl ParamIssue {
    pub fn to_value(&self) -> Value {
        json!({
            "location": self.location.as_str(),
            "name": self.name,
            "message": self.message,
        })
    }
}

/// Parse all declared params, returning every failure at once
pub fn parse_params(params: &[Param], raw: RawParams<'_>) -> Result<ParsedParams, ApiError> {
    let mut parsed = ParsedParams::default();
    let mut issues = Vec::new();

    for param in params {
        match parse_one(param, raw) {
            Ok(Some(value)) => parsed.insert(param.location, &param.name, value),
            Ok(None) => {}
            Err(message) => issues.push(ParamIssue {
                location: param.location,
                name: param.name.clone(),
                message,
            }),
        }
    }

    if issues.is_empty() {
        Ok(parsed)
    } else {
        tracing::debug!("Rejected request with {} parameter error(s)", issues.len());
        Err(ApiError::param_errors(issues.iter().map(ParamIssue::to_value).collect()))
    }
}

fn parse_one(param: &Param, raw: RawParams<'_>) -> Result<Option<ParamValue>, String> {
    let value: Option<&str> = match param.location {
        ParamLocation::Path => raw.path.get(&param.name).map(String::as_str),
        ParamLocation::Query => raw
            .query
            .iter()
            .rev()
            .find(|(k, _)| *k == param.name)
            .map(|(_, v)| v.as_str()),
        ParamLocation::Header => match raw.headers.get(param.name.as_str()) {
            Some(v) => Some(v.to_str().map_err(|_| "must contain visible ASCII characters only".to_string())?),
            None => None,
        },
    };

    match value {
        // A bare query flag is truthy
        Some("") if param.location == ParamLocation::Query && param.kind == ParamType::Bool && param.parser.is_none() => {
            Ok(Some(ParamValue::Bool(true)))
        }
        Some(v) if !v.trim().is_empty() => param.coerce(v).map(Some),
        _ if param.required => Err("is required".to_string()),
        _ => Ok(None),
    }
}
