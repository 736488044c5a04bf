use serde_json::Value;

use super::error::FilterError;
use super::filter_where::reject_dollar;
use super::types::{FilterOrderInfo, SortDirection};

pub struct FilterOrder;

impl FilterOrder {
    pub fn validate_and_parse(order: &Value) -> Result<Vec<FilterOrderInfo>, FilterError> {
        match order {
            Value::Null => Ok(vec![]),
            Value::String(s) => Self::parse_order_string(s),
            Value::Array(arr) => {
                // Expect array of strings like ["created_at DESC", "name ASC"]
                let mut out = Vec::new();
                for v in arr {
                    match v {
                        Value::String(s) => out.extend(Self::parse_order_string(s)?),
                        other => {
                            return Err(FilterError::InvalidOrder(format!(
                                "expected \"field ASC|DESC\", got {}",
                                other
                            )))
                        }
                    }
                }
                Ok(out)
            }
            Value::Object(obj) => {
                // { "created_at": "DESC", "name": "ASC" }
                let mut out = Vec::new();
                for (k, v) in obj {
                    reject_dollar(k)?;
                    let dir = v.as_str().ok_or_else(|| {
                        FilterError::InvalidOrder(format!("direction for '{}' must be a string", k))
                    })?;
                    out.push(FilterOrderInfo::new(k.clone(), Self::parse_direction(dir)?));
                }
                Ok(out)
            }
            other => Err(FilterError::InvalidOrder(format!("unsupported order value {}", other))),
        }
    }

    fn parse_order_string(s: &str) -> Result<Vec<FilterOrderInfo>, FilterError> {
        // split on commas, then each token into field and direction
        let mut out = Vec::new();
        for part in s.split(',') {
            let trimmed = part.trim();
            if trimmed.is_empty() {
                continue;
            }
            let mut it = trimmed.split_whitespace();
            if let Some(field) = it.next() {
                reject_dollar(field)?;
                let sort = match it.next() {
                    Some(dir) => Self::parse_direction(dir)?,
                    None => SortDirection::Asc,
                };
                if let Some(extra) = it.next() {
                    return Err(FilterError::InvalidOrder(format!("unexpected token '{}' in '{}'", extra, trimmed)));
                }
                out.push(FilterOrderInfo::new(field, sort));
            }
        }
        Ok(out)
    }

    fn parse_direction(dir: &str) -> Result<SortDirection, FilterError> {
        if dir.eq_ignore_ascii_case("asc") {
            Ok(SortDirection::Asc)
        } else if dir.eq_ignore_ascii_case("desc") {
            Ok(SortDirection::Desc)
        } else {
            Err(FilterError::InvalidOrder(format!("direction must be ASC or DESC, got '{}'", dir)))
        }
    }

    pub fn render(infos: &[FilterOrderInfo]) -> Value {
        Value::Array(infos.iter().map(|i| Value::String(i.render())).collect())
    }
}
