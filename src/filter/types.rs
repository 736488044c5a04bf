use serde::{Deserialize, Serialize};

/// Operator keywords of the query language
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operator {
    Eq,
    Neq,
    Gt,
    Gte,
    Lt,
    Lte,
    Inq,
    Nin,
    And,
    Or,
    Like,
    Nlike,
    Exists,
}

/// Flags companion of `like`/`nlike` inside a field's operator map
pub const LIKE_OPTIONS_KEY: &str = "options";

impl Operator {
    pub const ALL: [Operator; 13] = [
        Operator::Eq,
        Operator::Neq,
        Operator::Gt,
        Operator::Gte,
        Operator::Lt,
        Operator::Lte,
        Operator::Inq,
        Operator::Nin,
        Operator::And,
        Operator::Or,
        Operator::Like,
        Operator::Nlike,
        Operator::Exists,
    ];

    pub fn parse(key: &str) -> Option<Self> {
        Some(match key {
            "eq" => Operator::Eq,
            "neq" => Operator::Neq,
            "gt" => Operator::Gt,
            "gte" => Operator::Gte,
            "lt" => Operator::Lt,
            "lte" => Operator::Lte,
            "inq" => Operator::Inq,
            "nin" => Operator::Nin,
            "and" => Operator::And,
            "or" => Operator::Or,
            "like" => Operator::Like,
            "nlike" => Operator::Nlike,
            "exists" => Operator::Exists,
            _ => return None,
        })
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Operator::Eq => "eq",
            Operator::Neq => "neq",
            Operator::Gt => "gt",
            Operator::Gte => "gte",
            Operator::Lt => "lt",
            Operator::Lte => "lte",
            Operator::Inq => "inq",
            Operator::Nin => "nin",
            Operator::And => "and",
            Operator::Or => "or",
            Operator::Like => "like",
            Operator::Nlike => "nlike",
            Operator::Exists => "exists",
        }
    }

    /// Document-store spelling of the operator
    pub fn to_document(&self) -> &'static str {
        match self {
            Operator::Eq => "$eq",
            Operator::Neq => "$ne",
            Operator::Gt => "$gt",
            Operator::Gte => "$gte",
            Operator::Lt => "$lt",
            Operator::Lte => "$lte",
            Operator::Inq => "$in",
            Operator::Nin => "$nin",
            Operator::And => "$and",
            Operator::Or => "$or",
            Operator::Like => "$regex",
            Operator::Nlike => "$not",
            Operator::Exists => "$exists",
        }
    }

    pub fn is_logical(&self) -> bool {
        matches!(self, Operator::And | Operator::Or)
    }

    pub fn requires_array(&self) -> bool {
        matches!(self, Operator::And | Operator::Or | Operator::Inq | Operator::Nin)
    }

    pub fn is_pattern(&self) -> bool {
        matches!(self, Operator::Like | Operator::Nlike)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SortDirection {
    Asc,
    Desc,
}

impl SortDirection {
    pub fn as_str(&self) -> &'static str {
        match self {
            SortDirection::Asc => "ASC",
            SortDirection::Desc => "DESC",
        }
    }

    pub fn to_document(&self) -> i32 {
        match self {
            SortDirection::Asc => 1,
            SortDirection::Desc => -1,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct FilterOrderInfo {
    pub field: String,
    pub sort: SortDirection,
}

impl FilterOrderInfo {
    pub fn new(field: impl Into<String>, sort: SortDirection) -> Self {
        Self { field: field.into(), sort }
    }

    pub fn render(&self) -> String {
        format!("{} {}", self.field, self.sort.as_str())
    }
}

/// Fields exempt from the inclusion/exclusion projection rule
pub const PRIMARY_KEY_FIELDS: &[&str] = &["_id", "id"];

pub fn is_primary_key(field: &str) -> bool {
    PRIMARY_KEY_FIELDS.contains(&field)
}
