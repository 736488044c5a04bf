use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum FilterError {
    #[error("JSON parsing error: {0}")]
    InvalidJson(String),

    #[error("Invalid filter: {0}")]
    InvalidFilter(String),

    #[error("Invalid WHERE clause: {0}")]
    InvalidWhereClause(String),

    #[error("Unsupported operator: {0}")]
    UnsupportedOperator(String),

    #[error("Invalid operator data: {0}")]
    InvalidOperatorData(String),

    #[error("Keys starting with '$' are not allowed: {0}")]
    DollarKey(String),

    #[error("Invalid field name: {0}")]
    InvalidField(String),

    #[error("Invalid order: {0}")]
    InvalidOrder(String),

    #[error("Invalid fields: {0}")]
    InvalidFields(String),

    #[error("Invalid include: {0}")]
    InvalidInclude(String),

    #[error("Invalid limit: {0}")]
    InvalidLimit(String),

    #[error("Invalid skip: {0}")]
    InvalidSkip(String),

    #[error("Filter fields cannot mix inclusion and exclusion: {0:?}")]
    MixedProjection(Vec<String>),

    #[error("Conflicting projection for field '{0}'")]
    FieldConflict(String),

    #[error("WHERE clause exceeds maximum nesting depth of {0}")]
    TooDeep(usize),

    #[error("Invalid value for field '{field}': {message}")]
    InvalidValue { field: String, message: String },
}

impl From<serde_json::Error> for FilterError {
    fn from(err: serde_json::Error) -> Self {
        FilterError::InvalidJson(err.to_string())
    }
}
