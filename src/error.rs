// HTTP API Error Types
use axum::{http::StatusCode, response::IntoResponse, Json};
use serde_json::{json, Value};
use std::borrow::Cow;
use std::collections::BTreeMap;

/// Stable error codes consumed by clients
pub mod codes {
    pub const INVALID_REQUEST: &str = "INVALID_REQUEST";
    pub const PARAM_ERRORS: &str = "PARAM_ERRORS";
    pub const INVALID_FILTER: &str = "INVALID_FILTER";
    pub const FILTER_CANNOT_MIX_INCLUSION_EXCLUSION: &str = "FILTER_CANNOT_MIX_INCLUSION_EXCLUSION";
    pub const UNSUPPORTED_CONTENT_TYPE: &str = "UNSUPPORTED_CONTENT_TYPE";
    pub const FILE_UPLOAD_NOT_CONFIGURED: &str = "FILE_UPLOAD_NOT_CONFIGURED";
    pub const UNAUTHORIZED: &str = "UNAUTHORIZED";
    pub const FORBIDDEN: &str = "FORBIDDEN";
    pub const NOT_FOUND: &str = "NOT_FOUND";
    pub const CONFLICT: &str = "CONFLICT";
    pub const PAYLOAD_TOO_LARGE: &str = "PAYLOAD_TOO_LARGE";
    pub const UNPROCESSABLE_ENTITY: &str = "UNPROCESSABLE_ENTITY";
    pub const TOO_MANY_REQUESTS: &str = "TOO_MANY_REQUESTS";
    pub const INTERNAL_SERVER_ERROR: &str = "INTERNAL_SERVER_ERROR";
    pub const REQUEST_TIMEOUT: &str = "REQUEST_TIMEOUT";
}

/// Field name -> human-friendly message, as carried in `details`
pub type FieldErrors = BTreeMap<String, String>;

/// HTTP API error: status, stable code, client-safe message, optional details.
///
/// Every failure produced by the request pipeline is one of these; it bubbles up
/// unwrapped and is serialized as `{"statusCode","errorCode","message","details"}`.
#[derive(Debug, Clone)]
pub struct ApiError {
    status: StatusCode,
    code: Cow<'static, str>,
    message: String,
    details: Option<Value>,
}

impl ApiError {
    pub fn new(status: StatusCode, code: impl Into<Cow<'static, str>>, message: impl Into<String>) -> Self {
        Self {
            status,
            code: code.into(),
            message: message.into(),
            details: None,
        }
    }

    pub fn with_details(mut self, details: impl Into<Value>) -> Self {
        self.details = Some(details.into());
        self
    }

    /// Get HTTP status code
    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn status_code(&self) -> u16 {
        self.status.as_u16()
    }

    /// Get error code for client handling
    pub fn error_code(&self) -> &str {
        &self.code
    }

    /// Get client-safe error message
    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn details(&self) -> Option<&Value> {
        self.details.as_ref()
    }

    /// Convert to JSON response body
    pub fn to_json(&self) -> Value {
        let mut body = json!({
            "statusCode": self.status.as_u16(),
            "errorCode": self.code,
            "message": self.message,
        });
        if let Some(details) = &self.details {
            body["details"] = details.clone();
        }
        body
    }
}

// Static constructor methods, one per stable code
impl ApiError {
    // 400 Bad Request
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, codes::INVALID_REQUEST, message)
    }

    pub fn invalid_request(message: impl Into<String>, field_errors: FieldErrors) -> Self {
        Self::bad_request(message).with_details(json!(field_errors))
    }

    pub fn param_errors(entries: Vec<Value>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, codes::PARAM_ERRORS, "Invalid request parameters")
            .with_details(Value::Array(entries))
    }

    pub fn unsupported_content_type(received: &str, accepted: &[&str]) -> Self {
        Self::new(
            StatusCode::BAD_REQUEST,
            codes::UNSUPPORTED_CONTENT_TYPE,
            format!(
                "Unsupported content type '{}'; accepted: {}",
                received,
                accepted.join(", ")
            ),
        )
        .with_details(json!({ "accepted": accepted }))
    }

    pub fn file_upload_not_configured() -> Self {
        Self::new(
            StatusCode::BAD_REQUEST,
            codes::FILE_UPLOAD_NOT_CONFIGURED,
            "File uploads are not accepted by this endpoint",
        )
    }

    // 401 Unauthorized
    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::new(StatusCode::UNAUTHORIZED, codes::UNAUTHORIZED, message)
    }

    // 403 Forbidden
    pub fn forbidden(message: impl Into<String>) -> Self {
        Self::new(StatusCode::FORBIDDEN, codes::FORBIDDEN, message)
    }

    // 404 Not Found
    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, codes::NOT_FOUND, message)
    }

    // 409 Conflict
    pub fn conflict(message: impl Into<String>) -> Self {
        Self::new(StatusCode::CONFLICT, codes::CONFLICT, message)
    }

    // 413 Payload Too Large
    pub fn payload_too_large(message: impl Into<String>) -> Self {
        Self::new(StatusCode::PAYLOAD_TOO_LARGE, codes::PAYLOAD_TOO_LARGE, message)
    }

    // 422 Unprocessable Entity (validation but semantically valid JSON)
    pub fn unprocessable_entity(message: impl Into<String>, field_errors: FieldErrors) -> Self {
        Self::new(StatusCode::UNPROCESSABLE_ENTITY, codes::UNPROCESSABLE_ENTITY, message)
            .with_details(json!(field_errors))
    }

    // 429 Too Many Requests
    pub fn too_many_requests(message: impl Into<String>) -> Self {
        Self::new(StatusCode::TOO_MANY_REQUESTS, codes::TOO_MANY_REQUESTS, message)
    }

    // 500 Internal Server Error
    pub fn internal_server_error(message: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, codes::INTERNAL_SERVER_ERROR, message)
    }

    // 503 Service Unavailable (per-endpoint deadline elapsed)
    pub fn request_timeout(message: impl Into<String>) -> Self {
        Self::new(StatusCode::SERVICE_UNAVAILABLE, codes::REQUEST_TIMEOUT, message)
    }
}

// Convert other error types to ApiError
impl From<crate::filter::FilterError> for ApiError {
    fn from(err: crate::filter::FilterError) -> Self {
        use crate::filter::FilterError;
        match err {
            FilterError::MixedProjection(fields) => ApiError::new(
                StatusCode::BAD_REQUEST,
                codes::FILTER_CANNOT_MIX_INCLUSION_EXCLUSION,
                "Filter fields cannot mix inclusion and exclusion",
            )
            .with_details(json!({ "fields": fields })),
            other => ApiError::new(StatusCode::BAD_REQUEST, codes::INVALID_FILTER, other.to_string()),
        }
    }
}

impl From<crate::schema::SchemaError> for ApiError {
    fn from(err: crate::schema::SchemaError) -> Self {
        // A broken body schema is a programming error, never the client's fault
        tracing::error!("Body schema error: {}", err);
        ApiError::internal_server_error("Request body schema is misconfigured")
    }
}

impl From<crate::upload::UploadError> for ApiError {
    fn from(err: crate::upload::UploadError) -> Self {
        use crate::upload::UploadError;
        match err {
            UploadError::TooLarge { field, limit } => ApiError::payload_too_large(format!(
                "File in field '{}' exceeds the maximum size of {} bytes",
                field, limit
            ))
            .with_details(json!({ "field": field, "limit": limit })),
            UploadError::FormTooLarge { limit } => {
                ApiError::payload_too_large(format!("Form fields exceed the limit of {} bytes", limit))
            }
            UploadError::Io(e) => {
                tracing::error!("Upload I/O error: {}", e);
                ApiError::internal_server_error("Failed to store uploaded file")
            }
            UploadError::NotConfigured => ApiError::file_upload_not_configured(),
            other => {
                let message = other.to_string();
                match other.field() {
                    Some(field) => {
                        let mut fields = FieldErrors::new();
                        fields.insert(field.to_string(), message.clone());
                        ApiError::invalid_request(message, fields)
                    }
                    None => ApiError::bad_request(message),
                }
            }
        }
    }
}

impl From<crate::ratelimit::RateLimitError> for ApiError {
    fn from(err: crate::ratelimit::RateLimitError) -> Self {
        // Don't expose store internals to clients
        tracing::error!("Rate limit store error: {}", err);
        ApiError::internal_server_error("An error occurred while processing your request")
    }
}

// Standard error trait implementations
impl std::fmt::Display for ApiError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

impl std::error::Error for ApiError {}

// Automatic HTTP response conversion for Axum
impl IntoResponse for ApiError {
    fn into_response(self) -> axum::response::Response {
        (self.status, Json(self.to_json())).into_response()
    }
}
