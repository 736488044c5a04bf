//! Response helpers: raw formats that bypass audit, the success envelope,
//! and `respond_and_log` (see [`audit`]).

pub mod audit;

use axum::{
    http::{header, HeaderValue, StatusCode},
    response::{Html, IntoResponse, Json, Response},
};
use serde::Serialize;
use serde_json::json;

use crate::error::ApiError;

pub use audit::{AuditHandler, AuditRecord, TracingAuditHandler};

/// Wire format of a handler's response
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ResponseType {
    #[default]
    Json,
    Xml,
    Text,
    Html,
    NoContent,
}

const XML_ROOT: &str = "response";

/// Serialize `value` in the given format
pub fn render<T: Serialize + ?Sized>(value: &T, response_type: ResponseType, status: Option<StatusCode>) -> Result<Response, ApiError> {
    match response_type {
        ResponseType::Json => json(value, status),
        ResponseType::Xml => xml(value, status),
        ResponseType::Text => text(to_plain(value)?, status),
        ResponseType::Html => html(to_plain(value)?, status),
        ResponseType::NoContent => Ok(no_content()),
    }
}

pub fn json<T: Serialize + ?Sized>(value: &T, status: Option<StatusCode>) -> Result<Response, ApiError> {
    let body = serde_json::to_value(value).map_err(serialize_error)?;
    Ok((status.unwrap_or(StatusCode::OK), Json(body)).into_response())
}

pub fn xml<T: Serialize + ?Sized>(value: &T, status: Option<StatusCode>) -> Result<Response, ApiError> {
    let body = quick_xml::se::to_string_with_root(XML_ROOT, value).map_err(serialize_error)?;
    let mut response = (status.unwrap_or(StatusCode::OK), body).into_response();
    response
        .headers_mut()
        .insert(header::CONTENT_TYPE, HeaderValue::from_static("application/xml; charset=utf-8"));
    Ok(response)
}

pub fn text(body: impl Into<String>, status: Option<StatusCode>) -> Result<Response, ApiError> {
    Ok((status.unwrap_or(StatusCode::OK), body.into()).into_response())
}

pub fn html(body: impl Into<String>, status: Option<StatusCode>) -> Result<Response, ApiError> {
    Ok((status.unwrap_or(StatusCode::OK), Html(body.into())).into_response())
}

pub fn no_content() -> Response {
    StatusCode::NO_CONTENT.into_response()
}

/// Strings render as-is; anything else as its JSON text
fn to_plain<T: Serialize + ?Sized>(value: &T) -> Result<String, ApiError> {
    match serde_json::to_value(value).map_err(serialize_error)? {
        serde_json::Value::String(s) => Ok(s),
        other => Ok(other.to_string()),
    }
}

fn serialize_error(err: impl std::fmt::Display) -> ApiError {
    tracing::error!("Failed to serialize response data: {}", err);
    ApiError::internal_server_error("Failed to serialize response data")
}

/// Wrapper for API responses that automatically adds success envelope
#[derive(Debug)]
pub struct ApiResponse<T: Serialize> {
    pub data: T,
    pub status_code: Option<StatusCode>,
}

impl<T: Serialize> ApiResponse<T> {
    /// Create a successful API response with default 200 status
    pub fn success(data: T) -> Self {
        Self {
            data,
            status_code: None,
        }
    }

    pub fn with_status(data: T, status_code: StatusCode) -> Self {
        Self {
            data,
            status_code: Some(status_code),
        }
    }

    /// Create a 201 Created response
    pub fn created(data: T) -> Self {
        Self::with_status(data, StatusCode::CREATED)
    }

    pub fn accepted(data: T) -> Self {
        Self::with_status(data, StatusCode::ACCEPTED)
    }

    /// The `{"success":true,"data":...}` body
    pub fn envelope(&self) -> Result<serde_json::Value, ApiError> {
        let data = serde_json::to_value(&self.data).map_err(serialize_error)?;
        Ok(json!({
            "success": true,
            "data": data
        }))
    }
}

impl<T: Serialize> IntoResponse for ApiResponse<T> {
    fn into_response(self) -> Response {
        let status = self.status_code.unwrap_or(StatusCode::OK);

        // For 204 No Content, return empty response
        if status == StatusCode::NO_CONTENT {
            return status.into_response();
        }

        match self.envelope() {
            Ok(envelope) => (status, Json(envelope)).into_response(),
            Err(err) => err.into_response(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Serialize;

    #[derive(Serialize)]
    struct Item {
        id: u32,
        name: String,
    }

    async fn body_text(response: Response) -> String {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[tokio::test]
    async fn renders_each_format() {
        let item = Item { id: 1, name: "widget".into() };

        let response = render(&item, ResponseType::Json, Some(StatusCode::CREATED)).unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
        let body: serde_json::Value = serde_json::from_str(&body_text(response).await).unwrap();
        assert_eq!(body, json!({"id": 1, "name": "widget"}));

        let response = render(&item, ResponseType::Xml, None).unwrap();
        assert_eq!(
            response.headers()[header::CONTENT_TYPE],
            "application/xml; charset=utf-8"
        );
        let xml = body_text(response).await;
        assert!(xml.starts_with("<response>"));
        assert!(xml.contains("<name>widget</name>"));

        let response = render("hello", ResponseType::Text, None).unwrap();
        assert_eq!(body_text(response).await, "hello");

        let response = render("<p>hi</p>", ResponseType::Html, None).unwrap();
        assert!(response.headers()[header::CONTENT_TYPE].to_str().unwrap().starts_with("text/html"));

        let response = render(&item, ResponseType::NoContent, None).unwrap();
        assert_eq!(response.status(), StatusCode::NO_CONTENT);
    }

    #[tokio::test]
    async fn envelope_wraps_data() {
        let response = ApiResponse::created(json!({"id": 3})).into_response();
        assert_eq!(response.status(), StatusCode::CREATED);
        let body: serde_json::Value = serde_json::from_str(&body_text(response).await).unwrap();
        assert_eq!(body, json!({"success": true, "data": {"id": 3}}));
    }
}
