//! Content-type gate for endpoints that read a body.

use axum::http::{header, HeaderMap};

use super::Endpoint;
use crate::error::ApiError;

pub const JSON: &str = "application/json";
pub const FORM_URLENCODED: &str = "application/x-www-form-urlencoded";
pub const MULTIPART: &str = "multipart/form-data";

/// How the pipeline reads an admitted body
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyKind {
    Json,
    Form,
    Multipart,
}

/// Accepted types: the explicit allow-list, else derived from the body and upload declarations
pub fn accepted_types(endpoint: &Endpoint) -> Vec<String> {
    if !endpoint.accepted_content_types.is_empty() {
        return endpoint.accepted_content_types.clone();
    }
    if endpoint.upload.is_some() {
        return vec![MULTIPART.to_string()];
    }
    if endpoint.body.is_some() {
        return vec![JSON.to_string(), FORM_URLENCODED.to_string()];
    }
    Vec::new()
}

/// Media type without parameters, lowercased
pub fn essence(content_type: &str) -> String {
    content_type
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase()
}

/// `multipart/form-data; boundary=..` matches multipart, `application/*+json` matches JSON
pub fn matches(content_type: &str, accepted: &str) -> bool {
    let received = essence(content_type);
    let accepted = essence(accepted);
    if received.is_empty() {
        return false;
    }
    match accepted.as_str() {
        MULTIPART => received.starts_with(MULTIPART),
        JSON => received == JSON || (received.starts_with("application/") && received.ends_with("+json")),
        other => received == other,
    }
}

fn classify(content_type: &str) -> BodyKind {
    let received = essence(content_type);
    if received.starts_with(MULTIPART) {
        BodyKind::Multipart
    } else if received == FORM_URLENCODED {
        BodyKind::Form
    } else {
        // Any other admitted type is decoded as JSON
        BodyKind::Json
    }
}

/// Decide whether the request body is admitted, and how to read it.
///
/// `None` means the endpoint reads no body and any content type passes.
/// A multipart body on an endpoint without uploads is admitted wherever
/// url-encoded forms are, so that file parts can be rejected with
/// `FILE_UPLOAD_NOT_CONFIGURED` while scalar-only forms still bind.
pub fn gate(endpoint: &Endpoint, headers: &HeaderMap) -> Result<Option<BodyKind>, ApiError> {
    if !Endpoint::accepts_body(&endpoint.method) || (endpoint.body.is_none() && endpoint.upload.is_none()) {
        return Ok(None);
    }

    let received = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    let accepted = accepted_types(endpoint);

    if accepted.iter().any(|a| matches(received, a)) {
        return Ok(Some(classify(received)));
    }

    let form_accepted = accepted.iter().any(|a| matches(FORM_URLENCODED, a));
    if endpoint.upload.is_none() && form_accepted && matches(received, MULTIPART) {
        return Ok(Some(BodyKind::Multipart));
    }

    tracing::debug!(
        "Rejecting content type '{}' on '{}' (accepted: {:?})",
        received,
        endpoint.name,
        accepted
    );
    let accepted: Vec<&str> = accepted.iter().map(String::as_str).collect();
    Err(ApiError::unsupported_content_type(received, &accepted))
}
