//! Audit records emitted by `respond_and_log`.
//!
//! The audit handler runs before the response is written. Its failures are
//! logged and swallowed; a successful response is never turned into an error
//! because the audit trail could not be written.

use async_trait::async_trait;
use axum::http::StatusCode;
use axum::response::Response;
use chrono::{DateTime, Utc};
use serde::{Serialize, Serializer};
use serde_json::Value;

use super::{render, ResponseType};
use crate::endpoint::RequestContext;
use crate::error::ApiError;

#[async_trait]
pub trait AuditHandler: Send + Sync {
    async fn record(&self, ctx: &RequestContext, response: &Value, affected_id: Option<&str>) -> anyhow::Result<()>;
}

/// Flat description of an audited request, for handlers that persist or ship it
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditRecord {
    pub endpoint: String,
    pub action_type: Option<String>,
    pub model_name: Option<String>,
    #[serde(serialize_with = "serialize_method")]
    pub method: axum::http::Method,
    pub path: String,
    pub principal_id: Option<String>,
    pub remote_ip: String,
    pub affected_id: Option<String>,
    pub timestamp: DateTime<Utc>,
}

fn serialize_method<S: Serializer>(method: &axum::http::Method, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(method.as_str())
}

impl AuditRecord {
    pub fn from_context(ctx: &RequestContext, affected_id: Option<&str>) -> Self {
        let endpoint = ctx.endpoint();
        Self {
            endpoint: ctx.endpoint_name().to_string(),
            action_type: endpoint.and_then(|e| e.action_type.clone()),
            model_name: endpoint.and_then(|e| e.model_name.clone()),
            method: ctx.method().clone(),
            path: ctx.uri().path().to_string(),
            principal_id: ctx.principal().map(|p| p.id.clone()),
            remote_ip: ctx.remote_ip().to_string(),
            affected_id: affected_id.map(str::to_string),
            timestamp: Utc::now(),
        }
    }
}

/// Writes audit records to the `audit` tracing target
#[derive(Debug, Default, Clone)]
pub struct TracingAuditHandler;

#[async_trait]
impl AuditHandler for TracingAuditHandler {
    async fn record(&self, ctx: &RequestContext, _response: &Value, affected_id: Option<&str>) -> anyhow::Result<()> {
        let record = AuditRecord::from_context(ctx, affected_id);
        tracing::info!(
            target: "audit",
            endpoint = %record.endpoint,
            action = record.action_type.as_deref().unwrap_or(""),
            model = record.model_name.as_deref().unwrap_or(""),
            principal = record.principal_id.as_deref().unwrap_or("anonymous"),
            affected_id = record.affected_id.as_deref().unwrap_or(""),
            "{} {}",
            record.method,
            record.path
        );
        Ok(())
    }
}

/// Run the audit handler when auditing is on for this endpoint, then render the response
pub async fn respond_and_log<T: Serialize + ?Sized>(
    ctx: &RequestContext,
    value: &T,
    affected_id: Option<&str>,
    response_type: ResponseType,
    status: Option<StatusCode>,
) -> Result<Response, ApiError> {
    if let Some(handler) = ctx.audit_handler() {
        match serde_json::to_value(value) {
            Ok(snapshot) => {
                if let Err(e) = handler.record(ctx, &snapshot, affected_id).await {
                    tracing::warn!("Audit handler failed for '{}': {:#}", ctx.endpoint_name(), e);
                }
            }
            Err(e) => tracing::warn!("Skipping audit for '{}': {}", ctx.endpoint_name(), e),
        }
    }
    render(value, response_type, status)
}
