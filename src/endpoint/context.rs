use axum::http::{HeaderMap, Method, StatusCode, Uri};
use axum::response::Response;
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};

use super::Endpoint;
use crate::app::AppState;
use crate::auth::{AuthToken, Authorization, Principal};
use crate::body::{FormValues, ParsedBody};
use crate::config::AppConfig;
use crate::error::ApiError;
use crate::filter::FilterBuilder;
use crate::params::{ParamLocation, ParamValue, ParsedParams};
use crate::response::{self, AuditHandler, ResponseType};
use crate::schema::BodyModel;
use crate::upload::{UploadedFile, UploadedFiles};

/// Name of the query param the pipeline turns into a filter builder
pub const FILTER_PARAM: &str = "filter";

/// Everything the pipeline learned about one request, handed to the handler
pub struct RequestContext {
    state: AppState,
    endpoint: Option<Arc<Endpoint>>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    remote_ip: String,
    principal: Option<Principal>,
    token: Option<AuthToken>,
    params: ParsedParams,
    body: Option<ParsedBody>,
    files: UploadedFiles,
    form_values: FormValues,
    deadline: Option<Instant>,
}

impl RequestContext {
    pub(crate) fn new(
        state: AppState,
        endpoint: Arc<Endpoint>,
        method: Method,
        uri: Uri,
        headers: HeaderMap,
        remote_ip: String,
    ) -> Self {
        let deadline = endpoint.timeout.map(|t| Instant::now() + t);
        Self {
            state,
            endpoint: Some(endpoint),
            method,
            uri,
            headers,
            remote_ip,
            principal: None,
            token: None,
            params: ParsedParams::default(),
            body: None,
            files: UploadedFiles::new(),
            form_values: FormValues::new(),
            deadline,
        }
    }

    /// A context outside any request: default app state, no endpoint
    pub fn detached() -> Self {
        Self {
            state: AppState::default(),
            endpoint: None,
            method: Method::GET,
            uri: Uri::from_static("/"),
            headers: HeaderMap::new(),
            remote_ip: String::new(),
            principal: None,
            token: None,
            params: ParsedParams::default(),
            body: None,
            files: UploadedFiles::new(),
            form_values: FormValues::new(),
            deadline: None,
        }
    }

    pub fn with_headers(mut self, headers: HeaderMap) -> Self {
        self.headers = headers;
        self
    }

    pub fn with_principal(mut self, principal: Principal) -> Self {
        self.principal = Some(principal);
        self
    }

    pub fn state(&self) -> &AppState {
        &self.state
    }

    pub fn config(&self) -> &AppConfig {
        self.state.config()
    }

    pub fn endpoint(&self) -> Option<&Endpoint> {
        self.endpoint.as_deref()
    }

    /// Endpoint name, empty outside a request
    pub fn endpoint_name(&self) -> &str {
        self.endpoint.as_deref().map(|e| e.name.as_str()).unwrap_or_default()
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    pub fn uri(&self) -> &Uri {
        &self.uri
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    pub fn remote_ip(&self) -> &str {
        &self.remote_ip
    }

    /// `None` for public endpoints and anonymous callers
    pub fn principal(&self) -> Option<&Principal> {
        self.principal.as_ref()
    }

    pub fn auth_token(&self) -> Option<&AuthToken> {
        self.token.as_ref()
    }

    pub(crate) fn set_authorization(&mut self, authorization: Authorization) {
        self.principal = authorization.principal;
        self.token = authorization.token;
    }

    pub fn params(&self) -> &ParsedParams {
        &self.params
    }

    pub(crate) fn params_mut(&mut self) -> &mut ParsedParams {
        &mut self.params
    }

    pub(crate) fn set_params(&mut self, params: ParsedParams) {
        self.params = params;
    }

    pub fn path_param(&self, name: &str) -> Option<&ParamValue> {
        self.params.get(ParamLocation::Path, name)
    }

    pub fn query_param(&self, name: &str) -> Option<&ParamValue> {
        self.params.get(ParamLocation::Query, name)
    }

    pub fn header_param(&self, name: &str) -> Option<&ParamValue> {
        self.params.get(ParamLocation::Header, name)
    }

    /// The `filter` query param as a builder, once the pipeline has parsed it
    pub fn filter_param(&self) -> Option<&FilterBuilder> {
        self.query_param(FILTER_PARAM).and_then(ParamValue::as_filter)
    }

    /// The bound body, when the endpoint declared one of type `T`
    pub fn body<T: BodyModel>(&self) -> Option<&T> {
        self.body.as_ref().and_then(|b| b.downcast_ref::<T>())
    }

    /// Move the bound body out of the context
    pub fn take_body<T: BodyModel>(&mut self) -> Option<T> {
        match self.body.take()?.downcast::<T>() {
            Ok(body) => Some(body),
            Err(parsed) => {
                self.body = Some(parsed);
                None
            }
        }
    }

    pub(crate) fn set_body(&mut self, body: ParsedBody) {
        self.body = Some(body);
    }

    pub fn uploaded_files(&self) -> &UploadedFiles {
        &self.files
    }

    /// Files received in `field`, in arrival order
    pub fn files(&self, field: &str) -> &[UploadedFile] {
        self.files.get(field).map(Vec::as_slice).unwrap_or_default()
    }

    pub fn form_values(&self) -> &FormValues {
        &self.form_values
    }

    /// First value of a multipart scalar field
    pub fn form_value(&self, name: &str) -> Option<&str> {
        self.form_values.get(name).and_then(|v| v.first()).map(String::as_str)
    }

    pub(crate) fn set_uploads(&mut self, files: UploadedFiles, form_values: FormValues) {
        self.files = files;
        self.form_values = form_values;
    }

    /// Instant the endpoint's timeout elapses; pass it on to downstream calls
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn remaining(&self) -> Option<Duration> {
        self.deadline.map(|d| d.saturating_duration_since(Instant::now()))
    }

    /// The audit handler, when auditing is on for the app and this endpoint
    pub fn audit_handler(&self) -> Option<&Arc<dyn AuditHandler>> {
        let endpoint = self.endpoint.as_deref()?;
        if endpoint.audit_disabled || !self.config().security.enable_audit_logging {
            return None;
        }
        self.state.audit_handler()
    }

    /// See [`response::audit::respond_and_log`]
    pub async fn respond_and_log<T: Serialize + ?Sized>(
        &self,
        value: &T,
        affected_id: Option<&str>,
        response_type: ResponseType,
        status: Option<StatusCode>,
    ) -> Result<Response, ApiError> {
        response::audit::respond_and_log(self, value, affected_id, response_type, status).await
    }
}

impl std::fmt::Debug for RequestContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestContext")
            .field("endpoint", &self.endpoint_name())
            .field("method", &self.method)
            .field("uri", &self.uri)
            .field("remote_ip", &self.remote_ip)
            .field("principal", &self.principal)
            .field("params", &self.params)
            .field("body", &self.body)
            .finish_non_exhaustive()
    }
}
