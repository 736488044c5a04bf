//! Endpoint declarations and the builder that checks them.
//!
//! A declaration is immutable once registered, apart from the `disabled`
//! switch which can be flipped at runtime.

pub mod content_type;
pub mod context;
pub mod pipeline;

use axum::http::Method;
use axum::response::{IntoResponse, Response};
use futures::future::BoxFuture;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

use crate::body::BodyBinder;
use crate::error::ApiError;
use crate::params::Param;
use crate::ratelimit::{RateLimit, RateLimiter};
use crate::schema::BodyModel;
use crate::upload::UploadConfig;

pub use context::RequestContext;

pub type HandlerFuture = BoxFuture<'static, Result<Response, ApiError>>;
pub type Handler = Arc<dyn Fn(RequestContext) -> HandlerFuture + Send + Sync>;

#[derive(Error, Debug)]
pub enum EndpointError {
    #[error("endpoint '{0}' has no handler")]
    MissingHandler(String),

    #[error("endpoint '{name}' uses unsupported method {method}")]
    UnsupportedMethod { name: String, method: Method },

    #[error("endpoint '{name}' path '{path}' must start with '/'")]
    InvalidPath { name: String, path: String },

    #[error("endpoint '{name}': uploads are only accepted on POST, PUT and PATCH")]
    UploadMethod { name: String },

    #[error("route {method} {path} is already registered by '{existing}'")]
    DuplicateRoute {
        method: Method,
        path: String,
        existing: String,
    },

    #[error("endpoint name '{0}' is already registered")]
    DuplicateName(String),

    #[error("failed to prepare upload directory: {0}")]
    Io(#[from] std::io::Error),
}

/// A registered endpoint
pub struct Endpoint {
    pub name: String,
    pub method: Method,
    pub path: String,
    pub description: Option<String>,
    pub accepts: Vec<Param>,
    pub body: Option<BodyBinder>,
    /// Explicit allow-list; empty means derived from `body` and `upload`
    pub accepted_content_types: Vec<String>,
    pub upload: Option<UploadConfig>,
    pub public: bool,
    pub roles: Vec<String>,
    pub audit_disabled: bool,
    pub action_type: Option<String>,
    pub model_name: Option<String>,
    pub timeout: Option<Duration>,
    pub(crate) rate_limiter: Option<RateLimiter>,
    pub(crate) handler: Handler,
    disabled: AtomicBool,
}

impl Endpoint {
    pub fn builder(method: Method, name: &str, path: &str) -> EndpointBuilder {
        EndpointBuilder::new(method, name, path)
    }

    pub fn get(name: &str, path: &str) -> EndpointBuilder {
        Self::builder(Method::GET, name, path)
    }

    pub fn head(name: &str, path: &str) -> EndpointBuilder {
        Self::builder(Method::HEAD, name, path)
    }

    pub fn post(name: &str, path: &str) -> EndpointBuilder {
        Self::builder(Method::POST, name, path)
    }

    pub fn put(name: &str, path: &str) -> EndpointBuilder {
        Self::builder(Method::PUT, name, path)
    }

    pub fn patch(name: &str, path: &str) -> EndpointBuilder {
        Self::builder(Method::PATCH, name, path)
    }

    pub fn delete(name: &str, path: &str) -> EndpointBuilder {
        Self::builder(Method::DELETE, name, path)
    }

    pub fn is_disabled(&self) -> bool {
        self.disabled.load(Ordering::Relaxed)
    }

    /// Disabled endpoints answer 404 until re-enabled
    pub fn set_disabled(&self, disabled: bool) {
        self.disabled.store(disabled, Ordering::Relaxed);
    }

    pub fn has_rate_limiter(&self) -> bool {
        self.rate_limiter.is_some()
    }

    /// Methods whose body is read by the pipeline
    pub fn accepts_body(method: &Method) -> bool {
        matches!(*method, Method::POST | Method::PUT | Method::PATCH)
    }
}

impl fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Endpoint")
            .field("name", &self.name)
            .field("method", &self.method)
            .field("path", &self.path)
            .field("accepts", &self.accepts)
            .field("body", &self.body)
            .field("upload", &self.upload.is_some())
            .field("public", &self.public)
            .field("roles", &self.roles)
            .field("disabled", &self.is_disabled())
            .finish_non_exhaustive()
    }
}

/// Fluent declaration of an endpoint; `build` enforces the declaration invariants
pub struct EndpointBuilder {
    name: String,
    method: Method,
    path: String,
    description: Option<String>,
    accepts: Vec<Param>,
    body: Option<BodyBinder>,
    accepted_content_types: Vec<String>,
    upload: Option<UploadConfig>,
    public: bool,
    roles: Vec<String>,
    audit_disabled: bool,
    action_type: Option<String>,
    model_name: Option<String>,
    timeout: Option<Duration>,
    rate_limiter: Option<RateLimiter>,
    handler: Option<Handler>,
    disabled: bool,
}

impl EndpointBuilder {
    pub fn new(method: Method, name: &str, path: &str) -> Self {
        Self {
            name: name.to_string(),
            method,
            path: path.to_string(),
            description: None,
            accepts: Vec::new(),
            body: None,
            accepted_content_types: Vec::new(),
            upload: None,
            public: false,
            roles: Vec::new(),
            audit_disabled: false,
            action_type: None,
            model_name: None,
            timeout: None,
            rate_limiter: None,
            handler: None,
            disabled: false,
        }
    }

    /// Handler run once every pipeline step has passed
    pub fn handler<F, Fut, R>(mut self, handler: F) -> Self
    where
        F: Fn(RequestContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<R, ApiError>> + Send + 'static,
        R: IntoResponse,
    {
        let handler: Handler = Arc::new(move |ctx| -> HandlerFuture {
            let fut = handler(ctx);
            Box::pin(async move { fut.await.map(IntoResponse::into_response) })
        });
        self.handler = Some(handler);
        self
    }

    pub fn describe(mut self, description: &str) -> Self {
        self.description = Some(description.to_string());
        self
    }

    pub fn accepts(mut self, param: Param) -> Self {
        self.accepts.push(param);
        self
    }

    pub fn params<I>(mut self, params: I) -> Self
    where
        I: IntoIterator<Item = Param>,
    {
        self.accepts.extend(params);
        self
    }

    /// Bind the request body into `T`
    pub fn body<T: BodyModel>(mut self) -> Self {
        self.body = Some(BodyBinder::of::<T>());
        self
    }

    pub fn content_types<'a, I>(mut self, types: I) -> Self
    where
        I: IntoIterator<Item = &'a str>,
    {
        self.accepted_content_types = types.into_iter().map(|t| t.trim().to_ascii_lowercase()).collect();
        self
    }

    pub fn upload(mut self, config: UploadConfig) -> Self {
        self.upload = Some(config);
        self
    }

    pub fn public(mut self) -> Self {
        self.public = true;
        self
    }

    pub fn roles<'a, I>(mut self, roles: I) -> Self
    where
        I: IntoIterator<Item = &'a str>,
    {
        self.roles = roles.into_iter().map(str::to_string).collect();
        self
    }

    pub fn audit_disabled(mut self) -> Self {
        self.audit_disabled = true;
        self
    }

    pub fn action_type(mut self, action: &str) -> Self {
        self.action_type = Some(action.to_string());
        self
    }

    pub fn model_name(mut self, model: &str) -> Self {
        self.model_name = Some(model.to_string());
        self
    }

    /// 0 means no deadline
    pub fn timeout_seconds(mut self, seconds: u64) -> Self {
        self.timeout = (seconds > 0).then(|| Duration::from_secs(seconds));
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = (!timeout.is_zero()).then_some(timeout);
        self
    }

    pub fn rate_limit<F>(mut self, limiter: F) -> Self
    where
        F: Fn(&RequestContext) -> Option<RateLimit> + Send + Sync + 'static,
    {
        let limiter: RateLimiter = Arc::new(limiter);
        self.rate_limiter = Some(limiter);
        self
    }

    pub fn disabled(mut self, disabled: bool) -> Self {
        self.disabled = disabled;
        self
    }

    pub fn build(self) -> Result<Endpoint, EndpointError> {
        let handler = self.handler.ok_or_else(|| EndpointError::MissingHandler(self.name.clone()))?;

        if !matches!(
            self.method,
            Method::GET | Method::HEAD | Method::POST | Method::PUT | Method::PATCH | Method::DELETE
        ) {
            return Err(EndpointError::UnsupportedMethod {
                name: self.name,
                method: self.method,
            });
        }

        if !self.path.starts_with('/') {
            return Err(EndpointError::InvalidPath {
                name: self.name,
                path: self.path,
            });
        }

        if self.upload.is_some() && !Endpoint::accepts_body(&self.method) {
            return Err(EndpointError::UploadMethod { name: self.name });
        }

        let body = match self.body {
            Some(binder) if matches!(self.method, Method::GET | Method::HEAD | Method::DELETE) => {
                tracing::debug!(
                    "Ignoring body type {} on {} endpoint '{}'",
                    binder.type_name,
                    self.method,
                    self.name
                );
                None
            }
            other => other,
        };

        Ok(Endpoint {
            name: self.name,
            method: self.method,
            path: self.path,
            description: self.description,
            accepts: self.accepts,
            body,
            accepted_content_types: self.accepted_content_types,
            upload: self.upload,
            public: self.public,
            roles: self.roles,
            audit_disabled: self.audit_disabled,
            action_type: self.action_type,
            model_name: self.model_name,
            timeout: self.timeout,
            rate_limiter: self.rate_limiter,
            handler,
            disabled: AtomicBool::new(self.disabled),
        })
    }
}
