//! Application: shared state, endpoint registry and the axum router.

use axum::{
    extract::{ConnectInfo, Path, Request},
    response::{IntoResponse, Response},
    routing::{on, MethodFilter, MethodRouter},
    Router,
};
use std::any::Any;
use std::collections::{BTreeMap, HashMap};
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::{catch_panic::CatchPanicLayer, trace::TraceLayer};

use crate::auth::Authorizer;
use crate::config::{self, AppConfig};
use crate::endpoint::{pipeline, Endpoint, EndpointError};
use crate::error::ApiError;
use crate::ratelimit::{MemoryStore, RateLimitStore};
use crate::response::AuditHandler;

#[derive(Clone)]
struct StateInner {
    config: AppConfig,
    authorizer: Option<Arc<dyn Authorizer>>,
    audit_handler: Option<Arc<dyn AuditHandler>>,
    rate_store: Arc<dyn RateLimitStore>,
}

/// Process-wide collaborators shared by every request
#[derive(Clone)]
pub struct AppState {
    inner: Arc<StateInner>,
}

impl AppState {
    pub fn new(config: AppConfig) -> Self {
        Self {
            inner: Arc::new(StateInner {
                config,
                authorizer: None,
                audit_handler: None,
                rate_store: Arc::new(MemoryStore::new()),
            }),
        }
    }

    fn update(self, f: impl FnOnce(&mut StateInner)) -> Self {
        let mut inner = Arc::unwrap_or_clone(self.inner);
        f(&mut inner);
        Self { inner: Arc::new(inner) }
    }

    pub fn with_authorizer(self, authorizer: Arc<dyn Authorizer>) -> Self {
        self.update(|s| s.authorizer = Some(authorizer))
    }

    pub fn with_audit_handler(self, handler: Arc<dyn AuditHandler>) -> Self {
        self.update(|s| s.audit_handler = Some(handler))
    }

    pub fn with_rate_limit_store(self, store: Arc<dyn RateLimitStore>) -> Self {
        self.update(|s| s.rate_store = store)
    }

    pub fn config(&self) -> &AppConfig {
        &self.inner.config
    }

    pub fn authorizer(&self) -> Option<&Arc<dyn Authorizer>> {
        self.inner.authorizer.as_ref()
    }

    pub fn audit_handler(&self) -> Option<&Arc<dyn AuditHandler>> {
        self.inner.audit_handler.as_ref()
    }

    pub fn rate_store(&self) -> &dyn RateLimitStore {
        self.inner.rate_store.as_ref()
    }
}

impl Default for AppState {
    fn default() -> Self {
        Self::new(config::config().clone())
    }
}

/// Endpoint registry plus the state handed to every request
pub struct App {
    state: AppState,
    endpoints: Vec<Arc<Endpoint>>,
}

impl App {
    pub fn new() -> Self {
        Self::with_config(config::config().clone())
    }

    pub fn with_config(config: AppConfig) -> Self {
        Self {
            state: AppState::new(config),
            endpoints: Vec::new(),
        }
    }

    pub fn authorizer(mut self, authorizer: impl Authorizer + 'static) -> Self {
        self.state = self.state.with_authorizer(Arc::new(authorizer));
        self
    }

    pub fn audit_handler(mut self, handler: impl AuditHandler + 'static) -> Self {
        self.state = self.state.with_audit_handler(Arc::new(handler));
        self
    }

    pub fn rate_limit_store(mut self, store: impl RateLimitStore + 'static) -> Self {
        self.state = self.state.with_rate_limit_store(Arc::new(store));
        self
    }

    pub fn state(&self) -> &AppState {
        &self.state
    }

    /// Add an endpoint; names and (method, path) pairs must be unique
    pub fn register(&mut self, endpoint: Endpoint) -> Result<Arc<Endpoint>, EndpointError> {
        for existing in &self.endpoints {
            if existing.name == endpoint.name {
                return Err(EndpointError::DuplicateName(endpoint.name));
            }
            if existing.method == endpoint.method && existing.path == endpoint.path {
                return Err(EndpointError::DuplicateRoute {
                    method: endpoint.method,
                    path: endpoint.path,
                    existing: existing.name.clone(),
                });
            }
        }

        tracing::info!("Registered {} {} as '{}'", endpoint.method, endpoint.path, endpoint.name);
        let endpoint = Arc::new(endpoint);
        self.endpoints.push(endpoint.clone());
        Ok(endpoint)
    }

    /// Chaining form of [`App::register`]
    pub fn endpoint(mut self, endpoint: Endpoint) -> Result<Self, EndpointError> {
        self.register(endpoint)?;
        Ok(self)
    }

    pub fn endpoints(&self) -> &[Arc<Endpoint>] {
        &self.endpoints
    }

    pub fn find(&self, name: &str) -> Option<&Arc<Endpoint>> {
        self.endpoints.iter().find(|e| e.name == name)
    }

    /// Build the router. Upload directories are created here.
    pub fn router(&self) -> Result<Router, EndpointError> {
        let mut routes: BTreeMap<String, MethodRouter> = BTreeMap::new();

        for endpoint in &self.endpoints {
            if let Some(upload) = &endpoint.upload {
                upload.prepare()?;
            }

            let filter = method_filter(endpoint)?;
            let handler = endpoint_handler(self.state.clone(), endpoint.clone());
            let method_router = match routes.remove(&endpoint.path) {
                Some(existing) => existing.on(filter, handler),
                None => on(filter, handler),
            };
            routes.insert(endpoint.path.clone(), method_router);
        }

        let router = routes
            .into_iter()
            .fold(Router::new(), |router, (path, method_router)| router.route(&path, method_router));

        let router = router
            .fallback(fallback)
            .layer(axum::extract::DefaultBodyLimit::disable())
            .layer(CatchPanicLayer::custom(panic_response));

        if self.state.config().api.enable_request_logging {
            Ok(router.layer(TraceLayer::new_for_http()))
        } else {
            Ok(router)
        }
    }

    /// Serve on an already-bound listener until the process stops
    pub async fn serve(self, listener: tokio::net::TcpListener) -> anyhow::Result<()> {
        let router = self.router()?;
        tracing::info!(
            "Serving {} endpoint(s) on {}",
            self.endpoints.len(),
            listener.local_addr()?
        );
        axum::serve(listener, router.into_make_service_with_connect_info::<SocketAddr>()).await?;
        Ok(())
    }
}

impl Default for App {
    fn default() -> Self {
        Self::new()
    }
}

fn method_filter(endpoint: &Endpoint) -> Result<MethodFilter, EndpointError> {
    use axum::http::Method;
    Ok(match endpoint.method {
        Method::GET => MethodFilter::GET,
        Method::HEAD => MethodFilter::HEAD,
        Method::POST => MethodFilter::POST,
        Method::PUT => MethodFilter::PUT,
        Method::PATCH => MethodFilter::PATCH,
        Method::DELETE => MethodFilter::DELETE,
        _ => {
            return Err(EndpointError::UnsupportedMethod {
                name: endpoint.name.clone(),
                method: endpoint.method.clone(),
            })
        }
    })
}

fn endpoint_handler(
    state: AppState,
    endpoint: Arc<Endpoint>,
) -> impl Fn(Option<ConnectInfo<SocketAddr>>, Option<Path<HashMap<String, String>>>, Request) -> pipeline::DispatchFuture
       + Clone
       + Send
       + Sync
       + 'static {
    move |peer, path, request| {
        let peer = peer.map(|ConnectInfo(addr)| addr);
        let path = path.map(|Path(params)| params).unwrap_or_default();
        Box::pin(pipeline::dispatch(state.clone(), endpoint.clone(), peer, path, request))
    }
}

async fn fallback() -> Response {
    ApiError::not_found("Route not found").into_response()
}

fn panic_response(err: Box<dyn Any + Send + 'static>) -> Response {
    let detail = err
        .downcast_ref::<String>()
        .map(String::as_str)
        .or_else(|| err.downcast_ref::<&str>().copied())
        .unwrap_or("unknown panic");
    tracing::error!("Handler panicked: {}", detail);
    ApiError::internal_server_error("An internal error occurred").into_response()
}
