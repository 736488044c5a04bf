//! The fixed per-request pipeline.
//!
//! Steps run strictly in this order and the first error short-circuits:
//! disabled check, deadline, content-type gate, uploads, body, params,
//! filter, authorization, rate limit, handler. Files persisted by the upload
//! step are removed if a later step fails, and after the response has been
//! sent unless the endpoint keeps them.

use axum::body::{Body, Bytes};
use axum::extract::{FromRequest, Multipart, Request};
use axum::http::HeaderMap;
use axum::response::{IntoResponse, Response};
use futures::future::BoxFuture;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use super::content_type::{self, BodyKind};
use super::context::{RequestContext, FILTER_PARAM};
use super::Endpoint;
use crate::app::AppState;
use crate::auth::Principal;
use crate::body::{parse_urlencoded, BodySource};
use crate::error::ApiError;
use crate::filter::FilterBuilder;
use crate::params::{self, ParamValue, RawParams};
use crate::ratelimit;
use crate::upload::{self, attach_cleanup, CleanupGuard, PersistedFiles, UploadedFiles};

pub type DispatchFuture = BoxFuture<'static, Response>;

/// Run one request through the endpoint's pipeline and its handler
pub async fn dispatch(
    state: AppState,
    endpoint: Arc<Endpoint>,
    peer: Option<SocketAddr>,
    path_params: HashMap<String, String>,
    request: Request,
) -> Response {
    if endpoint.is_disabled() {
        tracing::debug!("Endpoint '{}' is disabled", endpoint.name);
        return ApiError::not_found("Route not found").into_response();
    }

    let mut handed_off = Vec::new();
    let steps = run(&state, &endpoint, peer, path_params, request, &mut handed_off);
    let result = match endpoint.timeout {
        Some(limit) => match tokio::time::timeout(limit, steps).await {
            Ok(result) => result,
            Err(_) => {
                tracing::warn!("Endpoint '{}' exceeded its {:?} deadline", endpoint.name, limit);
                Err(ApiError::request_timeout("Request timed out"))
            }
        },
        None => steps.await,
    };

    let response = match result {
        Ok(response) => response,
        Err(err) => {
            if err.status().is_server_error() {
                tracing::error!("{} failed: {}", endpoint.name, err);
            } else {
                tracing::debug!("{} rejected: {}", endpoint.name, err);
            }
            err.into_response()
        }
    };

    let keep_files = endpoint.upload.as_ref().map_or(true, |u| u.keep_files_after_send);
    if keep_files || handed_off.is_empty() {
        return response;
    }
    let delay = Duration::from_millis(state.config().api.upload_cleanup_delay_ms);
    attach_cleanup(response, CleanupGuard::new(handed_off, delay))
}

async fn run(
    state: &AppState,
    endpoint: &Arc<Endpoint>,
    peer: Option<SocketAddr>,
    path_params: HashMap<String, String>,
    request: Request,
    handed_off: &mut Vec<PathBuf>,
) -> Result<Response, ApiError> {
    let (parts, body) = request.into_parts();
    let ip = remote_ip(&parts.headers, peer);
    let mut ctx = RequestContext::new(
        state.clone(),
        endpoint.clone(),
        parts.method.clone(),
        parts.uri.clone(),
        parts.headers.clone(),
        ip,
    );
    tracing::debug!("{} {} -> '{}'", ctx.method(), ctx.uri().path(), endpoint.name);

    let kind = content_type::gate(endpoint, ctx.headers())?;

    let mut persisted = PersistedFiles::new();
    let source = match kind {
        None => None,
        Some(BodyKind::Json) => {
            let bytes = read_body(body, state.config().api.max_request_size_bytes).await?;
            Some(BodySource::Json(bytes))
        }
        Some(BodyKind::Form) => {
            let bytes = read_body(body, state.config().api.max_request_size_bytes).await?;
            Some(BodySource::Form(parse_urlencoded(&bytes)))
        }
        Some(BodyKind::Multipart) => {
            let mut multipart = Multipart::from_request(Request::from_parts(parts, body), &())
                .await
                .map_err(|e| ApiError::bad_request(e.body_text()))?;
            let form_limit = state.config().api.form_memory_limit_bytes;

            let received = match &endpoint.upload {
                Some(config) => upload::receive(&mut multipart, config, form_limit).await,
                None => upload::scan_form_fields(&mut multipart, form_limit)
                    .await
                    .map(|form| (UploadedFiles::new(), form)),
            };
            let (files, form) = match received {
                Ok(received) => received,
                Err(err) => {
                    drain(&mut multipart, state.config().api.max_request_size_bytes).await;
                    return Err(err.into());
                }
            };
            persisted = PersistedFiles::from_uploads(&files);
            tracing::debug!("Received {} file(s) for '{}'", persisted.len(), endpoint.name);
            ctx.set_uploads(files, form.clone());
            Some(BodySource::Form(form))
        }
    };

    if let (Some(binder), Some(source)) = (endpoint.body, source) {
        let parsed = binder.run(source, &ctx)?;
        ctx.set_body(parsed);
    }

    let query = query_pairs(ctx.uri().query());
    let parsed = params::parse_params(
        &endpoint.accepts,
        RawParams {
            path: &path_params,
            query: &query,
            headers: ctx.headers(),
        },
    )?;
    ctx.set_params(parsed);

    resolve_filter(&mut ctx)?;

    if !endpoint.public {
        if let Some(authorizer) = state.authorizer() {
            let authorization = authorizer.authorize(&ctx).await?;
            ctx.set_authorization(authorization);
        }
        check_roles(endpoint, ctx.principal())?;
    }

    if let Some(limiter) = &endpoint.rate_limiter {
        ratelimit::enforce(&ctx, limiter, state.rate_store()).await?;
    }

    handed_off.extend(persisted.disarm());
    (endpoint.handler)(ctx).await
}

async fn read_body(body: Body, limit: usize) -> Result<Bytes, ApiError> {
    axum::body::to_bytes(body, limit).await.map_err(|e| {
        tracing::debug!("Failed to read request body: {}", e);
        ApiError::payload_too_large(format!("Request body exceeds the limit of {} bytes", limit))
    })
}

/// Read and discard the rest of a rejected multipart body, up to `limit`
/// bytes, so the client reads the error instead of a reset connection
async fn drain(multipart: &mut Multipart, limit: usize) {
    let mut discarded = 0usize;
    while let Ok(Some(mut field)) = multipart.next_field().await {
        while let Ok(Some(chunk)) = field.chunk().await {
            discarded += chunk.len();
            if discarded > limit {
                return;
            }
        }
    }
}

/// Decoded query pairs in order; `?flag` yields `("flag", "")`
pub fn query_pairs(query: Option<&str>) -> Vec<(String, String)> {
    query
        .map(|q| url::form_urlencoded::parse(q.as_bytes()).into_owned().collect())
        .unwrap_or_default()
}

/// Client address: first `X-Forwarded-For` hop, then `X-Real-IP`, then the socket peer
pub fn remote_ip(headers: &HeaderMap, peer: Option<SocketAddr>) -> String {
    let header = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.split(',').next())
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .map(str::to_string)
    };

    header("x-forwarded-for")
        .or_else(|| header("x-real-ip"))
        .or_else(|| peer.map(|addr| addr.ip().to_string()))
        .unwrap_or_default()
}

/// Parse a raw `filter` query value into a builder and cap its limit
fn resolve_filter(ctx: &mut RequestContext) -> Result<(), ApiError> {
    let max_limit = ctx.config().filter.max_limit;
    let endpoint = ctx.endpoint_name().to_string();

    let Some(value) = ctx.params_mut().query.get_mut(FILTER_PARAM) else {
        return Ok(());
    };

    let raw = match value {
        ParamValue::String(raw) => Some(raw.clone()),
        _ => None,
    };
    if let Some(raw) = raw {
        let builder = FilterBuilder::from_json(&raw)?;
        builder.build()?;
        *value = ParamValue::Filter(builder);
    }

    if let (ParamValue::Filter(builder), Some(max)) = (value, max_limit) {
        if builder.limit_value().is_some_and(|limit| limit > max) {
            tracing::warn!(
                "Capping filter limit {:?} to {} on '{}'",
                builder.limit_value(),
                max,
                endpoint
            );
            *builder = std::mem::take(builder).limit(max);
        }
    }
    Ok(())
}

/// Roles are checked only once a principal is known
fn check_roles(endpoint: &Endpoint, principal: Option<&Principal>) -> Result<(), ApiError> {
    match principal {
        Some(principal) if !endpoint.roles.is_empty() && !endpoint.roles.contains(&principal.role) => {
            tracing::debug!(
                "Role '{}' of '{}' not allowed on '{}'",
                principal.role,
                principal.id,
                endpoint.name
            );
            Err(ApiError::forbidden("Insufficient permissions"))
        }
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::App;
    use crate::auth::{issue_token, Claims, JwtAuthorizer};
    use crate::config::AppConfig;
    use crate::params::{Param, ParamType};
    use crate::ratelimit::RateLimit;
    use crate::schema::{BodyModel, FieldRule};
    use axum::http::{header, HeaderValue, Method, StatusCode};
    use serde::{Deserialize, Serialize};
    use serde_json::{json, Value};
    use tower::ServiceExt;

    const SECRET: &str = "pipeline-secret";

    #[derive(Debug, Serialize, Deserialize)]
    struct Tag {
        label: String,
    }

    impl BodyModel for Tag {
        fn fields() -> Vec<FieldRule> {
            vec![FieldRule::string("label").normalize("trim,lowercase").validate("required,min=2")]
        }
    }

    async fn echo_tag(ctx: RequestContext) -> Result<Response, ApiError> {
        let tag = ctx.body::<Tag>().ok_or_else(|| ApiError::internal_server_error("no body"))?;
        crate::response::json(&json!({ "label": tag.label }), None)
    }

    async fn echo_filter(ctx: RequestContext) -> Result<Response, ApiError> {
        let limit = ctx.filter_param().and_then(|f| f.limit_value());
        crate::response::json(&json!({ "limit": limit }), None)
    }

    async fn whoami(ctx: RequestContext) -> Result<Response, ApiError> {
        let id = ctx.principal().map(|p| p.id.clone());
        crate::response::json(&json!({ "id": id }), None)
    }

    async fn send(router: axum::Router, request: axum::http::Request<Body>) -> (StatusCode, Value) {
        let response = router.oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, serde_json::from_slice(&bytes).unwrap_or(Value::Null))
    }

    fn request(method: Method, uri: &str) -> axum::http::request::Builder {
        axum::http::Request::builder().method(method).uri(uri)
    }

    fn config() -> AppConfig {
        let mut config = AppConfig::development();
        config.filter.max_limit = Some(50);
        config
    }

    #[test]
    fn remote_ip_prefers_forwarding_headers() {
        let peer: SocketAddr = "10.1.1.1:5000".parse().unwrap();
        let mut headers = HeaderMap::new();
        assert_eq!(remote_ip(&headers, Some(peer)), "10.1.1.1");

        headers.insert("x-real-ip", HeaderValue::from_static("192.168.0.9"));
        assert_eq!(remote_ip(&headers, Some(peer)), "192.168.0.9");

        headers.insert("x-forwarded-for", HeaderValue::from_static("203.0.113.5, 10.0.0.1"));
        assert_eq!(remote_ip(&headers, Some(peer)), "203.0.113.5");

        assert_eq!(remote_ip(&HeaderMap::new(), None), "");
    }

    #[test]
    fn bare_query_flags_keep_empty_values() {
        assert_eq!(
            query_pairs(Some("active&name=a%20b")),
            vec![("active".to_string(), String::new()), ("name".to_string(), "a b".to_string())]
        );
        assert!(query_pairs(None).is_empty());
    }

    #[tokio::test]
    async fn json_and_form_bodies_are_processed() {
        let app = App::with_config(config())
            .endpoint(Endpoint::post("tag", "/tags").body::<Tag>().handler(echo_tag).build().unwrap())
            .unwrap();
        let router = app.router().unwrap();

        let (status, body) = send(
            router.clone(),
            request(Method::POST, "/tags")
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(r#"{"label":"  URGENT "}"#))
                .unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["label"], "urgent");

        let (status, body) = send(
            router.clone(),
            request(Method::POST, "/tags")
                .header(header::CONTENT_TYPE, "application/x-www-form-urlencoded")
                .body(Body::from("label=%20Later%20"))
                .unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["label"], "later");

        let (status, body) = send(
            router,
            request(Method::POST, "/tags")
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(r#"{"label":" x "}"#))
                .unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["errorCode"], "INVALID_REQUEST");
        assert_eq!(body["details"]["label"], "must have a minimum length of 2");
    }

    #[tokio::test]
    async fn filter_param_is_parsed_and_capped() {
        let app = App::with_config(config())
            .endpoint(
                Endpoint::get("list", "/items")
                    .accepts(Param::query("filter", ParamType::String))
                    .handler(echo_filter)
                    .build()
                    .unwrap(),
            )
            .unwrap();
        let router = app.router().unwrap();

        let (status, body) = send(
            router.clone(),
            request(Method::GET, "/items?filter=%7B%22limit%22%3A5%7D").body(Body::empty()).unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["limit"], 5);

        let (_, body) = send(
            router.clone(),
            request(Method::GET, "/items?filter=%7B%22limit%22%3A500%7D").body(Body::empty()).unwrap(),
        )
        .await;
        assert_eq!(body["limit"], 50);

        let (status, body) = send(
            router,
            request(Method::GET, "/items?filter=%7Bbad").body(Body::empty()).unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["errorCode"], "INVALID_FILTER");
    }

    #[tokio::test]
    async fn authorizer_and_roles_gate_private_endpoints() {
        let app = App::with_config(config())
            .authorizer(JwtAuthorizer::new(SECRET))
            .endpoint(Endpoint::get("me", "/me").handler(whoami).build().unwrap())
            .unwrap()
            .endpoint(Endpoint::get("admin", "/admin").roles(["admin"]).handler(whoami).build().unwrap())
            .unwrap()
            .endpoint(Endpoint::get("open", "/open").public().handler(whoami).build().unwrap())
            .unwrap();
        let router = app.router().unwrap();
        let token = issue_token(&Claims::new("u-1", "member", "user"), SECRET).unwrap();
        let bearer = format!("Bearer {}", token);

        let (status, body) = send(router.clone(), request(Method::GET, "/me").body(Body::empty()).unwrap()).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["errorCode"], "UNAUTHORIZED");

        let (status, body) = send(
            router.clone(),
            request(Method::GET, "/me").header("authorization", &bearer).body(Body::empty()).unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["id"], "u-1");

        let (status, body) = send(
            router.clone(),
            request(Method::GET, "/admin").header("authorization", &bearer).body(Body::empty()).unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        assert_eq!(body["errorCode"], "FORBIDDEN");

        let (status, body) = send(router, request(Method::GET, "/open").body(Body::empty()).unwrap()).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["id"], Value::Null);
    }

    #[tokio::test]
    async fn slow_handlers_time_out() {
        let app = App::with_config(config())
            .endpoint(
                Endpoint::get("slow", "/slow")
                    .timeout(Duration::from_millis(50))
                    .handler(|_ctx| async {
                        tokio::time::sleep(Duration::from_secs(5)).await;
                        Ok::<_, ApiError>("late")
                    })
                    .build()
                    .unwrap(),
            )
            .unwrap();

        let (status, body) = send(app.router().unwrap(), request(Method::GET, "/slow").body(Body::empty()).unwrap()).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body["errorCode"], "REQUEST_TIMEOUT");
    }

    #[tokio::test]
    async fn rate_limit_runs_after_params() {
        let app = App::with_config(config())
            .endpoint(
                Endpoint::get("count", "/count/:n")
                    .accepts(Param::path("n", ParamType::Int))
                    .rate_limit(|_| Some(RateLimit::new(1, Duration::from_secs(60))))
                    .handler(|_ctx| async { Ok::<_, ApiError>("ok") })
                    .build()
                    .unwrap(),
            )
            .unwrap();
        let router = app.router().unwrap();

        // Param failures do not consume the budget
        let (status, body) = send(router.clone(), request(Method::GET, "/count/x").body(Body::empty()).unwrap()).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["errorCode"], "PARAM_ERRORS");

        let (status, _) = send(router.clone(), request(Method::GET, "/count/1").body(Body::empty()).unwrap()).await;
        assert_eq!(status, StatusCode::OK);
        let (status, body) = send(router, request(Method::GET, "/count/2").body(Body::empty()).unwrap()).await;
        assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(body["statusCode"], 429);
    }
}
