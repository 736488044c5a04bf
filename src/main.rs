use axum::http::StatusCode;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tracing_subscriber::EnvFilter;

use declarest::auth::{issue_token, Claims, JwtAuthorizer};
use declarest::filter::{to_document_query, FieldType, QuerySchema};
use declarest::ratelimit::RateLimit;
use declarest::response::TracingAuditHandler;
use declarest::upload::{FileFieldConfig, UploadConfig};
use declarest::{
    ApiError, ApiResponse, App, BodyModel, Endpoint, FieldRule, Param, ParamType, RequestContext, ResponseType,
};

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Contact {
    id: String,
    name: String,
    email: String,
    age: i64,
    tags: Vec<String>,
}

#[derive(Debug, Serialize, Deserialize)]
struct NewContact {
    name: String,
    email: String,
    #[serde(default)]
    age: i64,
    #[serde(default)]
    tags: Vec<String>,
}

impl BodyModel for NewContact {
    fn fields() -> Vec<FieldRule> {
        vec![
            FieldRule::string("name").normalize("trim").validate("required,min=2,max=100"),
            FieldRule::string("email")
                .normalize("trim,lowercase")
                .sanitize("html")
                .validate("required,email"),
            FieldRule::int("age").validate("gte=0,lte=150"),
            FieldRule::list("tags", declarest::schema::FieldKind::String)
                .normalize("dive,trim,lowercase")
                .validate("max=10,dive,alphanum"),
        ]
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct TokenRequest {
    user_id: String,
    role: String,
}

impl BodyModel for TokenRequest {
    fn fields() -> Vec<FieldRule> {
        vec![
            FieldRule::string("user_id").normalize("trim").validate("required"),
            FieldRule::string("role").normalize("trim,lowercase").validate("required,oneof=admin member"),
        ]
    }
}

type Store = Arc<RwLock<Vec<Contact>>>;

fn contact_schema() -> QuerySchema {
    QuerySchema::new()
        .field("name", FieldType::String)
        .field("email", FieldType::String)
        .field("age", FieldType::Number)
        .field("tags", FieldType::Array)
        .field("createdAt", FieldType::Date)
}

fn app(store: Store) -> Result<App, declarest::EndpointError> {
    let list_store = store.clone();
    let create_store = store;

    App::new()
        .authorizer(JwtAuthorizer::from_config())
        .audit_handler(TracingAuditHandler)
        .endpoint(
            Endpoint::get("health", "/health")
                .public()
                .audit_disabled()
                .handler(|_ctx| async {
                    Ok::<_, ApiError>(ApiResponse::success(json!({
                        "status": "ok",
                        "version": env!("CARGO_PKG_VERSION"),
                        "timestamp": chrono::Utc::now(),
                    })))
                })
                .build()?,
        )?
        .endpoint(
            Endpoint::post("issue_token", "/auth/token")
                .public()
                .describe("Issue a bearer token for the demo endpoints")
                .body::<TokenRequest>()
                .rate_limit(|ctx| Some(RateLimit::new(5, Duration::from_secs(15 * 60)).key(format!("token_{}", ctx.remote_ip()))))
                .handler(issue)
                .build()?,
        )?
        .endpoint(
            Endpoint::get("list_contacts", "/contacts")
                .describe("List contacts with a LoopBack-style filter")
                .accepts(Param::query("filter", ParamType::Filter))
                .handler(move |ctx| list(ctx, list_store.clone()))
                .build()?,
        )?
        .endpoint(
            Endpoint::post("create_contact", "/contacts")
                .body::<NewContact>()
                .action_type("create")
                .model_name("contact")
                .roles(["admin", "member"])
                .handler(move |ctx| create(ctx, create_store.clone()))
                .build()?,
        )?
        .endpoint(
            Endpoint::post("upload_avatar", "/contacts/:id/avatar")
                .accepts(Param::path("id", ParamType::String))
                .upload(
                    UploadConfig::new().file_field(
                        "avatar",
                        FileFieldConfig::new()
                            .required()
                            .max_file_size(1024 * 1024)
                            .allowed_types(["png", "jpg", "jpeg", "gif"])
                            .max_files(1),
                    ),
                )
                .timeout_seconds(30)
                .action_type("upload")
                .model_name("contact")
                .handler(avatar)
                .build()?,
        )
}

async fn issue(ctx: RequestContext) -> Result<ApiResponse<serde_json::Value>, ApiError> {
    let request = ctx
        .body::<TokenRequest>()
        .ok_or_else(|| ApiError::internal_server_error("Missing token request"))?;
    let secret = &ctx.config().security.jwt_secret;
    let token = issue_token(&Claims::new(&request.user_id, &request.role, "demo"), secret).map_err(|e| {
        tracing::error!("Token issue failed: {}", e);
        ApiError::internal_server_error("JWT_SECRET is not configured")
    })?;
    Ok(ApiResponse::created(json!({ "token": token })))
}

async fn list(ctx: RequestContext, store: Store) -> Result<axum::response::Response, ApiError> {
    let filter = ctx.filter_param().cloned().unwrap_or_default().build()?;
    let query = to_document_query(&filter, &contact_schema())?;

    let contacts: Vec<Contact> = {
        let contacts = store.read().map_err(|_| ApiError::internal_server_error("Store unavailable"))?;
        let skip = query.skip.unwrap_or(0) as usize;
        let limit = query.limit.map(|l| l as usize).unwrap_or(usize::MAX);
        contacts.iter().skip(skip).take(limit).cloned().collect()
    };

    declarest::response::json(
        &json!({
            "query": {
                "filter": query.filter,
                "sort": query.sort,
                "projection": query.projection,
            },
            "items": contacts,
        }),
        None,
    )
}

async fn create(mut ctx: RequestContext, store: Store) -> Result<axum::response::Response, ApiError> {
    let input = ctx
        .take_body::<NewContact>()
        .ok_or_else(|| ApiError::internal_server_error("Missing contact body"))?;

    let contact = Contact {
        id: uuid::Uuid::new_v4().to_string(),
        name: input.name,
        email: input.email,
        age: input.age,
        tags: input.tags,
    };
    {
        let mut contacts = store.write().map_err(|_| ApiError::internal_server_error("Store unavailable"))?;
        if contacts.iter().any(|c| c.email == contact.email) {
            return Err(ApiError::conflict(format!("Contact '{}' already exists", contact.email)));
        }
        contacts.push(contact.clone());
    }

    ctx.respond_and_log(&contact, Some(&contact.id), ResponseType::Json, Some(StatusCode::CREATED))
        .await
}

async fn avatar(ctx: RequestContext) -> Result<axum::response::Response, ApiError> {
    let id = ctx.path_param("id").and_then(|v| v.as_str()).unwrap_or_default().to_string();
    let files = ctx.files("avatar").to_vec();
    ctx.respond_and_log(&json!({ "id": id, "files": files }), Some(&id), ResponseType::Json, None)
        .await
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env if present so JWT_SECRET, APP_ENV etc. are picked up
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = declarest::config::config();
    tracing::info!("Starting declarest demo in {:?} mode", config.environment);

    let app = app(Store::default())?;

    let port = std::env::var("DECLAREST_PORT")
        .ok()
        .or_else(|| std::env::var("PORT").ok())
        .and_then(|s| s.parse::<u16>().ok())
        .unwrap_or(3000);

    let bind_addr = format!("0.0.0.0:{}", port);
    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    tracing::info!("declarest demo listening on http://{}", bind_addr);

    app.serve(listener).await
}
