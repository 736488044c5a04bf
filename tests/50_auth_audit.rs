mod common;

use std::sync::{Arc, Mutex};

use anyhow::Result;
use async_trait::async_trait;
use declarest::auth::{issue_token, Claims, JwtAuthorizer};
use declarest::response::{AuditHandler, AuditRecord};
use declarest::{ApiError, App, Endpoint, RequestContext, ResponseType};
use reqwest::StatusCode;
use serde_json::{json, Value};

#[derive(Clone, Default)]
struct Recorder {
    records: Arc<Mutex<Vec<AuditRecord>>>,
    fail: bool,
}

#[async_trait]
impl AuditHandler for Recorder {
    async fn record(&self, ctx: &RequestContext, _response: &Value, affected_id: Option<&str>) -> anyhow::Result<()> {
        if self.fail {
            anyhow::bail!("audit store offline");
        }
        self.records
            .lock()
            .map_err(|_| anyhow::anyhow!("poisoned"))?
            .push(AuditRecord::from_context(ctx, affected_id));
        Ok(())
    }
}

async fn create_widget(ctx: RequestContext) -> Result<axum::response::Response, ApiError> {
    ctx.respond_and_log(
        &json!({ "id": "w-1", "owner": ctx.principal().map(|p| p.id.clone()) }),
        Some("w-1"),
        ResponseType::Json,
        Some(axum::http::StatusCode::CREATED),
    )
    .await
}

async fn server(recorder: Recorder) -> Result<common::TestServer> {
    let app = App::with_config(common::test_config())
        .authorizer(JwtAuthorizer::new(common::JWT_SECRET))
        .audit_handler(recorder)
        .endpoint(
            Endpoint::post("create_widget", "/widgets")
                .action_type("create")
                .model_name("widget")
                .roles(["admin", "editor"])
                .handler(create_widget)
                .build()?,
        )?
        .endpoint(
            Endpoint::post("quiet_widget", "/widgets/quiet")
                .audit_disabled()
                .handler(create_widget)
                .build()?,
        )?;
    common::spawn(app).await
}

fn bearer(user: &str, role: &str) -> Result<String> {
    let token = issue_token(&Claims::new(user, role, "staff"), common::JWT_SECRET)?;
    Ok(format!("Bearer {}", token))
}

#[tokio::test]
async fn private_endpoints_need_a_valid_token() -> Result<()> {
    let server = server(Recorder::default()).await?;
    let client = reqwest::Client::new();

    let resp = client.post(server.url("/widgets")).send().await?;
    assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    let body: Value = resp.json().await?;
    assert_eq!(body["errorCode"], "UNAUTHORIZED");

    let resp = client
        .post(server.url("/widgets"))
        .header("authorization", "Bearer not.a.token")
        .send()
        .await?;
    assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);

    let resp = client
        .post(server.url("/widgets"))
        .header("authorization", bearer("u-2", "viewer")?)
        .send()
        .await?;
    assert_eq!(resp.status(), StatusCode::FORBIDDEN);
    Ok(())
}

#[tokio::test]
async fn respond_and_log_records_an_audit_entry() -> Result<()> {
    let recorder = Recorder::default();
    let server = server(recorder.clone()).await?;
    let client = reqwest::Client::new();

    let resp = client
        .post(server.url("/widgets"))
        .header("authorization", bearer("u-1", "editor")?)
        .header("x-forwarded-for", "203.0.113.9")
        .send()
        .await?;
    assert_eq!(resp.status(), StatusCode::CREATED);
    let body: Value = resp.json().await?;
    assert_eq!(body["owner"], "u-1");

    let records = recorder.records.lock().map_err(|_| anyhow::anyhow!("poisoned"))?.clone();
    assert_eq!(records.len(), 1);
    let record = &records[0];
    assert_eq!(record.endpoint, "create_widget");
    assert_eq!(record.action_type.as_deref(), Some("create"));
    assert_eq!(record.model_name.as_deref(), Some("widget"));
    assert_eq!(record.principal_id.as_deref(), Some("u-1"));
    assert_eq!(record.affected_id.as_deref(), Some("w-1"));
    assert_eq!(record.remote_ip, "203.0.113.9");
    assert_eq!(record.path, "/widgets");
    Ok(())
}

#[tokio::test]
async fn audit_disabled_endpoints_skip_the_handler() -> Result<()> {
    let recorder = Recorder::default();
    let server = server(recorder.clone()).await?;

    let resp = reqwest::Client::new()
        .post(server.url("/widgets/quiet"))
        .header("authorization", bearer("u-1", "admin")?)
        .send()
        .await?;
    assert_eq!(resp.status(), StatusCode::CREATED);
    assert!(recorder.records.lock().map_err(|_| anyhow::anyhow!("poisoned"))?.is_empty());
    Ok(())
}

#[tokio::test]
async fn audit_failures_do_not_block_the_response() -> Result<()> {
    let recorder = Recorder {
        fail: true,
        ..Recorder::default()
    };
    let server = server(recorder).await?;

    let resp = reqwest::Client::new()
        .post(server.url("/widgets"))
        .header("authorization", bearer("u-1", "admin")?)
        .send()
        .await?;
    assert_eq!(resp.status(), StatusCode::CREATED);
    Ok(())
}
