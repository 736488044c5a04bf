mod common;

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use declarest::upload::{FileFieldConfig, UploadConfig};
use declarest::{ApiError, App, BodyModel, Endpoint, FieldRule, RequestContext};
use reqwest::multipart::{Form, Part};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

const MIB: usize = 1024 * 1024;

#[derive(Debug, Serialize, Deserialize)]
struct Caption {
    title: String,
}

impl BodyModel for Caption {
    fn fields() -> Vec<FieldRule> {
        vec![FieldRule::string("title").normalize("trim").validate("required")]
    }
}

async fn describe_upload(ctx: RequestContext) -> Result<axum::response::Response, ApiError> {
    let title = ctx.body::<Caption>().map(|c| c.title.clone());
    let files = ctx.files("avatar").to_vec();
    // Files are still on disk while the handler runs
    let present = files.iter().all(|f| f.path.exists());
    declarest::response::json(&json!({ "title": title, "files": files, "present": present }), None)
}

async fn echo_caption(ctx: RequestContext) -> Result<axum::response::Response, ApiError> {
    let title = ctx.body::<Caption>().map(|c| c.title.clone());
    declarest::response::json(&json!({ "title": title }), None)
}

struct Fixture {
    server: common::TestServer,
    temp_dir: tempfile::TempDir,
    keep_dir: tempfile::TempDir,
}

async fn fixture() -> Result<Fixture> {
    let temp_dir = tempfile::tempdir()?;
    let keep_dir = tempfile::tempdir()?;

    let avatar_config = UploadConfig::new().temp_path(temp_dir.path()).file_field(
        "avatar",
        FileFieldConfig::new()
            .required()
            .max_file_size(MIB as u64)
            .allowed_types(["png", "jpg"])
            .max_files(1),
    );
    let archive_config = UploadConfig::new()
        .upload_path(keep_dir.path())
        .keep_files_after_send(true)
        .max_file_size(MIB as u64);

    let app = App::with_config(common::test_config())
        .endpoint(
            Endpoint::post("avatar", "/avatar")
                .public()
                .body::<Caption>()
                .upload(avatar_config)
                .handler(describe_upload)
                .build()?,
        )?
        .endpoint(
            Endpoint::post("archive", "/archive")
                .public()
                .upload(archive_config)
                .handler(describe_upload)
                .build()?,
        )?
        .endpoint(
            Endpoint::post("caption", "/caption")
                .public()
                .body::<Caption>()
                .handler(echo_caption)
                .build()?,
        )?;

    let server = common::spawn(app).await?;
    Ok(Fixture { server, temp_dir, keep_dir })
}

fn file_part(name: &str, size: usize) -> Result<Part> {
    Ok(Part::bytes(vec![7u8; size]).file_name(name.to_string()).mime_str("image/png")?)
}

#[tokio::test]
async fn oversized_file_is_rejected_and_removed() -> Result<()> {
    let fx = fixture().await?;

    let form = Form::new()
        .text("title", "holiday")
        .part("avatar", file_part("big.png", MIB + MIB / 2)?);
    let resp = reqwest::Client::new().post(fx.server.url("/avatar")).multipart(form).send().await?;
    assert_eq!(resp.status(), StatusCode::PAYLOAD_TOO_LARGE);

    let body: Value = resp.json().await?;
    assert_eq!(body["errorCode"], "PAYLOAD_TOO_LARGE");
    assert_eq!(body["statusCode"], 413);
    assert_eq!(common::file_count(fx.temp_dir.path()), 0);
    Ok(())
}

#[tokio::test]
async fn accepted_files_reach_the_handler_and_are_cleaned_up() -> Result<()> {
    let fx = fixture().await?;

    let form = Form::new()
        .text("title", "  holiday  ")
        .part("avatar", file_part("Beach.PNG", 2048)?);
    let resp = reqwest::Client::new().post(fx.server.url("/avatar")).multipart(form).send().await?;
    assert_eq!(resp.status(), StatusCode::OK);

    let body: Value = resp.json().await?;
    assert_eq!(body["title"], "holiday");
    assert_eq!(body["present"], true);
    let file = &body["files"][0];
    assert_eq!(file["fieldName"], "avatar");
    assert_eq!(file["originalName"], "Beach.PNG");
    assert_eq!(file["extension"], "png");
    assert_eq!(file["size"], 2048);
    assert!(file["storedName"].as_str().unwrap_or_default().ends_with(".png"));

    let path = PathBuf::from(file["path"].as_str().unwrap_or_default());
    assert!(path.starts_with(fx.temp_dir.path()));

    // Deletion happens shortly after the body has been sent
    let mut removed = false;
    for _ in 0..40 {
        if !path.exists() {
            removed = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    assert!(removed, "temp upload {} was not removed", path.display());
    Ok(())
}

#[tokio::test]
async fn kept_files_stay_in_the_upload_path() -> Result<()> {
    let fx = fixture().await?;

    let form = Form::new().part("avatar", file_part("scan.jpg", 512)?);
    let resp = reqwest::Client::new().post(fx.server.url("/archive")).multipart(form).send().await?;
    assert_eq!(resp.status(), StatusCode::OK);

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(common::file_count(fx.keep_dir.path()), 1);
    Ok(())
}

#[tokio::test]
async fn field_rules_are_enforced() -> Result<()> {
    let fx = fixture().await?;
    let client = reqwest::Client::new();

    // Wrong extension
    let form = Form::new().text("title", "x").part("avatar", file_part("notes.txt", 10)?);
    let resp = client.post(fx.server.url("/avatar")).multipart(form).send().await?;
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    let body: Value = resp.json().await?;
    assert_eq!(body["errorCode"], "INVALID_REQUEST");
    assert!(body["details"]["avatar"].is_string());

    // Required file missing
    let form = Form::new().text("title", "x");
    let resp = client.post(fx.server.url("/avatar")).multipart(form).send().await?;
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

    // Too many files; the first one must not linger
    let form = Form::new()
        .text("title", "x")
        .part("avatar", file_part("a.png", 10)?)
        .part("avatar", file_part("b.png", 10)?);
    let resp = client.post(fx.server.url("/avatar")).multipart(form).send().await?;
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    assert_eq!(common::file_count(fx.temp_dir.path()), 0);

    // JSON is not accepted on an upload endpoint
    let resp = client.post(fx.server.url("/avatar")).json(&json!({"title": "x"})).send().await?;
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    let body: Value = resp.json().await?;
    assert_eq!(body["errorCode"], "UNSUPPORTED_CONTENT_TYPE");
    Ok(())
}

#[tokio::test]
async fn body_failures_after_upload_remove_files() -> Result<()> {
    let fx = fixture().await?;

    let form = Form::new().text("title", "   ").part("avatar", file_part("ok.png", 64)?);
    let resp = reqwest::Client::new().post(fx.server.url("/avatar")).multipart(form).send().await?;
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    let body: Value = resp.json().await?;
    assert_eq!(body["details"]["title"], "This field is required");
    assert_eq!(common::file_count(fx.temp_dir.path()), 0);
    Ok(())
}

#[tokio::test]
async fn files_on_a_body_only_endpoint_are_not_configured() -> Result<()> {
    let fx = fixture().await?;
    let client = reqwest::Client::new();

    let form = Form::new().text("title", "x").part("attachment", file_part("a.png", 10)?);
    let resp = client.post(fx.server.url("/caption")).multipart(form).send().await?;
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    let body: Value = resp.json().await?;
    assert_eq!(body["errorCode"], "FILE_UPLOAD_NOT_CONFIGURED");

    // Scalar-only multipart forms still bind
    let form = Form::new().text("title", " plain ");
    let resp = client.post(fx.server.url("/caption")).multipart(form).send().await?;
    assert_eq!(resp.status(), StatusCode::OK);
    let body: Value = resp.json().await?;
    assert_eq!(body["title"], "plain");
    Ok(())
}
