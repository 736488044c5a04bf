mod common;

use anyhow::Result;
use declarest::{ApiError, App, Endpoint, Param, ParamType, RequestContext};
use reqwest::StatusCode;
use serde_json::{json, Value};

async fn echo_params(ctx: RequestContext) -> Result<axum::response::Response, ApiError> {
    let filter = match ctx.filter_param() {
        Some(builder) => builder.build()?.to_value(),
        None => Value::Null,
    };
    declarest::response::json(
        &json!({
            "filter": filter,
            "limit": ctx.query_param("limit").and_then(|v| v.as_i64()),
            "active": ctx.query_param("active").and_then(|v| v.as_bool()),
        }),
        None,
    )
}

async fn server() -> Result<common::TestServer> {
    let app = App::with_config(common::test_config()).endpoint(
        Endpoint::get("search", "/search")
            .public()
            .accepts(Param::query("limit", ParamType::Int))
            .accepts(Param::query("active", ParamType::Bool))
            .accepts(Param::query("filter", ParamType::Filter))
            .handler(echo_params)
            .build()?,
    )?
    .endpoint(
        Endpoint::get("raw_search", "/raw-search")
            .public()
            .accepts(Param::query("filter", ParamType::String))
            .handler(echo_params)
            .build()?,
    )?;
    common::spawn(app).await
}

#[tokio::test]
async fn filter_query_round_trips_into_a_builder() -> Result<()> {
    let server = server().await?;
    let client = reqwest::Client::new();

    let resp = client
        .get(server.url("/search"))
        .query(&[(
            "filter",
            r#"{"where":{"age":{"gt":18}},"order":"name ASC","limit":5}"#,
        )])
        .send()
        .await?;
    assert_eq!(resp.status(), StatusCode::OK);

    let body: Value = resp.json().await?;
    let filter = &body["filter"];
    assert_eq!(filter["where"], json!({"age": {"gt": 18}}));
    assert_eq!(filter["order"], json!(["name ASC"]));
    assert_eq!(filter["limit"], 5);
    assert!(filter.get("skip").is_none());
    assert!(filter.get("fields").is_none());
    Ok(())
}

#[tokio::test]
async fn bad_params_are_reported_together() -> Result<()> {
    let server = server().await?;
    let client = reqwest::Client::new();

    let resp = client
        .get(server.url("/search"))
        .query(&[("limit", "abc"), ("active", "maybe"), ("filter", "{bad json}")])
        .send()
        .await?;
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

    let body: Value = resp.json().await?;
    assert_eq!(body["statusCode"], 400);
    assert_eq!(body["errorCode"], "PARAM_ERRORS");
    let entries = body["details"].as_array().expect("details array");
    assert_eq!(entries.len(), 3);
    let names: Vec<&str> = entries.iter().filter_map(|e| e["name"].as_str()).collect();
    assert!(names.contains(&"limit"));
    assert!(names.contains(&"active"));
    assert!(names.contains(&"filter"));
    assert!(entries.iter().all(|e| e["location"] == "query"));
    Ok(())
}

#[tokio::test]
async fn bare_bool_flag_is_true_and_absent_params_are_skipped() -> Result<()> {
    let server = server().await?;

    let body: Value = reqwest::get(server.url("/search?active")).await?.json().await?;
    assert_eq!(body["active"], true);
    assert_eq!(body["limit"], Value::Null);
    assert_eq!(body["filter"], Value::Null);
    Ok(())
}

#[tokio::test]
async fn raw_filter_strings_are_parsed_by_the_pipeline() -> Result<()> {
    let server = server().await?;
    let client = reqwest::Client::new();

    let resp = client
        .get(server.url("/raw-search"))
        .query(&[("filter", r#"{"limit":3,"skip":6}"#)])
        .send()
        .await?;
    assert_eq!(resp.status(), StatusCode::OK);
    let body: Value = resp.json().await?;
    assert_eq!(body["filter"], json!({"limit": 3, "skip": 6}));

    let resp = client
        .get(server.url("/raw-search"))
        .query(&[("filter", r#"{"fields":{"name":true,"email":false}}"#)])
        .send()
        .await?;
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    let body: Value = resp.json().await?;
    assert_eq!(body["errorCode"], "FILTER_CANNOT_MIX_INCLUSION_EXCLUSION");
    Ok(())
}
