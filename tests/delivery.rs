mod common;

use common::{
    FakeExtractor, MERGED_PAYLOAD, TestApp, manifest_catalog, mp4_bytes, single_format_catalog,
    start_upstream,
};
use reqwest::StatusCode;
use serde_json::Value;

const PAGE_URL: &str = "https://video.example/watch?v=abc123";

#[tokio::test]
async fn empty_url_is_a_bad_request() {
    let app = TestApp::start(FakeExtractor::new(manifest_catalog(), true), true).await;

    let response = reqwest::Client::new()
        .post(app.url("/api/info"))
        .json(&serde_json::json!({ "url": "  " }))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body: Value = response.json().await.unwrap();
    assert!(body["error"].as_str().is_some_and(|message| !message.is_empty()));
}

#[tokio::test]
async fn malformed_info_body_gets_the_json_error_shape() {
    let app = TestApp::start(FakeExtractor::new(manifest_catalog(), true), true).await;

    let response = reqwest::Client::new()
        .post(app.url("/api/info"))
        .header("content-type", "application/json")
        .body("not json")
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["code"], "INVALID_REQUEST");
    assert!(
        body["error"]
            .as_str()
            .is_some_and(|message| message.starts_with("Invalid request body"))
    );
    assert_eq!(app.download_calls(), 0);
}

#[tokio::test]
async fn single_progressive_format_is_streamed_directly() {
    let upstream = start_upstream().await;
    let catalog = single_format_catalog(&format!("http://{upstream}/clip.mp4"));
    let app = TestApp::start(FakeExtractor::new(catalog, true), true).await;

    let response = reqwest::get(format!(
        "{}?url={}&quality=720p",
        app.url("/api/download"),
        urlencoding::encode(PAGE_URL)
    ))
    .await
    .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let headers = response.headers().clone();
    let disposition = headers["content-disposition"].to_str().unwrap();
    assert!(disposition.contains("Sunset_ over_the bay.mp4"));
    assert_eq!(headers["content-type"], "video/mp4");
    assert_eq!(headers["x-delivery"], "direct");
    assert_eq!(headers["x-format-id"], "18");
    assert_eq!(headers["x-video-codec"], "avc1.42001E");

    let body = response.bytes().await.unwrap();
    assert_eq!(body.as_ref(), mp4_bytes(96 * 1024).as_slice());
    assert_eq!(app.download_calls(), 0);
}

#[tokio::test]
async fn manifest_only_catalog_without_remux_tool_answers_503() {
    let app = TestApp::start(FakeExtractor::new(manifest_catalog(), true), false).await;

    let response = reqwest::get(format!(
        "{}?url={}",
        app.url("/api/download"),
        urlencoding::encode(PAGE_URL)
    ))
    .await
    .unwrap();

    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    let body: Value = response.json().await.unwrap();
    assert!(body["error"].as_str().unwrap().contains("locally"));
    assert_eq!(app.download_calls(), 0);
    assert!(app.wait_for_empty_transfer_dir().await);
}

#[tokio::test]
async fn forbidden_direct_link_is_served_through_local_remux() {
    let upstream = start_upstream().await;
    let catalog = single_format_catalog(&format!("http://{upstream}/signed.mp4"));
    let app = TestApp::start(FakeExtractor::new(catalog, true), true).await;

    let response = reqwest::get(format!(
        "{}?url={}",
        app.url("/api/download"),
        urlencoding::encode(PAGE_URL)
    ))
    .await
    .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()["x-delivery"], "remux");
    assert_eq!(
        response.headers()["content-length"],
        MERGED_PAYLOAD.len().to_string().as_str()
    );
    let body = response.bytes().await.unwrap();
    assert_eq!(body.as_ref(), MERGED_PAYLOAD);
    assert_eq!(app.download_calls(), 1);
    assert!(app.wait_for_empty_transfer_dir().await);
}

#[tokio::test]
async fn failed_fallback_after_forbidden_gets_actionable_advice() {
    let upstream = start_upstream().await;
    let catalog = single_format_catalog(&format!("http://{upstream}/signed.mp4"));
    let app = TestApp::start(FakeExtractor::new(catalog, false), true).await;

    let response = reqwest::get(format!(
        "{}?url={}",
        app.url("/api/download"),
        urlencoding::encode(PAGE_URL)
    ))
    .await
    .unwrap();

    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    assert!(response.headers().contains_key("retry-after"));
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["code"], "UPSTREAM_FORBIDDEN");
    assert_eq!(app.download_calls(), 2);
    assert!(app.wait_for_empty_transfer_dir().await);
}

#[tokio::test]
async fn info_reports_qualities_and_remux_need() {
    let app = TestApp::start(FakeExtractor::new(manifest_catalog(), true), true).await;

    let response = reqwest::Client::new()
        .post(app.url("/api/info"))
        .json(&serde_json::json!({ "url": PAGE_URL }))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["title"], "Live replay");
    assert_eq!(body["qualities"], serde_json::json!(["720p"]));
    assert_eq!(body["ext"], "mp4");
    assert!(body["direct_url"].is_null());
}

#[tokio::test]
async fn health_lists_capabilities() {
    let app = TestApp::start(FakeExtractor::new(manifest_catalog(), true), false).await;

    let body: Value = reqwest::get(app.url("/api/health"))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["status"], "ok");
    assert_eq!(body["remux_available"], false);
    assert_eq!(body["extractor"], "fake");
}
