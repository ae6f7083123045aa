//! Integration tests for the local HTTP API: health, page lifecycle error paths, recordings
//! listing, and replay against an empty trace.

use std::sync::Arc;

use axum::http::StatusCode;
use simplepage_lib::api::{app, ApiState};
use simplepage_lib::config::ServiceConfig;
use simplepage_lib::state::AppState;
use tower::ServiceExt;

fn make_state() -> ApiState {
    let config = ServiceConfig {
        port: 0,
        headless: true,
        user_data_dir: std::env::temp_dir().join("simplepage-it-ud"),
        screenshot: false,
        recordings_root: tempfile::tempdir().unwrap().into_path(),
        cors_origin: "*".to_string(),
    };
    Arc::new(AppState::new(config))
}

fn make_app() -> axum::Router {
    app(make_state())
}

fn json_body(val: &serde_json::Value) -> axum::body::Body {
    axum::body::Body::from(serde_json::to_vec(val).unwrap())
}

#[tokio::test]
async fn health_reports_idle_state() {
    let app = make_app();
    let req = axum::http::Request::builder()
        .uri("/health")
        .body(axum::body::Body::empty())
        .unwrap();
    let res = app.oneshot(req).await.unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let body = axum::body::to_bytes(res.into_body(), usize::MAX).await.unwrap();
    let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(json["pages"], 0);
    assert_eq!(json["browserConnected"], false);
}

#[tokio::test]
async fn list_pages_empty_initially() {
    let app = make_app();
    let req = axum::http::Request::builder()
        .uri("/api/pages")
        .body(axum::body::Body::empty())
        .unwrap();
    let res = app.oneshot(req).await.unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let body = axum::body::to_bytes(res.into_body(), usize::MAX).await.unwrap();
    let json: Vec<serde_json::Value> = serde_json::from_slice(&body).unwrap();
    assert!(json.is_empty());
}

#[tokio::test]
async fn get_unknown_page_is_not_found() {
    let app = make_app();
    let req = axum::http::Request::builder()
        .uri("/api/pages/does-not-exist")
        .body(axum::body::Body::empty())
        .unwrap();
    let res = app.oneshot(req).await.unwrap();
    assert_eq!(res.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn delete_unknown_page_is_not_found() {
    let app = make_app();
    let req = axum::http::Request::builder()
        .method("DELETE")
        .uri("/api/pages/does-not-exist")
        .body(axum::body::Body::empty())
        .unwrap();
    let res = app.oneshot(req).await.unwrap();
    assert_eq!(res.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn act_xpath_on_unknown_page_is_not_found() {
    let app = make_app();
    let body = json_body(&serde_json::json!({
        "xpath": "//button",
        "method": "click",
    }));
    let req = axum::http::Request::builder()
        .method("POST")
        .uri("/api/pages/does-not-exist/act-xpath")
        .header("content-type", "application/json")
        .body(body)
        .unwrap();
    let res = app.oneshot(req).await.unwrap();
    assert_eq!(res.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn act_xpath_rejects_unknown_method() {
    let app = make_app();
    let body = json_body(&serde_json::json!({
        "xpath": "//button",
        "method": "teleport",
    }));
    let req = axum::http::Request::builder()
        .method("POST")
        .uri("/api/pages/does-not-exist/act-xpath")
        .header("content-type", "application/json")
        .body(body)
        .unwrap();
    let res = app.oneshot(req).await.unwrap();
    assert_eq!(res.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn recordings_list_is_empty_for_a_fresh_root() {
    let app = make_app();
    let req = axum::http::Request::builder()
        .uri("/api/recordings")
        .body(axum::body::Body::empty())
        .unwrap();
    let res = app.oneshot(req).await.unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let body = axum::body::to_bytes(res.into_body(), usize::MAX).await.unwrap();
    let json: Vec<serde_json::Value> = serde_json::from_slice(&body).unwrap();
    assert!(json.is_empty());
}

#[tokio::test]
async fn get_recording_for_unknown_id_reports_disabled() {
    let app = make_app();
    let req = axum::http::Request::builder()
        .uri("/api/recordings/does-not-exist")
        .body(axum::body::Body::empty())
        .unwrap();
    let res = app.oneshot(req).await.unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let body = axum::body::to_bytes(res.into_body(), usize::MAX).await.unwrap();
    let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(json["recordingEnabled"], false);
}

#[tokio::test]
async fn replay_of_an_empty_trace_executes_nothing() {
    let app = make_app();
    let body = json_body(&serde_json::json!({"actions": []}));
    let req = axum::http::Request::builder()
        .method("POST")
        .uri("/api/replay")
        .header("content-type", "application/json")
        .body(body)
        .unwrap();
    let res = app.oneshot(req).await.unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let body = axum::body::to_bytes(res.into_body(), usize::MAX).await.unwrap();
    let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(json["executedActions"], 0);
    assert!(json["errors"].as_array().unwrap().is_empty());
}

#[tokio::test]
async fn recording_artifact_traversal_is_forbidden() {
    let app = make_app();
    let req = axum::http::Request::builder()
        .uri("/api/recordings/some-page/files/..%2f..%2fetc%2fpasswd")
        .body(axum::body::Body::empty())
        .unwrap();
    let res = app.oneshot(req).await.unwrap();
    assert!(res.status() == StatusCode::FORBIDDEN || res.status() == StatusCode::NOT_FOUND);
}
