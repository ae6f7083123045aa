//! HTTP API surface (C8): a thin typed mapping from the external interface in §6 onto the
//! page manager, plus the artifact-serving endpoints for recordings.

pub mod ws;

use std::path::{Path as FsPath, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;

use axum::extract::{Path as AxumPath, Query, State};
use axum::http::{Method, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::json;

use crate::actions::{ActionMethod, ActionRequest, Target};
use crate::error::{Result, ServiceError};
use crate::replay::{self, ReplayOptions, ReplayResult};
use crate::state::AppState;
use ws::ws_handler;

pub type ApiState = Arc<AppState>;

// ---------------------------------------------------------------------------
// Request/response bodies
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct CreatePageBody {
    name: String,
    url: String,
    description: Option<String>,
    #[serde(default = "default_create_timeout")]
    timeout: u64,
    #[serde(default = "default_true")]
    record_actions: bool,
}

fn default_create_timeout() -> u64 {
    10_000
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Deserialize)]
struct NavigateBody {
    url: String,
    #[serde(default = "default_nav_timeout")]
    timeout: u64,
    description: Option<String>,
}

fn default_nav_timeout() -> u64 {
    3_000
}

#[derive(Debug, Deserialize, Default)]
struct DescriptionBody {
    description: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ReloadBody {
    #[serde(default = "default_nav_timeout")]
    timeout: u64,
}

#[derive(Debug, Deserialize)]
struct StructureQuery {
    selector: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ActXpathBody {
    xpath: String,
    method: String,
    #[serde(default)]
    args: Vec<serde_json::Value>,
    description: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ActIdBody {
    #[serde(rename = "encodedId")]
    encoded_id: String,
    method: String,
    #[serde(default)]
    args: Vec<serde_json::Value>,
    description: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WaitBody {
    timeout: u64,
    description: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ConditionBody {
    pattern: String,
    flags: Option<String>,
    description: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SelectorBody {
    selector: String,
}

#[derive(Debug, Deserialize)]
struct ReplayBody {
    actions: Vec<crate::recorder::ActionRecord>,
    #[serde(default)]
    options: ReplayOptions,
}

// ---------------------------------------------------------------------------
// Health & pages
// ---------------------------------------------------------------------------

async fn health(State(state): State<ApiState>) -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "pages": state.manager.page_count(),
        "browserConnected": state.manager.browser_connected(),
    }))
}

async fn list_pages(State(state): State<ApiState>) -> impl IntoResponse {
    Json(state.manager.list_pages().await)
}

async fn create_page(State(state): State<ApiState>, Json(body): Json<CreatePageBody>) -> Result<Response> {
    let info = state
        .manager
        .create_page(body.name, &body.url, body.description, Some(body.timeout), body.record_actions)
        .await?;
    Ok((StatusCode::CREATED, Json(info)).into_response())
}

async fn get_page(State(state): State<ApiState>, AxumPath(id): AxumPath<String>) -> Result<Response> {
    let (info, title) = state.manager.get_page_info(&id).await?;
    Ok(Json(json!({
        "id": info.id,
        "name": info.name,
        "description": info.description,
        "url": info.url,
        "createdAt": info.created_at,
        "consoleLogPath": info.console_log_path,
        "title": title,
    }))
    .into_response())
}

async fn delete_page(State(state): State<ApiState>, AxumPath(id): AxumPath<String>) -> Result<Response> {
    state.manager.close_page(&id).await?;
    Ok(Json(json!({"success": true})).into_response())
}

async fn navigate(
    State(state): State<ApiState>,
    AxumPath(id): AxumPath<String>,
    Json(body): Json<NavigateBody>,
) -> Result<Response> {
    let url = state
        .manager
        .navigate(&id, &body.url, Some(body.timeout), body.description)
        .await?;
    Ok(Json(json!({"success": true, "url": url})).into_response())
}

async fn navigate_back(
    State(state): State<ApiState>,
    AxumPath(id): AxumPath<String>,
    body: Option<Json<DescriptionBody>>,
) -> Result<Response> {
    let description = body.map(|b| b.0.description).unwrap_or_default();
    let url = state.manager.navigate_back(&id, description).await?;
    Ok(Json(json!({"success": true, "url": url})).into_response())
}

async fn navigate_forward(
    State(state): State<ApiState>,
    AxumPath(id): AxumPath<String>,
    body: Option<Json<DescriptionBody>>,
) -> Result<Response> {
    let description = body.map(|b| b.0.description).unwrap_or_default();
    let url = state.manager.navigate_forward(&id, description).await?;
    Ok(Json(json!({"success": true, "url": url})).into_response())
}

async fn reload(
    State(state): State<ApiState>,
    AxumPath(id): AxumPath<String>,
    body: Option<Json<ReloadBody>>,
) -> Result<Response> {
    let timeout = body.map(|b| b.0.timeout).unwrap_or_else(default_nav_timeout);
    let url = state.manager.reload(&id, Some(timeout)).await?;
    Ok(Json(json!({"success": true, "url": url})).into_response())
}

async fn structure(
    State(state): State<ApiState>,
    AxumPath(id): AxumPath<String>,
    Query(query): Query<StructureQuery>,
) -> Result<Response> {
    let result = state.manager.structure(&id, query.selector.as_deref()).await?;
    Ok(Json(result).into_response())
}

async fn act_xpath(
    State(state): State<ApiState>,
    AxumPath(id): AxumPath<String>,
    Json(body): Json<ActXpathBody>,
) -> Result<Response> {
    let method: ActionMethod = body.method.parse()?;
    let req = ActionRequest {
        target: Target::Xpath(body.xpath),
        method,
        args: body.args,
        description: body.description,
        settle_timeout_ms: None,
    };
    let outcome = state.manager.act(&id, req).await?;
    Ok(Json(json!({"success": outcome.success})).into_response())
}

async fn act_id(
    State(state): State<ApiState>,
    AxumPath(id): AxumPath<String>,
    Json(body): Json<ActIdBody>,
) -> Result<Response> {
    let method: ActionMethod = body.method.parse()?;
    let req = ActionRequest {
        target: Target::EncodedId(body.encoded_id),
        method,
        args: body.args,
        description: body.description,
        settle_timeout_ms: None,
    };
    let outcome = state.manager.act(&id, req).await?;
    Ok(Json(json!({"success": outcome.success})).into_response())
}

async fn wait(
    State(state): State<ApiState>,
    AxumPath(id): AxumPath<String>,
    Json(body): Json<WaitBody>,
) -> Result<Response> {
    state.manager.wait(&id, body.timeout, body.description).await?;
    Ok(Json(json!({"success": true})).into_response())
}

async fn condition(
    State(state): State<ApiState>,
    AxumPath(id): AxumPath<String>,
    Json(body): Json<ConditionBody>,
) -> Result<Response> {
    let matched = state
        .manager
        .condition(&id, &body.pattern, body.flags.as_deref(), body.description)
        .await?;
    Ok(Json(json!({"matched": matched})).into_response())
}

async fn screenshot(State(state): State<ApiState>, AxumPath(id): AxumPath<String>) -> Result<Response> {
    let png = state.manager.screenshot(&id).await?;
    Ok(([("content-type", "image/png")], png).into_response())
}

async fn xpath_for(
    State(state): State<ApiState>,
    AxumPath((id, encoded_id)): AxumPath<(String, String)>,
) -> Result<Response> {
    let xpath = state.manager.xpath_for(&id, &encoded_id).await?;
    Ok(Json(json!({"xpath": xpath})).into_response())
}

async fn get_list_html(
    State(state): State<ApiState>,
    AxumPath(id): AxumPath<String>,
    Json(body): Json<SelectorBody>,
) -> Result<Response> {
    let (list_file, count) = state.manager.get_list_html(&id, &body.selector, None).await?;
    Ok(Json(json!({"success": true, "listFile": list_file, "count": count})).into_response())
}

async fn get_list_html_by_parent(
    State(state): State<ApiState>,
    AxumPath(id): AxumPath<String>,
    Json(body): Json<SelectorBody>,
) -> Result<Response> {
    let (list_file, count) = state
        .manager
        .get_list_html_by_parent(&id, &body.selector, None)
        .await?;
    Ok(Json(json!({"success": true, "listFile": list_file, "count": count})).into_response())
}

async fn get_element_html(
    State(state): State<ApiState>,
    AxumPath(id): AxumPath<String>,
    Json(body): Json<SelectorBody>,
) -> Result<Response> {
    let element_file = state.manager.get_element_html(&id, &body.selector, None).await?;
    Ok(Json(json!({"success": true, "elementFile": element_file})).into_response())
}

async fn delete_action(
    State(state): State<ApiState>,
    AxumPath((id, idx)): AxumPath<(String, usize)>,
) -> Result<Response> {
    state.manager.delete_action(&id, idx).await?;
    Ok(Json(json!({"success": true})).into_response())
}

async fn delete_records(State(state): State<ApiState>, AxumPath(id): AxumPath<String>) -> Result<Response> {
    state.manager.delete_all_records(&id).await?;
    Ok(Json(json!({"success": true})).into_response())
}

// ---------------------------------------------------------------------------
// Recordings
// ---------------------------------------------------------------------------

async fn list_recordings(State(state): State<ApiState>) -> Result<Response> {
    let summaries = state.manager.list_recordings()?;
    Ok(Json(summaries).into_response())
}

async fn get_recording(State(state): State<ApiState>, AxumPath(id): AxumPath<String>) -> Result<Response> {
    match state.manager.read_recording(&id) {
        Ok((file, base_path, data_path)) => Ok(Json(json!({
            "id": file.id,
            "name": file.name,
            "description": file.description,
            "actions": file.actions,
            "basePath": base_path.display().to_string(),
            "dataPath": data_path.display().to_string(),
        }))
        .into_response()),
        Err(ServiceError::RecordingNotFound(_)) => Ok(Json(json!({
            "recordingEnabled": false,
            "message": "no recording exists for this page id",
        }))
        .into_response()),
        Err(e) => Err(e),
    }
}

/// Only `<digits>-<suffix>` filenames are servable, and the resolved path must stay within
/// the recording's own `data/` directory — no `..` traversal out of it.
fn resolve_artifact_path(data_dir: &FsPath, filename: &str) -> Result<PathBuf> {
    let valid_shape = filename
        .split_once('-')
        .map(|(digits, suffix)| {
            !digits.is_empty()
                && digits.chars().all(|c| c.is_ascii_digit())
                && !suffix.is_empty()
                && !suffix.contains('/')
                && !suffix.contains("..")
        })
        .unwrap_or(false);
    if !valid_shape {
        return Err(ServiceError::Forbidden(format!("unrecognized artifact filename: {filename}")));
    }
    let resolved = data_dir.join(filename);
    let canonical_data_dir = data_dir
        .canonicalize()
        .map_err(|e| ServiceError::FilesystemError(e.to_string()))?;
    let canonical_resolved = resolved
        .canonicalize()
        .map_err(|_| ServiceError::RecordingNotFound(filename.to_string()))?;
    if !canonical_resolved.starts_with(&canonical_data_dir) {
        return Err(ServiceError::Forbidden("artifact path escapes recording directory".to_string()));
    }
    Ok(canonical_resolved)
}

async fn recording_file(
    State(state): State<ApiState>,
    AxumPath((id, filename)): AxumPath<(String, String)>,
) -> Result<Response> {
    let data_dir = state.manager.page_recorder_dir(&id).join("data");
    let path = resolve_artifact_path(&data_dir, &filename)?;
    let bytes = std::fs::read(&path).map_err(|e| ServiceError::FilesystemError(e.to_string()))?;
    Ok(bytes.into_response())
}

async fn recording_data(
    State(state): State<ApiState>,
    AxumPath((id, filename)): AxumPath<(String, String)>,
) -> Result<Response> {
    let data_dir = state.manager.page_recorder_dir(&id).join("data");
    let path = resolve_artifact_path(&data_dir, &filename)?;
    let bytes = std::fs::read(&path).map_err(|e| ServiceError::FilesystemError(e.to_string()))?;
    let content_type = if filename.ends_with("list.json") {
        "application/json"
    } else if filename.ends_with("element.html") {
        "text/html"
    } else {
        "application/octet-stream"
    };
    Ok(([("content-type", content_type)], bytes).into_response())
}

async fn replay_handler(State(state): State<ApiState>, Json(body): Json<ReplayBody>) -> Json<ReplayResult> {
    Json(replay::replay(&state.manager, &body.actions, body.options).await)
}

// ---------------------------------------------------------------------------
// Request timing middleware
// ---------------------------------------------------------------------------

async fn request_timing_middleware(request: axum::extract::Request, next: Next) -> Response {
    let method = request.method().clone();
    let path = request.uri().path().to_string();
    let started = SystemTime::now();

    let response = next.run(request).await;

    let duration_ms = SystemTime::now()
        .duration_since(started)
        .unwrap_or_default()
        .as_millis();
    let status = response.status();
    if status.is_server_error() {
        tracing::error!(%method, %path, %status, duration_ms, "request failed");
    } else {
        tracing::debug!(%method, %path, %status, duration_ms, "request completed");
    }
    response
}

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

fn router(state: ApiState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/ws", get(ws_handler))
        .route("/api/pages", get(list_pages).post(create_page))
        .route("/api/pages/:id", get(get_page).delete(delete_page))
        .route("/api/pages/:id/navigate", post(navigate))
        .route("/api/pages/:id/navigate-back", post(navigate_back))
        .route("/api/pages/:id/navigate-forward", post(navigate_forward))
        .route("/api/pages/:id/reload", post(reload))
        .route("/api/pages/:id/structure", get(structure))
        .route("/api/pages/:id/act-xpath", post(act_xpath))
        .route("/api/pages/:id/act-id", post(act_id))
        .route("/api/pages/:id/wait", post(wait))
        .route("/api/pages/:id/condition", post(condition))
        .route("/api/pages/:id/screenshot", get(screenshot))
        .route("/api/pages/:id/xpath/:encoded_id", get(xpath_for))
        .route("/api/pages/:id/get-list-html", post(get_list_html))
        .route("/api/pages/:id/get-list-html-by-parent", post(get_list_html_by_parent))
        .route("/api/pages/:id/get-element-html", post(get_element_html))
        .route("/api/pages/:id/actions/:idx", delete(delete_action))
        .route("/api/pages/:id/records", delete(delete_records))
        .route("/api/recordings", get(list_recordings))
        .route("/api/recordings/:id", get(get_recording))
        .route("/api/recordings/:id/files/:filename", get(recording_file))
        .route("/api/recordings/:id/data/:filename", get(recording_data))
        .route("/api/replay", post(replay_handler))
        .with_state(state)
}

/// Build the full API app: router, request-timing middleware, concurrency cap, CORS.
pub fn app(state: ApiState) -> Router {
    use tower::limit::ConcurrencyLimitLayer;
    let cors_origin = state.config.cors_origin.clone();
    router(state)
        .layer(middleware::from_fn(request_timing_middleware))
        .layer(ConcurrencyLimitLayer::new(32))
        .layer(
            tower_http::cors::CorsLayer::new()
                .allow_origin(cors_origin.parse::<axum::http::HeaderValue>().map(|v| {
                    tower_http::cors::AllowOrigin::exact(v)
                }).unwrap_or(tower_http::cors::AllowOrigin::any()))
                .allow_methods([Method::GET, Method::POST, Method::DELETE])
                .allow_headers([axum::http::header::CONTENT_TYPE]),
        )
}

pub async fn run_server(state: ApiState, port: u16) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{port}")).await?;
    tracing::info!(port, "simplepage control plane listening");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tower::ServiceExt;

    fn test_state() -> ApiState {
        let config = crate::config::ServiceConfig {
            port: 0,
            headless: true,
            user_data_dir: std::env::temp_dir().join("simplepage-test-ud"),
            screenshot: false,
            recordings_root: std::env::temp_dir(),
            cors_origin: "*".to_string(),
        };
        Arc::new(AppState::new(config))
    }

    #[tokio::test]
    async fn health_reports_zero_pages_initially() {
        let app = app(test_state());
        let response = app
            .oneshot(
                axum::http::Request::builder()
                    .uri("/health")
                    .body(axum::body::Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let value: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(value["pages"], 0);
    }

    #[tokio::test]
    async fn unknown_page_returns_404() {
        let app = app(test_state());
        let response = app
            .oneshot(
                axum::http::Request::builder()
                    .uri("/api/pages/does-not-exist")
                    .body(axum::body::Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[test]
    fn artifact_filename_shape_rejects_traversal() {
        let err = resolve_artifact_path(FsPath::new("/tmp/definitely-missing-dir"), "../etc/passwd").unwrap_err();
        assert!(matches!(err, ServiceError::Forbidden(_)));
    }

    #[test]
    fn artifact_filename_shape_requires_leading_digits() {
        let err = resolve_artifact_path(FsPath::new("/tmp/definitely-missing-dir"), "structure.txt").unwrap_err();
        assert!(matches!(err, ServiceError::Forbidden(_)));
    }
}
