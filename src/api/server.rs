use std::sync::Arc;

use axum::body::Body;
use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{Path, Query, State};
use axum::http::{header, HeaderValue, Method, StatusCode};
use axum::response::{Html, IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use bytes::Bytes;
use chrono::{DateTime, NaiveDate, NaiveDateTime, TimeDelta, Utc};
use rust_embed::Embed;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::config::HttpConfig;
use crate::controller::{PipelineController, PipelineState};
use crate::storage::{CameraPatch, CameraRegistry, DailyReport, MetricsHistory, NewCamera};
use crate::videos::VideoLibrary;

use super::broadcast::MetricsBroadcaster;
use super::error::ApiError;
use super::{mjpeg, ws};

const DEFAULT_HISTORY_DAYS: i64 = 7;

#[derive(Embed)]
#[folder = "src/assets/"]
struct Assets;

#[derive(Clone)]
pub struct StreamSettings {
    pub boundary: Arc<str>,
    /// Sent on `/video_feed` while no pipeline is running.
    pub placeholder: Bytes,
}

#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<CameraRegistry>,
    pub controller: PipelineController,
    pub broadcaster: Arc<MetricsBroadcaster>,
    pub history: Arc<MetricsHistory>,
    pub videos: Arc<VideoLibrary>,
    pub stream: StreamSettings,
}

pub fn router(state: AppState, cors_origins: &[String]) -> Router {
    Router::new()
        .route("/", get(index_handler))
        .route("/assets/{*path}", get(static_handler))
        .route("/health", get(health_handler))
        .route("/api/status", get(status_handler))
        .route("/api/cameras", get(list_cameras).post(create_camera))
        .route(
            "/api/cameras/{id}",
            get(get_camera).patch(update_camera).delete(delete_camera),
        )
        .route("/api/cameras/{id}/select", post(select_camera))
        .route("/api/videos", get(list_videos))
        .route("/api/videos/select", post(select_video))
        .route("/api/pipeline/stop", post(stop_pipeline))
        .route("/api/metrics/realtime", get(realtime_metrics))
        .route("/api/metrics/history", get(metrics_history))
        .route("/api/reports/generate", post(generate_report))
        .route("/video_feed", get(video_feed))
        .route("/ws", get(ws_handler))
        .layer(cors_layer(cors_origins))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

fn cors_layer(origins: &[String]) -> CorsLayer {
    let layer = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST, Method::PATCH, Method::DELETE])
        .allow_headers(Any);

    if origins.iter().any(|o| o == "*") {
        return layer.allow_origin(Any);
    }
    let origins: Vec<HeaderValue> = origins
        .iter()
        .filter_map(|o| match HeaderValue::from_str(o) {
            Ok(v) => Some(v),
            Err(_) => {
                tracing::warn!(origin = %o, "ignoring invalid CORS origin");
                None
            }
        })
        .collect();
    layer.allow_origin(AllowOrigin::list(origins))
}

pub async fn start_server(state: AppState, config: &HttpConfig) -> Result<(), std::io::Error> {
    let app = router(state, &config.cors_origins);

    let addr = std::net::SocketAddr::from(([0, 0, 0, 0], config.port));
    tracing::info!("starting HTTP server on http://{}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await
}

async fn index_handler() -> impl IntoResponse {
    match Assets::get("index.html") {
        Some(content) => Html(content.data.to_vec()).into_response(),
        None => (StatusCode::NOT_FOUND, "index.html not found").into_response(),
    }
}

async fn static_handler(Path(path): Path<String>) -> impl IntoResponse {
    match Assets::get(&path) {
        Some(content) => {
            let mime = mime_guess::from_path(&path).first_or_octet_stream();
            (
                [(header::CONTENT_TYPE, mime.as_ref())],
                content.data.to_vec(),
            )
                .into_response()
        }
        None => (StatusCode::NOT_FOUND, "not found").into_response(),
    }
}

async fn health_handler() -> impl IntoResponse {
    Json(json!({ "status": "ok", "timestamp": Utc::now() }))
}

#[derive(Serialize)]
struct StatusResponse {
    state: PipelineState,
    source: Option<String>,
    active_camera_id: Option<i64>,
}

async fn status_handler(State(state): State<AppState>) -> Result<Json<StatusResponse>, ApiError> {
    let status = state.controller.status();
    Ok(Json(StatusResponse {
        state: status.state,
        source: status.source.map(|s| s.label),
        active_camera_id: state.registry.active_id()?,
    }))
}

async fn list_cameras(State(state): State<AppState>) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.registry.snapshot()?))
}

async fn create_camera(
    State(state): State<AppState>,
    Json(body): Json<NewCamera>,
) -> Result<impl IntoResponse, ApiError> {
    let camera = state.registry.create(body)?;
    Ok((StatusCode::CREATED, Json(camera)))
}

async fn get_camera(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.registry.get(id)?))
}

async fn update_camera(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Json(patch): Json<CameraPatch>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.registry.update(id, patch)?))
}

async fn delete_camera(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<StatusCode, ApiError> {
    state.controller.delete_camera(&state.registry, id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn select_camera(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse, ApiError> {
    let camera = state.controller.select_camera(&state.registry, id).await?;
    Ok(Json(json!({
        "ok": true,
        "active_camera_id": camera.id,
        "camera": camera,
    })))
}

async fn list_videos(State(state): State<AppState>) -> impl IntoResponse {
    Json(json!({ "videos": state.videos.list() }))
}

#[derive(Deserialize)]
struct VideoSelection {
    name: Option<String>,
}

async fn select_video(
    State(state): State<AppState>,
    Json(body): Json<VideoSelection>,
) -> Result<impl IntoResponse, ApiError> {
    let name = body
        .name
        .filter(|n| !n.trim().is_empty())
        .ok_or_else(|| ApiError::BadRequest("missing 'name'".to_string()))?;
    let path = state.videos.resolve(&name)?;
    state.controller.select_video(&state.registry, &path).await?;
    Ok(Json(json!({ "ok": true, "selected": name })))
}

async fn stop_pipeline(State(state): State<AppState>) -> Result<impl IntoResponse, ApiError> {
    state.controller.deactivate(&state.registry).await?;
    Ok(Json(json!({ "ok": true })))
}

async fn realtime_metrics(State(state): State<AppState>) -> Response {
    match state.controller.outputs().latest_metrics() {
        Some(snapshot) => Json(snapshot.as_ref().clone()).into_response(),
        None => Json(json!({})).into_response(),
    }
}

#[derive(Deserialize)]
struct HistoryQuery {
    start: Option<String>,
    end: Option<String>,
}

async fn metrics_history(
    State(state): State<AppState>,
    Query(query): Query<HistoryQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let end = match query.end.as_deref() {
        Some(s) => parse_time(s)?,
        None => Utc::now(),
    };
    let start = match query.start.as_deref() {
        Some(s) => parse_time(s)?,
        None => end - TimeDelta::days(DEFAULT_HISTORY_DAYS),
    };
    if start > end {
        return Err(ApiError::BadRequest("'start' is after 'end'".to_string()));
    }

    let history = Arc::clone(&state.history);
    let entries = tokio::task::spawn_blocking(move || history.range(start, end))
        .await
        .map_err(|e| ApiError::Internal(format!("history query aborted: {e}")))??;
    Ok(Json(entries))
}

#[derive(Deserialize)]
struct ReportQuery {
    report_type: Option<String>,
    date: Option<String>,
}

#[derive(Serialize)]
struct ReportResponse {
    report_type: &'static str,
    #[serde(flatten)]
    report: DailyReport,
}

async fn generate_report(
    State(state): State<AppState>,
    Query(query): Query<ReportQuery>,
) -> Result<impl IntoResponse, ApiError> {
    match query.report_type.as_deref() {
        None | Some("daily") => {}
        Some(other) => {
            return Err(ApiError::BadRequest(format!(
                "unsupported report type '{other}'"
            )))
        }
    }
    let date = match query.date.as_deref() {
        Some(s) => NaiveDate::parse_from_str(s, "%Y-%m-%d")
            .map_err(|_| ApiError::BadRequest(format!("invalid date '{s}'")))?,
        None => Utc::now().date_naive(),
    };

    let history = Arc::clone(&state.history);
    let report = tokio::task::spawn_blocking(move || history.daily_report(date))
        .await
        .map_err(|e| ApiError::Internal(format!("report query aborted: {e}")))??;
    tracing::info!(%date, minutes = report.minutes, "daily report generated");
    Ok(Json(ReportResponse {
        report_type: "daily",
        report,
    }))
}

/// RFC 3339, or a naive date-time / date taken as UTC.
fn parse_time(value: &str) -> Result<DateTime<Utc>, ApiError> {
    if let Ok(t) = DateTime::parse_from_rfc3339(value) {
        return Ok(t.with_timezone(&Utc));
    }
    if let Ok(t) = NaiveDateTime::parse_from_str(value, "%Y-%m-%dT%H:%M:%S%.f") {
        return Ok(t.and_utc());
    }
    if let Some(t) = NaiveDate::parse_from_str(value, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
    {
        return Ok(t.and_utc());
    }
    Err(ApiError::BadRequest(format!("invalid timestamp '{value}'")))
}

async fn video_feed(State(state): State<AppState>) -> Response {
    let frames = state.controller.outputs().subscribe_frames();
    let parts = mjpeg::frame_stream(
        frames,
        state.stream.placeholder.clone(),
        Arc::clone(&state.stream.boundary),
    );
    (
        [
            (header::CONTENT_TYPE, mjpeg::content_type(&state.stream.boundary)),
            (header::CACHE_CONTROL, "no-cache, no-store".to_string()),
        ],
        Body::from_stream(parts),
    )
        .into_response()
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    let broadcaster = Arc::clone(&state.broadcaster);
    ws.on_upgrade(move |socket| ws::handle_metrics_socket(socket, broadcaster))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    use axum::body::to_bytes;
    use axum::http::Request;
    use futures_util::StreamExt;
    use serde_json::Value;
    use tower::ServiceExt;

    use crate::analytics::{ClassLabel, MinuteSummary, TrafficState};
    use crate::config::VideoConfig;
    use crate::testing::{harness, Harness};

    struct TestApp {
        app: Router,
        registry: Arc<CameraRegistry>,
        controller: PipelineController,
        history: Arc<MetricsHistory>,
        _videos: tempfile::TempDir,
    }

    fn app() -> TestApp {
        let Harness { controller, .. } = harness();
        let registry = Arc::new(CameraRegistry::in_memory().unwrap());
        let history = Arc::new(MetricsHistory::in_memory().unwrap());
        let videos_dir = tempfile::tempdir().unwrap();
        std::fs::write(videos_dir.path().join("clip.mp4"), b"fake").unwrap();
        std::fs::write(videos_dir.path().join("readme.txt"), b"x").unwrap();

        let state = AppState {
            registry: Arc::clone(&registry),
            controller: controller.clone(),
            broadcaster: Arc::new(MetricsBroadcaster::new(8)),
            history: Arc::clone(&history),
            videos: Arc::new(VideoLibrary::new(&VideoConfig {
                directory: videos_dir.path().to_path_buf(),
                extensions: vec!["mp4".to_string()],
                startup: None,
            })),
            stream: StreamSettings {
                boundary: Arc::from("frame"),
                placeholder: Bytes::from_static(&[0xFF, 0xD8, 0xFF, 0xD9]),
            },
        };
        TestApp {
            app: router(state, &["http://localhost:3000".to_string()]),
            registry,
            controller,
            history,
            _videos: videos_dir,
        }
    }

    async fn send(app: &Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let builder = Request::builder().method(method).uri(uri);
        let request = match body {
            Some(body) => builder
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        };
        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let value = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, value)
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn camera_create_select_delete_scenario() {
        let t = app();

        let (status, cam) = send(
            &t.app,
            "POST",
            "/api/cameras",
            Some(json!({"name": "Cam1", "source_url": "fake://x"})),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        let id = cam["id"].as_i64().unwrap();

        let (_, list) = send(&t.app, "GET", "/api/cameras", None).await;
        assert_eq!(list["cameras"][0]["name"], "Cam1");
        assert_eq!(list["active_camera_id"], Value::Null);

        let (status, selected) = send(&t.app, "POST", &format!("/api/cameras/{id}/select"), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(selected["active_camera_id"], id);

        let (_, list) = send(&t.app, "GET", "/api/cameras", None).await;
        assert_eq!(list["active_camera_id"], id);

        let (status, _) = send(&t.app, "DELETE", &format!("/api/cameras/{id}"), None).await;
        assert_eq!(status, StatusCode::NO_CONTENT);

        let (_, list) = send(&t.app, "GET", "/api/cameras", None).await;
        assert_eq!(list["active_camera_id"], Value::Null);
        assert!(list["cameras"].as_array().unwrap().is_empty());
        assert_eq!(t.controller.status().state, PipelineState::Idle);
    }

    #[tokio::test]
    async fn validation_and_not_found() {
        let t = app();

        let (status, body) = send(
            &t.app,
            "POST",
            "/api/cameras",
            Some(json!({"source_url": "rtsp://x"})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["detail"].as_str().unwrap().contains("name"));

        let (status, _) = send(&t.app, "GET", "/api/cameras/42", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        let (status, _) = send(&t.app, "DELETE", "/api/cameras/42", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        let (status, _) = send(&t.app, "POST", "/api/cameras/42/select", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        let (status, _) = send(&t.app, "PATCH", "/api/cameras/42", Some(json!({"name": "x"}))).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn patch_updates_fields() {
        let t = app();
        let cam = t
            .registry
            .create(NewCamera {
                name: "Cam1".into(),
                source_url: "fake://x".into(),
                ..Default::default()
            })
            .unwrap();

        let (status, body) = send(
            &t.app,
            "PATCH",
            &format!("/api/cameras/{}", cam.id),
            Some(json!({"zone_name": "North", "roi_polygon": [[0, 0], {"x": 10, "y": 0}, [10, 10]]})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["zone_name"], "North");
        assert_eq!(body["name"], "Cam1");
        assert_eq!(body["roi_polygon"][1], json!([10.0, 0.0]));

        let (status, _) = send(
            &t.app,
            "PATCH",
            &format!("/api/cameras/{}", cam.id),
            Some(json!({"name": ""})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn unreachable_camera_select_is_bad_gateway() {
        let t = app();
        let cam = t
            .registry
            .create(NewCamera {
                name: "Down".into(),
                source_url: "fail://x".into(),
                ..Default::default()
            })
            .unwrap();

        let (status, body) = send(&t.app, "POST", &format!("/api/cameras/{}/select", cam.id), None).await;
        assert_eq!(status, StatusCode::BAD_GATEWAY);
        assert!(body["detail"].is_string());
        assert_eq!(t.registry.active_id().unwrap(), None);
        assert_eq!(t.controller.status().state, PipelineState::Idle);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn videos_list_and_select() {
        let t = app();

        let (_, body) = send(&t.app, "GET", "/api/videos", None).await;
        assert_eq!(body["videos"], json!(["clip.mp4"]));

        let (status, body) = send(&t.app, "POST", "/api/videos/select", Some(json!({"name": "clip.mp4"}))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["selected"], "clip.mp4");

        let (_, status_body) = send(&t.app, "GET", "/api/status", None).await;
        assert_eq!(status_body["state"], "Running");
        assert_eq!(status_body["source"], "clip.mp4");
        assert_eq!(status_body["active_camera_id"], Value::Null);

        let (_, realtime) = send(&t.app, "GET", "/api/metrics/realtime", None).await;
        assert!(realtime["frame"].as_u64().unwrap() >= 1);

        let (status, _) = send(&t.app, "POST", "/api/videos/select", Some(json!({}))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        let (status, _) = send(&t.app, "POST", "/api/videos/select", Some(json!({"name": "../etc.mp4"}))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        let (status, _) = send(&t.app, "POST", "/api/videos/select", Some(json!({"name": "gone.mp4"}))).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, _) = send(&t.app, "POST", "/api/pipeline/stop", None).await;
        assert_eq!(status, StatusCode::OK);
        let (_, realtime) = send(&t.app, "GET", "/api/metrics/realtime", None).await;
        assert_eq!(realtime, json!({}));
    }

    #[tokio::test]
    async fn history_defaults_and_rejects_bad_timestamps() {
        let t = app();

        let (status, body) = send(&t.app, "GET", "/api/metrics/history", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!([]));

        let (status, _) = send(
            &t.app,
            "GET",
            "/api/metrics/history?start=2026-01-01&end=2026-01-02T00:00:00",
            None,
        )
        .await;
        assert_eq!(status, StatusCode::OK);

        let (status, _) = send(&t.app, "GET", "/api/metrics/history?start=yesterday", None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn daily_report_returns_rows_of_that_day() {
        let t = app();
        for (hour, cars) in [(0, 4), (12, 18), (23, 2)] {
            let mut counts = BTreeMap::new();
            counts.insert(ClassLabel::Car, cars);
            t.history
                .insert(&MinuteSummary {
                    timestamp: NaiveDate::from_ymd_opt(2026, 3, 1)
                        .unwrap()
                        .and_hms_opt(hour, 30, 0)
                        .unwrap()
                        .and_utc(),
                    counts,
                    traffic_state: TrafficState::Fluid,
                })
                .unwrap();
        }

        let (status, body) = send(
            &t.app,
            "POST",
            "/api/reports/generate?report_type=daily&date=2026-03-01",
            None,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["report_type"], "daily");
        assert_eq!(body["date"], "2026-03-01");
        assert_eq!(body["minutes"], 3);
        assert_eq!(body["peak_counts"]["Car"], 18);
        assert_eq!(body["entries"].as_array().unwrap().len(), 3);

        let (_, body) = send(&t.app, "POST", "/api/reports/generate?date=2026-03-02", None).await;
        assert_eq!(body["minutes"], 0);

        let (status, _) = send(&t.app, "POST", "/api/reports/generate?report_type=weekly", None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        let (status, _) = send(&t.app, "POST", "/api/reports/generate?date=03/01/2026", None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn health_and_idle_status() {
        let t = app();
        let (status, body) = send(&t.app, "GET", "/health", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");

        let (_, body) = send(&t.app, "GET", "/api/status", None).await;
        assert_eq!(body["state"], "Idle");
        assert_eq!(body["source"], Value::Null);
    }

    #[tokio::test]
    async fn video_feed_sends_placeholder_when_idle() {
        let t = app();
        let response = t
            .app
            .clone()
            .oneshot(Request::builder().uri("/video_feed").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers()[header::CONTENT_TYPE],
            "multipart/x-mixed-replace; boundary=frame"
        );

        let mut body = response.into_body().into_data_stream();
        let first = body.next().await.unwrap().unwrap();
        assert!(first.starts_with(b"--frame\r\nContent-Type: image/jpeg\r\n"));
        assert!(first.ends_with(&[0xFF, 0xD8, 0xFF, 0xD9, b'\r', b'\n']));
    }

    #[test]
    fn timestamp_formats() {
        assert!(parse_time("2026-03-01T08:00:00Z").is_ok());
        assert!(parse_time("2026-03-01T08:00:00+02:00").is_ok());
        assert!(parse_time("2026-03-01T08:00:00.5").is_ok());
        assert!(parse_time("2026-03-01").is_ok());
        assert!(parse_time("03/01/2026").is_err());
    }
}
