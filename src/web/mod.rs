/// HTTP control plane: status, DVR config fetch, recorder control and the
/// mediamtx on-demand hooks, plus the static dashboard assets.
///
/// Errors go out as `{error, kind, detail}`; anything DVR-side maps to
/// 503 so the dashboard can show a degraded state instead of breaking.
use std::collections::HashMap;
use std::path::Path as FsPath;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::{Path, State};
use axum::http::{header, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use serde_json::{json, Value};
use tokio::sync::{mpsc, watch};
use tracing::{info, warn};

use crate::config::BridgeConfig;
use crate::error::DvrError;
use crate::protocol::client::{Credentials, DvrClient};
use crate::services::ingest::IngestManager;
use crate::services::manager::BridgeState;
use crate::services::recorder::{self, RecorderCommand, RecordingEntry};

/// DVR configuration blocks addressable through GetCfg.
pub const CONFIG_TYPES: &[(u16, &str)] = &[
    (101, "Network"),
    (103, "Network Services"),
    (105, "Display / OSD"),
    (107, "Encoding"),
    (109, "Record Schedule"),
    (111, "System Time"),
    (115, "Decoder / Serial"),
    (117, "Alarm"),
    (121, "Users"),
    (123, "Device Info"),
    (125, "Device Config"),
    (127, "Storage"),
    (129, "Device Status"),
    (131, "Maintenance"),
    (133, "Custom Settings"),
    (139, "Source Device"),
    (221, "Storage (Extended)"),
];

const CONFIG_CACHE_TTL: Duration = Duration::from_secs(30);

pub struct AppState {
    pub cfg: BridgeConfig,
    pub bridge: Arc<BridgeState>,
    pub ingest: IngestManager,
    pub recorder_tx: mpsc::Sender<RecorderCommand>,
    pub config_client: ConfigFetcher,
}

type Ctx = State<Arc<AppState>>;

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/status", get(status))
        .route("/api/config-types", get(config_types))
        .route("/api/config/:mc", get(config_xml))
        .route("/api/recordings", get(recordings))
        .route("/api/recordings/status", get(recordings_status))
        .route("/api/recordings/start", post(recordings_start))
        .route("/api/recordings/stop", post(recordings_stop))
        .route("/api/recordings/delete-all", post(recordings_delete_all))
        .route("/api/recordings/:channel/:filename", delete(recording_delete))
        .route("/api/hooks/:path/start", post(hook_start))
        .route("/api/hooks/:path/stop", post(hook_stop))
        .fallback(static_assets)
        .with_state(state)
}

pub async fn serve(
    state: Arc<AppState>,
    mut shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let addr = format!("0.0.0.0:{}", state.cfg.web_port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!(%addr, "HTTP API listening");
    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move {
            let _ = shutdown.changed().await;
        })
        .await?;
    Ok(())
}

// ── Error mapping ──────────────────────────────────────────────────────

#[derive(Debug)]
struct ApiError {
    status: StatusCode,
    error: String,
    kind: &'static str,
    detail: String,
}

impl ApiError {
    fn not_found(detail: impl Into<String>) -> Self {
        ApiError {
            status: StatusCode::NOT_FOUND,
            error: "not found".to_string(),
            kind: "NotFound",
            detail: detail.into(),
        }
    }

    fn bad_request(detail: impl Into<String>) -> Self {
        ApiError {
            status: StatusCode::BAD_REQUEST,
            error: "bad request".to_string(),
            kind: "BadRequest",
            detail: detail.into(),
        }
    }

    fn unavailable(detail: impl Into<String>) -> Self {
        ApiError {
            status: StatusCode::SERVICE_UNAVAILABLE,
            error: "service unavailable".to_string(),
            kind: "Unavailable",
            detail: detail.into(),
        }
    }

    fn from_dvr(e: DvrError) -> Self {
        ApiError {
            status: StatusCode::SERVICE_UNAVAILABLE,
            error: "DVR unreachable".to_string(),
            kind: e.kind(),
            detail: e.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (
            self.status,
            Json(json!({
                "error": self.error,
                "kind": self.kind,
                "detail": self.detail,
            })),
        )
            .into_response()
    }
}

// ── Handlers ───────────────────────────────────────────────────────────

async fn status(State(ctx): Ctx) -> Json<Value> {
    let channels: Vec<Value> = (0..ctx.cfg.channels)
        .map(|ch| {
            json!({
                "id": ch,
                "streaming": ctx.bridge.channel_streaming(ch),
            })
        })
        .collect();
    let rec = ctx.bridge.recorder_status();
    Json(json!({
        "dvr_reachable": ctx.bridge.dvr_reachable.load(std::sync::atomic::Ordering::Relaxed),
        "dvr_host": ctx.bridge.dvr_host(),
        "channels": channels,
        "recorder": {
            "armed": rec.armed,
            "channels": rec.channels,
        },
        "rtsp_paths": ctx.cfg.rtsp_paths(),
    }))
}

async fn config_types() -> Json<Value> {
    let types: Vec<Value> = CONFIG_TYPES
        .iter()
        .map(|(main_cmd, name)| json!({"main_cmd": main_cmd, "name": name}))
        .collect();
    Json(Value::Array(types))
}

async fn config_xml(State(ctx): Ctx, Path(mc): Path<u16>) -> Result<Response, ApiError> {
    if !CONFIG_TYPES.iter().any(|(id, _)| *id == mc) {
        return Err(ApiError::not_found(format!("unknown config type {mc}")));
    }
    let xml = ctx
        .config_client
        .get(mc)
        .await
        .map_err(ApiError::from_dvr)?;
    Ok((
        [(header::CONTENT_TYPE, "text/xml; charset=utf-8")],
        xml,
    )
        .into_response())
}

async fn recordings(State(ctx): Ctx) -> Json<Vec<RecordingEntry>> {
    Json(recorder::list_recordings(&ctx.cfg.record.record_dir))
}

async fn recordings_status(State(ctx): Ctx) -> Json<Value> {
    let rec = ctx.bridge.recorder_status();
    Json(json!({
        "armed": rec.armed,
        "segments_today": rec.segments_today,
        "upload_queue_len": rec.upload_queue_len,
        "disk_free_mb": rec.disk_free_mb,
    }))
}

async fn recordings_start(State(ctx): Ctx) -> Result<StatusCode, ApiError> {
    ctx.recorder_tx
        .send(RecorderCommand::Start)
        .await
        .map_err(|_| ApiError::unavailable("recorder is not running"))?;
    Ok(StatusCode::NO_CONTENT)
}

async fn recordings_stop(State(ctx): Ctx) -> Result<StatusCode, ApiError> {
    ctx.recorder_tx
        .send(RecorderCommand::Stop)
        .await
        .map_err(|_| ApiError::unavailable("recorder is not running"))?;
    Ok(StatusCode::NO_CONTENT)
}

async fn recordings_delete_all(State(ctx): Ctx) -> Json<Value> {
    let deleted = recorder::delete_all_recordings(&ctx.cfg.record.record_dir);
    Json(json!({ "deleted": deleted }))
}

async fn recording_delete(
    State(ctx): Ctx,
    Path((channel, filename)): Path<(u8, String)>,
) -> Result<StatusCode, ApiError> {
    match recorder::delete_recording(&ctx.cfg.record.record_dir, channel, &filename) {
        Ok(true) => Ok(StatusCode::NO_CONTENT),
        Ok(false) => Err(ApiError::not_found(format!("ch{channel}/{filename}"))),
        Err(e) => Err(ApiError::bad_request(e.to_string())),
    }
}

async fn hook_start(State(ctx): Ctx, Path(path): Path<String>) -> Result<StatusCode, ApiError> {
    if ctx.ingest.start(&path) {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(ApiError::not_found(format!("unknown path {path}")))
    }
}

async fn hook_stop(State(ctx): Ctx, Path(path): Path<String>) -> Result<StatusCode, ApiError> {
    if ctx.ingest.stop(&path) {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(ApiError::not_found(format!("unknown path {path}")))
    }
}

// ── Static dashboard assets ────────────────────────────────────────────

async fn static_assets(State(ctx): Ctx, uri: Uri) -> Response {
    let rel = uri.path().trim_start_matches('/');
    let rel = if rel.is_empty() { "index.html" } else { rel };
    if rel.split('/').any(|part| part.is_empty() || part == "..") {
        return (StatusCode::NOT_FOUND, "not found").into_response();
    }
    let path = ctx.cfg.web_dir.join(rel);
    match tokio::fs::read(&path).await {
        Ok(data) => ([(header::CONTENT_TYPE, mime_for(&path))], data).into_response(),
        Err(_) => (StatusCode::NOT_FOUND, "not found").into_response(),
    }
}

fn mime_for(path: &FsPath) -> &'static str {
    match path.extension().and_then(|e| e.to_str()) {
        Some("html") => "text/html; charset=utf-8",
        Some("css") => "text/css",
        Some("js") => "application/javascript",
        Some("json") => "application/json",
        Some("png") => "image/png",
        Some("svg") => "image/svg+xml",
        Some("ico") => "image/x-icon",
        _ => "application/octet-stream",
    }
}

// ── Shared GetCfg client ───────────────────────────────────────────────

/// Serialized, cached access to the DVR's configuration. One login
/// session is shared by all API callers and rebuilt once on failure.
pub struct ConfigFetcher {
    cfg: BridgeConfig,
    bridge: Arc<BridgeState>,
    client: tokio::sync::Mutex<Option<DvrClient>>,
    cache: std::sync::Mutex<HashMap<u16, (String, Instant)>>,
}

impl ConfigFetcher {
    pub fn new(cfg: BridgeConfig, bridge: Arc<BridgeState>) -> Self {
        ConfigFetcher {
            cfg,
            bridge,
            client: tokio::sync::Mutex::new(None),
            cache: std::sync::Mutex::new(HashMap::new()),
        }
    }

    pub async fn get(&self, main_cmd: u16) -> Result<String, DvrError> {
        if let Some((xml, at)) = self.cache.lock().unwrap().get(&main_cmd) {
            if at.elapsed() < CONFIG_CACHE_TTL {
                return Ok(xml.clone());
            }
        }

        let mut guard = self.client.lock().await;
        let mut last_err = DvrError::NotLoggedIn;
        for _ in 0..2 {
            if guard.is_none() {
                let host = self.bridge.dvr_host();
                if host.is_empty() {
                    return Err(DvrError::DialFailed {
                        addr: "(unset)".to_string(),
                        source: std::io::Error::new(
                            std::io::ErrorKind::NotFound,
                            "no DVR host configured or discovered",
                        ),
                    });
                }
                let creds = Credentials {
                    username: self.cfg.username.clone(),
                    password: self.cfg.password.clone(),
                };
                match DvrClient::connect(&host, self.cfg.cmd_port, creds).await {
                    Ok(client) => {
                        self.bridge.record_session_success();
                        *guard = Some(client);
                    }
                    Err(e) => {
                        self.bridge.record_session_failure();
                        return Err(e);
                    }
                }
            }

            let Some(client) = guard.as_ref() else {
                continue;
            };
            match client.get_config(main_cmd).await {
                Ok(xml) => {
                    self.cache
                        .lock()
                        .unwrap()
                        .insert(main_cmd, (xml.clone(), Instant::now()));
                    return Ok(xml);
                }
                Err(e) => {
                    warn!(main_cmd, "config fetch failed, recycling session: {e}");
                    *guard = None; // dropping the client stops its tasks
                    last_err = e;
                }
            }
        }
        Err(last_err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::test_config;

    async fn test_ctx() -> (Arc<AppState>, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = test_config();
        cfg.record.record_dir = dir.path().to_path_buf();
        let bridge = Arc::new(BridgeState::new(&cfg));
        let ingest = IngestManager::new(&cfg, bridge.clone());
        let (recorder_tx, _recorder_rx) = mpsc::channel(8);
        let config_client = ConfigFetcher::new(cfg.clone(), bridge.clone());
        let ctx = Arc::new(AppState {
            cfg,
            bridge,
            ingest,
            recorder_tx,
            config_client,
        });
        (ctx, dir)
    }

    #[tokio::test]
    async fn status_shape() {
        let (ctx, _dir) = test_ctx().await;
        ctx.bridge
            .set_streaming(1, crate::protocol::StreamType::Main, true);
        let Json(body) = status(State(ctx)).await;
        assert_eq!(body["dvr_reachable"], json!(false));
        assert_eq!(body["channels"][0]["streaming"], json!(false));
        assert_eq!(body["channels"][1]["streaming"], json!(true));
        assert_eq!(body["rtsp_paths"][0], json!("ch0"));
        assert!(body["recorder"]["armed"].is_boolean());
    }

    #[tokio::test]
    async fn config_type_listing_and_validation() {
        let Json(types) = config_types().await;
        let types = types.as_array().unwrap().clone();
        assert_eq!(types.len(), CONFIG_TYPES.len());
        assert_eq!(types[0]["main_cmd"], json!(101));
        assert_eq!(types[0]["name"], json!("Network"));

        let (ctx, _dir) = test_ctx().await;
        let err = config_xml(State(ctx), Path(999)).await.err().unwrap();
        assert_eq!(err.status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn hooks_validate_paths() {
        let (ctx, _dir) = test_ctx().await;
        assert_eq!(
            hook_start(State(ctx.clone()), Path("ch0".to_string()))
                .await
                .unwrap(),
            StatusCode::NO_CONTENT
        );
        assert_eq!(
            hook_stop(State(ctx.clone()), Path("ch0".to_string()))
                .await
                .unwrap(),
            StatusCode::NO_CONTENT
        );
        let err = hook_start(State(ctx), Path("ch9".to_string()))
            .await
            .err()
            .unwrap();
        assert_eq!(err.status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn recording_delete_maps_errors() {
        let (ctx, _dir) = test_ctx().await;
        let err = recording_delete(State(ctx.clone()), Path((0, "../x.mp4".to_string())))
            .await
            .err()
            .unwrap();
        assert_eq!(err.status, StatusCode::BAD_REQUEST);

        let err = recording_delete(State(ctx.clone()), Path((0, "missing.mp4".to_string())))
            .await
            .err()
            .unwrap();
        assert_eq!(err.status, StatusCode::NOT_FOUND);

        let ch_dir = ctx.cfg.record.record_dir.join("ch0");
        std::fs::create_dir_all(&ch_dir).unwrap();
        std::fs::write(ch_dir.join("20260801T000000Z.mp4"), b"x").unwrap();
        assert_eq!(
            recording_delete(
                State(ctx.clone()),
                Path((0, "20260801T000000Z.mp4".to_string()))
            )
            .await
            .unwrap(),
            StatusCode::NO_CONTENT
        );
        let Json(body) = recordings_delete_all(State(ctx)).await;
        assert_eq!(body["deleted"], json!(0));
    }

    #[test]
    fn mime_table() {
        assert_eq!(mime_for(FsPath::new("index.html")), "text/html; charset=utf-8");
        assert_eq!(mime_for(FsPath::new("app.js")), "application/javascript");
        assert_eq!(mime_for(FsPath::new("x.bin")), "application/octet-stream");
    }
}
