//! HTTP/JSON adapter for the control surface.

use axum::{
    body::Bytes,
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use thiserror::Error;

use crate::control::{Control, ControlError, DiscInfoReply, DEFAULT_LOG_LINES};
use crate::job_store::{StatusSnapshot, StopOutcome};

/// Errors that can occur when running the control server
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("Failed to bind to {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Server error: {0}")]
    Serve(#[from] std::io::Error),
}

impl ControlError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            ControlError::UnknownJob(_) => StatusCode::NOT_FOUND,
            ControlError::InvalidState(_) | ControlError::GovernorBusy(_) => StatusCode::CONFLICT,
            ControlError::BadInput(_) => StatusCode::BAD_REQUEST,
        }
    }
}

impl IntoResponse for ControlError {
    fn into_response(self) -> Response {
        let body = Json(json!({ "ok": false, "error": self.to_string() }));
        (self.status_code(), body).into_response()
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StopBody {
    source: String,
    #[serde(default, alias = "delete_source")]
    delete_source: bool,
}

#[derive(Debug, Deserialize)]
struct ConfirmBody {
    source: String,
    action: String,
}

#[derive(Debug, Deserialize)]
struct RetryBody {
    source: String,
}

#[derive(Debug, Default, Deserialize)]
struct RipBody {
    #[serde(default)]
    mode: String,
}

#[derive(Debug, Deserialize)]
struct DiscInfoQuery {
    #[serde(default)]
    force: Option<String>,
}

#[derive(Debug, Deserialize)]
struct LogsQuery {
    #[serde(default)]
    lines: Option<usize>,
}

fn truthy(value: Option<&str>) -> bool {
    matches!(
        value.map(|v| v.trim().to_ascii_lowercase()).as_deref(),
        Some("1") | Some("true") | Some("yes") | Some("")
    )
}

type ApiResult = Result<Json<serde_json::Value>, ControlError>;

async fn get_status(State(control): State<Arc<Control>>) -> Json<StatusSnapshot> {
    Json(control.status())
}

async fn post_stop(State(control): State<Arc<Control>>, Json(body): Json<StopBody>) -> ApiResult {
    let outcome = control.stop(&body.source, body.delete_source)?;
    let outcome = match outcome {
        StopOutcome::Finalized => "canceled",
        StopOutcome::Signalled => "stopping",
    };
    Ok(Json(json!({ "ok": true, "source": body.source.trim(), "result": outcome })))
}

async fn post_confirm(
    State(control): State<Arc<Control>>,
    Json(body): Json<ConfirmBody>,
) -> ApiResult {
    control.confirm(&body.source, &body.action)?;
    Ok(Json(json!({ "ok": true, "source": body.source.trim() })))
}

async fn post_retry(State(control): State<Arc<Control>>, Json(body): Json<RetryBody>) -> ApiResult {
    control.retry(&body.source)?;
    Ok(Json(json!({ "ok": true, "source": body.source.trim() })))
}

/// The body is optional; an empty one means a manual rip.
async fn post_rip(State(control): State<Arc<Control>>, body: Bytes) -> ApiResult {
    let body: RipBody = if body.iter().all(u8::is_ascii_whitespace) {
        RipBody::default()
    } else {
        serde_json::from_slice(&body)
            .map_err(|e| ControlError::BadInput(format!("invalid rip request: {}", e)))?
    };
    let request = control.rip(&body.mode)?;
    Ok(Json(json!({ "ok": true, "request": request })))
}

async fn get_disc_info(
    State(control): State<Arc<Control>>,
    Query(query): Query<DiscInfoQuery>,
) -> Json<DiscInfoReply> {
    Json(control.disc_info(truthy(query.force.as_deref())).await)
}

async fn get_logs(
    State(control): State<Arc<Control>>,
    Query(query): Query<LogsQuery>,
) -> Json<serde_json::Value> {
    let lines = control.tail_logs(query.lines.unwrap_or(DEFAULT_LOG_LINES));
    Json(json!({ "lines": lines }))
}

async fn post_pause(State(control): State<Arc<Control>>) -> Json<serde_json::Value> {
    control.pause_scans();
    Json(json!({ "ok": true, "paused": true }))
}

async fn post_resume(State(control): State<Arc<Control>>) -> Json<serde_json::Value> {
    control.resume_scans();
    Json(json!({ "ok": true, "paused": false }))
}

/// Creates the axum Router with the control endpoints
pub fn create_router(control: Arc<Control>) -> Router {
    Router::new()
        .route("/api/status", get(get_status))
        .route("/api/stop", post(post_stop))
        .route("/api/confirm", post(post_confirm))
        .route("/api/retry", post(post_retry))
        .route("/api/rip", post(post_rip))
        .route("/api/disc_info", get(get_disc_info))
        .route("/api/logs", get(get_logs))
        .route("/api/scan/pause", post(post_pause))
        .route("/api/scan/resume", post(post_resume))
        .with_state(control)
}

/// Serve the control endpoints on `bind:port` until the listener fails.
pub async fn run_server(control: Arc<Control>, bind: &str, port: u16) -> Result<(), ServerError> {
    let addr = format!("{}:{}", bind, port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(|source| ServerError::Bind {
            addr: addr.clone(),
            source,
        })?;
    log::info!("Control server listening on http://{}", addr);

    axum::serve(listener, create_router(control)).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::Engine;
    use crate::governor::ScanGovernor;
    use crate::job_store::JobStore;
    use crate::jobs::JobState;
    use crate::probe::FixedProbe;
    use crate::process::testing::FakeLauncher;
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use tower::ServiceExt;
    use video_encoder_config::Config;

    fn app() -> (Router, Arc<JobStore>) {
        app_with(Config::default())
    }

    fn app_with(config: Config) -> (Router, Arc<JobStore>) {
        let store = Arc::new(JobStore::new(10, 20, Arc::new(ScanGovernor::default())));
        let engine = Arc::new(Engine::new(
            config,
            store.clone(),
            Arc::new(FakeLauncher::new()),
            Arc::new(FixedProbe(None)),
        ));
        (create_router(Arc::new(Control::new(engine))), store)
    }

    async fn send(app: Router, method: &str, uri: &str, body: Option<&str>) -> (StatusCode, serde_json::Value) {
        let request = Request::builder()
            .method(method)
            .uri(uri)
            .header("content-type", "application/json")
            .body(body.map_or_else(Body::empty, |b| Body::from(b.to_string())))
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let json = if bytes.is_empty() {
            serde_json::Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null)
        };
        (status, json)
    }

    #[tokio::test]
    async fn test_status_returns_snapshot() {
        let (app, store) = app();
        store.start("/media/a.mkv", None, None, JobState::Queued);

        let (status, json) = send(app, "GET", "/api/status", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["active"].as_array().unwrap().len(), 1);
        assert!(json["disc"].is_object());
        assert!(json["governor"].is_object());
    }

    #[tokio::test]
    async fn test_stop_unknown_is_404() {
        let (app, _) = app();
        let (status, json) = send(app, "POST", "/api/stop", Some(r#"{"source":"/x.mkv"}"#)).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(json["ok"], false);
    }

    #[tokio::test]
    async fn test_stop_accepts_camel_case_flag() {
        let (app, store) = app();
        store.start("/media/a.mkv", None, None, JobState::Queued);
        let (status, json) = send(
            app,
            "POST",
            "/api/stop",
            Some(r#"{"source":"/media/a.mkv","deleteSource":false}"#),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["result"], "canceled");
        assert!(!store.is_active("/media/a.mkv"));
    }

    #[tokio::test]
    async fn test_confirm_errors_map_to_status_codes() {
        let (app, store) = app();
        store.start("/media/a.mkv", None, None, JobState::Queued);

        let (status, _) = send(
            app.clone(),
            "POST",
            "/api/confirm",
            Some(r#"{"source":"/media/a.mkv","action":"later"}"#),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _) = send(
            app,
            "POST",
            "/api/confirm",
            Some(r#"{"source":"/media/a.mkv","action":"proceed"}"#),
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn test_rip_without_body_defaults_to_manual() {
        let (app, store) = app();
        let (status, json) = send(app.clone(), "POST", "/api/rip", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["request"]["mode"], "manual");
        assert!(store.pending_rip().is_some());

        let (status, _) = send(app.clone(), "POST", "/api/rip", Some(r#"{"mode":"auto"}"#)).await;
        assert_eq!(status, StatusCode::CONFLICT);

        let (status, _) = send(app, "POST", "/api/rip", Some("{not json")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_pause_and_resume_routes() {
        let (app, store) = app();
        let (status, _) = send(app.clone(), "POST", "/api/scan/pause", None).await;
        assert_eq!(status, StatusCode::OK);
        assert!(store.governor().is_paused());

        send(app, "POST", "/api/scan/resume", None).await;
        assert!(!store.governor().is_paused());
    }

    #[tokio::test]
    async fn test_logs_returns_tail_of_log_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let log = dir.path().join("daemon.log");
        std::fs::write(
            &log,
            "[INFO] started\n\"GET /api/status HTTP/1.1\" 200\n[WARN] disc scan timed out\n",
        )
        .unwrap();
        let mut config = Config::default();
        config.status.log_file = Some(log);
        let (app, _) = app_with(config);

        let (status, json) = send(app.clone(), "GET", "/api/logs", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(
            json["lines"],
            serde_json::json!(["[INFO] started", "[WARN] disc scan timed out"])
        );

        let (_, json) = send(app, "GET", "/api/logs?lines=1", None).await;
        assert_eq!(json["lines"], serde_json::json!(["[WARN] disc scan timed out"]));
    }

    #[tokio::test]
    async fn test_logs_without_log_file_is_empty() {
        let (app, _) = app();
        let (status, json) = send(app, "GET", "/api/logs", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["lines"], serde_json::json!([]));
    }

    #[test]
    fn test_force_flag_parsing() {
        assert!(truthy(Some("1")));
        assert!(truthy(Some("TRUE")));
        assert!(!truthy(Some("0")));
        assert!(!truthy(None));
    }
}
