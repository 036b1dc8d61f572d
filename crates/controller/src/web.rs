use anyhow::{Context, Result};
use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use axum::Router;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{error, info, warn};

use hydro_core::{Clock, ControlEvent, FlowStatus, LightState, SettingsPatch, SystemSettings};

use crate::alerts::{AlertDispatcher, AlertStatus};
use crate::config::{Features, WebConfig};
use crate::night::{format_datetime, NightOracle};
use crate::state::SharedState;
use crate::store::{PumpRun, Store};

const INDEX_HTML: &str = include_str!("ui/index.html");

/// Rows returned by `/api/history`.
const HISTORY_LIMIT: i64 = 50;

#[derive(Clone)]
pub struct AppState {
    pub shared: SharedState,
    pub store: Store,
    pub alerts: Arc<AlertDispatcher>,
    pub oracle: Arc<NightOracle>,
    pub features: Features,
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// JSON error body: `{"status": "error", "message": "..."}`.
pub(crate) struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn bad_request(e: anyhow::Error) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: format!("{e:#}"),
        }
    }

    fn internal(e: anyhow::Error) -> Self {
        error!("api: {e:#}");
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: format!("{e:#}"),
        }
    }

    fn not_enabled(what: &str) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            message: format!("{what} not enabled"),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = Json(json!({ "status": "error", "message": self.message }));
        (self.status, body).into_response()
    }
}

// ---------------------------------------------------------------------------
// Request / response bodies
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
struct OverrideRequest {
    active: bool,
    #[serde(default)]
    pump_state: bool,
}

#[derive(Serialize)]
struct OverrideResponse {
    status: &'static str,
    pump_on: bool,
    override_active: bool,
}

#[derive(Serialize)]
struct FlowResponse {
    enabled: bool,
    #[serde(flatten)]
    flow: Option<FlowStatus>,
}

#[derive(Deserialize)]
struct LightOverrideRequest {
    active: bool,
    #[serde(default)]
    brightness: u8,
}

#[derive(Serialize)]
struct LightResponse {
    enabled: bool,
    #[serde(flatten)]
    light: Option<LightState>,
}

// ---------------------------------------------------------------------------
// Routes
// ---------------------------------------------------------------------------

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/api/status", get(api_status))
        .route("/api/config", get(api_config))
        .route("/api/settings", get(get_settings).post(post_settings))
        .route("/api/override", post(post_override))
        .route("/api/flow", get(get_flow))
        .route("/api/flow/reset", post(post_flow_reset))
        .route("/api/alerts", get(get_alerts))
        .route("/api/alerts/test", post(post_alerts_test))
        .route("/api/light", get(get_light))
        .route("/api/light/override", post(post_light_override))
        .route("/api/history", get(get_history))
        .with_state(state)
}

async fn index() -> impl IntoResponse {
    ([(header::CONTENT_TYPE, "text/html; charset=utf-8")], INDEX_HTML)
}

async fn api_status(State(app): State<AppState>) -> impl IntoResponse {
    let night = app.oracle.is_night();
    let datetime = format_datetime(app.oracle.local_now());
    let st = app.shared.read().await;
    Json(st.to_status(night, datetime))
}

async fn api_config(State(app): State<AppState>) -> Json<Features> {
    Json(app.features)
}

async fn get_settings(State(app): State<AppState>) -> Json<SystemSettings> {
    let st = app.shared.read().await;
    Json(st.controller.settings().clone())
}

/// Merge, validate, persist, then apply to the running controller.
async fn post_settings(
    State(app): State<AppState>,
    Json(patch): Json<SettingsPatch>,
) -> Result<Json<SystemSettings>, ApiError> {
    // Held from merge to apply so concurrent patches serialize.
    let mut st = app.shared.write().await;
    let updated = patch
        .apply_to(st.controller.settings())
        .map_err(ApiError::bad_request)?;

    app.store
        .save_settings(&updated)
        .await
        .map_err(ApiError::internal)?;

    st.controller.apply_settings(updated);
    st.record_settings("settings updated".to_string());
    info!(name = %st.controller.settings().system_name, "settings applied");
    Ok(Json(st.controller.settings().clone()))
}

async fn post_override(
    State(app): State<AppState>,
    Json(req): Json<OverrideRequest>,
) -> Json<OverrideResponse> {
    let mut st = app.shared.write().await;
    st.set_override(req.active, req.pump_state);
    let pump = st.controller.pump_state();
    Json(OverrideResponse {
        status: "ok",
        pump_on: pump.relay_on,
        override_active: pump.manual_override_active,
    })
}

async fn get_flow(State(app): State<AppState>) -> Json<FlowResponse> {
    let st = app.shared.read().await;
    let now = st.clock().now();
    let flow = st.controller.flow_status(now);
    Json(FlowResponse {
        enabled: flow.is_some(),
        flow,
    })
}

async fn post_flow_reset(State(app): State<AppState>) -> Result<Json<FlowResponse>, ApiError> {
    let mut st = app.shared.write().await;
    let now = st.clock().now();
    if !st.controller.reset_flow(now) {
        return Err(ApiError::not_enabled("flow sensor"));
    }
    st.record_system("flow counters reset".to_string());
    Ok(Json(FlowResponse {
        enabled: true,
        flow: st.controller.flow_status(now),
    }))
}

async fn get_alerts(State(app): State<AppState>) -> Json<AlertStatus> {
    Json(app.alerts.status())
}

async fn post_alerts_test(State(app): State<AppState>) -> Result<Json<serde_json::Value>, ApiError> {
    let name = app.shared.read().await.controller.settings().system_name.clone();
    if !app.alerts.send_test(&name) {
        return Err(ApiError::internal(anyhow::anyhow!("test alert could not be queued")));
    }
    info!("test alert queued");
    Ok(Json(json!({ "status": "ok", "message": "test alert sent" })))
}

async fn get_light(State(app): State<AppState>) -> Json<LightResponse> {
    let st = app.shared.read().await;
    let light = st.controller.light_state();
    Json(LightResponse {
        enabled: light.is_some(),
        light,
    })
}

async fn post_light_override(
    State(app): State<AppState>,
    Json(req): Json<LightOverrideRequest>,
) -> Result<Json<LightResponse>, ApiError> {
    let mut st = app.shared.write().await;
    if !st.controller.lighting_enabled() {
        return Err(ApiError::not_enabled("lighting"));
    }
    if let Some(brightness) = st.controller.set_light_override(req.active, req.brightness) {
        st.dispatch(vec![ControlEvent::Light { brightness }]);
    }
    Ok(Json(LightResponse {
        enabled: true,
        light: st.controller.light_state(),
    }))
}

async fn get_history(State(app): State<AppState>) -> Result<Json<Vec<PumpRun>>, ApiError> {
    let runs = app
        .store
        .recent_pump_runs(HISTORY_LIMIT)
        .await
        .map_err(ApiError::internal)?;
    Ok(Json(runs))
}

// ---------------------------------------------------------------------------
// Server entry-point
// ---------------------------------------------------------------------------

pub async fn serve(app: AppState, cfg: &WebConfig) -> Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], cfg.port));
    if let (Some(cert), Some(key)) = (&cfg.tls_cert, &cfg.tls_key) {
        return serve_tls(app, addr, cert, key).await;
    }
    serve_plain(app, addr).await
}

async fn serve_plain(app: AppState, addr: SocketAddr) -> Result<()> {
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind web port {}", addr.port()))?;
    info!("web ui listening on http://{addr}");

    axum::serve(listener, router(app))
        .await
        .context("web server error")
}

#[cfg(feature = "tls")]
async fn serve_tls(app: AppState, addr: SocketAddr, cert: &str, key: &str) -> Result<()> {
    let tls = axum_server::tls_rustls::RustlsConfig::from_pem_file(cert, key)
        .await
        .with_context(|| format!("failed to load TLS cert {cert} / key {key}"))?;
    info!("web ui listening on https://{addr}");

    axum_server::bind_rustls(addr, tls)
        .serve(router(app).into_make_service())
        .await
        .context("web server error")
}

#[cfg(not(feature = "tls"))]
async fn serve_tls(app: AppState, addr: SocketAddr, cert: &str, _key: &str) -> Result<()> {
    warn!(cert, "TLS configured but built without the `tls` feature, serving plain HTTP");
    serve_plain(app, addr).await
}

// ===========================================================================
// Tests
// ===========================================================================
