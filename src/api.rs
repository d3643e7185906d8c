use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use axum::extract::{ConnectInfo, Query, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use tokio::sync::mpsc::Sender;
use tracing::info;

use crate::pinger::PingerClient;
use crate::proxy::ProxyClient;
use crate::state::StateStore;

/// One verify attempt per client IP within this window.
const VERIFY_THROTTLE: Duration = Duration::from_secs(5);

pub struct ApiState {
    store: Arc<dyn StateStore>,
    proxy: Option<Arc<dyn ProxyClient>>,
    pinger: Option<Arc<PingerClient>>,
    check_sender: Sender<()>,
    verify_seen: Mutex<HashMap<IpAddr, Instant>>,
}

impl ApiState {
    pub fn new(
        store: Arc<dyn StateStore>,
        proxy: Option<Arc<dyn ProxyClient>>,
        pinger: Option<Arc<PingerClient>>,
        check_sender: Sender<()>,
    ) -> Self {
        Self {
            store,
            proxy,
            pinger,
            check_sender,
            verify_seen: Mutex::new(HashMap::new()),
        }
    }

    fn allow_verify(&self, ip: IpAddr) -> bool {
        let mut seen = self.verify_seen.lock().unwrap();
        let now = Instant::now();
        seen.retain(|_, last| now.duration_since(*last) < VERIFY_THROTTLE);
        if seen.contains_key(&ip) {
            return false;
        }
        seen.insert(ip, now);
        true
    }
}

pub async fn start_api_server(state: Arc<ApiState>, port: u16) {
    let app = Router::new()
        .route("/api/status", get(get_status))
        .route("/api/check", post(run_check))
        .route("/api/records", get(get_records))
        .route("/api/token/verify", get(verify_zone_token))
        .route("/api/register", post(retry_registration))
        .route("/api/verify", get(verify_handshake))
        .with_state(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    info!("API server listening on http://{}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await.unwrap();
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await
    .unwrap();
}

async fn get_status(State(state): State<Arc<ApiState>>) -> Json<Value> {
    let last_check = state.store.last_check().ok().flatten();

    Json(json!({
        "last_check": last_check.as_ref().map(|c| c.checked_at.to_rfc3339()),
        "resolved_ips": last_check.as_ref().map(|c| c.resolved_ips.join(", ")),
        "blocked": last_check.as_ref().map(|c| c.blocked),
        "active_match_window": last_check.as_ref().map(|c| c.active_match_window),
        "paused": state.store.paused().unwrap_or(false),
        "last_error": state.store.last_error().ok().flatten(),
        "registered": state.store.registered().unwrap_or(false),
        "pinger_error": state.store.pinger_error().ok().flatten(),
    }))
}

async fn run_check(State(state): State<Arc<ApiState>>) -> Json<Value> {
    let _ = state.check_sender.try_send(());
    Json(json!({ "status": "check_triggered" }))
}

async fn get_records(State(state): State<Arc<ApiState>>) -> (StatusCode, Json<Value>) {
    let Some(proxy) = &state.proxy else {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": "zone credentials not configured" })),
        );
    };

    match proxy.list_a_records().await {
        Ok(records) => (StatusCode::OK, Json(json!({ "records": records }))),
        Err(e) => (
            StatusCode::BAD_GATEWAY,
            Json(json!({ "error": e.to_string() })),
        ),
    }
}

async fn verify_zone_token(State(state): State<Arc<ApiState>>) -> (StatusCode, Json<Value>) {
    let Some(proxy) = &state.proxy else {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": "zone credentials not configured" })),
        );
    };

    match proxy.verify_token().await {
        Ok(()) => (StatusCode::OK, Json(json!({ "valid": true }))),
        Err(e) => (
            StatusCode::BAD_GATEWAY,
            Json(json!({ "valid": false, "error": e.to_string() })),
        ),
    }
}

async fn retry_registration(State(state): State<Arc<ApiState>>) -> (StatusCode, Json<Value>) {
    let Some(pinger) = &state.pinger else {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": "pinger disabled or hostname not configured" })),
        );
    };

    match pinger.register().await {
        Ok(confirmed) => (
            StatusCode::OK,
            Json(json!({
                "registered": confirmed,
                "error": state.store.pinger_error().ok().flatten(),
            })),
        ),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "error": e.to_string() })),
        ),
    }
}

#[derive(Deserialize)]
struct VerifyParams {
    #[serde(default)]
    token: String,
}

/// Handshake callback used by the coordinator during registration.
async fn verify_handshake(
    State(state): State<Arc<ApiState>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Query(params): Query<VerifyParams>,
) -> (StatusCode, Json<Value>) {
    if !state.allow_verify(addr.ip()) {
        return (
            StatusCode::TOO_MANY_REQUESTS,
            Json(json!({ "verified": false })),
        );
    }

    let stored = state.store.ping_token().ok().flatten();
    let verified = match stored {
        Some(stored) if !params.token.is_empty() => tokens_match(&stored, &params.token),
        _ => false,
    };

    if verified {
        (StatusCode::OK, Json(json!({ "verified": true })))
    } else {
        (StatusCode::FORBIDDEN, Json(json!({ "verified": false })))
    }
}

/// Compared through digests so the comparison does not leak the match length.
fn tokens_match(stored: &str, presented: &str) -> bool {
    Sha256::digest(stored.as_bytes()) == Sha256::digest(presented.as_bytes())
}
