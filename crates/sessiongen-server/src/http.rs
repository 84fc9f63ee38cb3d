//! HTTP request handlers
//!
//! Pairing endpoints, credential retrieval and server info.

use axum::{
    extract::{Path as AxumPath, Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde::{Deserialize, Serialize};
use sessiongen_session::{Challenge, PairingError, PairingRequest, SessionId};
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{debug, error, warn};

use crate::qr;
use crate::state::AppState;

/// Create the main application router
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        // Pairing
        .route("/pair", get(pair_handler))
        .route("/qr", get(qr_handler))
        // Credential retrieval
        .route("/session/:id", get(session_handler))
        // Server info
        .route("/api/info", get(server_info_handler))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Map a pairing failure to an HTTP status
fn status_for(err: &PairingError) -> StatusCode {
    match err {
        PairingError::InvalidNumber(_) => StatusCode::BAD_REQUEST,
        PairingError::NotFound => StatusCode::NOT_FOUND,
        PairingError::PairingCodeUnavailable(_)
        | PairingError::ServiceUnavailable(_)
        | PairingError::StoreUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
    }
}

/// Error body for endpoints other than `/pair`
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

fn error_response(status: StatusCode, message: impl Into<String>) -> Response {
    (
        status,
        Json(ErrorResponse {
            error: message.into(),
        }),
    )
        .into_response()
}

// ============================================================================
// Pairing
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct PairQuery {
    /// Phone number in international format; separators are ignored
    number: Option<String>,
}

/// Body of every `/pair` response
///
/// Failures carry their message in `code` as well.
#[derive(Debug, Serialize)]
pub struct PairResponse {
    pub code: String,
}

/// Start a pairing-code session for a phone number
async fn pair_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<PairQuery>,
) -> (StatusCode, Json<PairResponse>) {
    let reply = |status, code: String| (status, Json(PairResponse { code }));

    let Some(number) = query.number.filter(|n| !n.trim().is_empty()) else {
        return reply(
            StatusCode::BAD_REQUEST,
            "Phone number is required, e.g. /pair?number=15551234567".to_string(),
        );
    };

    match state.pairing_manager.pair_number(&number).await {
        Ok(handle) => match handle.challenge {
            Challenge::Code(code) => reply(StatusCode::OK, code),
            Challenge::Qr(_) => {
                error!("Pairing-code session returned a QR challenge");
                reply(
                    StatusCode::SERVICE_UNAVAILABLE,
                    "Service Unavailable".to_string(),
                )
            }
        },
        Err(e) => {
            debug!("Pairing request rejected: {}", e);
            reply(status_for(&e), e.to_string())
        }
    }
}

/// QR pairing response
#[derive(Debug, Serialize)]
pub struct QrResponse {
    /// PNG data URL of the QR code
    pub qr: String,
    pub instructions: Vec<String>,
}

const QR_INSTRUCTIONS: [&str; 4] = [
    "1. Open WhatsApp on your phone",
    "2. Go to Settings > Linked Devices",
    "3. Tap Link a Device",
    "4. Scan this QR code",
];

/// Start a QR session and return the code as an image
async fn qr_handler(State(state): State<Arc<AppState>>) -> Response {
    let handle = match state.pairing_manager.start(PairingRequest::qr()).await {
        Ok(handle) => handle,
        Err(e) => return error_response(status_for(&e), e.to_string()),
    };

    let Challenge::Qr(payload) = &handle.challenge else {
        error!("QR session returned a pairing code");
        return error_response(StatusCode::SERVICE_UNAVAILABLE, "Service Unavailable");
    };

    match qr::png_data_url(payload) {
        Ok(qr) => Json(QrResponse {
            qr,
            instructions: QR_INSTRUCTIONS.iter().map(|s| s.to_string()).collect(),
        })
        .into_response(),
        Err(e) => {
            error!("Failed to render QR for session {}: {}", handle.session_id.fingerprint(), e);
            error_response(StatusCode::SERVICE_UNAVAILABLE, e.to_string())
        }
    }
}

// ============================================================================
// Credential retrieval
// ============================================================================

/// Return the stored bundle for a session id
async fn session_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(id): AxumPath<String>,
) -> Response {
    let Some(id) = SessionId::parse(&id) else {
        return error_response(StatusCode::NOT_FOUND, "Session not found");
    };

    match state.pairing_manager.fetch(&id).await {
        Ok(bundle) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "application/json")],
            bundle.into_bytes(),
        )
            .into_response(),
        Err(PairingError::NotFound) => error_response(StatusCode::NOT_FOUND, "Session not found"),
        Err(e) => {
            warn!("Failed to read session {}: {}", id.fingerprint(), e);
            error_response(status_for(&e), e.to_string())
        }
    }
}

// ============================================================================
// Server Info
// ============================================================================

/// Server information response
#[derive(Debug, Serialize)]
pub struct ServerInfo {
    /// Server version
    pub version: String,
    /// Sessions currently in flight
    pub active_sessions: usize,
    /// Concurrent session limit
    pub max_sessions: usize,
    /// Retention policy for stored bundles
    pub retention: String,
}

/// Get server information
async fn server_info_handler(State(state): State<Arc<AppState>>) -> Json<ServerInfo> {
    let manager = &state.pairing_manager;
    Json(ServerInfo {
        version: env!("CARGO_PKG_VERSION").to_string(),
        active_sessions: manager.active_sessions(),
        max_sessions: manager.capacity(),
        retention: state.config.retention.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use sessiongen_core::{Config, LoopbackConnector, LoopbackController, RetentionPolicy};
    use sessiongen_session::{PairingManager, SessionStore};
    use std::time::Duration;
    use tempfile::{tempdir, TempDir};
    use tower::ServiceExt;

    fn test_config() -> Config {
        Config::new()
            .with_pairing_code_delay(Duration::from_millis(5))
            .with_challenge_timeout(Duration::from_secs(2))
            .with_session_lifetime(Duration::from_secs(10))
    }

    async fn test_app(
        config: Config,
        connector: LoopbackConnector,
    ) -> (Router, Arc<AppState>, LoopbackController, TempDir) {
        let dir = tempdir().unwrap();
        let store = Arc::new(SessionStore::with_root(dir.path()).await.unwrap());
        let controller = connector.controller();
        let manager = Arc::new(PairingManager::new(Arc::new(connector), store, config));
        let state = Arc::new(AppState::new(manager));
        (create_router(state.clone()), state, controller, dir)
    }

    async fn get(app: &Router, uri: &str) -> Response {
        app.clone()
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap()
    }

    async fn body_bytes(response: Response) -> Vec<u8> {
        to_bytes(response.into_body(), usize::MAX).await.unwrap().to_vec()
    }

    async fn body_json(response: Response) -> serde_json::Value {
        serde_json::from_slice(&body_bytes(response).await).unwrap()
    }

    async fn wait_idle(state: &AppState) {
        for _ in 0..500 {
            if state.pairing_manager.active_sessions() == 0 {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("sessions still active");
    }

    async fn only_session(state: &AppState) -> SessionId {
        let stored = state.pairing_manager.store().list().await.unwrap();
        assert_eq!(stored.len(), 1);
        stored[0].id.clone()
    }

    #[tokio::test]
    async fn test_pair_returns_grouped_code() {
        let (app, _state, controller, _dir) = test_app(test_config(), LoopbackConnector::new()).await;

        let response = get(&app, "/pair?number=%2B1%20555%20123%204567").await;
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        let code = body["code"].as_str().unwrap();
        assert_eq!(code.len(), 9);
        assert_eq!(&code[4..5], "-");
        assert_eq!(controller.code_requests(), vec!["15551234567".to_string()]);
    }

    #[tokio::test]
    async fn test_pair_rejects_bad_numbers() {
        let (app, _state, controller, _dir) = test_app(test_config(), LoopbackConnector::new()).await;

        for uri in ["/pair?number=123", "/pair", "/pair?number=", "/pair?number=1234567890"] {
            let response = get(&app, uri).await;
            assert_eq!(response.status(), StatusCode::BAD_REQUEST, "{}", uri);
            let body = body_json(response).await;
            assert!(body["code"].is_string());
        }
        assert_eq!(controller.connect_count(), 0);
    }

    #[tokio::test]
    async fn test_pair_when_saturated() {
        let config = test_config().with_max_sessions(1);
        let (app, _state, _controller, _dir) = test_app(config, LoopbackConnector::new()).await;

        assert_eq!(get(&app, "/pair?number=15551234567").await.status(), StatusCode::OK);
        let response = get(&app, "/pair?number=447911123456").await;
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert!(body_json(response).await["code"].is_string());
    }

    #[tokio::test]
    async fn test_pair_to_session_end_to_end() {
        let (app, state, controller, _dir) = test_app(test_config(), LoopbackConnector::new()).await;

        assert_eq!(get(&app, "/pair?number=15551234567").await.status(), StatusCode::OK);
        let id = only_session(&state).await;
        assert!(controller.authenticate());
        wait_idle(&state).await;

        let response = get(&app, &format!("/session/{}", id)).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers()[header::CONTENT_TYPE],
            "application/json"
        );
        let creds: serde_json::Value = serde_json::from_slice(&body_bytes(response).await).unwrap();
        assert_eq!(creds["me"]["id"], "15551234567");

        // Time-boxed bundles stay retrievable
        assert_eq!(get(&app, &format!("/session/{}", id)).await.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_one_shot_leaves_nothing_to_fetch() {
        let config = test_config().with_retention(RetentionPolicy::OneShot);
        let (app, state, controller, _dir) = test_app(config, LoopbackConnector::new()).await;

        get(&app, "/pair?number=15551234567").await;
        let id = only_session(&state).await;
        assert!(controller.authenticate());
        wait_idle(&state).await;

        let response = get(&app, &format!("/session/{}", id)).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(controller.sent_messages().len(), 2);
    }

    #[tokio::test]
    async fn test_unknown_session() {
        let (app, _state, _controller, _dir) = test_app(test_config(), LoopbackConnector::new()).await;

        for uri in ["/session/1718000000000abcdefghi", "/session/..%2F..%2Fetc", "/session/x"] {
            let response = get(&app, uri).await;
            assert_eq!(response.status(), StatusCode::NOT_FOUND, "{}", uri);
            assert_eq!(body_json(response).await["error"], "Session not found");
        }
    }

    #[tokio::test]
    async fn test_qr_returns_png_data_url() {
        let connector = LoopbackConnector::new().with_autopilot(Duration::from_secs(30));
        let (app, _state, _controller, _dir) = test_app(test_config(), connector).await;

        let response = get(&app, "/qr").await;
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert!(body["qr"]
            .as_str()
            .unwrap()
            .starts_with("data:image/png;base64,"));
        assert_eq!(body["instructions"].as_array().unwrap().len(), 4);
    }

    #[tokio::test]
    async fn test_qr_unavailable() {
        let config = test_config().with_challenge_timeout(Duration::from_millis(50));
        let (app, _state, _controller, _dir) = test_app(config, LoopbackConnector::new()).await;

        let response = get(&app, "/qr").await;
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert!(body_json(response).await["error"].is_string());
    }

    #[tokio::test]
    async fn test_server_info() {
        let (app, _state, _controller, _dir) = test_app(test_config(), LoopbackConnector::new()).await;
        get(&app, "/pair?number=15551234567").await;

        let body = body_json(get(&app, "/api/info").await).await;
        assert_eq!(body["active_sessions"], 1);
        assert_eq!(body["max_sessions"], 100);
        assert_eq!(body["retention"], "time-boxed(86400s)");
        assert_eq!(body["version"], env!("CARGO_PKG_VERSION"));
    }
}
