//! HTTP router and handlers

use std::sync::Arc;

use axum::{
    Json, Router,
    body::Bytes,
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde_json::json;
use tower_http::{catch_panic::CatchPanicLayer, trace::TraceLayer};
use tracing::debug;

use super::auth::{AuthorizationGate, rune_from_headers};
use super::broadcast::SessionRegistry;
use super::cors::{OriginPolicy, csp_layer};
use super::forward::{RpcForwarder, list_methods_response, params_from_body};
use super::ws::ws_handler;
use crate::Result;
use crate::rpc::RpcBackend;

/// Shared application state
pub struct AppState {
    /// REST → RPC translation
    pub forwarder: RpcForwarder,
    /// Rune checks for socket connects
    pub gate: AuthorizationGate,
    /// Allowed browser origins
    pub origins: Arc<OriginPolicy>,
    /// Connected WebSocket sessions
    pub sessions: Arc<SessionRegistry>,
}

impl AppState {
    /// Wire the handlers to `backend`
    pub fn new(
        backend: Arc<dyn RpcBackend>,
        origins: Arc<OriginPolicy>,
        sessions: Arc<SessionRegistry>,
    ) -> Self {
        let gate = AuthorizationGate::new(Arc::clone(&backend));
        Self {
            forwarder: RpcForwarder::new(backend, gate.clone()),
            gate,
            origins,
            sessions,
        }
    }
}

/// Create the router
pub fn create_router(state: Arc<AppState>, csp: &str) -> Result<Router> {
    let cors = state.origins.cors_layer();

    Ok(Router::new()
        .route("/v1/list-methods", get(list_methods_handler))
        .route("/v1/ws", get(ws_handler))
        .route("/ws", get(ws_handler))
        .route("/v1/{method}", post(call_handler))
        .layer(cors)
        .layer(csp_layer(csp)?)
        .layer(CatchPanicLayer::new())
        .layer(TraceLayer::new_for_http())
        .with_state(state))
}

/// GET /v1/list-methods
async fn list_methods_handler(State(state): State<Arc<AppState>>) -> Response {
    list_methods_response(state.forwarder.list_methods().await)
}

/// POST /v1/{method}
async fn call_handler(
    State(state): State<Arc<AppState>>,
    Path(method): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let params = match params_from_body(&headers, body).await {
        Ok(params) => params,
        Err(e) => {
            debug!(method = %method, error = %e, "Unparseable request body");
            return (
                StatusCode::BAD_REQUEST,
                Json(json!({"error": e.to_error_object()})),
            )
                .into_response();
        }
    };

    state
        .forwarder
        .forward(rune_from_headers(&headers), &method, params)
        .await
        .into_response()
}
