use super::auth::{
    AUTH_COOKIE, PROJECT_COOKIE, SESSION_COOKIE, clear_cookie_header, client_ip, cookie_token,
    set_cookie_header,
};
use super::state::ApiState;
use super::ws::ws_upgrade_handler;
use axum::extract::{ConnectInfo, Query, Request, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, put};
use axum::{Json, Router};
use log::info;
use serde::Deserialize;
use serde_json::json;
use std::net::SocketAddr;
use uuid::Uuid;

pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/api/health", get(health))
        .route("/api/session/acquire", get(acquire_session))
        .route("/api/session/deactivate", put(deactivate_session))
        .route("/api/project/activate", get(activate_project))
        .route("/api/admin/persist-dlq", get(read_persist_dlq))
        .route("/ws/completion", get(ws_upgrade_handler))
        .route("/ws/chat", get(ws_upgrade_handler))
        .route("/ws/context", get(ws_upgrade_handler))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            rate_limit_middleware,
        ))
        .with_state(state)
}

/// Per-IP sliding-window limiter, keyed by the endpoint patterns from the
/// `rate_limits` config section.
async fn rate_limit_middleware(
    State(state): State<ApiState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    req: Request,
    next: Next,
) -> Result<Response, StatusCode> {
    let ip = client_ip(req.headers(), &addr.ip().to_string());
    let path = req.uri().path().to_string();

    if let Err(wait_ms) = state.limiter.verify_and_record(&path, &ip).await {
        info!("Rate limited {} on {} ({} ms)", ip, path, wait_ms);
        return Err(StatusCode::TOO_MANY_REQUESTS);
    }

    Ok(next.run(req).await)
}

async fn health(State(state): State<ApiState>) -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "connections": state.registry.len(),
        "pending_requests": state.orchestrator.pending_len(),
    }))
}

/// Idempotent session acquisition: a valid auth cookie yields a fresh
/// session token cookie.
async fn acquire_session(State(state): State<ApiState>, headers: HeaderMap) -> Response {
    let auth_token = cookie_token(&headers, AUTH_COOKIE);

    match state.manager.acquire_session(auth_token).await {
        Ok(session_token) => {
            let cookie = set_cookie_header(SESSION_COOKIE, &session_token, state.session_ttl);
            (
                StatusCode::OK,
                [(header::SET_COOKIE, cookie)],
                Json(json!({ "session_token": session_token })),
            )
                .into_response()
        }
        Err(e) if e.is_token() => (
            StatusCode::UNAUTHORIZED,
            Json(json!({ "error": "invalid or expired auth token" })),
        )
            .into_response(),
        Err(_) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "error": "internal error" })),
        )
            .into_response(),
    }
}

/// Explicit logout. Drives the full cascade and clears the cookies.
async fn deactivate_session(State(state): State<ApiState>, headers: HeaderMap) -> Response {
    let Some(session_token) = cookie_token(&headers, SESSION_COOKIE) else {
        return (
            StatusCode::UNAUTHORIZED,
            Json(json!({ "error": "missing session token" })),
        )
            .into_response();
    };

    match state.manager.deactivate_session(&session_token).await {
        Ok(()) => {
            let headers = [
                (header::SET_COOKIE, clear_cookie_header(SESSION_COOKIE)),
                (header::SET_COOKIE, clear_cookie_header(PROJECT_COOKIE)),
            ];
            (StatusCode::OK, headers, Json(json!({ "status": "deactivated" }))).into_response()
        }
        Err(_) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "error": "cascade incomplete, retried in background" })),
        )
            .into_response(),
    }
}

#[derive(Deserialize)]
struct ActivateProjectParams {
    project_id: Uuid,
}

/// Attaches the project to the current session; idempotent per
/// (session, project).
async fn activate_project(
    State(state): State<ApiState>,
    Query(params): Query<ActivateProjectParams>,
    headers: HeaderMap,
) -> Response {
    let Some(session_token) = cookie_token(&headers, SESSION_COOKIE) else {
        return (
            StatusCode::UNAUTHORIZED,
            Json(json!({ "error": "missing session token" })),
        )
            .into_response();
    };

    match state
        .manager
        .activate_project(&session_token, params.project_id)
        .await
    {
        Ok(project_token) => {
            let cookie = set_cookie_header(PROJECT_COOKIE, &project_token, state.session_ttl);
            (
                StatusCode::OK,
                [(header::SET_COOKIE, cookie)],
                Json(json!({ "project_token": project_token })),
            )
                .into_response()
        }
        Err(e) if e.is_token() => (
            StatusCode::UNAUTHORIZED,
            Json(json!({ "error": "invalid or expired session token" })),
        )
            .into_response(),
        Err(_) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "error": "internal error" })),
        )
            .into_response(),
    }
}

#[derive(Deserialize)]
struct DlqParams {
    #[serde(default = "default_dlq_count")]
    count: usize,
}

fn default_dlq_count() -> usize {
    20
}

/// Operational peek at dead-lettered persist tasks.
async fn read_persist_dlq(
    State(state): State<ApiState>,
    Query(params): Query<DlqParams>,
) -> Response {
    match state.broker.read_persist_dlq(params.count).await {
        Ok(entries) => {
            let entries: Vec<_> = entries
                .into_iter()
                .map(|(id, payload, reason, original_id)| {
                    json!({
                        "id": id,
                        "reason": reason,
                        "original_id": original_id,
                        "payload": String::from_utf8_lossy(&payload),
                    })
                })
                .collect();
            Json(json!({ "entries": entries })).into_response()
        }
        Err(_) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "error": "dlq read failed" })),
        )
            .into_response(),
    }
}
