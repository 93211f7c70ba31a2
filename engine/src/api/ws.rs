use super::auth::{PROJECT_COOKIE, SESSION_COOKIE, cookie_token};
use super::state::ApiState;
use axum::extract::State;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::http::HeaderMap;
use axum::response::IntoResponse;
use common::model::frame::{ClientErrorKind, Frame};
use log::{debug, info, warn};
use tokio::sync::mpsc;
use uuid::Uuid;

/// Upgrade handler shared by the completion, chat, and context routes; the
/// frame `type` field carries the actual operation.
pub async fn ws_upgrade_handler(
    ws: WebSocketUpgrade,
    State(state): State<ApiState>,
    headers: HeaderMap,
) -> impl IntoResponse {
    let session_token = cookie_token(&headers, SESSION_COOKIE);
    let project_token = cookie_token(&headers, PROJECT_COOKIE);
    ws.on_upgrade(move |socket| handle_ws(socket, state, session_token, project_token))
}

/// One reader loop per connection. Outbound frames flow through the registry
/// sink; a close signal carries the reason picked by whoever dropped us.
async fn handle_ws(
    mut ws: WebSocket,
    state: ApiState,
    session_token: Option<Uuid>,
    project_token: Option<Uuid>,
) {
    // Authenticate before registering anything.
    let authz = match state
        .manager
        .authenticate_session(session_token, project_token)
        .await
    {
        Ok(authz) => authz,
        Err(e) => {
            debug!("WebSocket rejected: {}", e);
            let frame = Frame::error(
                None,
                ClientErrorKind::Unauthenticated,
                "invalid or expired session",
            );
            let _ = send_frame(&mut ws, &frame).await;
            let _ = ws.send(Message::Close(None)).await;
            return;
        }
    };

    let Some(project_token) = project_token else {
        let frame = Frame::error(None, ClientErrorKind::InvalidRequest, "project token required");
        let _ = send_frame(&mut ws, &frame).await;
        let _ = ws.send(Message::Close(None)).await;
        return;
    };

    let connection_id = Uuid::now_v7();
    let (sink_tx, mut sink_rx) =
        mpsc::channel::<Frame>(state.orchestrator_config.connection_sink_capacity);
    let (closer_tx, mut closer_rx) = mpsc::channel::<String>(1);

    state.registry.register(
        connection_id,
        sink_tx,
        closer_tx,
        authz.session_token,
        project_token,
    );
    state.orchestrator.attach_connection(connection_id).await;
    info!(
        "Connection {} opened (user {})",
        connection_id, authz.user_id
    );

    loop {
        tokio::select! {
            // Client -> server frames.
            incoming = ws.recv() => {
                let Some(Ok(message)) = incoming else {
                    break;
                };
                match message {
                    Message::Text(text) => match serde_json::from_str::<Frame>(&text) {
                        Ok(frame) => {
                            state
                                .orchestrator
                                .handle_frame(connection_id, frame)
                                .await;
                        }
                        Err(e) => {
                            debug!("Unparseable frame from {}: {}", connection_id, e);
                            let frame = Frame::error(
                                None,
                                ClientErrorKind::InvalidRequest,
                                "unparseable frame",
                            );
                            if send_frame(&mut ws, &frame).await.is_err() {
                                break;
                            }
                        }
                    },
                    Message::Close(_) => break,
                    // Transport-level pings are answered by axum itself.
                    _ => {}
                }
            }

            // Server -> client frames, in registry delivery order.
            outbound = sink_rx.recv() => {
                let Some(frame) = outbound else { break };
                if send_frame(&mut ws, &frame).await.is_err() {
                    break;
                }
            }

            // Forced close from a cascade or backpressure drop.
            reason = closer_rx.recv() => {
                let reason = reason.unwrap_or_else(|| "closed".to_string());
                info!("Closing connection {}: {}", connection_id, reason);
                // Flush anything already queued, then say why.
                while let Ok(frame) = sink_rx.try_recv() {
                    if send_frame(&mut ws, &frame).await.is_err() {
                        break;
                    }
                }
                break;
            }
        }
    }

    state.orchestrator.detach_connection(&connection_id).await;
    let _ = ws.send(Message::Close(None)).await;
    info!("Connection {} closed", connection_id);
}

async fn send_frame(ws: &mut WebSocket, frame: &Frame) -> Result<(), ()> {
    let text = match serde_json::to_string(frame) {
        Ok(text) => text,
        Err(e) => {
            warn!("Frame serialization failed: {}", e);
            return Ok(());
        }
    };
    ws.send(Message::Text(text)).await.map_err(|_| ())
}
