//! WebSocket attachment endpoint.
//!
//! `GET /ws?token={attachment_token}&session={session_id}`. Binary frames
//! carry raw PTY bytes in both directions; text frames carry one JSON
//! object with a `type` field. The one-shot attachment token is the sole
//! credential — it is consumed before the upgrade, so a replayed URL dies
//! with 401 and a mismatched session with 4001-equivalent refusal.

use std::borrow::Cow;
use std::sync::Arc;

use axum::{
    extract::{
        ws::{CloseFrame, Message, WebSocket},
        Query, State, WebSocketUpgrade,
    },
    http::StatusCode,
    response::IntoResponse,
};
use bytes::Bytes;
use futures::{
    stream::{SplitSink, SplitStream},
    SinkExt, StreamExt,
};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use super::routes::AppState;
use crate::pty::{OutFrame, PtyInstance};
use crate::session::Session;

/// Close codes on the wire contract. Token failures are refused with
/// HTTP 401 before the upgrade, so no invalid-token close code exists.
pub const CLOSE_SESSION_NOT_FOUND: u16 = 4004;
pub const CLOSE_PTY_EXITED: u16 = 4100;

#[derive(Debug, Deserialize)]
pub struct WsQuery {
    pub token: Option<String>,
    pub session: Option<String>,
}

/// Client → server control frames.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
enum ClientFrame {
    Resize { cols: u16, rows: u16 },
    Ping,
    Pause,
    Resume,
}

/// Server → client control frames.
#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
enum ServerFrame {
    Pong,
    Error { message: String },
    Title { text: String },
}

impl ServerFrame {
    fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| "{}".to_string())
    }
}

/// Serialized window-title hint, also pushed when a session is renamed.
pub(crate) fn title_frame(text: &str) -> String {
    ServerFrame::Title {
        text: text.to_string(),
    }
    .to_json()
}

/// Validate the attachment token and upgrade. Everything that can be
/// refused before the upgrade is refused with a plain HTTP status.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(query): Query<WsQuery>,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    let (Some(token), Some(session_id)) = (query.token, query.session) else {
        return (StatusCode::BAD_REQUEST, "Missing token or session").into_response();
    };

    let Some(attachment) = state.tokens.consume(&token).await else {
        return (StatusCode::UNAUTHORIZED, "Invalid or expired attachment token").into_response();
    };
    if attachment.session_id != session_id {
        return (StatusCode::UNAUTHORIZED, "Token does not match session").into_response();
    }

    let Some(session) = state.registry.get(&session_id).await else {
        return (StatusCode::NOT_FOUND, "Session not found").into_response();
    };

    tracing::info!(
        session = %session.id,
        user = %attachment.user_token,
        "websocket attach authorized"
    );

    ws.max_message_size(state.config.read_limit)
        .max_frame_size(state.config.read_limit)
        .on_upgrade(move |socket| handle_attached(socket, session, state))
}

async fn handle_attached(socket: WebSocket, session: Session, state: Arc<AppState>) {
    let (mut ws_sender, ws_receiver) = socket.split();

    // Ghosts and vanished sessions fail the same way: the instance cannot
    // be ensured, the client sees an error frame and 4004.
    let ensured = if session.is_ghost {
        Err(crate::pty::PtyError::SessionGone(
            session.multiplexer_name.clone(),
        ))
    } else {
        state
            .manager
            .ensure(&session.id, &session.multiplexer_name)
            .await
    };

    let instance = match ensured {
        Ok(instance) => instance,
        Err(e) => {
            tracing::warn!(session = %session.id, error = %e, "attach failed");
            let frame = ServerFrame::Error {
                message: format!("cannot attach: {e}"),
            };
            let _ = ws_sender.send(Message::Text(frame.to_json())).await;
            let _ = ws_sender
                .send(Message::Close(Some(CloseFrame {
                    code: CLOSE_SESSION_NOT_FOUND,
                    reason: Cow::from("session not found"),
                })))
                .await;
            return;
        }
    };

    let (subscriber_id, frames_rx) = instance.add_subscriber();

    // Initial title hint so the client tab shows something useful.
    instance.send_control_to(subscriber_id, title_frame(&session.title));

    let writer_task = tokio::spawn(write_loop(
        ws_sender,
        frames_rx,
        state.config.ping_period,
        state.config.write_wait,
    ));

    read_loop(
        ws_receiver,
        Arc::clone(&instance),
        subscriber_id,
        &session.id,
        &state,
    )
    .await;

    instance.remove_subscriber(subscriber_id);
    state.manager.release(&session.id).await;
    writer_task.abort();

    tracing::info!(session = %session.id, subscriber = subscriber_id, "websocket detached");
}

/// Socket → PTY. Binary frames are queued for the input writer; text
/// frames are control messages. Any inbound frame refreshes the idle
/// budget; a silent peer times out after `pong_wait`.
async fn read_loop(
    mut receiver: SplitStream<WebSocket>,
    instance: Arc<PtyInstance>,
    subscriber_id: u64,
    session_id: &str,
    state: &Arc<AppState>,
) {
    loop {
        let msg = match tokio::time::timeout(state.config.pong_wait, receiver.next()).await {
            Err(_) => {
                tracing::debug!(session = session_id, "read deadline exceeded");
                break;
            }
            Ok(None) => break,
            Ok(Some(Err(e))) => {
                tracing::debug!(session = session_id, error = %e, "websocket read error");
                break;
            }
            Ok(Some(Ok(msg))) => msg,
        };

        match msg {
            Message::Binary(data) => {
                instance.write_input(Bytes::from(data));
                state.registry.touch(session_id).await;
            }
            Message::Text(text) => {
                handle_control(&instance, subscriber_id, &text);
                state.registry.touch(session_id).await;
            }
            // Pings are answered by the websocket layer; both directions
            // count as liveness and simply refresh the timeout above.
            Message::Ping(_) | Message::Pong(_) => {}
            Message::Close(_) => break,
        }
    }
}

fn handle_control(instance: &Arc<PtyInstance>, subscriber_id: u64, text: &str) {
    match serde_json::from_str::<ClientFrame>(text) {
        Ok(ClientFrame::Resize { cols, rows }) => {
            if cols > 0 && rows > 0 {
                instance.resize(cols, rows);
            }
        }
        Ok(ClientFrame::Ping) => {
            instance.send_control_to(subscriber_id, ServerFrame::Pong.to_json());
        }
        Ok(ClientFrame::Pause) => instance.set_paused(subscriber_id, true),
        Ok(ClientFrame::Resume) => instance.set_paused(subscriber_id, false),
        Err(_) => {
            tracing::debug!(subscriber = subscriber_id, "unrecognized control frame");
        }
    }
}

/// PTY → socket. Drains this subscriber's queue and keeps the connection
/// alive with periodic pings. Every write carries a deadline so one stuck
/// peer cannot wedge the fiber.
async fn write_loop(
    mut sender: SplitSink<WebSocket, Message>,
    mut frames: mpsc::Receiver<OutFrame>,
    ping_period: std::time::Duration,
    write_wait: std::time::Duration,
) {
    let mut ping = tokio::time::interval(ping_period);
    ping.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    ping.tick().await;

    loop {
        let message = tokio::select! {
            frame = frames.recv() => match frame {
                Some(OutFrame::Output(data)) => Message::Binary(data.to_vec()),
                Some(OutFrame::Control(text)) => Message::Text(text),
                Some(OutFrame::Close(code)) => {
                    let _ = tokio::time::timeout(
                        write_wait,
                        sender.send(Message::Close(Some(CloseFrame {
                            code,
                            reason: Cow::from(""),
                        }))),
                    )
                    .await;
                    break;
                }
                None => break,
            },
            _ = ping.tick() => Message::Ping(Vec::new()),
        };

        match tokio::time::timeout(write_wait, sender.send(message)).await {
            Ok(Ok(())) => {}
            Ok(Err(_)) | Err(_) => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_frames_parse() {
        let resize: ClientFrame =
            serde_json::from_str(r#"{"type":"resize","cols":80,"rows":24}"#).unwrap();
        assert!(matches!(resize, ClientFrame::Resize { cols: 80, rows: 24 }));

        assert!(matches!(
            serde_json::from_str::<ClientFrame>(r#"{"type":"ping"}"#).unwrap(),
            ClientFrame::Ping
        ));
        assert!(matches!(
            serde_json::from_str::<ClientFrame>(r#"{"type":"pause"}"#).unwrap(),
            ClientFrame::Pause
        ));
        assert!(matches!(
            serde_json::from_str::<ClientFrame>(r#"{"type":"resume"}"#).unwrap(),
            ClientFrame::Resume
        ));
    }

    #[test]
    fn unknown_client_frame_rejected() {
        assert!(serde_json::from_str::<ClientFrame>(r#"{"type":"warp"}"#).is_err());
        assert!(serde_json::from_str::<ClientFrame>("not json").is_err());
    }

    #[test]
    fn server_frames_serialize_with_type_tag() {
        assert_eq!(ServerFrame::Pong.to_json(), r#"{"type":"pong"}"#);

        let err = ServerFrame::Error {
            message: "pty process exited".to_string(),
        }
        .to_json();
        assert_eq!(
            err,
            r#"{"type":"error","message":"pty process exited"}"#
        );

        let title = ServerFrame::Title {
            text: "demo".to_string(),
        }
        .to_json();
        assert!(title.starts_with("{\"type\":\"title\""));
    }

    #[test]
    fn close_codes_match_contract() {
        assert_eq!(CLOSE_SESSION_NOT_FOUND, 4004);
        assert_eq!(CLOSE_PTY_EXITED, 4100);
    }

    #[tokio::test]
    async fn control_dispatch_toggles_pause() {
        let tuning = crate::pty::PtyTuning {
            read_chunk: 4096,
            write_queue_capacity: 4,
            send_queue_capacity: 16,
        };
        let (instance, _write_rx) =
            PtyInstance::detached("s".to_string(), "winterm-s".to_string(), tuning);
        let (id, mut rx) = instance.add_subscriber();

        handle_control(&instance, id, r#"{"type":"pause"}"#);
        instance.broadcast_output(Bytes::from_static(b"x"));
        assert!(rx.try_recv().is_err());

        handle_control(&instance, id, r#"{"type":"resume"}"#);
        instance.broadcast_output(Bytes::from_static(b"y"));
        assert!(matches!(rx.recv().await, Some(OutFrame::Output(_))));
    }

    #[tokio::test]
    async fn ping_control_queues_pong() {
        let tuning = crate::pty::PtyTuning {
            read_chunk: 4096,
            write_queue_capacity: 4,
            send_queue_capacity: 16,
        };
        let (instance, _write_rx) =
            PtyInstance::detached("s".to_string(), "winterm-s".to_string(), tuning);
        let (id, mut rx) = instance.add_subscriber();

        handle_control(&instance, id, r#"{"type":"ping"}"#);
        match rx.recv().await {
            Some(OutFrame::Control(text)) => assert_eq!(text, r#"{"type":"pong"}"#),
            other => panic!("unexpected frame: {other:?}"),
        }
    }
}
