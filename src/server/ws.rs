//! Room WebSocket endpoint
//!
//! `GET /ws/audio/{room_id}?token=<bearer>` is the single socket carrying
//! audio chunks in, translated audio out, and the WebRTC signaling mesh.
//! Three tasks cooperate per connection: this receive loop, the send task
//! draining the outbound queue, and the stream processor consuming the
//! chunk buffer. All three observe the connection's close signal.

use axum::{
    extract::{
        ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade},
        Path, Query, State,
    },
    response::Response,
};
use futures_util::{sink::SinkExt, stream::StreamExt};
use serde::Deserialize;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::metrics::Metrics;
use crate::rooms::{CloseReason, Connection};
use crate::server::protocol::{ClientMessage, ControlAction, ServerMessage};
use crate::server::rate_limit::{RateDecision, RateLimiter};
use crate::server::signaling::SignalKind;
use crate::server::AppState;
use crate::types::{LanguagePair, RoomId, UserId};
use crate::voice::audio::decode_base64_audio;

/// Policy-violation close code (auth failure, unknown room, room full)
const CLOSE_POLICY: u16 = 1008;

#[derive(Debug, Deserialize)]
pub struct WsQuery {
    #[serde(default)]
    token: Option<String>,
}

/// Upgrade handler: authenticate before any message flows
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    Path(room_id): Path<RoomId>,
    Query(query): Query<WsQuery>,
    State(state): State<AppState>,
) -> Response {
    // Validate the bearer token and room before accepting the session.
    // The close code still has to travel over the upgraded socket.
    let user_id = match query.token {
        Some(token) => state.auth.validate(&token).await.ok(),
        None => None,
    };

    let Some(user_id) = user_id else {
        debug!("Rejecting unauthenticated connect to room {}", room_id);
        return ws.on_upgrade(|socket| reject(socket, CLOSE_POLICY, "authentication failed"));
    };

    if !state.rooms.exists(&room_id).await {
        debug!("Rejecting connect to unknown room {}", room_id);
        return ws.on_upgrade(|socket| reject(socket, CLOSE_POLICY, "unknown room"));
    }

    ws.on_upgrade(move |socket| handle_socket(socket, state, user_id, room_id))
}

/// Close immediately with a policy code; used for failed handshakes
async fn reject(socket: WebSocket, code: u16, reason: &'static str) {
    let mut socket = socket;
    let _ = socket
        .send(Message::Close(Some(CloseFrame {
            code,
            reason: reason.into(),
        })))
        .await;
}

async fn handle_socket(socket: WebSocket, state: AppState, user_id: UserId, room_id: RoomId) {
    // Resolve the display name and default languages the user record carries
    let (user_name, languages) = match state.directory.get(user_id).await {
        Some(record) => (record.username.clone(), record.language_pair()),
        None => (user_id.to_string(), LanguagePair::default()),
    };

    let outcome = match state
        .manager
        .connect(user_id, user_name.clone(), room_id.clone(), languages)
    {
        Ok(outcome) => outcome,
        Err(e) => {
            info!("Connect refused for {} in {}: {}", user_id, room_id, e);
            reject(socket, CLOSE_POLICY, "connect refused").await;
            return;
        }
    };
    let conn = outcome.connection.clone();
    info!(
        "User {} ({}) connected to room {}{}",
        user_id,
        user_name,
        room_id,
        if outcome.replaced { " (replaced)" } else { "" }
    );

    let (ws_tx, ws_rx) = socket.split();
    let send_task = tokio::spawn(run_send_task(ws_tx, conn.clone()));

    conn.enqueue(ServerMessage::Connected { user_id });

    // The user silently left another room by connecting here
    if let Some(old_room) = &outcome.left_room {
        state.relay.announce_leave(old_room, user_id).await;
    }
    // Replacements keep their roster slot; no join announcement
    if !outcome.replaced {
        state.relay.announce_join(&room_id, user_id, &user_name).await;
    }

    run_recv_loop(ws_rx, &state, &conn).await;

    // Cleanup: stop this connection's processor, then deregister. A
    // replaced connection is a no-op here; its successor owns the slot.
    state.pipelines.stop_processing_conn(&conn).await;
    let removed = state.manager.disconnect_conn(&conn, CloseReason::Normal);
    let replaced = conn.close_reason() == Some(CloseReason::Replaced);
    if removed && !replaced {
        state.relay.announce_leave(&room_id, user_id).await;
    }

    // Let the send task flush the close frame, then make sure it is gone
    let _ = tokio::time::timeout(
        std::time::Duration::from_millis(state.config.rooms.shutdown_window_ms),
        send_task,
    )
    .await;
    info!("User {} disconnected from room {}", user_id, room_id);
}

/// Drain the outbound queue onto the socket; ends with a close frame
/// carrying the connection's close reason.
async fn run_send_task(
    mut ws_tx: futures_util::stream::SplitSink<WebSocket, Message>,
    conn: Arc<Connection>,
) {
    while let Some(message) = conn.next_outbound().await {
        let frame = match serde_json::to_string(&message) {
            Ok(json) => Message::Text(json.into()),
            Err(e) => {
                warn!("Failed to serialize outbound frame: {e}");
                continue;
            }
        };
        if ws_tx.send(frame).await.is_err() {
            return; // peer is gone; receive loop will observe it too
        }
    }

    let reason = conn.close_reason().unwrap_or(CloseReason::Normal);
    let _ = ws_tx
        .send(Message::Close(Some(CloseFrame {
            code: reason.code(),
            reason: reason.describe().into(),
        })))
        .await;
}

/// Receive loop: parse and dispatch inbound frames until the socket closes
/// or the connection is told to close (eviction, shutdown).
async fn run_recv_loop(
    mut ws_rx: futures_util::stream::SplitStream<WebSocket>,
    state: &AppState,
    conn: &Arc<Connection>,
) {
    let mut close_rx = conn.close_signal();
    let mut rate_limiter = RateLimiter::new(state.config.rate_limit.clone());

    loop {
        let message = tokio::select! {
            message = ws_rx.next() => message,
            _ = close_rx.changed() => {
                debug!("Connection {} told to close; leaving recv loop", conn.id);
                return;
            }
        };
        let Some(Ok(message)) = message else {
            return; // socket closed or errored
        };

        match message {
            Message::Text(text) => {
                conn.touch();
                match serde_json::from_str::<ClientMessage>(&text) {
                    Ok(frame) => dispatch(state, conn, frame, &mut rate_limiter).await,
                    Err(e) => {
                        // Protocol errors never kill the connection
                        debug!("Ignoring malformed frame from {}: {e}", conn.user_id);
                    }
                }
            }
            Message::Close(_) => {
                debug!("Client {} closed the socket", conn.user_id);
                return;
            }
            Message::Binary(_) => {
                debug!("Ignoring binary frame from {}", conn.user_id);
            }
            _ => {}
        }
    }
}

async fn dispatch(
    state: &AppState,
    conn: &Arc<Connection>,
    frame: ClientMessage,
    rate_limiter: &mut RateLimiter,
) {
    match frame {
        ClientMessage::InitSettings {
            input_language,
            output_language,
            speaks_languages,
            understands_languages,
            voice_profile_exists: _,
        } => {
            let languages = resolve_languages(
                input_language,
                output_language,
                speaks_languages,
                understands_languages,
            );
            conn.set_languages(languages);
            state.pipelines.start_processing(conn);
        }
        ClientMessage::LanguageUpdate {
            input_language,
            output_language,
            speaks_languages,
            understands_languages,
        } => {
            let languages = resolve_languages(
                input_language,
                output_language,
                speaks_languages,
                understands_languages,
            );
            state.pipelines.update_language(conn.user_id, languages);
        }
        ClientMessage::AudioChunk {
            audio_data,
            timestamp,
        } => {
            let pcm = match decode_base64_audio(&audio_data) {
                Ok(pcm) => pcm,
                Err(e) => {
                    debug!("Undecodable audio chunk from {}: {e}", conn.user_id);
                    return;
                }
            };
            if rate_limiter.check(pcm.len()) != RateDecision::Accept {
                Metrics::incr(&state.metrics.rate_limited_frames);
                return;
            }
            // Zero-byte chunks are accepted and ignored by the buffer
            state.pipelines.feed(conn.user_id, &pcm, timestamp);
        }
        ClientMessage::Control { action } => {
            let muted = action == ControlAction::Mute;
            conn.set_muted(muted);
            debug!("User {} {}", conn.user_id, if muted { "muted" } else { "unmuted" });
        }
        ClientMessage::WebrtcOffer {
            target_user_id,
            offer,
        } => {
            state.relay.relay(
                &conn.room_id,
                conn.user_id,
                target_user_id,
                SignalKind::Offer,
                offer,
            );
        }
        ClientMessage::WebrtcAnswer {
            target_user_id,
            answer,
        } => {
            state.relay.relay(
                &conn.room_id,
                conn.user_id,
                target_user_id,
                SignalKind::Answer,
                answer,
            );
        }
        ClientMessage::IceCandidate {
            target_user_id,
            candidate,
        } => {
            state.relay.relay(
                &conn.room_id,
                conn.user_id,
                target_user_id,
                SignalKind::IceCandidate,
                candidate,
            );
        }
    }
}

/// The scalar fields are authoritative; the ordered lists fill in when a
/// scalar is empty, and "en" is the last resort.
fn resolve_languages(
    input_language: String,
    output_language: String,
    speaks_languages: Option<Vec<String>>,
    understands_languages: Option<Vec<String>>,
) -> LanguagePair {
    let input = non_empty(input_language)
        .or_else(|| speaks_languages.and_then(|l| l.into_iter().find(|s| !s.is_empty())))
        .unwrap_or_else(|| crate::types::DEFAULT_LANGUAGE.to_string());
    let output = non_empty(output_language)
        .or_else(|| understands_languages.and_then(|l| l.into_iter().find(|s| !s.is_empty())))
        .unwrap_or_else(|| crate::types::DEFAULT_LANGUAGE.to_string());
    LanguagePair { input, output }
}

fn non_empty(s: String) -> Option<String> {
    if s.trim().is_empty() {
        None
    } else {
        Some(s)
    }
}
