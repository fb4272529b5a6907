// SPDX-License-Identifier: Apache-2.0
//! Boundary glue: the `/ws` upgrade handler and the per-connection
//! reader/writer tasks that bridge a real socket into
//! `reaction_hub::dispatch_frame`.

use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use axum::extract::ws::{CloseFrame, Message, WebSocket};
use axum::extract::{State, WebSocketUpgrade};
use axum::response::IntoResponse;
use futures_util::{SinkExt, StreamExt};
use reaction_hub::{dispatch_frame, DispatchCtx};
use reaction_proto::wire::encode;
use reaction_proto::{parse_frame, parse_handshake, ParsedFrame};
use tokio::sync::mpsc;
use tokio::time;
use tracing::{info, warn};

use crate::AppState;

/// Maximum accepted frame size.
const MAX_FRAME_BYTES: usize = 8 * 1024;
/// Inbound rate ceiling before a connection is closed for policy violation.
const MAX_MESSAGES_PER_SECOND: u32 = 50;
/// A connection idle this long with no inbound frame is closed.
const IDLE_TIMEOUT: Duration = Duration::from_secs(60);

/// Current server monotonic clock in milliseconds since the Unix epoch.
#[must_use]
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
        .unwrap_or(0)
}

/// `GET /ws`: upgrade and hand off to [`handle_socket`].
pub async fn ws_handler(State(state): State<AppState>, ws: WebSocketUpgrade) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

fn close_frame(reason: &'static str) -> Message {
    Message::Close(Some(CloseFrame {
        code: axum::extract::ws::close_code::POLICY,
        reason: reason.into(),
    }))
}

/// A close frame carrying the normal-closure code, sent when a connection is
/// displaced by a newer registration for the same user, or when the server
/// is shutting down.
fn normal_close_frame(reason: &'static str) -> Message {
    Message::Close(Some(CloseFrame {
        code: axum::extract::ws::close_code::NORMAL,
        reason: reason.into(),
    }))
}

async fn handle_socket(mut socket: WebSocket, state: AppState) {
    let Some(Ok(Message::Text(first))) = socket.next().await else {
        let _ = socket.send(close_frame("missing handshake")).await;
        return;
    };
    let handshake = match parse_handshake(first.as_str()) {
        Ok(h) => h,
        Err(err) => {
            warn!(%err, "handshake rejected");
            let _ = socket.send(close_frame("invalid handshake")).await;
            return;
        }
    };

    let joined_ms = now_ms();
    state.store.ensure_user(&handshake.user_id, handshake.experiment_group, joined_ms);
    state
        .persistence
        .ensure_user_row(&reaction_proto::UserRecord {
            user_id: handshake.user_id.clone(),
            experiment_group: handshake.experiment_group,
            created_ms: joined_ms,
        })
        .await;

    let registration = state
        .hub
        .register(&handshake.user_id, handshake.experiment_group, handshake.is_host, joined_ms);
    let mut outbound = registration.receiver;
    let generation = registration.generation;
    let closed = registration.closed;

    let (mut ws_tx, mut ws_rx) = socket.split();

    let established = encode::connection_established(
        &handshake.user_id,
        handshake.experiment_group,
        handshake.is_host,
        "connected",
        &chrono::Utc::now().to_rfc3339(),
    );
    if ws_tx.send(Message::Text(established.to_string().into())).await.is_err() {
        state.hub.unregister(&handshake.user_id, generation);
        return;
    }

    let (local_tx, mut local_rx) = mpsc::channel::<Message>(reaction_hub::OUTBOUND_QUEUE_CAPACITY);

    let writer = tokio::spawn(async move {
        loop {
            tokio::select! {
                Some(frame) = outbound.recv() => {
                    if ws_tx.send(Message::Text(frame.to_string().into())).await.is_err() {
                        break;
                    }
                }
                Some(msg) = local_rx.recv() => {
                    if ws_tx.send(msg).await.is_err() {
                        break;
                    }
                }
                else => break,
            }
        }
    });

    let ctx = DispatchCtx {
        hub: state.hub.clone(),
        store: state.store.clone(),
        persistence: state.persistence.clone(),
    };
    let is_host = handshake.is_host;
    let is_debug_group = handshake.experiment_group.is_debug();
    let user_id = handshake.user_id.clone();

    let mut window_start = Instant::now();
    let mut window_count: u32 = 0;

    loop {
        let msg = tokio::select! {
            () = closed.cancelled() => {
                let _ = local_tx.send(normal_close_frame("connection closed by server")).await;
                break;
            }
            recv = time::timeout(IDLE_TIMEOUT, ws_rx.next()) => {
                match recv {
                    Ok(Some(Ok(msg))) => msg,
                    _ => break,
                }
            }
        };

        let text = match msg {
            Message::Text(text) => text,
            Message::Close(_) => break,
            Message::Ping(_) | Message::Pong(_) => continue,
            Message::Binary(_) => {
                let _ = local_tx.send(close_frame("binary frames are not supported")).await;
                break;
            }
        };
        if text.as_str().len() > MAX_FRAME_BYTES {
            warn!(%user_id, len = text.as_str().len(), "frame too large; closing");
            let _ = local_tx.send(close_frame("frame too large")).await;
            break;
        }

        if window_start.elapsed() >= Duration::from_secs(1) {
            window_start = Instant::now();
            window_count = 0;
        }
        window_count += 1;
        if window_count > MAX_MESSAGES_PER_SECOND {
            warn!(%user_id, "inbound rate exceeded; closing");
            let _ = local_tx.send(close_frame("rate limit exceeded")).await;
            break;
        }

        match parse_frame(text.as_str()) {
            Ok(ParsedFrame::Known(frame)) => {
                dispatch_frame(&ctx, &user_id, is_host, is_debug_group, frame, now_ms()).await;
            }
            Ok(ParsedFrame::UnknownTag(tag)) => {
                warn!(%user_id, %tag, "ignoring frame with unrecognized type");
            }
            Err(err) => {
                warn!(%user_id, %err, "ignoring malformed frame");
            }
        }
    }

    state.hub.unregister(&user_id, generation);
    writer.abort();
    info!(%user_id, "connection closed");
}
