// SPDX-License-Identifier: Apache-2.0
//! Transport-agnostic inbound-frame dispatch and sync relay.
//!
//! `dispatch_frame` contains the whole demultiplexer and the sync-relay
//! routing between host and participants. It takes a parsed [`ClientFrame`]
//! rather than a socket, so it is exercised directly in tests without a
//! real WebSocket.

use std::sync::Arc;

use reaction_proto::wire::encode;
use reaction_proto::{ClientFrame, Effect, EffectDebug, Sample, Session, TransportKind};
use reaction_persistence::Persistence;
use reaction_store::Store;
use tracing::warn;

use crate::hub::Hub;

/// The three collaborators a connection's reader needs to dispatch a frame.
/// Cloning is cheap (three `Arc`s); one `DispatchCtx` is built per connection
/// and moved into its reader task.
#[derive(Clone)]
pub struct DispatchCtx {
    /// Connection registry and fan-out.
    pub hub: Arc<Hub>,
    /// Per-user sliding-window sample store.
    pub store: Arc<Store>,
    /// Append-only durable log.
    pub persistence: Arc<Persistence>,
}

/// Dispatch one already-parsed inbound frame from `sender_id`, received at
/// `now_ms`. `is_host` and `experiment_group` describe the sender's own
/// connection, since several branches gate on them.
pub async fn dispatch_frame(
    ctx: &DispatchCtx,
    sender_id: &str,
    is_host: bool,
    is_debug_group: bool,
    frame: ClientFrame,
    now_ms: u64,
) {
    match frame {
        ClientFrame::Reaction(reaction) => {
            let sample = Sample {
                user_id: sender_id.to_owned(),
                server_receive_ms: now_ms,
                states: reaction.states,
                events: reaction.events,
                video_time_seconds: reaction.video_time_seconds,
                session_id: reaction.session_id,
            };
            ctx.store.append(sample.clone());
            ctx.persistence.log_reaction(&sample).await;
        }
        ClientFrame::VideoTransport { kind, current_time } => {
            if is_host {
                let frame = encode::video_transport(kind.as_str(), current_time, now_ms);
                ctx.hub.broadcast_except(&frame, sender_id);
            }
        }
        ClientFrame::TimeSyncRequest => {
            let Some(host_id) = ctx.hub.host_user_id() else {
                return;
            };
            ctx.hub.send_to(&host_id, encode::time_sync_request(sender_id));
        }
        ClientFrame::TimeSyncResponse {
            requester_id,
            current_time,
        } => {
            if is_host {
                ctx.hub.send_to(&requester_id, encode::time_sync_response(current_time));
            }
        }
        ClientFrame::VideoUrlSelected { video_id } => {
            if is_host {
                ctx.hub.broadcast(&encode::video_url_selected(&video_id));
            }
        }
        ClientFrame::SessionCreate { session_id, video_id } => {
            ctx.persistence
                .session_create(&Session {
                    session_id,
                    user_id: sender_id.to_owned(),
                    video_id,
                    started_ms: now_ms,
                })
                .await;
        }
        ClientFrame::SessionCompleted { session_id } => {
            ctx.persistence.session_complete(&session_id, now_ms).await;
        }
        ClientFrame::ManualEffect {
            effect_type,
            intensity,
            duration_ms,
            session_id,
            video_time,
        } => {
            if !is_debug_group {
                warn!(%sender_id, "manual_effect rejected: sender is not in the debug group");
                return;
            }
            let effect = Effect {
                effect_type,
                intensity: intensity.clamp(0.0, 1.0),
                duration_ms,
                server_send_ms: now_ms,
                debug: Some(EffectDebug {
                    active_users: 0,
                    ratio_state: std::collections::BTreeMap::new(),
                    density_event: std::collections::BTreeMap::new(),
                }),
            };
            ctx.persistence
                .log_effect(&effect, 0, session_id.as_deref(), video_time)
                .await;
            ctx.hub.broadcast(&encode::effect(&effect));
        }
    }
}
