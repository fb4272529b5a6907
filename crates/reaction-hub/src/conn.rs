// SPDX-License-Identifier: Apache-2.0
//! A registered connection's outbound half, as seen by the Hub.

use reaction_proto::ExperimentGroup;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Outbound queue depth per connection.
pub const OUTBOUND_QUEUE_CAPACITY: usize = 64;

/// The Hub's view of one live connection: everything needed to route frames
/// to it without touching the socket directly.
pub struct ConnHandle {
    /// Declared experiment cohort.
    pub experiment_group: ExperimentGroup,
    /// Whether this connection drives video transport.
    pub is_host: bool,
    /// Server-receive time the connection was registered, in milliseconds.
    pub joined_ms: u64,
    /// Identity of this registration. Distinct from every other one the Hub
    /// has handed out, so a belated `unregister` can tell its own entry
    /// apart from a newer connection that has since displaced it under the
    /// same user id.
    generation: u64,
    sender: mpsc::Sender<Value>,
    /// Tripped when this connection is displaced by a newer registration
    /// under the same user id, or when the Hub is told to close everything.
    closed: CancellationToken,
}

/// Everything a freshly registered connection needs to drive its socket: the
/// channel its frames arrive on, the identity to present back to
/// [`crate::Hub::unregister`], and the signal that tells it to stop.
pub struct Registration {
    /// Outbound frame queue for this connection.
    pub receiver: mpsc::Receiver<Value>,
    /// This registration's identity.
    pub generation: u64,
    /// Tripped on displacement or on a Hub-wide close; the socket task
    /// should select on this and close promptly rather than wait for its
    /// own idle timeout.
    pub closed: CancellationToken,
}

impl ConnHandle {
    /// Build a handle and its matching registration, wired with a bounded
    /// queue and a fresh cancellation token.
    #[must_use]
    pub fn new(experiment_group: ExperimentGroup, is_host: bool, joined_ms: u64, generation: u64) -> (Self, Registration) {
        let (sender, receiver) = mpsc::channel(OUTBOUND_QUEUE_CAPACITY);
        let closed = CancellationToken::new();
        (
            Self {
                experiment_group,
                is_host,
                joined_ms,
                generation,
                sender,
                closed: closed.clone(),
            },
            Registration {
                receiver,
                generation,
                closed,
            },
        )
    }

    /// This handle's registration identity.
    #[must_use]
    pub const fn generation(&self) -> u64 {
        self.generation
    }

    /// Enqueue a frame without blocking. Returns `false` if the queue is full
    /// or the peer has already disconnected — the caller increments a drop
    /// counter rather than retrying. On overflow the newest frame is the one
    /// dropped, never the oldest.
    pub fn try_send(&self, frame: Value) -> bool {
        self.sender.try_send(frame).is_ok()
    }

    /// Trip this connection's close signal, so its socket task stops
    /// waiting on its own timeout and closes promptly.
    pub fn close(&self) {
        self.closed.cancel();
    }
}
