// SPDX-License-Identifier: Apache-2.0
//! The connection registry and best-effort fan-out broadcast.
//!
//! Registry access is serialized by a single exclusive lock held only for
//! the duration of the structural mutation — never across the outbound
//! send itself, which is why [`Hub::broadcast`] copies the live sender
//! list before dispatching.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use reaction_proto::ExperimentGroup;
use serde_json::Value;
use tracing::warn;

use crate::conn::{ConnHandle, Registration};

/// Live-connection registry shared by every `Connection` task and by the
/// Aggregator and Sync Relay.
#[derive(Default)]
pub struct Hub {
    conns: Mutex<HashMap<String, ConnHandle>>,
    dropped_frames: AtomicU64,
    next_generation: AtomicU64,
}

impl Hub {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a connection for `user_id`, replacing (and implicitly
    /// displacing) any previous connection for the same id — the newest
    /// connection wins. The displaced handle's close signal is tripped
    /// immediately, so its socket task stops waiting on its own timeout.
    #[must_use]
    pub fn register(&self, user_id: &str, experiment_group: ExperimentGroup, is_host: bool, joined_ms: u64) -> Registration {
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let (handle, registration) = ConnHandle::new(experiment_group, is_host, joined_ms, generation);
        let mut conns = self.conns.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        if let Some(displaced) = conns.insert(user_id.to_owned(), handle) {
            displaced.close();
        }
        registration
    }

    /// Remove a connection, but only if `generation` still matches the
    /// entry currently registered under `user_id`. A displaced connection's
    /// belated cleanup must never delete a newer connection's entry.
    /// Idempotent: calling this once the matching entry is already gone is
    /// a no-op.
    pub fn unregister(&self, user_id: &str, generation: u64) {
        let mut conns = self.conns.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        if conns.get(user_id).is_some_and(|handle| handle.generation() == generation) {
            conns.remove(user_id);
        }
    }

    /// Trip every currently registered connection's close signal. Used at
    /// shutdown so each socket task closes with a normal-closure frame
    /// instead of waiting out its own idle timeout.
    pub fn close_all(&self) {
        let conns = self.conns.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        for handle in conns.values() {
            handle.close();
        }
    }

    /// Number of currently registered connections.
    #[must_use]
    pub fn count(&self) -> usize {
        let conns = self.conns.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        conns.len()
    }

    /// User ids of every currently registered connection, for `/status`.
    #[must_use]
    pub fn connected_user_ids(&self) -> Vec<String> {
        let conns = self.conns.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        let mut ids: Vec<String> = conns.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// The user id of the single connection flagged `is_host`, if any.
    #[must_use]
    pub fn host_user_id(&self) -> Option<String> {
        let conns = self.conns.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        conns
            .iter()
            .find(|(_, handle)| handle.is_host)
            .map(|(user_id, _)| user_id.clone())
    }

    /// Declared experiment cohort of a connected user, if registered.
    #[must_use]
    pub fn experiment_group_of(&self, user_id: &str) -> Option<ExperimentGroup> {
        let conns = self.conns.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        conns.get(user_id).map(|h| h.experiment_group)
    }

    /// Send one frame to every registered connection. Best-effort: a full or
    /// closed queue drops that one subscriber's copy and is counted, but
    /// never blocks delivery to anyone else.
    pub fn broadcast(&self, frame: &Value) {
        self.broadcast_filtered(frame, |_| true);
    }

    /// Like [`Hub::broadcast`] but skips `exclude_user_id` — used to
    /// suppress a host's own transport-event echo.
    pub fn broadcast_except(&self, frame: &Value, exclude_user_id: &str) {
        self.broadcast_filtered(frame, |user_id| user_id != exclude_user_id);
    }

    fn broadcast_filtered(&self, frame: &Value, mut keep: impl FnMut(&str) -> bool) {
        let targets: Vec<String> = {
            let conns = self.conns.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
            conns.keys().filter(|id| keep(id)).cloned().collect()
        };
        for user_id in targets {
            self.send_to(&user_id, frame.clone());
        }
    }

    /// Send one frame to a single named connection. Returns `false` if the
    /// user is not registered or its queue is full/closed, in which case a
    /// drop is recorded.
    pub fn send_to(&self, user_id: &str, frame: Value) -> bool {
        let sent = {
            let conns = self.conns.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
            conns.get(user_id).is_some_and(|handle| handle.try_send(frame))
        };
        if !sent {
            self.dropped_frames.fetch_add(1, Ordering::Relaxed);
            warn!(%user_id, "dropped outbound frame: queue full or no such connection");
        }
        sent
    }

    /// Total frames dropped since boot, across every subscriber.
    #[must_use]
    pub fn dropped_frame_count(&self) -> u64 {
        self.dropped_frames.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_then_broadcast_is_received() {
        let hub = Hub::new();
        let mut registration = hub.register("u1", ExperimentGroup::Control2, false, 0);
        hub.broadcast(&Value::from("hello"));
        assert_eq!(registration.receiver.try_recv().unwrap(), Value::from("hello"));
    }

    #[test]
    fn registering_same_user_twice_displaces_the_first() {
        let hub = Hub::new();
        let first = hub.register("u1", ExperimentGroup::Control2, false, 0);
        let mut second = hub.register("u1", ExperimentGroup::Control2, false, 100);
        hub.broadcast(&Value::from(1));
        assert!(second.receiver.try_recv().is_ok());
        assert_eq!(hub.count(), 1);
        assert!(first.closed.is_cancelled());
    }

    #[test]
    fn unregister_does_not_remove_a_newer_registration() {
        let hub = Hub::new();
        let first = hub.register("u1", ExperimentGroup::Control2, false, 0);
        let second = hub.register("u1", ExperimentGroup::Control2, false, 100);
        hub.unregister("u1", first.generation);
        assert_eq!(hub.count(), 1);
        hub.unregister("u1", second.generation);
        assert_eq!(hub.count(), 0);
    }

    #[test]
    fn broadcast_except_skips_the_named_sender() {
        let hub = Hub::new();
        let mut host_reg = hub.register("host", ExperimentGroup::Control2, true, 0);
        let mut other_reg = hub.register("u2", ExperimentGroup::Control2, false, 0);
        hub.broadcast_except(&Value::from("play"), "host");
        assert!(host_reg.receiver.try_recv().is_err());
        assert_eq!(other_reg.receiver.try_recv().unwrap(), Value::from("play"));
    }

    #[test]
    fn send_to_unregistered_user_is_counted_as_a_drop() {
        let hub = Hub::new();
        assert!(!hub.send_to("ghost", Value::from(1)));
        assert_eq!(hub.dropped_frame_count(), 1);
    }

    #[test]
    fn a_full_queue_drops_the_newest_frame_not_the_oldest() {
        let hub = Hub::new();
        let registration = hub.register("u1", ExperimentGroup::Control2, false, 0);
        for i in 0..crate::conn::OUTBOUND_QUEUE_CAPACITY {
            assert!(hub.send_to("u1", Value::from(i)));
        }
        assert!(!hub.send_to("u1", Value::from(9999)));
        assert_eq!(hub.dropped_frame_count(), 1);
        drop(registration);
    }

    #[test]
    fn host_user_id_finds_the_flagged_connection() {
        let hub = Hub::new();
        hub.register("u1", ExperimentGroup::Control2, false, 0);
        hub.register("host", ExperimentGroup::Control2, true, 0);
        assert_eq!(hub.host_user_id().as_deref(), Some("host"));
    }

    #[test]
    fn unregister_is_idempotent() {
        let hub = Hub::new();
        let registration = hub.register("u1", ExperimentGroup::Control2, false, 0);
        hub.unregister("u1", registration.generation);
        hub.unregister("u1", registration.generation);
        assert_eq!(hub.count(), 0);
    }

    #[test]
    fn close_all_trips_every_registered_connections_signal() {
        let hub = Hub::new();
        let a = hub.register("u1", ExperimentGroup::Control2, false, 0);
        let b = hub.register("u2", ExperimentGroup::Control2, false, 0);
        hub.close_all();
        assert!(a.closed.is_cancelled());
        assert!(b.closed.is_cancelled());
    }
}
