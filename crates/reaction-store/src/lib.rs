// SPDX-License-Identifier: Apache-2.0
//! The per-user sliding-window sample store.
//!
//! A single exclusive lock guards a map from user id to a bounded deque of
//! recent samples, held only for the duration of the structural mutation.
//! The lock is never held across an `.await`: callers clone what they need
//! and release it immediately, which is what lets the Aggregator take a
//! stable snapshot without stalling ingress.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use reaction_proto::{ExperimentGroup, Sample, ACTIVE_WINDOW_MS, WINDOW_SIZE};

struct UserEntry {
    experiment_group: ExperimentGroup,
    created_ms: u64,
    samples: VecDeque<Sample>,
    last_arrival_ms: u64,
}

impl UserEntry {
    fn new(experiment_group: ExperimentGroup, created_ms: u64) -> Self {
        Self {
            experiment_group,
            created_ms,
            samples: VecDeque::with_capacity(WINDOW_SIZE),
            last_arrival_ms: created_ms,
        }
    }

    fn is_active(&self, now_ms: u64) -> bool {
        !self.samples.is_empty() && now_ms.saturating_sub(self.last_arrival_ms) <= ACTIVE_WINDOW_MS
    }
}

/// One row of the `/debug/aggregation` read endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DebugUserEntry {
    /// User identifier.
    pub user_id: String,
    /// Number of samples currently held for this user (`<= WINDOW_SIZE`).
    pub sample_count: usize,
    /// Receive time of the most recent sample, in milliseconds.
    pub last_arrival_ms: u64,
}

/// Thread-safe per-user sliding-window store.
///
/// Owned for the lifetime of the service and shared via `Arc` with every
/// `Connection` and with the `Aggregator`: no global state here, just a
/// dependency passed at construction.
#[derive(Default)]
pub struct Store {
    users: Mutex<HashMap<String, UserEntry>>,
}

impl Store {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a first-seen user. Returns `true` if this call created the
    /// record, `false` if the user was already known (in which case the
    /// existing experiment group is left untouched — a user cannot change
    /// cohort mid-session).
    pub fn ensure_user(&self, user_id: &str, experiment_group: ExperimentGroup, now_ms: u64) -> bool {
        let mut users = self.users.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        if users.contains_key(user_id) {
            return false;
        }
        users.insert(user_id.to_owned(), UserEntry::new(experiment_group, now_ms));
        true
    }

    /// Append a sample to a user's window, evicting the oldest sample on
    /// overflow: at most `WINDOW_SIZE` samples, time-ordered by
    /// `server_receive_ms`.
    ///
    /// If the user has not been registered via [`Store::ensure_user`] yet,
    /// one is created implicitly with `Control2` as a defensive fallback;
    /// in normal operation `Connection` always calls `ensure_user` first.
    pub fn append(&self, sample: Sample) {
        let mut users = self.users.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        let entry = users
            .entry(sample.user_id.clone())
            .or_insert_with(|| UserEntry::new(ExperimentGroup::Control2, sample.server_receive_ms));
        entry.last_arrival_ms = sample.server_receive_ms;
        if entry.samples.len() >= WINDOW_SIZE {
            entry.samples.pop_front();
        }
        entry.samples.push_back(sample);
    }

    /// Take a stable snapshot of every active user's window at `now_ms`.
    ///
    /// A user is active iff their window is non-empty and
    /// `now_ms - last_arrival_ms <= ACTIVE_WINDOW_MS` (3000 ms). The
    /// snapshot is a deep copy so the Aggregator can compute without holding
    /// the store lock; samples appear in arrival order.
    #[must_use]
    pub fn snapshot_active(&self, now_ms: u64) -> HashMap<String, Vec<Sample>> {
        let users = self.users.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        users
            .iter()
            .filter(|(_, entry)| entry.is_active(now_ms))
            .map(|(user_id, entry)| (user_id.clone(), entry.samples.iter().cloned().collect()))
            .collect()
    }

    /// Current window length for a user (for invariant tests and the debug
    /// endpoint). Returns `0` for an unknown user.
    #[must_use]
    pub fn window_len(&self, user_id: &str) -> usize {
        let users = self.users.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        users.get(user_id).map_or(0, |e| e.samples.len())
    }

    /// Row data for the `/debug/aggregation` endpoint: every currently
    /// active user, sample count, and last-arrival time.
    #[must_use]
    pub fn debug_aggregation(&self, now_ms: u64) -> Vec<DebugUserEntry> {
        let users = self.users.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        let mut rows: Vec<DebugUserEntry> = users
            .iter()
            .filter(|(_, entry)| entry.is_active(now_ms))
            .map(|(user_id, entry)| DebugUserEntry {
                user_id: user_id.clone(),
                sample_count: entry.samples.len(),
                last_arrival_ms: entry.last_arrival_ms,
            })
            .collect();
        rows.sort_by(|a, b| a.user_id.cmp(&b.user_id));
        rows
    }

    /// Experiment group for a known user, if registered.
    #[must_use]
    pub fn experiment_group(&self, user_id: &str) -> Option<ExperimentGroup> {
        let users = self.users.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        users.get(user_id).map(|e| e.experiment_group)
    }

    /// `created_ms` for a known user, if registered.
    #[must_use]
    pub fn created_ms(&self, user_id: &str) -> Option<u64> {
        let users = self.users.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        users.get(user_id).map(|e| e.created_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reaction_proto::{Events, States};

    fn sample(user_id: &str, ms: u64) -> Sample {
        Sample {
            user_id: user_id.to_owned(),
            server_receive_ms: ms,
            states: States::default(),
            events: Events::default(),
            video_time_seconds: None,
            session_id: None,
        }
    }

    #[test]
    fn window_never_exceeds_window_size() {
        let store = Store::new();
        store.ensure_user("u1", ExperimentGroup::Control2, 0);
        for i in 0..10u64 {
            store.append(sample("u1", i * 1000));
        }
        assert_eq!(store.window_len("u1"), WINDOW_SIZE);
    }

    #[test]
    fn ensure_user_is_idempotent() {
        let store = Store::new();
        assert!(store.ensure_user("u1", ExperimentGroup::Experiment, 0));
        assert!(!store.ensure_user("u1", ExperimentGroup::Debug, 100));
        assert_eq!(store.experiment_group("u1"), Some(ExperimentGroup::Experiment));
    }

    #[test]
    fn active_exactly_at_3000ms_boundary() {
        let store = Store::new();
        store.ensure_user("u1", ExperimentGroup::Control2, 0);
        store.append(sample("u1", 0));
        let active = store.snapshot_active(3000);
        assert!(active.contains_key("u1"));
        let inactive = store.snapshot_active(3001);
        assert!(!inactive.contains_key("u1"));
    }

    #[test]
    fn empty_window_is_never_active() {
        let store = Store::new();
        store.ensure_user("u1", ExperimentGroup::Control2, 0);
        assert!(store.snapshot_active(0).is_empty());
    }

    #[test]
    fn append_before_ensure_user_still_works() {
        let store = Store::new();
        store.append(sample("u1", 0));
        assert_eq!(store.window_len("u1"), 1);
    }

    #[test]
    fn snapshot_preserves_arrival_order() {
        let store = Store::new();
        store.ensure_user("u1", ExperimentGroup::Control2, 0);
        store.append(sample("u1", 0));
        store.append(sample("u1", 1000));
        store.append(sample("u1", 2000));
        let active = store.snapshot_active(2000);
        let samples = &active["u1"];
        let times: Vec<u64> = samples.iter().map(|s| s.server_receive_ms).collect();
        assert_eq!(times, vec![0, 1000, 2000]);
    }

    #[test]
    fn debug_aggregation_only_lists_active_users_sorted() {
        let store = Store::new();
        store.ensure_user("zed", ExperimentGroup::Control2, 0);
        store.ensure_user("amy", ExperimentGroup::Control2, 0);
        store.append(sample("zed", 0));
        store.append(sample("amy", 0));
        store.append(sample("amy", 1000));
        let rows = store.debug_aggregation(1000);
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].user_id, "amy");
        assert_eq!(rows[0].sample_count, 2);
        assert_eq!(rows[1].user_id, "zed");
        assert_eq!(rows[1].sample_count, 1);
    }
}
