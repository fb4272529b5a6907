// SPDX-License-Identifier: Apache-2.0
//! Append-only persistence for users, reactions, effects, and sessions.
//!
//! Every write is best-effort: a failure is logged to the operator channel
//! (`tracing::warn!`) and swallowed — it must never abort a `Connection` or
//! halt the `Aggregator`. Writes run on `tokio::task::spawn_blocking` since
//! `rusqlite` is synchronous; this keeps that latency off the async
//! scheduler's worker threads entirely.

mod schema;

use std::sync::{Arc, Mutex};

use reaction_proto::{Effect, Sample, Session, UserRecord};
use rusqlite::Connection;
use serde::Serialize;
use thiserror::Error;
use tracing::warn;

/// Errors surfaced only by read paths (`/debug/database`) and by
/// [`Persistence::open`]; write paths never return an error — they log and
/// continue instead.
#[derive(Debug, Error)]
pub enum PersistError {
    /// The underlying SQLite operation failed.
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    /// The blocking task running the query was cancelled or panicked.
    #[error("database task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

/// Row counts for each of the four tables, for `/debug/database`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TableCounts {
    /// Row count of `users`.
    pub users: i64,
    /// Row count of `reactions_log`.
    pub reactions_log: i64,
    /// Row count of `effects_log`.
    pub effects_log: i64,
    /// Row count of `sessions`.
    pub sessions: i64,
}

/// One row of `reactions_log`, as read back for the debug endpoint.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReactionRow {
    /// Autoincrement primary key.
    pub id: i64,
    /// Reporting user.
    pub user_id: String,
    /// Server-receive timestamp, in milliseconds.
    pub timestamp: i64,
    /// `isSmiling` at the time of the sample.
    pub is_smiling: bool,
    /// `isSurprised` at the time of the sample.
    pub is_surprised: bool,
    /// `isConcentrating` at the time of the sample.
    pub is_concentrating: bool,
    /// `isHandUp` at the time of the sample.
    pub is_hand_up: bool,
    /// Client-reported video playback position, if any.
    pub video_time: Option<f64>,
    /// Opaque session tag, if any.
    pub session_id: Option<String>,
}

/// One row of `effects_log`, as read back for the debug endpoint.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EffectRow {
    /// Autoincrement primary key.
    pub id: i64,
    /// Server send time, in milliseconds.
    pub timestamp: i64,
    /// Wire name of the effect.
    pub effect_type: String,
    /// Intensity in `[0, 1]`.
    pub intensity: f64,
    /// Duration in milliseconds.
    pub duration_ms: i64,
    /// Active-user count at decision time, if recorded.
    pub active_users: Option<i64>,
}

/// SQLite-backed append log shared across every `Connection` and the
/// `Aggregator`.
#[derive(Clone)]
pub struct Persistence {
    conn: Arc<Mutex<Connection>>,
}

/// Resolve `DATABASE_URL`-style input to a path `rusqlite::Connection::open`
/// understands. Accepts a bare path, `:memory:`, or a `sqlite://` prefix.
fn resolve_path(database_url: &str) -> &str {
    database_url
        .strip_prefix("sqlite://")
        .unwrap_or(database_url)
}

/// `rusqlite` has no `ToSql` impl for `u64`; every millisecond timestamp
/// crosses that boundary as `i64`, saturating rather than wrapping.
fn ms_to_sql(ms: u64) -> i64 {
    i64::try_from(ms).unwrap_or(i64::MAX)
}

impl Persistence {
    /// Open (creating if absent) the SQLite database at `database_url` and
    /// ensure the schema exists.
    ///
    /// # Errors
    /// Returns [`PersistError`] if the file cannot be opened or the schema
    /// cannot be created — both are fatal configuration errors at boot.
    pub fn open(database_url: &str) -> Result<Self, PersistError> {
        let conn = Connection::open(resolve_path(database_url))?;
        schema::create_tables(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Open an in-memory database. Used by tests and by any deployment that
    /// intentionally forgoes durability.
    ///
    /// # Errors
    /// Returns [`PersistError`] if the schema cannot be created.
    pub fn open_in_memory() -> Result<Self, PersistError> {
        Self::open(":memory:")
    }

    fn with_conn<T, F>(&self, f: F) -> rusqlite::Result<T>
    where
        F: FnOnce(&Connection) -> rusqlite::Result<T>,
    {
        let conn = self.conn.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        f(&conn)
    }

    /// Insert a `users` row if `user_id` is not already present. Best-effort:
    /// failures are logged and swallowed.
    pub async fn ensure_user_row(&self, user: &UserRecord) {
        let this = self.clone();
        let user = user.clone();
        let created_ms = ms_to_sql(user.created_ms);
        let result = tokio::task::spawn_blocking(move || {
            this.with_conn(|conn| {
                conn.execute(
                    "INSERT OR IGNORE INTO users (id, experiment_group, created_at) VALUES (?1, ?2, ?3)",
                    rusqlite::params![user.user_id, user.experiment_group.as_str(), created_ms],
                )
            })
        })
        .await;
        log_write_failure("ensure_user_row", result);
    }

    /// Append one `reactions_log` row. Best-effort.
    pub async fn log_reaction(&self, sample: &Sample) {
        let this = self.clone();
        let sample = sample.clone();
        let server_receive_ms = ms_to_sql(sample.server_receive_ms);
        let result = tokio::task::spawn_blocking(move || {
            this.with_conn(|conn| {
                conn.execute(
                    "INSERT INTO reactions_log (
                        user_id, timestamp, is_smiling, is_surprised, is_concentrating, is_hand_up,
                        nod_count, sway_vertical_count, sway_horizontal_count, shake_head_count,
                        cheer_count, clap_count, video_time, session_id
                    ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
                    rusqlite::params![
                        sample.user_id,
                        server_receive_ms,
                        sample.states.is_smiling,
                        sample.states.is_surprised,
                        sample.states.is_concentrating,
                        sample.states.is_hand_up,
                        sample.events.nod,
                        sample.events.sway_vertical,
                        sample.events.sway_horizontal,
                        sample.events.shake_head,
                        sample.events.cheer,
                        sample.events.clap,
                        sample.video_time_seconds,
                        sample.session_id,
                    ],
                )
            })
        })
        .await;
        log_write_failure("log_reaction", result);
    }

    /// Append one `effects_log` row. Best-effort. Called before the
    /// broadcast fan-out so the decision survives a send failure.
    pub async fn log_effect(
        &self,
        effect: &Effect,
        active_users: usize,
        session_id: Option<&str>,
        video_time: Option<f64>,
    ) {
        let this = self.clone();
        let effect_type = effect.effect_type.as_str();
        let intensity = effect.intensity;
        let duration_ms = ms_to_sql(effect.duration_ms);
        let timestamp = ms_to_sql(effect.server_send_ms);
        let session_id = session_id.map(str::to_owned);
        let active_users = i64::try_from(active_users).unwrap_or(i64::MAX);
        let result = tokio::task::spawn_blocking(move || {
            this.with_conn(|conn| {
                conn.execute(
                    "INSERT INTO effects_log (
                        timestamp, effect_type, intensity, duration_ms, session_id, video_time, active_users
                    ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                    rusqlite::params![
                        timestamp,
                        effect_type,
                        intensity,
                        duration_ms,
                        session_id,
                        video_time,
                        active_users,
                    ],
                )
            })
        })
        .await;
        log_write_failure("log_effect", result);
    }

    /// Insert a `sessions` row at video-play start. Best-effort.
    pub async fn session_create(&self, session: &Session) {
        let this = self.clone();
        let session = session.clone();
        let started_ms = ms_to_sql(session.started_ms);
        let result = tokio::task::spawn_blocking(move || {
            this.with_conn(|conn| {
                conn.execute(
                    "INSERT OR IGNORE INTO sessions (id, user_id, video_id, started_at) VALUES (?1, ?2, ?3, ?4)",
                    rusqlite::params![session.session_id, session.user_id, session.video_id, started_ms],
                )
            })
        })
        .await;
        log_write_failure("session_create", result);
    }

    /// Set `completed_at` on an existing `sessions` row. Best-effort.
    pub async fn session_complete(&self, session_id: &str, completed_ms: u64) {
        let this = self.clone();
        let session_id = session_id.to_owned();
        let completed_ms = ms_to_sql(completed_ms);
        let result = tokio::task::spawn_blocking(move || {
            this.with_conn(|conn| {
                conn.execute(
                    "UPDATE sessions SET completed_at = ?1 WHERE id = ?2",
                    rusqlite::params![completed_ms, session_id],
                )
            })
        })
        .await;
        log_write_failure("session_complete", result);
    }

    /// Row counts across all four tables, for `/debug/database`.
    ///
    /// # Errors
    /// Returns [`PersistError`] on a query failure; this is a read path, so
    /// unlike the writes above the caller decides how to present the
    /// failure (the boundary maps it to an HTTP 500).
    pub async fn table_counts(&self) -> Result<TableCounts, PersistError> {
        let this = self.clone();
        let counts = tokio::task::spawn_blocking(move || {
            this.with_conn(|conn| {
                let count = |table: &str| -> rusqlite::Result<i64> {
                    conn.query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |row| row.get(0))
                };
                Ok(TableCounts {
                    users: count("users")?,
                    reactions_log: count("reactions_log")?,
                    effects_log: count("effects_log")?,
                    sessions: count("sessions")?,
                })
            })
        })
        .await??;
        Ok(counts)
    }

    /// The most recent `limit` rows of `reactions_log`, newest first.
    ///
    /// # Errors
    /// Returns [`PersistError`] on a query failure.
    pub async fn recent_reactions(&self, limit: usize) -> Result<Vec<ReactionRow>, PersistError> {
        let this = self.clone();
        let rows = tokio::task::spawn_blocking(move || {
            this.with_conn(|conn| {
                let mut stmt = conn.prepare(
                    "SELECT id, user_id, timestamp, is_smiling, is_surprised, is_concentrating,
                            is_hand_up, video_time, session_id
                     FROM reactions_log ORDER BY id DESC LIMIT ?1",
                )?;
                let rows = stmt
                    .query_map(rusqlite::params![i64::try_from(limit).unwrap_or(i64::MAX)], |row| {
                        Ok(ReactionRow {
                            id: row.get(0)?,
                            user_id: row.get(1)?,
                            timestamp: row.get(2)?,
                            is_smiling: row.get(3)?,
                            is_surprised: row.get(4)?,
                            is_concentrating: row.get(5)?,
                            is_hand_up: row.get(6)?,
                            video_time: row.get(7)?,
                            session_id: row.get(8)?,
                        })
                    })?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                Ok(rows)
            })
        })
        .await??;
        Ok(rows)
    }

    /// The most recent `limit` rows of `effects_log`, newest first.
    ///
    /// # Errors
    /// Returns [`PersistError`] on a query failure.
    pub async fn recent_effects(&self, limit: usize) -> Result<Vec<EffectRow>, PersistError> {
        let this = self.clone();
        let rows = tokio::task::spawn_blocking(move || {
            this.with_conn(|conn| {
                let mut stmt = conn.prepare(
                    "SELECT id, timestamp, effect_type, intensity, duration_ms, active_users
                     FROM effects_log ORDER BY id DESC LIMIT ?1",
                )?;
                let rows = stmt
                    .query_map(rusqlite::params![i64::try_from(limit).unwrap_or(i64::MAX)], |row| {
                        Ok(EffectRow {
                            id: row.get(0)?,
                            timestamp: row.get(1)?,
                            effect_type: row.get(2)?,
                            intensity: row.get(3)?,
                            duration_ms: row.get(4)?,
                            active_users: row.get(5)?,
                        })
                    })?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                Ok(rows)
            })
        })
        .await??;
        Ok(rows)
    }
}

fn log_write_failure(op: &'static str, result: Result<rusqlite::Result<usize>, tokio::task::JoinError>) {
    match result {
        Ok(Ok(_)) => {}
        Ok(Err(err)) => warn!(%op, error = %err, "persistence write failed"),
        Err(err) => warn!(%op, error = %err, "persistence task failed"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reaction_proto::{EffectDebug, EffectType, Events, ExperimentGroup, States};

    fn user(id: &str) -> UserRecord {
        UserRecord {
            user_id: id.to_owned(),
            experiment_group: ExperimentGroup::Control2,
            created_ms: 0,
        }
    }

    fn sample(id: &str, ms: u64) -> Sample {
        Sample {
            user_id: id.to_owned(),
            server_receive_ms: ms,
            states: States {
                is_smiling: true,
                ..States::default()
            },
            events: Events::default(),
            video_time_seconds: Some(1.5),
            session_id: Some("s1".to_owned()),
        }
    }

    #[tokio::test]
    async fn ensure_user_row_is_idempotent() {
        let db = Persistence::open_in_memory().unwrap();
        db.ensure_user_row(&user("u1")).await;
        db.ensure_user_row(&user("u1")).await;
        let counts = db.table_counts().await.unwrap();
        assert_eq!(counts.users, 1);
    }

    #[tokio::test]
    async fn log_reaction_increments_row_count() {
        let db = Persistence::open_in_memory().unwrap();
        db.log_reaction(&sample("u1", 1000)).await;
        db.log_reaction(&sample("u1", 2000)).await;
        let counts = db.table_counts().await.unwrap();
        assert_eq!(counts.reactions_log, 2);
        let rows = db.recent_reactions(10).await.unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].timestamp, 2000);
        assert!(rows[0].is_smiling);
    }

    #[tokio::test]
    async fn log_effect_writes_exactly_one_row_per_call() {
        let db = Persistence::open_in_memory().unwrap();
        let effect = Effect {
            effect_type: EffectType::Sparkle,
            intensity: 1.0,
            duration_ms: 2000,
            server_send_ms: 5000,
            debug: Some(EffectDebug {
                active_users: 1,
                ratio_state: std::collections::BTreeMap::new(),
                density_event: std::collections::BTreeMap::new(),
            }),
        };
        db.log_effect(&effect, 1, Some("s1"), Some(3.0)).await;
        let counts = db.table_counts().await.unwrap();
        assert_eq!(counts.effects_log, 1);
    }

    #[tokio::test]
    async fn session_create_then_complete() {
        let db = Persistence::open_in_memory().unwrap();
        db.session_create(&Session {
            session_id: "s1".to_owned(),
            user_id: "u1".to_owned(),
            video_id: "v1".to_owned(),
            started_ms: 0,
        })
        .await;
        db.session_complete("s1", 9000).await;
        let counts = db.table_counts().await.unwrap();
        assert_eq!(counts.sessions, 1);
    }

    #[tokio::test]
    async fn orphan_reaction_row_is_not_rejected() {
        // users row is not inserted first here; reactions_log has no
        // enforced foreign key, so this must still succeed.
        let db = Persistence::open_in_memory().unwrap();
        db.log_reaction(&sample("ghost", 1000)).await;
        let counts = db.table_counts().await.unwrap();
        assert_eq!(counts.reactions_log, 1);
    }
}
