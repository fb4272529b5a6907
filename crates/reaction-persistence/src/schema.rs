// SPDX-License-Identifier: Apache-2.0
//! Schema for the four append-only tables: users, reactions, effects, and
//! viewing sessions.

use rusqlite::Connection;

/// Create all tables if they do not already exist.
pub fn create_tables(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(SCHEMA_SQL)
}

const SCHEMA_SQL: &str = "
CREATE TABLE IF NOT EXISTS users (
    id TEXT PRIMARY KEY,
    experiment_group TEXT NOT NULL,
    created_at INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS reactions_log (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    user_id TEXT NOT NULL,
    timestamp INTEGER NOT NULL,
    is_smiling BOOLEAN,
    is_surprised BOOLEAN,
    is_concentrating BOOLEAN,
    is_hand_up BOOLEAN,
    nod_count INTEGER,
    sway_vertical_count INTEGER,
    sway_horizontal_count INTEGER,
    shake_head_count INTEGER,
    cheer_count INTEGER,
    clap_count INTEGER,
    video_time REAL,
    session_id TEXT
);

CREATE TABLE IF NOT EXISTS effects_log (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    timestamp INTEGER NOT NULL,
    effect_type TEXT NOT NULL,
    intensity REAL NOT NULL,
    duration_ms INTEGER NOT NULL,
    session_id TEXT,
    video_time REAL,
    active_users INTEGER
);

CREATE TABLE IF NOT EXISTS sessions (
    id TEXT PRIMARY KEY,
    user_id TEXT NOT NULL,
    video_id TEXT NOT NULL,
    started_at INTEGER NOT NULL,
    completed_at INTEGER
);

CREATE INDEX IF NOT EXISTS idx_reactions_log_user_id ON reactions_log(user_id);
CREATE INDEX IF NOT EXISTS idx_reactions_log_timestamp ON reactions_log(timestamp);
CREATE INDEX IF NOT EXISTS idx_effects_log_timestamp ON effects_log(timestamp);
";
