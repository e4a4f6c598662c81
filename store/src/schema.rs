//! Schema DDL for the per-project embedded database.
//!
//! Mirrors the table layout of the original `project_db.py` this crate was
//! ported from, with the database file renamed `state.db` per the core spec.

pub const SCHEMA_VERSION: i64 = 1;

pub const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS schema_version (
    version INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS runs (
    id                   TEXT PRIMARY KEY,
    loop_name            TEXT NOT NULL,
    status               TEXT NOT NULL,
    started_at           INTEGER NOT NULL,
    completed_at         INTEGER,
    iterations_completed INTEGER NOT NULL DEFAULT 0,
    items_generated      INTEGER NOT NULL DEFAULT 0,
    error_message        TEXT,
    executor_pid         INTEGER,
    last_activity_at     INTEGER
);
CREATE INDEX IF NOT EXISTS idx_runs_status ON runs(status);
CREATE INDEX IF NOT EXISTS idx_runs_loop_name ON runs(loop_name);

CREATE TABLE IF NOT EXISTS sessions (
    session_id       TEXT PRIMARY KEY,
    run_id           TEXT NOT NULL REFERENCES runs(id) ON DELETE CASCADE,
    iteration        INTEGER NOT NULL,
    mode             TEXT,
    started_at       INTEGER NOT NULL,
    duration_seconds REAL,
    status           TEXT,
    items_added      TEXT
);
CREATE INDEX IF NOT EXISTS idx_sessions_run ON sessions(run_id);

CREATE TABLE IF NOT EXISTS work_items (
    id              TEXT PRIMARY KEY,
    priority        INTEGER,
    content         TEXT NOT NULL,
    title           TEXT,
    status          TEXT NOT NULL DEFAULT 'pending',
    category        TEXT,
    tags            TEXT,
    metadata        TEXT,
    source_loop     TEXT,
    item_type       TEXT NOT NULL DEFAULT 'item',
    claimed_by      TEXT,
    claimed_at      INTEGER,
    processed_at    INTEGER,
    dependencies    TEXT,
    phase           INTEGER,
    duplicate_of    TEXT,
    skip_reason     TEXT,
    created_at      INTEGER NOT NULL,
    updated_at      INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_work_items_status ON work_items(status);
CREATE INDEX IF NOT EXISTS idx_work_items_category ON work_items(category);
CREATE INDEX IF NOT EXISTS idx_work_items_priority ON work_items(priority);
CREATE INDEX IF NOT EXISTS idx_work_items_created ON work_items(created_at);
CREATE INDEX IF NOT EXISTS idx_work_items_source_status ON work_items(source_loop, status);
CREATE INDEX IF NOT EXISTS idx_work_items_claimed ON work_items(claimed_by, claimed_at);
CREATE INDEX IF NOT EXISTS idx_work_items_phase ON work_items(phase);

CREATE TABLE IF NOT EXISTS input_files (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    loop_name   TEXT NOT NULL,
    file_name   TEXT NOT NULL,
    ingested_at INTEGER NOT NULL,
    UNIQUE(loop_name, file_name)
);
CREATE INDEX IF NOT EXISTS idx_input_files_loop ON input_files(loop_name);

CREATE TABLE IF NOT EXISTS resources (
    id                  INTEGER PRIMARY KEY AUTOINCREMENT,
    name                TEXT NOT NULL UNIQUE,
    resource_type       TEXT NOT NULL,
    file_path           TEXT NOT NULL,
    injection_position  TEXT NOT NULL DEFAULT 'after_design_doc',
    enabled             BOOLEAN NOT NULL DEFAULT 1,
    inherit_default     BOOLEAN NOT NULL DEFAULT 1,
    priority            INTEGER NOT NULL DEFAULT 100,
    created_at          INTEGER NOT NULL,
    updated_at          INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_resources_type ON resources(resource_type);
CREATE INDEX IF NOT EXISTS idx_resources_enabled ON resources(enabled);

CREATE TABLE IF NOT EXISTS resource_versions (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    resource_id INTEGER NOT NULL REFERENCES resources(id) ON DELETE CASCADE,
    name        TEXT NOT NULL,
    content     TEXT NOT NULL,
    created_at  INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_resource_versions_resource ON resource_versions(resource_id, created_at);

CREATE TABLE IF NOT EXISTS logs (
    id        INTEGER PRIMARY KEY AUTOINCREMENT,
    run_id    TEXT,
    level     TEXT NOT NULL,
    message   TEXT NOT NULL,
    timestamp INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_logs_run_ts ON logs(run_id, timestamp);
CREATE INDEX IF NOT EXISTS idx_logs_level_ts ON logs(level, timestamp);

CREATE TABLE IF NOT EXISTS credentials (
    scope       TEXT NOT NULL,
    scope_id    TEXT NOT NULL DEFAULT '',
    service     TEXT NOT NULL,
    access_token  TEXT NOT NULL,
    refresh_token TEXT,
    expires_at    INTEGER,
    updated_at    INTEGER NOT NULL,
    PRIMARY KEY (scope, scope_id, service)
);
"#;
