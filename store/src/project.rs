//! Per-project embedded store: work items, runs, sessions, resources, logs.
//!
//! Ported from `project_db.py`'s hand-written SQL methods rather than from a
//! generic record abstraction — the atomic claim/release/optimistic-lock
//! operations this component must expose (§4.1) don't fit a generic
//! get/list/update-by-id shape, so each gets its own statement, same as the
//! source.

use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use log::debug;
use rusqlite::{Connection, OptionalExtension, Row, params};

use crate::error::{StoreError, StoreResult};
use crate::model::*;
use crate::schema::{SCHEMA_SQL, SCHEMA_VERSION};
use crate::util::now_secs;

/// Seeds or advances `schema_version` within the caller's open transaction
/// (§4.1 "Schema migration: versioned; on open, applies missing migrations
/// in order"). There is only one schema generation so far, so "applying
/// missing migrations" is just seeding the row; a future `SCHEMA_VERSION`
/// bump would add the matching `ALTER TABLE`/backfill steps here, guarded by
/// `current < N`, before recording the new version.
fn apply_schema_migrations(conn: &Connection) -> StoreResult<()> {
    let current: Option<i64> =
        conn.query_row("SELECT version FROM schema_version ORDER BY version DESC LIMIT 1", [], |row| row.get(0)).optional()?;
    if current.unwrap_or(0) < SCHEMA_VERSION {
        conn.execute("INSERT INTO schema_version (version) VALUES (?1)", params![SCHEMA_VERSION])?;
    }
    Ok(())
}

pub struct ProjectStore {
    conn: Mutex<Connection>,
}

impl ProjectStore {
    /// Opens (creating if absent) the project's embedded database at `path`,
    /// typically `<project>/.ralphx/state.db`.
    pub fn open(path: impl AsRef<Path>) -> StoreResult<Self> {
        let path = path.as_ref();
        debug!("ProjectStore::open: {:?}", path);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        conn.busy_timeout(Duration::from_secs(30))?;
        conn.execute_batch(SCHEMA_SQL)?;
        apply_schema_migrations(&conn)?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mut perms = fs::metadata(path)?.permissions();
            perms.set_mode(0o600);
            fs::set_permissions(path, perms)?;
        }

        Ok(Self { conn: Mutex::new(conn) })
    }

    /// Opens an in-memory store, for tests.
    #[cfg(any(test, feature = "test-util"))]
    pub fn open_in_memory() -> StoreResult<Self> {
        let conn = Connection::open_in_memory()?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        conn.execute_batch(SCHEMA_SQL)?;
        apply_schema_migrations(&conn)?;
        Ok(Self { conn: Mutex::new(conn) })
    }

    fn lock(&self) -> StoreResult<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| StoreError::LockPoisoned)
    }

    /// Checkpoints the WAL file. Safe to call from any reader.
    pub fn sync(&self) -> StoreResult<()> {
        let conn = self.lock()?;
        conn.pragma_update(None, "wal_checkpoint", "PASSIVE")?;
        Ok(())
    }

    // ---------------------------------------------------------------- work items

    pub fn create_work_item(&self, item: NewWorkItem) -> StoreResult<WorkItem> {
        let conn = self.lock()?;
        let now = now_secs();
        let status = item.status.unwrap_or(WorkItemStatus::Pending);
        conn.execute(
            "INSERT INTO work_items (id, priority, content, title, status, category, tags, metadata,
                                      source_loop, item_type, dependencies, phase, created_at, updated_at)
             VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?13)",
            params![
                item.id,
                item.priority,
                item.content,
                item.title,
                status.as_str(),
                item.category,
                serde_json::to_string(&item.tags)?,
                serde_json::to_string(&item.metadata)?,
                item.source_loop,
                item.item_type,
                serde_json::to_string(&item.dependencies)?,
                item.phase,
                now,
            ],
        )?;
        drop(conn);
        self.get_work_item(&item.id)?.ok_or_else(|| StoreError::NotFound(item.id))
    }

    pub fn get_work_item(&self, id: &str) -> StoreResult<Option<WorkItem>> {
        let conn = self.lock()?;
        conn.query_row("SELECT * FROM work_items WHERE id = ?1", params![id], row_to_work_item)
            .optional()
            .map_err(StoreError::from)
    }

    pub fn list_work_items(&self, filter: &WorkItemFilter) -> StoreResult<Vec<WorkItem>> {
        let conn = self.lock()?;
        let mut sql = String::from("SELECT * FROM work_items WHERE 1=1");
        let mut binds: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();

        if let Some(v) = &filter.source_loop {
            sql.push_str(" AND source_loop = ?");
            binds.push(Box::new(v.clone()));
        }
        if let Some(v) = filter.status {
            sql.push_str(" AND status = ?");
            binds.push(Box::new(v.as_str().to_string()));
        }
        if let Some(v) = &filter.category {
            sql.push_str(" AND category = ?");
            binds.push(Box::new(v.clone()));
        }
        if let Some(v) = &filter.claimed_by {
            sql.push_str(" AND claimed_by = ?");
            binds.push(Box::new(v.clone()));
        }
        sql.push_str(" ORDER BY priority ASC, created_at DESC");
        if let Some(limit) = filter.limit {
            sql.push_str(&format!(" LIMIT {}", limit));
        }

        let mut stmt = conn.prepare(&sql)?;
        let params_refs: Vec<&dyn rusqlite::ToSql> = binds.iter().map(|b| b.as_ref()).collect();
        let rows = stmt.query_map(params_refs.as_slice(), row_to_work_item)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    /// `UPDATE ... WHERE status IN (pending, completed) AND claimed_by IS NULL` —
    /// the single conditional statement that makes claims mutually exclusive (§8.1).
    pub fn claim_work_item(&self, id: &str, claimer: &str) -> StoreResult<bool> {
        let conn = self.lock()?;
        let now = now_secs();
        let n = conn.execute(
            "UPDATE work_items SET claimed_by = ?1, claimed_at = ?2, status = 'claimed', updated_at = ?2
             WHERE id = ?3 AND status IN ('pending', 'completed') AND claimed_by IS NULL",
            params![claimer, now, id],
        )?;
        Ok(n > 0)
    }

    const RELEASE_STATUS_CASE: &'static str =
        "status = CASE WHEN source_loop IS NOT NULL THEN 'completed' ELSE 'pending' END";

    /// Ownership check and release in one statement — no TOCTOU (§4.1).
    pub fn release_work_item_claim(&self, id: &str, claimer: &str) -> StoreResult<bool> {
        let conn = self.lock()?;
        let now = now_secs();
        let sql = format!(
            "UPDATE work_items SET claimed_by = NULL, claimed_at = NULL, {}, updated_at = ?1
             WHERE id = ?2 AND claimed_by = ?3 AND status = 'claimed'",
            Self::RELEASE_STATUS_CASE
        );
        let n = conn.execute(&sql, params![now, id, claimer])?;
        Ok(n > 0)
    }

    pub fn mark_work_item_processed(&self, id: &str, claimer: &str) -> StoreResult<bool> {
        let conn = self.lock()?;
        let now = now_secs();
        let n = conn.execute(
            "UPDATE work_items SET status = 'processed', processed_at = ?1, updated_at = ?1
             WHERE id = ?2 AND claimed_by = ?3",
            params![now, id, claimer],
        )?;
        Ok(n > 0)
    }

    /// Applies a structured-status completion outcome (§4.4). Metadata is merged, not replaced.
    pub fn complete_work_item(&self, id: &str, claimer: &str, outcome: CompletionOutcome) -> StoreResult<bool> {
        let conn = self.lock()?;
        let now = now_secs();
        let existing: Option<String> = conn
            .query_row(
                "SELECT metadata FROM work_items WHERE id = ?1 AND claimed_by = ?2",
                params![id, claimer],
                |r| r.get(0),
            )
            .optional()?;
        let Some(existing) = existing else { return Ok(false) };
        let mut metadata: serde_json::Value = serde_json::from_str(&existing)?;

        let (status, duplicate_of, skip_reason) = match outcome {
            CompletionOutcome::Processed { merge_metadata } => {
                merge_json(&mut metadata, merge_metadata);
                ("processed", None, None)
            }
            CompletionOutcome::Duplicate { duplicate_of } => ("duplicate", Some(duplicate_of), None),
            CompletionOutcome::Skipped { skip_reason } => ("skipped", None, Some(skip_reason)),
            CompletionOutcome::External { merge_metadata } => {
                merge_json(&mut metadata, merge_metadata);
                ("external", None, None)
            }
            CompletionOutcome::Failed => ("failed", None, None),
        };

        let n = conn.execute(
            "UPDATE work_items SET status = ?1, duplicate_of = ?2, skip_reason = ?3, metadata = ?4,
                                   processed_at = ?5, updated_at = ?5
             WHERE id = ?6 AND claimed_by = ?7",
            params![status, duplicate_of, skip_reason, serde_json::to_string(&metadata)?, now, id, claimer],
        )?;
        Ok(n > 0)
    }

    /// Releases every claim older than `max_age`. Returns the number released.
    pub fn release_stale_claims(&self, max_age: Duration) -> StoreResult<usize> {
        let conn = self.lock()?;
        let now = now_secs();
        let cutoff = now - max_age.as_secs() as i64;
        let sql = format!(
            "UPDATE work_items SET claimed_by = NULL, claimed_at = NULL, {}, updated_at = ?1
             WHERE claimed_at < ?2 AND claimed_by IS NOT NULL AND status = 'claimed'",
            Self::RELEASE_STATUS_CASE
        );
        let n = conn.execute(&sql, params![now, cutoff])?;
        Ok(n)
    }

    /// Unblocks every item held by `loop_name`, e.g. on loop deletion.
    pub fn release_claims_by_loop(&self, loop_name: &str) -> StoreResult<usize> {
        let conn = self.lock()?;
        let now = now_secs();
        let sql = format!(
            "UPDATE work_items SET claimed_by = NULL, claimed_at = NULL, {}, updated_at = ?1
             WHERE claimed_by = ?2 AND status = 'claimed'",
            Self::RELEASE_STATUS_CASE
        );
        let n = conn.execute(&sql, params![now, loop_name])?;
        Ok(n)
    }

    pub fn work_item_stats(&self) -> StoreResult<WorkItemStats> {
        let conn = self.lock()?;
        let mut stats = WorkItemStats::default();

        let mut stmt = conn.prepare("SELECT status, COUNT(*) FROM work_items GROUP BY status")?;
        let rows = stmt.query_map([], |r| Ok((r.get::<_, String>(0)?, r.get::<_, i64>(1)?)))?;
        for row in rows {
            let (status, count) = row?;
            stats.total += count;
            stats.by_status.insert(status, count);
        }

        let mut stmt = conn.prepare(
            "SELECT COALESCE(category, 'uncategorized'), COUNT(*) FROM work_items GROUP BY category",
        )?;
        let rows = stmt.query_map([], |r| Ok((r.get::<_, String>(0)?, r.get::<_, i64>(1)?)))?;
        for row in rows {
            let (category, count) = row?;
            stats.by_category.insert(category, count);
        }

        let mut stmt =
            conn.prepare("SELECT COALESCE(priority, 0), COUNT(*) FROM work_items GROUP BY priority")?;
        let rows = stmt.query_map([], |r| Ok((r.get::<_, i64>(0)?, r.get::<_, i64>(1)?)))?;
        for row in rows {
            let (priority, count) = row?;
            stats.by_priority.insert(priority, count);
        }

        Ok(stats)
    }

    pub fn source_item_counts(&self) -> StoreResult<HashMap<String, i64>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT source_loop, COUNT(*) FROM work_items
             WHERE status = 'processed' AND source_loop IS NOT NULL GROUP BY source_loop",
        )?;
        let rows = stmt.query_map([], |r| Ok((r.get::<_, String>(0)?, r.get::<_, i64>(1)?)))?;
        let mut out = HashMap::new();
        for row in rows {
            let (loop_name, count) = row?;
            out.insert(loop_name, count);
        }
        Ok(out)
    }

    // ---------------------------------------------------------------- runs

    pub fn create_run(&self, id: &str, loop_name: &str) -> StoreResult<Run> {
        let conn = self.lock()?;
        let now = now_secs();
        conn.execute(
            "INSERT INTO runs (id, loop_name, status, started_at, iterations_completed, items_generated,
                                executor_pid, last_activity_at)
             VALUES (?1, ?2, 'active', ?3, 0, 0, ?4, ?3)",
            params![id, loop_name, now, std::process::id() as i64],
        )?;
        drop(conn);
        self.get_run(id)?.ok_or_else(|| StoreError::NotFound(id.to_string()))
    }

    pub fn get_run(&self, id: &str) -> StoreResult<Option<Run>> {
        let conn = self.lock()?;
        conn.query_row("SELECT * FROM runs WHERE id = ?1", params![id], row_to_run)
            .optional()
            .map_err(StoreError::from)
    }

    pub fn list_runs(&self, status: Option<RunStatus>) -> StoreResult<Vec<Run>> {
        let conn = self.lock()?;
        let mut stmt;
        let rows_iter;
        let mut out = Vec::new();
        if let Some(status) = status {
            stmt = conn.prepare("SELECT * FROM runs WHERE status = ?1 ORDER BY started_at DESC")?;
            rows_iter = stmt.query_map(params![status.as_str()], row_to_run)?;
        } else {
            stmt = conn.prepare("SELECT * FROM runs ORDER BY started_at DESC")?;
            rows_iter = stmt.query_map([], row_to_run)?;
        }
        for row in rows_iter {
            out.push(row?);
        }
        Ok(out)
    }

    /// Whitelisted column update (status / completed_at / error_message). Other
    /// columns (iterations_completed, items_generated) only move through
    /// [`Self::increment_run_counters`].
    pub fn update_run(&self, id: &str, patch: RunPatch) -> StoreResult<()> {
        let conn = self.lock()?;
        if let Some(status) = patch.status {
            conn.execute("UPDATE runs SET status = ?1 WHERE id = ?2", params![status.as_str(), id])?;
        }
        if let Some(completed_at) = patch.completed_at {
            conn.execute("UPDATE runs SET completed_at = ?1 WHERE id = ?2", params![completed_at, id])?;
        }
        if let Some(error_message) = patch.error_message {
            conn.execute("UPDATE runs SET error_message = ?1 WHERE id = ?2", params![error_message, id])?;
        }
        Ok(())
    }

    /// Single-statement atomic add, used instead of read-modify-write (§4.1).
    pub fn increment_run_counters(&self, id: &str, iterations: i64, items: i64) -> StoreResult<()> {
        let conn = self.lock()?;
        conn.execute(
            "UPDATE runs SET iterations_completed = iterations_completed + ?1,
                              items_generated = items_generated + ?2 WHERE id = ?3",
            params![iterations, items, id],
        )?;
        Ok(())
    }

    pub fn touch_run_activity(&self, id: &str) -> StoreResult<()> {
        let conn = self.lock()?;
        conn.execute(
            "UPDATE runs SET last_activity_at = ?1 WHERE id = ?2",
            params![now_secs(), id],
        )?;
        Ok(())
    }

    // ---------------------------------------------------------------- sessions

    pub fn create_session(&self, session: &Session) -> StoreResult<()> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO sessions (session_id, run_id, iteration, mode, started_at, duration_seconds,
                                    status, items_added)
             VALUES (?1,?2,?3,?4,?5,?6,?7,?8)",
            params![
                session.session_id,
                session.run_id,
                session.iteration,
                session.mode,
                session.started_at,
                session.duration_seconds,
                session.status,
                serde_json::to_string(&session.items_added)?,
            ],
        )?;
        Ok(())
    }

    pub fn list_sessions_for_run(&self, run_id: &str) -> StoreResult<Vec<Session>> {
        let conn = self.lock()?;
        let mut stmt =
            conn.prepare("SELECT * FROM sessions WHERE run_id = ?1 ORDER BY started_at ASC")?;
        let rows = stmt.query_map(params![run_id], row_to_session)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    // ---------------------------------------------------------------- resources

    pub fn create_resource(&self, new: NewResource) -> StoreResult<Resource> {
        let conn = self.lock()?;
        let now = now_secs();
        conn.execute(
            "INSERT INTO resources (name, resource_type, file_path, injection_position, enabled,
                                     inherit_default, priority, created_at, updated_at)
             VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?8)",
            params![
                new.name,
                new.resource_type.as_str(),
                new.file_path,
                new.injection_position.as_str(),
                new.enabled,
                new.inherit_default,
                new.priority,
                now,
            ],
        )?;
        let id = conn.last_insert_rowid();
        drop(conn);
        self.get_resource(id)?.ok_or_else(|| StoreError::NotFound(new.name))
    }

    pub fn get_resource(&self, id: i64) -> StoreResult<Option<Resource>> {
        let conn = self.lock()?;
        conn.query_row("SELECT * FROM resources WHERE id = ?1", params![id], row_to_resource)
            .optional()
            .map_err(StoreError::from)
    }

    pub fn get_resource_by_name(&self, name: &str) -> StoreResult<Option<Resource>> {
        let conn = self.lock()?;
        conn.query_row("SELECT * FROM resources WHERE name = ?1", params![name], row_to_resource)
            .optional()
            .map_err(StoreError::from)
    }

    pub fn list_resources(&self, filter: &ResourceFilter) -> StoreResult<Vec<Resource>> {
        let conn = self.lock()?;
        let mut sql = String::from("SELECT * FROM resources WHERE 1=1");
        let mut binds: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();
        if let Some(t) = filter.resource_type {
            sql.push_str(" AND resource_type = ?");
            binds.push(Box::new(t.as_str().to_string()));
        }
        if let Some(e) = filter.enabled {
            sql.push_str(" AND enabled = ?");
            binds.push(Box::new(e));
        }
        if let Some(i) = filter.inherit_default {
            sql.push_str(" AND inherit_default = ?");
            binds.push(Box::new(i));
        }
        sql.push_str(" ORDER BY priority ASC, name ASC");

        let mut stmt = conn.prepare(&sql)?;
        let params_refs: Vec<&dyn rusqlite::ToSql> = binds.iter().map(|b| b.as_ref()).collect();
        let rows = stmt.query_map(params_refs.as_slice(), row_to_resource)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    pub fn delete_resource(&self, id: i64) -> StoreResult<bool> {
        let conn = self.lock()?;
        let n = conn.execute("DELETE FROM resources WHERE id = ?1", params![id])?;
        Ok(n > 0)
    }

    /// Applies an edit per §4.7: optimistic-lock check, pre-edit version
    /// snapshot iff content/name changed, then update.
    pub fn update_workflow_resource(&self, id: i64, edit: ResourceEdit) -> StoreResult<ResourceUpdateOutcome> {
        let conn = self.lock()?;
        let current = conn
            .query_row("SELECT * FROM resources WHERE id = ?1", params![id], row_to_resource)
            .optional()?
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;

        if let Some(expected) = edit.expected_updated_at {
            if expected != current.updated_at {
                return Ok(ResourceUpdateOutcome::Conflict { current });
            }
        }

        let now = now_secs();
        let name_changed = edit.name.as_ref().is_some_and(|n| n != &current.name);
        let content_changed = edit.content.is_some();

        if name_changed || content_changed {
            let prior_content = fs::read_to_string(&current.file_path).unwrap_or_default();
            conn.execute(
                "INSERT INTO resource_versions (resource_id, name, content, created_at) VALUES (?1,?2,?3,?4)",
                params![id, current.name, prior_content, now],
            )?;
            prune_resource_versions_locked(&conn, id, DEFAULT_KEEP_VERSIONS)?;
        }

        if let Some(content) = &edit.content {
            fs::write(&current.file_path, content)?;
        }

        let name = edit.name.unwrap_or(current.name);
        let enabled = edit.enabled.unwrap_or(current.enabled);
        let inherit_default = edit.inherit_default.unwrap_or(current.inherit_default);
        let priority = edit.priority.unwrap_or(current.priority);
        let injection_position = edit.injection_position.unwrap_or(current.injection_position);

        conn.execute(
            "UPDATE resources SET name=?1, enabled=?2, inherit_default=?3, priority=?4,
                                   injection_position=?5, updated_at=?6 WHERE id=?7",
            params![name, enabled, inherit_default, priority, injection_position.as_str(), now, id],
        )?;

        let updated = conn
            .query_row("SELECT * FROM resources WHERE id = ?1", params![id], row_to_resource)?;
        Ok(ResourceUpdateOutcome::Updated(updated))
    }

    pub fn list_resource_versions(&self, resource_id: i64) -> StoreResult<Vec<ResourceVersion>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT * FROM resource_versions WHERE resource_id = ?1 ORDER BY created_at DESC, id DESC",
        )?;
        let rows = stmt.query_map(params![resource_id], row_to_resource_version)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    /// Snapshots the current state first, then overwrites from `version_id`.
    /// Returns `None` if the version belongs to a different resource.
    pub fn restore_resource_version(&self, resource_id: i64, version_id: i64) -> StoreResult<Option<Resource>> {
        let conn = self.lock()?;
        let version = conn
            .query_row(
                "SELECT * FROM resource_versions WHERE id = ?1",
                params![version_id],
                row_to_resource_version,
            )
            .optional()?;
        let Some(version) = version else { return Ok(None) };
        if version.resource_id != resource_id {
            return Ok(None);
        }

        let current = conn
            .query_row("SELECT * FROM resources WHERE id = ?1", params![resource_id], row_to_resource)
            .optional()?;
        let Some(current) = current else { return Ok(None) };

        let now = now_secs();
        let current_content = fs::read_to_string(&current.file_path).unwrap_or_default();
        conn.execute(
            "INSERT INTO resource_versions (resource_id, name, content, created_at) VALUES (?1,?2,?3,?4)",
            params![resource_id, current.name, current_content, now],
        )?;
        prune_resource_versions_locked(&conn, resource_id, DEFAULT_KEEP_VERSIONS)?;

        fs::write(&current.file_path, &version.content)?;
        conn.execute(
            "UPDATE resources SET name = ?1, updated_at = ?2 WHERE id = ?3",
            params![version.name, now, resource_id],
        )?;

        let restored = conn
            .query_row("SELECT * FROM resources WHERE id = ?1", params![resource_id], row_to_resource)?;
        Ok(Some(restored))
    }

    // ---------------------------------------------------------------- input files

    /// Records that `file_name` under `<loop>/inputs/` has been ingested.
    /// Returns `false` if it was already tracked.
    pub fn record_input_file(&self, loop_name: &str, file_name: &str) -> StoreResult<bool> {
        let conn = self.lock()?;
        let n = conn.execute(
            "INSERT OR IGNORE INTO input_files (loop_name, file_name, ingested_at) VALUES (?1,?2,?3)",
            params![loop_name, file_name, now_secs()],
        )?;
        Ok(n > 0)
    }

    pub fn list_input_files(&self, loop_name: &str) -> StoreResult<Vec<String>> {
        let conn = self.lock()?;
        let mut stmt =
            conn.prepare("SELECT file_name FROM input_files WHERE loop_name = ?1 ORDER BY file_name ASC")?;
        let rows = stmt.query_map(params![loop_name], |r| r.get::<_, String>(0))?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    // ---------------------------------------------------------------- logs

    pub fn append_log(&self, run_id: Option<&str>, level: &str, message: &str) -> StoreResult<()> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO logs (run_id, level, message, timestamp) VALUES (?1,?2,?3,?4)",
            params![run_id, level, message, now_secs()],
        )?;
        Ok(())
    }

    /// Daily retention sweep (§5): drops log rows older than `max_age`.
    pub fn prune_logs_older_than(&self, max_age: Duration) -> StoreResult<usize> {
        let conn = self.lock()?;
        let cutoff = now_secs() - max_age.as_secs() as i64;
        let n = conn.execute("DELETE FROM logs WHERE timestamp < ?1", params![cutoff])?;
        Ok(n)
    }
}

const DEFAULT_KEEP_VERSIONS: i64 = 20;

fn prune_resource_versions_locked(conn: &Connection, resource_id: i64, keep: i64) -> StoreResult<usize> {
    let n = conn.execute(
        "DELETE FROM resource_versions WHERE resource_id = ?1 AND id NOT IN (
            SELECT id FROM resource_versions WHERE resource_id = ?1
            ORDER BY created_at DESC, id DESC LIMIT ?2
        )",
        params![resource_id, keep],
    )?;
    Ok(n)
}

fn merge_json(into: &mut serde_json::Value, from: serde_json::Value) {
    if let (serde_json::Value::Object(into_map), serde_json::Value::Object(from_map)) = (into, from) {
        for (k, v) in from_map {
            into_map.insert(k, v);
        }
    }
}

fn row_to_work_item(row: &Row) -> rusqlite::Result<WorkItem> {
    let status: String = row.get("status")?;
    let tags: String = row.get("tags")?;
    let metadata: String = row.get("metadata")?;
    let dependencies: String = row.get("dependencies")?;
    Ok(WorkItem {
        id: row.get("id")?,
        priority: row.get("priority")?,
        content: row.get("content")?,
        title: row.get("title")?,
        status: WorkItemStatus::parse(&status).unwrap_or(WorkItemStatus::Pending),
        category: row.get("category")?,
        tags: serde_json::from_str(&tags).unwrap_or_default(),
        metadata: serde_json::from_str(&metadata).unwrap_or(serde_json::Value::Null),
        source_loop: row.get("source_loop")?,
        item_type: row.get("item_type")?,
        claimed_by: row.get("claimed_by")?,
        claimed_at: row.get("claimed_at")?,
        processed_at: row.get("processed_at")?,
        dependencies: serde_json::from_str(&dependencies).unwrap_or_default(),
        phase: row.get("phase")?,
        duplicate_of: row.get("duplicate_of")?,
        skip_reason: row.get("skip_reason")?,
        created_at: row.get("created_at")?,
        updated_at: row.get("updated_at")?,
    })
}

fn row_to_run(row: &Row) -> rusqlite::Result<Run> {
    let status: String = row.get("status")?;
    Ok(Run {
        id: row.get("id")?,
        loop_name: row.get("loop_name")?,
        status: RunStatus::parse(&status).unwrap_or(RunStatus::Error),
        started_at: row.get("started_at")?,
        completed_at: row.get("completed_at")?,
        iterations_completed: row.get("iterations_completed")?,
        items_generated: row.get("items_generated")?,
        error_message: row.get("error_message")?,
        executor_pid: row.get("executor_pid")?,
        last_activity_at: row.get("last_activity_at")?,
    })
}

fn row_to_session(row: &Row) -> rusqlite::Result<Session> {
    let items_added: String = row.get("items_added")?;
    Ok(Session {
        session_id: row.get("session_id")?,
        run_id: row.get("run_id")?,
        iteration: row.get("iteration")?,
        mode: row.get("mode")?,
        started_at: row.get("started_at")?,
        duration_seconds: row.get("duration_seconds")?,
        status: row.get("status")?,
        items_added: serde_json::from_str(&items_added).unwrap_or_default(),
    })
}

fn row_to_resource(row: &Row) -> rusqlite::Result<Resource> {
    let resource_type: String = row.get("resource_type")?;
    let injection_position: String = row.get("injection_position")?;
    Ok(Resource {
        id: row.get("id")?,
        name: row.get("name")?,
        resource_type: ResourceType::parse(&resource_type).unwrap_or(ResourceType::Custom),
        file_path: row.get("file_path")?,
        injection_position: InjectionPosition::parse(&injection_position).unwrap_or(InjectionPosition::AfterDesignDoc),
        enabled: row.get("enabled")?,
        inherit_default: row.get("inherit_default")?,
        priority: row.get("priority")?,
        created_at: row.get("created_at")?,
        updated_at: row.get("updated_at")?,
    })
}

fn row_to_resource_version(row: &Row) -> rusqlite::Result<ResourceVersion> {
    Ok(ResourceVersion {
        id: row.get("id")?,
        resource_id: row.get("resource_id")?,
        name: row.get("name")?,
        content: row.get("content")?,
        created_at: row.get("created_at")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> ProjectStore {
        ProjectStore::open_in_memory().unwrap()
    }

    #[test]
    fn claim_is_exclusive() {
        let s = store();
        s.create_work_item(NewWorkItem {
            id: "A".into(),
            content: "do the thing".into(),
            item_type: "story".into(),
            ..Default::default()
        })
        .unwrap();

        assert!(s.claim_work_item("A", "consumer-1").unwrap());
        assert!(!s.claim_work_item("A", "consumer-2").unwrap());
    }

    #[test]
    fn release_restores_completed_for_produced_items() {
        let s = store();
        s.create_work_item(NewWorkItem {
            id: "B".into(),
            content: "x".into(),
            item_type: "story".into(),
            source_loop: Some("planner".into()),
            status: Some(WorkItemStatus::Completed),
            ..Default::default()
        })
        .unwrap();

        assert!(s.claim_work_item("B", "c1").unwrap());
        assert!(s.release_work_item_claim("B", "c1").unwrap());

        let item = s.get_work_item("B").unwrap().unwrap();
        assert_eq!(item.status, WorkItemStatus::Completed);
        assert!(item.claimed_by.is_none());
    }

    #[test]
    fn release_restores_pending_for_direct_input_items() {
        let s = store();
        s.create_work_item(NewWorkItem {
            id: "C".into(),
            content: "x".into(),
            item_type: "story".into(),
            ..Default::default()
        })
        .unwrap();

        assert!(s.claim_work_item("C", "c1").unwrap());
        assert!(s.release_work_item_claim("C", "c1").unwrap());

        let item = s.get_work_item("C").unwrap().unwrap();
        assert_eq!(item.status, WorkItemStatus::Pending);
    }

    #[test]
    fn release_claim_checks_ownership() {
        let s = store();
        s.create_work_item(NewWorkItem {
            id: "D".into(),
            content: "x".into(),
            item_type: "story".into(),
            ..Default::default()
        })
        .unwrap();
        s.claim_work_item("D", "owner").unwrap();
        assert!(!s.release_work_item_claim("D", "not-owner").unwrap());
    }

    #[test]
    fn stale_claims_release_after_max_age() {
        let s = store();
        s.create_work_item(NewWorkItem {
            id: "E".into(),
            content: "x".into(),
            item_type: "story".into(),
            ..Default::default()
        })
        .unwrap();
        s.claim_work_item("E", "c1").unwrap();
        // Force the claimed_at far into the past.
        {
            let conn = s.lock().unwrap();
            conn.execute("UPDATE work_items SET claimed_at = 0 WHERE id = 'E'", [])
                .unwrap();
        }
        let released = s.release_stale_claims(Duration::from_secs(60 * 30)).unwrap();
        assert_eq!(released, 1);
        assert!(s.get_work_item("E").unwrap().unwrap().claimed_by.is_none());
    }

    #[test]
    fn resource_update_with_stale_lock_conflicts() {
        let s = store();
        let tmp = tempfile::NamedTempFile::new().unwrap();
        std::fs::write(tmp.path(), "v1").unwrap();
        let resource = s
            .create_resource(NewResource {
                name: "design".into(),
                resource_type: ResourceType::DesignDoc,
                file_path: tmp.path().to_string_lossy().to_string(),
                injection_position: InjectionPosition::AfterDesignDoc,
                enabled: true,
                inherit_default: true,
                priority: 100,
            })
            .unwrap();

        let outcome = s
            .update_workflow_resource(
                resource.id,
                ResourceEdit {
                    content: Some("v2".into()),
                    expected_updated_at: Some(resource.updated_at - 1),
                    ..Default::default()
                },
            )
            .unwrap();
        assert!(matches!(outcome, ResourceUpdateOutcome::Conflict { .. }));
        assert_eq!(s.list_resource_versions(resource.id).unwrap().len(), 0);
    }

    #[test]
    fn resource_content_edit_snapshots_prior_content() {
        let s = store();
        let tmp = tempfile::NamedTempFile::new().unwrap();
        std::fs::write(tmp.path(), "v1").unwrap();
        let resource = s
            .create_resource(NewResource {
                name: "design".into(),
                resource_type: ResourceType::DesignDoc,
                file_path: tmp.path().to_string_lossy().to_string(),
                injection_position: InjectionPosition::AfterDesignDoc,
                enabled: true,
                inherit_default: true,
                priority: 100,
            })
            .unwrap();

        let outcome = s
            .update_workflow_resource(
                resource.id,
                ResourceEdit {
                    content: Some("v2".into()),
                    expected_updated_at: Some(resource.updated_at),
                    ..Default::default()
                },
            )
            .unwrap();
        assert!(matches!(outcome, ResourceUpdateOutcome::Updated(_)));

        let versions = s.list_resource_versions(resource.id).unwrap();
        assert_eq!(versions.len(), 1);
        assert_eq!(versions[0].content, "v1");
    }

    #[test]
    fn enabled_only_edit_creates_no_version() {
        let s = store();
        let tmp = tempfile::NamedTempFile::new().unwrap();
        std::fs::write(tmp.path(), "v1").unwrap();
        let resource = s
            .create_resource(NewResource {
                name: "design".into(),
                resource_type: ResourceType::DesignDoc,
                file_path: tmp.path().to_string_lossy().to_string(),
                injection_position: InjectionPosition::AfterDesignDoc,
                enabled: true,
                inherit_default: true,
                priority: 100,
            })
            .unwrap();

        s.update_workflow_resource(
            resource.id,
            ResourceEdit {
                enabled: Some(false),
                expected_updated_at: Some(resource.updated_at),
                ..Default::default()
            },
        )
        .unwrap();

        assert_eq!(s.list_resource_versions(resource.id).unwrap().len(), 0);
    }
}
