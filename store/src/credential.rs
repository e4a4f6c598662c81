//! Credential storage keyed by (scope, scope_id, service).
//!
//! Purely synchronous CRUD — the refresh orchestration (detecting
//! near-expiry tokens, calling out to refresh endpoints, the 30-minute
//! background sweep) is a `tokio` concern and lives in `ralphx::credential`,
//! built on top of this store.

use std::sync::Mutex;

use rusqlite::{Connection, OptionalExtension, params};
use serde::{Deserialize, Serialize};

use crate::error::{StoreError, StoreResult};
use crate::util::now_secs;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Credential {
    pub scope: String,
    pub scope_id: String,
    pub service: String,
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub expires_at: Option<i64>,
    pub updated_at: i64,
}

pub struct CredentialStore {
    conn: Mutex<Connection>,
}

impl CredentialStore {
    /// Opens a dedicated connection to the same database file a
    /// [`crate::ProjectStore`] manages, or a standalone one for credentials
    /// kept outside any single project (e.g. a user-level OAuth token).
    pub fn open(path: impl AsRef<std::path::Path>) -> StoreResult<Self> {
        let conn = Connection::open(path)?;
        conn.execute_batch(crate::schema::SCHEMA_SQL)?;
        Ok(Self { conn: Mutex::new(conn) })
    }

    #[cfg(any(test, feature = "test-util"))]
    pub fn open_in_memory() -> StoreResult<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(crate::schema::SCHEMA_SQL)?;
        Ok(Self { conn: Mutex::new(conn) })
    }

    fn lock(&self) -> StoreResult<std::sync::MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| StoreError::LockPoisoned)
    }

    pub fn upsert(&self, cred: &Credential) -> StoreResult<()> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO credentials (scope, scope_id, service, access_token, refresh_token, expires_at, updated_at)
             VALUES (?1,?2,?3,?4,?5,?6,?7)
             ON CONFLICT(scope, scope_id, service) DO UPDATE SET
                access_token = excluded.access_token,
                refresh_token = excluded.refresh_token,
                expires_at = excluded.expires_at,
                updated_at = excluded.updated_at",
            params![
                cred.scope,
                cred.scope_id,
                cred.service,
                cred.access_token,
                cred.refresh_token,
                cred.expires_at,
                cred.updated_at,
            ],
        )?;
        Ok(())
    }

    pub fn get(&self, scope: &str, scope_id: &str, service: &str) -> StoreResult<Option<Credential>> {
        let conn = self.lock()?;
        conn.query_row(
            "SELECT scope, scope_id, service, access_token, refresh_token, expires_at, updated_at
             FROM credentials WHERE scope = ?1 AND scope_id = ?2 AND service = ?3",
            params![scope, scope_id, service],
            row_to_credential,
        )
        .optional()
        .map_err(StoreError::from)
    }

    pub fn delete(&self, scope: &str, scope_id: &str, service: &str) -> StoreResult<bool> {
        let conn = self.lock()?;
        let n = conn.execute(
            "DELETE FROM credentials WHERE scope = ?1 AND scope_id = ?2 AND service = ?3",
            params![scope, scope_id, service],
        )?;
        Ok(n > 0)
    }

    /// Credentials whose `expires_at` falls within `horizon_secs` of now, or
    /// has none set — the candidate set the refresh sweep iterates.
    pub fn expiring_within(&self, horizon_secs: i64) -> StoreResult<Vec<Credential>> {
        let conn = self.lock()?;
        let cutoff = now_secs() + horizon_secs;
        let mut stmt = conn.prepare(
            "SELECT scope, scope_id, service, access_token, refresh_token, expires_at, updated_at
             FROM credentials WHERE expires_at IS NOT NULL AND expires_at <= ?1",
        )?;
        let rows = stmt.query_map(params![cutoff], row_to_credential)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }
}

fn row_to_credential(row: &rusqlite::Row) -> rusqlite::Result<Credential> {
    Ok(Credential {
        scope: row.get(0)?,
        scope_id: row.get(1)?,
        service: row.get(2)?,
        access_token: row.get(3)?,
        refresh_token: row.get(4)?,
        expires_at: row.get(5)?,
        updated_at: row.get(6)?,
    })
}
