//! Credential orchestration (§4.2 step 1, §5 "Credentials", §B.2).
//!
//! Wraps `projectstore::CredentialStore` with expiry-aware lookup/refresh and
//! implements `llm::CredentialProvider` so the adapter can pull a fresh
//! access token per subprocess invocation without depending on this crate's
//! async runtime needs directly.
//!
//! Two paths coexist, per DESIGN.md's Open-Question decision:
//! - **env injection** (default, happy path): `access_token` hands the token
//!   straight to the adapter, which sets `CLAUDE_CODE_OAUTH_TOKEN` on the
//!   subprocess. No file ever changes.
//! - **legacy file-swap** (kept for LLM CLI binaries that don't honor the
//!   env var): swaps the operator's credentials file for ours under an
//!   exclusive advisory lock (`fs2::FileExt::lock_exclusive` around a
//!   PID/state file, the same idiom a single-writer daemon lock file uses),
//!   and restores the original file on every exit path including panics.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use fs2::FileExt;
use projectstore::{Credential, CredentialStore, StoreError};
use thiserror::Error;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, info, warn};

use crate::llm::CredentialProvider;

/// Refresh tokens within this many hours of expiry (§5 "Background tasks").
pub const REFRESH_HORIZON_HOURS: i64 = 4;
/// Background sweep interval (§5 "Background tasks").
pub const REFRESH_SWEEP_INTERVAL: Duration = Duration::from_secs(30 * 60);

const DEFAULT_SCOPE: &str = "project";
const DEFAULT_SERVICE: &str = "claude_cli";

#[derive(Debug, Error)]
pub enum CredentialError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("no credential recorded for account {0:?}")]
    NotFound(String),
    #[error("failed to acquire legacy credential-file lock: {0}")]
    LockFailed(std::io::Error),
}

pub type CredentialResult<T> = Result<T, CredentialError>;

/// Refreshes an expiring access token given its refresh token. The concrete
/// OAuth refresh call is an external collaborator's concern (§1 "Out of
/// scope"); this trait lets the sweep and the provider stay agnostic to it.
#[async_trait]
pub trait TokenRefresher: Send + Sync {
    async fn refresh(&self, refresh_token: &str) -> Option<(String, Option<i64>)>;
}

/// A refresher that can never refresh anything — the safe default when no
/// OAuth collaborator is wired in; tokens past expiry simply surface
/// `AUTH_REQUIRED` through the adapter.
pub struct NoRefresh;

#[async_trait]
impl TokenRefresher for NoRefresh {
    async fn refresh(&self, _refresh_token: &str) -> Option<(String, Option<i64>)> {
        None
    }
}

/// Expiry-aware credential orchestrator, one per project.
pub struct CredentialManager {
    store: Arc<CredentialStore>,
    refresher: Arc<dyn TokenRefresher>,
    scope_id: String,
    legacy_swap: Option<AsyncMutex<LegacySwap>>,
}

impl CredentialManager {
    pub fn new(store: Arc<CredentialStore>, refresher: Arc<dyn TokenRefresher>, scope_id: impl Into<String>) -> Self {
        Self { store, refresher, scope_id: scope_id.into(), legacy_swap: None }
    }

    /// Enables the legacy file-swap path alongside env-injection, for LLM
    /// CLI binaries that only read credentials from a settings file.
    pub fn with_legacy_swap(mut self, credentials_file: PathBuf, lock_file: PathBuf) -> Self {
        self.legacy_swap = Some(AsyncMutex::new(LegacySwap { credentials_file, lock_file }));
        self
    }

    fn account(&self, account_id: Option<&str>) -> String {
        account_id.unwrap_or(&self.scope_id).to_string()
    }

    /// Looks up the current credential, refreshing it first if it's within
    /// [`REFRESH_HORIZON_HOURS`] of expiry (§4.2 step 1).
    pub async fn get_fresh(&self, account_id: Option<&str>) -> CredentialResult<Credential> {
        let account = self.account(account_id);
        let current = self
            .store
            .get(DEFAULT_SCOPE, &account, DEFAULT_SERVICE)?
            .ok_or_else(|| CredentialError::NotFound(account.clone()))?;

        let needs_refresh = current
            .expires_at
            .is_some_and(|exp| exp - projectstore::now_secs() <= REFRESH_HORIZON_HOURS * 3600);

        if !needs_refresh {
            return Ok(current);
        }

        let Some(refresh_token) = current.refresh_token.as_deref() else {
            warn!(account = %account, "credential: near expiry but no refresh token, using current token as-is");
            return Ok(current);
        };

        match self.refresher.refresh(refresh_token).await {
            Some((access_token, expires_at)) => {
                let updated = Credential {
                    scope: DEFAULT_SCOPE.to_string(),
                    scope_id: account.clone(),
                    service: DEFAULT_SERVICE.to_string(),
                    access_token,
                    refresh_token: current.refresh_token.clone(),
                    expires_at,
                    updated_at: projectstore::now_secs(),
                };
                self.store.upsert(&updated)?;
                info!(account = %account, "credential: refreshed near-expiry token");
                Ok(updated)
            }
            None => {
                warn!(account = %account, "credential: refresh attempt failed, falling back to current token");
                Ok(current)
            }
        }
    }

    pub fn upsert(&self, cred: Credential) -> CredentialResult<()> {
        Ok(self.store.upsert(&cred)?)
    }

    /// Runs the 30-minute background sweep (§5 "Background tasks"): refreshes
    /// every credential within [`REFRESH_HORIZON_HOURS`] of expiry. Intended
    /// to be spawned for the process's lifetime; tolerates missed ticks since
    /// each tick is a fresh query against current expiry, not an accumulator.
    pub async fn run_refresh_sweep(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(REFRESH_SWEEP_INTERVAL);
        loop {
            ticker.tick().await;
            match self.store.expiring_within(REFRESH_HORIZON_HOURS * 3600) {
                Ok(expiring) => {
                    debug!(count = expiring.len(), "credential: sweep found expiring credentials");
                    for cred in expiring {
                        if let Err(e) = self.get_fresh(Some(&cred.scope_id)).await {
                            warn!(account = %cred.scope_id, error = %e, "credential: sweep refresh failed");
                        }
                    }
                }
                Err(e) => warn!(error = %e, "credential: sweep query failed"),
            }
        }
    }

    /// Swaps in this manager's credentials file for the duration of `f`,
    /// restoring the operator's original file afterward regardless of how
    /// `f` returns (§5 "Credentials": legacy path "must restore the
    /// operator's original credentials on all exit paths").
    pub async fn with_legacy_credentials_swapped<F, Fut, T>(&self, f: F) -> CredentialResult<T>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = T>,
    {
        let Some(swap) = &self.legacy_swap else {
            return Ok(f().await);
        };
        let guard = swap.lock().await;
        let held = guard.swap_in()?;
        let result = f().await;
        held.restore()?;
        Ok(result)
    }
}

/// Exclusive-advisory-locked file swap (`fs2::FileExt::lock_exclusive`
/// around the credentials file), serializing concurrent swaps the same way
/// a single-writer PID/state-file lock would. The lock's file handle must
/// stay open for the lock to remain held, so it's threaded through to
/// [`HeldSwap::restore`] rather than reopened there.
struct LegacySwap {
    credentials_file: PathBuf,
    lock_file: PathBuf,
}

/// An in-progress swap: the lock is held for the lifetime of this value, and
/// must be released via [`Self::restore`] on every exit path.
struct HeldSwap<'a> {
    swap: &'a LegacySwap,
    _lock: std::fs::File,
    original: Option<Vec<u8>>,
}

impl HeldSwap<'_> {
    fn restore(self) -> CredentialResult<()> {
        match self.original {
            Some(bytes) => std::fs::write(&self.swap.credentials_file, bytes)?,
            None => {
                let _ = std::fs::remove_file(&self.swap.credentials_file);
            }
        }
        let _ = FileExt::unlock(&self._lock);
        Ok(())
    }
}

impl LegacySwap {
    fn swap_in(&self) -> CredentialResult<HeldSwap<'_>> {
        let lock = std::fs::OpenOptions::new().write(true).create(true).truncate(false).open(&self.lock_file)?;
        lock.lock_exclusive().map_err(CredentialError::LockFailed)?;
        let original = if self.credentials_file.exists() { Some(std::fs::read(&self.credentials_file)?) } else { None };
        Ok(HeldSwap { swap: self, _lock: lock, original })
    }
}

#[async_trait]
impl CredentialProvider for CredentialManager {
    async fn access_token(&self, account_id: Option<&str>) -> Option<String> {
        self.get_fresh(account_id).await.ok().map(|c| c.access_token)
    }
}

pub fn default_credentials_path(home: &Path) -> PathBuf {
    home.join(".claude").join("credentials.json")
}
