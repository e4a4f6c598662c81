//! Doctor (§4.6): stale-run detection and cleanup.
//!
//! A run is stale when its executor process is gone or has stopped updating
//! its activity heartbeat, via the same signal-0 liveness probe
//! (`is_process_running`, `nix::sys::signal::kill`) a daemon process would
//! use to check itself, generalized here to a per-run `executor_pid` column.

use std::time::{SystemTime, UNIX_EPOCH};

use projectstore::{ProjectStore, Run, RunPatch, RunStatus, StoreError};
use thiserror::Error;
use tracing::{debug, info, warn};

/// §4.6 default: distinct from the work-item stale-claim reaper's 30-minute
/// default (DESIGN.md "Open Questions").
pub const DEFAULT_MAX_INACTIVITY_MINUTES: i64 = 15;

#[derive(Debug, Error)]
pub enum DoctorError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

pub type DoctorResult<T> = Result<T, DoctorError>;

/// Why a run was classified stale, carried through to the explanatory
/// `error_message` written on cleanup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StaleReason {
    PidNotRunning,
    ActivityTimeout,
    LegacyNoHeartbeat,
    PidReuseSuspected,
}

impl StaleReason {
    fn message(self, run: &Run) -> String {
        match self {
            StaleReason::PidNotRunning => {
                format!("executor pid {} is not running", run.executor_pid.unwrap_or(0))
            }
            StaleReason::ActivityTimeout => "no activity recorded within the inactivity threshold".to_string(),
            StaleReason::LegacyNoHeartbeat => "no pid or activity heartbeat recorded and started_at is stale".to_string(),
            StaleReason::PidReuseSuspected => {
                format!(
                    "executor pid {} appears live but activity is stale beyond 2x the threshold (possible pid reuse)",
                    run.executor_pid.unwrap_or(0)
                )
            }
        }
    }
}

fn now_secs() -> i64 {
    SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_secs() as i64).unwrap_or(0)
}

/// Signal-0 liveness probe: sends no actual signal, just checks the kernel
/// will deliver one (i.e. the process exists and we have permission).
#[cfg(unix)]
fn is_process_running(pid: u32) -> bool {
    use nix::sys::signal::kill;
    use nix::unistd::Pid;
    kill(Pid::from_raw(pid as i32), None).is_ok()
}

#[cfg(not(unix))]
fn is_process_running(_pid: u32) -> bool {
    true
}

/// Classifies one run against the four staleness rules (§4.6). Terminal runs
/// are never reclassified (checked by the caller before invoking this).
pub fn classify(run: &Run, max_inactivity_minutes: i64) -> Option<StaleReason> {
    if run.status.is_terminal() {
        return None;
    }

    let threshold_secs = max_inactivity_minutes.max(0) * 60;
    let now = now_secs();

    if let Some(pid) = run.executor_pid
        && !is_process_running(pid as u32)
    {
        return Some(StaleReason::PidNotRunning);
    }

    let activity_age = run.last_activity_at.map(|t| now - t);
    if let Some(age) = activity_age
        && age > threshold_secs
    {
        if run.executor_pid.is_some() && age > threshold_secs * 2 {
            return Some(StaleReason::PidReuseSuspected);
        }
        if run.executor_pid.is_none() {
            return Some(StaleReason::ActivityTimeout);
        }
    }

    if run.executor_pid.is_none() && run.last_activity_at.is_none() && now - run.started_at > threshold_secs {
        return Some(StaleReason::LegacyNoHeartbeat);
    }

    None
}

/// One run's classification outcome, as reported by a `doctor` pass.
#[derive(Debug, Clone)]
pub struct DoctorFinding {
    pub run_id: String,
    pub loop_name: String,
    pub reason: StaleReason,
}

pub struct Doctor<'a> {
    store: &'a ProjectStore,
    max_inactivity_minutes: i64,
}

impl<'a> Doctor<'a> {
    pub fn new(store: &'a ProjectStore) -> Self {
        Self { store, max_inactivity_minutes: DEFAULT_MAX_INACTIVITY_MINUTES }
    }

    pub fn with_threshold(store: &'a ProjectStore, max_inactivity_minutes: i64) -> Self {
        Self { store, max_inactivity_minutes }
    }

    /// Scans every non-terminal run and reports which are stale, without
    /// mutating anything (`doctor` CLI's dry-run / default reporting mode).
    pub fn scan(&self) -> DoctorResult<Vec<DoctorFinding>> {
        let mut findings = Vec::new();
        for run in self.store.list_runs(None)? {
            if let Some(reason) = classify(&run, self.max_inactivity_minutes) {
                debug!(run_id = %run.id, loop_name = %run.loop_name, ?reason, "doctor: run classified stale");
                findings.push(DoctorFinding { run_id: run.id.clone(), loop_name: run.loop_name.clone(), reason });
            }
        }
        Ok(findings)
    }

    /// Scans and cleans up: stale runs are set to `aborted` with an
    /// explanatory `error_message`. Returns the findings that were acted on.
    pub fn cleanup(&self) -> DoctorResult<Vec<DoctorFinding>> {
        let findings = self.scan()?;
        for finding in &findings {
            let run = self
                .store
                .get_run(&finding.run_id)?
                .expect("run just listed by scan() must still exist");
            warn!(run_id = %finding.run_id, loop_name = %finding.loop_name, ?finding.reason, "doctor: aborting stale run");
            self.store.update_run(
                &finding.run_id,
                RunPatch {
                    status: Some(RunStatus::Aborted),
                    completed_at: Some(Some(now_secs())),
                    error_message: Some(Some(finding.reason.message(&run))),
                },
            )?;
        }
        info!(count = findings.len(), "doctor: cleanup complete");
        Ok(findings)
    }

    /// Lightweight prerequisite check (§B.3): is the LLM CLI
    /// reachable on `PATH`, and is a session directory writable. Used by the
    /// `doctor` CLI subcommand's non-run-related health report.
    pub fn check_prerequisites(&self) -> Vec<PrerequisiteCheck> {
        let mut checks = Vec::new();

        let cli_found = which_claude().is_some();
        checks.push(PrerequisiteCheck {
            name: "claude CLI on PATH".to_string(),
            ok: cli_found,
            detail: if cli_found { "found".to_string() } else { "not found on PATH".to_string() },
        });

        let session_root = dirs::home_dir().map(|h| h.join(".claude").join("projects"));
        let writable = session_root.as_ref().map(|p| probe_writable(p)).unwrap_or(false);
        checks.push(PrerequisiteCheck {
            name: "claude session directory writable".to_string(),
            ok: writable,
            detail: session_root.map(|p| p.display().to_string()).unwrap_or_else(|| "no home directory".to_string()),
        });

        checks
    }
}

#[derive(Debug, Clone)]
pub struct PrerequisiteCheck {
    pub name: String,
    pub ok: bool,
    pub detail: String,
}

fn which_claude() -> Option<std::path::PathBuf> {
    let path_var = std::env::var_os("PATH")?;
    std::env::split_paths(&path_var).map(|dir| dir.join("claude")).find(|candidate| candidate.is_file())
}

fn probe_writable(dir: &std::path::Path) -> bool {
    std::fs::create_dir_all(dir).is_ok() && {
        let probe = dir.join(".ralphx-doctor-probe");
        let ok = std::fs::write(&probe, b"").is_ok();
        let _ = std::fs::remove_file(&probe);
        ok
    }
}
