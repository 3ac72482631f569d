//! Background execution of sync runs with per-owner exclusion

use std::collections::HashMap;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use chrono::Utc;

use super::cancel::CancelToken;
use super::job::SyncJob;
use crate::attachments::AttachmentStore;
use crate::error::{ArchiveError, Result};
use crate::models::{SyncRun, SyncRunId};
use crate::provider::MailProvider;
use crate::storage::ArchiveRepository;

/// How long an active run may go without a heartbeat before another
/// process treats it as interrupted
const DEFAULT_RUN_LEASE: Duration = Duration::from_secs(120);

const MIN_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(1);

/// The run currently in flight for an owner
struct ActiveRun {
    run_id: SyncRunId,
    cancel: CancelToken,
}

type ActiveRuns = Arc<Mutex<HashMap<String, ActiveRun>>>;

/// Releases an owner's slot when the run thread ends, even on panic
struct ActiveGuard {
    active: ActiveRuns,
    owner: String,
    run_id: SyncRunId,
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        if let Ok(mut active) = self.active.lock()
            && active.get(&self.owner).is_some_and(|a| a.run_id == self.run_id)
        {
            active.remove(&self.owner);
        }
    }
}

/// Launches sync runs on background threads and tracks them
///
/// At most one run per owner is in flight; a second `trigger` or `resume`
/// for that owner fails with `SyncInProgress`. The claim lives in the
/// repository, so supervisors in other processes sharing the archive are
/// excluded too. Every run is persisted as a `SyncRun` whose status the
/// caller can poll, and refreshes its heartbeat while it executes.
pub struct SyncSupervisor {
    provider: Arc<dyn MailProvider>,
    repo: Arc<dyn ArchiveRepository>,
    attachments: Arc<AttachmentStore>,
    job_deadline: Option<Duration>,
    run_lease: Duration,
    active: ActiveRuns,
    handles: Mutex<HashMap<SyncRunId, JoinHandle<()>>>,
}

impl SyncSupervisor {
    pub fn new(
        provider: Arc<dyn MailProvider>,
        repo: Arc<dyn ArchiveRepository>,
        attachments: Arc<AttachmentStore>,
        job_deadline: Option<Duration>,
    ) -> Self {
        Self {
            provider,
            repo,
            attachments,
            job_deadline,
            run_lease: DEFAULT_RUN_LEASE,
            active: Arc::new(Mutex::new(HashMap::new())),
            handles: Mutex::new(HashMap::new()),
        }
    }

    /// Override the heartbeat lease (default two minutes)
    pub fn with_run_lease(mut self, lease: Duration) -> Self {
        self.run_lease = lease;
        self
    }

    /// Mark runs whose process stopped heartbeating as Failed
    ///
    /// Runs still heartbeating within the lease are left alone, so this is
    /// safe to call while another process is syncing.
    pub fn recover_interrupted(&self) -> Result<usize> {
        let lease = chrono::Duration::from_std(self.run_lease)
            .map_err(|e| ArchiveError::InvalidInput {
                message: format!("run lease: {}", e),
            })?;
        self.repo.fail_interrupted_runs(Utc::now() - lease)
    }

    fn heartbeat_interval(&self) -> Duration {
        (self.run_lease / 4).max(MIN_HEARTBEAT_INTERVAL)
    }

    /// Start a run for `owner` under `query` and return its ID immediately
    pub fn trigger(&self, owner: &str, query: &str) -> Result<SyncRunId> {
        let (run, cancel) = {
            let mut active = self.active.lock()?;
            Self::ensure_idle(&active, owner)?;
            let run = self.repo.create_sync_run(SyncRun::pending(owner, query))?;
            let cancel = Self::claim(&mut active, &run);
            (run, cancel)
        };
        log::info!(
            "[SYNC] Triggered run {} for {} (query: {:?})",
            run.id,
            owner,
            query
        );
        self.launch(run, cancel)
    }

    /// Restart a Failed or Cancelled run from its saved page token
    pub fn resume(&self, run_id: SyncRunId) -> Result<SyncRunId> {
        let run = self.repo.get_sync_run(run_id)?;
        if !run.status.is_resumable() {
            return Err(ArchiveError::InvalidInput {
                message: format!("run {} is {} and cannot be resumed", run_id, run.status.as_str()),
            });
        }

        let (run, cancel) = {
            let mut active = self.active.lock()?;
            Self::ensure_idle(&active, &run.owner)?;
            let run = self.repo.reopen_sync_run(run_id)?;
            let cancel = Self::claim(&mut active, &run);
            (run, cancel)
        };
        log::info!(
            "[SYNC] Resuming run {} for {} from {}",
            run.id,
            run.owner,
            run.page_token.as_deref().unwrap_or("the first page")
        );
        self.launch(run, cancel)
    }

    fn ensure_idle(active: &HashMap<String, ActiveRun>, owner: &str) -> Result<()> {
        match active.get(owner) {
            Some(current) => Err(ArchiveError::SyncInProgress {
                owner: owner.to_string(),
                run_id: current.run_id,
            }),
            None => Ok(()),
        }
    }

    /// Record `run` as the owner's active run
    fn claim(active: &mut HashMap<String, ActiveRun>, run: &SyncRun) -> CancelToken {
        let cancel = CancelToken::new();
        active.insert(
            run.owner.clone(),
            ActiveRun {
                run_id: run.id,
                cancel: cancel.clone(),
            },
        );
        cancel
    }

    /// Spawn the thread of a claimed run
    ///
    /// Must be called without holding the `active` lock: the guard moved into
    /// the thread releases the owner's slot when dropped.
    fn launch(&self, run: SyncRun, cancel: CancelToken) -> Result<SyncRunId> {
        let run_id = run.id;
        let guard = ActiveGuard {
            active: self.active.clone(),
            owner: run.owner.clone(),
            run_id,
        };
        let provider = self.provider.clone();
        let repo = self.repo.clone();
        let attachments = self.attachments.clone();
        let deadline = self.job_deadline;
        let heartbeat = self.heartbeat_interval();

        let spawned = thread::Builder::new()
            .name(format!("sync-run-{}", run_id))
            .spawn(move || {
                let _guard = guard;
                let job = SyncJob {
                    provider: provider.as_ref(),
                    repo: repo.as_ref(),
                    attachments: &attachments,
                    cancel: &cancel,
                    deadline,
                };
                execute(run, &job, heartbeat);
            });

        match spawned {
            Ok(handle) => {
                let mut handles = self.handles.lock()?;
                // Runs nobody waited for
                handles.retain(|_, handle| !handle.is_finished());
                handles.insert(run_id, handle);
                Ok(run_id)
            }
            Err(e) => {
                let message = format!("failed to spawn sync thread: {}", e);
                if let Ok(mut run) = self.repo.get_sync_run(run_id) {
                    run.mark_failed(message.clone());
                    let _ = self.repo.save_sync_run(&run);
                }
                Err(ArchiveError::storage(message))
            }
        }
    }

    /// Current state of a run
    pub fn status(&self, run_id: SyncRunId) -> Result<SyncRun> {
        self.repo.get_sync_run(run_id)
    }

    /// Runs of an owner, newest first
    pub fn runs(&self, owner: &str) -> Result<Vec<SyncRun>> {
        self.repo.list_sync_runs(owner)
    }

    /// ID of the run in flight for `owner`, if any
    pub fn active_run(&self, owner: &str) -> Result<Option<SyncRunId>> {
        Ok(self.active.lock()?.get(owner).map(|a| a.run_id))
    }

    /// Ask a run to stop before its next thread
    ///
    /// Returns `false` if the run exists but is not in flight.
    pub fn cancel(&self, run_id: SyncRunId) -> Result<bool> {
        let run = self.repo.get_sync_run(run_id)?;
        let active = self.active.lock()?;
        match active.get(&run.owner) {
            Some(current) if current.run_id == run_id => {
                log::info!("[SYNC] Cancellation requested for run {}", run_id);
                current.cancel.cancel();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    /// Block until a run launched by this supervisor finishes
    pub fn wait(&self, run_id: SyncRunId) -> Result<SyncRun> {
        let handle = self.handles.lock()?.remove(&run_id);
        if let Some(handle) = handle
            && handle.join().is_err()
        {
            log::error!("[SYNC] Run {} thread panicked", run_id);
        }
        self.repo.get_sync_run(run_id)
    }
}

/// Body of a run thread: execute the job and persist the final status
fn execute(mut run: SyncRun, job: &SyncJob<'_>, heartbeat: Duration) {
    let repo = job.repo;
    let run_id = run.id;
    run.mark_running();
    if let Err(e) = repo.save_sync_run(&run) {
        log::error!("[SYNC] Run {}: could not record start: {}", run_id, e);
    }

    let outcome = thread::scope(|scope| {
        let (stop, stopped) = mpsc::channel::<()>();
        let beating = thread::Builder::new()
            .name(format!("sync-beat-{}", run_id))
            .spawn_scoped(scope, move || beat(repo, run_id, heartbeat, stopped));
        if let Err(e) = beating {
            log::warn!("[SYNC] Run {}: no heartbeat thread: {}", run_id, e);
        }

        let outcome = job.run(&mut run);
        drop(stop);
        outcome
    });

    match outcome {
        Ok(()) => {
            run.mark_succeeded();
            log::info!(
                "[SYNC] Run {} for {} succeeded: {} threads, {} messages, {} attachments",
                run.id,
                run.owner,
                run.stats.threads_synced,
                run.stats.messages_synced,
                run.stats.attachments_stored
            );
        }
        Err(ArchiveError::Cancelled) => {
            run.mark_cancelled();
            log::warn!(
                "[SYNC] Run {} for {} cancelled after {} pages",
                run.id,
                run.owner,
                run.stats.pages_completed
            );
        }
        Err(e) => {
            log::error!("[SYNC] Run {} for {} failed: {}", run.id, run.owner, e);
            run.mark_failed(e.to_string());
        }
    }

    if let Err(e) = repo.save_sync_run(&run) {
        log::error!("[SYNC] Run {}: could not record final status: {}", run.id, e);
    }
}

/// Refresh the run's heartbeat every `interval` until `stop` is dropped
fn beat(repo: &dyn ArchiveRepository, run_id: SyncRunId, interval: Duration, stop: Receiver<()>) {
    while let Err(RecvTimeoutError::Timeout) = stop.recv_timeout(interval) {
        if let Err(e) = repo.touch_sync_run(run_id) {
            log::warn!("[SYNC] Run {}: heartbeat failed: {}", run_id, e);
        }
    }
}
