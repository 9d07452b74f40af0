//! In-memory job registry.
//!
//! The store is the sole owner of jobs; everything else holds the job
//! identifier and re-resolves, or an `Arc<Job>` scoped to one operation.
//! Structural mutations (insert/remove) serialize on the store lock; each
//! job's lifecycle fields serialize on a per-job lock, never held across
//! await points.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::SystemTime;

use tracing::{debug, info};
use ulid::Ulid;

use crate::errors::WorkerError;
use crate::output::OutputLog;

/// Lifecycle of a job.
///
/// Terminal payloads carry the data that only exists in that state: an exit
/// code requires `Exited`, a failure reason requires `Failed`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobState {
    Starting,
    Running,
    Exited { code: i32 },
    Failed { reason: String },
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Exited { .. } | JobState::Failed { .. })
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Starting => "starting",
            JobState::Running => "running",
            JobState::Exited { .. } => "exited",
            JobState::Failed { .. } => "failed",
        }
    }
}

struct Lifecycle {
    state: JobState,
    pid: Option<u32>,
}

/// Point-in-time view of a job's lifecycle.
#[derive(Debug, Clone)]
pub struct JobSnapshot {
    pub state: &'static str,
    pub done: bool,
    pub exit_code: Option<i32>,
    pub pid: Option<u32>,
    pub failure: Option<String>,
}

pub struct Job {
    pub id: String,
    /// Authenticated identity that created the job; never mutated.
    pub owner: String,
    pub command: Vec<String>,
    pub created_at: SystemTime,
    pub stdout: Arc<OutputLog>,
    pub stderr: Arc<OutputLog>,
    /// Per-job cgroup directory, torn down by the reaper.
    pub cgroup_dir: PathBuf,
    lifecycle: Mutex<Lifecycle>,
}

impl Job {
    fn lock(&self) -> MutexGuard<'_, Lifecycle> {
        self.lifecycle.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn snapshot(&self) -> JobSnapshot {
        let lc = self.lock();
        JobSnapshot {
            state: lc.state.as_str(),
            done: lc.state.is_terminal(),
            exit_code: match lc.state {
                JobState::Exited { code } => Some(code),
                _ => None,
            },
            pid: lc.pid,
            failure: match &lc.state {
                JobState::Failed { reason } => Some(reason.clone()),
                _ => None,
            },
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.lock().state.is_terminal()
    }

    fn set_host_pid(&self, pid: u32) -> Result<(), WorkerError> {
        let mut lc = self.lock();
        if lc.state != JobState::Starting {
            return Err(WorkerError::Internal(format!(
                "host pid set while job is {}",
                lc.state.as_str()
            )));
        }
        lc.pid = Some(pid);
        Ok(())
    }

    fn mark_running(&self) {
        let mut lc = self.lock();
        if lc.state == JobState::Starting {
            lc.state = JobState::Running;
        }
    }

    /// Terminal transition; a second call is a no-op. Closes both logs so
    /// drained readers observe end-of-stream.
    fn finish(&self, state: JobState) -> bool {
        debug_assert!(state.is_terminal());
        {
            let mut lc = self.lock();
            if lc.state.is_terminal() {
                return false;
            }
            lc.state = state;
        }
        self.stdout.close();
        self.stderr.close();
        true
    }
}

/// Concurrent map from job identifier to job. Identifiers are unique for
/// the lifetime of the store.
pub struct JobStore {
    jobs: Mutex<HashMap<String, Arc<Job>>>,
}

impl JobStore {
    pub fn new() -> Arc<Self> {
        Arc::new(JobStore {
            jobs: Mutex::new(HashMap::new()),
        })
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Arc<Job>>> {
        self.jobs.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Allocate a fresh job in state `Starting` and return its handle.
    pub fn create(&self, owner: &str, command: Vec<String>, cgroup_root: &Path) -> Arc<Job> {
        let mut jobs = self.lock();
        // ULIDs collide only in theory; keep the uniqueness invariant anyway.
        let id = loop {
            let candidate = Ulid::new().to_string();
            if !jobs.contains_key(&candidate) {
                break candidate;
            }
        };
        let job = Arc::new(Job {
            id: id.clone(),
            owner: owner.to_string(),
            command,
            created_at: SystemTime::now(),
            stdout: OutputLog::new(),
            stderr: OutputLog::new(),
            cgroup_dir: cgroup_root.join(&id),
            lifecycle: Mutex::new(Lifecycle {
                state: JobState::Starting,
                pid: None,
            }),
        });
        jobs.insert(id, Arc::clone(&job));
        job
    }

    pub fn lookup(&self, id: &str) -> Option<Arc<Job>> {
        self.lock().get(id).cloned()
    }

    /// Record the helper's host PID; only legal while the job is `Starting`.
    pub fn set_host_pid(&self, id: &str, pid: u32) -> Result<(), WorkerError> {
        let job = self.lookup(id).ok_or(WorkerError::NotFound)?;
        job.set_host_pid(pid)
    }

    pub fn mark_running(&self, id: &str) {
        if let Some(job) = self.lookup(id) {
            job.mark_running();
        }
    }

    pub fn mark_exited(&self, id: &str, code: i32) {
        if let Some(job) = self.lookup(id) {
            if job.finish(JobState::Exited { code }) {
                info!(job_id = %id, code, "job exited");
            }
        }
    }

    pub fn mark_failed(&self, id: &str, reason: &str) {
        if let Some(job) = self.lookup(id) {
            if job.finish(JobState::Failed {
                reason: reason.to_string(),
            }) {
                info!(job_id = %id, reason, "job failed");
            }
        }
    }

    /// Drop a finished job. Refused while the job is live or any output
    /// reader is still attached.
    pub fn remove(&self, id: &str) -> Result<(), WorkerError> {
        let mut jobs = self.lock();
        let job = jobs.get(id).ok_or(WorkerError::NotFound)?;
        if !job.is_terminal() {
            return Err(WorkerError::Internal(format!(
                "job {id} is not finished"
            )));
        }
        if job.stdout.attached_readers() > 0 || job.stderr.attached_readers() > 0 {
            return Err(WorkerError::Internal(format!(
                "job {id} still has attached readers"
            )));
        }
        jobs.remove(id);
        debug!(job_id = %id, "job removed from store");
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
