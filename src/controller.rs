//! Job orchestration: start, stop, status, output, and reaping.
//!
//! The controller is the only writer of job lifecycle transitions. It
//! spawns the isolation helper with stdout/stderr piped into the output
//! logs, hands the child to a reaper task, and enforces ownership on every
//! operation. Requester identities come exclusively from the identity gate;
//! the controller never reads identity out of request payloads.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use nix::sys::signal::Signal;
use nix::unistd::Pid;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::cgroup;
use crate::errors::WorkerError;
use crate::isolate::{ISOLATION_ERROR_PREFIX, ISOLATION_FAILURE_CODE};
use crate::output::{LogReader, OutputLog};
use crate::store::{Job, JobSnapshot, JobStore};

/// One read per pipe fill.
const PUMP_BUF_SIZE: usize = 8192;

/// Fixed SIGTERM → SIGKILL escalation grace.
pub const DEFAULT_STOP_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct ControllerConfig {
    /// Binary spawned as the isolation helper.
    pub helper_path: PathBuf,
    /// Parent directory for per-job cgroups.
    pub cgroup_root: PathBuf,
    /// Parent directory for per-job rootfs staging.
    pub rootfs_dir: PathBuf,
    /// Delay between SIGTERM and SIGKILL on Stop.
    pub stop_grace: Duration,
}

impl ControllerConfig {
    /// Resolve from flags, environment, and compiled defaults.
    pub fn resolve(
        helper_flag: Option<&str>,
        cgroup_flag: Option<&str>,
        rootfs_flag: Option<&str>,
    ) -> Self {
        ControllerConfig {
            helper_path: resolve_helper_path(helper_flag),
            cgroup_root: cgroup::resolve_cgroup_root(cgroup_flag),
            rootfs_dir: crate::isolate::resolve_rootfs_dir(rootfs_flag),
            stop_grace: DEFAULT_STOP_GRACE,
        }
    }
}

/// Resolve the helper binary path following the priority chain:
///   1. `--helper-path` CLI flag
///   2. `NSWORKER_HELPER` environment variable
///   3. the currently running binary (the helper is a hidden sub-command)
pub fn resolve_helper_path(flag: Option<&str>) -> PathBuf {
    if let Some(path) = flag {
        return PathBuf::from(path);
    }
    if let Ok(path) = std::env::var("NSWORKER_HELPER") {
        if !path.is_empty() {
            return PathBuf::from(path);
        }
    }
    std::env::current_exe().unwrap_or_else(|_| PathBuf::from("nsworker"))
}

pub struct Controller {
    store: Arc<JobStore>,
    config: ControllerConfig,
}

impl Controller {
    pub fn new(config: ControllerConfig) -> Self {
        Controller {
            store: JobStore::new(),
            config,
        }
    }

    pub fn store(&self) -> &Arc<JobStore> {
        &self.store
    }

    /// Launch a command as an isolated job owned by `requester`.
    pub async fn start(
        &self,
        requester: &str,
        command: Vec<String>,
    ) -> Result<String, WorkerError> {
        if command.is_empty() || command[0].trim().is_empty() {
            return Err(WorkerError::InvalidArgument("empty command".into()));
        }

        let job = self
            .store
            .create(requester, command.clone(), &self.config.cgroup_root);

        let mut cmd = Command::new(&self.config.helper_path);
        cmd.arg("_isolate")
            .arg("--job-id")
            .arg(&job.id)
            .arg("--cgroup-root")
            .arg(&self.config.cgroup_root)
            .arg("--rootfs-dir")
            .arg(&self.config.rootfs_dir)
            .arg("--")
            .args(&command)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        // Own session and process group, so Stop can signal the helper and
        // everything it spawned in one kill.
        unsafe {
            cmd.pre_exec(|| {
                nix::unistd::setsid()
                    .map(|_| ())
                    .map_err(|e| std::io::Error::from_raw_os_error(e as i32))
            });
        }

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                let reason = format!("spawn isolation helper: {e}");
                self.store.mark_failed(&job.id, &reason);
                return Err(WorkerError::SpawnFailed(reason));
            }
        };
        let pid = child.id().ok_or_else(|| {
            WorkerError::Internal("spawned helper has no pid".into())
        })?;
        self.store.set_host_pid(&job.id, pid)?;
        self.store.mark_running(&job.id);
        info!(job_id = %job.id, owner = %requester, pid, "job started");

        let stdout_pipe = child.stdout.take();
        let stderr_pipe = child.stderr.take();
        let stdout_task = tokio::spawn(pump(stdout_pipe, Arc::clone(&job.stdout)));
        let stderr_task = tokio::spawn(pump(stderr_pipe, Arc::clone(&job.stderr)));

        let store = Arc::clone(&self.store);
        let job_for_reaper = Arc::clone(&job);
        tokio::spawn(async move {
            reap(store, job_for_reaper, child, stdout_task, stderr_task).await;
        });

        Ok(job.id.clone())
    }

    /// Signal a job to terminate. A no-op success once the job is done;
    /// returns as soon as SIGTERM is delivered, with SIGKILL escalation
    /// scheduled after the grace period.
    pub fn stop(&self, requester: &str, id: &str) -> Result<(), WorkerError> {
        let job = self.authorized(requester, id)?;
        let snap = job.snapshot();
        if snap.done {
            debug!(job_id = %id, "stop on finished job");
            return Ok(());
        }
        let Some(pid) = snap.pid else {
            return Err(WorkerError::Internal("job has no host pid yet".into()));
        };

        signal_job(pid, Signal::SIGTERM)?;
        info!(job_id = %id, pid, "sent SIGTERM");

        let store = Arc::clone(&self.store);
        let job_id = id.to_string();
        let grace = self.config.stop_grace;
        tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            let Some(job) = store.lookup(&job_id) else {
                return;
            };
            let snap = job.snapshot();
            if !snap.done {
                if let Some(pid) = snap.pid {
                    warn!(job_id = %job_id, pid, "grace expired, sending SIGKILL");
                    let _ = signal_job(pid, Signal::SIGKILL);
                }
            }
        });
        Ok(())
    }

    /// Lifecycle snapshot of a job.
    pub fn status(&self, requester: &str, id: &str) -> Result<JobSnapshot, WorkerError> {
        Ok(self.authorized(requester, id)?.snapshot())
    }

    /// Fresh offset-zero readers over both output streams.
    pub fn output(
        &self,
        requester: &str,
        id: &str,
    ) -> Result<(LogReader, LogReader), WorkerError> {
        let job = self.authorized(requester, id)?;
        Ok((job.stdout.reader(), job.stderr.reader()))
    }

    /// Look up a job and verify the requester owns it. Ownership mismatch
    /// is logged with its real cause but surfaced like a missing job.
    fn authorized(&self, requester: &str, id: &str) -> Result<Arc<Job>, WorkerError> {
        let job = self.store.lookup(id).ok_or(WorkerError::NotFound)?;
        if job.owner != requester {
            warn!(job_id = %id, owner = %job.owner, requester = %requester, "ownership mismatch");
            return Err(WorkerError::PermissionDenied);
        }
        Ok(job)
    }
}

/// Signal the helper's process group (the helper called setsid, so its pgid
/// is its pid). An already-gone group is success; the reaper finalizes.
fn signal_job(pid: u32, signal: Signal) -> Result<(), WorkerError> {
    match nix::sys::signal::kill(Pid::from_raw(-(pid as i32)), signal) {
        Ok(()) => Ok(()),
        Err(nix::errno::Errno::ESRCH) => Ok(()),
        Err(e) => Err(WorkerError::Internal(format!("signal job group: {e}"))),
    }
}

/// Copy a child pipe into an output log until EOF.
async fn pump<R>(pipe: Option<R>, log: Arc<OutputLog>)
where
    R: AsyncRead + Unpin,
{
    let Some(mut pipe) = pipe else {
        return;
    };
    let mut buf = [0u8; PUMP_BUF_SIZE];
    loop {
        match pipe.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => log.append(&buf[..n]),
            Err(e) => {
                debug!(error = %e, "output pipe read failed");
                break;
            }
        }
    }
}

/// Wait for helper exit, drain the pipes, record the terminal state, and
/// tear down the job cgroup.
///
/// The pumps are awaited before any terminal transition so every byte the
/// kernel buffered reaches the logs before they close.
async fn reap(
    store: Arc<JobStore>,
    job: Arc<Job>,
    mut child: Child,
    stdout_task: JoinHandle<()>,
    stderr_task: JoinHandle<()>,
) {
    let status = child.wait().await;
    let _ = stdout_task.await;
    let _ = stderr_task.await;

    match status {
        Err(e) => {
            store.mark_failed(&job.id, &format!("wait for helper: {e}"));
        }
        Ok(status) => match status.code() {
            Some(0) => store.mark_exited(&job.id, 0),
            Some(ISOLATION_FAILURE_CODE) => {
                store.mark_failed(&job.id, &isolation_reason(&job));
            }
            Some(code) => store.mark_exited(&job.id, code),
            None => {
                use std::os::unix::process::ExitStatusExt;
                let sig = status.signal().unwrap_or(libc::SIGKILL);
                store.mark_exited(&job.id, 128 + sig);
            }
        },
    }

    cgroup::remove(&job.cgroup_dir).await;
}

/// Recover the helper's failure report from the captured stderr: the last
/// `isolation-error:` line it printed before exiting with the sentinel.
fn isolation_reason(job: &Job) -> String {
    let stderr = job.stderr.contents();
    let text = String::from_utf8_lossy(&stderr);
    text.lines()
        .rev()
        .find_map(|line| line.strip_prefix(ISOLATION_ERROR_PREFIX))
        .map(str::to_string)
        .unwrap_or_else(|| "isolation setup failed".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn helper_path_resolution_prefers_the_flag() {
        // SAFETY: test-only; not running in parallel with other env-mutating tests.
        unsafe {
            std::env::set_var("NSWORKER_HELPER", "/opt/env-helper");
        }
        assert_eq!(
            resolve_helper_path(Some("/opt/flag-helper")),
            PathBuf::from("/opt/flag-helper")
        );
        assert_eq!(resolve_helper_path(None), PathBuf::from("/opt/env-helper"));
        unsafe {
            std::env::remove_var("NSWORKER_HELPER");
        }
        // Default: the running binary itself.
        let default = resolve_helper_path(None);
        assert!(default.is_absolute());
    }

    #[test]
    fn isolation_reason_recovers_the_last_error_line() {
        let store = JobStore::new();
        let job = store.create("alice", vec!["true".into()], std::path::Path::new("/tmp"));
        job.stderr
            .append(b"noise from the user command\nisolation-error: pivot_root: EPERM\n");
        assert_eq!(isolation_reason(&job), "pivot_root: EPERM");
    }

    #[test]
    fn isolation_reason_falls_back_when_no_report_was_captured() {
        let store = JobStore::new();
        let job = store.create("alice", vec!["true".into()], std::path::Path::new("/tmp"));
        assert_eq!(isolation_reason(&job), "isolation setup failed");
    }
}
