//! Isolation and resource-cap tests driving the real helper.
//!
//! These exercise namespace setup, the tmpfs rootfs pivot, and cgroup
//! limits, so they need root and a cgroup v2 hierarchy. On other machines
//! every test skips with a message instead of failing.

use std::path::{Path, PathBuf};
use std::time::Duration;

use nsworker::controller::{Controller, ControllerConfig};
use nsworker::output::LogReader;
use nsworker::store::JobSnapshot;

const OWNER: &str = "tester";

struct Harness {
    controller: Controller,
    cgroup_root: PathBuf,
    _rootfs: tempfile::TempDir,
}

impl Harness {
    /// Build a controller around the real binary, or `None` when the
    /// environment cannot host namespaces and cgroups.
    fn new() -> Option<Self> {
        if !nix::unistd::geteuid().is_root() {
            eprintln!("skipping: requires root");
            return None;
        }
        if !Path::new("/sys/fs/cgroup/cgroup.controllers").exists() {
            eprintln!("skipping: requires a cgroup v2 hierarchy");
            return None;
        }
        let rootfs = tempfile::tempdir().expect("rootfs scratch dir");
        let cgroup_root = PathBuf::from("/sys/fs/cgroup/nsworker-test");
        let controller = Controller::new(ControllerConfig {
            helper_path: PathBuf::from(env!("CARGO_BIN_EXE_nsworker")),
            cgroup_root: cgroup_root.clone(),
            rootfs_dir: rootfs.path().to_path_buf(),
            stop_grace: Duration::from_secs(2),
        });
        Some(Harness {
            controller,
            cgroup_root,
            _rootfs: rootfs,
        })
    }

    async fn start(&self, argv: &[&str]) -> String {
        self.controller
            .start(OWNER, argv.iter().map(|s| s.to_string()).collect())
            .await
            .expect("start job")
    }

    async fn wait_done(&self, id: &str) -> JobSnapshot {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(30);
        loop {
            let snap = self.controller.status(OWNER, id).expect("status");
            if snap.done {
                return snap;
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "job {id} did not finish (state: {})",
                snap.state
            );
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }

    async fn stdout_of(&self, id: &str) -> String {
        let (stdout, _stderr) = self.controller.output(OWNER, id).expect("output");
        String::from_utf8_lossy(&drain(stdout).await).into_owned()
    }
}

async fn drain(mut reader: LogReader) -> Vec<u8> {
    let mut all = Vec::new();
    while let Some(chunk) = reader.next_chunk().await {
        all.extend_from_slice(&chunk);
    }
    all
}

fn command_available(name: &str) -> bool {
    ["/bin", "/usr/bin", "/sbin", "/usr/sbin"]
        .iter()
        .any(|dir| Path::new(dir).join(name).exists())
}

#[tokio::test]
async fn fresh_pid_namespace_hides_host_processes() {
    let Some(h) = Harness::new() else { return };

    let id = h.start(&["sh", "-c", "ls /proc | grep -c '^[0-9]'"]).await;
    let snap = h.wait_done(&id).await;
    assert_eq!(snap.exit_code, Some(0), "failure: {:?}", snap.failure);

    // Only the shell and its pipeline children are visible; a host /proc
    // would show far more.
    let count: u32 = h.stdout_of(&id).await.trim().parse().expect("a count");
    assert!(count <= 4, "saw {count} processes in the job's /proc");
}

#[tokio::test]
async fn network_namespace_has_only_loopback() {
    let Some(h) = Harness::new() else { return };
    if !command_available("ip") {
        eprintln!("skipping: ip(8) not installed");
        return;
    }

    let id = h.start(&["ip", "link"]).await;
    let snap = h.wait_done(&id).await;
    assert_eq!(snap.exit_code, Some(0), "failure: {:?}", snap.failure);

    let stdout = h.stdout_of(&id).await;
    assert!(stdout.contains("lo"), "no loopback in: {stdout}");
    let interfaces = stdout
        .lines()
        .filter(|line| line.chars().next().is_some_and(|c| c.is_ascii_digit()))
        .count();
    assert_eq!(interfaces, 1, "expected only loopback in: {stdout}");
}

#[tokio::test]
async fn rootfs_hides_host_files() {
    let Some(h) = Harness::new() else { return };
    assert!(Path::new("/etc/passwd").exists(), "host has no /etc/passwd");

    let id = h.start(&["sh", "-c", "test -e /etc/passwd"]).await;
    let snap = h.wait_done(&id).await;
    assert_eq!(snap.exit_code, Some(1), "host /etc leaked into the job");
}

#[tokio::test]
async fn job_cgroup_carries_the_limits() {
    let Some(h) = Harness::new() else { return };

    let id = h.start(&["sleep", "2"]).await;

    // The helper creates the cgroup before exec; wait for it to appear.
    let dir = h.cgroup_root.join(&id);
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !dir.join("memory.max").exists() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "job cgroup never appeared at {}",
            dir.display()
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    let memory_max = std::fs::read_to_string(dir.join("memory.max")).expect("memory.max");
    assert_eq!(memory_max.trim(), "104857600");
    let cpu_max = std::fs::read_to_string(dir.join("cpu.max")).expect("cpu.max");
    assert_eq!(cpu_max.trim(), "100000 100000");

    let snap = h.wait_done(&id).await;
    assert_eq!(snap.exit_code, Some(0));

    // The reaper removes the cgroup directory after exit.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while dir.exists() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "job cgroup was not cleaned up"
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

#[tokio::test]
async fn memory_cap_kills_oversized_jobs() {
    let Some(h) = Harness::new() else { return };

    // tail(1) must buffer the whole 200 MiB, twice the cgroup's cap.
    let id = h
        .start(&[
            "sh",
            "-c",
            "head -c 209715200 /dev/zero | tail -c 209715200 > /dev/null",
        ])
        .await;
    let snap = h.wait_done(&id).await;
    let code = snap.exit_code.expect("job exits rather than fails");
    assert_ne!(code, 0, "allocation over the cap must not succeed");
}

#[tokio::test]
async fn tmpfs_writes_count_against_the_memory_cap() {
    let Some(h) = Harness::new() else { return };
    if !command_available("dd") {
        eprintln!("skipping: dd(1) not installed");
        return;
    }

    // /tmp is job-private tmpfs; a 1 GiB write is stopped by memory.max.
    let id = h
        .start(&["dd", "if=/dev/zero", "of=/tmp/x", "bs=1M", "count=1024"])
        .await;
    let snap = h.wait_done(&id).await;
    let code = snap.exit_code.expect("job exits rather than fails");
    assert_ne!(code, 0, "the write must be stopped by the cap");
}

#[tokio::test]
async fn exit_codes_flow_through_the_real_helper() {
    let Some(h) = Harness::new() else { return };

    let id = h.start(&["sh", "-c", "exit 42"]).await;
    let snap = h.wait_done(&id).await;
    assert_eq!(snap.state, "exited");
    assert_eq!(snap.exit_code, Some(42));
}

#[tokio::test]
async fn output_is_captured_through_the_real_helper() {
    let Some(h) = Harness::new() else { return };

    let id = h.start(&["sh", "-c", "echo hello"]).await;
    let snap = h.wait_done(&id).await;
    assert_eq!(snap.exit_code, Some(0), "failure: {:?}", snap.failure);
    assert_eq!(h.stdout_of(&id).await, "hello\n");
}

#[tokio::test]
async fn stop_terminates_an_isolated_job() {
    let Some(h) = Harness::new() else { return };

    let id = h.start(&["sleep", "300"]).await;
    // Give the helper a moment to reach the user command.
    tokio::time::sleep(Duration::from_millis(300)).await;
    h.controller.stop(OWNER, &id).expect("stop");

    let snap = h.wait_done(&id).await;
    let code = snap.exit_code.expect("signal termination is an exit");
    assert_ne!(code, 0);
}
