//! Per-job cgroup v2 directories: creation, resource limits, teardown.
//!
//! The helper creates `<cgroup-root>/<job-id>`, writes the limit files, and
//! moves itself in before exec-ing the user command; the reaper removes the
//! directory once the job is gone. Limit creation runs in the helper process
//! before exec, so everything here on that path is synchronous.

use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::{debug, warn};

/// One core of CPU bandwidth: quota and period in microseconds.
pub const CPU_MAX: &str = "100000 100000";
/// Hard memory cap: 100 MiB.
pub const MEMORY_MAX_BYTES: u64 = 100 * 1024 * 1024;
/// Block I/O throughput cap: 1 MiB/s each way.
pub const IO_BYTES_PER_SEC: u64 = 1024 * 1024;

const REMOVE_ATTEMPTS: u32 = 10;
const REMOVE_BACKOFF: Duration = Duration::from_millis(100);

/// Resolve the parent directory for per-job cgroups:
/// `--cgroup-root` flag, then `NSWORKER_CGROUP_ROOT`, then the default.
pub fn resolve_cgroup_root(flag: Option<&str>) -> PathBuf {
    if let Some(root) = flag {
        return PathBuf::from(root);
    }
    if let Ok(root) = std::env::var("NSWORKER_CGROUP_ROOT") {
        if !root.is_empty() {
            return PathBuf::from(root);
        }
    }
    PathBuf::from("/sys/fs/cgroup/nsworker")
}

/// Create the job cgroup and write its resource limits.
///
/// The cpu and memory caps are mandatory; the io cap needs a real block
/// device backing the root filesystem and is skipped when none can be found
/// (overlayfs and tmpfs roots have no single device to throttle).
pub fn create(dir: &Path) -> Result<()> {
    if let Some(parent) = dir.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("create cgroup parent {}", parent.display()))?;
        enable_controllers(parent);
    }
    std::fs::create_dir_all(dir)
        .with_context(|| format!("create cgroup {}", dir.display()))?;

    write_limit(dir, "cpu.max", CPU_MAX)?;
    write_limit(dir, "memory.max", &MEMORY_MAX_BYTES.to_string())?;

    if let Some((major, minor)) = root_block_device() {
        let line = io_max_line(major, minor, IO_BYTES_PER_SEC);
        // The discovered device can be a partition, which io.max rejects.
        let _ = write_limit(dir, "io.max", &line);
    }
    Ok(())
}

/// Move the calling process into the cgroup; the exec'd command inherits
/// membership.
pub fn add_self(dir: &Path) -> Result<()> {
    let procs = dir.join("cgroup.procs");
    std::fs::write(&procs, std::process::id().to_string())
        .with_context(|| format!("join cgroup via {}", procs.display()))
}

/// Enable the cpu, memory, and io controllers on every level from the
/// cgroup filesystem root down to `parent`. Best-effort: levels that
/// already delegate the controllers (or refuse because they hold
/// processes) are skipped.
fn enable_controllers(parent: &Path) {
    let mut levels = vec![parent.to_path_buf()];
    let mut cursor = parent;
    while let Some(up) = cursor.parent() {
        if !up.starts_with("/sys/fs/cgroup") {
            break;
        }
        levels.push(up.to_path_buf());
        cursor = up;
    }
    for level in levels.iter().rev() {
        let control = level.join("cgroup.subtree_control");
        let _ = std::fs::write(&control, "+cpu +memory +io");
    }
}

fn write_limit(dir: &Path, name: &str, value: &str) -> Result<()> {
    let path = dir.join(name);
    std::fs::write(&path, value).with_context(|| format!("write {}", path.display()))
}

/// `io.max` line throttling reads and writes on one device.
pub fn io_max_line(major: u64, minor: u64, bytes_per_sec: u64) -> String {
    format!("{major}:{minor} rbps={bytes_per_sec} wbps={bytes_per_sec}")
}

/// Device numbers of the block device backing `/`, falling back to the
/// first physical entry under `/sys/block` when the root filesystem is not
/// directly device-backed.
fn root_block_device() -> Option<(u64, u64)> {
    if let Ok(st) = nix::sys::stat::stat("/") {
        let (major, minor) = (
            nix::sys::stat::major(st.st_dev),
            nix::sys::stat::minor(st.st_dev),
        );
        if major != 0 {
            return Some((major, minor));
        }
    }

    let entries = std::fs::read_dir("/sys/block").ok()?;
    for entry in entries.flatten() {
        let name = entry.file_name();
        let name = name.to_string_lossy().into_owned();
        if name.starts_with("loop") || name.starts_with("ram") || name.starts_with("zram") {
            continue;
        }
        if let Ok(dev) = std::fs::read_to_string(entry.path().join("dev")) {
            if let Some((major, minor)) = parse_dev_numbers(&dev) {
                return Some((major, minor));
            }
        }
    }
    None
}

/// Parse a `/sys/block/<dev>/dev` file: `MAJOR:MINOR\n`.
fn parse_dev_numbers(raw: &str) -> Option<(u64, u64)> {
    let mut parts = raw.trim().split(':');
    let major = parts.next()?.parse().ok()?;
    let minor = parts.next()?.parse().ok()?;
    Some((major, minor))
}

/// Remove a job cgroup, retrying briefly while the kernel still counts
/// exiting members. Best-effort; a leftover directory is logged, not fatal.
pub async fn remove(dir: &Path) {
    for attempt in 0..REMOVE_ATTEMPTS {
        match std::fs::remove_dir(dir) {
            Ok(()) => {
                debug!(cgroup = %dir.display(), "cgroup removed");
                return;
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => return,
            Err(e) if e.raw_os_error() == Some(libc::EBUSY) => {
                debug!(cgroup = %dir.display(), attempt, "cgroup busy, retrying");
                tokio::time::sleep(REMOVE_BACKOFF).await;
            }
            Err(e) => {
                warn!(cgroup = %dir.display(), error = %e, "cgroup removal failed");
                return;
            }
        }
    }
    warn!(cgroup = %dir.display(), "cgroup still busy after retries");
}
