//! Implementation of the internal `_isolate` sub-command: the isolation
//! helper that runs between the server and the user command.
//!
//! The controller spawns `<helper> _isolate <flags> -- <command...>`. The
//! helper runs in two stages because a process cannot place *itself* into a
//! new PID namespace:
//!
//! - Stage one unshares the PID, mount, and network namespaces, then
//!   re-executes the same binary with `--pid1`; the re-executed child is
//!   PID 1 of the fresh PID namespace. Stage one lingers only to mirror the
//!   child's exit status back to the controller.
//! - Stage two joins the per-job cgroup, pivots into a private rootfs,
//!   brings up loopback, and execs the user command.
//!
//! Any failure before the final exec prints a single `isolation-error:` line
//! on stderr and exits with [`ISOLATION_FAILURE_CODE`] so the reaper can
//! classify the job as failed rather than exited.

use std::convert::Infallible;
use std::ffi::CString;
use std::os::unix::fs::PermissionsExt;
use std::os::unix::process::ExitStatusExt;
use std::path::{Path, PathBuf};
use std::process::Command;

use anyhow::{Context, Result, bail};
use nix::mount::{MntFlags, MsFlags, mount, umount2};
use nix::sched::{CloneFlags, unshare};
use nix::unistd::{chdir, execvpe, pivot_root};

/// Sentinel exit status distinguishing pre-exec setup failures from user
/// command exits.
pub const ISOLATION_FAILURE_CODE: i32 = 125;

/// Prefix of the one-line failure report the helper emits on stderr.
pub const ISOLATION_ERROR_PREFIX: &str = "isolation-error: ";

/// Host directories bind-mounted read-only into the job rootfs so standard
/// tooling resolves.
const HOST_BIND_DIRS: &[&str] = &[
    "/bin",
    "/sbin",
    "/usr/bin",
    "/usr/sbin",
    "/usr/local/bin",
    "/lib",
    "/lib64",
    "/usr/lib",
];

/// Device nodes bind-mounted from the host `/dev`.
const DEV_NODES: &[&str] = &["null", "zero", "full", "random", "urandom"];

/// Options for the `_isolate` internal sub-command.
#[derive(Debug)]
pub struct IsolateOpts<'a> {
    pub job_id: &'a str,
    pub cgroup_root: &'a Path,
    pub rootfs_dir: &'a Path,
    /// Set on the stage-two re-execution that runs as PID 1.
    pub pid1: bool,
    pub command: &'a [String],
}

/// Resolve the directory where per-job root filesystems are staged:
/// `--rootfs-dir` flag, then `NSWORKER_ROOTFS_DIR`, then the default.
pub fn resolve_rootfs_dir(flag: Option<&str>) -> PathBuf {
    if let Some(dir) = flag {
        return PathBuf::from(dir);
    }
    if let Ok(dir) = std::env::var("NSWORKER_ROOTFS_DIR") {
        if !dir.is_empty() {
            return PathBuf::from(dir);
        }
    }
    PathBuf::from("/run/nsworker/rootfs")
}

/// Run the helper. Returns only by exiting the process: with the user
/// command's status (mirrored by stage one), or with the sentinel code
/// after reporting a setup failure.
pub fn execute(opts: IsolateOpts) -> ! {
    let err = if opts.pid1 {
        match run_pid1(&opts) {
            Ok(never) => match never {},
            Err(e) => e,
        }
    } else {
        match run_leader(&opts) {
            Ok(code) => std::process::exit(code),
            Err(e) => e,
        }
    };
    // One line, machine-recoverable: the reaper lifts this into the job's
    // failure reason.
    eprintln!("{ISOLATION_ERROR_PREFIX}{err:#}");
    std::process::exit(ISOLATION_FAILURE_CODE);
}

/// Stage one: establish the namespaces, then re-execute as PID 1 and
/// mirror the child's exit status.
fn run_leader(opts: &IsolateOpts) -> Result<i32> {
    unshare(CloneFlags::CLONE_NEWPID | CloneFlags::CLONE_NEWNS | CloneFlags::CLONE_NEWNET)
        .context("unshare pid/mount/net namespaces")?;

    let exe = std::env::current_exe().context("resolve current exe")?;
    let status = Command::new(&exe)
        .arg("_isolate")
        .arg("--pid1")
        .arg("--job-id")
        .arg(opts.job_id)
        .arg("--cgroup-root")
        .arg(opts.cgroup_root)
        .arg("--rootfs-dir")
        .arg(opts.rootfs_dir)
        .arg("--")
        .args(opts.command)
        .status()
        .context("re-execute isolation helper as pid 1")?;

    match status.code() {
        Some(code) => Ok(code),
        // Killed by a signal; report the shell convention.
        None => Ok(128 + status.signal().unwrap_or(libc::SIGKILL)),
    }
}

/// Stage two: cgroup, rootfs, loopback, exec. Runs as PID 1 of the job's
/// namespaces.
fn run_pid1(opts: &IsolateOpts) -> Result<Infallible> {
    if nix::unistd::getpid().as_raw() != 1 {
        bail!("helper is not pid 1 of a fresh pid namespace");
    }
    if opts.command.is_empty() {
        bail!("no user command");
    }

    let cgroup_dir = opts.cgroup_root.join(opts.job_id);
    crate::cgroup::create(&cgroup_dir).context("create job cgroup")?;
    crate::cgroup::add_self(&cgroup_dir).context("enter job cgroup")?;

    setup_rootfs(&opts.rootfs_dir.join(opts.job_id)).context("build job rootfs")?;
    loopback_up().context("bring up loopback")?;

    exec_command(opts.command)
}

/// Assemble a tmpfs rootfs, pivot onto it, and discard the old root.
///
/// Mount order matters: propagation is cut first so nothing leaks to the
/// host, host binaries are bound while the old root is still reachable, and
/// `/proc` is mounted after the pivot so it reflects the new PID namespace.
fn setup_rootfs(root: &Path) -> Result<()> {
    mount(
        None::<&str>,
        "/",
        None::<&str>,
        MsFlags::MS_SLAVE | MsFlags::MS_REC,
        None::<&str>,
    )
    .context("make / propagation slave")?;

    std::fs::create_dir_all(root)
        .with_context(|| format!("create rootfs dir {}", root.display()))?;
    mount(
        Some("tmpfs"),
        root,
        Some("tmpfs"),
        MsFlags::empty(),
        Some("mode=0755"),
    )
    .context("mount rootfs tmpfs")?;

    for dir in ["proc", "sys", "dev", "tmp", "old_root"] {
        std::fs::create_dir_all(root.join(dir))
            .with_context(|| format!("create /{dir} in rootfs"))?;
    }
    std::fs::set_permissions(root.join("tmp"), std::fs::Permissions::from_mode(0o1777))
        .context("make /tmp world-writable")?;

    for host_dir in HOST_BIND_DIRS {
        let host = Path::new(host_dir);
        if !host.exists() {
            continue;
        }
        let target = root.join(host_dir.trim_start_matches('/'));
        std::fs::create_dir_all(&target)
            .with_context(|| format!("create {host_dir} in rootfs"))?;
        bind_read_only(host, &target)
            .with_context(|| format!("bind {host_dir} into rootfs"))?;
    }

    for node in DEV_NODES {
        let host = Path::new("/dev").join(node);
        if !host.exists() {
            continue;
        }
        let target = root.join("dev").join(node);
        std::fs::File::create(&target)
            .with_context(|| format!("create /dev/{node} mount point"))?;
        mount(
            Some(&host),
            &target,
            None::<&str>,
            MsFlags::MS_BIND,
            None::<&str>,
        )
        .with_context(|| format!("bind /dev/{node}"))?;
    }

    pivot_root(root, &root.join("old_root")).context("pivot_root")?;
    chdir("/").context("chdir to new root")?;

    // Fresh /proc for the new PID namespace.
    mount(
        Some("proc"),
        "/proc",
        Some("proc"),
        MsFlags::MS_NOSUID | MsFlags::MS_NODEV | MsFlags::MS_NOEXEC,
        None::<&str>,
    )
    .context("mount /proc")?;
    mount(
        Some("sysfs"),
        "/sys",
        Some("sysfs"),
        MsFlags::MS_RDONLY | MsFlags::MS_NOSUID | MsFlags::MS_NODEV | MsFlags::MS_NOEXEC,
        None::<&str>,
    )
    .context("mount /sys")?;

    umount2("/old_root", MntFlags::MNT_DETACH).context("detach old root")?;
    std::fs::remove_dir("/old_root").context("remove old root mount point")?;
    Ok(())
}

/// Bind-mount `src` at `dst`, then remount the bind read-only.
fn bind_read_only(src: &Path, dst: &Path) -> Result<()> {
    mount(
        Some(src),
        dst,
        None::<&str>,
        MsFlags::MS_BIND | MsFlags::MS_REC,
        None::<&str>,
    )?;
    mount(
        None::<&str>,
        dst,
        None::<&str>,
        MsFlags::MS_REMOUNT | MsFlags::MS_BIND | MsFlags::MS_RDONLY,
        None::<&str>,
    )?;
    Ok(())
}

/// Bring up the loopback interface inside the fresh network namespace. The
/// job gets no other interfaces, routes, or DNS.
fn loopback_up() -> Result<()> {
    // SAFETY: plain ioctl dance on an owned datagram socket; ifreq is a
    // POD struct fully initialized before use.
    unsafe {
        let fd = libc::socket(libc::AF_INET, libc::SOCK_DGRAM, 0);
        if fd < 0 {
            return Err(std::io::Error::last_os_error()).context("open control socket");
        }

        let mut req: libc::ifreq = std::mem::zeroed();
        for (slot, byte) in req.ifr_name.iter_mut().zip(b"lo\0") {
            *slot = *byte as libc::c_char;
        }

        if libc::ioctl(fd, libc::SIOCGIFFLAGS, &mut req) < 0 {
            let err = std::io::Error::last_os_error();
            libc::close(fd);
            return Err(err).context("read lo flags");
        }
        req.ifr_ifru.ifru_flags |= (libc::IFF_UP | libc::IFF_RUNNING) as libc::c_short;
        if libc::ioctl(fd, libc::SIOCSIFFLAGS, &req) < 0 {
            let err = std::io::Error::last_os_error();
            libc::close(fd);
            return Err(err).context("set lo up");
        }
        libc::close(fd);
    }
    Ok(())
}

/// Replace this process with the user command. Stdin was attached to the
/// null device by the controller's spawn; stdout and stderr are the
/// inherited pipes feeding the output logs.
fn exec_command(command: &[String]) -> Result<Infallible> {
    let program =
        CString::new(command[0].as_bytes()).context("user command contains a NUL byte")?;
    let argv = command
        .iter()
        .map(|arg| CString::new(arg.as_bytes()))
        .collect::<Result<Vec<_>, _>>()
        .context("user argument contains a NUL byte")?;
    // Minimal environment; PATH resolves against the bound host directories.
    let envp = [
        CString::new("PATH=/usr/local/bin:/usr/bin:/bin:/usr/sbin:/sbin").expect("static env"),
        CString::new("HOME=/").expect("static env"),
    ];
    execvpe(&program, &argv, &envp).context("exec user command")?;
    unreachable!("execvpe returned without error");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rootfs_dir_resolution_chain() {
        // SAFETY: test-only; not running in parallel with other env-mutating tests.
        unsafe {
            std::env::set_var("NSWORKER_ROOTFS_DIR", "/tmp/env-rootfs");
        }
        assert_eq!(
            resolve_rootfs_dir(Some("/tmp/flag-rootfs")),
            PathBuf::from("/tmp/flag-rootfs")
        );
        assert_eq!(resolve_rootfs_dir(None), PathBuf::from("/tmp/env-rootfs"));
        unsafe {
            std::env::remove_var("NSWORKER_ROOTFS_DIR");
        }
        assert_eq!(
            resolve_rootfs_dir(None),
            PathBuf::from("/run/nsworker/rootfs")
        );
    }

    #[test]
    fn sentinel_code_is_outside_common_exit_codes() {
        // sh reports 126 (not executable) and 127 (not found); the sentinel
        // must not collide with them or with 128+signal codes.
        assert!(ISOLATION_FAILURE_CODE < 126);
        assert!(ISOLATION_FAILURE_CODE > 0);
    }
}
