use std::collections::BTreeSet;
use std::ffi::CString;
use std::fs::File;
use std::io::{self, Write};
use std::os::unix::ffi::OsStrExt;
use std::os::unix::io::RawFd;
use std::path::Path;
use std::process;

use tracing::{debug, info, warn};

use crate::daemon::{Daemon, Daemonizer};
use crate::error::{DaemonError, DaemonResult};
use crate::pidfile::PidFile;
use crate::stdio::{ACCESS_READ, ACCESS_WRITE, RedirectPlan};
use crate::types::{Group, User};

#[cfg(target_os = "linux")]
use sd_notify::NotifyState;

/// Unix entry point.
///
/// Under systemd (`NOTIFY_SOCKET` present) the process must stay in the
/// foreground: the pidfile is still locked and written and the streams
/// still redirected, but no forking happens and `READY=1` is reported.
/// Everywhere else the classic double-fork detachment runs.
pub(crate) fn run(config: Daemonizer) -> DaemonResult<Daemon> {
    #[cfg(target_os = "linux")]
    {
        if std::env::var_os("NOTIFY_SOCKET").is_some() {
            return run_foreground_notify(config);
        }
    }

    run_background(config)
}

/// The one-shot foreground-to-daemon transition.
///
/// Ordering is load-bearing: the pidfile lock is acquired and its
/// descriptor shielded before the first fork so the lock survives into the
/// final grandchild and is never closed by the descriptor reaper; the pid
/// itself is written only after both forks, when the final pid is known.
fn run_background(mut config: Daemonizer) -> DaemonResult<Daemon> {
    let workdir = config.resolved_working_directory()?;

    let mut pidfile = PidFile::acquire(config.pid_file_path())?;
    config.shielded_fds.insert(pidfile.raw_fd());

    // The exiting parents bypass cleanup via _exit: the lock must remain
    // held by the surviving lineage.
    fork_and_reap_parent()?;
    detach_session(&workdir, config.umask)?;
    fork_and_reap_parent()?;

    pidfile.write_pid()?;
    reap_descriptors(&config.shielded_fds, config.fd_fallback_limit);
    redirect_streams(&config.redirect_plan())?;

    info!(pid = process::id(), "daemonized");
    Ok(Daemon::new(pidfile, config.args))
}

#[cfg(target_os = "linux")]
fn run_foreground_notify(mut config: Daemonizer) -> DaemonResult<Daemon> {
    let workdir = config.resolved_working_directory()?;

    let mut pidfile = PidFile::acquire(config.pid_file_path())?;
    config.shielded_fds.insert(pidfile.raw_fd());

    chdir(&workdir)?;
    unsafe { libc::umask(config.umask as libc::mode_t) };

    pidfile.write_pid()?;
    // No descriptor reaping here: descriptors inherited from systemd
    // (socket activation, journal streams) are intentional.
    redirect_streams(&config.redirect_plan())?;

    // 'true' unsets NOTIFY_SOCKET so it does not leak to children.
    let _ = sd_notify::notify(true, &[NotifyState::Ready]);

    info!(pid = process::id(), "running in foreground under systemd");
    Ok(Daemon::new(pidfile, config.args))
}

// =========================================================================
// Fork sequencer
// =========================================================================

/// Forks, then hard-exits the parent branch with `_exit(0)` so no `Drop`
/// impl (in particular the pidfile's) runs in the exiting lineage. Only the
/// child returns.
fn fork_and_reap_parent() -> DaemonResult<()> {
    let pid = unsafe { libc::fork() };
    if pid < 0 {
        return Err(syscall_error("fork"));
    }
    if pid > 0 {
        unsafe { libc::_exit(0) }
    }
    debug!("fork successful");
    Ok(())
}

/// Decouples the child from the parent environment: moves to the configured
/// working directory (avoids "directory busy" failures on later unmounts),
/// becomes leader of a new session and process group (detaching from the
/// controlling terminal), and applies the configured umask.
fn detach_session(workdir: &Path, umask: u32) -> DaemonResult<()> {
    chdir(workdir)?;

    if unsafe { libc::setsid() } < 0 {
        return Err(syscall_error("setsid"));
    }

    unsafe { libc::umask(umask as libc::mode_t) };
    Ok(())
}

fn chdir(path: &Path) -> DaemonResult<()> {
    let cpath = cstring(path)?;
    if unsafe { libc::chdir(cpath.as_ptr()) } < 0 {
        return Err(syscall_error("chdir"));
    }
    Ok(())
}

// =========================================================================
// FD reaper
// =========================================================================

/// Closes every inherited descriptor in `[3, fd_limit)` except the shielded
/// set, one batched range-close per gap.
fn reap_descriptors(shielded: &BTreeSet<RawFd>, fallback_limit: u64) {
    let stop = fd_limit(fallback_limit).min(libc::c_int::MAX as u64) as RawFd;
    for (start, stop) in close_ranges(3, stop, shielded) {
        close_fd_range(start, stop);
    }
}

/// Resolves the descriptor-table bound to sweep: the hard `RLIMIT_NOFILE`
/// if finite, else the soft limit if finite, else `fallback_limit`.
fn fd_limit(fallback_limit: u64) -> u64 {
    let mut limits = libc::rlimit {
        rlim_cur: 0,
        rlim_max: 0,
    };
    if unsafe { libc::getrlimit(libc::RLIMIT_NOFILE, &mut limits) } != 0 {
        warn!("getrlimit(RLIMIT_NOFILE) failed; assuming {} descriptors", fallback_limit);
        return fallback_limit;
    }

    if limits.rlim_max != libc::RLIM_INFINITY {
        limits.rlim_max
    } else if limits.rlim_cur != libc::RLIM_INFINITY {
        limits.rlim_cur
    } else {
        fallback_limit
    }
}

/// Computes the maximal contiguous half-open gaps of `[start, stop)` that
/// avoid every shielded descriptor. Ex: start=3, stop=7, exclude={4} yields
/// `[(3, 4), (5, 7)]`.
fn close_ranges(start: RawFd, stop: RawFd, exclude: &BTreeSet<RawFd>) -> Vec<(RawFd, RawFd)> {
    let mut ranges = Vec::new();
    let mut seeker = start;

    // BTreeSet iterates ascending.
    for &fd in exclude.iter().filter(|&&fd| fd >= start && fd < stop) {
        if seeker != fd {
            ranges.push((seeker, fd));
        }
        seeker = fd + 1;
    }
    if seeker < stop {
        ranges.push((seeker, stop));
    }

    ranges
}

/// Closes `[first, stop)` in one operation where the kernel supports it.
fn close_fd_range(first: RawFd, stop: RawFd) {
    #[cfg(target_os = "linux")]
    {
        // close_range(2) takes an inclusive upper bound; ENOSYS on pre-5.9
        // kernels falls through to the per-descriptor loop.
        let rc = unsafe {
            libc::syscall(
                libc::SYS_close_range,
                first as libc::c_long,
                (stop - 1) as libc::c_long,
                0 as libc::c_long,
            )
        };
        if rc == 0 {
            return;
        }
    }

    for fd in first..stop {
        unsafe { libc::close(fd) };
    }
}

// =========================================================================
// Stream redirector
// =========================================================================

/// Executes a [`RedirectPlan`]: creates missing target files, opens each
/// unique path once with its minimal sufficient access, flushes the
/// outgoing streams, and rebinds descriptors 0/1/2.
fn redirect_streams(plan: &RedirectPlan) -> DaemonResult<()> {
    for (path, _) in &plan.targets {
        if !path.exists() {
            File::create(path)?;
        }
    }

    let mut opened: Vec<RawFd> = Vec::with_capacity(plan.targets.len());
    for (path, access) in &plan.targets {
        let flags = match *access {
            ACCESS_READ => libc::O_RDONLY,
            ACCESS_WRITE => libc::O_WRONLY,
            _ => libc::O_RDWR,
        };
        let cpath = cstring(path)?;
        let fd = unsafe { libc::open(cpath.as_ptr(), flags) };
        if fd < 0 {
            return Err(syscall_error("open"));
        }
        opened.push(fd);
    }

    // Anything still buffered on the old stdout/stderr is lost after the
    // rebind; losing it is acceptable, failing here is not.
    flush_stds();

    // A headless launcher may have executed us with slots 0..=2 closed, in
    // which case open(2) hands those descriptors back directly. One that
    // landed in its own slot stays bound in place; one that landed in a
    // foreign slot is lifted above the slot range first so the dup2 pass
    // cannot clobber it.
    for idx in 0..opened.len() {
        let fd = opened[idx];
        if fd <= 2 && plan.slots[fd as usize] != idx {
            let lifted = unsafe { libc::fcntl(fd, libc::F_DUPFD, 3) };
            if lifted < 0 {
                return Err(syscall_error("fcntl"));
            }
            opened[idx] = lifted;
        }
    }

    for (slot, &target) in plan.slots.iter().enumerate() {
        let src = opened[target];
        if src == slot as RawFd {
            continue;
        }
        if unsafe { libc::dup2(src, slot as RawFd) } < 0 {
            return Err(syscall_error("dup2"));
        }
    }

    // Close the now-redundant intermediates; descriptors occupying a slot
    // are the streams themselves.
    for &fd in &opened {
        if fd > 2 {
            unsafe { libc::close(fd) };
        }
    }

    Ok(())
}

/// Flushes stdout and stderr ahead of the rebind. Soft failure: logged,
/// never fatal.
fn flush_stds() {
    if let Err(err) = io::stdout().flush() {
        warn!("failed to flush stdout before redirection: {}", err);
    }
    if let Err(err) = io::stderr().flush() {
        warn!("failed to flush stderr before redirection: {}", err);
    }
}

// =========================================================================
// Identity resolution and privilege syscalls
// =========================================================================

/// Normalizes a [`User`] to a uid via the system account database.
pub(crate) fn resolve_uid(user: &User) -> DaemonResult<libc::uid_t> {
    match user {
        User::Id(id) => Ok(*id as libc::uid_t),
        User::Name(name) => {
            let cname = CString::new(name.as_str())
                .map_err(|_| DaemonError::Privilege(format!("invalid user name {:?}", name)))?;
            let pwd = unsafe { libc::getpwnam(cname.as_ptr()) };
            if pwd.is_null() {
                return Err(DaemonError::Privilege(format!("user '{}' not found", name)));
            }
            Ok(unsafe { (*pwd).pw_uid })
        }
    }
}

/// Normalizes a [`Group`] to a gid via the system group database.
pub(crate) fn resolve_gid(group: &Group) -> DaemonResult<libc::gid_t> {
    match group {
        Group::Id(id) => Ok(*id as libc::gid_t),
        Group::Name(name) => {
            let cname = CString::new(name.as_str())
                .map_err(|_| DaemonError::Privilege(format!("invalid group name {:?}", name)))?;
            let grp = unsafe { libc::getgrnam(cname.as_ptr()) };
            if grp.is_null() {
                return Err(DaemonError::Privilege(format!("group '{}' not found", name)));
            }
            Ok(unsafe { (*grp).gr_gid })
        }
    }
}

/// Changes ownership of `path`; `None` leaves that half unchanged
/// (`chown(2)` treats an id of -1 as "keep").
pub(crate) fn set_owner(
    path: &Path,
    uid: Option<libc::uid_t>,
    gid: Option<libc::gid_t>,
) -> DaemonResult<()> {
    let cpath = cstring(path)?;
    let uid = uid.unwrap_or(libc::uid_t::MAX);
    let gid = gid.unwrap_or(libc::gid_t::MAX);
    if unsafe { libc::chown(cpath.as_ptr(), uid, gid) } < 0 {
        return Err(DaemonError::Privilege(format!(
            "chown of {} failed: {}",
            path.display(),
            io::Error::last_os_error()
        )));
    }
    Ok(())
}

pub(crate) fn set_gid(gid: libc::gid_t) -> DaemonResult<()> {
    if unsafe { libc::setgid(gid) } < 0 {
        return Err(syscall_error("setgid"));
    }
    Ok(())
}

pub(crate) fn set_uid(uid: libc::uid_t) -> DaemonResult<()> {
    if unsafe { libc::setuid(uid) } < 0 {
        return Err(syscall_error("setuid"));
    }
    Ok(())
}

// =========================================================================
// Signal delivery
// =========================================================================

/// Delivers `signum` to `pid` via `kill(2)`. Signal number 0 performs the
/// existence probe used by `ping`.
pub(crate) fn kill(pid: i32, signum: i32) -> DaemonResult<()> {
    if unsafe { libc::kill(pid as libc::pid_t, signum) } < 0 {
        return Err(syscall_error("kill"));
    }
    Ok(())
}

// =========================================================================
// Helpers
// =========================================================================

fn syscall_error(call: &'static str) -> DaemonError {
    DaemonError::Syscall {
        call,
        errno: io::Error::last_os_error().raw_os_error().unwrap_or(0),
    }
}

fn cstring(path: &Path) -> DaemonResult<CString> {
    CString::new(path.as_os_str().as_bytes()).map_err(|_| {
        DaemonError::Io(io::Error::new(
            io::ErrorKind::InvalidInput,
            "path contains a NUL byte",
        ))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn shield(fds: &[RawFd]) -> BTreeSet<RawFd> {
        fds.iter().copied().collect()
    }

    #[test]
    fn gap_around_one_shielded_descriptor() {
        assert_eq!(close_ranges(3, 7, &shield(&[4])), vec![(3, 4), (5, 7)]);
    }

    #[test]
    fn no_shielded_descriptors_is_one_gap() {
        assert_eq!(close_ranges(3, 7, &shield(&[])), vec![(3, 7)]);
    }

    #[test]
    fn fully_shielded_range_has_no_gaps() {
        assert_eq!(close_ranges(3, 7, &shield(&[3, 4, 5, 6])), Vec::new());
    }

    #[test]
    fn shielded_descriptors_outside_the_range_are_ignored() {
        assert_eq!(close_ranges(3, 7, &shield(&[1, 2, 9])), vec![(3, 7)]);
    }

    #[test]
    fn adjacent_shielded_descriptors_split_cleanly() {
        assert_eq!(
            close_ranges(3, 10, &shield(&[5, 6])),
            vec![(3, 5), (7, 10)]
        );
    }

    #[test]
    fn numeric_identities_resolve_to_themselves() {
        assert_eq!(resolve_uid(&User::Id(1234)).unwrap(), 1234);
        assert_eq!(resolve_gid(&Group::Id(1234)).unwrap(), 1234);
    }

    #[test]
    fn root_resolves_to_uid_zero() {
        assert_eq!(resolve_uid(&User::Name("root".into())).unwrap(), 0);
        assert_eq!(resolve_gid(&Group::Name("root".into())).unwrap(), 0);
    }

    #[test]
    fn unknown_account_is_a_privilege_error() {
        match resolve_uid(&User::Name("no-such-user-here".into())) {
            Err(DaemonError::Privilege(_)) => {}
            other => panic!("expected Privilege error, got {:?}", other),
        }
    }
}
