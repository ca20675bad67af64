use std::collections::BTreeSet;
use std::env;
use std::os::unix::io::RawFd;
use std::path::{Path, PathBuf};
use std::process;
use std::time::Duration;

use tracing::error;

use crate::error::DaemonResult;
use crate::pidfile::PidFile;
use crate::stdio::{RedirectPlan, StreamTarget, plan_redirects};
use crate::sys;

/// Configures and launches the foreground-to-daemon transition.
///
/// The configuration is immutable for the duration of one
/// [`start`](Self::start) call. Everything has a sensible default except
/// the pidfile path, which is mandatory: it is both the pid record and the
/// single-instance mutual-exclusion lock.
///
/// # Defaults
/// - Working directory: the current directory, made absolute at start
/// - Streams: `/dev/null`
/// - Umask: `0o027`
/// - Descriptor-limit fallback: 1024
#[derive(Debug)]
pub struct Daemonizer {
    pub(crate) pid_file: PathBuf,
    pub(crate) directory: Option<PathBuf>,
    pub(crate) umask: u32,
    pub(crate) stdin: StreamTarget,
    pub(crate) stdout: StreamTarget,
    pub(crate) stderr: StreamTarget,
    pub(crate) shielded_fds: BTreeSet<RawFd>,
    pub(crate) fd_fallback_limit: u64,
    pub(crate) success_timeout: Duration,
    pub(crate) strip_cmd_args: bool,
    pub(crate) args: Vec<String>,
}

impl Daemonizer {
    /// Creates a configuration daemonizing around the pidfile at `pid_file`.
    pub fn new<P: Into<PathBuf>>(pid_file: P) -> Self {
        Daemonizer {
            pid_file: pid_file.into(),
            directory: None,
            umask: 0o027,
            stdin: StreamTarget::Devnull,
            stdout: StreamTarget::Devnull,
            stderr: StreamTarget::Devnull,
            shielded_fds: BTreeSet::new(),
            fd_fallback_limit: 1024,
            success_timeout: Duration::from_secs(30),
            strip_cmd_args: false,
            args: Vec::new(),
        }
    }

    // --- Public getters ---

    /// The configured pidfile path.
    pub fn pid_file_path(&self) -> &Path {
        &self.pid_file
    }

    /// The configured working directory, if one was set.
    pub fn working_directory_path(&self) -> Option<&Path> {
        self.directory.as_deref()
    }

    /// How long a launcher should wait for a daemonization-success signal.
    /// A contract for callers (and for non-Unix ports of this interface);
    /// the Unix engine itself never blocks on it.
    pub fn get_success_timeout(&self) -> Duration {
        self.success_timeout
    }

    /// Whether a relaunching backend should strip the daemonization-control
    /// arguments from the command line it presents to the daemon. Carried
    /// for ports of this interface; the Unix engine never relaunches.
    pub fn strips_cmd_args(&self) -> bool {
        self.strip_cmd_args
    }

    // --- Builder methods ---

    /// Sets the working directory the daemon detaches into. Made absolute
    /// at start time; staying in an unmount-prone directory is what causes
    /// later "directory busy" failures.
    pub fn working_directory<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.directory = Some(path.into());
        self
    }

    /// Sets the umask applied during session detachment. The default
    /// `0o027` keeps all owner permissions, removes group write, and
    /// removes everything for other.
    pub fn umask(mut self, mask: u32) -> Self {
        self.umask = mask;
        self
    }

    /// Redirects standard input.
    pub fn stdin<S: Into<StreamTarget>>(mut self, target: S) -> Self {
        self.stdin = target.into();
        self
    }

    /// Redirects standard output.
    pub fn stdout<S: Into<StreamTarget>>(mut self, target: S) -> Self {
        self.stdout = target.into();
        self
    }

    /// Redirects standard error.
    pub fn stderr<S: Into<StreamTarget>>(mut self, target: S) -> Self {
        self.stderr = target.into();
        self
    }

    /// Shields a descriptor from the post-fork descriptor reaping, keeping
    /// it open into the daemon. The pidfile's own descriptor is shielded
    /// automatically.
    pub fn shield_fd(mut self, fd: RawFd) -> Self {
        self.shielded_fds.insert(fd);
        self
    }

    /// Shields several descriptors at once.
    pub fn shield_fds<I: IntoIterator<Item = RawFd>>(mut self, fds: I) -> Self {
        self.shielded_fds.extend(fds);
        self
    }

    /// Sets the descriptor-table bound used when both `RLIMIT_NOFILE`
    /// limits report unlimited.
    pub fn fd_fallback_limit(mut self, limit: u64) -> Self {
        self.fd_fallback_limit = limit;
        self
    }

    /// Sets the success-wait contract for launchers of this configuration.
    pub fn success_timeout(mut self, timeout: Duration) -> Self {
        self.success_timeout = timeout;
        self
    }

    /// Sets the argument-presentation flag for relaunching backends.
    pub fn strip_cmd_args(mut self, strip: bool) -> Self {
        self.strip_cmd_args = strip;
        self
    }

    /// Supplies arguments to carry across the transition; they come back
    /// unchanged from [`Daemon::args`] once the process is a daemon.
    pub fn forward_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    /// Performs the daemonization and returns the owned teardown handle to
    /// what is now the daemon process.
    ///
    /// Daemonization is all-or-nothing: any setup failure (pidfile
    /// open/lock, fork, session detachment, stream rebind) is logged and
    /// terminates the process with a non-zero exit status rather than
    /// returning a recoverable error. The original launching process never
    /// returns from this call either; it exits inside the fork sequence.
    pub fn start(self) -> Daemon {
        match sys::run(self) {
            Ok(daemon) => daemon,
            Err(err) => {
                error!("daemonization failed: {}", err);
                process::exit(1);
            }
        }
    }

    pub(crate) fn resolved_working_directory(&self) -> DaemonResult<PathBuf> {
        match &self.directory {
            Some(dir) => Ok(std::path::absolute(dir)?),
            None => Ok(env::current_dir()?),
        }
    }

    pub(crate) fn redirect_plan(&self) -> RedirectPlan {
        plan_redirects(
            self.stdin.resolve(),
            self.stdout.resolve(),
            self.stderr.resolve(),
        )
    }
}

/// The running daemon's owned context: the locked pidfile plus the
/// forwarded arguments.
///
/// Keep this handle alive for the lifetime of the daemon. Dropping it (or
/// calling [`teardown`](Self::teardown)) releases the pidfile lock and
/// removes the file, which ends the single-instance guarantee; teardown is
/// best-effort and never fails loudly. Because the handle owns everything
/// it needs, cleanup runs on ordinary returns and on unwinding alike, with
/// no captured ambient state.
#[derive(Debug)]
pub struct Daemon {
    pidfile: PidFile,
    args: Vec<String>,
}

impl Daemon {
    pub(crate) fn new(pidfile: PidFile, args: Vec<String>) -> Self {
        Daemon { pidfile, args }
    }

    /// The arguments forwarded through the transition, unchanged.
    pub fn args(&self) -> &[String] {
        &self.args
    }

    /// The absolute path of the locked pidfile.
    pub fn pid_file_path(&self) -> &Path {
        self.pidfile.path()
    }

    /// Removes the pidfile and releases the lock. Equivalent to dropping
    /// the handle, spelled out for call sites that want the teardown point
    /// visible.
    pub fn teardown(self) {}
}
