use std::fmt;
use std::io;

/// Error type for daemon_latch.
/// Carries enough detail to diagnose why a setup step failed.
#[derive(Debug)]
pub enum DaemonError {
    /// Standard IO errors (file creation, stream redirection, etc.)
    Io(io::Error),
    /// The pidfile is already exclusively locked, most likely by a live
    /// instance of the same daemon.
    PidfileLocked,
    /// The pidfile exists but does not contain a decimal process id.
    InvalidPid(String),
    /// Failed to resolve or apply a target user/group identity.
    Privilege(String),
    /// A system call (fork, setsid, dup2, kill, ...) failed.
    Syscall { call: &'static str, errno: i32 },
}

impl fmt::Display for DaemonError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DaemonError::Io(err) => write!(f, "IO error: {}", err),
            DaemonError::PidfileLocked => {
                write!(f, "pidfile is locked by another process (daemon already running?)")
            }
            DaemonError::InvalidPid(msg) => write!(f, "invalid pidfile contents: {}", msg),
            DaemonError::Privilege(msg) => write!(f, "privilege drop error: {}", msg),
            DaemonError::Syscall { call, errno } => {
                write!(f, "syscall '{}' failed with errno {}", call, errno)
            }
        }
    }
}

impl std::error::Error for DaemonError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            DaemonError::Io(err) => Some(err),
            _ => None,
        }
    }
}

impl From<io::Error> for DaemonError {
    fn from(err: io::Error) -> Self {
        DaemonError::Io(err)
    }
}

/// A specialized Result type for daemon_latch operations.
pub type DaemonResult<T> = Result<T, DaemonError>;
