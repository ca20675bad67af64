//! # daemon_latch
//!
//! A Unix daemonization engine: converts a foreground process into a
//! detached, single-instance background daemon. One [`Daemonizer::start`]
//! call locks the pidfile, runs the classic double fork with session
//! detachment, writes the final pid, sweeps inherited file descriptors,
//! and rewires the standard streams; what returns is a [`Daemon`] handle
//! owned by a process that is already the daemon.
//!
//! The pidfile doubles as the mutual-exclusion lock: its descriptor holds a
//! non-blocking `flock(2)` exclusive lock acquired before any fork, so two
//! instances can never race past each other. The same file powers the
//! out-of-process utilities [`send`] and [`ping`], and [`daemote`] drops
//! the running daemon's privileges while keeping the pidfile deletable.
//!
//! ```no_run
//! use daemon_latch::{Daemonizer, SignalDispatcher};
//!
//! let daemon = Daemonizer::new("/run/myapp.pid")
//!     .working_directory("/")
//!     .stdout("/var/log/myapp.log")
//!     .stderr("/var/log/myapp.log")
//!     .start();
//!
//! let mut signals = SignalDispatcher::new();
//! signals.install().expect("signal registration");
//! loop {
//!     if let Some(reason) = signals.poll() {
//!         eprintln!("shutting down: {:?}", reason);
//!         break;
//!     }
//!     // ... do daemon work ...
//! }
//! drop(daemon);
//! ```
//!
//! Unix only. The `sys` module is the seam a port to another platform
//! would fill; such a port must expose the same configuration contract,
//! including `success_timeout` and `strip_cmd_args`, which the Unix engine
//! carries but does not consume.

#[cfg(not(unix))]
compile_error!("daemon_latch requires a Unix platform; see the sys module for the port seam");

mod daemon;
mod error;
mod pidfile;
mod privilege;
mod signals;
mod stdio;
mod sys;
mod types;

// Re-export public types to keep the API flat.
pub use daemon::{Daemon, Daemonizer};
pub use error::{DaemonError, DaemonResult};
pub use pidfile::PidFile;
pub use privilege::daemote;
pub use signals::{ShutdownReason, SignalDispatcher, ping, send};
pub use stdio::StreamTarget;
pub use types::{Group, User};
