use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use signal_hook::consts::signal::{SIGABRT, SIGINT, SIGTERM};
use signal_hook::flag;
use tracing::warn;

use crate::error::DaemonResult;
use crate::pidfile::PidFile;
use crate::sys;

/// The structured reason a daemon is being asked to shut down, produced by
/// [`SignalDispatcher::poll`] and consumed by the application's main loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ShutdownReason {
    /// SIGINT — interactive interrupt.
    Interrupt,
    /// SIGTERM — polite termination request.
    Terminate,
    /// SIGABRT — abnormal termination request.
    Abort,
}

impl ShutdownReason {
    /// The OS signal number this reason corresponds to.
    pub fn signum(self) -> i32 {
        match self {
            ShutdownReason::Interrupt => SIGINT,
            ShutdownReason::Terminate => SIGTERM,
            ShutdownReason::Abort => SIGABRT,
        }
    }
}

impl From<ShutdownReason> for i32 {
    fn from(reason: ShutdownReason) -> i32 {
        reason.signum()
    }
}

/// Delivers `signal` to the process recorded in the pidfile at `pid_file`.
///
/// `signal` is either a raw signal number or a [`ShutdownReason`]. No wire
/// protocol is involved: the pid is read from the file and the signal is
/// delivered with `kill(2)`. Usable from any process, daemonized or not.
pub fn send<P: AsRef<Path>, S: Into<i32>>(pid_file: P, signal: S) -> DaemonResult<()> {
    let pid = PidFile::read_pid(pid_file)?;
    sys::kill(pid, signal.into())
}

/// Probes whether the process recorded in the pidfile is alive.
///
/// Sends signal number 0, a pure existence check that delivers nothing.
/// Any failure (unreadable pidfile, garbage contents, no such process) is
/// reported as not running. Best-effort only: a `true` result means the pid
/// is currently valid in the process table, which can include a very
/// recently exited, not-yet-reaped process — it is not a strict running
/// guarantee, and pid reuse can make it lie.
pub fn ping<P: AsRef<Path>>(pid_file: P) -> bool {
    send(pid_file, 0).is_ok()
}

type Slot = Option<Box<dyn FnMut() + Send>>;

struct DispatchEntry {
    reason: ShutdownReason,
    fired: Arc<AtomicBool>,
    slot: Slot,
}

/// A process-scoped signal-dispatch table.
///
/// One context object owns the whole mapping from signal identifiers to
/// typed callback slots; it is populated once at startup via
/// [`install`](Self::install) and then polled from the main loop. Delivery
/// never unwinds or raises: a received signal merely raises a flag, and the
/// next [`poll`](Self::poll) runs the registered slot (in the polling
/// thread, never in signal context) and hands back a [`ShutdownReason`].
///
/// Policy: a slot callback cannot veto shutdown. `poll` reports the reason
/// regardless of what the callback does; the main loop is expected to tear
/// down and exit.
pub struct SignalDispatcher {
    entries: Vec<DispatchEntry>,
    installed: bool,
}

impl SignalDispatcher {
    /// Creates a dispatcher with empty slots for SIGINT, SIGTERM and
    /// SIGABRT. Nothing is registered with the OS until `install`.
    pub fn new() -> Self {
        let entries = [
            ShutdownReason::Interrupt,
            ShutdownReason::Terminate,
            ShutdownReason::Abort,
        ]
        .into_iter()
        .map(|reason| DispatchEntry {
            reason,
            fired: Arc::new(AtomicBool::new(false)),
            slot: None,
        })
        .collect();

        SignalDispatcher {
            entries,
            installed: false,
        }
    }

    /// Fills the callback slot for `reason`, replacing any previous one.
    pub fn on<F>(&mut self, reason: ShutdownReason, callback: F) -> &mut Self
    where
        F: FnMut() + Send + 'static,
    {
        for entry in &mut self.entries {
            if entry.reason == reason {
                entry.slot = Some(Box::new(callback));
                break;
            }
        }
        self
    }

    /// Registers the OS signal hooks. Idempotent: the table is populated
    /// exactly once, repeat calls are no-ops.
    pub fn install(&mut self) -> DaemonResult<()> {
        if self.installed {
            warn!("signal dispatcher already installed");
            return Ok(());
        }
        for entry in &self.entries {
            flag::register(entry.reason.signum(), Arc::clone(&entry.fired))?;
        }
        self.installed = true;
        Ok(())
    }

    /// Checks for a received signal, runs its slot callback if one is
    /// registered, and returns the shutdown reason for the main loop to act
    /// on. Returns `None` when no signal has arrived since the last poll.
    pub fn poll(&mut self) -> Option<ShutdownReason> {
        for entry in &mut self.entries {
            if entry.fired.swap(false, Ordering::SeqCst) {
                if let Some(callback) = entry.slot.as_mut() {
                    callback();
                }
                return Some(entry.reason);
            }
        }
        None
    }
}

impl Default for SignalDispatcher {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shutdown_reasons_map_to_standard_signal_numbers() {
        assert_eq!(ShutdownReason::Interrupt.signum(), SIGINT);
        assert_eq!(ShutdownReason::Terminate.signum(), SIGTERM);
        assert_eq!(ShutdownReason::Abort.signum(), SIGABRT);
    }

    #[test]
    fn poll_is_quiet_before_any_signal() {
        let mut dispatcher = SignalDispatcher::new();
        assert_eq!(dispatcher.poll(), None);
    }

    #[test]
    fn raised_signal_runs_slot_and_yields_reason() {
        let mut dispatcher = SignalDispatcher::new();
        let ran = Arc::new(AtomicBool::new(false));
        let ran_in_slot = Arc::clone(&ran);
        dispatcher.on(ShutdownReason::Terminate, move || {
            ran_in_slot.store(true, Ordering::SeqCst);
        });
        dispatcher.install().unwrap();

        // The flag handler only raises a flag, so delivering SIGTERM to
        // ourselves is safe here.
        signal_hook::low_level::raise(SIGTERM).unwrap();

        let mut seen = None;
        for _ in 0..100 {
            seen = dispatcher.poll();
            if seen.is_some() {
                break;
            }
            std::thread::sleep(std::time::Duration::from_millis(10));
        }
        assert_eq!(seen, Some(ShutdownReason::Terminate));
        assert!(ran.load(Ordering::SeqCst));

        // Consumed: the next poll is quiet again.
        assert_eq!(dispatcher.poll(), None);
    }
}
