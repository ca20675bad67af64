use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::os::unix::io::{AsRawFd, RawFd};
use std::path::{Path, PathBuf};
use std::process;

use tracing::{debug, warn};

use crate::error::{DaemonError, DaemonResult};

/// Exclusive-lock lifecycle over the daemon's pidfile.
///
/// The open handle holds a non-blocking `flock(2)` exclusive lock for as
/// long as the `PidFile` is alive; the OS releases the lock when the last
/// descriptor referencing the open file closes. At most one live process
/// can therefore hold a `PidFile` for a given path. Dropping the manager
/// removes the file and releases the lock, so cleanup also runs on error
/// paths that unwind past an acquired pidfile.
#[derive(Debug)]
pub struct PidFile {
    path: PathBuf,
    handle: File,
}

impl PidFile {
    /// Opens and locks `path`, creating the file if absent.
    ///
    /// The lock attempt never blocks: if another process already holds the
    /// lock this returns [`DaemonError::PidfileLocked`] immediately and the
    /// existing file is left untouched. An existing unlocked file is kept
    /// and will be overwritten by the next [`write_pid`](Self::write_pid).
    pub fn acquire<P: AsRef<Path>>(path: P) -> DaemonResult<PidFile> {
        let path = std::path::absolute(path.as_ref())?;

        if path.is_file() {
            warn!(
                path = %path.display(),
                "pidfile already exists; it will be overwritten once locking succeeds"
            );
        }

        let handle = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;

        // flock(2) releases the lock only when every descriptor referencing
        // this open file is closed, which is why the descriptor must later
        // be shielded from the descriptor reaper and never duplicated.
        if unsafe { libc::flock(handle.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) } < 0 {
            return Err(DaemonError::PidfileLocked);
        }

        debug!(path = %path.display(), "pidfile locked");
        Ok(PidFile { path, handle })
    }

    /// Writes the current process id: decimal digits plus a single trailing
    /// newline, replacing any previous contents. Flushed and synced before
    /// returning so concurrent readers observe a consistent value.
    pub fn write_pid(&mut self) -> DaemonResult<()> {
        self.handle.seek(SeekFrom::Start(0))?;
        self.handle.set_len(0)?;
        writeln!(self.handle, "{}", process::id())?;
        self.handle.flush()?;
        self.handle.sync_all()?;
        Ok(())
    }

    /// Reads the decimal process id recorded in the pidfile at `path`.
    ///
    /// Does not require (or take) the lock; this is the read side used by
    /// out-of-process signal delivery.
    pub fn read_pid<P: AsRef<Path>>(path: P) -> DaemonResult<i32> {
        let mut contents = String::new();
        File::open(path.as_ref())?.read_to_string(&mut contents)?;
        contents
            .trim()
            .parse::<i32>()
            .map_err(|err| DaemonError::InvalidPid(format!("{:?}: {}", contents.trim(), err)))
    }

    /// The absolute path of the pidfile.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The raw descriptor holding the lock, for shielding from the
    /// descriptor reaper.
    pub(crate) fn raw_fd(&self) -> RawFd {
        self.handle.as_raw_fd()
    }
}

impl Drop for PidFile {
    fn drop(&mut self) {
        // Teardown is best-effort: the process is exiting, so failures are
        // logged and never escalated. The file is unlinked while the lock is
        // still held; the handle closes (releasing the lock) right after.
        if let Err(err) = fs::remove_file(&self.path) {
            warn!(path = %self.path.display(), "failed to remove pidfile: {}", err);
        } else {
            debug!(path = %self.path.display(), "pidfile removed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_then_read_back_is_decimal_pid_plus_newline() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.pid");

        let mut pidfile = PidFile::acquire(&path).unwrap();
        pidfile.write_pid().unwrap();

        let raw = fs::read_to_string(&path).unwrap();
        assert_eq!(raw, format!("{}\n", process::id()));
        assert_eq!(PidFile::read_pid(&path).unwrap(), process::id() as i32);
    }

    #[test]
    fn second_acquire_fails_without_touching_the_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.pid");

        let mut first = PidFile::acquire(&path).unwrap();
        first.write_pid().unwrap();
        let before = fs::read_to_string(&path).unwrap();

        // flock on a second open file description of the same file conflicts
        // even within a single process.
        match PidFile::acquire(&path) {
            Err(DaemonError::PidfileLocked) => {}
            other => panic!("expected PidfileLocked, got {:?}", other),
        }

        assert!(path.exists());
        assert_eq!(fs::read_to_string(&path).unwrap(), before);
    }

    #[test]
    fn drop_removes_the_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.pid");

        let pidfile = PidFile::acquire(&path).unwrap();
        assert!(path.exists());
        drop(pidfile);
        assert!(!path.exists());
    }

    #[test]
    fn read_pid_rejects_garbage() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.pid");
        fs::write(&path, "not-a-pid\n").unwrap();

        match PidFile::read_pid(&path) {
            Err(DaemonError::InvalidPid(_)) => {}
            other => panic!("expected InvalidPid, got {:?}", other),
        }
    }
}
