use std::path::Path;
use std::process;

use tracing::{error, info};

use crate::error::DaemonResult;
use crate::sys;
use crate::types::{Group, User};

/// Drops privileges: "daemotion". Called by the daemon itself, after
/// daemonization, while still running with its elevated identity.
///
/// Either identity may be `None` to leave it unchanged. The step order is a
/// correctness invariant:
///
/// 1. The pidfile is chowned to the target identity first, while still
///    privileged, so the eventual unprivileged daemon can delete its own
///    lock file at teardown. This doubles as existence validation of the
///    target user and group.
/// 2. The group id is dropped.
/// 3. The user id is dropped, strictly after the group: dropping the user
///    first may remove the permission needed to change the group.
///
/// Identity resolution and the chown fail before any privilege state has
/// changed, and return an error. A setgid/setuid failure after that point
/// terminates the process: continuing with a half-dropped identity is not
/// an option.
pub fn daemote<P: AsRef<Path>>(
    pid_file: P,
    user: Option<User>,
    group: Option<Group>,
) -> DaemonResult<()> {
    // Resolve both identities up front so a bad name aborts cleanly.
    let uid = match &user {
        Some(user) => Some(sys::resolve_uid(user)?),
        None => None,
    };
    let gid = match &group {
        Some(group) => Some(sys::resolve_gid(group)?),
        None => None,
    };

    sys::set_owner(pid_file.as_ref(), uid, gid)?;

    // Group strictly before user.
    if let Some(gid) = gid {
        if let Err(err) = sys::set_gid(gid) {
            error!("unable to change group: {}", err);
            process::exit(1);
        }
    }
    if let Some(uid) = uid {
        if let Err(err) = sys::set_uid(uid) {
            error!("unable to change user: {}", err);
            process::exit(1);
        }
    }

    if uid.is_some() || gid.is_some() {
        info!(?uid, ?gid, "privileges dropped");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn noop_daemote_validates_the_pidfile_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("owned.pid");
        fs::write(&path, "1\n").unwrap();

        // With both identities absent only the chown no-op runs; the file
        // must exist and stay intact.
        daemote(&path, None, None).unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), "1\n");
    }

    #[test]
    fn missing_pidfile_fails_before_any_privilege_change() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("absent.pid");
        assert!(daemote(&path, None, None).is_err());
    }
}
