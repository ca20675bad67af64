//! Platform backends.
//!
//! Only the Unix backend exists in-tree. A port to another platform would
//! fill in a sibling module exposing the same surface: `run` taking the
//! configured [`Daemonizer`](crate::Daemonizer) and producing a
//! [`Daemon`](crate::Daemon) handle, honoring `success_timeout` and
//! `strip_cmd_args` where the platform needs them.

#[cfg(unix)]
pub(crate) mod unix;

#[cfg(unix)]
pub(crate) use unix::{kill, resolve_gid, resolve_uid, run, set_gid, set_uid, set_owner};
