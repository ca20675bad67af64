use std::fs;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use daemon_latch::{PidFile, ping, send};
use signal_hook::consts::signal::SIGUSR1;

#[test]
fn ping_reports_a_live_process() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("live.pid");

    let mut pidfile = PidFile::acquire(&path).unwrap();
    pidfile.write_pid().unwrap();

    assert!(ping(&path));
}

#[test]
fn ping_is_false_for_a_pid_that_never_existed() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("ghost.pid");
    // Far above any default pid_max.
    fs::write(&path, "123456789\n").unwrap();

    assert!(!ping(&path));
}

#[test]
fn ping_is_false_for_a_missing_pidfile() {
    let dir = tempfile::tempdir().unwrap();
    assert!(!ping(dir.path().join("nowhere.pid")));
}

#[test]
fn ping_is_false_for_a_garbage_pidfile() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("garbage.pid");
    fs::write(&path, "definitely not a pid\n").unwrap();

    assert!(!ping(&path));
}

#[test]
fn send_delivers_a_real_signal_to_the_recorded_pid() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("self.pid");

    let mut pidfile = PidFile::acquire(&path).unwrap();
    pidfile.write_pid().unwrap();

    let received = Arc::new(AtomicBool::new(false));
    signal_hook::flag::register(SIGUSR1, Arc::clone(&received)).unwrap();

    send(&path, SIGUSR1).unwrap();

    let mut seen = false;
    for _ in 0..100 {
        if received.load(Ordering::SeqCst) {
            seen = true;
            break;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    assert!(seen, "SIGUSR1 was not delivered");
}

#[test]
fn send_to_a_missing_pidfile_is_an_error() {
    let dir = tempfile::tempdir().unwrap();
    assert!(send(dir.path().join("nowhere.pid"), 0).is_err());
}
