//! A minimal ticking daemon: detaches into the background, logs a line
//! every few seconds, and shuts down cleanly on SIGTERM/SIGINT.
//!
//! Run with `cargo run --example ticker`, watch `ticker.log`, and stop it
//! with `kill $(cat ticker.pid)`.

use std::env;
use std::thread;
use std::time::Duration;

use daemon_latch::{Daemonizer, ShutdownReason, SignalDispatcher, StreamTarget};

fn main() {
    let pwd = env::current_dir().expect("current directory");
    let pid_path = pwd.join("ticker.pid");
    let log_path = pwd.join("ticker.log");

    println!("launching ticker daemon, pidfile {:?}", pid_path);
    println!("logs will be written to {:?}", log_path);

    // Everything after start() runs in the detached grandchild; println!
    // already lands in the log file.
    let daemon = Daemonizer::new(&pid_path)
        .working_directory(&pwd)
        .stdout(StreamTarget::file(&log_path))
        .stderr(StreamTarget::file(&log_path))
        .start();

    let mut signals = SignalDispatcher::new();
    signals.on(ShutdownReason::Terminate, || {
        println!("[ticker] termination requested");
    });
    signals.install().expect("signal registration");

    println!("[ticker] started, pid {}", std::process::id());

    let mut tick = 0u64;
    loop {
        if let Some(reason) = signals.poll() {
            println!("[ticker] shutting down ({:?})", reason);
            break;
        }
        println!("[ticker] tick #{}", tick);
        tick += 1;
        thread::sleep(Duration::from_secs(3));
    }

    // Releases the lock and removes the pidfile.
    daemon.teardown();
}
