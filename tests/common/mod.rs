//! Shared helpers for integration tests that trace a live child.

#![allow(dead_code)]

use std::process::{Child, Command};
use std::thread;
use std::time::Duration;

use fim::ProcessController;

/// Spawns a child that parks long enough for a test to trace it.
pub fn spawn_parked_child() -> Child {
    let child = Command::new("sleep")
        .arg("30")
        .spawn()
        .expect("failed to spawn sleep");
    // Give execve a moment so the attach sees the final process image.
    thread::sleep(Duration::from_millis(100));
    child
}

/// Attaches to the child, or signals a skip when the environment denies
/// ptrace (restrictive Yama settings, unprivileged containers).
pub fn attach_or_skip(pid: i32) -> Option<ProcessController> {
    let mut controller = ProcessController::new(pid).expect("pid is valid");
    match controller.attach() {
        Ok(()) => Some(controller),
        Err(e) => {
            eprintln!("skipping ptrace test: {}", e);
            None
        }
    }
}

pub fn reap(mut child: Child) {
    let _ = child.kill();
    let _ = child.wait();
}
