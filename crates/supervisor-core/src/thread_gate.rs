//! Thread-creation suppression during the supervised window.
//!
//! While the gate is engaged, any thread entering the process is told to
//! terminate immediately. The orchestrator lifts the gate just long enough
//! to start its own watchdog thread, then re-engages it.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadDecision {
    Allow,
    TerminateImmediately,
}

#[derive(Debug)]
pub struct ThreadGate {
    engaged: AtomicBool,
}

impl ThreadGate {
    pub fn new() -> Self {
        Self {
            engaged: AtomicBool::new(false),
        }
    }

    pub fn engage(&self) {
        self.engaged.store(true, Ordering::SeqCst);
    }

    pub fn lift(&self) {
        self.engaged.store(false, Ordering::SeqCst);
    }

    pub fn is_engaged(&self) -> bool {
        self.engaged.load(Ordering::SeqCst)
    }

    /// Policy applied at every new-thread entry point.
    pub fn on_thread_start(&self) -> ThreadDecision {
        if self.is_engaged() {
            warn!("thread creation suppressed during supervised window");
            ThreadDecision::TerminateImmediately
        } else {
            ThreadDecision::Allow
        }
    }

    /// Start the parent watchdog: lift the gate only for the spawn itself,
    /// re-engage immediately after. The watchdog terminates this process if
    /// the parent that raised it dies.
    pub fn spawn_parent_watchdog(
        self: &Arc<Self>,
        parent_pid: u32,
    ) -> std::io::Result<JoinHandle<()>> {
        self.lift();
        let result = std::thread::Builder::new()
            .name("vmsup-watchdog".to_string())
            .spawn(move || watch_parent(parent_pid));
        self.engage();
        result
    }
}

impl Default for ThreadGate {
    fn default() -> Self {
        Self::new()
    }
}

fn watch_parent(parent_pid: u32) {
    loop {
        if !parent_alive(parent_pid) {
            info!(parent_pid, "parent died; terminating");
            std::process::exit(1);
        }
        std::thread::sleep(Duration::from_millis(250));
    }
}

#[cfg(unix)]
fn parent_alive(parent_pid: u32) -> bool {
    // Re-parenting to init (or a subreaper) means the original parent died.
    nix::unistd::getppid().as_raw() == parent_pid as i32
}

#[cfg(not(unix))]
fn parent_alive(_parent_pid: u32) -> bool {
    true
}
