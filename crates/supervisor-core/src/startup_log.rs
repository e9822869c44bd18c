//! Best-effort startup diagnostics file.
//!
//! Opened from a command-line-supplied path before anything interesting
//! happens; every line carries a PID/TID prefix so interleaved generations
//! writing to the same file stay attributable. Open failures are non-fatal,
//! and a size cap keeps a crash loop from growing the file without bound.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use tracing::warn;

pub const DEFAULT_LOG_CAP_BYTES: u64 = 16 * 1024 * 1024;

pub struct StartupLog {
    file: Option<Mutex<File>>,
    cap_bytes: u64,
    written: AtomicU64,
}

impl StartupLog {
    /// A log that swallows everything; used when no path was supplied.
    pub fn disabled() -> Self {
        Self {
            file: None,
            cap_bytes: 0,
            written: AtomicU64::new(0),
        }
    }

    pub fn open(path: &Path, cap_bytes: u64) -> Self {
        match OpenOptions::new().create(true).append(true).open(path) {
            Ok(file) => Self {
                file: Some(Mutex::new(file)),
                cap_bytes,
                written: AtomicU64::new(0),
            },
            Err(err) => {
                warn!(path = %path.display(), error = %err, "startup log unavailable");
                Self::disabled()
            }
        }
    }

    pub fn line(&self, text: &str) {
        let Some(file) = &self.file else {
            return;
        };
        let entry = format!("{}/{} {}\n", std::process::id(), current_tid(), text);
        let after = self
            .written
            .fetch_add(entry.len() as u64, Ordering::Relaxed)
            + entry.len() as u64;
        if after > self.cap_bytes {
            return;
        }
        if let Ok(mut file) = file.lock() {
            let _ = file.write_all(entry.as_bytes());
        }
    }
}

#[cfg(unix)]
fn current_tid() -> u64 {
    // SAFETY: gettid has no failure modes.
    (unsafe { libc::syscall(libc::SYS_gettid) }) as u64
}

#[cfg(not(unix))]
fn current_tid() -> u64 {
    0
}
