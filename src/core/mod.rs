//! Core process plumbing.
//!
//! This module contains the low-level pieces the session server sits on:
//!
//! - **pty**: `openpty` pairs and a `poll` helper
//! - **buffer**: actor-owned session output buffer
//! - **terminal**: raw-mode handling for the operator's terminal
//! - **tree**: two-phase process tree termination
//! - **process**: the supervisor tying them together
//!
//! # Architecture
//!
//! ```text
//! ProcessSupervisor
//! ├── Child (stdin <- input pty, stdout+stderr -> output pty)
//! ├── Drain thread (output pty -> SessionBuffer [-> stdout], stdin -> input pty)
//! └── SessionBuffer actor (append / take-all / take-line)
//! ```

use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

pub mod buffer;
#[cfg(unix)]
pub mod process;
#[cfg(unix)]
pub mod pty;
pub mod terminal;
#[cfg(unix)]
pub mod tree;

/// Join `handle` if it finishes within `timeout`.
///
/// Returns false when the thread is still running at the deadline; the
/// handle is dropped and the thread detached in that case.
pub fn join_within(handle: JoinHandle<()>, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    while !handle.is_finished() {
        if Instant::now() >= deadline {
            return false;
        }
        thread::sleep(Duration::from_millis(10));
    }
    if handle.join().is_err() {
        tracing::error!("Background thread panicked");
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_join_within_finished_thread() {
        let handle = thread::spawn(|| {});
        assert!(join_within(handle, Duration::from_secs(1)));
    }

    #[test]
    fn test_join_within_stuck_thread() {
        let release = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&release);
        let handle = thread::spawn(move || {
            while !flag.load(Ordering::SeqCst) {
                thread::sleep(Duration::from_millis(5));
            }
        });

        assert!(!join_within(handle, Duration::from_millis(50)));
        release.store(true, Ordering::SeqCst);
    }
}
