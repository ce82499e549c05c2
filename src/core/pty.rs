//! Pseudo-terminal pairs for Unix
//!
//! This module provides a thin safe wrapper around `openpty(3)` plus a
//! `poll(2)` helper used by every bounded-wait loop in the crate.

use std::fs::File;
use std::io::{self, Read, Write};
use std::os::unix::io::{AsRawFd, FromRawFd, RawFd};
use std::time::Duration;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum PtyError {
    #[error("Failed to open pseudo terminal: {0}")]
    Open(#[source] io::Error),

    #[error("Failed to configure pseudo terminal: {0}")]
    Configure(#[source] io::Error),

    #[error("Failed to read from PTY: {0}")]
    Read(#[source] io::Error),

    #[error("Failed to write to PTY: {0}")]
    Write(#[source] io::Error),

    #[error("Failed to poll descriptors: {0}")]
    Poll(#[source] io::Error),
}

pub type Result<T> = std::result::Result<T, PtyError>;

/// A linked controller/follower pair.
///
/// The controller stays with the supervisor; the follower is handed to the
/// child as one of its standard streams. Both ends are close-on-exec.
pub struct PtyPair {
    pub controller: File,
    pub follower: File,
}

impl PtyPair {
    /// Allocate a new pair
    pub fn open() -> Result<Self> {
        let mut controller: RawFd = -1;
        let mut follower: RawFd = -1;

        let rc = unsafe {
            libc::openpty(
                &mut controller,
                &mut follower,
                std::ptr::null_mut(),
                std::ptr::null_mut(),
                std::ptr::null_mut(),
            )
        };
        if rc != 0 {
            return Err(PtyError::Open(io::Error::last_os_error()));
        }

        // Take ownership right away so both descriptors are closed on error.
        let controller = unsafe { File::from_raw_fd(controller) };
        let follower = unsafe { File::from_raw_fd(follower) };

        // Spawning dup2()s the follower onto the child's stdio, which drops
        // the flag there; no other process may inherit either end.
        set_cloexec(controller.as_raw_fd(), true)?;
        set_cloexec(follower.as_raw_fd(), true)?;

        Ok(Self { controller, follower })
    }
}

fn set_cloexec(fd: RawFd, enabled: bool) -> Result<()> {
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFD) };
    if flags < 0 {
        return Err(PtyError::Configure(io::Error::last_os_error()));
    }
    let new_flags = if enabled {
        flags | libc::FD_CLOEXEC
    } else {
        flags & !libc::FD_CLOEXEC
    };
    if unsafe { libc::fcntl(fd, libc::F_SETFD, new_flags) } < 0 {
        return Err(PtyError::Configure(io::Error::last_os_error()));
    }
    Ok(())
}

/// Wait until any of `fds` is readable or `timeout` elapses.
///
/// Returns one flag per descriptor, in the same order. A hang-up or error
/// condition counts as readable so the caller's next read reports it.
pub fn wait_readable(fds: &[RawFd], timeout: Duration) -> Result<Vec<bool>> {
    let mut pollfds: Vec<libc::pollfd> = fds
        .iter()
        .map(|&fd| libc::pollfd {
            fd,
            events: libc::POLLIN,
            revents: 0,
        })
        .collect();

    let timeout_ms = timeout.as_millis().min(i32::MAX as u128) as libc::c_int;
    let rc = unsafe { libc::poll(pollfds.as_mut_ptr(), pollfds.len() as libc::nfds_t, timeout_ms) };
    if rc < 0 {
        let err = io::Error::last_os_error();
        // A signal interrupted the wait; report nothing ready and let the loop retry.
        if err.kind() == io::ErrorKind::Interrupted {
            return Ok(vec![false; fds.len()]);
        }
        return Err(PtyError::Poll(err));
    }

    let ready_mask = libc::POLLIN | libc::POLLHUP | libc::POLLERR;
    Ok(pollfds.iter().map(|p| p.revents & ready_mask != 0).collect())
}

/// Read at most `buf.len()` bytes from a raw descriptor we do not own (stdin).
pub fn read_fd(fd: RawFd, buf: &mut [u8]) -> Result<usize> {
    let n = unsafe { libc::read(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len()) };
    if n < 0 {
        return Err(PtyError::Read(io::Error::last_os_error()));
    }
    Ok(n as usize)
}

/// Read one chunk from a controller end
pub fn read_chunk(mut file: &File, buf: &mut [u8]) -> Result<usize> {
    file.read(buf).map_err(PtyError::Read)
}

/// Write all of `data` to a controller end
pub fn write_all(mut file: &File, data: &[u8]) -> Result<()> {
    file.write_all(data).map_err(PtyError::Write)?;
    file.flush().map_err(PtyError::Write)
}
