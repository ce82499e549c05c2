//! Process supervision
//!
//! Owns one child process through two pseudo-terminal pairs (one feeding its
//! stdin, one collecting stdout+stderr), drains its output into a
//! [`SessionBuffer`] on a background thread and reclaims the whole process
//! tree on stop.

use std::fs::File;
use std::io::{self, Write};
use std::os::unix::io::AsRawFd;
use std::process::{Child, Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use bitflags::bitflags;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use super::buffer::SessionBuffer;
use super::pty::{self, PtyError, PtyPair};
use super::terminal::TerminalMode;
use super::tree;

/// Bytes read per wake-up from either source
const CHUNK_SIZE: usize = 1024;
/// Grace period between SIGTERM and SIGKILL
const TERMINATE_GRACE: Duration = Duration::from_secs(1);
/// How long stop waits for the drain thread
const STOP_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Error, Debug)]
pub enum SupervisorError {
    #[error(transparent)]
    Pty(#[from] PtyError),

    #[error("Failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },

    #[error("Failed to change terminal mode: {0}")]
    Terminal(#[source] io::Error),

    #[error("Failed to spawn {0} thread: {1}")]
    Thread(&'static str, #[source] io::Error),

    #[error("Process already started")]
    AlreadyStarted,

    #[error("Process not started")]
    NotStarted,

    /// A background thread ignored cancellation. Not recoverable.
    #[error("{0} thread did not stop within {1:?}")]
    StuckTask(&'static str, Duration),
}

impl SupervisorError {
    /// Whether the hosting process must abort rather than carry on
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::StuckTask(..))
    }
}

pub type Result<T> = std::result::Result<T, SupervisorError>;

bitflags! {
    /// How the supervised session is mirrored on the operator's terminal
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct RelayMode: u8 {
        /// Forward controlling-terminal input to the child
        const TEE_STDIN = 0b0001;
        /// Echo child output (and written input) to stdout
        const TEE_STDOUT = 0b0010;
        /// Put the controlling terminal in raw mode while relaying input
        const RAW_MODE = 0b0100;
    }
}

/// What to launch and how to relay it
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    pub program: String,
    pub args: Vec<String>,
    pub relay: RelayMode,
    /// Bounded wait per drain iteration; also bounds shutdown latency
    pub poll_interval: Duration,
}

impl SupervisorConfig {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
            relay: RelayMode::empty(),
            poll_interval: Duration::from_millis(200),
        }
    }

    pub fn with_relay(mut self, relay: RelayMode) -> Self {
        self.relay = relay;
        self
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }
}

/// The read/write surface a network front end needs from a supervised process.
///
/// Anything that can launch a process and satisfy this contract can sit
/// behind the session server.
pub trait ProcessIo: Send + Sync + 'static {
    /// Launch the process and begin draining its output
    fn start(&self) -> Result<()>;
    /// Take every buffered output byte (empty if nothing is pending)
    fn read(&self) -> Vec<u8>;
    /// Take one complete `\n`-terminated line, or nothing
    fn read_line(&self) -> Vec<u8>;
    /// Forward bytes to the process input
    fn write(&self, data: &[u8]) -> Result<()>;
    /// True while the process runs and its output is being drained
    fn is_alive(&self) -> bool;
    /// Reclaim the process tree and background thread. Idempotent.
    fn stop(&self) -> Result<()>;
}

#[derive(Default)]
struct State {
    child: Option<Child>,
    input: Option<Arc<File>>,
    drain: Option<JoinHandle<()>>,
    /// Set once the drain thread missed its stop deadline; never cleared
    stuck: bool,
    terminal: TerminalMode,
}

/// Supervises a single child behind pseudo terminals
pub struct ProcessSupervisor {
    config: SupervisorConfig,
    buffer: SessionBuffer,
    running: Arc<AtomicBool>,
    state: Mutex<State>,
}

impl ProcessSupervisor {
    pub fn new(config: SupervisorConfig) -> Result<Self> {
        let buffer = SessionBuffer::spawn().map_err(|e| SupervisorError::Thread("buffer", e))?;
        Ok(Self {
            config,
            buffer,
            running: Arc::new(AtomicBool::new(false)),
            state: Mutex::new(State::default()),
        })
    }

    fn lock_state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn spawn_child(&self, state: &mut State) -> Result<()> {
        let relay = self.config.relay;
        if relay.contains(RelayMode::TEE_STDIN | RelayMode::RAW_MODE) {
            state.terminal.enter_raw().map_err(SupervisorError::Terminal)?;
        }

        let input = PtyPair::open()?;
        let output = PtyPair::open()?;
        let spawn_err = |source| SupervisorError::Spawn {
            program: self.config.program.clone(),
            source,
        };
        let stdout = output.follower.try_clone().map_err(spawn_err)?;

        let mut command = Command::new(&self.config.program);
        command
            .args(&self.config.args)
            .stdin(Stdio::from(input.follower))
            .stdout(Stdio::from(stdout))
            .stderr(Stdio::from(output.follower));
        let child = command.spawn().map_err(spawn_err)?;
        // Close our copies of the follower ends so EOF tracks the child.
        drop(command);

        info!("Spawned {} (pid {})", self.config.program, child.id());

        let input = Arc::new(input.controller);
        let drain = Drain {
            output: output.controller,
            input: Arc::clone(&input),
            buffer: self.buffer.clone(),
            running: Arc::clone(&self.running),
            relay,
            poll_interval: self.config.poll_interval,
        };

        self.running.store(true, Ordering::SeqCst);
        state.child = Some(child);
        state.input = Some(input);

        let handle = thread::Builder::new()
            .name("pty-drain".to_string())
            .spawn(move || drain.run())
            .map_err(|e| SupervisorError::Thread("drain", e))?;
        state.drain = Some(handle);
        Ok(())
    }
}

impl ProcessIo for ProcessSupervisor {
    fn start(&self) -> Result<()> {
        let mut state = self.lock_state();
        if state.child.is_some() {
            return Err(SupervisorError::AlreadyStarted);
        }

        let result = self.spawn_child(&mut state);
        if result.is_err() {
            if let Some(child) = state.child.as_mut() {
                tree::terminate_tree(child, TERMINATE_GRACE);
            }
            self.running.store(false, Ordering::SeqCst);
            if let Err(e) = state.terminal.restore() {
                warn!("Failed to restore terminal: {}", e);
            }
        }
        result
    }

    fn read(&self) -> Vec<u8> {
        self.buffer.take_all()
    }

    fn read_line(&self) -> Vec<u8> {
        self.buffer.take_line()
    }

    fn write(&self, data: &[u8]) -> Result<()> {
        let input = self
            .lock_state()
            .input
            .clone()
            .ok_or(SupervisorError::NotStarted)?;
        pty::write_all(&input, data)?;

        let relay = self.config.relay;
        if relay.contains(RelayMode::TEE_STDOUT) && !relay.contains(RelayMode::RAW_MODE) {
            echo_to_stdout(data);
        }
        Ok(())
    }

    fn is_alive(&self) -> bool {
        let mut state = self.lock_state();
        let child_running = match state.child.as_mut() {
            Some(child) => matches!(child.try_wait(), Ok(None)),
            None => false,
        };
        let draining = state.drain.as_ref().map_or(false, |h| !h.is_finished());
        child_running && draining
    }

    fn stop(&self) -> Result<()> {
        let mut state = self.lock_state();

        if let Some(child) = state.child.as_mut() {
            let report = tree::terminate_tree(child, TERMINATE_GRACE);
            if !report.signalled.is_empty() {
                info!(
                    "Terminated process tree: {} signalled, {} force-killed",
                    report.signalled.len(),
                    report.force_killed.len()
                );
            }
        }

        self.running.store(false, Ordering::SeqCst);
        if let Some(false) = state.drain.take().map(|h| super::join_within(h, STOP_TIMEOUT)) {
            state.stuck = true;
        }
        // A detached drain thread is still running; keep reporting it.
        let joined = if state.stuck {
            Err(SupervisorError::StuckTask("drain", STOP_TIMEOUT))
        } else {
            Ok(())
        };
        state.input = None;

        let restored = state.terminal.restore().map_err(SupervisorError::Terminal);
        joined.and(restored)
    }
}

impl Drop for ProcessSupervisor {
    fn drop(&mut self) {
        match self.stop() {
            Ok(()) => {}
            Err(e) if e.is_fatal() => {
                error!("Supervisor shutdown failed: {}", e);
                eprintln!("\r\nfatal: {}\r", e);
                std::process::abort();
            }
            Err(e) => warn!("Supervisor shutdown: {}", e),
        }
    }
}

/// State moved onto the drain thread
struct Drain {
    output: File,
    input: Arc<File>,
    buffer: SessionBuffer,
    running: Arc<AtomicBool>,
    relay: RelayMode,
    poll_interval: Duration,
}

impl Drain {
    fn run(self) {
        let stdin_fd = libc::STDIN_FILENO;
        let mut fds = vec![self.output.as_raw_fd()];
        if self.relay.contains(RelayMode::TEE_STDIN) {
            fds.push(stdin_fd);
        }

        let mut chunk = [0u8; CHUNK_SIZE];

        while self.running.load(Ordering::SeqCst) {
            let ready = match pty::wait_readable(&fds, self.poll_interval) {
                Ok(ready) => ready,
                Err(e) => {
                    error!("Drain poll failed: {}", e);
                    break;
                }
            };

            if ready.get(1).copied().unwrap_or(false) {
                match pty::read_fd(stdin_fd, &mut chunk) {
                    Ok(0) => {
                        debug!("Terminal input closed, no longer relaying");
                        fds.truncate(1);
                    }
                    Ok(n) => {
                        if let Err(e) = pty::write_all(&self.input, &chunk[..n]) {
                            warn!("Failed to relay terminal input: {}", e);
                        }
                    }
                    Err(e) => {
                        warn!("Terminal input failed, no longer relaying: {}", e);
                        fds.truncate(1);
                    }
                }
            }

            if ready[0] {
                match pty::read_chunk(&self.output, &mut chunk) {
                    Ok(0) => {
                        info!("Child output closed");
                        break;
                    }
                    Ok(n) => {
                        if self.relay.contains(RelayMode::TEE_STDOUT) {
                            echo_to_stdout(&chunk[..n]);
                        }
                        self.buffer.append(&chunk[..n]);
                    }
                    Err(e) => {
                        // EIO once every follower descriptor is closed.
                        info!("Child output ended: {}", e);
                        break;
                    }
                }
            }
        }
        debug!("Drain thread exiting");
    }
}

fn echo_to_stdout(data: &[u8]) {
    let mut stdout = io::stdout().lock();
    if stdout.write_all(data).and_then(|_| stdout.flush()).is_err() {
        debug!("Failed to echo {} bytes to stdout", data.len());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    fn sh(script: &str) -> ProcessSupervisor {
        let config = SupervisorConfig::new("/bin/sh", vec!["-c".to_string(), script.to_string()])
            .with_poll_interval(Duration::from_millis(50));
        ProcessSupervisor::new(config).unwrap()
    }

    fn wait_for_line(supervisor: &ProcessSupervisor, timeout: Duration) -> Vec<u8> {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            let line = supervisor.read_line();
            if !line.is_empty() {
                return line;
            }
            thread::sleep(Duration::from_millis(10));
        }
        Vec::new()
    }

    #[test]
    fn test_round_trip_through_child() {
        let supervisor = sh("cat");
        supervisor.start().unwrap();
        assert!(supervisor.is_alive());

        supervisor.write(b"hello\n").unwrap();
        let line = wait_for_line(&supervisor, Duration::from_secs(3));
        assert_eq!(line, b"hello\r\n".to_vec());

        supervisor.stop().unwrap();
        assert!(!supervisor.is_alive());
    }

    #[test]
    fn test_stderr_is_merged() {
        let supervisor = sh("echo oops >&2; sleep 5");
        supervisor.start().unwrap();

        let line = wait_for_line(&supervisor, Duration::from_secs(3));
        assert_eq!(line, b"oops\r\n".to_vec());

        supervisor.stop().unwrap();
    }

    #[test]
    fn test_not_alive_after_child_exits() {
        let supervisor = sh("exit 0");
        supervisor.start().unwrap();

        let deadline = Instant::now() + Duration::from_secs(3);
        while supervisor.is_alive() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(20));
        }
        assert!(!supervisor.is_alive());
        supervisor.stop().unwrap();
    }

    #[test]
    fn test_stop_is_idempotent() {
        let supervisor = sh("sleep 30");
        supervisor.start().unwrap();

        supervisor.stop().unwrap();
        supervisor.stop().unwrap();
        assert!(!supervisor.is_alive());
    }

    #[test]
    fn test_stop_without_start() {
        let supervisor = sh("sleep 30");
        assert!(supervisor.stop().is_ok());
        assert!(!supervisor.is_alive());
        assert!(matches!(supervisor.write(b"x"), Err(SupervisorError::NotStarted)));
    }

    #[test]
    fn test_double_start_rejected() {
        let supervisor = sh("sleep 30");
        supervisor.start().unwrap();
        assert!(matches!(supervisor.start(), Err(SupervisorError::AlreadyStarted)));
        supervisor.stop().unwrap();
    }

    #[test]
    fn test_spawn_failure_reported() {
        let supervisor =
            ProcessSupervisor::new(SupervisorConfig::new("/nonexistent/vivado", Vec::new())).unwrap();
        assert!(matches!(supervisor.start(), Err(SupervisorError::Spawn { .. })));
        assert!(!supervisor.is_alive());
    }

    #[test]
    fn test_stuck_drain_keeps_failing_stop() {
        let supervisor = sh("sleep 30");
        let release = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&release);
        supervisor.lock_state().drain = Some(thread::spawn(move || {
            while !flag.load(Ordering::SeqCst) {
                thread::sleep(Duration::from_millis(10));
            }
        }));

        let first = supervisor.stop().unwrap_err();
        assert!(first.is_fatal());
        // The handle is gone but the thread is not; later stops must say so.
        let second = supervisor.stop().unwrap_err();
        assert!(matches!(second, SupervisorError::StuckTask("drain", _)));

        release.store(true, Ordering::SeqCst);
        supervisor.lock_state().stuck = false;
    }
}
