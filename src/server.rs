//! Session server
//!
//! Bridges exactly one TCP client at a time to a supervised process. Bytes
//! received from the socket go to the process input; buffered process output
//! goes back to the socket. Both directions are polled with a bounded timeout
//! so the stop flag is observed promptly.

use std::io::{self, Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::os::unix::io::AsRawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use thiserror::Error;
use tracing::{error, info, warn};

use crate::core::join_within;
use crate::core::process::{ProcessIo, SupervisorError};
use crate::core::pty;

/// Socket receive size per iteration
const RECV_SIZE: usize = 1024;
/// How long stop waits for the accept thread
const STOP_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Error, Debug)]
pub enum ServerError {
    #[error("Failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error("Failed to configure listener: {0}")]
    Listen(#[source] io::Error),

    #[error(transparent)]
    Process(#[from] SupervisorError),

    #[error("Failed to spawn accept thread: {0}")]
    Thread(#[source] io::Error),

    #[error("Server already running")]
    AlreadyRunning,

    /// The accept thread ignored cancellation. Not recoverable.
    #[error("accept thread did not stop within {0:?}")]
    StuckTask(Duration),
}

impl ServerError {
    pub fn is_fatal(&self) -> bool {
        match self {
            Self::StuckTask(_) => true,
            Self::Process(e) => e.is_fatal(),
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, ServerError>;

/// Single-client TCP front end for a [`ProcessIo`]
pub struct SessionServer<P: ProcessIo> {
    process: Arc<P>,
    host: String,
    port: u16,
    poll_interval: Duration,
    announce: bool,
    should_run: Arc<AtomicBool>,
    /// Error the accept loop hit while stopping an exited process
    failure: Arc<Mutex<Option<ServerError>>>,
    thread: Option<JoinHandle<()>>,
    local_addr: Option<SocketAddr>,
}

impl<P: ProcessIo> SessionServer<P> {
    pub fn new(process: P, host: impl Into<String>, port: u16) -> Self {
        Self {
            process: Arc::new(process),
            host: host.into(),
            port,
            poll_interval: Duration::from_millis(200),
            announce: false,
            should_run: Arc::new(AtomicBool::new(false)),
            failure: Arc::new(Mutex::new(None)),
            thread: None,
            local_addr: None,
        }
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// Print connection status lines on the operator terminal
    pub fn with_announcements(mut self, announce: bool) -> Self {
        self.announce = announce;
        self
    }

    /// Address actually bound, available after [`run`](Self::run)
    #[allow(dead_code)]
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    #[cfg(test)]
    pub fn process(&self) -> &P {
        &self.process
    }

    /// Start the process, bind the listener and spawn the accept loop
    pub fn run(&mut self) -> Result<()> {
        if self.thread.is_some() {
            return Err(ServerError::AlreadyRunning);
        }

        self.process.start()?;

        let listener = bind_listener(&self.host, self.port)?;
        self.local_addr = listener.local_addr().ok();
        info!("Listening on {:?}", self.local_addr);

        self.should_run.store(true, Ordering::SeqCst);
        let accept = AcceptLoop {
            listener,
            process: Arc::clone(&self.process),
            should_run: Arc::clone(&self.should_run),
            failure: Arc::clone(&self.failure),
            poll_interval: self.poll_interval,
            announce: self.announce,
        };
        let handle = thread::Builder::new()
            .name("session-server".to_string())
            .spawn(move || accept.run())
            .map_err(ServerError::Thread)?;
        self.thread = Some(handle);
        Ok(())
    }

    /// Run and block until the accept loop ends (the process exited)
    pub fn serve_forever(&mut self) -> Result<()> {
        self.run()?;
        if let Some(handle) = self.thread.take() {
            if handle.join().is_err() {
                error!("Accept thread panicked");
            }
        }
        self.take_failure()
    }

    /// Stop the process, then the accept loop
    pub fn stop(&mut self) -> Result<()> {
        let stopped = self.process.stop().map_err(ServerError::from);

        self.should_run.store(false, Ordering::SeqCst);
        let joined = match self.thread.take().map(|h| join_within(h, STOP_TIMEOUT)) {
            Some(false) => Err(ServerError::StuckTask(STOP_TIMEOUT)),
            _ => Ok(()),
        };

        self.take_failure().and(stopped).and(joined)
    }

    fn take_failure(&self) -> Result<()> {
        let failure = self
            .failure
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        failure.map_or(Ok(()), Err)
    }

    /// Whether the accept loop is still running
    #[allow(dead_code)]
    pub fn is_alive(&self) -> bool {
        self.thread.as_ref().map_or(false, |h| !h.is_finished())
    }
}

impl<P: ProcessIo> Drop for SessionServer<P> {
    fn drop(&mut self) {
        match self.stop() {
            Ok(()) => {}
            Err(e) if e.is_fatal() => {
                error!("Server shutdown failed: {}", e);
                eprintln!("\r\nfatal: {}\r", e);
                std::process::abort();
            }
            Err(e) => warn!("Server shutdown: {}", e),
        }
    }
}

fn bind_listener(host: &str, port: u16) -> Result<TcpListener> {
    // std enables SO_REUSEADDR on Unix listeners.
    let listener = TcpListener::bind((host, port)).map_err(|source| ServerError::Bind {
        addr: format!("{}:{}", host, port),
        source,
    })?;

    // Re-listen to shrink the backlog to a single pending connection.
    if unsafe { libc::listen(listener.as_raw_fd(), 1) } != 0 {
        return Err(ServerError::Listen(io::Error::last_os_error()));
    }
    listener.set_nonblocking(true).map_err(ServerError::Listen)?;
    Ok(listener)
}

/// State moved onto the accept thread
struct AcceptLoop<P: ProcessIo> {
    listener: TcpListener,
    process: Arc<P>,
    should_run: Arc<AtomicBool>,
    failure: Arc<Mutex<Option<ServerError>>>,
    poll_interval: Duration,
    announce: bool,
}

impl<P: ProcessIo> AcceptLoop<P> {
    fn run(self) {
        let fd = self.listener.as_raw_fd();

        while self.should_run() {
            match pty::wait_readable(&[fd], self.poll_interval) {
                Ok(ready) if ready[0] => {}
                Ok(_) => continue,
                Err(e) => {
                    error!("Listener poll failed: {}", e);
                    break;
                }
            }

            match self.listener.accept() {
                Ok((stream, addr)) => self.serve(stream, addr),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
                Err(e) => warn!("Accept failed: {}", e),
            }
        }
        info!("Accept loop exiting");
    }

    /// False once asked to stop or once the process died.
    fn should_run(&self) -> bool {
        if !self.process.is_alive() {
            if let Err(e) = self.process.stop() {
                error!("Failed to stop exited process: {}", e);
                let mut failure = self.failure.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
                if failure.is_none() {
                    *failure = Some(ServerError::from(e));
                }
            }
            self.should_run.store(false, Ordering::SeqCst);
            self.status("Monitor exited.");
            return false;
        }
        self.should_run.load(Ordering::SeqCst)
    }

    fn serve(&self, mut stream: TcpStream, addr: SocketAddr) {
        self.status(&format!("Connected to {}.", addr));

        if let Err(e) = stream
            .set_nonblocking(false)
            .and_then(|_| stream.set_read_timeout(Some(self.poll_interval)))
        {
            warn!("Failed to configure connection: {}", e);
            return;
        }

        // Output produced before this client attached belongs to nobody.
        let stale = self.process.read();
        if !stale.is_empty() {
            info!("Discarded {} stale bytes", stale.len());
        }

        let mut rx = [0u8; RECV_SIZE];
        while self.should_run() {
            let mut closed = false;

            match stream.read(&mut rx) {
                Ok(0) => closed = true,
                Ok(n) => {
                    if let Err(e) = self.process.write(&rx[..n]) {
                        warn!("Failed to forward {} bytes to process: {}", n, e);
                    }
                }
                Err(e) if is_timeout(&e) => {}
                Err(_) => closed = true,
            }

            let tx = self.process.read();
            if !tx.is_empty() && stream.write_all(&tx).is_err() {
                closed = true;
            }

            if closed {
                self.status("Connection closed.");
                break;
            }
        }
    }

    fn status(&self, message: &str) {
        info!("{}", message);
        if self.announce {
            let mut stdout = io::stdout().lock();
            let _ = write!(stdout, "\r\nPROCESS SERVER: {}\r\n", message);
            let _ = stdout.flush();
        }
    }
}

fn is_timeout(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut | io::ErrorKind::Interrupted
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::buffer::SessionBuffer;
    use crate::core::process::{ProcessSupervisor, SupervisorConfig};
    use std::sync::atomic::AtomicUsize;
    use std::time::Instant;

    /// Echoes every write back as output
    struct EchoProcess {
        buffer: SessionBuffer,
        alive: AtomicBool,
        stops: AtomicUsize,
    }

    impl EchoProcess {
        fn new() -> Self {
            Self {
                buffer: SessionBuffer::spawn().unwrap(),
                alive: AtomicBool::new(false),
                stops: AtomicUsize::new(0),
            }
        }
    }

    impl ProcessIo for EchoProcess {
        fn start(&self) -> crate::core::process::Result<()> {
            self.alive.store(true, Ordering::SeqCst);
            Ok(())
        }
        fn read(&self) -> Vec<u8> {
            self.buffer.take_all()
        }
        fn read_line(&self) -> Vec<u8> {
            self.buffer.take_line()
        }
        fn write(&self, data: &[u8]) -> crate::core::process::Result<()> {
            self.buffer.append(data);
            Ok(())
        }
        fn is_alive(&self) -> bool {
            self.alive.load(Ordering::SeqCst)
        }
        fn stop(&self) -> crate::core::process::Result<()> {
            self.alive.store(false, Ordering::SeqCst);
            self.stops.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    /// Exits on its own and reports a stuck task the first time it is stopped
    struct StuckOnExit {
        buffer: SessionBuffer,
        liveness_checks: AtomicUsize,
        stops: AtomicUsize,
    }

    impl ProcessIo for StuckOnExit {
        fn start(&self) -> crate::core::process::Result<()> {
            Ok(())
        }
        fn read(&self) -> Vec<u8> {
            self.buffer.take_all()
        }
        fn read_line(&self) -> Vec<u8> {
            self.buffer.take_line()
        }
        fn write(&self, data: &[u8]) -> crate::core::process::Result<()> {
            self.buffer.append(data);
            Ok(())
        }
        fn is_alive(&self) -> bool {
            self.liveness_checks.fetch_add(1, Ordering::SeqCst) < 3
        }
        fn stop(&self) -> crate::core::process::Result<()> {
            if self.stops.fetch_add(1, Ordering::SeqCst) == 0 {
                Err(SupervisorError::StuckTask("drain", Duration::from_millis(1)))
            } else {
                Ok(())
            }
        }
    }

    fn stuck_on_exit() -> StuckOnExit {
        StuckOnExit {
            buffer: SessionBuffer::spawn().unwrap(),
            liveness_checks: AtomicUsize::new(0),
            stops: AtomicUsize::new(0),
        }
    }

    fn start_server<P: ProcessIo>(process: P) -> SessionServer<P> {
        let mut server =
            SessionServer::new(process, "127.0.0.1", 0).with_poll_interval(Duration::from_millis(20));
        server.run().unwrap();
        server
    }

    fn connect(server: &SessionServer<impl ProcessIo>) -> TcpStream {
        let stream = TcpStream::connect(server.local_addr().unwrap()).unwrap();
        stream.set_read_timeout(Some(Duration::from_secs(3))).unwrap();
        stream
    }

    fn read_exact_len(stream: &mut TcpStream, len: usize) -> Vec<u8> {
        let mut out = Vec::new();
        let mut buf = [0u8; 256];
        while out.len() < len {
            let n = stream.read(&mut buf).unwrap();
            assert!(n > 0, "connection closed early");
            out.extend_from_slice(&buf[..n]);
        }
        out
    }

    #[test]
    fn test_bridges_socket_to_process() {
        let mut server = start_server(EchoProcess::new());
        let mut stream = connect(&server);

        stream.write_all(b"puts hi\r").unwrap();
        assert_eq!(read_exact_len(&mut stream, 8), b"puts hi\r".to_vec());

        server.stop().unwrap();
        assert!(!server.is_alive());
    }

    #[test]
    fn test_stale_output_is_discarded() {
        let process = EchoProcess::new();
        process.buffer.append(b"left over from nobody\n");
        let mut server = start_server(process);

        let mut stream = connect(&server);
        stream.write_all(b"fresh\n").unwrap();
        assert_eq!(read_exact_len(&mut stream, 6), b"fresh\n".to_vec());

        server.stop().unwrap();
    }

    #[test]
    fn test_serves_next_client_after_close() {
        let mut server = start_server(EchoProcess::new());

        {
            let mut first = connect(&server);
            first.write_all(b"one\n").unwrap();
            assert_eq!(read_exact_len(&mut first, 4), b"one\n".to_vec());
        }

        let mut second = connect(&server);
        second.write_all(b"two\n").unwrap();
        assert_eq!(read_exact_len(&mut second, 4), b"two\n".to_vec());

        server.stop().unwrap();
    }

    #[test]
    fn test_stops_itself_when_process_dies() {
        let mut server = start_server(EchoProcess::new());
        server.process().alive.store(false, Ordering::SeqCst);

        let deadline = Instant::now() + Duration::from_secs(2);
        while server.is_alive() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(10));
        }
        assert!(!server.is_alive());
        assert!(server.process().stops.load(Ordering::SeqCst) >= 1);
    }

    #[test]
    fn test_with_real_supervisor() {
        let config = SupervisorConfig::new("/bin/sh", vec!["-c".to_string(), "cat".to_string()])
            .with_poll_interval(Duration::from_millis(20));
        let mut server = start_server(ProcessSupervisor::new(config).unwrap());

        let mut stream = connect(&server);
        stream.write_all(b"abc\n").unwrap();
        assert_eq!(read_exact_len(&mut stream, 5), b"abc\r\n".to_vec());

        server.stop().unwrap();
        assert!(!server.process().is_alive());
    }

    #[test]
    fn test_serve_forever_surfaces_stuck_process() {
        let mut server =
            SessionServer::new(stuck_on_exit(), "127.0.0.1", 0).with_poll_interval(Duration::from_millis(10));

        let err = server.serve_forever().unwrap_err();
        assert!(err.is_fatal());
        assert_eq!(server.process().stops.load(Ordering::SeqCst), 1);
        // Reported once; the process itself now stops cleanly.
        assert!(server.stop().is_ok());
    }

    #[test]
    fn test_stop_surfaces_stuck_process_after_loop_exit() {
        let mut server = start_server(stuck_on_exit());

        let deadline = Instant::now() + Duration::from_secs(2);
        while server.is_alive() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(10));
        }
        assert!(!server.is_alive());

        let err = server.stop().unwrap_err();
        assert!(matches!(err, ServerError::Process(SupervisorError::StuckTask(..))));
        assert!(server.stop().is_ok());
    }
}
