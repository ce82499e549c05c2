//! Protocol client
//!
//! Turns the relayed shell stream into discrete transactions: send one
//! command line, then read and classify lines until the prompt token comes
//! back on a line of its own.
//!
//! - **classify**: per-line severity
//! - **console**: colour-coded echo of the response
//! - **reports**: grammars for the structured inspection reports
//! - **commands**: one method per shell command

use std::io::{self, Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, info};

pub mod classify;
pub mod commands;
pub mod console;
pub mod reports;

pub use classify::{Classifier, LineKind};
pub use console::Console;
pub use reports::ReportError;

/// The shell prints this, with nothing after it, whenever it is idle
pub const PROMPT: &[u8] = b"Vivado% ";

/// Bytes requested per receive
const RECV_SIZE: usize = 1024;

#[derive(Error, Debug)]
pub enum ClientError {
    #[error("Failed to connect to {addr}: {source}")]
    Connect {
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error("Command '{command}' timed out")]
    CommandTimeout { command: String },

    #[error("Command '{command}' failed")]
    CommandFailure { command: String },

    #[error("Server closed the connection")]
    ConnectionClosed,

    #[error(transparent)]
    Report(#[from] ReportError),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

pub type Result<T> = std::result::Result<T, ClientError>;

/// A byte stream with a settable receive timeout
pub trait Transport: Read + Write {
    /// `None` blocks indefinitely
    fn set_timeout(&mut self, timeout: Option<Duration>) -> io::Result<()>;
}

impl Transport for TcpStream {
    fn set_timeout(&mut self, timeout: Option<Duration>) -> io::Result<()> {
        // A zero duration is rejected by the socket layer; treat it as the
        // shortest wait instead.
        let timeout = timeout.map(|t| t.max(Duration::from_millis(1)));
        self.set_read_timeout(timeout)
    }
}

/// One command and its response as it accumulates
#[derive(Debug)]
struct Transaction {
    command: String,
    body: String,
    failed: bool,
}

impl Transaction {
    fn new(command: &str) -> Self {
        Self {
            command: command.to_string(),
            body: String::new(),
            failed: false,
        }
    }

    /// Record one line. Returns true once the prompt closes the transaction.
    fn accept(&mut self, raw: &[u8], text: &str, kind: LineKind) -> bool {
        if kind.is_failure() {
            self.failed = true;
        }
        if raw == PROMPT {
            return true;
        }
        self.body.push_str(text);
        false
    }

    fn finish(self) -> Result<String> {
        if self.failed {
            Err(ClientError::CommandFailure {
                command: self.command,
            })
        } else {
            Ok(self.body)
        }
    }
}

/// Connection to a session server
pub struct Client<T: Transport> {
    transport: T,
    buffer: Vec<u8>,
    classifier: Classifier,
    console: Console,
    command_timeout: Option<Duration>,
}

impl Client<TcpStream> {
    /// Connect to `host:port`, giving up after `connect_timeout` per address
    pub fn connect(
        host: &str,
        port: u16,
        connect_timeout: Duration,
        classifier: Classifier,
        console: Console,
    ) -> Result<Self> {
        let addr = format!("{}:{}", host, port);
        let connect_err = |source| ClientError::Connect {
            addr: addr.clone(),
            source,
        };

        let mut last_err = io::Error::new(io::ErrorKind::NotFound, "no addresses resolved");
        for candidate in (host, port).to_socket_addrs().map_err(connect_err)? {
            match TcpStream::connect_timeout(&candidate, connect_timeout) {
                Ok(stream) => {
                    info!("Connected to {}", candidate);
                    return Ok(Self::new(stream, classifier, console));
                }
                Err(e) => last_err = e,
            }
        }
        Err(connect_err(last_err))
    }
}

impl<T: Transport> Client<T> {
    pub fn new(transport: T, classifier: Classifier, console: Console) -> Self {
        Self {
            transport,
            buffer: Vec::new(),
            classifier,
            console,
            command_timeout: None,
        }
    }

    /// Timeout used by the command helpers; `None` waits forever
    pub fn with_command_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.command_timeout = timeout;
        self
    }

    pub fn command_timeout(&self) -> Option<Duration> {
        self.command_timeout
    }

    pub fn console(&mut self) -> &mut Console {
        &mut self.console
    }

    #[cfg(test)]
    pub(crate) fn transport(&self) -> &T {
        &self.transport
    }

    /// Send `command` and wait for its response.
    ///
    /// `timeout` bounds every individual receive; `None` blocks until the
    /// prompt arrives. On failure or timeout the partial body is discarded.
    pub fn execute(&mut self, command: &str, timeout: Option<Duration>) -> Result<String> {
        debug!("Executing: {}", command);
        self.transport.set_timeout(timeout)?;

        let mut line = String::with_capacity(command.len() + 1);
        line.push_str(command);
        line.push('\r');
        self.transport.write_all(line.as_bytes())?;
        self.transport.flush()?;

        let mut transaction = Transaction::new(command);
        loop {
            let raw = self
                .next_line()?
                .ok_or_else(|| ClientError::CommandTimeout {
                    command: command.to_string(),
                })?;
            let text = String::from_utf8_lossy(&raw);
            let kind = self.classifier.classify(&text);
            self.console.line(kind, &text);

            if transaction.accept(&raw, &text, kind) {
                return transaction.finish();
            }
        }
    }

    /// Next complete line, the bare prompt, or `None` on receive timeout.
    fn next_line(&mut self) -> Result<Option<Vec<u8>>> {
        let mut chunk = [0u8; RECV_SIZE];
        loop {
            if self.buffer == PROMPT {
                self.buffer.clear();
                return Ok(Some(PROMPT.to_vec()));
            }

            if let Some(pos) = self.buffer.iter().position(|&b| b == b'\n') {
                let rest = self.buffer.split_off(pos + 1);
                return Ok(Some(std::mem::replace(&mut self.buffer, rest)));
            }

            match self.transport.read(&mut chunk) {
                Ok(0) => return Err(ClientError::ConnectionClosed),
                Ok(n) => self.buffer.extend_from_slice(&chunk[..n]),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e)
                    if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) =>
                {
                    return Ok(None)
                }
                Err(e) => return Err(e.into()),
            }
        }
    }
}
