//! Session buffer
//!
//! Accumulates child output until a consumer takes it. The bytes are owned by
//! a single actor thread; every handle talks to it over a channel, so reads
//! and appends are serialized without a shared lock.

use std::io;
use std::sync::mpsc::{self, Receiver, Sender};
use std::thread;

enum Request {
    Append(Vec<u8>),
    TakeAll(Sender<Vec<u8>>),
    TakeLine(Sender<Vec<u8>>),
}

/// Cloneable handle to the buffer actor.
///
/// The actor exits once the last handle is dropped.
#[derive(Clone)]
pub struct SessionBuffer {
    tx: Sender<Request>,
}

impl SessionBuffer {
    /// Spawn the actor and return a handle to it
    pub fn spawn() -> io::Result<Self> {
        let (tx, rx) = mpsc::channel();
        thread::Builder::new()
            .name("session-buffer".to_string())
            .spawn(move || run_actor(rx))?;
        Ok(Self { tx })
    }

    /// Append bytes at the end of the buffer
    pub fn append(&self, bytes: &[u8]) {
        if bytes.is_empty() {
            return;
        }
        let _ = self.tx.send(Request::Append(bytes.to_vec()));
    }

    /// Take every pending byte and clear the buffer
    pub fn take_all(&self) -> Vec<u8> {
        self.request(Request::TakeAll)
    }

    /// Take one newline-terminated line, or nothing if no full line is pending
    pub fn take_line(&self) -> Vec<u8> {
        self.request(Request::TakeLine)
    }

    fn request(&self, make: fn(Sender<Vec<u8>>) -> Request) -> Vec<u8> {
        let (reply_tx, reply_rx) = mpsc::channel();
        if self.tx.send(make(reply_tx)).is_err() {
            return Vec::new();
        }
        reply_rx.recv().unwrap_or_default()
    }
}

fn run_actor(rx: Receiver<Request>) {
    let mut buffer: Vec<u8> = Vec::new();

    for request in rx {
        match request {
            Request::Append(bytes) => buffer.extend_from_slice(&bytes),
            Request::TakeAll(reply) => {
                let _ = reply.send(std::mem::take(&mut buffer));
            }
            Request::TakeLine(reply) => {
                let _ = reply.send(split_line(&mut buffer));
            }
        }
    }
}

/// Remove and return the bytes through the first `\n`, if there is one.
fn split_line(buffer: &mut Vec<u8>) -> Vec<u8> {
    match buffer.iter().position(|&b| b == b'\n') {
        Some(pos) => {
            let rest = buffer.split_off(pos + 1);
            std::mem::replace(buffer, rest)
        }
        None => Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_take_all_returns_concatenation() {
        let buffer = SessionBuffer::spawn().unwrap();
        buffer.append(b"abc");
        buffer.append(b"");
        buffer.append(b"\r\ndef");

        assert_eq!(buffer.take_all(), b"abc\r\ndef".to_vec());
        assert!(buffer.take_all().is_empty());
    }

    #[test]
    fn test_take_line_requires_newline() {
        let buffer = SessionBuffer::spawn().unwrap();
        buffer.append(b"partial");
        assert!(buffer.take_line().is_empty());

        // Nothing was consumed by the failed attempt.
        buffer.append(b" line\nnext\n");
        assert_eq!(buffer.take_line(), b"partial line\n".to_vec());
        assert_eq!(buffer.take_line(), b"next\n".to_vec());
        assert!(buffer.take_line().is_empty());
        assert!(buffer.take_all().is_empty());
    }

    #[test]
    fn test_take_line_stops_at_first_newline() {
        let buffer = SessionBuffer::spawn().unwrap();
        buffer.append(b"one\ntwo\nthree");

        assert_eq!(buffer.take_line(), b"one\n".to_vec());
        assert_eq!(buffer.take_all(), b"two\nthree".to_vec());
    }

    #[test]
    fn test_handles_share_one_buffer() {
        let writer = SessionBuffer::spawn().unwrap();
        let reader = writer.clone();

        let handle = std::thread::spawn(move || {
            for i in 0..100u8 {
                writer.append(&[i]);
            }
        });
        handle.join().unwrap();

        let bytes = reader.take_all();
        assert_eq!(bytes, (0..100u8).collect::<Vec<_>>());
    }
}
