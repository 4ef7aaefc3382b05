//! Scripted transport for testing
//!
//! An in-memory stand-in for the daemon socket. Tests preload the bytes the
//! "daemon" will send (reply headers and payloads), run stream operations
//! against it, then inspect every byte the engine put on the wire.
//!
//! State lives behind an `Arc`, so a test keeps a clone as an inspection
//! handle after moving the transport into a stream.
//!
//! # Behaviour knobs
//!
//! - `set_chunk_limit` caps how many bytes a single `send`/`recv` moves,
//!   simulating partial transfers and short header reads.
//! - `fail_next_recv` / `fail_next_send` inject one transport failure.
//! - `cancel_after_sent` fires a [`CancelToken`] once the engine has put a
//!   given number of bytes on the wire, for deterministic mid-operation
//!   cancellation.
//! - `park_on_empty` makes an exhausted script suspend (async) instead of
//!   failing, for tests that need an operation caught permanently in
//!   flight.

use std::collections::VecDeque;
use std::io;
use std::sync::{Arc, Mutex};

use crate::cancel::CancelToken;
use crate::protocol::{ReplyType, REPLY_HEADER_SIZE};
use crate::transport::{AsyncTransport, Transport};

#[derive(Default)]
struct MockState {
    incoming: VecDeque<u8>,
    sent: Vec<u8>,
    chunk_limit: usize,
    fail_next_send: Option<String>,
    fail_next_recv: Option<String>,
    cancel_after_sent: Option<(usize, CancelToken)>,
    park_on_empty: bool,
    shutdown_count: u32,
}

/// Scripted duplex channel implementing both transport traits.
#[derive(Clone, Default)]
pub struct MockTransport {
    state: Arc<Mutex<MockState>>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a reply header to the incoming script.
    pub fn script_reply(&self, reply_type: ReplyType, seq: u32, arg1: u32, arg2: u32) {
        let mut header = [0u8; REPLY_HEADER_SIZE];
        header[0..4].copy_from_slice(&(reply_type as u32).to_be_bytes());
        header[4..8].copy_from_slice(&seq.to_be_bytes());
        header[8..12].copy_from_slice(&arg1.to_be_bytes());
        header[12..16].copy_from_slice(&arg2.to_be_bytes());
        self.script_bytes(&header);
    }

    /// Append raw payload bytes to the incoming script.
    pub fn script_bytes(&self, bytes: &[u8]) {
        self.state.lock().unwrap().incoming.extend(bytes.iter().copied());
    }

    /// Append a complete `data-chunk` reply: header plus content, stamped
    /// with the given seek generation.
    pub fn script_data_chunk(&self, seq: u32, generation: u32, data: &[u8]) {
        self.script_reply(ReplyType::Data, seq, data.len() as u32, generation);
        self.script_bytes(data);
    }

    /// Append a complete `error` reply for `seq`.
    pub fn script_error(&self, seq: u32, code: u32, domain: &str, message: &str) {
        let mut payload = Vec::with_capacity(domain.len() + message.len() + 2);
        payload.extend_from_slice(domain.as_bytes());
        payload.push(0);
        payload.extend_from_slice(message.as_bytes());
        payload.push(0);
        self.script_reply(ReplyType::Error, seq, code, payload.len() as u32);
        self.script_bytes(&payload);
    }

    /// Cap the number of bytes moved per `send`/`recv` call. Zero means
    /// unlimited.
    pub fn set_chunk_limit(&self, limit: usize) {
        self.state.lock().unwrap().chunk_limit = limit;
    }

    /// Fail the next `send` with the given message.
    pub fn fail_next_send(&self, message: &str) {
        self.state.lock().unwrap().fail_next_send = Some(message.to_string());
    }

    /// Fail the next `recv` with the given message.
    pub fn fail_next_recv(&self, message: &str) {
        self.state.lock().unwrap().fail_next_recv = Some(message.to_string());
    }

    /// Fire `token` as soon as the cumulative sent byte count reaches
    /// `threshold`.
    pub fn cancel_after_sent(&self, threshold: usize, token: CancelToken) {
        self.state.lock().unwrap().cancel_after_sent = Some((threshold, token));
    }

    /// Make an exhausted incoming script suspend forever under the async
    /// transport instead of erroring.
    pub fn park_on_empty(&self) {
        self.state.lock().unwrap().park_on_empty = true;
    }

    /// Every byte the engine has sent, in order.
    pub fn sent_bytes(&self) -> Vec<u8> {
        self.state.lock().unwrap().sent.clone()
    }

    /// Bytes of the incoming script not yet consumed by the engine.
    pub fn unread_script_len(&self) -> usize {
        self.state.lock().unwrap().incoming.len()
    }

    /// How many times the channel was shut down.
    pub fn shutdown_count(&self) -> u32 {
        self.state.lock().unwrap().shutdown_count
    }

    fn do_send(&self, buf: &[u8]) -> io::Result<usize> {
        let mut state = self.state.lock().unwrap();

        if let Some(message) = state.fail_next_send.take() {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, message));
        }

        let n = match state.chunk_limit {
            0 => buf.len(),
            limit => buf.len().min(limit),
        };
        state.sent.extend_from_slice(&buf[..n]);

        if let Some((threshold, token)) = &state.cancel_after_sent {
            if state.sent.len() >= *threshold {
                token.cancel();
                state.cancel_after_sent = None;
            }
        }

        Ok(n)
    }

    /// Move scripted bytes out, or report what to do on an empty script.
    fn do_recv(&self, buf: &mut [u8]) -> io::Result<Option<usize>> {
        let mut state = self.state.lock().unwrap();

        if let Some(message) = state.fail_next_recv.take() {
            return Err(io::Error::new(io::ErrorKind::ConnectionReset, message));
        }

        if buf.is_empty() {
            return Ok(Some(0));
        }
        if state.incoming.is_empty() {
            if state.park_on_empty {
                return Ok(None);
            }
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "mock transport script exhausted",
            ));
        }

        let mut n = buf.len().min(state.incoming.len());
        if state.chunk_limit > 0 {
            n = n.min(state.chunk_limit);
        }
        for slot in buf.iter_mut().take(n) {
            *slot = state.incoming.pop_front().unwrap();
        }
        Ok(Some(n))
    }

    fn do_shutdown(&self) -> io::Result<()> {
        self.state.lock().unwrap().shutdown_count += 1;
        Ok(())
    }
}

impl Transport for MockTransport {
    fn send(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.do_send(buf)
    }

    fn recv(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self.do_recv(buf)? {
            Some(n) => Ok(n),
            // A blocking transport has nothing to park on.
            None => Err(io::Error::new(
                io::ErrorKind::WouldBlock,
                "mock transport script exhausted",
            )),
        }
    }

    fn shutdown(&mut self) -> io::Result<()> {
        self.do_shutdown()
    }
}

impl AsyncTransport for MockTransport {
    async fn send(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.do_send(buf)
    }

    async fn recv(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self.do_recv(buf)? {
            Some(n) => Ok(n),
            None => std::future::pending().await,
        }
    }

    async fn shutdown(&mut self) -> io::Result<()> {
        self.do_shutdown()
    }
}
