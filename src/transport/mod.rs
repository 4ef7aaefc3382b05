//! Transport abstraction
//!
//! The state machine never touches a socket directly: it emits I/O actions
//! and the driver routes them through one of the traits below. This is what
//! lets the same transition function run under a blocking loop and under
//! the tokio runtime, and what lets tests substitute a scripted in-memory
//! transport for the daemon socket.
//!
//! # Contract
//!
//! - `send` and `recv` move *up to* the requested number of bytes and
//!   return the short count; the state machine owns the retry loop.
//! - `recv` returning 0 for a non-empty buffer means the peer closed the
//!   connection. The driver treats that as a fatal protocol error, never as
//!   a normal condition, because the daemon only closes after a `closed`
//!   reply.
//! - `shutdown` tears down both directions. It is called exactly once, on
//!   close or on a fatal error.
//!
//! # Ownership
//!
//! A transport is exclusively owned by one stream handle; the file
//! descriptor received from the mount RPC is transferred in at construction
//! and closed by the stream. Transports must be `Send` so a stream can move
//! between threads, but are never shared.

use std::io::{self, Read, Write};

pub mod mock;

/// Blocking byte-channel primitives for the synchronous driver.
pub trait Transport: Send {
    /// Write up to `buf.len()` bytes, returning how many were accepted.
    fn send(&mut self, buf: &[u8]) -> io::Result<usize>;

    /// Read up to `buf.len()` bytes, returning how many arrived. Zero with
    /// a non-empty `buf` means end of stream.
    fn recv(&mut self, buf: &mut [u8]) -> io::Result<usize>;

    /// Shut down both directions of the channel.
    fn shutdown(&mut self) -> io::Result<()>;
}

/// Non-blocking byte-channel primitives for the event-driven driver. Same
/// contract as [`Transport`], suspension instead of blocking.
pub trait AsyncTransport: Send {
    fn send(&mut self, buf: &[u8]) -> impl std::future::Future<Output = io::Result<usize>> + Send;

    fn recv(
        &mut self,
        buf: &mut [u8],
    ) -> impl std::future::Future<Output = io::Result<usize>> + Send;

    fn shutdown(&mut self) -> impl std::future::Future<Output = io::Result<()>> + Send;
}

impl Transport for std::os::unix::net::UnixStream {
    fn send(&mut self, buf: &[u8]) -> io::Result<usize> {
        loop {
            match Write::write(self, buf) {
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                res => return res,
            }
        }
    }

    fn recv(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            match Read::read(self, buf) {
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                res => return res,
            }
        }
    }

    fn shutdown(&mut self) -> io::Result<()> {
        match std::os::unix::net::UnixStream::shutdown(self, std::net::Shutdown::Both) {
            // The peer may already have dropped its end.
            Err(ref e) if e.kind() == io::ErrorKind::NotConnected => Ok(()),
            res => res,
        }
    }
}

impl AsyncTransport for tokio::net::UnixStream {
    async fn send(&mut self, buf: &[u8]) -> io::Result<usize> {
        tokio::io::AsyncWriteExt::write(self, buf).await
    }

    async fn recv(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        tokio::io::AsyncReadExt::read(self, buf).await
    }

    async fn shutdown(&mut self) -> io::Result<()> {
        match tokio::io::AsyncWriteExt::shutdown(self).await {
            Err(ref e) if e.kind() == io::ErrorKind::NotConnected => Ok(()),
            res => res,
        }
    }
}
