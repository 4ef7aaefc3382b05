//! Input stream handle
//!
//! A [`FileInputStream`] wraps the descriptor handed over by the mount RPC
//! layer and exposes ordinary stream operations over the daemon protocol.
//! Synchronous methods need a blocking [`Transport`]; the `_async` twins
//! need an [`AsyncTransport`]. Both run the same state machine.
//!
//! A stream is not thread-safe: every operation takes `&mut self` and the
//! engine serialises them. Independent streams can be driven in parallel.

use crate::cancel::CancelToken;
use crate::error::StreamError;
use crate::machine::ops::{Operation, SeekOrigin};
use crate::machine::StreamCore;
use crate::protocol::MAX_TRANSFER;
use crate::stream::{finish_op_async, finish_op_sync, reject_op, run_async, run_sync, start_op};
use crate::transport::{AsyncTransport, Transport};
use crate::Result;

/// Readable stream served by the mount daemon.
pub struct FileInputStream<T> {
    core: StreamCore,
    transport: T,
}

impl<T> FileInputStream<T> {
    /// Take ownership of an opened per-file channel. `seekable` comes from
    /// the open reply of the RPC layer.
    pub fn new(transport: T, seekable: bool) -> Self {
        FileInputStream {
            core: StreamCore::new_input(seekable),
            transport,
        }
    }

    /// Client-side view of the current byte offset.
    pub fn tell(&self) -> u64 {
        self.core.offset
    }

    pub fn can_seek(&self) -> bool {
        self.core.seekable
    }

    pub fn is_closed(&self) -> bool {
        self.core.closed
    }
}

impl<T: Transport> FileInputStream<T> {
    /// Read up to `buf.len()` bytes at the current offset. Returns the
    /// number of bytes delivered; `0` for a non-empty `buf` is orderly end
    /// of file. At most [`MAX_TRANSFER`] bytes move per call.
    pub fn read(&mut self, buf: &mut [u8], token: &CancelToken) -> Result<usize> {
        start_op(&mut self.core)?;
        if token.is_cancelled() {
            return reject_op(&mut self.core, StreamError::Cancelled);
        }

        let limit = buf.len().min(MAX_TRANSFER);
        let mut op = Operation::read(&mut buf[..limit]);
        let result = run_sync(&mut self.core, &mut self.transport, token, &mut op);
        finish_op_sync(&mut self.core, &mut self.transport, &result);

        let n = result?.into_transferred();
        self.core.offset += n as u64;
        Ok(n)
    }

    /// Reposition the stream. Returns the daemon-confirmed absolute offset,
    /// which becomes the new current offset.
    pub fn seek(&mut self, offset: i64, origin: SeekOrigin, token: &CancelToken) -> Result<u64> {
        start_op(&mut self.core)?;
        if !self.core.seekable {
            return reject_op(&mut self.core, StreamError::NotSupported("seek"));
        }
        if token.is_cancelled() {
            return reject_op(&mut self.core, StreamError::Cancelled);
        }

        let mut op = Operation::seek(offset, origin);
        let result = run_sync(&mut self.core, &mut self.transport, token, &mut op);
        finish_op_sync(&mut self.core, &mut self.transport, &result);

        let pos = result?.into_position();
        self.core.offset = pos;
        Ok(pos)
    }

    /// Fetch the attributes selected by `attributes` for the live stream,
    /// without closing it. The returned record is the serialised form
    /// produced by the daemon's metadata layer, passed through opaquely.
    pub fn query_info(&mut self, attributes: &str, token: &CancelToken) -> Result<Vec<u8>> {
        start_op(&mut self.core)?;
        if token.is_cancelled() {
            return reject_op(&mut self.core, StreamError::Cancelled);
        }

        let mut op = Operation::query_info(attributes);
        let result = run_sync(&mut self.core, &mut self.transport, token, &mut op);
        finish_op_sync(&mut self.core, &mut self.transport, &result);

        Ok(result?.into_info())
    }

    /// Close the stream: one full round trip with the daemon, then both
    /// halves of the channel are torn down. The channel is torn down even
    /// when the exchange fails; the first error wins. Closing an already
    /// closed stream succeeds without I/O.
    pub fn close(&mut self, token: &CancelToken) -> Result<()> {
        if self.core.closed {
            return Ok(());
        }
        start_op(&mut self.core)?;

        let mut op = Operation::close();
        let result = run_sync(&mut self.core, &mut self.transport, token, &mut op);
        self.core.pending = false;
        self.core.closed = true;

        let shutdown = self.transport.shutdown().map_err(StreamError::io);
        result?;
        shutdown?;
        Ok(())
    }
}

impl<T: AsyncTransport> FileInputStream<T> {
    /// Asynchronous twin of [`read`](FileInputStream::read).
    pub async fn read_async(&mut self, buf: &mut [u8], token: &CancelToken) -> Result<usize> {
        start_op(&mut self.core)?;
        if token.is_cancelled() {
            return reject_op(&mut self.core, StreamError::Cancelled);
        }

        let limit = buf.len().min(MAX_TRANSFER);
        let mut op = Operation::read(&mut buf[..limit]);
        let result = run_async(&mut self.core, &mut self.transport, token, &mut op).await;
        finish_op_async(&mut self.core, &mut self.transport, &result).await;

        let n = result?.into_transferred();
        self.core.offset += n as u64;
        Ok(n)
    }

    /// Asynchronous twin of [`seek`](FileInputStream::seek).
    pub async fn seek_async(
        &mut self,
        offset: i64,
        origin: SeekOrigin,
        token: &CancelToken,
    ) -> Result<u64> {
        start_op(&mut self.core)?;
        if !self.core.seekable {
            return reject_op(&mut self.core, StreamError::NotSupported("seek"));
        }
        if token.is_cancelled() {
            return reject_op(&mut self.core, StreamError::Cancelled);
        }

        let mut op = Operation::seek(offset, origin);
        let result = run_async(&mut self.core, &mut self.transport, token, &mut op).await;
        finish_op_async(&mut self.core, &mut self.transport, &result).await;

        let pos = result?.into_position();
        self.core.offset = pos;
        Ok(pos)
    }

    /// Asynchronous twin of [`query_info`](FileInputStream::query_info).
    pub async fn query_info_async(&mut self, attributes: &str, token: &CancelToken) -> Result<Vec<u8>> {
        start_op(&mut self.core)?;
        if token.is_cancelled() {
            return reject_op(&mut self.core, StreamError::Cancelled);
        }

        let mut op = Operation::query_info(attributes);
        let result = run_async(&mut self.core, &mut self.transport, token, &mut op).await;
        finish_op_async(&mut self.core, &mut self.transport, &result).await;

        Ok(result?.into_info())
    }

    /// Asynchronous twin of [`close`](FileInputStream::close).
    pub async fn close_async(&mut self, token: &CancelToken) -> Result<()> {
        if self.core.closed {
            return Ok(());
        }
        start_op(&mut self.core)?;

        let mut op = Operation::close();
        let result = run_async(&mut self.core, &mut self.transport, token, &mut op).await;
        self.core.pending = false;
        self.core.closed = true;

        let shutdown = self.transport.shutdown().await.map_err(StreamError::io);
        result?;
        shutdown?;
        Ok(())
    }
}
