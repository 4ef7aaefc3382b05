//! Output stream handle
//!
//! Mirror of the input side for writable files. Output streams additionally
//! carry a truncatable flag, start at the offset reported by the open RPC
//! (append-mode opens resume mid-file), and keep the closing tag the daemon
//! returns on a successful close so callers can detect concurrent
//! modification on their next open.

use crate::cancel::CancelToken;
use crate::error::StreamError;
use crate::machine::ops::{Operation, SeekOrigin};
use crate::machine::StreamCore;
use crate::protocol::MAX_TRANSFER;
use crate::stream::{finish_op_async, finish_op_sync, reject_op, run_async, run_sync, start_op};
use crate::transport::{AsyncTransport, Transport};
use crate::Result;

/// Writable stream served by the mount daemon.
pub struct FileOutputStream<T> {
    core: StreamCore,
    transport: T,
}

impl<T> FileOutputStream<T> {
    /// Take ownership of an opened per-file channel. The flags and the
    /// initial offset come from the open reply of the RPC layer.
    pub fn new(transport: T, seekable: bool, truncatable: bool, initial_offset: u64) -> Self {
        FileOutputStream {
            core: StreamCore::new_output(seekable, truncatable, initial_offset),
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

    pub fn can_truncate(&self) -> bool {
        self.core.truncatable
    }

    pub fn is_closed(&self) -> bool {
        self.core.closed
    }

    /// Tag captured from the daemon's `closed` reply, present after a
    /// successful close when the backend versions file content.
    pub fn closing_tag(&self) -> Option<&[u8]> {
        self.core.closing_tag.as_deref()
    }
}

impl<T: Transport> FileOutputStream<T> {
    /// Write `data` at the current offset. Returns the number of bytes the
    /// daemon accepted; at most [`MAX_TRANSFER`] bytes move per call.
    pub fn write(&mut self, data: &[u8], token: &CancelToken) -> Result<usize> {
        start_op(&mut self.core)?;
        if token.is_cancelled() {
            return reject_op(&mut self.core, StreamError::Cancelled);
        }

        let limit = data.len().min(MAX_TRANSFER);
        let mut op = Operation::write(&data[..limit]);
        let result = run_sync(&mut self.core, &mut self.transport, token, &mut op);
        finish_op_sync(&mut self.core, &mut self.transport, &result);

        let n = result?.into_transferred();
        self.core.offset += n as u64;
        Ok(n)
    }

    /// Reposition the stream. Returns the daemon-confirmed absolute offset.
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

    /// Cut the file to `size` bytes.
    pub fn truncate(&mut self, size: u64, token: &CancelToken) -> Result<()> {
        start_op(&mut self.core)?;
        if !self.core.truncatable {
            return reject_op(&mut self.core, StreamError::NotSupported("truncate"));
        }
        if token.is_cancelled() {
            return reject_op(&mut self.core, StreamError::Cancelled);
        }

        let mut op = Operation::truncate(size);
        let result = run_sync(&mut self.core, &mut self.transport, token, &mut op);
        finish_op_sync(&mut self.core, &mut self.transport, &result);

        result?;
        Ok(())
    }

    /// Fetch attributes of the live stream without closing it.
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

    /// Close the stream. One full round trip guarantees the daemon flushed
    /// the writes; the `closed` reply's payload, if any, becomes the
    /// closing tag. The channel is torn down even when the exchange fails;
    /// the first error wins.
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

impl<T: AsyncTransport> FileOutputStream<T> {
    /// Asynchronous twin of [`write`](FileOutputStream::write).
    pub async fn write_async(&mut self, data: &[u8], token: &CancelToken) -> Result<usize> {
        start_op(&mut self.core)?;
        if token.is_cancelled() {
            return reject_op(&mut self.core, StreamError::Cancelled);
        }

        let limit = data.len().min(MAX_TRANSFER);
        let mut op = Operation::write(&data[..limit]);
        let result = run_async(&mut self.core, &mut self.transport, token, &mut op).await;
        finish_op_async(&mut self.core, &mut self.transport, &result).await;

        let n = result?.into_transferred();
        self.core.offset += n as u64;
        Ok(n)
    }

    /// Asynchronous twin of [`seek`](FileOutputStream::seek).
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

    /// Asynchronous twin of [`truncate`](FileOutputStream::truncate).
    pub async fn truncate_async(&mut self, size: u64, token: &CancelToken) -> Result<()> {
        start_op(&mut self.core)?;
        if !self.core.truncatable {
            return reject_op(&mut self.core, StreamError::NotSupported("truncate"));
        }
        if token.is_cancelled() {
            return reject_op(&mut self.core, StreamError::Cancelled);
        }

        let mut op = Operation::truncate(size);
        let result = run_async(&mut self.core, &mut self.transport, token, &mut op).await;
        finish_op_async(&mut self.core, &mut self.transport, &result).await;

        result?;
        Ok(())
    }

    /// Asynchronous twin of [`query_info`](FileOutputStream::query_info).
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

    /// Asynchronous twin of [`close`](FileOutputStream::close).
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{Opcode, ReplyType, REQUEST_HEADER_SIZE};
    use crate::stream::testdaemon;
    use crate::transport::mock::MockTransport;

    fn header_at(bytes: &[u8], offset: usize) -> (u32, u32, u32, u32, u32) {
        let frame = &bytes[offset..offset + REQUEST_HEADER_SIZE];
        let word = |o: usize| u32::from_be_bytes([frame[o], frame[o + 1], frame[o + 2], frame[o + 3]]);
        (word(0), word(4), word(8), word(12), word(16))
    }

    #[test]
    fn test_write_then_close_captures_closing_tag() {
        let mock = MockTransport::new();
        mock.script_reply(ReplyType::Written, 1, 2, 0);
        mock.script_reply(ReplyType::Closed, 2, 0, 9);
        mock.script_bytes(b"v1-abcdef");
        let mut stream = FileOutputStream::new(mock.clone(), true, false, 0);
        let token = CancelToken::new();

        assert_eq!(stream.write(b"Hi", &token).unwrap(), 2);
        assert_eq!(stream.tell(), 2);

        stream.close(&token).unwrap();
        assert_eq!(stream.closing_tag(), Some(&b"v1-abcdef"[..]));

        let sent = mock.sent_bytes();
        let (opcode, seq, arg1, _, payload_len) = header_at(&sent, 0);
        assert_eq!(opcode, Opcode::Write as u32);
        assert_eq!(seq, 1);
        assert_eq!(arg1, 2);
        assert_eq!(payload_len, 2);
        assert_eq!(&sent[REQUEST_HEADER_SIZE..REQUEST_HEADER_SIZE + 2], b"Hi");

        let (opcode, seq, _, _, _) = header_at(&sent, REQUEST_HEADER_SIZE + 2);
        assert_eq!(opcode, Opcode::Close as u32);
        assert_eq!(seq, 2);
    }

    #[test]
    fn test_write_payload_rides_partial_sends() {
        let mock = MockTransport::new();
        mock.set_chunk_limit(7);
        mock.script_reply(ReplyType::Written, 1, 11, 0);
        let mut stream = FileOutputStream::new(mock.clone(), false, false, 0);

        assert_eq!(stream.write(b"hello there", &CancelToken::new()).unwrap(), 11);

        let sent = mock.sent_bytes();
        assert_eq!(sent.len(), REQUEST_HEADER_SIZE + 11);
        assert_eq!(&sent[REQUEST_HEADER_SIZE..], b"hello there");
    }

    #[test]
    fn test_truncate_requires_capability() {
        let mock = MockTransport::new();
        let mut stream = FileOutputStream::new(mock.clone(), true, false, 0);

        assert!(!stream.can_truncate());
        match stream.truncate(0, &CancelToken::new()) {
            Err(StreamError::NotSupported(what)) => assert_eq!(what, "truncate"),
            other => panic!("expected not-supported, got {:?}", other),
        }
        assert!(mock.sent_bytes().is_empty());
    }

    #[test]
    fn test_truncate_encodes_size_words() {
        let mock = MockTransport::new();
        mock.script_reply(ReplyType::Truncated, 1, 0, 0);
        let mut stream = FileOutputStream::new(mock.clone(), true, true, 0);

        let size = 0x0000_0001_8000_0000u64;
        stream.truncate(size, &CancelToken::new()).unwrap();

        let (opcode, _, arg1, arg2, _) = header_at(&mock.sent_bytes(), 0);
        assert_eq!(opcode, Opcode::Truncate as u32);
        assert_eq!(arg1, size as u32);
        assert_eq!(arg2, (size >> 32) as u32);
    }

    #[test]
    fn test_initial_offset_positions_appends() {
        let mock = MockTransport::new();
        mock.script_reply(ReplyType::Written, 1, 3, 0);
        let mut stream = FileOutputStream::new(mock, true, false, 4096);

        assert_eq!(stream.tell(), 4096);
        stream.write(b"end", &CancelToken::new()).unwrap();
        assert_eq!(stream.tell(), 4099);
    }

    #[test]
    fn test_seek_updates_offset_from_reply() {
        let mock = MockTransport::new();
        mock.script_reply(ReplyType::SeekPos, 1, 128, 0);
        let mut stream = FileOutputStream::new(mock, true, false, 0);

        let pos = stream.seek(128, SeekOrigin::Start, &CancelToken::new()).unwrap();
        assert_eq!(pos, 128);
        assert_eq!(stream.tell(), 128);
    }

    #[test]
    fn test_write_remote_error_keeps_stream_usable() {
        let mock = MockTransport::new();
        mock.script_error(1, 28, "vfs-error", "no space left");
        let mut stream = FileOutputStream::new(mock.clone(), true, false, 0);

        match stream.write(b"data", &CancelToken::new()) {
            Err(StreamError::Remote { code, .. }) => assert_eq!(code, 28),
            other => panic!("expected remote error, got {:?}", other),
        }
        assert!(!stream.is_closed());
        assert_eq!(stream.tell(), 0);

        mock.script_reply(ReplyType::Written, 2, 4, 0);
        assert_eq!(stream.write(b"data", &CancelToken::new()).unwrap(), 4);
    }

    #[test]
    fn test_cancelled_write_reports_cancellation_not_server_error() {
        let mock = MockTransport::new();
        let token = CancelToken::new();
        let payload = vec![1u8; 64];
        // Token fires once the whole frame is out; the daemon answers the
        // cancel with an error reply for the write's sequence number.
        mock.cancel_after_sent(REQUEST_HEADER_SIZE + 64, token.clone());
        mock.script_error(1, 19, "vfs-error", "operation was cancelled");
        let mut stream = FileOutputStream::new(mock.clone(), true, false, 0);

        match stream.write(&payload, &token) {
            Err(StreamError::Cancelled) => {}
            other => panic!("expected cancellation, got {:?}", other),
        }

        // A cancel frame followed the write on the wire.
        let sent = mock.sent_bytes();
        let (opcode, seq, arg1, _, _) = header_at(&sent, REQUEST_HEADER_SIZE + 64);
        assert_eq!(opcode, Opcode::Cancel as u32);
        assert_eq!(seq, 2);
        assert_eq!(arg1, 1);

        assert!(!stream.is_closed());
        assert_eq!(stream.tell(), 0);
    }

    #[test]
    fn test_query_info_on_output_drains_interleaved_data() {
        let mock = MockTransport::new();
        mock.script_data_chunk(1, 0, &[b'd'; 24]);
        mock.script_reply(ReplyType::Info, 1, 0, 2);
        mock.script_bytes(b"sz");
        let mut stream = FileOutputStream::new(mock.clone(), true, false, 0);

        let info = stream.query_info("*", &CancelToken::new()).unwrap();
        assert_eq!(info, b"sz");
        assert_eq!(mock.unread_script_len(), 0);
    }

    #[test]
    fn test_closed_stream_wins_over_capability_and_token_checks() {
        let mock = MockTransport::new();
        mock.script_reply(ReplyType::Closed, 1, 0, 0);
        let mut stream = FileOutputStream::new(mock, false, false, 0);
        stream.close(&CancelToken::new()).unwrap();

        let fired = CancelToken::new();
        fired.cancel();

        match stream.write(b"x", &fired) {
            Err(StreamError::Closed) => {}
            other => panic!("expected closed, got {:?}", other),
        }
        match stream.seek(0, SeekOrigin::Start, &CancelToken::new()) {
            Err(StreamError::Closed) => {}
            other => panic!("expected closed, got {:?}", other),
        }
        match stream.truncate(0, &CancelToken::new()) {
            Err(StreamError::Closed) => {}
            other => panic!("expected closed, got {:?}", other),
        }
        match stream.query_info("*", &fired) {
            Err(StreamError::Closed) => {}
            other => panic!("expected closed, got {:?}", other),
        }
    }

    #[test]
    fn test_daemon_write_roundtrip() -> anyhow::Result<()> {
        let (sock, daemon) = testdaemon::spawn(Vec::new());
        let mut stream = FileOutputStream::new(sock, true, true, 0);
        let token = CancelToken::new();

        assert_eq!(stream.write(b"Hi", &token)?, 2);
        assert_eq!(stream.tell(), 2);

        // A stat on the live stream sees the write flushed.
        let info = stream.query_info("standard::size", &token)?;
        assert_eq!(info, testdaemon::INFO_RECORD);

        stream.truncate(1, &token)?;

        stream.close(&token)?;
        assert_eq!(stream.closing_tag(), Some(testdaemon::CLOSING_TAG));
        daemon.join().unwrap();
        Ok(())
    }

    #[tokio::test]
    async fn test_async_daemon_write_roundtrip() -> anyhow::Result<()> {
        let (sock, daemon) = testdaemon::spawn(Vec::new());
        sock.set_nonblocking(true)?;
        let sock = tokio::net::UnixStream::from_std(sock)?;
        let mut stream = FileOutputStream::new(sock, true, false, 0);
        let token = CancelToken::new();

        assert_eq!(stream.write_async(b"async bytes", &token).await?, 11);
        assert_eq!(stream.seek_async(0, SeekOrigin::Start, &token).await?, 0);
        assert_eq!(stream.write_async(b"A", &token).await?, 1);

        stream.close_async(&token).await?;
        assert_eq!(stream.closing_tag(), Some(testdaemon::CLOSING_TAG));
        daemon.join().unwrap();
        Ok(())
    }
}
