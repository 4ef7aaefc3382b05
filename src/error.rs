//! Stream error taxonomy
//!
//! Every public operation on a stream terminates with either its result or
//! one of the error kinds below. The taxonomy is closed: callers can match
//! exhaustively and decide whether the stream is still usable via
//! [`StreamError::is_fatal`].
//!
//! # Fatal vs recoverable
//!
//! Most failures leave the stream ready for the next operation (a cancelled
//! read, a rejected seek, a server-side error reply). Protocol failures do
//! not: once the byte stream is desynchronised or the socket is gone there
//! is no way to re-establish framing, so the stream is closed and every
//! later call fails with [`StreamError::Closed`].

use thiserror::Error;

/// Errors produced by stream operations.
#[derive(Debug, Error)]
pub enum StreamError {
    /// The caller's cancellation token fired while the operation was in
    /// flight.
    #[error("operation was cancelled")]
    Cancelled,

    /// The stream was already closed when the operation began, or a fatal
    /// error closed it.
    #[error("stream is closed")]
    Closed,

    /// A second operation was attempted while one was still in flight.
    #[error("another operation is pending on this stream")]
    OperationPending,

    /// Seek on a non-seekable stream, or truncate on a non-truncatable
    /// stream.
    #[error("{0} not supported on stream")]
    NotSupported(&'static str),

    /// A count or offset was out of range for the wire encoding.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The request/reply framing broke down: unexpected end of stream, an
    /// unknown reply type, a malformed payload, or a transport-level I/O
    /// failure. Terminal for the stream.
    #[error("error in stream protocol: {message}")]
    Protocol {
        message: String,
        #[source]
        source: Option<std::io::Error>,
    },

    /// The mount daemon answered with an error reply. Domain and code are
    /// passed through verbatim from the reply payload.
    #[error("remote error [{domain}: {code}]: {message}")]
    Remote {
        domain: String,
        code: u32,
        message: String,
    },
}

impl StreamError {
    /// Build a protocol error from a bare message.
    pub(crate) fn protocol(message: impl Into<String>) -> Self {
        StreamError::Protocol {
            message: message.into(),
            source: None,
        }
    }

    /// Build a protocol error wrapping a transport I/O failure.
    pub(crate) fn io(source: std::io::Error) -> Self {
        StreamError::Protocol {
            message: source.to_string(),
            source: Some(source),
        }
    }

    /// True when the error leaves the stream unusable. The driver reacts by
    /// closing the underlying channel and latching the stream closed.
    pub fn is_fatal(&self) -> bool {
        matches!(self, StreamError::Protocol { .. })
    }
}
