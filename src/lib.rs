//! VFStream - client-side stream engine for a user-space VFS
//!
//! VFStream lets applications read and write files served by an
//! out-of-process mount daemon as if they were ordinary local streams. The
//! mount RPC layer opens a file and hands over a connected socket plus the
//! stream's capability flags; from there this crate translates every
//! read/write/seek/truncate/stat/close into the daemon's framed
//! request/reply protocol, reassembles replies arriving interleaved with
//! still-in-flight payload, and supports cancelling an operation at any
//! point.
//!
//! # Architecture
//!
//! - **`protocol`**: the wire codec - fixed big-endian headers, error
//!   payloads, payload length rules
//! - **`transport`**: blocking and async byte-channel primitives, plus a
//!   scripted mock for tests
//! - **`machine`**: one deterministic state machine per operation kind,
//!   shared by both execution modes
//! - **`stream`**: the drivers and the public `FileInputStream` /
//!   `FileOutputStream` handles
//!
//! # Example
//!
//! ```no_run
//! use vfstream::{CancelToken, FileInputStream, SeekOrigin};
//!
//! # fn open_from_mount_rpc() -> std::os::unix::net::UnixStream { unimplemented!() }
//! let socket = open_from_mount_rpc();
//! let mut stream = FileInputStream::new(socket, true);
//! let token = CancelToken::new();
//!
//! let mut buf = [0u8; 4096];
//! let n = stream.read(&mut buf, &token)?;
//! stream.seek(0, SeekOrigin::Start, &token)?;
//! stream.close(&token)?;
//! # Ok::<(), vfstream::StreamError>(())
//! ```

pub mod cancel;
pub mod error;
pub mod machine;
pub mod protocol;
pub mod stream;
pub mod transport;

// Re-export commonly used types
pub use cancel::CancelToken;
pub use error::StreamError;
pub use machine::ops::SeekOrigin;
pub use stream::input::FileInputStream;
pub use stream::output::FileOutputStream;
pub use transport::{AsyncTransport, Transport};

/// Result type used throughout VFStream
pub type Result<T> = std::result::Result<T, StreamError>;
