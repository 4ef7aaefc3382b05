//! Stream drivers and handles
//!
//! Two drivers wrap the state machine: [`run_sync`] performs each emitted
//! I/O action inline against a blocking [`Transport`]; [`run_async`]
//! submits it to an [`AsyncTransport`] and suspends until completion. The
//! transition logic is the same code in both modes; only the scheduling of
//! primitives differs.
//!
//! The public handles live in [`input`] and [`output`]. Before any
//! operation starts the driver enforces the stream lifecycle: a closed
//! stream fails `Closed`, a stream with an operation in flight fails
//! `OperationPending`, and a fatal protocol error closes the channel and
//! latches the stream closed.

use log::debug;

use crate::cancel::CancelToken;
use crate::error::StreamError;
use crate::machine::ops::{step, Operation};
use crate::machine::{fatal_eos, IoAction, IoFeedback, OpOutput, Step, StreamCore, SKIP_CHUNK};
use crate::transport::{AsyncTransport, Transport};
use crate::Result;

pub mod input;
pub mod output;

/// Drive one operation to its terminal result over a blocking transport.
pub(crate) fn run_sync<T: Transport>(
    core: &mut StreamCore,
    transport: &mut T,
    token: &CancelToken,
    op: &mut Operation<'_>,
) -> Result<OpOutput> {
    let mut io = IoFeedback::default();
    loop {
        io.cancel_requested = token.is_cancelled();
        match step(core, op, &mut io) {
            Step::Done(result) => return result,
            Step::Io(action) => io = perform_sync(core, transport, token, op, action)?,
        }
    }
}

/// Drive one operation to its terminal result over an async transport.
/// Identical loop; every primitive is a suspension point.
pub(crate) async fn run_async<T: AsyncTransport>(
    core: &mut StreamCore,
    transport: &mut T,
    token: &CancelToken,
    op: &mut Operation<'_>,
) -> Result<OpOutput> {
    let mut io = IoFeedback::default();
    loop {
        io.cancel_requested = token.is_cancelled();
        match step(core, op, &mut io) {
            Step::Done(result) => return result,
            Step::Io(action) => io = perform_async(core, transport, token, op, action).await?,
        }
    }
}

/// A cancellable primitive that observed a fired token reports
/// `io_cancelled` without doing any work.
fn cancelled_feedback() -> IoFeedback {
    IoFeedback {
        res: 0,
        io_cancelled: true,
        cancel_requested: true,
    }
}

fn done(res: usize) -> IoFeedback {
    IoFeedback {
        res,
        io_cancelled: false,
        cancel_requested: false,
    }
}

fn perform_sync<T: Transport>(
    core: &mut StreamCore,
    transport: &mut T,
    token: &CancelToken,
    op: &mut Operation<'_>,
    action: IoAction,
) -> Result<IoFeedback> {
    match action {
        IoAction::Send { cancellable } => {
            if cancellable && token.is_cancelled() {
                return Ok(cancelled_feedback());
            }
            let sent = transport.send(&core.outbound).map_err(StreamError::io)?;
            if sent == 0 && !core.outbound.is_empty() {
                return Err(fatal_eos());
            }
            Ok(done(sent))
        }
        IoAction::Fill { want, cancellable } => {
            if cancellable && token.is_cancelled() {
                return Ok(cancelled_feedback());
            }
            let start = core.fill_window(want);
            let result = transport.recv(&mut core.inbound[start..]);
            let got = *result.as_ref().unwrap_or(&0);
            core.fill_done(start, got);
            let got = result.map_err(StreamError::io)?;
            if got == 0 && want > 0 {
                return Err(fatal_eos());
            }
            Ok(done(got))
        }
        IoAction::Deliver { max, cancellable } => {
            if cancellable && token.is_cancelled() {
                return Ok(cancelled_feedback());
            }
            let buf = op.deliver_slice(max);
            let want = buf.len();
            let got = transport.recv(buf).map_err(StreamError::io)?;
            if got == 0 && want > 0 {
                return Err(fatal_eos());
            }
            Ok(done(got))
        }
        IoAction::Capture { max } => {
            let mut scratch = [0u8; SKIP_CHUNK];
            let want = max.min(SKIP_CHUNK);
            let got = transport
                .recv(&mut scratch[..want])
                .map_err(StreamError::io)?;
            if got == 0 && want > 0 {
                return Err(fatal_eos());
            }
            op.capture_extend(&scratch[..got]);
            Ok(done(got))
        }
        IoAction::Drain { max, cancellable } => {
            if cancellable && token.is_cancelled() {
                return Ok(cancelled_feedback());
            }
            let mut scratch = [0u8; SKIP_CHUNK];
            let want = max.min(SKIP_CHUNK);
            let got = transport
                .recv(&mut scratch[..want])
                .map_err(StreamError::io)?;
            if got == 0 && want > 0 {
                return Err(fatal_eos());
            }
            Ok(done(got))
        }
    }
}

async fn perform_async<T: AsyncTransport>(
    core: &mut StreamCore,
    transport: &mut T,
    token: &CancelToken,
    op: &mut Operation<'_>,
    action: IoAction,
) -> Result<IoFeedback> {
    match action {
        IoAction::Send { cancellable } => {
            if cancellable && token.is_cancelled() {
                return Ok(cancelled_feedback());
            }
            let sent = transport.send(&core.outbound).await.map_err(StreamError::io)?;
            if sent == 0 && !core.outbound.is_empty() {
                return Err(fatal_eos());
            }
            Ok(done(sent))
        }
        IoAction::Fill { want, cancellable } => {
            if cancellable && token.is_cancelled() {
                return Ok(cancelled_feedback());
            }
            let start = core.fill_window(want);
            let result = transport.recv(&mut core.inbound[start..]).await;
            let got = *result.as_ref().unwrap_or(&0);
            core.fill_done(start, got);
            let got = result.map_err(StreamError::io)?;
            if got == 0 && want > 0 {
                return Err(fatal_eos());
            }
            Ok(done(got))
        }
        IoAction::Deliver { max, cancellable } => {
            if cancellable && token.is_cancelled() {
                return Ok(cancelled_feedback());
            }
            let buf = op.deliver_slice(max);
            let want = buf.len();
            let got = transport.recv(buf).await.map_err(StreamError::io)?;
            if got == 0 && want > 0 {
                return Err(fatal_eos());
            }
            Ok(done(got))
        }
        IoAction::Capture { max } => {
            let mut scratch = [0u8; SKIP_CHUNK];
            let want = max.min(SKIP_CHUNK);
            let got = transport
                .recv(&mut scratch[..want])
                .await
                .map_err(StreamError::io)?;
            if got == 0 && want > 0 {
                return Err(fatal_eos());
            }
            op.capture_extend(&scratch[..got]);
            Ok(done(got))
        }
        IoAction::Drain { max, cancellable } => {
            if cancellable && token.is_cancelled() {
                return Ok(cancelled_feedback());
            }
            let mut scratch = [0u8; SKIP_CHUNK];
            let want = max.min(SKIP_CHUNK);
            let got = transport
                .recv(&mut scratch[..want])
                .await
                .map_err(StreamError::io)?;
            if got == 0 && want > 0 {
                return Err(fatal_eos());
            }
            Ok(done(got))
        }
    }
}

/// Gate an operation on the stream lifecycle and mark it in flight. The
/// closed and pending checks come first: they outrank every other failure,
/// including a pre-fired cancellation token and capability checks.
pub(crate) fn start_op(core: &mut StreamCore) -> Result<()> {
    if core.closed {
        return Err(StreamError::Closed);
    }
    if core.pending {
        return Err(StreamError::OperationPending);
    }
    core.pending = true;
    Ok(())
}

/// Reject an operation that passed the lifecycle gate but failed a
/// pre-flight check, releasing the in-flight mark without touching the
/// channel.
pub(crate) fn reject_op<T>(core: &mut StreamCore, err: StreamError) -> Result<T> {
    core.pending = false;
    Err(err)
}

/// Release the in-flight mark and, on a fatal error, latch the stream
/// closed and tear the channel down.
pub(crate) fn finish_op_sync<T: Transport>(
    core: &mut StreamCore,
    transport: &mut T,
    result: &Result<OpOutput>,
) {
    core.pending = false;
    if let Err(err) = result {
        if err.is_fatal() {
            debug!("stream closed after fatal error: {}", err);
            core.closed = true;
            let _ = transport.shutdown();
        }
    }
}

pub(crate) async fn finish_op_async<T: AsyncTransport>(
    core: &mut StreamCore,
    transport: &mut T,
    result: &Result<OpOutput>,
) {
    core.pending = false;
    if let Err(err) = result {
        if err.is_fatal() {
            debug!("stream closed after fatal error: {}", err);
            core.closed = true;
            let _ = transport.shutdown().await;
        }
    }
}
