//! Operation records and the transition function
//!
//! Each user-visible operation is a tagged variant; one exhaustive `step`
//! function drives all of them through the shared state diagram:
//!
//! ```text
//! Init ──► SendRequest ──► HandleInput ──► ReadHeader ──► terminal
//!                              │  ▲                        reply
//!                              ▼  │
//!                   HandleBlock ──┴──► Deliver / Capture / Skip
//! ```
//!
//! `Init` frames the request onto the outbound buffer and allocates the
//! sequence number. `SendRequest` repeats until the buffer drains.
//! `HandleInput` is the cancellation point: if the token fired and no
//! cancel frame went out yet, one is appended and the send path re-enters.
//! `ReadHeader` assembles one reply and dispatches on its type; data chunks
//! switch the stream into block phase, where the operation decides whether
//! the payload is delivered (read, matching generation), captured as a
//! pre-read (query-info on an input stream), or drained (everything else).
//!
//! Cancellation before the first wire byte rewinds the request and reuses
//! the sequence number; after the first wire byte the operation stays in
//! the loop until the wire is clean again, so later operations never see a
//! half-consumed reply.

use log::trace;

use crate::error::StreamError;
use crate::machine::{
    InputPhase, IoAction, IoFeedback, OpOutput, PreRead, Step, StreamCore, SKIP_CHUNK,
};
use crate::protocol::{self, Opcode, ReplyType, REPLY_HEADER_SIZE, REQUEST_HEADER_SIZE};

/// Reference point of a seek.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeekOrigin {
    /// From the beginning of the file.
    Start,
    /// Relative to the stream's current offset, resolved client-side
    /// before the request is framed.
    Current,
    /// From the end of the file.
    End,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Init,
    SendRequest,
    HandleInput,
    HandleBlock,
    SkipBlock,
    CaptureBlock,
    DeliverBlock,
    ReadHeader,
}

pub(crate) enum OpKind<'a> {
    Read { buf: &'a mut [u8] },
    Write { data: &'a [u8] },
    Seek { offset: i64, origin: SeekOrigin },
    Truncate { size: u64 },
    Close,
    QueryInfo { attributes: &'a str, capture: Vec<u8> },
}

impl OpKind<'_> {
    fn name(&self) -> &'static str {
        match self {
            OpKind::Read { .. } => "read",
            OpKind::Write { .. } => "write",
            OpKind::Seek { .. } => "seek",
            OpKind::Truncate { .. } => "truncate",
            OpKind::Close => "close",
            OpKind::QueryInfo { .. } => "query-info",
        }
    }
}

/// One in-flight operation: caller inputs, substate, and wire bookkeeping.
pub(crate) struct Operation<'a> {
    kind: OpKind<'a>,
    phase: Phase,
    /// Sequence number allocated when the request was framed.
    seq: u32,
    /// Bytes this operation appended to the outbound buffer, for rewind.
    frame_len: usize,
    /// At least one byte of the request reached the wire.
    wire_started: bool,
    /// A cancel frame for this operation has been framed.
    cancel_sent: bool,
}

impl<'a> Operation<'a> {
    fn new(kind: OpKind<'a>) -> Self {
        Operation {
            kind,
            phase: Phase::Init,
            seq: 0,
            frame_len: 0,
            wire_started: false,
            cancel_sent: false,
        }
    }

    pub(crate) fn read(buf: &'a mut [u8]) -> Self {
        Self::new(OpKind::Read { buf })
    }

    pub(crate) fn write(data: &'a [u8]) -> Self {
        Self::new(OpKind::Write { data })
    }

    pub(crate) fn seek(offset: i64, origin: SeekOrigin) -> Self {
        Self::new(OpKind::Seek { offset, origin })
    }

    pub(crate) fn truncate(size: u64) -> Self {
        Self::new(OpKind::Truncate { size })
    }

    pub(crate) fn close() -> Self {
        Self::new(OpKind::Close)
    }

    pub(crate) fn query_info(attributes: &'a str) -> Self {
        Self::new(OpKind::QueryInfo {
            attributes,
            capture: Vec::new(),
        })
    }

    fn cancelled(&self, io: &IoFeedback) -> bool {
        self.cancel_sent || io.cancel_requested
    }

    /// Destination slice for a `Deliver` action.
    pub(crate) fn deliver_slice(&mut self, max: usize) -> &mut [u8] {
        match &mut self.kind {
            OpKind::Read { buf } => {
                let len = max.min(buf.len());
                &mut buf[..len]
            }
            _ => unreachable!("deliver emitted for a non-read operation"),
        }
    }

    /// Append captured payload bytes for a `Capture` action.
    pub(crate) fn capture_extend(&mut self, bytes: &[u8]) {
        match &mut self.kind {
            OpKind::QueryInfo { capture, .. } => capture.extend_from_slice(bytes),
            _ => unreachable!("capture emitted for a non-query operation"),
        }
    }

    /// Move the completed capture into the stream's pre-read FIFO.
    fn finish_capture(&mut self, core: &mut StreamCore, generation: u32) {
        if let OpKind::QueryInfo { capture, .. } = &mut self.kind {
            if !capture.is_empty() {
                core.pre_reads.push_back(PreRead {
                    data: std::mem::take(capture),
                    generation,
                });
            }
        }
    }
}

/// Advance `op` by one transition. The returned [`Step`] either names the
/// next I/O primitive or carries the terminal result.
pub(crate) fn step(core: &mut StreamCore, op: &mut Operation<'_>, io: &mut IoFeedback) -> Step {
    loop {
        match op.phase {
            Phase::Init => return init(core, op),

            // The last primitive was a send of the outbound buffer.
            Phase::SendRequest => {
                if io.io_cancelled {
                    if !op.cancel_sent {
                        core.rewind_request(op.frame_len);
                    }
                    return Step::Done(Err(StreamError::Cancelled));
                }

                let sent = io.res.min(core.outbound.len());
                core.outbound.drain(..sent);

                if !op.wire_started {
                    op.wire_started = true;
                    if matches!(op.kind, OpKind::Seek { .. }) {
                        // The peer will see the seek; every block still in
                        // flight belongs to the old position.
                        core.generation += 1;
                        core.pre_reads.clear();
                        trace!("seek on the wire, generation now {}", core.generation);
                    }
                }

                if !core.outbound.is_empty() {
                    return Step::Io(IoAction::Send { cancellable: false });
                }
                op.phase = Phase::HandleInput;
            }

            Phase::HandleInput => {
                if io.cancel_requested && !op.cancel_sent {
                    op.cancel_sent = true;
                    core.append_request(Opcode::Cancel, op.seq, 0, 0);
                    trace!("{} seq {} cancelled, sending cancel frame", op.kind.name(), op.seq);
                    op.phase = Phase::SendRequest;
                    return Step::Io(IoAction::Send { cancellable: false });
                }

                op.phase = if core.in_block() {
                    Phase::HandleBlock
                } else {
                    Phase::ReadHeader
                };
            }

            Phase::HandleBlock => {
                let (remaining, block_gen) = core.block_state();
                let current = block_gen == core.generation;

                if remaining == 0 {
                    core.input_phase = InputPhase::ReplyHeader;
                    if current && matches!(op.kind, OpKind::Read { .. }) {
                        // Zero-length chunk: orderly end of file, unless the
                        // read was cancelled while it was in flight.
                        return if op.cancelled(io) {
                            Step::Done(Err(StreamError::Cancelled))
                        } else {
                            Step::Done(Ok(OpOutput::Transferred(0)))
                        };
                    }
                    op.phase = Phase::HandleInput;
                } else {
                    match &op.kind {
                        OpKind::Read { buf }
                            if current && !op.cancel_sent && !io.cancel_requested =>
                        {
                            let max = buf.len().min(remaining);
                            op.phase = Phase::DeliverBlock;
                            return Step::Io(IoAction::Deliver {
                                max,
                                cancellable: false,
                            });
                        }
                        OpKind::QueryInfo { .. } if current && core.captures_prereads => {
                            op.phase = Phase::CaptureBlock;
                            return Step::Io(IoAction::Capture {
                                max: remaining.min(SKIP_CHUNK),
                            });
                        }
                        _ => {
                            op.phase = Phase::SkipBlock;
                            return Step::Io(IoAction::Drain {
                                max: remaining.min(SKIP_CHUNK),
                                cancellable: !op.cancel_sent,
                            });
                        }
                    }
                }
            }

            Phase::SkipBlock => {
                if io.io_cancelled {
                    op.phase = Phase::HandleInput;
                } else {
                    let (_, block_gen) = core.block_state();
                    let current = block_gen == core.generation;
                    core.consume_block(io.res);

                    if !core.in_block()
                        && current
                        && op.cancelled(io)
                        && matches!(op.kind, OpKind::Read { .. })
                    {
                        // The payload this read could no longer accept has
                        // been fully drained; the stream is clean again.
                        return Step::Done(Err(StreamError::Cancelled));
                    }
                    op.phase = Phase::HandleInput;
                }
            }

            Phase::CaptureBlock => {
                let (_, block_gen) = core.block_state();
                core.consume_block(io.res);
                if !core.in_block() {
                    op.finish_capture(core, block_gen);
                }
                op.phase = Phase::HandleInput;
            }

            Phase::DeliverBlock => {
                if io.io_cancelled {
                    return Step::Done(Err(StreamError::Cancelled));
                }
                core.consume_block(io.res);
                return Step::Done(Ok(OpOutput::Transferred(io.res)));
            }

            Phase::ReadHeader => {
                if io.io_cancelled {
                    op.phase = Phase::HandleInput;
                } else {
                    let missing = match protocol::reply_missing_bytes(&core.inbound) {
                        Ok(missing) => missing,
                        Err(err) => {
                            core.inbound.clear();
                            return Step::Done(Err(err));
                        }
                    };
                    if missing > 0 {
                        return Step::Io(IoAction::Fill {
                            want: missing,
                            cancellable: core.inbound.is_empty() && !op.cancel_sent,
                        });
                    }
                    if let Some(done) = dispatch_reply(core, op) {
                        return done;
                    }
                }
            }
        }

        // Between internal transitions the last primitive's outcome is
        // spent; only the cancellation sample carries forward.
        io.consume();
    }
}

/// Frame the request for `op` and enter the send path. Reads may complete
/// immediately from pre-read chunks or a partially consumed block.
fn init(core: &mut StreamCore, op: &mut Operation<'_>) -> Step {
    match &mut op.kind {
        OpKind::Read { buf } => {
            // Serve buffered pre-reads first, dropping stale generations.
            while let Some(mut pre) = core.pre_reads.pop_front() {
                if pre.generation != core.generation {
                    continue;
                }
                let len = buf.len().min(pre.data.len());
                buf[..len].copy_from_slice(&pre.data[..len]);
                if len < pre.data.len() {
                    // Remainder stays queued for the next read.
                    pre.data.drain(..len);
                    core.pre_reads.push_front(pre);
                }
                trace!("read served {} bytes from pre-read chunk", len);
                return Step::Done(Ok(OpOutput::Transferred(len)));
            }

            // A partially consumed block of the current generation can be
            // read out without framing a new request.
            let (remaining, block_gen) = core.block_state();
            if core.in_block() && block_gen == core.generation {
                let max = buf.len().min(remaining);
                op.phase = Phase::DeliverBlock;
                return Step::Io(IoAction::Deliver {
                    max,
                    cancellable: true,
                });
            }

            op.seq = core.append_request(Opcode::Read, buf.len() as u32, 0, 0);
            op.frame_len = REQUEST_HEADER_SIZE;
        }

        OpKind::Write { data } => {
            // The payload rides the outbound buffer with its header: one
            // send path, one rewind path.
            op.seq = core.append_request(Opcode::Write, data.len() as u32, 0, data.len() as u32);
            core.outbound.extend_from_slice(data);
            op.frame_len = REQUEST_HEADER_SIZE + data.len();
        }

        OpKind::Seek { offset, origin } => {
            let (opcode, target) = match origin {
                SeekOrigin::Start => (Opcode::SeekSet, Some(*offset)),
                SeekOrigin::Current => {
                    (Opcode::SeekSet, (core.offset as i64).checked_add(*offset))
                }
                SeekOrigin::End => (Opcode::SeekEnd, Some(*offset)),
            };
            let target = match target {
                Some(target) if opcode == Opcode::SeekEnd || target >= 0 => target,
                _ => {
                    return Step::Done(Err(StreamError::InvalidArgument(format!(
                        "seek offset {} out of range",
                        offset
                    ))))
                }
            };
            let wire = target as u64;
            op.seq = core.append_request(opcode, wire as u32, (wire >> 32) as u32, 0);
            op.frame_len = REQUEST_HEADER_SIZE;
        }

        OpKind::Truncate { size } => {
            op.seq = core.append_request(Opcode::Truncate, *size as u32, (*size >> 32) as u32, 0);
            op.frame_len = REQUEST_HEADER_SIZE;
        }

        OpKind::Close => {
            // Anything buffered ahead is dead once the stream closes.
            core.pre_reads.clear();
            op.seq = core.append_request(Opcode::Close, 0, 0, 0);
            op.frame_len = REQUEST_HEADER_SIZE;
        }

        OpKind::QueryInfo { attributes, .. } => {
            op.seq = core.append_request(Opcode::QueryInfo, 0, 0, attributes.len() as u32);
            core.outbound.extend_from_slice(attributes.as_bytes());
            op.frame_len = REQUEST_HEADER_SIZE + attributes.len();
        }
    }

    trace!("{} framed as seq {}", op.kind.name(), op.seq);
    op.phase = Phase::SendRequest;
    Step::Io(IoAction::Send { cancellable: true })
}

/// Dispatch one complete reply sitting in the inbound buffer. Returns the
/// terminal step, or `None` when the machine should keep running.
fn dispatch_reply(core: &mut StreamCore, op: &mut Operation<'_>) -> Option<Step> {
    let header = match protocol::decode_reply_header(&core.inbound) {
        Ok(header) => header,
        Err(err) => {
            core.inbound.clear();
            return Some(Step::Done(Err(err)));
        }
    };

    // Data chunks are stream state, not operation state: whichever
    // operation is running switches into block phase.
    if header.reply_type == ReplyType::Data {
        core.inbound.clear();
        core.input_phase = InputPhase::Block {
            remaining: header.arg1 as usize,
            generation: header.arg2,
        };
        op.phase = Phase::HandleBlock;
        return None;
    }

    if header.seq == op.seq {
        let payload = core.inbound[REPLY_HEADER_SIZE..].to_vec();

        match (header.reply_type, &op.kind) {
            (ReplyType::Error, _) => {
                core.inbound.clear();
                let failure = match protocol::decode_error_payload(&payload) {
                    Err(err) => err,
                    // A cancelled operation reports the cancellation, not
                    // whatever the daemon answered to the cancel frame.
                    Ok(_) if op.cancel_sent => StreamError::Cancelled,
                    Ok((domain, message)) => StreamError::Remote {
                        domain,
                        code: header.arg1,
                        message,
                    },
                };
                return Some(Step::Done(Err(failure)));
            }
            (ReplyType::SeekPos, OpKind::Seek { .. }) => {
                core.inbound.clear();
                let pos = ((header.arg2 as u64) << 32) | header.arg1 as u64;
                return Some(finish(op, OpOutput::Position(pos)));
            }
            (ReplyType::Written, OpKind::Write { .. }) => {
                core.inbound.clear();
                return Some(finish(op, OpOutput::Transferred(header.arg1 as usize)));
            }
            (ReplyType::Truncated, OpKind::Truncate { .. }) => {
                core.inbound.clear();
                return Some(finish(op, OpOutput::Finished));
            }
            (ReplyType::Closed, OpKind::Close) => {
                core.inbound.clear();
                if !payload.is_empty() {
                    core.closing_tag = Some(payload);
                }
                return Some(finish(op, OpOutput::Finished));
            }
            (ReplyType::Info, OpKind::QueryInfo { .. }) => {
                core.inbound.clear();
                return Some(finish(op, OpOutput::Info(payload)));
            }
            _ => {}
        }
    }

    // A reply for a superseded operation; drop it and read the next one.
    trace!(
        "ignoring {:?} reply for seq {} while {} seq {} is in flight",
        header.reply_type,
        header.seq,
        op.kind.name(),
        op.seq
    );
    core.inbound.clear();
    op.phase = Phase::ReadHeader;
    None
}

fn finish(op: &Operation<'_>, output: OpOutput) -> Step {
    if op.cancel_sent {
        Step::Done(Err(StreamError::Cancelled))
    } else {
        Step::Done(Ok(output))
    }
}
