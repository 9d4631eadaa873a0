//! Framing state machine for one request/response exchange.
//!
//! Every body on the wire is preceded by its length:
//!
//! ```text
//! +-------------------+--------------------+
//! | length (4 bytes)  |   body             |
//! | u32 big-endian    |   (length bytes)   |
//! +-------------------+--------------------+
//! ```
//!
//! The session never touches a socket. [`Session::drive`] runs the active
//! stages and hands out at most one [`IoOp`]; whoever performs the operation
//! returns it through [`Session::complete`]. The op owns the session buffer
//! while it is in flight, so the session cannot issue a second operation or
//! move past a waiting stage until the completion brings the buffer back.

use super::handler::ResponseBuilder;
use bytes::BytesMut;
use std::fmt;
use std::io;
use std::ops::Range;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::trace;

/// Length of the size prefix preceding each body.
pub const SIZE_PREFIX_LEN: usize = 4;

/// Body sent when no builder is installed or the builder has nothing to say.
pub const DEFAULT_RESPONSE: &[u8] = b"server_utils";

/// Position of a session within the exchange.
///
/// `Receiving*`/`Sending*` are waiting stages: an operation is in flight and
/// only its completion may move the session on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    ReceiveSize,
    ReceivingSize,
    ReceiveBody,
    ReceivingBody,
    RetryReceiveBody,
    BuildResponse,
    SendSize,
    SendingSize,
    SendBody,
    SendingBody,
    Complete,
    Error,
}

impl Stage {
    pub fn is_terminal(self) -> bool {
        matches!(self, Stage::Complete | Stage::Error)
    }

    pub fn is_waiting(self) -> bool {
        matches!(
            self,
            Stage::ReceivingSize | Stage::ReceivingBody | Stage::SendingSize | Stage::SendingBody
        )
    }
}

/// Direction of an I/O operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpKind {
    Recv,
    Send,
}

/// An I/O operation issued by a session.
///
/// Carries the session buffer and the byte range to fill or drain.
#[derive(Debug)]
pub struct IoOp {
    kind: OpKind,
    buf: BytesMut,
    range: Range<usize>,
    done: usize,
}

impl IoOp {
    pub fn kind(&self) -> OpKind {
        self.kind
    }

    /// Bytes requested by the session.
    pub fn len(&self) -> usize {
        self.range.len()
    }

    pub fn is_empty(&self) -> bool {
        self.range.is_empty()
    }

    /// Bytes moved so far.
    pub fn transferred(&self) -> usize {
        self.done
    }

    /// Record `n` bytes moved.
    pub fn advance(&mut self, n: usize) {
        self.done = (self.done + n).min(self.range.len());
    }

    /// Unfilled part of a receive.
    pub fn recv_target(&mut self) -> &mut [u8] {
        let start = self.range.start + self.done;
        &mut self.buf[start..self.range.end]
    }

    /// Unsent part of a send.
    pub fn unsent(&self) -> &[u8] {
        &self.buf[self.range.start + self.done..self.range.end]
    }
}

/// A finished operation and its result (bytes transferred).
#[derive(Debug)]
pub struct Completion {
    pub op: IoOp,
    pub result: io::Result<usize>,
}

/// Why a session ended in [`Stage::Error`].
#[derive(Debug)]
pub enum FrameError {
    /// The size prefix arrived short.
    ShortSizeRead { received: usize },
    /// A send moved fewer bytes than requested.
    ShortSend { sent: usize, expected: usize },
    /// The peer closed the connection.
    Closed,
    /// The declared request length exceeds the configured maximum.
    BodyTooLarge { size: usize, max: usize },
    /// The response does not fit a 4-byte length.
    ResponseTooLarge { size: usize },
    /// A completion arrived for a stage that was not waiting on it.
    UnexpectedCompletion { stage: Stage },
    /// The hard-abort flag was observed by a completion, or the response
    /// builder cancelled the session.
    Aborted,
    Io(io::Error),
}

impl fmt::Display for FrameError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FrameError::ShortSizeRead { received } => {
                write!(f, "short size prefix: {received} of {SIZE_PREFIX_LEN} bytes")
            }
            FrameError::ShortSend { sent, expected } => {
                write!(f, "short send: {sent} of {expected} bytes")
            }
            FrameError::Closed => write!(f, "connection closed by peer"),
            FrameError::BodyTooLarge { size, max } => {
                write!(f, "request body of {size} bytes exceeds maximum {max}")
            }
            FrameError::ResponseTooLarge { size } => {
                write!(f, "response body of {size} bytes does not fit the size prefix")
            }
            FrameError::UnexpectedCompletion { stage } => {
                write!(f, "completion delivered in stage {stage:?}")
            }
            FrameError::Aborted => write!(f, "aborted by hard shutdown"),
            FrameError::Io(e) => write!(f, "I/O error: {e}"),
        }
    }
}

impl std::error::Error for FrameError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            FrameError::Io(e) => Some(e),
            _ => None,
        }
    }
}

/// How a session ended.
#[derive(Debug)]
pub enum SessionOutcome {
    Complete,
    Failed(FrameError),
    /// Abandoned at a check point because the hard-abort flag was set.
    Aborted,
}

impl fmt::Display for SessionOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionOutcome::Complete => write!(f, "complete"),
            SessionOutcome::Failed(e) => write!(f, "failed: {e}"),
            SessionOutcome::Aborted => write!(f, "aborted"),
        }
    }
}

/// Protocol state for one accepted connection.
pub struct Session {
    stage: Stage,
    /// `None` exactly while an operation is in flight.
    buf: Option<BytesMut>,
    /// Body length of the message currently being received or sent.
    expected: usize,
    /// Body bytes received so far.
    transferred: usize,
    builder: Option<Arc<dyn ResponseBuilder>>,
    /// Raised by the builder to drop this session only.
    cancelled: AtomicBool,
    max_body_size: usize,
    error: Option<FrameError>,
}

impl Session {
    pub fn new(builder: Option<Arc<dyn ResponseBuilder>>, max_body_size: usize) -> Self {
        Self {
            stage: Stage::ReceiveSize,
            buf: Some(BytesMut::with_capacity(SIZE_PREFIX_LEN)),
            expected: 0,
            transferred: 0,
            builder,
            cancelled: AtomicBool::new(false),
            max_body_size,
            error: None,
        }
    }

    pub fn stage(&self) -> Stage {
        self.stage
    }

    pub fn is_finished(&self) -> bool {
        self.stage.is_terminal()
    }

    pub fn error(&self) -> Option<&FrameError> {
        self.error.as_ref()
    }

    /// Run active stages until an operation must be issued.
    ///
    /// Returns the operation to perform, or `None` when the session is
    /// waiting, finished, or `abort` is set. A session cancelled by its
    /// builder ends in [`Stage::Error`].
    pub fn drive(&mut self, abort: &AtomicBool) -> Option<IoOp> {
        loop {
            if self.is_cancelled() && !self.stage.is_terminal() {
                self.fail(FrameError::Aborted);
            }
            let idle = self.stage.is_terminal() || self.stage.is_waiting();
            if idle || abort.load(Ordering::SeqCst) {
                return None;
            }

            match self.stage {
                Stage::ReceiveSize => {
                    let mut buf = self.take_buffer()?;
                    buf.clear();
                    buf.resize(SIZE_PREFIX_LEN, 0);
                    return Some(self.issue(
                        Stage::ReceivingSize,
                        OpKind::Recv,
                        buf,
                        0..SIZE_PREFIX_LEN,
                    ));
                }
                Stage::ReceiveBody => {
                    if self.expected == 0 {
                        self.transition(Stage::BuildResponse);
                        continue;
                    }
                    let mut buf = self.take_buffer()?;
                    buf.resize(SIZE_PREFIX_LEN + self.expected, 0);
                    let range = SIZE_PREFIX_LEN..SIZE_PREFIX_LEN + self.expected;
                    return Some(self.issue(Stage::ReceivingBody, OpKind::Recv, buf, range));
                }
                Stage::RetryReceiveBody => {
                    let buf = self.take_buffer()?;
                    let range =
                        SIZE_PREFIX_LEN + self.transferred..SIZE_PREFIX_LEN + self.expected;
                    return Some(self.issue(Stage::ReceivingBody, OpKind::Recv, buf, range));
                }
                Stage::BuildResponse => self.build_response(),
                Stage::SendSize => {
                    let buf = self.take_buffer()?;
                    return Some(self.issue(
                        Stage::SendingSize,
                        OpKind::Send,
                        buf,
                        0..SIZE_PREFIX_LEN,
                    ));
                }
                Stage::SendBody => {
                    if self.expected == 0 {
                        self.transition(Stage::Complete);
                        continue;
                    }
                    let buf = self.take_buffer()?;
                    let range = SIZE_PREFIX_LEN..SIZE_PREFIX_LEN + self.expected;
                    return Some(self.issue(Stage::SendingBody, OpKind::Send, buf, range));
                }
                Stage::ReceivingSize
                | Stage::ReceivingBody
                | Stage::SendingSize
                | Stage::SendingBody
                | Stage::Complete
                | Stage::Error => return None,
            }
        }
    }

    /// Take back an operation issued by [`drive`](Self::drive) and decide the
    /// next stage. This is the only place a waiting stage is left.
    pub fn complete(&mut self, completion: Completion, abort: &AtomicBool) {
        let Completion { op, result } = completion;
        let IoOp {
            kind, buf, range, ..
        } = op;
        let requested = range.len();
        self.buf = Some(buf);

        if abort.load(Ordering::SeqCst) || self.is_cancelled() {
            self.fail(FrameError::Aborted);
            return;
        }

        let n = match result {
            Ok(n) => n,
            Err(e) => {
                self.fail(FrameError::Io(e));
                return;
            }
        };

        match (self.stage, kind) {
            (Stage::ReceivingSize, OpKind::Recv) => {
                if n == 0 {
                    self.fail(FrameError::Closed);
                } else if n < SIZE_PREFIX_LEN {
                    self.fail(FrameError::ShortSizeRead { received: n });
                } else {
                    let size = self.buf.as_deref().map_or(0, read_size_prefix) as usize;
                    if size > self.max_body_size {
                        self.fail(FrameError::BodyTooLarge {
                            size,
                            max: self.max_body_size,
                        });
                    } else {
                        self.expected = size;
                        self.transferred = 0;
                        self.transition(Stage::ReceiveBody);
                    }
                }
            }
            (Stage::ReceivingBody, OpKind::Recv) => {
                if n == 0 {
                    self.fail(FrameError::Closed);
                    return;
                }
                self.transferred += n;
                if self.transferred < self.expected {
                    trace!(
                        received = self.transferred,
                        expected = self.expected,
                        "Partial body, retrying"
                    );
                    self.transition(Stage::RetryReceiveBody);
                } else {
                    self.transition(Stage::BuildResponse);
                }
            }
            (Stage::SendingSize, OpKind::Send) => {
                if n < requested {
                    self.fail(FrameError::ShortSend {
                        sent: n,
                        expected: requested,
                    });
                } else {
                    self.transition(Stage::SendBody);
                }
            }
            (Stage::SendingBody, OpKind::Send) => {
                if n < requested {
                    self.fail(FrameError::ShortSend {
                        sent: n,
                        expected: requested,
                    });
                } else {
                    self.transition(Stage::Complete);
                }
            }
            (stage, _) => self.fail(FrameError::UnexpectedCompletion { stage }),
        }
    }

    /// Consume the session and report how it ended.
    pub fn into_outcome(self) -> SessionOutcome {
        match (self.stage, self.error) {
            (Stage::Complete, _) => SessionOutcome::Complete,
            (Stage::Error, Some(FrameError::Aborted)) => SessionOutcome::Aborted,
            (Stage::Error, Some(e)) => SessionOutcome::Failed(e),
            (Stage::Error, None) => SessionOutcome::Failed(FrameError::Closed),
            _ => SessionOutcome::Aborted,
        }
    }

    /// Whether the builder asked to drop this session.
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// The builder sees the session's own flag, never the shared hard-abort flag.
    fn build_response(&mut self) {
        let Some(mut buf) = self.take_buffer() else {
            return;
        };

        let request = &buf[SIZE_PREFIX_LEN..SIZE_PREFIX_LEN + self.expected];
        let response = self
            .builder
            .as_ref()
            .and_then(|builder| builder.build(request, &self.cancelled))
            .filter(|body| !body.is_empty());
        let body = response.as_deref().unwrap_or(DEFAULT_RESPONSE);

        let Ok(len) = u32::try_from(body.len()) else {
            self.buf = Some(buf);
            self.fail(FrameError::ResponseTooLarge { size: body.len() });
            return;
        };

        buf.clear();
        buf.reserve(SIZE_PREFIX_LEN + body.len());
        buf.extend_from_slice(&len.to_be_bytes());
        buf.extend_from_slice(body);

        self.expected = body.len();
        self.transferred = 0;
        self.buf = Some(buf);
        self.transition(Stage::SendSize);
    }

    fn issue(&mut self, waiting: Stage, kind: OpKind, buf: BytesMut, range: Range<usize>) -> IoOp {
        self.transition(waiting);
        IoOp {
            kind,
            buf,
            range,
            done: 0,
        }
    }

    fn take_buffer(&mut self) -> Option<BytesMut> {
        let buf = self.buf.take();
        if buf.is_none() {
            self.fail(FrameError::UnexpectedCompletion { stage: self.stage });
        }
        buf
    }

    fn transition(&mut self, next: Stage) {
        trace!(from = ?self.stage, to = ?next, "Stage transition");
        self.stage = next;
    }

    fn fail(&mut self, error: FrameError) {
        trace!(stage = ?self.stage, error = %error, "Session failed");
        self.error = Some(error);
        self.stage = Stage::Error;
    }
}

fn read_size_prefix(buf: &[u8]) -> u32 {
    let mut prefix = [0u8; SIZE_PREFIX_LEN];
    prefix.copy_from_slice(&buf[..SIZE_PREFIX_LEN]);
    u32::from_be_bytes(prefix)
}

#[cfg(test)]
mod tests {
    use super::*;

    const MAX_BODY: usize = 1024;

    /// Fill a receive op from `data`, as a socket read would.
    fn recv(op: &mut IoOp, data: &[u8]) -> usize {
        assert_eq!(op.kind(), OpKind::Recv);
        let target = op.recv_target();
        let n = data.len().min(target.len());
        target[..n].copy_from_slice(&data[..n]);
        op.advance(n);
        n
    }

    fn deliver(session: &mut Session, op: IoOp, n: usize, abort: &AtomicBool) {
        session.complete(Completion { op, result: Ok(n) }, abort);
    }

    /// Run a whole exchange in memory and return the bytes the server sent.
    fn exchange(session: &mut Session, request: &[u8], abort: &AtomicBool) -> Vec<u8> {
        let mut wire = Vec::new();
        let mut input = request;
        while let Some(mut op) = session.drive(abort) {
            match op.kind() {
                OpKind::Recv => {
                    let n = recv(&mut op, input);
                    input = &input[n..];
                    deliver(session, op, n, abort);
                }
                OpKind::Send => {
                    wire.extend_from_slice(op.unsent());
                    let n = op.len();
                    deliver(session, op, n, abort);
                }
            }
        }
        wire
    }

    fn framed(body: &[u8]) -> Vec<u8> {
        let mut out = (body.len() as u32).to_be_bytes().to_vec();
        out.extend_from_slice(body);
        out
    }

    #[test]
    fn test_default_response_without_builder() {
        let abort = AtomicBool::new(false);
        let mut session = Session::new(None, MAX_BODY);

        let wire = exchange(&mut session, b"\x00\x00\x00\x05hello", &abort);

        assert_eq!(wire, b"\x00\x00\x00\x0cserver_utils");
        assert_eq!(session.stage(), Stage::Complete);
        assert!(matches!(session.into_outcome(), SessionOutcome::Complete));
    }

    #[test]
    fn test_builder_sees_request_body() {
        let abort = AtomicBool::new(false);
        let builder: Arc<dyn ResponseBuilder> =
            Arc::new(|request: &[u8], _: &AtomicBool| Some(request.to_ascii_uppercase()));
        let mut session = Session::new(Some(builder), MAX_BODY);

        let wire = exchange(&mut session, &framed(b"ping"), &abort);

        assert_eq!(wire, framed(b"PING"));
    }

    #[test]
    fn test_empty_builder_output_falls_back_to_default() {
        let abort = AtomicBool::new(false);
        let builder: Arc<dyn ResponseBuilder> =
            Arc::new(|_: &[u8], _: &AtomicBool| -> Option<Vec<u8>> { Some(Vec::new()) });
        let mut session = Session::new(Some(builder), MAX_BODY);

        let wire = exchange(&mut session, &framed(b"x"), &abort);

        assert_eq!(wire, framed(DEFAULT_RESPONSE));
    }

    #[test]
    fn test_zero_length_request() {
        let abort = AtomicBool::new(false);
        let mut session = Session::new(None, MAX_BODY);

        let op = session.drive(&abort).unwrap();
        assert_eq!(op.len(), SIZE_PREFIX_LEN);
        let mut op = op;
        recv(&mut op, &[0, 0, 0, 0]);
        deliver(&mut session, op, SIZE_PREFIX_LEN, &abort);

        // No body receive is issued; the next op is the response size.
        let op = session.drive(&abort).unwrap();
        assert_eq!(op.kind(), OpKind::Send);
        assert_eq!(op.unsent(), &12u32.to_be_bytes());
        assert_eq!(session.stage(), Stage::SendingSize);
    }

    #[test]
    fn test_partial_body_retries_at_offset() {
        let abort = AtomicBool::new(false);
        let builder: Arc<dyn ResponseBuilder> =
            Arc::new(|request: &[u8], _: &AtomicBool| Some(request.to_vec()));
        let mut session = Session::new(Some(builder), MAX_BODY);

        let mut op = session.drive(&abort).unwrap();
        recv(&mut op, &10u32.to_be_bytes());
        deliver(&mut session, op, SIZE_PREFIX_LEN, &abort);

        let mut op = session.drive(&abort).unwrap();
        assert_eq!(op.len(), 10);
        let n = recv(&mut op, b"0123");
        deliver(&mut session, op, n, &abort);
        assert_eq!(session.stage(), Stage::RetryReceiveBody);

        let mut op = session.drive(&abort).unwrap();
        assert_eq!(op.len(), 6);
        let n = recv(&mut op, b"45");
        deliver(&mut session, op, n, &abort);
        assert_eq!(session.stage(), Stage::RetryReceiveBody);

        let mut op = session.drive(&abort).unwrap();
        assert_eq!(op.len(), 4);
        let n = recv(&mut op, b"6789");
        deliver(&mut session, op, n, &abort);
        assert_eq!(session.stage(), Stage::BuildResponse);

        let op = session.drive(&abort).unwrap();
        assert_eq!(op.unsent(), &10u32.to_be_bytes());
        deliver(&mut session, op, SIZE_PREFIX_LEN, &abort);

        let op = session.drive(&abort).unwrap();
        assert_eq!(op.unsent(), b"0123456789");
    }

    #[test]
    fn test_short_size_read_is_error() {
        let abort = AtomicBool::new(false);
        let mut session = Session::new(None, MAX_BODY);

        let mut op = session.drive(&abort).unwrap();
        let n = recv(&mut op, &[0, 0]);
        deliver(&mut session, op, n, &abort);

        assert_eq!(session.stage(), Stage::Error);
        assert!(session.drive(&abort).is_none());
        assert!(matches!(
            session.into_outcome(),
            SessionOutcome::Failed(FrameError::ShortSizeRead { received: 2 })
        ));
    }

    #[test]
    fn test_close_during_body_is_error() {
        let abort = AtomicBool::new(false);
        let mut session = Session::new(None, MAX_BODY);

        let mut op = session.drive(&abort).unwrap();
        recv(&mut op, &8u32.to_be_bytes());
        deliver(&mut session, op, SIZE_PREFIX_LEN, &abort);

        let op = session.drive(&abort).unwrap();
        deliver(&mut session, op, 0, &abort);

        assert!(matches!(session.error(), Some(FrameError::Closed)));
    }

    #[test]
    fn test_short_send_is_error() {
        let abort = AtomicBool::new(false);
        let mut session = Session::new(None, MAX_BODY);

        let mut op = session.drive(&abort).unwrap();
        recv(&mut op, &[0, 0, 0, 0]);
        deliver(&mut session, op, SIZE_PREFIX_LEN, &abort);

        let op = session.drive(&abort).unwrap();
        deliver(&mut session, op, SIZE_PREFIX_LEN, &abort);

        let op = session.drive(&abort).unwrap();
        assert_eq!(session.stage(), Stage::SendingBody);
        deliver(&mut session, op, 5, &abort);

        assert!(matches!(
            session.error(),
            Some(FrameError::ShortSend {
                sent: 5,
                expected: 12
            })
        ));
    }

    #[test]
    fn test_io_error_is_error() {
        let abort = AtomicBool::new(false);
        let mut session = Session::new(None, MAX_BODY);

        let op = session.drive(&abort).unwrap();
        let result = Err(io::Error::new(io::ErrorKind::ConnectionReset, "reset"));
        session.complete(Completion { op, result }, &abort);

        assert!(matches!(session.error(), Some(FrameError::Io(_))));
    }

    #[test]
    fn test_oversized_request_rejected() {
        let abort = AtomicBool::new(false);
        let mut session = Session::new(None, 16);

        let mut op = session.drive(&abort).unwrap();
        recv(&mut op, &17u32.to_be_bytes());
        deliver(&mut session, op, SIZE_PREFIX_LEN, &abort);

        assert!(matches!(
            session.error(),
            Some(FrameError::BodyTooLarge { size: 17, max: 16 })
        ));
    }

    #[test]
    fn test_single_operation_in_flight() {
        let abort = AtomicBool::new(false);
        let mut session = Session::new(None, MAX_BODY);

        let op = session.drive(&abort).unwrap();
        assert_eq!(session.stage(), Stage::ReceivingSize);

        // Driving again while waiting issues nothing and leaves the stage alone.
        assert!(session.drive(&abort).is_none());
        assert!(session.drive(&abort).is_none());
        assert_eq!(session.stage(), Stage::ReceivingSize);

        drop(op);
    }

    #[test]
    fn test_abort_stops_driver() {
        let abort = AtomicBool::new(true);
        let mut session = Session::new(None, MAX_BODY);

        assert!(session.drive(&abort).is_none());
        assert_eq!(session.stage(), Stage::ReceiveSize);
        assert!(matches!(session.into_outcome(), SessionOutcome::Aborted));
    }

    #[test]
    fn test_completion_observing_abort_is_error() {
        let abort = AtomicBool::new(false);
        let mut session = Session::new(None, MAX_BODY);

        let mut op = session.drive(&abort).unwrap();
        recv(&mut op, &[0, 0, 0, 1]);
        abort.store(true, Ordering::SeqCst);
        deliver(&mut session, op, SIZE_PREFIX_LEN, &abort);

        assert_eq!(session.stage(), Stage::Error);
        assert!(matches!(session.into_outcome(), SessionOutcome::Aborted));
    }

    #[test]
    fn test_builder_cancels_only_its_session() {
        let abort = AtomicBool::new(false);
        let builder: Arc<dyn ResponseBuilder> =
            Arc::new(|_: &[u8], cancel: &AtomicBool| -> Option<Vec<u8>> {
                cancel.store(true, Ordering::SeqCst);
                None
            });
        let mut session = Session::new(Some(builder), MAX_BODY);

        let mut op = session.drive(&abort).unwrap();
        recv(&mut op, &[0, 0, 0, 0]);
        deliver(&mut session, op, SIZE_PREFIX_LEN, &abort);

        // The builder raised its flag, so the send is never issued.
        assert!(session.drive(&abort).is_none());
        assert_eq!(session.stage(), Stage::Error);
        assert!(session.is_cancelled());
        assert!(!abort.load(Ordering::SeqCst), "shared flag must stay clear");
        assert!(matches!(session.into_outcome(), SessionOutcome::Aborted));
    }
}
