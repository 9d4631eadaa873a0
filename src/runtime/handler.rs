//! Pluggable connection and response handling.
//!
//! - [`ResponseBuilder`] turns a request body into a response body.
//! - [`ConnectionHandler`] services one accepted socket end to end. The
//!   default [`FramingHandler`] runs a [`Session`] against a
//!   [`CompletionPort`] until the exchange finishes or is aborted.

use super::completion::CompletionPort;
use super::session::{Completion, FrameError, Session, SessionOutcome};
use std::io;
use std::net::TcpStream;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, trace};

/// Builds the response body for a request.
///
/// Returning `None` (or an empty body) makes the session send the default
/// payload. `cancel` belongs to the calling session alone: raising it closes
/// that connection without a reply and leaves every other one untouched.
pub trait ResponseBuilder: Send + Sync {
    fn build(&self, request: &[u8], cancel: &AtomicBool) -> Option<Vec<u8>>;
}

impl<F> ResponseBuilder for F
where
    F: Fn(&[u8], &AtomicBool) -> Option<Vec<u8>> + Send + Sync,
{
    fn build(&self, request: &[u8], cancel: &AtomicBool) -> Option<Vec<u8>> {
        self(request, cancel)
    }
}

/// Replies with the request body.
#[derive(Debug, Clone, Copy, Default)]
pub struct EchoBuilder;

impl ResponseBuilder for EchoBuilder {
    fn build(&self, request: &[u8], _cancel: &AtomicBool) -> Option<Vec<u8>> {
        Some(request.to_vec())
    }
}

/// Services one accepted connection.
///
/// Runs on the connection's worker thread. `abort` is the registry's
/// hard-shutdown flag and must be checked between blocking steps. The stream
/// arrives in blocking mode and is closed by dropping it.
pub trait ConnectionHandler: Send + Sync {
    fn handle(&self, stream: TcpStream, abort: &AtomicBool) -> SessionOutcome;
}

/// Runs one framed request/response exchange per connection.
#[derive(Clone)]
pub struct FramingHandler {
    builder: Option<Arc<dyn ResponseBuilder>>,
    max_body_size: usize,
    poll_interval: Duration,
}

impl FramingHandler {
    pub fn new(max_body_size: usize, poll_interval: Duration) -> Self {
        Self {
            builder: None,
            max_body_size,
            poll_interval,
        }
    }

    pub fn with_builder(mut self, builder: Arc<dyn ResponseBuilder>) -> Self {
        self.builder = Some(builder);
        self
    }
}

impl ConnectionHandler for FramingHandler {
    fn handle(&self, stream: TcpStream, abort: &AtomicBool) -> SessionOutcome {
        let mut port = match CompletionPort::new(stream) {
            Ok(port) => port,
            Err(e) => {
                debug!(error = %e, "Failed to prepare connection");
                return SessionOutcome::Failed(FrameError::Io(e));
            }
        };
        let mut session = Session::new(self.builder.clone(), self.max_body_size);

        while !abort.load(Ordering::SeqCst) && !session.is_finished() {
            if let Some(op) = session.drive(abort) {
                if let Err(op) = port.submit(op) {
                    let result = Err(io::Error::other("operation already in flight"));
                    session.complete(Completion { op, result }, abort);
                    continue;
                }
            }

            if let Some(completion) = port.poll(self.poll_interval) {
                session.complete(completion, abort);
            }
        }

        trace!(
            peer = ?port.peer_addr().ok(),
            stage = ?session.stage(),
            "Session loop exited"
        );
        session.into_outcome()
    }
}
