//! Connection runtime.
//!
//! Thread-per-connection model with readiness-based I/O underneath:
//! - `listener`: bound socket and the accept loop
//! - `registry`: one worker thread per accepted connection
//! - `handler`: what a worker does with its connection
//! - `session`: the framing state machine for one exchange
//! - `completion`: per-session operation/completion port over mio

mod completion;
mod handler;
pub(crate) mod listener;
mod registry;
mod session;

pub use completion::CompletionPort;
pub use handler::{ConnectionHandler, EchoBuilder, FramingHandler, ResponseBuilder};
pub use listener::bind_listener;
pub use registry::{ConnectionRegistry, DispatchError};
pub use session::{
    Completion, FrameError, IoOp, OpKind, Session, SessionOutcome, Stage, DEFAULT_RESPONSE,
    SIZE_PREFIX_LEN,
};
