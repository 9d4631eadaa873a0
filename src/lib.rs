//! framed-server: a reusable TCP server core.
//!
//! Accepts connections, services each on its own worker thread with a
//! length-prefixed request/response exchange, and owns socket lifecycle,
//! concurrency and shutdown.
//!
//! Wire format per exchange (all lengths `u32` big-endian):
//!
//! ```text
//! client -> server:  <len N><N bytes request>
//! server -> client:  <len M><M bytes response>
//! ```
//!
//! Features:
//! - Soft stop (finish in-flight exchanges) and hard stop (abort them),
//!   reachable from SIGINT/SIGTERM
//! - Partial-read tolerant framing with one I/O operation in flight per session
//! - Pluggable response builder and connection handler
//! - Lifecycle notifications delivered on the controlling thread
//! - Configuration via CLI arguments or TOML file

pub mod config;
pub mod lifecycle;
pub mod runtime;
pub mod server;
pub mod signal;

pub use lifecycle::{LifecycleEvent, LifecycleHandler};
pub use runtime::{ConnectionHandler, EchoBuilder, FramingHandler, ResponseBuilder, SessionOutcome};
pub use server::{Server, ServerConfig, ServerError, StopHandle};
