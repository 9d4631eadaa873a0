//! TCP server core.
//!
//! Owns the listener lifecycle: binding, the accept loop, soft and hard
//! shutdown, and the drain that waits for every connection worker to end.
//! Each accepted connection is serviced on its own thread by the configured
//! [`ConnectionHandler`], a [`FramingHandler`] unless replaced.
//!
//! The `Server` value belongs to the controlling thread. Lifecycle
//! notifications are queued by the accept loop and run when that thread calls
//! [`Server::pump_events`], [`Server::wait_event`] or
//! [`Server::run_until_stopped`].

use crate::lifecycle::{
    self, ControlQueue, Dispatcher, LifecycleEvent, LifecycleHandler, NoopLifecycle,
};
use crate::runtime::listener::AcceptLoop;
use crate::runtime::{ConnectionHandler, ConnectionRegistry, FramingHandler, ResponseBuilder};
use std::fmt;
use std::io;
use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{info, warn};

/// How long `run_until_stopped` blocks per wait.
const EVENT_WAIT: Duration = Duration::from_millis(250);

/// Runtime settings for a [`Server`].
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub backlog: i32,
    /// Run the accept loop on the thread calling `start` instead of a
    /// dedicated one.
    pub run_inline: bool,
    pub max_connections: usize,
    /// Largest request body a client may declare.
    pub max_body_size: usize,
    /// Upper bound on how long any loop waits before re-checking the
    /// shutdown flags.
    pub poll_interval: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 7878,
            backlog: 1024,
            run_inline: false,
            max_connections: 10_000,
            max_body_size: 16 * 1024 * 1024,
            poll_interval: Duration::from_millis(50),
        }
    }
}

impl ServerConfig {
    /// Resolve `host:port` to the address to bind.
    pub fn bind_addr(&self) -> io::Result<SocketAddr> {
        (self.host.as_str(), self.port)
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| {
                io::Error::new(
                    io::ErrorKind::InvalidInput,
                    format!("no address for host '{}'", self.host),
                )
            })
    }
}

/// Errors from server control operations.
#[derive(Debug)]
pub enum ServerError {
    /// The listener is running; stop the server first.
    Busy,
    /// The accept thread could not be spawned.
    Spawn(io::Error),
}

impl fmt::Display for ServerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServerError::Busy => write!(f, "server busy: listener is running"),
            ServerError::Spawn(e) => write!(f, "failed to spawn accept thread: {e}"),
        }
    }
}

impl std::error::Error for ServerError {}

/// Soft and hard shutdown requests. Advisory, read without locking.
#[derive(Debug, Default)]
pub(crate) struct ShutdownFlags {
    soft: AtomicBool,
    hard: AtomicBool,
}

impl ShutdownFlags {
    pub fn clear(&self) {
        self.soft.store(false, Ordering::SeqCst);
        self.hard.store(false, Ordering::SeqCst);
    }

    pub fn any(&self) -> bool {
        self.soft.load(Ordering::SeqCst) || self.hard.load(Ordering::SeqCst)
    }

    pub fn is_hard(&self) -> bool {
        self.hard.load(Ordering::SeqCst)
    }
}

/// Listener liveness, shared with the accept loop.
#[derive(Debug, Default)]
pub(crate) struct ListenerState {
    running: AtomicBool,
    local_addr: Mutex<Option<SocketAddr>>,
}

impl ListenerState {
    pub fn set_running(&self, running: bool) {
        self.running.store(running, Ordering::SeqCst);
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn set_local_addr(&self, addr: Option<SocketAddr>) {
        *self.local_addr.lock().unwrap_or_else(PoisonError::into_inner) = addr;
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Cloneable handle for stopping a server from any thread.
#[derive(Clone)]
pub struct StopHandle {
    flags: Arc<ShutdownFlags>,
    registry: Arc<ConnectionRegistry>,
}

impl StopHandle {
    /// Stop accepting; connections already dispatched run to completion.
    pub fn soft_stop(&self) {
        info!("Soft stop requested");
        self.flags.soft.store(true, Ordering::SeqCst);
    }

    /// Stop accepting and abort every connection at its next check point.
    pub fn hard_stop(&self) {
        info!("Hard stop requested");
        self.flags.hard.store(true, Ordering::SeqCst);
        self.registry.set_shutdown_flag();
    }
}

/// Server instance
pub struct Server {
    config: ServerConfig,
    flags: Arc<ShutdownFlags>,
    registry: Arc<ConnectionRegistry>,
    handler: Arc<dyn ConnectionHandler>,
    dispatcher: Dispatcher,
    control: ControlQueue,
    state: Arc<ListenerState>,
    accept_thread: Option<JoinHandle<()>>,
}

impl Server {
    /// Create a stopped server using the framing handler and default payload.
    pub fn new(config: ServerConfig) -> Self {
        let (dispatcher, control) = lifecycle::channel(Box::new(NoopLifecycle));
        let handler = FramingHandler::new(config.max_body_size, config.poll_interval);

        Server {
            registry: Arc::new(ConnectionRegistry::new(config.max_connections)),
            handler: Arc::new(handler),
            flags: Arc::new(ShutdownFlags::default()),
            dispatcher,
            control,
            state: Arc::new(ListenerState::default()),
            accept_thread: None,
            config,
        }
    }

    /// Answer requests with `builder` instead of the default payload.
    pub fn with_response_builder(mut self, builder: Arc<dyn ResponseBuilder>) -> Self {
        let handler = FramingHandler::new(self.config.max_body_size, self.config.poll_interval)
            .with_builder(builder);
        self.handler = Arc::new(handler);
        self
    }

    /// Replace the per-connection handler entirely.
    pub fn with_connection_handler(mut self, handler: Arc<dyn ConnectionHandler>) -> Self {
        self.handler = handler;
        self
    }

    pub fn with_lifecycle<H: LifecycleHandler + 'static>(mut self, handler: H) -> Self {
        self.control.set_handler(Box::new(handler));
        self
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Change port and backlog. Fails with [`ServerError::Busy`] while the
    /// listener is running.
    pub fn configure(&mut self, port: u16, backlog: i32) -> Result<(), ServerError> {
        if self.is_running() {
            return Err(ServerError::Busy);
        }
        self.config.port = port;
        self.config.backlog = backlog;
        Ok(())
    }

    /// Start the accept loop.
    ///
    /// Inline mode blocks until the server stops, then runs the queued
    /// notifications before returning, so `Started` is delivered at exit
    /// alongside `Stopped`. Stop an inline server through a [`StopHandle`].
    ///
    /// Otherwise the loop runs on its own thread and this returns at once;
    /// bind failures arrive as [`LifecycleEvent::StartFailed`].
    pub fn start(&mut self) -> Result<(), ServerError> {
        if self.is_running() {
            return Err(ServerError::Busy);
        }
        self.join_accept_thread();

        self.flags.clear();
        self.registry.reset_shutdown_flag();
        self.state.set_running(true);

        let accept_loop = AcceptLoop {
            config: self.config.clone(),
            flags: Arc::clone(&self.flags),
            registry: Arc::clone(&self.registry),
            handler: Arc::clone(&self.handler),
            dispatcher: self.dispatcher.clone(),
            state: Arc::clone(&self.state),
        };

        if self.config.run_inline {
            accept_loop.run();
            self.pump_events();
            return Ok(());
        }

        match thread::Builder::new()
            .name("accept-loop".to_string())
            .spawn(move || accept_loop.run())
        {
            Ok(handle) => {
                self.accept_thread = Some(handle);
                Ok(())
            }
            Err(e) => {
                self.state.set_running(false);
                Err(ServerError::Spawn(e))
            }
        }
    }

    pub fn soft_stop(&self) {
        self.stop_handle().soft_stop();
    }

    pub fn hard_stop(&self) {
        self.stop_handle().hard_stop();
    }

    pub fn stop_handle(&self) -> StopHandle {
        StopHandle {
            flags: Arc::clone(&self.flags),
            registry: Arc::clone(&self.registry),
        }
    }

    /// Whether the listener is live (from `start` until fully drained).
    pub fn is_running(&self) -> bool {
        self.state.is_running()
    }

    /// Address the listener is bound to, while it is open.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.state.local_addr()
    }

    pub fn any_active(&self) -> bool {
        self.registry.any_active()
    }

    pub fn active_connections(&self) -> usize {
        self.registry.active_count()
    }

    /// Run every queued lifecycle notification on this thread.
    pub fn pump_events(&self) -> usize {
        self.control.pump()
    }

    /// Wait up to `timeout` for one lifecycle notification and run it.
    pub fn wait_event(&self, timeout: Duration) -> Option<LifecycleEvent> {
        self.control.wait(timeout)
    }

    /// Run notifications until the server stops or fails to start.
    ///
    /// Returns the event that ended the run.
    pub fn run_until_stopped(&self) -> LifecycleEvent {
        loop {
            match self.control.wait(EVENT_WAIT) {
                Some(event @ (LifecycleEvent::Stopped | LifecycleEvent::StartFailed)) => {
                    return event
                }
                Some(LifecycleEvent::Started) => {}
                None if !self.is_running() => {
                    // The final event is posted right after the flag drops.
                    return self.control.wait(EVENT_WAIT).unwrap_or(LifecycleEvent::Stopped);
                }
                None => {}
            }
        }
    }

    fn join_accept_thread(&mut self) {
        if let Some(handle) = self.accept_thread.take() {
            if handle.join().is_err() {
                warn!("Accept thread panicked");
            }
        }
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        if self.accept_thread.is_some() && self.is_running() {
            self.hard_stop();
        }
        self.join_accept_thread();
    }
}
