//! Listening socket and accept loop.

use crate::lifecycle::{Dispatcher, LifecycleEvent};
use crate::runtime::handler::ConnectionHandler;
use crate::runtime::registry::ConnectionRegistry;
use crate::server::{ListenerState, ServerConfig, ShutdownFlags};
use mio::net::{TcpListener, TcpStream};
use mio::{Events, Interest, Poll, Token};
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

const LISTENER_TOKEN: Token = Token(0);

/// Everything the accept loop needs, moved onto its thread.
pub(crate) struct AcceptLoop {
    pub config: ServerConfig,
    pub flags: Arc<ShutdownFlags>,
    pub registry: Arc<ConnectionRegistry>,
    pub handler: Arc<dyn ConnectionHandler>,
    pub dispatcher: Dispatcher,
    pub state: Arc<ListenerState>,
}

impl AcceptLoop {
    /// Bind, accept until a shutdown flag is raised, then drain.
    ///
    /// Posts `Started` or `StartFailed`, and `Stopped` once drained.
    pub fn run(self) {
        let (mut poll, listener, addr) = match self.open() {
            Ok(opened) => opened,
            Err(e) => {
                error!(
                    host = %self.config.host,
                    port = self.config.port,
                    error = %e,
                    "Failed to start listener"
                );
                self.state.set_running(false);
                self.dispatcher.post(LifecycleEvent::StartFailed);
                return;
            }
        };

        self.state.set_local_addr(Some(addr));
        info!(
            addr = %addr,
            backlog = self.config.backlog,
            max_connections = self.registry.capacity(),
            "Server listening"
        );
        self.dispatcher.post(LifecycleEvent::Started);

        let mut events = Events::with_capacity(16);
        while !self.flags.any() {
            self.registry.purge_finished();

            match listener.accept() {
                Ok((stream, peer)) => self.dispatch(stream, peer),
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                    self.wait(&mut poll, &mut events);
                }
                Err(e) => {
                    debug!(error = %e, "Accept failed");
                    self.wait(&mut poll, &mut events);
                }
            }
        }

        drop(listener);
        self.state.set_local_addr(None);
        info!(
            active = self.registry.active_count(),
            hard = self.flags.is_hard(),
            "Listener closed, draining connections"
        );

        self.registry.wait_idle();
        self.registry.set_shutdown_flag();
        self.state.set_running(false);
        info!("Server stopped");
        self.dispatcher.post(LifecycleEvent::Stopped);
    }

    fn open(&self) -> io::Result<(Poll, TcpListener, SocketAddr)> {
        let addr = self.config.bind_addr()?;
        let std_listener = bind_listener(addr, self.config.backlog)?;
        let mut listener = TcpListener::from_std(std_listener);

        let poll = Poll::new()?;
        poll.registry()
            .register(&mut listener, LISTENER_TOKEN, Interest::READABLE)?;

        let local = listener.local_addr()?;
        Ok((poll, listener, local))
    }

    /// Sleep until the listener is readable or the poll interval elapses.
    fn wait(&self, poll: &mut Poll, events: &mut Events) {
        if let Err(e) = poll.poll(events, Some(self.config.poll_interval)) {
            if e.kind() != io::ErrorKind::Interrupted {
                warn!(error = %e, "Listener poll failed");
            }
        }
    }

    fn dispatch(&self, stream: TcpStream, peer: SocketAddr) {
        let stream = std::net::TcpStream::from(stream);
        if let Err(e) = stream.set_nonblocking(false) {
            debug!(peer = %peer, error = %e, "Failed to reset accepted socket");
            return;
        }
        match self
            .registry
            .dispatch(stream, peer, Arc::clone(&self.handler))
        {
            Ok(conn_id) => debug!(conn_id, peer = %peer, "Accepted connection"),
            Err(e) => warn!(peer = %peer, error = %e, "Rejected connection"),
        }
    }
}

/// Create a non-blocking listening socket with the given backlog.
pub fn bind_listener(addr: SocketAddr, backlog: i32) -> io::Result<std::net::TcpListener> {
    let socket = socket2::Socket::new(
        socket2::Domain::for_address(addr),
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )?;

    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(backlog)?;

    Ok(socket.into())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bind_listener_is_nonblocking() {
        let listener = bind_listener("127.0.0.1:0".parse().unwrap(), 16).unwrap();
        let err = listener.accept().unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::WouldBlock);
    }

    #[test]
    fn test_bind_listener_rejects_port_in_use() {
        let first = bind_listener("127.0.0.1:0".parse().unwrap(), 16).unwrap();
        let addr = first.local_addr().unwrap();
        assert!(bind_listener(addr, 16).is_err());
    }
}
