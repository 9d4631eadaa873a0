//! Per-session completion port.
//!
//! Sessions issue operations and expect completions back. Underneath, the
//! port is readiness-based: it attempts the submitted operation with a
//! non-blocking syscall and, when the socket is not ready, waits on mio
//! (epoll on Linux, kqueue on macOS) for at most the caller's timeout.
//!
//! A receive completes after one successful read, however short. A send keeps
//! writing across readiness events and completes with the total written; it
//! only comes back short when the socket stops accepting bytes.

use super::session::{Completion, IoOp, OpKind};
use mio::net::TcpStream;
use mio::{Events, Interest, Poll, Token};
use std::io::{self, Read, Write};
use std::net::SocketAddr;
use std::time::Duration;

const SOCKET_TOKEN: Token = Token(0);

enum Attempt {
    Done(io::Result<usize>),
    WouldBlock,
}

/// Owns one accepted socket and performs at most one operation at a time.
///
/// The socket is closed when the port is dropped.
pub struct CompletionPort {
    poll: Poll,
    events: Events,
    stream: TcpStream,
    pending: Option<IoOp>,
}

impl CompletionPort {
    pub fn new(stream: std::net::TcpStream) -> io::Result<Self> {
        stream.set_nonblocking(true)?;
        stream.set_nodelay(true)?;

        let mut stream = TcpStream::from_std(stream);
        let poll = Poll::new()?;
        poll.registry().register(
            &mut stream,
            SOCKET_TOKEN,
            Interest::READABLE | Interest::WRITABLE,
        )?;

        Ok(Self {
            poll,
            events: Events::with_capacity(4),
            stream,
            pending: None,
        })
    }

    pub fn peer_addr(&self) -> io::Result<SocketAddr> {
        self.stream.peer_addr()
    }

    /// True when no operation is outstanding.
    pub fn is_idle(&self) -> bool {
        self.pending.is_none()
    }

    /// Hand an operation to the port.
    ///
    /// Returns the operation back if another one is still outstanding.
    pub fn submit(&mut self, op: IoOp) -> Result<(), IoOp> {
        if self.pending.is_some() {
            return Err(op);
        }
        self.pending = Some(op);
        Ok(())
    }

    /// Make progress on the outstanding operation.
    ///
    /// Blocks for at most `timeout` waiting for readiness. Returns the
    /// completion once the operation has finished, `None` if it is still
    /// pending or nothing was submitted.
    pub fn poll(&mut self, timeout: Duration) -> Option<Completion> {
        let mut op = self.pending.take()?;

        if let Attempt::Done(result) = self.attempt(&mut op) {
            return Some(Completion { op, result });
        }

        if let Err(e) = self.poll.poll(&mut self.events, Some(timeout)) {
            if e.kind() != io::ErrorKind::Interrupted {
                return Some(Completion { op, result: Err(e) });
            }
        }

        // Readiness may be spurious, in which case the op stays pending
        match self.attempt(&mut op) {
            Attempt::Done(result) => Some(Completion { op, result }),
            Attempt::WouldBlock => {
                self.pending = Some(op);
                None
            }
        }
    }

    fn attempt(&mut self, op: &mut IoOp) -> Attempt {
        match op.kind() {
            OpKind::Recv => loop {
                match self.stream.read(op.recv_target()) {
                    Ok(n) => {
                        op.advance(n);
                        return Attempt::Done(Ok(n));
                    }
                    Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                        return Attempt::WouldBlock
                    }
                    Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(e) => return Attempt::Done(Err(e)),
                }
            },
            OpKind::Send => loop {
                if op.unsent().is_empty() {
                    return Attempt::Done(Ok(op.transferred()));
                }
                match self.stream.write(op.unsent()) {
                    // Socket stopped accepting bytes: report what got out
                    Ok(0) => return Attempt::Done(Ok(op.transferred())),
                    Ok(n) => op.advance(n),
                    Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                        return Attempt::WouldBlock
                    }
                    Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(e) => return Attempt::Done(Err(e)),
                }
            },
        }
    }
}
