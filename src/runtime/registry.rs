//! Registry of connection worker threads.
//!
//! Each accepted connection gets its own worker thread. The registry keeps the
//! join handles in a slab so finished workers can be reaped in O(1) per entry,
//! and owns the hard-abort flag shared into every worker it spawns.

use crate::runtime::handler::ConnectionHandler;
use slab::Slab;
use std::fmt;
use std::io;
use std::net::{SocketAddr, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use tracing::{debug, warn};

/// A worker thread servicing one connection.
struct Worker {
    handle: JoinHandle<()>,
    peer: SocketAddr,
}

/// Reasons a connection could not be handed to a worker.
#[derive(Debug)]
pub enum DispatchError {
    AtCapacity { max: usize },
    Spawn(io::Error),
}

impl fmt::Display for DispatchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DispatchError::AtCapacity { max } => write!(f, "connection limit of {max} reached"),
            DispatchError::Spawn(e) => write!(f, "failed to spawn worker: {e}"),
        }
    }
}

impl std::error::Error for DispatchError {}

/// Tracks one worker thread per active connection.
pub struct ConnectionRegistry {
    workers: Mutex<Slab<Worker>>,
    /// Workers taken out of the slab by `wait_idle` and not yet joined.
    joining: AtomicUsize,
    shutdown: Arc<AtomicBool>,
    max_connections: usize,
}

impl ConnectionRegistry {
    pub fn new(max_connections: usize) -> Self {
        Self {
            workers: Mutex::new(Slab::new()),
            joining: AtomicUsize::new(0),
            shutdown: Arc::new(AtomicBool::new(false)),
            max_connections,
        }
    }

    /// Spawn a worker running `handler` on `stream`.
    ///
    /// Returns the worker id. On error the stream has been dropped, which
    /// closes the connection.
    pub fn dispatch(
        &self,
        stream: TcpStream,
        peer: SocketAddr,
        handler: Arc<dyn ConnectionHandler>,
    ) -> Result<usize, DispatchError> {
        self.purge_finished();

        let mut workers = self.lock();
        if workers.len() >= self.max_connections {
            return Err(DispatchError::AtCapacity {
                max: self.max_connections,
            });
        }

        let entry = workers.vacant_entry();
        let conn_id = entry.key();
        let abort = Arc::clone(&self.shutdown);

        let handle = thread::Builder::new()
            .name(format!("conn-{conn_id}"))
            .spawn(move || {
                let outcome = handler.handle(stream, &abort);
                debug!(conn_id, peer = %peer, outcome = %outcome, "Connection finished");
            })
            .map_err(DispatchError::Spawn)?;

        entry.insert(Worker { handle, peer });
        Ok(conn_id)
    }

    /// Reap every worker whose thread has ended. Returns how many were reaped.
    pub fn purge_finished(&self) -> usize {
        let finished: Vec<Worker> = {
            let mut workers = self.lock();
            let ids: Vec<usize> = workers
                .iter()
                .filter(|(_, worker)| worker.handle.is_finished())
                .map(|(id, _)| id)
                .collect();
            ids.into_iter().map(|id| workers.remove(id)).collect()
        };

        let count = finished.len();
        finished.into_iter().for_each(reap);
        count
    }

    /// Whether any worker is still running.
    pub fn any_active(&self) -> bool {
        self.active_count() > 0
    }

    /// Number of workers still running.
    pub fn active_count(&self) -> usize {
        self.purge_finished();
        self.lock().len() + self.joining.load(Ordering::SeqCst)
    }

    /// Block until every dispatched worker has ended.
    pub fn wait_idle(&self) {
        loop {
            let drained: Vec<Worker> = {
                let mut workers = self.lock();
                let drained: Vec<Worker> = workers.drain().collect();
                self.joining.fetch_add(drained.len(), Ordering::SeqCst);
                drained
            };

            if drained.is_empty() {
                return;
            }

            for worker in drained {
                reap(worker);
                self.joining.fetch_sub(1, Ordering::SeqCst);
            }
        }
    }

    /// Clear the hard-abort flag so new workers run normally.
    pub fn reset_shutdown_flag(&self) {
        self.shutdown.store(false, Ordering::SeqCst);
    }

    /// Raise the hard-abort flag; every worker sees it at its next check.
    pub fn set_shutdown_flag(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    pub fn capacity(&self) -> usize {
        self.max_connections
    }

    fn lock(&self) -> MutexGuard<'_, Slab<Worker>> {
        self.workers.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn reap(worker: Worker) {
    if worker.handle.join().is_err() {
        warn!(peer = %worker.peer, "Connection worker panicked");
    }
}
