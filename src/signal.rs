//! Process signals mapped onto server shutdown.
//!
//! | Signal           | Action                                  |
//! |------------------|-----------------------------------------|
//! | SIGINT / SIGTERM | Soft stop: close listener, drain        |
//! | repeated         | Hard stop: abort in-flight connections  |

use crate::server::StopHandle;
use std::sync::atomic::{AtomicUsize, Ordering};
use tracing::{info, warn};

/// Escalates from soft to hard stop as shutdown signals repeat.
pub struct ShutdownEscalation {
    handle: StopHandle,
    received: AtomicUsize,
}

impl ShutdownEscalation {
    pub fn new(handle: StopHandle) -> Self {
        Self {
            handle,
            received: AtomicUsize::new(0),
        }
    }

    /// Record one shutdown signal and act on it.
    pub fn signal(&self) {
        let count = self.received.fetch_add(1, Ordering::SeqCst) + 1;
        if count == 1 {
            info!("Shutdown signal received, draining connections");
            self.handle.soft_stop();
        } else {
            warn!(signals = count, "Repeated shutdown signal, aborting connections");
            self.handle.hard_stop();
        }
    }

    pub fn signals_received(&self) -> usize {
        self.received.load(Ordering::SeqCst)
    }
}

/// Route SIGINT and SIGTERM (Ctrl+C on Windows) to `handle`.
///
/// Can be installed once per process.
pub fn install(handle: StopHandle) -> Result<(), ctrlc::Error> {
    let escalation = ShutdownEscalation::new(handle);
    ctrlc::set_handler(move || escalation.signal())
}
