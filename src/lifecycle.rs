//! Lifecycle notifications marshalled to the controlling thread.
//!
//! The accept loop never calls user handlers directly. It posts events through
//! a [`Dispatcher`]; they run only when the thread owning the [`ControlQueue`]
//! pumps it. Handlers therefore never race with socket teardown and need not
//! be `Send`.

use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::time::Duration;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleEvent {
    /// The listener is bound and accepting.
    Started,
    /// Binding or listening failed; the server is stopped.
    StartFailed,
    /// The listener is closed and every connection has drained.
    Stopped,
}

/// Callbacks for server lifecycle events, run on the controlling thread.
pub trait LifecycleHandler {
    fn on_started(&self) {}

    fn on_start_failed(&self) {}

    fn on_stopped(&self) {}
}

/// Handler that ignores every event.
#[derive(Debug, Default)]
pub struct NoopLifecycle;

impl LifecycleHandler for NoopLifecycle {}

/// Sending side, cloned into the accept loop.
#[derive(Clone)]
pub struct Dispatcher {
    tx: Sender<LifecycleEvent>,
}

impl Dispatcher {
    pub fn post(&self, event: LifecycleEvent) {
        if self.tx.send(event).is_err() {
            debug!(?event, "Controlling thread gone, dropping lifecycle event");
        }
    }
}

/// Receiving side, owned by the controlling thread.
pub struct ControlQueue {
    rx: Receiver<LifecycleEvent>,
    handler: Box<dyn LifecycleHandler>,
}

/// Create a connected dispatcher and control queue.
pub fn channel(handler: Box<dyn LifecycleHandler>) -> (Dispatcher, ControlQueue) {
    let (tx, rx) = mpsc::channel();
    (Dispatcher { tx }, ControlQueue { rx, handler })
}

impl ControlQueue {
    pub fn set_handler(&mut self, handler: Box<dyn LifecycleHandler>) {
        self.handler = handler;
    }

    /// Run every queued event. Returns how many ran.
    pub fn pump(&self) -> usize {
        let mut count = 0;
        while let Ok(event) = self.rx.try_recv() {
            self.deliver(event);
            count += 1;
        }
        count
    }

    /// Wait up to `timeout` for one event and run it.
    pub fn wait(&self, timeout: Duration) -> Option<LifecycleEvent> {
        match self.rx.recv_timeout(timeout) {
            Ok(event) => {
                self.deliver(event);
                Some(event)
            }
            Err(RecvTimeoutError::Timeout | RecvTimeoutError::Disconnected) => None,
        }
    }

    fn deliver(&self, event: LifecycleEvent) {
        match event {
            LifecycleEvent::Started => self.handler.on_started(),
            LifecycleEvent::StartFailed => self.handler.on_start_failed(),
            LifecycleEvent::Stopped => self.handler.on_stopped(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;
    use std::thread::{self, ThreadId};

    struct Recorder {
        seen: Rc<RefCell<Vec<(LifecycleEvent, ThreadId)>>>,
    }

    impl Recorder {
        fn record(&self, event: LifecycleEvent) {
            self.seen.borrow_mut().push((event, thread::current().id()));
        }
    }

    impl LifecycleHandler for Recorder {
        fn on_started(&self) {
            self.record(LifecycleEvent::Started);
        }

        fn on_start_failed(&self) {
            self.record(LifecycleEvent::StartFailed);
        }

        fn on_stopped(&self) {
            self.record(LifecycleEvent::Stopped);
        }
    }

    #[test]
    fn test_events_run_on_pumping_thread() {
        let seen = Rc::new(RefCell::new(Vec::new()));
        let (dispatcher, queue) = channel(Box::new(Recorder {
            seen: Rc::clone(&seen),
        }));

        thread::spawn(move || {
            dispatcher.post(LifecycleEvent::Started);
            dispatcher.post(LifecycleEvent::Stopped);
        })
        .join()
        .unwrap();

        // Nothing runs until the controlling thread pumps.
        assert!(seen.borrow().is_empty());
        assert_eq!(queue.pump(), 2);

        let me = thread::current().id();
        assert_eq!(
            *seen.borrow(),
            vec![(LifecycleEvent::Started, me), (LifecycleEvent::Stopped, me)]
        );
    }

    #[test]
    fn test_wait_times_out_without_events() {
        let (_dispatcher, queue) = channel(Box::new(NoopLifecycle));
        assert_eq!(queue.wait(Duration::from_millis(10)), None);
    }

    #[test]
    fn test_wait_delivers_one_event() {
        let seen = Rc::new(RefCell::new(Vec::new()));
        let (dispatcher, queue) = channel(Box::new(Recorder {
            seen: Rc::clone(&seen),
        }));

        dispatcher.post(LifecycleEvent::StartFailed);
        dispatcher.post(LifecycleEvent::Stopped);

        assert_eq!(
            queue.wait(Duration::from_millis(10)),
            Some(LifecycleEvent::StartFailed)
        );
        assert_eq!(seen.borrow().len(), 1);
    }
}
