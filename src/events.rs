//! Observable streams used to surface asynchronous outcomes to callers.
//!
//! Every pool and pipeline owns an [`EventSink`] and hands out clones of the matching
//! [`EventStream`]. All clones of a stream share the same underlying queue: readers compete
//! for items rather than each seeing every item.
use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::warn;

/// The kind of resource an asynchronous error originated from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceKind {
    Connection,
    Channel,
    Publisher,
    Consumer,
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Connection => write!(f, "connection"),
            Self::Channel => write!(f, "channel"),
            Self::Publisher => write!(f, "publisher"),
            Self::Consumer => write!(f, "consumer"),
        }
    }
}

/// An error surfaced on one of the `errors()` streams.
#[derive(Debug, Clone)]
pub struct ResourceError {
    pub kind: ResourceKind,
    /// The pooled resource the error is about, if it concerns a single one.
    pub resource_id: Option<u64>,
    pub error: Arc<anyhow::Error>,
}

impl ResourceError {
    pub fn new(kind: ResourceKind, resource_id: Option<u64>, error: anyhow::Error) -> Self {
        Self {
            kind,
            resource_id,
            error: Arc::new(error),
        }
    }
}

impl fmt::Display for ResourceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.resource_id {
            Some(id) => write!(f, "{} {}: {:#}", self.kind, id, self.error),
            None => write!(f, "{}: {:#}", self.kind, self.error),
        }
    }
}

impl std::error::Error for ResourceError {}

/// The reading side of an event queue.
pub struct EventStream<T> {
    receiver: Arc<tokio::sync::Mutex<mpsc::Receiver<T>>>,
}

impl<T> Clone for EventStream<T> {
    fn clone(&self) -> Self {
        Self {
            receiver: Arc::clone(&self.receiver),
        }
    }
}

impl<T> EventStream<T> {
    pub(crate) fn from_receiver(receiver: mpsc::Receiver<T>) -> Self {
        Self {
            receiver: Arc::new(tokio::sync::Mutex::new(receiver)),
        }
    }

    /// Wait for the next event.
    ///
    /// Returns `None` once the emitter is gone and the queue is empty.
    pub async fn recv(&self) -> Option<T> {
        self.receiver.lock().await.recv().await
    }

    /// Take the next event if one is ready.
    ///
    /// Returns `None` when the queue is empty or another reader is currently waiting on it.
    pub fn try_recv(&self) -> Option<T> {
        self.receiver.try_lock().ok()?.try_recv().ok()
    }
}

/// The emitting side of an error stream.
///
/// Emitting never blocks: when a stream is full the event is dropped, logged and counted.
pub(crate) struct EventSink<T> {
    sender: mpsc::Sender<T>,
    forwards: Mutex<Vec<mpsc::Sender<T>>>,
    dropped: AtomicU64,
}

impl<T: Clone + fmt::Display> EventSink<T> {
    pub(crate) fn new(capacity: usize) -> (Self, EventStream<T>) {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        let sink = Self {
            sender,
            forwards: Mutex::new(Vec::new()),
            dropped: AtomicU64::new(0),
        };
        (sink, EventStream::from_receiver(receiver))
    }

    /// Also deliver every future event to `sender`.
    pub(crate) fn forward_to(&self, sender: mpsc::Sender<T>) {
        self.forwards.lock().push(sender);
    }

    /// A sender feeding this sink's own stream.
    pub(crate) fn sender(&self) -> mpsc::Sender<T> {
        self.sender.clone()
    }

    pub(crate) fn emit(&self, event: T) {
        let forwards = self.forwards.lock().clone();
        for forward in forwards {
            self.try_send(&forward, event.clone());
        }
        self.try_send(&self.sender, event);
    }

    fn try_send(&self, sender: &mpsc::Sender<T>, event: T) {
        match sender.try_send(event) {
            Ok(()) => {}
            Err(TrySendError::Full(event)) => {
                let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                warn!(dropped, "Event stream is full, dropping event: {}", event);
            }
            // Nobody is listening anymore.
            Err(TrySendError::Closed(_)) => {}
        }
    }

    pub(crate) fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}
