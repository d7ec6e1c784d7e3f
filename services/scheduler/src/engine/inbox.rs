//! Bounded inboxes feeding the event loop.
//!
//! Request paths must never wait on the engine, so every producer-side send
//! is a `try_send`: a full inbox rejects the message and counts it instead
//! of applying backpressure to the caller.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc;

use super::EngineError;

/// Event kinds with a dedicated inbox.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InboxKind {
    Arrivals,
    Completions,
    Admin,
}

impl fmt::Display for InboxKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            InboxKind::Arrivals => "arrivals",
            InboxKind::Completions => "completions",
            InboxKind::Admin => "admin",
        })
    }
}

/// Producer side of an inbox.
pub struct InboxSender<M> {
    tx: mpsc::Sender<M>,
    kind: InboxKind,
    rejected: Arc<AtomicU64>,
}

impl<M> Clone for InboxSender<M> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            kind: self.kind,
            rejected: Arc::clone(&self.rejected),
        }
    }
}

impl<M> InboxSender<M> {
    /// Enqueue without waiting.
    pub fn try_send(&self, msg: M) -> Result<(), EngineError> {
        self.tx.try_send(msg).map_err(|e| {
            self.rejected.fetch_add(1, Ordering::Relaxed);
            match e {
                mpsc::error::TrySendError::Full(_) => EngineError::InboxFull { kind: self.kind },
                mpsc::error::TrySendError::Closed(_) => EngineError::Stopped,
            }
        })
    }

    /// Enqueue, waiting for capacity. Only for administrative callers.
    pub async fn send(&self, msg: M) -> Result<(), EngineError> {
        self.tx.send(msg).await.map_err(|_| EngineError::Stopped)
    }

    pub fn kind(&self) -> InboxKind {
        self.kind
    }

    /// Messages rejected since the inbox was created.
    pub fn rejected(&self) -> u64 {
        self.rejected.load(Ordering::Relaxed)
    }
}

/// Create a bounded inbox.
pub fn inbox<M>(kind: InboxKind, capacity: usize) -> (InboxSender<M>, mpsc::Receiver<M>) {
    let (tx, rx) = mpsc::channel(capacity);
    (
        InboxSender {
            tx,
            kind,
            rejected: Arc::new(AtomicU64::new(0)),
        },
        rx,
    )
}
