//! Message queues and the I/O barrier between a block's two task domains.
//!
//! ```text
//!                 I/O-logic messages
//!   app task  ───────────────────────────▶  I/O task ──▶ connection tasks
//!             ◀───────────────────────────
//!                 app-logic messages
//! ```
//!
//! Each direction is an unbounded mpsc channel.  The receiver hands messages
//! out in batches: after the first message arrives it keeps collecting for at
//! most `max_delay`, so bursts are coalesced without unbounded latency.
//!
//! [`IoBarrier`] lets teardown wait until no I/O-side task is in the middle
//! of processing.  I/O work runs under a shared guard; a drain takes the
//! exclusive side once and releases it.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, RwLock, RwLockReadGuard};
use tokio::time::Instant;

/// Most messages handed out per batch.
pub const MAX_BATCH: usize = 256;

pub fn message_queue<T>(max_delay: Duration) -> (MessageSender<T>, MessageReceiver<T>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (
        MessageSender { tx },
        MessageReceiver {
            rx,
            max_delay,
            pending: Vec::new(),
        },
    )
}

#[derive(Debug)]
pub struct MessageSender<T> {
    tx: mpsc::UnboundedSender<T>,
}

impl<T> Clone for MessageSender<T> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
        }
    }
}

impl<T> MessageSender<T> {
    /// Queue `msg`; false if the receiving task has exited.
    pub fn post(&self, msg: T) -> bool {
        self.tx.send(msg).is_ok()
    }
}

#[derive(Debug)]
pub struct MessageReceiver<T> {
    rx: mpsc::UnboundedReceiver<T>,
    max_delay: Duration,
    /// Messages collected by a call that was cancelled mid-batch.
    pending: Vec<T>,
}

impl<T> MessageReceiver<T> {
    /// Wait for at least one message, then gather whatever else arrives
    /// within `max_delay`.  `None` once every sender is gone and the queue is
    /// empty.
    ///
    /// Cancel-safe: messages already pulled off the channel are kept and
    /// returned by the next call.
    pub async fn next_batch(&mut self) -> Option<Vec<T>> {
        if self.pending.is_empty() {
            let first = self.rx.recv().await?;
            self.pending.push(first);
        }
        let deadline = Instant::now() + self.max_delay;

        while self.pending.len() < MAX_BATCH {
            match self.rx.try_recv() {
                Ok(msg) => {
                    self.pending.push(msg);
                    continue;
                }
                Err(mpsc::error::TryRecvError::Disconnected) => break,
                Err(mpsc::error::TryRecvError::Empty) => {}
            }
            match tokio::time::timeout_at(deadline, self.rx.recv()).await {
                Ok(Some(msg)) => self.pending.push(msg),
                Ok(None) | Err(_) => break,
            }
        }
        Some(std::mem::take(&mut self.pending))
    }
}

// ---------------------------------------------------------------------------
// Barrier
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default)]
pub struct IoBarrier {
    lock: Arc<RwLock<()>>,
}

impl IoBarrier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark the start of a unit of I/O-side work; it ends when the guard
    /// drops.  Never hold the guard across a socket await.
    pub async fn enter(&self) -> RwLockReadGuard<'_, ()> {
        self.lock.read().await
    }

    /// Wait until every unit of work in progress has finished.  Work that
    /// starts after the call is queued behind it.
    pub async fn drain(&self) {
        drop(self.lock.write().await);
    }
}
