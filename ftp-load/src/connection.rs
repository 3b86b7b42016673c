//! Per-connection plumbing shared by client and server control connections.
//!
//! Each control connection runs as one tokio task that owns its socket and
//! state machine.  The owning block keeps a [`ConnHandle`] per task:
//!
//! ```text
//!   block I/O task ──ConnCommand──▶ connection task ──observer──▶ block
//!         │                               │
//!         └──── reads ConnFlags ◀─────────┘ (atomics)
//! ```
//!
//! Nothing else reaches into a connection; a handle whose task has already
//! exited simply drops commands.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::data_txn::DataMgrId;
use crate::socket::{ControlSocket, SocketError};

pub type ConnSerial = u32;

/// Commands a block may send to a running connection task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnCommand {
    /// Tear the connection down (cancels a connect still in progress).
    Close,
    /// Cancel every timer and keep them cancelled.
    PurgeTimers,
    /// A data connection owned by this control connection has closed.
    DataClose(DataMgrId),
}

/// Lifecycle bits the block reads without talking to the task.
#[derive(Debug)]
pub struct ConnFlags {
    /// A connect is in progress.
    pub pending: AtomicBool,
    pub connected: AtomicBool,
    /// The socket is open and the state machine is running.
    pub open: AtomicBool,
    /// The connection has been classified in the block counters.
    pub complete: AtomicBool,
    /// Whoever clears this first accounts for the close: the task on its
    /// own exit, or the block when it reaps.
    pub notify_close: AtomicBool,
}

impl Default for ConnFlags {
    fn default() -> Self {
        Self {
            pending: AtomicBool::new(false),
            connected: AtomicBool::new(false),
            open: AtomicBool::new(false),
            complete: AtomicBool::new(false),
            notify_close: AtomicBool::new(true),
        }
    }
}

impl ConnFlags {
    pub fn get(flag: &AtomicBool) -> bool {
        flag.load(Ordering::Acquire)
    }

    pub fn set(flag: &AtomicBool, value: bool) {
        flag.store(value, Ordering::Release);
    }

    /// Clear `flag`, returning whether this call was the one that cleared
    /// it.  Used where the block and the task race to account for a close.
    pub fn take(flag: &AtomicBool) -> bool {
        flag.swap(false, Ordering::AcqRel)
    }

    /// Set `flag`, returning its previous value.
    pub fn claim(flag: &AtomicBool) -> bool {
        flag.swap(true, Ordering::AcqRel)
    }
}

/// Decrement a population counter, stopping at zero.
pub fn saturating_dec(counter: &AtomicU32) {
    let _ = counter.fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
}

/// Block-side hooks invoked from connection tasks.
pub trait ConnectionObserver: Send + Sync {
    fn connection_opened(&self, serial: ConnSerial, flags: &ConnFlags);
    fn connection_closed(&self, serial: ConnSerial, flags: &ConnFlags);
}

/// The block's view of one connection task.
#[derive(Debug)]
pub struct ConnHandle {
    pub serial: ConnSerial,
    pub flags: Arc<ConnFlags>,
    cmd_tx: mpsc::UnboundedSender<ConnCommand>,
    task: Option<JoinHandle<()>>,
}

impl ConnHandle {
    pub fn new(
        serial: ConnSerial,
        flags: Arc<ConnFlags>,
        cmd_tx: mpsc::UnboundedSender<ConnCommand>,
        task: Option<JoinHandle<()>>,
    ) -> Self {
        Self {
            serial,
            flags,
            cmd_tx,
            task,
        }
    }

    /// Returns false once the task is gone.
    pub fn send(&self, cmd: ConnCommand) -> bool {
        self.cmd_tx.send(cmd).is_ok()
    }

    pub fn is_finished(&self) -> bool {
        self.task.as_ref().map_or(true, JoinHandle::is_finished)
    }
}

/// Write every queued line; stops at the first failure.
pub async fn flush_outbox(
    socket: &mut ControlSocket,
    outbox: Vec<String>,
) -> Result<(), SocketError> {
    for line in outbox {
        socket.write_line(&line).await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_flags_report_close() {
        let flags = ConnFlags::default();
        assert!(ConnFlags::get(&flags.notify_close));
        assert!(!ConnFlags::get(&flags.pending));
        ConnFlags::set(&flags.pending, true);
        assert!(ConnFlags::get(&flags.pending));
    }

    #[test]
    fn take_succeeds_once() {
        let flags = ConnFlags::default();
        assert!(ConnFlags::take(&flags.notify_close));
        assert!(!ConnFlags::take(&flags.notify_close));
        assert!(!ConnFlags::claim(&flags.complete));
        assert!(ConnFlags::claim(&flags.complete));
    }

    #[test]
    fn counter_stops_at_zero() {
        let n = AtomicU32::new(1);
        saturating_dec(&n);
        saturating_dec(&n);
        assert_eq!(n.load(Ordering::Acquire), 0);
    }

    #[tokio::test]
    async fn send_fails_after_task_drops_receiver() {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = ConnHandle::new(1, Arc::default(), tx, None);
        assert!(handle.send(ConnCommand::PurgeTimers));
        drop(rx);
        assert!(!handle.send(ConnCommand::Close));
        assert!(handle.is_finished());
    }
}
