//! Server block: a listener plus every control connection it has accepted.
//!
//! The acceptor task hands new streams to the I/O task, which owns the
//! connection map.  The app task only purges closed handles once a barrier
//! drain shows nothing is still touching them.  `stop` runs the same
//! STOP / CLOSE / NOOP handshake as the client block.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::bridge::{message_queue, IoBarrier, MessageReceiver, MessageSender};
use crate::client_block::PURGE_HWM;
use crate::config::ServerConfig;
use crate::connection::{
    saturating_dec, ConnCommand, ConnFlags, ConnHandle, ConnSerial, ConnectionObserver,
};
use crate::data_txn::{DataCloseHandler, DataMgrId};
use crate::error::{is_fd_exhausted, FtpError};
use crate::server_conn::{run_server_connection, ServerConnContext, ServerSettings};
use crate::stats::{lock, ServerStats, SharedStats};

/// Pause after a failed accept so descriptor exhaustion doesn't spin.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Control and app side → I/O task.
#[derive(Debug)]
pub enum IoLogicMessage {
    /// Refuse further connections.
    Stop(oneshot::Sender<()>),
    /// Close every accepted connection.
    Close(oneshot::Sender<()>),
    /// Flushes the queue; the ack carries the handles awaiting purge.
    Noop(oneshot::Sender<Vec<ConnHandle>>),
    /// A connection the acceptor task just took.
    Accept(TcpStream, SocketAddr),
    CloseNotification(ConnSerial),
    DataClose(ConnSerial, DataMgrId),
}

/// I/O side → app task.
#[derive(Debug)]
pub enum AppLogicMessage {
    Purge(Vec<ConnHandle>),
}

struct ServerShared {
    name: String,
    stats: SharedStats<ServerStats>,
    active: AtomicU32,
    running: AtomicBool,
    io_tx: MessageSender<IoLogicMessage>,
    app_tx: MessageSender<AppLogicMessage>,
}

impl ServerShared {
    fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    fn account_close(&self, flags: &ConnFlags) {
        if ConnFlags::claim(&flags.complete) {
            saturating_dec(&self.active);
            let mut stats = lock(&self.stats);
            stats.active_control_connections = stats.active_control_connections.saturating_sub(1);
        }
    }
}

impl ConnectionObserver for ServerShared {
    fn connection_opened(&self, _serial: ConnSerial, flags: &ConnFlags) {
        if ConnFlags::claim(&flags.complete) {
            return;
        }
        self.active.fetch_add(1, Ordering::AcqRel);
        let mut stats = lock(&self.stats);
        stats.total_control_connections += 1;
        stats.active_control_connections += 1;
    }

    fn connection_closed(&self, serial: ConnSerial, flags: &ConnFlags) {
        self.account_close(flags);
        if self.is_running() {
            self.io_tx.post(IoLogicMessage::CloseNotification(serial));
        }
    }
}

struct ServerIoLogic {
    shared: Arc<ServerShared>,
    config: Arc<ServerConfig>,
    settings: Arc<ServerSettings>,
    barrier: IoBarrier,
    conns: HashMap<ConnSerial, ConnHandle>,
    pending_purge: Vec<ConnHandle>,
    next_serial: ConnSerial,
}

impl ServerIoLogic {
    fn new(shared: Arc<ServerShared>, config: Arc<ServerConfig>, barrier: IoBarrier) -> Self {
        Self {
            shared,
            settings: Arc::new(ServerSettings::from_config(&config)),
            config,
            barrier,
            conns: HashMap::new(),
            pending_purge: Vec::new(),
            next_serial: 0,
        }
    }

    fn handle(&mut self, msg: IoLogicMessage) {
        match msg {
            IoLogicMessage::Stop(ack) => {
                self.shared.running.store(false, Ordering::Release);
                for handle in self.conns.values() {
                    handle.send(ConnCommand::PurgeTimers);
                }
                let _ = ack.send(());
            }
            IoLogicMessage::Close(ack) => {
                log::info!(
                    "[block {}] closing {} connections",
                    self.shared.name,
                    self.conns.len()
                );
                let handles: Vec<ConnHandle> = self.conns.drain().map(|(_, h)| h).collect();
                for handle in handles {
                    if ConnFlags::take(&handle.flags.notify_close) {
                        self.shared.account_close(&handle.flags);
                    }
                    handle.send(ConnCommand::PurgeTimers);
                    handle.send(ConnCommand::Close);
                    self.pending_purge.push(handle);
                }
                let _ = ack.send(());
            }
            IoLogicMessage::Noop(ack) => {
                let _ = ack.send(std::mem::take(&mut self.pending_purge));
            }
            IoLogicMessage::Accept(stream, peer) => self.accept(stream, peer),
            IoLogicMessage::CloseNotification(serial) => {
                if let Some(handle) = self.conns.remove(&serial) {
                    self.pending_purge.push(handle);
                    if self.pending_purge.len() >= PURGE_HWM && self.shared.is_running() {
                        let batch = std::mem::take(&mut self.pending_purge);
                        self.shared.app_tx.post(AppLogicMessage::Purge(batch));
                    }
                }
            }
            IoLogicMessage::DataClose(serial, id) => match self.conns.get(&serial) {
                Some(handle) => {
                    handle.send(ConnCommand::DataClose(id));
                }
                None => log::debug!(
                    "[block {}] data close for departed conn {serial}",
                    self.shared.name
                ),
            },
        }
    }

    fn accept(&mut self, stream: TcpStream, peer: SocketAddr) {
        if !self.shared.is_running() {
            log::debug!("[block {}] refusing {peer}: stopped", self.shared.name);
            return;
        }
        let max = self.config.max_simultaneous_clients;
        if max > 0 && self.conns.len() >= max as usize {
            log::info!("[block {}] refusing {peer}: {max} clients already", self.shared.name);
            return;
        }

        let serial = self.next_serial;
        self.next_serial = self.next_serial.wrapping_add(1);
        let flags = Arc::new(ConnFlags::default());
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let io_tx = self.shared.io_tx.clone();
        let on_data_close: DataCloseHandler = Arc::new(move |id| {
            io_tx.post(IoLogicMessage::DataClose(serial, id));
        });
        let ctx = ServerConnContext {
            serial,
            settings: self.settings.clone(),
            stats: self.shared.stats.clone(),
            barrier: self.barrier.clone(),
            flags: flags.clone(),
            observer: self.shared.clone(),
            on_data_close,
        };
        log::debug!("[block {}] conn {serial} from {peer}", self.shared.name);
        let task = tokio::spawn(run_server_connection(ctx, stream, cmd_rx));
        self.conns
            .insert(serial, ConnHandle::new(serial, flags, cmd_tx, Some(task)));
    }
}

async fn run_io(mut logic: ServerIoLogic, mut rx: MessageReceiver<IoLogicMessage>) {
    while let Some(batch) = rx.next_batch().await {
        let barrier = logic.barrier.clone();
        let _io = barrier.enter().await;
        for msg in batch {
            logic.handle(msg);
        }
    }
}

async fn run_app(name: String, barrier: IoBarrier, mut rx: MessageReceiver<AppLogicMessage>) {
    while let Some(batch) = rx.next_batch().await {
        for AppLogicMessage::Purge(handles) in batch {
            barrier.drain().await;
            log::trace!("[block {name}] purged {} handles", handles.len());
        }
    }
}

async fn run_acceptor(
    name: String,
    listener: TcpListener,
    io_tx: MessageSender<IoLogicMessage>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            res = listener.accept() => match res {
                Ok((stream, peer)) => {
                    if !io_tx.post(IoLogicMessage::Accept(stream, peer)) {
                        break;
                    }
                }
                Err(e) => {
                    if is_fd_exhausted(&e) {
                        log::error!("[block {name}] accept: out of file descriptors");
                    } else {
                        log::warn!("[block {name}] accept failed: {e}");
                    }
                    tokio::time::sleep(ACCEPT_BACKOFF).await;
                }
            },
        }
    }
    log::debug!("[block {name}] acceptor exited");
}

struct Acceptor {
    local_addr: SocketAddr,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

/// A listener and the control connections it accepted.  Mirrors
/// [`ClientBlock`](crate::ClientBlock): an I/O task owns the connections, an
/// app task purges them, and `stop` runs the same handshake.
pub struct ServerBlock {
    config: Arc<ServerConfig>,
    shared: Arc<ServerShared>,
    barrier: IoBarrier,
    acceptor: Mutex<Option<Acceptor>>,
    io_task: JoinHandle<()>,
    app_task: JoinHandle<()>,
}

impl ServerBlock {
    /// Build a stopped block.  Must be called inside a tokio runtime.
    pub fn new(config: ServerConfig) -> Result<Self, FtpError> {
        config.validate()?;
        let config = Arc::new(config);
        let (io_tx, io_rx) = message_queue(config.message_delay);
        let (app_tx, app_rx) = message_queue(config.message_delay);
        let shared = Arc::new(ServerShared {
            name: config.name.clone(),
            stats: SharedStats::default(),
            active: AtomicU32::new(0),
            running: AtomicBool::new(false),
            io_tx,
            app_tx,
        });
        let barrier = IoBarrier::new();
        let logic = ServerIoLogic::new(shared.clone(), config.clone(), barrier.clone());
        let io_task = tokio::spawn(run_io(logic, io_rx));
        let app_task = tokio::spawn(run_app(config.name.clone(), barrier.clone(), app_rx));
        log::info!("[block {}] created on {}", config.name, config.bind_addr);
        Ok(Self {
            config,
            shared,
            barrier,
            acceptor: Mutex::new(None),
            io_task,
            app_task,
        })
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn stats(&self) -> ServerStats {
        lock(&self.shared.stats).clone()
    }

    pub fn is_running(&self) -> bool {
        self.shared.is_running()
    }

    /// Accepted connections not yet closed.
    pub fn active_connections(&self) -> u32 {
        self.shared.active.load(Ordering::Acquire)
    }

    /// Address the listener is bound to, while running.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        lock(&self.acceptor).as_ref().map(|a| a.local_addr)
    }

    /// Bind the listener and start accepting.  Returns the bound address.
    pub async fn start(&self) -> Result<SocketAddr, FtpError> {
        if let Some(addr) = self.local_addr() {
            return Ok(addr);
        }
        let listener = TcpListener::bind(self.config.bind_addr).await?;
        let local_addr = listener.local_addr()?;
        log::info!("[block {}] listening on {local_addr}", self.name());

        self.shared.running.store(true, Ordering::Release);
        let cancel = CancellationToken::new();
        let task = tokio::spawn(run_acceptor(
            self.config.name.clone(),
            listener,
            self.shared.io_tx.clone(),
            cancel.clone(),
        ));
        *lock(&self.acceptor) = Some(Acceptor {
            local_addr,
            cancel,
            task,
        });
        Ok(local_addr)
    }

    /// Close the listener and every accepted connection.
    pub async fn stop(&self) -> Result<(), FtpError> {
        log::info!("[block {}] stopping", self.name());
        let acceptor = lock(&self.acceptor).take();
        if let Some(acceptor) = acceptor {
            acceptor.cancel.cancel();
            let _ = acceptor.task.await;
        }

        self.ask(IoLogicMessage::Stop).await?;
        self.barrier.drain().await;

        self.ask(IoLogicMessage::Close).await?;
        self.barrier.drain().await;

        let purge = self.ask(IoLogicMessage::Noop).await?;
        self.barrier.drain().await;

        self.barrier.drain().await;
        drop(purge);
        log::info!("[block {}] stopped", self.name());
        Ok(())
    }

    async fn ask<R>(
        &self,
        make: impl FnOnce(oneshot::Sender<R>) -> IoLogicMessage,
    ) -> Result<R, FtpError> {
        let stopped = || FtpError::BlockStopped(self.config.name.clone());
        let (tx, rx) = oneshot::channel();
        if !self.shared.io_tx.post(make(tx)) {
            return Err(stopped());
        }
        rx.await.map_err(|_| stopped())
    }
}

impl Drop for ServerBlock {
    fn drop(&mut self) {
        if let Some(acceptor) = lock(&self.acceptor).take() {
            acceptor.cancel.cancel();
            acceptor.task.abort();
        }
        self.io_task.abort();
        self.app_task.abort();
    }
}
