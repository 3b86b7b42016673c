//! Client block: a pool of client control connections held at the load the
//! profile asks for.
//!
//! ```text
//!                 SchedulerCommand
//!   ClientBlock ──────────────────▶ app task (scheduler + strategy)
//!       │                              │  ▲
//!       │ IoLogicMessage               │  │ AppLogicMessage
//!       ▼                              ▼  │
//!   I/O task (conn map, aging queue, purge list) ──spawn/close──▶ connection tasks
//!       ▲                                                             │
//!       └───────────────── close notifications ◀─────────────────────┘
//! ```
//!
//! The app task decides how much load is wanted.  The I/O task owns every
//! connection handle and is the only place connections are spawned or
//! reaped.  Stopping runs a four-step handshake (STOP, CLOSE, NOOP, final
//! drain) with an [`IoBarrier`] drain after each step, so no handle is
//! dropped while a connection task is still working on it.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use tokio::net::TcpSocket;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use crate::aging::AgingQueue;
use crate::bridge::{message_queue, IoBarrier, MessageReceiver, MessageSender};
use crate::client_conn::{run_client_connection, ClientConnContext, ClientSettings};
use crate::config::{ClientConfig, LoadType};
use crate::connection::{
    saturating_dec, ConnCommand, ConnFlags, ConnHandle, ConnSerial, ConnectionObserver,
};
use crate::data_txn::{DataCloseHandler, DataMgrId};
use crate::error::{is_fd_exhausted, FtpError};
use crate::load_profile::LoadProfile;
use crate::load_strategy::{
    bandwidth_target, make_strategy, LoadControl, LoadStrategy, MAX_AVAILABLE_OUT,
};
use crate::scheduler::{LoadScheduler, RAMP_QUANTUM};
use crate::stats::{lock, ClientStats, SharedStats};

/// Closed handles held before the app task is asked to drain and drop them.
pub const PURGE_HWM: usize = 128;

/// App task → I/O task.
#[derive(Debug)]
pub enum IoLogicMessage {
    /// Stop spawning; acked once the I/O side has seen it.
    Stop(oneshot::Sender<()>),
    /// Close every live connection.
    Close(oneshot::Sender<()>),
    /// Flushes the queue; the ack carries the handles awaiting purge.
    Noop(oneshot::Sender<Vec<ConnHandle>>),
    /// Connections the profile wants open right now.
    IntendedLoad(u32),
    /// New connections the strategy allows this tick.
    AvailableLoad(u32),
    SetDynamicLoad(i32),
    EnableDynamicLoad(bool),
    CloseNotification(ConnSerial),
    DataClose(ConnSerial, DataMgrId),
}

/// I/O side → app task.
#[derive(Debug)]
pub enum AppLogicMessage {
    CloseNotification(ConnSerial),
    Purge(Vec<ConnHandle>),
}

#[derive(Debug)]
enum SchedulerCommand {
    Start,
    Stop(oneshot::Sender<()>),
    EnableDynamic(bool),
}

/// Connection population, shared between the I/O task and connection tasks.
#[derive(Debug, Default)]
pub struct BlockCounters {
    pub attempted: AtomicU32,
    pub pending: AtomicU32,
    pub active: AtomicU32,
}

impl BlockCounters {
    /// Connections either connecting or open.
    pub fn live(&self) -> u32 {
        self.pending.load(Ordering::Acquire) + self.active.load(Ordering::Acquire)
    }
}

// ---------------------------------------------------------------------------
// Shared state
// ---------------------------------------------------------------------------

struct ClientShared {
    name: String,
    stats: SharedStats<ClientStats>,
    counters: BlockCounters,
    running: AtomicBool,
    dynamic_enabled: AtomicBool,
    available_out: AtomicU32,
    io_tx: MessageSender<IoLogicMessage>,
    app_tx: MessageSender<AppLogicMessage>,
}

impl ClientShared {
    fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    fn dynamic(&self) -> bool {
        self.dynamic_enabled.load(Ordering::Acquire)
    }
}

impl ConnectionObserver for ClientShared {
    fn connection_opened(&self, serial: ConnSerial, flags: &ConnFlags) {
        if ConnFlags::claim(&flags.complete) {
            log::debug!("[block {}] conn {serial} opened after being reaped", self.name);
            return;
        }
        saturating_dec(&self.counters.pending);
        self.counters.active.fetch_add(1, Ordering::AcqRel);
        let mut stats = lock(&self.stats);
        stats.successful_connections += 1;
        stats.active_connections += 1;
    }

    fn connection_closed(&self, serial: ConnSerial, flags: &ConnFlags) {
        let was_open = ConnFlags::claim(&flags.complete);
        {
            let mut stats = lock(&self.stats);
            if was_open {
                saturating_dec(&self.counters.active);
                stats.active_connections = stats.active_connections.saturating_sub(1);
            } else {
                saturating_dec(&self.counters.pending);
                if ConnFlags::get(&flags.connected) {
                    stats.successful_connections += 1;
                } else {
                    stats.unsuccessful_connections += 1;
                }
            }
        }
        if self.is_running() {
            self.io_tx.post(IoLogicMessage::CloseNotification(serial));
            self.app_tx.post(AppLogicMessage::CloseNotification(serial));
        }
    }
}

impl LoadControl for ClientShared {
    fn set_intended_load(&self, load: u32) {
        if self.dynamic() {
            return;
        }
        self.io_tx.post(IoLogicMessage::IntendedLoad(load));
    }

    fn set_available_load(&self, load: u32) -> bool {
        if self.dynamic() {
            return true;
        }
        let reserved = self
            .available_out
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < MAX_AVAILABLE_OUT).then_some(n + 1)
            })
            .is_ok();
        if reserved && !self.io_tx.post(IoLogicMessage::AvailableLoad(load)) {
            saturating_dec(&self.available_out);
            return false;
        }
        reserved
    }
}

// ---------------------------------------------------------------------------
// I/O side
// ---------------------------------------------------------------------------

struct ClientIoLogic {
    shared: Arc<ClientShared>,
    config: Arc<ClientConfig>,
    barrier: IoBarrier,
    conns: HashMap<ConnSerial, ConnHandle>,
    aging: AgingQueue<ConnSerial>,
    pending_purge: Vec<ConnHandle>,
    next_serial: ConnSerial,
    next_endpoint: usize,
    intended: u32,
    dynamic_load: i32,
}

impl ClientIoLogic {
    fn new(shared: Arc<ClientShared>, config: Arc<ClientConfig>, barrier: IoBarrier) -> Self {
        Self {
            shared,
            dynamic_load: config.dynamic_load,
            config,
            barrier,
            conns: HashMap::new(),
            aging: AgingQueue::new(),
            pending_purge: Vec::new(),
            next_serial: 0,
            next_endpoint: 0,
            intended: 0,
        }
    }

    fn name(&self) -> &str {
        &self.shared.name
    }

    fn handle(&mut self, msg: IoLogicMessage) {
        match msg {
            IoLogicMessage::Stop(ack) => {
                self.shared.running.store(false, Ordering::Release);
                for handle in self.conns.values() {
                    handle.send(ConnCommand::PurgeTimers);
                }
                let counters = &self.shared.counters;
                counters.attempted.store(0, Ordering::Release);
                counters.pending.store(0, Ordering::Release);
                self.shared.available_out.store(0, Ordering::Release);
                self.intended = 0;
                let _ = ack.send(());
            }
            IoLogicMessage::Close(ack) => {
                log::info!("[block {}] closing {} connections", self.name(), self.conns.len());
                let handles: Vec<ConnHandle> = self.conns.drain().map(|(_, h)| h).collect();
                for handle in handles {
                    self.retire(handle, false);
                }
                self.aging.clear();
                self.shared.counters.active.store(0, Ordering::Release);
                self.shared.counters.pending.store(0, Ordering::Release);
                lock(&self.shared.stats).active_connections = 0;
                let _ = ack.send(());
            }
            IoLogicMessage::Noop(ack) => {
                let _ = ack.send(std::mem::take(&mut self.pending_purge));
            }
            IoLogicMessage::IntendedLoad(load) => {
                if self.shared.is_running() && !self.shared.dynamic() {
                    self.set_intended(load);
                }
            }
            IoLogicMessage::AvailableLoad(load) => {
                saturating_dec(&self.shared.available_out);
                if self.shared.is_running() && !self.shared.dynamic() {
                    self.spawn_connections(load);
                }
            }
            IoLogicMessage::SetDynamicLoad(load) => {
                if load < 0 {
                    log::warn!("[block {}] ignoring negative dynamic load {load}", self.name());
                    return;
                }
                self.dynamic_load = load;
                if self.shared.is_running() && self.shared.dynamic() {
                    self.apply_dynamic_load();
                }
            }
            IoLogicMessage::EnableDynamicLoad(enable) => {
                if enable && self.shared.is_running() {
                    self.apply_dynamic_load();
                }
            }
            IoLogicMessage::CloseNotification(serial) => {
                if let Some(handle) = self.conns.remove(&serial) {
                    self.aging.erase(serial);
                    self.pending_purge.push(handle);
                    self.maybe_purge();
                }
            }
            IoLogicMessage::DataClose(serial, id) => match self.conns.get(&serial) {
                Some(handle) => {
                    handle.send(ConnCommand::DataClose(id));
                }
                None => log::debug!(
                    "[block {}] data close for departed conn {serial}",
                    self.name()
                ),
            },
        }
    }

    fn set_intended(&mut self, load: u32) {
        self.intended = load;
        lock(&self.shared.stats).intended_load = i64::from(load);
        let live = self.shared.counters.live();
        if load > live {
            self.spawn_connections(load - live);
        } else if load < live {
            self.reap_connections(live - load);
        }
    }

    fn apply_dynamic_load(&mut self) {
        let target = bandwidth_target(
            i64::from(self.dynamic_load),
            self.config.bandwidth_per_connection,
        );
        log::debug!(
            "[block {}] dynamic load {} → {target} connections",
            self.name(),
            self.dynamic_load
        );
        if target == 0 {
            self.intended = 0;
            lock(&self.shared.stats).intended_load = 0;
            self.reap_connections(u32::MAX);
        } else {
            self.set_intended(target);
        }
    }

    // -----------------------------------------------------------------------
    // Spawning
    // -----------------------------------------------------------------------

    fn can_spawn(&self) -> bool {
        let limits = &self.config.load;
        let counters = &self.shared.counters;
        if limits.max_connections_attempted > 0
            && counters.attempted.load(Ordering::Acquire) >= limits.max_connections_attempted
        {
            return false;
        }
        if limits.max_open_connections > 0 && counters.live() >= limits.max_open_connections {
            return false;
        }
        true
    }

    /// Start up to `n` connections, or `n` transactions' worth in the
    /// transactions-per-time mode.
    fn spawn_connections(&mut self, n: u32) {
        let load_type = self.config.load.load_type;
        let per_server = self.config.max_transactions_per_server.max(1);
        let mut quota = n;
        while quota > 0 && self.can_spawn() {
            let (batch, max_tx) = match load_type {
                LoadType::Transactions => (1, 1),
                LoadType::TransactionsPerTimeUnit => {
                    let batch = quota.min(per_server);
                    (batch, batch)
                }
                _ => (1, per_server),
            };
            if !self.spawn_one(max_tx) {
                break;
            }
            quota -= batch;
        }
    }

    fn make_socket(&mut self) -> std::io::Result<TcpSocket> {
        let server = self.config.server_addr;
        let socket = if server.is_ipv4() {
            TcpSocket::new_v4()?
        } else {
            TcpSocket::new_v6()?
        };
        let locals = &self.config.local_addrs;
        if !locals.is_empty() {
            let ip = locals[self.next_endpoint % locals.len()];
            self.next_endpoint = self.next_endpoint.wrapping_add(1);
            socket.bind(SocketAddr::new(ip, 0))?;
        }
        Ok(socket)
    }

    fn data_close_handler(&self, serial: ConnSerial) -> DataCloseHandler {
        let io_tx = self.shared.io_tx.clone();
        Arc::new(move |id| {
            io_tx.post(IoLogicMessage::DataClose(serial, id));
        })
    }

    fn spawn_one(&mut self, max_transactions: u32) -> bool {
        let socket = match self.make_socket() {
            Ok(s) => s,
            Err(e) => {
                if is_fd_exhausted(&e) {
                    log::error!("[block {}] out of file descriptors", self.name());
                } else {
                    log::info!("[block {}] cannot create socket: {e}", self.name());
                }
                lock(&self.shared.stats).unsuccessful_connections += 1;
                return false;
            }
        };

        let serial = self.next_serial;
        self.next_serial = self.next_serial.wrapping_add(1);
        let flags = Arc::new(ConnFlags::default());
        ConnFlags::set(&flags.pending, true);
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();

        let ctx = ClientConnContext {
            serial,
            server_addr: self.config.server_addr,
            settings: Arc::new(ClientSettings::from_config(&self.config, max_transactions)),
            stats: self.shared.stats.clone(),
            barrier: self.barrier.clone(),
            flags: flags.clone(),
            observer: self.shared.clone(),
            on_data_close: self.data_close_handler(serial),
        };

        let counters = &self.shared.counters;
        counters.attempted.fetch_add(1, Ordering::AcqRel);
        counters.pending.fetch_add(1, Ordering::AcqRel);
        lock(&self.shared.stats).attempted_connections += 1;

        let task = tokio::spawn(run_client_connection(ctx, socket, cmd_rx));
        self.insert(ConnHandle::new(serial, flags, cmd_tx, Some(task)));
        true
    }

    fn insert(&mut self, handle: ConnHandle) {
        self.aging.push(handle.serial);
        self.conns.insert(handle.serial, handle);
    }

    // -----------------------------------------------------------------------
    // Reaping
    // -----------------------------------------------------------------------

    /// Close the `n` oldest live connections.
    fn reap_connections(&mut self, n: u32) {
        let mut reaped = 0;
        while reaped < n {
            let Some(serial) = self.aging.pop_oldest() else {
                break;
            };
            let Some(handle) = self.conns.remove(&serial) else {
                continue;
            };
            if self.retire(handle, true) {
                reaped += 1;
            }
        }
        if reaped > 0 {
            log::debug!("[block {}] reaped {reaped} connections", self.name());
        }
        self.maybe_purge();
    }

    /// Close `handle` and park it on the purge list.  Returns true if the
    /// connection was still live and this call accounted for it.
    fn retire(&mut self, handle: ConnHandle, notify_app: bool) -> bool {
        self.aging.erase(handle.serial);
        let accounted = ConnFlags::take(&handle.flags.notify_close);
        if accounted {
            let was_open = ConnFlags::claim(&handle.flags.complete);
            let mut stats = lock(&self.shared.stats);
            if was_open {
                saturating_dec(&self.shared.counters.active);
                stats.active_connections = stats.active_connections.saturating_sub(1);
            } else {
                saturating_dec(&self.shared.counters.pending);
                if ConnFlags::get(&handle.flags.pending) {
                    stats.aborted_connections += 1;
                } else if ConnFlags::get(&handle.flags.connected) {
                    stats.successful_connections += 1;
                } else {
                    stats.unsuccessful_connections += 1;
                }
            }
            drop(stats);
            if notify_app && self.shared.is_running() {
                self.shared
                    .app_tx
                    .post(AppLogicMessage::CloseNotification(handle.serial));
            }
        }
        handle.send(ConnCommand::PurgeTimers);
        handle.send(ConnCommand::Close);
        self.pending_purge.push(handle);
        accounted
    }

    fn maybe_purge(&mut self) {
        if self.pending_purge.len() >= PURGE_HWM && self.shared.is_running() {
            let batch = std::mem::take(&mut self.pending_purge);
            self.shared.app_tx.post(AppLogicMessage::Purge(batch));
        }
    }
}

async fn run_io(mut logic: ClientIoLogic, mut rx: MessageReceiver<IoLogicMessage>) {
    while let Some(batch) = rx.next_batch().await {
        let barrier = logic.barrier.clone();
        let _io = barrier.enter().await;
        for msg in batch {
            logic.handle(msg);
        }
    }
}

// ---------------------------------------------------------------------------
// App side
// ---------------------------------------------------------------------------

struct AppContext {
    shared: Arc<ClientShared>,
    config: Arc<ClientConfig>,
    barrier: IoBarrier,
    storing_stop: Arc<AtomicBool>,
    running_tx: Arc<watch::Sender<bool>>,
}

impl AppContext {
    fn new_strategy(&self) -> Box<dyn LoadStrategy> {
        make_strategy(
            self.config.load.load_type,
            self.config.bandwidth_per_connection,
            self.shared.clone(),
        )
    }

    /// Report "stopped" once the profile is done and nothing is left open.
    fn check_deferred_stop(&self) {
        if self.storing_stop.load(Ordering::Acquire) && self.shared.counters.live() == 0 {
            self.storing_stop.store(false, Ordering::Release);
            self.running_tx.send_replace(false);
        }
    }
}

fn state_callback(ctx: &AppContext) -> Box<dyn FnMut(bool) + Send> {
    let shared = ctx.shared.clone();
    let storing_stop = ctx.storing_stop.clone();
    let running_tx = ctx.running_tx.clone();
    Box::new(move |running| {
        if running {
            storing_stop.store(false, Ordering::Release);
            running_tx.send_replace(true);
        } else if shared.counters.live() == 0 {
            running_tx.send_replace(false);
        } else {
            storing_stop.store(true, Ordering::Release);
        }
    })
}

async fn run_app(
    ctx: AppContext,
    mut cmds: mpsc::UnboundedReceiver<SchedulerCommand>,
    mut app_rx: MessageReceiver<AppLogicMessage>,
) {
    let mut strategy = ctx.new_strategy();
    let mut scheduler = LoadScheduler::new(LoadProfile::new(&ctx.config.load), state_callback(&ctx));
    let mut ticker = tokio::time::interval(RAMP_QUANTUM);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            cmd = cmds.recv() => match cmd {
                Some(SchedulerCommand::Start) if !scheduler.is_running() => {
                    strategy = ctx.new_strategy();
                    scheduler.start(Instant::now(), strategy.as_mut());
                }
                Some(SchedulerCommand::Stop(ack)) => {
                    scheduler.stop();
                    let _ = ack.send(());
                }
                Some(SchedulerCommand::EnableDynamic(false)) => strategy.refresh(),
                Some(SchedulerCommand::Start | SchedulerCommand::EnableDynamic(true)) => {}
                None => break,
            },
            batch = app_rx.next_batch() => {
                let Some(batch) = batch else { break };
                for msg in batch {
                    match msg {
                        AppLogicMessage::CloseNotification(_) => {
                            if scheduler.is_running() {
                                strategy.connection_closed();
                            }
                            ctx.check_deferred_stop();
                        }
                        AppLogicMessage::Purge(handles) => {
                            ctx.barrier.drain().await;
                            log::trace!("[block {}] purged {} handles", ctx.shared.name, handles.len());
                            drop(handles);
                        }
                    }
                }
            },
            _ = ticker.tick(), if scheduler.is_running() => {
                scheduler.tick(Instant::now(), strategy.as_mut());
            },
        }
    }
}

// ---------------------------------------------------------------------------
// Block
// ---------------------------------------------------------------------------

pub struct ClientBlock {
    config: Arc<ClientConfig>,
    shared: Arc<ClientShared>,
    barrier: IoBarrier,
    sched_tx: mpsc::UnboundedSender<SchedulerCommand>,
    running_tx: Arc<watch::Sender<bool>>,
    storing_stop: Arc<AtomicBool>,
    io_task: JoinHandle<()>,
    app_task: JoinHandle<()>,
}

impl ClientBlock {
    /// Build a stopped block.  Must be called inside a tokio runtime.
    pub fn new(config: ClientConfig) -> Result<Self, FtpError> {
        config.validate()?;
        let config = Arc::new(config);
        let (io_tx, io_rx) = message_queue(config.message_delay);
        let (app_tx, app_rx) = message_queue(config.message_delay);
        let shared = Arc::new(ClientShared {
            name: config.name.clone(),
            stats: SharedStats::default(),
            counters: BlockCounters::default(),
            running: AtomicBool::new(false),
            dynamic_enabled: AtomicBool::new(config.load.use_dynamic_load),
            available_out: AtomicU32::new(0),
            io_tx,
            app_tx,
        });
        let barrier = IoBarrier::new();
        let (running_tx, _) = watch::channel(false);
        let running_tx = Arc::new(running_tx);
        let storing_stop = Arc::new(AtomicBool::new(false));
        let (sched_tx, sched_rx) = mpsc::unbounded_channel();

        let logic = ClientIoLogic::new(shared.clone(), config.clone(), barrier.clone());
        let io_task = tokio::spawn(run_io(logic, io_rx));
        let app_ctx = AppContext {
            shared: shared.clone(),
            config: config.clone(),
            barrier: barrier.clone(),
            storing_stop: storing_stop.clone(),
            running_tx: running_tx.clone(),
        };
        let app_task = tokio::spawn(run_app(app_ctx, sched_rx, app_rx));

        log::info!("[block {}] created, target {}", config.name, config.server_addr);
        Ok(Self {
            config,
            shared,
            barrier,
            sched_tx,
            running_tx,
            storing_stop,
            io_task,
            app_task,
        })
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn stats(&self) -> ClientStats {
        lock(&self.shared.stats).clone()
    }

    /// True from start until the profile has finished and every connection
    /// has closed, or until `stop`.
    pub fn is_running(&self) -> bool {
        *self.running_tx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.running_tx.subscribe()
    }

    pub fn active_connections(&self) -> u32 {
        self.shared.counters.active.load(Ordering::Acquire)
    }

    pub fn start(&self) -> Result<(), FtpError> {
        if self.shared.is_running() {
            return Ok(());
        }
        log::info!("[block {}] starting", self.name());
        self.shared.running.store(true, Ordering::Release);
        self.send_scheduler(SchedulerCommand::Start)?;
        if self.shared.dynamic() {
            self.post(IoLogicMessage::SetDynamicLoad(self.config.dynamic_load))?;
            self.post(IoLogicMessage::EnableDynamicLoad(true))?;
        }
        Ok(())
    }

    /// Replace the dynamic load (bytes/s).  Negative values are ignored.
    pub fn set_dynamic_load(&self, load: i32) -> Result<(), FtpError> {
        self.post(IoLogicMessage::SetDynamicLoad(load))
    }

    /// Let the dynamic load, rather than the profile, drive the block.
    pub fn enable_dynamic_load(&self, enable: bool) -> Result<(), FtpError> {
        self.shared.dynamic_enabled.store(enable, Ordering::Release);
        self.send_scheduler(SchedulerCommand::EnableDynamic(enable))?;
        self.post(IoLogicMessage::EnableDynamicLoad(enable))
    }

    /// Stop the scheduler and tear every connection down.
    pub async fn stop(&self) -> Result<(), FtpError> {
        log::info!("[block {}] stopping", self.name());
        let (tx, rx) = oneshot::channel();
        self.send_scheduler(SchedulerCommand::Stop(tx))?;
        rx.await.map_err(|_| self.stopped())?;

        self.ask(IoLogicMessage::Stop).await?;
        self.barrier.drain().await;

        self.ask(IoLogicMessage::Close).await?;
        self.barrier.drain().await;

        let purge = self.ask(IoLogicMessage::Noop).await?;
        self.barrier.drain().await;

        self.barrier.drain().await;
        drop(purge);

        self.storing_stop.store(false, Ordering::Release);
        self.running_tx.send_replace(false);
        log::info!("[block {}] stopped", self.name());
        Ok(())
    }

    fn stopped(&self) -> FtpError {
        FtpError::BlockStopped(self.config.name.clone())
    }

    fn post(&self, msg: IoLogicMessage) -> Result<(), FtpError> {
        if self.shared.io_tx.post(msg) {
            Ok(())
        } else {
            Err(self.stopped())
        }
    }

    fn send_scheduler(&self, cmd: SchedulerCommand) -> Result<(), FtpError> {
        self.sched_tx.send(cmd).map_err(|_| self.stopped())
    }

    async fn ask<R>(
        &self,
        make: impl FnOnce(oneshot::Sender<R>) -> IoLogicMessage,
    ) -> Result<R, FtpError> {
        let (tx, rx) = oneshot::channel();
        self.post(make(tx))?;
        rx.await.map_err(|_| self.stopped())
    }
}

impl Drop for ClientBlock {
    fn drop(&mut self) {
        self.io_task.abort();
        self.app_task.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    struct Harness {
        logic: ClientIoLogic,
        app_rx: MessageReceiver<AppLogicMessage>,
        _io_rx: MessageReceiver<IoLogicMessage>,
        cmd_rxs: Vec<mpsc::UnboundedReceiver<ConnCommand>>,
    }

    fn harness(config: ClientConfig) -> Harness {
        let (io_tx, io_rx) = message_queue(Duration::from_millis(1));
        let (app_tx, app_rx) = message_queue(Duration::from_millis(1));
        let shared = Arc::new(ClientShared {
            name: "test".into(),
            stats: SharedStats::default(),
            counters: BlockCounters::default(),
            running: AtomicBool::new(true),
            dynamic_enabled: AtomicBool::new(false),
            available_out: AtomicU32::new(0),
            io_tx,
            app_tx,
        });
        Harness {
            logic: ClientIoLogic::new(shared, Arc::new(config), IoBarrier::new()),
            app_rx,
            _io_rx: io_rx,
            cmd_rxs: Vec::new(),
        }
    }

    impl Harness {
        /// Register a connection without a task behind it.
        fn add(&mut self, opened: bool) -> ConnSerial {
            let serial = self.cmd_rxs.len() as ConnSerial;
            let flags = Arc::new(ConnFlags::default());
            let counters = &self.logic.shared.counters;
            if opened {
                ConnFlags::set(&flags.connected, true);
                ConnFlags::set(&flags.complete, true);
                counters.active.fetch_add(1, Ordering::AcqRel);
            } else {
                ConnFlags::set(&flags.pending, true);
                counters.pending.fetch_add(1, Ordering::AcqRel);
            }
            let (tx, rx) = mpsc::unbounded_channel();
            self.logic.insert(ConnHandle::new(serial, flags, tx, None));
            self.cmd_rxs.push(rx);
            serial
        }

        fn was_closed(&mut self, serial: ConnSerial) -> bool {
            let rx = &mut self.cmd_rxs[serial as usize];
            let mut closed = false;
            while let Ok(cmd) = rx.try_recv() {
                closed |= cmd == ConnCommand::Close;
            }
            closed
        }
    }

    #[test]
    fn reap_closes_oldest_first_regardless_of_state() {
        let mut h = harness(ClientConfig::default());
        for i in 0..26 {
            // A mix of connecting and open connections, A through Z.
            h.add(i % 3 != 1);
        }
        h.logic.reap_connections(5);

        for serial in 0..26 {
            assert_eq!(h.was_closed(serial), serial < 5, "conn {serial}");
        }
        assert_eq!(h.logic.conns.len(), 21);
        assert_eq!(h.logic.aging.iter().next(), Some(&5));
        assert_eq!(h.logic.pending_purge.len(), 5);
        assert_eq!(h.logic.shared.counters.live(), 21);
        // B and E were still connecting.
        assert_eq!(lock(&h.logic.shared.stats).aborted_connections, 2);
    }

    #[test]
    fn reap_skips_connections_that_already_closed() {
        let mut h = harness(ClientConfig::default());
        for _ in 0..4 {
            h.add(true);
        }
        // Conn 0 closed on its own; its notification has not arrived yet.
        let flags = h.logic.conns[&0].flags.clone();
        assert!(ConnFlags::take(&flags.notify_close));
        saturating_dec(&h.logic.shared.counters.active);

        h.logic.reap_connections(2);
        assert!(h.was_closed(1));
        assert!(h.was_closed(2));
        assert!(!h.was_closed(3));
        assert_eq!(h.logic.shared.counters.live(), 1);
    }

    #[test]
    fn lower_intended_load_reaps_the_excess() {
        let mut h = harness(ClientConfig::default());
        for _ in 0..6 {
            h.add(true);
        }
        h.logic.handle(IoLogicMessage::IntendedLoad(4));
        assert_eq!(h.logic.conns.len(), 4);
        assert_eq!(lock(&h.logic.shared.stats).intended_load, 4);
        assert!(h.was_closed(0) && h.was_closed(1) && !h.was_closed(2));
    }

    #[test]
    fn zero_dynamic_load_reaps_everything() {
        let mut h = harness(ClientConfig::default());
        for _ in 0..3 {
            h.add(true);
        }
        h.logic.shared.dynamic_enabled.store(true, Ordering::Release);
        h.logic.handle(IoLogicMessage::SetDynamicLoad(-1));
        assert_eq!(h.logic.conns.len(), 3);
        h.logic.handle(IoLogicMessage::SetDynamicLoad(0));
        assert!(h.logic.conns.is_empty());
        assert_eq!(h.logic.shared.counters.live(), 0);
    }

    #[test]
    fn close_parks_every_handle_and_noop_returns_them() {
        let mut h = harness(ClientConfig::default());
        for i in 0..3 {
            h.add(i == 0);
        }
        let (tx, _rx) = oneshot::channel();
        h.logic.handle(IoLogicMessage::Stop(tx));
        assert!(!h.logic.shared.is_running());

        let (tx, _rx) = oneshot::channel();
        h.logic.handle(IoLogicMessage::Close(tx));
        assert!(h.logic.conns.is_empty());
        assert!(h.logic.aging.is_empty());
        assert_eq!(h.logic.shared.counters.live(), 0);

        let (tx, mut rx) = oneshot::channel();
        h.logic.handle(IoLogicMessage::Noop(tx));
        assert_eq!(rx.try_recv().unwrap().len(), 3);
        assert!(h.logic.pending_purge.is_empty());
    }

    #[tokio::test]
    async fn purge_is_posted_at_the_high_water_mark() {
        let mut h = harness(ClientConfig::default());
        for _ in 0..PURGE_HWM {
            h.add(true);
        }
        for serial in 0..(PURGE_HWM as ConnSerial - 1) {
            h.logic.handle(IoLogicMessage::CloseNotification(serial));
        }
        assert_eq!(h.logic.pending_purge.len(), PURGE_HWM - 1);

        h.logic
            .handle(IoLogicMessage::CloseNotification(PURGE_HWM as ConnSerial - 1));
        assert!(h.logic.pending_purge.is_empty());
        let batch = tokio::time::timeout(Duration::from_secs(1), h.app_rx.next_batch())
            .await
            .unwrap()
            .unwrap();
        match &batch[..] {
            [AppLogicMessage::Purge(handles)] => assert_eq!(handles.len(), PURGE_HWM),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn available_load_grants_are_capped() {
        let h = harness(ClientConfig::default());
        let shared = h.logic.shared.clone();
        assert!(shared.set_available_load(1));
        assert!(shared.set_available_load(1));
        assert!(!shared.set_available_load(1));
        assert_eq!(shared.available_out.load(Ordering::Acquire), MAX_AVAILABLE_OUT);
    }

    #[test]
    fn close_before_open_counts_unsuccessful() {
        let h = harness(ClientConfig::default());
        let shared = h.logic.shared.clone();
        shared.counters.pending.store(1, Ordering::Release);
        let flags = ConnFlags::default();
        shared.connection_closed(9, &flags);
        assert_eq!(lock(&shared.stats).unsuccessful_connections, 1);
        assert_eq!(shared.counters.live(), 0);
        // A late open after the close is ignored.
        shared.connection_opened(9, &flags);
        assert_eq!(shared.counters.active.load(Ordering::Acquire), 0);
    }
}
