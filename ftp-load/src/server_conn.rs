//! Server control connection.
//!
//! ```text
//!  LOGIN ──PASS──▶ WAITING ──PORT/PASV──▶ XFER_SETUP ──STOR/RETR──▶ DATA
//!                     ▲                                              │
//!                     └──────────── data connection closed ──────────┘
//! ```
//!
//! Incoming lines are queued with a think-time delay before they are
//! dispatched.  QUIT is accepted in every state; it aborts any transfer,
//! replies 200 and closes once the reply is flushed.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use ftp_proto::{
    build_pasv_string, build_status_line, parse_port_string, parse_request_line, Method,
    Request, StatusCode,
};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::bridge::IoBarrier;
use crate::config::{ResponseLatency, ServerConfig, SocketOptions, TxBodyConfig};
use crate::connection::{flush_outbox, ConnCommand, ConnFlags, ConnSerial, ConnectionObserver};
use crate::data_txn::{
    DataCloseHandler, DataConnectionParent, DataMgrId, DataRole, DataTransactionManager,
};
use crate::socket::ControlSocket;
use crate::stats::{lock, ServerStats, SharedStats};
use crate::timer::ConnTimer;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    Login,
    Waiting,
    XferSetup,
    Data,
}

impl fmt::Display for ServerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ServerState::Login => "LOGIN",
            ServerState::Waiting => "WAITING",
            ServerState::XferSetup => "XFER_SETUP",
            ServerState::Data => "DATA",
        })
    }
}

/// Events raised outside the request stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerEvent {
    /// The transaction's data connection finished.
    DataConnClosed,
}

/// Per-connection settings, shared by every connection the block accepts.
#[derive(Debug, Clone)]
pub struct ServerSettings {
    /// PORT/PASV transactions allowed; 0 for unlimited.
    pub max_requests: u32,
    /// Delay applied to each request before it is serviced.
    pub latency: ResponseLatency,
    /// Body sent on RETR.
    pub tx_body: TxBodyConfig,
    /// Options applied to each data socket.
    pub socket_options: SocketOptions,
    /// Idle time after which the server hangs up.
    pub inactivity_timeout: Duration,
    /// Source port for PORT-mode data connections; 0 lets the OS pick.
    pub active_data_port: u16,
}

impl ServerSettings {
    pub fn from_config(cfg: &ServerConfig) -> Self {
        Self {
            max_requests: cfg.max_requests_per_client,
            latency: cfg.response_latency,
            tx_body: cfg.tx_body,
            socket_options: cfg.socket_options.clone(),
            inactivity_timeout: cfg.inactivity_timeout,
            active_data_port: cfg.active_data_port,
        }
    }
}

// ---------------------------------------------------------------------------
// Data link
// ---------------------------------------------------------------------------

/// The server side of [`DataConnectionParent`].
pub struct ServerDataLink {
    addrs: Mutex<(SocketAddr, SocketAddr)>,
    tx_body: TxBodyConfig,
    options: SocketOptions,
    stats: SharedStats<ServerStats>,
}

impl ServerDataLink {
    pub fn new(
        local_ctrl: SocketAddr,
        remote_ctrl: SocketAddr,
        tx_body: TxBodyConfig,
        options: SocketOptions,
        stats: SharedStats<ServerStats>,
    ) -> Self {
        let below = |mut a: SocketAddr| {
            a.set_port(a.port().saturating_sub(1));
            a
        };
        Self {
            addrs: Mutex::new((below(local_ctrl), below(remote_ctrl))),
            tx_body,
            options,
            stats,
        }
    }

    /// Point the next connector at the address a PORT command named.
    pub fn set_remote(&self, addr: SocketAddr) {
        lock(&self.addrs).1 = addr;
    }
}

impl DataConnectionParent for ServerDataLink {
    fn local_data_addr(&self) -> SocketAddr {
        lock(&self.addrs).0
    }
    fn remote_data_addr(&self) -> SocketAddr {
        lock(&self.addrs).1
    }
    fn local_if_name(&self) -> Option<String> {
        self.options.interface.clone()
    }
    fn tx_body_config(&self) -> TxBodyConfig {
        self.tx_body
    }
    fn ipv4_tos(&self) -> u8 {
        self.options.ipv4_tos
    }
    fn ipv6_traffic_class(&self) -> u8 {
        self.options.ipv6_traffic_class
    }
    fn tcp_window_size_limit(&self) -> u32 {
        self.options.tcp_window_size_limit
    }
    fn tcp_delayed_ack(&self) -> bool {
        self.options.tcp_delayed_ack
    }
    fn notify_data_connection_open(&self, _at: Instant) {
        lock(&self.stats).total_data_connections += 1;
    }
    fn notify_data_connection_close(&self, _at: Instant) {}
    fn notify_incremental_tx_bytes(&self, n: u64) {
        lock(&self.stats).goodput_tx_bytes += n;
    }
    fn notify_incremental_rx_bytes(&self, n: u64) {
        lock(&self.stats).goodput_rx_bytes += n;
    }
}

// ---------------------------------------------------------------------------
// State machine
// ---------------------------------------------------------------------------

/// Server control state machine.  Requests are queued with their latency,
/// serviced once due, and answered through `outbox`.
pub struct ServerControl {
    serial: ConnSerial,
    settings: Arc<ServerSettings>,
    stats: SharedStats<ServerStats>,
    state: ServerState,
    link: Arc<ServerDataLink>,
    data_mgrs: HashMap<DataMgrId, DataTransactionManager>,
    active_data: Option<DataMgrId>,
    next_mgr_id: DataMgrId,
    on_data_close: DataCloseHandler,
    passive: bool,
    requests_served: u32,
    transactions_active: u32,
    close_flag: bool,
    queue: VecDeque<(Instant, Vec<u8>)>,
    inactivity_deadline: Option<Instant>,
    timers_purged: bool,
    /// Reply lines waiting to be written, in order.
    pub outbox: Vec<String>,
}

impl ServerControl {
    pub fn new(
        serial: ConnSerial,
        settings: Arc<ServerSettings>,
        local: SocketAddr,
        remote: SocketAddr,
        stats: SharedStats<ServerStats>,
        on_data_close: DataCloseHandler,
    ) -> Self {
        let link = Arc::new(ServerDataLink::new(
            local,
            remote,
            settings.tx_body,
            settings.socket_options.clone(),
            stats.clone(),
        ));
        Self {
            serial,
            settings,
            stats,
            state: ServerState::Login,
            link,
            data_mgrs: HashMap::new(),
            active_data: None,
            next_mgr_id: 0,
            on_data_close,
            passive: false,
            requests_served: 0,
            transactions_active: 0,
            close_flag: false,
            queue: VecDeque::new(),
            inactivity_deadline: None,
            timers_purged: false,
            outbox: Vec::new(),
        }
    }

    pub fn state(&self) -> ServerState {
        self.state
    }

    /// True while a transfer is in progress.
    pub fn is_busy(&self) -> bool {
        self.state == ServerState::Data
    }

    /// Set once QUIT was handled; the task closes after flushing `outbox`.
    pub fn close_requested(&self) -> bool {
        self.close_flag
    }

    pub fn inactivity_deadline(&self) -> Option<Instant> {
        self.inactivity_deadline
    }

    /// Due time of the oldest queued request.
    pub fn queue_deadline(&self) -> Option<Instant> {
        if self.timers_purged {
            return None;
        }
        self.queue.front().map(|(due, _)| *due)
    }

    /// Data manager of the transaction in flight, if any.
    pub fn active_data(&self) -> Option<&DataTransactionManager> {
        self.active_data.and_then(|id| self.data_mgrs.get(&id))
    }

    /// Greet a freshly accepted client.
    pub fn on_open(&mut self, now: Instant) {
        self.restart_inactivity(now);
        self.post(StatusCode::ServiceReady, "");
    }

    /// Queue one complete request line for processing after the think time.
    pub fn queue_line(&mut self, line: Vec<u8>, now: Instant) {
        if !self.is_busy() {
            self.restart_inactivity(now);
        }
        let delay = self.settings.latency.sample(&mut rand::rng());
        self.queue.push_back((now + delay, line));
    }

    /// Process every queued request that is due.  Returns false when the
    /// connection must close.
    pub fn service_queue(&mut self, now: Instant) -> bool {
        while let Some((due, _)) = self.queue.front() {
            if *due > now {
                break;
            }
            let Some((_, line)) = self.queue.pop_front() else {
                break;
            };
            self.service_request(&line, now);
            if self.close_flag {
                return false;
            }
        }
        true
    }

    pub fn process_event(&mut self, event: ServerEvent, now: Instant) {
        match (self.state, event) {
            (ServerState::Data, ServerEvent::DataConnClosed) => {
                self.mark_complete(true);
                self.change_state(ServerState::Waiting);
                self.restart_inactivity(now);
            }
            _ => {}
        }
    }

    /// A data manager reported its close.
    pub fn data_close(&mut self, id: DataMgrId, now: Instant) {
        if self.active_data == Some(id) {
            self.post(StatusCode::ClosingDataConn, "");
            if let Some(mgr) = self.data_mgrs.remove(&id) {
                mgr.shutdown();
            }
            self.active_data = None;
            self.process_event(ServerEvent::DataConnClosed, now);
        } else if let Some(mgr) = self.data_mgrs.remove(&id) {
            mgr.shutdown();
        } else {
            log::error!("[server {}] close for unknown data manager {id}", self.serial);
        }
    }

    /// Always false: an idle client is disconnected.
    pub fn on_inactivity_timeout(&mut self) -> bool {
        log::info!("[server {}] inactivity timeout in {}", self.serial, self.state);
        false
    }

    pub fn purge_timers(&mut self) {
        self.timers_purged = true;
        self.inactivity_deadline = None;
    }

    /// Abort the transfer in flight and release every data connection.
    pub fn finalize(&mut self) {
        self.abort_data_connection();
        for (_, mgr) in self.data_mgrs.drain() {
            mgr.shutdown();
        }
    }

    // -----------------------------------------------------------------------
    // Dispatch
    // -----------------------------------------------------------------------

    fn service_request(&mut self, line: &[u8], now: Instant) {
        let req = match parse_request_line(line) {
            Ok(r) => r,
            Err(e) => {
                log::debug!("[server {}] {e}", self.serial);
                self.post(StatusCode::SyntaxError, "");
                return;
            }
        };
        log::debug!(
            "[server {}] ← {} {:?} state={}",
            self.serial,
            req.token,
            req.argument,
            self.state
        );
        if req.method == Method::Unknown {
            self.post(StatusCode::NotImplemented, "");
            return;
        }
        lock(&self.stats).rx_commands.bump(req.method);
        self.dispatch(&req, now);
    }

    fn dispatch(&mut self, req: &Request, now: Instant) {
        match self.state {
            ServerState::Login => self.login_input(req),
            ServerState::Waiting => self.waiting_input(req),
            ServerState::XferSetup => self.xfer_setup_input(req),
            ServerState::Data => self.data_input(req, now),
        }
    }

    fn login_input(&mut self, req: &Request) {
        match req.method {
            Method::User => self.post(StatusCode::NeedPassword, ""),
            Method::Pass => {
                self.change_state(ServerState::Waiting);
                self.post(StatusCode::UserLoggedIn, "");
            }
            Method::Quit => self.handle_quit(),
            _ => self.post(StatusCode::NotLoggedIn, ""),
        }
    }

    fn waiting_input(&mut self, req: &Request) {
        match req.method {
            Method::User | Method::Pass => self.post(StatusCode::UserLoggedIn, ""),
            Method::Type if req.argument.contains('I') => self.post(StatusCode::Ok, ""),
            Method::Type => self.post(StatusCode::NotImplemented, ""),
            Method::Port => {
                self.mark_attempted();
                if !self.budget_remaining() {
                    self.mark_complete(false);
                    self.post(StatusCode::ActionNotTaken, "");
                    return;
                }
                self.requests_served += 1;
                match parse_port_string(&req.argument) {
                    Ok(addr) => {
                        self.link.set_remote(addr);
                        self.passive = false;
                        self.change_state(ServerState::XferSetup);
                        self.post(StatusCode::Ok, "");
                    }
                    Err(e) => {
                        log::debug!("[server {}] {e}", self.serial);
                        self.mark_complete(false);
                        self.post(StatusCode::SyntaxError, "");
                    }
                }
            }
            Method::Pasv => {
                self.mark_attempted();
                if !self.budget_remaining() {
                    self.mark_complete(false);
                    self.post(StatusCode::ActionNotTaken, "");
                    return;
                }
                self.requests_served += 1;
                self.passive = true;
                match self.make_data_connection(DataRole::Acceptor) {
                    Some(addr) if addr.port() != 0 => {
                        self.change_state(ServerState::XferSetup);
                        self.post(StatusCode::EnteringPassiveMode, &build_pasv_string(&addr));
                    }
                    _ => {
                        log::error!("[server {}] no acceptor for PASV, reply suppressed", self.serial);
                        self.release_active();
                        self.mark_complete(false);
                    }
                }
            }
            Method::Stor | Method::Retr => self.post(StatusCode::ActionNotTaken, ""),
            Method::Quit => self.handle_quit(),
            _ => self.post(StatusCode::NotImplemented, ""),
        }
    }

    fn xfer_setup_input(&mut self, req: &Request) {
        let started = match req.method {
            Method::Stor => {
                self.post(StatusCode::FileStatusOk, "");
                self.start_data(Method::Stor)
            }
            Method::Retr => {
                self.post(StatusCode::FileStatusOk, "");
                self.start_data(Method::Retr)
            }
            Method::Quit => return self.handle_quit(),
            _ => return self.post(StatusCode::ActionNotTaken, ""),
        };
        if started {
            self.inactivity_deadline = None;
            self.change_state(ServerState::Data);
        } else {
            self.mark_complete(false);
            self.change_state(ServerState::Waiting);
            self.post(StatusCode::DataConnFailed, "");
        }
    }

    fn data_input(&mut self, req: &Request, now: Instant) {
        match req.method {
            Method::User | Method::Pass | Method::Type | Method::Stor | Method::Retr => {
                self.post(StatusCode::ActionNotTaken, "")
            }
            Method::Port | Method::Pasv | Method::Quit => {
                self.abort_data_connection();
                self.change_state(ServerState::Waiting);
                self.restart_inactivity(now);
                self.waiting_input(req);
            }
            _ => self.post(StatusCode::NotImplemented, ""),
        }
    }

    // -----------------------------------------------------------------------
    // Helpers
    // -----------------------------------------------------------------------

    fn change_state(&mut self, next: ServerState) {
        log::debug!("[server {}] {} → {}", self.serial, self.state, next);
        self.state = next;
    }

    fn post(&mut self, code: StatusCode, text: &str) {
        match build_status_line(code, text) {
            Ok(line) => {
                log::debug!("[server {}] → {line:?}", self.serial);
                lock(&self.stats).tx_response_codes.bump(code);
                self.outbox.push(line);
            }
            Err(e) => log::error!("[server {}] cannot build reply: {e}", self.serial),
        }
    }

    fn restart_inactivity(&mut self, now: Instant) {
        if !self.timers_purged {
            self.inactivity_deadline = Some(now + self.settings.inactivity_timeout);
        }
    }

    fn budget_remaining(&self) -> bool {
        self.settings.max_requests == 0 || self.requests_served < self.settings.max_requests
    }

    fn mark_attempted(&mut self) {
        self.transactions_active += 1;
        lock(&self.stats).attempted_transactions += 1;
    }

    fn mark_complete(&mut self, success: bool) {
        self.transactions_active = self.transactions_active.saturating_sub(1);
        self.active_data = None;
        let mut stats = lock(&self.stats);
        if success {
            stats.successful_transactions += 1;
        } else {
            stats.unsuccessful_transactions += 1;
        }
    }

    fn handle_quit(&mut self) {
        self.abort_data_connection();
        self.close_flag = true;
        self.post(StatusCode::Ok, "");
    }

    fn abort_data_connection(&mut self) {
        if self.transactions_active > 0 {
            lock(&self.stats).aborted_transactions += 1;
        }
        if let Some(id) = self.active_data.take() {
            if let Some(mgr) = self.data_mgrs.remove(&id) {
                mgr.shutdown();
            }
            if self.transactions_active > 0 {
                self.post(StatusCode::TransferAborted, "");
            }
        }
        self.transactions_active = 0;
    }

    fn release_active(&mut self) {
        if let Some(id) = self.active_data.take() {
            if let Some(mgr) = self.data_mgrs.remove(&id) {
                mgr.shutdown();
            }
        }
    }

    fn make_data_connection(&mut self, role: DataRole) -> Option<SocketAddr> {
        if let Some(id) = self.active_data {
            log::error!(
                "[server {}] data manager {id} already active, refusing a second",
                self.serial
            );
            return None;
        }
        let id = self.next_mgr_id;
        self.next_mgr_id += 1;
        let bind_port = match role {
            DataRole::Connector => self.settings.active_data_port,
            DataRole::Acceptor => 0,
        };
        let mgr = DataTransactionManager::new(
            id,
            role,
            bind_port,
            self.link.clone(),
            self.on_data_close.clone(),
        );
        let addr = mgr.data_source_addr();
        self.data_mgrs.insert(id, mgr);
        self.active_data = Some(id);
        Some(addr)
    }

    fn start_data(&mut self, method: Method) -> bool {
        if self.active_data.is_none() {
            if self.passive {
                log::error!("[server {}] passive transfer without an acceptor", self.serial);
                return false;
            }
            if self.make_data_connection(DataRole::Connector).is_none() {
                return false;
            }
        }
        let Some(id) = self.active_data else {
            return false;
        };
        let Some(mgr) = self.data_mgrs.get(&id) else {
            return false;
        };
        // STOR means the client sends, so this side receives.
        let result = if method == Method::Stor {
            mgr.start_data_rx()
        } else {
            mgr.start_data_tx()
        };
        match result {
            Ok(()) => true,
            Err(e) => {
                log::error!("[server {}] cannot start data transfer: {e}", self.serial);
                self.release_active();
                false
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Connection task
// ---------------------------------------------------------------------------

/// What an accepted connection task needs from its block.
pub struct ServerConnContext {
    pub serial: ConnSerial,
    pub settings: Arc<ServerSettings>,
    pub stats: SharedStats<ServerStats>,
    pub barrier: IoBarrier,
    pub flags: Arc<ConnFlags>,
    pub observer: Arc<dyn ConnectionObserver>,
    pub on_data_close: DataCloseHandler,
}

/// Serve one accepted control connection until QUIT, timeout, or close.
pub async fn run_server_connection(
    ctx: ServerConnContext,
    stream: TcpStream,
    mut cmds: mpsc::UnboundedReceiver<ConnCommand>,
) {
    let serial = ctx.serial;
    ConnFlags::set(&ctx.flags.connected, true);

    let socket = match ControlSocket::new(stream) {
        Ok(s) => s,
        Err(e) => {
            log::info!("[server {serial}] accepted socket unusable: {e}");
            report_closed(&ctx).await;
            return;
        }
    };

    let mut machine = ServerControl::new(
        serial,
        ctx.settings.clone(),
        socket.local_addr,
        socket.peer_addr,
        ctx.stats.clone(),
        ctx.on_data_close.clone(),
    );
    {
        let _io = ctx.barrier.enter().await;
        ctx.observer.connection_opened(serial, &ctx.flags);
        machine.on_open(Instant::now());
    }
    ConnFlags::set(&ctx.flags.open, true);

    drive(&ctx, socket, &mut machine, &mut cmds).await;

    {
        let _io = ctx.barrier.enter().await;
        machine.finalize();
    }
    ConnFlags::set(&ctx.flags.open, false);
    report_closed(&ctx).await;
}

async fn drive(
    ctx: &ServerConnContext,
    mut socket: ControlSocket,
    machine: &mut ServerControl,
    cmds: &mut mpsc::UnboundedReceiver<ConnCommand>,
) {
    let serial = ctx.serial;
    let mut queue_timer = ConnTimer::new();
    let mut idle_timer = ConnTimer::new();

    loop {
        let outbox = std::mem::take(&mut machine.outbox);
        if let Err(e) = flush_outbox(&mut socket, outbox).await {
            log::debug!("[server {serial}] write failed: {e}");
            break;
        }
        if machine.close_requested() {
            break;
        }
        queue_timer.sync(machine.queue_deadline());
        idle_timer.sync(machine.inactivity_deadline());

        let keep_going = tokio::select! {
            line = socket.read_line() => match line {
                Ok(line) => {
                    let _io = ctx.barrier.enter().await;
                    let now = Instant::now();
                    machine.queue_line(line, now);
                    machine.service_queue(now)
                }
                Err(e) => {
                    log::debug!("[server {serial}] control socket: {e}");
                    false
                }
            },
            cmd = cmds.recv() => {
                let _io = ctx.barrier.enter().await;
                match cmd {
                    Some(ConnCommand::DataClose(id)) => {
                        machine.data_close(id, Instant::now());
                        true
                    }
                    Some(ConnCommand::PurgeTimers) => {
                        machine.purge_timers();
                        true
                    }
                    Some(ConnCommand::Close) | None => false,
                }
            },
            _ = queue_timer.expired(), if queue_timer.is_armed() => {
                let _io = ctx.barrier.enter().await;
                machine.service_queue(Instant::now())
            },
            _ = idle_timer.expired(), if idle_timer.is_armed() => {
                let _io = ctx.barrier.enter().await;
                machine.on_inactivity_timeout()
            },
        };

        if !keep_going {
            // Flush what a QUIT produced before closing.
            let outbox = std::mem::take(&mut machine.outbox);
            let _ = flush_outbox(&mut socket, outbox).await;
            break;
        }
    }
    let _ = socket.shutdown().await;
}

async fn report_closed(ctx: &ServerConnContext) {
    if ConnFlags::take(&ctx.flags.notify_close) {
        let _io = ctx.barrier.enter().await;
        ctx.observer.connection_closed(ctx.serial, &ctx.flags);
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
