//! Client control connection.
//!
//! [`ClientControl`] is the protocol state machine; it never awaits.  Each
//! reply line goes through [`ClientControl::process_line`], which queues the
//! next request in `outbox` and updates the response deadline.
//! [`run_client_connection`] is the task that owns the socket and feeds the
//! machine.
//!
//! ```text
//!  LOGIN ──230──▶ XFERSETUP ──200──┬─▶ PASV_DATAXFER ─150─┐
//!    ▲                             └─▶ PORT_DATAXFER ─150─┤
//!    │                                                    ▼
//!   EXIT ◀──QUIT── (no transactions left) ◀── DATAXFER_PENDING_CONFIRMATION
//!                                           226/425/426, loop if budget remains
//! ```

use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use ftp_proto::{
    build_port_string, build_request_line, parse_pasv_reply, parse_response_line, Method,
    Response, StatusCode,
};
use tokio::net::TcpSocket;
use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::bridge::IoBarrier;
use crate::config::{ClientConfig, Credentials, FileOp, SocketOptions, TxBodyConfig};
use crate::connection::{flush_outbox, ConnCommand, ConnFlags, ConnSerial, ConnectionObserver};
use crate::data_txn::{
    DataCloseHandler, DataConnectionParent, DataMgrId, DataRole, DataTransactionManager,
    TransferRecord,
};
use crate::socket::ControlSocket;
use crate::stats::{lock, transfer_bps, ClientStats, SharedStats};
use crate::timer::ConnTimer;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    Login,
    XferSetup,
    PasvDataXfer,
    PortDataXfer,
    DataXferPendingConfirmation,
    Exit,
}

impl fmt::Display for ClientState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ClientState::Login => "LOGIN",
            ClientState::XferSetup => "XFERSETUP",
            ClientState::PasvDataXfer => "PASV_DATAXFER",
            ClientState::PortDataXfer => "PORT_DATAXFER",
            ClientState::DataXferPendingConfirmation => "DATAXFER_PENDING_CONFIRMATION",
            ClientState::Exit => "EXIT",
        })
    }
}

/// Events raised outside the reply stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientEvent {
    /// The transaction's data connection finished.
    DataConnClosed,
}

/// Per-connection settings, fixed when the block spawns the connection.
#[derive(Debug, Clone)]
pub struct ClientSettings {
    /// PASV when true, PORT otherwise.
    pub passive: bool,
    /// RETR or STOR for every transaction.
    pub file_op: FileOp,
    /// Argument of RETR/STOR.
    pub file_name: String,
    pub login: Credentials,
    /// Body sent on STOR.
    pub tx_body: TxBodyConfig,
    /// Options applied to each data socket.
    pub socket_options: SocketOptions,
    /// How long any reply may take, the greeting included.
    pub response_timeout: Duration,
    /// Transactions before QUIT; the block divides its budget per server.
    pub max_transactions: u32,
}

impl ClientSettings {
    /// Snapshot the parts of `cfg` a connection reads.
    pub fn from_config(cfg: &ClientConfig, max_transactions: u32) -> Self {
        Self {
            passive: cfg.passive_data,
            file_op: cfg.file_op,
            file_name: cfg.file_name.clone(),
            login: cfg.login.clone(),
            tx_body: cfg.tx_body,
            socket_options: cfg.socket_options.clone(),
            response_timeout: cfg.response_timeout,
            max_transactions,
        }
    }
}

// ---------------------------------------------------------------------------
// Data link
// ---------------------------------------------------------------------------

/// The client side of [`DataConnectionParent`].
pub struct ClientDataLink {
    /// (local, remote) data addresses.
    addrs: Mutex<(SocketAddr, SocketAddr)>,
    record: Mutex<TransferRecord>,
    tx_body: TxBodyConfig,
    options: SocketOptions,
    stats: SharedStats<ClientStats>,
}

impl ClientDataLink {
    /// Data addresses start as the control addresses with `port - 1`.
    pub fn new(
        local_ctrl: SocketAddr,
        remote_ctrl: SocketAddr,
        tx_body: TxBodyConfig,
        options: SocketOptions,
        stats: SharedStats<ClientStats>,
    ) -> Self {
        let below = |mut a: SocketAddr| {
            a.set_port(a.port().saturating_sub(1));
            a
        };
        Self {
            addrs: Mutex::new((below(local_ctrl), below(remote_ctrl))),
            record: Mutex::new(TransferRecord::default()),
            tx_body,
            options,
            stats,
        }
    }

    /// Point the next connector at the address a 227 reply announced.
    pub fn set_remote(&self, addr: SocketAddr) {
        lock(&self.addrs).1 = addr;
    }

    fn reset_record(&self) {
        *lock(&self.record) = TransferRecord::default();
    }

    fn mark_requested(&self, at: Instant) {
        lock(&self.record).requested_at = Some(at);
    }

    /// Timing and byte count of the current (or last) transfer.
    pub fn record(&self) -> TransferRecord {
        lock(&self.record).clone()
    }
}

impl DataConnectionParent for ClientDataLink {
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
    fn notify_data_connection_open(&self, at: Instant) {
        lock(&self.record).opened_at = Some(at);
    }
    fn notify_data_connection_close(&self, at: Instant) {
        lock(&self.record).closed_at = Some(at);
    }
    fn notify_incremental_tx_bytes(&self, n: u64) {
        lock(&self.record).bytes += n;
        lock(&self.stats).goodput_tx_bytes += n;
    }
    fn notify_incremental_rx_bytes(&self, n: u64) {
        lock(&self.record).bytes += n;
        lock(&self.stats).goodput_rx_bytes += n;
    }
}

// ---------------------------------------------------------------------------
// State machine
// ---------------------------------------------------------------------------

/// Client control state machine.  Pure: replies come in through
/// [`process_line`](Self::process_line), requests leave through `outbox`, and
/// the owning task arms its timer from
/// [`response_deadline`](Self::response_deadline).
pub struct ClientControl {
    serial: ConnSerial,
    settings: Arc<ClientSettings>,
    stats: SharedStats<ClientStats>,
    state: ClientState,
    last_cmd: Method,
    link: Arc<ClientDataLink>,
    data_mgrs: HashMap<DataMgrId, DataTransactionManager>,
    active_data: Option<DataMgrId>,
    next_mgr_id: DataMgrId,
    on_data_close: DataCloseHandler,
    attempted_transactions: u32,
    transaction_active: bool,
    data_conn_error: bool,
    response_deadline: Option<Instant>,
    timers_purged: bool,
    /// Request lines waiting to be written, in order.
    pub outbox: Vec<String>,
}

impl ClientControl {
    pub fn new(
        serial: ConnSerial,
        settings: Arc<ClientSettings>,
        local: SocketAddr,
        remote: SocketAddr,
        stats: SharedStats<ClientStats>,
        on_data_close: DataCloseHandler,
    ) -> Self {
        let link = Arc::new(ClientDataLink::new(
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
            state: ClientState::Login,
            last_cmd: Method::Unknown,
            link,
            data_mgrs: HashMap::new(),
            active_data: None,
            next_mgr_id: 0,
            on_data_close,
            attempted_transactions: 0,
            transaction_active: false,
            data_conn_error: false,
            response_deadline: None,
            timers_purged: false,
            outbox: Vec::new(),
        }
    }

    pub fn state(&self) -> ClientState {
        self.state
    }

    /// Last request written, used to interpret the next reply.
    pub fn last_cmd(&self) -> Method {
        self.last_cmd
    }

    /// When the pending reply is overdue; `None` while nothing is awaited or
    /// after the timers were purged.
    pub fn response_deadline(&self) -> Option<Instant> {
        self.response_deadline
    }

    /// Transactions started on this connection so far.
    pub fn attempted_transactions(&self) -> u32 {
        self.attempted_transactions
    }

    /// Data manager of the transaction in flight, if any.
    pub fn active_data(&self) -> Option<&DataTransactionManager> {
        self.active_data.and_then(|id| self.data_mgrs.get(&id))
    }

    /// Addresses and counters shared with this connection's data managers.
    pub fn link(&self) -> &Arc<ClientDataLink> {
        &self.link
    }

    /// Handle one complete reply line.  Returns false when the connection
    /// must close.
    pub fn process_line(&mut self, bytes: &[u8], now: Instant) -> bool {
        let resp = match parse_response_line(bytes) {
            Ok(r) => r,
            Err(e) => {
                log::warn!("[client {}] unparsable reply: {e}", self.serial);
                return false;
            }
        };
        if resp.code == StatusCode::Invalid {
            log::warn!(
                "[client {}] unexpected reply code {} in {}",
                self.serial,
                resp.raw_code,
                self.state
            );
            return false;
        }
        log::debug!(
            "[client {}] ← {} {} state={}",
            self.serial,
            resp.code,
            resp.text,
            self.state
        );

        self.response_deadline = None;
        lock(&self.stats).rx_response_codes.bump(resp.code);

        if !self.process_input(&resp, now) {
            log::debug!("[client {}] closing from {}", self.serial, self.state);
            return false;
        }
        true
    }

    /// Feed an out-of-band event.  A data close while waiting on the
    /// transfer re-arms the response timer for the 226.
    pub fn process_event(&mut self, event: ClientEvent, now: Instant) {
        match (self.state, event) {
            (ClientState::PortDataXfer, ClientEvent::DataConnClosed)
            | (ClientState::DataXferPendingConfirmation, ClientEvent::DataConnClosed) => {
                self.start_response_timer(now);
            }
            _ => {}
        }
    }

    /// A data manager reported its close: release it and tell the machine.
    pub fn data_close(&mut self, id: DataMgrId, now: Instant) {
        match self.data_mgrs.remove(&id) {
            Some(mgr) => mgr.shutdown(),
            None => log::debug!("[client {}] close for unknown data manager {id}", self.serial),
        }
        if self.active_data == Some(id) {
            self.active_data = None;
        }
        self.process_event(ClientEvent::DataConnClosed, now);
    }

    /// Returns false when the connection must close.
    pub fn on_response_timeout(&mut self) -> bool {
        if self.active_data().is_some_and(DataTransactionManager::is_connection_active) {
            log::debug!("[client {}] response timeout ignored, data still flowing", self.serial);
            return true;
        }
        if self.state == ClientState::DataXferPendingConfirmation {
            lock(&self.stats).aborted_transactions += 1;
            self.transaction_active = false;
        }
        log::info!("[client {}] server response timeout in {}", self.serial, self.state);
        false
    }

    /// Disarm the response timer for good; later replies will not re-arm it.
    pub fn purge_timers(&mut self) {
        self.timers_purged = true;
        self.response_deadline = None;
    }

    /// Release every data connection; an unfinished transaction is aborted.
    pub fn finalize(&mut self) {
        for (_, mgr) in self.data_mgrs.drain() {
            mgr.shutdown();
        }
        self.active_data = None;
        if self.transaction_active {
            self.transaction_active = false;
            lock(&self.stats).aborted_transactions += 1;
        }
    }

    // -----------------------------------------------------------------------
    // Per-state input
    // -----------------------------------------------------------------------

    fn process_input(&mut self, resp: &Response, now: Instant) -> bool {
        match self.state {
            ClientState::Login => self.login_input(resp.code, now),
            ClientState::XferSetup => self.xfer_setup_input(resp.code, now),
            ClientState::PasvDataXfer => self.pasv_input(resp, now),
            ClientState::PortDataXfer => self.port_input(resp.code, now),
            ClientState::DataXferPendingConfirmation => self.pending_input(resp.code, now),
            ClientState::Exit => {
                self.change_state(ClientState::Login);
                true
            }
        }
    }

    fn login_input(&mut self, code: StatusCode, now: Instant) -> bool {
        let next = match (self.last_cmd, code) {
            (Method::Unknown, StatusCode::ServiceReady) => {
                Some((Method::User, self.settings.login.user.clone()))
            }
            (Method::User, StatusCode::NeedPassword) => {
                Some((Method::Pass, self.settings.login.pass.clone()))
            }
            (Method::Pass, StatusCode::UserLoggedIn) => {
                self.change_state(ClientState::XferSetup);
                Some((Method::Type, "I".to_string()))
            }
            _ => None,
        };
        match next {
            Some((method, arg)) => self.send(method, &arg, now),
            None => self.quit(now),
        }
        true
    }

    fn xfer_setup_input(&mut self, code: StatusCode, now: Instant) -> bool {
        if self.last_cmd != Method::Type || code != StatusCode::Ok || !self.transactions_remaining()
        {
            self.quit(now);
            return true;
        }

        self.transaction_initiated();
        if self.settings.passive {
            self.change_state(ClientState::PasvDataXfer);
            self.send(Method::Pasv, "", now);
            return true;
        }

        self.change_state(ClientState::PortDataXfer);
        match self.make_data_connection(DataRole::Acceptor) {
            Some(addr) if addr.port() != 0 => {
                self.send(Method::Port, &build_port_string(&addr), now);
            }
            _ => {
                log::error!("[client {}] no acceptor for PORT mode transfer", self.serial);
                self.transaction_complete(false, now);
                self.quit(now);
            }
        }
        true
    }

    fn pasv_input(&mut self, resp: &Response, now: Instant) -> bool {
        let ok = match self.last_cmd {
            Method::Pasv if resp.code == StatusCode::EnteringPassiveMode => {
                match parse_pasv_reply(&resp.text) {
                    Ok(addr) => {
                        self.link.set_remote(addr);
                        self.send(self.file_method(), &self.settings.file_name.clone(), now);
                        true
                    }
                    Err(e) => {
                        log::warn!("[client {}] {e}", self.serial);
                        false
                    }
                }
            }
            Method::Stor | Method::Retr if resp.code == StatusCode::FileStatusOk => {
                self.link.mark_requested(now);
                self.change_state(ClientState::DataXferPendingConfirmation);
                let started = self.start_data();
                if started {
                    self.start_response_timer(now);
                }
                started
            }
            Method::Pasv | Method::Stor | Method::Retr => {
                self.data_conn_error = true;
                false
            }
            _ => return false,
        };
        if !ok {
            self.transaction_complete(false, now);
            self.quit(now);
        }
        true
    }

    fn port_input(&mut self, code: StatusCode, now: Instant) -> bool {
        let ok = match self.last_cmd {
            Method::Port if code == StatusCode::Ok => {
                // The peer dials us as soon as it sees STOR/RETR, so the
                // transfer direction must be set first.
                let started = self.start_data();
                if started {
                    self.link.mark_requested(now);
                    self.send(self.file_method(), &self.settings.file_name.clone(), now);
                }
                started
            }
            Method::Stor | Method::Retr if code == StatusCode::FileStatusOk => {
                self.change_state(ClientState::DataXferPendingConfirmation);
                self.start_response_timer(now);
                true
            }
            Method::Port | Method::Stor | Method::Retr => {
                self.data_conn_error = true;
                false
            }
            _ => return false,
        };
        if !ok {
            self.transaction_complete(false, now);
            self.quit(now);
        }
        true
    }

    fn pending_input(&mut self, code: StatusCode, now: Instant) -> bool {
        let completed = match code {
            StatusCode::DataConnFailed | StatusCode::TransferAborted => {
                self.transaction_complete(false, now);
                true
            }
            StatusCode::ClosingDataConn => {
                self.transaction_complete(true, now);
                true
            }
            _ => false,
        };

        if completed && self.transactions_remaining() {
            // Pipeline the next transaction as if TYPE had just succeeded.
            self.last_cmd = Method::Type;
            self.change_state(ClientState::XferSetup);
            return self.xfer_setup_input(StatusCode::Ok, now);
        }
        self.quit(now);
        true
    }

    // -----------------------------------------------------------------------
    // Helpers
    // -----------------------------------------------------------------------

    fn change_state(&mut self, next: ClientState) {
        log::debug!("[client {}] {} → {}", self.serial, self.state, next);
        self.state = next;
    }

    fn send(&mut self, method: Method, arg: &str, now: Instant) {
        match build_request_line(method, arg) {
            Ok(line) => {
                log::debug!("[client {}] → {line:?} state={}", self.serial, self.state);
                self.outbox.push(line);
                self.last_cmd = method;
                self.start_response_timer(now);
            }
            Err(e) => log::error!("[client {}] cannot build {method}: {e}", self.serial),
        }
    }

    fn quit(&mut self, now: Instant) {
        self.change_state(ClientState::Exit);
        self.send(Method::Quit, "", now);
    }

    fn start_response_timer(&mut self, now: Instant) {
        if !self.timers_purged {
            self.response_deadline = Some(now + self.settings.response_timeout);
        }
    }

    fn file_method(&self) -> Method {
        match self.settings.file_op {
            FileOp::Stor => Method::Stor,
            FileOp::Retr => Method::Retr,
        }
    }

    fn transactions_remaining(&self) -> bool {
        self.attempted_transactions < self.settings.max_transactions
    }

    fn transaction_initiated(&mut self) {
        self.attempted_transactions += 1;
        self.transaction_active = true;
        self.data_conn_error = false;
        if self.active_data.is_some() {
            log::info!(
                "[client {}] data connection still active at transaction start",
                self.serial
            );
        }
        self.link.reset_record();
        lock(&self.stats).attempted_transactions += 1;
    }

    fn transaction_complete(&mut self, success: bool, now: Instant) {
        let active = self.active_data.take();
        self.transaction_active = false;
        if self.data_conn_error {
            // The peer refused the transfer, so this manager will never
            // close by itself.
            if let Some(id) = active {
                log::debug!("[client {}] data connection error, releasing {id}", self.serial);
                (self.on_data_close)(id);
            }
        }

        let mut stats = lock(&self.stats);
        if success {
            let record = self.link.record();
            stats.successful_transactions += 1;
            stats.cumulative_file_transfer_bps += transfer_bps(record.bytes, record.duration_ms(now));
        } else {
            stats.unsuccessful_transactions += 1;
        }
    }

    /// Create the active data manager; returns its source address.
    fn make_data_connection(&mut self, role: DataRole) -> Option<SocketAddr> {
        if let Some(id) = self.active_data {
            log::error!(
                "[client {}] data manager {id} already active, refusing a second",
                self.serial
            );
            return None;
        }
        let id = self.next_mgr_id;
        self.next_mgr_id += 1;
        let mgr = DataTransactionManager::new(
            id,
            role,
            0,
            self.link.clone(),
            self.on_data_close.clone(),
        );
        let addr = mgr.data_source_addr();
        self.data_mgrs.insert(id, mgr);
        self.active_data = Some(id);
        Some(addr)
    }

    fn start_data(&mut self) -> bool {
        if self.active_data.is_none() && self.make_data_connection(DataRole::Connector).is_none() {
            return false;
        }
        let Some(id) = self.active_data else {
            return false;
        };
        let Some(mgr) = self.data_mgrs.get(&id) else {
            return false;
        };
        let result = match self.settings.file_op {
            FileOp::Stor => mgr.start_data_tx(),
            FileOp::Retr => mgr.start_data_rx(),
        };
        match result {
            Ok(()) => true,
            Err(e) => {
                log::error!("[client {}] cannot start data transfer: {e}", self.serial);
                (self.on_data_close)(id);
                false
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Connection task
// ---------------------------------------------------------------------------

/// What a spawned client connection task needs from its block.
pub struct ClientConnContext {
    pub serial: ConnSerial,
    pub server_addr: SocketAddr,
    pub settings: Arc<ClientSettings>,
    pub stats: SharedStats<ClientStats>,
    pub barrier: IoBarrier,
    pub flags: Arc<ConnFlags>,
    pub observer: Arc<dyn ConnectionObserver>,
    pub on_data_close: DataCloseHandler,
}

/// Connect `socket`, then drive the state machine until either side closes.
pub async fn run_client_connection(
    ctx: ClientConnContext,
    socket: TcpSocket,
    mut cmds: mpsc::UnboundedReceiver<ConnCommand>,
) {
    let serial = ctx.serial;
    ConnFlags::set(&ctx.flags.pending, true);

    let connected = tokio::select! {
        res = socket.connect(ctx.server_addr) => res.map_err(|e| e.to_string()),
        _ = wait_for_close(&mut cmds) => Err("cancelled".to_string()),
    };
    ConnFlags::set(&ctx.flags.pending, false);

    let stream = match connected.and_then(|s| ControlSocket::new(s).map_err(|e| e.to_string())) {
        Ok(s) => s,
        Err(reason) => {
            log::info!("[client {serial}] connect to {} failed: {reason}", ctx.server_addr);
            report_closed(&ctx).await;
            return;
        }
    };

    ConnFlags::set(&ctx.flags.connected, true);
    {
        let _io = ctx.barrier.enter().await;
        ctx.observer.connection_opened(serial, &ctx.flags);
    }
    ConnFlags::set(&ctx.flags.open, true);

    let mut machine = ClientControl::new(
        serial,
        ctx.settings.clone(),
        stream.local_addr,
        stream.peer_addr,
        ctx.stats.clone(),
        ctx.on_data_close.clone(),
    );
    drive(&ctx, stream, &mut machine, &mut cmds).await;

    {
        let _io = ctx.barrier.enter().await;
        machine.finalize();
    }
    ConnFlags::set(&ctx.flags.open, false);
    report_closed(&ctx).await;
}

async fn drive(
    ctx: &ClientConnContext,
    mut socket: ControlSocket,
    machine: &mut ClientControl,
    cmds: &mut mpsc::UnboundedReceiver<ConnCommand>,
) {
    let serial = ctx.serial;
    let mut response_timer = ConnTimer::new();
    // The greeting is held to the same deadline as any other reply.
    response_timer.sync(Some(Instant::now() + ctx.settings.response_timeout));

    loop {
        let keep_going = tokio::select! {
            line = socket.read_line() => match line {
                Ok(line) => {
                    let _io = ctx.barrier.enter().await;
                    machine.process_line(&line, Instant::now())
                }
                Err(e) => {
                    log::debug!("[client {serial}] control socket: {e}");
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
            _ = response_timer.expired(), if response_timer.is_armed() => {
                let _io = ctx.barrier.enter().await;
                machine.on_response_timeout()
            },
        };

        let outbox = std::mem::take(&mut machine.outbox);
        if let Err(e) = flush_outbox(&mut socket, outbox).await {
            log::debug!("[client {serial}] write failed: {e}");
            break;
        }
        if !keep_going {
            break;
        }
        response_timer.sync(machine.response_deadline());
    }
    let _ = socket.shutdown().await;
}

async fn wait_for_close(cmds: &mut mpsc::UnboundedReceiver<ConnCommand>) {
    loop {
        match cmds.recv().await {
            Some(ConnCommand::Close) | None => return,
            Some(_) => {}
        }
    }
}

async fn report_closed(ctx: &ClientConnContext) {
    if ConnFlags::take(&ctx.flags.notify_close) {
        let _io = ctx.barrier.enter().await;
        ctx.observer.connection_closed(ctx.serial, &ctx.flags);
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ClientConfig;

    fn addr(s: &str) -> SocketAddr {
        s.parse().unwrap()
    }

    fn machine_with(passive: bool, max_transactions: u32) -> (ClientControl, SharedStats<ClientStats>) {
        let cfg = ClientConfig {
            passive_data: passive,
            ..ClientConfig::default()
        };
        let settings = Arc::new(ClientSettings::from_config(&cfg, max_transactions));
        let stats: SharedStats<ClientStats> = Arc::default();
        let machine = ClientControl::new(
            1,
            settings,
            addr("127.0.0.1:40001"),
            addr("127.0.0.1:2121"),
            stats.clone(),
            Arc::new(|_| {}),
        );
        (machine, stats)
    }

    fn feed(m: &mut ClientControl, line: &str) -> Vec<String> {
        assert!(m.process_line(line.as_bytes(), Instant::now()), "closed on {line:?}");
        std::mem::take(&mut m.outbox)
    }

    fn login(m: &mut ClientControl) {
        feed(m, "220 Service ready, proceed.\r\n");
        feed(m, "331 User name okay, need password.\r\n");
        feed(m, "230 User Logged in, proceed.\r\n");
    }

    #[test]
    fn login_sequence_sends_user_pass_type() {
        let (mut m, stats) = machine_with(true, 1);
        assert_eq!(m.state(), ClientState::Login);

        assert_eq!(feed(&mut m, "220 Service ready, proceed.\r\n"), vec!["USER spirent\r\n"]);
        assert_eq!(
            feed(&mut m, "331 User name okay, need password.\r\n"),
            vec!["PASS spirent\r\n"]
        );
        assert_eq!(feed(&mut m, "230 User Logged in, proceed.\r\n"), vec!["TYPE I\r\n"]);
        assert_eq!(m.state(), ClientState::XferSetup);
        assert!(m.response_deadline().is_some());
        assert_eq!(lock(&stats).rx_response_codes.code_331, 1);
    }

    #[test]
    fn unexpected_login_reply_quits() {
        let (mut m, _) = machine_with(true, 1);
        feed(&mut m, "220 Service ready, proceed.\r\n");
        assert_eq!(feed(&mut m, "530 Not logged in.\r\n"), vec!["QUIT\r\n"]);
        assert_eq!(m.state(), ClientState::Exit);
        feed(&mut m, "200 Command okay.\r\n");
        assert_eq!(m.state(), ClientState::Login);
    }

    #[test]
    fn invalid_code_closes_connection() {
        let (mut m, _) = machine_with(true, 1);
        assert!(!m.process_line(b"999 what\r\n", Instant::now()));
        assert!(!m.process_line(b"garbage\r\n", Instant::now()));
    }

    #[test]
    fn passive_transaction_requests_pasv_then_retr() {
        let (mut m, stats) = machine_with(true, 1);
        login(&mut m);
        assert_eq!(feed(&mut m, "200 Command okay.\r\n"), vec!["PASV\r\n"]);
        assert_eq!(m.state(), ClientState::PasvDataXfer);
        assert_eq!(lock(&stats).attempted_transactions, 1);

        let out = feed(&mut m, "227 Entering passive mode (127,0,0,1,4,56)\r\n");
        assert_eq!(out, vec!["RETR file.bin\r\n"]);
        assert_eq!(m.link().remote_data_addr(), addr("127.0.0.1:1080"));
    }

    #[test]
    fn refused_pasv_fails_transaction_and_quits() {
        let (mut m, stats) = machine_with(true, 1);
        login(&mut m);
        feed(&mut m, "200 Command okay.\r\n");
        assert_eq!(feed(&mut m, "452 Requested action not taken.\r\n"), vec!["QUIT\r\n"]);
        assert_eq!(m.state(), ClientState::Exit);
        assert_eq!(lock(&stats).unsuccessful_transactions, 1);
    }

    #[tokio::test]
    async fn pending_226_pipelines_next_transaction() {
        let (mut m, stats) = machine_with(true, 2);
        login(&mut m);
        feed(&mut m, "200 Command okay.\r\n");
        // Nobody listens on the PASV address; the connect fails later.
        feed(&mut m, "227 Entering passive mode (127,0,0,1,0,1)\r\n");
        feed(&mut m, "150 File status okay; about to open data connection.\r\n");
        assert_eq!(m.state(), ClientState::DataXferPendingConfirmation);

        let out = feed(&mut m, "226 File transfer complete, closing data connection.\r\n");
        assert_eq!(out, vec!["PASV\r\n"]);
        assert_eq!(m.state(), ClientState::PasvDataXfer);
        {
            let s = lock(&stats);
            assert_eq!(s.successful_transactions, 1);
            assert_eq!(s.attempted_transactions, 2);
        }

        // Budget spent: the next confirmation ends the session.
        feed(&mut m, "227 Entering passive mode (127,0,0,1,0,1)\r\n");
        feed(&mut m, "150 File status okay; about to open data connection.\r\n");
        assert_eq!(
            feed(&mut m, "426 Connection closed; transfer aborted.\r\n"),
            vec!["QUIT\r\n"]
        );
        assert_eq!(lock(&stats).unsuccessful_transactions, 1);
        m.finalize();
    }

    #[tokio::test]
    async fn port_mode_sends_local_acceptor_address() {
        let (mut m, _) = machine_with(false, 1);
        login(&mut m);
        let out = feed(&mut m, "200 Command okay.\r\n");
        assert_eq!(m.state(), ClientState::PortDataXfer);
        assert_eq!(out.len(), 1);
        assert!(out[0].starts_with("PORT 127,0,0,1,"));

        assert_eq!(feed(&mut m, "200 Command okay.\r\n"), vec!["RETR file.bin\r\n"]);
        feed(&mut m, "150 File status okay; about to open data connection.\r\n");
        assert_eq!(m.state(), ClientState::DataXferPendingConfirmation);
        m.finalize();
    }

    #[tokio::test]
    async fn response_timeout_while_pending_aborts_transaction() {
        let (mut m, stats) = machine_with(false, 1);
        login(&mut m);
        feed(&mut m, "200 Command okay.\r\n");
        feed(&mut m, "200 Command okay.\r\n");
        feed(&mut m, "150 File status okay; about to open data connection.\r\n");

        assert!(!m.on_response_timeout());
        assert_eq!(lock(&stats).aborted_transactions, 1);
        // Already counted; finalize must not count it again.
        m.finalize();
        assert_eq!(lock(&stats).aborted_transactions, 1);
    }

    #[test]
    fn purged_timers_stay_disarmed() {
        let (mut m, _) = machine_with(true, 1);
        m.purge_timers();
        feed(&mut m, "220 Service ready, proceed.\r\n");
        assert!(m.response_deadline().is_none());
    }
}
