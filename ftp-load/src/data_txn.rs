//! Data Transaction Manager: one ancillary data connection.
//!
//! A manager plays one of two roles for the lifetime of one transaction:
//!
//! ```text
//!  Acceptor   bind+listen on creation ─▶ accept ─┐
//!                                                ├─▶ wait for Tx/Rx ─▶ transfer ─▶ close
//!  Connector  start_data_* ─▶ bind ─▶ connect ───┘
//! ```
//!
//! The manager never touches its control connection directly.  It reads
//! addresses and options from, and reports timestamps and byte counts to, a
//! [`DataConnectionParent`].  When the transfer ends it invokes the
//! [`DataCloseHandler`] supplied by the owner, unless it was shut down first.

use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, Mutex};

use rand::Rng;
use socket2::SockRef;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::config::{BodyContent, TxBodyConfig};
use crate::error::{is_fd_exhausted, FtpError};
use crate::stats::lock;

/// Total attempts for a connector, at socket setup and again at connect: the
/// requested port, then an OS-assigned one.
pub const CONNECT_RETRY_COUNT: usize = 2;

/// Rx read size and Tx write size.
pub const DATA_BLOCK_SIZE: usize = 64 * 1024;

pub type DataMgrId = u64;

/// Invoked with the manager id once a data connection closes on its own.
pub type DataCloseHandler = Arc<dyn Fn(DataMgrId) + Send + Sync>;

/// What a data connection may ask of its control connection.
pub trait DataConnectionParent: Send + Sync {
    fn local_data_addr(&self) -> SocketAddr;
    fn remote_data_addr(&self) -> SocketAddr;
    fn local_if_name(&self) -> Option<String>;
    fn tx_body_config(&self) -> TxBodyConfig;
    fn ipv4_tos(&self) -> u8;
    fn ipv6_traffic_class(&self) -> u8;
    fn tcp_window_size_limit(&self) -> u32;
    fn tcp_delayed_ack(&self) -> bool;
    fn notify_data_connection_open(&self, at: Instant);
    fn notify_data_connection_close(&self, at: Instant);
    fn notify_incremental_tx_bytes(&self, n: u64);
    fn notify_incremental_rx_bytes(&self, n: u64);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataRole {
    Connector,
    Acceptor,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Tx,
    Rx,
}

/// Timing and volume of one transaction's data transfer.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransferRecord {
    pub requested_at: Option<Instant>,
    pub opened_at: Option<Instant>,
    pub closed_at: Option<Instant>,
    pub bytes: u64,
}

impl TransferRecord {
    /// Milliseconds from open to close; a missing close counts as `now`.
    pub fn duration_ms(&self, now: Instant) -> u64 {
        let Some(opened) = self.opened_at else {
            return 0;
        };
        let closed = self.closed_at.unwrap_or(now);
        closed.saturating_duration_since(opened).as_millis() as u64
    }
}

// ---------------------------------------------------------------------------
// Manager
// ---------------------------------------------------------------------------

struct Inner {
    shutdown: bool,
    open: bool,
    direction: Option<Direction>,
    direction_tx: watch::Sender<Option<Direction>>,
    task: Option<JoinHandle<()>>,
    on_close: Option<DataCloseHandler>,
    bound_addr: Option<SocketAddr>,
}

pub struct DataTransactionManager {
    id: DataMgrId,
    role: DataRole,
    bind_port: u16,
    parent: Arc<dyn DataConnectionParent>,
    inner: Arc<Mutex<Inner>>,
}

impl std::fmt::Debug for DataTransactionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataTransactionManager")
            .field("id", &self.id)
            .field("role", &self.role)
            .field("active", &self.is_connection_active())
            .finish()
    }
}

impl DataTransactionManager {
    /// Create a manager.  An acceptor binds and starts listening right away;
    /// check [`data_source_addr`](Self::data_source_addr) for a non-zero port.
    /// A connector binds `bind_port` (0 for any) once a direction is started.
    pub fn new(
        id: DataMgrId,
        role: DataRole,
        bind_port: u16,
        parent: Arc<dyn DataConnectionParent>,
        on_close: DataCloseHandler,
    ) -> Self {
        let (direction_tx, _) = watch::channel(None);
        let mgr = Self {
            id,
            role,
            bind_port,
            parent,
            inner: Arc::new(Mutex::new(Inner {
                shutdown: false,
                open: false,
                direction: None,
                direction_tx,
                task: None,
                on_close: Some(on_close),
                bound_addr: None,
            })),
        };
        if role == DataRole::Acceptor {
            if let Err(e) = mgr.open_acceptor() {
                log::warn!("[data {id}] acceptor open failed: {e}");
            }
        }
        mgr
    }

    pub fn id(&self) -> DataMgrId {
        self.id
    }

    pub fn role(&self) -> DataRole {
        self.role
    }

    /// Address peers should dial; port 0 when the acceptor could not open.
    pub fn data_source_addr(&self) -> SocketAddr {
        lock(&self.inner)
            .bound_addr
            .unwrap_or_else(|| SocketAddr::new(self.parent.local_data_addr().ip(), 0))
    }

    pub fn is_connection_active(&self) -> bool {
        let inner = lock(&self.inner);
        inner.open && !inner.shutdown
    }

    pub fn is_shutdown(&self) -> bool {
        lock(&self.inner).shutdown
    }

    pub fn start_data_tx(&self) -> Result<(), FtpError> {
        self.start(Direction::Tx)
    }

    pub fn start_data_rx(&self) -> Result<(), FtpError> {
        self.start(Direction::Rx)
    }

    /// Stop the transfer and release the socket.  Only the first call has an
    /// effect, and the close handler never runs afterwards.
    pub fn shutdown(&self) {
        let task = {
            let mut inner = lock(&self.inner);
            if inner.shutdown {
                return;
            }
            inner.shutdown = true;
            inner.open = false;
            inner.on_close = None;
            inner.task.take()
        };
        if let Some(task) = task {
            task.abort();
        }
        log::trace!("[data {}] shutdown", self.id);
    }

    fn start(&self, direction: Direction) -> Result<(), FtpError> {
        let needs_connect = {
            let mut inner = lock(&self.inner);
            if inner.shutdown {
                return Err(FtpError::DataConnection(format!(
                    "manager {} already shut down",
                    self.id
                )));
            }
            if let Some(current) = inner.direction {
                if current != direction {
                    return Err(FtpError::Internal(format!(
                        "manager {} already started as {current:?}",
                        self.id
                    )));
                }
                return Ok(());
            }
            if self.role == DataRole::Acceptor && inner.bound_addr.is_none() {
                return Err(FtpError::DataConnection("acceptor is not listening".into()));
            }
            inner.direction = Some(direction);
            inner.direction_tx.send_replace(Some(direction));
            self.role == DataRole::Connector && inner.task.is_none()
        };

        if needs_connect {
            if let Err(e) = self.open_connector(direction) {
                lock(&self.inner).direction = None;
                return Err(e);
            }
        }
        log::debug!("[data {}] started {direction:?} as {:?}", self.id, self.role);
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Opening
    // -----------------------------------------------------------------------

    fn open_acceptor(&self) -> Result<(), FtpError> {
        let ip = self.parent.local_data_addr().ip();
        let listener = new_socket(self.parent.as_ref(), ip, 0)?.listen(1)?;
        let bound = listener.local_addr()?;

        let mut inner = lock(&self.inner);
        inner.bound_addr = Some(bound);
        let ctx = self.transfer_context();
        let direction_rx = inner.direction_tx.subscribe();
        inner.task = Some(tokio::spawn(accept_task(listener, direction_rx, ctx)));
        log::trace!("[data {}] listening on {bound}", self.id);
        Ok(())
    }

    fn open_connector(&self, direction: Direction) -> Result<(), FtpError> {
        let ip = self.parent.local_data_addr().ip();
        let remote = self.parent.remote_data_addr();
        let mut port = self.bind_port;

        let mut last_err = None;
        let mut socket = None;
        for attempt in 0..CONNECT_RETRY_COUNT {
            match new_socket(self.parent.as_ref(), ip, port) {
                Ok(s) => {
                    socket = Some(s);
                    break;
                }
                Err(e) if is_fd_exhausted(&e) => {
                    log::error!("[data {}] out of file descriptors", self.id);
                    return Err(FtpError::Resource(e.to_string()));
                }
                Err(e) => {
                    log::debug!(
                        "[data {}] socket setup on port {port} failed (attempt {}): {e}",
                        self.id,
                        attempt + 1
                    );
                    port = 0;
                    last_err = Some(e);
                }
            }
        }
        let Some(socket) = socket else {
            let reason = last_err.map(|e| e.to_string()).unwrap_or_default();
            log::error!("[data {}] connector exhausted retries: {reason}", self.id);
            return Err(FtpError::DataConnection(reason));
        };

        log::trace!("[data {}] connecting to {remote} from port {port}", self.id);
        let ctx = self.transfer_context();
        let mut inner = lock(&self.inner);
        inner.task = Some(tokio::spawn(connect_task(socket, ip, remote, direction, ctx)));
        Ok(())
    }

    fn transfer_context(&self) -> TransferContext {
        TransferContext {
            id: self.id,
            parent: self.parent.clone(),
            inner: self.inner.clone(),
        }
    }
}

impl Drop for DataTransactionManager {
    fn drop(&mut self) {
        self.shutdown();
    }
}

// ---------------------------------------------------------------------------
// Socket setup
// ---------------------------------------------------------------------------

/// A bound data socket carrying the parent's options.
fn new_socket(
    parent: &dyn DataConnectionParent,
    ip: IpAddr,
    port: u16,
) -> std::io::Result<TcpSocket> {
    let socket = if ip.is_ipv4() {
        TcpSocket::new_v4()?
    } else {
        TcpSocket::new_v6()?
    };
    socket.set_reuseaddr(true)?;
    let window = parent.tcp_window_size_limit();
    if window > 0 {
        socket.set_recv_buffer_size(window)?;
    }
    apply_socket_options(&socket, parent, ip);
    socket.bind(SocketAddr::new(ip, port))?;
    Ok(socket)
}

/// Marking, ack and device options.  A refused option is logged and the
/// socket is still used.
fn apply_socket_options(socket: &TcpSocket, parent: &dyn DataConnectionParent, ip: IpAddr) {
    let sock = SockRef::from(socket);

    let marking = if ip.is_ipv4() {
        sock.set_tos(u32::from(parent.ipv4_tos()))
    } else {
        set_traffic_class(&sock, parent.ipv6_traffic_class())
    };
    if let Err(e) = marking {
        log::warn!("failed to set traffic marking on data socket: {e}");
    }

    #[cfg(any(target_os = "linux", target_os = "android"))]
    {
        if let Err(e) = sock.set_quickack(!parent.tcp_delayed_ack()) {
            log::warn!("failed to set TCP_QUICKACK on data socket: {e}");
        }
        if let Some(name) = parent.local_if_name() {
            if let Err(e) = sock.bind_device(Some(name.as_bytes())) {
                log::warn!("failed to bind data socket to {name}: {e}");
            }
        }
    }
    #[cfg(not(any(target_os = "linux", target_os = "android")))]
    if let Some(name) = parent.local_if_name() {
        log::warn!("binding to device {name} is not supported on this platform");
    }
}

#[cfg(any(target_os = "linux", target_os = "android"))]
fn set_traffic_class(sock: &SockRef<'_>, tclass: u8) -> std::io::Result<()> {
    sock.set_tclass_v6(u32::from(tclass))
}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
fn set_traffic_class(_sock: &SockRef<'_>, tclass: u8) -> std::io::Result<()> {
    if tclass != 0 {
        log::debug!("IPv6 traffic class {tclass} is not applied on this platform");
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Transfer tasks
// ---------------------------------------------------------------------------

struct TransferContext {
    id: DataMgrId,
    parent: Arc<dyn DataConnectionParent>,
    inner: Arc<Mutex<Inner>>,
}

impl TransferContext {
    fn mark_open(&self) {
        lock(&self.inner).open = true;
        self.parent.notify_data_connection_open(Instant::now());
    }

    /// Report the close and run the handler unless the owner shut us down.
    fn finish(&self) {
        let handler = {
            let mut inner = lock(&self.inner);
            let was_open = std::mem::replace(&mut inner.open, false);
            if was_open {
                self.parent.notify_data_connection_close(Instant::now());
            }
            if inner.shutdown {
                None
            } else {
                inner.on_close.take()
            }
        };
        if let Some(handler) = handler {
            handler(self.id);
        }
    }
}

async fn accept_task(
    listener: TcpListener,
    mut direction_rx: watch::Receiver<Option<Direction>>,
    ctx: TransferContext,
) {
    let stream = match listener.accept().await {
        Ok((stream, peer)) => {
            log::trace!("[data {}] accepted {peer}", ctx.id);
            stream
        }
        Err(e) => {
            log::debug!("[data {}] accept failed: {e}", ctx.id);
            ctx.finish();
            return;
        }
    };
    drop(listener);
    ctx.mark_open();

    let direction = loop {
        if let Some(d) = *direction_rx.borrow_and_update() {
            break Some(d);
        }
        if direction_rx.changed().await.is_err() {
            break None;
        }
    };
    if let Some(direction) = direction {
        transfer(stream, direction, &ctx).await;
    }
    ctx.finish();
}

/// Connect, and on failure retry from an OS-chosen port.  The requested
/// port may already be part of an identical 4-tuple, which only surfaces at
/// connect time.
async fn connect_task(
    socket: TcpSocket,
    ip: IpAddr,
    remote: SocketAddr,
    direction: Direction,
    ctx: TransferContext,
) {
    let mut next = Some(socket);
    for attempt in 1..=CONNECT_RETRY_COUNT {
        let socket = match next.take() {
            Some(socket) => socket,
            None => match new_socket(ctx.parent.as_ref(), ip, 0) {
                Ok(socket) => socket,
                Err(e) => {
                    log::debug!("[data {}] socket rebuild failed: {e}", ctx.id);
                    break;
                }
            },
        };
        match socket.connect(remote).await {
            Ok(stream) => {
                ctx.mark_open();
                transfer(stream, direction, &ctx).await;
                break;
            }
            Err(e) if is_fd_exhausted(&e) => {
                log::error!("[data {}] out of file descriptors", ctx.id);
                break;
            }
            Err(e) => log::debug!(
                "[data {}] connect to {remote} failed (attempt {attempt}): {e}",
                ctx.id
            ),
        }
    }
    ctx.finish();
}

async fn transfer(mut stream: TcpStream, direction: Direction, ctx: &TransferContext) {
    let result = match direction {
        Direction::Tx => send_body(&mut stream, ctx).await,
        Direction::Rx => sink_body(&mut stream, ctx).await,
    };
    if let Err(e) = result {
        log::debug!("[data {}] {direction:?} ended with error: {e}", ctx.id);
    }
}

async fn send_body(stream: &mut TcpStream, ctx: &TransferContext) -> std::io::Result<()> {
    let body = ctx.parent.tx_body_config();
    let mut remaining = body.sample_size(&mut rand::rng());
    log::trace!("[data {}] sending {remaining} bytes", ctx.id);

    while remaining > 0 {
        let chunk = body_chunk(&body, remaining.min(DATA_BLOCK_SIZE));
        stream.write_all(&chunk).await?;
        ctx.parent.notify_incremental_tx_bytes(chunk.len() as u64);
        remaining -= chunk.len();
    }
    stream.shutdown().await
}

async fn sink_body(stream: &mut TcpStream, ctx: &TransferContext) -> std::io::Result<()> {
    let mut buf = vec![0u8; DATA_BLOCK_SIZE];
    loop {
        let n = stream.read(&mut buf).await?;
        if n == 0 {
            return Ok(());
        }
        ctx.parent.notify_incremental_rx_bytes(n as u64);
    }
}

fn body_chunk(body: &TxBodyConfig, len: usize) -> Vec<u8> {
    match body.content {
        BodyContent::Ascii => (0..len).map(|i| b'!' + (i % 94) as u8).collect(),
        BodyContent::Binary => {
            let mut chunk = vec![0u8; len];
            rand::rng().fill(&mut chunk[..]);
            chunk
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BodySize;
    use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
    use std::time::Duration;

    #[derive(Default)]
    struct Recorder {
        remote: Mutex<Option<SocketAddr>>,
        tos: u8,
        quickack: bool,
        opened: AtomicUsize,
        closed: AtomicUsize,
        tx: AtomicU64,
        rx: AtomicU64,
    }

    impl DataConnectionParent for Recorder {
        fn local_data_addr(&self) -> SocketAddr {
            "127.0.0.1:0".parse().unwrap()
        }
        fn remote_data_addr(&self) -> SocketAddr {
            lock(&self.remote).unwrap_or_else(|| "127.0.0.1:9".parse().unwrap())
        }
        fn local_if_name(&self) -> Option<String> {
            None
        }
        fn tx_body_config(&self) -> TxBodyConfig {
            TxBodyConfig {
                size: BodySize::Fixed(100_000),
                content: BodyContent::Binary,
            }
        }
        fn ipv4_tos(&self) -> u8 {
            self.tos
        }
        fn ipv6_traffic_class(&self) -> u8 {
            0
        }
        fn tcp_window_size_limit(&self) -> u32 {
            0
        }
        fn tcp_delayed_ack(&self) -> bool {
            !self.quickack
        }
        fn notify_data_connection_open(&self, _at: Instant) {
            self.opened.fetch_add(1, Ordering::SeqCst);
        }
        fn notify_data_connection_close(&self, _at: Instant) {
            self.closed.fetch_add(1, Ordering::SeqCst);
        }
        fn notify_incremental_tx_bytes(&self, n: u64) {
            self.tx.fetch_add(n, Ordering::SeqCst);
        }
        fn notify_incremental_rx_bytes(&self, n: u64) {
            self.rx.fetch_add(n, Ordering::SeqCst);
        }
    }

    fn close_channel() -> (DataCloseHandler, tokio::sync::mpsc::UnboundedReceiver<DataMgrId>) {
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        let handler: DataCloseHandler = Arc::new(move |id| {
            let _ = tx.send(id);
        });
        (handler, rx)
    }

    #[tokio::test]
    async fn shutdown_twice_is_same_as_once() {
        let parent = Arc::new(Recorder::default());
        let (on_close, mut closes) = close_channel();
        let mgr = DataTransactionManager::new(1, DataRole::Acceptor, 0, parent.clone(), on_close);
        assert_ne!(mgr.data_source_addr().port(), 0);

        mgr.shutdown();
        assert!(mgr.is_shutdown());
        mgr.shutdown();
        assert!(mgr.is_shutdown());
        assert!(!mgr.is_connection_active());
        assert!(mgr.start_data_rx().is_err());

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(closes.try_recv().is_err());
        assert_eq!(parent.closed.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn acceptor_rx_meets_connector_tx() {
        let rx_parent = Arc::new(Recorder::default());
        let (rx_close, mut rx_closes) = close_channel();
        let acceptor =
            DataTransactionManager::new(7, DataRole::Acceptor, 0, rx_parent.clone(), rx_close);
        acceptor.start_data_rx().unwrap();

        let tx_parent = Arc::new(Recorder::default());
        *lock(&tx_parent.remote) = Some(acceptor.data_source_addr());
        let (tx_close, mut tx_closes) = close_channel();
        let connector =
            DataTransactionManager::new(8, DataRole::Connector, 0, tx_parent.clone(), tx_close);
        connector.start_data_tx().unwrap();
        // Starting the same direction again is a no-op.
        connector.start_data_tx().unwrap();

        let wait = Duration::from_secs(5);
        assert_eq!(tokio::time::timeout(wait, tx_closes.recv()).await.unwrap(), Some(8));
        assert_eq!(tokio::time::timeout(wait, rx_closes.recv()).await.unwrap(), Some(7));
        assert_eq!(tx_parent.tx.load(Ordering::SeqCst), 100_000);
        assert_eq!(rx_parent.rx.load(Ordering::SeqCst), 100_000);
        assert_eq!(rx_parent.opened.load(Ordering::SeqCst), 1);
        assert_eq!(rx_parent.closed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn failed_connect_runs_close_handler() {
        // Grab a free port, then release it so nothing listens there.
        let spare = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let dead = spare.local_addr().unwrap();
        drop(spare);

        let parent = Arc::new(Recorder::default());
        *lock(&parent.remote) = Some(dead);
        let (on_close, mut closes) = close_channel();
        let mgr = DataTransactionManager::new(3, DataRole::Connector, 0, parent.clone(), on_close);
        mgr.start_data_rx().unwrap();

        let got = tokio::time::timeout(Duration::from_secs(5), closes.recv()).await.unwrap();
        assert_eq!(got, Some(3));
        assert_eq!(parent.opened.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn connect_retries_from_another_port_when_tuple_is_taken() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let remote = listener.local_addr().unwrap();

        // Hold remote <- 127.0.0.1:taken open so the same tuple cannot be reused.
        let blocker = TcpSocket::new_v4().unwrap();
        blocker.set_reuseaddr(true).unwrap();
        blocker.bind("127.0.0.1:0".parse().unwrap()).unwrap();
        let taken = blocker.local_addr().unwrap().port();
        let _held = blocker.connect(remote).await.unwrap();
        let (_held_peer, _) = listener.accept().await.unwrap();

        let parent = Arc::new(Recorder::default());
        *lock(&parent.remote) = Some(remote);
        let (on_close, mut closes) = close_channel();
        let mgr =
            DataTransactionManager::new(5, DataRole::Connector, taken, parent.clone(), on_close);
        mgr.start_data_tx().unwrap();

        let wait = Duration::from_secs(5);
        let (mut stream, peer) =
            tokio::time::timeout(wait, listener.accept()).await.unwrap().unwrap();
        assert_ne!(peer.port(), taken);
        let mut body = Vec::new();
        stream.read_to_end(&mut body).await.unwrap();
        assert_eq!(body.len(), 100_000);

        assert_eq!(tokio::time::timeout(wait, closes.recv()).await.unwrap(), Some(5));
        assert_eq!(parent.opened.load(Ordering::SeqCst), 1);
        assert_eq!(parent.tx.load(Ordering::SeqCst), 100_000);
    }

    #[tokio::test]
    async fn data_socket_carries_parent_options() {
        let parent = Recorder {
            tos: 0x10,
            quickack: false,
            ..Recorder::default()
        };
        let socket = new_socket(&parent, "127.0.0.1".parse().unwrap(), 0).unwrap();
        let sock = SockRef::from(&socket);
        assert_eq!(sock.tos().unwrap(), 0x10);
        // Delayed acks stay on, so quick-ack mode is off.
        #[cfg(any(target_os = "linux", target_os = "android"))]
        assert!(!sock.quickack().unwrap());
    }

    #[test]
    fn missing_close_counts_as_now() {
        let now = Instant::now();
        let rec = TransferRecord {
            opened_at: Some(now),
            ..Default::default()
        };
        assert_eq!(rec.duration_ms(now + Duration::from_millis(40)), 40);
        assert_eq!(TransferRecord::default().duration_ms(now), 0);
    }
}
