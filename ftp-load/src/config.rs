//! Block configuration.
//!
//! Plain structs with `Default` impls.  The CLI fills them from flags; tests
//! and library users build them directly.  Every `max_*` limit uses 0 for
//! "unlimited".

use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use rand::Rng;
use rand_distr::{Distribution, Normal};
use thiserror::Error;

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// How long a client waits for a reply before giving up on the connection.
pub const SERVER_RESPONSE_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// How long a server keeps an idle control connection.
pub const INACTIVITY_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// Upper bound on how long a bridge queue holds a message to coalesce a burst.
pub const DEFAULT_MESSAGE_DELAY: Duration = Duration::from_millis(10);

/// Source port of server-initiated (active mode) data connections.
pub const STD_FTP_DATA_PORT: u16 = 20;

pub const DEFAULT_LOGIN: &str = "spirent";

/// Longest load profile accepted, summed over all phases.
pub const MAX_PROFILE_DURATION: Duration = Duration::from_secs(100 * 365 * 24 * 3600);

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("load profile has no phases")]
    NoPhases,
    #[error("load phase {0} has zero duration")]
    EmptyPhase(usize),
    #[error("load profile exceeds the maximum duration at phase {0}")]
    ProfileTooLong(usize),
    #[error("max transactions per server must be at least 1")]
    ZeroTransactions,
    #[error("invalid {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

/// Draw from N(mean, std_dev), clamped at zero.  A degenerate distribution
/// falls back to the mean.
pub fn normal_sample<R: Rng + ?Sized>(rng: &mut R, mean: f64, std_dev: f64) -> f64 {
    Normal::new(mean, std_dev)
        .map(|n| n.sample(rng))
        .unwrap_or(mean)
        .max(0.0)
}

// ---------------------------------------------------------------------------
// Data body and socket options
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodySize {
    Fixed(u32),
    Random { mean: u32, std_dev: u32 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BodyContent {
    #[default]
    Ascii,
    Binary,
}

/// Shape of the synthetic file body sent on a Tx data connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TxBodyConfig {
    pub size: BodySize,
    pub content: BodyContent,
}

impl Default for TxBodyConfig {
    fn default() -> Self {
        Self {
            size: BodySize::Fixed(64 * 1024),
            content: BodyContent::Ascii,
        }
    }
}

impl TxBodyConfig {
    pub fn sample_size<R: Rng + ?Sized>(&self, rng: &mut R) -> usize {
        match self.size {
            BodySize::Fixed(n) => n as usize,
            BodySize::Random { mean, std_dev } => {
                normal_sample(rng, f64::from(mean), f64::from(std_dev)).round() as usize
            }
        }
    }
}

/// Per-socket tuning handed to data connections.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SocketOptions {
    /// `IP_TOS` byte for IPv4 data sockets.
    pub ipv4_tos: u8,
    /// `IPV6_TCLASS` byte for IPv6 data sockets.
    pub ipv6_traffic_class: u8,
    /// Receive buffer clamp in bytes; 0 leaves the OS default.
    pub tcp_window_size_limit: u32,
    /// When false, data sockets ask for `TCP_QUICKACK`.
    pub tcp_delayed_ack: bool,
    /// Device data sockets are bound to (`SO_BINDTODEVICE`), if any.
    pub interface: Option<String>,
}

impl Default for SocketOptions {
    fn default() -> Self {
        Self {
            ipv4_tos: 0,
            ipv6_traffic_class: 0,
            tcp_window_size_limit: 0,
            tcp_delayed_ack: true,
            interface: None,
        }
    }
}

/// Server think time added before each reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ResponseLatency {
    #[default]
    None,
    Fixed(Duration),
    Random { mean: Duration, std_dev: Duration },
}

impl ResponseLatency {
    pub fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> Duration {
        match *self {
            ResponseLatency::None => Duration::ZERO,
            ResponseLatency::Fixed(d) => d,
            ResponseLatency::Random { mean, std_dev } => Duration::from_secs_f64(normal_sample(
                rng,
                mean.as_secs_f64(),
                std_dev.as_secs_f64(),
            )),
        }
    }
}

// ---------------------------------------------------------------------------
// Load profile
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadType {
    Connections,
    ConnectionsPerTimeUnit,
    Transactions,
    TransactionsPerTimeUnit,
    Bandwidth,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadPattern {
    Flat,
    Stair,
    Burst,
    Sawtooth,
    Sinusoid,
    Random,
}

/// One stretch of a load profile.  A repetition is `ramp_time` followed by
/// `steady_time`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LoadPhase {
    pub pattern: LoadPattern,
    /// Step size, or peak above the phase's starting level.
    pub height: u32,
    pub ramp_time: Duration,
    pub steady_time: Duration,
    /// Ignored by [`LoadPattern::Flat`].
    pub repetitions: u32,
}

impl LoadPhase {
    /// Total run time: one period for a flat phase, `repetitions` periods
    /// otherwise.  `None` when that does not fit in a `Duration`.
    pub fn duration(&self) -> Option<Duration> {
        let period = self.ramp_time.checked_add(self.steady_time)?;
        match self.pattern {
            LoadPattern::Flat => Some(period),
            _ => period.checked_mul(self.repetitions),
        }
    }

    pub fn flat(height: u32, ramp_time: Duration, steady_time: Duration) -> Self {
        Self {
            pattern: LoadPattern::Flat,
            height,
            ramp_time,
            steady_time,
            repetitions: 1,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct LoadProfileConfig {
    pub load_type: LoadType,
    /// Run back to back; each starts from the level the previous one left.
    pub phases: Vec<LoadPhase>,
    /// Lifetime cap on connection attempts; 0 for none.
    pub max_connections_attempted: u32,
    /// Cap on simultaneously open connections; 0 for none.
    pub max_open_connections: u32,
    pub use_dynamic_load: bool,
    /// Seeds the random pattern so runs are repeatable.
    pub randomization_seed: u64,
}

impl Default for LoadProfileConfig {
    fn default() -> Self {
        Self {
            load_type: LoadType::Connections,
            phases: vec![LoadPhase::flat(1, Duration::ZERO, Duration::from_secs(60))],
            max_connections_attempted: 0,
            max_open_connections: 0,
            use_dynamic_load: false,
            randomization_seed: 0,
        }
    }
}

impl LoadProfileConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.phases.is_empty() {
            return Err(ConfigError::NoPhases);
        }
        let mut total = Duration::ZERO;
        for (i, phase) in self.phases.iter().enumerate() {
            if phase.ramp_time.is_zero() && phase.steady_time.is_zero() {
                return Err(ConfigError::EmptyPhase(i));
            }
            total = phase
                .duration()
                .and_then(|d| total.checked_add(d))
                .filter(|t| *t <= MAX_PROFILE_DURATION)
                .ok_or(ConfigError::ProfileTooLong(i))?;
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Client and server blocks
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileOp {
    Stor,
    Retr,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub user: String,
    pub pass: String,
}

impl Default for Credentials {
    fn default() -> Self {
        Self {
            user: DEFAULT_LOGIN.to_string(),
            pass: DEFAULT_LOGIN.to_string(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub name: String,
    pub server_addr: SocketAddr,
    /// Source addresses cycled across successive connections; empty lets
    /// the OS choose.
    pub local_addrs: Vec<IpAddr>,
    /// PASV when true, PORT otherwise.
    pub passive_data: bool,
    pub file_op: FileOp,
    pub file_name: String,
    /// Transactions per control connection before QUIT.
    pub max_transactions_per_server: u32,
    pub login: Credentials,
    pub tx_body: TxBodyConfig,
    pub socket_options: SocketOptions,
    pub response_timeout: Duration,
    /// Per-connection share used by the bandwidth load type, bytes/s.
    pub bandwidth_per_connection: u32,
    /// Initial dynamic load, bytes/s; only used when dynamic load is enabled.
    pub dynamic_load: i32,
    pub load: LoadProfileConfig,
    /// Batching window of the block's internal message queues.
    pub message_delay: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            name: "ftp-client".to_string(),
            server_addr: SocketAddr::from(([127, 0, 0, 1], 21)),
            local_addrs: Vec::new(),
            passive_data: true,
            file_op: FileOp::Retr,
            file_name: "file.bin".to_string(),
            max_transactions_per_server: 1,
            login: Credentials::default(),
            tx_body: TxBodyConfig::default(),
            socket_options: SocketOptions::default(),
            response_timeout: SERVER_RESPONSE_TIMEOUT,
            bandwidth_per_connection: 125_000,
            dynamic_load: 0,
            load: LoadProfileConfig::default(),
            message_delay: DEFAULT_MESSAGE_DELAY,
        }
    }
}

impl ClientConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_transactions_per_server == 0 {
            return Err(ConfigError::ZeroTransactions);
        }
        if self.load.load_type == LoadType::Bandwidth && self.bandwidth_per_connection == 0 {
            return Err(ConfigError::Invalid {
                field: "bandwidth_per_connection",
                reason: "must be non-zero for the bandwidth load type".into(),
            });
        }
        self.load.validate()
    }
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub name: String,
    pub bind_addr: SocketAddr,
    /// Accepted connections beyond this are closed at once; 0 for no limit.
    pub max_simultaneous_clients: u32,
    /// PORT/PASV transactions allowed per control connection.
    pub max_requests_per_client: u32,
    pub response_latency: ResponseLatency,
    pub tx_body: TxBodyConfig,
    pub socket_options: SocketOptions,
    pub inactivity_timeout: Duration,
    /// Source port for active-mode data connections.  Binding below 1024
    /// needs privileges; a failed bind falls back to an ephemeral port.
    pub active_data_port: u16,
    pub message_delay: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            name: "ftp-server".to_string(),
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 21)),
            max_simultaneous_clients: 0,
            max_requests_per_client: 0,
            response_latency: ResponseLatency::None,
            tx_body: TxBodyConfig::default(),
            socket_options: SocketOptions::default(),
            inactivity_timeout: INACTIVITY_TIMEOUT,
            active_data_port: STD_FTP_DATA_PORT,
            message_delay: DEFAULT_MESSAGE_DELAY,
        }
    }
}

impl ServerConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.inactivity_timeout.is_zero() {
            return Err(ConfigError::Invalid {
                field: "inactivity_timeout",
                reason: "must be non-zero".into(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_configs_validate() {
        assert!(ClientConfig::default().validate().is_ok());
        assert!(ServerConfig::default().validate().is_ok());
    }

    #[test]
    fn empty_profile_is_rejected() {
        let mut cfg = ClientConfig::default();
        cfg.load.phases.clear();
        assert_eq!(cfg.validate(), Err(ConfigError::NoPhases));
    }

    #[test]
    fn zero_length_phase_is_rejected() {
        let mut cfg = LoadProfileConfig::default();
        cfg.phases.push(LoadPhase::flat(3, Duration::ZERO, Duration::ZERO));
        assert_eq!(cfg.validate(), Err(ConfigError::EmptyPhase(1)));
    }

    #[test]
    fn overflowing_phase_is_rejected() {
        let huge = LoadPhase {
            pattern: LoadPattern::Stair,
            height: 1,
            ramp_time: Duration::MAX / 2,
            steady_time: Duration::from_secs(1),
            repetitions: u32::MAX,
        };
        assert_eq!(huge.duration(), None);
        let cfg = LoadProfileConfig {
            phases: vec![LoadPhase::flat(1, Duration::ZERO, Duration::from_secs(1)), huge],
            ..LoadProfileConfig::default()
        };
        assert_eq!(cfg.validate(), Err(ConfigError::ProfileTooLong(1)));
    }

    #[test]
    fn profile_longer_than_the_limit_is_rejected() {
        let half = LoadPhase::flat(1, Duration::ZERO, MAX_PROFILE_DURATION / 2);
        let ok = LoadProfileConfig {
            phases: vec![half, half],
            ..LoadProfileConfig::default()
        };
        assert!(ok.validate().is_ok());

        let over = LoadProfileConfig {
            phases: vec![half, half, LoadPhase::flat(1, Duration::ZERO, Duration::from_secs(1))],
            ..LoadProfileConfig::default()
        };
        assert_eq!(over.validate(), Err(ConfigError::ProfileTooLong(2)));
    }

    #[test]
    fn zero_transactions_per_server_is_rejected() {
        let cfg = ClientConfig {
            max_transactions_per_server: 0,
            ..ClientConfig::default()
        };
        assert_eq!(cfg.validate(), Err(ConfigError::ZeroTransactions));
    }

    #[test]
    fn fixed_body_size_is_exact() {
        let body = TxBodyConfig {
            size: BodySize::Fixed(1234),
            content: BodyContent::Binary,
        };
        assert_eq!(body.sample_size(&mut rand::rng()), 1234);
    }

    #[test]
    fn random_samples_are_never_negative() {
        let mut rng = rand::rng();
        for _ in 0..500 {
            let v = normal_sample(&mut rng, 1.0, 50.0);
            assert!(v >= 0.0);
        }
    }

    #[test]
    fn latency_none_is_zero() {
        assert_eq!(ResponseLatency::None.sample(&mut rand::rng()), Duration::ZERO);
        let fixed = ResponseLatency::Fixed(Duration::from_millis(7));
        assert_eq!(fixed.sample(&mut rand::rng()), Duration::from_millis(7));
    }
}
