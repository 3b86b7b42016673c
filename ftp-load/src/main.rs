//! Entry point for `ftp-load`.
//!
//! Parses CLI arguments and runs either a **server** block or a **client**
//! block until it finishes or Ctrl-C.  All protocol and load work lives in
//! the library; `main.rs` owns only process setup (logging, signal
//! handling, argument parsing).

use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};

use ftp_load::config::{
    BodySize, ClientConfig, FileOp, LoadPattern, LoadPhase, LoadProfileConfig, LoadType,
    ResponseLatency, ServerConfig, SocketOptions, TxBodyConfig,
};
use ftp_load::{ClientBlock, ServerBlock};

/// FTP client/server load generator.
#[derive(Parser)]
#[command(author, version, about)]
struct Cli {
    #[command(subcommand)]
    mode: Mode,
}

#[derive(Subcommand)]
enum Mode {
    /// Answer FTP clients until Ctrl-C or the duration elapses.
    Server {
        /// Local address to bind (e.g. 0.0.0.0:2121).
        #[arg(short, long, default_value = "0.0.0.0:2121")]
        bind: SocketAddr,
        /// Most simultaneous control connections; 0 is unlimited.
        #[arg(long, default_value_t = 0)]
        max_clients: u32,
        /// Transactions allowed per control connection; 0 is unlimited.
        #[arg(long, default_value_t = 0)]
        max_requests: u32,
        /// Fixed delay before each reply.
        #[arg(long, conflicts_with = "latency_mean_ms")]
        latency_ms: Option<u64>,
        /// Mean of a normally distributed reply delay.
        #[arg(long, requires = "latency_stddev_ms")]
        latency_mean_ms: Option<u64>,
        #[arg(long)]
        latency_stddev_ms: Option<u64>,
        /// Bytes sent per RETR.
        #[arg(long, default_value_t = 64 * 1024)]
        body_size: u32,
        /// Stop after this many seconds.
        #[arg(long)]
        duration_secs: Option<u64>,
        #[command(flatten)]
        socket: SocketArgs,
    },
    /// Drive load against an FTP server.
    Client {
        /// Server control address (e.g. 127.0.0.1:2121).
        #[arg(short, long)]
        server: SocketAddr,
        /// Use PASV instead of PORT.
        #[arg(long)]
        passive: bool,
        /// Upload with STOR instead of downloading with RETR.
        #[arg(long, conflicts_with = "retr")]
        stor: bool,
        #[arg(long)]
        retr: bool,
        #[arg(long, value_enum, default_value_t = LoadTypeArg::Connections)]
        load_type: LoadTypeArg,
        /// Plateau of the flat load phase.
        #[arg(long, default_value_t = 1)]
        height: u32,
        #[arg(long, default_value_t = 0)]
        ramp_secs: u64,
        #[arg(long, default_value_t = 30)]
        steady_secs: u64,
        #[arg(long, default_value_t = 1)]
        repetitions: u32,
        #[arg(long, default_value_t = 1)]
        max_transactions_per_server: u32,
        /// Most connections open at once; 0 is unlimited.
        #[arg(long, default_value_t = 0)]
        max_open: u32,
        /// Most connections attempted over the run; 0 is unlimited.
        #[arg(long, default_value_t = 0)]
        max_attempted: u32,
        /// Bytes sent per STOR.
        #[arg(long, default_value_t = 64 * 1024)]
        body_size: u32,
        /// Drive the block from this bandwidth (bytes/s) instead of the profile.
        #[arg(long)]
        dynamic_load: Option<i32>,
        #[command(flatten)]
        socket: SocketArgs,
    },
}

/// Data socket tuning shared by both modes.
#[derive(Args)]
struct SocketArgs {
    /// IPv4 TOS byte for data connections.
    #[arg(long, default_value_t = 0)]
    tos: u8,
    /// IPv6 traffic class for data connections.
    #[arg(long, default_value_t = 0)]
    traffic_class: u8,
    /// Receive buffer clamp in bytes; 0 keeps the OS default.
    #[arg(long, default_value_t = 0)]
    window_limit: u32,
    /// Ask for immediate ACKs on data connections.
    #[arg(long)]
    quickack: bool,
    /// Bind data connections to this device (Linux, needs privileges).
    #[arg(long)]
    interface: Option<String>,
}

impl From<SocketArgs> for SocketOptions {
    fn from(args: SocketArgs) -> Self {
        Self {
            ipv4_tos: args.tos,
            ipv6_traffic_class: args.traffic_class,
            tcp_window_size_limit: args.window_limit,
            tcp_delayed_ack: !args.quickack,
            interface: args.interface,
        }
    }
}

#[derive(Clone, Copy, ValueEnum)]
enum LoadTypeArg {
    Connections,
    ConnectionsPerTime,
    Transactions,
    TransactionsPerTime,
    Bandwidth,
}

impl From<LoadTypeArg> for LoadType {
    fn from(arg: LoadTypeArg) -> Self {
        match arg {
            LoadTypeArg::Connections => LoadType::Connections,
            LoadTypeArg::ConnectionsPerTime => LoadType::ConnectionsPerTimeUnit,
            LoadTypeArg::Transactions => LoadType::Transactions,
            LoadTypeArg::TransactionsPerTime => LoadType::TransactionsPerTimeUnit,
            LoadTypeArg::Bandwidth => LoadType::Bandwidth,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialise env_logger; set RUST_LOG to control verbosity.
    env_logger::init();

    let cli = Cli::parse();

    match cli.mode {
        Mode::Server {
            bind,
            max_clients,
            max_requests,
            latency_ms,
            latency_mean_ms,
            latency_stddev_ms,
            body_size,
            duration_secs,
            socket,
        } => {
            let response_latency = match (latency_ms, latency_mean_ms, latency_stddev_ms) {
                (Some(ms), _, _) => ResponseLatency::Fixed(Duration::from_millis(ms)),
                (None, Some(mean), Some(std_dev)) => ResponseLatency::Random {
                    mean: Duration::from_millis(mean),
                    std_dev: Duration::from_millis(std_dev),
                },
                _ => ResponseLatency::None,
            };
            let config = ServerConfig {
                bind_addr: bind,
                max_simultaneous_clients: max_clients,
                max_requests_per_client: max_requests,
                response_latency,
                tx_body: TxBodyConfig {
                    size: BodySize::Fixed(body_size),
                    ..TxBodyConfig::default()
                },
                socket_options: socket.into(),
                ..ServerConfig::default()
            };
            run_server(config, duration_secs.map(Duration::from_secs)).await
        }
        Mode::Client {
            server,
            passive,
            stor,
            retr: _,
            load_type,
            height,
            ramp_secs,
            steady_secs,
            repetitions,
            max_transactions_per_server,
            max_open,
            max_attempted,
            body_size,
            dynamic_load,
            socket,
        } => {
            let phase = LoadPhase {
                pattern: LoadPattern::Flat,
                height,
                ramp_time: Duration::from_secs(ramp_secs),
                steady_time: Duration::from_secs(steady_secs),
                repetitions,
            };
            let config = ClientConfig {
                server_addr: server,
                passive_data: passive,
                file_op: if stor { FileOp::Stor } else { FileOp::Retr },
                max_transactions_per_server,
                tx_body: TxBodyConfig {
                    size: BodySize::Fixed(body_size),
                    ..TxBodyConfig::default()
                },
                socket_options: socket.into(),
                dynamic_load: dynamic_load.unwrap_or(0),
                load: LoadProfileConfig {
                    load_type: load_type.into(),
                    phases: vec![phase],
                    max_connections_attempted: max_attempted,
                    max_open_connections: max_open,
                    use_dynamic_load: dynamic_load.is_some(),
                    ..LoadProfileConfig::default()
                },
                ..ClientConfig::default()
            };
            run_client(config).await
        }
    }
}

async fn run_server(config: ServerConfig, duration: Option<Duration>) -> Result<()> {
    let block = ServerBlock::new(config).context("invalid server configuration")?;
    let addr = block.start().await.context("failed to start server")?;
    log::info!("Serving FTP on {addr}");

    match duration {
        Some(d) => {
            tokio::select! {
                _ = tokio::time::sleep(d) => {}
                _ = tokio::signal::ctrl_c() => {}
            }
        }
        None => tokio::signal::ctrl_c().await?,
    }

    block.stop().await?;
    let stats = block.stats();
    log::info!("server stats: {stats:?}");
    println!("{stats:#?}");
    Ok(())
}

async fn run_client(config: ClientConfig) -> Result<()> {
    let server = config.server_addr;
    let block = ClientBlock::new(config).context("invalid client configuration")?;
    let mut running = block.subscribe();
    block.start()?;
    log::info!("Loading {server}");

    let finished = async {
        // Wait for the block to report running, then for it to wind down.
        while !*running.borrow_and_update() {
            if running.changed().await.is_err() {
                return;
            }
        }
        while *running.borrow_and_update() {
            if running.changed().await.is_err() {
                return;
            }
        }
    };

    tokio::select! {
        _ = finished => log::info!("load profile complete"),
        _ = tokio::signal::ctrl_c() => log::info!("interrupted"),
    }

    block.stop().await?;
    let stats = block.stats();
    log::info!("client stats: {stats:?}");
    println!("{stats:#?}");
    Ok(())
}
