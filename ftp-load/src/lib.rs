//! `ftp-load` is an FTP traffic generator.  Client blocks hold a population
//! of control connections at the load a profile asks for; server blocks
//! answer them.
//!
//! # Architecture
//!
//! ```text
//!  ┌──────────────┐ SchedulerCommand ┌──────────────────────────────┐
//!  │ ClientBlock  │─────────────────▶│ app task                     │
//!  │ ServerBlock  │                  │ (scheduler, load strategy)   │
//!  └──────┬───────┘                  └───────┬──────────────▲───────┘
//!         │ stop handshake                   │ I/O-logic    │ app-logic
//!         │                                  │ messages     │ messages
//!  ┌──────▼──────────────────────────────────▼──────────────┴───────┐
//!  │ I/O task (connection map, aging queue, purge list)             │
//!  └──────┬─────────────────────────────────────────────────────────┘
//!         │ spawn / ConnCommand
//!  ┌──────▼──────────────────────┐   ┌─────────────────────────────┐
//!  │ control connection task     │──▶│ data transaction manager    │
//!  │ (client or server machine)  │   │ (connector or acceptor)     │
//!  └─────────────────────────────┘   └─────────────────────────────┘
//! ```
//!
//! Modules:
//! - [`config`]: block configuration and constants
//! - [`error`]: crate error type
//! - [`stats`]: per-block counters
//! - [`socket`]: line-framed control socket
//! - [`timer`]: re-armable connection timers
//! - [`data_txn`]: one data connection per transaction
//! - [`connection`]: handles, flags and observer hooks shared by both sides
//! - [`client_conn`]: client control state machine and its task
//! - [`server_conn`]: server control state machine and its task
//! - [`aging`]: oldest-first connection index for reaping
//! - [`load_profile`]: phase patterns evaluated over time
//! - [`load_strategy`]: load value to spawn/reap requests
//! - [`scheduler`]: drives a strategy from a profile
//! - [`bridge`]: batched message queues and the I/O barrier
//! - [`client_block`]: client pool and stop handshake
//! - [`server_block`]: listener, accepted connections and stop handshake

pub mod aging;
pub mod bridge;
pub mod client_block;
pub mod client_conn;
pub mod config;
pub mod connection;
pub mod data_txn;
pub mod error;
pub mod load_profile;
pub mod load_strategy;
pub mod scheduler;
pub mod server_block;
pub mod server_conn;
pub mod socket;
pub mod stats;
pub mod timer;

pub use client_block::ClientBlock;
pub use error::FtpError;
pub use server_block::ServerBlock;
