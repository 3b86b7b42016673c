//! Crate-wide error type.

use ftp_proto::ProtocolError;
use thiserror::Error;

use crate::config::ConfigError;
use crate::socket::SocketError;

#[derive(Debug, Error)]
pub enum FtpError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),
    #[error("control socket: {0}")]
    Socket(#[from] SocketError),
    #[error("timed out: {0}")]
    Timeout(&'static str),
    #[error("data connection: {0}")]
    DataConnection(String),
    /// File descriptors or similar OS resources ran out.
    #[error("resource exhausted: {0}")]
    Resource(String),
    #[error("internal error: {0}")]
    Internal(String),
    #[error("configuration: {0}")]
    Config(#[from] ConfigError),
    #[error("block {0} is stopped")]
    BlockStopped(String),
}

/// `true` for the errno that means the process is out of file descriptors.
pub fn is_fd_exhausted(err: &std::io::Error) -> bool {
    // EMFILE on every unix we run on.
    err.raw_os_error() == Some(24)
}
