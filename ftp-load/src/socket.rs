//! CRLF-framed control socket.
//!
//! [`ControlSocket`] is a thin wrapper around `tokio::net::TcpStream` that
//! yields complete control-channel lines instead of raw bytes.  All protocol
//! logic lives in the connection state machines; this module owns only byte
//! I/O and framing.

use std::net::SocketAddr;

use ftp_proto::find_line_end;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

/// Longest line accepted before the peer is considered broken.
pub const MAX_LINE: usize = 8 * 1024;

const READ_CHUNK: usize = 4096;

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub enum SocketError {
    /// Underlying I/O error from the OS.
    Io(std::io::Error),
    /// The peer closed its side of the connection.
    Closed,
    /// More than [`MAX_LINE`] bytes arrived without a CRLF.
    LineTooLong,
}

impl std::fmt::Display for SocketError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io(e) => write!(f, "socket I/O error: {e}"),
            Self::Closed => write!(f, "peer closed the connection"),
            Self::LineTooLong => write!(f, "line exceeds {MAX_LINE} bytes"),
        }
    }
}

impl std::error::Error for SocketError {}

impl From<std::io::Error> for SocketError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e)
    }
}

// ---------------------------------------------------------------------------
// Socket
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub struct ControlSocket {
    pub local_addr: SocketAddr,
    pub peer_addr: SocketAddr,
    inner: TcpStream,
    /// Bytes received but not yet returned as a line.
    pending: Vec<u8>,
}

impl ControlSocket {
    pub fn new(inner: TcpStream) -> Result<Self, SocketError> {
        let local_addr = inner.local_addr()?;
        let peer_addr = inner.peer_addr()?;
        // Control lines are tiny; don't let Nagle hold them back.
        inner.set_nodelay(true)?;
        Ok(Self {
            local_addr,
            peer_addr,
            inner,
            pending: Vec::new(),
        })
    }

    /// Next complete line, CRLF included.
    ///
    /// Cancel safe: bytes already read stay buffered, so this can sit in a
    /// `select!` next to timers and command channels.
    pub async fn read_line(&mut self) -> Result<Vec<u8>, SocketError> {
        loop {
            if let Some(end) = find_line_end(&self.pending) {
                let rest = self.pending.split_off(end);
                return Ok(std::mem::replace(&mut self.pending, rest));
            }
            if self.pending.len() > MAX_LINE {
                return Err(SocketError::LineTooLong);
            }
            let mut chunk = [0u8; READ_CHUNK];
            let n = self.inner.read(&mut chunk).await?;
            if n == 0 {
                return Err(SocketError::Closed);
            }
            self.pending.extend_from_slice(&chunk[..n]);
        }
    }

    pub async fn write_line(&mut self, line: &str) -> Result<(), SocketError> {
        self.inner.write_all(line.as_bytes()).await?;
        Ok(())
    }

    /// Flush and half-close the write side.
    pub async fn shutdown(&mut self) -> Result<(), SocketError> {
        self.inner.shutdown().await?;
        Ok(())
    }
}
