//! Transport abstraction traits.
//!
//! The server only sees these traits, so the listener and the upstream
//! connector do not care what carries the bytes.

use astron_protocol::ProtocolError;
use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;

/// Transport errors.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The peer closed the connection, possibly mid-datagram.
    #[error("Connection closed")]
    ConnectionClosed,

    /// A read or write did not complete in time.
    #[error("Connection timed out")]
    Timeout,

    /// The peer sent a frame we refuse to decode.
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

/// A listener that yields connections.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Wait for the next inbound connection.
    async fn accept(&self) -> Result<Box<dyn Connection>, TransportError>;

    /// Short transport name for logs, e.g. `"tcp"`.
    fn name(&self) -> &'static str;

    fn is_healthy(&self) -> bool {
        true
    }
}

/// An established connection, before it is split into halves.
pub trait Connection: Send {
    fn remote_addr(&self) -> Option<String> {
        None
    }

    /// Split into independently owned read and write halves.
    fn into_split(self: Box<Self>) -> (Box<dyn DatagramReader>, Box<dyn DatagramWriter>);
}

/// Read half of a connection.
#[async_trait]
pub trait DatagramReader: Send {
    /// Receive the next datagram body.
    ///
    /// Returns `Ok(None)` when the peer closes cleanly between datagrams.
    async fn recv(&mut self) -> Result<Option<Bytes>, TransportError>;
}

/// Write half of a connection.
#[async_trait]
pub trait DatagramWriter: Send {
    /// Frame and send one datagram body.
    async fn send(&mut self, datagram: Bytes) -> Result<(), TransportError>;

    /// Flush and shut down the write direction.
    async fn close(&mut self) -> Result<(), TransportError>;
}
