//! Length-prefixed TCP transport.
//!
//! Each datagram is written as a little-endian `u32` length followed by the
//! body. The reader buffers partial frames and yields whole datagrams.

use async_trait::async_trait;
use astron_protocol::codec;
use bytes::{Bytes, BytesMut};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, warn};

use crate::traits::{Connection, DatagramReader, DatagramWriter, Transport, TransportError};

const READ_CHUNK: usize = 8 * 1024;

/// Per-connection socket settings.
#[derive(Debug, Clone)]
pub struct TcpConfig {
    /// A write that stalls longer than this fails the connection.
    pub write_timeout: Duration,
    /// Close connections idle for longer than this. `None` disables the check.
    pub read_timeout: Option<Duration>,
    /// Largest datagram body accepted from a peer.
    pub max_datagram_size: usize,
}

impl Default for TcpConfig {
    fn default() -> Self {
        Self {
            write_timeout: Duration::from_secs(5),
            read_timeout: None,
            max_datagram_size: 1024 * 1024,
        }
    }
}

/// TCP listener producing datagram connections.
pub struct TcpTransport {
    listener: TcpListener,
    config: TcpConfig,
}

impl TcpTransport {
    /// Bind a listener.
    ///
    /// # Errors
    ///
    /// Returns an error if binding to the address fails.
    pub async fn bind(addr: SocketAddr, config: TcpConfig) -> Result<Self, TransportError> {
        let listener = TcpListener::bind(addr).await?;
        info!("TCP transport listening on {}", addr);
        Ok(Self { listener, config })
    }

    #[must_use]
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.listener.local_addr().ok()
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn accept(&self) -> Result<Box<dyn Connection>, TransportError> {
        let (stream, addr) = self.listener.accept().await?;
        debug!("Accepted TCP connection from {}", addr);
        Ok(Box::new(TcpConnection::new(stream, addr, self.config.clone())))
    }

    fn name(&self) -> &'static str {
        "tcp"
    }
}

/// One TCP connection carrying framed datagrams.
pub struct TcpConnection {
    stream: TcpStream,
    remote_addr: SocketAddr,
    config: TcpConfig,
}

impl TcpConnection {
    fn new(stream: TcpStream, remote_addr: SocketAddr, config: TcpConfig) -> Self {
        if let Err(e) = stream.set_nodelay(true) {
            warn!("Failed to set TCP_NODELAY for {}: {}", remote_addr, e);
        }
        Self {
            stream,
            remote_addr,
            config,
        }
    }

    /// Open an outbound connection, e.g. to a parent message director.
    ///
    /// # Errors
    ///
    /// Returns an error if the address does not resolve or the connect fails.
    pub async fn connect(addr: &str, config: TcpConfig) -> Result<Self, TransportError> {
        let stream = TcpStream::connect(addr).await?;
        let remote_addr = stream.peer_addr()?;
        info!("Connected to {}", remote_addr);
        Ok(Self::new(stream, remote_addr, config))
    }

    #[must_use]
    pub fn peer_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    /// Split into concrete halves.
    #[must_use]
    pub fn split(self) -> (TcpReader, TcpWriter) {
        let (read, write) = self.stream.into_split();
        (
            TcpReader {
                half: read,
                buf: BytesMut::with_capacity(READ_CHUNK),
                read_timeout: self.config.read_timeout,
                max_datagram_size: self.config.max_datagram_size,
            },
            TcpWriter {
                half: write,
                buf: BytesMut::with_capacity(READ_CHUNK),
                write_timeout: self.config.write_timeout,
            },
        )
    }
}

impl Connection for TcpConnection {
    fn remote_addr(&self) -> Option<String> {
        Some(self.remote_addr.to_string())
    }

    fn into_split(self: Box<Self>) -> (Box<dyn DatagramReader>, Box<dyn DatagramWriter>) {
        let (reader, writer) = self.split();
        (Box::new(reader), Box::new(writer))
    }
}

/// Read half of a [`TcpConnection`].
pub struct TcpReader {
    half: OwnedReadHalf,
    buf: BytesMut,
    read_timeout: Option<Duration>,
    max_datagram_size: usize,
}

impl TcpReader {
    async fn fill(&mut self) -> Result<usize, TransportError> {
        self.buf.reserve(READ_CHUNK);
        let read = self.half.read_buf(&mut self.buf);
        match self.read_timeout {
            Some(limit) => tokio::time::timeout(limit, read)
                .await
                .map_err(|_| TransportError::Timeout)?
                .map_err(TransportError::from),
            None => read.await.map_err(TransportError::from),
        }
    }
}

#[async_trait]
impl DatagramReader for TcpReader {
    async fn recv(&mut self) -> Result<Option<Bytes>, TransportError> {
        loop {
            if let Some(datagram) = codec::decode_from(&mut self.buf, self.max_datagram_size)? {
                return Ok(Some(datagram));
            }

            if self.fill().await? == 0 {
                return if self.buf.is_empty() {
                    Ok(None)
                } else {
                    // Peer hung up in the middle of a frame.
                    Err(TransportError::ConnectionClosed)
                };
            }
        }
    }
}

/// Write half of a [`TcpConnection`].
pub struct TcpWriter {
    half: OwnedWriteHalf,
    buf: BytesMut,
    write_timeout: Duration,
}

#[async_trait]
impl DatagramWriter for TcpWriter {
    async fn send(&mut self, datagram: Bytes) -> Result<(), TransportError> {
        self.buf.clear();
        codec::encode_into(&datagram, &mut self.buf)?;

        let write = async {
            self.half.write_all(&self.buf).await?;
            self.half.flush().await?;
            Ok::<(), std::io::Error>(())
        };
        tokio::time::timeout(self.write_timeout, write)
            .await
            .map_err(|_| TransportError::Timeout)?
            .map_err(TransportError::from)
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.half.shutdown().await.map_err(TransportError::from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use astron_protocol::{Datagram, DatagramIterator};

    async fn pair(config: TcpConfig) -> (Box<dyn Connection>, TcpConnection) {
        let transport = TcpTransport::bind("127.0.0.1:0".parse().unwrap(), config.clone())
            .await
            .unwrap();
        let addr = transport.local_addr().unwrap().to_string();

        let (accepted, connected) =
            tokio::join!(transport.accept(), TcpConnection::connect(&addr, config));
        (accepted.unwrap(), connected.unwrap())
    }

    fn sample(to: u64) -> Bytes {
        let mut dg = Datagram::new();
        dg.add_server_header(to, 5, 1000).add_string("payload");
        dg.freeze()
    }

    #[test]
    fn test_tcp_config_default() {
        let config = TcpConfig::default();
        assert_eq!(config.write_timeout, Duration::from_secs(5));
        assert!(config.read_timeout.is_none());
        assert_eq!(config.max_datagram_size, 1024 * 1024);
    }

    #[tokio::test]
    async fn test_datagrams_cross_the_socket() {
        let (server, client) = pair(TcpConfig::default()).await;
        assert!(server.remote_addr().is_some());

        let (mut server_rx, mut server_tx) = server.into_split();
        let (mut client_rx, mut client_tx) = client.split();

        client_tx.send(sample(1)).await.unwrap();
        client_tx.send(sample(2)).await.unwrap();
        assert_eq!(server_rx.recv().await.unwrap(), Some(sample(1)));
        assert_eq!(server_rx.recv().await.unwrap(), Some(sample(2)));

        server_tx.send(sample(3)).await.unwrap();
        let echoed = client_rx.recv().await.unwrap().unwrap();
        let mut dgi = DatagramIterator::new(echoed);
        assert_eq!(dgi.recipients().unwrap(), vec![3]);
    }

    #[tokio::test]
    async fn test_clean_close_returns_none() {
        let (server, client) = pair(TcpConfig::default()).await;
        let (mut server_rx, _server_tx) = server.into_split();
        let (_client_rx, mut client_tx) = client.split();

        client_tx.send(sample(1)).await.unwrap();
        client_tx.close().await.unwrap();

        assert!(server_rx.recv().await.unwrap().is_some());
        assert!(server_rx.recv().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_partial_frame_then_close_is_an_error() {
        let (server, client) = pair(TcpConfig::default()).await;
        let (mut server_rx, _server_tx) = server.into_split();

        // Announce 100 bytes, deliver 3, hang up.
        let mut raw = client.stream;
        raw.write_all(&100u32.to_le_bytes()).await.unwrap();
        raw.write_all(b"abc").await.unwrap();
        raw.shutdown().await.unwrap();

        assert!(matches!(
            server_rx.recv().await,
            Err(TransportError::ConnectionClosed)
        ));
    }

    #[tokio::test]
    async fn test_oversized_frame_rejected() {
        let config = TcpConfig {
            max_datagram_size: 16,
            ..TcpConfig::default()
        };
        let (server, client) = pair(config).await;
        let (mut server_rx, _server_tx) = server.into_split();
        let (_client_rx, mut client_tx) = client.split();

        client_tx.send(Bytes::from(vec![0u8; 64])).await.unwrap();
        assert!(matches!(
            server_rx.recv().await,
            Err(TransportError::Protocol(_))
        ));
    }

    #[tokio::test]
    async fn test_idle_read_times_out() {
        let config = TcpConfig {
            read_timeout: Some(Duration::from_millis(50)),
            ..TcpConfig::default()
        };
        let (server, _client) = pair(config).await;
        let (mut server_rx, _server_tx) = server.into_split();

        assert!(matches!(server_rx.recv().await, Err(TransportError::Timeout)));
    }
}
