//! # astron-transport
//!
//! Stream transports for Astron datagrams.
//!
//! Every transport hands the server a [`Connection`] that splits into a
//! [`DatagramReader`] and a [`DatagramWriter`], so the read loop and the
//! write loop can run as separate tasks.
//!
//! ```rust,ignore
//! use astron_transport::{Transport, TcpTransport, TcpConfig};
//!
//! let transport = TcpTransport::bind("127.0.0.1:7199".parse()?, TcpConfig::default()).await?;
//! let conn = transport.accept().await?;
//! let (mut reader, mut writer) = conn.into_split();
//! while let Some(datagram) = reader.recv().await? {
//!     writer.send(datagram).await?;
//! }
//! ```

pub mod tcp;
pub mod traits;

pub use tcp::{TcpConfig, TcpConnection, TcpReader, TcpTransport, TcpWriter};
pub use traits::{Connection, DatagramReader, DatagramWriter, Transport, TransportError};
