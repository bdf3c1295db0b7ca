//! # astron-protocol
//!
//! Datagram format and wire framing for the Astron message director.
//!
//! Every message exchanged between server roles is a datagram: a recipient
//! list, a sender channel, a message type and an opaque payload. On a socket
//! each datagram is preceded by a little-endian `u32` length.
//!
//! ## Example
//!
//! ```rust
//! use astron_protocol::{codec, Datagram, DatagramIterator};
//!
//! let mut dg = Datagram::new();
//! dg.add_server_header(4000, 1234, 2001).add_string("hello");
//!
//! let framed = codec::encode(dg.as_bytes()).unwrap();
//! let body = codec::decode(&framed).unwrap();
//!
//! let dgi = DatagramIterator::new(body);
//! assert_eq!(dgi.sender().unwrap(), 1234);
//! ```

pub mod codec;
pub mod datagram;
pub mod iterator;
pub mod msgtypes;
pub mod types;

pub use codec::{decode, encode, ProtocolError};
pub use datagram::Datagram;
pub use iterator::DatagramIterator;
pub use msgtypes::ControlMessage;
pub use types::{Channel, DgSize, Doid, Zone, CONTROL_MESSAGE};
