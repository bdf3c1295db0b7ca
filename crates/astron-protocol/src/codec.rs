//! Length-prefixed wire framing for datagrams.
//!
//! Each datagram travels as `[u32 little-endian length][length bytes of body]`.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

/// Maximum datagram body size (16 MiB).
pub const MAX_DATAGRAM_SIZE: usize = 16 * 1024 * 1024;

/// Length prefix size in bytes.
pub const LENGTH_PREFIX_SIZE: usize = 4;

/// Protocol errors that can occur while framing or reading datagrams.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Datagram exceeds the maximum size.
    #[error("Datagram size {0} exceeds maximum {MAX_DATAGRAM_SIZE}")]
    FrameTooLarge(usize),

    /// Not enough data to decode a frame.
    #[error("Incomplete frame: need {0} more bytes")]
    Incomplete(usize),

    /// A read ran past the end of the datagram.
    #[error("Truncated datagram: needed {needed} bytes, {remaining} remaining")]
    Truncated { needed: usize, remaining: usize },

    /// A string field was not valid UTF-8.
    #[error("Invalid UTF-8 in string field")]
    InvalidString,

    /// A control datagram carried an unknown message type.
    #[error("Unknown control message type {0}")]
    UnknownControlMessage(u16),
}

/// Frame a datagram body for the wire.
///
/// # Errors
///
/// Returns an error if the body is larger than [`MAX_DATAGRAM_SIZE`].
pub fn encode(datagram: &[u8]) -> Result<Bytes, ProtocolError> {
    let mut buf = BytesMut::with_capacity(LENGTH_PREFIX_SIZE + datagram.len());
    encode_into(datagram, &mut buf)?;
    Ok(buf.freeze())
}

/// Frame a datagram body into an existing buffer.
///
/// # Errors
///
/// Returns an error if the body is larger than [`MAX_DATAGRAM_SIZE`].
pub fn encode_into(datagram: &[u8], buf: &mut BytesMut) -> Result<(), ProtocolError> {
    if datagram.len() > MAX_DATAGRAM_SIZE {
        return Err(ProtocolError::FrameTooLarge(datagram.len()));
    }

    buf.reserve(LENGTH_PREFIX_SIZE + datagram.len());
    buf.put_u32_le(datagram.len() as u32);
    buf.extend_from_slice(datagram);

    Ok(())
}

/// Decode one framed datagram from a complete byte slice.
///
/// # Errors
///
/// Returns an error if the data is incomplete or the declared length is too large.
pub fn decode(data: &[u8]) -> Result<Bytes, ProtocolError> {
    if data.len() < LENGTH_PREFIX_SIZE {
        return Err(ProtocolError::Incomplete(LENGTH_PREFIX_SIZE - data.len()));
    }

    let length = u32::from_le_bytes([data[0], data[1], data[2], data[3]]) as usize;

    if length > MAX_DATAGRAM_SIZE {
        return Err(ProtocolError::FrameTooLarge(length));
    }

    let total_size = LENGTH_PREFIX_SIZE + length;
    if data.len() < total_size {
        return Err(ProtocolError::Incomplete(total_size - data.len()));
    }

    Ok(Bytes::copy_from_slice(&data[LENGTH_PREFIX_SIZE..total_size]))
}

/// Try to decode a datagram from a read buffer, advancing it if successful.
///
/// Returns `Ok(Some(body))` if a complete frame was buffered, `Ok(None)` if
/// more data is needed, or `Err` if the declared length exceeds `max_size`.
///
/// # Errors
///
/// Returns an error if the frame is too large.
pub fn decode_from(buf: &mut BytesMut, max_size: usize) -> Result<Option<Bytes>, ProtocolError> {
    if buf.len() < LENGTH_PREFIX_SIZE {
        return Ok(None);
    }

    let length = u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;

    if length > max_size.min(MAX_DATAGRAM_SIZE) {
        return Err(ProtocolError::FrameTooLarge(length));
    }

    let total_size = LENGTH_PREFIX_SIZE + length;
    if buf.len() < total_size {
        buf.reserve(total_size - buf.len());
        return Ok(None);
    }

    buf.advance(LENGTH_PREFIX_SIZE);
    Ok(Some(buf.split_to(length).freeze()))
}
