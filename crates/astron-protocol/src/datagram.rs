//! Datagram builder.
//!
//! A datagram body is laid out as:
//!
//! ```text
//! u8                      recipient count
//! recipient count × u64   recipient channels
//! u64                     sender channel
//! u16                     message type
//! ...                     payload
//! ```
//!
//! Control datagrams carry a single recipient, [`CONTROL_MESSAGE`], and
//! have no sender field. All integers are little-endian.

use bytes::{BufMut, Bytes, BytesMut};

use crate::types::{Channel, DgSize, Doid, Zone, CONTROL_MESSAGE};

/// A growable datagram under construction.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Datagram {
    buf: BytesMut,
}

impl Datagram {
    /// Create an empty datagram.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an empty datagram with room for `capacity` bytes.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: BytesMut::with_capacity(capacity),
        }
    }

    /// Length of the body in bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    /// Whether nothing has been written yet.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// The bytes written so far.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }

    /// Finish the datagram, yielding a cheaply clonable body.
    #[must_use]
    pub fn freeze(self) -> Bytes {
        self.buf.freeze()
    }

    pub fn add_bool(&mut self, v: bool) -> &mut Self {
        self.add_u8(u8::from(v))
    }

    pub fn add_u8(&mut self, v: u8) -> &mut Self {
        self.buf.put_u8(v);
        self
    }

    pub fn add_u16(&mut self, v: u16) -> &mut Self {
        self.buf.put_u16_le(v);
        self
    }

    pub fn add_u32(&mut self, v: u32) -> &mut Self {
        self.buf.put_u32_le(v);
        self
    }

    pub fn add_u64(&mut self, v: u64) -> &mut Self {
        self.buf.put_u64_le(v);
        self
    }

    pub fn add_i8(&mut self, v: i8) -> &mut Self {
        self.buf.put_i8(v);
        self
    }

    pub fn add_i16(&mut self, v: i16) -> &mut Self {
        self.buf.put_i16_le(v);
        self
    }

    pub fn add_i32(&mut self, v: i32) -> &mut Self {
        self.buf.put_i32_le(v);
        self
    }

    pub fn add_i64(&mut self, v: i64) -> &mut Self {
        self.buf.put_i64_le(v);
        self
    }

    pub fn add_f32(&mut self, v: f32) -> &mut Self {
        self.buf.put_f32_le(v);
        self
    }

    pub fn add_f64(&mut self, v: f64) -> &mut Self {
        self.buf.put_f64_le(v);
        self
    }

    pub fn add_channel(&mut self, ch: Channel) -> &mut Self {
        self.add_u64(ch)
    }

    pub fn add_doid(&mut self, doid: Doid) -> &mut Self {
        self.add_u32(doid)
    }

    pub fn add_zone(&mut self, zone: Zone) -> &mut Self {
        self.add_u32(zone)
    }

    /// Write a size prefix.
    pub fn add_size(&mut self, size: DgSize) -> &mut Self {
        self.add_u32(size)
    }

    /// Append raw bytes with no length prefix.
    pub fn add_data(&mut self, data: &[u8]) -> &mut Self {
        self.buf.extend_from_slice(data);
        self
    }

    /// Append a size-prefixed byte string.
    ///
    /// # Panics
    ///
    /// Panics if `data` is longer than `u32::MAX` bytes.
    pub fn add_blob(&mut self, data: &[u8]) -> &mut Self {
        let size = DgSize::try_from(data.len()).expect("blob exceeds u32 size prefix");
        self.add_size(size);
        self.add_data(data)
    }

    /// Append a size-prefixed UTF-8 string.
    pub fn add_string(&mut self, s: &str) -> &mut Self {
        self.add_blob(s.as_bytes())
    }

    /// Embed another datagram as a size-prefixed blob.
    pub fn add_datagram(&mut self, dg: &[u8]) -> &mut Self {
        self.add_blob(dg)
    }

    /// Write a single-recipient server header.
    pub fn add_server_header(&mut self, to: Channel, from: Channel, msg_type: u16) -> &mut Self {
        self.add_u8(1);
        self.add_channel(to);
        self.add_channel(from);
        self.add_u16(msg_type)
    }

    /// Write a server header addressed to every channel in `to`.
    ///
    /// # Panics
    ///
    /// Panics if more than 255 recipients are given.
    pub fn add_multiple_server_header(
        &mut self,
        to: &[Channel],
        from: Channel,
        msg_type: u16,
    ) -> &mut Self {
        let count = u8::try_from(to.len()).expect("at most 255 recipients");
        self.add_u8(count);
        for ch in to {
            self.add_channel(*ch);
        }
        self.add_channel(from);
        self.add_u16(msg_type)
    }

    /// Write a control header.
    pub fn add_control_header(&mut self, msg_type: u16) -> &mut Self {
        self.add_u8(1);
        self.add_channel(CONTROL_MESSAGE);
        self.add_u16(msg_type)
    }
}

impl From<Datagram> for Bytes {
    fn from(dg: Datagram) -> Bytes {
        dg.freeze()
    }
}

impl AsRef<[u8]> for Datagram {
    fn as_ref(&self) -> &[u8] {
        &self.buf
    }
}
