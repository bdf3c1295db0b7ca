//! Bounds-checked datagram reader.

use bytes::Bytes;

use crate::codec::ProtocolError;
use crate::types::{Channel, DgSize, Doid, Zone, CHANNEL_SIZE, CONTROL_MESSAGE};

/// Cursor over a received datagram body.
///
/// Every read checks the remaining length and fails with
/// [`ProtocolError::Truncated`] instead of reading past the end.
#[derive(Debug, Clone)]
pub struct DatagramIterator {
    data: Bytes,
    offset: usize,
}

macro_rules! read_le {
    ($name:ident, $ty:ty) => {
        pub fn $name(&mut self) -> Result<$ty, ProtocolError> {
            const N: usize = std::mem::size_of::<$ty>();
            let raw = self.take(N)?;
            let mut arr = [0u8; N];
            arr.copy_from_slice(raw);
            Ok(<$ty>::from_le_bytes(arr))
        }
    };
}

impl DatagramIterator {
    /// Start reading `data` from the beginning.
    #[must_use]
    pub fn new(data: Bytes) -> Self {
        Self { data, offset: 0 }
    }

    /// The full datagram body.
    #[must_use]
    pub fn datagram(&self) -> &Bytes {
        &self.data
    }

    /// Current read position.
    #[must_use]
    pub fn tell(&self) -> usize {
        self.offset
    }

    /// Move the read position. Positions past the end make the next read fail.
    pub fn seek(&mut self, pos: usize) {
        self.offset = pos;
    }

    /// Bytes left to read.
    #[must_use]
    pub fn remaining(&self) -> usize {
        self.data.len().saturating_sub(self.offset)
    }

    /// Advance past `len` bytes.
    ///
    /// # Errors
    ///
    /// Fails if fewer than `len` bytes remain.
    pub fn skip(&mut self, len: usize) -> Result<(), ProtocolError> {
        self.take(len).map(|_| ())
    }

    /// Ensure `len` bytes can be read at the cursor.
    fn check(&self, len: usize) -> Result<(), ProtocolError> {
        let remaining = self.remaining();
        // A cursor seeked past the end fails even zero-length reads.
        if len > remaining || self.offset > self.data.len() {
            return Err(ProtocolError::Truncated {
                needed: len,
                remaining,
            });
        }
        Ok(())
    }

    fn take(&mut self, len: usize) -> Result<&[u8], ProtocolError> {
        self.check(len)?;
        let start = self.offset;
        self.offset += len;
        Ok(&self.data[start..start + len])
    }

    read_le!(read_u8, u8);
    read_le!(read_u16, u16);
    read_le!(read_u32, u32);
    read_le!(read_u64, u64);
    read_le!(read_i8, i8);
    read_le!(read_i16, i16);
    read_le!(read_i32, i32);
    read_le!(read_i64, i64);
    read_le!(read_f32, f32);
    read_le!(read_f64, f64);

    pub fn read_bool(&mut self) -> Result<bool, ProtocolError> {
        Ok(self.read_u8()? != 0)
    }

    pub fn read_channel(&mut self) -> Result<Channel, ProtocolError> {
        self.read_u64()
    }

    pub fn read_doid(&mut self) -> Result<Doid, ProtocolError> {
        self.read_u32()
    }

    pub fn read_zone(&mut self) -> Result<Zone, ProtocolError> {
        self.read_u32()
    }

    pub fn read_size(&mut self) -> Result<DgSize, ProtocolError> {
        self.read_u32()
    }

    /// Read `len` raw bytes without copying.
    pub fn read_data(&mut self, len: usize) -> Result<Bytes, ProtocolError> {
        self.check(len)?;
        let out = self.data.slice(self.offset..self.offset + len);
        self.offset += len;
        Ok(out)
    }

    /// Read a size-prefixed byte string.
    pub fn read_blob(&mut self) -> Result<Bytes, ProtocolError> {
        let len = self.read_size()? as usize;
        self.read_data(len)
    }

    /// Read a size-prefixed UTF-8 string.
    pub fn read_string(&mut self) -> Result<String, ProtocolError> {
        let blob = self.read_blob()?;
        String::from_utf8(blob.to_vec()).map_err(|_| ProtocolError::InvalidString)
    }

    /// Read an embedded, size-prefixed datagram.
    pub fn read_datagram(&mut self) -> Result<Bytes, ProtocolError> {
        self.read_blob()
    }

    /// Everything from the cursor to the end.
    pub fn read_remainder(&mut self) -> Bytes {
        let start = self.offset.min(self.data.len());
        self.offset = self.data.len();
        self.data.slice(start..)
    }

    /// Number of recipients in the header, or 0 for an empty datagram.
    #[must_use]
    pub fn recipient_count(&self) -> u8 {
        self.data.first().copied().unwrap_or(0)
    }

    /// Read the recipient list from the start of the datagram.
    ///
    /// Leaves the cursor just past the recipients, where the sender (or the
    /// control message type) begins.
    pub fn recipients(&mut self) -> Result<Vec<Channel>, ProtocolError> {
        self.seek(0);
        let count = self.read_u8()?;
        (0..count).map(|_| self.read_channel()).collect()
    }

    /// Whether this is a control datagram: one recipient, the control channel.
    #[must_use]
    pub fn is_control(&self) -> bool {
        self.recipient_count() == 1
            && self.data.len() >= 1 + CHANNEL_SIZE
            && self.data[1..1 + CHANNEL_SIZE] == CONTROL_MESSAGE.to_le_bytes()
    }

    /// The sender channel, without moving the cursor.
    pub fn sender(&self) -> Result<Channel, ProtocolError> {
        let mut peek = self.clone();
        peek.seek(self.payload_offset());
        peek.read_channel()
    }

    /// The message type, without moving the cursor.
    pub fn message_type(&self) -> Result<u16, ProtocolError> {
        let mut peek = self.clone();
        peek.seek(self.payload_offset() + CHANNEL_SIZE);
        peek.read_u16()
    }

    /// Move the cursor to the sender field.
    pub fn seek_payload(&mut self) {
        self.offset = self.payload_offset();
    }

    fn payload_offset(&self) -> usize {
        1 + self.recipient_count() as usize * CHANNEL_SIZE
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::datagram::Datagram;
    use crate::msgtypes::CONTROL_ADD_RANGE;

    #[test]
    fn test_header_accessors() {
        let mut dg = Datagram::new();
        dg.add_multiple_server_header(&[50, 60], 70, 1337);
        dg.add_u32(0xDEAD_BEEF);

        let mut dgi = DatagramIterator::new(dg.freeze());
        assert_eq!(dgi.recipient_count(), 2);
        assert_eq!(dgi.sender().unwrap(), 70);
        assert_eq!(dgi.message_type().unwrap(), 1337);
        assert_eq!(dgi.tell(), 0);

        assert_eq!(dgi.recipients().unwrap(), vec![50, 60]);
        assert_eq!(dgi.read_channel().unwrap(), 70);
        assert_eq!(dgi.read_u16().unwrap(), 1337);
        assert_eq!(dgi.read_u32().unwrap(), 0xDEAD_BEEF);
        assert_eq!(dgi.remaining(), 0);
    }

    #[test]
    fn test_truncated_read_is_an_error() {
        let mut dg = Datagram::new();
        dg.add_u8(3).add_channel(1);

        let mut dgi = DatagramIterator::new(dg.freeze());
        match dgi.recipients() {
            Err(ProtocolError::Truncated { needed: 8, remaining: 0 }) => {}
            other => panic!("Expected Truncated error, got {:?}", other),
        }
    }

    #[test]
    fn test_oversized_blob_prefix() {
        let mut dg = Datagram::new();
        dg.add_size(100).add_data(b"short");

        let mut dgi = DatagramIterator::new(dg.freeze());
        assert!(matches!(
            dgi.read_blob(),
            Err(ProtocolError::Truncated { needed: 100, remaining: 5 })
        ));
    }

    #[test]
    fn test_strings_and_embedded_datagrams() {
        let mut inner = Datagram::new();
        inner.add_server_header(10000, 1, 0).add_u32(0xDEAD_BEEF);
        let inner = inner.freeze();

        let mut dg = Datagram::new();
        dg.add_string("client").add_datagram(&inner).add_bool(true);

        let mut dgi = DatagramIterator::new(dg.freeze());
        assert_eq!(dgi.read_string().unwrap(), "client");
        assert_eq!(dgi.read_datagram().unwrap(), inner);
        assert!(dgi.read_bool().unwrap());
    }

    #[test]
    fn test_invalid_utf8() {
        let mut dg = Datagram::new();
        dg.add_blob(&[0xFF, 0xFE]);
        let mut dgi = DatagramIterator::new(dg.freeze());
        assert!(matches!(dgi.read_string(), Err(ProtocolError::InvalidString)));
    }

    #[test]
    fn test_control_detection() {
        let mut control = Datagram::new();
        control.add_control_header(CONTROL_ADD_RANGE).add_channel(1).add_channel(2);
        assert!(DatagramIterator::new(control.freeze()).is_control());

        let mut routed = Datagram::new();
        routed.add_multiple_server_header(&[1, 2], 0, 0);
        assert!(!DatagramIterator::new(routed.freeze()).is_control());

        assert!(!DatagramIterator::new(Bytes::new()).is_control());
    }

    #[test]
    fn test_reads_after_seeking_past_end_fail() {
        let mut dg = Datagram::new();
        dg.add_u32(7);
        let mut dgi = DatagramIterator::new(dg.freeze());

        dgi.seek(10);
        assert_eq!(dgi.remaining(), 0);
        assert!(matches!(
            dgi.read_data(0),
            Err(ProtocolError::Truncated { needed: 0, remaining: 0 })
        ));
        assert!(dgi.skip(0).is_err());
        assert!(dgi.read_u8().is_err());
        assert!(dgi.read_remainder().is_empty());

        dgi.seek(4);
        assert!(dgi.read_data(0).unwrap().is_empty());
    }
}
