//! Packet codec: a growable pooled buffer with independent read and write
//! cursors.
//!
//! # Layout
//!
//! ```text
//! ┌────────────────┬──────────────────────────────────────┐
//! │  length prefix │               payload                │
//! │   (4 bytes)    │  fields in the order they were written│
//! └────────────────┴──────────────────────────────────────┘
//! ```
//!
//! The prefix slot is reserved up front so [`Packet::insert_length`] can
//! fill it in after the payload is complete, without shifting bytes.
//! All integers and floats are little-endian. Strings are an i32 byte
//! length followed by UTF-8 bytes.

use std::fmt;
use std::sync::Arc;

use crate::types::Channel;

use super::error::NetError;
use super::pool::{BufferPool, PooledBuf};

/// Bytes reserved at the front of every packet for the length prefix.
pub const LENGTH_PREFIX: usize = 4;

/// A byte sequence tagged with its channel, backed by a pooled buffer.
///
/// Writes append sequentially; reads consume sequentially and fail with
/// [`NetError::Underflow`] past the written extent. The backing buffer
/// returns to its pool exactly once, when the packet is dropped.
pub struct Packet {
    buf: PooledBuf,
    channel: Channel,
    read: usize,
    framed: bool,
}

impl Packet {
    pub(crate) fn new(pool: &Arc<BufferPool>, channel: Channel, capacity: usize) -> Self {
        let mut buf = pool.rent(capacity + LENGTH_PREFIX);
        buf.get_mut().extend_from_slice(&[0; LENGTH_PREFIX]);
        Self {
            buf,
            channel,
            read: 0,
            framed: false,
        }
    }

    /// Builds a packet from payload bytes received off the wire.
    pub(crate) fn incoming(pool: &Arc<BufferPool>, channel: Channel, payload: &[u8]) -> Self {
        let mut packet = Self::new(pool, channel, payload.len());
        packet.buf.get_mut().extend_from_slice(payload);
        packet
    }

    /// The channel this packet was created for.
    #[inline]
    pub fn channel(&self) -> Channel {
        self.channel
    }

    /// Number of payload bytes written so far.
    #[inline]
    pub fn len(&self) -> usize {
        self.buf.get().len() - LENGTH_PREFIX
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Payload bytes not yet consumed by the read cursor. Lets a consumer
    /// detect optional trailing fields.
    #[inline]
    pub fn unread_len(&self) -> usize {
        self.len() - self.read
    }

    /// The payload as written, without the length prefix.
    #[inline]
    pub fn payload(&self) -> &[u8] {
        &self.buf.get()[LENGTH_PREFIX..]
    }

    /// Writes the total payload length into the reserved 4-byte prefix.
    /// Called once all fields are written, before the packet is framed
    /// onto the wire.
    pub fn insert_length(&mut self) {
        let len = self.len() as i32;
        self.buf.get_mut()[..LENGTH_PREFIX].copy_from_slice(&len.to_le_bytes());
        self.framed = true;
    }

    /// The full wire frame: length prefix plus payload. Only valid after
    /// [`Packet::insert_length`].
    pub(crate) fn framed(&self) -> &[u8] {
        debug_assert!(self.framed, "insert_length not called before framing");
        self.buf.get()
    }

    // ---- writes ----

    pub fn write_u8(&mut self, value: u8) {
        self.buf.get_mut().push(value);
    }

    pub fn write_i16(&mut self, value: i16) {
        self.buf.get_mut().extend_from_slice(&value.to_le_bytes());
    }

    pub fn write_u16(&mut self, value: u16) {
        self.buf.get_mut().extend_from_slice(&value.to_le_bytes());
    }

    pub fn write_i32(&mut self, value: i32) {
        self.buf.get_mut().extend_from_slice(&value.to_le_bytes());
    }

    pub fn write_u32(&mut self, value: u32) {
        self.buf.get_mut().extend_from_slice(&value.to_le_bytes());
    }

    pub fn write_f32(&mut self, value: f32) {
        self.buf.get_mut().extend_from_slice(&value.to_le_bytes());
    }

    /// Writes an i32 byte length followed by the UTF-8 bytes.
    pub fn write_string(&mut self, value: &str) {
        self.write_i32(value.len() as i32);
        self.buf.get_mut().extend_from_slice(value.as_bytes());
    }

    /// Appends raw bytes with no length marker.
    pub fn write_bytes(&mut self, bytes: &[u8]) {
        self.buf.get_mut().extend_from_slice(bytes);
    }

    /// Writes a fixed-layout struct; field order is the serialization order.
    pub fn write<T: PacketData>(&mut self, value: &T) {
        value.write_to(self);
    }

    // ---- reads ----

    fn take(&mut self, n: usize) -> Result<&[u8], NetError> {
        if self.unread_len() < n {
            return Err(NetError::Underflow {
                needed: n,
                available: self.unread_len(),
            });
        }
        let start = LENGTH_PREFIX + self.read;
        self.read += n;
        Ok(&self.buf.get()[start..start + n])
    }

    pub fn read_u8(&mut self) -> Result<u8, NetError> {
        Ok(self.take(1)?[0])
    }

    pub fn read_i16(&mut self) -> Result<i16, NetError> {
        let b = self.take(2)?;
        Ok(i16::from_le_bytes([b[0], b[1]]))
    }

    pub fn read_u16(&mut self) -> Result<u16, NetError> {
        let b = self.take(2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    pub fn read_i32(&mut self) -> Result<i32, NetError> {
        let b = self.take(4)?;
        Ok(i32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub fn read_u32(&mut self) -> Result<u32, NetError> {
        let b = self.take(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub fn read_f32(&mut self) -> Result<f32, NetError> {
        let b = self.take(4)?;
        Ok(f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub fn read_string(&mut self) -> Result<String, NetError> {
        let len = self.read_i32()?;
        if len < 0 {
            return Err(NetError::MalformedString);
        }
        let bytes = self.take(len as usize)?.to_vec();
        String::from_utf8(bytes).map_err(|_| NetError::MalformedString)
    }

    pub fn read_bytes(&mut self, n: usize) -> Result<Vec<u8>, NetError> {
        Ok(self.take(n)?.to_vec())
    }

    /// Consumes and returns every unread payload byte.
    pub fn read_remaining(&mut self) -> Vec<u8> {
        let n = self.unread_len();
        self.take(n).expect("unread_len bytes are always available").to_vec()
    }

    pub fn read<T: PacketData>(&mut self) -> Result<T, NetError> {
        T::read_from(self)
    }
}

impl fmt::Debug for Packet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Packet")
            .field("channel", &self.channel)
            .field("len", &self.len())
            .field("unread", &self.unread_len())
            .finish()
    }
}

/// Fixed-layout (de)serialization into a packet. Implement this for plain
/// data structs by writing and reading the fields in declaration order.
pub trait PacketData: Sized {
    fn write_to(&self, packet: &mut Packet);
    fn read_from(packet: &mut Packet) -> Result<Self, NetError>;
}

macro_rules! packet_data_primitive {
    ($ty:ty, $write:ident, $read:ident) => {
        impl PacketData for $ty {
            fn write_to(&self, packet: &mut Packet) {
                packet.$write(*self);
            }

            fn read_from(packet: &mut Packet) -> Result<Self, NetError> {
                packet.$read()
            }
        }
    };
}

packet_data_primitive!(u8, write_u8, read_u8);
packet_data_primitive!(i16, write_i16, read_i16);
packet_data_primitive!(u16, write_u16, read_u16);
packet_data_primitive!(i32, write_i32, read_i32);
packet_data_primitive!(u32, write_u32, read_u32);
packet_data_primitive!(f32, write_f32, read_f32);

impl PacketData for String {
    fn write_to(&self, packet: &mut Packet) {
        packet.write_string(self);
    }

    fn read_from(packet: &mut Packet) -> Result<Self, NetError> {
        packet.read_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_packet() -> Packet {
        Packet::new(&BufferPool::new(), Channel::Reliable, 128)
    }

    #[test]
    fn test_primitive_roundtrip() {
        let mut p = make_packet();
        p.write_i16(5);
        p.write_u32(0xDEAD_BEEF);
        p.write_f32(1.5);
        p.write_string("abc");

        assert_eq!(p.read_i16().unwrap(), 5);
        assert_eq!(p.read_u32().unwrap(), 0xDEAD_BEEF);
        assert_eq!(p.read_f32().unwrap(), 1.5);
        assert_eq!(p.read_string().unwrap(), "abc");
        assert_eq!(p.unread_len(), 0);
    }

    #[test]
    fn test_read_past_end_underflows() {
        let mut p = make_packet();
        p.write_u8(7);
        p.read_u8().unwrap();

        match p.read_i32() {
            Err(NetError::Underflow { needed, available }) => {
                assert_eq!(needed, 4);
                assert_eq!(available, 0);
            }
            other => panic!("expected underflow, got {other:?}"),
        }
    }

    #[test]
    fn test_insert_length_fills_prefix() {
        let mut p = make_packet();
        p.write_bytes(&[1, 2, 3, 4, 5]);
        p.insert_length();

        let frame = p.framed();
        assert_eq!(&frame[..4], &5i32.to_le_bytes());
        assert_eq!(&frame[4..], &[1, 2, 3, 4, 5]);
    }

    #[test]
    fn test_unread_len_detects_trailing_fields() {
        let mut p = make_packet();
        p.write_i32(-2);
        p.write_string("bye");

        p.read_i32().unwrap();
        assert!(p.unread_len() > 0);
        assert_eq!(p.read_string().unwrap(), "bye");
        assert_eq!(p.unread_len(), 0);
    }

    #[test]
    fn test_struct_field_order_is_wire_order() {
        struct Sample {
            kind: u16,
            value: f32,
            label: String,
        }

        impl PacketData for Sample {
            fn write_to(&self, packet: &mut Packet) {
                packet.write_u16(self.kind);
                packet.write_f32(self.value);
                packet.write_string(&self.label);
            }

            fn read_from(packet: &mut Packet) -> Result<Self, NetError> {
                Ok(Self {
                    kind: packet.read_u16()?,
                    value: packet.read_f32()?,
                    label: packet.read_string()?,
                })
            }
        }

        let mut p = make_packet();
        p.write(&Sample {
            kind: 3,
            value: 2.25,
            label: "spawn".into(),
        });

        // The first field written must be the first bytes on the wire.
        assert_eq!(&p.payload()[..2], &3u16.to_le_bytes());

        let sample: Sample = p.read().unwrap();
        assert_eq!(sample.kind, 3);
        assert_eq!(sample.value, 2.25);
        assert_eq!(sample.label, "spawn");
    }
}
