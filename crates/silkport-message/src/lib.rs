//! `silkport-message` provides the [Message] type: the unit of data exchanged
//! above the framing layer. A message is an opcode-tagged byte payload with
//! two cursors; writes append typed values at the end, reads consume typed
//! values from the front. All integers are little-endian, strings travel as a
//! `u16` length followed by their UTF-8 bytes, matching the wire conventions
//! of Silkroad Online operations.
//!
//! ```
//! # use silkport_message::Message;
//! let mut message = Message::new(0x2002);
//! message.write_string("hi");
//! message.write_u32(42);
//!
//! let text = message.read_string().unwrap();
//! let number = message.read_u32().unwrap();
//! assert_eq!(("hi", 42), (text.as_str(), number));
//! ```

use bytes::{BufMut, Bytes, BytesMut};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MessageError {
    /// A typed read would run past the end of the payload.
    #[error("read of {requested} bytes at position {position} exceeds the payload length {length}")]
    ReadOutOfBounds {
        position: usize,
        requested: usize,
        length: usize,
    },
    /// A length-prefixed string turned out not to be valid UTF-8.
    #[error("the payload contains a string that is not valid UTF-8")]
    InvalidUtf8,
}

type Result<T> = std::result::Result<T, MessageError>;

/// A single logical operation: an opcode plus its payload.
///
/// Messages are what handlers receive and what gets handed to the session for
/// sending. The `massive` flag marks a message that should be fragmented into
/// multiple frames on its way out, lifting the single-frame payload limit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    opcode: u16,
    massive: bool,
    payload: BytesMut,
    read_pos: usize,
}

impl Message {
    /// Creates an empty message for the given opcode.
    pub fn new(opcode: u16) -> Self {
        Message {
            opcode,
            massive: false,
            payload: BytesMut::new(),
            read_pos: 0,
        }
    }

    /// Creates an empty message with preallocated payload capacity.
    pub fn with_capacity(opcode: u16, capacity: usize) -> Self {
        Message {
            opcode,
            massive: false,
            payload: BytesMut::with_capacity(capacity),
            read_pos: 0,
        }
    }

    /// Creates a message from an already received payload.
    pub fn from_payload(opcode: u16, payload: &[u8]) -> Self {
        Message {
            opcode,
            massive: false,
            payload: BytesMut::from(payload),
            read_pos: 0,
        }
    }

    /// The opcode identifying the operation this message carries.
    pub fn opcode(&self) -> u16 {
        self.opcode
    }

    /// The current payload length in bytes.
    pub fn size(&self) -> u16 {
        self.payload.len() as u16
    }

    /// Whether this message requests fragmented transport.
    pub fn is_massive(&self) -> bool {
        self.massive
    }

    /// Marks this message for fragmented transport.
    pub fn set_massive(&mut self, massive: bool) {
        self.massive = massive;
    }

    /// Builder-style variant of [set_massive][Self::set_massive].
    pub fn massive(mut self) -> Self {
        self.massive = true;
        self
    }

    /// The whole payload, for the framing layer.
    pub fn as_data(&self) -> &[u8] {
        &self.payload
    }

    /// The whole payload, mutable.
    pub fn as_data_mut(&mut self) -> &mut [u8] {
        &mut self.payload
    }

    /// The number of bytes the read cursor has not consumed yet.
    pub fn remaining(&self) -> usize {
        self.payload.len() - self.read_pos
    }

    pub fn write_u8(&mut self, value: u8) {
        self.payload.put_u8(value);
    }

    pub fn write_u16(&mut self, value: u16) {
        self.payload.put_u16_le(value);
    }

    pub fn write_u32(&mut self, value: u32) {
        self.payload.put_u32_le(value);
    }

    pub fn write_u64(&mut self, value: u64) {
        self.payload.put_u64_le(value);
    }

    pub fn write_i8(&mut self, value: i8) {
        self.payload.put_i8(value);
    }

    pub fn write_i16(&mut self, value: i16) {
        self.payload.put_i16_le(value);
    }

    pub fn write_i32(&mut self, value: i32) {
        self.payload.put_i32_le(value);
    }

    pub fn write_i64(&mut self, value: i64) {
        self.payload.put_i64_le(value);
    }

    pub fn write_bytes(&mut self, value: &[u8]) {
        self.payload.put_slice(value);
    }

    /// Writes a `u16` length prefix followed by the UTF-8 bytes of `value`.
    pub fn write_string(&mut self, value: &str) {
        self.payload.put_u16_le(value.len() as u16);
        self.payload.put_slice(value.as_bytes());
    }

    fn take(&mut self, count: usize) -> Result<&[u8]> {
        if self.read_pos + count > self.payload.len() {
            return Err(MessageError::ReadOutOfBounds {
                position: self.read_pos,
                requested: count,
                length: self.payload.len(),
            });
        }

        let slice = &self.payload[self.read_pos..self.read_pos + count];
        self.read_pos += count;
        Ok(slice)
    }

    fn take_array<const N: usize>(&mut self) -> Result<[u8; N]> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    pub fn read_u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    pub fn read_u16(&mut self) -> Result<u16> {
        Ok(u16::from_le_bytes(self.take_array()?))
    }

    pub fn read_u32(&mut self) -> Result<u32> {
        Ok(u32::from_le_bytes(self.take_array()?))
    }

    pub fn read_u64(&mut self) -> Result<u64> {
        Ok(u64::from_le_bytes(self.take_array()?))
    }

    pub fn read_i8(&mut self) -> Result<i8> {
        Ok(self.read_u8()? as i8)
    }

    pub fn read_i16(&mut self) -> Result<i16> {
        Ok(i16::from_le_bytes(self.take_array()?))
    }

    pub fn read_i32(&mut self) -> Result<i32> {
        Ok(i32::from_le_bytes(self.take_array()?))
    }

    pub fn read_i64(&mut self) -> Result<i64> {
        Ok(i64::from_le_bytes(self.take_array()?))
    }

    /// Reads `count` raw bytes as an owned buffer.
    pub fn read_bytes(&mut self, count: usize) -> Result<Bytes> {
        Ok(Bytes::copy_from_slice(self.take(count)?))
    }

    /// Reads a `u16` length prefix followed by that many UTF-8 bytes.
    pub fn read_string(&mut self) -> Result<String> {
        let length = usize::from(self.read_u16()?);
        let bytes = self.take(length)?;
        String::from_utf8(bytes.to_vec()).map_err(|_| MessageError::InvalidUtf8)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn round_trips_primitives() {
        let mut message = Message::new(0x3001);
        message.write_u8(0x01);
        message.write_u16(0x0203);
        message.write_u32(0x0405_0607);
        message.write_u64(0x0809_0a0b_0c0d_0e0f);
        message.write_i32(-7);

        assert_eq!(0x01, message.read_u8().unwrap());
        assert_eq!(0x0203, message.read_u16().unwrap());
        assert_eq!(0x0405_0607, message.read_u32().unwrap());
        assert_eq!(0x0809_0a0b_0c0d_0e0f, message.read_u64().unwrap());
        assert_eq!(-7, message.read_i32().unwrap());
        assert_eq!(0, message.remaining());
    }

    #[test]
    fn payload_is_little_endian() {
        let mut message = Message::new(0x3001);
        message.write_u16(0x2001);
        assert_eq!(&[0x01, 0x20], message.as_data());
    }

    #[test]
    fn strings_are_length_prefixed() {
        let mut message = Message::new(0x3001);
        message.write_string("hi");
        assert_eq!(&[0x02, 0x00, 0x68, 0x69], message.as_data());
        assert_eq!("hi", message.read_string().unwrap());
    }

    #[test]
    fn read_past_end_fails() {
        let mut message = Message::from_payload(0x3001, &[0x01, 0x02]);
        assert_eq!(0x01, message.read_u8().unwrap());
        assert!(matches!(
            message.read_u32(),
            Err(MessageError::ReadOutOfBounds {
                position: 1,
                requested: 4,
                length: 2,
            })
        ));
        // A failed read must not consume anything.
        assert_eq!(0x02, message.read_u8().unwrap());
    }

    #[test]
    fn invalid_utf8_fails() {
        let mut message = Message::from_payload(0x3001, &[0x02, 0x00, 0xff, 0xfe]);
        assert!(matches!(
            message.read_string(),
            Err(MessageError::InvalidUtf8)
        ));
    }

    #[test]
    fn massive_flag_defaults_off() {
        let message = Message::new(0x3001);
        assert!(!message.is_massive());
        assert!(Message::new(0x3001).massive().is_massive());
    }
}
