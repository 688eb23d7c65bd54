//! Message framing over a byte stream.
//!
//! [`ReadBuffer`] accumulates raw socket data and hands out whole
//! messages; a message stays at the head of the buffer until it is
//! finished, so it can be unread ([`ReadBuffer::put_message`]) and
//! picked up again by a later handler. [`WriteBuffer`] composes
//! outbound messages back-to-back and backpatches each length header,
//! so a flush can never split a logical message.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use patina_types::error::ServerError;

/// Message header: type byte plus u32 length (which counts itself).
const HEADER_SIZE: usize = 5;

#[derive(Debug, Clone, Copy)]
struct Current {
    mtype: u8,
    payload_len: usize,
    pos: usize,
}

#[derive(Debug, Default)]
pub struct ReadBuffer {
    buf: BytesMut,
    current: Option<Current>,
    /// Whether `current` is held by a handler. A pending message with
    /// `taken == false` has been unread and waits for the next take.
    taken: bool,
}

impl ReadBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn feed_data(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Consumes the raw 4-byte protocol version that precedes framed
    /// messages on a fresh connection.
    pub fn take_proto_version(&mut self) -> Option<(i16, i16)> {
        debug_assert!(self.current.is_none());
        if self.buf.len() < 4 {
            return None;
        }
        let hi = i16::from_be_bytes([self.buf[0], self.buf[1]]);
        let lo = i16::from_be_bytes([self.buf[2], self.buf[3]]);
        self.buf.advance(4);
        Some((hi, lo))
    }

    fn peek_header(&self) -> Result<Option<(u8, usize)>, ServerError> {
        if self.buf.len() < HEADER_SIZE {
            return Ok(None);
        }
        let mtype = self.buf[0];
        let len = u32::from_be_bytes([self.buf[1], self.buf[2], self.buf[3], self.buf[4]]) as usize;
        if len < 4 {
            return Err(ServerError::binary_protocol(format!(
                "invalid message length {len}"
            )));
        }
        let payload_len = len - 4;
        if self.buf.len() < HEADER_SIZE + payload_len {
            return Ok(None);
        }
        Ok(Some((mtype, payload_len)))
    }

    /// Positions the cursor at the next whole message, if one is
    /// buffered.
    pub fn take_message(&mut self) -> Result<bool, ServerError> {
        if let Some(cur) = self.current {
            if self.taken {
                return Err(ServerError::internal(format!(
                    "message {:?} is still being read",
                    cur.mtype as char
                )));
            }
            self.taken = true;
            return Ok(true);
        }
        match self.peek_header()? {
            Some((mtype, payload_len)) => {
                self.current = Some(Current {
                    mtype,
                    payload_len,
                    pos: 0,
                });
                self.taken = true;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Like [`take_message`](Self::take_message), but only takes the
    /// next message when it has type `mtype`.
    pub fn take_message_type(&mut self, mtype: u8) -> Result<bool, ServerError> {
        if let Some(cur) = self.current {
            if self.taken {
                return Err(ServerError::internal(
                    "cannot peek while a message is being read",
                ));
            }
            if cur.mtype == mtype {
                self.taken = true;
                return Ok(true);
            }
            return Ok(false);
        }
        match self.peek_header()? {
            Some((t, payload_len)) if t == mtype => {
                self.current = Some(Current {
                    mtype,
                    payload_len,
                    pos: 0,
                });
                self.taken = true;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    fn cur(&self) -> Result<Current, ServerError> {
        match self.current {
            Some(cur) if self.taken => Ok(cur),
            _ => Err(ServerError::internal("no message is being read")),
        }
    }

    pub fn message_type(&self) -> Result<u8, ServerError> {
        Ok(self.cur()?.mtype)
    }

    fn read_exact(&mut self, n: usize) -> Result<&[u8], ServerError> {
        let cur = self.cur()?;
        if cur.pos + n > cur.payload_len {
            return Err(ServerError::binary_protocol("insufficient data in message"));
        }
        let start = HEADER_SIZE + cur.pos;
        if let Some(c) = self.current.as_mut() {
            c.pos += n;
        }
        Ok(&self.buf[start..start + n])
    }

    pub fn read_byte(&mut self) -> Result<u8, ServerError> {
        Ok(self.read_exact(1)?[0])
    }

    pub fn read_i16(&mut self) -> Result<i16, ServerError> {
        let b = self.read_exact(2)?;
        Ok(i16::from_be_bytes([b[0], b[1]]))
    }

    pub fn read_i32(&mut self) -> Result<i32, ServerError> {
        let b = self.read_exact(4)?;
        Ok(i32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub fn read_i64(&mut self) -> Result<i64, ServerError> {
        let b = self.read_exact(8)?;
        Ok(i64::from_be_bytes([
            b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7],
        ]))
    }

    pub fn read_bytes(&mut self, n: usize) -> Result<Bytes, ServerError> {
        Ok(Bytes::copy_from_slice(self.read_exact(n)?))
    }

    /// u32-length-prefixed UTF-8 string.
    pub fn read_utf8(&mut self) -> Result<String, ServerError> {
        let len = self.read_i32()? as u32 as usize;
        let bytes = self.read_exact(len)?;
        String::from_utf8(bytes.to_vec())
            .map_err(|_| ServerError::binary_protocol("invalid UTF-8 in string"))
    }

    /// Null-terminated byte string.
    pub fn read_null_str(&mut self) -> Result<Bytes, ServerError> {
        let cur = self.cur()?;
        let start = HEADER_SIZE + cur.pos;
        let end = HEADER_SIZE + cur.payload_len;
        let rest = &self.buf[start..end];
        let nul = rest
            .iter()
            .position(|&b| b == 0)
            .ok_or_else(|| ServerError::binary_protocol("unterminated string in message"))?;
        let out = Bytes::copy_from_slice(&rest[..nul]);
        if let Some(c) = self.current.as_mut() {
            c.pos += nul + 1;
        }
        Ok(out)
    }

    /// Remainder of the current message.
    pub fn consume_message(&mut self) -> Result<Bytes, ServerError> {
        let cur = self.cur()?;
        let start = HEADER_SIZE + cur.pos;
        let end = HEADER_SIZE + cur.payload_len;
        let out = Bytes::copy_from_slice(&self.buf[start..end]);
        if let Some(c) = self.current.as_mut() {
            c.pos = c.payload_len;
        }
        Ok(out)
    }

    /// Drops the current message, consuming any unread remainder. A
    /// no-op when no message is being read, so error paths can call it
    /// unconditionally.
    pub fn finish_message(&mut self) {
        if !self.taken {
            return;
        }
        if let Some(cur) = self.current.take() {
            self.buf.advance(HEADER_SIZE + cur.payload_len);
        }
        self.taken = false;
    }

    /// Drops a message without regard to how much of it was read.
    pub fn discard_message(&mut self) {
        self.finish_message();
    }

    /// Unreads the current message so the next take sees it again.
    pub fn put_message(&mut self) {
        debug_assert!(self.taken, "no message to put back");
        if let Some(cur) = self.current.as_mut() {
            cur.pos = 0;
        }
        self.taken = false;
    }
}

#[derive(Debug, Default)]
pub struct WriteBuffer {
    buf: BytesMut,
    msg_start: Option<usize>,
}

impl WriteBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn new_message(&mut self, mtype: u8) -> &mut Self {
        debug_assert!(self.msg_start.is_none(), "previous message not ended");
        self.buf.put_u8(mtype);
        self.msg_start = Some(self.buf.len());
        self.buf.put_u32(0); // length, patched by end_message
        self
    }

    pub fn end_message(&mut self) -> &mut Self {
        let start = self.msg_start.take().expect("no message in progress");
        let len = (self.buf.len() - start) as u32;
        self.buf[start..start + 4].copy_from_slice(&len.to_be_bytes());
        self
    }

    pub fn write_byte(&mut self, v: u8) -> &mut Self {
        self.buf.put_u8(v);
        self
    }

    pub fn write_i16(&mut self, v: i16) -> &mut Self {
        self.buf.put_i16(v);
        self
    }

    pub fn write_u16(&mut self, v: u16) -> &mut Self {
        self.buf.put_u16(v);
        self
    }

    pub fn write_i32(&mut self, v: i32) -> &mut Self {
        self.buf.put_i32(v);
        self
    }

    pub fn write_u32(&mut self, v: u32) -> &mut Self {
        self.buf.put_u32(v);
        self
    }

    pub fn write_i64(&mut self, v: i64) -> &mut Self {
        self.buf.put_i64(v);
        self
    }

    pub fn write_bytes(&mut self, v: &[u8]) -> &mut Self {
        self.buf.put_slice(v);
        self
    }

    /// u32-length-prefixed UTF-8 string.
    pub fn write_utf8(&mut self, v: &str) -> &mut Self {
        self.buf.put_u32(v.len() as u32);
        self.buf.put_slice(v.as_bytes());
        self
    }

    /// Null-terminated byte string.
    pub fn write_cstr(&mut self, v: &[u8]) -> &mut Self {
        debug_assert!(!v.contains(&0));
        self.buf.put_slice(v);
        self.buf.put_u8(0);
        self
    }

    /// Appends another buffer of completed messages.
    pub fn write_buffer(&mut self, other: WriteBuffer) {
        debug_assert!(self.msg_start.is_none() && other.msg_start.is_none());
        self.buf.unsplit(other.buf);
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Takes everything composed so far for writing to the transport.
    pub fn take(&mut self) -> Bytes {
        debug_assert!(self.msg_start.is_none(), "message in progress during flush");
        self.buf.split().freeze()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn msg(mtype: u8, payload: &[u8]) -> Vec<u8> {
        let mut out = vec![mtype];
        out.extend_from_slice(&((payload.len() + 4) as u32).to_be_bytes());
        out.extend_from_slice(payload);
        out
    }

    #[test]
    fn take_message_needs_whole_message() {
        let mut buf = ReadBuffer::new();
        let bytes = msg(b'P', b"\x00\x00\x00\x2a");
        buf.feed_data(&bytes[..4]);
        assert!(!buf.take_message().unwrap());
        buf.feed_data(&bytes[4..]);
        assert!(buf.take_message().unwrap());
        assert_eq!(buf.message_type().unwrap(), b'P');
        assert_eq!(buf.read_i32().unwrap(), 42);
        buf.finish_message();
        assert!(!buf.take_message().unwrap());
    }

    #[test]
    fn reads_past_payload_fail() {
        let mut buf = ReadBuffer::new();
        buf.feed_data(&msg(b'E', b"\x01"));
        assert!(buf.take_message().unwrap());
        assert_eq!(buf.read_byte().unwrap(), 1);
        assert!(buf.read_byte().is_err());
    }

    #[test]
    fn null_str_and_utf8() {
        let mut payload = Vec::new();
        payload.extend_from_slice(&4u32.to_be_bytes());
        payload.extend_from_slice(b"user");
        payload.extend_from_slice(b"SELECT 1\0");
        let mut buf = ReadBuffer::new();
        buf.feed_data(&msg(b'P', &payload));
        assert!(buf.take_message().unwrap());
        assert_eq!(buf.read_utf8().unwrap(), "user");
        assert_eq!(buf.read_null_str().unwrap(), Bytes::from_static(b"SELECT 1"));
        buf.finish_message();
    }

    #[test]
    fn unterminated_null_str_fails() {
        let mut buf = ReadBuffer::new();
        buf.feed_data(&msg(b'Q', b"SELECT 1"));
        assert!(buf.take_message().unwrap());
        assert!(buf.read_null_str().is_err());
    }

    #[test]
    fn put_message_allows_retake() {
        let mut buf = ReadBuffer::new();
        buf.feed_data(&msg(b'S', b""));
        assert!(buf.take_message_type(b'S').unwrap());
        buf.put_message();
        // unread message is seen again, with the cursor reset
        assert!(buf.take_message().unwrap());
        assert_eq!(buf.message_type().unwrap(), b'S');
        buf.finish_message();
    }

    #[test]
    fn take_message_type_mismatch_leaves_message() {
        let mut buf = ReadBuffer::new();
        buf.feed_data(&msg(b'E', b"x"));
        assert!(!buf.take_message_type(b'S').unwrap());
        assert!(buf.take_message().unwrap());
        assert_eq!(buf.message_type().unwrap(), b'E');
    }

    #[test]
    fn finish_consumes_unread_remainder() {
        let mut buf = ReadBuffer::new();
        buf.feed_data(&msg(b'D', b"\x00\x01\x02\x03"));
        buf.feed_data(&msg(b'S', b""));
        assert!(buf.take_message().unwrap());
        assert_eq!(buf.read_byte().unwrap(), 0);
        buf.finish_message();
        assert!(buf.take_message().unwrap());
        assert_eq!(buf.message_type().unwrap(), b'S');
    }

    #[test]
    fn finish_without_message_is_noop() {
        let mut buf = ReadBuffer::new();
        buf.finish_message();
        buf.feed_data(&msg(b'S', b""));
        assert!(buf.take_message().unwrap());
    }

    #[test]
    fn proto_version() {
        let mut buf = ReadBuffer::new();
        buf.feed_data(&[0, 1]);
        assert_eq!(buf.take_proto_version(), None);
        buf.feed_data(&[0, 0]);
        assert_eq!(buf.take_proto_version(), Some((1, 0)));
    }

    #[test]
    fn invalid_length_is_an_error() {
        let mut buf = ReadBuffer::new();
        buf.feed_data(&[b'P', 0, 0, 0, 1, 0]);
        assert!(buf.take_message().is_err());
    }

    #[test]
    fn write_buffer_patches_lengths() {
        let mut out = WriteBuffer::new();
        out.new_message(b'Z').write_byte(b'I').end_message();
        out.new_message(b'C').end_message();
        let bytes = out.take();
        assert_eq!(&bytes[..], &[b'Z', 0, 0, 0, 5, b'I', b'C', 0, 0, 0, 4]);
    }

    #[test]
    fn write_utf8_and_cstr() {
        let mut out = WriteBuffer::new();
        out.new_message(b'S')
            .write_utf8("ab")
            .write_cstr(b"cd")
            .end_message();
        let bytes = out.take();
        assert_eq!(
            &bytes[..],
            &[b'S', 0, 0, 0, 13, 0, 0, 0, 2, b'a', b'b', b'c', b'd', 0]
        );
    }

    #[test]
    fn write_buffer_append() {
        let mut a = WriteBuffer::new();
        a.new_message(b'C').end_message();
        let mut b = WriteBuffer::new();
        b.new_message(b'Z').write_byte(b'I').end_message();
        a.write_buffer(b);
        assert_eq!(a.len(), 5 + 6);
    }
}
