//! Bounds-checked payload reader and length-encoded writers.

use bytes::{BufMut, Bytes, BytesMut};

use super::error::DecodeError;

/// Cursor over a payload. Every read checks the remaining length and reports
/// which field was truncated.
pub(crate) struct Reader<'a> {
    buf: &'a Bytes,
    pos: usize,
}

impl<'a> Reader<'a> {
    pub fn new(buf: &'a Bytes) -> Self {
        Self { buf, pos: 0 }
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    pub fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    pub fn peek(&self) -> Option<u8> {
        self.buf.get(self.pos).copied()
    }

    fn need(&self, what: &'static str, n: usize) -> Result<(), DecodeError> {
        if self.remaining() < n {
            return Err(DecodeError::Truncated {
                what,
                needed: n,
                available: self.remaining(),
            });
        }
        Ok(())
    }

    pub fn u8(&mut self, what: &'static str) -> Result<u8, DecodeError> {
        self.need(what, 1)?;
        let v = self.buf[self.pos];
        self.pos += 1;
        Ok(v)
    }

    pub fn u16(&mut self, what: &'static str) -> Result<u16, DecodeError> {
        let b = self.take(what, 2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    pub fn u32(&mut self, what: &'static str) -> Result<u32, DecodeError> {
        let b = self.take(what, 4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    /// Zero-copy slice of the next `n` bytes.
    pub fn take(&mut self, what: &'static str, n: usize) -> Result<Bytes, DecodeError> {
        self.need(what, n)?;
        let out = self.buf.slice(self.pos..self.pos + n);
        self.pos += n;
        Ok(out)
    }

    pub fn rest(&mut self) -> Bytes {
        let out = self.buf.slice(self.pos..);
        self.pos = self.buf.len();
        out
    }

    /// Bytes up to (not including) the next NUL; the NUL is consumed.
    pub fn null_terminated(&mut self, what: &'static str) -> Result<Bytes, DecodeError> {
        let end = self.buf[self.pos..]
            .iter()
            .position(|&b| b == 0)
            .ok_or_else(|| DecodeError::malformed(what, "missing NUL terminator"))?;
        let out = self.buf.slice(self.pos..self.pos + end);
        self.pos += end + 1;
        Ok(out)
    }

    /// Like `null_terminated`, but a missing terminator takes the rest.
    pub fn null_terminated_or_rest(&mut self) -> Bytes {
        match self.buf[self.pos..].iter().position(|&b| b == 0) {
            Some(end) => {
                let out = self.buf.slice(self.pos..self.pos + end);
                self.pos += end + 1;
                out
            }
            None => self.rest(),
        }
    }

    pub fn lenenc_int(&mut self, what: &'static str) -> Result<u64, DecodeError> {
        match self.u8(what)? {
            n @ 0x00..=0xfa => Ok(n as u64),
            0xfc => Ok(self.u16(what)? as u64),
            0xfd => {
                let b = self.take(what, 3)?;
                Ok(b[0] as u64 | (b[1] as u64) << 8 | (b[2] as u64) << 16)
            }
            0xfe => {
                let b = self.take(what, 8)?;
                let mut arr = [0u8; 8];
                arr.copy_from_slice(&b);
                Ok(u64::from_le_bytes(arr))
            }
            other => Err(DecodeError::malformed(
                what,
                format!("invalid length-encoded integer prefix 0x{other:02x}"),
            )),
        }
    }

    pub fn lenenc_bytes(&mut self, what: &'static str) -> Result<Bytes, DecodeError> {
        let len = self.lenenc_int(what)?;
        let len = usize::try_from(len)
            .map_err(|_| DecodeError::malformed(what, "length does not fit in memory"))?;
        self.take(what, len)
    }

    /// Length-encoded string including its prefix, exactly as on the wire.
    pub fn lenenc_raw(&mut self, what: &'static str) -> Result<Bytes, DecodeError> {
        let start = self.pos;
        self.lenenc_bytes(what)?;
        Ok(self.buf.slice(start..self.pos))
    }

    pub fn lenenc_string(&mut self, what: &'static str) -> Result<String, DecodeError> {
        Ok(lossy(&self.lenenc_bytes(what)?))
    }
}

pub(crate) fn lossy(b: &[u8]) -> String {
    String::from_utf8_lossy(b).into_owned()
}

/// Encode a length-encoded integer
pub(crate) fn put_lenenc_int(buf: &mut BytesMut, value: u64) {
    if value < 251 {
        buf.put_u8(value as u8);
    } else if value < 0x1_0000 {
        buf.put_u8(0xfc);
        buf.put_u16_le(value as u16);
    } else if value < 0x100_0000 {
        buf.put_u8(0xfd);
        buf.put_u8((value & 0xff) as u8);
        buf.put_u8(((value >> 8) & 0xff) as u8);
        buf.put_u8(((value >> 16) & 0xff) as u8);
    } else {
        buf.put_u8(0xfe);
        buf.put_u64_le(value);
    }
}

pub(crate) fn put_lenenc_bytes(buf: &mut BytesMut, value: &[u8]) {
    put_lenenc_int(buf, value.len() as u64);
    buf.extend_from_slice(value);
}

pub(crate) fn put_null_terminated(buf: &mut BytesMut, value: &[u8]) {
    buf.extend_from_slice(value);
    buf.put_u8(0);
}
