//! Bounds-checked little-endian reader shared by the packet and event parsers.

use crate::{Error, Result};

/// Cursor over a received payload.
///
/// Every read checks the remaining length and reports a protocol error
/// naming what was being read instead of panicking on short input.
#[derive(Debug, Clone)]
pub struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    pub fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    /// Everything not read yet, consuming it.
    pub fn rest(&mut self) -> &'a [u8] {
        let rest = &self.data[self.pos..];
        self.pos = self.data.len();
        rest
    }

    pub fn peek_u8(&self) -> Option<u8> {
        self.data.get(self.pos).copied()
    }

    pub fn take(&mut self, len: usize, what: &str) -> Result<&'a [u8]> {
        if self.remaining() < len {
            return Err(Error::Protocol(format!(
                "truncated {}: need {} bytes, {} left",
                what,
                len,
                self.remaining()
            )));
        }
        let out = &self.data[self.pos..self.pos + len];
        self.pos += len;
        Ok(out)
    }

    pub fn skip(&mut self, len: usize, what: &str) -> Result<()> {
        self.take(len, what).map(|_| ())
    }

    /// Reads an unsigned little-endian integer of `width` bytes (at most 8).
    pub fn uint_le(&mut self, width: usize, what: &str) -> Result<u64> {
        let bytes = self.take(width, what)?;
        Ok(bytes
            .iter()
            .rev()
            .fold(0u64, |acc, byte| (acc << 8) | u64::from(*byte)))
    }

    pub fn u8(&mut self, what: &str) -> Result<u8> {
        Ok(self.take(1, what)?[0])
    }

    pub fn u16_le(&mut self, what: &str) -> Result<u16> {
        Ok(self.uint_le(2, what)? as u16)
    }

    pub fn u32_le(&mut self, what: &str) -> Result<u32> {
        Ok(self.uint_le(4, what)? as u32)
    }

    pub fn u64_le(&mut self, what: &str) -> Result<u64> {
        self.uint_le(8, what)
    }

    /// Length-encoded integer as used in table maps, rows events and
    /// result sets.
    pub fn packed_int(&mut self, what: &str) -> Result<u64> {
        match self.u8(what)? {
            first @ 0..=250 => Ok(u64::from(first)),
            252 => self.uint_le(2, what),
            253 => self.uint_le(3, what),
            254 => self.uint_le(8, what),
            other => Err(Error::Protocol(format!(
                "invalid packed integer prefix {:#04x} in {}",
                other, what
            ))),
        }
    }

    /// Bytes up to the next NUL, consuming the terminator.
    ///
    /// Without a terminator the rest of the payload is returned.
    pub fn null_terminated(&mut self) -> &'a [u8] {
        let rest = &self.data[self.pos..];
        match rest.iter().position(|&b| b == 0) {
            Some(end) => {
                self.pos += end + 1;
                &rest[..end]
            }
            None => {
                self.pos = self.data.len();
                rest
            }
        }
    }
}

/// Lossy UTF-8 conversion for names and messages from the server.
pub fn lossy_string(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes).into_owned()
}

/// Splits an error packet (status byte included) into code and message.
///
/// The SQL state marker and its five characters are dropped when present.
pub fn parse_error_packet(payload: &[u8]) -> (u16, String) {
    let body = payload.get(1..).unwrap_or_default();
    let code = match body {
        [lo, hi, ..] => u16::from_le_bytes([*lo, *hi]),
        _ => 0,
    };
    let rest = body.get(2..).unwrap_or_default();
    let message = match rest.first() {
        Some(b'#') => rest.get(6..).unwrap_or_default(),
        _ => rest,
    };
    (code, lossy_string(message))
}

/// [`Error::Server`] for an error packet.
pub fn server_error(payload: &[u8]) -> Error {
    let (code, message) = parse_error_packet(payload);
    Error::Server { code, message }
}
