//! Canonical byte encoding used as hash input.
//!
//! Encoding format:
//! - every structure starts with a length-prefixed domain tag
//! - integers are fixed width, big-endian
//! - variable-length fields (strings, byte strings) carry a u32 length prefix
//! - optional hashes carry a presence byte (0 = absent, 1 = present + 32 bytes)
//! - floats are encoded as their IEEE-754 bit pattern
//!
//! No two distinct field sequences share an encoding, so `"AB" + "C"` and
//! `"A" + "BC"` hash differently.

use crate::hash::Hash;

#[derive(Default)]
pub struct CanonicalEncoder {
    buf: Vec<u8>,
}

impl CanonicalEncoder {
    pub fn new(domain: &str) -> Self {
        let mut enc = Self {
            buf: Vec::with_capacity(128),
        };
        enc.put_str(domain);
        enc
    }

    pub fn put_u8(&mut self, v: u8) -> &mut Self {
        self.buf.push(v);
        self
    }

    pub fn put_u16(&mut self, v: u16) -> &mut Self {
        self.buf.extend_from_slice(&v.to_be_bytes());
        self
    }

    pub fn put_u32(&mut self, v: u32) -> &mut Self {
        self.buf.extend_from_slice(&v.to_be_bytes());
        self
    }

    pub fn put_u64(&mut self, v: u64) -> &mut Self {
        self.buf.extend_from_slice(&v.to_be_bytes());
        self
    }

    pub fn put_f32(&mut self, v: f32) -> &mut Self {
        self.put_u32(v.to_bits())
    }

    pub fn put_bytes(&mut self, v: &[u8]) -> &mut Self {
        // callers bound every field far below u32::MAX
        let len = u32::try_from(v.len()).unwrap_or(u32::MAX);
        self.put_u32(len);
        self.buf.extend_from_slice(v);
        self
    }

    pub fn put_str(&mut self, v: &str) -> &mut Self {
        self.put_bytes(v.as_bytes())
    }

    pub fn put_hash(&mut self, v: &Hash) -> &mut Self {
        self.buf.extend_from_slice(v.as_bytes());
        self
    }

    pub fn put_opt_hash(&mut self, v: Option<&Hash>) -> &mut Self {
        match v {
            Some(h) => {
                self.put_u8(1);
                self.put_hash(h)
            }
            None => self.put_u8(0),
        }
    }

    pub fn finish(self) -> Vec<u8> {
        self.buf
    }
}
