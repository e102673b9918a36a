//! Bitcoin wire encoding helpers
//!
//! Little-endian integers, CompactSize variable-length integers and
//! length-prefixed byte arrays, layered over the `bytes` buffers.

use bytes::{Buf, BufMut};
use thiserror::Error;

use crate::crypto::Hash;

/// Upper bound for any single length prefix we accept from the wire
pub const MAX_VEC_SIZE: u64 = 4_000_000;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("Unexpected end of data: needed {needed} bytes, {remaining} remaining")]
    UnexpectedEof { needed: usize, remaining: usize },
    #[error("Length prefix too large: {0}")]
    OversizedLength(u64),
    #[error("Non-canonical variable length integer")]
    NonCanonicalVarInt,
    #[error("Invalid data: {0}")]
    InvalidData(String),
}

/// Bounds-checked cursor over a byte slice
pub struct Reader<'a> {
    data: &'a [u8],
}

impl<'a> Reader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data }
    }

    pub fn remaining(&self) -> usize {
        self.data.remaining()
    }

    pub fn is_empty(&self) -> bool {
        !self.data.has_remaining()
    }

    fn ensure(&self, needed: usize) -> Result<(), DecodeError> {
        if self.data.remaining() < needed {
            return Err(DecodeError::UnexpectedEof {
                needed,
                remaining: self.data.remaining(),
            });
        }
        Ok(())
    }

    pub fn read_u8(&mut self) -> Result<u8, DecodeError> {
        self.ensure(1)?;
        Ok(self.data.get_u8())
    }

    pub fn read_u16_be(&mut self) -> Result<u16, DecodeError> {
        self.ensure(2)?;
        Ok(self.data.get_u16())
    }

    pub fn read_u16_le(&mut self) -> Result<u16, DecodeError> {
        self.ensure(2)?;
        Ok(self.data.get_u16_le())
    }

    pub fn read_u32_le(&mut self) -> Result<u32, DecodeError> {
        self.ensure(4)?;
        Ok(self.data.get_u32_le())
    }

    pub fn read_i32_le(&mut self) -> Result<i32, DecodeError> {
        self.ensure(4)?;
        Ok(self.data.get_i32_le())
    }

    pub fn read_u64_le(&mut self) -> Result<u64, DecodeError> {
        self.ensure(8)?;
        Ok(self.data.get_u64_le())
    }

    pub fn read_i64_le(&mut self) -> Result<i64, DecodeError> {
        self.ensure(8)?;
        Ok(self.data.get_i64_le())
    }

    pub fn read_bytes(&mut self, len: usize) -> Result<&'a [u8], DecodeError> {
        self.ensure(len)?;
        let (head, tail) = self.data.split_at(len);
        self.data = tail;
        Ok(head)
    }

    pub fn read_hash(&mut self) -> Result<Hash, DecodeError> {
        let bytes = self.read_bytes(32)?;
        let mut hash = [0u8; 32];
        hash.copy_from_slice(bytes);
        Ok(hash)
    }

    /// CompactSize integer, rejecting non-minimal encodings
    pub fn read_var_int(&mut self) -> Result<u64, DecodeError> {
        let (value, min) = match self.read_u8()? {
            0xff => (self.read_u64_le()?, 0x1_0000_0000),
            0xfe => (u64::from(self.read_u32_le()?), 0x1_0000),
            0xfd => (u64::from(self.read_u16_le()?), 0xfd),
            n => return Ok(u64::from(n)),
        };
        if value < min {
            return Err(DecodeError::NonCanonicalVarInt);
        }
        Ok(value)
    }

    /// Length prefix used to size a following collection
    pub fn read_length(&mut self) -> Result<usize, DecodeError> {
        let len = self.read_var_int()?;
        if len > MAX_VEC_SIZE {
            return Err(DecodeError::OversizedLength(len));
        }
        Ok(len as usize)
    }

    pub fn read_var_bytes(&mut self) -> Result<Vec<u8>, DecodeError> {
        let len = self.read_length()?;
        Ok(self.read_bytes(len)?.to_vec())
    }

    pub fn read_var_string(&mut self) -> Result<String, DecodeError> {
        let bytes = self.read_var_bytes()?;
        String::from_utf8(bytes).map_err(|e| DecodeError::InvalidData(e.to_string()))
    }
}

/// Writer extensions for any `BufMut` (including `Vec<u8>` and `BytesMut`)
pub trait WriteExt: BufMut {
    fn put_var_int(&mut self, value: u64) {
        match value {
            0..=0xfc => self.put_u8(value as u8),
            0xfd..=0xffff => {
                self.put_u8(0xfd);
                self.put_u16_le(value as u16);
            }
            0x1_0000..=0xffff_ffff => {
                self.put_u8(0xfe);
                self.put_u32_le(value as u32);
            }
            _ => {
                self.put_u8(0xff);
                self.put_u64_le(value);
            }
        }
    }

    fn put_var_bytes(&mut self, bytes: &[u8]) {
        self.put_var_int(bytes.len() as u64);
        self.put_slice(bytes);
    }

    fn put_var_string(&mut self, value: &str) {
        self.put_var_bytes(value.as_bytes());
    }
}

impl<T: BufMut + ?Sized> WriteExt for T {}
