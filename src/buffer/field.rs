use bytes::{Buf, BufMut};

use crate::common::{Result, StrataError};

/// The shape of a value stored inside a page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldType {
    Int,
    Long,
    Bytes,
    Str,
}

/// A value read from or written to a page.
///
/// Integers are big-endian; byte strings and text carry a `u32` length prefix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldValue {
    Int(i32),
    Long(i64),
    Bytes(Vec<u8>),
    Str(String),
}

impl FieldValue {
    pub fn field_type(&self) -> FieldType {
        match self {
            FieldValue::Int(_) => FieldType::Int,
            FieldValue::Long(_) => FieldType::Long,
            FieldValue::Bytes(_) => FieldType::Bytes,
            FieldValue::Str(_) => FieldType::Str,
        }
    }

    /// Number of bytes this value occupies on the page.
    pub fn encoded_len(&self) -> usize {
        match self {
            FieldValue::Int(_) => 4,
            FieldValue::Long(_) => 8,
            FieldValue::Bytes(b) => 4 + b.len(),
            FieldValue::Str(s) => 4 + s.len(),
        }
    }

    pub(crate) fn encode_into(&self, mut dst: &mut [u8]) {
        match self {
            FieldValue::Int(v) => dst.put_i32(*v),
            FieldValue::Long(v) => dst.put_i64(*v),
            FieldValue::Bytes(b) => {
                dst.put_u32(b.len() as u32);
                dst.put_slice(b);
            }
            FieldValue::Str(s) => {
                dst.put_u32(s.len() as u32);
                dst.put_slice(s.as_bytes());
            }
        }
    }

    /// Decodes a value of type `ty` from `src`, which starts at `offset`
    /// within a payload of `size` bytes.
    pub(crate) fn decode(ty: FieldType, src: &[u8], offset: usize, size: usize) -> Result<Self> {
        let need = |len: usize| {
            if src.len() < len {
                Err(StrataError::OutOfBounds { offset, len, size })
            } else {
                Ok(())
            }
        };

        let mut buf = src;
        match ty {
            FieldType::Int => {
                need(4)?;
                Ok(FieldValue::Int(buf.get_i32()))
            }
            FieldType::Long => {
                need(8)?;
                Ok(FieldValue::Long(buf.get_i64()))
            }
            FieldType::Bytes | FieldType::Str => {
                need(4)?;
                let len = buf.get_u32() as usize;
                need(4 + len)?;
                let raw = buf[..len].to_vec();
                if ty == FieldType::Bytes {
                    Ok(FieldValue::Bytes(raw))
                } else {
                    Ok(FieldValue::Str(String::from_utf8(raw)?))
                }
            }
        }
    }
}

impl From<i32> for FieldValue {
    fn from(v: i32) -> Self {
        FieldValue::Int(v)
    }
}

impl From<i64> for FieldValue {
    fn from(v: i64) -> Self {
        FieldValue::Long(v)
    }
}

impl From<&str> for FieldValue {
    fn from(v: &str) -> Self {
        FieldValue::Str(v.to_string())
    }
}

impl From<Vec<u8>> for FieldValue {
    fn from(v: Vec<u8>) -> Self {
        FieldValue::Bytes(v)
    }
}
