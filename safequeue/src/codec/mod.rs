//! Self-delimiting binary encoding of [`Record`]s into fixed-size slots.
//!
//! Every entry is written as
//!
//! ```text
//! key tag (i32) | key payload | value tag (i32) | value payload
//! ```
//!
//! Strings carry a `u16` length that counts a trailing NUL byte, numbers are
//! 8-byte doubles and booleans 4-byte integers. A nested record is written
//! inline as its entries followed by a [`Tag::TableEnd`]. There is no entry
//! count anywhere: the decoder walks tags until a scope closes. All integers
//! and doubles are little-endian.
//!
//! The top-level record closes either with an explicit `TableEnd` or, in the
//! legacy layout, with nothing at all: the slot is zero-filled before the
//! write, so the tail reads back as a `Nil` tag.

mod record;

use serde_derive::{Deserialize, Serialize};

pub use self::record::{Key, Record, Value};
use crate::errors::CodecError;

/// Nesting limit enforced on both encode and decode.
pub const MAX_DEPTH: usize = 100;

const TAG_LEN: usize = 4;
const NUMBER_LEN: usize = 8;
const BOOL_LEN: usize = 4;
const STRING_LEN_PREFIX: usize = 2;

/// Type tags as they appear on the wire.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(i32)]
pub enum Tag {
    Nil = 0,
    Boolean = 1,
    Number = 3,
    String = 4,
    Table = 5,
    /// Closes a nested scope. Never a key or value type.
    TableEnd = 9,
}

impl Tag {
    pub fn from_wire(raw: i32) -> Option<Tag> {
        match raw {
            0 => Some(Tag::Nil),
            1 => Some(Tag::Boolean),
            3 => Some(Tag::Number),
            4 => Some(Tag::String),
            5 => Some(Tag::Table),
            9 => Some(Tag::TableEnd),
            _ => None,
        }
    }

    fn to_wire(self) -> [u8; TAG_LEN] {
        (self as i32).to_le_bytes()
    }
}

/// How the outermost record is closed.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Terminator {
    /// Append a `TableEnd` tag after the last top-level entry.
    Explicit,
    /// Write nothing and rely on the zero-filled slot tail.
    Implicit,
}

impl Default for Terminator {
    fn default() -> Terminator {
        Terminator::Explicit
    }
}

struct Encoder<'a> {
    buf: &'a mut [u8],
    pos: usize,
}

impl<'a> Encoder<'a> {
    #[inline]
    fn put(&mut self, bytes: &[u8]) -> Result<(), CodecError> {
        let end = self.pos + bytes.len();
        if end > self.buf.len() {
            return Err(CodecError::Overflow {
                needed: end,
                capacity: self.buf.len(),
            });
        }
        self.buf[self.pos..end].copy_from_slice(bytes);
        self.pos = end;
        Ok(())
    }

    fn put_tag(&mut self, tag: Tag) -> Result<(), CodecError> {
        self.put(&tag.to_wire())
    }

    fn put_number(&mut self, n: f64) -> Result<(), CodecError> {
        self.put(&n.to_le_bytes())
    }

    fn put_string(&mut self, s: &[u8]) -> Result<(), CodecError> {
        let len = u16::try_from(s.len() + 1)
            .map_err(|_| CodecError::StringTooLong { len: s.len() })?;
        self.put(&len.to_le_bytes())?;
        self.put(s)?;
        self.put(&[0])
    }

    fn put_key(&mut self, key: &Key) -> Result<(), CodecError> {
        match key {
            Key::String(s) => {
                self.put_tag(Tag::String)?;
                self.put_string(s)
            }
            Key::Number(n) if n.is_nan() => Err(CodecError::InvalidKey("NaN number".to_string())),
            Key::Number(n) => {
                self.put_tag(Tag::Number)?;
                self.put_number(*n)
            }
        }
    }

    fn put_value(&mut self, value: &Value, depth: usize) -> Result<(), CodecError> {
        match value {
            Value::Nil => self.put_tag(Tag::Nil),
            Value::Bool(b) => {
                self.put_tag(Tag::Boolean)?;
                self.put(&i32::from(*b).to_le_bytes())
            }
            Value::Number(n) => {
                self.put_tag(Tag::Number)?;
                self.put_number(*n)
            }
            Value::String(s) => {
                self.put_tag(Tag::String)?;
                self.put_string(s)
            }
            Value::Record(r) => {
                self.put_tag(Tag::Table)?;
                self.put_entries(r, depth + 1)?;
                self.put_tag(Tag::TableEnd)
            }
        }
    }

    fn put_entries(&mut self, record: &Record, depth: usize) -> Result<(), CodecError> {
        if depth > MAX_DEPTH {
            return Err(CodecError::TooDeep { limit: MAX_DEPTH });
        }
        for (key, value) in record.iter() {
            self.put_key(key)?;
            self.put_value(value, depth)?;
        }
        Ok(())
    }
}

/// Encodes `record` into `buf`, returning the number of bytes written.
///
/// `buf` is zero-filled first, so whatever follows the encoding reads back
/// as a `Nil` tag. Fails instead of truncating when the record does not fit.
pub fn encode_into(record: &Record, buf: &mut [u8], terminator: Terminator) -> Result<usize, CodecError> {
    buf.fill(0);
    let mut enc = Encoder { buf, pos: 0 };
    enc.put_entries(record, 0)?;
    if terminator == Terminator::Explicit {
        enc.put_tag(Tag::TableEnd)?;
    }
    Ok(enc.pos)
}

/// Encodes `record` into a fresh buffer of at most `slot_size` bytes.
pub fn encode(record: &Record, slot_size: usize, terminator: Terminator) -> Result<Vec<u8>, CodecError> {
    let mut buf = vec![0u8; slot_size];
    let len = encode_into(record, &mut buf, terminator)?;
    buf.truncate(len);
    Ok(buf)
}

struct Decoder<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Decoder<'a> {
    fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    #[inline]
    fn take(&mut self, n: usize) -> Result<&'a [u8], CodecError> {
        if n > self.remaining() {
            return Err(CodecError::Truncated { offset: self.pos });
        }
        let bytes = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(bytes)
    }

    fn take_array<const N: usize>(&mut self) -> Result<[u8; N], CodecError> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    fn i32(&mut self) -> Result<i32, CodecError> {
        Ok(i32::from_le_bytes(self.take_array::<TAG_LEN>()?))
    }

    fn number(&mut self) -> Result<f64, CodecError> {
        Ok(f64::from_le_bytes(self.take_array::<NUMBER_LEN>()?))
    }

    fn string(&mut self) -> Result<Vec<u8>, CodecError> {
        let start = self.pos;
        let len = u16::from_le_bytes(self.take_array::<STRING_LEN_PREFIX>()?) as usize;
        match self.take(len)? {
            [body @ .., 0] => Ok(body.to_vec()),
            _ => Err(CodecError::Malformed { offset: start, tag: Tag::String as i32 }),
        }
    }

    /// Reads entries until the scope closes.
    ///
    /// A nested scope must end with `TableEnd`; anything else is corruption.
    /// The outermost scope also ends on a non-key tag or when fewer than a
    /// tag's worth of bytes remain.
    fn scope(&mut self, depth: usize) -> Result<Record, CodecError> {
        if depth > MAX_DEPTH {
            return Err(CodecError::TooDeep { limit: MAX_DEPTH });
        }
        let nested = depth > 0;
        let mut record = Record::new();
        loop {
            if !nested && self.remaining() < TAG_LEN {
                return Ok(record);
            }
            let offset = self.pos;
            let raw = self.i32()?;
            let key = match Tag::from_wire(raw) {
                Some(Tag::String) => Key::String(self.string()?),
                Some(Tag::Number) => {
                    let n = self.number()?;
                    if n.is_nan() {
                        return Err(CodecError::Malformed { offset, tag: raw });
                    }
                    Key::Number(n)
                }
                Some(Tag::TableEnd) => return Ok(record),
                _ if nested => return Err(CodecError::Malformed { offset, tag: raw }),
                _ => return Ok(record),
            };
            let value = self.value(depth)?;
            record.insert(key, value);
        }
    }

    fn value(&mut self, depth: usize) -> Result<Value, CodecError> {
        let offset = self.pos;
        let raw = self.i32()?;
        let value = match Tag::from_wire(raw) {
            Some(Tag::Nil) => Value::Nil,
            Some(Tag::Boolean) => Value::Bool(self.i32()? != 0),
            Some(Tag::Number) => Value::Number(self.number()?),
            Some(Tag::String) => Value::String(self.string()?),
            Some(Tag::Table) => Value::Record(self.scope(depth + 1)?),
            Some(Tag::TableEnd) | None => return Err(CodecError::Malformed { offset, tag: raw }),
        };
        Ok(value)
    }
}

/// Decodes one record from the start of `bytes` (typically a whole slot).
pub fn decode(bytes: &[u8]) -> Result<Record, CodecError> {
    Decoder { buf: bytes, pos: 0 }.scope(0)
}
