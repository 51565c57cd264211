//! Wire codecs for MT command parameters
//!
//! Every parameter in an MT frame is serialized little-endian with no
//! padding. Byte strings come in two flavors, prefixed by a `u8` or a
//! `u16` length.

use thiserror::Error;

/// Errors produced while decoding a frame payload
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("buffer holds {actual} bytes, needed {needed}")]
    Truncated { needed: usize, actual: usize },

    #[error("invalid value {value:#04X} for {what}")]
    InvalidValue { what: &'static str, value: u8 },

    #[error("{0} unparsed bytes remain after the last parameter")]
    TrailingBytes(usize),
}

/// Serialization of a single MT parameter
///
/// `decode` consumes from the front of the slice so parameters can be
/// chained in schema order.
pub trait Codec: Sized {
    fn encode(&self, buf: &mut Vec<u8>);
    fn decode(buf: &mut &[u8]) -> Result<Self, DecodeError>;
}

/// Split `n` bytes off the front of the buffer
pub fn take<'a>(buf: &mut &'a [u8], n: usize) -> Result<&'a [u8], DecodeError> {
    if buf.len() < n {
        return Err(DecodeError::Truncated {
            needed: n,
            actual: buf.len(),
        });
    }
    let (head, rest) = buf.split_at(n);
    *buf = rest;
    Ok(head)
}

macro_rules! int_codec {
    ($($ty:ty),*) => {
        $(
            impl Codec for $ty {
                fn encode(&self, buf: &mut Vec<u8>) {
                    buf.extend_from_slice(&self.to_le_bytes());
                }

                fn decode(buf: &mut &[u8]) -> Result<Self, DecodeError> {
                    let raw = take(buf, std::mem::size_of::<$ty>())?;
                    Ok(<$ty>::from_le_bytes(raw.try_into().unwrap()))
                }
            }
        )*
    };
}

int_codec!(u8, u16, u32, u64, i8);

impl Codec for bool {
    fn encode(&self, buf: &mut Vec<u8>) {
        buf.push(u8::from(*self));
    }

    fn decode(buf: &mut &[u8]) -> Result<Self, DecodeError> {
        Ok(u8::decode(buf)? != 0)
    }
}

/// A byte string prefixed by a `u8` length (max 255 bytes)
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ShortBytes(pub Vec<u8>);

impl Codec for ShortBytes {
    fn encode(&self, buf: &mut Vec<u8>) {
        debug_assert!(self.0.len() <= u8::MAX as usize);
        buf.push(self.0.len() as u8);
        buf.extend_from_slice(&self.0);
    }

    fn decode(buf: &mut &[u8]) -> Result<Self, DecodeError> {
        let len = u8::decode(buf)? as usize;
        Ok(Self(take(buf, len)?.to_vec()))
    }
}

/// A byte string prefixed by a `u16` length
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct LongBytes(pub Vec<u8>);

impl Codec for LongBytes {
    fn encode(&self, buf: &mut Vec<u8>) {
        (self.0.len() as u16).encode(buf);
        buf.extend_from_slice(&self.0);
    }

    fn decode(buf: &mut &[u8]) -> Result<Self, DecodeError> {
        let len = u16::decode(buf)? as usize;
        Ok(Self(take(buf, len)?.to_vec()))
    }
}

/// An unprefixed byte string consuming the remainder of the payload
///
/// Only valid as the last parameter of a schema.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Bytes(pub Vec<u8>);

impl Codec for Bytes {
    fn encode(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&self.0);
    }

    fn decode(buf: &mut &[u8]) -> Result<Self, DecodeError> {
        let value = Self(buf.to_vec());
        *buf = &[];
        Ok(value)
    }
}

/// A list prefixed by a `u8` element count
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ShortList<T>(pub Vec<T>);

impl<T: Codec> Codec for ShortList<T> {
    fn encode(&self, buf: &mut Vec<u8>) {
        debug_assert!(self.0.len() <= u8::MAX as usize);
        buf.push(self.0.len() as u8);
        for item in &self.0 {
            item.encode(buf);
        }
    }

    fn decode(buf: &mut &[u8]) -> Result<Self, DecodeError> {
        let count = u8::decode(buf)? as usize;
        let mut items = Vec::with_capacity(count);
        for _ in 0..count {
            items.push(T::decode(buf)?);
        }
        Ok(Self(items))
    }
}

/// Trailing-optional parameter: absent exactly when the payload has been
/// exhausted. Firmware revisions append parameters to existing commands, so
/// the schemas mark those as optional.
impl<T: Codec> Codec for Option<T> {
    fn encode(&self, buf: &mut Vec<u8>) {
        if let Some(value) = self {
            value.encode(buf);
        }
    }

    fn decode(buf: &mut &[u8]) -> Result<Self, DecodeError> {
        if buf.is_empty() {
            Ok(None)
        } else {
            T::decode(buf).map(Some)
        }
    }
}

/// Serialize a value to a fresh buffer
pub fn encode_to_vec<T: Codec>(value: &T) -> Vec<u8> {
    let mut buf = Vec::new();
    value.encode(&mut buf);
    buf
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_int_roundtrip() {
        let mut buf = Vec::new();
        0x1234u16.encode(&mut buf);
        0xAABBCCDDu32.encode(&mut buf);
        assert_eq!(buf, [0x34, 0x12, 0xDD, 0xCC, 0xBB, 0xAA]);

        let mut slice = buf.as_slice();
        assert_eq!(u16::decode(&mut slice).unwrap(), 0x1234);
        assert_eq!(u32::decode(&mut slice).unwrap(), 0xAABBCCDD);
        assert!(slice.is_empty());
    }

    #[test]
    fn test_truncated_int() {
        let mut slice: &[u8] = &[0x01];
        assert!(matches!(
            u16::decode(&mut slice),
            Err(DecodeError::Truncated { needed: 2, actual: 1 })
        ));
    }

    #[test]
    fn test_short_bytes() {
        let value = ShortBytes(vec![1, 2, 3]);
        let buf = encode_to_vec(&value);
        assert_eq!(buf, [3, 1, 2, 3]);

        let mut slice = buf.as_slice();
        assert_eq!(ShortBytes::decode(&mut slice).unwrap(), value);
    }

    #[test]
    fn test_long_bytes() {
        let value = LongBytes(vec![0xAA; 300]);
        let buf = encode_to_vec(&value);
        assert_eq!(&buf[..2], &[0x2C, 0x01]);
        assert_eq!(buf.len(), 302);
    }

    #[test]
    fn test_short_bytes_length_overrun() {
        let mut slice: &[u8] = &[5, 1, 2];
        assert!(ShortBytes::decode(&mut slice).is_err());
    }

    #[test]
    fn test_short_list() {
        let value = ShortList(vec![0x0001u16, 0x0006]);
        let buf = encode_to_vec(&value);
        assert_eq!(buf, [2, 0x01, 0x00, 0x06, 0x00]);

        let mut slice = buf.as_slice();
        assert_eq!(ShortList::<u16>::decode(&mut slice).unwrap(), value);
    }

    #[test]
    fn test_trailing_optional() {
        // Present when bytes remain
        let mut slice: &[u8] = &[0x07];
        assert_eq!(Option::<u8>::decode(&mut slice).unwrap(), Some(0x07));

        // Absent at end of buffer
        let mut slice: &[u8] = &[];
        assert_eq!(Option::<u8>::decode(&mut slice).unwrap(), None);

        // Absent values serialize to nothing
        assert!(encode_to_vec(&Option::<u16>::None).is_empty());
    }
}
