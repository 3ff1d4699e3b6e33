//! Little-endian binary encoding helpers shared by the page, node and
//! log-record formats.

use std::convert::TryInto;
use std::io::Read;
use std::mem::size_of;

use crate::error::{Error, Result};

pub trait Encode {
    fn encode(&self, buf: &mut ByteWriter);
}

pub trait Decode: Sized {
    fn decode_from<R: Read>(reader: &mut R) -> Result<Self>;
}

/// Growable byte buffer that accumulates encoded fields.
pub struct ByteWriter {
    buf: Vec<u8>,
}

impl ByteWriter {
    pub fn new() -> Self {
        Self { buf: Vec::new() }
    }

    pub fn with_capacity(cap: usize) -> Self {
        Self {
            buf: Vec::with_capacity(cap),
        }
    }

    pub fn put<T: Encode>(&mut self, obj: &T) {
        obj.encode(self);
    }

    pub fn put_bytes(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Writes a u32 length prefix followed by the raw bytes.
    pub fn put_len_prefixed(&mut self, bytes: &[u8]) {
        self.put(&(bytes.len() as u32));
        self.put_bytes(bytes);
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.buf
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }

    /// Returns the buffer padded with zeroes up to `size`. The caller
    /// guarantees the content fits; overflow is a logic error.
    pub fn into_padded_bytes(mut self, size: usize) -> Vec<u8> {
        assert!(
            self.buf.len() <= size,
            "encoded {} bytes into a {} byte region",
            self.buf.len(),
            size
        );
        self.buf.resize(size, 0);
        self.buf
    }
}

pub fn read_exact<R: Read>(reader: &mut R, count: usize) -> Result<Vec<u8>> {
    let mut buf = vec![0u8; count];
    reader
        .read_exact(&mut buf)
        .map_err(|e| Error::io("read", e))?;
    Ok(buf)
}

/// Reads a u32 length prefix followed by that many bytes. `limit` bounds
/// the length so a corrupted prefix cannot trigger a huge allocation.
pub fn read_len_prefixed<R: Read>(reader: &mut R, limit: usize) -> Result<Vec<u8>> {
    let len = u32::decode_from(reader)? as usize;
    if len > limit {
        return Err(Error::Corrupted {
            context: format!("length prefix {} exceeds limit {}", len, limit),
        });
    }
    read_exact(reader, len)
}

macro_rules! impl_int_codec {
    (for $($t:ty),+) => {
        $(
            impl Encode for $t {
                fn encode(&self, buf: &mut ByteWriter) {
                    buf.put_bytes(&self.to_le_bytes());
                }
            }

            impl Decode for $t {
                fn decode_from<R: Read>(reader: &mut R) -> Result<Self> {
                    let bytes = read_exact(reader, size_of::<Self>())?;
                    Ok(Self::from_le_bytes(bytes.as_slice().try_into().unwrap()))
                }
            }
        )*
    }
}

impl_int_codec!(for u8, u16, u32, u64, i64);

impl Encode for bool {
    fn encode(&self, buf: &mut ByteWriter) {
        buf.put(&(*self as u8));
    }
}

impl Decode for bool {
    fn decode_from<R: Read>(reader: &mut R) -> Result<Self> {
        Ok(u8::decode_from(reader)? != 0)
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::*;

    #[test]
    fn test_int_round_trip() {
        let mut w = ByteWriter::new();
        w.put(&0xdead_beefu32);
        w.put(&42u8);
        w.put(&u64::MAX);
        w.put(&(-7i64));

        let bytes = w.into_bytes();
        let mut r = Cursor::new(bytes);
        assert_eq!(u32::decode_from(&mut r).unwrap(), 0xdead_beef);
        assert_eq!(u8::decode_from(&mut r).unwrap(), 42);
        assert_eq!(u64::decode_from(&mut r).unwrap(), u64::MAX);
        assert_eq!(i64::decode_from(&mut r).unwrap(), -7);
    }

    #[test]
    fn test_len_prefixed_round_trip() {
        let mut w = ByteWriter::new();
        w.put_len_prefixed(b"hello");
        w.put_len_prefixed(b"");

        let mut r = Cursor::new(w.into_bytes());
        assert_eq!(read_len_prefixed(&mut r, 1024).unwrap(), b"hello");
        assert_eq!(read_len_prefixed(&mut r, 1024).unwrap(), b"");
    }

    #[test]
    fn test_len_prefix_over_limit() {
        let mut w = ByteWriter::new();
        w.put_len_prefixed(&[0u8; 64]);

        let mut r = Cursor::new(w.into_bytes());
        assert!(read_len_prefixed(&mut r, 16).is_err());
    }

    #[test]
    fn test_padded_bytes() {
        let mut w = ByteWriter::new();
        w.put(&1u32);
        let padded = w.into_padded_bytes(16);
        assert_eq!(padded.len(), 16);
        assert_eq!(&padded[..4], &[1, 0, 0, 0]);
    }
}
