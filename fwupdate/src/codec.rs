// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Cursor-based marshalling over fixed-capacity byte buffers.
//!
//! All wire integers are network order. Sized blobs are a 16-bit length
//! followed by that many opaque octets. On any failure the cursor state is
//! unspecified and the caller must discard the whole message.

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CodecError {
    #[error("marshalling would exceed the remaining buffer - needed {needed}, remaining {remaining}")]
    InsufficientBuffer { needed: usize, remaining: usize },
    #[error("sized blob of {0} bytes exceeds the 16-bit length prefix")]
    BlobTooLarge(usize),
}

/// Marshalling cursor over a caller-provided output buffer.
pub struct Writer<'a> {
    buf: &'a mut [u8],
    pos: usize,
}

impl<'a> Writer<'a> {
    pub fn new(buf: &'a mut [u8]) -> Self {
        Writer { buf, pos: 0 }
    }

    pub fn len(&self) -> usize {
        self.pos
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    fn reserve(&mut self, needed: usize) -> Result<&mut [u8], CodecError> {
        if needed > self.remaining() {
            return Err(CodecError::InsufficientBuffer {
                needed,
                remaining: self.remaining(),
            });
        }
        let chunk = &mut self.buf[self.pos..self.pos + needed];
        self.pos += needed;
        Ok(chunk)
    }

    pub fn write_u8(&mut self, val: u8) -> Result<(), CodecError> {
        self.reserve(1)?[0] = val;
        Ok(())
    }

    pub fn write_u16(&mut self, val: u16) -> Result<(), CodecError> {
        self.reserve(2)?.copy_from_slice(&val.to_be_bytes());
        Ok(())
    }

    pub fn write_u32(&mut self, val: u32) -> Result<(), CodecError> {
        self.reserve(4)?.copy_from_slice(&val.to_be_bytes());
        Ok(())
    }

    pub fn write_bytes(&mut self, bytes: &[u8]) -> Result<(), CodecError> {
        self.reserve(bytes.len())?.copy_from_slice(bytes);
        Ok(())
    }

    /// 16-bit length followed by the payload.
    pub fn write_sized_blob(&mut self, bytes: &[u8]) -> Result<(), CodecError> {
        let len = u16::try_from(bytes.len()).map_err(|_| CodecError::BlobTooLarge(bytes.len()))?;
        self.write_u16(len)?;
        self.write_bytes(bytes)
    }

    /// Reserve a 32-bit length field to be patched once the body size is
    /// known. Command headers and authorization session blocks both carry
    /// their size before their content.
    pub fn defer_u32(&mut self) -> Result<DeferredU32, CodecError> {
        let at = self.pos;
        self.write_u32(0)?;
        Ok(DeferredU32 { at })
    }

    pub fn patch_u32(&mut self, deferred: DeferredU32, val: u32) {
        self.buf[deferred.at..deferred.at + 4].copy_from_slice(&val.to_be_bytes());
    }
}

/// Position of a length field reserved by [`Writer::defer_u32`].
#[must_use]
pub struct DeferredU32 {
    at: usize,
}

impl DeferredU32 {
    /// Offset of the reserved field from the start of the buffer.
    pub fn offset(&self) -> usize {
        self.at
    }
}

/// Unmarshalling cursor over a received message.
pub struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Reader { buf, pos: 0 }
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    pub fn consumed(&self) -> usize {
        self.pos
    }

    fn take(&mut self, needed: usize) -> Result<&'a [u8], CodecError> {
        if needed > self.remaining() {
            return Err(CodecError::InsufficientBuffer {
                needed,
                remaining: self.remaining(),
            });
        }
        let chunk = &self.buf[self.pos..self.pos + needed];
        self.pos += needed;
        Ok(chunk)
    }

    pub fn read_u8(&mut self) -> Result<u8, CodecError> {
        Ok(self.take(1)?[0])
    }

    pub fn read_u16(&mut self) -> Result<u16, CodecError> {
        Ok(u16::from_be_bytes(self.take(2)?.try_into().unwrap()))
    }

    pub fn read_u32(&mut self) -> Result<u32, CodecError> {
        Ok(u32::from_be_bytes(self.take(4)?.try_into().unwrap()))
    }

    pub fn read_bytes(&mut self, len: usize) -> Result<&'a [u8], CodecError> {
        self.take(len)
    }

    pub fn read_array<const N: usize>(&mut self) -> Result<[u8; N], CodecError> {
        Ok(self.take(N)?.try_into().unwrap())
    }

    pub fn read_sized_blob(&mut self) -> Result<&'a [u8], CodecError> {
        let len = self.read_u16()? as usize;
        self.take(len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_primitives() {
        let mut buf = [0u8; 16];
        let mut writer = Writer::new(&mut buf);
        writer.write_u8(0xab).unwrap();
        writer.write_u16(0x1234).unwrap();
        writer.write_u32(0xdeadbeef).unwrap();
        writer.write_sized_blob(&[1, 2, 3]).unwrap();
        let len = writer.len();
        assert_eq!(len, 1 + 2 + 4 + 2 + 3);
        assert_eq!(&buf[..7], &[0xab, 0x12, 0x34, 0xde, 0xad, 0xbe, 0xef]);

        let mut reader = Reader::new(&buf[..len]);
        assert_eq!(reader.read_u8().unwrap(), 0xab);
        assert_eq!(reader.read_u16().unwrap(), 0x1234);
        assert_eq!(reader.read_u32().unwrap(), 0xdeadbeef);
        assert_eq!(reader.read_sized_blob().unwrap(), &[1, 2, 3]);
        assert_eq!(reader.remaining(), 0);
    }

    #[test]
    fn write_to_exact_capacity() {
        let mut buf = [0u8; 4];
        let mut writer = Writer::new(&mut buf);
        writer.write_u32(1).unwrap();
        assert_eq!(writer.remaining(), 0);
        assert_eq!(
            writer.write_u8(0),
            Err(CodecError::InsufficientBuffer {
                needed: 1,
                remaining: 0
            })
        );
    }

    #[test]
    fn read_past_end() {
        let buf = [0u8; 3];
        let mut reader = Reader::new(&buf);
        assert!(reader.read_u32().is_err());
        // A failed read leaves nothing consumed.
        assert_eq!(reader.remaining(), 3);
    }

    #[test]
    fn blob_length_exceeds_buffer() {
        // Declared length runs past the end of the message.
        let buf = [0x00, 0x10, 0xaa];
        let mut reader = Reader::new(&buf);
        assert!(reader.read_sized_blob().is_err());
    }

    #[test]
    fn deferred_length_patch() {
        let mut buf = [0u8; 12];
        let mut writer = Writer::new(&mut buf);
        writer.write_u16(0x00c1).unwrap();
        let size = writer.defer_u32().unwrap();
        writer.write_u32(0x5b).unwrap();
        let total = writer.len() as u32;
        writer.patch_u32(size, total);
        assert_eq!(&buf[2..6], &[0, 0, 0, 10]);
    }
}
