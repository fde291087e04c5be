// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: BUSL-1.1

//! Big-endian wire encoding for TPM structures.

use anyhow::{bail, Result};

/// Growable buffer a command body is marshalled into.
#[derive(Debug, Default, Clone)]
pub struct CommandBuffer {
    data: Vec<u8>,
}

impl CommandBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            data: Vec::with_capacity(capacity),
        }
    }

    pub fn put_u8(&mut self, v: u8) {
        self.data.push(v);
    }

    pub fn put_u16(&mut self, v: u16) {
        self.data.extend_from_slice(&v.to_be_bytes());
    }

    pub fn put_u32(&mut self, v: u32) {
        self.data.extend_from_slice(&v.to_be_bytes());
    }

    pub fn put_bytes(&mut self, bytes: &[u8]) {
        self.data.extend_from_slice(bytes);
    }

    /// Put a TPM2B structure (2-byte size prefix + data)
    pub fn put_tpm2b(&mut self, data: &[u8]) {
        self.put_u16(data.len() as u16);
        self.put_bytes(data);
    }

    /// Marshal `value` into a scratch buffer and put it as a TPM2B.
    pub fn put_sized<T: Marshal + ?Sized>(&mut self, value: &T) {
        let inner = value.to_bytes();
        self.put_tpm2b(&inner);
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn into_vec(self) -> Vec<u8> {
        self.data
    }

    /// Overwrite a previously reserved u32, used for size fields.
    pub fn patch_u32(&mut self, pos: usize, v: u32) -> Result<()> {
        match self.data.get_mut(pos..pos + 4) {
            Some(slot) => {
                slot.copy_from_slice(&v.to_be_bytes());
                Ok(())
            }
            None => bail!("patch position {pos} out of range"),
        }
    }
}

/// Cursor over a response body.
#[derive(Debug, Clone)]
pub struct ResponseBuffer<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> ResponseBuffer<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    pub fn remaining(&self) -> usize {
        self.data.len().saturating_sub(self.pos)
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    fn take(&mut self, len: usize, what: &str) -> Result<&'a [u8]> {
        if len > self.remaining() {
            bail!(
                "buffer underflow reading {what}: need {len} bytes, {} left",
                self.remaining()
            );
        }
        let slice = &self.data[self.pos..self.pos + len];
        self.pos += len;
        Ok(slice)
    }

    fn take_array<const N: usize>(&mut self, what: &str) -> Result<[u8; N]> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N, what)?);
        Ok(out)
    }

    pub fn get_u8(&mut self) -> Result<u8> {
        Ok(self.take_array::<1>("u8")?[0])
    }

    pub fn get_u16(&mut self) -> Result<u16> {
        Ok(u16::from_be_bytes(self.take_array("u16")?))
    }

    pub fn get_u32(&mut self) -> Result<u32> {
        Ok(u32::from_be_bytes(self.take_array("u32")?))
    }

    pub fn get_bytes(&mut self, len: usize) -> Result<Vec<u8>> {
        Ok(self.take(len, "bytes")?.to_vec())
    }

    /// Borrow the next `len` bytes without copying.
    pub fn get_slice(&mut self, len: usize) -> Result<&'a [u8]> {
        self.take(len, "bytes")
    }

    /// Get a TPM2B structure (2-byte size prefix + data)
    pub fn get_tpm2b(&mut self) -> Result<Vec<u8>> {
        let size = self.get_u16()? as usize;
        self.get_bytes(size)
    }

    /// Get remaining bytes
    pub fn get_remaining(&mut self) -> &'a [u8] {
        let rest = &self.data[self.pos.min(self.data.len())..];
        self.pos = self.data.len();
        rest
    }
}

/// Trait for types that can be marshalled to TPM format
pub trait Marshal {
    fn marshal(&self, buf: &mut CommandBuffer);

    fn to_bytes(&self) -> Vec<u8> {
        let mut buf = CommandBuffer::new();
        self.marshal(&mut buf);
        buf.into_vec()
    }
}

/// Trait for types that can be unmarshalled from TPM format
pub trait Unmarshal: Sized {
    fn unmarshal(buf: &mut ResponseBuffer) -> Result<Self>;

    fn from_bytes(data: &[u8]) -> Result<Self> {
        let mut buf = ResponseBuffer::new(data);
        Self::unmarshal(&mut buf)
    }
}

impl Marshal for u8 {
    fn marshal(&self, buf: &mut CommandBuffer) {
        buf.put_u8(*self);
    }
}

impl Marshal for u16 {
    fn marshal(&self, buf: &mut CommandBuffer) {
        buf.put_u16(*self);
    }
}

impl Marshal for u32 {
    fn marshal(&self, buf: &mut CommandBuffer) {
        buf.put_u32(*self);
    }
}

impl Unmarshal for u8 {
    fn unmarshal(buf: &mut ResponseBuffer) -> Result<Self> {
        buf.get_u8()
    }
}

impl Unmarshal for u16 {
    fn unmarshal(buf: &mut ResponseBuffer) -> Result<Self> {
        buf.get_u16()
    }
}

impl Unmarshal for u32 {
    fn unmarshal(buf: &mut ResponseBuffer) -> Result<Self> {
        buf.get_u32()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_patch_size_field() {
        let mut buf = CommandBuffer::new();
        buf.put_u16(0x8001);
        buf.put_u32(0);
        buf.put_tpm2b(b"abc");
        let len = buf.len() as u32;
        buf.patch_u32(2, len).unwrap();
        assert_eq!(&buf.as_bytes()[2..6], &len.to_be_bytes());
        assert!(buf.patch_u32(buf.len(), 1).is_err());
    }

    #[test]
    fn test_underflow_is_an_error() {
        let data = [0x00, 0x05, 0xAA];
        let mut buf = ResponseBuffer::new(&data);
        let err = buf.get_tpm2b().unwrap_err();
        assert!(err.to_string().contains("underflow"));
    }

    #[test]
    fn test_get_remaining_consumes_everything() {
        let data = [1, 2, 3, 4, 5];
        let mut buf = ResponseBuffer::new(&data);
        assert_eq!(buf.get_u16().unwrap(), 0x0102);
        assert_eq!(buf.get_remaining(), &[3, 4, 5]);
        assert_eq!(buf.remaining(), 0);
    }
}
