// packages/engine/src/packet/buffer.rs
//! Bounded packet buffer
//!
//! Every read checks that the full byte range lies inside the captured data
//! and yields `None` otherwise; there are no partial reads. Writes are
//! likewise all-or-nothing.

use crate::packet::checksum;
use bytes::BytesMut;
use thiserror::Error;

/// Packet access failures
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PacketError {
    #[error("access of {len} bytes at offset {offset} exceeds packet length {packet_len}")]
    OutOfBounds {
        offset: usize,
        len: usize,
        packet_len: usize,
    },

    #[error("cannot shrink packet of {packet_len} bytes by {delta}")]
    TailUnderflow { packet_len: usize, delta: usize },
}

/// Options for L4 checksum patches
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CsumFlags {
    /// The patched field belongs to the pseudo header (an IP address)
    pub pseudo_header: bool,

    /// UDP semantics: a zero checksum means "absent" and is left alone, and a
    /// result of zero is written as 0xFFFF
    pub mangled_zero: bool,
}

impl CsumFlags {
    pub const TCP: Self = Self {
        pseudo_header: false,
        mangled_zero: false,
    };

    pub const UDP: Self = Self {
        pseudo_header: false,
        mangled_zero: true,
    };

    pub const fn pseudo(self) -> Self {
        Self {
            pseudo_header: true,
            ..self
        }
    }
}

/// Width of a field being rewritten
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldChange {
    U16 { old: u16, new: u16 },
    U32 { old: u32, new: u32 },
}

impl FieldChange {
    fn apply(self, check: u16) -> u16 {
        match self {
            FieldChange::U16 { old, new } => checksum::replace_u16(check, old, new),
            FieldChange::U32 { old, new } => checksum::replace_u32(check, old, new),
        }
    }
}

/// Raw frame with bounded accessors
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PacketBuf {
    data: BytesMut,
}

impl PacketBuf {
    pub fn new(data: BytesMut) -> Self {
        Self { data }
    }

    pub fn from_slice(bytes: &[u8]) -> Self {
        Self {
            data: BytesMut::from(bytes),
        }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    pub fn into_inner(self) -> BytesMut {
        self.data
    }

    /// True when `len` bytes starting at `offset` are captured
    pub fn has(&self, offset: usize, len: usize) -> bool {
        offset
            .checked_add(len)
            .map_or(false, |end| end <= self.data.len())
    }

    /// Borrow a byte range, or `None` if any part of it is missing
    pub fn slice(&self, offset: usize, len: usize) -> Option<&[u8]> {
        if self.has(offset, len) {
            Some(&self.data[offset..offset + len])
        } else {
            None
        }
    }

    pub fn read_u8(&self, offset: usize) -> Option<u8> {
        self.slice(offset, 1).map(|b| b[0])
    }

    pub fn read_u16(&self, offset: usize) -> Option<u16> {
        self.slice(offset, 2).map(|b| u16::from_be_bytes([b[0], b[1]]))
    }

    pub fn read_u32(&self, offset: usize) -> Option<u32> {
        self.slice(offset, 4)
            .map(|b| u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub fn write_bytes(&mut self, offset: usize, bytes: &[u8]) -> Result<(), PacketError> {
        if !self.has(offset, bytes.len()) {
            return Err(self.out_of_bounds(offset, bytes.len()));
        }
        self.data[offset..offset + bytes.len()].copy_from_slice(bytes);
        Ok(())
    }

    pub fn write_u16(&mut self, offset: usize, value: u16) -> Result<(), PacketError> {
        self.write_bytes(offset, &value.to_be_bytes())
    }

    pub fn write_u32(&mut self, offset: usize, value: u32) -> Result<(), PacketError> {
        self.write_bytes(offset, &value.to_be_bytes())
    }

    /// Patch the plain checksum at `csum_offset` for a changed field
    pub fn l3_csum_replace(
        &mut self,
        csum_offset: usize,
        change: FieldChange,
    ) -> Result<(), PacketError> {
        let check = self
            .read_u16(csum_offset)
            .ok_or_else(|| self.out_of_bounds(csum_offset, 2))?;
        self.write_u16(csum_offset, change.apply(check))
    }

    /// Patch the transport checksum at `csum_offset` for a changed field
    ///
    /// Address changes (pseudo-header fields) use the same arithmetic as
    /// in-segment fields; `flags.pseudo_header` documents the intent at the
    /// call site.
    pub fn l4_csum_replace(
        &mut self,
        csum_offset: usize,
        change: FieldChange,
        flags: CsumFlags,
    ) -> Result<(), PacketError> {
        let check = self
            .read_u16(csum_offset)
            .ok_or_else(|| self.out_of_bounds(csum_offset, 2))?;

        if flags.mangled_zero && check == 0 {
            return Ok(());
        }

        let mut patched = change.apply(check);
        if flags.mangled_zero && patched == 0 {
            patched = 0xffff;
        }
        self.write_u16(csum_offset, patched)
    }

    /// Grow (zero-filled) or shrink the packet tail by `delta` bytes
    pub fn adjust_tail(&mut self, delta: isize) -> Result<(), PacketError> {
        let len = self.data.len();
        if delta >= 0 {
            self.data.resize(len + delta as usize, 0);
            return Ok(());
        }

        let shrink = delta.unsigned_abs();
        if shrink > len {
            return Err(PacketError::TailUnderflow {
                packet_len: len,
                delta: shrink,
            });
        }
        self.data.truncate(len - shrink);
        Ok(())
    }

    fn out_of_bounds(&self, offset: usize, len: usize) -> PacketError {
        PacketError::OutOfBounds {
            offset,
            len,
            packet_len: self.data.len(),
        }
    }
}

impl From<Vec<u8>> for PacketBuf {
    fn from(bytes: Vec<u8>) -> Self {
        Self::from_slice(&bytes)
    }
}
