//! Block protocol records
//!
//! Request and response slots exchanged over the shared ring. Two ABI
//! variants exist because 32-bit and 64-bit frontends lay the request out
//! differently: the 64-bit layout inserts 4 bytes of padding before `id`
//! to 8-byte-align it, giving a 112-byte slot against the 32-bit 108-byte
//! slot. Everything is little-endian.

use crate::error::{Error, Result};
use paravhd_core::codec::{self, Endian};

const LE: Endian = Endian::Little;

/// Most segments a single request can carry.
pub const MAX_SEGMENTS: usize = 11;

/// Highest sector index within one 4 KiB page.
pub const LAST_PAGE_SECTOR: u8 = 7;

/// Block operation code
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Read,
    Write,
    WriteBarrier,
    Flush,
    /// Any other code round-trips unchanged
    Unknown(u8),
}

impl Operation {
    pub fn from_u8(value: u8) -> Self {
        match value {
            0 => Operation::Read,
            1 => Operation::Write,
            2 => Operation::WriteBarrier,
            3 => Operation::Flush,
            other => Operation::Unknown(other),
        }
    }

    pub fn to_u8(self) -> u8 {
        match self {
            Operation::Read => 0,
            Operation::Write => 1,
            Operation::WriteBarrier => 2,
            Operation::Flush => 3,
            Operation::Unknown(v) => v,
        }
    }
}

/// Response status code
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Ok,
    Error,
    NotSupported,
    Unknown(u16),
}

impl Status {
    pub fn from_u16(value: u16) -> Self {
        match value {
            0 => Status::Ok,
            0xFFFF => Status::Error,
            0xFFFE => Status::NotSupported,
            other => Status::Unknown(other),
        }
    }

    pub fn to_u16(self) -> u16 {
        match self {
            Status::Ok => 0,
            Status::Error => 0xFFFF,
            Status::NotSupported => 0xFFFE,
            Status::Unknown(v) => v,
        }
    }
}

/// One contiguous sub-range of a granted page: sectors
/// `first_sector..=last_sector` of the 8 sectors the page holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Segment {
    pub gref: u32,
    pub first_sector: u8,
    pub last_sector: u8,
}

impl Segment {
    pub const SIZE: usize = 8;

    pub fn parse(bytes: &[u8]) -> Result<Self> {
        let (gref, off) = codec::read_u32(bytes, 0, LE);
        let (first_sector, off) = codec::read_u8(bytes, off);
        let (last_sector, _) = codec::read_u8(bytes, off);
        let segment = Self { gref, first_sector, last_sector };
        segment.validate()?;
        Ok(segment)
    }

    pub fn serialize(&self, bytes: &mut [u8]) {
        bytes[0..4].copy_from_slice(&codec::write_u32(self.gref, LE));
        bytes[4] = self.first_sector;
        bytes[5] = self.last_sector;
        bytes[6] = 0;
        bytes[7] = 0;
    }

    fn validate(&self) -> Result<()> {
        if self.last_sector > LAST_PAGE_SECTOR {
            return Err(Error::protocol(format!(
                "segment last sector {} beyond page",
                self.last_sector
            )));
        }
        if self.last_sector < self.first_sector {
            return Err(Error::protocol(format!(
                "segment sector range {}..{} is inverted",
                self.first_sector, self.last_sector
            )));
        }
        Ok(())
    }

    /// Sectors covered by this segment.
    pub fn sectors(&self) -> u64 {
        (self.last_sector - self.first_sector) as u64 + 1
    }
}

/// Request slot ABI variant. `Native` resolves to the layout matching the
/// compilation target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbiVariant {
    X86_32,
    X86_64,
    Native,
}

impl AbiVariant {
    pub fn resolve(self) -> AbiVariant {
        match self {
            AbiVariant::Native => {
                if cfg!(target_pointer_width = "64") {
                    AbiVariant::X86_64
                } else {
                    AbiVariant::X86_32
                }
            }
            other => other,
        }
    }

    /// Protocol-defined request slot size, alignment included.
    pub fn request_slot_size(self) -> usize {
        match self.resolve() {
            AbiVariant::X86_64 => 112,
            _ => 108,
        }
    }

    /// Byte offset of the `id` field: the 64-bit layout pads 4 bytes
    /// after `handle` to align it.
    fn id_offset(self) -> usize {
        match self.resolve() {
            AbiVariant::X86_64 => 8,
            _ => 4,
        }
    }
}

/// A block I/O request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub op: Operation,
    /// Device handle the frontend addressed
    pub handle: u16,
    /// Opaque correlator echoed in the response
    pub id: u64,
    /// First device sector of the transfer
    pub sector: u64,
    pub segments: Vec<Segment>,
}

impl Request {
    /// Decode a request slot under the given ABI.
    pub fn parse(bytes: &[u8], abi: AbiVariant) -> Result<Self> {
        let slot = abi.request_slot_size();
        if bytes.len() < slot {
            return Err(Error::protocol(format!(
                "request slot is {} bytes, need {}",
                bytes.len(),
                slot
            )));
        }

        let (op_raw, off) = codec::read_u8(bytes, 0);
        let (nr_segs, off) = codec::read_u8(bytes, off);
        let (handle, _) = codec::read_u16(bytes, off, LE);

        if nr_segs == 0 || nr_segs as usize > MAX_SEGMENTS {
            return Err(Error::protocol(format!(
                "segment count {} outside 1..={}",
                nr_segs, MAX_SEGMENTS
            )));
        }

        let off = abi.id_offset();
        let (id, off) = codec::read_u64(bytes, off, LE);
        let (sector, mut off) = codec::read_u64(bytes, off, LE);

        let mut segments = Vec::with_capacity(nr_segs as usize);
        for _ in 0..nr_segs {
            segments.push(Segment::parse(&bytes[off..off + Segment::SIZE])?);
            off += Segment::SIZE;
        }

        Ok(Self {
            op: Operation::from_u8(op_raw),
            handle,
            id,
            sector,
            segments,
        })
    }

    /// Encode into a full request slot under the given ABI.
    pub fn marshal(&self, abi: AbiVariant) -> Result<Vec<u8>> {
        if self.segments.is_empty() || self.segments.len() > MAX_SEGMENTS {
            return Err(Error::protocol(format!(
                "segment count {} outside 1..={}",
                self.segments.len(),
                MAX_SEGMENTS
            )));
        }
        for segment in &self.segments {
            segment.validate()?;
        }

        let mut bytes = vec![0u8; abi.request_slot_size()];
        bytes[0] = self.op.to_u8();
        bytes[1] = self.segments.len() as u8;
        bytes[2..4].copy_from_slice(&codec::write_u16(self.handle, LE));

        let mut off = abi.id_offset();
        bytes[off..off + 8].copy_from_slice(&codec::write_u64(self.id, LE));
        off += 8;
        bytes[off..off + 8].copy_from_slice(&codec::write_u64(self.sector, LE));
        off += 8;
        for segment in &self.segments {
            segment.serialize(&mut bytes[off..off + Segment::SIZE]);
            off += Segment::SIZE;
        }
        Ok(bytes)
    }

    /// Pull the correlator out of a slot without validating the rest.
    /// Used to answer malformed requests with `NotSupported`.
    pub fn peek_id(bytes: &[u8], abi: AbiVariant) -> u64 {
        let off = abi.id_offset();
        if bytes.len() < off + 8 {
            return 0;
        }
        codec::read_u64(bytes, off, LE).0
    }

    /// Total sectors transferred across all segments.
    pub fn total_sectors(&self) -> u64 {
        self.segments.iter().map(Segment::sectors).sum()
    }
}

/// A block I/O response (12 bytes on the wire)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Response {
    pub id: u64,
    pub op: Operation,
    pub status: Status,
}

impl Response {
    pub const SIZE: usize = 12;

    pub fn parse(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < Self::SIZE {
            return Err(Error::protocol("response slot truncated"));
        }
        let (id, off) = codec::read_u64(bytes, 0, LE);
        let (op_raw, off) = codec::read_u8(bytes, off);
        let (_reserved, off) = codec::read_u8(bytes, off);
        let (status_raw, _) = codec::read_u16(bytes, off, LE);
        Ok(Self {
            id,
            op: Operation::from_u8(op_raw),
            status: Status::from_u16(status_raw),
        })
    }

    pub fn marshal(&self) -> [u8; Self::SIZE] {
        let mut bytes = [0u8; Self::SIZE];
        bytes[0..8].copy_from_slice(&codec::write_u64(self.id, LE));
        bytes[8] = self.op.to_u8();
        bytes[9] = 0;
        bytes[10..12].copy_from_slice(&codec::write_u16(self.status.to_u16(), LE));
        bytes
    }
}
