//! VHD on-disk structure definitions
//!
//! Parsers and serializers for the footer, dynamic header, parent locator
//! entries, and the Block Allocation Table. Field offsets follow the
//! published format; every multi-byte integer is big-endian. Reserved
//! bytes are carried verbatim so a parse/serialize round trip is
//! bit-exact.

use paravhd_core::codec::{self, Endian};
use paravhd_core::{Error, Result, SECTOR_SIZE};
use uuid::Uuid;

const BE: Endian = Endian::Big;

/// VHD disk type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VhdType {
    None,
    /// Values 1, 5 and 6 are reserved by the format
    Reserved(u32),
    Fixed,
    Dynamic,
    Differencing,
}

impl VhdType {
    pub fn from_u32(value: u32) -> Result<Self> {
        match value {
            0 => Ok(VhdType::None),
            2 => Ok(VhdType::Fixed),
            3 => Ok(VhdType::Dynamic),
            4 => Ok(VhdType::Differencing),
            1 | 5 | 6 => Ok(VhdType::Reserved(value)),
            _ => Err(Error::malformed(format!("unknown disk type {}", value))),
        }
    }

    pub fn to_u32(self) -> u32 {
        match self {
            VhdType::None => 0,
            VhdType::Reserved(v) => v,
            VhdType::Fixed => 2,
            VhdType::Dynamic => 3,
            VhdType::Differencing => 4,
        }
    }

    /// Dynamic and differencing disks share the sparse layout.
    pub fn is_sparse(self) -> bool {
        matches!(self, VhdType::Dynamic | VhdType::Differencing)
    }
}

/// Footer `features` bitfield.
///
/// Bit positions: bit 0 marks a temporary disk, bit 1 is reserved and set
/// by every known producer. Stored raw so unknown bits survive a round
/// trip.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VhdFeatures(pub u32);

impl VhdFeatures {
    pub const NO_FEATURES: VhdFeatures = VhdFeatures(0);
    pub const TEMPORARY: u32 = 1 << 0;
    pub const RESERVED: u32 = 1 << 1;

    pub fn is_temporary(self) -> bool {
        self.0 & Self::TEMPORARY != 0
    }

    pub fn has_reserved(self) -> bool {
        self.0 & Self::RESERVED != 0
    }
}

/// CHS geometry carried in the footer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DiskGeometry {
    pub cylinders: u16,
    pub heads: u8,
    pub sectors: u8,
}

impl DiskGeometry {
    pub fn parse(bytes: &[u8]) -> Self {
        let (cylinders, off) = codec::read_u16(bytes, 0, BE);
        let (heads, off) = codec::read_u8(bytes, off);
        let (sectors, _) = codec::read_u8(bytes, off);
        Self { cylinders, heads, sectors }
    }

    pub fn to_bytes(&self) -> [u8; 4] {
        let cyl = codec::write_u16(self.cylinders, BE);
        [cyl[0], cyl[1], self.heads, self.sectors]
    }

    pub fn total_sectors(&self) -> u64 {
        self.cylinders as u64 * self.heads as u64 * self.sectors as u64
    }
}

/// One's-complement byte sum, skipping the checksum field itself.
/// Shared by the footer and the dynamic header.
pub(crate) fn ones_complement_checksum(bytes: &[u8], skip: std::ops::Range<usize>) -> u32 {
    let mut sum: u32 = 0;
    for (i, &b) in bytes.iter().enumerate() {
        if skip.contains(&i) {
            continue;
        }
        sum = sum.wrapping_add(b as u32);
    }
    !sum
}

/// VHD footer (512 bytes)
///
/// Sparse images carry a copy at offset 0 and the authoritative footer at
/// the end of the file; fixed images only have the trailing one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VhdFooter {
    pub features: VhdFeatures,
    pub format_version: u32,
    /// Byte offset of the dynamic header; `u64::MAX` for fixed disks
    pub data_offset: u64,
    /// Seconds since 2000-01-01T00:00:00Z
    pub time_stamp: u32,
    pub creator_app: [u8; 4],
    pub creator_version: u32,
    pub creator_host_os: [u8; 4],
    pub original_size: u64,
    pub current_size: u64,
    pub geometry: DiskGeometry,
    pub disk_type: VhdType,
    pub checksum: u32,
    pub uid: Uuid,
    pub saved_state: u8,
    reserved: [u8; 427],
}

impl VhdFooter {
    pub const COOKIE: &'static [u8; 8] = b"conectix";
    pub const SIZE: usize = 512;
    const CHECKSUM_RANGE: std::ops::Range<usize> = 64..68;

    /// Parse a footer from 512 raw bytes.
    ///
    /// A cookie mismatch is fatal. A checksum mismatch is logged and
    /// tolerated; some producers miscompute it.
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < Self::SIZE {
            return Err(Error::malformed("footer shorter than 512 bytes"));
        }
        if &bytes[0..8] != Self::COOKIE {
            return Err(Error::malformed("footer cookie mismatch"));
        }

        let (features, off) = codec::read_u32(bytes, 8, BE);
        let (format_version, off) = codec::read_u32(bytes, off, BE);
        let (data_offset, off) = codec::read_u64(bytes, off, BE);
        let (time_stamp, off) = codec::read_u32(bytes, off, BE);
        let mut creator_app = [0u8; 4];
        creator_app.copy_from_slice(&bytes[off..off + 4]);
        let (creator_version, off) = codec::read_u32(bytes, off + 4, BE);
        let mut creator_host_os = [0u8; 4];
        creator_host_os.copy_from_slice(&bytes[off..off + 4]);
        let (original_size, off) = codec::read_u64(bytes, off + 4, BE);
        let (current_size, off) = codec::read_u64(bytes, off, BE);
        let geometry = DiskGeometry::parse(&bytes[off..off + 4]);
        let (disk_type_raw, off) = codec::read_u32(bytes, off + 4, BE);
        let disk_type = VhdType::from_u32(disk_type_raw)?;
        let (checksum, off) = codec::read_u32(bytes, off, BE);
        let uid = Uuid::from_slice(&bytes[off..off + 16])
            .map_err(|_| Error::malformed("footer uid field truncated"))?;
        let (saved_state, off) = codec::read_u8(bytes, off + 16);
        let mut reserved = [0u8; 427];
        reserved.copy_from_slice(&bytes[off..Self::SIZE]);

        let footer = Self {
            features: VhdFeatures(features),
            format_version,
            data_offset,
            time_stamp,
            creator_app,
            creator_version,
            creator_host_os,
            original_size,
            current_size,
            geometry,
            disk_type,
            checksum,
            uid,
            saved_state,
            reserved,
        };

        let computed = ones_complement_checksum(&bytes[..Self::SIZE], Self::CHECKSUM_RANGE);
        if computed != checksum {
            tracing::warn!(
                stored = checksum,
                computed,
                "footer checksum mismatch, accepting image anyway"
            );
        }

        Ok(footer)
    }

    /// Serialize to 512 bytes, emitting the stored checksum field as-is.
    pub fn serialize(&self, bytes: &mut [u8; Self::SIZE]) {
        bytes[0..8].copy_from_slice(Self::COOKIE);
        bytes[8..12].copy_from_slice(&codec::write_u32(self.features.0, BE));
        bytes[12..16].copy_from_slice(&codec::write_u32(self.format_version, BE));
        bytes[16..24].copy_from_slice(&codec::write_u64(self.data_offset, BE));
        bytes[24..28].copy_from_slice(&codec::write_u32(self.time_stamp, BE));
        bytes[28..32].copy_from_slice(&self.creator_app);
        bytes[32..36].copy_from_slice(&codec::write_u32(self.creator_version, BE));
        bytes[36..40].copy_from_slice(&self.creator_host_os);
        bytes[40..48].copy_from_slice(&codec::write_u64(self.original_size, BE));
        bytes[48..56].copy_from_slice(&codec::write_u64(self.current_size, BE));
        bytes[56..60].copy_from_slice(&self.geometry.to_bytes());
        bytes[60..64].copy_from_slice(&codec::write_u32(self.disk_type.to_u32(), BE));
        bytes[64..68].copy_from_slice(&codec::write_u32(self.checksum, BE));
        bytes[68..84].copy_from_slice(self.uid.as_bytes());
        bytes[84] = self.saved_state;
        bytes[85..512].copy_from_slice(&self.reserved);
    }

    /// Serialize with a freshly computed checksum.
    pub fn marshal(&mut self) -> [u8; Self::SIZE] {
        self.update_checksum();
        let mut bytes = [0u8; Self::SIZE];
        self.serialize(&mut bytes);
        bytes
    }

    /// Recompute and store the checksum from the current field values.
    pub fn update_checksum(&mut self) {
        let mut bytes = [0u8; Self::SIZE];
        self.checksum = 0;
        self.serialize(&mut bytes);
        self.checksum = ones_complement_checksum(&bytes, Self::CHECKSUM_RANGE);
    }

    /// Does the stored checksum match the covered bytes?
    pub fn verify_checksum(&self) -> bool {
        let mut bytes = [0u8; Self::SIZE];
        self.serialize(&mut bytes);
        ones_complement_checksum(&bytes, Self::CHECKSUM_RANGE) == self.checksum
    }

    /// A footer with zeroed reserved bytes; used by the constructors.
    pub fn new(
        disk_type: VhdType,
        current_size: u64,
        geometry: DiskGeometry,
        uid: Uuid,
        data_offset: u64,
        time_stamp: u32,
        creator_app: [u8; 4],
        creator_host_os: [u8; 4],
    ) -> Self {
        let mut footer = Self {
            features: VhdFeatures(VhdFeatures::RESERVED),
            format_version: 0x0001_0000,
            data_offset,
            time_stamp,
            creator_app,
            creator_version: 0x0001_0000,
            creator_host_os,
            original_size: current_size,
            current_size,
            geometry,
            disk_type,
            checksum: 0,
            uid,
            saved_state: 0,
            reserved: [0u8; 427],
        };
        footer.update_checksum();
        footer
    }
}

/// A parent locator entry (24 bytes) from the dynamic header.
///
/// `platform_data_space` is stored exactly as found: values below 512 are
/// sector counts (multiply by 512), larger values are already bytes.
/// Serialization re-emits the stored value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParentLocatorEntry {
    pub platform_code: u32,
    pub platform_data_space: u32,
    pub platform_data_length: u32,
    pub reserved: u32,
    pub platform_data_offset: u64,
}

impl ParentLocatorEntry {
    pub const SIZE: usize = 24;

    /// 'MacX': a file:// URI
    pub const PLAT_MACX: u32 = 0x4D61_6358;
    /// 'Mac ': an OS X alias blob
    pub const PLAT_MAC: u32 = 0x4D61_6320;
    /// 'W2ku': Windows absolute UTF-16 path
    pub const PLAT_W2KU: u32 = 0x5732_6B75;
    /// 'W2ru': Windows relative UTF-16 path
    pub const PLAT_W2RU: u32 = 0x5732_7275;

    pub fn parse(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < Self::SIZE {
            return Err(Error::malformed("parent locator entry truncated"));
        }
        let (platform_code, off) = codec::read_u32(bytes, 0, BE);
        let (platform_data_space, off) = codec::read_u32(bytes, off, BE);
        let (platform_data_length, off) = codec::read_u32(bytes, off, BE);
        let (reserved, off) = codec::read_u32(bytes, off, BE);
        let (platform_data_offset, _) = codec::read_u64(bytes, off, BE);
        Ok(Self {
            platform_code,
            platform_data_space,
            platform_data_length,
            reserved,
            platform_data_offset,
        })
    }

    pub fn serialize(&self, bytes: &mut [u8]) {
        bytes[0..4].copy_from_slice(&codec::write_u32(self.platform_code, BE));
        bytes[4..8].copy_from_slice(&codec::write_u32(self.platform_data_space, BE));
        bytes[8..12].copy_from_slice(&codec::write_u32(self.platform_data_length, BE));
        bytes[12..16].copy_from_slice(&codec::write_u32(self.reserved, BE));
        bytes[16..24].copy_from_slice(&codec::write_u64(self.platform_data_offset, BE));
    }

    /// The reserved payload space normalized to bytes.
    pub fn data_space_bytes(&self) -> u64 {
        if self.platform_data_space < SECTOR_SIZE as u32 {
            self.platform_data_space as u64 * SECTOR_SIZE as u64
        } else {
            self.platform_data_space as u64
        }
    }

    pub fn is_used(&self) -> bool {
        self.platform_code != 0 && self.platform_data_length > 0
    }

    pub fn empty() -> Self {
        Self {
            platform_code: 0,
            platform_data_space: 0,
            platform_data_length: 0,
            reserved: 0,
            platform_data_offset: 0,
        }
    }
}

/// VHD dynamic header (1024 bytes), present in dynamic and differencing
/// images at the footer's `data_offset`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VhdDynamicHeader {
    /// Unused in current-format images; `u64::MAX`
    pub data_offset: u64,
    /// Absolute byte offset of the BAT
    pub table_offset: u64,
    pub header_version: u32,
    pub max_table_entries: u32,
    pub block_size: u32,
    pub checksum: u32,
    pub parent_uid: Uuid,
    /// Parent modification time, seconds since 2000-01-01T00:00:00Z
    pub parent_time_stamp: u32,
    reserved1: [u8; 4],
    /// UTF-16 parent name, NUL-padded; kept raw for bit-exact round trips
    pub parent_unicode_name: [u8; 512],
    pub parent_locators: [ParentLocatorEntry; 8],
    reserved2: [u8; 256],
}

impl VhdDynamicHeader {
    pub const COOKIE: &'static [u8; 8] = b"cxsparse";
    pub const SIZE: usize = 1024;
    const CHECKSUM_RANGE: std::ops::Range<usize> = 36..40;

    /// Parse from 1024 raw bytes. Cookie mismatch is fatal; checksum
    /// mismatch is logged and tolerated, matching the footer policy.
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < Self::SIZE {
            return Err(Error::malformed("dynamic header shorter than 1024 bytes"));
        }
        if &bytes[0..8] != Self::COOKIE {
            return Err(Error::malformed("dynamic header cookie mismatch"));
        }

        let (data_offset, off) = codec::read_u64(bytes, 8, BE);
        let (table_offset, off) = codec::read_u64(bytes, off, BE);
        let (header_version, off) = codec::read_u32(bytes, off, BE);
        let (max_table_entries, off) = codec::read_u32(bytes, off, BE);
        let (block_size, off) = codec::read_u32(bytes, off, BE);
        let (checksum, off) = codec::read_u32(bytes, off, BE);
        let parent_uid = Uuid::from_slice(&bytes[off..off + 16])
            .map_err(|_| Error::malformed("parent uid field truncated"))?;
        let (parent_time_stamp, off) = codec::read_u32(bytes, off + 16, BE);
        let mut reserved1 = [0u8; 4];
        reserved1.copy_from_slice(&bytes[off..off + 4]);

        let mut parent_unicode_name = [0u8; 512];
        parent_unicode_name.copy_from_slice(&bytes[64..576]);

        let mut parent_locators = [ParentLocatorEntry::empty(); 8];
        for (i, locator) in parent_locators.iter_mut().enumerate() {
            let at = 576 + i * ParentLocatorEntry::SIZE;
            *locator = ParentLocatorEntry::parse(&bytes[at..at + ParentLocatorEntry::SIZE])?;
        }

        let mut reserved2 = [0u8; 256];
        reserved2.copy_from_slice(&bytes[768..1024]);

        if block_size == 0 || block_size % SECTOR_SIZE as u32 != 0 {
            return Err(Error::malformed(format!("invalid block size {}", block_size)));
        }

        let header = Self {
            data_offset,
            table_offset,
            header_version,
            max_table_entries,
            block_size,
            checksum,
            parent_uid,
            parent_time_stamp,
            reserved1,
            parent_unicode_name,
            parent_locators,
            reserved2,
        };

        let computed = ones_complement_checksum(&bytes[..Self::SIZE], Self::CHECKSUM_RANGE);
        if computed != checksum {
            tracing::warn!(
                stored = checksum,
                computed,
                "dynamic header checksum mismatch, accepting image anyway"
            );
        }

        Ok(header)
    }

    pub fn serialize(&self, bytes: &mut [u8; Self::SIZE]) {
        bytes[0..8].copy_from_slice(Self::COOKIE);
        bytes[8..16].copy_from_slice(&codec::write_u64(self.data_offset, BE));
        bytes[16..24].copy_from_slice(&codec::write_u64(self.table_offset, BE));
        bytes[24..28].copy_from_slice(&codec::write_u32(self.header_version, BE));
        bytes[28..32].copy_from_slice(&codec::write_u32(self.max_table_entries, BE));
        bytes[32..36].copy_from_slice(&codec::write_u32(self.block_size, BE));
        bytes[36..40].copy_from_slice(&codec::write_u32(self.checksum, BE));
        bytes[40..56].copy_from_slice(self.parent_uid.as_bytes());
        bytes[56..60].copy_from_slice(&codec::write_u32(self.parent_time_stamp, BE));
        bytes[60..64].copy_from_slice(&self.reserved1);
        bytes[64..576].copy_from_slice(&self.parent_unicode_name);
        for (i, locator) in self.parent_locators.iter().enumerate() {
            let at = 576 + i * ParentLocatorEntry::SIZE;
            locator.serialize(&mut bytes[at..at + ParentLocatorEntry::SIZE]);
        }
        bytes[768..1024].copy_from_slice(&self.reserved2);
    }

    /// Serialize with a freshly computed checksum.
    pub fn marshal(&mut self) -> [u8; Self::SIZE] {
        self.update_checksum();
        let mut bytes = [0u8; Self::SIZE];
        self.serialize(&mut bytes);
        bytes
    }

    pub fn update_checksum(&mut self) {
        let mut bytes = [0u8; Self::SIZE];
        self.checksum = 0;
        self.serialize(&mut bytes);
        self.checksum = ones_complement_checksum(&bytes, Self::CHECKSUM_RANGE);
    }

    pub fn verify_checksum(&self) -> bool {
        let mut bytes = [0u8; Self::SIZE];
        self.serialize(&mut bytes);
        ones_complement_checksum(&bytes, Self::CHECKSUM_RANGE) == self.checksum
    }

    /// Decode the parent name field, stopping at the first NUL.
    pub fn parent_name(&self) -> Result<String> {
        codec::utf16_to_string(&self.parent_unicode_name)
    }

    /// Store `name` into the parent name field as NUL-padded UTF-16BE.
    pub fn set_parent_name(&mut self, name: &str) {
        self.parent_unicode_name = [0u8; 512];
        let mut off = 0;
        for unit in name.encode_utf16() {
            if off + 2 > self.parent_unicode_name.len() {
                break;
            }
            self.parent_unicode_name[off..off + 2]
                .copy_from_slice(&codec::write_u16(unit, BE));
            off += 2;
        }
    }

    pub fn new(table_offset: u64, max_table_entries: u32, block_size: u32) -> Self {
        let mut header = Self {
            data_offset: u64::MAX,
            table_offset,
            header_version: 0x0001_0000,
            max_table_entries,
            block_size,
            checksum: 0,
            parent_uid: Uuid::nil(),
            parent_time_stamp: 0,
            reserved1: [0u8; 4],
            parent_unicode_name: [0u8; 512],
            parent_locators: [ParentLocatorEntry::empty(); 8],
            reserved2: [0u8; 256],
        };
        header.update_checksum();
        header
    }

    /// Sectors per block for this header's block size.
    pub fn sectors_per_block(&self) -> u64 {
        self.block_size as u64 / SECTOR_SIZE as u64
    }

    /// Size of a block's presence bitmap, padded to a sector boundary.
    pub fn bitmap_size_padded(&self) -> u64 {
        let bits_bytes = self.sectors_per_block().div_ceil(8);
        bits_bytes.div_ceil(SECTOR_SIZE as u64) * SECTOR_SIZE as u64
    }
}

/// Position of a logical sector within the sparse layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SectorLocation {
    pub block: u64,
    pub sector_in_block: u64,
    pub bitmap_byte: u64,
    /// MSB-first bit mask for this sector within its bitmap byte
    pub mask: u8,
}

impl SectorLocation {
    pub fn locate(sector: u64, sectors_per_block: u64) -> Self {
        let block = sector / sectors_per_block;
        let sector_in_block = sector % sectors_per_block;
        let bitmap_byte = sector_in_block / 8;
        let mask = 0x80u8 >> (sector_in_block % 8);
        Self { block, sector_in_block, bitmap_byte, mask }
    }
}

/// The Block Allocation Table: one big-endian u32 per block, either
/// [`BlockAllocationTable::UNALLOCATED`] or the sector number where the
/// block (bitmap first) begins on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockAllocationTable {
    entries: Vec<u32>,
}

impl BlockAllocationTable {
    pub const UNALLOCATED: u32 = 0xFFFF_FFFF;

    pub fn parse(bytes: &[u8]) -> Result<Self> {
        if bytes.len() % 4 != 0 {
            return Err(Error::malformed("BAT length not a multiple of 4"));
        }
        let mut entries = Vec::with_capacity(bytes.len() / 4);
        let mut off = 0;
        while off < bytes.len() {
            let (entry, next) = codec::read_u32(bytes, off, BE);
            entries.push(entry);
            off = next;
        }
        Ok(Self { entries })
    }

    pub fn new_unallocated(count: usize) -> Self {
        Self { entries: vec![Self::UNALLOCATED; count] }
    }

    pub fn serialize(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(self.entries.len() * 4);
        for &entry in &self.entries {
            bytes.extend_from_slice(&codec::write_u32(entry, BE));
        }
        bytes
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entry(&self, block: u64) -> Option<u32> {
        self.entries.get(block as usize).copied()
    }

    pub fn set_entry(&mut self, block: u64, sector: u32) {
        self.entries[block as usize] = sector;
    }

    pub fn is_allocated(&self, block: u64) -> bool {
        matches!(self.entry(block), Some(e) if e != Self::UNALLOCATED)
    }

    /// Iterator over `(block_index, sector_number)` for allocated blocks.
    pub fn allocated(&self) -> impl Iterator<Item = (u64, u32)> + '_ {
        self.entries
            .iter()
            .enumerate()
            .filter(|(_, &e)| e != Self::UNALLOCATED)
            .map(|(i, &e)| (i as u64, e))
    }
}
