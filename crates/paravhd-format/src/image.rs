//! VHD image lifecycle and sector I/O
//!
//! [`VhdImage`] owns a memory-mapped image file, its parsed metadata, and
//! the resolved parent chain. Sector reads walk the BAT, the per-block
//! bitmap, and the parents; sector writes allocate blocks on first touch
//! and maintain the trailing footer.

use crate::check;
use crate::geometry;
use crate::types::{
    BlockAllocationTable, ParentLocatorEntry, SectorLocation, VhdDynamicHeader, VhdFooter, VhdType,
};
use paravhd_core::{Error, OverlapRegion, Result, SECTOR_SIZE, VHD_EPOCH_OFFSET};
use paravhd_pipeline::MappedFile;
use std::path::{Path, PathBuf};
use uuid::Uuid;

/// Options for image creation.
#[derive(Debug, Clone)]
pub struct VhdOptions {
    /// Sparse block size in bytes; must be a multiple of 512
    pub block_size: u32,
    /// Byte offset of the dynamic header (footer `data_offset` field)
    pub data_offset: u64,
    /// Byte offset of the BAT
    pub table_offset: u64,
    /// Byte offset reserved for the first parent locator payload
    pub locator_offset: u64,
    pub creator_app: [u8; 4],
    pub creator_host_os: [u8; 4],
}

impl Default for VhdOptions {
    fn default() -> Self {
        Self {
            block_size: 0x0020_0000, // 2 MiB
            data_offset: 512,
            table_offset: 2048,
            locator_offset: 1536,
            creator_app: *b"pvhd",
            creator_host_os: *b"Wi2k",
        }
    }
}

/// An open VHD image with its parent chain.
///
/// Single-writer: the memory map is the only locus of mutation and no
/// internal locking is provided. Concurrent access must be serialized by
/// the caller.
pub struct VhdImage {
    path: PathBuf,
    file: MappedFile,
    footer: VhdFooter,
    header: Option<VhdDynamicHeader>,
    bat: Option<BlockAllocationTable>,
    locator_data: [Option<Vec<u8>>; 8],
    parent: Option<Box<VhdImage>>,
}

impl VhdImage {
    /// Open and parse an image, resolving the parent chain for
    /// differencing disks.
    pub fn load(path: &Path) -> Result<Self> {
        let file = MappedFile::open(path)?;
        if file.len() < VhdFooter::SIZE as u64 {
            return Err(Error::malformed("file too small for a footer"));
        }

        // Sparse images carry a footer copy at offset 0; fixed images only
        // have the trailing footer, so fall back to the end of the file.
        let mut head = [0u8; VhdFooter::SIZE];
        file.read_at(0, &mut head)?;
        let footer = match VhdFooter::parse(&head) {
            Ok(footer) => footer,
            Err(head_err) => {
                let mut tail = [0u8; VhdFooter::SIZE];
                file.read_at(file.len() - VhdFooter::SIZE as u64, &mut tail)?;
                let footer = VhdFooter::parse(&tail).map_err(|_| head_err)?;
                if footer.disk_type.is_sparse() {
                    return Err(Error::malformed("sparse image is missing its leading footer copy"));
                }
                footer
            }
        };

        tracing::debug!(path = %path.display(), disk_type = ?footer.disk_type, "loaded footer");

        if !footer.disk_type.is_sparse() {
            if footer.disk_type != VhdType::Fixed {
                return Err(Error::malformed(format!(
                    "disk type {:?} is not usable",
                    footer.disk_type
                )));
            }
            return Ok(Self {
                path: path.to_path_buf(),
                file,
                footer,
                header: None,
                bat: None,
                locator_data: std::array::from_fn(|_| None),
                parent: None,
            });
        }

        let header_end = footer.data_offset.checked_add(VhdDynamicHeader::SIZE as u64);
        if footer.data_offset == u64::MAX || header_end.map_or(true, |end| end > file.len()) {
            return Err(Error::malformed("dynamic header offset outside the file"));
        }
        let mut header_bytes = [0u8; VhdDynamicHeader::SIZE];
        file.read_at(footer.data_offset, &mut header_bytes)?;
        let header = VhdDynamicHeader::parse(&header_bytes)?;

        let bat_len = header.max_table_entries as u64 * 4;
        if header
            .table_offset
            .checked_add(bat_len)
            .map_or(true, |end| end > file.len())
        {
            return Err(Error::malformed("BAT extends beyond the file"));
        }
        let mut bat_bytes = vec![0u8; bat_len as usize];
        file.read_at(header.table_offset, &mut bat_bytes)?;
        let bat = BlockAllocationTable::parse(&bat_bytes)?;

        let mut locator_data: [Option<Vec<u8>>; 8] = std::array::from_fn(|_| None);
        for (i, entry) in header.parent_locators.iter().enumerate() {
            if !entry.is_used() {
                continue;
            }
            let len = entry.platform_data_length as u64;
            if entry
                .platform_data_offset
                .checked_add(len)
                .map_or(true, |end| end > file.len())
            {
                return Err(Error::malformed(format!("locator {} payload outside the file", i)));
            }
            let mut data = vec![0u8; len as usize];
            file.read_at(entry.platform_data_offset, &mut data)?;
            locator_data[i] = Some(data);
        }

        let parent = if footer.disk_type == VhdType::Differencing {
            Some(Box::new(Self::resolve_parent(path, &header, &locator_data)?))
        } else {
            None
        };

        Ok(Self {
            path: path.to_path_buf(),
            file,
            footer,
            header: Some(header),
            bat: Some(bat),
            locator_data,
            parent,
        })
    }

    /// Scan the locators for the first `MacX` entry whose `file://` URI
    /// names an existing file, and load it. Relative URIs resolve against
    /// the child's directory.
    fn resolve_parent(
        child_path: &Path,
        header: &VhdDynamicHeader,
        locator_data: &[Option<Vec<u8>>; 8],
    ) -> Result<VhdImage> {
        let child_dir = child_path.parent().unwrap_or_else(|| Path::new("."));

        for (i, entry) in header.parent_locators.iter().enumerate() {
            if entry.platform_code != ParentLocatorEntry::PLAT_MACX {
                continue;
            }
            let Some(data) = &locator_data[i] else { continue };
            let Ok(text) = std::str::from_utf8(data) else {
                tracing::warn!(locator = i, "parent locator payload is not UTF-8");
                continue;
            };
            let uri = text.trim_end_matches('\0');
            let Some(rest) = uri.strip_prefix("file://") else {
                tracing::debug!(locator = i, uri, "skipping non-file parent locator");
                continue;
            };

            let candidate = if Path::new(rest).is_relative() {
                child_dir.join(rest)
            } else {
                PathBuf::from(rest)
            };
            if !candidate.exists() {
                tracing::warn!(locator = i, path = %candidate.display(), "parent candidate does not exist");
                continue;
            }
            return Self::load(&candidate);
        }

        Err(Error::parent(format!(
            "no locator of {} yields an existing parent",
            child_path.display()
        )))
    }

    /// Create a dynamic image of (at least) `requested_size` bytes.
    ///
    /// The size is rounded up to a whole number of blocks.
    pub fn create_new_dynamic(
        path: &Path,
        requested_size: u64,
        uid: Uuid,
        options: &VhdOptions,
    ) -> Result<Self> {
        let block_size = options.block_size as u64;
        if block_size == 0 || block_size % SECTOR_SIZE as u64 != 0 {
            return Err(Error::malformed(format!("invalid block size {}", block_size)));
        }
        if requested_size == 0 {
            return Err(Error::out_of_range("requested size is zero"));
        }
        let size = requested_size.div_ceil(block_size) * block_size;
        let max_table_entries = (size / block_size) as u32;

        let mut footer = VhdFooter::new(
            VhdType::Dynamic,
            size,
            geometry::chs_for_sectors(size / SECTOR_SIZE as u64),
            uid,
            options.data_offset,
            vhd_timestamp_now(),
            options.creator_app,
            options.creator_host_os,
        );
        let mut header =
            VhdDynamicHeader::new(options.table_offset, max_table_entries, options.block_size);
        let bat = BlockAllocationTable::new_unallocated(max_table_entries as usize);

        let top = options.table_offset + 4 * max_table_entries as u64;
        let mut file = MappedFile::create(path, top + VhdFooter::SIZE as u64)?;

        let footer_bytes = footer.marshal();
        file.write_at(0, &footer_bytes)?;
        file.write_at(options.data_offset, &header.marshal())?;
        file.write_at(options.table_offset, &bat.serialize())?;
        file.write_at(top, &footer_bytes)?;

        tracing::debug!(path = %path.display(), size, blocks = max_table_entries, "created dynamic image");

        Ok(Self {
            path: path.to_path_buf(),
            file,
            footer,
            header: Some(header),
            bat: Some(bat),
            locator_data: std::array::from_fn(|_| None),
            parent: None,
        })
    }

    /// Create a differencing image over `parent_path`, inheriting its
    /// size, geometry, and block layout.
    pub fn create_new_difference(
        path: &Path,
        parent_path: &Path,
        uid: Uuid,
        options: &VhdOptions,
    ) -> Result<Self> {
        let parent = Self::load(parent_path)?;
        let parent_header = parent
            .header
            .as_ref()
            .ok_or_else(|| Error::parent("parent must be a dynamic or differencing image"))?;

        let parent_name = parent_path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| Error::parent("parent path has no usable file name"))?;
        let uri = format!("file://./{}", parent_name);

        let mut footer = VhdFooter::new(
            VhdType::Differencing,
            parent.footer.current_size,
            parent.footer.geometry,
            uid,
            options.data_offset,
            vhd_timestamp_now(),
            options.creator_app,
            options.creator_host_os,
        );

        let mut header = VhdDynamicHeader::new(
            options.table_offset,
            parent_header.max_table_entries,
            parent_header.block_size,
        );
        header.parent_uid = parent.footer.uid;
        header.parent_time_stamp = vhd_timestamp_of_mtime(parent_path)?;
        header.set_parent_name(parent_name);
        // The payload space value is sector-denominated, the convention the
        // normalization rule in ParentLocatorEntry exists for.
        header.parent_locators[0] = ParentLocatorEntry {
            platform_code: ParentLocatorEntry::PLAT_MACX,
            platform_data_space: 1,
            platform_data_length: uri.len() as u32,
            reserved: 0,
            platform_data_offset: options.locator_offset,
        };

        let bat = BlockAllocationTable::new_unallocated(parent_header.max_table_entries as usize);

        let top = options.table_offset + 4 * parent_header.max_table_entries as u64;
        let mut file = MappedFile::create(path, top + VhdFooter::SIZE as u64)?;

        let footer_bytes = footer.marshal();
        file.write_at(0, &footer_bytes)?;
        file.write_at(options.data_offset, &header.marshal())?;
        file.write_at(options.locator_offset, uri.as_bytes())?;
        file.write_at(options.table_offset, &bat.serialize())?;
        file.write_at(top, &footer_bytes)?;

        tracing::debug!(path = %path.display(), parent = %parent_path.display(), "created differencing image");

        let mut locator_data: [Option<Vec<u8>>; 8] = std::array::from_fn(|_| None);
        locator_data[0] = Some(uri.into_bytes());

        Ok(Self {
            path: path.to_path_buf(),
            file,
            footer,
            header: Some(header),
            bat: Some(bat),
            locator_data,
            parent: Some(Box::new(parent)),
        })
    }

    /// Virtual disk capacity in bytes.
    pub fn capacity(&self) -> u64 {
        self.footer.current_size
    }

    pub fn disk_type(&self) -> VhdType {
        self.footer.disk_type
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn footer(&self) -> &VhdFooter {
        &self.footer
    }

    pub fn header(&self) -> Option<&VhdDynamicHeader> {
        self.header.as_ref()
    }

    pub fn bat(&self) -> Option<&BlockAllocationTable> {
        self.bat.as_ref()
    }

    pub fn parent(&self) -> Option<&VhdImage> {
        self.parent.as_deref()
    }

    /// Read one 512-byte sector.
    ///
    /// Unallocated ranges read as zeros for dynamic disks; differencing
    /// disks delegate to the parent wherever the block or the bitmap says
    /// the sector is not local.
    pub fn read_sector(&self, sector: u64) -> Result<[u8; SECTOR_SIZE]> {
        if sector >= self.footer.current_size / SECTOR_SIZE as u64 {
            return Err(Error::out_of_range(format!(
                "sector {} beyond capacity of {} bytes",
                sector, self.footer.current_size
            )));
        }

        if self.footer.disk_type == VhdType::Fixed {
            let mut buf = [0u8; SECTOR_SIZE];
            self.file.read_at(sector * SECTOR_SIZE as u64, &mut buf)?;
            return Ok(buf);
        }

        let header = self.sparse_header()?;
        let bat = self.sparse_bat()?;
        let loc = SectorLocation::locate(sector, header.sectors_per_block());

        let entry = bat
            .entry(loc.block)
            .ok_or_else(|| Error::out_of_range(format!("block {} outside the BAT", loc.block)))?;

        if entry == BlockAllocationTable::UNALLOCATED {
            return match (&self.parent, self.footer.disk_type) {
                (Some(parent), VhdType::Differencing) => parent.read_sector(sector),
                _ => Ok([0u8; SECTOR_SIZE]),
            };
        }

        let block_start = entry as u64 * SECTOR_SIZE as u64;

        // Dynamic disks treat every sector of an allocated block as
        // present; differencing disks must consult the bitmap and
        // delegate cleared sectors to the parent.
        if self.footer.disk_type == VhdType::Differencing {
            let mut byte = [0u8; 1];
            self.file.read_at(block_start + loc.bitmap_byte, &mut byte)?;
            if byte[0] & loc.mask == 0 {
                if let Some(parent) = &self.parent {
                    return parent.read_sector(sector);
                }
                return Ok([0u8; SECTOR_SIZE]);
            }
        }

        let data_start = block_start + header.bitmap_size_padded();
        let mut buf = [0u8; SECTOR_SIZE];
        self.file
            .read_at(data_start + loc.sector_in_block * SECTOR_SIZE as u64, &mut buf)?;
        Ok(buf)
    }

    /// Write one 512-byte sector, allocating its block on first touch.
    pub fn write_sector(&mut self, sector: u64, data: &[u8]) -> Result<()> {
        if data.len() != SECTOR_SIZE {
            return Err(Error::out_of_range(format!(
                "sector write must be exactly {} bytes, got {}",
                SECTOR_SIZE,
                data.len()
            )));
        }
        if sector >= self.footer.current_size / SECTOR_SIZE as u64 {
            return Err(Error::out_of_range(format!(
                "sector {} beyond capacity of {} bytes",
                sector, self.footer.current_size
            )));
        }

        if self.footer.disk_type == VhdType::Fixed {
            return Ok(self.file.write_at(sector * SECTOR_SIZE as u64, data)?);
        }

        let header = self.sparse_header()?;
        let sectors_per_block = header.sectors_per_block();
        let bitmap_size = header.bitmap_size_padded();
        let loc = SectorLocation::locate(sector, sectors_per_block);

        let entry = self
            .sparse_bat()?
            .entry(loc.block)
            .ok_or_else(|| Error::out_of_range(format!("block {} outside the BAT", loc.block)))?;

        let block_start = if entry == BlockAllocationTable::UNALLOCATED {
            self.allocate_block(loc.block)?
        } else {
            entry as u64 * SECTOR_SIZE as u64
        };

        let mut bitmap_byte = [0u8; 1];
        self.file.read_at(block_start + loc.bitmap_byte, &mut bitmap_byte)?;
        bitmap_byte[0] |= loc.mask;

        let data_start = block_start + bitmap_size;
        self.file
            .write_at(data_start + loc.sector_in_block * SECTOR_SIZE as u64, data)?;
        self.file.write_at(block_start + loc.bitmap_byte, &bitmap_byte)?;
        Ok(())
    }

    /// Place a new block at the top of the file: zero its bitmap and data,
    /// persist the BAT entry, and move the trailing footer past it.
    /// Returns the block's byte offset.
    fn allocate_block(&mut self, block: u64) -> Result<u64> {
        let header = self.sparse_header()?;
        let bitmap_size = header.bitmap_size_padded();
        let block_size = header.block_size as u64;
        let table_offset = header.table_offset;

        let place_bytes = self.top_unused_offset()?;
        let place_sector = place_bytes.div_ceil(SECTOR_SIZE as u64);
        let entry: u32 = place_sector
            .try_into()
            .map_err(|_| Error::out_of_range("block placement beyond 32-bit sector numbers"))?;
        let block_start = place_sector * SECTOR_SIZE as u64;

        let new_top = block_start + bitmap_size + block_size;
        let needed = new_top + VhdFooter::SIZE as u64;
        if needed > self.file.len() {
            self.file.grow(needed)?;
        }
        // The freshly claimed range may cover the old trailing footer, so
        // zero it explicitly rather than relying on file extension.
        self.file.zero_range(block_start, bitmap_size + block_size)?;

        let bat = self
            .bat
            .as_mut()
            .ok_or_else(|| Error::malformed("image has no BAT"))?;
        bat.set_entry(block, entry);
        self.file.write_at(
            table_offset + block * 4,
            &paravhd_core::codec::write_u32(entry, paravhd_core::Endian::Big),
        )?;

        let footer_bytes = self.footer.marshal();
        self.file.write_at(new_top, &footer_bytes)?;

        tracing::trace!(block, sector = entry, "allocated block");
        Ok(block_start)
    }

    /// First byte past everything the image currently uses: the maximum
    /// block end, or the end of the BAT when nothing is allocated.
    pub fn top_unused_offset(&self) -> Result<u64> {
        let header = self.sparse_header()?;
        let bat = self.sparse_bat()?;
        let per_block = header.bitmap_size_padded() + header.block_size as u64;
        let mut top = header.table_offset + 4 * header.max_table_entries as u64;
        for (_, sector) in bat.allocated() {
            top = top.max(sector as u64 * SECTOR_SIZE as u64 + per_block);
        }
        Ok(top)
    }

    /// Run the on-disk region overlap self-check. Reports; never mutates.
    pub fn check_overlaps(&self) -> Result<()> {
        if !self.footer.disk_type.is_sparse() {
            return Ok(());
        }
        let header = self.sparse_header()?;
        let bat = self.sparse_bat()?;

        let mut regions = vec![
            OverlapRegion {
                name: "footer-copy".into(),
                start: 0,
                length: VhdFooter::SIZE as u64,
            },
            OverlapRegion {
                name: "header".into(),
                start: self.footer.data_offset,
                length: VhdDynamicHeader::SIZE as u64,
            },
            OverlapRegion {
                name: "bat".into(),
                start: header.table_offset,
                length: header.max_table_entries as u64 * 4,
            },
        ];
        for (i, entry) in header.parent_locators.iter().enumerate() {
            if entry.is_used() {
                regions.push(OverlapRegion {
                    name: format!("locator-{}", i),
                    start: entry.platform_data_offset,
                    length: entry.data_space_bytes(),
                });
            }
        }
        let per_block = header.bitmap_size_padded() + header.block_size as u64;
        for (block, sector) in bat.allocated() {
            regions.push(OverlapRegion {
                name: format!("block-{}", block),
                start: sector as u64 * SECTOR_SIZE as u64,
                length: per_block,
            });
        }

        check::verify_disjoint(&regions)
    }

    /// Flush mapped mutations to stable storage.
    pub fn flush(&self) -> Result<()> {
        Ok(self.file.flush()?)
    }

    fn sparse_header(&self) -> Result<&VhdDynamicHeader> {
        self.header
            .as_ref()
            .ok_or_else(|| Error::malformed("operation requires a sparse image"))
    }

    fn sparse_bat(&self) -> Result<&BlockAllocationTable> {
        self.bat
            .as_ref()
            .ok_or_else(|| Error::malformed("image has no BAT"))
    }
}

/// Seconds since the VHD epoch for the current wall-clock time.
fn vhd_timestamp_now() -> u32 {
    let now = chrono::Utc::now().timestamp();
    now.saturating_sub(VHD_EPOCH_OFFSET as i64).max(0) as u32
}

/// Seconds since the VHD epoch for a file's modification time.
fn vhd_timestamp_of_mtime(path: &Path) -> Result<u32> {
    let mtime = std::fs::metadata(path)?.modified()?;
    let stamp = chrono::DateTime::<chrono::Utc>::from(mtime).timestamp();
    Ok(stamp.saturating_sub(VHD_EPOCH_OFFSET as i64).max(0) as u32)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const MIB: u64 = 1024 * 1024;

    fn test_uuid() -> Uuid {
        Uuid::parse_str("0b8ae7ed-fe39-4a36-a409-aac071fab6e9").unwrap()
    }

    fn sector_of(byte: u8) -> Vec<u8> {
        vec![byte; SECTOR_SIZE]
    }

    #[test]
    fn test_create_dynamic_layout() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("t.vhd");
        let image =
            VhdImage::create_new_dynamic(&path, 4 * MIB, test_uuid(), &VhdOptions::default())
                .unwrap();

        assert_eq!(image.capacity(), 4 * MIB);
        let header = image.header().unwrap();
        assert_eq!(header.max_table_entries, 2);
        assert_eq!(header.block_size, 0x0020_0000);
        assert_eq!(header.table_offset, 2048);
        assert_eq!(image.footer().data_offset, 512);

        // Empty image: the trailing footer sits right after the BAT
        let top = image.top_unused_offset().unwrap();
        assert_eq!(top, 2048 + 4 * 2);
        drop(image);

        let raw = std::fs::read(&path).unwrap();
        assert_eq!(&raw[0..8], b"conectix");
        assert_eq!(&raw[512..520], b"cxsparse");
        assert_eq!(&raw[2056..2064], b"conectix");
        assert_eq!(raw.len(), 2056 + 512);
        // BAT is fully unallocated
        assert!(raw[2048..2056].iter().all(|&b| b == 0xFF));
    }

    #[test]
    fn test_requested_size_rounds_up_to_block() {
        let dir = TempDir::new().unwrap();
        let image = VhdImage::create_new_dynamic(
            &dir.path().join("r.vhd"),
            3 * MIB,
            test_uuid(),
            &VhdOptions::default(),
        )
        .unwrap();
        assert_eq!(image.capacity(), 4 * MIB);
        assert_eq!(image.header().unwrap().max_table_entries, 2);
    }

    #[test]
    fn test_fresh_dynamic_reads_zero() {
        let dir = TempDir::new().unwrap();
        let image = VhdImage::create_new_dynamic(
            &dir.path().join("z.vhd"),
            4 * MIB,
            test_uuid(),
            &VhdOptions::default(),
        )
        .unwrap();

        for sector in [0u64, 1, 4095, 4096, 8191] {
            assert_eq!(image.read_sector(sector).unwrap(), [0u8; SECTOR_SIZE]);
        }
    }

    #[test]
    fn test_write_read_round_trip_and_allocation() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("t.vhd");
        let mut image =
            VhdImage::create_new_dynamic(&path, 4 * MIB, test_uuid(), &VhdOptions::default())
                .unwrap();

        image.write_sector(0, &sector_of(b'A')).unwrap();

        assert_eq!(image.read_sector(0).unwrap(), [b'A'; SECTOR_SIZE]);
        assert_eq!(image.read_sector(1).unwrap(), [0u8; SECTOR_SIZE]);

        // The BAT entry moved off UNALLOCATED to a sector number: the
        // empty-image top (2056) rounded up to the next sector
        let bat = image.bat().unwrap();
        assert!(bat.is_allocated(0));
        assert_eq!(bat.entry(0), Some(5));

        // Trailing footer follows the block exactly
        let header = image.header().unwrap();
        let expected_top =
            5 * SECTOR_SIZE as u64 + header.block_size as u64 + header.bitmap_size_padded();
        assert_eq!(image.top_unused_offset().unwrap(), expected_top);
        image.flush().unwrap();
        drop(image);

        let raw = std::fs::read(&path).unwrap();
        assert_eq!(&raw[expected_top as usize..expected_top as usize + 8], b"conectix");
        assert_eq!(raw.len() as u64, expected_top + 512);

        // Exactly one bitmap bit is set, and it is the MSB of byte 0
        let bitmap = &raw[2560..2560 + 512];
        let ones: u32 = bitmap.iter().map(|b| b.count_ones()).sum();
        assert_eq!(ones, 1);
        assert_eq!(bitmap[0], 0x80);
    }

    #[test]
    fn test_reload_after_write() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("t.vhd");
        {
            let mut image =
                VhdImage::create_new_dynamic(&path, 4 * MIB, test_uuid(), &VhdOptions::default())
                    .unwrap();
            image.write_sector(7, &sector_of(0x5A)).unwrap();
            image.write_sector(4096, &sector_of(0xC3)).unwrap();
            image.flush().unwrap();
        }

        let image = VhdImage::load(&path).unwrap();
        assert_eq!(image.footer().uid, test_uuid());
        assert_eq!(image.read_sector(7).unwrap(), [0x5A; SECTOR_SIZE]);
        assert_eq!(image.read_sector(4096).unwrap(), [0xC3; SECTOR_SIZE]);
        assert_eq!(image.read_sector(8).unwrap(), [0u8; SECTOR_SIZE]);
    }

    #[test]
    fn test_block_boundary_sectors() {
        let dir = TempDir::new().unwrap();
        let mut image = VhdImage::create_new_dynamic(
            &dir.path().join("b.vhd"),
            4 * MIB,
            test_uuid(),
            &VhdOptions::default(),
        )
        .unwrap();

        // Last sector of block 0 and first sector of block 1
        image.write_sector(4095, &sector_of(1)).unwrap();
        image.write_sector(4096, &sector_of(2)).unwrap();
        assert_eq!(image.read_sector(4095).unwrap(), [1u8; SECTOR_SIZE]);
        assert_eq!(image.read_sector(4096).unwrap(), [2u8; SECTOR_SIZE]);
        assert_eq!(image.read_sector(4094).unwrap(), [0u8; SECTOR_SIZE]);

        let bat = image.bat().unwrap();
        assert!(bat.is_allocated(0));
        assert!(bat.is_allocated(1));
    }

    #[test]
    fn test_out_of_range_rejected() {
        let dir = TempDir::new().unwrap();
        let mut image = VhdImage::create_new_dynamic(
            &dir.path().join("o.vhd"),
            4 * MIB,
            test_uuid(),
            &VhdOptions::default(),
        )
        .unwrap();

        // Capacity is 8192 sectors
        assert!(matches!(image.read_sector(8192), Err(Error::OutOfRange(_))));
        assert!(matches!(
            image.write_sector(8192, &sector_of(1)),
            Err(Error::OutOfRange(_))
        ));
        assert!(matches!(
            image.write_sector(0, &[0u8; 100]),
            Err(Error::OutOfRange(_))
        ));
        // Last valid sector works
        image.write_sector(8191, &sector_of(9)).unwrap();
        assert_eq!(image.read_sector(8191).unwrap(), [9u8; SECTOR_SIZE]);
    }

    #[test]
    fn test_differencing_chain() {
        let dir = TempDir::new().unwrap();
        let parent_path = dir.path().join("base.vhd");
        let child_path = dir.path().join("delta.vhd");

        {
            let mut parent = VhdImage::create_new_dynamic(
                &parent_path,
                4 * MIB,
                test_uuid(),
                &VhdOptions::default(),
            )
            .unwrap();
            parent.write_sector(5, &sector_of(b'P')).unwrap();
            parent.flush().unwrap();
        }

        let mut child = VhdImage::create_new_difference(
            &child_path,
            &parent_path,
            Uuid::new_v4(),
            &VhdOptions::default(),
        )
        .unwrap();

        assert_eq!(child.disk_type(), VhdType::Differencing);
        assert_eq!(child.capacity(), 4 * MIB);
        let parent_uid = child.parent().unwrap().footer().uid;
        assert_eq!(child.header().unwrap().parent_uid, parent_uid);
        assert_eq!(child.header().unwrap().parent_name().unwrap(), "base.vhd");

        // Unwritten sectors come from the parent
        assert_eq!(child.read_sector(5).unwrap(), [b'P'; SECTOR_SIZE]);
        assert_eq!(child.read_sector(0).unwrap(), [0u8; SECTOR_SIZE]);

        // A child write shadows the parent for that sector only
        child.write_sector(5, &sector_of(b'C')).unwrap();
        assert_eq!(child.read_sector(5).unwrap(), [b'C'; SECTOR_SIZE]);
        assert_eq!(child.read_sector(6).unwrap(), [0u8; SECTOR_SIZE]);
        assert_eq!(child.parent().unwrap().read_sector(5).unwrap(), [b'P'; SECTOR_SIZE]);

        // Sector 4 shares the child's allocated block but its bitmap bit
        // is clear, so it still delegates to the parent
        assert!(child.bat().unwrap().is_allocated(0));
        assert_eq!(child.read_sector(4).unwrap(), [0u8; SECTOR_SIZE]);
    }

    #[test]
    fn test_differencing_reload_resolves_parent() {
        let dir = TempDir::new().unwrap();
        let parent_path = dir.path().join("base.vhd");
        let child_path = dir.path().join("delta.vhd");

        {
            let mut parent = VhdImage::create_new_dynamic(
                &parent_path,
                4 * MIB,
                test_uuid(),
                &VhdOptions::default(),
            )
            .unwrap();
            parent.write_sector(100, &sector_of(0xEE)).unwrap();
            parent.flush().unwrap();
        }
        {
            let mut child = VhdImage::create_new_difference(
                &child_path,
                &parent_path,
                Uuid::new_v4(),
                &VhdOptions::default(),
            )
            .unwrap();
            child.write_sector(101, &sector_of(0xDD)).unwrap();
            child.flush().unwrap();
        }

        let child = VhdImage::load(&child_path).unwrap();
        assert!(child.parent().is_some());
        assert_eq!(child.read_sector(100).unwrap(), [0xEE; SECTOR_SIZE]);
        assert_eq!(child.read_sector(101).unwrap(), [0xDD; SECTOR_SIZE]);
    }

    #[test]
    fn test_missing_parent_is_fatal() {
        let dir = TempDir::new().unwrap();
        let parent_path = dir.path().join("base.vhd");
        let child_path = dir.path().join("delta.vhd");

        VhdImage::create_new_dynamic(&parent_path, 4 * MIB, test_uuid(), &VhdOptions::default())
            .unwrap();
        VhdImage::create_new_difference(
            &child_path,
            &parent_path,
            Uuid::new_v4(),
            &VhdOptions::default(),
        )
        .unwrap();

        std::fs::remove_file(&parent_path).unwrap();
        assert!(matches!(
            VhdImage::load(&child_path),
            Err(Error::ParentResolution(_))
        ));
    }

    #[test]
    fn test_difference_requires_sparse_parent() {
        let dir = TempDir::new().unwrap();
        let parent_path = dir.path().join("fixed.vhd");

        // Build a little fixed image by hand: data then trailing footer
        let mut footer = VhdFooter::new(
            VhdType::Fixed,
            MIB,
            geometry::chs_for_sectors(MIB / 512),
            test_uuid(),
            u64::MAX,
            0,
            *b"pvhd",
            *b"Wi2k",
        );
        let mut raw = vec![0u8; MIB as usize];
        raw.extend_from_slice(&footer.marshal());
        std::fs::write(&parent_path, &raw).unwrap();

        let result = VhdImage::create_new_difference(
            &dir.path().join("delta.vhd"),
            &parent_path,
            Uuid::new_v4(),
            &VhdOptions::default(),
        );
        assert!(matches!(result, Err(Error::ParentResolution(_))));
    }

    #[test]
    fn test_fixed_image_round_trip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("fixed.vhd");

        let mut footer = VhdFooter::new(
            VhdType::Fixed,
            MIB,
            geometry::chs_for_sectors(MIB / 512),
            test_uuid(),
            u64::MAX,
            0,
            *b"pvhd",
            *b"Wi2k",
        );
        let mut raw = vec![0u8; MIB as usize];
        raw.extend_from_slice(&footer.marshal());
        std::fs::write(&path, &raw).unwrap();

        let mut image = VhdImage::load(&path).unwrap();
        assert_eq!(image.disk_type(), VhdType::Fixed);
        assert!(image.header().is_none());
        assert!(image.bat().is_none());

        image.write_sector(3, &sector_of(0x77)).unwrap();
        assert_eq!(image.read_sector(3).unwrap(), [0x77; SECTOR_SIZE]);
        assert_eq!(image.read_sector(4).unwrap(), [0u8; SECTOR_SIZE]);
    }

    #[test]
    fn test_overlap_check_clean_after_writes() {
        let dir = TempDir::new().unwrap();
        let mut image = VhdImage::create_new_dynamic(
            &dir.path().join("c.vhd"),
            4 * MIB,
            test_uuid(),
            &VhdOptions::default(),
        )
        .unwrap();

        image.check_overlaps().unwrap();
        for sector in [0u64, 17, 4095, 4096, 8000] {
            image.write_sector(sector, &sector_of(sector as u8)).unwrap();
        }
        image.check_overlaps().unwrap();
    }

    #[test]
    fn test_overlap_check_flags_corrupt_bat() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("c.vhd");
        {
            let mut image = VhdImage::create_new_dynamic(
                &path,
                4 * MIB,
                test_uuid(),
                &VhdOptions::default(),
            )
            .unwrap();
            image.write_sector(0, &sector_of(1)).unwrap();
            image.write_sector(4096, &sector_of(2)).unwrap();
            image.flush().unwrap();
        }

        // Point block 1 at block 0's sector
        let mut raw = std::fs::read(&path).unwrap();
        let entry0 = raw[2048..2052].to_vec();
        raw[2052..2056].copy_from_slice(&entry0);
        std::fs::write(&path, &raw).unwrap();

        let image = VhdImage::load(&path).unwrap();
        assert!(matches!(
            image.check_overlaps(),
            Err(Error::OverlapDetected(_))
        ));
    }

    #[test]
    fn test_truncated_file_rejected() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("short.vhd");
        std::fs::write(&path, [0u8; 100]).unwrap();
        assert!(VhdImage::load(&path).is_err());
    }
}
