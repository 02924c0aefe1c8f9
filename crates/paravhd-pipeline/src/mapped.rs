//! Read-write memory-mapped files

use memmap2::MmapMut;
use paravhd_core::MAX_MAP_SIZE;
use std::fs::{File, OpenOptions};
use std::io;
use std::path::Path;

/// A file held under a shared read-write memory map.
///
/// All access is positioned (`read_at`/`write_at`); there is no cursor.
/// Stores go straight to the mapping, so mutations become visible to the
/// underlying file without explicit write-back; `flush` forces them to
/// stable storage.
///
/// # Safety
///
/// Uses `unsafe` for memory mapping because:
/// - The file is validated to be a regular file before mapping
/// - The mapping is recreated after every length change (`grow`)
/// - The file must not be truncated externally while mapped (caller
///   responsibility, as with the read-only pipeline this derives from)
pub struct MappedFile {
    file: File,
    map: MmapMut,
}

impl MappedFile {
    /// Create `path` with length `len` and map it read-write.
    ///
    /// An existing file at `path` is truncated.
    pub fn create(path: &Path, len: u64) -> io::Result<Self> {
        if len > MAX_MAP_SIZE {
            return Err(size_cap_error(len));
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        file.set_len(len)?;

        // SAFETY: freshly created regular file of a validated size; we hold
        // the only handle that resizes it.
        let map = unsafe { MmapMut::map_mut(&file)? };
        Ok(Self { file, map })
    }

    /// Open an existing file at `path` and map it read-write.
    pub fn open(path: &Path) -> io::Result<Self> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        let metadata = file.metadata()?;

        if !metadata.is_file() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "only regular files can be memory-mapped",
            ));
        }
        if metadata.len() > MAX_MAP_SIZE {
            return Err(size_cap_error(metadata.len()));
        }
        if metadata.len() == 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "cannot map an empty file",
            ));
        }

        // SAFETY: validated regular file, non-zero, within the size cap.
        let map = unsafe { MmapMut::map_mut(&file)? };
        Ok(Self { file, map })
    }

    /// Length of the mapped region in bytes.
    pub fn len(&self) -> u64 {
        self.map.len() as u64
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Copy `buf.len()` bytes starting at `offset` out of the mapping.
    pub fn read_at(&self, offset: u64, buf: &mut [u8]) -> io::Result<()> {
        let range = self.checked_range(offset, buf.len())?;
        buf.copy_from_slice(&self.map[range]);
        Ok(())
    }

    /// Copy `data` into the mapping starting at `offset`.
    pub fn write_at(&mut self, offset: u64, data: &[u8]) -> io::Result<()> {
        let range = self.checked_range(offset, data.len())?;
        self.map[range].copy_from_slice(data);
        Ok(())
    }

    /// Zero-fill `len` bytes starting at `offset`.
    pub fn zero_range(&mut self, offset: u64, len: u64) -> io::Result<()> {
        let len = usize::try_from(len)
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "range too large"))?;
        let range = self.checked_range(offset, len)?;
        self.map[range].fill(0);
        Ok(())
    }

    /// Extend the file to `new_len` and re-establish the mapping.
    ///
    /// Shrinking is rejected; the caller owns layout invariants and never
    /// needs it.
    pub fn grow(&mut self, new_len: u64) -> io::Result<()> {
        if new_len < self.len() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "grow cannot shrink the mapping",
            ));
        }
        if new_len > MAX_MAP_SIZE {
            return Err(size_cap_error(new_len));
        }
        if new_len == self.len() {
            return Ok(());
        }

        self.map.flush()?;
        self.file.set_len(new_len)?;
        // SAFETY: same file, new validated length; the old mapping is
        // replaced atomically from this struct's point of view.
        self.map = unsafe { MmapMut::map_mut(&self.file)? };
        Ok(())
    }

    /// Flush dirty pages to stable storage.
    pub fn flush(&self) -> io::Result<()> {
        self.map.flush()
    }

    fn checked_range(&self, offset: u64, len: usize) -> io::Result<std::ops::Range<usize>> {
        let end = offset
            .checked_add(len as u64)
            .filter(|&e| e <= self.len())
            .ok_or_else(|| {
                io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    format!("range {}+{} outside mapping of {}", offset, len, self.len()),
                )
            })?;
        Ok(offset as usize..end as usize)
    }
}

fn size_cap_error(len: u64) -> io::Error {
    io::Error::new(
        io::ErrorKind::InvalidInput,
        format!("file size {} exceeds mapping limit {} (16 GB)", len, MAX_MAP_SIZE),
    )
}
