//! # paravhd-core
//!
//! Shared foundations for the paravhd workspace:
//! - **Errors**: the common error type crossing the format and transport crates
//! - **Codec**: endian-parameterized integer and UTF-16 wire codecs
//! - **Constants**: sector and page geometry shared by both subsystems
//!
//! The VHD on-disk format is big-endian; the ring wire protocol is
//! little-endian. Every codec function therefore takes the endianness
//! explicitly rather than defaulting.

pub mod codec;
pub mod error;

pub use codec::Endian;
pub use error::{Error, OverlapRegion, Result};

/// Size of one disk sector in bytes. Both subsystems assume 512-byte sectors.
pub const SECTOR_SIZE: usize = 512;

/// Size of one shared/granted page in bytes.
pub const PAGE_SIZE: usize = 4096;

/// Sectors carried by a single granted page.
pub const SECTORS_PER_PAGE: usize = PAGE_SIZE / SECTOR_SIZE;

/// Offset of the VHD epoch (2000-01-01T00:00:00Z) from the Unix epoch,
/// in seconds. On-disk timestamps count from here.
pub const VHD_EPOCH_OFFSET: u64 = 946_684_800;

/// Largest file the workspace will memory-map (16 GB). Guards against
/// absurd mappings driven by untrusted image metadata.
pub const MAX_MAP_SIZE: u64 = 16 * 1024 * 1024 * 1024;
