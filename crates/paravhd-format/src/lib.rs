//! # paravhd-format
//!
//! The VHD (Virtual Hard Disk) on-disk format engine.
//!
//! Supports the three VHD variants:
//! - **Fixed**: raw data followed by a single trailing footer
//! - **Dynamic**: sparse, block-allocated via a Block Allocation Table
//! - **Differencing**: copy-on-write deltas over a parent image, chained
//!   by parent locators
//!
//! The engine answers `read_sector`/`write_sector` by walking the BAT,
//! per-block sector bitmaps, and the parent chain, allocating blocks on
//! first write. All multi-byte on-disk integers are big-endian.
//!
//! ## Layout of a sparse image
//!
//! ```text
//! footer copy | dynamic header | (locator payloads) | BAT | blocks... | footer
//! ```
//!
//! Each block is a sector-padded presence bitmap followed by `block_size`
//! bytes of data.

pub mod check;
pub mod geometry;
pub mod image;
pub mod types;

pub use image::{VhdImage, VhdOptions};
pub use types::{
    BlockAllocationTable, DiskGeometry, ParentLocatorEntry, VhdDynamicHeader, VhdFeatures,
    VhdFooter, VhdType,
};
