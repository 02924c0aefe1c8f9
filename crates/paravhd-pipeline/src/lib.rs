//! # paravhd-pipeline
//!
//! Memory-mapped file I/O for the paravhd workspace.
//!
//! The VHD engine mutates images in place and extends them when blocks are
//! allocated, so the pipeline here is a shared read-write mapping with
//! positioned accessors and an explicit [`MappedFile::grow`] operation,
//! rather than a stream.

pub mod mapped;

pub use mapped::MappedFile;
