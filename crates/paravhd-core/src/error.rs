//! Error types shared across the paravhd crates

use thiserror::Error;

/// A named byte range inside an image file, as reported by the overlap
/// self-check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OverlapRegion {
    pub name: String,
    pub start: u64,
    pub length: u64,
}

/// The main error type for paravhd operations
#[derive(Error, Debug)]
pub enum Error {
    /// I/O error from the underlying file or mapping
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Structurally invalid on-disk data: bad cookie, short read,
    /// unknown disk type, inconsistent offsets
    #[error("malformed image: {0}")]
    MalformedFormat(String),

    /// Recomputed checksum differs from the stored one. Parsing tolerates
    /// this (some producers miscompute); the kind exists for callers that
    /// want to enforce it.
    #[error("checksum mismatch: {0}")]
    ChecksumMismatch(String),

    /// A differencing image whose locator chain yields no existing parent
    #[error("parent resolution failed: {0}")]
    ParentResolution(String),

    /// Sector or byte range beyond the virtual size of the disk
    #[error("out of range: {0}")]
    OutOfRange(String),

    /// The overlap self-check found intersecting on-disk regions
    #[error("overlapping on-disk regions detected ({} regions)", .0.len())]
    OverlapDetected(Vec<OverlapRegion>),
}

/// Result type alias for paravhd operations
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Create a malformed-image error
    pub fn malformed(msg: impl Into<String>) -> Self {
        Error::MalformedFormat(msg.into())
    }

    /// Create a checksum-mismatch error
    pub fn checksum(msg: impl Into<String>) -> Self {
        Error::ChecksumMismatch(msg.into())
    }

    /// Create a parent-resolution error
    pub fn parent(msg: impl Into<String>) -> Self {
        Error::ParentResolution(msg.into())
    }

    /// Create an out-of-range error
    pub fn out_of_range(msg: impl Into<String>) -> Self {
        Error::OutOfRange(msg.into())
    }
}
