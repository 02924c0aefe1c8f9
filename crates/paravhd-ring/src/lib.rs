//! # paravhd-ring
//!
//! The paravirtualized block transport: a single-producer/single-consumer
//! request/response ring on one shared 4 KiB page, a wire protocol with
//! 32-bit and 64-bit ABI slot layouts, and the backend service that turns
//! ring requests into disk I/O.
//!
//! The collaborators the transport rides on (signal ports, grant-shared
//! pages) are trait seams in [`port`], with in-memory implementations for
//! tests and embedding. All wire integers are little-endian.

pub mod backend;
pub mod error;
pub mod port;
pub mod protocol;
pub mod ring;
pub mod vhd_ops;

pub use backend::{BackendOptions, BlockBackend, BlockOps};
pub use error::{Error, Result};
pub use port::{
    EventChannels, GrantPages, GrantPermission, GrantedPage, HeapGrants, LoopbackEvents,
    LoopbackPort, SignalPort,
};
pub use protocol::{AbiVariant, Operation, Request, Response, Segment, Status, MAX_SEGMENTS};
pub use ring::{FrontRing, SharedRing};
pub use vhd_ops::VhdDiskOps;
