//! Collaborator contracts: signal ports and grant-shared pages
//!
//! The transport consumes two host primitives it does not implement: a
//! cross-domain interrupt ("signal port") and page sharing by grant
//! reference. Both are trait seams here so the backend can run against
//! the real host bindings or against the in-memory implementations below.

use crate::error::{Error, Result};
use async_trait::async_trait;
use paravhd_core::PAGE_SIZE;
use std::cell::UnsafeCell;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;

/// Access requested when mapping a granted page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GrantPermission {
    Read = 1,
    ReadWrite = 3,
}

/// A mapped granted page. The mapping is released on drop, on every exit
/// path.
pub trait GrantedPage: Send + Sync {
    /// Base of the 4 KiB mapping; valid until the guard drops.
    fn as_ptr(&self) -> *mut u8;
}

/// Page sharing by grant reference.
pub trait GrantPages: Send + Sync {
    /// Map `gref` from `remote_domid` with the given permission.
    fn map(
        &self,
        remote_domid: u16,
        gref: u32,
        permission: GrantPermission,
    ) -> Result<Box<dyn GrantedPage>>;

    /// Map, run `body` over the page, and unmap — including when `body`
    /// panics or errors, via the guard's drop.
    fn with_ref<T>(
        &self,
        remote_domid: u16,
        gref: u32,
        permission: GrantPermission,
        body: impl FnOnce(&mut [u8]) -> T,
    ) -> Result<T>
    where
        Self: Sized,
    {
        let page = self.map(remote_domid, gref, permission)?;
        // SAFETY: the guard keeps the mapping alive for the whole call and
        // the transport never maps one gref twice concurrently.
        let slice = unsafe { std::slice::from_raw_parts_mut(page.as_ptr(), PAGE_SIZE) };
        Ok(body(slice))
    }
}

/// A bound cross-domain signal port.
#[async_trait]
pub trait SignalPort: Send + Sync {
    /// Signal the remote end.
    fn notify(&self);

    /// Wait until the remote end signals us. Signals arriving while no
    /// one waits must not be lost.
    async fn wait(&self);

    /// File descriptor for integration with an external poller, when the
    /// implementation has one.
    fn pollable_fd(&self) -> Option<i32> {
        None
    }
}

/// Event-channel binding.
pub trait EventChannels: Send + Sync {
    fn bind_interdomain(&self, remote_domid: u16, remote_port: u32) -> Result<Arc<dyn SignalPort>>;
}

// ---------------------------------------------------------------------------
// In-memory implementations
// ---------------------------------------------------------------------------

/// One half of an in-process signal port pair. `notify` wakes the peer's
/// `wait`; a pending signal is remembered until consumed.
pub struct LoopbackPort {
    local: Arc<Notify>,
    peer: Arc<Notify>,
}

impl LoopbackPort {
    /// Create a connected pair of ports.
    pub fn pair() -> (Arc<LoopbackPort>, Arc<LoopbackPort>) {
        let a = Arc::new(Notify::new());
        let b = Arc::new(Notify::new());
        (
            Arc::new(LoopbackPort { local: a.clone(), peer: b.clone() }),
            Arc::new(LoopbackPort { local: b, peer: a }),
        )
    }
}

#[async_trait]
impl SignalPort for LoopbackPort {
    fn notify(&self) {
        self.peer.notify_one();
    }

    async fn wait(&self) {
        self.local.notified().await;
    }
}

/// An [`EventChannels`] that hands out one pre-built port for any binding.
pub struct LoopbackEvents {
    port: Arc<LoopbackPort>,
}

impl LoopbackEvents {
    pub fn new(port: Arc<LoopbackPort>) -> Self {
        Self { port }
    }
}

impl EventChannels for LoopbackEvents {
    fn bind_interdomain(&self, _remote_domid: u16, _remote_port: u32) -> Result<Arc<dyn SignalPort>> {
        Ok(self.port.clone())
    }
}

// Page-aligned so the ring's atomic index views are valid.
#[repr(align(4096))]
struct HeapPage {
    bytes: UnsafeCell<[u8; PAGE_SIZE]>,
}

// The page is shared raw memory by design; synchronization is the ring
// protocol's barrier contract, not Rust aliasing.
unsafe impl Send for HeapPage {}
unsafe impl Sync for HeapPage {}

struct HeapMapping {
    page: Arc<HeapPage>,
}

impl GrantedPage for HeapMapping {
    fn as_ptr(&self) -> *mut u8 {
        self.page.bytes.get() as *mut u8
    }
}

/// In-memory grant table: grefs name heap-backed pages. Mapping clones an
/// `Arc`, so "unmap on drop" is literal. Every `map` call is recorded so
/// tests can assert on the permissions the backend asked for.
pub struct HeapGrants {
    pages: Mutex<HashMap<u32, Arc<HeapPage>>>,
    map_log: Mutex<Vec<(u32, GrantPermission)>>,
}

impl HeapGrants {
    pub fn new() -> Self {
        Self {
            pages: Mutex::new(HashMap::new()),
            map_log: Mutex::new(Vec::new()),
        }
    }

    /// Create (or reset) the page behind `gref`, zero-filled.
    pub fn share(&self, gref: u32) {
        self.pages.lock().unwrap().insert(
            gref,
            Arc::new(HeapPage { bytes: UnsafeCell::new([0u8; PAGE_SIZE]) }),
        );
    }

    /// Permissions requested so far for `gref`, in order.
    pub fn permissions_used(&self, gref: u32) -> Vec<GrantPermission> {
        self.map_log
            .lock()
            .unwrap()
            .iter()
            .filter(|(g, _)| *g == gref)
            .map(|(_, p)| *p)
            .collect()
    }
}

impl Default for HeapGrants {
    fn default() -> Self {
        Self::new()
    }
}

impl GrantPages for HeapGrants {
    fn map(
        &self,
        _remote_domid: u16,
        gref: u32,
        permission: GrantPermission,
    ) -> Result<Box<dyn GrantedPage>> {
        let page = self
            .pages
            .lock()
            .unwrap()
            .get(&gref)
            .cloned()
            .ok_or_else(|| Error::grant(format!("gref {} is not shared", gref)))?;
        self.map_log.lock().unwrap().push((gref, permission));
        Ok(Box::new(HeapMapping { page }))
    }
}
