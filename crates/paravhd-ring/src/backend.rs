//! The block backend service
//!
//! Consumes requests from a shared ring, dispatches per-segment I/O
//! against grant-mapped pages, publishes responses, and signals the peer
//! per the ring's notify decision. One service task per ring.

use crate::error::Result;
use crate::port::{EventChannels, GrantPages, GrantPermission, SignalPort};
use crate::protocol::{AbiVariant, Operation, Request, Response, Status};
use crate::ring::SharedRing;
use async_trait::async_trait;
use paravhd_core::PAGE_SIZE;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::{JoinHandle, JoinSet};

/// The disk operations the backend dispatches to.
///
/// `page` is the full 4 KiB grant mapping; the segment's
/// `first_sector..=last_sector` names the byte range inside it, and
/// `sector` is the device sector corresponding to `first_sector`.
#[async_trait]
pub trait BlockOps: Send + Sync + 'static {
    async fn read(&self, page: &mut [u8], sector: u64, first_sector: u8, last_sector: u8)
        -> Result<()>;

    async fn write(&self, page: &[u8], sector: u64, first_sector: u8, last_sector: u8)
        -> Result<()>;
}

/// Tunables for the service loop.
#[derive(Debug, Clone)]
pub struct BackendOptions {
    /// How often the loop self-wakes to recover from a missed signal
    /// edge. Defensive; correctness does not depend on it.
    pub poker_interval: Duration,
}

impl Default for BackendOptions {
    fn default() -> Self {
        Self { poker_interval: Duration::from_secs(5) }
    }
}

/// Handle to a running backend. Dropping it aborts the service task;
/// [`BlockBackend::shutdown`] stops it cleanly. Either way the ring
/// mapping and the signal port release with the task.
pub struct BlockBackend {
    shutdown: Arc<Notify>,
    task: Option<JoinHandle<()>>,
}

impl BlockBackend {
    /// Bind the event channel, map the ring page, and spawn the service
    /// task.
    pub fn init(
        remote_domid: u16,
        ring_ref: u32,
        evtchn_port: u32,
        abi: AbiVariant,
        ops: Arc<dyn BlockOps>,
        grants: Arc<dyn GrantPages>,
        events: Arc<dyn EventChannels>,
    ) -> Result<Self> {
        Self::init_with_options(
            remote_domid,
            ring_ref,
            evtchn_port,
            abi,
            ops,
            grants,
            events,
            BackendOptions::default(),
        )
    }

    #[allow(clippy::too_many_arguments)]
    pub fn init_with_options(
        remote_domid: u16,
        ring_ref: u32,
        evtchn_port: u32,
        abi: AbiVariant,
        ops: Arc<dyn BlockOps>,
        grants: Arc<dyn GrantPages>,
        events: Arc<dyn EventChannels>,
        options: BackendOptions,
    ) -> Result<Self> {
        let port = events.bind_interdomain(remote_domid, evtchn_port)?;
        let ring_page = grants.map(remote_domid, ring_ref, GrantPermission::ReadWrite)?;
        let ring = SharedRing::attach(ring_page, abi);

        let shutdown = Arc::new(Notify::new());
        let task = tokio::spawn(service_loop(
            ring,
            port,
            ops,
            grants,
            remote_domid,
            options,
            shutdown.clone(),
        ));
        Ok(Self { shutdown, task: Some(task) })
    }

    /// Stop the service task and wait for it to tear down.
    pub async fn shutdown(mut self) {
        self.shutdown.notify_one();
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

impl Drop for BlockBackend {
    fn drop(&mut self) {
        if let Some(task) = &self.task {
            task.abort();
        }
    }
}

async fn service_loop(
    mut ring: SharedRing,
    port: Arc<dyn SignalPort>,
    ops: Arc<dyn BlockOps>,
    grants: Arc<dyn GrantPages>,
    remote_domid: u16,
    options: BackendOptions,
    shutdown: Arc<Notify>,
) {
    let abi = ring.abi();
    let mut poker = tokio::time::interval(options.poker_interval);
    poker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    tracing::debug!(domid = remote_domid, ?abi, slots = ring.slots(), "block backend running");

    loop {
        tokio::select! {
            _ = shutdown.notified() => {
                tracing::debug!(domid = remote_domid, "block backend shutting down");
                return;
            }
            _ = port.wait() => {}
            _ = poker.tick() => {}
        }

        // Drain until the final check arms req_event with the ring empty,
        // so a request published while we worked is picked up here rather
        // than lost until the next signal.
        loop {
            while let Some(raw) = ring.fetch_request() {
                let response = handle_request(&raw, abi, &ops, &grants, remote_domid).await;
                let (_more, notify) = ring.push_response(&response);
                if notify {
                    port.notify();
                }
            }
            if !ring.final_check_for_requests() {
                break;
            }
        }
    }
}

/// Decode one slot and run it. Failures degrade to a response status;
/// the ring always continues.
async fn handle_request(
    raw: &[u8],
    abi: AbiVariant,
    ops: &Arc<dyn BlockOps>,
    grants: &Arc<dyn GrantPages>,
    remote_domid: u16,
) -> Response {
    let request = match Request::parse(raw, abi) {
        Ok(request) => request,
        Err(err) => {
            tracing::warn!(%err, "rejecting malformed request slot");
            return Response {
                id: Request::peek_id(raw, abi),
                op: Operation::from_u8(raw.first().copied().unwrap_or(0)),
                status: Status::NotSupported,
            };
        }
    };

    let is_read = match request.op {
        Operation::Read => true,
        Operation::Write => false,
        other => {
            tracing::debug!(op = other.to_u8(), id = request.id, "operation not supported");
            return Response { id: request.id, op: other, status: Status::NotSupported };
        }
    };

    // A read ends with the backend writing data into the guest's page, so
    // it maps read-write; a write only inspects the page.
    let permission = if is_read { GrantPermission::ReadWrite } else { GrantPermission::Read };

    let mut io = JoinSet::new();
    let mut device_sector = request.sector;
    for segment in &request.segments {
        let sector = device_sector;
        device_sector += segment.sectors();

        let page = match grants.map(remote_domid, segment.gref, permission) {
            Ok(page) => page,
            Err(err) => {
                tracing::warn!(%err, gref = segment.gref, id = request.id, "grant map failed");
                io.abort_all();
                return Response { id: request.id, op: request.op, status: Status::Error };
            }
        };

        let ops = Arc::clone(ops);
        let segment = *segment;
        io.spawn(async move {
            // SAFETY: the guard keeps the mapping alive for the whole
            // task, and each segment owns its own page.
            let slice = unsafe { std::slice::from_raw_parts_mut(page.as_ptr(), PAGE_SIZE) };
            let outcome = if is_read {
                ops.read(slice, sector, segment.first_sector, segment.last_sector).await
            } else {
                ops.write(slice, sector, segment.first_sector, segment.last_sector).await
            };
            drop(page);
            outcome
        });
    }

    let mut status = Status::Ok;
    while let Some(joined) = io.join_next().await {
        match joined {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                tracing::warn!(%err, id = request.id, "segment I/O failed");
                status = Status::Error;
            }
            Err(err) => {
                tracing::warn!(%err, id = request.id, "segment task did not complete");
                status = Status::Error;
            }
        }
    }

    Response { id: request.id, op: request.op, status }
}
