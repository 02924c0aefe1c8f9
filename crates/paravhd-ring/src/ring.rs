//! The shared request/response ring
//!
//! One 4 KiB page carries four free-running 32-bit indices, 64 bytes of
//! padding, and a power-of-two array of slots shared by requests and
//! responses. The producer and consumer live in different isolation
//! domains; the only synchronization is the barrier contract implemented
//! here:
//!
//! - slot contents are published with a write barrier *before* the
//!   producer index store, so the peer never reads an unpopulated slot;
//! - a full barrier separates every `*_event` update from the index
//!   re-read that follows it;
//! - index loads that gate slot reads are acquires.
//!
//! Indices wrap modulo 2^32 and the slot for index `i` is `i mod N`;
//! comparisons use wrapping arithmetic throughout.

use crate::error::Result;
use crate::port::GrantedPage;
use crate::protocol::{AbiVariant, Request, Response};
use paravhd_core::PAGE_SIZE;
use std::sync::atomic::{fence, AtomicU32, Ordering};

/// Header bytes before the first slot: four u32 indices plus padding.
pub const RING_HEADER_SIZE: usize = 80;

const REQ_PROD: usize = 0;
const REQ_EVENT: usize = 4;
const RSP_PROD: usize = 8;
const RSP_EVENT: usize = 12;

/// The event-threshold notify decision.
///
/// After advancing a producer index from `old` to `new`, the peer asked
/// to be woken once the index passes `event`; it needs a signal exactly
/// when `event` lies in the freshly published range `(old, new]`, which
/// in wrapping u32 arithmetic is:
///
/// ```text
/// (new - event) < (new - old)
/// ```
///
/// With `event = 10`: advancing 5 -> 12 notifies (2 < 7); advancing
/// 11 -> 12 does not (2 < 1 fails).
pub fn need_notify(new: u32, old: u32, event: u32) -> bool {
    new.wrapping_sub(event) < new.wrapping_sub(old)
}

/// Shared-page plumbing common to both ring views.
struct RingView {
    page: Box<dyn GrantedPage>,
    abi: AbiVariant,
    slot_size: usize,
    num_slots: u32,
}

impl RingView {
    fn new(page: Box<dyn GrantedPage>, abi: AbiVariant) -> Self {
        let abi = abi.resolve();
        let slot_size = abi.request_slot_size();
        let avail = (PAGE_SIZE - RING_HEADER_SIZE) / slot_size;
        let num_slots = 1u32 << (avail as u32).ilog2();
        Self { page, abi, slot_size, num_slots }
    }

    fn index(&self, offset: usize) -> &AtomicU32 {
        debug_assert!(offset + 4 <= 16);
        // SAFETY: the header offsets are inside the page and 4-byte
        // aligned; both domains only touch them through atomics.
        unsafe { &*(self.page.as_ptr().add(offset) as *const AtomicU32) }
    }

    fn slot_ptr(&self, idx: u32) -> *mut u8 {
        let slot = (idx & (self.num_slots - 1)) as usize;
        // SAFETY: slot < num_slots, so the range stays inside the page.
        unsafe { self.page.as_ptr().add(RING_HEADER_SIZE + slot * self.slot_size) }
    }

    fn read_slot(&self, idx: u32, len: usize) -> Vec<u8> {
        let mut buf = vec![0u8; len];
        // SAFETY: len never exceeds slot_size and the publisher's barrier
        // ordered the slot bytes before the index we loaded.
        unsafe {
            std::ptr::copy_nonoverlapping(self.slot_ptr(idx), buf.as_mut_ptr(), len);
        }
        buf
    }

    fn write_slot(&self, idx: u32, bytes: &[u8]) {
        debug_assert!(bytes.len() <= self.slot_size);
        // SAFETY: bounded by slot_size; the index publishing this slot is
        // stored only after a write barrier.
        unsafe {
            std::ptr::copy_nonoverlapping(bytes.as_ptr(), self.slot_ptr(idx), bytes.len());
        }
    }
}

/// The backend (consumer) view of a ring: consumes requests, produces
/// responses.
pub struct SharedRing {
    view: RingView,
    req_cons: u32,
    rsp_prod_pvt: u32,
}

impl SharedRing {
    /// Attach to a ring page the frontend has already initialized.
    pub fn attach(page: Box<dyn GrantedPage>, abi: AbiVariant) -> Self {
        Self { view: RingView::new(page, abi), req_cons: 0, rsp_prod_pvt: 0 }
    }

    pub fn abi(&self) -> AbiVariant {
        self.view.abi
    }

    pub fn slots(&self) -> u32 {
        self.view.num_slots
    }

    /// Are there published requests we have not consumed?
    pub fn unconsumed_requests(&self) -> bool {
        let prod = self.view.index(REQ_PROD).load(Ordering::Acquire);
        prod != self.req_cons
    }

    /// Copy out the next request slot, if any, and advance the private
    /// consumer index.
    pub fn fetch_request(&mut self) -> Option<Vec<u8>> {
        let prod = self.view.index(REQ_PROD).load(Ordering::Acquire);
        if prod == self.req_cons {
            return None;
        }
        let bytes = self.view.read_slot(self.req_cons, self.view.slot_size);
        self.req_cons = self.req_cons.wrapping_add(1);
        Some(bytes)
    }

    /// Publish one response and report `(more_to_do, notify)`.
    ///
    /// The slot is written before a release-ordered `rsp_prod` store; a
    /// full fence then orders the store against the `rsp_event` read that
    /// drives the notify decision. Finally the request side is re-armed
    /// (`req_event = req_cons + 1`) and `req_prod` re-checked, so a
    /// request published while we worked is never missed.
    pub fn push_response(&mut self, response: &Response) -> (bool, bool) {
        let bytes = response.marshal();
        self.view.write_slot(self.rsp_prod_pvt, &bytes);
        let old = self.rsp_prod_pvt;
        self.rsp_prod_pvt = self.rsp_prod_pvt.wrapping_add(1);

        fence(Ordering::Release);
        self.view.index(RSP_PROD).store(self.rsp_prod_pvt, Ordering::Release);
        fence(Ordering::SeqCst);

        let event = self.view.index(RSP_EVENT).load(Ordering::Relaxed);
        let notify = need_notify(self.rsp_prod_pvt, old, event);

        let more = self.final_check_for_requests();
        (more, notify)
    }

    /// Check for unconsumed requests; when there are none, arm
    /// `req_event` so the frontend's next publish signals us, then check
    /// once more to close the race.
    pub fn final_check_for_requests(&mut self) -> bool {
        if self.unconsumed_requests() {
            return true;
        }
        self.view
            .index(REQ_EVENT)
            .store(self.req_cons.wrapping_add(1), Ordering::SeqCst);
        fence(Ordering::SeqCst);
        self.unconsumed_requests()
    }
}

/// The frontend (producer) view: produces requests, consumes responses.
///
/// The backend only needs this for its tests, but the producer-side
/// publish contract is part of the wire protocol, so it lives here.
pub struct FrontRing {
    view: RingView,
    req_prod_pvt: u32,
    rsp_cons: u32,
}

impl FrontRing {
    /// Initialize the shared header (the frontend owns ring setup) and
    /// return the producer view. Event thresholds start at 1 so the very
    /// first publish on either side notifies.
    pub fn create(page: Box<dyn GrantedPage>, abi: AbiVariant) -> Self {
        let view = RingView::new(page, abi);
        view.index(REQ_PROD).store(0, Ordering::Relaxed);
        view.index(RSP_PROD).store(0, Ordering::Relaxed);
        view.index(REQ_EVENT).store(1, Ordering::Relaxed);
        view.index(RSP_EVENT).store(1, Ordering::Relaxed);
        fence(Ordering::SeqCst);
        Self { view, req_prod_pvt: 0, rsp_cons: 0 }
    }

    pub fn slots(&self) -> u32 {
        self.view.num_slots
    }

    /// Publish one request; returns whether the backend needs a signal.
    pub fn push_request(&mut self, request: &Request) -> Result<bool> {
        let bytes = request.marshal(self.view.abi)?;
        self.push_raw(&bytes)
    }

    /// Publish pre-marshalled (possibly malformed) slot bytes.
    pub(crate) fn push_raw(&mut self, bytes: &[u8]) -> Result<bool> {
        if self.req_prod_pvt.wrapping_sub(self.rsp_cons) >= self.view.num_slots {
            return Err(crate::error::Error::protocol("ring is full"));
        }
        self.view.write_slot(self.req_prod_pvt, bytes);
        let old = self.req_prod_pvt;
        self.req_prod_pvt = self.req_prod_pvt.wrapping_add(1);

        fence(Ordering::Release);
        self.view.index(REQ_PROD).store(self.req_prod_pvt, Ordering::Release);
        fence(Ordering::SeqCst);

        let event = self.view.index(REQ_EVENT).load(Ordering::Relaxed);
        Ok(need_notify(self.req_prod_pvt, old, event))
    }

    /// Consume the next response if one is published; otherwise arm
    /// `rsp_event` for a wakeup and re-check before reporting empty.
    pub fn poll_response(&mut self) -> Result<Option<Response>> {
        let mut prod = self.view.index(RSP_PROD).load(Ordering::Acquire);
        if prod == self.rsp_cons {
            self.view
                .index(RSP_EVENT)
                .store(self.rsp_cons.wrapping_add(1), Ordering::SeqCst);
            fence(Ordering::SeqCst);
            prod = self.view.index(RSP_PROD).load(Ordering::Acquire);
            if prod == self.rsp_cons {
                return Ok(None);
            }
        }
        let bytes = self.view.read_slot(self.rsp_cons, Response::SIZE);
        self.rsp_cons = self.rsp_cons.wrapping_add(1);
        Response::parse(&bytes).map(Some)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::port::{GrantPages, GrantPermission, HeapGrants};
    use crate::protocol::{Operation, Segment, Status};

    const RING_GREF: u32 = 1;

    fn ring_pair(abi: AbiVariant) -> (FrontRing, SharedRing) {
        let grants = HeapGrants::new();
        grants.share(RING_GREF);
        let front_page = grants.map(0, RING_GREF, GrantPermission::ReadWrite).unwrap();
        let back_page = grants.map(0, RING_GREF, GrantPermission::ReadWrite).unwrap();
        (FrontRing::create(front_page, abi), SharedRing::attach(back_page, abi))
    }

    fn request(id: u64) -> Request {
        Request {
            op: Operation::Read,
            handle: 0,
            id,
            sector: id * 8,
            segments: vec![Segment { gref: 2, first_sector: 0, last_sector: 7 }],
        }
    }

    #[test]
    fn test_notify_decision_examples() {
        // The two calibration cases for event = 10
        assert!(need_notify(12, 5, 10));
        assert!(!need_notify(12, 11, 10));

        // event exactly at the new index still notifies
        assert!(need_notify(10, 9, 10));
        // event already passed before this publish does not
        assert!(!need_notify(12, 10, 9));
        // wrapping window: old just below u32::MAX, new wrapped past zero
        assert!(need_notify(1, u32::MAX - 1, 0));
        assert!(!need_notify(1, u32::MAX - 1, 2));
    }

    #[test]
    fn test_both_abis_have_32_slots() {
        let (front, back) = ring_pair(AbiVariant::X86_64);
        assert_eq!(front.slots(), 32);
        assert_eq!(back.slots(), 32);

        let (front, back) = ring_pair(AbiVariant::X86_32);
        assert_eq!(front.slots(), 32);
        assert_eq!(back.slots(), 32);
    }

    #[test]
    fn test_request_response_round_trip() {
        for abi in [AbiVariant::X86_32, AbiVariant::X86_64] {
            let (mut front, mut back) = ring_pair(abi);

            // Fresh ring: first publish must signal the backend
            let notify = front.push_request(&request(77)).unwrap();
            assert!(notify);

            assert!(back.unconsumed_requests());
            let raw = back.fetch_request().unwrap();
            let parsed = Request::parse(&raw, abi).unwrap();
            assert_eq!(parsed, request(77));
            assert!(back.fetch_request().is_none());

            let (more, notify) = back.push_response(&Response {
                id: 77,
                op: Operation::Read,
                status: Status::Ok,
            });
            assert!(!more);
            // The frontend armed rsp_event at create time, so the first
            // response notifies
            assert!(notify);

            let response = front.poll_response().unwrap().unwrap();
            assert_eq!(response.id, 77);
            assert_eq!(response.status, Status::Ok);
            assert!(front.poll_response().unwrap().is_none());
        }
    }

    #[test]
    fn test_more_to_do_seen_after_response() {
        let (mut front, mut back) = ring_pair(AbiVariant::X86_64);
        front.push_request(&request(1)).unwrap();
        front.push_request(&request(2)).unwrap();

        let _ = back.fetch_request().unwrap();
        let (more, _) = back.push_response(&Response {
            id: 1,
            op: Operation::Read,
            status: Status::Ok,
        });
        assert!(more);

        let _ = back.fetch_request().unwrap();
        let (more, _) = back.push_response(&Response {
            id: 2,
            op: Operation::Read,
            status: Status::Ok,
        });
        assert!(!more);
    }

    #[test]
    fn test_request_arriving_during_final_check_is_seen() {
        let (mut front, mut back) = ring_pair(AbiVariant::X86_64);
        assert!(!back.final_check_for_requests());

        // req_event is now req_cons + 1, so this publish reports notify
        let notify = front.push_request(&request(5)).unwrap();
        assert!(notify);
        assert!(back.final_check_for_requests());
    }

    #[test]
    fn test_ring_full() {
        let (mut front, _back) = ring_pair(AbiVariant::X86_64);
        for i in 0..32 {
            front.push_request(&request(i)).unwrap();
        }
        assert!(front.push_request(&request(99)).is_err());
    }

    #[test]
    fn test_every_id_answered_exactly_once() {
        let (mut front, mut back) = ring_pair(AbiVariant::X86_64);
        let mut answered = Vec::new();

        // Several rounds of partial fills and drains to move the indices
        // through a few laps of the 32-slot ring
        let mut next_id = 0u64;
        for round in 0..12 {
            let burst = 3 + (round % 7) as u64;
            for _ in 0..burst {
                front.push_request(&request(next_id)).unwrap();
                next_id += 1;
            }
            while let Some(raw) = back.fetch_request() {
                let req = Request::parse(&raw, AbiVariant::X86_64).unwrap();
                back.push_response(&Response {
                    id: req.id,
                    op: req.op,
                    status: Status::Ok,
                });
            }
            while let Some(rsp) = front.poll_response().unwrap() {
                answered.push(rsp.id);
            }
        }

        let mut sorted = answered.clone();
        sorted.sort_unstable();
        sorted.dedup();
        assert_eq!(sorted.len(), answered.len(), "a response id was duplicated");
        assert_eq!(answered.len() as u64, next_id, "a request went unanswered");
    }

    #[test]
    fn test_index_wraparound() {
        let (mut front, mut back) = ring_pair(AbiVariant::X86_64);

        // Teleport both sides to just below the wrap point. The slot for
        // index i is i mod 32, and 2^32 is a multiple of 32, so nothing
        // special happens at the boundary.
        let start = u32::MAX - 1;
        front.req_prod_pvt = start;
        front.rsp_cons = start;
        front.view.index(REQ_PROD).store(start, Ordering::SeqCst);
        front.view.index(RSP_PROD).store(start, Ordering::SeqCst);
        back.req_cons = start;
        back.rsp_prod_pvt = start;

        for i in 0..4u64 {
            front.push_request(&request(i)).unwrap();
        }
        for _ in 0..4 {
            let raw = back.fetch_request().unwrap();
            let req = Request::parse(&raw, AbiVariant::X86_64).unwrap();
            back.push_response(&Response { id: req.id, op: req.op, status: Status::Ok });
        }
        let mut ids = Vec::new();
        while let Some(rsp) = front.poll_response().unwrap() {
            ids.push(rsp.id);
        }
        assert_eq!(ids, vec![0, 1, 2, 3]);
        assert_eq!(front.req_prod_pvt, start.wrapping_add(4));
        assert_eq!(back.req_cons, start.wrapping_add(4));
    }
}
