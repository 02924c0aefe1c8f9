//! Serving a VHD image through the block backend
//!
//! [`VhdDiskOps`] adapts a [`VhdImage`] to the [`BlockOps`] seam: ring
//! segments become sector loops against the image, under a single async
//! mutex because the engine is single-writer.

use crate::backend::BlockOps;
use crate::error::Result;
use async_trait::async_trait;
use paravhd_core::SECTOR_SIZE;
use paravhd_format::VhdImage;
use tokio::sync::Mutex;

/// [`BlockOps`] over a VHD image.
pub struct VhdDiskOps {
    image: Mutex<VhdImage>,
}

impl VhdDiskOps {
    pub fn new(image: VhdImage) -> Self {
        Self { image: Mutex::new(image) }
    }

    /// Reclaim the image, e.g. after shutting the backend down.
    pub fn into_inner(self) -> VhdImage {
        self.image.into_inner()
    }
}

#[async_trait]
impl BlockOps for VhdDiskOps {
    async fn read(
        &self,
        page: &mut [u8],
        sector: u64,
        first_sector: u8,
        last_sector: u8,
    ) -> Result<()> {
        let image = self.image.lock().await;
        for (i, page_sector) in (first_sector..=last_sector).enumerate() {
            let data = image.read_sector(sector + i as u64)?;
            let at = page_sector as usize * SECTOR_SIZE;
            page[at..at + SECTOR_SIZE].copy_from_slice(&data);
        }
        Ok(())
    }

    async fn write(
        &self,
        page: &[u8],
        sector: u64,
        first_sector: u8,
        last_sector: u8,
    ) -> Result<()> {
        let mut image = self.image.lock().await;
        for (i, page_sector) in (first_sector..=last_sector).enumerate() {
            let at = page_sector as usize * SECTOR_SIZE;
            image.write_sector(sector + i as u64, &page[at..at + SECTOR_SIZE])?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::BlockBackend;
    use crate::port::{GrantPages, GrantPermission, HeapGrants, LoopbackEvents, LoopbackPort, SignalPort};
    use crate::protocol::{AbiVariant, Operation, Request, Response, Segment, Status};
    use crate::ring::FrontRing;
    use paravhd_core::PAGE_SIZE;
    use paravhd_format::VhdOptions;
    use std::sync::Arc;
    use std::time::Duration;
    use tempfile::TempDir;
    use uuid::Uuid;

    const RING_GREF: u32 = 1;
    const DATA_GREF: u32 = 2;

    async fn wait_response(front: &mut FrontRing) -> Response {
        for _ in 0..500 {
            if let Some(response) = front.poll_response().unwrap() {
                return response;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("no response from backend");
    }

    #[tokio::test]
    async fn test_vhd_served_over_the_ring() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("served.vhd");
        let image = VhdImage::create_new_dynamic(
            &path,
            4 * 1024 * 1024,
            Uuid::new_v4(),
            &VhdOptions::default(),
        )
        .unwrap();

        let grants = Arc::new(HeapGrants::new());
        grants.share(RING_GREF);
        grants.share(DATA_GREF);
        let front_page = grants.map(0, RING_GREF, GrantPermission::ReadWrite).unwrap();
        let mut front = FrontRing::create(front_page, AbiVariant::X86_64);

        let (front_port, back_port) = LoopbackPort::pair();
        let backend = BlockBackend::init(
            0,
            RING_GREF,
            0,
            AbiVariant::X86_64,
            Arc::new(VhdDiskOps::new(image)),
            grants.clone(),
            Arc::new(LoopbackEvents::new(back_port)),
        )
        .unwrap();

        // Write one page's worth of sectors at device sector 8
        {
            let page = grants.map(0, DATA_GREF, GrantPermission::ReadWrite).unwrap();
            let slice = unsafe { std::slice::from_raw_parts_mut(page.as_ptr(), PAGE_SIZE) };
            for (i, chunk) in slice.chunks_mut(SECTOR_SIZE).enumerate() {
                chunk.fill(0x30 + i as u8);
            }
        }
        let notify = front
            .push_request(&Request {
                op: Operation::Write,
                handle: 0,
                id: 1,
                sector: 8,
                segments: vec![Segment { gref: DATA_GREF, first_sector: 0, last_sector: 7 }],
            })
            .unwrap();
        if notify {
            front_port.notify();
        }
        assert_eq!(wait_response(&mut front).await.status, Status::Ok);

        // Read it back through the ring into a cleared page
        {
            let page = grants.map(0, DATA_GREF, GrantPermission::ReadWrite).unwrap();
            let slice = unsafe { std::slice::from_raw_parts_mut(page.as_ptr(), PAGE_SIZE) };
            slice.fill(0);
        }
        let notify = front
            .push_request(&Request {
                op: Operation::Read,
                handle: 0,
                id: 2,
                sector: 8,
                segments: vec![Segment { gref: DATA_GREF, first_sector: 0, last_sector: 7 }],
            })
            .unwrap();
        if notify {
            front_port.notify();
        }
        assert_eq!(wait_response(&mut front).await.status, Status::Ok);
        {
            let page = grants.map(0, DATA_GREF, GrantPermission::Read).unwrap();
            let slice = unsafe { std::slice::from_raw_parts(page.as_ptr(), PAGE_SIZE) };
            for (i, chunk) in slice.chunks(SECTOR_SIZE).enumerate() {
                assert!(chunk.iter().all(|&b| b == 0x30 + i as u8));
            }
        }

        // Reads of untouched sectors stay zero
        let notify = front
            .push_request(&Request {
                op: Operation::Read,
                handle: 0,
                id: 3,
                sector: 1024,
                segments: vec![Segment { gref: DATA_GREF, first_sector: 0, last_sector: 7 }],
            })
            .unwrap();
        if notify {
            front_port.notify();
        }
        assert_eq!(wait_response(&mut front).await.status, Status::Ok);
        {
            let page = grants.map(0, DATA_GREF, GrantPermission::Read).unwrap();
            let slice = unsafe { std::slice::from_raw_parts(page.as_ptr(), PAGE_SIZE) };
            assert!(slice.iter().all(|&b| b == 0));
        }

        backend.shutdown().await;

        // The data reached the image file itself
        let reloaded = paravhd_format::VhdImage::load(&path).unwrap();
        assert_eq!(reloaded.read_sector(8).unwrap(), [0x30; SECTOR_SIZE]);
        assert_eq!(reloaded.read_sector(15).unwrap(), [0x37; SECTOR_SIZE]);
    }

    #[tokio::test]
    async fn test_out_of_range_request_reports_error() {
        let dir = TempDir::new().unwrap();
        let image = VhdImage::create_new_dynamic(
            &dir.path().join("small.vhd"),
            2 * 1024 * 1024,
            Uuid::new_v4(),
            &VhdOptions::default(),
        )
        .unwrap();

        let grants = Arc::new(HeapGrants::new());
        grants.share(RING_GREF);
        grants.share(DATA_GREF);
        let front_page = grants.map(0, RING_GREF, GrantPermission::ReadWrite).unwrap();
        let mut front = FrontRing::create(front_page, AbiVariant::X86_64);

        let (front_port, back_port) = LoopbackPort::pair();
        let backend = BlockBackend::init(
            0,
            RING_GREF,
            0,
            AbiVariant::X86_64,
            Arc::new(VhdDiskOps::new(image)),
            grants.clone(),
            Arc::new(LoopbackEvents::new(back_port)),
        )
        .unwrap();

        // 2 MiB image = 4096 sectors; sector 5000 is beyond the disk
        let notify = front
            .push_request(&Request {
                op: Operation::Read,
                handle: 0,
                id: 9,
                sector: 5000,
                segments: vec![Segment { gref: DATA_GREF, first_sector: 0, last_sector: 0 }],
            })
            .unwrap();
        if notify {
            front_port.notify();
        }
        assert_eq!(wait_response(&mut front).await.status, Status::Error);

        backend.shutdown().await;
    }
}
