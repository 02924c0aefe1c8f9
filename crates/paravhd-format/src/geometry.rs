//! CHS geometry computation
//!
//! The footer carries a legacy cylinders/heads/sectors triple derived from
//! the virtual size. The computation is pinned: widen sectors-per-track
//! through 17, 31, 63 (then 255 for large disks) with heads clamped into
//! 4..=16, until the cylinder count fits in 16 bits. Disks at or beyond
//! the addressing ceiling get the fixed ceiling triple.

use crate::types::DiskGeometry;

/// CHS addressing ceiling in sectors: 65535 cylinders x 255 heads x 16
/// sectors-per-track.
pub const MAX_CHS_SECTORS: u64 = 65535 * 255 * 16;

/// Compute the footer geometry for a disk of `total_sectors` sectors.
pub fn chs_for_sectors(total_sectors: u64) -> DiskGeometry {
    if total_sectors >= MAX_CHS_SECTORS {
        return DiskGeometry { cylinders: 65535, heads: 255, sectors: 16 };
    }

    let (sectors_per_track, heads, cylinders_times_heads) =
        if total_sectors > 65535 * 16 * 63 {
            (255u64, 16u64, total_sectors / 255)
        } else {
            let mut sectors_per_track = 17u64;
            let mut cylinders_times_heads = total_sectors / sectors_per_track;
            let mut heads = (cylinders_times_heads + 1023) / 1024;
            if heads < 4 {
                heads = 4;
            }
            if cylinders_times_heads >= heads * 1024 || heads > 16 {
                sectors_per_track = 31;
                heads = 16;
                cylinders_times_heads = total_sectors / sectors_per_track;
            }
            if cylinders_times_heads >= heads * 1024 {
                sectors_per_track = 63;
                heads = 16;
                cylinders_times_heads = total_sectors / sectors_per_track;
            }
            (sectors_per_track, heads, cylinders_times_heads)
        };

    DiskGeometry {
        cylinders: (cylinders_times_heads / heads) as u16,
        heads: heads as u8,
        sectors: sectors_per_track as u8,
    }
}
