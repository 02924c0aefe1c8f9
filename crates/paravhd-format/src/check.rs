//! On-disk region overlap self-check
//!
//! Sanity validation for sparse images: every named region (footer copy,
//! header, locator payloads, BAT, allocated blocks) must occupy a disjoint
//! byte range. The check only reports; it never mutates the image.

use paravhd_core::{Error, OverlapRegion, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Marker {
    Start,
    End,
}

/// Verify that all regions are pairwise disjoint.
///
/// Each region of length `L` contributes a `Start` marker at its first
/// byte and an `End` marker at its last byte. Scanning the markers in
/// position order, a second `Start` observed before the previous region's
/// `End` is a collision. On failure the error carries every region
/// involved in at least one collision.
pub fn verify_disjoint(regions: &[OverlapRegion]) -> Result<()> {
    let mut markers: Vec<(u64, Marker, usize)> = Vec::with_capacity(regions.len() * 2);
    for (i, region) in regions.iter().enumerate() {
        if region.length == 0 {
            continue;
        }
        markers.push((region.start, Marker::Start, i));
        markers.push((region.start + region.length - 1, Marker::End, i));
    }

    // A Start at position P collides with an End at the same P (both own
    // byte P), so Starts sort first at equal positions.
    markers.sort_by_key(|&(pos, marker, _)| (pos, matches!(marker, Marker::End)));

    let mut open: Vec<usize> = Vec::new();
    let mut colliding: Vec<usize> = Vec::new();
    for &(_, marker, idx) in &markers {
        match marker {
            Marker::Start => {
                if !open.is_empty() {
                    colliding.extend_from_slice(&open);
                    colliding.push(idx);
                }
                open.push(idx);
            }
            Marker::End => {
                open.retain(|&o| o != idx);
            }
        }
    }

    if colliding.is_empty() {
        Ok(())
    } else {
        colliding.sort_unstable();
        colliding.dedup();
        Err(Error::OverlapDetected(
            colliding.into_iter().map(|i| regions[i].clone()).collect(),
        ))
    }
}
