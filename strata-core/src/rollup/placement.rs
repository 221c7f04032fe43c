//! Slice placement for aggregated points
//!
//! Appending to an existing slice that starts at or before the batch is one
//! write. Prepending or splicing into the middle of a later slice is never
//! attempted; a new slice is created instead.

use crate::archive::Archive;
use crate::storage::SliceStore;
use crate::{Point, Slice, StrataError, Timestamp};
use tracing::{debug, warn};

/// What happened to one batch
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Placement {
    /// Points stored
    pub written: usize,
    /// Writes issued, including writes to fresh slices
    pub writes: usize,
    /// Slices created for this batch
    pub created: Vec<Slice>,
    /// First timestamp of every segment that could not be stored
    pub unplaced: Vec<Timestamp>,
}

impl Placement {
    pub fn earliest_created(&self) -> Option<Timestamp> {
        self.created.iter().map(|s| s.start_time).min()
    }

    pub fn earliest_unplaced(&self) -> Option<Timestamp> {
        self.unplaced.iter().copied().min()
    }
}

/// Split ascending points wherever more than `max_gap` steps are missing
pub fn split_segments(points: &[Point], step: i64, max_gap: u64) -> Vec<&[Point]> {
    let mut segments = Vec::new();
    let mut begin = 0;
    for i in 1..points.len() {
        let missing = (points[i].timestamp - points[i - 1].timestamp) / step - 1;
        if missing > max_gap as i64 {
            segments.push(&points[begin..i]);
            begin = i;
        }
    }
    if begin < points.len() {
        segments.push(&points[begin..]);
    }
    segments
}

/// Store ascending `points` into `archive`, creating slices where needed
///
/// The archive's slice set is updated in place with refreshed and created
/// handles.
pub fn place_points<S: SliceStore + ?Sized>(
    store: &S,
    node: &str,
    archive: &mut Archive,
    points: &[Point],
    max_gap: u64,
) -> Placement {
    let mut placement = Placement::default();
    for segment in split_segments(points, archive.precision, max_gap) {
        place_segment(store, node, archive, segment, &mut placement);
    }
    placement
}

fn place_segment<S: SliceStore + ?Sized>(
    store: &S,
    node: &str,
    archive: &mut Archive,
    segment: &[Point],
    placement: &mut Placement,
) {
    let first = segment[0].timestamp;

    let candidates: Vec<Slice> = archive
        .slices
        .iter()
        .filter(|s| s.start_time <= first)
        .copied()
        .collect();

    for slice in candidates {
        match store.write(node, &slice, segment) {
            Ok(refreshed) => {
                debug!("Wrote {} points to slice {}", segment.len(), refreshed);
                archive.slices.replace(&slice, refreshed);
                placement.written += segment.len();
                placement.writes += 1;
                return;
            }
            Err(StrataError::SliceGapTooLarge { gap, .. }) => {
                debug!("Slice {} rejected batch at {}: gap of {} points", slice, first, gap);
            }
            Err(StrataError::SliceDeleted) => {
                debug!("Slice {} vanished, dropping it from the set", slice);
                archive.slices.remove(&slice);
            }
            Err(e) => {
                warn!("Write to slice {} of {} failed: {}", slice, node, e);
            }
        }
    }

    debug!(
        "No slice found, creating new one: start_time={}, precision={}",
        first, archive.precision
    );
    let fresh = match store.create(node, first, archive.precision) {
        Ok(slice) => slice,
        Err(e) => {
            warn!(
                "Failed to create slice {}@{} for {}: {}",
                first, archive.precision, node, e
            );
            placement.unplaced.push(first);
            return;
        }
    };
    match store.write(node, &fresh, segment) {
        Ok(slice) => {
            archive.slices.insert(slice);
            placement.created.push(slice);
            placement.written += segment.len();
            placement.writes += 1;
        }
        Err(e) => {
            warn!("Write to new slice {} of {} failed: {}", fresh, node, e);
            discard_empty(store, node, archive, fresh);
            placement.unplaced.push(first);
        }
    }
}

/// Remove a slice left empty by a failed first write
///
/// A non-empty handle means create found a slice already there; that one
/// stays and joins the set.
fn discard_empty<S: SliceStore + ?Sized>(store: &S, node: &str, archive: &mut Archive, slice: Slice) {
    if !slice.is_empty() {
        archive.slices.insert(slice);
        return;
    }
    match store.delete_before(node, &slice, slice.start_time + slice.step) {
        Ok(_) | Err(StrataError::SliceDeleted) => {}
        Err(e) => warn!("Failed to remove empty slice {} of {}: {}", slice, node, e),
    }
}
