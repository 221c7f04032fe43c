//! Slice merge - defragments each tier of a node
//!
//! Slices of one precision are swept left to right, earliest and longest
//! first. Each neighbour close enough to the current merge target has its
//! known values copied into the target and is then trimmed. Absent values
//! never overwrite data already in the target.

use crate::config::MaintenanceConfig;
use crate::storage::SliceStore;
use crate::{Point, Result, Slice, StrataError, Timestamp};
use serde::Serialize;
use std::collections::BTreeMap;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Counters for one node's merge
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MergeStats {
    /// Neighbours folded into a merge target
    pub merged: usize,
    /// Neighbours left alone because the gap was too wide
    pub skipped_gap: usize,
    pub points_written: usize,
    pub slices_removed: usize,
}

/// Outcome of merging one node
#[derive(Debug, Clone, Serialize)]
pub struct MergeReport {
    pub node: String,
    pub stats: MergeStats,
    #[serde(skip)]
    pub elapsed: Duration,
}

/// Defragmenter bound to a store and a run configuration
pub struct Defragmenter<'a, S: SliceStore + ?Sized> {
    store: &'a S,
    config: &'a MaintenanceConfig,
}

impl<'a, S: SliceStore + ?Sized> Defragmenter<'a, S> {
    pub fn new(store: &'a S, config: &'a MaintenanceConfig) -> Self {
        Self { store, config }
    }

    /// Merge every tier of `node`
    pub fn merge_node(&self, node: &str) -> Result<MergeReport> {
        let started = Instant::now();
        // only to make sure this is a well-formed node
        self.store.read_metadata(node)?;
        let mut slices = self.store.list_slices(node)?;

        if self.config.skip_active_slice {
            // the ingest path is still appending to the latest slice
            if let Some(pos) = slices
                .iter()
                .enumerate()
                .max_by_key(|(_, s)| s.end_time)
                .map(|(i, _)| i)
            {
                slices.remove(pos);
            }
        }

        let mut tiers: BTreeMap<i64, Vec<Slice>> = BTreeMap::new();
        for slice in slices {
            tiers.entry(slice.step).or_default().push(slice);
        }

        let mut stats = MergeStats::default();
        for (precision, slices) in tiers {
            self.merge_tier(node, precision, slices, &mut stats);
        }

        let report = MergeReport {
            node: node.to_string(),
            stats,
            elapsed: started.elapsed(),
        };
        match serde_json::to_string(&report.stats) {
            Ok(json) => info!("{} merge stat: {}", node, json),
            Err(e) => warn!("{} merge stat could not be encoded: {}", node, e),
        }
        Ok(report)
    }

    /// Greedy sweep over one tier
    pub fn merge_tier(&self, node: &str, precision: i64, mut slices: Vec<Slice>, stats: &mut MergeStats) {
        slices.sort_by_key(|s| (s.start_time, -s.end_time));
        let mut iter = slices.into_iter();
        let Some(mut target) = iter.next() else {
            return;
        };

        for next in iter {
            if !within_gap(&target, &next, precision, self.config) {
                debug!("{}: gap between {} and {} too large, not merging", node, target, next);
                stats.skipped_gap += 1;
                target = next;
                continue;
            }
            match self.fold(node, target, &next, stats) {
                Ok(refreshed) => target = refreshed,
                Err(StrataError::SliceDeleted) => {
                    debug!("{}: slice vanished while merging {} into {}", node, next, target);
                }
                Err(e) => warn!("{}: failed to merge {} into {}: {}", node, next, target, e),
            }
        }
    }

    /// Copy `next`'s known values into `target` and trim what was consumed
    fn fold(&self, node: &str, mut target: Slice, next: &Slice, stats: &mut MergeStats) -> Result<Slice> {
        let target_end = target.end_time;
        let mut consumed_until = next.end_time;

        // overlap: fill target from next, never with absent values
        if next.start_time < target_end {
            let until = next.end_time.min(target_end);
            match self.store.read(node, next, next.start_time, until) {
                Ok(points) => {
                    debug!(
                        "update {} ({} not none): {} -> {}",
                        points.len(),
                        points.iter().filter(|p| p.is_known()).count(),
                        next,
                        target
                    );
                    let (refreshed, _) = self.write_known(node, target, &points, stats)?;
                    target = refreshed;
                }
                Err(StrataError::NoData) => {}
                Err(e) => return Err(e),
            }
        }

        // tail: a true append
        let tail_start = next.start_time.max(target_end);
        if tail_start < next.end_time {
            match self.store.read(node, next, tail_start, next.end_time) {
                Ok(points) => {
                    debug!(
                        "append {} ({} not none): {} -> {}",
                        points.len(),
                        points.iter().filter(|p| p.is_known()).count(),
                        next,
                        target
                    );
                    let (refreshed, cut) = self.write_known(node, target, &points, stats)?;
                    target = refreshed;
                    if let Some(cut) = cut {
                        consumed_until = cut;
                    }
                }
                Err(StrataError::NoData) => {}
                Err(e) => return Err(e),
            }
        }

        match self.store.delete_before(node, next, consumed_until) {
            Ok(None) => stats.slices_removed += 1,
            Ok(Some(rest)) => debug!("{}: kept {} after merge", node, rest),
            Err(StrataError::SliceDeleted) => {}
            Err(e) => return Err(e),
        }
        stats.merged += 1;
        Ok(target)
    }

    /// Write runs of known points; stops at the first run the target rejects
    /// for its gap and reports where that run starts
    fn write_known(
        &self,
        node: &str,
        mut target: Slice,
        points: &[Point],
        stats: &mut MergeStats,
    ) -> Result<(Slice, Option<Timestamp>)> {
        for run in points.split(|p| !p.is_known()).filter(|run| !run.is_empty()) {
            match self.store.write(node, &target, run) {
                Ok(refreshed) => {
                    target = refreshed;
                    stats.points_written += run.len();
                }
                Err(StrataError::SliceGapTooLarge { .. }) => return Ok((target, Some(run[0].timestamp))),
                Err(e) => return Err(e),
            }
        }
        Ok((target, None))
    }
}

/// Whether `next` sits close enough after `target` to be worth merging
fn within_gap(target: &Slice, next: &Slice, precision: i64, config: &MaintenanceConfig) -> bool {
    let gap = (next.start_time - target.end_time) as i128;
    gap * config.point_size as i128 <= config.max_slice_gap as i128 * precision as i128
}
