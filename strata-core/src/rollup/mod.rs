//! Rollup engine - cascades aged-out data down the retention ladder
//!
//! For every adjacent (fine, coarse) pair of archives:
//!
//! 1. **Scan**: read fine points older than the fine window
//! 2. **Aggregate**: bucket them at the coarse precision, honoring xFilesFactor
//! 3. **Place**: store the buckets in coarse slices
//! 4. **Expire**: drop the consumed fine points
//!
//! The coarsest archive only expires. Coarse slices written during a run are
//! part of the coarse archive's snapshot, so anything placed below the
//! coarse window is cascaded further in the same run.

pub mod aggregate;
pub mod placement;

pub use aggregate::{aggregate_points, bucket_start, Aggregated, BucketAccumulator};
pub use placement::{place_points, split_segments, Placement};

use crate::archive::{build_archives, Archive};
use crate::config::MaintenanceConfig;
use crate::storage::SliceStore;
use crate::{NodeMetadata, Point, Result, Slice, StrataError, Timestamp};
use serde::Serialize;
use std::collections::BTreeMap;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Counters for one precision tier
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TierStats {
    /// Buckets considered for aggregation
    pub aggregate: usize,
    pub slice_read: usize,
    pub slice_read_points: usize,
    pub slice_write: usize,
    pub slice_write_points: usize,
    pub slice_create: usize,
    pub slice_delete: usize,
    pub slice_delete_points: i64,
    pub time_secs: f64,
}

/// Outcome of rolling up one node
#[derive(Debug, Clone, Serialize)]
pub struct RollupReport {
    pub node: String,
    /// Keyed by precision
    pub tiers: BTreeMap<i64, TierStats>,
    #[serde(skip)]
    pub elapsed: Duration,
}

impl RollupReport {
    pub fn slices_created(&self) -> usize {
        self.tiers.values().map(|t| t.slice_create).sum()
    }

    pub fn points_written(&self) -> usize {
        self.tiers.values().map(|t| t.slice_write_points).sum()
    }
}

/// Rollup engine bound to a store and a run configuration
pub struct RollupEngine<'a, S: SliceStore + ?Sized> {
    store: &'a S,
    config: &'a MaintenanceConfig,
}

impl<'a, S: SliceStore + ?Sized> RollupEngine<'a, S> {
    pub fn new(store: &'a S, config: &'a MaintenanceConfig) -> Self {
        Self { store, config }
    }

    /// Roll up one node as of `as_of`
    ///
    /// Fails only when the node's metadata or slice listing cannot be read;
    /// per-slice failures are logged and skipped.
    pub fn rollup_node(&self, node: &str, as_of: Timestamp) -> Result<RollupReport> {
        let started = Instant::now();
        let metadata = self.store.read_metadata(node)?;
        let slices = self.store.list_slices(node)?;
        let mut archives = build_archives(&metadata.retentions, as_of, &slices);

        debug!("=========={}==========", node);
        for archive in &archives {
            debug!("{} archive: {}", node, archive);
        }

        let mut report = RollupReport {
            node: node.to_string(),
            tiers: archives
                .iter()
                .map(|a| (a.precision, TierStats::default()))
                .collect(),
            elapsed: Duration::ZERO,
        };

        // nothing before the coarsest window is retained anywhere
        let lower_bound = archives.last().map(|a| a.start_time).unwrap_or(as_of);

        for i in 0..archives.len() {
            let tier_started = Instant::now();
            let (head, tail) = archives.split_at_mut(i + 1);
            let fine = &mut head[i];
            let coarse = tail.first_mut();
            let precision = fine.precision;

            match coarse {
                Some(coarse) => self.rollup_tier(node, &metadata, lower_bound, fine, coarse, &mut report),
                None => {
                    let overflow = fine.slices.starting_before(fine.start_time);
                    let cutoff = fine.start_time;
                    self.expire(node, fine, &overflow, cutoff, &mut report);
                }
            }
            if let Some(stats) = report.tiers.get_mut(&precision) {
                stats.time_secs += tier_started.elapsed().as_secs_f64();
            }
        }

        report.elapsed = started.elapsed();
        match serde_json::to_string(&report.tiers) {
            Ok(json) => info!("{} rollup stat: {}", node, json),
            Err(e) => warn!("{} rollup stat could not be encoded: {}", node, e),
        }
        info!("{} rollup time: {:.3} seconds", node, report.elapsed.as_secs_f64());
        Ok(report)
    }

    fn rollup_tier(
        &self,
        node: &str,
        metadata: &NodeMetadata,
        lower_bound: Timestamp,
        fine: &mut Archive,
        coarse: &mut Archive,
        report: &mut RollupReport,
    ) {
        let overflow = fine.slices.starting_before(fine.start_time);
        if overflow.is_empty() {
            return;
        }
        debug!("________Rolling up {}________", fine.precision);

        let (points, readable) = self.scan(node, fine, &overflow, lower_bound, report);

        let aggregated = aggregate_points(
            &points,
            coarse.start_time,
            coarse.precision,
            metadata.aggregation_method,
            metadata.x_files_factor,
        );
        if let Some(stats) = report.tiers.get_mut(&fine.precision) {
            stats.aggregate += aggregated.buckets;
        }
        debug!(
            "{} aggregated {} points into {} of {} buckets",
            node,
            points.len(),
            aggregated.points.len(),
            aggregated.buckets
        );

        let mut delete_prior_to = coarse.start_time + coarse.precision * coarse.retention;
        if !aggregated.points.is_empty() {
            let placement = place_points(
                self.store,
                node,
                coarse,
                &aggregated.points,
                self.config.max_slice_gap,
            );
            if let Some(stats) = report.tiers.get_mut(&coarse.precision) {
                stats.slice_write += placement.writes;
                stats.slice_write_points += placement.written;
                stats.slice_create += placement.created.len();
            }
            delete_prior_to = expiry_cutoff(delete_prior_to, &placement);
        }

        self.expire(node, fine, &readable, delete_prior_to, report);
    }

    /// Read overflowed points, ascending; returns them with the slices that
    /// were read without error
    fn scan(
        &self,
        node: &str,
        fine: &mut Archive,
        overflow: &[Slice],
        lower_bound: Timestamp,
        report: &mut RollupReport,
    ) -> (Vec<Point>, Vec<Slice>) {
        let mut points = Vec::new();
        let mut readable = Vec::with_capacity(overflow.len());
        let stats = report.tiers.entry(fine.precision).or_default();

        for slice in overflow {
            let from = lower_bound.max(slice.start_time);
            if from >= fine.start_time || slice.end_time <= lower_bound {
                // nothing retained to read, expire only
                readable.push(*slice);
                continue;
            }
            debug!(
                "Reading points from slice={}, start={}, end={}",
                slice, from, fine.start_time
            );
            match self.store.read(node, slice, from, fine.start_time) {
                Ok(read) => {
                    stats.slice_read += 1;
                    stats.slice_read_points += read.len();
                    points.extend(read);
                    readable.push(*slice);
                }
                Err(StrataError::NoData) => readable.push(*slice),
                Err(StrataError::SliceDeleted) => fine.slices.remove(slice),
                Err(e) => warn!("{} failed to read slice {}: {}", node, slice, e),
            }
        }

        points.sort_by_key(|p| p.timestamp);
        (points, readable)
    }

    fn expire(&self, node: &str, archive: &mut Archive, slices: &[Slice], cutoff: Timestamp, report: &mut RollupReport) {
        let stats = report.tiers.entry(archive.precision).or_default();
        for slice in slices {
            if slice.start_time >= cutoff {
                continue;
            }
            let dropped = (cutoff.min(slice.end_time) - slice.start_time).max(0) / slice.step;
            match self.store.delete_before(node, slice, cutoff) {
                Ok(Some(rest)) => {
                    debug!("Expired {} points of {} before {}", dropped, slice, cutoff);
                    archive.slices.replace(slice, rest);
                }
                Ok(None) | Err(StrataError::SliceDeleted) => {
                    debug!("Slice {} fully expired", slice);
                    archive.slices.remove(slice);
                }
                Err(e) => {
                    warn!("{} failed to expire slice {}: {}", node, slice, e);
                    continue;
                }
            }
            stats.slice_delete += 1;
            stats.slice_delete_points += dropped;
        }
    }
}

/// Fine data may only be dropped once a coarse copy exists
///
/// When part of a batch could not be placed, nothing from the earliest
/// unplaced segment on is dropped, and nothing from the earliest slice
/// created for the same batch on either.
pub fn expiry_cutoff(window_end: Timestamp, placement: &Placement) -> Timestamp {
    match placement.earliest_unplaced() {
        Some(unplaced) => {
            let created = placement.earliest_created().unwrap_or(Timestamp::MAX);
            window_end.min(unplaced).min(created)
        }
        None => window_end,
    }
}
