//! Archive ladder - per-run view of a node's retention tiers
//!
//! Archives are rebuilt from the wall clock on every run. Each one owns a
//! snapshot of its tier's slices, kept sorted by start time, newest first.

use crate::{RetentionPolicy, Slice, Timestamp};
use std::fmt;

/// Snapshot of one tier's slices, sorted descending by start time
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SliceSet {
    slices: Vec<Slice>,
}

impl SliceSet {
    pub fn new(mut slices: Vec<Slice>) -> Self {
        slices.sort_by(|a, b| b.start_time.cmp(&a.start_time));
        Self { slices }
    }

    pub fn len(&self) -> usize {
        self.slices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slices.is_empty()
    }

    /// Newest first
    pub fn iter(&self) -> impl Iterator<Item = &Slice> {
        self.slices.iter()
    }

    /// Add a slice, superseding any entry with the same start and step
    pub fn insert(&mut self, slice: Slice) {
        self.remove(&slice);
        self.slices.push(slice);
        self.slices.sort_by(|a, b| b.start_time.cmp(&a.start_time));
    }

    /// Swap a stale handle for its refreshed version
    pub fn replace(&mut self, old: &Slice, new: Slice) {
        self.remove(old);
        self.insert(new);
    }

    pub fn remove(&mut self, old: &Slice) {
        if let Some(pos) = self
            .slices
            .iter()
            .position(|s| s.start_time == old.start_time && s.step == old.step)
        {
            self.slices.remove(pos);
        }
    }

    /// Slices holding data from before `t`
    pub fn starting_before(&self, t: Timestamp) -> Vec<Slice> {
        self.slices.iter().filter(|s| s.start_time < t).copied().collect()
    }
}

/// One tier of the ladder for the current run
#[derive(Debug, Clone, PartialEq)]
pub struct Archive {
    pub precision: i64,
    pub retention: i64,
    /// First timestamp this tier is responsible for
    pub start_time: Timestamp,
    /// End of this tier's window, exclusive
    pub end_time: Timestamp,
    pub slices: SliceSet,
}

impl fmt::Display for Archive {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}s x {} [{}, {}) with {} slices",
            self.precision,
            self.retention,
            self.start_time,
            self.end_time,
            self.slices.len()
        )
    }
}

/// Partition the timeline before `now` into one window per tier
///
/// The finest tier ends at `now` rounded down to its precision; each
/// coarser tier ends where the previous one starts. Slices are bound to the
/// tier whose precision equals their step; slices of any other step are
/// left out.
pub fn build_archives(policy: &RetentionPolicy, now: Timestamp, slices: &[Slice]) -> Vec<Archive> {
    let finest = policy.finest().precision;
    let mut end = now - now.rem_euclid(finest);
    let mut archives = Vec::with_capacity(policy.len());

    for retention in policy.iter() {
        let start = end - retention.span();
        archives.push(Archive {
            precision: retention.precision,
            retention: retention.count,
            start_time: start,
            end_time: end,
            slices: SliceSet::new(
                slices
                    .iter()
                    .filter(|s| s.step == retention.precision)
                    .copied()
                    .collect(),
            ),
        });
        end = start;
    }
    archives
}
