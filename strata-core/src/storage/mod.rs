//! Slice storage - the interface the maintenance engines drive
//!
//! A node's data lives in slices: contiguous runs of fixed-step points.
//! The engines only ever touch slices through [`SliceStore`]; two
//! implementations are provided:
//!
//! - **FileStore**: one file per slice inside a node directory
//! - **MemoryStore**: in-process store used by tests

mod file;
mod memory;

pub use file::{FileStore, NODE_METADATA_FILE};
pub use memory::{Fault, MemoryStore, StoreOp};

use crate::{NodeMetadata, Point, Result, Slice, StrataError, Timestamp};

/// Storage operations consumed by rollup and merge
///
/// Slice handles are plain values; a handle whose start no longer matches
/// what is stored reports [`StrataError::SliceDeleted`].
pub trait SliceStore: Send + Sync {
    /// Read and validate a node's metadata
    fn read_metadata(&self, node: &str) -> Result<NodeMetadata>;

    /// List every slice of a node, all precisions
    fn list_slices(&self, node: &str) -> Result<Vec<Slice>>;

    /// Read points with timestamps in `[from, until)`
    ///
    /// Fails with [`StrataError::NoData`] when the range holds no points.
    fn read(&self, node: &str, slice: &Slice, from: Timestamp, until: Timestamp) -> Result<Vec<Point>>;

    /// Write points at their timestamps, padding small gaps with absent points
    ///
    /// Returns the refreshed handle. Fails with [`StrataError::SliceGapTooLarge`]
    /// without writing anything when any gap exceeds the configured bound.
    fn write(&self, node: &str, slice: &Slice, points: &[Point]) -> Result<Slice>;

    /// Drop every point before `t`; `None` when nothing is left
    ///
    /// When another slice of the same step already starts where the
    /// remainder would, the remainder is folded into it and the handle of
    /// that slice is returned.
    fn delete_before(&self, node: &str, slice: &Slice, t: Timestamp) -> Result<Option<Slice>>;

    /// Create an empty slice
    fn create(&self, node: &str, start: Timestamp, step: i64) -> Result<Slice>;
}

/// A contiguous run of values starting at a point offset
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Run {
    pub offset: usize,
    pub values: Vec<Option<f64>>,
}

/// Validated layout of a write against a slice of `len` points
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct WritePlan {
    pub runs: Vec<Run>,
    pub new_len: usize,
}

/// Split `points` into contiguous runs and check every gap against `max_gap`
pub(crate) fn plan_write(slice: &Slice, points: &[Point], max_gap: u64) -> Result<WritePlan> {
    let mut placed: Vec<(usize, Option<f64>)> = Vec::with_capacity(points.len());
    for point in points {
        let delta = point.timestamp - slice.start_time;
        if delta < 0 {
            return Err(StrataError::InvalidRequest(format!(
                "point at {} precedes slice {}",
                point.timestamp, slice
            )));
        }
        placed.push(((delta / slice.step) as usize, point.value));
    }
    // stable sort keeps the last write for a duplicated offset last
    placed.sort_by_key(|(offset, _)| *offset);

    let mut runs: Vec<Run> = Vec::new();
    for (offset, value) in placed {
        match runs.last_mut() {
            Some(run) if run.offset + run.values.len() - 1 == offset => {
                if let Some(last) = run.values.last_mut() {
                    *last = value;
                }
            }
            Some(run) if run.offset + run.values.len() == offset => run.values.push(value),
            _ => runs.push(Run {
                offset,
                values: vec![value],
            }),
        }
    }

    let mut projected = slice.len().max(0) as usize;
    for run in &runs {
        if run.offset > projected {
            let gap = (run.offset - projected) as u64;
            if gap > max_gap {
                return Err(StrataError::SliceGapTooLarge { gap, max: max_gap });
            }
        }
        projected = projected.max(run.offset + run.values.len());
    }

    Ok(WritePlan {
        runs,
        new_len: projected,
    })
}

/// Point index range `[first, last)` covering timestamps in `[from, until)`
pub(crate) fn read_bounds(slice: &Slice, from: Timestamp, until: Timestamp) -> Result<(usize, usize)> {
    let len = slice.len().max(0);
    let first = ceil_div(from.max(slice.start_time) - slice.start_time, slice.step);
    let last = ceil_div((until - slice.start_time).max(0), slice.step).min(len);
    if first >= last {
        return Err(StrataError::NoData);
    }
    Ok((first as usize, last as usize))
}

/// Number of leading points that fall before `t`
pub(crate) fn points_before(slice: &Slice, t: Timestamp) -> i64 {
    if t <= slice.start_time {
        return 0;
    }
    ceil_div(t - slice.start_time, slice.step)
}

/// Fold a trimmed remainder into the slice already stored at its new start
///
/// Known values of `existing` win; the remainder only fills absent points
/// and extends past the end.
pub(crate) fn fold_values(existing: &mut Vec<Option<f64>>, rest: &[Option<f64>]) {
    for (i, value) in rest.iter().enumerate() {
        match existing.get_mut(i) {
            Some(slot) if slot.is_none() => *slot = *value,
            Some(_) => {}
            None => existing.push(*value),
        }
    }
}

fn ceil_div(a: i64, b: i64) -> i64 {
    (a + b - 1).div_euclid(b)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plan_write_runs() {
        let slice = Slice::new(100, 130, 10);
        let points = vec![
            Point::new(130, 1.0),
            Point::new(140, 2.0),
            Point::new(170, 3.0),
        ];
        let plan = plan_write(&slice, &points, 80).unwrap();
        assert_eq!(plan.runs.len(), 2);
        assert_eq!(plan.runs[0].offset, 3);
        assert_eq!(plan.runs[0].values, vec![Some(1.0), Some(2.0)]);
        assert_eq!(plan.runs[1].offset, 7);
        assert_eq!(plan.new_len, 8);
    }

    #[test]
    fn test_plan_write_overwrite_keeps_length() {
        let slice = Slice::new(0, 100, 10);
        let plan = plan_write(&slice, &[Point::new(20, 5.0)], 0).unwrap();
        assert_eq!(plan.new_len, 10);
    }

    #[test]
    fn test_plan_write_duplicate_offset_last_wins() {
        let slice = Slice::new(0, 0, 10);
        let points = vec![Point::new(0, 1.0), Point::new(0, 2.0), Point::new(10, 3.0)];
        let plan = plan_write(&slice, &points, 0).unwrap();
        assert_eq!(plan.runs[0].values, vec![Some(2.0), Some(3.0)]);
    }

    #[test]
    fn test_plan_write_gap_rejected() {
        let slice = Slice::new(0, 10, 10);
        let err = plan_write(&slice, &[Point::new(60, 1.0)], 4).unwrap_err();
        assert!(matches!(err, StrataError::SliceGapTooLarge { gap: 5, max: 4 }));

        // second run too far from the first
        let points = vec![Point::new(10, 1.0), Point::new(200, 1.0)];
        assert!(plan_write(&slice, &points, 4).is_err());
    }

    #[test]
    fn test_plan_write_before_start() {
        let slice = Slice::new(100, 100, 10);
        let err = plan_write(&slice, &[Point::new(90, 1.0)], 80).unwrap_err();
        assert!(matches!(err, StrataError::InvalidRequest(_)));
    }

    #[test]
    fn test_read_bounds() {
        let slice = Slice::new(100, 200, 10);
        assert_eq!(read_bounds(&slice, 100, 200).unwrap(), (0, 10));
        assert_eq!(read_bounds(&slice, 0, 150).unwrap(), (0, 5));
        assert_eq!(read_bounds(&slice, 105, 1000).unwrap(), (1, 10));
        assert!(matches!(read_bounds(&slice, 200, 300), Err(StrataError::NoData)));
        assert!(matches!(read_bounds(&slice, 0, 100), Err(StrataError::NoData)));
    }

    #[test]
    fn test_points_before() {
        let slice = Slice::new(100, 200, 10);
        assert_eq!(points_before(&slice, 50), 0);
        assert_eq!(points_before(&slice, 100), 0);
        assert_eq!(points_before(&slice, 101), 1);
        assert_eq!(points_before(&slice, 150), 5);
    }

    #[test]
    fn test_fold_values() {
        let mut existing = vec![Some(7.0), None, Some(7.0)];
        fold_values(&mut existing, &[Some(1.0), Some(1.0), None, Some(1.0), None]);
        assert_eq!(existing, vec![Some(7.0), Some(1.0), Some(7.0), Some(1.0), None]);

        let mut shorter = vec![None, None, Some(2.0)];
        fold_values(&mut shorter, &[Some(1.0)]);
        assert_eq!(shorter, vec![Some(1.0), None, Some(2.0)]);
    }

    #[test]
    fn test_file_and_memory_stores_agree() {
        use crate::{AggregationMethod, NodeMetadata, Retention, RetentionPolicy};
        use rand::rngs::StdRng;
        use rand::{Rng, SeedableRng};

        let dir = tempfile::TempDir::new().unwrap();
        let file = FileStore::new(dir.path(), 8);
        let memory = MemoryStore::new(8);
        let metadata = NodeMetadata {
            retentions: RetentionPolicy::new(vec![Retention::new(10, 100)]).unwrap(),
            aggregation_method: AggregationMethod::Avg,
            x_files_factor: 0.5,
        };
        file.create_node("n", &metadata).unwrap();
        memory.add_node("n", &metadata).unwrap();

        let mut rng = StdRng::seed_from_u64(7);
        let mut on_file = file.create("n", 1_000, 10).unwrap();
        let mut in_memory = memory.create("n", 1_000, 10).unwrap();

        for _ in 0..300 {
            if rng.gen_bool(0.8) {
                let count = rng.gen_range(1..6);
                let points: Vec<Point> = (0..count)
                    .map(|_| {
                        let ts = on_file.start_time + rng.gen_range(0..40i64) * 10;
                        if rng.gen_bool(0.2) {
                            Point::absent(ts)
                        } else {
                            Point::new(ts, rng.gen_range(0..100) as f64)
                        }
                    })
                    .collect();
                match (file.write("n", &on_file, &points), memory.write("n", &in_memory, &points)) {
                    (Ok(a), Ok(b)) => {
                        assert_eq!(a, b);
                        on_file = a;
                        in_memory = b;
                    }
                    (Err(StrataError::SliceGapTooLarge { .. }), Err(StrataError::SliceGapTooLarge { .. })) => {}
                    other => panic!("stores disagree on write: {:?}", other),
                }
            } else {
                let t = on_file.start_time + rng.gen_range(0..20i64) * 5;
                match (
                    file.delete_before("n", &on_file, t).unwrap(),
                    memory.delete_before("n", &in_memory, t).unwrap(),
                ) {
                    (Some(a), Some(b)) => {
                        assert_eq!(a, b);
                        on_file = a;
                        in_memory = b;
                    }
                    (None, None) => {
                        on_file = file.create("n", t, 10).unwrap();
                        in_memory = memory.create("n", t, 10).unwrap();
                    }
                    other => panic!("stores disagree on delete: {:?}", other),
                }
            }

            assert_eq!(file.list_slices("n").unwrap(), memory.list_slices("n").unwrap());
            if !on_file.is_empty() {
                let (from, until) = (on_file.start_time, on_file.end_time);
                assert_eq!(
                    file.read("n", &on_file, from, until).unwrap(),
                    memory.read("n", &in_memory, from, until).unwrap()
                );
            }
        }
    }
}
