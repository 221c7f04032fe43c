//! Bucketing and aggregation of overflowed points
//!
//! Everything here is pure: points in, points out. The rollup driver does
//! the I/O around it.

use crate::{AggregationMethod, Point, Timestamp};

impl AggregationMethod {
    /// Collapse known values into one; `None` when there is nothing to collapse
    pub fn apply(&self, values: &mut [f64]) -> Option<f64> {
        if values.is_empty() {
            return None;
        }
        let value = match self {
            AggregationMethod::Avg => values.iter().sum::<f64>() / values.len() as f64,
            AggregationMethod::Sum => values.iter().sum(),
            AggregationMethod::Min => values.iter().copied().fold(f64::INFINITY, f64::min),
            AggregationMethod::Max => values.iter().copied().fold(f64::NEG_INFINITY, f64::max),
            AggregationMethod::Median => {
                // lower median on even counts, never interpolated
                values.sort_by(|a, b| a.total_cmp(b));
                values[values.len() / 2]
            }
        };
        Some(value)
    }
}

/// Fine samples collected for one coarse bucket
#[derive(Debug, Default)]
pub struct BucketAccumulator {
    known: Vec<f64>,
    total: usize,
}

impl BucketAccumulator {
    pub fn add(&mut self, value: Option<f64>) {
        self.total += 1;
        if let Some(v) = value {
            self.known.push(v);
        }
    }

    /// Fraction of contributing samples that carried a value
    pub fn known_fraction(&self) -> f64 {
        if self.total == 0 {
            return 0.0;
        }
        self.known.len() as f64 / self.total as f64
    }

    /// Aggregate value, or `None` if the bucket is empty or too sparse
    pub fn finish(&mut self, method: AggregationMethod, x_files_factor: f64) -> Option<f64> {
        if self.known.is_empty() || self.known_fraction() < x_files_factor {
            return None;
        }
        method.apply(&mut self.known)
    }

    pub fn reset(&mut self) {
        self.known.clear();
        self.total = 0;
    }
}

/// Start of the bucket holding `ts` on the grid `origin + k * step`
pub fn bucket_start(ts: Timestamp, origin: Timestamp, step: i64) -> Timestamp {
    origin + (ts - origin).div_euclid(step) * step
}

/// Result of aggregating one batch
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Aggregated {
    /// One point per surviving bucket, ascending
    pub points: Vec<Point>,
    /// Buckets that had at least one contributing sample
    pub buckets: usize,
}

/// Aggregate ascending `points` into buckets of `step` aligned to `origin`
///
/// Buckets with no known value, or whose known fraction is below
/// `x_files_factor`, produce nothing.
pub fn aggregate_points(
    points: &[Point],
    origin: Timestamp,
    step: i64,
    method: AggregationMethod,
    x_files_factor: f64,
) -> Aggregated {
    let mut out = Aggregated::default();
    let mut acc = BucketAccumulator::default();
    let mut current: Option<Timestamp> = None;

    for point in points {
        let bucket = bucket_start(point.timestamp, origin, step);
        if current != Some(bucket) {
            if let Some(start) = current {
                out.buckets += 1;
                if let Some(value) = acc.finish(method, x_files_factor) {
                    out.points.push(Point::new(start, value));
                }
                acc.reset();
            }
            current = Some(bucket);
        }
        acc.add(point.value);
    }
    if let Some(start) = current {
        out.buckets += 1;
        if let Some(value) = acc.finish(method, x_files_factor) {
            out.points.push(Point::new(start, value));
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn series(start: Timestamp, step: i64, values: &[Option<f64>]) -> Vec<Point> {
        values
            .iter()
            .enumerate()
            .map(|(i, v)| Point {
                timestamp: start + i as i64 * step,
                value: *v,
            })
            .collect()
    }

    #[test]
    fn test_avg_excludes_absent() {
        let points = series(0, 10, &[Some(1.0), Some(2.0), Some(3.0), None]);
        let out = aggregate_points(&points, 0, 40, AggregationMethod::Avg, 0.5);
        assert_eq!(out.points, vec![Point::new(0, 2.0)]);
    }

    #[test]
    fn test_median_takes_lower_index() {
        assert_eq!(AggregationMethod::Median.apply(&mut [5.0, 1.0, 3.0]), Some(3.0));
        assert_eq!(AggregationMethod::Median.apply(&mut [4.0, 1.0, 3.0, 2.0]), Some(3.0));
    }

    #[test]
    fn test_methods() {
        let values = [4.0, -1.0, 7.5];
        assert_eq!(AggregationMethod::Sum.apply(&mut values.clone()), Some(10.5));
        assert_eq!(AggregationMethod::Min.apply(&mut values.clone()), Some(-1.0));
        assert_eq!(AggregationMethod::Max.apply(&mut values.clone()), Some(7.5));
        assert_eq!(AggregationMethod::Avg.apply(&mut []), None);
    }

    #[test]
    fn test_completeness_gating() {
        let sparse = series(0, 10, &[Some(1.0), None, None, None]);
        let out = aggregate_points(&sparse, 0, 40, AggregationMethod::Sum, 0.5);
        assert!(out.points.is_empty());
        assert_eq!(out.buckets, 1);

        let half = series(0, 10, &[Some(1.0), None, Some(2.0), None]);
        let out = aggregate_points(&half, 0, 40, AggregationMethod::Sum, 0.5);
        assert_eq!(out.points, vec![Point::new(0, 3.0)]);
    }

    #[test]
    fn test_all_absent_bucket_skipped_even_with_zero_xff() {
        let points = series(0, 10, &[None, None]);
        let out = aggregate_points(&points, 0, 20, AggregationMethod::Avg, 0.0);
        assert!(out.points.is_empty());
    }

    #[test]
    fn test_buckets_follow_origin_grid() {
        // origin 5, step 20: buckets start at ..., -15, 5, 25, ...
        let points = series(-10, 10, &[Some(1.0), Some(2.0), Some(3.0), Some(4.0)]);
        let out = aggregate_points(&points, 5, 20, AggregationMethod::Max, 0.0);
        assert_eq!(
            out.points,
            vec![Point::new(-15, 2.0), Point::new(5, 4.0)]
        );
        assert_eq!(bucket_start(5, 5, 20), 5);
        assert_eq!(bucket_start(4, 5, 20), -15);
    }

    proptest! {
        #[test]
        fn prop_bucket_written_iff_complete_enough(
            mask in proptest::collection::vec(any::<bool>(), 1..12),
            xff in 0.0f64..=1.0,
        ) {
            let values: Vec<Option<f64>> = mask.iter().map(|k| if *k { Some(1.0) } else { None }).collect();
            let points = series(0, 1, &values);
            let out = aggregate_points(&points, 0, 100, AggregationMethod::Sum, xff);

            let known = mask.iter().filter(|k| **k).count();
            let expected = known > 0 && (known as f64 / mask.len() as f64) >= xff;
            prop_assert_eq!(out.points.len() == 1, expected);
            if expected {
                prop_assert_eq!(out.points[0].value, Some(known as f64));
            }
        }

        #[test]
        fn prop_output_ascending_and_on_grid(
            start in -1000i64..1000,
            len in 1usize..200,
            origin in -50i64..50,
            step in 1i64..40,
        ) {
            let values = vec![Some(1.0); len];
            let points = series(start, 3, &values);
            let out = aggregate_points(&points, origin, step, AggregationMethod::Avg, 0.0);
            for pair in out.points.windows(2) {
                prop_assert!(pair[0].timestamp < pair[1].timestamp);
            }
            for p in &out.points {
                prop_assert_eq!((p.timestamp - origin).rem_euclid(step), 0);
            }
        }
    }
}
