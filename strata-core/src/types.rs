//! Core types for Strata

use crate::{Result, StrataError};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Timestamp in seconds since Unix epoch
pub type Timestamp = i64;

/// A single sample; `value` is `None` when nothing was recorded for the step
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Point {
    pub timestamp: Timestamp,
    pub value: Option<f64>,
}

impl Point {
    /// Create a point carrying a value
    pub fn new(timestamp: Timestamp, value: f64) -> Self {
        Self {
            timestamp,
            value: Some(value),
        }
    }

    /// Create an absent point
    pub fn absent(timestamp: Timestamp) -> Self {
        Self {
            timestamp,
            value: None,
        }
    }

    pub fn is_known(&self) -> bool {
        self.value.is_some()
    }
}

/// One rung of a retention ladder: `count` points at `precision` seconds each
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Retention {
    pub precision: i64,
    pub count: i64,
}

impl Retention {
    pub fn new(precision: i64, count: i64) -> Self {
        Self { precision, count }
    }

    /// Seconds of history this rung covers
    pub fn span(&self) -> i64 {
        self.precision * self.count
    }
}

/// Ordered retention ladder, finest precision first
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetentionPolicy(Vec<Retention>);

impl RetentionPolicy {
    /// Build a policy, enforcing strictly increasing precisions and positive counts
    pub fn new(retentions: Vec<Retention>) -> std::result::Result<Self, String> {
        if retentions.is_empty() {
            return Err("retention policy is empty".into());
        }
        for r in &retentions {
            if r.precision <= 0 {
                return Err(format!("precision must be positive, got {}", r.precision));
            }
            if r.count <= 0 {
                return Err(format!("retention count must be positive, got {}", r.count));
            }
        }
        for pair in retentions.windows(2) {
            if pair[1].precision <= pair[0].precision {
                return Err(format!(
                    "precisions must be strictly increasing: {} then {}",
                    pair[0].precision, pair[1].precision
                ));
            }
        }
        Ok(Self(retentions))
    }

    pub fn finest(&self) -> Retention {
        self.0[0]
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Retention> {
        self.0.iter()
    }
}

/// Method used to collapse fine samples into one coarse sample
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AggregationMethod {
    Avg,
    Sum,
    Min,
    Max,
    Median,
}

impl FromStr for AggregationMethod {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "avg" | "average" => Ok(AggregationMethod::Avg),
            "sum" => Ok(AggregationMethod::Sum),
            "min" => Ok(AggregationMethod::Min),
            "max" => Ok(AggregationMethod::Max),
            "median" => Ok(AggregationMethod::Median),
            other => Err(format!("unsupported aggregation method: {}", other)),
        }
    }
}

impl fmt::Display for AggregationMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            AggregationMethod::Avg => "avg",
            AggregationMethod::Sum => "sum",
            AggregationMethod::Min => "min",
            AggregationMethod::Max => "max",
            AggregationMethod::Median => "median",
        };
        f.write_str(name)
    }
}

/// Default completeness threshold when a node does not set one
pub const DEFAULT_X_FILES_FACTOR: f64 = 0.5;

/// Validated per-node configuration
#[derive(Debug, Clone, PartialEq)]
pub struct NodeMetadata {
    pub retentions: RetentionPolicy,
    pub aggregation_method: AggregationMethod,
    pub x_files_factor: f64,
}

/// Metadata as stored on disk
#[derive(Debug, Serialize, Deserialize)]
struct RawMetadata {
    retentions: Vec<(i64, i64)>,
    #[serde(rename = "aggregationMethod", default)]
    aggregation_method: Option<String>,
    #[serde(rename = "xFilesFactor", default)]
    x_files_factor: Option<f64>,
}

impl NodeMetadata {
    /// Parse and validate metadata JSON for `node`
    pub fn from_json(node: &str, data: &[u8]) -> Result<Self> {
        let malformed = |reason: String| StrataError::MalformedMetadata {
            node: node.to_string(),
            reason,
        };

        let raw: RawMetadata =
            serde_json::from_slice(data).map_err(|e| malformed(e.to_string()))?;

        let retentions = RetentionPolicy::new(
            raw.retentions
                .into_iter()
                .map(|(precision, count)| Retention::new(precision, count))
                .collect(),
        )
        .map_err(malformed)?;

        let aggregation_method = match raw.aggregation_method {
            Some(name) => name.parse::<AggregationMethod>().map_err(malformed)?,
            None => AggregationMethod::Avg,
        };

        let x_files_factor = raw.x_files_factor.unwrap_or(DEFAULT_X_FILES_FACTOR);
        if !(0.0..=1.0).contains(&x_files_factor) {
            return Err(malformed(format!(
                "xFilesFactor must be within [0, 1], got {}",
                x_files_factor
            )));
        }

        Ok(Self {
            retentions,
            aggregation_method,
            x_files_factor,
        })
    }

    /// Serialize back to the on-disk JSON form
    pub fn to_json(&self) -> Result<Vec<u8>> {
        let raw = RawMetadata {
            retentions: self
                .retentions
                .iter()
                .map(|r| (r.precision, r.count))
                .collect(),
            aggregation_method: Some(self.aggregation_method.to_string()),
            x_files_factor: Some(self.x_files_factor),
        };
        serde_json::to_vec(&raw).map_err(|e| StrataError::Internal(e.to_string()))
    }
}

/// Handle to a stored slice, valid for the duration of one run
///
/// `end_time` is exclusive and always `start_time + len * step`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Slice {
    pub start_time: Timestamp,
    pub end_time: Timestamp,
    pub step: i64,
}

impl Slice {
    pub fn new(start_time: Timestamp, end_time: Timestamp, step: i64) -> Self {
        Self {
            start_time,
            end_time,
            step,
        }
    }

    /// Number of stored points
    pub fn len(&self) -> i64 {
        (self.end_time - self.start_time) / self.step
    }

    pub fn is_empty(&self) -> bool {
        self.end_time <= self.start_time
    }
}

impl fmt::Display for Slice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}[..{}]", self.start_time, self.step, self.end_time)
    }
}
