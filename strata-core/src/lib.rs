//! Strata Core - Maintenance Engine for Multi-Resolution Time-Series Storage
//!
//! A metric ("node") keeps its history at several precisions, each retained
//! for a fixed number of points. Data lives in slices: contiguous runs of
//! fixed-step points. This crate keeps that layout healthy:
//!
//! - **Rollup**: aggregates points that aged out of a tier into the next
//!   coarser one, then expires them
//! - **Merge**: defragments adjacent slices of the same precision
//!
//! # Architecture
//!
//! - **Storage**: the [`storage::SliceStore`] trait with file and in-memory backends
//! - **Archive**: per-run view of the retention ladder
//! - **Tree**: node discovery under a marked root directory
//! - **Runner**: bounded worker pool over many nodes, guarded by a run lock

pub mod archive;
pub mod config;
pub mod lock;
pub mod merge;
pub mod rollup;
pub mod runner;
pub mod storage;
pub mod tree;

mod error;
mod types;

pub use config::MaintenanceConfig;
pub use error::{Result, StrataError};
pub use merge::{Defragmenter, MergeReport, MergeStats};
pub use rollup::{RollupEngine, RollupReport, TierStats};
pub use runner::{merge_node, rollup_node, run_batch, Operation, RunSummary};
pub use types::*;

/// Strata version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
