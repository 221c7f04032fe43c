//! Maintenance runner - drives rollup or merge over many nodes
//!
//! Nodes are independent, so a batch fans out over a bounded pool of
//! blocking workers. A failing node is logged and counted; it never stops
//! the rest of the batch.

use crate::config::MaintenanceConfig;
use crate::merge::{Defragmenter, MergeReport};
use crate::rollup::{RollupEngine, RollupReport};
use crate::storage::SliceStore;
use crate::tree::Tree;
use crate::{Result, Timestamp};
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, error, info};

/// What to do with every node of a run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    /// Roll overflowed points into coarser tiers, as seen from `as_of`
    Rollup { as_of: Timestamp },
    /// Defragment each tier's slices
    Merge,
}

/// Per-node result of an operation
#[derive(Debug, Clone)]
pub enum NodeOutcome {
    Rollup(RollupReport),
    Merge(MergeReport),
}

/// Totals for a batch
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunSummary {
    pub found: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub elapsed: Duration,
}

/// Run `op` against one node
pub fn run_node<S: SliceStore + ?Sized>(
    store: &S,
    node: &str,
    op: Operation,
    config: &MaintenanceConfig,
) -> Result<NodeOutcome> {
    match op {
        Operation::Rollup { as_of } => RollupEngine::new(store, config)
            .rollup_node(node, as_of)
            .map(NodeOutcome::Rollup),
        Operation::Merge => Defragmenter::new(store, config)
            .merge_node(node)
            .map(NodeOutcome::Merge),
    }
}

/// Run `op` over `nodes` with at most `config.workers` in flight
pub async fn run_batch<S: SliceStore + 'static>(
    store: Arc<S>,
    nodes: Vec<String>,
    op: Operation,
    config: Arc<MaintenanceConfig>,
) -> RunSummary {
    let started = Instant::now();
    let mut summary = RunSummary {
        found: nodes.len(),
        ..Default::default()
    };
    info!("Running {:?} over {} nodes with {} workers", op, nodes.len(), config.workers);

    let permits = Arc::new(Semaphore::new(config.workers.max(1)));
    let mut tasks = JoinSet::new();

    for node in nodes {
        // the semaphore is never closed
        let Ok(permit) = permits.clone().acquire_owned().await else {
            break;
        };
        let store = store.clone();
        let config = config.clone();
        tasks.spawn_blocking(move || {
            let _permit = permit;
            let started = Instant::now();
            let result = run_node(store.as_ref(), &node, op, &config);
            (node, result, started.elapsed())
        });
    }
    while let Some(joined) = tasks.join_next().await {
        record(joined, &mut summary);
    }

    summary.elapsed = started.elapsed();
    info!(
        "Finished {:?}: {} found, {} succeeded, {} failed in {:.3}s",
        op,
        summary.found,
        summary.succeeded,
        summary.failed,
        summary.elapsed.as_secs_f64()
    );
    summary
}

fn record(
    joined: std::result::Result<(String, Result<NodeOutcome>, Duration), tokio::task::JoinError>,
    summary: &mut RunSummary,
) {
    match joined {
        Ok((node, Ok(_), elapsed)) => {
            debug!("Node {} done in {:.3}s", node, elapsed.as_secs_f64());
            summary.succeeded += 1;
        }
        Ok((node, Err(e), elapsed)) => {
            error!("Node {} failed after {:.3}s: {}", node, elapsed.as_secs_f64(), e);
            summary.failed += 1;
        }
        Err(e) => {
            error!("Worker died: {}", e);
            summary.failed += 1;
        }
    }
}

/// Roll up one node addressed by filesystem or dotted path
pub fn rollup_node(
    node_path: &str,
    tree_root: &Path,
    as_of: Timestamp,
    config: &MaintenanceConfig,
) -> Result<RollupReport> {
    let tree = Tree::open(tree_root)?;
    let node = tree.resolve_node(node_path)?;
    let store = tree.store(config.max_slice_gap);
    RollupEngine::new(&store, config).rollup_node(&node, as_of)
}

/// Merge one node addressed by filesystem or dotted path
pub fn merge_node(node_path: &str, tree_root: &Path, config: &MaintenanceConfig) -> Result<MergeReport> {
    let tree = Tree::open(tree_root)?;
    let node = tree.resolve_node(node_path)?;
    let store = tree.store(config.max_slice_gap);
    Defragmenter::new(&store, config).merge_node(&node)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStore;
    use crate::{AggregationMethod, NodeMetadata, Retention, RetentionPolicy, StrataError};

    const AS_OF: Timestamp = 10_000;

    fn metadata() -> NodeMetadata {
        NodeMetadata {
            retentions: RetentionPolicy::new(vec![Retention::new(10, 6), Retention::new(60, 5)]).unwrap(),
            aggregation_method: AggregationMethod::Avg,
            x_files_factor: 0.5,
        }
    }

    fn store_with(nodes: &[&str]) -> MemoryStore {
        let store = MemoryStore::new(80);
        for node in nodes {
            store.add_node(node, &metadata()).unwrap();
            store.insert_slice(node, 9_880, 10, vec![Some(1.0); 12]);
        }
        store
    }

    #[tokio::test]
    async fn test_batch_rolls_every_node() {
        let nodes = ["a.x", "a.y", "b.z"];
        let store = Arc::new(store_with(&nodes));
        let config = Arc::new(MaintenanceConfig {
            workers: 2,
            ..Default::default()
        });

        let summary = run_batch(
            store.clone(),
            nodes.iter().map(|n| n.to_string()).collect(),
            Operation::Rollup { as_of: AS_OF },
            config,
        )
        .await;

        assert_eq!(summary.found, 3);
        assert_eq!(summary.succeeded, 3);
        assert_eq!(summary.failed, 0);
        for node in nodes {
            assert_eq!(store.known_points(node, 60), 1);
            assert_eq!(store.known_points(node, 10), 6);
        }
    }

    #[tokio::test]
    async fn test_failed_node_does_not_stop_batch() {
        let store = store_with(&["good.one", "good.two"]);
        store.set_raw_metadata("bad.node", b"not json".to_vec());
        let store = Arc::new(store);

        let summary = run_batch(
            store,
            vec!["good.one".into(), "bad.node".into(), "good.two".into(), "missing".into()],
            Operation::Merge,
            Arc::new(MaintenanceConfig::default()),
        )
        .await;

        assert_eq!(summary.found, 4);
        assert_eq!(summary.succeeded, 2);
        assert_eq!(summary.failed, 2);
    }

    #[tokio::test]
    async fn test_empty_batch() {
        let summary = run_batch(
            Arc::new(MemoryStore::new(80)),
            Vec::new(),
            Operation::Merge,
            Arc::new(MaintenanceConfig::default()),
        )
        .await;
        assert_eq!(summary.found, 0);
        assert_eq!(summary.succeeded + summary.failed, 0);
    }

    #[test]
    fn test_run_node_dispatch() {
        let store = store_with(&["n"]);
        let config = MaintenanceConfig::default();
        assert!(matches!(
            run_node(&store, "n", Operation::Merge, &config),
            Ok(NodeOutcome::Merge(_))
        ));
        assert!(matches!(
            run_node(&store, "n", Operation::Rollup { as_of: AS_OF }, &config),
            Ok(NodeOutcome::Rollup(_))
        ));
    }

    #[test]
    fn test_entry_points_need_a_tree() {
        let dir = tempfile::TempDir::new().unwrap();
        let config = MaintenanceConfig::default();
        let err = rollup_node("a.b", dir.path(), AS_OF, &config).unwrap_err();
        assert!(matches!(err, StrataError::NotATree(_)));
        assert!(merge_node("a.b", dir.path(), &config).unwrap_err().is_run_fatal());
    }
}
