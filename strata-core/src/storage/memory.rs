//! In-memory slice store

use super::{fold_values, plan_write, points_before, read_bounds, SliceStore};
use crate::{NodeMetadata, Point, Result, Slice, StrataError, Timestamp};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};

#[derive(Default)]
struct NodeEntry {
    metadata: Option<Vec<u8>>,
    /// (step, start) -> values
    slices: BTreeMap<(i64, Timestamp), Vec<Option<f64>>>,
}

/// Store call a fault can be attached to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StoreOp {
    Read,
    Write,
    DeleteBefore,
}

/// What an injected fault does when it fires
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    /// Fail with an I/O error, leaving the slice untouched
    Io,
    /// Remove the slice and report it as deleted
    Deleted,
}

struct Inner {
    nodes: HashMap<String, NodeEntry>,
    creates_left: Option<usize>,
    /// One-shot faults keyed by (op, node, step, start)
    faults: HashMap<(StoreOp, String, i64, Timestamp), Fault>,
}

/// Slice store kept entirely in memory, same semantics as the file store
pub struct MemoryStore {
    inner: Mutex<Inner>,
    max_slice_gap: u64,
}

impl MemoryStore {
    pub fn new(max_slice_gap: u64) -> Self {
        Self {
            inner: Mutex::new(Inner {
                nodes: HashMap::new(),
                creates_left: None,
                faults: HashMap::new(),
            }),
            max_slice_gap,
        }
    }

    /// Register a node with valid metadata
    pub fn add_node(&self, node: &str, metadata: &NodeMetadata) -> Result<()> {
        let json = metadata.to_json()?;
        self.set_raw_metadata(node, json);
        Ok(())
    }

    /// Register a node with arbitrary metadata bytes
    pub fn set_raw_metadata(&self, node: &str, data: Vec<u8>) {
        let mut inner = self.inner.lock();
        inner.nodes.entry(node.to_string()).or_default().metadata = Some(data);
    }

    /// Store a slice holding `values` from `start` on
    pub fn insert_slice(&self, node: &str, start: Timestamp, step: i64, values: Vec<Option<f64>>) -> Slice {
        let len = values.len() as i64;
        let mut inner = self.inner.lock();
        inner
            .nodes
            .entry(node.to_string())
            .or_default()
            .slices
            .insert((step, start), values);
        Slice::new(start, start + len * step, step)
    }

    /// Let `n` more creates succeed, then fail every following one
    pub fn fail_creates_after(&self, n: usize) {
        self.inner.lock().creates_left = Some(n);
    }

    /// Make the next `op` against the slice at `start`/`step` fail
    pub fn inject_fault(&self, op: StoreOp, node: &str, start: Timestamp, step: i64, fault: Fault) {
        self.inner
            .lock()
            .faults
            .insert((op, node.to_string(), step, start), fault);
    }

    /// Current values of a slice, if it exists
    pub fn values(&self, node: &str, start: Timestamp, step: i64) -> Option<Vec<Option<f64>>> {
        let inner = self.inner.lock();
        inner.nodes.get(node)?.slices.get(&(step, start)).cloned()
    }

    /// Count of non-absent points across a node's slices of one step
    pub fn known_points(&self, node: &str, step: i64) -> usize {
        let inner = self.inner.lock();
        inner
            .nodes
            .get(node)
            .map(|entry| {
                entry
                    .slices
                    .iter()
                    .filter(|((s, _), _)| *s == step)
                    .map(|(_, values)| values.iter().filter(|v| v.is_some()).count())
                    .sum()
            })
            .unwrap_or(0)
    }
}

fn handle(start: Timestamp, step: i64, values: &[Option<f64>]) -> Slice {
    Slice::new(start, start + values.len() as i64 * step, step)
}

impl Inner {
    fn check_fault(&mut self, op: StoreOp, node: &str, slice: &Slice) -> Result<()> {
        let key = (op, node.to_string(), slice.step, slice.start_time);
        match self.faults.remove(&key) {
            None => Ok(()),
            Some(Fault::Io) => Err(StrataError::Io(std::io::Error::new(
                std::io::ErrorKind::Other,
                format!("injected {:?} failure on {}", op, slice),
            ))),
            Some(Fault::Deleted) => {
                if let Some(entry) = self.nodes.get_mut(node) {
                    entry.slices.remove(&(slice.step, slice.start_time));
                }
                Err(StrataError::SliceDeleted)
            }
        }
    }

    fn slice_values(&mut self, node: &str, slice: &Slice) -> Result<&mut Vec<Option<f64>>> {
        self.nodes
            .get_mut(node)
            .and_then(|entry| entry.slices.get_mut(&(slice.step, slice.start_time)))
            .ok_or(StrataError::SliceDeleted)
    }
}

impl SliceStore for MemoryStore {
    fn read_metadata(&self, node: &str) -> Result<NodeMetadata> {
        let inner = self.inner.lock();
        let data = inner
            .nodes
            .get(node)
            .and_then(|entry| entry.metadata.as_ref())
            .ok_or_else(|| StrataError::MetadataNotFound(node.to_string()))?;
        NodeMetadata::from_json(node, data)
    }

    fn list_slices(&self, node: &str) -> Result<Vec<Slice>> {
        let inner = self.inner.lock();
        Ok(inner
            .nodes
            .get(node)
            .map(|entry| {
                entry
                    .slices
                    .iter()
                    .map(|((step, start), values)| handle(*start, *step, values))
                    .collect()
            })
            .unwrap_or_default())
    }

    fn read(&self, node: &str, slice: &Slice, from: Timestamp, until: Timestamp) -> Result<Vec<Point>> {
        let mut inner = self.inner.lock();
        inner.check_fault(StoreOp::Read, node, slice)?;
        let values = inner.slice_values(node, slice)?;
        let current = handle(slice.start_time, slice.step, values);
        let (first, last) = read_bounds(&current, from, until)?;
        Ok(values[first..last]
            .iter()
            .enumerate()
            .map(|(i, value)| Point {
                timestamp: current.start_time + (first + i) as i64 * current.step,
                value: *value,
            })
            .collect())
    }

    fn write(&self, node: &str, slice: &Slice, points: &[Point]) -> Result<Slice> {
        let max_gap = self.max_slice_gap;
        let mut inner = self.inner.lock();
        inner.check_fault(StoreOp::Write, node, slice)?;
        let values = inner.slice_values(node, slice)?;
        if points.is_empty() {
            return Ok(handle(slice.start_time, slice.step, values));
        }
        let plan = plan_write(&handle(slice.start_time, slice.step, values), points, max_gap)?;
        if values.len() < plan.new_len {
            values.resize(plan.new_len, None);
        }
        for run in plan.runs {
            values[run.offset..run.offset + run.values.len()].copy_from_slice(&run.values);
        }
        Ok(handle(slice.start_time, slice.step, values))
    }

    fn delete_before(&self, node: &str, slice: &Slice, t: Timestamp) -> Result<Option<Slice>> {
        let mut inner = self.inner.lock();
        inner.check_fault(StoreOp::DeleteBefore, node, slice)?;
        let values = inner.slice_values(node, slice)?;
        let current = handle(slice.start_time, slice.step, values);
        let skip = points_before(&current, t);
        if skip == 0 {
            return Ok(Some(current));
        }

        let entry = inner
            .nodes
            .get_mut(node)
            .ok_or(StrataError::SliceDeleted)?;
        let mut values = entry
            .slices
            .remove(&(slice.step, slice.start_time))
            .ok_or(StrataError::SliceDeleted)?;
        if skip >= current.len() {
            return Ok(None);
        }
        let rest = values.split_off(skip as usize);
        let new_start = current.start_time + skip * current.step;
        if let Some(existing) = entry.slices.get_mut(&(current.step, new_start)) {
            fold_values(existing, &rest);
            return Ok(Some(handle(new_start, current.step, existing)));
        }
        let rebased = handle(new_start, current.step, &rest);
        entry.slices.insert((current.step, new_start), rest);
        Ok(Some(rebased))
    }

    fn create(&self, node: &str, start: Timestamp, step: i64) -> Result<Slice> {
        if step <= 0 {
            return Err(StrataError::InvalidRequest(format!("invalid step {}", step)));
        }
        let mut inner = self.inner.lock();
        if let Some(left) = inner.creates_left.as_mut() {
            if *left == 0 {
                return Err(StrataError::Io(std::io::Error::new(
                    std::io::ErrorKind::Other,
                    "injected create failure",
                )));
            }
            *left -= 1;
        }
        let entry = inner.nodes.entry(node.to_string()).or_default();
        let values = entry.slices.entry((step, start)).or_default();
        Ok(handle(start, step, values))
    }
}
