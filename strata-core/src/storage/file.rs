//! File-backed slice store
//!
//! Layout under the tree root:
//!
//! ```text
//! <root>/.strata-tree
//! <root>/a/b/c/.strata-node        node metadata (JSON)
//! <root>/a/b/c/<start>@<step>.slice packed big-endian f64, NaN = absent
//! ```

use super::{fold_values, plan_write, points_before, read_bounds, SliceStore};
use crate::config::DATAPOINT_SIZE;
use crate::{NodeMetadata, Point, Result, Slice, StrataError, Timestamp};
use bytes::{Buf, BufMut, BytesMut};
use regex::Regex;
use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use tracing::debug;

/// Marker file identifying a node directory
pub const NODE_METADATA_FILE: &str = ".strata-node";

fn slice_name_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^(-?\d+)@(\d+)\.slice$").expect("valid slice name pattern"))
}

/// Slice store rooted at a tree directory
#[derive(Debug, Clone)]
pub struct FileStore {
    root: PathBuf,
    max_slice_gap: u64,
}

impl FileStore {
    /// Create a store over `root`; writes may pad at most `max_slice_gap` points
    pub fn new(root: impl Into<PathBuf>, max_slice_gap: u64) -> Self {
        Self {
            root: root.into(),
            max_slice_gap,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory holding a dotted node path
    pub fn node_dir(&self, node: &str) -> PathBuf {
        node.split('.').fold(self.root.clone(), |dir, part| dir.join(part))
    }

    /// Create a node directory with the given metadata
    pub fn create_node(&self, node: &str, metadata: &NodeMetadata) -> Result<()> {
        let dir = self.node_dir(node);
        fs::create_dir_all(&dir)?;
        fs::write(dir.join(NODE_METADATA_FILE), metadata.to_json()?)?;
        Ok(())
    }

    fn slice_path(&self, node: &str, start: Timestamp, step: i64) -> PathBuf {
        self.node_dir(node).join(format!("{}@{}.slice", start, step))
    }

    fn open_existing(&self, node: &str, slice: &Slice) -> Result<(File, PathBuf)> {
        let path = self.slice_path(node, slice.start_time, slice.step);
        match OpenOptions::new().read(true).write(true).open(&path) {
            Ok(file) => Ok((file, path)),
            Err(e) if e.kind() == ErrorKind::NotFound => Err(StrataError::SliceDeleted),
            Err(e) => Err(StrataError::Io(e)),
        }
    }

    fn handle_for(start: Timestamp, step: i64, file_len: u64) -> Slice {
        let points = (file_len / DATAPOINT_SIZE) as i64;
        Slice::new(start, start + points * step, step)
    }
}

fn encode(values: &[Option<f64>]) -> BytesMut {
    let mut buf = BytesMut::with_capacity(values.len() * DATAPOINT_SIZE as usize);
    for value in values {
        buf.put_f64(value.unwrap_or(f64::NAN));
    }
    buf
}

fn decode(mut data: &[u8]) -> Vec<Option<f64>> {
    let mut values = Vec::with_capacity(data.len() / DATAPOINT_SIZE as usize);
    while data.remaining() >= DATAPOINT_SIZE as usize {
        let v = data.get_f64();
        values.push(if v.is_nan() { None } else { Some(v) });
    }
    values
}

impl SliceStore for FileStore {
    fn read_metadata(&self, node: &str) -> Result<NodeMetadata> {
        let path = self.node_dir(node).join(NODE_METADATA_FILE);
        let data = match fs::read(&path) {
            Ok(data) => data,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(StrataError::MetadataNotFound(node.to_string()))
            }
            Err(e) => return Err(StrataError::Io(e)),
        };
        NodeMetadata::from_json(node, &data)
    }

    fn list_slices(&self, node: &str) -> Result<Vec<Slice>> {
        let dir = self.node_dir(node);
        let mut slices = Vec::new();
        for entry in fs::read_dir(&dir)? {
            let entry = entry?;
            let name = entry.file_name();
            let Some(caps) = name.to_str().and_then(|n| slice_name_pattern().captures(n)) else {
                continue;
            };
            let (Ok(start), Ok(step)) = (caps[1].parse::<i64>(), caps[2].parse::<i64>()) else {
                continue;
            };
            if step <= 0 {
                continue;
            }
            let len = match entry.metadata() {
                Ok(meta) => meta.len(),
                // raced with a delete
                Err(e) if e.kind() == ErrorKind::NotFound => continue,
                Err(e) => return Err(StrataError::Io(e)),
            };
            slices.push(Self::handle_for(start, step, len));
        }
        slices.sort_by_key(|s| (s.step, s.start_time));
        Ok(slices)
    }

    fn read(&self, node: &str, slice: &Slice, from: Timestamp, until: Timestamp) -> Result<Vec<Point>> {
        let (mut file, _) = self.open_existing(node, slice)?;
        let current = Self::handle_for(slice.start_time, slice.step, file.metadata()?.len());
        let (first, last) = read_bounds(&current, from, until)?;

        file.seek(SeekFrom::Start(first as u64 * DATAPOINT_SIZE))?;
        let mut data = vec![0u8; (last - first) * DATAPOINT_SIZE as usize];
        file.read_exact(&mut data)?;

        Ok(decode(&data)
            .into_iter()
            .enumerate()
            .map(|(i, value)| Point {
                timestamp: current.start_time + (first + i) as i64 * current.step,
                value,
            })
            .collect())
    }

    fn write(&self, node: &str, slice: &Slice, points: &[Point]) -> Result<Slice> {
        if points.is_empty() {
            return Ok(*slice);
        }
        let (mut file, _) = self.open_existing(node, slice)?;
        let current = Self::handle_for(slice.start_time, slice.step, file.metadata()?.len());
        let plan = plan_write(&current, points, self.max_slice_gap)?;

        let mut len = current.len() as usize;
        for run in &plan.runs {
            let mut buf = BytesMut::new();
            let mut offset = run.offset;
            if run.offset > len {
                buf.extend_from_slice(&encode(&vec![None; run.offset - len]));
                offset = len;
            }
            buf.extend_from_slice(&encode(&run.values));
            file.seek(SeekFrom::Start(offset as u64 * DATAPOINT_SIZE))?;
            file.write_all(&buf)?;
            len = len.max(run.offset + run.values.len());
        }
        file.flush()?;

        debug!(
            "Wrote {} points to {}@{} ({} runs)",
            points.len(),
            slice.start_time,
            slice.step,
            plan.runs.len()
        );
        Ok(Self::handle_for(current.start_time, current.step, plan.new_len as u64 * DATAPOINT_SIZE))
    }

    fn delete_before(&self, node: &str, slice: &Slice, t: Timestamp) -> Result<Option<Slice>> {
        let (mut file, path) = self.open_existing(node, slice)?;
        let current = Self::handle_for(slice.start_time, slice.step, file.metadata()?.len());
        let skip = points_before(&current, t);
        if skip == 0 {
            return Ok(Some(current));
        }
        if skip >= current.len() {
            drop_file(file, &path)?;
            return Ok(None);
        }

        file.seek(SeekFrom::Start(skip as u64 * DATAPOINT_SIZE))?;
        let mut rest = Vec::new();
        file.read_to_end(&mut rest)?;

        let new_start = current.start_time + skip * current.step;
        let target = self.slice_path(node, new_start, current.step);
        match fs::read(&target) {
            Ok(data) => {
                let mut merged = decode(&data);
                fold_values(&mut merged, &decode(&rest));
                fs::write(&target, encode(&merged))?;
                drop_file(file, &path)?;
                debug!(
                    "Folded remainder of {}@{} into {}@{}",
                    current.start_time, current.step, new_start, current.step
                );
                let len = merged.len() as u64 * DATAPOINT_SIZE;
                return Ok(Some(Self::handle_for(new_start, current.step, len)));
            }
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => return Err(StrataError::Io(e)),
        }

        file.seek(SeekFrom::Start(0))?;
        file.write_all(&rest)?;
        file.set_len(rest.len() as u64)?;
        file.flush()?;
        drop(file);

        fs::rename(&path, &target)?;
        Ok(Some(Self::handle_for(new_start, current.step, rest.len() as u64)))
    }

    fn create(&self, node: &str, start: Timestamp, step: i64) -> Result<Slice> {
        if step <= 0 {
            return Err(StrataError::InvalidRequest(format!("invalid step {}", step)));
        }
        let path = self.slice_path(node, start, step);
        match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(_) => {
                debug!("Created slice {:?}", path);
                Ok(Slice::new(start, start, step))
            }
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                let len = fs::metadata(&path)?.len();
                Ok(Self::handle_for(start, step, len))
            }
            Err(e) => Err(StrataError::Io(e)),
        }
    }
}

fn drop_file(file: File, path: &Path) -> Result<()> {
    drop(file);
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(StrataError::Io(e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{AggregationMethod, Retention, RetentionPolicy};
    use tempfile::TempDir;

    fn store() -> (TempDir, FileStore) {
        let dir = TempDir::new().unwrap();
        let store = FileStore::new(dir.path(), 80);
        let metadata = NodeMetadata {
            retentions: RetentionPolicy::new(vec![Retention::new(10, 6)]).unwrap(),
            aggregation_method: AggregationMethod::Sum,
            x_files_factor: 0.5,
        };
        store.create_node("servers.web01.cpu", &metadata).unwrap();
        (dir, store)
    }

    #[test]
    fn test_node_dir_and_metadata() {
        let (dir, store) = store();
        assert_eq!(
            store.node_dir("servers.web01.cpu"),
            dir.path().join("servers").join("web01").join("cpu")
        );
        let meta = store.read_metadata("servers.web01.cpu").unwrap();
        assert_eq!(meta.aggregation_method, AggregationMethod::Sum);

        let err = store.read_metadata("servers.web02.cpu").unwrap_err();
        assert!(matches!(err, StrataError::MetadataNotFound(_)));
    }

    #[test]
    fn test_create_write_read() {
        let (_dir, store) = store();
        let node = "servers.web01.cpu";
        let slice = store.create(node, 1000, 10).unwrap();
        assert!(slice.is_empty());

        let slice = store
            .write(node, &slice, &[Point::new(1000, 1.5), Point::new(1010, 2.5), Point::new(1040, 4.0)])
            .unwrap();
        assert_eq!(slice.end_time, 1050);

        let points = store.read(node, &slice, 1000, 1050).unwrap();
        assert_eq!(points.len(), 5);
        assert_eq!(points[0], Point::new(1000, 1.5));
        assert_eq!(points[2], Point::absent(1020));
        assert_eq!(points[4], Point::new(1040, 4.0));

        assert_eq!(store.list_slices(node).unwrap(), vec![slice]);
    }

    #[test]
    fn test_write_gap_too_large() {
        let (_dir, store) = store();
        let node = "servers.web01.cpu";
        let slice = store.create(node, 0, 10).unwrap();
        let slice = store.write(node, &slice, &[Point::new(0, 1.0)]).unwrap();

        let err = store.write(node, &slice, &[Point::new(10 * 100, 1.0)]).unwrap_err();
        assert!(matches!(err, StrataError::SliceGapTooLarge { .. }));
        assert_eq!(store.list_slices(node).unwrap()[0].end_time, 10);
    }

    #[test]
    fn test_delete_before_rebases() {
        let (_dir, store) = store();
        let node = "servers.web01.cpu";
        let slice = store.create(node, 100, 10).unwrap();
        let points: Vec<Point> = (0..10).map(|i| Point::new(100 + i * 10, i as f64)).collect();
        let slice = store.write(node, &slice, &points).unwrap();

        let rebased = store.delete_before(node, &slice, 145).unwrap().unwrap();
        assert_eq!(rebased, Slice::new(150, 200, 10));
        let read = store.read(node, &rebased, 0, 1000).unwrap();
        assert_eq!(read[0], Point::new(150, 5.0));

        // old handle is stale now
        let err = store.read(node, &slice, 100, 200).unwrap_err();
        assert!(matches!(err, StrataError::SliceDeleted));

        assert_eq!(store.delete_before(node, &rebased, 500).unwrap(), None);
        assert!(store.list_slices(node).unwrap().is_empty());
        assert!(matches!(
            store.delete_before(node, &rebased, 500),
            Err(StrataError::SliceDeleted)
        ));
    }

    #[test]
    fn test_delete_before_folds_into_existing_slice() {
        let (_dir, store) = store();
        let node = "servers.web01.cpu";
        let older = store.create(node, 100, 10).unwrap();
        let older = store
            .write(node, &older, &(0..8).map(|i| Point::new(100 + i * 10, 1.0)).collect::<Vec<_>>())
            .unwrap();
        let newer = store.create(node, 140, 10).unwrap();
        let newer = store
            .write(node, &newer, &[Point::new(140, 7.0), Point::new(160, 7.0)])
            .unwrap();
        assert_eq!(newer, Slice::new(140, 170, 10));

        let folded = store.delete_before(node, &older, 140).unwrap().unwrap();
        assert_eq!(folded, Slice::new(140, 180, 10));
        assert_eq!(store.list_slices(node).unwrap(), vec![folded]);

        let values: Vec<_> = store
            .read(node, &folded, 0, 1000)
            .unwrap()
            .into_iter()
            .map(|p| p.value)
            .collect();
        assert_eq!(values, vec![Some(7.0), Some(1.0), Some(7.0), Some(1.0)]);
        assert!(matches!(store.read(node, &older, 0, 1000), Err(StrataError::SliceDeleted)));
    }

    #[test]
    fn test_list_ignores_foreign_files() {
        let (dir, store) = store();
        let node_dir = dir.path().join("servers/web01/cpu");
        fs::write(node_dir.join("notes.txt"), b"x").unwrap();
        fs::write(node_dir.join("12@0.slice"), b"").unwrap();
        assert!(store.list_slices("servers.web01.cpu").unwrap().is_empty());
    }
}
