//! Tree discovery
//!
//! A tree is a directory carrying a `.strata-tree` marker. Every directory
//! below it that holds a `.strata-node` metadata file is a node, addressed by
//! its dotted path relative to the root.

use crate::storage::{FileStore, NODE_METADATA_FILE};
use crate::{Result, StrataError};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};
use walkdir::WalkDir;

/// Marker file identifying a tree root
pub const TREE_MARKER: &str = ".strata-tree";

/// A tree of nodes on disk
#[derive(Debug, Clone)]
pub struct Tree {
    root: PathBuf,
}

impl Tree {
    /// Open the tree containing `path`, searching upward for the marker
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let start = fs::canonicalize(path).map_err(|_| StrataError::NotATree(path.to_path_buf()))?;
        start
            .ancestors()
            .find(|dir| dir.join(TREE_MARKER).is_file())
            .map(|root| Self {
                root: root.to_path_buf(),
            })
            .ok_or_else(|| StrataError::NotATree(path.to_path_buf()))
    }

    /// Create a new tree at `root`
    pub fn create(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref();
        fs::create_dir_all(root)?;
        fs::write(root.join(TREE_MARKER), b"")?;
        Self::open(root)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// File store over this tree
    pub fn store(&self, max_slice_gap: u64) -> FileStore {
        FileStore::new(self.root.clone(), max_slice_gap)
    }

    /// Dotted paths of every node in the tree, sorted
    pub fn nodes(&self) -> Result<Vec<String>> {
        let mut nodes = Vec::new();
        let walker = WalkDir::new(&self.root)
            .min_depth(1)
            .into_iter()
            .filter_entry(|entry| entry.depth() == 0 || !is_hidden(entry.file_name()));

        for entry in walker {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    warn!("Skipping unreadable entry under {:?}: {}", self.root, e);
                    continue;
                }
            };
            if !entry.file_type().is_dir() || !entry.path().join(NODE_METADATA_FILE).is_file() {
                continue;
            }
            match self.node_path(entry.path()) {
                Some(node) => nodes.push(node),
                None => debug!("Ignoring node directory {:?}", entry.path()),
            }
        }
        nodes.sort();
        Ok(nodes)
    }

    /// Dotted node path for a directory inside the tree
    pub fn node_path(&self, dir: &Path) -> Option<String> {
        let relative = dir.strip_prefix(&self.root).ok()?;
        let parts: Vec<&str> = relative
            .components()
            .map(|c| c.as_os_str().to_str())
            .collect::<Option<_>>()?;
        if parts.is_empty() || parts.iter().any(|p| p.contains('.')) {
            return None;
        }
        Some(parts.join("."))
    }

    /// Accept either a filesystem path inside the tree or a dotted node path
    pub fn resolve_node(&self, name: &str) -> Result<String> {
        let as_path = Path::new(name);
        if as_path.is_dir() {
            let dir = fs::canonicalize(as_path)?;
            return self.node_path(&dir).ok_or_else(|| {
                StrataError::InvalidRequest(format!("{} is not a node of {:?}", name, self.root))
            });
        }
        let node = name.trim_matches('.');
        if node.is_empty() || node.split('.').any(str::is_empty) {
            return Err(StrataError::InvalidRequest(format!("invalid node path {:?}", name)));
        }
        Ok(node.to_string())
    }
}

fn is_hidden(name: &std::ffi::OsStr) -> bool {
    name.to_str().map(|s| s.starts_with('.')).unwrap_or(false)
}
