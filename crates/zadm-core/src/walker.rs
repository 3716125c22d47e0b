// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Dataset tree walking.
//!
//! Engine iterations deliver freshly opened handles through a visitor. The
//! walker collects them while the engine call runs and turns them into
//! owned [`Dataset`]s afterwards, so that every handle has exactly one
//! owner at every point, including the failure paths.
//!
//! Collections keep discovery order: for children, filesystems and volumes
//! first, then snapshots oldest first, then bookmarks. Callers comparing
//! against engine output should still compare as sets.

use crate::dataset::Dataset;
use crate::error::{Error, Result};
use crate::registry::Registry;
use std::ops::ControlFlow;
use tracing::{debug, warn};
use zadm_engine::{DatasetType, Engine, EngineResult, ErrorCode, RawHandle, Visitor};

const NO_SUCH_DATASET: &str = "no such pool or dataset";

/// Run one iterating engine call, gathering every delivered handle. The
/// handles are returned even when the iteration failed part way.
pub(crate) fn collect_handles(
    registry: &Registry,
    operation: &str,
    iterate: impl FnOnce(&mut dyn Engine, Visitor<'_>) -> EngineResult<()>,
) -> (Vec<RawHandle>, Result<()>) {
    let mut handles = Vec::new();
    let result = registry.call(operation, |e| {
        iterate(e, &mut |handle: RawHandle| {
            handles.push(handle);
            ControlFlow::Continue(())
        })
    });
    (handles, result)
}

/// Wrap raw handles into datasets. On failure every handle not yet wrapped
/// is closed; wrapped ones close as the partial vector drops.
pub(crate) fn adopt(registry: &Registry, handles: Vec<RawHandle>) -> Result<Vec<Dataset<'_>>> {
    let mut datasets = Vec::with_capacity(handles.len());
    let mut pending = handles.into_iter();
    while let Some(handle) = pending.next() {
        match Dataset::from_raw(registry, handle) {
            Ok(dataset) => datasets.push(dataset),
            Err(err) => {
                registry.with_engine(|e| pending.for_each(|rest| e.close(rest)));
                return Err(err);
            }
        }
    }
    Ok(datasets)
}

fn close_all(registry: &Registry, handles: Vec<RawHandle>) {
    registry.with_engine(|e| handles.into_iter().for_each(|h| e.close(h)));
}

/// Owned sequence of sibling datasets. Dropping it closes every handle.
#[derive(Debug, Default)]
pub struct DatasetCollection<'r> {
    datasets: Vec<Dataset<'r>>,
}

impl<'r> DatasetCollection<'r> {
    pub fn iter(&self) -> std::slice::Iter<'_, Dataset<'r>> {
        self.datasets.iter()
    }

    pub fn len(&self) -> usize {
        self.datasets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.datasets.is_empty()
    }

    pub fn names(&self) -> Vec<&str> {
        self.datasets.iter().map(Dataset::name).collect()
    }

    pub fn into_vec(self) -> Vec<Dataset<'r>> {
        self.datasets
    }
}

impl<'r> From<Vec<Dataset<'r>>> for DatasetCollection<'r> {
    fn from(datasets: Vec<Dataset<'r>>) -> Self {
        DatasetCollection { datasets }
    }
}

impl<'r> IntoIterator for DatasetCollection<'r> {
    type Item = Dataset<'r>;
    type IntoIter = std::vec::IntoIter<Dataset<'r>>;

    fn into_iter(self) -> Self::IntoIter {
        self.datasets.into_iter()
    }
}

impl<'a, 'r> IntoIterator for &'a DatasetCollection<'r> {
    type Item = &'a Dataset<'r>;
    type IntoIter = std::slice::Iter<'a, Dataset<'r>>;

    fn into_iter(self) -> Self::IntoIter {
        self.datasets.iter()
    }
}

/// Open `path` whatever kind of dataset it names.
pub fn open<'r>(registry: &'r Registry, path: &str) -> Result<Dataset<'r>> {
    Dataset::open(registry, path)
}

/// Top-level dataset of every pool.
pub fn list_roots(registry: &Registry) -> Result<DatasetCollection<'_>> {
    let (handles, result) = collect_handles(registry, "iter_root", |e, visit| e.iter_root(visit));
    if let Err(err) = result {
        debug!(operation = "list_roots", error = %err, received = handles.len(), "Root iteration failed");
        close_all(registry, handles);
        return Err(Error::NotFound {
            code: err.code().unwrap_or(ErrorCode::NoEnt),
            message: NO_SUCH_DATASET.to_string(),
        });
    }
    if handles.is_empty() {
        return Err(Error::NotFound {
            code: ErrorCode::NoEnt,
            message: NO_SUCH_DATASET.to_string(),
        });
    }
    Ok(adopt(registry, handles)?.into())
}

/// Direct children of `parent`, followed by its bookmarks.
///
/// A failure while listing children discards everything; a failure while
/// listing bookmarks keeps what was found.
pub fn list_children<'r>(parent: &Dataset<'r>) -> Result<DatasetCollection<'r>> {
    let registry = parent.registry();
    let handle = parent.raw();

    let (handles, result) = collect_handles(registry, "iter_children", |e, visit| {
        e.iter_children(handle, visit)
    });
    if let Err(err) = result {
        debug!(operation = "list_children", dataset = %parent.name(), error = %err, "Child iteration failed");
        close_all(registry, handles);
        return Err(err);
    }
    let mut children = adopt(registry, handles)?;

    let (bookmarks, result) = collect_handles(registry, "iter_bookmarks", |e, visit| {
        e.iter_bookmarks(handle, visit)
    });
    if let Err(err) = result {
        warn!(operation = "list_children", dataset = %parent.name(), error = %err, kept = bookmarks.len(), "Bookmark iteration failed, keeping partial results");
    }
    children.extend(adopt(registry, bookmarks)?);
    Ok(children.into())
}

/// A dataset with its descendants loaded.
#[derive(Debug)]
pub struct DatasetTree<'r> {
    pub dataset: Dataset<'r>,
    pub children: Vec<DatasetTree<'r>>,
}

impl<'r> DatasetTree<'r> {
    /// Open `path` and load everything below it.
    pub fn open_tree(registry: &'r Registry, path: &str) -> Result<Self> {
        Self::load(Dataset::open(registry, path)?)
    }

    /// Every pool with everything below it.
    pub fn open_all(registry: &'r Registry) -> Result<Vec<Self>> {
        list_roots(registry)?.into_iter().map(Self::load).collect()
    }

    fn load(dataset: Dataset<'r>) -> Result<Self> {
        let children = match dataset.dataset_type() {
            DatasetType::Filesystem | DatasetType::Volume | DatasetType::Pool => {
                list_children(&dataset)?
                    .into_iter()
                    .map(Self::load)
                    .collect::<Result<Vec<_>>>()?
            }
            DatasetType::Snapshot | DatasetType::Bookmark => Vec::new(),
        };
        Ok(DatasetTree { dataset, children })
    }

    pub fn name(&self) -> &str {
        self.dataset.name()
    }

    /// Destroy this dataset. Refused while children are loaded below it.
    pub fn destroy(&self, defer: bool) -> Result<()> {
        if !self.children.is_empty() {
            return Err(Error::InvalidArgument(format!(
                "cannot destroy dataset {}: {} has children",
                self.name(),
                self.dataset.dataset_type()
            )));
        }
        self.dataset.destroy(defer)
    }

    /// The tree's datasets, parents before children.
    pub fn iter(&self) -> impl Iterator<Item = &Dataset<'r>> + '_ {
        let mut stack = vec![self];
        std::iter::from_fn(move || {
            let node = stack.pop()?;
            stack.extend(node.children.iter().rev());
            Some(&node.dataset)
        })
    }

    pub fn find(&self, name: &str) -> Option<&DatasetTree<'r>> {
        if self.name() == name {
            return Some(self);
        }
        self.children.iter().find_map(|child| child.find(name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use zadm_engine::{MemoryEngine, MemoryProbe};

    fn setup() -> (Registry, MemoryProbe) {
        let engine = MemoryEngine::new();
        let probe = engine.probe();
        probe.add_pool("tank").unwrap();
        probe.add_filesystem("tank/a").unwrap();
        probe.add_filesystem("tank/b").unwrap();
        probe.add_snapshot("tank/a@one").unwrap();
        probe.add_bookmark("tank/a@one", "tank/a#mark").unwrap();
        (Registry::new(Box::new(engine)), probe)
    }

    #[test]
    fn children_then_snapshots_then_bookmarks() {
        let (registry, probe) = setup();
        let a = Dataset::open(&registry, "tank/a").unwrap();
        let children = list_children(&a).unwrap();
        assert_eq!(children.names(), vec!["tank/a@one", "tank/a#mark"]);
        drop(children);
        drop(a);
        assert_eq!(probe.open_handles(), 0);
    }

    #[test]
    fn child_failure_discards_partial_results() {
        let (registry, probe) = setup();
        let tank = Dataset::open(&registry, "tank").unwrap();
        probe.fail_after("iter_children:item", 1, ErrorCode::NoMem);
        let err = list_children(&tank).unwrap_err();
        assert_eq!(err.code(), Some(ErrorCode::NoMem));
        drop(tank);
        assert_eq!(probe.open_handles(), 0);
    }

    #[test]
    fn bookmark_failure_is_ignored() {
        let (registry, probe) = setup();
        let a = Dataset::open(&registry, "tank/a").unwrap();
        probe.fail("iter_bookmarks", ErrorCode::Io);
        let children = list_children(&a).unwrap();
        assert_eq!(children.names(), vec!["tank/a@one"]);
    }

    #[test]
    fn roots_fail_as_not_found() {
        let registry = Registry::new(Box::new(MemoryEngine::new()));
        let err = list_roots(&registry).unwrap_err();
        assert_eq!(err.to_string(), "no such pool or dataset");

        let (registry, probe) = setup();
        probe.fail("iter_root", ErrorCode::PoolUnavail);
        let err = list_roots(&registry).unwrap_err();
        assert!(matches!(err, Error::NotFound { code: ErrorCode::PoolUnavail, .. }));
    }

    #[test]
    fn tree_walks_parents_first() {
        let (registry, probe) = setup();
        let trees = DatasetTree::open_all(&registry).unwrap();
        assert_eq!(trees.len(), 1);
        let names: Vec<&str> = trees[0].iter().map(Dataset::name).collect();
        assert_eq!(
            names,
            vec!["tank", "tank/a", "tank/a@one", "tank/a#mark", "tank/b"]
        );
        assert_eq!(probe.open_handles(), 5);
        drop(trees);
        assert_eq!(probe.open_handles(), 0);
    }

    #[test]
    fn tree_destroy_refuses_loaded_children() {
        let (registry, probe) = setup();
        let tree = DatasetTree::open_tree(&registry, "tank/a").unwrap();
        let err = tree.destroy(false).unwrap_err();
        assert_eq!(
            err.to_string(),
            "cannot destroy dataset tank/a: filesystem has children"
        );
        assert!(probe.exists("tank/a"));

        let leaf = tree.find("tank/a#mark").unwrap();
        leaf.destroy(false).unwrap();
        assert!(!probe.exists("tank/a#mark"));
    }
}
