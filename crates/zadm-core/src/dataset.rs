// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Scoped dataset handles.
//!
//! A [`Dataset`] owns exactly one engine handle and closes it when dropped,
//! on every exit path. Pool handles work the same way through
//! [`PoolHandle`].

use crate::error::{Error, Result};
use crate::property::{self, DatasetProperties, PropertyRecord};
use crate::registry::Registry;
use crate::walker::{self, DatasetCollection, DatasetTree};
use chrono::{DateTime, Utc};
use std::collections::VecDeque;
use std::fmt;
use tracing::{debug, info};
use zadm_engine::{
    filesystem_of_name, pool_of_name, DatasetType, MountFlags, PropertySet, RawHandle,
    RawPoolHandle, TypeMask, UnmountFlags, ZfsProp,
};

/// A user hold on a snapshot.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HoldTag {
    pub name: String,
    pub timestamp: DateTime<Utc>,
}

/// One opened dataset: filesystem, volume, snapshot, bookmark or pool root.
pub struct Dataset<'r> {
    registry: &'r Registry,
    handle: RawHandle,
    name: String,
    kind: DatasetType,
    properties: DatasetProperties,
}

impl<'r> Dataset<'r> {
    /// Open `path` whatever kind of dataset it names.
    pub fn open(registry: &'r Registry, path: &str) -> Result<Self> {
        Self::open_typed(registry, path, TypeMask::ALL)
    }

    /// Open `path` as the one kind its name implies: `@` for a snapshot,
    /// `#` for a bookmark, anything else a filesystem, volume or pool.
    pub fn open_single(registry: &'r Registry, path: &str) -> Result<Self> {
        let mask = match DatasetType::from_name(path) {
            DatasetType::Snapshot => TypeMask::from(DatasetType::Snapshot),
            DatasetType::Bookmark => TypeMask::from(DatasetType::Bookmark),
            _ => TypeMask::from(DatasetType::Filesystem) | DatasetType::Volume | DatasetType::Pool,
        };
        Self::open_typed(registry, path, mask)
    }

    fn open_typed(registry: &'r Registry, path: &str, mask: TypeMask) -> Result<Self> {
        let handle = registry
            .call("open", |e| e.open(path, mask))
            .map_err(|err| err.into_not_found(path))?;
        Self::from_raw(registry, handle)
    }

    /// Take ownership of a handle delivered by the engine. The handle is
    /// closed if it cannot be described.
    pub(crate) fn from_raw(registry: &'r Registry, handle: RawHandle) -> Result<Self> {
        let described = registry.call("describe", |e| {
            let name = e.name(handle)?;
            let kind = e.dataset_type(handle)?;
            Ok((name, kind))
        });
        match described {
            Ok((name, kind)) => Ok(Dataset {
                registry,
                handle,
                name,
                kind,
                properties: DatasetProperties::default(),
            }),
            Err(err) => {
                registry.with_engine(|e| e.close(handle));
                Err(err)
            }
        }
    }

    /// Create a filesystem or volume and open it.
    pub fn create(
        registry: &'r Registry,
        path: &str,
        kind: DatasetType,
        props: &PropertySet,
    ) -> Result<Self> {
        registry.call("create", |e| e.create(path, kind, props))?;
        info!(operation = "create", dataset = %path, kind = %kind, "Dataset created");
        Self::open(registry, path)
    }

    /// Take a snapshot named `path` (`fs@snap`) and open it.
    pub fn snapshot(
        registry: &'r Registry,
        path: &str,
        recursive: bool,
        props: &PropertySet,
    ) -> Result<Self> {
        registry.call("snapshot", |e| e.snapshot(path, recursive, props))?;
        info!(operation = "snapshot", snapshot = %path, recursive, "Snapshot taken");
        Self::open_single(registry, path)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current name as the engine reports it.
    pub fn path(&self) -> Result<String> {
        let handle = self.handle;
        self.registry.call("name", |e| e.name(handle))
    }

    pub fn dataset_type(&self) -> DatasetType {
        self.kind
    }

    pub fn is_snapshot(&self) -> bool {
        self.kind == DatasetType::Snapshot
    }

    pub fn pool_name(&self) -> &str {
        pool_of_name(&self.name)
    }

    pub fn pool(&self) -> Result<PoolHandle<'r>> {
        let handle = self.handle;
        let registry = self.registry;
        let pool = registry.call("pool_of", |e| e.pool_of(handle))?;
        match registry.call("pool_name", |e| e.pool_name(pool)) {
            Ok(name) => Ok(PoolHandle {
                registry,
                handle: pool,
                name,
            }),
            Err(err) => {
                registry.with_engine(|e| e.close_pool(pool));
                Err(err)
            }
        }
    }

    pub(crate) fn raw(&self) -> RawHandle {
        self.handle
    }

    pub(crate) fn registry(&self) -> &'r Registry {
        self.registry
    }

    pub fn properties(&self) -> &DatasetProperties {
        &self.properties
    }

    /// Re-read every applicable native property.
    pub fn reload_properties(&mut self) -> Result<()> {
        self.properties = DatasetProperties::load(self)?;
        Ok(())
    }

    pub fn get_property(&self, prop: ZfsProp) -> Result<PropertyRecord> {
        property::get_property(self, prop)
    }

    pub fn get_user_property(&self, name: &str) -> Result<PropertyRecord> {
        property::get_user_property(self, name)
    }

    /// Set a native property and return its value as read back.
    pub fn set_property(&mut self, prop: ZfsProp, value: &str) -> Result<PropertyRecord> {
        let handle = self.handle;
        self.registry
            .call("prop_set", |e| e.prop_set(handle, prop.name(), value))?;
        info!(operation = "set_property", dataset = %self.name, property = %prop, value = %value, "Property set");
        let record = self.get_property(prop)?;
        self.properties.insert(record.clone());
        Ok(record)
    }

    pub fn set_user_property(&self, name: &str, value: &str) -> Result<()> {
        let handle = self.handle;
        self.registry
            .call("prop_set", |e| e.prop_set(handle, name, value))?;
        info!(operation = "set_user_property", dataset = %self.name, property = %name, "User property set");
        Ok(())
    }

    /// Destroy this dataset. With `defer`, a snapshot that still has
    /// clones or holds is marked for destruction instead.
    pub fn destroy(&self, defer: bool) -> Result<()> {
        let handle = self.handle;
        self.registry.call("destroy", |e| e.destroy(handle, defer))?;
        info!(operation = "destroy", dataset = %self.name, defer, "Dataset destroyed");
        Ok(())
    }

    /// Destroy everything depending on this dataset, deepest first, then
    /// the dataset itself.
    pub fn destroy_recursive(&self) -> Result<()> {
        let handle = self.handle;
        let (handles, result) = walker::collect_handles(self.registry, "iter_dependents", |e, visit| {
            e.iter_dependents(handle, true, visit)
        });
        let dependents = walker::adopt(self.registry, handles)?;
        result?;
        debug!(operation = "destroy_recursive", dataset = %self.name, dependents = dependents.len(), "Destroying dependents");
        for dependent in dependents.iter().rev() {
            dependent.destroy(false)?;
        }
        self.destroy(false)
    }

    /// Destroy this filesystem after promoting its newest clone, so the
    /// clone survives. Snapshots moved to the clone by the promotion are
    /// destroyed afterwards.
    pub fn destroy_promote(&self) -> Result<()> {
        let clones = self.clones()?;
        let Some(youngest) = self.youngest_clone(&clones)? else {
            return self.destroy_recursive();
        };
        let clone = Dataset::open(self.registry, &youngest)?;

        let base = self.name.rsplit_once('/').map_or(self.name.as_str(), |(_, base)| base);
        let mut moved = Vec::new();
        for snapshot in self.snapshots()?.iter() {
            let short = short_snapshot_name(snapshot.name()).to_string();
            let short = if clone.find_snapshot_name(&short)?.is_some() {
                // name clash on the clone: `a` becomes `a.<base>`
                let renamed = format!("{}.{}", short, base);
                let mut snapshot = Dataset::open(self.registry, snapshot.name())?;
                snapshot.rename(&format!("{}@{}", self.name, renamed), false, false)?;
                renamed
            } else {
                short
            };
            moved.push(short);
        }

        clone.promote()?;
        self.destroy_recursive()?;

        for short in moved {
            if let Some(snapshot) = clone.find_snapshot_name(&short)? {
                snapshot.destroy_recursive()?;
            }
        }
        Ok(())
    }

    fn youngest_clone(&self, clones: &[String]) -> Result<Option<String>> {
        let mut youngest: Option<(u64, String)> = None;
        for name in clones {
            let clone = Dataset::open(self.registry, name)?;
            let origin = clone.get_property(ZfsProp::Origin)?.value;
            if filesystem_of_name(&origin) != self.name {
                continue;
            }
            let origin = Dataset::open(self.registry, &origin)?;
            let txg = origin.get_property(ZfsProp::CreateTxg)?.value.parse().unwrap_or(0);
            if youngest.as_ref().map_or(true, |(best, _)| txg > *best) {
                youngest = Some((txg, name.clone()));
            }
        }
        Ok(youngest.map(|(_, name)| name))
    }

    /// Clone this snapshot to `target`.
    pub fn create_clone(&self, target: &str, props: &PropertySet) -> Result<Dataset<'r>> {
        if !self.is_snapshot() {
            return Err(Error::InvalidArgument(format!(
                "cannot clone '{}': can only clone snapshots",
                self.name
            )));
        }
        let handle = self.handle;
        self.registry
            .call("clone", |e| e.clone_snapshot(handle, target, props))?;
        info!(operation = "clone", snapshot = %self.name, target = %target, "Snapshot cloned");
        Dataset::open(self.registry, target)
    }

    /// Roll this filesystem back to `snapshot`, its most recent snapshot.
    pub fn rollback(&self, snapshot: &Dataset<'_>, force: bool) -> Result<()> {
        let (handle, snap) = (self.handle, snapshot.handle);
        self.registry
            .call("rollback", |e| e.rollback(handle, snap, force))?;
        info!(operation = "rollback", dataset = %self.name, snapshot = %snapshot.name, "Dataset rolled back");
        Ok(())
    }

    pub fn promote(&self) -> Result<()> {
        let handle = self.handle;
        self.registry.call("promote", |e| e.promote(handle))?;
        info!(operation = "promote", dataset = %self.name, "Clone promoted");
        Ok(())
    }

    pub fn rename(&mut self, new_name: &str, recursive: bool, force_unmount: bool) -> Result<()> {
        let handle = self.handle;
        self.registry.call("rename", |e| {
            e.rename(handle, new_name, recursive, force_unmount)
        })?;
        info!(operation = "rename", dataset = %self.name, new_name = %new_name, "Dataset renamed");
        self.name = new_name.to_string();
        Ok(())
    }

    /// Mountpoint, when mounted.
    pub fn is_mounted(&self) -> Result<Option<String>> {
        let handle = self.handle;
        self.registry.call("is_mounted", |e| e.is_mounted(handle))
    }

    pub fn mount(&self, options: Option<&str>, flags: MountFlags) -> Result<()> {
        let handle = self.handle;
        self.registry
            .call("mount", |e| e.mount(handle, options, flags))?;
        info!(operation = "mount", dataset = %self.name, "Dataset mounted");
        Ok(())
    }

    pub fn unmount(&self, flags: UnmountFlags) -> Result<()> {
        let handle = self.handle;
        self.registry.call("unmount", |e| e.unmount(handle, flags))?;
        info!(operation = "unmount", dataset = %self.name, "Dataset unmounted");
        Ok(())
    }

    pub fn unmount_all(&self, flags: UnmountFlags) -> Result<()> {
        let handle = self.handle;
        self.registry
            .call("unmount_all", |e| e.unmount_all(handle, flags))?;
        info!(operation = "unmount_all", dataset = %self.name, "Dataset tree unmounted");
        Ok(())
    }

    fn require_snapshot(&self) -> Result<()> {
        if self.is_snapshot() {
            Ok(())
        } else {
            Err(Error::InvalidArgument(format!(
                "'{}' is not a snapshot",
                self.name
            )))
        }
    }

    pub fn hold(&self, tag: &str) -> Result<()> {
        self.require_snapshot()?;
        let handle = self.handle;
        self.registry.call("hold", |e| e.hold(handle, tag, false))?;
        info!(operation = "hold", snapshot = %self.name, tag = %tag, "Hold placed");
        Ok(())
    }

    pub fn release(&self, tag: &str) -> Result<()> {
        self.require_snapshot()?;
        let handle = self.handle;
        self.registry
            .call("release", |e| e.release(handle, tag, false))?;
        info!(operation = "release", snapshot = %self.name, tag = %tag, "Hold released");
        Ok(())
    }

    pub fn holds(&self) -> Result<Vec<HoldTag>> {
        self.require_snapshot()?;
        let handle = self.handle;
        let holds = self.registry.call("holds", |e| e.holds(handle))?;
        Ok(holds
            .into_iter()
            .map(|hold| HoldTag {
                name: hold.tag,
                timestamp: i64::try_from(hold.created)
                    .ok()
                    .and_then(|secs| DateTime::<Utc>::from_timestamp(secs, 0))
                    .unwrap_or_default(),
            })
            .collect())
    }

    /// Snapshots of this filesystem or volume, oldest first.
    pub fn snapshots(&self) -> Result<DatasetCollection<'r>> {
        let handle = self.handle;
        let (handles, result) = walker::collect_handles(self.registry, "iter_snapshots", |e, visit| {
            e.iter_snapshots(handle, visit)
        });
        let snapshots = walker::adopt(self.registry, handles)?;
        result?;
        Ok(DatasetCollection::from(snapshots))
    }

    /// The snapshot of this dataset with full name `path`.
    pub fn find_snapshot(&self, path: &str) -> Result<Option<Dataset<'r>>> {
        Ok(self
            .snapshots()?
            .into_iter()
            .find(|snapshot| snapshot.name() == path))
    }

    /// The snapshot of this dataset called `short`, with or without its
    /// leading `@`.
    pub fn find_snapshot_name(&self, short: &str) -> Result<Option<Dataset<'r>>> {
        let short = short.trim_start_matches('@');
        self.find_snapshot(&format!("{}@{}", self.name, short))
    }

    /// Every filesystem or volume in the pool cloned from this dataset or
    /// its snapshots, and clones of those clones, breadth first.
    pub fn clones(&self) -> Result<Vec<String>> {
        let tree = DatasetTree::open_tree(self.registry, self.pool_name())?;
        let mut origins = Vec::new();
        for dataset in tree.iter() {
            if matches!(
                dataset.dataset_type(),
                DatasetType::Filesystem | DatasetType::Volume
            ) {
                let origin = dataset.get_property(ZfsProp::Origin)?.value;
                if origin != "-" && !origin.is_empty() {
                    origins.push((dataset.name().to_string(), origin));
                }
            }
        }

        let mut clones = Vec::new();
        let mut queue = VecDeque::from([self.name.clone()]);
        while let Some(current) = queue.pop_front() {
            for (name, origin) in &origins {
                let from_current = if current.contains('@') {
                    *origin == current
                } else {
                    filesystem_of_name(origin) == current
                };
                if from_current && !clones.contains(name) {
                    clones.push(name.clone());
                    queue.push_back(name.clone());
                }
            }
        }
        Ok(clones)
    }
}

impl Drop for Dataset<'_> {
    fn drop(&mut self) {
        let handle = self.handle;
        self.registry.with_engine(|e| e.close(handle));
    }
}

impl fmt::Debug for Dataset<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dataset")
            .field("name", &self.name)
            .field("type", &self.kind)
            .finish_non_exhaustive()
    }
}

/// Pool that owns a dataset; closed on drop independently of the dataset.
pub struct PoolHandle<'r> {
    registry: &'r Registry,
    handle: RawPoolHandle,
    name: String,
}

impl PoolHandle<'_> {
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl Drop for PoolHandle<'_> {
    fn drop(&mut self) {
        let handle = self.handle;
        self.registry.with_engine(|e| e.close_pool(handle));
    }
}

fn short_snapshot_name(name: &str) -> &str {
    name.split_once('@').map_or(name, |(_, short)| short)
}

#[cfg(test)]
mod tests {
    use super::*;
    use zadm_engine::{ErrorCode, MemoryEngine, MemoryProbe};

    fn setup() -> (Registry, MemoryProbe) {
        let engine = MemoryEngine::new();
        let probe = engine.probe();
        probe.add_pool("tank").unwrap();
        probe.add_filesystem("tank/fs").unwrap();
        probe.add_snapshot("tank/fs@a").unwrap();
        probe.add_snapshot("tank/fs@b").unwrap();
        (Registry::new(Box::new(engine)), probe)
    }

    #[test]
    fn open_and_drop_release_the_handle() {
        let (registry, probe) = setup();
        {
            let ds = Dataset::open(&registry, "tank/fs").unwrap();
            assert_eq!(ds.name(), "tank/fs");
            assert_eq!(ds.dataset_type(), DatasetType::Filesystem);
            assert_eq!(ds.pool_name(), "tank");
            assert_eq!(probe.open_handles(), 1);
        }
        assert_eq!(probe.open_handles(), 0);
        assert_eq!(probe.double_closes(), 0);
    }

    #[test]
    fn missing_names_are_not_found() {
        let (registry, probe) = setup();
        let err = Dataset::open(&registry, "tank/nope").unwrap_err();
        assert!(matches!(err, Error::NotFound { code: ErrorCode::NoEnt, .. }));
        assert_eq!(probe.open_handles(), 0);
    }

    #[test]
    fn open_single_respects_the_name_kind() {
        let (registry, _probe) = setup();
        let snap = Dataset::open_single(&registry, "tank/fs@a").unwrap();
        assert!(snap.is_snapshot());
        assert!(Dataset::open_single(&registry, "tank/fs@zzz").is_err());
    }

    #[test]
    fn pool_handle_is_closed_independently() {
        let (registry, probe) = setup();
        let ds = Dataset::open(&registry, "tank/fs@a").unwrap();
        let pool = ds.pool().unwrap();
        assert_eq!(pool.name(), "tank");
        drop(ds);
        assert_eq!(probe.open_pool_handles(), 1);
        drop(pool);
        assert_eq!(probe.open_pool_handles(), 0);
    }

    #[test]
    fn holds_are_snapshot_only() {
        let (registry, _probe) = setup();
        let fs = Dataset::open(&registry, "tank/fs").unwrap();
        let err = fs.hold("keep").unwrap_err();
        assert_eq!(err.to_string(), "'tank/fs' is not a snapshot");

        let snap = Dataset::open(&registry, "tank/fs@a").unwrap();
        snap.hold("keep").unwrap();
        let holds = snap.holds().unwrap();
        assert_eq!(holds.len(), 1);
        assert_eq!(holds[0].name, "keep");
        assert!(holds[0].timestamp.timestamp() > 0);
        snap.release("keep").unwrap();
        assert!(snap.holds().unwrap().is_empty());
    }

    #[test]
    fn set_property_returns_the_new_value() {
        let (registry, _probe) = setup();
        let mut fs = Dataset::open(&registry, "tank/fs").unwrap();
        let record = fs.set_property(ZfsProp::Compression, "lz4").unwrap();
        assert_eq!(record.value, "lz4");
        assert_eq!(record.source, "local");
        assert_eq!(fs.properties().get(ZfsProp::Compression), Some(&record));
    }

    #[test]
    fn snapshot_discovery() {
        let (registry, _probe) = setup();
        let fs = Dataset::open(&registry, "tank/fs").unwrap();
        assert_eq!(fs.snapshots().unwrap().names(), vec!["tank/fs@a", "tank/fs@b"]);
        assert!(fs.find_snapshot("tank/fs@b").unwrap().is_some());
        assert!(fs.find_snapshot_name("@a").unwrap().is_some());
        assert!(fs.find_snapshot_name("c").unwrap().is_none());
    }

    #[test]
    fn clone_requires_a_snapshot_and_clones_are_found() {
        let (registry, probe) = setup();
        let fs = Dataset::open(&registry, "tank/fs").unwrap();
        assert!(fs.create_clone("tank/c", &PropertySet::new()).is_err());

        let snap = Dataset::open(&registry, "tank/fs@a").unwrap();
        let clone = snap.create_clone("tank/c", &PropertySet::new()).unwrap();
        assert_eq!(probe.origin("tank/c").as_deref(), Some("tank/fs@a"));
        let nested = Dataset::snapshot(&registry, "tank/c@x", false, &PropertySet::new()).unwrap();
        nested.create_clone("tank/cc", &PropertySet::new()).unwrap();

        assert_eq!(fs.clones().unwrap(), vec!["tank/c", "tank/cc"]);
        assert_eq!(clone.clones().unwrap(), vec!["tank/cc"]);
    }

    #[test]
    fn rename_tracks_the_new_name() {
        let (registry, probe) = setup();
        let mut fs = Dataset::open(&registry, "tank/fs").unwrap();
        fs.rename("tank/renamed", false, false).unwrap();
        assert_eq!(fs.name(), "tank/renamed");
        assert_eq!(fs.path().unwrap(), "tank/renamed");
        assert!(probe.exists("tank/renamed@a"));
    }

    #[test]
    fn destroy_recursive_removes_dependents_first() {
        let (registry, probe) = setup();
        probe.add_filesystem("tank/fs/child").unwrap();
        probe.add_snapshot("tank/fs/child@a").unwrap();
        let fs = Dataset::open(&registry, "tank/fs").unwrap();
        fs.destroy_recursive().unwrap();
        drop(fs);
        assert_eq!(probe.dataset_names(), vec!["tank"]);
        assert_eq!(probe.open_handles(), 0);
    }

    #[test]
    fn destroy_promote_keeps_the_clone() {
        let (registry, probe) = setup();
        probe.add_clone("tank/fs@a", "tank/c").unwrap();
        let fs = Dataset::open(&registry, "tank/fs").unwrap();
        fs.destroy_promote().unwrap();
        drop(fs);
        assert!(!probe.exists("tank/fs"));
        assert!(probe.exists("tank/c"));
        assert!(!probe.exists("tank/c@a"));
        assert_eq!(probe.origin("tank/c"), None);
        assert_eq!(probe.open_handles(), 0);
    }

    #[test]
    fn destroy_promote_renames_clashing_snapshots_after_the_filesystem() {
        let (registry, probe) = setup();
        probe.add_clone("tank/fs@b", "tank/c").unwrap();
        probe.add_snapshot("tank/c@a").unwrap();
        let fs = Dataset::open(&registry, "tank/fs").unwrap();

        probe.fail("promote", ErrorCode::Busy);
        assert_eq!(fs.destroy_promote().unwrap_err().code(), Some(ErrorCode::Busy));
        assert!(probe.exists("tank/fs@a.fs"));
        assert!(!probe.exists("tank/fs@a"));

        probe.clear_failures();
        fs.destroy_promote().unwrap();
        drop(fs);
        assert!(!probe.exists("tank/fs"));
        assert!(probe.exists("tank/c@a"));
        assert!(!probe.exists("tank/c@a.fs"));
        assert!(!probe.exists("tank/c@b"));
        assert_eq!(probe.open_handles(), 0);
    }

    #[test]
    fn mount_cycle() {
        let (registry, _probe) = setup();
        let fs = Dataset::open(&registry, "tank/fs").unwrap();
        assert_eq!(fs.is_mounted().unwrap(), None);
        fs.mount(None, MountFlags::default()).unwrap();
        assert_eq!(fs.is_mounted().unwrap().as_deref(), Some("/tank/fs"));
        fs.unmount_all(UnmountFlags::default()).unwrap();
        assert_eq!(fs.is_mounted().unwrap(), None);
    }
}
