// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::{BitOr, BitOrAssign};
use std::str::FromStr;

/// Kind of object in the dataset hierarchy.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DatasetType {
    Filesystem,
    Snapshot,
    Volume,
    Pool,
    Bookmark,
}

impl DatasetType {
    pub const ALL: [DatasetType; 5] = [
        DatasetType::Filesystem,
        DatasetType::Snapshot,
        DatasetType::Volume,
        DatasetType::Pool,
        DatasetType::Bookmark,
    ];

    pub const fn bit(self) -> u32 {
        match self {
            DatasetType::Filesystem => 1 << 0,
            DatasetType::Snapshot => 1 << 1,
            DatasetType::Volume => 1 << 2,
            DatasetType::Pool => 1 << 3,
            DatasetType::Bookmark => 1 << 4,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            DatasetType::Filesystem => "filesystem",
            DatasetType::Snapshot => "snapshot",
            DatasetType::Volume => "volume",
            DatasetType::Pool => "pool",
            DatasetType::Bookmark => "bookmark",
        }
    }

    /// Infer the kind from a full name: `@` marks a snapshot, `#` a bookmark.
    /// Anything else is reported as a filesystem since volumes cannot be told
    /// apart by name.
    pub fn from_name(name: &str) -> DatasetType {
        if name.contains('@') {
            DatasetType::Snapshot
        } else if name.contains('#') {
            DatasetType::Bookmark
        } else {
            DatasetType::Filesystem
        }
    }
}

impl fmt::Display for DatasetType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DatasetType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "filesystem" | "fs" => Ok(DatasetType::Filesystem),
            "snapshot" | "snap" => Ok(DatasetType::Snapshot),
            "volume" | "vol" => Ok(DatasetType::Volume),
            "pool" => Ok(DatasetType::Pool),
            "bookmark" => Ok(DatasetType::Bookmark),
            other => Err(format!("unknown dataset type '{}'", other)),
        }
    }
}

/// Set of dataset kinds accepted by a lookup or listing.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct TypeMask(u32);

impl TypeMask {
    pub const EMPTY: TypeMask = TypeMask(0);
    /// Filesystems, snapshots and volumes
    pub const DATASET: TypeMask = TypeMask(
        DatasetType::Filesystem.bit() | DatasetType::Snapshot.bit() | DatasetType::Volume.bit(),
    );
    pub const ALL: TypeMask = TypeMask(
        DatasetType::Filesystem.bit()
            | DatasetType::Snapshot.bit()
            | DatasetType::Volume.bit()
            | DatasetType::Pool.bit()
            | DatasetType::Bookmark.bit(),
    );

    pub const fn from_bits(bits: u32) -> TypeMask {
        TypeMask(bits & TypeMask::ALL.0)
    }

    pub const fn bits(self) -> u32 {
        self.0
    }

    pub fn contains(self, kind: DatasetType) -> bool {
        self.0 & kind.bit() != 0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn with(self, kind: DatasetType) -> TypeMask {
        TypeMask(self.0 | kind.bit())
    }

    pub fn iter(self) -> impl Iterator<Item = DatasetType> {
        DatasetType::ALL.into_iter().filter(move |k| self.contains(*k))
    }
}

impl From<DatasetType> for TypeMask {
    fn from(kind: DatasetType) -> Self {
        TypeMask(kind.bit())
    }
}

impl BitOr for TypeMask {
    type Output = TypeMask;

    fn bitor(self, rhs: TypeMask) -> TypeMask {
        TypeMask(self.0 | rhs.0)
    }
}

impl BitOr<DatasetType> for TypeMask {
    type Output = TypeMask;

    fn bitor(self, rhs: DatasetType) -> TypeMask {
        self.with(rhs)
    }
}

impl BitOrAssign for TypeMask {
    fn bitor_assign(&mut self, rhs: TypeMask) {
        self.0 |= rhs.0;
    }
}

impl FromStr for TypeMask {
    type Err = String;

    /// Comma-separated kinds, or `all`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut mask = TypeMask::EMPTY;
        for part in s.split(',').map(str::trim).filter(|p| !p.is_empty()) {
            if part == "all" {
                mask |= TypeMask::ALL;
            } else {
                mask = mask.with(part.parse()?);
            }
        }
        Ok(mask)
    }
}

/// Opaque engine handle for one opened dataset. Valid until passed to
/// `Engine::close`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct RawHandle(u64);

impl RawHandle {
    pub const fn new(id: u64) -> Self {
        RawHandle(id)
    }

    pub const fn id(self) -> u64 {
        self.0
    }
}

/// Opaque engine handle for one opened pool.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct RawPoolHandle(u64);

impl RawPoolHandle {
    pub const fn new(id: u64) -> Self {
        RawPoolHandle(id)
    }

    pub const fn id(self) -> u64 {
        self.0
    }
}

/// Where a native property value comes from, as classified by the engine.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase", tag = "kind", content = "from")]
pub enum PropSource {
    None,
    Default,
    Local,
    Temporary,
    Received,
    /// Inherited from the named ancestor
    Inherited(String),
}

/// Native property value plus its source.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NativeValue {
    pub value: String,
    pub source: PropSource,
}

/// Source marker the engine stores for user properties set by a receive.
pub const RECEIVED_SOURCE_MARKER: &str = "$recvd";

/// One entry of a dataset's user property map as the engine reports it.
///
/// The engine guarantees both fields for every entry it returns; they are
/// optional here so that a broken guarantee can be reported instead of
/// assumed.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct UserPropEntry {
    pub value: Option<String>,
    /// Name of the dataset the value was set on, or
    /// [`RECEIVED_SOURCE_MARKER`]
    pub source: Option<String>,
}

impl UserPropEntry {
    pub fn new(value: impl Into<String>, source: impl Into<String>) -> Self {
        UserPropEntry {
            value: Some(value.into()),
            source: Some(source.into()),
        }
    }
}

/// A user hold on a snapshot.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawHold {
    pub tag: String,
    /// Seconds since the epoch
    pub created: u64,
}

/// Flags for mount calls.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MountFlags {
    /// Mount over a non-empty directory
    pub overlay: bool,
}

/// Flags for unmount calls.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnmountFlags {
    pub force: bool,
}

/// Name of the pool owning `name`: everything before the first `/`, `@`
/// or `#`.
pub fn pool_of_name(name: &str) -> &str {
    match name.find(&['/', '@', '#'][..]) {
        Some(idx) => &name[..idx],
        None => name,
    }
}

/// Filesystem part of a snapshot or bookmark name.
pub fn filesystem_of_name(name: &str) -> &str {
    match name.find(&['@', '#'][..]) {
        Some(idx) => &name[..idx],
        None => name,
    }
}

/// Parent dataset in the slash hierarchy. Snapshots and bookmarks have
/// their filesystem as parent.
pub fn parent_of_name(name: &str) -> Option<&str> {
    if let Some(idx) = name.find(&['@', '#'][..]) {
        return Some(&name[..idx]);
    }
    name.rfind('/').map(|idx| &name[..idx])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn type_mask_membership() {
        let mask = TypeMask::from(DatasetType::Snapshot) | DatasetType::Bookmark;
        assert!(mask.contains(DatasetType::Snapshot));
        assert!(mask.contains(DatasetType::Bookmark));
        assert!(!mask.contains(DatasetType::Filesystem));
        assert_eq!(mask.iter().count(), 2);
        assert!(TypeMask::EMPTY.is_empty());
        assert_eq!(TypeMask::ALL.iter().count(), 5);
    }

    #[test]
    fn type_mask_parses_lists() {
        let mask: TypeMask = "filesystem, snapshot".parse().unwrap();
        assert!(mask.contains(DatasetType::Filesystem));
        assert!(mask.contains(DatasetType::Snapshot));
        assert!(!mask.contains(DatasetType::Volume));
        assert_eq!("all".parse::<TypeMask>().unwrap(), TypeMask::ALL);
        assert!("widget".parse::<TypeMask>().is_err());
    }

    #[test]
    fn name_helpers() {
        assert_eq!(pool_of_name("tank/home/alice@monday"), "tank");
        assert_eq!(pool_of_name("tank#mark"), "tank");
        assert_eq!(pool_of_name("tank"), "tank");
        assert_eq!(filesystem_of_name("tank/home@monday"), "tank/home");
        assert_eq!(parent_of_name("tank/home/alice"), Some("tank/home"));
        assert_eq!(parent_of_name("tank/home@monday"), Some("tank/home"));
        assert_eq!(parent_of_name("tank"), None);
        assert_eq!(DatasetType::from_name("tank/a#b"), DatasetType::Bookmark);
    }
}
