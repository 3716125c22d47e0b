// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Name listing with type filtering and depth limits.

use crate::dataset::Dataset;
use crate::error::Result;
use crate::registry::Registry;
use crate::walker::{self, DatasetCollection};
use serde::{Deserialize, Serialize};
use zadm_engine::{DatasetType, TypeMask};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListOptions {
    #[serde(with = "mask_names")]
    pub types: TypeMask,
    pub recursive: bool,
    /// Levels to descend below each starting point; implies recursion
    pub depth: Option<u32>,
    /// Starting points; all pools when empty
    pub paths: Vec<String>,
}

impl Default for ListOptions {
    fn default() -> Self {
        ListOptions {
            types: TypeMask::from(DatasetType::Filesystem) | DatasetType::Volume,
            recursive: false,
            depth: None,
            paths: Vec::new(),
        }
    }
}

impl ListOptions {
    fn descends(&self, remaining: Option<u32>) -> bool {
        match remaining {
            Some(levels) => levels > 0,
            None => self.recursive,
        }
    }

    /// Only snapshots or bookmarks were asked for: their parents are
    /// walked but not listed.
    fn wants_only_marks(&self) -> bool {
        let marks = TypeMask::from(DatasetType::Snapshot) | DatasetType::Bookmark;
        let containers =
            TypeMask::from(DatasetType::Filesystem) | DatasetType::Volume | DatasetType::Pool;
        self.types.bits() & marks.bits() != 0 && self.types.bits() & containers.bits() == 0
    }
}

/// Names matching `options`, parents before children.
pub fn list(registry: &Registry, options: &ListOptions) -> Result<Vec<String>> {
    let starts: DatasetCollection<'_> = if options.paths.is_empty() {
        walker::list_roots(registry)?
    } else {
        options
            .paths
            .iter()
            .map(|path| Dataset::open(registry, path))
            .collect::<Result<Vec<_>>>()?
            .into()
    };

    let mut names = Vec::new();
    for dataset in &starts {
        visit(dataset, options, options.depth, true, &mut names)?;
    }
    Ok(names)
}

fn visit(
    dataset: &Dataset<'_>,
    options: &ListOptions,
    remaining: Option<u32>,
    start: bool,
    names: &mut Vec<String>,
) -> Result<()> {
    let kind = dataset.dataset_type();
    let is_pool_root = !dataset.name().contains(&['/', '@', '#'][..]);
    if options.types.contains(kind) || (is_pool_root && options.types.contains(DatasetType::Pool))
    {
        names.push(dataset.name().to_string());
    }

    if !matches!(kind, DatasetType::Filesystem | DatasetType::Volume) {
        return Ok(());
    }
    let descend = options.descends(remaining);
    // `-t snapshot fs` lists the snapshots of fs without -r
    let marks_only = !descend && start && options.wants_only_marks();
    if !descend && !marks_only {
        return Ok(());
    }

    let next = remaining.map(|levels| levels.saturating_sub(1));
    for child in &walker::list_children(dataset)? {
        let child_kind = child.dataset_type();
        if marks_only && !matches!(child_kind, DatasetType::Snapshot | DatasetType::Bookmark) {
            continue;
        }
        visit(child, options, next, false, names)?;
    }
    Ok(())
}

mod mask_names {
    use serde::{Deserialize, Deserializer, Serializer};
    use zadm_engine::TypeMask;

    pub fn serialize<S: Serializer>(mask: &TypeMask, serializer: S) -> Result<S::Ok, S::Error> {
        let names: Vec<&str> = mask.iter().map(|kind| kind.as_str()).collect();
        serializer.serialize_str(&names.join(","))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<TypeMask, D::Error> {
        let text = String::deserialize(deserializer)?;
        text.parse().map_err(serde::de::Error::custom)
    }
}
