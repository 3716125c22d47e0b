// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

use crate::dataset::Dataset;
use crate::error::{Error, Result};
use crate::registry::Registry;
use tracing::info;
use zadm_engine::{filesystem_of_name, DatasetType};

/// Bookmark `source` (a snapshot or another bookmark) as `<fs>#<name>` and
/// open the new bookmark.
pub fn create_bookmark<'r>(registry: &'r Registry, source: &str, name: &str) -> Result<Dataset<'r>> {
    let source = Dataset::open(registry, source)?;
    if !matches!(
        source.dataset_type(),
        DatasetType::Snapshot | DatasetType::Bookmark
    ) {
        return Err(Error::InvalidArgument(format!(
            "invalid source {} must be snapshot or bookmark",
            source.name()
        )));
    }
    let short = name.rsplit('#').next().unwrap_or(name);
    let bookmark = format!("{}#{}", filesystem_of_name(source.name()), short);

    registry.call("bookmark", |e| e.bookmark(source.name(), &bookmark))?;
    info!(operation = "bookmark", source = %source.name(), bookmark = %bookmark, "Bookmark created");
    Dataset::open(registry, &bookmark)
}

#[cfg(test)]
mod tests {
    use super::*;
    use zadm_engine::MemoryEngine;

    #[test]
    fn bookmarks_snapshots_and_bookmarks() {
        let engine = MemoryEngine::new();
        let probe = engine.probe();
        probe.add_pool("tank").unwrap();
        probe.add_filesystem("tank/fs").unwrap();
        probe.add_snapshot("tank/fs@a").unwrap();
        let registry = Registry::new(Box::new(engine));

        let first = create_bookmark(&registry, "tank/fs@a", "keep").unwrap();
        assert_eq!(first.name(), "tank/fs#keep");
        assert_eq!(first.dataset_type(), DatasetType::Bookmark);

        let second = create_bookmark(&registry, "tank/fs#keep", "again").unwrap();
        assert_eq!(second.name(), "tank/fs#again");

        let err = create_bookmark(&registry, "tank/fs", "nope").unwrap_err();
        assert_eq!(
            err.to_string(),
            "invalid source tank/fs must be snapshot or bookmark"
        );
        drop((first, second));
        assert_eq!(probe.open_handles(), 0);
    }
}
