// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Listing, property and lifecycle commands

use crate::output::Output;
use anyhow::{Context, Result};
use clap::Args;
use serde_json::json;
use tracing::debug;
use zadm_core::{destroy, Dataset, DestroyOptions, ListOptions, PropertyRecord, Registry};
use zadm_engine::{DatasetType, PropertySet, TypeMask, ZfsProp};

#[derive(Args, Clone, Debug)]
#[command(about = "List datasets")]
pub struct ListArgs {
    /// Descend into children
    #[arg(short = 'r', long)]
    pub recursive: bool,

    /// Levels to descend; implies -r
    #[arg(short = 'd', long)]
    pub depth: Option<u32>,

    /// Comma-separated kinds: filesystem, snapshot, volume, bookmark, pool or all
    #[arg(short = 't', long = "type")]
    pub types: Option<TypeMask>,

    /// Starting datasets (default: every pool)
    pub paths: Vec<String>,
}

impl ListArgs {
    pub fn run(&self, registry: &Registry, out: &mut Output<'_>) -> Result<()> {
        let mut options = ListOptions {
            recursive: self.recursive,
            depth: self.depth,
            paths: self.paths.clone(),
            ..Default::default()
        };
        if let Some(types) = self.types {
            options.types = types;
        }
        let names = zadm_core::list(registry, &options).context("cannot list datasets")?;
        let rows: Vec<Vec<String>> = names.iter().map(|n| vec![n.clone()]).collect();
        out.emit(&rows, json!(names))
    }
}

#[derive(Args, Clone, Debug)]
#[command(about = "Show one property with its source")]
pub struct GetArgs {
    /// Native, user (`module:name`), `userquota@...` or `written@...` property
    pub property: String,
    pub dataset: String,
}

impl GetArgs {
    pub fn run(&self, registry: &Registry, out: &mut Output<'_>) -> Result<()> {
        let dataset = Dataset::open(registry, &self.dataset)?;
        let record: PropertyRecord = match ZfsProp::from_name(&self.property) {
            Some(prop) => dataset.get_property(prop),
            None => dataset.get_user_property(&self.property),
        }
        .with_context(|| format!("cannot get '{}' of '{}'", self.property, self.dataset))?;
        debug!(dataset = %self.dataset, property = %self.property, source = %record.source, "Property read");

        let row = vec![
            dataset.name().to_string(),
            self.property.clone(),
            record.value.clone(),
            record.source.clone(),
        ];
        out.emit(
            &[row],
            json!({
                "name": dataset.name(),
                "property": self.property,
                "value": record.value,
                "source": record.source,
            }),
        )
    }
}

#[derive(Args, Clone, Debug)]
#[command(about = "Take a snapshot")]
pub struct SnapshotArgs {
    /// Snapshot every descendant too
    #[arg(short = 'r', long)]
    pub recursive: bool,

    /// `filesystem@name`
    pub name: String,
}

impl SnapshotArgs {
    pub fn run(&self, registry: &Registry, out: &mut Output<'_>) -> Result<()> {
        let snapshot = Dataset::snapshot(registry, &self.name, self.recursive, &PropertySet::new())?;
        out.emit(&[vec![snapshot.name().to_string()]], json!({ "created": snapshot.name() }))
    }
}

#[derive(Args, Clone, Debug)]
#[command(about = "Bookmark a snapshot or bookmark")]
pub struct BookmarkArgs {
    pub source: String,
    /// New bookmark, `name` or `filesystem#name`
    pub name: String,
}

impl BookmarkArgs {
    pub fn run(&self, registry: &Registry, out: &mut Output<'_>) -> Result<()> {
        let bookmark = zadm_core::create_bookmark(registry, &self.source, &self.name)?;
        out.emit(&[vec![bookmark.name().to_string()]], json!({ "created": bookmark.name() }))
    }
}

#[derive(Args, Clone, Debug)]
#[command(about = "Destroy a dataset, or snapshots selected by fs@spec")]
pub struct DestroyArgs {
    /// Mark for destruction once the last dependent is gone
    #[arg(long)]
    pub defer: bool,

    pub name: String,
}

impl DestroyArgs {
    pub fn run(&self, registry: &Registry, out: &mut Output<'_>) -> Result<()> {
        let destroyed = if self.name.contains('@') {
            zadm_core::destroy_snapshots(registry, &self.name, self.defer)?
        } else {
            let dataset = Dataset::open(registry, &self.name)?;
            if dataset.dataset_type() == DatasetType::Pool {
                anyhow::bail!("cannot destroy '{}': operation does not apply to pools", self.name);
            }
            destroy::destroy(&dataset, DestroyOptions { defer: self.defer })?;
            vec![dataset.name().to_string()]
        };
        let rows: Vec<Vec<String>> = destroyed.iter().map(|n| vec![n.clone()]).collect();
        out.emit(&rows, json!({ "destroyed": destroyed, "defer": self.defer }))
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
        probe.add_filesystem("tank/home").unwrap();
        probe.add_snapshot("tank/home@mon").unwrap();
        probe.add_snapshot("tank/home@tue").unwrap();
        (Registry::new(Box::new(engine)), probe)
    }

    fn text(f: impl FnOnce(&mut Output<'_>) -> Result<()>) -> String {
        let mut buf = Vec::new();
        f(&mut Output::new(&mut buf, false)).unwrap();
        String::from_utf8(buf).unwrap()
    }

    #[test]
    fn list_prints_one_name_per_line() {
        let (registry, _probe) = setup();
        let args = ListArgs {
            recursive: true,
            depth: None,
            types: Some(TypeMask::ALL),
            paths: vec!["tank/home".into()],
        };
        let printed = text(|out| args.run(&registry, out));
        assert_eq!(printed, "tank/home\ntank/home@mon\ntank/home@tue\n");
    }

    #[test]
    fn get_reads_user_and_native_properties() {
        let (registry, probe) = setup();
        probe.set_local("tank", "org:team", "storage").unwrap();
        let args = GetArgs {
            property: "org:team".into(),
            dataset: "tank/home".into(),
        };
        let printed = text(|out| args.run(&registry, out));
        assert_eq!(printed, "tank/home\torg:team\tstorage\tinherited:tank\n");

        let args = GetArgs {
            property: "type".into(),
            dataset: "tank/home@mon".into(),
        };
        let mut buf = Vec::new();
        args.run(&registry, &mut Output::new(&mut buf, true)).unwrap();
        let value: serde_json::Value = serde_json::from_slice(&buf).unwrap();
        assert_eq!(value["value"], "snapshot");
    }

    #[test]
    fn destroy_routes_snapspecs_and_datasets() {
        let (registry, probe) = setup();
        let args = DestroyArgs {
            defer: false,
            name: "tank/home@mon,tue".into(),
        };
        let printed = text(|out| args.run(&registry, out));
        assert_eq!(printed, "tank/home@mon\ntank/home@tue\n");

        let args = DestroyArgs {
            defer: false,
            name: "tank/home".into(),
        };
        text(|out| args.run(&registry, out));
        assert!(!probe.exists("tank/home"));
        assert_eq!(probe.open_handles(), 0);
    }

    #[test]
    fn snapshot_then_bookmark() {
        let (registry, probe) = setup();
        let snap = SnapshotArgs {
            recursive: false,
            name: "tank/home@wed".into(),
        };
        assert_eq!(text(|out| snap.run(&registry, out)), "tank/home@wed\n");

        let book = BookmarkArgs {
            source: "tank/home@wed".into(),
            name: "wed".into(),
        };
        assert_eq!(text(|out| book.run(&registry, out)), "tank/home#wed\n");
        assert!(probe.exists("tank/home#wed"));
    }
}
