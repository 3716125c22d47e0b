// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Dependency-aware destruction.
//!
//! A snapshot with clones cannot simply be destroyed. Before touching the
//! engine, the destroyer asks for every dependent and reports their names
//! instead of proceeding, unless deferred destruction was requested.

use crate::dataset::Dataset;
use crate::error::{Error, Result};
use crate::registry::Registry;
use crate::walker;
use std::ops::ControlFlow;
use tracing::{debug, info};
use zadm_engine::{DatasetType, ErrorCode, RawHandle, TypeMask};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DestroyOptions {
    /// Mark for destruction once the last dependent is gone
    pub defer: bool,
}

/// Names of every dataset depending on `dataset`, dependents of
/// dependents included.
pub fn check_dependents(dataset: &Dataset<'_>) -> Result<Vec<String>> {
    let registry = dataset.registry();
    let handle = dataset.raw();
    let mut names = Vec::new();
    registry.call("iter_dependents", |e| {
        let mut delivered: Vec<RawHandle> = Vec::new();
        let result = e.iter_dependents(handle, true, &mut |dep: RawHandle| {
            delivered.push(dep);
            ControlFlow::Continue(())
        });
        let mut unnamed = None;
        for dep in delivered {
            match e.name(dep) {
                Ok(name) => names.push(name),
                Err(code) => unnamed = Some(code),
            }
            e.close(dep);
        }
        result?;
        unnamed.map_or(Ok(()), Err)
    })?;
    debug!(operation = "check_dependents", dataset = %dataset.name(), dependents = names.len(), "Dependents collected");
    Ok(names)
}

/// Destroy `dataset` unless something depends on it.
pub fn destroy(dataset: &Dataset<'_>, options: DestroyOptions) -> Result<()> {
    if options.defer {
        return dataset.destroy(true);
    }
    let dependents = check_dependents(dataset)?;
    if !dependents.is_empty() {
        info!(operation = "destroy", dataset = %dataset.name(), dependents = ?dependents, "Destroy blocked by dependents");
        return Err(Error::DependentsExist {
            target: dataset.name().to_string(),
            dependents,
        });
    }
    dataset.destroy(false)
}

/// Destroy the snapshots selected by `path`, written `fs@spec` where the
/// spec is a snapshot name, a comma list, or a `from%to` range.
pub fn destroy_snapshots(registry: &Registry, path: &str, defer: bool) -> Result<Vec<String>> {
    let Some((parent, spec)) = path.split_once('@') else {
        return Err(Error::InvalidArgument(format!(
            "'{}' is not a snapshot specification",
            path
        )));
    };
    let filesystem = Dataset::open_single(registry, parent)?;
    if !matches!(
        filesystem.dataset_type(),
        DatasetType::Filesystem | DatasetType::Volume | DatasetType::Pool
    ) {
        return Err(Error::InvalidArgument(format!(
            "'{}' is not a filesystem or volume",
            parent
        )));
    }

    let handle = filesystem.raw();
    let (handles, result) = walker::collect_handles(registry, "iter_snapspec", |e, visit| {
        e.iter_snapspec(handle, spec, visit)
    });
    let selected = walker::adopt(registry, handles)?;
    match result {
        Err(err) if err.code() == Some(ErrorCode::NoEnt) => {
            debug!(operation = "destroy_snapshots", parent = %parent, spec = %spec, "Some snapshot names did not match");
        }
        other => other?,
    }

    if !defer {
        for snapshot in &selected {
            let dependents = check_dependents(snapshot)?;
            if !dependents.is_empty() {
                return Err(Error::DependentsExist {
                    target: snapshot.name().to_string(),
                    dependents,
                });
            }
        }
    }
    if selected.is_empty() {
        return Err(Error::InvalidArgument(
            "could not find any snapshots to destroy; check snapshot names.".to_string(),
        ));
    }

    let names: Vec<String> = selected.iter().map(|s| s.name().to_string()).collect();
    drop(selected);
    registry.call("destroy_snaps", |e| e.destroy_snaps(&names, defer))?;
    info!(operation = "destroy_snapshots", parent = %parent, count = names.len(), defer, "Snapshots destroyed");
    Ok(names)
}

/// Whether `name` exists as any kind of dataset.
pub fn exists(registry: &Registry, name: &str) -> bool {
    registry.with_engine(|e| e.exists(name, TypeMask::ALL))
}
