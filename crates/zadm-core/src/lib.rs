// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Administration core for pooled copy-on-write datasets.
//!
//! Everything goes through a [`Registry`], which serializes access to one
//! engine session. On top of it:
//!
//! - [`Dataset`] is an owned handle with the per-dataset operations
//!   (properties, snapshots, clones, holds, mounts, rename, rollback).
//! - [`property`] resolves values together with where they came from.
//! - [`walker`] enumerates roots and children into collections and trees,
//!   releasing every handle on partial failure.
//! - [`send`] drives send streams across engine generations.
//! - [`destroy`] refuses to destroy anything with dependents.

pub mod bookmark;
pub mod config;
pub mod dataset;
pub mod destroy;
pub mod error;
pub mod list;
pub mod property;
pub mod recv;
pub mod registry;
pub mod send;
pub mod walker;

pub use bookmark::create_bookmark;
pub use config::{Backend, ConfigSources, EngineConfig, ZadmConfig};
pub use dataset::{Dataset, HoldTag, PoolHandle};
pub use destroy::{check_dependents, destroy_snapshots, DestroyOptions};
pub use error::{Error, Result};
pub use list::{list, ListOptions};
pub use property::{DatasetProperties, PropertyRecord, Provenance};
pub use recv::{abort_resumable, receive};
pub use registry::{get_handle, init, init_registry, Registry};
pub use send::{send_resume, SendReport, SendRequest, SendState, SendStream};
pub use walker::{list_children, list_roots, DatasetCollection, DatasetTree};
