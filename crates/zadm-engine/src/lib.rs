// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Storage engine surface for zadm.
//!
//! The [`Engine`] trait is everything the admin layer needs from a dataset
//! engine: opaque handles, iteration callbacks, native and user properties,
//! a last-error slot, and the send primitives of each engine generation.
//! Two backends ship here: [`CommandEngine`] drives the `zfs` tool and
//! [`MemoryEngine`] models a pool in memory for tests and dry runs.

pub mod capability;
pub mod command;
pub mod engine;
pub mod error_code;
pub mod flags;
pub mod memory;
pub mod prop;
pub mod property_set;
pub mod raw;
pub mod redirect;
pub mod snapspec;
pub mod types;

pub use capability::{Capabilities, EngineGeneration, EngineVersion, VersionParseError};
pub use command::{classify_stderr, CommandEngine, CommandOutput, CommandRunner, SystemRunner};
pub use engine::{Engine, Visitor};
pub use error_code::{EngineResult, ErrorCode};
pub use flags::{LzcSendFlags, RecvFlags, SendFlags};
pub use memory::{nicenum, EstimatePath, MemoryEngine, MemoryProbe, SendPath, SendRecord};
pub use prop::{
    is_quota_limit, is_user_property, is_userquota_property, is_written_property, PropInfo,
    ZfsProp,
};
pub use property_set::{PropertySet, PropertySetError};
pub use raw::{IoctlRequest, RawCommand};
pub use redirect::{capture_stdout, StdoutRedirect};
pub use types::{
    filesystem_of_name, parent_of_name, pool_of_name, DatasetType, MountFlags, NativeValue,
    PropSource, RawHandle, RawHold, RawPoolHandle, TypeMask, UnmountFlags, UserPropEntry,
    RECEIVED_SOURCE_MARKER,
};

#[cfg(any(test, feature = "test-utils"))]
pub use command::MockCommandRunner;
