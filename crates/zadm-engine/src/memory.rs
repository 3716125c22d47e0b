// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! In-memory storage engine.
//!
//! Models one or more pools with filesystems, volumes, snapshots, bookmarks,
//! clones, holds, property inheritance and received properties. It counts
//! open handles, records every send dispatch and can be told to fail
//! specific operations, which makes it the test double for the core. The
//! `memory` backend of the CLI uses it for dry runs.
//!
//! Tests keep a [`MemoryProbe`] to seed and inspect the model after the
//! engine itself has been boxed into a registry.

use crate::capability::{EngineGeneration, EngineVersion};
use crate::engine::{Engine, Visitor};
use crate::error_code::{EngineResult, ErrorCode};
use crate::flags::{LzcSendFlags, RecvFlags, SendFlags};
use crate::prop::{is_quota_limit, is_user_property, is_userquota_property, is_written_property, ZfsProp};
use crate::property_set::PropertySet;
use crate::raw::{IoctlRequest, RawCommand};
use crate::types::{
    filesystem_of_name, parent_of_name, pool_of_name, DatasetType, MountFlags, NativeValue,
    PropSource, RawHandle, RawHold, RawPoolHandle, TypeMask, UnmountFlags, UserPropEntry,
    RECEIVED_SOURCE_MARKER,
};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fs::File;
use std::io::{self, BufRead, BufReader, Write};
use std::os::fd::BorrowedFd;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, trace, warn};

/// Capacity reported for every pool.
const POOL_CAPACITY: u64 = 1 << 40;
/// Fixed per-stream overhead added to estimates.
const STREAM_HEADER_BYTES: u64 = 1024;
const STREAM_MAGIC: &str = "ZSTREAM";
const STREAM_END: &str = "END";
const MAX_TAG_LEN: usize = 255;

/// Which send primitive the engine was driven through.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SendPath {
    Legacy,
    ByReference,
    ByValue,
    Resume,
}

/// One recorded send call.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SendRecord {
    pub path: SendPath,
    pub dataset: String,
    pub from: Option<String>,
    /// Bitmask handed to the legacy primitive
    pub mask: Option<LzcSendFlags>,
    /// Flags handed to the struct-taking primitives
    pub flags: Option<SendFlags>,
    pub redact_book: Option<String>,
}

/// Which estimate primitive the engine was driven through.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EstimatePath {
    Ioctl,
    Typed,
}

struct Fault {
    op: String,
    /// Calls to let through before failing
    successes: u64,
    code: ErrorCode,
}

struct Failure {
    code: ErrorCode,
    message: String,
}

type Fallible<T> = Result<T, Failure>;

fn failure<T>(code: ErrorCode, message: impl Into<String>) -> Fallible<T> {
    Err(Failure {
        code,
        message: message.into(),
    })
}

#[derive(Clone, Debug, Default)]
struct Node {
    kind: Option<DatasetType>,
    guid: u64,
    objsetid: u64,
    createtxg: u64,
    creation: u64,
    referenced: u64,
    /// Locally set native and user properties, by name
    local: BTreeMap<String, String>,
    /// Properties set by a receive, by name
    received: BTreeMap<String, String>,
    userquota: BTreeMap<String, String>,
    origin: Option<String>,
    mounted: Option<String>,
    holds: BTreeMap<String, u64>,
    defer_destroy: bool,
    inconsistent: bool,
    resume_token: Option<String>,
}

impl Node {
    fn kind(&self) -> DatasetType {
        self.kind.unwrap_or(DatasetType::Filesystem)
    }
}

struct MemoryState {
    version: EngineVersion,
    datasets: BTreeMap<String, Node>,
    handles: HashMap<u64, String>,
    pools: HashMap<u64, String>,
    next_id: u64,
    next_txg: u64,
    last_error: ErrorCode,
    last_error_description: String,
    faults: Vec<Fault>,
    calls: HashMap<String, u64>,
    double_closes: u64,
    sends: Vec<SendRecord>,
    estimates: Vec<EstimatePath>,
}

/// In-memory [`Engine`].
pub struct MemoryEngine {
    state: Arc<Mutex<MemoryState>>,
}

/// Shared view of a [`MemoryEngine`]'s model for seeding and assertions.
#[derive(Clone)]
pub struct MemoryProbe {
    state: Arc<Mutex<MemoryState>>,
}

fn lock(state: &Mutex<MemoryState>) -> MutexGuard<'_, MemoryState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Human-readable size in the engine's style: `0B`, `96K`, `1.50M`, `12.3G`.
pub fn nicenum(n: u64) -> String {
    const UNITS: [&str; 7] = ["B", "K", "M", "G", "T", "P", "E"];
    if n < 1024 {
        return format!("{}B", n);
    }
    let mut idx = 0;
    let mut scaled = n as f64;
    while scaled >= 1024.0 && idx < UNITS.len() - 1 {
        scaled /= 1024.0;
        idx += 1;
    }
    if n % (1u64 << (10 * idx)) == 0 {
        return format!("{}{}", n >> (10 * idx), UNITS[idx]);
    }
    if scaled < 10.0 {
        format!("{:.2}{}", scaled, UNITS[idx])
    } else if scaled < 100.0 {
        format!("{:.1}{}", scaled, UNITS[idx])
    } else {
        format!("{:.0}{}", scaled, UNITS[idx])
    }
}

fn valid_component(part: &str) -> bool {
    !part.is_empty()
        && part
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.' | ':' | ' ' | '%'))
}

fn valid_name(name: &str, kind: DatasetType) -> bool {
    let (fs, tail) = match kind {
        DatasetType::Snapshot => match name.split_once('@') {
            Some((fs, snap)) => (fs, Some(snap)),
            None => return false,
        },
        DatasetType::Bookmark => match name.split_once('#') {
            Some((fs, mark)) => (fs, Some(mark)),
            None => return false,
        },
        _ => (name, None),
    };
    if fs.contains(&['@', '#'][..]) {
        return false;
    }
    fs.split('/').all(valid_component) && tail.map_or(true, valid_component)
}

impl MemoryState {
    fn new(version: EngineVersion) -> Self {
        MemoryState {
            version,
            datasets: BTreeMap::new(),
            handles: HashMap::new(),
            pools: HashMap::new(),
            next_id: 1,
            next_txg: 1,
            last_error: ErrorCode::Success,
            last_error_description: String::new(),
            faults: Vec::new(),
            calls: HashMap::new(),
            double_closes: 0,
            sends: Vec::new(),
            estimates: Vec::new(),
        }
    }

    fn finish<T>(&mut self, result: Fallible<T>) -> EngineResult<T> {
        result.map_err(|f| {
            trace!(code = ?f.code, message = %f.message, "Memory engine call failed");
            self.last_error = f.code;
            self.last_error_description = f.message;
            f.code
        })
    }

    fn check(&mut self, op: &str) -> Fallible<()> {
        let count = self.calls.entry(op.to_string()).or_insert(0);
        *count += 1;
        let seen = *count;
        if let Some(fault) = self.faults.iter().find(|f| f.op == op) {
            if seen > fault.successes {
                return failure(fault.code, format!("injected failure in {}", op));
            }
        }
        Ok(())
    }

    fn generation(&self) -> EngineGeneration {
        self.version.generation()
    }

    fn require_generation(&self, wanted: &[EngineGeneration]) -> Fallible<()> {
        if wanted.contains(&self.generation()) {
            Ok(())
        } else {
            failure(
                ErrorCode::IocNotSupported,
                format!("primitive not available in engine {}", self.version),
            )
        }
    }

    fn next_id(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    fn alloc_handle(&mut self, name: &str) -> RawHandle {
        let id = self.next_id();
        self.handles.insert(id, name.to_string());
        RawHandle::new(id)
    }

    fn resolve(&self, handle: RawHandle) -> Fallible<String> {
        match self.handles.get(&handle.id()) {
            Some(name) if self.datasets.contains_key(name) => Ok(name.clone()),
            Some(name) => failure(
                ErrorCode::NoEnt,
                format!("cannot open '{}': dataset does not exist", name),
            ),
            None => failure(ErrorCode::BadType, format!("invalid handle {}", handle.id())),
        }
    }

    fn node(&self, name: &str) -> Fallible<&Node> {
        self.datasets.get(name).map_or_else(
            || failure(ErrorCode::NoEnt, format!("cannot open '{}': dataset does not exist", name)),
            Ok,
        )
    }

    fn node_mut(&mut self, name: &str) -> Fallible<&mut Node> {
        match self.datasets.get_mut(name) {
            Some(node) => Ok(node),
            None => failure(ErrorCode::NoEnt, format!("cannot open '{}': dataset does not exist", name)),
        }
    }

    fn kind_of(&self, name: &str) -> Option<DatasetType> {
        self.datasets.get(name).map(Node::kind)
    }

    fn matches_types(&self, name: &str, types: TypeMask) -> bool {
        match self.kind_of(name) {
            Some(kind) => {
                types.contains(kind)
                    || (kind == DatasetType::Filesystem
                        && !name.contains('/')
                        && types.contains(DatasetType::Pool))
            }
            None => false,
        }
    }

    fn new_node(&mut self, kind: DatasetType) -> Node {
        let id = self.next_id();
        let txg = self.next_txg;
        self.next_txg += 1;
        Node {
            kind: Some(kind),
            guid: 0x9E37_79B9_7F4A_7C15u64.wrapping_mul(id) | 1,
            objsetid: id,
            createtxg: txg,
            creation: now_secs(),
            ..Default::default()
        }
    }

    fn is_hidden(name: &str) -> bool {
        name.contains('%')
    }

    fn child_datasets(&self, parent: &str) -> Vec<String> {
        self.datasets
            .iter()
            .filter(|(name, node)| {
                matches!(node.kind(), DatasetType::Filesystem | DatasetType::Volume)
                    && !Self::is_hidden(name)
                    && parent_of_name(name) == Some(parent)
            })
            .map(|(name, _)| name.clone())
            .collect()
    }

    fn marked_children(&self, parent: &str, sep: char) -> Vec<String> {
        let prefix = format!("{}{}", parent, sep);
        let mut found: Vec<(&String, u64)> = self
            .datasets
            .iter()
            .filter(|(name, _)| name.starts_with(&prefix))
            .map(|(name, node)| (name, node.createtxg))
            .collect();
        found.sort_by_key(|(_, txg)| *txg);
        found.into_iter().map(|(name, _)| name.clone()).collect()
    }

    fn snapshots_of(&self, parent: &str) -> Vec<String> {
        self.marked_children(parent, '@')
    }

    fn bookmarks_of(&self, parent: &str) -> Vec<String> {
        self.marked_children(parent, '#')
    }

    fn clones_of(&self, snapshot: &str) -> Vec<String> {
        self.datasets
            .iter()
            .filter(|(_, node)| node.origin.as_deref() == Some(snapshot))
            .map(|(name, _)| name.clone())
            .collect()
    }

    /// Filesystems and volumes below `name`, depth first.
    fn descendant_datasets(&self, name: &str) -> Vec<String> {
        let mut out = Vec::new();
        for child in self.child_datasets(name) {
            out.push(child.clone());
            out.extend(self.descendant_datasets(&child));
        }
        out
    }

    fn has_children(&self, name: &str) -> bool {
        let slash = format!("{}/", name);
        let at = format!("{}@", name);
        self.datasets
            .keys()
            .any(|k| k.starts_with(&slash) || k.starts_with(&at))
    }

    fn dependents(&self, name: &str, allow_recursion: bool) -> Vec<String> {
        let mut seen = BTreeSet::new();
        let mut out = Vec::new();
        self.collect_dependents(name, allow_recursion, &mut seen, &mut out);
        out
    }

    fn collect_dependents(
        &self,
        name: &str,
        allow_recursion: bool,
        seen: &mut BTreeSet<String>,
        out: &mut Vec<String>,
    ) {
        let direct = match self.kind_of(name) {
            Some(DatasetType::Snapshot) => self.clones_of(name),
            Some(DatasetType::Filesystem) | Some(DatasetType::Volume) => {
                let mut direct = self.child_datasets(name);
                direct.extend(self.snapshots_of(name));
                direct
            }
            _ => Vec::new(),
        };
        for dep in direct {
            if !seen.insert(dep.clone()) {
                continue;
            }
            out.push(dep.clone());
            if allow_recursion || self.kind_of(name) != Some(DatasetType::Snapshot) {
                self.collect_dependents(&dep, allow_recursion, seen, out);
            }
        }
    }

    // --- properties -----------------------------------------------------

    fn inherited_from(&self, name: &str, key: &str) -> Option<(String, String)> {
        let mut current = parent_of_name(name);
        while let Some(ancestor) = current {
            if let Some(node) = self.datasets.get(ancestor) {
                if let Some(value) = node.local.get(key).or_else(|| node.received.get(key)) {
                    return Some((ancestor.to_string(), value.clone()));
                }
            }
            current = parent_of_name(ancestor);
        }
        None
    }

    fn used(&self, name: &str) -> u64 {
        let own = self.datasets.get(name).map_or(0, |n| n.referenced);
        if self.kind_of(name) == Some(DatasetType::Snapshot) {
            return 0;
        }
        own + self
            .child_datasets(name)
            .iter()
            .map(|child| self.used(child))
            .sum::<u64>()
    }

    fn written(&self, name: &str) -> u64 {
        let Some(node) = self.datasets.get(name) else {
            return 0;
        };
        let fs = filesystem_of_name(name);
        let previous = self
            .snapshots_of(fs)
            .into_iter()
            .filter_map(|s| self.datasets.get(&s))
            .filter(|s| s.createtxg < node.createtxg || node.kind() != DatasetType::Snapshot)
            .last()
            .map_or(0, |s| s.referenced);
        node.referenced.saturating_sub(previous)
    }

    fn size_value(n: u64, literal: bool) -> String {
        if literal {
            n.to_string()
        } else {
            nicenum(n)
        }
    }

    fn native(&self, name: &str, prop: ZfsProp, literal: bool) -> Fallible<NativeValue> {
        let node = self.node(name)?;
        let kind = node.kind();
        if !prop.applies_to(kind) {
            return failure(
                ErrorCode::PropType,
                format!("property '{}' does not apply to datasets of this type", prop),
            );
        }
        let computed = |value: String| NativeValue {
            value,
            source: PropSource::None,
        };
        let info = prop.info();

        let value = match prop {
            ZfsProp::Type => computed(kind.as_str().to_string()),
            ZfsProp::Name => computed(name.to_string()),
            ZfsProp::Creation => computed(node.creation.to_string()),
            ZfsProp::CreateTxg => computed(node.createtxg.to_string()),
            ZfsProp::Guid => computed(node.guid.to_string()),
            ZfsProp::ObjsetId => computed(node.objsetid.to_string()),
            ZfsProp::Used | ZfsProp::LogicalUsed => computed(Self::size_value(self.used(name), literal)),
            ZfsProp::Referenced | ZfsProp::LogicalReferenced | ZfsProp::UsedDs | ZfsProp::Unique => {
                computed(Self::size_value(node.referenced, literal))
            }
            ZfsProp::UsedChild => computed(Self::size_value(
                self.used(name).saturating_sub(node.referenced),
                literal,
            )),
            ZfsProp::UsedSnap | ZfsProp::UsedRefreserv => computed(Self::size_value(0, literal)),
            ZfsProp::Available => {
                let pool_used = self.used(pool_of_name(name));
                computed(Self::size_value(POOL_CAPACITY.saturating_sub(pool_used), literal))
            }
            ZfsProp::Written => computed(Self::size_value(self.written(name), literal)),
            ZfsProp::CompressRatio | ZfsProp::RefRatio => computed("1.00x".to_string()),
            ZfsProp::Mounted => computed(if node.mounted.is_some() { "yes" } else { "no" }.to_string()),
            ZfsProp::Origin => computed(node.origin.clone().unwrap_or_else(|| "-".to_string())),
            ZfsProp::Clones => computed(self.clones_of(name).join(",")),
            ZfsProp::NumClones => computed(self.clones_of(name).len().to_string()),
            ZfsProp::UserRefs => computed(node.holds.len().to_string()),
            ZfsProp::DeferDestroy => computed(if node.defer_destroy { "on" } else { "off" }.to_string()),
            ZfsProp::Inconsistent => computed(if node.inconsistent { "1" } else { "0" }.to_string()),
            ZfsProp::ReceiveResumeToken => {
                computed(node.resume_token.clone().unwrap_or_else(|| "-".to_string()))
            }
            ZfsProp::Mountpoint => self.mountpoint(name, node),
            _ => {
                let key = prop.name();
                if let Some(value) = node.local.get(key) {
                    NativeValue {
                        value: value.clone(),
                        source: PropSource::Local,
                    }
                } else if let Some(value) = node.received.get(key) {
                    NativeValue {
                        value: value.clone(),
                        source: PropSource::Received,
                    }
                } else if let Some((ancestor, value)) =
                    info.inheritable.then(|| self.inherited_from(name, key)).flatten()
                {
                    NativeValue {
                        value,
                        source: PropSource::Inherited(ancestor),
                    }
                } else if let Some(default) = info.default {
                    NativeValue {
                        value: default.to_string(),
                        source: PropSource::Default,
                    }
                } else {
                    computed("-".to_string())
                }
            }
        };
        Ok(value)
    }

    fn mountpoint(&self, name: &str, node: &Node) -> NativeValue {
        if let Some(value) = node.local.get("mountpoint") {
            return NativeValue {
                value: value.clone(),
                source: PropSource::Local,
            };
        }
        if let Some((ancestor, value)) = self.inherited_from(name, "mountpoint") {
            let value = if value == "none" || value == "legacy" {
                value
            } else {
                let rest = &name[ancestor.len()..];
                format!("{}{}", value.trim_end_matches('/'), rest)
            };
            return NativeValue {
                value,
                source: PropSource::Inherited(ancestor),
            };
        }
        NativeValue {
            value: format!("/{}", name),
            source: PropSource::Default,
        }
    }

    fn validate_set(&self, name: &str, key: &str, value: &str) -> Fallible<()> {
        if is_user_property(key) || is_userquota_property(key) {
            return Ok(());
        }
        let Some(prop) = ZfsProp::from_name(key) else {
            return failure(ErrorCode::BadProp, format!("invalid property '{}'", key));
        };
        let kind = self.node(name)?.kind();
        let info = prop.info();
        if info.readonly {
            return failure(ErrorCode::PropReadonly, format!("'{}' is readonly", key));
        }
        if !prop.applies_to(kind) {
            return failure(
                ErrorCode::PropType,
                format!("'{}' does not apply to datasets of this type", key),
            );
        }
        if info.numeric && value != "none" && value.parse::<u64>().is_err() {
            return failure(ErrorCode::BadProp, format!("'{}' must be a number", key));
        }
        Ok(())
    }

    fn apply_set(&mut self, name: &str, key: &str, value: &str) -> Fallible<()> {
        let node = self.node_mut(name)?;
        if is_userquota_property(key) {
            node.userquota.insert(key.to_string(), value.to_string());
        } else {
            node.local.insert(key.to_string(), value.to_string());
        }
        Ok(())
    }

    fn set_props(&mut self, name: &str, props: &PropertySet) -> Fallible<()> {
        for (key, value) in props.iter() {
            self.validate_set(name, key, value)?;
        }
        for (key, value) in props.iter() {
            self.apply_set(name, key, value)?;
        }
        Ok(())
    }

    fn user_props(&self, name: &str) -> Fallible<BTreeMap<String, UserPropEntry>> {
        let mut out = BTreeMap::new();
        let mut current = Some(name);
        while let Some(dataset) = current {
            if let Some(node) = self.datasets.get(dataset) {
                for (key, value) in node.local.iter().filter(|(k, _)| is_user_property(k)) {
                    out.entry(key.clone())
                        .or_insert_with(|| UserPropEntry::new(value.clone(), dataset));
                }
                for (key, value) in node.received.iter().filter(|(k, _)| is_user_property(k)) {
                    let source = if dataset == name { RECEIVED_SOURCE_MARKER } else { dataset };
                    out.entry(key.clone())
                        .or_insert_with(|| UserPropEntry::new(value.clone(), source));
                }
            }
            current = parent_of_name(dataset);
        }
        Ok(out)
    }

    fn userquota(&self, name: &str, key: &str, literal: bool) -> Fallible<String> {
        if !is_userquota_property(key) {
            return failure(ErrorCode::BadProp, format!("invalid property '{}'", key));
        }
        let node = self.node(name)?;
        match node.userquota.get(key) {
            Some(value) => match value.parse::<u64>() {
                Ok(n) if !literal => Ok(nicenum(n)),
                _ => Ok(value.clone()),
            },
            None if is_quota_limit(key) => {
                failure(ErrorCode::NoEnt, format!("no quota set for '{}'", key))
            }
            None => failure(ErrorCode::NoEnt, format!("no usage recorded for '{}'", key)),
        }
    }

    fn written_since(&self, name: &str, key: &str, literal: bool) -> Fallible<String> {
        if !is_written_property(key) {
            return failure(ErrorCode::BadProp, format!("invalid property '{}'", key));
        }
        let node = self.node(name)?;
        let snap = &key["written@".len()..];
        let snap_name = if snap.contains('@') {
            snap.to_string()
        } else {
            format!("{}@{}", filesystem_of_name(name), snap)
        };
        let Some(base) = self.datasets.get(&snap_name) else {
            return failure(
                ErrorCode::NoEnt,
                format!("cannot open '{}': dataset does not exist", snap_name),
            );
        };
        Ok(Self::size_value(node.referenced.saturating_sub(base.referenced), literal))
    }

    // --- mutations ------------------------------------------------------

    fn insert_dataset(&mut self, name: &str, kind: DatasetType) -> Fallible<()> {
        if !valid_name(name, kind) {
            return failure(ErrorCode::InvalidName, format!("invalid name '{}'", name));
        }
        if self.datasets.contains_key(name) {
            return failure(ErrorCode::Exists, format!("cannot create '{}': dataset already exists", name));
        }
        if let Some(parent) = parent_of_name(name) {
            match self.kind_of(parent) {
                Some(DatasetType::Filesystem) => {}
                Some(DatasetType::Volume) if kind != DatasetType::Filesystem && kind != DatasetType::Volume => {}
                Some(_) => {
                    return failure(
                        ErrorCode::WrongParent,
                        format!("cannot create '{}': parent is not a filesystem", name),
                    )
                }
                None => {
                    return failure(
                        ErrorCode::NoEnt,
                        format!("cannot create '{}': parent does not exist", name),
                    )
                }
            }
        }
        let node = self.new_node(kind);
        self.datasets.insert(name.to_string(), node);
        Ok(())
    }

    fn create(&mut self, name: &str, kind: DatasetType, props: &PropertySet) -> Fallible<()> {
        if !matches!(kind, DatasetType::Filesystem | DatasetType::Volume) {
            return failure(ErrorCode::BadType, format!("cannot create '{}': invalid type", name));
        }
        if parent_of_name(name).is_none() {
            return failure(
                ErrorCode::NoEnt,
                format!("cannot create '{}': missing dataset name", name),
            );
        }
        if kind == DatasetType::Volume && props.get("volsize").is_none() {
            return failure(ErrorCode::BadProp, "volume size must be specified");
        }
        self.insert_dataset(name, kind)?;
        if let Err(f) = self.set_props(name, props) {
            self.datasets.remove(name);
            return Err(f);
        }
        Ok(())
    }

    fn take_snapshot(&mut self, name: &str) -> Fallible<()> {
        let fs = filesystem_of_name(name).to_string();
        let referenced = match self.kind_of(&fs) {
            Some(DatasetType::Filesystem) | Some(DatasetType::Volume) => {
                self.datasets.get(&fs).map_or(0, |n| n.referenced)
            }
            Some(_) => {
                return failure(ErrorCode::BadType, format!("cannot snapshot '{}'", fs));
            }
            None => {
                return failure(
                    ErrorCode::NoEnt,
                    format!("cannot open '{}': dataset does not exist", fs),
                )
            }
        };
        self.insert_dataset(name, DatasetType::Snapshot)?;
        self.node_mut(name)?.referenced = referenced;
        Ok(())
    }

    fn snapshot(&mut self, name: &str, recursive: bool, props: &PropertySet) -> Fallible<()> {
        let Some((fs, short)) = name.split_once('@') else {
            return failure(ErrorCode::InvalidName, format!("invalid snapshot name '{}'", name));
        };
        if let Some((key, _)) = props.iter().find(|(k, _)| !is_user_property(k)) {
            return failure(
                ErrorCode::PropType,
                format!("property '{}' cannot be set on snapshots", key),
            );
        }
        let mut targets = vec![name.to_string()];
        if recursive {
            targets.extend(
                self.descendant_datasets(fs)
                    .into_iter()
                    .map(|d| format!("{}@{}", d, short)),
            );
        }
        for target in &targets {
            if self.datasets.contains_key(target) {
                return failure(
                    ErrorCode::Exists,
                    format!("cannot create snapshot '{}': dataset already exists", target),
                );
            }
        }
        for target in &targets {
            self.take_snapshot(target)?;
            self.set_props(target, props)?;
        }
        Ok(())
    }

    fn bookmark(&mut self, source: &str, bookmark: &str) -> Fallible<()> {
        let source_node = match self.kind_of(source) {
            Some(DatasetType::Snapshot) | Some(DatasetType::Bookmark) => self.node(source)?.clone(),
            Some(_) => {
                return failure(
                    ErrorCode::BadType,
                    format!("cannot bookmark '{}': not a snapshot or bookmark", source),
                )
            }
            None => {
                return failure(
                    ErrorCode::NoEnt,
                    format!("cannot bookmark '{}': dataset does not exist", source),
                )
            }
        };
        if filesystem_of_name(source) != filesystem_of_name(bookmark) {
            return failure(
                ErrorCode::CrossTarget,
                format!("cannot create bookmark '{}': source is in another filesystem", bookmark),
            );
        }
        self.insert_dataset(bookmark, DatasetType::Bookmark)?;
        let node = self.node_mut(bookmark)?;
        node.guid = source_node.guid;
        node.createtxg = source_node.createtxg;
        node.referenced = source_node.referenced;
        Ok(())
    }

    fn clone_snapshot(&mut self, snapshot: &str, target: &str, props: &PropertySet) -> Fallible<()> {
        if self.kind_of(snapshot) != Some(DatasetType::Snapshot) {
            return failure(ErrorCode::BadType, format!("'{}' is not a snapshot", snapshot));
        }
        if pool_of_name(snapshot) != pool_of_name(target) {
            return failure(
                ErrorCode::CrossTarget,
                format!("cannot create '{}': source and target pools differ", target),
            );
        }
        let referenced = self.node(snapshot)?.referenced;
        let kind = self
            .kind_of(filesystem_of_name(snapshot))
            .unwrap_or(DatasetType::Filesystem);
        self.insert_dataset(target, kind)?;
        {
            let node = self.node_mut(target)?;
            node.origin = Some(snapshot.to_string());
            node.referenced = referenced;
        }
        if let Err(f) = self.set_props(target, props) {
            self.datasets.remove(target);
            return Err(f);
        }
        Ok(())
    }

    fn remove(&mut self, name: &str) {
        let Some(node) = self.datasets.remove(name) else {
            return;
        };
        debug!(dataset = %name, "Memory engine removed dataset");
        let bookmark_prefix = format!("{}#", name);
        self.datasets.retain(|k, _| !k.starts_with(&bookmark_prefix));

        if let Some(origin) = node.origin {
            let release = self.datasets.get(&origin).is_some_and(|o| {
                o.defer_destroy && o.holds.is_empty()
            }) && self.clones_of(&origin).is_empty();
            if release {
                self.remove(&origin);
            }
        }
    }

    fn destroy_one(&mut self, name: &str, defer: bool) -> Fallible<()> {
        let kind = self.node(name)?.kind();
        match kind {
            DatasetType::Snapshot => {
                let clones = self.clones_of(name);
                let held = !self.node(name)?.holds.is_empty();
                if clones.is_empty() && !held {
                    self.remove(name);
                } else if defer {
                    self.node_mut(name)?.defer_destroy = true;
                } else if !clones.is_empty() {
                    return failure(
                        ErrorCode::Exists,
                        format!("cannot destroy '{}': snapshot has dependent clones", name),
                    );
                } else {
                    return failure(
                        ErrorCode::Busy,
                        format!("cannot destroy '{}': snapshot is held", name),
                    );
                }
            }
            DatasetType::Bookmark => self.remove(name),
            _ => {
                if !name.contains('/') {
                    return failure(
                        ErrorCode::BadType,
                        format!("cannot destroy '{}': operation does not apply to pools", name),
                    );
                }
                if self.has_children(name) {
                    return failure(
                        ErrorCode::Exists,
                        format!("cannot destroy '{}': filesystem has children", name),
                    );
                }
                self.remove(name);
            }
        }
        Ok(())
    }

    fn destroy_snaps(&mut self, snapshots: &[String], defer: bool) -> Fallible<()> {
        for name in snapshots {
            match self.kind_of(name) {
                Some(DatasetType::Snapshot) | None => {}
                Some(_) => {
                    return failure(ErrorCode::BadType, format!("'{}' is not a snapshot", name))
                }
            }
            if defer {
                continue;
            }
            if !self.clones_of(name).is_empty() {
                return failure(
                    ErrorCode::Exists,
                    format!("cannot destroy '{}': snapshot has dependent clones", name),
                );
            }
            if self.datasets.get(name).is_some_and(|n| !n.holds.is_empty()) {
                return failure(ErrorCode::Busy, format!("cannot destroy '{}': snapshot is held", name));
            }
        }
        for name in snapshots {
            if self.datasets.contains_key(name) {
                self.destroy_one(name, defer)?;
            }
        }
        Ok(())
    }

    fn rollback(&mut self, fs: &str, snapshot: &str) -> Fallible<()> {
        if filesystem_of_name(snapshot) != fs || self.kind_of(snapshot) != Some(DatasetType::Snapshot) {
            return failure(
                ErrorCode::CrossTarget,
                format!("cannot rollback '{}' to '{}'", fs, snapshot),
            );
        }
        if self.snapshots_of(fs).last().map(String::as_str) != Some(snapshot) {
            return failure(
                ErrorCode::Exists,
                format!("cannot rollback to '{}': more recent snapshots exist", snapshot),
            );
        }
        let referenced = self.node(snapshot)?.referenced;
        self.node_mut(fs)?.referenced = referenced;
        Ok(())
    }

    fn rename_entries(&mut self, renames: &[(String, String)]) {
        for (old, new) in renames {
            if let Some(node) = self.datasets.remove(old) {
                self.datasets.insert(new.clone(), node);
            }
        }
        for node in self.datasets.values_mut() {
            if let Some(origin) = node.origin.as_mut() {
                if let Some((_, new)) = renames.iter().find(|(old, _)| old == origin) {
                    *origin = new.clone();
                }
            }
        }
        for name in self.handles.values_mut() {
            if let Some((_, new)) = renames.iter().find(|(old, _)| old == name) {
                *name = new.clone();
            }
        }
    }

    fn promote(&mut self, clone: &str) -> Fallible<()> {
        let Some(origin) = self.node(clone)?.origin.clone() else {
            return failure(
                ErrorCode::NotSup,
                format!("cannot promote '{}': not a cloned filesystem", clone),
            );
        };
        let origin_fs = filesystem_of_name(&origin).to_string();
        let cutoff = self.node(&origin)?.createtxg;

        let mut renames = Vec::new();
        for snap in self.snapshots_of(&origin_fs) {
            if self.datasets.get(&snap).is_some_and(|n| n.createtxg <= cutoff) {
                let short = snap.split_once('@').map(|(_, s)| s).unwrap_or_default();
                let target = format!("{}@{}", clone, short);
                if self.datasets.contains_key(&target) {
                    return failure(
                        ErrorCode::Exists,
                        format!("cannot promote '{}': snapshot '{}' already exists", clone, target),
                    );
                }
                renames.push((snap, target));
            }
        }
        let clone_origin = self.node(&origin_fs)?.origin.clone();
        self.rename_entries(&renames);

        let new_origin = format!("{}@{}", clone, origin.split_once('@').map(|(_, s)| s).unwrap_or_default());
        self.node_mut(clone)?.origin = clone_origin;
        self.node_mut(&origin_fs)?.origin = Some(new_origin);
        Ok(())
    }

    fn rename(&mut self, old: &str, new: &str, recursive: bool) -> Fallible<()> {
        let kind = self.node(old)?.kind();
        if self.datasets.contains_key(new) {
            return failure(ErrorCode::Exists, format!("cannot rename to '{}': dataset exists", new));
        }
        if kind == DatasetType::Snapshot {
            let (fs, old_short) = old.split_once('@').unwrap_or((old, ""));
            let Some((new_fs, new_short)) = new.split_once('@') else {
                return failure(ErrorCode::InvalidName, format!("invalid snapshot name '{}'", new));
            };
            if fs != new_fs {
                return failure(
                    ErrorCode::CrossTarget,
                    "snapshots must be part of same dataset",
                );
            }
            let mut renames = vec![(old.to_string(), new.to_string())];
            if recursive {
                for desc in self.descendant_datasets(fs) {
                    let from = format!("{}@{}", desc, old_short);
                    if self.datasets.contains_key(&from) {
                        renames.push((from, format!("{}@{}", desc, new_short)));
                    }
                }
            }
            self.rename_entries(&renames);
            return Ok(());
        }
        if kind == DatasetType::Bookmark || !old.contains('/') {
            return failure(ErrorCode::BadType, format!("cannot rename '{}'", old));
        }
        if pool_of_name(old) != pool_of_name(new) {
            return failure(ErrorCode::CrossTarget, "cannot rename to a different pool");
        }
        if new.starts_with(&format!("{}/", old)) {
            return failure(
                ErrorCode::Recursive,
                format!("cannot rename '{}' to a descendant of itself", old),
            );
        }
        if !valid_name(new, kind) {
            return failure(ErrorCode::InvalidName, format!("invalid name '{}'", new));
        }
        match parent_of_name(new).and_then(|p| self.kind_of(p)) {
            Some(DatasetType::Filesystem) => {}
            _ => {
                return failure(
                    ErrorCode::NoEnt,
                    format!("cannot rename to '{}': parent does not exist", new),
                )
            }
        }
        let prefixes = [format!("{}/", old), format!("{}@", old), format!("{}#", old)];
        let renames: Vec<(String, String)> = self
            .datasets
            .keys()
            .filter(|k| k.as_str() == old || prefixes.iter().any(|p| k.starts_with(p.as_str())))
            .map(|k| (k.clone(), format!("{}{}", new, &k[old.len()..])))
            .collect();
        self.rename_entries(&renames);
        Ok(())
    }

    fn hold_targets(&self, snapshot: &str, recursive: bool) -> Fallible<Vec<String>> {
        if self.node(snapshot)?.kind() != DatasetType::Snapshot {
            return failure(ErrorCode::BadType, format!("'{}' is not a snapshot", snapshot));
        }
        let mut targets = vec![snapshot.to_string()];
        if recursive {
            let (fs, short) = snapshot.split_once('@').unwrap_or((snapshot, ""));
            for desc in self.descendant_datasets(fs) {
                let candidate = format!("{}@{}", desc, short);
                if self.datasets.contains_key(&candidate) {
                    targets.push(candidate);
                }
            }
        }
        Ok(targets)
    }

    fn hold(&mut self, snapshot: &str, tag: &str, recursive: bool) -> Fallible<()> {
        if tag.len() > MAX_TAG_LEN {
            return failure(ErrorCode::TagTooLong, format!("tag '{}' is too long", tag));
        }
        let targets = self.hold_targets(snapshot, recursive)?;
        for target in &targets {
            if self.node(target)?.holds.contains_key(tag) {
                return failure(
                    ErrorCode::ReftagHold,
                    format!("cannot hold '{}': tag already exists on this dataset", target),
                );
            }
        }
        let now = now_secs();
        for target in &targets {
            self.node_mut(target)?.holds.insert(tag.to_string(), now);
        }
        Ok(())
    }

    fn release(&mut self, snapshot: &str, tag: &str, recursive: bool) -> Fallible<()> {
        let targets = self.hold_targets(snapshot, recursive)?;
        for target in &targets {
            if !self.node(target)?.holds.contains_key(tag) {
                return failure(
                    ErrorCode::ReftagRele,
                    format!("cannot release '{}' from '{}': no such tag on this dataset", tag, target),
                );
            }
        }
        for target in &targets {
            self.node_mut(target)?.holds.remove(tag);
            let node = self.node(target)?;
            if node.defer_destroy && node.holds.is_empty() && self.clones_of(target).is_empty() {
                self.remove(target);
            }
        }
        Ok(())
    }

    fn mount(&mut self, name: &str) -> Fallible<()> {
        if self.node(name)?.kind() != DatasetType::Filesystem {
            return failure(ErrorCode::BadType, format!("cannot mount '{}': not a filesystem", name));
        }
        if self.node(name)?.local.get("canmount").map(String::as_str) == Some("off") {
            return failure(ErrorCode::MountFailed, format!("cannot mount '{}': canmount is off", name));
        }
        let node = self.node(name)?;
        let mountpoint = self.mountpoint(name, node).value;
        if mountpoint == "none" || mountpoint == "legacy" {
            return Ok(());
        }
        self.node_mut(name)?.mounted = Some(mountpoint);
        Ok(())
    }

    // --- send / receive -------------------------------------------------

    fn check_send(&self, name: &str, from: Option<&str>) -> Fallible<()> {
        let node = self.node(name)?;
        if node.kind() != DatasetType::Snapshot {
            return failure(ErrorCode::BadType, format!("'{}' is not a snapshot", name));
        }
        if let Some(from) = from {
            let Some(base) = self.datasets.get(from) else {
                return failure(
                    ErrorCode::NoEnt,
                    format!("incremental source '{}' does not exist", from),
                );
            };
            if base.createtxg >= node.createtxg {
                return failure(
                    ErrorCode::BadBackup,
                    format!("incremental source '{}' must be earlier than '{}'", from, name),
                );
            }
        }
        Ok(())
    }

    fn estimate(&self, name: &str, from: Option<&str>, from_origin: bool) -> Fallible<u64> {
        let node = self.node(name)?;
        let base = match from {
            Some(from) => self.node(from)?.referenced,
            None if from_origin => {
                let origin = node
                    .origin
                    .clone()
                    .or_else(|| self.datasets.get(filesystem_of_name(name)).and_then(|n| n.origin.clone()));
                origin
                    .and_then(|o| self.datasets.get(&o))
                    .map_or(0, |n| n.referenced)
            }
            None => 0,
        };
        Ok(node.referenced.abs_diff(base) + STREAM_HEADER_BYTES)
    }

    fn write_stream(
        &self,
        sink: BorrowedFd<'_>,
        name: &str,
        from: Option<&str>,
        flags: &SendFlags,
    ) -> Fallible<()> {
        let size = self.estimate(name, from, flags.from_origin)?;
        let describe = match from {
            Some(from) => format!("send from {} to {} estimated size is {}", from, name, nicenum(size)),
            None => format!("full send of {} estimated size is {}", name, nicenum(size)),
        };
        if flags.verbose || flags.dry_run {
            let mut out = io::stdout();
            if let Err(err) = writeln!(out, "{}", describe).and_then(|_| out.flush()) {
                warn!(error = %err, "Failed to write send diagnostics");
            }
        }
        if flags.dry_run {
            return Ok(());
        }
        let io_failure = |err: io::Error| Failure {
            code: ErrorCode::Io,
            message: format!("cannot write stream: {}", err),
        };
        let owned = sink.try_clone_to_owned().map_err(io_failure)?;
        let mut file = File::from(owned);
        let node = self.node(name)?;
        let header = format!(
            "{} {} {} {} {}\n{}\n",
            STREAM_MAGIC,
            name,
            from.unwrap_or("-"),
            node.guid,
            node.referenced,
            STREAM_END
        );
        file.write_all(header.as_bytes())
            .and_then(|_| file.flush())
            .map_err(io_failure)
    }

    fn receive(
        &mut self,
        target: &str,
        props: &PropertySet,
        flags: &RecvFlags,
        source: BorrowedFd<'_>,
    ) -> Fallible<()> {
        let bad_stream = |msg: &str| Failure {
            code: ErrorCode::BadStream,
            message: format!("cannot receive: {}", msg),
        };
        let owned = source
            .try_clone_to_owned()
            .map_err(|e| bad_stream(&e.to_string()))?;
        let mut lines = BufReader::new(File::from(owned)).lines();
        let header = match lines.next() {
            Some(Ok(line)) => line,
            _ => return Err(bad_stream("stream is empty")),
        };
        let fields: Vec<&str> = header.split(' ').collect();
        if fields.len() != 5 || fields[0] != STREAM_MAGIC {
            return Err(bad_stream("invalid stream (bad magic number)"));
        }
        let sent = fields[1];
        let incremental = fields[2] != "-";
        let referenced: u64 = fields[4].parse().unwrap_or(0);
        let complete = lines.any(|l| l.map(|l| l == STREAM_END).unwrap_or(false));

        let (sent_fs, short) = sent.split_once('@').unwrap_or((sent, ""));
        let target_fs = if target.contains('@') {
            filesystem_of_name(target).to_string()
        } else if flags.is_tail {
            let tail = sent_fs.rsplit('/').next().unwrap_or(sent_fs);
            format!("{}/{}", target, tail)
        } else if flags.is_prefix {
            match sent_fs.split_once('/') {
                Some((_, rest)) => format!("{}/{}", target, rest),
                None => target.to_string(),
            }
        } else {
            target.to_string()
        };
        let snapshot = if target.contains('@') {
            target.to_string()
        } else {
            format!("{}@{}", target_fs, short)
        };

        let exists = self.datasets.contains_key(&target_fs);
        if incremental && !exists {
            return failure(
                ErrorCode::NoEnt,
                format!("cannot receive incremental stream: destination '{}' does not exist", target_fs),
            );
        }
        if !incremental && exists && !flags.force {
            return failure(
                ErrorCode::Exists,
                format!("cannot receive new filesystem stream: destination '{}' exists", target_fs),
            );
        }
        if self.datasets.contains_key(&snapshot) {
            return failure(
                ErrorCode::Exists,
                format!("cannot receive: snapshot '{}' already exists", snapshot),
            );
        }
        if flags.dry_run {
            return Ok(());
        }

        if !complete {
            if flags.resumable {
                let token = format!("resume:{}:{}", sent, fields[2]);
                let partial = if exists {
                    format!("{}/%recv", target_fs)
                } else {
                    target_fs.clone()
                };
                if !self.datasets.contains_key(&partial) {
                    self.insert_dataset(&partial, DatasetType::Filesystem)?;
                }
                let node = self.node_mut(&partial)?;
                node.inconsistent = true;
                node.resume_token = Some(token);
            }
            return Err(bad_stream("checksum mismatch or incomplete stream"));
        }

        if !exists {
            self.insert_dataset(&target_fs, DatasetType::Filesystem)?;
        } else if flags.force && !incremental {
            let newer: Vec<String> = self.snapshots_of(&target_fs);
            for snap in newer {
                self.destroy_one(&snap, false)?;
            }
        }
        {
            let node = self.node_mut(&target_fs)?;
            node.referenced = referenced;
            node.inconsistent = false;
            node.resume_token = None;
            if flags.canmount_off {
                node.local.insert("canmount".to_string(), "off".to_string());
            }
            for (key, value) in props.iter() {
                node.received.insert(key.to_string(), value.to_string());
            }
        }
        self.take_snapshot(&snapshot)?;
        if !flags.nomount {
            // mount failures do not fail the receive
            if let Err(err) = self.mount(&target_fs) {
                debug!(dataset = %target_fs, code = ?err.code, "Mount after receive failed");
            }
        }
        Ok(())
    }
}

impl MemoryEngine {
    /// Engine reporting a modern release.
    pub fn new() -> Self {
        Self::with_version(EngineVersion::new(2, 1, 5))
    }

    pub fn with_version(version: EngineVersion) -> Self {
        MemoryEngine {
            state: Arc::new(Mutex::new(MemoryState::new(version))),
        }
    }

    pub fn probe(&self) -> MemoryProbe {
        MemoryProbe {
            state: Arc::clone(&self.state),
        }
    }

    fn lock(&self) -> MutexGuard<'_, MemoryState> {
        lock(&self.state)
    }

    fn with<T>(&self, op: &str, f: impl FnOnce(&mut MemoryState) -> Fallible<T>) -> EngineResult<T> {
        let mut state = self.lock();
        let result = state.check(op).and_then(|_| f(&mut *state));
        state.finish(result)
    }

    /// Deliver freshly opened handles for `names` one at a time. Injected
    /// `<op>:item` faults fire between deliveries.
    fn deliver(&self, op: &str, names: Vec<String>, visit: Visitor<'_>) -> EngineResult<()> {
        let item_op = format!("{}:item", op);
        for name in names {
            let handle = {
                let mut state = self.lock();
                let checked = state.check(&item_op);
                state.finish(checked)?;
                state.alloc_handle(&name)
            };
            if visit(handle).is_break() {
                break;
            }
        }
        Ok(())
    }

}

impl Default for MemoryEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl Engine for MemoryEngine {
    fn version(&self) -> EngineVersion {
        self.lock().version
    }

    fn last_error(&self) -> ErrorCode {
        self.lock().last_error
    }

    fn last_error_description(&self) -> String {
        self.lock().last_error_description.clone()
    }

    fn clear_last_error(&mut self) {
        let mut state = self.lock();
        state.last_error = ErrorCode::Success;
        state.last_error_description.clear();
    }

    fn open(&mut self, name: &str, types: TypeMask) -> EngineResult<RawHandle> {
        self.with("open", |state| {
            if name.is_empty() {
                return failure(ErrorCode::InvalidName, "cannot open '': empty name");
            }
            if !state.matches_types(name, types) {
                return failure(
                    ErrorCode::NoEnt,
                    format!("cannot open '{}': dataset does not exist", name),
                );
            }
            Ok(state.alloc_handle(name))
        })
    }

    fn close(&mut self, handle: RawHandle) {
        let mut state = self.lock();
        if state.handles.remove(&handle.id()).is_none() {
            state.double_closes += 1;
        }
    }

    fn name(&self, handle: RawHandle) -> EngineResult<String> {
        let mut state = self.lock();
        let result = state.check("name").and_then(|_| {
            state.handles.get(&handle.id()).cloned().map_or_else(
                || failure(ErrorCode::BadType, format!("invalid handle {}", handle.id())),
                Ok,
            )
        });
        state.finish(result)
    }

    fn dataset_type(&self, handle: RawHandle) -> EngineResult<DatasetType> {
        let mut state = self.lock();
        let result = state
            .resolve(handle)
            .and_then(|name| state.node(&name).map(Node::kind));
        state.finish(result)
    }

    fn exists(&mut self, name: &str, types: TypeMask) -> bool {
        self.lock().matches_types(name, types)
    }

    fn iter_root(&mut self, visit: Visitor<'_>) -> EngineResult<()> {
        let names = self.with("iter_root", |state| {
            Ok(state
                .datasets
                .keys()
                .filter(|k| !k.contains(&['/', '@', '#'][..]))
                .cloned()
                .collect())
        })?;
        self.deliver("iter_root", names, visit)
    }

    fn iter_children(&mut self, parent: RawHandle, visit: Visitor<'_>) -> EngineResult<()> {
        let names = self.with("iter_children", |state| {
            let name = state.resolve(parent)?;
            match state.node(&name)?.kind() {
                DatasetType::Filesystem | DatasetType::Volume => {
                    let mut names = state.child_datasets(&name);
                    names.extend(state.snapshots_of(&name));
                    Ok(names)
                }
                _ => Ok(Vec::new()),
            }
        })?;
        self.deliver("iter_children", names, visit)
    }

    fn iter_bookmarks(&mut self, parent: RawHandle, visit: Visitor<'_>) -> EngineResult<()> {
        let names = self.with("iter_bookmarks", |state| {
            let name = state.resolve(parent)?;
            Ok(state.bookmarks_of(&name))
        })?;
        self.deliver("iter_bookmarks", names, visit)
    }

    fn iter_snapshots(&mut self, parent: RawHandle, visit: Visitor<'_>) -> EngineResult<()> {
        let names = self.with("iter_snapshots", |state| {
            let name = state.resolve(parent)?;
            Ok(state.snapshots_of(&name))
        })?;
        self.deliver("iter_snapshots", names, visit)
    }

    fn iter_dependents(
        &mut self,
        handle: RawHandle,
        allow_recursion: bool,
        visit: Visitor<'_>,
    ) -> EngineResult<()> {
        let names = self.with("iter_dependents", |state| {
            let name = state.resolve(handle)?;
            Ok(state.dependents(&name, allow_recursion))
        })?;
        self.deliver("iter_dependents", names, visit)
    }

    fn create(&mut self, name: &str, kind: DatasetType, props: &PropertySet) -> EngineResult<()> {
        self.with("create", |state| state.create(name, kind, props))
    }

    fn destroy(&mut self, handle: RawHandle, defer: bool) -> EngineResult<()> {
        self.with("destroy", |state| {
            let name = state.resolve(handle)?;
            state.destroy_one(&name, defer)
        })
    }

    fn destroy_snaps(&mut self, snapshots: &[String], defer: bool) -> EngineResult<()> {
        self.with("destroy_snaps", |state| state.destroy_snaps(snapshots, defer))
    }

    fn clone_snapshot(
        &mut self,
        snapshot: RawHandle,
        target: &str,
        props: &PropertySet,
    ) -> EngineResult<()> {
        self.with("clone", |state| {
            let name = state.resolve(snapshot)?;
            state.clone_snapshot(&name, target, props)
        })
    }

    fn snapshot(&mut self, name: &str, recursive: bool, props: &PropertySet) -> EngineResult<()> {
        self.with("snapshot", |state| state.snapshot(name, recursive, props))
    }

    fn rollback(&mut self, handle: RawHandle, snapshot: RawHandle, _force: bool) -> EngineResult<()> {
        self.with("rollback", |state| {
            let fs = state.resolve(handle)?;
            let snap = state.resolve(snapshot)?;
            state.rollback(&fs, &snap)
        })
    }

    fn promote(&mut self, handle: RawHandle) -> EngineResult<()> {
        self.with("promote", |state| {
            let name = state.resolve(handle)?;
            state.promote(&name)
        })
    }

    fn rename(
        &mut self,
        handle: RawHandle,
        new_name: &str,
        recursive: bool,
        _force_unmount: bool,
    ) -> EngineResult<()> {
        self.with("rename", |state| {
            let name = state.resolve(handle)?;
            state.rename(&name, new_name, recursive)
        })
    }

    fn bookmark(&mut self, source: &str, bookmark: &str) -> EngineResult<()> {
        self.with("bookmark", |state| state.bookmark(source, bookmark))
    }

    fn hold(&mut self, snapshot: RawHandle, tag: &str, recursive: bool) -> EngineResult<()> {
        self.with("hold", |state| {
            let name = state.resolve(snapshot)?;
            state.hold(&name, tag, recursive)
        })
    }

    fn release(&mut self, snapshot: RawHandle, tag: &str, recursive: bool) -> EngineResult<()> {
        self.with("release", |state| {
            let name = state.resolve(snapshot)?;
            state.release(&name, tag, recursive)
        })
    }

    fn holds(&mut self, snapshot: RawHandle) -> EngineResult<Vec<RawHold>> {
        self.with("holds", |state| {
            let name = state.resolve(snapshot)?;
            let node = state.node(&name)?;
            if node.kind() != DatasetType::Snapshot {
                return failure(ErrorCode::BadType, format!("'{}' is not a snapshot", name));
            }
            Ok(node
                .holds
                .iter()
                .map(|(tag, created)| RawHold {
                    tag: tag.clone(),
                    created: *created,
                })
                .collect())
        })
    }

    fn is_mounted(&mut self, handle: RawHandle) -> EngineResult<Option<String>> {
        self.with("is_mounted", |state| {
            let name = state.resolve(handle)?;
            Ok(state.node(&name)?.mounted.clone())
        })
    }

    fn mount(&mut self, handle: RawHandle, _options: Option<&str>, _flags: MountFlags) -> EngineResult<()> {
        self.with("mount", |state| {
            let name = state.resolve(handle)?;
            state.mount(&name)
        })
    }

    fn unmount(&mut self, handle: RawHandle, _flags: UnmountFlags) -> EngineResult<()> {
        self.with("unmount", |state| {
            let name = state.resolve(handle)?;
            state.node_mut(&name)?.mounted = None;
            Ok(())
        })
    }

    fn unmount_all(&mut self, handle: RawHandle, _flags: UnmountFlags) -> EngineResult<()> {
        self.with("unmount", |state| {
            let name = state.resolve(handle)?;
            let mut targets = state.descendant_datasets(&name);
            targets.push(name);
            for target in targets {
                state.node_mut(&target)?.mounted = None;
            }
            Ok(())
        })
    }

    fn pool_of(&mut self, handle: RawHandle) -> EngineResult<RawPoolHandle> {
        self.with("pool_of", |state| {
            let name = state.resolve(handle)?;
            let pool = pool_of_name(&name).to_string();
            let id = state.next_id();
            state.pools.insert(id, pool);
            Ok(RawPoolHandle::new(id))
        })
    }

    fn pool_name(&self, pool: RawPoolHandle) -> EngineResult<String> {
        let mut state = self.lock();
        let result = state.pools.get(&pool.id()).cloned().map_or_else(
            || failure(ErrorCode::PoolUnavail, format!("invalid pool handle {}", pool.id())),
            Ok,
        );
        state.finish(result)
    }

    fn close_pool(&mut self, pool: RawPoolHandle) {
        let mut state = self.lock();
        if state.pools.remove(&pool.id()).is_none() {
            state.double_closes += 1;
        }
    }

    fn prop_get(&mut self, handle: RawHandle, prop: ZfsProp, literal: bool) -> EngineResult<NativeValue> {
        self.with("prop_get", |state| {
            let name = state.resolve(handle)?;
            state.native(&name, prop, literal)
        })
    }

    fn prop_set(&mut self, handle: RawHandle, name: &str, value: &str) -> EngineResult<()> {
        self.with("prop_set", |state| {
            let dataset = state.resolve(handle)?;
            state.validate_set(&dataset, name, value)?;
            state.apply_set(&dataset, name, value)
        })
    }

    fn user_props(&mut self, handle: RawHandle) -> EngineResult<BTreeMap<String, UserPropEntry>> {
        self.with("user_props", |state| {
            let name = state.resolve(handle)?;
            state.user_props(&name)
        })
    }

    fn userquota_get(&mut self, handle: RawHandle, name: &str, literal: bool) -> EngineResult<String> {
        self.with("userquota_get", |state| {
            let dataset = state.resolve(handle)?;
            state.userquota(&dataset, name, literal)
        })
    }

    fn written_get(&mut self, handle: RawHandle, name: &str, literal: bool) -> EngineResult<String> {
        self.with("written_get", |state| {
            let dataset = state.resolve(handle)?;
            state.written_since(&dataset, name, literal)
        })
    }

    fn send_legacy(
        &mut self,
        handle: RawHandle,
        from: Option<&str>,
        sink: BorrowedFd<'_>,
        flags: LzcSendFlags,
    ) -> EngineResult<()> {
        self.with("send", |state| {
            let name = state.resolve(handle)?;
            state.require_generation(&[EngineGeneration::Legacy])?;
            state.check_send(&name, from)?;
            state.sends.push(SendRecord {
                path: SendPath::Legacy,
                dataset: name.clone(),
                from: from.map(str::to_string),
                mask: Some(flags),
                flags: None,
                redact_book: None,
            });
            state.write_stream(sink, &name, from, &SendFlags::default())
        })
    }

    fn send_one(
        &mut self,
        handle: RawHandle,
        from: Option<&str>,
        sink: BorrowedFd<'_>,
        flags: &SendFlags,
        redact_book: Option<&str>,
    ) -> EngineResult<()> {
        self.with("send", |state| {
            let name = state.resolve(handle)?;
            state.require_generation(&[EngineGeneration::Modern])?;
            state.check_send(&name, from)?;
            if let Some(book) = redact_book {
                if state.kind_of(book) != Some(DatasetType::Bookmark) {
                    return failure(
                        ErrorCode::NoEnt,
                        format!("redaction bookmark '{}' does not exist", book),
                    );
                }
            }
            state.sends.push(SendRecord {
                path: SendPath::ByReference,
                dataset: name.clone(),
                from: from.map(str::to_string),
                mask: None,
                flags: Some(*flags),
                redact_book: redact_book.map(str::to_string),
            });
            state.write_stream(sink, &name, from, flags)
        })
    }

    fn send_one_by_value(
        &mut self,
        handle: RawHandle,
        from: Option<&str>,
        sink: BorrowedFd<'_>,
        flags: SendFlags,
    ) -> EngineResult<()> {
        self.with("send", |state| {
            let name = state.resolve(handle)?;
            state.require_generation(&[EngineGeneration::FlagsByValue])?;
            state.check_send(&name, from)?;
            state.sends.push(SendRecord {
                path: SendPath::ByValue,
                dataset: name.clone(),
                from: from.map(str::to_string),
                mask: None,
                flags: Some(flags),
                redact_book: None,
            });
            state.write_stream(sink, &name, from, &flags)
        })
    }

    fn send_resume(&mut self, flags: &SendFlags, sink: BorrowedFd<'_>, token: &str) -> EngineResult<()> {
        self.with("send", |state| {
            let mut parts = token.splitn(3, ':');
            let (Some("resume"), Some(name), Some(from)) = (parts.next(), parts.next(), parts.next())
            else {
                return failure(ErrorCode::BadStream, "resume token is corrupt");
            };
            let from = (from != "-").then_some(from);
            state.check_send(name, from)?;
            state.sends.push(SendRecord {
                path: SendPath::Resume,
                dataset: name.to_string(),
                from: from.map(str::to_string),
                mask: None,
                flags: Some(*flags),
                redact_book: None,
            });
            state.write_stream(sink, name, from, flags)
        })
    }

    fn estimate_send(&mut self, handle: RawHandle, from: Option<&str>, flags: &SendFlags) -> EngineResult<u64> {
        self.with("estimate", |state| {
            let name = state.resolve(handle)?;
            state.require_generation(&[EngineGeneration::Modern])?;
            state.check_send(&name, from)?;
            state.estimates.push(EstimatePath::Typed);
            state.estimate(&name, from, flags.from_origin)
        })
    }

    fn ioctl(&mut self, request: IoctlRequest, cmd: &mut RawCommand) -> EngineResult<()> {
        self.with("ioctl", |state| {
            let IoctlRequest::Send = request;
            let by_objset = |id: u64| {
                state
                    .datasets
                    .iter()
                    .find(|(_, node)| node.objsetid == id)
                    .map(|(name, _)| name.clone())
            };
            let Some(name) = by_objset(cmd.sendobj) else {
                return failure(
                    ErrorCode::NoEnt,
                    format!("no dataset with objset id {}", cmd.sendobj),
                );
            };
            let from = match cmd.fromobj {
                0 => None,
                id => match by_objset(id) {
                    Some(from) => Some(from),
                    None => {
                        return failure(ErrorCode::NoEnt, format!("no dataset with objset id {}", id))
                    }
                },
            };
            state.check_send(&name, from.as_deref())?;
            state.estimates.push(EstimatePath::Ioctl);
            cmd.objset_type = state.estimate(&name, from.as_deref(), cmd.obj != 0)?;
            Ok(())
        })
    }

    fn receive(
        &mut self,
        target: &str,
        props: &PropertySet,
        flags: &RecvFlags,
        source: BorrowedFd<'_>,
    ) -> EngineResult<()> {
        self.with("receive", |state| state.receive(target, props, flags, source))
    }
}

impl MemoryProbe {
    fn lock(&self) -> MutexGuard<'_, MemoryState> {
        lock(&self.state)
    }

    fn seed<T>(&self, f: impl FnOnce(&mut MemoryState) -> Fallible<T>) -> EngineResult<T> {
        let mut state = self.lock();
        let result = f(&mut state);
        state.finish(result)
    }

    /// Add a pool with its root filesystem.
    pub fn add_pool(&self, name: &str) -> EngineResult<()> {
        self.seed(|state| state.insert_dataset(name, DatasetType::Filesystem))
    }

    pub fn add_filesystem(&self, name: &str) -> EngineResult<()> {
        self.seed(|state| state.insert_dataset(name, DatasetType::Filesystem))
    }

    pub fn add_volume(&self, name: &str, size: u64) -> EngineResult<()> {
        self.seed(|state| {
            state.insert_dataset(name, DatasetType::Volume)?;
            state.apply_set(name, "volsize", &size.to_string())
        })
    }

    pub fn add_snapshot(&self, name: &str) -> EngineResult<()> {
        self.seed(|state| state.take_snapshot(name))
    }

    pub fn add_bookmark(&self, snapshot: &str, bookmark: &str) -> EngineResult<()> {
        self.seed(|state| state.bookmark(snapshot, bookmark))
    }

    pub fn add_clone(&self, snapshot: &str, target: &str) -> EngineResult<()> {
        self.seed(|state| state.clone_snapshot(snapshot, target, &PropertySet::new()))
    }

    /// Set a native or user property locally, bypassing validation.
    pub fn set_local(&self, dataset: &str, name: &str, value: &str) -> EngineResult<()> {
        self.seed(|state| state.apply_set(dataset, name, value))
    }

    pub fn set_received(&self, dataset: &str, name: &str, value: &str) -> EngineResult<()> {
        self.seed(|state| {
            state
                .node_mut(dataset)?
                .received
                .insert(name.to_string(), value.to_string());
            Ok(())
        })
    }

    pub fn set_referenced(&self, dataset: &str, bytes: u64) -> EngineResult<()> {
        self.seed(|state| {
            state.node_mut(dataset)?.referenced = bytes;
            Ok(())
        })
    }

    pub fn set_hold(&self, snapshot: &str, tag: &str) -> EngineResult<()> {
        self.seed(|state| state.hold(snapshot, tag, false))
    }

    /// Leave partial receive state on `dataset`.
    pub fn set_resume_state(&self, dataset: &str, token: &str) -> EngineResult<()> {
        self.seed(|state| {
            let node = state.node_mut(dataset)?;
            node.inconsistent = true;
            node.resume_token = Some(token.to_string());
            Ok(())
        })
    }

    pub fn exists(&self, name: &str) -> bool {
        self.lock().datasets.contains_key(name)
    }

    pub fn origin(&self, name: &str) -> Option<String> {
        self.lock().datasets.get(name).and_then(|n| n.origin.clone())
    }

    pub fn is_deferred(&self, name: &str) -> bool {
        self.lock().datasets.get(name).is_some_and(|n| n.defer_destroy)
    }

    pub fn dataset_names(&self) -> Vec<String> {
        self.lock().datasets.keys().cloned().collect()
    }

    /// Dataset handles currently open.
    pub fn open_handles(&self) -> usize {
        self.lock().handles.len()
    }

    pub fn open_pool_handles(&self) -> usize {
        self.lock().pools.len()
    }

    /// Closes of handles that were not open.
    pub fn double_closes(&self) -> u64 {
        self.lock().double_closes
    }

    pub fn call_count(&self, op: &str) -> u64 {
        self.lock().calls.get(op).copied().unwrap_or(0)
    }

    pub fn sends(&self) -> Vec<SendRecord> {
        self.lock().sends.clone()
    }

    pub fn estimates(&self) -> Vec<EstimatePath> {
        self.lock().estimates.clone()
    }

    pub fn last_error(&self) -> ErrorCode {
        self.lock().last_error
    }

    /// Fail every call to `op` with `code`. Iterations also accept
    /// `<op>:item` to fail between delivered handles.
    pub fn fail(&self, op: &str, code: ErrorCode) {
        self.fail_after(op, 0, code);
    }

    /// Let `successes` calls to `op` through, then fail.
    pub fn fail_after(&self, op: &str, successes: u64, code: ErrorCode) {
        let mut state = self.lock();
        let already = state.calls.get(op).copied().unwrap_or(0);
        state.faults.retain(|f| f.op != op);
        state.faults.push(Fault {
            op: op.to_string(),
            successes: already + successes,
            code,
        });
    }

    pub fn clear_failures(&self) {
        self.lock().faults.clear();
    }
}
