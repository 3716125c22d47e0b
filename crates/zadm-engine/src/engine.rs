// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! The capability surface the administrative core calls into.

use crate::capability::EngineVersion;
use crate::error_code::{EngineResult, ErrorCode};
use crate::flags::{LzcSendFlags, RecvFlags, SendFlags};
use crate::prop::ZfsProp;
use crate::property_set::PropertySet;
use crate::raw::{IoctlRequest, RawCommand};
use crate::snapspec;
use crate::types::{
    DatasetType, MountFlags, NativeValue, RawHandle, RawHold, RawPoolHandle, TypeMask,
    UnmountFlags, UserPropEntry,
};
use std::collections::BTreeMap;
use std::ops::ControlFlow;
use std::os::fd::BorrowedFd;

/// Iteration callback. Each handle passed in is owned by the visitor, which
/// must eventually close it. Returning `Break` ends the iteration early
/// without an error.
pub type Visitor<'a> = &'a mut dyn FnMut(RawHandle) -> ControlFlow<()>;

/// One session with the storage engine.
///
/// Every method reports failure through the engine's own [`ErrorCode`], and
/// also records it as the session's last error. The session is not
/// reentrant: callers serialize access (see `zadm_core::Registry`).
///
/// Primitives that only exist in some engine generations have default
/// bodies failing with [`ErrorCode::IocNotSupported`].
pub trait Engine: Send {
    fn version(&self) -> EngineVersion;

    fn last_error(&self) -> ErrorCode;
    fn last_error_description(&self) -> String;
    fn clear_last_error(&mut self);

    /// Open `name` if its kind is in `types`.
    fn open(&mut self, name: &str, types: TypeMask) -> EngineResult<RawHandle>;
    fn close(&mut self, handle: RawHandle);
    fn name(&self, handle: RawHandle) -> EngineResult<String>;
    fn dataset_type(&self, handle: RawHandle) -> EngineResult<DatasetType>;
    /// Existence probe that does not touch the last error.
    fn exists(&mut self, name: &str, types: TypeMask) -> bool;

    /// Top-level datasets of every imported pool.
    fn iter_root(&mut self, visit: Visitor<'_>) -> EngineResult<()>;
    /// Direct child filesystems, volumes and snapshots.
    fn iter_children(&mut self, parent: RawHandle, visit: Visitor<'_>) -> EngineResult<()>;
    fn iter_bookmarks(&mut self, parent: RawHandle, visit: Visitor<'_>) -> EngineResult<()>;
    /// Snapshots of a filesystem or volume, oldest first.
    fn iter_snapshots(&mut self, parent: RawHandle, visit: Visitor<'_>) -> EngineResult<()>;
    /// Datasets that depend on `handle`: clones of a snapshot, or
    /// descendants of a filesystem. With `allow_recursion` dependents of
    /// dependents are included.
    fn iter_dependents(
        &mut self,
        handle: RawHandle,
        allow_recursion: bool,
        visit: Visitor<'_>,
    ) -> EngineResult<()>;

    /// Snapshots of `parent` selected by a snapshot spec such as
    /// `mon,tue` or `mon%fri`.
    fn iter_snapspec(
        &mut self,
        parent: RawHandle,
        spec: &str,
        visit: Visitor<'_>,
    ) -> EngineResult<()> {
        let mut handles = Vec::new();
        let listed = self.iter_snapshots(parent, &mut |h: RawHandle| {
            handles.push(h);
            ControlFlow::Continue(())
        });
        if let Err(code) = listed {
            for h in handles {
                self.close(h);
            }
            return Err(code);
        }

        let mut short_names = Vec::with_capacity(handles.len());
        for handle in &handles {
            match self.name(*handle) {
                Ok(name) => {
                    let short = name.split_once('@').map(|(_, s)| s.to_string()).unwrap_or(name);
                    short_names.push(short);
                }
                Err(code) => {
                    for h in &handles {
                        self.close(*h);
                    }
                    return Err(code);
                }
            }
        }

        let selected = snapspec::select(&short_names, spec);
        let mut stopped = false;
        for (handle, short) in handles.into_iter().zip(&short_names) {
            if stopped || !selected.contains(&short.as_str()) {
                self.close(handle);
            } else if visit(handle).is_break() {
                stopped = true;
            }
        }
        // Selected snapshots are delivered even when some names miss.
        if snapspec::unmatched(&short_names, spec).is_empty() {
            Ok(())
        } else {
            Err(ErrorCode::NoEnt)
        }
    }

    fn create(&mut self, name: &str, kind: DatasetType, props: &PropertySet) -> EngineResult<()>;
    fn destroy(&mut self, handle: RawHandle, defer: bool) -> EngineResult<()>;
    /// Destroy a batch of snapshots by full name in one transaction.
    fn destroy_snaps(&mut self, snapshots: &[String], defer: bool) -> EngineResult<()>;
    fn clone_snapshot(
        &mut self,
        snapshot: RawHandle,
        target: &str,
        props: &PropertySet,
    ) -> EngineResult<()>;
    fn snapshot(&mut self, name: &str, recursive: bool, props: &PropertySet) -> EngineResult<()>;
    fn rollback(&mut self, handle: RawHandle, snapshot: RawHandle, force: bool)
        -> EngineResult<()>;
    fn promote(&mut self, handle: RawHandle) -> EngineResult<()>;
    fn rename(
        &mut self,
        handle: RawHandle,
        new_name: &str,
        recursive: bool,
        force_unmount: bool,
    ) -> EngineResult<()>;
    fn bookmark(&mut self, source: &str, bookmark: &str) -> EngineResult<()>;

    fn hold(&mut self, snapshot: RawHandle, tag: &str, recursive: bool) -> EngineResult<()>;
    fn release(&mut self, snapshot: RawHandle, tag: &str, recursive: bool) -> EngineResult<()>;
    fn holds(&mut self, snapshot: RawHandle) -> EngineResult<Vec<RawHold>>;

    /// Mountpoint when mounted.
    fn is_mounted(&mut self, handle: RawHandle) -> EngineResult<Option<String>>;
    fn mount(
        &mut self,
        handle: RawHandle,
        options: Option<&str>,
        flags: MountFlags,
    ) -> EngineResult<()>;
    fn unmount(&mut self, handle: RawHandle, flags: UnmountFlags) -> EngineResult<()>;
    /// Unmount the dataset and every descendant.
    fn unmount_all(&mut self, handle: RawHandle, flags: UnmountFlags) -> EngineResult<()>;

    fn pool_of(&mut self, handle: RawHandle) -> EngineResult<RawPoolHandle>;
    fn pool_name(&self, pool: RawPoolHandle) -> EngineResult<String>;
    fn close_pool(&mut self, pool: RawPoolHandle);

    /// `literal` asks for raw numbers instead of human-readable sizes.
    fn prop_get(&mut self, handle: RawHandle, prop: ZfsProp, literal: bool)
        -> EngineResult<NativeValue>;

    fn prop_get_int(&mut self, handle: RawHandle, prop: ZfsProp) -> EngineResult<u64> {
        let value = self.prop_get(handle, prop, true)?;
        match value.value.as_str() {
            "-" | "none" | "" => Ok(0),
            text => text.parse().map_err(|_| ErrorCode::BadProp),
        }
    }

    fn prop_set(&mut self, handle: RawHandle, name: &str, value: &str) -> EngineResult<()>;
    /// User properties visible on the dataset, local, received or inherited.
    fn user_props(&mut self, handle: RawHandle) -> EngineResult<BTreeMap<String, UserPropEntry>>;
    fn userquota_get(&mut self, handle: RawHandle, name: &str, literal: bool)
        -> EngineResult<String>;
    fn written_get(&mut self, handle: RawHandle, name: &str, literal: bool)
        -> EngineResult<String>;

    /// Oldest generation send: bitmask flags, no redaction.
    fn send_legacy(
        &mut self,
        _handle: RawHandle,
        _from: Option<&str>,
        _sink: BorrowedFd<'_>,
        _flags: LzcSendFlags,
    ) -> EngineResult<()> {
        Err(ErrorCode::IocNotSupported)
    }

    fn send_one(
        &mut self,
        _handle: RawHandle,
        _from: Option<&str>,
        _sink: BorrowedFd<'_>,
        _flags: &SendFlags,
        _redact_book: Option<&str>,
    ) -> EngineResult<()> {
        Err(ErrorCode::IocNotSupported)
    }

    fn send_one_by_value(
        &mut self,
        _handle: RawHandle,
        _from: Option<&str>,
        _sink: BorrowedFd<'_>,
        _flags: SendFlags,
    ) -> EngineResult<()> {
        Err(ErrorCode::IocNotSupported)
    }

    fn send_resume(
        &mut self,
        flags: &SendFlags,
        sink: BorrowedFd<'_>,
        token: &str,
    ) -> EngineResult<()>;

    /// Typed size estimate.
    fn estimate_send(
        &mut self,
        _handle: RawHandle,
        _from: Option<&str>,
        _flags: &SendFlags,
    ) -> EngineResult<u64> {
        Err(ErrorCode::IocNotSupported)
    }

    /// Raw command interface; used for estimates on the oldest generation.
    fn ioctl(&mut self, _request: IoctlRequest, _cmd: &mut RawCommand) -> EngineResult<()> {
        Err(ErrorCode::IocNotSupported)
    }

    fn receive(
        &mut self,
        target: &str,
        props: &PropertySet,
        flags: &RecvFlags,
        source: BorrowedFd<'_>,
    ) -> EngineResult<()>;
}
