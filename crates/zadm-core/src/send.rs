// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Send-stream driver.
//!
//! Engine generations differ in how a send is requested: the oldest takes
//! a bitmask of stream features and estimates sizes through the raw command
//! block, one takes the flags struct by value, and current engines take it
//! by reference together with a redaction bookmark. The registry resolves a
//! [`SendDispatch`] once from the engine's capabilities; the driver only
//! ever goes through it.

use crate::dataset::Dataset;
use crate::error::{Error, Result};
use crate::registry::Registry;
use std::fmt;
use std::os::fd::{AsFd, BorrowedFd};
use tracing::{debug, info, info_span};
use zadm_engine::{
    capture_stdout, filesystem_of_name, Capabilities, DatasetType, Engine, EngineResult,
    IoctlRequest, RawCommand, RawHandle, SendFlags, ZfsProp,
};

type SendFn = fn(
    &mut dyn Engine,
    RawHandle,
    Option<&str>,
    BorrowedFd<'_>,
    &SendFlags,
    Option<&str>,
) -> EngineResult<()>;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum EstimateVia {
    RawCommand,
    Typed,
}

/// Send and estimate primitives chosen for one engine generation.
#[derive(Clone, Copy)]
pub(crate) struct SendDispatch {
    send: SendFn,
    estimate: EstimateVia,
}

impl SendDispatch {
    pub(crate) fn for_capabilities(capabilities: &Capabilities) -> Self {
        let send: SendFn = if capabilities.has_redaction {
            send_by_reference
        } else if capabilities.flags_by_value {
            send_by_value
        } else {
            send_legacy
        };
        let estimate = if capabilities.legacy_estimate {
            EstimateVia::RawCommand
        } else {
            EstimateVia::Typed
        };
        SendDispatch { send, estimate }
    }
}

fn send_legacy(
    engine: &mut dyn Engine,
    handle: RawHandle,
    from: Option<&str>,
    sink: BorrowedFd<'_>,
    flags: &SendFlags,
    _redact_book: Option<&str>,
) -> EngineResult<()> {
    engine.send_legacy(handle, from, sink, flags.to_legacy_mask())
}

fn send_by_value(
    engine: &mut dyn Engine,
    handle: RawHandle,
    from: Option<&str>,
    sink: BorrowedFd<'_>,
    flags: &SendFlags,
    _redact_book: Option<&str>,
) -> EngineResult<()> {
    engine.send_one_by_value(handle, from, sink, *flags)
}

fn send_by_reference(
    engine: &mut dyn Engine,
    handle: RawHandle,
    from: Option<&str>,
    sink: BorrowedFd<'_>,
    flags: &SendFlags,
    redact_book: Option<&str>,
) -> EngineResult<()> {
    engine.send_one(handle, from, sink, flags, redact_book)
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SendState {
    Idle,
    Estimating,
    Sending,
    Done,
    Failed,
}

impl SendState {
    pub fn as_str(self) -> &'static str {
        match self {
            SendState::Idle => "idle",
            SendState::Estimating => "estimating",
            SendState::Sending => "sending",
            SendState::Done => "done",
            SendState::Failed => "failed",
        }
    }

    fn can_move_to(self, next: SendState) -> bool {
        matches!(
            (self, next),
            (SendState::Idle, SendState::Estimating)
                | (SendState::Idle, SendState::Sending)
                | (SendState::Estimating, SendState::Sending)
                | (SendState::Sending, SendState::Done)
        ) || (next == SendState::Failed && !matches!(self, SendState::Done | SendState::Failed))
    }
}

impl fmt::Display for SendState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What to send, relative to the dataset the stream is built for.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SendRequest {
    /// Incremental base: a full name, or `@snap` / `#book` relative to the
    /// dataset's filesystem
    pub from: Option<String>,
    pub flags: SendFlags,
    pub redact_book: Option<String>,
}

/// Outcome of a completed send.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SendReport {
    pub estimated_size: Option<u64>,
    /// Text the engine wrote to standard output while sending
    pub diagnostics: String,
    pub state: SendState,
}

/// One send of one dataset, driven through its states.
pub struct SendStream<'d, 'r> {
    dataset: &'d Dataset<'r>,
    from: Option<String>,
    flags: SendFlags,
    redact_book: Option<String>,
    state: SendState,
    estimate: Option<u64>,
    operation_id: String,
}

impl<'d, 'r> SendStream<'d, 'r> {
    pub fn new(dataset: &'d Dataset<'r>, request: SendRequest) -> Self {
        let from = request
            .from
            .map(|from| resolve_from(dataset.name(), &from));
        SendStream {
            dataset,
            from,
            flags: request.flags,
            redact_book: request.redact_book,
            state: SendState::Idle,
            estimate: None,
            operation_id: zadm_logging::operation_id(),
        }
    }

    pub fn state(&self) -> SendState {
        self.state
    }

    /// Incremental base after shorthand resolution.
    pub fn from(&self) -> Option<&str> {
        self.from.as_deref()
    }

    fn registry(&self) -> &'r Registry {
        self.dataset.registry()
    }

    fn move_to(&mut self, next: SendState) -> Result<()> {
        if !self.state.can_move_to(next) {
            return Err(Error::InvalidState {
                from: self.state.as_str(),
                to: next.as_str(),
            });
        }
        debug!(operation_id = %self.operation_id, from = %self.state, to = %next, "Send state change");
        self.state = next;
        Ok(())
    }

    fn fail<T>(&mut self, err: Error) -> Result<T> {
        self.state = SendState::Failed;
        Err(err)
    }

    /// Estimate the stream size in bytes.
    pub fn estimate(&mut self) -> Result<u64> {
        let span = info_span!("send_estimate", operation_id = %self.operation_id, dataset = %self.dataset.name());
        let _entered = span.enter();

        self.move_to(SendState::Estimating)?;
        match self.run_estimate() {
            Ok(size) => {
                debug!(operation_id = %self.operation_id, size, "Send size estimated");
                self.estimate = Some(size);
                Ok(size)
            }
            Err(err) => self.fail(err),
        }
    }

    fn run_estimate(&mut self) -> Result<u64> {
        if let Some(from) = self.from.as_deref() {
            if origin_of(self.dataset)?.as_deref() == Some(from) {
                self.flags.from_origin = true;
                self.from = None;
            }
        }
        match self.registry().dispatch().estimate {
            EstimateVia::RawCommand => self.estimate_raw(),
            EstimateVia::Typed => {
                let handle = self.dataset.raw();
                let (from, flags) = (self.from.as_deref(), &self.flags);
                self.registry()
                    .call("estimate", |e| e.estimate_send(handle, from, flags))
            }
        }
    }

    fn estimate_raw(&self) -> Result<u64> {
        let registry = self.registry();
        let mut cmd = RawCommand::new(self.dataset.name());
        if let Some(from) = self.from.as_deref() {
            let base = Dataset::open(registry, from)?;
            if base.dataset_type() == DatasetType::Bookmark {
                return Err(Error::InvalidArgument(format!(
                    "cannot estimate from bookmark '{}' on engine {}",
                    from,
                    registry.version()
                )));
            }
            cmd.value = from.to_string();
            cmd.fromobj = objset_id(&base)?;
        }
        cmd.obj = u64::from(self.flags.from_origin);
        cmd.sendobj = objset_id(self.dataset)?;
        cmd.guid = 1;
        cmd.flags = u64::from(self.flags.to_legacy_mask().bits());

        registry.call("ioctl", |e| e.ioctl(IoctlRequest::Send, &mut cmd))?;
        Ok(cmd.objset_type)
    }

    /// Write the stream to `sink`. Runs from `Idle` or after an estimate.
    pub fn send(&mut self, sink: BorrowedFd<'_>) -> Result<SendReport> {
        let span = info_span!("send", operation_id = %self.operation_id, dataset = %self.dataset.name());
        let _entered = span.enter();

        self.move_to(SendState::Sending)?;
        let dispatch = self.registry().dispatch().send;
        match self.run_send(sink, dispatch) {
            Ok(diagnostics) => {
                self.move_to(SendState::Done)?;
                info!(operation_id = %self.operation_id, dataset = %self.dataset.name(), from = ?self.from, "Send complete");
                Ok(SendReport {
                    estimated_size: self.estimate,
                    diagnostics,
                    state: self.state,
                })
            }
            Err(err) => self.fail(err),
        }
    }

    /// Send through the by-reference primitive only, with an optional
    /// bookmark as incremental base. Stream-shaping flags are refused.
    pub fn send_one(&mut self, sink: BorrowedFd<'_>) -> Result<SendReport> {
        if let Some(from) = self.from.as_deref() {
            if !from.contains('#') {
                return Err(Error::InvalidArgument(
                    "send_one: from is not a bookmark".to_string(),
                ));
            }
        }
        let flags = &self.flags;
        let refused = [
            ("replicate", flags.replicate),
            ("do_all", flags.do_all),
            ("props", flags.props),
            ("dedup", flags.dedup),
            ("dry_run", flags.dry_run),
        ];
        if let Some((name, _)) = refused.iter().find(|(_, set)| *set) {
            return Err(Error::InvalidArgument(format!(
                "send_one: flag '{}' is not supported",
                name
            )));
        }

        let span = info_span!("send_one", operation_id = %self.operation_id, dataset = %self.dataset.name());
        let _entered = span.enter();
        self.move_to(SendState::Sending)?;
        match self.run_send(sink, send_by_reference) {
            Ok(diagnostics) => {
                self.move_to(SendState::Done)?;
                Ok(SendReport {
                    estimated_size: self.estimate,
                    diagnostics,
                    state: self.state,
                })
            }
            Err(err) => self.fail(err),
        }
    }

    fn run_send(&self, sink: BorrowedFd<'_>, send: SendFn) -> Result<String> {
        let registry = self.registry();
        let handle = self.dataset.raw();
        let from = self.from.as_deref();
        let redact_book = self.redact_book.as_deref();
        let flags = &self.flags;

        if flags.verbose || flags.dry_run {
            // The sink may be fd 1 itself; pin it before fd 1 is redirected.
            let pinned = sink.try_clone_to_owned()?;
            let sink = pinned.as_fd();
            let call = || registry.call("send", |e| send(e, handle, from, sink, flags, redact_book));
            let (result, captured) = capture_stdout(call)?;
            result?;
            Ok(captured)
        } else {
            registry.call("send", |e| send(e, handle, from, sink, flags, redact_book))?;
            Ok(String::new())
        }
    }
}

/// Continue an interrupted send from a receiver's resume token.
pub fn send_resume(
    registry: &Registry,
    flags: &SendFlags,
    sink: BorrowedFd<'_>,
    token: &str,
) -> Result<SendReport> {
    let operation_id = zadm_logging::operation_id();
    let span = info_span!("send_resume", operation_id = %operation_id);
    let _entered = span.enter();

    let diagnostics = if flags.verbose || flags.dry_run {
        let pinned = sink.try_clone_to_owned()?;
        let sink = pinned.as_fd();
        let call = || registry.call("send_resume", |e| e.send_resume(flags, sink, token));
        let (result, captured) = capture_stdout(call)?;
        result?;
        captured
    } else {
        registry.call("send_resume", |e| e.send_resume(flags, sink, token))?;
        String::new()
    };
    info!(operation_id = %operation_id, "Resumed send complete");
    Ok(SendReport {
        estimated_size: None,
        diagnostics,
        state: SendState::Done,
    })
}

fn resolve_from(dataset: &str, from: &str) -> String {
    if from.starts_with('@') || from.starts_with('#') {
        format!("{}{}", filesystem_of_name(dataset), from)
    } else {
        from.to_string()
    }
}

fn objset_id(dataset: &Dataset<'_>) -> Result<u64> {
    let handle = dataset.raw();
    dataset
        .registry()
        .call("prop_get_int", |e| e.prop_get_int(handle, ZfsProp::ObjsetId))
}

/// Origin snapshot of the filesystem a dataset belongs to.
fn origin_of(dataset: &Dataset<'_>) -> Result<Option<String>> {
    let filesystem = filesystem_of_name(dataset.name());
    let origin = if filesystem == dataset.name() {
        dataset.get_property(ZfsProp::Origin)?
    } else {
        Dataset::open_single(dataset.registry(), filesystem)?.get_property(ZfsProp::Origin)?
    };
    Ok(match origin.value.as_str() {
        "" | "-" => None,
        _ => Some(origin.value),
    })
}
