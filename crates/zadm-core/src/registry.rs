// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Handle registry.
//!
//! A [`Registry`] owns the one engine session the process talks through.
//! The engine is not reentrant, so every call holds the registry's lock
//! for its whole duration. Each call returns an explicit [`Result`]; the
//! registry also remembers the most recent failure for callers that want
//! the classic last-error view.
//!
//! Most code passes a `&Registry` around. Programs that want a single
//! process-wide session use [`init`] and [`get_handle`].

use crate::error::{Error, Result};
use crate::send::SendDispatch;
use std::sync::{Mutex, MutexGuard, OnceLock, PoisonError};
use tracing::{debug, trace};
use zadm_engine::{Capabilities, Engine, EngineResult, EngineVersion, ErrorCode};

struct LastError {
    code: ErrorCode,
    text: String,
}

impl Default for LastError {
    fn default() -> Self {
        LastError {
            code: ErrorCode::Success,
            text: String::new(),
        }
    }
}

pub struct Registry {
    engine: Mutex<Box<dyn Engine>>,
    version: EngineVersion,
    capabilities: Capabilities,
    dispatch: SendDispatch,
    last: Mutex<LastError>,
}

impl Registry {
    /// Wrap an engine session, resolving its capabilities once.
    pub fn new(engine: Box<dyn Engine>) -> Self {
        let version = engine.version();
        Self::with_capabilities(engine, Capabilities::from(version))
    }

    /// Wrap an engine session with capabilities chosen by the caller, e.g.
    /// from a configured generation override.
    pub fn with_capabilities(engine: Box<dyn Engine>, capabilities: Capabilities) -> Self {
        let version = engine.version();
        debug!(operation = "registry_new", version = %version, generation = ?capabilities.generation, "Engine session registered");
        Registry {
            engine: Mutex::new(engine),
            version,
            capabilities,
            dispatch: SendDispatch::for_capabilities(&capabilities),
            last: Mutex::new(LastError::default()),
        }
    }

    pub fn version(&self) -> EngineVersion {
        self.version
    }

    pub fn capabilities(&self) -> Capabilities {
        self.capabilities
    }

    pub(crate) fn dispatch(&self) -> &SendDispatch {
        &self.dispatch
    }

    fn lock_engine(&self) -> MutexGuard<'_, Box<dyn Engine>> {
        self.engine.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_last(&self) -> MutexGuard<'_, LastError> {
        self.last.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Run one engine call under the session lock. A failure is recorded as
    /// the registry's last error and returned with the engine's own
    /// description.
    pub fn call<T>(
        &self,
        operation: &str,
        f: impl FnOnce(&mut dyn Engine) -> EngineResult<T>,
    ) -> Result<T> {
        let mut engine = self.lock_engine();
        trace!(operation = %operation, "Engine call");
        match f(&mut **engine) {
            Ok(value) => Ok(value),
            Err(code) => {
                let mut description = engine.last_error_description();
                if description.is_empty() {
                    description = code.describe().to_string();
                }
                drop(engine);
                debug!(operation = %operation, code = ?code, description = %description, "Engine call failed");
                let mut last = self.lock_last();
                last.code = code;
                last.text = description.clone();
                Err(Error::Engine {
                    code,
                    description,
                    context: operation.to_string(),
                })
            }
        }
    }

    /// Run an engine call that cannot fail, such as closing a handle.
    pub fn with_engine<T>(&self, f: impl FnOnce(&mut dyn Engine) -> T) -> T {
        let mut engine = self.lock_engine();
        f(&mut **engine)
    }

    pub fn last_error(&self) -> ErrorCode {
        self.lock_last().code
    }

    /// Description of the last failure; empty after success or a clear.
    pub fn last_error_text(&self) -> String {
        self.lock_last().text.clone()
    }

    pub fn clear_last_error(&self) {
        *self.lock_last() = LastError::default();
        self.lock_engine().clear_last_error();
    }
}

static GLOBAL: OnceLock<Registry> = OnceLock::new();

/// Install the process-wide registry. Only the first call succeeds.
pub fn init(engine: Box<dyn Engine>) -> Result<&'static Registry> {
    init_registry(Registry::new(engine))
}

/// Install an already built registry as the process-wide one.
pub fn init_registry(registry: Registry) -> Result<&'static Registry> {
    GLOBAL
        .set(registry)
        .map_err(|_| Error::AlreadyInitialized)?;
    get_handle()
}

/// The process-wide registry.
pub fn get_handle() -> Result<&'static Registry> {
    GLOBAL.get().ok_or(Error::NotInitialized)
}

pub fn last_error() -> Result<ErrorCode> {
    get_handle().map(Registry::last_error)
}

pub fn last_error_text() -> Result<String> {
    get_handle().map(Registry::last_error_text)
}

pub fn clear_last_error() -> Result<()> {
    get_handle().map(Registry::clear_last_error)
}

#[cfg(test)]
mod tests {
    use super::*;
    use zadm_engine::{MemoryEngine, TypeMask};

    fn registry() -> Registry {
        let engine = MemoryEngine::new();
        engine.probe().add_pool("tank").unwrap();
        Registry::new(Box::new(engine))
    }

    #[test]
    fn failures_are_recorded_and_cleared() {
        let registry = registry();
        let err = registry
            .call("open", |e| e.open("tank/missing", TypeMask::ALL))
            .unwrap_err();
        assert_eq!(err.code(), Some(ErrorCode::NoEnt));
        assert_eq!(registry.last_error(), ErrorCode::NoEnt);
        assert!(registry.last_error_text().contains("tank/missing"));

        registry.clear_last_error();
        assert_eq!(registry.last_error(), ErrorCode::Success);
        assert!(registry.last_error_text().is_empty());
    }

    #[test]
    fn success_leaves_last_error_alone() {
        let registry = registry();
        let _ = registry.call("open", |e| e.open("nope", TypeMask::ALL));
        let handle = registry
            .call("open", |e| e.open("tank", TypeMask::ALL))
            .unwrap();
        registry.with_engine(|e| e.close(handle));
        assert_eq!(registry.last_error(), ErrorCode::NoEnt);
    }

    #[test]
    fn capabilities_follow_engine_version() {
        let engine = MemoryEngine::with_version(EngineVersion::new(0, 7, 13));
        let registry = Registry::new(Box::new(engine));
        assert!(registry.capabilities().legacy_estimate);
        assert!(!registry.capabilities().has_redaction);
    }
}
