// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! The process-wide registry. Everything runs in one test because the
//! singleton cannot be reset within a process.

use serial_test::serial;
use zadm_core::{registry, Dataset, Error};
use zadm_engine::{ErrorCode, MemoryEngine};

#[test]
#[serial]
fn global_registry_lifecycle() {
    assert!(matches!(registry::get_handle(), Err(Error::NotInitialized)));
    assert!(matches!(registry::last_error(), Err(Error::NotInitialized)));

    let engine = MemoryEngine::new();
    let probe = engine.probe();
    probe.add_pool("tank").unwrap();
    let installed = registry::init(Box::new(engine)).unwrap();

    let again = registry::init(Box::new(MemoryEngine::new()));
    assert!(matches!(again, Err(Error::AlreadyInitialized)));

    let handle = registry::get_handle().unwrap();
    assert!(std::ptr::eq(installed, handle));

    assert!(Dataset::open(handle, "tank/missing").is_err());
    assert_eq!(registry::last_error().unwrap(), ErrorCode::NoEnt);
    assert!(!registry::last_error_text().unwrap().is_empty());

    registry::clear_last_error().unwrap();
    assert_eq!(registry::last_error().unwrap(), ErrorCode::Success);

    let tank = Dataset::open(handle, "tank").unwrap();
    assert_eq!(tank.name(), "tank");
    drop(tank);
    assert_eq!(probe.open_handles(), 0);
}
