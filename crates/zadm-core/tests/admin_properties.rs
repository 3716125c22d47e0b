// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! End-to-end behavior of the core against the in-memory engine.

use std::os::fd::AsFd;
use zadm_core::{
    destroy, list_children, DatasetTree, Dataset, DestroyOptions, Error, Provenance, Registry,
    SendRequest, SendStream,
};
use zadm_engine::{
    EngineVersion, ErrorCode, LzcSendFlags, MemoryEngine, MemoryProbe, SendFlags, SendPath,
    ZfsProp,
};

fn pool() -> (Registry, MemoryProbe) {
    pool_at(EngineVersion::new(2, 1, 5))
}

fn pool_at(version: EngineVersion) -> (Registry, MemoryProbe) {
    let engine = MemoryEngine::with_version(version);
    let probe = engine.probe();
    probe.add_pool("pool").unwrap();
    probe.add_filesystem("pool/ds").unwrap();
    probe.add_filesystem("pool/ds/child").unwrap();
    probe.add_snapshot("pool/ds@base").unwrap();
    (Registry::new(Box::new(engine)), probe)
}

#[test]
fn open_and_close_releases_every_handle() {
    let (registry, probe) = pool();
    for path in ["pool", "pool/ds", "pool/ds/child", "pool/ds@base"] {
        let dataset = Dataset::open(&registry, path).unwrap();
        let pool_handle = dataset.pool().unwrap();
        assert_eq!(pool_handle.name(), "pool");
        drop(pool_handle);
        drop(dataset);
    }
    let tree = DatasetTree::open_tree(&registry, "pool").unwrap();
    assert!(tree.find("pool/ds/child").is_some());
    drop(tree);

    assert_eq!(probe.open_handles(), 0);
    assert_eq!(probe.open_pool_handles(), 0);
    assert_eq!(probe.double_closes(), 0);
}

#[test]
fn inherited_provenance_names_a_proper_ancestor() {
    let (registry, probe) = pool();
    probe.set_local("pool", "compression", "lz4").unwrap();
    probe.set_local("pool/ds", "org:owner", "storage-team").unwrap();

    let child = Dataset::open(&registry, "pool/ds/child").unwrap();
    let records = [
        child.get_property(ZfsProp::Compression).unwrap(),
        child.get_user_property("org:owner").unwrap(),
    ];
    for record in records {
        match &record.provenance {
            Provenance::Inherited { from } => {
                assert_ne!(from, child.name());
                assert!(child.name().starts_with(&format!("{}/", from)));
                assert_eq!(record.source, format!("inherited:{}", from));
            }
            other => panic!("expected inherited, got {other}"),
        }
    }
}

#[test]
fn missing_entries_read_as_dash_with_no_provenance() {
    let (registry, _probe) = pool();
    let ds = Dataset::open(&registry, "pool/ds").unwrap();

    let user = ds.get_user_property("org:never-set").unwrap();
    assert_eq!(user.value, "-");
    assert_eq!(user.provenance, Provenance::None);

    let quota = ds.get_user_property("userquota@alice").unwrap();
    assert_eq!(quota.value, "-");
    assert_eq!(quota.provenance, Provenance::None);
}

#[test]
fn used_is_numeric_with_provenance() {
    let (registry, _probe) = pool();
    let ds = Dataset::open(&registry, "pool/ds").unwrap();
    let used = ds.get_property(ZfsProp::Used).unwrap();
    assert!(!used.value.is_empty());
    assert!(used.value.parse::<u64>().is_ok(), "not numeric: {}", used.value);
    assert!(matches!(used.provenance, Provenance::Local | Provenance::None));
}

#[test]
fn compression_is_refused_for_snapshots() {
    let (registry, _probe) = pool();
    let snap = Dataset::open(&registry, "pool/ds@base").unwrap();
    let err = snap.get_property(ZfsProp::Compression).unwrap_err();
    assert_eq!(err.code(), Some(ErrorCode::PropType));
}

#[test]
fn zero_children_is_empty_not_missing() {
    let (registry, _probe) = pool();
    let leaf = Dataset::open(&registry, "pool/ds/child").unwrap();
    let children = list_children(&leaf).unwrap();
    assert!(children.is_empty());

    let err = Dataset::open(&registry, "pool/nope").unwrap_err();
    assert!(matches!(err, Error::NotFound { code: ErrorCode::NoEnt, .. }));
}

#[test]
fn clone_blocks_destroy_of_its_origin() {
    let (registry, probe) = pool();
    probe.add_clone("pool/ds@base", "pool/copy").unwrap();
    let snap = Dataset::open(&registry, "pool/ds@base").unwrap();

    match destroy::destroy(&snap, DestroyOptions::default()) {
        Err(Error::DependentsExist { dependents, .. }) => assert_eq!(dependents, vec!["pool/copy"]),
        other => panic!("expected dependents, got {other:?}"),
    }
    assert!(probe.exists("pool/ds@base"));

    Dataset::open(&registry, "pool/copy").unwrap().destroy(false).unwrap();
    destroy::destroy(&snap, DestroyOptions::default()).unwrap();
    assert!(!probe.exists("pool/ds@base"));
}

#[test]
fn legacy_engine_gets_only_the_compress_bit() {
    let (registry, probe) = pool_at(EngineVersion::new(0, 7, 13));
    let snap = Dataset::open(&registry, "pool/ds@base").unwrap();
    let sink = tempfile::tempfile().unwrap();

    let request = SendRequest {
        flags: SendFlags {
            compress: true,
            ..Default::default()
        },
        redact_book: Some("pool/ds#redact".to_string()),
        ..Default::default()
    };
    SendStream::new(&snap, request).send(sink.as_fd()).unwrap();

    let sends = probe.sends();
    assert_eq!(sends.len(), 1);
    assert_eq!(sends[0].path, SendPath::Legacy);
    assert_eq!(sends[0].mask, Some(LzcSendFlags::COMPRESS));
    assert_eq!(sends[0].redact_book, None);
}
