// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Streams written by one in-memory engine are received by another, the
//! way a replication pipe connects two hosts.

use std::io::{Read, Seek, SeekFrom};
use std::ops::ControlFlow;
use std::os::fd::AsFd;
use zadm_engine::{
    Engine, ErrorCode, MemoryEngine, PropertySet, RawHandle, RecvFlags, SendFlags, TypeMask,
};

fn source_engine() -> MemoryEngine {
    let engine = MemoryEngine::new();
    let probe = engine.probe();
    probe.add_pool("tank").unwrap();
    probe.add_filesystem("tank/home").unwrap();
    probe.add_snapshot("tank/home@mon").unwrap();
    probe.add_snapshot("tank/home@tue").unwrap();
    probe.set_referenced("tank/home", 8192).unwrap();
    engine
}

fn send_to_file(
    engine: &mut MemoryEngine,
    snapshot: &str,
    from: Option<&str>,
) -> std::fs::File {
    let mut file = tempfile::tempfile().unwrap();
    let handle = engine.open(snapshot, TypeMask::ALL).unwrap();
    engine
        .send_one(handle, from, file.as_fd(), &SendFlags::default(), None)
        .unwrap();
    engine.close(handle);
    file.seek(SeekFrom::Start(0)).unwrap();
    file
}

#[test]
fn full_then_incremental_replication() {
    let mut source = source_engine();
    let mut target = MemoryEngine::new();
    let target_probe = target.probe();
    target_probe.add_pool("backup").unwrap();

    let mut full = send_to_file(&mut source, "tank/home@mon", None);
    let mut text = String::new();
    full.read_to_string(&mut text).unwrap();
    assert!(text.starts_with("ZSTREAM tank/home@mon - "));
    full.seek(SeekFrom::Start(0)).unwrap();

    let flags = RecvFlags::default();
    target
        .receive("backup/home", &PropertySet::new(), &flags, full.as_fd())
        .unwrap();
    assert!(target_probe.exists("backup/home@mon"));

    let incremental = send_to_file(&mut source, "tank/home@tue", Some("tank/home@mon"));
    target
        .receive("backup/home", &PropertySet::new(), &flags, incremental.as_fd())
        .unwrap();
    assert!(target_probe.exists("backup/home@tue"));

    // replaying the same stream collides with the received snapshot
    let replay = send_to_file(&mut source, "tank/home@tue", Some("tank/home@mon"));
    let err = target
        .receive("backup/home", &PropertySet::new(), &flags, replay.as_fd())
        .unwrap_err();
    assert_eq!(err, ErrorCode::Exists);

    assert_eq!(source.probe().open_handles(), 0);
}

#[test]
fn incremental_into_missing_destination_fails() {
    let mut source = source_engine();
    let mut target = MemoryEngine::new();
    target.probe().add_pool("backup").unwrap();

    let stream = send_to_file(&mut source, "tank/home@tue", Some("tank/home@mon"));
    let err = target
        .receive("backup/home", &PropertySet::new(), &RecvFlags::default(), stream.as_fd())
        .unwrap_err();
    assert_eq!(err, ErrorCode::NoEnt);
    assert!(!target.probe().exists("backup/home"));
}

#[test]
fn snapspec_selection_through_the_trait() {
    let mut engine = source_engine();
    engine.probe().add_snapshot("tank/home@wed").unwrap();
    let home = engine.open("tank/home", TypeMask::ALL).unwrap();

    let mut delivered: Vec<RawHandle> = Vec::new();
    engine
        .iter_snapspec(home, "tue%wed", &mut |h: RawHandle| {
            delivered.push(h);
            ControlFlow::Continue(())
        })
        .unwrap();
    let names: Vec<String> = delivered.iter().map(|h| engine.name(*h).unwrap()).collect();
    assert_eq!(names, vec!["tank/home@tue", "tank/home@wed"]);

    for handle in delivered {
        engine.close(handle);
    }
    engine.close(home);
    assert_eq!(engine.probe().open_handles(), 0);
}
