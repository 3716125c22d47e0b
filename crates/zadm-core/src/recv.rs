// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Receiving streams and cleaning up interrupted receives.

use crate::dataset::Dataset;
use crate::error::{Error, Result};
use crate::registry::Registry;
use std::os::fd::BorrowedFd;
use tracing::{info, info_span};
use zadm_engine::{DatasetType, PropertySet, RecvFlags, TypeMask, ZfsProp};

/// Name of the hidden dataset a resumable receive into an existing
/// filesystem leaves behind.
pub fn partial_receive_name(name: &str) -> String {
    format!("{}/%recv", name)
}

/// Receive a stream read from `source` into `target`.
pub fn receive(
    registry: &Registry,
    target: &str,
    props: &PropertySet,
    flags: &RecvFlags,
    source: BorrowedFd<'_>,
) -> Result<()> {
    let operation_id = zadm_logging::operation_id();
    let span = info_span!("receive", operation_id = %operation_id, target = %target);
    let _entered = span.enter();

    registry.call("receive", |e| e.receive(target, props, flags, source))?;
    info!(operation_id = %operation_id, target = %target, dry_run = flags.dry_run, "Stream received");
    Ok(())
}

/// Throw away the partial state of an interrupted resumable receive into
/// `name`.
pub fn abort_resumable(registry: &Registry, name: &str) -> Result<()> {
    let containers = TypeMask::from(DatasetType::Filesystem) | DatasetType::Volume;
    let partial = partial_receive_name(name);
    if registry.with_engine(|e| e.exists(&partial, containers)) {
        Dataset::open(registry, &partial)?.destroy(false)?;
        info!(operation = "abort_resumable", dataset = %partial, "Partial receive destroyed");
        return Ok(());
    }

    let dataset = Dataset::open_single(registry, name)?;
    let inconsistent = dataset
        .get_property(ZfsProp::Inconsistent)
        .map(|p| p.value != "0" && p.value != "-")
        .unwrap_or(false);
    let has_token = dataset
        .get_property(ZfsProp::ReceiveResumeToken)
        .map(|p| p.value != "-" && !p.value.is_empty())
        .unwrap_or(false);
    if !inconsistent || !has_token {
        return Err(Error::InvalidArgument(format!(
            "'{}' does not have any resumable receive state to abort",
            name
        )));
    }
    dataset.destroy(false)?;
    info!(operation = "abort_resumable", dataset = %name, "Inconsistent dataset destroyed");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Seek, SeekFrom, Write};
    use std::os::fd::AsFd;
    use zadm_engine::{ErrorCode, MemoryEngine, MemoryProbe};

    fn setup() -> (Registry, MemoryProbe) {
        let engine = MemoryEngine::new();
        let probe = engine.probe();
        probe.add_pool("tank").unwrap();
        probe.add_filesystem("tank/dst").unwrap();
        (Registry::new(Box::new(engine)), probe)
    }

    fn stream(text: &str) -> std::fs::File {
        let mut file = tempfile::tempfile().unwrap();
        file.write_all(text.as_bytes()).unwrap();
        file.seek(SeekFrom::Start(0)).unwrap();
        file
    }

    #[test]
    fn full_stream_creates_the_target() {
        let (registry, probe) = setup();
        let source = stream("ZSTREAM src/fs@a - 7 4096\nEND\n");
        let mut props = PropertySet::new();
        props.add("org:origin", "src").unwrap();
        receive(&registry, "tank/new", &props, &RecvFlags::default(), source.as_fd()).unwrap();
        assert!(probe.exists("tank/new@a"));

        let ds = Dataset::open(&registry, "tank/new").unwrap();
        assert_eq!(ds.get_user_property("org:origin").unwrap().source, "received");
    }

    #[test]
    fn truncated_resumable_stream_can_be_aborted() {
        let (registry, probe) = setup();
        let source = stream("ZSTREAM src/fs@a - 7 4096\n");
        let flags = RecvFlags {
            resumable: true,
            force: true,
            ..Default::default()
        };
        let err = receive(&registry, "tank/dst", &PropertySet::new(), &flags, source.as_fd())
            .unwrap_err();
        assert_eq!(err.code(), Some(ErrorCode::BadStream));
        assert!(probe.exists("tank/dst/%recv"));

        abort_resumable(&registry, "tank/dst").unwrap();
        assert!(!probe.exists("tank/dst/%recv"));
        assert!(probe.exists("tank/dst"));
    }

    #[test]
    fn inconsistent_dataset_with_token_is_destroyed() {
        let (registry, probe) = setup();
        probe.add_filesystem("tank/dst/half").unwrap();
        probe.set_resume_state("tank/dst/half", "resume:src/fs@a:-").unwrap();
        abort_resumable(&registry, "tank/dst/half").unwrap();
        assert!(!probe.exists("tank/dst/half"));
        assert_eq!(probe.open_handles(), 0);
    }

    #[test]
    fn nothing_to_abort() {
        let (registry, _probe) = setup();
        let err = abort_resumable(&registry, "tank/dst").unwrap_err();
        assert_eq!(
            err.to_string(),
            "'tank/dst' does not have any resumable receive state to abort"
        );
    }
}
