// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Send and receive commands

use crate::output::Output;
use anyhow::{Context, Result};
use clap::Args;
use serde_json::json;
use std::os::fd::BorrowedFd;
use zadm_core::{Dataset, Registry, SendRequest, SendStream};
use zadm_engine::{PropertySet, RecvFlags, SendFlags};

#[derive(Args, Clone, Debug, Default)]
#[command(about = "Write a send stream of a snapshot to stdout")]
pub struct SendArgs {
    /// Incremental base: full name, `@snap` or `#bookmark`
    #[arg(short = 'i', long = "incremental")]
    pub from: Option<String>,

    /// Allow blocks larger than 128K
    #[arg(short = 'L', long)]
    pub large_block: bool,

    /// Keep embedded data blocks embedded
    #[arg(short = 'e', long)]
    pub embed: bool,

    /// Send compressed blocks as they are stored
    #[arg(short = 'c', long)]
    pub compressed: bool,

    /// Send raw, still encrypted blocks
    #[arg(short = 'w', long)]
    pub raw: bool,

    /// Print the engine's progress lines on stderr
    #[arg(short = 'v', long)]
    pub verbose: bool,

    /// Redaction bookmark; ignored by engines without redaction
    #[arg(long = "redact")]
    pub redact_book: Option<String>,

    /// Print the estimated stream size instead of sending
    #[arg(long)]
    pub estimate: bool,

    pub snapshot: String,
}

impl SendArgs {
    pub fn request(&self) -> SendRequest {
        SendRequest {
            from: self.from.clone(),
            flags: SendFlags {
                large_block: self.large_block,
                embed_data: self.embed,
                compress: self.compressed,
                raw: self.raw,
                verbose: self.verbose,
                ..Default::default()
            },
            redact_book: self.redact_book.clone(),
        }
    }

    /// Send into `sink`. `out` receives the estimate or, in verbose mode,
    /// the engine's diagnostics; it must not share a descriptor with `sink`.
    pub fn run(&self, registry: &Registry, sink: BorrowedFd<'_>, out: &mut Output<'_>) -> Result<()> {
        let snapshot = Dataset::open(registry, &self.snapshot)?;
        let mut stream = SendStream::new(&snapshot, self.request());

        if self.estimate {
            let size = stream
                .estimate()
                .with_context(|| format!("cannot estimate send of '{}'", self.snapshot))?;
            return out.emit(
                &[vec![snapshot.name().to_string(), size.to_string()]],
                json!({ "name": snapshot.name(), "from": stream.from(), "estimated_size": size }),
            );
        }

        let report = stream
            .send(sink)
            .with_context(|| format!("cannot send '{}'", self.snapshot))?;
        out.note(&report.diagnostics)
    }
}

#[derive(Args, Clone, Debug, Default)]
#[command(about = "Receive a send stream from stdin")]
pub struct ReceiveArgs {
    /// Roll back or replace the target to make the receive possible
    #[arg(short = 'F', long)]
    pub force: bool,

    /// Do not mount the received filesystem
    #[arg(short = 'u', long)]
    pub nomount: bool,

    /// Keep partial state so an interrupted receive can resume
    #[arg(short = 's', long)]
    pub resumable: bool,

    pub target: String,
}

impl ReceiveArgs {
    pub fn run(&self, registry: &Registry, source: BorrowedFd<'_>, out: &mut Output<'_>) -> Result<()> {
        let flags = RecvFlags {
            force: self.force,
            nomount: self.nomount,
            resumable: self.resumable,
            ..Default::default()
        };
        zadm_core::receive(registry, &self.target, &PropertySet::new(), &flags, source)
            .with_context(|| format!("cannot receive into '{}'", self.target))?;
        out.emit(&[vec![self.target.clone()]], json!({ "received": self.target }))
    }
}

#[derive(Args, Clone, Debug)]
#[command(about = "Discard the partial state of an interrupted resumable receive")]
pub struct AbortReceiveArgs {
    pub name: String,
}

impl AbortReceiveArgs {
    pub fn run(&self, registry: &Registry, out: &mut Output<'_>) -> Result<()> {
        zadm_core::abort_resumable(registry, &self.name)?;
        out.emit(&[vec![self.name.clone()]], json!({ "aborted": self.name }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Seek, SeekFrom};
    use std::os::fd::AsFd;
    use zadm_engine::{EngineVersion, MemoryEngine, MemoryProbe, SendPath};

    fn setup(version: EngineVersion) -> (Registry, MemoryProbe) {
        let engine = MemoryEngine::with_version(version);
        let probe = engine.probe();
        probe.add_pool("tank").unwrap();
        probe.add_filesystem("tank/home").unwrap();
        probe.add_snapshot("tank/home@mon").unwrap();
        probe.add_snapshot("tank/home@tue").unwrap();
        (Registry::new(Box::new(engine)), probe)
    }

    #[test]
    fn flags_map_onto_the_request() {
        let args = SendArgs {
            from: Some("@mon".into()),
            compressed: true,
            large_block: true,
            snapshot: "tank/home@tue".into(),
            ..Default::default()
        };
        let request = args.request();
        assert!(request.flags.compress && request.flags.large_block);
        assert!(!request.flags.raw && !request.flags.embed_data);
        assert_eq!(request.from.as_deref(), Some("@mon"));
    }

    #[test]
    fn send_then_receive_through_a_file() {
        let (registry, probe) = setup(EngineVersion::new(2, 1, 5));
        let mut file = tempfile::tempfile().unwrap();
        let args = SendArgs {
            snapshot: "tank/home@mon".into(),
            ..Default::default()
        };
        let mut diagnostics = Vec::new();
        args.run(&registry, file.as_fd(), &mut Output::new(&mut diagnostics, false))
            .unwrap();
        assert!(diagnostics.is_empty());
        assert_eq!(probe.sends()[0].path, SendPath::ByReference);

        file.seek(SeekFrom::Start(0)).unwrap();
        let mut stream = String::new();
        file.read_to_string(&mut stream).unwrap();
        assert!(stream.starts_with("ZSTREAM tank/home@mon"));

        file.seek(SeekFrom::Start(0)).unwrap();
        let recv = ReceiveArgs {
            target: "tank/copy".into(),
            nomount: true,
            ..Default::default()
        };
        let mut printed = Vec::new();
        recv.run(&registry, file.as_fd(), &mut Output::new(&mut printed, false))
            .unwrap();
        assert_eq!(String::from_utf8(printed).unwrap(), "tank/copy\n");
        assert!(probe.exists("tank/copy@mon"));
    }

    #[test]
    fn estimate_prints_a_size() {
        let (registry, probe) = setup(EngineVersion::new(0, 8, 1));
        probe.set_referenced("tank/home", 4096).unwrap();
        let sink = tempfile::tempfile().unwrap();
        let args = SendArgs {
            from: Some("@mon".into()),
            estimate: true,
            snapshot: "tank/home@tue".into(),
            ..Default::default()
        };
        let mut buf = Vec::new();
        args.run(&registry, sink.as_fd(), &mut Output::new(&mut buf, true))
            .unwrap();
        let value: serde_json::Value = serde_json::from_slice(&buf).unwrap();
        assert_eq!(value["from"], "tank/home@mon");
        assert!(value["estimated_size"].is_u64());
        assert!(probe.sends().is_empty());
    }

    #[test]
    fn abort_without_state_fails() {
        let (registry, _probe) = setup(EngineVersion::new(2, 1, 5));
        let args = AbortReceiveArgs {
            name: "tank/home".into(),
        };
        let mut buf = Vec::new();
        let err = args
            .run(&registry, &mut Output::new(&mut buf, false))
            .unwrap_err();
        assert!(err.to_string().contains("does not have any resumable receive state"));
    }
}
