// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

use anyhow::Result;
use clap::Subcommand;
use serde_json::json;
use std::io;
use std::os::fd::AsFd;
use std::path::PathBuf;
use zadm_core::{Backend, Registry};
use zadm_logging::CliLoggingArgs;

pub mod datasets;
pub mod output;
pub mod transfer;

pub use clap::Parser;
pub use output::Output;

#[derive(clap::Parser, Debug)]
#[command(
    name = "zadm",
    about = "Administer pooled copy-on-write datasets",
    version,
    propagate_version = true
)]
pub struct Cli {
    /// Configuration file layered over the system and user files
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Engine backend, overriding the configuration
    #[arg(long, global = true)]
    pub backend: Option<Backend>,

    /// Print JSON instead of tab-separated text
    #[arg(long, global = true)]
    pub json: bool,

    #[command(flatten)]
    pub logging: CliLoggingArgs,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    List(datasets::ListArgs),
    Get(datasets::GetArgs),
    Snapshot(datasets::SnapshotArgs),
    Bookmark(datasets::BookmarkArgs),
    Destroy(datasets::DestroyArgs),
    Send(transfer::SendArgs),
    Receive(transfer::ReceiveArgs),
    AbortReceive(transfer::AbortReceiveArgs),
    /// Show tool and engine versions
    Version,
}

impl Commands {
    /// Run against `registry`. A send stream goes to stdout, so its
    /// diagnostics go to stderr; receive reads stdin.
    pub fn run(&self, registry: &Registry, json: bool) -> Result<()> {
        let stdout = io::stdout();
        match self {
            Commands::Send(args) if !args.estimate => {
                let mut stderr = io::stderr();
                args.run(registry, stdout.as_fd(), &mut Output::new(&mut stderr, json))
            }
            Commands::Receive(args) => {
                let stdin = io::stdin();
                let mut lock = stdout.lock();
                args.run(registry, stdin.as_fd(), &mut Output::new(&mut lock, json))
            }
            _ => {
                let mut lock = stdout.lock();
                self.run_to(registry, &mut Output::new(&mut lock, json))
            }
        }
    }

    /// Run a command whose only output is `out`.
    pub fn run_to(&self, registry: &Registry, out: &mut Output<'_>) -> Result<()> {
        match self {
            Commands::List(args) => args.run(registry, out),
            Commands::Get(args) => args.run(registry, out),
            Commands::Snapshot(args) => args.run(registry, out),
            Commands::Bookmark(args) => args.run(registry, out),
            Commands::Destroy(args) => args.run(registry, out),
            Commands::AbortReceive(args) => args.run(registry, out),
            Commands::Send(args) => args.run(registry, io::stdout().as_fd(), out),
            Commands::Receive(args) => args.run(registry, io::stdin().as_fd(), out),
            Commands::Version => version(registry, out),
        }
    }
}

fn version(registry: &Registry, out: &mut Output<'_>) -> Result<()> {
    let tool = env!("CARGO_PKG_VERSION");
    let engine = registry.version().to_string();
    let generation = format!("{:?}", registry.capabilities().generation);
    out.emit(
        &[
            vec!["zadm".to_string(), tool.to_string()],
            vec!["engine".to_string(), engine.clone()],
        ],
        json!({ "zadm": tool, "engine": engine, "generation": generation }),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use zadm_engine::{EngineVersion, MemoryEngine};

    #[test]
    fn parses_global_flags_after_the_subcommand() {
        let cli = Cli::try_parse_from([
            "zadm", "list", "-r", "-t", "snapshot,bookmark", "tank", "--json", "--backend", "memory",
        ])
        .unwrap();
        assert!(cli.json);
        assert_eq!(cli.backend, Some(Backend::Memory));
        match cli.command {
            Commands::List(args) => {
                assert!(args.recursive);
                assert_eq!(args.paths, vec!["tank"]);
                assert!(args.types.is_some());
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn parses_send_flags() {
        let cli = Cli::try_parse_from([
            "zadm", "send", "-i", "@mon", "-L", "-c", "--redact", "#red", "tank/home@tue",
        ])
        .unwrap();
        let Commands::Send(args) = cli.command else {
            panic!("expected send");
        };
        assert_eq!(args.from.as_deref(), Some("@mon"));
        assert!(args.large_block && args.compressed && !args.raw);
        assert_eq!(args.redact_book.as_deref(), Some("#red"));
    }

    #[test]
    fn rejects_unknown_backends_and_types() {
        assert!(Cli::try_parse_from(["zadm", "--backend", "ioctl", "version"]).is_err());
        assert!(Cli::try_parse_from(["zadm", "list", "-t", "socket"]).is_err());
    }

    #[test]
    fn version_reports_the_engine() {
        let registry = Registry::new(Box::new(MemoryEngine::with_version(EngineVersion::new(0, 8, 1))));
        let mut buf = Vec::new();
        Commands::Version
            .run_to(&registry, &mut Output::new(&mut buf, false))
            .unwrap();
        let printed = String::from_utf8(buf).unwrap();
        assert!(printed.ends_with("engine\t0.8.1\n"));
    }
}
