// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

use anyhow::{Context, Result};
use zadm_cli::{Cli, Parser};
use zadm_core::ZadmConfig;

fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = ZadmConfig::load(cli.config.as_deref()).context("cannot load configuration")?;
    if let Some(backend) = cli.backend {
        config.engine.backend = backend;
    }
    cli.logging
        .clone()
        .init("zadm-cli", config.log_level, config.log_format)?;
    tracing::debug!(config = ?config, "Configuration loaded");

    let registry = config
        .connect()
        .with_context(|| format!("cannot open the {:?} engine", config.engine.backend))?;
    cli.command.run(&registry, cli.json)
}
