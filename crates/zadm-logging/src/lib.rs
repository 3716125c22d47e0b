// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Logging setup shared by the zadm crates.
//!
//! Library crates only emit `tracing` events. Binaries call one of the
//! `init*` functions (usually through [`CliLoggingArgs::init`]) exactly once
//! at startup. `RUST_LOG` always wins over the configured level.

use serde::{Deserialize, Serialize};
use std::io;
use std::path::{Path, PathBuf};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

pub use tracing::Level;

/// Output format for log messages
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default, clap::ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human-readable plaintext format
    #[default]
    Plaintext,
    /// Structured JSON format
    Json,
}

impl std::fmt::Display for LogFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LogFormat::Plaintext => write!(f, "plaintext"),
            LogFormat::Json => write!(f, "json"),
        }
    }
}

impl std::str::FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "plaintext" => Ok(LogFormat::Plaintext),
            "json" => Ok(LogFormat::Json),
            _ => Err(format!(
                "Invalid log format: {}. Use 'plaintext' or 'json'",
                s
            )),
        }
    }
}

/// Log level accepted on the command line and in config files
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, clap::ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CliLogLevel {
    /// Only error conditions
    Error,
    /// Errors and warnings
    #[default]
    Warn,
    /// Administrative actions (create, destroy, send)
    Info,
    /// Every engine call
    Debug,
    /// All above plus iteration detail
    Trace,
}

impl From<CliLogLevel> for Level {
    fn from(level: CliLogLevel) -> Self {
        match level {
            CliLogLevel::Error => Level::ERROR,
            CliLogLevel::Warn => Level::WARN,
            CliLogLevel::Info => Level::INFO,
            CliLogLevel::Debug => Level::DEBUG,
            CliLogLevel::Trace => Level::TRACE,
        }
    }
}

impl std::fmt::Display for CliLogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            CliLogLevel::Error => "error",
            CliLogLevel::Warn => "warn",
            CliLogLevel::Info => "info",
            CliLogLevel::Debug => "debug",
            CliLogLevel::Trace => "trace",
        };
        f.write_str(s)
    }
}

/// Logging flags for zadm binaries.
///
/// Use with `#[command(flatten)]`. Logs go to stderr unless `--log-file` is
/// given, because stdout may carry a send stream.
#[derive(Clone, Debug, Default, clap::Args, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct CliLoggingArgs {
    /// Log verbosity level
    #[arg(long, value_enum, help = "Log verbosity level (default: warn)")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log_level: Option<CliLogLevel>,

    /// Log output format
    #[arg(long, value_enum, help = "Log output format (default: plaintext)")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log_format: Option<LogFormat>,

    /// Log file path
    #[arg(long, help = "Write logs to this file instead of stderr")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log_file: Option<PathBuf>,
}

impl CliLoggingArgs {
    /// Initialize logging from the parsed flags.
    ///
    /// `fallback_level` and `fallback_format` come from the config file and
    /// apply when the corresponding flag was not given.
    pub fn init(
        self,
        component: &str,
        fallback_level: CliLogLevel,
        fallback_format: LogFormat,
    ) -> anyhow::Result<()> {
        let level = self.log_level.unwrap_or(fallback_level).into();
        let format = self.log_format.unwrap_or(fallback_format);

        match self.log_file {
            Some(path) => init_to_file(component, level, format, &path),
            None => init(component, level, format),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.log_level.is_none() && self.log_format.is_none() && self.log_file.is_none()
    }
}

/// Default log file location for a component.
///
/// `<data_dir>/zadm/<component>.log`, falling back to `/tmp` when the
/// platform reports no data directory.
pub fn default_log_file_path(component: &str) -> PathBuf {
    let mut path = dirs::data_dir()
        .or_else(dirs::home_dir)
        .unwrap_or_else(|| PathBuf::from("/tmp"));
    path.push("zadm");
    path.push(format!("{}.log", component));
    path
}

/// Initialize logging to stderr.
pub fn init(component: &str, default_level: Level, format: LogFormat) -> anyhow::Result<()> {
    init_with_writer(component, default_level, format, io::stderr)
}

/// Initialize logging appending to `log_path`, creating parent directories.
pub fn init_to_file(
    component: &str,
    default_level: Level,
    format: LogFormat,
    log_path: &Path,
) -> anyhow::Result<()> {
    use std::fs;

    if let Some(parent) = log_path.parent() {
        fs::create_dir_all(parent)?;
    }
    let log_file = fs::OpenOptions::new().create(true).append(true).open(log_path)?;

    init_with_writer(component, default_level, format, std::sync::Mutex::new(log_file))
}

/// Initialize logging with a custom writer
pub fn init_with_writer<W>(
    component: &str,
    default_level: Level,
    format: LogFormat,
    writer: W,
) -> anyhow::Result<()>
where
    W: for<'writer> tracing_subscriber::fmt::MakeWriter<'writer> + Send + Sync + 'static,
{
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(directives(component, default_level)));

    match format {
        LogFormat::Json => {
            let layer = tracing_subscriber::fmt::layer().with_writer(writer).json();
            #[cfg(debug_assertions)]
            let layer = layer.with_file(true).with_line_number(true);

            tracing_subscriber::registry().with(filter).with(layer).try_init()?;
        }
        LogFormat::Plaintext => {
            let layer = tracing_subscriber::fmt::layer().with_writer(writer).with_ansi(false);
            #[cfg(debug_assertions)]
            let layer = layer.with_file(true).with_line_number(true);

            tracing_subscriber::registry().with(filter).with(layer).try_init()?;
        }
    }

    Ok(())
}

fn directives(component: &str, level: Level) -> String {
    // crate targets use underscores
    let target = component.replace('-', "_");
    format!("{},{}={},zadm_core={},zadm_engine={}", level, target, level, level, level)
}

/// Fresh id attached to the span of a long-running operation (send,
/// receive, recursive destroy) so its events can be correlated.
pub fn operation_id() -> String {
    let id = uuid::Uuid::new_v4().simple().to_string();
    format!("op-{}", &id[..12])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_operation_id_is_unique() {
        let a = operation_id();
        let b = operation_id();
        assert_ne!(a, b);
        assert!(a.starts_with("op-"));
        assert_eq!(a.len(), "op-".len() + 12);
    }

    #[test]
    fn test_log_format_parsing() {
        assert_eq!("json".parse::<LogFormat>().unwrap(), LogFormat::Json);
        assert_eq!("PlainText".parse::<LogFormat>().unwrap(), LogFormat::Plaintext);
        assert!("yaml".parse::<LogFormat>().is_err());
    }

    #[test]
    fn test_level_conversion() {
        assert_eq!(Level::from(CliLogLevel::Debug), Level::DEBUG);
        assert_eq!(Level::from(CliLogLevel::default()), Level::WARN);
        assert_eq!(CliLogLevel::Trace.to_string(), "trace");
    }

    #[test]
    fn test_directives_cover_library_targets() {
        let d = directives("zadm-cli", Level::DEBUG);
        assert!(d.contains("zadm_cli=DEBUG"));
        assert!(d.contains("zadm_core=DEBUG"));
        assert!(d.contains("zadm_engine=DEBUG"));
    }

    #[test]
    fn test_default_log_file_path() {
        let path = default_log_file_path("zadm");
        assert!(path.ends_with("zadm/zadm.log"));
    }

    #[test]
    fn test_cli_args_empty() {
        assert!(CliLoggingArgs::default().is_empty());
        let args = CliLoggingArgs {
            log_level: Some(CliLogLevel::Info),
            ..Default::default()
        };
        assert!(!args.is_empty());
    }

    #[test]
    fn test_init_to_file_writes_events() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("zadm-test.log");
        init_to_file("zadm-test", Level::INFO, LogFormat::Plaintext, &path).unwrap();
        tracing::warn!(operation = "test", "file logging ready");

        let contents = std::fs::read_to_string(&path).unwrap();
        assert!(contents.contains("file logging ready"));
    }
}
