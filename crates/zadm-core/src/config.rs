// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Layered configuration.
//!
//! Layers, lowest precedence first: built-in defaults, the system file, the
//! user file, an explicit file, then `ZADM_*` environment variables with
//! `__` between nesting levels (`ZADM_ENGINE__ZFS_PATH=/sbin/zfs`).

use crate::error::{Error, Result};
use crate::registry::Registry;
use config::{Config, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::debug;
use zadm_engine::{
    Capabilities, CommandEngine, Engine, EngineGeneration, MemoryEngine, SystemRunner,
};
use zadm_logging::{CliLogLevel, LogFormat};

const SYSTEM_CONFIG_PATH: &str = "/etc/zadm/config.toml";
const ENV_PREFIX: &str = "ZADM";

/// Which engine backend to talk through
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Backend {
    /// Drive the `zfs` command line tool
    #[default]
    Command,
    /// Empty in-memory pool model
    Memory,
}

impl std::str::FromStr for Backend {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "command" => Ok(Backend::Command),
            "memory" => Ok(Backend::Memory),
            other => Err(format!("unknown backend '{}': use 'command' or 'memory'", other)),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct EngineConfig {
    #[serde(default)]
    pub backend: Backend,
    #[serde(default = "default_zfs_path")]
    pub zfs_path: String,
    #[serde(default = "default_use_sudo")]
    pub use_sudo: bool,
    /// Overrides the generation detected from the engine version
    #[serde(default)]
    pub generation: Option<EngineGeneration>,
}

fn default_zfs_path() -> String {
    "zfs".to_string()
}

fn default_use_sudo() -> bool {
    true
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            backend: Backend::default(),
            zfs_path: default_zfs_path(),
            use_sudo: default_use_sudo(),
            generation: None,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ZadmConfig {
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub log_level: CliLogLevel,
    #[serde(default)]
    pub log_format: LogFormat,
}

/// Where each file layer is read from. Missing system and user files are
/// skipped; a missing explicit file is an error.
#[derive(Clone, Debug, Default)]
pub struct ConfigSources {
    pub system: Option<PathBuf>,
    pub user: Option<PathBuf>,
    pub explicit: Option<PathBuf>,
    pub environment: bool,
}

impl ConfigSources {
    /// The standard locations plus the environment.
    pub fn discover(explicit: Option<&Path>) -> Self {
        ConfigSources {
            system: Some(PathBuf::from(SYSTEM_CONFIG_PATH)),
            user: user_config_path(),
            explicit: explicit.map(Path::to_path_buf),
            environment: true,
        }
    }
}

/// `<config_dir>/zadm/config.toml`, if the platform has a config directory.
pub fn user_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("zadm").join("config.toml"))
}

impl ZadmConfig {
    /// Load from the standard layers, with `explicit` as the `--config` file.
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        Self::load_from(&ConfigSources::discover(explicit))
    }

    pub fn load_from(sources: &ConfigSources) -> Result<Self> {
        let mut builder = Config::builder()
            .set_default("engine.backend", "command")?
            .set_default("engine.zfs-path", default_zfs_path())?
            .set_default("engine.use-sudo", default_use_sudo())?
            .set_default("log-level", CliLogLevel::default().to_string())?
            .set_default("log-format", LogFormat::default().to_string())?;

        for (path, required) in [
            (&sources.system, false),
            (&sources.user, false),
            (&sources.explicit, true),
        ] {
            if let Some(path) = path {
                debug!(operation = "config_load", path = %path.display(), required, "Config layer");
                builder = builder.add_source(
                    File::from(path.as_path())
                        .format(FileFormat::Toml)
                        .required(required),
                );
            }
        }

        if sources.environment {
            builder = builder.add_source(environment());
        }

        Ok(builder.build()?.try_deserialize()?)
    }

    /// Open the configured engine and wrap it in a registry, honoring the
    /// generation override.
    pub fn connect(&self) -> Result<Registry> {
        let engine: Box<dyn Engine> = match self.engine.backend {
            Backend::Memory => Box::new(MemoryEngine::new()),
            Backend::Command => Box::new(
                CommandEngine::new(SystemRunner::new(self.engine.use_sudo), &self.engine.zfs_path)
                    .map_err(|code| Error::Engine {
                        code,
                        description: code.describe().to_string(),
                        context: format!("connect {}", self.engine.zfs_path),
                    })?,
            ),
        };
        Ok(match self.engine.generation {
            Some(generation) => {
                Registry::with_capabilities(engine, Capabilities::for_generation(generation))
            }
            None => Registry::new(engine),
        })
    }
}

fn environment() -> Environment {
    let prefix = format!("{}_", ENV_PREFIX);
    let vars: config::Map<String, String> = std::env::vars()
        .filter(|(key, _)| key.starts_with(&prefix))
        .map(|(key, value)| (kebab_env_key(&key), value))
        .collect();
    Environment::with_prefix(ENV_PREFIX)
        .prefix_separator("_")
        .separator("__")
        .try_parsing(true)
        .source(Some(vars))
}

/// `ZADM_ENGINE__ZFS_PATH` becomes `ZADM_ENGINE__ZFS-PATH`, so that the
/// key lands on `engine.zfs-path`.
fn kebab_env_key(key: &str) -> String {
    let Some(rest) = key.strip_prefix(ENV_PREFIX).and_then(|k| k.strip_prefix('_')) else {
        return key.to_string();
    };
    let segments: Vec<String> = rest.split("__").map(|s| s.replace('_', "-")).collect();
    format!("{}_{}", ENV_PREFIX, segments.join("__"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::io::Write;

    fn files_only(explicit: Option<PathBuf>, user: Option<PathBuf>) -> ConfigSources {
        ConfigSources {
            system: None,
            user,
            explicit,
            environment: false,
        }
    }

    fn write_toml(dir: &tempfile::TempDir, name: &str, body: &str) -> PathBuf {
        let path = dir.path().join(name);
        let mut file = std::fs::File::create(&path).unwrap();
        file.write_all(body.as_bytes()).unwrap();
        path
    }

    #[test]
    fn defaults_without_any_layer() {
        let config = ZadmConfig::load_from(&files_only(None, None)).unwrap();
        assert_eq!(config, ZadmConfig::default());
        assert_eq!(config.engine.zfs_path, "zfs");
        assert!(config.engine.use_sudo);
        assert_eq!(config.engine.generation, None);
    }

    #[test]
    fn explicit_file_overrides_user_file() {
        let dir = tempfile::tempdir().unwrap();
        let user = write_toml(
            &dir,
            "user.toml",
            "log-level = \"debug\"\n[engine]\nzfs-path = \"/usr/sbin/zfs\"\nuse-sudo = false\n",
        );
        let explicit = write_toml(
            &dir,
            "explicit.toml",
            "[engine]\nzfs-path = \"/opt/zfs/bin/zfs\"\ngeneration = \"legacy\"\n",
        );
        let config = ZadmConfig::load_from(&files_only(Some(explicit), Some(user))).unwrap();
        assert_eq!(config.engine.zfs_path, "/opt/zfs/bin/zfs");
        assert!(!config.engine.use_sudo);
        assert_eq!(config.engine.generation, Some(EngineGeneration::Legacy));
        assert_eq!(config.log_level, CliLogLevel::Debug);
    }

    #[test]
    fn missing_explicit_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let sources = files_only(Some(dir.path().join("absent.toml")), None);
        assert!(matches!(ZadmConfig::load_from(&sources), Err(Error::Config(_))));
    }

    #[test]
    fn missing_user_file_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let sources = files_only(None, Some(dir.path().join("absent.toml")));
        assert_eq!(ZadmConfig::load_from(&sources).unwrap(), ZadmConfig::default());
    }

    #[test]
    fn env_keys_keep_nesting_and_become_kebab() {
        assert_eq!(kebab_env_key("ZADM_ENGINE__ZFS_PATH"), "ZADM_ENGINE__ZFS-PATH");
        assert_eq!(kebab_env_key("ZADM_LOG_LEVEL"), "ZADM_LOG-LEVEL");
        assert_eq!(kebab_env_key("HOME"), "HOME");
    }

    #[test]
    #[serial]
    fn environment_wins_over_files() {
        let dir = tempfile::tempdir().unwrap();
        let explicit = write_toml(&dir, "explicit.toml", "[engine]\nbackend = \"command\"\n");
        std::env::set_var("ZADM_ENGINE__BACKEND", "memory");
        std::env::set_var("ZADM_LOG_FORMAT", "json");
        std::env::set_var("ZADM_ENGINE__USE_SUDO", "false");
        let sources = ConfigSources {
            environment: true,
            ..files_only(Some(explicit), None)
        };
        let loaded = ZadmConfig::load_from(&sources);
        std::env::remove_var("ZADM_ENGINE__BACKEND");
        std::env::remove_var("ZADM_LOG_FORMAT");
        std::env::remove_var("ZADM_ENGINE__USE_SUDO");

        let config = loaded.unwrap();
        assert_eq!(config.engine.backend, Backend::Memory);
        assert_eq!(config.log_format, LogFormat::Json);
        assert!(!config.engine.use_sudo);
    }

    #[test]
    fn memory_backend_connects_with_override() {
        let config = ZadmConfig {
            engine: EngineConfig {
                backend: Backend::Memory,
                generation: Some(EngineGeneration::FlagsByValue),
                ..Default::default()
            },
            ..Default::default()
        };
        let registry = config.connect().unwrap();
        assert!(registry.capabilities().flags_by_value);
        assert!(!registry.capabilities().has_redaction);
    }
}
