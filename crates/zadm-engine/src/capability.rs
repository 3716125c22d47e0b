// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Engine generations and the capability descriptor derived from them.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
#[error("unrecognized engine version string: {0:?}")]
pub struct VersionParseError(pub String);

/// Engine release, e.g. `0.8.1` or `2.1.5`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EngineVersion {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
}

impl EngineVersion {
    pub const fn new(major: u32, minor: u32, patch: u32) -> Self {
        EngineVersion {
            major,
            minor,
            patch,
        }
    }

    /// Parse the first dotted version found in `text`. Accepts the forms
    /// printed by `zfs version` such as `zfs-2.1.5-1ubuntu6` or `zfs-0.8.3-1`.
    pub fn parse(text: &str) -> Result<Self, VersionParseError> {
        let start = text
            .find(|c: char| c.is_ascii_digit())
            .ok_or_else(|| VersionParseError(text.to_string()))?;
        let mut parts = text[start..]
            .split(|c: char| !c.is_ascii_digit())
            .take(3)
            .map(|p| p.parse::<u32>().ok());

        let major = parts.next().flatten();
        let minor = parts.next().flatten();
        let patch = parts.next().flatten().unwrap_or(0);
        match (major, minor) {
            (Some(major), Some(minor)) => Ok(EngineVersion::new(major, minor, patch)),
            _ => Err(VersionParseError(text.to_string())),
        }
    }

    pub fn generation(self) -> EngineGeneration {
        match (self.major, self.minor, self.patch) {
            (0, 0..=7, _) => EngineGeneration::Legacy,
            (0, 8, 1) => EngineGeneration::FlagsByValue,
            _ => EngineGeneration::Modern,
        }
    }
}

impl fmt::Display for EngineVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

/// Protocol generation of the engine, as far as sends are concerned.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EngineGeneration {
    /// Bitmask send flags, no redaction, estimates through the raw command
    /// block
    Legacy,
    /// Flags struct passed by value, no redaction
    FlagsByValue,
    /// Flags struct by reference plus redaction bookmark
    Modern,
}

impl FromStr for EngineGeneration {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "legacy" => Ok(EngineGeneration::Legacy),
            "flags-by-value" => Ok(EngineGeneration::FlagsByValue),
            "modern" => Ok(EngineGeneration::Modern),
            other => Err(format!("unknown engine generation '{}'", other)),
        }
    }
}

/// What the linked engine can do, resolved once at startup.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Capabilities {
    pub generation: EngineGeneration,
    pub has_redaction: bool,
    pub flags_by_value: bool,
    pub legacy_estimate: bool,
    pub raw_send: bool,
}

impl Capabilities {
    pub fn for_generation(generation: EngineGeneration) -> Self {
        match generation {
            EngineGeneration::Legacy => Capabilities {
                generation,
                has_redaction: false,
                flags_by_value: false,
                legacy_estimate: true,
                raw_send: false,
            },
            EngineGeneration::FlagsByValue => Capabilities {
                generation,
                has_redaction: false,
                flags_by_value: true,
                legacy_estimate: true,
                raw_send: true,
            },
            EngineGeneration::Modern => Capabilities {
                generation,
                has_redaction: true,
                flags_by_value: false,
                legacy_estimate: false,
                raw_send: true,
            },
        }
    }
}

impl From<EngineVersion> for Capabilities {
    fn from(version: EngineVersion) -> Self {
        Capabilities::for_generation(version.generation())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_version_strings() {
        assert_eq!(
            EngineVersion::parse("zfs-2.1.5-1ubuntu6~22.04.1").unwrap(),
            EngineVersion::new(2, 1, 5)
        );
        assert_eq!(
            EngineVersion::parse("zfs-0.8.1-1").unwrap(),
            EngineVersion::new(0, 8, 1)
        );
        assert_eq!(EngineVersion::parse("0.7").unwrap(), EngineVersion::new(0, 7, 0));
        assert!(EngineVersion::parse("zfs-kmod").is_err());
        assert!(EngineVersion::parse("zfs-2").is_err());
    }

    #[test]
    fn generations_follow_release_lines() {
        assert_eq!(EngineVersion::new(0, 7, 13).generation(), EngineGeneration::Legacy);
        assert_eq!(EngineVersion::new(0, 8, 1).generation(), EngineGeneration::FlagsByValue);
        assert_eq!(EngineVersion::new(0, 8, 6).generation(), EngineGeneration::Modern);
        assert_eq!(EngineVersion::new(2, 2, 0).generation(), EngineGeneration::Modern);
    }

    #[test]
    fn capability_descriptor() {
        let legacy = Capabilities::for_generation(EngineGeneration::Legacy);
        assert!(legacy.legacy_estimate && !legacy.has_redaction && !legacy.raw_send);

        let by_value = Capabilities::from(EngineVersion::new(0, 8, 1));
        assert!(by_value.flags_by_value && !by_value.has_redaction);

        let modern = Capabilities::for_generation(EngineGeneration::Modern);
        assert!(modern.has_redaction && !modern.flags_by_value && !modern.legacy_estimate);
    }
}
