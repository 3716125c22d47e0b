// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Error types for the administration core

use thiserror::Error;
use zadm_engine::ErrorCode;

/// Result type alias for core operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by the administration core.
///
/// Engine codes travel unchanged; the core only adds context such as the
/// operation name or the list of blocking dependents.
#[derive(Debug, Error)]
pub enum Error {
    #[error("library handle is not initialized")]
    NotInitialized,

    #[error("library handle is already initialized")]
    AlreadyInitialized,

    /// A name did not resolve to any dataset, pool, snapshot or bookmark
    #[error("{message}")]
    NotFound { code: ErrorCode, message: String },

    #[error("{context}: {description}")]
    Engine {
        code: ErrorCode,
        description: String,
        context: String,
    },

    #[error("cannot destroy '{target}': dependent datasets exist: {}", dependents.join(", "))]
    DependentsExist {
        target: String,
        dependents: Vec<String>,
    },

    /// The engine broke a guarantee it makes about its own answers
    #[error("internal consistency fault: {0}")]
    Inconsistent(String),

    #[error("{0}")]
    InvalidArgument(String),

    #[error("invalid send state transition from {from} to {to}")]
    InvalidState { from: &'static str, to: &'static str },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("configuration error: {0}")]
    Config(#[from] config::ConfigError),
}

impl Error {
    /// The engine error code behind this error, if there is one.
    pub fn code(&self) -> Option<ErrorCode> {
        match self {
            Error::NotFound { code, .. } | Error::Engine { code, .. } => Some(*code),
            _ => None,
        }
    }

    pub(crate) fn not_found(name: &str) -> Self {
        Error::NotFound {
            code: ErrorCode::NoEnt,
            message: format!("cannot open '{}': no such pool or dataset", name),
        }
    }

    /// Turn an engine `NoEnt` into [`Error::NotFound`], leaving anything
    /// else as it is.
    pub(crate) fn into_not_found(self, name: &str) -> Self {
        match self {
            Error::Engine {
                code: ErrorCode::NoEnt,
                description,
                ..
            } => Error::NotFound {
                code: ErrorCode::NoEnt,
                message: if description.is_empty() {
                    format!("cannot open '{}': no such pool or dataset", name)
                } else {
                    description
                },
            },
            other => other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_survive_wrapping() {
        let err = Error::Engine {
            code: ErrorCode::Busy,
            description: "pool or dataset is busy".into(),
            context: "destroy".into(),
        };
        assert_eq!(err.code(), Some(ErrorCode::Busy));
        assert_eq!(err.to_string(), "destroy: pool or dataset is busy");
        assert_eq!(Error::NotInitialized.code(), None);
        let blocked = Error::DependentsExist {
            target: "tank/fs@mon".into(),
            dependents: vec!["tank/clone".into()],
        };
        assert_eq!(blocked.code(), None);
    }

    #[test]
    fn no_ent_becomes_not_found() {
        let err = Error::Engine {
            code: ErrorCode::NoEnt,
            description: String::new(),
            context: "open".into(),
        }
        .into_not_found("tank/x");
        assert!(matches!(err, Error::NotFound { code: ErrorCode::NoEnt, .. }));
        assert!(err.to_string().contains("tank/x"));
    }

    #[test]
    fn dependents_are_listed() {
        let err = Error::DependentsExist {
            target: "tank@a".into(),
            dependents: vec!["tank/c1".into(), "tank/c2".into()],
        };
        assert_eq!(
            err.to_string(),
            "cannot destroy 'tank@a': dependent datasets exist: tank/c1, tank/c2"
        );
    }
}
