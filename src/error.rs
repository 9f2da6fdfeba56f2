//! Error taxonomy shared across the core.
//!
//! File-level and record-level failures are recovered locally by the sync
//! engine (counted, surfaced in the report); storage and migration failures
//! are fatal for the current database open.

use std::path::PathBuf;

use thiserror::Error;

use crate::parser::Source;

/// A whole input file could not be parsed.
#[derive(Debug, Error)]
pub enum ParseError {
    #[error("cannot read file: {0}")]
    Io(#[from] std::io::Error),

    #[error("not a valid {format} file: {detail}")]
    Invalid {
        format: &'static str,
        detail: String,
    },
}

impl ParseError {
    pub fn invalid(format: &'static str, detail: impl Into<String>) -> Self {
        Self::Invalid {
            format,
            detail: detail.into(),
        }
    }
}

/// One record inside an otherwise-readable file was skipped.
///
/// These never abort a file; parsers collect them as warnings.
#[derive(Debug, Clone, Error)]
#[error("skipped {location}: {reason}")]
pub struct RowDecodeError {
    pub location: String,
    pub reason: String,
}

impl RowDecodeError {
    pub fn new(location: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            location: location.into(),
            reason: reason.into(),
        }
    }
}

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("cannot open database at {path}: {source}")]
    Open {
        path: PathBuf,
        source: rusqlite::Error,
    },

    #[error(
        "schema migration {version} failed: {source}. \
         The database may predate this build; run `memoir sync --full` \
         against a fresh database file or `memoir db clean`"
    )]
    Migration {
        version: usize,
        source: rusqlite::Error,
    },

    #[error(
        "database schema version {found} is newer than this build supports ({supported}); \
         upgrade memoir or point it at a different database file"
    )]
    SchemaTooNew { found: i64, supported: usize },

    #[error("database error: {0}")]
    Sqlite(#[from] rusqlite::Error),
}

#[derive(Debug, Error)]
pub enum ForkError {
    #[error("session {0} not found")]
    SessionNotFound(String),

    #[error("{0} sessions have no native continuation format and cannot be forked")]
    UnsupportedSource(Source),

    #[error("cannot write fork artifact: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Storage(#[from] StorageError),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read config file {path}: {reason}")]
    Unreadable { path: String, reason: String },

    #[error("no roots configured for source {0}")]
    MissingRoots(Source),
}
