//! # Error Types
//!
//! One error enum per collaborator, plus [`SessionError`] for the things that
//! can stop a session from starting.
//!
//! - [`StoreError`] - schema lookup and typed key access on the settings store
//! - [`BusError`] - connecting to the bus and per-call daemon failures
//!
//! A `TypeMismatch` is a programming error (the schema fixes each key's type),
//! but it is still returned rather than panicking so one bad binding cannot take
//! the panel down.

use std::path::PathBuf;

use thiserror::Error;

use crate::schema::KeyType;

/// Errors from the persisted key/value store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// No readable schema with this id exists anywhere on the search path.
    #[error("schema '{id}' not found (searched {searched:?})")]
    SchemaNotFound { id: String, searched: Vec<PathBuf> },

    /// A schema file was found but is malformed.
    #[error("invalid schema '{id}': {reason}")]
    InvalidSchema { id: String, reason: String },

    /// The key is not declared by the schema.
    #[error("unknown key '{0}'")]
    UnknownKey(String),

    /// The caller asked for (or tried to write) the wrong type for a key.
    #[error("type mismatch for key '{key}': schema says {expected}, got {actual}")]
    TypeMismatch {
        key: String,
        expected: KeyType,
        actual: KeyType,
    },

    /// An integer write below the schema's minimum.
    #[error("value {value} for key '{key}' is below the minimum {min}")]
    OutOfRange { key: String, value: i64, min: i64 },

    /// The store handle was closed.
    #[error("store is closed")]
    Closed,

    /// Structured text stored in a string key could not be parsed.
    #[error("failed to parse '{key}': {source}")]
    Parse {
        key: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("failed to access {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Errors from talking to the rotation daemon over D-Bus.
#[derive(Debug, Clone, Error)]
pub enum BusError {
    /// The bus itself could not be reached or the proxy could not be built.
    #[error("connection refused: {0}")]
    ConnectionRefused(String),

    /// A single remote call failed (daemon absent, method error, client closed).
    #[error("remote call '{method}' failed: {message}")]
    RemoteError { method: String, message: String },
}

impl BusError {
    pub(crate) fn remote(method: &str, err: impl std::fmt::Display) -> Self {
        BusError::RemoteError {
            method: method.to_string(),
            message: err.to_string(),
        }
    }
}

/// Failures that abort [`Session::open`](crate::session::Session::open).
#[derive(Debug, Error)]
pub enum SessionError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Bus(#[from] BusError),
}
