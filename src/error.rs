//! Error taxonomy for the loader.
//!
//! Per-document failures (`Content`, `Integrity`, single-statement
//! `Connectivity`) are recovered by the batch controller; `Config` and
//! `Commit` are the only variants that end a run with a non-zero exit.

use std::path::PathBuf;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("store unreachable: {0}")]
    Connectivity(#[source] sqlx::Error),

    #[error("integrity violation: {0}")]
    Integrity(String),

    #[error("document {id} could not be processed: {reason}")]
    Content { id: String, reason: String },

    #[error("configuration error: {0}")]
    Config(String),

    #[error("index commit failed for core {core}: {reason}")]
    Commit { core: &'static str, reason: String },

    #[error("invalid filter for {field}: {value:?}")]
    InvalidFilter { field: &'static str, value: String },

    #[error("XML error: {0}")]
    Xml(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("file not found: {0}")]
    NotFound(PathBuf),
}

impl From<sqlx::Error> for Error {
    fn from(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::Database(db) if db.is_unique_violation() || db.is_check_violation() => {
                Error::Integrity(db.message().to_string())
            }
            sqlx::Error::Database(db) if db.is_foreign_key_violation() => {
                Error::Integrity(db.message().to_string())
            }
            _ => Error::Connectivity(err),
        }
    }
}

impl From<quick_xml::Error> for Error {
    fn from(err: quick_xml::Error) -> Self {
        Error::Xml(err.to_string())
    }
}

impl Error {
    pub fn content(id: impl Into<String>, reason: impl std::fmt::Display) -> Self {
        Error::Content {
            id: id.into(),
            reason: reason.to_string(),
        }
    }

    /// True for errors that must abort the whole run.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::Config(_) | Error::Commit { .. })
    }
}
