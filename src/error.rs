//! Error kinds raised by the core engine.
//!
//! Adapters never let these cross a transport boundary raw: each kind maps
//! to an HTTP-style numeric hint (`http_hint`) so the dispatch layer can
//! translate without inspecting messages.

use std::path::PathBuf;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A path escaped its declared root after canonicalisation.
    #[error("restricted path: {0}")]
    RestrictedPath(PathBuf),

    /// Job, descriptor, or plugin file does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// Request input that cannot be interpreted (empty pipeline, ragged
    /// program/parameter/plugin lists, bad field types).
    #[error("malformed request: {0}")]
    Malformed(String),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Numeric status hint for the request dispatch layer.
    pub fn http_hint(&self) -> u16 {
        match self {
            Error::RestrictedPath(_) | Error::NotFound(_) => 404,
            Error::Malformed(_) | Error::Io(_) | Error::Json(_) => 501,
        }
    }

    /// Short machine-readable code used in error envelopes.
    pub fn code(&self) -> &'static str {
        match self {
            Error::RestrictedPath(_) => "restricted_path",
            Error::NotFound(_) => "not_found",
            Error::Malformed(_) => "malformed_request",
            Error::Io(_) => "filesystem",
            Error::Json(_) => "json",
        }
    }
}
