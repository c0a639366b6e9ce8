//! Error taxonomy for the aggregation pipeline (spec ยง7).
//!
//! Follows the outer-newtype-over-boxed-variant shape used elsewhere in this
//! codebase for command errors: `Error` is `Box<ErrorInner>` sized, so a
//! `Result<T>` stays small even though individual variants carry context.

use std::fmt;

use crate::context::NodeId;

#[derive(Debug, thiserror::Error)]
pub enum ErrorInner {
    #[error("malformed GROUP BY expression: {0}")]
    Parse(String),

    #[error("schema mismatch while merging partial results: {0}")]
    SchemaMismatch(String),

    #[error("aggregate primitive failed: {0}")]
    Compute(String),

    #[error("transport failure sending to node {to:?}: {reason}")]
    Transport { to: NodeId, reason: String },

    #[error("operation attempted on a cache machine after finish() was called")]
    ClosedCache,
}

/// Boxed so that `Result<T, Error>` does not bloat the success path with the
/// largest variant's payload.
#[derive(thiserror::Error)]
pub struct Error(Box<ErrorInner>);

impl Error {
    pub fn inner(&self) -> &ErrorInner {
        &self.0
    }
}

impl fmt::Debug for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&self.0, f)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

impl From<ErrorInner> for Error {
    fn from(inner: ErrorInner) -> Error {
        Error(Box::new(inner))
    }
}

impl Error {
    pub fn parse(msg: impl Into<String>) -> Error {
        ErrorInner::Parse(msg.into()).into()
    }

    pub fn schema_mismatch(msg: impl Into<String>) -> Error {
        ErrorInner::SchemaMismatch(msg.into()).into()
    }

    pub fn compute(msg: impl Into<String>) -> Error {
        ErrorInner::Compute(msg.into()).into()
    }

    pub fn transport(to: NodeId, reason: impl Into<String>) -> Error {
        ErrorInner::Transport {
            to,
            reason: reason.into(),
        }
        .into()
    }

    pub fn closed_cache() -> Error {
        ErrorInner::ClosedCache.into()
    }

    pub fn is_transport(&self) -> bool {
        matches!(self.0.as_ref(), ErrorInner::Transport { .. })
    }
}

impl From<arrow::error::ArrowError> for Error {
    fn from(e: arrow::error::ArrowError) -> Error {
        Error::compute(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
