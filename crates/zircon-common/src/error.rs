//! Error types for Zircon
//!
//! One error enum is shared across the fleet. The variants that surface to
//! callers for rerouting carry enough payload to retry: `Stale` carries the
//! current version, `NotOwner` the current shard owner.

use crate::types::{ServerName, Version};
use thiserror::Error;

/// Common result type for Zircon operations
pub type Result<T> = std::result::Result<T, Error>;

/// Common error type for Zircon
#[derive(Debug, Error)]
pub enum Error {
    /// The version precondition failed; payload is the current version.
    #[error("stale version: current version is {0}")]
    Stale(Version),

    /// The addressed server does not own the shard; payload is the owner.
    #[error("not the shard owner (owned by {0})")]
    NotOwner(ServerName),

    #[error("chunk not found")]
    NotFound,

    #[error("already exists")]
    AlreadyExists,

    /// Another uncommitted write is staged on the replica.
    #[error("busy: concurrent write in progress")]
    Busy,

    #[error("offset plus length exceeds the maximum chunk size")]
    SizeExceeded,

    #[error("metadata lease expired")]
    LeaseExpired,

    #[error("unreachable: {0}")]
    Unreachable(String),

    #[error("corrupt replica: {0}")]
    Corrupt(String),

    /// Unrecoverable; tears the process down with a non-zero exit.
    #[error("fatal: {0}")]
    Fatal(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(String),
}

impl Error {
    pub fn unreachable(msg: impl Into<String>) -> Self {
        Self::Unreachable(msg.into())
    }

    pub fn corrupt(msg: impl Into<String>) -> Self {
        Self::Corrupt(msg.into())
    }

    pub fn fatal(msg: impl Into<String>) -> Self {
        Self::Fatal(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization(msg.into())
    }

    /// Whether the caller may retry after refreshing its view.
    ///
    /// `Stale` and `NotOwner` carry the state needed for the retry; plain
    /// `Unreachable` is worth retrying against an alternate replica.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Stale(_) | Self::NotOwner(_) | Self::Unreachable(_)
        )
    }

    /// Whether this error must terminate the process.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Fatal(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_classification() {
        assert!(Error::Stale(Version::from_raw(3)).is_retryable());
        assert!(Error::NotOwner(ServerName::new("topaz-5")).is_retryable());
        assert!(Error::unreachable("dial failed").is_retryable());
        assert!(!Error::Busy.is_retryable());
        assert!(!Error::NotFound.is_retryable());
    }

    #[test]
    fn stale_carries_current_version() {
        let err = Error::Stale(Version::from_raw(7));
        assert_eq!(err.to_string(), "stale version: current version is 7");
    }
}
