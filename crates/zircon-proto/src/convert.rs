//! Conversions between the wire error and the fleet error enum.

use crate::common::{ErrorKind, RpcError};
use zircon_common::{Error, Result, ServerName, Version};

impl From<&Error> for RpcError {
    fn from(err: &Error) -> Self {
        let mut wire = RpcError {
            kind: ErrorKind::Unspecified as i32,
            current_version: 0,
            owner: String::new(),
            detail: String::new(),
        };
        match err {
            Error::Stale(current) => {
                wire.kind = ErrorKind::Stale as i32;
                wire.current_version = current.as_u64();
            }
            Error::NotOwner(owner) => {
                wire.kind = ErrorKind::NotOwner as i32;
                wire.owner = owner.as_str().to_string();
            }
            Error::NotFound => wire.kind = ErrorKind::NotFound as i32,
            Error::AlreadyExists => wire.kind = ErrorKind::AlreadyExists as i32,
            Error::Busy => wire.kind = ErrorKind::Busy as i32,
            Error::SizeExceeded => wire.kind = ErrorKind::SizeExceeded as i32,
            Error::LeaseExpired => wire.kind = ErrorKind::LeaseExpired as i32,
            Error::Unreachable(detail) => {
                wire.kind = ErrorKind::Unreachable as i32;
                wire.detail = detail.clone();
            }
            Error::Corrupt(detail) => {
                wire.kind = ErrorKind::Corrupt as i32;
                wire.detail = detail.clone();
            }
            Error::Fatal(detail) => {
                wire.kind = ErrorKind::Fatal as i32;
                wire.detail = detail.clone();
            }
            // Internal causes cross the wire as FATAL: the remote end cannot
            // act on them beyond reporting.
            Error::Config(detail) | Error::Serialization(detail) => {
                wire.kind = ErrorKind::Fatal as i32;
                wire.detail = detail.clone();
            }
            Error::Io(io) => {
                wire.kind = ErrorKind::Fatal as i32;
                wire.detail = io.to_string();
            }
        }
        wire
    }
}

impl RpcError {
    /// Reconstruct the typed error on the receiving side.
    #[must_use]
    pub fn into_error(self) -> Error {
        match ErrorKind::try_from(self.kind).unwrap_or(ErrorKind::Unspecified) {
            ErrorKind::Stale => Error::Stale(Version::from_raw(self.current_version)),
            ErrorKind::NotOwner => Error::NotOwner(ServerName::new(self.owner)),
            ErrorKind::NotFound => Error::NotFound,
            ErrorKind::AlreadyExists => Error::AlreadyExists,
            ErrorKind::Busy => Error::Busy,
            ErrorKind::SizeExceeded => Error::SizeExceeded,
            ErrorKind::LeaseExpired => Error::LeaseExpired,
            ErrorKind::Unreachable => Error::Unreachable(self.detail),
            ErrorKind::Corrupt => Error::Corrupt(self.detail),
            ErrorKind::Fatal | ErrorKind::Unspecified => Error::Fatal(self.detail),
        }
    }
}

/// Server-side helper: the `error` field for a result.
pub fn rpc_error<T>(result: &Result<T>) -> Option<RpcError> {
    result.as_ref().err().map(RpcError::from)
}

/// Client-side helper: turn a response's `error` field into a `Result`.
pub fn check(error: Option<RpcError>) -> Result<()> {
    match error {
        None => Ok(()),
        Some(wire) => Err(wire.into_error()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stale_round_trip() {
        let err = Error::Stale(Version::from_raw(9));
        let wire = RpcError::from(&err);
        assert_eq!(wire.current_version, 9);
        match wire.into_error() {
            Error::Stale(v) => assert_eq!(v, Version::from_raw(9)),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn not_owner_round_trip() {
        let err = Error::NotOwner(ServerName::new("quartz-43"));
        let wire = RpcError::from(&err);
        match wire.into_error() {
            Error::NotOwner(name) => assert_eq!(name.as_str(), "quartz-43"),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn check_passes_ok() {
        assert!(check(None).is_ok());
        assert!(check(Some(RpcError::from(&Error::Busy))).is_err());
    }
}
