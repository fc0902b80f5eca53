use std::borrow::Cow;

mod metrics;

pub use crate::metrics::report_error;

/// ErrorMetadata can be attached to an anyhow error chain via
/// `.context(e /* ErrorMetadata */)`. It is a generic object used across the
/// codebase to tag errors with information used to classify them.
///
/// The `msg` is conveyed as the user-facing error message if it makes it to
/// the client.
///
/// The `short_msg` is used as a tag - available for tests and for metrics
/// logging - that is resilient to changes in copy.
#[derive(thiserror::Error, Clone, Debug, PartialEq, Eq)]
#[error("{msg}")]
pub struct ErrorMetadata {
    /// The error code associated with this ErrorMetadata
    pub code: ErrorCode,
    /// short ScreamingCamelCase, e.g. `KeyNotFound`. Usable in tests for
    /// string matching.
    pub short_msg: Cow<'static, str>,
    /// human readable - client facing. Longer and descriptive,
    /// e.g. "Key: k is not found".
    pub msg: Cow<'static, str>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    /// Malformed or unexecutable client input (unknown op, duplicate
    /// insert, missing key, stale timestamp).
    BadRequest,
    /// The requested key does not exist.
    NotFound,
    /// A unique-constraint violation on insert.
    AlreadyExists,
    /// The transaction lost an optimistic-concurrency race and was aborted.
    Occ,
    /// The client went away before its response could be delivered.
    ClientDisconnect,
    /// A sealed log or the pepoch file failed its integrity checks.
    Integrity,
}

impl ErrorMetadata {
    pub fn bad_request(
        short_msg: impl Into<Cow<'static, str>>,
        msg: impl Into<Cow<'static, str>>,
    ) -> Self {
        Self {
            code: ErrorCode::BadRequest,
            short_msg: short_msg.into(),
            msg: msg.into(),
        }
    }

    pub fn not_found(
        short_msg: impl Into<Cow<'static, str>>,
        msg: impl Into<Cow<'static, str>>,
    ) -> Self {
        Self {
            code: ErrorCode::NotFound,
            short_msg: short_msg.into(),
            msg: msg.into(),
        }
    }

    pub fn already_exists(
        short_msg: impl Into<Cow<'static, str>>,
        msg: impl Into<Cow<'static, str>>,
    ) -> Self {
        Self {
            code: ErrorCode::AlreadyExists,
            short_msg: short_msg.into(),
            msg: msg.into(),
        }
    }

    /// The transaction was aborted by validation and could not be retried
    /// to completion.
    pub fn occ(
        short_msg: impl Into<Cow<'static, str>>,
        msg: impl Into<Cow<'static, str>>,
    ) -> Self {
        Self {
            code: ErrorCode::Occ,
            short_msg: short_msg.into(),
            msg: msg.into(),
        }
    }

    pub fn client_disconnect() -> Self {
        Self {
            code: ErrorCode::ClientDisconnect,
            short_msg: "ClientDisconnect".into(),
            msg: "The client session closed before the response was sent".into(),
        }
    }

    /// Integrity failures are fatal: recovery refuses to open the service.
    pub fn integrity(
        short_msg: impl Into<Cow<'static, str>>,
        msg: impl Into<Cow<'static, str>>,
    ) -> Self {
        Self {
            code: ErrorCode::Integrity,
            short_msg: short_msg.into(),
            msg: msg.into(),
        }
    }

    /// The `error_code` field of the client response message. `0` is success,
    /// `-1` a client error, `-2` an aborted transaction; positive values are
    /// reserved.
    pub fn wire_code(&self) -> i32 {
        match self.code {
            ErrorCode::BadRequest
            | ErrorCode::NotFound
            | ErrorCode::AlreadyExists
            | ErrorCode::ClientDisconnect => -1,
            ErrorCode::Occ => -2,
            ErrorCode::Integrity => 1,
        }
    }

    pub fn is_client_error(&self) -> bool {
        self.wire_code() == -1
    }
}

/// Helpers for extracting ErrorMetadata out of an `anyhow::Error` chain.
pub trait ErrorMetadataAnyhowExt {
    fn error_metadata(&self) -> Option<&ErrorMetadata>;
    fn short_msg(&self) -> Option<&str>;
    fn wire_code(&self) -> i32;
}

impl ErrorMetadataAnyhowExt for anyhow::Error {
    fn error_metadata(&self) -> Option<&ErrorMetadata> {
        self.downcast_ref::<ErrorMetadata>()
    }

    fn short_msg(&self) -> Option<&str> {
        self.error_metadata().map(|em| &*em.short_msg)
    }

    /// Unclassified errors are reported as internal (`1`).
    fn wire_code(&self) -> i32 {
        self.error_metadata().map(|em| em.wire_code()).unwrap_or(1)
    }
}

#[cfg(test)]
mod tests {
    use anyhow::Context;

    use crate::{
        ErrorMetadata,
        ErrorMetadataAnyhowExt,
    };

    fn fail() -> anyhow::Result<()> {
        anyhow::bail!("io exploded")
    }

    #[test]
    fn test_metadata_survives_context_chain() {
        let err = fail()
            .context(ErrorMetadata::not_found("KeyNotFound", "Key: k is not found"))
            .unwrap_err();
        assert_eq!(err.short_msg(), Some("KeyNotFound"));
        assert_eq!(err.wire_code(), -1);
    }

    #[test]
    fn test_unclassified_is_internal() {
        let err = fail().unwrap_err();
        assert_eq!(err.error_metadata(), None);
        assert_eq!(err.wire_code(), 1);
    }

    #[test]
    fn test_occ_maps_to_abort_code() {
        let em = ErrorMetadata::occ("TransactionAborted", "Transaction has been aborted");
        assert_eq!(em.wire_code(), -2);
    }
}
