//! Crate error type.

use thiserror::Error;

/// Crate result type.
pub type Result<T> = std::result::Result<T, Error>;

/// The taxonomy a caller can match on, independent of the message text.
///
/// Mirrors the `code` half of the `{code, message}` exception shape the
/// engine's callers (CLI wrappers, example apps) are written against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    /// Transport failure exhausted retries without producing a status code.
    NetworkError,
    /// A HEAD or non-ranged `GET` returned a non-2xx status.
    ServerError,
    /// A response was structurally unusable: missing/unparseable
    /// `Content-Length`, or a ranged `GET` that didn't return 206.
    InvalidResponse,
    /// A filesystem operation failed, or a conflict-strategy precondition
    /// was violated.
    FileError,
    /// Reserved: the engine only computes digests, it never verifies them.
    ChecksumMismatch,
    /// Reserved for operations not supported by this engine.
    UnsupportedOperation,
    /// Cancellation was observed at a suspension point.
    Cancelled,
}

impl ErrorCode {
    /// The lowerCamelCase name used in the `[<codeName>]` part of `Display`.
    fn name(self) -> &'static str {
        match self {
            ErrorCode::NetworkError => "networkError",
            ErrorCode::ServerError => "serverError",
            ErrorCode::InvalidResponse => "invalidResponse",
            ErrorCode::FileError => "fileError",
            ErrorCode::ChecksumMismatch => "checksumMismatch",
            ErrorCode::UnsupportedOperation => "unsupportedOperation",
            ErrorCode::Cancelled => "cancelled",
        }
    }
}

/// Crate error type.
///
/// `Display` always reproduces `"RangeRequestException [<codeName>]:
/// <message>"`, so callers that only care about presenting the error don't
/// need to match on [`ErrorCode`].
#[derive(Debug, Error)]
pub enum Error {
    /// Transport failure exhausted retries without producing a status code.
    #[error("RangeRequestException [networkError]: {0}")]
    NetworkError(String),
    /// A HEAD or non-ranged `GET` returned a non-2xx status.
    #[error("RangeRequestException [serverError]: {0}")]
    ServerError(String),
    /// `Content-Length` missing/unparseable, or a ranged `GET` returned a
    /// status other than 206.
    #[error("RangeRequestException [invalidResponse]: {0}")]
    InvalidResponse(String),
    /// A filesystem operation failed, or a conflict-strategy precondition
    /// was violated.
    #[error("RangeRequestException [fileError]: {0}")]
    FileError(String),
    /// Reserved: never produced by this engine.
    #[error("RangeRequestException [checksumMismatch]: {0}")]
    ChecksumMismatch(String),
    /// Reserved for operations not supported by this engine.
    #[error("RangeRequestException [unsupportedOperation]: {0}")]
    UnsupportedOperation(String),
    /// Cancellation was observed at a suspension point.
    #[error("RangeRequestException [cancelled]: {0}")]
    Cancelled(String),
}

impl Error {
    /// The taxonomy entry this error belongs to.
    #[must_use]
    pub fn code(&self) -> ErrorCode {
        match self {
            Error::NetworkError(_) => ErrorCode::NetworkError,
            Error::ServerError(_) => ErrorCode::ServerError,
            Error::InvalidResponse(_) => ErrorCode::InvalidResponse,
            Error::FileError(_) => ErrorCode::FileError,
            Error::ChecksumMismatch(_) => ErrorCode::ChecksumMismatch,
            Error::UnsupportedOperation(_) => ErrorCode::UnsupportedOperation,
            Error::Cancelled(_) => ErrorCode::Cancelled,
        }
    }

    /// The message half, without the `RangeRequestException [...]:` prefix.
    #[must_use]
    pub fn message(&self) -> &str {
        match self {
            Error::NetworkError(m)
            | Error::ServerError(m)
            | Error::InvalidResponse(m)
            | Error::FileError(m)
            | Error::ChecksumMismatch(m)
            | Error::UnsupportedOperation(m)
            | Error::Cancelled(m) => m,
        }
    }

    pub(crate) fn cancelled() -> Self {
        Error::Cancelled("Operation was cancelled".to_string())
    }
}

impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Self {
        Error::NetworkError(err.to_string())
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::FileError(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_matches_exception_format() {
        let cases = [
            (Error::NetworkError("boom".into()), "networkError"),
            (Error::ServerError("boom".into()), "serverError"),
            (Error::InvalidResponse("boom".into()), "invalidResponse"),
            (Error::FileError("boom".into()), "fileError"),
            (Error::ChecksumMismatch("boom".into()), "checksumMismatch"),
            (
                Error::UnsupportedOperation("boom".into()),
                "unsupportedOperation",
            ),
            (Error::Cancelled("boom".into()), "cancelled"),
        ];
        for (err, code_name) in cases {
            assert_eq!(
                err.to_string(),
                format!("RangeRequestException [{code_name}]: boom")
            );
            assert_eq!(err.code().name(), code_name);
        }
    }

    #[test]
    fn io_error_maps_to_file_error() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "missing");
        let err: Error = io_err.into();
        assert_eq!(err.code(), ErrorCode::FileError);
    }
}
