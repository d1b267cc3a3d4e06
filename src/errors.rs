//! Structured error type shared across the whole crate.
//!
//! Every fallible operation in Gantry returns [`Error`]. An error is a
//! [`ErrorKind`] describing what went wrong, plus an ordered list of labelled
//! attachments carrying the context that matters for diagnosis (the offending
//! id, the expected and actual shapes, the underlying library message), plus
//! a backtrace captured where the error was constructed. Attachments are
//! plain strings keyed by the well-known labels in [`labels`], so boundary
//! layers can render them without knowing every error shape in advance.
//!
//! # Examples
//!
//! ```rust
//! use gantry::errors::{Error, ErrorKind, labels};
//!
//! let err = Error::new(ErrorKind::OpenFile)
//!     .with_info(labels::PATH, "/tmp/missing")
//!     .with_info(labels::MODE, "read");
//!
//! assert_eq!(err.kind(), ErrorKind::OpenFile);
//! assert_eq!(err.info(labels::PATH), Some("/tmp/missing"));
//! ```

use std::backtrace::Backtrace;
use std::fmt;
use std::sync::Arc;

use thiserror::Error as ThisError;

/// Crate-wide result alias.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Well-known attachment labels.
///
/// Errors are free to carry any label, but these are the ones the rest of
/// the crate attaches and tests assert on.
pub mod labels {
    pub const VARIABLE_NAME: &str = "variable_name";
    pub const INDEX_LABEL: &str = "index_label";
    pub const INDEX_VALUE: &str = "index_value";
    pub const INDEX_UPPER_BOUND: &str = "index_upper_bound";
    pub const EXPECTED_SIZE: &str = "expected_size";
    pub const ACTUAL_SIZE: &str = "actual_size";
    pub const EXPECTED_TYPE: &str = "expected_type";
    pub const ACTUAL_TYPE: &str = "actual_type";
    pub const PATH: &str = "path";
    pub const MODE: &str = "mode";
    pub const SYSTEM_ERROR: &str = "system_error";
    pub const INTERNAL_MESSAGE: &str = "internal_message";
    pub const LZ4_ERROR_CODE: &str = "lz4_error_code";
    pub const OFFENDING_ID: &str = "offending_id";
    pub const HTTP_STATUS: &str = "http_status";
    pub const RESPONSE_BODY: &str = "response_body";
    pub const ERROR_INFO_ID: &str = "error_info_id";
}

/// Classification of everything that can go wrong inside the service core.
///
/// `InternalCheckFailed` indicates a defect (a violated invariant) and is
/// fatal for the task that hit it; every other kind is recoverable.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, ThisError)]
pub enum ErrorKind {
    /// The operation observed a cooperative cancellation request.
    #[error("the operation was canceled")]
    Canceled,
    /// A network or HTTP transport failure.
    #[error("HTTP transport failure")]
    Transport,
    /// The remote service returned a well-formed error response.
    #[error("the remote service reported an error")]
    Protocol,
    /// Decoding a response, message, or config file failed.
    #[error("failed to parse input")]
    Parse,
    /// A value's schema disagrees with what the caller expected.
    #[error("type mismatch")]
    TypeMismatch,
    /// An index was at or past its upper bound.
    #[error("index out of bounds")]
    IndexOutOfBounds,
    /// An array had a different size than expected.
    #[error("array size mismatch")]
    ArraySizeMismatch,
    /// A required environment variable is unset or empty.
    #[error("missing environment variable")]
    MissingEnvironmentVariable,
    /// A required error attachment was absent when queried.
    #[error("missing error info")]
    MissingErrorInfo,
    /// A file could not be opened.
    #[error("failed to open file")]
    OpenFile,
    /// A directory could not be created.
    #[error("failed to create directory")]
    DirectoryCreation,
    /// An internal invariant did not hold. Indicates a defect.
    #[error("internal check failed")]
    InternalCheckFailed,
    /// The LZ4 codec reported a failure.
    #[error("LZ4 codec failure")]
    Lz4Error,
    /// A WebSocket-level transport failure at the service boundary.
    #[error("WebSocket failure")]
    WebSocketError,
}

/// An error with structured, labelled context.
///
/// Cloning is cheap: the backtrace is shared, attachments are small strings.
/// This matters because a single failure can be fanned out to every waiter
/// registered on a cache record.
#[derive(Clone)]
pub struct Error {
    kind: ErrorKind,
    info: Vec<(&'static str, String)>,
    backtrace: Arc<Backtrace>,
}

impl Error {
    /// Creates an error of the given kind, capturing a backtrace here.
    pub fn new(kind: ErrorKind) -> Self {
        Self {
            kind,
            info: Vec::new(),
            backtrace: Arc::new(Backtrace::capture()),
        }
    }

    /// Attaches a labelled value. Later attachments with the same label are
    /// kept; `info` returns the first match.
    pub fn with_info(mut self, label: &'static str, value: impl fmt::Display) -> Self {
        self.info.push((label, value.to_string()));
        self
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// Looks up an attachment by label.
    pub fn info(&self, label: &str) -> Option<&str> {
        self.info
            .iter()
            .find(|(l, _)| *l == label)
            .map(|(_, v)| v.as_str())
    }

    /// Looks up an attachment that must be present.
    ///
    /// If it is absent, fails with `MissingErrorInfo` naming the label that
    /// was asked for and the error it was asked of.
    pub fn required_info(&self, label: &'static str) -> Result<&str> {
        self.info(label).ok_or_else(|| {
            Error::new(ErrorKind::MissingErrorInfo)
                .with_info(labels::ERROR_INFO_ID, label)
                .with_info(labels::INTERNAL_MESSAGE, self.to_string())
        })
    }

    /// The backtrace captured when this error was constructed.
    pub fn backtrace(&self) -> &Backtrace {
        &self.backtrace
    }

    /// True for defects that should abort the current task (but not the
    /// process).
    pub fn is_fatal(&self) -> bool {
        self.kind == ErrorKind::InternalCheckFailed
    }

    /// Shorthand for a cancellation error.
    pub fn canceled() -> Self {
        Self::new(ErrorKind::Canceled)
    }

    /// Shorthand for an internal-check failure with a message.
    pub fn internal(message: impl fmt::Display) -> Self {
        Self::new(ErrorKind::InternalCheckFailed).with_info(labels::INTERNAL_MESSAGE, message)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.kind)?;
        for (label, value) in &self.info {
            write!(f, "; {label}={value}")?;
        }
        Ok(())
    }
}

impl fmt::Debug for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Error")
            .field("kind", &self.kind)
            .field("info", &self.info)
            .finish_non_exhaustive()
    }
}

impl std::error::Error for Error {}

impl From<ErrorKind> for Error {
    fn from(kind: ErrorKind) -> Self {
        Error::new(kind)
    }
}
