//! Status codes and error types for tier operations
//!
//! `NvmError` is the error carried through `Result`s; `Status` is the flat code
//! derived from it for callers that only want the category.

use std::fmt;
use std::io;

/// Status code returned by tier operations
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum Status {
    /// Operation completed successfully
    #[default]
    Ok = 0,
    /// No free fast-tier segment
    NoSpace = 1,
    /// I/O error occurred
    IoError = 2,
    /// Metadata corruption or identity mismatch detected
    Corruption = 3,
    /// Internal invariant violated
    InvariantViolated = 4,
    /// Invalid argument provided
    InvalidArgument = 5,
    /// Nothing could be freed, caller should retry later
    TryAgain = 6,
    /// Error reported by the host filesystem
    HostError = 7,
}

impl Status {
    /// Check if the status indicates success
    #[inline]
    pub const fn is_ok(&self) -> bool {
        matches!(self, Status::Ok)
    }

    /// Check if the caller may recover by falling back or retrying
    #[inline]
    pub const fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Status::Ok | Status::NoSpace | Status::TryAgain | Status::Corruption
        )
    }

    /// Get the status as a string
    pub const fn as_str(&self) -> &'static str {
        match self {
            Status::Ok => "Ok",
            Status::NoSpace => "NoSpace",
            Status::IoError => "IoError",
            Status::Corruption => "Corruption",
            Status::InvariantViolated => "InvariantViolated",
            Status::InvalidArgument => "InvalidArgument",
            Status::TryAgain => "TryAgain",
            Status::HostError => "HostError",
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Errors returned by the fast-tier cache.
#[derive(Debug, thiserror::Error)]
pub enum NvmError {
    /// No fast-tier segment can be allocated right now.
    #[error("no free fast-tier segment")]
    NoSpace,
    /// Device I/O failed.
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    /// Copying a segment back to the slow tier failed; its mapping was kept.
    #[error("migration of fast segment {fast} (slow segment {slow}) failed: {source}")]
    MigrationFailed {
        /// Fast-tier segment being migrated.
        fast: u32,
        /// Slow-tier counterpart.
        slow: u32,
        /// Underlying I/O error.
        #[source]
        source: io::Error,
    },
    /// An internal invariant does not hold; the operation was aborted.
    #[error("invariant violated: {0}")]
    Invariant(String),
    /// The fast-tier descriptor belongs to a different slow device.
    #[error("identity mismatch: fast tier {fast}, slow tier {slow}")]
    IdentityMismatch {
        /// Identity recorded in the fast-tier descriptor.
        fast: uuid::Uuid,
        /// Identity of the slow tier being mounted.
        slow: uuid::Uuid,
    },
    /// Persistent metadata could not be decoded.
    #[error("corrupted metadata: {0}")]
    Corruption(String),
    /// Format geometry cannot be laid out.
    #[error("invalid geometry: {0}")]
    InvalidGeometry(String),
    /// An I/O request cannot be translated.
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    /// An argument is not valid in the current mode.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    /// Nothing could be freed; retry later.
    #[error("no segment could be freed, try again")]
    TryAgain,
    /// The host filesystem reported a failure.
    #[error("host error: {0}")]
    Host(String),
}

impl NvmError {
    /// Build an invariant violation error.
    pub(crate) fn invariant(message: impl Into<String>) -> Self {
        let message = message.into();
        tracing::error!(%message, "invariant violated");
        NvmError::Invariant(message)
    }

    /// Flat status code for this error
    pub fn status(&self) -> Status {
        match self {
            NvmError::NoSpace => Status::NoSpace,
            NvmError::Io(_) | NvmError::MigrationFailed { .. } => Status::IoError,
            NvmError::Invariant(_) => Status::InvariantViolated,
            NvmError::IdentityMismatch { .. } | NvmError::Corruption(_) => Status::Corruption,
            NvmError::InvalidGeometry(_)
            | NvmError::InvalidRequest(_)
            | NvmError::InvalidArgument(_) => Status::InvalidArgument,
            NvmError::TryAgain => Status::TryAgain,
            NvmError::Host(_) => Status::HostError,
        }
    }
}

/// Result alias used throughout the crate
pub type Result<T> = std::result::Result<T, NvmError>;
