//! Error taxonomy for list operations.

use thiserror::Error;

/// Errors surfaced at the boundaries of the list broker core.
///
/// Fillers store one of these in the tile they failed to fill; readers see it
/// when they try to consume the tile. "OK" is not a variant: success is the
/// `Ok` side of a `Result`.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListError {
    #[error("operation interrupted")]
    Interrupted,

    #[error("invalid list or item id")]
    InvalidId,

    #[error("internal error")]
    Internal,

    #[error("protocol error")]
    Protocol,

    #[error("no data available")]
    Empty,

    #[error("permission denied")]
    PermissionDenied,

    #[error("operation not supported")]
    NotSupported,

    #[error("source is busy")]
    Busy,

    #[error("network I/O error")]
    NetIo,

    #[error("entry not found")]
    NotFound,
}

/// Result type alias for list operations.
pub type ListResult<T> = Result<T, ListError>;
