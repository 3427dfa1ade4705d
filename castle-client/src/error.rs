//! Client-facing error type (§7).

use castle_proto::EngineError;
use thiserror::Error;

use crate::key::KeyError;

/// Everything that can go wrong calling into this library.
///
/// Transport-level errors (everything but [`CastleError::Engine`]) surface as the return
/// of the submitting entrypoint or, for blocking adapters, as the call's `Result`. Engine
/// errors (carried in a response's `err` field) surface the same way for blocking callers;
/// non-blocking callers see them in the response passed to their callback.
#[derive(Debug, Error)]
pub enum CastleError {
    /// Caller supplied null, zero-size, or otherwise mismatched parameters. The ring is
    /// never touched.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Allocation failure. In the batch path, a partially-constructed batch is released
    /// before this is returned.
    #[error("out of memory")]
    OutOfMemory,

    /// `open`, `mmap`, `ioctl`, `pipe`, or `fcntl` failed.
    #[error("os error: {0}")]
    Os(#[from] std::io::Error),

    /// The connect-time protocol handshake reported a version mismatch. Fatal: the fd is
    /// closed and no completion thread is started.
    #[error("protocol version mismatch, connect refused")]
    NoProtocol,

    /// The engine reported an error inside a response.
    #[error(transparent)]
    Engine(#[from] EngineError),

    /// A blocking call observed the connection torn down while waiting.
    #[error("connection is unattached (disconnected while waiting)")]
    Unattached,

    /// A single-get response exceeded `u32::MAX` bytes and the big-get path could not be
    /// used either.
    #[error("value exceeds the maximum representable length")]
    FileTooBig,
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, CastleError>;

impl From<KeyError> for CastleError {
    fn from(e: KeyError) -> Self {
        CastleError::InvalidArgument(e.to_string())
    }
}
