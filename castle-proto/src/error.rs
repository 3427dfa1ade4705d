//! The engine's closed error-code space (§6.6) and its mapping to human-readable strings.

use thiserror::Error;

/// An error reported by the engine inside a [`crate::Response`] (or a control-channel
/// reply). This is a closed enumeration distinct from OS `errno` — ioctl-failure errors
/// (the syscall itself failing) surface as `std::io::Error` in `castle-client`, never as
/// this type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum EngineError {
    #[error("no such entry")]
    NotFound,
    #[error("entry already exists")]
    Exists,
    #[error("collection is not attached")]
    NotAttached,
    #[error("version is stale")]
    StaleVersion,
    #[error("engine is out of space")]
    NoSpace,
    #[error("invalid collection id")]
    BadCollection,
    #[error("operation not supported on this collection")]
    NotSupported,
    #[error("value exceeds the maximum representable length")]
    FileTooBig,
    #[error("engine reported unrecognised error code {0}")]
    Unknown(i32),
}

impl EngineError {
    /// Maps a [`crate::Response::err`] code to an `EngineError`, or `None` for success (0).
    pub fn from_code(code: i32) -> Option<Self> {
        Some(match code {
            0 => return None,
            1 => EngineError::NotFound,
            2 => EngineError::Exists,
            3 => EngineError::NotAttached,
            4 => EngineError::StaleVersion,
            5 => EngineError::NoSpace,
            6 => EngineError::BadCollection,
            7 => EngineError::NotSupported,
            8 => EngineError::FileTooBig,
            other => EngineError::Unknown(other),
        })
    }

    /// The wire code for this error, inverse of [`EngineError::from_code`].
    pub fn code(self) -> i32 {
        match self {
            EngineError::NotFound => 1,
            EngineError::Exists => 2,
            EngineError::NotAttached => 3,
            EngineError::StaleVersion => 4,
            EngineError::NoSpace => 5,
            EngineError::BadCollection => 6,
            EngineError::NotSupported => 7,
            EngineError::FileTooBig => 8,
            EngineError::Unknown(code) => code,
        }
    }
}
