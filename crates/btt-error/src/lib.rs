#![forbid(unsafe_code)]
//! Error types for the BTT workspace.
//!
//! Defines `BttError` and a `Result<T>` alias used throughout the
//! workspace, plus errno mappings for block-device glue code.

use thiserror::Error;

/// Unified error type for all BTT operations.
#[derive(Debug, Error)]
pub enum BttError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("lba {lba} out of range (nlba {nlba})")]
    LbaOutOfRange { lba: u64, nlba: u64 },

    #[error("lane {lane} out of range (nlane {nlane})")]
    LaneOutOfRange { lane: u32, nlane: u32 },

    #[error("namespace too small: {rawsize} bytes, minimum {min}")]
    NamespaceTooSmall { rawsize: u64, min: u64 },

    #[error("namespace access out of bounds: offset {offset} len {len} size {size}")]
    OutOfBounds { offset: u64, len: usize, size: u64 },

    #[error("buffer length {len} does not match lba size {lbasize}")]
    BadBufferLength { len: usize, lbasize: u32 },

    #[error("arena disabled by error flags {flags:#x}")]
    ArenaError { flags: u32 },

    #[error("lba {lba} is marked bad")]
    BadBlock { lba: u64 },
}

impl BttError {
    /// Convert this error into a POSIX errno for block-device glue.
    #[must_use]
    pub fn to_errno(&self) -> libc::c_int {
        match self {
            Self::Io(err) => err.raw_os_error().unwrap_or(libc::EIO),
            Self::LbaOutOfRange { .. }
            | Self::LaneOutOfRange { .. }
            | Self::NamespaceTooSmall { .. }
            | Self::OutOfBounds { .. }
            | Self::BadBufferLength { .. } => libc::EINVAL,
            Self::ArenaError { .. } | Self::BadBlock { .. } => libc::EIO,
        }
    }
}

/// Result alias using `BttError`.
pub type Result<T> = std::result::Result<T, BttError>;
