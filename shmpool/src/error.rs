//! Error types for shmpool containers.

use std::fmt;

/// Error type for container layout and attach operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// The provided region is smaller than the computed layout.
    RegionTooSmall { need: usize, got: usize },
    /// The region base pointer is not sufficiently aligned.
    Misaligned,
    /// A header field did not match the expected layout on attach.
    BadHeader { field: &'static str },
    /// Capacity or bucket count is zero or out of range.
    InvalidCapacity,
    /// The element type requires alignment beyond what regions guarantee.
    UnsupportedAlignment,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::RegionTooSmall { need, got } => {
                write!(f, "region too small: need {} bytes, got {}", need, got)
            }
            Error::Misaligned => write!(f, "region base pointer is misaligned"),
            Error::BadHeader { field } => write!(f, "header mismatch on attach: {}", field),
            Error::InvalidCapacity => write!(f, "invalid capacity"),
            Error::UnsupportedAlignment => {
                write!(f, "element alignment exceeds region guarantee")
            }
        }
    }
}

impl std::error::Error for Error {}

/// Result type for container operations.
pub type Result<T> = std::result::Result<T, Error>;
