//! Error taxonomy for the layer operation surface.
//!
//! Layers report failures through [`LayerError`]. The taxonomy mirrors what a
//! POSIX caller expects: every error maps to an `errno` value via
//! [`LayerError::errno`], and child I/O failures travel upward unchanged.
//! Integrity events are deliberately absent here; they are logged, never
//! returned.

use std::io;
use std::io::ErrorKind;

use thiserror::Error;

/// Result alias used across the layer stack.
pub type Result<T> = std::result::Result<T, LayerError>;

/// A failure observed by a layer operation.
#[derive(Debug, Error)]
pub enum LayerError {
    /// The descriptor is not open in this layer's handle space.
    #[error("invalid descriptor {0}")]
    BadDescriptor(i32),

    /// The caller violated an operation precondition.
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),

    /// The operation is not available on this layer.
    #[error("unsupported operation: {0}")]
    Unsupported(&'static str),

    /// An I/O failure from a child layer or the operating system.
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl LayerError {
    /// Builds an error directly from a raw errno value.
    #[must_use]
    pub fn from_errno(errno: i32) -> Self {
        Self::Io(io::Error::from_raw_os_error(errno))
    }

    /// Maps this error to the POSIX errno a C caller would observe.
    #[must_use]
    pub fn errno(&self) -> i32 {
        match self {
            Self::BadDescriptor(_) => libc::EBADF,
            Self::InvalidArgument(_) => libc::EINVAL,
            Self::Unsupported(_) => libc::ENOSYS,
            Self::Io(e) => e.raw_os_error().unwrap_or_else(|| kind_errno(e.kind())),
        }
    }
}

/// Fallback mapping for synthetic `io::Error`s that carry no OS code.
fn kind_errno(kind: ErrorKind) -> i32 {
    match kind {
        ErrorKind::NotFound => libc::ENOENT,
        ErrorKind::PermissionDenied => libc::EACCES,
        ErrorKind::AlreadyExists => libc::EEXIST,
        ErrorKind::InvalidInput => libc::EINVAL,
        ErrorKind::WouldBlock => libc::EAGAIN,
        ErrorKind::TimedOut => libc::ETIMEDOUT,
        ErrorKind::WriteZero | ErrorKind::UnexpectedEof => libc::EIO,
        _ => libc::EIO,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bad_descriptor_errno() {
        assert_eq!(LayerError::BadDescriptor(7).errno(), libc::EBADF);
    }

    #[test]
    fn test_os_error_errno_passthrough() {
        let err = LayerError::from_errno(libc::ENOENT);
        assert_eq!(err.errno(), libc::ENOENT);
    }

    #[test]
    fn test_kind_fallback() {
        let err = LayerError::Io(io::Error::new(ErrorKind::NotFound, "gone"));
        assert_eq!(err.errno(), libc::ENOENT);
    }
}
