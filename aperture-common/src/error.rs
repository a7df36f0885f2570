// SPDX-FileCopyrightText: 2025 aperture contributors
// SPDX-License-Identifier: GPL-3.0-or-later

use thiserror::Error;

use crate::types::Handle;

/// Errors surfaced to callers of the buffer manager.
///
/// Internal invariant violations (a pinned object on the inactive list, a
/// double-released aperture block) are not represented here: they panic.
#[derive(Debug, Error)]
pub enum GemError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("unknown object handle {0}")]
    UnknownHandle(Handle),

    #[error("out of memory")]
    OutOfMemory,

    #[error("aperture has no evictable space")]
    NoSpace,

    #[error("device unresponsive waiting for seqno {seqno} (stuck at {last_seen})")]
    DeviceUnresponsive { seqno: u32, last_seen: u32 },

    #[error("wait interrupted")]
    Interrupted,

    #[error("device busy")]
    Busy,

    #[error("configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result alias for buffer manager operations.
pub type Result<T> = std::result::Result<T, GemError>;

/// POSIX errno values used by the ioctl layer.
pub mod errno {
    pub const EINTR: i32 = 4;
    pub const EIO: i32 = 5;
    pub const ENOMEM: i32 = 12;
    pub const EFAULT: i32 = 14;
    pub const EBUSY: i32 = 16;
    pub const EINVAL: i32 = 22;
    pub const ENOSPC: i32 = 28;
}

impl GemError {
    /// Shorthand for [`GemError::InvalidArgument`].
    pub fn invalid(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }

    /// Positive errno equivalent of this error.
    pub fn errno(&self) -> i32 {
        match self {
            Self::InvalidArgument(_) | Self::UnknownHandle(_) | Self::Config(_) => errno::EINVAL,
            Self::OutOfMemory => errno::ENOMEM,
            Self::NoSpace => errno::ENOSPC,
            Self::DeviceUnresponsive { .. } | Self::Io(_) => errno::EIO,
            Self::Interrupted => errno::EINTR,
            Self::Busy => errno::EBUSY,
        }
    }

    /// Whether the caller may simply retry the operation.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Interrupted | Self::Busy)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_errno_mapping() {
        assert_eq!(GemError::invalid("x").errno(), errno::EINVAL);
        assert_eq!(GemError::UnknownHandle(3).errno(), errno::EINVAL);
        assert_eq!(GemError::OutOfMemory.errno(), errno::ENOMEM);
        assert_eq!(GemError::NoSpace.errno(), errno::ENOSPC);
        assert_eq!(GemError::Interrupted.errno(), errno::EINTR);
        assert_eq!(
            GemError::DeviceUnresponsive {
                seqno: 4,
                last_seen: 2
            }
            .errno(),
            errno::EIO
        );
    }

    #[test]
    fn test_interrupted_is_distinct_from_hang() {
        assert!(GemError::Interrupted.is_retryable());
        assert!(!GemError::DeviceUnresponsive {
            seqno: 1,
            last_seen: 0
        }
        .is_retryable());
    }

    #[test]
    fn test_display() {
        let e = GemError::UnknownHandle(7);
        assert_eq!(e.to_string(), "unknown object handle 7");
    }
}
