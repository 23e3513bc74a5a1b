//! Error taxonomy for the runtime.
//!
//! `would-block` never crosses this boundary: every blocking operation
//! converts it into a suspension internally (see [`crate::scheduler`]).

use std::io;

use thiserror::Error;

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced to callers of [`crate::socket::Socket`] and
/// [`crate::scheduler::Scheduler`] operations.
#[derive(Debug, Error)]
pub enum Error {
    /// Allocation failed; never retried.
    #[error("out of memory")]
    Oom,

    /// A kernel syscall failed for a reason other than would-block.
    #[error("syscall failed: {0}")]
    Syscall(#[source] io::Error),

    /// A deadline fired while the task was parked.
    #[error("operation timed out")]
    Timeout,

    /// The scheduler is stopping; the caller must unwind without
    /// issuing new blocking operations.
    #[error("task cancelled")]
    Cancelled,

    /// `readline` accumulated `max` bytes without finding the delimiter.
    #[error("buffer overflow: exceeded {max} bytes without finding delimiter")]
    Overflow {
        /// The cap that was hit.
        max: usize,
    },

    /// `expect` saw a byte that differed from the expected prefix.
    #[error("expected prefix mismatch at offset {offset}")]
    Mismatch {
        /// Offset of the first differing byte.
        offset: usize,
    },

    /// The peer closed the connection.
    #[error("peer closed the connection")]
    Closed,

    /// A write hit a broken pipe.
    #[error("broken pipe")]
    EPipe,

    /// `connect` was refused by the peer.
    #[error("connection refused")]
    Refused,
}

impl Error {
    /// Classify an [`io::Error`] coming back from a non-blocking syscall
    /// retry into the taxonomy above. Callers are expected to have
    /// already special-cased `WouldBlock` before reaching this helper.
    pub(crate) fn from_io(err: io::Error) -> Self {
        match err.raw_os_error() {
            Some(libc::ECONNREFUSED) => Error::Refused,
            Some(libc::EPIPE) => Error::EPipe,
            Some(libc::ENOMEM) | Some(libc::ENOBUFS) => Error::Oom,
            _ => Error::Syscall(err),
        }
    }

    /// Whether the task that produced this error must unwind without
    /// attempting any further blocking operation on the scheduler.
    pub fn is_terminal_for_task(&self) -> bool {
        matches!(self, Error::Cancelled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn from_io_maps_enomem_and_enobufs_to_oom() {
        assert!(matches!(
            Error::from_io(io::Error::from_raw_os_error(libc::ENOMEM)),
            Error::Oom
        ));
        assert!(matches!(
            Error::from_io(io::Error::from_raw_os_error(libc::ENOBUFS)),
            Error::Oom
        ));
    }

    #[test]
    fn from_io_maps_known_errnos() {
        assert!(matches!(
            Error::from_io(io::Error::from_raw_os_error(libc::ECONNREFUSED)),
            Error::Refused
        ));
        assert!(matches!(
            Error::from_io(io::Error::from_raw_os_error(libc::EPIPE)),
            Error::EPipe
        ));
    }
}
