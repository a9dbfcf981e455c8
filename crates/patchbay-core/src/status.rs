//! Endpoint-visible error kinds.
//!
//! Every failure the substrate can surface maps to a conventional POSIX
//! error value so callers that speak errno (and the wire protocol's
//! negative-return convention) keep working. The [`Error::errno`] accessor
//! is the single source of that mapping.

use nix::errno::Errno;

/// Result alias used throughout the workspace.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Errors surfaced by the endpoint and the wire plumbing beneath it.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Unknown channel id, unknown channel value in a borrowed-channel
    /// push, or an invalid handle where a valid one is required.
    #[error("invalid argument")]
    InvalidArgument,

    /// Reply attempted on a channel that has already been torn down.
    #[error("channel socket is no longer live")]
    StaleChannel,

    /// Operation is declared but intentionally unimplemented.
    #[error("operation not implemented")]
    NotImplemented,

    /// Non-blocking receive found no ready event.
    #[error("no event ready")]
    TimedOut,

    /// The endpoint was cancelled, or the peer closed cleanly at a frame
    /// boundary.
    #[error("endpoint shut down")]
    Shutdown,

    /// A header, ancillary block, or payload body ended early.
    #[error("truncated {what}: got {got} of {expected} bytes")]
    Truncated {
        /// Which wire element came up short.
        what: &'static str,
        /// Bytes (or descriptors) actually seen.
        got: usize,
        /// Bytes (or descriptors) the frame declared.
        expected: usize,
    },

    /// A declared length or descriptor count exceeds the protocol limit.
    ///
    /// Checked before any allocation happens.
    #[error("{what} of {size} exceeds limit {max}")]
    TooLarge {
        /// Which limit was violated.
        what: &'static str,
        /// Declared size.
        size: usize,
        /// Protocol limit.
        max: usize,
    },

    /// Any other syscall failure, propagated verbatim.
    #[error("os error: {0}")]
    Os(#[from] Errno),
}

impl Error {
    /// The conventional POSIX value for this error.
    #[must_use]
    pub fn errno(&self) -> Errno {
        match self {
            Self::InvalidArgument => Errno::EINVAL,
            Self::StaleChannel => Errno::EBADF,
            Self::NotImplemented => Errno::EFAULT,
            Self::TimedOut => Errno::ETIMEDOUT,
            Self::Shutdown => Errno::ESHUTDOWN,
            Self::Truncated { .. } => Errno::EIO,
            Self::TooLarge { .. } => Errno::EMSGSIZE,
            Self::Os(errno) => *errno,
        }
    }

    /// The negative-errno form used as a wire return code.
    #[must_use]
    pub fn return_code(&self) -> i32 {
        -(self.errno() as i32)
    }
}
