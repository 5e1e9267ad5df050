use std::io;

use thiserror::Error;

/// Semantic error taxonomy of the socket runtime.
///
/// Kernel errors are folded into these kinds at the syscall boundary;
/// anything without a semantic bucket keeps its raw errno in `Os`.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// Retry later. Ends the current iteration, never surfaced to a user
    /// callback except as the outcome of a deadline.
    #[error("operation would block")]
    WouldBlock,
    /// The peer closed its send half.
    #[error("end of stream")]
    Eof,
    /// Cancelled by token or by socket teardown.
    #[error("operation cancelled")]
    Cancelled,
    /// The peer hard-closed the connection.
    #[error("connection is dead")]
    ConnectionDead,
    #[error("connection reset by peer")]
    ConnectionReset,
    #[error("connection attempt timed out")]
    ConnectionTimeout,
    /// The operation is not valid in the socket's current state.
    #[error("invalid operation for the current socket state")]
    Invalid,
    /// Handle reservations exhausted.
    #[error("handle limit reached")]
    Limit,
    /// Platform feature absent.
    #[error("not implemented on this platform")]
    NotImplemented,
    #[error("tls: {0}")]
    Tls(String),
    #[error("os error {0}")]
    Os(i32),
}

impl Error {
    pub fn is_would_block(&self) -> bool {
        matches!(self, Self::WouldBlock)
    }

    /// True for the peer-hard-close pair that is treated as a symmetric
    /// shutdown rather than a transport error.
    pub fn is_connection_lost(&self) -> bool {
        matches!(self, Self::ConnectionDead | Self::ConnectionReset)
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::WouldBlock => Self::WouldBlock,
            io::ErrorKind::UnexpectedEof => Self::Eof,
            io::ErrorKind::ConnectionReset => Self::ConnectionReset,
            io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionRefused
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::NotConnected => Self::ConnectionDead,
            io::ErrorKind::TimedOut => Self::ConnectionTimeout,
            io::ErrorKind::Unsupported => Self::NotImplemented,
            _ => Self::Os(err.raw_os_error().unwrap_or(0)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn io_kinds_fold_into_the_taxonomy() {
        let reset = io::Error::from(io::ErrorKind::ConnectionReset);
        assert_eq!(Error::from(reset), Error::ConnectionReset);

        let pipe = io::Error::from(io::ErrorKind::BrokenPipe);
        assert_eq!(Error::from(pipe), Error::ConnectionDead);

        let block = io::Error::from(io::ErrorKind::WouldBlock);
        assert!(Error::from(block).is_would_block());
    }

    #[test]
    fn connection_lost_covers_both_hard_closes() {
        assert!(Error::ConnectionDead.is_connection_lost());
        assert!(Error::ConnectionReset.is_connection_lost());
        assert!(!Error::Eof.is_connection_lost());
    }
}
