use std::{io, sync::Arc};

use ipbus_protocol::{InfoCode, error::AccessError, error::ReadError};
use thiserror::Error;

/// Errors raised by a [`crate::Connection`] or recorded in a failed [`crate::ValHandle`].
///
/// The error is cheap to clone so that one cause can be shared by every handle of a failed batch.
#[derive(Clone, Debug, Error)]
pub enum Error {
    /// The operation violates the address map. Raised when the operation is queued.
    #[error(transparent)]
    Access(#[from] AccessError),
    /// The value of a handle was requested before the flush that resolves it.
    #[error("Result is not ready, flush the connection first")]
    ResultNotReady,
    /// No response arrived within the configured timeout, or the target reported a bus timeout.
    /// Always fails the whole batch.
    #[error("Timed out while waiting for a response")]
    Timeout,
    /// The remote end closed the connection.
    #[error("Connection closed by the remote end")]
    ChannelClosed,
    /// The transaction was lost while resynchronising a corrupted link.
    #[error("Transaction lost to frame corruption")]
    FrameCorruption,
    /// The target reported a bus error.
    #[error("Target reported {0}")]
    Bus(InfoCode),
    /// The reply could not be decoded or does not match the request.
    #[error("Protocol error: {0}")]
    Protocol(Arc<ReadError>),
    #[error("I/O error: {0}")]
    Io(Arc<io::Error>),
}

impl Error {
    /// The error recorded for a transaction whose response carries `info`.
    pub(crate) fn from_info(info: InfoCode) -> Error {
        match info {
            InfoCode::BusTimeoutRead | InfoCode::BusTimeoutWrite => Error::Timeout,
            InfoCode::BadHeader => Error::FrameCorruption,
            other => Error::Bus(other),
        }
    }

    pub(crate) fn mismatch(message: String) -> Error {
        Error::Protocol(Arc::new(ReadError::InvalidFormat(message)))
    }
}

impl From<io::Error> for Error {
    fn from(value: io::Error) -> Self {
        match value.kind() {
            io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => Error::Timeout,
            io::ErrorKind::UnexpectedEof
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe => Error::ChannelClosed,
            _ => Error::Io(Arc::new(value)),
        }
    }
}

impl From<ReadError> for Error {
    fn from(value: ReadError) -> Self {
        match value {
            ReadError::IoError(err) => Error::from(err),
            other => Error::Protocol(Arc::new(other)),
        }
    }
}
