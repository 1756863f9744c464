use std::{fmt::Display, io};

use ipbus_protocol::error::ReadError;
use thiserror::Error;

/// Failure of a single bus access.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Error)]
pub enum BusError {
    #[error("Bus error at address {0:#010x}")]
    Error(u32),
    #[error("Bus timeout at address {0:#010x}")]
    Timeout(u32),
}

/// One of the byte streams of a bridge.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Channel {
    /// Carries requests from the network-facing server to the serial adapter.
    Request,
    /// Carries responses from the serial adapter back to the server.
    Response,
    /// The physical link to the hardware.
    Link,
}

impl Display for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Channel::Request => f.write_str("request channel"),
            Channel::Response => f.write_str("response channel"),
            Channel::Link => f.write_str("hardware link"),
        }
    }
}

/// Conditions that prevent a batch of transactions from being dispatched at all.
#[derive(Debug, Error)]
pub enum DispatchError {
    /// A bridge channel reached EOF or failed. There is no reconnection: the owning process
    /// has to terminate.
    #[error("The {0} is closed")]
    ChannelClosed(Channel),
}

/// Errors that terminate a client connection or a bridge stage.
#[derive(Debug, Error)]
pub enum ServeError {
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Protocol(ReadError),
    #[error(transparent)]
    Dispatch(#[from] DispatchError),
    #[error("Timed out while sending a reply")]
    Timeout,
}

impl From<ReadError> for ServeError {
    fn from(value: ReadError) -> Self {
        match value {
            ReadError::IoError(err) => ServeError::Io(err),
            other => ServeError::Protocol(other),
        }
    }
}

impl ServeError {
    /// Whether the error is fatal to the whole process rather than to a single client.
    pub fn is_fatal(&self) -> bool {
        matches!(self, ServeError::Dispatch(_))
    }
}
