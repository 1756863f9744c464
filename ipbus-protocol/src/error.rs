use std::io;

use thiserror::Error;

/// Errors that may occur when reading a packet or a transaction from a stream.
#[derive(Debug, Error)]
pub enum ReadError {
    #[error("{0}")]
    IoError(#[from] io::Error),
    #[error("{0}")]
    InvalidFormat(String),
    #[error("Unsupported protocol version {0}")]
    UnsupportedVersion(u32),
    #[error("Received invalid packet header {0:#010x}")]
    InvalidPacketHeader(u32),
    #[error("Unsupported packet type {0:#x}")]
    UnsupportedPacketType(u8),
    #[error("Unknown transaction type {0:#x}")]
    UnknownTransactionType(u8),
    #[error("Unknown info code {0:#x}")]
    UnknownInfoCode(u8),
    #[error("Message too large! Maximum is {max}, but got {got}")]
    TooManyBytes { max: usize, got: usize },
    #[error("Truncated transaction: expected {expected} words, got {got}")]
    Truncated { expected: usize, got: usize },
}

/// Errors raised while validating an access against the address map.
///
/// These are raised synchronously when an operation is queued and never travel over the wire.
#[derive(Clone, Debug, Eq, PartialEq, Error)]
pub enum AccessError {
    #[error("No node named '{0}' in the address map")]
    UnknownNode(String),
    #[error("Access of {length} words to node '{node}' exceeds its capacity of {capacity} words")]
    AddressRange {
        node: String,
        length: usize,
        capacity: usize,
    },
    #[error("Mask {mask:#010x} is not a subset of the mask {allowed:#010x} of node '{node}'")]
    MaskViolation { node: String, mask: u32, allowed: u32 },
}

/// Errors raised while parsing or building an address map.
#[derive(Clone, Debug, Eq, PartialEq, Error)]
pub enum MapError {
    #[error("line {line}: {message}")]
    Syntax { line: usize, message: String },
    #[error("Duplicate node name '{0}'")]
    DuplicateNode(String),
    #[error("Node '{0}' has a misaligned address {1:#010x}")]
    Misaligned(String, u32),
    #[error("Node '{0}' has an empty mask or block")]
    Empty(String),
    #[error("Node '{0}' extends beyond the end of the address space")]
    OutOfRange(String),
}
