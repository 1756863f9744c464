//! In-process byte channels that stand in for the pipes between bridge stages.
use tokio::io::{DuplexStream, ReadHalf, WriteHalf};

pub type ByteWriter = WriteHalf<DuplexStream>;
pub type ByteReader = ReadHalf<DuplexStream>;

/// Creates a unidirectional byte stream buffering up to `capacity` bytes.
///
/// Writes wait while the buffer is full. Dropping the writer signals EOF to the reader once the
/// buffered bytes are consumed; dropping the reader makes further writes fail.
pub fn byte_channel(capacity: usize) -> (ByteWriter, ByteReader) {
    let (sender, receiver) = tokio::io::duplex(capacity);
    let (_, writer) = tokio::io::split(sender);
    let (reader, _) = tokio::io::split(receiver);
    (writer, reader)
}
