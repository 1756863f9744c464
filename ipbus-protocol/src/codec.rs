/// Read and write implementations for packets and transactions
use std::io::{self, Read, Write};

use crate::{
    error::ReadError,
    protocol::{ByteOrder, Frame, Packet, PacketHeader, TransactionHeader},
};

/// Size of the big-endian byte count that precedes every packet on a stream transport.
pub const LENGTH_PREFIX_BYTES: usize = 4;

fn word_at(bytes: &[u8], index: usize, order: ByteOrder) -> u32 {
    let start = index * 4;
    let mut buf = [0u8; 4];
    buf.copy_from_slice(&bytes[start..start + 4]);
    order.from_bytes(buf)
}

impl Frame {
    /// Appends the encoded frame to `out`.
    pub fn encode(&self, order: ByteOrder, out: &mut Vec<u8>) {
        out.reserve(4 * self.encoded_len());
        out.extend_from_slice(&order.to_bytes(self.header.to_word()));
        for word in self.payload.iter() {
            out.extend_from_slice(&order.to_bytes(*word));
        }
    }

    /// Decodes one frame from the start of `bytes`, returning it along with the number of bytes consumed.
    pub fn decode(bytes: &[u8], order: ByteOrder) -> Result<(Frame, usize), ReadError> {
        let available = bytes.len() / 4;
        if available == 0 {
            return Err(ReadError::Truncated {
                expected: 1,
                got: 0,
            });
        }
        let header = TransactionHeader::from_word(word_at(bytes, 0, order))?;
        let len = header.encoded_len();
        if available < len {
            return Err(ReadError::Truncated {
                expected: len,
                got: available,
            });
        }
        let payload = (1..len).map(|i| word_at(bytes, i, order)).collect();
        Ok((Frame { header, payload }, len * 4))
    }

    pub fn write_to(&self, writer: &mut impl Write, order: ByteOrder) -> io::Result<()> {
        let mut buf = Vec::new();
        self.encode(order, &mut buf);
        writer.write_all(&buf)
    }
}

impl Packet {
    /// Appends the encoded packet to `out`, without the length prefix.
    pub fn encode(&self, order: ByteOrder, out: &mut Vec<u8>) {
        out.reserve(self.encoded_len());
        out.extend_from_slice(&order.to_bytes(self.header.to_word()));
        for frame in &self.frames {
            frame.encode(order, out);
        }
    }

    /// Decodes a complete packet. The byte order is detected from the packet header and returned
    /// so that a reply can be sent in the same order.
    pub fn decode(bytes: &[u8]) -> Result<(Packet, ByteOrder), ReadError> {
        if bytes.len() % 4 != 0 {
            return Err(ReadError::InvalidFormat(format!(
                "Packet length {} is not a multiple of the word size",
                bytes.len()
            )));
        }
        let first: [u8; 4] = bytes
            .get(..4)
            .and_then(|b| b.try_into().ok())
            .ok_or_else(|| ReadError::InvalidFormat("Empty packet".to_string()))?;
        let order = ByteOrder::detect(first)
            .ok_or_else(|| ReadError::InvalidPacketHeader(u32::from_be_bytes(first)))?;
        let header = PacketHeader::from_word(order.from_bytes(first))?;

        let mut frames = Vec::new();
        let mut rest = &bytes[4..];
        while !rest.is_empty() {
            let (frame, consumed) = Frame::decode(rest, order)?;
            frames.push(frame);
            rest = &rest[consumed..];
        }
        Ok((Packet { header, frames }, order))
    }

    /// Writes the packet preceded by its length in bytes.
    pub fn write_to(&self, writer: &mut impl Write, order: ByteOrder) -> io::Result<()> {
        let mut buf = Vec::with_capacity(LENGTH_PREFIX_BYTES + self.encoded_len());
        buf.extend_from_slice(&(self.encoded_len() as u32).to_be_bytes());
        self.encode(order, &mut buf);
        writer.write_all(&buf)?;
        writer.flush()
    }

    /// Reads a length-prefixed packet. Packets larger than `max_packet_size` bytes are rejected
    /// before their body is read.
    pub fn from_reader(
        reader: &mut impl Read,
        max_packet_size: usize,
    ) -> Result<(Packet, ByteOrder), ReadError> {
        let mut prefix = [0u8; LENGTH_PREFIX_BYTES];
        reader.read_exact(&mut prefix)?;
        let len = u32::from_be_bytes(prefix) as usize;
        if len > max_packet_size {
            return Err(ReadError::TooManyBytes {
                max: max_packet_size,
                got: len,
            });
        }
        let mut body = vec![0u8; len];
        reader.read_exact(&mut body)?;
        Packet::decode(&body)
    }
}

#[test]
fn write_empty_packet() {
    let mut out = Vec::new();
    Packet::new(PacketHeader::control(0), Vec::new())
        .write_to(&mut out, ByteOrder::Big)
        .unwrap();
    assert_eq!(out, vec![0, 0, 0, 4, 0x20, 0x00, 0x00, 0xf0]);
}
