//! [`tokio_util::codec`] implementations for async transports.
//!
//! - [`PacketCodec`] frames length-prefixed packets on a TCP stream.
//! - [`LinkCodec`] frames transactions on a raw byte-stream link (pipes, serial devices).
use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::{
    codec::LENGTH_PREFIX_BYTES,
    error::ReadError,
    link::{self, LinkDecoder, LinkEvent},
    protocol::{ByteOrder, Frame, Packet},
};

/// Codec for length-prefixed packets.
///
/// Decoded packets are paired with the byte order they were sent in, encoded packets are written
/// in the byte order they are paired with.
#[derive(Debug, Clone)]
pub struct PacketCodec {
    max_packet_size: usize,
}

impl PacketCodec {
    pub fn new(max_packet_size: usize) -> PacketCodec {
        PacketCodec { max_packet_size }
    }
}

impl Decoder for PacketCodec {
    type Item = (Packet, ByteOrder);
    type Error = ReadError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < LENGTH_PREFIX_BYTES {
            return Ok(None);
        }
        let mut prefix = [0u8; LENGTH_PREFIX_BYTES];
        prefix.copy_from_slice(&src[..LENGTH_PREFIX_BYTES]);
        let len = u32::from_be_bytes(prefix) as usize;
        if len > self.max_packet_size {
            return Err(ReadError::TooManyBytes {
                max: self.max_packet_size,
                got: len,
            });
        }
        if src.len() < LENGTH_PREFIX_BYTES + len {
            src.reserve(LENGTH_PREFIX_BYTES + len - src.len());
            return Ok(None);
        }
        src.advance(LENGTH_PREFIX_BYTES);
        let body = src.split_to(len);
        Packet::decode(&body).map(Some)
    }
}

impl Encoder<(Packet, ByteOrder)> for PacketCodec {
    type Error = ReadError;

    fn encode(&mut self, item: (Packet, ByteOrder), dst: &mut BytesMut) -> Result<(), Self::Error> {
        let (packet, order) = item;
        let mut body = Vec::with_capacity(packet.encoded_len());
        packet.encode(order, &mut body);
        dst.reserve(LENGTH_PREFIX_BYTES + body.len());
        dst.put_u32(body.len() as u32);
        dst.extend_from_slice(&body);
        Ok(())
    }
}

/// Codec for SOP-delimited link frames. See [`crate::link`] for the framing rules.
#[derive(Debug, Default)]
pub struct LinkCodec {
    decoder: LinkDecoder,
}

impl LinkCodec {
    pub fn new(max_frame_words: usize) -> LinkCodec {
        LinkCodec {
            decoder: LinkDecoder::new(max_frame_words),
        }
    }
}

impl Decoder for LinkCodec {
    type Item = LinkEvent;
    type Error = ReadError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let (consumed, event) = self.decoder.decode(&src[..]);
        src.advance(consumed);
        Ok(event)
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self.decode(src)? {
            Some(event) => Ok(Some(event)),
            None => Ok(self.decoder.finish()),
        }
    }
}

impl Encoder<Frame> for LinkCodec {
    type Error = ReadError;

    fn encode(&mut self, item: Frame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let mut out = Vec::with_capacity(2 * 4 * item.encoded_len() + 1);
        link::encode_frame(&item, &mut out);
        dst.extend_from_slice(&out);
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::protocol::{Operation, PacketHeader, Request};

    #[test]
    fn packet_codec_waits_for_complete_packet() {
        let packet = Packet::new(
            PacketHeader::control(0),
            vec![Request::new(1, Operation::Read { address: 4, words: 2 }).to_frame()],
        );
        let mut codec = PacketCodec::new(1024);
        let mut encoded = BytesMut::new();
        codec
            .encode((packet.clone(), ByteOrder::Big), &mut encoded)
            .unwrap();

        let mut partial = BytesMut::from(&encoded[..6]);
        assert!(codec.decode(&mut partial).unwrap().is_none());
        partial.extend_from_slice(&encoded[6..]);
        let (decoded, order) = codec.decode(&mut partial).unwrap().unwrap();
        assert_eq!(decoded, packet);
        assert_eq!(order, ByteOrder::Big);
        assert!(partial.is_empty());
    }

    #[test]
    fn link_codec_reports_truncated_frame_at_eof() {
        let frame = Request::new(1, Operation::Read { address: 4, words: 2 }).to_frame();
        let mut codec = LinkCodec::default();
        let mut encoded = BytesMut::new();
        codec.encode(frame, &mut encoded).unwrap();
        encoded.truncate(5);

        assert!(codec.decode(&mut encoded).unwrap().is_none());
        assert_eq!(
            codec.decode_eof(&mut encoded).unwrap(),
            Some(LinkEvent::Corrupted { discarded: 5 })
        );
        assert_eq!(codec.decode_eof(&mut encoded).unwrap(), None);
    }
}
