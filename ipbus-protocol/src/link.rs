//! Framing of transactions on a raw byte-stream link.
//!
//! Serial links and pipes have no packet boundaries, so every transaction is sent as a link frame:
//!
//! ```text
//! | SOP (0xBC) | escaped big-endian transaction words ... |
//! ```
//!
//! The end of a frame is implied by the length encoded in its transaction header.
//! Three byte values are reserved and never appear raw inside a frame:
//!
//! - [`SOP`] (`0xBC`, K28.5) marks the start of a frame,
//! - [`CAPTURE`] (`0x3C`, K28.1) is the capture/trigger marker used by pattern fixtures,
//! - [`ESC`] (`0x7D`) introduces an escaped byte.
//!
//! A reserved byte inside a frame is sent as `ESC, byte ^ 0x20`.
//!
//! The decoder discards everything up to the next `SOP`. If a frame is interrupted by a raw
//! reserved byte, carries an invalid escape or an unrecognised header, it is dropped and decoding
//! resumes at the next `SOP`. A dropped frame is reported once as [`LinkEvent::Corrupted`]; the
//! bytes skipped on the way to the next `SOP`, including the rest of a dropped frame, are
//! reported as [`LinkEvent::Skipped`]. Lost transactions are never retried.
use crate::protocol::{ByteOrder, Frame, MAX_TRANSACTION_WORDS, TransactionHeader};

pub const SOP: u8 = 0xbc;
pub const CAPTURE: u8 = 0x3c;
pub const ESC: u8 = 0x7d;
const ESCAPE_XOR: u8 = 0x20;

/// Largest frame the decoder accepts: a header, an address and a full block of words.
pub const DEFAULT_MAX_FRAME_WORDS: usize = 2 + MAX_TRANSACTION_WORDS;

fn is_reserved(byte: u8) -> bool {
    matches!(byte, SOP | CAPTURE | ESC)
}

/// Appends the link encoding of `frame` to `out`.
pub fn encode_frame(frame: &Frame, out: &mut Vec<u8>) {
    let mut body = Vec::with_capacity(4 * frame.encoded_len());
    frame.encode(ByteOrder::Big, &mut body);
    out.reserve(body.len() + 1);
    out.push(SOP);
    for byte in body {
        if is_reserved(byte) {
            out.push(ESC);
            out.push(byte ^ ESCAPE_XOR);
        } else {
            out.push(byte);
        }
    }
}

/// Output of the [`LinkDecoder`].
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum LinkEvent {
    Frame(Frame),
    /// A started frame was dropped after `discarded` raw bytes.
    Corrupted { discarded: usize },
    /// `discarded` raw bytes outside of any frame were skipped while resynchronising.
    Skipped { discarded: usize },
}

/// Incremental decoder for link frames.
///
/// Bytes can be fed in arbitrary chunks; a partially received frame is kept between calls.
#[derive(Debug)]
pub struct LinkDecoder {
    in_frame: bool,
    escaped: bool,
    /// Unescaped bytes of the current frame.
    body: Vec<u8>,
    /// Raw bytes of the current frame, including the SOP.
    raw_len: usize,
    expected: Option<usize>,
    /// Raw bytes skipped since the last event.
    skipped: usize,
    max_frame_words: usize,
}

impl Default for LinkDecoder {
    fn default() -> Self {
        LinkDecoder::new(DEFAULT_MAX_FRAME_WORDS)
    }
}

impl LinkDecoder {
    pub fn new(max_frame_words: usize) -> LinkDecoder {
        LinkDecoder {
            in_frame: false,
            escaped: false,
            body: Vec::new(),
            raw_len: 0,
            expected: None,
            skipped: 0,
            max_frame_words,
        }
    }

    /// Consumes bytes from `src` until an event is available or the input is exhausted.
    /// Returns the number of bytes consumed and the event, if any.
    ///
    /// Skipped bytes are reported when the next frame starts, or by [`LinkDecoder::finish`].
    pub fn decode(&mut self, src: &[u8]) -> (usize, Option<LinkEvent>) {
        let mut pos = 0;
        while pos < src.len() {
            let byte = src[pos];
            if !self.in_frame {
                pos += 1;
                if byte == SOP {
                    self.start_frame();
                    if self.skipped > 0 {
                        return (pos, Some(self.take_skipped()));
                    }
                } else {
                    self.skipped += 1;
                }
                continue;
            }

            if byte == SOP {
                // Leave the SOP in place; it starts the next frame.
                return (pos, Some(self.abort_frame()));
            }
            pos += 1;
            self.raw_len += 1;

            if byte == CAPTURE || (byte == ESC && self.escaped) {
                return (pos, Some(self.abort_frame()));
            }
            if byte == ESC {
                self.escaped = true;
                continue;
            }
            let value = if self.escaped {
                self.escaped = false;
                let value = byte ^ ESCAPE_XOR;
                if !is_reserved(value) {
                    return (pos, Some(self.abort_frame()));
                }
                value
            } else {
                byte
            };
            self.body.push(value);

            if self.body.len() == 4 {
                let word = u32::from_be_bytes([self.body[0], self.body[1], self.body[2], self.body[3]]);
                match TransactionHeader::from_word(word) {
                    Ok(header) if header.encoded_len() <= self.max_frame_words => {
                        self.expected = Some(4 * header.encoded_len());
                    }
                    _ => return (pos, Some(self.abort_frame())),
                }
            }

            if Some(self.body.len()) == self.expected {
                let event = match Frame::decode(&self.body, ByteOrder::Big) {
                    Ok((frame, _)) => LinkEvent::Frame(frame),
                    Err(_) => LinkEvent::Corrupted {
                        discarded: self.raw_len,
                    },
                };
                self.reset_frame();
                return (pos, Some(event));
            }
        }
        (pos, None)
    }

    /// Flushes the decoder at the end of the stream. A partially received frame is reported as
    /// corruption, pending skipped bytes as such.
    pub fn finish(&mut self) -> Option<LinkEvent> {
        if self.in_frame {
            Some(self.abort_frame())
        } else if self.skipped > 0 {
            Some(self.take_skipped())
        } else {
            None
        }
    }

    fn start_frame(&mut self) {
        self.reset_frame();
        self.in_frame = true;
        self.raw_len = 1;
    }

    fn abort_frame(&mut self) -> LinkEvent {
        let discarded = self.raw_len;
        self.reset_frame();
        LinkEvent::Corrupted { discarded }
    }

    fn reset_frame(&mut self) {
        self.in_frame = false;
        self.escaped = false;
        self.body.clear();
        self.raw_len = 0;
        self.expected = None;
    }

    fn take_skipped(&mut self) -> LinkEvent {
        LinkEvent::Skipped {
            discarded: std::mem::take(&mut self.skipped),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::protocol::{InfoCode, Operation, Request, Response, TransactionType};

    fn decode_all(decoder: &mut LinkDecoder, mut src: &[u8]) -> Vec<LinkEvent> {
        let mut events = Vec::new();
        while !src.is_empty() {
            let (consumed, event) = decoder.decode(src);
            src = &src[consumed..];
            events.extend(event);
        }
        events
    }

    fn write_frame(data: Vec<u32>) -> Frame {
        Request::new(
            1,
            Operation::Write {
                address: 0x1000_0000,
                data: data.into_boxed_slice(),
            },
        )
        .to_frame()
    }

    #[test]
    fn encoded_frame_starts_with_sop() {
        let frame = Request::new(1, Operation::Read { address: 0, words: 1 }).to_frame();
        let mut out = Vec::new();
        encode_frame(&frame, &mut out);
        assert_eq!(
            out,
            vec![SOP, 0x20, 0x01, 0x01, 0x0f, 0x00, 0x00, 0x00, 0x00]
        );
    }

    #[test]
    fn reserved_bytes_are_escaped() {
        let frame = write_frame(vec![0x505050bc, 0x0000_3c7d]);
        let mut out = Vec::new();
        encode_frame(&frame, &mut out);
        assert_eq!(out.iter().filter(|b| **b == SOP).count(), 1);
        assert!(!out.contains(&CAPTURE));
        assert!(out.windows(2).any(|w| w == [ESC, SOP ^ 0x20]));

        let mut decoder = LinkDecoder::default();
        assert_eq!(decode_all(&mut decoder, &out), vec![LinkEvent::Frame(frame)]);
    }

    #[test]
    fn frames_split_across_chunks() {
        let frame = write_frame((0..20).collect());
        let mut out = Vec::new();
        encode_frame(&frame, &mut out);

        let mut decoder = LinkDecoder::default();
        let mut events = Vec::new();
        for chunk in out.chunks(3) {
            events.extend(decode_all(&mut decoder, chunk));
        }
        assert_eq!(events, vec![LinkEvent::Frame(frame)]);
    }

    #[test]
    fn resynchronise_after_garbage() {
        let frame = write_frame(vec![1, 2, 3]);
        let mut out = vec![0x01, 0x02, 0x03];
        encode_frame(&frame, &mut out);

        let mut decoder = LinkDecoder::default();
        assert_eq!(
            decode_all(&mut decoder, &out),
            vec![
                LinkEvent::Skipped { discarded: 3 },
                LinkEvent::Frame(frame)
            ]
        );
    }

    #[test]
    fn interrupted_frame_is_dropped() {
        let first = write_frame(vec![0xdead_beef, 0xcafe_f00d]);
        let second = write_frame(vec![7]);
        let mut out = Vec::new();
        encode_frame(&first, &mut out);
        out.truncate(7);
        encode_frame(&second, &mut out);

        let mut decoder = LinkDecoder::default();
        assert_eq!(
            decode_all(&mut decoder, &out),
            vec![
                LinkEvent::Corrupted { discarded: 7 },
                LinkEvent::Frame(second)
            ]
        );
    }

    #[test]
    fn unrecognised_header_is_skipped() {
        let response = Response {
            id: 2,
            kind: TransactionType::Read,
            words: 1,
            info: InfoCode::Success,
            data: vec![0xefef_efef].into_boxed_slice(),
        };
        let mut out = vec![SOP, 0x10, 0x00, 0x00, 0x00];
        encode_frame(&response.to_frame(), &mut out);

        let mut decoder = LinkDecoder::default();
        assert_eq!(
            decode_all(&mut decoder, &out),
            vec![
                LinkEvent::Corrupted { discarded: 5 },
                LinkEvent::Frame(response.to_frame())
            ]
        );
    }

    #[test]
    fn raw_capture_inside_frame_is_corruption() {
        let mut out = vec![SOP, 0x20, CAPTURE];
        encode_frame(&write_frame(vec![1]), &mut out);

        let mut decoder = LinkDecoder::default();
        let events = decode_all(&mut decoder, &out);
        assert_eq!(events[0], LinkEvent::Corrupted { discarded: 3 });
        assert!(matches!(events[1], LinkEvent::Frame(_)));
    }

    #[test]
    fn partial_frame_at_end_of_stream() {
        let mut out = Vec::new();
        encode_frame(&write_frame(vec![1, 2]), &mut out);
        out.truncate(6);

        let mut decoder = LinkDecoder::default();
        assert!(decode_all(&mut decoder, &out).is_empty());
        assert_eq!(decoder.finish(), Some(LinkEvent::Corrupted { discarded: 6 }));
        assert_eq!(decoder.finish(), None);
    }

    #[test]
    fn oversized_frame_is_rejected() {
        let mut out = Vec::new();
        encode_frame(&write_frame((0..16).collect()), &mut out);

        let mut decoder = LinkDecoder::new(8);
        let events = decode_all(&mut decoder, &out);
        assert_eq!(events, vec![LinkEvent::Corrupted { discarded: 5 }]);
        assert!(matches!(decoder.finish(), Some(LinkEvent::Skipped { .. })));
    }

    #[test]
    fn capture_inside_frame_is_reported_once() {
        let frames: Vec<Frame> = (1..=3)
            .map(|id| Request::new(id, Operation::Read { address: 0x1000_0000, words: 1 }).to_frame())
            .collect();
        let mut out = Vec::new();
        encode_frame(&frames[0], &mut out);
        let first_len = out.len();
        out[3] = CAPTURE;
        encode_frame(&frames[1], &mut out);
        encode_frame(&frames[2], &mut out);

        let mut decoder = LinkDecoder::default();
        assert_eq!(
            decode_all(&mut decoder, &out),
            vec![
                LinkEvent::Corrupted { discarded: 4 },
                LinkEvent::Skipped {
                    discarded: first_len - 4
                },
                LinkEvent::Frame(frames[1].clone()),
                LinkEvent::Frame(frames[2].clone()),
            ]
        );
    }

    #[test]
    fn noise_is_reported_when_the_next_frame_starts() {
        let frame = write_frame(vec![1]);
        let mut decoder = LinkDecoder::default();
        assert_eq!(decoder.decode(&[0x01, 0x02]), (2, None));
        assert_eq!(decoder.decode(&[0x03]), (1, None));

        let mut out = Vec::new();
        encode_frame(&frame, &mut out);
        assert_eq!(
            decode_all(&mut decoder, &out),
            vec![LinkEvent::Skipped { discarded: 3 }, LinkEvent::Frame(frame)]
        );
        assert_eq!(decoder.finish(), None);
    }
}
