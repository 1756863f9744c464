use std::fmt::Display;

use crate::error::ReadError;

/// Protocol version carried in the upper nibble of every header word.
pub const PROTOCOL_VERSION: u32 = 2;

/// The largest number of words a single transaction can read or write.
/// Longer block transfers must be split into several transactions.
pub const MAX_TRANSACTION_WORDS: usize = 255;

/// The type of a transaction, encoded in bits 7..4 of the transaction header.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
#[repr(u8)]
pub enum TransactionType {
    /// Incrementing read of `words` consecutive words.
    Read = 0x0,
    /// Incrementing write of `words` consecutive words.
    Write = 0x1,
    /// Reads the same address `words` times.
    NonIncrementingRead = 0x2,
    /// Writes `words` values to the same address.
    NonIncrementingWrite = 0x3,
    /// Read-modify-write: `register := (register & and_term) | or_term`.
    RmwBits = 0x4,
    /// Read-modify-write: `register := register + addend`.
    RmwSum = 0x5,
}

impl TransactionType {
    pub fn from_bits(bits: u8) -> Option<TransactionType> {
        match bits {
            0x0 => Some(TransactionType::Read),
            0x1 => Some(TransactionType::Write),
            0x2 => Some(TransactionType::NonIncrementingRead),
            0x3 => Some(TransactionType::NonIncrementingWrite),
            0x4 => Some(TransactionType::RmwBits),
            0x5 => Some(TransactionType::RmwSum),
            _ => None,
        }
    }

    /// Whether bus failures of this transaction are reported as read errors.
    pub fn is_read(&self) -> bool {
        matches!(
            self,
            TransactionType::Read | TransactionType::NonIncrementingRead
        )
    }

    /// The info code reporting a bus error for this transaction.
    pub fn bus_error(&self) -> InfoCode {
        if self.is_read() {
            InfoCode::BusErrorRead
        } else {
            InfoCode::BusErrorWrite
        }
    }

    /// The info code reporting a bus timeout for this transaction.
    pub fn bus_timeout(&self) -> InfoCode {
        if self.is_read() {
            InfoCode::BusTimeoutRead
        } else {
            InfoCode::BusTimeoutWrite
        }
    }
}

/// Direction and error state of a transaction, encoded in bits 3..0 of the transaction header.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
#[repr(u8)]
pub enum InfoCode {
    Success = 0x0,
    BadHeader = 0x1,
    BusErrorRead = 0x4,
    BusErrorWrite = 0x5,
    BusTimeoutRead = 0x6,
    BusTimeoutWrite = 0x7,
    /// Every request sent from a client to a target carries this code.
    Request = 0xf,
}

impl InfoCode {
    pub fn from_bits(bits: u8) -> Option<InfoCode> {
        match bits {
            0x0 => Some(InfoCode::Success),
            0x1 => Some(InfoCode::BadHeader),
            0x4 => Some(InfoCode::BusErrorRead),
            0x5 => Some(InfoCode::BusErrorWrite),
            0x6 => Some(InfoCode::BusTimeoutRead),
            0x7 => Some(InfoCode::BusTimeoutWrite),
            0xf => Some(InfoCode::Request),
            _ => None,
        }
    }

    /// True for every response code other than [`InfoCode::Success`].
    pub fn is_error(&self) -> bool {
        !matches!(self, InfoCode::Success | InfoCode::Request)
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, InfoCode::BusTimeoutRead | InfoCode::BusTimeoutWrite)
    }
}

impl Display for InfoCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let text = match self {
            InfoCode::Success => "success",
            InfoCode::BadHeader => "bad header",
            InfoCode::BusErrorRead => "bus error on read",
            InfoCode::BusErrorWrite => "bus error on write",
            InfoCode::BusTimeoutRead => "bus timeout on read",
            InfoCode::BusTimeoutWrite => "bus timeout on write",
            InfoCode::Request => "request",
        };
        f.write_str(text)
    }
}

/// The header word that precedes the payload of every transaction.
///
/// ```text
/// 31      28 27            16 15        8 7      4 3      0
/// | version | transaction id | words     | type    | info   |
/// ```
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct TransactionHeader {
    pub id: u16,
    pub words: u8,
    pub kind: TransactionType,
    pub info: InfoCode,
}

impl TransactionHeader {
    pub fn new(id: u16, words: u8, kind: TransactionType, info: InfoCode) -> TransactionHeader {
        TransactionHeader {
            id: id & 0xfff,
            words,
            kind,
            info,
        }
    }

    pub fn to_word(&self) -> u32 {
        (PROTOCOL_VERSION << 28)
            | ((self.id as u32 & 0xfff) << 16)
            | ((self.words as u32) << 8)
            | ((self.kind as u32) << 4)
            | (self.info as u32)
    }

    pub fn from_word(word: u32) -> Result<TransactionHeader, ReadError> {
        let version = word >> 28;
        if version != PROTOCOL_VERSION {
            return Err(ReadError::UnsupportedVersion(version));
        }
        let kind_bits = ((word >> 4) & 0xf) as u8;
        let kind = TransactionType::from_bits(kind_bits)
            .ok_or(ReadError::UnknownTransactionType(kind_bits))?;
        let info_bits = (word & 0xf) as u8;
        let info = InfoCode::from_bits(info_bits).ok_or(ReadError::UnknownInfoCode(info_bits))?;
        Ok(TransactionHeader {
            id: ((word >> 16) & 0xfff) as u16,
            words: ((word >> 8) & 0xff) as u8,
            kind,
            info,
        })
    }

    /// Number of payload words following this header on the wire.
    pub fn payload_len(&self) -> usize {
        let words = self.words as usize;
        match self.info {
            InfoCode::Request => match self.kind {
                TransactionType::Read | TransactionType::NonIncrementingRead => 1,
                TransactionType::Write | TransactionType::NonIncrementingWrite => words + 1,
                TransactionType::RmwBits => 3,
                TransactionType::RmwSum => 2,
            },
            InfoCode::Success => match self.kind {
                TransactionType::Read | TransactionType::NonIncrementingRead => words,
                TransactionType::Write | TransactionType::NonIncrementingWrite => 0,
                TransactionType::RmwBits | TransactionType::RmwSum => 1,
            },
            // error responses carry no data
            _ => 0,
        }
    }

    /// Number of words of header plus payload.
    pub fn encoded_len(&self) -> usize {
        1 + self.payload_len()
    }
}

#[test]
fn transaction_header_layout() {
    let header = TransactionHeader::new(0x123, 4, TransactionType::Write, InfoCode::Request);
    assert_eq!(header.to_word(), 0x2123_041f);
    assert_eq!(TransactionHeader::from_word(0x2123_041f).unwrap(), header);
    assert_eq!(header.payload_len(), 5);
}

#[test]
fn payload_len_of_responses() {
    let read = TransactionHeader::new(1, 20, TransactionType::Read, InfoCode::Success);
    assert_eq!(read.payload_len(), 20);
    let rmw = TransactionHeader::new(1, 1, TransactionType::RmwBits, InfoCode::Success);
    assert_eq!(rmw.payload_len(), 1);
    let failed = TransactionHeader::new(1, 20, TransactionType::Read, InfoCode::BusTimeoutRead);
    assert_eq!(failed.payload_len(), 0);
}

#[test]
fn reject_foreign_header() {
    assert!(matches!(
        TransactionHeader::from_word(0x1000_010f),
        Err(ReadError::UnsupportedVersion(1))
    ));
    assert!(matches!(
        TransactionHeader::from_word(0x2000_019f),
        Err(ReadError::UnknownTransactionType(9))
    ));
}

/// Packet types, encoded in bits 3..0 of the packet header.
/// Only control packets carry transactions.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[repr(u8)]
pub enum PacketType {
    Control = 0x0,
    Status = 0x1,
    Resend = 0x2,
}

/// The header word that starts every packet.
///
/// ```text
/// 31      28 27    24 23          8 7          4 3      0
/// | version | rsvd   | packet id   | byte order | type   |
/// ```
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct PacketHeader {
    pub id: u16,
    pub kind: PacketType,
}

impl PacketHeader {
    const BYTE_ORDER_QUALIFIER: u32 = 0xf0;

    /// A control packet header. An id of 0 marks traffic outside of the reliability mechanism.
    pub fn control(id: u16) -> PacketHeader {
        PacketHeader {
            id,
            kind: PacketType::Control,
        }
    }

    pub fn to_word(&self) -> u32 {
        (PROTOCOL_VERSION << 28)
            | ((self.id as u32) << 8)
            | Self::BYTE_ORDER_QUALIFIER
            | (self.kind as u32)
    }

    pub fn from_word(word: u32) -> Result<PacketHeader, ReadError> {
        if word >> 28 != PROTOCOL_VERSION || word & 0xf0 != Self::BYTE_ORDER_QUALIFIER {
            return Err(ReadError::InvalidPacketHeader(word));
        }
        let kind = match (word & 0xf) as u8 {
            0x0 => PacketType::Control,
            0x1 => PacketType::Status,
            0x2 => PacketType::Resend,
            other => return Err(ReadError::UnsupportedPacketType(other)),
        };
        Ok(PacketHeader {
            id: ((word >> 8) & 0xffff) as u16,
            kind,
        })
    }
}

#[test]
fn packet_header_layout() {
    assert_eq!(PacketHeader::control(0).to_word(), 0x2000_00f0);
    assert_eq!(PacketHeader::control(0x1234).to_word(), 0x2012_34f0);
    assert_eq!(
        PacketHeader::from_word(0x2000_00f1).unwrap().kind,
        PacketType::Status
    );
}

/// Order of the bytes within each word of a packet.
///
/// Clients may send packets in either order; a target detects the order from the packet header
/// and replies in the same order.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub enum ByteOrder {
    #[default]
    Big,
    Little,
}

impl ByteOrder {
    /// Detects the byte order from the first four bytes of a packet.
    pub fn detect(bytes: [u8; 4]) -> Option<ByteOrder> {
        let is_header = |word: u32| word >> 28 == PROTOCOL_VERSION && word & 0xf0 == 0xf0;
        if is_header(u32::from_be_bytes(bytes)) {
            Some(ByteOrder::Big)
        } else if is_header(u32::from_le_bytes(bytes)) {
            Some(ByteOrder::Little)
        } else {
            None
        }
    }

    pub fn to_bytes(self, word: u32) -> [u8; 4] {
        match self {
            ByteOrder::Big => word.to_be_bytes(),
            ByteOrder::Little => word.to_le_bytes(),
        }
    }

    pub fn from_bytes(self, bytes: [u8; 4]) -> u32 {
        match self {
            ByteOrder::Big => u32::from_be_bytes(bytes),
            ByteOrder::Little => u32::from_le_bytes(bytes),
        }
    }
}

/// A single transaction as it appears on the wire: header word plus payload words.
///
/// Requests and responses share this representation; [`Request`] and [`Response`]
/// are the typed views.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Frame {
    pub header: TransactionHeader,
    pub payload: Box<[u32]>,
}

impl Frame {
    pub fn new(header: TransactionHeader, payload: Box<[u32]>) -> Frame {
        debug_assert_eq!(header.payload_len(), payload.len());
        Frame { header, payload }
    }

    /// Length of the frame in words.
    pub fn encoded_len(&self) -> usize {
        1 + self.payload.len()
    }
}

/// The bus operation requested by a transaction. Addresses are byte addresses.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Operation {
    Read { address: u32, words: u8 },
    ReadFifo { address: u32, words: u8 },
    /// `data` holds between 1 and [`MAX_TRANSACTION_WORDS`] words.
    Write { address: u32, data: Box<[u32]> },
    WriteFifo { address: u32, data: Box<[u32]> },
    RmwBits { address: u32, and_term: u32, or_term: u32 },
    RmwSum { address: u32, addend: u32 },
}

impl Operation {
    pub fn kind(&self) -> TransactionType {
        match self {
            Operation::Read { .. } => TransactionType::Read,
            Operation::ReadFifo { .. } => TransactionType::NonIncrementingRead,
            Operation::Write { .. } => TransactionType::Write,
            Operation::WriteFifo { .. } => TransactionType::NonIncrementingWrite,
            Operation::RmwBits { .. } => TransactionType::RmwBits,
            Operation::RmwSum { .. } => TransactionType::RmwSum,
        }
    }

    pub fn address(&self) -> u32 {
        match self {
            Operation::Read { address, .. }
            | Operation::ReadFifo { address, .. }
            | Operation::Write { address, .. }
            | Operation::WriteFifo { address, .. }
            | Operation::RmwBits { address, .. }
            | Operation::RmwSum { address, .. } => *address,
        }
    }

    /// The value of the header's `words` field.
    pub fn words(&self) -> u8 {
        match self {
            Operation::Read { words, .. } | Operation::ReadFifo { words, .. } => *words,
            Operation::Write { data, .. } | Operation::WriteFifo { data, .. } => data.len() as u8,
            Operation::RmwBits { .. } | Operation::RmwSum { .. } => 1,
        }
    }

    /// Number of words the success response to this operation will carry.
    pub fn response_words(&self) -> usize {
        match self {
            Operation::Read { words, .. } | Operation::ReadFifo { words, .. } => *words as usize,
            Operation::Write { .. } | Operation::WriteFifo { .. } => 0,
            Operation::RmwBits { .. } | Operation::RmwSum { .. } => 1,
        }
    }
}

/// A transaction sent from a client to a target.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Request {
    pub id: u16,
    pub op: Operation,
}

impl Request {
    pub fn new(id: u16, op: Operation) -> Request {
        Request { id: id & 0xfff, op }
    }

    pub fn header(&self) -> TransactionHeader {
        TransactionHeader::new(self.id, self.op.words(), self.op.kind(), InfoCode::Request)
    }

    pub fn to_frame(&self) -> Frame {
        let payload: Box<[u32]> = match &self.op {
            Operation::Read { address, .. } | Operation::ReadFifo { address, .. } => {
                Box::new([*address])
            }
            Operation::Write { address, data } | Operation::WriteFifo { address, data } => {
                std::iter::once(*address).chain(data.iter().copied()).collect()
            }
            Operation::RmwBits {
                address,
                and_term,
                or_term,
            } => Box::new([*address, *and_term, *or_term]),
            Operation::RmwSum { address, addend } => Box::new([*address, *addend]),
        };
        Frame::new(self.header(), payload)
    }
}

impl TryFrom<Frame> for Request {
    type Error = ReadError;

    fn try_from(frame: Frame) -> Result<Request, ReadError> {
        let header = frame.header;
        if header.info != InfoCode::Request {
            return Err(ReadError::InvalidFormat(format!(
                "Expected a request, got info code {:#x}",
                header.info as u8
            )));
        }
        let expected = header.payload_len();
        if frame.payload.len() != expected {
            return Err(ReadError::Truncated {
                expected,
                got: frame.payload.len(),
            });
        }
        let payload = frame.payload;
        let address = payload[0];
        let op = match header.kind {
            TransactionType::Read => Operation::Read {
                address,
                words: header.words,
            },
            TransactionType::NonIncrementingRead => Operation::ReadFifo {
                address,
                words: header.words,
            },
            TransactionType::Write => Operation::Write {
                address,
                data: payload[1..].into(),
            },
            TransactionType::NonIncrementingWrite => Operation::WriteFifo {
                address,
                data: payload[1..].into(),
            },
            TransactionType::RmwBits => Operation::RmwBits {
                address,
                and_term: payload[1],
                or_term: payload[2],
            },
            TransactionType::RmwSum => Operation::RmwSum {
                address,
                addend: payload[1],
            },
        };
        Ok(Request { id: header.id, op })
    }
}

/// A transaction sent from a target back to the client.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Response {
    pub id: u16,
    pub kind: TransactionType,
    pub words: u8,
    pub info: InfoCode,
    pub data: Box<[u32]>,
}

impl Response {
    /// A successful response to `request` carrying `data`.
    pub fn success(request: &Request, data: Box<[u32]>) -> Response {
        Response {
            id: request.id,
            kind: request.op.kind(),
            words: request.op.words(),
            info: InfoCode::Success,
            data,
        }
    }

    /// A failed response to `request`. Failed responses carry no data.
    pub fn error(request: &Request, info: InfoCode) -> Response {
        Response {
            id: request.id,
            kind: request.op.kind(),
            words: request.op.words(),
            info,
            data: Box::default(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.info == InfoCode::Success
    }

    pub fn header(&self) -> TransactionHeader {
        TransactionHeader::new(self.id, self.words, self.kind, self.info)
    }

    pub fn to_frame(&self) -> Frame {
        Frame::new(self.header(), self.data.clone())
    }
}

impl TryFrom<Frame> for Response {
    type Error = ReadError;

    fn try_from(frame: Frame) -> Result<Response, ReadError> {
        let header = frame.header;
        if header.info == InfoCode::Request {
            return Err(ReadError::InvalidFormat(
                "Expected a response, got a request".to_string(),
            ));
        }
        let expected = header.payload_len();
        if frame.payload.len() != expected {
            return Err(ReadError::Truncated {
                expected,
                got: frame.payload.len(),
            });
        }
        Ok(Response {
            id: header.id,
            kind: header.kind,
            words: header.words,
            info: header.info,
            data: frame.payload,
        })
    }
}

/// A packet header followed by any number of transactions.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Packet {
    pub header: PacketHeader,
    pub frames: Vec<Frame>,
}

impl Packet {
    pub fn new(header: PacketHeader, frames: Vec<Frame>) -> Packet {
        Packet { header, frames }
    }

    /// Length of the packet in bytes, excluding the length prefix.
    pub fn encoded_len(&self) -> usize {
        4 * (1 + self.frames.iter().map(Frame::encoded_len).sum::<usize>())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn request_frame_roundtrip_keeps_operation() {
        let request = Request::new(
            7,
            Operation::RmwBits {
                address: 0x10,
                and_term: 0xffff_0000,
                or_term: 0xbaba,
            },
        );
        let frame = request.to_frame();
        assert_eq!(frame.header.words, 1);
        assert_eq!(&*frame.payload, &[0x10, 0xffff_0000, 0xbaba]);
        assert_eq!(Request::try_from(frame).unwrap(), request);
    }

    #[test]
    fn write_request_payload_starts_with_address() {
        let request = Request::new(
            1,
            Operation::Write {
                address: 0x1000,
                data: vec![1, 2, 3].into_boxed_slice(),
            },
        );
        let frame = request.to_frame();
        assert_eq!(frame.header.words, 3);
        assert_eq!(&*frame.payload, &[0x1000, 1, 2, 3]);
    }

    #[test]
    fn response_rejects_request_frame() {
        let request = Request::new(1, Operation::Read { address: 0, words: 1 });
        assert!(Response::try_from(request.to_frame()).is_err());
    }

    #[test]
    fn error_response_has_no_data() {
        let request = Request::new(3, Operation::Read { address: 0, words: 4 });
        let response = Response::error(&request, InfoCode::BusTimeoutRead);
        let frame = response.to_frame();
        assert_eq!(frame.encoded_len(), 1);
        assert_eq!(Response::try_from(frame).unwrap(), response);
    }

    #[test]
    fn detect_byte_order() {
        assert_eq!(
            ByteOrder::detect([0x20, 0x00, 0x00, 0xf0]),
            Some(ByteOrder::Big)
        );
        assert_eq!(
            ByteOrder::detect([0xf0, 0x00, 0x00, 0x20]),
            Some(ByteOrder::Little)
        );
        assert_eq!(ByteOrder::detect([0xde, 0xad, 0xbe, 0xef]), None);
    }

    #[test]
    fn timeout_code_follows_direction() {
        assert_eq!(TransactionType::Read.bus_timeout(), InfoCode::BusTimeoutRead);
        assert_eq!(
            TransactionType::RmwBits.bus_timeout(),
            InfoCode::BusTimeoutWrite
        );
    }
}
