//! # IPbus Client
//!
//! A Rust client library for queued register and memory access to FPGA hardware through an
//! IPbus server or bridge.
//!
//! ## Overview
//!
//! Application code names registers and memories through an
//! [`AddressMap`](ipbus_protocol::address::AddressMap) and queues operations on a [`Connection`].
//! Every operation immediately returns a [`ValHandle`] that stays pending until the next
//! [`Connection::flush`], which sends the whole queue in order and resolves the handles from the
//! responses.
//!
//! - **Validation**: unknown nodes, out-of-range block lengths and invalid masks are rejected
//!   when the operation is queued, before any I/O happens.
//! - **Masked writes**: writes to masked nodes only modify the bits of the node's mask. The
//!   read-modify-write is performed by the target.
//! - **Large blocks**: block transfers longer than a single transaction are split transparently.
//!
//! For detailed protocol information, see the [`ipbus_protocol`] crate.
//!
//! ## Basic Usage
//!
//! ```ignore
//! use ipbus_client::Connection;
//!
//! let map = "REG 0x0 scalar\nMEM 0x1000 block 512".parse()?;
//! let mut connection = Connection::connect("127.0.0.1:60002", map)?;
//!
//! connection.write("REG", 0xabab_abab)?;
//! let reg = connection.read("REG")?;
//! let mem = connection.read_block("MEM", 20)?;
//! assert!(reg.is_pending());
//!
//! connection.flush()?;
//! println!("REG = {:#010x}", reg.value()?);
//! println!("MEM = {:?}", mem.value()?);
//! ```
//!
//! ## Failures
//!
//! A flush either resolves every handle of its batch or none of them. When the transport fails,
//! every handle of the batch fails with the same shared cause, which is also returned by
//! `flush`. A bus timeout reported by the target counts as such a failure, since the target gives
//! no guarantee about the transactions after it. Other errors reported by the target for a single
//! transaction only fail that transaction's handle.
//!
//! ## Related Crates
//!
//! - [`ipbus_server`](https://docs.rs/ipbus-server/) - Server and bridge implementation
//! - [`ipbus_protocol`](https://docs.rs/ipbus-protocol/) - Protocol encoding/decoding
use std::{
    io::{Read, Write},
    net::{TcpStream, ToSocketAddrs},
    sync::{Arc, OnceLock},
    time::Duration,
};

use ipbus_protocol::{
    ByteOrder, MAX_TRANSACTION_WORDS, Operation, Packet, PacketHeader, PacketType, Request,
    Response,
    address::{Access, AccessKind, AddressMap, Node},
    error::AccessError,
};
use log::{debug, trace};

mod error;
pub use error::Error;

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_MAX_PACKET_SIZE: usize = 64 * 1024;

type Slot<T> = Arc<OnceLock<Result<T, Arc<Error>>>>;

/// The state of a [`ValHandle`].
#[derive(Debug)]
pub enum HandleState<'a, T> {
    /// The owning transaction has not been flushed yet.
    Pending,
    Valid(&'a T),
    Failed(&'a Arc<Error>),
}

/// Deferred result of a queued operation.
///
/// A handle is pending until the flush that includes its operation completes; it then holds
/// either the value or the cause of the failure. Clones observe the same result.
#[derive(Clone, Debug)]
pub struct ValHandle<T> {
    slot: Slot<T>,
}

impl<T> ValHandle<T> {
    fn new() -> (ValHandle<T>, Slot<T>) {
        let slot = Arc::new(OnceLock::new());
        (ValHandle { slot: slot.clone() }, slot)
    }

    pub fn state(&self) -> HandleState<'_, T> {
        match self.slot.get() {
            None => HandleState::Pending,
            Some(Ok(value)) => HandleState::Valid(value),
            Some(Err(cause)) => HandleState::Failed(cause),
        }
    }

    pub fn is_pending(&self) -> bool {
        self.slot.get().is_none()
    }

    pub fn is_valid(&self) -> bool {
        matches!(self.slot.get(), Some(Ok(_)))
    }

    /// The resolved value.
    ///
    /// # Errors
    ///
    /// [`Error::ResultNotReady`] while the handle is pending, the recorded cause if it failed.
    pub fn value(&self) -> Result<&T, Error> {
        match self.state() {
            HandleState::Pending => Err(Error::ResultNotReady),
            HandleState::Valid(value) => Ok(value),
            HandleState::Failed(cause) => Err(Error::clone(cause)),
        }
    }

    /// The shared cause of a failed handle.
    pub fn cause(&self) -> Option<&Arc<Error>> {
        match self.state() {
            HandleState::Failed(cause) => Some(cause),
            _ => None,
        }
    }
}

/// How the responses of a queued operation resolve its handle.
enum Resolver {
    Word { slot: Slot<u32>, mask: u32 },
    Block(Slot<Vec<u32>>),
    Done(Slot<()>),
}

fn first_failure(responses: &[Response]) -> Option<Arc<Error>> {
    responses
        .iter()
        .find(|response| !response.is_success())
        .map(|response| Arc::new(Error::from_info(response.info)))
}

impl Resolver {
    fn resolve(self, responses: &[Response]) {
        let failure = first_failure(responses);
        // a slot is only ever set once, by the flush that owns it
        match self {
            Resolver::Word { slot, mask } => {
                let result = match failure {
                    Some(cause) => Err(cause),
                    None => Ok(responses
                        .first()
                        .and_then(|response| response.data.first())
                        .map_or(0, |word| word & mask)),
                };
                let _ = slot.set(result);
            }
            Resolver::Block(slot) => {
                let result = match failure {
                    Some(cause) => Err(cause),
                    None => Ok(responses
                        .iter()
                        .flat_map(|response| response.data.iter().copied())
                        .collect()),
                };
                let _ = slot.set(result);
            }
            Resolver::Done(slot) => {
                let _ = slot.set(failure.map_or(Ok(()), Err));
            }
        }
    }

    fn fail(self, cause: Arc<Error>) {
        match self {
            Resolver::Word { slot, .. } => {
                let _ = slot.set(Err(cause));
            }
            Resolver::Block(slot) => {
                let _ = slot.set(Err(cause));
            }
            Resolver::Done(slot) => {
                let _ = slot.set(Err(cause));
            }
        }
    }
}

struct Queued {
    ops: Vec<Operation>,
    resolver: Resolver,
}

fn request_bytes(op: &Operation) -> usize {
    let payload = match op {
        Operation::Read { .. } | Operation::ReadFifo { .. } => 1,
        Operation::Write { data, .. } | Operation::WriteFifo { data, .. } => 1 + data.len(),
        Operation::RmwBits { .. } => 3,
        Operation::RmwSum { .. } => 2,
    };
    4 * (1 + payload)
}

fn response_bytes(op: &Operation) -> usize {
    4 * (1 + op.response_words())
}

/// A queue of operations on one IPbus target.
///
/// Operations are validated against the address map and queued; [`Connection::flush`] sends the
/// queue and resolves the handles. The connection owns its queue, a flush borrows it exclusively.
pub struct Connection<S: Read + Write = TcpStream> {
    stream: S,
    map: AddressMap,
    queue: Vec<Queued>,
    next_id: u16,
    order: ByteOrder,
    max_packet_size: usize,
}

impl Connection<TcpStream> {
    /// Connects to a server using the default configuration.
    pub fn connect(addr: impl ToSocketAddrs, map: AddressMap) -> Result<Connection, Error> {
        ConnectionBuilder::default().connect(addr, map)
    }

    pub fn builder() -> ConnectionBuilder {
        ConnectionBuilder::default()
    }
}

impl<S: Read + Write> Connection<S> {
    pub fn address_map(&self) -> &AddressMap {
        &self.map
    }

    pub fn node(&self, name: &str) -> Result<&Node, Error> {
        Ok(self.map.resolve(name)?)
    }

    /// Number of queued operations that have not been flushed yet.
    pub fn pending(&self) -> usize {
        self.queue.len()
    }

    /// Queues a read of a single word. Reads of masked nodes yield the masked bits only.
    pub fn read(&mut self, name: &str) -> Result<ValHandle<u32>, Error> {
        let node = self.map.resolve(name)?;
        node.validate_access(Access::Read, 1)?;
        let (address, mask) = (node.address(), node.mask());
        let (handle, slot) = ValHandle::new();
        self.enqueue(
            vec![Operation::Read { address, words: 1 }],
            Resolver::Word { slot, mask },
        );
        Ok(handle)
    }

    /// Queues a write of a single word. Writes to masked nodes only modify the bits of the node's
    /// mask.
    pub fn write(&mut self, name: &str, value: u32) -> Result<ValHandle<()>, Error> {
        let node = self.map.resolve(name)?;
        node.validate_access(Access::Write, 1)?;
        let address = node.address();
        let op = match node.kind() {
            AccessKind::Masked => Self::masked_write(address, value, node.mask()),
            AccessKind::Scalar | AccessKind::Block { .. } => Operation::Write {
                address,
                data: Box::new([value]),
            },
        };
        let (handle, slot) = ValHandle::new();
        self.enqueue(vec![op], Resolver::Done(slot));
        Ok(handle)
    }

    /// Queues a write that only modifies the bits selected by `mask`.
    ///
    /// # Errors
    ///
    /// `MaskViolation` if `mask` selects bits outside of the node's mask.
    pub fn write_masked(
        &mut self,
        name: &str,
        value: u32,
        mask: u32,
    ) -> Result<ValHandle<()>, Error> {
        let node = self.map.resolve(name)?;
        node.validate_access(Access::Write, 1)?;
        node.validate_mask(mask)?;
        let op = Self::masked_write(node.address(), value, mask);
        let (handle, slot) = ValHandle::new();
        self.enqueue(vec![op], Resolver::Done(slot));
        Ok(handle)
    }

    /// Queues an atomic `register += addend`. The handle resolves to the previous value.
    pub fn add(&mut self, name: &str, addend: u32) -> Result<ValHandle<u32>, Error> {
        let node = self.map.resolve(name)?;
        node.validate_access(Access::Write, 1)?;
        // a carry would leak into the bits outside of a partial mask
        node.validate_mask(Node::FULL_MASK)?;
        let address = node.address();
        let (handle, slot) = ValHandle::new();
        self.enqueue(
            vec![Operation::RmwSum { address, addend }],
            Resolver::Word {
                slot,
                mask: Node::FULL_MASK,
            },
        );
        Ok(handle)
    }

    /// Queues a read of `length` consecutive words starting at the node's address.
    pub fn read_block(&mut self, name: &str, length: usize) -> Result<ValHandle<Vec<u32>>, Error> {
        let node = self.map.resolve(name)?;
        node.validate_access(Access::BlockRead, length)?;
        let ops = (0..length)
            .step_by(MAX_TRANSACTION_WORDS)
            .map(|offset| {
                Ok(Operation::Read {
                    address: Self::word_address(node, offset)?,
                    words: (length - offset).min(MAX_TRANSACTION_WORDS) as u8,
                })
            })
            .collect::<Result<_, Error>>()?;
        let (handle, slot) = ValHandle::new();
        self.enqueue(ops, Resolver::Block(slot));
        Ok(handle)
    }

    /// Queues a write of `words` to consecutive addresses starting at the node's address.
    pub fn write_block(&mut self, name: &str, words: &[u32]) -> Result<ValHandle<()>, Error> {
        let node = self.map.resolve(name)?;
        node.validate_access(Access::BlockWrite, words.len())?;
        let ops = words
            .chunks(MAX_TRANSACTION_WORDS)
            .enumerate()
            .map(|(index, chunk)| {
                Ok(Operation::Write {
                    address: Self::word_address(node, index * MAX_TRANSACTION_WORDS)?,
                    data: chunk.into(),
                })
            })
            .collect::<Result<_, Error>>()?;
        let (handle, slot) = ValHandle::new();
        self.enqueue(ops, Resolver::Done(slot));
        Ok(handle)
    }

    /// Queues `length` reads of the node's first word, e.g. draining a hardware FIFO.
    pub fn read_fifo(&mut self, name: &str, length: usize) -> Result<ValHandle<Vec<u32>>, Error> {
        let node = self.map.resolve(name)?;
        node.validate_access(Access::FifoRead, length)?;
        node.validate_mask(Node::FULL_MASK)?;
        let address = node.address();
        let ops = (0..length)
            .step_by(MAX_TRANSACTION_WORDS)
            .map(|offset| Operation::ReadFifo {
                address,
                words: (length - offset).min(MAX_TRANSACTION_WORDS) as u8,
            })
            .collect();
        let (handle, slot) = ValHandle::new();
        self.enqueue(ops, Resolver::Block(slot));
        Ok(handle)
    }

    /// Queues one write of each of `words` to the node's first word, in order.
    pub fn write_fifo(&mut self, name: &str, words: &[u32]) -> Result<ValHandle<()>, Error> {
        let node = self.map.resolve(name)?;
        node.validate_access(Access::FifoWrite, words.len())?;
        node.validate_mask(Node::FULL_MASK)?;
        let address = node.address();
        let ops = words
            .chunks(MAX_TRANSACTION_WORDS)
            .map(|chunk| Operation::WriteFifo {
                address,
                data: chunk.into(),
            })
            .collect();
        let (handle, slot) = ValHandle::new();
        self.enqueue(ops, Resolver::Done(slot));
        Ok(handle)
    }

    /// Sends every queued operation and resolves their handles.
    ///
    /// The queue is empty afterwards, whatever the outcome. Flushing an empty queue does nothing.
    ///
    /// # Errors
    ///
    /// Returns the cause if the batch could not be completed. Every handle of the batch then
    /// holds the same cause.
    pub fn flush(&mut self) -> Result<(), Error> {
        if self.queue.is_empty() {
            return Ok(());
        }
        let queue = std::mem::take(&mut self.queue);
        let mut requests = Vec::new();
        for queued in &queue {
            for op in &queued.ops {
                requests.push(Request::new(self.next_id, op.clone()));
                self.next_id = (self.next_id + 1) & 0xfff;
            }
        }
        debug!(
            "Flushing {} operations as {} transactions",
            queue.len(),
            requests.len()
        );

        match self.transfer(&requests) {
            Ok(responses) => {
                let mut rest = responses.as_slice();
                for queued in queue {
                    let (own, tail) = rest.split_at(queued.ops.len());
                    queued.resolver.resolve(own);
                    rest = tail;
                }
                Ok(())
            }
            Err(err) => {
                debug!("Flush failed: {}", err);
                let cause = Arc::new(err);
                for queued in queue {
                    queued.resolver.fail(cause.clone());
                }
                Err(Error::clone(&cause))
            }
        }
    }

    fn word_address(node: &Node, offset: usize) -> Result<u32, Error> {
        node.word_address(offset).ok_or_else(|| {
            Error::Access(AccessError::AddressRange {
                node: node.name().to_string(),
                length: offset + 1,
                capacity: node.capacity(),
            })
        })
    }

    fn masked_write(address: u32, value: u32, mask: u32) -> Operation {
        Operation::RmwBits {
            address,
            and_term: !mask,
            or_term: value & mask,
        }
    }

    fn enqueue(&mut self, ops: Vec<Operation>, resolver: Resolver) {
        trace!("Queued {:?}", ops);
        self.queue.push(Queued { ops, resolver });
    }

    /// Splits the requests into packets that fit, in both directions, into the maximum packet size.
    fn packets<'a>(&self, requests: &'a [Request]) -> Vec<&'a [Request]> {
        let mut packets = Vec::new();
        let mut start = 0;
        let (mut out, mut back) = (4, 4);
        for (index, request) in requests.iter().enumerate() {
            let (req, resp) = (request_bytes(&request.op), response_bytes(&request.op));
            if index > start
                && (out + req > self.max_packet_size || back + resp > self.max_packet_size)
            {
                packets.push(&requests[start..index]);
                start = index;
                (out, back) = (4, 4);
            }
            out += req;
            back += resp;
        }
        packets.push(&requests[start..]);
        packets
    }

    fn transfer(&mut self, requests: &[Request]) -> Result<Vec<Response>, Error> {
        let mut responses = Vec::with_capacity(requests.len());
        for batch in self.packets(requests) {
            let packet = Packet::new(
                PacketHeader::control(0),
                batch.iter().map(Request::to_frame).collect(),
            );
            trace!("Sending packet with {} transactions", batch.len());
            packet.write_to(&mut self.stream, self.order)?;
            let (reply, _) = Packet::from_reader(&mut self.stream, self.max_packet_size)?;
            if reply.header.kind != PacketType::Control {
                return Err(Error::mismatch(format!(
                    "Expected a control packet, got {:?}",
                    reply.header.kind
                )));
            }
            if reply.frames.len() != batch.len() {
                return Err(Error::mismatch(format!(
                    "Sent {} transactions, got {} responses",
                    batch.len(),
                    reply.frames.len()
                )));
            }
            for (request, frame) in batch.iter().zip(reply.frames) {
                let response = Response::try_from(frame)?;
                if response.id != request.id
                    || response.kind != request.op.kind()
                    || response.words != request.op.words()
                {
                    return Err(Error::mismatch(format!(
                        "Response {:?} does not match request {:?}",
                        response.header(),
                        request.header()
                    )));
                }
                if response.info.is_timeout() {
                    // a target that timed out gives no guarantee about the rest of the batch
                    return Err(Error::Timeout);
                }
                responses.push(response);
            }
        }
        Ok(responses)
    }
}

/// Configuration of a [`Connection`].
#[derive(Debug, Clone)]
pub struct ConnectionBuilder {
    timeout: Duration,
    byte_order: ByteOrder,
    max_packet_size: usize,
}

impl Default for ConnectionBuilder {
    fn default() -> Self {
        ConnectionBuilder {
            timeout: DEFAULT_TIMEOUT,
            byte_order: ByteOrder::Big,
            max_packet_size: DEFAULT_MAX_PACKET_SIZE,
        }
    }
}

impl ConnectionBuilder {
    /// How long a flush waits for the reply before failing with [`Error::Timeout`].
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// The byte order of outgoing packets.
    pub fn byte_order(mut self, order: ByteOrder) -> Self {
        self.byte_order = order;
        self
    }

    /// The largest packet sent or accepted, in bytes.
    pub fn max_packet_size(mut self, size: usize) -> Self {
        self.max_packet_size = size;
        self
    }

    pub fn connect(self, addr: impl ToSocketAddrs, map: AddressMap) -> Result<Connection, Error> {
        let stream = TcpStream::connect(addr)?;
        stream.set_read_timeout(Some(self.timeout))?;
        stream.set_write_timeout(Some(self.timeout))?;
        stream.set_nodelay(true)?;
        debug!("Connected to {:?}", stream.peer_addr());
        Ok(self.build(stream, map))
    }

    /// Builds a connection over an already established stream.
    pub fn build<S: Read + Write>(self, stream: S, map: AddressMap) -> Connection<S> {
        Connection {
            stream,
            map,
            queue: Vec::new(),
            next_id: 0,
            order: self.byte_order,
            max_packet_size: self.max_packet_size,
        }
    }
}

#[cfg(test)]
mod test {
    use std::{
        collections::{HashMap, VecDeque},
        io,
    };

    use ipbus_protocol::{InfoCode, codec::LENGTH_PREFIX_BYTES, error::AccessError};

    use super::*;

    const MAP: &str = "
        REG             0x00000000  scalar
        REG_LOWER_MASK  0x00000000  masked  0x0000ffff
        BAD             0xf0000000  scalar
        SLOW            0xe0000000  scalar
        MEM             0x00001000  block   512
        TOP             0xffffff00  block   64
    ";

    /// Executes packets against a word memory as soon as they are written.
    #[derive(Default)]
    struct Emulator {
        memory: HashMap<u32, u32>,
        input: Vec<u8>,
        output: VecDeque<u8>,
        fifo: VecDeque<u32>,
        packets: usize,
        mute: bool,
    }

    impl Emulator {
        fn word(&mut self, address: u32) -> u32 {
            *self.memory.entry(address).or_insert(0xefef_efef)
        }

        fn execute(&mut self, request: &Request) -> Response {
            match request.op.address() {
                0xf000_0000..0xf000_1000 => {
                    return Response::error(request, request.op.kind().bus_error());
                }
                0xe000_0000..0xe000_1000 => {
                    return Response::error(request, request.op.kind().bus_timeout());
                }
                _ => {}
            }
            let data: Box<[u32]> = match &request.op {
                Operation::Read { address, words } => {
                    (0..*words as u32).map(|i| self.word(address + 4 * i)).collect()
                }
                Operation::Write { address, data } => {
                    for (i, value) in data.iter().enumerate() {
                        self.memory.insert(address + 4 * i as u32, *value);
                    }
                    Box::default()
                }
                Operation::RmwBits {
                    address,
                    and_term,
                    or_term,
                } => {
                    let previous = self.word(*address);
                    self.memory
                        .insert(*address, (previous & and_term) | or_term);
                    Box::new([previous])
                }
                Operation::RmwSum { address, addend } => {
                    let previous = self.word(*address);
                    self.memory.insert(*address, previous.wrapping_add(*addend));
                    Box::new([previous])
                }
                Operation::ReadFifo { words, .. } => (0..*words)
                    .map(|_| self.fifo.pop_front().unwrap_or(0xefef_efef))
                    .collect(),
                Operation::WriteFifo { data, .. } => {
                    self.fifo.extend(data.iter());
                    Box::default()
                }
            };
            Response::success(request, data)
        }
    }

    impl Write for Emulator {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.input.extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            let (packet, order) = Packet::decode(&self.input[LENGTH_PREFIX_BYTES..]).unwrap();
            self.input.clear();
            self.packets += 1;
            if self.mute {
                return Ok(());
            }
            let frames = packet
                .frames
                .into_iter()
                .map(|frame| self.execute(&Request::try_from(frame).unwrap()).to_frame())
                .collect();
            let mut out = Vec::new();
            Packet::new(packet.header, frames)
                .write_to(&mut out, order)
                .unwrap();
            self.output.extend(out);
            Ok(())
        }
    }

    impl Read for Emulator {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            self.output.read(buf)
        }
    }

    fn connection() -> Connection<Emulator> {
        ConnectionBuilder::default().build(Emulator::default(), MAP.parse().unwrap())
    }

    #[test]
    fn handles_resolve_on_flush() {
        let mut connection = connection();
        let write = connection.write("REG", 0xabab_abab).unwrap();
        let read = connection.read("REG").unwrap();
        assert!(write.is_pending());
        assert!(matches!(read.value(), Err(Error::ResultNotReady)));
        assert_eq!(connection.pending(), 2);

        connection.flush().unwrap();
        assert_eq!(connection.pending(), 0);
        assert!(write.is_valid());
        assert_eq!(read.value().unwrap(), &0xabab_abab);
    }

    #[test]
    fn empty_flush_does_nothing() {
        let mut connection = connection();
        connection.flush().unwrap();
        assert_eq!(connection.stream.packets, 0);
    }

    #[test]
    fn masked_write_keeps_other_bits() {
        let mut connection = connection();
        connection.write("REG", 0x1234_5678).unwrap();
        connection.write("REG_LOWER_MASK", 0xbaba).unwrap();
        let masked = connection.read("REG_LOWER_MASK").unwrap();
        let full = connection.read("REG").unwrap();
        connection.flush().unwrap();
        assert_eq!(masked.value().unwrap(), &0xbaba);
        assert_eq!(full.value().unwrap(), &0x1234_baba);
    }

    #[test]
    fn write_masked_checks_mask() {
        let mut connection = connection();
        assert!(matches!(
            connection.write_masked("REG_LOWER_MASK", 0, 0x0001_0000),
            Err(Error::Access(AccessError::MaskViolation { .. }))
        ));
        assert!(matches!(
            connection.add("REG_LOWER_MASK", 1),
            Err(Error::Access(AccessError::MaskViolation { .. }))
        ));
        assert_eq!(connection.pending(), 0);
    }

    #[test]
    fn validation_happens_before_queueing() {
        let mut connection = connection();
        assert!(matches!(
            connection.read("NOPE"),
            Err(Error::Access(AccessError::UnknownNode(_)))
        ));
        assert!(matches!(
            connection.read_block("MEM", 513),
            Err(Error::Access(AccessError::AddressRange { .. }))
        ));
        assert!(matches!(
            connection.write_block("REG", &[1, 2]),
            Err(Error::Access(AccessError::AddressRange { .. }))
        ));
        assert_eq!(connection.pending(), 0);
    }

    #[test]
    fn long_blocks_are_split() {
        let mut connection = connection();
        let words: Vec<u32> = (0..300).collect();
        connection.write_block("MEM", &words).unwrap();
        let read = connection.read_block("MEM", 300).unwrap();
        connection.flush().unwrap();
        assert_eq!(read.value().unwrap(), &words);
        assert_eq!(connection.stream.memory[&(0x1000 + 4 * 299)], 299);
    }

    #[test]
    fn packets_respect_size_limit() {
        let mut connection = ConnectionBuilder::default()
            .max_packet_size(32)
            .build(Emulator::default(), MAP.parse().unwrap());
        let handles: Vec<_> = (0..6).map(|_| connection.read("REG").unwrap()).collect();
        connection.flush().unwrap();
        assert!(connection.stream.packets > 1);
        assert!(handles.iter().all(ValHandle::is_valid));
    }

    #[test]
    fn add_returns_previous_value() {
        let mut connection = connection();
        connection.write("REG", 41).unwrap();
        let previous = connection.add("REG", 1).unwrap();
        let read = connection.read("REG").unwrap();
        connection.flush().unwrap();
        assert_eq!(previous.value().unwrap(), &41);
        assert_eq!(read.value().unwrap(), &42);
    }

    #[test]
    fn bus_error_fails_single_handle() {
        let mut connection = connection();
        let bad = connection.read("BAD").unwrap();
        let good = connection.read("REG").unwrap();
        connection.flush().unwrap();
        assert!(matches!(
            bad.value(),
            Err(Error::Bus(InfoCode::BusErrorRead))
        ));
        assert!(good.is_valid());
    }

    #[test]
    fn closed_stream_fails_whole_batch() {
        let mut connection = ConnectionBuilder::default().build(
            Emulator {
                mute: true,
                ..Default::default()
            },
            MAP.parse().unwrap(),
        );
        let first = connection.write("REG", 1).unwrap();
        let second = connection.read("REG").unwrap();
        assert!(matches!(connection.flush(), Err(Error::ChannelClosed)));
        assert_eq!(connection.pending(), 0);
        let (a, b) = (first.cause().unwrap(), second.cause().unwrap());
        assert!(Arc::ptr_eq(a, b));
        assert!(matches!(**a, Error::ChannelClosed));
    }

    #[test]
    fn timeout_fails_whole_batch() {
        let mut connection = connection();
        let before = connection.write("REG", 1).unwrap();
        let slow = connection.read("SLOW").unwrap();
        let after = connection.read("REG").unwrap();
        assert!(matches!(connection.flush(), Err(Error::Timeout)));
        let cause = slow.cause().unwrap();
        assert!(matches!(**cause, Error::Timeout));
        assert!(Arc::ptr_eq(cause, before.cause().unwrap()));
        assert!(Arc::ptr_eq(cause, after.cause().unwrap()));
        assert!(!before.is_valid() && !after.is_valid());
    }

    #[test]
    fn fifo_accesses_repeat_first_word() {
        let mut connection = connection();
        let words: Vec<u32> = (0..300).collect();
        connection.write_fifo("REG", &words).unwrap();
        let read = connection.read_fifo("REG", 300).unwrap();
        assert_eq!(connection.pending(), 2);
        connection.flush().unwrap();
        assert_eq!(read.value().unwrap(), &words);
        // 300 words take two transactions in each direction
        assert_eq!(connection.next_id, 4);
    }

    #[test]
    fn fifo_accesses_are_validated() {
        let mut connection = connection();
        assert!(matches!(
            connection.read_fifo("NOPE", 1),
            Err(Error::Access(AccessError::UnknownNode(_)))
        ));
        assert!(matches!(
            connection.write_fifo("REG", &[]),
            Err(Error::Access(AccessError::AddressRange { .. }))
        ));
        assert!(matches!(
            connection.read_fifo("REG_LOWER_MASK", 2),
            Err(Error::Access(AccessError::MaskViolation { .. }))
        ));
        assert_eq!(connection.pending(), 0);
    }

    #[test]
    fn blocks_reach_end_of_address_space() {
        let mut connection = connection();
        let words: Vec<u32> = (0..64).collect();
        connection.write_block("TOP", &words).unwrap();
        let read = connection.read_block("TOP", 64).unwrap();
        connection.flush().unwrap();
        assert_eq!(read.value().unwrap(), &words);
        assert_eq!(connection.stream.memory[&0xffff_fffc], 63);
        assert!(matches!(
            connection.read_block("TOP", 65),
            Err(Error::Access(AccessError::AddressRange { .. }))
        ));
    }

    #[test]
    fn info_codes_map_to_errors() {
        assert!(matches!(
            Error::from_info(InfoCode::BusTimeoutWrite),
            Error::Timeout
        ));
        assert!(matches!(
            Error::from_info(InfoCode::BadHeader),
            Error::FrameCorruption
        ));
    }
}
