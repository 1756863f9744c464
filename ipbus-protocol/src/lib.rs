//! # IPbus Protocol Library
//!
//! This crate provides a Rust implementation of the transaction layer of the
//! [IPbus](https://ipbus.web.cern.ch/) 2.0 protocol, used to read and write registers and block
//! memories of FPGA-based trigger and data-acquisition hardware.
//!
//! ## Overview
//!
//! IPbus assumes a virtual bus with 32-bit word data transfer. A client sends a packet that holds
//! any number of transactions and the target replies with one response per transaction, in order.
//! This library allows you to:
//!
//! - Serialize and deserialize packets and transactions
//! - Frame transactions on raw byte-stream links (pipes, serial devices) with resynchronisation
//! - Describe the named registers and memories of a device with an [`address::AddressMap`]
//!
//! ## Protocol Features
//!
//! - **Protocol Version**: IPbus 2.0, control packets only
//! - **Transaction Types**:
//!   - `Read` / `NonIncrementingRead`: read up to 255 words
//!   - `Write` / `NonIncrementingWrite`: write up to 255 words
//!   - `RmwBits`: `register := (register & and_term) | or_term`
//!   - `RmwSum`: `register := register + addend`
//!
//! ## Basic Usage
//!
//! ### Writing a Packet
//!
//! ```
//! use ipbus_protocol::{ByteOrder, Operation, Packet, PacketHeader, Request};
//!
//! let read = Request::new(1, Operation::Read { address: 0x1000, words: 1 });
//! let packet = Packet::new(PacketHeader::control(0), vec![read.to_frame()]);
//! let mut buffer = Vec::new();
//! packet.write_to(&mut buffer, ByteOrder::Big).expect("Writing to vector shouldn't fail");
//! assert_eq!(
//!     buffer,
//!     b"\x00\x00\x00\x0c\x20\x00\x00\xf0\x20\x01\x01\x0f\x00\x00\x10\x00"
//! );
//! ```
//!
//! ### Reading a Packet
//!
//! ```
//! use ipbus_protocol::{ByteOrder, Packet, PacketType};
//! use std::io::Cursor;
//!
//! let data = b"\x00\x00\x00\x04\x20\x00\x00\xf0";
//! let mut reader = Cursor::new(data);
//! let (packet, order) = Packet::from_reader(&mut reader, 1024).expect("Packet should parse");
//! assert_eq!(order, ByteOrder::Big);
//! assert_eq!(packet.header.kind, PacketType::Control);
//! assert!(packet.frames.is_empty());
//! ```
//!
//! ## Message Format
//!
//! - **Packet header**: `0x2 << 28 | packet id << 8 | 0xf << 4 | packet type`
//! - **Transaction header**: `0x2 << 28 | id << 16 | words << 8 | type << 4 | info code`
//! - **Stream transports** precede each packet with its length in bytes (big-endian `u32`)
//! - **Link frames** start with the `0xBC` sentinel, see [`link`]
//!
//! ## Error Handling
//!
//! This library uses the [`error::ReadError`] type for protocol parsing errors,
//! [`error::AccessError`] for accesses that violate the address map and
//! [`error::MapError`] for invalid address map descriptions.
//!
//! ## Thread Safety
//!
//! The types in this library are thread-safe and can be safely shared across threads.
//! However, I/O operations (reading/writing) are not synchronized and require external coordination.

pub mod protocol;
pub use protocol::*;
pub mod address;
pub mod codec;
pub mod error;
pub mod link;
#[cfg(feature = "tokio")]
pub mod tokio_codec;
