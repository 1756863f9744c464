//! # IPbus Server Library
//!
//! This crate provides the building blocks of a software IPbus endpoint: a TCP server that
//! speaks IPbus to remote clients and a bridge that carries the transactions over a byte-stream
//! link to FPGA hardware.
//!
//! ## Architecture
//!
//! The crate is built around two traits:
//!
//! - **[`BusTarget`]**: the interface that backends implement to perform single bus accesses
//!   (for example the in-memory [`memory::MemoryTarget`] or a memory-mapped device)
//! - **[`Dispatch`]**: executes a batch of requests and returns one response per request, in
//!   order. Every `BusTarget` is a `Dispatch`; the [`forward::Forwarder`] dispatches over a
//!   pair of byte channels instead.
//!
//! A complete bridge chains the following stages:
//!
//! ```text
//! client --TCP--> Server<Forwarder> --request channel--> SerialAdapter --link--> LinkResponder
//!        <-------                   <--response channel--               <------
//! ```
//!
//! 1. [`server::Server`] accepts clients and dispatches every packet as one batch
//! 2. [`forward::Forwarder`] writes each request as a link frame to the request channel and
//!    waits for the matching frame on the response channel
//! 3. [`serial::SerialAdapter`] moves frames between the channels and the hardware link
//! 4. [`responder::LinkResponder`] executes frames against a [`BusTarget`] at the hardware end
//!
//! [`local::spawn_local_bridge`] runs all stages in one process, joined by in-process
//! [`channel::byte_channel`]s.
//!
//! ## Basic Usage
//!
//! ```ignore
//! use ipbus_server::{memory::MemoryTarget, server::Builder};
//!
//! let server = Builder::new().build(MemoryTarget::new(0x0, 2048));
//! server.listen("127.0.0.1:60002").await?;
//! ```
//!
//! ## Error Handling
//!
//! Failures of single accesses are reported to the client through the info code of the
//! response. A bus timeout aborts the rest of a forwarded batch, and every transaction of that
//! batch then reports the timeout. A closed bridge channel is fatal: the dispatch fails with
//! [`error::DispatchError::ChannelClosed`], the server drops its clients and returns the error.
//!
//! ## Logging
//!
//! This crate uses the `log` crate for diagnostics: connections at `info`, transactions at
//! `debug` and payloads at `trace`.
use std::{future::Future, sync::Arc};

use ipbus_protocol::{Operation, Request, Response};

pub mod channel;
pub mod error;
pub mod forward;
pub mod local;
pub mod memory;
pub mod responder;
pub mod serial;
pub mod server;

use error::{BusError, DispatchError};

/// Trait that backends implement to provide bus access.
///
/// Addresses are byte addresses of 32-bit words. Only [`BusTarget::read`] and
/// [`BusTarget::write`] are required; the remaining accesses are composed from them unless a
/// backend can do better, for example to make read-modify-write atomic.
pub trait BusTarget {
    fn read(&self, address: u32) -> Result<u32, BusError>;

    fn write(&self, address: u32, value: u32) -> Result<(), BusError>;

    /// Reads `words` consecutive words starting at `address`.
    fn read_block(&self, address: u32, words: usize) -> Result<Box<[u32]>, BusError> {
        (0..words as u32)
            .map(|i| self.read(address.wrapping_add(4 * i)))
            .collect()
    }

    /// Reads the word at `address` `words` times.
    fn read_fifo(&self, address: u32, words: usize) -> Result<Box<[u32]>, BusError> {
        (0..words).map(|_| self.read(address)).collect()
    }

    fn write_block(&self, address: u32, data: &[u32]) -> Result<(), BusError> {
        data.iter()
            .zip(0u32..)
            .try_for_each(|(value, i)| self.write(address.wrapping_add(4 * i), *value))
    }

    fn write_fifo(&self, address: u32, data: &[u32]) -> Result<(), BusError> {
        data.iter().try_for_each(|value| self.write(address, *value))
    }

    /// `register := (register & and_term) | or_term`, returning the previous value.
    fn rmw_bits(&self, address: u32, and_term: u32, or_term: u32) -> Result<u32, BusError> {
        let previous = self.read(address)?;
        self.write(address, (previous & and_term) | or_term)?;
        Ok(previous)
    }

    /// `register := register + addend`, returning the previous value.
    fn rmw_sum(&self, address: u32, addend: u32) -> Result<u32, BusError> {
        let previous = self.read(address)?;
        self.write(address, previous.wrapping_add(addend))?;
        Ok(previous)
    }

    /// Executes one request and reports failures through the info code of the response.
    fn execute(&self, request: &Request) -> Response {
        let kind = request.op.kind();
        let result = match &request.op {
            Operation::Read { address, words } => self.read_block(*address, *words as usize),
            Operation::ReadFifo { address, words } => self.read_fifo(*address, *words as usize),
            Operation::Write { address, data } => {
                self.write_block(*address, data).map(|()| Box::default())
            }
            Operation::WriteFifo { address, data } => {
                self.write_fifo(*address, data).map(|()| Box::default())
            }
            Operation::RmwBits {
                address,
                and_term,
                or_term,
            } => self
                .rmw_bits(*address, *and_term, *or_term)
                .map(|previous| Box::new([previous]) as Box<[u32]>),
            Operation::RmwSum { address, addend } => self
                .rmw_sum(*address, *addend)
                .map(|previous| Box::new([previous]) as Box<[u32]>),
        };
        match result {
            Ok(data) => Response::success(request, data),
            Err(err @ BusError::Error(_)) => {
                log::debug!("Transaction {} failed: {}", request.id, err);
                Response::error(request, kind.bus_error())
            }
            Err(err @ BusError::Timeout(_)) => {
                log::debug!("Transaction {} failed: {}", request.id, err);
                Response::error(request, kind.bus_timeout())
            }
        }
    }
}

impl<T: BusTarget + ?Sized> BusTarget for Arc<T> {
    fn read(&self, address: u32) -> Result<u32, BusError> {
        (**self).read(address)
    }

    fn write(&self, address: u32, value: u32) -> Result<(), BusError> {
        (**self).write(address, value)
    }

    fn read_block(&self, address: u32, words: usize) -> Result<Box<[u32]>, BusError> {
        (**self).read_block(address, words)
    }

    fn read_fifo(&self, address: u32, words: usize) -> Result<Box<[u32]>, BusError> {
        (**self).read_fifo(address, words)
    }

    fn write_block(&self, address: u32, data: &[u32]) -> Result<(), BusError> {
        (**self).write_block(address, data)
    }

    fn write_fifo(&self, address: u32, data: &[u32]) -> Result<(), BusError> {
        (**self).write_fifo(address, data)
    }

    fn rmw_bits(&self, address: u32, and_term: u32, or_term: u32) -> Result<u32, BusError> {
        (**self).rmw_bits(address, and_term, or_term)
    }

    fn rmw_sum(&self, address: u32, addend: u32) -> Result<u32, BusError> {
        (**self).rmw_sum(address, addend)
    }
}

/// Executes batches of requests.
///
/// Implementations return exactly one response per request, in request order, or fail the
/// whole batch when it cannot be completed.
pub trait Dispatch {
    fn dispatch(
        &self,
        requests: Vec<Request>,
    ) -> impl Future<Output = Result<Vec<Response>, DispatchError>> + Send;
}

impl<T: BusTarget> Dispatch for T {
    fn dispatch(
        &self,
        requests: Vec<Request>,
    ) -> impl Future<Output = Result<Vec<Response>, DispatchError>> + Send {
        let responses = requests.iter().map(|request| self.execute(request)).collect();
        std::future::ready(Ok(responses))
    }
}
