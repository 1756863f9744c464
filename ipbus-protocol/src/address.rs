//! Static description of the named endpoints on the bus.
//!
//! An [`AddressMap`] is loaded once per connection and is read-only afterwards.
//! Every node is made of 32-bit words; narrower registers are described as masked nodes.
//! It can be built programmatically or parsed from a line-oriented description:
//!
//! ```text
//! # name            address      kind    parameter
//! REG               0x00000000   scalar
//! REG_LOWER_MASK    0x00000000   masked  0x0000ffff
//! MEM               0x00001000   block   512
//! ```
use std::{collections::HashMap, str::FromStr};

use crate::error::{AccessError, MapError};

/// How a node is accessed.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum AccessKind {
    /// A single full-width register.
    Scalar,
    /// A register whose accessible bits are selected by the node's mask.
    Masked,
    /// `size` consecutive words starting at the node's address.
    Block { size: usize },
}

/// The kind of access requested by an operation.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Access {
    Read,
    Write,
    BlockRead,
    BlockWrite,
    /// Repeated accesses to the node's first word.
    FifoRead,
    FifoWrite,
}

impl Access {
    fn is_block(&self) -> bool {
        matches!(self, Access::BlockRead | Access::BlockWrite)
    }

    fn is_fifo(&self) -> bool {
        matches!(self, Access::FifoRead | Access::FifoWrite)
    }
}

/// A named, address-mapped bus endpoint.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Node {
    name: String,
    address: u32,
    kind: AccessKind,
    mask: u32,
}

impl Node {
    pub const FULL_MASK: u32 = 0xffff_ffff;
    /// Width of a word in bits.
    pub const WIDTH: u32 = 32;

    pub fn scalar(name: impl Into<String>, address: u32) -> Node {
        Node {
            name: name.into(),
            address,
            kind: AccessKind::Scalar,
            mask: Self::FULL_MASK,
        }
    }

    pub fn masked(name: impl Into<String>, address: u32, mask: u32) -> Node {
        Node {
            name: name.into(),
            address,
            kind: AccessKind::Masked,
            mask,
        }
    }

    pub fn block(name: impl Into<String>, address: u32, size: usize) -> Node {
        Node {
            name: name.into(),
            address,
            kind: AccessKind::Block { size },
            mask: Self::FULL_MASK,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// The byte address of the first word.
    pub fn address(&self) -> u32 {
        self.address
    }

    pub fn kind(&self) -> AccessKind {
        self.kind
    }

    /// Width of every word of the node, in bits.
    pub fn width(&self) -> u32 {
        Self::WIDTH
    }

    /// Bits of the register that may be accessed. Full width for scalar and block nodes.
    pub fn mask(&self) -> u32 {
        self.mask
    }

    /// Number of words addressable through this node.
    pub fn capacity(&self) -> usize {
        match self.kind {
            AccessKind::Scalar | AccessKind::Masked => 1,
            AccessKind::Block { size } => size,
        }
    }

    /// Byte address of the word at `index`, if it is representable.
    pub fn word_address(&self, index: usize) -> Option<u32> {
        u32::try_from(index)
            .ok()?
            .checked_mul(4)?
            .checked_add(self.address)
    }

    /// Checks that `length` words may be accessed with `access`.
    ///
    /// FIFO accesses repeat the node's first word, so their length is not bounded by the
    /// node's capacity.
    pub fn validate_access(&self, access: Access, length: usize) -> Result<(), AccessError> {
        let unit_only = matches!(self.kind, AccessKind::Scalar | AccessKind::Masked);
        let valid = length > 0
            && (access.is_fifo() || length <= self.capacity())
            && !(unit_only && access.is_block() && length != 1);
        if valid {
            Ok(())
        } else {
            Err(AccessError::AddressRange {
                node: self.name.clone(),
                length,
                capacity: self.capacity(),
            })
        }
    }

    /// Checks that a mask supplied with a write only selects bits of this node's mask.
    pub fn validate_mask(&self, mask: u32) -> Result<(), AccessError> {
        if mask & !self.mask == 0 {
            Ok(())
        } else {
            Err(AccessError::MaskViolation {
                node: self.name.clone(),
                mask,
                allowed: self.mask,
            })
        }
    }
}

/// The set of nodes reachable through one connection, indexed by name.
#[derive(Clone, Debug, Default)]
pub struct AddressMap {
    nodes: HashMap<String, Node>,
}

impl AddressMap {
    pub fn builder() -> AddressMapBuilder {
        AddressMapBuilder::default()
    }

    pub fn resolve(&self, name: &str) -> Result<&Node, AccessError> {
        self.nodes
            .get(name)
            .ok_or_else(|| AccessError::UnknownNode(name.to_string()))
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// All nodes, ordered by address and name.
    pub fn nodes(&self) -> Vec<&Node> {
        let mut nodes: Vec<&Node> = self.nodes.values().collect();
        nodes.sort_by(|a, b| (a.address, &a.name).cmp(&(b.address, &b.name)));
        nodes
    }
}

/// Builder that validates nodes as they are added.
#[derive(Default)]
pub struct AddressMapBuilder {
    nodes: HashMap<String, Node>,
}

impl AddressMapBuilder {
    pub fn node(mut self, node: Node) -> Result<Self, MapError> {
        if node.address % 4 != 0 {
            return Err(MapError::Misaligned(node.name, node.address));
        }
        if node.mask == 0 || node.capacity() == 0 {
            return Err(MapError::Empty(node.name));
        }
        if node.word_address(node.capacity() - 1).is_none() {
            return Err(MapError::OutOfRange(node.name));
        }
        if self.nodes.contains_key(&node.name) {
            return Err(MapError::DuplicateNode(node.name));
        }
        self.nodes.insert(node.name.clone(), node);
        Ok(self)
    }

    pub fn build(self) -> AddressMap {
        AddressMap { nodes: self.nodes }
    }
}

fn parse_number<T: TryFrom<u64>>(text: &str, line: usize) -> Result<T, MapError> {
    let parsed = match text.strip_prefix("0x").or_else(|| text.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(&hex.replace('_', ""), 16),
        None => text.replace('_', "").parse::<u64>(),
    };
    parsed
        .ok()
        .and_then(|value| T::try_from(value).ok())
        .ok_or_else(|| MapError::Syntax {
            line,
            message: format!("Invalid number '{}'", text),
        })
}

impl FromStr for AddressMap {
    type Err = MapError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut builder = AddressMap::builder();
        for (index, raw) in s.lines().enumerate() {
            let line = index + 1;
            let content = raw.split('#').next().unwrap_or_default().trim();
            if content.is_empty() {
                continue;
            }
            let fields: Vec<&str> = content.split_whitespace().collect();
            let syntax = |message: &str| MapError::Syntax {
                line,
                message: message.to_string(),
            };
            let node = match fields.as_slice() {
                [name, address, "scalar"] => Node::scalar(*name, parse_number(address, line)?),
                [name, address, "masked", mask] => Node::masked(
                    *name,
                    parse_number(address, line)?,
                    parse_number(mask, line)?,
                ),
                [name, address, "block", size] => Node::block(
                    *name,
                    parse_number(address, line)?,
                    parse_number(size, line)?,
                ),
                [_, _, "masked"] => return Err(syntax("Masked node requires a mask")),
                [_, _, "block"] => return Err(syntax("Block node requires a size")),
                [_, _, kind, ..] => {
                    return Err(syntax(&format!("Unknown node kind '{}'", kind)));
                }
                _ => return Err(syntax("Expected '<name> <address> <kind> [parameter]'")),
            };
            builder = builder.node(node)?;
        }
        Ok(builder.build())
    }
}
