//! # RMAP
//!
//! An IO-agnostic implementation of the initiator side of the SpaceWire Remote Memory Access
//! Protocol (ECSS-E-ST-50-52C). This crate knows how to lay out command packets, check and pick
//! apart replies, and keep track of which transactions are still waiting on the wire. Moving the
//! bytes around is left to the caller.

#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod address;
pub mod crc;
pub mod instruction;
pub mod packet;
pub mod status;
pub mod target;
pub mod transaction;

pub use instruction::{
    CommandKind,
    Instruction,
};
pub use packet::{
    decode_command,
    decode_reply,
    encode_command,
    encode_reply,
    Command,
    DecodedCommand,
    Reply,
};
pub use status::Status;
pub use target::TargetNode;
pub use transaction::{
    PendingTransaction,
    TransactionTable,
};

/// The protocol identifier assigned to RMAP
pub const PROTOCOL_ID: u8 = 0x01;
/// The longest path address (target or reply) we can express
pub const MAX_PATH_LENGTH: usize = 12;
/// The data length field is 24 bits wide
pub const MAX_DATA_LENGTH: u32 = 0x00FF_FFFF;
/// Logical addresses below this are path bytes on the wire
pub const MIN_LOGICAL_ADDRESS: u8 = 0x20;
/// The logical address initiators use when nothing else was assigned
pub const DEFAULT_INITIATOR_LOGICAL_ADDRESS: u8 = 0xFE;

/// Which of the two CRC protected fields failed its check
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum CrcField {
    Header,
    Data,
}

impl std::fmt::Display for CrcField {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}",
            match self {
                CrcField::Header => "header",
                CrcField::Data => "data",
            }
        )
    }
}

/// Errors that can be thrown while building, parsing, or correlating RMAP packets
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    #[error("Invalid SpaceWire address {path:?}: {reason}")]
    InvalidAddress { path: Vec<u8>, reason: &'static str },
    #[error("Data length of {0} bytes does not fit the 24-bit length field")]
    PayloadTooLarge(usize),
    #[error("Data length of {len} bytes is not allowed for a {kind} command")]
    InvalidDataLength { kind: CommandKind, len: usize },
    #[error("Malformed packet: {0}")]
    MalformedPacket(&'static str),
    #[error("Bad {field} CRC: expected {expected:#04x}, got {actual:#04x}")]
    CrcMismatch {
        field: CrcField,
        expected: u8,
        actual: u8,
    },
    #[error("Not an RMAP packet, protocol identifier was {0:#04x}")]
    ProtocolIdMismatch(u8),
    #[error("Transaction {0:#06x} is already in flight")]
    DuplicateTransactionId(u16),
    #[error("Every transaction ID is in use")]
    TransactionTableFull,
    #[error("No transaction {0:#06x} is waiting on a reply")]
    UnsolicitedReply(u16),
}

pub type Result<T> = std::result::Result<T, Error>;
