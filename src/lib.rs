//! # spw_rmap
//!
//! Read and write the memory of remote SpaceWire devices with RMAP.
//!
//! An [`initiator::Initiator`] owns one transport session. It builds commands with the
//! IO-agnostic [`rmap`] crate, keeps the in-flight ones in a transaction table, and runs a reader
//! thread that matches replies to them, retransmitting on timeout. Any number of threads can issue
//! operations on the same initiator at once.

#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod core;
pub mod initiator;
pub mod prelude;
pub mod transport;

pub use rmap;
use rmap::Status;
use std::sync::Arc;

/// The outcome of an initiator operation that didn't succeed.
///
/// Transport failures are shared by every transaction they take down, so they're kept behind an
/// [`Arc`] and the whole error is cheap to clone.
#[derive(thiserror::Error, Debug, Clone)]
pub enum Error {
    #[error("Connection failed, the session is over")]
    Connection(#[source] Arc<transport::Error>),
    #[error("Transport failed while sending")]
    Transport(#[source] Arc<transport::Error>),
    #[error("No reply to transaction {transaction_id:#06x} after {attempts} attempts")]
    Timeout { transaction_id: u16, attempts: usize },
    #[error("Target rejected the command: {0}")]
    Rejected(Status),
    #[error("Target replied with reserved status code {0}")]
    UnknownStatus(u8),
    #[error(transparent)]
    Protocol(#[from] rmap::Error),
    #[error("Reply to transaction {transaction_id:#06x} doesn't match its command: {reason}")]
    ReplyMismatch {
        transaction_id: u16,
        reason: &'static str,
    },
    #[error("Can't resize buffers with {0} transactions in flight")]
    Busy(usize),
    #[error("The initiator was closed")]
    Closed,
}

impl Error {
    /// Map a nonzero status byte to its error
    #[must_use]
    pub fn from_status(code: u8) -> Self {
        match Status::from_code(code) {
            Some(status) => Error::Rejected(status),
            None => Error::UnknownStatus(code),
        }
    }

    /// Whether this error ended the whole session rather than a single transaction
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        match self {
            Error::Connection(_) | Error::Closed => true,
            // A refused frame never reached the wire
            Error::Transport(e) => !matches!(**e, transport::Error::FrameTooLarge { .. }),
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
