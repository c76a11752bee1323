//! Defines the byte-moving boundary every initiator transport must implement

pub mod mock;
pub mod tcp;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Internal system IO error")]
    Io(#[from] std::io::Error),
    #[error("Couldn't connect to {0}")]
    Unreachable(String),
    #[error("Framing violation: {0}")]
    Framing(&'static str),
    #[error("Unknown frame flag {0:#04x}")]
    UnknownFlag(u8),
    #[error("Frame of {len} bytes doesn't fit the {limit} byte buffer")]
    FrameTooLarge { len: usize, limit: usize },
    #[error("The remote end closed the connection")]
    PeerClosed,
    #[error("The transport has been closed")]
    Closed,
}

pub type TransportResult<T> = std::result::Result<T, Error>;

/// A bidirectional channel carrying whole SpaceWire packets.
///
/// A transport is shared between the thread draining replies and every thread issuing commands,
/// so every method takes `&self`.
pub trait Transport: Send + Sync + 'static {
    /// Send one complete packet. Concurrent sends must never interleave on the wire.
    /// # Errors
    /// Returns an error if the packet couldn't be written
    fn send(&self, frame: &[u8]) -> TransportResult<()>;

    /// Receive one complete packet, blocking for at most about one poll interval.
    /// `Ok(None)` means nothing arrived in that time.
    /// # Errors
    /// Returns an error if the channel is broken, which ends the session
    fn receive(&self) -> TransportResult<Option<Vec<u8>>>;

    /// Resize the send and receive buffers
    /// # Errors
    /// Returns an error if the underlying channel refuses the new sizes
    fn set_buffers(&self, send: usize, recv: usize) -> TransportResult<()>;

    /// Broadcast a SpaceWire time-code. Only the lower six bits are sent.
    /// # Errors
    /// Returns an error if the time-code couldn't be written
    fn emit_timecode(&self, timecode: u8) -> TransportResult<()>;

    /// Shut the channel down, waking up a blocked `receive`
    /// # Errors
    /// Returns an error if the underlying channel fails to shut down
    fn close(&self) -> TransportResult<()>;
}

/// Types that implement this trait can be serialized such that they can be written to remote
/// memory
pub trait Serialize {
    type Chunk: AsRef<[u8]>;
    fn serialize(&self) -> Self::Chunk;
}

/// Types that implement this trait can be deserialized from bytes read out of remote memory
pub trait Deserialize: Sized {
    type Chunk: AsMut<[u8]> + Default;
    fn deserialize(chunk: Self::Chunk) -> Self;
}

macro_rules! ser_num {
    ($num:ty) => {
        impl Serialize for $num {
            type Chunk = [u8; core::mem::size_of::<$num>()];
            fn serialize(&self) -> Self::Chunk {
                self.to_be_bytes()
            }
        }
    };
}

macro_rules! deser_num {
    ($num:ty) => {
        impl Deserialize for $num {
            type Chunk = [u8; core::mem::size_of::<$num>()];
            fn deserialize(chunk: Self::Chunk) -> Self {
                <$num>::from_be_bytes(chunk)
            }
        }
    };
}

// Registers are big endian on the wire
ser_num!(u8);
ser_num!(u16);
ser_num!(u32);
ser_num!(u64);
ser_num!(i8);
ser_num!(i16);
ser_num!(i32);
ser_num!(i64);
ser_num!(f32);
ser_num!(f64);

deser_num!(u8);
deser_num!(u16);
deser_num!(u32);
deser_num!(u64);
deser_num!(i8);
deser_num!(i16);
deser_num!(i32);
deser_num!(i64);
deser_num!(f32);
deser_num!(f64);
