//! SpaceWire packets tunnelled over a TCP stream.
//!
//! Every unit on the stream is a 12 byte header followed by its payload:
//! `[flag] [0x00] [reserved x2] [payload length x8]` with the length big endian.
//! A packet may be split across several fragment units, the last of which carries the end of
//! packet flag. Time-codes travel in their own two byte units.

use super::{
    Error,
    Transport,
    TransportResult,
};
use crate::core::{
    BufferPolicy,
    Config,
};
use std::{
    io::{
        ErrorKind,
        Read,
        Write,
    },
    net::{
        Shutdown,
        SocketAddr,
        TcpStream,
        ToSocketAddrs,
    },
    sync::{
        atomic::{
            AtomicBool,
            AtomicUsize,
            Ordering,
        },
        Mutex,
        MutexGuard,
        PoisonError,
    },
};
use tracing::{
    debug,
    trace,
    warn,
};

pub const HEADER_LEN: usize = 12;
/// Time-codes are six bits wide, the upper two bits are control flags we never set
pub const TIMECODE_MASK: u8 = 0x3F;
const TIMECODE_LEN: u64 = 2;
const SKIP_CHUNK: usize = 1024;

/// The first byte of every unit
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Flag {
    /// The payload completes a packet terminated by an end of packet marker
    Eop = 0x00,
    /// The payload completes a packet terminated by an error end of packet marker
    Eep = 0x01,
    /// The payload continues in the next unit
    Fragment = 0x02,
    TimecodeOut = 0x30,
    TimecodeIn = 0x31,
}

impl TryFrom<u8> for Flag {
    type Error = Error;

    fn try_from(value: u8) -> TransportResult<Self> {
        Ok(match value {
            0x00 => Flag::Eop,
            0x01 => Flag::Eep,
            0x02 => Flag::Fragment,
            0x30 => Flag::TimecodeOut,
            0x31 => Flag::TimecodeIn,
            _ => return Err(Error::UnknownFlag(value)),
        })
    }
}

/// The header in front of every unit on the stream
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct FrameHeader {
    pub flag: Flag,
    pub length: u64,
}

impl FrameHeader {
    #[must_use]
    pub fn new(flag: Flag, length: usize) -> Self {
        Self {
            flag,
            length: length as u64,
        }
    }

    #[must_use]
    pub fn to_bytes(self) -> [u8; HEADER_LEN] {
        let mut bytes = [0u8; HEADER_LEN];
        bytes[0] = self.flag as u8;
        bytes[4..].copy_from_slice(&self.length.to_be_bytes());
        bytes
    }

    /// # Errors
    /// Returns an error on unknown flags or a nonzero second byte
    pub fn from_bytes(bytes: &[u8; HEADER_LEN]) -> TransportResult<Self> {
        let flag = Flag::try_from(bytes[0])?;
        if bytes[1] != 0 {
            return Err(Error::Framing("second header byte must be zero"));
        }
        let mut length = [0u8; 8];
        length.copy_from_slice(&bytes[4..]);
        Ok(Self {
            flag,
            length: u64::from_be_bytes(length),
        })
    }
}

/// Wrap a whole packet into a single end of packet unit
#[must_use]
pub fn encode_packet(packet: &[u8]) -> Vec<u8> {
    let mut bytes = FrameHeader::new(Flag::Eop, packet.len()).to_bytes().to_vec();
    bytes.extend_from_slice(packet);
    bytes
}

/// The unit carrying an outbound time-code
#[must_use]
pub fn encode_timecode(timecode: u8) -> [u8; HEADER_LEN + 2] {
    let mut bytes = [0u8; HEADER_LEN + 2];
    bytes[..HEADER_LEN].copy_from_slice(&FrameHeader::new(Flag::TimecodeOut, 2).to_bytes());
    bytes[HEADER_LEN] = timecode & TIMECODE_MASK;
    bytes
}

fn is_timeout(e: &std::io::Error) -> bool {
    matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut)
}

/// Fill `buf` from the stream. With `idle_ok`, a timeout before the first byte returns `false`;
/// once a byte has arrived, timeouts are waited out.
fn fill(stream: &mut TcpStream, buf: &mut [u8], idle_ok: bool) -> TransportResult<bool> {
    let mut filled = 0;
    while filled < buf.len() {
        match stream.read(&mut buf[filled..]) {
            Ok(0) => return Err(Error::PeerClosed),
            Ok(n) => filled += n,
            Err(e) if is_timeout(&e) => {
                if filled == 0 && idle_ok {
                    return Ok(false);
                }
            }
            Err(e) if e.kind() == ErrorKind::Interrupted => {}
            Err(e) => return Err(e.into()),
        }
    }
    Ok(true)
}

fn skip(stream: &mut TcpStream, mut n: usize) -> TransportResult<()> {
    let mut scratch = [0u8; SKIP_CHUNK];
    while n > 0 {
        let chunk = n.min(SKIP_CHUNK);
        fill(stream, &mut scratch[..chunk], false)?;
        n -= chunk;
    }
    Ok(())
}

/// The read half, plus whatever has been collected of a fragmented packet
#[derive(Debug)]
struct Inbound {
    stream: TcpStream,
    partial: Vec<u8>,
    /// The packet being collected outgrew the receive buffer, drop the rest of it
    oversized: bool,
}

impl Inbound {
    fn reset(&mut self) {
        self.partial.clear();
        self.oversized = false;
    }

    fn next_packet(&mut self, limit: Option<usize>) -> TransportResult<Option<Vec<u8>>> {
        loop {
            let mut raw = [0u8; HEADER_LEN];
            if !fill(&mut self.stream, &mut raw, true)? {
                return Ok(None);
            }
            let header = FrameHeader::from_bytes(&raw)?;
            let length = usize::try_from(header.length)
                .map_err(|_| Error::Framing("payload length overflows"))?;
            match header.flag {
                Flag::Eop | Flag::Fragment => {
                    if length == 0 {
                        return Err(Error::Framing("zero length payload"));
                    }
                    let total = self.partial.len() + length;
                    if self.oversized || limit.is_some_and(|limit| total > limit) {
                        skip(&mut self.stream, length)?;
                        self.oversized = true;
                        if header.flag == Flag::Eop {
                            warn!(bytes = total, "Dropped packet larger than the receive buffer");
                            self.reset();
                        }
                        continue;
                    }
                    let start = self.partial.len();
                    self.partial.resize(total, 0);
                    fill(&mut self.stream, &mut self.partial[start..], false)?;
                    if header.flag == Flag::Eop {
                        self.oversized = false;
                        return Ok(Some(std::mem::take(&mut self.partial)));
                    }
                }
                Flag::Eep => {
                    skip(&mut self.stream, length)?;
                    warn!(
                        bytes = self.partial.len() + length,
                        "Discarded packet terminated by an EEP"
                    );
                    self.reset();
                }
                Flag::TimecodeIn => {
                    if header.length != TIMECODE_LEN {
                        return Err(Error::Framing("time-code units carry two bytes"));
                    }
                    let mut timecode = [0u8; 2];
                    fill(&mut self.stream, &mut timecode, false)?;
                    if timecode[1] != 0 {
                        return Err(Error::Framing("time-code padding must be zero"));
                    }
                    debug!(timecode = timecode[0] & TIMECODE_MASK, "Received time-code");
                }
                Flag::TimecodeOut => {
                    return Err(Error::Framing("received an outbound time-code"));
                }
            }
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// A connection to a SpaceWire-to-TCP bridge
#[derive(Debug)]
pub struct SpwTcp {
    outbound: Mutex<TcpStream>,
    inbound: Mutex<Inbound>,
    control: TcpStream,
    send_limit: AtomicUsize,
    recv_limit: AtomicUsize,
    policy: BufferPolicy,
    closed: AtomicBool,
}

impl SpwTcp {
    /// Resolve `addr` and connect to the first address that answers within the connect timeout
    /// # Errors
    /// Returns an error if nothing resolved or no address accepted the connection
    pub fn connect<A: ToSocketAddrs>(addr: A, config: &Config) -> TransportResult<Self> {
        let addrs: Vec<SocketAddr> = addr.to_socket_addrs()?.collect();
        let mut last_error = None;
        for addr in &addrs {
            match TcpStream::connect_timeout(addr, config.timeouts.connect) {
                Ok(stream) => {
                    debug!(%addr, "Connected");
                    return Self::from_stream(stream, config);
                }
                Err(e) => {
                    debug!(%addr, error = %e, "Connection attempt failed");
                    last_error = Some(e);
                }
            }
        }
        Err(match last_error {
            Some(e) => Error::Unreachable(format!("{addrs:?} ({e})")),
            None => Error::Unreachable("an address that doesn't resolve".to_owned()),
        })
    }

    /// Wrap an already connected stream
    /// # Errors
    /// Returns an error if the socket options can't be applied
    pub fn from_stream(stream: TcpStream, config: &Config) -> TransportResult<Self> {
        stream.set_nodelay(true)?;
        stream.set_write_timeout(Some(config.timeouts.write))?;
        stream.set_read_timeout(Some(config.poll_interval))?;
        let inbound = Inbound {
            stream: stream.try_clone()?,
            partial: Vec::with_capacity(config.recv_buffer_size),
            oversized: false,
        };
        Ok(Self {
            control: stream.try_clone()?,
            outbound: Mutex::new(stream),
            inbound: Mutex::new(inbound),
            send_limit: AtomicUsize::new(config.send_buffer_size),
            recv_limit: AtomicUsize::new(config.recv_buffer_size),
            policy: config.buffer_policy,
            closed: AtomicBool::new(false),
        })
    }

    /// # Errors
    /// Returns an error if the socket is no longer connected
    pub fn peer_addr(&self) -> TransportResult<SocketAddr> {
        Ok(self.control.peer_addr()?)
    }

    fn ensure_open(&self) -> TransportResult<()> {
        if self.closed.load(Ordering::Acquire) {
            Err(Error::Closed)
        } else {
            Ok(())
        }
    }

    fn write_unit(&self, bytes: &[u8]) -> TransportResult<()> {
        let mut stream = lock(&self.outbound);
        stream.write_all(bytes)?;
        stream.flush()?;
        Ok(())
    }
}

impl Transport for SpwTcp {
    fn send(&self, frame: &[u8]) -> TransportResult<()> {
        self.ensure_open()?;
        if frame.is_empty() {
            return Err(Error::Framing("can't send an empty packet"));
        }
        let limit = self.send_limit.load(Ordering::Relaxed);
        if self.policy == BufferPolicy::Fixed && frame.len() > limit {
            return Err(Error::FrameTooLarge {
                len: frame.len(),
                limit,
            });
        }
        self.write_unit(&encode_packet(frame))?;
        trace!(bytes = frame.len(), "Sent packet");
        Ok(())
    }

    fn receive(&self) -> TransportResult<Option<Vec<u8>>> {
        self.ensure_open()?;
        let limit = match self.policy {
            BufferPolicy::Fixed => Some(self.recv_limit.load(Ordering::Relaxed)),
            BufferPolicy::AutoResize => None,
        };
        let packet = lock(&self.inbound).next_packet(limit);
        match packet {
            // Shutting the socket down is how close wakes us up
            Err(_) if self.closed.load(Ordering::Acquire) => Err(Error::Closed),
            Ok(Some(packet)) => {
                trace!(bytes = packet.len(), "Received packet");
                Ok(Some(packet))
            }
            other => other,
        }
    }

    fn set_buffers(&self, send: usize, recv: usize) -> TransportResult<()> {
        self.ensure_open()?;
        self.send_limit.store(send, Ordering::Relaxed);
        self.recv_limit.store(recv, Ordering::Relaxed);
        Ok(())
    }

    fn emit_timecode(&self, timecode: u8) -> TransportResult<()> {
        self.ensure_open()?;
        self.write_unit(&encode_timecode(timecode))
    }

    fn close(&self) -> TransportResult<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        match self.control.shutdown(Shutdown::Both) {
            Err(e) if e.kind() != ErrorKind::NotConnected => Err(e.into()),
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_packet_unit() {
        let bytes = encode_packet(&[0xFE, 0x01, 0x0D]);
        assert_eq!(
            bytes,
            vec![0x00, 0x00, 0, 0, 0, 0, 0, 0, 0, 0, 0, 3, 0xFE, 0x01, 0x0D]
        );
    }

    #[test]
    fn test_timecode_unit() {
        let bytes = encode_timecode(0xC5);
        assert_eq!(bytes[0], 0x30);
        assert_eq!(bytes[11], 0x02);
        assert_eq!(&bytes[12..], &[0x05, 0x00]);
    }

    #[test]
    fn test_header_rejects_garbage() {
        let mut raw = FrameHeader::new(Flag::Eop, 4).to_bytes();
        raw[0] = 0x07;
        assert!(matches!(
            FrameHeader::from_bytes(&raw),
            Err(Error::UnknownFlag(0x07))
        ));
        let mut raw = FrameHeader::new(Flag::Fragment, 4).to_bytes();
        raw[1] = 0x01;
        assert!(matches!(
            FrameHeader::from_bytes(&raw),
            Err(Error::Framing(_))
        ));
    }

    #[test]
    fn test_header_length() {
        let header = FrameHeader::from_bytes(&[0x02, 0, 0, 0, 0, 0, 0, 0x01, 0, 0, 0x10, 0x00])
            .unwrap();
        assert_eq!(header.flag, Flag::Fragment);
        assert_eq!(header.length, 0x0001_0000_1000);
    }
}
