//! Mock transport implementations used in testing the interface

use super::{
    tcp::TIMECODE_MASK,
    Error,
    Transport,
    TransportResult,
};
use rmap::{
    decode_command,
    encode_reply,
    CommandKind,
    DecodedCommand,
    Status,
};
use std::{
    collections::{
        HashMap,
        VecDeque,
    },
    io::ErrorKind,
    sync::{
        Arc,
        Condvar,
        Mutex,
        MutexGuard,
        PoisonError,
    },
    time::Duration,
};
use tracing::{
    trace,
    warn,
};

/// How long an idle `receive` blocks
const POLL_INTERVAL: Duration = Duration::from_millis(2);

/// A simulated RMAP target: a sparse memory behind a logical address and key
#[derive(Debug, Clone)]
pub struct TargetMemory {
    // We'll represent each address lazily instead of having a dense array, unset bytes read as 0
    memory: HashMap<(u8, u32), u8>,
    logical_address: u8,
    key: u8,
}

impl TargetMemory {
    #[must_use]
    pub fn new(logical_address: u8, key: u8) -> Self {
        Self {
            memory: HashMap::new(),
            logical_address,
            key,
        }
    }

    #[must_use]
    pub fn logical_address(&self) -> u8 {
        self.logical_address
    }

    /// Read memory directly, bypassing the protocol
    #[must_use]
    pub fn peek(&self, address: u32, len: usize) -> Vec<u8> {
        (0..len)
            .map(|i| self.byte(0, address.wrapping_add(i as u32)))
            .collect()
    }

    /// Write memory directly, bypassing the protocol
    pub fn poke(&mut self, address: u32, data: &[u8]) {
        for (i, byte) in data.iter().enumerate() {
            self.memory
                .insert((0, address.wrapping_add(i as u32)), *byte);
        }
    }

    fn byte(&self, extended: u8, address: u32) -> u8 {
        self.memory
            .get(&(extended, address))
            .copied()
            .unwrap_or_default()
    }

    /// The address of the `i`th byte touched by a command
    fn location(decoded: &DecodedCommand, i: usize) -> (u8, u32) {
        let command = &decoded.command;
        let offset = if command.increment { i as u32 } else { 0 };
        (
            command.extended_address,
            command.address.wrapping_add(offset),
        )
    }

    fn load(&self, decoded: &DecodedCommand, len: usize) -> Vec<u8> {
        (0..len)
            .map(|i| {
                let (extended, address) = Self::location(decoded, i);
                self.byte(extended, address)
            })
            .collect()
    }

    fn store(&mut self, decoded: &DecodedCommand, data: &[u8]) {
        for (i, byte) in data.iter().enumerate() {
            self.memory.insert(Self::location(decoded, i), *byte);
        }
    }

    /// Carry out a command, returning the status and the data for the reply
    fn execute(&mut self, decoded: &DecodedCommand) -> (Status, Vec<u8>) {
        let command = &decoded.command;
        if decoded.target_logical_address != self.logical_address {
            return (Status::InvalidTargetLogicalAddress, vec![]);
        }
        if command.key != self.key {
            return (Status::InvalidKey, vec![]);
        }
        match command.kind {
            CommandKind::Read => (Status::Success, self.load(decoded, command.data_length as usize)),
            // The data CRC was already checked while decoding, so verified writes need nothing else
            CommandKind::Write => {
                self.store(decoded, &command.data);
                (Status::Success, vec![])
            }
            CommandKind::ReadModifyWrite => {
                if !matches!(command.data.len(), 2 | 4 | 6 | 8) {
                    return (Status::RmwDataLengthError, vec![]);
                }
                let (data, mask) = command.data.split_at(command.data.len() / 2);
                let old = self.load(decoded, data.len());
                let new: Vec<u8> = old
                    .iter()
                    .zip(data.iter().zip(mask))
                    .map(|(old, (data, mask))| (old & !mask) | (data & mask))
                    .collect();
                self.store(decoded, &new);
                (Status::Success, old)
            }
        }
    }

    fn respond(&mut self, frame: &[u8], forced_status: Option<u8>) -> Option<Vec<u8>> {
        let decoded = match decode_command(frame) {
            Ok(decoded) => decoded,
            Err(e) => {
                warn!(error = %e, "Target dropped a command it couldn't decode");
                return None;
            }
        };
        let mut reply = match forced_status {
            Some(code) => {
                let mut reply = decoded.reply(Status::Success, vec![]);
                reply.status = code;
                reply
            }
            None => {
                let (status, data) = self.execute(&decoded);
                decoded.reply(status, data)
            }
        };
        if !decoded.command.expects_reply() {
            return None;
        }
        reply.reply_address = decoded.reply_address;
        encode_reply(&reply).ok()
    }

    /// Execute a command packet like a target would, returning the encoded reply if one is due
    pub fn handle(&mut self, frame: &[u8]) -> Option<Vec<u8>> {
        self.respond(frame, None)
    }
}

#[derive(Debug)]
struct State {
    target: TargetMemory,
    inbox: VecDeque<Vec<u8>>,
    sent: Vec<Vec<u8>>,
    timecodes: Vec<u8>,
    buffers: (usize, usize),
    drop_replies: usize,
    corrupt_replies: usize,
    forced_status: Option<u8>,
    fail_sends: bool,
    link_down: bool,
    closed: bool,
}

#[derive(Debug)]
struct Inner {
    state: Mutex<State>,
    arrived: Condvar,
}

/// A transport wired straight into a [`TargetMemory`], with knobs for injecting faults.
///
/// Clones share the same target, so a test can keep one to poke at while the initiator owns the
/// other.
#[derive(Debug, Clone)]
pub struct Mock {
    inner: Arc<Inner>,
}

impl Mock {
    /// Construct a new mock transport talking to `target`
    #[must_use]
    pub fn new(target: TargetMemory) -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State {
                    target,
                    inbox: VecDeque::new(),
                    sent: vec![],
                    timecodes: vec![],
                    buffers: (0, 0),
                    drop_replies: 0,
                    corrupt_replies: 0,
                    forced_status: None,
                    fail_sends: false,
                    link_down: false,
                    closed: false,
                }),
                arrived: Condvar::new(),
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Swallow the next `n` replies
    pub fn drop_replies(&self, n: usize) {
        self.state().drop_replies = n;
    }

    /// Flip a bit in the trailing CRC of the next `n` replies
    pub fn corrupt_replies(&self, n: usize) {
        self.state().corrupt_replies = n;
    }

    /// Answer every command with `status` instead of executing it
    pub fn force_status(&self, status: Option<u8>) {
        self.state().forced_status = status;
    }

    /// Make every send fail
    pub fn fail_sends(&self, fail: bool) {
        self.state().fail_sends = fail;
    }

    /// Queue an arbitrary inbound frame
    pub fn inject(&self, frame: impl Into<Vec<u8>>) {
        self.state().inbox.push_back(frame.into());
        self.inner.arrived.notify_all();
    }

    /// Cut the link, every blocked and future `receive` fails
    pub fn disconnect(&self) {
        self.state().link_down = true;
        self.inner.arrived.notify_all();
    }

    /// Every frame sent so far
    #[must_use]
    pub fn sent(&self) -> Vec<Vec<u8>> {
        self.state().sent.clone()
    }

    #[must_use]
    pub fn timecodes(&self) -> Vec<u8> {
        self.state().timecodes.clone()
    }

    /// The (send, receive) buffer sizes last requested
    #[must_use]
    pub fn buffers(&self) -> (usize, usize) {
        self.state().buffers
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.state().closed
    }

    /// Get at the simulated target
    pub fn with_target<R>(&self, f: impl FnOnce(&mut TargetMemory) -> R) -> R {
        f(&mut self.state().target)
    }
}

fn broken_pipe(msg: &'static str) -> Error {
    Error::Io(std::io::Error::new(ErrorKind::BrokenPipe, msg))
}

impl Transport for Mock {
    fn send(&self, frame: &[u8]) -> TransportResult<()> {
        let mut state = self.state();
        if state.closed {
            return Err(Error::Closed);
        }
        if state.link_down {
            return Err(broken_pipe("link is down"));
        }
        if state.fail_sends {
            return Err(broken_pipe("simulated send failure"));
        }
        state.sent.push(frame.to_vec());
        let forced_status = state.forced_status;
        let Some(mut reply) = state.target.respond(frame, forced_status) else {
            return Ok(());
        };
        if state.drop_replies > 0 {
            state.drop_replies -= 1;
            trace!("Dropped reply");
            return Ok(());
        }
        if state.corrupt_replies > 0 {
            state.corrupt_replies -= 1;
            if let Some(crc) = reply.last_mut() {
                *crc ^= 0x01;
            }
        }
        state.inbox.push_back(reply);
        drop(state);
        self.inner.arrived.notify_all();
        Ok(())
    }

    fn receive(&self) -> TransportResult<Option<Vec<u8>>> {
        let mut state = self.state();
        for waited in [false, true] {
            if state.closed {
                return Err(Error::Closed);
            }
            if state.link_down {
                return Err(Error::PeerClosed);
            }
            if let Some(frame) = state.inbox.pop_front() {
                return Ok(Some(frame));
            }
            if !waited {
                state = self
                    .inner
                    .arrived
                    .wait_timeout(state, POLL_INTERVAL)
                    .unwrap_or_else(PoisonError::into_inner)
                    .0;
            }
        }
        Ok(None)
    }

    fn set_buffers(&self, send: usize, recv: usize) -> TransportResult<()> {
        self.state().buffers = (send, recv);
        Ok(())
    }

    fn emit_timecode(&self, timecode: u8) -> TransportResult<()> {
        let mut state = self.state();
        if state.closed {
            return Err(Error::Closed);
        }
        state.timecodes.push(timecode & TIMECODE_MASK);
        Ok(())
    }

    fn close(&self) -> TransportResult<()> {
        self.state().closed = true;
        self.inner.arrived.notify_all();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        core::Config,
        initiator::Initiator,
    };
    use paste::paste;
    use rmap::{
        decode_reply,
        encode_command,
        Command,
        TargetNode,
    };

    fn node() -> TargetNode {
        TargetNode::new(0x34, [1, 2], [1, 3]).unwrap()
    }

    fn exchange(target: &mut TargetMemory, command: &Command) -> rmap::Reply {
        let frame = encode_command(command, &node()).unwrap();
        decode_reply(&target.handle(&frame).unwrap()).unwrap()
    }

    macro_rules! test_rw_num {
        ($num:ty, $v:literal) => {
            paste! {
                #[test]
                #[allow(clippy::float_cmp)]
                fn [<test_rw_$num>]() {
                    let initiator =
                        Initiator::new(Mock::new(TargetMemory::new(0x34, 0)), Config::default())
                            .unwrap();
                    let num: $num = $v;
                    initiator.write_value(&node(), 0x100, &num).unwrap();
                    let read_num: $num = initiator.read_value(&node(), 0x100).unwrap();
                    assert_eq!(read_num, num);
                    assert_eq!(
                        initiator.transport().with_target(|t| t.peek(0x100, core::mem::size_of::<$num>())),
                        num.to_be_bytes().to_vec()
                    );
                }
            }
        };
    }

    #[test]
    fn test_read_unset() {
        let mut target = TargetMemory::new(0x34, 0);
        let reply = exchange(&mut target, &Command::read(0, 4));
        assert!(reply.is_success());
        assert_eq!(reply.data, vec![0, 0, 0, 0]);
        // The reply comes back with the reply path in front
        assert_eq!(reply.reply_address, vec![1, 3]);
    }

    #[test]
    fn test_write_read() {
        let mut target = TargetMemory::new(0x34, 0);
        let reply = exchange(&mut target, &Command::write(0x10, vec![1, 2, 3, 4]));
        assert!(reply.is_success());
        assert_eq!(target.peek(0x10, 4), vec![1, 2, 3, 4]);
        let reply = exchange(&mut target, &Command::read(0x12, 2));
        assert_eq!(reply.data, vec![3, 4]);
    }

    #[test]
    fn test_non_incrementing() {
        let mut target = TargetMemory::new(0x34, 0);
        target.poke(0x20, &[0xAA, 0xBB]);
        let reply = exchange(&mut target, &Command::read(0x20, 3).with_increment(false));
        assert_eq!(reply.data, vec![0xAA, 0xAA, 0xAA]);
        exchange(
            &mut target,
            &Command::write(0x20, vec![1, 2, 3]).with_increment(false),
        );
        assert_eq!(target.peek(0x20, 2), vec![3, 0xBB]);
    }

    #[test]
    fn test_rmw() {
        let mut target = TargetMemory::new(0x34, 0);
        target.poke(0x30, &[0b1010_1010]);
        let command = Command::read_modify_write(0x30, &[0b0000_1111], &[0b0011_1100]).unwrap();
        let reply = exchange(&mut target, &command);
        assert_eq!(reply.data, vec![0b1010_1010]);
        assert_eq!(target.peek(0x30, 1), vec![0b1000_1110]);
    }

    #[test]
    fn test_bad_key() {
        let mut target = TargetMemory::new(0x34, 0x20);
        let reply = exchange(&mut target, &Command::write(0, vec![1]));
        assert_eq!(reply.status(), Some(Status::InvalidKey));
        assert_eq!(target.peek(0, 1), vec![0]);
        let reply = exchange(&mut target, &Command::write(0, vec![1]).with_key(0x20));
        assert!(reply.is_success());
    }

    #[test]
    fn test_wrong_logical_address() {
        let mut target = TargetMemory::new(0x40, 0);
        let reply = exchange(&mut target, &Command::read(0, 4));
        assert_eq!(reply.status(), Some(Status::InvalidTargetLogicalAddress));
        assert!(reply.data.is_empty());
    }

    #[test]
    fn test_unacknowledged_write() {
        let mut target = TargetMemory::new(0x34, 0);
        let command = Command::write(0x40, vec![9]).with_acknowledge(false);
        let frame = encode_command(&command, &node()).unwrap();
        assert!(target.handle(&frame).is_none());
        assert_eq!(target.peek(0x40, 1), vec![9]);
    }

    #[test]
    fn test_garbage_ignored() {
        let mut target = TargetMemory::new(0x34, 0);
        assert!(target.handle(&[0x34, 0x02, 0x4C]).is_none());
    }

    #[test]
    fn test_receive_idle() {
        let mock = Mock::new(TargetMemory::new(0x34, 0));
        assert!(mock.receive().unwrap().is_none());
        mock.inject(vec![1, 2, 3]);
        assert_eq!(mock.receive().unwrap(), Some(vec![1, 2, 3]));
        mock.disconnect();
        assert!(matches!(mock.receive(), Err(Error::PeerClosed)));
    }

    test_rw_num!(u8, 42);
    test_rw_num!(u16, 0xDEAD);
    test_rw_num!(u32, 0xDEAD_BEEF);
    test_rw_num!(u64, 0xDEAD_BEEF_B0BA_CAFE);
    test_rw_num!(i8, -42);
    test_rw_num!(i16, -0xDEA);
    test_rw_num!(i32, -0x0DEA_DBEE);
    test_rw_num!(i64, -0x0DEA_DBEE_FB0B_ACAF);
    test_rw_num!(f32, 1.618);
    test_rw_num!(f64, -6.022e23);
}
