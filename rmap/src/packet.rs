//! Byte-level layout of RMAP commands and replies.
//!
//! Command:
//! `[target path] [target LA] [protocol ID] [instruction] [key] [reply path, zero padded]
//!  [initiator LA] [transaction ID x2] [extended address] [address x4] [data length x3]
//!  [header CRC] ([data] [data CRC])`
//!
//! Reply:
//! `[reply path] [initiator LA] [protocol ID] [instruction] [status] [target LA]
//!  [transaction ID x2] ([reserved] [data length x3]) [header CRC] ([data] [data CRC])`
//!
//! Write replies stop at the header CRC after the transaction ID. Every multi-byte field is big
//! endian.

use crate::{
    address,
    crc,
    instruction::{
        CommandKind,
        Instruction,
        ReplyAddressWords,
    },
    status::Status,
    target::TargetNode,
    CrcField,
    Error,
    Result,
    MAX_DATA_LENGTH,
    PROTOCOL_ID,
};
use nom::{
    bytes::complete::take,
    number::complete::{
        be_u16,
        be_u24,
        be_u32,
        be_u8,
    },
    sequence::tuple,
    IResult,
};

/// Path address bytes are below this value, logical addresses are at or above it
const LOGICAL_ADDRESS_MIN: u8 = 0x20;
/// Target LA, protocol ID, instruction, and key
const COMMAND_PREAMBLE_LEN: usize = 4;
/// Initiator LA through the header CRC
const COMMAND_TRAILER_LEN: usize = 12;
const WRITE_REPLY_LEN: usize = 8;
const READ_REPLY_HEADER_LEN: usize = 12;

/// One outbound RMAP request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    pub kind: CommandKind,
    /// Ask the target to verify the data before writing (writes only)
    pub verify: bool,
    /// Ask the target for a reply. Reads and RMWs always get one.
    pub acknowledge: bool,
    /// Increment the memory address for every byte instead of hitting the same location
    pub increment: bool,
    pub key: u8,
    pub extended_address: u8,
    pub address: u32,
    /// Bytes requested for reads, payload bytes otherwise
    pub data_length: u32,
    pub transaction_id: u16,
    /// Payload for writes, data followed by mask for RMWs, empty for reads
    pub data: Vec<u8>,
}

fn clamp_len(len: usize) -> u32 {
    u32::try_from(len).unwrap_or(u32::MAX)
}

impl Command {
    /// An incrementing read of `length` bytes from `address`
    #[must_use]
    pub fn read(address: u32, length: u32) -> Self {
        Self {
            kind: CommandKind::Read,
            verify: false,
            acknowledge: true,
            increment: true,
            key: 0,
            extended_address: 0,
            address,
            data_length: length,
            transaction_id: 0,
            data: vec![],
        }
    }

    /// An acknowledged, unverified, incrementing write of `data` to `address`
    #[must_use]
    pub fn write(address: u32, data: impl Into<Vec<u8>>) -> Self {
        let data = data.into();
        Self {
            kind: CommandKind::Write,
            verify: false,
            acknowledge: true,
            increment: true,
            key: 0,
            extended_address: 0,
            address,
            data_length: clamp_len(data.len()),
            transaction_id: 0,
            data,
        }
    }

    /// Atomically replace the bits selected by `mask` with `data`, getting back what was there
    /// # Errors
    /// Returns an error if `data` and `mask` differ in length or aren't 1 to 4 bytes
    pub fn read_modify_write(address: u32, data: &[u8], mask: &[u8]) -> Result<Self> {
        if data.len() != mask.len() || !(1..=4).contains(&data.len()) {
            return Err(Error::InvalidDataLength {
                kind: CommandKind::ReadModifyWrite,
                len: data.len() + mask.len(),
            });
        }
        let mut payload = data.to_vec();
        payload.extend_from_slice(mask);
        Ok(Self {
            kind: CommandKind::ReadModifyWrite,
            verify: true,
            acknowledge: true,
            increment: true,
            key: 0,
            extended_address: 0,
            address,
            data_length: clamp_len(payload.len()),
            transaction_id: 0,
            data: payload,
        })
    }

    #[must_use]
    pub fn with_transaction_id(mut self, transaction_id: u16) -> Self {
        self.transaction_id = transaction_id;
        self
    }

    #[must_use]
    pub fn with_key(mut self, key: u8) -> Self {
        self.key = key;
        self
    }

    #[must_use]
    pub fn with_extended_address(mut self, extended_address: u8) -> Self {
        self.extended_address = extended_address;
        self
    }

    #[must_use]
    pub fn with_verify(mut self, verify: bool) -> Self {
        self.verify = verify;
        self
    }

    #[must_use]
    pub fn with_acknowledge(mut self, acknowledge: bool) -> Self {
        self.acknowledge = acknowledge;
        self
    }

    #[must_use]
    pub fn with_increment(mut self, increment: bool) -> Self {
        self.increment = increment;
        self
    }

    /// Whether the target will answer this command
    #[must_use]
    pub fn expects_reply(&self) -> bool {
        match self.kind {
            CommandKind::Read | CommandKind::ReadModifyWrite => true,
            CommandKind::Write => self.acknowledge,
        }
    }

    /// The number of data bytes a successful reply carries
    #[must_use]
    pub fn reply_data_length(&self) -> u32 {
        match self.kind {
            CommandKind::Read => self.data_length,
            CommandKind::Write => 0,
            CommandKind::ReadModifyWrite => self.data_length / 2,
        }
    }

    /// The instruction field for this command, given the length of the reply path
    #[must_use]
    pub fn instruction(&self, reply_address_words: ReplyAddressWords) -> Instruction {
        let (write, verify, reply, increment) = match self.kind {
            CommandKind::Read => (false, false, true, self.increment),
            CommandKind::Write => (true, self.verify, self.acknowledge, self.increment),
            CommandKind::ReadModifyWrite => (false, true, true, true),
        };
        Instruction {
            reply_address_words,
            increment,
            reply,
            verify,
            write,
            command: true,
            reserved: false,
        }
    }
}

fn payload_length(kind: CommandKind, data: &[u8]) -> Result<u32> {
    let len = u32::try_from(data.len())
        .ok()
        .filter(|&len| len <= MAX_DATA_LENGTH)
        .ok_or(Error::PayloadTooLarge(data.len()))?;
    if kind == CommandKind::ReadModifyWrite && !matches!(len, 2 | 4 | 6 | 8) {
        return Err(Error::InvalidDataLength {
            kind,
            len: data.len(),
        });
    }
    Ok(len)
}

fn push_u24(bytes: &mut Vec<u8>, value: u32) {
    bytes.extend_from_slice(&value.to_be_bytes()[1..]);
}

/// Serialize `command` for `target`. The output is deterministic, so encoding the same command
/// twice yields the same bytes, which is what retransmission relies on.
/// # Errors
/// Returns an error if the target paths are invalid or the data doesn't fit the length field
pub fn encode_command(command: &Command, target: &TargetNode) -> Result<Vec<u8>> {
    let mut bytes = address::encode_outbound_path(target.spacewire_address())?;
    let reply_field = address::encode_reply_path(target.reply_address())?;
    let reply_words = ReplyAddressWords::for_path_len(target.reply_address().len())?;
    let data_length = match command.kind {
        CommandKind::Read => {
            if command.data_length > MAX_DATA_LENGTH {
                return Err(Error::PayloadTooLarge(command.data_length as usize));
            }
            command.data_length
        }
        CommandKind::Write | CommandKind::ReadModifyWrite => {
            payload_length(command.kind, &command.data)?
        }
    };
    let header_start = bytes.len();
    bytes.push(target.logical_address());
    bytes.push(PROTOCOL_ID);
    bytes.push(command.instruction(reply_words).to_byte());
    bytes.push(command.key);
    bytes.extend_from_slice(&reply_field);
    bytes.push(target.initiator_logical_address());
    bytes.extend_from_slice(&command.transaction_id.to_be_bytes());
    bytes.push(command.extended_address);
    bytes.extend_from_slice(&command.address.to_be_bytes());
    push_u24(&mut bytes, data_length);
    bytes.push(crc::crc8(&bytes[header_start..]));
    if command.kind != CommandKind::Read {
        bytes.extend_from_slice(&command.data);
        bytes.push(crc::crc8(&command.data));
    }
    Ok(bytes)
}

/// One inbound RMAP response
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    /// The kind of command this answers
    pub kind: CommandKind,
    /// The instruction field of the command this answers
    pub instruction: Instruction,
    /// Path address bytes in front of the reply (usually consumed by the routers)
    pub reply_address: Vec<u8>,
    /// Raw status byte, zero on success
    pub status: u8,
    pub initiator_logical_address: u8,
    pub target_logical_address: u8,
    pub transaction_id: u16,
    pub data_length: u32,
    /// Data read back, empty for write replies
    pub data: Vec<u8>,
}

impl Reply {
    /// The decoded status, `None` for codes the standard reserves
    #[must_use]
    pub fn status(&self) -> Option<Status> {
        Status::from_code(self.status)
    }

    #[must_use]
    pub fn is_success(&self) -> bool {
        self.status == 0
    }
}

/// Serialize a reply, as a target would
/// # Errors
/// Returns an error if the instruction disagrees with `kind`, the reply path is invalid, or the
/// data doesn't fit the length field
pub fn encode_reply(reply: &Reply) -> Result<Vec<u8>> {
    if reply.instruction.kind()? != reply.kind {
        return Err(Error::MalformedPacket(
            "instruction doesn't encode the reply kind",
        ));
    }
    let mut bytes = address::encode_outbound_path(&reply.reply_address)?;
    let header_start = bytes.len();
    bytes.push(reply.initiator_logical_address);
    bytes.push(PROTOCOL_ID);
    bytes.push(reply.instruction.as_reply().to_byte());
    bytes.push(reply.status);
    bytes.push(reply.target_logical_address);
    bytes.extend_from_slice(&reply.transaction_id.to_be_bytes());
    if reply.kind == CommandKind::Write {
        bytes.push(crc::crc8(&bytes[header_start..]));
        return Ok(bytes);
    }
    let data_length = payload_length(CommandKind::Read, &reply.data)?;
    bytes.push(0);
    push_u24(&mut bytes, data_length);
    bytes.push(crc::crc8(&bytes[header_start..]));
    bytes.extend_from_slice(&reply.data);
    bytes.push(crc::crc8(&reply.data));
    Ok(bytes)
}

/// Checks a field whose last byte is its CRC
fn check_crc(field: CrcField, bytes: &[u8]) -> Result<()> {
    let (body, expected) = bytes.split_at(bytes.len() - 1);
    let actual = crc::crc8(body);
    if actual == expected[0] {
        Ok(())
    } else {
        Err(Error::CrcMismatch {
            field,
            expected: expected[0],
            actual,
        })
    }
}

/// Peel leading path address bytes off a packet
fn split_path(bytes: &[u8]) -> Result<(&[u8], &[u8])> {
    let start = bytes
        .iter()
        .position(|&b| b >= LOGICAL_ADDRESS_MIN)
        .ok_or(Error::MalformedPacket("no header after the path address"))?;
    Ok(bytes.split_at(start))
}

fn truncated<E>(_: E) -> Error {
    Error::MalformedPacket("truncated header")
}

/// (initiator LA, protocol ID, instruction, status, target LA, transaction ID)
type ReplyHeader = (u8, u8, u8, u8, u8, u16);

fn reply_header(input: &[u8]) -> IResult<&[u8], ReplyHeader> {
    tuple((be_u8, be_u8, be_u8, be_u8, be_u8, be_u16))(input)
}

fn reply_data_length(input: &[u8]) -> IResult<&[u8], u32> {
    let (remaining, _reserved) = be_u8(input)?;
    be_u24(remaining)
}

/// Parse and validate a reply packet
/// # Errors
/// Returns an error if the bytes aren't an RMAP reply, the size is wrong, or either CRC fails
pub fn decode_reply(bytes: &[u8]) -> Result<Reply> {
    let (reply_address, packet) = split_path(bytes)?;
    if packet.len() < WRITE_REPLY_LEN {
        return Err(Error::MalformedPacket("truncated header"));
    }
    if packet[1] != PROTOCOL_ID {
        return Err(Error::ProtocolIdMismatch(packet[1]));
    }
    let instruction = Instruction::from_byte(packet[2])?;
    if instruction.command {
        return Err(Error::MalformedPacket("expected a reply, got a command"));
    }
    let kind = instruction.kind()?;
    let header_len = if kind == CommandKind::Write {
        if packet.len() != WRITE_REPLY_LEN {
            return Err(Error::MalformedPacket("write replies are exactly 8 bytes"));
        }
        WRITE_REPLY_LEN
    } else {
        if packet.len() < READ_REPLY_HEADER_LEN {
            return Err(Error::MalformedPacket("truncated header"));
        }
        READ_REPLY_HEADER_LEN
    };
    check_crc(CrcField::Header, &packet[..header_len])?;
    let (remaining, (initiator, _, _, status, target, transaction_id)) =
        reply_header(packet).map_err(truncated)?;
    let mut reply = Reply {
        kind,
        instruction: Instruction {
            command: true,
            ..instruction
        },
        reply_address: reply_address.to_vec(),
        status,
        initiator_logical_address: initiator,
        target_logical_address: target,
        transaction_id,
        data_length: 0,
        data: vec![],
    };
    if kind == CommandKind::Write {
        return Ok(reply);
    }
    let (_, data_length) = reply_data_length(remaining).map_err(truncated)?;
    if packet.len() != header_len + data_length as usize + 1 {
        return Err(Error::MalformedPacket(
            "data length disagrees with the packet size",
        ));
    }
    check_crc(CrcField::Data, &packet[header_len..])?;
    reply.data_length = data_length;
    reply.data = packet[header_len..packet.len() - 1].to_vec();
    Ok(reply)
}

/// A command as seen by a target
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedCommand {
    pub command: Command,
    pub instruction: Instruction,
    pub target_address: Vec<u8>,
    pub reply_address: Vec<u8>,
    pub target_logical_address: u8,
    pub initiator_logical_address: u8,
}

impl DecodedCommand {
    /// Build the reply a target sends back for this command
    #[must_use]
    pub fn reply(&self, status: Status, data: Vec<u8>) -> Reply {
        Reply {
            kind: self.command.kind,
            instruction: self.instruction,
            reply_address: vec![],
            status: status.code(),
            initiator_logical_address: self.initiator_logical_address,
            target_logical_address: self.target_logical_address,
            transaction_id: self.command.transaction_id,
            data_length: clamp_len(data.len()),
            data,
        }
    }
}

/// (target LA, protocol ID, instruction, key)
type CommandPreamble = (u8, u8, u8, u8);
/// (initiator LA, transaction ID, extended address, address, data length)
type CommandTrailer = (u8, u16, u8, u32, u32);

fn command_preamble(input: &[u8]) -> IResult<&[u8], CommandPreamble> {
    tuple((be_u8, be_u8, be_u8, be_u8))(input)
}

fn command_trailer(input: &[u8]) -> IResult<&[u8], CommandTrailer> {
    tuple((be_u8, be_u16, be_u8, be_u32, be_u24))(input)
}

/// Parse and validate a command packet, including any leading target path bytes
/// # Errors
/// Returns an error if the bytes aren't an RMAP command, the size is wrong, or either CRC fails
pub fn decode_command(bytes: &[u8]) -> Result<DecodedCommand> {
    let (target_address, packet) = split_path(bytes)?;
    if packet.len() < COMMAND_PREAMBLE_LEN {
        return Err(Error::MalformedPacket("truncated header"));
    }
    if packet[1] != PROTOCOL_ID {
        return Err(Error::ProtocolIdMismatch(packet[1]));
    }
    let instruction = Instruction::from_byte(packet[2])?;
    if !instruction.command {
        return Err(Error::MalformedPacket("expected a command, got a reply"));
    }
    let kind = instruction.kind()?;
    let reply_len = instruction.reply_address_len();
    let header_len = COMMAND_PREAMBLE_LEN + reply_len + COMMAND_TRAILER_LEN;
    if packet.len() < header_len {
        return Err(Error::MalformedPacket("truncated header"));
    }
    check_crc(CrcField::Header, &packet[..header_len])?;
    let (remaining, (target, _, _, key)) = command_preamble(packet).map_err(truncated)?;
    let (remaining, reply_field) =
        take::<_, _, nom::error::Error<&[u8]>>(reply_len)(remaining).map_err(truncated)?;
    let (_, (initiator, transaction_id, extended_address, address, data_length)) =
        command_trailer(remaining).map_err(truncated)?;
    let reply_address = address::decode_path(reply_field, reply_len)?;
    let data = if kind == CommandKind::Read {
        if packet.len() != header_len {
            return Err(Error::MalformedPacket("read commands carry no data"));
        }
        vec![]
    } else {
        if packet.len() != header_len + data_length as usize + 1 {
            return Err(Error::MalformedPacket(
                "data length disagrees with the packet size",
            ));
        }
        check_crc(CrcField::Data, &packet[header_len..])?;
        packet[header_len..packet.len() - 1].to_vec()
    };
    Ok(DecodedCommand {
        command: Command {
            kind,
            verify: instruction.verify,
            acknowledge: instruction.reply,
            increment: instruction.increment,
            key,
            extended_address,
            address,
            data_length,
            transaction_id,
            data,
        },
        instruction,
        target_address: target_address.to_vec(),
        reply_address,
        target_logical_address: target,
        initiator_logical_address: initiator,
    })
}
