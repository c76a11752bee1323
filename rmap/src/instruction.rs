//! The instruction byte that follows the protocol identifier in every RMAP header

use crate::{
    Error,
    Result,
};
use packed_struct::prelude::*;
use std::fmt::Display;

/// Bit layout of the instruction field.
///
/// Replies carry the instruction of the command they answer with the packet type bits cleared.
#[derive(PackedStruct, Debug, Default, Copy, Clone, PartialEq, Eq)]
#[packed_struct(bit_numbering = "lsb0", size_bytes = "1")]
pub struct Instruction {
    #[packed_field(bits = "0..=1", ty = "enum")]
    /// Length of the reply address field in 4-byte words
    pub reply_address_words: ReplyAddressWords,
    #[packed_field(bits = "2")]
    /// Increment the memory address after every byte
    pub increment: bool,
    #[packed_field(bits = "3")]
    /// A reply is requested
    pub reply: bool,
    #[packed_field(bits = "4")]
    /// Verify the data before writing it
    pub verify: bool,
    #[packed_field(bits = "5")]
    /// Write (as opposed to read)
    pub write: bool,
    #[packed_field(bits = "6")]
    /// Command (as opposed to reply)
    pub command: bool,
    #[packed_field(bits = "7")]
    /// Reserved packet type bit, always clear
    pub reserved: bool,
}

/// The reply address field is 0 to 12 bytes, counted in words
#[derive(PrimitiveEnum, Debug, Default, Copy, Clone, PartialEq, Eq)]
pub enum ReplyAddressWords {
    #[default]
    Zero = 0,
    One = 1,
    Two = 2,
    Three = 3,
}

impl ReplyAddressWords {
    /// The smallest field that holds a reply path of `len` ports
    /// # Errors
    /// Returns an error if the path doesn't fit in 12 bytes
    pub fn for_path_len(len: usize) -> Result<Self> {
        u8::try_from(crate::address::reply_address_words(len))
            .ok()
            .and_then(Self::from_primitive)
            .ok_or(Error::MalformedPacket("reply address longer than 12 bytes"))
    }

    /// The field length in bytes
    #[must_use]
    pub fn len(self) -> usize {
        usize::from(self.to_primitive()) * 4
    }

    #[must_use]
    pub fn is_empty(self) -> bool {
        self == Self::Zero
    }
}

/// The three operations an RMAP command can ask for
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum CommandKind {
    Read,
    Write,
    ReadModifyWrite,
}

impl Display for CommandKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}",
            match self {
                CommandKind::Read => "read",
                CommandKind::Write => "write",
                CommandKind::ReadModifyWrite => "read-modify-write",
            }
        )
    }
}

impl Instruction {
    /// Pack into the single byte that goes on the wire
    #[must_use]
    pub fn to_byte(self) -> u8 {
        // Every field is in range by construction, so packing a single byte can't fail
        self.pack().map_or(0, |bytes| bytes[0])
    }

    /// Unpack from a received byte
    /// # Errors
    /// Returns an error if the reserved packet type bit is set
    pub fn from_byte(byte: u8) -> Result<Self> {
        let instruction = Self::unpack(&[byte])
            .map_err(|_| Error::MalformedPacket("unreadable instruction field"))?;
        if instruction.reserved {
            return Err(Error::MalformedPacket("reserved packet type"));
        }
        Ok(instruction)
    }

    /// The reply address length in bytes
    #[must_use]
    pub fn reply_address_len(&self) -> usize {
        self.reply_address_words.len()
    }

    /// Figure out which operation this instruction encodes from its command code bits
    /// # Errors
    /// Returns an error for the command codes the standard leaves unused
    pub fn kind(&self) -> Result<CommandKind> {
        match (self.write, self.verify, self.reply, self.increment) {
            (true, _, _, _) => Ok(CommandKind::Write),
            (false, false, true, _) => Ok(CommandKind::Read),
            (false, true, true, true) => Ok(CommandKind::ReadModifyWrite),
            _ => Err(Error::MalformedPacket("unused command code")),
        }
    }

    /// The instruction a target sends back in the reply to this command
    #[must_use]
    pub fn as_reply(self) -> Self {
        Self {
            command: false,
            ..self
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_incrementing() {
        let instruction = Instruction {
            reply_address_words: ReplyAddressWords::One,
            increment: true,
            reply: true,
            command: true,
            ..Default::default()
        };
        assert_eq!(instruction.to_byte(), 0b0100_1101);
        assert_eq!(instruction.kind().unwrap(), CommandKind::Read);
    }

    #[test]
    fn test_write_all_flags() {
        let instruction = Instruction {
            reply_address_words: ReplyAddressWords::Three,
            increment: true,
            reply: true,
            verify: true,
            write: true,
            command: true,
            ..Default::default()
        };
        assert_eq!(instruction.to_byte(), 0x7F);
        assert_eq!(Instruction::from_byte(0x7F).unwrap(), instruction);
    }

    #[test]
    fn test_reply_clears_command() {
        let command = Instruction::from_byte(0x4D).unwrap();
        assert_eq!(command.as_reply().to_byte(), 0x0D);
        assert_eq!(command.reply_address_len(), 4);
    }

    #[test]
    fn test_words_for_path() {
        assert_eq!(ReplyAddressWords::for_path_len(0).unwrap(), ReplyAddressWords::Zero);
        assert_eq!(ReplyAddressWords::for_path_len(2).unwrap(), ReplyAddressWords::One);
        assert_eq!(ReplyAddressWords::for_path_len(9).unwrap(), ReplyAddressWords::Three);
        assert!(ReplyAddressWords::for_path_len(13).is_err());
    }

    #[test]
    fn test_rmw() {
        let instruction = Instruction::from_byte(0b0101_1100).unwrap();
        assert_eq!(instruction.kind().unwrap(), CommandKind::ReadModifyWrite);
    }

    #[test]
    fn test_unused_codes() {
        // Read without a reply
        assert!(Instruction::from_byte(0b0100_0100).unwrap().kind().is_err());
        // Verified read that doesn't increment
        assert!(Instruction::from_byte(0b0101_1000).unwrap().kind().is_err());
        // Reserved packet type
        assert!(Instruction::from_byte(0b1000_1100).is_err());
    }
}
