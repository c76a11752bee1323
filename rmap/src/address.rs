//! SpaceWire path addressing.
//!
//! A path address is the list of router output ports a packet hops through. The target path is
//! consumed by the routers on the way out, so it goes on the wire as-is. The reply path travels
//! inside the command header in a field whose length is counted in 4-byte words, so it gets
//! padded out with *leading* zeros. Targets skip leading zeros when they turn the field back into
//! a path, which is why a zero port can never be part of a path.

use crate::{
    Error,
    Result,
    MAX_PATH_LENGTH,
};

fn validate(ports: &[u8]) -> Result<()> {
    if ports.len() > MAX_PATH_LENGTH {
        return Err(Error::InvalidAddress {
            path: ports.to_vec(),
            reason: "path is longer than 12 hops",
        });
    }
    if ports.contains(&0) {
        return Err(Error::InvalidAddress {
            path: ports.to_vec(),
            reason: "port 0 is reserved",
        });
    }
    Ok(())
}

/// The number of 4-byte words the reply address field takes up for a path of `len` ports
#[must_use]
pub fn reply_address_words(len: usize) -> usize {
    len.div_ceil(4)
}

/// Encode the path address bytes that lead a command packet to its target.
/// The empty path (a directly attached target) encodes to nothing.
/// # Errors
/// Returns an error if the path is too long or uses the reserved port 0
pub fn encode_outbound_path(ports: &[u8]) -> Result<Vec<u8>> {
    validate(ports)?;
    Ok(ports.to_vec())
}

/// Encode the reply address field, padded with leading zeros to a multiple of 4 bytes
/// # Errors
/// Returns an error if the path is too long or uses the reserved port 0
pub fn encode_reply_path(ports: &[u8]) -> Result<Vec<u8>> {
    validate(ports)?;
    let padded_len = reply_address_words(ports.len()) * 4;
    let mut bytes = vec![0u8; padded_len - ports.len()];
    bytes.extend_from_slice(ports);
    Ok(bytes)
}

/// Recover a reply path from the reply address field.
/// `declared_len` is the field length (in bytes) announced by the instruction byte.
/// # Errors
/// Returns an error if the field doesn't have the declared length
pub fn decode_path(bytes: &[u8], declared_len: usize) -> Result<Vec<u8>> {
    if bytes.len() != declared_len {
        return Err(Error::MalformedPacket(
            "reply address field doesn't match its declared length",
        ));
    }
    if declared_len % 4 != 0 || declared_len > MAX_PATH_LENGTH {
        return Err(Error::MalformedPacket(
            "reply address field must be 0, 4, 8, or 12 bytes",
        ));
    }
    Ok(bytes.iter().copied().skip_while(|&b| b == 0).collect())
}
