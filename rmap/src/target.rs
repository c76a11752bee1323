//! Descriptions of the remote devices we talk to

use crate::{
    address,
    Error,
    Result,
    DEFAULT_INITIATOR_LOGICAL_ADDRESS,
    MIN_LOGICAL_ADDRESS,
};

/// Logical addresses share their leading byte with path addresses, so anything below 0x20 would
/// be stripped off a reply as routing
fn check_logical_address(address: u8) -> Result<()> {
    if address < MIN_LOGICAL_ADDRESS {
        return Err(Error::InvalidAddress {
            path: vec![address],
            reason: "logical addresses below 0x20 are read as path bytes",
        });
    }
    Ok(())
}

/// Everything needed to address a remote RMAP target.
///
/// Paths are checked when the node is built, so every command aimed at a [`TargetNode`] has a
/// well-formed address. Nodes are cheap to clone and can be shared between any number of
/// operations.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TargetNode {
    logical_address: u8,
    spacewire_address: Vec<u8>,
    reply_address: Vec<u8>,
    initiator_logical_address: u8,
    key: u8,
}

impl TargetNode {
    /// Construct a new target node from its logical address, the path to reach it, and the path
    /// replies should take to get back to us
    /// # Errors
    /// Returns an error if either path is too long or contains the reserved port 0, or if the
    /// logical address is below 0x20
    pub fn new(
        logical_address: u8,
        spacewire_address: impl Into<Vec<u8>>,
        reply_address: impl Into<Vec<u8>>,
    ) -> Result<Self> {
        let spacewire_address = spacewire_address.into();
        let reply_address = reply_address.into();
        check_logical_address(logical_address)?;
        address::encode_outbound_path(&spacewire_address)?;
        address::encode_reply_path(&reply_address)?;
        Ok(Self {
            logical_address,
            spacewire_address,
            reply_address,
            initiator_logical_address: DEFAULT_INITIATOR_LOGICAL_ADDRESS,
            key: 0,
        })
    }

    /// Overrides the logical address we put in commands as the initiator
    /// # Errors
    /// Returns an error if `address` is below 0x20, since replies to it couldn't be told apart
    /// from their path
    pub fn with_initiator_logical_address(mut self, address: u8) -> Result<Self> {
        check_logical_address(address)?;
        self.initiator_logical_address = address;
        Ok(self)
    }

    /// Sets the (device specific) key the target expects in every command
    #[must_use]
    pub fn with_key(mut self, key: u8) -> Self {
        self.key = key;
        self
    }

    #[must_use]
    pub fn logical_address(&self) -> u8 {
        self.logical_address
    }

    #[must_use]
    pub fn spacewire_address(&self) -> &[u8] {
        &self.spacewire_address
    }

    #[must_use]
    pub fn reply_address(&self) -> &[u8] {
        &self.reply_address
    }

    #[must_use]
    pub fn initiator_logical_address(&self) -> u8 {
        self.initiator_logical_address
    }

    #[must_use]
    pub fn key(&self) -> u8 {
        self.key
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let node = TargetNode::new(0x34, [1, 2], [1, 3]).unwrap();
        assert_eq!(node.logical_address(), 0x34);
        assert_eq!(node.spacewire_address(), &[1, 2]);
        assert_eq!(node.reply_address(), &[1, 3]);
        assert_eq!(node.initiator_logical_address(), 0xFE);
        assert_eq!(node.key(), 0);
    }

    #[test]
    fn test_builders() {
        let node = TargetNode::new(0x20, vec![], vec![])
            .unwrap()
            .with_key(0xAB)
            .with_initiator_logical_address(0x35)
            .unwrap();
        assert_eq!(node.key(), 0xAB);
        assert_eq!(node.initiator_logical_address(), 0x35);
    }

    #[test]
    fn test_bad_paths() {
        assert!(matches!(
            TargetNode::new(0x34, [1, 0], [1, 3]),
            Err(Error::InvalidAddress { .. })
        ));
        assert!(matches!(
            TargetNode::new(0x34, [1, 2], vec![7; 13]),
            Err(Error::InvalidAddress { .. })
        ));
    }

    #[test]
    fn test_low_logical_addresses() {
        assert!(matches!(
            TargetNode::new(0x1F, [1, 2], [1, 3]),
            Err(Error::InvalidAddress { .. })
        ));
        let node = TargetNode::new(0x34, [1, 2], [1, 3]).unwrap();
        assert!(matches!(
            node.clone().with_initiator_logical_address(0x10),
            Err(Error::InvalidAddress { .. })
        ));
        assert!(node.with_initiator_logical_address(0x20).is_ok());
    }
}
