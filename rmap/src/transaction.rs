//! Bookkeeping for the transactions still waiting on a reply.
//!
//! The table is generic over a completion slot `S` so the caller decides how an outcome gets
//! delivered (a channel, a waker, nothing at all). The table itself never blocks and never looks
//! at the clock; deadlines are handed in and compared against whatever `now` the caller sweeps
//! with, which should come from a monotonic source.

use crate::{
    packet::{
        Command,
        Reply,
    },
    Error,
    Result,
};
use std::{
    collections::{
        hash_map::Entry,
        HashMap,
    },
    ops::RangeInclusive,
    time::Instant,
};
use tracing::trace;

/// An in-flight transaction
#[derive(Debug)]
pub struct PendingTransaction<S> {
    pub transaction_id: u16,
    /// The command as sent, kept around to assemble the result
    pub command: Command,
    /// When this attempt gives up waiting
    pub deadline: Instant,
    /// Retransmissions so far
    pub retries: usize,
    /// Where the outcome goes
    pub slot: S,
}

/// In-flight transactions keyed by transaction ID
#[derive(Debug)]
pub struct TransactionTable<S> {
    pending: HashMap<u16, PendingTransaction<S>>,
    ids: RangeInclusive<u16>,
    next: u16,
}

impl<S> Default for TransactionTable<S> {
    fn default() -> Self {
        Self::new()
    }
}

impl<S> TransactionTable<S> {
    /// An empty table allocating from the full 16-bit ID space
    #[must_use]
    pub fn new() -> Self {
        Self::with_id_range(0..=u16::MAX)
    }

    /// An empty table that only hands out IDs from `ids`
    #[must_use]
    pub fn with_id_range(ids: RangeInclusive<u16>) -> Self {
        Self {
            pending: HashMap::new(),
            next: *ids.start(),
            ids,
        }
    }

    /// Start tracking `command` under `transaction_id`
    /// # Errors
    /// Returns an error if that ID is already pending
    pub fn register(
        &mut self,
        transaction_id: u16,
        command: Command,
        deadline: Instant,
        slot: S,
    ) -> Result<&mut PendingTransaction<S>> {
        match self.pending.entry(transaction_id) {
            Entry::Occupied(_) => Err(Error::DuplicateTransactionId(transaction_id)),
            Entry::Vacant(v) => {
                trace!(transaction_id, "Registered transaction");
                Ok(v.insert(PendingTransaction {
                    transaction_id,
                    command,
                    deadline,
                    retries: 0,
                    slot,
                }))
            }
        }
    }

    /// Match `reply` against the pending transactions, removing the entry it answers
    /// # Errors
    /// Returns an error if nothing is waiting on that transaction ID
    pub fn resolve(&mut self, reply: &Reply) -> Result<PendingTransaction<S>> {
        self.pending
            .remove(&reply.transaction_id)
            .ok_or(Error::UnsolicitedReply(reply.transaction_id))
    }

    /// Remove and yield every entry whose deadline is at or before `now`.
    ///
    /// The set of expired IDs is fixed when this is called, entries are pulled out as the
    /// iterator is advanced. Dropping the iterator early leaves the rest in the table.
    pub fn expire(&mut self, now: Instant) -> impl Iterator<Item = PendingTransaction<S>> + '_ {
        let expired: Vec<u16> = self
            .pending
            .values()
            .filter(|p| p.deadline <= now)
            .map(|p| p.transaction_id)
            .collect();
        expired
            .into_iter()
            .filter_map(move |id| self.pending.remove(&id))
    }

    /// Stop tracking a transaction, so a late reply to it is unsolicited
    pub fn cancel(&mut self, transaction_id: u16) -> Option<PendingTransaction<S>> {
        self.pending.remove(&transaction_id)
    }

    /// Remove every pending entry
    pub fn drain(&mut self) -> impl Iterator<Item = PendingTransaction<S>> + '_ {
        self.pending.drain().map(|(_, p)| p)
    }

    #[must_use]
    pub fn get(&self, transaction_id: u16) -> Option<&PendingTransaction<S>> {
        self.pending.get(&transaction_id)
    }

    #[must_use]
    pub fn contains(&self, transaction_id: u16) -> bool {
        self.pending.contains_key(&transaction_id)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// The soonest deadline among the pending entries
    #[must_use]
    pub fn next_deadline(&self) -> Option<Instant> {
        self.pending.values().map(|p| p.deadline).min()
    }

    /// Pick the next free transaction ID.
    ///
    /// IDs come from a counter that walks the configured range and wraps, skipping whatever is
    /// still pending. The ID isn't reserved until it is registered.
    /// # Errors
    /// Returns an error if every ID in the range is pending
    pub fn allocate(&mut self) -> Result<u16> {
        let (start, end) = (*self.ids.start(), *self.ids.end());
        if start > end {
            return Err(Error::TransactionTableFull);
        }
        let span = usize::from(end - start) + 1;
        for _ in 0..span {
            let candidate = if self.ids.contains(&self.next) {
                self.next
            } else {
                start
            };
            self.next = if candidate == end { start } else { candidate + 1 };
            if !self.pending.contains_key(&candidate) {
                return Ok(candidate);
            }
        }
        Err(Error::TransactionTableFull)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn later(ms: u64) -> Instant {
        Instant::now() + Duration::from_millis(ms)
    }

    fn reply_to(transaction_id: u16) -> Reply {
        use crate::{
            instruction::CommandKind,
            Instruction,
        };
        Reply {
            kind: CommandKind::Read,
            instruction: Instruction::from_byte(0x4C).unwrap(),
            reply_address: vec![],
            status: 0,
            initiator_logical_address: 0xFE,
            target_logical_address: 0xFE,
            transaction_id,
            data_length: 0,
            data: vec![],
        }
    }

    #[test]
    fn test_register_unique() {
        let mut table = TransactionTable::new();
        table.register(5, Command::read(0, 4), later(100), ()).unwrap();
        assert_eq!(
            table
                .register(5, Command::read(4, 4), later(100), ())
                .unwrap_err(),
            Error::DuplicateTransactionId(5)
        );
        assert_eq!(table.len(), 1);
        assert_eq!(table.get(5).unwrap().command.address, 0);
    }

    #[test]
    fn test_resolve() {
        let mut table = TransactionTable::new();
        table
            .register(1, Command::read(0x10, 4), later(100), "one")
            .unwrap();
        table
            .register(2, Command::read(0x20, 4), later(100), "two")
            .unwrap();
        let pending = table.resolve(&reply_to(2)).unwrap();
        assert_eq!(pending.slot, "two");
        assert_eq!(pending.command.address, 0x20);
        assert!(table.contains(1));
        assert!(!table.contains(2));
        assert_eq!(
            table.resolve(&reply_to(2)).unwrap_err(),
            Error::UnsolicitedReply(2)
        );
        assert!(table.contains(1));
    }

    #[test]
    fn test_expire() {
        let mut table = TransactionTable::new();
        let now = Instant::now();
        table
            .register(1, Command::read(0, 4), now - Duration::from_millis(1), ())
            .unwrap();
        table.register(2, Command::read(0, 4), now, ()).unwrap();
        table
            .register(3, Command::read(0, 4), now + Duration::from_secs(60), ())
            .unwrap();
        let mut expired: Vec<u16> = table.expire(now).map(|p| p.transaction_id).collect();
        expired.sort_unstable();
        assert_eq!(expired, vec![1, 2]);
        assert_eq!(table.len(), 1);
        // Nothing left to expire at the same instant
        assert_eq!(table.expire(now).count(), 0);
        assert_eq!(table.next_deadline(), Some(now + Duration::from_secs(60)));
    }

    #[test]
    fn test_reregister_after_expiry() {
        let mut table = TransactionTable::new();
        let now = Instant::now();
        table.register(9, Command::read(0, 4), now, ()).unwrap();
        assert_eq!(table.expire(now).count(), 1);
        assert!(table.register(9, Command::read(0, 4), later(100), ()).is_ok());
    }

    #[test]
    fn test_cancel() {
        let mut table = TransactionTable::new();
        table.register(3, Command::read(0, 4), later(100), ()).unwrap();
        assert!(table.cancel(3).is_some());
        assert!(table.cancel(3).is_none());
        assert!(table.resolve(&reply_to(3)).is_err());
        assert!(table.is_empty());
    }

    #[test]
    fn test_allocate_monotonic() {
        let mut table: TransactionTable<()> = TransactionTable::new();
        assert_eq!(table.allocate().unwrap(), 0);
        assert_eq!(table.allocate().unwrap(), 1);
        assert_eq!(table.allocate().unwrap(), 2);
    }

    #[test]
    fn test_allocate_skips_pending_and_wraps() {
        let mut table = TransactionTable::with_id_range(10..=13);
        table.register(11, Command::read(0, 4), later(100), ()).unwrap();
        assert_eq!(table.allocate().unwrap(), 10);
        assert_eq!(table.allocate().unwrap(), 12);
        assert_eq!(table.allocate().unwrap(), 13);
        assert_eq!(table.allocate().unwrap(), 10);
    }

    #[test]
    fn test_allocate_full() {
        let mut table = TransactionTable::with_id_range(0..=2);
        for id in 0..=2 {
            table.register(id, Command::read(0, 4), later(100), ()).unwrap();
        }
        assert_eq!(table.allocate().unwrap_err(), Error::TransactionTableFull);
        table.cancel(1);
        assert_eq!(table.allocate().unwrap(), 1);
    }

    #[test]
    fn test_allocate_wraps_full_range() {
        let mut table: TransactionTable<()> = TransactionTable::new();
        table.next = u16::MAX;
        assert_eq!(table.allocate().unwrap(), u16::MAX);
        assert_eq!(table.allocate().unwrap(), 0);
    }

    #[test]
    fn test_drain() {
        let mut table = TransactionTable::new();
        for id in 0..4 {
            table.register(id, Command::read(0, 4), later(100), ()).unwrap();
        }
        assert_eq!(table.drain().count(), 4);
        assert!(table.is_empty());
    }
}
