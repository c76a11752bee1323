//! The core configuration types shared by the initiator and its transports

use std::{
    ops::RangeInclusive,
    time::Duration,
};

const DEFAULT_TIMEOUT: Duration = Duration::from_millis(500);
const DEFAULT_RETRIES: usize = 2;
const DEFAULT_BUFFER_SIZE: usize = 4096;
const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// How long each stage of a transaction is allowed to take
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Timeouts {
    /// Bound on establishing the connection (per resolved address)
    pub connect: Duration,
    /// How long one attempt waits for its reply
    pub read: Duration,
    /// Bound on pushing a frame into the socket
    pub write: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            connect: DEFAULT_TIMEOUT,
            read: DEFAULT_TIMEOUT,
            write: DEFAULT_TIMEOUT,
        }
    }
}

/// What a transport does with a frame that doesn't fit its buffer
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub enum BufferPolicy {
    /// Refuse outbound frames and skip inbound frames that don't fit
    Fixed,
    /// Grow the buffer as needed
    #[default]
    AutoResize,
}

/// Session configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub timeouts: Timeouts,
    /// Retransmissions after the first attempt
    pub retries: usize,
    pub send_buffer_size: usize,
    pub recv_buffer_size: usize,
    pub buffer_policy: BufferPolicy,
    /// The transaction IDs this initiator may hand out
    pub transaction_ids: RangeInclusive<u16>,
    /// How often the reader wakes up to sweep for timeouts when nothing is arriving
    pub poll_interval: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            timeouts: Timeouts::default(),
            retries: DEFAULT_RETRIES,
            send_buffer_size: DEFAULT_BUFFER_SIZE,
            recv_buffer_size: DEFAULT_BUFFER_SIZE,
            buffer_policy: BufferPolicy::default(),
            transaction_ids: 0..=u16::MAX,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }
}

impl Config {
    #[must_use]
    pub fn with_timeouts(mut self, connect: Duration, read: Duration, write: Duration) -> Self {
        self.timeouts = Timeouts {
            connect,
            read,
            write,
        };
        self
    }

    #[must_use]
    pub fn with_read_timeout(mut self, read: Duration) -> Self {
        self.timeouts.read = read;
        self
    }

    #[must_use]
    pub fn with_retries(mut self, retries: usize) -> Self {
        self.retries = retries;
        self
    }

    #[must_use]
    pub fn with_buffers(mut self, send: usize, recv: usize) -> Self {
        self.send_buffer_size = send;
        self.recv_buffer_size = recv;
        self
    }

    #[must_use]
    pub fn with_buffer_policy(mut self, policy: BufferPolicy) -> Self {
        self.buffer_policy = policy;
        self
    }

    #[must_use]
    pub fn with_transaction_ids(mut self, ids: RangeInclusive<u16>) -> Self {
        self.transaction_ids = ids;
        self
    }

    #[must_use]
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// The total number of times a command goes out before giving up
    #[must_use]
    pub fn attempts(&self) -> usize {
        self.retries + 1
    }

    /// How long a caller can be kept waiting on one transaction, retries included.
    /// Past this the caller stops waiting even if the reader never got around to expiring it.
    #[must_use]
    pub fn transaction_budget(&self) -> Duration {
        let attempts = u32::try_from(self.attempts()).unwrap_or(u32::MAX);
        // Expiry is only noticed on the next sweep, so every attempt can run a little long
        self.timeouts
            .read
            .saturating_add(self.poll_interval.saturating_mul(2))
            .saturating_mul(attempts)
            .saturating_add(self.poll_interval)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.timeouts.read, Duration::from_millis(500));
        assert_eq!(config.attempts(), 3);
        assert_eq!(config.buffer_policy, BufferPolicy::AutoResize);
        assert_eq!(config.transaction_ids, 0..=u16::MAX);
    }

    #[test]
    fn test_budget_covers_every_attempt() {
        let config = Config::default()
            .with_read_timeout(Duration::from_millis(100))
            .with_retries(1)
            .with_poll_interval(Duration::from_millis(5));
        assert_eq!(config.transaction_budget(), Duration::from_millis(225));
    }
}
