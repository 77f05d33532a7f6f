//! Core type definitions for snapdb.

use std::fmt;

/// Unique identifier for a registered connection.
///
/// Connection IDs are assigned by the coordinator and never reused within
/// one database lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ConnectionId(pub u64);

impl ConnectionId {
    /// Creates a new connection ID.
    #[must_use]
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    /// Returns the raw ID value.
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn:{}", self.0)
    }
}

/// Commit-order key for write transactions.
///
/// `ticks` comes from a monotonic tick counter unaffected by wall-clock
/// changes; `seq` is a strictly increasing sequence counter that breaks
/// same-tick ties. The pair gives every commit a strict total order even
/// when two commits land on the same tick.
///
/// Ordering is lexicographic on `(ticks, seq)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct WriteTimestamp {
    ticks: u64,
    seq: u64,
}

impl WriteTimestamp {
    /// The zero timestamp, older than every commit.
    pub const ZERO: Self = Self { ticks: 0, seq: 0 };

    /// Size of the encoded form in bytes.
    pub const ENCODED_LEN: usize = 16;

    /// Creates a timestamp from raw parts.
    #[must_use]
    pub const fn new(ticks: u64, seq: u64) -> Self {
        Self { ticks, seq }
    }

    /// Returns the monotonic tick component.
    #[must_use]
    pub const fn ticks(self) -> u64 {
        self.ticks
    }

    /// Returns the sequence component.
    #[must_use]
    pub const fn seq(self) -> u64 {
        self.seq
    }

    /// Encodes the timestamp for the persisted last-write marker.
    #[must_use]
    pub fn encode(self) -> [u8; Self::ENCODED_LEN] {
        let mut buf = [0u8; Self::ENCODED_LEN];
        buf[..8].copy_from_slice(&self.ticks.to_le_bytes());
        buf[8..].copy_from_slice(&self.seq.to_le_bytes());
        buf
    }

    /// Decodes a persisted marker. Returns `None` on a malformed length.
    #[must_use]
    pub fn decode(bytes: &[u8]) -> Option<Self> {
        if bytes.len() != Self::ENCODED_LEN {
            return None;
        }
        let mut ticks = [0u8; 8];
        let mut seq = [0u8; 8];
        ticks.copy_from_slice(&bytes[..8]);
        seq.copy_from_slice(&bytes[8..]);
        Some(Self {
            ticks: u64::from_le_bytes(ticks),
            seq: u64::from_le_bytes(seq),
        })
    }
}

impl fmt::Display for WriteTimestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ts:{}.{}", self.ticks, self.seq)
    }
}
