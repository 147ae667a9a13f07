// Core ID types for the lockstep protocol.
//
// Lightweight newtypes shared by `message.rs`, `turn.rs`, and the relay's
// controllers. Two identities coexist for every player: a stable `PlayerId`
// string that survives reconnects, and a compact `PlayerSlot` assigned once
// by the server for the lifetime of a match. `ConnectionId` is the
// transport's handle for one connection and changes on every reconnect.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Stable player identity chosen by the client. Never assigned by the server.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PlayerId(pub String);

impl From<&str> for PlayerId {
    fn from(value: &str) -> Self {
        Self(value.to_owned())
    }
}

impl fmt::Display for PlayerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Server-assigned position of a player within a match. Assigned from a
/// free pool on first ready and never reused while the match runs.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PlayerSlot(pub u8);

impl PlayerSlot {
    pub fn index(self) -> usize {
        usize::from(self.0)
    }
}

/// Zero-based turn index. Strictly increasing and gap-free per stream.
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct TurnNumber(pub u32);

impl TurnNumber {
    /// Turn `n` steps after this one.
    pub fn offset(self, n: u32) -> Self {
        Self(self.0.saturating_add(n))
    }
}

impl fmt::Display for TurnNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Per-client monotonic command ordinal. Retries reuse the original ordinal
/// so the server can discard duplicates.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CommandId(pub u32);

/// Transport-assigned connection handle.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ConnectionId(pub u32);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}
