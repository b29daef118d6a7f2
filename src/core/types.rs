use std::fmt;

use serde::Deserialize;
use serde::Serialize;

use crate::BroadcastError;
use crate::Result;

/// Unique, restart-stable identifier of a quorum peer.
pub type PeerId = u64;

/// Globally ordered transaction id.
///
/// The epoch is bumped each time a new leader is established, the counter
/// once per transaction inside an epoch. Field order gives the derived
/// `Ord` the same answer as comparing the packed `u64`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub struct Zxid {
    pub epoch: u32,
    pub counter: u32,
}

impl Zxid {
    pub const ZERO: Zxid = Zxid { epoch: 0, counter: 0 };

    pub const fn new(
        epoch: u32,
        counter: u32,
    ) -> Self {
        Self { epoch, counter }
    }

    /// First zxid issued by a leader of `epoch`.
    pub const fn first_of_epoch(epoch: u32) -> Self {
        Self { epoch, counter: 0 }
    }

    pub const fn from_u64(raw: u64) -> Self {
        Self {
            epoch: (raw >> 32) as u32,
            counter: raw as u32,
        }
    }

    pub const fn as_u64(&self) -> u64 {
        ((self.epoch as u64) << 32) | self.counter as u64
    }

    /// Next zxid in the same epoch. Counter exhaustion never carries into the
    /// epoch bits; the leader has to step down instead.
    pub fn next(&self) -> Result<Self> {
        match self.counter.checked_add(1) {
            Some(counter) => Ok(Self {
                epoch: self.epoch,
                counter,
            }),
            None => Err(BroadcastError::ZxidExhausted(self.epoch).into()),
        }
    }

    /// Lower-case hex of the packed value, as used in log and snapshot file names.
    pub fn to_hex(&self) -> String {
        format!("{:x}", self.as_u64())
    }

    pub fn from_hex(s: &str) -> Option<Self> {
        u64::from_str_radix(s, 16).ok().map(Self::from_u64)
    }
}

impl fmt::Display for Zxid {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        write!(f, "0x{:x}", self.as_u64())
    }
}

/// Election ballot: `id` is the candidate, `zxid` the candidate's last zxid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Vote {
    pub id: PeerId,
    pub zxid: Zxid,
}

impl Vote {
    pub fn new(
        id: PeerId,
        zxid: Zxid,
    ) -> Self {
        Self { id, zxid }
    }

    /// Higher zxid wins, ties go to the higher candidate id.
    #[inline]
    pub fn is_better_than(
        &self,
        other: &Vote,
    ) -> bool {
        self > other
    }
}

impl PartialOrd for Vote {
    fn partial_cmp(
        &self,
        other: &Self,
    ) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Vote {
    fn cmp(
        &self,
        other: &Self,
    ) -> std::cmp::Ordering {
        (self.zxid, self.id).cmp(&(other.zxid, other.id))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ServerState {
    Looking,
    Following,
    Leading,
}

impl ServerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ServerState::Looking => "LOOKING",
            ServerState::Following => "FOLLOWING",
            ServerState::Leading => "LEADING",
        }
    }
}

impl fmt::Display for ServerState {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A committed (or proposed) state mutation. The payload is opaque to the
/// quorum core.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    pub zxid: Zxid,
    pub payload: Vec<u8>,
}

impl Transaction {
    pub fn new(
        zxid: Zxid,
        payload: Vec<u8>,
    ) -> Self {
        Self { zxid, payload }
    }
}

/// Majority of a fixed peer set of size `n`.
#[inline]
pub fn quorum_size(n: usize) -> usize {
    n / 2 + 1
}
