use std::time::Duration;

use serde::Deserialize;
use serde::Serialize;

use crate::Error;
use crate::Result;

/// Timing and durability parameters of the quorum protocol.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct QuorumConfig {
    /// The basic unit of time, in milliseconds
    #[serde(default = "default_tick_time_ms")]
    pub tick_time_ms: u64,

    /// Ticks a follower may take to connect and synchronize with a leader
    #[serde(default = "default_init_limit")]
    pub init_limit: u32,

    /// Ticks that may pass without traffic between leader and follower
    #[serde(default = "default_sync_limit")]
    pub sync_limit: u32,

    /// Election algorithm selector; only the datagram vote exchange (0) exists
    #[serde(default)]
    pub election_alg: u32,

    /// Committed transactions between two automatic snapshots
    #[serde(default = "default_snapshot_threshold")]
    pub snapshot_threshold: u64,

    /// Committed transactions kept in memory for diff synchronization
    #[serde(default = "default_max_committed_log")]
    pub max_committed_log: usize,

    /// Log segments grow in zero-filled chunks of this size
    #[serde(default = "default_preallocate_bytes")]
    pub preallocate_bytes: u64,

    /// A new segment is started once the active one passes this size
    #[serde(default = "default_segment_max_bytes")]
    pub segment_max_bytes: u64,
}

impl Default for QuorumConfig {
    fn default() -> Self {
        Self {
            tick_time_ms: default_tick_time_ms(),
            init_limit: default_init_limit(),
            sync_limit: default_sync_limit(),
            election_alg: 0,
            snapshot_threshold: default_snapshot_threshold(),
            max_committed_log: default_max_committed_log(),
            preallocate_bytes: default_preallocate_bytes(),
            segment_max_bytes: default_segment_max_bytes(),
        }
    }
}

impl QuorumConfig {
    pub fn validate(
        &self,
        ensemble_size: usize,
    ) -> Result<()> {
        if self.tick_time_ms == 0 {
            return Err(Error::config("tick_time_ms is not set"));
        }
        if ensemble_size > 1 && self.init_limit == 0 {
            return Err(Error::config("init_limit is not set"));
        }
        if ensemble_size > 1 && self.sync_limit == 0 {
            return Err(Error::config("sync_limit is not set"));
        }
        if self.election_alg != 0 {
            return Err(Error::config(format!(
                "election_alg {} is not supported",
                self.election_alg
            )));
        }
        if self.max_committed_log == 0 {
            return Err(Error::config("max_committed_log must be > 0"));
        }
        if self.preallocate_bytes == 0 {
            return Err(Error::config("preallocate_bytes must be > 0"));
        }
        if self.segment_max_bytes < self.preallocate_bytes {
            return Err(Error::config(format!(
                "segment_max_bytes {} should not be less than preallocate_bytes {}",
                self.segment_max_bytes, self.preallocate_bytes
            )));
        }
        Ok(())
    }

    #[inline]
    pub fn tick(&self) -> Duration {
        Duration::from_millis(self.tick_time_ms)
    }

    /// Window for a follower to connect and finish synchronization.
    #[inline]
    pub fn init_timeout(&self) -> Duration {
        self.tick() * self.init_limit.max(1)
    }

    /// Window in which some traffic must arrive from the other side.
    #[inline]
    pub fn sync_timeout(&self) -> Duration {
        self.tick() * self.sync_limit.max(1)
    }
}

fn default_tick_time_ms() -> u64 {
    2000
}
fn default_init_limit() -> u32 {
    10
}
fn default_sync_limit() -> u32 {
    5
}
fn default_snapshot_threshold() -> u64 {
    100_000
}
fn default_max_committed_log() -> usize {
    500
}
fn default_preallocate_bytes() -> u64 {
    64 * 1024
}
fn default_segment_max_bytes() -> u64 {
    64 * 1024 * 1024
}
