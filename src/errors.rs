//! Quorum Replication Error Hierarchy
//!
//! Defines the error types of the quorum peer, categorized by protocol layer
//! and operational concerns. Role-level errors never escape the peer loop:
//! they are logged, classified with [`Error::kind`] and answered by a return
//! to LOOKING.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use config::ConfigError;

use crate::PeerId;
use crate::Zxid;

#[doc(hidden)]
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Infrastructure-level failures (network, storage, serialization)
    #[error(transparent)]
    System(#[from] SystemError),

    /// Configuration validation failures, fatal at startup
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Election, broadcast and synchronization failures
    #[error(transparent)]
    Consensus(#[from] ConsensusError),

    /// The peer cannot serve client mutations right now (no leader, or the
    /// leader connection is in flux)
    #[error("Not currently serving: {0}")]
    NotServing(String),

    /// Unrecoverable failures requiring process termination
    #[error("Fatal error: {0}")]
    Fatal(String),
}

#[derive(Debug, thiserror::Error)]
pub enum SystemError {
    #[error(transparent)]
    Network(#[from] NetworkError),

    #[error(transparent)]
    Storage(#[from] StorageError),
}

#[derive(Debug, thiserror::Error)]
pub enum ConsensusError {
    #[error(transparent)]
    Election(#[from] ElectionError),

    #[error(transparent)]
    Broadcast(#[from] BroadcastError),

    #[error(transparent)]
    Sync(#[from] SyncError),
}

#[derive(Debug, thiserror::Error)]
pub enum ElectionError {
    /// Own id is missing from the peer set handed to the election
    #[error("Peer {0} is not a voting member")]
    NotAMember(PeerId),

    /// The configured retry budget ran out before a quorum agreed
    #[error("No quorum agreed after {rounds} rounds")]
    RoundsExhausted { rounds: usize },
}

#[derive(Debug, thiserror::Error)]
pub enum BroadcastError {
    /// Fewer than a quorum of peers are synchronized with the leader
    #[error("Quorum lost: {synced} of {required} required peers synchronized")]
    QuorumLost { synced: usize, required: usize },

    /// Not enough followers connected during epoch negotiation
    #[error("Quorum not reached within {0:?} while establishing a new epoch")]
    EpochNotEstablished(Duration),

    /// The counter half of the zxid is exhausted for this epoch
    #[error("Zxid counter exhausted in epoch {0}")]
    ZxidExhausted(u32),
}

#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    /// Peer sent a packet that is not valid at this point of the protocol
    #[error("Unexpected packet {got} while waiting for {expected}")]
    UnexpectedPacket { expected: &'static str, got: &'static str },

    /// Proposal zxid did not increase
    #[error("Out of order proposal {got} after {last}")]
    OutOfOrderProposal { last: Zxid, got: Zxid },

    /// Commit does not match the oldest pending proposal
    #[error("Out of order commit {got}, expected {expected:?}")]
    OutOfOrderCommit { expected: Option<Zxid>, got: Zxid },

    /// No traffic from the leader inside the sync window
    #[error("Leader {leader_id} silent for {timeout:?}")]
    LeaderTimeout { leader_id: PeerId, timeout: Duration },

    /// Leader announced an epoch older than one already accepted
    #[error("Stale epoch {got}, accepted epoch is {accepted}")]
    StaleEpoch { accepted: u32, got: u32 },

    /// Elected leader id does not map to a configured server
    #[error("Unknown leader {0}")]
    UnknownLeader(PeerId),
}

#[derive(Debug, thiserror::Error)]
pub enum NetworkError {
    #[error("Connect to {addr} failed: {source}")]
    ConnectFailed {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("Bind {addr} failed: {source}")]
    BindFailed {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("Retry timeout after {0:?}")]
    RetryTimeoutError(Duration),

    #[error("Connection closed by peer")]
    ConnectionClosed,

    #[error("Frame of {len} bytes exceeds limit {max}")]
    FrameTooLarge { len: usize, max: usize },

    #[error("Malformed packet: {0}")]
    MalformedPacket(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    SignalSendFailed(String),
}

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// Disk I/O failures during log/snapshot operations
    #[error(transparent)]
    IoError(#[from] std::io::Error),

    #[error("Error occurred at path: {path}")]
    PathError {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Serialization failures for persisted data
    #[error(transparent)]
    BincodeError(#[from] bincode::Error),

    /// State machine application errors
    #[error("State Machine error: {0}")]
    StateMachineError(String),

    /// Transaction log failures
    #[error("Log storage failure: {0}")]
    LogStorage(String),

    #[error("Data corruption detected at {location}")]
    DataCorruption { location: String },
}

impl Error {
    /// Short, stable label used for metrics and the status record.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::System(SystemError::Network(_)) => "network",
            Error::System(SystemError::Storage(_)) => "storage",
            Error::Config(_) => "config",
            Error::Consensus(ConsensusError::Election(_)) => "election",
            Error::Consensus(ConsensusError::Broadcast(BroadcastError::QuorumLost { .. })) => "quorum_lost",
            Error::Consensus(ConsensusError::Broadcast(_)) => "broadcast",
            Error::Consensus(ConsensusError::Sync(SyncError::LeaderTimeout { .. })) => "leader_timeout",
            Error::Consensus(ConsensusError::Sync(_)) => "protocol_violation",
            Error::NotServing(_) => "not_serving",
            Error::Fatal(_) => "fatal",
        }
    }

    pub(crate) fn config(msg: impl Into<String>) -> Self {
        Error::Config(ConfigError::Message(msg.into()))
    }
}

// Flatten the nested hierarchy so `?` works from any layer.

impl From<NetworkError> for Error {
    fn from(e: NetworkError) -> Self {
        Error::System(SystemError::Network(e))
    }
}

impl From<StorageError> for Error {
    fn from(e: StorageError) -> Self {
        Error::System(SystemError::Storage(e))
    }
}

impl From<ElectionError> for Error {
    fn from(e: ElectionError) -> Self {
        Error::Consensus(ConsensusError::Election(e))
    }
}

impl From<BroadcastError> for Error {
    fn from(e: BroadcastError) -> Self {
        Error::Consensus(ConsensusError::Broadcast(e))
    }
}

impl From<SyncError> for Error {
    fn from(e: SyncError) -> Self {
        Error::Consensus(ConsensusError::Sync(e))
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::System(SystemError::Storage(StorageError::IoError(e)))
    }
}

impl From<bincode::Error> for Error {
    fn from(e: bincode::Error) -> Self {
        Error::System(SystemError::Storage(StorageError::BincodeError(e)))
    }
}
