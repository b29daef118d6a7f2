//! Leader/follower stream protocol.
//!
//! Every frame is a `u32` big-endian length followed by a bincode encoded
//! [`QuorumPacket`].

use serde::Deserialize;
use serde::Serialize;
use tokio::io::AsyncRead;
use tokio::io::AsyncReadExt;
use tokio::io::AsyncWrite;
use tokio::io::AsyncWriteExt;

use crate::NetworkError;
use crate::PeerId;
use crate::Result;
use crate::Transaction;
use crate::Zxid;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum QuorumPacket {
    /// First frame of a follower connection
    FollowerInfo {
        peer_id: PeerId,
        last_zxid: Zxid,
        accepted_epoch: u32,
    },
    /// Committed transactions the follower is missing, up to the leader's
    /// commit point `committed`
    Diff { txns: Vec<Transaction>, committed: Zxid },
    /// Full state image, replaces the follower's history
    Snapshot { zxid: Zxid, data: Vec<u8> },
    /// Ends synchronization, `zxid` is the leader's last committed zxid
    NewLeader { epoch: u32, zxid: Zxid },
    NewLeaderAck { epoch: u32 },
    Proposal { txn: Transaction },
    Ack { zxid: Zxid },
    Commit { zxid: Zxid },
    /// Liveness probe in both directions
    Ping { last_zxid: Zxid },
    /// Client mutation forwarded by a follower
    Request { request_id: u64, payload: Vec<u8> },
    RequestAccepted { request_id: u64, zxid: Zxid },
    RequestRejected { request_id: u64, reason: String },
}

impl QuorumPacket {
    pub fn name(&self) -> &'static str {
        match self {
            QuorumPacket::FollowerInfo { .. } => "FOLLOWERINFO",
            QuorumPacket::Diff { .. } => "DIFF",
            QuorumPacket::Snapshot { .. } => "SNAP",
            QuorumPacket::NewLeader { .. } => "NEWLEADER",
            QuorumPacket::NewLeaderAck { .. } => "NEWLEADER_ACK",
            QuorumPacket::Proposal { .. } => "PROPOSAL",
            QuorumPacket::Ack { .. } => "ACK",
            QuorumPacket::Commit { .. } => "COMMIT",
            QuorumPacket::Ping { .. } => "PING",
            QuorumPacket::Request { .. } => "REQUEST",
            QuorumPacket::RequestAccepted { .. } => "REQUEST_ACCEPTED",
            QuorumPacket::RequestRejected { .. } => "REQUEST_REJECTED",
        }
    }
}

pub async fn write_packet<W>(
    writer: &mut W,
    packet: &QuorumPacket,
    max_frame_bytes: usize,
) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let body = bincode::serialize(packet).map_err(|e| NetworkError::MalformedPacket(e.to_string()))?;
    if body.len() > max_frame_bytes {
        return Err(NetworkError::FrameTooLarge {
            len: body.len(),
            max: max_frame_bytes,
        }
        .into());
    }

    writer.write_u32(body.len() as u32).await.map_err(NetworkError::Io)?;
    writer.write_all(&body).await.map_err(NetworkError::Io)?;
    writer.flush().await.map_err(NetworkError::Io)?;
    Ok(())
}

/// Reads one frame. A clean EOF before the length prefix is reported as
/// `ConnectionClosed`.
pub async fn read_packet<R>(
    reader: &mut R,
    max_frame_bytes: usize,
) -> Result<QuorumPacket>
where
    R: AsyncRead + Unpin,
{
    let len = match reader.read_u32().await {
        Ok(len) => len as usize,
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
            return Err(NetworkError::ConnectionClosed.into());
        }
        Err(e) => return Err(NetworkError::Io(e).into()),
    };
    if len > max_frame_bytes {
        return Err(NetworkError::FrameTooLarge {
            len,
            max: max_frame_bytes,
        }
        .into());
    }

    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await.map_err(NetworkError::Io)?;
    let packet = bincode::deserialize(&body).map_err(|e| NetworkError::MalformedPacket(e.to_string()))?;
    Ok(packet)
}
