use tokio::sync::mpsc;
use tokio::sync::oneshot;

use crate::PeerId;
use crate::QuorumPacket;
use crate::Result;
use crate::Zxid;

/// Completion of a client submission: the zxid once it is committed locally.
pub(crate) type SubmitReply = oneshot::Sender<Result<Zxid>>;

/// Inputs of the leader loop.
#[derive(Debug)]
pub(crate) enum LeaderEvent {
    /// A follower connection finished its handshake
    FollowerConnected {
        conn_id: u64,
        peer_id: PeerId,
        last_zxid: Zxid,
        accepted_epoch: u32,
        outbound: mpsc::Sender<QuorumPacket>,
    },
    FollowerPacket {
        conn_id: u64,
        peer_id: PeerId,
        packet: QuorumPacket,
    },
    FollowerDisconnected {
        conn_id: u64,
        peer_id: PeerId,
        reason: String,
    },
    ClientPropose {
        payload: Vec<u8>,
        reply: SubmitReply,
    },
}

/// Inputs of the follower loop besides the leader stream.
#[derive(Debug)]
pub(crate) enum FollowerEvent {
    Forward { payload: Vec<u8>, reply: SubmitReply },
}
