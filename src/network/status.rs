//! Status datagram: answers "who do you think leads, at which zxid".
//!
//! Request is a 4-byte xid. Response is 28 bytes big-endian:
//! `xid i32 | myid u64 | leader id u64 | leader zxid u64`. The same exchange
//! carries votes while peers are LOOKING.

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::net::Ipv6Addr;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::UdpSocket;
use tokio::sync::watch;
use tokio::time::timeout_at;
use tokio::time::Instant;
use tracing::debug;
use tracing::trace;
use tracing::warn;

use crate::constants::STATUS_REQUEST_LEN;
use crate::constants::STATUS_RESPONSE_LEN;
use crate::NetworkError;
use crate::PeerId;
use crate::PeerStatus;
use crate::QuorumServer;
use crate::Result;
use crate::Vote;
use crate::VoteExchange;
use crate::Zxid;

pub fn encode_request(xid: i32) -> [u8; STATUS_REQUEST_LEN] {
    xid.to_be_bytes()
}

/// `None` unless `buf` is exactly one request.
pub fn decode_request(buf: &[u8]) -> Option<i32> {
    let raw: [u8; STATUS_REQUEST_LEN] = buf.try_into().ok()?;
    Some(i32::from_be_bytes(raw))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusResponse {
    pub xid: i32,
    pub my_id: PeerId,
    pub vote: Vote,
}

impl StatusResponse {
    pub fn encode(&self) -> [u8; STATUS_RESPONSE_LEN] {
        let mut buf = [0u8; STATUS_RESPONSE_LEN];
        buf[0..4].copy_from_slice(&self.xid.to_be_bytes());
        buf[4..12].copy_from_slice(&self.my_id.to_be_bytes());
        buf[12..20].copy_from_slice(&self.vote.id.to_be_bytes());
        buf[20..28].copy_from_slice(&self.vote.zxid.as_u64().to_be_bytes());
        buf
    }

    pub fn decode(buf: &[u8]) -> Option<Self> {
        let raw: &[u8; STATUS_RESPONSE_LEN] = buf.try_into().ok()?;
        let u64_at = |at: usize| {
            let mut b = [0u8; 8];
            b.copy_from_slice(&raw[at..at + 8]);
            u64::from_be_bytes(b)
        };
        let mut xid = [0u8; 4];
        xid.copy_from_slice(&raw[0..4]);

        Some(Self {
            xid: i32::from_be_bytes(xid),
            my_id: u64_at(4),
            vote: Vote::new(u64_at(12), Zxid::from_u64(u64_at(20))),
        })
    }
}

/// Answers status requests on `socket` until shutdown.
pub async fn serve_status(
    socket: UdpSocket,
    status: Arc<PeerStatus>,
    mut shutdown: watch::Receiver<()>,
) -> Result<()> {
    let mut buf = [0u8; 64];
    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                debug!("status responder stopped");
                return Ok(());
            }
            received = socket.recv_from(&mut buf) => {
                let (n, from) = match received {
                    Ok(r) => r,
                    Err(e) => {
                        warn!("status socket receive failed: {}", e);
                        continue;
                    }
                };
                let Some(xid) = decode_request(&buf[..n]) else {
                    warn!("ignoring {} byte status request from {}", n, from);
                    continue;
                };

                let response = StatusResponse {
                    xid,
                    my_id: status.my_id(),
                    vote: status.answer(),
                };
                trace!(?response, %from, "status answer");
                if let Err(e) = socket.send_to(&response.encode(), from).await {
                    debug!("status answer to {} failed: {}", from, e);
                }
            }
        }
    }
}

pub async fn bind_status_socket(addr: SocketAddr) -> Result<UdpSocket> {
    UdpSocket::bind(addr)
        .await
        .map_err(|source| NetworkError::BindFailed { addr, source }.into())
}

/// Vote exchange over the status datagram.
#[derive(Debug, Clone)]
pub struct UdpVoteExchange {
    my_id: PeerId,
}

impl UdpVoteExchange {
    pub fn new(my_id: PeerId) -> Self {
        Self { my_id }
    }
}

#[async_trait]
impl VoteExchange for UdpVoteExchange {
    async fn collect_votes(
        &self,
        peers: &[QuorumServer],
        timeout: Duration,
    ) -> HashMap<PeerId, Vote> {
        let mut votes = HashMap::new();
        let targets: Vec<&QuorumServer> = peers.iter().filter(|p| p.id != self.my_id).collect();
        let Some(first) = targets.first() else {
            return votes;
        };

        let local: SocketAddr = if first.addr.is_ipv4() {
            (Ipv4Addr::UNSPECIFIED, 0).into()
        } else {
            (Ipv6Addr::UNSPECIFIED, 0).into()
        };
        let socket = match UdpSocket::bind(local).await {
            Ok(s) => s,
            Err(e) => {
                warn!("cannot open vote exchange socket: {}", e);
                return votes;
            }
        };

        let xid: i32 = rand::random();
        let request = encode_request(xid);
        for peer in &targets {
            if let Err(e) = socket.send_to(&request, peer.addr).await {
                debug!("status request to peer {} at {} failed: {}", peer.id, peer.addr, e);
            }
        }

        let deadline = Instant::now() + timeout;
        let mut buf = [0u8; 64];
        while votes.len() < targets.len() {
            let (n, from) = match timeout_at(deadline, socket.recv_from(&mut buf)).await {
                Err(_) => break,
                Ok(Err(e)) => {
                    debug!("vote exchange receive failed: {}", e);
                    continue;
                }
                Ok(Ok(r)) => r,
            };
            match StatusResponse::decode(&buf[..n]) {
                Some(r) if r.xid == xid && targets.iter().any(|p| p.id == r.my_id) => {
                    votes.insert(r.my_id, r.vote);
                }
                _ => debug!("ignoring stray status response from {}", from),
            }
        }

        votes
    }
}
