use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;

use crate::PeerId;
use crate::PeerStatus;
use crate::QuorumServer;
use crate::Vote;
use crate::VoteExchange;

/// Vote exchange reading other peers' status records directly.
#[derive(Debug, Clone, Default)]
pub struct LocalVoteExchange {
    peers: Arc<DashMap<PeerId, Arc<PeerStatus>>>,
    me: PeerId,
}

impl LocalVoteExchange {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &self,
        status: Arc<PeerStatus>,
    ) {
        self.peers.insert(status.my_id(), status);
    }

    /// Same registry seen from peer `me`.
    pub fn for_peer(
        &self,
        me: PeerId,
    ) -> Arc<Self> {
        Arc::new(Self {
            peers: self.peers.clone(),
            me,
        })
    }
}

#[async_trait]
impl VoteExchange for LocalVoteExchange {
    async fn collect_votes(
        &self,
        peers: &[QuorumServer],
        _timeout: Duration,
    ) -> HashMap<PeerId, Vote> {
        peers
            .iter()
            .filter(|p| p.id != self.me)
            .filter_map(|p| self.peers.get(&p.id).map(|s| (p.id, s.answer())))
            .collect()
    }
}
