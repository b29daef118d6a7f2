mod election_handler;
pub use election_handler::*;


use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;

use crate::PeerId;
use crate::QuorumServer;
use crate::Vote;

/// Pull-based vote transport used while LOOKING.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait VoteExchange: Send + Sync + 'static {
    /// Current vote of every reachable peer in `peers` except ourselves,
    /// keyed by the responder's id. Peers that do not answer within
    /// `timeout` are absent from the map.
    async fn collect_votes(
        &self,
        peers: &[QuorumServer],
        timeout: Duration,
    ) -> HashMap<PeerId, Vote>;
}
