use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use autometrics::autometrics;
use tokio::sync::watch;
use tokio::time::sleep;
use tracing::debug;
use tracing::info;
use tracing::instrument;

use super::VoteExchange;
use crate::quorum_size;
use crate::BackoffPolicy;
use crate::ElectionError;
use crate::PeerId;
use crate::PeerStatus;
use crate::QuorumServer;
use crate::Result;
use crate::Vote;
use crate::API_SLO;
use crate::ELECTION_ROUNDS;

/// Outcome of counting one round of votes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Tally {
    /// Vote this peer holds after the round
    pub vote: Vote,
    /// Peers (self included) whose vote names `vote.id`
    pub supporters: usize,
    pub converged: bool,
}

/// Counts one round.
///
/// The best vote seen (own vote included) is adopted. Votes are grouped by
/// candidate id, so followers reporting an older zxid for the same leader
/// still count. When the adopted candidate lacks a quorum but some other
/// candidate already has one, the ensemble is established and we join it.
#[autometrics(objective = API_SLO)]
pub fn tally_votes(
    my_id: PeerId,
    current: Vote,
    received: &HashMap<PeerId, Vote>,
    ensemble_size: usize,
) -> Tally {
    let quorum = quorum_size(ensemble_size);

    let best = received
        .iter()
        .filter(|(peer, _)| **peer != my_id)
        .map(|(_, v)| *v)
        .fold(current, |best, v| if v.is_better_than(&best) { v } else { best });

    // candidate -> (supporters, highest vote naming it)
    let mut support: HashMap<PeerId, (usize, Vote)> = HashMap::new();
    support.insert(best.id, (1, best));
    for (peer, vote) in received {
        if *peer == my_id {
            continue;
        }
        let entry = support.entry(vote.id).or_insert((0, *vote));
        entry.0 += 1;
        if vote.is_better_than(&entry.1) {
            entry.1 = *vote;
        }
    }

    let best_support = support.get(&best.id).map(|(n, _)| *n).unwrap_or(1);
    if best_support >= quorum {
        return Tally {
            vote: best,
            supporters: best_support,
            converged: true,
        };
    }

    if let Some((n, vote)) = support.values().find(|(n, _)| *n >= quorum) {
        return Tally {
            vote: *vote,
            supporters: *n,
            converged: true,
        };
    }

    Tally {
        vote: best,
        supporters: best_support,
        converged: false,
    }
}

/// Leader election over a [`VoteExchange`].
pub struct ElectionHandler {
    my_id: PeerId,
    servers: Vec<QuorumServer>,
    exchange: Arc<dyn VoteExchange>,
    policy: BackoffPolicy,
}

impl ElectionHandler {
    pub fn new(
        my_id: PeerId,
        servers: Vec<QuorumServer>,
        exchange: Arc<dyn VoteExchange>,
        policy: BackoffPolicy,
    ) -> Self {
        Self {
            my_id,
            servers,
            exchange,
            policy,
        }
    }

    /// Exchanges votes until a quorum agrees on a candidate.
    ///
    /// A convergence is confirmed by one more round before it is returned,
    /// so a better vote showing up late still wins. Returns `Ok(None)` when
    /// shutdown is requested.
    #[instrument(skip(self, status, shutdown), fields(my_id = self.my_id))]
    pub async fn look_for_leader(
        &self,
        status: &PeerStatus,
        initial: Vote,
        shutdown: &mut watch::Receiver<()>,
    ) -> Result<Option<Vote>> {
        if !self.servers.iter().any(|s| s.id == self.my_id) {
            return Err(ElectionError::NotAMember(self.my_id).into());
        }
        let ensemble_size = self.servers.len();

        let mut current = initial;
        status.set_vote(current);
        let mut pending: Option<Vote> = None;
        let mut round = 0usize;

        loop {
            round += 1;
            ELECTION_ROUNDS.inc();

            let received = tokio::select! {
                _ = shutdown.changed() => return Ok(None),
                votes = self.exchange.collect_votes(&self.servers, self.policy.timeout()) => votes,
            };

            let tally = tally_votes(self.my_id, current, &received, ensemble_size);
            if tally.vote != current {
                debug!(round, from = ?current, to = ?tally.vote, "adopting vote");
                current = tally.vote;
                status.set_vote(current);
            }

            if tally.converged {
                let confirmed = ensemble_size == 1 || pending.map(|p| p.id == tally.vote.id).unwrap_or(false);
                if confirmed {
                    info!(
                        round,
                        leader = tally.vote.id,
                        zxid = %tally.vote.zxid,
                        supporters = tally.supporters,
                        "election converged"
                    );
                    return Ok(Some(tally.vote));
                }
                pending = Some(tally.vote);
            } else {
                pending = None;
            }

            if !self.policy.unlimited() && round >= self.policy.max_retries {
                return Err(ElectionError::RoundsExhausted { rounds: round }.into());
            }

            let delay = match pending {
                Some(_) => Duration::from_millis(self.policy.base_delay_ms),
                None => self.policy.delay_for(round - 1),
            };
            tokio::select! {
                _ = shutdown.changed() => return Ok(None),
                _ = sleep(delay) => {}
            }
        }
    }
}
