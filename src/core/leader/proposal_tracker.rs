use std::collections::BTreeMap;
use std::collections::HashSet;
use std::time::Instant;

use tracing::trace;

use crate::quorum_size;
use crate::Error;
use crate::PeerId;
use crate::Result;
use crate::SubmitReply;
use crate::Transaction;
use crate::Zxid;

/// A proposal waiting for a quorum of acknowledgements.
#[derive(Debug)]
pub struct Proposal {
    pub txn: Transaction,
    acks: HashSet<PeerId>,
    proposed_at: Instant,
    waiter: Option<SubmitReply>,
}

impl Proposal {
    pub fn ack_count(&self) -> usize {
        self.acks.len()
    }

    pub fn age_ms(&self) -> f64 {
        self.proposed_at.elapsed().as_secs_f64() * 1000.0
    }

    pub(crate) fn complete(
        self,
        result: Result<Zxid>,
    ) {
        if let Some(waiter) = self.waiter {
            let _ = waiter.send(result);
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckOutcome {
    Counted,
    Duplicate,
    /// At or below the last commit
    Stale,
    /// Never proposed by this leader
    Unknown,
}

/// Outstanding proposals keyed by zxid.
///
/// Commits only ever leave from the front, so a later proposal reaching its
/// quorum first waits for every earlier one.
#[derive(Debug)]
pub struct ProposalTracker {
    quorum: usize,
    outstanding: BTreeMap<Zxid, Proposal>,
    last_committed: Zxid,
}

impl ProposalTracker {
    pub fn new(
        ensemble_size: usize,
        last_committed: Zxid,
    ) -> Self {
        Self {
            quorum: quorum_size(ensemble_size),
            outstanding: BTreeMap::new(),
            last_committed,
        }
    }

    pub(crate) fn propose(
        &mut self,
        txn: Transaction,
        waiter: Option<SubmitReply>,
    ) {
        self.outstanding.insert(
            txn.zxid,
            Proposal {
                txn,
                acks: HashSet::new(),
                proposed_at: Instant::now(),
                waiter,
            },
        );
    }

    pub fn ack(
        &mut self,
        peer: PeerId,
        zxid: Zxid,
    ) -> AckOutcome {
        if zxid <= self.last_committed {
            trace!(peer, %zxid, "stale ack");
            return AckOutcome::Stale;
        }
        match self.outstanding.get_mut(&zxid) {
            None => AckOutcome::Unknown,
            Some(p) => {
                if p.acks.insert(peer) {
                    AckOutcome::Counted
                } else {
                    AckOutcome::Duplicate
                }
            }
        }
    }

    /// Pops every proposal at the front that has a quorum, in zxid order.
    pub fn take_committable(&mut self) -> Vec<Proposal> {
        let mut ready = Vec::new();
        while let Some(entry) = self.outstanding.first_entry() {
            if entry.get().acks.len() < self.quorum {
                break;
            }
            let proposal = entry.remove();
            self.last_committed = proposal.txn.zxid;
            ready.push(proposal);
        }
        ready
    }

    /// Outstanding transactions, oldest first.
    pub fn outstanding(&self) -> impl Iterator<Item = &Transaction> {
        self.outstanding.values().map(|p| &p.txn)
    }

    pub fn len(&self) -> usize {
        self.outstanding.len()
    }

    pub fn is_empty(&self) -> bool {
        self.outstanding.is_empty()
    }

    pub fn last_committed(&self) -> Zxid {
        self.last_committed
    }

    /// Resolves every waiting submitter with `NotServing`.
    pub(crate) fn fail_all(
        &mut self,
        reason: &str,
    ) {
        for (_, proposal) in std::mem::take(&mut self.outstanding) {
            proposal.complete(Err(Error::NotServing(reason.to_string())));
        }
    }
}
