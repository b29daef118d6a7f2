use std::collections::VecDeque;

use tracing::debug;

use crate::Database;
use crate::QuorumPacket;
use crate::Result;
use crate::SyncError;
use crate::Transaction;
use crate::Zxid;

/// Follower side of the broadcast: proposals logged but not yet committed.
#[derive(Debug)]
pub(crate) struct Replication {
    pending: VecDeque<Transaction>,
    last_logged: Zxid,
}

impl Replication {
    pub(crate) fn new(last_logged: Zxid) -> Self {
        Self {
            pending: VecDeque::new(),
            last_logged,
        }
    }

    /// Forget pending proposals after the local history was replaced.
    pub(crate) fn reset(
        &mut self,
        last_logged: Zxid,
    ) {
        self.pending.clear();
        self.last_logged = last_logged;
    }

    /// Continue after a diff that left `pending` logged but uncommitted.
    pub(crate) fn resume(
        &mut self,
        last_committed: Zxid,
        pending: Vec<Transaction>,
    ) {
        self.last_logged = pending.last().map(|t| t.zxid).unwrap_or(last_committed);
        self.pending = pending.into();
    }

    pub(crate) fn last_logged(&self) -> Zxid {
        self.last_logged
    }

    pub(crate) fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Logs a proposal and returns the ACK to send back.
    pub(crate) fn on_proposal(
        &mut self,
        db: &Database,
        txn: Transaction,
    ) -> Result<QuorumPacket> {
        if txn.zxid <= self.last_logged {
            return Err(SyncError::OutOfOrderProposal {
                last: self.last_logged,
                got: txn.zxid,
            }
            .into());
        }
        db.log_proposal(&txn)?;
        let zxid = txn.zxid;
        self.last_logged = zxid;
        self.pending.push_back(txn);
        Ok(QuorumPacket::Ack { zxid })
    }

    /// Applies the oldest pending proposal. `None` for a commit we already
    /// applied, e.g. one that was part of the sync diff.
    pub(crate) fn on_commit(
        &mut self,
        db: &Database,
        zxid: Zxid,
    ) -> Result<Option<Zxid>> {
        if zxid <= db.last_committed() {
            debug!(%zxid, "commit already applied");
            return Ok(None);
        }
        match self.pending.front() {
            Some(front) if front.zxid == zxid => {}
            front => {
                return Err(SyncError::OutOfOrderCommit {
                    expected: front.map(|t| t.zxid),
                    got: zxid,
                }
                .into())
            }
        }
        if let Some(txn) = self.pending.pop_front() {
            db.commit(&txn)?;
        }
        Ok(Some(zxid))
    }
}
