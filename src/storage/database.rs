use std::collections::VecDeque;
use std::path::Path;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;
use tracing::info;
use tracing::warn;

use super::last_logged_zxid;
use super::StateMachine;
use super::TxnLog;
use crate::ClusterConfig;
use crate::QuorumConfig;
use crate::Result;
use crate::Transaction;
use crate::Zxid;
use crate::LAST_COMMITTED_ZXID;
use crate::SNAPSHOTS_TOTAL;

/// Most recent committed transactions, used for diff synchronization.
///
/// `base` is the zxid right before the oldest kept transaction: a follower
/// whose last zxid is `base` or any kept zxid can be served from memory.
#[derive(Debug)]
struct CommittedWindow {
    base: Zxid,
    txns: VecDeque<Transaction>,
    capacity: usize,
}

impl CommittedWindow {
    fn new(
        base: Zxid,
        capacity: usize,
    ) -> Self {
        Self {
            base,
            txns: VecDeque::with_capacity(capacity.min(1024)),
            capacity,
        }
    }

    fn push(
        &mut self,
        txn: Transaction,
    ) {
        self.txns.push_back(txn);
        while self.txns.len() > self.capacity {
            if let Some(evicted) = self.txns.pop_front() {
                self.base = evicted.zxid;
            }
        }
    }

    fn reset(
        &mut self,
        base: Zxid,
    ) {
        self.base = base;
        self.txns.clear();
    }

    fn last(&self) -> Zxid {
        self.txns.back().map(|t| t.zxid).unwrap_or(self.base)
    }

    fn since(
        &self,
        after: Zxid,
    ) -> Option<Vec<Transaction>> {
        if after == self.last() {
            return Some(Vec::new());
        }
        if after > self.last() || after < self.base {
            return None;
        }
        if after == self.base {
            return Some(self.txns.iter().cloned().collect());
        }
        let pos = self.txns.binary_search_by_key(&after, |t| t.zxid).ok()?;
        Some(self.txns.iter().skip(pos + 1).cloned().collect())
    }
}

/// Replicated database of one peer: transaction log, snapshots, the
/// application state machine and the in-memory committed window.
///
/// Exactly one role drives it at a time.
pub struct Database {
    state_machine: Arc<dyn StateMachine>,
    txn_log: TxnLog,
    window: Mutex<CommittedWindow>,
    /// Logged proposals found past the commit mark by the last `load`
    recovered: Mutex<Vec<Transaction>>,
    snapshot_threshold: u64,
    commits_since_snapshot: AtomicU64,
}

impl std::fmt::Debug for Database {
    fn fmt(
        &self,
        f: &mut std::fmt::Formatter<'_>,
    ) -> std::fmt::Result {
        f.debug_struct("Database")
            .field("dir", &self.txn_log.dir())
            .field("last_committed", &self.last_committed())
            .finish()
    }
}

impl Database {
    pub fn open(
        cluster: &ClusterConfig,
        quorum: &QuorumConfig,
        state_machine: Arc<dyn StateMachine>,
    ) -> Result<Self> {
        let txn_log = TxnLog::open(
            cluster.log_dir_for_txns(),
            quorum.preallocate_bytes,
            quorum.segment_max_bytes,
        )?;
        Ok(Self::new(
            txn_log,
            state_machine,
            quorum.max_committed_log,
            quorum.snapshot_threshold,
        ))
    }

    pub fn new(
        txn_log: TxnLog,
        state_machine: Arc<dyn StateMachine>,
        max_committed_log: usize,
        snapshot_threshold: u64,
    ) -> Self {
        let base = state_machine.last_applied();
        Self {
            state_machine,
            txn_log,
            window: Mutex::new(CommittedWindow::new(base, max_committed_log.max(1))),
            recovered: Mutex::new(Vec::new()),
            snapshot_threshold,
            commits_since_snapshot: AtomicU64::new(0),
        }
    }

    /// Brings the state machine up to the durable commit point.
    ///
    /// Restores the newest snapshot when it is ahead of the state machine,
    /// then applies logged transactions up to the commit mark. Logged
    /// proposals past the mark stay unapplied as recovered history: they
    /// count towards the vote and are committed only once a leader settles
    /// them. Run at startup and before every election.
    pub fn load(&self) -> Result<Zxid> {
        let mut applied = self.state_machine.last_applied();

        if let Some((zxid, data)) = self.txn_log.latest_snapshot()? {
            if zxid > applied {
                info!("restoring snapshot {}", zxid);
                self.state_machine.restore(zxid, &data)?;
                self.window.lock().reset(zxid);
                applied = zxid;
            }
        }

        let committed_through = self.txn_log.commit_mark().max(applied);
        let replay = self.txn_log.read_after(applied)?;
        if !replay.is_empty() {
            debug!("replaying {} logged transactions after {}", replay.len(), applied);
        }
        let mut recovered = Vec::new();
        for txn in replay {
            if txn.zxid <= committed_through {
                self.apply(txn)?;
            } else {
                recovered.push(txn);
            }
        }
        if let Some(last) = recovered.last() {
            info!(
                "{} logged proposals up to {} are not known to be committed",
                recovered.len(),
                last.zxid
            );
        }
        *self.recovered.lock() = recovered;

        let last = self.last_committed();
        LAST_COMMITTED_ZXID.set(last.as_u64() as i64);
        Ok(last)
    }

    #[inline]
    pub fn last_committed(&self) -> Zxid {
        self.state_machine.last_applied()
    }

    /// End of local history, recovered proposals included.
    pub fn last_logged(&self) -> Zxid {
        self.recovered
            .lock()
            .last()
            .map(|t| t.zxid)
            .unwrap_or_else(|| self.last_committed())
    }

    /// Hands the recovered proposals to a new leader, which re-proposes them.
    pub fn take_recovered(&self) -> Vec<Transaction> {
        std::mem::take(&mut *self.recovered.lock())
    }

    /// On-disk view, as used for the initial vote.
    pub fn last_logged_zxid(&self) -> Zxid {
        last_logged_zxid(self.txn_log.dir())
    }

    pub fn dir(&self) -> &Path {
        self.txn_log.dir()
    }

    /// Durable append of a proposal. Returns once it may be acknowledged.
    pub fn log_proposal(
        &self,
        txn: &Transaction,
    ) -> Result<()> {
        self.txn_log.append(txn)
    }

    /// Applies a committed transaction to the state machine and moves the
    /// commit mark past it.
    pub fn commit(
        &self,
        txn: &Transaction,
    ) -> Result<()> {
        self.apply(txn.clone())?;
        self.txn_log.set_commit_mark(txn.zxid)?;
        self.recovered.lock().retain(|t| t.zxid > txn.zxid);
        LAST_COMMITTED_ZXID.set(txn.zxid.as_u64() as i64);

        let since = self.commits_since_snapshot.fetch_add(1, Ordering::AcqRel) + 1;
        if self.snapshot_threshold > 0 && since >= self.snapshot_threshold {
            if let Err(e) = self.take_snapshot() {
                warn!("periodic snapshot failed: {}", e);
            }
        }
        Ok(())
    }

    fn apply(
        &self,
        txn: Transaction,
    ) -> Result<()> {
        self.state_machine.apply_committed(&txn)?;
        self.window.lock().push(txn);
        Ok(())
    }

    /// Catch-up from a leader diff: log then apply everything past the
    /// local commit point. `committed` is the leader's commit point.
    ///
    /// A diff is only sent when the leader's logged history contains our
    /// last logged zxid. Recovered proposals up to `committed` are therefore
    /// committed first; later ones are returned still unapplied, to be
    /// committed when the leader's COMMIT for them arrives.
    pub fn apply_diff(
        &self,
        txns: &[Transaction],
        committed: Zxid,
    ) -> Result<Vec<Transaction>> {
        let (settled, pending): (Vec<Transaction>, Vec<Transaction>) =
            self.take_recovered().into_iter().partition(|t| t.zxid <= committed);
        if !settled.is_empty() {
            debug!("committing {} recovered proposals ahead of the diff", settled.len());
        }
        for txn in &settled {
            if txn.zxid > self.last_committed() {
                self.commit(txn)?;
            }
        }
        for txn in txns {
            if txn.zxid <= self.last_committed() {
                continue;
            }
            self.log_proposal(txn)?;
            self.commit(txn)?;
        }
        let last_committed = self.last_committed();
        Ok(pending.into_iter().filter(|t| t.zxid > last_committed).collect())
    }

    /// Transactions after `after` if they can still be served from memory.
    pub fn committed_since(
        &self,
        after: Zxid,
    ) -> Option<Vec<Transaction>> {
        self.window.lock().since(after)
    }

    /// State machine image together with the zxid it covers.
    pub fn snapshot(&self) -> Result<(Zxid, Vec<u8>)> {
        let _window = self.window.lock();
        let zxid = self.state_machine.last_applied();
        let data = self.state_machine.snapshot()?;
        Ok((zxid, data))
    }

    pub fn take_snapshot(&self) -> Result<Zxid> {
        let (zxid, data) = self.snapshot()?;
        self.txn_log.write_snapshot(zxid, &data)?;
        self.txn_log.roll();
        self.commits_since_snapshot.store(0, Ordering::Release);
        SNAPSHOTS_TOTAL.inc();
        Ok(zxid)
    }

    /// Replaces local state and history with a leader snapshot.
    pub fn restore_snapshot(
        &self,
        zxid: Zxid,
        data: &[u8],
    ) -> Result<()> {
        self.txn_log.reset_to_snapshot(zxid, data)?;
        self.state_machine.restore(zxid, data)?;
        self.txn_log.set_commit_mark(zxid)?;
        self.recovered.lock().clear();
        self.window.lock().reset(zxid);
        self.commits_since_snapshot.store(0, Ordering::Release);
        LAST_COMMITTED_ZXID.set(zxid.as_u64() as i64);
        Ok(())
    }
}
