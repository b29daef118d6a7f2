use std::sync::Arc;

#[cfg(test)]
use mockall::automock;
use parking_lot::RwLock;
use serde::Deserialize;
use serde::Serialize;
use tracing::debug;

use crate::Result;
use crate::StorageError;
use crate::Transaction;
use crate::Zxid;

/// Data application interface towards the data tree.
///
/// The quorum core calls `apply_committed` exactly once per committed
/// transaction, in zxid order, both during follower catch-up and in steady
/// state. `restore` replaces the whole state during snapshot transfer.
#[cfg_attr(test, automock)]
pub trait StateMachine: Send + Sync + 'static {
    fn apply_committed(
        &self,
        txn: &Transaction,
    ) -> Result<()>;

    /// Zxid of the last applied transaction, `Zxid::ZERO` when empty
    fn last_applied(&self) -> Zxid;

    fn snapshot(&self) -> Result<Vec<u8>>;

    fn restore(
        &self,
        zxid: Zxid,
        data: &[u8],
    ) -> Result<()>;
}

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
struct MemState {
    last_applied: Zxid,
    applied: Vec<Transaction>,
}

/// In-memory state machine holding every applied transaction in order.
///
/// Rejects a transaction whose zxid does not move `last_applied` forward,
/// which makes double application observable.
#[derive(Debug, Default)]
pub struct MemStateMachine {
    state: RwLock<MemState>,
}

impl MemStateMachine {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Applied transactions, oldest first.
    pub fn applied(&self) -> Vec<Transaction> {
        self.state.read().applied.clone()
    }

    pub fn applied_zxids(&self) -> Vec<Zxid> {
        self.state.read().applied.iter().map(|t| t.zxid).collect()
    }

    pub fn len(&self) -> usize {
        self.state.read().applied.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl StateMachine for MemStateMachine {
    fn apply_committed(
        &self,
        txn: &Transaction,
    ) -> Result<()> {
        let mut state = self.state.write();
        if txn.zxid <= state.last_applied {
            return Err(StorageError::StateMachineError(format!(
                "transaction {} is not newer than last applied {}",
                txn.zxid, state.last_applied
            ))
            .into());
        }
        state.last_applied = txn.zxid;
        state.applied.push(txn.clone());
        Ok(())
    }

    fn last_applied(&self) -> Zxid {
        self.state.read().last_applied
    }

    fn snapshot(&self) -> Result<Vec<u8>> {
        let state = self.state.read();
        Ok(bincode::serialize(&*state)?)
    }

    fn restore(
        &self,
        zxid: Zxid,
        data: &[u8],
    ) -> Result<()> {
        let mut restored: MemState = bincode::deserialize(data)?;
        if restored.last_applied != zxid {
            debug!(
                "snapshot body is at {} but was taken for {}, trusting the name",
                restored.last_applied, zxid
            );
            restored.last_applied = zxid;
        }
        *self.state.write() = restored;
        Ok(())
    }
}
