use std::sync::Arc;
use std::time::Duration;

use autometrics::autometrics;
use tokio::sync::oneshot;
use tokio::sync::watch;
use tokio::time::timeout;
use tracing::debug;

use crate::Error;
use crate::PeerId;
use crate::PeerStatus;
use crate::Result;
use crate::RoleHandle;
use crate::ServerState;
use crate::StatusRecord;
use crate::Zxid;
use crate::API_SLO;

/// Cloneable client-side view of a running [`QuorumPeer`](crate::QuorumPeer).
#[derive(Debug, Clone)]
pub struct PeerHandle {
    status: Arc<PeerStatus>,
    shutdown_tx: Arc<watch::Sender<()>>,
    request_timeout: Duration,
}

impl PeerHandle {
    pub(crate) fn new(
        status: Arc<PeerStatus>,
        shutdown_tx: Arc<watch::Sender<()>>,
        request_timeout_ms: u64,
    ) -> Self {
        Self {
            status,
            shutdown_tx,
            request_timeout: Duration::from_millis(request_timeout_ms),
        }
    }

    pub fn my_id(&self) -> PeerId {
        self.status.my_id()
    }

    /// Consistent snapshot of state, vote, role and last failure.
    pub fn status(&self) -> Arc<StatusRecord> {
        self.status.load()
    }

    pub fn state(&self) -> ServerState {
        self.status.state()
    }

    pub fn leader_id(&self) -> Option<PeerId> {
        self.status.leader_id()
    }

    /// True when [`submit`](Self::submit) would be accepted right now.
    pub fn is_serving(&self) -> bool {
        match &self.status.load().role {
            RoleHandle::Leading(leader) => leader.is_established(),
            RoleHandle::Following(follower) => follower.is_synced(),
            RoleHandle::None => false,
        }
    }

    /// Submits a mutation and waits until this peer has applied it.
    ///
    /// Fails with [`Error::NotServing`] while LOOKING, while the follower is
    /// still synchronizing, or when the role ends before the commit.
    #[autometrics(objective = API_SLO)]
    pub async fn submit(
        &self,
        payload: Vec<u8>,
    ) -> Result<Zxid> {
        let (reply_tx, reply_rx) = oneshot::channel();
        let record = self.status.load();
        match &record.role {
            RoleHandle::Leading(leader) if leader.is_established() => leader.submit(payload, reply_tx).await?,
            RoleHandle::Following(follower) if follower.is_synced() => follower.forward(payload, reply_tx).await?,
            _ => {
                return Err(Error::NotServing(format!(
                    "peer {} is {} without an established leader",
                    self.my_id(),
                    record.state
                )))
            }
        }

        match timeout(self.request_timeout, reply_rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(Error::NotServing("role ended before the commit".to_string())),
            Err(_) => {
                debug!("submission not committed within {:?}", self.request_timeout);
                Err(Error::NotServing(format!(
                    "not committed within {:?}",
                    self.request_timeout
                )))
            }
        }
    }

    /// Asks the peer to stop after its current role returns.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }
}
