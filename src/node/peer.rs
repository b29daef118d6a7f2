//! The quorum peer control loop.
//!
//! LOOKING runs the election, then the peer enters LEADING or FOLLOWING
//! until that role's loop returns. Any role outcome other than a requested
//! shutdown is recorded and answered by a new election; nothing a role does
//! ends the process.

use std::sync::Arc;

use tokio::sync::watch;
use tokio::time::sleep;
use tracing::error;
use tracing::info;
use tracing::warn;

use super::PeerHandle;
use crate::bind_status_socket;
use crate::serve_status;
use crate::Database;
use crate::ElectionError;
use crate::ElectionHandler;
use crate::EpochStore;
use crate::Error;
use crate::Follower;
use crate::Leader;
use crate::PeerId;
use crate::PeerStatus;
use crate::QuorumNodeConfig;
use crate::Result;
use crate::ServerState;
use crate::Vote;
use crate::ELECTIONS_COMPLETED;
use crate::ROLE_FAILURES;
use crate::ROLE_TRANSITIONS;

pub struct QuorumPeer {
    pub(super) my_id: PeerId,
    pub(super) config: Arc<QuorumNodeConfig>,
    pub(super) db: Arc<Database>,
    pub(super) epoch_store: Arc<EpochStore>,
    pub(super) status: Arc<PeerStatus>,
    pub(super) election: ElectionHandler,
    /// Fed by the external signal and by [`PeerHandle::shutdown`]
    pub(super) shutdown_tx: Arc<watch::Sender<()>>,
    pub(super) shutdown_rx: watch::Receiver<()>,
    pub(super) external_shutdown: watch::Receiver<()>,
}

impl std::fmt::Debug for QuorumPeer {
    fn fmt(
        &self,
        f: &mut std::fmt::Formatter<'_>,
    ) -> std::fmt::Result {
        f.debug_struct("QuorumPeer")
            .field("my_id", &self.my_id)
            .field("state", &self.status.state())
            .finish()
    }
}

impl QuorumPeer {
    pub fn my_id(&self) -> PeerId {
        self.my_id
    }

    pub fn status(&self) -> Arc<PeerStatus> {
        self.status.clone()
    }

    pub fn handle(&self) -> PeerHandle {
        PeerHandle::new(
            self.status.clone(),
            self.shutdown_tx.clone(),
            self.config.network.client_request_timeout_ms,
        )
    }

    /// Runs the peer until shutdown. Errors are only returned for failures
    /// before the first election, such as the status port being taken.
    pub async fn run(&self) -> Result<()> {
        let addr = self
            .config
            .cluster
            .server(self.my_id)
            .map(|s| s.addr)
            .ok_or(ElectionError::NotAMember(self.my_id))?;
        let socket = bind_status_socket(addr).await?;
        info!("peer {} answering status queries on {}", self.my_id, addr);

        let responder = tokio::spawn(serve_status(socket, self.status.clone(), self.shutdown_rx.clone()));
        let relay = {
            let mut external = self.external_shutdown.clone();
            let shutdown_tx = self.shutdown_tx.clone();
            tokio::spawn(async move {
                let _ = external.changed().await;
                let _ = shutdown_tx.send(());
            })
        };

        self.run_loop().await;

        relay.abort();
        match responder.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!("status responder failed: {}", e),
            Err(e) => warn!("status responder panicked: {}", e),
        }
        info!("peer {} stopped", self.my_id);
        Ok(())
    }

    async fn run_loop(&self) {
        let mut shutdown = self.shutdown_rx.clone();
        loop {
            if shutdown_requested(&shutdown) {
                return;
            }

            let vote = match self.look_for_leader(&mut shutdown).await {
                Ok(Some(vote)) => vote,
                Ok(None) => return,
                Err(e) => {
                    self.record_failure(ServerState::Looking, &e);
                    tokio::select! {
                        _ = shutdown.changed() => return,
                        _ = sleep(self.config.quorum.tick()) => continue,
                    }
                }
            };

            let result = if vote.id == self.my_id {
                self.lead(vote).await
            } else {
                self.follow(vote).await
            };
            if let Err(e) = result {
                let state = self.status.state();
                self.record_failure(state, &e);
            }
        }
    }

    async fn look_for_leader(
        &self,
        shutdown: &mut watch::Receiver<()>,
    ) -> Result<Option<Vote>> {
        warn!("LOOKING");
        ROLE_TRANSITIONS.with_label_values(&[ServerState::Looking.as_str()]).inc();

        let initial = Vote::new(self.my_id, self.db.last_logged_zxid());
        self.status.enter_looking(initial);
        // uncommitted proposals of the last role are held back for the next leader
        self.db.load()?;

        let elected = self.election.look_for_leader(&self.status, initial, shutdown).await?;
        if let Some(vote) = elected {
            ELECTIONS_COMPLETED.inc();
            info!(leader = vote.id, zxid = %vote.zxid, "election settled");
        }
        Ok(elected)
    }

    async fn lead(
        &self,
        vote: Vote,
    ) -> Result<()> {
        warn!("LEADING");
        ROLE_TRANSITIONS.with_label_values(&[ServerState::Leading.as_str()]).inc();

        let mut leader = Leader::new(
            self.my_id,
            self.config.clone(),
            self.db.clone(),
            self.epoch_store.clone(),
        );
        self.status.enter_leading(vote, leader.handle());
        leader.lead(self.shutdown_rx.clone()).await
    }

    async fn follow(
        &self,
        vote: Vote,
    ) -> Result<()> {
        warn!("FOLLOWING");
        ROLE_TRANSITIONS.with_label_values(&[ServerState::Following.as_str()]).inc();

        let mut follower = Follower::new(
            self.my_id,
            vote.id,
            self.config.clone(),
            self.db.clone(),
            self.epoch_store.clone(),
        )?;
        self.status.enter_following(vote, follower.handle());
        follower.follow(self.shutdown_rx.clone()).await
    }

    fn record_failure(
        &self,
        state: ServerState,
        e: &Error,
    ) {
        error!("{} ended: {}", state, e);
        ROLE_FAILURES.with_label_values(&[state.as_str(), e.kind()]).inc();
        self.status.record_failure(e);
    }
}

fn shutdown_requested(shutdown: &watch::Receiver<()>) -> bool {
    !matches!(shutdown.has_changed(), Ok(false))
}
