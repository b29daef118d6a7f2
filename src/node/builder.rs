//! A builder for assembling a [`QuorumPeer`].
//!
//! Storage is opened and recovered in [`PeerBuilder::build`]; defaults are an
//! in-memory state machine and the UDP vote exchange.
//!
//! ## Example
//! ```ignore
//! let (shutdown_tx, shutdown_rx) = watch::channel(());
//! let config = QuorumNodeConfig::load(None)?;
//! let peer = PeerBuilder::init(config, shutdown_rx)
//!     .state_machine(my_state_machine) // Optional override
//!     .start_metrics_server(shutdown_tx.subscribe())
//!     .build()?;
//! peer.run().await?;
//! ```

use std::sync::Arc;

use tokio::sync::watch;
use tracing::info;

use super::QuorumPeer;
use crate::metrics;
use crate::Database;
use crate::ElectionHandler;
use crate::EpochStore;
use crate::MemStateMachine;
use crate::PeerStatus;
use crate::QuorumNodeConfig;
use crate::Result;
use crate::StateMachine;
use crate::UdpVoteExchange;
use crate::Vote;
use crate::VoteExchange;

pub struct PeerBuilder {
    config: QuorumNodeConfig,
    shutdown_signal: watch::Receiver<()>,
    state_machine: Option<Arc<dyn StateMachine>>,
    vote_exchange: Option<Arc<dyn VoteExchange>>,
}

impl PeerBuilder {
    pub fn init(
        config: QuorumNodeConfig,
        shutdown_signal: watch::Receiver<()>,
    ) -> Self {
        Self {
            config,
            shutdown_signal,
            state_machine: None,
            vote_exchange: None,
        }
    }

    /// Sets the state machine committed transactions are applied to
    pub fn state_machine(
        mut self,
        state_machine: Arc<dyn StateMachine>,
    ) -> Self {
        self.state_machine = Some(state_machine);
        self
    }

    /// Replaces the datagram vote exchange
    pub fn vote_exchange(
        mut self,
        vote_exchange: Arc<dyn VoteExchange>,
    ) -> Self {
        self.vote_exchange = Some(vote_exchange);
        self
    }

    /// Launches the Prometheus endpoint when monitoring is enabled.
    pub fn start_metrics_server(
        self,
        shutdown_signal: watch::Receiver<()>,
    ) -> Self {
        if self.config.monitoring.prometheus_enabled {
            let port = self.config.monitoring.prometheus_port;
            tokio::spawn(async move {
                metrics::start_server(port, shutdown_signal).await;
            });
        }
        self
    }

    /// Validates the configuration, recovers local storage and assembles
    /// the peer. Configuration and storage errors are fatal here.
    pub fn build(self) -> Result<QuorumPeer> {
        let config = Arc::new(self.config.validate()?);
        let my_id = config.cluster.my_id()?;

        let state_machine = self
            .state_machine
            .unwrap_or_else(|| MemStateMachine::new() as Arc<dyn StateMachine>);
        let db = Database::open(&config.cluster, &config.quorum, state_machine)?;
        let last_committed = db.load()?;
        let epoch_store = EpochStore::open(&config.cluster.data_dir)?;
        let vote = Vote::new(my_id, db.last_logged_zxid());
        info!(
            my_id,
            %last_committed,
            last_logged = %db.last_logged(),
            accepted_epoch = epoch_store.accepted_epoch(),
            "peer recovered from {}",
            db.dir().display()
        );

        let status = Arc::new(PeerStatus::new(my_id, vote));
        let exchange = self
            .vote_exchange
            .unwrap_or_else(|| Arc::new(UdpVoteExchange::new(my_id)) as Arc<dyn VoteExchange>);
        let election = ElectionHandler::new(my_id, config.cluster.servers.clone(), exchange, config.retry.election);

        let (shutdown_tx, shutdown_rx) = watch::channel(());
        Ok(QuorumPeer {
            my_id,
            config,
            db: Arc::new(db),
            epoch_store: Arc::new(epoch_store),
            status,
            election,
            shutdown_tx: Arc::new(shutdown_tx),
            shutdown_rx,
            external_shutdown: self.shutdown_signal,
        })
    }
}
