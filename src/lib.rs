//! Quorum replication core for a ZooKeeper-style coordination service.
//!
//! A [`QuorumPeer`] cycles through LOOKING, FOLLOWING and LEADING: it elects
//! a leader by exchanging votes, then either broadcasts proposals to a
//! quorum of followers or synchronizes with the elected leader and applies
//! its commits. Committed transactions reach the application through
//! [`StateMachine`].
//!
//! ```ignore
//! let (shutdown_tx, shutdown_rx) = watch::channel(());
//! let config = QuorumNodeConfig::load(None)?;
//! let peer = PeerBuilder::init(config, shutdown_rx).build()?;
//! let handle = peer.handle();
//! tokio::spawn(async move { peer.run().await });
//! let zxid = handle.submit(b"payload".to_vec()).await?;
//! ```

mod config;
pub(crate) mod constants;
mod core;
mod errors;
mod metrics;
mod network;
mod node;
mod storage;
pub(crate) mod utils;

pub use core::*;

pub use config::*;
pub use errors::*;
pub use metrics::*;
pub use network::*;
pub use node::*;
pub use storage::*;

//-----------------------------------------------------------
// Test utils

#[cfg(test)]
pub mod test_utils;
//-----------------------------------------------------------
// Autometrics
/// autometrics: https://docs.autometrics.dev/rust/adding-alerts-and-slos
use autometrics::objectives::Objective;
use autometrics::objectives::ObjectiveLatency;
use autometrics::objectives::ObjectivePercentile;
const API_SLO: Objective = Objective::new("api")
    .success_rate(ObjectivePercentile::P99_9)
    .latency(ObjectiveLatency::Ms10, ObjectivePercentile::P99);
