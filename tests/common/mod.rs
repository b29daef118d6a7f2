use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use quorum_engine::BackoffPolicy;
use quorum_engine::MemStateMachine;
use quorum_engine::PeerBuilder;
use quorum_engine::PeerHandle;
use quorum_engine::PeerId;
use quorum_engine::QuorumNodeConfig;
use quorum_engine::QuorumServer;
use quorum_engine::Result;
use quorum_engine::ServerState;
use quorum_engine::Zxid;
use tempfile::TempDir;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tokio::time::Instant;
use tracing_subscriber::EnvFilter;

pub const WAIT_FOR_ENSEMBLE_IN_SEC: u64 = 10;

static LOGGER_INIT: once_cell::sync::Lazy<()> = once_cell::sync::Lazy::new(|| {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
});

pub fn enable_logger() {
    *LOGGER_INIT;
}

/// Localhost addresses whose TCP and UDP ports were both free when probed.
pub fn get_available_addrs(n: usize) -> Vec<SocketAddr> {
    let mut held = Vec::new();
    let mut addrs = Vec::new();
    while addrs.len() < n {
        let tcp = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = tcp.local_addr().unwrap();
        if let Ok(udp) = std::net::UdpSocket::bind(addr) {
            addrs.push(addr);
            held.push((tcp, udp));
        }
    }
    addrs
}

pub fn ensemble(addrs: &[SocketAddr]) -> Vec<QuorumServer> {
    addrs
        .iter()
        .enumerate()
        .map(|(i, addr)| QuorumServer {
            id: i as PeerId + 1,
            addr: *addr,
        })
        .collect()
}

pub fn peer_config(
    my_id: PeerId,
    servers: Vec<QuorumServer>,
    dir: &TempDir,
) -> QuorumNodeConfig {
    let mut config = QuorumNodeConfig::default();
    config.cluster.my_id = Some(my_id);
    config.cluster.servers = servers;
    config.cluster.data_dir = dir.path().to_path_buf();
    config.cluster.log_dir = dir.path().join("logs");
    config.quorum.tick_time_ms = 50;
    config.quorum.init_limit = 10;
    config.quorum.sync_limit = 5;
    config.quorum.preallocate_bytes = 4096;
    config.network.client_request_timeout_ms = 3000;
    config.retry.election = BackoffPolicy {
        max_retries: 0,
        timeout_ms: 50,
        base_delay_ms: 5,
        max_delay_ms: 20,
    };
    config.retry.connect_leader = BackoffPolicy {
        max_retries: 5,
        timeout_ms: 200,
        base_delay_ms: 10,
        max_delay_ms: 50,
    };
    config
}

/// A peer running on the test runtime with its own data directory.
pub struct TestPeer {
    pub id: PeerId,
    pub handle: PeerHandle,
    pub state_machine: Arc<MemStateMachine>,
    task: JoinHandle<Result<()>>,
    _graceful_tx: watch::Sender<()>,
}

impl TestPeer {
    pub fn start(
        my_id: PeerId,
        servers: Vec<QuorumServer>,
        dir: &TempDir,
    ) -> Self {
        let (graceful_tx, graceful_rx) = watch::channel(());
        let state_machine = MemStateMachine::new();
        let peer = PeerBuilder::init(peer_config(my_id, servers, dir), graceful_rx)
            .state_machine(state_machine.clone())
            .build()
            .unwrap();
        let handle = peer.handle();
        let task = tokio::spawn(async move { peer.run().await });
        Self {
            id: my_id,
            handle,
            state_machine,
            task,
            _graceful_tx: graceful_tx,
        }
    }

    pub async fn stop(self) {
        self.handle.shutdown();
        let result = tokio::time::timeout(Duration::from_secs(5), self.task)
            .await
            .expect("peer did not stop");
        assert!(result.unwrap().is_ok());
    }
}

/// Several peers of one ensemble, each slot `id - 1`.
pub struct TestContext {
    pub servers: Vec<QuorumServer>,
    pub dirs: Vec<TempDir>,
    pub peers: Vec<Option<TestPeer>>,
}

impl TestContext {
    pub fn start(n: usize) -> Self {
        let servers = ensemble(&get_available_addrs(n));
        let dirs: Vec<TempDir> = (0..n).map(|_| tempfile::tempdir().unwrap()).collect();
        let peers = (0..n)
            .map(|i| Some(TestPeer::start(i as PeerId + 1, servers.clone(), &dirs[i])))
            .collect();
        Self { servers, dirs, peers }
    }

    pub fn peer(
        &self,
        id: PeerId,
    ) -> &TestPeer {
        self.peers[id as usize - 1].as_ref().expect("peer is stopped")
    }

    pub fn running(&self) -> impl Iterator<Item = &TestPeer> {
        self.peers.iter().flatten()
    }

    pub async fn stop_peer(
        &mut self,
        id: PeerId,
    ) {
        if let Some(peer) = self.peers[id as usize - 1].take() {
            peer.stop().await;
        }
    }

    pub fn restart_peer(
        &mut self,
        id: PeerId,
    ) {
        let i = id as usize - 1;
        assert!(self.peers[i].is_none());
        self.peers[i] = Some(TestPeer::start(id, self.servers.clone(), &self.dirs[i]));
    }

    /// Waits until every running peer serves under one leader and returns it.
    pub async fn wait_for_leader(&self) -> PeerId {
        let deadline = Instant::now() + Duration::from_secs(WAIT_FOR_ENSEMBLE_IN_SEC);
        loop {
            let leaders: Vec<PeerId> = self
                .running()
                .filter(|p| p.handle.state() == ServerState::Leading)
                .map(|p| p.id)
                .collect();
            if let [leader] = leaders[..] {
                let agreed = self
                    .running()
                    .all(|p| p.handle.is_serving() && p.handle.leader_id() == Some(leader));
                if agreed {
                    return leader;
                }
            }
            assert!(Instant::now() < deadline, "no stable leader in time");
            sleep(Duration::from_millis(50)).await;
        }
    }

    pub async fn wait_applied_everywhere(
        &self,
        zxid: Zxid,
    ) {
        let deadline = Instant::now() + Duration::from_secs(WAIT_FOR_ENSEMBLE_IN_SEC);
        while !self.running().all(|p| p.state_machine.applied_zxids().contains(&zxid)) {
            assert!(Instant::now() < deadline, "{} not applied everywhere", zxid);
            sleep(Duration::from_millis(20)).await;
        }
    }

    pub async fn stop_all(mut self) {
        for i in 0..self.peers.len() {
            self.stop_peer(i as PeerId + 1).await;
        }
    }
}
