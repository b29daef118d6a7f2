use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;

use tracing_subscriber::EnvFilter;

use crate::BackoffPolicy;
use crate::Database;
use crate::EpochStore;
use crate::MemStateMachine;
use crate::PeerId;
use crate::QuorumNodeConfig;
use crate::QuorumServer;

static LOGGER_INIT: once_cell::sync::Lazy<()> = once_cell::sync::Lazy::new(|| {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
});

pub fn enable_logger() {
    *LOGGER_INIT;
}

pub fn servers(addrs: &[SocketAddr]) -> Vec<QuorumServer> {
    addrs
        .iter()
        .enumerate()
        .map(|(i, addr)| QuorumServer {
            id: i as PeerId + 1,
            addr: *addr,
        })
        .collect()
}

/// Fast ticks and tight retry budgets, suitable for localhost ensembles.
pub fn test_config(
    my_id: PeerId,
    servers: Vec<QuorumServer>,
    data_dir: &Path,
) -> QuorumNodeConfig {
    let mut config = QuorumNodeConfig::default();
    config.cluster.my_id = Some(my_id);
    config.cluster.servers = servers;
    config.cluster.data_dir = data_dir.to_path_buf();
    config.quorum.tick_time_ms = 50;
    config.quorum.init_limit = 10;
    config.quorum.sync_limit = 5;
    config.quorum.preallocate_bytes = 4096;
    config.quorum.segment_max_bytes = 1 << 20;
    config.network.client_request_timeout_ms = 2000;
    config.retry.election = fast_policy(0);
    config.retry.connect_leader = BackoffPolicy {
        max_retries: 5,
        timeout_ms: 200,
        base_delay_ms: 10,
        max_delay_ms: 50,
    };
    config
}

pub fn fast_policy(max_retries: usize) -> BackoffPolicy {
    BackoffPolicy {
        max_retries,
        timeout_ms: 50,
        base_delay_ms: 5,
        max_delay_ms: 20,
    }
}

/// Localhost addresses whose TCP and UDP ports were both free when probed.
pub fn free_addrs(n: usize) -> Vec<SocketAddr> {
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

pub struct TestStorage {
    pub db: Arc<Database>,
    pub epochs: Arc<EpochStore>,
    pub state_machine: Arc<MemStateMachine>,
}

/// Opens (or reopens) the database of `config` and loads it.
pub fn open_storage(config: &QuorumNodeConfig) -> TestStorage {
    let state_machine = MemStateMachine::new();
    let db = Database::open(&config.cluster, &config.quorum, state_machine.clone()).unwrap();
    db.load().unwrap();
    let epochs = EpochStore::open(&config.cluster.data_dir).unwrap();
    TestStorage {
        db: Arc::new(db),
        epochs: Arc::new(epochs),
        state_machine,
    }
}
