use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tempfile::tempdir;
use tempfile::TempDir;
use tokio::sync::oneshot;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tokio::time::timeout;

use super::*;
use crate::test_utils::enable_logger;
use crate::test_utils::free_addrs;
use crate::test_utils::open_storage;
use crate::test_utils::servers;
use crate::test_utils::test_config;
use crate::test_utils::PacketStream;
use crate::test_utils::TestStorage;
use crate::BroadcastError;
use crate::ConsensusError;
use crate::Error;
use crate::QuorumPacket;
use crate::Result;
use crate::Transaction;
use crate::Zxid;

struct RunningLeader {
    handle: Arc<LeaderHandle>,
    task: JoinHandle<Result<()>>,
    shutdown: watch::Sender<()>,
    storage: TestStorage,
    addr: SocketAddr,
    _dir: TempDir,
}

fn start_leader(ensemble: usize) -> RunningLeader {
    start_leader_with(ensemble, |_| {})
}

fn start_leader_with(
    ensemble: usize,
    prepare: impl FnOnce(&TestStorage),
) -> RunningLeader {
    enable_logger();
    let dir = tempdir().unwrap();
    let addrs = free_addrs(ensemble);
    let config = Arc::new(test_config(1, servers(&addrs), dir.path()));
    let storage = open_storage(&config);
    prepare(&storage);

    let mut leader = Leader::new(1, config, storage.db.clone(), storage.epochs.clone());
    let handle = leader.handle();
    let (shutdown, rx) = watch::channel(());
    let task = tokio::spawn(async move { leader.lead(rx).await });

    RunningLeader {
        handle,
        task,
        shutdown,
        storage,
        addr: addrs[0],
        _dir: dir,
    }
}

async fn wait_established(handle: &LeaderHandle) {
    for _ in 0..200 {
        if handle.is_established() {
            return;
        }
        sleep(Duration::from_millis(10)).await;
    }
    panic!("leader never established");
}

/// Connects as `peer_id`, consumes the sync stream and acknowledges it.
async fn synced_follower(
    addr: SocketAddr,
    peer_id: u64,
) -> (PacketStream, QuorumPacket) {
    let mut follower = PacketStream::connect(addr).await;
    follower
        .send(QuorumPacket::FollowerInfo {
            peer_id,
            last_zxid: Zxid::ZERO,
            accepted_epoch: 0,
        })
        .await;
    let sync = follower.recv_skip_pings().await;
    let epoch = match follower.recv_skip_pings().await {
        QuorumPacket::NewLeader { epoch, .. } => epoch,
        other => panic!("expected NEWLEADER, got {}", other.name()),
    };
    follower.send(QuorumPacket::NewLeaderAck { epoch }).await;
    (follower, sync)
}

async fn submit(
    handle: &LeaderHandle,
    payload: &[u8],
) -> oneshot::Receiver<Result<Zxid>> {
    let (tx, rx) = oneshot::channel();
    handle.submit(payload.to_vec(), tx).await.unwrap();
    rx
}

#[tokio::test]
async fn single_peer_commits_on_its_own_ack() {
    let leader = start_leader(1);
    wait_established(&leader.handle).await;
    assert_eq!(leader.handle.epoch(), 1);
    assert_eq!(leader.storage.epochs.accepted_epoch(), 1);

    let first = submit(&leader.handle, b"a").await.await.unwrap().unwrap();
    let second = submit(&leader.handle, b"b").await.await.unwrap().unwrap();

    assert_eq!(first, Zxid::new(1, 0));
    assert_eq!(second, Zxid::new(1, 1));
    assert_eq!(leader.storage.state_machine.applied_zxids(), vec![first, second]);
    assert_eq!(leader.handle.last_proposed(), second);

    leader.shutdown.send(()).unwrap();
    assert!(leader.task.await.unwrap().is_ok());
}

#[tokio::test]
async fn proposal_commits_after_follower_ack() {
    let leader = start_leader(3);
    let (mut follower, sync) = synced_follower(leader.addr, 2).await;
    assert_eq!(
        sync,
        QuorumPacket::Diff {
            txns: vec![],
            committed: Zxid::ZERO
        }
    );
    wait_established(&leader.handle).await;

    let pending = submit(&leader.handle, b"x").await;
    let txn = match follower.recv_skip_pings().await {
        QuorumPacket::Proposal { txn } => txn,
        other => panic!("expected PROPOSAL, got {}", other.name()),
    };
    assert_eq!(txn, Transaction::new(Zxid::new(1, 0), b"x".to_vec()));
    assert!(leader.storage.state_machine.is_empty());

    follower.send(QuorumPacket::Ack { zxid: txn.zxid }).await;
    assert_eq!(follower.recv_skip_pings().await, QuorumPacket::Commit { zxid: txn.zxid });
    assert_eq!(pending.await.unwrap().unwrap(), txn.zxid);
    assert_eq!(leader.storage.state_machine.applied_zxids(), vec![txn.zxid]);

    leader.shutdown.send(()).unwrap();
    assert!(leader.task.await.unwrap().is_ok());
}

#[tokio::test]
async fn forwarded_request_is_accepted_then_committed() {
    let leader = start_leader(3);
    let (mut follower, _) = synced_follower(leader.addr, 2).await;

    follower
        .send(QuorumPacket::Request {
            request_id: 7,
            payload: b"fw".to_vec(),
        })
        .await;
    let zxid = match follower.recv_skip_pings().await {
        QuorumPacket::Proposal { txn } => txn.zxid,
        other => panic!("expected PROPOSAL, got {}", other.name()),
    };
    assert_eq!(
        follower.recv_skip_pings().await,
        QuorumPacket::RequestAccepted { request_id: 7, zxid }
    );
    follower.send(QuorumPacket::Ack { zxid }).await;
    assert_eq!(follower.recv_skip_pings().await, QuorumPacket::Commit { zxid });

    leader.shutdown.send(()).unwrap();
    leader.task.await.unwrap().unwrap();
}

#[tokio::test]
async fn late_follower_receives_committed_history_as_diff() {
    let leader = start_leader(3);
    let (mut first, _) = synced_follower(leader.addr, 2).await;

    let pending = submit(&leader.handle, b"h").await;
    let zxid = match first.recv_skip_pings().await {
        QuorumPacket::Proposal { txn } => txn.zxid,
        other => panic!("expected PROPOSAL, got {}", other.name()),
    };
    first.send(QuorumPacket::Ack { zxid }).await;
    pending.await.unwrap().unwrap();

    let (_second, sync) = synced_follower(leader.addr, 3).await;
    assert_eq!(
        sync,
        QuorumPacket::Diff {
            txns: vec![Transaction::new(zxid, b"h".to_vec())],
            committed: zxid,
        }
    );

    leader.shutdown.send(()).unwrap();
    leader.task.await.unwrap().unwrap();
}

#[tokio::test]
async fn submissions_before_establishment_are_refused() {
    let leader = start_leader(3);

    let reply = submit(&leader.handle, b"early").await.await.unwrap();
    assert!(matches!(reply, Err(Error::NotServing(_))));

    leader.shutdown.send(()).unwrap();
    assert!(leader.task.await.unwrap().is_ok());
}

#[tokio::test]
async fn no_quorum_within_init_window_fails() {
    let leader = start_leader(3);

    let result = timeout(Duration::from_secs(5), leader.task).await.unwrap().unwrap();
    match result {
        Err(Error::Consensus(ConsensusError::Broadcast(BroadcastError::EpochNotEstablished(_)))) => {}
        other => panic!("unexpected {:?}", other),
    }
    assert!(!leader.handle.is_established());
}

#[tokio::test]
async fn leader_gives_up_when_its_only_follower_leaves() {
    let leader = start_leader(3);
    let (follower, _) = synced_follower(leader.addr, 2).await;
    wait_established(&leader.handle).await;
    drop(follower);

    let result = timeout(Duration::from_secs(5), leader.task).await.unwrap().unwrap();
    let err = result.unwrap_err();
    assert_eq!(err.kind(), "quorum_lost");
}

#[tokio::test]
async fn unknown_peer_is_disconnected() {
    let leader = start_leader(3);
    let mut stranger = PacketStream::connect(leader.addr).await;
    stranger
        .send(QuorumPacket::FollowerInfo {
            peer_id: 42,
            last_zxid: Zxid::ZERO,
            accepted_epoch: 0,
        })
        .await;

    assert!(stranger.is_closed().await);
    leader.shutdown.send(()).unwrap();
    leader.task.await.unwrap().unwrap();
}

#[tokio::test]
async fn epoch_moves_past_follower_history() {
    let leader = start_leader(3);
    let mut follower = PacketStream::connect(leader.addr).await;
    follower
        .send(QuorumPacket::FollowerInfo {
            peer_id: 2,
            last_zxid: Zxid::new(4, 2),
            accepted_epoch: 6,
        })
        .await;

    // the follower is ahead of our commits, so it is reset to our snapshot
    assert!(matches!(follower.recv_skip_pings().await, QuorumPacket::Snapshot { .. }));
    assert_eq!(
        follower.recv_skip_pings().await,
        QuorumPacket::NewLeader {
            epoch: 7,
            zxid: Zxid::ZERO
        }
    );
    assert_eq!(leader.storage.epochs.accepted_epoch(), 7);

    leader.shutdown.send(()).unwrap();
    leader.task.await.unwrap().unwrap();
}

/// Logs a proposal without committing it and reloads, as after a crash.
fn recover_uncommitted(storage: &TestStorage) {
    storage.db.log_proposal(&Transaction::new(Zxid::new(1, 0), b"recovered".to_vec())).unwrap();
    storage.db.load().unwrap();
}

#[tokio::test]
async fn single_peer_commits_recovered_proposal_on_establishment() {
    let leader = start_leader_with(1, recover_uncommitted);
    assert!(leader.storage.state_machine.is_empty());
    wait_established(&leader.handle).await;
    assert_eq!(leader.handle.epoch(), 2);

    for _ in 0..200 {
        if !leader.storage.state_machine.is_empty() {
            break;
        }
        sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(leader.storage.state_machine.applied_zxids(), vec![Zxid::new(1, 0)]);

    let next = submit(&leader.handle, b"b").await.await.unwrap().unwrap();
    assert_eq!(next, Zxid::new(2, 0));

    leader.shutdown.send(()).unwrap();
    assert!(leader.task.await.unwrap().is_ok());
}

#[tokio::test]
async fn recovered_proposal_waits_for_a_quorum() {
    let leader = start_leader_with(3, recover_uncommitted);
    let (mut follower, sync) = synced_follower(leader.addr, 2).await;
    assert_eq!(
        sync,
        QuorumPacket::Diff {
            txns: vec![],
            committed: Zxid::ZERO
        }
    );

    let recovered = Transaction::new(Zxid::new(1, 0), b"recovered".to_vec());
    assert_eq!(
        follower.recv_skip_pings().await,
        QuorumPacket::Proposal { txn: recovered.clone() }
    );
    assert!(leader.storage.state_machine.is_empty());

    follower.send(QuorumPacket::Ack { zxid: recovered.zxid }).await;
    assert_eq!(
        follower.recv_skip_pings().await,
        QuorumPacket::Commit { zxid: recovered.zxid }
    );
    assert_eq!(leader.storage.state_machine.applied_zxids(), vec![recovered.zxid]);

    leader.shutdown.send(()).unwrap();
    assert!(leader.task.await.unwrap().is_ok());
}

#[tokio::test]
async fn follower_holding_recovered_proposal_is_not_reset() {
    let leader = start_leader_with(3, recover_uncommitted);
    let recovered = Zxid::new(1, 0);

    // the follower committed (1,0) under the previous leader
    let mut follower = PacketStream::connect(leader.addr).await;
    follower
        .send(QuorumPacket::FollowerInfo {
            peer_id: 2,
            last_zxid: recovered,
            accepted_epoch: 1,
        })
        .await;
    assert_eq!(
        follower.recv_skip_pings().await,
        QuorumPacket::Diff {
            txns: vec![],
            committed: Zxid::ZERO
        }
    );
    assert_eq!(
        follower.recv_skip_pings().await,
        QuorumPacket::NewLeader {
            epoch: 2,
            zxid: Zxid::ZERO
        }
    );
    assert!(leader.storage.state_machine.is_empty());

    // its NEWLEADER_ACK covers the proposal it already logged
    follower.send(QuorumPacket::NewLeaderAck { epoch: 2 }).await;
    assert_eq!(
        follower.recv_skip_pings().await,
        QuorumPacket::Commit { zxid: recovered }
    );
    assert_eq!(leader.storage.state_machine.applied_zxids(), vec![recovered]);

    let next = submit(&leader.handle, b"next").await;
    assert_eq!(
        follower.recv_skip_pings().await,
        QuorumPacket::Proposal {
            txn: Transaction::new(Zxid::new(2, 0), b"next".to_vec())
        }
    );
    follower.send(QuorumPacket::Ack { zxid: Zxid::new(2, 0) }).await;
    assert_eq!(next.await.unwrap().unwrap(), Zxid::new(2, 0));

    leader.shutdown.send(()).unwrap();
    assert!(leader.task.await.unwrap().is_ok());
}
