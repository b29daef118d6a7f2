use std::time::Duration;

use quorum_engine::ServerState;
use quorum_engine::Zxid;

use crate::common::enable_logger;
use crate::common::TestContext;

const ITERATIONS: u32 = 10;

/// Every peer applies the same transactions in the same order, whichever
/// peer they were submitted to.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_submissions_apply_in_order_everywhere() {
    enable_logger();
    let ctx = TestContext::start(3);
    ctx.wait_for_leader().await;

    let mut committed = Vec::new();
    for i in 0..ITERATIONS {
        let target = ctx.peer((i % 3) as u64 + 1);
        let zxid = target.handle.submit(format!("txn-{}", i).into_bytes()).await.unwrap();
        // the submitting peer has already applied it
        assert!(target.state_machine.applied_zxids().contains(&zxid));
        committed.push(zxid);
    }

    let expected: Vec<Zxid> = (0..ITERATIONS).map(|c| Zxid::new(1, c)).collect();
    assert_eq!(committed, expected);

    ctx.wait_applied_everywhere(expected[expected.len() - 1]).await;
    for peer in ctx.running() {
        assert_eq!(peer.state_machine.applied_zxids(), expected);
        let payloads: Vec<Vec<u8>> = peer.state_machine.applied().into_iter().map(|t| t.payload).collect();
        assert_eq!(payloads[3], b"txn-3".to_vec());
    }

    ctx.stop_all().await;
}

/// Broadcast continues with one follower down, and the leader steps down
/// once it is alone.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_leader_steps_down_without_quorum() {
    enable_logger();
    let mut ctx = TestContext::start(3);
    assert_eq!(ctx.wait_for_leader().await, 3);

    ctx.stop_peer(1).await;
    let zxid = ctx.peer(3).handle.submit(b"two-of-three".to_vec()).await.unwrap();
    ctx.wait_applied_everywhere(zxid).await;

    ctx.stop_peer(2).await;
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while ctx.peer(3).handle.state() != ServerState::Looking {
        assert!(tokio::time::Instant::now() < deadline, "leader kept leading alone");
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    let failure = ctx.peer(3).handle.status().last_failure.clone().unwrap();
    assert!(failure.starts_with("quorum_lost"), "{}", failure);

    ctx.stop_all().await;
}
