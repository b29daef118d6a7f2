use quorum_engine::ServerState;
use quorum_engine::Zxid;

use crate::common::enable_logger;
use crate::common::TestContext;

/// Fresh ensemble with equal (empty) histories elects the highest id.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_fresh_ensemble_elects_highest_id() {
    enable_logger();
    let ctx = TestContext::start(3);

    let leader = ctx.wait_for_leader().await;
    assert_eq!(leader, 3);
    assert_eq!(ctx.peer(1).handle.state(), ServerState::Following);
    assert_eq!(ctx.peer(2).handle.state(), ServerState::Following);

    ctx.stop_all().await;
}

/// The most up-to-date history wins over a higher id.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_longest_history_wins_reelection() {
    enable_logger();
    let mut ctx = TestContext::start(3);
    assert_eq!(ctx.wait_for_leader().await, 3);

    // peer 3 stops, 2 takes over in epoch 2 and commits with 1
    ctx.stop_peer(3).await;
    let leader = ctx.wait_for_leader().await;
    assert_eq!(leader, 2);
    let zxid = ctx.peer(1).handle.submit(b"after-failover".to_vec()).await.unwrap();
    assert_eq!(zxid, Zxid::new(2, 0));
    ctx.wait_applied_everywhere(zxid).await;

    // peer 3 has the highest id but the oldest history, so it follows
    ctx.restart_peer(3);
    assert_eq!(ctx.wait_for_leader().await, 2);
    ctx.wait_applied_everywhere(zxid).await;
    assert_eq!(ctx.peer(3).handle.state(), ServerState::Following);

    ctx.stop_all().await;
}

/// A lone peer of a three peer ensemble never reaches a quorum.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_minority_keeps_looking() {
    enable_logger();
    let mut ctx = TestContext::start(3);
    ctx.wait_for_leader().await;

    ctx.stop_peer(3).await;
    ctx.stop_peer(2).await;

    // the remaining peer gives up on its leader and cannot elect itself
    tokio::time::sleep(std::time::Duration::from_secs(2)).await;
    let peer = ctx.peer(1);
    assert_eq!(peer.handle.state(), ServerState::Looking);
    let err = peer.handle.submit(b"rejected".to_vec()).await.unwrap_err();
    assert_eq!(err.kind(), "not_serving");
    assert!(peer.handle.status().last_failure.is_some());

    ctx.stop_all().await;
}
