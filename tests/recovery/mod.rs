use quorum_engine::Zxid;

use crate::common::enable_logger;
use crate::common::TestContext;

/// A whole-ensemble restart keeps committed history and opens a new epoch.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_full_restart_recovers_history() {
    enable_logger();
    let mut ctx = TestContext::start(3);
    ctx.wait_for_leader().await;

    let mut committed = Vec::new();
    for i in 0..3u8 {
        committed.push(ctx.peer(1).handle.submit(vec![i]).await.unwrap());
    }
    ctx.wait_applied_everywhere(committed[2]).await;

    for id in 1..=3 {
        ctx.stop_peer(id).await;
    }
    for id in 1..=3 {
        ctx.restart_peer(id);
        // logged history is replayed before the first election
        assert_eq!(ctx.peer(id).state_machine.applied_zxids(), committed);
    }

    ctx.wait_for_leader().await;
    let zxid = ctx.peer(2).handle.submit(b"new-epoch".to_vec()).await.unwrap();
    assert_eq!(zxid, Zxid::new(2, 0));
    ctx.wait_applied_everywhere(zxid).await;

    ctx.stop_all().await;
}

/// A follower that missed commits while down catches up on rejoining.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_lagging_follower_catches_up() {
    enable_logger();
    let mut ctx = TestContext::start(3);
    assert_eq!(ctx.wait_for_leader().await, 3);

    ctx.stop_peer(1).await;
    let mut missed = Vec::new();
    for i in 0..5u8 {
        missed.push(ctx.peer(3).handle.submit(vec![i]).await.unwrap());
    }

    ctx.restart_peer(1);
    assert!(ctx.peer(1).state_machine.is_empty());
    assert_eq!(ctx.wait_for_leader().await, 3);
    ctx.wait_applied_everywhere(missed[4]).await;
    assert_eq!(ctx.peer(1).state_machine.applied_zxids(), missed);

    ctx.stop_all().await;
}
