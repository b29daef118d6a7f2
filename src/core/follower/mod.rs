mod follower_state;
mod replication;

pub use follower_state::*;
pub(crate) use replication::*;


use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

use tokio::sync::mpsc;

use crate::Error;
use crate::FollowerEvent;
use crate::PeerId;
use crate::Result;
use crate::SubmitReply;
use crate::Zxid;

/// Read side of a running follower, shared with the status record.
#[derive(Debug)]
pub struct FollowerHandle {
    leader_id: PeerId,
    last_zxid: AtomicU64,
    synced: AtomicBool,
    events: mpsc::Sender<FollowerEvent>,
}

impl FollowerHandle {
    pub(crate) fn new(
        leader_id: PeerId,
        last_zxid: Zxid,
        events: mpsc::Sender<FollowerEvent>,
    ) -> Self {
        Self {
            leader_id,
            last_zxid: AtomicU64::new(last_zxid.as_u64()),
            synced: AtomicBool::new(false),
            events,
        }
    }

    pub fn leader_id(&self) -> PeerId {
        self.leader_id
    }

    /// Last zxid this follower has logged.
    pub fn last_zxid(&self) -> Zxid {
        Zxid::from_u64(self.last_zxid.load(Ordering::Acquire))
    }

    /// True once the leader's NewLeader has been acknowledged.
    pub fn is_synced(&self) -> bool {
        self.synced.load(Ordering::Acquire)
    }

    pub(crate) fn set_last_zxid(
        &self,
        zxid: Zxid,
    ) {
        self.last_zxid.store(zxid.as_u64(), Ordering::Release);
    }

    pub(crate) fn set_synced(
        &self,
        synced: bool,
    ) {
        self.synced.store(synced, Ordering::Release);
    }

    pub(crate) async fn forward(
        &self,
        payload: Vec<u8>,
        reply: SubmitReply,
    ) -> Result<()> {
        self.events
            .send(FollowerEvent::Forward { payload, reply })
            .await
            .map_err(|_| Error::NotServing("leader connection is gone".to_string()))
    }
}
