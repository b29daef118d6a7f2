mod leader_state;
mod learner_handler;
mod proposal_tracker;
mod sync;

pub use leader_state::*;
pub(crate) use learner_handler::*;
pub use proposal_tracker::*;
pub use sync::*;

#[cfg(test)]
mod leader_state_test;

use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicU32;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

use tokio::sync::mpsc;

use crate::Error;
use crate::LeaderEvent;
use crate::Result;
use crate::SubmitReply;
use crate::Zxid;

/// Read side of a running leader, shared with the status record.
#[derive(Debug)]
pub struct LeaderHandle {
    epoch: AtomicU32,
    established: AtomicBool,
    last_proposed: AtomicU64,
    events: mpsc::Sender<LeaderEvent>,
}

impl LeaderHandle {
    pub(crate) fn new(
        last_zxid: Zxid,
        events: mpsc::Sender<LeaderEvent>,
    ) -> Self {
        Self {
            epoch: AtomicU32::new(0),
            established: AtomicBool::new(false),
            last_proposed: AtomicU64::new(last_zxid.as_u64()),
            events,
        }
    }

    /// Epoch of this leadership, 0 until a quorum agreed on it.
    pub fn epoch(&self) -> u32 {
        self.epoch.load(Ordering::Acquire)
    }

    pub fn is_established(&self) -> bool {
        self.established.load(Ordering::Acquire)
    }

    pub fn last_proposed(&self) -> Zxid {
        Zxid::from_u64(self.last_proposed.load(Ordering::Acquire))
    }

    pub(crate) fn establish(
        &self,
        epoch: u32,
    ) {
        self.epoch.store(epoch, Ordering::Release);
        self.established.store(true, Ordering::Release);
    }

    pub(crate) fn set_last_proposed(
        &self,
        zxid: Zxid,
    ) {
        self.last_proposed.store(zxid.as_u64(), Ordering::Release);
    }

    pub(crate) async fn submit(
        &self,
        payload: Vec<u8>,
        reply: SubmitReply,
    ) -> Result<()> {
        self.events
            .send(LeaderEvent::ClientPropose { payload, reply })
            .await
            .map_err(|_| Error::NotServing("leader loop is gone".to_string()))
    }
}
