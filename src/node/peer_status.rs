use std::sync::Arc;

use arc_swap::ArcSwap;

use crate::Error;
use crate::FollowerHandle;
use crate::LeaderHandle;
use crate::PeerId;
use crate::ServerState;
use crate::Vote;

/// Running role, if any.
#[derive(Debug, Clone)]
pub enum RoleHandle {
    None,
    Leading(Arc<LeaderHandle>),
    Following(Arc<FollowerHandle>),
}

/// One consistent view of the peer. State and role are always swapped in
/// together.
#[derive(Debug, Clone)]
pub struct StatusRecord {
    pub state: ServerState,
    pub vote: Vote,
    pub role: RoleHandle,
    pub last_failure: Option<String>,
}

/// Lock-free status record shared by the peer loop, the status responder
/// and client handles.
#[derive(Debug)]
pub struct PeerStatus {
    my_id: PeerId,
    record: ArcSwap<StatusRecord>,
}

impl PeerStatus {
    pub fn new(
        my_id: PeerId,
        vote: Vote,
    ) -> Self {
        Self {
            my_id,
            record: ArcSwap::from_pointee(StatusRecord {
                state: ServerState::Looking,
                vote,
                role: RoleHandle::None,
                last_failure: None,
            }),
        }
    }

    pub fn my_id(&self) -> PeerId {
        self.my_id
    }

    pub fn load(&self) -> Arc<StatusRecord> {
        self.record.load_full()
    }

    pub fn state(&self) -> ServerState {
        self.record.load().state
    }

    pub fn vote(&self) -> Vote {
        self.record.load().vote
    }

    pub fn set_vote(
        &self,
        vote: Vote,
    ) {
        self.record.rcu(|current| StatusRecord {
            vote,
            ..(**current).clone()
        });
    }

    pub(crate) fn enter_looking(
        &self,
        vote: Vote,
    ) {
        self.swap_role(ServerState::Looking, vote, RoleHandle::None);
    }

    pub(crate) fn enter_leading(
        &self,
        vote: Vote,
        handle: Arc<LeaderHandle>,
    ) {
        self.swap_role(ServerState::Leading, vote, RoleHandle::Leading(handle));
    }

    pub(crate) fn enter_following(
        &self,
        vote: Vote,
        handle: Arc<FollowerHandle>,
    ) {
        self.swap_role(ServerState::Following, vote, RoleHandle::Following(handle));
    }

    fn swap_role(
        &self,
        state: ServerState,
        vote: Vote,
        role: RoleHandle,
    ) {
        self.record.rcu(|current| StatusRecord {
            state,
            vote,
            role: role.clone(),
            last_failure: current.last_failure.clone(),
        });
    }

    pub(crate) fn record_failure(
        &self,
        error: &Error,
    ) {
        let reason = format!("{}: {}", error.kind(), error);
        self.record.rcu(|current| StatusRecord {
            last_failure: Some(reason.clone()),
            ..(**current).clone()
        });
    }

    /// What the status datagram reports as `(leader id, leader zxid)`.
    pub fn answer(&self) -> Vote {
        let record = self.record.load();
        match (&record.state, &record.role) {
            (ServerState::Leading, RoleHandle::Leading(leader)) => Vote::new(self.my_id, leader.last_proposed()),
            (ServerState::Following, RoleHandle::Following(follower)) => {
                Vote::new(follower.leader_id(), follower.last_zxid())
            }
            _ => record.vote,
        }
    }

    /// Leader this peer currently serves under, `None` while LOOKING.
    pub fn leader_id(&self) -> Option<PeerId> {
        let record = self.record.load();
        match &record.role {
            RoleHandle::Leading(_) => Some(self.my_id),
            RoleHandle::Following(follower) => Some(follower.leader_id()),
            RoleHandle::None => None,
        }
    }
}
