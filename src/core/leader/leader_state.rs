//! LEADING role.
//!
//! Lifecycle of one leadership:
//! 1. Listen for followers and wait until a quorum is connected.
//! 2. Pick an epoch above everything the quorum has seen and persist it.
//! 3. Bring each follower up to date (diff or snapshot) and announce
//!    NEWLEADER; a follower counts towards commits once it acknowledged.
//! 4. Broadcast: every mutation is logged, proposed and committed in zxid
//!    order once a quorum acknowledged it.
//!
//! All state lives on the loop task; connection tasks talk to it through
//! [`LeaderEvent`]s.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::sync::watch;
use tokio::time::interval;
use tokio::time::sleep_until;
use tokio::time::Instant;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::debug;
use tracing::error;
use tracing::info;
use tracing::instrument;
use tracing::trace;
use tracing::warn;

use super::accept_loop;
use super::sync_packet;
use super::SyncMode;
use super::AckOutcome;
use super::LeaderHandle;
use super::LearnerSettings;
use super::ProposalTracker;
use crate::quorum_size;
use crate::BroadcastError;
use crate::Database;
use crate::ElectionError;
use crate::EpochStore;
use crate::Error;
use crate::LeaderEvent;
use crate::NetworkError;
use crate::PeerId;
use crate::QuorumNodeConfig;
use crate::QuorumPacket;
use crate::Result;
use crate::SubmitReply;
use crate::Transaction;
use crate::Zxid;
use crate::COMMITS_TOTAL;
use crate::COMMIT_LATENCY_MS;
use crate::FOLLOWER_SYNC_TOTAL;
use crate::OUTSTANDING_PROPOSALS;
use crate::PROPOSALS_TOTAL;
use crate::SYNCED_FOLLOWERS;

struct FollowerLink {
    conn_id: u64,
    outbound: mpsc::Sender<QuorumPacket>,
    last_zxid: Zxid,
    accepted_epoch: u32,
    /// NEWLEADER acknowledged; only synced followers count for quorums
    synced: bool,
    /// Outstanding proposals up to here were already logged by the follower
    /// and are acknowledged on its NEWLEADER_ACK
    holds_through: Zxid,
    last_seen: Instant,
}

pub struct Leader {
    my_id: PeerId,
    config: Arc<QuorumNodeConfig>,
    db: Arc<Database>,
    epoch_store: Arc<EpochStore>,
    handle: Arc<LeaderHandle>,
    events_tx: mpsc::Sender<LeaderEvent>,
    events_rx: mpsc::Receiver<LeaderEvent>,
    followers: HashMap<PeerId, FollowerLink>,
    tracker: ProposalTracker,
    epoch: u32,
    next_zxid: Zxid,
    established_at: Option<Instant>,
    cancel: CancellationToken,
    tasks: TaskTracker,
}

impl std::fmt::Debug for Leader {
    fn fmt(
        &self,
        f: &mut std::fmt::Formatter<'_>,
    ) -> std::fmt::Result {
        f.debug_struct("Leader")
            .field("my_id", &self.my_id)
            .field("epoch", &self.epoch)
            .field("followers", &self.followers.len())
            .field("outstanding", &self.tracker.len())
            .finish()
    }
}

impl Leader {
    pub fn new(
        my_id: PeerId,
        config: Arc<QuorumNodeConfig>,
        db: Arc<Database>,
        epoch_store: Arc<EpochStore>,
    ) -> Self {
        let (events_tx, events_rx) = mpsc::channel(config.network.buffer_size);
        let last = db.last_committed();
        let handle = Arc::new(LeaderHandle::new(last, events_tx.clone()));
        let tracker = ProposalTracker::new(config.cluster.servers.len(), last);
        Self {
            my_id,
            config,
            db,
            epoch_store,
            handle,
            events_tx,
            events_rx,
            followers: HashMap::new(),
            tracker,
            epoch: 0,
            next_zxid: Zxid::ZERO,
            established_at: None,
            cancel: CancellationToken::new(),
            tasks: TaskTracker::new(),
        }
    }

    pub fn handle(&self) -> Arc<LeaderHandle> {
        self.handle.clone()
    }

    /// Leads until shutdown (`Ok`) or until leadership cannot be kept.
    #[instrument(skip(self, shutdown), fields(my_id = self.my_id))]
    pub async fn lead(
        &mut self,
        shutdown: watch::Receiver<()>,
    ) -> Result<()> {
        let addr = self
            .config
            .cluster
            .server(self.my_id)
            .map(|s| s.addr)
            .ok_or(ElectionError::NotAMember(self.my_id))?;
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| NetworkError::BindFailed { addr, source })?;
        info!("leader {} accepting followers on {}", self.my_id, addr);

        self.tasks.spawn(accept_loop(
            listener,
            self.events_tx.clone(),
            self.learner_settings(),
            self.cancel.clone(),
            self.tasks.clone(),
        ));

        let result = self.run(shutdown).await;

        self.cancel.cancel();
        self.tasks.close();
        self.tasks.wait().await;
        self.followers.clear();
        self.tracker.fail_all("leadership ended");
        while let Ok(event) = self.events_rx.try_recv() {
            if let LeaderEvent::ClientPropose { reply, .. } = event {
                let _ = reply.send(Err(Error::NotServing("leadership ended".to_string())));
            }
        }
        SYNCED_FOLLOWERS.set(0);
        OUTSTANDING_PROPOSALS.set(0);

        result
    }

    fn learner_settings(&self) -> LearnerSettings {
        LearnerSettings {
            max_frame_bytes: self.config.network.max_frame_bytes,
            handshake_timeout: self.config.quorum.init_timeout(),
            buffer_size: self.config.network.buffer_size,
        }
    }

    async fn run(
        &mut self,
        mut shutdown: watch::Receiver<()>,
    ) -> Result<()> {
        if !self.establish_epoch(&mut shutdown).await? {
            return Ok(());
        }

        let mut ticker = interval(self.config.quorum.tick());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                biased;
                _ = shutdown.changed() => {
                    info!("leader {} shutting down", self.my_id);
                    return Ok(());
                }
                Some(event) = self.events_rx.recv() => {
                    self.handle_event(event)?;
                }
                _ = ticker.tick() => {
                    self.on_tick()?;
                }
            }
        }
    }

    /// Waits for a quorum of followers, then fixes and announces the epoch.
    /// `Ok(false)` means shutdown was requested first.
    async fn establish_epoch(
        &mut self,
        shutdown: &mut watch::Receiver<()>,
    ) -> Result<bool> {
        let required = quorum_size(self.config.cluster.servers.len());
        let init_timeout = self.config.quorum.init_timeout();
        let deadline = Instant::now() + init_timeout;

        while self.followers.len() + 1 < required {
            tokio::select! {
                biased;
                _ = shutdown.changed() => return Ok(false),
                _ = sleep_until(deadline) => {
                    warn!(
                        "only {} of {} peers connected within {:?}",
                        self.followers.len() + 1,
                        required,
                        init_timeout
                    );
                    return Err(BroadcastError::EpochNotEstablished(init_timeout).into());
                }
                Some(event) = self.events_rx.recv() => self.handle_event(event)?,
            }
        }

        let mut highest = self.db.last_logged().epoch.max(self.epoch_store.accepted_epoch());
        for link in self.followers.values() {
            highest = highest.max(link.last_zxid.epoch).max(link.accepted_epoch);
        }
        let epoch = highest
            .checked_add(1)
            .ok_or_else(|| Error::Fatal(format!("epoch space exhausted at {}", highest)))?;
        self.epoch_store.accept(epoch)?;

        self.epoch = epoch;
        self.next_zxid = Zxid::first_of_epoch(epoch);
        self.handle.establish(epoch);
        self.established_at = Some(Instant::now());
        info!(
            epoch,
            last_committed = %self.db.last_committed(),
            "leader {} established with {} followers",
            self.my_id,
            self.followers.len()
        );

        // logged proposals of earlier epochs go through a quorum again
        let recovered = self.db.take_recovered();
        if let Some(last) = recovered.last() {
            info!(count = recovered.len(), last = %last.zxid, "re-proposing recovered proposals");
        }
        for txn in recovered {
            let zxid = txn.zxid;
            self.handle.set_last_proposed(zxid);
            self.tracker.propose(txn, None);
            self.tracker.ack(self.my_id, zxid);
        }
        OUTSTANDING_PROPOSALS.set(self.tracker.len() as i64);

        let connected: Vec<PeerId> = self.followers.keys().copied().collect();
        for peer_id in connected {
            self.sync_follower(peer_id)?;
        }
        self.commit_ready()?;
        Ok(true)
    }

    fn is_established(&self) -> bool {
        self.established_at.is_some()
    }

    fn handle_event(
        &mut self,
        event: LeaderEvent,
    ) -> Result<()> {
        match event {
            LeaderEvent::FollowerConnected {
                conn_id,
                peer_id,
                last_zxid,
                accepted_epoch,
                outbound,
            } => self.register_follower(conn_id, peer_id, last_zxid, accepted_epoch, outbound),
            LeaderEvent::FollowerPacket {
                conn_id,
                peer_id,
                packet,
            } => self.on_follower_packet(conn_id, peer_id, packet),
            LeaderEvent::FollowerDisconnected {
                conn_id,
                peer_id,
                reason,
            } => {
                if self.followers.get(&peer_id).map(|l| l.conn_id) == Some(conn_id) {
                    info!(peer_id, "follower disconnected: {}", reason);
                    self.followers.remove(&peer_id);
                    self.update_synced_gauge();
                }
                Ok(())
            }
            LeaderEvent::ClientPropose { payload, reply } => {
                if !self.is_established() {
                    let _ = reply.send(Err(Error::NotServing("leader not established yet".to_string())));
                    return Ok(());
                }
                self.propose(payload, Some(reply)).map(|_| ())
            }
        }
    }

    fn register_follower(
        &mut self,
        conn_id: u64,
        peer_id: PeerId,
        last_zxid: Zxid,
        accepted_epoch: u32,
        outbound: mpsc::Sender<QuorumPacket>,
    ) -> Result<()> {
        if peer_id == self.my_id || self.config.cluster.server(peer_id).is_none() {
            warn!(conn_id, "rejecting connection claiming to be peer {}", peer_id);
            return Ok(());
        }
        if self.is_established() && accepted_epoch > self.epoch {
            warn!(
                peer_id,
                "follower accepted epoch {} beyond ours {}, refusing it", accepted_epoch, self.epoch
            );
            return Ok(());
        }

        let link = FollowerLink {
            conn_id,
            outbound,
            last_zxid,
            accepted_epoch,
            synced: false,
            holds_through: Zxid::ZERO,
            last_seen: Instant::now(),
        };
        if let Some(old) = self.followers.insert(peer_id, link) {
            info!(peer_id, "connection {} replaces {}", conn_id, old.conn_id);
            self.update_synced_gauge();
        }

        if self.is_established() {
            self.sync_follower(peer_id)?;
        }
        Ok(())
    }

    /// Queues the catch-up stream for one follower: DIFF or SNAP, NEWLEADER,
    /// then every outstanding proposal the follower does not hold yet.
    fn sync_follower(
        &mut self,
        peer_id: PeerId,
    ) -> Result<()> {
        let Some(link) = self.followers.get(&peer_id) else {
            return Ok(());
        };
        let follower_last = link.last_zxid;
        let outstanding: Vec<Zxid> = self.tracker.outstanding().map(|t| t.zxid).collect();
        let (mode, packet) = sync_packet(&self.db, follower_last, &outstanding)?;
        FOLLOWER_SYNC_TOTAL.with_label_values(&[mode.as_str()]).inc();
        info!(
            peer_id,
            %follower_last,
            last_committed = %self.db.last_committed(),
            outstanding = self.tracker.len(),
            "synchronizing follower by {}",
            mode.as_str()
        );

        let mut stream = vec![
            packet,
            QuorumPacket::NewLeader {
                epoch: self.epoch,
                zxid: self.db.last_committed(),
            },
        ];
        // after a diff the follower already logged everything up to its last zxid
        let held = match mode {
            SyncMode::Diff => follower_last,
            SyncMode::Snapshot => Zxid::ZERO,
        };
        stream.extend(
            self.tracker
                .outstanding()
                .filter(|txn| txn.zxid > held)
                .map(|txn| QuorumPacket::Proposal { txn: txn.clone() }),
        );
        if let Some(link) = self.followers.get_mut(&peer_id) {
            link.holds_through = held;
        }
        for packet in stream {
            if !self.send_to(peer_id, packet) {
                break;
            }
        }
        Ok(())
    }

    fn on_follower_packet(
        &mut self,
        conn_id: u64,
        peer_id: PeerId,
        packet: QuorumPacket,
    ) -> Result<()> {
        let epoch = self.epoch;
        let synced = match self.followers.get_mut(&peer_id) {
            Some(link) if link.conn_id == conn_id => {
                link.last_seen = Instant::now();
                link.synced
            }
            _ => {
                trace!(conn_id, peer_id, "packet from superseded connection");
                return Ok(());
            }
        };
        trace!(peer_id, "received {}", packet.name());

        match packet {
            QuorumPacket::NewLeaderAck { epoch: acked } if acked == epoch && self.is_established() => {
                if !synced {
                    let mut held = Zxid::ZERO;
                    if let Some(link) = self.followers.get_mut(&peer_id) {
                        link.synced = true;
                        held = link.holds_through;
                    }
                    info!(peer_id, epoch, "follower synchronized");
                    self.update_synced_gauge();

                    let already_logged: Vec<Zxid> = self
                        .tracker
                        .outstanding()
                        .map(|t| t.zxid)
                        .take_while(|zxid| *zxid <= held)
                        .collect();
                    if !already_logged.is_empty() {
                        debug!(
                            peer_id,
                            through = %held,
                            "follower holds {} outstanding proposals",
                            already_logged.len()
                        );
                        for zxid in already_logged {
                            self.tracker.ack(peer_id, zxid);
                        }
                        self.commit_ready()?;
                    }
                }
            }
            QuorumPacket::NewLeaderAck { epoch: acked } => {
                debug!(peer_id, "NEWLEADER_ACK for epoch {} ignored, leading {}", acked, epoch);
            }
            QuorumPacket::Ack { zxid } => {
                if !synced {
                    debug!(peer_id, %zxid, "ack before NEWLEADER_ACK ignored");
                    return Ok(());
                }
                match self.tracker.ack(peer_id, zxid) {
                    AckOutcome::Counted => self.commit_ready()?,
                    AckOutcome::Duplicate | AckOutcome::Stale => {}
                    AckOutcome::Unknown => debug!(peer_id, %zxid, "ack for unknown proposal"),
                }
            }
            QuorumPacket::Ping { .. } => {}
            QuorumPacket::Request { request_id, payload } => {
                let reply = if self.is_established() {
                    let zxid = self.propose(payload, None)?;
                    QuorumPacket::RequestAccepted { request_id, zxid }
                } else {
                    QuorumPacket::RequestRejected {
                        request_id,
                        reason: "leader not established yet".to_string(),
                    }
                };
                self.send_to(peer_id, reply);
            }
            other => {
                warn!(peer_id, "unexpected {} from follower, dropping it", other.name());
                self.drop_follower(peer_id);
            }
        }
        Ok(())
    }

    /// Logs, broadcasts and self-acknowledges one mutation.
    fn propose(
        &mut self,
        payload: Vec<u8>,
        waiter: Option<SubmitReply>,
    ) -> Result<Zxid> {
        let zxid = self.next_zxid;
        self.next_zxid = zxid.next()?;

        let txn = Transaction::new(zxid, payload);
        self.db.log_proposal(&txn)?;
        self.handle.set_last_proposed(zxid);
        PROPOSALS_TOTAL.inc();
        trace!(%zxid, "proposing");

        self.broadcast(QuorumPacket::Proposal { txn: txn.clone() });
        self.tracker.propose(txn, waiter);
        self.tracker.ack(self.my_id, zxid);
        self.commit_ready()?;
        OUTSTANDING_PROPOSALS.set(self.tracker.len() as i64);
        Ok(zxid)
    }

    fn commit_ready(&mut self) -> Result<()> {
        for proposal in self.tracker.take_committable() {
            let zxid = proposal.txn.zxid;
            if let Err(e) = self.db.commit(&proposal.txn) {
                error!(%zxid, "commit failed: {}", e);
                return Err(e);
            }
            COMMITS_TOTAL.inc();
            COMMIT_LATENCY_MS.observe(proposal.age_ms());
            self.broadcast(QuorumPacket::Commit { zxid });
            proposal.complete(Ok(zxid));
        }
        OUTSTANDING_PROPOSALS.set(self.tracker.len() as i64);
        Ok(())
    }

    fn on_tick(&mut self) -> Result<()> {
        let now = Instant::now();
        let sync_timeout = self.config.quorum.sync_timeout();
        let init_timeout = self.config.quorum.init_timeout();
        let silent: Vec<PeerId> = self
            .followers
            .iter()
            .filter(|(_, link)| {
                let allowed = if link.synced { sync_timeout } else { init_timeout };
                now.duration_since(link.last_seen) > allowed
            })
            .map(|(id, _)| *id)
            .collect();
        for peer_id in silent {
            warn!(peer_id, "follower silent beyond its window, dropping it");
            self.drop_follower(peer_id);
        }

        self.broadcast(QuorumPacket::Ping {
            last_zxid: self.db.last_committed(),
        });
        self.check_quorum(init_timeout)
    }

    fn check_quorum(
        &self,
        grace: Duration,
    ) -> Result<()> {
        let synced = self.synced_peers();
        let required = quorum_size(self.config.cluster.servers.len());
        if synced >= required {
            return Ok(());
        }
        match self.established_at {
            Some(at) if at.elapsed() > grace => {
                warn!("only {} of {} required peers synchronized", synced, required);
                Err(BroadcastError::QuorumLost { synced, required }.into())
            }
            _ => Ok(()),
        }
    }

    /// Synced followers plus the leader itself.
    fn synced_peers(&self) -> usize {
        self.followers.values().filter(|l| l.synced).count() + 1
    }

    fn update_synced_gauge(&self) {
        SYNCED_FOLLOWERS.set(self.synced_peers() as i64 - 1);
    }

    fn broadcast(
        &mut self,
        packet: QuorumPacket,
    ) {
        let mut lagging = Vec::new();
        for (peer_id, link) in &self.followers {
            if let Err(e) = link.outbound.try_send(packet.clone()) {
                debug!(peer_id, "cannot queue {}: {}", packet.name(), e);
                lagging.push(*peer_id);
            }
        }
        for peer_id in lagging {
            warn!(peer_id, "follower queue full or closed, dropping it");
            self.drop_follower(peer_id);
        }
    }

    fn send_to(
        &mut self,
        peer_id: PeerId,
        packet: QuorumPacket,
    ) -> bool {
        let Some(link) = self.followers.get(&peer_id) else {
            return false;
        };
        match link.outbound.try_send(packet) {
            Ok(()) => true,
            Err(e) => {
                warn!(peer_id, "cannot queue to follower ({}), dropping it", e);
                self.drop_follower(peer_id);
                false
            }
        }
    }

    /// Dropping the outbound queue ends the connection task.
    fn drop_follower(
        &mut self,
        peer_id: PeerId,
    ) {
        if self.followers.remove(&peer_id).is_some() {
            self.update_synced_gauge();
        }
    }
}
