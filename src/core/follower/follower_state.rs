//! FOLLOWING role: connect to the elected leader, catch up, then log and
//! apply its broadcast in order.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::io::BufReader;
use tokio::io::BufWriter;
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::sync::mpsc;
use tokio::sync::watch;
use tokio::time::sleep_until;
use tokio::time::timeout_at;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::debug;
use tracing::info;
use tracing::instrument;
use tracing::trace;
use tracing::warn;

use super::FollowerHandle;
use super::Replication;
use crate::connect_with_backoff;
use crate::read_packet;
use crate::write_packet;
use crate::Database;
use crate::EpochStore;
use crate::Error;
use crate::FollowerEvent;
use crate::NetworkError;
use crate::PeerId;
use crate::QuorumNodeConfig;
use crate::QuorumPacket;
use crate::QuorumServer;
use crate::Result;
use crate::SubmitReply;
use crate::SyncError;
use crate::Zxid;

pub struct Follower {
    my_id: PeerId,
    leader: QuorumServer,
    config: Arc<QuorumNodeConfig>,
    db: Arc<Database>,
    epoch_store: Arc<EpochStore>,
    handle: Arc<FollowerHandle>,
    events_rx: mpsc::Receiver<FollowerEvent>,
}

impl std::fmt::Debug for Follower {
    fn fmt(
        &self,
        f: &mut std::fmt::Formatter<'_>,
    ) -> std::fmt::Result {
        f.debug_struct("Follower")
            .field("my_id", &self.my_id)
            .field("leader", &self.leader.id)
            .finish()
    }
}

/// Client requests forwarded to the leader, waiting for their commit.
#[derive(Default)]
struct ForwardedRequests {
    next_id: u64,
    unanswered: HashMap<u64, SubmitReply>,
    awaiting_commit: HashMap<Zxid, SubmitReply>,
}

impl ForwardedRequests {
    fn register(
        &mut self,
        reply: SubmitReply,
    ) -> u64 {
        self.next_id += 1;
        self.unanswered.insert(self.next_id, reply);
        self.next_id
    }

    fn accepted(
        &mut self,
        request_id: u64,
        zxid: Zxid,
        last_committed: Zxid,
    ) {
        let Some(reply) = self.unanswered.remove(&request_id) else {
            return;
        };
        if zxid <= last_committed {
            let _ = reply.send(Ok(zxid));
        } else {
            self.awaiting_commit.insert(zxid, reply);
        }
    }

    fn rejected(
        &mut self,
        request_id: u64,
        reason: String,
    ) {
        if let Some(reply) = self.unanswered.remove(&request_id) {
            let _ = reply.send(Err(Error::NotServing(reason)));
        }
    }

    fn committed(
        &mut self,
        zxid: Zxid,
    ) {
        if let Some(reply) = self.awaiting_commit.remove(&zxid) {
            let _ = reply.send(Ok(zxid));
        }
    }
}

impl Follower {
    pub fn new(
        my_id: PeerId,
        leader_id: PeerId,
        config: Arc<QuorumNodeConfig>,
        db: Arc<Database>,
        epoch_store: Arc<EpochStore>,
    ) -> Result<Self> {
        let leader = config
            .cluster
            .server(leader_id)
            .cloned()
            .ok_or(SyncError::UnknownLeader(leader_id))?;
        let (events_tx, events_rx) = mpsc::channel(config.network.buffer_size);
        let handle = Arc::new(FollowerHandle::new(leader_id, db.last_committed(), events_tx));
        Ok(Self {
            my_id,
            leader,
            config,
            db,
            epoch_store,
            handle,
            events_rx,
        })
    }

    pub fn handle(&self) -> Arc<FollowerHandle> {
        self.handle.clone()
    }

    /// Follows until shutdown (`Ok`) or until the leader is lost.
    #[instrument(skip(self, shutdown), fields(my_id = self.my_id, leader = self.leader.id))]
    pub async fn follow(
        &mut self,
        shutdown: watch::Receiver<()>,
    ) -> Result<()> {
        let cancel = CancellationToken::new();
        let tasks = TaskTracker::new();

        let result = self.run(shutdown, &cancel, &tasks).await;

        cancel.cancel();
        tasks.close();
        tasks.wait().await;
        self.handle.set_synced(false);
        while let Ok(FollowerEvent::Forward { reply, .. }) = self.events_rx.try_recv() {
            let _ = reply.send(Err(Error::NotServing("leader connection closed".to_string())));
        }
        result
    }

    async fn run(
        &mut self,
        mut shutdown: watch::Receiver<()>,
        cancel: &CancellationToken,
        tasks: &TaskTracker,
    ) -> Result<()> {
        let max_frame = self.config.network.max_frame_bytes;
        let stream = tokio::select! {
            _ = shutdown.changed() => return Ok(()),
            stream = connect_with_backoff(self.leader.addr, self.config.retry.connect_leader) => stream?,
        };
        info!("connected to leader {} at {}", self.leader.id, self.leader.addr);

        let (reader, writer) = stream.into_split();
        let mut writer = BufWriter::new(writer);
        let (packets_tx, mut packets) = mpsc::channel(self.config.network.buffer_size);
        tasks.spawn(read_from_leader(reader, packets_tx, max_frame, cancel.clone()));

        let accepted_epoch = self.epoch_store.accepted_epoch();
        let info = QuorumPacket::FollowerInfo {
            peer_id: self.my_id,
            last_zxid: self.db.last_logged(),
            accepted_epoch,
        };
        write_packet(&mut writer, &info, max_frame).await?;

        let mut replication = Replication::new(self.db.last_committed());
        let init_timeout = self.config.quorum.init_timeout();
        let sync_deadline = Instant::now() + init_timeout;

        let epoch = loop {
            let packet = tokio::select! {
                _ = shutdown.changed() => return Ok(()),
                next = timeout_at(sync_deadline, packets.recv()) => match next {
                    Err(_) => {
                        return Err(SyncError::LeaderTimeout {
                            leader_id: self.leader.id,
                            timeout: init_timeout,
                        }
                        .into())
                    }
                    Ok(None) => return Err(NetworkError::ConnectionClosed.into()),
                    Ok(Some(packet)) => packet?,
                },
            };
            match packet {
                QuorumPacket::Diff { txns, committed } => {
                    debug!(%committed, "applying diff of {} transactions", txns.len());
                    let pending = self.db.apply_diff(&txns, committed)?;
                    if let Some(last) = pending.last() {
                        debug!(last = %last.zxid, "{} logged proposals wait for their commit", pending.len());
                    }
                    replication.resume(self.db.last_committed(), pending);
                }
                QuorumPacket::Snapshot { zxid, data } => {
                    info!(%zxid, "replacing local state with leader snapshot ({} bytes)", data.len());
                    self.db.restore_snapshot(zxid, &data)?;
                    replication.reset(zxid);
                }
                QuorumPacket::NewLeader { epoch, zxid } => {
                    let accepted = self.epoch_store.accepted_epoch();
                    if epoch < accepted {
                        return Err(SyncError::StaleEpoch { accepted, got: epoch }.into());
                    }
                    self.epoch_store.accept(epoch)?;
                    if self.db.last_committed() < zxid {
                        warn!(
                            "leader reports {} after sync, local commit point is {}",
                            zxid,
                            self.db.last_committed()
                        );
                    }
                    write_packet(&mut writer, &QuorumPacket::NewLeaderAck { epoch }, max_frame).await?;
                    break epoch;
                }
                QuorumPacket::Ping { .. } => {
                    let ping = QuorumPacket::Ping {
                        last_zxid: replication.last_logged(),
                    };
                    write_packet(&mut writer, &ping, max_frame).await?;
                }
                other => {
                    return Err(SyncError::UnexpectedPacket {
                        expected: "DIFF, SNAP or NEWLEADER",
                        got: other.name(),
                    }
                    .into())
                }
            }
        };

        self.handle.set_last_zxid(replication.last_logged());
        self.handle.set_synced(true);
        info!(epoch, last_committed = %self.db.last_committed(), "synchronized with leader {}", self.leader.id);

        let sync_timeout = self.config.quorum.sync_timeout();
        let mut last_heard = Instant::now();
        let mut forwarded = ForwardedRequests::default();

        loop {
            tokio::select! {
                biased;
                _ = shutdown.changed() => {
                    info!("follower {} shutting down", self.my_id);
                    return Ok(());
                }
                _ = sleep_until(last_heard + sync_timeout) => {
                    return Err(SyncError::LeaderTimeout {
                        leader_id: self.leader.id,
                        timeout: sync_timeout,
                    }
                    .into());
                }
                next = packets.recv() => {
                    let packet = match next {
                        Some(packet) => packet?,
                        None => return Err(NetworkError::ConnectionClosed.into()),
                    };
                    last_heard = Instant::now();
                    trace!("received {}", packet.name());
                    self.on_leader_packet(packet, &mut replication, &mut forwarded, &mut writer)
                        .await?;
                }
                Some(event) = self.events_rx.recv() => match event {
                    FollowerEvent::Forward { payload, reply } => {
                        let request_id = forwarded.register(reply);
                        let request = QuorumPacket::Request { request_id, payload };
                        write_packet(&mut writer, &request, max_frame).await?;
                    }
                },
            }
        }
    }

    async fn on_leader_packet(
        &self,
        packet: QuorumPacket,
        replication: &mut Replication,
        forwarded: &mut ForwardedRequests,
        writer: &mut BufWriter<OwnedWriteHalf>,
    ) -> Result<()> {
        let max_frame = self.config.network.max_frame_bytes;
        match packet {
            QuorumPacket::Proposal { txn } => {
                let ack = replication.on_proposal(&self.db, txn)?;
                self.handle.set_last_zxid(replication.last_logged());
                write_packet(writer, &ack, max_frame).await?;
            }
            QuorumPacket::Commit { zxid } => {
                if let Some(zxid) = replication.on_commit(&self.db, zxid)? {
                    forwarded.committed(zxid);
                }
            }
            QuorumPacket::Ping { .. } => {
                let ping = QuorumPacket::Ping {
                    last_zxid: replication.last_logged(),
                };
                write_packet(writer, &ping, max_frame).await?;
            }
            QuorumPacket::RequestAccepted { request_id, zxid } => {
                forwarded.accepted(request_id, zxid, self.db.last_committed());
            }
            QuorumPacket::RequestRejected { request_id, reason } => {
                forwarded.rejected(request_id, reason);
            }
            other => {
                return Err(SyncError::UnexpectedPacket {
                    expected: "PROPOSAL, COMMIT or PING",
                    got: other.name(),
                }
                .into())
            }
        }
        Ok(())
    }
}

/// Decodes leader frames into `packets` until the stream ends. The last item
/// sent is the error that ended it.
async fn read_from_leader(
    reader: OwnedReadHalf,
    packets: mpsc::Sender<Result<QuorumPacket>>,
    max_frame_bytes: usize,
    cancel: CancellationToken,
) {
    let mut reader = BufReader::new(reader);
    loop {
        let next = tokio::select! {
            _ = cancel.cancelled() => return,
            next = read_packet(&mut reader, max_frame_bytes) => next,
        };
        let failed = next.is_err();
        let sent = tokio::select! {
            _ = cancel.cancelled() => return,
            sent = packets.send(next) => sent,
        };
        if failed || sent.is_err() {
            return;
        }
    }
}
