//! Per-follower connection tasks on the leader side.
//!
//! The accept loop hands every socket to [`serve_learner`], which waits for
//! the follower's FOLLOWERINFO, registers an outbound queue with the leader
//! loop and then pumps frames both ways until either side stops.

use std::time::Duration;

use tokio::io::BufReader;
use tokio::io::BufWriter;
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::TcpListener;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::sleep;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::debug;
use tracing::info;
use tracing::warn;

use crate::read_packet;
use crate::write_packet;
use crate::LeaderEvent;
use crate::PeerId;
use crate::QuorumPacket;

#[derive(Debug, Clone, Copy)]
pub(crate) struct LearnerSettings {
    pub max_frame_bytes: usize,
    pub handshake_timeout: Duration,
    pub buffer_size: usize,
}

pub(crate) async fn accept_loop(
    listener: TcpListener,
    events: mpsc::Sender<LeaderEvent>,
    settings: LearnerSettings,
    cancel: CancellationToken,
    tasks: TaskTracker,
) {
    let mut next_conn_id = 0u64;
    loop {
        let accepted = tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => accepted,
        };
        match accepted {
            Ok((stream, addr)) => {
                next_conn_id += 1;
                debug!(conn_id = next_conn_id, "accepted learner connection from {}", addr);
                if let Err(e) = stream.set_nodelay(true) {
                    debug!("set_nodelay on {} failed: {}", addr, e);
                }
                tasks.spawn(serve_learner(
                    next_conn_id,
                    stream,
                    events.clone(),
                    settings,
                    cancel.clone(),
                ));
            }
            Err(e) => {
                warn!("accept failed: {}", e);
                sleep(Duration::from_millis(10)).await;
            }
        }
    }
    debug!("learner accept loop stopped");
}

pub(crate) async fn serve_learner(
    conn_id: u64,
    stream: TcpStream,
    events: mpsc::Sender<LeaderEvent>,
    settings: LearnerSettings,
    cancel: CancellationToken,
) {
    let addr = stream.peer_addr().ok();
    let (reader, writer) = stream.into_split();
    let mut reader = BufReader::new(reader);

    let first = tokio::select! {
        _ = cancel.cancelled() => return,
        first = timeout(settings.handshake_timeout, read_packet(&mut reader, settings.max_frame_bytes)) => first,
    };
    let (peer_id, last_zxid, accepted_epoch) = match first {
        Ok(Ok(QuorumPacket::FollowerInfo {
            peer_id,
            last_zxid,
            accepted_epoch,
        })) => (peer_id, last_zxid, accepted_epoch),
        Ok(Ok(other)) => {
            warn!(conn_id, "expected FOLLOWERINFO from {:?}, got {}", addr, other.name());
            return;
        }
        Ok(Err(e)) => {
            warn!(conn_id, "handshake with {:?} failed: {}", addr, e);
            return;
        }
        Err(_) => {
            warn!(conn_id, "no FOLLOWERINFO from {:?} within {:?}", addr, settings.handshake_timeout);
            return;
        }
    };
    info!(conn_id, peer_id, %last_zxid, accepted_epoch, "follower connected from {:?}", addr);

    let (outbound_tx, outbound_rx) = mpsc::channel(settings.buffer_size);
    let connected = LeaderEvent::FollowerConnected {
        conn_id,
        peer_id,
        last_zxid,
        accepted_epoch,
        outbound: outbound_tx,
    };
    tokio::select! {
        _ = cancel.cancelled() => return,
        sent = events.send(connected) => if sent.is_err() { return },
    }

    let reason = tokio::select! {
        _ = cancel.cancelled() => "leader stopped".to_string(),
        reason = write_loop(writer, outbound_rx, settings.max_frame_bytes) => reason,
        reason = read_loop(reader, conn_id, peer_id, &events, settings.max_frame_bytes) => reason,
    };
    debug!(conn_id, peer_id, "learner connection closed: {}", reason);

    // the leader loop may already be gone or congested
    let _ = events.try_send(LeaderEvent::FollowerDisconnected {
        conn_id,
        peer_id,
        reason,
    });
}

async fn write_loop(
    writer: OwnedWriteHalf,
    mut outbound: mpsc::Receiver<QuorumPacket>,
    max_frame_bytes: usize,
) -> String {
    let mut writer = BufWriter::new(writer);
    while let Some(packet) = outbound.recv().await {
        if let Err(e) = write_packet(&mut writer, &packet, max_frame_bytes).await {
            return format!("write of {} failed: {}", packet.name(), e);
        }
    }
    "dropped by leader".to_string()
}

async fn read_loop(
    mut reader: BufReader<OwnedReadHalf>,
    conn_id: u64,
    peer_id: PeerId,
    events: &mpsc::Sender<LeaderEvent>,
    max_frame_bytes: usize,
) -> String {
    loop {
        match read_packet(&mut reader, max_frame_bytes).await {
            Ok(packet) => {
                let event = LeaderEvent::FollowerPacket {
                    conn_id,
                    peer_id,
                    packet,
                };
                if events.send(event).await.is_err() {
                    return "leader loop closed".to_string();
                }
            }
            Err(e) => return e.to_string(),
        }
    }
}
