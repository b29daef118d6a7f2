use std::net::SocketAddr;
use std::time::Duration;

use tokio::net::TcpStream;
use tokio::time::sleep;
use tokio::time::timeout;

use crate::read_packet;
use crate::write_packet;
use crate::QuorumPacket;

const MAX_FRAME: usize = 64 * 1024 * 1024;
const WAIT: Duration = Duration::from_secs(5);

/// Scripted end of a quorum connection, used to play leader or follower.
pub struct PacketStream {
    stream: TcpStream,
}

impl PacketStream {
    pub fn new(stream: TcpStream) -> Self {
        Self { stream }
    }

    /// Connects, retrying while the listener is not up yet.
    pub async fn connect(addr: SocketAddr) -> Self {
        for _ in 0..100 {
            if let Ok(stream) = TcpStream::connect(addr).await {
                return Self::new(stream);
            }
            sleep(Duration::from_millis(20)).await;
        }
        panic!("no listener on {}", addr);
    }

    pub async fn send(
        &mut self,
        packet: QuorumPacket,
    ) {
        write_packet(&mut self.stream, &packet, MAX_FRAME).await.unwrap();
    }

    pub async fn recv(&mut self) -> QuorumPacket {
        timeout(WAIT, read_packet(&mut self.stream, MAX_FRAME))
            .await
            .expect("no packet in time")
            .unwrap()
    }

    pub async fn recv_skip_pings(&mut self) -> QuorumPacket {
        loop {
            match self.recv().await {
                QuorumPacket::Ping { .. } => continue,
                other => return other,
            }
        }
    }

    /// True once the other side closed the connection.
    pub async fn is_closed(&mut self) -> bool {
        let closed = async {
            while read_packet(&mut self.stream, MAX_FRAME).await.is_ok() {}
        };
        timeout(WAIT, closed).await.is_ok()
    }
}
