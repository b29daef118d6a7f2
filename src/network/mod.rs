mod packet;
mod status;

pub use packet::*;
pub use status::*;


use std::net::SocketAddr;

use tokio::net::TcpStream;
use tokio::time::sleep;
use tokio::time::timeout;
use tracing::debug;
use tracing::warn;

use crate::BackoffPolicy;
use crate::NetworkError;
use crate::Result;

/// Connects to `addr`, retrying with exponential backoff.
///
/// Each attempt is bounded by `policy.timeout_ms`. `max_retries == 0`
/// retries until the caller drops the future.
pub(crate) async fn connect_with_backoff(
    addr: SocketAddr,
    policy: BackoffPolicy,
) -> Result<TcpStream> {
    let mut attempt = 0usize;
    loop {
        debug!("connect attempt {} to {}", attempt + 1, addr);
        let last_error = match timeout(policy.timeout(), TcpStream::connect(addr)).await {
            Ok(Ok(stream)) => {
                if let Err(e) = stream.set_nodelay(true) {
                    debug!("set_nodelay on {} failed: {}", addr, e);
                }
                return Ok(stream);
            }
            Ok(Err(source)) => NetworkError::ConnectFailed { addr, source },
            Err(_) => NetworkError::RetryTimeoutError(policy.timeout()),
        };

        attempt += 1;
        if !policy.unlimited() && attempt >= policy.max_retries {
            warn!("giving up on {} after {} attempts: {}", addr, attempt, last_error);
            return Err(last_error.into());
        }

        let delay = policy.delay_for(attempt - 1);
        debug!("{}; retrying in {:?}", last_error, delay);
        sleep(delay).await;
    }
}
