use serde::Deserialize;
use serde::Serialize;

use crate::Error;
use crate::Result;

/// Network communication parameters
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct NetworkConfig {
    /// Largest accepted quorum frame (snapshots travel in one frame)
    #[serde(default = "default_max_frame_bytes")]
    pub max_frame_bytes: usize,

    /// How long `submit` waits for a commit before giving up
    #[serde(default = "default_client_request_timeout")]
    pub client_request_timeout_ms: u64,

    /// Capacity of per-connection outbound queues
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            max_frame_bytes: default_max_frame_bytes(),
            client_request_timeout_ms: default_client_request_timeout(),
            buffer_size: default_buffer_size(),
        }
    }
}

impl NetworkConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_frame_bytes < 1024 {
            return Err(Error::config(format!(
                "max_frame_bytes {} is too small, at least 1024 required",
                self.max_frame_bytes
            )));
        }
        if self.client_request_timeout_ms == 0 {
            return Err(Error::config("client_request_timeout_ms cannot be 0"));
        }
        if self.buffer_size == 0 {
            return Err(Error::config("buffer_size cannot be 0"));
        }
        Ok(())
    }
}

fn default_max_frame_bytes() -> usize {
    64 * 1024 * 1024
}
fn default_client_request_timeout() -> u64 {
    10_000
}
fn default_buffer_size() -> usize {
    1024
}
