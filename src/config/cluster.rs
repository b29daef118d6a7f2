use std::collections::HashSet;
use std::fs;
use std::net::SocketAddr;
use std::path::Path;
use std::path::PathBuf;

use serde::Deserialize;
use serde::Serialize;
use tracing::debug;

use crate::constants::MYID_FILE_NAME;
use crate::Error;
use crate::PeerId;
use crate::Result;

/// One member of the fixed peer set.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct QuorumServer {
    pub id: PeerId,
    /// host:port for quorum traffic. The leader listens for followers here
    /// (TCP) and the status responder answers on the same port (UDP).
    pub addr: SocketAddr,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ClusterConfig {
    /// Own peer id. When absent it is read from the `myid` file in `data_dir`.
    #[serde(default)]
    pub my_id: Option<PeerId>,

    #[serde(default = "default_servers")]
    pub servers: Vec<QuorumServer>,

    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Transaction log directory, defaults to `data_dir`
    #[serde(default)]
    pub data_log_dir: Option<PathBuf>,

    #[serde(default = "default_client_port")]
    pub client_port: u16,

    /// Where the binary writes its own trace output
    #[serde(default = "default_log_dir")]
    pub log_dir: PathBuf,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            my_id: None,
            servers: default_servers(),
            data_dir: default_data_dir(),
            data_log_dir: None,
            client_port: default_client_port(),
            log_dir: default_log_dir(),
        }
    }
}

impl ClusterConfig {
    /// Validates cluster configuration consistency
    pub fn validate(&self) -> Result<()> {
        if self.servers.is_empty() {
            return Err(Error::config("servers must contain at least one peer"));
        }

        let mut ids = HashSet::new();
        for server in &self.servers {
            if server.id == 0 {
                return Err(Error::config("peer id 0 is reserved"));
            }
            if !ids.insert(server.id) {
                return Err(Error::config(format!("Duplicate peer id {} in servers", server.id)));
            }
        }

        let my_id = self.my_id()?;
        if !ids.contains(&my_id) {
            return Err(Error::config(format!("My id {} not in the peer list", my_id)));
        }

        if self.client_port == 0 {
            return Err(Error::config("client_port is not set"));
        }

        validate_directory(&self.data_dir, "data_dir")?;
        if let Some(dir) = &self.data_log_dir {
            if !dir.is_dir() {
                return Err(Error::config(format!("data_log_dir {} is missing", dir.display())));
            }
        }

        Ok(())
    }

    /// Own id from config, falling back to the `myid` marker file.
    pub fn my_id(&self) -> Result<PeerId> {
        match self.my_id {
            Some(id) => Ok(id),
            None => read_myid_file(&self.data_dir),
        }
    }

    pub fn log_dir_for_txns(&self) -> PathBuf {
        self.data_log_dir.clone().unwrap_or_else(|| self.data_dir.clone())
    }

    pub fn server(
        &self,
        id: PeerId,
    ) -> Option<&QuorumServer> {
        self.servers.iter().find(|s| s.id == id)
    }
}

pub(crate) fn read_myid_file(data_dir: &Path) -> Result<PeerId> {
    let path = data_dir.join(MYID_FILE_NAME);
    let raw = fs::read_to_string(&path)
        .map_err(|e| Error::config(format!("{} file is missing: {}", path.display(), e)))?;
    let line = raw.lines().next().unwrap_or("").trim();
    debug!("read myid {:?} from {}", line, path.display());
    line.parse::<PeerId>()
        .map_err(|_| Error::config(format!("{} is not a number", line)))
}

/// Ensures directory path is valid and writable
pub(super) fn validate_directory(
    path: &Path,
    name: &str,
) -> Result<()> {
    if path.as_os_str().is_empty() {
        return Err(Error::config(format!("{} path cannot be empty", name)));
    }

    if !path.exists() {
        fs::create_dir_all(path).map_err(|e| {
            Error::config(format!(
                "Failed to create {} directory at {}: {}",
                name,
                path.display(),
                e
            ))
        })?;
    }

    Ok(())
}

fn default_servers() -> Vec<QuorumServer> {
    vec![QuorumServer {
        id: 1,
        addr: default_quorum_addr(),
    }]
}
fn default_quorum_addr() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 2888))
}
fn default_data_dir() -> PathBuf {
    PathBuf::from("/tmp/quorum/data")
}
fn default_client_port() -> u16 {
    2181
}
fn default_log_dir() -> PathBuf {
    PathBuf::from("/tmp/quorum/logs")
}
