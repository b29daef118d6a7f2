use std::fs;
use std::io::Write;
use std::path::Path;
use std::path::PathBuf;

use parking_lot::Mutex;
use tracing::debug;

use crate::constants::ACCEPTED_EPOCH_FILE_NAME;
use crate::Result;
use crate::StorageError;

/// Highest epoch this peer has accepted from a leader.
///
/// Persisted as a one-line decimal file before the peer acknowledges the
/// leader, and fed into the next epoch negotiation.
#[derive(Debug)]
pub struct EpochStore {
    path: PathBuf,
    cached: Mutex<u32>,
}

impl EpochStore {
    pub fn open(data_dir: &Path) -> Result<Self> {
        let path = data_dir.join(ACCEPTED_EPOCH_FILE_NAME);
        let epoch = match fs::read_to_string(&path) {
            Ok(raw) => raw.trim().parse::<u32>().map_err(|_| StorageError::DataCorruption {
                location: format!("{}: {:?} is not an epoch", path.display(), raw.trim()),
            })?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => 0,
            Err(e) => return Err(StorageError::PathError { path, source: e }.into()),
        };
        debug!("accepted epoch {} loaded from {}", epoch, path.display());
        Ok(Self {
            path,
            cached: Mutex::new(epoch),
        })
    }

    pub fn accepted_epoch(&self) -> u32 {
        *self.cached.lock()
    }

    /// Durably records `epoch`. Never moves backwards.
    pub fn accept(
        &self,
        epoch: u32,
    ) -> Result<()> {
        let mut cached = self.cached.lock();
        if epoch <= *cached {
            return Ok(());
        }

        let tmp = self.path.with_extension("tmp");
        {
            let mut file = fs::File::create(&tmp).map_err(|e| StorageError::PathError {
                path: tmp.clone(),
                source: e,
            })?;
            writeln!(file, "{}", epoch)?;
            file.sync_all()?;
        }
        fs::rename(&tmp, &self.path).map_err(|e| StorageError::PathError {
            path: self.path.clone(),
            source: e,
        })?;
        *cached = epoch;
        Ok(())
    }
}
