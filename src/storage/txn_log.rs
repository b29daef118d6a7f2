//! Append-only transaction log segments and snapshot files.
//!
//! Segments are named `log.<hex first zxid>` and grow in zero-filled chunks,
//! so a zero length prefix marks the end of the written part. Every record is
//! `u32 BE length | zxid u64 BE | timestamp_ms u64 BE | payload | 'B'`.
//! Snapshots are named `snapshot.<hex zxid>` and hold the state machine bytes
//! at that zxid.
//! Opening the log cuts the newest segment back to its last good record.

use std::fs;
use std::fs::File;
use std::fs::OpenOptions;
use std::io::Seek;
use std::io::SeekFrom;
use std::io::Write;
use std::path::Path;
use std::path::PathBuf;

use parking_lot::Mutex;
use tracing::debug;
use tracing::info;
use tracing::trace;
use tracing::warn;

use crate::constants::END_OF_RECORD;
use crate::constants::LAST_COMMITTED_FILE_NAME;
use crate::constants::LOG_FILE_PREFIX;
use crate::constants::SNAPSHOT_FILE_PREFIX;
use crate::utils::time::now_millis;
use crate::Result;
use crate::StorageError;
use crate::Transaction;
use crate::Zxid;

/// zxid + timestamp in front of the payload
const RECORD_HEADER_LEN: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum DataFileKind {
    Log,
    Snapshot,
}

#[derive(Debug, Clone)]
pub(crate) struct DataFile {
    pub(crate) kind: DataFileKind,
    pub(crate) zxid: Zxid,
    pub(crate) path: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogRecord {
    pub txn: Transaction,
    pub timestamp_ms: u64,
}

pub(crate) fn log_file_name(first: Zxid) -> String {
    format!("{}.{}", LOG_FILE_PREFIX, first.to_hex())
}

pub(crate) fn snapshot_file_name(zxid: Zxid) -> String {
    format!("{}.{}", SNAPSHOT_FILE_PREFIX, zxid.to_hex())
}

/// `None` for files that are not ours. Our prefix with a bad suffix is
/// reported and skipped.
pub(crate) fn parse_data_file_name(name: &str) -> Option<(DataFileKind, Zxid)> {
    let (prefix, suffix) = name.split_once('.')?;
    let kind = match prefix {
        LOG_FILE_PREFIX => DataFileKind::Log,
        SNAPSHOT_FILE_PREFIX => DataFileKind::Snapshot,
        _ => return None,
    };
    match Zxid::from_hex(suffix) {
        Some(zxid) => Some((kind, zxid)),
        None => {
            warn!("skipping unparseable data file name {}", name);
            None
        }
    }
}

pub(crate) fn list_data_files(dir: &Path) -> Result<Vec<DataFile>> {
    let entries = fs::read_dir(dir).map_err(|e| StorageError::PathError {
        path: dir.to_path_buf(),
        source: e,
    })?;

    let mut files = Vec::new();
    for entry in entries {
        let entry = entry?;
        let name = entry.file_name();
        let Some(name) = name.to_str() else {
            continue;
        };
        if let Some((kind, zxid)) = parse_data_file_name(name) {
            files.push(DataFile {
                kind,
                zxid,
                path: entry.path(),
            });
        }
    }
    files.sort_by_key(|f| f.zxid);
    Ok(files)
}

pub(crate) fn encode_record(
    txn: &Transaction,
    timestamp_ms: u64,
) -> Result<Vec<u8>> {
    let len = RECORD_HEADER_LEN + txn.payload.len();
    let len_prefix = u32::try_from(len)
        .map_err(|_| StorageError::LogStorage(format!("record of {} bytes does not fit a segment", len)))?;

    let mut buf = Vec::with_capacity(4 + len + 1);
    buf.extend_from_slice(&len_prefix.to_be_bytes());
    buf.extend_from_slice(&txn.zxid.as_u64().to_be_bytes());
    buf.extend_from_slice(&timestamp_ms.to_be_bytes());
    buf.extend_from_slice(&txn.payload);
    buf.push(END_OF_RECORD);
    Ok(buf)
}

fn be_u32(bytes: &[u8]) -> u32 {
    let mut raw = [0u8; 4];
    raw.copy_from_slice(&bytes[..4]);
    u32::from_be_bytes(raw)
}

fn be_u64(bytes: &[u8]) -> u64 {
    let mut raw = [0u8; 8];
    raw.copy_from_slice(&bytes[..8]);
    u64::from_be_bytes(raw)
}

/// Decodes records up to the first empty, short or malformed one.
pub(crate) fn decode_records(buf: &[u8]) -> Vec<LogRecord> {
    scan_records(buf).0
}

/// Good records plus the offset just past the last of them.
fn scan_records(buf: &[u8]) -> (Vec<LogRecord>, usize) {
    let mut records = Vec::new();
    let mut pos = 0usize;

    while pos + 4 <= buf.len() {
        let len = be_u32(&buf[pos..]) as usize;
        if len == 0 {
            break;
        }
        if len < RECORD_HEADER_LEN {
            warn!("record at offset {} is shorter than its header", pos);
            break;
        }
        let body_start = pos + 4;
        let eor_at = body_start + len;
        if eor_at >= buf.len() {
            debug!("truncated record at offset {}", pos);
            break;
        }
        if buf[eor_at] != END_OF_RECORD {
            warn!("missing end-of-record marker at offset {}", eor_at);
            break;
        }

        let body = &buf[body_start..eor_at];
        records.push(LogRecord {
            txn: Transaction::new(Zxid::from_u64(be_u64(body)), body[RECORD_HEADER_LEN..].to_vec()),
            timestamp_ms: be_u64(&body[8..]),
        });
        pos = eor_at + 1;
    }

    (records, pos)
}

pub(crate) fn read_segment(path: &Path) -> Result<Vec<LogRecord>> {
    let buf = fs::read(path).map_err(|e| StorageError::PathError {
        path: path.to_path_buf(),
        source: e,
    })?;
    Ok(decode_records(&buf))
}

/// Makes renames and removals under `dir` durable.
pub(crate) fn sync_dir(dir: &Path) -> Result<()> {
    File::open(dir)
        .and_then(|d| d.sync_all())
        .map_err(|e| StorageError::PathError {
            path: dir.to_path_buf(),
            source: e,
        })?;
    Ok(())
}

/// Cuts the newest segment back to its last good record.
///
/// A segment left without any record by a crash mid-roll is removed, so it
/// neither claims a starting zxid nor blocks a later segment of that name.
fn repair_newest_segment(dir: &Path) -> Result<()> {
    let newest = list_data_files(dir)?
        .into_iter()
        .filter(|f| f.kind == DataFileKind::Log)
        .max_by_key(|f| f.zxid);
    let Some(segment) = newest else {
        return Ok(());
    };

    let buf = fs::read(&segment.path).map_err(|e| StorageError::PathError {
        path: segment.path.clone(),
        source: e,
    })?;
    let (records, good_end) = scan_records(&buf);
    let path_error = |e| StorageError::PathError {
        path: segment.path.clone(),
        source: e,
    };

    if records.is_empty() {
        warn!("removing log segment {} without records", segment.path.display());
        fs::remove_file(&segment.path).map_err(path_error)?;
        sync_dir(dir)?;
    } else if buf[good_end..].iter().any(|b| *b != 0) {
        warn!(
            "truncating {} after its last good record at offset {}",
            segment.path.display(),
            good_end
        );
        let file = OpenOptions::new().write(true).open(&segment.path).map_err(path_error)?;
        file.set_len(good_end as u64)?;
        file.sync_all()?;
    }
    Ok(())
}

/// Highest zxid durably recorded under `dir`.
///
/// Missing or empty directory gives `Zxid::ZERO`. When the newest snapshot is
/// not older than the newest segment's starting zxid the snapshot wins,
/// otherwise that segment is replayed and the last good record counts (or the
/// segment's starting zxid when it holds none).
pub fn last_logged_zxid(dir: &Path) -> Zxid {
    let files = match list_data_files(dir) {
        Ok(files) => files,
        Err(e) => {
            debug!("no data files under {}: {}", dir.display(), e);
            return Zxid::ZERO;
        }
    };

    let max_snapshot = files
        .iter()
        .filter(|f| f.kind == DataFileKind::Snapshot)
        .map(|f| f.zxid)
        .max()
        .unwrap_or(Zxid::ZERO);

    let newest_log = files
        .iter()
        .filter(|f| f.kind == DataFileKind::Log)
        .max_by_key(|f| f.zxid);

    match newest_log {
        None => max_snapshot,
        Some(log) if max_snapshot >= log.zxid => max_snapshot,
        Some(log) => match read_segment(&log.path) {
            Ok(records) => records.last().map(|r| r.txn.zxid).unwrap_or(log.zxid),
            Err(e) => {
                warn!("failed to replay {}: {}", log.path.display(), e);
                log.zxid
            }
        },
    }
}

#[derive(Debug)]
struct ActiveSegment {
    file: File,
    path: PathBuf,
    first: Zxid,
    write_pos: u64,
    allocated: u64,
}

impl ActiveSegment {
    fn write_record(
        &mut self,
        record: &[u8],
        preallocate_bytes: u64,
    ) -> Result<()> {
        let end = self.write_pos + record.len() as u64;
        if end > self.allocated {
            self.allocated = end.div_ceil(preallocate_bytes) * preallocate_bytes;
            trace!("growing {} to {} bytes", self.path.display(), self.allocated);
            self.file.set_len(self.allocated)?;
        }
        self.file.seek(SeekFrom::Start(self.write_pos))?;
        self.file.write_all(record)?;
        self.file.sync_data()?;
        self.write_pos = end;
        Ok(())
    }
}

/// Durable transaction log plus snapshot files in one directory.
#[derive(Debug)]
pub struct TxnLog {
    dir: PathBuf,
    preallocate_bytes: u64,
    segment_max_bytes: u64,
    active: Mutex<Option<ActiveSegment>>,
}

impl TxnLog {
    pub fn open(
        dir: impl Into<PathBuf>,
        preallocate_bytes: u64,
        segment_max_bytes: u64,
    ) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir).map_err(|e| StorageError::PathError {
            path: dir.clone(),
            source: e,
        })?;
        repair_newest_segment(&dir)?;
        Ok(Self {
            dir,
            preallocate_bytes: preallocate_bytes.max(1),
            segment_max_bytes,
            active: Mutex::new(None),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Appends `txn` and returns once it is on disk.
    ///
    /// A new segment is started for the first append, on an epoch change and
    /// once the active segment has passed `segment_max_bytes`.
    pub fn append(
        &self,
        txn: &Transaction,
    ) -> Result<()> {
        let record = encode_record(txn, now_millis())?;
        let mut active = self.active.lock();

        let roll = match active.as_ref() {
            None => true,
            Some(segment) => {
                segment.first.epoch != txn.zxid.epoch || segment.write_pos >= self.segment_max_bytes
            }
        };
        if roll {
            *active = Some(self.create_segment(txn.zxid)?);
        }

        match active.as_mut() {
            Some(segment) => segment.write_record(&record, self.preallocate_bytes),
            None => Err(StorageError::LogStorage("no active segment".to_string()).into()),
        }
    }

    /// Closes the active segment; the next append starts a fresh one.
    pub fn roll(&self) {
        if let Some(segment) = self.active.lock().take() {
            debug!("closed segment {}", segment.path.display());
        }
    }

    fn create_segment(
        &self,
        first: Zxid,
    ) -> Result<ActiveSegment> {
        let path = self.dir.join(log_file_name(first));
        let path_error = |e| StorageError::PathError {
            path: path.clone(),
            source: e,
        };
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .map_err(path_error)?;

        // a leftover of this name is usable only while it holds no record
        let allocated = file.metadata()?.len();
        if allocated > 0 {
            let buf = fs::read(&path).map_err(path_error)?;
            if let Some(record) = decode_records(&buf).first() {
                return Err(StorageError::LogStorage(format!(
                    "{} already holds {}",
                    path.display(),
                    record.txn.zxid
                ))
                .into());
            }
            info!("reusing empty log segment {}", path.display());
        } else {
            info!("started log segment {}", path.display());
        }

        Ok(ActiveSegment {
            file,
            path,
            first,
            write_pos: 0,
            allocated,
        })
    }

    /// Every logged transaction with a zxid greater than `after`, in order.
    pub fn read_after(
        &self,
        after: Zxid,
    ) -> Result<Vec<Transaction>> {
        let segments: Vec<DataFile> = list_data_files(&self.dir)?
            .into_iter()
            .filter(|f| f.kind == DataFileKind::Log)
            .collect();

        let mut txns = Vec::new();
        for (i, segment) in segments.iter().enumerate() {
            // a later segment starting at or below `after` makes this one irrelevant
            if let Some(next) = segments.get(i + 1) {
                if next.zxid <= after {
                    continue;
                }
            }
            for record in read_segment(&segment.path)? {
                if record.txn.zxid > after {
                    txns.push(record.txn);
                }
            }
        }
        Ok(txns)
    }

    /// Highest zxid recorded as committed, `Zxid::ZERO` when none is.
    ///
    /// The mark never runs ahead of the state machine, so an unreadable one
    /// only means some committed records are treated as proposals again.
    pub fn commit_mark(&self) -> Zxid {
        let path = self.dir.join(LAST_COMMITTED_FILE_NAME);
        match fs::read_to_string(&path) {
            Ok(raw) => match Zxid::from_hex(raw.trim()) {
                Some(zxid) => zxid,
                None => {
                    warn!("ignoring unparseable commit mark {:?} in {}", raw, path.display());
                    Zxid::ZERO
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Zxid::ZERO,
            Err(e) => {
                warn!("failed to read {}: {}", path.display(), e);
                Zxid::ZERO
            }
        }
    }

    pub fn set_commit_mark(
        &self,
        zxid: Zxid,
    ) -> Result<()> {
        let path = self.dir.join(LAST_COMMITTED_FILE_NAME);
        let tmp = self.dir.join(format!("{}.tmp", LAST_COMMITTED_FILE_NAME));
        {
            let mut file = File::create(&tmp).map_err(|e| StorageError::PathError {
                path: tmp.clone(),
                source: e,
            })?;
            write!(file, "{:016x}", zxid.as_u64())?;
            file.sync_data()?;
        }
        fs::rename(&tmp, &path).map_err(|e| StorageError::PathError {
            path: path.clone(),
            source: e,
        })?;
        sync_dir(&self.dir)?;
        trace!("commit mark at {}", zxid);
        Ok(())
    }

    pub fn write_snapshot(
        &self,
        zxid: Zxid,
        data: &[u8],
    ) -> Result<PathBuf> {
        let path = self.dir.join(snapshot_file_name(zxid));
        let tmp = self.dir.join(format!("{}.tmp", snapshot_file_name(zxid)));
        {
            let mut file = File::create(&tmp).map_err(|e| StorageError::PathError {
                path: tmp.clone(),
                source: e,
            })?;
            file.write_all(data)?;
            file.sync_all()?;
        }
        fs::rename(&tmp, &path).map_err(|e| StorageError::PathError {
            path: path.clone(),
            source: e,
        })?;
        sync_dir(&self.dir)?;
        info!("wrote snapshot {} ({} bytes)", path.display(), data.len());
        Ok(path)
    }

    pub fn latest_snapshot(&self) -> Result<Option<(Zxid, Vec<u8>)>> {
        let newest = list_data_files(&self.dir)?
            .into_iter()
            .filter(|f| f.kind == DataFileKind::Snapshot)
            .max_by_key(|f| f.zxid);

        match newest {
            None => Ok(None),
            Some(file) => {
                let data = fs::read(&file.path).map_err(|e| StorageError::PathError {
                    path: file.path.clone(),
                    source: e,
                })?;
                Ok(Some((file.zxid, data)))
            }
        }
    }

    /// Replaces local history with a snapshot received from the leader.
    ///
    /// All segments go, as does any snapshot newer than `zxid`.
    pub fn reset_to_snapshot(
        &self,
        zxid: Zxid,
        data: &[u8],
    ) -> Result<()> {
        self.roll();
        for file in list_data_files(&self.dir)? {
            let superseded = match file.kind {
                DataFileKind::Log => true,
                DataFileKind::Snapshot => file.zxid > zxid,
            };
            if superseded {
                debug!("removing superseded {}", file.path.display());
                fs::remove_file(&file.path).map_err(|e| StorageError::PathError {
                    path: file.path.clone(),
                    source: e,
                })?;
            }
        }
        self.write_snapshot(zxid, data)?;
        Ok(())
    }
}
