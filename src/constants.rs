// -
// On-disk names

/// One-line decimal peer id under the data directory
pub(crate) const MYID_FILE_NAME: &str = "myid";

/// Highest epoch accepted from a NewLeader, under the data directory
pub(crate) const ACCEPTED_EPOCH_FILE_NAME: &str = "acceptedEpoch";

/// Fixed width hex zxid of the last applied commit, under the log directory
pub(crate) const LAST_COMMITTED_FILE_NAME: &str = "lastCommitted";

/// Log segments are named `log.<hex first zxid>`
pub(crate) const LOG_FILE_PREFIX: &str = "log";

/// Snapshots are named `snapshot.<hex zxid>`
pub(crate) const SNAPSHOT_FILE_PREFIX: &str = "snapshot";

/// End-of-record marker following every logged transaction
pub(crate) const END_OF_RECORD: u8 = b'B';

// -
// Status datagram

/// Request: xid only
pub const STATUS_REQUEST_LEN: usize = 4;

/// Response: xid, myid, leader id, leader zxid
pub const STATUS_RESPONSE_LEN: usize = 28;
