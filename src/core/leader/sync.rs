use autometrics::autometrics;

use crate::Database;
use crate::QuorumPacket;
use crate::Result;
use crate::Zxid;
use crate::API_SLO;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncMode {
    Diff,
    Snapshot,
}

impl SyncMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncMode::Diff => "diff",
            SyncMode::Snapshot => "snapshot",
        }
    }
}

/// Catch-up packet for a follower whose last zxid is `follower_last`.
///
/// A diff when that zxid is a known point of the committed window or one of
/// our `outstanding` proposals, a full snapshot otherwise (too old, unknown,
/// or ahead of everything we logged). A follower holding outstanding
/// proposals gets an empty diff: it already has every commit before them.
#[autometrics(objective = API_SLO)]
pub fn sync_packet(
    db: &Database,
    follower_last: Zxid,
    outstanding: &[Zxid],
) -> Result<(SyncMode, QuorumPacket)> {
    let committed = db.last_committed();
    let txns = if follower_last > committed && outstanding.binary_search(&follower_last).is_ok() {
        Some(Vec::new())
    } else {
        db.committed_since(follower_last)
    };
    match txns {
        Some(txns) => Ok((SyncMode::Diff, QuorumPacket::Diff { txns, committed })),
        None => {
            let (zxid, data) = db.snapshot()?;
            Ok((SyncMode::Snapshot, QuorumPacket::Snapshot { zxid, data }))
        }
    }
}
