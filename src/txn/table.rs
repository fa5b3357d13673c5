use std::collections::BTreeMap;
use std::time::Instant;

use crate::types::{Result, SombraError, Timestamp, TxnId};

/// Lifecycle state of a transaction tracked by [`TxnTable`].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum TxnStatus {
    /// Transaction is running; its updates are invisible to everyone else.
    Running,
    /// Transaction is prepared at the given timestamp and awaits resolution.
    Prepared(Timestamp),
}

#[derive(Clone, Debug)]
struct TxnEntry {
    status: TxnStatus,
    snap_min: TxnId,
    read_ts: Timestamp,
    began: Instant,
}

/// Diagnostic summary of the table.
#[derive(Clone, Debug, Default)]
pub struct TxnTableSnapshot {
    /// Transactions currently running (prepared included).
    pub running: usize,
    /// Transactions currently prepared.
    pub prepared: usize,
    /// Oldest id any snapshot may still consider running.
    pub oldest_id: TxnId,
    /// Oldest timestamp any reader may still read at.
    pub oldest_timestamp: Timestamp,
    /// Timestamp at or below which every reader sees the same data.
    pub pinned_timestamp: Timestamp,
    /// Age of the longest running transaction in milliseconds.
    pub max_age_ms: u64,
}

/// Registry of running transactions.
///
/// Ids come from a monotonically increasing counter. An entry is added when
/// a transaction begins and removed once its commit or rollback has been
/// stamped into every update it produced, so any snapshot taken after the
/// removal sees the final state.
#[derive(Debug)]
pub struct TxnTable {
    next_id: u64,
    running: BTreeMap<TxnId, TxnEntry>,
    oldest_timestamp: Timestamp,
}

impl Default for TxnTable {
    fn default() -> Self {
        Self::new()
    }
}

impl TxnTable {
    /// Creates an empty table; the first id handed out is 1.
    pub fn new() -> Self {
        Self {
            next_id: 1,
            running: BTreeMap::new(),
            oldest_timestamp: Timestamp::NONE,
        }
    }

    /// Allocates a new id and registers it as running, reading at `read_ts`
    /// (`NONE` reads the latest data).
    ///
    /// Returns the id together with the snapshot bounds computed atomically
    /// with the registration: `(id, snap_min, snap_max, concurrent)`.
    pub fn begin(&mut self, now: Instant, read_ts: Timestamp) -> Result<(TxnId, TxnId, TxnId, Vec<TxnId>)> {
        if !read_ts.is_none() && read_ts < self.oldest_timestamp {
            return Err(SombraError::Invalid("read timestamp older than oldest timestamp"));
        }
        if self.next_id >= TxnId::MAX.0 {
            return Err(SombraError::Invalid("transaction ids exhausted"));
        }
        let id = TxnId(self.next_id);
        self.next_id += 1;
        let (snap_min, snap_max, concurrent) = self.snapshot_bounds(id);
        self.running.insert(
            id,
            TxnEntry {
                status: TxnStatus::Running,
                snap_min,
                read_ts,
                began: now,
            },
        );
        Ok((id, snap_min, snap_max, concurrent))
    }

    /// Snapshot bounds for a reader that is not itself registered.
    pub fn snapshot_bounds(&self, snap_max: TxnId) -> (TxnId, TxnId, Vec<TxnId>) {
        let concurrent: Vec<TxnId> = self.running.keys().copied().collect();
        let snap_min = concurrent.first().copied().unwrap_or(snap_max);
        (snap_min, snap_max, concurrent)
    }

    /// Id the next transaction will receive.
    pub fn next_id(&self) -> TxnId {
        TxnId(self.next_id)
    }

    /// Marks `id` prepared at `ts`.
    pub fn mark_prepared(&mut self, id: TxnId, ts: Timestamp) -> Result<()> {
        let entry = self
            .running
            .get_mut(&id)
            .ok_or(SombraError::Invalid("unknown transaction id"))?;
        if entry.status != TxnStatus::Running {
            return Err(SombraError::Invalid("transaction already prepared"));
        }
        entry.status = TxnStatus::Prepared(ts);
        Ok(())
    }

    /// Removes `id` after its outcome has been stamped.
    pub fn finish(&mut self, id: TxnId) -> Result<()> {
        self.running
            .remove(&id)
            .map(|_| ())
            .ok_or(SombraError::Invalid("unknown transaction id"))
    }

    /// Returns the status of `id`, or `None` once it finished.
    pub fn status(&self, id: TxnId) -> Option<TxnStatus> {
        self.running.get(&id).map(|entry| entry.status)
    }

    /// Smallest id that some running transaction's snapshot may not see.
    pub fn oldest_id(&self) -> TxnId {
        self.running
            .values()
            .map(|entry| entry.snap_min)
            .min()
            .unwrap_or(TxnId(self.next_id))
    }

    /// Sets the oldest timestamp readers may use.
    ///
    /// It cannot move backwards, nor past the read timestamp of a running
    /// transaction.
    pub fn set_oldest_timestamp(&mut self, ts: Timestamp) -> Result<()> {
        if ts < self.oldest_timestamp {
            return Err(SombraError::Invalid("oldest timestamp cannot move backwards"));
        }
        if self.oldest_read_ts().is_some_and(|read_ts| ts > read_ts) {
            return Err(SombraError::Invalid("oldest timestamp past a running reader"));
        }
        self.oldest_timestamp = ts;
        Ok(())
    }

    fn oldest_read_ts(&self) -> Option<Timestamp> {
        self.running
            .values()
            .map(|entry| entry.read_ts)
            .filter(|ts| !ts.is_none())
            .min()
    }

    /// Newest timestamp every current and future reader reads through.
    ///
    /// `NONE` until an oldest timestamp is set: before that a reader may
    /// begin at any timestamp, so no timestamped update is settled.
    pub fn pinned_timestamp(&self) -> Timestamp {
        if self.oldest_timestamp.is_none() {
            return Timestamp::NONE;
        }
        match self.oldest_read_ts() {
            Some(read_ts) => read_ts.min(self.oldest_timestamp),
            None => self.oldest_timestamp,
        }
    }

    /// Current oldest timestamp (`NONE` when never set).
    pub fn oldest_timestamp(&self) -> Timestamp {
        self.oldest_timestamp
    }

    /// Captures a diagnostic summary.
    pub fn snapshot(&self, now: Instant) -> TxnTableSnapshot {
        let prepared = self
            .running
            .values()
            .filter(|entry| matches!(entry.status, TxnStatus::Prepared(_)))
            .count();
        let max_age_ms = self
            .running
            .values()
            .map(|entry| now.saturating_duration_since(entry.began).as_millis())
            .max()
            .unwrap_or(0)
            .min(u64::MAX as u128) as u64;
        TxnTableSnapshot {
            running: self.running.len(),
            prepared,
            oldest_id: self.oldest_id(),
            oldest_timestamp: self.oldest_timestamp,
            pinned_timestamp: self.pinned_timestamp(),
            max_age_ms,
        }
    }
}
