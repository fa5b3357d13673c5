//! Transaction subsystem consumed by the page engine.
//!
//! Provides id allocation, snapshots, commit/prepare/rollback stamping and
//! the two visibility predicates the engine needs: per-snapshot visibility
//! and visibility to every current and future reader.

mod table;

use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::storage::btree::delete;
use crate::storage::btree::reference::{PageDeleted, PageRef};
use crate::storage::btree::update::Update;
use crate::types::{Result, SombraError, Timestamp, TxnId};

pub use table::{TxnStatus, TxnTable, TxnTableSnapshot};

/// Visibility predicate over (transaction id, timestamp) pairs.
pub trait Visibility {
    /// Returns true when data written by `txn` at `ts` is visible.
    fn visible(&self, txn: TxnId, ts: Timestamp) -> bool;
    /// Returns true when data written by `txn` is visible, ignoring timestamps.
    fn visible_id(&self, txn: TxnId) -> bool;
    /// Read timestamp of the reader (`NONE` when it reads the latest data).
    fn read_ts(&self) -> Timestamp {
        Timestamp::NONE
    }
}

/// Point-in-time view of which transactions are committed.
#[derive(Clone, Debug)]
pub struct Snapshot {
    owner: TxnId,
    snap_min: TxnId,
    snap_max: TxnId,
    concurrent: Arc<[TxnId]>,
    read_ts: Timestamp,
}

impl Snapshot {
    /// Snapshot that sees every id below `snap_max` except `concurrent`.
    pub fn new(
        owner: TxnId,
        snap_min: TxnId,
        snap_max: TxnId,
        concurrent: Vec<TxnId>,
        read_ts: Timestamp,
    ) -> Self {
        let mut concurrent = concurrent;
        concurrent.sort_unstable();
        Self {
            owner,
            snap_min,
            snap_max,
            concurrent: concurrent.into(),
            read_ts,
        }
    }

    /// Transaction that owns the snapshot, `NONE` for internal snapshots.
    pub fn owner(&self) -> TxnId {
        self.owner
    }

    /// Oldest id the snapshot may consider running.
    pub fn snap_min(&self) -> TxnId {
        self.snap_min
    }

    /// First id the snapshot considers to be in the future.
    pub fn snap_max(&self) -> TxnId {
        self.snap_max
    }
}

impl Visibility for Snapshot {
    fn visible(&self, txn: TxnId, ts: Timestamp) -> bool {
        if txn == self.owner && txn != TxnId::NONE {
            return true;
        }
        if !self.visible_id(txn) {
            return false;
        }
        self.read_ts.is_none() || ts.is_none() || ts <= self.read_ts
    }

    fn visible_id(&self, txn: TxnId) -> bool {
        if txn == self.owner && txn != TxnId::NONE {
            return true;
        }
        if txn.is_aborted() || txn >= self.snap_max {
            return false;
        }
        if txn < self.snap_min {
            return true;
        }
        self.concurrent.binary_search(&txn).is_err()
    }

    fn read_ts(&self) -> Timestamp {
        self.read_ts
    }
}

/// Visibility to every current and future reader, captured at one instant.
#[derive(Clone, Copy, Debug, Default)]
pub struct GlobalVisibility {
    /// Ids below this are committed or aborted for everyone.
    pub oldest_id: TxnId,
    /// Timestamps at or below this are read the same way by everyone:
    /// the oldest timestamp, held back by the oldest running reader.
    /// `NONE` means no timestamped update is settled yet.
    pub pinned_ts: Timestamp,
}

impl Visibility for GlobalVisibility {
    fn visible(&self, txn: TxnId, ts: Timestamp) -> bool {
        self.visible_id(txn) && (ts.is_none() || (!self.pinned_ts.is_none() && ts <= self.pinned_ts))
    }

    fn visible_id(&self, txn: TxnId) -> bool {
        txn < self.oldest_id
    }
}

/// Outcome-bearing modification recorded by a transaction.
#[derive(Clone, Debug)]
pub enum TxnOp {
    /// An update linked into some chain.
    Update(Arc<Update>),
    /// A fast-deleted page reference and its delete descriptor.
    RefDelete(Arc<PageRef>, Arc<PageDeleted>),
}

/// Hands out transactions and answers global visibility questions.
#[derive(Debug, Default)]
pub struct TxnManager {
    table: Mutex<TxnTable>,
}

impl TxnManager {
    /// Creates a manager wrapped for sharing with trees.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Begins a transaction reading the latest committed data.
    pub fn begin(self: &Arc<Self>) -> Result<Txn> {
        self.begin_at(Timestamp::NONE)
    }

    /// Begins a transaction reading as of `read_ts`.
    pub fn begin_at(self: &Arc<Self>, read_ts: Timestamp) -> Result<Txn> {
        let (id, snap_min, snap_max, concurrent) = self.table.lock().begin(Instant::now(), read_ts)?;
        trace!(target: "sombra_engine::txn", txn = %id, snap_min = %snap_min, read_ts = %read_ts, "begin");
        Ok(Txn {
            manager: Arc::clone(self),
            id,
            snapshot: Snapshot::new(id, snap_min, snap_max, concurrent, read_ts),
            ops: Vec::new(),
            prepared: None,
            done: false,
        })
    }

    /// Snapshot seeing every transaction committed so far, owned by nobody.
    pub fn checkpoint_snapshot(&self) -> Snapshot {
        let table = self.table.lock();
        let snap_max = table.next_id();
        let (snap_min, snap_max, concurrent) = table.snapshot_bounds(snap_max);
        Snapshot::new(TxnId::NONE, snap_min, snap_max, concurrent, Timestamp::NONE)
    }

    /// Captures the current global visibility horizon.
    pub fn global(&self) -> GlobalVisibility {
        let table = self.table.lock();
        GlobalVisibility {
            oldest_id: table.oldest_id(),
            pinned_ts: table.pinned_timestamp(),
        }
    }

    /// Returns true when `txn` at `ts` is visible to every reader.
    pub fn visible_all(&self, txn: TxnId, ts: Timestamp) -> bool {
        self.global().visible(txn, ts)
    }

    /// Oldest id any snapshot may consider running.
    pub fn oldest_id(&self) -> TxnId {
        self.table.lock().oldest_id()
    }

    /// Moves the oldest readable timestamp forward; refused past the read
    /// timestamp of a running transaction.
    pub fn set_oldest_timestamp(&self, ts: Timestamp) -> Result<()> {
        self.table.lock().set_oldest_timestamp(ts)
    }

    /// Returns true while `txn` is running or prepared.
    pub fn is_running(&self, txn: TxnId) -> bool {
        self.table.lock().status(txn).is_some()
    }

    /// Status of `txn`, `None` once resolved.
    pub fn status(&self, txn: TxnId) -> Option<TxnStatus> {
        self.table.lock().status(txn)
    }

    /// Diagnostic summary.
    pub fn stats(&self) -> TxnTableSnapshot {
        self.table.lock().snapshot(Instant::now())
    }

    fn commit_ops(&self, id: TxnId, ops: &[TxnOp], ts: Timestamp, durable: Timestamp) -> Result<()> {
        for op in ops {
            match op {
                TxnOp::Update(upd) => upd.stamp_commit(ts, durable),
                TxnOp::RefDelete(_, del) => delete::commit(del, ts, durable),
            }
        }
        self.table.lock().finish(id)
    }

    fn rollback_ops(&self, id: TxnId, ops: &[TxnOp]) -> Result<()> {
        // Newest first so a fast delete is undone before updates older than it.
        let mut result = Ok(());
        for op in ops.iter().rev() {
            match op {
                TxnOp::Update(upd) => upd.abort(),
                TxnOp::RefDelete(r, del) => {
                    if let Err(err) = delete::rollback(r, del, id) {
                        result = Err(err);
                    }
                }
            }
        }
        let finished = self.table.lock().finish(id);
        result.and(finished)
    }
}

/// A running transaction.
///
/// Dropping a transaction that was neither committed nor rolled back rolls
/// it back.
pub struct Txn {
    manager: Arc<TxnManager>,
    id: TxnId,
    snapshot: Snapshot,
    ops: Vec<TxnOp>,
    prepared: Option<Timestamp>,
    done: bool,
}

impl std::fmt::Debug for Txn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Txn")
            .field("id", &self.id)
            .field("ops", &self.ops.len())
            .field("prepared", &self.prepared)
            .finish()
    }
}

impl Txn {
    /// Transaction id.
    pub fn id(&self) -> TxnId {
        self.id
    }

    /// Snapshot the transaction reads with.
    pub fn snapshot(&self) -> &Snapshot {
        &self.snapshot
    }

    /// Number of recorded modifications.
    pub fn op_count(&self) -> usize {
        self.ops.len()
    }

    /// Returns true once prepared.
    pub fn is_prepared(&self) -> bool {
        self.prepared.is_some()
    }

    pub(crate) fn record(&mut self, op: TxnOp) -> Result<()> {
        if self.prepared.is_some() {
            return Err(SombraError::Invalid("write after prepare"));
        }
        self.ops.push(op);
        Ok(())
    }

    /// Prepares the transaction at `ts`; its updates become unresolvable
    /// for readers until commit or rollback.
    pub fn prepare(&mut self, ts: Timestamp) -> Result<()> {
        if ts.is_none() {
            return Err(SombraError::Invalid("prepare requires a timestamp"));
        }
        self.manager.table.lock().mark_prepared(self.id, ts)?;
        for op in &self.ops {
            match op {
                TxnOp::Update(upd) => upd.stamp_prepare(ts),
                TxnOp::RefDelete(_, del) => delete::prepare(del, ts),
            }
        }
        self.prepared = Some(ts);
        debug!(target: "sombra_engine::txn", txn = %self.id, ts = %ts, "prepared");
        Ok(())
    }

    /// Commits at `ts` (durable at the same timestamp).
    pub fn commit(self, ts: Timestamp) -> Result<()> {
        self.commit_durable(ts, ts)
    }

    /// Commits at `ts` with a separate durable timestamp.
    pub fn commit_durable(mut self, ts: Timestamp, durable: Timestamp) -> Result<()> {
        if let Some(prepare_ts) = self.prepared {
            if ts < prepare_ts {
                return Err(SombraError::Invalid("commit timestamp before prepare timestamp"));
            }
        }
        let oldest = self.manager.table.lock().oldest_timestamp();
        if !ts.is_none() && !oldest.is_none() && ts < oldest {
            return Err(SombraError::Invalid("commit timestamp older than oldest timestamp"));
        }
        self.done = true;
        let ops = std::mem::take(&mut self.ops);
        self.manager.commit_ops(self.id, &ops, ts, durable)?;
        trace!(target: "sombra_engine::txn", txn = %self.id, ts = %ts, ops = ops.len(), "commit");
        Ok(())
    }

    /// Rolls back every recorded modification.
    pub fn rollback(mut self) -> Result<()> {
        self.done = true;
        let ops = std::mem::take(&mut self.ops);
        self.manager.rollback_ops(self.id, &ops)?;
        debug!(target: "sombra_engine::txn", txn = %self.id, ops = ops.len(), "rollback");
        Ok(())
    }
}

impl Drop for Txn {
    fn drop(&mut self) {
        if !self.done {
            let ops = std::mem::take(&mut self.ops);
            if let Err(err) = self.manager.rollback_ops(self.id, &ops) {
                tracing::error!(target: "sombra_engine::txn", txn = %self.id, error = %err, "implicit rollback failed");
            }
        }
    }
}
