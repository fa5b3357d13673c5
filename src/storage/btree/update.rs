//! Update records and the newest-first chains that link them.

use std::sync::atomic::{AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;

use bytes::{Bytes, BytesMut};

use crate::primitives::arena::{Arena, NIL};
use crate::types::{Result, SombraError, TimePoint, Timestamp, TxnId};

/// Prepare state of an update.
#[repr(u8)]
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum PrepareState {
    /// Never prepared.
    None = 0,
    /// Prepared and not yet resolved; readers must not guess the outcome.
    InProgress = 1,
    /// Prepared and later committed.
    Resolved = 2,
}

impl PrepareState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            1 => PrepareState::InProgress,
            2 => PrepareState::Resolved,
            _ => PrepareState::None,
        }
    }
}

/// Byte-range replacement applied to an older value.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ModifyEntry {
    /// Offset of the replaced range.
    pub offset: usize,
    /// Length of the replaced range.
    pub size: usize,
    /// Replacement bytes.
    pub data: Bytes,
}

/// Payload of an update record.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum UpdateKind {
    /// Complete value.
    Standard(Bytes),
    /// Delete of the key.
    Tombstone,
    /// Marks the on-page value as current from this update's start point on.
    Birthmark,
    /// Delta against the next older value.
    Modify(Vec<ModifyEntry>),
}

/// One version of a value.
///
/// Everything but the transaction id and timestamps is immutable once the
/// record is linked. The id is overwritten with [`TxnId::ABORTED`] on
/// rollback; timestamps are stamped at commit.
#[derive(Debug)]
pub struct Update {
    txn: AtomicU64,
    start_ts: AtomicU64,
    durable_ts: AtomicU64,
    prepare: AtomicU8,
    kind: UpdateKind,
}

impl Update {
    /// Creates an uncommitted update owned by `txn`.
    pub fn new(txn: TxnId, kind: UpdateKind) -> Arc<Self> {
        Arc::new(Self {
            txn: AtomicU64::new(txn.0),
            start_ts: AtomicU64::new(Timestamp::NONE.0),
            durable_ts: AtomicU64::new(Timestamp::NONE.0),
            prepare: AtomicU8::new(PrepareState::None as u8),
            kind,
        })
    }

    /// Creates an update that already carries its commit point.
    pub fn committed(start: TimePoint, kind: UpdateKind) -> Arc<Self> {
        let upd = Self::new(start.txn, kind);
        upd.start_ts.store(start.ts.0, Ordering::Release);
        upd.durable_ts.store(start.durable_ts.0, Ordering::Release);
        upd
    }

    /// Owning transaction.
    pub fn txn(&self) -> TxnId {
        TxnId(self.txn.load(Ordering::Acquire))
    }

    /// Commit (or prepare) timestamp.
    pub fn start_ts(&self) -> Timestamp {
        Timestamp(self.start_ts.load(Ordering::Acquire))
    }

    /// Durable timestamp.
    pub fn durable_ts(&self) -> Timestamp {
        Timestamp(self.durable_ts.load(Ordering::Acquire))
    }

    /// Start point as a [`TimePoint`].
    pub fn start(&self) -> TimePoint {
        TimePoint {
            txn: self.txn(),
            ts: self.start_ts(),
            durable_ts: self.durable_ts(),
        }
    }

    /// Current prepare state.
    pub fn prepare_state(&self) -> PrepareState {
        PrepareState::from_u8(self.prepare.load(Ordering::Acquire))
    }

    /// Returns true once the owning transaction rolled back.
    pub fn is_aborted(&self) -> bool {
        self.txn().is_aborted()
    }

    /// Payload of the update.
    pub fn kind(&self) -> &UpdateKind {
        &self.kind
    }

    /// Returns true for tombstones.
    pub fn is_tombstone(&self) -> bool {
        matches!(self.kind, UpdateKind::Tombstone)
    }

    /// Approximate heap footprint, used for cache accounting.
    pub fn memory_size(&self) -> usize {
        let payload = match &self.kind {
            UpdateKind::Standard(value) => value.len(),
            UpdateKind::Modify(entries) => entries.iter().map(|e| e.data.len() + 16).sum(),
            UpdateKind::Tombstone | UpdateKind::Birthmark => 0,
        };
        std::mem::size_of::<Self>() + payload
    }

    pub(crate) fn stamp_prepare(&self, ts: Timestamp) {
        self.start_ts.store(ts.0, Ordering::Release);
        self.durable_ts.store(ts.0, Ordering::Release);
        self.prepare
            .store(PrepareState::InProgress as u8, Ordering::Release);
    }

    pub(crate) fn stamp_commit(&self, ts: Timestamp, durable_ts: Timestamp) {
        self.start_ts.store(ts.0, Ordering::Release);
        self.durable_ts.store(durable_ts.0, Ordering::Release);
        if self.prepare_state() == PrepareState::InProgress {
            self.prepare
                .store(PrepareState::Resolved as u8, Ordering::Release);
        }
    }

    pub(crate) fn abort(&self) {
        self.txn.store(TxnId::ABORTED.0, Ordering::Release);
        self.prepare.store(PrepareState::None as u8, Ordering::Release);
    }
}

/// Applies modify deltas (newest last) to `base`.
pub fn apply_modify(base: &[u8], deltas: &[&[ModifyEntry]]) -> Bytes {
    let mut value = BytesMut::from(base);
    for entries in deltas {
        for entry in entries.iter() {
            if value.len() < entry.offset {
                value.resize(entry.offset, 0);
            }
            let end = (entry.offset + entry.size).min(value.len());
            let tail = value.split_off(end);
            value.truncate(entry.offset);
            value.extend_from_slice(&entry.data);
            value.extend_from_slice(&tail);
        }
    }
    value.freeze()
}

/// Link of an update chain stored in a page's link arena.
#[derive(Debug)]
pub struct UpdLink {
    /// The update record.
    pub upd: Arc<Update>,
    next: AtomicU32,
}

/// Arena holding the chain links of one page.
pub type LinkArena = Arena<UpdLink>;

/// Newest-first chain of updates for one key.
#[derive(Debug)]
pub struct UpdateChain {
    head: AtomicU32,
}

impl Default for UpdateChain {
    fn default() -> Self {
        Self {
            head: AtomicU32::new(NIL),
        }
    }
}

impl UpdateChain {
    /// Chain initialised with an already-pushed link.
    pub(crate) fn with_head(head: u32) -> Self {
        Self {
            head: AtomicU32::new(head),
        }
    }

    /// Returns true when no update was ever linked.
    pub fn is_empty(&self) -> bool {
        self.head.load(Ordering::Acquire) == NIL
    }

    /// Iterates updates newest first, aborted records included.
    pub fn iter<'a>(&self, links: &'a LinkArena) -> ChainIter<'a> {
        ChainIter {
            links,
            cur: self.head.load(Ordering::Acquire),
        }
    }

    /// Newest update whose transaction did not abort.
    pub fn newest<'a>(&self, links: &'a LinkArena) -> Option<&'a Arc<Update>> {
        self.iter(links).find(|upd| !upd.is_aborted())
    }

    /// Allocates a detached link for `upd`.
    pub(crate) fn alloc_link(links: &LinkArena, upd: Arc<Update>) -> Result<u32> {
        links.push(UpdLink {
            upd,
            next: AtomicU32::new(NIL),
        })
    }

    /// Links `upd` at the head of the chain.
    ///
    /// `check` sees the newest non-aborted update before each attempt and
    /// may refuse the write (typically with `WriteConflict`).
    pub fn prepend<F>(&self, links: &LinkArena, upd: Arc<Update>, mut check: F) -> Result<()>
    where
        F: FnMut(Option<&Arc<Update>>) -> Result<()>,
    {
        let idx = Self::alloc_link(links, upd)?;
        let link = links
            .get(idx)
            .ok_or(SombraError::Corruption("update link missing after push"))?;
        loop {
            let head = self.head.load(Ordering::Acquire);
            let newest = ChainIter { links, cur: head }.find(|u| !u.is_aborted());
            check(newest)?;
            link.next.store(head, Ordering::Relaxed);
            if self
                .head
                .compare_exchange(head, idx, Ordering::Release, Ordering::Acquire)
                .is_ok()
            {
                return Ok(());
            }
        }
    }

    /// Builds a fresh chain in `links` holding `updates` (newest first).
    pub(crate) fn rebuild(links: &LinkArena, updates: &[Arc<Update>]) -> Result<Self> {
        let mut head = NIL;
        for upd in updates.iter().rev() {
            let idx = Self::alloc_link(links, Arc::clone(upd))?;
            if let Some(link) = links.get(idx) {
                link.next.store(head, Ordering::Relaxed);
            }
            head = idx;
        }
        Ok(Self::with_head(head))
    }

    /// Collects the chain, newest first.
    pub fn collect(&self, links: &LinkArena) -> Vec<Arc<Update>> {
        self.iter(links).cloned().collect()
    }
}

/// Iterator over a chain.
pub struct ChainIter<'a> {
    links: &'a LinkArena,
    cur: u32,
}

impl<'a> Iterator for ChainIter<'a> {
    type Item = &'a Arc<Update>;

    fn next(&mut self) -> Option<Self::Item> {
        let link = self.links.get(self.cur)?;
        self.cur = link.next.load(Ordering::Acquire);
        Some(&link.upd)
    }
}
