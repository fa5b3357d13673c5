//! Page references: the child slots of internal pages.
//!
//! A reference moves through a closed set of states and every transition
//! goes through [`PageRef::cas`]. The side fields (address, resident page,
//! page-deleted descriptor) are only changed by the thread that won the CAS
//! into `Locked`, or while the reference is resident and the change is the
//! publication of a new page.

use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::{Mutex, MutexGuard};

use super::page::Page;
use super::update::{Update, UpdateKind};
use crate::primitives::block::BlockAddr;
use crate::types::{Recno, Result, SombraError, TimeAggregate, TimePoint, Timestamp, TxnId};

/// State of a page reference.
#[repr(u8)]
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum RefState {
    /// Page lives only on disk; `addr` is set.
    Disk = 0,
    /// Page is deleted; `page_del` describes the delete unless it is global.
    Deleted = 1,
    /// A thread owns the side fields.
    Locked = 2,
    /// Page is in memory.
    Resident = 3,
    /// Reference was replaced by a split; holders must restart.
    Split = 4,
}

impl RefState {
    fn from_u8(raw: u8) -> Result<Self> {
        Ok(match raw {
            0 => RefState::Disk,
            1 => RefState::Deleted,
            2 => RefState::Locked,
            3 => RefState::Resident,
            4 => RefState::Split,
            _ => return Err(SombraError::Corruption("illegal page reference state")),
        })
    }
}

/// Key a reference is filed under in its parent.
#[derive(Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum RefKey {
    /// Smallest row key that may live in the subtree.
    Row(Bytes),
    /// First record number of the subtree.
    Recno(Recno),
}

impl RefKey {
    /// Row key bytes, empty for record-number keys.
    pub fn row(&self) -> &[u8] {
        match self {
            RefKey::Row(key) => key,
            RefKey::Recno(_) => &[],
        }
    }

    /// Record number, 0 for row keys.
    pub fn recno(&self) -> Recno {
        match self {
            RefKey::Row(_) => 0,
            RefKey::Recno(recno) => *recno,
        }
    }
}

/// Kind of the page an address points at.
#[repr(u8)]
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum AddrKind {
    /// Leaf page that references overflow blocks.
    Leaf = 1,
    /// Leaf page without overflow values; eligible for fast delete.
    LeafNoOverflow = 2,
    /// Internal page.
    Internal = 3,
}

impl TryFrom<u8> for AddrKind {
    type Error = SombraError;

    fn try_from(raw: u8) -> Result<Self> {
        match raw {
            1 => Ok(AddrKind::Leaf),
            2 => Ok(AddrKind::LeafNoOverflow),
            3 => Ok(AddrKind::Internal),
            _ => Err(SombraError::Corruption("unknown address kind")),
        }
    }
}

/// On-disk location of a child together with its time aggregate.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct ChildAddr {
    /// Block holding the child image.
    pub block: BlockAddr,
    /// What the block contains.
    pub kind: AddrKind,
    /// Aggregate of every time window in the child.
    pub agg: TimeAggregate,
}

impl ChildAddr {
    /// Returns true for leaf addresses.
    pub fn is_leaf(&self) -> bool {
        self.kind != AddrKind::Internal
    }
}

/// Outcome fields of a page-level delete.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct PageDelInfo {
    /// Deleting transaction.
    pub txn: TxnId,
    /// Commit (or prepare) timestamp.
    pub ts: Timestamp,
    /// Durable timestamp.
    pub durable_ts: Timestamp,
    /// Prepared and not yet resolved.
    pub prepare: bool,
    /// The deleting transaction committed.
    pub committed: bool,
}

/// Descriptor of a page-level delete.
///
/// Once the page is instantiated, the per-row tombstones created for it are
/// recorded here so the owning transaction's commit or rollback resolves
/// them together with the descriptor.
#[derive(Debug)]
pub struct PageDeleted {
    info: Mutex<PageDelInfo>,
    tombstones: Mutex<Vec<Arc<Update>>>,
}

impl PageDeleted {
    /// Uncommitted delete owned by `txn`.
    pub fn new(txn: TxnId) -> Arc<Self> {
        Arc::new(Self {
            info: Mutex::new(PageDelInfo {
                txn,
                ts: Timestamp::NONE,
                durable_ts: Timestamp::NONE,
                prepare: false,
                committed: false,
            }),
            tombstones: Mutex::new(Vec::new()),
        })
    }

    /// Committed delete read back from a page image.
    pub fn committed(txn: TxnId, ts: Timestamp, durable_ts: Timestamp, prepare: bool) -> Arc<Self> {
        Arc::new(Self {
            info: Mutex::new(PageDelInfo {
                txn,
                ts,
                durable_ts,
                prepare,
                committed: true,
            }),
            tombstones: Mutex::new(Vec::new()),
        })
    }

    /// Current outcome fields.
    pub fn info(&self) -> PageDelInfo {
        *self.info.lock()
    }

    /// Tombstones created by instantiation.
    pub fn tombstones(&self) -> Vec<Arc<Update>> {
        self.tombstones.lock().clone()
    }

    pub(crate) fn push_tombstone(&self, upd: Arc<Update>) {
        self.tombstones.lock().push(upd);
    }

    /// Creates a tombstone carrying the delete's current outcome and files
    /// it with the descriptor.
    ///
    /// The info lock is held across creation so a concurrent commit or
    /// rollback either sees the new tombstone or is already reflected in it.
    pub(crate) fn make_tombstone(&self) -> Arc<Update> {
        let info = self.info.lock();
        let upd = if info.committed {
            Update::committed(
                TimePoint {
                    txn: info.txn,
                    ts: info.ts,
                    durable_ts: info.durable_ts,
                },
                UpdateKind::Tombstone,
            )
        } else {
            let upd = Update::new(info.txn, UpdateKind::Tombstone);
            if info.prepare {
                upd.stamp_prepare(info.ts);
            }
            upd
        };
        self.tombstones.lock().push(Arc::clone(&upd));
        upd
    }

    pub(crate) fn stamp_prepare(&self, ts: Timestamp) {
        let mut info = self.info.lock();
        info.ts = ts;
        info.durable_ts = ts;
        info.prepare = true;
        for upd in self.tombstones.lock().iter() {
            upd.stamp_prepare(ts);
        }
    }

    pub(crate) fn stamp_commit(&self, ts: Timestamp, durable_ts: Timestamp) {
        let mut info = self.info.lock();
        info.ts = ts;
        info.durable_ts = durable_ts;
        info.prepare = false;
        info.committed = true;
        for upd in self.tombstones.lock().iter() {
            upd.stamp_commit(ts, durable_ts);
        }
    }

    pub(crate) fn abort(&self) {
        let mut info = self.info.lock();
        info.txn = TxnId::ABORTED;
        info.prepare = false;
        for upd in self.tombstones.lock().iter() {
            upd.abort();
        }
    }
}

/// Side fields of a reference.
#[derive(Default)]
pub struct RefBody {
    /// On-disk address, absent for pages never written.
    pub addr: Option<ChildAddr>,
    /// Resident page.
    pub page: Option<Arc<Page>>,
    /// Page-level delete descriptor; `None` in `Deleted` state means the
    /// delete is visible to everyone.
    pub page_del: Option<Arc<PageDeleted>>,
}

impl fmt::Debug for RefBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RefBody")
            .field("addr", &self.addr)
            .field("resident", &self.page.is_some())
            .field("page_del", &self.page_del.as_ref().map(|d| d.info()))
            .finish()
    }
}

/// Child slot of an internal page.
pub struct PageRef {
    state: AtomicU8,
    key: RefKey,
    body: Mutex<RefBody>,
}

impl fmt::Debug for PageRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PageRef")
            .field("state", &self.state())
            .field("key", &self.key)
            .finish()
    }
}

impl PageRef {
    fn with(state: RefState, key: RefKey, body: RefBody) -> Arc<Self> {
        Arc::new(Self {
            state: AtomicU8::new(state as u8),
            key,
            body: Mutex::new(body),
        })
    }

    /// Reference to a page on disk.
    pub fn disk(key: RefKey, addr: ChildAddr) -> Arc<Self> {
        Self::with(
            RefState::Disk,
            key,
            RefBody {
                addr: Some(addr),
                ..RefBody::default()
            },
        )
    }

    /// Reference to a resident page.
    pub fn resident(key: RefKey, addr: Option<ChildAddr>, page: Arc<Page>) -> Arc<Self> {
        Self::with(
            RefState::Resident,
            key,
            RefBody {
                addr,
                page: Some(page),
                page_del: None,
            },
        )
    }

    /// Reference to a deleted page.
    pub fn deleted(key: RefKey, addr: Option<ChildAddr>, page_del: Option<Arc<PageDeleted>>) -> Arc<Self> {
        Self::with(
            RefState::Deleted,
            key,
            RefBody {
                addr,
                page: None,
                page_del,
            },
        )
    }

    /// Current state.
    pub fn state(&self) -> RefState {
        // Only `set_state`/`cas` write the field and both take a `RefState`.
        RefState::from_u8(self.state.load(Ordering::Acquire)).unwrap_or(RefState::Locked)
    }

    /// Current state, reporting an illegal encoding as corruption.
    pub fn checked_state(&self) -> Result<RefState> {
        RefState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Atomically moves the reference from `from` to `to`.
    pub fn cas(&self, from: RefState, to: RefState) -> bool {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Publishes `to`; only the owner of a `Locked` reference may call this.
    pub fn set_state(&self, to: RefState) {
        self.state.store(to as u8, Ordering::Release);
    }

    /// Key the reference is filed under.
    pub fn key(&self) -> &RefKey {
        &self.key
    }

    /// Locks the side fields.
    pub fn body(&self) -> MutexGuard<'_, RefBody> {
        self.body.lock()
    }

    /// Resident page, if any.
    pub fn page(&self) -> Option<Arc<Page>> {
        self.body.lock().page.clone()
    }

    /// On-disk address, if any.
    pub fn addr(&self) -> Option<ChildAddr> {
        self.body.lock().addr
    }

    /// Page-delete descriptor, if any.
    pub fn page_del(&self) -> Option<Arc<PageDeleted>> {
        self.body.lock().page_del.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(offset: u64) -> ChildAddr {
        ChildAddr {
            block: BlockAddr {
                offset,
                size: 64,
                checksum: 0,
            },
            kind: AddrKind::LeafNoOverflow,
            agg: TimeAggregate::default(),
        }
    }

    #[test]
    fn cas_enforces_expected_state() {
        let r = PageRef::disk(RefKey::Row(Bytes::from_static(b"a")), addr(512));
        assert!(!r.cas(RefState::Resident, RefState::Locked));
        assert!(r.cas(RefState::Disk, RefState::Locked));
        assert_eq!(r.state(), RefState::Locked);
        assert!(!r.cas(RefState::Disk, RefState::Locked));
        r.set_state(RefState::Deleted);
        assert_eq!(r.checked_state().unwrap(), RefState::Deleted);
    }

    #[test]
    fn page_deleted_resolves_tombstones() {
        let del = PageDeleted::new(TxnId(9));
        let t1 = Update::new(TxnId(9), UpdateKind::Tombstone);
        del.push_tombstone(Arc::clone(&t1));
        del.stamp_commit(Timestamp(30), Timestamp(31));
        let info = del.info();
        assert!(info.committed);
        assert_eq!(info.ts, Timestamp(30));
        assert_eq!(t1.durable_ts(), Timestamp(31));

        let doomed = PageDeleted::new(TxnId(10));
        let t2 = Update::new(TxnId(10), UpdateKind::Tombstone);
        doomed.push_tombstone(Arc::clone(&t2));
        doomed.abort();
        assert!(t2.is_aborted());
        assert_eq!(doomed.info().txn, TxnId::ABORTED);
    }

    #[test]
    fn tombstones_follow_descriptor_outcome() {
        let del = PageDeleted::committed(TxnId(4), Timestamp(12), Timestamp(13), false);
        let t = del.make_tombstone();
        assert_eq!(t.start_ts(), Timestamp(12));
        assert_eq!(t.durable_ts(), Timestamp(13));
        assert!(t.is_tombstone());

        let pending = PageDeleted::new(TxnId(5));
        pending.stamp_prepare(Timestamp(20));
        let p = pending.make_tombstone();
        assert_eq!(p.prepare_state(), super::super::update::PrepareState::InProgress);
        assert_eq!(pending.tombstones().len(), 1);
    }

    #[test]
    fn ref_keys_order_by_value() {
        assert!(RefKey::Recno(3) < RefKey::Recno(10));
        assert_eq!(RefKey::Row(Bytes::from_static(b"k")).row(), b"k");
        assert_eq!(RefKey::Recno(7).recno(), 7);
    }
}
