//! Tree handle.
//!
//! A tree always has a resident internal root with at least one child.
//! Row trees file children under their smallest key (the first child of a
//! page under the page's own key), column trees under their first record.

mod page_in;
mod read;
mod truncate;
mod write;

use std::fmt;
use std::ops::{Bound, RangeInclusive};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use rustc_hash::FxHashMap;
use tracing::{error, info};

use super::col_cursor::ColCursor;
use super::cursor::Cursor;
use super::reconcile::bulk::BulkLoader;
use super::reconcile::SavedUpdate;
use super::reference::{PageRef, RefKey};
use super::stats::{BTreeStats, BTreeStatsSnapshot};
use super::update::{ModifyEntry, UpdateKind};
use super::page::Page;
use crate::primitives::block::{BlockAddr, BlockManager, MemBlockManager};
use crate::primitives::concurrency::Generations;
use crate::storage::cache::{CacheAccounting, NoopCache};
use crate::storage::options::TreeOptions;
use crate::txn::{Snapshot, Txn, TxnManager};
use crate::types::page::PageKind;
use crate::types::{Recno, Result, SombraError};

pub(crate) use page_in::{PageIn, PageInFlags, SearchKey};
pub(crate) use read::{col_value, row_value, updates_of};
pub use truncate::TruncateStats;
pub(crate) use write::WriteMode;

/// Storage layout of a tree.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum TreeKind {
    /// Variable-length keys.
    Row,
    /// Record-number keys with run-length encoded values.
    Column,
}

impl TreeKind {
    pub(crate) fn leaf_kind(self) -> PageKind {
        match self {
            TreeKind::Row => PageKind::RowLeaf,
            TreeKind::Column => PageKind::ColLeaf,
        }
    }

    pub(crate) fn internal_kind(self) -> PageKind {
        match self {
            TreeKind::Row => PageKind::RowInternal,
            TreeKind::Column => PageKind::ColInternal,
        }
    }

    pub(crate) fn root_key(self) -> RefKey {
        match self {
            TreeKind::Row => RefKey::Row(Bytes::new()),
            TreeKind::Column => RefKey::Recno(1),
        }
    }
}

/// Services a tree runs on.
#[derive(Clone)]
pub struct TreeEnv {
    /// Where page images live.
    pub block: Arc<dyn BlockManager>,
    /// Transaction manager shared by every tree of the store.
    pub txns: Arc<TxnManager>,
    /// Cache accounting hooks.
    pub cache: Arc<dyn CacheAccounting>,
}

impl TreeEnv {
    /// Environment over `block` and `txns` without cache accounting.
    pub fn new(block: Arc<dyn BlockManager>, txns: Arc<TxnManager>) -> Self {
        Self {
            block,
            txns,
            cache: Arc::new(NoopCache),
        }
    }

    /// In-memory block manager and a fresh transaction manager.
    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemBlockManager::default()), TxnManager::new())
    }

    /// Replaces the cache accounting hooks.
    pub fn with_cache(mut self, cache: Arc<dyn CacheAccounting>) -> Self {
        self.cache = cache;
        self
    }
}

impl fmt::Debug for TreeEnv {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TreeEnv")
            .field("live_blocks", &self.block.live_blocks())
            .finish()
    }
}

pub(crate) struct TreeInner {
    pub kind: TreeKind,
    pub options: TreeOptions,
    pub block: Arc<dyn BlockManager>,
    pub txns: Arc<TxnManager>,
    pub cache: Arc<dyn CacheAccounting>,
    pub root: Arc<PageRef>,
    /// Eviction holds it shared, checkpoint exclusive.
    pub evict_lock: RwLock<()>,
    pub splits: Generations,
    /// Blocks no in-memory structure references; freed by the next checkpoint.
    pub pending_free: Mutex<Vec<BlockAddr>>,
    /// Internal levels written above a split root by the last checkpoint.
    pub root_extra: Mutex<Vec<BlockAddr>>,
    /// Update chains parked by eviction, keyed by image block offset.
    pub lookaside: Mutex<FxHashMap<u64, Vec<SavedUpdate>>>,
    pub last_recno: AtomicU64,
    pub stats: BTreeStats,
    pub root_addr: Mutex<Option<BlockAddr>>,
    panicked: AtomicBool,
}

impl TreeInner {
    fn new(kind: TreeKind, env: TreeEnv, options: TreeOptions, root: Arc<PageRef>) -> Self {
        Self {
            kind,
            options,
            block: env.block,
            txns: env.txns,
            cache: env.cache,
            root,
            evict_lock: RwLock::new(()),
            splits: Generations::default(),
            pending_free: Mutex::new(Vec::new()),
            root_extra: Mutex::new(Vec::new()),
            lookaside: Mutex::new(FxHashMap::default()),
            last_recno: AtomicU64::new(0),
            stats: BTreeStats::default(),
            root_addr: Mutex::new(None),
            panicked: AtomicBool::new(false),
        }
    }

    /// Refuses work once a fatal error was seen.
    pub(crate) fn check(&self) -> Result<()> {
        if self.panicked.load(Ordering::Acquire) {
            Err(SombraError::Panic)
        } else {
            Ok(())
        }
    }

    /// Passes `res` through, putting the tree into its failed state on a
    /// fatal error.
    pub(crate) fn guard<T>(&self, op: &'static str, res: Result<T>) -> Result<T> {
        if let Err(err) = &res {
            if err.is_fatal() && !self.panicked.swap(true, Ordering::AcqRel) {
                error!(target: "sombra_engine::tree", op, error = %err, "fatal error; tree refuses further work");
            }
        }
        res
    }

    /// New empty leaf for the key range of `key`.
    pub(crate) fn empty_leaf(&self, key: &RefKey) -> Arc<Page> {
        match self.kind {
            TreeKind::Row => Page::empty_row_leaf(self.options.skip_depth),
            TreeKind::Column => Page::empty_col_leaf(key.recno(), self.options.skip_depth),
        }
    }

    pub(crate) fn is_root(&self, page_ref: &Arc<PageRef>) -> bool {
        Arc::ptr_eq(&self.root, page_ref)
    }
}

/// Handle to a row-store or column-store tree.
///
/// Cloning is cheap; every clone operates on the same tree.
#[derive(Clone)]
pub struct Tree {
    pub(crate) inner: Arc<TreeInner>,
}

impl fmt::Debug for Tree {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tree")
            .field("kind", &self.inner.kind)
            .field("root_addr", &*self.inner.root_addr.lock())
            .finish()
    }
}

impl Tree {
    fn create(kind: TreeKind, env: TreeEnv, options: TreeOptions) -> Result<Self> {
        options.validate()?;
        let key = kind.root_key();
        let leaf = match kind {
            TreeKind::Row => Page::empty_row_leaf(options.skip_depth),
            TreeKind::Column => Page::empty_col_leaf(key.recno(), options.skip_depth),
        };
        leaf.mark_dirty();
        let leaf_ref = PageRef::resident(key.clone(), None, Arc::clone(&leaf));
        let root_page = Page::internal(kind.internal_kind(), key.recno(), vec![leaf_ref], options.skip_depth);
        root_page.mark_dirty();
        env.cache.page_created(leaf.footprint());
        env.cache.page_created(root_page.footprint());
        let root = PageRef::resident(key, None, root_page);
        info!(target: "sombra_engine::checkpoint", kind = ?kind, "tree created");
        Ok(Self {
            inner: Arc::new(TreeInner::new(kind, env, options, root)),
        })
    }

    /// Creates an empty row-store tree.
    pub fn create_row(env: TreeEnv, options: TreeOptions) -> Result<Self> {
        Self::create(TreeKind::Row, env, options)
    }

    /// Creates an empty column-store tree; records start at 1.
    pub fn create_column(env: TreeEnv, options: TreeOptions) -> Result<Self> {
        Self::create(TreeKind::Column, env, options)
    }

    /// Opens the tree whose root image a checkpoint wrote at `root_addr`.
    pub fn open(env: TreeEnv, kind: TreeKind, options: TreeOptions, root_addr: BlockAddr) -> Result<Self> {
        options.validate()?;
        let image = env.block.read(&root_addr)?;
        let decoded = super::cell::decode_image(&image)?;
        if decoded.header.kind != kind.internal_kind() {
            return Err(SombraError::Corruption("root image has the wrong page kind"));
        }
        let page = Page::from_image(decoded, env.block.as_ref(), options.skip_depth)?;
        env.cache.page_created(page.footprint());
        let key = match kind {
            TreeKind::Row => RefKey::Row(Bytes::new()),
            TreeKind::Column => RefKey::Recno(page.recno()),
        };
        let root = PageRef::resident(
            key,
            Some(super::reconcile::internal_root_addr(root_addr)),
            page,
        );
        let tree = Self {
            inner: Arc::new(TreeInner::new(kind, env, options, root)),
        };
        *tree.inner.root_addr.lock() = Some(root_addr);
        if kind == TreeKind::Column {
            let last = tree.inner.find_last_recno()?;
            tree.inner.last_recno.store(last, Ordering::Release);
        }
        info!(target: "sombra_engine::checkpoint", kind = ?kind, offset = root_addr.offset, "tree opened");
        Ok(tree)
    }

    /// Storage layout.
    pub fn kind(&self) -> TreeKind {
        self.inner.kind
    }

    /// Options the tree runs with.
    pub fn options(&self) -> &TreeOptions {
        &self.inner.options
    }

    /// Transaction manager of the tree.
    pub fn txns(&self) -> &Arc<TxnManager> {
        &self.inner.txns
    }

    /// Counter snapshot.
    pub fn stats(&self) -> BTreeStatsSnapshot {
        self.inner.stats.snapshot()
    }

    /// Logs the counters.
    pub fn emit_stats(&self) {
        self.inner.stats.emit_tracing();
    }

    /// Returns true once a fatal error put the tree into its failed state.
    pub fn is_panicked(&self) -> bool {
        self.inner.check().is_err()
    }

    /// Root image written by the most recent checkpoint.
    pub fn root_addr(&self) -> Option<BlockAddr> {
        *self.inner.root_addr.lock()
    }

    /// Largest record number handed out or written so far.
    pub fn last_recno(&self) -> Recno {
        self.inner.last_recno.load(Ordering::Acquire)
    }

    fn require(&self, kind: TreeKind) -> Result<()> {
        if self.inner.kind == kind {
            Ok(())
        } else {
            Err(SombraError::Invalid("operation does not match the tree kind"))
        }
    }

    /// Inserts or replaces `key`.
    pub fn put(&self, txn: &mut Txn, key: &[u8], value: &[u8]) -> Result<()> {
        self.require(TreeKind::Row)?;
        self.inner.options.check_key(key)?;
        let kind = UpdateKind::Standard(Bytes::copy_from_slice(value));
        self.inner.row_write(txn, key, kind, WriteMode::Put)
    }

    /// Removes `key`; `NotFound` when the transaction sees no value.
    pub fn remove(&self, txn: &mut Txn, key: &[u8]) -> Result<()> {
        self.require(TreeKind::Row)?;
        self.inner
            .row_write(txn, key, UpdateKind::Tombstone, WriteMode::Existing)
    }

    /// Applies byte-range replacements to the value of `key`.
    pub fn modify(&self, txn: &mut Txn, key: &[u8], entries: Vec<ModifyEntry>) -> Result<()> {
        self.require(TreeKind::Row)?;
        self.inner
            .row_write(txn, key, UpdateKind::Modify(entries), WriteMode::Existing)
    }

    /// Value of `key` as `snap` sees it.
    pub fn get(&self, snap: &Snapshot, key: &[u8]) -> Result<Option<Bytes>> {
        self.require(TreeKind::Row)?;
        self.inner.row_get(snap, key)
    }

    /// Appends `value` under a new record number.
    pub fn append(&self, txn: &mut Txn, value: &[u8]) -> Result<Recno> {
        self.require(TreeKind::Column)?;
        self.inner.col_append(txn, Bytes::copy_from_slice(value))
    }

    /// Writes record `recno`.
    pub fn put_recno(&self, txn: &mut Txn, recno: Recno, value: &[u8]) -> Result<()> {
        self.require(TreeKind::Column)?;
        if recno == 0 {
            return Err(SombraError::Invalid("record numbers start at 1"));
        }
        let kind = UpdateKind::Standard(Bytes::copy_from_slice(value));
        self.inner.col_write(txn, recno, kind, WriteMode::Put)?;
        self.inner.last_recno.fetch_max(recno, Ordering::AcqRel);
        Ok(())
    }

    /// Removes record `recno`; `NotFound` when the transaction sees no value.
    pub fn remove_recno(&self, txn: &mut Txn, recno: Recno) -> Result<()> {
        self.require(TreeKind::Column)?;
        self.inner
            .col_write(txn, recno, UpdateKind::Tombstone, WriteMode::Existing)
    }

    /// Value of record `recno` as `snap` sees it.
    pub fn get_recno(&self, snap: &Snapshot, recno: Recno) -> Result<Option<Bytes>> {
        self.require(TreeKind::Column)?;
        self.inner.col_get(snap, recno)
    }

    /// Cursor over a row tree reading with `snap`.
    pub fn cursor(&self, snap: &Snapshot) -> Result<Cursor> {
        self.require(TreeKind::Row)?;
        self.inner.check()?;
        Ok(Cursor::new(Arc::clone(&self.inner), snap.clone()))
    }

    /// Cursor over a column tree reading with `snap`.
    pub fn col_cursor(&self, snap: &Snapshot) -> Result<ColCursor> {
        self.require(TreeKind::Column)?;
        self.inner.check()?;
        Ok(ColCursor::new(Arc::clone(&self.inner), snap.clone()))
    }

    /// Deletes every row in the key range, whole leaf pages at a time where
    /// possible.
    pub fn truncate(&self, txn: &mut Txn, lower: Bound<&[u8]>, upper: Bound<&[u8]>) -> Result<TruncateStats> {
        self.require(TreeKind::Row)?;
        let res = self.truncate_rows(txn, lower, upper);
        self.inner.guard("truncate", res)
    }

    /// Deletes every record in `range`.
    pub fn truncate_recno(&self, txn: &mut Txn, range: RangeInclusive<Recno>) -> Result<TruncateStats> {
        self.require(TreeKind::Column)?;
        let res = self.truncate_records(txn, range);
        self.inner.guard("truncate", res)
    }

    /// Writes every dirty page and a new root; returns the root address.
    pub fn checkpoint(&self) -> Result<BlockAddr> {
        let res = super::checkpoint::checkpoint(&self.inner, false);
        self.inner.guard("checkpoint", res)
    }

    /// Final checkpoint: every update must be committed and visible.
    pub fn close(&self) -> Result<BlockAddr> {
        let res = super::checkpoint::checkpoint(&self.inner, true);
        self.inner.guard("close", res)
    }

    /// Tries to evict every resident page but the root; returns how many
    /// pages left memory.
    pub fn evict_pass(&self) -> Result<usize> {
        let res = super::evict::evict_pass(&self.inner);
        self.inner.guard("evict", res)
    }

    /// Loader that fills an empty tree directly with page images.
    pub fn bulk_loader(&self) -> Result<BulkLoader> {
        BulkLoader::new(self.clone())
    }
}
