//! In-memory pages.
//!
//! A page is built once from a decoded image (or empty) and its on-disk
//! content never changes afterwards. Everything written later lives in the
//! [`Modify`] side structure, created by the first writer: per-slot update
//! chains and 2N+1 insert segments for row leaves, per-run update lists and
//! an append list for column leaves.

use std::fmt;
use std::ops::Deref;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};

use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use rustc_hash::FxHashMap;
use smallvec::SmallVec;
use xxhash_rust::xxh64::xxh64;

use super::cell::{AddrKey, DecodedImage, ImageBody, ImageValue};
use super::insert::InsertList;
use super::reconcile::RecResult;
use super::reference::{PageDeleted, PageRef, RefKey};
use super::update::{LinkArena, UpdateChain};
use crate::primitives::block::{BlockAddr, BlockManager};
use crate::primitives::concurrency::HazardCount;
use crate::types::page::PageKind;
use crate::types::{Recno, Result, SombraError, TimeWindow};

/// Value of an on-page cell, with overflow values already read.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum DiskValue {
    /// Value stored in the image.
    Inline(Bytes),
    /// Value stored in an overflow block.
    Overflow {
        /// Overflow block.
        addr: BlockAddr,
        /// Value read from the block.
        value: Bytes,
    },
}

impl DiskValue {
    /// Value bytes.
    pub fn bytes(&self) -> &Bytes {
        match self {
            DiskValue::Inline(value) | DiskValue::Overflow { value, .. } => value,
        }
    }

    fn load(value: ImageValue, block: &dyn BlockManager) -> Result<Self> {
        match value {
            ImageValue::Inline(bytes) => Ok(DiskValue::Inline(bytes)),
            ImageValue::Overflow(addr) => {
                let image = block.read(&addr)?;
                Ok(DiskValue::Overflow {
                    addr,
                    value: super::cell::decode_overflow(&image)?,
                })
            }
        }
    }
}

/// Row leaf entry from the page image.
#[derive(Clone, Debug)]
pub struct RowSlot {
    /// Key.
    pub key: Bytes,
    /// Value.
    pub value: DiskValue,
    /// Validity window.
    pub tw: TimeWindow,
}

/// Column leaf run from the page image.
#[derive(Clone, Debug)]
pub struct ColRun {
    /// First record of the run.
    pub recno: Recno,
    /// Number of records.
    pub rle: u64,
    /// Value, `None` for deleted records.
    pub value: Option<DiskValue>,
    /// Validity window.
    pub tw: TimeWindow,
}

impl ColRun {
    /// One past the last record of the run.
    pub fn end(&self) -> Recno {
        self.recno + self.rle
    }
}

/// Child references of an internal page.
///
/// The array is replaced as a whole when a split publishes new children, so
/// readers holding an older array keep a consistent (if stale) view.
#[derive(Debug)]
pub struct PageIndex {
    refs: RwLock<Arc<Vec<Arc<PageRef>>>>,
}

impl PageIndex {
    /// Index over `refs`.
    pub fn new(refs: Vec<Arc<PageRef>>) -> Self {
        Self {
            refs: RwLock::new(Arc::new(refs)),
        }
    }

    /// Current reference array.
    pub fn load(&self) -> Arc<Vec<Arc<PageRef>>> {
        Arc::clone(&self.refs.read())
    }

    /// Write access to the array for split publication.
    pub fn write(&self) -> parking_lot::RwLockWriteGuard<'_, Arc<Vec<Arc<PageRef>>>> {
        self.refs.write()
    }

    /// Position of `target` in the current array.
    pub fn position(&self, target: &Arc<PageRef>) -> Option<usize> {
        self.refs.read().iter().position(|r| Arc::ptr_eq(r, target))
    }
}

/// On-page content.
#[derive(Debug)]
pub enum PageContent {
    /// Row leaf slots in key order.
    Row(Vec<RowSlot>),
    /// Column leaf runs in record order.
    Col(Vec<ColRun>),
    /// Child references.
    Internal(PageIndex),
}

/// Overflow blocks a page may reuse in its next reconciliation.
#[derive(Clone, Debug, Default)]
pub struct OverflowTrack {
    reusable: FxHashMap<u64, SmallVec<[(Bytes, BlockAddr); 1]>>,
}

impl OverflowTrack {
    /// Remembers that `value` is stored at `addr`.
    pub fn remember(&mut self, value: &Bytes, addr: BlockAddr) {
        let slot = self.reusable.entry(xxh64(value, 0)).or_default();
        if !slot.iter().any(|(_, a)| *a == addr) {
            slot.push((value.clone(), addr));
        }
    }

    /// Finds a block already holding `value`.
    pub fn lookup(&self, value: &[u8]) -> Option<BlockAddr> {
        self.reusable
            .get(&xxh64(value, 0))?
            .iter()
            .find(|(v, _)| v.as_ref() == value)
            .map(|(_, addr)| *addr)
    }

    /// Every remembered block.
    pub fn blocks(&self) -> Vec<BlockAddr> {
        self.reusable
            .values()
            .flat_map(|slot| slot.iter().map(|(_, addr)| *addr))
            .collect()
    }

    /// Replaces the remembered set.
    pub fn reset(&mut self, entries: impl IntoIterator<Item = (Bytes, BlockAddr)>) {
        self.reusable.clear();
        for (value, addr) in entries {
            self.remember(&value, addr);
        }
    }
}

/// Modification side structure of a page.
pub struct Modify {
    /// Arena for every update-chain link of the page.
    pub links: LinkArena,
    row_updates: Box<[UpdateChain]>,
    row_inserts: Box<[OnceLock<InsertList<[u8]>>]>,
    col_updates: Box<[OnceLock<InsertList<u64>>]>,
    col_append: OnceLock<InsertList<u64>>,
    write_gen: AtomicU64,
    disk_gen: AtomicU64,
    skip_depth: usize,
    /// Result of the most recent reconciliation.
    pub rec: Mutex<RecResult>,
    /// Overflow blocks available for reuse.
    pub ovfl: Mutex<OverflowTrack>,
}

impl fmt::Debug for Modify {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Modify")
            .field("links", &self.links.len())
            .field("write_gen", &self.write_gen.load(Ordering::Relaxed))
            .field("disk_gen", &self.disk_gen.load(Ordering::Relaxed))
            .finish()
    }
}

impl Modify {
    fn new(content: &PageContent, skip_depth: usize, ovfl: OverflowTrack) -> Self {
        let (slots, runs) = match content {
            PageContent::Row(slots) => (slots.len(), 0),
            PageContent::Col(runs) => (0, runs.len()),
            PageContent::Internal(_) => (0, 0),
        };
        let row_segments = if matches!(content, PageContent::Row(_)) {
            slots + 1
        } else {
            0
        };
        Self {
            links: LinkArena::new(),
            row_updates: (0..slots).map(|_| UpdateChain::default()).collect(),
            row_inserts: (0..row_segments).map(|_| OnceLock::new()).collect(),
            col_updates: (0..runs).map(|_| OnceLock::new()).collect(),
            col_append: OnceLock::new(),
            write_gen: AtomicU64::new(0),
            disk_gen: AtomicU64::new(0),
            skip_depth,
            rec: Mutex::new(RecResult::None),
            ovfl: Mutex::new(ovfl),
        }
    }

    /// Update chain of on-page row slot `slot`.
    pub fn row_update(&self, slot: usize) -> Option<&UpdateChain> {
        self.row_updates.get(slot)
    }

    /// Insert list of segment `seg` (between slot `seg - 1` and slot `seg`).
    pub fn row_insert(&self, seg: usize) -> Option<&InsertList<[u8]>> {
        self.row_inserts.get(seg)?.get()
    }

    /// Insert list of segment `seg`, created on demand.
    pub fn row_insert_or_init(&self, seg: usize) -> Result<&InsertList<[u8]>> {
        let cell = self
            .row_inserts
            .get(seg)
            .ok_or(SombraError::Corruption("insert segment out of range"))?;
        Ok(cell.get_or_init(|| InsertList::new(self.skip_depth)))
    }

    /// Number of insert segments.
    pub fn row_segments(&self) -> usize {
        self.row_inserts.len()
    }

    /// Update list of column run `run`.
    pub fn col_update(&self, run: usize) -> Option<&InsertList<u64>> {
        self.col_updates.get(run)?.get()
    }

    /// Update list of column run `run`, created on demand.
    pub fn col_update_or_init(&self, run: usize) -> Result<&InsertList<u64>> {
        let cell = self
            .col_updates
            .get(run)
            .ok_or(SombraError::Corruption("column run out of range"))?;
        Ok(cell.get_or_init(|| InsertList::new(self.skip_depth)))
    }

    /// Append list of a column leaf.
    pub fn col_append(&self) -> Option<&InsertList<u64>> {
        self.col_append.get()
    }

    /// Append list, created on demand.
    pub fn col_append_or_init(&self) -> &InsertList<u64> {
        self.col_append
            .get_or_init(|| InsertList::new(self.skip_depth))
    }

    /// Records a modification.
    pub fn mark_dirty(&self) {
        self.write_gen.fetch_add(1, Ordering::AcqRel);
    }

    /// Returns true when modifications exist that no image reflects.
    pub fn is_dirty(&self) -> bool {
        self.write_gen.load(Ordering::Acquire) > self.disk_gen.load(Ordering::Acquire)
    }

    /// Modification generation, sampled before reconciliation starts.
    pub fn write_gen(&self) -> u64 {
        self.write_gen.load(Ordering::Acquire)
    }

    /// Marks everything up to generation `gen` as written.
    pub fn set_clean(&self, gen: u64) {
        self.disk_gen.fetch_max(gen, Ordering::AcqRel);
    }
}

/// An in-memory page.
pub struct Page {
    kind: PageKind,
    recno: Recno,
    content: PageContent,
    modify: OnceLock<Box<Modify>>,
    hazard: HazardCount,
    evict_soon: AtomicBool,
    skip_depth: usize,
    footprint: usize,
    seed_ovfl: Mutex<Vec<(Bytes, BlockAddr)>>,
}

impl fmt::Debug for Page {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Page")
            .field("kind", &self.kind)
            .field("recno", &self.recno)
            .field("entries", &self.entries())
            .field("dirty", &self.is_dirty())
            .finish()
    }
}

impl Page {
    fn build(kind: PageKind, recno: Recno, content: PageContent, skip_depth: usize) -> Self {
        let footprint = std::mem::size_of::<Self>()
            + match &content {
                PageContent::Row(slots) => slots
                    .iter()
                    .map(|s| s.key.len() + s.value.bytes().len() + std::mem::size_of::<RowSlot>())
                    .sum(),
                PageContent::Col(runs) => runs
                    .iter()
                    .map(|r| {
                        r.value.as_ref().map_or(0, |v| v.bytes().len()) + std::mem::size_of::<ColRun>()
                    })
                    .sum(),
                PageContent::Internal(index) => index.load().len() * 64,
            };
        let seed_ovfl = match &content {
            PageContent::Row(slots) => slots
                .iter()
                .filter_map(|s| match &s.value {
                    DiskValue::Overflow { addr, value } => Some((value.clone(), *addr)),
                    DiskValue::Inline(_) => None,
                })
                .collect(),
            PageContent::Col(runs) => runs
                .iter()
                .filter_map(|r| match &r.value {
                    Some(DiskValue::Overflow { addr, value }) => Some((value.clone(), *addr)),
                    _ => None,
                })
                .collect(),
            PageContent::Internal(_) => Vec::new(),
        };
        Self {
            kind,
            recno,
            content,
            modify: OnceLock::new(),
            hazard: HazardCount::default(),
            evict_soon: AtomicBool::new(false),
            skip_depth,
            footprint,
            seed_ovfl: Mutex::new(seed_ovfl),
        }
    }

    /// Empty row leaf.
    pub fn empty_row_leaf(skip_depth: usize) -> Arc<Self> {
        Arc::new(Self::build(
            PageKind::RowLeaf,
            0,
            PageContent::Row(Vec::new()),
            skip_depth,
        ))
    }

    /// Empty column leaf starting at `recno`.
    pub fn empty_col_leaf(recno: Recno, skip_depth: usize) -> Arc<Self> {
        Arc::new(Self::build(
            PageKind::ColLeaf,
            recno,
            PageContent::Col(Vec::new()),
            skip_depth,
        ))
    }

    /// Internal page over `refs`.
    pub fn internal(kind: PageKind, recno: Recno, refs: Vec<Arc<PageRef>>, skip_depth: usize) -> Arc<Self> {
        Arc::new(Self::build(
            kind,
            recno,
            PageContent::Internal(PageIndex::new(refs)),
            skip_depth,
        ))
    }

    /// Builds a page from a decoded image, reading overflow values.
    pub fn from_image(
        image: DecodedImage,
        block: &dyn BlockManager,
        skip_depth: usize,
    ) -> Result<Arc<Self>> {
        let kind = image.header.kind;
        let recno = image.header.recno;
        let content = match image.body {
            ImageBody::RowLeaf(cells) => {
                let mut slots = Vec::with_capacity(cells.len());
                for cell in cells {
                    if slots.last().is_some_and(|prev: &RowSlot| prev.key >= cell.key) {
                        return Err(SombraError::Corruption("row leaf keys out of order"));
                    }
                    slots.push(RowSlot {
                        key: cell.key,
                        value: DiskValue::load(cell.value, block)?,
                        tw: cell.tw,
                    });
                }
                PageContent::Row(slots)
            }
            ImageBody::ColLeaf(cells) => {
                let mut runs = Vec::with_capacity(cells.len());
                let mut next = recno;
                for cell in cells {
                    let value = match cell.value {
                        Some(value) => Some(DiskValue::load(value, block)?),
                        None => None,
                    };
                    runs.push(ColRun {
                        recno: next,
                        rle: cell.rle,
                        value,
                        tw: cell.tw,
                    });
                    next = next
                        .checked_add(cell.rle)
                        .ok_or(SombraError::Corruption("column run overflows recno space"))?;
                }
                PageContent::Col(runs)
            }
            ImageBody::Internal(cells) => {
                let mut refs = Vec::with_capacity(cells.len());
                for cell in cells {
                    let key = match cell.key {
                        AddrKey::Row(key) => RefKey::Row(key),
                        AddrKey::Recno(recno) => RefKey::Recno(recno),
                    };
                    let child = match cell.page_del {
                        Some(del) => PageRef::deleted(
                            key,
                            Some(cell.addr),
                            Some(PageDeleted::committed(del.txn, del.ts, del.durable_ts, del.prepare)),
                        ),
                        None => PageRef::disk(key, cell.addr),
                    };
                    refs.push(child);
                }
                if refs.is_empty() {
                    return Err(SombraError::Corruption("internal page without children"));
                }
                PageContent::Internal(PageIndex::new(refs))
            }
        };
        Ok(Arc::new(Self::build(kind, recno, content, skip_depth)))
    }

    /// Page kind.
    pub fn kind(&self) -> PageKind {
        self.kind
    }

    /// Returns true for leaf pages.
    pub fn is_leaf(&self) -> bool {
        self.kind.is_leaf()
    }

    /// Starting record number (column pages).
    pub fn recno(&self) -> Recno {
        self.recno
    }

    /// On-page content.
    pub fn content(&self) -> &PageContent {
        &self.content
    }

    /// Row slots; empty for other kinds.
    pub fn rows(&self) -> &[RowSlot] {
        match &self.content {
            PageContent::Row(slots) => slots,
            _ => &[],
        }
    }

    /// Column runs; empty for other kinds.
    pub fn runs(&self) -> &[ColRun] {
        match &self.content {
            PageContent::Col(runs) => runs,
            _ => &[],
        }
    }

    /// Child index of internal pages.
    pub fn index(&self) -> Result<&PageIndex> {
        match &self.content {
            PageContent::Internal(index) => Ok(index),
            _ => Err(SombraError::Corruption("expected internal page")),
        }
    }

    /// Number of on-page entries.
    pub fn entries(&self) -> usize {
        match &self.content {
            PageContent::Row(slots) => slots.len(),
            PageContent::Col(runs) => runs.len(),
            PageContent::Internal(index) => index.load().len(),
        }
    }

    /// Binary search over row slots: `Ok(slot)` on an exact match, otherwise
    /// `Err(segment)` naming the insert segment the key belongs to.
    pub fn search_rows(&self, key: &[u8]) -> std::result::Result<usize, usize> {
        self.rows().binary_search_by(|slot| slot.key.as_ref().cmp(key))
    }

    /// Run holding `recno`, if the on-page runs cover it.
    pub fn find_run(&self, recno: Recno) -> Option<usize> {
        let runs = self.runs();
        let idx = runs.partition_point(|run| run.end() <= recno);
        runs.get(idx).filter(|run| run.recno <= recno).map(|_| idx)
    }

    /// One past the last record covered by on-page runs.
    pub fn runs_end(&self) -> Recno {
        self.runs().last().map_or(self.recno, ColRun::end)
    }

    /// Modification structure, if any write happened.
    pub fn modify(&self) -> Option<&Modify> {
        self.modify.get().map(|m| m.as_ref())
    }

    /// Modification structure, created on demand.
    pub fn modify_or_init(&self) -> &Modify {
        self.modify.get_or_init(|| {
            let mut track = OverflowTrack::default();
            track.reset(std::mem::take(&mut *self.seed_ovfl.lock()));
            Box::new(Modify::new(&self.content, self.skip_depth, track))
        })
    }

    /// Overflow blocks referenced by the on-page content.
    pub fn overflow_blocks(&self) -> Vec<BlockAddr> {
        match self.modify() {
            Some(modify) => modify.ovfl.lock().blocks(),
            None => self.seed_ovfl.lock().iter().map(|(_, addr)| *addr).collect(),
        }
    }

    /// Returns true when the page holds modifications not yet written.
    pub fn is_dirty(&self) -> bool {
        self.modify().is_some_and(Modify::is_dirty)
    }

    /// Marks the page dirty, creating the modify structure.
    pub fn mark_dirty(&self) {
        self.modify_or_init().mark_dirty();
    }

    /// Hazard counter of the page.
    pub fn hazard(&self) -> &HazardCount {
        &self.hazard
    }

    /// Flags the page for eviction ahead of others.
    pub fn set_evict_soon(&self) {
        self.evict_soon.store(true, Ordering::Release);
    }

    /// Returns true when flagged for early eviction.
    pub fn evict_soon(&self) -> bool {
        self.evict_soon.load(Ordering::Acquire)
    }

    /// Approximate memory footprint of the on-page content.
    pub fn footprint(&self) -> usize {
        self.footprint
    }
}

/// Hazard-protected handle to a resident page.
///
/// Eviction refuses to discard a page while any handle exists.
pub struct PageHandle {
    page: Arc<Page>,
}

impl PageHandle {
    pub(crate) fn acquire(page: Arc<Page>) -> Self {
        page.hazard.acquire();
        Self { page }
    }

    /// Shared pointer to the page.
    pub fn arc(&self) -> &Arc<Page> {
        &self.page
    }
}

impl Clone for PageHandle {
    fn clone(&self) -> Self {
        Self::acquire(Arc::clone(&self.page))
    }
}

impl Deref for PageHandle {
    type Target = Page;

    fn deref(&self) -> &Page {
        &self.page
    }
}

impl Drop for PageHandle {
    fn drop(&mut self) {
        self.page.hazard.release();
    }
}

impl fmt::Debug for PageHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.page.fmt(f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::primitives::block::MemBlockManager;
    use crate::storage::btree::cell::{encode_overflow, CellOptions, ImageWriter};
    use crate::types::TimeWindow;

    fn opts() -> CellOptions {
        CellOptions {
            prefix_compression: true,
            dictionary_entries: 0,
        }
    }

    #[test]
    fn row_page_from_image_reads_overflow() -> Result<()> {
        let block = MemBlockManager::default();
        let big = vec![7u8; 2000];
        let ovfl = block.write(&encode_overflow(&big)?)?;
        let mut writer = ImageWriter::new(PageKind::RowLeaf, 0, opts());
        writer.push_row(b"a", &ImageValue::Inline(Bytes::from_static(b"1")), &TimeWindow::default());
        writer.push_row(b"c", &ImageValue::Overflow(ovfl), &TimeWindow::default());
        let image = super::super::cell::decode_image(&writer.finish()?)?;
        let page = Page::from_image(image, &block, 4)?;
        assert_eq!(page.entries(), 2);
        assert_eq!(page.rows()[1].value.bytes().len(), 2000);
        assert_eq!(page.search_rows(b"c"), Ok(1));
        assert_eq!(page.search_rows(b"b"), Err(1));
        assert_eq!(page.overflow_blocks(), vec![ovfl]);
        let modify = page.modify_or_init();
        assert_eq!(modify.row_segments(), 3);
        assert_eq!(modify.ovfl.lock().lookup(&big), Some(ovfl));
        Ok(())
    }

    #[test]
    fn column_runs_locate_records() -> Result<()> {
        let block = MemBlockManager::default();
        let mut writer = ImageWriter::new(PageKind::ColLeaf, 10, opts());
        let v = ImageValue::Inline(Bytes::from_static(b"x"));
        writer.push_col(5, Some(&v), &TimeWindow::default());
        writer.push_col(3, None, &TimeWindow::default());
        let image = super::super::cell::decode_image(&writer.finish()?)?;
        let page = Page::from_image(image, &block, 4)?;
        assert_eq!(page.find_run(9), None);
        assert_eq!(page.find_run(10), Some(0));
        assert_eq!(page.find_run(14), Some(0));
        assert_eq!(page.find_run(15), Some(1));
        assert_eq!(page.find_run(18), None);
        assert_eq!(page.runs_end(), 18);
        Ok(())
    }

    #[test]
    fn dirty_tracking_uses_generations() {
        let page = Page::empty_row_leaf(4);
        assert!(!page.is_dirty());
        page.mark_dirty();
        let modify = page.modify().expect("modify created");
        let gen = modify.write_gen();
        assert!(page.is_dirty());
        modify.set_clean(gen);
        assert!(!page.is_dirty());
        page.mark_dirty();
        assert!(page.is_dirty());
    }

    #[test]
    fn handles_hold_hazards() {
        let page = Page::empty_col_leaf(1, 4);
        let first = PageHandle::acquire(Arc::clone(&page));
        let second = first.clone();
        assert_eq!(page.hazard().load(), 2);
        drop(first);
        drop(second);
        assert!(page.hazard().is_clear());
    }
}
