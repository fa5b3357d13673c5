//! Reconciliation: turning an in-memory page into one or more page images.
//!
//! Every page kind goes through the same frame: sample the write
//! generation, build chunks of cells, write each chunk as a block, then
//! settle overflow blocks, previous images and the page's clean state.
//! The per-kind builders live in `row`, `col` and `internal`.

mod chunk;
mod col;
mod internal;
mod overflow;
mod restore;
mod row;

pub mod bulk;

use std::sync::Arc;

use bytes::Bytes;
use tracing::{debug, trace};

use self::overflow::OverflowWriter;
use super::cell::{CellOptions, ImageWriter};
use super::page::{Modify, Page, PageContent};
use super::reference::{AddrKind, ChildAddr, PageRef, RefKey, RefState};
use super::tree::TreeInner;
use super::update::{Update, UpdateKind};
use super::visibility::{OnDisk, SelectCtx, SelectMode, Selection};
use crate::primitives::block::BlockAddr;
use crate::txn::{GlobalVisibility, Snapshot, TxnManager, Visibility};
use crate::types::page::PageKind;
use crate::types::{Recno, Result, TimePoint};

pub(crate) use internal::{root_addr as internal_root_addr, root_write};
pub(crate) use restore::restore_saved;

/// Key of a saved update chain.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum SavedKey {
    /// Row-store key.
    Row(Bytes),
    /// Column-store record.
    Recno(Recno),
}

/// Update chain that must outlive the page being evicted.
#[derive(Clone, Debug)]
pub struct SavedUpdate {
    /// Key the chain belongs to.
    pub key: SavedKey,
    /// Updates newest first, closed by the version the old image held.
    pub chain: Vec<Arc<Update>>,
    /// Update whose value the new image stores for the key.
    pub onpage: Option<Arc<Update>>,
}

/// One block produced by reconciliation.
#[derive(Clone, Debug)]
pub struct RecBlock {
    /// Key the block is filed under in the parent.
    pub key: RefKey,
    /// Where the block was written.
    pub addr: ChildAddr,
    /// Image bytes, kept when saved chains need the page rebuilt.
    pub image: Option<Bytes>,
    /// Chains to restore on top of the image.
    pub saved: Vec<SavedUpdate>,
}

/// Outcome of the most recent reconciliation of a page.
#[derive(Clone, Debug, Default)]
pub enum RecResult {
    /// Never reconciled.
    #[default]
    None,
    /// Nothing left to write; the parent drops the page.
    Empty,
    /// One block replaces the page.
    Replace(RecBlock),
    /// The page split into several blocks.
    Multi(Vec<RecBlock>),
}

impl RecResult {
    /// Blocks of the result, in key order.
    pub fn blocks(&self) -> &[RecBlock] {
        match self {
            RecResult::None | RecResult::Empty => &[],
            RecResult::Replace(block) => std::slice::from_ref(block),
            RecResult::Multi(blocks) => blocks,
        }
    }

    /// Returns true when no reconciliation happened yet.
    pub fn is_none(&self) -> bool {
        matches!(self, RecResult::None)
    }
}

/// Visibility inputs of one reconciliation (or one checkpoint).
#[derive(Clone, Debug)]
pub(crate) struct Horizon {
    pub snap: Snapshot,
    pub global: GlobalVisibility,
}

impl Horizon {
    pub(crate) fn capture(txns: &TxnManager) -> Self {
        let global = txns.global();
        let snap = txns.checkpoint_snapshot();
        Self { snap, global }
    }
}

/// Child of an internal page that the evicting thread locked itself,
/// together with the state it was in before.
pub(crate) struct HeldChild {
    pub page_ref: Arc<PageRef>,
    pub prior: RefState,
}

/// Per-reconciliation working state.
pub(crate) struct RecCtx<'a> {
    pub tree: &'a TreeInner,
    pub mode: SelectMode,
    pub horizon: &'a Horizon,
    pub ovfl: OverflowWriter,
    written: Vec<BlockAddr>,
    stable: bool,
    history: bool,
    saved: u64,
}

impl<'a> RecCtx<'a> {
    fn new(tree: &'a TreeInner, mode: SelectMode, horizon: &'a Horizon, max_inline: usize) -> Self {
        Self {
            tree,
            mode,
            horizon,
            ovfl: OverflowWriter::new(max_inline),
            written: Vec::new(),
            stable: true,
            history: false,
            saved: 0,
        }
    }

    pub(crate) fn select_ctx(&self) -> SelectCtx<'_> {
        SelectCtx {
            snap: &self.horizon.snap,
            global: &self.horizon.global,
            mode: self.mode,
        }
    }

    pub(crate) fn global(&self) -> &GlobalVisibility {
        &self.horizon.global
    }

    /// Records that something was left for a later reconciliation.
    pub(crate) fn mark_unstable(&mut self) {
        self.stable = false;
    }

    pub(crate) fn observe(&mut self, sel: &Selection) {
        if !sel.stable {
            self.stable = false;
        }
        self.history |= sel.history;
    }

    /// True when the written images alone answer every reader. Outside
    /// eviction, chains some reader still needs stay only in memory, so the
    /// page cannot be dropped on the strength of this result.
    fn complete(&self) -> bool {
        self.stable && (matches!(self.mode, SelectMode::Evict { .. }) || !self.history)
    }

    pub(crate) fn cell_options(&self) -> CellOptions {
        let opts = &self.tree.options;
        CellOptions {
            prefix_compression: opts.prefix_compression,
            dictionary_entries: opts.dictionary_entries,
        }
    }

    /// Writes a finished image and describes it for the parent.
    pub(crate) fn write_block(
        &mut self,
        key: RefKey,
        writer: ImageWriter,
        kind: AddrKind,
        saved: Vec<SavedUpdate>,
    ) -> Result<RecBlock> {
        let agg = writer.aggregate();
        let image = writer.finish()?;
        let block = self.tree.block.write(&image)?;
        self.written.push(block);
        self.tree.stats.add_pages_written(1);
        self.saved += saved.len() as u64;
        trace!(
            target: "sombra_engine::reconcile",
            offset = block.offset,
            size = block.size,
            saved = saved.len(),
            "image written"
        );
        Ok(RecBlock {
            key,
            addr: ChildAddr { block, kind, agg },
            image: (!saved.is_empty()).then(|| Bytes::from(image)),
            saved,
        })
    }

    pub(crate) fn write_overflow(&mut self, value: &[u8]) -> Result<BlockAddr> {
        let image = super::cell::encode_overflow(value)?;
        let addr = self.tree.block.write(&image)?;
        self.written.push(addr);
        self.tree.stats.add_overflow_written(1);
        Ok(addr)
    }

    fn discard(self) {
        for addr in &self.written {
            if let Err(err) = self.tree.block.free(addr) {
                debug!(target: "sombra_engine::reconcile", error = %err, "free of abandoned block failed");
            }
        }
    }
}

/// Builds the chain saved for a key whose updates must outlive eviction.
///
/// Aborted updates are dropped and history older than the newest complete
/// version every reader can see is cut off. Otherwise the chain is closed
/// with the version the old image held, so readers that see none of the
/// updates still find what they would have found on the old page.
pub(crate) fn saved_chain<'u>(
    chain: impl Iterator<Item = &'u Arc<Update>>,
    original: Option<OnDisk<'_>>,
    global: &GlobalVisibility,
    image_has_value: bool,
) -> Vec<Arc<Update>> {
    let mut out = Vec::new();
    for upd in chain.filter(|u| !u.is_aborted()) {
        let upd = match upd.kind() {
            UpdateKind::Birthmark => match original.as_ref().and_then(|d| d.value) {
                Some(value) => Update::committed(upd.start(), UpdateKind::Standard(value.clone())),
                None => Update::committed(upd.start(), UpdateKind::Tombstone),
            },
            _ => Arc::clone(upd),
        };
        let complete = !matches!(upd.kind(), UpdateKind::Modify(_));
        let settled = complete && global.visible(upd.txn(), upd.start_ts());
        out.push(upd);
        if settled {
            return out;
        }
    }
    match original {
        Some(disk) => {
            if disk.tw.has_stop() {
                out.push(Update::committed(disk.tw.stop, UpdateKind::Tombstone));
            }
            match disk.value {
                Some(value) => out.push(Update::committed(
                    disk.tw.start,
                    UpdateKind::Standard(value.clone()),
                )),
                None => out.push(Update::committed(TimePoint::ORIGIN, UpdateKind::Tombstone)),
            }
        }
        None if image_has_value => {
            out.push(Update::committed(TimePoint::ORIGIN, UpdateKind::Tombstone))
        }
        None => {}
    }
    out
}

fn leaf_kind(kind: PageKind) -> bool {
    matches!(kind, PageKind::RowLeaf | PageKind::ColLeaf)
}

/// Reconciles `page` (filed under `page_ref`) for `mode`, storing the
/// outcome in the page's modify structure.
///
/// `held` lists children the caller locked itself; internal pages treat
/// them as being in their prior state.
pub(crate) fn reconcile(
    tree: &TreeInner,
    page_ref: &PageRef,
    page: &Page,
    mode: SelectMode,
    horizon: &Horizon,
    held: &[HeldChild],
) -> Result<()> {
    let modify = page.modify_or_init();
    let start_gen = modify.write_gen();
    let mut ctx = RecCtx::new(tree, mode, horizon, tree.options.inline_limit());
    {
        let track = modify.ovfl.lock();
        ctx.ovfl.seed(&track);
    }

    let built = match page.content() {
        PageContent::Row(_) => row::build(&mut ctx, page_ref.key(), page, modify),
        PageContent::Col(_) => col::build(&mut ctx, page_ref.key(), page, modify),
        PageContent::Internal(_) => internal::build(&mut ctx, page_ref.key(), page, held),
    };
    let result = match built {
        Ok(result) => result,
        Err(err) => {
            debug!(
                target: "sombra_engine::reconcile",
                error = %err,
                kind = ?page.kind(),
                "reconcile abandoned"
            );
            ctx.discard();
            return Err(err);
        }
    };

    settle(&mut ctx, page_ref, modify, result)?;
    if ctx.complete() {
        modify.set_clean(start_gen);
    }
    tree.stats.add_saved_updates(ctx.saved);
    debug!(
        target: "sombra_engine::reconcile",
        kind = ?page.kind(),
        leaf = leaf_kind(page.kind()),
        blocks = modify.rec.lock().blocks().len(),
        stable = ctx.stable,
        history = ctx.history,
        saved = ctx.saved,
        "page reconciled"
    );
    Ok(())
}

/// Installs `result` and queues everything the new images no longer use.
fn settle(ctx: &mut RecCtx<'_>, page_ref: &PageRef, modify: &Modify, result: RecResult) -> Result<()> {
    let tree = ctx.tree;
    let mut frees = Vec::new();
    {
        let mut track = modify.ovfl.lock();
        let (unused, reused) = ctx.ovfl.finish(&mut track);
        frees.extend(unused);
        tree.stats.add_overflow_reused(reused);
    }
    let previous = std::mem::replace(&mut *modify.rec.lock(), result);
    match previous {
        RecResult::None => {
            if let Some(addr) = page_ref.addr() {
                frees.push(addr.block);
            }
        }
        RecResult::Empty => {}
        RecResult::Replace(block) => frees.push(block.addr.block),
        RecResult::Multi(blocks) => frees.extend(blocks.iter().map(|b| b.addr.block)),
    }
    if !frees.is_empty() {
        trace!(target: "sombra_engine::reconcile", blocks = frees.len(), "blocks queued for free");
        tree.pending_free.lock().extend(frees);
    }
    ctx.written.clear();
    Ok(())
}

/// Key-order helper shared by the builders: the key a chunk after the
/// first is filed under.
pub(crate) fn row_separator(left: &[u8], right: &[u8]) -> Bytes {
    Bytes::from(crate::primitives::bytes::prefix::shortest_separator(left, right))
}

/// Visibility check used by the obsolete sweep and fast delete: a stop
/// recorded in `agg` that `vis` can see.
pub(crate) fn stop_visible(vis: &dyn Visibility, addr: &ChildAddr) -> bool {
    addr.agg.all_stopped() && vis.visible(addr.agg.newest_stop_txn, addr.agg.newest_stop_ts)
}
