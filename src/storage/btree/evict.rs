//! Eviction.
//!
//! A page is evicted by taking its reference from `Resident` to `Locked`,
//! checking that no reader holds a hazard on it, reconciling it and
//! publishing the outcome: the reference becomes `Deleted` (nothing left),
//! `Disk` (one image), or `Split` with the new children spliced into the
//! parent. Chains that must outlive the page are either restored onto a
//! page rebuilt from the new image or parked in the lookaside table. Any
//! obstacle rolls back every lock taken and reports `Busy`.

use std::sync::Arc;

use tracing::{debug, trace, warn};

use super::cell::decode_image;
use super::page::{Page, PageHandle};
use super::reconcile::{self, HeldChild, Horizon, RecBlock, RecResult};
use super::reference::{PageRef, RefKey, RefState};
use super::tree::{PageIn, PageInFlags, TreeInner};
use super::visibility::SelectMode;
use crate::txn::GlobalVisibility;
use crate::types::{Result, SombraError};

/// Locks taken by one eviction attempt, released on drop unless settled.
struct Hold<'a> {
    page_ref: &'a PageRef,
    children: Vec<HeldChild>,
    settled: bool,
}

impl<'a> Hold<'a> {
    fn new(page_ref: &'a PageRef) -> Self {
        Self {
            page_ref,
            children: Vec::new(),
            settled: false,
        }
    }

    /// Locks every child of an internal page; resident or busy children
    /// refuse the eviction.
    fn lock_children(&mut self, page: &Page) -> Result<()> {
        let refs = page.index()?.load();
        for child in refs.iter() {
            let prior = child.state();
            match prior {
                RefState::Disk | RefState::Deleted => {
                    if !child.cas(prior, RefState::Locked) {
                        return Err(SombraError::Busy("child reference changed"));
                    }
                    self.children.push(HeldChild {
                        page_ref: Arc::clone(child),
                        prior,
                    });
                }
                RefState::Resident => return Err(SombraError::Busy("internal page has resident children")),
                RefState::Locked | RefState::Split => return Err(SombraError::Busy("child reference busy")),
            }
        }
        Ok(())
    }

    fn release_children(&mut self) {
        for held in self.children.drain(..) {
            held.page_ref.set_state(held.prior);
        }
    }

    /// The reference leaves `Locked` for `state`; children go back to
    /// where they were.
    fn settle(mut self, state: RefState) {
        self.release_children();
        self.page_ref.set_state(state);
        self.settled = true;
    }
}

impl Drop for Hold<'_> {
    fn drop(&mut self) {
        if !self.settled {
            self.release_children();
            self.page_ref.set_state(RefState::Resident);
        }
    }
}

/// What the reference and the parent should hold after eviction.
enum Outcome {
    /// The image the reference already names is current.
    Unchanged,
    Empty,
    Replace(Arc<PageRef>),
    Split(Vec<Arc<PageRef>>),
}

/// Rebuilds a page from the image of `block` with its saved chains.
fn restored_page(tree: &TreeInner, block: &RecBlock) -> Result<Arc<Page>> {
    let image = block
        .image
        .as_ref()
        .ok_or(SombraError::Corruption("saved updates without an image"))?;
    let page = Page::from_image(decode_image(image)?, tree.block.as_ref(), tree.options.skip_depth)?;
    reconcile::restore_saved(&page, block.saved.clone(), &tree.stats)?;
    tree.cache.page_created(page.footprint());
    Ok(page)
}

/// Reference for one block of a reconciliation result, filed under `key`.
fn block_ref(tree: &TreeInner, key: RefKey, block: &RecBlock) -> Result<Arc<PageRef>> {
    if block.saved.is_empty() {
        return Ok(PageRef::disk(key, block.addr));
    }
    if tree.options.update_restore {
        let page = restored_page(tree, block)?;
        return Ok(PageRef::resident(key, Some(block.addr), page));
    }
    tree.lookaside
        .lock()
        .insert(block.addr.block.offset, block.saved.clone());
    trace!(
        target: "sombra_engine::evict",
        offset = block.addr.block.offset,
        chains = block.saved.len(),
        "saved chains parked in lookaside"
    );
    Ok(PageRef::disk(key, block.addr))
}

fn outcome(tree: &TreeInner, page_ref: &PageRef, rec: &RecResult) -> Result<Outcome> {
    Ok(match rec {
        RecResult::None => Outcome::Unchanged,
        RecResult::Empty => Outcome::Empty,
        RecResult::Replace(block) => Outcome::Replace(block_ref(tree, page_ref.key().clone(), block)?),
        RecResult::Multi(blocks) => {
            let mut refs = Vec::with_capacity(blocks.len());
            for (i, block) in blocks.iter().enumerate() {
                let key = if i == 0 {
                    page_ref.key().clone()
                } else {
                    block.key.clone()
                };
                refs.push(block_ref(tree, key, block)?);
            }
            Outcome::Split(refs)
        }
    })
}

/// Replaces `page_ref` in the parent's child array with `refs`.
fn publish_split(tree: &TreeInner, parent: &Page, page_ref: &Arc<PageRef>, refs: Vec<Arc<PageRef>>) -> Result<()> {
    let index = parent.index()?;
    let mut slot = index.write();
    let pos = slot
        .iter()
        .position(|r| Arc::ptr_eq(r, page_ref))
        .ok_or(SombraError::Busy("parent no longer holds the page"))?;
    let mut next = Vec::with_capacity(slot.len() + refs.len() - 1);
    next.extend(slot[..pos].iter().cloned());
    next.extend(refs);
    next.extend(slot[pos + 1..].iter().cloned());
    *slot = Arc::new(next);
    drop(slot);
    tree.splits.bump();
    Ok(())
}

/// Evicts the page behind `page_ref`, a child of `parent`.
pub(crate) fn evict(tree: &TreeInner, page_ref: &Arc<PageRef>, parent: &Page) -> Result<()> {
    if tree.is_root(page_ref) {
        return Err(SombraError::Busy("the root stays resident"));
    }
    if !page_ref.cas(RefState::Resident, RefState::Locked) {
        return Err(SombraError::Busy("reference not resident"));
    }
    let mut hold = Hold::new(page_ref);
    let page = page_ref
        .page()
        .ok_or(SombraError::Corruption("resident reference without page"))?;
    if !page.hazard().is_clear() {
        tree.stats.add_evict_busy(1);
        return Err(SombraError::Busy("page in use"));
    }
    if !page.is_leaf() {
        hold.lock_children(&page)?;
    }

    if page.is_dirty() {
        let horizon = Horizon::capture(&tree.txns);
        let mode = SelectMode::Evict {
            restore: tree.options.update_restore,
            lookaside: tree.options.lookaside,
        };
        if let Err(err) = reconcile::reconcile(tree, page_ref, &page, mode, &horizon, &hold.children) {
            if matches!(err, SombraError::Busy(_)) {
                tree.stats.add_evict_busy(1);
            }
            return Err(err);
        }
    }
    let rec = page
        .modify()
        .map(|m| m.rec.lock().clone())
        .unwrap_or_default();
    let outcome = outcome(tree, page_ref, &rec)?;

    let state = match outcome {
        Outcome::Unchanged => {
            if page_ref.addr().is_none() {
                return Err(SombraError::Corruption("clean page without an image"));
            }
            page_ref.body().page = None;
            RefState::Disk
        }
        Outcome::Empty => {
            let mut body = page_ref.body();
            body.page = None;
            body.addr = None;
            body.page_del = None;
            drop(body);
            parent.mark_dirty();
            RefState::Deleted
        }
        Outcome::Replace(next) => {
            let (addr, fresh) = {
                let body = next.body();
                (body.addr, body.page.clone())
            };
            let mut body = page_ref.body();
            body.addr = addr;
            body.page = fresh.clone();
            drop(body);
            parent.mark_dirty();
            if fresh.is_some() {
                RefState::Resident
            } else {
                RefState::Disk
            }
        }
        Outcome::Split(refs) => {
            let count = refs.len();
            publish_split(tree, parent, page_ref, refs)?;
            page_ref.body().page = None;
            parent.mark_dirty();
            tree.stats.add_splits(1);
            debug!(target: "sombra_engine::evict", key = ?page_ref.key(), pages = count, "page split into parent");
            RefState::Split
        }
    };
    hold.settle(state);
    tree.cache.page_released(page.footprint());
    tree.stats.add_pages_evicted(1);
    trace!(target: "sombra_engine::evict", key = ?page_ref.key(), state = ?state, "page evicted");
    Ok(())
}

/// Child count above which the root gets a new level.
fn root_fanout_limit(tree: &TreeInner) -> usize {
    (tree.options.internal_page_max / 32).max(8)
}

/// Moves the root's children under new internal pages when the root grew
/// too wide, so splits keep landing in pages that can themselves be
/// evicted and split.
pub(crate) fn deepen_root(tree: &TreeInner) -> Result<bool> {
    let limit = root_fanout_limit(tree);
    let _exclusive = tree.evict_lock.write();
    let root = tree
        .root
        .page()
        .ok_or(SombraError::Corruption("root is not resident"))?;
    let index = root.index()?;
    let mut slot = index.write();
    if slot.len() <= limit {
        return Ok(false);
    }
    let group = (limit / 2).max(2);
    let kind = tree.kind.internal_kind();
    let mut level = Vec::with_capacity(slot.len().div_ceil(group));
    for refs in slot.chunks(group) {
        let key = refs[0].key().clone();
        let page = Page::internal(kind, key.recno(), refs.to_vec(), tree.options.skip_depth);
        page.mark_dirty();
        tree.cache.page_created(page.footprint());
        level.push(PageRef::resident(key, None, page));
    }
    let children = slot.len();
    let pages = level.len();
    *slot = Arc::new(level);
    drop(slot);
    root.mark_dirty();
    tree.splits.bump();
    debug!(target: "sombra_engine::evict", children, pages, "root deepened");
    Ok(true)
}

fn evict_under(tree: &TreeInner, parent: &PageHandle, evicted: &mut usize, busy: &mut usize) -> Result<()> {
    let refs = parent.index()?.load();
    let mut order: Vec<(bool, &Arc<PageRef>)> = refs
        .iter()
        .map(|r| (r.page().is_some_and(|p| p.evict_soon()), r))
        .collect();
    order.sort_by_key(|(soon, _)| !*soon);
    for (_, child) in order {
        if child.state() != RefState::Resident {
            continue;
        }
        let internal = child.page().is_some_and(|p| !p.is_leaf());
        if internal {
            match tree.page_in(child, &GlobalVisibility::default(), PageInFlags::cached()) {
                Ok(PageIn::Page(handle)) => evict_under(tree, &handle, evicted, busy)?,
                Ok(PageIn::Skip) | Err(SombraError::Busy(_)) | Err(SombraError::Restart) => continue,
                Err(err) => return Err(err),
            }
        }
        match evict(tree, child, parent) {
            Ok(()) => *evicted += 1,
            Err(SombraError::Busy(reason)) => {
                *busy += 1;
                trace!(target: "sombra_engine::evict", reason, "eviction skipped");
            }
            Err(err) => return Err(err),
        }
    }
    Ok(())
}

/// Tries to evict every resident page below the root, children before
/// parents and pages flagged for early eviction first.
pub(crate) fn evict_pass(tree: &TreeInner) -> Result<usize> {
    tree.check()?;
    deepen_root(tree)?;
    let _shared = tree.evict_lock.read();
    let _generation = tree.splits.enter();
    let root = match tree.page_in(&tree.root, &GlobalVisibility::default(), PageInFlags::cached())? {
        PageIn::Page(handle) => handle,
        PageIn::Skip => return Err(SombraError::Corruption("root reference skipped")),
    };
    let mut evicted = 0;
    let mut busy = 0;
    evict_under(tree, &root, &mut evicted, &mut busy)?;
    if busy > 0 && evicted == 0 {
        warn!(target: "sombra_engine::evict", busy, "eviction pass made no progress");
    }
    debug!(target: "sombra_engine::evict", evicted, busy, "eviction pass finished");
    Ok(evicted)
}
