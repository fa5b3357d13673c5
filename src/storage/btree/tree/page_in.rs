//! Bringing child pages into memory and descending to leaves.

use std::sync::Arc;

use tracing::trace;

use super::TreeInner;
use crate::primitives::concurrency::Backoff;
use crate::storage::btree::cell;
use crate::storage::btree::delete;
use crate::storage::btree::page::{Page, PageHandle};
use crate::storage::btree::reconcile::restore_saved;
use crate::storage::btree::reference::{ChildAddr, PageRef, RefKey, RefState};
use crate::txn::Visibility;
use crate::types::{Recno, Result, SombraError};

/// Outcome of [`TreeInner::page_in`].
pub(crate) enum PageIn {
    /// The page, hazard-protected.
    Page(PageHandle),
    /// Nothing the caller can see lives under this reference.
    Skip,
}

/// How a page is wanted.
#[derive(Copy, Clone, Debug, Default)]
pub(crate) struct PageInFlags {
    /// Return `Busy` instead of waiting on a locked reference.
    pub no_wait: bool,
    /// Only pages already in memory; everything else is skipped.
    pub cache_only: bool,
    /// The caller is about to write; deleted pages are instantiated.
    pub for_write: bool,
}

impl PageInFlags {
    pub(crate) fn write() -> Self {
        Self {
            for_write: true,
            ..Self::default()
        }
    }

    pub(crate) fn cached() -> Self {
        Self {
            cache_only: true,
            no_wait: true,
            ..Self::default()
        }
    }
}

/// Search target of a descent.
#[derive(Copy, Clone, Debug)]
pub(crate) enum SearchKey<'k> {
    Row(&'k [u8]),
    Recno(Recno),
}

impl SearchKey<'_> {
    /// Child of `refs` whose key range holds the target.
    pub(crate) fn child_index(&self, refs: &[Arc<PageRef>]) -> usize {
        let after = match self {
            SearchKey::Row(key) => refs.partition_point(|r| r.key().row() <= *key),
            SearchKey::Recno(recno) => refs.partition_point(|r| r.key().recno() <= *recno),
        };
        after.saturating_sub(1)
    }
}

impl TreeInner {
    /// Resolves `page_ref` to a resident page.
    ///
    /// Returns `Restart` when the reference was replaced by a split.
    pub(crate) fn page_in(
        &self,
        page_ref: &Arc<PageRef>,
        snap: &dyn Visibility,
        flags: PageInFlags,
    ) -> Result<PageIn> {
        let mut backoff = Backoff::new();
        loop {
            match page_ref.checked_state()? {
                RefState::Resident => {
                    let Some(page) = page_ref.page() else {
                        backoff.snooze();
                        continue;
                    };
                    let handle = PageHandle::acquire(page);
                    let still = page_ref.state() == RefState::Resident
                        && page_ref
                            .page()
                            .is_some_and(|p| Arc::ptr_eq(&p, handle.arc()));
                    if still {
                        return Ok(PageIn::Page(handle));
                    }
                }
                RefState::Disk => {
                    if flags.cache_only {
                        return Ok(PageIn::Skip);
                    }
                    if !page_ref.cas(RefState::Disk, RefState::Locked) {
                        continue;
                    }
                    let addr = page_ref.addr();
                    let loaded = match addr {
                        Some(addr) => self.read_page(&addr),
                        None => Err(SombraError::Corruption("disk reference without address")),
                    };
                    match loaded {
                        Ok(page) => {
                            page_ref.body().page = Some(page);
                            page_ref.set_state(RefState::Resident);
                        }
                        Err(err) => {
                            page_ref.set_state(RefState::Disk);
                            return Err(err);
                        }
                    }
                }
                RefState::Deleted => {
                    if flags.cache_only {
                        return Ok(PageIn::Skip);
                    }
                    if let Some(out) = self.deleted_in(page_ref, snap, flags)? {
                        return Ok(out);
                    }
                }
                RefState::Locked => {
                    if flags.no_wait {
                        return Err(SombraError::Busy("page reference locked"));
                    }
                    backoff.snooze();
                }
                RefState::Split => return Err(SombraError::Restart),
            }
        }
    }

    /// Handles a deleted reference; `None` means its state changed and the
    /// caller should look again.
    fn deleted_in(
        &self,
        page_ref: &Arc<PageRef>,
        snap: &dyn Visibility,
        flags: PageInFlags,
    ) -> Result<Option<PageIn>> {
        let Some(del) = page_ref.page_del() else {
            if !flags.for_write {
                return Ok(Some(PageIn::Skip));
            }
            if !page_ref.cas(RefState::Deleted, RefState::Locked) {
                return Ok(None);
            }
            let page = self.empty_leaf(page_ref.key());
            page.mark_dirty();
            self.cache.page_created(page.footprint());
            {
                let mut body = page_ref.body();
                body.addr = None;
                body.page = Some(page);
            }
            page_ref.set_state(RefState::Resident);
            trace!(target: "sombra_engine::delete", "empty leaf installed under deleted reference");
            return Ok(None);
        };
        let info = del.info();
        if info.txn.is_aborted() {
            // Rollback is about to restore the reference.
            std::thread::yield_now();
            return Ok(None);
        }
        if !flags.for_write && delete::delete_visible(&info, snap) {
            return Ok(Some(PageIn::Skip));
        }
        if !page_ref.cas(RefState::Deleted, RefState::Locked) {
            return Ok(None);
        }
        match delete::instantiate(self, page_ref, &del) {
            Ok(()) => page_ref.set_state(RefState::Resident),
            Err(err) => {
                page_ref.set_state(RefState::Deleted);
                return Err(err);
            }
        }
        Ok(None)
    }

    /// Reads and builds the page at `addr`, restoring parked update chains.
    pub(crate) fn read_page(&self, addr: &ChildAddr) -> Result<Arc<Page>> {
        let image = self.block.read(&addr.block)?;
        let decoded = cell::decode_image(&image)?;
        let kind = decoded.header.kind;
        let expected = if addr.is_leaf() {
            self.kind.leaf_kind()
        } else {
            self.kind.internal_kind()
        };
        if kind != expected {
            return Err(SombraError::Corruption("page kind does not match its address"));
        }
        let page = Page::from_image(decoded, self.block.as_ref(), self.options.skip_depth)?;
        // Parked chains leave the table only once they are on the page.
        let parked = self.lookaside.lock().get(&addr.block.offset).cloned();
        if let Some(saved) = parked {
            let count = saved.len() as u64;
            restore_saved(&page, saved, &self.stats)?;
            self.lookaside.lock().remove(&addr.block.offset);
            self.stats.add_lookaside_restored(count);
        }
        self.stats.add_pages_read(1);
        self.cache.page_created(page.footprint());
        trace!(
            target: "sombra_engine::evict",
            offset = addr.block.offset,
            kind = ?kind,
            entries = page.entries(),
            "page read"
        );
        Ok(page)
    }

    /// Descends from the root to the leaf covering `key`.
    ///
    /// `None` means the leaf is deleted for `snap`.
    pub(crate) fn descend(
        &self,
        snap: &dyn Visibility,
        key: SearchKey<'_>,
        flags: PageInFlags,
    ) -> Result<Option<PageHandle>> {
        'restart: loop {
            let mut page = match self.page_in(&self.root, snap, PageInFlags::default())? {
                PageIn::Page(handle) => handle,
                PageIn::Skip => return Err(SombraError::Corruption("root reference skipped")),
            };
            while !page.is_leaf() {
                let refs = page.index()?.load();
                let child = refs
                    .get(key.child_index(&refs))
                    .cloned()
                    .ok_or(SombraError::Corruption("internal page without children"))?;
                match self.page_in(&child, snap, flags) {
                    Ok(PageIn::Page(handle)) => page = handle,
                    Ok(PageIn::Skip) => return Ok(None),
                    Err(SombraError::Restart) => continue 'restart,
                    Err(err) => return Err(err),
                }
            }
            return Ok(Some(page));
        }
    }

    /// Largest record number reachable along the rightmost path.
    pub(crate) fn find_last_recno(&self) -> Result<Recno> {
        let snap = self.txns.checkpoint_snapshot();
        let mut page = match self.page_in(&self.root, &snap, PageInFlags::default())? {
            PageIn::Page(handle) => handle,
            PageIn::Skip => return Ok(0),
        };
        loop {
            if page.is_leaf() {
                return Ok(page.runs_end().saturating_sub(1));
            }
            let refs = page.index()?.load();
            let Some(child) = refs.last().cloned() else {
                return Ok(0);
            };
            match self.page_in(&child, &snap, PageInFlags::default())? {
                PageIn::Page(handle) => page = handle,
                PageIn::Skip => {
                    return Ok(match child.key() {
                        RefKey::Recno(recno) => recno.saturating_sub(1),
                        RefKey::Row(_) => 0,
                    })
                }
            }
        }
    }
}
