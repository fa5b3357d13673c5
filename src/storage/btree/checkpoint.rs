//! Checkpoint.
//!
//! With eviction shut out and in-flight splits drained, every resident page
//! is visited children first: internal pages are swept for obsolete
//! children, dirty pages are reconciled and their parents marked dirty, and
//! finally the root's reconciliation is turned into a single root image.
//! Blocks queued for free before the checkpoint started are released once
//! the new root is written; blocks queued during it wait for the next one.

use std::time::Instant;

use tracing::{debug, info};

use super::page::PageHandle;
use super::reconcile::{self, Horizon};
use super::reference::{PageRef, RefState};
use super::sweep;
use super::tree::{PageIn, PageInFlags, TreeInner};
use super::visibility::SelectMode;
use crate::primitives::block::BlockAddr;
use crate::types::{Result, SombraError};

struct Pass<'a> {
    tree: &'a TreeInner,
    horizon: Horizon,
    mode: SelectMode,
    /// Bring parked update chains back so they get written.
    restore_parked: bool,
    reconciled: usize,
    swept: usize,
}

impl Pass<'_> {
    fn flags(&self) -> PageInFlags {
        if self.restore_parked {
            PageInFlags::default()
        } else {
            PageInFlags::cached()
        }
    }

    /// Whether the walk must enter a child that is not in memory.
    fn wants_disk_child(&self, child: &PageRef) -> bool {
        if !self.restore_parked || child.state() != RefState::Disk {
            return false;
        }
        match child.addr() {
            Some(addr) if addr.is_leaf() => self.tree.lookaside.lock().contains_key(&addr.block.offset),
            Some(_) => true,
            None => false,
        }
    }

    /// Visits the children of internal page `page`, then sweeps it.
    fn visit(&mut self, page: &PageHandle) -> Result<()> {
        let refs = page.index()?.load();
        for child in refs.iter() {
            if child.state() != RefState::Resident && !self.wants_disk_child(child) {
                continue;
            }
            let handle = match self.tree.page_in(child, &self.horizon.global, self.flags()) {
                Ok(PageIn::Page(handle)) => handle,
                Ok(PageIn::Skip) => continue,
                Err(SombraError::Busy(_)) => continue,
                Err(err) => return Err(err),
            };
            if !handle.is_leaf() {
                self.visit(&handle)?;
            }
            if handle.is_dirty() {
                reconcile::reconcile(self.tree, child, &handle, self.mode, &self.horizon, &[])?;
                page.mark_dirty();
                self.reconciled += 1;
            }
        }
        self.swept += sweep::sweep(self.tree, page, &self.horizon.global)?;
        Ok(())
    }
}

/// Writes every dirty page and a new root image; returns the root address.
///
/// `strict` is the final checkpoint before a tree is closed: every update
/// must be committed and visible, and parked chains are written back.
pub(crate) fn checkpoint(tree: &TreeInner, strict: bool) -> Result<BlockAddr> {
    tree.check()?;
    let started = Instant::now();
    let _exclusive = tree.evict_lock.write();
    let generation = tree.splits.bump();
    tree.splits.drain(generation);
    let frees = std::mem::take(&mut *tree.pending_free.lock());

    let horizon = Horizon::capture(&tree.txns);
    let mut pass = Pass {
        tree,
        horizon,
        mode: if strict {
            SelectMode::Strict
        } else {
            SelectMode::Checkpoint
        },
        restore_parked: strict && !tree.lookaside.lock().is_empty(),
        reconciled: 0,
        swept: 0,
    };
    let root = match tree.page_in(&tree.root, &pass.horizon.global, PageInFlags::default())? {
        PageIn::Page(handle) => handle,
        PageIn::Skip => return Err(SombraError::Corruption("root reference skipped")),
    };
    if let Err(err) = pass.visit(&root) {
        tree.pending_free.lock().extend(frees);
        return Err(err);
    }
    let fresh = tree.root_addr.lock().is_none();
    if root.is_dirty() || fresh {
        if fresh {
            root.mark_dirty();
        }
        reconcile::reconcile(tree, &tree.root, &root, pass.mode, &pass.horizon, &[])?;
    }
    let addr = match reconcile::root_write(tree, &root, &pass.horizon) {
        Ok(addr) => addr,
        Err(err) => {
            tree.pending_free.lock().extend(frees);
            return Err(err);
        }
    };
    *tree.root_addr.lock() = Some(addr);

    let freed = frees.len();
    for block in &frees {
        tree.block.free(block)?;
    }
    tree.stats.add_checkpoints(1);
    debug!(
        target: "sombra_engine::checkpoint",
        reconciled = pass.reconciled,
        swept = pass.swept,
        freed,
        "checkpoint pages written"
    );
    info!(
        target: "sombra_engine::checkpoint",
        offset = addr.offset,
        strict,
        elapsed_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
        "checkpoint finished"
    );
    Ok(addr)
}
