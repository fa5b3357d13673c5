//! Internal page reconciliation and the root write.

use std::sync::Arc;

use tracing::debug;

use super::chunk::Chunker;
use super::{HeldChild, RecCtx, RecResult};
use crate::primitives::block::BlockAddr;
use crate::primitives::concurrency::Backoff;
use crate::storage::btree::cell::{self, AddrCell, AddrKey, ImageWriter};
use crate::storage::btree::page::Page;
use crate::storage::btree::reference::{AddrKind, ChildAddr, PageRef, RefKey, RefState};
use crate::storage::btree::tree::TreeInner;
use crate::storage::btree::visibility::SelectMode;
use crate::txn::Visibility;
use crate::types::page::PageKind;
use crate::types::{Result, SombraError, TimeAggregate};

fn addr_key(key: &RefKey) -> AddrKey {
    match key {
        RefKey::Row(key) => AddrKey::Row(key.clone()),
        RefKey::Recno(recno) => AddrKey::Recno(*recno),
    }
}

fn ref_key(key: &AddrKey) -> RefKey {
    match key {
        AddrKey::Row(key) => RefKey::Row(key.clone()),
        AddrKey::Recno(recno) => RefKey::Recno(*recno),
    }
}

fn plain(key: &RefKey, addr: ChildAddr) -> AddrCell {
    AddrCell {
        key: addr_key(key),
        addr,
        page_del: None,
    }
}

pub(super) fn build(
    ctx: &mut RecCtx<'_>,
    key: &RefKey,
    page: &Page,
    held: &[HeldChild],
) -> Result<RecResult> {
    let refs = page.index()?.load();
    let mut cells = Vec::with_capacity(refs.len());
    for child in refs.iter() {
        child_cells(ctx, child, held, &mut cells)?;
    }
    if cells.is_empty() {
        return Ok(RecResult::Empty);
    }
    let blocks = write_levels(ctx, key, page.kind(), cells)?;
    Ok(match blocks {
        mut one if one.len() == 1 => RecResult::Replace(one.remove(0)),
        many => RecResult::Multi(many),
    })
}

fn write_levels(
    ctx: &mut RecCtx<'_>,
    key: &RefKey,
    kind: PageKind,
    cells: Vec<AddrCell>,
) -> Result<Vec<super::RecBlock>> {
    let opts = &ctx.tree.options;
    let page_max = opts.internal_page_max;
    let mut chunker = Chunker::new(
        page_max,
        opts.split_size(page_max),
        opts.min_split_size(page_max),
    );
    for cell in cells {
        let size = cell::addr_cell_size(&cell);
        chunker.push(cell, size);
    }
    let mut blocks = Vec::new();
    for (i, chunk) in chunker.finish().into_iter().enumerate() {
        let first = chunk
            .entries
            .first()
            .map(|(c, _)| ref_key(&c.key))
            .unwrap_or_else(|| key.clone());
        let chunk_key = if i == 0 { key.clone() } else { first };
        let mut writer = ImageWriter::new(kind, chunk_key.recno(), ctx.cell_options());
        for (cell, _) in &chunk.entries {
            writer.push_addr(cell);
        }
        blocks.push(ctx.write_block(chunk_key, writer, AddrKind::Internal, Vec::new())?);
    }
    Ok(blocks)
}

fn child_cells(
    ctx: &mut RecCtx<'_>,
    child: &Arc<PageRef>,
    held: &[HeldChild],
    out: &mut Vec<AddrCell>,
) -> Result<()> {
    let mut backoff = Backoff::new();
    loop {
        let state = match child.state() {
            RefState::Locked => match held.iter().find(|h| Arc::ptr_eq(&h.page_ref, child)) {
                Some(h) => h.prior,
                None if matches!(ctx.mode, SelectMode::Evict { .. }) => {
                    return Err(SombraError::Busy("child reference locked"));
                }
                None => {
                    backoff.snooze();
                    continue;
                }
            },
            state => state,
        };
        return match state {
            RefState::Disk => {
                let addr = child
                    .addr()
                    .ok_or(SombraError::Corruption("disk reference without address"))?;
                out.push(plain(child.key(), addr));
                Ok(())
            }
            RefState::Deleted => deleted_cells(ctx, child, held, out),
            RefState::Resident => resident_cells(ctx, child, out),
            RefState::Split | RefState::Locked => Err(SombraError::Busy("child split in progress")),
        };
    }
}

fn deleted_cells(
    ctx: &mut RecCtx<'_>,
    child: &Arc<PageRef>,
    held: &[HeldChild],
    out: &mut Vec<AddrCell>,
) -> Result<()> {
    let (addr, del) = {
        let body = child.body();
        (body.addr, body.page_del.clone())
    };
    let (Some(addr), Some(del)) = (addr, del) else {
        // Deleted for everyone, or never written.
        return Ok(());
    };
    let info = del.info();
    if info.txn.is_aborted() {
        out.push(plain(child.key(), addr));
        ctx.mark_unstable();
        return Ok(());
    }
    if !info.committed || info.prepare {
        return match ctx.mode {
            SelectMode::Evict { .. } => Err(SombraError::Busy("uncommitted page delete")),
            SelectMode::Strict => Err(SombraError::Visibility(
                "uncommitted page delete during strict reconcile",
            )),
            _ => {
                out.push(plain(child.key(), addr));
                ctx.mark_unstable();
                Ok(())
            }
        };
    }
    if ctx.global().visible(info.txn, info.ts) {
        let owned = held.iter().any(|h| Arc::ptr_eq(&h.page_ref, child));
        if owned || child.cas(RefState::Deleted, RefState::Locked) {
            {
                let mut body = child.body();
                body.addr = None;
                body.page_del = None;
            }
            if !owned {
                child.set_state(RefState::Deleted);
            }
            ctx.tree.pending_free.lock().push(addr.block);
            debug!(target: "sombra_engine::reconcile", offset = addr.block.offset, "deleted child dropped");
            return Ok(());
        }
    }
    out.push(AddrCell {
        key: addr_key(child.key()),
        addr,
        page_del: Some(info),
    });
    Ok(())
}

fn resident_cells(ctx: &mut RecCtx<'_>, child: &Arc<PageRef>, out: &mut Vec<AddrCell>) -> Result<()> {
    let page = child
        .page()
        .ok_or(SombraError::Corruption("resident reference without page"))?;
    if let Some(modify) = page.modify() {
        if modify.is_dirty() {
            ctx.mark_unstable();
        }
        let rec = modify.rec.lock();
        match &*rec {
            RecResult::None => {}
            RecResult::Empty => return Ok(()),
            RecResult::Replace(block) => {
                out.push(plain(child.key(), block.addr));
                return Ok(());
            }
            RecResult::Multi(blocks) => {
                for (i, block) in blocks.iter().enumerate() {
                    let key = if i == 0 { child.key() } else { &block.key };
                    out.push(plain(key, block.addr));
                }
                return Ok(());
            }
        }
    }
    // Clean and never reconciled: the image the reference points at is current.
    if let Some(addr) = child.addr() {
        out.push(plain(child.key(), addr));
    }
    Ok(())
}

/// Writes whatever is needed above the root's reconciliation result and
/// returns the address of the new root image.
///
/// A root that split gets new internal levels until one block remains; a
/// root with nothing left references a single empty leaf.
pub(crate) fn root_write(tree: &TreeInner, root: &Page, horizon: &super::Horizon) -> Result<BlockAddr> {
    let modify = root.modify_or_init();
    let rec = modify.rec.lock().clone();
    let key = tree.root.key().clone();
    let mut ctx = RecCtx::new(tree, SelectMode::Checkpoint, horizon, tree.options.inline_limit());
    let built = (|| -> Result<BlockAddr> {
        match rec {
            RecResult::None => tree
                .root
                .addr()
                .map(|a| a.block)
                .ok_or(SombraError::Corruption("root never written")),
            RecResult::Replace(block) => Ok(block.addr.block),
            RecResult::Empty => {
                let leaf_kind = match root.kind() {
                    PageKind::ColInternal => PageKind::ColLeaf,
                    _ => PageKind::RowLeaf,
                };
                let leaf = ImageWriter::new(leaf_kind, key.recno(), ctx.cell_options());
                let leaf = ctx.write_block(key.clone(), leaf, AddrKind::LeafNoOverflow, Vec::new())?;
                let mut writer = ImageWriter::new(root.kind(), key.recno(), ctx.cell_options());
                writer.push_addr(&plain(&key, leaf.addr));
                Ok(ctx
                    .write_block(key.clone(), writer, AddrKind::Internal, Vec::new())?
                    .addr
                    .block)
            }
            RecResult::Multi(blocks) => {
                let mut level = blocks;
                loop {
                    let cells = level
                        .iter()
                        .enumerate()
                        .map(|(i, b)| plain(if i == 0 { &key } else { &b.key }, b.addr))
                        .collect();
                    let mut next = write_levels(&mut ctx, &key, root.kind(), cells)?;
                    if next.len() == 1 {
                        return Ok(next.remove(0).addr.block);
                    }
                    level = next;
                }
            }
        }
    })();
    match built {
        Ok(top) => {
            let extra = std::mem::take(&mut ctx.written);
            let previous = std::mem::replace(&mut *tree.root_extra.lock(), extra);
            tree.pending_free.lock().extend(previous);
            Ok(top)
        }
        Err(err) => {
            ctx.discard();
            Err(err)
        }
    }
}

/// Aggregate of a root image's children, for the root's own address.
pub(crate) fn root_addr(block: BlockAddr) -> ChildAddr {
    ChildAddr {
        block,
        kind: AddrKind::Internal,
        agg: TimeAggregate::default(),
    }
}
