//! Page-level deletes.
//!
//! A leaf that is still on disk can be deleted by marking its reference
//! `Deleted` with a descriptor owned by the deleting transaction. Readers
//! that see the delete skip the page; writers and readers that cannot see
//! it instantiate the page with one tombstone per live entry. The
//! descriptor follows its transaction through prepare, commit and rollback.

use std::sync::Arc;

use tracing::debug;

use super::insert::insert_key;
use super::page::{Page, PageContent};
use super::reference::{AddrKind, PageDelInfo, PageDeleted, PageRef, RefState};
use super::tree::TreeInner;
use super::update::UpdateChain;
use crate::primitives::concurrency::Backoff;
use crate::txn::{Txn, TxnOp, Visibility};
use crate::types::{Result, SombraError, Timestamp, TxnId};

/// Returns true when `snap` sees the page delete described by `info`.
pub(crate) fn delete_visible(info: &PageDelInfo, snap: &dyn Visibility) -> bool {
    if info.txn.is_aborted() || info.prepare {
        false
    } else if info.committed {
        snap.visible(info.txn, info.ts)
    } else {
        snap.visible_id(info.txn)
    }
}

pub(crate) fn commit(del: &Arc<PageDeleted>, ts: Timestamp, durable: Timestamp) {
    del.stamp_commit(ts, durable);
}

pub(crate) fn prepare(del: &Arc<PageDeleted>, ts: Timestamp) {
    del.stamp_prepare(ts);
}

/// Undoes a page delete of transaction `txn`.
///
/// A reference still deleted by this descriptor goes back to `Disk`; an
/// instantiated page keeps its content and the tombstones abort with the
/// descriptor.
pub(crate) fn rollback(page_ref: &PageRef, del: &Arc<PageDeleted>, txn: TxnId) -> Result<()> {
    let mut backoff = Backoff::new();
    loop {
        match page_ref.checked_state()? {
            RefState::Locked => backoff.snooze(),
            RefState::Deleted => {
                if !page_ref.cas(RefState::Deleted, RefState::Locked) {
                    continue;
                }
                let restored = {
                    let mut body = page_ref.body();
                    let mine = body.page_del.as_ref().is_some_and(|d| Arc::ptr_eq(d, del));
                    if mine {
                        body.page_del = None;
                    }
                    mine && body.addr.is_some()
                };
                if restored {
                    page_ref.set_state(RefState::Disk);
                } else {
                    page_ref.set_state(RefState::Deleted);
                }
                del.abort();
                debug!(target: "sombra_engine::delete", txn = %txn, restored, "page delete rolled back");
                return Ok(());
            }
            _ => {
                del.abort();
                debug!(target: "sombra_engine::delete", txn = %txn, "instantiated page delete rolled back");
                return Ok(());
            }
        }
    }
}

/// Deletes the on-disk leaf behind `page_ref` without reading it.
///
/// Returns false when the page does not qualify: it must be a leaf without
/// overflow values, nothing in it may be prepared or invisible to the
/// transaction, and no evicted updates may be parked for it.
pub(crate) fn fast_delete(tree: &TreeInner, txn: &mut Txn, page_ref: &Arc<PageRef>, parent: &Page) -> Result<bool> {
    if page_ref.state() != RefState::Disk {
        return Ok(false);
    }
    let Some(addr) = page_ref.addr() else {
        return Ok(false);
    };
    let snap = txn.snapshot();
    let agg = &addr.agg;
    let read_ts = snap.read_ts();
    let qualifies = addr.kind == AddrKind::LeafNoOverflow
        && !agg.prepare
        && snap.visible_id(agg.newest_txn)
        && (agg.newest_stop_txn == TxnId::MAX || snap.visible_id(agg.newest_stop_txn))
        && (read_ts.is_none() || agg.newest_start_durable_ts <= read_ts)
        && !tree.lookaside.lock().contains_key(&addr.block.offset);
    if !qualifies || !page_ref.cas(RefState::Disk, RefState::Locked) {
        return Ok(false);
    }
    let del = PageDeleted::new(txn.id());
    page_ref.body().page_del = Some(Arc::clone(&del));
    page_ref.set_state(RefState::Deleted);
    if let Err(err) = txn.record(TxnOp::RefDelete(Arc::clone(page_ref), Arc::clone(&del))) {
        rollback(page_ref, &del, txn.id())?;
        return Err(err);
    }
    parent.mark_dirty();
    tree.stats.add_fast_deletes(1);
    debug!(
        target: "sombra_engine::delete",
        txn = %txn.id(),
        offset = addr.block.offset,
        "leaf fast-deleted"
    );
    Ok(true)
}

/// Reads a fast-deleted leaf back in with a tombstone for every live entry.
///
/// The caller holds the reference locked; the page is installed but the
/// state is left to the caller.
pub(crate) fn instantiate(tree: &TreeInner, page_ref: &PageRef, del: &Arc<PageDeleted>) -> Result<()> {
    let page = match page_ref.addr() {
        Some(addr) => tree.read_page(&addr)?,
        None => tree.empty_leaf(page_ref.key()),
    };
    let modify = page.modify_or_init();
    let links = &modify.links;
    let mut tombstones = 0usize;
    match page.content() {
        PageContent::Row(slots) => {
            for (slot, row) in slots.iter().enumerate() {
                if row.tw.has_stop() {
                    continue;
                }
                let chain = modify
                    .row_update(slot)
                    .ok_or(SombraError::Corruption("row slot out of range"))?;
                chain.prepend(links, del.make_tombstone(), |_| Ok(()))?;
                tombstones += 1;
            }
        }
        PageContent::Col(runs) => {
            for (idx, run) in runs.iter().enumerate() {
                if run.value.is_none() || run.tw.has_stop() {
                    continue;
                }
                let list = modify.col_update_or_init(idx)?;
                for recno in run.recno..run.end() {
                    let placed = insert_key(
                        list,
                        &recno,
                        || Ok(UpdateChain::with_head(UpdateChain::alloc_link(links, del.make_tombstone())?)),
                        || tree.stats.add_insert_restarts(1),
                    )?;
                    if let Err(existing) = placed {
                        let node = list
                            .node(existing)
                            .ok_or(SombraError::Corruption("insert node missing"))?;
                        node.updates.prepend(links, del.make_tombstone(), |_| Ok(()))?;
                    }
                    tombstones += 1;
                }
            }
        }
        PageContent::Internal(_) => {
            return Err(SombraError::Corruption("page delete on an internal page"));
        }
    }
    modify.mark_dirty();
    page_ref.body().page = Some(page);
    tree.stats.add_instantiations(1);
    debug!(target: "sombra_engine::delete", tombstones, "deleted page instantiated");
    Ok(())
}
