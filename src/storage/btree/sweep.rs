//! Obsolete-page sweep.
//!
//! Run by checkpoint over each internal page it visits. A child whose every
//! value carries a stop that all readers can see is dropped from the tree:
//! an on-disk leaf becomes a global delete and its block is queued for
//! free; a committed page delete everyone can see loses its descriptor; a
//! clean resident leaf is flagged so the next eviction pass takes it first.

use tracing::{debug, trace};

use super::delete::delete_visible;
use super::page::Page;
use super::reconcile::stop_visible;
use super::reference::{PageRef, RefState};
use super::tree::TreeInner;
use crate::txn::GlobalVisibility;
use crate::types::Result;

/// Sweeps the children of internal page `page`; returns how many were
/// dropped or flagged.
pub(crate) fn sweep(tree: &TreeInner, page: &Page, global: &GlobalVisibility) -> Result<usize> {
    let refs = page.index()?.load();
    let mut dropped = 0;
    let mut flagged = 0;
    for child in refs.iter() {
        match child.state() {
            RefState::Disk if sweep_disk(tree, child, global) => dropped += 1,
            RefState::Deleted if sweep_deleted(tree, child, global) => dropped += 1,
            RefState::Resident if flag_resident(child, global) => flagged += 1,
            _ => {}
        }
    }
    if dropped > 0 {
        page.mark_dirty();
    }
    let swept = dropped + flagged;
    if swept > 0 {
        tree.stats.add_pages_swept(swept as u64);
        debug!(target: "sombra_engine::sweep", dropped, flagged, children = refs.len(), "obsolete children swept");
    }
    Ok(swept)
}

fn sweep_disk(tree: &TreeInner, child: &PageRef, global: &GlobalVisibility) -> bool {
    let Some(addr) = child.addr() else {
        return false;
    };
    if !addr.is_leaf() || !stop_visible(global, &addr) {
        return false;
    }
    if tree.lookaside.lock().contains_key(&addr.block.offset) {
        return false;
    }
    if !child.cas(RefState::Disk, RefState::Locked) {
        return false;
    }
    {
        let mut body = child.body();
        body.addr = None;
        body.page_del = None;
    }
    child.set_state(RefState::Deleted);
    tree.pending_free.lock().push(addr.block);
    trace!(target: "sombra_engine::sweep", offset = addr.block.offset, "obsolete leaf dropped");
    true
}

fn sweep_deleted(tree: &TreeInner, child: &PageRef, global: &GlobalVisibility) -> bool {
    let (addr, del) = {
        let body = child.body();
        (body.addr, body.page_del.clone())
    };
    let (Some(addr), Some(del)) = (addr, del) else {
        return false;
    };
    let info = del.info();
    if !info.committed || !delete_visible(&info, global) {
        return false;
    }
    if !child.cas(RefState::Deleted, RefState::Locked) {
        return false;
    }
    {
        let mut body = child.body();
        body.addr = None;
        body.page_del = None;
    }
    child.set_state(RefState::Deleted);
    tree.pending_free.lock().push(addr.block);
    trace!(target: "sombra_engine::sweep", offset = addr.block.offset, "settled page delete dropped");
    true
}

fn flag_resident(child: &PageRef, global: &GlobalVisibility) -> bool {
    let (Some(page), Some(addr)) = (child.page(), child.addr()) else {
        return false;
    };
    if !page.is_leaf() || page.is_dirty() || page.evict_soon() || !stop_visible(global, &addr) {
        return false;
    }
    page.set_evict_soon();
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::primitives::block::BlockAddr;
    use crate::storage::btree::reference::{AddrKind, ChildAddr, PageDeleted, RefKey};
    use crate::storage::btree::tree::{Tree, TreeEnv};
    use crate::storage::options::TreeOptions;
    use crate::types::page::PageKind;
    use crate::types::{TimeAggregate, Timestamp, TxnId};
    use std::sync::Arc;

    fn addr(offset: u64, stopped: bool) -> ChildAddr {
        let mut agg = TimeAggregate::default();
        if stopped {
            agg.newest_stop_txn = TxnId(1);
            agg.newest_stop_ts = Timestamp::NONE;
        } else {
            agg.newest_stop_txn = TxnId::MAX;
            agg.newest_stop_ts = Timestamp::MAX;
        }
        ChildAddr {
            block: BlockAddr {
                offset,
                size: 512,
                checksum: 0,
            },
            kind: AddrKind::LeafNoOverflow,
            agg,
        }
    }

    #[test]
    fn stopped_children_are_dropped() -> Result<()> {
        let tree = Tree::create_row(TreeEnv::in_memory(), TreeOptions::default())?;
        let inner = &tree.inner;
        let live = PageRef::disk(RefKey::Row("".into()), addr(512, false));
        let dead = PageRef::disk(RefKey::Row("m".into()), addr(1024, true));
        let settled = PageRef::deleted(
            RefKey::Row("t".into()),
            Some(addr(1536, false)),
            Some(PageDeleted::committed(TxnId(1), Timestamp::NONE, Timestamp::NONE, false)),
        );
        let parent = Page::internal(
            PageKind::RowInternal,
            0,
            vec![Arc::clone(&live), Arc::clone(&dead), Arc::clone(&settled)],
            4,
        );
        let global = GlobalVisibility {
            oldest_id: TxnId(10),
            pinned_ts: Timestamp::NONE,
        };
        assert_eq!(sweep(inner, &parent, &global)?, 2);
        assert_eq!(live.state(), RefState::Disk);
        assert_eq!(dead.state(), RefState::Deleted);
        assert!(dead.addr().is_none());
        assert!(settled.page_del().is_none());
        assert!(parent.is_dirty());
        let queued: Vec<u64> = inner.pending_free.lock().iter().map(|a| a.offset).collect();
        assert_eq!(queued, vec![1024, 1536]);
        Ok(())
    }
}
