//! Row and column writes.
//!
//! A write descends to its leaf for writing, links a new update at the head
//! of the key's chain (creating an insert node for keys without one) and
//! records the update with its transaction. Conflicts are decided against
//! the newest update, or the on-page window when the chain is empty.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use bytes::Bytes;
use tracing::trace;

use super::read::run_disk;
use super::{PageInFlags, SearchKey, TreeInner};
use crate::primitives::concurrency::Backoff;
use crate::storage::btree::insert::{insert_key, InsertKey, InsertList};
use crate::storage::btree::page::PageHandle;
use crate::storage::btree::update::{LinkArena, Update, UpdateChain, UpdateKind};
use crate::storage::btree::visibility::{select, write_check, OnDisk, SelectCtx, SelectMode};
use crate::txn::{GlobalVisibility, Snapshot, Txn, TxnOp};
use crate::types::{Recno, Result, SombraError, TimeWindow};

/// What a write requires of the key it targets.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub(crate) enum WriteMode {
    /// No requirement.
    Put,
    /// The writer must see a value.
    Existing,
}

fn require_value<'a>(
    snap: &Snapshot,
    chain: impl Iterator<Item = &'a Arc<Update>>,
    on_disk: Option<OnDisk<'_>>,
) -> Result<()> {
    let global = GlobalVisibility::default();
    let ctx = SelectCtx {
        snap,
        global: &global,
        mode: SelectMode::Read,
    };
    let sel = select(chain, on_disk, &ctx)?;
    match sel.bytes(on_disk.as_ref()) {
        Some(_) => Ok(()),
        None => Err(SombraError::NotFound),
    }
}

/// One update on its way into a chain.
struct Link<'a> {
    tree: &'a TreeInner,
    snap: &'a Snapshot,
    upd: &'a Arc<Update>,
    mode: WriteMode,
}

impl Link<'_> {
    /// Links the update under `key` in `list`, checking the newest update
    /// (or `on_disk` when the key has no node yet) for conflicts.
    fn into_list<K: InsertKey + ?Sized>(
        &self,
        list: &InsertList<K>,
        links: &LinkArena,
        key: &K,
        on_disk: Option<OnDisk<'_>>,
    ) -> Result<()> {
        let snap = self.snap;
        let disk_tw: Option<TimeWindow> = on_disk.map(|d| d.tw);
        let node = match list.find(key)? {
            Some(idx) => list.node(idx),
            None => None,
        };
        if self.mode == WriteMode::Existing {
            let chain = node.map(|n| &n.updates);
            require_value(snap, chain.into_iter().flat_map(|c| c.iter(links)), on_disk)?;
        }
        if let Some(node) = node {
            return node.updates.prepend(links, Arc::clone(self.upd), |newest| {
                write_check(snap, newest, disk_tw.as_ref())
            });
        }
        write_check(snap, None, disk_tw.as_ref())?;
        let placed = insert_key(
            list,
            key,
            || Ok(UpdateChain::with_head(UpdateChain::alloc_link(links, Arc::clone(self.upd))?)),
            || self.tree.stats.add_insert_restarts(1),
        )?;
        if let Err(existing) = placed {
            let node = list
                .node(existing)
                .ok_or(SombraError::Corruption("insert node missing"))?;
            node.updates.prepend(links, Arc::clone(self.upd), |newest| {
                write_check(snap, newest, disk_tw.as_ref())
            })?;
        }
        Ok(())
    }
}

impl TreeInner {
    fn write_leaf(&self, snap: &Snapshot, key: SearchKey<'_>) -> Result<PageHandle> {
        self.descend(snap, key, PageInFlags::write())?
            .ok_or(SombraError::Corruption("write descent skipped a page"))
    }

    fn finish_write(&self, txn: &mut Txn, upd: Arc<Update>) -> Result<()> {
        self.cache.bytes_inc(upd.memory_size());
        txn.record(TxnOp::Update(upd))
    }

    /// Retries `attempt` across splits and locked references.
    fn retry_write(&self, op: &'static str, mut attempt: impl FnMut() -> Result<()>) -> Result<()> {
        self.check()?;
        let mut backoff = Backoff::new();
        loop {
            let generation = self.splits.enter();
            match attempt() {
                Err(SombraError::Restart) | Err(SombraError::Busy(_)) => {
                    drop(generation);
                    backoff.snooze();
                }
                other => return self.guard(op, other),
            }
        }
    }

    pub(crate) fn row_write(&self, txn: &mut Txn, key: &[u8], kind: UpdateKind, mode: WriteMode) -> Result<()> {
        if txn.is_prepared() {
            return Err(SombraError::Invalid("write after prepare"));
        }
        let snap = txn.snapshot().clone();
        let mut done: Option<(PageHandle, Arc<Update>)> = None;
        self.retry_write("write", || {
            let leaf = self.write_leaf(&snap, SearchKey::Row(key))?;
            let modify = leaf.modify_or_init();
            let links = &modify.links;
            let upd = Update::new(snap.owner(), kind.clone());
            match leaf.search_rows(key) {
                Ok(slot) => {
                    let row = &leaf.rows()[slot];
                    let disk = OnDisk {
                        value: Some(row.value.bytes()),
                        tw: row.tw,
                    };
                    let chain = modify
                        .row_update(slot)
                        .ok_or(SombraError::Corruption("row slot out of range"))?;
                    if mode == WriteMode::Existing {
                        require_value(&snap, chain.iter(links), Some(disk))?;
                    }
                    chain.prepend(links, Arc::clone(&upd), |newest| {
                        write_check(&snap, newest, Some(&row.tw))
                    })?;
                }
                Err(seg) => {
                    let list = modify.row_insert_or_init(seg)?;
                    Link { tree: self, snap: &snap, upd: &upd, mode }.into_list(list, links, key, None)?;
                }
            }
            modify.mark_dirty();
            done = Some((leaf, upd));
            Ok(())
        })?;
        let (leaf, upd) = done.ok_or(SombraError::Corruption("write finished without an update"))?;
        trace!(target: "sombra_engine::txn", txn = snap.owner().0, key_len = key.len(), "row update linked");
        let res = self.finish_write(txn, upd);
        drop(leaf);
        self.guard("write", res)
    }

    pub(crate) fn col_write(&self, txn: &mut Txn, recno: Recno, kind: UpdateKind, mode: WriteMode) -> Result<()> {
        if txn.is_prepared() {
            return Err(SombraError::Invalid("write after prepare"));
        }
        let snap = txn.snapshot().clone();
        let mut done: Option<(PageHandle, Arc<Update>)> = None;
        self.retry_write("write", || {
            let leaf = self.write_leaf(&snap, SearchKey::Recno(recno))?;
            let modify = leaf.modify_or_init();
            let links = &modify.links;
            let upd = Update::new(snap.owner(), kind.clone());
            match leaf.find_run(recno) {
                Some(idx) => {
                    let run = &leaf.runs()[idx];
                    let list = modify.col_update_or_init(idx)?;
                    Link { tree: self, snap: &snap, upd: &upd, mode }.into_list(
                        list,
                        links,
                        &recno,
                        Some(run_disk(run)),
                    )?;
                }
                None if recno < leaf.recno() => {
                    return Err(SombraError::Corruption("record below its leaf"));
                }
                None => {
                    let list = modify.col_append_or_init();
                    Link { tree: self, snap: &snap, upd: &upd, mode }.into_list(list, links, &recno, None)?;
                }
            }
            modify.mark_dirty();
            done = Some((leaf, upd));
            Ok(())
        })?;
        let (leaf, upd) = done.ok_or(SombraError::Corruption("write finished without an update"))?;
        trace!(target: "sombra_engine::txn", txn = snap.owner().0, recno, "column update linked");
        let res = self.finish_write(txn, upd);
        drop(leaf);
        self.guard("write", res)
    }

    pub(crate) fn col_append(&self, txn: &mut Txn, value: Bytes) -> Result<Recno> {
        let recno = self.last_recno.fetch_add(1, Ordering::AcqRel) + 1;
        self.col_write(txn, recno, UpdateKind::Standard(value), WriteMode::Put)?;
        Ok(recno)
    }
}
