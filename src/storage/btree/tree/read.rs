//! Point reads.

use std::sync::Arc;

use bytes::Bytes;

use super::{PageInFlags, SearchKey, TreeInner};
use crate::primitives::concurrency::Backoff;
use crate::storage::btree::page::{ColRun, Modify, Page};
use crate::storage::btree::update::{Update, UpdateChain};
use crate::storage::btree::visibility::{select, OnDisk, SelectCtx, SelectMode};
use crate::txn::{Snapshot, Visibility};
use crate::types::{Recno, Result, SombraError};

/// Updates of `chain`, newest first; empty when the page has no modify
/// structure.
pub(crate) fn updates_of<'a>(
    modify: Option<&'a Modify>,
    chain: Option<&'a UpdateChain>,
) -> impl Iterator<Item = &'a Arc<Update>> + 'a {
    modify
        .zip(chain)
        .into_iter()
        .flat_map(|(m, c)| c.iter(&m.links))
}

pub(crate) fn run_disk(run: &ColRun) -> OnDisk<'_> {
    OnDisk {
        value: run.value.as_ref().map(|v| v.bytes()),
        tw: run.tw,
    }
}

/// Visible value of record `recno` on column leaf `page`.
pub(crate) fn col_value(page: &Page, snap: &dyn Visibility, recno: Recno) -> Result<Option<Bytes>> {
    let global = crate::txn::GlobalVisibility::default();
    let ctx = SelectCtx {
        snap,
        global: &global,
        mode: SelectMode::Read,
    };
    let modify = page.modify();
    match page.find_run(recno) {
        Some(idx) => {
            let run = &page.runs()[idx];
            let list = modify.and_then(|m| m.col_update(idx));
            let node = match list {
                Some(list) => list.find(&recno)?.and_then(|i| list.node(i)),
                None => None,
            };
            let disk = run_disk(run);
            let sel = select(updates_of(modify, node.map(|n| &n.updates)), Some(disk), &ctx)?;
            Ok(sel.bytes(Some(&disk)).cloned())
        }
        None => {
            let Some(list) = modify.and_then(Modify::col_append) else {
                return Ok(None);
            };
            let Some(node) = list.find(&recno)?.and_then(|i| list.node(i)) else {
                return Ok(None);
            };
            let sel = select(updates_of(modify, Some(&node.updates)), None, &ctx)?;
            Ok(sel.bytes(None).cloned())
        }
    }
}

/// Visible value of `key` on row leaf `page`.
pub(crate) fn row_value(page: &Page, snap: &dyn Visibility, key: &[u8]) -> Result<Option<Bytes>> {
    let global = crate::txn::GlobalVisibility::default();
    let ctx = SelectCtx {
        snap,
        global: &global,
        mode: SelectMode::Read,
    };
    let modify = page.modify();
    match page.search_rows(key) {
        Ok(slot) => {
            let row = &page.rows()[slot];
            let disk = OnDisk {
                value: Some(row.value.bytes()),
                tw: row.tw,
            };
            let chain = modify.and_then(|m| m.row_update(slot));
            let sel = select(updates_of(modify, chain), Some(disk), &ctx)?;
            Ok(sel.bytes(Some(&disk)).cloned())
        }
        Err(seg) => {
            let Some(list) = modify.and_then(|m| m.row_insert(seg)) else {
                return Ok(None);
            };
            let Some(node) = list.find(key)?.and_then(|i| list.node(i)) else {
                return Ok(None);
            };
            let sel = select(updates_of(modify, Some(&node.updates)), None, &ctx)?;
            Ok(sel.bytes(None).cloned())
        }
    }
}

impl TreeInner {
    pub(crate) fn row_get(&self, snap: &Snapshot, key: &[u8]) -> Result<Option<Bytes>> {
        self.check()?;
        let mut backoff = Backoff::new();
        loop {
            let res = self
                .descend(snap, SearchKey::Row(key), PageInFlags::default())
                .and_then(|leaf| match leaf {
                    Some(leaf) => row_value(&leaf, snap, key),
                    None => Ok(None),
                });
            match res {
                Err(SombraError::Busy(_)) => backoff.snooze(),
                other => return self.guard("get", other),
            }
        }
    }

    pub(crate) fn col_get(&self, snap: &Snapshot, recno: Recno) -> Result<Option<Bytes>> {
        self.check()?;
        let mut backoff = Backoff::new();
        loop {
            let res = self
                .descend(snap, SearchKey::Recno(recno), PageInFlags::default())
                .and_then(|leaf| match leaf {
                    Some(leaf) => col_value(&leaf, snap, recno),
                    None => Ok(None),
                });
            match res {
                Err(SombraError::Busy(_)) => backoff.snooze(),
                other => return self.guard("get", other),
            }
        }
    }
}
