//! Rebuilding a page from a fresh image plus the update chains that had to
//! survive its eviction.

use std::sync::Arc;

use super::{SavedKey, SavedUpdate};
use crate::storage::btree::insert::{insert_key, InsertKey, InsertList};
use crate::storage::btree::page::Page;
use crate::storage::btree::stats::BTreeStats;
use crate::storage::btree::update::{LinkArena, Update, UpdateChain, UpdateKind};
use crate::types::{Result, SombraError};

fn prepend_all(chain: &UpdateChain, links: &LinkArena, updates: &[Arc<Update>]) -> Result<()> {
    for upd in updates.iter().rev() {
        chain.prepend(links, Arc::clone(upd), |_| Ok(()))?;
    }
    Ok(())
}

fn install<K: InsertKey + ?Sized>(
    list: &InsertList<K>,
    key: &K,
    links: &LinkArena,
    updates: &[Arc<Update>],
    stats: &BTreeStats,
) -> Result<()> {
    let placed = insert_key(
        list,
        key,
        || UpdateChain::rebuild(links, updates),
        || stats.add_insert_restarts(1),
    )?;
    if let Err(existing) = placed {
        let node = list
            .node(existing)
            .ok_or(SombraError::Corruption("insert node missing"))?;
        prepend_all(&node.updates, links, updates)?;
    }
    Ok(())
}

/// Links every saved chain into `page` and marks it dirty.
///
/// The update whose value the image now stores is replaced by a birthmark
/// at the same start point, so readers resolve it to the on-page value.
pub(crate) fn restore_saved(page: &Page, saved: Vec<SavedUpdate>, stats: &BTreeStats) -> Result<()> {
    if saved.is_empty() {
        return Ok(());
    }
    let modify = page.modify_or_init();
    let links = &modify.links;
    for entry in saved {
        let chain: Vec<Arc<Update>> = entry
            .chain
            .into_iter()
            .map(|upd| match &entry.onpage {
                Some(onpage) if Arc::ptr_eq(onpage, &upd) => {
                    Update::committed(upd.start(), UpdateKind::Birthmark)
                }
                _ => upd,
            })
            .collect();
        match entry.key {
            SavedKey::Row(key) => match page.search_rows(&key) {
                Ok(slot) => {
                    let target = modify
                        .row_update(slot)
                        .ok_or(SombraError::Corruption("row slot out of range"))?;
                    prepend_all(target, links, &chain)?;
                }
                Err(seg) => {
                    let list = modify.row_insert_or_init(seg)?;
                    install(list, &key[..], links, &chain, stats)?;
                }
            },
            SavedKey::Recno(recno) => match page.find_run(recno) {
                Some(run) => {
                    let list = modify.col_update_or_init(run)?;
                    install(list, &recno, links, &chain, stats)?;
                }
                None => install(modify.col_append_or_init(), &recno, links, &chain, stats)?,
            },
        }
    }
    modify.mark_dirty();
    Ok(())
}
