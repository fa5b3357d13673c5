//! Row-store leaf reconciliation.

use bytes::Bytes;

use super::chunk::Chunker;
use super::{row_separator, saved_chain, RecCtx, RecResult, SavedKey, SavedUpdate};
use crate::storage::btree::cell::{self, ImageValue, ImageWriter};
use crate::storage::btree::page::{Modify, Page, RowSlot};
use crate::storage::btree::reference::{AddrKind, RefKey};
use crate::storage::btree::update::UpdateChain;
use crate::storage::btree::visibility::{select, OnDisk, Selected};
use crate::types::page::PageKind;
use crate::types::{Result, TimeWindow};

struct RowEntry {
    key: Bytes,
    cell: Option<(ImageValue, TimeWindow)>,
    overflow: bool,
    saved: Option<SavedUpdate>,
}

/// Merges on-page slots with update chains and insert lists, in key order.
pub(super) fn build(
    ctx: &mut RecCtx<'_>,
    ref_key: &RefKey,
    page: &Page,
    modify: &Modify,
) -> Result<RecResult> {
    let opts = &ctx.tree.options;
    let page_max = opts.leaf_page_max;
    let mut chunker = Chunker::new(
        page_max,
        opts.split_size(page_max),
        opts.min_split_size(page_max),
    );
    let rows = page.rows();
    for seg in 0..=rows.len() {
        if let Some(list) = modify.row_insert(seg) {
            for (_, node) in list.iter() {
                let key = Bytes::copy_from_slice(node.key());
                if let Some((entry, size)) = entry(ctx, modify, key, Some(&node.updates), None)? {
                    chunker.push(entry, size);
                }
            }
        }
        if let Some(slot) = rows.get(seg) {
            let chain = modify.row_update(seg);
            if let Some((entry, size)) = entry(ctx, modify, slot.key.clone(), chain, Some(slot))? {
                chunker.push(entry, size);
            }
        }
    }

    let chunks = chunker.finish();
    if chunks.is_empty() {
        return Ok(RecResult::Empty);
    }
    let mut blocks = Vec::with_capacity(chunks.len());
    let mut prev_last: Option<Bytes> = None;
    for chunk in chunks {
        let key = match (&prev_last, chunk.entries.first()) {
            (Some(left), Some((first, _))) => RefKey::Row(row_separator(left, &first.key)),
            _ => ref_key.clone(),
        };
        prev_last = chunk.entries.last().map(|(e, _)| e.key.clone());
        let mut writer = ImageWriter::new(PageKind::RowLeaf, 0, ctx.cell_options());
        let mut overflow = false;
        let mut saved = Vec::new();
        for (entry, _) in chunk.entries {
            if let Some((value, tw)) = &entry.cell {
                writer.push_row(&entry.key, value, tw);
                overflow |= entry.overflow;
            }
            saved.extend(entry.saved);
        }
        let kind = if overflow {
            AddrKind::Leaf
        } else {
            AddrKind::LeafNoOverflow
        };
        blocks.push(ctx.write_block(key, writer, kind, saved)?);
    }
    Ok(match blocks.len() {
        1 => RecResult::Replace(blocks.remove(0)),
        _ => RecResult::Multi(blocks),
    })
}

fn entry(
    ctx: &mut RecCtx<'_>,
    modify: &Modify,
    key: Bytes,
    chain: Option<&UpdateChain>,
    slot: Option<&RowSlot>,
) -> Result<Option<(RowEntry, usize)>> {
    let links = &modify.links;
    let on_disk = slot.map(|s| OnDisk {
        value: Some(s.value.bytes()),
        tw: s.tw,
    });
    let sel = select(
        chain.into_iter().flat_map(|c| c.iter(links)),
        on_disk,
        &ctx.select_ctx(),
    )?;
    ctx.observe(&sel);

    let (cell, overflow) = match (&sel.value, slot) {
        (Selected::Value(value), _) => {
            let (placed, overflow) = ctx.place_value(value)?;
            (Some((placed, sel.tw)), overflow)
        }
        (Selected::OnDisk, Some(slot)) => {
            let (placed, overflow) = ctx.place_disk(&slot.value)?;
            (Some((placed, sel.tw)), overflow)
        }
        _ => (None, false),
    };
    let saved = sel.save.then(|| SavedUpdate {
        key: SavedKey::Row(key.clone()),
        chain: saved_chain(
            chain.into_iter().flat_map(|c| c.iter(links)),
            on_disk,
            ctx.global(),
            cell.is_some(),
        ),
        onpage: match sel.value {
            Selected::Value(_) => sel.onpage.clone(),
            _ => None,
        },
    });
    if cell.is_none() && saved.is_none() {
        return Ok(None);
    }
    let size = cell
        .as_ref()
        .map_or(0, |(value, tw)| cell::row_size(&key, value, tw));
    Ok(Some((
        RowEntry {
            key,
            cell,
            overflow,
            saved,
        },
        size,
    )))
}
