//! Column-store leaf reconciliation.
//!
//! Records are visited in order: on-page runs (split around records that
//! carry updates), then the append list with deleted runs filling gaps.
//! Adjacent records with equal values and windows collapse into one run.

use bytes::Bytes;

use super::chunk::Chunker;
use super::{saved_chain, RecCtx, RecResult, SavedKey, SavedUpdate};
use crate::storage::btree::cell::{self, ImageValue, ImageWriter};
use crate::storage::btree::page::{ColRun, Modify, Page};
use crate::storage::btree::reference::{AddrKind, RefKey};
use crate::storage::btree::update::UpdateChain;
use crate::storage::btree::visibility::{select, OnDisk, Selected};
use crate::types::page::PageKind;
use crate::types::{Recno, Result, TimeWindow};

struct ColEntry {
    recno: Recno,
    rle: u64,
    value: Option<(Bytes, ImageValue, bool)>,
    tw: TimeWindow,
    saved: Vec<SavedUpdate>,
}

impl ColEntry {
    fn mergeable(&self, next: &ColEntry) -> bool {
        if self.recno + self.rle != next.recno || self.tw != next.tw {
            return false;
        }
        match (&self.value, &next.value) {
            (None, None) => true,
            (Some((a, _, _)), Some((b, _, _))) => a == b,
            _ => false,
        }
    }

    fn size(&self) -> usize {
        cell::col_size(self.rle, self.value.as_ref().map(|(_, v, _)| v), &self.tw)
    }
}

#[derive(Default)]
struct Runs {
    out: Vec<ColEntry>,
}

impl Runs {
    fn push(&mut self, entry: ColEntry) {
        if let Some(last) = self.out.last_mut() {
            if last.mergeable(&entry) {
                last.rle += entry.rle;
                last.saved.extend(entry.saved);
                return;
            }
        }
        self.out.push(entry);
    }

    fn gap(&mut self, recno: Recno, rle: u64) {
        if rle > 0 {
            self.push(ColEntry {
                recno,
                rle,
                value: None,
                tw: TimeWindow::default(),
                saved: Vec::new(),
            });
        }
    }
}

pub(super) fn build(
    ctx: &mut RecCtx<'_>,
    ref_key: &RefKey,
    page: &Page,
    modify: &Modify,
) -> Result<RecResult> {
    let mut runs = Runs::default();
    for (idx, run) in page.runs().iter().enumerate() {
        let mut next = run.recno;
        if let Some(list) = modify.col_update(idx) {
            for (_, node) in list.iter() {
                let recno = *node.key();
                if recno < next || recno >= run.end() {
                    continue;
                }
                if recno > next {
                    piece(ctx, &mut runs, run, next, recno - next)?;
                }
                record(ctx, &mut runs, modify, recno, &node.updates, Some(run))?;
                next = recno + 1;
            }
        }
        if next < run.end() {
            piece(ctx, &mut runs, run, next, run.end() - next)?;
        }
    }
    let mut next = page.runs_end();
    if let Some(list) = modify.col_append() {
        for (_, node) in list.iter() {
            let recno = *node.key();
            if recno < next {
                continue;
            }
            runs.gap(next, recno - next);
            record(ctx, &mut runs, modify, recno, &node.updates, None)?;
            next = recno + 1;
        }
    }

    let entries = runs.out;
    if entries
        .iter()
        .all(|e| e.value.is_none() && e.saved.is_empty())
    {
        return Ok(RecResult::Empty);
    }

    let opts = &ctx.tree.options;
    let page_max = opts.leaf_page_max;
    let mut chunker = Chunker::new(
        page_max,
        opts.split_size(page_max),
        opts.min_split_size(page_max),
    );
    for entry in entries {
        let size = entry.size();
        chunker.push(entry, size);
    }
    let mut blocks = Vec::new();
    for (i, chunk) in chunker.finish().into_iter().enumerate() {
        let start = chunk
            .entries
            .first()
            .map_or(ref_key.recno(), |(e, _)| e.recno);
        let key = if i == 0 {
            ref_key.clone()
        } else {
            RefKey::Recno(start)
        };
        let mut writer = ImageWriter::new(PageKind::ColLeaf, start, ctx.cell_options());
        let mut overflow = false;
        let mut saved = Vec::new();
        for (entry, _) in chunk.entries {
            let value = entry.value.as_ref().map(|(_, v, _)| v);
            writer.push_col(entry.rle, value, &entry.tw);
            overflow |= entry.value.as_ref().is_some_and(|(_, _, o)| *o);
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

fn disk_of(run: &ColRun) -> OnDisk<'_> {
    OnDisk {
        value: run.value.as_ref().map(|v| v.bytes()),
        tw: run.tw,
    }
}

/// Part of an on-page run without updates.
fn piece(ctx: &mut RecCtx<'_>, runs: &mut Runs, run: &ColRun, recno: Recno, rle: u64) -> Result<()> {
    let sel = select(std::iter::empty(), Some(disk_of(run)), &ctx.select_ctx())?;
    let value = match (&sel.value, &run.value) {
        (Selected::OnDisk, Some(disk)) => {
            let (placed, overflow) = ctx.place_disk(disk)?;
            Some((disk.bytes().clone(), placed, overflow))
        }
        _ => None,
    };
    let tw = if value.is_some() {
        sel.tw
    } else {
        TimeWindow::default()
    };
    runs.push(ColEntry {
        recno,
        rle,
        value,
        tw,
        saved: Vec::new(),
    });
    Ok(())
}

/// A single record with an update list entry.
fn record(
    ctx: &mut RecCtx<'_>,
    runs: &mut Runs,
    modify: &Modify,
    recno: Recno,
    chain: &UpdateChain,
    run: Option<&ColRun>,
) -> Result<()> {
    let links = &modify.links;
    let on_disk = run.map(disk_of);
    let sel = select(chain.iter(links), on_disk, &ctx.select_ctx())?;
    ctx.observe(&sel);
    let value = match (&sel.value, run.and_then(|r| r.value.as_ref())) {
        (Selected::Value(bytes), _) => {
            let (placed, overflow) = ctx.place_value(bytes)?;
            Some((bytes.clone(), placed, overflow))
        }
        (Selected::OnDisk, Some(disk)) => {
            let (placed, overflow) = ctx.place_disk(disk)?;
            Some((disk.bytes().clone(), placed, overflow))
        }
        _ => None,
    };
    let saved = if sel.save {
        vec![SavedUpdate {
            key: SavedKey::Recno(recno),
            chain: saved_chain(chain.iter(links), on_disk, ctx.global(), value.is_some()),
            onpage: match sel.value {
                Selected::Value(_) => sel.onpage.clone(),
                _ => None,
            },
        }]
    } else {
        Vec::new()
    };
    let tw = if value.is_some() {
        sel.tw
    } else {
        TimeWindow::default()
    };
    runs.push(ColEntry {
        recno,
        rle: 1,
        value,
        tw,
        saved,
    });
    Ok(())
}
