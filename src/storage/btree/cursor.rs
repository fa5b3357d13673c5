//! Row-store cursor.
//!
//! Inside a leaf, entries come in merged order: the insert segment before
//! slot 0, slot 0, the segment after it, and so on. Every entry is resolved
//! against the cursor's snapshot; entries it cannot see are skipped.

use std::cmp::Ordering;
use std::ops::Bound;
use std::sync::Arc;

use bytes::Bytes;
use tracing::trace;

use super::insert::InsertList;
use super::page::{Page, PageHandle};
use super::tree::{row_value, PageInFlags, TreeInner};
use super::walk::{Direction, Target, Walk};
use super::reference::RefKey;
use crate::txn::Snapshot;
use crate::types::{Result, SombraError};

/// Position inside a leaf.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
enum Pos {
    Before,
    After,
    Slot(usize),
    Ins { seg: usize, node: u32 },
}

fn segment(page: &Page, seg: usize) -> Option<&InsertList<[u8]>> {
    page.modify().and_then(|m| m.row_insert(seg))
}

fn seg_first(page: &Page, seg: usize) -> Option<Pos> {
    if let Some(node) = segment(page, seg).and_then(InsertList::first) {
        return Some(Pos::Ins { seg, node });
    }
    (seg < page.rows().len()).then_some(Pos::Slot(seg))
}

fn seg_last(page: &Page, seg: usize) -> Result<Option<Pos>> {
    if let Some(list) = segment(page, seg) {
        if let Some(node) = list.last()? {
            return Ok(Some(Pos::Ins { seg, node }));
        }
    }
    Ok(seg.checked_sub(1).map(Pos::Slot))
}

fn next_pos(page: &Page, pos: Pos) -> Result<Option<Pos>> {
    Ok(match pos {
        Pos::Before => seg_first(page, 0),
        Pos::After => None,
        Pos::Ins { seg, node } => {
            let list = segment(page, seg).ok_or(SombraError::Corruption("insert segment vanished"))?;
            match list.next(node) {
                Some(node) => Some(Pos::Ins { seg, node }),
                None => (seg < page.rows().len()).then_some(Pos::Slot(seg)),
            }
        }
        Pos::Slot(slot) => seg_first(page, slot + 1),
    })
}

fn prev_pos(page: &Page, pos: Pos) -> Result<Option<Pos>> {
    match pos {
        Pos::Before => Ok(None),
        Pos::After => seg_last(page, page.rows().len()),
        Pos::Ins { seg, node } => {
            let list = segment(page, seg).ok_or(SombraError::Corruption("insert segment vanished"))?;
            Ok(match list.prev(node)? {
                Some(node) => Some(Pos::Ins { seg, node }),
                None => seg.checked_sub(1).map(Pos::Slot),
            })
        }
        Pos::Slot(slot) => seg_last(page, slot),
    }
}

fn key_at(page: &Page, pos: Pos) -> Result<Bytes> {
    match pos {
        Pos::Slot(slot) => page
            .rows()
            .get(slot)
            .map(|row| row.key.clone())
            .ok_or(SombraError::Corruption("row slot out of range")),
        Pos::Ins { seg, node } => segment(page, seg)
            .and_then(|list| list.node(node))
            .map(|node| Bytes::copy_from_slice(node.key()))
            .ok_or(SombraError::Corruption("insert node missing")),
        Pos::Before | Pos::After => Err(SombraError::Corruption("cursor not on an entry")),
    }
}

/// Position of `key` in `page`: the entry itself when present, otherwise
/// the gap it would occupy, seen from `dir`.
fn locate(page: &Page, key: &[u8], dir: Direction) -> Result<(Pos, bool)> {
    match page.search_rows(key) {
        Ok(slot) => Ok((Pos::Slot(slot), true)),
        Err(seg) => {
            if let Some(list) = segment(page, seg) {
                if let Some(node) = list.find(key)? {
                    return Ok((Pos::Ins { seg, node }, true));
                }
                let near = match dir {
                    Direction::Next => list.prev_of_key(key)?,
                    Direction::Prev => list.next_of_key(key)?,
                };
                if let Some(node) = near {
                    return Ok((Pos::Ins { seg, node }, false));
                }
            }
            let pos = match dir {
                Direction::Next => seg.checked_sub(1).map_or(Pos::Before, Pos::Slot),
                Direction::Prev if seg < page.rows().len() => Pos::Slot(seg),
                Direction::Prev => Pos::After,
            };
            Ok((pos, false))
        }
    }
}

/// Cursor over a row-store tree.
pub struct Cursor {
    tree: Arc<TreeInner>,
    snap: Snapshot,
    walk: Walk,
    leaf: Option<PageHandle>,
    pos: Pos,
    lower: Bound<Bytes>,
    upper: Bound<Bytes>,
    keys_only: bool,
    skipped: usize,
}

impl Cursor {
    pub(crate) fn new(tree: Arc<TreeInner>, snap: Snapshot) -> Self {
        Self {
            tree,
            snap,
            walk: Walk::new(PageInFlags::default()),
            leaf: None,
            pos: Pos::Before,
            lower: Bound::Unbounded,
            upper: Bound::Unbounded,
            keys_only: false,
            skipped: 0,
        }
    }

    /// Restricts iteration to a key range; resets the cursor.
    pub fn set_bounds(&mut self, lower: Bound<&[u8]>, upper: Bound<&[u8]>) {
        self.lower = lower.map(Bytes::copy_from_slice);
        self.upper = upper.map(Bytes::copy_from_slice);
        self.reset();
    }

    /// When set, values are resolved for visibility but returned empty.
    pub fn keys_only(&mut self, keys_only: bool) {
        self.keys_only = keys_only;
    }

    /// Releases the current position.
    pub fn reset(&mut self) {
        self.leaf = None;
        self.pos = Pos::Before;
        self.walk.reset();
        self.skipped = 0;
    }

    /// Returns true while the cursor sits on an entry.
    pub fn is_positioned(&self) -> bool {
        self.leaf.is_some() && matches!(self.pos, Pos::Slot(_) | Pos::Ins { .. })
    }

    /// Next visible entry in key order.
    pub fn next(&mut self) -> Result<Option<(Bytes, Bytes)>> {
        self.tree.check()?;
        if self.leaf.is_none() && !self.start(Direction::Next)? {
            return Ok(None);
        }
        self.advance(Direction::Next)
    }

    /// Previous visible entry in key order.
    pub fn prev(&mut self) -> Result<Option<(Bytes, Bytes)>> {
        self.tree.check()?;
        if self.leaf.is_none() && !self.start(Direction::Prev)? {
            return Ok(None);
        }
        self.advance(Direction::Prev)
    }

    /// Positions on `key` and returns its value when visible.
    pub fn search(&mut self, key: &[u8]) -> Result<Option<Bytes>> {
        self.tree.check()?;
        self.reset();
        let Some(leaf) = self.seek_leaf(key, Direction::Next)? else {
            return Ok(None);
        };
        let (pos, found) = locate(&leaf, key, Direction::Next)?;
        if !found {
            self.reset();
            return Ok(None);
        }
        match row_value(&leaf, &self.snap, key)? {
            Some(value) => {
                self.leaf = Some(leaf);
                self.pos = pos;
                Ok(Some(value))
            }
            None => {
                self.reset();
                Ok(None)
            }
        }
    }

    /// Positions on `key`, or failing that on the nearest visible entry
    /// after it, or failing that before it. The ordering tells where the
    /// returned entry lies relative to `key`.
    pub fn search_near(&mut self, key: &[u8]) -> Result<Option<(Ordering, Bytes, Bytes)>> {
        if let Some(value) = self.search(key)? {
            return Ok(Some((Ordering::Equal, Bytes::copy_from_slice(key), value)));
        }
        for dir in [Direction::Next, Direction::Prev] {
            self.reset();
            let Some(leaf) = self.seek_leaf(key, dir)? else {
                continue;
            };
            let (pos, _) = locate(&leaf, key, dir)?;
            self.leaf = Some(leaf);
            self.pos = pos;
            if let Some((k, v)) = self.advance(dir)? {
                let ord = match dir {
                    Direction::Next => Ordering::Greater,
                    Direction::Prev => Ordering::Less,
                };
                return Ok(Some((ord, k, v)));
            }
        }
        self.reset();
        Ok(None)
    }

    fn seek_leaf(&mut self, key: &[u8], dir: Direction) -> Result<Option<PageHandle>> {
        let target = Target::At(RefKey::Row(Bytes::copy_from_slice(key)));
        self.walk.seek(&self.tree, &self.snap, target, dir)
    }

    /// Places the cursor at the edge its bounds allow for `dir`.
    fn start(&mut self, dir: Direction) -> Result<bool> {
        if range_is_empty(&self.lower, &self.upper) {
            return Ok(false);
        }
        let bound = match dir {
            Direction::Next => &self.lower,
            Direction::Prev => &self.upper,
        };
        let leaf = match bound {
            Bound::Included(key) | Bound::Excluded(key) => {
                let key = key.clone();
                let leaf = self.seek_leaf(&key, dir)?;
                if let Some(leaf) = &leaf {
                    let (pos, found) = locate(leaf, &key, dir)?;
                    // On an exact match, back off one entry so `advance`
                    // considers the bound key itself.
                    self.pos = match (found, dir) {
                        (false, _) => pos,
                        (true, Direction::Next) => prev_pos(leaf, pos)?.unwrap_or(Pos::Before),
                        (true, Direction::Prev) => next_pos(leaf, pos)?.unwrap_or(Pos::After),
                    };
                }
                leaf
            }
            Bound::Unbounded => {
                let leaf = self.walk.first(&self.tree, &self.snap, dir)?;
                self.pos = edge(dir);
                leaf
            }
        };
        match leaf {
            Some(leaf) => {
                self.leaf = Some(leaf);
                Ok(true)
            }
            None => {
                self.reset();
                Ok(false)
            }
        }
    }

    fn advance(&mut self, dir: Direction) -> Result<Option<(Bytes, Bytes)>> {
        loop {
            let Some(leaf) = self.leaf.as_ref() else {
                return Ok(None);
            };
            let moved = match dir {
                Direction::Next => next_pos(leaf, self.pos)?,
                Direction::Prev => prev_pos(leaf, self.pos)?,
            };
            let Some(pos) = moved else {
                let next = self.walk.step(&self.tree, &self.snap, dir)?;
                self.skipped = 0;
                match next {
                    Some(leaf) => {
                        self.leaf = Some(leaf);
                        self.pos = edge(dir);
                        continue;
                    }
                    None => {
                        self.reset();
                        return Ok(None);
                    }
                }
            };
            self.pos = pos;
            let key = key_at(leaf, pos)?;
            let beyond = match dir {
                Direction::Next => is_past_upper(&self.upper, &key),
                Direction::Prev => is_before_lower(&self.lower, &key),
            };
            if beyond {
                self.reset();
                return Ok(None);
            }
            let inside = match dir {
                Direction::Next => lower_allows(&self.lower, &key),
                Direction::Prev => !is_past_upper(&self.upper, &key),
            };
            if !inside {
                continue;
            }
            match row_value(leaf, &self.snap, &key)? {
                Some(value) => {
                    let value = if self.keys_only { Bytes::new() } else { value };
                    return Ok(Some((key, value)));
                }
                None => self.note_skip(),
            }
        }
    }

    fn note_skip(&mut self) {
        self.skipped += 1;
        self.tree.stats.add_cursor_skipped(1);
        if self.skipped == self.tree.options.delete_skip_threshold {
            if let Some(leaf) = &self.leaf {
                leaf.set_evict_soon();
                trace!(target: "sombra_engine::cursor", skipped = self.skipped, "leaf flagged for early eviction");
            }
        }
    }
}

impl Drop for Cursor {
    fn drop(&mut self) {
        self.reset();
    }
}

impl std::fmt::Debug for Cursor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cursor")
            .field("positioned", &self.is_positioned())
            .field("lower", &self.lower)
            .field("upper", &self.upper)
            .finish()
    }
}

fn edge(dir: Direction) -> Pos {
    match dir {
        Direction::Next => Pos::Before,
        Direction::Prev => Pos::After,
    }
}

fn lower_allows(lower: &Bound<Bytes>, key: &[u8]) -> bool {
    match lower {
        Bound::Unbounded => true,
        Bound::Included(bound) => matches!(key.cmp(bound), Ordering::Equal | Ordering::Greater),
        Bound::Excluded(bound) => matches!(key.cmp(bound), Ordering::Greater),
    }
}

fn is_before_lower(lower: &Bound<Bytes>, key: &[u8]) -> bool {
    !lower_allows(lower, key)
}

fn is_past_upper(upper: &Bound<Bytes>, key: &[u8]) -> bool {
    match upper {
        Bound::Unbounded => false,
        Bound::Included(bound) => matches!(key.cmp(bound), Ordering::Greater),
        Bound::Excluded(bound) => !matches!(key.cmp(bound), Ordering::Less),
    }
}

fn range_is_empty(lower: &Bound<Bytes>, upper: &Bound<Bytes>) -> bool {
    let (Bound::Included(lo) | Bound::Excluded(lo)) = lower else {
        return false;
    };
    let (Bound::Included(hi) | Bound::Excluded(hi)) = upper else {
        return false;
    };
    match lo.cmp(hi) {
        Ordering::Greater => true,
        Ordering::Equal => !matches!((lower, upper), (Bound::Included(_), Bound::Included(_))),
        Ordering::Less => false,
    }
}
