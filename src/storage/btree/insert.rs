//! Lock-free ordered insert index.
//!
//! A skip list of pending row (or record-number) modifications that have
//! not been folded into a page image yet. Nodes live in an append-only
//! arena and are linked by index, so a linked node is never freed while the
//! list is reachable.
//!
//! Forward pointers are loaded with `Acquire` and published with `Release`
//! compare-and-swap. A node becomes visible at level N only after it was
//! linked at every level below N, which keeps the prefix-skipping key
//! comparison sound: a search never sees a node at an upper level that is
//! missing from a lower one.

use std::borrow::Borrow;
use std::cmp::Ordering;
use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering as AtomicOrdering};

use parking_lot::Mutex;
use rand::Rng;
use smallvec::SmallVec;

use super::update::UpdateChain;
use crate::primitives::arena::{Arena, NIL};
use crate::primitives::bytes::prefix;
use crate::types::{Result, SombraError};

/// Upper bound on skip-list depth.
pub const MAX_DEPTH: usize = 10;

/// Keys an [`InsertList`] can order.
pub trait InsertKey: Ord + Send + Sync {
    /// Owned form stored inside nodes.
    type Owned: Borrow<Self> + Send + Sync + fmt::Debug;

    /// Compares `self` with `other`, both already known to share `*skip`
    /// leading bytes; updates `*skip` to the shared prefix length.
    fn compare_skip(&self, other: &Self, skip: &mut usize) -> Ordering;

    /// Copies the key into its owned form.
    fn to_owned_key(&self) -> Self::Owned;
}

impl InsertKey for [u8] {
    type Owned = Box<[u8]>;

    fn compare_skip(&self, other: &Self, skip: &mut usize) -> Ordering {
        prefix::compare_skip(self, other, skip)
    }

    fn to_owned_key(&self) -> Self::Owned {
        self.into()
    }
}

impl InsertKey for u64 {
    type Owned = u64;

    fn compare_skip(&self, other: &Self, _skip: &mut usize) -> Ordering {
        self.cmp(other)
    }

    fn to_owned_key(&self) -> Self::Owned {
        *self
    }
}

/// One pending modification.
pub struct InsertNode<K: InsertKey + ?Sized> {
    key: K::Owned,
    next: Box<[AtomicU32]>,
    /// Update chain for the key.
    pub updates: UpdateChain,
}

impl<K: InsertKey + ?Sized> InsertNode<K> {
    /// Key of the node.
    pub fn key(&self) -> &K {
        self.key.borrow()
    }

    /// Number of levels the node participates in.
    pub fn depth(&self) -> usize {
        self.next.len()
    }

    fn next_at(&self, level: usize) -> u32 {
        self.next[level].load(AtomicOrdering::Acquire)
    }
}

impl<K: InsertKey + ?Sized> fmt::Debug for InsertNode<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InsertNode")
            .field("key", &self.key)
            .field("depth", &self.next.len())
            .finish()
    }
}

/// Position produced by a search: per-level predecessor and successor.
///
/// `pred[i] == NIL` means the list head at level `i`.
#[derive(Clone, Debug)]
pub struct InsertStack {
    /// Last node at each level whose key sorts before the target.
    pub pred: [u32; MAX_DEPTH],
    /// First node at each level whose key does not sort before the target.
    pub next: [u32; MAX_DEPTH],
    /// Node holding exactly the target key, when present.
    pub found: Option<u32>,
}

impl Default for InsertStack {
    fn default() -> Self {
        Self {
            pred: [NIL; MAX_DEPTH],
            next: [NIL; MAX_DEPTH],
            found: None,
        }
    }
}

/// Skip list of pending modifications ordered by key.
pub struct InsertList<K: InsertKey + ?Sized> {
    nodes: Arena<InsertNode<K>>,
    head: [AtomicU32; MAX_DEPTH],
    tail: [AtomicU32; MAX_DEPTH],
    tail_lock: Mutex<()>,
    max_depth: usize,
}

impl<K: InsertKey + ?Sized> fmt::Debug for InsertList<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InsertList")
            .field("nodes", &self.nodes.len())
            .field("max_depth", &self.max_depth)
            .finish()
    }
}

impl<K: InsertKey + ?Sized> InsertList<K> {
    /// Creates an empty list whose nodes are at most `max_depth` levels tall.
    pub fn new(max_depth: usize) -> Self {
        Self {
            nodes: Arena::new(),
            head: std::array::from_fn(|_| AtomicU32::new(NIL)),
            tail: std::array::from_fn(|_| AtomicU32::new(NIL)),
            tail_lock: Mutex::new(()),
            max_depth: max_depth.clamp(1, MAX_DEPTH),
        }
    }

    /// Returns the node stored at `idx`.
    pub fn node(&self, idx: u32) -> Option<&InsertNode<K>> {
        self.nodes.get(idx)
    }

    /// Returns true when no node is linked.
    pub fn is_empty(&self) -> bool {
        self.head[0].load(AtomicOrdering::Acquire) == NIL
    }

    /// Draws a node depth: each extra level with probability 1/4.
    pub fn random_depth(&self) -> usize {
        let mut rng = rand::thread_rng();
        let mut depth = 1;
        while depth < self.max_depth && rng.gen_ratio(1, 4) {
            depth += 1;
        }
        depth
    }

    fn slot(&self, pred: u32, level: usize) -> Result<&AtomicU32> {
        if pred == NIL {
            return Ok(&self.head[level]);
        }
        self.nodes
            .get(pred)
            .map(|node| &node.next[level])
            .ok_or(SombraError::Corruption("insert list predecessor missing"))
    }

    fn load_next(&self, pred: u32, level: usize) -> Result<u32> {
        Ok(self.slot(pred, level)?.load(AtomicOrdering::Acquire))
    }

    /// Finds the per-level position of `key`.
    pub fn search(&self, key: &K) -> Result<InsertStack> {
        let mut stack = InsertStack::default();
        let mut pred = NIL;
        let mut skip_low = 0usize;
        let mut skip_high = 0usize;
        for level in (0..self.max_depth).rev() {
            loop {
                let next = self.load_next(pred, level)?;
                let Some(node) = self.nodes.get(next) else {
                    stack.pred[level] = pred;
                    stack.next[level] = NIL;
                    break;
                };
                let mut matched = skip_low.min(skip_high);
                match key.compare_skip(node.key(), &mut matched) {
                    Ordering::Greater => {
                        skip_low = matched;
                        pred = next;
                    }
                    ord => {
                        skip_high = matched;
                        stack.pred[level] = pred;
                        stack.next[level] = next;
                        if ord == Ordering::Equal && level == 0 {
                            stack.found = Some(next);
                        }
                        break;
                    }
                }
            }
        }
        Ok(stack)
    }

    /// Fast path for keys at or after the current tail.
    ///
    /// Returns `None` when the key sorts before the tail and a full search
    /// is needed.
    pub fn append_search(&self, key: &K) -> Result<Option<InsertStack>> {
        let last = self.tail[0].load(AtomicOrdering::Acquire);
        let mut stack = InsertStack::default();
        if let Some(node) = self.nodes.get(last) {
            let mut skip = 0;
            match key.compare_skip(node.key(), &mut skip) {
                Ordering::Less => return Ok(None),
                Ordering::Equal => {
                    stack.found = Some(last);
                    return Ok(Some(stack));
                }
                Ordering::Greater => {}
            }
        }
        for level in 0..self.max_depth {
            stack.pred[level] = self.tail[level].load(AtomicOrdering::Acquire);
            stack.next[level] = NIL;
        }
        Ok(Some(stack))
    }

    /// Allocates an unlinked node of `depth` levels.
    pub fn alloc(&self, key: &K, depth: usize, updates: UpdateChain) -> Result<u32> {
        let depth = depth.clamp(1, self.max_depth);
        self.nodes.push(InsertNode {
            key: key.to_owned_key(),
            next: (0..depth).map(|_| AtomicU32::new(NIL)).collect(),
            updates,
        })
    }

    /// Splices node `idx` into the list at the position `stack` describes.
    ///
    /// A lost race at level 0 returns [`SombraError::Restart`]; the caller
    /// must search again and may retry with the same node. Races above
    /// level 0 stop linking at that level.
    pub fn insert(&self, idx: u32, stack: &InsertStack) -> Result<()> {
        let node = self
            .nodes
            .get(idx)
            .ok_or(SombraError::Corruption("insert node missing"))?;
        let depth = node.depth();
        let appends = (0..depth).any(|level| stack.next[level] == NIL);
        let _tail_guard = appends.then(|| self.tail_lock.lock());
        for level in 0..depth {
            node.next[level].store(stack.next[level], AtomicOrdering::Relaxed);
            let slot = self.slot(stack.pred[level], level)?;
            if slot
                .compare_exchange(
                    stack.next[level],
                    idx,
                    AtomicOrdering::Release,
                    AtomicOrdering::Acquire,
                )
                .is_err()
            {
                if level == 0 {
                    return Err(SombraError::Restart);
                }
                break;
            }
            if stack.next[level] == NIL {
                self.tail[level].store(idx, AtomicOrdering::Release);
            }
        }
        Ok(())
    }

    /// Returns the node holding `key`.
    pub fn find(&self, key: &K) -> Result<Option<u32>> {
        Ok(self.search(key)?.found)
    }

    /// First node in key order.
    pub fn first(&self) -> Option<u32> {
        let idx = self.head[0].load(AtomicOrdering::Acquire);
        (idx != NIL).then_some(idx)
    }

    /// Last node in key order.
    pub fn last(&self) -> Result<Option<u32>> {
        let mut pred = NIL;
        for level in (0..self.max_depth).rev() {
            loop {
                let next = self.load_next(pred, level)?;
                if next == NIL {
                    break;
                }
                pred = next;
            }
        }
        Ok((pred != NIL).then_some(pred))
    }

    /// Node following `idx`.
    pub fn next(&self, idx: u32) -> Option<u32> {
        let next = self.nodes.get(idx)?.next_at(0);
        (next != NIL).then_some(next)
    }

    /// Node preceding `idx`.
    ///
    /// Re-derives the predecessor by searching for the node's key, then
    /// checks that the predecessor still points at the node; a concurrent
    /// insert between them forces another search.
    pub fn prev(&self, idx: u32) -> Result<Option<u32>> {
        let node = self
            .nodes
            .get(idx)
            .ok_or(SombraError::Corruption("insert node missing"))?;
        loop {
            let stack = self.search(node.key())?;
            let pred = stack.pred[0];
            if self.load_next(pred, 0)? == idx {
                return Ok((pred != NIL).then_some(pred));
            }
            if stack.found != Some(idx) {
                return Err(SombraError::Corruption("insert node not linked"));
            }
        }
    }

    /// Node with the largest key strictly below `key`, or `None`.
    pub fn prev_of_key(&self, key: &K) -> Result<Option<u32>> {
        let pred = self.search(key)?.pred[0];
        Ok((pred != NIL).then_some(pred))
    }

    /// Node with the smallest key at or above `key`, or `None`.
    pub fn next_of_key(&self, key: &K) -> Result<Option<u32>> {
        let next = self.search(key)?.next[0];
        Ok((next != NIL).then_some(next))
    }

    /// Iterates linked nodes in key order.
    pub fn iter(&self) -> InsertIter<'_, K> {
        InsertIter {
            list: self,
            cur: self.head[0].load(AtomicOrdering::Acquire),
        }
    }

    /// Number of linked nodes (walks level 0).
    pub fn len(&self) -> usize {
        self.iter().count()
    }

    /// Number of allocated nodes, linked or not.
    pub fn allocated(&self) -> usize {
        self.nodes.len()
    }
}

/// Level-0 iterator.
pub struct InsertIter<'a, K: InsertKey + ?Sized> {
    list: &'a InsertList<K>,
    cur: u32,
}

impl<'a, K: InsertKey + ?Sized> Iterator for InsertIter<'a, K> {
    type Item = (u32, &'a InsertNode<K>);

    fn next(&mut self) -> Option<Self::Item> {
        let idx = self.cur;
        let node = self.list.nodes.get(idx)?;
        self.cur = node.next_at(0);
        Some((idx, node))
    }
}

/// Inserts `key` with an initial update chain, retrying level-0 races.
///
/// Returns `Ok(Err(existing))` when the key is already present so the
/// caller can prepend to its chain instead.
pub fn insert_key<K: InsertKey + ?Sized>(
    list: &InsertList<K>,
    key: &K,
    make_chain: impl FnOnce() -> Result<UpdateChain>,
    mut on_restart: impl FnMut(),
) -> Result<std::result::Result<u32, u32>> {
    let mut allocated: Option<u32> = None;
    let mut make_chain = Some(make_chain);
    loop {
        let stack = match list.append_search(key)? {
            Some(stack) => stack,
            None => list.search(key)?,
        };
        if let Some(existing) = stack.found {
            return Ok(Err(existing));
        }
        let idx = match allocated {
            Some(idx) => idx,
            None => {
                let chain = match make_chain.take() {
                    Some(make) => make()?,
                    None => UpdateChain::default(),
                };
                let idx = list.alloc(key, list.random_depth(), chain)?;
                allocated = Some(idx);
                idx
            }
        };
        match list.insert(idx, &stack) {
            Ok(()) => return Ok(Ok(idx)),
            Err(SombraError::Restart) => on_restart(),
            Err(err) => return Err(err),
        }
    }
}

/// Collects the keys of `list` (testing and diagnostics).
pub fn keys<K>(list: &InsertList<K>) -> Vec<K::Owned>
where
    K: InsertKey + ?Sized,
    K::Owned: Clone,
{
    list.iter().map(|(_, node)| node.key.clone()).collect()
}

type Levels = SmallVec<[u32; MAX_DEPTH]>;

/// Returns, per level, the keys of linked nodes; used to check that every
/// node visible at a level is also linked below it.
pub fn level_members<K: InsertKey + ?Sized>(list: &InsertList<K>) -> Result<Vec<Levels>> {
    let mut levels = Vec::with_capacity(list.max_depth);
    for level in 0..list.max_depth {
        let mut members = Levels::new();
        let mut cur = list.head[level].load(AtomicOrdering::Acquire);
        while cur != NIL {
            members.push(cur);
            cur = list.load_next(cur, level)?;
        }
        levels.push(members);
    }
    Ok(levels)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bytes_list() -> InsertList<[u8]> {
        InsertList::new(MAX_DEPTH)
    }

    fn add(list: &InsertList<[u8]>, key: &[u8]) -> u32 {
        match insert_key(list, key, || Ok(UpdateChain::default()), || {}).unwrap() {
            Ok(idx) | Err(idx) => idx,
        }
    }

    #[test]
    fn search_finds_inserted_keys_in_order() {
        let list = bytes_list();
        for key in [&b"m"[..], b"c", b"x", b"a", b"cc", b"ca"] {
            add(&list, key);
        }
        let collected: Vec<Vec<u8>> = keys(&list).into_iter().map(|k| k.to_vec()).collect();
        assert_eq!(
            collected,
            vec![b"a".to_vec(), b"c".to_vec(), b"ca".to_vec(), b"cc".to_vec(), b"m".to_vec(), b"x".to_vec()]
        );
        assert!(list.find(b"cc").unwrap().is_some());
        assert!(list.find(b"cb").unwrap().is_none());
    }

    #[test]
    fn duplicate_insert_returns_existing() {
        let list = bytes_list();
        let first = add(&list, b"k");
        let again = insert_key(&list, &b"k"[..], || Ok(UpdateChain::default()), || {}).unwrap();
        assert_eq!(again, Err(first));
        assert_eq!(list.len(), 1);
    }

    #[test]
    fn prev_walks_backwards() -> Result<()> {
        let list: InsertList<u64> = InsertList::new(4);
        for recno in [5u64, 1, 9, 3, 7] {
            insert_key(&list, &recno, || Ok(UpdateChain::default()), || {})?;
        }
        let mut cur = list.last()?;
        let mut seen = Vec::new();
        while let Some(idx) = cur {
            seen.push(*list.node(idx).unwrap().key());
            cur = list.prev(idx)?;
        }
        assert_eq!(seen, vec![9, 7, 5, 3, 1]);
        Ok(())
    }

    #[test]
    fn stale_stack_restarts_at_level_zero() -> Result<()> {
        let list = bytes_list();
        let stack = list.search(b"b")?;
        add(&list, b"a");
        let idx = list.alloc(b"b", 1, UpdateChain::default())?;
        // The head slot moved from NIL to "a", so the level-0 CAS fails.
        assert!(matches!(list.insert(idx, &stack), Err(SombraError::Restart)));
        let fresh = list.search(b"b")?;
        list.insert(idx, &fresh)?;
        assert_eq!(list.len(), 2);
        Ok(())
    }

    #[test]
    fn append_search_uses_tail() -> Result<()> {
        let list = bytes_list();
        add(&list, b"a");
        add(&list, b"b");
        assert!(list.append_search(b"aa")?.is_none());
        let stack = list.append_search(b"c")?.expect("fast path");
        assert_eq!(stack.next[0], NIL);
        let existing = list.append_search(b"b")?.expect("tail match");
        assert!(existing.found.is_some());
        Ok(())
    }

    #[test]
    fn upper_levels_are_subsets_of_lower_levels() -> Result<()> {
        let list = bytes_list();
        for i in 0..500u32 {
            add(&list, format!("key{:05}", (i * 7919) % 500).as_bytes());
        }
        let levels = level_members(&list)?;
        for pair in levels.windows(2) {
            let lower: std::collections::HashSet<_> = pair[0].iter().collect();
            assert!(pair[1].iter().all(|idx| lower.contains(idx)));
        }
        assert_eq!(levels[0].len(), 500);
        Ok(())
    }
}
