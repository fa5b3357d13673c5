//! Bulk loading of an empty tree.
//!
//! Sorted rows (or appended column values) are cut into leaf images as
//! they arrive and written straight to the block manager; nothing goes
//! through update chains. `finish` files the written leaves under the root,
//! replacing the empty leaf every new tree starts with.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use bytes::Bytes;
use tracing::{debug, info};

use super::{row_separator, Horizon, RecCtx};
use crate::primitives::block::BlockAddr;
use crate::storage::btree::cell::{self, ImageValue, ImageWriter};
use crate::storage::btree::reference::{AddrKind, PageRef, RefKey, RefState};
use crate::storage::btree::tree::{Tree, TreeKind};
use crate::storage::btree::visibility::SelectMode;
use crate::types::page::{PageKind, PAGE_HDR_LEN};
use crate::types::{Recno, Result, SombraError, TimeWindow};

/// Sizing stand-in for an overflow cookie of unknown address.
const WIDEST_ADDR: BlockAddr = BlockAddr {
    offset: u64::MAX,
    size: u32::MAX,
    checksum: u32::MAX,
};

enum Pending {
    Row { key: Bytes, value: Bytes },
    Col { rle: u64, value: Bytes },
}

/// Loader filling an empty tree with sorted data.
///
/// Values become visible to every reader once `finish` returns; the loader
/// is meant for initial loads, before any transaction uses the tree.
pub struct BulkLoader {
    tree: Tree,
    horizon: Horizon,
    tw: TimeWindow,
    pending: Vec<Pending>,
    pending_size: usize,
    /// Key of the first row (or record) in `pending`.
    chunk_key: Option<RefKey>,
    last_key: Option<Bytes>,
    next_recno: Recno,
    written: Vec<Arc<PageRef>>,
    rows: u64,
}

impl BulkLoader {
    pub(crate) fn new(tree: Tree) -> Result<Self> {
        let inner = &tree.inner;
        inner.check()?;
        if !Self::is_empty(&tree)? {
            return Err(SombraError::Invalid("bulk load needs an empty tree"));
        }
        let horizon = Horizon::capture(&inner.txns);
        let next_recno = inner.last_recno.load(Ordering::Acquire) + 1;
        Ok(Self {
            tree,
            horizon,
            tw: TimeWindow::globally_visible(),
            pending: Vec::new(),
            pending_size: PAGE_HDR_LEN,
            chunk_key: None,
            last_key: None,
            next_recno,
            written: Vec::new(),
            rows: 0,
        })
    }

    fn is_empty(tree: &Tree) -> Result<bool> {
        let inner = &tree.inner;
        let Some(root) = inner.root.page() else {
            return Ok(false);
        };
        let refs = root.index()?.load();
        let [only] = refs.as_slice() else {
            return Ok(false);
        };
        if only.state() != RefState::Resident {
            return Ok(false);
        }
        let Some(leaf) = only.page() else {
            return Ok(false);
        };
        let untouched = match leaf.modify() {
            None => true,
            Some(modify) => modify.row_insert(0).map_or(true, |l| l.is_empty())
                && modify.col_append().map_or(true, |l| l.is_empty()),
        };
        Ok(leaf.is_leaf() && leaf.entries() == 0 && untouched)
    }

    /// Adds a row; keys must arrive in strictly increasing order.
    pub fn insert(&mut self, key: &[u8], value: &[u8]) -> Result<()> {
        if self.tree.kind() != TreeKind::Row {
            return Err(SombraError::Invalid("operation does not match the tree kind"));
        }
        self.tree.inner.options.check_key(key)?;
        if self.last_key.as_deref().is_some_and(|last| last >= key) {
            return Err(SombraError::Invalid("bulk load keys out of order"));
        }
        let key = Bytes::copy_from_slice(key);
        let value = Bytes::copy_from_slice(value);
        let size = cell::row_size(&key, &self.sizing(&value), &self.tw);
        if self.should_flush(size) {
            self.flush()?;
        }
        if self.chunk_key.is_none() {
            self.chunk_key = Some(match &self.last_key {
                None => TreeKind::Row.root_key(),
                Some(left) => RefKey::Row(row_separator(left, &key)),
            });
        }
        self.last_key = Some(key.clone());
        self.pending.push(Pending::Row { key, value });
        self.pending_size += size;
        self.rows += 1;
        Ok(())
    }

    /// Appends a value under the next record number and returns it.
    pub fn append(&mut self, value: &[u8]) -> Result<Recno> {
        if self.tree.kind() != TreeKind::Column {
            return Err(SombraError::Invalid("operation does not match the tree kind"));
        }
        let recno = self.next_recno;
        self.next_recno += 1;
        self.rows += 1;
        if let Some(Pending::Col { rle, value: last }) = self.pending.last_mut() {
            if last.as_ref() == value {
                *rle += 1;
                return Ok(recno);
            }
        }
        let value = Bytes::copy_from_slice(value);
        let size = cell::col_size(1, Some(&self.sizing(&value)), &self.tw);
        if self.should_flush(size) {
            self.flush()?;
        }
        if self.chunk_key.is_none() {
            self.chunk_key = Some(RefKey::Recno(recno));
        }
        self.pending.push(Pending::Col { rle: 1, value });
        self.pending_size += size;
        Ok(recno)
    }

    fn sizing(&self, value: &Bytes) -> ImageValue {
        if value.len() <= self.tree.inner.options.inline_limit() {
            ImageValue::Inline(value.clone())
        } else {
            ImageValue::Overflow(WIDEST_ADDR)
        }
    }

    fn should_flush(&self, size: usize) -> bool {
        let opts = &self.tree.inner.options;
        !self.pending.is_empty() && self.pending_size + size > opts.split_size(opts.leaf_page_max)
    }

    /// Writes the pending entries as one leaf image.
    fn flush(&mut self) -> Result<()> {
        let Some(key) = self.chunk_key.take() else {
            return Ok(());
        };
        let inner = &self.tree.inner;
        let mut ctx = RecCtx::new(inner, SelectMode::Checkpoint, &self.horizon, inner.options.inline_limit());
        let (kind, recno) = match &key {
            RefKey::Row(_) => (PageKind::RowLeaf, 0),
            RefKey::Recno(recno) => (PageKind::ColLeaf, *recno),
        };
        let mut writer = ImageWriter::new(kind, recno, ctx.cell_options());
        let mut overflow = false;
        for entry in self.pending.drain(..) {
            match entry {
                Pending::Row { key, value } => {
                    let (placed, ovfl) = ctx.place_value(&value)?;
                    writer.push_row(&key, &placed, &self.tw);
                    overflow |= ovfl;
                }
                Pending::Col { rle, value } => {
                    let (placed, ovfl) = ctx.place_value(&value)?;
                    writer.push_col(rle, Some(&placed), &self.tw);
                    overflow |= ovfl;
                }
            }
        }
        self.pending_size = PAGE_HDR_LEN;
        let addr_kind = if overflow {
            AddrKind::Leaf
        } else {
            AddrKind::LeafNoOverflow
        };
        let block = ctx.write_block(key, writer, addr_kind, Vec::new())?;
        ctx.written.clear();
        debug!(
            target: "sombra_engine::reconcile",
            offset = block.addr.block.offset,
            size = block.addr.block.size,
            "bulk leaf written"
        );
        self.written.push(PageRef::disk(block.key, block.addr));
        Ok(())
    }

    /// Writes the last leaf and installs every leaf under the root.
    pub fn finish(mut self) -> Result<u64> {
        self.flush()?;
        if self.written.is_empty() {
            return Ok(0);
        }
        let inner = Arc::clone(&self.tree.inner);
        let _exclusive = inner.evict_lock.write();
        if !Self::is_empty(&self.tree)? {
            return Err(SombraError::Invalid("tree changed during bulk load"));
        }
        let root = inner
            .root
            .page()
            .ok_or(SombraError::Corruption("root is not resident"))?;
        let refs = std::mem::take(&mut self.written);
        let leaves = refs.len();
        let replaced = {
            let index = root.index()?;
            let mut slot = index.write();
            std::mem::replace(&mut *slot, Arc::new(refs))
        };
        for old in replaced.iter() {
            if let Some(page) = old.page() {
                inner.cache.page_released(page.footprint());
            }
            old.set_state(RefState::Split);
        }
        root.mark_dirty();
        if inner.kind == TreeKind::Column {
            inner.last_recno.fetch_max(self.next_recno - 1, Ordering::AcqRel);
        }
        info!(target: "sombra_engine::reconcile", rows = self.rows, leaves, "bulk load finished");
        Ok(self.rows)
    }
}

impl std::fmt::Debug for BulkLoader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BulkLoader")
            .field("rows", &self.rows)
            .field("leaves", &self.written.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::btree::page::Page;
    use crate::storage::btree::tree::TreeEnv;
    use crate::storage::options::TreeOptions;

    fn small() -> TreeOptions {
        TreeOptions::default()
            .leaf_page_max(1024)
            .max_inline_value(256)
    }

    #[test]
    fn fresh_tree_accepts_a_loader() -> Result<()> {
        let tree = Tree::create_row(TreeEnv::in_memory(), small())?;
        assert!(BulkLoader::is_empty(&tree)?);
        let page: Arc<Page> = tree.inner.root.page().ok_or(SombraError::NotFound)?;
        assert!(!page.is_leaf());
        Ok(())
    }

    #[test]
    fn rows_out_of_order_are_refused() -> Result<()> {
        let tree = Tree::create_row(TreeEnv::in_memory(), small())?;
        let mut loader = tree.bulk_loader()?;
        loader.insert(b"b", b"1")?;
        assert!(matches!(loader.insert(b"a", b"2"), Err(SombraError::Invalid(_))));
        assert!(matches!(loader.insert(b"b", b"2"), Err(SombraError::Invalid(_))));
        assert!(matches!(loader.append(b"x"), Err(SombraError::Invalid(_))));
        Ok(())
    }

    #[test]
    fn loaded_rows_span_several_leaves() -> Result<()> {
        let tree = Tree::create_row(TreeEnv::in_memory(), small())?;
        let mut loader = tree.bulk_loader()?;
        for i in 0..500u32 {
            loader.insert(format!("key{i:05}").as_bytes(), &[7u8; 24])?;
        }
        assert_eq!(loader.finish()?, 500);
        let root = tree.inner.root.page().ok_or(SombraError::NotFound)?;
        assert!(root.index()?.load().len() > 1);
        assert!(tree.bulk_loader().is_err());

        let txn = tree.txns().begin()?;
        let snap = txn.snapshot();
        assert_eq!(tree.get(snap, b"key00000")?, Some(Bytes::from_static(&[7u8; 24])));
        assert_eq!(tree.get(snap, b"key00499")?, Some(Bytes::from_static(&[7u8; 24])));
        assert_eq!(tree.get(snap, b"key00500")?, None);
        Ok(())
    }

    #[test]
    fn equal_appends_share_a_run() -> Result<()> {
        let tree = Tree::create_column(TreeEnv::in_memory(), small())?;
        let mut loader = tree.bulk_loader()?;
        for _ in 0..100 {
            loader.append(b"same")?;
        }
        assert_eq!(loader.append(b"other")?, 101);
        loader.finish()?;
        assert_eq!(tree.last_recno(), 101);
        let txn = tree.txns().begin()?;
        let snap = txn.snapshot();
        assert_eq!(tree.get_recno(snap, 50)?, Some(Bytes::from_static(b"same")));
        assert_eq!(tree.get_recno(snap, 101)?, Some(Bytes::from_static(b"other")));
        Ok(())
    }
}
