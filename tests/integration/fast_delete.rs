#![allow(missing_docs)]

use std::ops::Bound;

use sombra_engine::types::{Result, Timestamp};
use sombra_engine::{Tree, TreeEnv, TreeOptions};

fn options() -> TreeOptions {
    TreeOptions::default()
        .leaf_page_max(1024)
        .max_inline_value(128)
}

fn key(i: u32) -> Vec<u8> {
    format!("event:{i:07}").into_bytes()
}

/// Tree whose rows live in on-disk leaves only.
fn on_disk(rows: u32) -> Result<Tree> {
    let tree = Tree::create_row(TreeEnv::in_memory(), options())?;
    let mut txn = tree.txns().begin()?;
    for i in 0..rows {
        tree.put(&mut txn, &key(i), b"payload")?;
    }
    txn.commit(Timestamp(1))?;
    tree.txns().set_oldest_timestamp(Timestamp(1))?;
    tree.evict_pass()?;
    tree.evict_pass()?;
    Ok(tree)
}

fn count(tree: &Tree) -> Result<usize> {
    let reader = tree.txns().begin()?;
    let mut cursor = tree.cursor(reader.snapshot())?;
    let mut n = 0;
    while cursor.next()?.is_some() {
        n += 1;
    }
    Ok(n)
}

#[test]
fn truncating_everything_deletes_pages_unread() -> Result<()> {
    let tree = on_disk(2_000)?;
    let read_before = tree.stats().pages_read;

    let mut txn = tree.txns().begin()?;
    let stats = tree.truncate(&mut txn, Bound::Unbounded, Bound::Unbounded)?;
    assert!(stats.pages_deleted > 1, "{stats:?}");
    assert_eq!(stats.rows_removed, 0);
    assert_eq!(tree.stats().pages_read, read_before, "no page was read");
    assert_eq!(tree.stats().fast_deletes, stats.pages_deleted);
    txn.commit(Timestamp(2))?;

    assert_eq!(count(&tree)?, 0);
    Ok(())
}

#[test]
fn older_snapshots_still_see_deleted_pages() -> Result<()> {
    let tree = on_disk(1_000)?;
    let old_reader = tree.txns().begin()?;

    let mut txn = tree.txns().begin()?;
    tree.truncate(&mut txn, Bound::Unbounded, Bound::Unbounded)?;
    let mut cursor = tree.cursor(txn.snapshot())?;
    assert_eq!(cursor.next()?, None, "the deleting transaction sees nothing");
    drop(cursor);
    txn.commit(Timestamp(2))?;

    let mut cursor = tree.cursor(old_reader.snapshot())?;
    let mut n = 0;
    while cursor.next()?.is_some() {
        n += 1;
    }
    assert_eq!(n, 1_000);
    assert_eq!(tree.get(old_reader.snapshot(), &key(999))?.as_deref(), Some(&b"payload"[..]));
    Ok(())
}

#[test]
fn rollback_brings_pages_back() -> Result<()> {
    let tree = on_disk(1_500)?;
    let mut txn = tree.txns().begin()?;
    let stats = tree.truncate(&mut txn, Bound::Unbounded, Bound::Unbounded)?;
    assert!(stats.pages_deleted > 0);
    txn.rollback()?;
    assert_eq!(count(&tree)?, 1_500);

    // The pages are plain on-disk leaves again and, once the scan's copies
    // leave memory, can be deleted anew.
    tree.evict_pass()?;
    tree.evict_pass()?;
    let mut txn = tree.txns().begin()?;
    let again = tree.truncate(&mut txn, Bound::Unbounded, Bound::Unbounded)?;
    assert_eq!(again.pages_deleted, stats.pages_deleted);
    txn.commit(Timestamp(3))?;
    assert_eq!(count(&tree)?, 0);
    Ok(())
}

#[test]
fn partial_ranges_mix_page_and_row_deletes() -> Result<()> {
    let tree = on_disk(2_000)?;
    let lower = key(150);
    let upper = key(1_850);
    let mut txn = tree.txns().begin()?;
    let stats = tree.truncate(&mut txn, Bound::Included(lower.as_slice()), Bound::Excluded(upper.as_slice()))?;
    assert!(stats.rows_removed > 0, "edge leaves are trimmed row by row");
    txn.commit(Timestamp(2))?;

    let reader = tree.txns().begin()?;
    assert!(tree.get(reader.snapshot(), &key(149))?.is_some());
    assert!(tree.get(reader.snapshot(), &key(150))?.is_none());
    assert!(tree.get(reader.snapshot(), &key(1_849))?.is_none());
    assert!(tree.get(reader.snapshot(), &key(1_850))?.is_some());
    assert_eq!(count(&tree)?, 300);
    Ok(())
}

#[test]
fn writing_into_a_deleted_page_instantiates_it() -> Result<()> {
    let tree = on_disk(1_000)?;
    let mut txn = tree.txns().begin()?;
    tree.truncate(&mut txn, Bound::Unbounded, Bound::Unbounded)?;
    txn.commit(Timestamp(2))?;

    let mut txn = tree.txns().begin()?;
    tree.put(&mut txn, &key(500), b"reborn")?;
    txn.commit(Timestamp(3))?;
    assert!(tree.stats().instantiations >= 1);

    let reader = tree.txns().begin()?;
    assert_eq!(tree.get(reader.snapshot(), &key(500))?.as_deref(), Some(&b"reborn"[..]));
    assert_eq!(tree.get(reader.snapshot(), &key(501))?, None);
    assert_eq!(count(&tree)?, 1);
    Ok(())
}

#[test]
fn checkpoint_frees_settled_deleted_pages() -> Result<()> {
    let env = TreeEnv::in_memory();
    let tree = Tree::create_row(env.clone(), options())?;
    let mut txn = tree.txns().begin()?;
    for i in 0..1_500 {
        tree.put(&mut txn, &key(i), b"payload")?;
    }
    txn.commit(Timestamp(1))?;
    tree.txns().set_oldest_timestamp(Timestamp(1))?;
    tree.checkpoint()?;
    tree.evict_pass()?;
    let live_before = env.block.live_blocks();

    let mut txn = tree.txns().begin()?;
    tree.truncate(&mut txn, Bound::Unbounded, Bound::Unbounded)?;
    txn.commit(Timestamp(2))?;
    tree.txns().set_oldest_timestamp(Timestamp(2))?;
    tree.checkpoint()?;
    tree.checkpoint()?;
    assert!(env.block.live_blocks() < live_before, "deleted leaves were released");
    assert!(tree.stats().pages_swept > 0);
    assert_eq!(count(&tree)?, 0);
    Ok(())
}
