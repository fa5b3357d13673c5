#![allow(missing_docs)]

use std::sync::Arc;

use bytes::Bytes;
use sombra_engine::primitives::block::{BlockManager, FileBlockManager, MemBlockManager};
use sombra_engine::storage::btree::ModifyEntry;
use sombra_engine::txn::TxnManager;
use sombra_engine::types::{Result, SombraError, Timestamp};
use sombra_engine::{Tree, TreeEnv, TreeKind, TreeOptions};
use tempfile::tempdir;

fn options() -> TreeOptions {
    TreeOptions::default()
        .leaf_page_max(2048)
        .internal_page_max(1024)
        .max_inline_value(256)
}

#[test]
fn checkpoint_survives_reopen_from_file() -> Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("tree.blocks");
    let txns = TxnManager::new();
    let root = {
        let block: Arc<dyn BlockManager> = Arc::new(FileBlockManager::open(&path, 512)?);
        let tree = Tree::create_row(TreeEnv::new(block, Arc::clone(&txns)), options())?;
        let mut txn = tree.txns().begin()?;
        for i in 0..1_000u32 {
            tree.put(&mut txn, format!("user:{i:05}").as_bytes(), format!("payload-{i}").as_bytes())?;
        }
        txn.commit(Timestamp(10))?;
        tree.close()?
    };

    let block: Arc<dyn BlockManager> = Arc::new(FileBlockManager::open(&path, 512)?);
    let tree = Tree::open(TreeEnv::new(block, txns), TreeKind::Row, options(), root)?;
    let reader = tree.txns().begin()?;
    for i in (0..1_000u32).step_by(37) {
        let expected = format!("payload-{i}");
        assert_eq!(
            tree.get(reader.snapshot(), format!("user:{i:05}").as_bytes())?.as_deref(),
            Some(expected.as_bytes())
        );
    }
    Ok(())
}

#[test]
fn uncommitted_updates_stay_out_of_the_checkpoint() -> Result<()> {
    let env = TreeEnv::in_memory();
    let tree = Tree::create_row(env.clone(), options())?;
    let mut committed = tree.txns().begin()?;
    tree.put(&mut committed, b"kept", b"yes")?;
    committed.commit(Timestamp(5))?;

    let mut running = tree.txns().begin()?;
    tree.put(&mut running, b"pending", b"maybe")?;
    tree.put(&mut running, b"kept", b"overwritten")?;
    let root = tree.checkpoint()?;

    let reopened = Tree::open(env.clone(), TreeKind::Row, options(), root)?;
    let reader = reopened.txns().begin()?;
    assert_eq!(reopened.get(reader.snapshot(), b"kept")?.as_deref(), Some(&b"yes"[..]));
    assert_eq!(reopened.get(reader.snapshot(), b"pending")?, None);

    // The original tree still holds the running transaction's updates.
    assert_eq!(tree.get(running.snapshot(), b"pending")?.as_deref(), Some(&b"maybe"[..]));
    running.rollback()?;
    Ok(())
}

#[test]
fn large_values_go_to_overflow_blocks() -> Result<()> {
    let env = TreeEnv::in_memory();
    let tree = Tree::create_row(env.clone(), options())?;
    let big = vec![0xABu8; 4_000];
    let mut txn = tree.txns().begin()?;
    tree.put(&mut txn, b"big", &big)?;
    tree.put(&mut txn, b"small", b"s")?;
    txn.commit(Timestamp(2))?;
    let root = tree.checkpoint()?;
    assert!(tree.stats().overflow_written >= 1);

    let reopened = Tree::open(env.clone(), TreeKind::Row, options(), root)?;
    let reader = reopened.txns().begin()?;
    assert_eq!(reopened.get(reader.snapshot(), b"big")?.as_deref(), Some(big.as_slice()));
    Ok(())
}

#[test]
fn modify_updates_are_folded_into_the_image() -> Result<()> {
    let env = TreeEnv::in_memory();
    let tree = Tree::create_row(env.clone(), options())?;
    let mut txn = tree.txns().begin()?;
    tree.put(&mut txn, b"doc", b"hello world")?;
    txn.commit(Timestamp(1))?;

    let mut txn = tree.txns().begin()?;
    tree.modify(&mut txn, b"doc", vec![ModifyEntry {
        offset: 6,
        size: 5,
        data: Bytes::from_static(b"rusty"),
    }])?;
    txn.commit(Timestamp(2))?;
    let root = tree.checkpoint()?;

    let reopened = Tree::open(env.clone(), TreeKind::Row, options(), root)?;
    let reader = reopened.txns().begin()?;
    assert_eq!(reopened.get(reader.snapshot(), b"doc")?.as_deref(), Some(&b"hello rusty"[..]));
    Ok(())
}

#[test]
fn corrupted_image_is_detected() -> Result<()> {
    let block = Arc::new(MemBlockManager::default());
    let env = TreeEnv::new(block.clone(), TxnManager::new());
    let tree = Tree::create_row(env, options())?;
    let mut txn = tree.txns().begin()?;
    tree.put(&mut txn, b"a", b"1")?;
    txn.commit(Timestamp(1))?;
    let root = tree.checkpoint()?;
    assert!(block.corrupt(&root, 0));

    let env = TreeEnv::new(block, TxnManager::new());
    let err = Tree::open(env, TreeKind::Row, options(), root).unwrap_err();
    assert!(matches!(err, SombraError::Corruption(_)), "unexpected error {err:?}");
    Ok(())
}
