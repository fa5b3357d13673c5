#![allow(missing_docs)]

use sombra_engine::types::{Result, SombraError, Timestamp};
use sombra_engine::{Tree, TreeEnv, TreeOptions};

fn tree() -> Result<Tree> {
    Tree::create_row(
        TreeEnv::in_memory(),
        TreeOptions::default().leaf_page_max(2048).max_inline_value(256),
    )
}

#[test]
fn readers_keep_their_snapshot() -> Result<()> {
    let tree = tree()?;
    let mut w1 = tree.txns().begin()?;
    tree.put(&mut w1, b"k", b"v1")?;
    w1.commit(Timestamp(10))?;

    let early = tree.txns().begin()?;
    let mut w2 = tree.txns().begin()?;
    tree.put(&mut w2, b"k", b"v2")?;
    assert_eq!(tree.get(early.snapshot(), b"k")?.as_deref(), Some(&b"v1"[..]));
    w2.commit(Timestamp(20))?;

    assert_eq!(tree.get(early.snapshot(), b"k")?.as_deref(), Some(&b"v1"[..]));
    let late = tree.txns().begin()?;
    assert_eq!(tree.get(late.snapshot(), b"k")?.as_deref(), Some(&b"v2"[..]));
    Ok(())
}

#[test]
fn snapshots_survive_eviction_and_checkpoint() -> Result<()> {
    let tree = tree()?;
    let mut w1 = tree.txns().begin()?;
    for i in 0..300u32 {
        tree.put(&mut w1, format!("k{i:04}").as_bytes(), b"old")?;
    }
    w1.commit(Timestamp(5))?;
    let early = tree.txns().begin()?;

    let mut w2 = tree.txns().begin()?;
    for i in 0..300u32 {
        tree.put(&mut w2, format!("k{i:04}").as_bytes(), b"new")?;
    }
    w2.commit(Timestamp(6))?;
    tree.checkpoint()?;
    tree.evict_pass()?;

    for i in (0..300u32).step_by(29) {
        let k = format!("k{i:04}");
        assert_eq!(tree.get(early.snapshot(), k.as_bytes())?.as_deref(), Some(&b"old"[..]));
    }
    let late = tree.txns().begin()?;
    assert_eq!(tree.get(late.snapshot(), b"k0150")?.as_deref(), Some(&b"new"[..]));
    Ok(())
}

#[test]
fn read_timestamps_select_history() -> Result<()> {
    let tree = tree()?;
    for (ts, value) in [(10u64, "ten"), (20, "twenty"), (30, "thirty")] {
        let mut txn = tree.txns().begin()?;
        tree.put(&mut txn, b"clock", value.as_bytes())?;
        txn.commit(Timestamp(ts))?;
    }
    let at = |ts: u64| -> Result<Option<Vec<u8>>> {
        let reader = tree.txns().begin_at(Timestamp(ts))?;
        Ok(tree.get(reader.snapshot(), b"clock")?.map(|v| v.to_vec()))
    };
    assert_eq!(at(5)?, None);
    assert_eq!(at(10)?, Some(b"ten".to_vec()));
    assert_eq!(at(25)?, Some(b"twenty".to_vec()));
    assert_eq!(at(99)?, Some(b"thirty".to_vec()));
    Ok(())
}

#[test]
fn timestamped_reader_survives_checkpoint_and_eviction() -> Result<()> {
    let tree = tree()?;
    for (ts, value) in [(10u64, "ten"), (30, "thirty")] {
        let mut txn = tree.txns().begin()?;
        tree.put(&mut txn, b"clock", value.as_bytes())?;
        txn.commit(Timestamp(ts))?;
    }
    let reader = tree.txns().begin_at(Timestamp(20))?;
    tree.checkpoint()?;
    tree.evict_pass()?;
    assert_eq!(tree.get(reader.snapshot(), b"clock")?.as_deref(), Some(&b"ten"[..]));

    // The reader holds history back even once an oldest timestamp is set.
    tree.txns().set_oldest_timestamp(Timestamp(15))?;
    tree.checkpoint()?;
    tree.evict_pass()?;
    assert_eq!(tree.get(reader.snapshot(), b"clock")?.as_deref(), Some(&b"ten"[..]));
    let latest = tree.txns().begin_at(Timestamp(40))?;
    assert_eq!(tree.get(latest.snapshot(), b"clock")?.as_deref(), Some(&b"thirty"[..]));
    Ok(())
}

#[test]
fn parked_history_serves_timestamped_readers() -> Result<()> {
    let tree = Tree::create_row(
        TreeEnv::in_memory(),
        TreeOptions::default()
            .leaf_page_max(2048)
            .max_inline_value(256)
            .update_restore(false)
            .lookaside(true),
    )?;
    for (ts, value) in [(10u64, "ten"), (30, "thirty")] {
        let mut txn = tree.txns().begin()?;
        tree.put(&mut txn, b"clock", value.as_bytes())?;
        txn.commit(Timestamp(ts))?;
    }
    let reader = tree.txns().begin_at(Timestamp(20))?;
    tree.checkpoint()?;
    tree.evict_pass()?;
    assert_eq!(tree.get(reader.snapshot(), b"clock")?.as_deref(), Some(&b"ten"[..]));
    assert!(tree.stats().lookaside_restored > 0);
    Ok(())
}

#[test]
fn oldest_timestamp_bounds_readers_and_commits() -> Result<()> {
    let tree = tree()?;
    let txns = tree.txns();
    txns.set_oldest_timestamp(Timestamp(10))?;
    assert!(matches!(txns.begin_at(Timestamp(9)), Err(SombraError::Invalid(_))));

    let reader = txns.begin_at(Timestamp(12))?;
    assert!(matches!(txns.set_oldest_timestamp(Timestamp(13)), Err(SombraError::Invalid(_))));
    txns.set_oldest_timestamp(Timestamp(12))?;

    let mut late = txns.begin()?;
    tree.put(&mut late, b"k", b"v")?;
    assert!(matches!(late.commit(Timestamp(11)), Err(SombraError::Invalid(_))));

    reader.rollback()?;
    txns.set_oldest_timestamp(Timestamp(50))?;
    assert_eq!(txns.stats().pinned_timestamp, Timestamp(50));
    Ok(())
}

#[test]
fn concurrent_writers_conflict() -> Result<()> {
    let tree = tree()?;
    let mut setup = tree.txns().begin()?;
    tree.put(&mut setup, b"hot", b"0")?;
    setup.commit(Timestamp(1))?;

    let mut a = tree.txns().begin()?;
    let mut b = tree.txns().begin()?;
    tree.put(&mut a, b"hot", b"a")?;
    assert!(matches!(tree.put(&mut b, b"hot", b"b"), Err(SombraError::WriteConflict)));
    a.commit(Timestamp(2))?;
    // b began before a committed, so a stays invisible to it.
    assert!(matches!(tree.put(&mut b, b"hot", b"b"), Err(SombraError::WriteConflict)));
    b.rollback()?;
    Ok(())
}

#[test]
fn rollback_hides_every_update() -> Result<()> {
    let tree = tree()?;
    let mut txn = tree.txns().begin()?;
    for i in 0..50u32 {
        tree.put(&mut txn, &i.to_be_bytes(), b"gone")?;
    }
    txn.rollback()?;
    tree.evict_pass()?;
    let reader = tree.txns().begin()?;
    let mut cursor = tree.cursor(reader.snapshot())?;
    assert_eq!(cursor.next()?, None);
    Ok(())
}

#[test]
fn prepared_updates_block_readers() -> Result<()> {
    let tree = tree()?;
    let mut txn = tree.txns().begin()?;
    tree.put(&mut txn, b"p", b"prepared")?;
    txn.prepare(Timestamp(50))?;
    assert!(matches!(tree.put(&mut txn, b"q", b"late"), Err(SombraError::Invalid(_))));

    let reader = tree.txns().begin_at(Timestamp(60))?;
    assert!(matches!(tree.get(reader.snapshot(), b"p"), Err(SombraError::PrepareConflict)));
    let before = tree.txns().begin_at(Timestamp(40))?;
    assert_eq!(tree.get(before.snapshot(), b"p")?, None);

    txn.commit(Timestamp(55))?;
    let after = tree.txns().begin_at(Timestamp(60))?;
    assert_eq!(tree.get(after.snapshot(), b"p")?.as_deref(), Some(&b"prepared"[..]));
    Ok(())
}

#[test]
fn close_refuses_running_updates() -> Result<()> {
    let tree = tree()?;
    let mut running = tree.txns().begin()?;
    tree.put(&mut running, b"open", b"1")?;
    assert!(tree.close().is_err());
    Ok(())
}
