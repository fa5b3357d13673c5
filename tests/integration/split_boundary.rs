#![allow(missing_docs)]

use sombra_engine::types::{Result, SombraError, Timestamp};
use sombra_engine::{Tree, TreeEnv, TreeKind, TreeOptions};

fn tight() -> TreeOptions {
    TreeOptions::default()
        .leaf_page_max(1024)
        .internal_page_max(512)
        .max_inline_value(200)
}

fn check_all(tree: &Tree, keys: &[Vec<u8>]) -> Result<()> {
    let reader = tree.txns().begin()?;
    for k in keys {
        assert_eq!(tree.get(reader.snapshot(), k)?.as_deref(), Some(k.as_slice()), "key {:?}", String::from_utf8_lossy(k));
    }
    let mut cursor = tree.cursor(reader.snapshot())?;
    let mut seen = 0;
    let mut last: Option<Vec<u8>> = None;
    while let Some((k, _)) = cursor.next()? {
        if let Some(prev) = &last {
            assert!(prev.as_slice() < k.as_ref());
        }
        last = Some(k.to_vec());
        seen += 1;
    }
    assert_eq!(seen, keys.len());
    Ok(())
}

fn load(tree: &Tree, keys: &[Vec<u8>]) -> Result<()> {
    let mut txn = tree.txns().begin()?;
    for k in keys {
        tree.put(&mut txn, k, k)?;
    }
    txn.commit(Timestamp(1))?;
    tree.txns().set_oldest_timestamp(Timestamp(1))
}

#[test]
fn shared_prefix_keys_split_cleanly() -> Result<()> {
    let env = TreeEnv::in_memory();
    let tree = Tree::create_row(env.clone(), tight())?;
    let keys: Vec<Vec<u8>> = (0..1_200u32)
        .map(|i| format!("tenant/0001/orders/{i:08}").into_bytes())
        .collect();
    load(&tree, &keys)?;
    tree.evict_pass()?;
    assert!(tree.stats().splits >= 1);
    check_all(&tree, &keys)?;

    let root = tree.checkpoint()?;
    let reopened = Tree::open(env, TreeKind::Row, tight(), root)?;
    check_all(&reopened, &keys)?;
    Ok(())
}

#[test]
fn keys_that_differ_in_the_last_byte_stay_apart() -> Result<()> {
    let tree = Tree::create_row(TreeEnv::in_memory(), tight())?;
    let mut keys = Vec::new();
    for i in 0..600u32 {
        let mut k = vec![b'x'; 40];
        k.extend_from_slice(&i.to_be_bytes());
        keys.push(k);
    }
    load(&tree, &keys)?;
    tree.evict_pass()?;
    check_all(&tree, &keys)?;

    // Inserts landing exactly between existing keys go to the right leaf.
    let mut txn = tree.txns().begin()?;
    let mut between = Vec::new();
    for i in (0..600u32).step_by(50) {
        let mut k = vec![b'x'; 40];
        k.extend_from_slice(&i.to_be_bytes());
        k.push(0);
        tree.put(&mut txn, &k, &k)?;
        between.push(k);
    }
    txn.commit(Timestamp(2))?;
    keys.extend(between);
    keys.sort();
    check_all(&tree, &keys)?;
    Ok(())
}

#[test]
fn prefix_compression_does_not_change_contents() -> Result<()> {
    let keys: Vec<Vec<u8>> = (0..900u32).map(|i| format!("/var/log/app/{i:06}.log").into_bytes()).collect();
    for enabled in [true, false] {
        let env = TreeEnv::in_memory();
        let tree = Tree::create_row(env.clone(), tight().prefix_compression(enabled))?;
        load(&tree, &keys)?;
        let root = tree.checkpoint()?;
        tree.evict_pass()?;
        check_all(&tree, &keys)?;
        let reopened = Tree::open(env, TreeKind::Row, tight().prefix_compression(enabled), root)?;
        check_all(&reopened, &keys)?;
    }
    Ok(())
}

#[test]
fn values_at_the_inline_limit() -> Result<()> {
    let tree = Tree::create_row(TreeEnv::in_memory(), tight())?;
    let at_limit = vec![1u8; 200];
    let over_limit = vec![2u8; 201];
    let mut txn = tree.txns().begin()?;
    tree.put(&mut txn, b"at", &at_limit)?;
    tree.put(&mut txn, b"over", &over_limit)?;
    txn.commit(Timestamp(1))?;
    tree.checkpoint()?;
    assert_eq!(tree.stats().overflow_written, 1);
    tree.evict_pass()?;
    let reader = tree.txns().begin()?;
    assert_eq!(tree.get(reader.snapshot(), b"at")?.as_deref(), Some(at_limit.as_slice()));
    assert_eq!(tree.get(reader.snapshot(), b"over")?.as_deref(), Some(over_limit.as_slice()));
    Ok(())
}

#[test]
fn oversized_keys_are_refused() -> Result<()> {
    let tree = Tree::create_row(TreeEnv::in_memory(), tight())?;
    let limit = tree.options().max_key_size();
    assert_eq!(limit, 128);
    let longest = vec![b'k'; limit];
    let too_long = vec![b'k'; limit + 1];

    let mut txn = tree.txns().begin()?;
    tree.put(&mut txn, &longest, b"fits")?;
    assert!(matches!(tree.put(&mut txn, &too_long, b"no"), Err(SombraError::Invalid(_))));
    txn.commit(Timestamp(1))?;

    let reader = tree.txns().begin()?;
    assert_eq!(tree.get(reader.snapshot(), &longest)?.as_deref(), Some(&b"fits"[..]));
    assert_eq!(tree.get(reader.snapshot(), &too_long)?, None);

    let bulk = Tree::create_row(TreeEnv::in_memory(), tight())?;
    let mut loader = bulk.bulk_loader()?;
    assert!(matches!(loader.insert(&too_long, b"no"), Err(SombraError::Invalid(_))));
    loader.insert(&longest, b"fits")?;
    loader.finish()?;
    Ok(())
}

#[test]
fn split_options_are_validated() {
    let bad = [
        TreeOptions::default().leaf_page_max(256),
        TreeOptions::default().split_pct(40),
        TreeOptions::default().min_split_pct(95),
        TreeOptions::default().max_inline_value(8),
        TreeOptions::default().leaf_page_max(1024).max_inline_value(600),
    ];
    for opts in bad {
        assert!(matches!(opts.validate(), Err(SombraError::Invalid(_))), "{opts:?} accepted");
        assert!(Tree::create_row(TreeEnv::in_memory(), opts).is_err());
    }
}

#[test]
fn options_round_trip_through_toml() -> Result<()> {
    let opts = tight().split_pct(80).min_split_pct(40).lookaside(true);
    let text = opts.to_toml_string()?;
    let parsed = TreeOptions::from_toml_str(&text)?;
    assert_eq!(parsed.leaf_page_max, 1024);
    assert_eq!(parsed.split_pct, 80);
    assert!(parsed.lookaside);
    assert!(matches!(
        TreeOptions::from_toml_str("leaf_page_max = 100"),
        Err(SombraError::Invalid(_) | SombraError::Config(_))
    ));
    Ok(())
}
