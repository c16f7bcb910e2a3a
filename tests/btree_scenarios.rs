use std::cmp::Ordering;
use std::sync::{Arc, Once};

use rustql_btree::{
    AutoVacuum, BtCursor, Btree, BtreeConfig, BtreeCursorFlags, BtreeInsertFlags,
    BtreeOpenFlags, BtreePayload, ErrorCode, KeyInfo, SavepointOp, SeekBias, SeekResult, UnpackedRecord,
    BTREE_BLOBKEY, BTREE_INTKEY,
};
use tempfile::tempdir;

static INIT: Once = Once::new();

fn init() {
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

fn memory_db(config: BtreeConfig) -> Btree {
    init();
    Btree::open(None, BtreeOpenFlags::MEMORY, config).unwrap()
}

fn collect_rowids(cur: &mut BtCursor) -> Vec<i64> {
    let mut out = Vec::new();
    if cur.first().unwrap() {
        return out;
    }
    while !cur.eof() {
        out.push(cur.integer_key().unwrap());
        cur.next().unwrap();
    }
    out
}

fn collect_keys(cur: &mut BtCursor) -> Vec<Vec<u8>> {
    let mut out = Vec::new();
    if cur.first().unwrap() {
        return out;
    }
    while !cur.eof() {
        out.push(cur.key().unwrap());
        cur.next().unwrap();
    }
    out
}

#[test]
fn test_sequential_inserts_build_balanced_tree() {
    let db = memory_db(BtreeConfig::default().page_size(4096));
    db.begin_trans(true).unwrap();
    let root = db.create_table(BTREE_INTKEY).unwrap();
    let mut cur = db.cursor(root, BtreeCursorFlags::WRCSR, None).unwrap();
    for rowid in 1..=2000i64 {
        let data = vec![(rowid % 251) as u8; 100];
        cur.insert(&BtreePayload::table(rowid, data), BtreeInsertFlags::empty(), None)
            .unwrap();
    }

    assert_eq!(collect_rowids(&mut cur), (1..=2000).collect::<Vec<_>>());
    assert_eq!(cur.table_moveto(1000, SeekBias::None).unwrap(), SeekResult::Exact);
    assert_eq!(cur.data().unwrap(), vec![(1000 % 251) as u8; 100]);
    assert!(cur.cursor_info(1).unwrap() >= 2, "2000 rows need more than one level");

    let report = db.integrity_check(&[root], 100).unwrap();
    assert!(report.is_ok(), "{:?}", report.errors);
    assert_eq!(report.counts, vec![2000]);
    drop(cur);
    db.commit().unwrap();
}

#[test]
fn test_unique_index_rejects_duplicate_key() {
    let db = memory_db(BtreeConfig::default());
    db.begin_trans(true).unwrap();
    let root = db.create_table(BTREE_BLOBKEY).unwrap();
    let key_info = Arc::new(KeyInfo::unique());
    let mut cur = db.cursor(root, BtreeCursorFlags::WRCSR, Some(key_info)).unwrap();

    cur.insert(&BtreePayload::index(b"a".to_vec()), BtreeInsertFlags::empty(), None)
        .unwrap();
    cur.insert(&BtreePayload::index(b"b".to_vec()), BtreeInsertFlags::empty(), None)
        .unwrap();
    let err = cur
        .insert(&BtreePayload::index(b"a".to_vec()), BtreeInsertFlags::empty(), None)
        .unwrap_err();
    assert_eq!(err.code, ErrorCode::Constraint);

    assert_eq!(collect_keys(&mut cur), vec![b"a".to_vec(), b"b".to_vec()]);
}

#[test]
fn test_index_uses_caller_comparator() {
    let db = memory_db(BtreeConfig::default());
    db.begin_trans(true).unwrap();
    let root = db.create_table(BTREE_BLOBKEY).unwrap();
    // Descending byte order
    let key_info = Arc::new(KeyInfo::with_compare(|stored: &[u8], key: &UnpackedRecord<'_>| {
        key.key.cmp(stored)
    }));
    let mut cur = db.cursor(root, BtreeCursorFlags::WRCSR, Some(key_info.clone())).unwrap();
    for word in ["pear", "apple", "quince", "fig"] {
        cur.insert(&BtreePayload::index(word.as_bytes().to_vec()), BtreeInsertFlags::empty(), None)
            .unwrap();
    }
    let keys: Vec<String> = collect_keys(&mut cur)
        .into_iter()
        .map(|k| String::from_utf8(k).unwrap())
        .collect();
    assert_eq!(keys, vec!["quince", "pear", "fig", "apple"]);

    let probe = UnpackedRecord::new(b"fig");
    assert_eq!(cur.index_moveto(&probe, SeekBias::None).unwrap(), SeekResult::Exact);
    assert_eq!(key_info.compare(b"a", &probe), Ordering::Greater);

    let report = db.integrity_check_with(&[(root, Some(key_info))], 10).unwrap();
    assert!(report.is_ok(), "{:?}", report.errors);
}

#[test]
fn test_savepoint_rollback_restores_deleted_rows() {
    let db = memory_db(BtreeConfig::default());
    db.begin_trans(true).unwrap();
    let root = db.create_table(BTREE_INTKEY).unwrap();
    let mut cur = db.cursor(root, BtreeCursorFlags::WRCSR, None).unwrap();
    for rowid in 0..500i64 {
        cur.insert(&BtreePayload::table(rowid, rowid.to_be_bytes().to_vec()), BtreeInsertFlags::empty(), None)
            .unwrap();
    }

    db.savepoint(SavepointOp::Begin, 0).unwrap();
    for rowid in 0..500i64 {
        assert_eq!(cur.table_moveto(rowid, SeekBias::None).unwrap(), SeekResult::Exact);
        cur.delete(BtreeInsertFlags::empty()).unwrap();
    }
    assert!(cur.is_empty().unwrap());

    db.savepoint(SavepointOp::Rollback, 0).unwrap();
    assert_eq!(collect_rowids(&mut cur), (0..500).collect::<Vec<_>>());
    assert_eq!(cur.table_moveto(250, SeekBias::None).unwrap(), SeekResult::Exact);
    assert_eq!(cur.data().unwrap(), 250i64.to_be_bytes().to_vec());

    db.savepoint(SavepointOp::Release, 0).unwrap();
    drop(cur);
    db.commit().unwrap();
}

#[test]
fn test_shared_cache_writer_excludes_second_writer() {
    init();
    let dir = tempdir().unwrap();
    let path = dir.path().join("shared.db");
    let flags = BtreeOpenFlags::SHARED_CACHE;

    let db1 = Btree::open(Some(&path), flags, BtreeConfig::default()).unwrap();
    let db2 = Btree::open(Some(&path), flags, BtreeConfig::default()).unwrap();
    assert!(db1.sharable() && db2.sharable());
    assert_eq!(db1.connection_count(), 2);

    db1.begin_trans(true).unwrap();
    let root = db1.create_table(BTREE_INTKEY).unwrap();
    let mut cur = db1.cursor(root, BtreeCursorFlags::WRCSR, None).unwrap();
    cur.insert(&BtreePayload::table(1, b"one".to_vec()), BtreeInsertFlags::empty(), None)
        .unwrap();

    let err = db2.begin_trans(true).unwrap_err();
    assert!(matches!(err.code, ErrorCode::Locked | ErrorCode::Busy));

    // A reader of the same shared state cannot touch the tree being written.
    db2.begin_trans(false).unwrap();
    let err = db2.cursor(root, BtreeCursorFlags::empty(), None).unwrap_err();
    assert_eq!(err.code, ErrorCode::Locked);
    db2.commit().unwrap();

    drop(cur);
    db1.commit().unwrap();
    db2.begin_trans(true).unwrap();
    db2.rollback().unwrap();
}

#[test]
fn test_full_auto_vacuum_truncates_on_commit() {
    let db = memory_db(BtreeConfig::default().auto_vacuum(AutoVacuum::Full));
    db.begin_trans(true).unwrap();
    let root = db.create_table(BTREE_INTKEY).unwrap();
    db.commit().unwrap();

    db.begin_trans(true).unwrap();
    let minimum = db.last_page().unwrap();
    assert_eq!(minimum, root);
    {
        let mut cur = db.cursor(root, BtreeCursorFlags::WRCSR, None).unwrap();
        for rowid in 0..10_000i64 {
            cur.insert(&BtreePayload::table(rowid, vec![0x5a; 50]), BtreeInsertFlags::APPEND, None)
                .unwrap();
        }
    }
    assert!(db.last_page().unwrap() > 100);
    db.commit().unwrap();

    db.begin_trans(true).unwrap();
    {
        let mut cur = db.cursor(root, BtreeCursorFlags::WRCSR, None).unwrap();
        assert!(!cur.first().unwrap());
        while !cur.eof() {
            cur.delete(BtreeInsertFlags::SAVEPOSITION).unwrap();
            cur.next().unwrap();
        }
        assert!(cur.is_empty().unwrap());
    }
    db.commit().unwrap();

    db.begin_trans(false).unwrap();
    assert_eq!(db.last_page().unwrap(), minimum);
    let report = db.integrity_check(&[root], 10).unwrap();
    assert!(report.is_ok(), "{:?}", report.errors);
    db.commit().unwrap();
}

#[test]
fn test_incremental_vacuum_releases_pages_in_steps() {
    let db = memory_db(BtreeConfig::default().auto_vacuum(AutoVacuum::Incremental));
    db.begin_trans(true).unwrap();
    let root = db.create_table(BTREE_INTKEY).unwrap();
    {
        let mut cur = db.cursor(root, BtreeCursorFlags::WRCSR, None).unwrap();
        for rowid in 0..1000i64 {
            cur.insert(&BtreePayload::table(rowid, vec![1; 200]), BtreeInsertFlags::APPEND, None)
                .unwrap();
        }
    }
    db.commit().unwrap();

    db.begin_trans(true).unwrap();
    assert_eq!(db.clear_table(root).unwrap(), 1000);
    db.commit().unwrap();

    db.begin_trans(true).unwrap();
    let before = db.last_page().unwrap();
    assert!(db.incr_vacuum(5).unwrap());
    assert_eq!(db.last_page().unwrap(), before - 5);
    while db.incr_vacuum(100).unwrap() {}
    assert_eq!(db.last_page().unwrap(), root);
    db.commit().unwrap();
}
