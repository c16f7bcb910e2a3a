use std::path::Path;

use rustql_btree::{
    Btree, BtreeConfig, BtreeCursorFlags, BtreeInsertFlags, BtreeOpenFlags, BtreePayload, ErrorCode,
    SeekBias, SeekResult, TransState, BTREE_INTKEY,
};
use tempfile::tempdir;

fn open(path: &Path) -> Btree {
    Btree::open(Some(path), BtreeOpenFlags::empty(), BtreeConfig::default()).unwrap()
}

fn insert_rows(db: &Btree, root: u32, rows: impl IntoIterator<Item = i64>) {
    let mut cur = db.cursor(root, BtreeCursorFlags::WRCSR, None).unwrap();
    for rowid in rows {
        cur.insert(&BtreePayload::table(rowid, format!("row {}", rowid).into_bytes()), BtreeInsertFlags::empty(), None)
            .unwrap();
    }
}

fn count_rows(db: &Btree, root: u32) -> i64 {
    let mut cur = db.cursor(root, BtreeCursorFlags::empty(), None).unwrap();
    cur.count().unwrap()
}

#[test]
fn test_committed_data_survives_reopen() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("persist.db");

    let root = {
        let db = open(&path);
        db.begin_trans(true).unwrap();
        let root = db.create_table(BTREE_INTKEY).unwrap();
        insert_rows(&db, root, 0..300);
        db.update_meta(1, root).unwrap();
        db.commit().unwrap();
        db.close().unwrap();
        root
    };

    let db = open(&path);
    db.begin_trans(false).unwrap();
    assert_eq!(db.get_meta(1).unwrap(), root);
    assert_eq!(count_rows(&db, root), 300);
    let mut cur = db.cursor(root, BtreeCursorFlags::empty(), None).unwrap();
    assert_eq!(cur.table_moveto(123, SeekBias::None).unwrap(), SeekResult::Exact);
    assert_eq!(cur.data().unwrap(), b"row 123".to_vec());
    let report = db.integrity_check(&[root], 10).unwrap();
    assert!(report.is_ok(), "{:?}", report.errors);
}

#[test]
fn test_rollback_restores_committed_state() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("rollback.db");
    let db = open(&path);

    db.begin_trans(true).unwrap();
    let root = db.create_table(BTREE_INTKEY).unwrap();
    insert_rows(&db, root, 0..100);
    db.commit().unwrap();

    db.begin_trans(true).unwrap();
    insert_rows(&db, root, 100..1000);
    db.update_meta(6, 42).unwrap();
    assert_eq!(count_rows(&db, root), 1000);
    db.rollback().unwrap();
    assert_eq!(db.txn_state(), TransState::None);

    db.begin_trans(false).unwrap();
    assert_eq!(count_rows(&db, root), 100);
    assert_eq!(db.get_meta(6).unwrap(), 0);
    db.commit().unwrap();
}

#[test]
fn test_uncommitted_changes_vanish_when_connection_drops() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("dropped.db");
    let root = {
        let db = open(&path);
        db.begin_trans(true).unwrap();
        let root = db.create_table(BTREE_INTKEY).unwrap();
        insert_rows(&db, root, 0..10);
        db.commit().unwrap();

        db.begin_trans(true).unwrap();
        insert_rows(&db, root, 10..20);
        root
    };

    let db = open(&path);
    db.begin_trans(false).unwrap();
    assert_eq!(count_rows(&db, root), 10);
}

#[test]
fn test_readers_keep_their_snapshot() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("snapshot.db");
    let writer = open(&path);
    let reader = open(&path);
    assert!(!writer.sharable());

    writer.begin_trans(true).unwrap();
    let root = writer.create_table(BTREE_INTKEY).unwrap();
    insert_rows(&writer, root, 0..50);
    writer.commit().unwrap();

    reader.begin_trans(false).unwrap();
    assert_eq!(count_rows(&reader, root), 50);
    let version = reader.data_version();

    writer.begin_trans(true).unwrap();
    insert_rows(&writer, root, 50..80);
    writer.commit().unwrap();

    assert_eq!(count_rows(&reader, root), 50);
    reader.commit().unwrap();

    reader.begin_trans(false).unwrap();
    assert_eq!(count_rows(&reader, root), 80);
    assert_ne!(reader.data_version(), version);
    reader.commit().unwrap();
}

#[test]
fn test_second_writer_is_busy() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("busy.db");
    let a = open(&path);
    let b = open(&path);

    a.begin_trans(true).unwrap();
    let root = a.create_table(BTREE_INTKEY).unwrap();
    let err = b.begin_trans(true).unwrap_err();
    assert_eq!(err.code, ErrorCode::Busy);
    assert_eq!(b.txn_state(), TransState::None);
    a.commit().unwrap();

    b.begin_trans(true).unwrap();
    insert_rows(&b, root, 0..5);
    b.commit().unwrap();
}

#[test]
fn test_stale_reader_cannot_upgrade() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("stale.db");
    let a = open(&path);
    let b = open(&path);

    a.begin_trans(true).unwrap();
    let root = a.create_table(BTREE_INTKEY).unwrap();
    a.commit().unwrap();

    b.begin_trans(false).unwrap();
    a.begin_trans(true).unwrap();
    insert_rows(&a, root, 0..3);
    a.commit().unwrap();

    assert_eq!(b.begin_trans(true).unwrap_err().code, ErrorCode::Busy);
    b.rollback().unwrap();
    b.begin_trans(true).unwrap();
    assert_eq!(count_rows(&b, root), 3);
    b.commit().unwrap();
}

#[test]
fn test_read_only_connection_rejects_writes() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("ro.db");
    {
        let db = open(&path);
        db.begin_trans(true).unwrap();
        db.create_table(BTREE_INTKEY).unwrap();
        db.commit().unwrap();
    }
    let db = Btree::open(Some(&path), BtreeOpenFlags::READ_ONLY, BtreeConfig::default()).unwrap();
    assert!(db.is_readonly());
    assert_eq!(db.begin_trans(true).unwrap_err().code, ErrorCode::ReadOnly);
    db.begin_trans(false).unwrap();
    assert_eq!(count_rows(&db, 2), 0);
}
