use std::sync::{Arc, Barrier, Mutex};
use std::thread;

use rustql_btree::{
    Btree, BtreeConfig, BtreeCursorFlags, BtreeInsertFlags, BtreeOpenFlags, BtreePayload, ErrorCode,
    TransState, BTREE_INTKEY, SCHEMA_ROOT,
};
use tempfile::tempdir;

fn open_shared(path: &std::path::Path) -> Btree {
    Btree::open(Some(path), BtreeOpenFlags::empty(), BtreeConfig::default().shared_cache(true)).unwrap()
}

#[test]
fn test_shared_cache_connections_see_each_others_commits() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("shared.db");
    let db1 = open_shared(&path);
    let db2 = open_shared(&path);
    assert_eq!(db2.connection_count(), 2);

    db1.begin_trans(true).unwrap();
    let root = db1.create_table(BTREE_INTKEY).unwrap();
    {
        let mut cur = db1.cursor(root, BtreeCursorFlags::WRCSR, None).unwrap();
        cur.insert(&BtreePayload::table(7, b"seven".to_vec()), BtreeInsertFlags::empty(), None)
            .unwrap();
    }
    db1.commit().unwrap();

    db2.begin_trans(false).unwrap();
    let mut cur = db2.cursor(root, BtreeCursorFlags::empty(), None).unwrap();
    assert!(!cur.first().unwrap());
    assert_eq!(cur.integer_key().unwrap(), 7);
    assert_eq!(cur.data().unwrap(), b"seven".to_vec());
}

#[test]
fn test_shared_cache_readers_share_tables() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("readers.db");
    let db1 = open_shared(&path);
    let db2 = open_shared(&path);

    db1.begin_trans(true).unwrap();
    let root = db1.create_table(BTREE_INTKEY).unwrap();
    db1.commit().unwrap();

    db1.begin_trans(false).unwrap();
    db2.begin_trans(false).unwrap();
    let _c1 = db1.cursor(root, BtreeCursorFlags::empty(), None).unwrap();
    let _c2 = db2.cursor(root, BtreeCursorFlags::empty(), None).unwrap();
    assert!(db1.table_lock_available(root, false).unwrap());
    assert!(!db1.table_lock_available(root, true).unwrap());
}

#[test]
fn test_shared_cache_write_lock_blocks_readers_of_that_table_only() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("locks.db");
    let db1 = open_shared(&path);
    let db2 = open_shared(&path);

    db1.begin_trans(true).unwrap();
    let busy = db1.create_table(BTREE_INTKEY).unwrap();
    let quiet = db1.create_table(BTREE_INTKEY).unwrap();
    db1.commit().unwrap();

    db1.begin_trans(true).unwrap();
    db1.lock_table(busy, true).unwrap();
    db2.begin_trans(false).unwrap();

    let err = db2.lock_table(busy, false).unwrap_err();
    assert_eq!(err.code, ErrorCode::Locked);
    db2.lock_table(quiet, false).unwrap();
    let _reader = db2.cursor(quiet, BtreeCursorFlags::empty(), None).unwrap();

    db1.commit().unwrap();
    db2.lock_table(busy, false).unwrap();
    assert_eq!(db2.txn_state(), TransState::Read);
}

#[test]
fn test_closing_last_connection_releases_shared_state() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("release.db");
    let db1 = open_shared(&path);
    let db2 = open_shared(&path);
    assert_eq!(db1.connection_count(), 2);
    db2.close().unwrap();
    assert_eq!(db1.connection_count(), 1);
    db1.close().unwrap();

    let db3 = open_shared(&path);
    assert_eq!(db3.connection_count(), 1);
}

#[test]
fn test_schema_lock_and_object_follow_the_shared_state() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("schema.db");
    let db1 = open_shared(&path);
    let db2 = open_shared(&path);

    let names = db1.schema(|| Mutex::new(vec!["sqlite_schema".to_string()])).unwrap();
    let seen = db2.schema(|| Mutex::new(Vec::<String>::new())).unwrap();
    assert!(Arc::ptr_eq(&names, &seen));
    assert_eq!(seen.lock().unwrap().len(), 1);

    assert!(!db2.schema_locked().unwrap());
    db1.begin_trans(true).unwrap();
    db1.lock_table(SCHEMA_ROOT, true).unwrap();
    assert!(db2.schema_locked().unwrap());
    assert!(!db1.schema_locked().unwrap());
    db1.commit().unwrap();
    assert!(!db2.schema_locked().unwrap());
}

#[test]
fn test_threads_contend_for_shared_cache_write() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("threads.db");
    let writer = open_shared(&path);
    let other = open_shared(&path);
    let started = Arc::new(Barrier::new(2));
    let checked = Arc::new(Barrier::new(2));
    let committed = Arc::new(Barrier::new(2));

    let a = {
        let (started, checked, committed) = (started.clone(), checked.clone(), committed.clone());
        thread::spawn(move || {
            writer.begin_trans(true).unwrap();
            writer.lock_table(SCHEMA_ROOT, true).unwrap();
            let root = writer.create_table(BTREE_INTKEY).unwrap();
            started.wait();
            checked.wait();
            writer.commit().unwrap();
            committed.wait();
            root
        })
    };
    let b = thread::spawn(move || {
        started.wait();
        let err = other.begin_trans(true).unwrap_err();
        assert_eq!(err.code, ErrorCode::Locked);
        assert!(other.schema_locked().unwrap());
        let err = other.begin_trans(false).unwrap_err();
        assert_eq!(err.code, ErrorCode::Locked);
        assert_eq!(other.txn_state(), TransState::None);
        checked.wait();
        committed.wait();
        other.begin_trans(true).unwrap();
        other
    });

    let root = a.join().unwrap();
    let other = b.join().unwrap();
    let mut cur = other.cursor(root, BtreeCursorFlags::WRCSR, None).unwrap();
    cur.insert(&BtreePayload::table(1, b"late".to_vec()), BtreeInsertFlags::empty(), None)
        .unwrap();
    drop(cur);
    other.commit().unwrap();
}

#[test]
fn test_threads_contend_for_private_caches_on_one_file() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("private.db");
    let setup = Btree::open(Some(&path), BtreeOpenFlags::empty(), BtreeConfig::default()).unwrap();
    setup.begin_trans(true).unwrap();
    let root = setup.create_table(BTREE_INTKEY).unwrap();
    setup.commit().unwrap();
    drop(setup);

    let writer = Btree::open(Some(&path), BtreeOpenFlags::empty(), BtreeConfig::default()).unwrap();
    let other = Btree::open(Some(&path), BtreeOpenFlags::empty(), BtreeConfig::default()).unwrap();
    assert!(!writer.sharable());
    let started = Arc::new(Barrier::new(2));
    let checked = Arc::new(Barrier::new(2));
    let committed = Arc::new(Barrier::new(2));

    let a = {
        let (started, checked, committed) = (started.clone(), checked.clone(), committed.clone());
        thread::spawn(move || {
            writer.begin_trans(true).unwrap();
            {
                let mut cur = writer.cursor(root, BtreeCursorFlags::WRCSR, None).unwrap();
                cur.insert(&BtreePayload::table(1, b"first".to_vec()), BtreeInsertFlags::empty(), None)
                    .unwrap();
            }
            started.wait();
            checked.wait();
            writer.commit().unwrap();
            committed.wait();
        })
    };
    let b = thread::spawn(move || {
        started.wait();
        assert_eq!(other.begin_trans(true).unwrap_err().code, ErrorCode::Busy);
        other.begin_trans(false).unwrap();
        {
            let mut cur = other.cursor(root, BtreeCursorFlags::empty(), None).unwrap();
            assert!(cur.first().unwrap(), "uncommitted row must stay invisible");
        }
        checked.wait();
        committed.wait();
        // The snapshot predates the commit, so it cannot be upgraded.
        assert_eq!(other.begin_trans(true).unwrap_err().code, ErrorCode::Busy);
        other.commit().unwrap();
        other.begin_trans(true).unwrap();
        let mut cur = other.cursor(root, BtreeCursorFlags::WRCSR, None).unwrap();
        assert!(!cur.first().unwrap());
        assert_eq!(cur.data().unwrap(), b"first".to_vec());
        cur.insert(&BtreePayload::table(2, b"second".to_vec()), BtreeInsertFlags::empty(), None)
            .unwrap();
        drop(cur);
        other.commit().unwrap();
    });

    a.join().unwrap();
    b.join().unwrap();
}
