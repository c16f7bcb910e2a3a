//! Table-level locks between connections sharing one cache.
//!
//! Locks are only recorded for sharable state and only checked while more
//! than one connection is attached. A connection's locks last until its
//! transaction ends.

use tracing::debug;

use crate::error::{Error, ErrorCode, Result};
use crate::types::{BtreeId, Pgno};

use super::types::{BtLock, BtTableLockEntry, TransState, SCHEMA_ROOT};
use super::{BtShared, Btree};

impl BtShared {
    fn checks_locks(&self) -> bool {
        self.sharable && self.conns.len() > 1
    }

    /// Fail with `Locked` if `btree_id` cannot take `lock` on `table`
    /// (querySharedCacheTableLock).
    pub(crate) fn query_table_lock(&self, btree_id: BtreeId, table: Pgno, lock: BtLock) -> Result<()> {
        if !self.checks_locks() {
            return Ok(());
        }
        if lock == BtLock::Write && self.writer.is_some_and(|w| w != btree_id) {
            return Err(Error::with_message(ErrorCode::Locked, "another connection is writing"));
        }
        let conflict = self.locks.iter().find(|entry| {
            entry.btree_id != btree_id
                && entry.table == table
                && (entry.lock_type == BtLock::Write || lock == BtLock::Write)
        });
        if let Some(entry) = conflict {
            debug!(table, holder = entry.btree_id, requester = btree_id, ?lock, "table lock conflict");
            return Err(Error::with_message(
                ErrorCode::Locked,
                format!("database table is locked: {}", table),
            ));
        }
        Ok(())
    }

    /// Record a lock, upgrading an existing read lock (setSharedCacheTableLock).
    pub(crate) fn set_table_lock(&mut self, btree_id: BtreeId, table: Pgno, lock: BtLock) -> Result<()> {
        if !self.sharable {
            return Ok(());
        }
        self.query_table_lock(btree_id, table, lock)?;
        match self
            .locks
            .iter_mut()
            .find(|entry| entry.btree_id == btree_id && entry.table == table)
        {
            Some(entry) => {
                if lock == BtLock::Write {
                    entry.lock_type = BtLock::Write;
                }
            }
            None => self.locks.push(BtTableLockEntry {
                table,
                btree_id,
                lock_type: lock,
            }),
        }
        Ok(())
    }

    /// Take the lock a cursor access needs.
    pub(crate) fn require_table_lock(&mut self, btree_id: BtreeId, table: Pgno, lock: BtLock) -> Result<()> {
        self.set_table_lock(btree_id, table, lock)
    }

    /// Drop every lock held by a connection (clearAllSharedCacheTableLocks).
    pub(crate) fn clear_table_locks(&mut self, btree_id: BtreeId) {
        self.locks.retain(|entry| entry.btree_id != btree_id);
    }
}

impl Btree {
    /// sqlite3BtreeLockTable
    pub fn lock_table(&self, table: Pgno, write: bool) -> Result<()> {
        let lock = if write { BtLock::Write } else { BtLock::Read };
        self.shared.with(|bt| {
            if bt.conn_trans(self.id) == TransState::None {
                return Err(Error::with_message(ErrorCode::Misuse, "table lock outside a transaction"));
            }
            bt.set_table_lock(self.id, table, lock)
        })
    }

    /// sqlite3BtreeSchemaLocked: true while another connection's lock keeps
    /// this one from reading the schema table.
    pub fn schema_locked(&self) -> Result<bool> {
        self.shared
            .with(|bt| Ok(bt.query_table_lock(self.id, SCHEMA_ROOT, BtLock::Read).is_err()))
    }

    /// Whether `table` could be locked right now without conflict.
    pub fn table_lock_available(&self, table: Pgno, write: bool) -> Result<bool> {
        let lock = if write { BtLock::Write } else { BtLock::Read };
        self.shared.with(|bt| Ok(bt.query_table_lock(self.id, table, lock).is_ok()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::btree::tests::scratch;

    #[test]
    fn test_private_state_never_conflicts() {
        let (db, shared) = scratch(false);
        db.lock_table(1, true).unwrap();
        let guard = shared.inner.lock();
        let bt = guard.borrow();
        assert!(bt.locks.is_empty());
        assert!(bt.query_table_lock(999, 1, BtLock::Write).is_ok());
    }

    #[test]
    fn test_conflict_rules() {
        let (_db, shared) = scratch(false);
        let guard = shared.inner.lock();
        let mut bt = guard.borrow_mut();
        bt.sharable = true;
        bt.writer = None;
        bt.conns.insert(100, Default::default());
        bt.conns.insert(200, Default::default());
        bt.set_table_lock(100, 5, BtLock::Read).unwrap();
        bt.set_table_lock(200, 5, BtLock::Read).unwrap();
        assert_eq!(bt.query_table_lock(200, 5, BtLock::Write).unwrap_err().code, ErrorCode::Locked);
        bt.set_table_lock(100, 6, BtLock::Write).unwrap();
        assert_eq!(bt.query_table_lock(200, 6, BtLock::Read).unwrap_err().code, ErrorCode::Locked);
        bt.clear_table_locks(100);
        assert!(bt.set_table_lock(200, 6, BtLock::Write).is_ok());
        assert_eq!(bt.locks.len(), 2);
    }
}
