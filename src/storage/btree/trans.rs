//! Transactions and savepoints
//!
//! Connections move None -> Read -> Write. The shared state tracks the
//! strongest transaction any attached connection holds; the pager snapshot
//! is taken by the first connection to begin and released when the last
//! one ends.

use tracing::{debug, trace, warn};

use crate::error::{Error, ErrorCode, Result};
use crate::storage::pager::{DbPage, SavepointOp};
use crate::types::BtreeId;

use super::encoding::{write_u16, write_u32};
use super::page::MemPage;
use super::types::{
    BtLock, BtsFlags, DbHeader, TransState, BTREE_INCR_VACUUM, BTREE_LARGEST_ROOT_PAGE, HDR_CHANGE_COUNTER,
    HDR_DB_SIZE, HDR_META, HDR_SQLITE_VERSION, HDR_VERSION_VALID_FOR, MAX_EMBEDDED, MIN_EMBEDDED, PTF_TABLE_LEAF,
    SQLITE_FILE_HEADER,
};
use super::{BtShared, Btree};
use crate::config::AutoVacuum;

/// Version number written at offset 96 of the header
pub const RUSTQL_VERSION_NUMBER: u32 = 3_045_000;

impl BtShared {
    /// Read page-size and vacuum settings from page 1 (lockBtree).
    pub(crate) fn lock_btree(&mut self) -> Result<()> {
        if self.page_count() == 0 {
            self.reserve = self.config.reserve_bytes;
            self.usable_size = self.page_size - self.reserve as u32;
            self.auto_vacuum = self.config.auto_vacuum != AutoVacuum::None;
            self.incr_vacuum = self.config.auto_vacuum == AutoVacuum::Incremental;
            return Ok(());
        }
        let page1 = self.raw_page(1)?;
        let header = DbHeader::parse(&page1)?;
        if header.file_format > 2 {
            self.bts_flags |= BtsFlags::READ_ONLY;
        }
        if header.page_size != self.pager.page_size() {
            return Err(Error::corrupt_page(1, format!(
                "header page size {} disagrees with file page size {}",
                header.page_size,
                self.pager.page_size()
            )));
        }
        self.page_size = header.page_size;
        self.reserve = header.reserve;
        self.usable_size = header.page_size - header.reserve as u32;
        self.auto_vacuum = header.largest_root != 0;
        self.incr_vacuum = header.incr_vacuum;
        self.bts_flags |= BtsFlags::PAGESIZE_FIXED;
        trace!(page_size = self.page_size, auto_vacuum = self.auto_vacuum, "read database header");
        Ok(())
    }

    /// Write page 1 of an empty database (newDatabase).
    fn new_db(&mut self) -> Result<()> {
        let mut data = vec![0u8; self.page_size as usize];
        data[..SQLITE_FILE_HEADER.len()].copy_from_slice(SQLITE_FILE_HEADER);
        let stored_size = if self.page_size == 65536 { 1 } else { self.page_size as u16 };
        write_u16(&mut data, 16, stored_size)?;
        data[18] = 1;
        data[19] = 1;
        data[20] = self.reserve;
        data[21] = MAX_EMBEDDED;
        data[22] = MIN_EMBEDDED;
        data[23] = 32;
        write_u32(&mut data, HDR_DB_SIZE, 1)?;
        if self.auto_vacuum {
            // A non-zero largest root marks the file as auto-vacuum.
            write_u32(&mut data, HDR_META + 4 * BTREE_LARGEST_ROOT_PAGE, 1)?;
            write_u32(&mut data, HDR_META + 4 * BTREE_INCR_VACUUM, self.incr_vacuum as u32)?;
        }
        write_u32(&mut data, HDR_SQLITE_VERSION, RUSTQL_VERSION_NUMBER)?;
        let page = MemPage::init(DbPage::new(1, data), PTF_TABLE_LEAF, self.limits(1));
        self.write_page(page)?;
        self.bts_flags |= BtsFlags::PAGESIZE_FIXED;
        debug!(page_size = self.page_size, auto_vacuum = self.auto_vacuum, "created database");
        Ok(())
    }

    /// sqlite3BtreeBeginTrans
    pub(crate) fn begin_trans(&mut self, id: BtreeId, write: bool) -> Result<()> {
        let current = self.conn_trans(id);
        if current == TransState::Write || (current == TransState::Read && !write) {
            return Ok(());
        }
        if write && (self.bts_flags.contains(BtsFlags::READ_ONLY) || self.pager.is_readonly()) {
            return Err(Error::with_message(ErrorCode::ReadOnly, "attempt to write a readonly database"));
        }
        if self.sharable && self.conns.len() > 1 {
            if write && self.writer.is_some_and(|w| w != id) {
                debug!(btree = id, "shared state already has a writer");
                return Err(Error::with_message(ErrorCode::Locked, "database is locked by another connection"));
            }
            self.query_table_lock(id, 1, BtLock::Read)?;
        }

        let fresh = self.in_transaction == TransState::None;
        if fresh {
            self.pager.begin_read()?;
            if let Err(err) = self.lock_btree() {
                self.pager.end_read();
                return Err(err);
            }
        }
        if write && self.in_transaction != TransState::Write {
            if let Err(err) = self.pager.begin_write() {
                if fresh {
                    self.pager.end_read();
                }
                return Err(err);
            }
            if self.page_count() == 0 {
                if let Err(err) = self.new_db() {
                    self.pager.rollback();
                    if fresh {
                        self.pager.end_read();
                    }
                    return Err(err);
                }
            }
            self.in_transaction = TransState::Write;
            self.writer = Some(id);
        } else if fresh {
            self.in_transaction = TransState::Read;
        }
        self.set_table_lock(id, 1, BtLock::Read)?;
        if let Some(conn) = self.conns.get_mut(&id) {
            conn.in_trans = if write { TransState::Write } else { TransState::Read };
        }
        debug!(btree = id, write, "begin transaction");
        Ok(())
    }

    /// sqlite3BtreeCommitPhaseOne
    pub(crate) fn commit_phase_one(&mut self, id: BtreeId) -> Result<()> {
        if self.conn_trans(id) != TransState::Write {
            return Ok(());
        }
        self.autovacuum_commit()?;
        if self.pager.dirty_count() > 0 {
            let counter = self.header_u32(HDR_CHANGE_COUNTER)?.wrapping_add(1);
            self.put_header_u32(HDR_CHANGE_COUNTER, counter)?;
            self.put_header_u32(HDR_DB_SIZE, self.page_count())?;
            self.put_header_u32(HDR_VERSION_VALID_FOR, counter)?;
            self.put_header_u32(HDR_SQLITE_VERSION, RUSTQL_VERSION_NUMBER)?;
        }
        self.pager.commit_phase_one()
    }

    /// sqlite3BtreeCommitPhaseTwo
    pub(crate) fn commit_phase_two(&mut self, id: BtreeId) -> Result<()> {
        match self.conn_trans(id) {
            TransState::None => return Ok(()),
            TransState::Write => {
                if let Err(err) = self.pager.commit_phase_two() {
                    warn!(btree = id, error = %err, "commit failed; connection must be reopened");
                    self.trip_all_cursors(None, err.clone(), false);
                    self.end_transaction(id);
                    return Err(err);
                }
            }
            TransState::Read => {}
        }
        self.end_transaction(id);
        debug!(btree = id, "committed");
        Ok(())
    }

    /// sqlite3BtreeRollback
    pub(crate) fn rollback(&mut self, id: BtreeId) -> Result<()> {
        let state = self.conn_trans(id);
        if state == TransState::None {
            return Ok(());
        }
        self.save_all_cursors(None)?;
        if state == TransState::Write {
            self.pager.rollback();
            // Header values may have been changed by the discarded pages.
            if self.page_count() > 0 {
                self.lock_btree()?;
            } else {
                self.bts_flags.remove(BtsFlags::PAGESIZE_FIXED);
            }
        }
        self.end_transaction(id);
        debug!(btree = id, "rolled back");
        Ok(())
    }

    /// Release a connection's transaction. The pager snapshot goes with the
    /// last transaction on the shared state.
    pub(crate) fn end_transaction(&mut self, id: BtreeId) {
        if let Some(conn) = self.conns.get_mut(&id) {
            conn.in_trans = TransState::None;
        }
        self.clear_table_locks(id);
        if self.writer == Some(id) {
            self.writer = None;
            self.in_transaction = TransState::Read;
        }
        if self.conns.values().all(|c| c.in_trans == TransState::None) {
            if let Err(err) = self.save_all_cursors(None) {
                warn!(error = %err, "could not save cursor positions");
            }
            self.pager.end_read();
            self.in_transaction = TransState::None;
        }
    }

    /// sqlite3BtreeSavepoint
    pub(crate) fn savepoint(&mut self, id: BtreeId, op: SavepointOp, depth: usize) -> Result<()> {
        if self.conn_trans(id) != TransState::Write {
            return Ok(());
        }
        match op {
            SavepointOp::Begin => self.pager.open_savepoint(depth + 1),
            SavepointOp::Release => self.pager.savepoint(SavepointOp::Release, depth),
            SavepointOp::Rollback => {
                self.save_all_cursors(None)?;
                self.pager.savepoint(SavepointOp::Rollback, depth)?;
                if self.page_count() > 0 {
                    self.lock_btree()?;
                }
                trace!(depth, "rolled back to savepoint");
                Ok(())
            }
        }
    }
}

impl Btree {
    /// sqlite3BtreeBeginTrans
    pub fn begin_trans(&self, write: bool) -> Result<()> {
        self.shared.with(|bt| bt.begin_trans(self.id, write))
    }

    /// sqlite3BtreeCommitPhaseOne: run auto-vacuum, update the header and
    /// write the rollback journal. On error the transaction stays open and
    /// should be rolled back.
    pub fn commit_phase_one(&self) -> Result<()> {
        self.shared.with(|bt| bt.commit_phase_one(self.id))
    }

    /// sqlite3BtreeCommitPhaseTwo: publish the pages. A failure here leaves
    /// the pager unusable and the connection must be reopened.
    pub fn commit_phase_two(&self) -> Result<()> {
        self.shared.with(|bt| bt.commit_phase_two(self.id))
    }

    /// sqlite3BtreeCommit
    pub fn commit(&self) -> Result<()> {
        self.shared.with(|bt| {
            if let Err(err) = bt.commit_phase_one(self.id) {
                bt.rollback(self.id)?;
                return Err(err);
            }
            bt.commit_phase_two(self.id)
        })
    }

    /// sqlite3BtreeRollback. Cursor positions are saved and re-seek on next use.
    pub fn rollback(&self) -> Result<()> {
        self.shared.with(|bt| bt.rollback(self.id))
    }

    /// sqlite3BtreeBeginStmt: open savepoint level `depth`.
    pub fn begin_stmt(&self, depth: usize) -> Result<()> {
        self.savepoint(SavepointOp::Begin, depth)
    }

    /// sqlite3BtreeSavepoint
    ///
    /// `Begin` makes levels `0..=depth` exist. `Rollback` undoes everything
    /// since level `depth` was opened and keeps it open. `Release` drops
    /// level `depth` and every level above it.
    pub fn savepoint(&self, op: SavepointOp, depth: usize) -> Result<()> {
        self.shared.with(|bt| bt.savepoint(self.id, op, depth))
    }

    /// Number of open savepoint levels.
    pub fn savepoint_count(&self) -> usize {
        self.shared.with(|bt| Ok(bt.pager.savepoint_count())).unwrap_or(0)
    }

    /// sqlite3BtreeTxnState
    pub fn txn_state(&self) -> TransState {
        self.shared.with(|bt| Ok(bt.conn_trans(self.id))).unwrap_or(TransState::None)
    }

    pub fn is_in_write_trans(&self) -> bool {
        self.txn_state() == TransState::Write
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::btree::tests::memory_db;
    use crate::storage::btree::{BtreeCursorFlags, BtreeInsertFlags, BtreePayload, BTREE_INTKEY};

    #[test]
    fn test_first_write_creates_page_one() {
        let db = memory_db();
        assert_eq!(db.last_page().unwrap(), 0);
        db.begin_trans(true).unwrap();
        assert_eq!(db.txn_state(), TransState::Write);
        assert_eq!(db.last_page().unwrap(), 1);
        db.commit().unwrap();
        assert_eq!(db.txn_state(), TransState::None);
        db.begin_trans(false).unwrap();
        assert_eq!(db.last_page().unwrap(), 1);
        db.commit().unwrap();
    }

    #[test]
    fn test_rollback_discards_everything() {
        let db = memory_db();
        db.begin_trans(true).unwrap();
        db.commit().unwrap();
        db.begin_trans(true).unwrap();
        let root = db.create_table(BTREE_INTKEY).unwrap();
        assert_eq!(root, 2);
        db.rollback().unwrap();
        db.begin_trans(false).unwrap();
        assert_eq!(db.last_page().unwrap(), 1);
        db.commit().unwrap();
    }

    #[test]
    fn test_savepoint_rollback_keeps_level() {
        let db = memory_db();
        db.begin_trans(true).unwrap();
        let root = db.create_table(BTREE_INTKEY).unwrap();
        let mut cur = db.cursor(root, BtreeCursorFlags::WRCSR, None).unwrap();
        cur.insert(&BtreePayload::table(1, b"one".to_vec()), BtreeInsertFlags::empty(), None)
            .unwrap();
        db.savepoint(SavepointOp::Begin, 0).unwrap();
        cur.insert(&BtreePayload::table(2, b"two".to_vec()), BtreeInsertFlags::empty(), None)
            .unwrap();
        db.savepoint(SavepointOp::Rollback, 0).unwrap();
        assert_eq!(db.savepoint_count(), 1);
        assert_eq!(cur.count().unwrap(), 1);
        db.savepoint(SavepointOp::Release, 0).unwrap();
        assert_eq!(db.savepoint_count(), 0);
        drop(cur);
        db.commit().unwrap();
    }

    #[test]
    fn test_write_on_read_only_config_fails() {
        let db = Btree::open(
            None,
            crate::storage::btree::BtreeOpenFlags::MEMORY,
            crate::config::BtreeConfig::default().read_only(true),
        )
        .unwrap();
        assert_eq!(db.begin_trans(true).unwrap_err().code, ErrorCode::ReadOnly);
        db.begin_trans(false).unwrap();
        db.rollback().unwrap();
    }
}
