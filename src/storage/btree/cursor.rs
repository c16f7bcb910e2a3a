//! Cursor engine
//!
//! A cursor's position is a path of (page number, index) pairs from the
//! root down to a leaf cell. Cursor state lives in the shared state's
//! registry rather than in [`BtCursor`] itself, so that a structural change
//! made through one cursor can save the position of every other cursor on
//! the same tree: their current key is remembered and the cursor moves to
//! `RequireSeek`. The next operation on a saved cursor seeks the key again
//! and, if the entry is gone, lands on a neighbour.

use std::cmp::Ordering;
use std::sync::Arc;

use tracing::{debug, trace};

use crate::error::{Error, ErrorCode, Result};
use crate::storage::pager::SavepointOp;
use crate::types::{BtreeId, Pgno, RowId};

use super::balance::{is_underfull, Node};
use super::overflow::CellKind;
use super::page::MemPage;
use super::types::{
    BtLock, BtreeCursorFlags, BtreeInsertFlags, BtreePayload, CursorState,
    KeyInfo, SeekBias, SeekResult, TransState, UnpackedRecord, BTCURSOR_MAX_DEPTH,
};
use super::{BtShared, SharedHandle};

/// Key of a cursor in the shared state's registry
pub(crate) type CursorId = u64;

/// Key remembered by a cursor whose position was saved.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum SavedKey {
    Int(i64),
    Blob(Vec<u8>),
}

/// What a seek looks for.
#[derive(Clone, Copy)]
pub(crate) enum Target<'a> {
    Int(i64),
    Key(&'a UnpackedRecord<'a>),
}

/// Cursor state kept in the registry.
#[derive(Debug)]
pub(crate) struct CursorInner {
    pub(crate) btree_id: BtreeId,
    pub(crate) root: Pgno,
    pub(crate) write: bool,
    pub(crate) int_key: bool,
    pub(crate) key_info: Option<Arc<KeyInfo>>,
    pub(crate) state: CursorState,
    /// (page, index) from the root to the current leaf cell. For interior
    /// pages the index names the child followed.
    pub(crate) path: Vec<(Pgno, u16)>,
    pub(crate) saved_key: Option<SavedKey>,
    /// 1: the next `next` stays put; -1: the next `previous` stays put
    pub(crate) skip_next: i32,
    pub(crate) hints: BtreeCursorFlags,
    pub(crate) pinned: bool,
    pub(crate) fault: Option<Error>,
    /// Payload bytes for the next PREFORMAT insert
    pub(crate) preformat: Option<Vec<u8>>,
}

impl CursorInner {
    pub(crate) fn new(
        btree_id: BtreeId,
        root: Pgno,
        flags: BtreeCursorFlags,
        key_info: Option<Arc<KeyInfo>>,
    ) -> Self {
        CursorInner {
            btree_id,
            root,
            write: flags.contains(BtreeCursorFlags::WRCSR),
            int_key: key_info.is_none(),
            key_info,
            state: CursorState::Invalid,
            path: Vec::new(),
            saved_key: None,
            skip_next: 0,
            hints: flags & (BtreeCursorFlags::BULKLOAD | BtreeCursorFlags::SEEK_EQ),
            pinned: false,
            fault: None,
            preformat: None,
        }
    }

    fn leaf(&self) -> Result<(Pgno, u16)> {
        self.path
            .last()
            .copied()
            .ok_or_else(|| Error::with_message(ErrorCode::Misuse, "cursor is not positioned"))
    }

    fn set_leaf_index(&mut self, idx: u16) {
        if let Some(last) = self.path.last_mut() {
            last.1 = idx;
        }
    }

    fn invalidate(&mut self) {
        self.state = CursorState::Invalid;
        self.path.clear();
        self.skip_next = 0;
    }
}

// ============================================================================
// Engine
// ============================================================================

impl BtShared {
    /// Reject use of a faulted cursor or one whose connection has no
    /// suitable transaction, and take the table lock the access needs.
    fn check_cursor(&mut self, cur: &CursorInner, write: bool) -> Result<()> {
        if let Some(err) = &cur.fault {
            return Err(err.clone());
        }
        let trans = self.conn_trans(cur.btree_id);
        if trans == TransState::None {
            return Err(Error::with_message(ErrorCode::Misuse, "cursor used outside a transaction"));
        }
        if write {
            if !cur.write {
                return Err(Error::with_message(ErrorCode::ReadOnly, "cursor not opened for writing"));
            }
            if trans != TransState::Write {
                return Err(Error::with_message(ErrorCode::Misuse, "no write transaction"));
            }
            if cur.pinned {
                return Err(Error::with_message(ErrorCode::Misuse, "cursor is pinned"));
            }
        }
        let lock = if write { BtLock::Write } else { BtLock::Read };
        self.require_table_lock(cur.btree_id, cur.root, lock)
    }

    /// Load a page of the cursor's tree, checking it has the tree's type.
    fn cursor_page(&mut self, cur: &CursorInner, pgno: Pgno) -> Result<MemPage> {
        let page = self.get_page(pgno)?;
        if page.int_key != cur.int_key {
            return Err(Error::corrupt_page(pgno, format!("page type 0x{:02x} does not match tree {}", page.flags, cur.root)));
        }
        Ok(page)
    }

    /// Order of the key in cell `i` relative to `target`.
    fn compare_cell(
        &mut self,
        page: &MemPage,
        i: u16,
        key_info: Option<&KeyInfo>,
        target: Target<'_>,
    ) -> Result<Ordering> {
        match target {
            Target::Int(key) => Ok(page.int_key_at(i)?.cmp(&key)),
            Target::Key(rec) => {
                let stored = self.cell_payload(page, i)?;
                Ok(match key_info {
                    Some(info) => info.compare(&stored, rec),
                    None => stored.as_slice().cmp(rec.key),
                })
            }
        }
    }

    /// Descend from the root to the leaf entry nearest `target`
    /// (moveToRoot + moveToChild + binary search).
    pub(crate) fn seek(&mut self, cur: &mut CursorInner, target: Target<'_>) -> Result<SeekResult> {
        cur.invalidate();
        cur.saved_key = None;
        if self.page_count() == 0 {
            return Ok(SeekResult::Empty);
        }
        let key_info = cur.key_info.clone();
        let mut pgno = cur.root;
        loop {
            if cur.path.len() >= BTCURSOR_MAX_DEPTH {
                return Err(Error::corrupt_page(pgno, "tree is too deep"));
            }
            let page = self.cursor_page(cur, pgno)?;
            let (mut lo, mut hi) = (0u16, page.n_cell);
            let mut equal_at = None;
            while lo < hi {
                let mid = lo + (hi - lo) / 2;
                match self.compare_cell(&page, mid, key_info.as_deref(), target)? {
                    Ordering::Less => lo = mid + 1,
                    Ordering::Equal => {
                        equal_at = Some(mid);
                        hi = mid;
                    }
                    Ordering::Greater => hi = mid,
                }
            }
            if !page.leaf {
                cur.path.push((pgno, lo));
                pgno = page.child(lo)?;
                continue;
            }
            if page.n_cell == 0 {
                cur.path.push((pgno, 0));
                if cur.path.len() == 1 {
                    return Ok(SeekResult::Empty);
                }
                // An empty leaf below the root: settle on a neighbour.
                let at_leaf = cur.path.clone();
                if self.retreat(cur)? {
                    cur.state = CursorState::Valid;
                    return Ok(SeekResult::Before);
                }
                if self.first_entry(cur)? {
                    cur.state = CursorState::Valid;
                    return Ok(SeekResult::After);
                }
                cur.path = at_leaf;
                cur.state = CursorState::Invalid;
                return Ok(SeekResult::Empty);
            }
            cur.state = CursorState::Valid;
            if lo == page.n_cell {
                cur.path.push((pgno, lo - 1));
                return Ok(SeekResult::Before);
            }
            cur.path.push((pgno, lo));
            return Ok(if equal_at == Some(lo) {
                SeekResult::Exact
            } else {
                SeekResult::After
            });
        }
    }

    /// Follow first or last children from `pgno` down to a leaf. Returns
    /// false when that leaf is empty.
    fn descend_edge(&mut self, cur: &mut CursorInner, mut pgno: Pgno, leftmost: bool) -> Result<bool> {
        loop {
            if cur.path.len() >= BTCURSOR_MAX_DEPTH {
                return Err(Error::corrupt_page(pgno, "tree is too deep"));
            }
            let page = self.cursor_page(cur, pgno)?;
            if page.leaf {
                let idx = if leftmost { 0 } else { page.n_cell.saturating_sub(1) };
                cur.path.push((pgno, idx));
                return Ok(page.n_cell > 0);
            }
            let ci = if leftmost { 0 } else { page.n_cell };
            cur.path.push((pgno, ci));
            pgno = page.child(ci)?;
        }
    }

    /// Step to the following entry (sqlite3BtreeNext). Returns false at
    /// the end of the tree.
    fn advance(&mut self, cur: &mut CursorInner) -> Result<bool> {
        let (pgno, idx) = cur.leaf()?;
        let leaf = self.cursor_page(cur, pgno)?;
        if idx + 1 < leaf.n_cell {
            cur.set_leaf_index(idx + 1);
            return Ok(true);
        }
        cur.path.pop();
        while let Some(&(pgno, ci)) = cur.path.last() {
            let parent = self.cursor_page(cur, pgno)?;
            if ci < parent.n_cell {
                cur.set_leaf_index(ci + 1);
                if self.descend_edge(cur, parent.child(ci + 1)?, true)? {
                    return Ok(true);
                }
            }
            cur.path.pop();
        }
        Ok(false)
    }

    /// Step to the preceding entry (sqlite3BtreePrevious). Returns false
    /// at the start of the tree.
    fn retreat(&mut self, cur: &mut CursorInner) -> Result<bool> {
        let (_, idx) = cur.leaf()?;
        if idx > 0 {
            cur.set_leaf_index(idx - 1);
            return Ok(true);
        }
        cur.path.pop();
        while let Some(&(pgno, ci)) = cur.path.last() {
            if ci > 0 {
                let parent = self.cursor_page(cur, pgno)?;
                cur.set_leaf_index(ci - 1);
                if self.descend_edge(cur, parent.child(ci - 1)?, false)? {
                    return Ok(true);
                }
            }
            cur.path.pop();
        }
        Ok(false)
    }

    /// Position on the smallest entry.
    fn first_entry(&mut self, cur: &mut CursorInner) -> Result<bool> {
        cur.path.clear();
        if self.page_count() == 0 {
            return Ok(false);
        }
        if self.descend_edge(cur, cur.root, true)? {
            return Ok(true);
        }
        self.advance(cur)
    }

    fn last_entry(&mut self, cur: &mut CursorInner) -> Result<bool> {
        cur.path.clear();
        if self.page_count() == 0 {
            return Ok(false);
        }
        if self.descend_edge(cur, cur.root, false)? {
            return Ok(true);
        }
        let (pgno, _) = cur.leaf()?;
        let leaf = self.cursor_page(cur, pgno)?;
        if leaf.n_cell > 0 {
            return Ok(true);
        }
        self.retreat(cur)
    }

    /// True when every interior step of the path is the first (or last)
    /// child, so the leaf is the first (or last) leaf of the tree.
    fn on_edge_leaf(&mut self, cur: &CursorInner, last: bool) -> Result<bool> {
        let steps = cur.path.len().saturating_sub(1);
        for &(pgno, ci) in &cur.path[..steps] {
            let page = self.cursor_page(cur, pgno)?;
            let edge = if last { page.n_cell } else { 0 };
            if ci != edge {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Answer a biased seek from the current position when possible.
    fn seek_near(&mut self, cur: &mut CursorInner, target: Target<'_>, bias: SeekBias) -> Result<Option<SeekResult>> {
        if cur.state != CursorState::Valid || bias == SeekBias::None {
            return Ok(None);
        }
        let (pgno, idx) = cur.leaf()?;
        let page = self.cursor_page(cur, pgno)?;
        if !page.leaf || idx >= page.n_cell {
            return Ok(None);
        }
        let key_info = cur.key_info.clone();
        let here = self.compare_cell(&page, idx, key_info.as_deref(), target)?;
        if here == Ordering::Equal {
            return Ok(Some(SeekResult::Exact));
        }
        match (bias, here) {
            (SeekBias::Forward, Ordering::Less) => {
                if idx + 1 < page.n_cell {
                    match self.compare_cell(&page, idx + 1, key_info.as_deref(), target)? {
                        Ordering::Equal => {
                            cur.set_leaf_index(idx + 1);
                            return Ok(Some(SeekResult::Exact));
                        }
                        Ordering::Greater => return Ok(Some(SeekResult::Before)),
                        Ordering::Less => {}
                    }
                } else if self.on_edge_leaf(cur, true)? {
                    return Ok(Some(SeekResult::Before));
                }
            }
            (SeekBias::Backward, Ordering::Greater) => {
                if idx > 0 {
                    match self.compare_cell(&page, idx - 1, key_info.as_deref(), target)? {
                        Ordering::Equal => {
                            cur.set_leaf_index(idx - 1);
                            return Ok(Some(SeekResult::Exact));
                        }
                        Ordering::Less => return Ok(Some(SeekResult::After)),
                        Ordering::Greater => {}
                    }
                } else if self.on_edge_leaf(cur, false)? {
                    return Ok(Some(SeekResult::After));
                }
            }
            _ => {}
        }
        Ok(None)
    }

    fn moveto(&mut self, cur: &mut CursorInner, target: Target<'_>, bias: SeekBias) -> Result<SeekResult> {
        self.check_cursor(cur, false)?;
        if cur.state == CursorState::RequireSeek {
            self.restore_position(cur)?;
        }
        cur.skip_next = 0;
        let bias = if bias == SeekBias::None && cur.hints.contains(BtreeCursorFlags::SEEK_EQ) {
            SeekBias::Forward
        } else {
            bias
        };
        if let Some(found) = self.seek_near(cur, target, bias)? {
            trace!(root = cur.root, ?found, "seek answered from current position");
            return Ok(found);
        }
        self.seek(cur, target)
    }

    // ========================================================================
    // Saving and restoring positions
    // ========================================================================

    /// Remember the key under a valid cursor and drop its path (saveCursorPosition).
    pub(crate) fn save_position(&mut self, cur: &mut CursorInner) -> Result<()> {
        if cur.state != CursorState::Valid {
            if cur.state == CursorState::Invalid {
                cur.path.clear();
            }
            return Ok(());
        }
        let (pgno, idx) = cur.leaf()?;
        let page = self.cursor_page(cur, pgno)?;
        let key = if cur.int_key {
            SavedKey::Int(page.int_key_at(idx)?)
        } else {
            SavedKey::Blob(self.cell_payload(&page, idx)?)
        };
        cur.saved_key = Some(key);
        cur.state = CursorState::RequireSeek;
        cur.path.clear();
        cur.skip_next = 0;
        Ok(())
    }

    /// Save the position of every registered cursor on `root`, or on every
    /// tree when `root` is None (saveAllCursors). The cursor performing the
    /// change is not in the registry while it runs and is left alone.
    pub(crate) fn save_all_cursors(&mut self, root: Option<Pgno>) -> Result<()> {
        let ids: Vec<CursorId> = self
            .cursors
            .iter()
            .filter(|(_, c)| root.map_or(true, |r| c.root == r))
            .map(|(id, _)| *id)
            .collect();
        for id in ids {
            let Some(mut cur) = self.cursors.remove(&id) else { continue };
            let result = self.save_position(&mut cur);
            self.cursors.insert(id, cur);
            result?;
        }
        Ok(())
    }

    /// Seek the saved key again (btreeRestoreCursorPosition). Returns true
    /// if the saved entry still exists.
    fn restore_position(&mut self, cur: &mut CursorInner) -> Result<bool> {
        if cur.state != CursorState::RequireSeek {
            return Ok(cur.state == CursorState::Valid);
        }
        let Some(key) = cur.saved_key.take() else {
            cur.invalidate();
            return Ok(false);
        };
        let found = match &key {
            SavedKey::Int(k) => self.seek(cur, Target::Int(*k))?,
            SavedKey::Blob(bytes) => {
                let rec = UnpackedRecord::new(bytes);
                self.seek(cur, Target::Key(&rec))?
            }
        };
        cur.skip_next = match found {
            SeekResult::After => 1,
            SeekResult::Before => -1,
            SeekResult::Exact | SeekResult::Empty => 0,
        };
        Ok(found == SeekResult::Exact)
    }

    /// Bring a cursor to a state where it can be read.
    fn ready(&mut self, cur: &mut CursorInner) -> Result<()> {
        self.check_cursor(cur, false)?;
        if cur.state == CursorState::RequireSeek {
            self.restore_position(cur)?;
        }
        Ok(())
    }

    fn current(&mut self, cur: &mut CursorInner) -> Result<(MemPage, u16)> {
        self.ready(cur)?;
        if cur.state != CursorState::Valid {
            return Err(Error::with_message(ErrorCode::Misuse, "cursor does not point at an entry"));
        }
        let (pgno, idx) = cur.leaf()?;
        let page = self.cursor_page(cur, pgno)?;
        if !page.leaf || idx >= page.n_cell {
            return Err(Error::corrupt_page(pgno, format!("cursor index {} out of range", idx)));
        }
        Ok((page, idx))
    }

    // ========================================================================
    // Mutation
    // ========================================================================

    /// Run `op` inside a statement savepoint so that a failure leaves the
    /// database as it was before the call.
    pub(crate) fn atomically<R>(&mut self, op: impl FnOnce(&mut BtShared) -> Result<R>) -> Result<R> {
        let depth = self.pager.savepoint_count();
        self.pager.open_savepoint(depth + 1)?;
        match op(self) {
            Ok(value) => {
                self.pager.savepoint(SavepointOp::Release, depth)?;
                Ok(value)
            }
            Err(err) => {
                debug!(error = %err, "undoing failed change");
                self.pager.savepoint(SavepointOp::Rollback, depth)?;
                self.pager.savepoint(SavepointOp::Release, depth)?;
                Err(err)
            }
        }
    }

    /// sqlite3BtreeInsert
    pub(crate) fn cursor_insert(
        &mut self,
        cur: &mut CursorInner,
        payload: &BtreePayload,
        flags: BtreeInsertFlags,
        seek_result: Option<SeekResult>,
    ) -> Result<()> {
        self.check_cursor(cur, true)?;
        if payload.is_table() != cur.int_key {
            return Err(Error::with_message(ErrorCode::Misuse, "payload kind does not match the tree"));
        }
        let preformat = if flags.contains(BtreeInsertFlags::PREFORMAT) {
            Some(cur.preformat.take().ok_or_else(|| {
                Error::with_message(ErrorCode::Misuse, "PREFORMAT insert without a prepared cell")
            })?)
        } else {
            None
        };
        let result = self.atomically(|bt| bt.insert_entry(cur, payload, flags, seek_result, preformat));
        if result.is_err() {
            cur.invalidate();
        }
        result
    }

    fn insert_entry(
        &mut self,
        cur: &mut CursorInner,
        payload: &BtreePayload,
        flags: BtreeInsertFlags,
        seek_result: Option<SeekResult>,
        preformat: Option<Vec<u8>>,
    ) -> Result<()> {
        let (target_key, saved, kind) = match payload {
            BtreePayload::Table { rowid, .. } => (Some(*rowid), SavedKey::Int(*rowid), CellKind::TableLeaf),
            BtreePayload::Index { key, .. } => (None, SavedKey::Blob(key.clone()), CellKind::IndexLeaf),
        };
        let rec = match payload {
            BtreePayload::Index { key, fields } => Some(UnpackedRecord::with_fields(key, fields)),
            BtreePayload::Table { .. } => None,
        };
        let target = match (target_key, &rec) {
            (Some(rowid), _) => Target::Int(rowid),
            (None, Some(rec)) => Target::Key(rec),
            (None, None) => return Err(Error::new(ErrorCode::Internal)),
        };

        // Bulk loads arrive in key order, so they take the append path.
        let sequential =
            flags.contains(BtreeInsertFlags::APPEND) || cur.hints.contains(BtreeCursorFlags::BULKLOAD);
        let positioned = flags.contains(BtreeInsertFlags::USESEEKRESULT) && cur.state == CursorState::Valid;
        let loc = match seek_result {
            Some(loc) if positioned => loc,
            _ => {
                if cur.state == CursorState::RequireSeek {
                    self.restore_position(cur)?;
                }
                let bias = if sequential {
                    SeekBias::Forward
                } else {
                    SeekBias::None
                };
                match self.seek_near(cur, target, bias)? {
                    Some(loc) => loc,
                    None => self.seek(cur, target)?,
                }
            }
        };
        if loc == SeekResult::Exact && cur.key_info.as_ref().is_some_and(|k| k.unique) {
            return Err(Error::with_message(ErrorCode::Constraint, "UNIQUE constraint failed: duplicate index key"));
        }

        let cell = match (payload, preformat) {
            (_, Some(bytes)) => self.build_cell(kind, target_key.unwrap_or(0), &bytes, 0)?,
            (BtreePayload::Table { rowid, data, n_zero }, None) => self.build_cell(kind, *rowid, data, *n_zero)?,
            (BtreePayload::Index { key, .. }, None) => self.build_cell(kind, 0, key, 0)?,
        };

        self.save_all_cursors(Some(cur.root))?;
        let (leaf_pgno, mut idx) = cur.leaf()?;
        let mut page = self.cursor_page(cur, leaf_pgno)?;
        match loc {
            SeekResult::Exact => {
                self.clear_cell(&page, idx)?;
                page.remove_cell(idx)?;
            }
            SeekResult::Before => idx += 1,
            SeekResult::After => {}
            SeekResult::Empty => idx = 0,
        }
        if page.try_insert_cell(idx, &cell)? {
            let info = page.cell_info(idx)?;
            self.ptrmap_put_overflow(&info, leaf_pgno)?;
            self.write_page(page)?;
            cur.set_leaf_index(idx);
            cur.state = CursorState::Valid;
            return Ok(());
        }
        let mut node = Node::load(&page)?;
        node.cells.insert(idx as usize, cell);
        let ancestors = cur.path[..cur.path.len() - 1].to_vec();
        self.balance(&ancestors, node, sequential)?;
        cur.path.clear();
        cur.saved_key = Some(saved);
        cur.state = CursorState::RequireSeek;
        Ok(())
    }

    /// sqlite3BtreeDelete
    pub(crate) fn cursor_delete(&mut self, cur: &mut CursorInner, flags: BtreeInsertFlags) -> Result<()> {
        self.check_cursor(cur, true)?;
        if cur.state == CursorState::RequireSeek {
            self.restore_position(cur)?;
        }
        if cur.state != CursorState::Valid {
            return Err(Error::with_message(ErrorCode::Misuse, "delete from a cursor that does not point at an entry"));
        }
        let result = self.atomically(|bt| bt.delete_entry(cur, flags));
        if result.is_err() {
            cur.invalidate();
        }
        result
    }

    fn delete_entry(&mut self, cur: &mut CursorInner, flags: BtreeInsertFlags) -> Result<()> {
        let (pgno, idx) = cur.leaf()?;
        let mut page = self.cursor_page(cur, pgno)?;
        let saved = if cur.int_key {
            SavedKey::Int(page.int_key_at(idx)?)
        } else {
            SavedKey::Blob(self.cell_payload(&page, idx)?)
        };
        self.save_all_cursors(Some(cur.root))?;
        self.clear_cell(&page, idx)?;
        page.remove_cell(idx)?;
        if cur.path.len() == 1 || !is_underfull(page.used_space()?, page.capacity()) {
            self.write_page(page)?;
        } else {
            let node = Node::load(&page)?;
            let ancestors = cur.path[..cur.path.len() - 1].to_vec();
            self.balance(&ancestors, node, false)?;
        }
        if flags.contains(BtreeInsertFlags::SAVEPOSITION) {
            cur.path.clear();
            cur.saved_key = Some(saved);
            cur.state = CursorState::RequireSeek;
        } else {
            cur.invalidate();
        }
        Ok(())
    }

    /// Number of entries in the tree under `root` (sqlite3BtreeCount).
    pub(crate) fn count_entries(&mut self, root: Pgno) -> Result<i64> {
        let mut total = 0i64;
        let mut stack = vec![(root, 0usize)];
        let mut visited = 0u32;
        while let Some((pgno, depth)) = stack.pop() {
            visited += 1;
            if depth >= BTCURSOR_MAX_DEPTH || visited > self.page_count() {
                return Err(Error::corrupt_page(pgno, "tree walk does not terminate"));
            }
            let page = self.get_page(pgno)?;
            if page.leaf {
                total += page.n_cell as i64;
            } else {
                for i in 0..=page.n_cell {
                    stack.push((page.child(i)?, depth + 1));
                }
            }
        }
        Ok(total)
    }
}

// ============================================================================
// Public cursor handle
// ============================================================================

/// A cursor over one tree (BtCursor).
///
/// Obtained from [`Btree::cursor`](super::Btree::cursor). Closing is done by
/// dropping the handle.
pub struct BtCursor {
    pub(crate) shared: Arc<SharedHandle>,
    pub(crate) btree_id: BtreeId,
    pub(crate) id: CursorId,
    pub(crate) root: Pgno,
}

impl std::fmt::Debug for BtCursor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BtCursor")
            .field("btree_id", &self.btree_id)
            .field("id", &self.id)
            .field("root", &self.root)
            .finish()
    }
}

impl BtCursor {
    fn with_cursor<R>(&self, op: impl FnOnce(&mut BtShared, &mut CursorInner) -> Result<R>) -> Result<R> {
        self.shared.with(|bt| {
            if !bt.conns.contains_key(&self.btree_id) {
                return Err(Error::with_message(ErrorCode::Misuse, "connection is closed"));
            }
            let mut cur = bt
                .cursors
                .remove(&self.id)
                .ok_or_else(|| Error::with_message(ErrorCode::Misuse, "cursor is closed"))?;
            let result = op(bt, &mut cur);
            bt.cursors.insert(self.id, cur);
            result
        })
    }

    fn peek<R>(&self, read: impl FnOnce(&CursorInner) -> R, default: R) -> R {
        self.shared
            .with(|bt| {
                if !bt.conns.contains_key(&self.btree_id) {
                    return Ok(None);
                }
                Ok(bt.cursors.get(&self.id).map(read))
            })
            .ok()
            .flatten()
            .unwrap_or(default)
    }

    /// Root page of the tree this cursor walks.
    pub fn root(&self) -> Pgno {
        self.peek(|c| c.root, self.root)
    }

    /// sqlite3BtreeFirst. Returns true if the tree is empty.
    pub fn first(&mut self) -> Result<bool> {
        self.with_cursor(|bt, cur| {
            bt.check_cursor(cur, false)?;
            cur.invalidate();
            cur.saved_key = None;
            if bt.first_entry(cur)? {
                cur.state = CursorState::Valid;
                Ok(false)
            } else {
                cur.invalidate();
                Ok(true)
            }
        })
    }

    /// sqlite3BtreeLast. Returns true if the tree is empty.
    pub fn last(&mut self) -> Result<bool> {
        self.with_cursor(|bt, cur| {
            bt.check_cursor(cur, false)?;
            cur.invalidate();
            cur.saved_key = None;
            if bt.last_entry(cur)? {
                cur.state = CursorState::Valid;
                Ok(false)
            } else {
                cur.invalidate();
                Ok(true)
            }
        })
    }

    /// sqlite3BtreeNext. Check [`eof`](Self::eof) afterwards.
    pub fn next(&mut self) -> Result<()> {
        self.with_cursor(|bt, cur| {
            bt.ready(cur)?;
            if cur.state != CursorState::Valid {
                return Ok(());
            }
            if cur.skip_next > 0 {
                cur.skip_next = 0;
                return Ok(());
            }
            cur.skip_next = 0;
            if !bt.advance(cur)? {
                cur.invalidate();
            }
            Ok(())
        })
    }

    /// sqlite3BtreePrevious
    pub fn previous(&mut self) -> Result<()> {
        self.with_cursor(|bt, cur| {
            bt.ready(cur)?;
            if cur.state != CursorState::Valid {
                return Ok(());
            }
            if cur.skip_next < 0 {
                cur.skip_next = 0;
                return Ok(());
            }
            cur.skip_next = 0;
            if !bt.retreat(cur)? {
                cur.invalidate();
            }
            Ok(())
        })
    }

    /// sqlite3BtreeEof
    pub fn eof(&self) -> bool {
        self.peek(|c| c.state != CursorState::Valid, true)
    }

    /// sqlite3BtreeCursorIsValid
    pub fn is_valid(&self) -> bool {
        self.peek(|c| c.state == CursorState::Valid, false)
    }

    pub fn state(&self) -> CursorState {
        self.peek(|c| c.state, CursorState::Invalid)
    }

    /// sqlite3BtreeIsEmpty
    pub fn is_empty(&mut self) -> Result<bool> {
        self.with_cursor(|bt, cur| {
            bt.check_cursor(cur, false)?;
            if bt.page_count() == 0 {
                return Ok(true);
            }
            let page = bt.cursor_page(cur, cur.root)?;
            Ok(page.leaf && page.n_cell == 0 || bt.count_entries(cur.root)? == 0)
        })
    }

    /// sqlite3BtreeCount: number of entries, by walking every page.
    pub fn count(&mut self) -> Result<i64> {
        self.with_cursor(|bt, cur| {
            bt.check_cursor(cur, false)?;
            if bt.page_count() == 0 {
                return Ok(0);
            }
            bt.count_entries(cur.root)
        })
    }

    /// sqlite3BtreeRowCountEst: entries on the current leaf times the
    /// fan-out of every level above it.
    pub fn row_count_est(&mut self) -> Result<i64> {
        self.with_cursor(|bt, cur| {
            bt.ready(cur)?;
            if cur.path.is_empty() {
                bt.first_entry(cur)?;
                if cur.state != CursorState::Valid {
                    cur.path.clear();
                }
            }
            let Some(&(leaf_pgno, _)) = cur.path.last() else {
                return Ok(0);
            };
            let mut estimate = bt.cursor_page(cur, leaf_pgno)?.n_cell as i64;
            for &(pgno, _) in &cur.path[..cur.path.len() - 1] {
                estimate = estimate.saturating_mul(bt.cursor_page(cur, pgno)?.n_cell as i64 + 1);
            }
            Ok(estimate)
        })
    }

    /// sqlite3BtreeTableMoveto
    pub fn table_moveto(&mut self, rowid: RowId, bias: SeekBias) -> Result<SeekResult> {
        self.with_cursor(|bt, cur| {
            if !cur.int_key {
                return Err(Error::with_message(ErrorCode::Misuse, "rowid seek on an index"));
            }
            bt.moveto(cur, Target::Int(rowid), bias)
        })
    }

    /// sqlite3BtreeIndexMoveto
    pub fn index_moveto(&mut self, key: &UnpackedRecord<'_>, bias: SeekBias) -> Result<SeekResult> {
        self.with_cursor(|bt, cur| {
            if cur.int_key {
                return Err(Error::with_message(ErrorCode::Misuse, "key seek on a table"));
            }
            bt.moveto(cur, Target::Key(key), bias)
        })
    }

    /// sqlite3BtreeInsert
    ///
    /// With `USESEEKRESULT`, `seek_result` is the outcome of the seek that
    /// positioned the cursor and no new seek is made.
    pub fn insert(
        &mut self,
        payload: &BtreePayload,
        flags: BtreeInsertFlags,
        seek_result: Option<SeekResult>,
    ) -> Result<()> {
        self.with_cursor(|bt, cur| bt.cursor_insert(cur, payload, flags, seek_result))
    }

    /// sqlite3BtreeDelete. With `SAVEPOSITION` a following `next` lands on
    /// the entry after the deleted one.
    pub fn delete(&mut self, flags: BtreeInsertFlags) -> Result<()> {
        self.with_cursor(|bt, cur| bt.cursor_delete(cur, flags))
    }

    // ========================================================================
    // Accessors
    // ========================================================================

    /// sqlite3BtreeIntegerKey
    pub fn integer_key(&self) -> Result<RowId> {
        self.with_cursor(|bt, cur| {
            let (page, idx) = bt.current(cur)?;
            if !page.int_key {
                return Err(Error::with_message(ErrorCode::Misuse, "index entries have no rowid"));
            }
            page.int_key_at(idx)
        })
    }

    /// sqlite3BtreePayloadSize
    pub fn payload_size(&self) -> Result<u32> {
        self.with_cursor(|bt, cur| {
            let (page, idx) = bt.current(cur)?;
            Ok(page.cell_info(idx)?.n_payload)
        })
    }

    /// sqlite3BtreePayload
    pub fn payload(&self, offset: u32, amount: u32) -> Result<Vec<u8>> {
        self.with_cursor(|bt, cur| {
            let (page, idx) = bt.current(cur)?;
            bt.read_payload(&page, idx, offset, amount)
        })
    }

    /// sqlite3BtreePayloadChecked: like [`payload`](Self::payload) but also
    /// reports a tripped cursor's error.
    pub fn payload_checked(&self, offset: u32, amount: u32) -> Result<Vec<u8>> {
        self.with_cursor(|bt, cur| {
            if let Some(err) = &cur.fault {
                return Err(err.clone());
            }
            let (page, idx) = bt.current(cur)?;
            bt.read_payload(&page, idx, offset, amount)
        })
    }

    /// sqlite3BtreePayloadFetch: the part of the payload stored on the leaf.
    pub fn payload_fetch(&self) -> Result<Vec<u8>> {
        self.with_cursor(|bt, cur| {
            let (page, idx) = bt.current(cur)?;
            let (local, _) = page.local_payload(idx)?;
            Ok(local.to_vec())
        })
    }

    /// Whole key of an index entry.
    pub fn key(&self) -> Result<Vec<u8>> {
        self.with_cursor(|bt, cur| {
            let (page, idx) = bt.current(cur)?;
            if page.int_key {
                return Err(Error::with_message(ErrorCode::Misuse, "table entries have no key bytes"));
            }
            bt.cell_payload(&page, idx)
        })
    }

    /// Whole payload of the current entry.
    pub fn data(&self) -> Result<Vec<u8>> {
        self.with_cursor(|bt, cur| {
            let (page, idx) = bt.current(cur)?;
            bt.cell_payload(&page, idx)
        })
    }

    /// sqlite3BtreePutData: overwrite part of the current payload in place.
    pub fn put_data(&mut self, offset: u32, data: &[u8]) -> Result<()> {
        self.with_cursor(|bt, cur| {
            bt.check_cursor(cur, true)?;
            if !cur.int_key {
                return Err(Error::with_message(ErrorCode::ReadOnly, "index entries cannot be written in place"));
            }
            let (page, idx) = bt.current(cur)?;
            bt.atomically(|bt| bt.write_payload(page, idx, offset, data))
        })
    }

    // ========================================================================
    // Position bookkeeping and hints
    // ========================================================================

    /// sqlite3BtreeCursorHasMoved
    pub fn has_moved(&self) -> bool {
        self.peek(|c| c.state != CursorState::Valid, true)
    }

    /// sqlite3BtreeCursorRestore. Returns true if the cursor is back on the
    /// entry it was on, false if that entry is gone and the cursor sits on
    /// a neighbour (or nothing).
    pub fn restore(&mut self) -> Result<bool> {
        self.with_cursor(|bt, cur| {
            bt.check_cursor(cur, false)?;
            bt.restore_position(cur)
        })
    }

    /// Cursor introspection for tests and tooling (btree_cursor_info).
    /// `op` selects: 0 root page, 1 depth, 2 current page, 3 cell index,
    /// 4 cells on the current page. Unknown ops return Misuse.
    pub fn cursor_info(&self, op: i32) -> Result<i64> {
        self.shared.with(|bt| {
            let cur = bt
                .cursors
                .get(&self.id)
                .ok_or_else(|| Error::with_message(ErrorCode::Misuse, "cursor is closed"))?;
            let leaf = cur.path.last().copied();
            match op {
                0 => Ok(cur.root as i64),
                1 => Ok(cur.path.len() as i64),
                2 => Ok(leaf.map_or(0, |(pgno, _)| pgno as i64)),
                3 => Ok(leaf.map_or(-1, |(_, idx)| idx as i64)),
                4 => match leaf {
                    Some((pgno, _)) => Ok(bt.get_page(pgno)?.n_cell as i64),
                    None => Ok(0),
                },
                _ => Err(Error::with_message(ErrorCode::Misuse, format!("unknown cursor info op {}", op))),
            }
        })
    }

    /// sqlite3BtreeCursorHintFlags
    pub fn set_hint_flags(&mut self, flags: BtreeCursorFlags) -> Result<()> {
        self.with_cursor(|_, cur| {
            cur.hints = flags & (BtreeCursorFlags::BULKLOAD | BtreeCursorFlags::SEEK_EQ);
            Ok(())
        })
    }

    /// sqlite3BtreeCursorHasHint
    pub fn has_hint(&self, mask: BtreeCursorFlags) -> bool {
        self.peek(|c| c.hints.intersects(mask), false)
    }

    /// sqlite3BtreeCursorPin. A pinned cursor refuses to change the tree.
    pub fn pin(&mut self) -> Result<()> {
        self.with_cursor(|_, cur| {
            cur.pinned = true;
            Ok(())
        })
    }

    pub fn unpin(&mut self) -> Result<()> {
        self.with_cursor(|_, cur| {
            cur.pinned = false;
            Ok(())
        })
    }

    /// Payload for the next insert made with `PREFORMAT`.
    pub fn set_preformat_cell(&mut self, payload: Vec<u8>) -> Result<()> {
        self.with_cursor(|_, cur| {
            cur.preformat = Some(payload);
            Ok(())
        })
    }

    /// sqlite3BtreeTransferRow: copy the entry under `source` into this
    /// cursor's tree, as `rowid` when both are tables.
    pub fn transfer_row(&mut self, source: &BtCursor, rowid: RowId) -> Result<()> {
        let bytes = source.data()?;
        let payload = if self.peek(|c| c.int_key, true) {
            BtreePayload::table(rowid, Vec::new())
        } else {
            BtreePayload::index(bytes.clone())
        };
        self.set_preformat_cell(bytes)?;
        self.insert(&payload, BtreeInsertFlags::PREFORMAT, None)
    }

    /// sqlite3BtreeClearTableOfCursor: delete every entry of the tree under
    /// this cursor. Returns the number of entries removed.
    pub fn clear_table_of_cursor(&mut self) -> Result<i64> {
        self.with_cursor(|bt, cur| {
            bt.check_cursor(cur, true)?;
            let removed = bt.atomically(|bt| bt.clear_table(cur.root))?;
            cur.invalidate();
            cur.saved_key = None;
            Ok(removed)
        })
    }

    /// Iterate over (rowid, payload) of a table from the first entry.
    pub fn iter(&mut self) -> BtCursorIter<'_> {
        BtCursorIter {
            cursor: self,
            started: false,
        }
    }
}

impl Drop for BtCursor {
    fn drop(&mut self) {
        let guard = self.shared.inner.lock();
        if let Ok(mut bt) = guard.try_borrow_mut() {
            bt.cursors.remove(&self.id);
        };
    }
}

/// Iterator over the rows of a table tree, created by [`BtCursor::iter`].
pub struct BtCursorIter<'a> {
    cursor: &'a mut BtCursor,
    started: bool,
}

impl<'a> Iterator for BtCursorIter<'a> {
    type Item = Result<(RowId, Vec<u8>)>;

    fn next(&mut self) -> Option<Self::Item> {
        if !self.started {
            self.started = true;
            match self.cursor.first() {
                Ok(true) => return None,
                Ok(false) => {}
                Err(e) => return Some(Err(e)),
            }
        } else {
            match self.cursor.next() {
                Ok(()) if self.cursor.eof() => return None,
                Ok(()) => {}
                Err(e) => return Some(Err(e)),
            }
        }
        Some(
            self.cursor
                .integer_key()
                .and_then(|rowid| Ok((rowid, self.cursor.data()?))),
        )
    }
}
