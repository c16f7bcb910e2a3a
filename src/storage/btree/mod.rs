//! B-tree implementation
//!
//! A [`Btree`] is one connection to a database file. Connections opened with
//! the shared-cache setting on the same file attach to one [`BtShared`],
//! which owns the pager and everything derived from page 1. Access to the
//! shared state is serialized by a reentrant mutex; [`Btree::enter`] holds it
//! across several calls.

mod balance;
mod cursor;
mod encoding;
mod freelist;
mod integrity;
mod lock;
mod overflow;
mod page;
mod trans;
mod types;
mod vacuum;

use std::any::Any;
use std::cell::RefCell;
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use lazy_static::lazy_static;
use parking_lot::{Mutex, ReentrantMutex, ReentrantMutexGuard};
use tracing::{debug, warn};

use crate::config::{AutoVacuum, BtreeConfig};
use crate::error::{Error, ErrorCode, Result};
use crate::os::vfs::{StdVfs, Vfs};
use crate::storage::pager::{DbPage, Pager, PagerOpenFlags};
use crate::types::{BtreeId, Pgno, TxnId};

pub use cursor::{BtCursor, BtCursorIter};
pub use encoding::{read_u16, read_u32, read_varint, read_varint32, varint_len, write_u16, write_u32, write_varint};
pub use integrity::IntegrityReport;
pub use page::MemPage;
pub use trans::RUSTQL_VERSION_NUMBER;
pub use types::*;

use cursor::{CursorId, CursorInner};
use encoding::{read_u32 as get_u32, write_u32 as put_u32};

lazy_static! {
    /// Shared states open with the shared-cache setting, by canonical path.
    static ref SHARED_CACHE_LIST: Mutex<HashMap<String, Weak<SharedHandle>>> = Mutex::new(HashMap::new());
}

static NEXT_BTREE_ID: AtomicU64 = AtomicU64::new(1);

/// Per-connection state kept in the shared state.
#[derive(Clone, Copy, Debug)]
pub(crate) struct ConnState {
    pub(crate) in_trans: TransState,
}

impl Default for ConnState {
    fn default() -> Self {
        ConnState {
            in_trans: TransState::None,
        }
    }
}

/// State shared by every connection to one database file.
pub struct BtShared {
    pub(crate) pager: Pager,
    pub(crate) config: BtreeConfig,
    pub(crate) open_flags: BtreeOpenFlags,
    pub(crate) page_size: u32,
    pub(crate) usable_size: u32,
    pub(crate) reserve: u8,
    pub(crate) auto_vacuum: bool,
    pub(crate) incr_vacuum: bool,
    pub(crate) bts_flags: BtsFlags,
    /// Strongest transaction held by any connection
    pub(crate) in_transaction: TransState,
    pub(crate) writer: Option<BtreeId>,
    pub(crate) conns: HashMap<BtreeId, ConnState>,
    pub(crate) locks: Vec<BtTableLockEntry>,
    pub(crate) cursors: HashMap<CursorId, CursorInner>,
    pub(crate) next_cursor_id: CursorId,
    pub(crate) sharable: bool,
    /// Caller-defined schema object, one per shared state
    pub(crate) schema: Option<Arc<dyn Any + Send + Sync>>,
}

impl BtShared {
    pub(crate) fn conn_trans(&self, id: BtreeId) -> TransState {
        self.conns.get(&id).map_or(TransState::None, |c| c.in_trans)
    }

    pub(crate) fn limits(&self, pgno: Pgno) -> PageLimits {
        PageLimits::for_page(pgno, self.page_size, self.usable_size)
    }

    /// Database size in pages as the current transaction sees it.
    pub(crate) fn page_count(&self) -> Pgno {
        self.pager.page_count()
    }

    pub(crate) fn secure_delete(&self) -> bool {
        self.bts_flags.contains(BtsFlags::SECURE_DELETE)
    }

    /// Page image for any page inside the file.
    pub(crate) fn raw_page(&mut self, pgno: Pgno) -> Result<DbPage> {
        if pgno == 0 || pgno > self.page_count() {
            return Err(Error::corrupt_page(pgno, format!("page outside file of {} pages", self.page_count())));
        }
        self.pager.get(pgno)
    }

    /// A zeroed image, not yet part of the transaction.
    pub(crate) fn zero_page(&self, pgno: Pgno) -> DbPage {
        DbPage::new(pgno, vec![0u8; self.page_size as usize])
    }

    /// Load and validate a tree page (btreeGetPage + btreeInitPage).
    pub(crate) fn get_page(&mut self, pgno: Pgno) -> Result<MemPage> {
        let limits = self.limits(pgno);
        MemPage::parse(self.raw_page(pgno)?, limits)
    }

    pub(crate) fn write_page(&mut self, page: MemPage) -> Result<()> {
        self.pager.write(page.into_page())
    }

    pub(crate) fn write_raw(&mut self, page: DbPage) -> Result<()> {
        self.pager.write(page)
    }

    pub(crate) fn header_u32(&mut self, offset: usize) -> Result<u32> {
        if self.page_count() == 0 {
            return Ok(0);
        }
        let page1 = self.raw_page(1)?;
        get_u32(&page1, offset).ok_or_else(|| Error::corrupt_page(1, format!("header offset {}", offset)))
    }

    pub(crate) fn put_header_u32(&mut self, offset: usize, value: u32) -> Result<()> {
        let mut page1 = self.raw_page(1)?;
        put_u32(page1.make_mut(), offset, value)?;
        self.write_raw(page1)
    }

    /// Free every page below `root` and leave `root` an empty leaf of the
    /// same kind (clearDatabasePage). Returns the number of entries removed.
    pub(crate) fn clear_table(&mut self, root: Pgno) -> Result<i64> {
        self.save_all_cursors(Some(root))?;
        let int_key = self.get_page(root)?.int_key;
        let removed = self.clear_subtree(root, 0)?;
        let flags = if int_key { PTF_TABLE_LEAF } else { PTF_INDEX_LEAF };
        let image = if root == 1 { self.raw_page(1)? } else { self.zero_page(root) };
        let page = MemPage::init(image, flags, self.limits(root));
        self.write_page(page)?;
        debug!(root, removed, "cleared tree");
        Ok(removed)
    }

    fn clear_subtree(&mut self, pgno: Pgno, depth: usize) -> Result<i64> {
        if depth > BTCURSOR_MAX_DEPTH {
            return Err(Error::corrupt_page(pgno, "tree is too deep"));
        }
        let page = self.get_page(pgno)?;
        for i in 0..page.n_cell {
            self.clear_cell(&page, i)?;
        }
        let mut removed = 0i64;
        if page.leaf {
            removed += page.n_cell as i64;
        } else {
            for i in 0..=page.n_cell {
                removed += self.clear_subtree(page.child(i)?, depth + 1)?;
            }
        }
        if depth > 0 {
            self.free_page(pgno)?;
        }
        Ok(removed)
    }

    /// Put cursors into the fault state so that every later call returns
    /// `err` (sqlite3BtreeTripAllCursors). With `write_only`, read cursors
    /// are saved instead.
    pub(crate) fn trip_all_cursors(&mut self, root: Option<Pgno>, err: Error, write_only: bool) {
        let ids: Vec<CursorId> = self
            .cursors
            .iter()
            .filter(|(_, c)| root.map_or(true, |r| c.root == r))
            .map(|(id, _)| *id)
            .collect();
        for id in ids {
            let Some(mut cur) = self.cursors.remove(&id) else { continue };
            let trip = !write_only || cur.write || self.save_position(&mut cur).is_err();
            if trip {
                cur.state = CursorState::Fault;
                cur.path.clear();
                cur.fault = Some(err.clone());
            }
            self.cursors.insert(id, cur);
        }
    }
}

/// Handle to shared state plus its registry key.
pub struct SharedHandle {
    pub(crate) inner: ReentrantMutex<RefCell<BtShared>>,
    key: Option<String>,
}

impl SharedHandle {
    /// Run `op` with exclusive access to the shared state.
    pub(crate) fn with<R>(&self, op: impl FnOnce(&mut BtShared) -> Result<R>) -> Result<R> {
        let guard = self.inner.lock();
        let mut bt = guard
            .try_borrow_mut()
            .map_err(|_| Error::with_message(ErrorCode::Misuse, "b-tree used re-entrantly from within an operation"))?;
        op(&mut bt)
    }
}

impl Drop for SharedHandle {
    fn drop(&mut self) {
        if let Some(key) = &self.key {
            let mut list = SHARED_CACHE_LIST.lock();
            if list.get(key).is_some_and(|w| w.strong_count() == 0) {
                list.remove(key);
            }
        }
    }
}

/// Holds the shared-state mutex for a sequence of calls (sqlite3BtreeEnter).
pub struct BtreeGuard<'a> {
    _guard: ReentrantMutexGuard<'a, RefCell<BtShared>>,
}

/// A connection to a database (Btree).
pub struct Btree {
    pub(crate) shared: Arc<SharedHandle>,
    pub(crate) id: BtreeId,
    sharable: bool,
    closed: bool,
}

impl std::fmt::Debug for Btree {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Btree")
            .field("id", &self.id)
            .field("sharable", &self.sharable)
            .finish()
    }
}

impl Btree {
    /// sqlite3BtreeOpen. `path == None` (or the MEMORY flag) opens a private
    /// in-memory database.
    pub fn open(path: Option<&Path>, flags: BtreeOpenFlags, config: BtreeConfig) -> Result<Btree> {
        Self::open_with_vfs(Arc::new(StdVfs), path, flags, config)
    }

    pub fn open_with_vfs(
        vfs: Arc<dyn Vfs>,
        path: Option<&Path>,
        flags: BtreeOpenFlags,
        config: BtreeConfig,
    ) -> Result<Btree> {
        let config = config.apply_flags(flags);
        config.validate()?;
        let memory = path.is_none() || flags.contains(BtreeOpenFlags::MEMORY);
        let id = NEXT_BTREE_ID.fetch_add(1, Ordering::Relaxed);

        let key = match path {
            Some(p) if !memory && config.shared_cache && cfg!(feature = "shared-cache") => {
                Some(format!("{}:{}", vfs.name(), vfs.full_pathname(p)?.display()))
            }
            _ => None,
        };

        let mut list = SHARED_CACHE_LIST.lock();
        if let Some(shared) = key.as_ref().and_then(|k| list.get(k)).and_then(Weak::upgrade) {
            drop(list);
            shared.with(|bt| {
                bt.conns.insert(id, ConnState::default());
                Ok(())
            })?;
            debug!(btree = id, "attached to shared cache");
            return Ok(Btree {
                shared,
                id,
                sharable: true,
                closed: false,
            });
        }

        let mut pager_flags = PagerOpenFlags::empty();
        if memory {
            pager_flags |= PagerOpenFlags::MEMORY;
        }
        if flags.contains(BtreeOpenFlags::OMIT_JOURNAL) {
            pager_flags |= PagerOpenFlags::OMIT_JOURNAL;
        }
        if config.read_only {
            pager_flags |= PagerOpenFlags::READ_ONLY;
        }
        let mut pager = Pager::open(vfs, if memory { None } else { path }, pager_flags, config.page_size, config.cache_size)
            .map_err(|e| e.context("open"))?;
        pager.set_max_page_count(config.max_page_count);
        let page_size = pager.page_size();

        let mut bts_flags = BtsFlags::empty();
        if config.read_only {
            bts_flags |= BtsFlags::READ_ONLY;
        }
        if config.secure_delete {
            bts_flags |= BtsFlags::SECURE_DELETE;
        }
        let sharable = key.is_some();
        let mut shared = BtShared {
            pager,
            open_flags: flags,
            page_size,
            usable_size: page_size - config.reserve_bytes as u32,
            reserve: config.reserve_bytes,
            auto_vacuum: config.auto_vacuum != AutoVacuum::None,
            incr_vacuum: config.auto_vacuum == AutoVacuum::Incremental,
            config,
            bts_flags,
            in_transaction: TransState::None,
            writer: None,
            conns: HashMap::new(),
            locks: Vec::new(),
            cursors: HashMap::new(),
            next_cursor_id: 1,
            sharable,
            schema: None,
        };
        shared.conns.insert(id, ConnState::default());
        let handle = Arc::new(SharedHandle {
            inner: ReentrantMutex::new(RefCell::new(shared)),
            key: key.clone(),
        });
        if let Some(key) = key {
            list.insert(key, Arc::downgrade(&handle));
        }
        drop(list);
        debug!(btree = id, memory, sharable, "opened database");
        Ok(Btree {
            shared: handle,
            id,
            sharable,
            closed: false,
        })
    }

    /// sqlite3BtreeClose: roll back any open transaction and detach. Cursors
    /// of this connection stop working.
    pub fn close(mut self) -> Result<()> {
        self.closed = true;
        self.detach()
    }

    fn detach(&self) -> Result<()> {
        self.shared.with(|bt| {
            let result = bt.rollback(self.id);
            bt.cursors.retain(|_, c| c.btree_id != self.id);
            bt.clear_table_locks(self.id);
            bt.conns.remove(&self.id);
            debug!(btree = self.id, remaining = bt.conns.len(), "closed connection");
            result
        })
    }

    /// sqlite3BtreeEnter: hold the shared-state mutex until the guard drops.
    pub fn enter(&self) -> BtreeGuard<'_> {
        BtreeGuard {
            _guard: self.shared.inner.lock(),
        }
    }

    /// sqlite3BtreeCursor. `key_info == None` opens a cursor on an int-key
    /// table; `Some` on an index.
    pub fn cursor(&self, root: Pgno, flags: BtreeCursorFlags, key_info: Option<Arc<KeyInfo>>) -> Result<BtCursor> {
        let write = flags.contains(BtreeCursorFlags::WRCSR);
        let cursor_id = self.shared.with(|bt| {
            let trans = bt.conn_trans(self.id);
            if trans == TransState::None {
                return Err(Error::with_message(ErrorCode::Misuse, "cursor opened outside a transaction"));
            }
            if write && (trans != TransState::Write || bt.bts_flags.contains(BtsFlags::READ_ONLY)) {
                return Err(Error::with_message(ErrorCode::ReadOnly, "write cursor without a write transaction"));
            }
            if root < 1 || (bt.page_count() > 0 && root > bt.page_count()) {
                return Err(Error::corrupt_page(root, "cursor root outside the file"));
            }
            bt.set_table_lock(self.id, root, if write { BtLock::Write } else { BtLock::Read })?;
            let cursor_id = bt.next_cursor_id;
            bt.next_cursor_id += 1;
            bt.cursors.insert(cursor_id, CursorInner::new(self.id, root, flags, key_info));
            Ok(cursor_id)
        })?;
        Ok(BtCursor {
            shared: Arc::clone(&self.shared),
            btree_id: self.id,
            id: cursor_id,
            root,
        })
    }

    fn require_write(bt: &BtShared, id: BtreeId) -> Result<()> {
        if bt.conn_trans(id) != TransState::Write {
            return Err(Error::with_message(ErrorCode::Misuse, "no write transaction"));
        }
        Ok(())
    }

    /// sqlite3BtreeCreateTable. `kind` is `BTREE_INTKEY` or `BTREE_BLOBKEY`.
    pub fn create_table(&self, kind: u8) -> Result<Pgno> {
        self.shared.with(|bt| {
            Self::require_write(bt, self.id)?;
            bt.atomically(|bt| bt.create_table(kind))
        })
    }

    /// sqlite3BtreeDropTable. Returns the old page number of a root that
    /// moved into the freed slot (auto-vacuum only).
    pub fn drop_table(&self, root: Pgno) -> Result<Option<Pgno>> {
        self.shared.with(|bt| {
            Self::require_write(bt, self.id)?;
            bt.set_table_lock(self.id, root, BtLock::Write)?;
            bt.atomically(|bt| bt.drop_table(root))
        })
    }

    /// sqlite3BtreeClearTable. Returns the number of entries removed.
    pub fn clear_table(&self, root: Pgno) -> Result<i64> {
        self.shared.with(|bt| {
            Self::require_write(bt, self.id)?;
            bt.set_table_lock(self.id, root, BtLock::Write)?;
            bt.atomically(|bt| bt.clear_table(root))
        })
    }

    /// sqlite3BtreeCopyFile: replace the content of this database with a copy
    /// of `from`. Needs a write transaction here and any transaction on
    /// `from`. Both databases must use the same page size. Cursors open on
    /// this database are tripped with `Abort`.
    pub fn copy_file(&self, from: &Btree) -> Result<()> {
        if Arc::ptr_eq(&self.shared, &from.shared) {
            return Err(Error::with_message(ErrorCode::Misuse, "cannot copy a database onto itself"));
        }
        let (page_size, images) = from.shared.with(|src| {
            if src.conn_trans(from.id) == TransState::None {
                return Err(Error::with_message(ErrorCode::Misuse, "copy source has no transaction"));
            }
            let mut images = Vec::with_capacity(src.page_count() as usize);
            for pgno in 1..=src.page_count() {
                images.push(src.raw_page(pgno)?.data().to_vec());
            }
            Ok((src.page_size, images))
        })?;
        if images.is_empty() {
            return Err(Error::with_message(ErrorCode::Empty, "copy source has no pages"));
        }
        self.shared.with(|bt| {
            Self::require_write(bt, self.id)?;
            if bt.page_size != page_size {
                return Err(Error::with_message(
                    ErrorCode::ReadOnly,
                    format!("page size {} differs from source page size {}", bt.page_size, page_size),
                ));
            }
            bt.set_table_lock(self.id, SCHEMA_ROOT, BtLock::Write)?;
            bt.trip_all_cursors(None, Error::with_message(ErrorCode::Abort, "database replaced by a copy"), false);
            let n_pages = images.len() as Pgno;
            bt.atomically(|bt| {
                for (pgno, image) in (1..).zip(images) {
                    bt.write_raw(DbPage::new(pgno, image))?;
                }
                bt.pager.truncate_image(n_pages);
                bt.lock_btree()
            })?;
            debug!(btree = self.id, pages = n_pages, "copied database");
            Ok(())
        })
    }

    /// sqlite3BtreeSchema: the schema object of the shared state, built by
    /// `init` on first use. Every connection attached to the same shared
    /// state sees the same object.
    pub fn schema<T, F>(&self, init: F) -> Result<Arc<T>>
    where
        T: Any + Send + Sync,
        F: FnOnce() -> T,
    {
        self.shared.with(|bt| {
            if let Some(existing) = &bt.schema {
                return Arc::clone(existing)
                    .downcast::<T>()
                    .map_err(|_| Error::with_message(ErrorCode::Misuse, "schema object has another type"));
            }
            let schema = Arc::new(init());
            let slot: Arc<dyn Any + Send + Sync> = schema.clone();
            bt.schema = Some(slot);
            Ok(schema)
        })
    }

    /// sqlite3BtreeGetMeta
    pub fn get_meta(&self, idx: usize) -> Result<u32> {
        if idx >= SQLITE_N_BTREE_META {
            return Err(Error::new(ErrorCode::Range));
        }
        self.shared.with(|bt| {
            if idx == BTREE_DATA_VERSION {
                return Ok(bt.pager.data_version() as u32);
            }
            if bt.conn_trans(self.id) == TransState::None {
                return Err(Error::with_message(ErrorCode::Misuse, "meta read outside a transaction"));
            }
            bt.header_u32(HDR_META + 4 * idx)
        })
    }

    /// sqlite3BtreeUpdateMeta. Slot 0 and the data version are derived and
    /// cannot be written.
    pub fn update_meta(&self, idx: usize, value: u32) -> Result<()> {
        if idx == BTREE_FREE_PAGE_COUNT || idx >= BTREE_DATA_VERSION {
            return Err(Error::new(ErrorCode::Range));
        }
        self.shared.with(|bt| {
            Self::require_write(bt, self.id)?;
            bt.put_header_u32(HDR_META + 4 * idx, value)?;
            if idx == BTREE_INCR_VACUUM && bt.auto_vacuum {
                bt.incr_vacuum = value != 0;
            }
            Ok(())
        })
    }

    /// Commit counter of the image this connection reads.
    pub fn data_version(&self) -> TxnId {
        self.shared.with(|bt| Ok(bt.pager.data_version())).unwrap_or(0)
    }

    /// sqlite3BtreeSetPageSize. `reserve < 0` keeps the current reserve.
    /// With `fix` the size can no longer change.
    pub fn set_page_size(&self, page_size: u32, reserve: i32, fix: bool) -> Result<()> {
        self.shared.with(|bt| {
            if bt.bts_flags.contains(BtsFlags::PAGESIZE_FIXED) {
                return Err(Error::with_message(ErrorCode::ReadOnly, "page size is fixed"));
            }
            let reserve = if reserve < 0 { bt.reserve } else { reserve.min(255) as u8 };
            if !(MIN_PAGE_SIZE..=MAX_PAGE_SIZE).contains(&page_size)
                || !page_size.is_power_of_two()
                || page_size - (reserve as u32) < MIN_USABLE_SIZE
            {
                return Err(Error::with_message(ErrorCode::Misuse, format!("invalid page size {}", page_size)));
            }
            bt.pager.set_page_size(page_size)?;
            bt.page_size = page_size;
            bt.reserve = reserve;
            bt.usable_size = page_size - reserve as u32;
            bt.config.page_size = page_size;
            bt.config.reserve_bytes = reserve;
            if fix {
                bt.bts_flags |= BtsFlags::PAGESIZE_FIXED;
            }
            Ok(())
        })
    }

    /// sqlite3BtreeGetPageSize
    pub fn page_size(&self) -> u32 {
        self.shared.with(|bt| Ok(bt.page_size)).unwrap_or(DEFAULT_PAGE_SIZE)
    }

    /// sqlite3BtreeGetReserveNoMutex
    pub fn reserve_bytes(&self) -> u32 {
        self.shared.with(|bt| Ok(bt.page_size - bt.usable_size)).unwrap_or(0)
    }

    /// sqlite3BtreeSetCacheSize
    pub fn set_cache_size(&self, pages: i32) -> Result<()> {
        self.shared.with(|bt| {
            bt.pager.set_cache_size(pages);
            Ok(())
        })
    }

    /// sqlite3BtreeSetSpillSize. Returns the previous spill size.
    pub fn set_spill_size(&self, pages: i32) -> Result<i32> {
        self.shared.with(|bt| Ok(bt.pager.set_spill_size(pages)))
    }

    /// sqlite3BtreeMaxPageCount. `0` only queries the limit.
    pub fn max_page_count(&self, max: Pgno) -> Result<Pgno> {
        self.shared.with(|bt| Ok(bt.pager.set_max_page_count(max)))
    }

    /// sqlite3BtreeLastPage
    pub fn last_page(&self) -> Result<Pgno> {
        self.shared.with(|bt| Ok(bt.page_count()))
    }

    /// sqlite3BtreeSecureDelete. `None` only queries the setting.
    pub fn secure_delete(&self, on: Option<bool>) -> bool {
        self.shared
            .with(|bt| {
                if let Some(on) = on {
                    bt.bts_flags.set(BtsFlags::SECURE_DELETE, on);
                }
                Ok(bt.secure_delete())
            })
            .unwrap_or(false)
    }

    /// sqlite3BtreeSetAutoVacuum. Switching between off and on is only
    /// possible before the database has content.
    pub fn set_auto_vacuum(&self, mode: AutoVacuum) -> Result<()> {
        self.shared.with(|bt| {
            let on = mode != AutoVacuum::None;
            if bt.bts_flags.contains(BtsFlags::PAGESIZE_FIXED) && on != bt.auto_vacuum {
                return Err(Error::with_message(ErrorCode::ReadOnly, "auto-vacuum mode is fixed"));
            }
            bt.auto_vacuum = on;
            bt.incr_vacuum = mode == AutoVacuum::Incremental;
            bt.config.auto_vacuum = mode;
            Ok(())
        })
    }

    /// sqlite3BtreeGetAutoVacuum
    pub fn get_auto_vacuum(&self) -> AutoVacuum {
        self.shared
            .with(|bt| {
                Ok(match (bt.auto_vacuum, bt.incr_vacuum) {
                    (false, _) => AutoVacuum::None,
                    (true, false) => AutoVacuum::Full,
                    (true, true) => AutoVacuum::Incremental,
                })
            })
            .unwrap_or_default()
    }

    /// sqlite3BtreeIncrVacuum: move up to `pages` pages from the end of the
    /// file. Returns true while free pages remain.
    pub fn incr_vacuum(&self, pages: u32) -> Result<bool> {
        self.shared.with(|bt| {
            Self::require_write(bt, self.id)?;
            bt.atomically(|bt| bt.incr_vacuum(pages))
        })
    }

    /// sqlite3BtreeTripAllCursors
    pub fn trip_all_cursors(&self, err: Error, write_only: bool) -> Result<()> {
        self.shared.with(|bt| {
            bt.trip_all_cursors(None, err, write_only);
            Ok(())
        })
    }

    /// sqlite3BtreeGetFilename. Empty for in-memory databases.
    pub fn filename(&self) -> String {
        self.shared.with(|bt| Ok(bt.pager.filename())).unwrap_or_default()
    }

    /// sqlite3BtreeGetJournalname
    pub fn journal_name(&self) -> Option<String> {
        self.shared
            .with(|bt| Ok(bt.pager.journal_name().map(|p| p.display().to_string())))
            .ok()
            .flatten()
    }

    /// sqlite3BtreeIsReadonly
    pub fn is_readonly(&self) -> bool {
        self.shared
            .with(|bt| Ok(bt.bts_flags.contains(BtsFlags::READ_ONLY) || bt.pager.is_readonly()))
            .unwrap_or(true)
    }

    pub fn is_memdb(&self) -> bool {
        self.shared.with(|bt| Ok(bt.pager.is_memdb())).unwrap_or(false)
    }

    /// sqlite3BtreeSharable
    pub fn sharable(&self) -> bool {
        self.sharable
    }

    /// sqlite3BtreeConnectionCount
    pub fn connection_count(&self) -> usize {
        self.shared.with(|bt| Ok(bt.conns.len())).unwrap_or(1)
    }

    /// Open flags the shared state was created with.
    pub fn open_flags(&self) -> BtreeOpenFlags {
        self.shared.with(|bt| Ok(bt.open_flags)).unwrap_or(BtreeOpenFlags::empty())
    }

    /// (hits, misses) of the page cache.
    pub fn cache_stats(&self) -> (u64, u64) {
        self.shared.with(|bt| Ok(bt.pager.cache_stats())).unwrap_or((0, 0))
    }
}

impl Drop for Btree {
    fn drop(&mut self) {
        if self.closed {
            return;
        }
        if let Err(err) = self.detach() {
            warn!(btree = self.id, error = %err, "error closing connection");
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn memory_db() -> Btree {
        Btree::open(None, BtreeOpenFlags::MEMORY, BtreeConfig::default()).unwrap()
    }

    /// In-memory database inside a write transaction.
    pub(crate) fn scratch(auto_vacuum: bool) -> (Btree, Arc<SharedHandle>) {
        let mode = if auto_vacuum { AutoVacuum::Full } else { AutoVacuum::None };
        let db = Btree::open(None, BtreeOpenFlags::MEMORY, BtreeConfig::default().auto_vacuum(mode)).unwrap();
        db.begin_trans(true).unwrap();
        let shared = Arc::clone(&db.shared);
        (db, shared)
    }

    #[test]
    fn test_meta_round_trip() {
        let (db, _) = scratch(false);
        db.update_meta(BTREE_USER_VERSION, 42).unwrap();
        assert_eq!(db.get_meta(BTREE_USER_VERSION).unwrap(), 42);
        assert_eq!(db.update_meta(BTREE_FREE_PAGE_COUNT, 1).unwrap_err().code, ErrorCode::Range);
        assert_eq!(db.get_meta(SQLITE_N_BTREE_META).unwrap_err().code, ErrorCode::Range);
        db.commit().unwrap();
        db.begin_trans(false).unwrap();
        assert_eq!(db.get_meta(BTREE_USER_VERSION).unwrap(), 42);
    }

    #[test]
    fn test_page_size_fixed_after_first_write() {
        let db = memory_db();
        db.set_page_size(1024, 0, false).unwrap();
        assert_eq!(db.page_size(), 1024);
        db.begin_trans(true).unwrap();
        assert_eq!(db.set_page_size(2048, 0, false).unwrap_err().code, ErrorCode::ReadOnly);
        assert_eq!(db.last_page().unwrap(), 1);
    }

    #[test]
    fn test_clear_table_counts_rows() {
        let (db, _) = scratch(false);
        let root = db.create_table(BTREE_INTKEY).unwrap();
        {
            let mut cur = db.cursor(root, BtreeCursorFlags::WRCSR, None).unwrap();
            for rowid in 0..300 {
                cur.insert(&BtreePayload::table(rowid, vec![1u8; 100]), BtreeInsertFlags::empty(), None)
                    .unwrap();
            }
        }
        let before = db.last_page().unwrap();
        assert_eq!(db.clear_table(root).unwrap(), 300);
        let mut cur = db.cursor(root, BtreeCursorFlags::empty(), None).unwrap();
        assert!(cur.first().unwrap());
        let guard = db.shared.inner.lock();
        let mut bt = guard.borrow_mut();
        assert_eq!(bt.free_page_count().unwrap() + 2, before);
    }

    #[test]
    fn test_cursor_requires_transaction() {
        let db = memory_db();
        assert_eq!(db.cursor(1, BtreeCursorFlags::empty(), None).unwrap_err().code, ErrorCode::Misuse);
        db.begin_trans(false).unwrap();
        assert_eq!(
            db.cursor(1, BtreeCursorFlags::WRCSR, None).unwrap_err().code,
            ErrorCode::ReadOnly
        );
    }

    fn fill_rows(db: &Btree, root: Pgno, rows: std::ops::Range<i64>, len: usize) {
        let mut cur = db.cursor(root, BtreeCursorFlags::WRCSR, None).unwrap();
        for rowid in rows {
            cur.insert(&BtreePayload::table(rowid, vec![rowid as u8; len]), BtreeInsertFlags::empty(), None)
                .unwrap();
        }
    }

    #[test]
    fn test_copy_file_replaces_content() {
        let source = memory_db();
        source.begin_trans(true).unwrap();
        let root = source.create_table(BTREE_INTKEY).unwrap();
        fill_rows(&source, root, 0..200, 300);
        source.update_meta(BTREE_USER_VERSION, 7).unwrap();
        source.commit().unwrap();

        let target = memory_db();
        target.begin_trans(true).unwrap();
        let stale = target.create_table(BTREE_INTKEY).unwrap();
        let extra = target.create_table(BTREE_INTKEY).unwrap();
        fill_rows(&target, extra, 0..2000, 500);
        let mut open = target.cursor(stale, BtreeCursorFlags::empty(), None).unwrap();
        assert!(target.last_page().unwrap() > 200);

        assert_eq!(target.copy_file(&source).unwrap_err().code, ErrorCode::Misuse);
        source.begin_trans(false).unwrap();
        target.copy_file(&source).unwrap();
        assert_eq!(open.first().unwrap_err().code, ErrorCode::Abort);
        drop(open);
        assert_eq!(target.last_page().unwrap(), source.last_page().unwrap());
        source.commit().unwrap();
        target.commit().unwrap();

        target.begin_trans(false).unwrap();
        assert_eq!(target.get_meta(BTREE_USER_VERSION).unwrap(), 7);
        let mut cur = target.cursor(root, BtreeCursorFlags::empty(), None).unwrap();
        assert_eq!(cur.count().unwrap(), 200);
        cur.table_moveto(150, SeekBias::None).unwrap();
        assert_eq!(cur.data().unwrap(), vec![150u8; 300]);
        drop(cur);
        let report = target.integrity_check(&[root], 10).unwrap();
        assert!(report.is_ok(), "{:?}", report.errors);
    }

    #[test]
    fn test_copy_file_needs_matching_page_size() {
        let source = Btree::open(None, BtreeOpenFlags::MEMORY, BtreeConfig::default().page_size(1024)).unwrap();
        source.begin_trans(true).unwrap();
        source.commit().unwrap();
        source.begin_trans(false).unwrap();
        let (target, _) = scratch(false);
        assert_eq!(target.copy_file(&source).unwrap_err().code, ErrorCode::ReadOnly);
        assert_eq!(target.copy_file(&target).unwrap_err().code, ErrorCode::Misuse);
    }

    #[test]
    fn test_schema_object_is_created_once() {
        let db = memory_db();
        let mut calls = 0;
        let first = db
            .schema(|| {
                calls += 1;
                Mutex::new(vec![String::from("t1")])
            })
            .unwrap();
        first.lock().push(String::from("t2"));
        let again = db.schema(|| Mutex::new(Vec::<String>::new())).unwrap();
        assert_eq!(calls, 1);
        assert!(Arc::ptr_eq(&first, &again));
        assert_eq!(again.lock().len(), 2);
        assert_eq!(db.schema(|| 0u32).unwrap_err().code, ErrorCode::Misuse);
    }

    #[test]
    fn test_secure_delete_toggle() {
        let db = memory_db();
        assert!(!db.secure_delete(None));
        assert!(db.secure_delete(Some(true)));
        assert!(db.secure_delete(None));
    }
}
