//! Page provider
//!
//! The Pager hands out fixed-size pages by number, keeps the pages dirtied by
//! the current write transaction, journals their prior contents for nested
//! savepoints, and commits or rolls back the whole page set atomically.
//!
//! Every pager bound to the same file shares one [`PagerFile`]. Committed
//! page images are versioned there: a reader pins the commit counter it saw
//! at `begin_read` and keeps seeing exactly that image until `end_read`,
//! even while another pager commits over it. Only one pager may write at a
//! time, and only from the newest snapshot.

use std::collections::HashMap;
use std::ops::Deref;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use bitflags::bitflags;
use lazy_static::lazy_static;
use parking_lot::Mutex;
use tracing::{debug, trace, warn};

use crate::error::{Error, ErrorCode, Result};
use crate::os::vfs::{OpenFlags, SyncFlags, Vfs, VfsFile};
use crate::storage::pcache::PCache;
use crate::types::{Pgno, TxnId};

// ============================================================================
// Constants
// ============================================================================

/// Journal header magic number
pub const JOURNAL_MAGIC: [u8; 8] = [0xd9, 0xd5, 0x05, 0xf9, 0x20, 0xa1, 0x63, 0xd7];

/// Size of the journal header in bytes
pub const JOURNAL_HEADER_SIZE: usize = 28;

/// Sector size recorded in journal headers
const JOURNAL_SECTOR_SIZE: u32 = 512;

/// Largest page number a pager will hand out
pub const PAGER_MAX_PGNO: Pgno = 0xFFFF_FFFE;

// ============================================================================
// Pager Flags
// ============================================================================

bitflags! {
    /// Flags for `Pager::open`
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PagerOpenFlags: u32 {
        /// Do not write a rollback journal
        const OMIT_JOURNAL = 0x0001;
        /// In-memory database
        const MEMORY = 0x0002;
        /// Open without write intent
        const READ_ONLY = 0x0004;
    }
}

// ============================================================================
// Enums
// ============================================================================

/// Pager state machine states
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(i32)]
pub enum PagerState {
    /// No snapshot held
    Open = 0,
    /// Snapshot held, can read
    Reader = 1,
    /// Write lock held, pages may be dirtied
    Writer = 2,
    /// Journal written and synced, ready for phase two
    WriterLocked = 3,
    /// Phase-two commit failed; the pager must be reopened
    Error = 5,
}

/// Savepoint operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SavepointOp {
    /// Begin a new savepoint
    Begin,
    /// Release (commit) savepoint
    Release,
    /// Rollback to savepoint
    Rollback,
}

// ============================================================================
// Page handle
// ============================================================================

/// A page image borrowed from the pager (DbPage in SQLite).
///
/// The buffer is shared with the pager until [`DbPage::make_mut`] is called,
/// which copies it on first write. Changes become part of the transaction
/// only when the page is handed back through [`Pager::write`].
#[derive(Clone, Debug)]
pub struct DbPage {
    pgno: Pgno,
    data: Arc<Vec<u8>>,
}

impl DbPage {
    pub fn new(pgno: Pgno, data: Vec<u8>) -> Self {
        Self {
            pgno,
            data: Arc::new(data),
        }
    }

    pub fn pgno(&self) -> Pgno {
        self.pgno
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Writable view of the page content.
    pub fn make_mut(&mut self) -> &mut [u8] {
        Arc::make_mut(&mut self.data).as_mut_slice()
    }

    /// Rebind the image to another page number.
    pub fn set_pgno(&mut self, pgno: Pgno) {
        self.pgno = pgno;
    }
}

impl Deref for DbPage {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.data
    }
}

// ============================================================================
// Savepoint
// ============================================================================

/// One level of the savepoint stack.
struct Savepoint {
    /// Database size when the savepoint opened
    orig_db_size: Pgno,
    /// Dirty state of each page before its first write at this level.
    /// `None` means the page was not dirty (the snapshot image applies).
    journal: HashMap<Pgno, Option<Arc<Vec<u8>>>>,
}

impl Savepoint {
    fn new(db_size: Pgno) -> Self {
        Savepoint {
            orig_db_size: db_size,
            journal: HashMap::new(),
        }
    }
}

// ============================================================================
// Journal Header
// ============================================================================

/// Rollback journal header (28 bytes)
#[derive(Debug, Clone)]
pub struct JournalHeader {
    /// Magic number (8 bytes)
    pub magic: [u8; 8],
    /// Number of page records that follow
    pub page_count: u32,
    /// Random nonce mixed into each record checksum
    pub nonce: u32,
    /// Database size in pages before the transaction
    pub initial_pages: u32,
    /// Disk sector size
    pub sector_size: u32,
    /// Page size
    pub page_size: u32,
}

impl JournalHeader {
    pub fn new(page_count: u32, initial_pages: u32, sector_size: u32, page_size: u32) -> Self {
        JournalHeader {
            magic: JOURNAL_MAGIC,
            page_count,
            nonce: rand::random(),
            initial_pages,
            sector_size,
            page_size,
        }
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        if data.len() < JOURNAL_HEADER_SIZE {
            return Err(Error::with_message(ErrorCode::Corrupt, "short journal header"));
        }
        if data[0..8] != JOURNAL_MAGIC {
            return Err(Error::with_message(ErrorCode::Corrupt, "bad journal magic"));
        }
        let word = |at: usize| u32::from_be_bytes([data[at], data[at + 1], data[at + 2], data[at + 3]]);
        let page_size = word(24);
        if !(512..=65536).contains(&page_size) || !page_size.is_power_of_two() {
            return Err(Error::with_message(ErrorCode::Corrupt, "bad journal page size"));
        }
        Ok(JournalHeader {
            magic: JOURNAL_MAGIC,
            page_count: word(8),
            nonce: word(12),
            initial_pages: word(16),
            sector_size: word(20),
            page_size,
        })
    }

    pub fn to_bytes(&self) -> [u8; JOURNAL_HEADER_SIZE] {
        let mut buf = [0u8; JOURNAL_HEADER_SIZE];
        buf[0..8].copy_from_slice(&self.magic);
        buf[8..12].copy_from_slice(&self.page_count.to_be_bytes());
        buf[12..16].copy_from_slice(&self.nonce.to_be_bytes());
        buf[16..20].copy_from_slice(&self.initial_pages.to_be_bytes());
        buf[20..24].copy_from_slice(&self.sector_size.to_be_bytes());
        buf[24..28].copy_from_slice(&self.page_size.to_be_bytes());
        buf
    }

    /// Size of one page record: pgno, image, checksum.
    fn record_size(&self) -> u64 {
        4 + self.page_size as u64 + 4
    }
}

/// Checksum of one journal record.
fn record_checksum(nonce: u32, data: &[u8]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&nonce.to_be_bytes());
    hasher.update(data);
    hasher.finalize()
}

// ============================================================================
// Shared file state
// ============================================================================

type PageHistory = Vec<(TxnId, Arc<Vec<u8>>)>;

struct FileState {
    /// Commit counter of the newest committed image
    version: TxnId,
    /// Committed size in pages
    db_size: Pgno,
    /// Committed page size (meaningful once db_size > 0)
    page_size: u32,
    /// Committed size per version still visible to some reader
    sizes: Vec<(TxnId, Pgno)>,
    /// Page images per version. For files, a page without history is read
    /// from the file itself, which always holds the newest image.
    pages: HashMap<Pgno, PageHistory>,
    /// Snapshot held by each pager, by pager id
    readers: HashMap<u64, TxnId>,
    /// Pager holding the write lock
    writer: Option<u64>,
}

impl FileState {
    fn size_at(&self, snapshot: TxnId) -> Pgno {
        self.sizes
            .iter()
            .rev()
            .find(|(v, _)| *v <= snapshot)
            .map(|(_, n)| *n)
            .unwrap_or(self.db_size)
    }

    fn oldest_snapshot(&self) -> TxnId {
        self.readers.values().copied().min().unwrap_or(self.version)
    }
}

/// Committed state of one database, shared by every pager bound to it.
pub struct PagerFile {
    path: Option<PathBuf>,
    journal_path: Option<PathBuf>,
    vfs: Option<Arc<dyn Vfs>>,
    fd: Option<Box<dyn VfsFile>>,
    state: Mutex<FileState>,
}

lazy_static! {
    /// Open database files by VFS name and canonical path
    static ref OPEN_FILES: Mutex<HashMap<String, Weak<PagerFile>>> = Mutex::new(HashMap::new());
}

static NEXT_PAGER_ID: AtomicU64 = AtomicU64::new(1);

impl PagerFile {
    fn memory() -> Self {
        PagerFile {
            path: None,
            journal_path: None,
            vfs: None,
            fd: None,
            state: Mutex::new(FileState {
                version: 0,
                db_size: 0,
                page_size: 0,
                sizes: vec![(0, 0)],
                pages: HashMap::new(),
                readers: HashMap::new(),
                writer: None,
            }),
        }
    }

    /// Attach to the open file for `path`, or open it.
    fn attach(vfs: Arc<dyn Vfs>, path: &Path, read_only: bool) -> Result<Arc<PagerFile>> {
        let full = vfs.full_pathname(path)?;
        let key = format!("{}:{}", vfs.name(), full.display());
        let mut open_files = OPEN_FILES.lock();
        open_files.retain(|_, file| file.strong_count() > 0);
        if let Some(file) = open_files.get(&key).and_then(Weak::upgrade) {
            return Ok(file);
        }
        let file = Arc::new(PagerFile::open_file(vfs, full, read_only)?);
        open_files.insert(key, Arc::downgrade(&file));
        Ok(file)
    }

    fn open_file(vfs: Arc<dyn Vfs>, path: PathBuf, read_only: bool) -> Result<PagerFile> {
        let flags = if read_only {
            OpenFlags::READONLY | OpenFlags::MAIN_DB
        } else {
            OpenFlags::READWRITE | OpenFlags::CREATE | OpenFlags::MAIN_DB
        };
        let fd = vfs.open(&path, flags)?;
        let mut journal_name = path.clone().into_os_string();
        journal_name.push("-journal");
        let journal_path = PathBuf::from(journal_name);

        if !read_only && vfs.exists(&journal_path)? {
            playback_hot_journal(vfs.as_ref(), fd.as_ref(), &journal_path)?;
        }

        let file_size = fd.file_size()?;
        let (page_size, db_size) = if file_size == 0 {
            (0, 0)
        } else {
            let mut header = [0u8; 100];
            fd.read(&mut header, 0)?;
            let raw = u16::from_be_bytes([header[16], header[17]]) as u32;
            let page_size = if raw == 1 { 65536 } else { raw };
            if !(512..=65536).contains(&page_size) || !page_size.is_power_of_two() {
                return Err(Error::with_message(
                    ErrorCode::Corrupt,
                    format!("{}: file is not a database", path.display()),
                ));
            }
            (page_size, (file_size / page_size as u64) as Pgno)
        };
        debug!(path = %path.display(), page_size, db_size, "opened database file");

        Ok(PagerFile {
            path: Some(path),
            journal_path: Some(journal_path),
            vfs: Some(vfs),
            fd: Some(fd),
            state: Mutex::new(FileState {
                version: 0,
                db_size,
                page_size,
                sizes: vec![(0, db_size)],
                pages: HashMap::new(),
                readers: HashMap::new(),
                writer: None,
            }),
        })
    }

    /// Image of `pgno` as of `snapshot`.
    fn read_committed(
        &self,
        st: &FileState,
        pgno: Pgno,
        snapshot: TxnId,
        page_size: u32,
    ) -> Result<Arc<Vec<u8>>> {
        if pgno > st.size_at(snapshot) {
            return Ok(Arc::new(vec![0u8; page_size as usize]));
        }
        if let Some(history) = st.pages.get(&pgno) {
            if let Some((_, data)) = history.iter().rev().find(|(v, _)| *v <= snapshot) {
                return Ok(Arc::clone(data));
            }
        }
        let mut buf = vec![0u8; page_size as usize];
        if let Some(fd) = &self.fd {
            fd.read(&mut buf, (pgno as u64 - 1) * page_size as u64)?;
        }
        Ok(Arc::new(buf))
    }

    fn read_file_page(&self, pgno: Pgno, page_size: u32) -> Result<Arc<Vec<u8>>> {
        let mut buf = vec![0u8; page_size as usize];
        if let Some(fd) = &self.fd {
            fd.read(&mut buf, (pgno as u64 - 1) * page_size as u64)?;
        }
        Ok(Arc::new(buf))
    }

    /// Drop page images no reader can see any more.
    fn prune(&self, st: &mut FileState) {
        let oldest = st.oldest_snapshot();
        if let Some(keep) = st.sizes.iter().rposition(|(v, _)| *v <= oldest) {
            st.sizes.drain(..keep);
        }
        let max_visible = st.sizes.iter().map(|(_, n)| *n).max().unwrap_or(st.db_size);
        let is_memory = self.fd.is_none();
        st.pages.retain(|&pgno, history| {
            if pgno > max_visible {
                return false;
            }
            if let Some(keep) = history.iter().rposition(|(v, _)| *v <= oldest) {
                history.drain(..keep);
            }
            // The file already holds the only image anyone can see.
            !(history.len() == 1 && history[0].0 <= oldest && !is_memory)
        });
    }
}

/// Restore a database from a journal left behind by an interrupted commit.
fn playback_hot_journal(vfs: &dyn Vfs, fd: &dyn VfsFile, journal_path: &Path) -> Result<()> {
    let jfd = vfs.open(journal_path, OpenFlags::READWRITE | OpenFlags::MAIN_JOURNAL)?;
    let mut head = [0u8; JOURNAL_HEADER_SIZE];
    let n = jfd.read(&mut head, 0)?;
    let header = match JournalHeader::from_bytes(&head[..n]) {
        Ok(header) => header,
        Err(_) => {
            debug!(journal = %journal_path.display(), "discarding invalid journal");
            drop(jfd);
            return vfs.delete(journal_path);
        }
    };
    warn!(
        journal = %journal_path.display(),
        records = header.page_count,
        "rolling back hot journal"
    );
    let page_size = header.page_size as usize;
    let mut record = vec![0u8; header.record_size() as usize];
    let mut offset = JOURNAL_HEADER_SIZE as u64;
    for _ in 0..header.page_count {
        if jfd.read(&mut record, offset)? < record.len() {
            break;
        }
        let pgno = u32::from_be_bytes([record[0], record[1], record[2], record[3]]);
        let image = &record[4..4 + page_size];
        let stored = u32::from_be_bytes([
            record[4 + page_size],
            record[5 + page_size],
            record[6 + page_size],
            record[7 + page_size],
        ]);
        if pgno == 0 || stored != record_checksum(header.nonce, image) {
            // Torn tail: records beyond this point were never synced.
            break;
        }
        fd.write(image, (pgno as u64 - 1) * page_size as u64)?;
        offset += header.record_size();
    }
    fd.truncate(header.initial_pages as u64 * page_size as u64)?;
    fd.sync(SyncFlags::FULL)?;
    drop(jfd);
    vfs.delete(journal_path)
}

// ============================================================================
// Pager
// ============================================================================

/// One connection's view of a database file.
pub struct Pager {
    id: u64,
    file: Arc<PagerFile>,
    flags: PagerOpenFlags,
    state: PagerState,
    page_size: u32,
    /// Snapshot pinned by `begin_read`
    snapshot: Option<TxnId>,
    /// Size of the database as this pager sees it
    db_size: Pgno,
    /// Size at `begin_write`
    db_orig_size: Pgno,
    max_page_count: Pgno,
    dirty: HashMap<Pgno, Arc<Vec<u8>>>,
    savepoints: Vec<Savepoint>,
    cache: PCache,
    /// Snapshot the clean cache was filled from
    cache_version: Option<TxnId>,
    /// Journal written by phase one
    jfd: Option<Box<dyn VfsFile>>,
    err: Option<Error>,
}

impl Pager {
    // ========================================================================
    // Initialization
    // ========================================================================

    /// Open a pager (sqlite3PagerOpen). `path == None` opens a private
    /// in-memory database.
    pub fn open(
        vfs: Arc<dyn Vfs>,
        path: Option<&Path>,
        flags: PagerOpenFlags,
        page_size: u32,
        cache_size: i32,
    ) -> Result<Self> {
        let file = match path {
            Some(path) if !flags.contains(PagerOpenFlags::MEMORY) => {
                PagerFile::attach(vfs, path, flags.contains(PagerOpenFlags::READ_ONLY))?
            }
            _ => Arc::new(PagerFile::memory()),
        };
        let committed_size = file.state.lock().page_size;
        let page_size = if committed_size != 0 { committed_size } else { page_size };
        Ok(Pager {
            id: NEXT_PAGER_ID.fetch_add(1, Ordering::Relaxed),
            file,
            flags,
            state: PagerState::Open,
            page_size,
            snapshot: None,
            db_size: 0,
            db_orig_size: 0,
            max_page_count: PAGER_MAX_PGNO,
            dirty: HashMap::new(),
            savepoints: Vec::new(),
            cache: PCache::open(page_size as usize, cache_size),
            cache_version: None,
            jfd: None,
            err: None,
        })
    }

    /// Page size of the committed file, or the requested page size for a
    /// database that has no pages yet.
    pub fn page_size(&self) -> u32 {
        self.page_size
    }

    /// Change the page size. Only possible while the database is empty.
    pub fn set_page_size(&mut self, page_size: u32) -> Result<()> {
        if page_size == self.page_size {
            return Ok(());
        }
        if self.db_size != 0 || self.file.state.lock().db_size != 0 {
            return Err(Error::with_message(
                ErrorCode::ReadOnly,
                "page size is fixed once the database has content",
            ));
        }
        self.page_size = page_size;
        self.cache.set_page_size(page_size as usize);
        Ok(())
    }

    /// Set the upper bound on database size; returns the bound in effect.
    pub fn set_max_page_count(&mut self, max: Pgno) -> Pgno {
        if max > 0 {
            self.max_page_count = max.max(self.db_size).min(PAGER_MAX_PGNO);
        }
        self.max_page_count
    }

    pub fn max_page_count(&self) -> Pgno {
        self.max_page_count
    }

    pub fn set_cache_size(&mut self, size: i32) {
        self.cache.set_cache_size(size);
    }

    /// Returns the previous spill size.
    pub fn set_spill_size(&mut self, size: i32) -> i32 {
        self.cache.set_spill_size(size)
    }

    // ========================================================================
    // Query Functions
    // ========================================================================

    pub fn state(&self) -> PagerState {
        self.state
    }

    pub fn is_readonly(&self) -> bool {
        self.flags.contains(PagerOpenFlags::READ_ONLY)
    }

    pub fn is_memdb(&self) -> bool {
        self.file.fd.is_none()
    }

    /// Database file name, empty for in-memory databases.
    pub fn filename(&self) -> String {
        self.file
            .path
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_default()
    }

    pub fn journal_name(&self) -> Option<&Path> {
        self.file.journal_path.as_deref()
    }

    /// Size of the database in pages as this pager sees it.
    pub fn page_count(&self) -> Pgno {
        self.db_size
    }

    pub fn dirty_count(&self) -> usize {
        self.dirty.len()
    }

    /// Commit counter of the image this pager reads.
    pub fn data_version(&self) -> TxnId {
        match self.snapshot {
            Some(v) => v,
            None => self.file.state.lock().version,
        }
    }

    /// (hits, misses) of the clean-page cache.
    pub fn cache_stats(&self) -> (u64, u64) {
        self.cache.stats()
    }

    fn check_error(&self) -> Result<()> {
        match &self.err {
            Some(err) => Err(Error::with_message(
                err.code,
                format!("pager is in error state: {}", err),
            )),
            None => Ok(()),
        }
    }

    // ========================================================================
    // Transactions
    // ========================================================================

    /// Pin the newest committed image (sqlite3PagerSharedLock).
    pub fn begin_read(&mut self) -> Result<()> {
        self.check_error()?;
        if self.snapshot.is_some() {
            return Ok(());
        }
        let mut st = self.file.state.lock();
        let version = st.version;
        st.readers.insert(self.id, version);
        if st.db_size > 0 && st.page_size != self.page_size {
            self.page_size = st.page_size;
            self.cache.set_page_size(st.page_size as usize);
        }
        self.db_size = st.size_at(version);
        drop(st);
        if self.cache_version != Some(version) {
            self.cache.clear();
            self.cache_version = Some(version);
        }
        self.snapshot = Some(version);
        self.state = PagerState::Reader;
        trace!(pager = self.id, version, db_size = self.db_size, "begin read");
        Ok(())
    }

    /// Release the snapshot. Any open write transaction is rolled back.
    pub fn end_read(&mut self) {
        if self.state >= PagerState::Writer && self.state != PagerState::Error {
            self.rollback();
        }
        let mut st = self.file.state.lock();
        st.readers.remove(&self.id);
        if st.writer == Some(self.id) {
            st.writer = None;
        }
        self.file.prune(&mut st);
        drop(st);
        self.snapshot = None;
        if self.state != PagerState::Error {
            self.state = PagerState::Open;
        }
    }

    /// Take the write lock (sqlite3PagerBegin). Fails with `Busy` when
    /// another pager writes or this pager's snapshot is out of date.
    pub fn begin_write(&mut self) -> Result<()> {
        self.check_error()?;
        if self.is_readonly() {
            return Err(Error::new(ErrorCode::ReadOnly));
        }
        if self.state >= PagerState::Writer {
            return Ok(());
        }
        self.begin_read()?;
        let mut st = self.file.state.lock();
        if let Some(other) = st.writer {
            if other != self.id {
                debug!(pager = self.id, writer = other, "write lock held elsewhere");
                return Err(Error::with_message(ErrorCode::Busy, "database is locked"));
            }
        }
        if self.snapshot != Some(st.version) {
            debug!(pager = self.id, "snapshot is stale, cannot upgrade to writer");
            return Err(Error::with_message(
                ErrorCode::Busy,
                "database changed since read transaction started",
            ));
        }
        st.writer = Some(self.id);
        drop(st);
        self.db_orig_size = self.db_size;
        self.state = PagerState::Writer;
        trace!(pager = self.id, db_size = self.db_size, "begin write");
        Ok(())
    }

    // ========================================================================
    // Page access
    // ========================================================================

    /// Fetch a page (sqlite3PagerGet). Pages past the end read as zeros.
    pub fn get(&mut self, pgno: Pgno) -> Result<DbPage> {
        self.check_error()?;
        if pgno == 0 || pgno > PAGER_MAX_PGNO {
            return Err(Error::corrupt_page(pgno, "page number out of range"));
        }
        let snapshot = self.snapshot.ok_or_else(|| {
            Error::with_message(ErrorCode::Misuse, "page read outside a transaction")
        })?;
        if let Some(data) = self.dirty.get(&pgno) {
            return Ok(DbPage {
                pgno,
                data: Arc::clone(data),
            });
        }
        if pgno > self.db_size {
            return Ok(DbPage::new(pgno, vec![0u8; self.page_size as usize]));
        }
        if let Some(data) = self.cache.fetch(pgno) {
            return Ok(DbPage { pgno, data });
        }
        let data = {
            let st = self.file.state.lock();
            self.file.read_committed(&st, pgno, snapshot, self.page_size)?
        };
        self.cache.insert(pgno, Arc::clone(&data));
        Ok(DbPage { pgno, data })
    }

    /// Make a page image part of the transaction (sqlite3PagerWrite).
    pub fn write(&mut self, page: DbPage) -> Result<()> {
        self.check_error()?;
        if self.state != PagerState::Writer {
            return Err(Error::with_message(
                ErrorCode::Misuse,
                "page write outside a write transaction",
            ));
        }
        if page.pgno == 0 {
            return Err(Error::corrupt_page(0, "write to page zero"));
        }
        if page.pgno > self.max_page_count {
            return Err(Error::new(ErrorCode::Full));
        }
        if page.data.len() != self.page_size as usize {
            return Err(Error::with_message(
                ErrorCode::Internal,
                format!("page {} has wrong size {}", page.pgno, page.data.len()),
            ));
        }
        self.journal_page(page.pgno);
        if page.pgno > self.db_size {
            self.db_size = page.pgno;
        }
        self.dirty.insert(page.pgno, page.data);
        Ok(())
    }

    /// Record the prior state of `pgno` in the innermost savepoint.
    fn journal_page(&mut self, pgno: Pgno) {
        if let Some(sp) = self.savepoints.last_mut() {
            if !sp.journal.contains_key(&pgno) {
                sp.journal.insert(pgno, self.dirty.get(&pgno).cloned());
            }
        }
    }

    /// Shrink the database image to `n` pages (sqlite3PagerTruncateImage).
    pub fn truncate_image(&mut self, n: Pgno) {
        if n >= self.db_size {
            return;
        }
        let doomed: Vec<Pgno> = self.dirty.keys().copied().filter(|&p| p > n).collect();
        for pgno in doomed {
            self.journal_page(pgno);
            self.dirty.remove(&pgno);
        }
        self.db_size = n;
    }

    // ========================================================================
    // Savepoints
    // ========================================================================

    pub fn savepoint_count(&self) -> usize {
        self.savepoints.len()
    }

    /// Grow the savepoint stack to `n` levels (sqlite3PagerOpenSavepoint).
    pub fn open_savepoint(&mut self, n: usize) -> Result<()> {
        self.check_error()?;
        while self.savepoints.len() < n {
            self.savepoints.push(Savepoint::new(self.db_size));
        }
        Ok(())
    }

    /// Release or roll back savepoint `index` and all inner ones
    /// (sqlite3PagerSavepoint). Rolling back keeps savepoint `index` open.
    pub fn savepoint(&mut self, op: SavepointOp, index: usize) -> Result<()> {
        self.check_error()?;
        match op {
            SavepointOp::Begin => self.open_savepoint(index + 1),
            SavepointOp::Release => {
                if index >= self.savepoints.len() {
                    return Ok(());
                }
                let released: Vec<Savepoint> = self.savepoints.drain(index..).collect();
                if let Some(outer) = self.savepoints.last_mut() {
                    for sp in released {
                        for (pgno, prior) in sp.journal {
                            outer.journal.entry(pgno).or_insert(prior);
                        }
                    }
                }
                Ok(())
            }
            SavepointOp::Rollback => {
                if index >= self.savepoints.len() {
                    return Ok(());
                }
                let undone: Vec<Savepoint> = self.savepoints.drain(index + 1..).collect();
                for sp in undone.into_iter().rev() {
                    self.restore_journal(sp.journal);
                }
                let target = &mut self.savepoints[index];
                let journal = std::mem::take(&mut target.journal);
                let orig_db_size = target.orig_db_size;
                self.restore_journal(journal);
                self.db_size = orig_db_size;
                self.dirty.retain(|&pgno, _| pgno <= orig_db_size);
                Ok(())
            }
        }
    }

    fn restore_journal(&mut self, journal: HashMap<Pgno, Option<Arc<Vec<u8>>>>) {
        for (pgno, prior) in journal {
            match prior {
                Some(data) => {
                    self.dirty.insert(pgno, data);
                }
                None => {
                    self.dirty.remove(&pgno);
                }
            }
        }
    }

    // ========================================================================
    // Commit / rollback
    // ========================================================================

    /// Validate the transaction and write the rollback journal
    /// (sqlite3PagerCommitPhaseOne).
    pub fn commit_phase_one(&mut self) -> Result<()> {
        self.check_error()?;
        if self.state != PagerState::Writer {
            return Ok(());
        }
        if self.db_size > self.max_page_count {
            return Err(Error::new(ErrorCode::Full));
        }
        if self.dirty.values().any(|d| d.len() != self.page_size as usize) {
            return Err(Error::with_message(ErrorCode::Internal, "dirty page of wrong size"));
        }
        if !self.is_memdb() && !self.flags.contains(PagerOpenFlags::OMIT_JOURNAL) {
            self.write_journal()
                .map_err(|e| e.context("commit_phase_one"))?;
        }
        self.state = PagerState::WriterLocked;
        Ok(())
    }

    fn write_journal(&mut self) -> Result<()> {
        let (Some(vfs), Some(path)) = (&self.file.vfs, &self.file.journal_path) else {
            return Ok(());
        };
        let snapshot = self.snapshot.unwrap_or(0);
        let mut pgnos: Vec<Pgno> = self
            .dirty
            .keys()
            .copied()
            .filter(|&p| p <= self.db_orig_size)
            .collect();
        pgnos.sort_unstable();

        let header = JournalHeader::new(
            pgnos.len() as u32,
            self.db_orig_size,
            JOURNAL_SECTOR_SIZE,
            self.page_size,
        );
        let jfd = vfs.open(path, OpenFlags::READWRITE | OpenFlags::CREATE | OpenFlags::MAIN_JOURNAL)?;
        jfd.truncate(0)?;
        jfd.write(&header.to_bytes(), 0)?;
        let mut offset = JOURNAL_HEADER_SIZE as u64;
        let st = self.file.state.lock();
        for pgno in &pgnos {
            let original = self.file.read_committed(&st, *pgno, snapshot, self.page_size)?;
            let mut record = Vec::with_capacity(header.record_size() as usize);
            record.extend_from_slice(&pgno.to_be_bytes());
            record.extend_from_slice(&original);
            record.extend_from_slice(&record_checksum(header.nonce, &original).to_be_bytes());
            jfd.write(&record, offset)?;
            offset += header.record_size();
        }
        drop(st);
        jfd.sync(SyncFlags::NORMAL)?;
        trace!(pager = self.id, records = pgnos.len(), "journal synced");
        self.jfd = Some(jfd);
        Ok(())
    }

    /// Write the dirty pages and publish them to new readers
    /// (sqlite3PagerCommitPhaseTwo). On failure the pager enters the error
    /// state and must be discarded.
    pub fn commit_phase_two(&mut self) -> Result<()> {
        self.check_error()?;
        if self.state == PagerState::Writer {
            self.commit_phase_one()?;
        }
        if self.state != PagerState::WriterLocked {
            return Ok(());
        }
        match self.publish() {
            Ok(version) => {
                self.dirty.clear();
                self.savepoints.clear();
                self.snapshot = Some(version);
                self.cache_version = Some(version);
                self.state = PagerState::Reader;
                debug!(pager = self.id, version, db_size = self.db_size, "committed");
                Ok(())
            }
            Err(err) => {
                warn!(pager = self.id, error = %err, "commit phase two failed");
                self.err = Some(err.clone());
                self.state = PagerState::Error;
                let mut st = self.file.state.lock();
                if st.writer == Some(self.id) {
                    st.writer = None;
                }
                Err(err.context("commit_phase_two"))
            }
        }
    }

    fn publish(&mut self) -> Result<TxnId> {
        let file = Arc::clone(&self.file);
        let mut st = file.state.lock();
        let version = st.version + 1;
        let old_size = st.db_size;
        let new_size = self.db_size;
        let page_size = self.page_size;
        let id = self.id;
        let need_history = st.readers.iter().any(|(&r, &v)| r != id && v < version);

        let mut pgnos: Vec<Pgno> = self.dirty.keys().copied().filter(|&p| p <= new_size).collect();
        pgnos.sort_unstable();
        for pgno in pgnos {
            let Some(data) = self.dirty.get(&pgno) else { continue };
            self.cache.insert(pgno, Arc::clone(data));
            match &file.fd {
                None => st.pages.entry(pgno).or_default().push((version, Arc::clone(data))),
                Some(fd) => {
                    if need_history && pgno <= old_size && !st.pages.contains_key(&pgno) {
                        let old = file.read_file_page(pgno, page_size)?;
                        st.pages.insert(pgno, vec![(0, old)]);
                    }
                    if let Some(history) = st.pages.get_mut(&pgno) {
                        history.push((version, Arc::clone(data)));
                    }
                    fd.write(data, (pgno as u64 - 1) * page_size as u64)?;
                }
            }
        }
        if new_size < old_size {
            self.cache.truncate(new_size);
            if let Some(fd) = &file.fd {
                if need_history {
                    for pgno in new_size + 1..=old_size {
                        if !st.pages.contains_key(&pgno) {
                            let old = file.read_file_page(pgno, page_size)?;
                            st.pages.insert(pgno, vec![(0, old)]);
                        }
                    }
                }
                fd.truncate(new_size as u64 * page_size as u64)?;
            }
        }
        if let Some(fd) = &file.fd {
            fd.sync(SyncFlags::NORMAL)?;
        }
        if let (Some(jfd), Some(vfs), Some(path)) = (self.jfd.take(), &file.vfs, &file.journal_path) {
            drop(jfd);
            vfs.delete(path)?;
        }

        st.version = version;
        st.db_size = new_size;
        st.page_size = page_size;
        st.sizes.push((version, new_size));
        st.readers.insert(id, version);
        if st.writer == Some(id) {
            st.writer = None;
        }
        file.prune(&mut st);
        Ok(version)
    }

    /// Discard the write transaction (sqlite3PagerRollback). The snapshot is
    /// kept; call `end_read` to release it.
    pub fn rollback(&mut self) {
        self.dirty.clear();
        self.savepoints.clear();
        if self.state >= PagerState::Writer {
            self.db_size = self.db_orig_size;
        }
        if let Some(jfd) = self.jfd.take() {
            drop(jfd);
            if let (Some(vfs), Some(path)) = (&self.file.vfs, &self.file.journal_path) {
                if let Err(err) = vfs.delete(path) {
                    warn!(error = %err, "could not delete journal after rollback");
                }
            }
        }
        let mut st = self.file.state.lock();
        if st.writer == Some(self.id) {
            st.writer = None;
        }
        drop(st);
        if self.state == PagerState::Writer || self.state == PagerState::WriterLocked {
            self.state = PagerState::Reader;
            trace!(pager = self.id, "rolled back");
        }
    }
}

impl Drop for Pager {
    fn drop(&mut self) {
        let mut st = self.file.state.lock();
        st.readers.remove(&self.id);
        if st.writer == Some(self.id) {
            st.writer = None;
        }
        self.file.prune(&mut st);
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::os::vfs::{MemVfs, StdVfs};

    const PS: u32 = 512;

    fn mem_pager() -> Pager {
        Pager::open(Arc::new(StdVfs), None, PagerOpenFlags::MEMORY, PS, 100).unwrap()
    }

    fn fill(pager: &mut Pager, pgno: Pgno, byte: u8) {
        let mut page = pager.get(pgno).unwrap();
        page.make_mut().fill(byte);
        pager.write(page).unwrap();
    }

    #[test]
    fn test_pager_state_ordering() {
        assert!(PagerState::Open < PagerState::Reader);
        assert!(PagerState::Reader < PagerState::Writer);
        assert!(PagerState::Writer < PagerState::WriterLocked);
    }

    #[test]
    fn test_journal_header_roundtrip() {
        let header = JournalHeader::new(100, 50, 512, 4096);
        let parsed = JournalHeader::from_bytes(&header.to_bytes()).unwrap();
        assert_eq!(header.page_count, parsed.page_count);
        assert_eq!(header.nonce, parsed.nonce);
        assert_eq!(header.initial_pages, parsed.initial_pages);
        assert_eq!(header.page_size, parsed.page_size);
        assert!(JournalHeader::from_bytes(&[0u8; 28]).is_err());
    }

    #[test]
    fn test_write_requires_write_transaction() {
        let mut pager = mem_pager();
        pager.begin_read().unwrap();
        let page = pager.get(1).unwrap();
        assert_eq!(pager.write(page).unwrap_err().code, ErrorCode::Misuse);
    }

    #[test]
    fn test_commit_makes_pages_visible() {
        let mut pager = mem_pager();
        pager.begin_write().unwrap();
        fill(&mut pager, 1, 0xaa);
        fill(&mut pager, 2, 0xbb);
        assert_eq!(pager.page_count(), 2);
        pager.commit_phase_one().unwrap();
        pager.commit_phase_two().unwrap();
        pager.end_read();

        pager.begin_read().unwrap();
        assert_eq!(pager.page_count(), 2);
        assert_eq!(pager.get(2).unwrap()[0], 0xbb);
    }

    #[test]
    fn test_rollback_discards_pages() {
        let mut pager = mem_pager();
        pager.begin_write().unwrap();
        fill(&mut pager, 1, 1);
        pager.rollback();
        assert_eq!(pager.page_count(), 0);
        assert_eq!(pager.get(1).unwrap()[0], 0);
    }

    #[test]
    fn test_savepoint_rollback_restores_images_and_size() {
        let mut pager = mem_pager();
        pager.begin_write().unwrap();
        fill(&mut pager, 1, 1);
        pager.open_savepoint(1).unwrap();
        fill(&mut pager, 1, 2);
        fill(&mut pager, 2, 2);
        pager.open_savepoint(2).unwrap();
        fill(&mut pager, 1, 3);
        fill(&mut pager, 3, 3);

        pager.savepoint(SavepointOp::Rollback, 1).unwrap();
        assert_eq!(pager.get(1).unwrap()[0], 2);
        assert_eq!(pager.page_count(), 2);

        pager.savepoint(SavepointOp::Rollback, 0).unwrap();
        assert_eq!(pager.get(1).unwrap()[0], 1);
        assert_eq!(pager.page_count(), 1);
        assert_eq!(pager.savepoint_count(), 1);
    }

    #[test]
    fn test_savepoint_release_merges_into_outer() {
        let mut pager = mem_pager();
        pager.begin_write().unwrap();
        fill(&mut pager, 1, 1);
        pager.open_savepoint(2).unwrap();
        fill(&mut pager, 1, 9);
        pager.savepoint(SavepointOp::Release, 1).unwrap();
        assert_eq!(pager.savepoint_count(), 1);
        pager.savepoint(SavepointOp::Rollback, 0).unwrap();
        assert_eq!(pager.get(1).unwrap()[0], 1);
    }

    #[test]
    fn test_snapshot_isolation_between_pagers() {
        let vfs: Arc<dyn Vfs> = Arc::new(MemVfs::new());
        let path = Path::new("iso.db");
        let mut writer = Pager::open(Arc::clone(&vfs), Some(path), PagerOpenFlags::empty(), PS, 100).unwrap();
        let mut reader = Pager::open(Arc::clone(&vfs), Some(path), PagerOpenFlags::empty(), PS, 100).unwrap();

        writer.begin_write().unwrap();
        fill(&mut writer, 1, 1);
        writer.commit_phase_two().unwrap();
        writer.end_read();

        reader.begin_read().unwrap();
        assert_eq!(reader.get(1).unwrap()[0], 1);

        writer.begin_write().unwrap();
        fill(&mut writer, 1, 2);
        fill(&mut writer, 2, 2);
        writer.commit_phase_two().unwrap();
        writer.end_read();

        // The reader keeps its snapshot.
        reader.cache.clear();
        assert_eq!(reader.get(1).unwrap()[0], 1);
        assert_eq!(reader.page_count(), 1);
        // It cannot write from a stale snapshot.
        assert_eq!(reader.begin_write().unwrap_err().code, ErrorCode::Busy);
        reader.end_read();

        reader.begin_read().unwrap();
        assert_eq!(reader.get(1).unwrap()[0], 2);
        assert_eq!(reader.page_count(), 2);
    }

    #[test]
    fn test_second_writer_is_busy() {
        let vfs: Arc<dyn Vfs> = Arc::new(MemVfs::new());
        let path = Path::new("busy.db");
        let mut a = Pager::open(Arc::clone(&vfs), Some(path), PagerOpenFlags::empty(), PS, 100).unwrap();
        let mut b = Pager::open(Arc::clone(&vfs), Some(path), PagerOpenFlags::empty(), PS, 100).unwrap();
        a.begin_write().unwrap();
        assert_eq!(b.begin_write().unwrap_err().code, ErrorCode::Busy);
        a.rollback();
        a.end_read();
        b.begin_write().unwrap();
    }

    #[test]
    fn test_max_page_count_reports_full() {
        let mut pager = mem_pager();
        pager.set_max_page_count(2);
        pager.begin_write().unwrap();
        fill(&mut pager, 2, 1);
        let page = pager.get(3).unwrap();
        assert_eq!(pager.write(page).unwrap_err().code, ErrorCode::Full);
    }

    #[test]
    fn test_file_commit_persists_and_removes_journal() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("p.db");
        {
            let mut pager = Pager::open(Arc::new(StdVfs), Some(&path), PagerOpenFlags::empty(), PS, 100).unwrap();
            pager.begin_write().unwrap();
            let mut page = pager.get(1).unwrap();
            // A page-size field the reopen can parse.
            page.make_mut()[16..18].copy_from_slice(&(PS as u16).to_be_bytes());
            pager.write(page).unwrap();
            fill(&mut pager, 2, 7);
            pager.commit_phase_one().unwrap();
            assert!(pager.journal_name().unwrap().exists());
            pager.commit_phase_two().unwrap();
            assert!(!pager.journal_name().unwrap().exists());
        }
        let mut pager = Pager::open(Arc::new(StdVfs), Some(&path), PagerOpenFlags::empty(), 4096, 100).unwrap();
        pager.begin_read().unwrap();
        assert_eq!(pager.page_size(), PS);
        assert_eq!(pager.page_count(), 2);
        assert_eq!(pager.get(2).unwrap()[100], 7);
    }

    #[test]
    fn test_hot_journal_is_rolled_back_on_open() {
        let vfs: Arc<dyn Vfs> = Arc::new(MemVfs::new());
        let path = Path::new("hot.db");
        let mut original = vec![0u8; PS as usize];
        original[16..18].copy_from_slice(&(PS as u16).to_be_bytes());
        original[200] = 0x11;
        {
            let db = vfs.open(path, OpenFlags::CREATE | OpenFlags::READWRITE).unwrap();
            let mut torn = original.clone();
            torn[200] = 0x99;
            db.write(&torn, 0).unwrap();
            db.write(&vec![0x99u8; PS as usize], PS as u64).unwrap();

            let header = JournalHeader::new(1, 1, 512, PS);
            let journal = vfs.open(Path::new("hot.db-journal"), OpenFlags::CREATE | OpenFlags::READWRITE).unwrap();
            journal.write(&header.to_bytes(), 0).unwrap();
            let mut record = 1u32.to_be_bytes().to_vec();
            record.extend_from_slice(&original);
            record.extend_from_slice(&record_checksum(header.nonce, &original).to_be_bytes());
            journal.write(&record, JOURNAL_HEADER_SIZE as u64).unwrap();
        }
        let mut pager = Pager::open(Arc::clone(&vfs), Some(path), PagerOpenFlags::empty(), PS, 100).unwrap();
        assert!(!vfs.exists(Path::new("hot.db-journal")).unwrap());
        pager.begin_read().unwrap();
        assert_eq!(pager.page_count(), 1);
        assert_eq!(pager.get(1).unwrap()[200], 0x11);
    }

    #[test]
    fn test_journal_header_rejects_bad_page_size() {
        for page_size in [0u32, 256, 1000, 131_072, u32::MAX] {
            let bytes = JournalHeader::new(1, 1, 512, page_size).to_bytes();
            let err = JournalHeader::from_bytes(&bytes).unwrap_err();
            assert_eq!(err.code, ErrorCode::Corrupt);
        }
        assert!(JournalHeader::from_bytes(&JournalHeader::new(1, 1, 512, 65536).to_bytes()).is_ok());
    }

    #[test]
    fn test_journal_with_bad_page_size_is_discarded() {
        let vfs: Arc<dyn Vfs> = Arc::new(MemVfs::new());
        let path = Path::new("huge.db");
        let mut image = vec![0u8; PS as usize];
        image[16..18].copy_from_slice(&(PS as u16).to_be_bytes());
        image[200] = 0x33;
        {
            let db = vfs.open(path, OpenFlags::CREATE | OpenFlags::READWRITE).unwrap();
            db.write(&image, 0).unwrap();
            let header = JournalHeader::new(u32::MAX, 0, 512, u32::MAX);
            let journal = vfs.open(Path::new("huge.db-journal"), OpenFlags::CREATE | OpenFlags::READWRITE).unwrap();
            journal.write(&header.to_bytes(), 0).unwrap();
            journal.write(&[0xffu8; 64], JOURNAL_HEADER_SIZE as u64).unwrap();
        }
        let mut pager = Pager::open(Arc::clone(&vfs), Some(path), PagerOpenFlags::empty(), PS, 100).unwrap();
        assert!(!vfs.exists(Path::new("huge.db-journal")).unwrap());
        pager.begin_read().unwrap();
        assert_eq!(pager.page_count(), 1);
        assert_eq!(pager.get(1).unwrap()[200], 0x33);
    }
}
