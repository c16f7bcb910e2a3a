//! B-tree type definitions, constants, and bitflags

use std::cmp::Ordering;
use std::fmt;
use std::sync::Arc;

use bitflags::bitflags;

use crate::error::{Error, ErrorCode, Result};
use crate::types::{Pgno, RowId, Value};

use super::encoding::{read_u16, read_u32};

// Page flags
pub const BTREE_PAGEFLAG_INTKEY: u8 = 0x01;
pub const BTREE_PAGEFLAG_ZERODATA: u8 = 0x02;
pub const BTREE_PAGEFLAG_LEAFDATA: u8 = 0x04;
pub const BTREE_PAGEFLAG_LEAF: u8 = 0x08;

pub const PTF_INTKEY: u8 = BTREE_PAGEFLAG_INTKEY;
pub const PTF_ZERODATA: u8 = BTREE_PAGEFLAG_ZERODATA;
pub const PTF_LEAFDATA: u8 = BTREE_PAGEFLAG_LEAFDATA;
pub const PTF_LEAF: u8 = BTREE_PAGEFLAG_LEAF;
pub const PTF_TABLE_LEAF: u8 = PTF_INTKEY | PTF_LEAFDATA | PTF_LEAF;
pub const PTF_TABLE_INTERIOR: u8 = PTF_INTKEY | PTF_LEAFDATA;
pub const PTF_INDEX_LEAF: u8 = PTF_LEAF | PTF_ZERODATA;
pub const PTF_INDEX_INTERIOR: u8 = PTF_ZERODATA;

// Page sizes
pub const PAGE_HEADER_SIZE_LEAF: usize = 8;
pub const PAGE_HEADER_SIZE_INTERIOR: usize = 12;
pub const MAX_EMBEDDED: u8 = 64;
pub const MIN_EMBEDDED: u8 = 32;
pub const CELL_PTR_SIZE: usize = 2;
pub const MAX_PAGE_SIZE: u32 = 65536;
pub const MIN_PAGE_SIZE: u32 = 512;
pub const DEFAULT_PAGE_SIZE: u32 = 4096;
/// Smallest usable size a page may have after reserved bytes
pub const MIN_USABLE_SIZE: u32 = 480;
/// Size of the file header at the start of page 1
pub const DB_HEADER_SIZE: usize = 100;
/// Minimum stored size of a cell
pub const MIN_CELL_SIZE: usize = 4;

/// Byte offset of the lock-byte page (never holds content)
pub const PENDING_BYTE: u64 = 0x4000_0000;

// Auto-vacuum modes
pub const BTREE_AUTOVACUUM_NONE: u8 = 0;
pub const BTREE_AUTOVACUUM_FULL: u8 = 1;
pub const BTREE_AUTOVACUUM_INCR: u8 = 2;

// B-tree key types for create_table
pub const BTREE_INTKEY: u8 = 1;
pub const BTREE_BLOBKEY: u8 = 2;

/// Root page of the schema table
pub const SCHEMA_ROOT: Pgno = 1;

// B-tree metadata indices
pub const BTREE_FREE_PAGE_COUNT: usize = 0;
pub const BTREE_SCHEMA_VERSION: usize = 1;
pub const BTREE_FILE_FORMAT: usize = 2;
pub const BTREE_DEFAULT_CACHE_SIZE: usize = 3;
pub const BTREE_LARGEST_ROOT_PAGE: usize = 4;
pub const BTREE_TEXT_ENCODING: usize = 5;
pub const BTREE_USER_VERSION: usize = 6;
pub const BTREE_INCR_VACUUM: usize = 7;
pub const BTREE_APPLICATION_ID: usize = 8;
pub const BTREE_DATA_VERSION: usize = 15;
pub const SQLITE_N_BTREE_META: usize = 16;
pub const BTCURSOR_MAX_DEPTH: usize = 20;

// Page 1 header offsets
pub const HDR_CHANGE_COUNTER: usize = 24;
pub const HDR_DB_SIZE: usize = 28;
pub const HDR_FREELIST_TRUNK: usize = 32;
pub const HDR_META: usize = 36;
pub const HDR_VERSION_VALID_FOR: usize = 92;
pub const HDR_SQLITE_VERSION: usize = 96;

// Pointer map types
pub const PTRMAP_ROOTPAGE: u8 = 1;
pub const PTRMAP_FREEPAGE: u8 = 2;
pub const PTRMAP_OVERFLOW1: u8 = 3;
pub const PTRMAP_OVERFLOW2: u8 = 4;
pub const PTRMAP_BTREE: u8 = 5;

pub const SQLITE_FILE_HEADER: &[u8; 16] = b"SQLite format 3\0";

bitflags! {
    /// Flags for `Btree::open`
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct BtreeOpenFlags: u8 {
        const OMIT_JOURNAL = 0x01;
        const MEMORY = 0x02;
        const SINGLE = 0x04;
        const UNORDERED = 0x08;
        const SHARED_CACHE = 0x10;
        const READ_ONLY = 0x20;
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct BtsFlags: u16 {
        const READ_ONLY = 0x0001;
        const PAGESIZE_FIXED = 0x0002;
        const SECURE_DELETE = 0x0004;
        const INITIALLY_EMPTY = 0x0010;
    }
}

bitflags! {
    /// Cursor open flags and hints
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct BtreeCursorFlags: u32 {
        const BULKLOAD = 0x0000_0001;
        const SEEK_EQ = 0x0000_0002;
        const WRCSR = 0x0000_0004;
        const FORDELETE = 0x0000_0008;
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct BtreeInsertFlags: u8 {
        const SAVEPOSITION = 0x02;
        const AUXDELETE = 0x04;
        const APPEND = 0x08;
        /// Use seek_result parameter to skip internal seek - cursor is already positioned
        const USESEEKRESULT = 0x10;
        const PREFORMAT = 0x80;
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum TransState {
    None = 0,
    Read = 1,
    Write = 2,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum BtLock {
    Read = 1,
    Write = 2,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum CursorState {
    /// Positioned on an entry
    Valid = 0,
    /// Not positioned, or moved past either end
    Invalid = 1,
    /// Tree changed underneath; the saved key must be sought again
    RequireSeek = 3,
    /// Tripped; every call reports the stored error
    Fault = 4,
}

/// Outcome of a seek: where the cursor landed relative to the target.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SeekResult {
    /// On an entry equal to the target
    Exact,
    /// On an entry smaller than the target (or the last entry)
    Before,
    /// On an entry larger than the target
    After,
    /// The tree is empty
    Empty,
}

impl SeekResult {
    /// SQLite's integer encoding: <0, 0, >0.
    pub fn as_i32(&self) -> i32 {
        match self {
            SeekResult::Exact => 0,
            SeekResult::Before => -1,
            SeekResult::After | SeekResult::Empty => 1,
        }
    }
}

/// Direction hint for `table_moveto`/`index_moveto`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum SeekBias {
    #[default]
    None,
    /// Target is probably at or just after the current entry (appends)
    Forward,
    /// Target is probably at or just before the current entry
    Backward,
}

/// Page limits and offset calculations
#[derive(Clone, Copy, Debug)]
pub struct PageLimits {
    pub page_size: u32,
    pub usable_size: u32,
    pub header_offset: usize,
}

impl PageLimits {
    pub fn new(page_size: u32, usable_size: u32) -> Self {
        Self {
            page_size,
            usable_size,
            header_offset: 0,
        }
    }

    pub fn for_page1(page_size: u32, usable_size: u32) -> Self {
        Self {
            page_size,
            usable_size,
            header_offset: DB_HEADER_SIZE,
        }
    }

    pub fn for_page(pgno: Pgno, page_size: u32, usable_size: u32) -> Self {
        if pgno == 1 {
            Self::for_page1(page_size, usable_size)
        } else {
            Self::new(page_size, usable_size)
        }
    }

    pub fn header_start(&self) -> usize {
        self.header_offset
    }

    pub fn usable_end(&self) -> usize {
        self.usable_size as usize
    }

    /// Bytes available for cells and cell pointers.
    pub fn capacity(&self, is_leaf: bool) -> usize {
        let header = if is_leaf {
            PAGE_HEADER_SIZE_LEAF
        } else {
            PAGE_HEADER_SIZE_INTERIOR
        };
        self.usable_end() - self.header_offset - header
    }

    /// Largest payload stored entirely on the page.
    pub fn max_local(&self, is_table_leaf: bool) -> u32 {
        let usable = self.usable_size;
        if is_table_leaf {
            usable - 35
        } else {
            (usable - 12) * MAX_EMBEDDED as u32 / 255 - 23
        }
    }

    /// Smallest local portion of a payload that spills.
    pub fn min_local(&self) -> u32 {
        (self.usable_size - 12) * MIN_EMBEDDED as u32 / 255 - 23
    }

    /// Bytes of payload stored locally for a payload of `n_payload` bytes.
    pub fn local_size(&self, is_table_leaf: bool, n_payload: u32) -> u32 {
        let max_local = self.max_local(is_table_leaf);
        if n_payload <= max_local {
            return n_payload;
        }
        let min_local = self.min_local();
        let surplus = min_local + (n_payload - min_local) % (self.usable_size - 4);
        if surplus <= max_local {
            surplus
        } else {
            min_local
        }
    }

    /// Payload bytes carried by one overflow page.
    pub fn overflow_chunk(&self) -> usize {
        self.usable_size as usize - 4
    }
}

/// B-tree table lock entry for shared cache mode
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct BtTableLockEntry {
    pub(crate) table: Pgno,
    pub(crate) btree_id: u64,
    pub(crate) lock_type: BtLock,
}

/// Parsed cell (CellInfo in SQLite)
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CellInfo {
    /// Rowid for table cells, payload size for index cells
    pub n_key: i64,
    /// Total payload bytes
    pub n_payload: u32,
    /// Payload bytes stored on the page
    pub n_local: u32,
    /// Offset of the payload from the start of the cell
    pub n_header: usize,
    /// Stored size of the cell
    pub n_size: usize,
    /// First overflow page, 0 if none
    pub overflow_pgno: Pgno,
    /// Left child for interior cells
    pub child: Pgno,
}

/// Search key for index trees.
///
/// `fields` optionally carries the key pre-decomposed into values; it is
/// empty whenever the engine itself compares stored keys (cursor restore,
/// integrity checks), so a comparator must be able to work from `key`.
#[derive(Clone, Copy, Debug)]
pub struct UnpackedRecord<'a> {
    pub key: &'a [u8],
    pub fields: &'a [Value],
}

impl<'a> UnpackedRecord<'a> {
    pub fn new(key: &'a [u8]) -> Self {
        Self { key, fields: &[] }
    }

    pub fn with_fields(key: &'a [u8], fields: &'a [Value]) -> Self {
        Self { key, fields }
    }
}

/// Ordering of a stored key relative to a search key.
pub type KeyCompare = Arc<dyn Fn(&[u8], &UnpackedRecord<'_>) -> Ordering + Send + Sync>;

/// Key comparison information for index trees.
#[derive(Clone, Default)]
pub struct KeyInfo {
    /// Custom comparator; byte-wise comparison when absent
    pub compare: Option<KeyCompare>,
    /// Equal keys are rejected with `Constraint` instead of replaced
    pub unique: bool,
}

impl KeyInfo {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn unique() -> Self {
        Self {
            compare: None,
            unique: true,
        }
    }

    pub fn with_compare<F>(compare: F) -> Self
    where
        F: Fn(&[u8], &UnpackedRecord<'_>) -> Ordering + Send + Sync + 'static,
    {
        Self {
            compare: Some(Arc::new(compare)),
            unique: false,
        }
    }

    pub fn set_unique(mut self, unique: bool) -> Self {
        self.unique = unique;
        self
    }

    /// Compare a stored key against a search key.
    pub fn compare(&self, stored: &[u8], key: &UnpackedRecord<'_>) -> Ordering {
        match &self.compare {
            Some(cmp) => cmp(stored, key),
            None => stored.cmp(key.key),
        }
    }
}

impl fmt::Debug for KeyInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyInfo")
            .field("custom_compare", &self.compare.is_some())
            .field("unique", &self.unique)
            .finish()
    }
}

/// Content of one insert.
#[derive(Clone, Debug, PartialEq)]
pub enum BtreePayload {
    /// Table entry: rowid plus data, padded with `n_zero` zero bytes
    Table {
        rowid: RowId,
        data: Vec<u8>,
        n_zero: u32,
    },
    /// Index entry: the key is the whole content
    Index { key: Vec<u8>, fields: Vec<Value> },
}

impl BtreePayload {
    pub fn table(rowid: RowId, data: impl Into<Vec<u8>>) -> Self {
        BtreePayload::Table {
            rowid,
            data: data.into(),
            n_zero: 0,
        }
    }

    pub fn index(key: impl Into<Vec<u8>>) -> Self {
        BtreePayload::Index {
            key: key.into(),
            fields: Vec::new(),
        }
    }

    pub fn is_table(&self) -> bool {
        matches!(self, BtreePayload::Table { .. })
    }

    /// Total payload size in bytes.
    pub fn payload_size(&self) -> u64 {
        match self {
            BtreePayload::Table { data, n_zero, .. } => data.len() as u64 + *n_zero as u64,
            BtreePayload::Index { key, .. } => key.len() as u64,
        }
    }
}

/// Database header structure
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DbHeader {
    pub page_size: u32,
    pub reserve: u8,
    pub file_format: u8,
    pub change_counter: u32,
    pub db_size: Pgno,
    pub first_trunk_page: Pgno,
    pub free_page_count: u32,
    pub schema_cookie: u32,
    pub largest_root: Pgno,
    pub incr_vacuum: bool,
}

impl DbHeader {
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < DB_HEADER_SIZE {
            return Err(Error::with_message(ErrorCode::Corrupt, "short database header"));
        }
        if &data[0..16] != SQLITE_FILE_HEADER {
            return Err(Error::with_message(ErrorCode::Corrupt, "file is not a database"));
        }
        let corrupt = || Error::with_message(ErrorCode::Corrupt, "malformed database header");
        let mut page_size = read_u16(data, 16).ok_or_else(corrupt)? as u32;
        if page_size == 1 {
            page_size = 65536;
        }
        if !(MIN_PAGE_SIZE..=MAX_PAGE_SIZE).contains(&page_size) || !page_size.is_power_of_two() {
            return Err(corrupt());
        }
        let reserve = data[20];
        if page_size - (reserve as u32) < MIN_USABLE_SIZE {
            return Err(corrupt());
        }
        // Payload fractions are fixed by the format.
        if data[21] != MAX_EMBEDDED || data[22] != MIN_EMBEDDED || data[23] != 32 {
            return Err(corrupt());
        }
        let word = |offset: usize| read_u32(data, offset).ok_or_else(corrupt);
        Ok(Self {
            page_size,
            reserve,
            file_format: data[18],
            change_counter: word(HDR_CHANGE_COUNTER)?,
            db_size: word(HDR_DB_SIZE)?,
            first_trunk_page: word(HDR_FREELIST_TRUNK)?,
            free_page_count: word(HDR_META)?,
            schema_cookie: word(HDR_META + 4 * BTREE_SCHEMA_VERSION)?,
            largest_root: word(HDR_META + 4 * BTREE_LARGEST_ROOT_PAGE)?,
            incr_vacuum: word(HDR_META + 4 * BTREE_INCR_VACUUM)? != 0,
        })
    }

    /// Whether the in-header size can be trusted over the file size.
    pub fn db_size_valid(data: &[u8]) -> bool {
        let counter = read_u32(data, HDR_CHANGE_COUNTER);
        let valid_for = read_u32(data, HDR_VERSION_VALID_FOR);
        counter.is_some() && counter == valid_for && read_u32(data, HDR_DB_SIZE) != Some(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_local_size_limits() {
        let limits = PageLimits::new(4096, 4096);
        assert_eq!(limits.max_local(true), 4061);
        assert_eq!(limits.max_local(false), 1002);
        assert_eq!(limits.min_local(), 489);
        assert_eq!(limits.local_size(true, 100), 100);
        // Spilled payloads keep at least min_local bytes on the page.
        let local = limits.local_size(true, 10_000);
        assert!(local >= limits.min_local() && local <= limits.max_local(true));
        assert_eq!((10_000 - local) as usize % limits.overflow_chunk() == 0, local != limits.min_local());
    }

    #[test]
    fn test_capacity_accounts_for_page1_header() {
        let p1 = PageLimits::for_page(1, 1024, 1024);
        let p2 = PageLimits::for_page(2, 1024, 1024);
        assert_eq!(p2.capacity(true) - p1.capacity(true), DB_HEADER_SIZE);
        assert_eq!(p2.capacity(true) - p2.capacity(false), 4);
    }

    #[test]
    fn test_key_info_default_is_bytewise() {
        let info = KeyInfo::new();
        assert_eq!(info.compare(b"a", &UnpackedRecord::new(b"b")), Ordering::Less);
        assert_eq!(info.compare(b"ab", &UnpackedRecord::new(b"ab")), Ordering::Equal);
        let reversed = KeyInfo::with_compare(|stored, key| key.key.cmp(stored));
        assert_eq!(reversed.compare(b"a", &UnpackedRecord::new(b"b")), Ordering::Greater);
    }

    #[test]
    fn test_db_header_rejects_bad_magic() {
        let data = [0u8; 100];
        assert_eq!(DbHeader::parse(&data).unwrap_err().code, ErrorCode::Corrupt);
    }

    #[test]
    fn test_seek_result_encoding() {
        assert_eq!(SeekResult::Exact.as_i32(), 0);
        assert!(SeekResult::Before.as_i32() < 0);
        assert!(SeekResult::After.as_i32() > 0);
    }
}
