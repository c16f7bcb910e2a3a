//! Per-connection configuration
//!
//! A [`BtreeConfig`] collects the knobs that SQLite exposes as pragmas and
//! open flags. It is consumed by `Btree::open`; most settings can also be
//! changed later through the matching `Btree` setter.

use crate::error::{Error, ErrorCode, Result};
use crate::storage::btree::{
    BtreeOpenFlags, BTREE_AUTOVACUUM_FULL, BTREE_AUTOVACUUM_INCR, BTREE_AUTOVACUUM_NONE,
    DEFAULT_PAGE_SIZE, MAX_PAGE_SIZE, MIN_PAGE_SIZE,
};
use crate::types::Pgno;

/// Default page cache size in pages
pub const DEFAULT_CACHE_SIZE: i32 = 2000;

/// Auto-vacuum mode (PRAGMA auto_vacuum)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum AutoVacuum {
    /// Free pages stay on the free list
    #[default]
    None = BTREE_AUTOVACUUM_NONE,
    /// Trailing free pages are removed at every commit
    Full = BTREE_AUTOVACUUM_FULL,
    /// Free pages are removed on explicit `incr_vacuum` calls
    Incremental = BTREE_AUTOVACUUM_INCR,
}

impl AutoVacuum {
    pub fn from_u8(mode: u8) -> Result<Self> {
        match mode {
            BTREE_AUTOVACUUM_NONE => Ok(AutoVacuum::None),
            BTREE_AUTOVACUUM_FULL => Ok(AutoVacuum::Full),
            BTREE_AUTOVACUUM_INCR => Ok(AutoVacuum::Incremental),
            _ => Err(Error::with_message(
                ErrorCode::Range,
                format!("unknown auto-vacuum mode {}", mode),
            )),
        }
    }
}

/// Connection settings
#[derive(Debug, Clone)]
pub struct BtreeConfig {
    /// Page size for a newly created database
    pub page_size: u32,
    /// Bytes reserved at the end of every page
    pub reserve_bytes: u8,
    /// Clean page cache size (pages)
    pub cache_size: i32,
    /// Auto-vacuum mode for a newly created database
    pub auto_vacuum: AutoVacuum,
    /// Attach to an existing shared state for the same file
    pub shared_cache: bool,
    /// Overwrite deleted content with zeros
    pub secure_delete: bool,
    /// Upper bound on database size in pages
    pub max_page_count: Pgno,
    /// Open without write intent
    pub read_only: bool,
}

impl Default for BtreeConfig {
    fn default() -> Self {
        Self {
            page_size: DEFAULT_PAGE_SIZE,
            reserve_bytes: 0,
            cache_size: DEFAULT_CACHE_SIZE,
            auto_vacuum: AutoVacuum::None,
            shared_cache: false,
            secure_delete: false,
            max_page_count: 0xFFFF_FFFE,
            read_only: false,
        }
    }
}

impl BtreeConfig {
    pub fn page_size(mut self, page_size: u32) -> Self {
        self.page_size = page_size;
        self
    }

    pub fn reserve_bytes(mut self, reserve: u8) -> Self {
        self.reserve_bytes = reserve;
        self
    }

    pub fn cache_size(mut self, pages: i32) -> Self {
        self.cache_size = pages;
        self
    }

    pub fn auto_vacuum(mut self, mode: AutoVacuum) -> Self {
        self.auto_vacuum = mode;
        self
    }

    pub fn shared_cache(mut self, on: bool) -> Self {
        self.shared_cache = on;
        self
    }

    pub fn secure_delete(mut self, on: bool) -> Self {
        self.secure_delete = on;
        self
    }

    pub fn max_page_count(mut self, max: Pgno) -> Self {
        self.max_page_count = max;
        self
    }

    pub fn read_only(mut self, on: bool) -> Self {
        self.read_only = on;
        self
    }

    /// Fold open flags into the configuration.
    pub fn apply_flags(mut self, flags: BtreeOpenFlags) -> Self {
        if flags.contains(BtreeOpenFlags::SHARED_CACHE) {
            self.shared_cache = true;
        }
        if flags.contains(BtreeOpenFlags::READ_ONLY) {
            self.read_only = true;
        }
        self
    }

    /// Reject settings the pager cannot honour.
    pub fn validate(&self) -> Result<()> {
        if !(MIN_PAGE_SIZE..=MAX_PAGE_SIZE).contains(&self.page_size)
            || !self.page_size.is_power_of_two()
        {
            return Err(Error::with_message(
                ErrorCode::Misuse,
                format!("invalid page size {}", self.page_size),
            ));
        }
        if self.page_size - (self.reserve_bytes as u32) < 480 {
            return Err(Error::with_message(
                ErrorCode::Misuse,
                "reserve leaves fewer than 480 usable bytes",
            ));
        }
        if self.max_page_count == 0 {
            return Err(Error::with_message(ErrorCode::Misuse, "max page count is zero"));
        }
        Ok(())
    }
}
