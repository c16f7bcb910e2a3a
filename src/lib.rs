//! RustQL B-tree - the transactional page store under RustQL
//!
//! A single database file holds many ordered trees: table trees keyed by
//! 64-bit rowid and index trees keyed by caller-ordered byte strings. All
//! changes go through a rollback-journal pager with nested savepoints.
//! Connections to the same file may share one cache, in which case
//! table-level locks arbitrate access between them.

pub mod config;
pub mod error;
pub mod os;
pub mod storage;
pub mod types;
pub mod util;

// Re-export main public types
pub use config::{AutoVacuum, BtreeConfig};
pub use error::{Error, ErrorCode, Result};
pub use os::vfs::{MemVfs, StdVfs, Vfs};
pub use storage::btree::{
    BtCursor, BtCursorIter, Btree, BtreeCursorFlags, BtreeInsertFlags,
    BtreeOpenFlags, BtreePayload, CursorState, IntegrityReport, KeyInfo, SeekBias, SeekResult,
    TransState, UnpackedRecord, BTREE_BLOBKEY, BTREE_INTKEY, SCHEMA_ROOT,
};
pub use storage::pager::SavepointOp;
pub use types::{Pgno, RowId, Value};
