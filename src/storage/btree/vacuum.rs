//! Auto-vacuum, incremental vacuum and the pointer map
//!
//! In an auto-vacuum database every page after page 1 has a five-byte
//! pointer-map entry (type, parent) on the pointer-map page that covers it.
//! The first pointer-map page is page 2; each one describes the
//! `usable_size / 5` pages that follow it.

use std::collections::BTreeSet;

use tracing::debug;

use crate::error::{Error, ErrorCode, Result};
use crate::types::Pgno;

use super::encoding::{read_u32, write_u32};
use super::freelist::AllocMode;
use super::types::{
    BTREE_INTKEY, BTREE_LARGEST_ROOT_PAGE, HDR_META, PENDING_BYTE, PTF_INDEX_LEAF, PTF_TABLE_LEAF,
    PTRMAP_BTREE, PTRMAP_FREEPAGE, PTRMAP_OVERFLOW1, PTRMAP_OVERFLOW2, PTRMAP_ROOTPAGE,
};
use super::{page::MemPage, BtShared};

impl BtShared {
    /// Page holding the lock bytes; it never stores content.
    pub(crate) fn pending_byte_page(&self) -> Pgno {
        (PENDING_BYTE / self.page_size as u64) as Pgno + 1
    }

    /// Pointer-map page covering `pgno` (ptrmapPageno).
    pub(crate) fn ptrmap_pageno(&self, pgno: Pgno) -> Pgno {
        if pgno < 2 {
            return 0;
        }
        let per_map = self.usable_size / 5 + 1;
        let mut ret = (pgno - 2) / per_map * per_map + 2;
        if ret == self.pending_byte_page() {
            ret += 1;
        }
        ret
    }

    pub(crate) fn is_ptrmap_page(&self, pgno: Pgno) -> bool {
        self.auto_vacuum && pgno >= 2 && self.ptrmap_pageno(pgno) == pgno
    }

    /// Record the type and parent of `key` (ptrmapPut). A no-op unless the
    /// database is in auto-vacuum mode.
    pub(crate) fn ptrmap_put(&mut self, key: Pgno, kind: u8, parent: Pgno) -> Result<()> {
        if !self.auto_vacuum {
            return Ok(());
        }
        let map = self.ptrmap_pageno(key);
        if key < 2 || key == map {
            return Err(Error::corrupt_page(key, "no pointer-map entry for this page"));
        }
        let offset = 5 * (key - map - 1) as usize;
        if offset + 5 > self.usable_size as usize {
            return Err(Error::corrupt_page(map, "pointer-map offset out of range"));
        }
        let mut page = if map > self.page_count() {
            self.zero_page(map)
        } else {
            self.raw_page(map)?
        };
        if page[offset] == kind && read_u32(&page, offset + 1) == Some(parent) {
            return Ok(());
        }
        let buf = page.make_mut();
        buf[offset] = kind;
        write_u32(buf, offset + 1, parent)?;
        self.write_raw(page)
    }

    /// Read the entry for `key` (ptrmapGet).
    pub(crate) fn ptrmap_get(&mut self, key: Pgno) -> Result<(u8, Pgno)> {
        let map = self.ptrmap_pageno(key);
        if key < 2 || key == map || map > self.page_count() {
            return Err(Error::corrupt_page(key, "no pointer-map entry for this page"));
        }
        let page = self.raw_page(map)?;
        let offset = 5 * (key - map - 1) as usize;
        let kind = *page
            .get(offset)
            .ok_or_else(|| Error::corrupt_page(map, "pointer-map offset out of range"))?;
        let parent = read_u32(&page, offset + 1).unwrap_or(0);
        if !(PTRMAP_ROOTPAGE..=PTRMAP_BTREE).contains(&kind) {
            return Err(Error::corrupt_page(
                map,
                format!("bad pointer-map type {} for page {}", kind, key),
            ));
        }
        Ok((kind, parent))
    }

    /// Pointer-map entries for everything page `pgno` refers to
    /// (setChildPtrmaps).
    pub(crate) fn set_child_ptrmaps(&mut self, page: &MemPage) -> Result<()> {
        if !self.auto_vacuum {
            return Ok(());
        }
        for i in 0..page.n_cell {
            let info = page.cell_info(i)?;
            self.ptrmap_put_overflow(&info, page.pgno)?;
        }
        if !page.leaf {
            for i in 0..=page.n_cell {
                self.ptrmap_put(page.child(i)?, PTRMAP_BTREE, page.pgno)?;
            }
        }
        Ok(())
    }

    /// Move the content of page `from` to page `to` and repoint the single
    /// reference to it (relocatePage). `to` must be free or about to be
    /// overwritten.
    pub(crate) fn relocate_page(&mut self, from: Pgno, kind: u8, parent: Pgno, to: Pgno) -> Result<()> {
        debug!(from, to, kind, parent, "relocating page");
        let mut image = self.raw_page(from)?;
        image.set_pgno(to);
        let next = read_u32(&image, 0).unwrap_or(0);
        self.write_raw(image)?;

        match kind {
            PTRMAP_BTREE | PTRMAP_ROOTPAGE => {
                let page = self.get_page(to)?;
                self.set_child_ptrmaps(&page)?;
            }
            PTRMAP_OVERFLOW1 | PTRMAP_OVERFLOW2 => {
                if next != 0 {
                    self.ptrmap_put(next, PTRMAP_OVERFLOW2, to)?;
                }
            }
            _ => return Err(Error::corrupt_page(from, format!("cannot relocate page of type {}", kind))),
        }

        match kind {
            PTRMAP_ROOTPAGE => {}
            PTRMAP_OVERFLOW2 => {
                let mut prev = self.raw_page(parent)?;
                if read_u32(&prev, 0) != Some(from) {
                    return Err(Error::corrupt_page(parent, format!("does not link to overflow page {}", from)));
                }
                write_u32(prev.make_mut(), 0, to)?;
                self.write_raw(prev)?;
            }
            _ => self.modify_page_pointer(parent, from, to, kind)?,
        }
        self.ptrmap_put(to, kind, parent)
    }

    /// Replace the reference to `from` on b-tree page `parent`
    /// (modifyPagePointer).
    fn modify_page_pointer(&mut self, parent: Pgno, from: Pgno, to: Pgno, kind: u8) -> Result<()> {
        let mut page = self.get_page(parent)?;
        if kind == PTRMAP_OVERFLOW1 {
            for i in 0..page.n_cell {
                if page.cell_info(i)?.overflow_pgno == from {
                    page.set_overflow(i, to)?;
                    return self.write_page(page);
                }
            }
        } else if !page.leaf {
            for i in 0..=page.n_cell {
                if page.child(i)? == from {
                    page.set_child(i, to)?;
                    return self.write_page(page);
                }
            }
        }
        Err(Error::corrupt_page(parent, format!("no reference to page {}", from)))
    }

    /// Move in-use pages from the end of the file into free slots and cut
    /// the file short. Stops after `limit` pages when given. Returns the
    /// number of pages removed from the file.
    pub(crate) fn vacuum_pages(&mut self, limit: Option<u32>) -> Result<u32> {
        let free_list = self.free_list_pages()?;
        if free_list.is_empty() {
            return Ok(0);
        }
        self.save_all_cursors(None)?;
        let mut free: BTreeSet<Pgno> = free_list.into_iter().collect();
        let mut last = self.page_count();
        let mut released = 0u32;
        loop {
            while last > 1 && (self.is_ptrmap_page(last) || last == self.pending_byte_page()) {
                last -= 1;
            }
            if free.is_empty() || limit.is_some_and(|n| released >= n) {
                break;
            }
            if free.remove(&last) {
                last -= 1;
                released += 1;
                continue;
            }
            let target = match free.first() {
                Some(&t) if t < last => t,
                _ => break,
            };
            free.remove(&target);
            let (kind, parent) = self.ptrmap_get(last)?;
            if kind == PTRMAP_ROOTPAGE || kind == PTRMAP_FREEPAGE {
                return Err(Error::corrupt_page(last, format!("unexpected pointer-map type {} at end of file", kind)));
            }
            self.relocate_page(last, kind, parent, target)?;
            last -= 1;
            released += 1;
        }
        self.rebuild_free_list(free.into_iter().collect())?;
        self.pager.truncate_image(last);
        debug!(released, db_size = last, "vacuumed");
        Ok(released)
    }

    /// Full auto-vacuum at commit: no free pages remain afterwards.
    pub(crate) fn autovacuum_commit(&mut self) -> Result<()> {
        if !self.auto_vacuum || self.incr_vacuum {
            return Ok(());
        }
        if self.page_count() == 0 {
            return Ok(());
        }
        self.vacuum_pages(None)?;
        Ok(())
    }

    /// Run up to `n` incremental-vacuum steps (sqlite3BtreeIncrVacuum).
    /// Returns `Ok(false)` once nothing is left to reclaim.
    pub(crate) fn incr_vacuum(&mut self, n: u32) -> Result<bool> {
        if !self.auto_vacuum {
            return Err(Error::with_message(ErrorCode::Misuse, "database is not in auto-vacuum mode"));
        }
        let released = self.vacuum_pages(Some(n))?;
        Ok(released > 0 && self.free_page_count()? > 0)
    }

    /// Allocate the root page of a new tree (btreeCreateTable).
    pub(crate) fn create_table(&mut self, kind: u8) -> Result<Pgno> {
        let flags = if kind & BTREE_INTKEY != 0 {
            PTF_TABLE_LEAF
        } else {
            PTF_INDEX_LEAF
        };
        let meta4 = HDR_META + 4 * BTREE_LARGEST_ROOT_PAGE;
        let root = if self.auto_vacuum {
            let mut root = self.header_u32(meta4)? + 1;
            while self.is_ptrmap_page(root) || root == self.pending_byte_page() {
                root += 1;
            }
            let image = self.allocate_page(AllocMode::Exact(root))?;
            if image.pgno() != root {
                // The slot is in use: move its occupant out of the way.
                self.save_all_cursors(None)?;
                let (kind, parent) = self.ptrmap_get(root)?;
                if kind == PTRMAP_ROOTPAGE || kind == PTRMAP_FREEPAGE {
                    return Err(Error::corrupt_page(root, "root slot holds a root or free page"));
                }
                self.relocate_page(root, kind, parent, image.pgno())?;
            }
            self.ptrmap_put(root, PTRMAP_ROOTPAGE, 0)?;
            self.put_header_u32(meta4, root)?;
            root
        } else {
            self.allocate_page(AllocMode::Any)?.pgno()
        };
        let page = MemPage::init(self.zero_page(root), flags, self.limits(root));
        self.write_page(page)?;
        debug!(root, intkey = kind & BTREE_INTKEY != 0, "created tree");
        Ok(root)
    }

    /// Free every page of a tree (btreeDropTable). In auto-vacuum mode the
    /// highest root moves into the hole; its old page number is returned.
    pub(crate) fn drop_table(&mut self, root: Pgno) -> Result<Option<Pgno>> {
        if root < 1 || root > self.page_count() {
            return Err(Error::corrupt_page(root, "drop of a page outside the file"));
        }
        if self.cursors.values().any(|c| c.root == root) {
            return Err(Error::with_message(ErrorCode::Locked, "table has open cursors"));
        }
        self.clear_table(root)?;
        if root == 1 {
            return Ok(None);
        }
        if !self.auto_vacuum {
            self.free_page(root)?;
            debug!(root, "dropped tree");
            return Ok(None);
        }
        let meta4 = HDR_META + 4 * BTREE_LARGEST_ROOT_PAGE;
        let max_root = self.header_u32(meta4)?;
        let moved = if root == max_root {
            self.free_page(root)?;
            None
        } else {
            if root > max_root {
                return Err(Error::corrupt_page(root, "root above the largest root page"));
            }
            self.save_all_cursors(None)?;
            self.relocate_page(max_root, PTRMAP_ROOTPAGE, 0, root)?;
            for cur in self.cursors.values_mut() {
                if cur.root == max_root {
                    cur.root = root;
                }
            }
            self.free_page(max_root)?;
            Some(max_root)
        };
        let mut largest = max_root - 1;
        while largest > 1 && (self.is_ptrmap_page(largest) || largest == self.pending_byte_page()) {
            largest -= 1;
        }
        self.put_header_u32(meta4, largest)?;
        debug!(root, moved = ?moved, "dropped tree");
        Ok(moved)
    }
}

#[cfg(test)]
mod tests {
    use crate::storage::btree::tests::scratch;

    use super::*;

    #[test]
    fn test_ptrmap_page_numbers() {
        let (_db, shared) = scratch(true);
        let guard = shared.inner.lock();
        let bt = guard.borrow();
        let per_map = bt.usable_size / 5 + 1;
        assert_eq!(bt.ptrmap_pageno(3), 2);
        assert_eq!(bt.ptrmap_pageno(per_map + 1), 2);
        assert_eq!(bt.ptrmap_pageno(per_map + 2), per_map + 2);
        assert!(bt.is_ptrmap_page(2));
        assert!(!bt.is_ptrmap_page(3));
    }

    #[test]
    fn test_ptrmap_roundtrip_and_missing_entry() {
        let (_db, shared) = scratch(true);
        let guard = shared.inner.lock();
        let mut bt = guard.borrow_mut();
        let root = bt.create_table(BTREE_INTKEY).unwrap();
        assert_eq!(root, 3);
        assert_eq!(bt.ptrmap_get(root).unwrap(), (PTRMAP_ROOTPAGE, 0));
        bt.ptrmap_put(root, PTRMAP_BTREE, 1).unwrap();
        assert_eq!(bt.ptrmap_get(root).unwrap(), (PTRMAP_BTREE, 1));
        assert_eq!(bt.ptrmap_get(2).unwrap_err().code, ErrorCode::Corrupt);
    }

    #[test]
    fn test_roots_stay_packed() {
        let (_db, shared) = scratch(true);
        let guard = shared.inner.lock();
        let mut bt = guard.borrow_mut();
        let a = bt.create_table(BTREE_INTKEY).unwrap();
        let b = bt.create_table(BTREE_INTKEY).unwrap();
        let c = bt.create_table(BTREE_INTKEY).unwrap();
        assert_eq!((a, b, c), (3, 4, 5));
        assert_eq!(bt.drop_table(a).unwrap(), Some(c));
        assert_eq!(bt.header_u32(HDR_META + 4 * BTREE_LARGEST_ROOT_PAGE).unwrap(), 4);
        bt.vacuum_pages(None).unwrap();
        assert_eq!(bt.page_count(), 4);
    }
}
