//! Free-page list
//!
//! Free pages form a list of trunk pages. Each trunk holds the number of
//! the next trunk, a leaf count and that many leaf page numbers. The head
//! trunk and the total number of free pages live in the file header.

use tracing::trace;

use crate::error::{Error, ErrorCode, Result};
use crate::storage::pager::DbPage;
use crate::types::Pgno;

use super::encoding::{read_u32, write_u32};
use super::types::{HDR_FREELIST_TRUNK, HDR_META, PTRMAP_FREEPAGE};
use super::BtShared;

/// How `allocate_page` picks a page.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum AllocMode {
    /// Any page; the free list is used first
    Any,
    /// This page if it is free, otherwise any page
    Exact(Pgno),
}

impl BtShared {
    /// Leaf slots a trunk page can describe.
    fn max_trunk_leaves(&self) -> u32 {
        self.usable_size / 4 - 2
    }

    /// Leaf slots filled before a new trunk is started. Kept below the
    /// maximum so files stay readable by older versions of the format.
    fn trunk_fill_limit(&self) -> u32 {
        self.usable_size / 4 - 8
    }

    pub(crate) fn free_page_count(&mut self) -> Result<u32> {
        self.header_u32(HDR_META)
    }

    /// Allocate a page (allocateBtreePage). The returned image is zeroed and
    /// is not yet journaled.
    pub(crate) fn allocate_page(&mut self, mode: AllocMode) -> Result<DbPage> {
        let n_free = self.header_u32(HDR_META)?;
        if n_free > 0 {
            if let Some(pgno) = self.take_free_page(mode)? {
                self.put_header_u32(HDR_META, n_free - 1)?;
                trace!(pgno, "reusing free page");
                return Ok(self.zero_page(pgno));
            }
            if mode == AllocMode::Any {
                return Err(Error::with_message(
                    ErrorCode::Corrupt,
                    format!("free list holds fewer than {} pages", n_free),
                ));
            }
        }
        self.extend_file()
    }

    /// Unlink a page from the free list according to `mode`.
    fn take_free_page(&mut self, mode: AllocMode) -> Result<Option<Pgno>> {
        let n_free = self.header_u32(HDR_META)?;
        let mut prev: Option<Pgno> = None;
        let mut trunk = self.header_u32(HDR_FREELIST_TRUNK)?;
        let mut visited = 0u32;
        while trunk != 0 {
            visited += 1;
            if visited > n_free || trunk < 2 || trunk > self.page_count() {
                return Err(Error::corrupt_page(trunk, "bad free-list trunk"));
            }
            let mut page = self.raw_page(trunk)?;
            let next = read_u32(&page, 0).unwrap_or(0);
            let n_leaf = read_u32(&page, 4).unwrap_or(0);
            if n_leaf > self.max_trunk_leaves() {
                return Err(Error::corrupt_page(trunk, format!("free-list trunk claims {} leaves", n_leaf)));
            }
            let leaf_at = |k: u32| 8 + 4 * k as usize;
            match mode {
                AllocMode::Any => {
                    if n_leaf == 0 {
                        self.unlink_trunk(prev, next)?;
                        return Ok(Some(trunk));
                    }
                    let leaf = read_u32(&page, leaf_at(n_leaf - 1)).unwrap_or(0);
                    if leaf < 2 || leaf > self.page_count() {
                        return Err(Error::corrupt_page(trunk, format!("free-list leaf {} out of range", leaf)));
                    }
                    let buf = page.make_mut();
                    write_u32(buf, 4, n_leaf - 1)?;
                    write_u32(buf, leaf_at(n_leaf - 1), 0)?;
                    self.write_raw(page)?;
                    return Ok(Some(leaf));
                }
                AllocMode::Exact(want) if want == trunk => {
                    if n_leaf == 0 {
                        self.unlink_trunk(prev, next)?;
                        return Ok(Some(trunk));
                    }
                    // The last leaf takes over as trunk for the others.
                    let heir = read_u32(&page, leaf_at(n_leaf - 1)).unwrap_or(0);
                    if heir < 2 || heir > self.page_count() {
                        return Err(Error::corrupt_page(trunk, "free-list leaf out of range"));
                    }
                    let mut image = self.zero_page(heir);
                    let buf = image.make_mut();
                    write_u32(buf, 0, next)?;
                    write_u32(buf, 4, n_leaf - 1)?;
                    buf[8..leaf_at(n_leaf - 1)].copy_from_slice(&page[8..leaf_at(n_leaf - 1)]);
                    self.write_raw(image)?;
                    self.unlink_trunk(prev, heir)?;
                    return Ok(Some(trunk));
                }
                AllocMode::Exact(want) => {
                    let found = (0..n_leaf).find(|&k| read_u32(&page, leaf_at(k)) == Some(want));
                    if let Some(k) = found {
                        let last = read_u32(&page, leaf_at(n_leaf - 1)).unwrap_or(0);
                        let buf = page.make_mut();
                        write_u32(buf, leaf_at(k), last)?;
                        write_u32(buf, leaf_at(n_leaf - 1), 0)?;
                        write_u32(buf, 4, n_leaf - 1)?;
                        self.write_raw(page)?;
                        return Ok(Some(want));
                    }
                }
            }
            prev = Some(trunk);
            trunk = next;
        }
        Ok(None)
    }

    /// Point `prev` (or the header when `prev` is None) at `next`.
    fn unlink_trunk(&mut self, prev: Option<Pgno>, next: Pgno) -> Result<()> {
        match prev {
            None => self.put_header_u32(HDR_FREELIST_TRUNK, next),
            Some(p) => {
                let mut page = self.raw_page(p)?;
                write_u32(page.make_mut(), 0, next)?;
                self.write_raw(page)
            }
        }
    }

    /// Grow the file by one content page, stepping over pointer-map pages
    /// and the lock-byte page.
    fn extend_file(&mut self) -> Result<DbPage> {
        let mut pgno = self.page_count() + 1;
        loop {
            if pgno == self.pending_byte_page() {
                pgno += 1;
                continue;
            }
            if self.is_ptrmap_page(pgno) {
                let image = self.zero_page(pgno);
                self.write_raw(image)?;
                pgno += 1;
                continue;
            }
            break;
        }
        let image = self.zero_page(pgno);
        self.write_raw(image.clone())?;
        trace!(pgno, "extended database file");
        Ok(image)
    }

    /// Return a page to the free list (freePage2).
    pub(crate) fn free_page(&mut self, pgno: Pgno) -> Result<()> {
        if pgno < 2 || pgno > self.page_count() {
            return Err(Error::corrupt_page(pgno, "freeing page out of range"));
        }
        let n_free = self.header_u32(HDR_META)?;
        self.put_header_u32(HDR_META, n_free + 1)?;
        if self.secure_delete() {
            let image = self.zero_page(pgno);
            self.write_raw(image)?;
        }
        self.ptrmap_put(pgno, PTRMAP_FREEPAGE, 0)?;

        let trunk = self.header_u32(HDR_FREELIST_TRUNK)?;
        if trunk != 0 {
            if trunk > self.page_count() {
                return Err(Error::corrupt_page(trunk, "free-list trunk out of range"));
            }
            let mut page = self.raw_page(trunk)?;
            let n_leaf = read_u32(&page, 4).unwrap_or(0);
            if n_leaf > self.max_trunk_leaves() {
                return Err(Error::corrupt_page(trunk, format!("free-list trunk claims {} leaves", n_leaf)));
            }
            if n_leaf < self.trunk_fill_limit() {
                let buf = page.make_mut();
                write_u32(buf, 8 + 4 * n_leaf as usize, pgno)?;
                write_u32(buf, 4, n_leaf + 1)?;
                return self.write_raw(page);
            }
        }
        let mut image = self.zero_page(pgno);
        write_u32(image.make_mut(), 0, trunk)?;
        self.write_raw(image)?;
        self.put_header_u32(HDR_FREELIST_TRUNK, pgno)
    }

    /// Every page on the free list, trunks included.
    pub(crate) fn free_list_pages(&mut self) -> Result<Vec<Pgno>> {
        let n_free = self.header_u32(HDR_META)?;
        let mut pages = Vec::with_capacity(n_free as usize);
        let mut trunk = self.header_u32(HDR_FREELIST_TRUNK)?;
        while trunk != 0 {
            if pages.len() >= n_free as usize || trunk < 2 || trunk > self.page_count() {
                return Err(Error::corrupt_page(trunk, "bad free-list trunk"));
            }
            pages.push(trunk);
            let page = self.raw_page(trunk)?;
            let n_leaf = read_u32(&page, 4).unwrap_or(0);
            if n_leaf > self.max_trunk_leaves() {
                return Err(Error::corrupt_page(trunk, format!("free-list trunk claims {} leaves", n_leaf)));
            }
            for k in 0..n_leaf as usize {
                let leaf = read_u32(&page, 8 + 4 * k).unwrap_or(0);
                if leaf < 2 || leaf > self.page_count() {
                    return Err(Error::corrupt_page(trunk, format!("free-list leaf {} out of range", leaf)));
                }
                pages.push(leaf);
            }
            trunk = read_u32(&page, 0).unwrap_or(0);
        }
        if pages.len() != n_free as usize {
            return Err(Error::with_message(
                ErrorCode::Corrupt,
                format!("free list has {} pages but header says {}", pages.len(), n_free),
            ));
        }
        Ok(pages)
    }

    /// Replace the free list with exactly `pages`.
    pub(crate) fn rebuild_free_list(&mut self, mut pages: Vec<Pgno>) -> Result<()> {
        pages.sort_unstable();
        self.put_header_u32(HDR_META, pages.len() as u32)?;
        let per_trunk = self.trunk_fill_limit() as usize + 1;
        let mut next = 0;
        for group in pages.chunks(per_trunk).rev() {
            let trunk = group[0];
            let mut image = self.zero_page(trunk);
            let buf = image.make_mut();
            write_u32(buf, 0, next)?;
            write_u32(buf, 4, (group.len() - 1) as u32)?;
            for (k, leaf) in group[1..].iter().enumerate() {
                write_u32(buf, 8 + 4 * k, *leaf)?;
            }
            self.write_raw(image)?;
            for pgno in group {
                self.ptrmap_put(*pgno, PTRMAP_FREEPAGE, 0)?;
            }
            next = trunk;
        }
        self.put_header_u32(HDR_FREELIST_TRUNK, next)
    }
}

#[cfg(test)]
mod tests {
    use crate::storage::btree::tests::scratch;

    use super::*;

    #[test]
    fn test_freed_pages_are_reused_before_growing() {
        let (_db, shared) = scratch(false);
        let guard = shared.inner.lock();
        let mut bt = guard.borrow_mut();
        let a = bt.allocate_page(AllocMode::Any).unwrap().pgno();
        let b = bt.allocate_page(AllocMode::Any).unwrap().pgno();
        assert_eq!((a, b), (2, 3));
        bt.free_page(a).unwrap();
        bt.free_page(b).unwrap();
        assert_eq!(bt.free_page_count().unwrap(), 2);
        let mut again = vec![
            bt.allocate_page(AllocMode::Any).unwrap().pgno(),
            bt.allocate_page(AllocMode::Any).unwrap().pgno(),
        ];
        again.sort_unstable();
        assert_eq!(again, vec![2, 3]);
        assert_eq!(bt.free_page_count().unwrap(), 0);
        assert_eq!(bt.allocate_page(AllocMode::Any).unwrap().pgno(), 4);
    }

    #[test]
    fn test_exact_allocation_from_trunk_and_leaf() {
        let (_db, shared) = scratch(false);
        let guard = shared.inner.lock();
        let mut bt = guard.borrow_mut();
        for _ in 0..5 {
            bt.allocate_page(AllocMode::Any).unwrap();
        }
        for pgno in 2..=6 {
            bt.free_page(pgno).unwrap();
        }
        // Page 2 became the trunk; 3..=6 are its leaves.
        assert_eq!(bt.allocate_page(AllocMode::Exact(4)).unwrap().pgno(), 4);
        assert_eq!(bt.allocate_page(AllocMode::Exact(2)).unwrap().pgno(), 2);
        let mut rest = bt.free_list_pages().unwrap();
        rest.sort_unstable();
        assert_eq!(rest, vec![3, 5, 6]);
    }

    #[test]
    fn test_rebuild_free_list() {
        let (_db, shared) = scratch(false);
        let guard = shared.inner.lock();
        let mut bt = guard.borrow_mut();
        for _ in 0..9 {
            bt.allocate_page(AllocMode::Any).unwrap();
        }
        bt.rebuild_free_list(vec![9, 3, 7]).unwrap();
        assert_eq!(bt.free_page_count().unwrap(), 3);
        let mut pages = bt.free_list_pages().unwrap();
        pages.sort_unstable();
        assert_eq!(pages, vec![3, 7, 9]);
    }

    #[test]
    fn test_free_page_rejects_page_one() {
        let (_db, shared) = scratch(false);
        let guard = shared.inner.lock();
        let mut bt = guard.borrow_mut();
        assert_eq!(bt.free_page(1).unwrap_err().code, ErrorCode::Corrupt);
    }
}
