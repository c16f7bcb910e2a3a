//! Integrity checker (sqlite3BtreeIntegrityCheck)
//!
//! Walks the free list and every requested tree, marking each page in a
//! [`BitVec`] as it is reached. A page reached twice, a page never reached,
//! a pointer-map entry that disagrees with the actual parent, a key out of
//! order or outside its separator bounds, and any malformed page content are
//! all reported as messages. Only I/O failures abort the check.

use std::cmp::Ordering;
use std::sync::Arc;

use tracing::{debug, warn};

use crate::error::{Error, ErrorCode, Result};
use crate::types::Pgno;
use crate::util::bitvec::BitVec;

use super::cursor::SavedKey;
use super::encoding::read_u32;
use super::overflow::overflow_page_count;
use super::page::MemPage;
use super::types::{
    CellInfo, DbHeader, KeyInfo, TransState, UnpackedRecord, BTCURSOR_MAX_DEPTH, BTREE_INCR_VACUUM,
    BTREE_LARGEST_ROOT_PAGE, HDR_FREELIST_TRUNK, HDR_META, PTRMAP_BTREE, PTRMAP_FREEPAGE, PTRMAP_OVERFLOW1,
    PTRMAP_OVERFLOW2, PTRMAP_ROOTPAGE,
};
use super::{BtShared, Btree};

/// Outcome of an integrity check.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct IntegrityReport {
    /// Problems found, at most the requested number
    pub errors: Vec<String>,
    /// Entries counted in each requested tree, in request order
    pub counts: Vec<i64>,
    /// Problems found in total, including those past the budget
    pub n_errors: usize,
}

impl IntegrityReport {
    pub fn is_ok(&self) -> bool {
        self.n_errors == 0
    }
}

/// Exclusive bounds a subtree's keys must respect: `lower < key <= upper`.
#[derive(Clone, Default)]
struct Bounds {
    lower: Option<SavedKey>,
    upper: Option<SavedKey>,
}

struct IntegrityCk<'a> {
    bt: &'a mut BtShared,
    page_refs: BitVec,
    n_page: Pgno,
    max_errors: usize,
    report: IntegrityReport,
    /// Prefix naming the tree and page being checked
    context: String,
}

impl<'a> IntegrityCk<'a> {
    fn add_error(&mut self, message: impl AsRef<str>) {
        self.report.n_errors += 1;
        if self.report.errors.len() < self.max_errors {
            self.report.errors.push(format!("{}{}", self.context, message.as_ref()));
        }
    }

    /// Mark `pgno` as in use (checkRef). Returns false if it was invalid or
    /// already in use.
    fn check_ref(&mut self, pgno: Pgno) -> bool {
        if pgno == 0 || pgno > self.n_page {
            self.add_error(format!("invalid page number {}", pgno));
            return false;
        }
        if self.page_refs.test(pgno) {
            self.add_error(format!("2nd reference to page {}", pgno));
            return false;
        }
        if self.bt.is_ptrmap_page(pgno) {
            self.add_error(format!("pointer map page {} is referenced", pgno));
            return false;
        }
        // In range, so setting cannot fail.
        let _ = self.page_refs.set(pgno);
        true
    }

    /// Compare a pointer-map entry with the expected one (checkPtrmap).
    fn check_ptrmap(&mut self, child: Pgno, kind: u8, parent: Pgno) -> Result<()> {
        if !self.bt.auto_vacuum {
            return Ok(());
        }
        match self.bt.ptrmap_get(child) {
            Ok((got_kind, got_parent)) => {
                if got_kind != kind || got_parent != parent {
                    self.add_error(format!(
                        "bad ptrmap entry for page {}: expected ({},{}) got ({},{})",
                        child, kind, parent, got_kind, got_parent
                    ));
                }
                Ok(())
            }
            Err(err) if is_fatal(err.code) => Err(err),
            Err(err) => {
                self.add_error(format!("failed to read ptrmap entry for page {}: {}", child, err));
                Ok(())
            }
        }
    }

    /// Walk the free list (checkList).
    fn check_free_list(&mut self) -> Result<()> {
        let expected = self.bt.header_u32(HDR_META)?;
        let mut trunk = self.bt.header_u32(HDR_FREELIST_TRUNK)?;
        let max_leaves = self.bt.usable_size / 4 - 2;
        let mut seen = 0u32;
        self.context = "free list: ".to_string();
        while trunk != 0 {
            if seen >= expected {
                self.add_error(format!("more pages than the {} recorded in the header", expected));
                break;
            }
            if !self.check_ref(trunk) {
                break;
            }
            seen += 1;
            self.check_ptrmap(trunk, PTRMAP_FREEPAGE, 0)?;
            let page = self.bt.raw_page(trunk)?;
            let next = read_u32(&page, 0).unwrap_or(0);
            let n_leaf = read_u32(&page, 4).unwrap_or(0);
            if n_leaf > max_leaves {
                self.add_error(format!("leaf count {} too big on trunk page {}", n_leaf, trunk));
                break;
            }
            for j in 0..n_leaf as usize {
                let leaf = read_u32(&page, 8 + 4 * j).unwrap_or(0);
                if self.check_ref(leaf) {
                    self.check_ptrmap(leaf, PTRMAP_FREEPAGE, 0)?;
                }
                seen += 1;
            }
            trunk = next;
        }
        if seen != expected {
            self.add_error(format!("size is {} but should be {}", seen, expected));
        }
        self.context.clear();
        Ok(())
    }

    /// Follow a cell's overflow chain (checkList on an overflow chain).
    fn check_overflow(&mut self, info: &CellInfo, owner: Pgno) -> Result<()> {
        let expected = overflow_page_count(info, self.bt.usable_size);
        let mut pgno = info.overflow_pgno;
        let mut prev = owner;
        let mut found = 0u32;
        while pgno != 0 {
            if found >= expected {
                self.add_error(format!("overflow chain of page {} is too long", owner));
                return Ok(());
            }
            if !self.check_ref(pgno) {
                return Ok(());
            }
            let kind = if found == 0 { PTRMAP_OVERFLOW1 } else { PTRMAP_OVERFLOW2 };
            self.check_ptrmap(pgno, kind, prev)?;
            found += 1;
            let page = self.bt.raw_page(pgno)?;
            prev = pgno;
            pgno = read_u32(&page, 0).unwrap_or(0);
        }
        if found != expected {
            self.add_error(format!(
                "overflow chain of page {} has {} pages, payload needs {}",
                owner, found, expected
            ));
        }
        Ok(())
    }

    /// Cells and freeblocks must not overlap and the unaccounted bytes must
    /// match the fragment count.
    fn check_space(&mut self, page: &MemPage, cells: &[(usize, usize)]) {
        let content = page.content_start();
        let end = page.limits.usable_end();
        if content < page.ptr_array_end() || content > end {
            self.add_error(format!("content area starts at {}", content));
            return;
        }
        let blocks = match page.freeblocks() {
            Ok(blocks) => blocks,
            Err(err) => {
                self.add_error(err.to_string());
                return;
            }
        };
        let mut spans: Vec<(usize, usize)> = cells.iter().chain(blocks.iter()).copied().collect();
        spans.sort_unstable();
        let mut covered = 0usize;
        let mut last_end = content;
        for (start, size) in spans {
            if start < content || start + size > end {
                self.add_error(format!("cell or freeblock at {} outside the content area", start));
                return;
            }
            if start < last_end {
                self.add_error(format!("multiple uses for byte {}", start));
                return;
            }
            covered += size;
            last_end = start + size;
        }
        let gaps = (end - content) - covered;
        if gaps != page.frag_bytes() {
            self.add_error(format!("fragmentation of {} bytes reported as {}", gaps, page.frag_bytes()));
        }
    }

    fn key_of(&mut self, page: &MemPage, i: u16, with_index_keys: bool) -> Result<Option<SavedKey>> {
        if page.int_key {
            return Ok(Some(SavedKey::Int(page.cell_info(i)?.n_key)));
        }
        if with_index_keys {
            return Ok(Some(SavedKey::Blob(self.bt.cell_payload(page, i)?)));
        }
        Ok(None)
    }

    /// Check one page and everything below it (checkTreePage). Returns the
    /// depth of the leaves below `pgno`, or None when the page could not be
    /// checked.
    #[allow(clippy::too_many_arguments)]
    fn check_tree_page(
        &mut self,
        root: Pgno,
        pgno: Pgno,
        parent: Pgno,
        depth: usize,
        int_key: bool,
        key_info: Option<&KeyInfo>,
        bounds: Bounds,
        count: &mut i64,
    ) -> Result<Option<usize>> {
        let saved_context = std::mem::replace(&mut self.context, format!("tree {} page {}: ", root, pgno));
        let result = self.check_tree_page_inner(root, pgno, parent, depth, int_key, key_info, bounds, count);
        self.context = saved_context;
        result
    }

    #[allow(clippy::too_many_arguments)]
    fn check_tree_page_inner(
        &mut self,
        root: Pgno,
        pgno: Pgno,
        parent: Pgno,
        depth: usize,
        int_key: bool,
        key_info: Option<&KeyInfo>,
        bounds: Bounds,
        count: &mut i64,
    ) -> Result<Option<usize>> {
        if depth > BTCURSOR_MAX_DEPTH {
            self.add_error("tree is too deep");
            return Ok(None);
        }
        if !self.check_ref(pgno) {
            return Ok(None);
        }
        if parent == 0 {
            if pgno > 1 {
                self.check_ptrmap(pgno, PTRMAP_ROOTPAGE, 0)?;
            }
        } else {
            self.check_ptrmap(pgno, PTRMAP_BTREE, parent)?;
        }
        let page = match self.bt.get_page(pgno) {
            Ok(page) => page,
            Err(err) if is_fatal(err.code) => return Err(err),
            Err(err) => {
                self.add_error(format!("cannot parse page: {}", err));
                return Ok(None);
            }
        };
        if page.int_key != int_key {
            self.add_error(format!("page type 0x{:02x} does not match the tree", page.flags));
            return Ok(None);
        }

        let compare = |a: &SavedKey, b: &SavedKey| compare_keys(key_info, a, b);
        let mut spans = Vec::with_capacity(page.n_cell as usize);
        let mut prev: Option<SavedKey> = bounds.lower.clone();
        let mut child_depth: Option<usize> = None;
        for i in 0..page.n_cell {
            let info = match page.cell_ptr(i).and_then(|pc| page.parse_cell_at(pc).map(|info| (pc, info))) {
                Ok((pc, info)) => {
                    spans.push((pc, info.n_size));
                    info
                }
                Err(err) => {
                    self.add_error(format!("cell {}: {}", i, err));
                    return Ok(None);
                }
            };
            if info.overflow_pgno != 0 {
                self.check_overflow(&info, pgno)?;
            }
            let key = match self.key_of(&page, i, key_info.is_some()) {
                Ok(key) => key,
                Err(err) if is_fatal(err.code) => return Err(err),
                Err(err) => {
                    self.add_error(format!("cell {}: {}", i, err));
                    None
                }
            };
            if !page.leaf {
                let child = match page.child(i) {
                    Ok(child) => child,
                    Err(err) => {
                        self.add_error(format!("cell {}: {}", i, err));
                        return Ok(None);
                    }
                };
                let child_bounds = Bounds {
                    lower: prev.clone(),
                    upper: key.clone().or_else(|| bounds.upper.clone()),
                };
                let d = self.check_tree_page(root, child, pgno, depth + 1, int_key, key_info, child_bounds, count)?;
                self.check_child_depth(&mut child_depth, d);
            }
            if let Some(key) = &key {
                if let Some(lower) = &prev {
                    if compare(key, lower) != Ordering::Greater {
                        self.add_error(format!("cell {}: key out of order", i));
                    }
                }
                if let Some(upper) = &bounds.upper {
                    if compare(key, upper) == Ordering::Greater {
                        self.add_error(format!("cell {}: key above its separator", i));
                    }
                }
                prev = Some(key.clone());
            }
        }
        if page.leaf {
            *count += page.n_cell as i64;
        } else {
            match page.child(page.n_cell) {
                Ok(right) => {
                    let right_bounds = Bounds {
                        lower: prev.clone(),
                        upper: bounds.upper.clone(),
                    };
                    let d = self.check_tree_page(root, right, pgno, depth + 1, int_key, key_info, right_bounds, count)?;
                    self.check_child_depth(&mut child_depth, d);
                }
                Err(err) => self.add_error(err.to_string()),
            }
        }
        self.check_space(&page, &spans);
        Ok(if page.leaf { Some(0) } else { child_depth.map(|d| d + 1) })
    }

    fn check_child_depth(&mut self, seen: &mut Option<usize>, depth: Option<usize>) {
        let Some(depth) = depth else { return };
        match *seen {
            None => *seen = Some(depth),
            Some(d) if d != depth => self.add_error(format!("child page depth differs ({} vs {})", d, depth)),
            Some(_) => {}
        }
    }

    fn check_file(&mut self, max_root: Pgno, in_write: bool) -> Result<()> {
        self.context.clear();
        if self.bt.auto_vacuum {
            let meta4 = self.bt.header_u32(HDR_META + 4 * BTREE_LARGEST_ROOT_PAGE)?;
            if max_root > meta4 {
                self.add_error(format!("max rootpage ({}) disagrees with header ({})", max_root, meta4));
            }
            if !self.bt.incr_vacuum && !in_write && self.bt.free_page_count()? > 0 {
                self.add_error("free pages remain in a full auto-vacuum database");
            }
        } else if self.bt.header_u32(HDR_META + 4 * BTREE_INCR_VACUUM)? != 0 {
            self.add_error("incremental_vacuum enabled with a max rootpage of zero");
        }
        if !in_write {
            let page1 = self.bt.raw_page(1)?;
            if DbHeader::db_size_valid(&page1) {
                let recorded = read_u32(&page1, 28).unwrap_or(0);
                if recorded != self.n_page {
                    self.add_error(format!("header records {} pages but the file has {}", recorded, self.n_page));
                }
            }
        }
        let pending = self.bt.pending_byte_page();
        let unused: Vec<Pgno> = self
            .page_refs
            .unset()
            .filter(|&p| p != pending && !self.bt.is_ptrmap_page(p))
            .collect();
        for pgno in unused {
            self.add_error(format!("page {} is never used", pgno));
        }
        Ok(())
    }
}

fn is_fatal(code: ErrorCode) -> bool {
    matches!(code, ErrorCode::IoErr | ErrorCode::NoMem)
}

fn compare_keys(key_info: Option<&KeyInfo>, a: &SavedKey, b: &SavedKey) -> Ordering {
    match (a, b) {
        (SavedKey::Int(x), SavedKey::Int(y)) => x.cmp(y),
        (SavedKey::Blob(x), SavedKey::Blob(y)) => match key_info {
            Some(info) => info.compare(x, &UnpackedRecord::new(y)),
            None => x.cmp(y),
        },
        (SavedKey::Int(_), SavedKey::Blob(_)) => Ordering::Less,
        (SavedKey::Blob(_), SavedKey::Int(_)) => Ordering::Greater,
    }
}

impl BtShared {
    pub(crate) fn integrity_check(
        &mut self,
        roots: &[(Pgno, Option<Arc<KeyInfo>>)],
        max_errors: usize,
        in_write: bool,
    ) -> Result<IntegrityReport> {
        let n_page = self.page_count();
        let mut ck = IntegrityCk {
            bt: self,
            page_refs: BitVec::new(n_page),
            n_page,
            max_errors,
            report: IntegrityReport::default(),
            context: String::new(),
        };
        if n_page == 0 {
            ck.report.counts = vec![0; roots.len()];
            return Ok(ck.report);
        }
        ck.check_free_list()?;

        let mut max_root = 0;
        let mut counts = Vec::with_capacity(roots.len());
        let checks_page1 = roots.iter().any(|(r, _)| *r == 1);
        let extra = if checks_page1 { None } else { Some((1, None)) };
        for (root, key_info) in roots.iter().cloned().chain(extra.clone()) {
            let mut count = 0i64;
            if root == 0 {
                counts.push(0);
                continue;
            }
            max_root = max_root.max(root);
            let int_key = match ck.bt.get_page(root) {
                Ok(page) => page.int_key,
                Err(err) if is_fatal(err.code) => return Err(err),
                Err(_) => true,
            };
            ck.check_tree_page(root, root, 0, 0, int_key, key_info.as_deref(), Bounds::default(), &mut count)?;
            counts.push(count);
        }
        if extra.is_some() {
            counts.pop();
        }
        ck.check_file(max_root, in_write)?;
        ck.report.counts = counts;
        if ck.report.n_errors > 0 {
            warn!(errors = ck.report.n_errors, "integrity check found problems");
        } else {
            debug!(pages = n_page, "integrity check passed");
        }
        Ok(ck.report)
    }
}

impl Btree {
    /// sqlite3BtreeIntegrityCheck over the trees rooted at `roots`. Index
    /// key order is not checked; see [`integrity_check_with`](Self::integrity_check_with).
    pub fn integrity_check(&self, roots: &[Pgno], max_errors: usize) -> Result<IntegrityReport> {
        let roots: Vec<(Pgno, Option<Arc<KeyInfo>>)> = roots.iter().map(|&r| (r, None)).collect();
        self.integrity_check_with(&roots, max_errors)
    }

    /// Integrity check with a comparator per index tree.
    pub fn integrity_check_with(
        &self,
        roots: &[(Pgno, Option<Arc<KeyInfo>>)],
        max_errors: usize,
    ) -> Result<IntegrityReport> {
        self.shared.with(|bt| {
            let trans = bt.conn_trans(self.id);
            if trans == TransState::None {
                return Err(Error::with_message(ErrorCode::Misuse, "integrity check outside a transaction"));
            }
            bt.integrity_check(roots, max_errors, trans == TransState::Write)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::btree::tests::scratch;
    use crate::storage::btree::{
        BtreeCursorFlags, BtreeInsertFlags, BtreePayload, BTREE_BLOBKEY, BTREE_INTKEY,
    };

    fn fill(db: &Btree, root: Pgno, n: i64, size: usize) {
        let mut cur = db.cursor(root, BtreeCursorFlags::WRCSR, None).unwrap();
        for rowid in 0..n {
            cur.insert(&BtreePayload::table(rowid, vec![(rowid % 256) as u8; size]), BtreeInsertFlags::empty(), None)
                .unwrap();
        }
    }

    #[test]
    fn test_healthy_database_passes() {
        let (db, _) = scratch(false);
        let table = db.create_table(BTREE_INTKEY).unwrap();
        let index = db.create_table(BTREE_BLOBKEY).unwrap();
        fill(&db, table, 500, 150);
        {
            let mut cur = db.cursor(index, BtreeCursorFlags::WRCSR, Some(Arc::new(KeyInfo::new()))).unwrap();
            for i in 0..300u32 {
                let key = format!("key-{:05}", i * 7 % 300).into_bytes();
                cur.insert(&BtreePayload::index(key), BtreeInsertFlags::empty(), None).unwrap();
            }
        }
        let roots = vec![(table, None), (index, Some(Arc::new(KeyInfo::new())))];
        let report = db.integrity_check_with(&roots, 100).unwrap();
        assert!(report.is_ok(), "{:?}", report.errors);
        assert_eq!(report.counts, vec![500, 300]);
    }

    #[test]
    fn test_auto_vacuum_database_passes() {
        let (db, _) = scratch(true);
        let a = db.create_table(BTREE_INTKEY).unwrap();
        let b = db.create_table(BTREE_INTKEY).unwrap();
        fill(&db, a, 200, 3000);
        fill(&db, b, 50, 10);
        let report = db.integrity_check(&[1, a, b], 100).unwrap();
        assert!(report.is_ok(), "{:?}", report.errors);
        assert_eq!(report.counts, vec![0, 200, 50]);
    }

    #[test]
    fn test_unreferenced_page_is_reported() {
        let (db, _shared) = scratch(false);
        let root = db.create_table(BTREE_INTKEY).unwrap();
        let orphan = db.create_table(BTREE_INTKEY).unwrap();
        let report = db.integrity_check(&[root], 10).unwrap();
        assert_eq!(report.n_errors, 1);
        assert!(report.errors[0].contains(&format!("page {} is never used", orphan)));
    }

    #[test]
    fn test_corrupt_order_is_reported_and_budget_applies() {
        let (db, shared) = scratch(false);
        let root = db.create_table(BTREE_INTKEY).unwrap();
        fill(&db, root, 5, 10);
        {
            // Swap the first two cell pointers so the rowids are out of order.
            let guard = shared.inner.lock();
            let mut bt = guard.borrow_mut();
            let mut page = bt.raw_page(root).unwrap();
            let data = page.make_mut();
            let (a, b) = (data[8..10].to_vec(), data[10..12].to_vec());
            data[8..10].copy_from_slice(&b);
            data[10..12].copy_from_slice(&a);
            bt.write_raw(page).unwrap();
        }
        let report = db.integrity_check(&[root], 0).unwrap();
        assert!(!report.is_ok());
        assert!(report.errors.is_empty());
        assert_eq!(report.counts, vec![5]);
        let report = db.integrity_check(&[root], 10).unwrap();
        assert!(report.errors.iter().any(|e| e.contains("out of order")));
    }
}
