//! On-page b-tree format (MemPage)
//!
//! Page layout, starting at byte 100 on page 1 and byte 0 elsewhere:
//!
//! ```text
//! 0      flags (0x0d table leaf, 0x05 table interior, 0x0a index leaf, 0x02 index interior)
//! 1..3   first freeblock
//! 3..5   number of cells
//! 5..7   start of cell content area (0 means 65536)
//! 7      fragmented free bytes
//! 8..12  right-most child (interior pages only)
//! ...    cell pointer array, then unallocated space, then cell content
//! ```
//!
//! Every offset and count read from a page is bounds-checked before use so
//! that a damaged file reports `Corrupt` instead of misbehaving.

use crate::error::{Error, ErrorCode, Result};
use crate::storage::pager::DbPage;
use crate::types::Pgno;

use super::encoding::{read_u16, read_u32, read_varint, read_varint32, write_u16, write_u32, write_varint};
use super::types::{
    CellInfo, PageLimits, CELL_PTR_SIZE, MIN_CELL_SIZE, PAGE_HEADER_SIZE_INTERIOR,
    PAGE_HEADER_SIZE_LEAF, PTF_INDEX_INTERIOR, PTF_INDEX_LEAF, PTF_TABLE_INTERIOR, PTF_TABLE_LEAF,
};

/// A parsed b-tree page.
#[derive(Clone, Debug)]
pub struct MemPage {
    page: DbPage,
    pub pgno: Pgno,
    pub limits: PageLimits,
    pub flags: u8,
    pub leaf: bool,
    pub int_key: bool,
    pub n_cell: u16,
}

impl MemPage {
    /// Parse and sanity-check a page (btreeInitPage).
    pub fn parse(page: DbPage, limits: PageLimits) -> Result<Self> {
        let pgno = page.pgno();
        let hdr = limits.header_start();
        let flags = *page
            .get(hdr)
            .ok_or_else(|| Error::corrupt_page(pgno, "page shorter than header"))?;
        let (leaf, int_key) = match flags {
            PTF_TABLE_LEAF => (true, true),
            PTF_TABLE_INTERIOR => (false, true),
            PTF_INDEX_LEAF => (true, false),
            PTF_INDEX_INTERIOR => (false, false),
            other => {
                let header = &page[hdr..(hdr + PAGE_HEADER_SIZE_INTERIOR).min(page.len())];
                return Err(Error::corrupt_page(
                    pgno,
                    format!("invalid page type 0x{:02x} (header {})", other, hex::encode(header)),
                ));
            }
        };
        let n_cell = read_u16(&page, hdr + 3)
            .ok_or_else(|| Error::corrupt_page(pgno, "truncated header"))?;
        let mem = MemPage {
            page,
            pgno,
            limits,
            flags,
            leaf,
            int_key,
            n_cell,
        };
        let max_cells = (limits.usable_end() - 8) / 6;
        if n_cell as usize > max_cells {
            return Err(Error::corrupt_page(pgno, format!("too many cells ({})", n_cell)));
        }
        let content = mem.content_start();
        if content < mem.ptr_array_end() || content > limits.usable_end() {
            return Err(Error::corrupt_page(
                pgno,
                format!("cell content area starts at {}", content),
            ));
        }
        Ok(mem)
    }

    /// Initialize an empty page of the given type (zeroPage).
    pub fn init(mut page: DbPage, flags: u8, limits: PageLimits) -> Self {
        let hdr = limits.header_start();
        let pgno = page.pgno();
        let data = page.make_mut();
        data[hdr..].fill(0);
        data[hdr] = flags;
        let end = limits.usable_end();
        // 65536 is stored as 0.
        let stored = if end == 65536 { 0 } else { end as u16 };
        data[hdr + 5..hdr + 7].copy_from_slice(&stored.to_be_bytes());
        MemPage {
            page,
            pgno,
            limits,
            flags,
            leaf: flags & super::types::PTF_LEAF != 0,
            int_key: flags & super::types::PTF_INTKEY != 0,
            n_cell: 0,
        }
    }

    pub fn data(&self) -> &[u8] {
        &self.page
    }

    pub fn data_mut(&mut self) -> &mut [u8] {
        self.page.make_mut()
    }

    pub fn into_page(self) -> DbPage {
        self.page
    }

    pub fn is_table_leaf(&self) -> bool {
        self.leaf && self.int_key
    }

    pub fn hdr(&self) -> usize {
        self.limits.header_start()
    }

    pub fn header_size(&self) -> usize {
        if self.leaf {
            PAGE_HEADER_SIZE_LEAF
        } else {
            PAGE_HEADER_SIZE_INTERIOR
        }
    }

    /// Start of the cell pointer array.
    pub fn cell_offset(&self) -> usize {
        self.hdr() + self.header_size()
    }

    pub fn ptr_array_end(&self) -> usize {
        self.cell_offset() + CELL_PTR_SIZE * self.n_cell as usize
    }

    pub fn content_start(&self) -> usize {
        match read_u16(&self.page, self.hdr() + 5) {
            Some(0) => 65536,
            Some(v) => v as usize,
            None => 0,
        }
    }

    fn set_content_start(&mut self, offset: usize) {
        let hdr = self.hdr();
        let stored = if offset >= 65536 { 0 } else { offset as u16 };
        self.page.make_mut()[hdr + 5..hdr + 7].copy_from_slice(&stored.to_be_bytes());
    }

    pub fn first_freeblock(&self) -> usize {
        read_u16(&self.page, self.hdr() + 1).unwrap_or(0) as usize
    }

    pub fn frag_bytes(&self) -> usize {
        self.page[self.hdr() + 7] as usize
    }

    fn set_n_cell(&mut self, n: u16) {
        self.n_cell = n;
        let hdr = self.hdr();
        self.page.make_mut()[hdr + 3..hdr + 5].copy_from_slice(&n.to_be_bytes());
    }

    /// Bytes available for cells and pointers on an empty page of this kind.
    pub fn capacity(&self) -> usize {
        self.limits.capacity(self.leaf)
    }

    // ========================================================================
    // Cells
    // ========================================================================

    /// Offset of cell `i`, validated against the content area.
    pub fn cell_ptr(&self, i: u16) -> Result<usize> {
        if i >= self.n_cell {
            return Err(Error::corrupt_page(self.pgno, format!("cell index {} out of range", i)));
        }
        let at = self.cell_offset() + CELL_PTR_SIZE * i as usize;
        let pc = read_u16(&self.page, at)
            .ok_or_else(|| Error::corrupt_page(self.pgno, "truncated cell pointer array"))?
            as usize;
        if pc < self.ptr_array_end() || pc > self.limits.usable_end() - MIN_CELL_SIZE {
            return Err(Error::corrupt_page(self.pgno, format!("cell {} at bad offset {}", i, pc)));
        }
        Ok(pc)
    }

    /// Parse the cell starting at byte `pc` (btreeParseCellPtr).
    pub fn parse_cell_at(&self, pc: usize) -> Result<CellInfo> {
        let usable = self.limits.usable_end();
        let bytes = self
            .page
            .get(pc..usable)
            .ok_or_else(|| Error::corrupt_page(self.pgno, format!("cell offset {} past usable area", pc)))?;
        parse_cell(bytes, self.leaf, self.int_key, &self.limits)
            .map_err(|e| Error::corrupt_page(self.pgno, format!("cell at {}: {}", pc, e)))
    }

    pub fn cell_info(&self, i: u16) -> Result<CellInfo> {
        self.parse_cell_at(self.cell_ptr(i)?)
    }

    /// Raw bytes of cell `i`.
    pub fn cell(&self, i: u16) -> Result<&[u8]> {
        let pc = self.cell_ptr(i)?;
        let info = self.parse_cell_at(pc)?;
        Ok(&self.page[pc..pc + info.n_size])
    }

    /// Locally stored payload of cell `i`.
    pub fn local_payload(&self, i: u16) -> Result<(&[u8], CellInfo)> {
        let pc = self.cell_ptr(i)?;
        let info = self.parse_cell_at(pc)?;
        let start = pc + info.n_header;
        Ok((&self.page[start..start + info.n_local as usize], info))
    }

    /// Rowid of cell `i` on a table page.
    pub fn int_key_at(&self, i: u16) -> Result<i64> {
        Ok(self.cell_info(i)?.n_key)
    }

    /// Child page `i`, where `i == n_cell` names the right-most child.
    pub fn child(&self, i: u16) -> Result<Pgno> {
        if self.leaf {
            return Err(Error::corrupt_page(self.pgno, "leaf page has no children"));
        }
        let pgno = if i == self.n_cell {
            self.right_child()
        } else {
            let pc = self.cell_ptr(i)?;
            read_u32(&self.page, pc).unwrap_or(0)
        };
        if pgno < 2 {
            return Err(Error::corrupt_page(self.pgno, format!("child {} is page {}", i, pgno)));
        }
        Ok(pgno)
    }

    pub fn set_child(&mut self, i: u16, pgno: Pgno) -> Result<()> {
        if i == self.n_cell {
            return self.set_right_child(pgno);
        }
        let pc = self.cell_ptr(i)?;
        write_u32(self.page.make_mut(), pc, pgno)
    }

    pub fn right_child(&self) -> Pgno {
        if self.leaf {
            return 0;
        }
        read_u32(&self.page, self.hdr() + 8).unwrap_or(0)
    }

    pub fn set_right_child(&mut self, pgno: Pgno) -> Result<()> {
        let hdr = self.hdr();
        write_u32(self.page.make_mut(), hdr + 8, pgno)
    }

    /// Rewrite the overflow pointer of cell `i`.
    pub fn set_overflow(&mut self, i: u16, pgno: Pgno) -> Result<()> {
        let pc = self.cell_ptr(i)?;
        let info = self.parse_cell_at(pc)?;
        if info.overflow_pgno == 0 {
            return Err(Error::corrupt_page(self.pgno, format!("cell {} has no overflow", i)));
        }
        let at = pc + info.n_header + info.n_local as usize;
        write_u32(self.page.make_mut(), at, pgno)
    }

    /// Copies of every cell, in order.
    pub fn cells(&self) -> Result<Vec<Vec<u8>>> {
        (0..self.n_cell).map(|i| self.cell(i).map(<[u8]>::to_vec)).collect()
    }

    // ========================================================================
    // Space accounting
    // ========================================================================

    /// Freeblocks as (offset, size), validated.
    pub fn freeblocks(&self) -> Result<Vec<(usize, usize)>> {
        let mut blocks = Vec::new();
        let mut pc = self.first_freeblock();
        let usable = self.limits.usable_end();
        while pc != 0 {
            if pc < self.content_start() || pc + 4 > usable {
                return Err(Error::corrupt_page(self.pgno, format!("freeblock at bad offset {}", pc)));
            }
            let next = read_u16(&self.page, pc).unwrap_or(0) as usize;
            let size = read_u16(&self.page, pc + 2).unwrap_or(0) as usize;
            if size < 4 || pc + size > usable || (next != 0 && next <= pc + size) {
                return Err(Error::corrupt_page(self.pgno, format!("malformed freeblock at {}", pc)));
            }
            blocks.push((pc, size));
            pc = next;
        }
        Ok(blocks)
    }

    /// Total free bytes: unallocated gap, freeblocks and fragments.
    pub fn free_space(&self) -> Result<usize> {
        let gap = self.content_start() - self.ptr_array_end();
        let blocks: usize = self.freeblocks()?.iter().map(|(_, size)| size).sum();
        let total = gap + blocks + self.frag_bytes();
        if total > self.capacity() {
            return Err(Error::corrupt_page(self.pgno, "free space exceeds page capacity"));
        }
        Ok(total)
    }

    /// Bytes used by cells and their pointers.
    pub fn used_space(&self) -> Result<usize> {
        Ok(self.capacity() - self.free_space()?)
    }

    // ========================================================================
    // Mutation
    // ========================================================================

    /// Insert `cell` as cell `i` if it fits. Returns false when the page
    /// would overflow; the page is then unchanged.
    pub fn try_insert_cell(&mut self, i: u16, cell: &[u8]) -> Result<bool> {
        if i > self.n_cell {
            return Err(Error::corrupt_page(self.pgno, format!("insert position {} out of range", i)));
        }
        let need = cell.len() + CELL_PTR_SIZE;
        let gap = self.content_start() - self.ptr_array_end();
        if gap < need {
            if self.free_space()? < need {
                return Ok(false);
            }
            self.defragment()?;
        }
        let start = self.content_start() - cell.len();
        let ptr_at = self.cell_offset() + CELL_PTR_SIZE * i as usize;
        let ptr_end = self.ptr_array_end();
        let data = self.page.make_mut();
        data[start..start + cell.len()].copy_from_slice(cell);
        data.copy_within(ptr_at..ptr_end, ptr_at + CELL_PTR_SIZE);
        write_u16(data, ptr_at, start as u16)?;
        self.set_content_start(start);
        self.set_n_cell(self.n_cell + 1);
        Ok(true)
    }

    /// Remove cell `i`, compacting the content area.
    pub fn remove_cell(&mut self, i: u16) -> Result<()> {
        if self.first_freeblock() != 0 || self.frag_bytes() != 0 {
            self.defragment()?;
        }
        let pc = self.cell_ptr(i)?;
        let size = self.parse_cell_at(pc)?.n_size;
        let content = self.content_start();
        let ptr_at = self.cell_offset() + CELL_PTR_SIZE * i as usize;
        let ptr_end = self.ptr_array_end();
        let cell_offset = self.cell_offset();
        let n_cell = self.n_cell;
        let data = self.page.make_mut();
        data.copy_within(ptr_at + CELL_PTR_SIZE..ptr_end, ptr_at);
        data[ptr_end - CELL_PTR_SIZE..ptr_end].fill(0);
        // Slide the cells stored below the removed one up over it.
        data.copy_within(content..pc, content + size);
        data[content..content + size].fill(0);
        for j in 0..(n_cell - 1) as usize {
            let at = cell_offset + CELL_PTR_SIZE * j;
            let ptr = read_u16(data, at).unwrap_or(0) as usize;
            if ptr < pc {
                write_u16(data, at, (ptr + size) as u16)?;
            }
        }
        self.set_content_start(content + size);
        self.set_n_cell(n_cell - 1);
        Ok(())
    }

    /// Replace the page content with `cells` (and `right` child for
    /// interior pages). Fails if the cells do not fit.
    pub fn rebuild(&mut self, cells: &[Vec<u8>], right: Pgno) -> Result<()> {
        let needed: usize = cells.iter().map(|c| c.len() + CELL_PTR_SIZE).sum();
        if needed > self.capacity() {
            return Err(Error::corrupt_page(self.pgno, format!("{} bytes of cells do not fit", needed)));
        }
        let hdr = self.hdr();
        let flags = self.flags;
        let cell_offset = self.cell_offset();
        let mut end = self.limits.usable_end();
        let data = self.page.make_mut();
        data[hdr..self.limits.usable_end()].fill(0);
        data[hdr] = flags;
        for (j, cell) in cells.iter().enumerate() {
            end -= cell.len();
            data[end..end + cell.len()].copy_from_slice(cell);
            write_u16(data, cell_offset + CELL_PTR_SIZE * j, end as u16)?;
        }
        self.set_content_start(end);
        self.set_n_cell(cells.len() as u16);
        if !self.leaf {
            self.set_right_child(right)?;
        }
        Ok(())
    }

    /// Coalesce all free space into the unallocated gap (defragmentPage).
    pub fn defragment(&mut self) -> Result<()> {
        let cells = self.cells()?;
        let right = self.right_child();
        self.rebuild(&cells, right)
    }
}

/// Parse a cell held in `cell`, which may run past the end of the cell.
pub fn parse_cell(cell: &[u8], leaf: bool, int_key: bool, limits: &PageLimits) -> Result<CellInfo> {
    let corrupt = |what: &str| Error::with_message(ErrorCode::Corrupt, what.to_string());
    let mut info = CellInfo::default();
    let mut p = 0;
    if !leaf {
        info.child = read_u32(cell, 0).ok_or_else(|| corrupt("truncated child pointer"))?;
        p = 4;
        if int_key {
            let (key, n) = read_varint(cell, p)?;
            info.n_key = key as i64;
            info.n_header = 4 + n;
            info.n_size = info.n_header;
            return Ok(info);
        }
    }
    let (n_payload, n) = read_varint32(cell, p)?;
    p += n;
    info.n_payload = n_payload;
    if int_key {
        let (key, n) = read_varint(cell, p)?;
        info.n_key = key as i64;
        p += n;
    } else {
        info.n_key = n_payload as i64;
    }
    info.n_header = p;
    info.n_local = limits.local_size(leaf && int_key, n_payload);
    let mut size = info.n_header + info.n_local as usize;
    if info.n_local < n_payload {
        info.overflow_pgno = read_u32(cell, size).ok_or_else(|| corrupt("truncated overflow pointer"))?;
        size += 4;
    }
    info.n_size = size.max(MIN_CELL_SIZE);
    if info.n_size > cell.len() {
        return Err(corrupt("extends off end of page"));
    }
    Ok(info)
}

// ============================================================================
// Cell builders that need no page allocation
// ============================================================================

/// Interior cell of a table tree: left child plus rowid.
pub fn table_interior_cell(child: Pgno, rowid: i64) -> Vec<u8> {
    let mut cell = Vec::with_capacity(13);
    cell.extend_from_slice(&child.to_be_bytes());
    write_varint(rowid as u64, &mut cell);
    cell
}

/// Pad a cell to the minimum stored size.
pub fn pad_cell(cell: &mut Vec<u8>) {
    if cell.len() < MIN_CELL_SIZE {
        cell.resize(MIN_CELL_SIZE, 0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limits() -> PageLimits {
        PageLimits::new(512, 512)
    }

    fn leaf_cell(rowid: i64, payload: &[u8]) -> Vec<u8> {
        let mut cell = Vec::new();
        write_varint(payload.len() as u64, &mut cell);
        write_varint(rowid as u64, &mut cell);
        cell.extend_from_slice(payload);
        pad_cell(&mut cell);
        cell
    }

    fn empty_leaf(pgno: Pgno) -> MemPage {
        MemPage::init(DbPage::new(pgno, vec![0u8; 512]), PTF_TABLE_LEAF, limits())
    }

    #[test]
    fn test_init_and_parse_roundtrip() {
        let page = empty_leaf(2);
        let parsed = MemPage::parse(page.into_page(), limits()).unwrap();
        assert!(parsed.leaf && parsed.int_key);
        assert_eq!(parsed.n_cell, 0);
        assert_eq!(parsed.free_space().unwrap(), 512 - 8);
    }

    #[test]
    fn test_parse_rejects_garbage() {
        let mut data = vec![0u8; 512];
        data[0] = 0x07;
        assert!(MemPage::parse(DbPage::new(3, data.clone()), limits()).is_err());
        data[0] = PTF_TABLE_LEAF;
        data[3..5].copy_from_slice(&500u16.to_be_bytes());
        assert!(MemPage::parse(DbPage::new(3, data), limits()).is_err());
    }

    #[test]
    fn test_insert_and_remove_cells() {
        let mut page = empty_leaf(2);
        for (i, rowid) in [10i64, 30, 20].iter().enumerate() {
            let pos = if i == 2 { 1 } else { i as u16 };
            assert!(page.try_insert_cell(pos, &leaf_cell(*rowid, b"payload")).unwrap());
        }
        let keys: Vec<i64> = (0..page.n_cell).map(|i| page.int_key_at(i).unwrap()).collect();
        assert_eq!(keys, vec![10, 20, 30]);
        let before = page.free_space().unwrap();
        page.remove_cell(1).unwrap();
        let keys: Vec<i64> = (0..page.n_cell).map(|i| page.int_key_at(i).unwrap()).collect();
        assert_eq!(keys, vec![10, 30]);
        assert_eq!(page.free_space().unwrap(), before + leaf_cell(20, b"payload").len() + 2);
        assert_eq!(page.cell_info(1).unwrap().n_payload, 7);
    }

    #[test]
    fn test_insert_reports_full_page() {
        let mut page = empty_leaf(2);
        let big = vec![7u8; 200];
        assert!(page.try_insert_cell(0, &leaf_cell(1, &big)).unwrap());
        assert!(page.try_insert_cell(1, &leaf_cell(2, &big)).unwrap());
        assert!(!page.try_insert_cell(2, &leaf_cell(3, &big)).unwrap());
        assert_eq!(page.n_cell, 2);
    }

    #[test]
    fn test_interior_children() {
        let mut page = MemPage::init(DbPage::new(5, vec![0u8; 512]), PTF_TABLE_INTERIOR, limits());
        page.try_insert_cell(0, &table_interior_cell(7, 100)).unwrap();
        page.set_right_child(9).unwrap();
        assert_eq!(page.child(0).unwrap(), 7);
        assert_eq!(page.child(1).unwrap(), 9);
        page.set_child(0, 8).unwrap();
        assert_eq!(page.child(0).unwrap(), 8);
        assert_eq!(page.int_key_at(0).unwrap(), 100);
    }

    #[test]
    fn test_page1_header_preserved_by_rebuild() {
        let mut data = vec![0u8; 512];
        data[..16].copy_from_slice(b"SQLite format 3\0");
        let p1 = PageLimits::for_page1(512, 512);
        let mut page = MemPage::init(DbPage::new(1, data), PTF_TABLE_LEAF, p1);
        page.rebuild(&[leaf_cell(1, b"x")], 0).unwrap();
        assert_eq!(&page.data()[..16], b"SQLite format 3\0");
        assert_eq!(page.capacity(), 512 - 100 - 8);
    }
}
