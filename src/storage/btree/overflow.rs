//! Cell construction and payload access across overflow chains.
//!
//! An overflow page holds the number of the next page in its first four
//! bytes (0 on the last page) followed by `usable_size - 4` payload bytes.

use crate::error::{Error, ErrorCode, Result};
use crate::types::Pgno;

use super::encoding::{read_u32, write_varint};
use super::page::{pad_cell, parse_cell, MemPage};
use super::types::{CellInfo, PageLimits, PTRMAP_OVERFLOW1, PTRMAP_OVERFLOW2};
use super::BtShared;

/// Where a new cell will live.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum CellKind {
    TableLeaf,
    IndexLeaf,
    IndexInterior(Pgno),
}

/// Number of overflow pages a cell spills into.
pub(crate) fn overflow_page_count(info: &CellInfo, usable_size: u32) -> u32 {
    let spill = info.n_payload.saturating_sub(info.n_local) as u64;
    let chunk = usable_size as u64 - 4;
    spill.div_ceil(chunk) as u32
}

impl BtShared {
    /// Encode a cell, writing any spilled payload to a new overflow chain
    /// (fillInCell).
    pub(crate) fn build_cell(
        &mut self,
        kind: CellKind,
        n_key: i64,
        payload: &[u8],
        n_zero: u32,
    ) -> Result<Vec<u8>> {
        let total = payload.len() as u64 + n_zero as u64;
        if total > i32::MAX as u64 {
            return Err(Error::new(ErrorCode::TooBig));
        }
        let n_payload = total as u32;
        let limits = PageLimits::new(self.page_size, self.usable_size);
        let mut cell = Vec::with_capacity(payload.len().min(self.usable_size as usize) + 24);
        if let CellKind::IndexInterior(child) = kind {
            cell.extend_from_slice(&child.to_be_bytes());
        }
        write_varint(n_payload as u64, &mut cell);
        if kind == CellKind::TableLeaf {
            write_varint(n_key as u64, &mut cell);
        }
        let n_local = limits.local_size(kind == CellKind::TableLeaf, n_payload) as usize;
        let byte_at = |i: usize| payload.get(i).copied().unwrap_or(0);
        if n_local as u32 == n_payload {
            cell.extend_from_slice(payload);
            cell.resize(cell.len() + n_zero as usize, 0);
        } else {
            cell.extend((0..n_local).map(byte_at));
            let spill: Vec<u8> = (n_local..n_payload as usize).map(byte_at).collect();
            let first = self.write_overflow_chain(&spill)?;
            cell.extend_from_slice(&first.to_be_bytes());
        }
        pad_cell(&mut cell);
        Ok(cell)
    }

    /// Write `data` to freshly allocated overflow pages and return the
    /// first page number.
    fn write_overflow_chain(&mut self, data: &[u8]) -> Result<Pgno> {
        let chunk = self.usable_size as usize - 4;
        let mut pages = Vec::with_capacity(data.len().div_ceil(chunk));
        for _ in 0..data.len().div_ceil(chunk) {
            pages.push(self.allocate_page(super::freelist::AllocMode::Any)?);
        }
        let pgnos: Vec<Pgno> = pages.iter().map(|p| p.pgno()).collect();
        for (i, (mut page, piece)) in pages.into_iter().zip(data.chunks(chunk)).enumerate() {
            let next = pgnos.get(i + 1).copied().unwrap_or(0);
            let buf = page.make_mut();
            buf[..4].copy_from_slice(&next.to_be_bytes());
            buf[4..4 + piece.len()].copy_from_slice(piece);
            self.write_raw(page)?;
            if i > 0 {
                self.ptrmap_put(pgnos[i], PTRMAP_OVERFLOW2, pgnos[i - 1])?;
            }
        }
        Ok(pgnos[0])
    }

    /// Free the overflow chain of a cell (clearCell).
    pub(crate) fn clear_cell(&mut self, page: &MemPage, i: u16) -> Result<()> {
        let info = page.cell_info(i)?;
        self.free_overflow(&info)
    }

    pub(crate) fn free_overflow(&mut self, info: &CellInfo) -> Result<()> {
        if info.overflow_pgno == 0 {
            return Ok(());
        }
        let expected = overflow_page_count(info, self.usable_size);
        let mut pgno = info.overflow_pgno;
        for n in 0..expected {
            if pgno < 2 || pgno > self.page_count() {
                return Err(Error::corrupt_page(pgno, "overflow page out of range"));
            }
            let page = self.raw_page(pgno)?;
            let next = read_u32(&page, 0).unwrap_or(0);
            if (next == 0) != (n + 1 == expected) {
                return Err(Error::corrupt_page(pgno, "overflow chain length disagrees with payload"));
            }
            self.free_page(pgno)?;
            pgno = next;
        }
        Ok(())
    }

    /// Record the owner of a cell's first overflow page.
    pub(crate) fn ptrmap_put_overflow(&mut self, info: &CellInfo, owner: Pgno) -> Result<()> {
        if info.overflow_pgno != 0 {
            self.ptrmap_put(info.overflow_pgno, PTRMAP_OVERFLOW1, owner)?;
        }
        Ok(())
    }

    /// Read `amount` payload bytes of cell `i` starting at `offset`
    /// (accessPayload).
    pub(crate) fn read_payload(&mut self, page: &MemPage, i: u16, offset: u32, amount: u32) -> Result<Vec<u8>> {
        let (local, info) = page.local_payload(i)?;
        let end = offset as u64 + amount as u64;
        if end > info.n_payload as u64 {
            return Err(Error::with_message(
                ErrorCode::Range,
                format!("payload range {}..{} exceeds {} bytes", offset, end, info.n_payload),
            ));
        }
        self.read_spilled(&info, local, offset as usize, end as usize, page.pgno)
    }

    /// Full payload of a cell that is not on a page.
    pub(crate) fn raw_cell_payload(&mut self, cell: &[u8], leaf: bool, int_key: bool) -> Result<Vec<u8>> {
        let limits = PageLimits::new(self.page_size, self.usable_size);
        let info = parse_cell(cell, leaf, int_key, &limits)?;
        let local = &cell[info.n_header..info.n_header + info.n_local as usize];
        self.read_spilled(&info, local, 0, info.n_payload as usize, 0)
    }

    /// Payload bytes `offset..end` given the local part of a cell.
    fn read_spilled(&mut self, info: &CellInfo, local: &[u8], offset: usize, end: usize, owner: Pgno) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(end - offset);
        if offset < local.len() {
            out.extend_from_slice(&local[offset..end.min(local.len())]);
        }
        if end <= local.len() {
            return Ok(out);
        }
        let chunk = self.usable_size as usize - 4;
        let mut pgno = info.overflow_pgno;
        let mut pos = local.len();
        let mut remaining = overflow_page_count(info, self.usable_size);
        while pos < end {
            if pgno < 2 || pgno > self.page_count() || remaining == 0 {
                return Err(Error::corrupt_page(owner, format!("broken overflow chain at page {}", pgno)));
            }
            let ovfl = self.raw_page(pgno)?;
            let (lo, hi) = (pos, pos + chunk);
            if hi > offset {
                let from = offset.max(lo) - lo;
                let to = end.min(hi) - lo;
                out.extend_from_slice(&ovfl[4 + from..4 + to]);
            }
            pos = hi;
            remaining -= 1;
            pgno = read_u32(&ovfl, 0).unwrap_or(0);
        }
        Ok(out)
    }

    /// The whole payload of cell `i`.
    pub(crate) fn cell_payload(&mut self, page: &MemPage, i: u16) -> Result<Vec<u8>> {
        let info = page.cell_info(i)?;
        if info.overflow_pgno == 0 {
            let (local, _) = page.local_payload(i)?;
            return Ok(local.to_vec());
        }
        self.read_payload(page, i, 0, info.n_payload)
    }

    /// Overwrite payload bytes of cell `i` in place. The payload size does
    /// not change.
    pub(crate) fn write_payload(&mut self, mut page: MemPage, i: u16, offset: u32, data: &[u8]) -> Result<()> {
        let pc = page.cell_ptr(i)?;
        let info = page.parse_cell_at(pc)?;
        let end = offset as u64 + data.len() as u64;
        if end > info.n_payload as u64 {
            return Err(Error::with_message(
                ErrorCode::Range,
                format!("write of {} bytes at {} exceeds payload", data.len(), offset),
            ));
        }
        let (offset, end) = (offset as usize, end as usize);
        let n_local = info.n_local as usize;
        if offset < n_local {
            let to = end.min(n_local);
            let start = pc + info.n_header + offset;
            page.data_mut()[start..start + (to - offset)].copy_from_slice(&data[..to - offset]);
            self.write_page(page)?;
        }
        if end <= n_local {
            return Ok(());
        }
        let chunk = self.usable_size as usize - 4;
        let mut pgno = info.overflow_pgno;
        let mut pos = n_local;
        while pos < end {
            if pgno < 2 || pgno > self.page_count() {
                return Err(Error::corrupt_page(pgno, "overflow page out of range"));
            }
            let mut ovfl = self.raw_page(pgno)?;
            let next = read_u32(&ovfl, 0).unwrap_or(0);
            let (lo, hi) = (pos, pos + chunk);
            if hi > offset {
                let from = offset.max(lo);
                let to = end.min(hi);
                ovfl.make_mut()[4 + from - lo..4 + to - lo].copy_from_slice(&data[from - offset..to - offset]);
                self.write_raw(ovfl)?;
            }
            pos = hi;
            pgno = next;
        }
        Ok(())
    }
}
