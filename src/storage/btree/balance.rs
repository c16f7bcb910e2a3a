//! Tree balancing (balance, balance_nonroot, balance_deeper)
//!
//! Balancing works on decoded copies of pages. A page that overflows after
//! an insert is split across as many siblings as its cells need; a page that
//! falls below one third full after a delete is merged with, or takes cells
//! from, an adjacent sibling. Both cases run through [`BtShared::redistribute`],
//! which rewrites the siblings and their dividers in the parent and then
//! balances the parent in turn. The root never moves: it grows a level when
//! it overflows and absorbs its only child when that child fits.
//!
//! Tables and indexes are both B+trees. Entries live only on leaves; an
//! interior cell of an index tree carries a full copy of the largest key in
//! its left subtree, with an overflow chain of its own when that key spills.

use std::ops::Range;

use tracing::{debug, trace};

use crate::error::{Error, Result};
use crate::types::Pgno;

use super::freelist::AllocMode;
use super::overflow::CellKind;
use super::page::{parse_cell, table_interior_cell, MemPage};
use super::types::{
    PageLimits, CELL_PTR_SIZE, PTF_INDEX_INTERIOR, PTF_INDEX_LEAF, PTF_TABLE_INTERIOR,
    PTF_TABLE_LEAF, PTRMAP_BTREE,
};
use super::BtShared;

/// A page decoded into its cells.
#[derive(Clone, Debug)]
pub(crate) struct Node {
    pub(crate) pgno: Pgno,
    pub(crate) leaf: bool,
    pub(crate) int_key: bool,
    pub(crate) cells: Vec<Vec<u8>>,
    /// Right-most child, 0 on leaves
    pub(crate) right: Pgno,
}

impl Node {
    pub(crate) fn load(page: &MemPage) -> Result<Self> {
        Ok(Node {
            pgno: page.pgno,
            leaf: page.leaf,
            int_key: page.int_key,
            cells: page.cells()?,
            right: page.right_child(),
        })
    }

    pub(crate) fn flags(&self) -> u8 {
        match (self.leaf, self.int_key) {
            (true, true) => PTF_TABLE_LEAF,
            (false, true) => PTF_TABLE_INTERIOR,
            (true, false) => PTF_INDEX_LEAF,
            (false, false) => PTF_INDEX_INTERIOR,
        }
    }

    /// Bytes needed for the cells and their pointers.
    pub(crate) fn bytes(&self) -> usize {
        self.cells.iter().map(|c| c.len() + CELL_PTR_SIZE).sum()
    }

    fn child(&self, i: usize) -> Result<Pgno> {
        let pgno = if i == self.cells.len() {
            self.right
        } else {
            let cell = self
                .cells
                .get(i)
                .ok_or_else(|| Error::corrupt_page(self.pgno, format!("no child {}", i)))?;
            u32::from_be_bytes([cell[0], cell[1], cell[2], cell[3]])
        };
        if pgno < 2 {
            return Err(Error::corrupt_page(self.pgno, format!("child {} is page {}", i, pgno)));
        }
        Ok(pgno)
    }

    fn set_child(&mut self, i: usize, pgno: Pgno) {
        if i == self.cells.len() {
            self.right = pgno;
        } else {
            self.cells[i][..4].copy_from_slice(&pgno.to_be_bytes());
        }
    }
}

/// True when a non-root page holding `used` of `capacity` bytes should be
/// merged with a sibling.
pub(crate) fn is_underfull(used: usize, capacity: usize) -> bool {
    used * 3 < capacity
}

/// Split items of the given sizes into runs that each fit in `cap` bytes.
///
/// On interior levels the item between two runs moves up to the parent and
/// belongs to neither run. After a greedy fill from the left, items are
/// shifted right while that evens out the runs, so the last page is not
/// left nearly empty.
pub(crate) fn partition(sizes: &[usize], cap: usize, interior: bool) -> Vec<Range<usize>> {
    let mut parts: Vec<Range<usize>> = Vec::new();
    let mut start = 0;
    let mut used = 0;
    let mut i = 0;
    while i < sizes.len() {
        if used + sizes[i] > cap && i > start {
            parts.push(start..i);
            if interior {
                i += 1;
            }
            start = i;
            used = 0;
            continue;
        }
        used += sizes[i];
        i += 1;
    }
    parts.push(start..sizes.len());

    let total = |r: &Range<usize>| -> usize { sizes[r.clone()].iter().sum() };
    for j in (1..parts.len()).rev() {
        loop {
            let (left, right) = (parts[j - 1].clone(), parts[j].clone());
            if left.len() <= 1 {
                break;
            }
            // The item entering the right run, and the one leaving the left.
            let (incoming, outgoing) = if interior {
                (sizes[left.end], sizes[left.end - 1])
            } else {
                (sizes[left.end - 1], sizes[left.end - 1])
            };
            let (l_used, r_used) = (total(&left), total(&right));
            let forced = right.is_empty();
            if r_used + incoming > cap || (!forced && r_used + incoming > l_used - outgoing) {
                break;
            }
            parts[j - 1] = left.start..left.end - 1;
            parts[j] = right.start - 1..right.end;
        }
    }
    parts
}

impl BtShared {
    /// Write `node` back, rebalancing around it as needed (balance).
    ///
    /// `ancestors` is the path from the root down to the node's parent: one
    /// (page, child index) pair per level.
    pub(crate) fn balance(&mut self, ancestors: &[(Pgno, u16)], node: Node, append: bool) -> Result<()> {
        let Some((&(parent_pgno, idx), above)) = ancestors.split_last() else {
            return self.balance_root(node);
        };
        let cap = self.limits(node.pgno).capacity(node.leaf);
        let used = node.bytes();
        if used <= cap && !is_underfull(used, cap) {
            return self.store(&node, parent_pgno);
        }
        let parent = Node::load(&self.get_page(parent_pgno)?)?;
        let idx = idx as usize;
        if parent.leaf || parent.child(idx)? != node.pgno {
            return Err(Error::corrupt_page(
                parent_pgno,
                format!("child {} is not page {}", idx, node.pgno),
            ));
        }
        if used > cap {
            return self.redistribute(above, parent, idx, vec![node], append);
        }
        if parent.cells.is_empty() {
            // An only child has no sibling to merge with.
            return self.store(&node, parent_pgno);
        }
        let (first, siblings) = if idx > 0 {
            let left = Node::load(&self.get_page(parent.child(idx - 1)?)?)?;
            (idx - 1, vec![left, node])
        } else {
            let right = Node::load(&self.get_page(parent.child(1)?)?)?;
            (0, vec![node, right])
        };
        self.redistribute(above, parent, first, siblings, false)
    }

    /// Spread the cells of `siblings`, the children of `parent` starting at
    /// child index `first`, over as many pages as they need
    /// (balance_nonroot).
    fn redistribute(
        &mut self,
        above: &[(Pgno, u16)],
        mut parent: Node,
        first: usize,
        siblings: Vec<Node>,
        append: bool,
    ) -> Result<()> {
        let n = siblings.len();
        let (leaf, int_key) = (siblings[0].leaf, siblings[0].int_key);
        if siblings.iter().any(|s| s.leaf != leaf || s.int_key != int_key) {
            return Err(Error::corrupt_page(parent.pgno, "siblings of different page types"));
        }
        let limits = PageLimits::new(self.page_size, self.usable_size);
        let dividers: Vec<Vec<u8>> = parent.cells.drain(first..first + n - 1).collect();
        let old_pgnos: Vec<Pgno> = siblings.iter().map(|s| s.pgno).collect();
        let last_right = siblings[n - 1].right;

        let mut items: Vec<Vec<u8>> = Vec::new();
        for (k, sib) in siblings.into_iter().enumerate() {
            let right = sib.right;
            items.extend(sib.cells);
            let Some(div) = dividers.get(k) else { continue };
            if !leaf {
                // The divider comes down, adopting the sibling's right child.
                let mut cell = div.clone();
                cell[..4].copy_from_slice(&right.to_be_bytes());
                items.push(cell);
            } else if !int_key {
                let info = parse_cell(div, false, false, &limits)?;
                self.free_overflow(&info)?;
            }
        }

        let cap = limits.capacity(leaf);
        let sizes: Vec<usize> = items.iter().map(|c| c.len() + CELL_PTR_SIZE).collect();
        let quick = append && leaf && int_key && n == 1 && first == parent.cells.len() && items.len() > 1;
        let parts = if quick {
            vec![0..items.len() - 1, items.len() - 1..items.len()]
        } else {
            partition(&sizes, cap, !leaf)
        };
        if let Some(bad) = parts.iter().find(|r| sizes[(*r).clone()].iter().sum::<usize>() > cap) {
            return Err(Error::corrupt_page(parent.pgno, format!("cells {:?} do not fit on one page", bad)));
        }

        let k = parts.len();
        let mut pgnos: Vec<Pgno> = old_pgnos.iter().copied().take(k).collect();
        while pgnos.len() < k {
            pgnos.push(self.allocate_page(AllocMode::Any)?.pgno());
        }
        pgnos.sort_unstable();
        for &unused in old_pgnos.iter().skip(k) {
            self.free_page(unused)?;
        }

        let mut separators = Vec::with_capacity(k - 1);
        let mut nodes = Vec::with_capacity(k);
        for (j, part) in parts.iter().enumerate() {
            let mut right = 0;
            if j + 1 < k {
                let sep = if !leaf {
                    let mut cell = items[part.end].clone();
                    right = u32::from_be_bytes([cell[0], cell[1], cell[2], cell[3]]);
                    cell[..4].copy_from_slice(&pgnos[j].to_be_bytes());
                    cell
                } else if int_key {
                    let last = parse_cell(&items[part.end - 1], true, true, &limits)?;
                    table_interior_cell(pgnos[j], last.n_key)
                } else {
                    let key = self.raw_cell_payload(&items[part.end - 1], true, false)?;
                    self.build_cell(CellKind::IndexInterior(pgnos[j]), 0, &key, 0)?
                };
                separators.push(sep);
            } else if !leaf {
                right = last_right;
            }
            nodes.push(Node {
                pgno: pgnos[j],
                leaf,
                int_key,
                cells: items[part.clone()].to_vec(),
                right,
            });
        }
        for node in &nodes {
            self.store(node, parent.pgno)?;
        }
        debug!(
            parent = parent.pgno,
            before = n,
            after = k,
            leaf,
            quick,
            "rebalanced siblings"
        );

        for (j, sep) in separators.into_iter().enumerate() {
            parent.cells.insert(first + j, sep);
        }
        parent.set_child(first + k - 1, pgnos[k - 1]);
        self.balance(above, parent, false)
    }

    /// Balance the root page, which keeps its page number (balance_deeper
    /// and the root-collapse half of balance).
    fn balance_root(&mut self, mut node: Node) -> Result<()> {
        let cap = self.limits(node.pgno).capacity(node.leaf);
        if node.bytes() > cap {
            let child_pgno = self.allocate_page(AllocMode::Any)?.pgno();
            let child = Node {
                pgno: child_pgno,
                leaf: node.leaf,
                int_key: node.int_key,
                cells: std::mem::take(&mut node.cells),
                right: node.right,
            };
            let root = Node {
                pgno: node.pgno,
                leaf: false,
                int_key: node.int_key,
                cells: Vec::new(),
                right: child_pgno,
            };
            self.store(&root, 0)?;
            debug!(root = root.pgno, child = child_pgno, "tree grew a level");
            return self.balance(&[(root.pgno, 0)], child, false);
        }
        while !node.leaf && node.cells.is_empty() {
            let child = Node::load(&self.get_page(node.right)?)?;
            if child.bytes() > self.limits(node.pgno).capacity(child.leaf) {
                break;
            }
            let old = child.pgno;
            node = Node {
                pgno: node.pgno,
                ..child
            };
            self.free_page(old)?;
            debug!(root = node.pgno, child = old, "tree lost a level");
        }
        self.store(&node, 0)
    }

    /// Encode `node` onto its page and record the pointer-map entries of
    /// everything it references.
    pub(crate) fn store(&mut self, node: &Node, parent: Pgno) -> Result<()> {
        let limits = self.limits(node.pgno);
        let image = if node.pgno == 1 {
            self.raw_page(1)?
        } else {
            self.zero_page(node.pgno)
        };
        let mut page = MemPage::init(image, node.flags(), limits);
        page.rebuild(&node.cells, node.right)?;
        self.set_child_ptrmaps(&page)?;
        if parent != 0 {
            self.ptrmap_put(node.pgno, PTRMAP_BTREE, parent)?;
        }
        trace!(pgno = node.pgno, cells = node.cells.len(), "stored page");
        self.write_page(page)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fits(parts: &[Range<usize>], sizes: &[usize], cap: usize) -> bool {
        parts.iter().all(|r| sizes[r.clone()].iter().sum::<usize>() <= cap)
    }

    #[test]
    fn test_partition_single_page() {
        let sizes = vec![10; 5];
        assert_eq!(partition(&sizes, 100, false), vec![0..5]);
    }

    #[test]
    fn test_partition_leaf_split_is_even() {
        let sizes = vec![10; 11];
        let parts = partition(&sizes, 100, false);
        assert_eq!(parts.len(), 2);
        assert!(fits(&parts, &sizes, 100));
        assert_eq!(parts[0].end, parts[1].start);
        assert!(parts[0].len().abs_diff(parts[1].len()) <= 1);
    }

    #[test]
    fn test_partition_interior_promotes_dividers() {
        let sizes = vec![10; 21];
        let parts = partition(&sizes, 100, true);
        assert_eq!(parts.len(), 2);
        // One item between the runs goes to the parent.
        assert_eq!(parts[0].end + 1, parts[1].start);
        assert_eq!(parts[1].end, 21);
        assert!(!parts[1].is_empty());
        assert!(fits(&parts, &sizes, 100));
    }

    #[test]
    fn test_partition_interior_never_leaves_last_run_empty() {
        // Greedy fill would use the final item as a divider.
        let sizes = vec![50, 50, 50];
        let parts = partition(&sizes, 100, true);
        assert_eq!(parts.len(), 2);
        assert!(!parts[1].is_empty());
        assert_eq!(parts.iter().map(|r| r.len()).sum::<usize>() + 1, 3);
    }

    #[test]
    fn test_partition_large_cells() {
        let sizes = vec![90, 90, 90];
        let parts = partition(&sizes, 100, false);
        assert_eq!(parts, vec![0..1, 1..2, 2..3]);
    }

    #[test]
    fn test_underfull_threshold() {
        assert!(is_underfull(0, 300));
        assert!(is_underfull(99, 300));
        assert!(!is_underfull(100, 300));
    }
}
