//! Per-node frame bitmap.
//!
//! One bit per page frame of the node: `1` = reserved, `0` = free. The map is
//! born all-reserved; architecture setup code frees the usable RAM and then
//! reserves whatever it already occupies (kernel image, the map itself, …).

use crate::{AllocRequest, BootmemError, NodeId, PageSink, bootmap_pages};
use bitvec::field::BitField;
use bitvec::prelude::{BitSlice, Lsb0};
use kernel_memory_addresses::{PAGE_OFFSET_MASK, PAGE_SHIFT, Pfn, align_up, pages_for};

/// Order of the block handed out for one fully free map word.
const WORD_ORDER: u32 = usize::BITS.ilog2();

/// Frames covered by one map word.
const WORD_FRAMES: u64 = usize::BITS as u64;

/// Bitmap tracker for one contiguous frame range `[min_pfn, low_pfn)`.
///
/// # Invariants
/// - Bit `i` describes frame `min_pfn + i`.
/// - Padding bits past `low_pfn` stay reserved for the node's lifetime.
/// - `hint_idx` only moves down on frees; allocations move it past their end.
pub struct BootmemNode<'m> {
    nid: NodeId,
    min_pfn: Pfn,
    low_pfn: Pfn,
    map_pfn: Pfn,
    map: &'m mut BitSlice<usize, Lsb0>,
    /// Lowest index that may be free.
    hint_idx: u64,
    /// Node-relative byte offset right after the previous allocation.
    last_end_off: u64,
    debug: bool,
}

#[allow(clippy::cast_possible_truncation)]
impl<'m> BootmemNode<'m> {
    /// Wrap `storage` as the map for `[min_pfn, low_pfn)`, marking every
    /// frame reserved.
    pub(crate) fn new(
        nid: NodeId,
        map_pfn: Pfn,
        min_pfn: Pfn,
        low_pfn: Pfn,
        storage: &'m mut [usize],
        debug: bool,
    ) -> Self {
        debug_assert!(storage.len() as u64 * WORD_FRAMES >= low_pfn - min_pfn);
        storage.fill(usize::MAX);
        Self {
            nid,
            min_pfn,
            low_pfn,
            map_pfn,
            map: BitSlice::from_slice_mut(storage),
            hint_idx: 0,
            last_end_off: 0,
            debug,
        }
    }

    #[must_use]
    pub const fn nid(&self) -> NodeId {
        self.nid
    }

    /// First frame of the node.
    #[must_use]
    pub const fn min_pfn(&self) -> Pfn {
        self.min_pfn
    }

    /// Exclusive end frame of the node.
    #[must_use]
    pub const fn low_pfn(&self) -> Pfn {
        self.low_pfn
    }

    /// First frame of the node's bitmap storage.
    #[must_use]
    pub const fn map_pfn(&self) -> Pfn {
        self.map_pfn
    }

    #[must_use]
    pub fn frames(&self) -> u64 {
        self.low_pfn - self.min_pfn
    }

    #[must_use]
    pub fn contains(&self, pfn: Pfn) -> bool {
        self.min_pfn <= pfn && pfn < self.low_pfn
    }

    /// Whether `pfn` is currently reserved. Panics outside the node.
    #[must_use]
    pub fn is_reserved(&self, pfn: Pfn) -> bool {
        assert!(self.contains(pfn), "bootmem: {pfn:?} outside node {}", self.nid);
        self.map[(pfn - self.min_pfn) as usize]
    }

    /// Number of free frames.
    #[must_use]
    pub fn free_frames(&self) -> u64 {
        self.map[..self.frames() as usize].count_zeros() as u64
    }

    /// Reserve or free `[start, end)`, which must lie within the node.
    pub(crate) fn mark(&mut self, start: Pfn, end: Pfn, op: Mark) -> Result<(), BootmemError> {
        bdebug!(
            self.debug,
            "mark nid={} start={:#x} end={:#x} op={:?}",
            self.nid,
            start,
            end,
            op
        );
        assert!(
            start >= self.min_pfn && end <= self.low_pfn,
            "bootmem: range {start:?}..{end:?} outside node {} [{:?}, {:?})",
            self.nid,
            self.min_pfn,
            self.low_pfn
        );

        let sidx = start - self.min_pfn;
        let eidx = end - self.min_pfn;
        match op {
            Mark::Reserve { exclusive } => self.reserve_range(sidx, eidx, exclusive),
            Mark::Free => {
                self.free_range(sidx, eidx);
                Ok(())
            }
        }
    }

    fn reserve_range(&mut self, sidx: u64, eidx: u64, exclusive: bool) -> Result<(), BootmemError> {
        for idx in sidx..eidx {
            if self.map.replace(idx as usize, true) {
                if exclusive {
                    self.free_range(sidx, idx);
                    return Err(BootmemError::Busy {
                        pfn: self.min_pfn + idx,
                    });
                }
                bdebug!(
                    self.debug,
                    "silent double reserve of PFN {:#x}",
                    self.min_pfn + idx
                );
            }
        }
        Ok(())
    }

    fn free_range(&mut self, sidx: u64, eidx: u64) {
        if self.hint_idx > sidx {
            self.hint_idx = sidx;
        }
        for idx in sidx..eidx {
            if !self.map.replace(idx as usize, false) {
                panic!(
                    "bootmem: double free of {:?} on node {}",
                    self.min_pfn + idx,
                    self.nid
                );
            }
        }
    }

    /// Find, reserve and return the node-relative byte offset of a region
    /// satisfying `req`.
    ///
    /// The caller zero-fills the region; this type never touches the memory
    /// it tracks.
    pub(crate) fn find_and_reserve(&mut self, req: AllocRequest) -> Option<u64> {
        bdebug!(
            self.debug,
            "alloc nid={} size={:#x} [{} pages] align={:#x} goal={:#x} limit={:#x}",
            self.nid,
            req.size,
            pages_for(req.size),
            req.align,
            req.goal,
            req.limit
        );
        req.validate();

        let min = self.min_pfn.as_u64();
        let mut max = self.low_pfn.as_u64();
        let goal = req.goal >> PAGE_SHIFT;
        let limit = req.limit >> PAGE_SHIFT;

        if limit != 0 && max > limit {
            max = limit;
        }
        if max <= min {
            return None;
        }

        let step = (req.effective_align() >> PAGE_SHIFT).max(1);
        let start = if goal != 0 && min < goal && goal < max {
            align_up(goal, step)
        } else {
            align_up(min, step)
        };

        let mut sidx = start - min;
        let midx = max - min;

        // Start past the frames known to be taken, but keep the original
        // start around in case the hint skipped a usable hole.
        let mut fallback = None;
        if self.hint_idx > sidx {
            fallback = Some(sidx);
            sidx = self.align_idx(self.hint_idx, step);
        }

        loop {
            if let Some(found) = self.scan(sidx, midx, req.size, step) {
                return Some(self.claim(found, req));
            }
            sidx = self.align_idx(fallback.take()?, step);
        }
    }

    /// First-fit scan for `size` bytes worth of free frames at `step`
    /// granularity within `[sidx, midx)`.
    fn scan(&self, mut sidx: u64, midx: u64, size: u64, step: u64) -> Option<u64> {
        let frames = pages_for(size);
        loop {
            sidx = self.next_zero(sidx, midx);
            sidx = self.align_idx(sidx, step);
            let eidx = sidx + frames;

            if sidx >= midx || eidx > midx {
                return None;
            }

            match (sidx..eidx).find(|&i| self.map[i as usize]) {
                None => return Some(sidx),
                Some(busy) => {
                    let next = self.align_idx(busy, step);
                    sidx = if next == busy { busy + step } else { next };
                }
            }
        }
    }

    fn next_zero(&self, from: u64, midx: u64) -> u64 {
        if from >= midx {
            return midx;
        }
        self.map[from as usize..midx as usize]
            .first_zero()
            .map_or(midx, |i| from + i as u64)
    }

    /// Reserve the run found at `sidx`, sharing the partial last page of the
    /// previous allocation when it directly precedes the run.
    fn claim(&mut self, sidx: u64, req: AllocRequest) -> u64 {
        let start_off = if self.last_end_off & PAGE_OFFSET_MASK != 0
            && (self.last_end_off >> PAGE_SHIFT) + 1 == sidx
        {
            self.align_off(self.last_end_off, req.effective_align())
        } else {
            sidx << PAGE_SHIFT
        };

        let merge = u64::from((start_off >> PAGE_SHIFT) < sidx);
        let end_off = start_off + req.size;

        self.last_end_off = end_off;
        self.hint_idx = pages_for(end_off);

        let first = (start_off >> PAGE_SHIFT) + merge;
        if let Err(e) = self.reserve_range(first, pages_for(end_off), true) {
            panic!("bootmem: free run on node {} turned busy: {e}", self.nid);
        }
        start_off
    }

    /// Align a node-relative index so that the absolute frame is aligned.
    fn align_idx(&self, idx: u64, step: u64) -> u64 {
        let base = self.min_pfn.as_u64();
        align_up(base + idx, step) - base
    }

    /// Byte-offset flavor of [`align_idx`](Self::align_idx).
    fn align_off(&self, off: u64, align: u64) -> u64 {
        let base = self.min_pfn.phys().as_u64();
        align_up(base + off, align) - base
    }

    /// Hand every free frame, then the map's own pages, to `sink`.
    ///
    /// Consumes the node: its map storage is among the released pages.
    pub(crate) fn release(self, sink: &mut impl PageSink) -> u64 {
        bdebug!(
            self.debug,
            "release nid={} start={:#x} end={:#x}",
            self.nid,
            self.min_pfn,
            self.low_pfn
        );

        let frames = self.frames();
        let word = |w: usize| -> usize {
            let bits = usize::BITS as usize;
            self.map[w * bits..][..bits].load_le::<usize>()
        };
        let mut count = 0;
        let mut idx = 0;

        while idx < frames {
            let pfn = self.min_pfn + idx;
            let free = !word((idx / WORD_FRAMES) as usize);
            let bit = idx % WORD_FRAMES;

            if bit == 0 && free == usize::MAX && pfn.is_aligned(WORD_FRAMES) && idx + WORD_FRAMES <= frames {
                sink.release_pages(pfn, WORD_ORDER);
                count += WORD_FRAMES;
                idx += WORD_FRAMES;
            } else {
                let mut vec = free >> bit;
                let mut off = 0;
                while vec != 0 {
                    if vec & 1 != 0 && idx + off < frames {
                        sink.release_pages(pfn + off, 0);
                        count += 1;
                    }
                    vec >>= 1;
                    off += 1;
                }
                idx = align_up(idx + 1, WORD_FRAMES);
            }
        }

        let map_pages = bootmap_pages(frames);
        for page in 0..map_pages {
            sink.release_pages(self.map_pfn + page, 0);
        }
        count += map_pages;

        bdebug!(self.debug, "release nid={} released={:#x}", self.nid, count);
        count
    }
}

/// What [`BootmemNode::mark`] does to a frame range.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub(crate) enum Mark {
    Reserve { exclusive: bool },
    Free,
}
