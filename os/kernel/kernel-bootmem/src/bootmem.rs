//! The boot allocator context.

use crate::node::{BootmemNode, Mark};
use crate::phys_mapper::PhysMapper;
use crate::registry::NodeList;
use crate::{
    AllocRequest, BootmemError, BootmemHooks, NoHooks, NodeId, PageSink, ReserveMode,
    bootmap_bytes,
};
use core::ptr::NonNull;
use kernel_info::memory::{ARCH_LOW_ADDRESS_LIMIT, MAX_DMA32_PFN};
use kernel_info::params::BootParams;
use kernel_memory_addresses::{PAGE_SHIFT, PhysicalAddress, Pfn};
use log::error;

/// Frames a node must extend past [`MAX_DMA32_PFN`] before
/// [`Bootmem::alloc_node_high`] steers allocations above it (128 MiB).
const HIGH_SLACK_FRAMES: u64 = 128 << (20 - PAGE_SHIFT);

/// Runtime switches of the boot allocator.
#[derive(Debug, Copy, Clone, Default, Eq, PartialEq)]
pub struct BootmemConfig {
    /// Trace every operation (`bootmem_debug`).
    pub debug: bool,
}

impl From<&BootParams> for BootmemConfig {
    fn from(params: &BootParams) -> Self {
        Self {
            debug: params.bootmem_debug,
        }
    }
}

/// Early boot page allocator over all registered memory nodes.
///
/// `'m` is the lifetime of the memory the nodes describe, as seen through
/// the mapper. Allocations hand out pointers valid for `'m`; they stay
/// reserved (and are therefore never released) unless freed again.
pub struct Bootmem<'m, M: PhysMapper, H: BootmemHooks = NoHooks> {
    mapper: &'m M,
    hooks: H,
    nodes: NodeList<'m>,
    config: BootmemConfig,
    min_low_pfn: Pfn,
    max_low_pfn: Pfn,
    max_pfn: Pfn,
}

impl<'m, M: PhysMapper> Bootmem<'m, M> {
    #[must_use]
    pub const fn new(mapper: &'m M, config: BootmemConfig) -> Self {
        Self::with_hooks(mapper, config, NoHooks)
    }
}

impl<'m, M: PhysMapper, H: BootmemHooks> Bootmem<'m, M, H> {
    #[must_use]
    pub const fn with_hooks(mapper: &'m M, config: BootmemConfig, hooks: H) -> Self {
        Self {
            mapper,
            hooks,
            nodes: NodeList::new(),
            config,
            min_low_pfn: Pfn::new(0),
            max_low_pfn: Pfn::new(0),
            max_pfn: Pfn::new(0),
        }
    }

    #[must_use]
    pub const fn mapper(&self) -> &'m M {
        self.mapper
    }

    #[must_use]
    pub const fn config(&self) -> BootmemConfig {
        self.config
    }

    #[must_use]
    pub fn node(&self, nid: NodeId) -> Option<&BootmemNode<'m>> {
        self.nodes.get(nid)
    }

    /// Registered nodes in ascending address order.
    pub fn nodes(&self) -> impl Iterator<Item = &BootmemNode<'m>> {
        self.nodes.iter()
    }

    /// Lowest frame handed to [`init_bootmem`](Self::init_bootmem).
    #[must_use]
    pub const fn min_low_pfn(&self) -> Pfn {
        self.min_low_pfn
    }

    /// End of the single-node range given to [`init_bootmem`](Self::init_bootmem).
    #[must_use]
    pub const fn max_low_pfn(&self) -> Pfn {
        self.max_low_pfn
    }

    /// Highest node end registered so far.
    #[must_use]
    pub const fn max_pfn(&self) -> Pfn {
        self.max_pfn
    }

    /// Register node `nid` covering `[start, end)`, keeping its bitmap in the
    /// frames starting at `map_pfn`. Every frame starts out reserved.
    ///
    /// Returns the bitmap size in bytes.
    ///
    /// # Safety
    /// The [`bootmap_pages`](crate::bootmap_pages) frames at `map_pfn` must be
    /// mapped by the mapper, unused by anything else, and must be reserved
    /// (or lie outside every node) before the first allocation.
    ///
    /// # Panics
    /// If the node id is out of range or taken, or the range overlaps a
    /// registered node.
    #[allow(clippy::cast_possible_truncation)]
    pub unsafe fn init_node(&mut self, nid: NodeId, map_pfn: Pfn, start: Pfn, end: Pfn) -> u64 {
        assert!(start <= end, "bootmem: node {nid} ends before it starts");
        let bytes = bootmap_bytes(end - start);
        bdebug!(
            self.config.debug,
            "nid={} start={:#x} map={:#x} end={:#x} mapsize={:#x}",
            nid,
            start,
            map_pfn,
            end,
            bytes
        );

        let words = bytes as usize / size_of::<usize>();
        let map = self.mapper.phys_to_virt(map_pfn.phys()).cast::<usize>();
        // SAFETY: the caller hands over exclusive use of the map frames for 'm.
        let storage = unsafe { core::slice::from_raw_parts_mut(map.as_ptr(), words) };

        self.nodes.link(BootmemNode::new(
            nid,
            map_pfn,
            start,
            end,
            storage,
            self.config.debug,
        ));
        self.max_pfn = self.max_pfn.max(end);
        bytes
    }

    /// Single-node setup: node 0 covers `[0, pages)` with its bitmap at
    /// `map_pfn`.
    ///
    /// # Safety
    /// As for [`init_node`](Self::init_node).
    pub unsafe fn init_bootmem(&mut self, map_pfn: Pfn, pages: u64) -> u64 {
        self.min_low_pfn = map_pfn;
        self.max_low_pfn = Pfn::new(pages);
        // SAFETY: forwarded to the caller.
        unsafe { self.init_node(0, map_pfn, Pfn::new(0), Pfn::new(pages)) }
    }

    /// Apply `op` to `[start, end)`, which may span consecutive nodes.
    ///
    /// A reservation conflict in any node undoes what this call reserved in
    /// earlier nodes.
    fn mark_range(&mut self, start: Pfn, end: Pfn, op: Mark) -> Result<(), BootmemError> {
        if start >= end {
            return Ok(());
        }

        let mut pos = start;
        for i in 0..self.nodes.len() {
            let node = self.nodes.at_mut(i);
            if !node.contains(pos) {
                assert!(
                    pos == start,
                    "bootmem: range {start:?}..{end:?} has a hole at {pos:?}"
                );
                continue;
            }

            let low = node.low_pfn();
            let max = low.min(end);
            if let Err(e) = node.mark(pos, max, op) {
                let undone = self.mark_range(start, pos, Mark::Free);
                debug_assert!(undone.is_ok());
                return Err(e);
            }
            if max == end {
                return Ok(());
            }
            pos = low;
        }

        panic!("bootmem: range {start:?}..{end:?} is not covered by any node");
    }

    fn node_mut(&mut self, nid: NodeId) -> &mut BootmemNode<'m> {
        match self.nodes.get_mut(nid) {
            Some(node) => node,
            None => panic!("bootmem: node {nid} is not registered"),
        }
    }

    /// Mark the whole frames inside `[addr, addr + size)` free.
    ///
    /// Partial frames at either end are left alone.
    ///
    /// # Panics
    /// If a frame is already free or the range leaves the registered nodes.
    pub fn free(&mut self, addr: PhysicalAddress, size: u64) {
        self.hooks.leak_free(addr, size);
        let (start, end) = (addr.pfn_up(), (addr + size).pfn_down());
        if let Err(e) = self.mark_range(start, end, Mark::Free) {
            unreachable!("bootmem: free reported {e}");
        }
    }

    /// [`free`](Self::free) restricted to node `nid`.
    pub fn free_node(&mut self, nid: NodeId, addr: PhysicalAddress, size: u64) {
        self.hooks.leak_free(addr, size);
        let (start, end) = (addr.pfn_up(), (addr + size).pfn_down());
        if start >= end {
            return;
        }
        if let Err(e) = self.node_mut(nid).mark(start, end, Mark::Free) {
            unreachable!("bootmem: free reported {e}");
        }
    }

    /// Reserve every frame touched by `[addr, addr + size)`.
    ///
    /// # Errors
    /// [`BootmemError::Busy`] in [`ReserveMode::Exclusive`] when a frame was
    /// already reserved; nothing stays reserved in that case.
    pub fn reserve(
        &mut self,
        addr: PhysicalAddress,
        size: u64,
        mode: ReserveMode,
    ) -> Result<(), BootmemError> {
        let (start, end) = (addr.pfn_down(), (addr + size).pfn_up());
        self.mark_range(start, end, Mark::Reserve {
            exclusive: mode == ReserveMode::Exclusive,
        })
    }

    /// [`reserve`](Self::reserve) restricted to node `nid`.
    ///
    /// # Errors
    /// As for [`reserve`](Self::reserve).
    pub fn reserve_node(
        &mut self,
        nid: NodeId,
        addr: PhysicalAddress,
        size: u64,
        mode: ReserveMode,
    ) -> Result<(), BootmemError> {
        let (start, end) = (addr.pfn_down(), (addr + size).pfn_up());
        if start >= end {
            return Ok(());
        }
        self.node_mut(nid).mark(start, end, Mark::Reserve {
            exclusive: mode == ReserveMode::Exclusive,
        })
    }

    /// Try node `nid` only, zero-filling on success.
    fn alloc_on(&mut self, nid: NodeId, req: AllocRequest) -> Option<NonNull<u8>> {
        let node = self.nodes.get_mut(nid)?;
        let off = node.find_and_reserve(req)?;
        let pa = node.min_pfn().phys() + off;
        Some(self.finish(pa, req.size))
    }

    #[allow(clippy::cast_possible_truncation)]
    fn finish(&self, pa: PhysicalAddress, size: u64) -> NonNull<u8> {
        let ptr = self.mapper.phys_to_virt(pa);
        // SAFETY: the frames were just reserved for this caller and the mapper
        // guarantees they are writable.
        unsafe { ptr.as_ptr().write_bytes(0, size as usize) };
        self.hooks.leak_alloc(pa, size);
        ptr
    }

    fn alloc_preferred(&mut self, requested: Option<NodeId>, req: AllocRequest) -> Option<NonNull<u8>> {
        let nid = self.hooks.preferred_node(requested, &req)?;
        self.alloc_on(nid, req)
    }

    /// One pass over all nodes in address order.
    fn alloc_core(&mut self, req: AllocRequest) -> Option<NonNull<u8>> {
        if let Some(ptr) = self.alloc_preferred(None, req) {
            return Some(ptr);
        }

        let goal = PhysicalAddress::new(req.goal).pfn_down();
        let limit = PhysicalAddress::new(req.limit).pfn_down();
        for pos in 0..self.nodes.len() {
            let nid = self.nodes.id_at(pos);
            let Some(node) = self.nodes.get(nid) else {
                continue;
            };
            if req.goal != 0 && node.low_pfn() <= goal {
                continue;
            }
            if req.limit != 0 && node.min_pfn() >= limit {
                break;
            }
            if let Some(ptr) = self.alloc_on(nid, req) {
                return Some(ptr);
            }
        }
        None
    }

    /// Allocate `size` zeroed bytes aligned to `align` from any node, at or
    /// above `goal` if possible and strictly below `limit`.
    ///
    /// The goal is dropped when it cannot be met; the limit never is.
    ///
    /// # Errors
    /// [`BootmemError::OutOfMemory`] when no node can satisfy the request.
    ///
    /// # Panics
    /// On a zero size, a non power-of-two alignment, or a limit below
    /// `goal + size`.
    pub fn allocate(
        &mut self,
        size: u64,
        align: u64,
        goal: Option<PhysicalAddress>,
        limit: Option<PhysicalAddress>,
    ) -> Result<NonNull<u8>, BootmemError> {
        let mut req = AllocRequest {
            size,
            align,
            goal: goal.map_or(0, PhysicalAddress::as_u64),
            limit: limit.map_or(0, PhysicalAddress::as_u64),
        };
        req.validate();

        loop {
            if let Some(ptr) = self.alloc_core(req) {
                return Ok(ptr);
            }
            if req.goal == 0 {
                return Err(BootmemError::OutOfMemory { size });
            }
            req.goal = 0;
        }
    }

    /// [`allocate`](Self::allocate) without a limit.
    ///
    /// # Errors
    /// [`BootmemError::OutOfMemory`] when no node can satisfy the request.
    pub fn alloc(
        &mut self,
        size: u64,
        align: u64,
        goal: Option<PhysicalAddress>,
    ) -> Result<NonNull<u8>, BootmemError> {
        self.allocate(size, align, goal, None)
    }

    /// [`allocate`](Self::allocate) for memory the system cannot boot
    /// without.
    ///
    /// # Panics
    /// When the request cannot be satisfied.
    pub fn allocate_with_limit(
        &mut self,
        size: u64,
        align: u64,
        goal: Option<PhysicalAddress>,
        limit: Option<PhysicalAddress>,
    ) -> NonNull<u8> {
        match self.allocate(size, align, goal, limit) {
            Ok(ptr) => ptr,
            Err(_) => out_of_memory(size),
        }
    }

    /// Panicking [`alloc`](Self::alloc).
    ///
    /// # Panics
    /// When the request cannot be satisfied.
    pub fn allocate_or_panic(
        &mut self,
        size: u64,
        align: u64,
        goal: Option<PhysicalAddress>,
    ) -> NonNull<u8> {
        self.allocate_with_limit(size, align, goal, None)
    }

    /// Panicking allocation below [`ARCH_LOW_ADDRESS_LIMIT`].
    ///
    /// # Panics
    /// When the request cannot be satisfied.
    pub fn alloc_low(
        &mut self,
        size: u64,
        align: u64,
        goal: Option<PhysicalAddress>,
    ) -> NonNull<u8> {
        self.allocate_with_limit(
            size,
            align,
            goal,
            Some(PhysicalAddress::new(ARCH_LOW_ADDRESS_LIMIT)),
        )
    }

    fn alloc_node_inner(
        &mut self,
        nid: NodeId,
        mut req: AllocRequest,
    ) -> Result<NonNull<u8>, BootmemError> {
        assert!(
            self.nodes.get(nid).is_some(),
            "bootmem: node {nid} is not registered"
        );
        if req.limit != 0 && req.goal + req.size > req.limit {
            req.limit = 0;
        }

        loop {
            if let Some(ptr) = self.alloc_preferred(Some(nid), req) {
                return Ok(ptr);
            }
            if let Some(ptr) = self.alloc_on(nid, req) {
                return Ok(ptr);
            }
            if let Some(ptr) = self.alloc_core(req) {
                return Ok(ptr);
            }
            if req.goal == 0 {
                return Err(BootmemError::OutOfMemory { size: req.size });
            }
            req.goal = 0;
        }
    }

    /// Allocate from node `nid`, falling back to any node and then to any
    /// address.
    ///
    /// # Errors
    /// [`BootmemError::OutOfMemory`] when no node can satisfy the request.
    ///
    /// # Panics
    /// If `nid` is not registered.
    pub fn alloc_node_nopanic(
        &mut self,
        nid: NodeId,
        size: u64,
        align: u64,
        goal: Option<PhysicalAddress>,
    ) -> Result<NonNull<u8>, BootmemError> {
        self.alloc_node_inner(nid, AllocRequest {
            size,
            align,
            goal: goal.map_or(0, PhysicalAddress::as_u64),
            limit: 0,
        })
    }

    /// Panicking [`alloc_node_nopanic`](Self::alloc_node_nopanic).
    ///
    /// # Panics
    /// When the request cannot be satisfied.
    pub fn alloc_node(
        &mut self,
        nid: NodeId,
        size: u64,
        align: u64,
        goal: Option<PhysicalAddress>,
    ) -> NonNull<u8> {
        match self.alloc_node_nopanic(nid, size, align, goal) {
            Ok(ptr) => ptr,
            Err(_) => out_of_memory(size),
        }
    }

    /// Like [`alloc_node`](Self::alloc_node), but prefer memory above the
    /// 32-bit DMA zone on nodes that reach well beyond it.
    ///
    /// # Panics
    /// When the request cannot be satisfied.
    pub fn alloc_node_high(
        &mut self,
        nid: NodeId,
        size: u64,
        align: u64,
        goal: Option<PhysicalAddress>,
    ) -> NonNull<u8> {
        let low = self.node_mut(nid).low_pfn();
        let below_dma32 = goal.is_none_or(|g| g.pfn_down().as_u64() < MAX_DMA32_PFN);

        if low.as_u64() > MAX_DMA32_PFN + HIGH_SLACK_FRAMES && below_dma32 {
            let high = AllocRequest {
                size,
                align,
                goal: Pfn::new(MAX_DMA32_PFN).phys().as_u64(),
                limit: 0,
            };
            if let Some(ptr) = self.alloc_on(nid, high) {
                return ptr;
            }
        }

        self.alloc_node(nid, size, align, goal)
    }

    /// Panicking node allocation below [`ARCH_LOW_ADDRESS_LIMIT`].
    ///
    /// # Panics
    /// When the request cannot be satisfied.
    pub fn alloc_low_node(
        &mut self,
        nid: NodeId,
        size: u64,
        align: u64,
        goal: Option<PhysicalAddress>,
    ) -> NonNull<u8> {
        let req = AllocRequest {
            size,
            align,
            goal: goal.map_or(0, PhysicalAddress::as_u64),
            limit: ARCH_LOW_ADDRESS_LIMIT,
        };
        match self.alloc_node_inner(nid, req) {
            Ok(ptr) => ptr,
            Err(_) => out_of_memory(size),
        }
    }

    /// Release the free frames of node `nid` and unregister it.
    ///
    /// Returns the number of frames handed to `sink`.
    ///
    /// # Panics
    /// If `nid` is not registered.
    pub fn release_node(&mut self, nid: NodeId, sink: &mut impl PageSink) -> u64 {
        match self.nodes.unlink(nid) {
            Some(node) => node.release(sink),
            None => panic!("bootmem: node {nid} is not registered"),
        }
    }

    /// Retire the boot allocator: every frame that is still free, plus all
    /// node bitmaps, goes to `sink`.
    ///
    /// Returns the number of frames handed over.
    pub fn release_all(mut self, sink: &mut impl PageSink) -> u64 {
        let total = self.nodes.drain().map(|node| node.release(sink)).sum();
        bdebug!(self.config.debug, "released {:#x} pages in total", total);
        total
    }
}

/// Hand the whole frames of a former boot allocation straight to `sink`,
/// once the boot allocator is gone.
///
/// Returns the number of frames handed over.
pub fn free_late(addr: PhysicalAddress, size: u64, sink: &mut impl PageSink) -> u64 {
    let (start, end) = (addr.pfn_up(), (addr + size).pfn_down());
    let mut count = 0;
    let mut pfn = start;
    while pfn < end {
        sink.release_pages(pfn, 0);
        pfn += 1;
        count += 1;
    }
    count
}

#[cold]
fn out_of_memory(size: u64) -> ! {
    error!("bootmem alloc of {size} bytes failed!");
    panic!("Out of memory");
}
