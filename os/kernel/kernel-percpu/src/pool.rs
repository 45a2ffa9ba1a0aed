//! The dynamic per-CPU allocator.

use crate::area_map::{Area, AreaMap, DEFAULT_MAP_ALLOC, MapStorage, heap_storage};
use crate::chunk::{Chunk, ChunkIndex};
use crate::{ChunkId, ChunkLayout, PercpuBackend, PercpuError, PercpuPtr};
use alloc::vec::Vec;
use core::ops::Range;
use core::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use kernel_info::memory::PCPU_MIN_UNIT_SIZE;
use core::ptr::NonNull;
use kernel_bootmem::PhysMapper;
use kernel_memory_addresses::{PAGE_BYTES, PAGE_SHIFT, PhysicalAddress, VirtualAddress};
use kernel_sync::{SpinLock, TicketMutex};
use log::{debug, info, warn};

/// Failed allocations reported before going quiet.
const WARN_LIMIT: u32 = 10;

/// Unit pages a single allocation can touch.
const MAX_ALLOC_PAGES: usize = PCPU_MIN_UNIT_SIZE / PAGE_BYTES + 1;

const _: () = assert!(MAX_ALLOC_PAGES <= u64::BITS as usize);

/// Allocator counters, sampled under the index lock.
#[derive(Debug, Copy, Clone, Default, Eq, PartialEq)]
pub struct PercpuStats {
    /// Live chunks, the first and reserved chunks included.
    pub chunks: usize,
    /// Chunks without a single allocation.
    pub empty_chunks: usize,
    /// Free bytes per unit, summed over all chunks.
    pub free_bytes: usize,
    /// Populated unit pages of on-demand chunks.
    pub populated_pages: usize,
}

/// Dynamic per-CPU memory.
///
/// Every allocation reserves the same offset in each CPU's unit of a chunk.
/// The first chunk comes from boot memory and holds the static per-CPU
/// image; further chunks are created and populated through the
/// [`PercpuBackend`] once the heap is online.
///
/// Two locks guard the allocator. The allocation lock serializes whole
/// allocations and reclaim, including the slow work of extending maps and
/// creating or populating chunks. The index lock protects the chunks and
/// their slot lists and is held only briefly; frees take nothing else.
pub struct Percpu<'m, B: PercpuBackend> {
    backend: B,
    base: VirtualAddress,
    layout: ChunkLayout<'m>,
    alloc_lock: TicketMutex<()>,
    index: SpinLock<ChunkIndex<'m>>,
    heap_online: AtomicBool,
    warn_limit: AtomicU32,
}

impl<'m, B: PercpuBackend> Percpu<'m, B> {
    pub(crate) const fn new(
        backend: B,
        base: VirtualAddress,
        layout: ChunkLayout<'m>,
        index: ChunkIndex<'m>,
    ) -> Self {
        Self {
            backend,
            base,
            layout,
            alloc_lock: TicketMutex::new(()),
            index: SpinLock::new(index),
            heap_online: AtomicBool::new(false),
            warn_limit: AtomicU32::new(WARN_LIMIT),
        }
    }

    /// Base address of the first chunk.
    #[must_use]
    pub const fn base(&self) -> VirtualAddress {
        self.base
    }

    #[must_use]
    pub const fn layout(&self) -> &ChunkLayout<'m> {
        &self.layout
    }

    #[must_use]
    pub const fn backend(&self) -> &B {
        &self.backend
    }

    /// Allocate `size` zeroed bytes aligned to `align` in every CPU's unit.
    ///
    /// # Errors
    /// * [`PercpuError::InvalidRequest`] for a zero or oversized `size` or a
    ///   bad `align`.
    /// * [`PercpuError::MapExtendFailed`], [`PercpuError::ChunkCreateFailed`]
    ///   or [`PercpuError::PopulateFailed`] when no memory can be found.
    pub fn alloc(&self, size: usize, align: usize) -> Result<PercpuPtr, PercpuError> {
        self.alloc_inner(size, align, false)
    }

    /// Like [`alloc`](Self::alloc), but serve the request from the reserved
    /// chunk when there is one. Without a reserved chunk this is a normal
    /// allocation.
    ///
    /// # Errors
    /// As [`alloc`](Self::alloc), plus [`PercpuError::ReservedExhausted`]
    /// when the reserved chunk has no room. There is no fallback to the
    /// dynamic chunks.
    pub fn alloc_reserved(&self, size: usize, align: usize) -> Result<PercpuPtr, PercpuError> {
        self.alloc_inner(size, align, true)
    }

    fn alloc_inner(
        &self,
        size: usize,
        align: usize,
        reserved: bool,
    ) -> Result<PercpuPtr, PercpuError> {
        if size == 0
            || size > PCPU_MIN_UNIT_SIZE
            || align > PAGE_BYTES
            || !align.is_power_of_two()
        {
            warn!("PERCPU: illegal size ({size}) or align ({align}) for percpu allocation");
            return Err(PercpuError::InvalidRequest { size, align });
        }

        let result = {
            let _serialized = self.alloc_lock.lock();
            self.alloc_serialized(size, align, reserved)
        };

        match result {
            Ok(ptr) => {
                self.backend.leak_alloc(ptr, size);
                Ok(ptr)
            }
            Err(err) => {
                self.report_failure(size, align, err);
                Err(err)
            }
        }
    }

    fn report_failure(&self, size: usize, align: usize, err: PercpuError) {
        let Ok(left) = self
            .warn_limit
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1))
        else {
            return;
        };
        warn!("PERCPU: allocation failed, size={size} align={align}, {err}");
        if left == 1 {
            info!("PERCPU: limit reached, disable warning");
        }
    }

    fn alloc_serialized(
        &self,
        size: usize,
        align: usize,
        reserved: bool,
    ) -> Result<PercpuPtr, PercpuError> {
        let from_reserved = reserved && self.index.lock().has_reserved();
        let (id, base, off) = if from_reserved {
            self.alloc_from_reserved(size, align)?
        } else {
            self.alloc_from_slots(size, align)?
        };

        self.populate(id, base, off, size)?;

        for (_, unit) in self.layout.unit_offsets() {
            let ptr = base.byte_add(unit + off).as_mut_ptr::<u8>();
            // SAFETY: the area is ours, populated in every possible CPU's
            // unit, and nobody else writes it until we return.
            unsafe { ptr.write_bytes(0, size) };
        }

        Ok(PercpuPtr::new(base.byte_add(off)))
    }

    fn alloc_from_reserved(
        &self,
        size: usize,
        align: usize,
    ) -> Result<(ChunkId, VirtualAddress, usize), PercpuError> {
        let id = ChunkId::RESERVED;
        loop {
            let mut index = self.index.lock();
            let chunk = index.chunk(id);
            if size > chunk.map.contig_hint() {
                return Err(PercpuError::ReservedExhausted);
            }
            if let Some(new_alloc) = chunk.map.need_to_extend() {
                drop(index);
                self.extend_map(id, new_alloc)?;
                continue;
            }
            let base = chunk.base;
            return index
                .alloc_area(id, size, align)
                .map(|off| (id, base, off))
                .ok_or(PercpuError::ReservedExhausted);
        }
    }

    fn alloc_from_slots(
        &self,
        size: usize,
        align: usize,
    ) -> Result<(ChunkId, VirtualAddress, usize), PercpuError> {
        loop {
            let mut index = self.index.lock();
            let mut extend = None;

            'scan: for slot in index.size_to_slot(size)..index.nr_slots() {
                let mut cursor = index.slot_head(slot);
                while let Some(id) = cursor {
                    let chunk = index.chunk(id);
                    cursor = chunk.next_in_slot();
                    if size > chunk.map.contig_hint() {
                        continue;
                    }
                    if let Some(new_alloc) = chunk.map.need_to_extend() {
                        extend = Some((id, new_alloc));
                        break 'scan;
                    }
                    let base = chunk.base;
                    if let Some(off) = index.alloc_area(id, size, align) {
                        return Ok((id, base, off));
                    }
                }
            }
            drop(index);

            match extend {
                Some((id, new_alloc)) => self.extend_map(id, new_alloc)?,
                None => self.create_chunk()?,
            }
        }
    }

    /// Grow the map of chunk `id` to `new_alloc` entries.
    fn extend_map(&self, id: ChunkId, new_alloc: usize) -> Result<(), PercpuError> {
        if !self.heap_online.load(Ordering::Acquire) {
            return Err(PercpuError::MapExtendFailed);
        }
        let larger = heap_storage(new_alloc).ok_or(PercpuError::MapExtendFailed)?;
        let displaced = self.index.lock().chunk_mut(id).map.install(larger);
        drop(displaced);
        Ok(())
    }

    fn create_chunk(&self) -> Result<(), PercpuError> {
        if !self.heap_online.load(Ordering::Acquire) {
            return Err(PercpuError::ChunkCreateFailed);
        }
        let base = self
            .backend
            .create_chunk(&self.layout)
            .ok_or(PercpuError::ChunkCreateFailed)?;

        let Some(storage) = heap_storage(DEFAULT_MAP_ALLOC) else {
            self.backend.destroy_chunk(base, &self.layout);
            return Err(PercpuError::ChunkCreateFailed);
        };
        let map = AreaMap::new(
            MapStorage::Heap(storage),
            &[Area::Free(self.layout.unit_size())],
        );
        let mut chunk = Chunk::unpopulated(base, map, self.layout.unit_pages());

        loop {
            let target = {
                let mut index = self.index.lock();
                match index.insert(chunk) {
                    Ok(id) => {
                        debug!("percpu: created {id:?} at {base:?}");
                        return Ok(());
                    }
                    Err(back) => {
                        chunk = back;
                        index.arena_grow_target()
                    }
                }
            };

            let mut larger = Vec::new();
            if larger.try_reserve_exact(target).is_err() {
                self.backend.destroy_chunk(base, &self.layout);
                return Err(PercpuError::ChunkCreateFailed);
            }
            let displaced = self.index.lock().grow_arena(larger);
            drop(displaced);
        }
    }

    /// Make sure the pages under `[off, off + size)` of chunk `id` are
    /// backed. On failure the area is freed again.
    fn populate(
        &self,
        id: ChunkId,
        base: VirtualAddress,
        off: usize,
        size: usize,
    ) -> Result<(), PercpuError> {
        let pages = off >> PAGE_SHIFT..(off + size).div_ceil(PAGE_BYTES);

        // Populated bits only change under the allocation lock, which we
        // hold, so the snapshot stays accurate.
        let missing = {
            let index = self.index.lock();
            match &index.chunk(id).populated {
                None => 0,
                Some(bits) => bits[pages.clone()]
                    .iter_zeros()
                    .fold(0u64, |mask, page| mask | 1 << page),
            }
        };
        if missing == 0 {
            return Ok(());
        }

        let mut done = 0u64;
        for run in runs(missing) {
            let unit_pages = pages.start + run.start..pages.start + run.end;
            if let Err(err) = self.backend.populate(id, base, &self.layout, unit_pages) {
                debug!("percpu: populating {id:?} failed: {err}");
                for run in runs(done) {
                    self.backend.depopulate(
                        id,
                        base,
                        &self.layout,
                        pages.start + run.start..pages.start + run.end,
                    );
                }
                self.index.lock().free_area(id, off);
                return Err(PercpuError::PopulateFailed);
            }
            done |= run_mask(&run);
        }

        if let Some(bits) = &mut self.index.lock().chunk_mut(id).populated {
            bits[pages].fill(true);
        }
        Ok(())
    }

    /// Free an allocation.
    ///
    /// Never blocks on chunk creation or population; may ask the backend
    /// to [schedule a reclaim](PercpuBackend::schedule_reclaim).
    ///
    /// # Panics
    /// If `ptr` was not returned by this allocator, was freed already or
    /// points into the static image.
    pub fn free(&self, ptr: PercpuPtr) {
        self.backend.leak_free(ptr);
        let addr = ptr.addr();

        let reclaim = {
            let mut index = self.index.lock();
            let id = self.chunk_of(&index, addr);
            let base = index.chunk(id).base;
            let offset = addr.offset_from(base);
            let managed_from = match id {
                ChunkId::FIRST if index.has_reserved() => self.layout.reserved_limit(),
                ChunkId::FIRST | ChunkId::RESERVED => self.layout.static_size(),
                _ => 0,
            };
            assert!(
                offset >= managed_from,
                "percpu: {addr:?} lies in the static area"
            );
            index.free_area(id, offset);
            id.is_dynamic()
                && index.chunk(id).map.free_size() == self.layout.unit_size()
                && index.other_empty_chunk(id)
        };

        if reclaim {
            self.backend.schedule_reclaim();
        }
    }

    fn chunk_of(&self, index: &ChunkIndex<'m>, addr: VirtualAddress) -> ChunkId {
        if addr >= self.base && addr < self.base.byte_add(self.layout.unit_size()) {
            let in_reserved = addr < self.base.byte_add(self.layout.reserved_limit());
            return if index.has_reserved() && in_reserved {
                ChunkId::RESERVED
            } else {
                ChunkId::FIRST
            };
        }

        let lowest = addr.byte_add(self.layout.unit_offset(self.layout.low_unit_cpu()));
        match self.backend.chunk_of(lowest) {
            Some(id) if index.get(id).is_some() => id,
            _ => panic!("percpu: {addr:?} does not belong to any chunk"),
        }
    }

    /// Destroy all fully free chunks but one.
    ///
    /// Returns the number of chunks destroyed.
    pub fn reclaim(&self) -> usize {
        let _serialized = self.alloc_lock.lock();

        let wanted = self.index.lock().reclaimable();
        if wanted == 0 {
            return 0;
        }
        let mut todo = Vec::new();
        if todo.try_reserve_exact(wanted).is_err() {
            return 0;
        }
        self.index.lock().take_reclaimable(&mut todo);

        let count = todo.len();
        for (id, chunk) in todo {
            if let Some(bits) = &chunk.populated {
                let mut from = 0;
                while let Some(start) = bits[from..].first_one().map(|n| from + n) {
                    let end = bits[start..].first_zero().map_or(bits.len(), |n| start + n);
                    self.backend.depopulate(id, chunk.base, &self.layout, start..end);
                    from = end;
                }
            }
            self.backend.destroy_chunk(chunk.base, &self.layout);
        }
        debug!("percpu: reclaimed {count} chunks");
        count
    }

    /// Move the first chunk's area maps out of boot memory and allow map
    /// extension and chunk creation from now on. Call once the heap works.
    ///
    /// # Errors
    /// [`PercpuError::OutOfMemory`] if the heap cannot hold the maps.
    pub fn init_late(&self) -> Result<(), PercpuError> {
        let _serialized = self.alloc_lock.lock();

        for id in [ChunkId::FIRST, ChunkId::RESERVED] {
            let capacity = match self.index.lock().get(id) {
                Some(chunk) if chunk.map.is_early() => chunk.map.capacity(),
                _ => continue,
            };
            let storage = heap_storage(capacity).ok_or(PercpuError::OutOfMemory)?;
            let early = self.index.lock().chunk_mut(id).map.move_to(storage);
            drop(early);
        }

        self.heap_online.store(true, Ordering::Release);
        info!("PERCPU: area maps moved to the heap");
        Ok(())
    }

    /// Address of `cpu`'s copy of `ptr`.
    ///
    /// # Panics
    /// If `cpu` is not a possible CPU.
    #[must_use]
    pub fn per_cpu_ptr(&self, ptr: PercpuPtr, cpu: usize) -> VirtualAddress {
        ptr.addr().byte_add(self.layout.unit_offset(cpu))
    }

    /// Per-CPU pointer of the static variable at `offset` in the static
    /// image.
    ///
    /// # Panics
    /// If `offset` lies outside the static image.
    #[must_use]
    pub fn static_ptr(&self, offset: usize) -> PercpuPtr {
        assert!(
            offset < self.layout.static_size(),
            "percpu: static offset {offset:#x} out of range"
        );
        PercpuPtr::new(self.base.byte_add(offset))
    }

    /// Value to add to the link-time address of a static per-CPU variable,
    /// whose image starts at `static_start`, to reach `cpu`'s copy.
    ///
    /// # Panics
    /// If `cpu` is not a possible CPU.
    #[must_use]
    pub fn per_cpu_offset(&self, cpu: usize, static_start: VirtualAddress) -> u64 {
        self.base
            .as_u64()
            .wrapping_sub(static_start.as_u64())
            .wrapping_add(self.layout.unit_offset(cpu) as u64)
    }

    /// Whether `addr` lies in some CPU's copy of the static image.
    #[must_use]
    pub fn is_static_address(&self, addr: VirtualAddress) -> bool {
        self.layout.unit_offsets().any(|(_, unit)| {
            let start = self.base.byte_add(unit);
            addr >= start && addr < start.byte_add(self.layout.static_size())
        })
    }

    /// Whether `addr` lies in some CPU's copy of the reserved area.
    #[must_use]
    pub fn is_reserved_address(&self, addr: VirtualAddress) -> bool {
        let limit = self.layout.reserved_limit();
        limit != 0
            && self.layout.unit_offsets().any(|(_, unit)| {
                let start = self.base.byte_add(unit);
                addr >= start.byte_add(self.layout.static_size()) && addr < start.byte_add(limit)
            })
    }

    /// Physical address of the per-CPU byte at `addr`, which is some CPU's
    /// copy as returned by [`per_cpu_ptr`](Self::per_cpu_ptr).
    ///
    /// The first chunk lives in boot memory and translates through
    /// `mapper`; later chunks ask the backend. `None` if nothing backs
    /// `addr`.
    #[must_use]
    pub fn per_cpu_ptr_to_phys(
        &self,
        addr: VirtualAddress,
        mapper: &impl PhysMapper,
    ) -> Option<PhysicalAddress> {
        let unit_size = self.layout.unit_size();
        let first_start = self.base.byte_add(self.layout.unit_offset(self.layout.low_unit_cpu()));
        let first_end = self
            .base
            .byte_add(self.layout.unit_offset(self.layout.high_unit_cpu()) + unit_size);

        let in_first_chunk = addr >= first_start
            && addr < first_end
            && self.layout.unit_offsets().any(|(_, unit)| {
                let start = self.base.byte_add(unit);
                addr >= start && addr < start.byte_add(unit_size)
            });

        if in_first_chunk {
            NonNull::new(addr.as_mut_ptr::<u8>()).map(|ptr| mapper.virt_to_phys(ptr))
        } else {
            self.backend.virt_to_phys(addr)
        }
    }

    #[must_use]
    pub fn stats(&self) -> PercpuStats {
        let index = self.index.lock();
        let mut stats = PercpuStats {
            empty_chunks: index.slot_iter(index.nr_slots() - 1).count(),
            ..PercpuStats::default()
        };
        for (_, chunk) in index.chunks() {
            stats.chunks += 1;
            stats.free_bytes += chunk.map.free_size();
            stats.populated_pages += chunk.populated.as_ref().map_or(0, |bits| bits.count_ones());
        }
        stats
    }
}

/// Runs of set bits in `mask`, lowest first.
fn runs(mask: u64) -> impl Iterator<Item = Range<usize>> {
    let mut rest = mask;
    core::iter::from_fn(move || {
        if rest == 0 {
            return None;
        }
        let start = rest.trailing_zeros() as usize;
        let len = (rest >> start).trailing_ones() as usize;
        let run = start..start + len;
        rest &= !run_mask(&run);
        Some(run)
    })
}

fn run_mask(run: &Range<usize>) -> u64 {
    let len = run.end - run.start;
    let bits = if len >= u64::BITS as usize {
        u64::MAX
    } else {
        (1u64 << len) - 1
    };
    bits << run.start
}
