#![allow(dead_code)]

use kernel_bootmem::{
    Bootmem, BootmemConfig, BootmemHooks, HhdmPhysMapper, NodeId, PhysMapper, ReserveMode,
    bootmap_pages,
};
use kernel_info::params::FirstChunkKind;
use kernel_memory_addresses::{PAGE_BYTES, PAGE_SIZE, PhysicalAddress, Pfn, VirtualAddress};
use kernel_percpu::{
    ChunkId, ChunkLayout, CpuTopology, Percpu, PercpuBackend, PercpuPtr, PopulateError,
    UniformTopology, setup_per_cpu_areas,
};
use std::alloc::{Layout, alloc_zeroed, dealloc};
use std::cell::Cell;
use std::collections::HashMap;
use std::ops::Range;
use std::ptr::NonNull;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicIsize, AtomicUsize, Ordering};

/// Page-aligned heap memory posing as physical frames `[first, first + frames)`.
pub struct Arena {
    base: NonNull<u8>,
    layout: Layout,
    mapper: HhdmPhysMapper,
}

impl Arena {
    pub fn new(first: Pfn, frames: u64) -> Self {
        let layout = Layout::from_size_align((frames * PAGE_SIZE) as usize, PAGE_BYTES).unwrap();
        let base = NonNull::new(unsafe { alloc_zeroed(layout) }).expect("arena allocation failed");
        let offset = (base.as_ptr() as u64).wrapping_sub(first.phys().as_u64());
        Self {
            base,
            layout,
            mapper: unsafe { HhdmPhysMapper::new(offset) },
        }
    }

    pub const fn mapper(&self) -> &HhdmPhysMapper {
        &self.mapper
    }

    pub fn pfn_of(&self, addr: VirtualAddress) -> Pfn {
        let ptr = NonNull::new(addr.as_mut_ptr::<u8>()).unwrap();
        self.mapper.virt_to_phys(ptr).pfn_down()
    }
}

impl Drop for Arena {
    fn drop(&mut self) {
        unsafe { dealloc(self.base.as_ptr(), self.layout) };
    }
}

/// A boot allocator over `arena` with one node per `(start, end)` range,
/// each node's bitmap in its first frame.
pub fn bootmem<'m>(arena: &'m Arena, nodes: &[(u64, u64)]) -> Bootmem<'m, HhdmPhysMapper> {
    let mut bootmem = Bootmem::new(arena.mapper(), BootmemConfig::default());
    for (nid, &(start, end)) in nodes.iter().enumerate() {
        add_node(&mut bootmem, nid, Pfn::new(start), Pfn::new(end));
    }
    bootmem
}

/// [`bootmem`] reporting its traffic to `ledger`.
pub fn bootmem_with_ledger<'m>(
    arena: &'m Arena,
    nodes: &[(u64, u64)],
    ledger: &'m Ledger,
) -> Bootmem<'m, HhdmPhysMapper, &'m Ledger> {
    let mut bootmem = Bootmem::with_hooks(arena.mapper(), BootmemConfig::default(), ledger);
    for (nid, &(start, end)) in nodes.iter().enumerate() {
        add_node(&mut bootmem, nid, Pfn::new(start), Pfn::new(end));
    }
    bootmem
}

/// Bytes allocated from boot memory minus bytes freed, registering the
/// nodes included.
#[derive(Default)]
pub struct Ledger(Cell<i64>);

impl Ledger {
    pub fn balance(&self) -> i64 {
        self.0.get()
    }
}

impl BootmemHooks for &Ledger {
    fn leak_alloc(&self, _pa: PhysicalAddress, size: u64) {
        self.0.set(self.0.get() + i64::try_from(size).unwrap());
    }

    fn leak_free(&self, _pa: PhysicalAddress, size: u64) {
        self.0.set(self.0.get() - i64::try_from(size).unwrap());
    }
}

fn add_node<H: BootmemHooks>(
    bootmem: &mut Bootmem<'_, HhdmPhysMapper, H>,
    nid: NodeId,
    start: Pfn,
    end: Pfn,
) {
    unsafe { bootmem.init_node(nid, start, start, end) };
    bootmem.free_node(nid, start.phys(), (end - start) * PAGE_SIZE);
    bootmem
        .reserve_node(
            nid,
            start.phys(),
            bootmap_pages(end - start) * PAGE_SIZE,
            ReserveMode::Exclusive,
        )
        .unwrap();
}

/// A static image whose bytes are easy to recognize.
pub fn static_image(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8 + 1).collect()
}

/// Per-CPU areas for `cpus` CPUs with a 4 KiB static image, the default
/// 8 KiB reserved and 20 KiB dynamic areas, all in one 32 KiB unit.
pub fn percpu<'m>(
    bootmem: &mut Bootmem<'m, HhdmPhysMapper>,
    cpus: usize,
) -> Percpu<'m, HeapBackend> {
    setup_per_cpu_areas(
        bootmem,
        &static_image(4096),
        &UniformTopology(cpus),
        HeapBackend::default(),
        FirstChunkKind::Auto,
    )
}

/// CPUs `0..cpus`, split into nodes of `per_node` CPUs each, remote nodes
/// at distance 20.
pub struct NumaTopology {
    pub cpus: usize,
    pub per_node: usize,
}

impl CpuTopology for NumaTopology {
    fn nr_possible_cpus(&self) -> usize {
        self.cpus
    }

    fn distance(&self, from: usize, to: usize) -> u32 {
        if from / self.per_node == to / self.per_node { 10 } else { 20 }
    }

    fn node_of(&self, cpu: usize) -> Option<NodeId> {
        Some(cpu / self.per_node)
    }
}

/// Explicit CPU to node assignment.
pub struct NodeMap(pub Vec<usize>);

impl CpuTopology for NodeMap {
    fn nr_possible_cpus(&self) -> usize {
        self.0.len()
    }

    fn distance(&self, from: usize, to: usize) -> u32 {
        if self.0[from] == self.0[to] { 10 } else { 20 }
    }
}

#[derive(Default)]
struct State {
    chunks: HashMap<u64, Layout>,
    pages: HashMap<u64, ChunkId>,
    frames: HashMap<u64, u64>,
    next_frame: u64,
    created: usize,
    destroyed: usize,
    populated: Vec<(ChunkId, Range<usize>)>,
    depopulated: Vec<(ChunkId, Range<usize>)>,
}

/// First frame handed to populated pages, far above any arena.
pub const HEAP_FIRST_FRAME: u64 = 0x10_0000;

/// Chunks backed by the test process heap, poisoned with `0xAA` so missed
/// clearing shows.
#[derive(Default)]
pub struct HeapBackend {
    state: Mutex<State>,
    pub fail_populate: AtomicBool,
    pub fail_create: AtomicBool,
    pub reclaims_scheduled: AtomicUsize,
    pub live: AtomicIsize,
}

impl HeapBackend {
    pub fn created(&self) -> usize {
        self.state.lock().unwrap().created
    }

    pub fn destroyed(&self) -> usize {
        self.state.lock().unwrap().destroyed
    }

    pub fn populated(&self) -> Vec<(ChunkId, Range<usize>)> {
        self.state.lock().unwrap().populated.clone()
    }

    pub fn depopulated(&self) -> Vec<(ChunkId, Range<usize>)> {
        self.state.lock().unwrap().depopulated.clone()
    }

    fn pages(base: VirtualAddress, layout: &ChunkLayout<'_>, pages: Range<usize>) -> Vec<u64> {
        layout
            .unit_offsets()
            .flat_map(|(_, unit)| {
                pages
                    .clone()
                    .map(move |page| base.byte_add(unit + page * PAGE_BYTES).as_u64())
            })
            .collect()
    }
}

unsafe impl PercpuBackend for HeapBackend {
    fn create_chunk(&self, layout: &ChunkLayout<'_>) -> Option<VirtualAddress> {
        if self.fail_create.load(Ordering::Relaxed) {
            return None;
        }
        let alloc_layout = Layout::from_size_align(layout.span(), PAGE_BYTES).ok()?;
        let ptr = NonNull::new(unsafe { alloc_zeroed(alloc_layout) })?;
        unsafe { ptr.as_ptr().write_bytes(0xAA, layout.span()) };

        let base = VirtualAddress::from_nonnull(ptr);
        let mut state = self.state.lock().unwrap();
        state.chunks.insert(base.as_u64(), alloc_layout);
        state.created += 1;
        Some(base)
    }

    fn destroy_chunk(&self, base: VirtualAddress, _layout: &ChunkLayout<'_>) {
        let mut state = self.state.lock().unwrap();
        let alloc_layout = state.chunks.remove(&base.as_u64()).expect("unknown chunk");
        state.destroyed += 1;
        unsafe { dealloc(base.as_mut_ptr(), alloc_layout) };
    }

    fn populate(
        &self,
        id: ChunkId,
        base: VirtualAddress,
        layout: &ChunkLayout<'_>,
        pages: Range<usize>,
    ) -> Result<(), PopulateError> {
        if self.fail_populate.load(Ordering::Relaxed) {
            return Err(PopulateError::OutOfMemory);
        }
        let mut state = self.state.lock().unwrap();
        for page in Self::pages(base, layout, pages.clone()) {
            assert!(state.pages.insert(page, id).is_none(), "page populated twice");
            let frame = HEAP_FIRST_FRAME + state.next_frame;
            state.next_frame += 1;
            state.frames.insert(page, frame);
        }
        state.populated.push((id, pages));
        Ok(())
    }

    fn depopulate(
        &self,
        id: ChunkId,
        base: VirtualAddress,
        layout: &ChunkLayout<'_>,
        pages: Range<usize>,
    ) {
        let mut state = self.state.lock().unwrap();
        for page in Self::pages(base, layout, pages.clone()) {
            assert_eq!(state.pages.remove(&page), Some(id));
            state.frames.remove(&page);
        }
        state.depopulated.push((id, pages));
    }

    fn chunk_of(&self, addr: VirtualAddress) -> Option<ChunkId> {
        let page = addr.as_u64() & !(PAGE_SIZE - 1);
        self.state.lock().unwrap().pages.get(&page).copied()
    }

    fn virt_to_phys(&self, addr: VirtualAddress) -> Option<PhysicalAddress> {
        let page = addr.as_u64() & !(PAGE_SIZE - 1);
        let frame = *self.state.lock().unwrap().frames.get(&page)?;
        Some(Pfn::new(frame).phys() + (addr.as_u64() - page))
    }

    fn schedule_reclaim(&self) {
        self.reclaims_scheduled.fetch_add(1, Ordering::Relaxed);
    }

    fn leak_alloc(&self, _ptr: PercpuPtr, _size: usize) {
        self.live.fetch_add(1, Ordering::Relaxed);
    }

    fn leak_free(&self, _ptr: PercpuPtr) {
        self.live.fetch_sub(1, Ordering::Relaxed);
    }
}

impl Drop for HeapBackend {
    fn drop(&mut self) {
        let state = self.state.get_mut().unwrap();
        for (base, layout) in state.chunks.drain() {
            unsafe { dealloc(VirtualAddress::new(base).as_mut_ptr(), layout) };
        }
    }
}

/// Bytes of `cpu`'s copy of `ptr`.
pub fn read<B: PercpuBackend>(percpu: &Percpu<'_, B>, ptr: PercpuPtr, cpu: usize, len: usize) -> Vec<u8> {
    let addr = percpu.per_cpu_ptr(ptr, cpu);
    unsafe { std::slice::from_raw_parts(addr.as_ptr::<u8>(), len) }.to_vec()
}

/// Fill `cpu`'s copy of `ptr`.
pub fn fill<B: PercpuBackend>(percpu: &Percpu<'_, B>, ptr: PercpuPtr, cpu: usize, len: usize, byte: u8) {
    let addr = percpu.per_cpu_ptr(ptr, cpu);
    unsafe { addr.as_mut_ptr::<u8>().write_bytes(byte, len) };
}
