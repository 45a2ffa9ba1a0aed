#![allow(dead_code)]

use kernel_bootmem::{
    Bootmem, BootmemConfig, BootmemHooks, HhdmPhysMapper, NodeId, PhysMapper, ReserveMode,
    bootmap_pages,
};
use kernel_memory_addresses::{PAGE_SIZE, PhysicalAddress, Pfn};
use std::alloc::{Layout, alloc_zeroed, dealloc};
use std::ptr::NonNull;

/// Page-aligned heap memory posing as physical frames `[first, first + frames)`.
pub struct Arena {
    base: NonNull<u8>,
    layout: Layout,
    first: Pfn,
    mapper: HhdmPhysMapper,
}

impl Arena {
    pub fn new(first: Pfn, frames: u64) -> Self {
        let layout = Layout::from_size_align((frames * PAGE_SIZE) as usize, PAGE_SIZE as usize).unwrap();
        let base = NonNull::new(unsafe { alloc_zeroed(layout) }).expect("arena allocation failed");
        let offset = (base.as_ptr() as u64).wrapping_sub(first.phys().as_u64());
        Self {
            base,
            layout,
            first,
            mapper: unsafe { HhdmPhysMapper::new(offset) },
        }
    }

    pub const fn mapper(&self) -> &HhdmPhysMapper {
        &self.mapper
    }

    /// Overwrite the whole arena with `byte`.
    pub fn fill(&mut self, byte: u8) {
        unsafe { self.base.as_ptr().write_bytes(byte, self.layout.size()) };
    }

    pub fn phys_of(&self, ptr: NonNull<u8>) -> PhysicalAddress {
        self.mapper.virt_to_phys(ptr)
    }

    pub fn pfn_of(&self, ptr: NonNull<u8>) -> Pfn {
        self.phys_of(ptr).pfn_down()
    }

    pub fn contains(&self, ptr: NonNull<u8>) -> bool {
        let pfn = self.pfn_of(ptr);
        pfn >= self.first && pfn - self.first < (self.layout.size() as u64 / PAGE_SIZE)
    }
}

impl Drop for Arena {
    fn drop(&mut self) {
        unsafe { dealloc(self.base.as_ptr(), self.layout) };
    }
}

pub fn bootmem(arena: &Arena) -> Bootmem<'_, HhdmPhysMapper> {
    Bootmem::new(arena.mapper(), BootmemConfig { debug: true })
}

/// Register `[start, end)` with its bitmap at `map`, free all of it and
/// reserve the bitmap again, the way architecture setup does.
pub fn add_node<H: BootmemHooks>(
    bootmem: &mut Bootmem<'_, HhdmPhysMapper, H>,
    nid: NodeId,
    map: Pfn,
    start: Pfn,
    end: Pfn,
) {
    unsafe { bootmem.init_node(nid, map, start, end) };
    bootmem.free_node(nid, start.phys(), (end - start) * PAGE_SIZE);
    bootmem
        .reserve_node(
            nid,
            map.phys(),
            bootmap_pages(end - start) * PAGE_SIZE,
            ReserveMode::Exclusive,
        )
        .unwrap();
}

pub fn frames(n: u64) -> u64 {
    n * PAGE_SIZE
}
