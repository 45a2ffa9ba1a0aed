//! What the allocator needs from the rest of the kernel.

use crate::{ChunkId, ChunkLayout, PercpuPtr};
use core::ops::Range;
use kernel_bootmem::NodeId;
use kernel_info::memory::LOCAL_DISTANCE;
use kernel_memory_addresses::{PhysicalAddress, VirtualAddress};

/// Backing store failure while populating a chunk.
#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum PopulateError {
    #[error("out of pages")]
    OutOfMemory,
    #[error("failed to map pages")]
    MapFailed,
}

/// Virtual memory and page backing for chunks created after boot.
///
/// # Safety
/// Implementors must hand out address ranges that stay valid and exclusive
/// to the allocator until destroyed, and must back populated pages with
/// readable and writable memory.
pub unsafe trait PercpuBackend {
    /// Reserve an address range of [`ChunkLayout::span`] bytes for a new
    /// chunk, page aligned. Nothing needs to be mapped yet.
    fn create_chunk(&self, layout: &ChunkLayout<'_>) -> Option<VirtualAddress>;

    /// Give back a chunk's range. All its pages have been depopulated.
    fn destroy_chunk(&self, base: VirtualAddress, layout: &ChunkLayout<'_>);

    /// Back unit pages `pages` with memory in every CPU's unit of chunk
    /// `id`, and remember that those pages belong to `id`.
    ///
    /// On failure nothing of `pages` stays mapped.
    ///
    /// # Errors
    /// When pages cannot be allocated or mapped.
    fn populate(
        &self,
        id: ChunkId,
        base: VirtualAddress,
        layout: &ChunkLayout<'_>,
        pages: Range<usize>,
    ) -> Result<(), PopulateError>;

    /// Undo [`populate`](Self::populate) for unit pages `pages`.
    fn depopulate(
        &self,
        id: ChunkId,
        base: VirtualAddress,
        layout: &ChunkLayout<'_>,
        pages: Range<usize>,
    );

    /// Chunk owning the populated page containing `addr`.
    ///
    /// Called with the allocator's index lock held.
    fn chunk_of(&self, addr: VirtualAddress) -> Option<ChunkId>;

    /// Physical address backing `addr` in a populated page of a chunk
    /// created after boot.
    fn virt_to_phys(&self, addr: VirtualAddress) -> Option<PhysicalAddress> {
        let _ = addr;
        None
    }

    /// A second fully free chunk appeared; arrange for
    /// [`Percpu::reclaim`](crate::Percpu::reclaim) to run soon.
    ///
    /// Called without any allocator lock held.
    fn schedule_reclaim(&self) {}

    /// Observe a successful allocation.
    fn leak_alloc(&self, ptr: PercpuPtr, size: usize) {
        let _ = (ptr, size);
    }

    /// Observe a free.
    fn leak_free(&self, ptr: PercpuPtr) {
        let _ = ptr;
    }
}

/// Possible CPUs and how far apart they are.
///
/// CPUs are numbered densely from zero.
pub trait CpuTopology {
    fn nr_possible_cpus(&self) -> usize;

    /// Distance between two CPUs; CPUs further apart than
    /// [`LOCAL_DISTANCE`] in either direction go into different groups.
    fn distance(&self, from: usize, to: usize) -> u32 {
        let _ = (from, to);
        LOCAL_DISTANCE
    }

    /// Memory node closest to `cpu`, if known.
    fn node_of(&self, cpu: usize) -> Option<NodeId> {
        let _ = cpu;
        None
    }
}

/// `n` CPUs, all local to each other, without node information.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct UniformTopology(pub usize);

impl CpuTopology for UniformTopology {
    fn nr_possible_cpus(&self) -> usize {
        self.0
    }
}
