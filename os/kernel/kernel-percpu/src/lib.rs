//! # Per-CPU Memory Allocator
//!
//! Hands out memory that exists once per possible CPU: one allocation
//! returns a single [`PercpuPtr`], and each CPU reaches its own copy by
//! adding that CPU's unit offset ([`Percpu::per_cpu_ptr`]).
//!
//! ## Architecture
//!
//! ```text
//!            chunk base
//!            │
//!            ▼
//!  group 0 ┌────────┬────────┐   group 1 ┌────────┬────────┐
//!          │ unit 0 │ unit 1 │           │ unit 2 │ unit 3 │
//!          │ cpu 0  │ cpu 1  │   . . .   │ cpu 2  │ (none) │
//!          └────────┴────────┘           └────────┴────────┘
//!          ◄─unit──►
//! ```
//!
//! Memory comes in *chunks*. A chunk holds one *unit* per CPU; units are
//! laid out in *groups* of CPUs that are close to each other. Every unit
//! of a chunk has the same layout, so an allocation is an offset into the
//! unit, tracked by the chunk's area map.
//!
//! The *first chunk* is carved out of boot memory by
//! [`embed_first_chunk`]. Its units start with the static per-CPU image,
//! optionally followed by a *reserved* area served by a chunk of its own
//! ([`Percpu::alloc_reserved`]), followed by the *dynamic* area. Further
//! chunks are created on demand through a [`PercpuBackend`] and have their
//! pages populated as allocations touch them.
//!
//! Chunks are kept in *slots* by free space, so an allocation scans only
//! chunks that might fit it. Fully free chunks beyond one are destroyed by
//! [`Percpu::reclaim`].
//!
//! ## Lifecycle
//!
//! 1. [`setup_per_cpu_areas`] (or [`embed_first_chunk`] with custom sizes)
//!    while the boot allocator is still active.
//! 2. [`Percpu::init_late`] once the heap works; until then the allocator
//!    serves only what fits in the first chunk.
//! 3. [`Percpu::alloc`] / [`Percpu::free`] from any CPU.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

extern crate alloc;

mod area_map;
mod backend;
mod chunk;
mod first_chunk;
mod layout;
mod pool;

pub use backend::{CpuTopology, PercpuBackend, PopulateError, UniformTopology};
pub use chunk::ChunkId;
pub use first_chunk::{
    AllocInfo, GroupInfo, build_alloc_info, dump_alloc_info, embed_first_chunk,
    setup_first_chunk, setup_per_cpu_areas,
};
pub use layout::{ChunkLayout, CpuUnit, GroupSpan};
pub use pool::{Percpu, PercpuStats};

use core::fmt;
use kernel_bootmem::BootmemError;
use kernel_memory_addresses::VirtualAddress;

#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum PercpuError {
    #[error("illegal size ({size}) or align ({align}) for percpu allocation")]
    InvalidRequest { size: usize, align: usize },
    #[error("alloc from reserved chunk failed")]
    ReservedExhausted,
    #[error("failed to extend area map")]
    MapExtendFailed,
    #[error("failed to allocate new chunk")]
    ChunkCreateFailed,
    #[error("failed to populate")]
    PopulateFailed,
    #[error("out of memory")]
    OutOfMemory,
    #[error(transparent)]
    BootMemory(#[from] BootmemError),
}

/// Handle of a per-CPU allocation.
///
/// Not dereferenceable by itself; see [`Percpu::per_cpu_ptr`].
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct PercpuPtr(VirtualAddress);

impl PercpuPtr {
    pub(crate) const fn new(addr: VirtualAddress) -> Self {
        Self(addr)
    }

    /// Address of the allocation in the chunk's base unit.
    #[must_use]
    pub const fn addr(self) -> VirtualAddress {
        self.0
    }
}

impl fmt::Debug for PercpuPtr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PCPU({:#x})", self.0.as_u64())
    }
}
