//! # Early Boot Physical Memory Allocator
//!
//! A bitmap-based page allocator for the phase of boot in which nothing else
//! can allocate: no heap, no page allocator, no per-CPU areas. It tracks
//! every page frame of one or more memory nodes, hands out zero-filled,
//! aligned, physically contiguous regions, and finally releases all frames
//! it never handed out to the general page allocator.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │                  Bootmem (context)                  │
//! │    • goal / limit / node directed allocation        │
//! │    • panicking and fallible entry points            │
//! │    • cross-node reserve / free, release-all         │
//! └─────────────────┬───────────────────────────────────┘
//!                   │
//! ┌─────────────────▼───────────────────────────────────┐
//! │            Node list (ascending min_pfn)            │
//! └─────────────────┬───────────────────────────────────┘
//!                   │
//! ┌─────────────────▼───────────────────────────────────┐
//! │          BootmemNode (one bitmap per node)          │
//! │    • reserve (exclusive / shared), free             │
//! │    • aligned first-fit search with hint             │
//! └─────────────────────────────────────────────────────┘
//! ```
//!
//! Memory is touched only through a [`PhysMapper`]; the node bitmaps live in
//! frames of the nodes they describe.
//!
//! ## Lifecycle
//!
//! 1. **Register** each node with [`Bootmem::init_node`]. Its frames start out
//!    reserved.
//! 2. **Free** the usable RAM with [`Bootmem::free`], then **reserve** what
//!    is already in use (kernel image, the bitmaps themselves) with
//!    [`Bootmem::reserve`].
//! 3. **Allocate** with [`Bootmem::alloc`] and friends during early setup.
//! 4. **Release** everything that is still free with
//!    [`Bootmem::release_all`], which consumes the allocator.
//!
//! ## Concurrency
//!
//! None. The allocator runs before secondary CPUs exist; every mutating
//! operation takes `&mut self`.
//!
//! ## Example
//!
//! ```rust
//! use kernel_bootmem::{Bootmem, BootmemConfig, HhdmPhysMapper, ReserveMode, bootmap_pages};
//! use kernel_memory_addresses::{PAGE_SIZE, Pfn};
//!
//! // Eight frames of "physical memory" at physical address 0.
//! #[repr(align(4096))]
//! struct Ram([u8; 8 * 4096]);
//! let mut ram = Box::new(Ram([0; 8 * 4096]));
//! let base = ram.0.as_mut_ptr() as u64;
//!
//! let mapper = unsafe { HhdmPhysMapper::new(base) };
//! let mut bootmem = Bootmem::new(&mapper, BootmemConfig::default());
//!
//! // Frame 0 holds the bitmap.
//! unsafe { bootmem.init_node(0, Pfn::new(0), Pfn::new(0), Pfn::new(8)) };
//! bootmem.free(Pfn::new(0).phys(), 8 * PAGE_SIZE);
//! bootmem.reserve(Pfn::new(0).phys(), bootmap_pages(8) * PAGE_SIZE, ReserveMode::Exclusive)?;
//!
//! let table = bootmem.alloc(512, 64, None)?;
//! assert_eq!(unsafe { *table.as_ptr() }, 0);
//!
//! let mut released = 0;
//! let count = bootmem.release_all(&mut |_pfn: Pfn, order: u32| released += 1u64 << order);
//! assert_eq!(count, released);
//! # Ok::<(), kernel_bootmem::BootmemError>(())
//! ```

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

/// Trace line, emitted only when `bootmem_debug` was given on the command line.
macro_rules! bdebug {
    ($enabled:expr, $($arg:tt)+) => {
        if $enabled {
            ::log::info!(target: "bootmem", $($arg)+);
        }
    };
}

mod boot_slice;
mod bootmem;
mod node;
pub mod phys_mapper;
mod registry;

pub use boot_slice::BootSlice;
pub use bootmem::{Bootmem, BootmemConfig, free_late};
pub use node::BootmemNode;
pub use phys_mapper::{HhdmPhysMapper, PhysMapper};

use kernel_memory_addresses::{PAGE_SIZE, PhysicalAddress, Pfn, align_up, page_align};

/// Index of a memory node.
pub type NodeId = usize;

#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum BootmemError {
    #[error("frame {pfn} is already reserved")]
    Busy { pfn: Pfn },
    #[error("out of boot memory allocating {size} bytes")]
    OutOfMemory { size: u64 },
}

/// How [`Bootmem::reserve`] treats frames that are already reserved.
#[derive(Debug, Copy, Clone, Default, Eq, PartialEq)]
pub enum ReserveMode {
    /// Overlap with an existing reservation is fine.
    #[default]
    Default,
    /// Overlap is an error; nothing stays reserved on failure.
    Exclusive,
}

/// One allocation request. A `goal` or `limit` of zero means "none".
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct AllocRequest {
    pub size: u64,
    pub align: u64,
    /// Preferred lowest physical address.
    pub goal: u64,
    /// Exclusive physical upper bound.
    pub limit: u64,
}

impl AllocRequest {
    /// Alignment with `0` meaning byte alignment.
    #[must_use]
    pub const fn effective_align(&self) -> u64 {
        if self.align == 0 { 1 } else { self.align }
    }

    pub(crate) fn validate(&self) {
        assert!(self.size != 0, "bootmem: zero-sized allocation");
        assert!(
            self.align == 0 || self.align.is_power_of_two(),
            "bootmem: alignment {:#x} is not a power of two",
            self.align
        );
        assert!(
            self.limit == 0 || self.goal + self.size <= self.limit,
            "bootmem: goal {:#x} + size {:#x} exceeds limit {:#x}",
            self.goal,
            self.size,
            self.limit
        );
    }
}

/// Receiver of the frames released when boot memory is retired; usually
/// the general page allocator.
pub trait PageSink {
    /// Take ownership of `1 << order` frames starting at `pfn`.
    fn release_pages(&mut self, pfn: Pfn, order: u32);
}

impl<F> PageSink for F
where
    F: FnMut(Pfn, u32),
{
    fn release_pages(&mut self, pfn: Pfn, order: u32) {
        self(pfn, order);
    }
}

/// Architecture and debugging hooks.
pub trait BootmemHooks {
    /// Node to try before the regular search; `requested` is the node the
    /// caller asked for, if any.
    fn preferred_node(&self, requested: Option<NodeId>, req: &AllocRequest) -> Option<NodeId> {
        let _ = (requested, req);
        None
    }

    /// Observe a successful allocation.
    fn leak_alloc(&self, pa: PhysicalAddress, size: u64) {
        let _ = (pa, size);
    }

    /// Observe a free.
    fn leak_free(&self, pa: PhysicalAddress, size: u64) {
        let _ = (pa, size);
    }
}

/// No preferred node, no leak tracking.
#[derive(Debug, Copy, Clone, Default)]
pub struct NoHooks;

impl BootmemHooks for NoHooks {}

/// Bytes of bitmap needed for `pages` frames, rounded to whole words.
#[must_use]
pub const fn bootmap_bytes(pages: u64) -> u64 {
    align_up(pages.div_ceil(8), size_of::<usize>() as u64)
}

/// Pages of bitmap needed for `pages` frames.
#[must_use]
pub const fn bootmap_pages(pages: u64) -> u64 {
    page_align(bootmap_bytes(pages)) / PAGE_SIZE
}
